use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::{
    Action, ApiError, ConversionReport, ErrorCode, PlayerRoster, RoomRecord, StreamMessage,
    SubmitRequest, SCHEMA_VERSION_V1,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::RoomService;

/// Source documents arrive through the convert route and may dwarf action
/// payloads.
const MAX_CONVERT_BODY_BYTES: usize = 1024 * 1024;

const PLAYER_HEADER: &str = "x-player-id";

include!("error.rs");
include!("state.rs");
include!("routes/rooms.rs");
include!("routes/actions.rs");
include!("routes/stream.rs");
include!("util.rs");

const SWEEP_INTERVAL_SECS: u64 = 60;

pub async fn serve(addr: SocketAddr, service: Arc<RoomService>) -> Result<(), ServerError> {
    let sweeper = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                service.sweep_ended().await;
            }
        })
    };

    let state = AppState { service };
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app).await;
    sweeper.abort();
    served?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/rooms", post(create_room).get(list_rooms))
        .route("/api/v1/rooms/{room_id}", get(get_room))
        .route("/api/v1/rooms/{room_id}/convert", post(request_conversion))
        .route(
            "/api/v1/rooms/{room_id}/conversion",
            get(get_conversion_status),
        )
        .route("/api/v1/rooms/{room_id}/actions", post(submit_action))
        .route("/api/v1/rooms/{room_id}/snapshot", get(get_snapshot))
        .route("/api/v1/rooms/{room_id}/stream", get(stream_room))
        .route("/api/v1/artifacts/{reference}", get(get_artifact))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}
