/// Room subscription stream. The first frame is always a snapshot; after
/// that, broadcasts arrive in version order. A subscriber that lags behind
/// the room buffer is dropped and must resubscribe for a fresh snapshot.
async fn stream_room(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, HttpApiError> {
    let (snapshot, receiver) = state
        .service
        .subscribe(&room_id)
        .await
        .map_err(HttpApiError::from_api_error)?;

    Ok(ws.on_upgrade(move |socket| stream_socket(socket, snapshot, receiver)))
}

async fn stream_socket(
    mut socket: WebSocket,
    snapshot: StreamMessage,
    mut receiver: broadcast::Receiver<StreamMessage>,
) {
    let snapshot_version = snapshot.version;
    if send_stream_message(&mut socket, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = receiver.recv() => {
                match outgoing {
                    Ok(message) => {
                        // The snapshot already covers anything at or below
                        // its version.
                        if message.version <= snapshot_version {
                            continue;
                        }
                        if send_stream_message(&mut socket, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Slow subscriber: drop rather than stall the room.
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }
}

async fn send_stream_message(
    socket: &mut WebSocket,
    message: &StreamMessage,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}
