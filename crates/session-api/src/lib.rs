//! Service layer: room registry, session runtime, validator sandbox,
//! conversion pipeline, SQLite persistence, and the HTTP/WebSocket server.

mod convert;
mod host;
mod hub;
mod registry;
mod runtime;
mod sandbox;
mod server;
mod store;
mod time;

use std::path::Path;
use std::sync::Arc;

use contracts::config::SessionLimits;
use contracts::{
    Action, ApiError, ConversionReport, ConversionStatus, PlayerRoster, RoomRecord, StreamMessage,
    SubmitResponse, SCHEMA_VERSION_V1,
};
use serde_json::Value;
use tokio::sync::broadcast;

pub use convert::{
    ConversionDeps, ConversionPipeline, DocumentModel, ModelError, ScriptedDocumentModel,
    SOURCE_REF_KEY,
};
pub use host::{EnvelopeQueue, ReferenceHost};
pub use hub::RoomHub;
pub use runtime::SessionRuntime;
pub use sandbox::{SandboxError, ValidatorSandbox};
pub use server::{serve, ServerError};
pub use store::{ArtifactKind, RoomStore, SqliteRoomStore, StoreError};
pub use time::{Clock, ManualClock, SystemClock, WallClockVersions};

/// Facade over the runtime and the conversion pipeline; one per process.
pub struct RoomService {
    runtime: Arc<SessionRuntime>,
    pipeline: ConversionPipeline,
}

impl RoomService {
    pub fn new(
        store: Arc<dyn RoomStore>,
        model: Arc<dyn DocumentModel>,
        limits: SessionLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sandbox = Arc::new(ValidatorSandbox::new(limits.clone()));
        let runtime = Arc::new(SessionRuntime::new(
            Arc::clone(&store),
            Arc::clone(&sandbox),
            limits.clone(),
            Arc::clone(&clock),
        ));
        let pipeline = ConversionPipeline::spawn(ConversionDeps {
            store,
            sandbox,
            model,
            limits,
            clock,
        });
        Self { runtime, pipeline }
    }

    /// Opens (or creates) the SQLite-backed service.
    pub fn open_sqlite(
        path: impl AsRef<Path>,
        model: Arc<dyn DocumentModel>,
        limits: SessionLimits,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn RoomStore> = Arc::new(SqliteRoomStore::open(path)?);
        Ok(Self::new(store, model, limits, Arc::new(SystemClock)))
    }

    pub fn runtime(&self) -> &Arc<SessionRuntime> {
        &self.runtime
    }

    pub async fn create_room(
        &self,
        room_id: &str,
        kind: &str,
        initial_state: Value,
        players: Option<PlayerRoster>,
        metadata: Option<Value>,
    ) -> Result<RoomRecord, ApiError> {
        self.runtime
            .create_room(room_id, kind, initial_state, players, metadata)
            .await
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, ApiError> {
        self.runtime.get_room(room_id).await
    }

    pub async fn list_rooms(&self, kind_filter: Option<&str>) -> Result<Vec<RoomRecord>, ApiError> {
        self.runtime.list_rooms(kind_filter).await
    }

    /// Records a pending room and queues conversion. Idempotent in the room
    /// identifier: an existing room is returned as-is (a failed one is
    /// re-queued).
    pub async fn request_conversion(
        &self,
        room_id: &str,
        source_document: &str,
    ) -> Result<RoomRecord, ApiError> {
        if let Some(existing) = self.runtime.get_room(room_id).await? {
            if existing.conversion_status == ConversionStatus::Failed {
                self.pipeline.enqueue(room_id);
            }
            return Ok(existing);
        }

        let store = self.runtime.store();
        let source_ref = store
            .publish_artifact(ArtifactKind::SourceDocument, room_id, source_document)
            .await
            .map_err(|err| {
                ApiError::new(
                    contracts::ErrorCode::ArtifactPublishFailed,
                    "could not store source document",
                    Some(err.to_string()),
                )
            })?;

        let now = self.runtime.clock().now_ms();
        let mut room = RoomRecord::new(room_id, "custom-game", now);
        room.metadata = serde_json::json!({ SOURCE_REF_KEY: source_ref });
        store.put_room(&room).await.map_err(|err| {
            ApiError::new(
                contracts::ErrorCode::StoreFailure,
                "could not record pending room",
                Some(err.to_string()),
            )
        })?;

        self.pipeline.enqueue(room_id);
        Ok(room)
    }

    /// Latest conversion state with any structured failure reason.
    pub async fn conversion_status(
        &self,
        room_id: &str,
    ) -> Result<Option<ConversionReport>, ApiError> {
        let Some(room) = self.runtime.get_room(room_id).await? else {
            return Ok(None);
        };
        let error = room
            .metadata
            .get(convert::CONVERSION_ERROR_KEY)
            .cloned()
            .and_then(|value| serde_json::from_value::<ApiError>(value).ok());
        Ok(Some(ConversionReport {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            room_id: room.room_id,
            status: room.conversion_status,
            error,
            document_ref: room.document_ref,
            validator_ref: room.validator_ref,
            updated_at: room.updated_at,
        }))
    }

    pub async fn submit(
        &self,
        room_id: &str,
        action: Action,
        asserted_player: &str,
    ) -> SubmitResponse {
        self.runtime.submit(room_id, action, asserted_player).await
    }

    pub async fn snapshot(&self, room_id: &str) -> Result<StreamMessage, ApiError> {
        self.runtime.snapshot(room_id).await
    }

    pub async fn subscribe(
        &self,
        room_id: &str,
    ) -> Result<(StreamMessage, broadcast::Receiver<StreamMessage>), ApiError> {
        self.runtime.subscribe(room_id).await
    }

    pub async fn sweep_ended(&self) -> usize {
        self.runtime.sweep_ended().await
    }

    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
        self.runtime.shutdown().await;
    }
}
