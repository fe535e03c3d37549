//! Session runtime: owns room mutation. Actions enter one at a time per
//! room (FIFO lock), pass through the validator sandbox, and on acceptance
//! commit with a strictly increasing version and fan out to subscribers.

use std::sync::Arc;
use std::time::Duration;

use contracts::config::SessionLimits;
use contracts::validator::{ValidatorInput, ValidatorProgram};
use contracts::{
    Action, ActionKind, ApiError, Broadcast, BroadcastKind, ErrorCode, PlayerRoster, RoomPhase,
    RoomRecord, StreamMessage, SubmitResponse,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::hub::RoomHub;
use crate::registry::{fresh_cache, CacheSlot, RoomRegistry};
use crate::sandbox::{SandboxError, ValidatorSandbox};
use crate::store::RoomStore;
use crate::time::Clock;

pub struct SessionRuntime {
    store: Arc<dyn RoomStore>,
    sandbox: Arc<ValidatorSandbox>,
    registry: RoomRegistry,
    hub: RoomHub,
    limits: SessionLimits,
    clock: Arc<dyn Clock>,
}

impl SessionRuntime {
    pub fn new(
        store: Arc<dyn RoomStore>,
        sandbox: Arc<ValidatorSandbox>,
        limits: SessionLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let hub = RoomHub::new(limits.subscriber_buffer);
        Self {
            store,
            sandbox,
            registry: RoomRegistry::new(),
            hub,
            limits,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Persists a new room, immediately playable with the generic rules for
    /// its kind. Creation is idempotent: an existing room is returned
    /// unchanged.
    pub async fn create_room(
        &self,
        room_id: &str,
        kind: &str,
        initial_state: Value,
        players: Option<PlayerRoster>,
        metadata: Option<Value>,
    ) -> Result<RoomRecord, ApiError> {
        if let Some(existing) = self.load_room(room_id).await? {
            return Ok(existing);
        }

        let now = self.clock.now_ms();
        let mut room = RoomRecord::new(room_id, kind, now);
        room.conversion_status = contracts::ConversionStatus::Complete;
        room.state = if initial_state.is_null() {
            session_core::rules::initial_state(&ValidatorProgram::generic_for_kind(kind))
        } else {
            initial_state
        };
        if let Some(players) = players {
            room.players = players;
        }
        if let Some(metadata) = metadata {
            room.metadata = metadata;
        }
        // Creation is initialization, not a transition; the supplied state
        // dictates the starting phase.
        room.phase = session_core::room::phase_from_state(&room.state);

        self.store
            .put_room(&room)
            .await
            .map_err(|err| store_error(&err.to_string()))?;
        Ok(room)
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, ApiError> {
        self.load_room(room_id).await
    }

    pub async fn list_rooms(&self, kind_filter: Option<&str>) -> Result<Vec<RoomRecord>, ApiError> {
        self.store
            .list_rooms(kind_filter)
            .await
            .map_err(|err| store_error(&err.to_string()))
    }

    /// Validates, orders, commits, and broadcasts one action. Every failure
    /// mode is encoded in the response envelope.
    pub async fn submit(
        &self,
        room_id: &str,
        mut action: Action,
        asserted_player: &str,
    ) -> SubmitResponse {
        let now = self.clock.now_ms();
        // The transport-asserted identity always wins over the payload.
        action.player_id = asserted_player.to_string();

        // Idempotent replay of a journaled outcome.
        if let Some(client_seq) = action.client_seq {
            match self
                .store
                .find_action(room_id, &action.player_id, client_seq)
                .await
            {
                Ok(Some(prior)) => return prior,
                Ok(None) => {}
                Err(err) => {
                    return self.rejected(ErrorCode::StoreFailure, err.to_string(), now);
                }
            }
        }

        let deadline = Instant::now() + Duration::from_millis(self.limits.submit_deadline_ms);
        let handle = self.registry.handle(room_id).await;

        // Deadline expiry before acquisition has no side effects.
        let Ok(mut slot) = tokio::time::timeout_at(deadline, handle.slot.lock()).await else {
            return self.rejected(
                ErrorCode::TimeoutRetry,
                "submit deadline expired before the room lock was acquired",
                self.clock.now_ms(),
            );
        };

        // Cache-or-store load under the lock.
        let record = match fresh_cache(&slot, self.clock.now_ms(), self.limits.cache_freshness_ms) {
            Some(record) => record,
            None => match self.store.get_room(room_id).await {
                Ok(Some(record)) => {
                    slot.cache = Some(CacheSlot {
                        record: record.clone(),
                        loaded_at_ms: self.clock.now_ms(),
                    });
                    record
                }
                Ok(None) => {
                    return self.rejected(
                        ErrorCode::RoomNotFound,
                        format!("room {room_id} does not exist"),
                        now,
                    );
                }
                Err(err) => {
                    return self.rejected(ErrorCode::StoreFailure, err.to_string(), now);
                }
            },
        };

        if !record.is_playable() {
            return self.rejected(
                ErrorCode::RoomNotReady,
                format!("conversion status is {}", record.conversion_status),
                now,
            );
        }
        if record.phase == RoomPhase::Ended {
            let response = self.rejected(
                ErrorCode::RoomTerminated,
                "room has ended; only snapshot and subscribe are available",
                now,
            );
            self.journal(room_id, &action, &response).await;
            return response;
        }

        // Generic preconditions for standard kinds; custom kinds skip them.
        if let Some(error) = generic_preconditions(&record, &action) {
            let response = SubmitResponse::rejected(error, now);
            self.journal(room_id, &action, &response).await;
            return response;
        }

        let input = ValidatorInput {
            action: action.clone(),
            state: record.state.clone(),
            players: record.players.clone(),
            player_id: action.player_id.clone(),
            data: action.data.clone(),
            room_id: room_id.to_string(),
            timestamp: now,
        };

        let verdict = match self.invoke_with_fallback(&record, &action, input).await {
            Ok(verdict) => verdict,
            Err(response) => {
                self.journal(room_id, &action, &response).await;
                return response;
            }
        };

        if !verdict.valid {
            let reason = verdict.reason.unwrap_or(ErrorCode::IllegalMove);
            let message = verdict
                .message
                .unwrap_or_else(|| "action rejected by validator".to_string());
            let response = self.rejected(reason, message, now);
            self.journal(room_id, &action, &response).await;
            return response;
        }

        // Deadline expiry after validation: discard the verdict, commit
        // nothing.
        if Instant::now() >= deadline {
            return self.rejected(
                ErrorCode::TimeoutRetry,
                "submit deadline expired before commit",
                self.clock.now_ms(),
            );
        }

        let old_version = record.version;
        let mut updated = record;
        if let Some(state) = verdict.updated_state {
            updated.state = state;
        }
        if let Some(players) = verdict.updated_players {
            updated.players = players;
        }
        updated.version = (old_version + 1).max(self.clock.version_floor());
        // A verdict claiming an illegal phase change is validator
        // misbehavior, not client error; nothing commits.
        if let Err(err) = session_core::room::sync_phase_from_state(&mut updated) {
            warn!(room_id, error = %err, "validator verdict claimed an illegal phase change");
            let response = self.rejected(
                ErrorCode::ValidatorUnavailable,
                format!("validator produced an illegal phase change: {err}"),
                now,
            );
            self.journal(room_id, &action, &response).await;
            return response;
        }
        updated.updated_at = self.clock.now_ms();

        if let Err(err) = self.store.commit_room(&updated, old_version).await {
            slot.cache = None;
            return self.rejected(ErrorCode::StoreFailure, err.to_string(), now);
        }
        // Writes invalidate the cache entry.
        slot.cache = None;

        let broadcast = Broadcast {
            kind: verdict
                .broadcast
                .unwrap_or_else(|| default_broadcast_kind(&action.kind)),
            changes: verdict.changes.unwrap_or_else(|| json!({})),
            version: updated.version,
            state: updated.state.clone(),
            players: updated.players.clone(),
        };
        let response = SubmitResponse::accepted(
            updated.state.clone(),
            updated.players.clone(),
            updated.version,
            broadcast.clone(),
            now,
        );

        self.journal(room_id, &action, &response).await;
        // Published under the room lock so subscribers see commit order.
        self.hub
            .publish(room_id, StreamMessage::broadcast(&broadcast))
            .await;
        debug!(room_id, version = updated.version, kind = %action.kind, "action committed");

        response
    }

    /// Current state and version.
    pub async fn snapshot(&self, room_id: &str) -> Result<StreamMessage, ApiError> {
        let handle = self.registry.handle(room_id).await;
        let mut slot = handle.slot.lock().await;
        let record = match fresh_cache(&slot, self.clock.now_ms(), self.limits.cache_freshness_ms) {
            Some(record) => record,
            None => {
                let loaded = self
                    .store
                    .get_room(room_id)
                    .await
                    .map_err(|err| store_error(&err.to_string()))?;
                let Some(record) = loaded else {
                    return Err(ApiError::new(
                        ErrorCode::RoomNotFound,
                        format!("room {room_id} does not exist"),
                        None,
                    ));
                };
                slot.cache = Some(CacheSlot {
                    record: record.clone(),
                    loaded_at_ms: self.clock.now_ms(),
                });
                record
            }
        };
        Ok(StreamMessage::snapshot(
            record.state.clone(),
            record.players.clone(),
            record.version,
        ))
    }

    /// Subscribes to a room. The returned snapshot MUST be delivered first;
    /// the receiver then yields broadcasts in version order. The receiver is
    /// registered before the snapshot is read, so no commit can fall in the
    /// gap; consumers drop messages at or below the snapshot version.
    pub async fn subscribe(
        &self,
        room_id: &str,
    ) -> Result<(StreamMessage, broadcast::Receiver<StreamMessage>), ApiError> {
        let receiver = self.hub.subscribe(room_id).await;
        let snapshot = self.snapshot(room_id).await?;
        Ok((snapshot, receiver))
    }

    /// Garbage-collects ended rooms past the grace period.
    pub async fn sweep_ended(&self) -> usize {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(self.limits.ended_grace_ms);
        match self.store.delete_ended_before(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    self.hub.cleanup().await;
                }
                deleted
            }
            Err(err) => {
                warn!(error = %err, "ended-room sweep failed");
                0
            }
        }
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    async fn load_room(&self, room_id: &str) -> Result<Option<RoomRecord>, ApiError> {
        self.store
            .get_room(room_id)
            .await
            .map_err(|err| store_error(&err.to_string()))
    }

    /// Resolves and invokes the room's validator. Infrastructure failures
    /// fall back to the generic handlers for standard kinds; custom kinds
    /// fail explicitly.
    async fn invoke_with_fallback(
        &self,
        record: &RoomRecord,
        action: &Action,
        input: ValidatorInput,
    ) -> Result<contracts::validator::ValidatorVerdict, SubmitResponse> {
        let generic = || Arc::new(ValidatorProgram::generic_for_kind(&record.kind));

        let (program, deployed) = match &record.validator_ref {
            None => (generic(), false),
            Some(reference) => {
                match self.sandbox.resolve(reference, self.store.as_ref()).await {
                    Ok(program) => (program, true),
                    Err(err) => {
                        if action.kind.is_standard() {
                            warn!(room_id = %record.room_id, error = %err, "validator unavailable; using generic fallback");
                            (generic(), false)
                        } else {
                            return Err(self.sandbox_failure(&err));
                        }
                    }
                }
            }
        };

        match self.sandbox.invoke(program, input.clone()).await {
            Ok(verdict) => Ok(verdict),
            Err(err) => {
                if deployed && action.kind.is_standard() {
                    warn!(room_id = %record.room_id, error = %err, "validator failed; retrying with generic fallback");
                    self.sandbox
                        .invoke(generic(), input)
                        .await
                        .map_err(|fallback_err| self.sandbox_failure(&fallback_err))
                } else {
                    Err(self.sandbox_failure(&err))
                }
            }
        }
    }

    fn sandbox_failure(&self, err: &SandboxError) -> SubmitResponse {
        let (code, message) = match err {
            SandboxError::Timeout => (ErrorCode::ValidatorTimeout, err.to_string()),
            SandboxError::Limit(_) => (ErrorCode::ValidatorLimit, err.to_string()),
            SandboxError::Unavailable(_) => (ErrorCode::ValidatorUnavailable, err.to_string()),
            SandboxError::Store(_) => (ErrorCode::StoreFailure, err.to_string()),
        };
        self.rejected(code, message, self.clock.now_ms())
    }

    fn rejected(&self, code: ErrorCode, message: impl Into<String>, now: u64) -> SubmitResponse {
        SubmitResponse::rejected(ApiError::new(code, message, None), now)
    }

    /// Journals the completed submit; used both for audit and clientSeq
    /// idempotency. Journal failures never fail the submit.
    async fn journal(&self, room_id: &str, action: &Action, response: &SubmitResponse) {
        let action_json =
            serde_json::to_string(action).unwrap_or_else(|_| "{}".to_string());
        if let Err(err) = self
            .store
            .record_action(
                room_id,
                &action.player_id,
                action.client_seq,
                &action_json,
                response,
            )
            .await
        {
            warn!(room_id, error = %err, "action journal write failed");
        }
    }
}

fn store_error(details: &str) -> ApiError {
    ApiError::new(
        ErrorCode::StoreFailure,
        "store operation failed",
        Some(details.to_string()),
    )
}

fn default_broadcast_kind(kind: &ActionKind) -> BroadcastKind {
    match kind {
        ActionKind::Join => BroadcastKind::PlayerJoined,
        ActionKind::Start => BroadcastKind::GameStarted,
        ActionKind::Move => BroadcastKind::MoveMade,
        ActionKind::Update => BroadcastKind::StateUpdate,
        ActionKind::End => BroadcastKind::GameEnded,
        ActionKind::Custom(_) => BroadcastKind::CustomAction,
    }
}

/// Standard-kind gate checks: player presence for MOVE/UPDATE/END, absence
/// for JOIN, phase gates for START/MOVE/END. Custom kinds skip these.
fn generic_preconditions(record: &RoomRecord, action: &Action) -> Option<ApiError> {
    match &action.kind {
        ActionKind::Join => {
            if record.players.contains(&action.player_id) {
                return Some(ApiError::new(
                    ErrorCode::DuplicatePlayer,
                    format!("{} already joined", action.player_id),
                    None,
                ));
            }
        }
        ActionKind::Start => {
            if record.phase != RoomPhase::Lobby {
                return Some(ApiError::new(
                    ErrorCode::GameAlreadyActive,
                    "game already started",
                    None,
                ));
            }
        }
        ActionKind::Move | ActionKind::End => {
            if record.phase != RoomPhase::Active {
                return Some(ApiError::new(
                    ErrorCode::GameNotActive,
                    "game is not active",
                    None,
                ));
            }
            if !record.players.contains(&action.player_id) {
                return Some(ApiError::new(
                    ErrorCode::IllegalMove,
                    format!("{} is not in this room", action.player_id),
                    None,
                ));
            }
        }
        ActionKind::Update => {
            if !record.players.contains(&action.player_id) {
                return Some(ApiError::new(
                    ErrorCode::IllegalMove,
                    format!("{} is not in this room", action.player_id),
                    None,
                ));
            }
        }
        ActionKind::Custom(_) => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteRoomStore;
    use crate::time::ManualClock;

    fn runtime() -> SessionRuntime {
        let limits = SessionLimits::default();
        let store: Arc<dyn RoomStore> =
            Arc::new(SqliteRoomStore::open_in_memory().expect("store"));
        let sandbox = Arc::new(ValidatorSandbox::new(limits.clone()));
        SessionRuntime::new(store, sandbox, limits, Arc::new(ManualClock::new(1_000)))
    }

    fn join(player: &str) -> Action {
        Action::new(ActionKind::Join, player, json!({}))
    }

    #[tokio::test]
    async fn submit_to_unknown_room_fails_room_not_found() {
        let runtime = runtime();
        let response = runtime.submit("missing", join("p1"), "p1").await;
        assert!(!response.success);
        assert_eq!(
            response.error.expect("error").error_code,
            ErrorCode::RoomNotFound
        );
    }

    #[tokio::test]
    async fn submit_to_pending_room_fails_room_not_ready() {
        let runtime = runtime();
        let mut room = RoomRecord::new("room_p", "counter-turn-based", 0);
        room.conversion_status = contracts::ConversionStatus::Pending;
        runtime.store.put_room(&room).await.expect("put");

        let response = runtime.submit("room_p", join("p1"), "p1").await;
        assert_eq!(
            response.error.expect("error").error_code,
            ErrorCode::RoomNotReady
        );
    }

    #[tokio::test]
    async fn accepted_actions_bump_version_and_persist() {
        let runtime = runtime();
        runtime
            .create_room("room_v", "counter-turn-based", Value::Null, None, None)
            .await
            .expect("create");

        let first = runtime.submit("room_v", join("p1"), "p1").await;
        assert!(first.success);
        assert_eq!(first.state_version, Some(1));

        let second = runtime.submit("room_v", join("p2"), "p2").await;
        assert_eq!(second.state_version, Some(2));

        let stored = runtime
            .store
            .get_room("room_v")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.version, 2);
        assert_eq!(stored.players.len(), 2);
    }

    #[tokio::test]
    async fn rejected_actions_mutate_nothing_and_broadcast_nothing() {
        let runtime = runtime();
        runtime
            .create_room("room_r", "counter-turn-based", Value::Null, None, None)
            .await
            .expect("create");
        runtime.submit("room_r", join("p1"), "p1").await;
        let mut rx = runtime.hub.subscribe("room_r").await;

        // Duplicate join: rejected by the generic preconditions.
        let response = runtime.submit("room_r", join("p1"), "p1").await;
        assert!(!response.success);
        assert_eq!(
            response.error.expect("error").error_code,
            ErrorCode::DuplicatePlayer
        );

        let stored = runtime
            .store
            .get_room("room_r")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.version, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn asserted_identity_overrides_payload_player() {
        let runtime = runtime();
        runtime
            .create_room("room_i", "counter-turn-based", Value::Null, None, None)
            .await
            .expect("create");

        let spoofed = Action::new(ActionKind::Join, "victim", json!({}));
        let response = runtime.submit("room_i", spoofed, "actual").await;
        assert!(response.success);
        let players = response.players.expect("players");
        assert!(players.contains("actual"));
        assert!(!players.contains("victim"));
    }

    #[tokio::test]
    async fn client_seq_replays_return_the_journaled_outcome() {
        let runtime = runtime();
        runtime
            .create_room("room_seq", "counter-turn-based", Value::Null, None, None)
            .await
            .expect("create");

        let mut action = join("p1");
        action.client_seq = Some(42);
        let first = runtime.submit("room_seq", action.clone(), "p1").await;
        assert!(first.success);

        // The replay returns the same outcome instead of DUPLICATE_PLAYER.
        let replay = runtime.submit("room_seq", action, "p1").await;
        assert_eq!(first, replay);

        let stored = runtime
            .store
            .get_room("room_seq")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn ended_rooms_accept_only_snapshot_and_subscribe() {
        let runtime = runtime();
        runtime
            .create_room(
                "room_e",
                "counter-turn-based",
                json!({"phase": "ended", "winner": "p1"}),
                None,
                None,
            )
            .await
            .expect("create");

        let response = runtime.submit("room_e", join("p9"), "p9").await;
        assert_eq!(
            response.error.expect("error").error_code,
            ErrorCode::RoomTerminated
        );

        let snapshot = runtime.snapshot("room_e").await.expect("snapshot");
        assert!(snapshot.is_snapshot());
        assert_eq!(snapshot.state["winner"], json!("p1"));
    }

    #[tokio::test]
    async fn subscribe_delivers_snapshot_then_ordered_broadcasts() {
        let runtime = runtime();
        runtime
            .create_room("room_sub", "counter-turn-based", Value::Null, None, None)
            .await
            .expect("create");

        let (snapshot, mut rx) = runtime.subscribe("room_sub").await.expect("subscribe");
        assert!(snapshot.is_snapshot());
        assert_eq!(snapshot.version, 0);

        runtime.submit("room_sub", join("p1"), "p1").await;
        runtime.submit("room_sub", join("p2"), "p2").await;

        let first = rx.recv().await.expect("first broadcast");
        let second = rx.recv().await.expect("second broadcast");
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(first.kind, "PLAYER_JOINED");
    }

    #[tokio::test]
    async fn custom_actions_skip_generic_preconditions_but_need_a_declaring_validator() {
        let runtime = runtime();
        runtime
            .create_room("room_c", "counter-turn-based", Value::Null, None, None)
            .await
            .expect("create");

        // The generic program declares no custom kinds.
        let custom = Action::new(ActionKind::Custom("EMOTE".to_string()), "p1", json!({}));
        let response = runtime.submit("room_c", custom, "p1").await;
        assert!(!response.success);
        assert_eq!(
            response.error.expect("error").error_code,
            ErrorCode::InvalidKind
        );
    }

    #[tokio::test]
    async fn verdicts_claiming_a_phase_regression_do_not_commit() {
        let runtime = runtime();
        // A record whose canonical phase is already active while its state
        // document still claims lobby: any accepted verdict would carry the
        // regressed phase forward, which the guards must refuse.
        let mut room = RoomRecord::new("room_ph", "counter-turn-based", 0);
        room.conversion_status = contracts::ConversionStatus::Complete;
        room.phase = RoomPhase::Active;
        room.state = json!({"phase": "lobby", "counter": 0, "target": 10});
        room.players
            .insert(contracts::PlayerRecord::new("p1", 0));
        runtime.store.put_room(&room).await.expect("put");

        let update = Action::new(ActionKind::Update, "p1", json!({"theme": "dark"}));
        let response = runtime.submit("room_ph", update, "p1").await;
        assert!(!response.success);
        assert_eq!(
            response.error.expect("error").error_code,
            ErrorCode::ValidatorUnavailable
        );

        let stored = runtime
            .store
            .get_room("room_ph")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.version, 0);
        assert_eq!(stored.state["theme"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn ended_room_sweep_deletes_past_grace() {
        let limits = SessionLimits::default();
        let clock = Arc::new(ManualClock::new(1_000));
        let store: Arc<dyn RoomStore> =
            Arc::new(SqliteRoomStore::open_in_memory().expect("store"));
        let sandbox = Arc::new(ValidatorSandbox::new(limits.clone()));
        let runtime = SessionRuntime::new(store, sandbox, limits.clone(), clock.clone());

        runtime
            .create_room(
                "room_gc",
                "counter-turn-based",
                json!({"phase": "ended"}),
                None,
                None,
            )
            .await
            .expect("create");

        assert_eq!(runtime.sweep_ended().await, 0);
        clock.advance(limits.ended_grace_ms + 2_000);
        assert_eq!(runtime.sweep_ended().await, 1);
        assert!(runtime.get_room("room_gc").await.expect("get").is_none());
    }
}
