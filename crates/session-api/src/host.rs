//! Reference embedding host: the server-side counterpart of the
//! client bridge. It owns one `GameEventBridge` per (room, player),
//! forwards interaction intents from bridge envelopes into the session
//! runtime, and routes committed state back into the document as
//! version-gated `STATE_UPDATE` messages.
//!
//! The host is deliberately small; production shells embed the same bridge
//! against their own `HostSink`. Holding a host across tasks is not
//! supported: bridge subscribers are plain closures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bridge::sync::{VersionDecision, VersionGate};
use bridge::{GameEventBridge, HostSendError, HostSink};
use contracts::config::RoomConfig;
use contracts::events::{BridgeEnvelope, BridgeEventKind, HostEnvelope, HostMessageKind};
use contracts::{Action, StreamMessage, SubmitResponse};
use serde_json::{json, Value};

use crate::RoomService;

/// Sink that parks posted envelopes until the host drains them.
#[derive(Clone, Default)]
pub struct EnvelopeQueue {
    inner: Arc<Mutex<VecDeque<BridgeEnvelope>>>,
}

impl EnvelopeQueue {
    pub fn drain(&self) -> Vec<BridgeEnvelope> {
        self.inner
            .lock()
            .map(|mut queue| queue.drain(..).collect())
            .unwrap_or_default()
    }
}

impl HostSink for EnvelopeQueue {
    fn post(&mut self, envelope: &BridgeEnvelope) -> Result<(), HostSendError> {
        match self.inner.lock() {
            Ok(mut queue) => {
                queue.push_back(envelope.clone());
                Ok(())
            }
            Err(_) => Err(HostSendError {
                message: "host envelope queue poisoned".to_string(),
            }),
        }
    }
}

pub struct ReferenceHost {
    service: Arc<RoomService>,
    room_id: String,
    bridge: GameEventBridge<EnvelopeQueue>,
    outbox: EnvelopeQueue,
    gate: VersionGate,
}

impl ReferenceHost {
    /// Attaches a document-side bridge for one player to a room.
    pub fn attach(service: Arc<RoomService>, room_id: &str, player_id: &str) -> Self {
        let mut config = RoomConfig::new(room_id, format!("sess-{room_id}-{player_id}"));
        config.player_id = Some(player_id.to_string());
        let outbox = EnvelopeQueue::default();
        let bridge = GameEventBridge::new(config, outbox.clone());
        Self {
            service,
            room_id: room_id.to_string(),
            bridge,
            outbox,
            gate: VersionGate::new(),
        }
    }

    pub fn bridge_mut(&mut self) -> &mut GameEventBridge<EnvelopeQueue> {
        &mut self.bridge
    }

    pub fn version_gate(&self) -> &VersionGate {
        &self.gate
    }

    /// Flushes the bridge and forwards every `INTERACTION` event carrying an
    /// action intent to the runtime. Events without an intent are
    /// observational and stop here. Accepted outcomes flow straight back
    /// into the document through the version gate.
    pub async fn pump(&mut self, now_ms: u64) -> Vec<SubmitResponse> {
        self.bridge.flush(now_ms);
        let mut responses = Vec::new();
        for envelope in self.outbox.drain() {
            for event in envelope.events {
                if event.kind != BridgeEventKind::Interaction {
                    continue;
                }
                let Some(intent) = event.data.get("action").cloned() else {
                    continue;
                };
                let Some(action) = parse_intent(intent, &envelope.player_id) else {
                    continue;
                };
                let response = self
                    .service
                    .submit(&self.room_id, action, &envelope.player_id)
                    .await;
                if let Some(broadcast) = &response.broadcast {
                    self.deliver(&StreamMessage::broadcast(broadcast)).await;
                }
                responses.push(response);
            }
        }
        responses
    }

    /// Routes one subscription message into the document. Stale versions
    /// are dropped; a gap triggers a snapshot resync before anything is
    /// delivered.
    pub async fn deliver(&mut self, message: &StreamMessage) {
        match self.gate.observe(message.version) {
            VersionDecision::Stale => {}
            VersionDecision::Apply => self.push_state_update(message),
            VersionDecision::Gap { .. } => {
                if let Ok(snapshot) = self.service.snapshot(&self.room_id).await {
                    self.gate.resync(snapshot.version);
                    self.push_state_update(&snapshot);
                }
            }
        }
    }

    fn push_state_update(&mut self, message: &StreamMessage) {
        let envelope = HostEnvelope::new(
            self.room_id.clone(),
            HostMessageKind::StateUpdate,
            json!({
                "state": message.state,
                "players": message.players,
                "version": message.version,
            }),
        );
        self.bridge.receive_host_message(&envelope);
    }
}

/// Intent payloads from documents omit the player identity; the envelope's
/// identity fills it in. The runtime overrides it with the asserted caller
/// either way.
fn parse_intent(mut intent: Value, player_id: &str) -> Option<Action> {
    if let Some(map) = intent.as_object_mut() {
        map.entry("playerId".to_string())
            .or_insert_with(|| json!(player_id));
    }
    serde_json::from_value::<Action>(intent).ok()
}
