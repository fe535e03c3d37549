//! Event Bridge wire model: events emitted by a game document to its host
//! and messages pushed from the host back into the document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SCHEMA_VERSION_V1;

pub const BRIDGE_SOURCE: &str = "GameEventBridge";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeEventKind {
    Transition,
    Interaction,
    Update,
    Error,
}

impl BridgeEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transition => "TRANSITION",
            Self::Interaction => "INTERACTION",
            Self::Update => "UPDATE",
            Self::Error => "ERROR",
        }
    }

    /// Overflow drop order: lowest rank is dropped first. `ERROR` is never
    /// dropped.
    pub fn drop_rank(self) -> u8 {
        match self {
            Self::Update => 0,
            Self::Interaction => 1,
            Self::Transition => 2,
            Self::Error => u8::MAX,
        }
    }
}

/// Discriminates the two faces of `UPDATE`: a state display mutated by the
/// game itself versus authoritative state pushed by the host.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateScope {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub room_id: String,
    pub player_id: String,
    pub session_id: String,
    pub timestamp: u64,
    pub sequence_number: u64,
    pub priority: EventPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<UpdateScope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEvent {
    #[serde(rename = "type")]
    pub kind: BridgeEventKind,
    #[serde(default)]
    pub data: Value,
    pub metadata: EventMetadata,
}

/// Batch envelope posted from the bridge to the enclosing host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEnvelope {
    pub source: String,
    pub room_id: String,
    pub player_id: String,
    pub events: Vec<BridgeEvent>,
}

impl BridgeEnvelope {
    pub fn new(
        room_id: impl Into<String>,
        player_id: impl Into<String>,
        events: Vec<BridgeEvent>,
    ) -> Self {
        Self {
            source: BRIDGE_SOURCE.to_string(),
            room_id: room_id.into(),
            player_id: player_id.into(),
            events,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostMessageKind {
    StateUpdate,
    PlayerAction,
    GameEvent,
    ConfigUpdate,
}

/// Message posted by the host into the game document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostEnvelope {
    pub target: String,
    pub room_id: String,
    #[serde(rename = "type")]
    pub kind: HostMessageKind,
    #[serde(default)]
    pub data: Value,
    pub schema_version: String,
}

impl HostEnvelope {
    pub fn new(room_id: impl Into<String>, kind: HostMessageKind, data: Value) -> Self {
        Self {
            target: BRIDGE_SOURCE.to_string(),
            room_id: room_id.into(),
            kind,
            data,
            schema_version: SCHEMA_VERSION_V1.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bridge_envelope_wire_shape_matches_contract() {
        let event = BridgeEvent {
            kind: BridgeEventKind::Interaction,
            data: json!({"marker": "cell-4"}),
            metadata: EventMetadata {
                room_id: "room_1".to_string(),
                player_id: "p1".to_string(),
                session_id: "sess_1".to_string(),
                timestamp: 42,
                sequence_number: 7,
                priority: EventPriority::Normal,
                scope: None,
            },
        };
        let envelope = BridgeEnvelope::new("room_1", "p1", vec![event]);
        let value = serde_json::to_value(&envelope).expect("serialize envelope");

        assert_eq!(
            value.get("source").and_then(Value::as_str),
            Some("GameEventBridge")
        );
        assert_eq!(value.get("roomId").and_then(Value::as_str), Some("room_1"));
        let first = &value["events"][0];
        assert_eq!(
            first.get("type").and_then(Value::as_str),
            Some("INTERACTION")
        );
        assert_eq!(
            first["metadata"].get("sequenceNumber").and_then(Value::as_u64),
            Some(7)
        );
    }

    #[test]
    fn drop_rank_orders_update_before_interaction_before_transition() {
        assert!(BridgeEventKind::Update.drop_rank() < BridgeEventKind::Interaction.drop_rank());
        assert!(BridgeEventKind::Interaction.drop_rank() < BridgeEventKind::Transition.drop_rank());
        assert_eq!(BridgeEventKind::Error.drop_rank(), u8::MAX);
    }

    #[test]
    fn host_envelope_round_trip() {
        let envelope = HostEnvelope::new(
            "room_9",
            HostMessageKind::StateUpdate,
            json!({"version": 3}),
        );
        let encoded = serde_json::to_string(&envelope).expect("serialize");
        let decoded: HostEnvelope = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(envelope, decoded);
        assert!(encoded.contains("\"STATE_UPDATE\""));
    }
}
