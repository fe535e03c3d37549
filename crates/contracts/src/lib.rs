//! v1 cross-boundary contracts for rooms, actions, broadcasts, the event
//! bridge, conversion, and validator modules.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod analysis;
pub mod config;
pub mod events;
pub mod validator;

pub const SCHEMA_VERSION_V1: &str = "1.0";

/// Attribute placed on interactive elements by the instrumenter.
pub const ACTION_MARKER: &str = "data-action-marker";
/// Attribute placed on state display elements.
pub const STATE_MARKER: &str = "data-state-marker";
/// Attribute placed on gesture surfaces.
pub const TOUCH_MARKER: &str = "data-touch-marker";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    Lobby,
    Active,
    Ended,
}

impl fmt::Display for RoomPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Lobby => "lobby",
            Self::Active => "active",
            Self::Ended => "ended",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl ConversionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    pub player_id: String,
    pub joined_at: u64,
    #[serde(default)]
    pub profile: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lives: Option<i64>,
    pub active: bool,
    pub eliminated: bool,
}

impl PlayerRecord {
    pub fn new(player_id: impl Into<String>, joined_at: u64) -> Self {
        Self {
            player_id: player_id.into(),
            joined_at,
            profile: Value::Null,
            score: None,
            lives: None,
            active: true,
            eliminated: false,
        }
    }
}

/// Ordered player roster. Iteration order is insertion order, which defines
/// turn rotation for turn-based kinds. Serialized as a JSON array.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerRoster(Vec<PlayerRecord>);

impl PlayerRoster {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, player_id: &str) -> bool {
        self.0.iter().any(|player| player.player_id == player_id)
    }

    pub fn get(&self, player_id: &str) -> Option<&PlayerRecord> {
        self.0.iter().find(|player| player.player_id == player_id)
    }

    pub fn get_mut(&mut self, player_id: &str) -> Option<&mut PlayerRecord> {
        self.0
            .iter_mut()
            .find(|player| player.player_id == player_id)
    }

    /// Appends a player. Returns false when the identifier is already present.
    pub fn insert(&mut self, record: PlayerRecord) -> bool {
        if self.contains(&record.player_id) {
            return false;
        }
        self.0.push(record);
        true
    }

    pub fn remove(&mut self, player_id: &str) -> Option<PlayerRecord> {
        let index = self
            .0
            .iter()
            .position(|player| player.player_id == player_id)?;
        Some(self.0.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerRecord> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlayerRecord> {
        self.0.iter_mut()
    }

    pub fn player_ids(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|player| player.player_id.clone())
            .collect()
    }

    /// Players still in rotation, in insertion order.
    pub fn standing(&self) -> Vec<&PlayerRecord> {
        self.0
            .iter()
            .filter(|player| player.active && !player.eliminated)
            .collect()
    }

    /// Next standing player after `player_id` in insertion order, wrapping.
    /// Returns `player_id` itself when it is the only one standing.
    pub fn next_standing_after(&self, player_id: &str) -> Option<String> {
        let standing = self.standing();
        if standing.is_empty() {
            return None;
        }
        let position = standing
            .iter()
            .position(|player| player.player_id == player_id);
        match position {
            Some(index) => {
                let next = &standing[(index + 1) % standing.len()];
                Some(next.player_id.clone())
            }
            None => Some(standing[0].player_id.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub schema_version: String,
    pub room_id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_ref: Option<String>,
    pub state: Value,
    pub players: PlayerRoster,
    #[serde(default)]
    pub metadata: Value,
    pub version: u64,
    pub phase: RoomPhase,
    pub conversion_status: ConversionStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomRecord {
    pub fn new(room_id: impl Into<String>, kind: impl Into<String>, created_at: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            room_id: room_id.into(),
            kind: kind.into(),
            document_ref: None,
            validator_ref: None,
            state: Value::Null,
            players: PlayerRoster::new(),
            metadata: Value::Null,
            version: 0,
            phase: RoomPhase::Lobby,
            conversion_status: ConversionStatus::Pending,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn is_playable(&self) -> bool {
        self.conversion_status == ConversionStatus::Complete
    }
}

/// Standard action kinds plus game-defined custom tags. Custom tags
/// round-trip through serde as their literal string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Join,
    Start,
    Move,
    Update,
    End,
    Custom(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Join => "JOIN",
            Self::Start => "START",
            Self::Move => "MOVE",
            Self::Update => "UPDATE",
            Self::End => "END",
            Self::Custom(tag) => tag,
        }
    }

    pub fn is_standard(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl From<&str> for ActionKind {
    fn from(value: &str) -> Self {
        match value {
            "JOIN" => Self::Join,
            "START" => Self::Start,
            "MOVE" => Self::Move,
            "UPDATE" => Self::Update,
            "END" => Self::End,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ActionKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActionKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from(raw.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    /// Overwritten by the transport-asserted identity before validation;
    /// never trusted from the client payload.
    pub player_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_seq: Option<u64>,
}

impl Action {
    pub fn new(kind: ActionKind, player_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            player_id: player_id.into(),
            data,
            client_seq: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastKind {
    PlayerJoined,
    GameStarted,
    MoveMade,
    StateUpdate,
    GameEnded,
    CustomAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Broadcast {
    pub kind: BroadcastKind,
    /// Compact description of what the accepted action changed.
    pub changes: Value,
    pub version: u64,
    pub state: Value,
    pub players: PlayerRoster,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input errors.
    InvalidActionShape,
    InvalidKind,
    PayloadTooLarge,
    // Room errors.
    RoomNotFound,
    RoomNotReady,
    RoomTerminated,
    // Validation errors reported by validators; benign, not retryable.
    NotYourTurn,
    GameFull,
    DuplicatePlayer,
    IllegalMove,
    GameNotActive,
    GameAlreadyActive,
    NotEnoughPlayers,
    // Infrastructure errors; retryable.
    StoreFailure,
    ValidatorUnavailable,
    ValidatorTimeout,
    ValidatorLimit,
    TimeoutRetry,
    // Conversion errors.
    AnalysisFailed,
    LlmFailed,
    ArtifactPublishFailed,
    ValidatorDeployFailed,
}

impl ErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::StoreFailure
                | Self::ValidatorUnavailable
                | Self::ValidatorTimeout
                | Self::ValidatorLimit
                | Self::TimeoutRetry
        )
    }

    pub fn is_validation(self) -> bool {
        matches!(
            self,
            Self::NotYourTurn
                | Self::GameFull
                | Self::DuplicatePlayer
                | Self::IllegalMove
                | Self::GameNotActive
                | Self::GameAlreadyActive
                | Self::NotEnoughPlayers
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub schema_version: String,
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub retryable: bool,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            error_code,
            message: message.into(),
            details,
            retryable: error_code.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub room_id: String,
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<PlayerRoster>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<Broadcast>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    pub timestamp: u64,
}

impl SubmitResponse {
    pub fn accepted(
        state: Value,
        players: PlayerRoster,
        version: u64,
        broadcast: Broadcast,
        timestamp: u64,
    ) -> Self {
        Self {
            success: true,
            state: Some(state),
            players: Some(players),
            state_version: Some(version),
            broadcast: Some(broadcast),
            error: None,
            timestamp,
        }
    }

    pub fn rejected(error: ApiError, timestamp: u64) -> Self {
        Self {
            success: false,
            state: None,
            players: None,
            state_version: None,
            broadcast: None,
            error: Some(error),
            timestamp,
        }
    }
}

pub const STREAM_KIND_SNAPSHOT: &str = "SNAPSHOT";

/// Messages delivered on a room subscription stream. The first message is
/// always a snapshot; broadcasts follow in version order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub schema_version: String,
    pub kind: String,
    pub version: u64,
    pub state: Value,
    pub players: PlayerRoster,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
}

impl StreamMessage {
    pub fn snapshot(state: Value, players: PlayerRoster, version: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            kind: STREAM_KIND_SNAPSHOT.to_string(),
            version,
            state,
            players,
            changes: None,
        }
    }

    pub fn broadcast(broadcast: &Broadcast) -> Self {
        let kind = serde_json::to_value(broadcast.kind)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| "STATE_UPDATE".to_string());
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            kind,
            version: broadcast.version,
            state: broadcast.state.clone(),
            players: broadcast.players.clone(),
            changes: Some(broadcast.changes.clone()),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.kind == STREAM_KIND_SNAPSHOT
    }
}

/// Conversion status as reported by `status(room_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReport {
    pub schema_version: String,
    pub room_id: String,
    pub status: ConversionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_ref: Option<String>,
    pub updated_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn room_record_round_trip_preserves_values() {
        let mut room = RoomRecord::new("room_abc", "board-3x3-turn-based", 1_000);
        room.state = json!({"phase": "lobby", "board": [[null, null, null]]});
        room.players.insert(PlayerRecord::new("p1", 1_001));
        room.players.insert(PlayerRecord::new("p2", 1_002));
        room.version = 7;
        room.conversion_status = ConversionStatus::Complete;

        let encoded = serde_json::to_string(&room).expect("serialize room");
        let decoded: RoomRecord = serde_json::from_str(&encoded).expect("deserialize room");
        assert_eq!(room, decoded);
    }

    #[test]
    fn room_record_wire_fields_are_camel_case() {
        let room = RoomRecord::new("room_abc", "turn-based", 0);
        let value = serde_json::to_value(&room).expect("serialize room");
        assert!(value.get("roomId").is_some());
        assert!(value.get("conversionStatus").is_some());
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn action_kind_custom_tags_round_trip_as_literal_strings() {
        for raw in ["JOIN", "START", "MOVE", "UPDATE", "END", "POWER_UP"] {
            let kind = ActionKind::from(raw);
            let encoded = serde_json::to_string(&kind).expect("serialize kind");
            assert_eq!(encoded, format!("\"{raw}\""));
            let decoded: ActionKind = serde_json::from_str(&encoded).expect("deserialize kind");
            assert_eq!(kind, decoded);
        }
        assert!(!ActionKind::from("POWER_UP").is_standard());
    }

    #[test]
    fn error_codes_serialize_screaming_snake_case() {
        let encoded = serde_json::to_string(&ErrorCode::NotYourTurn).expect("serialize code");
        assert_eq!(encoded, "\"NOT_YOUR_TURN\"");
        let encoded = serde_json::to_string(&ErrorCode::TimeoutRetry).expect("serialize code");
        assert_eq!(encoded, "\"TIMEOUT_RETRY\"");
    }

    #[test]
    fn retryable_flag_tracks_error_class() {
        assert!(ErrorCode::StoreFailure.is_retryable());
        assert!(ErrorCode::TimeoutRetry.is_retryable());
        assert!(!ErrorCode::NotYourTurn.is_retryable());
        assert!(ErrorCode::NotYourTurn.is_validation());
        assert!(!ErrorCode::StoreFailure.is_validation());

        let error = ApiError::new(ErrorCode::StoreFailure, "store write failed", None);
        assert!(error.retryable);
    }

    #[test]
    fn roster_preserves_insertion_order_and_rotation() {
        let mut roster = PlayerRoster::new();
        assert!(roster.insert(PlayerRecord::new("p1", 1)));
        assert!(roster.insert(PlayerRecord::new("p2", 2)));
        assert!(roster.insert(PlayerRecord::new("p3", 3)));
        assert!(!roster.insert(PlayerRecord::new("p2", 4)));

        assert_eq!(roster.player_ids(), vec!["p1", "p2", "p3"]);
        assert_eq!(roster.next_standing_after("p3").as_deref(), Some("p1"));

        roster.get_mut("p2").expect("p2 present").eliminated = true;
        assert_eq!(roster.next_standing_after("p1").as_deref(), Some("p3"));
    }

    #[test]
    fn sole_standing_player_keeps_the_turn() {
        let mut roster = PlayerRoster::new();
        roster.insert(PlayerRecord::new("p1", 1));
        roster.insert(PlayerRecord::new("p2", 2));
        roster.get_mut("p2").expect("p2 present").eliminated = true;
        assert_eq!(roster.next_standing_after("p1").as_deref(), Some("p1"));
    }

    #[test]
    fn stream_snapshot_message_is_tagged() {
        let message = StreamMessage::snapshot(json!({"counter": 0}), PlayerRoster::new(), 3);
        assert!(message.is_snapshot());
        let value = serde_json::to_value(&message).expect("serialize message");
        assert_eq!(value.get("kind").and_then(Value::as_str), Some("SNAPSHOT"));
    }
}
