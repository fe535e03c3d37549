//! Validator module contract: the synthesized program artifact, the
//! invocation input, and the verdict it must produce.
//!
//! Validators are deterministic modulo the provided timestamp. They perform
//! no I/O, read no clocks, and draw no randomness; anything nondeterministic
//! must come from state fields or the action payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Action, BroadcastKind, ErrorCode, PlayerRoster, SCHEMA_VERSION_V1};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BoardSpec {
    pub rows: u8,
    pub cols: u8,
    /// Consecutive cells required for a line win.
    pub win_line: u8,
}

impl BoardSpec {
    pub fn three_by_three() -> Self {
        Self {
            rows: 3,
            cols: 3,
            win_line: 3,
        }
    }
}

/// Accumulator mechanic: MOVE payloads carry a delta applied to
/// `state[field]`; reaching `state[target_field]` wins for the mover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CounterSpec {
    pub field: String,
    pub target_field: String,
}

impl Default for CounterSpec {
    fn default() -> Self {
        Self {
            field: "counter".to_string(),
            target_field: "target".to_string(),
        }
    }
}

/// Synthesized validator artifact. Published content-addressed; immutable
/// once referenced by a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorProgram {
    pub schema_version: String,
    pub kind_tag: String,
    pub min_players: usize,
    pub max_players: usize,
    pub turn_based: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<BoardSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<CounterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_score: Option<i64>,
    #[serde(default)]
    pub uses_lives: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_lives: Option<i64>,
    #[serde(default)]
    pub tracks_rounds: bool,
    /// Game-defined action tags this program accepts beyond the standard set.
    #[serde(default)]
    pub custom_kinds: Vec<String>,
}

impl ValidatorProgram {
    /// Generic profile derived from a kind tag alone, used when no validator
    /// artifact is deployed.
    pub fn generic_for_kind(kind: &str) -> Self {
        let turn_based = kind.contains("turn-based") || kind.contains("board");
        let board = kind
            .contains("board-3x3")
            .then(BoardSpec::three_by_three);
        let counter = kind.contains("counter").then(CounterSpec::default);
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            kind_tag: kind.to_string(),
            min_players: 2,
            max_players: if turn_based { 2 } else { 8 },
            turn_based,
            board,
            counter,
            target_score: None,
            uses_lives: false,
            starting_lives: None,
            tracks_rounds: true,
            custom_kinds: Vec::new(),
        }
    }

    pub fn accepts_kind(&self, action: &Action) -> bool {
        action.kind.is_standard() || self.custom_kinds.contains(&action.kind.as_str().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorInput {
    pub action: Action,
    pub state: Value,
    pub players: PlayerRoster,
    pub player_id: String,
    #[serde(default)]
    pub data: Value,
    pub room_id: String,
    /// The only time source a validator may observe.
    pub timestamp: u64,
}

/// Declarations a validator may make about its room; the runtime honors
/// these over generic defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorDeclarations {
    pub min_players: usize,
    pub max_players: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorVerdict {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_players: Option<PlayerRoster>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<BroadcastKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ValidatorDeclarations>,
    pub timestamp: u64,
}

impl ValidatorVerdict {
    pub fn accept(
        updated_state: Value,
        updated_players: PlayerRoster,
        broadcast: BroadcastKind,
        changes: Value,
        timestamp: u64,
    ) -> Self {
        Self {
            valid: true,
            reason: None,
            message: None,
            updated_state: Some(updated_state),
            updated_players: Some(updated_players),
            broadcast: Some(broadcast),
            changes: Some(changes),
            metadata: None,
            timestamp,
        }
    }

    pub fn reject(reason: ErrorCode, message: impl Into<String>, timestamp: u64) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            message: Some(message.into()),
            updated_state: None,
            updated_players: None,
            broadcast: None,
            changes: None,
            metadata: None,
            timestamp,
        }
    }

    pub fn with_declarations(mut self, declarations: ValidatorDeclarations) -> Self {
        self.metadata = Some(declarations);
        self
    }
}
