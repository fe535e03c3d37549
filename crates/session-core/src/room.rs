//! Room lifecycle transitions. Conversion status and phase each form a
//! small state machine; illegal transitions are errors rather than silent
//! no-ops.

use std::fmt;

use contracts::{ConversionStatus, RoomPhase, RoomRecord};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    Conversion {
        from: ConversionStatus,
        to: ConversionStatus,
    },
    Phase {
        from: RoomPhase,
        to: RoomPhase,
    },
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversion { from, to } => {
                write!(f, "illegal conversion transition {from} -> {to}")
            }
            Self::Phase { from, to } => write!(f, "illegal phase transition {from} -> {to}"),
        }
    }
}

impl std::error::Error for TransitionError {}

/// pending -> processing -> complete | failed. A failed room may be
/// re-submitted, which moves it back to processing.
pub fn transition_conversion(
    room: &mut RoomRecord,
    to: ConversionStatus,
    now: u64,
) -> Result<(), TransitionError> {
    let from = room.conversion_status;
    let allowed = matches!(
        (from, to),
        (ConversionStatus::Pending, ConversionStatus::Processing)
            | (ConversionStatus::Processing, ConversionStatus::Complete)
            | (ConversionStatus::Processing, ConversionStatus::Failed)
            | (ConversionStatus::Failed, ConversionStatus::Processing)
    );
    if !allowed {
        return Err(TransitionError::Conversion { from, to });
    }
    room.conversion_status = to;
    room.updated_at = now;
    Ok(())
}

/// lobby -> active -> ended. Ended is terminal.
pub fn transition_phase(
    room: &mut RoomRecord,
    to: RoomPhase,
    now: u64,
) -> Result<(), TransitionError> {
    let from = room.phase;
    let allowed = matches!(
        (from, to),
        (RoomPhase::Lobby, RoomPhase::Active) | (RoomPhase::Active, RoomPhase::Ended)
    );
    if !allowed {
        return Err(TransitionError::Phase { from, to });
    }
    room.phase = to;
    room.updated_at = now;
    Ok(())
}

/// Parses the phase a state document claims. Absent or unknown values read
/// as lobby.
pub fn phase_from_state(state: &Value) -> RoomPhase {
    match state.get("phase").and_then(Value::as_str) {
        Some("active") => RoomPhase::Active,
        Some("ended") => RoomPhase::Ended,
        _ => RoomPhase::Lobby,
    }
}

/// Mirrors the validator-owned `state.phase` onto the record, through the
/// phase guards. Same-phase output is a no-op; a claim that would move the
/// room backwards (or skip a step) is rejected rather than silently
/// accepted.
pub fn sync_phase_from_state(room: &mut RoomRecord) -> Result<(), TransitionError> {
    let claimed = phase_from_state(&room.state);
    if claimed == room.phase {
        return Ok(());
    }
    transition_phase(room, claimed, room.updated_at)
}
