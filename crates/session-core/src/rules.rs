//! Deterministic rules interpreter for validator programs.
//!
//! A `ValidatorProgram` is data, not code: this module gives it semantics.
//! The same entry points double as the generic fallback handlers — a room
//! with no deployed validator runs a profile derived from its kind tag.
//!
//! Determinism contract: the only time source is `input.timestamp`; there is
//! no I/O and no randomness. Work is metered by a fuel budget so the sandbox
//! host can enforce a hard ceiling.

use std::fmt;

use contracts::validator::{
    ValidatorDeclarations, ValidatorInput, ValidatorProgram, ValidatorVerdict,
};
use contracts::{BroadcastKind, ErrorCode, PlayerRecord, PlayerRoster};
use serde_json::{json, Map, Value};

/// State keys owned by the interpreter; UPDATE payloads may not touch them.
const PROTECTED_KEYS: [&str; 8] = [
    "phase",
    "winner",
    "currentTurn",
    "round",
    "moveCount",
    "startedAt",
    "endedAt",
    "finalScores",
];

const DEFAULT_COUNTER_TARGET: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulesError {
    FuelExhausted,
}

impl fmt::Display for RulesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FuelExhausted => write!(f, "validator fuel exhausted"),
        }
    }
}

impl std::error::Error for RulesError {}

/// Work meter. Every interpreter step withdraws; hitting zero aborts the
/// invocation.
#[derive(Debug, Clone, Copy)]
pub struct Fuel {
    remaining: u64,
}

impl Fuel {
    pub fn new(budget: u64) -> Self {
        Self { remaining: budget }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn consume(&mut self, units: u64) -> Result<(), RulesError> {
        if self.remaining < units {
            self.remaining = 0;
            return Err(RulesError::FuelExhausted);
        }
        self.remaining -= units;
        Ok(())
    }
}

pub fn declarations(program: &ValidatorProgram) -> ValidatorDeclarations {
    ValidatorDeclarations {
        min_players: program.min_players,
        max_players: program.max_players,
    }
}

/// Synthesizes the initial state for a program: lobby phase plus
/// kind-specific scaffolding.
pub fn initial_state(program: &ValidatorProgram) -> Value {
    let mut state = Map::new();
    state.insert("phase".to_string(), json!("lobby"));
    state.insert("round".to_string(), json!(0));
    state.insert("moveCount".to_string(), json!(0));
    if program.turn_based {
        state.insert("currentTurn".to_string(), Value::Null);
    }
    if let Some(board) = &program.board {
        state.insert("board".to_string(), empty_board(board.rows, board.cols));
    }
    if let Some(counter) = &program.counter {
        state.insert(counter.field.clone(), json!(0));
        state.insert(counter.target_field.clone(), json!(DEFAULT_COUNTER_TARGET));
    }
    if program.target_score.is_some() {
        state.insert("targetScore".to_string(), json!(program.target_score));
    }
    Value::Object(state)
}

fn empty_board(rows: u8, cols: u8) -> Value {
    let row: Vec<Value> = (0..cols).map(|_| Value::Null).collect();
    let board: Vec<Value> = (0..rows).map(|_| Value::Array(row.clone())).collect();
    Value::Array(board)
}

/// Evaluates one action. The verdict always carries the program's player
/// declarations so the runtime can honor them over generic defaults.
pub fn evaluate(
    program: &ValidatorProgram,
    input: &ValidatorInput,
    fuel: &mut Fuel,
) -> Result<ValidatorVerdict, RulesError> {
    fuel.consume(10)?;

    let mut state = normalize_state(program, &input.state, fuel)?;
    let mut players = input.players.clone();
    let timestamp = input.timestamp;

    if !program.accepts_kind(&input.action) {
        return Ok(reject(
            program,
            ErrorCode::InvalidKind,
            format!("action kind {} is not accepted by this game", input.action.kind),
            timestamp,
        ));
    }

    let verdict = match input.action.kind.as_str() {
        "JOIN" => apply_join(program, &mut state, &mut players, input, fuel)?,
        "START" => apply_start(program, &mut state, &players, input)?,
        "MOVE" => apply_move(program, &mut state, &mut players, input, fuel)?,
        "UPDATE" => apply_update(&mut state, &mut players, input, fuel)?,
        "END" => apply_end(&mut state, &players, input, fuel)?,
        _ => apply_custom(&mut state, input, fuel)?,
    };

    Ok(match verdict {
        Outcome::Accept { broadcast, changes } => {
            ValidatorVerdict::accept(state, players, broadcast, changes, timestamp)
                .with_declarations(declarations(program))
        }
        Outcome::Reject { reason, message } => reject(program, reason, message, timestamp),
    })
}

enum Outcome {
    Accept {
        broadcast: BroadcastKind,
        changes: Value,
    },
    Reject {
        reason: ErrorCode,
        message: String,
    },
}

fn reject(
    program: &ValidatorProgram,
    reason: ErrorCode,
    message: impl Into<String>,
    timestamp: u64,
) -> ValidatorVerdict {
    ValidatorVerdict::reject(reason, message, timestamp).with_declarations(declarations(program))
}

fn apply_join(
    program: &ValidatorProgram,
    state: &mut Value,
    players: &mut PlayerRoster,
    input: &ValidatorInput,
    fuel: &mut Fuel,
) -> Result<Outcome, RulesError> {
    fuel.consume(players.len() as u64 + 1)?;

    if phase_of(state) == "ended" {
        return Ok(Outcome::Reject {
            reason: ErrorCode::GameNotActive,
            message: "game already ended".to_string(),
        });
    }
    if players.contains(&input.player_id) {
        return Ok(Outcome::Reject {
            reason: ErrorCode::DuplicatePlayer,
            message: format!("{} already joined", input.player_id),
        });
    }
    if players.len() >= program.max_players {
        return Ok(Outcome::Reject {
            reason: ErrorCode::GameFull,
            message: format!("room is full ({} players)", program.max_players),
        });
    }

    let mut record = PlayerRecord::new(&input.player_id, input.timestamp);
    if let Some(profile) = input.data.get("profile") {
        record.profile = profile.clone();
    }
    if program.target_score.is_some() {
        record.score = Some(0);
    }
    if program.uses_lives {
        record.lives = Some(program.starting_lives.unwrap_or(3));
    }
    let first_joiner = players.is_empty();
    players.insert(record);

    // First joiner holds the opening turn in turn-based games.
    if program.turn_based && first_joiner {
        set_field(state, "currentTurn", json!(input.player_id));
    }

    Ok(Outcome::Accept {
        broadcast: BroadcastKind::PlayerJoined,
        changes: json!({
            "playerId": input.player_id,
            "playerCount": players.len(),
        }),
    })
}

fn apply_start(
    program: &ValidatorProgram,
    state: &mut Value,
    players: &PlayerRoster,
    input: &ValidatorInput,
) -> Result<Outcome, RulesError> {
    match phase_of(state) {
        "active" => {
            return Ok(Outcome::Reject {
                reason: ErrorCode::GameAlreadyActive,
                message: "game already started".to_string(),
            })
        }
        "ended" => {
            return Ok(Outcome::Reject {
                reason: ErrorCode::GameNotActive,
                message: "game already ended".to_string(),
            })
        }
        _ => {}
    }
    if players.len() < program.min_players {
        return Ok(Outcome::Reject {
            reason: ErrorCode::NotEnoughPlayers,
            message: format!(
                "need at least {} players, have {}",
                program.min_players,
                players.len()
            ),
        });
    }

    set_field(state, "phase", json!("active"));
    set_field(state, "startedAt", json!(input.timestamp));
    set_field(state, "round", json!(1));
    if program.turn_based && field_is_null(state, "currentTurn") {
        if let Some(first) = players.standing().first() {
            set_field(state, "currentTurn", json!(first.player_id));
        }
    }

    Ok(Outcome::Accept {
        broadcast: BroadcastKind::GameStarted,
        changes: json!({
            "round": 1,
            "startedAt": input.timestamp,
            "startedBy": input.player_id,
        }),
    })
}

fn apply_move(
    program: &ValidatorProgram,
    state: &mut Value,
    players: &mut PlayerRoster,
    input: &ValidatorInput,
    fuel: &mut Fuel,
) -> Result<Outcome, RulesError> {
    fuel.consume(5)?;

    if phase_of(state) != "active" {
        return Ok(Outcome::Reject {
            reason: ErrorCode::GameNotActive,
            message: "game is not active".to_string(),
        });
    }
    if !players.contains(&input.player_id) {
        return Ok(Outcome::Reject {
            reason: ErrorCode::IllegalMove,
            message: format!("{} is not in this room", input.player_id),
        });
    }
    if program.turn_based {
        let holder = field_str(state, "currentTurn");
        if holder.as_deref() != Some(input.player_id.as_str()) {
            return Ok(Outcome::Reject {
                reason: ErrorCode::NotYourTurn,
                message: format!(
                    "it is {}'s turn",
                    holder.unwrap_or_else(|| "nobody".to_string())
                ),
            });
        }
    }

    let mut changes = Map::new();
    changes.insert("playerId".to_string(), json!(input.player_id));

    // Board placement.
    if let Some(board_spec) = &program.board {
        if let (Some(row), Some(col)) = (
            input.data.get("row").and_then(Value::as_u64),
            input.data.get("col").and_then(Value::as_u64),
        ) {
            fuel.consume(u64::from(board_spec.rows) * u64::from(board_spec.cols))?;
            if row >= u64::from(board_spec.rows) || col >= u64::from(board_spec.cols) {
                return Ok(Outcome::Reject {
                    reason: ErrorCode::IllegalMove,
                    message: format!("position {row},{col} is off the board"),
                });
            }
            if !cell_is_empty(state, row as usize, col as usize) {
                return Ok(Outcome::Reject {
                    reason: ErrorCode::IllegalMove,
                    message: format!("position {row},{col} is occupied"),
                });
            }
            set_cell(state, row as usize, col as usize, json!(input.player_id));
            changes.insert("row".to_string(), json!(row));
            changes.insert("col".to_string(), json!(col));
        }
    }

    // Counter accumulation.
    if let Some(counter_spec) = &program.counter {
        if let Some(delta) = input.data.get("delta").and_then(Value::as_i64) {
            let current = field_i64(state, &counter_spec.field).unwrap_or(0);
            set_field(state, &counter_spec.field, json!(current + delta));
            changes.insert(counter_spec.field.clone(), json!(current + delta));
        }
    }

    // Per-player scoring.
    if let Some(points) = input.data.get("points").and_then(Value::as_i64) {
        if let Some(record) = players.get_mut(&input.player_id) {
            let score = record.score.unwrap_or(0) + points;
            record.score = Some(score);
            changes.insert("score".to_string(), json!(score));
        }
    }

    let move_count = field_i64(state, "moveCount").unwrap_or(0) + 1;
    set_field(state, "moveCount", json!(move_count));

    if let Some(winner) = winner_after_move(program, state, players, &input.player_id, fuel)? {
        set_field(state, "phase", json!("ended"));
        set_field(state, "winner", json!(winner));
        set_field(state, "endedAt", json!(input.timestamp));
        changes.insert("winner".to_string(), json!(winner));
        return Ok(Outcome::Accept {
            broadcast: BroadcastKind::GameEnded,
            changes: Value::Object(changes),
        });
    }

    if program.turn_based {
        if let Some(next) = players.next_standing_after(&input.player_id) {
            if program.tracks_rounds {
                let wrapped = players
                    .standing()
                    .first()
                    .map(|first| first.player_id == next)
                    .unwrap_or(false);
                if wrapped {
                    let round = field_i64(state, "round").unwrap_or(0) + 1;
                    set_field(state, "round", json!(round));
                }
            }
            set_field(state, "currentTurn", json!(next));
            changes.insert("nextTurn".to_string(), json!(next));
        }
    }

    Ok(Outcome::Accept {
        broadcast: BroadcastKind::MoveMade,
        changes: Value::Object(changes),
    })
}

/// Generic win conditions, evaluated after the move was applied:
/// counter target, target score, line on the declared board, last player
/// standing.
fn winner_after_move(
    program: &ValidatorProgram,
    state: &Value,
    players: &PlayerRoster,
    mover: &str,
    fuel: &mut Fuel,
) -> Result<Option<String>, RulesError> {
    fuel.consume(players.len() as u64 + 1)?;

    if let Some(counter_spec) = &program.counter {
        let value = field_i64(state, &counter_spec.field).unwrap_or(0);
        let target =
            field_i64(state, &counter_spec.target_field).unwrap_or(DEFAULT_COUNTER_TARGET);
        if value >= target {
            return Ok(Some(mover.to_string()));
        }
    }

    if let Some(target_score) = program.target_score {
        for player in players.iter() {
            if player.score.unwrap_or(0) >= target_score {
                return Ok(Some(player.player_id.clone()));
            }
        }
    }

    if let Some(board_spec) = &program.board {
        fuel.consume(u64::from(board_spec.rows) * u64::from(board_spec.cols) * 4)?;
        if board_has_line(state, board_spec.rows, board_spec.cols, board_spec.win_line, mover) {
            return Ok(Some(mover.to_string()));
        }
    }

    let standing = players.standing();
    if players.len() > 1 && standing.len() == 1 {
        return Ok(Some(standing[0].player_id.clone()));
    }

    Ok(None)
}

fn apply_update(
    state: &mut Value,
    players: &mut PlayerRoster,
    input: &ValidatorInput,
    fuel: &mut Fuel,
) -> Result<Outcome, RulesError> {
    if phase_of(state) == "ended" {
        return Ok(Outcome::Reject {
            reason: ErrorCode::GameNotActive,
            message: "game already ended".to_string(),
        });
    }
    if !players.contains(&input.player_id) {
        return Ok(Outcome::Reject {
            reason: ErrorCode::IllegalMove,
            message: format!("{} is not in this room", input.player_id),
        });
    }
    let Some(entries) = input.data.as_object() else {
        return Ok(Outcome::Reject {
            reason: ErrorCode::InvalidActionShape,
            message: "UPDATE payload must be an object".to_string(),
        });
    };

    let mut merged = Vec::new();
    for (key, value) in entries {
        fuel.consume(1)?;
        if key == "player" {
            if let Some(patch) = value.as_object() {
                merge_player_patch(players, &input.player_id, patch);
                merged.push(json!("player"));
            }
            continue;
        }
        // The interpreter owns lifecycle keys; clients cannot smuggle a
        // phase flip or a winner through UPDATE.
        if PROTECTED_KEYS.contains(&key.as_str()) {
            continue;
        }
        set_field(state, key, value.clone());
        merged.push(json!(key));
    }

    Ok(Outcome::Accept {
        broadcast: BroadcastKind::StateUpdate,
        changes: json!({
            "playerId": input.player_id,
            "mergedKeys": merged,
        }),
    })
}

fn merge_player_patch(
    players: &mut PlayerRoster,
    player_id: &str,
    patch: &Map<String, Value>,
) {
    let Some(record) = players.get_mut(player_id) else {
        return;
    };
    if let Some(score) = patch.get("score").and_then(Value::as_i64) {
        record.score = Some(score);
    }
    if let Some(lives) = patch.get("lives").and_then(Value::as_i64) {
        record.lives = Some(lives);
        if lives <= 0 {
            record.eliminated = true;
        }
    }
    if let Some(eliminated) = patch.get("eliminated").and_then(Value::as_bool) {
        record.eliminated = eliminated;
    }
    if let Some(profile) = patch.get("profile") {
        record.profile = profile.clone();
    }
}

fn apply_end(
    state: &mut Value,
    players: &PlayerRoster,
    input: &ValidatorInput,
    fuel: &mut Fuel,
) -> Result<Outcome, RulesError> {
    fuel.consume(players.len() as u64 + 1)?;

    if phase_of(state) != "active" {
        return Ok(Outcome::Reject {
            reason: ErrorCode::GameNotActive,
            message: "game is not active".to_string(),
        });
    }
    if !players.contains(&input.player_id) {
        return Ok(Outcome::Reject {
            reason: ErrorCode::IllegalMove,
            message: format!("{} is not in this room", input.player_id),
        });
    }

    let mut final_scores = Map::new();
    for player in players.iter() {
        final_scores.insert(player.player_id.clone(), json!(player.score.unwrap_or(0)));
    }
    set_field(state, "phase", json!("ended"));
    set_field(state, "endedAt", json!(input.timestamp));
    set_field(state, "finalScores", Value::Object(final_scores.clone()));

    Ok(Outcome::Accept {
        broadcast: BroadcastKind::GameEnded,
        changes: json!({
            "endedBy": input.player_id,
            "finalScores": final_scores,
        }),
    })
}

fn apply_custom(
    state: &mut Value,
    input: &ValidatorInput,
    fuel: &mut Fuel,
) -> Result<Outcome, RulesError> {
    if phase_of(state) == "ended" {
        return Ok(Outcome::Reject {
            reason: ErrorCode::GameNotActive,
            message: "game already ended".to_string(),
        });
    }
    if let Some(entries) = input.data.as_object() {
        for (key, value) in entries {
            fuel.consume(1)?;
            if !PROTECTED_KEYS.contains(&key.as_str()) {
                set_field(state, key, value.clone());
            }
        }
    }

    Ok(Outcome::Accept {
        broadcast: BroadcastKind::CustomAction,
        changes: json!({
            "type": input.action.kind.as_str(),
            "playerId": input.player_id,
            "data": input.data,
        }),
    })
}

/// Fills in any scaffolding the state document is missing. An empty state is
/// fully synthesized; a partial state (e.g. supplied at room creation) keeps
/// its values.
fn normalize_state(
    program: &ValidatorProgram,
    state: &Value,
    fuel: &mut Fuel,
) -> Result<Value, RulesError> {
    fuel.consume(2)?;

    let mut normalized = match state {
        Value::Object(map) => Value::Object(map.clone()),
        _ => initial_state(program),
    };
    let defaults = initial_state(program);
    if let (Value::Object(target), Value::Object(scaffold)) = (&mut normalized, defaults) {
        for (key, value) in scaffold {
            target.entry(key).or_insert(value);
        }
    }
    Ok(normalized)
}

fn phase_of(state: &Value) -> &str {
    state
        .get("phase")
        .and_then(Value::as_str)
        .unwrap_or("lobby")
}

fn field_str(state: &Value, key: &str) -> Option<String> {
    state.get(key).and_then(Value::as_str).map(str::to_string)
}

fn field_i64(state: &Value, key: &str) -> Option<i64> {
    state.get(key).and_then(Value::as_i64)
}

fn field_is_null(state: &Value, key: &str) -> bool {
    state.get(key).map(Value::is_null).unwrap_or(true)
}

fn set_field(state: &mut Value, key: &str, value: Value) {
    if let Value::Object(map) = state {
        map.insert(key.to_string(), value);
    }
}

fn cell_is_empty(state: &Value, row: usize, col: usize) -> bool {
    state
        .get("board")
        .and_then(|board| board.get(row))
        .and_then(|cells| cells.get(col))
        .map(Value::is_null)
        .unwrap_or(false)
}

fn set_cell(state: &mut Value, row: usize, col: usize, value: Value) {
    if let Some(cell) = state
        .get_mut("board")
        .and_then(|board| board.get_mut(row))
        .and_then(|cells| cells.get_mut(col))
    {
        *cell = value;
    }
}

/// Full-line scan: rows, columns, and both diagonals. `win_line` consecutive
/// cells owned by `player` win.
fn board_has_line(state: &Value, rows: u8, cols: u8, win_line: u8, player: &str) -> bool {
    let owned = |row: usize, col: usize| -> bool {
        state
            .get("board")
            .and_then(|board| board.get(row))
            .and_then(|cells| cells.get(col))
            .and_then(Value::as_str)
            .map(|owner| owner == player)
            .unwrap_or(false)
    };

    let rows = rows as usize;
    let cols = cols as usize;
    let needed = win_line as usize;
    if needed == 0 {
        return false;
    }

    // Horizontal and vertical runs.
    for row in 0..rows {
        let mut run = 0;
        for col in 0..cols {
            run = if owned(row, col) { run + 1 } else { 0 };
            if run >= needed {
                return true;
            }
        }
    }
    for col in 0..cols {
        let mut run = 0;
        for row in 0..rows {
            run = if owned(row, col) { run + 1 } else { 0 };
            if run >= needed {
                return true;
            }
        }
    }

    // Diagonals, both directions, from every starting cell.
    for start_row in 0..rows {
        for start_col in 0..cols {
            let mut run_down = 0;
            let mut run_up = 0;
            for step in 0..needed {
                let row = start_row + step;
                if row < rows && start_col + step < cols && owned(row, start_col + step) {
                    run_down += 1;
                } else {
                    break;
                }
            }
            for step in 0..needed {
                let row = start_row + step;
                if row < rows && start_col >= step && owned(row, start_col - step) {
                    run_up += 1;
                } else {
                    break;
                }
            }
            if run_down >= needed || run_up >= needed {
                return true;
            }
        }
    }

    false
}
