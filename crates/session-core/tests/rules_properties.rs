use contracts::validator::{ValidatorInput, ValidatorProgram, ValidatorVerdict};
use contracts::{Action, ActionKind, PlayerRoster};
use proptest::prelude::*;
use serde_json::{json, Value};
use session_core::rules::{evaluate, Fuel};

const FUEL_BUDGET: u64 = 100_000;

fn apply(
    program: &ValidatorProgram,
    state: &Value,
    players: &PlayerRoster,
    kind: ActionKind,
    player: &str,
    data: Value,
) -> ValidatorVerdict {
    let input = ValidatorInput {
        action: Action::new(kind, player, data.clone()),
        state: state.clone(),
        players: players.clone(),
        player_id: player.to_string(),
        data,
        room_id: "room_prop".to_string(),
        timestamp: 7_000,
    };
    let mut fuel = Fuel::new(FUEL_BUDGET);
    evaluate(program, &input, &mut fuel).expect("fuel budget is ample")
}

fn commit(state: &mut Value, players: &mut PlayerRoster, verdict: &ValidatorVerdict) {
    if let Some(updated) = &verdict.updated_state {
        *state = updated.clone();
    }
    if let Some(updated) = &verdict.updated_players {
        *players = updated.clone();
    }
}

fn player_pool() -> Vec<&'static str> {
    vec!["p1", "p2", "p3", "p4", "p5"]
}

proptest! {
    /// The number of distinct players in the room equals the count of
    /// accepted JOINs, for any JOIN sequence with repeats.
    #[test]
    fn property_accepted_joins_match_distinct_players(
        joins in prop::collection::vec(prop::sample::select(player_pool()), 1..12)
    ) {
        let program = ValidatorProgram::generic_for_kind("free-for-all");
        let mut state = Value::Null;
        let mut players = PlayerRoster::new();
        let mut accepted = 0_usize;

        for player in &joins {
            let verdict = apply(&program, &state, &players, ActionKind::Join, player, json!({}));
            if verdict.valid {
                accepted += 1;
                commit(&mut state, &mut players, &verdict);
            }
        }

        prop_assert_eq!(players.len(), accepted);
        let mut distinct = joins.clone();
        distinct.sort_unstable();
        distinct.dedup();
        prop_assert_eq!(accepted, distinct.len().min(program.max_players));
    }

    /// After an accepted MOVE by P in a turn-based room, the turn is no
    /// longer P's (two standing players throughout).
    #[test]
    fn property_turn_leaves_the_mover(
        attempts in prop::collection::vec(prop::sample::select(vec!["p1", "p2"]), 1..24)
    ) {
        let program = ValidatorProgram::generic_for_kind("counter-turn-based");
        let mut state = json!({"counter": 0, "target": 1_000_000, "currentTurn": null});
        let mut players = PlayerRoster::new();

        for player in ["p1", "p2"] {
            let verdict = apply(&program, &state, &players, ActionKind::Join, player, json!({}));
            prop_assert!(verdict.valid);
            commit(&mut state, &mut players, &verdict);
        }
        let verdict = apply(&program, &state, &players, ActionKind::Start, "p1", json!({}));
        prop_assert!(verdict.valid);
        commit(&mut state, &mut players, &verdict);

        for mover in &attempts {
            let verdict = apply(
                &program,
                &state,
                &players,
                ActionKind::Move,
                mover,
                json!({"delta": 1}),
            );
            if verdict.valid {
                commit(&mut state, &mut players, &verdict);
                let turn = state.get("currentTurn").and_then(Value::as_str);
                prop_assert_ne!(turn, Some(*mover));
            }
        }
    }

    /// Rejected verdicts never carry state, players, or a broadcast.
    #[test]
    fn property_rejections_carry_no_mutation(
        seed_moves in prop::collection::vec(
            (prop::sample::select(vec!["p1", "p2", "p3"]), 0_u64..4, 0_u64..4),
            1..16
        )
    ) {
        let program = ValidatorProgram::generic_for_kind("board-3x3-turn-based");
        let mut state = Value::Null;
        let mut players = PlayerRoster::new();

        for player in ["p1", "p2"] {
            let verdict = apply(&program, &state, &players, ActionKind::Join, player, json!({}));
            commit(&mut state, &mut players, &verdict);
        }
        let verdict = apply(&program, &state, &players, ActionKind::Start, "p1", json!({}));
        commit(&mut state, &mut players, &verdict);

        for (player, row, col) in &seed_moves {
            let verdict = apply(
                &program,
                &state,
                &players,
                ActionKind::Move,
                player,
                json!({"row": row, "col": col}),
            );
            if verdict.valid {
                commit(&mut state, &mut players, &verdict);
            } else {
                prop_assert!(verdict.reason.is_some());
                prop_assert!(verdict.updated_state.is_none());
                prop_assert!(verdict.updated_players.is_none());
                prop_assert!(verdict.broadcast.is_none());
            }
        }
    }

    /// The same action sequence applied to two fresh rooms yields identical
    /// states: the interpreter is deterministic modulo the timestamp, which
    /// is held fixed here.
    #[test]
    fn property_replay_is_deterministic(
        script in prop::collection::vec(
            (prop::sample::select(vec!["p1", "p2"]), 0_u64..3, 0_u64..3),
            1..12
        )
    ) {
        let program = ValidatorProgram::generic_for_kind("board-3x3-turn-based");

        let run = |script: &[(&str, u64, u64)]| {
            let mut state = Value::Null;
            let mut players = PlayerRoster::new();
            for player in ["p1", "p2"] {
                let verdict = apply(&program, &state, &players, ActionKind::Join, player, json!({}));
                commit(&mut state, &mut players, &verdict);
            }
            let verdict = apply(&program, &state, &players, ActionKind::Start, "p1", json!({}));
            commit(&mut state, &mut players, &verdict);
            for (player, row, col) in script {
                let verdict = apply(
                    &program,
                    &state,
                    &players,
                    ActionKind::Move,
                    player,
                    json!({"row": row, "col": col}),
                );
                if verdict.valid {
                    commit(&mut state, &mut players, &verdict);
                }
            }
            (state, players)
        };

        let first = run(&script);
        let second = run(&script);
        prop_assert_eq!(first.0, second.0);
        prop_assert_eq!(first.1, second.1);
    }
}

#[test]
fn move_on_a_full_board_without_a_line_is_a_draw_in_waiting() {
    // Fill all but one cell without a line; the game stays active.
    let program = ValidatorProgram::generic_for_kind("board-3x3-turn-based");
    let mut state = Value::Null;
    let mut players = PlayerRoster::new();

    for player in ["p1", "p2"] {
        let verdict = apply(&program, &state, &players, ActionKind::Join, player, json!({}));
        commit(&mut state, &mut players, &verdict);
    }
    let verdict = apply(&program, &state, &players, ActionKind::Start, "p1", json!({}));
    commit(&mut state, &mut players, &verdict);

    // p1: (0,0) (0,1) (1,2) (2,0); p2: (0,2) (1,0) (1,1) — no three in a row.
    let script = [
        ("p1", 0, 0),
        ("p2", 0, 2),
        ("p1", 0, 1),
        ("p2", 1, 0),
        ("p1", 1, 2),
        ("p2", 1, 1),
        ("p1", 2, 0),
    ];
    for (player, row, col) in script {
        let verdict = apply(
            &program,
            &state,
            &players,
            ActionKind::Move,
            player,
            json!({"row": row, "col": col}),
        );
        assert!(verdict.valid, "move {row},{col} by {player} rejected");
        commit(&mut state, &mut players, &verdict);
    }
    assert_eq!(state["phase"], json!("active"));
    assert!(state.get("winner").is_none());
}
