//! Validator synthesis: turns an analysis report into a validator program.
//! Mechanics flags decide which handlers the program carries and how win
//! conditions are evaluated.

use contracts::analysis::AnalysisReport;
use contracts::validator::{BoardSpec, CounterSpec, ValidatorProgram};
use contracts::SCHEMA_VERSION_V1;

const DEFAULT_OPEN_MAX_PLAYERS: usize = 8;
const DEFAULT_TURN_MAX_PLAYERS: usize = 2;

pub fn synthesize(report: &AnalysisReport) -> ValidatorProgram {
    let turn_based = report.is_turn_based();

    let board = match (report.elements.board_rows, report.elements.board_cols) {
        (Some(rows), Some(cols)) if report.mechanics.board => Some(BoardSpec {
            rows,
            cols,
            win_line: rows.min(cols),
        }),
        _ => None,
    };

    let counter = report.kind_tag.contains("counter").then(CounterSpec::default);

    // A score mechanic alone does not impose a target; only an explicit
    // win-condition signal turns scoring into a race.
    let target_score = (report.mechanics.score && report.mechanics.win_condition && counter.is_none()
        && board.is_none())
    .then_some(100);

    let max_players = if turn_based {
        DEFAULT_TURN_MAX_PLAYERS
    } else {
        DEFAULT_OPEN_MAX_PLAYERS
    };

    ValidatorProgram {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        kind_tag: report.kind_tag.clone(),
        min_players: 2,
        max_players,
        turn_based,
        board,
        counter,
        target_score,
        uses_lives: report.mechanics.lives,
        starting_lives: report.mechanics.lives.then_some(3),
        tracks_rounds: report.mechanics.rounds || turn_based,
        custom_kinds: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::analysis::GameCharacteristic;

    fn board_report() -> AnalysisReport {
        let mut report = AnalysisReport::custom_game();
        report.kind_tag = "board-3x3-turn-based".to_string();
        report.characteristics = vec![GameCharacteristic::Board, GameCharacteristic::TurnBased];
        report.mechanics.turns = true;
        report.mechanics.board = true;
        report.mechanics.win_condition = true;
        report.elements.board_rows = Some(3);
        report.elements.board_cols = Some(3);
        report
    }

    #[test]
    fn board_report_yields_turn_based_two_player_program() {
        let program = synthesize(&board_report());
        assert!(program.turn_based);
        assert_eq!(program.max_players, 2);
        let board = program.board.expect("board spec");
        assert_eq!((board.rows, board.cols, board.win_line), (3, 3, 3));
        assert!(program.target_score.is_none());
    }

    #[test]
    fn board_dimensions_are_required_for_a_board_spec() {
        let mut report = board_report();
        report.elements.board_rows = None;
        report.elements.board_cols = None;
        let program = synthesize(&report);
        assert!(program.board.is_none());
    }

    #[test]
    fn score_race_gets_a_target_only_with_a_win_condition() {
        let mut report = AnalysisReport::custom_game();
        report.kind_tag = "shooter-realtime".to_string();
        report.mechanics.score = true;
        report.mechanics.realtime = true;
        let program = synthesize(&report);
        assert!(program.target_score.is_none());
        assert_eq!(program.max_players, 8);

        report.mechanics.win_condition = true;
        let program = synthesize(&report);
        assert_eq!(program.target_score, Some(100));
    }

    #[test]
    fn lives_mechanic_carries_starting_lives() {
        let mut report = AnalysisReport::custom_game();
        report.kind_tag = "platformer-realtime".to_string();
        report.mechanics.lives = true;
        let program = synthesize(&report);
        assert!(program.uses_lives);
        assert_eq!(program.starting_lives, Some(3));
    }

    #[test]
    fn synthesized_program_produces_a_valid_initial_state() {
        let program = synthesize(&board_report());
        let state = crate::rules::initial_state(&program);
        assert_eq!(state["phase"], serde_json::json!("lobby"));
        assert!(state["board"].is_array());
    }
}
