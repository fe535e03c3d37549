//! Adaptive prompt construction for the document model. Sections are keyed
//! on the analysis report so the model is told exactly which multiplayer
//! affordances the output must contain.

use contracts::analysis::AnalysisReport;

/// The non-negotiable communication contract every converted document must
/// honor.
const BRIDGE_CONTRACT: &str = "\
The converted game must communicate ONLY through the injected Event Bridge \
and postMessage envelopes. It must never open sockets, call the server \
directly, or read another frame. All authoritative state arrives as \
STATE_UPDATE messages; local changes are visual-only until confirmed.";

pub fn build_prompt(report: &AnalysisReport, document: &str) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(format!(
        "Convert the following single-player {} game into a multiplayer-ready \
         document for server-validated sessions.",
        report.kind_tag
    ));

    if report.mechanics.turns {
        sections.push(
            "Add turn arbitration: render whose turn it is, disable inputs \
             out of turn, and apply MOVE results only from broadcasts."
                .to_string(),
        );
    }
    if report.mechanics.board {
        let dims = match (report.elements.board_rows, report.elements.board_cols) {
            (Some(rows), Some(cols)) => format!(" ({rows}x{cols})"),
            _ => String::new(),
        };
        sections.push(format!(
            "Synchronize the board{dims} from authoritative snapshots; cell \
             interactions emit INTERACTION events with row and col."
        ));
    }
    if report.mechanics.score {
        sections.push(
            "Track per-player scores from the players roster in broadcasts; \
             never trust a locally computed score."
                .to_string(),
        );
    }
    if report.mechanics.realtime {
        sections.push(
            "Reconcile the real-time loop against STATE_UPDATE messages: \
             interpolate remote state, roll back local prediction on \
             divergence."
                .to_string(),
        );
    }
    if report.mechanics.lives {
        sections.push(
            "Display lives per player and honor elimination flags from the \
             roster."
                .to_string(),
        );
    }
    sections.push(
        "Add lobby controls: a join flow, a player list, and a start button \
         that emits a START intent once enough players are present."
            .to_string(),
    );
    sections.push(BRIDGE_CONTRACT.to_string());
    sections.push(
        "Preserve every data-action-marker, data-state-marker, and \
         data-touch-marker attribute exactly as given. Output a single \
         complete HTML document and nothing else."
            .to_string(),
    );
    sections.push(format!("Source document:\n{document}"));

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::analysis::AnalysisReport;

    #[test]
    fn turn_based_board_prompt_carries_turn_and_board_sections() {
        let mut report = AnalysisReport::custom_game();
        report.kind_tag = "board-3x3-turn-based".to_string();
        report.mechanics.turns = true;
        report.mechanics.board = true;
        report.elements.board_rows = Some(3);
        report.elements.board_cols = Some(3);

        let prompt = build_prompt(&report, "<html></html>");
        assert!(prompt.contains("turn arbitration"));
        assert!(prompt.contains("board (3x3)"));
        assert!(prompt.contains("postMessage"));
        assert!(prompt.contains("single complete HTML document"));
    }

    #[test]
    fn realtime_prompt_asks_for_reconciliation_not_turns() {
        let mut report = AnalysisReport::custom_game();
        report.kind_tag = "canvas-realtime".to_string();
        report.mechanics.realtime = true;

        let prompt = build_prompt(&report, "<html></html>");
        assert!(prompt.contains("Reconcile the real-time loop"));
        assert!(!prompt.contains("turn arbitration"));
    }

    #[test]
    fn every_prompt_embeds_the_source_and_the_bridge_contract() {
        let report = AnalysisReport::custom_game();
        let prompt = build_prompt(&report, "<html>UNIQUE_SENTINEL</html>");
        assert!(prompt.contains("UNIQUE_SENTINEL"));
        assert!(prompt.contains("never open sockets"));
        assert!(prompt.contains("lobby controls"));
    }
}
