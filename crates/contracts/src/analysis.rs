//! Structural report produced by the game analyzer. Drives prompt
//! construction, validator synthesis, and marker injection.

use serde::{Deserialize, Serialize};

use crate::SCHEMA_VERSION_V1;

/// Detected game characteristics, listed in tie-break priority order:
/// an earlier variant wins over a later one when signal weights tie.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GameCharacteristic {
    Shooter,
    Platformer,
    Racing,
    Rpg,
    Card,
    Dice,
    Word,
    Quiz,
    Puzzle,
    Strategy,
    Board,
    TurnBased,
    Realtime,
    Canvas,
}

impl GameCharacteristic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shooter => "shooter",
            Self::Platformer => "platformer",
            Self::Racing => "racing",
            Self::Rpg => "rpg",
            Self::Card => "card",
            Self::Dice => "dice",
            Self::Word => "word",
            Self::Quiz => "quiz",
            Self::Puzzle => "puzzle",
            Self::Strategy => "strategy",
            Self::Board => "board",
            Self::TurnBased => "turn-based",
            Self::Realtime => "realtime",
            Self::Canvas => "canvas",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MechanicsProfile {
    pub turns: bool,
    pub board: bool,
    pub score: bool,
    pub timer: bool,
    pub levels: bool,
    pub lives: bool,
    pub realtime: bool,
    pub win_condition: bool,
    pub physics: bool,
    pub rounds: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElementsInventory {
    pub button_labels: Vec<String>,
    pub button_ids: Vec<String>,
    pub has_form: bool,
    pub has_canvas: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_rows: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_cols: Option<u8>,
    pub cell_count: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InteractionsInventory {
    pub click_targets: usize,
    pub draggable: bool,
    pub keyboard: bool,
    pub touch: bool,
    pub gamepad: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateInventory {
    pub state_markers: Vec<String>,
    pub uses_storage: bool,
    pub state_variables: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInventory {
    pub websockets: bool,
    pub http: bool,
    pub peer: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityBucket {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub schema_version: String,
    /// Free-form tag composed from detected characteristics, e.g.
    /// `board-3x3-turn-based` or `canvas-realtime`. `custom-game` when no
    /// signal passed threshold.
    pub kind_tag: String,
    pub characteristics: Vec<GameCharacteristic>,
    pub mechanics: MechanicsProfile,
    pub elements: ElementsInventory,
    pub interactions: InteractionsInventory,
    pub state_management: StateInventory,
    pub network: NetworkInventory,
    pub complexity_score: u32,
    pub complexity: ComplexityBucket,
}

impl AnalysisReport {
    pub fn custom_game() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            kind_tag: "custom-game".to_string(),
            characteristics: Vec::new(),
            mechanics: MechanicsProfile::default(),
            elements: ElementsInventory::default(),
            interactions: InteractionsInventory::default(),
            state_management: StateInventory::default(),
            network: NetworkInventory::default(),
            complexity_score: 0,
            complexity: ComplexityBucket::Simple,
        }
    }

    pub fn is_turn_based(&self) -> bool {
        self.mechanics.turns
            || self
                .characteristics
                .contains(&GameCharacteristic::TurnBased)
            || self.characteristics.contains(&GameCharacteristic::Board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn characteristic_priority_follows_declaration_order() {
        assert!(GameCharacteristic::Shooter < GameCharacteristic::Board);
        assert!(GameCharacteristic::Board < GameCharacteristic::TurnBased);
        assert!(GameCharacteristic::TurnBased < GameCharacteristic::Canvas);
    }

    #[test]
    fn report_round_trip() {
        let mut report = AnalysisReport::custom_game();
        report.kind_tag = "board-3x3-turn-based".to_string();
        report.characteristics = vec![GameCharacteristic::Board, GameCharacteristic::TurnBased];
        report.mechanics.turns = true;
        report.mechanics.board = true;
        report.elements.board_rows = Some(3);
        report.elements.board_cols = Some(3);
        report.elements.cell_count = 9;

        let encoded = serde_json::to_string(&report).expect("serialize report");
        let decoded: AnalysisReport = serde_json::from_str(&encoded).expect("deserialize report");
        assert_eq!(report, decoded);
        assert!(report.is_turn_based());
    }
}
