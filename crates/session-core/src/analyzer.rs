//! Static inspection of a source game document. Produces the structural
//! report that drives prompt construction, validator synthesis, and marker
//! injection.
//!
//! Everything here is a weighted pattern scan over the document text. The
//! analyzer is best-effort by contract: it degrades to a `custom-game`
//! report rather than failing the pipeline.

use contracts::analysis::{
    AnalysisReport, ComplexityBucket, ElementsInventory, GameCharacteristic, InteractionsInventory,
    MechanicsProfile, NetworkInventory, StateInventory,
};
use contracts::{SCHEMA_VERSION_V1, STATE_MARKER};

/// Minimum weighted score for a characteristic to count as detected.
const CHARACTERISTIC_THRESHOLD: u32 = 2;

pub fn analyze(document: &str) -> AnalysisReport {
    if document.trim().is_empty() {
        return AnalysisReport::custom_game();
    }

    let lowered = document.to_lowercase();
    // Signals found only inside comments are not trusted on their own.
    let code = strip_comments(&lowered);

    let characteristics = detect_characteristics(&code);
    let mechanics = detect_mechanics(&code, &characteristics);
    let elements = inventory_elements(document, &lowered, &code);
    let interactions = inventory_interactions(&code);
    let state_management = inventory_state(document, &code);
    let network = inventory_network(&code);

    let complexity_score = complexity_score(
        document,
        &characteristics,
        &mechanics,
        &elements,
        &interactions,
    );
    let complexity = match complexity_score {
        0..=9 => ComplexityBucket::Simple,
        10..=24 => ComplexityBucket::Moderate,
        _ => ComplexityBucket::Complex,
    };

    let kind_tag = compose_kind_tag(&characteristics, &mechanics, &elements);

    AnalysisReport {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        kind_tag,
        characteristics,
        mechanics,
        elements,
        interactions,
        state_management,
        network,
        complexity_score,
        complexity,
    }
}

/// Keyword signals per characteristic, with a specificity weight. More
/// specific genres carry heavier weights so a single strong signal beats a
/// pile of generic ones.
fn signal_table() -> Vec<(GameCharacteristic, u32, Vec<&'static str>)> {
    vec![
        (
            GameCharacteristic::Shooter,
            3,
            vec!["shoot", "bullet", "ammo", "laser", "enemy wave"],
        ),
        (
            GameCharacteristic::Platformer,
            3,
            vec!["platform", "jump height", "gravity", "side-scroll"],
        ),
        (
            GameCharacteristic::Racing,
            3,
            vec!["lap", "racetrack", "finish line", "speedometer"],
        ),
        (
            GameCharacteristic::Rpg,
            3,
            vec!["inventory", "quest", "mana", "experience points"],
        ),
        (
            GameCharacteristic::Card,
            2,
            vec!["card", "deck", "shuffle", "discard"],
        ),
        (GameCharacteristic::Dice, 2, vec!["dice", "die roll", "roll the"]),
        (
            GameCharacteristic::Word,
            2,
            vec!["word", "letter", "vowel", "spelling"],
        ),
        (
            GameCharacteristic::Quiz,
            2,
            vec!["quiz", "question", "correct answer", "trivia"],
        ),
        (
            GameCharacteristic::Puzzle,
            2,
            vec!["puzzle", "tile", "swap", "match three", "match-3"],
        ),
        (
            GameCharacteristic::Strategy,
            1,
            vec!["strategy", "build order", "resource"],
        ),
        (
            GameCharacteristic::Board,
            1,
            vec!["board", "cell", "grid", "row", "column"],
        ),
        (
            GameCharacteristic::TurnBased,
            1,
            vec!["turn", "current player", "your move"],
        ),
        (
            GameCharacteristic::Realtime,
            1,
            vec!["requestanimationframe", "setinterval", "fps", "game loop"],
        ),
        (GameCharacteristic::Canvas, 1, vec!["<canvas", "getcontext"]),
    ]
}

fn detect_characteristics(code: &str) -> Vec<GameCharacteristic> {
    let mut scored: Vec<(GameCharacteristic, u32)> = Vec::new();
    for (characteristic, weight, keywords) in signal_table() {
        let hits: u32 = keywords
            .iter()
            .map(|keyword| count_occurrences(code, keyword) as u32)
            .sum();
        let score = hits.min(8) * weight;
        if score >= CHARACTERISTIC_THRESHOLD {
            scored.push((characteristic, score));
        }
    }
    // Highest score first; ties broken by the documented priority order
    // (the enum's declaration order).
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    scored
        .into_iter()
        .map(|(characteristic, _)| characteristic)
        .collect()
}

fn detect_mechanics(code: &str, characteristics: &[GameCharacteristic]) -> MechanicsProfile {
    MechanicsProfile {
        turns: contains_any(code, &["turn", "current player", "next player"]),
        board: characteristics.contains(&GameCharacteristic::Board)
            || contains_any(code, &["board", "grid"]),
        score: contains_any(code, &["score", "points", "highscore"]),
        timer: contains_any(code, &["timer", "countdown", "time left", "timeout"]),
        levels: contains_any(code, &["level", "stage ", "next stage"]),
        lives: contains_any(code, &["lives", "life count", "hearts"]),
        realtime: contains_any(code, &["requestanimationframe", "setinterval", "game loop"]),
        win_condition: contains_any(code, &["winner", "you win", "game over", "victory"]),
        physics: contains_any(code, &["velocity", "gravity", "collision", "friction"]),
        rounds: contains_any(code, &["round", "best of"]),
    }
}

fn inventory_elements(document: &str, lowered: &str, code: &str) -> ElementsInventory {
    let (button_labels, button_ids) = extract_buttons(document);
    let cell_count = count_occurrences(lowered, "class=\"cell")
        + count_occurrences(lowered, "class='cell")
        + count_occurrences(lowered, "data-cell");
    let (board_rows, board_cols) = infer_board_dimensions(code, cell_count);

    ElementsInventory {
        button_labels,
        button_ids,
        has_form: lowered.contains("<form"),
        has_canvas: lowered.contains("<canvas"),
        board_rows,
        board_cols,
        cell_count,
    }
}

fn inventory_interactions(code: &str) -> InteractionsInventory {
    let click_targets = count_occurrences(code, "onclick")
        + count_occurrences(code, "addeventlistener(\"click")
        + count_occurrences(code, "addeventlistener('click");
    InteractionsInventory {
        click_targets,
        draggable: contains_any(code, &["draggable", "dragstart", "ondrop"]),
        keyboard: contains_any(code, &["keydown", "keyup", "keypress"]),
        touch: contains_any(code, &["touchstart", "touchend", "ontouch"]),
        gamepad: contains_any(code, &["getgamepads", "gamepadconnected"]),
    }
}

fn inventory_state(document: &str, code: &str) -> StateInventory {
    StateInventory {
        state_markers: extract_attribute_values(document, STATE_MARKER),
        uses_storage: contains_any(code, &["localstorage", "sessionstorage", "indexeddb"]),
        state_variables: extract_state_variables(code),
    }
}

fn inventory_network(code: &str) -> NetworkInventory {
    NetworkInventory {
        websockets: contains_any(code, &["websocket", "socket.io"]),
        http: contains_any(code, &["fetch(", "xmlhttprequest", "axios"]),
        peer: contains_any(code, &["rtcpeerconnection", "peerjs", "datachannel"]),
    }
}

fn complexity_score(
    document: &str,
    characteristics: &[GameCharacteristic],
    mechanics: &MechanicsProfile,
    elements: &ElementsInventory,
    interactions: &InteractionsInventory,
) -> u32 {
    let mut score = (document.len() / 2_000) as u32;
    score += characteristics.len() as u32 * 2;
    score += [
        mechanics.turns,
        mechanics.board,
        mechanics.score,
        mechanics.timer,
        mechanics.levels,
        mechanics.lives,
        mechanics.realtime,
        mechanics.win_condition,
        mechanics.physics,
        mechanics.rounds,
    ]
    .iter()
    .filter(|flag| **flag)
    .count() as u32;
    score += (elements.button_labels.len() as u32).min(6);
    if elements.has_canvas {
        score += 3;
    }
    score += (interactions.click_targets as u32).min(6);
    score
}

fn compose_kind_tag(
    characteristics: &[GameCharacteristic],
    mechanics: &MechanicsProfile,
    elements: &ElementsInventory,
) -> String {
    let Some(primary) = characteristics.first().copied() else {
        return "custom-game".to_string();
    };

    let mut tag = match (primary, elements.board_rows, elements.board_cols) {
        (GameCharacteristic::Board, Some(rows), Some(cols)) => format!("board-{rows}x{cols}"),
        _ => primary.as_str().to_string(),
    };

    let turn_signal = mechanics.turns
        || characteristics.contains(&GameCharacteristic::TurnBased);
    if turn_signal && primary != GameCharacteristic::TurnBased {
        tag.push_str("-turn-based");
    } else if mechanics.realtime && primary != GameCharacteristic::Realtime {
        tag.push_str("-realtime");
    }

    tag
}

/// Board dimensions require an explicit `NxN` token or a counted square
/// cell population; guessed values are never reported.
fn infer_board_dimensions(code: &str, cell_count: usize) -> (Option<u8>, Option<u8>) {
    if let Some((rows, cols)) = find_dimension_token(code) {
        return (Some(rows), Some(cols));
    }
    if cell_count > 0 {
        let root = (cell_count as f64).sqrt() as usize;
        if root >= 2 && root * root == cell_count {
            return (Some(root as u8), Some(root as u8));
        }
    }
    (None, None)
}

fn find_dimension_token(code: &str) -> Option<(u8, u8)> {
    let bytes = code.as_bytes();
    for (index, window) in bytes.windows(3).enumerate() {
        if window[1] == b'x' && window[0].is_ascii_digit() && window[2].is_ascii_digit() {
            // Reject tokens embedded in longer numbers (e.g. "13x37").
            let before_ok = index == 0 || !bytes[index - 1].is_ascii_digit();
            let after_ok = index + 3 >= bytes.len() || !bytes[index + 3].is_ascii_digit();
            if before_ok && after_ok {
                let rows = window[0] - b'0';
                let cols = window[2] - b'0';
                if rows >= 2 && cols >= 2 {
                    return Some((rows, cols));
                }
            }
        }
    }
    None
}

fn extract_buttons(document: &str) -> (Vec<String>, Vec<String>) {
    let mut labels = Vec::new();
    let mut ids = Vec::new();
    let lowered = document.to_lowercase();
    // Byte offsets are shared between the two strings; fall back to the
    // original when lowercasing changed the length (non-ASCII input).
    let haystack: &str = if lowered.len() == document.len() {
        &lowered
    } else {
        document
    };
    let mut cursor = 0;

    while let Some(offset) = haystack[cursor..].find("<button") {
        let tag_start = cursor + offset;
        let Some(tag_end_rel) = document[tag_start..].find('>') else {
            break;
        };
        let tag_end = tag_start + tag_end_rel;
        let tag_text = &document[tag_start..tag_end];
        if let Some(id) = extract_quoted(tag_text, "id=") {
            ids.push(id);
        }
        if let Some(close_rel) = haystack[tag_end..].find("</button") {
            if close_rel > 0 {
                let label = document[tag_end + 1..tag_end + close_rel].trim();
                if !label.is_empty() && label.len() <= 64 {
                    labels.push(label.to_string());
                }
            }
            cursor = tag_end + close_rel.max(1);
        } else {
            cursor = tag_end + 1;
        }
    }

    (labels, ids)
}

fn extract_attribute_values(document: &str, attribute: &str) -> Vec<String> {
    let needle = format!("{attribute}=");
    let mut values = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = document[cursor..].find(&needle) {
        let start = cursor + offset;
        if let Some(value) = extract_quoted(&document[start..], &needle) {
            if !values.contains(&value) {
                values.push(value);
            }
        }
        cursor = start + needle.len();
    }
    values
}

fn extract_quoted(text: &str, prefix: &str) -> Option<String> {
    let start = text.find(prefix)? + prefix.len();
    let rest = &text[start..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let inner = &rest[1..];
    let end = inner.find(quote)?;
    Some(inner[..end].to_string())
}

const STATE_VARIABLE_HINTS: [&str; 9] = [
    "score", "lives", "level", "board", "turn", "state", "counter", "health", "round",
];

fn extract_state_variables(code: &str) -> Vec<String> {
    let mut variables = Vec::new();
    for line in code.lines() {
        let trimmed = line.trim_start();
        for keyword in ["let ", "var ", "const "] {
            if let Some(rest) = trimmed.strip_prefix(keyword) {
                let name: String = rest
                    .chars()
                    .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
                    .collect();
                if !name.is_empty()
                    && STATE_VARIABLE_HINTS.iter().any(|hint| name.contains(hint))
                    && !variables.contains(&name)
                {
                    variables.push(name);
                }
            }
        }
    }
    variables
}

fn contains_any(code: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| code.contains(keyword))
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut cursor = 0;
    while let Some(offset) = haystack[cursor..].find(needle) {
        count += 1;
        cursor += offset + needle.len();
    }
    count
}

/// Removes HTML comments and JS block/line comments so comment-only signals
/// cannot drive classification by themselves.
fn strip_comments(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if text[index..].starts_with("<!--") {
            match text[index..].find("-->") {
                Some(end) => index += end + 3,
                None => break,
            }
        } else if text[index..].starts_with("/*") {
            match text[index..].find("*/") {
                Some(end) => index += end + 2,
                None => break,
            }
        } else if text[index..].starts_with("//") && (index == 0 || bytes[index - 1] != b':') {
            match text[index..].find('\n') {
                Some(end) => index += end,
                None => break,
            }
        } else {
            let ch = text[index..].chars().next().unwrap_or('\0');
            output.push(ch);
            index += ch.len_utf8();
        }
    }

    output
}
