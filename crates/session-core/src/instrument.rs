//! Document instrumentation: marker injection and the bridge/config
//! bootstrap appended during conversion.
//!
//! Markers already present in the source are preserved byte-for-byte; the
//! instrumenter only adds what is missing.

use contracts::analysis::AnalysisReport;
use contracts::config::RoomConfig;
use contracts::{ACTION_MARKER, STATE_MARKER, TOUCH_MARKER};

const BRIDGE_BOOTSTRAP_ID: &str = "game-event-bridge-bootstrap";
const ROOM_CONFIG_ID: &str = "game-room-config";

/// In-document implementation of the bridge envelope contract: emit with
/// kind checking and sequence stamping, on/destroy, host-message routing by
/// room and kind, and click interception on action-marked elements. The
/// document talks to its embedding host exclusively through these
/// postMessage envelopes.
const BRIDGE_BOOTSTRAP_SCRIPT: &str = r#"(function () {
  var configEl = document.getElementById("game-room-config");
  var config = configEl ? JSON.parse(configEl.textContent || "{}") : {};
  var sequence = 0;
  var handlers = {};
  var destroyed = false;
  function emit(kind, data, priority) {
    if (destroyed) { return null; }
    if (["TRANSITION", "INTERACTION", "UPDATE", "ERROR"].indexOf(kind) < 0) { return null; }
    var event = {
      type: kind,
      data: data || {},
      metadata: {
        roomId: config.roomId,
        playerId: config.playerId || "unassigned",
        sessionId: config.sessionId,
        timestamp: Date.now(),
        sequenceNumber: sequence++,
        priority: kind === "ERROR" ? "high" : (priority || "normal")
      }
    };
    window.parent.postMessage({
      source: "GameEventBridge",
      roomId: config.roomId,
      playerId: event.metadata.playerId,
      events: [event]
    }, "*");
    return event;
  }
  function on(kind, handler) {
    (handlers[kind] = handlers[kind] || []).push(handler);
    return function () {
      handlers[kind] = (handlers[kind] || []).filter(function (entry) { return entry !== handler; });
    };
  }
  window.addEventListener("message", function (incoming) {
    var envelope = incoming.data || {};
    if (destroyed || envelope.target !== "GameEventBridge") { return; }
    if (envelope.roomId !== config.roomId) { return; }
    if (envelope.type === "CONFIG_UPDATE" && envelope.data && envelope.data.playerId) {
      config.playerId = envelope.data.playerId;
    }
    (handlers[envelope.type] || []).concat(handlers["*"] || []).forEach(function (handler) {
      handler(envelope);
    });
  });
  document.addEventListener("click", function (click) {
    var target = click.target && click.target.closest ? click.target.closest("[data-action-marker]") : null;
    if (target) {
      emit("INTERACTION", { marker: target.getAttribute("data-action-marker"), input: "click" });
    }
  });
  document.addEventListener("submit", function (submitted) {
    var target = submitted.target && submitted.target.closest ? submitted.target.closest("[data-action-marker]") : null;
    if (target) {
      emit("INTERACTION", { marker: target.getAttribute("data-action-marker"), input: "submit" });
    }
  });
  window.GameEventBridge = {
    emit: emit,
    on: on,
    destroy: function () { destroyed = true; handlers = {}; }
  };
})();"#;

/// Tags that represent interactive intent when no explicit handler marks
/// them otherwise.
const INTERACTIVE_TAGS: [&str; 3] = ["<button", "<input", "<select"];

pub fn has_action_marker(document: &str) -> bool {
    document.contains(ACTION_MARKER)
}

pub fn has_bridge_bootstrap(document: &str) -> bool {
    document.contains(BRIDGE_BOOTSTRAP_ID)
}

/// Adds action/state/touch markers to inferred elements. Elements that
/// already carry a marker keep it verbatim.
pub fn inject_markers(document: &str, report: &AnalysisReport) -> String {
    let mut output = String::with_capacity(document.len() + 256);
    let mut cursor = 0;
    let mut action_index = 0;

    while let Some((tag_start, tag_end)) = next_tag(document, cursor) {
        output.push_str(&document[cursor..tag_start]);
        let tag = &document[tag_start..tag_end];
        output.push_str(&instrument_tag(tag, report, &mut action_index));
        cursor = tag_end;
    }
    output.push_str(&document[cursor..]);
    output
}

fn next_tag(document: &str, from: usize) -> Option<(usize, usize)> {
    let offset = document[from..].find('<')?;
    let start = from + offset;
    let end_rel = document[start..].find('>')?;
    Some((start, start + end_rel + 1))
}

fn instrument_tag(tag: &str, report: &AnalysisReport, action_index: &mut usize) -> String {
    let lowered = tag.to_lowercase();

    let interactive = INTERACTIVE_TAGS
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
        || lowered.contains("onclick");
    if interactive && !lowered.contains(ACTION_MARKER) {
        let marker_value = format!("action-{}", *action_index);
        *action_index += 1;
        let mut instrumented = insert_attribute(tag, ACTION_MARKER, &marker_value);
        if report.interactions.touch && !lowered.contains(TOUCH_MARKER) {
            instrumented = insert_attribute(&instrumented, TOUCH_MARKER, &marker_value);
        }
        return instrumented;
    }

    // Elements whose id names a known state variable display state.
    if !lowered.contains(STATE_MARKER) {
        if let Some(id) = tag_attribute(tag, "id=") {
            let id_lowered = id.to_lowercase();
            let is_state_display = report
                .state_management
                .state_variables
                .iter()
                .any(|name| id_lowered.contains(name.as_str()))
                || ["score", "lives", "level", "status", "turn", "timer"]
                    .iter()
                    .any(|hint| id_lowered.contains(hint));
            if is_state_display {
                return insert_attribute(tag, STATE_MARKER, &id);
            }
        }
    }

    tag.to_string()
}

fn insert_attribute(tag: &str, attribute: &str, value: &str) -> String {
    // Self-closing tags keep their slash at the end.
    let insert_at = if tag.ends_with("/>") {
        tag.len() - 2
    } else {
        tag.len() - 1
    };
    format!(
        "{} {}=\"{}\"{}",
        &tag[..insert_at].trim_end(),
        attribute,
        value,
        &tag[insert_at..]
    )
}

fn tag_attribute(tag: &str, prefix: &str) -> Option<String> {
    let start = tag.find(prefix)? + prefix.len();
    let rest = &tag[start..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let inner = &rest[1..];
    let end = inner.find(quote)?;
    Some(inner[..end].to_string())
}

/// Appends the bridge bootstrap and the serialized room configuration.
/// Idempotent: a document that already carries the bootstrap is returned
/// unchanged.
pub fn inject_bridge(document: &str, config: &RoomConfig) -> String {
    if has_bridge_bootstrap(document) {
        return document.to_string();
    }

    let config_json =
        serde_json::to_string(config).unwrap_or_else(|_| "{}".to_string());
    let injection = format!(
        "<script id=\"{ROOM_CONFIG_ID}\" type=\"application/json\">{config_json}</script>\n\
         <script id=\"{BRIDGE_BOOTSTRAP_ID}\">{BRIDGE_BOOTSTRAP_SCRIPT}</script>\n"
    );

    match document.rfind("</body>") {
        Some(index) => {
            let mut output = String::with_capacity(document.len() + injection.len());
            output.push_str(&document[..index]);
            output.push_str(&injection);
            output.push_str(&document[index..]);
            output
        }
        None => {
            let mut output = document.to_string();
            output.push('\n');
            output.push_str(&injection);
            output
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;

    const SOURCE: &str = r#"
<html><body>
<div id="score">0</div>
<button id="roll" onclick="roll()">Roll dice</button>
<button data-action-marker="custom-roll" id="keep">Keep</button>
<script>
let score = 0;
let turn = 1;
function roll() { score += Math.floor(Math.random() * 6) + 1; }
</script>
</body></html>
"#;

    #[test]
    fn interactive_elements_receive_action_markers() {
        let report = analyze(SOURCE);
        let instrumented = inject_markers(SOURCE, &report);
        assert!(instrumented.contains("data-action-marker=\"action-0\""));
    }

    #[test]
    fn existing_markers_are_preserved_verbatim() {
        let report = analyze(SOURCE);
        let instrumented = inject_markers(SOURCE, &report);
        assert!(instrumented.contains("data-action-marker=\"custom-roll\""));
        // The pre-marked button did not get a second action marker.
        let marked_button = instrumented
            .lines()
            .find(|line| line.contains("custom-roll"))
            .expect("marked button present");
        assert_eq!(marked_button.matches(ACTION_MARKER).count(), 1);
    }

    #[test]
    fn state_displays_receive_state_markers() {
        let report = analyze(SOURCE);
        let instrumented = inject_markers(SOURCE, &report);
        assert!(instrumented.contains("data-state-marker=\"score\""));
    }

    #[test]
    fn bridge_injection_lands_before_body_close_and_is_idempotent() {
        let config = RoomConfig::new("room_7", "sess_7");
        let once = inject_bridge(SOURCE, &config);
        assert!(has_bridge_bootstrap(&once));
        let body_close = once.rfind("</body>").expect("body close");
        let bootstrap = once.find(BRIDGE_BOOTSTRAP_ID).expect("bootstrap");
        assert!(bootstrap < body_close);
        assert!(once.contains("\"roomId\":\"room_7\""));

        let twice = inject_bridge(&once, &config);
        assert_eq!(once, twice);
    }

    #[test]
    fn bootstrap_implements_the_envelope_contract() {
        let config = RoomConfig::new("room_7", "sess_7");
        let output = inject_bridge(SOURCE, &config);
        // emit posts envelopes to the host; inbound routing filters by
        // target and room; marked elements are intercepted.
        assert!(output.contains("window.parent.postMessage"));
        assert!(output.contains("source: \"GameEventBridge\""));
        assert!(output.contains("sequenceNumber: sequence++"));
        assert!(output.contains("envelope.roomId !== config.roomId"));
        assert!(output.contains("[data-action-marker]"));
        assert!(output.contains("destroy: function"));
    }

    #[test]
    fn bridge_injection_appends_when_no_body_tag() {
        let config = RoomConfig::new("room_7", "sess_7");
        let output = inject_bridge("<div>bare fragment</div>", &config);
        assert!(has_bridge_bootstrap(&output));
    }

    #[test]
    fn touch_games_get_touch_markers_alongside_action_markers() {
        let source = r#"
<html><body>
<button id="tap" onclick="tap()">Tap</button>
<script>document.addEventListener("touchstart", tap);</script>
</body></html>
"#;
        let report = analyze(source);
        assert!(report.interactions.touch);
        let instrumented = inject_markers(source, &report);
        assert!(instrumented.contains(TOUCH_MARKER));
    }
}
