//! Conversion pipeline: analysis, instrumentation, the document model call,
//! validator synthesis, artifact publication, and sandbox deployment —
//! driven by a bounded worker pool consuming a queue of room ids.
//!
//! The LLM sits behind the narrow `DocumentModel` trait; the pipeline only
//! ever sees text in and text out.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use contracts::config::RoomConfig;
use contracts::{ApiError, ConversionStatus, ErrorCode, RoomRecord};
use serde_json::{json, Value};
use session_core::{analyzer, instrument, prompt, room as room_rules, rules, synthesizer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::sandbox::ValidatorSandbox;
use crate::store::{ArtifactKind, RoomStore};
use crate::time::Clock;

pub const SOURCE_REF_KEY: &str = "sourceRef";
pub const CONVERSION_ERROR_KEY: &str = "conversionError";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelError {
    pub message: String,
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "document model error: {}", self.message)
    }
}

impl std::error::Error for ModelError {}

/// Narrow text-in/text-out interface to the conversion model.
#[async_trait]
pub trait DocumentModel: Send + Sync {
    async fn convert(&self, prompt: &str) -> Result<String, ModelError>;
}

/// Scripted model for tests and the CLI's offline mode. Responses are
/// consumed in order; when the script is empty it falls back to a minimal
/// converted shell so offline conversion still yields a playable artifact.
#[derive(Debug, Default)]
pub struct ScriptedDocumentModel {
    responses: Mutex<VecDeque<Result<String, ModelError>>>,
}

impl ScriptedDocumentModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, document: impl Into<String>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(Ok(document.into()));
        }
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(Err(ModelError::new(message)));
        }
    }

    fn offline_shell(prompt: &str) -> String {
        // Carry the source through so markers survive the offline path.
        let source = prompt
            .rsplit_once("Source document:\n")
            .map(|(_, source)| source)
            .unwrap_or("");
        format!(
            "<!DOCTYPE html>\n<html>\n<body>\n<div id=\"lobby\"><button data-action-marker=\"lobby-start\">Start game</button></div>\n{source}\n</body>\n</html>"
        )
    }
}

#[async_trait]
impl DocumentModel for ScriptedDocumentModel {
    async fn convert(&self, prompt: &str) -> Result<String, ModelError> {
        let scripted = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front());
        match scripted {
            Some(result) => result,
            None => Ok(Self::offline_shell(prompt)),
        }
    }
}

/// Everything a conversion worker needs.
#[derive(Clone)]
pub struct ConversionDeps {
    pub store: Arc<dyn RoomStore>,
    pub sandbox: Arc<ValidatorSandbox>,
    pub model: Arc<dyn DocumentModel>,
    pub limits: contracts::config::SessionLimits,
    pub clock: Arc<dyn Clock>,
}

pub struct ConversionPipeline {
    tx: mpsc::UnboundedSender<String>,
    workers: Vec<JoinHandle<()>>,
}

impl ConversionPipeline {
    /// Spawns the bounded worker pool.
    pub fn spawn(deps: ConversionDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let worker_count = deps.limits.conversion_workers.max(1);

        let mut workers = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let rx = Arc::clone(&rx);
            let deps = deps.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(room_id) = job else {
                        break;
                    };
                    info!(worker = worker_index, room_id = %room_id, "conversion started");
                    run_conversion(&deps, &room_id).await;
                }
            }));
        }

        Self { tx, workers }
    }

    /// Queues a room for conversion. Returns false after shutdown.
    pub fn enqueue(&self, room_id: &str) -> bool {
        self.tx.send(room_id.to_string()).is_ok()
    }

    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

fn set_metadata(room: &mut RoomRecord, key: &str, value: Value) {
    if !room.metadata.is_object() {
        room.metadata = json!({});
    }
    if let Some(map) = room.metadata.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

pub fn metadata_str(room: &RoomRecord, key: &str) -> Option<String> {
    room.metadata
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

async fn fail_conversion(deps: &ConversionDeps, mut room: RoomRecord, error: ApiError) {
    warn!(room_id = %room.room_id, code = ?error.error_code, message = %error.message, "conversion failed");
    room.conversion_status = ConversionStatus::Failed;
    room.updated_at = deps.clock.now_ms();
    let error_json = serde_json::to_value(&error).unwrap_or(Value::Null);
    set_metadata(&mut room, CONVERSION_ERROR_KEY, error_json);
    if let Err(err) = deps.store.put_room(&room).await {
        warn!(room_id = %room.room_id, error = %err, "failed to persist conversion failure");
    }
}

/// Runs the whole pipeline for one room. Public so tests can drive it
/// synchronously; the worker pool calls the same path.
pub async fn run_conversion(deps: &ConversionDeps, room_id: &str) {
    let room = match deps.store.get_room(room_id).await {
        Ok(Some(room)) => room,
        Ok(None) => {
            warn!(room_id, "conversion requested for unknown room");
            return;
        }
        Err(err) => {
            warn!(room_id, error = %err, "conversion could not load room");
            return;
        }
    };

    match room.conversion_status {
        ConversionStatus::Complete => return,
        ConversionStatus::Processing => {
            // Another worker already owns this conversion.
            return;
        }
        ConversionStatus::Pending | ConversionStatus::Failed => {}
    }

    let mut room = room;
    let now = deps.clock.now_ms();
    if room_rules::transition_conversion(&mut room, ConversionStatus::Processing, now).is_err() {
        return;
    }
    if let Err(err) = deps.store.put_room(&room).await {
        warn!(room_id, error = %err, "could not mark room processing");
        return;
    }

    // Source document.
    let Some(source_ref) = metadata_str(&room, SOURCE_REF_KEY) else {
        let error = ApiError::new(
            ErrorCode::AnalysisFailed,
            "room has no source document",
            None,
        );
        return fail_conversion(deps, room, error).await;
    };
    let source = match deps.store.fetch_artifact(&source_ref).await {
        Ok(Some(source)) => source,
        Ok(None) => {
            let error = ApiError::new(
                ErrorCode::AnalysisFailed,
                "source document artifact is missing",
                Some(source_ref),
            );
            return fail_conversion(deps, room, error).await;
        }
        Err(err) => {
            let error = ApiError::new(
                ErrorCode::StoreFailure,
                "could not fetch source document",
                Some(err.to_string()),
            );
            return fail_conversion(deps, room, error).await;
        }
    };

    // Analysis and marker instrumentation.
    let report = analyzer::analyze(&source);
    let instrumented = instrument::inject_markers(&source, &report);

    // Model call under time and retry budgets.
    let conversion_prompt = prompt::build_prompt(&report, &instrumented);
    let mut converted = None;
    let mut last_model_error = String::new();
    for attempt in 1..=deps.limits.llm_retry_budget.max(1) {
        let call = deps.model.convert(&conversion_prompt);
        let budget = Duration::from_millis(deps.limits.llm_time_budget_ms);
        match tokio::time::timeout(budget, call).await {
            Err(_) => {
                last_model_error = "model call exceeded its time budget".to_string();
            }
            Ok(Err(err)) => {
                last_model_error = err.message;
            }
            Ok(Ok(output)) => {
                if is_complete_document(&output) {
                    converted = Some(output);
                    break;
                }
                last_model_error =
                    "model output is not a complete document (missing structure or truncated)"
                        .to_string();
            }
        }
        warn!(room_id, attempt, error = %last_model_error, "model attempt rejected");
    }
    let Some(converted) = converted else {
        let error = ApiError::new(ErrorCode::LlmFailed, "document conversion failed", Some(last_model_error));
        return fail_conversion(deps, room, error).await;
    };

    // Bridge + room config injection; markers must survive the model.
    let mut final_document = converted;
    if instrument::has_action_marker(&instrumented) && !instrument::has_action_marker(&final_document)
    {
        final_document = instrument::inject_markers(&final_document, &report);
    }
    let config = RoomConfig::new(room_id, format!("sess-{room_id}"));
    let final_document = instrument::inject_bridge(&final_document, &config);

    // Validator synthesis; the program must produce a sane initial state.
    let program = synthesizer::synthesize(&report);
    let initial_state = rules::initial_state(&program);
    if initial_state.get("phase") != Some(&json!("lobby")) {
        let error = ApiError::new(
            ErrorCode::ValidatorDeployFailed,
            "synthesized validator produced an invalid initial state",
            None,
        );
        return fail_conversion(deps, room, error).await;
    }

    // Publication.
    let document_ref = match deps
        .store
        .publish_artifact(ArtifactKind::ConvertedDocument, room_id, &final_document)
        .await
    {
        Ok(reference) => reference,
        Err(err) => {
            let error = ApiError::new(
                ErrorCode::ArtifactPublishFailed,
                "could not publish converted document",
                Some(err.to_string()),
            );
            return fail_conversion(deps, room, error).await;
        }
    };

    // Deployment. A validator reference, once assigned, is immutable for
    // the room's lifetime.
    let validator_ref = match &room.validator_ref {
        Some(existing) => existing.clone(),
        None => match deps.sandbox.deploy(room_id, &program, deps.store.as_ref()).await {
            Ok(reference) => reference,
            Err(err) => {
                let error = ApiError::new(
                    ErrorCode::ValidatorDeployFailed,
                    "could not deploy validator",
                    Some(err.to_string()),
                );
                return fail_conversion(deps, room, error).await;
            }
        },
    };

    let now = deps.clock.now_ms();
    room.kind = report.kind_tag.clone();
    room.document_ref = Some(document_ref);
    room.validator_ref = Some(validator_ref);
    if room.state.is_null() {
        room.state = initial_state;
    }
    set_metadata(&mut room, CONVERSION_ERROR_KEY, Value::Null);
    set_metadata(&mut room, "analysis", serde_json::to_value(&report).unwrap_or(Value::Null));
    if room_rules::transition_conversion(&mut room, ConversionStatus::Complete, now).is_err() {
        return;
    }
    if let Err(err) = deps.store.put_room(&room).await {
        warn!(room_id, error = %err, "could not persist completed conversion");
        return;
    }
    info!(room_id, kind = %room.kind, "conversion complete");
}

fn is_complete_document(output: &str) -> bool {
    let lowered = output.to_lowercase();
    let has_open = lowered.contains("<html") || lowered.contains("<!doctype html");
    let has_close = lowered.trim_end().ends_with("</html>");
    has_open && has_close
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteRoomStore;
    use crate::time::ManualClock;
    use contracts::config::SessionLimits;

    const SOURCE: &str = r#"
<html><body>
<div class="board">
  <div class="cell" onclick="play(0,0)"></div>
  <div class="cell" onclick="play(0,1)"></div>
  <div class="cell" onclick="play(0,2)"></div>
  <div class="cell" onclick="play(1,0)"></div>
  <div class="cell" onclick="play(1,1)"></div>
  <div class="cell" onclick="play(1,2)"></div>
  <div class="cell" onclick="play(2,0)"></div>
  <div class="cell" onclick="play(2,1)"></div>
  <div class="cell" onclick="play(2,2)"></div>
</div>
<script>let board = []; let turn = 1; function checkWinner() {}</script>
</body></html>
"#;

    async fn deps_with_model(model: Arc<ScriptedDocumentModel>) -> ConversionDeps {
        let limits = SessionLimits::default();
        ConversionDeps {
            store: Arc::new(SqliteRoomStore::open_in_memory().expect("store")),
            sandbox: Arc::new(ValidatorSandbox::new(limits.clone())),
            model,
            limits,
            clock: Arc::new(ManualClock::new(1_000)),
        }
    }

    async fn seed_room(deps: &ConversionDeps, room_id: &str) {
        let mut room = RoomRecord::new(room_id, "custom-game", 1_000);
        let source_ref = deps
            .store
            .publish_artifact(ArtifactKind::SourceDocument, room_id, SOURCE)
            .await
            .expect("publish source");
        set_metadata(&mut room, SOURCE_REF_KEY, json!(source_ref));
        deps.store.put_room(&room).await.expect("put room");
    }

    #[tokio::test]
    async fn successful_conversion_completes_with_both_artifacts() {
        let model = Arc::new(ScriptedDocumentModel::new());
        model.push_response(
            "<!DOCTYPE html><html><body><div data-action-marker=\"cell-0\"></div></body></html>",
        );
        let deps = deps_with_model(model).await;
        seed_room(&deps, "room_ok").await;

        run_conversion(&deps, "room_ok").await;

        let room = deps
            .store
            .get_room("room_ok")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(room.conversion_status, ConversionStatus::Complete);
        assert_eq!(room.kind, "board-3x3-turn-based");
        let document_ref = room.document_ref.expect("document ref");
        let validator_ref = room.validator_ref.expect("validator ref");

        let document = deps
            .store
            .fetch_artifact(&document_ref)
            .await
            .expect("fetch")
            .expect("present");
        assert!(instrument::has_bridge_bootstrap(&document));
        assert!(instrument::has_action_marker(&document));

        let program = deps
            .store
            .fetch_artifact(&validator_ref)
            .await
            .expect("fetch")
            .expect("present");
        assert!(program.contains("\"turnBased\":true"));
        assert!(room.state.get("board").is_some());
    }

    #[tokio::test]
    async fn truncated_output_is_retried_then_accepted() {
        let model = Arc::new(ScriptedDocumentModel::new());
        model.push_response("<html><body>cut off mid-doc");
        model.push_response("<html><body>ok</body></html>");
        let deps = deps_with_model(model).await;
        seed_room(&deps, "room_retry").await;

        run_conversion(&deps, "room_retry").await;

        let room = deps
            .store
            .get_room("room_retry")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(room.conversion_status, ConversionStatus::Complete);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_llm_failed_and_keep_the_source() {
        let model = Arc::new(ScriptedDocumentModel::new());
        for _ in 0..SessionLimits::default().llm_retry_budget {
            model.push_failure("model unavailable");
        }
        let deps = deps_with_model(model).await;
        seed_room(&deps, "room_bad").await;

        run_conversion(&deps, "room_bad").await;

        let room = deps
            .store
            .get_room("room_bad")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(room.conversion_status, ConversionStatus::Failed);
        let error = room
            .metadata
            .get(CONVERSION_ERROR_KEY)
            .expect("error recorded");
        assert_eq!(error.get("errorCode"), Some(&json!("LLM_FAILED")));
        // The original document is intact for retry.
        let source_ref = metadata_str(&room, SOURCE_REF_KEY).expect("source ref");
        assert!(deps
            .store
            .fetch_artifact(&source_ref)
            .await
            .expect("fetch")
            .is_some());
    }

    #[tokio::test]
    async fn failed_conversion_can_be_rerun_to_completion() {
        let model = Arc::new(ScriptedDocumentModel::new());
        for _ in 0..SessionLimits::default().llm_retry_budget {
            model.push_failure("model unavailable");
        }
        let deps = deps_with_model(Arc::clone(&model)).await;
        seed_room(&deps, "room_again").await;

        run_conversion(&deps, "room_again").await;
        model.push_response("<html><body>second try</body></html>");
        run_conversion(&deps, "room_again").await;

        let room = deps
            .store
            .get_room("room_again")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(room.conversion_status, ConversionStatus::Complete);
    }

    #[tokio::test]
    async fn completed_rooms_are_not_reconverted() {
        let model = Arc::new(ScriptedDocumentModel::new());
        model.push_response("<html><body>once</body></html>");
        let deps = deps_with_model(model).await;
        seed_room(&deps, "room_done").await;

        run_conversion(&deps, "room_done").await;
        let first = deps
            .store
            .get_room("room_done")
            .await
            .expect("get")
            .expect("present");

        run_conversion(&deps, "room_done").await;
        let second = deps
            .store
            .get_room("room_done")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn pipeline_workers_process_enqueued_rooms() {
        let model = Arc::new(ScriptedDocumentModel::new());
        model.push_response("<html><body>queued</body></html>");
        let deps = deps_with_model(model).await;
        seed_room(&deps, "room_q").await;

        let pipeline = ConversionPipeline::spawn(deps.clone());
        assert!(pipeline.enqueue("room_q"));
        pipeline.shutdown().await;

        let room = deps
            .store
            .get_room("room_q")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(room.conversion_status, ConversionStatus::Complete);
    }

    #[test]
    fn document_completeness_checks_structure_and_tail() {
        assert!(is_complete_document("<!DOCTYPE html><html><body></body></html>"));
        assert!(is_complete_document("<html></html>\n"));
        assert!(!is_complete_document("<html><body>truncat"));
        assert!(!is_complete_document("just prose, no markup"));
    }
}
