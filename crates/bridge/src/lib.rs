//! Client-side Event Bridge: a state machine with explicit queues that lets
//! a sandboxed game document emit events to its host and receive
//! authoritative updates back.
//!
//! The host transport is a trait so the bridge can be driven entirely
//! in-process. Time never comes from the ambient clock; callers drive the
//! bridge with `tick(now_ms)`.

pub mod sync;

use std::collections::VecDeque;
use std::fmt;

use contracts::config::RoomConfig;
use contracts::events::{
    BridgeEnvelope, BridgeEvent, BridgeEventKind, EventMetadata, EventPriority, HostEnvelope,
    HostMessageKind, UpdateScope,
};
use serde_json::{json, Value};

const DEFAULT_QUEUE_CAPACITY: usize = 512;
const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_MS: u64 = 5_000;

/// Where the bridge posts batch envelopes. Implemented by the embedding
/// shell; tests use an in-memory sink.
pub trait HostSink {
    fn post(&mut self, envelope: &BridgeEnvelope) -> Result<(), HostSendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSendError {
    pub message: String,
}

impl fmt::Display for HostSendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host send failed: {}", self.message)
    }
}

impl std::error::Error for HostSendError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// `emit` was called with a kind outside the event set.
    InvalidKind(String),
    /// The bridge was destroyed and accepts no further events.
    Destroyed,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKind(kind) => write!(f, "INVALID_KIND: {kind}"),
            Self::Destroyed => write!(f, "bridge destroyed"),
        }
    }
}

impl std::error::Error for BridgeError {}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    pub priority: EventPriority,
    pub scope: Option<UpdateScope>,
}

impl EmitOptions {
    pub fn high_priority() -> Self {
        Self {
            priority: EventPriority::High,
            scope: None,
        }
    }

    pub fn local_update() -> Self {
        Self {
            priority: EventPriority::Normal,
            scope: Some(UpdateScope::Local),
        }
    }
}

/// Input kinds the auto-interception layer reports for marked elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Click,
    KeyPress,
    Submit,
    Touch,
}

impl InputKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::KeyPress => "keypress",
            Self::Submit => "submit",
            Self::Touch => "touch",
        }
    }
}

/// Handle returned by `on`; pass to `off` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

/// Subscription filter: a concrete host message kind or the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFilter {
    Kind(HostMessageKind),
    Any,
}

type HostHandler = Box<dyn FnMut(&HostEnvelope)>;
type ErrorHandler = Box<dyn FnMut(&BridgeEvent)>;

struct Subscription {
    id: u64,
    filter: SubscriptionFilter,
    handler: HostHandler,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub batches_sent: u64,
    pub send_failures: u64,
    pub unknown_host_messages: u64,
}

pub struct GameEventBridge<S: HostSink> {
    config: RoomConfig,
    sink: S,
    queue: VecDeque<BridgeEvent>,
    queue_capacity: usize,
    next_sequence: u64,
    last_flush_ms: u64,
    consecutive_failures: u32,
    retry_not_before_ms: u64,
    subscriptions: Vec<Subscription>,
    error_handlers: Vec<ErrorHandler>,
    next_subscription_id: u64,
    destroyed: bool,
    stats: BridgeStats,
}

impl<S: HostSink> GameEventBridge<S> {
    pub fn new(config: RoomConfig, sink: S) -> Self {
        Self {
            config,
            sink,
            queue: VecDeque::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            next_sequence: 0,
            last_flush_ms: 0,
            consecutive_failures: 0,
            retry_not_before_ms: 0,
            subscriptions: Vec::new(),
            error_handlers: Vec::new(),
            next_subscription_id: 0,
            destroyed: false,
            stats: BridgeStats::default(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Records an event. The returned event carries the stamped metadata,
    /// including the session-scoped strictly monotonic sequence number.
    pub fn emit(
        &mut self,
        kind: BridgeEventKind,
        data: Value,
        options: EmitOptions,
        now_ms: u64,
    ) -> Result<BridgeEvent, BridgeError> {
        if self.destroyed {
            return Err(BridgeError::Destroyed);
        }

        let sequence_number = self.next_sequence;
        self.next_sequence += 1;

        let event = BridgeEvent {
            kind,
            data,
            metadata: EventMetadata {
                room_id: self.config.room_id.clone(),
                player_id: self
                    .config
                    .player_id
                    .clone()
                    .unwrap_or_else(|| "unassigned".to_string()),
                session_id: self.config.session_id.clone(),
                timestamp: now_ms,
                sequence_number,
                priority: if kind == BridgeEventKind::Error {
                    EventPriority::High
                } else {
                    options.priority
                },
                scope: options.scope,
            },
        };

        self.enqueue(event.clone());
        self.stats.events_emitted += 1;

        if event.metadata.priority == EventPriority::High {
            self.flush(now_ms);
        } else {
            self.tick(now_ms);
        }

        Ok(event)
    }

    /// String-typed variant for game code that passes raw kind tags.
    pub fn emit_raw(
        &mut self,
        kind: &str,
        data: Value,
        options: EmitOptions,
        now_ms: u64,
    ) -> Result<BridgeEvent, BridgeError> {
        let parsed = match kind {
            "TRANSITION" => BridgeEventKind::Transition,
            "INTERACTION" => BridgeEventKind::Interaction,
            "UPDATE" => BridgeEventKind::Update,
            "ERROR" => BridgeEventKind::Error,
            other => return Err(BridgeError::InvalidKind(other.to_string())),
        };
        self.emit(parsed, data, options, now_ms)
    }

    /// Reports an input gesture on an element bearing the action or touch
    /// marker. Non-marked elements are never observed, so there is no
    /// unmarked entry point.
    pub fn observe_interaction(
        &mut self,
        marker_value: &str,
        input: InputKind,
        now_ms: u64,
    ) -> Result<BridgeEvent, BridgeError> {
        self.emit(
            BridgeEventKind::Interaction,
            json!({ "marker": marker_value, "input": input.as_str() }),
            EmitOptions::default(),
            now_ms,
        )
    }

    /// Reports a mutation of a state-marker element.
    pub fn observe_state_change(
        &mut self,
        marker_value: &str,
        old: Value,
        new: Value,
        now_ms: u64,
    ) -> Result<BridgeEvent, BridgeError> {
        self.emit(
            BridgeEventKind::Update,
            json!({ "marker": marker_value, "old": old, "new": new }),
            EmitOptions::local_update(),
            now_ms,
        )
    }

    /// Subscribes to host messages. `SubscriptionFilter::Any` receives every
    /// kind.
    pub fn on(
        &mut self,
        filter: SubscriptionFilter,
        handler: impl FnMut(&HostEnvelope) + 'static,
    ) -> SubscriptionHandle {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        self.subscriptions.push(Subscription {
            id,
            filter,
            handler: Box::new(handler),
        });
        SubscriptionHandle(id)
    }

    pub fn off(&mut self, handle: SubscriptionHandle) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|sub| sub.id != handle.0);
        self.subscriptions.len() != before
    }

    /// Registers a handler for bridge-local `ERROR` events (hosts may never
    /// see these when the transport itself is failing).
    pub fn on_error(&mut self, handler: impl FnMut(&BridgeEvent) + 'static) {
        self.error_handlers.push(Box::new(handler));
    }

    /// Routes a host message to subscribers. Messages for other rooms are
    /// ignored.
    pub fn receive_host_message(&mut self, envelope: &HostEnvelope) {
        if self.destroyed || envelope.room_id != self.config.room_id {
            return;
        }
        if envelope.kind == HostMessageKind::ConfigUpdate {
            self.apply_config_update(&envelope.data);
        }
        for sub in &mut self.subscriptions {
            let matches = match sub.filter {
                SubscriptionFilter::Any => true,
                SubscriptionFilter::Kind(kind) => kind == envelope.kind,
            };
            if matches {
                (sub.handler)(envelope);
            }
        }
    }

    /// Raw entry point for untyped host payloads; unknown kinds are counted
    /// and dropped.
    pub fn receive_raw(&mut self, raw: &Value) {
        match serde_json::from_value::<HostEnvelope>(raw.clone()) {
            Ok(envelope) => self.receive_host_message(&envelope),
            Err(_) => {
                self.stats.unknown_host_messages += 1;
            }
        }
    }

    /// Drives batching. Flushes when the batch interval has elapsed or the
    /// queue reached the batch size threshold.
    pub fn tick(&mut self, now_ms: u64) {
        if self.destroyed || self.queue.is_empty() {
            return;
        }
        let interval_elapsed =
            now_ms.saturating_sub(self.last_flush_ms) >= self.config.batching.interval_ms;
        let size_reached = self.queue.len() >= self.config.batching.max_events;
        if interval_elapsed || size_reached {
            self.flush(now_ms);
        }
    }

    /// Flushes every queued event in emit order as one envelope. On send
    /// failure the batch is requeued, a local ERROR is delivered, and
    /// further sends back off linearly.
    pub fn flush(&mut self, now_ms: u64) {
        if self.queue.is_empty() {
            return;
        }
        if now_ms < self.retry_not_before_ms {
            return;
        }

        let events: Vec<BridgeEvent> = self.queue.drain(..).collect();
        let envelope = BridgeEnvelope::new(
            self.config.room_id.clone(),
            self.config
                .player_id
                .clone()
                .unwrap_or_else(|| "unassigned".to_string()),
            events,
        );

        match self.sink.post(&envelope) {
            Ok(()) => {
                self.stats.batches_sent += 1;
                self.consecutive_failures = 0;
                self.retry_not_before_ms = 0;
                self.last_flush_ms = now_ms;
            }
            Err(err) => {
                self.stats.send_failures += 1;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let backoff = (BACKOFF_BASE_MS * u64::from(self.consecutive_failures))
                    .min(BACKOFF_CAP_MS);
                self.retry_not_before_ms = now_ms + backoff;

                // Requeue in order, then report locally; the host never saw
                // this batch.
                for event in envelope.events.into_iter().rev() {
                    self.queue.push_front(event);
                }
                self.report_local_error(&err, now_ms);
            }
        }
    }

    /// Flushes queued events and terminates auto-interception and routing.
    pub fn destroy(&mut self, now_ms: u64) {
        if self.destroyed {
            return;
        }
        self.retry_not_before_ms = 0;
        self.flush(now_ms);
        self.destroyed = true;
        self.subscriptions.clear();
        self.error_handlers.clear();
        self.queue.clear();
    }

    fn apply_config_update(&mut self, data: &Value) {
        if let Some(player_id) = data.get("playerId").and_then(Value::as_str) {
            self.config.player_id = Some(player_id.to_string());
        }
        if let Some(interval) = data.get("batchIntervalMs").and_then(Value::as_u64) {
            self.config.batching.interval_ms = interval;
        }
        if let Some(max_events) = data.get("batchMaxEvents").and_then(Value::as_u64) {
            self.config.batching.max_events = max_events.max(1) as usize;
        }
    }

    fn enqueue(&mut self, event: BridgeEvent) {
        if self.queue.len() >= self.queue_capacity {
            if !self.make_room() && event.kind != BridgeEventKind::Error {
                // Nothing droppable (queue holds only ERROR events); the
                // incoming non-ERROR event is the lowest priority present.
                self.stats.events_dropped += 1;
                return;
            }
        }
        self.queue.push_back(event);
    }

    /// Drops the oldest most-droppable event: UPDATE first, then
    /// INTERACTION, then TRANSITION. ERROR is never dropped.
    fn make_room(&mut self) -> bool {
        for rank in 0..=2_u8 {
            if let Some(index) = self
                .queue
                .iter()
                .position(|event| event.kind.drop_rank() == rank)
            {
                self.queue.remove(index);
                self.stats.events_dropped += 1;
                return true;
            }
        }
        false
    }

    fn report_local_error(&mut self, err: &HostSendError, now_ms: u64) {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        let event = BridgeEvent {
            kind: BridgeEventKind::Error,
            data: json!({
                "reason": "host_send_failed",
                "message": err.message,
                "consecutiveFailures": self.consecutive_failures,
            }),
            metadata: EventMetadata {
                room_id: self.config.room_id.clone(),
                player_id: self
                    .config
                    .player_id
                    .clone()
                    .unwrap_or_else(|| "unassigned".to_string()),
                session_id: self.config.session_id.clone(),
                timestamp: now_ms,
                sequence_number,
                priority: EventPriority::High,
                scope: None,
            },
        };
        for handler in &mut self.error_handlers {
            handler(&event);
        }
    }
}
