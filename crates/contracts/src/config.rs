//! Runtime tunables and the room configuration object injected into
//! converted documents.

use serde::{Deserialize, Serialize};

use crate::SCHEMA_VERSION_V1;

/// Batching parameters for the client-side bridge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchingConfig {
    pub interval_ms: u64,
    pub max_events: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            max_events: 32,
        }
    }
}

/// Injected into every converted document alongside the bridge bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomConfig {
    pub schema_version: String,
    pub room_id: String,
    /// Provisioned per player at join time; absent in the published artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    pub session_id: String,
    pub batching: BatchingConfig,
}

impl RoomConfig {
    pub fn new(room_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            room_id: room_id.into(),
            player_id: None,
            session_id: session_id.into(),
            batching: BatchingConfig::default(),
        }
    }
}

/// Server-side limits. Defaults match the nominal budgets in the protocol
/// contract; every field can be overridden at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionLimits {
    #[serde(default = "default_submit_deadline_ms")]
    pub submit_deadline_ms: u64,
    #[serde(default = "default_validator_deadline_ms")]
    pub validator_deadline_ms: u64,
    #[serde(default = "default_validator_fuel")]
    pub validator_fuel: u64,
    #[serde(default = "default_state_size_limit_bytes")]
    pub state_size_limit_bytes: usize,
    #[serde(default = "default_cache_freshness_ms")]
    pub cache_freshness_ms: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_ended_grace_ms")]
    pub ended_grace_ms: u64,
    #[serde(default = "default_conversion_workers")]
    pub conversion_workers: usize,
    #[serde(default = "default_llm_retry_budget")]
    pub llm_retry_budget: u32,
    #[serde(default = "default_llm_time_budget_ms")]
    pub llm_time_budget_ms: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            submit_deadline_ms: default_submit_deadline_ms(),
            validator_deadline_ms: default_validator_deadline_ms(),
            validator_fuel: default_validator_fuel(),
            state_size_limit_bytes: default_state_size_limit_bytes(),
            cache_freshness_ms: default_cache_freshness_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            subscriber_buffer: default_subscriber_buffer(),
            ended_grace_ms: default_ended_grace_ms(),
            conversion_workers: default_conversion_workers(),
            llm_retry_budget: default_llm_retry_budget(),
            llm_time_budget_ms: default_llm_time_budget_ms(),
        }
    }
}

fn default_submit_deadline_ms() -> u64 {
    24_000
}

fn default_validator_deadline_ms() -> u64 {
    5_000
}

fn default_validator_fuel() -> u64 {
    100_000
}

fn default_state_size_limit_bytes() -> usize {
    256 * 1024
}

fn default_cache_freshness_ms() -> u64 {
    5_000
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_ended_grace_ms() -> u64 {
    10 * 60 * 1_000
}

fn default_conversion_workers() -> usize {
    4
}

fn default_llm_retry_budget() -> u32 {
    3
}

fn default_llm_time_budget_ms() -> u64 {
    120_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_deadline_stays_below_submit_deadline() {
        let limits = SessionLimits::default();
        assert!(limits.validator_deadline_ms < limits.submit_deadline_ms);
    }

    #[test]
    fn limits_deserialize_from_empty_object() {
        let limits: SessionLimits = serde_json::from_str("{}").expect("defaults apply");
        assert_eq!(limits, SessionLimits::default());
    }

    #[test]
    fn room_config_omits_unprovisioned_player_id() {
        let config = RoomConfig::new("room_1", "sess_1");
        let value = serde_json::to_value(&config).expect("serialize config");
        assert!(value.get("playerId").is_none());
        assert!(value.get("batching").is_some());
    }
}
