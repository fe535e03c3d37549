//! Validator sandbox host: resolves deployed validator programs and
//! invokes them under a deadline, a fuel budget, and a state-size ceiling.
//!
//! Programs are data interpreted by `session_core::rules`, so every
//! invocation already runs in a fresh context with nothing persisting
//! between calls. The host's job is resolution and resource envelopes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use contracts::config::SessionLimits;
use contracts::validator::{ValidatorInput, ValidatorProgram, ValidatorVerdict};
use session_core::rules::{self, Fuel, RulesError};

use crate::store::{ArtifactKind, RoomStore, StoreError};

#[derive(Debug)]
pub enum SandboxError {
    /// Wall-clock deadline exceeded.
    Timeout,
    /// Fuel or state-size ceiling exceeded.
    Limit(String),
    /// The validator reference cannot be resolved to a program.
    Unavailable(String),
    Store(StoreError),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "validator exceeded its deadline"),
            Self::Limit(detail) => write!(f, "validator exceeded a resource limit: {detail}"),
            Self::Unavailable(reference) => {
                write!(f, "validator reference {reference} is unavailable")
            }
            Self::Store(err) => write!(f, "validator store access failed: {err}"),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<StoreError> for SandboxError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Debug)]
pub struct ValidatorSandbox {
    limits: SessionLimits,
    /// Resolution cache. Deploys insert; resolution misses fall back to the
    /// artifact store. References are content-addressed, so entries never
    /// go stale.
    programs: RwLock<HashMap<String, Arc<ValidatorProgram>>>,
}

impl ValidatorSandbox {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            programs: RwLock::new(HashMap::new()),
        }
    }

    /// Publishes a program artifact and registers it for resolution.
    /// Redeploys produce a new address; nothing is mutated in place.
    pub async fn deploy(
        &self,
        room_id: &str,
        program: &ValidatorProgram,
        store: &dyn RoomStore,
    ) -> Result<String, SandboxError> {
        let serialized = serde_json::to_string(program)
            .map_err(|err| SandboxError::Limit(err.to_string()))?;
        let reference = store
            .publish_artifact(ArtifactKind::ValidatorProgram, room_id, &serialized)
            .await?;
        if let Ok(mut programs) = self.programs.write() {
            programs.insert(reference.clone(), Arc::new(program.clone()));
        }
        Ok(reference)
    }

    /// Resolves a reference, consulting the artifact store on cache miss.
    pub async fn resolve(
        &self,
        reference: &str,
        store: &dyn RoomStore,
    ) -> Result<Arc<ValidatorProgram>, SandboxError> {
        if let Ok(programs) = self.programs.read() {
            if let Some(program) = programs.get(reference) {
                return Ok(Arc::clone(program));
            }
        }
        let Some(content) = store.fetch_artifact(reference).await? else {
            return Err(SandboxError::Unavailable(reference.to_string()));
        };
        let program: ValidatorProgram = serde_json::from_str(&content)
            .map_err(|_| SandboxError::Unavailable(reference.to_string()))?;
        let program = Arc::new(program);
        if let Ok(mut programs) = self.programs.write() {
            programs.insert(reference.to_string(), Arc::clone(&program));
        }
        Ok(program)
    }

    /// Runs one invocation: size gate, then the interpreter on a blocking
    /// thread under the per-validator deadline.
    pub async fn invoke(
        &self,
        program: Arc<ValidatorProgram>,
        input: ValidatorInput,
    ) -> Result<ValidatorVerdict, SandboxError> {
        let state_size = serde_json::to_string(&input.state)
            .map(|serialized| serialized.len())
            .unwrap_or(usize::MAX);
        if state_size > self.limits.state_size_limit_bytes {
            return Err(SandboxError::Limit(format!(
                "state size {state_size} exceeds ceiling {}",
                self.limits.state_size_limit_bytes
            )));
        }

        let fuel_budget = self.limits.validator_fuel;
        let deadline = Duration::from_millis(self.limits.validator_deadline_ms);
        let worker = tokio::task::spawn_blocking(move || {
            let mut fuel = Fuel::new(fuel_budget);
            rules::evaluate(&program, &input, &mut fuel)
        });

        match tokio::time::timeout(deadline, worker).await {
            Err(_) => Err(SandboxError::Timeout),
            Ok(Err(join_error)) => Err(SandboxError::Limit(join_error.to_string())),
            Ok(Ok(Err(RulesError::FuelExhausted))) => {
                Err(SandboxError::Limit("fuel exhausted".to_string()))
            }
            Ok(Ok(Ok(verdict))) => {
                if let Some(updated) = &verdict.updated_state {
                    let updated_size = serde_json::to_string(updated)
                        .map(|serialized| serialized.len())
                        .unwrap_or(usize::MAX);
                    if updated_size > self.limits.state_size_limit_bytes {
                        return Err(SandboxError::Limit(format!(
                            "updated state size {updated_size} exceeds ceiling"
                        )));
                    }
                }
                Ok(verdict)
            }
        }
    }
}
