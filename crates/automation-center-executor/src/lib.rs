#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use automation_center_domain::{ErrorEnvelope, RunId, StepId, StepOutputEnvelope, StepRecord};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

/// Work item handed to an executor. Built from the persisted step row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRequest {
    pub run_id: RunId,
    pub step_id: StepId,
    pub ordinal: usize,
    pub step_key: String,
    pub kind: String,
    pub input: Value,
}

impl From<&StepRecord> for StepRequest {
    fn from(step: &StepRecord) -> Self {
        Self {
            run_id: step.run_id,
            step_id: step.step_id,
            ordinal: step.ordinal,
            step_key: step.step_key.clone(),
            kind: step.kind.clone(),
            input: step.input_json.clone(),
        }
    }
}

/// Performs the actual work of one step.
///
/// `cancel` is advisory: an implementation may finish its work and return a
/// result after cancellation, and the orchestrator decides whether that result
/// is recorded.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutputEnvelope, ErrorEnvelope>;
}

/// Executors keyed by step kind.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn StepExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for steps of `kind`.
    ///
    /// # Errors
    /// Returns an error when `kind` is blank or already registered.
    pub fn register(&mut self, kind: &str, executor: Arc<dyn StepExecutor>) -> Result<()> {
        let kind = kind.trim().to_ascii_lowercase();
        if kind.is_empty() {
            return Err(anyhow!("executor kind MUST be non-empty"));
        }
        if self.executors.contains_key(&kind) {
            return Err(anyhow!("executor already registered for kind '{kind}'"));
        }
        self.executors.insert(kind, executor);
        Ok(())
    }

    /// Builder form of [`ExecutorRegistry::register`].
    ///
    /// # Errors
    /// Same as [`ExecutorRegistry::register`].
    pub fn with(mut self, kind: &str, executor: Arc<dyn StepExecutor>) -> Result<Self> {
        self.register(kind, executor)?;
        Ok(self)
    }

    #[must_use]
    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(kind).cloned()
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        self.executors.keys().map(String::as_str).collect()
    }

    /// Route a request to the executor for its kind.
    ///
    /// An unknown kind is reported as a step failure, not a dispatch error.
    pub async fn dispatch(
        &self,
        request: &StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutputEnvelope, ErrorEnvelope> {
        match self.resolve(&request.kind) {
            Some(executor) => executor.execute(request, cancel).await,
            None => Err(ErrorEnvelope::new(
                "unsupported_step_kind",
                format!(
                    "no executor registered for step kind '{}'; registered kinds: [{}]",
                    request.kind,
                    self.kinds().join(", ")
                ),
            )),
        }
    }
}

/// Deterministic executor for demos and tests.
///
/// Input knobs: `mock_delay_ms` sleeps before answering (cut short by
/// cancellation), `mock_fail: true` fails the step with `mock_error` as the
/// message.
#[derive(Debug, Clone)]
pub struct MockExecutor {
    adapter_version: String,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self {
            adapter_version: "mock.v1".to_string(),
        }
    }
}

impl MockExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn deterministic_token(&self, request: &StepRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.step_key.as_bytes());
        hasher.update(request.kind.as_bytes());
        hasher.update(request.input.to_string().as_bytes());
        hasher.update(self.adapter_version.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl StepExecutor for MockExecutor {
    async fn execute(
        &self,
        request: &StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutputEnvelope, ErrorEnvelope> {
        if let Some(delay_ms) = request.input.get("mock_delay_ms").and_then(Value::as_u64) {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                () = cancel.cancelled() => {
                    return Err(ErrorEnvelope::new(
                        "cancelled",
                        "step cancelled before completion",
                    ));
                }
            }
        }

        if request
            .input
            .get("mock_fail")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let message = request
                .input
                .get("mock_error")
                .and_then(Value::as_str)
                .unwrap_or("mock step failed");
            return Err(ErrorEnvelope::new("mock_failure", message));
        }

        let token = self.deterministic_token(request);
        Ok(StepOutputEnvelope {
            message: format!(
                "mock:{}:{}",
                request.step_key,
                token.chars().take(16).collect::<String>()
            ),
            payload: json!({
                "deterministic_token": token,
                "step_key": request.step_key,
                "ordinal": request.ordinal,
                "adapter_version": self.adapter_version,
            }),
        })
    }
}
