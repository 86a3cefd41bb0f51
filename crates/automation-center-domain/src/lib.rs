#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StepId(pub Ulid);

impl StepId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StepId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a user or service acting on runs.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub const OPEN: [Self; 2] = [Self::Pending, Self::Running];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub const OPEN: [Self; 2] = [Self::Pending, Self::Running];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }

    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl Display for StepStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INFO" => Some(Self::Info),
            "WARN" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    pub step_key: String,
    pub kind: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AutomationDefinition {
    pub automation_name: String,
    pub automation_version: String,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationEnvelope {
    pub source_format: String,
    pub source_hash: String,
    pub definition_hash: String,
    pub definition: AutomationDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub owner: ActorId,
    pub definition_hash: String,
    pub status: RunStatus,
    pub created_at: DateTimeUtc,
    pub finished_at: Option<DateTimeUtc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step_id: StepId,
    pub run_id: RunId,
    pub ordinal: usize,
    pub step_key: String,
    pub kind: String,
    pub status: StepStatus,
    pub input_json: Value,
    pub result_json: Option<Value>,
    pub error_json: Option<Value>,
    pub started_at: Option<DateTimeUtc>,
    pub finished_at: Option<DateTimeUtc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LogEntry {
    pub entry_id: Ulid,
    pub run_id: RunId,
    pub counter: u64,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTimeUtc,
    pub prev_entry_hash: Option<String>,
    pub entry_hash: String,
}

impl LogEntry {
    /// Sort key giving the total order of entries within one run.
    #[must_use]
    pub fn order_key(&self) -> (DateTimeUtc, u64) {
        (self.timestamp, self.counter)
    }
}

/// Point-in-time view of a run and its steps in ordinal order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub run: RunRecord,
    pub steps: Vec<StepRecord>,
}

impl RunSnapshot {
    #[must_use]
    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|step| step.status == status).count()
    }

    /// Describe every lifecycle invariant this snapshot breaks. Empty when consistent.
    #[must_use]
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        let terminal = self.run.status.is_terminal();
        if terminal != self.run.finished_at.is_some() {
            out.push(format!(
                "run {} has status {} but finished_at is {}",
                self.run.run_id,
                self.run.status,
                if self.run.finished_at.is_some() { "set" } else { "unset" }
            ));
        }
        if terminal {
            for step in self.steps.iter().filter(|step| step.status.is_open()) {
                out.push(format!(
                    "step {} ({}) is {} under terminal run {}",
                    step.ordinal, step.step_key, step.status, self.run.run_id
                ));
            }
        }
        for (expected, step) in self.steps.iter().enumerate() {
            if step.ordinal != expected {
                out.push(format!(
                    "step {} found at position {expected}",
                    step.ordinal
                ));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutputEnvelope {
    pub message: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Run,
    Step,
}

/// A committed status transition, published to subscribers with the commit.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "entity_kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    Run {
        run_id: RunId,
        status: RunStatus,
    },
    Step {
        run_id: RunId,
        step_id: StepId,
        ordinal: usize,
        status: StepStatus,
    },
}

impl ChangeEvent {
    #[must_use]
    pub fn run_id(&self) -> RunId {
        match self {
            Self::Run { run_id, .. } | Self::Step { run_id, .. } => *run_id,
        }
    }

    #[must_use]
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Self::Run { .. } => EntityKind::Run,
            Self::Step { .. } => EntityKind::Step,
        }
    }

    #[must_use]
    pub fn entity_id(&self) -> Ulid {
        match self {
            Self::Run { run_id, .. } => run_id.0,
            Self::Step { step_id, .. } => step_id.0,
        }
    }

    #[must_use]
    pub fn status_text(&self) -> &'static str {
        match self {
            Self::Run { status, .. } => status.as_str(),
            Self::Step { status, .. } => status.as_str(),
        }
    }
}

/// Caller-facing failures. Messages stay short; storage detail lives in the source chain.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("concurrency conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable")]
    Storage(#[source] anyhow::Error),
}

impl RunError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Permission(_) => "permission_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "concurrency_conflict",
            Self::Storage(_) => "storage_failure",
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Format a timestamp as RFC3339.
///
/// # Errors
/// Returns an error when the timestamp cannot be represented.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

/// Parse an RFC3339 timestamp.
///
/// # Errors
/// Returns an error when `value` is not valid RFC3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Hash of the ordered step definitions a run was started from.
///
/// # Errors
/// Returns an error if the definitions cannot be serialized.
pub fn compute_definition_hash(steps: &[StepDefinition]) -> Result<String> {
    let value = serde_json::to_value(steps)?;
    hash_json(&value)
}

/// Chain hash for a log entry: covers its content and the previous entry's hash.
///
/// # Errors
/// Returns an error if the timestamp or material cannot be serialized.
#[allow(clippy::too_many_arguments)]
pub fn compute_log_entry_hash(
    entry_id: Ulid,
    run_id: RunId,
    counter: u64,
    level: LogLevel,
    message: &str,
    timestamp: DateTimeUtc,
    prev_entry_hash: Option<&str>,
) -> Result<String> {
    let material = json!({
        "entry_id": entry_id,
        "run_id": run_id,
        "counter": counter,
        "level": level,
        "message": message,
        "timestamp": format_rfc3339(timestamp)?,
        "prev_entry_hash": prev_entry_hash,
    });
    hash_json(&material)
}

/// Recompute the hash of a stored entry, for chain verification.
///
/// # Errors
/// Returns an error if the entry cannot be serialized.
pub fn recompute_log_entry_hash(entry: &LogEntry) -> Result<String> {
    compute_log_entry_hash(
        entry.entry_id,
        entry.run_id,
        entry.counter,
        entry.level,
        &entry.message,
        entry.timestamp,
        entry.prev_entry_hash.as_deref(),
    )
}
