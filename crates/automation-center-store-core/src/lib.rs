#![forbid(unsafe_code)]

use anyhow::Result;
use automation_center_domain::{
    ChangeEvent, LogEntry, LogLevel, RunId, RunRecord, RunSnapshot, RunStatus, StepId, StepRecord,
    StepStatus,
};

/// Receives every committed status transition, in commit order.
///
/// Stores call `publish` after the transaction commits and before the next
/// mutation is admitted, so a sink observes transitions in the order readers
/// can observe them.
pub trait ChangeSink: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopChangeSink;

impl ChangeSink for NoopChangeSink {
    fn publish(&self, _event: ChangeEvent) {}
}

impl<F> ChangeSink for F
where
    F: Fn(ChangeEvent) + Send + Sync,
{
    fn publish(&self, event: ChangeEvent) {
        self(event);
    }
}

/// Log entry written in the same transaction as a status transition, so the
/// audit trail never misses a committed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditNote<'a> {
    pub level: LogLevel,
    pub message: &'a str,
}

impl<'a> AuditNote<'a> {
    #[must_use]
    pub fn info(message: &'a str) -> Self {
        Self {
            level: LogLevel::Info,
            message,
        }
    }

    #[must_use]
    pub fn warn(message: &'a str) -> Self {
        Self {
            level: LogLevel::Warn,
            message,
        }
    }

    #[must_use]
    pub fn error(message: &'a str) -> Self {
        Self {
            level: LogLevel::Error,
            message,
        }
    }
}

/// Durable state of runs, steps, and their logs.
///
/// Every status write is a compare-and-swap against the expected current
/// status. A `false`/`None` return means another writer got there first; it
/// is not an error, and no audit note is written.
pub trait RunStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Insert a run and all its steps atomically.
    #[allow(clippy::missing_errors_doc)]
    fn create_run(&self, run: &RunRecord, steps: &[StepRecord]) -> Result<()>;

    /// Move the run to `next` if its status is one of `expected`.
    #[allow(clippy::missing_errors_doc)]
    fn transition_run(
        &self,
        run_id: RunId,
        expected: &[RunStatus],
        next: RunStatus,
        note: Option<AuditNote<'_>>,
    ) -> Result<bool>;

    /// Move the step to `next` if its status is still `expected`, recording
    /// the result or error payload with it.
    #[allow(clippy::missing_errors_doc)]
    fn transition_step(
        &self,
        step_id: StepId,
        expected: StepStatus,
        next: StepStatus,
        result_json: Option<&serde_json::Value>,
        error_json: Option<&serde_json::Value>,
        note: Option<AuditNote<'_>>,
    ) -> Result<bool>;

    /// Move the run to the terminal status `next` and cancel its open steps
    /// in the same transaction. Returns the cancelled step ids, or `None` when
    /// the run was no longer in `expected`.
    #[allow(clippy::missing_errors_doc)]
    fn finish_run(
        &self,
        run_id: RunId,
        expected: &[RunStatus],
        next: RunStatus,
        note: Option<AuditNote<'_>>,
    ) -> Result<Option<Vec<StepId>>>;

    /// Append a log entry. Returns `None` when the run does not exist.
    #[allow(clippy::missing_errors_doc)]
    fn append_log(&self, run_id: RunId, level: LogLevel, message: &str)
        -> Result<Option<LogEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<RunRecord>>;

    /// Run row and its steps read in one consistent view.
    #[allow(clippy::missing_errors_doc)]
    fn snapshot(&self, run_id: RunId) -> Result<Option<RunSnapshot>>;

    /// Steps of a run in ordinal order.
    #[allow(clippy::missing_errors_doc)]
    fn get_steps(&self, run_id: RunId) -> Result<Vec<StepRecord>>;

    /// Lowest-ordinal step still pending.
    #[allow(clippy::missing_errors_doc)]
    fn next_pending_step(&self, run_id: RunId) -> Result<Option<StepRecord>>;

    /// Up to `limit` entries with a counter greater than `after_counter`, in
    /// log order.
    #[allow(clippy::missing_errors_doc)]
    fn list_logs(&self, run_id: RunId, after_counter: u64, limit: usize)
        -> Result<Vec<LogEntry>>;
}
