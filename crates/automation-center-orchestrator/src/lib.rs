#![forbid(unsafe_code)]

mod config;
mod log_sink;
mod notifier;
mod worker;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use automation_center_domain::{
    compute_definition_hash, now_utc, ActorId, LogEntry, LogLevel, RunError, RunId, RunRecord,
    RunSnapshot, RunStatus, StepDefinition, StepId, StepRecord, StepStatus,
};
use automation_center_executor::ExecutorRegistry;
use automation_center_policy::{authorize_stop, AccessPolicy};
use automation_center_store_core::{AuditNote, RunStore};
use automation_center_store_sqlite::SqliteRunStore;
use automation_center_workflow::{normalize_step_definitions, validate_step_definitions};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use config::OrchestratorConfig;
pub use log_sink::{AuditReport, LogEntries};
pub use notifier::{ChangeNotifier, ChangeSubscription};

pub const STOPPED_BY_USER: &str = "run stopped by user";
pub const INTERRUPTED: &str = "run interrupted before completion";
pub const ABORTED: &str = "run aborted after a storage failure";

/// Result of a stop request. Stopping an already-terminal run succeeds
/// without mutating anything.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StopOutcome {
    pub run_id: RunId,
    pub success: bool,
    pub status: RunStatus,
    pub already_finished: bool,
    pub cancelled_steps: Vec<StepId>,
    pub message: String,
}

/// A started run: its id plus the worker driving it.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    task: JoinHandle<Result<RunSnapshot, RunError>>,
}

impl RunHandle {
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Wait for the run to become terminal and return its final snapshot.
    ///
    /// # Errors
    /// Returns the error that stopped the worker, or [`RunError::Storage`]
    /// when the worker task itself failed.
    pub async fn wait(self) -> Result<RunSnapshot, RunError> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => Err(RunError::Storage(anyhow!("run worker failed: {err}"))),
        }
    }
}

pub(crate) struct Inner {
    store: Arc<dyn RunStore>,
    executors: ExecutorRegistry,
    policy: Arc<dyn AccessPolicy>,
    notifier: ChangeNotifier,
    config: OrchestratorConfig,
    active: Mutex<HashMap<RunId, CancellationToken>>,
}

impl Inner {
    async fn blocking<T, F>(&self, op: F) -> Result<T, RunError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RunStore) -> anyhow::Result<T> + Send + 'static,
    {
        run_blocking(&self.store, op).await
    }

    async fn append_log(
        &self,
        run_id: RunId,
        level: LogLevel,
        message: String,
    ) -> Result<LogEntry, RunError> {
        self.blocking(move |store| store.append_log(run_id, level, &message))
            .await?
            .ok_or_else(|| run_not_found(run_id))
    }

    async fn snapshot(&self, run_id: RunId) -> Result<RunSnapshot, RunError> {
        self.blocking(move |store| store.snapshot(run_id))
            .await?
            .ok_or_else(|| run_not_found(run_id))
    }

    async fn require_run(&self, run_id: RunId) -> Result<RunRecord, RunError> {
        self.blocking(move |store| store.get_run(run_id))
            .await?
            .ok_or_else(|| run_not_found(run_id))
    }
}

/// Run a blocking store call off the async runtime.
pub(crate) async fn run_blocking<T, F>(store: &Arc<dyn RunStore>, op: F) -> Result<T, RunError>
where
    T: Send + 'static,
    F: FnOnce(&dyn RunStore) -> anyhow::Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || op(store.as_ref())).await {
        Ok(result) => result.map_err(RunError::Storage),
        Err(err) => Err(RunError::Storage(anyhow!("store task failed: {err}"))),
    }
}

fn run_not_found(run_id: RunId) -> RunError {
    RunError::NotFound(format!("run {run_id}"))
}

/// Starts, drives, and stops automation runs.
///
/// Cheap to clone; clones share the store, executors, and active-run table.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Assemble an orchestrator over an existing store. `notifier` must be the
    /// store's change sink for subscriptions to see its commits.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        notifier: ChangeNotifier,
        executors: ExecutorRegistry,
        policy: Arc<dyn AccessPolicy>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                executors,
                policy,
                notifier,
                config: config.sanitized(),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open (and migrate) a `SQLite` store at `path` wired to a fresh notifier.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open_sqlite(
        path: &Path,
        executors: ExecutorRegistry,
        policy: Arc<dyn AccessPolicy>,
        config: OrchestratorConfig,
    ) -> anyhow::Result<Self> {
        let config = config.sanitized();
        let notifier = ChangeNotifier::new();
        let store = SqliteRunStore::open(path)?.with_change_sink(Arc::new(notifier.clone()));
        store.migrate()?;
        Ok(Self::new(
            Arc::new(store),
            notifier,
            executors,
            policy,
            config,
        ))
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Persist a new run with all steps pending, mark it running, and spawn
    /// its worker.
    ///
    /// # Errors
    /// [`RunError::Validation`] for a blank owner or invalid step definitions
    /// (nothing is persisted), [`RunError::Storage`] when persistence fails.
    pub async fn start_run(
        &self,
        owner: ActorId,
        mut steps: Vec<StepDefinition>,
    ) -> Result<RunHandle, RunError> {
        if owner.as_str().trim().is_empty() {
            return Err(RunError::Validation("owner MUST be non-empty".to_string()));
        }
        normalize_step_definitions(&mut steps);
        validate_step_definitions(&steps)
            .map_err(|err| RunError::Validation(format!("{err:#}")))?;
        let definition_hash = compute_definition_hash(&steps)
            .map_err(|err| RunError::Validation(format!("{err:#}")))?;

        let run_id = RunId::new();
        let run = RunRecord {
            run_id,
            owner,
            definition_hash,
            status: RunStatus::Pending,
            created_at: now_utc(),
            finished_at: None,
        };
        let records: Vec<StepRecord> = steps
            .into_iter()
            .enumerate()
            .map(|(ordinal, step)| StepRecord {
                step_id: StepId::new(),
                run_id,
                ordinal,
                step_key: step.step_key,
                kind: step.kind,
                status: StepStatus::Pending,
                input_json: step.input,
                result_json: None,
                error_json: None,
                started_at: None,
                finished_at: None,
            })
            .collect();
        let step_count = records.len();

        let cancel = CancellationToken::new();
        self.inner.active.lock().insert(run_id, cancel.clone());

        let created = self
            .inner
            .blocking(move |store| store.create_run(&run, &records))
            .await;
        if let Err(err) = created {
            self.inner.active.lock().remove(&run_id);
            return Err(err);
        }

        let started = self
            .inner
            .blocking(move |store| {
                store.transition_run(
                    run_id,
                    &[RunStatus::Pending],
                    RunStatus::Running,
                    Some(AuditNote::info("run started")),
                )
            })
            .await;
        let started = match started {
            Ok(started) => started,
            Err(err) => {
                self.inner.active.lock().remove(&run_id);
                worker::abandon_run(&self.inner, run_id).await;
                return Err(err);
            }
        };

        if started {
            info!(run_id = %run_id, steps = step_count, "run started");
        } else {
            debug!(run_id = %run_id, "run left pending before start; worker will observe it");
        }

        let task = tokio::spawn(worker::drive(Arc::clone(&self.inner), run_id, cancel));
        Ok(RunHandle { run_id, task })
    }

    /// Stop a run on behalf of `requester`.
    ///
    /// The run and its open steps are finished in one commit; the running
    /// executor is then signalled through its cancellation token.
    ///
    /// # Errors
    /// [`RunError::NotFound`] for an unknown run, [`RunError::Permission`] when
    /// the requester is neither the owner nor privileged.
    pub async fn stop_run(
        &self,
        run_id: RunId,
        requester: ActorId,
    ) -> Result<StopOutcome, RunError> {
        let run = self.inner.require_run(run_id).await?;
        let decision = authorize_stop(self.inner.policy.as_ref(), &run.owner, &requester);
        if !decision.allowed {
            debug!(
                run_id = %run_id,
                requester = %requester,
                reason = decision.reason,
                "stop denied"
            );
            return Err(RunError::Permission(format!(
                "{requester} may not stop run {run_id}"
            )));
        }

        let finished = self
            .inner
            .blocking(move |store| {
                store.finish_run(
                    run_id,
                    &RunStatus::OPEN,
                    RunStatus::Stopped,
                    Some(AuditNote::warn(STOPPED_BY_USER)),
                )
            })
            .await?;

        let Some(cancelled_steps) = finished else {
            let current = self.inner.require_run(run_id).await?;
            return Ok(StopOutcome {
                run_id,
                success: true,
                status: current.status,
                already_finished: true,
                cancelled_steps: Vec::new(),
                message: format!("run already {}", current.status),
            });
        };

        let token = self.inner.active.lock().get(&run_id).cloned();
        if let Some(token) = token {
            token.cancel();
        }
        info!(
            run_id = %run_id,
            requester = %requester,
            basis = ?decision.basis,
            cancelled = cancelled_steps.len(),
            "run stopped"
        );

        Ok(StopOutcome {
            run_id,
            success: true,
            status: RunStatus::Stopped,
            already_finished: false,
            cancelled_steps,
            message: "run stopped".to_string(),
        })
    }

    /// # Errors
    /// [`RunError::NotFound`] for an unknown run.
    pub async fn get_run_status(&self, run_id: RunId) -> Result<RunSnapshot, RunError> {
        self.inner.snapshot(run_id).await
    }

    /// # Errors
    /// [`RunError::Storage`] when the store cannot be read.
    pub async fn list_runs(&self) -> Result<Vec<RunRecord>, RunError> {
        self.inner.blocking(|store| store.list_runs()).await
    }

    /// Append an audit entry to a run's log.
    ///
    /// # Errors
    /// [`RunError::NotFound`] for an unknown run.
    pub async fn append_log(
        &self,
        run_id: RunId,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<LogEntry, RunError> {
        self.inner.append_log(run_id, level, message.into()).await
    }

    /// Lazy reader over a run's log.
    ///
    /// # Errors
    /// [`RunError::NotFound`] for an unknown run.
    pub async fn read_logs(&self, run_id: RunId) -> Result<LogEntries, RunError> {
        self.inner.require_run(run_id).await?;
        Ok(LogEntries::new(
            Arc::clone(&self.inner.store),
            run_id,
            self.inner.config.log_page_size,
        ))
    }

    /// Recompute a run's log hash chain.
    ///
    /// # Errors
    /// [`RunError::NotFound`] for an unknown run.
    pub async fn verify_log_chain(&self, run_id: RunId) -> Result<AuditReport, RunError> {
        let entries = self.read_logs(run_id).await?.collect_remaining().await?;
        Ok(log_sink::audit_entries(run_id, &entries))
    }

    /// Subscribe to committed transitions of one run.
    ///
    /// # Errors
    /// [`RunError::NotFound`] for an unknown run.
    pub async fn subscribe(&self, run_id: RunId) -> Result<ChangeSubscription, RunError> {
        let subscription = self.inner.notifier.subscribe(Some(run_id));
        self.inner.require_run(run_id).await?;
        Ok(subscription)
    }

    /// Subscribe to committed transitions of every run.
    #[must_use]
    pub fn subscribe_all(&self) -> ChangeSubscription {
        self.inner.notifier.subscribe(None)
    }

    /// Fail every open run this process is not driving, closing its open
    /// steps. Meant for startup after a crash.
    ///
    /// Only this process's workers are known. Runs driven by another process
    /// on the same database are indistinguishable from interrupted ones, so
    /// call this only while no other process is driving runs.
    ///
    /// # Errors
    /// [`RunError::Storage`] when the store cannot be read or written.
    pub async fn recover_interrupted(&self) -> Result<Vec<RunId>, RunError> {
        let open = self
            .inner
            .blocking(|store| store.list_runs_with_status(&RunStatus::OPEN))
            .await?;

        let mut recovered = Vec::new();
        for run in open {
            let run_id = run.run_id;
            if self.inner.active.lock().contains_key(&run_id) {
                continue;
            }
            let finished = self
                .inner
                .blocking(move |store| {
                    store.finish_run(
                        run_id,
                        &RunStatus::OPEN,
                        RunStatus::Failed,
                        Some(AuditNote::error(INTERRUPTED)),
                    )
                })
                .await?;
            if finished.is_some() {
                info!(run_id = %run_id, "interrupted run marked failed");
                recovered.push(run_id);
            }
        }
        Ok(recovered)
    }

    /// Number of runs with a live worker in this process.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.inner.active.lock().len()
    }
}
