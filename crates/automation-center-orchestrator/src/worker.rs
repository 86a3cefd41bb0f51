use std::sync::Arc;
use std::time::Duration;

use automation_center_domain::{
    ErrorEnvelope, RunError, RunId, RunSnapshot, RunStatus, StepOutputEnvelope, StepRecord,
    StepStatus,
};
use automation_center_executor::StepRequest;
use automation_center_store_core::AuditNote;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Inner, ABORTED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Continue,
    Finished,
}

/// Drive a run until it is terminal, then return its final snapshot.
///
/// A worker that stops early fails its run so no open run is left without a
/// driver.
pub(crate) async fn drive(
    inner: Arc<Inner>,
    run_id: RunId,
    cancel: CancellationToken,
) -> Result<RunSnapshot, RunError> {
    let outcome = loop {
        match execute_next(&inner, run_id, &cancel).await {
            Ok(Progress::Continue) => {}
            Ok(Progress::Finished) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    inner.active.lock().remove(&run_id);

    if let Err(err) = &outcome {
        warn!(run_id = %run_id, code = err.code(), error = %err, "run worker stopped early");
        cancel.cancel();
        abandon_run(&inner, run_id).await;
    }
    outcome?;
    inner.snapshot(run_id).await
}

/// Best-effort: fail an open run whose driver could not continue.
pub(crate) async fn abandon_run(inner: &Inner, run_id: RunId) {
    let finished = inner
        .blocking(move |store| {
            store.finish_run(
                run_id,
                &RunStatus::OPEN,
                RunStatus::Failed,
                Some(AuditNote::error(ABORTED)),
            )
        })
        .await;
    match finished {
        Ok(Some(cancelled)) => {
            info!(run_id = %run_id, cancelled = cancelled.len(), "abandoned run marked failed");
        }
        Ok(None) => {}
        Err(err) => {
            warn!(run_id = %run_id, error = %err, "could not fail abandoned run; recover it later");
        }
    }
}

/// Advance the run by at most one step.
pub(crate) async fn execute_next(
    inner: &Inner,
    run_id: RunId,
    cancel: &CancellationToken,
) -> Result<Progress, RunError> {
    let (run, next) = inner
        .blocking(move |store| Ok((store.get_run(run_id)?, store.next_pending_step(run_id)?)))
        .await?;
    let Some(run) = run else {
        return Err(RunError::NotFound(format!("run {run_id}")));
    };
    if run.status.is_terminal() {
        return Ok(Progress::Finished);
    }
    let Some(step) = next else {
        resolve_run(inner, run_id).await?;
        return Ok(Progress::Finished);
    };

    let step_id = step.step_id;
    let started = format!("step {} ({}) started", step.ordinal, step.step_key);
    let claimed = inner
        .blocking(move |store| {
            store.transition_step(
                step_id,
                StepStatus::Pending,
                StepStatus::Running,
                None,
                None,
                Some(AuditNote::info(&started)),
            )
        })
        .await?;
    if !claimed {
        debug!(run_id = %run_id, step_id = %step_id, "step claim lost; re-evaluating run");
        return Ok(Progress::Continue);
    }

    let request = StepRequest::from(&step);
    let outcome = invoke(inner, request, cancel.child_token()).await;
    record_outcome(inner, &step, outcome).await?;
    Ok(Progress::Continue)
}

async fn invoke(
    inner: &Inner,
    request: StepRequest,
    token: CancellationToken,
) -> Result<StepOutputEnvelope, ErrorEnvelope> {
    let Some(limit) = inner.config.step_timeout else {
        return inner.executors.dispatch(&request, token).await;
    };

    // The call runs on its own task so an expired step can be detached rather
    // than dropped mid-flight.
    let executors = inner.executors.clone();
    let call_token = token.clone();
    let mut call =
        tokio::spawn(async move { executors.dispatch(&request, call_token).await });
    match tokio::time::timeout(limit, &mut call).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => Err(ErrorEnvelope::new(
            "executor_panicked",
            format!("executor task failed: {err}"),
        )),
        Err(_) => {
            token.cancel();
            debug!("step timed out; executor call detached");
            Err(timeout_error(limit))
        }
    }
}

fn timeout_error(limit: Duration) -> ErrorEnvelope {
    ErrorEnvelope::new(
        "step_timeout",
        format!("step exceeded timeout of {} ms", limit.as_millis()),
    )
}

async fn record_outcome(
    inner: &Inner,
    step: &StepRecord,
    outcome: Result<StepOutputEnvelope, ErrorEnvelope>,
) -> Result<(), RunError> {
    let run_id = step.run_id;
    let step_id = step.step_id;

    match outcome {
        Ok(output) => {
            let result = serde_json::to_value(&output)
                .map_err(|err| RunError::Storage(anyhow::Error::new(err)))?;
            let message = format!("step {} ({}) succeeded", step.ordinal, step.step_key);
            let recorded = inner
                .blocking(move |store| {
                    store.transition_step(
                        step_id,
                        StepStatus::Running,
                        StepStatus::Succeeded,
                        Some(&result),
                        None,
                        Some(AuditNote::info(&message)),
                    )
                })
                .await?;
            if !recorded {
                debug!(run_id = %run_id, step_id = %step_id, "discarding late step result");
            }
        }
        Err(error) => {
            let payload = serde_json::to_value(&error)
                .map_err(|err| RunError::Storage(anyhow::Error::new(err)))?;
            let message = format!(
                "step {} ({}) failed: {}: {}",
                step.ordinal, step.step_key, error.code, error.message
            );
            let recorded = inner
                .blocking(move |store| {
                    store.transition_step(
                        step_id,
                        StepStatus::Running,
                        StepStatus::Failed,
                        None,
                        Some(&payload),
                        Some(AuditNote::error(&message)),
                    )
                })
                .await?;
            if !recorded {
                debug!(
                    run_id = %run_id,
                    step_id = %step_id,
                    code = %error.code,
                    "discarding late step failure"
                );
                return Ok(());
            }
            fail_run(inner, run_id).await?;
        }
    }
    Ok(())
}

/// Apply the failure policy: fail the run and cancel its open steps at once.
async fn fail_run(inner: &Inner, run_id: RunId) -> Result<(), RunError> {
    let finished = inner
        .blocking(move |store| {
            store.finish_run(
                run_id,
                &[RunStatus::Running],
                RunStatus::Failed,
                Some(AuditNote::error("run failed; open steps cancelled")),
            )
        })
        .await?;
    match finished {
        Some(cancelled) => info!(run_id = %run_id, cancelled = cancelled.len(), "run failed"),
        None => debug!(run_id = %run_id, "run already terminal; failure not applied"),
    }
    Ok(())
}

/// No step is pending: settle the run from its step outcomes.
async fn resolve_run(inner: &Inner, run_id: RunId) -> Result<(), RunError> {
    let steps = inner.blocking(move |store| store.get_steps(run_id)).await?;
    let all_succeeded = steps
        .iter()
        .all(|step| step.status == StepStatus::Succeeded);
    let any_failed = steps.iter().any(|step| step.status == StepStatus::Failed);

    if all_succeeded {
        let finished = inner
            .blocking(move |store| {
                store.finish_run(
                    run_id,
                    &[RunStatus::Running],
                    RunStatus::Completed,
                    Some(AuditNote::info("run completed")),
                )
            })
            .await?;
        if finished.is_some() {
            info!(run_id = %run_id, steps = steps.len(), "run completed");
            return Ok(());
        }
    } else if any_failed {
        fail_run(inner, run_id).await?;
    }

    let run = inner.blocking(move |store| store.get_run(run_id)).await?;
    match run {
        Some(run) if run.status.is_terminal() => Ok(()),
        Some(run) => Err(RunError::Conflict(format!(
            "run {run_id} is {} with no pending steps",
            run.status
        ))),
        None => Err(RunError::NotFound(format!("run {run_id}"))),
    }
}
