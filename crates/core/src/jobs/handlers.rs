//! Built-in job handlers. The `recovery` handler lives with the recovery
//! system it drives.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::domain::execution::{ExecutionState, ExecutionStatus};
use crate::domain::job::{Job, JobFailure, JobId};
use crate::domain::workflow::ExecutionContext;
use crate::engine::{is_unrecoverable, EngineError, WorkflowEngine};
use crate::jobs::{JobHandler, JobOutcome};

pub const WORKFLOW_EXECUTION_JOB: &str = "workflow_execution";

const INVALID_PAYLOAD_CODE: &str = "VALIDATION_ERROR";
const ENGINE_BUSY_CODE: &str = "ENGINE_AT_CAPACITY";
const BATCH_PARTIAL_FAILURE_CODE: &str = "BATCH_PARTIAL_FAILURE";

fn invalid_payload(message: impl Into<String>) -> JobOutcome {
    JobOutcome::failed(JobFailure::terminal(message).with_code(INVALID_PAYLOAD_CODE))
}

/// Runs the `ExecutionContext` carried in the payload through the engine.
pub struct WorkflowExecutionHandler {
    engine: Arc<WorkflowEngine>,
}

impl WorkflowExecutionHandler {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for WorkflowExecutionHandler {
    async fn process(&self, job: &Job) -> JobOutcome {
        let mut context: ExecutionContext = match serde_json::from_value(job.payload.clone()) {
            Ok(context) => context,
            Err(error) => {
                return invalid_payload(format!("payload is not an execution context: {error}"))
            }
        };

        // The run must end on its own budget before the job timeout drops it.
        let ceiling = execution_budget_ms(job.config.timeout_ms);
        if context.config.timeout_ms > ceiling {
            debug!(
                event_name = "jobs.workflow.budget_clamped",
                job_id = %job.id,
                requested_ms = context.config.timeout_ms,
                budget_ms = ceiling,
                "execution timeout clamped below the job timeout"
            );
            context.config.timeout_ms = ceiling;
        }

        match self.engine.execute_workflow(context).await {
            Ok(state) => execution_outcome(&state),
            Err(error @ EngineError::AtCapacity { .. }) => JobOutcome::failed(
                JobFailure::retryable(error.to_string()).with_code(ENGINE_BUSY_CODE),
            ),
            Err(error) => invalid_payload(error.to_string()),
        }
    }
}

/// Leaves a tenth of the job timeout (at least 1ms) for the engine to
/// finalize the run.
fn execution_budget_ms(job_timeout_ms: u64) -> u64 {
    let margin = (job_timeout_ms / 10).max(1);
    job_timeout_ms.saturating_sub(margin).max(1)
}

/// Maps a finished execution onto a job outcome. Failed runs retry unless
/// their last error is deny-listed or the run was cancelled.
fn execution_outcome(state: &ExecutionState) -> JobOutcome {
    let mut summary = json!({
        "execution_id": state.id,
        "status": state.status.as_str(),
        "output": state.output,
        "completed_steps": state.progress.completed_steps.len(),
        "failed_steps": state.progress.failed_steps.len(),
        "iterations": state.iterations,
    });

    if state.status == ExecutionStatus::Completed {
        return JobOutcome::succeeded(summary);
    }

    let last_error = state.last_error();
    let failing_agent = last_error
        .and_then(|error| error.step_id.as_deref())
        .and_then(|step_id| state.context.workflow.steps.iter().find(|step| step.id == step_id))
        .and_then(|step| state.context.workflow.agent(&step.agent_id));
    if let (Some(agent), Some(fields)) = (failing_agent, summary.as_object_mut()) {
        fields.insert("agent_id".to_owned(), json!(agent.id));
        fields.insert("agent_type".to_owned(), json!(agent.agent_type));
    }
    let code = last_error
        .map(|error| error.code.clone())
        .unwrap_or_else(|| format!("EXECUTION_{}", state.status.as_str().to_ascii_uppercase()));
    let message = last_error
        .map(|error| error.message.clone())
        .unwrap_or_else(|| format!("execution {} ended {}", state.id, state.status.as_str()));
    let retryable = state.status != ExecutionStatus::Cancelled
        && (state.retry_requested || !is_unrecoverable(&code));

    let failure = if retryable {
        JobFailure::retryable(message)
    } else {
        JobFailure::terminal(message)
    };
    JobOutcome::failed(failure.with_code(code))
        .with_result(summary)
        .with_progress(state.progress.percentage)
}

/// Fans the payload's `items` out through an item handler, at most
/// `concurrency` at a time (overridable per job with `payload.concurrency`).
pub struct BatchHandler {
    item_handler: Arc<dyn JobHandler>,
    concurrency: usize,
}

impl BatchHandler {
    pub fn new(item_handler: Arc<dyn JobHandler>, concurrency: usize) -> Self {
        Self { item_handler, concurrency: concurrency.max(1) }
    }
}

#[async_trait]
impl JobHandler for BatchHandler {
    async fn process(&self, job: &Job) -> JobOutcome {
        let Some(items) = job.payload.get("items").and_then(Value::as_array) else {
            return invalid_payload("batch payload needs an `items` array");
        };
        let window = job
            .payload
            .get("concurrency")
            .and_then(Value::as_u64)
            .map_or(self.concurrency, |value| value as usize)
            .max(1);

        let mut outcomes: Vec<Option<JobOutcome>> = (0..items.len()).map(|_| None).collect();
        let mut join_set = JoinSet::new();
        let mut next = 0usize;

        loop {
            while next < items.len() && join_set.len() < window {
                let mut item_job = job.clone();
                item_job.id = JobId(format!("{}#{next}", job.id));
                item_job.payload = items[next].clone();
                let handler = Arc::clone(&self.item_handler);
                let index = next;
                join_set.spawn(async move { (index, handler.process(&item_job).await) });
                next += 1;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(join_error) => warn!(
                    event_name = "jobs.batch.item_aborted",
                    job_id = %job.id,
                    error = %join_error,
                    "batch item task ended without an outcome"
                ),
            }
        }

        let mut succeeded = 0usize;
        let mut all_retryable = true;
        let results: Vec<Value> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    JobOutcome::failed(JobFailure::retryable("item task aborted"))
                });
                if outcome.success {
                    succeeded += 1;
                } else if !outcome.error.as_ref().map_or(true, |error| error.retryable) {
                    all_retryable = false;
                }
                json!({
                    "index": index,
                    "success": outcome.success,
                    "result": outcome.result,
                    "error": outcome.error.map(|error| error.message),
                })
            })
            .collect();

        let total = results.len();
        let failed = total - succeeded;
        let summary = json!({
            "total": total,
            "succeeded": succeeded,
            "failed": failed,
            "results": results,
        });
        info!(
            event_name = "jobs.batch.finished",
            job_id = %job.id,
            total,
            succeeded,
            failed,
            "batch finished"
        );

        if failed == 0 {
            return JobOutcome::succeeded(summary);
        }
        let message = format!("{failed} of {total} batch items failed");
        let failure = if all_retryable {
            JobFailure::retryable(message)
        } else {
            JobFailure::terminal(message)
        };
        let progress = if total == 0 { 1.0 } else { succeeded as f64 / total as f64 };
        JobOutcome::failed(failure.with_code(BATCH_PARTIAL_FAILURE_CODE))
            .with_result(summary)
            .with_progress(progress)
    }
}

/// Purges finished executions older than `payload.older_than_secs`
/// (default: the engine's retention window).
pub struct CleanupHandler {
    engine: Arc<WorkflowEngine>,
}

impl CleanupHandler {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for CleanupHandler {
    async fn process(&self, job: &Job) -> JobOutcome {
        let older_than_secs = job
            .payload
            .get("older_than_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.engine.config().execution_retention_secs);
        let purged = self.engine.purge_finished(chrono::Duration::seconds(older_than_secs as i64));
        JobOutcome::succeeded(json!({
            "purged_executions": purged,
            "older_than_secs": older_than_secs,
        }))
    }
}

/// Reports the engine's aggregate snapshot.
pub struct AnalyticsHandler {
    engine: Arc<WorkflowEngine>,
}

impl AnalyticsHandler {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for AnalyticsHandler {
    async fn process(&self, _job: &Job) -> JobOutcome {
        match serde_json::to_value(self.engine.snapshot()) {
            Ok(snapshot) => JobOutcome::succeeded(snapshot),
            Err(error) => JobOutcome::failed(JobFailure::terminal(format!(
                "engine snapshot could not be serialized: {error}"
            ))),
        }
    }
}
