//! Process-wide service wiring.
//!
//! [`Services`] owns the engine, the job processor and the recovery system,
//! registers the built-in job handlers, and forwards terminal job failures
//! to recovery. One instance is built at startup and passed by reference.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AppConfig, LoadOptions};
use crate::domain::execution::{ExecutionId, ExecutionState, ExecutionStatus, StepStatus};
use crate::domain::job::{Job, JobId, JobPriority, JobSpec, JobStatus};
use crate::domain::recovery::{ErrorReport, RecoveryContext, ReportedError, GLOBAL_KEY};
use crate::domain::workflow::ExecutionContext;
use crate::engine::{EchoStepExecutor, EngineError, EngineSnapshot, StepExecutor, WorkflowEngine};
use crate::errors::ApplicationError;
use crate::jobs::{
    AnalyticsHandler, BatchHandler, CleanupHandler, JobError, JobHealth, JobNotice, JobProcessor,
    JobStats, ProcessorHandle, WorkflowExecutionHandler, ANALYTICS_JOB, BATCH_JOB, CLEANUP_JOB,
    RECOVERY_JOB, WORKFLOW_EXECUTION_JOB,
};
use crate::recovery::{
    ErrorRecoverySystem, ExecutionControl, JobSubmitter, LoggingRemediationHooks,
    RecoveryHealth, RecoveryStats, RemediationHooks,
};
use crate::telemetry::{TelemetrySink, TracingTelemetrySink};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub engine: EngineSnapshot,
    pub jobs: JobHealth,
    pub recovery: RecoveryHealth,
}

pub struct Services {
    config: AppConfig,
    engine: Arc<WorkflowEngine>,
    jobs: Arc<JobProcessor>,
    recovery: Arc<ErrorRecoverySystem>,
}

impl Services {
    pub fn new(
        config: AppConfig,
        executor: Arc<dyn StepExecutor>,
        hooks: Arc<dyn RemediationHooks>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let engine =
            Arc::new(WorkflowEngine::new(config.engine.clone(), executor, Arc::clone(&telemetry)));
        let jobs = Arc::new(JobProcessor::new(config.jobs.clone(), Arc::clone(&telemetry)));
        let recovery = Arc::new(ErrorRecoverySystem::new(
            config.recovery.clone(),
            Arc::clone(&jobs) as Arc<dyn JobSubmitter>,
            Arc::clone(&engine) as Arc<dyn ExecutionControl>,
            hooks,
            telemetry,
        ));

        let workflow_handler = Arc::new(WorkflowExecutionHandler::new(Arc::clone(&engine)));
        jobs.register_handler(WORKFLOW_EXECUTION_JOB, workflow_handler.clone());
        jobs.register_handler(
            BATCH_JOB,
            Arc::new(BatchHandler::new(workflow_handler, config.engine.max_concurrent_executions)),
        );
        jobs.register_handler(CLEANUP_JOB, Arc::new(CleanupHandler::new(Arc::clone(&engine))));
        jobs.register_handler(ANALYTICS_JOB, Arc::new(AnalyticsHandler::new(Arc::clone(&engine))));
        jobs.register_handler(RECOVERY_JOB, Arc::new(recovery.job_handler()));

        Self { config, engine, jobs, recovery }
    }

    /// Dry-run wiring: echo step executor, logging remediation hooks and
    /// tracing telemetry.
    pub fn from_config(config: AppConfig) -> Self {
        Self::new(
            config,
            Arc::new(EchoStepExecutor),
            Arc::new(LoggingRemediationHooks),
            Arc::new(TracingTelemetrySink),
        )
    }

    pub fn bootstrap(options: LoadOptions) -> Result<Self, ApplicationError> {
        info!(event_name = "system.bootstrap.start", "starting service bootstrap");
        let config = AppConfig::load(options)?;
        let services = Self::from_config(config);
        info!(
            event_name = "system.bootstrap.ready",
            handlers = %services.jobs.handler_types().join(","),
            "services constructed"
        );
        Ok(services)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn jobs(&self) -> &Arc<JobProcessor> {
        &self.jobs
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoverySystem> {
        &self.recovery
    }

    /// Starts the scheduling loop and the task that hands terminal job
    /// failures to recovery and clears breaker streaks on completions.
    pub fn start(&self) -> ServicesHandle {
        let mut notices = self.jobs.subscribe();
        let mut completions = self.jobs.subscribe_completions();
        let recovery = Arc::clone(&self.recovery);
        let engine = Arc::clone(&self.engine);
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(notice) = notices.recv() => {
                        if notice.job.job_type == RECOVERY_JOB {
                            continue;
                        }
                        let recovery = Arc::clone(&recovery);
                        tokio::spawn(async move {
                            forward(&recovery, job_report(notice)).await;
                        });
                    }
                    Some(job) = completions.recv() => {
                        clear_job_failures(&recovery, &engine, &job);
                    }
                    else => break,
                }
            }
        });
        let processor = self.jobs.start();
        info!(event_name = "system.services.started", "services started");
        ServicesHandle { processor, forwarder }
    }

    /// Runs a workflow inline. A failed or timed-out run is reported to
    /// recovery before the state is returned.
    pub async fn run_execution(
        &self,
        context: ExecutionContext,
    ) -> Result<ExecutionState, ApplicationError> {
        let state = self.engine.execute_workflow(context).await?;
        clear_agent_failures(&self.recovery, &state);
        if let Some(report) = execution_report(&state) {
            forward(&self.recovery, report).await;
        }
        Ok(state)
    }

    /// Queues a workflow as a `workflow_execution` job after structural
    /// validation.
    pub fn submit_execution(
        &self,
        context: ExecutionContext,
        priority: JobPriority,
    ) -> Result<JobId, ApplicationError> {
        self.engine.validate(&context)?;
        let payload = serde_json::to_value(&context).map_err(|error| {
            EngineError::InvalidStructure(format!("context could not be serialized: {error}"))
        })?;
        let spec = JobSpec::new(WORKFLOW_EXECUTION_JOB, payload).with_priority(priority);
        Ok(self.jobs.add_job(spec)?)
    }

    pub fn get_execution(&self, id: &ExecutionId) -> Result<ExecutionState, ApplicationError> {
        self.engine.get_execution(id).ok_or_else(|| EngineError::NotFound(id.clone()).into())
    }

    pub fn list_executions(&self, status: Option<ExecutionStatus>) -> Vec<ExecutionState> {
        self.engine.list_executions(status)
    }

    pub fn cancel_execution(
        &self,
        id: &ExecutionId,
        reason: &str,
    ) -> Result<ExecutionState, ApplicationError> {
        let current = self.get_execution(id)?;
        if !self.engine.cancel_execution(id, reason) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: ExecutionStatus::Cancelled,
            }
            .into());
        }
        self.get_execution(id)
    }

    pub fn submit_job(&self, spec: JobSpec) -> Result<JobId, ApplicationError> {
        Ok(self.jobs.add_job(spec)?)
    }

    pub fn get_job(&self, id: &JobId) -> Result<Job, ApplicationError> {
        self.jobs.get_job(id).ok_or_else(|| JobError::NotFound(id.clone()).into())
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.jobs.list_jobs(status)
    }

    pub fn cancel_job(&self, id: &JobId, reason: &str) -> Result<Job, ApplicationError> {
        Ok(self.jobs.cancel_job(id, reason)?)
    }

    pub async fn report_error(
        &self,
        report: ErrorReport,
    ) -> Result<RecoveryContext, ApplicationError> {
        Ok(self.recovery.handle_error(report).await?)
    }

    pub fn job_stats(&self) -> JobStats {
        self.jobs.stats()
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery.stats()
    }

    pub fn recovery_health(&self) -> RecoveryHealth {
        self.recovery.health()
    }

    pub fn health(&self) -> ServiceHealth {
        let jobs = self.jobs.health();
        let recovery = self.recovery.health();
        ServiceHealth {
            healthy: jobs.healthy && recovery.healthy,
            engine: self.engine.snapshot(),
            jobs,
            recovery,
        }
    }
}

pub struct ServicesHandle {
    processor: ProcessorHandle,
    forwarder: JoinHandle<()>,
}

impl ServicesHandle {
    pub async fn shutdown(self) {
        self.processor.shutdown().await;
        self.forwarder.abort();
        let _ = self.forwarder.await;
        info!(event_name = "system.services.stopped", "services stopped");
    }
}

async fn forward(recovery: &ErrorRecoverySystem, report: ErrorReport) {
    let job_id = report.job_id.as_ref().map(JobId::to_string).unwrap_or_default();
    let execution_id = report.execution_id.as_ref().map(ExecutionId::to_string).unwrap_or_default();
    match recovery.handle_error(report).await {
        Ok(context) => info!(
            event_name = "system.recovery.handled",
            recovery_id = %context.id,
            job_id = %job_id,
            execution_id = %execution_id,
            state = context.state.as_str(),
            "failure handed to recovery"
        ),
        Err(error) => warn!(
            event_name = "system.recovery.rejected",
            job_id = %job_id,
            execution_id = %execution_id,
            error = %error,
            "recovery rejected the failure report"
        ),
    }
}

/// Every agent with a completed step breaks its failure streak, whatever
/// the run's final status.
fn clear_agent_failures(recovery: &ErrorRecoverySystem, state: &ExecutionState) {
    let agents: BTreeSet<&str> = state
        .step_results
        .values()
        .filter(|result| result.status == StepStatus::Completed)
        .map(|result| result.agent_id.as_str())
        .collect();
    for agent in agents {
        recovery.clear_failures(agent);
    }
}

fn clear_job_failures(recovery: &ErrorRecoverySystem, engine: &WorkflowEngine, job: &Job) {
    if job.job_type == WORKFLOW_EXECUTION_JOB {
        let execution = job
            .result
            .as_ref()
            .and_then(|result| result.get("execution_id"))
            .and_then(Value::as_str)
            .and_then(|id| engine.get_execution(&ExecutionId(id.to_owned())));
        if let Some(state) = execution {
            clear_agent_failures(recovery, &state);
        }
        return;
    }
    recovery.clear_failures(&job_agent(job).map_or_else(|| GLOBAL_KEY.to_owned(), |(id, _)| id));
}

/// The agent a job ran for: the failing agent recorded in its result, else
/// `agent_id` / `agent_type` in its payload.
fn job_agent(job: &Job) -> Option<(String, Option<String>)> {
    [job.result.as_ref(), Some(&job.payload)].into_iter().flatten().find_map(|value| {
        let id = value.get("agent_id").and_then(Value::as_str)?;
        let agent_type = value.get("agent_type").and_then(Value::as_str).map(str::to_owned);
        Some((id.to_owned(), agent_type))
    })
}

/// Report for a terminal job failure, keyed to the job's agent when it has one.
pub fn job_report(notice: JobNotice) -> ErrorReport {
    let JobNotice { job, failure } = notice;
    let mut error = ReportedError::new("JobFailure", failure.message);
    error.code = failure.code;
    if let Some((agent_id, agent_type)) = job_agent(&job) {
        error.agent_id = Some(agent_id);
        error.agent_type = agent_type;
    }
    error.details.insert("job_type".to_owned(), json!(job.job_type));
    error.details.insert("retryable".to_owned(), json!(failure.retryable));
    ErrorReport::for_job(job, error)
}

/// Report for a failed or timed-out execution; `None` for any other status.
pub fn execution_report(state: &ExecutionState) -> Option<ErrorReport> {
    let name = match state.status {
        ExecutionStatus::Failed => "ExecutionFailure",
        ExecutionStatus::Timeout => "ExecutionTimeout",
        _ => return None,
    };
    let mut error = match state.last_error() {
        Some(record) => {
            let mut error =
                ReportedError::new(name, record.message.clone()).with_code(&record.code);
            let step = record
                .step_id
                .as_deref()
                .and_then(|step_id| state.context.workflow.steps.iter().find(|s| s.id == step_id));
            if let Some(step) = step {
                error.details.insert("step_id".to_owned(), json!(step.id));
                if let Some(agent) = state.context.workflow.agent(&step.agent_id) {
                    error = error.with_agent(&agent.id, &agent.agent_type);
                }
            }
            error
        }
        None => ReportedError::new(
            name,
            format!("execution {} ended {}", state.id, state.status.as_str()),
        ),
    };
    error.details.insert("workflow".to_owned(), json!(state.workflow_name));
    Some(ErrorReport::for_execution(state.clone(), error))
}
