//! Background job processor.
//!
//! Jobs live in an in-memory table ([`queue::JobQueue`]) guarded by a mutex;
//! handlers run as spawned tasks racing the job timeout. Terminal failures
//! are published on an optional [`JobNotice`] channel so the service wiring
//! can hand them to the recovery system.

pub mod handlers;
mod queue;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::JobsConfig;
use crate::domain::job::{Job, JobConfig, JobFailure, JobId, JobSpec, JobStatus};
use crate::sync::lock;
use crate::telemetry::{TelemetryCategory, TelemetryEvent, TelemetryOutcome, TelemetrySink};

use queue::{FailureDisposition, JobQueue};

pub use handlers::{
    AnalyticsHandler, BatchHandler, CleanupHandler, WorkflowExecutionHandler,
    WORKFLOW_EXECUTION_JOB,
};

pub const BATCH_JOB: &str = "batch";
pub const CLEANUP_JOB: &str = "cleanup";
pub const ANALYTICS_JOB: &str = "analytics";
pub const RECOVERY_JOB: &str = "recovery";

pub(crate) const JOB_TIMEOUT_CODE: &str = "JOB_TIMEOUT";
pub(crate) const NO_HANDLER_CODE: &str = "NO_HANDLER";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job type must not be empty")]
    EmptyJobType,
    #[error("no handler registered for job type `{0}`")]
    NoHandler(String),
    #[error("invalid job config: {0}")]
    InvalidConfig(String),
    #[error("job id `{0}` is already in use")]
    DuplicateId(JobId),
    #[error("unknown dependency `{0}`")]
    UnknownDependency(JobId),
    #[error("dependency `{0}` already failed or was cancelled")]
    DependencyFailed(JobId),
    #[error("dependency cycle: {}", format_cycle(.0))]
    DependencyCycle(Vec<JobId>),
    #[error("job queue is full ({limit} jobs waiting or running)")]
    QueueFull { limit: usize },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid job transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

fn format_cycle(path: &[JobId]) -> String {
    path.iter().map(JobId::as_str).collect::<Vec<_>>().join(" -> ")
}

/// What a handler reports for one run of a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    #[serde(default)]
    pub progress: f64,
}

impl JobOutcome {
    pub fn succeeded(result: Value) -> Self {
        Self { success: true, result: Some(result), error: None, progress: 1.0 }
    }

    pub fn failed(failure: JobFailure) -> Self {
        Self { success: false, result: None, error: Some(failure), progress: 0.0 }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }
}

/// Processes jobs of one registered type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: &Job) -> JobOutcome;
}

/// Published for every terminal job failure.
#[derive(Clone, Debug, PartialEq)]
pub struct JobNotice {
    pub job: Job,
    pub failure: JobFailure,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Pending plus retrying.
    pub queue_depth: usize,
    pub waiting_by_type: BTreeMap<String, usize>,
    pub failure_rate: f64,
    pub average_processing_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobHealth {
    pub healthy: bool,
    pub breaches: Vec<String>,
    pub stats: JobStats,
}

pub struct JobProcessor {
    config: JobsConfig,
    defaults: JobConfig,
    queue: Mutex<JobQueue>,
    handlers: Mutex<HashMap<String, Arc<dyn JobHandler>>>,
    running: Mutex<HashMap<JobId, AbortHandle>>,
    notices: Mutex<Option<mpsc::UnboundedSender<JobNotice>>>,
    completions: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl JobProcessor {
    pub fn new(config: JobsConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let defaults = config.default_job_config();
        Self {
            config,
            defaults,
            queue: Mutex::new(JobQueue::default()),
            handlers: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            notices: Mutex::new(None),
            completions: Mutex::new(None),
            telemetry,
        }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Registers `handler` for `job_type`, returning the handler it replaced.
    pub fn register_handler(
        &self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        let job_type = job_type.into();
        debug!(
            event_name = "jobs.handler.registered",
            job_type = %job_type,
            "job handler registered"
        );
        lock(&self.handlers).insert(job_type, handler)
    }

    pub fn unregister_handler(&self, job_type: &str) -> bool {
        lock(&self.handlers).remove(job_type).is_some()
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        lock(&self.handlers).contains_key(job_type)
    }

    pub fn handler_types(&self) -> Vec<String> {
        let mut types: Vec<String> = lock(&self.handlers).keys().cloned().collect();
        types.sort();
        types
    }

    /// Opens the failure channel. A later call replaces the previous receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobNotice> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *lock(&self.notices) = Some(sender);
        receiver
    }

    /// Opens the completion channel: every job that settles `completed`.
    pub fn subscribe_completions(&self) -> mpsc::UnboundedReceiver<Job> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *lock(&self.completions) = Some(sender);
        receiver
    }

    pub fn add_job(&self, spec: JobSpec) -> Result<JobId, JobError> {
        if !spec.job_type.trim().is_empty() && !self.has_handler(&spec.job_type) {
            return Err(JobError::NoHandler(spec.job_type));
        }

        let job = lock(&self.queue).insert(
            spec,
            &self.defaults,
            self.config.max_queue_size,
            Utc::now(),
        )?;

        info!(
            event_name = "jobs.job.created",
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority.as_str(),
            dependencies = job.dependencies.len(),
            "job enqueued"
        );
        self.emit(
            TelemetryEvent::new(
                "job.created",
                TelemetryCategory::Job,
                job.id.as_str(),
                TelemetryOutcome::Info,
            )
            .with_metadata("job_type", job.job_type.clone())
            .with_metadata("priority", job.priority.as_str()),
        );
        Ok(job.id)
    }

    /// Cancels a pending, retrying or running job. Dependents that can no
    /// longer run are cancelled with it.
    pub fn cancel_job(&self, id: &JobId, reason: &str) -> Result<Job, JobError> {
        let (job, cascaded) = lock(&self.queue).cancel(id, reason, Utc::now())?;
        if let Some(handle) = lock(&self.running).remove(id) {
            handle.abort();
        }

        info!(
            event_name = "jobs.job.cancelled",
            job_id = %id,
            reason,
            cascaded = cascaded.len(),
            "job cancelled"
        );
        self.emit_cancelled(id, reason);
        for dependent in &cascaded {
            self.emit_cancelled(dependent, "dependency cancelled");
        }
        Ok(job)
    }

    pub fn get_job(&self, id: &JobId) -> Option<Job> {
        lock(&self.queue).get(id).cloned()
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        lock(&self.queue).list(status)
    }

    pub fn stats(&self) -> JobStats {
        lock(&self.queue).stats()
    }

    /// Drops terminal jobs that finished more than `older_than` ago.
    pub fn evict_terminal(&self, older_than: chrono::Duration) -> usize {
        let evicted = lock(&self.queue).evict(Utc::now() - older_than);
        if evicted > 0 {
            debug!(event_name = "jobs.evicted", evicted, "terminal jobs evicted");
        }
        evicted
    }

    /// Compares queue depth, failure rate and processing time with the
    /// alert thresholds. Reports only; takes no corrective action.
    pub fn health(&self) -> JobHealth {
        let stats = self.stats();
        let mut breaches = Vec::new();

        if stats.queue_depth > self.config.alert_queue_depth {
            breaches.push(format!(
                "queue depth {} exceeds {}",
                stats.queue_depth, self.config.alert_queue_depth
            ));
        }
        if stats.completed + stats.failed > 0 && stats.failure_rate > self.config.alert_failure_rate
        {
            breaches.push(format!(
                "failure rate {:.2} exceeds {:.2}",
                stats.failure_rate, self.config.alert_failure_rate
            ));
        }
        let slow_after = self.config.alert_avg_processing_ms;
        if let Some(average) = stats.average_processing_ms.filter(|average| *average > slow_after) {
            breaches.push(format!(
                "average processing time {average}ms exceeds {slow_after}ms"
            ));
        }

        for breach in &breaches {
            warn!(
                event_name = "jobs.health.breach",
                breach = %breach,
                "job processor health threshold breached"
            );
        }
        JobHealth { healthy: breaches.is_empty(), breaches, stats }
    }

    /// One scheduler tick: promotes elapsed retries, fails expired jobs,
    /// then claims ready jobs up to the free worker slots and spawns their
    /// handlers. Must be called from within a tokio runtime.
    pub fn dispatch_ready(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let now = Utc::now();
        let (expired, claimed) = {
            let mut queue = lock(&self.queue);
            queue.promote_retrying(now);
            let expired = queue.expire_deadlines(now);
            let free_slots = self.config.worker_count.saturating_sub(queue.running_count());
            let claimed = queue.claim_ready(now, free_slots.min(self.config.batch_size));
            (expired, claimed)
        };

        for (job, cascaded) in expired {
            self.report_terminal_failure(job, cascaded);
        }

        for job in &claimed {
            info!(
                event_name = "jobs.job.started",
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.retry_count + 1,
                "job started"
            );
            self.emit(
                TelemetryEvent::new(
                    "job.started",
                    TelemetryCategory::Job,
                    job.id.as_str(),
                    TelemetryOutcome::Info,
                )
                .with_metadata("job_type", job.job_type.clone())
                .with_metadata("attempt", (job.retry_count + 1).to_string()),
            );
        }

        let mut handles = Vec::with_capacity(claimed.len());
        let mut running = lock(&self.running);
        for job in claimed {
            let id = job.id.clone();
            let handle = tokio::spawn(Arc::clone(self).run_job(job));
            running.insert(id, handle.abort_handle());
            handles.push(handle);
        }
        handles
    }

    /// Drives the queue until no job is waiting or running.
    pub async fn drain(self: &Arc<Self>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let handles = self.dispatch_ready();
            if !handles.is_empty() {
                for handle in handles {
                    if let Err(join_error) = handle.await {
                        if !join_error.is_cancelled() {
                            error!(
                                event_name = "jobs.job.join_failed",
                                error = %join_error,
                                "job task ended abnormally"
                            );
                        }
                    }
                }
                continue;
            }

            let now = Utc::now();
            let wait = {
                let queue = lock(&self.queue);
                if queue.running_count() > 0 {
                    Some(poll)
                } else {
                    queue
                        .next_wake_after(now)
                        .map(|at| (at - now).to_std().unwrap_or(poll).max(Duration::from_millis(1)))
                }
            };
            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => break,
            }
        }
    }

    /// Spawns the scheduling loop: dispatch every poll interval, health and
    /// retention eviction every health interval.
    pub fn start(self: &Arc<Self>) -> ProcessorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let processor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut poll = tokio::time::interval(Duration::from_millis(
                processor.config.poll_interval_ms.max(1),
            ));
            let mut maintenance = tokio::time::interval(Duration::from_secs(
                processor.config.health_interval_secs.max(1),
            ));
            let retention = chrono::Duration::seconds(processor.config.retention_secs as i64);

            info!(
                event_name = "jobs.processor.started",
                workers = processor.config.worker_count,
                poll_interval_ms = processor.config.poll_interval_ms,
                "job processor started"
            );
            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        processor.dispatch_ready();
                    }
                    _ = maintenance.tick() => {
                        processor.health();
                        processor.evict_terminal(retention);
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!(
                                event_name = "jobs.processor.stopped",
                                "job processor shutting down"
                            );
                            break;
                        }
                    }
                }
            }
        });
        ProcessorHandle { shutdown: shutdown_tx, task }
    }

    async fn run_job(self: Arc<Self>, job: Job) {
        let handler = lock(&self.handlers).get(&job.job_type).cloned();
        let outcome = match handler {
            None => JobOutcome::failed(
                JobFailure::terminal(format!("no handler registered for `{}`", job.job_type))
                    .with_code(NO_HANDLER_CODE),
            ),
            Some(handler) => {
                let budget = Duration::from_millis(job.config.timeout_ms);
                match tokio::time::timeout(budget, handler.process(&job)).await {
                    Ok(outcome) => outcome,
                    Err(_) => JobOutcome::failed(
                        JobFailure::retryable(format!(
                            "job `{}` timed out after {}ms",
                            job.id, job.config.timeout_ms
                        ))
                        .with_code(JOB_TIMEOUT_CODE),
                    ),
                }
            }
        };

        lock(&self.running).remove(&job.id);
        self.settle(&job.id, outcome);
    }

    fn settle(&self, id: &JobId, outcome: JobOutcome) {
        let now = Utc::now();

        if outcome.success {
            let completed = {
                let mut queue = lock(&self.queue);
                queue
                    .complete(id, outcome.result, now)
                    .map(|job| {
                        let next = JobQueue::next_occurrence(&job, now);
                        (job, next)
                    })
            };
            let Some((job, next)) = completed else {
                debug!(
                    event_name = "jobs.job.discarded",
                    job_id = %id,
                    "job settled after cancellation; result discarded"
                );
                return;
            };

            info!(
                event_name = "jobs.job.completed",
                job_id = %id,
                job_type = %job.job_type,
                retries = job.retry_count,
                "job completed"
            );
            self.emit(
                TelemetryEvent::new(
                    "job.completed",
                    TelemetryCategory::Job,
                    id.as_str(),
                    TelemetryOutcome::Success,
                )
                .with_metadata("job_type", job.job_type.clone()),
            );
            if let Some(sender) = lock(&self.completions).as_ref() {
                if sender.send(job).is_err() {
                    debug!(
                        event_name = "jobs.completion.dropped",
                        "completion channel closed; notice dropped"
                    );
                }
            }

            if let Some(spec) = next {
                match self.add_job(spec) {
                    Ok(next_id) => debug!(
                        event_name = "jobs.recurrence.scheduled",
                        job_id = %id,
                        next_job_id = %next_id,
                        "next occurrence scheduled"
                    ),
                    Err(error) => warn!(
                        event_name = "jobs.recurrence.rejected",
                        job_id = %id,
                        error = %error,
                        "next occurrence could not be scheduled"
                    ),
                }
            }
            return;
        }

        let failure = outcome
            .error
            .unwrap_or_else(|| JobFailure::retryable("handler reported failure without detail"));
        let disposition = {
            let mut queue = lock(&self.queue);
            queue.set_progress(id, outcome.progress, now);
            queue.fail(id, failure, outcome.result, now)
        };

        match disposition {
            None => {
                debug!(
                    event_name = "jobs.job.discarded",
                    job_id = %id,
                    "job settled after cancellation; failure discarded"
                );
            }
            Some(FailureDisposition::Retrying { job, delay_ms }) => {
                let message =
                    job.error.as_ref().map(|error| error.message.clone()).unwrap_or_default();
                warn!(
                    event_name = "jobs.job.retrying",
                    job_id = %id,
                    job_type = %job.job_type,
                    retry = job.retry_count,
                    max_retries = job.config.max_retries,
                    delay_ms,
                    error = %message,
                    "job failed; retry scheduled"
                );
                self.emit(
                    TelemetryEvent::new(
                        "job.retrying",
                        TelemetryCategory::Job,
                        id.as_str(),
                        TelemetryOutcome::Failed,
                    )
                    .with_metadata("retry", job.retry_count.to_string())
                    .with_metadata("delay_ms", delay_ms.to_string()),
                );
            }
            Some(FailureDisposition::Failed { job, cascaded }) => {
                self.report_terminal_failure(job, cascaded);
            }
        }
    }

    fn report_terminal_failure(&self, job: Job, cascaded: Vec<JobId>) {
        let failure =
            job.error.clone().unwrap_or_else(|| JobFailure::terminal("job failed without detail"));
        error!(
            event_name = "jobs.job.failed",
            job_id = %job.id,
            job_type = %job.job_type,
            retries = job.retry_count,
            retries_exhausted = job.retries_exhausted,
            error_code = failure.code.as_deref().unwrap_or("none"),
            error = %failure.message,
            "job failed"
        );
        let mut event = TelemetryEvent::new(
            "job.failed",
            TelemetryCategory::Job,
            job.id.as_str(),
            TelemetryOutcome::Failed,
        )
        .with_metadata("job_type", job.job_type.clone())
        .with_metadata("retries_exhausted", job.retries_exhausted.to_string());
        if let Some(code) = &failure.code {
            event = event.with_metadata("error_code", code.clone());
        }
        self.emit(event);

        for dependent in &cascaded {
            self.emit_cancelled(dependent, "dependency failed");
        }

        if let Some(sender) = lock(&self.notices).as_ref() {
            if sender.send(JobNotice { job, failure }).is_err() {
                debug!(
                    event_name = "jobs.notice.dropped",
                    "failure channel closed; notice dropped"
                );
            }
        }
    }

    fn emit_cancelled(&self, id: &JobId, reason: &str) {
        self.emit(
            TelemetryEvent::new(
                "job.cancelled",
                TelemetryCategory::Job,
                id.as_str(),
                TelemetryOutcome::Rejected,
            )
            .with_metadata("reason", reason),
        );
    }

    fn emit(&self, event: TelemetryEvent) {
        self.telemetry.emit(event);
    }
}

/// Stops the loop spawned by [`JobProcessor::start`].
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProcessorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(join_error) = self.task.await {
            error!(
                event_name = "jobs.processor.join_failed",
                error = %join_error,
                "job processor loop ended abnormally"
            );
        }
    }
}
