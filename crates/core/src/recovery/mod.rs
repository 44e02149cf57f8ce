//! Error recovery system.
//!
//! [`ErrorRecoverySystem::handle_error`] classifies a failure, consults the
//! circuit breaker for the failing agent, then runs matching recovery rules
//! (or the default strategy). Re-enqueued work goes back through the job
//! processor via [`JobSubmitter`]; cancellation of live executions goes
//! through [`ExecutionControl`].

mod actions;
mod circuit_breaker;
mod classify;
mod hooks;
mod rules;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::domain::execution::{ExecutionId, ExecutionState};
use crate::domain::job::{Job, JobFailure, JobId, JobPriority, JobSpec};
use crate::domain::recovery::{
    CircuitBreaker, ErrorCategory, ErrorClassification, ErrorReport, RecoveryAction,
    RecoveryAttempt, RecoveryContext, RecoveryRule, RecoveryState,
};
use crate::engine::WorkflowEngine;
use crate::jobs::{JobError, JobHandler, JobOutcome, JobProcessor, RECOVERY_JOB};
use crate::sync::lock;
use crate::telemetry::{TelemetryCategory, TelemetryEvent, TelemetryOutcome, TelemetrySink};

use actions::{ActionResult, ActionRunner};
use circuit_breaker::BreakerRegistry;
use rules::RuleBook;

pub use circuit_breaker::BreakerDecision;
pub use classify::classify;
pub use hooks::{
    LoggingRemediationHooks, Notification, RemediationError, RemediationHooks, RollbackRequest,
    ScaleRequest,
};

pub(crate) const RECOVERY_AT_CAPACITY_CODE: &str = "RECOVERY_AT_CAPACITY";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("error report needs a name or a message")]
    EmptyReport,
    #[error("invalid recovery rule: {0}")]
    InvalidRule(String),
    #[error("recovery rule `{0}` already exists")]
    DuplicateRule(String),
    #[error("recovery rule `{0}` not found")]
    RuleNotFound(String),
    #[error("recovery capacity reached ({limit} active)")]
    AtCapacity { limit: usize },
    #[error("deferred recovery could not be queued: {0}")]
    DeferralRejected(String),
}

/// Lets recovery re-enqueue and cancel work without owning the processor.
pub trait JobSubmitter: Send + Sync {
    fn submit(&self, spec: JobSpec) -> Result<JobId, JobError>;
    fn cancel(&self, id: &JobId, reason: &str) -> bool;
}

impl JobSubmitter for JobProcessor {
    fn submit(&self, spec: JobSpec) -> Result<JobId, JobError> {
        self.add_job(spec)
    }

    fn cancel(&self, id: &JobId, reason: &str) -> bool {
        self.cancel_job(id, reason).is_ok()
    }
}

/// Read and cancel access to executions owned by the engine.
pub trait ExecutionControl: Send + Sync {
    fn get_execution(&self, id: &ExecutionId) -> Option<ExecutionState>;
    fn cancel_execution(&self, id: &ExecutionId, reason: &str) -> bool;
}

impl ExecutionControl for WorkflowEngine {
    fn get_execution(&self, id: &ExecutionId) -> Option<ExecutionState> {
        WorkflowEngine::get_execution(self, id)
    }

    fn cancel_execution(&self, id: &ExecutionId, reason: &str) -> bool {
        WorkflowEngine::cancel_execution(self, id, reason)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub executions: u32,
    pub successes: u32,
    pub failures: u32,
    pub success_rate: Option<f64>,
    pub average_duration_ms: Option<u64>,
}

impl RuleSummary {
    fn from_rule(rule: &RecoveryRule) -> Self {
        let stats = &rule.stats;
        Self {
            id: rule.id.clone(),
            name: rule.name.clone(),
            enabled: rule.config.enabled,
            priority: rule.config.priority,
            executions: stats.executions,
            successes: stats.successes,
            failures: stats.failures,
            success_rate: stats.success_rate(),
            average_duration_ms: (stats.executions > 0)
                .then(|| stats.total_duration_ms / u64::from(stats.executions)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub deferred: u64,
    pub active: usize,
    /// Completed over completed plus failed.
    pub success_rate: Option<f64>,
    pub rules: Vec<RuleSummary>,
    pub breakers: Vec<CircuitBreaker>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub stats: RecoveryStats,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    completed: u64,
    failed: u64,
    abandoned: u64,
    deferred: u64,
}

/// Where a report entered the system. Deferred reports already counted
/// against the breaker when they first arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    Fresh,
    Deferred,
}

struct ActiveSlot<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ErrorRecoverySystem {
    config: RecoveryConfig,
    rules: Mutex<RuleBook>,
    breakers: Arc<Mutex<BreakerRegistry>>,
    counters: Mutex<Counters>,
    active: AtomicUsize,
    runner: ActionRunner,
    jobs: Arc<dyn JobSubmitter>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ErrorRecoverySystem {
    pub fn new(
        config: RecoveryConfig,
        jobs: Arc<dyn JobSubmitter>,
        executions: Arc<dyn ExecutionControl>,
        hooks: Arc<dyn RemediationHooks>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let breakers = Arc::new(Mutex::new(BreakerRegistry::new(
            config.breaker_threshold,
            config.breaker_cooldown_ms,
        )));
        let runner = ActionRunner {
            config: config.clone(),
            jobs: Arc::clone(&jobs),
            executions,
            hooks,
            breakers: Arc::clone(&breakers),
        };
        Self {
            config,
            rules: Mutex::new(RuleBook::default()),
            breakers,
            counters: Mutex::new(Counters::default()),
            active: AtomicUsize::new(0),
            runner,
            jobs,
            telemetry,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn add_rule(&self, rule: RecoveryRule) -> Result<(), RecoveryError> {
        let id = rule.id.clone();
        lock(&self.rules).add(rule)?;
        info!(event_name = "recovery.rule.added", rule_id = %id, "recovery rule added");
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> Result<RecoveryRule, RecoveryError> {
        lock(&self.rules).remove(id).ok_or_else(|| RecoveryError::RuleNotFound(id.to_owned()))
    }

    pub fn rules(&self) -> Vec<RecoveryRule> {
        lock(&self.rules).list()
    }

    pub fn breaker(&self, key: &str) -> Option<CircuitBreaker> {
        lock(&self.breakers).get(key).cloned()
    }

    /// Closes the breaker for `key` after a confirmed success.
    pub fn record_success(&self, key: &str) {
        lock(&self.breakers).record_success(key);
    }

    /// Notes a success for `key` (a completed step, execution or job). Only
    /// consecutive failures count towards opening a breaker.
    pub fn clear_failures(&self, key: &str) {
        lock(&self.breakers).clear_failures(key);
    }

    pub fn active_recoveries(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Handler for `recovery` jobs, which carry reports deferred at capacity.
    pub fn job_handler(self: &Arc<Self>) -> RecoveryJobHandler {
        RecoveryJobHandler { system: Arc::downgrade(self) }
    }

    /// Runs one recovery episode for `report`. When every recovery slot is
    /// taken the report is queued as a `recovery` job and the returned
    /// context is `deferred`.
    pub async fn handle_error(
        &self,
        report: ErrorReport,
    ) -> Result<RecoveryContext, RecoveryError> {
        self.recover(report, Admission::Fresh).await
    }

    async fn recover(
        &self,
        report: ErrorReport,
        admission: Admission,
    ) -> Result<RecoveryContext, RecoveryError> {
        if report.error.name.trim().is_empty() && report.error.message.trim().is_empty() {
            return Err(RecoveryError::EmptyReport);
        }

        let classification = classify(&report.error);
        let key = report.breaker_key();
        let now = Utc::now();

        let decision = lock(&self.breakers).allow_request_at(&key, now);
        if decision == BreakerDecision::Rejected {
            let context = RecoveryContext::new(report, classification);
            return Ok(self.abandon(context, &format!("circuit breaker `{key}` is open")));
        }
        let trial = decision == BreakerDecision::Trial;
        if !trial && admission == Admission::Fresh {
            lock(&self.breakers).record_failure_at(&key, now);
        }

        if !classification.recoverable {
            if trial {
                lock(&self.breakers).record_failure_at(&key, now);
            }
            let reason = format!("{} errors are not recoverable", classification.category.as_str());
            return Ok(self.abandon(RecoveryContext::new(report, classification), &reason));
        }

        let Some(_slot) = self.try_acquire() else {
            if trial {
                lock(&self.breakers).release_trial(&key);
            }
            return match admission {
                Admission::Fresh => self.defer(report, classification),
                Admission::Deferred => Err(RecoveryError::AtCapacity {
                    limit: self.config.max_concurrent_recoveries,
                }),
            };
        };

        let view = report_view(&report, &classification);
        let mut context = RecoveryContext::new(report, classification);
        context.state = RecoveryState::InProgress;
        info!(
            event_name = "recovery.started",
            recovery_id = %context.id,
            category = context.classification.category.as_str(),
            severity = context.classification.severity.as_str(),
            breaker = %key,
            "recovery started"
        );
        self.emit(self.event(&context, "recovery.started", TelemetryOutcome::Info));

        let resolved = self.run_rules(&mut context, &view).await;

        let state = if resolved { RecoveryState::Completed } else { RecoveryState::Failed };
        context.finish(state);
        if trial {
            let mut breakers = lock(&self.breakers);
            if resolved {
                breakers.record_success(&key);
            } else {
                breakers.record_failure_at(&key, Utc::now());
            }
        }

        {
            let mut counters = lock(&self.counters);
            counters.total += 1;
            if resolved {
                counters.completed += 1;
            } else {
                counters.failed += 1;
            }
        }

        if resolved {
            info!(
                event_name = "recovery.resolved",
                recovery_id = %context.id,
                attempts = context.attempts.len(),
                rules = %context.matched_rules.join(","),
                "recovery resolved"
            );
            self.emit(self.event(&context, "recovery.resolved", TelemetryOutcome::Success));
        } else {
            warn!(
                event_name = "recovery.failed",
                recovery_id = %context.id,
                attempts = context.attempts.len(),
                error = %context.error.message,
                "recovery did not resolve the failure"
            );
            self.emit(self.event(&context, "recovery.failed", TelemetryOutcome::Failed));
        }
        Ok(context)
    }

    /// Tries applicable rules by descending priority until one resolves the
    /// failure; falls back to the default strategy when none applies.
    async fn run_rules(&self, context: &mut RecoveryContext, view: &Value) -> bool {
        let applicable = lock(&self.rules).applicable(
            &context.error,
            &context.classification,
            view,
            Utc::now(),
        );

        for rule in applicable {
            lock(&self.rules).mark_fired(&rule.id, Utc::now());
            context.matched_rules.push(rule.id.clone());

            let clock = Instant::now();
            let results = if rule.config.parallel {
                self.run_parallel(&rule.actions, context).await
            } else {
                self.run_sequential(&rule.actions, context).await
            };
            let resolved = results.iter().any(|result| result.resolves);
            let succeeded = resolved || results.iter().all(|result| result.attempt.success);
            absorb(context, results);

            lock(&self.rules).record_outcome(
                &rule.id,
                succeeded,
                clock.elapsed().as_millis() as u64,
            );
            if resolved {
                return true;
            }
        }

        if !context.matched_rules.is_empty() {
            return false;
        }
        let Some(action) = default_action(&context.classification) else {
            info!(
                event_name = "recovery.no_strategy",
                recovery_id = %context.id,
                category = context.classification.category.as_str(),
                "no rule or default strategy applies"
            );
            return false;
        };
        let result = self.runner.run(&action, context).await;
        let resolved = result.resolves;
        absorb(context, vec![result]);
        resolved
    }

    async fn run_sequential(
        &self,
        actions: &[RecoveryAction],
        context: &RecoveryContext,
    ) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            let result = self.runner.run(action, context).await;
            let resolves = result.resolves;
            results.push(result);
            if resolves {
                break;
            }
        }
        results
    }

    async fn run_parallel(
        &self,
        actions: &[RecoveryAction],
        context: &RecoveryContext,
    ) -> Vec<ActionResult> {
        let mut join_set = JoinSet::new();
        for (index, action) in actions.iter().cloned().enumerate() {
            let runner = self.runner.clone();
            let snapshot = context.clone();
            join_set.spawn(async move { (index, runner.run(&action, &snapshot).await) });
        }

        let mut slots: Vec<Option<ActionResult>> = actions.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(join_error) => warn!(
                    event_name = "recovery.action.aborted",
                    recovery_id = %context.id,
                    error = %join_error,
                    "recovery action task ended without a result"
                ),
            }
        }

        slots
            .into_iter()
            .zip(actions)
            .map(|(slot, action)| {
                slot.unwrap_or_else(|| ActionResult {
                    attempt: RecoveryAttempt {
                        action: action.kind(),
                        success: false,
                        error: Some("action task aborted".to_owned()),
                        metadata: serde_json::Map::new(),
                        started_at: Utc::now(),
                        duration_ms: 0,
                    },
                    resolves: false,
                    escalated_to: None,
                })
            })
            .collect()
    }

    fn try_acquire(&self) -> Option<ActiveSlot<'_>> {
        let limit = self.config.max_concurrent_recoveries;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < limit).then_some(active + 1)
            })
            .ok()
            .map(|_| ActiveSlot { active: &self.active })
    }

    fn defer(
        &self,
        report: ErrorReport,
        classification: ErrorClassification,
    ) -> Result<RecoveryContext, RecoveryError> {
        let payload = serde_json::to_value(&report)
            .map_err(|error| RecoveryError::DeferralRejected(error.to_string()))?;
        let spec = JobSpec::new(RECOVERY_JOB, payload).with_priority(JobPriority::High);
        let job_id = self
            .jobs
            .submit(spec)
            .map_err(|error| RecoveryError::DeferralRejected(error.to_string()))?;

        let mut context = RecoveryContext::new(report, classification);
        context.state = RecoveryState::Deferred;
        context.deferred_job_id = Some(job_id.clone());
        lock(&self.counters).deferred += 1;

        info!(
            event_name = "recovery.deferred",
            recovery_id = %context.id,
            job_id = %job_id,
            limit = self.config.max_concurrent_recoveries,
            "recovery capacity reached; episode queued"
        );
        self.emit(
            self.event(&context, "recovery.deferred", TelemetryOutcome::Info)
                .with_metadata("deferred_job_id", job_id.0),
        );
        Ok(context)
    }

    fn abandon(&self, mut context: RecoveryContext, reason: &str) -> RecoveryContext {
        context.finish(RecoveryState::Abandoned);
        {
            let mut counters = lock(&self.counters);
            counters.total += 1;
            counters.abandoned += 1;
        }
        warn!(
            event_name = "recovery.abandoned",
            recovery_id = %context.id,
            category = context.classification.category.as_str(),
            reason,
            "recovery abandoned"
        );
        self.emit(
            self.event(&context, "recovery.abandoned", TelemetryOutcome::Rejected)
                .with_metadata("reason", reason),
        );
        context
    }

    pub fn stats(&self) -> RecoveryStats {
        let counters = lock(&self.counters);
        let settled = counters.completed + counters.failed;
        RecoveryStats {
            total: counters.total,
            completed: counters.completed,
            failed: counters.failed,
            abandoned: counters.abandoned,
            deferred: counters.deferred,
            active: self.active_recoveries(),
            success_rate: (settled > 0).then(|| counters.completed as f64 / settled as f64),
            rules: lock(&self.rules).list().iter().map(RuleSummary::from_rule).collect(),
            breakers: lock(&self.breakers).snapshot(),
        }
    }

    /// Unhealthy when every slot is busy, the success rate is below the floor
    /// after enough samples, or too many breakers are open.
    pub fn health(&self) -> RecoveryHealth {
        let stats = self.stats();
        let mut issues = Vec::new();

        if stats.active >= self.config.max_concurrent_recoveries {
            issues.push(format!(
                "all {} recovery slots are busy",
                self.config.max_concurrent_recoveries
            ));
        }
        let samples = stats.completed + stats.failed;
        let enough_samples = samples >= u64::from(self.config.min_samples);
        if let Some(rate) = stats.success_rate {
            if enough_samples && rate < self.config.min_success_rate {
                issues.push(format!(
                    "success rate {rate:.2} is below {:.2}",
                    self.config.min_success_rate
                ));
            }
        }
        let open = lock(&self.breakers).open_count();
        if open > self.config.max_open_breakers {
            issues.push(format!(
                "{open} circuit breakers open (limit {})",
                self.config.max_open_breakers
            ));
        }

        for issue in &issues {
            warn!(event_name = "recovery.health.issue", issue = %issue, "recovery health degraded");
        }
        RecoveryHealth { healthy: issues.is_empty(), issues, stats }
    }

    fn event(
        &self,
        context: &RecoveryContext,
        event_type: &str,
        outcome: TelemetryOutcome,
    ) -> TelemetryEvent {
        let correlation = context
            .execution_id
            .as_ref()
            .map(|id| id.0.clone())
            .or_else(|| context.job_id.as_ref().map(|id| id.0.clone()))
            .unwrap_or_else(|| context.id.clone());
        TelemetryEvent::new(event_type, TelemetryCategory::Recovery, context.id.as_str(), outcome)
            .with_correlation_id(correlation)
            .with_metadata("category", context.classification.category.as_str())
            .with_metadata("severity", context.classification.severity.as_str())
            .with_metadata("attempts", context.attempts.len().to_string())
    }

    fn emit(&self, event: TelemetryEvent) {
        self.telemetry.emit(event);
    }
}

fn absorb(context: &mut RecoveryContext, results: Vec<ActionResult>) {
    for result in results {
        if let Some(severity) = result.escalated_to {
            context.classification.severity = severity;
        }
        context.attempts.push(result.attempt);
    }
}

/// Strategy when no rule applies: one bounded retry for retryable
/// transient, timeout and external errors; escalation for the rest that
/// allow it.
fn default_action(classification: &ErrorClassification) -> Option<RecoveryAction> {
    let transient = matches!(
        classification.category,
        ErrorCategory::Transient | ErrorCategory::Timeout | ErrorCategory::External
    );
    if transient && classification.retryable {
        Some(RecoveryAction::Retry { backoff: None })
    } else if classification.escalatable {
        Some(RecoveryAction::Escalate { channels: Vec::new() })
    } else {
        None
    }
}

/// JSON view that rule conditions are evaluated against: the report plus its
/// `classification`.
fn report_view(report: &ErrorReport, classification: &ErrorClassification) -> Value {
    let mut view = serde_json::to_value(report).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut view {
        map.insert(
            "classification".to_owned(),
            serde_json::to_value(classification).unwrap_or(Value::Null),
        );
    }
    view
}

/// Runs reports that were deferred while recovery was at capacity. Still at
/// capacity, the job fails retryably so the processor backs off.
pub struct RecoveryJobHandler {
    system: Weak<ErrorRecoverySystem>,
}

#[async_trait]
impl JobHandler for RecoveryJobHandler {
    async fn process(&self, job: &Job) -> JobOutcome {
        let Some(system) = self.system.upgrade() else {
            return JobOutcome::failed(JobFailure::terminal("recovery system has shut down"));
        };
        let report: ErrorReport = match serde_json::from_value(job.payload.clone()) {
            Ok(report) => report,
            Err(error) => {
                return JobOutcome::failed(
                    JobFailure::terminal(format!("payload is not an error report: {error}"))
                        .with_code("VALIDATION_ERROR"),
                )
            }
        };

        match system.recover(report, Admission::Deferred).await {
            Ok(context) => JobOutcome::succeeded(json!({
                "recovery_id": context.id,
                "state": context.state.as_str(),
                "attempts": context.attempts.len(),
            })),
            Err(error @ RecoveryError::AtCapacity { .. }) => JobOutcome::failed(
                JobFailure::retryable(error.to_string()).with_code(RECOVERY_AT_CAPACITY_CODE),
            ),
            Err(error) => JobOutcome::failed(JobFailure::terminal(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests;
