use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use super::{
    ErrorRecoverySystem, ExecutionControl, JobSubmitter, Notification, RecoveryError,
    RemediationError, RemediationHooks, RollbackRequest, ScaleRequest, RECOVERY_AT_CAPACITY_CODE,
};
use crate::config::{AppConfig, RecoveryConfig};
use crate::domain::execution::{ExecutionId, ExecutionState};
use crate::domain::job::{Job, JobConfig, JobId, JobOrigin, JobSpec};
use crate::domain::recovery::{
    BreakerState, ErrorReport, RecoveryAction, RecoveryActionKind, RecoveryRule, RecoveryState,
    ReportedError, RuleConfig, RuleMatcher, Severity, StepOverride,
};
use crate::domain::workflow::{
    AgentRole, ExecutionContext, ExecutionPattern, WorkflowDefinition, WorkflowStep,
};
use crate::jobs::{JobError, JobHandler, RECOVERY_JOB, WORKFLOW_EXECUTION_JOB};
use crate::telemetry::InMemoryTelemetrySink;

#[derive(Default)]
struct RecordingSubmitter {
    submitted: Mutex<Vec<JobSpec>>,
    cancelled: Mutex<Vec<JobId>>,
}

impl RecordingSubmitter {
    fn submitted(&self) -> Vec<JobSpec> {
        self.submitted.lock().map(|specs| specs.clone()).unwrap_or_default()
    }
}

impl JobSubmitter for RecordingSubmitter {
    fn submit(&self, spec: JobSpec) -> Result<JobId, JobError> {
        let mut submitted = self.submitted.lock().map_err(|_| JobError::EmptyJobType)?;
        submitted.push(spec);
        Ok(JobId(format!("job-{}", submitted.len())))
    }

    fn cancel(&self, id: &JobId, _reason: &str) -> bool {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push(id.clone());
        }
        true
    }
}

#[derive(Default)]
struct RecordingExecutions {
    cancelled: Mutex<Vec<ExecutionId>>,
}

impl ExecutionControl for RecordingExecutions {
    fn get_execution(&self, _id: &ExecutionId) -> Option<ExecutionState> {
        None
    }

    fn cancel_execution(&self, id: &ExecutionId, _reason: &str) -> bool {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push(id.clone());
        }
        true
    }
}

#[derive(Default)]
struct RecordingHooks {
    notifications: Mutex<Vec<Notification>>,
    scaled: Mutex<Vec<ScaleRequest>>,
    fail_notify: bool,
}

#[async_trait]
impl RemediationHooks for RecordingHooks {
    async fn scale(&self, request: &ScaleRequest) -> Result<(), RemediationError> {
        if let Ok(mut scaled) = self.scaled.lock() {
            scaled.push(request.clone());
        }
        Ok(())
    }

    async fn rollback(&self, _request: &RollbackRequest) -> Result<(), RemediationError> {
        Ok(())
    }

    async fn notify(&self, notification: &Notification) -> Result<(), RemediationError> {
        if self.fail_notify {
            return Err(RemediationError("pager unreachable".to_owned()));
        }
        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.push(notification.clone());
        }
        Ok(())
    }
}

struct Harness {
    system: Arc<ErrorRecoverySystem>,
    jobs: Arc<RecordingSubmitter>,
    executions: Arc<RecordingExecutions>,
    hooks: Arc<RecordingHooks>,
    sink: InMemoryTelemetrySink,
}

fn recovery_config() -> RecoveryConfig {
    RecoveryConfig { retry_delay_ms: 0, ..AppConfig::default().recovery }
}

fn harness_with(config: RecoveryConfig, hooks: RecordingHooks) -> Harness {
    let jobs = Arc::new(RecordingSubmitter::default());
    let executions = Arc::new(RecordingExecutions::default());
    let hooks = Arc::new(hooks);
    let sink = InMemoryTelemetrySink::default();
    let system = Arc::new(ErrorRecoverySystem::new(
        config,
        jobs.clone(),
        executions.clone(),
        hooks.clone(),
        Arc::new(sink.clone()),
    ));
    Harness { system, jobs, executions, hooks, sink }
}

fn harness() -> Harness {
    harness_with(recovery_config(), RecordingHooks::default())
}

fn failed_job(job_type: &str, depth: u32) -> Job {
    let spec = JobSpec::new(job_type, json!({ "report": "weekly" }))
        .with_id(JobId("job-0".to_owned()))
        .with_origin(JobOrigin { recovery_depth: depth, ..JobOrigin::default() })
        .recurring("@daily");
    Job::from_spec(JobId("job-0".to_owned()), spec, JobConfig::default(), chrono::Utc::now())
}

fn workflow_context() -> ExecutionContext {
    let workflow = WorkflowDefinition::new("summarize", ExecutionPattern::Sequential)
        .with_agent("primary", "llm", AgentRole::Worker)
        .with_step(WorkflowStep::new("summarize", "primary"));
    ExecutionContext::new(workflow, json!({ "text": "..." }))
}

fn ignore_rule(id: &str, priority: i32) -> RecoveryRule {
    RecoveryRule::new(id, id)
        .with_action(RecoveryAction::Ignore)
        .with_config(RuleConfig { priority, ..RuleConfig::default() })
}

#[tokio::test]
async fn authentication_errors_are_abandoned_without_attempts() {
    let harness = harness();
    let report = ErrorReport::for_job(
        failed_job("sync", 0),
        ReportedError::new("AuthError", "401 Unauthorized").with_code("AUTHENTICATION_ERROR"),
    );

    let context = harness.system.handle_error(report).await.expect("report is handled");

    assert_eq!(context.state, RecoveryState::Abandoned);
    assert!(context.attempts.is_empty());
    assert!(context.completed_at.is_some());
    assert!(harness.jobs.submitted().is_empty());
    assert_eq!(harness.sink.event_types(), vec!["recovery.abandoned"]);
    assert_eq!(harness.system.stats().abandoned, 1);
}

#[tokio::test]
async fn reports_need_a_name_or_message() {
    let harness = harness();
    let result = harness.system.handle_error(ErrorReport::new(ReportedError::default())).await;
    assert_eq!(result.err(), Some(RecoveryError::EmptyReport));
}

#[tokio::test]
async fn retryable_timeouts_default_to_one_bounded_retry() {
    let harness = harness();
    let report = ErrorReport::for_job(
        failed_job("sync", 0),
        ReportedError::new("TimeoutError", "upstream timed out"),
    );

    let context = harness.system.handle_error(report).await.expect("report is handled");

    assert_eq!(context.state, RecoveryState::Completed);
    assert_eq!(context.attempts.len(), 1);
    assert_eq!(context.attempts[0].action, RecoveryActionKind::Retry);
    assert!(context.attempts[0].success);
    assert_eq!(context.attempts[0].metadata["job_id"], json!("job-1"));

    let submitted = harness.jobs.submitted();
    assert_eq!(submitted.len(), 1);
    let retry = &submitted[0];
    assert_eq!(retry.job_type, "sync");
    assert_eq!(retry.origin.recovery_of.as_deref(), Some("job-0"));
    assert_eq!(retry.origin.recovery_depth, 1);
    assert_eq!(retry.schedule.recurrence, None);
    assert_eq!(retry.schedule.start_after, None);
    assert_eq!(
        harness.sink.event_types(),
        vec!["recovery.started", "recovery.resolved"]
    );
}

#[tokio::test]
async fn retries_stop_at_the_recovery_depth_limit() {
    let harness = harness();
    let depth = harness.system.config().max_recovery_depth;
    let report = ErrorReport::for_job(
        failed_job("sync", depth),
        ReportedError::new("TimeoutError", "upstream timed out"),
    );

    let context = harness.system.handle_error(report).await.expect("report is handled");

    assert_eq!(context.state, RecoveryState::Failed);
    assert_eq!(context.attempts.len(), 1);
    assert!(!context.attempts[0].success);
    assert!(harness.jobs.submitted().is_empty());
    assert_eq!(harness.system.stats().failed, 1);
}

#[tokio::test]
async fn escalatable_errors_default_to_escalation() {
    let harness = harness();
    let report = ErrorReport::new(ReportedError::new("Error", "monthly quota exhausted"));

    let context = harness.system.handle_error(report).await.expect("report is handled");

    assert_eq!(context.state, RecoveryState::Completed);
    assert_eq!(context.attempts[0].action, RecoveryActionKind::Escalate);
    assert_eq!(context.classification.severity, Severity::Critical);
    let notifications = harness.hooks.notifications.lock().map(|n| n.clone()).unwrap_or_default();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].severity, Severity::Critical);
}

#[tokio::test]
async fn failed_notification_leaves_the_recovery_failed() {
    let harness =
        harness_with(recovery_config(), RecordingHooks { fail_notify: true, ..Default::default() });
    let report = ErrorReport::new(ReportedError::new("Panic", "worker panicked"));

    let context = harness.system.handle_error(report).await.expect("report is handled");

    assert_eq!(context.state, RecoveryState::Failed);
    assert_eq!(
        context.attempts[0].error.as_deref(),
        Some("remediation hook failed: pager unreachable")
    );
    assert_eq!(context.classification.severity, Severity::Critical);
}

#[tokio::test]
async fn rules_run_by_priority_until_one_resolves() {
    let harness = harness();
    let guard = RecoveryRule::new("guard", "open the breaker first")
        .with_action(RecoveryAction::CircuitBreaker { key: None, duration_ms: 5_000 })
        .with_config(RuleConfig { priority: 20, ..RuleConfig::default() });
    harness.system.add_rule(guard).expect("rule is valid");
    harness.system.add_rule(ignore_rule("ignore", 10)).expect("rule is valid");
    harness.system.add_rule(ignore_rule("never", 1)).expect("rule is valid");

    let report = ErrorReport::new(
        ReportedError::new("Error", "flaky output").with_agent("writer", "llm"),
    );
    let context = harness.system.handle_error(report).await.expect("report is handled");

    assert_eq!(context.state, RecoveryState::Completed);
    assert_eq!(context.matched_rules, vec!["guard", "ignore"]);
    let kinds: Vec<_> = context.attempts.iter().map(|attempt| attempt.action).collect();
    assert_eq!(kinds, vec![RecoveryActionKind::CircuitBreaker, RecoveryActionKind::Ignore]);
    assert_eq!(
        harness.system.breaker("writer").map(|breaker| breaker.state),
        Some(BreakerState::Open)
    );

    let stats = harness.system.stats();
    let never = stats.rules.iter().find(|rule| rule.id == "never").expect("rule is listed");
    assert_eq!(never.executions, 0);
    let guard = stats.rules.iter().find(|rule| rule.id == "guard").expect("rule is listed");
    assert_eq!(guard.successes, 1);
}

#[tokio::test]
async fn parallel_rules_record_one_attempt_per_action() {
    let harness = harness();
    let rule = RecoveryRule::new("page", "page and scale")
        .with_matcher(RuleMatcher {
            error_types: vec!["resource".to_owned()],
            ..RuleMatcher::default()
        })
        .with_action(RecoveryAction::ResourceScaling {
            resource: "workers".to_owned(),
            amount: 2,
            requires_approval: true,
        })
        .with_action(RecoveryAction::ManualIntervention {
            message: "worker pool exhausted".to_owned(),
            channels: vec!["oncall".to_owned()],
        })
        .with_config(RuleConfig { parallel: true, ..RuleConfig::default() });
    harness.system.add_rule(rule).expect("rule is valid");

    let report = ErrorReport::new(ReportedError::new("Error", "out of memory"));
    let context = harness.system.handle_error(report).await.expect("report is handled");

    assert_eq!(context.state, RecoveryState::Completed);
    let kinds: Vec<_> = context.attempts.iter().map(|attempt| attempt.action).collect();
    assert_eq!(
        kinds,
        vec![RecoveryActionKind::ResourceScaling, RecoveryActionKind::ManualIntervention]
    );
    assert!(context.attempts.iter().all(|attempt| attempt.success));
    assert_eq!(context.attempts[0].metadata["pending_approval"], json!(true));
    assert_eq!(harness.hooks.scaled.lock().map(|scaled| scaled.len()).unwrap_or_default(), 1);
}

#[tokio::test]
async fn rule_in_cooldown_falls_back_to_the_default_strategy() {
    let harness = harness();
    let rule = ignore_rule("quiet", 0).with_config(RuleConfig {
        cooldown_ms: 60_000,
        ..RuleConfig::default()
    });
    harness.system.add_rule(rule).expect("rule is valid");

    let report = || ErrorReport::new(ReportedError::new("Error", "connection reset"));
    let first = harness.system.handle_error(report()).await.expect("report is handled");
    let second = harness.system.handle_error(report()).await.expect("report is handled");

    assert_eq!(first.matched_rules, vec!["quiet"]);
    assert!(second.matched_rules.is_empty());
    assert_eq!(second.attempts[0].action, RecoveryActionKind::Retry);
    assert_eq!(second.state, RecoveryState::Failed);
}

#[tokio::test]
async fn open_breaker_abandons_until_success_is_recorded() {
    let config = RecoveryConfig {
        breaker_threshold: 2,
        breaker_cooldown_ms: 600_000,
        ..recovery_config()
    };
    let harness = harness_with(config, RecordingHooks::default());
    harness.system.add_rule(ignore_rule("ignore", 0)).expect("rule is valid");
    let report = || {
        ErrorReport::new(ReportedError::new("Error", "bad gateway").with_agent("search", "tool"))
    };

    for _ in 0..2 {
        let context = harness.system.handle_error(report()).await.expect("report is handled");
        assert_eq!(context.state, RecoveryState::Completed);
    }
    let blocked = harness.system.handle_error(report()).await.expect("report is handled");
    assert_eq!(blocked.state, RecoveryState::Abandoned);
    assert!(blocked.attempts.is_empty());

    harness.system.record_success("search");
    let reopened = harness.system.handle_error(report()).await.expect("report is handled");
    assert_eq!(reopened.state, RecoveryState::Completed);
}

#[tokio::test]
async fn interleaved_successes_keep_the_breaker_closed() {
    let config = RecoveryConfig {
        breaker_threshold: 3,
        breaker_cooldown_ms: 600_000,
        ..recovery_config()
    };
    let harness = harness_with(config, RecordingHooks::default());
    harness.system.add_rule(ignore_rule("ignore", 0)).expect("rule is valid");
    let report = || {
        ErrorReport::new(ReportedError::new("Error", "bad gateway").with_agent("agent-x", "llm"))
    };

    for _ in 0..3 {
        let context = harness.system.handle_error(report()).await.expect("report is handled");
        assert_eq!(context.state, RecoveryState::Completed);
        for _ in 0..10 {
            harness.system.clear_failures("agent-x");
        }
    }
    let breaker = harness.system.breaker("agent-x").expect("breaker exists");
    assert_eq!((breaker.state, breaker.failure_count), (BreakerState::Closed, 0));

    let next = harness.system.handle_error(report()).await.expect("report is handled");
    assert_eq!(next.state, RecoveryState::Completed);
    assert_eq!(next.attempts.len(), 1);

    for _ in 0..2 {
        harness.system.handle_error(report()).await.expect("report is handled");
    }
    harness.system.clear_failures("agent-x");
    let blocked = harness.system.handle_error(report()).await.expect("report is handled");
    assert_eq!(blocked.state, RecoveryState::Abandoned);
}

#[tokio::test]
async fn successful_trial_closes_the_breaker() {
    let config =
        RecoveryConfig { breaker_threshold: 1, breaker_cooldown_ms: 0, ..recovery_config() };
    let harness = harness_with(config, RecordingHooks::default());
    harness.system.add_rule(ignore_rule("ignore", 0)).expect("rule is valid");
    let report =
        || ErrorReport::new(ReportedError::new("Error", "odd reply").with_agent("a", "llm"));

    harness.system.handle_error(report()).await.expect("report is handled");
    assert_eq!(harness.system.breaker("a").map(|breaker| breaker.state), Some(BreakerState::Open));

    let trial = harness.system.handle_error(report()).await.expect("report is handled");
    assert_eq!(trial.state, RecoveryState::Completed);
    let breaker = harness.system.breaker("a").expect("breaker exists");
    assert_eq!(breaker.state, BreakerState::Closed);
    assert_eq!(breaker.failure_count, 0);
}

#[tokio::test]
async fn saturated_recovery_defers_to_a_recovery_job() {
    let config = RecoveryConfig { max_concurrent_recoveries: 0, ..recovery_config() };
    let harness = harness_with(config, RecordingHooks::default());
    let report = ErrorReport::new(ReportedError::new("Error", "connection refused"));

    let context = harness.system.handle_error(report).await.expect("report is handled");

    assert_eq!(context.state, RecoveryState::Deferred);
    assert_eq!(context.deferred_job_id, Some(JobId("job-1".to_owned())));
    let submitted = harness.jobs.submitted();
    assert_eq!(submitted[0].job_type, RECOVERY_JOB);
    assert_eq!(harness.sink.event_types(), vec!["recovery.deferred"]);

    // Still saturated: the recovery job fails retryably.
    let job = Job::from_spec(
        JobId("job-1".to_owned()),
        submitted[0].clone(),
        JobConfig::default(),
        chrono::Utc::now(),
    );
    let outcome = harness.system.job_handler().process(&job).await;
    assert!(!outcome.success);
    let failure = outcome.error.expect("failure is reported");
    assert!(failure.retryable);
    assert_eq!(failure.code.as_deref(), Some(RECOVERY_AT_CAPACITY_CODE));
    assert!(!harness.system.health().healthy);
}

#[tokio::test]
async fn recovery_job_runs_the_deferred_report() {
    let harness = harness();
    harness.system.add_rule(ignore_rule("ignore", 0)).expect("rule is valid");
    let report = ErrorReport::new(ReportedError::new("Error", "connection refused"));
    let job = Job::from_spec(
        JobId("deferred".to_owned()),
        JobSpec::new(RECOVERY_JOB, serde_json::to_value(&report).expect("report serializes")),
        JobConfig::default(),
        chrono::Utc::now(),
    );

    let outcome = harness.system.job_handler().process(&job).await;

    assert!(outcome.success);
    assert_eq!(outcome.result.map(|result| result["state"].clone()), Some(json!("completed")));
    assert_eq!(harness.system.active_recoveries(), 0);
}

#[tokio::test]
async fn fallback_retry_rebinds_the_failing_agent() {
    let harness = harness();
    let rule = RecoveryRule::new("fallback", "retry on the backup model")
        .with_matcher(RuleMatcher { agent_types: vec!["llm".to_owned()], ..RuleMatcher::default() })
        .with_action(RecoveryAction::RetryWithFallback {
            fallback: StepOverride {
                agent_id: Some("backup".to_owned()),
                timeout_ms: Some(120_000),
                ..StepOverride::default()
            },
            backoff: None,
        });
    harness.system.add_rule(rule).expect("rule is valid");

    let execution = ExecutionState::new(ExecutionId("exec-7".to_owned()), workflow_context());
    let report = ErrorReport::for_execution(
        execution,
        ReportedError::new("StepFailed", "model overloaded").with_agent("primary", "llm"),
    );
    let context = harness.system.handle_error(report).await.expect("report is handled");

    assert_eq!(context.state, RecoveryState::Completed);
    let submitted = harness.jobs.submitted();
    assert_eq!(submitted[0].job_type, WORKFLOW_EXECUTION_JOB);
    assert_eq!(submitted[0].origin.recovery_of.as_deref(), Some("exec-7"));
    let retried: ExecutionContext =
        serde_json::from_value(submitted[0].payload.clone()).expect("payload is a context");
    assert_eq!(retried.workflow.steps[0].agent_id, "backup");
    assert_eq!(retried.workflow.steps[0].timeout_ms, Some(120_000));
    assert!(retried.workflow.agent("backup").is_some());
}

#[tokio::test]
async fn terminate_cancels_the_execution_and_job() {
    let harness = harness();
    let rule = RecoveryRule::new("stop", "stop runaway work")
        .with_matcher(RuleMatcher {
            message_patterns: vec!["RUNAWAY".to_owned()],
            ..RuleMatcher::default()
        })
        .with_action(RecoveryAction::Terminate { reason: Some("runaway loop".to_owned()) });
    harness.system.add_rule(rule).expect("rule is valid");

    let mut report = ErrorReport::for_job(
        failed_job(WORKFLOW_EXECUTION_JOB, 0),
        ReportedError::new("Error", "runaway evaluator loop"),
    );
    report.execution_id = Some(ExecutionId("exec-9".to_owned()));
    let context = harness.system.handle_error(report).await.expect("report is handled");

    assert_eq!(context.state, RecoveryState::Completed);
    assert_eq!(
        harness.executions.cancelled.lock().map(|ids| ids.clone()).unwrap_or_default(),
        vec![ExecutionId("exec-9".to_owned())]
    );
    assert_eq!(
        harness.jobs.cancelled.lock().map(|ids| ids.clone()).unwrap_or_default(),
        vec![JobId("job-0".to_owned())]
    );
}

#[tokio::test]
async fn health_flags_a_low_success_rate() {
    let config = RecoveryConfig { min_samples: 2, min_success_rate: 0.9, ..recovery_config() };
    let harness = harness_with(config, RecordingHooks::default());
    harness.system.add_rule(ignore_rule("ignore", 0).with_matcher(RuleMatcher {
        message_patterns: vec!["benign".to_owned()],
        ..RuleMatcher::default()
    }))
    .expect("rule is valid");

    harness
        .system
        .handle_error(ErrorReport::new(ReportedError::new("Error", "benign hiccup")))
        .await
        .expect("report is handled");
    harness
        .system
        .handle_error(ErrorReport::new(ReportedError::new("Error", "network unreachable")))
        .await
        .expect("report is handled");

    let health = harness.system.health();
    assert!(!health.healthy);
    assert_eq!(health.stats.success_rate, Some(0.5));
    assert_eq!(health.issues.len(), 1);
    assert!(harness.system.remove_rule("ignore").is_ok());
    assert_eq!(
        harness.system.remove_rule("ignore").err(),
        Some(RecoveryError::RuleNotFound("ignore".to_owned()))
    );
}
