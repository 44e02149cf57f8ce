use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::condition::Condition;
use crate::domain::execution::{ExecutionId, ExecutionState};
use crate::domain::job::{Job, JobId};
use crate::domain::workflow::RetryPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Resource,
    Transient,
    External,
    Timeout,
    Authentication,
    System,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Resource => "resource",
            Self::Transient => "transient",
            Self::External => "external",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn escalate(&self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub retryable: bool,
    pub escalatable: bool,
}

/// Breaker key for failures with no agent.
pub const GLOBAL_KEY: &str = "global";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportedError {
    #[serde(default)]
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl ReportedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), message: message.into(), ..Self::default() }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_agent(
        mut self,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        self.agent_id = Some(agent_id.into());
        self.agent_type = Some(agent_type.into());
        self
    }
}

/// Everything known about a failure at the moment it is reported.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub error: ReportedError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
    #[serde(default)]
    pub context: Value,
}

impl ErrorReport {
    pub fn new(error: ReportedError) -> Self {
        Self { error, ..Self::default() }
    }

    pub fn for_job(job: Job, error: ReportedError) -> Self {
        Self { job_id: Some(job.id.clone()), job: Some(job), ..Self::new(error) }
    }

    pub fn for_execution(execution: ExecutionState, error: ReportedError) -> Self {
        Self {
            execution_id: Some(execution.id.clone()),
            execution: Some(execution),
            ..Self::new(error)
        }
    }

    /// Recovery depth of the job that failed; zero for first-generation work.
    pub fn recovery_depth(&self) -> u32 {
        self.job.as_ref().map(|job| job.origin.recovery_depth).unwrap_or(0)
    }

    /// Breaker key: the failing agent, or `"global"`.
    pub fn breaker_key(&self) -> String {
        self.error.agent_id.clone().unwrap_or_else(|| GLOBAL_KEY.to_owned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Abandoned,
    Deferred,
}

impl RecoveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
            Self::Deferred => "deferred",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    Retry,
    RetryWithFallback,
    CircuitBreaker,
    ResourceScaling,
    Failover,
    Rollback,
    ManualIntervention,
    Ignore,
    Terminate,
    Escalate,
}

impl RecoveryActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::RetryWithFallback => "retry_with_fallback",
            Self::CircuitBreaker => "circuit_breaker",
            Self::ResourceScaling => "resource_scaling",
            Self::Failover => "failover",
            Self::Rollback => "rollback",
            Self::ManualIntervention => "manual_intervention",
            Self::Ignore => "ignore",
            Self::Terminate => "terminate",
            Self::Escalate => "escalate",
        }
    }
}

/// Step-level override applied when a failed run is re-enqueued.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOverride {
    /// Restricts the override to one step; otherwise steps bound to the
    /// failing agent are overridden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry {
        #[serde(default)]
        backoff: Option<BackoffPolicy>,
    },
    RetryWithFallback {
        fallback: StepOverride,
        #[serde(default)]
        backoff: Option<BackoffPolicy>,
    },
    CircuitBreaker {
        #[serde(default)]
        key: Option<String>,
        duration_ms: u64,
    },
    ResourceScaling {
        resource: String,
        #[serde(default = "default_scale_amount")]
        amount: u32,
        #[serde(default)]
        requires_approval: bool,
    },
    Failover {
        fallback_agent: String,
        #[serde(default)]
        agent_type: Option<String>,
    },
    Rollback {
        #[serde(default)]
        target: Option<String>,
    },
    ManualIntervention {
        message: String,
        #[serde(default)]
        channels: Vec<String>,
    },
    Ignore,
    Terminate {
        #[serde(default)]
        reason: Option<String>,
    },
    Escalate {
        #[serde(default)]
        channels: Vec<String>,
    },
}

fn default_scale_amount() -> u32 {
    1
}

impl RecoveryAction {
    pub fn kind(&self) -> RecoveryActionKind {
        match self {
            Self::Retry { .. } => RecoveryActionKind::Retry,
            Self::RetryWithFallback { .. } => RecoveryActionKind::RetryWithFallback,
            Self::CircuitBreaker { .. } => RecoveryActionKind::CircuitBreaker,
            Self::ResourceScaling { .. } => RecoveryActionKind::ResourceScaling,
            Self::Failover { .. } => RecoveryActionKind::Failover,
            Self::Rollback { .. } => RecoveryActionKind::Rollback,
            Self::ManualIntervention { .. } => RecoveryActionKind::ManualIntervention,
            Self::Ignore => RecoveryActionKind::Ignore,
            Self::Terminate { .. } => RecoveryActionKind::Terminate,
            Self::Escalate { .. } => RecoveryActionKind::Escalate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub action: RecoveryActionKind,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub id: String,
    pub execution_id: Option<ExecutionId>,
    pub job_id: Option<JobId>,
    pub error: ReportedError,
    pub execution: Option<ExecutionState>,
    pub job: Option<Job>,
    pub attempts: Vec<RecoveryAttempt>,
    pub classification: ErrorClassification,
    pub state: RecoveryState,
    pub matched_rules: Vec<String>,
    pub deferred_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecoveryContext {
    pub fn new(report: ErrorReport, classification: ErrorClassification) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: report.execution_id,
            job_id: report.job_id,
            error: report.error,
            execution: report.execution,
            job: report.job,
            attempts: Vec::new(),
            classification,
            state: RecoveryState::Pending,
            matched_rules: Vec::new(),
            deferred_job_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn finish(&mut self, state: RecoveryState) {
        self.state = state;
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleMatcher {
    /// Matches the classified category or the error name.
    pub error_types: Vec<String>,
    /// Case-insensitive substrings of the error message.
    pub message_patterns: Vec<String>,
    pub error_codes: Vec<String>,
    pub agent_types: Vec<String>,
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub enabled: bool,
    pub priority: i32,
    pub cooldown_ms: u64,
    pub max_executions: Option<u32>,
    pub parallel: bool,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self { enabled: true, priority: 0, cooldown_ms: 0, max_executions: None, parallel: false }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub executions: u32,
    pub successes: u32,
    pub failures: u32,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub total_duration_ms: u64,
}

impl RuleStats {
    pub fn success_rate(&self) -> Option<f64> {
        (self.executions > 0).then(|| f64::from(self.successes) / f64::from(self.executions))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub matcher: RuleMatcher,
    pub actions: Vec<RecoveryAction>,
    #[serde(default)]
    pub config: RuleConfig,
    #[serde(default)]
    pub stats: RuleStats,
}

impl RecoveryRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            matcher: RuleMatcher::default(),
            actions: Vec::new(),
            config: RuleConfig::default(),
            stats: RuleStats::default(),
        }
    }

    pub fn with_matcher(mut self, matcher: RuleMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_action(mut self, action: RecoveryAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_config(mut self, config: RuleConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub key: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub cooldown_ms: u64,
    pub trial_in_flight: bool,
}
