use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Declaration order is scheduling order: `Urgent` sorts greatest.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Hourly,
    Daily,
    Weekly,
}

impl Recurrence {
    /// `@hourly`, `@daily` and `@weekly` are recognised; anything else runs hourly.
    pub fn parse(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "@daily" => Self::Daily,
            "@weekly" => Self::Weekly,
            _ => Self::Hourly,
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
}

impl Default for JobSchedule {
    fn default() -> Self {
        Self { scheduled_at: Utc::now(), start_after: None, deadline: None, recurrence: None }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
    /// Maximum jobs of this type running at once.
    pub concurrency: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
            jitter: true,
            concurrency: 5,
        }
    }
}

impl JobConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            self.retry_delay_ms,
            self.backoff_multiplier,
            self.max_backoff_ms,
        )
        .with_jitter(self.jitter)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOrigin {
    /// Execution or job id this job is a recovery re-enqueue of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_of: Option<String>,
    #[serde(default)]
    pub recovery_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence_of: Option<JobId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None, retryable: true }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None, retryable: false }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    pub at: DateTime<Utc>,
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub note: String,
}

/// Submission payload for `JobProcessor::add_job`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    pub job_type: String,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub schedule: JobSchedule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<JobConfig>,
    #[serde(default)]
    pub dependencies: BTreeSet<JobId>,
    #[serde(default)]
    pub origin: JobOrigin,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            priority: JobPriority::Normal,
            payload,
            schedule: JobSchedule::default(),
            config: None,
            dependencies: BTreeSet::new(),
            origin: JobOrigin::default(),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn depends_on(mut self, dependency: JobId) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    pub fn start_after(mut self, at: DateTime<Utc>) -> Self {
        self.schedule.start_after = Some(at);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.schedule.deadline = Some(deadline);
        self
    }

    pub fn recurring(mut self, token: impl Into<String>) -> Self {
        self.schedule.recurrence = Some(token.into());
        self
    }

    pub fn with_origin(mut self, origin: JobOrigin) -> Self {
        self.origin = origin;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub payload: Value,
    pub schedule: JobSchedule,
    pub config: JobConfig,
    pub dependencies: BTreeSet<JobId>,
    pub progress: f64,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub retry_count: u32,
    pub retries_exhausted: bool,
    pub available_at: DateTime<Utc>,
    pub origin: JobOrigin,
    pub history: Vec<JobHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_spec(id: JobId, spec: JobSpec, config: JobConfig, now: DateTime<Utc>) -> Self {
        let available_at = spec.schedule.start_after.unwrap_or(now);
        let mut job = Self {
            id,
            job_type: spec.job_type,
            status: JobStatus::Pending,
            priority: spec.priority,
            payload: spec.payload,
            schedule: spec.schedule,
            config,
            dependencies: spec.dependencies,
            progress: 0.0,
            result: None,
            error: None,
            retry_count: 0,
            retries_exhausted: false,
            available_at,
            origin: spec.origin,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        job.history.push(JobHistoryEntry {
            at: now,
            from: None,
            to: JobStatus::Pending,
            note: "created".to_owned(),
        });
        job
    }

    /// Rebuilds a submission for the same work, used by recurrence and recovery.
    pub fn to_spec(&self) -> JobSpec {
        JobSpec {
            id: None,
            job_type: self.job_type.clone(),
            priority: self.priority,
            payload: self.payload.clone(),
            schedule: JobSchedule {
                scheduled_at: Utc::now(),
                start_after: None,
                deadline: None,
                recurrence: self.schedule.recurrence.clone(),
            },
            config: Some(self.config.clone()),
            dependencies: BTreeSet::new(),
            origin: self.origin.clone(),
        }
    }

    /// Appends a history entry for `from → to`; history is append-only.
    pub fn record(&mut self, to: JobStatus, note: impl Into<String>, now: DateTime<Utc>) {
        let from = self.status;
        self.status = to;
        self.updated_at = now;
        self.history.push(JobHistoryEntry { at: now, from: Some(from), to, note: note.into() });
    }
}
