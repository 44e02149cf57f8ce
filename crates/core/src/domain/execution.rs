use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::workflow::{ExecutionContext, ExecutionPattern};
use crate::engine::EngineError;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout)
    }

    /// `pending → running → {completed, failed, cancelled, timeout}`. A pending
    /// execution may also be cancelled before it starts.
    pub fn transition(self, to: Self) -> Result<Self, EngineError> {
        let allowed = match self {
            Self::Pending => matches!(to, Self::Running | Self::Cancelled),
            Self::Running => to.is_terminal(),
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout => false,
        };

        if allowed {
            Ok(to)
        } else {
            Err(EngineError::InvalidTransition { from: self, to })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPerformance {
    pub tokens_used: u64,
    pub cost: Decimal,
    pub model_calls: u32,
}

impl StepPerformance {
    pub fn absorb(&mut self, other: &StepPerformance) {
        self.tokens_used = self.tokens_used.saturating_add(other.tokens_used);
        self.cost += other.cost;
        self.model_calls = self.model_calls.saturating_add(other.model_calls);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub agent_id: String,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub performance: StepPerformance,
    pub error: Option<StepError>,
}

impl StepResult {
    pub fn skipped(step_id: impl Into<String>, agent_id: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            agent_id: agent_id.into(),
            status: StepStatus::Skipped,
            input,
            output: None,
            attempts: 0,
            started_at: None,
            completed_at: Some(now),
            duration_ms: Some(0),
            performance: StepPerformance::default(),
            error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub total_steps: usize,
    pub current_step: Option<String>,
    pub percentage: f64,
    pub completed_steps: BTreeSet<String>,
    pub failed_steps: BTreeSet<String>,
    pub skipped_steps: BTreeSet<String>,
    pub active_steps: BTreeSet<String>,
}

impl ExecutionProgress {
    pub fn new(total_steps: usize) -> Self {
        Self {
            total_steps,
            current_step: None,
            percentage: 0.0,
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
            skipped_steps: BTreeSet::new(),
            active_steps: BTreeSet::new(),
        }
    }

    pub fn settled_steps(&self) -> usize {
        self.completed_steps.len() + self.failed_steps.len() + self.skipped_steps.len()
    }

    /// Recomputes the percentage from settled steps. Non-terminal progress never
    /// reaches 1 and never moves backwards.
    pub fn recompute(&mut self) {
        if self.total_steps == 0 {
            return;
        }
        let ratio = self.settled_steps() as f64 / self.total_steps as f64;
        self.percentage = self.percentage.max(ratio.min(0.99));
    }

    pub fn mark_active(&mut self, step_id: &str) {
        self.active_steps.insert(step_id.to_owned());
        self.current_step = Some(step_id.to_owned());
    }

    pub fn mark_settled(&mut self, step_id: &str, status: StepStatus) {
        self.active_steps.remove(step_id);
        match status {
            StepStatus::Completed => {
                self.failed_steps.remove(step_id);
                self.completed_steps.insert(step_id.to_owned());
            }
            StepStatus::Failed => {
                self.completed_steps.remove(step_id);
                self.failed_steps.insert(step_id.to_owned());
            }
            StepStatus::Skipped => {
                self.skipped_steps.insert(step_id.to_owned());
            }
            StepStatus::Pending | StepStatus::Running => {}
        }
        self.recompute();
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub per_agent: BTreeMap<String, StepPerformance>,
    pub total: StepPerformance,
}

impl ResourceUsage {
    pub fn record(&mut self, agent_id: &str, performance: &StepPerformance) {
        self.per_agent.entry(agent_id.to_owned()).or_default().absorb(performance);
        self.total.absorb(performance);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionErrorRecord {
    pub step_id: Option<String>,
    pub code: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: ExecutionId,
    pub workflow_name: String,
    pub pattern: ExecutionPattern,
    pub status: ExecutionStatus,
    pub progress: ExecutionProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub step_results: BTreeMap<String, StepResult>,
    pub errors: Vec<ExecutionErrorRecord>,
    pub resource_usage: ResourceUsage,
    pub output: Option<Value>,
    pub iterations: u32,
    pub retry_requested: bool,
    pub cancel_reason: Option<String>,
    /// Submitted context, kept so recovery can re-enqueue the run.
    pub context: ExecutionContext,
}

impl ExecutionState {
    pub fn new(id: ExecutionId, context: ExecutionContext) -> Self {
        Self {
            id,
            workflow_name: context.workflow.name.clone(),
            pattern: context.workflow.pattern,
            status: ExecutionStatus::Pending,
            progress: ExecutionProgress::new(context.workflow.steps.len()),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            step_results: BTreeMap::new(),
            errors: Vec::new(),
            resource_usage: ResourceUsage::default(),
            output: None,
            iterations: 0,
            retry_requested: false,
            cancel_reason: None,
            context,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn last_error(&self) -> Option<&ExecutionErrorRecord> {
        self.errors.last()
    }

    /// Applies a status transition, stamping timing for start and terminal states.
    pub fn transition(&mut self, to: ExecutionStatus) -> Result<(), EngineError> {
        self.status = self.status.transition(to)?;
        let now = Utc::now();

        if to == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
            let started = self.started_at.unwrap_or(self.created_at);
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
            self.progress.active_steps.clear();
            self.progress.current_step = None;
            if to == ExecutionStatus::Completed {
                self.progress.percentage = 1.0;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{
        ExecutionId, ExecutionProgress, ExecutionState, ExecutionStatus, ResourceUsage,
        StepPerformance, StepStatus,
    };
    use crate::domain::workflow::{
        ExecutionContext, ExecutionPattern, WorkflowDefinition, WorkflowStep,
    };
    use crate::engine::EngineError;

    #[test]
    fn execution_status_round_trips_from_string_encoding() {
        let cases = [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Timeout,
        ];

        for status in cases {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_statuses_reject_further_transitions() {
        assert_eq!(
            ExecutionStatus::Completed.transition(ExecutionStatus::Running),
            Err(EngineError::InvalidTransition {
                from: ExecutionStatus::Completed,
                to: ExecutionStatus::Running,
            })
        );
        assert!(ExecutionStatus::Pending.transition(ExecutionStatus::Completed).is_err());
        assert_eq!(
            ExecutionStatus::Running.transition(ExecutionStatus::Timeout),
            Ok(ExecutionStatus::Timeout)
        );
    }

    #[test]
    fn progress_stays_below_one_until_completed() {
        let mut progress = ExecutionProgress::new(2);
        progress.mark_active("a");
        progress.mark_settled("a", StepStatus::Completed);
        assert_eq!(progress.percentage, 0.5);
        progress.mark_settled("b", StepStatus::Completed);
        assert_eq!(progress.percentage, 0.99);

        let workflow = WorkflowDefinition::new("wf", ExecutionPattern::Sequential)
            .with_step(WorkflowStep::new("a", "agent"));
        let context = ExecutionContext::new(workflow, json!({}));
        let mut state = ExecutionState::new(ExecutionId::generate(), context);
        state.transition(ExecutionStatus::Running).expect("start");
        state.progress.mark_settled("a", StepStatus::Completed);
        assert!(state.progress.percentage < 1.0);
        state.transition(ExecutionStatus::Completed).expect("complete");
        assert_eq!(state.progress.percentage, 1.0);
        assert!(state.duration_ms.is_some());
    }

    #[test]
    fn resource_usage_aggregates_per_agent_and_total() {
        let mut usage = ResourceUsage::default();
        let call = StepPerformance { tokens_used: 120, cost: Decimal::new(15, 3), model_calls: 1 };
        usage.record("writer", &call);
        usage.record("writer", &call);
        usage.record("critic", &call);

        assert_eq!(usage.per_agent["writer"].tokens_used, 240);
        assert_eq!(usage.total.model_calls, 3);
        assert_eq!(usage.total.cost, Decimal::new(45, 3));
    }
}
