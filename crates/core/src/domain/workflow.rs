use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backoff::BackoffPolicy;
use crate::condition::Condition;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPattern {
    Sequential,
    Parallel,
    Routing,
    OrchestratorWorker,
    EvaluatorOptimizer,
    MultiStepTool,
}

impl ExecutionPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Routing => "routing",
            Self::OrchestratorWorker => "orchestrator_worker",
            Self::EvaluatorOptimizer => "evaluator_optimizer",
            Self::MultiStepTool => "multi_step_tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sequential" => Some(Self::Sequential),
            "parallel" => Some(Self::Parallel),
            "routing" => Some(Self::Routing),
            "orchestrator_worker" => Some(Self::OrchestratorWorker),
            "evaluator_optimizer" => Some(Self::EvaluatorOptimizer),
            "multi_step_tool" => Some(Self::MultiStepTool),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Worker,
    Evaluator,
    Optimizer,
    Router,
    Tool,
    #[default]
    General,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentBinding {
    pub id: String,
    pub agent_type: String,
    #[serde(default)]
    pub role: AgentRole,
}

/// Per-step attempt policy. Attempts include the first try.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: BackoffPolicy::default() }
    }
}

impl RetryPolicy {
    pub fn single_attempt() -> Self {
        Self { max_attempts: 1, backoff: BackoffPolicy::none() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub stop_after_match: bool,
    /// Executor-specific settings passed through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_id: agent_id.into(),
            retry: None,
            timeout_ms: None,
            condition: None,
            stop_after_match: false,
            parameters: Map::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn stopping_after_match(mut self) -> Self {
        self.stop_after_match = true;
        self
    }
}

/// Stopping criteria for the evaluator-optimizer loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationPolicy {
    pub max_iterations: u32,
    /// Stop once the pass output satisfies this condition.
    pub stop_when: Option<Condition>,
    /// Stop once a pass reproduces the previous pass output.
    pub stop_on_fixed_point: bool,
}

impl Default for EvaluationPolicy {
    fn default() -> Self {
        Self { max_iterations: 3, stop_when: None, stop_on_fixed_point: true }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub pattern: ExecutionPattern,
    #[serde(default)]
    pub agents: Vec<AgentBinding>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationPolicy>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, pattern: ExecutionPattern) -> Self {
        Self { name: name.into(), pattern, agents: Vec::new(), steps: Vec::new(), evaluation: None }
    }

    pub fn with_agent(
        mut self,
        id: impl Into<String>,
        agent_type: impl Into<String>,
        role: AgentRole,
    ) -> Self {
        self.agents.push(AgentBinding { id: id.into(), agent_type: agent_type.into(), role });
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_evaluation(mut self, evaluation: EvaluationPolicy) -> Self {
        self.evaluation = Some(evaluation);
        self
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentBinding> {
        self.agents.iter().find(|agent| agent.id == agent_id)
    }

    pub fn step_role(&self, step: &WorkflowStep) -> AgentRole {
        self.agent(&step.agent_id).map(|agent| agent.role).unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    #[default]
    FailFast,
    Continue,
    RetryAll,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_ms: u64,
    pub max_concurrency: usize,
    pub error_handling: ErrorHandling,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { timeout_ms: 300_000, max_concurrency: 5, error_handling: ErrorHandling::FailFast }
    }
}

/// Immutable input of one execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub workflow: WorkflowDefinition,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub config: ExecutionConfig,
}

impl ExecutionContext {
    pub fn new(workflow: WorkflowDefinition, input: Value) -> Self {
        Self { workflow, input, config: ExecutionConfig::default() }
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.config.error_handling = error_handling;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AgentRole, ErrorHandling, ExecutionContext, ExecutionPattern};

    #[test]
    fn pattern_parse_accepts_kebab_and_snake_case() {
        assert_eq!(
            ExecutionPattern::parse("orchestrator-worker"),
            Some(ExecutionPattern::OrchestratorWorker)
        );
        assert_eq!(
            ExecutionPattern::parse("multi_step_tool"),
            Some(ExecutionPattern::MultiStepTool)
        );
        assert_eq!(ExecutionPattern::parse("swarm"), None);
    }

    #[test]
    fn context_deserializes_with_defaults() {
        let context: ExecutionContext = serde_json::from_value(json!({
            "workflow": {
                "name": "triage",
                "pattern": "orchestrator_worker",
                "agents": [
                    { "id": "lead", "agent_type": "planner", "role": "orchestrator" },
                    { "id": "w1", "agent_type": "coder" }
                ],
                "steps": [
                    { "id": "plan", "agent_id": "lead" },
                    { "id": "build", "agent_id": "w1", "timeout_ms": 500 }
                ]
            },
            "input": { "ticket": 7 }
        }))
        .expect("context json should deserialize");

        assert_eq!(context.config.error_handling, ErrorHandling::FailFast);
        assert_eq!(context.workflow.agents[1].role, AgentRole::General);
        assert_eq!(context.workflow.steps[1].timeout_ms, Some(500));
        assert_eq!(
            context.workflow.step_role(&context.workflow.steps[0]),
            AgentRole::Orchestrator
        );
    }
}
