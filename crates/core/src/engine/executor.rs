use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::domain::execution::{ExecutionId, StepPerformance};
use crate::domain::workflow::{AgentRole, WorkflowStep};

/// Error codes that never succeed on retry.
pub const UNRECOVERABLE_CODES: [&str; 5] = [
    "VALIDATION_ERROR",
    "AUTHENTICATION_ERROR",
    "AUTHORIZATION_ERROR",
    "INVALID_CONFIGURATION",
    "AGENT_NOT_FOUND",
];

pub fn is_unrecoverable(code: &str) -> bool {
    UNRECOVERABLE_CODES.iter().any(|candidate| candidate.eq_ignore_ascii_case(code))
}

/// What an executor sees about the run a step belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub workflow_name: String,
    pub role: AgentRole,
    pub attempt: u32,
    pub iteration: u32,
    pub tool_state: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub output: Value,
    #[serde(default)]
    pub performance: StepPerformance,
}

impl StepOutput {
    pub fn new(output: Value) -> Self {
        Self { output, performance: StepPerformance::default() }
    }

    pub fn with_performance(mut self, performance: StepPerformance) -> Self {
        self.performance = performance;
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct StepFailure {
    pub code: String,
    pub message: String,
}

impl StepFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }

    pub fn is_unrecoverable(&self) -> bool {
        is_unrecoverable(&self.code)
    }
}

/// Delegates one step to its agent. Implementations own model invocation.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &WorkflowStep,
        input: &Value,
        context: &StepContext,
    ) -> Result<StepOutput, StepFailure>;
}

/// Dry-run executor: returns `parameters.output` when present, otherwise echoes
/// the step input. `parameters.fail_with` (`{ "code", "message" }`) forces a failure.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoStepExecutor;

#[async_trait]
impl StepExecutor for EchoStepExecutor {
    async fn execute(
        &self,
        step: &WorkflowStep,
        input: &Value,
        context: &StepContext,
    ) -> Result<StepOutput, StepFailure> {
        if let Some(failure) = step.parameters.get("fail_with") {
            let code = failure.get("code").and_then(Value::as_str).unwrap_or("SIMULATED_FAILURE");
            let message =
                failure.get("message").and_then(Value::as_str).unwrap_or("simulated failure");
            return Err(StepFailure::new(code, message));
        }

        let output = match step.parameters.get("output") {
            Some(output) => output.clone(),
            None => json!({
                "step": step.id,
                "agent": step.agent_id,
                "iteration": context.iteration,
                "input": input,
            }),
        };

        Ok(StepOutput::new(output))
    }
}
