//! Workflow execution engine.
//!
//! Drives one execution through `pending → running → terminal`, dispatching
//! to the pattern executor named by the workflow. Step execution is delegated
//! to an injected [`StepExecutor`]; all execution state lives in the engine's
//! own table and is only mutated here and by the pattern executors.

pub mod executor;
mod patterns;
mod step;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::domain::execution::{
    ExecutionErrorRecord, ExecutionId, ExecutionState, ExecutionStatus, StepPerformance,
    StepResult, StepStatus,
};
use crate::domain::workflow::{AgentRole, ExecutionContext, ExecutionPattern, WorkflowStep};
use crate::sync::lock;
use crate::telemetry::{TelemetryCategory, TelemetryEvent, TelemetryOutcome, TelemetrySink};

pub use executor::{
    is_unrecoverable, EchoStepExecutor, StepContext, StepExecutor, StepFailure, StepOutput,
    UNRECOVERABLE_CODES,
};

pub(crate) const EXECUTION_TIMEOUT_CODE: &str = "EXECUTION_TIMEOUT";
pub(crate) const ABANDONED_REASON: &str = "run dropped before completion";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine at capacity: {limit} executions already in flight")]
    AtCapacity { limit: usize },
    #[error("workflow has {count} steps, above the limit of {limit}")]
    TooManySteps { count: usize, limit: usize },
    #[error("workflow `{0}` has no steps")]
    EmptyWorkflow(String),
    #[error("duplicate step id `{0}`")]
    DuplicateStep(String),
    #[error("step `{step_id}` references unknown agent `{agent_id}`")]
    UnknownAgent { step_id: String, agent_id: String },
    #[error("invalid workflow structure: {0}")]
    InvalidStructure(String),
    #[error("invalid execution config: {0}")]
    InvalidConfig(String),
    #[error("invalid condition on `{step_id}`: {reason}")]
    InvalidCondition { step_id: String, reason: String },
    #[error("invalid execution transition from {from:?} to {to:?}")]
    InvalidTransition { from: ExecutionStatus, to: ExecutionStatus },
    #[error("execution not found: {0}")]
    NotFound(ExecutionId),
}

/// Aggregate view for analytics jobs and health reporting.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub total: usize,
    pub active: usize,
    pub by_status: BTreeMap<String, usize>,
    pub average_duration_ms: Option<u64>,
    pub usage: StepPerformance,
}

pub struct WorkflowEngine {
    config: EngineConfig,
    executor: Arc<dyn StepExecutor>,
    telemetry: Arc<dyn TelemetrySink>,
    executions: Mutex<HashMap<ExecutionId, ExecutionState>>,
    in_flight: Mutex<HashSet<ExecutionId>>,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        executor: Arc<dyn StepExecutor>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            executor,
            telemetry,
            executions: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Structural validation against engine limits; creates no state.
    pub fn validate(&self, context: &ExecutionContext) -> Result<(), EngineError> {
        let workflow = &context.workflow;
        let step_count = workflow.steps.len();

        if step_count > self.config.max_steps_per_workflow {
            return Err(EngineError::TooManySteps {
                count: step_count,
                limit: self.config.max_steps_per_workflow,
            });
        }
        if step_count == 0 {
            return Err(EngineError::EmptyWorkflow(workflow.name.clone()));
        }
        if context.config.max_concurrency == 0 {
            return Err(EngineError::InvalidConfig(
                "max_concurrency must be greater than zero".to_owned(),
            ));
        }
        if context.config.timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "timeout_ms must be greater than zero".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &workflow.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::DuplicateStep(step.id.clone()));
            }
            if workflow.agent(&step.agent_id).is_none() {
                return Err(EngineError::UnknownAgent {
                    step_id: step.id.clone(),
                    agent_id: step.agent_id.clone(),
                });
            }
            if step.retry.as_ref().is_some_and(|retry| retry.max_attempts == 0) {
                return Err(EngineError::InvalidStructure(format!(
                    "step `{}` must allow at least one attempt",
                    step.id
                )));
            }
            if let Some(condition) = &step.condition {
                condition.validate().map_err(|error| EngineError::InvalidCondition {
                    step_id: step.id.clone(),
                    reason: error.to_string(),
                })?;
            }
        }

        match workflow.pattern {
            ExecutionPattern::OrchestratorWorker => {
                let orchestrators = workflow
                    .steps
                    .iter()
                    .filter(|step| workflow.step_role(step) == AgentRole::Orchestrator)
                    .count();
                if orchestrators != 1 {
                    return Err(EngineError::InvalidStructure(format!(
                        "orchestrator_worker needs exactly one orchestrator step, found {orchestrators}"
                    )));
                }
            }
            ExecutionPattern::EvaluatorOptimizer => {
                if let Some(evaluation) = &workflow.evaluation {
                    if evaluation.max_iterations == 0 {
                        return Err(EngineError::InvalidStructure(
                            "evaluation.max_iterations must be greater than zero".to_owned(),
                        ));
                    }
                    if let Some(condition) = &evaluation.stop_when {
                        condition.validate().map_err(|error| EngineError::InvalidCondition {
                            step_id: "evaluation.stop_when".to_owned(),
                            reason: error.to_string(),
                        })?;
                    }
                }
            }
            ExecutionPattern::Sequential
            | ExecutionPattern::Parallel
            | ExecutionPattern::Routing
            | ExecutionPattern::MultiStepTool => {}
        }

        Ok(())
    }

    /// Runs one workflow to a terminal status. Rejections happen before any
    /// state is created; step failures are captured in the returned state.
    pub async fn execute_workflow(
        &self,
        context: ExecutionContext,
    ) -> Result<ExecutionState, EngineError> {
        self.validate(&context)?;

        let id = ExecutionId::generate();
        {
            let mut in_flight = lock(&self.in_flight);
            if in_flight.len() >= self.config.max_concurrent_executions {
                warn!(
                    event_name = "engine.execution.rejected",
                    workflow = %context.workflow.name,
                    limit = self.config.max_concurrent_executions,
                    "execution rejected at capacity"
                );
                return Err(EngineError::AtCapacity {
                    limit: self.config.max_concurrent_executions,
                });
            }
            in_flight.insert(id.clone());
        }

        let mut state = ExecutionState::new(id.clone(), context.clone());
        if let Err(error) = state.transition(ExecutionStatus::Running) {
            lock(&self.in_flight).remove(&id);
            return Err(error);
        }
        lock(&self.executions).insert(id.clone(), state);
        let mut guard = InFlightGuard { engine: self, id: id.clone(), settled: false };

        info!(
            event_name = "engine.execution.started",
            execution_id = %id,
            workflow = %context.workflow.name,
            pattern = context.workflow.pattern.as_str(),
            total_steps = context.workflow.steps.len(),
            "workflow execution started"
        );
        self.emit(
            TelemetryEvent::new(
                "execution.started",
                TelemetryCategory::Execution,
                id.as_str(),
                TelemetryOutcome::Info,
            )
            .with_metadata("workflow", context.workflow.name.clone())
            .with_metadata("pattern", context.workflow.pattern.as_str()),
        );

        let run = RunHandle { engine: self, id: id.clone(), context: &context };
        let budget = Duration::from_millis(context.config.timeout_ms);
        let outcome = match tokio::time::timeout(budget, patterns::run(&run)).await {
            Ok(outcome) => outcome,
            Err(_) => patterns::PatternOutcome::timed_out(),
        };

        guard.settled = true;
        self.finalize(&id, outcome)
    }

    /// Ends an execution whose run future was dropped before it finished,
    /// e.g. when a job timeout or job cancel aborted the caller.
    fn abandon(&self, id: &ExecutionId) {
        let cancelled = {
            let mut executions = lock(&self.executions);
            match executions.get_mut(id) {
                Some(state) if !state.is_terminal() => {
                    match state.transition(ExecutionStatus::Cancelled) {
                        Ok(()) => {
                            state.cancel_reason = Some(ABANDONED_REASON.to_owned());
                            true
                        }
                        Err(error) => {
                            warn!(
                                event_name = "engine.execution.transition_rejected",
                                execution_id = %id,
                                error = %error,
                                "abandoned execution could not be cancelled"
                            );
                            false
                        }
                    }
                }
                _ => false,
            }
        };
        lock(&self.in_flight).remove(id);

        if cancelled {
            warn!(
                event_name = "engine.execution.abandoned",
                execution_id = %id,
                "workflow execution dropped before completion; marked cancelled"
            );
            self.emit(
                TelemetryEvent::new(
                    "execution.cancelled",
                    TelemetryCategory::Execution,
                    id.as_str(),
                    TelemetryOutcome::Rejected,
                )
                .with_metadata("reason", ABANDONED_REASON),
            );
        }
    }

    fn finalize(
        &self,
        id: &ExecutionId,
        outcome: patterns::PatternOutcome,
    ) -> Result<ExecutionState, EngineError> {
        let snapshot = {
            let mut executions = lock(&self.executions);
            let Some(state) = executions.get_mut(id) else {
                drop(executions);
                lock(&self.in_flight).remove(id);
                return Err(EngineError::NotFound(id.clone()));
            };

            if !state.is_terminal() {
                if outcome.status == ExecutionStatus::Timeout {
                    state.errors.push(ExecutionErrorRecord {
                        step_id: state.progress.current_step.clone(),
                        code: EXECUTION_TIMEOUT_CODE.to_owned(),
                        message: format!(
                            "execution exceeded {}ms budget",
                            state.context.config.timeout_ms
                        ),
                        occurred_at: Utc::now(),
                    });
                }
                state.output = outcome.output;
                state.retry_requested = outcome.retry_requested;
                if let Err(error) = state.transition(outcome.status) {
                    warn!(
                        event_name = "engine.execution.transition_rejected",
                        execution_id = %id,
                        from = state.status.as_str(),
                        to = outcome.status.as_str(),
                        error = %error,
                        "execution outcome could not be applied"
                    );
                }
            }
            state.clone()
        };
        lock(&self.in_flight).remove(id);

        let (event_type, telemetry_outcome) = match snapshot.status {
            ExecutionStatus::Completed => ("execution.completed", TelemetryOutcome::Success),
            ExecutionStatus::Cancelled => ("execution.cancelled", TelemetryOutcome::Rejected),
            ExecutionStatus::Timeout => ("execution.timeout", TelemetryOutcome::Failed),
            ExecutionStatus::Failed | ExecutionStatus::Pending | ExecutionStatus::Running => {
                ("execution.failed", TelemetryOutcome::Failed)
            }
        };

        info!(
            event_name = "engine.execution.finished",
            execution_id = %id,
            status = snapshot.status.as_str(),
            duration_ms = snapshot.duration_ms.unwrap_or_default(),
            completed_steps = snapshot.progress.completed_steps.len(),
            failed_steps = snapshot.progress.failed_steps.len(),
            retry_requested = snapshot.retry_requested,
            "workflow execution finished"
        );

        // Cancellation already emitted its own event.
        if snapshot.status != ExecutionStatus::Cancelled {
            let mut event = TelemetryEvent::new(
                event_type,
                TelemetryCategory::Execution,
                id.as_str(),
                telemetry_outcome,
            )
            .with_metadata("duration_ms", snapshot.duration_ms.unwrap_or_default().to_string());
            if let Some(error) = snapshot.last_error() {
                event = event.with_metadata("error_code", error.code.clone());
            }
            self.emit(event);
        }

        let usage = &snapshot.resource_usage.total;
        self.emit(
            TelemetryEvent::new(
                "execution.resource_usage",
                TelemetryCategory::Execution,
                id.as_str(),
                TelemetryOutcome::Info,
            )
            .with_metadata("tokens_used", usage.tokens_used.to_string())
            .with_metadata("cost", usage.cost.to_string())
            .with_metadata("model_calls", usage.model_calls.to_string()),
        );

        Ok(snapshot)
    }

    /// Cancels a running execution; returns `false` for any other status.
    pub fn cancel_execution(&self, id: &ExecutionId, reason: &str) -> bool {
        {
            let mut executions = lock(&self.executions);
            let Some(state) = executions.get_mut(id) else {
                return false;
            };
            if state.status != ExecutionStatus::Running {
                return false;
            }
            if state.transition(ExecutionStatus::Cancelled).is_err() {
                return false;
            }
            state.cancel_reason = Some(reason.to_owned());
        }
        lock(&self.in_flight).remove(id);

        info!(
            event_name = "engine.execution.cancelled",
            execution_id = %id,
            reason,
            "workflow execution cancelled"
        );
        self.emit(
            TelemetryEvent::new(
                "execution.cancelled",
                TelemetryCategory::Execution,
                id.as_str(),
                TelemetryOutcome::Rejected,
            )
            .with_metadata("reason", reason),
        );
        true
    }

    pub fn get_execution(&self, id: &ExecutionId) -> Option<ExecutionState> {
        lock(&self.executions).get(id).cloned()
    }

    pub fn list_executions(&self, status: Option<ExecutionStatus>) -> Vec<ExecutionState> {
        let mut executions: Vec<_> = lock(&self.executions)
            .values()
            .filter(|state| status.map_or(true, |status| state.status == status))
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        executions
    }

    pub fn active_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Drops terminal executions that finished more than `older_than` ago.
    pub fn purge_finished(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut executions = lock(&self.executions);
        let before = executions.len();
        executions.retain(|_, state| {
            !(state.is_terminal() && state.completed_at.is_some_and(|at| at <= cutoff))
        });
        before - executions.len()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let executions = lock(&self.executions);
        let mut snapshot = EngineSnapshot { total: executions.len(), ..EngineSnapshot::default() };
        let mut durations = Vec::new();

        for state in executions.values() {
            *snapshot.by_status.entry(state.status.as_str().to_owned()).or_default() += 1;
            if state.status == ExecutionStatus::Running {
                snapshot.active += 1;
            }
            if let Some(duration) = state.duration_ms.filter(|_| state.is_terminal()) {
                durations.push(duration);
            }
            snapshot.usage.absorb(&state.resource_usage.total);
        }

        if !durations.is_empty() {
            snapshot.average_duration_ms =
                Some(durations.iter().sum::<u64>() / durations.len() as u64);
        }
        snapshot
    }

    fn emit(&self, event: TelemetryEvent) {
        self.telemetry.emit(event);
    }
}

/// Frees the concurrency slot and closes the state if the run future is
/// dropped before `finalize`.
struct InFlightGuard<'a> {
    engine: &'a WorkflowEngine,
    id: ExecutionId,
    settled: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.engine.abandon(&self.id);
        }
    }
}

/// One execution's view of the engine, used by the pattern executors.
pub(crate) struct RunHandle<'a> {
    engine: &'a WorkflowEngine,
    id: ExecutionId,
    context: &'a ExecutionContext,
}

impl RunHandle<'_> {
    pub(crate) fn context(&self) -> &ExecutionContext {
        self.context
    }

    pub(crate) fn max_evaluator_iterations(&self) -> u32 {
        self.engine.config.max_evaluator_iterations
    }

    /// Cooperative cancellation check between steps.
    pub(crate) fn is_cancelled(&self) -> bool {
        lock(&self.engine.executions)
            .get(&self.id)
            .map_or(true, |state| state.status != ExecutionStatus::Running)
    }

    pub(crate) fn set_iteration(&self, iteration: u32) {
        if let Some(state) = lock(&self.engine.executions).get_mut(&self.id) {
            if !state.is_terminal() {
                state.iterations = iteration;
            }
        }
    }

    pub(crate) fn step_context(
        &self,
        step: &WorkflowStep,
        iteration: u32,
        tool_state: Option<serde_json::Value>,
    ) -> StepContext {
        StepContext {
            execution_id: self.id.clone(),
            workflow_name: self.context.workflow.name.clone(),
            role: self.context.workflow.step_role(step),
            attempt: 1,
            iteration,
            tool_state,
        }
    }

    /// Marks the step active and returns the future that runs it.
    pub(crate) fn launch(
        &self,
        step: &WorkflowStep,
        input: serde_json::Value,
        context: StepContext,
    ) -> impl std::future::Future<Output = StepResult> + Send + 'static {
        if let Some(state) = lock(&self.engine.executions).get_mut(&self.id) {
            if !state.is_terminal() {
                state.progress.mark_active(&step.id);
            }
        }
        step::run_step(
            Arc::clone(&self.engine.executor),
            step.clone(),
            input,
            context,
            self.engine.config.default_step_timeout_ms,
        )
    }

    pub(crate) async fn run_step(
        &self,
        step: &WorkflowStep,
        input: serde_json::Value,
        iteration: u32,
        tool_state: Option<serde_json::Value>,
    ) -> StepResult {
        let context = self.step_context(step, iteration, tool_state);
        let result = self.launch(step, input, context).await;
        self.settle(result.clone());
        result
    }

    /// Records a settled step. Terminal executions are left untouched.
    pub(crate) fn settle(&self, result: StepResult) {
        let mut executions = lock(&self.engine.executions);
        let Some(state) = executions.get_mut(&self.id) else {
            return;
        };
        if state.is_terminal() {
            return;
        }

        state.progress.mark_settled(&result.step_id, result.status);
        match result.status {
            StepStatus::Completed => {
                state.resource_usage.record(&result.agent_id, &result.performance);
            }
            StepStatus::Failed => {
                if let Some(error) = &result.error {
                    state.errors.push(ExecutionErrorRecord {
                        step_id: Some(result.step_id.clone()),
                        code: error.code.clone(),
                        message: error.message.clone(),
                        occurred_at: result.completed_at.unwrap_or_else(Utc::now),
                    });
                }
            }
            StepStatus::Skipped | StepStatus::Pending | StepStatus::Running => {}
        }
        state.step_results.insert(result.step_id.clone(), result);
    }

    pub(crate) fn skip(&self, step: &WorkflowStep, input: serde_json::Value) {
        self.settle(StepResult::skipped(step.id.clone(), step.agent_id.clone(), input));
    }
}

#[cfg(test)]
mod tests;
