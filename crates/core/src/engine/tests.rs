use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use super::{EngineError, StepContext, StepExecutor, StepFailure, StepOutput, WorkflowEngine};
use crate::condition::{Condition, Operator};
use crate::config::EngineConfig;
use crate::domain::execution::{ExecutionStatus, StepPerformance, StepStatus};
use crate::domain::workflow::{
    AgentRole, ErrorHandling, EvaluationPolicy, ExecutionConfig, ExecutionContext,
    ExecutionPattern, RetryPolicy, WorkflowDefinition, WorkflowStep,
};
use crate::telemetry::InMemoryTelemetrySink;

type Behavior = dyn Fn(&WorkflowStep, &Value, &StepContext) -> Result<Value, StepFailure>
    + Send
    + Sync;

struct ScriptedExecutor {
    behavior: Box<Behavior>,
    delay: Duration,
    calls: Mutex<Vec<(String, Value, StepContext)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(
        behavior: impl Fn(&WorkflowStep, &Value, &StepContext) -> Result<Value, StepFailure>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            behavior: Box::new(behavior),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Succeeds with `{ "from": <step id>, "input": <input> }` unless the step is listed.
    fn failing(failing: &[&str]) -> Self {
        let failing: HashSet<String> = failing.iter().map(|id| (*id).to_owned()).collect();
        Self::new(move |step, input, _| {
            if failing.contains(&step.id) {
                Err(StepFailure::new("UPSTREAM_ERROR", format!("{} failed", step.id)))
            } else {
                Ok(json!({ "from": step.id, "input": input }))
            }
        })
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn called_steps(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|call| call.0.clone()).collect())
            .unwrap_or_default()
    }

    fn calls(&self) -> Vec<(String, Value, StepContext)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        step: &WorkflowStep,
        input: &Value,
        context: &StepContext,
    ) -> Result<StepOutput, StepFailure> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((step.id.clone(), input.clone(), context.clone()));
        }
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        (self.behavior)(step, input, context).map(|output| {
            StepOutput::new(output).with_performance(StepPerformance {
                tokens_used: 10,
                cost: rust_decimal::Decimal::new(1, 2),
                model_calls: 1,
            })
        })
    }
}

struct GatedExecutor {
    gate: Arc<Notify>,
}

#[async_trait]
impl StepExecutor for GatedExecutor {
    async fn execute(
        &self,
        _step: &WorkflowStep,
        input: &Value,
        _context: &StepContext,
    ) -> Result<StepOutput, StepFailure> {
        self.gate.notified().await;
        Ok(StepOutput::new(input.clone()))
    }
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_executions: 4,
        max_steps_per_workflow: 10,
        max_evaluator_iterations: 5,
        default_step_timeout_ms: 5_000,
        execution_retention_secs: 60,
    }
}

fn engine_with(executor: Arc<dyn StepExecutor>) -> (WorkflowEngine, InMemoryTelemetrySink) {
    let sink = InMemoryTelemetrySink::default();
    (WorkflowEngine::new(engine_config(), executor, Arc::new(sink.clone())), sink)
}

fn step(id: &str, agent: &str) -> WorkflowStep {
    WorkflowStep::new(id, agent).with_retry(RetryPolicy::single_attempt())
}

fn workflow(pattern: ExecutionPattern, ids: &[&str]) -> WorkflowDefinition {
    ids.iter().fold(
        WorkflowDefinition::new("test-flow", pattern).with_agent("agent", "llm", AgentRole::Worker),
        |workflow, id| workflow.with_step(step(id, "agent")),
    )
}

fn context(workflow: WorkflowDefinition, error_handling: ErrorHandling) -> ExecutionContext {
    ExecutionContext::new(workflow, json!({ "seed": 1 })).with_error_handling(error_handling)
}

#[tokio::test]
async fn sequential_success_completes_every_step() {
    let executor = Arc::new(ScriptedExecutor::failing(&[]));
    let (engine, sink) = engine_with(executor.clone());

    let state = engine
        .execute_workflow(context(
            workflow(ExecutionPattern::Sequential, &["a", "b", "c"]),
            ErrorHandling::FailFast,
        ))
        .await
        .expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.progress.completed_steps.len(), 3);
    assert_eq!(state.progress.percentage, 1.0);
    assert!(state.progress.active_steps.is_empty());
    assert_eq!(executor.called_steps(), vec!["a", "b", "c"]);
    assert_eq!(state.resource_usage.total.model_calls, 3);
    assert_eq!(state.resource_usage.per_agent["agent"].tokens_used, 30);

    // each output is the next step's input
    let calls = executor.calls();
    assert_eq!(calls[1].1["from"], json!("a"));
    assert_eq!(state.output.as_ref().map(|output| output["from"].clone()), Some(json!("c")));

    let events = sink.event_types();
    assert!(events.contains(&"execution.started".to_owned()));
    assert!(events.contains(&"execution.completed".to_owned()));
    assert!(events.contains(&"execution.resource_usage".to_owned()));
    assert_eq!(engine.active_count(), 0);
}

#[tokio::test]
async fn sequential_fail_fast_halts_at_first_failure() {
    let executor = Arc::new(ScriptedExecutor::failing(&["b"]));
    let (engine, sink) = engine_with(executor.clone());

    let state = engine
        .execute_workflow(context(
            workflow(ExecutionPattern::Sequential, &["a", "b", "c"]),
            ErrorHandling::FailFast,
        ))
        .await
        .expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(executor.called_steps(), vec!["a", "b"]);
    assert!(!state.progress.completed_steps.contains("c"));
    assert!(state.progress.active_steps.is_empty());
    assert!(state.progress.failed_steps.contains("b"));
    assert!(state.progress.percentage < 1.0);
    assert!(!state.retry_requested);
    assert_eq!(state.last_error().map(|error| error.code.as_str()), Some("UPSTREAM_ERROR"));
    assert!(sink.event_types().contains(&"execution.failed".to_owned()));
}

#[tokio::test]
async fn sequential_continue_feeds_last_successful_output_forward() {
    let executor = Arc::new(ScriptedExecutor::failing(&["b"]));
    let (engine, _) = engine_with(executor.clone());

    let state = engine
        .execute_workflow(context(
            workflow(ExecutionPattern::Sequential, &["a", "b", "c"]),
            ErrorHandling::Continue,
        ))
        .await
        .expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.step_results["b"].status, StepStatus::Failed);
    assert_eq!(executor.calls()[2].1["from"], json!("a"));
    assert_eq!(state.progress.percentage, 1.0);
}

#[tokio::test]
async fn retry_all_fails_the_run_and_requests_a_retry() {
    let executor = Arc::new(ScriptedExecutor::failing(&["a"]));
    let (engine, _) = engine_with(executor);

    let state = engine
        .execute_workflow(context(
            workflow(ExecutionPattern::Sequential, &["a", "b"]),
            ErrorHandling::RetryAll,
        ))
        .await
        .expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Failed);
    assert!(state.retry_requested);
}

#[tokio::test(start_paused = true)]
async fn parallel_respects_window_and_accounts_for_every_step() {
    let executor = Arc::new(
        ScriptedExecutor::failing(&["p2", "p4"]).with_delay(Duration::from_millis(20)),
    );
    let (engine, _) = engine_with(executor.clone());
    let mut ctx = context(
        workflow(ExecutionPattern::Parallel, &["p1", "p2", "p3", "p4", "p5"]),
        ErrorHandling::Continue,
    );
    ctx.config.max_concurrency = 2;

    let state = engine.execute_workflow(ctx).await.expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(
        state.progress.completed_steps.len() + state.progress.failed_steps.len(),
        state.progress.total_steps
    );
    assert!(state.progress.completed_steps.is_disjoint(&state.progress.failed_steps));
    assert!(executor.peak.load(Ordering::SeqCst) <= 2);

    let output = state.output.expect("parallel run has output");
    assert_eq!(output["p1"]["input"], json!({ "seed": 1 }));
    assert!(output.get("p2").is_none());
}

#[tokio::test(start_paused = true)]
async fn parallel_fail_fast_aborts_remaining_steps() {
    let executor =
        Arc::new(ScriptedExecutor::failing(&["p1"]).with_delay(Duration::from_millis(10)));
    let (engine, _) = engine_with(executor.clone());
    let mut ctx = context(
        workflow(ExecutionPattern::Parallel, &["p1", "p2", "p3", "p4"]),
        ErrorHandling::FailFast,
    );
    ctx.config.max_concurrency = 1;

    let state = engine.execute_workflow(ctx).await.expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(executor.called_steps(), vec!["p1"]);
    assert!(state.progress.completed_steps.is_empty());
}

fn orchestrated(orchestrator_fails: bool) -> (Arc<ScriptedExecutor>, ExecutionContext) {
    let failing: &[&str] = if orchestrator_fails { &["plan"] } else { &[] };
    let executor = Arc::new(ScriptedExecutor::failing(failing));
    let workflow = WorkflowDefinition::new("fan", ExecutionPattern::OrchestratorWorker)
        .with_agent("lead", "planner", AgentRole::Orchestrator)
        .with_agent("crew", "coder", AgentRole::Worker)
        .with_step(step("w1", "crew"))
        .with_step(step("plan", "lead"))
        .with_step(step("w2", "crew"));
    (executor, context(workflow, ErrorHandling::FailFast))
}

#[tokio::test]
async fn orchestrator_failure_starts_no_workers() {
    let (executor, ctx) = orchestrated(true);
    let (engine, _) = engine_with(executor.clone());

    let state = engine.execute_workflow(ctx).await.expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(executor.called_steps(), vec!["plan"]);
    assert!(state.progress.completed_steps.is_empty());
}

#[tokio::test]
async fn orchestrator_output_fans_out_to_workers_in_step_order() {
    let (executor, ctx) = orchestrated(false);
    let (engine, _) = engine_with(executor.clone());

    let state = engine.execute_workflow(ctx).await.expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(executor.called_steps()[0], "plan");
    let output = state.output.expect("orchestrated run has output");
    assert_eq!(output["orchestrator"]["from"], json!("plan"));
    assert_eq!(output["workers"][0]["from"], json!("w1"));
    assert_eq!(output["workers"][1]["from"], json!("w2"));
    assert_eq!(output["workers"][1]["input"]["from"], json!("plan"));
}

#[tokio::test]
async fn routing_skips_unmatched_routes_and_stops_after_match() {
    let executor =
        Arc::new(ScriptedExecutor::new(|step, _, _| Ok(json!({ step.id.clone(): true }))));
    let (engine, _) = engine_with(executor.clone());
    let workflow = WorkflowDefinition::new("router", ExecutionPattern::Routing)
        .with_agent("agent", "llm", AgentRole::Router)
        .with_step(step("classify", "agent"))
        .with_step(
            step("billing", "agent")
                .with_condition(Condition::field("topic", Operator::Eq, json!("billing"))),
        )
        .with_step(
            step("support", "agent")
                .with_condition(Condition::field("classify", Operator::Eq, json!(true)))
                .stopping_after_match(),
        )
        .with_step(step("fallback", "agent"));
    let ctx = ExecutionContext::new(workflow, json!({ "topic": "outage" }));

    let state = engine.execute_workflow(ctx).await.expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(executor.called_steps(), vec!["classify", "support"]);
    assert!(state.progress.skipped_steps.contains("billing"));
    assert!(state.progress.skipped_steps.contains("fallback"));
    assert_eq!(state.progress.percentage, 1.0);
    let output = state.output.expect("routing run has output");
    assert_eq!(output["topic"], json!("outage"));
    assert_eq!(output["support"], json!(true));
}

#[tokio::test]
async fn evaluator_stops_when_condition_holds() {
    let executor = Arc::new(ScriptedExecutor::new(|step, input, _| {
        let score = input["score"].as_i64().unwrap_or(0);
        match step.id.as_str() {
            "draft" => Ok(json!({ "score": score + 1 })),
            _ => Ok(input.clone()),
        }
    }));
    let (engine, _) = engine_with(executor.clone());
    let workflow = workflow(ExecutionPattern::EvaluatorOptimizer, &["draft", "critique"])
        .with_evaluation(EvaluationPolicy {
            max_iterations: 10,
            stop_when: Some(Condition::field("score", Operator::Gte, json!(3))),
            stop_on_fixed_point: true,
        });
    let ctx = ExecutionContext::new(workflow, json!({ "score": 0 }));

    let state = engine.execute_workflow(ctx).await.expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.iterations, 3);
    assert_eq!(state.output, Some(json!({ "score": 3 })));
    let iterations: Vec<u32> = executor.calls().iter().map(|call| call.2.iteration).collect();
    assert_eq!(iterations, vec![1, 1, 2, 2, 3, 3]);
}

#[tokio::test]
async fn evaluator_stops_at_fixed_point_or_engine_cap() {
    let stable = Arc::new(ScriptedExecutor::new(|_, _, _| Ok(json!({ "verdict": "ok" }))));
    let (engine, _) = engine_with(stable.clone());
    let ctx =
        ExecutionContext::new(workflow(ExecutionPattern::EvaluatorOptimizer, &["e"]), json!({}))
            .with_config(ExecutionConfig::default());
    let state = engine.execute_workflow(ctx).await.expect("execution should be accepted");
    assert_eq!(state.iterations, 2);

    let growing = Arc::new(ScriptedExecutor::failing(&[]));
    let (engine, _) = engine_with(growing.clone());
    let workflow = workflow(ExecutionPattern::EvaluatorOptimizer, &["e"])
        .with_evaluation(EvaluationPolicy { max_iterations: 50, ..EvaluationPolicy::default() });
    let state = engine
        .execute_workflow(ExecutionContext::new(workflow, json!({})))
        .await
        .expect("execution should be accepted");
    assert_eq!(state.iterations, engine_config().max_evaluator_iterations);
    assert_eq!(growing.called_steps().len(), 5);
}

#[tokio::test]
async fn multi_step_tool_shares_tool_state_between_steps() {
    let executor = Arc::new(ScriptedExecutor::new(|step, _, context| {
        let seen = context
            .tool_state
            .as_ref()
            .and_then(Value::as_object)
            .map(|state| state.len())
            .unwrap_or_default();
        Ok(json!({ "step": step.id, "seen": seen }))
    }));
    let (engine, _) = engine_with(executor.clone());

    let state = engine
        .execute_workflow(context(
            workflow(ExecutionPattern::MultiStepTool, &["search", "read", "answer"]),
            ErrorHandling::FailFast,
        ))
        .await
        .expect("execution should be accepted");

    let output = state.output.expect("tool run has output");
    assert_eq!(output["result"], json!({ "step": "answer", "seen": 2 }));
    assert_eq!(output["tool_state"]["search"]["seen"], json!(0));
    assert_eq!(output["tool_state"]["read"]["seen"], json!(1));
}

#[tokio::test]
async fn invalid_workflows_are_rejected_before_state_exists() {
    let (engine, _) = engine_with(Arc::new(ScriptedExecutor::failing(&[])));

    let empty = context(workflow(ExecutionPattern::Sequential, &[]), ErrorHandling::FailFast);
    assert!(matches!(engine.execute_workflow(empty).await, Err(EngineError::EmptyWorkflow(_))));

    let duplicate =
        context(workflow(ExecutionPattern::Sequential, &["a", "a"]), ErrorHandling::FailFast);
    assert_eq!(
        engine.execute_workflow(duplicate).await.err(),
        Some(EngineError::DuplicateStep("a".to_owned()))
    );

    let unknown_agent = context(
        workflow(ExecutionPattern::Sequential, &["a"]).with_step(step("b", "ghost")),
        ErrorHandling::FailFast,
    );
    assert!(matches!(
        engine.execute_workflow(unknown_agent).await,
        Err(EngineError::UnknownAgent { .. })
    ));

    let no_orchestrator =
        context(workflow(ExecutionPattern::OrchestratorWorker, &["a"]), ErrorHandling::FailFast);
    assert!(matches!(
        engine.execute_workflow(no_orchestrator).await,
        Err(EngineError::InvalidStructure(_))
    ));

    let ids: Vec<String> = (0..11).map(|index| format!("s{index}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let too_many = context(workflow(ExecutionPattern::Sequential, &refs), ErrorHandling::FailFast);
    assert_eq!(
        engine.execute_workflow(too_many).await.err(),
        Some(EngineError::TooManySteps { count: 11, limit: 10 })
    );

    let mut zero_window =
        context(workflow(ExecutionPattern::Parallel, &["a"]), ErrorHandling::FailFast);
    zero_window.config.max_concurrency = 0;
    assert!(matches!(
        engine.execute_workflow(zero_window).await,
        Err(EngineError::InvalidConfig(_))
    ));

    assert!(engine.list_executions(None).is_empty());
}

#[tokio::test]
async fn capacity_ceiling_rejects_and_cancel_frees_the_slot() {
    let gate = Arc::new(Notify::new());
    let sink = InMemoryTelemetrySink::default();
    let config = EngineConfig { max_concurrent_executions: 1, ..engine_config() };
    let engine = Arc::new(WorkflowEngine::new(
        config,
        Arc::new(GatedExecutor { gate: gate.clone() }),
        Arc::new(sink.clone()),
    ));

    let running = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute_workflow(context(
                    workflow(ExecutionPattern::Sequential, &["wait", "after"]),
                    ErrorHandling::FailFast,
                ))
                .await
        })
    };
    while engine.list_executions(Some(ExecutionStatus::Running)).is_empty() {
        tokio::task::yield_now().await;
    }

    let late = context(workflow(ExecutionPattern::Sequential, &["x"]), ErrorHandling::FailFast);
    let rejected = engine.execute_workflow(late).await;
    assert_eq!(rejected.err(), Some(EngineError::AtCapacity { limit: 1 }));

    let id = engine.list_executions(Some(ExecutionStatus::Running))[0].id.clone();
    assert!(engine.cancel_execution(&id, "operator request"));
    assert!(!engine.cancel_execution(&id, "second request"));
    assert_eq!(engine.active_count(), 0);

    gate.notify_one();
    let state = running.await.expect("task should join").expect("execution was accepted");
    assert_eq!(state.status, ExecutionStatus::Cancelled);
    assert_eq!(state.cancel_reason.as_deref(), Some("operator request"));
    assert!(!state.step_results.contains_key("after"));
    assert_eq!(engine.active_count(), 0);

    let cancelled_events =
        sink.event_types().iter().filter(|event| *event == "execution.cancelled").count();
    assert_eq!(cancelled_events, 1);
}

#[tokio::test(start_paused = true)]
async fn execution_budget_exhaustion_ends_in_timeout() {
    let executor =
        Arc::new(ScriptedExecutor::failing(&[]).with_delay(Duration::from_millis(500)));
    let (engine, sink) = engine_with(executor);
    let mut ctx =
        context(workflow(ExecutionPattern::Sequential, &["a", "b"]), ErrorHandling::FailFast);
    ctx.config.timeout_ms = 700;

    let state = engine.execute_workflow(ctx).await.expect("execution should be accepted");

    assert_eq!(state.status, ExecutionStatus::Timeout);
    assert_eq!(state.last_error().map(|error| error.code.as_str()), Some("EXECUTION_TIMEOUT"));
    assert!(state.progress.percentage < 1.0);
    assert!(sink.event_types().contains(&"execution.timeout".to_owned()));
    assert_eq!(engine.active_count(), 0);
}

#[tokio::test]
async fn purge_and_snapshot_cover_finished_executions() {
    let (engine, _) = engine_with(Arc::new(ScriptedExecutor::failing(&["bad"])));
    for step in ["ok", "bad"] {
        engine
            .execute_workflow(context(
                workflow(ExecutionPattern::Sequential, &[step]),
                ErrorHandling::FailFast,
            ))
            .await
            .expect("execution should be accepted");
    }

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.total, 2);
    assert_eq!(snapshot.by_status.get("completed"), Some(&1));
    assert_eq!(snapshot.by_status.get("failed"), Some(&1));
    assert_eq!(snapshot.usage.model_calls, 1);

    assert_eq!(engine.purge_finished(chrono::Duration::hours(1)), 0);
    assert_eq!(engine.purge_finished(chrono::Duration::zero()), 2);
    assert!(engine.list_executions(None).is_empty());
}
