//! Execution topologies. Each executor reports a `PatternOutcome`; the engine
//! turns it into the terminal status unless the run was cancelled meanwhile.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::domain::execution::{ExecutionStatus, StepError, StepResult, StepStatus};
use crate::domain::workflow::{AgentRole, ErrorHandling, ExecutionPattern, WorkflowStep};
use crate::engine::RunHandle;

pub(crate) const STEP_ABORTED_CODE: &str = "STEP_ABORTED";

#[derive(Debug)]
pub(crate) struct PatternOutcome {
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub retry_requested: bool,
}

impl PatternOutcome {
    fn completed(output: Value) -> Self {
        Self { status: ExecutionStatus::Completed, output: Some(output), retry_requested: false }
    }

    fn failed(output: Option<Value>, retry_requested: bool) -> Self {
        Self { status: ExecutionStatus::Failed, output, retry_requested }
    }

    fn cancelled() -> Self {
        Self { status: ExecutionStatus::Cancelled, output: None, retry_requested: false }
    }

    pub(crate) fn timed_out() -> Self {
        Self { status: ExecutionStatus::Timeout, output: None, retry_requested: false }
    }
}

pub(crate) async fn run(run: &RunHandle<'_>) -> PatternOutcome {
    let steps = &run.context().workflow.steps;
    let input = run.context().input.clone();

    match run.context().workflow.pattern {
        ExecutionPattern::Sequential => {
            sequence(run, steps, input, SequenceMode::Chained, 0).await.into_outcome()
        }
        ExecutionPattern::MultiStepTool => {
            sequence(run, steps, input, SequenceMode::ToolState, 0).await.into_outcome()
        }
        ExecutionPattern::Routing => routing(run, steps, input).await,
        ExecutionPattern::Parallel => parallel(run, steps, input).await,
        ExecutionPattern::OrchestratorWorker => orchestrator_worker(run, steps, input).await,
        ExecutionPattern::EvaluatorOptimizer => evaluator_optimizer(run, steps, input).await,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SequenceMode {
    Chained,
    ToolState,
}

enum SequenceOutcome {
    Finished { output: Value, any_completed: bool, any_failed: bool },
    Aborted { retry_requested: bool },
    Cancelled,
}

impl SequenceOutcome {
    fn into_outcome(self) -> PatternOutcome {
        match self {
            Self::Finished { output, any_completed, any_failed } => {
                if any_failed && !any_completed {
                    PatternOutcome::failed(None, false)
                } else {
                    PatternOutcome::completed(output)
                }
            }
            Self::Aborted { retry_requested } => PatternOutcome::failed(None, retry_requested),
            Self::Cancelled => PatternOutcome::cancelled(),
        }
    }
}

/// What the error-handling mode says to do after a failed step.
enum FailureAction {
    Abort { retry_requested: bool },
    Continue,
}

fn on_failure(mode: ErrorHandling) -> FailureAction {
    match mode {
        ErrorHandling::FailFast => FailureAction::Abort { retry_requested: false },
        ErrorHandling::RetryAll => FailureAction::Abort { retry_requested: true },
        ErrorHandling::Continue => FailureAction::Continue,
    }
}

/// Strict-order execution: each completed output feeds the next step. In
/// tool-state mode every output is also kept under `tool_state[step id]`.
async fn sequence(
    run: &RunHandle<'_>,
    steps: &[WorkflowStep],
    input: Value,
    mode: SequenceMode,
    iteration: u32,
) -> SequenceOutcome {
    let error_handling = run.context().config.error_handling;
    let mut current = input;
    let mut tool_state = Map::new();
    let mut any_completed = false;
    let mut any_failed = false;

    for step in steps {
        if run.is_cancelled() {
            return SequenceOutcome::Cancelled;
        }

        let state = (mode == SequenceMode::ToolState).then(|| Value::Object(tool_state.clone()));
        let result = run.run_step(step, current.clone(), iteration, state).await;

        match result.status {
            StepStatus::Completed => {
                any_completed = true;
                let output = result.output.unwrap_or(Value::Null);
                if mode == SequenceMode::ToolState {
                    tool_state.insert(step.id.clone(), output.clone());
                }
                current = output;
            }
            _ => match on_failure(error_handling) {
                FailureAction::Abort { retry_requested } => {
                    return SequenceOutcome::Aborted { retry_requested };
                }
                FailureAction::Continue => {
                    any_failed = true;
                }
            },
        }
    }

    let output = match mode {
        SequenceMode::Chained => current,
        SequenceMode::ToolState => json!({ "result": current, "tool_state": tool_state }),
    };
    SequenceOutcome::Finished { output, any_completed, any_failed }
}

/// Sequential over an accumulated input object. Conditional steps run only
/// when their condition holds against the accumulated input.
async fn routing(run: &RunHandle<'_>, steps: &[WorkflowStep], input: Value) -> PatternOutcome {
    let error_handling = run.context().config.error_handling;
    let mut accumulated = match input {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("input".to_owned(), other);
            map
        }
    };
    let mut any_completed = false;
    let mut any_failed = false;
    let mut remaining = steps.iter();

    while let Some(step) = remaining.next() {
        if run.is_cancelled() {
            return PatternOutcome::cancelled();
        }

        let subject = Value::Object(accumulated.clone());
        if let Some(condition) = &step.condition {
            let matched = condition.evaluate(&subject).unwrap_or_else(|error| {
                warn!(
                    event_name = "engine.routing.condition_error",
                    step_id = %step.id,
                    error = %error,
                    "routing condition could not be evaluated; treating as unmatched"
                );
                false
            });
            if !matched {
                debug!(event_name = "engine.routing.skipped", step_id = %step.id, "route skipped");
                run.skip(step, subject);
                continue;
            }
        }

        let result = run.run_step(step, subject, 0, None).await;
        match result.status {
            StepStatus::Completed => {
                any_completed = true;
                match result.output.unwrap_or(Value::Null) {
                    Value::Object(map) => accumulated.extend(map),
                    other => {
                        accumulated.insert("output".to_owned(), other);
                    }
                }
            }
            _ => match on_failure(error_handling) {
                FailureAction::Abort { retry_requested } => {
                    return PatternOutcome::failed(None, retry_requested);
                }
                FailureAction::Continue => {
                    any_failed = true;
                }
            },
        }

        if step.stop_after_match {
            let subject = Value::Object(accumulated.clone());
            for rest in remaining.by_ref() {
                run.skip(rest, subject.clone());
            }
            break;
        }
    }

    if any_failed && !any_completed {
        PatternOutcome::failed(None, false)
    } else {
        PatternOutcome::completed(Value::Object(accumulated))
    }
}

struct FanOut {
    outputs: BTreeMap<String, Value>,
    any_completed: bool,
    any_failed: bool,
    aborted: bool,
    cancelled: bool,
}

/// Launches `steps` concurrently against the same input, keeping at most
/// `max_concurrency` in flight. Under fail-fast the first failure aborts the rest.
async fn fan_out(run: &RunHandle<'_>, steps: &[WorkflowStep], input: Value) -> FanOut {
    let config = &run.context().config;
    let fail_fast = config.error_handling == ErrorHandling::FailFast;
    let window = config.max_concurrency.max(1);

    let mut outcome = FanOut {
        outputs: BTreeMap::new(),
        any_completed: false,
        any_failed: false,
        aborted: false,
        cancelled: false,
    };
    let mut join_set: JoinSet<(usize, StepResult)> = JoinSet::new();
    let mut launched = BTreeSet::new();
    let mut settled = BTreeSet::new();
    let mut next = 0usize;

    loop {
        if run.is_cancelled() {
            outcome.cancelled = true;
        }
        while !outcome.cancelled
            && !outcome.aborted
            && next < steps.len()
            && join_set.len() < window
        {
            let step = &steps[next];
            let context = run.step_context(step, 0, None);
            let future = run.launch(step, input.clone(), context);
            let index = next;
            join_set.spawn(async move { (index, future.await) });
            launched.insert(index);
            next += 1;
        }
        if outcome.cancelled {
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
            break;
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };

        match joined {
            Ok((index, result)) => {
                settled.insert(index);
                let failed = result.status != StepStatus::Completed;
                if failed {
                    outcome.any_failed = true;
                } else {
                    outcome.any_completed = true;
                    if let Some(output) = result.output.clone() {
                        outcome.outputs.insert(result.step_id.clone(), output);
                    }
                }
                run.settle(result);

                if failed && fail_fast {
                    outcome.aborted = true;
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    break;
                }
            }
            Err(join_error) => {
                error!(
                    event_name = "engine.step.join_failed",
                    error = %join_error,
                    "step task ended without a result"
                );
                outcome.any_failed = true;
                if fail_fast {
                    outcome.aborted = true;
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }

    // Tasks that died without reporting still count as failed steps.
    if !outcome.aborted && !outcome.cancelled {
        for index in launched.difference(&settled) {
            let step = &steps[*index];
            let mut result =
                StepResult::skipped(step.id.clone(), step.agent_id.clone(), input.clone());
            result.status = StepStatus::Failed;
            result.error = Some(StepError {
                code: STEP_ABORTED_CODE.to_owned(),
                message: format!("step `{}` task panicked", step.id),
                recoverable: true,
            });
            run.settle(result);
        }
    }

    outcome
}

fn fan_out_status(run: &RunHandle<'_>, fan: &FanOut) -> Result<(), PatternOutcome> {
    if fan.cancelled || run.is_cancelled() {
        return Err(PatternOutcome::cancelled());
    }
    if fan.any_failed {
        match run.context().config.error_handling {
            ErrorHandling::FailFast => return Err(PatternOutcome::failed(None, false)),
            ErrorHandling::RetryAll => return Err(PatternOutcome::failed(None, true)),
            ErrorHandling::Continue if !fan.any_completed => {
                return Err(PatternOutcome::failed(None, false))
            }
            ErrorHandling::Continue => {}
        }
    }
    Ok(())
}

async fn parallel(run: &RunHandle<'_>, steps: &[WorkflowStep], input: Value) -> PatternOutcome {
    let fan = fan_out(run, steps, input).await;
    if let Err(outcome) = fan_out_status(run, &fan) {
        return outcome;
    }
    PatternOutcome::completed(Value::Object(fan.outputs.into_iter().collect()))
}

async fn orchestrator_worker(
    run: &RunHandle<'_>,
    steps: &[WorkflowStep],
    input: Value,
) -> PatternOutcome {
    let workflow = &run.context().workflow;
    let (orchestrators, workers): (Vec<WorkflowStep>, Vec<WorkflowStep>) = steps
        .iter()
        .cloned()
        .partition(|step| workflow.step_role(step) == AgentRole::Orchestrator);
    let Some(orchestrator) = orchestrators.first() else {
        return PatternOutcome::failed(None, false);
    };

    let plan = run.run_step(orchestrator, input, 0, None).await;
    if plan.status != StepStatus::Completed {
        let retry_requested = run.context().config.error_handling == ErrorHandling::RetryAll;
        return PatternOutcome::failed(None, retry_requested);
    }
    let plan = plan.output.unwrap_or(Value::Null);
    if run.is_cancelled() {
        return PatternOutcome::cancelled();
    }

    let fan = fan_out(run, &workers, plan.clone()).await;
    if let Err(outcome) = fan_out_status(run, &fan) {
        return outcome;
    }

    let worker_outputs: Vec<Value> = workers
        .iter()
        .map(|step| fan.outputs.get(&step.id).cloned().unwrap_or(Value::Null))
        .collect();
    PatternOutcome::completed(json!({ "orchestrator": plan, "workers": worker_outputs }))
}

/// Re-runs all steps per pass until the stop condition holds, a pass
/// reproduces its predecessor, or the iteration cap is reached.
async fn evaluator_optimizer(
    run: &RunHandle<'_>,
    steps: &[WorkflowStep],
    input: Value,
) -> PatternOutcome {
    let policy = run.context().workflow.evaluation.clone().unwrap_or_default();
    let cap = policy.max_iterations.min(run.max_evaluator_iterations()).max(1);
    let mut current = input;
    let mut previous: Option<Value> = None;

    for iteration in 1..=cap {
        run.set_iteration(iteration);
        let output = match sequence(run, steps, current.clone(), SequenceMode::Chained, iteration)
            .await
        {
            SequenceOutcome::Finished { output, any_completed, any_failed } => {
                if any_failed && !any_completed {
                    return PatternOutcome::failed(previous, false);
                }
                output
            }
            SequenceOutcome::Aborted { retry_requested } => {
                return PatternOutcome::failed(previous, retry_requested);
            }
            SequenceOutcome::Cancelled => return PatternOutcome::cancelled(),
        };

        let satisfied = policy
            .stop_when
            .as_ref()
            .is_some_and(|condition| condition.evaluate(&output).unwrap_or(false));
        let fixed_point = policy.stop_on_fixed_point && previous.as_ref() == Some(&output);

        debug!(
            event_name = "engine.evaluator.pass",
            iteration,
            satisfied,
            fixed_point,
            "evaluator pass finished"
        );

        previous = Some(output.clone());
        current = output;
        if satisfied || fixed_point {
            break;
        }
    }

    PatternOutcome::completed(current)
}
