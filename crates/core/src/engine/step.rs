use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::domain::execution::{StepError, StepPerformance, StepResult, StepStatus};
use crate::domain::workflow::{RetryPolicy, WorkflowStep};
use crate::engine::executor::{StepContext, StepExecutor, StepFailure};

pub(crate) const STEP_TIMEOUT_CODE: &str = "STEP_TIMEOUT";

/// Runs one step with bounded attempts, racing each attempt against the step
/// timeout. Failures are captured in the returned `StepResult`.
pub(crate) async fn run_step(
    executor: Arc<dyn StepExecutor>,
    step: WorkflowStep,
    input: Value,
    context: StepContext,
    default_timeout_ms: u64,
) -> StepResult {
    let policy = step.retry.clone().unwrap_or_default();
    let max_attempts = policy.max_attempts.max(1);
    let step_timeout = Duration::from_millis(step.timeout_ms.unwrap_or(default_timeout_ms).max(1));
    let started_at = Utc::now();
    let mut attempt = 1u32;

    let outcome = loop {
        let attempt_context = StepContext { attempt, ..context.clone() };
        let failure = match timeout(step_timeout, executor.execute(&step, &input, &attempt_context))
            .await
        {
            Ok(Ok(output)) => break Ok(output),
            Ok(Err(failure)) => failure,
            Err(_) => StepFailure::new(
                STEP_TIMEOUT_CODE,
                format!("step `{}` timed out after {}ms", step.id, step_timeout.as_millis()),
            ),
        };

        if failure.is_unrecoverable() {
            debug!(
                event_name = "engine.step.unrecoverable",
                execution_id = %context.execution_id,
                step_id = %step.id,
                error_code = %failure.code,
                "step failed with unrecoverable error; retries skipped"
            );
            break Err(failure);
        }
        if attempt >= max_attempts {
            break Err(failure);
        }

        let delay = retry_delay(&policy, attempt);
        warn!(
            event_name = "engine.step.retrying",
            execution_id = %context.execution_id,
            step_id = %step.id,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error_code = %failure.code,
            "step attempt failed; retrying"
        );
        sleep(delay).await;
        attempt = attempt.saturating_add(1);
    };

    let completed_at = Utc::now();
    let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
    let mut result = StepResult {
        step_id: step.id.clone(),
        agent_id: step.agent_id.clone(),
        status: StepStatus::Running,
        input,
        output: None,
        attempts: attempt,
        started_at: Some(started_at),
        completed_at: Some(completed_at),
        duration_ms: Some(duration_ms),
        performance: StepPerformance::default(),
        error: None,
    };

    match outcome {
        Ok(output) => {
            result.status = StepStatus::Completed;
            result.output = Some(output.output);
            result.performance = output.performance;
        }
        Err(failure) => {
            result.status = StepStatus::Failed;
            result.error = Some(StepError {
                recoverable: !failure.is_unrecoverable(),
                code: failure.code,
                message: failure.message,
            });
        }
    }

    result
}

/// Delay before the attempt following `attempt` (one-based).
fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    policy.backoff.delay_for(attempt.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{run_step, STEP_TIMEOUT_CODE};
    use crate::backoff::BackoffPolicy;
    use crate::domain::execution::{ExecutionId, StepStatus};
    use crate::domain::workflow::{AgentRole, RetryPolicy, WorkflowStep};
    use crate::engine::executor::{StepContext, StepExecutor, StepFailure, StepOutput};

    struct FlakyExecutor {
        calls: AtomicU32,
        succeed_on: u32,
        code: &'static str,
    }

    #[async_trait]
    impl StepExecutor for FlakyExecutor {
        async fn execute(
            &self,
            _step: &WorkflowStep,
            input: &Value,
            context: &StepContext,
        ) -> Result<StepOutput, StepFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(call, context.attempt);
            if call >= self.succeed_on {
                Ok(StepOutput::new(input.clone()))
            } else {
                Err(StepFailure::new(self.code, format!("attempt {call} failed")))
            }
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl StepExecutor for SlowExecutor {
        async fn execute(
            &self,
            _step: &WorkflowStep,
            _input: &Value,
            _context: &StepContext,
        ) -> Result<StepOutput, StepFailure> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StepOutput::new(Value::Null))
        }
    }

    fn context() -> StepContext {
        StepContext {
            execution_id: ExecutionId("exec-step".to_owned()),
            workflow_name: "wf".to_owned(),
            role: AgentRole::Worker,
            attempt: 1,
            iteration: 0,
            tool_state: None,
        }
    }

    fn retrying_step(max_attempts: u32) -> WorkflowStep {
        WorkflowStep::new("fetch", "fetcher").with_retry(RetryPolicy {
            max_attempts,
            backoff: BackoffPolicy::exponential(10, 2.0, 100),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let executor = Arc::new(FlakyExecutor {
            calls: AtomicU32::new(0),
            succeed_on: 3,
            code: "UPSTREAM_5XX",
        });

        let result =
            run_step(executor.clone(), retrying_step(3), json!({ "q": 1 }), context(), 1_000).await;

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.output, Some(json!({ "q": 1 })));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deny_listed_codes_stop_retrying_immediately() {
        let executor = Arc::new(FlakyExecutor {
            calls: AtomicU32::new(0),
            succeed_on: 10,
            code: "VALIDATION_ERROR",
        });

        let result =
            run_step(executor.clone(), retrying_step(5), json!({}), context(), 1_000).await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        let error = result.error.expect("failed step carries an error");
        assert_eq!(error.code, "VALIDATION_ERROR");
        assert!(!error.recoverable);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_race_the_step_timeout() {
        let step = WorkflowStep::new("slow", "fetcher")
            .with_timeout_ms(50)
            .with_retry(RetryPolicy::single_attempt());

        let result = run_step(Arc::new(SlowExecutor), step, json!({}), context(), 1_000).await;

        assert_eq!(result.status, StepStatus::Failed);
        let error = result.error.expect("timed out step carries an error");
        assert_eq!(error.code, STEP_TIMEOUT_CODE);
        assert!(error.recoverable);
    }
}
