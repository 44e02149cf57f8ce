//! Executes individual recovery actions. Each run yields exactly one
//! [`RecoveryAttempt`]; failures are captured in the attempt, never returned.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::config::RecoveryConfig;
use crate::domain::job::{JobOrigin, JobSpec};
use crate::domain::recovery::{
    RecoveryAction, RecoveryAttempt, RecoveryContext, Severity, StepOverride, GLOBAL_KEY,
};
use crate::domain::workflow::{AgentBinding, AgentRole, ExecutionContext};
use crate::jobs::WORKFLOW_EXECUTION_JOB;
use crate::recovery::circuit_breaker::BreakerRegistry;
use crate::recovery::hooks::{Notification, RemediationHooks, RollbackRequest, ScaleRequest};
use crate::recovery::{ExecutionControl, JobSubmitter};
use crate::sync::lock;

pub(crate) struct ActionResult {
    pub(crate) attempt: RecoveryAttempt,
    /// The action settled the recovery; later actions and rules are skipped.
    pub(crate) resolves: bool,
    pub(crate) escalated_to: Option<Severity>,
}

struct Performed {
    resolves: bool,
    metadata: Map<String, Value>,
    escalated_to: Option<Severity>,
}

impl Performed {
    fn resolved(metadata: Map<String, Value>) -> Self {
        Self { resolves: true, metadata, escalated_to: None }
    }

    fn partial(metadata: Map<String, Value>) -> Self {
        Self { resolves: false, metadata, escalated_to: None }
    }
}

fn metadata(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[derive(Clone)]
pub(crate) struct ActionRunner {
    pub(crate) config: RecoveryConfig,
    pub(crate) jobs: Arc<dyn JobSubmitter>,
    pub(crate) executions: Arc<dyn ExecutionControl>,
    pub(crate) hooks: Arc<dyn RemediationHooks>,
    pub(crate) breakers: Arc<Mutex<BreakerRegistry>>,
}

impl ActionRunner {
    pub(crate) async fn run(
        &self,
        action: &RecoveryAction,
        context: &RecoveryContext,
    ) -> ActionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = self.perform(action, context).await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        match outcome {
            Ok(performed) => {
                debug!(
                    event_name = "recovery.action.succeeded",
                    recovery_id = %context.id,
                    action = action.kind().as_str(),
                    resolves = performed.resolves,
                    "recovery action succeeded"
                );
                ActionResult {
                    attempt: RecoveryAttempt {
                        action: action.kind(),
                        success: true,
                        error: None,
                        metadata: performed.metadata,
                        started_at,
                        duration_ms,
                    },
                    resolves: performed.resolves,
                    escalated_to: performed.escalated_to,
                }
            }
            Err(error) => {
                warn!(
                    event_name = "recovery.action.failed",
                    recovery_id = %context.id,
                    action = action.kind().as_str(),
                    error = %error,
                    "recovery action failed"
                );
                ActionResult {
                    attempt: RecoveryAttempt {
                        action: action.kind(),
                        success: false,
                        error: Some(error),
                        metadata: Map::new(),
                        started_at,
                        duration_ms,
                    },
                    resolves: false,
                    escalated_to: None,
                }
            }
        }
    }

    async fn perform(
        &self,
        action: &RecoveryAction,
        context: &RecoveryContext,
    ) -> Result<Performed, String> {
        match action {
            RecoveryAction::Retry { backoff } => {
                self.reenqueue(context, None, backoff.as_ref()).map(Performed::resolved)
            }
            RecoveryAction::RetryWithFallback { fallback, backoff } => {
                self.reenqueue(context, Some((fallback, None)), backoff.as_ref())
                    .map(Performed::resolved)
            }
            RecoveryAction::Failover { fallback_agent, agent_type } => {
                let fallback = StepOverride {
                    agent_id: Some(fallback_agent.clone()),
                    ..StepOverride::default()
                };
                self.reenqueue(context, Some((&fallback, agent_type.as_deref())), None)
                    .map(Performed::resolved)
            }
            RecoveryAction::CircuitBreaker { key, duration_ms } => {
                let key = key
                    .clone()
                    .or_else(|| context.error.agent_id.clone())
                    .unwrap_or_else(|| GLOBAL_KEY.to_owned());
                lock(&self.breakers).force_open_at(&key, *duration_ms, Utc::now());
                Ok(Performed::partial(metadata(json!({
                    "breaker": key,
                    "duration_ms": duration_ms,
                }))))
            }
            RecoveryAction::ResourceScaling { resource, amount, requires_approval } => {
                let request = ScaleRequest {
                    recovery_id: context.id.clone(),
                    resource: resource.clone(),
                    amount: *amount,
                    requires_approval: *requires_approval,
                };
                self.hooks.scale(&request).await.map_err(|error| error.to_string())?;
                Ok(Performed::partial(metadata(json!({
                    "resource": resource,
                    "amount": amount,
                    "pending_approval": requires_approval,
                }))))
            }
            RecoveryAction::Rollback { target } => {
                let target = target
                    .clone()
                    .or_else(|| context.execution_id.as_ref().map(|id| id.0.clone()))
                    .or_else(|| context.job_id.as_ref().map(|id| id.0.clone()))
                    .ok_or_else(|| "rollback needs a target".to_owned())?;
                let request = RollbackRequest { recovery_id: context.id.clone(), target };
                self.hooks.rollback(&request).await.map_err(|error| error.to_string())?;
                Ok(Performed::resolved(metadata(json!({ "target": request.target }))))
            }
            RecoveryAction::ManualIntervention { message, channels } => {
                let notification = Notification {
                    recovery_id: context.id.clone(),
                    severity: context.classification.severity,
                    message: message.clone(),
                    channels: channels.clone(),
                };
                self.hooks.notify(&notification).await.map_err(|error| error.to_string())?;
                Ok(Performed::resolved(metadata(json!({ "channels": channels }))))
            }
            RecoveryAction::Ignore => Ok(Performed::resolved(Map::new())),
            RecoveryAction::Terminate { reason } => self.terminate(context, reason.as_deref()),
            RecoveryAction::Escalate { channels } => {
                let severity = context.classification.severity.escalate();
                let notification = Notification {
                    recovery_id: context.id.clone(),
                    severity,
                    message: format!(
                        "{} error escalated to {}: {}",
                        context.classification.category.as_str(),
                        severity.as_str(),
                        context.error.message
                    ),
                    channels: channels.clone(),
                };
                self.hooks.notify(&notification).await.map_err(|error| error.to_string())?;
                Ok(Performed {
                    resolves: true,
                    metadata: metadata(json!({
                        "severity": severity.as_str(),
                        "channels": channels,
                    })),
                    escalated_to: Some(severity),
                })
            }
        }
    }

    fn terminate(
        &self,
        context: &RecoveryContext,
        reason: Option<&str>,
    ) -> Result<Performed, String> {
        if context.execution_id.is_none() && context.job_id.is_none() {
            return Err("nothing to terminate".to_owned());
        }
        let reason = reason.unwrap_or("terminated by recovery");
        let execution_cancelled = context
            .execution_id
            .as_ref()
            .is_some_and(|id| self.executions.cancel_execution(id, reason));
        let job_cancelled =
            context.job_id.as_ref().is_some_and(|id| self.jobs.cancel(id, reason));
        Ok(Performed::resolved(metadata(json!({
            "execution_cancelled": execution_cancelled,
            "job_cancelled": job_cancelled,
        }))))
    }

    /// Submits the failed work again as a new job, one recovery generation
    /// deeper, delayed by the backoff for the current depth.
    fn reenqueue(
        &self,
        context: &RecoveryContext,
        fallback: Option<(&StepOverride, Option<&str>)>,
        backoff: Option<&BackoffPolicy>,
    ) -> Result<Map<String, Value>, String> {
        let depth = context.job.as_ref().map_or(0, |job| job.origin.recovery_depth);
        if depth >= self.config.max_recovery_depth {
            return Err(format!(
                "recovery depth limit {} reached",
                self.config.max_recovery_depth
            ));
        }

        let failing_agent = context.error.agent_id.as_deref();
        let (mut spec, recovery_of) = if let Some(job) = &context.job {
            let mut spec = job.to_spec();
            if let Some((step_override, agent_type)) = fallback {
                if job.job_type != WORKFLOW_EXECUTION_JOB {
                    return Err(format!(
                        "step overrides need a `{WORKFLOW_EXECUTION_JOB}` job, not `{}`",
                        job.job_type
                    ));
                }
                let mut workflow: ExecutionContext = serde_json::from_value(spec.payload)
                    .map_err(|error| format!("job payload is not an execution context: {error}"))?;
                apply_override(&mut workflow, step_override, failing_agent, agent_type)?;
                spec.payload = to_payload(&workflow)?;
            }
            (spec, job.id.0.clone())
        } else {
            let execution = match (&context.execution, &context.execution_id) {
                (Some(execution), _) => execution.clone(),
                (None, Some(id)) => self
                    .executions
                    .get_execution(id)
                    .ok_or_else(|| format!("execution {id} is no longer available"))?,
                (None, None) => {
                    return Err("report carries no job or execution to re-enqueue".to_owned())
                }
            };
            let mut workflow = execution.context.clone();
            if let Some((step_override, agent_type)) = fallback {
                apply_override(&mut workflow, step_override, failing_agent, agent_type)?;
            }
            (JobSpec::new(WORKFLOW_EXECUTION_JOB, to_payload(&workflow)?), execution.id.0.clone())
        };

        let policy =
            backoff.cloned().unwrap_or_else(|| BackoffPolicy::fixed(self.config.retry_delay_ms));
        let delay_ms = policy.delay_ms_for(depth);
        spec.origin = JobOrigin {
            recovery_of: Some(recovery_of.clone()),
            recovery_depth: depth + 1,
            recurrence_of: None,
        };
        spec.schedule.recurrence = None;
        if delay_ms > 0 {
            spec.schedule.start_after = Some(Utc::now() + Duration::milliseconds(delay_ms as i64));
        }

        let job_id = self.jobs.submit(spec).map_err(|error| error.to_string())?;
        Ok(metadata(json!({
            "job_id": job_id,
            "recovery_of": recovery_of,
            "recovery_depth": depth + 1,
            "delay_ms": delay_ms,
        })))
    }
}

fn to_payload(workflow: &ExecutionContext) -> Result<Value, String> {
    serde_json::to_value(workflow)
        .map_err(|error| format!("execution context could not be serialized: {error}"))
}

/// Applies `step_override` to the targeted steps: the named step, else the
/// steps bound to the failing agent, else every step. A fallback agent that
/// is not bound yet inherits the replaced agent's role.
pub(crate) fn apply_override(
    workflow: &mut ExecutionContext,
    step_override: &StepOverride,
    failing_agent: Option<&str>,
    fallback_type: Option<&str>,
) -> Result<usize, String> {
    let definition = &mut workflow.workflow;
    let mut replaced: Option<String> = None;
    let mut changed = 0usize;

    for step in definition.steps.iter_mut() {
        let targeted = match (&step_override.step_id, failing_agent) {
            (Some(step_id), _) => &step.id == step_id,
            (None, Some(agent)) => step.agent_id == agent,
            (None, None) => true,
        };
        if !targeted {
            continue;
        }
        if let Some(agent_id) = &step_override.agent_id {
            replaced.get_or_insert_with(|| step.agent_id.clone());
            step.agent_id = agent_id.clone();
        }
        if let Some(retry) = &step_override.retry {
            step.retry = Some(retry.clone());
        }
        if let Some(timeout_ms) = step_override.timeout_ms {
            step.timeout_ms = Some(timeout_ms);
        }
        changed += 1;
    }

    if changed == 0 {
        return Err("step override matched no step".to_owned());
    }

    if let Some(agent_id) = &step_override.agent_id {
        if definition.agent(agent_id).is_none() {
            let original = replaced.as_deref().and_then(|id| definition.agent(id));
            let role = original.map_or(AgentRole::General, |agent| agent.role);
            let agent_type = fallback_type
                .map(str::to_owned)
                .or_else(|| original.map(|agent| agent.agent_type.clone()))
                .unwrap_or_else(|| "fallback".to_owned());
            definition.agents.push(AgentBinding { id: agent_id.clone(), agent_type, role });
        }
    }
    Ok(changed)
}
