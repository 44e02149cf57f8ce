use std::path::Path;
use std::time::Duration;

use conductor_core::config::{AppConfig, LoadOptions};
use conductor_core::domain::execution::{ExecutionState, ExecutionStatus};
use conductor_core::domain::job::{Job, JobPriority, JobStatus};
use conductor_core::domain::workflow::ExecutionContext;
use conductor_core::Services;
use serde_json::json;

use crate::commands::{
    load_context, runtime, CommandResult, EXIT_CONFIG, EXIT_EXECUTION_FAILED, EXIT_INVALID_INPUT,
    EXIT_RUNTIME,
};

const COMMAND: &str = "run";
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn run(path: &Path, queued: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "config_validation",
                error.to_string(),
                EXIT_CONFIG,
            )
        }
    };
    let context = match load_context(path) {
        Ok(context) => context,
        Err(message) => {
            return CommandResult::failure(COMMAND, "invalid_input", message, EXIT_INVALID_INPUT)
        }
    };
    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(message) => return CommandResult::failure(COMMAND, "runtime", message, EXIT_RUNTIME),
    };

    let services = Services::from_config(config);
    if queued {
        runtime.block_on(run_queued(&services, context))
    } else {
        runtime.block_on(run_inline(&services, context))
    }
}

async fn run_inline(services: &Services, context: ExecutionContext) -> CommandResult {
    match services.run_execution(context).await {
        Ok(state) => execution_result(&state),
        Err(error) => CommandResult::failure(
            COMMAND,
            "invalid_workflow",
            error.to_string(),
            EXIT_INVALID_INPUT,
        ),
    }
}

async fn run_queued(services: &Services, context: ExecutionContext) -> CommandResult {
    let handle = services.start();
    let job_id = match services.submit_execution(context, JobPriority::Normal) {
        Ok(job_id) => job_id,
        Err(error) => {
            handle.shutdown().await;
            return CommandResult::failure(
                COMMAND,
                "invalid_workflow",
                error.to_string(),
                EXIT_INVALID_INPUT,
            );
        }
    };

    let job = loop {
        match services.get_job(&job_id) {
            Ok(job) if job.status.is_terminal() => break Ok(job),
            Ok(_) => tokio::time::sleep(JOB_POLL_INTERVAL).await,
            Err(error) => break Err(error),
        }
    };
    handle.shutdown().await;

    match job {
        Ok(job) => job_result(&job),
        Err(error) => CommandResult::failure(COMMAND, "runtime", error.to_string(), EXIT_RUNTIME),
    }
}

fn execution_result(state: &ExecutionState) -> CommandResult {
    let summary = json!({
        "execution_id": state.id,
        "workflow": state.workflow_name,
        "status": state.status.as_str(),
        "completed_steps": state.progress.completed_steps.len(),
        "failed_steps": state.progress.failed_steps.len(),
        "output": state.output,
        "last_error": state.last_error().map(|error| format!("{}: {}", error.code, error.message)),
    });
    if state.status == ExecutionStatus::Completed {
        CommandResult::success(COMMAND, summary.to_string())
    } else {
        CommandResult::failure(
            COMMAND,
            "execution_failed",
            summary.to_string(),
            EXIT_EXECUTION_FAILED,
        )
    }
}

fn job_result(job: &Job) -> CommandResult {
    let summary = json!({
        "job_id": job.id,
        "status": job.status.as_str(),
        "retries": job.retry_count,
        "result": job.result,
        "error": job.error.as_ref().map(|failure| failure.message.clone()),
    });
    if job.status == JobStatus::Completed {
        CommandResult::success(COMMAND, summary.to_string())
    } else {
        CommandResult::failure(COMMAND, "job_failed", summary.to_string(), EXIT_EXECUTION_FAILED)
    }
}
