use std::path::Path;
use std::sync::Arc;

use conductor_core::config::{AppConfig, LoadOptions};
use conductor_core::engine::{EchoStepExecutor, WorkflowEngine};
use conductor_core::telemetry::TracingTelemetrySink;

use crate::commands::{load_context, CommandResult, EXIT_CONFIG, EXIT_INVALID_INPUT};

const COMMAND: &str = "validate";

pub fn run(path: &Path) -> CommandResult {
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

    let engine = WorkflowEngine::new(
        config.engine,
        Arc::new(EchoStepExecutor),
        Arc::new(TracingTelemetrySink),
    );
    match engine.validate(&context) {
        Ok(()) => CommandResult::success(
            COMMAND,
            format!(
                "workflow `{}` is valid: {} pattern, {} steps, {} agents",
                context.workflow.name,
                context.workflow.pattern.as_str(),
                context.workflow.steps.len(),
                context.workflow.agents.len()
            ),
        ),
        Err(error) => CommandResult::failure(
            COMMAND,
            "invalid_workflow",
            error.to_string(),
            EXIT_INVALID_INPUT,
        ),
    }
}
