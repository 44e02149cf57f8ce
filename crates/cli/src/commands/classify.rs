use conductor_core::domain::recovery::ReportedError;
use conductor_core::recovery::classify;

use crate::commands::{CommandResult, EXIT_INVALID_INPUT};

const COMMAND: &str = "classify";

pub fn run(name: Option<&str>, message: &str, code: Option<&str>) -> CommandResult {
    let mut error = ReportedError::new(name.unwrap_or_default(), message);
    if let Some(code) = code {
        error = error.with_code(code);
    }
    if error.name.trim().is_empty() && error.message.trim().is_empty() {
        return CommandResult::failure(
            COMMAND,
            "invalid_input",
            "an error name or message is required",
            EXIT_INVALID_INPUT,
        );
    }

    let classification = classify(&error);
    match serde_json::to_string(&classification) {
        Ok(rendered) => CommandResult::success(COMMAND, rendered),
        Err(error) => {
            CommandResult::failure(COMMAND, "serialization", error.to_string(), EXIT_INVALID_INPUT)
        }
    }
}
