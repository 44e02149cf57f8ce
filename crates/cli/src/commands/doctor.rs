use conductor_core::config::{AppConfig, LoadOptions};
use conductor_core::domain::execution::ExecutionStatus;
use conductor_core::domain::workflow::{
    AgentRole, ExecutionContext, ExecutionPattern, WorkflowDefinition, WorkflowStep,
};
use conductor_core::Services;
use serde::Serialize;
use serde_json::json;

use crate::commands::{escape_json, runtime, CommandResult};

const EXIT_DOCTOR: u8 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

/// Exit code 0 only when every check passes.
pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { EXIT_DOCTOR };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            let services = Services::from_config(config);
            checks.push(check_handlers(&services));
            checks.push(check_dry_run(&services));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["job_handlers", "engine_dry_run"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_handlers(services: &Services) -> DoctorCheck {
    let registered = services.jobs().handler_types();
    let missing: Vec<&str> = ["workflow_execution", "batch", "cleanup", "analytics", "recovery"]
        .into_iter()
        .filter(|job_type| !registered.iter().any(|registered| registered == job_type))
        .collect();

    if missing.is_empty() {
        DoctorCheck {
            name: "job_handlers",
            status: CheckStatus::Pass,
            details: format!("registered: {}", registered.join(", ")),
        }
    } else {
        DoctorCheck {
            name: "job_handlers",
            status: CheckStatus::Fail,
            details: format!("missing handlers: {}", missing.join(", ")),
        }
    }
}

fn check_dry_run(services: &Services) -> DoctorCheck {
    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(details) => {
            return DoctorCheck { name: "engine_dry_run", status: CheckStatus::Fail, details }
        }
    };

    let workflow = WorkflowDefinition::new("doctor", ExecutionPattern::Sequential)
        .with_agent("smoke", "echo", AgentRole::General)
        .with_step(WorkflowStep::new("smoke", "smoke"));
    let context = ExecutionContext::new(workflow, json!({ "check": "doctor" }));

    match runtime.block_on(services.run_execution(context)) {
        Ok(state) if state.status == ExecutionStatus::Completed => DoctorCheck {
            name: "engine_dry_run",
            status: CheckStatus::Pass,
            details: format!("one-step workflow completed in {}ms", state.duration_ms.unwrap_or(0)),
        },
        Ok(state) => DoctorCheck {
            name: "engine_dry_run",
            status: CheckStatus::Fail,
            details: format!("dry run ended {}", state.status.as_str()),
        },
        Err(error) => DoctorCheck {
            name: "engine_dry_run",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
