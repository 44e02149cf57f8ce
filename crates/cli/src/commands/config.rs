use std::env;
use std::fs;
use std::path::Path;

use conductor_core::config::{resolve_config_path, AppConfig, LoadOptions};
use toml::Value;

use crate::commands::{CommandResult, EXIT_CONFIG};

const COMMAND: &str = "config";

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "config_validation",
                format!("config validation failed: {error}"),
                EXIT_CONFIG,
            )
        }
    };
    CommandResult { exit_code: 0, output: render(&config) }
}

fn render(config: &AppConfig) -> String {
    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: Option<&str>| {
        field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let engine = &config.engine;
    let jobs = &config.jobs;
    let recovery = &config.recovery;
    let entries: Vec<(&str, String, Option<&str>)> = vec![
        (
            "engine.max_concurrent_executions",
            engine.max_concurrent_executions.to_string(),
            Some("CONDUCTOR_ENGINE_MAX_CONCURRENT_EXECUTIONS"),
        ),
        (
            "engine.max_steps_per_workflow",
            engine.max_steps_per_workflow.to_string(),
            Some("CONDUCTOR_ENGINE_MAX_STEPS_PER_WORKFLOW"),
        ),
        (
            "engine.max_evaluator_iterations",
            engine.max_evaluator_iterations.to_string(),
            Some("CONDUCTOR_ENGINE_MAX_EVALUATOR_ITERATIONS"),
        ),
        (
            "engine.default_step_timeout_ms",
            engine.default_step_timeout_ms.to_string(),
            Some("CONDUCTOR_ENGINE_DEFAULT_STEP_TIMEOUT_MS"),
        ),
        ("engine.execution_retention_secs", engine.execution_retention_secs.to_string(), None),
        ("jobs.worker_count", jobs.worker_count.to_string(), Some("CONDUCTOR_JOBS_WORKER_COUNT")),
        ("jobs.batch_size", jobs.batch_size.to_string(), Some("CONDUCTOR_JOBS_BATCH_SIZE")),
        (
            "jobs.poll_interval_ms",
            jobs.poll_interval_ms.to_string(),
            Some("CONDUCTOR_JOBS_POLL_INTERVAL_MS"),
        ),
        (
            "jobs.max_queue_size",
            jobs.max_queue_size.to_string(),
            Some("CONDUCTOR_JOBS_MAX_QUEUE_SIZE"),
        ),
        ("jobs.default_timeout_ms", jobs.default_timeout_ms.to_string(), None),
        (
            "jobs.default_max_retries",
            jobs.default_max_retries.to_string(),
            Some("CONDUCTOR_JOBS_DEFAULT_MAX_RETRIES"),
        ),
        ("jobs.default_retry_delay_ms", jobs.default_retry_delay_ms.to_string(), None),
        ("jobs.default_backoff_multiplier", jobs.default_backoff_multiplier.to_string(), None),
        ("jobs.default_max_backoff_ms", jobs.default_max_backoff_ms.to_string(), None),
        (
            "jobs.default_jitter",
            jobs.default_jitter.to_string(),
            Some("CONDUCTOR_JOBS_DEFAULT_JITTER"),
        ),
        ("jobs.default_concurrency", jobs.default_concurrency.to_string(), None),
        ("jobs.retention_secs", jobs.retention_secs.to_string(), None),
        ("jobs.health_interval_secs", jobs.health_interval_secs.to_string(), None),
        ("jobs.alert_queue_depth", jobs.alert_queue_depth.to_string(), None),
        (
            "jobs.alert_failure_rate",
            jobs.alert_failure_rate.to_string(),
            Some("CONDUCTOR_JOBS_ALERT_FAILURE_RATE"),
        ),
        ("jobs.alert_avg_processing_ms", jobs.alert_avg_processing_ms.to_string(), None),
        (
            "recovery.max_concurrent_recoveries",
            recovery.max_concurrent_recoveries.to_string(),
            Some("CONDUCTOR_RECOVERY_MAX_CONCURRENT_RECOVERIES"),
        ),
        (
            "recovery.max_recovery_depth",
            recovery.max_recovery_depth.to_string(),
            Some("CONDUCTOR_RECOVERY_MAX_RECOVERY_DEPTH"),
        ),
        ("recovery.retry_delay_ms", recovery.retry_delay_ms.to_string(), None),
        (
            "recovery.breaker_threshold",
            recovery.breaker_threshold.to_string(),
            Some("CONDUCTOR_RECOVERY_BREAKER_THRESHOLD"),
        ),
        (
            "recovery.breaker_cooldown_ms",
            recovery.breaker_cooldown_ms.to_string(),
            Some("CONDUCTOR_RECOVERY_BREAKER_COOLDOWN_MS"),
        ),
        ("recovery.min_success_rate", recovery.min_success_rate.to_string(), None),
        ("recovery.min_samples", recovery.min_samples.to_string(), None),
        ("recovery.max_open_breakers", recovery.max_open_breakers.to_string(), None),
        ("logging.level", config.logging.level.clone(), Some("CONDUCTOR_LOGGING_LEVEL")),
        (
            "logging.format",
            format!("{:?}", config.logging.format).to_lowercase(),
            Some("CONDUCTOR_LOGGING_FORMAT"),
        ),
    ];

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value, env_key) in entries {
        lines.push(render_line(key_path, &value, source(key_path, env_key)));
    }
    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
