use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::job::JobConfig;

/// Config file locations searched, in order, when no explicit path is given.
pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["conductor.toml", "config/conductor.toml"];

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub jobs: JobsConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub max_concurrent_executions: usize,
    pub max_steps_per_workflow: usize,
    pub max_evaluator_iterations: u32,
    pub default_step_timeout_ms: u64,
    pub execution_retention_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobsConfig {
    pub worker_count: usize,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub max_queue_size: usize,
    pub default_timeout_ms: u64,
    pub default_max_retries: u32,
    pub default_retry_delay_ms: u64,
    pub default_backoff_multiplier: f64,
    pub default_max_backoff_ms: u64,
    pub default_jitter: bool,
    pub default_concurrency: usize,
    pub retention_secs: u64,
    pub health_interval_secs: u64,
    pub alert_queue_depth: usize,
    pub alert_failure_rate: f64,
    pub alert_avg_processing_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecoveryConfig {
    pub max_concurrent_recoveries: usize,
    pub max_recovery_depth: u32,
    pub retry_delay_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
    pub min_success_rate: f64,
    pub min_samples: u32,
    pub max_open_breakers: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub max_concurrent_executions: Option<usize>,
    pub worker_count: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub max_concurrent_recoveries: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                max_concurrent_executions: 10,
                max_steps_per_workflow: 50,
                max_evaluator_iterations: 10,
                default_step_timeout_ms: 60_000,
                execution_retention_secs: 3_600,
            },
            jobs: JobsConfig {
                worker_count: 4,
                batch_size: 10,
                poll_interval_ms: 500,
                max_queue_size: 1_000,
                default_timeout_ms: 300_000,
                default_max_retries: 3,
                default_retry_delay_ms: 1_000,
                default_backoff_multiplier: 2.0,
                default_max_backoff_ms: 60_000,
                default_jitter: true,
                default_concurrency: 5,
                retention_secs: 86_400,
                health_interval_secs: 60,
                alert_queue_depth: 500,
                alert_failure_rate: 0.25,
                alert_avg_processing_ms: 60_000,
            },
            recovery: RecoveryConfig {
                max_concurrent_recoveries: 5,
                max_recovery_depth: 3,
                retry_delay_ms: 1_000,
                breaker_threshold: 5,
                breaker_cooldown_ms: 60_000,
                min_success_rate: 0.5,
                min_samples: 10,
                max_open_breakers: 3,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl JobsConfig {
    /// Per-job config applied when a submission carries none.
    pub fn default_job_config(&self) -> JobConfig {
        JobConfig {
            timeout_ms: self.default_timeout_ms,
            max_retries: self.default_max_retries,
            retry_delay_ms: self.default_retry_delay_ms,
            backoff_multiplier: self.default_backoff_multiplier,
            max_backoff_ms: self.default_max_backoff_ms,
            jitter: self.default_jitter,
            concurrency: self.default_concurrency,
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_CANDIDATES[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(engine) = patch.engine {
            if let Some(value) = engine.max_concurrent_executions {
                self.engine.max_concurrent_executions = value;
            }
            if let Some(value) = engine.max_steps_per_workflow {
                self.engine.max_steps_per_workflow = value;
            }
            if let Some(value) = engine.max_evaluator_iterations {
                self.engine.max_evaluator_iterations = value;
            }
            if let Some(value) = engine.default_step_timeout_ms {
                self.engine.default_step_timeout_ms = value;
            }
            if let Some(value) = engine.execution_retention_secs {
                self.engine.execution_retention_secs = value;
            }
        }

        if let Some(jobs) = patch.jobs {
            if let Some(value) = jobs.worker_count {
                self.jobs.worker_count = value;
            }
            if let Some(value) = jobs.batch_size {
                self.jobs.batch_size = value;
            }
            if let Some(value) = jobs.poll_interval_ms {
                self.jobs.poll_interval_ms = value;
            }
            if let Some(value) = jobs.max_queue_size {
                self.jobs.max_queue_size = value;
            }
            if let Some(value) = jobs.default_timeout_ms {
                self.jobs.default_timeout_ms = value;
            }
            if let Some(value) = jobs.default_max_retries {
                self.jobs.default_max_retries = value;
            }
            if let Some(value) = jobs.default_retry_delay_ms {
                self.jobs.default_retry_delay_ms = value;
            }
            if let Some(value) = jobs.default_backoff_multiplier {
                self.jobs.default_backoff_multiplier = value;
            }
            if let Some(value) = jobs.default_max_backoff_ms {
                self.jobs.default_max_backoff_ms = value;
            }
            if let Some(value) = jobs.default_jitter {
                self.jobs.default_jitter = value;
            }
            if let Some(value) = jobs.default_concurrency {
                self.jobs.default_concurrency = value;
            }
            if let Some(value) = jobs.retention_secs {
                self.jobs.retention_secs = value;
            }
            if let Some(value) = jobs.health_interval_secs {
                self.jobs.health_interval_secs = value;
            }
            if let Some(value) = jobs.alert_queue_depth {
                self.jobs.alert_queue_depth = value;
            }
            if let Some(value) = jobs.alert_failure_rate {
                self.jobs.alert_failure_rate = value;
            }
            if let Some(value) = jobs.alert_avg_processing_ms {
                self.jobs.alert_avg_processing_ms = value;
            }
        }

        if let Some(recovery) = patch.recovery {
            if let Some(value) = recovery.max_concurrent_recoveries {
                self.recovery.max_concurrent_recoveries = value;
            }
            if let Some(value) = recovery.max_recovery_depth {
                self.recovery.max_recovery_depth = value;
            }
            if let Some(value) = recovery.retry_delay_ms {
                self.recovery.retry_delay_ms = value;
            }
            if let Some(value) = recovery.breaker_threshold {
                self.recovery.breaker_threshold = value;
            }
            if let Some(value) = recovery.breaker_cooldown_ms {
                self.recovery.breaker_cooldown_ms = value;
            }
            if let Some(value) = recovery.min_success_rate {
                self.recovery.min_success_rate = value;
            }
            if let Some(value) = recovery.min_samples {
                self.recovery.min_samples = value;
            }
            if let Some(value) = recovery.max_open_breakers {
                self.recovery.max_open_breakers = value;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CONDUCTOR_ENGINE_MAX_CONCURRENT_EXECUTIONS") {
            self.engine.max_concurrent_executions =
                parse_usize("CONDUCTOR_ENGINE_MAX_CONCURRENT_EXECUTIONS", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_ENGINE_MAX_STEPS_PER_WORKFLOW") {
            self.engine.max_steps_per_workflow =
                parse_usize("CONDUCTOR_ENGINE_MAX_STEPS_PER_WORKFLOW", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_ENGINE_MAX_EVALUATOR_ITERATIONS") {
            self.engine.max_evaluator_iterations =
                parse_u32("CONDUCTOR_ENGINE_MAX_EVALUATOR_ITERATIONS", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_ENGINE_DEFAULT_STEP_TIMEOUT_MS") {
            self.engine.default_step_timeout_ms =
                parse_u64("CONDUCTOR_ENGINE_DEFAULT_STEP_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("CONDUCTOR_JOBS_WORKER_COUNT") {
            self.jobs.worker_count = parse_usize("CONDUCTOR_JOBS_WORKER_COUNT", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_JOBS_BATCH_SIZE") {
            self.jobs.batch_size = parse_usize("CONDUCTOR_JOBS_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_JOBS_POLL_INTERVAL_MS") {
            self.jobs.poll_interval_ms = parse_u64("CONDUCTOR_JOBS_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_JOBS_MAX_QUEUE_SIZE") {
            self.jobs.max_queue_size = parse_usize("CONDUCTOR_JOBS_MAX_QUEUE_SIZE", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_JOBS_DEFAULT_MAX_RETRIES") {
            self.jobs.default_max_retries =
                parse_u32("CONDUCTOR_JOBS_DEFAULT_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_JOBS_DEFAULT_JITTER") {
            self.jobs.default_jitter = parse_bool("CONDUCTOR_JOBS_DEFAULT_JITTER", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_JOBS_ALERT_FAILURE_RATE") {
            self.jobs.alert_failure_rate = parse_f64("CONDUCTOR_JOBS_ALERT_FAILURE_RATE", &value)?;
        }

        if let Some(value) = read_env("CONDUCTOR_RECOVERY_MAX_CONCURRENT_RECOVERIES") {
            self.recovery.max_concurrent_recoveries =
                parse_usize("CONDUCTOR_RECOVERY_MAX_CONCURRENT_RECOVERIES", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_RECOVERY_MAX_RECOVERY_DEPTH") {
            self.recovery.max_recovery_depth =
                parse_u32("CONDUCTOR_RECOVERY_MAX_RECOVERY_DEPTH", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_RECOVERY_BREAKER_THRESHOLD") {
            self.recovery.breaker_threshold =
                parse_u32("CONDUCTOR_RECOVERY_BREAKER_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONDUCTOR_RECOVERY_BREAKER_COOLDOWN_MS") {
            self.recovery.breaker_cooldown_ms =
                parse_u64("CONDUCTOR_RECOVERY_BREAKER_COOLDOWN_MS", &value)?;
        }

        let log_level =
            read_env("CONDUCTOR_LOGGING_LEVEL").or_else(|| read_env("CONDUCTOR_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CONDUCTOR_LOGGING_FORMAT").or_else(|| read_env("CONDUCTOR_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(value) = overrides.max_concurrent_executions {
            self.engine.max_concurrent_executions = value;
        }
        if let Some(value) = overrides.worker_count {
            self.jobs.worker_count = value;
        }
        if let Some(value) = overrides.max_queue_size {
            self.jobs.max_queue_size = value;
        }
        if let Some(value) = overrides.max_concurrent_recoveries {
            self.recovery.max_concurrent_recoveries = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_engine(&self.engine)?;
        validate_jobs(&self.jobs)?;
        validate_recovery(&self.recovery)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

/// Resolves the config file that `AppConfig::load` would read.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    CONFIG_FILE_CANDIDATES.into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.max_concurrent_executions == 0 {
        return Err(ConfigError::Validation(
            "engine.max_concurrent_executions must be greater than zero".to_string(),
        ));
    }

    if engine.max_steps_per_workflow == 0 {
        return Err(ConfigError::Validation(
            "engine.max_steps_per_workflow must be greater than zero".to_string(),
        ));
    }

    if engine.max_evaluator_iterations == 0 || engine.max_evaluator_iterations > 100 {
        return Err(ConfigError::Validation(
            "engine.max_evaluator_iterations must be in range 1..=100".to_string(),
        ));
    }

    if engine.default_step_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "engine.default_step_timeout_ms must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_jobs(jobs: &JobsConfig) -> Result<(), ConfigError> {
    if jobs.worker_count == 0 || jobs.batch_size == 0 {
        return Err(ConfigError::Validation(
            "jobs.worker_count and jobs.batch_size must be greater than zero".to_string(),
        ));
    }

    if jobs.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "jobs.poll_interval_ms must be greater than zero".to_string(),
        ));
    }

    if jobs.max_queue_size == 0 {
        return Err(ConfigError::Validation(
            "jobs.max_queue_size must be greater than zero".to_string(),
        ));
    }

    if jobs.default_timeout_ms == 0 || jobs.default_concurrency == 0 {
        return Err(ConfigError::Validation(
            "jobs.default_timeout_ms and jobs.default_concurrency must be greater than zero"
                .to_string(),
        ));
    }

    if jobs.default_backoff_multiplier < 1.0 {
        return Err(ConfigError::Validation(
            "jobs.default_backoff_multiplier must be at least 1.0".to_string(),
        ));
    }

    if jobs.default_retry_delay_ms > jobs.default_max_backoff_ms {
        return Err(ConfigError::Validation(
            "jobs.default_retry_delay_ms must not exceed jobs.default_max_backoff_ms".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&jobs.alert_failure_rate) {
        return Err(ConfigError::Validation(
            "jobs.alert_failure_rate must be in range 0.0..=1.0".to_string(),
        ));
    }

    Ok(())
}

fn validate_recovery(recovery: &RecoveryConfig) -> Result<(), ConfigError> {
    if recovery.max_concurrent_recoveries == 0 {
        return Err(ConfigError::Validation(
            "recovery.max_concurrent_recoveries must be greater than zero".to_string(),
        ));
    }

    if recovery.breaker_threshold == 0 {
        return Err(ConfigError::Validation(
            "recovery.breaker_threshold must be greater than zero".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&recovery.min_success_rate) {
        return Err(ConfigError::Validation(
            "recovery.min_success_rate must be in range 0.0..=1.0".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.trim().parse::<f64>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    engine: Option<EnginePatch>,
    jobs: Option<JobsPatch>,
    recovery: Option<RecoveryPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    max_concurrent_executions: Option<usize>,
    max_steps_per_workflow: Option<usize>,
    max_evaluator_iterations: Option<u32>,
    default_step_timeout_ms: Option<u64>,
    execution_retention_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct JobsPatch {
    worker_count: Option<usize>,
    batch_size: Option<usize>,
    poll_interval_ms: Option<u64>,
    max_queue_size: Option<usize>,
    default_timeout_ms: Option<u64>,
    default_max_retries: Option<u32>,
    default_retry_delay_ms: Option<u64>,
    default_backoff_multiplier: Option<f64>,
    default_max_backoff_ms: Option<u64>,
    default_jitter: Option<bool>,
    default_concurrency: Option<usize>,
    retention_secs: Option<u64>,
    health_interval_secs: Option<u64>,
    alert_queue_depth: Option<usize>,
    alert_failure_rate: Option<f64>,
    alert_avg_processing_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RecoveryPatch {
    max_concurrent_recoveries: Option<usize>,
    max_recovery_depth: Option<u32>,
    retry_delay_ms: Option<u64>,
    breaker_threshold: Option<u32>,
    breaker_cooldown_ms: Option<u64>,
    min_success_rate: Option<f64>,
    min_samples: Option<u32>,
    max_open_breakers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_without_a_config_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let config = AppConfig::load(LoadOptions {
            config_path: Some(dir.path().join("absent.toml")),
            ..LoadOptions::default()
        })
        .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config == AppConfig::default(), "missing optional file should yield defaults")?;
        ensure(
            config.jobs.default_job_config().max_retries == 3,
            "default job config should carry default retries",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CONDUCTOR_WORKERS", "12");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("conductor.toml");
            fs::write(
                &path,
                r#"
[jobs]
worker_count = ${TEST_CONDUCTOR_WORKERS}
default_jitter = false

[recovery]
breaker_threshold = 2
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.jobs.worker_count == 12, "worker count should come from interpolation")?;
            ensure(!config.jobs.default_jitter, "jitter should be disabled by the file")?;
            ensure(config.recovery.breaker_threshold == 2, "breaker threshold should be read")?;
            Ok(())
        })();

        clear_vars(&["TEST_CONDUCTOR_WORKERS"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONDUCTOR_LOG_LEVEL", "warn");
        env::set_var("CONDUCTOR_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["CONDUCTOR_LOG_LEVEL", "CONDUCTOR_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONDUCTOR_ENGINE_MAX_CONCURRENT_EXECUTIONS", "7");
        env::set_var("CONDUCTOR_JOBS_MAX_QUEUE_SIZE", "40");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("conductor.toml");
            fs::write(
                &path,
                r#"
[engine]
max_concurrent_executions = 3
max_steps_per_workflow = 20

[jobs]
max_queue_size = 10

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    max_queue_size: Some(99),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.jobs.max_queue_size == 99, "override queue size should win")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.engine.max_concurrent_executions == 7,
                "env concurrency should win over file and defaults",
            )?;
            ensure(config.engine.max_steps_per_workflow == 20, "file step limit should apply")?;
            Ok(())
        })();

        clear_vars(&[
            "CONDUCTOR_ENGINE_MAX_CONCURRENT_EXECUTIONS",
            "CONDUCTOR_JOBS_MAX_QUEUE_SIZE",
        ]);
        result
    }

    #[test]
    fn invalid_env_override_is_reported_with_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONDUCTOR_JOBS_WORKER_COUNT", "many");

        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected invalid override to fail".to_string()),
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "CONDUCTOR_JOBS_WORKER_COUNT", "error should name the variable")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
        };

        clear_vars(&["CONDUCTOR_JOBS_WORKER_COUNT"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("conductor.toml");
        fs::write(
            &path,
            r#"
[jobs]
default_retry_delay_ms = 90000
default_max_backoff_ms = 1000
"#,
        )
        .map_err(|err| err.to_string())?;

        let error =
            match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
            {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };

        ensure(
            error.to_string().contains("default_retry_delay_ms"),
            "validation error should name the offending key",
        )
    }

    #[test]
    fn required_file_missing_is_an_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let missing = dir.path().join("conductor.toml");
        let result = AppConfig::load(LoadOptions {
            config_path: Some(missing),
            require_file: true,
            ..LoadOptions::default()
        });

        ensure(
            matches!(result, Err(ConfigError::MissingConfigFile(_))),
            "missing required file should be reported",
        )
    }
}
