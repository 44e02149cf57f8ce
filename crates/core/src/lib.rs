pub mod backoff;
pub mod condition;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod jobs;
pub mod recovery;
pub mod service;
pub mod telemetry;

mod sync;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use condition::{Condition, ConditionError, Operator};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use domain::execution::{ExecutionId, ExecutionState, ExecutionStatus};
pub use domain::job::{Job, JobId, JobPriority, JobSpec, JobStatus};
pub use domain::recovery::{ErrorReport, RecoveryContext, RecoveryRule, ReportedError};
pub use domain::workflow::{ExecutionContext, ExecutionPattern, WorkflowDefinition, WorkflowStep};
pub use engine::{EchoStepExecutor, EngineError, StepExecutor, WorkflowEngine};
pub use errors::{ApplicationError, InterfaceError};
pub use jobs::{JobError, JobHandler, JobOutcome, JobProcessor};
pub use recovery::{ErrorRecoverySystem, RecoveryError, RemediationHooks};
pub use service::{ServiceHealth, Services, ServicesHandle};
pub use telemetry::{TelemetryEvent, TelemetrySink};
