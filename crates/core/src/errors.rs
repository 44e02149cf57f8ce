use thiserror::Error;

use crate::{config::ConfigError, engine::EngineError, jobs::JobError, recovery::RecoveryError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Jobs(#[from] JobError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<ConfigError> for ApplicationError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested execution, job or rule does not exist.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }

    /// Capacity rejections clear on their own; callers may retry them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Engine(EngineError::AtCapacity { .. })
                | Self::Jobs(JobError::QueueFull { .. })
                | Self::Recovery(RecoveryError::AtCapacity { .. })
        )
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Engine(EngineError::AtCapacity { .. })
            | ApplicationError::Jobs(JobError::QueueFull { .. })
            | ApplicationError::Recovery(RecoveryError::AtCapacity { .. })
            | ApplicationError::Recovery(RecoveryError::DeferralRejected(_)) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Engine(EngineError::NotFound(_))
            | ApplicationError::Jobs(JobError::NotFound(_))
            | ApplicationError::Recovery(RecoveryError::RuleNotFound(_)) => {
                Self::NotFound { message, correlation_id }
            }
            ApplicationError::Engine(_)
            | ApplicationError::Jobs(_)
            | ApplicationError::Recovery(_) => Self::BadRequest { message, correlation_id },
            ApplicationError::Configuration(_) => Self::Internal { message, correlation_id },
        }
    }
}
