use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::recovery::Severity;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub recovery_id: String,
    pub resource: String,
    pub amount: u32,
    pub requires_approval: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub recovery_id: String,
    /// Explicit target, or the failed execution/job id.
    pub target: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recovery_id: String,
    pub severity: Severity,
    pub message: String,
    pub channels: Vec<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("remediation hook failed: {0}")]
pub struct RemediationError(pub String);

/// Side effects outside the process: infrastructure scaling, rollbacks and
/// human notification.
#[async_trait]
pub trait RemediationHooks: Send + Sync {
    async fn scale(&self, request: &ScaleRequest) -> Result<(), RemediationError>;
    async fn rollback(&self, request: &RollbackRequest) -> Result<(), RemediationError>;
    async fn notify(&self, notification: &Notification) -> Result<(), RemediationError>;
}

/// Logs every request and reports success.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingRemediationHooks;

#[async_trait]
impl RemediationHooks for LoggingRemediationHooks {
    async fn scale(&self, request: &ScaleRequest) -> Result<(), RemediationError> {
        info!(
            event_name = "recovery.hooks.scale",
            recovery_id = %request.recovery_id,
            resource = %request.resource,
            amount = request.amount,
            requires_approval = request.requires_approval,
            "resource scaling requested"
        );
        Ok(())
    }

    async fn rollback(&self, request: &RollbackRequest) -> Result<(), RemediationError> {
        info!(
            event_name = "recovery.hooks.rollback",
            recovery_id = %request.recovery_id,
            target = %request.target,
            "rollback requested"
        );
        Ok(())
    }

    async fn notify(&self, notification: &Notification) -> Result<(), RemediationError> {
        warn!(
            event_name = "recovery.hooks.notify",
            recovery_id = %notification.recovery_id,
            severity = notification.severity.as_str(),
            channels = %notification.channels.join(","),
            message = %notification.message,
            "recovery notification"
        );
        Ok(())
    }
}
