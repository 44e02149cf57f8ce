use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryCategory {
    Execution,
    Job,
    Recovery,
    System,
}

impl TelemetryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Job => "job",
            Self::Recovery => "recovery",
            Self::System => "system",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryOutcome {
    Success,
    Rejected,
    Failed,
    Info,
}

/// One-way structured event for external observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_id: String,
    pub event_type: String,
    pub category: TelemetryCategory,
    pub subject_id: String,
    pub correlation_id: String,
    pub outcome: TelemetryOutcome,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(
        event_type: impl Into<String>,
        category: TelemetryCategory,
        subject_id: impl Into<String>,
        outcome: TelemetryOutcome,
    ) -> Self {
        let subject_id = subject_id.into();
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            category,
            correlation_id: subject_id.clone(),
            subject_id,
            outcome,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Forwards events to `tracing` at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        tracing::info!(
            event_name = %event.event_type,
            category = event.category.as_str(),
            subject_id = %event.subject_id,
            correlation_id = %event.correlation_id,
            outcome = ?event.outcome,
            metadata = %metadata,
            "telemetry event"
        );
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTelemetrySink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl InMemoryTelemetrySink {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.event_type).collect()
    }
}

impl TelemetrySink for InMemoryTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::telemetry::{
        InMemoryTelemetrySink, TelemetryCategory, TelemetryEvent, TelemetryOutcome, TelemetrySink,
    };

    #[test]
    fn in_memory_sink_records_events_with_correlation_fields() {
        let sink = InMemoryTelemetrySink::default();
        sink.emit(
            TelemetryEvent::new(
                "job.retrying",
                TelemetryCategory::Job,
                "job-42",
                TelemetryOutcome::Failed,
            )
            .with_correlation_id("exec-7")
            .with_metadata("retry_count", "1")
            .with_metadata("delay_ms", "200"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject_id, "job-42");
        assert_eq!(events[0].correlation_id, "exec-7");
        assert_eq!(events[0].metadata.get("delay_ms").map(String::as_str), Some("200"));
        assert_eq!(sink.event_types(), vec!["job.retrying".to_owned()]);
    }
}
