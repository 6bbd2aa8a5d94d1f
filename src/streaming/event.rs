use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StepStarted,
    StepCompleted,
    StepFailed,
    Progress,
    Data,
    Completed,
    Error,
    /// Keep-alive emitted by the bus itself, never by steps.
    Heartbeat,
}

impl EventType {
    /// `completed` and `error` end a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Completed | EventType::Error)
    }
}

/// A single notification delivered to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    fn new(event_type: EventType, step: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            step: step.map(str::to_string),
            message: message.into(),
            payload: None,
            percentage: None,
            timestamp: Utc::now(),
        }
    }

    pub fn step_started(step: &str) -> Self {
        Self::new(EventType::StepStarted, Some(step), format!("{step} started"))
    }

    pub fn step_completed(step: &str, duration_ms: u64) -> Self {
        Self::new(EventType::StepCompleted, Some(step), format!("{step} completed"))
            .with_payload(serde_json::json!({ "duration_ms": duration_ms }))
    }

    pub fn step_failed(step: &str, error: impl Into<String>) -> Self {
        Self::new(EventType::StepFailed, Some(step), error)
    }

    pub fn progress(step: &str, percentage: u8, message: impl Into<String>) -> Self {
        let mut event = Self::new(EventType::Progress, Some(step), message);
        event.percentage = Some(percentage.min(100));
        event
    }

    pub fn data(step: &str, payload: serde_json::Value) -> Self {
        Self::new(EventType::Data, Some(step), String::new()).with_payload(payload)
    }

    pub fn completed(message: impl Into<String>) -> Self {
        let mut event = Self::new(EventType::Completed, None, message);
        event.percentage = Some(100);
        event
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventType::Error, None, message)
    }

    pub fn heartbeat() -> Self {
        Self::new(EventType::Heartbeat, None, "heartbeat")
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
