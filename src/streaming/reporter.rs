use tracing::{debug, warn};

use crate::error::StreamingError;

use super::{ProgressEvent, StreamingBus};

/// Emission handle given to chain steps.
///
/// Delivery problems are logged and swallowed: nothing a step emits can
/// fail the step.
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Option<StreamingBus>,
    session_id: String,
}

impl ProgressReporter {
    pub fn new(bus: StreamingBus, session_id: impl Into<String>) -> Self {
        Self {
            bus: Some(bus),
            session_id: session_id.into(),
        }
    }

    /// A reporter that drops everything.
    pub fn disabled() -> Self {
        Self {
            bus: None,
            session_id: String::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn emit(&self, event: ProgressEvent) {
        let Some(bus) = &self.bus else {
            return;
        };
        match bus.send(&self.session_id, event) {
            Ok(()) => {}
            // nobody attached, or the consumer went away
            Err(StreamingError::SessionNotFound(_)) => {
                debug!(session_id = %self.session_id, "no live session, event dropped");
            }
            Err(e) => warn!(session_id = %self.session_id, err = %e, "event delivery failed"),
        }
    }

    pub fn step_started(&self, step: &str) {
        self.emit(ProgressEvent::step_started(step));
    }

    pub fn step_completed(&self, step: &str, duration_ms: u64) {
        self.emit(ProgressEvent::step_completed(step, duration_ms));
    }

    pub fn step_failed(&self, step: &str, error: impl Into<String>) {
        self.emit(ProgressEvent::step_failed(step, error));
    }

    pub fn progress(
        &self,
        step: &str,
        percentage: u8,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) {
        let event = ProgressEvent::progress(step, percentage, message);
        self.emit(match payload {
            Some(p) => event.with_payload(p),
            None => event,
        });
    }

    pub fn data(&self, step: &str, payload: serde_json::Value) {
        self.emit(ProgressEvent::data(step, payload));
    }

    pub fn completed(&self, message: impl Into<String>, payload: Option<serde_json::Value>) {
        let event = ProgressEvent::completed(message);
        self.emit(match payload {
            Some(p) => event.with_payload(p),
            None => event,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::error(message));
    }
}
