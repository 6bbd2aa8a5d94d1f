use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::context::{RequestContext, RequestStatus};
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad input; never retried.
    Validation,
    /// A step reported `Failed` without raising.
    StepFailed,
    /// A step raised an error.
    StepError,
    /// Every selected retrieval source failed or came back empty.
    DispatchExhausted,
    /// The model call failed.
    Model,
    /// The chain task itself died.
    Internal,
}

/// The captured cause of a failed chain, safe to clone and hand to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainFailure {
    pub kind: FailureKind,
    pub step: Option<String>,
    pub message: String,
}

impl ChainFailure {
    pub fn from_error(step: &str, err: &RelayError) -> Self {
        let kind = match err {
            RelayError::Validation(_) => FailureKind::Validation,
            RelayError::DispatchExhausted { .. } => FailureKind::DispatchExhausted,
            RelayError::Llm(_) => FailureKind::Model,
            _ => FailureKind::StepError,
        };
        Self {
            kind,
            step: Some(step.to_string()),
            message: err.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != FailureKind::Validation
    }
}

impl std::fmt::Display for ChainFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step {
            Some(step) => write!(f, "step '{step}' failed: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Bookkeeping for one chain execution.
#[derive(Debug, Clone)]
pub struct ChainContext {
    pub request: RequestContext,
    /// Steps that ran in the current (or final) attempt, in order.
    pub executed_steps: Vec<String>,
    pub step_durations: BTreeMap<String, Duration>,
    pub step_success: BTreeMap<String, bool>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub completed: bool,
    pub success: bool,
    pub failure: Option<ChainFailure>,
    pub total_duration: Duration,
    started: Instant,
}

impl ChainContext {
    pub fn new(request: RequestContext, max_retries: u32) -> Self {
        Self {
            request,
            executed_steps: Vec::new(),
            step_durations: BTreeMap::new(),
            step_success: BTreeMap::new(),
            retry_count: 0,
            max_retries,
            completed: false,
            success: false,
            failure: None,
            total_duration: Duration::ZERO,
            started: Instant::now(),
        }
    }

    /// Total attempts made so far, including the first.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub(crate) fn record_step(&mut self, step: &str, duration: Duration, success: bool) {
        self.executed_steps.push(step.to_string());
        self.step_durations.insert(step.to_string(), duration);
        self.step_success.insert(step.to_string(), success);
    }

    /// Clear per-attempt history before the next attempt.  Step outputs on
    /// the request survive.
    pub(crate) fn reset_for_retry(&mut self) {
        self.executed_steps.clear();
        self.step_durations.clear();
        self.step_success.clear();
        self.failure = None;
        self.retry_count += 1;
    }

    /// Seal the outcome.  Only the first call has any effect.
    pub(crate) fn finalize(&mut self, failure: Option<ChainFailure>) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        self.success = failure.is_none();
        self.total_duration = self.started.elapsed();
        self.request.current_step = None;
        match &failure {
            None => {
                self.request.status = RequestStatus::Succeeded;
            }
            Some(f) => {
                self.request.status = RequestStatus::Failed;
                self.request.error_message = Some(f.to_string());
            }
        }
        self.failure = failure;
        true
    }

    /// The final model answer, if the chain got that far.
    pub fn response(&self) -> Option<&str> {
        self.request.outputs.response()
    }

    /// Statistics attached to the terminal event.
    pub fn summary(&self) -> serde_json::Value {
        let durations: BTreeMap<&str, u64> = self
            .step_durations
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_millis() as u64))
            .collect();
        serde_json::json!({
            "query_id": self.request.query_id(),
            "success": self.success,
            "attempts": self.attempts(),
            "retry_count": self.retry_count,
            "executed_steps": self.executed_steps,
            "step_durations_ms": durations,
            "step_success": self.step_success,
            "total_duration_ms": self.total_duration.as_millis() as u64,
            "failure": self.failure,
        })
    }
}
