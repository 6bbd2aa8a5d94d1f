//! Ordered, retryable step execution over a shared [`RequestContext`].
//!
//! A failed attempt resets the [`ChainContext`] and reruns the chain from
//! the top.  Step outputs already recorded on the request survive the
//! reset, and each built-in step skips itself when its output exists, so a
//! retry effectively resumes after the last step that completed.

pub mod context;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{RequestContext, RequestStatus};
use crate::error::{RelayError, Result};
use crate::streaming::{ProgressReporter, StreamingBus};

pub use context::{ChainContext, ChainFailure, FailureKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// Stop this attempt without raising.  Counts as a failure for retry.
    Failed(String),
}

#[async_trait]
pub trait Step: Send + Sync {
    /// Unique within a chain.
    fn name(&self) -> &str;

    /// True when this step's result is already on the request.
    fn can_skip(&self, _ctx: &RequestContext) -> bool {
        false
    }

    /// When false the step is passed over as a no-op.
    fn precondition(&self, _ctx: &RequestContext) -> bool {
        true
    }

    async fn execute(
        &self,
        ctx: &mut RequestContext,
        progress: &ProgressReporter,
    ) -> Result<StepOutcome>;
}

#[derive(Default)]
pub struct ChainBuilder {
    steps: Vec<Arc<dyn Step>>,
    max_retries: u32,
    bus: Option<StreamingBus>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Retries after the first failed attempt.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Publish progress for each request's session on `bus`.
    pub fn bus(mut self, bus: StreamingBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<Chain> {
        if self.steps.is_empty() {
            return Err(RelayError::Chain("a chain needs at least one step".into()));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name().to_string()) {
                return Err(RelayError::Chain(format!(
                    "duplicate step name '{}'",
                    step.name()
                )));
            }
        }
        Ok(Chain {
            steps: self.steps,
            max_retries: self.max_retries,
            bus: self.bus,
        })
    }
}

/// An immutable list of steps.
pub struct Chain {
    steps: Vec<Arc<dyn Step>>,
    max_retries: u32,
    bus: Option<StreamingBus>,
}

impl Chain {
    pub fn builder() -> ChainBuilder {
        ChainBuilder::new()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn reporter_for(&self, request: &RequestContext) -> ProgressReporter {
        match &self.bus {
            Some(bus) => ProgressReporter::new(bus.clone(), request.session_id()),
            None => ProgressReporter::disabled(),
        }
    }

    /// Run to completion.  Never returns an error: failures are captured on
    /// the returned context.
    pub async fn execute(&self, request: RequestContext) -> ChainContext {
        let reporter = self.reporter_for(&request);
        let mut cc = ChainContext::new(request, self.max_retries);
        cc.request.status = RequestStatus::Running;

        debug!(
            query_id = cc.request.query_id(),
            session_id = cc.request.session_id(),
            steps = self.steps.len(),
            "chain started"
        );

        loop {
            match self.run_attempt(&mut cc, &reporter).await {
                Ok(()) => {
                    cc.finalize(None);
                    break;
                }
                Err(failure) if failure.is_retryable() && cc.can_retry() => {
                    warn!(
                        query_id = cc.request.query_id(),
                        attempt = cc.attempts(),
                        max_retries = self.max_retries,
                        failure = %failure,
                        "chain attempt failed, retrying"
                    );
                    cc.reset_for_retry();
                }
                Err(failure) => {
                    cc.finalize(Some(failure));
                    break;
                }
            }
        }

        match &cc.failure {
            None => {
                info!(
                    query_id = cc.request.query_id(),
                    attempts = cc.attempts(),
                    duration_ms = cc.total_duration.as_millis() as u64,
                    "chain succeeded"
                );
                reporter.completed("request completed", Some(cc.summary()));
            }
            Some(failure) => {
                warn!(
                    query_id = cc.request.query_id(),
                    attempts = cc.attempts(),
                    failure = %failure,
                    "chain failed"
                );
                reporter.emit(
                    crate::streaming::ProgressEvent::error(failure.to_string())
                        .with_payload(cc.summary()),
                );
            }
        }
        cc
    }

    async fn run_attempt(
        &self,
        cc: &mut ChainContext,
        reporter: &ProgressReporter,
    ) -> std::result::Result<(), ChainFailure> {
        for step in &self.steps {
            let name = step.name();
            cc.request.current_step = Some(name.to_string());

            if step.can_skip(&cc.request) {
                debug!(query_id = cc.request.query_id(), step = name, "output present, step skipped");
                continue;
            }
            if !step.precondition(&cc.request) {
                debug!(query_id = cc.request.query_id(), step = name, "precondition not met, step passed over");
                continue;
            }

            reporter.step_started(name);
            let started = Instant::now();
            let result = step.execute(&mut cc.request, reporter).await;
            let elapsed = started.elapsed();

            match result {
                Ok(StepOutcome::Continue) => {
                    cc.record_step(name, elapsed, true);
                    reporter.step_completed(name, elapsed.as_millis() as u64);
                }
                Ok(StepOutcome::Failed(reason)) => {
                    cc.record_step(name, elapsed, false);
                    reporter.step_failed(name, reason.clone());
                    return Err(ChainFailure {
                        kind: FailureKind::StepFailed,
                        step: Some(name.to_string()),
                        message: reason,
                    });
                }
                Err(e) => {
                    cc.record_step(name, elapsed, false);
                    reporter.step_failed(name, e.to_string());
                    return Err(ChainFailure::from_error(name, &e));
                }
            }
        }
        Ok(())
    }

    /// Run on a spawned task.
    pub fn execute_async(self: &Arc<Self>, request: RequestContext) -> JoinHandle<ChainContext> {
        let chain = Arc::clone(self);
        tokio::spawn(async move { chain.execute(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamingConfig;
    use crate::streaming::EventType;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays back scripted results, repeating the last one.
    struct ScriptedStep {
        name: &'static str,
        script: Mutex<VecDeque<std::result::Result<StepOutcome, &'static str>>>,
        validation: bool,
        calls: AtomicUsize,
        writes: Option<&'static str>,
        requires: Option<&'static str>,
    }

    impl ScriptedStep {
        fn new(name: &'static str, script: Vec<std::result::Result<StepOutcome, &'static str>>) -> Self {
            Self {
                name,
                script: Mutex::new(script.into()),
                validation: false,
                calls: AtomicUsize::new(0),
                writes: None,
                requires: None,
            }
        }

        fn ok(name: &'static str) -> Self {
            Self::new(name, vec![Ok(StepOutcome::Continue)])
        }

        fn writing(mut self, key: &'static str) -> Self {
            self.writes = Some(key);
            self
        }

        fn requiring(mut self, key: &'static str) -> Self {
            self.requires = Some(key);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Step for ScriptedStep {
        fn name(&self) -> &str {
            self.name
        }

        fn can_skip(&self, ctx: &RequestContext) -> bool {
            self.writes.is_some_and(|k| ctx.outputs.extra(k).is_some())
        }

        fn precondition(&self, ctx: &RequestContext) -> bool {
            self.requires.is_none_or(|k| ctx.outputs.extra(k).is_some())
        }

        async fn execute(
            &self,
            ctx: &mut RequestContext,
            _progress: &ProgressReporter,
        ) -> Result<StepOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                }
            };
            match next {
                Ok(outcome) => {
                    if let (StepOutcome::Continue, Some(key)) = (&outcome, self.writes) {
                        ctx.outputs.insert_extra(key, serde_json::json!(true))?;
                    }
                    Ok(outcome)
                }
                Err(msg) if self.validation => Err(RelayError::Validation(msg.into())),
                Err(msg) => Err(RelayError::Step {
                    step: self.name.into(),
                    message: msg.into(),
                }),
            }
        }
    }

    fn request() -> RequestContext {
        RequestContext::builder("session-1", "user-1", "question").build().unwrap()
    }

    fn chain(steps: Vec<Arc<ScriptedStep>>, retries: u32) -> Chain {
        steps
            .into_iter()
            .fold(Chain::builder().max_retries(retries), |b, s| b.step(s))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let a = Arc::new(ScriptedStep::ok("a"));
        let b = Arc::new(ScriptedStep::ok("b"));
        let cc = chain(vec![a.clone(), b.clone()], 3).execute(request()).await;

        assert!(cc.completed);
        assert!(cc.success);
        assert_eq!(cc.executed_steps, vec!["a", "b"]);
        assert_eq!(cc.step_success.get("b"), Some(&true));
        assert!(cc.step_durations.contains_key("a"));
        assert_eq!(cc.retry_count, 0);
        assert_eq!(cc.request.status, RequestStatus::Succeeded);
    }

    #[tokio::test]
    async fn always_failing_chain_runs_one_plus_max_retries_times() {
        let a = Arc::new(ScriptedStep::ok("a"));
        let bad = Arc::new(ScriptedStep::new("bad", vec![Err("broken")]));
        let cc = chain(vec![a.clone(), bad.clone()], 3).execute(request()).await;

        assert_eq!(bad.calls(), 4);
        assert_eq!(a.calls(), 4);
        assert_eq!(cc.retry_count, 3);
        assert!(cc.completed);
        assert!(!cc.success);
        let failure = cc.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::StepError);
        assert_eq!(failure.step.as_deref(), Some("bad"));
        assert!(failure.message.contains("broken"));
        // history is that of the last attempt only
        assert_eq!(cc.executed_steps, vec!["a", "bad"]);
        assert_eq!(cc.step_success.get("bad"), Some(&false));
    }

    #[tokio::test]
    async fn explicit_failed_outcome_is_retried() {
        let flaky = Arc::new(ScriptedStep::new(
            "flaky",
            vec![
                Ok(StepOutcome::Failed("not yet".into())),
                Ok(StepOutcome::Failed("not yet".into())),
                Ok(StepOutcome::Continue),
            ],
        ));
        let cc = chain(vec![flaky.clone()], 3).execute(request()).await;
        assert!(cc.success);
        assert_eq!(flaky.calls(), 3);
        assert_eq!(cc.retry_count, 2);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let mut step = ScriptedStep::new("check", vec![Err("missing field")]);
        step.validation = true;
        let step = Arc::new(step);
        let cc = chain(vec![step.clone()], 3).execute(request()).await;
        assert_eq!(step.calls(), 1);
        assert_eq!(cc.failure.unwrap().kind, FailureKind::Validation);
    }

    #[tokio::test]
    async fn retry_resumes_after_completed_steps() {
        let first = Arc::new(ScriptedStep::ok("first").writing("first_done"));
        let second = Arc::new(ScriptedStep::new(
            "second",
            vec![Err("transient"), Ok(StepOutcome::Continue)],
        ));
        let cc = chain(vec![first.clone(), second.clone()], 3).execute(request()).await;

        assert!(cc.success);
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 2);
        assert_eq!(cc.executed_steps, vec!["second"]);
    }

    #[tokio::test]
    async fn unmet_precondition_passes_over_step() {
        let gated = Arc::new(ScriptedStep::new("gated", vec![Err("should not run")]).requiring("never"));
        let after = Arc::new(ScriptedStep::ok("after"));
        let cc = chain(vec![gated.clone(), after.clone()], 0).execute(request()).await;
        assert!(cc.success);
        assert_eq!(gated.calls(), 0);
        assert_eq!(cc.executed_steps, vec!["after"]);
    }

    #[test]
    fn builder_rejects_duplicates_and_empty() {
        let err = Chain::builder()
            .step(Arc::new(ScriptedStep::ok("a")))
            .step(Arc::new(ScriptedStep::ok("a")))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("duplicate"));
        assert!(Chain::builder().build().is_err());
    }

    #[tokio::test]
    async fn emits_lifecycle_and_single_terminal_event() {
        let bus = StreamingBus::new(StreamingConfig::default());
        let mut emitter = bus.create_session("session-1").unwrap();
        let chain = Chain::builder()
            .step(Arc::new(ScriptedStep::new("bad", vec![Err("boom")])))
            .max_retries(1)
            .bus(bus.clone())
            .build()
            .unwrap();

        let cc = chain.execute(request()).await;
        assert!(!cc.success);
        assert!(!bus.is_active("session-1"));

        let mut types = Vec::new();
        while let Some(e) = emitter.recv().await {
            types.push(e.event_type);
        }
        assert_eq!(
            types,
            vec![
                EventType::StepStarted,
                EventType::StepFailed,
                EventType::StepStarted,
                EventType::StepFailed,
                EventType::Error,
            ]
        );
    }

    #[tokio::test]
    async fn execute_async_returns_context() {
        let chain = Arc::new(chain(vec![Arc::new(ScriptedStep::ok("only"))], 0));
        let cc = chain.execute_async(request()).await.unwrap();
        assert!(cc.success);
        assert_eq!(chain.step_names(), vec!["only"]);
    }
}
