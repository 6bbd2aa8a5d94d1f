use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::{Step, StepOutcome};
use crate::context::RequestContext;
use crate::error::Result;
use crate::retrieval::Dispatcher;
use crate::streaming::ProgressReporter;

/// Federated retrieval through the [`Dispatcher`].
pub struct RetrieveStep {
    dispatcher: Arc<Dispatcher>,
    max_strategies: usize,
}

impl RetrieveStep {
    pub const NAME: &'static str = "retrieve";

    pub fn new(dispatcher: Arc<Dispatcher>, max_strategies: usize) -> Self {
        Self {
            dispatcher,
            max_strategies,
        }
    }
}

#[async_trait]
impl Step for RetrieveStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_skip(&self, ctx: &RequestContext) -> bool {
        ctx.outputs.chunks().is_some()
    }

    fn precondition(&self, ctx: &RequestContext) -> bool {
        ctx.outputs.plan().is_some()
    }

    async fn execute(
        &self,
        ctx: &mut RequestContext,
        progress: &ProgressReporter,
    ) -> Result<StepOutcome> {
        if let Some(plan) = ctx.outputs.plan() {
            progress.progress(
                Self::NAME,
                20,
                format!("querying {} sources", plan.strategies.len()),
                Some(serde_json::json!({ "strategies": plan.strategies })),
            );
        }

        let report = self
            .dispatcher
            .retrieve_report(ctx, self.max_strategies)
            .await?;

        progress.progress(
            Self::NAME,
            60,
            format!("fetched {} chunks", report.fetched),
            Some(serde_json::json!({ "calls": report.calls })),
        );

        let sources: Vec<serde_json::Value> = report
            .chunks
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "source": c.source,
                    "kind": c.kind,
                    "score": c.score,
                })
            })
            .collect();
        progress.progress(
            Self::NAME,
            75,
            format!("kept {} after merge", report.chunks.len()),
            Some(serde_json::json!({ "sources": sources })),
        );

        ctx.outputs.set_chunks(report.chunks)?;
        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetrievalConfig, StreamingConfig};
    use crate::error::RelayError;
    use crate::pipeline::plan::{PlanDetail, QueryIntent};
    use crate::retrieval::test_support::{Script, ScriptedStrategy, chunk};
    use crate::retrieval::{StrategyKind, StrategyRegistry};
    use crate::streaming::{EventType, StreamingBus};

    fn dispatcher(script: Script) -> Arc<Dispatcher> {
        let mut registry = StrategyRegistry::new();
        registry.register(ScriptedStrategy::new(StrategyKind::Vector, script));
        Arc::new(Dispatcher::new(registry, RetrievalConfig::default()))
    }

    fn planned_ctx() -> RequestContext {
        let mut ctx = RequestContext::builder("s1", "u", "tokio runtime").build().unwrap();
        let plan = PlanDetail::build(
            &ctx,
            QueryIntent::General,
            vec![StrategyKind::Vector],
            &RetrievalConfig::default(),
            vec![],
        );
        ctx.outputs.set_plan(plan).unwrap();
        ctx
    }

    #[tokio::test]
    async fn stores_merged_chunks_and_reports_phases() {
        let step = RetrieveStep::new(
            dispatcher(Script::Chunks(vec![chunk(
                StrategyKind::Vector,
                "a",
                "tokio runtime passage",
                0.9,
            )])),
            2,
        );
        let bus = StreamingBus::new(StreamingConfig::default());
        let mut emitter = bus.create_session("s1").unwrap();
        let reporter = ProgressReporter::new(bus.clone(), "s1");

        let mut ctx = planned_ctx();
        assert!(step.precondition(&ctx));
        step.execute(&mut ctx, &reporter).await.unwrap();
        assert_eq!(ctx.outputs.chunks().unwrap().len(), 1);
        assert!(step.can_skip(&ctx));

        drop(reporter);
        let mut percentages = Vec::new();
        for _ in 0..3 {
            let e = emitter.recv().await.unwrap();
            assert_eq!(e.event_type, EventType::Progress);
            percentages.push(e.percentage.unwrap());
        }
        assert_eq!(percentages, vec![20, 60, 75]);
    }

    #[tokio::test]
    async fn exhausted_dispatch_is_a_step_error() {
        let step = RetrieveStep::new(dispatcher(Script::Fail("down")), 2);
        let mut ctx = planned_ctx();
        let err = step
            .execute(&mut ctx, &ProgressReporter::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DispatchExhausted { attempted: 1 }));
        assert!(ctx.outputs.chunks().is_none());
    }

    #[test]
    fn requires_a_plan() {
        let step = RetrieveStep::new(dispatcher(Script::Chunks(vec![])), 2);
        let ctx = RequestContext::builder("s", "u", "q").build().unwrap();
        assert!(!step.precondition(&ctx));
    }
}
