//! Strategy selection and concurrent fan-out.
//!
//! Selection walks a candidate list built from, in order: the explicit hint,
//! the user's preferred sources, the intent mapping, and the configured
//! default order.  Unavailable strategies are skipped at every stage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RetrievalConfig;
use crate::context::RequestContext;
use crate::error::{RelayError, Result};
use crate::pipeline::plan::QueryIntent;

use super::merge::{MergeOptions, merge_chunks};
use super::{KnowledgeChunk, Strategy, StrategyKind, StrategyRegistry};

/// How one strategy call ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallStatus {
    Returned { count: usize },
    Failed { message: String },
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyCall {
    pub kind: StrategyKind,
    #[serde(flatten)]
    pub status: CallStatus,
    pub elapsed_ms: u64,
}

/// Merged chunks plus the per-strategy outcome of the fan-out.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub chunks: Vec<KnowledgeChunk>,
    pub calls: Vec<StrategyCall>,
    /// Chunks received before dedup and filtering.
    pub fetched: usize,
}

pub struct Dispatcher {
    registry: StrategyRegistry,
    config: RetrievalConfig,
}

impl Dispatcher {
    pub fn new(registry: StrategyRegistry, config: RetrievalConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Candidate kinds in selection order, deduplicated, availability not
    /// yet checked.  An explicit hint yields only the hinted kind.
    fn candidates(&self, ctx: &RequestContext) -> Vec<StrategyKind> {
        if let Some(hint) = ctx.params.strategy_hint {
            if self.registry.available(hint).is_some() {
                return vec![hint];
            }
            warn!(
                query_id = ctx.query_id(),
                hint = %hint,
                "hinted strategy unavailable, falling back"
            );
        }

        let preferred: &[StrategyKind] = if ctx.preferences.preferred_sources.is_empty() {
            self.config
                .user_preferences
                .get(ctx.user_id())
                .map(Vec::as_slice)
                .unwrap_or(&[])
        } else {
            &ctx.preferences.preferred_sources
        };

        let intent = ctx
            .outputs
            .plan()
            .map(|p| p.intent)
            .unwrap_or_else(|| QueryIntent::classify(ctx.query()));

        let mut out: Vec<StrategyKind> = Vec::new();
        for kind in preferred
            .iter()
            .chain(intent.preferred_kinds())
            .chain(&self.config.default_order)
        {
            if !out.contains(kind) {
                out.push(*kind);
            }
        }
        out
    }

    /// The single best available strategy for this request.
    pub fn select(&self, ctx: &RequestContext) -> Result<Arc<dyn Strategy>> {
        self.candidates(ctx)
            .into_iter()
            .find_map(|k| self.registry.available(k))
            .ok_or(RelayError::DispatchExhausted { attempted: 0 })
    }

    /// Up to `n` available strategies, preferred first, one per kind.
    pub fn select_multiple(&self, ctx: &RequestContext, n: usize) -> Vec<Arc<dyn Strategy>> {
        self.candidates(ctx)
            .into_iter()
            .filter_map(|k| self.registry.available(k))
            .take(n)
            .collect()
    }

    /// Fan out to up to `max_strategies` strategies and merge the results.
    pub async fn retrieve(
        &self,
        ctx: &RequestContext,
        max_strategies: usize,
    ) -> Result<Vec<KnowledgeChunk>> {
        self.retrieve_report(ctx, max_strategies)
            .await
            .map(|report| report.chunks)
    }

    /// Like [`Dispatcher::retrieve`], also reporting how each call ended.
    ///
    /// Waits for every call or its timeout.  Fails with
    /// [`RelayError::DispatchExhausted`] only when nothing at all came back.
    pub async fn retrieve_report(
        &self,
        ctx: &RequestContext,
        max_strategies: usize,
    ) -> Result<DispatchReport> {
        let selected = self.select_multiple(ctx, max_strategies);
        if selected.is_empty() {
            warn!(query_id = ctx.query_id(), "no retrieval strategy available");
            return Err(RelayError::DispatchExhausted { attempted: 0 });
        }

        let timeout = self.config.strategy_timeout();
        let query = ctx.query();
        debug!(
            query_id = ctx.query_id(),
            strategies = ?selected.iter().map(|s| s.kind()).collect::<Vec<_>>(),
            "dispatching retrieval"
        );

        let results = join_all(
            selected
                .iter()
                .map(|s| call_strategy(s.as_ref(), query, ctx, timeout)),
        )
        .await;

        let mut calls = Vec::with_capacity(results.len());
        let mut all = Vec::new();
        for (call, chunks) in results {
            calls.push(call);
            all.extend(chunks);
        }

        if all.is_empty() {
            warn!(
                query_id = ctx.query_id(),
                attempted = selected.len(),
                "every selected strategy failed or returned nothing"
            );
            return Err(RelayError::DispatchExhausted {
                attempted: selected.len(),
            });
        }

        let fetched = all.len();
        let chunks = merge_chunks(all, query, &MergeOptions::for_request(&self.config, ctx));
        info!(
            query_id = ctx.query_id(),
            fetched,
            kept = chunks.len(),
            "retrieval merged"
        );

        Ok(DispatchReport {
            chunks,
            calls,
            fetched,
        })
    }
}

async fn call_strategy(
    strategy: &dyn Strategy,
    query: &str,
    ctx: &RequestContext,
    timeout: Duration,
) -> (StrategyCall, Vec<KnowledgeChunk>) {
    let kind = strategy.kind();
    let started = Instant::now();

    let (status, chunks) = match tokio::time::timeout(timeout, strategy.retrieve(query, ctx)).await {
        Ok(Ok(chunks)) => (CallStatus::Returned { count: chunks.len() }, chunks),
        Ok(Err(e)) => {
            warn!(query_id = ctx.query_id(), kind = %kind, err = %e, "strategy failed");
            (
                CallStatus::Failed {
                    message: e.to_string(),
                },
                Vec::new(),
            )
        }
        Err(_) => {
            warn!(
                query_id = ctx.query_id(),
                kind = %kind,
                timeout_ms = timeout.as_millis() as u64,
                "strategy timed out"
            );
            (CallStatus::TimedOut, Vec::new())
        }
    };

    let call = StrategyCall {
        kind,
        status,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    (call, chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RetrievalParams, UserPreferences};
    use crate::retrieval::test_support::{Script, ScriptedStrategy, chunk};

    fn dispatcher(strategies: Vec<Arc<ScriptedStrategy>>) -> Dispatcher {
        dispatcher_with(strategies, RetrievalConfig::default())
    }

    fn dispatcher_with(strategies: Vec<Arc<ScriptedStrategy>>, config: RetrievalConfig) -> Dispatcher {
        let mut registry = StrategyRegistry::new();
        for s in strategies {
            registry.register(s);
        }
        Dispatcher::new(registry, config)
    }

    fn ctx(query: &str) -> RequestContext {
        RequestContext::builder("s", "alice", query).build().unwrap()
    }

    fn kinds(selected: &[Arc<dyn Strategy>]) -> Vec<StrategyKind> {
        selected.iter().map(|s| s.kind()).collect()
    }

    fn all_three() -> Vec<Arc<ScriptedStrategy>> {
        vec![
            ScriptedStrategy::new(StrategyKind::Vector, Script::Chunks(vec![])),
            ScriptedStrategy::new(StrategyKind::Relational, Script::Chunks(vec![])),
            ScriptedStrategy::new(StrategyKind::Api, Script::Chunks(vec![])),
        ]
    }

    #[test]
    fn hint_wins() {
        let d = dispatcher(all_three());
        let c = RequestContext::builder("s", "u", "similar docs")
            .params(RetrievalParams {
                strategy_hint: Some(StrategyKind::Api),
                ..Default::default()
            })
            .build()
            .unwrap();
        assert_eq!(d.select(&c).unwrap().kind(), StrategyKind::Api);
        assert_eq!(kinds(&d.select_multiple(&c, 3)), vec![StrategyKind::Api]);
    }

    #[test]
    fn unavailable_hint_falls_through() {
        let d = dispatcher(vec![
            ScriptedStrategy::new(StrategyKind::Vector, Script::Chunks(vec![])),
            ScriptedStrategy::unavailable(StrategyKind::Api),
        ]);
        let c = RequestContext::builder("s", "u", "anything")
            .params(RetrievalParams {
                strategy_hint: Some(StrategyKind::Api),
                ..Default::default()
            })
            .build()
            .unwrap();
        assert_eq!(d.select(&c).unwrap().kind(), StrategyKind::Vector);
    }

    #[test]
    fn user_preferences_then_config_preferences() {
        let mut config = RetrievalConfig::default();
        config
            .user_preferences
            .insert("alice".into(), vec![StrategyKind::Api, StrategyKind::Relational]);
        let d = dispatcher_with(all_three(), config);

        // configured per-user list applies when the request carries none
        assert_eq!(d.select(&ctx("plain question")).unwrap().kind(), StrategyKind::Api);

        let c = RequestContext::builder("s", "alice", "plain question")
            .preferences(UserPreferences {
                preferred_sources: vec![StrategyKind::Relational],
                ..Default::default()
            })
            .build()
            .unwrap();
        assert_eq!(d.select(&c).unwrap().kind(), StrategyKind::Relational);
    }

    #[test]
    fn intent_then_default_order() {
        let d = dispatcher(all_three());
        assert_eq!(d.select(&ctx("latest news")).unwrap().kind(), StrategyKind::Api);
        assert_eq!(d.select(&ctx("exact list")).unwrap().kind(), StrategyKind::Relational);
        assert_eq!(d.select(&ctx("plain question")).unwrap().kind(), StrategyKind::Vector);
        assert_eq!(
            kinds(&d.select_multiple(&ctx("compare X and Y"), 2)),
            vec![StrategyKind::Vector, StrategyKind::Relational]
        );
    }

    #[test]
    fn select_multiple_dedups_and_skips_unavailable() {
        let d = dispatcher(vec![
            ScriptedStrategy::unavailable(StrategyKind::Vector),
            ScriptedStrategy::new(StrategyKind::Relational, Script::Chunks(vec![])),
            ScriptedStrategy::new(StrategyKind::Api, Script::Chunks(vec![])),
        ]);
        let c = RequestContext::builder("s", "u", "similar things")
            .preferences(UserPreferences {
                preferred_sources: vec![StrategyKind::Api, StrategyKind::Api],
                ..Default::default()
            })
            .build()
            .unwrap();
        assert_eq!(
            kinds(&d.select_multiple(&c, 5)),
            vec![StrategyKind::Api, StrategyKind::Relational]
        );
    }

    #[test]
    fn select_with_nothing_available_errors() {
        let d = dispatcher(vec![ScriptedStrategy::unavailable(StrategyKind::Vector)]);
        assert!(matches!(
            d.select(&ctx("q")),
            Err(RelayError::DispatchExhausted { attempted: 0 })
        ));
    }

    #[tokio::test]
    async fn compare_scenario_end_to_end() {
        let vector = ScriptedStrategy::new(
            StrategyKind::Vector,
            Script::Chunks(vec![
                chunk(StrategyKind::Vector, "v1", "X is a systems language", 0.9),
                chunk(StrategyKind::Vector, "v2", "X and Y share a runtime model", 0.6),
                chunk(StrategyKind::Vector, "v3", "Unrelated trivia about Z", 0.4),
            ]),
        );
        let relational = ScriptedStrategy::new(
            StrategyKind::Relational,
            Script::Chunks(vec![
                chunk(StrategyKind::Relational, "r1", "Y favours garbage collection", 0.8),
                chunk(StrategyKind::Relational, "r2", "Old changelog entry", 0.3),
                chunk(StrategyKind::Relational, "r3", "X and Y share a runtime model", 0.7),
            ]),
        );
        let api = ScriptedStrategy::new(StrategyKind::Api, Script::Fail("not selected"));
        let d = dispatcher(vec![vector.clone(), relational.clone(), api.clone()]);

        let c = RequestContext::builder("s", "u", "compare X and Y")
            .params(RetrievalParams {
                max_results: Some(3),
                similarity_threshold: Some(0.5),
                ..Default::default()
            })
            .build()
            .unwrap();
        let report = d.retrieve_report(&c, 2).await.unwrap();
        let scores: Vec<f32> = report.chunks.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.8, 0.7]);
        assert_eq!(report.fetched, 6);
        assert_eq!(report.calls.len(), 2);
        assert_eq!(vector.calls(), 1);
        assert_eq!(relational.calls(), 1);
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn partial_failure_still_returns_results() {
        let d = dispatcher(vec![
            ScriptedStrategy::new(StrategyKind::Vector, Script::Fail("index corrupt")),
            ScriptedStrategy::new(
                StrategyKind::Relational,
                Script::Chunks(vec![chunk(StrategyKind::Relational, "r1", "useful passage here", 0.9)]),
            ),
        ]);
        let report = d.retrieve_report(&ctx("plain question"), 2).await.unwrap();
        assert_eq!(report.chunks.len(), 1);
        assert_eq!(report.chunks[0].id, "r1");
        assert!(matches!(report.calls[0].status, CallStatus::Failed { .. }));
        assert_eq!(report.calls[1].status, CallStatus::Returned { count: 1 });
    }

    #[tokio::test]
    async fn all_empty_or_failed_is_exhausted() {
        let d = dispatcher(vec![
            ScriptedStrategy::new(StrategyKind::Vector, Script::Fail("down")),
            ScriptedStrategy::new(StrategyKind::Relational, Script::Chunks(vec![])),
        ]);
        let err = d.retrieve(&ctx("plain question"), 2).await.unwrap_err();
        assert!(matches!(err, RelayError::DispatchExhausted { attempted: 2 }));
    }

    #[tokio::test]
    async fn no_strategies_is_exhausted() {
        let d = dispatcher(vec![]);
        let err = d.retrieve(&ctx("q"), 2).await.unwrap_err();
        assert!(matches!(err, RelayError::DispatchExhausted { attempted: 0 }));
    }

    #[tokio::test]
    async fn slow_strategy_times_out_without_blocking_others() {
        let config = RetrievalConfig {
            strategy_timeout_secs: 1,
            ..Default::default()
        };
        let d = dispatcher_with(
            vec![
                ScriptedStrategy::new(StrategyKind::Vector, Script::Hang),
                ScriptedStrategy::new(
                    StrategyKind::Relational,
                    Script::Chunks(vec![chunk(StrategyKind::Relational, "r1", "answer passage body", 0.8)]),
                ),
            ],
            config,
        );
        let started = Instant::now();
        let report = d.retrieve_report(&ctx("plain question"), 2).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.calls[0].status, CallStatus::TimedOut);
        assert_eq!(report.chunks.len(), 1);
    }
}
