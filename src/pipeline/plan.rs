//! Query planning: intent classification and the [`PlanDetail`] that the
//! later steps read.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{Step, StepOutcome};
use crate::config::RetrievalConfig;
use crate::context::RequestContext;
use crate::error::Result;
use crate::retrieval::{Dispatcher, StrategyKind};
use crate::streaming::ProgressReporter;

/// Coarse classification of what the user is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    Semantic,
    Structured,
    External,
    Reasoning,
    Factual,
    General,
}

const EXTERNAL_TERMS: &[&str] = &["latest", "news", "realtime", "today", "external", "current"];
const STRUCTURED_TERMS: &[&str] = &["exact", "list", "count", "structured"];
const SEMANTIC_TERMS: &[&str] = &["similar", "like", "semantic", "related"];
const REASONING_TERMS: &[&str] = &["compare", "why", "explain", "difference", "versus", "vs"];
const FACTUAL_TERMS: &[&str] = &["who", "when", "define"];

impl QueryIntent {
    /// Classify by keyword.  The first matching family wins, checked in the
    /// order external, structured, semantic, reasoning, factual.
    pub fn classify(query: &str) -> Self {
        let lower = query.to_lowercase();
        let words: BTreeSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let any = |terms: &[&str]| terms.iter().any(|t| words.contains(t));

        if any(EXTERNAL_TERMS) {
            QueryIntent::External
        } else if any(STRUCTURED_TERMS) || lower.contains("how many") {
            QueryIntent::Structured
        } else if any(SEMANTIC_TERMS) {
            QueryIntent::Semantic
        } else if any(REASONING_TERMS) {
            QueryIntent::Reasoning
        } else if any(FACTUAL_TERMS) || lower.contains("what is") {
            QueryIntent::Factual
        } else {
            QueryIntent::General
        }
    }

    /// Sources this intent maps to, most suitable first.  Empty for
    /// [`QueryIntent::General`], which defers to the default order.
    pub fn preferred_kinds(&self) -> &'static [StrategyKind] {
        match self {
            QueryIntent::Semantic => &[StrategyKind::Vector],
            QueryIntent::Structured => &[StrategyKind::Relational],
            QueryIntent::External => &[StrategyKind::Api],
            QueryIntent::Reasoning => &[StrategyKind::Vector, StrategyKind::Relational],
            QueryIntent::Factual => &[StrategyKind::Relational, StrategyKind::Vector],
            QueryIntent::General => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::Semantic => "semantic",
            QueryIntent::Structured => "structured",
            QueryIntent::External => "external",
            QueryIntent::Reasoning => "reasoning",
            QueryIntent::Factual => "factual",
            QueryIntent::General => "general",
        }
    }
}

impl std::fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// The execution plan for one request.  Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDetail {
    pub intent: QueryIntent,
    /// Selected sources, in fan-out order.
    pub strategies: Vec<StrategyKind>,
    pub max_results: usize,
    pub similarity_threshold: f32,
    /// Names of the steps expected to run.
    pub steps: Vec<String>,
    pub priority: Priority,
    pub estimated_duration_ms: u64,
}

const BASE_ESTIMATE_MS: u64 = 500;
const PER_STRATEGY_MS: u64 = 800;
const MODEL_ESTIMATE_MS: u64 = 3_000;

impl PlanDetail {
    pub fn build(
        ctx: &RequestContext,
        intent: QueryIntent,
        strategies: Vec<StrategyKind>,
        config: &RetrievalConfig,
        steps: Vec<String>,
    ) -> Self {
        let priority = match intent {
            QueryIntent::External => Priority::High,
            QueryIntent::General => Priority::Low,
            _ => Priority::Normal,
        };
        let mut estimate = BASE_ESTIMATE_MS + PER_STRATEGY_MS * strategies.len() as u64;
        estimate += MODEL_ESTIMATE_MS;
        if intent == QueryIntent::Reasoning {
            estimate += MODEL_ESTIMATE_MS;
        }

        Self {
            intent,
            strategies,
            max_results: ctx.params.max_results.unwrap_or(config.max_results),
            similarity_threshold: ctx
                .params
                .similarity_threshold
                .unwrap_or(config.similarity_threshold),
            steps,
            priority,
            estimated_duration_ms: estimate,
        }
    }
}

/// Classifies the query and records the [`PlanDetail`].
pub struct PlanStep {
    dispatcher: Arc<Dispatcher>,
    max_strategies: usize,
    steps: Vec<String>,
}

impl PlanStep {
    pub const NAME: &'static str = "plan";

    pub fn new(dispatcher: Arc<Dispatcher>, max_strategies: usize, steps: Vec<String>) -> Self {
        Self {
            dispatcher,
            max_strategies,
            steps,
        }
    }
}

#[async_trait]
impl Step for PlanStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_skip(&self, ctx: &RequestContext) -> bool {
        ctx.outputs.plan().is_some()
    }

    async fn execute(
        &self,
        ctx: &mut RequestContext,
        progress: &ProgressReporter,
    ) -> Result<StepOutcome> {
        let intent = QueryIntent::classify(ctx.query());
        let strategies: Vec<StrategyKind> = self
            .dispatcher
            .select_multiple(ctx, self.max_strategies)
            .iter()
            .map(|s| s.kind())
            .collect();

        let plan = PlanDetail::build(
            ctx,
            intent,
            strategies,
            self.dispatcher.config(),
            self.steps.clone(),
        );
        debug!(
            query_id = ctx.query_id(),
            intent = %plan.intent,
            strategies = ?plan.strategies,
            "query planned"
        );
        progress.progress(
            Self::NAME,
            10,
            format!("planned {} query", plan.intent),
            serde_json::to_value(&plan).ok(),
        );
        ctx.outputs.set_plan(plan)?;
        Ok(StepOutcome::Continue)
    }
}
