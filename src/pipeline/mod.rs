//! The standard question-answering chain: plan, retrieve, assemble the
//! prompt, invoke the model.
//!
//! [`Orchestrator`] wires the four steps to a [`Dispatcher`], a model client
//! and a [`StreamingBus`], and exposes blocking and streaming entry points.

pub mod invoke;
pub mod plan;
pub mod prompt;
pub mod retrieve;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chain::{Chain, ChainContext};
use crate::config::Config;
use crate::context::{ConversationTurn, RequestContext, RetrievalParams, UserPreferences};
use crate::db;
use crate::error::Result;
use crate::llm::{self, GenerateOptions, ModelClient};
use crate::retrieval::api::ApiStrategy;
use crate::retrieval::relational::RelationalStrategy;
use crate::retrieval::similarity::{KeywordSimilarity, Similarity};
use crate::retrieval::vector::VectorStrategy;
use crate::retrieval::{Dispatcher, StrategyRegistry};
use crate::streaming::{EventStream, SessionEmitter, StreamingBus};

pub use invoke::InvokeModelStep;
pub use plan::{PlanDetail, PlanStep, QueryIntent};
pub use prompt::{AssemblePromptStep, AssembledPrompt, DefaultPromptBuilder, PromptBuilder};
pub use retrieve::RetrieveStep;

/// Step names of the standard chain, in execution order.
pub const STANDARD_STEPS: [&str; 4] = [
    PlanStep::NAME,
    RetrieveStep::NAME,
    AssemblePromptStep::NAME,
    InvokeModelStep::NAME,
];

/// A question as callers submit it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    /// Generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    pub user_id: String,
    pub query: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default)]
    pub params: RetrievalParams,
    #[serde(default)]
    pub preferences: UserPreferences,
    #[serde(default)]
    pub debug: bool,
}

impl QueryRequest {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Validate and turn the request into a fresh [`RequestContext`].
    pub fn into_context(self) -> Result<RequestContext> {
        let session_id = self
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        RequestContext::builder(session_id, self.user_id, self.query)
            .history(self.history)
            .params(self.params)
            .preferences(self.preferences)
            .debug(self.debug)
            .build()
    }
}

pub struct Orchestrator {
    chain: Arc<Chain>,
    dispatcher: Arc<Dispatcher>,
    bus: StreamingBus,
}

impl Orchestrator {
    /// Build the standard chain over an existing dispatcher and model.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        model: Arc<dyn ModelClient>,
        prompt_builder: Arc<dyn PromptBuilder>,
        options: GenerateOptions,
        bus: StreamingBus,
        max_retries: u32,
    ) -> Result<Self> {
        let max_strategies = dispatcher.config().max_strategies;
        let steps: Vec<String> = STANDARD_STEPS.iter().map(|s| s.to_string()).collect();

        let chain = Chain::builder()
            .step(Arc::new(PlanStep::new(dispatcher.clone(), max_strategies, steps)))
            .step(Arc::new(RetrieveStep::new(dispatcher.clone(), max_strategies)))
            .step(Arc::new(AssemblePromptStep::new(prompt_builder)))
            .step(Arc::new(InvokeModelStep::new(model, options)))
            .max_retries(max_retries)
            .bus(bus.clone())
            .build()?;

        Ok(Self {
            chain: Arc::new(chain),
            dispatcher,
            bus,
        })
    }

    /// Build every enabled source and the configured model backend.
    ///
    /// `docs_dir` takes precedence over `sources.vector_docs_dir`.
    pub async fn from_config(config: &Config, docs_dir: Option<&Path>) -> Result<Self> {
        let similarity: Arc<dyn Similarity> = Arc::new(KeywordSimilarity);
        let mut registry = StrategyRegistry::new();

        if config.sources.vector_enabled {
            let vector = VectorStrategy::new(similarity.clone());
            let dir = docs_dir.map(Path::to_path_buf).or_else(|| {
                (!config.sources.vector_docs_dir.is_empty())
                    .then(|| PathBuf::from(&config.sources.vector_docs_dir))
            });
            if let Some(dir) = dir {
                match vector.ingest_dir(&dir).await {
                    Ok(n) => info!(dir = %dir.display(), chunks = n, "vector source loaded"),
                    Err(e) => warn!(dir = %dir.display(), "failed to ingest documents: {e}"),
                }
            }
            registry.register(Arc::new(vector));
        }

        if config.sources.relational_enabled {
            let conn = db::open(&config.relational_db_path())?;
            registry.register(Arc::new(RelationalStrategy::new(
                Arc::new(Mutex::new(conn)),
                similarity.clone(),
            )));
        }

        if let Some(base_url) = config.api_base_url() {
            let api = ApiStrategy::new(
                Some(base_url),
                config.api_key(),
                std::time::Duration::from_secs(config.sources.api_timeout_secs),
            )?;
            registry.register(Arc::new(api));
        }

        info!(sources = ?registry.kinds(), "strategy registry initialized");

        let dispatcher = Arc::new(Dispatcher::new(registry, config.retrieval.clone()));
        let model = llm::from_config(config)?;

        Self::new(
            dispatcher,
            model,
            Arc::new(DefaultPromptBuilder::default()),
            GenerateOptions::from_config(config),
            StreamingBus::new(config.streaming.clone()),
            config.chain.max_retry_count,
        )
    }

    pub fn bus(&self) -> &StreamingBus {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn step_names(&self) -> Vec<String> {
        self.chain.step_names()
    }

    /// Run the chain to completion.  Progress still goes to the bus for
    /// anyone attached to the session.
    pub async fn ask(&self, request: QueryRequest) -> Result<ChainContext> {
        let ctx = request.into_context()?;
        Ok(self.chain.execute(ctx).await)
    }

    /// Attach the push consumer for the request's session, then run the
    /// chain in the background.  The emitter sees every event, however fast
    /// the chain finishes.
    pub fn start(
        &self,
        request: QueryRequest,
    ) -> Result<(SessionEmitter, JoinHandle<ChainContext>)> {
        let ctx = request.into_context()?;
        let emitter = self.bus.create_session(ctx.session_id())?;
        Ok((emitter, self.chain.execute_async(ctx)))
    }

    /// Subscribe to the session, then run the chain in the background.
    pub fn ask_streaming(
        &self,
        request: QueryRequest,
    ) -> Result<(EventStream, JoinHandle<ChainContext>)> {
        let ctx = request.into_context()?;
        let session_id = ctx.session_id().to_string();
        self.bus.ensure_session(&session_id);
        let stream = self.bus.subscribe(&session_id)?;
        Ok((stream, self.chain.execute_async(ctx)))
    }
}
