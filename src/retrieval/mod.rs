pub mod api;
pub mod chunker;
pub mod dispatcher;
pub mod keywords;
pub mod merge;
pub mod relational;
pub mod similarity;
pub mod vector;

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::RequestContext;
use crate::error::{RelayError, Result};

pub use dispatcher::Dispatcher;

/// Fetch size used by strategies when the request does not specify one.
pub const DEFAULT_FETCH_LIMIT: usize = 10;

// -- Strategy kinds ----------------------------------------------------------

/// The source kinds a strategy can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Vector,
    Relational,
    Api,
}

impl StrategyKind {
    /// Static fallback priority.
    pub const DEFAULT_ORDER: [StrategyKind; 3] =
        [StrategyKind::Vector, StrategyKind::Relational, StrategyKind::Api];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Vector => "vector",
            StrategyKind::Relational => "relational",
            StrategyKind::Api => "api",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(StrategyKind::Vector),
            "relational" | "sql" => Ok(StrategyKind::Relational),
            "api" | "external" => Ok(StrategyKind::Api),
            other => Err(RelayError::Validation(format!(
                "unknown strategy kind \"{other}\""
            ))),
        }
    }
}

// -- Knowledge chunks --------------------------------------------------------

/// A unit of retrieved knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub content: String,
    /// Source identifier (file path, table row, URL).
    pub source: String,
    pub kind: StrategyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Similarity or quality score.  Always finite; 0 when the source gave none.
    #[serde(default)]
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub retrieved_at: DateTime<Utc>,
}

impl KnowledgeChunk {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        source: impl Into<String>,
        kind: StrategyKind,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            source: source.into(),
            kind,
            summary: None,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            score: 0.0,
            created_at: None,
            retrieved_at: Utc::now(),
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = if score.is_finite() { score } else { 0.0 };
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

// -- Strategy trait ----------------------------------------------------------

/// A source-specific retrieval implementation.
///
/// Implementations contain their own failures: an internal error is logged
/// and turned into an empty result so one broken source never aborts the
/// others.  They are invoked concurrently and must not share mutable state
/// across calls beyond a read-mostly store.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Human-readable name (e.g. "in-memory vector store").
    fn name(&self) -> &str;

    async fn retrieve(&self, query: &str, ctx: &RequestContext) -> Result<Vec<KnowledgeChunk>>;

    /// Cheap liveness probe.  Must not block or panic.
    fn is_available(&self) -> bool;

    fn health(&self) -> serde_json::Value;
}

/// Number of results a strategy should fetch for this request.
pub fn fetch_limit(ctx: &RequestContext) -> usize {
    ctx.params.max_results.unwrap_or(DEFAULT_FETCH_LIMIT).max(1)
}

/// Most recent retrieval failure, for `health`.  Reads share the lock; the
/// write lock is taken only when the recorded value actually changes, so
/// concurrent successful calls never contend.
#[derive(Debug, Default)]
pub(crate) struct LastError(RwLock<Option<String>>);

impl LastError {
    /// Returns whether the stored value changed.
    pub(crate) fn record(&self, err: Option<String>) -> bool {
        {
            let current = self.0.read().unwrap_or_else(|e| e.into_inner());
            if *current == err {
                return false;
            }
        }
        let mut current = self.0.write().unwrap_or_else(|e| e.into_inner());
        if *current == err {
            return false;
        }
        *current = err;
        true
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

// -- Strategy registry -------------------------------------------------------

/// Strategies keyed by kind.  At most one strategy per kind.
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<StrategyKind, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Register a strategy, replacing any previous one of the same kind.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        let kind = strategy.kind();
        info!(kind = %kind, name = strategy.name(), "retrieval strategy registered");
        self.strategies.insert(kind, strategy);
    }

    pub fn get(&self, kind: StrategyKind) -> Option<Arc<dyn Strategy>> {
        self.strategies.get(&kind).cloned()
    }

    /// The strategy for `kind` if registered and currently available.
    pub fn available(&self, kind: StrategyKind) -> Option<Arc<dyn Strategy>> {
        self.strategies
            .get(&kind)
            .filter(|s| s.is_available())
            .cloned()
    }

    /// Registered kinds in default priority order.
    pub fn kinds(&self) -> Vec<StrategyKind> {
        let mut kinds: Vec<_> = self.strategies.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Health of every registered strategy, keyed by kind.
    pub fn health_report(&self) -> serde_json::Value {
        let mut report = serde_json::Map::new();
        for kind in self.kinds() {
            if let Some(s) = self.strategies.get(&kind) {
                report.insert(
                    kind.to_string(),
                    serde_json::json!({
                        "name": s.name(),
                        "available": s.is_available(),
                        "details": s.health(),
                    }),
                );
            }
        }
        serde_json::Value::Object(report)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted strategies shared by dispatcher and pipeline tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub enum Script {
        Chunks(Vec<KnowledgeChunk>),
        Fail(&'static str),
        Hang,
    }

    pub struct ScriptedStrategy {
        pub kind: StrategyKind,
        pub available: bool,
        pub script: Script,
        pub calls: AtomicUsize,
    }

    impl ScriptedStrategy {
        pub fn new(kind: StrategyKind, script: Script) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: true,
                script,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn unavailable(kind: StrategyKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: false,
                script: Script::Chunks(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Strategy for ScriptedStrategy {
        fn kind(&self) -> StrategyKind {
            self.kind
        }
        fn name(&self) -> &str {
            "scripted"
        }
        async fn retrieve(&self, _query: &str, _ctx: &RequestContext) -> Result<Vec<KnowledgeChunk>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Chunks(c) => Ok(c.clone()),
                Script::Fail(msg) => Err(RelayError::Strategy {
                    kind: self.kind,
                    message: msg.to_string(),
                }),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
            }
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn health(&self) -> serde_json::Value {
            serde_json::json!({ "scripted": true })
        }
    }

    pub fn chunk(kind: StrategyKind, id: &str, content: &str, score: f32) -> KnowledgeChunk {
        KnowledgeChunk::new(id, content, format!("test:{id}"), kind).with_score(score)
    }
}
