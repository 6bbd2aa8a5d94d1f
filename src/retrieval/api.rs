//! External search API source.
//!
//! Issues `GET {base_url}?q=<query>&limit=<n>` and expects
//! `{"results": [{"id", "title", "content", "url", "score", "tags"}]}`.
//! Missing scores default to 0.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::error::{RelayError, Result};

use super::{KnowledgeChunk, LastError, Strategy, StrategyKind, fetch_limit};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    tags: Vec<String>,
}

pub struct ApiStrategy {
    client: Client,
    base_url: Option<String>,
    api_key: Option<String>,
    last_error: LastError,
}

impl ApiStrategy {
    pub fn new(base_url: Option<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("knowledge-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Config(format!("failed to create HTTP client: {e}")))?;

        let base_url = base_url.map(|u| u.trim_end_matches('/').to_string());
        if let Some(ref url) = base_url {
            info!(base_url = %url, "external API source configured");
        }

        Ok(Self {
            client,
            base_url,
            api_key,
            last_error: LastError::default(),
        })
    }

    async fn search(&self, base_url: &str, query: &str, limit: usize) -> Result<Vec<KnowledgeChunk>> {
        let mut req = self
            .client
            .get(base_url)
            .query(&[("q", query), ("limit", &limit.to_string())]);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Strategy {
                kind: StrategyKind::Api,
                message: format!("search API returned {status}: {body}"),
            });
        }

        let parsed: SearchResponse = resp.json().await?;
        Ok(to_chunks(parsed, base_url))
    }

    fn record_error(&self, err: Option<String>) {
        self.last_error.record(err);
    }
}

fn to_chunks(resp: SearchResponse, base_url: &str) -> Vec<KnowledgeChunk> {
    resp.results
        .into_iter()
        .enumerate()
        .filter(|(_, hit)| !hit.content.trim().is_empty())
        .map(|(i, hit)| {
            let id = hit.id.unwrap_or_else(|| format!("api:{i}"));
            let source = hit.url.unwrap_or_else(|| base_url.to_string());
            let mut chunk = KnowledgeChunk::new(id, hit.content, source, StrategyKind::Api)
                .with_score(hit.score.unwrap_or(0.0))
                .with_tags(hit.tags);
            if let Some(title) = hit.title {
                chunk = chunk.with_summary(title);
            }
            chunk
        })
        .collect()
}

#[async_trait]
impl Strategy for ApiStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Api
    }

    fn name(&self) -> &str {
        "external search API"
    }

    async fn retrieve(&self, query: &str, ctx: &RequestContext) -> Result<Vec<KnowledgeChunk>> {
        let Some(base_url) = self.base_url.as_deref() else {
            return Ok(Vec::new());
        };

        match self.search(base_url, query, fetch_limit(ctx)).await {
            Ok(chunks) => {
                self.record_error(None);
                debug!(query_id = ctx.query_id(), returned = chunks.len(), "API retrieval complete");
                Ok(chunks)
            }
            Err(e) => {
                warn!(query_id = ctx.query_id(), err = %e, "API retrieval failed");
                self.record_error(Some(e.to_string()));
                Ok(Vec::new())
            }
        }
    }

    fn is_available(&self) -> bool {
        self.base_url.is_some()
    }

    fn health(&self) -> serde_json::Value {
        let last_error = self.last_error.get();
        serde_json::json!({
            "base_url": self.base_url,
            "authenticated": self.api_key.is_some(),
            "last_error": last_error,
        })
    }
}
