//! In-memory vector source.
//!
//! Documents are chunked on ingest and scored against the query with the
//! configured [`Similarity`] at retrieval time.  The store is read-mostly:
//! retrievals take a shared read lock and never mutate it.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::error::Result;

use super::chunker;
use super::similarity::Similarity;
use super::{KnowledgeChunk, Strategy, StrategyKind, fetch_limit};

#[derive(Debug, Clone)]
struct VectorDocument {
    id: String,
    content: String,
    source: String,
    heading: Option<String>,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
}

pub struct VectorStrategy {
    docs: RwLock<Vec<VectorDocument>>,
    doc_count: AtomicUsize,
    similarity: Arc<dyn Similarity>,
}

impl VectorStrategy {
    pub fn new(similarity: Arc<dyn Similarity>) -> Self {
        Self {
            docs: RwLock::new(Vec::new()),
            doc_count: AtomicUsize::new(0),
            similarity,
        }
    }

    /// Chunk `text` and add every chunk to the store.
    ///
    /// Returns the number of chunks stored.
    pub async fn ingest_text(&self, source: &str, text: &str, tags: &[String]) -> usize {
        let chunks = chunker::chunk_text(text);
        self.store_chunks(source, chunks, tags).await
    }

    /// Ingest every markdown/text file directly under `dir`.
    ///
    /// Unreadable files are skipped with a warning.  Returns the total
    /// number of chunks stored.
    pub async fn ingest_dir(&self, dir: &Path) -> Result<usize> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && chunker::is_ingestible(p))
            .collect();
        entries.sort();

        let mut total = 0;
        for path in entries {
            match chunker::chunk_file(&path) {
                Ok((chunks, kind)) => {
                    let tags = vec![kind.to_string()];
                    total += self
                        .store_chunks(&path.display().to_string(), chunks, &tags)
                        .await;
                }
                Err(e) => warn!(path = %path.display(), err = %e, "skipping unreadable document"),
            }
        }

        info!(dir = %dir.display(), chunks = total, "vector documents ingested");
        Ok(total)
    }

    async fn store_chunks(&self, source: &str, chunks: Vec<chunker::Chunk>, tags: &[String]) -> usize {
        if chunks.is_empty() {
            return 0;
        }
        let count = chunks.len();
        let now = Utc::now();

        let mut docs = self.docs.write().await;
        docs.extend(chunks.into_iter().map(|c| VectorDocument {
            id: format!("{source}#{}", c.index),
            content: c.text,
            source: source.to_string(),
            heading: c.heading,
            tags: tags.to_vec(),
            created_at: now,
        }));
        self.doc_count.store(docs.len(), Ordering::Release);

        debug!(source = %source, count, "vector chunks stored");
        count
    }

    pub fn len(&self) -> usize {
        self.doc_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Strategy for VectorStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Vector
    }

    fn name(&self) -> &str {
        "in-memory vector store"
    }

    async fn retrieve(&self, query: &str, ctx: &RequestContext) -> Result<Vec<KnowledgeChunk>> {
        let limit = fetch_limit(ctx);
        let docs = self.docs.read().await;

        let mut scored: Vec<(f32, &VectorDocument)> = docs
            .iter()
            .map(|d| (self.similarity.score(query, &d.content), d))
            .filter(|(score, _)| score.is_finite() && *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.truncate(limit);

        let chunks: Vec<KnowledgeChunk> = scored
            .into_iter()
            .map(|(score, d)| {
                let chunk = KnowledgeChunk::new(&d.id, &d.content, &d.source, StrategyKind::Vector)
                    .with_score(score)
                    .with_tags(d.tags.iter().cloned())
                    .with_created_at(d.created_at);
                match &d.heading {
                    Some(h) => chunk.with_summary(h),
                    None => chunk,
                }
            })
            .collect();

        debug!(
            query_id = ctx.query_id(),
            candidates = docs.len(),
            returned = chunks.len(),
            "vector retrieval complete"
        );
        Ok(chunks)
    }

    fn is_available(&self) -> bool {
        !self.is_empty()
    }

    fn health(&self) -> serde_json::Value {
        serde_json::json!({
            "documents": self.len(),
            "similarity": self.similarity.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::similarity::KeywordSimilarity;

    fn strategy() -> VectorStrategy {
        VectorStrategy::new(Arc::new(KeywordSimilarity))
    }

    fn ctx(query: &str) -> RequestContext {
        RequestContext::builder("s", "u", query).build().unwrap()
    }

    #[tokio::test]
    async fn empty_store_is_unavailable() {
        let s = strategy();
        assert!(!s.is_available());
        assert_eq!(s.health()["documents"], 0);
    }

    #[tokio::test]
    async fn retrieve_ranks_by_similarity() {
        let s = strategy();
        s.ingest_text("a.md", "Tokio is an async runtime for Rust.", &[]).await;
        s.ingest_text("b.md", "Rust ownership rules prevent data races.", &[]).await;
        s.ingest_text("c.md", "Baking bread needs flour and water.", &[]).await;
        assert!(s.is_available());
        assert_eq!(s.len(), 3);

        let q = "rust async runtime";
        let chunks = s.retrieve(q, &ctx(q)).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].source, "a.md");
        assert!(chunks[0].score > chunks[1].score);
        assert!(chunks.iter().all(|c| c.kind == StrategyKind::Vector));
    }

    #[tokio::test]
    async fn retrieve_honours_fetch_limit() {
        let s = strategy();
        for i in 0..5 {
            s.ingest_text(&format!("{i}.md"), "shared keyword passage", &[]).await;
        }
        let ctx = RequestContext::builder("s", "u", "keyword")
            .params(crate::context::RetrievalParams {
                max_results: Some(2),
                ..Default::default()
            })
            .build()
            .unwrap();
        assert_eq!(s.retrieve("keyword", &ctx).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ingest_dir_skips_non_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("guide.md"), "# Guide\n\nInstall the tool.").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "Remember the config file.").unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();

        let s = strategy();
        let n = s.ingest_dir(dir.path()).await.unwrap();
        assert_eq!(n, 2);

        let chunks = s.retrieve("install tool", &ctx("install tool")).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].tags, vec!["markdown".to_string()]);
        assert_eq!(chunks[0].summary.as_deref(), Some("Guide"));
    }
}
