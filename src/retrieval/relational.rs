//! Relational source backed by SQLite full-text search.
//!
//! Rows are matched with an FTS5 `MATCH` over the query keywords and then
//! scored with the shared [`Similarity`], so relational scores are
//! comparable with vector scores during merge.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::Result;

use super::keywords::extract_keywords;
use super::similarity::Similarity;
use super::{KnowledgeChunk, LastError, Strategy, StrategyKind, fetch_limit};

struct EntryRow {
    id: i64,
    title: String,
    content: String,
    summary: Option<String>,
    tags: String,
    source: String,
    created_at: String,
}

pub struct RelationalStrategy {
    db: Arc<Mutex<Connection>>,
    similarity: Arc<dyn Similarity>,
    last_error: LastError,
}

impl RelationalStrategy {
    pub fn new(db: Arc<Mutex<Connection>>, similarity: Arc<dyn Similarity>) -> Self {
        Self {
            db,
            similarity,
            last_error: LastError::default(),
        }
    }

    /// Insert a knowledge entry.  Returns its row id.
    pub async fn insert_entry(
        &self,
        title: &str,
        content: &str,
        summary: Option<&str>,
        tags: &[&str],
        source: &str,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO knowledge_entries (title, content, summary, tags, source) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![title, content, summary, tags.join(","), source],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn count(&self) -> Result<i64> {
        let db = self.db.lock().await;
        let n = db.query_row("SELECT COUNT(*) FROM knowledge_entries", [], |r| r.get(0))?;
        Ok(n)
    }

    async fn search(&self, fts_query: &str, limit: usize) -> Result<Vec<EntryRow>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT e.id, e.title, e.content, e.summary, e.tags, e.source, e.created_at
             FROM knowledge_entries_fts fts
             JOIN knowledge_entries e ON e.id = fts.rowid
             WHERE knowledge_entries_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![fts_query, limit as i64], |row| {
                Ok(EntryRow {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    summary: row.get(3)?,
                    tags: row.get(4)?,
                    source: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn record_error(&self, err: Option<String>) {
        self.last_error.record(err);
    }

    fn to_chunk(&self, query: &str, row: EntryRow) -> KnowledgeChunk {
        let scored_text = format!("{} {}", row.title, row.content);
        let score = self.similarity.score(query, &scored_text);
        let source = if row.source.is_empty() {
            format!("knowledge_entries/{}", row.id)
        } else {
            row.source
        };

        let mut chunk = KnowledgeChunk::new(
            format!("relational:{}", row.id),
            row.content,
            source,
            StrategyKind::Relational,
        )
        .with_score(score)
        .with_tags(
            row.tags
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>(),
        )
        .with_metadata("title", serde_json::json!(row.title));

        if let Some(summary) = row.summary.filter(|s| !s.is_empty()) {
            chunk = chunk.with_summary(summary);
        }
        if let Some(created) = parse_sqlite_timestamp(&row.created_at) {
            chunk = chunk.with_created_at(created);
        }
        chunk
    }
}

/// Build an FTS5 query OR-ing the quoted keywords.
fn fts_query(query: &str) -> Option<String> {
    let keywords = extract_keywords(query);
    if keywords.is_empty() {
        return None;
    }
    Some(
        keywords
            .iter()
            .map(|k| format!("\"{}\"", k.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn parse_sqlite_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

#[async_trait]
impl Strategy for RelationalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Relational
    }

    fn name(&self) -> &str {
        "sqlite full-text"
    }

    async fn retrieve(&self, query: &str, ctx: &RequestContext) -> Result<Vec<KnowledgeChunk>> {
        let Some(fts) = fts_query(query) else {
            debug!(query_id = ctx.query_id(), "no keywords for relational search");
            return Ok(Vec::new());
        };

        match self.search(&fts, fetch_limit(ctx)).await {
            Ok(rows) => {
                self.record_error(None);
                let chunks: Vec<_> = rows.into_iter().map(|r| self.to_chunk(query, r)).collect();
                debug!(query_id = ctx.query_id(), returned = chunks.len(), "relational retrieval complete");
                Ok(chunks)
            }
            Err(e) => {
                warn!(query_id = ctx.query_id(), err = %e, "relational retrieval failed");
                self.record_error(Some(e.to_string()));
                Ok(Vec::new())
            }
        }
    }

    fn is_available(&self) -> bool {
        match self.db.try_lock() {
            Ok(db) => db
                .query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
                .is_ok(),
            // in use by another retrieval
            Err(_) => true,
        }
    }

    fn health(&self) -> serde_json::Value {
        let last_error = self.last_error.get();
        serde_json::json!({
            "similarity": self.similarity.name(),
            "last_error": last_error,
        })
    }
}
