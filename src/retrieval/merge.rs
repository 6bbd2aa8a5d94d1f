//! Merging of results fanned in from several strategies.
//!
//! The pipeline is: deduplicate by a content-derived key (keeping the
//! higher score), rank by score with a keyword bonus as tie-breaker,
//! truncate to `max_results`, then apply the quality filter.  The filter runs
//! last, so a low-quality chunk still takes a slot and the result can hold
//! fewer than `max_results` chunks.  Output is fully deterministic, so
//! merging an already-merged set returns it unchanged.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use crate::config::RetrievalConfig;
use crate::context::RequestContext;

use super::KnowledgeChunk;
use super::keywords::{extract_keywords, normalize_prefix, overlap};

/// Bonus per query keyword found in a chunk's summary.
const SUMMARY_WEIGHT: f32 = 0.1;
/// Bonus per query keyword found in a chunk's tags.
const TAG_WEIGHT: f32 = 0.2;

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub max_results: usize,
    pub similarity_threshold: f32,
    pub min_content_length: usize,
    pub dedup_prefix_len: usize,
}

impl MergeOptions {
    /// Configuration defaults overridden by the request's own parameters.
    pub fn for_request(config: &RetrievalConfig, ctx: &RequestContext) -> Self {
        Self {
            max_results: ctx.params.max_results.unwrap_or(config.max_results),
            similarity_threshold: ctx
                .params
                .similarity_threshold
                .unwrap_or(config.similarity_threshold),
            min_content_length: config.min_content_length,
            dedup_prefix_len: config.dedup_prefix_len,
        }
    }
}

impl Default for MergeOptions {
    fn default() -> Self {
        let config = RetrievalConfig::default();
        Self {
            max_results: config.max_results,
            similarity_threshold: config.similarity_threshold,
            min_content_length: config.min_content_length,
            dedup_prefix_len: config.dedup_prefix_len,
        }
    }
}

/// Key under which two chunks are considered the same piece of knowledge.
///
/// Normalized leading content; chunks without usable content fall back to
/// their id.
pub fn dedup_key(chunk: &KnowledgeChunk, prefix_len: usize) -> String {
    let prefix = normalize_prefix(&chunk.content, prefix_len);
    if prefix.is_empty() {
        format!("id:{}", chunk.id)
    } else {
        prefix
    }
}

/// Tie-break bonus from summary and tag overlap with the query keywords.
/// Tag hits weigh more than summary hits.
pub fn keyword_bonus(chunk: &KnowledgeChunk, keywords: &BTreeSet<String>) -> f32 {
    let summary_hits = chunk
        .summary
        .as_deref()
        .map(|s| overlap(keywords, s))
        .unwrap_or(0);
    let tag_hits = if chunk.tags.is_empty() {
        0
    } else {
        overlap(keywords, &chunk.tags.join(" "))
    };
    summary_hits as f32 * SUMMARY_WEIGHT + tag_hits as f32 * TAG_WEIGHT
}

/// Keep one chunk per dedup key: the higher-scored one, or the first seen
/// on equal scores.  Preserves first-occurrence order.
pub fn dedup(chunks: Vec<KnowledgeChunk>, prefix_len: usize) -> Vec<KnowledgeChunk> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<KnowledgeChunk> = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        let key = dedup_key(&chunk, prefix_len);
        match index.get(&key) {
            Some(&i) => {
                if chunk.score > kept[i].score {
                    kept[i] = chunk;
                }
            }
            None => {
                index.insert(key, kept.len());
                kept.push(chunk);
            }
        }
    }
    kept
}

fn rank_order(a: &(KnowledgeChunk, f32), b: &(KnowledgeChunk, f32)) -> Ordering {
    b.0.score
        .total_cmp(&a.0.score)
        .then_with(|| b.1.total_cmp(&a.1))
        .then_with(|| a.0.id.cmp(&b.0.id))
        .then_with(|| a.0.content.cmp(&b.0.content))
}

/// Deduplicate, rank, truncate and filter.
pub fn merge_chunks(
    chunks: Vec<KnowledgeChunk>,
    query: &str,
    opts: &MergeOptions,
) -> Vec<KnowledgeChunk> {
    let keywords = extract_keywords(query);

    let mut ranked: Vec<(KnowledgeChunk, f32)> = dedup(chunks, opts.dedup_prefix_len)
        .into_iter()
        .map(|mut c| {
            let bonus = keyword_bonus(&c, &keywords);
            if bonus > 0.0 {
                c.metadata
                    .insert("keyword_bonus".into(), serde_json::json!(bonus));
            }
            (c, bonus)
        })
        .collect();
    ranked.sort_by(rank_order);

    ranked
        .into_iter()
        .map(|(c, _)| c)
        .take(opts.max_results)
        .filter(|c| c.score >= opts.similarity_threshold)
        .filter(|c| c.content.trim().chars().count() >= opts.min_content_length)
        .collect()
}
