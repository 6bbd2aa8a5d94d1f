//! Document chunking for the vector source.
//!
//! Text is cut into segments (paragraphs, and for markdown also at every
//! heading), then segments are packed into chunks of roughly
//! `target_chars` characters.  Consecutive chunks share a word-aligned
//! overlap so a passage split across a boundary is still findable.
//! Markdown chunks remember the heading they fall under.

use std::path::Path;

use crate::error::Result;

const TARGET_CHUNK_CHARS: usize = 1024;
const OVERLAP_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    Markdown,
    Code,
    Text,
}

impl DocKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "md" | "mdx" | "markdown" => DocKind::Markdown,
            "rs" | "py" | "js" | "ts" | "go" | "c" | "cpp" | "h" | "java" | "rb" | "sh"
            | "toml" | "yaml" | "yml" | "json" | "sql" => DocKind::Code,
            _ => DocKind::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Markdown => "markdown",
            DocKind::Code => "code",
            DocKind::Text => "text",
        }
    }
}

impl std::fmt::Display for DocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    /// Position within the source document.
    pub index: usize,
    /// Nearest markdown heading above the chunk's first segment.
    pub heading: Option<String>,
}

/// Only prose is ingested; code is left to other tools.
pub fn is_ingestible(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(ext.as_deref(), Some("md" | "mdx" | "markdown" | "txt" | "rst"))
}

pub fn chunk_file(path: &Path) -> Result<(Vec<Chunk>, DocKind)> {
    let kind = DocKind::from_path(path);
    let text = std::fs::read_to_string(path)?;
    Ok((Chunker::default().split(&text, kind), kind))
}

/// Chunk plain text with the default sizes.
pub fn chunk_text(text: &str) -> Vec<Chunk> {
    Chunker::default().split(text, DocKind::Text)
}

#[derive(Debug, Clone)]
pub struct Chunker {
    pub target_chars: usize,
    pub overlap_chars: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            target_chars: TARGET_CHUNK_CHARS,
            overlap_chars: OVERLAP_CHARS,
        }
    }
}

struct Segment<'a> {
    text: &'a str,
    heading: Option<&'a str>,
}

impl Chunker {
    pub fn split(&self, text: &str, kind: DocKind) -> Vec<Chunk> {
        let segments = segments(text, kind);
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;
        let mut heading: Option<&str> = None;

        for seg in segments {
            let seg_len = seg.text.chars().count();
            if current_len > 0 && current_len + 2 + seg_len > self.target_chars {
                let tail = overlap_tail(&current, self.overlap_chars);
                chunks.push(Chunk {
                    text: std::mem::take(&mut current),
                    index: chunks.len(),
                    heading: heading.map(str::to_string),
                });
                current_len = tail.chars().count();
                current = tail;
                heading = None;
            }

            if heading.is_none() {
                heading = seg.heading;
            }
            if current_len > 0 {
                current.push_str("\n\n");
                current_len += 2;
            }
            current.push_str(seg.text);
            current_len += seg_len;
        }

        if !current.trim().is_empty() {
            chunks.push(Chunk {
                text: current,
                index: chunks.len(),
                heading: heading.map(str::to_string),
            });
        }
        chunks
    }
}

fn heading_text(line: &str) -> Option<&str> {
    let rest = line.trim_start_matches('#');
    if rest.len() < line.len() && rest.starts_with(' ') {
        Some(rest.trim())
    } else {
        None
    }
}

/// Paragraphs, with markdown headings also starting a new segment.
fn segments(text: &str, kind: DocKind) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut heading: Option<&str> = None;

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if kind != DocKind::Markdown {
            out.push(Segment { text: para, heading: None });
            continue;
        }

        // a paragraph may hold a heading line followed by body lines
        let mut start = 0;
        for (offset, line) in line_offsets(para) {
            if let Some(h) = heading_text(line) {
                let before = para[start..offset].trim();
                if !before.is_empty() {
                    out.push(Segment { text: before, heading });
                }
                heading = Some(h);
                start = offset;
            }
        }
        let rest = para[start..].trim();
        if !rest.is_empty() {
            out.push(Segment { text: rest, heading });
        }
    }
    out
}

fn line_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split('\n').map(move |line| {
        let at = offset;
        offset += line.len() + 1;
        (at, line)
    })
}

/// The last `max_chars` characters of `text`, starting after a space when
/// one is available.
fn overlap_tail(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let start = text
        .char_indices()
        .nth(total - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail = &text[start..];
    match tail.find(' ') {
        Some(pos) if pos + 1 < tail.len() => tail[pos + 1..].to_string(),
        _ => tail.to_string(),
    }
}
