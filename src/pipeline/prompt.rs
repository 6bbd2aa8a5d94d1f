use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chain::{Step, StepOutcome};
use crate::context::RequestContext;
use crate::error::Result;
use crate::retrieval::KnowledgeChunk;
use crate::streaming::ProgressReporter;

use super::plan::QueryIntent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
    /// Number of chunks rendered into the user prompt.
    pub source_count: usize,
}

/// Turns retrieved chunks and the request into model prompts.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, ctx: &RequestContext, chunks: &[KnowledgeChunk]) -> Result<AssembledPrompt>;
}

/// Numbered sources, recent history, then the question.
#[derive(Debug, Clone)]
pub struct DefaultPromptBuilder {
    pub max_history_turns: usize,
    /// Longer chunks are cut at this many characters.
    pub max_chunk_chars: usize,
}

impl Default for DefaultPromptBuilder {
    fn default() -> Self {
        Self {
            max_history_turns: 6,
            max_chunk_chars: 1500,
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn intent_guidance(intent: QueryIntent) -> &'static str {
    match intent {
        QueryIntent::Reasoning => "Weigh the sources against each other and explain your reasoning.",
        QueryIntent::Structured => "Prefer exact figures and lists taken directly from the sources.",
        QueryIntent::External => "Point out how recent the information in the sources is.",
        QueryIntent::Factual => "Answer directly and briefly.",
        QueryIntent::Semantic | QueryIntent::General => "Answer using the most relevant sources.",
    }
}

impl PromptBuilder for DefaultPromptBuilder {
    fn build(&self, ctx: &RequestContext, chunks: &[KnowledgeChunk]) -> Result<AssembledPrompt> {
        let intent = ctx
            .outputs
            .plan()
            .map(|p| p.intent)
            .unwrap_or(QueryIntent::General);

        let mut system_prompt = format!(
            r#"You are a knowledge assistant. Answer the user's question using only the numbered sources provided.
Cite sources inline as [n]. If the sources do not contain the answer, say that you do not know.
{}"#,
            intent_guidance(intent)
        );
        if let Some(style) = &ctx.preferences.answer_style {
            system_prompt.push_str(&format!("\nAnswer style: {style}."));
        }
        if let Some(language) = &ctx.preferences.language {
            system_prompt.push_str(&format!("\nRespond in {language}."));
        }

        let mut user_prompt = String::new();

        let history = ctx.history();
        if !history.is_empty() {
            user_prompt.push_str("Conversation so far:\n");
            let start = history.len().saturating_sub(self.max_history_turns);
            for turn in &history[start..] {
                user_prompt.push_str(&format!("{}: {}\n", turn.role, turn.content));
            }
            user_prompt.push('\n');
        }

        if chunks.is_empty() {
            user_prompt.push_str("No relevant sources were found.\n\n");
        } else {
            user_prompt.push_str("Sources:\n");
            for (i, chunk) in chunks.iter().enumerate() {
                user_prompt.push_str(&format!(
                    "[{}] ({}, {})\n{}\n\n",
                    i + 1,
                    chunk.kind,
                    chunk.source,
                    truncate_chars(chunk.content.trim(), self.max_chunk_chars)
                ));
            }
        }

        user_prompt.push_str(&format!("Question: {}", ctx.query()));

        Ok(AssembledPrompt {
            system_prompt,
            user_prompt,
            source_count: chunks.len(),
        })
    }
}

/// Renders the prompt from the retrieved chunks.
pub struct AssemblePromptStep {
    builder: Arc<dyn PromptBuilder>,
}

impl AssemblePromptStep {
    pub const NAME: &'static str = "assemble_prompt";

    pub fn new(builder: Arc<dyn PromptBuilder>) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl Step for AssemblePromptStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_skip(&self, ctx: &RequestContext) -> bool {
        ctx.outputs.prompt().is_some()
    }

    fn precondition(&self, ctx: &RequestContext) -> bool {
        ctx.outputs.chunks().is_some()
    }

    async fn execute(
        &self,
        ctx: &mut RequestContext,
        progress: &ProgressReporter,
    ) -> Result<StepOutcome> {
        let chunks = ctx.outputs.chunks().unwrap_or(&[]);
        let prompt = self.builder.build(ctx, chunks)?;
        progress.progress(
            Self::NAME,
            85,
            format!("prompt assembled from {} sources", prompt.source_count),
            None,
        );
        ctx.outputs.set_prompt(prompt)?;
        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ConversationTurn, Role, UserPreferences};
    use crate::retrieval::StrategyKind;
    use crate::retrieval::test_support::chunk;

    #[test]
    fn renders_numbered_sources_and_question() {
        let ctx = RequestContext::builder("s", "u", "What is Tokio?").build().unwrap();
        let chunks = vec![
            chunk(StrategyKind::Vector, "a", "Tokio is an async runtime.", 0.9),
            chunk(StrategyKind::Relational, "b", "It schedules tasks.", 0.7),
        ];
        let p = DefaultPromptBuilder::default().build(&ctx, &chunks).unwrap();
        assert_eq!(p.source_count, 2);
        assert!(p.user_prompt.contains("[1] (vector, test:a)\nTokio is an async runtime."));
        assert!(p.user_prompt.contains("[2] (relational, test:b)"));
        assert!(p.user_prompt.ends_with("Question: What is Tokio?"));
        assert!(p.system_prompt.contains("[n]"));
    }

    #[test]
    fn includes_recent_history_and_preferences() {
        let history: Vec<_> = (0..10)
            .map(|i| ConversationTurn::new(Role::User, format!("turn {i}")))
            .collect();
        let ctx = RequestContext::builder("s", "u", "next?")
            .history(history)
            .preferences(UserPreferences {
                language: Some("German".into()),
                answer_style: Some("concise".into()),
                ..Default::default()
            })
            .build()
            .unwrap();
        let p = DefaultPromptBuilder::default().build(&ctx, &[]).unwrap();
        assert!(!p.user_prompt.contains("turn 3"));
        assert!(p.user_prompt.contains("User: turn 4"));
        assert!(p.user_prompt.contains("No relevant sources were found."));
        assert!(p.system_prompt.contains("Respond in German."));
        assert!(p.system_prompt.contains("Answer style: concise."));
    }

    #[test]
    fn long_chunks_are_cut_on_char_boundaries() {
        assert_eq!(truncate_chars("ééééé", 3), "ééé...");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[tokio::test]
    async fn step_waits_for_chunks_and_writes_once() {
        let step = AssemblePromptStep::new(Arc::new(DefaultPromptBuilder::default()));
        let mut ctx = RequestContext::builder("s", "u", "q").build().unwrap();
        assert!(!step.precondition(&ctx));

        ctx.outputs.set_chunks(vec![]).unwrap();
        assert!(step.precondition(&ctx));
        let outcome = step.execute(&mut ctx, &ProgressReporter::disabled()).await.unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
        assert!(step.can_skip(&ctx));
        assert_eq!(ctx.outputs.prompt().unwrap().source_count, 0);
    }
}
