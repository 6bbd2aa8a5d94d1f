use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::{Step, StepOutcome};
use crate::context::{ConversationTurn, RequestContext, Role};
use crate::error::{RelayError, Result};
use crate::llm::{GenerateOptions, ModelClient};
use crate::streaming::ProgressReporter;

/// Streams the model answer, forwarding each token as a `data` event.
pub struct InvokeModelStep {
    client: Arc<dyn ModelClient>,
    options: GenerateOptions,
}

impl InvokeModelStep {
    pub const NAME: &'static str = "invoke_model";

    pub fn new(client: Arc<dyn ModelClient>, options: GenerateOptions) -> Self {
        Self { client, options }
    }
}

#[async_trait]
impl Step for InvokeModelStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_skip(&self, ctx: &RequestContext) -> bool {
        ctx.outputs.response().is_some()
    }

    fn precondition(&self, ctx: &RequestContext) -> bool {
        ctx.outputs.prompt().is_some()
    }

    async fn execute(
        &self,
        ctx: &mut RequestContext,
        progress: &ProgressReporter,
    ) -> Result<StepOutcome> {
        let prompt = ctx
            .outputs
            .prompt()
            .cloned()
            .ok_or_else(|| RelayError::Step {
                step: Self::NAME.into(),
                message: "no assembled prompt".into(),
            })?;

        progress.progress(Self::NAME, 90, format!("asking {}", self.client.name()), None);
        let mut rx = self
            .client
            .generate_streaming(&prompt.system_prompt, &prompt.user_prompt, &self.options)
            .await?;

        let mut response = String::new();
        let mut tokens = 0usize;
        while let Some(item) = rx.recv().await {
            let token = item?;
            progress.data(Self::NAME, serde_json::json!({ "token": token }));
            response.push_str(&token);
            tokens += 1;
        }

        let response = response.trim().to_string();
        debug!(query_id = ctx.query_id(), tokens, response_len = response.len(), "model answered");
        if response.is_empty() {
            return Ok(StepOutcome::Failed("model returned an empty response".into()));
        }

        let query = ctx.query().to_string();
        ctx.push_turn(ConversationTurn::new(Role::User, query));
        ctx.push_turn(ConversationTurn::new(Role::Assistant, response.clone()));
        ctx.outputs.set_response(response)?;
        Ok(StepOutcome::Continue)
    }
}
