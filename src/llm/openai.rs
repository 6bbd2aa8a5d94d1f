use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, env_or};
use crate::error::{RelayError, Result};

use super::{GenerateOptions, ModelClient};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Model client for any OpenAI-compatible chat completions endpoint.
///
/// Configuration priority (highest -> lowest):
///   1. Environment variables (`OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_MODEL`)
///   2. `[llm]` section of `config.toml`
///   3. Built-in defaults
pub struct OpenAiCompatClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl OpenAiCompatClient {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = env_or(&config.llm.openai_api_key, "OPENAI_API_KEY").ok_or_else(|| {
            RelayError::Config(
                "OpenAI API key required: set OPENAI_API_KEY env var \
                 or openai_api_key in config"
                    .into(),
            )
        })?;
        let base_url = env_or(&config.llm.openai_base_url, "OPENAI_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let model = env_or(&config.llm.openai_model, "OPENAI_MODEL")
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let timeout_secs = config.llm.timeout_secs;
        let client = Client::builder()
            .timeout(if timeout_secs > 0 {
                Duration::from_secs(timeout_secs)
            } else {
                Duration::from_secs(300)
            })
            .build()
            .map_err(|e| RelayError::Config(format!("failed to create HTTP client: {e}")))?;

        info!(model = %model, base_url = %base_url, timeout_secs, "OpenAI-compatible client initialized");

        Ok(Self {
            client,
            api_key,
            base_url,
            model,
        })
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .map(|e| e.message)
        .unwrap_or_else(|| body.to_string())
}

fn first_choice(resp: ChatResponse) -> String {
    resp.choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[async_trait::async_trait]
impl ModelClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        "OpenAI-compatible API"
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        debug!(model = %self.model, prompt_len = user_prompt.len(), "invoking chat completions API");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Llm(format!("chat completions request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let error_msg = error_message(&resp.text().await.unwrap_or_default());
            warn!(status = %status, error = %error_msg, "chat completions API error");
            return Err(RelayError::Llm(format!(
                "chat completions API returned {status}: {error_msg}"
            )));
        }

        let chat_resp: ChatResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::Llm(format!("failed to parse chat completions response: {e}")))?;

        if let Some(ref usage) = chat_resp.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "chat completions usage"
            );
        }

        let response = first_choice(chat_resp);
        info!(response_len = response.len(), model = %self.model, "chat completion received");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_api_error_message() {
        assert_eq!(
            error_message(r#"{"error":{"message":"invalid key"}}"#),
            "invalid key"
        );
        assert_eq!(error_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn takes_first_choice_trimmed() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"  answer \n"}}],"usage":{"prompt_tokens":3}}"#,
        )
        .unwrap();
        assert_eq!(first_choice(resp), "answer");

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert_eq!(first_choice(empty), "");
    }

    #[test]
    fn requires_api_key() {
        // a key in the environment would satisfy the first check
        if std::env::var("OPENAI_API_KEY").is_ok() {
            return;
        }
        assert!(OpenAiCompatClient::new(&Config::default()).is_err());

        let mut config = Config::default();
        config.llm.openai_api_key = "sk-test".into();
        assert!(OpenAiCompatClient::new(&config).is_ok());
    }
}
