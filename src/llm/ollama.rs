use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, env_or};
use crate::error::{RelayError, Result};

use super::{GenerateOptions, ModelClient, STREAM_BUFFER};

const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";

/// Model client for a local or remote Ollama instance (`POST /api/chat`).
///
/// Configuration priority (highest -> lowest):
///   1. Environment variables (`OLLAMA_HOST`, `OLLAMA_MODEL`)
///   2. `[llm]` section of `config.toml`
///   3. Built-in defaults
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: usize,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaClient {
    pub fn new(config: &Config) -> Result<Self> {
        let base_url = env_or(&config.llm.ollama_host, "OLLAMA_HOST")
            .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string())
            .trim_end_matches('/')
            .to_string();
        let model = env_or(&config.llm.ollama_model, "OLLAMA_MODEL")
            .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string());

        let timeout_secs = config.llm.timeout_secs;
        let client = Client::builder()
            .timeout(if timeout_secs > 0 {
                Duration::from_secs(timeout_secs)
            } else {
                Duration::from_secs(600)
            })
            .build()
            .map_err(|e| RelayError::Config(format!("failed to create HTTP client: {e}")))?;

        info!(model = %model, base_url = %base_url, timeout_secs, "Ollama client initialized");

        Ok(Self {
            client,
            base_url,
            model,
        })
    }

    fn request<'a>(
        &'a self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
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
            stream,
            options: ChatOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        }
    }

    async fn post(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| RelayError::Llm(format!("Ollama request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "Ollama API error");
            return Err(RelayError::Llm(format!(
                "Ollama API returned {status}: {error_text}"
            )));
        }
        Ok(resp)
    }
}

/// Parse one NDJSON line of a streaming reply.  Returns the content delta
/// and whether the reply is done.
fn parse_stream_line(line: &str) -> Result<(String, bool)> {
    let chunk: ChatResponse = serde_json::from_str(line)
        .map_err(|e| RelayError::Llm(format!("failed to parse Ollama stream line: {e}")))?;
    if let Some(err) = chunk.error {
        return Err(RelayError::Llm(format!("Ollama stream error: {err}")));
    }
    let delta = chunk.message.map(|m| m.content).unwrap_or_default();
    Ok((delta, chunk.done))
}

/// Split complete lines off the front of `buf`, leaving any partial line.
fn drain_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line).trim().to_string();
        if !text.is_empty() {
            lines.push(text);
        }
    }
    lines
}

#[async_trait::async_trait]
impl ModelClient for OllamaClient {
    fn name(&self) -> &str {
        "Ollama"
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String> {
        debug!(model = %self.model, prompt_len = user_prompt.len(), "invoking Ollama API");
        let resp = self
            .post(&self.request(system_prompt, user_prompt, options, false))
            .await?;

        let chat_resp: ChatResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::Llm(format!("failed to parse Ollama response: {e}")))?;

        if let (Some(eval_count), Some(eval_duration)) =
            (chat_resp.eval_count, chat_resp.eval_duration)
        {
            let tok_per_sec = if eval_duration > 0 {
                (eval_count as f64 / eval_duration as f64) * 1_000_000_000.0
            } else {
                0.0
            };
            debug!(
                eval_tokens = eval_count,
                tok_per_sec = format!("{tok_per_sec:.1}"),
                "Ollama usage"
            );
        }

        let response = chat_resp
            .message
            .map(|m| m.content)
            .unwrap_or_default()
            .trim()
            .to_string();

        info!(response_len = response.len(), model = %self.model, "Ollama response received");
        Ok(response)
    }

    async fn generate_streaming(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        debug!(model = %self.model, prompt_len = user_prompt.len(), "streaming from Ollama API");
        let mut resp = self
            .post(&self.request(system_prompt, user_prompt, options, true))
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            loop {
                let bytes = match resp.chunk().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(RelayError::Llm(format!("Ollama stream interrupted: {e}"))))
                            .await;
                        return;
                    }
                };
                buf.extend_from_slice(&bytes);

                for line in drain_lines(&mut buf) {
                    match parse_stream_line(&line) {
                        Ok((delta, done)) => {
                            if !delta.is_empty() && tx.send(Ok(delta)).await.is_err() {
                                debug!("stream reader went away");
                                return;
                            }
                            if done {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}
