pub mod ollama;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::error::{RelayError, Result};

pub use ollama::OllamaClient;
pub use openai::OpenAiCompatClient;

/// Tokens buffered between a streaming model call and its reader.
pub const STREAM_BUFFER: usize = 64;

/// Sampling knobs for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl GenerateOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        }
    }
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// -- Client trait -----------------------------------------------------------

/// A chat model.  Implementations own their own timeout.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable name of this backend (e.g. "Ollama").
    fn name(&self) -> &str;

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String>;

    /// Stream the answer as it is produced.  The channel closes when the
    /// answer is complete; an `Err` item ends it early.
    ///
    /// The default delivers the whole completion as one chunk.
    async fn generate_streaming(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let text = self.generate(system_prompt, user_prompt, options).await?;
        let (tx, rx) = mpsc::channel(1);
        // receiver is still in scope, so this cannot fail
        let _ = tx.send(Ok(text)).await;
        Ok(rx)
    }
}

// -- Registry ---------------------------------------------------------------

/// Available model backends keyed by config name.
#[derive(Default)]
pub struct ModelRegistry {
    clients: HashMap<String, Arc<dyn ModelClient>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: &str, client: Arc<dyn ModelClient>) {
        info!(backend = key, name = client.name(), "model backend registered");
        self.clients.insert(key.to_string(), client);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ModelClient>> {
        self.clients.get(key).cloned()
    }

    /// Registered keys, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.clients.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Register every built-in backend that can be configured.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        if let Ok(client) = OllamaClient::new(config) {
            registry.register("ollama", Arc::new(client));
        }
        if let Ok(client) = OpenAiCompatClient::new(config) {
            registry.register("openai", Arc::new(client));
        }
        registry
    }
}

/// The backend selected by `config.llm.backend`, overridable with the
/// `LLM_BACKEND` environment variable.
pub fn from_config(config: &Config) -> Result<Arc<dyn ModelClient>> {
    let backend = std::env::var("LLM_BACKEND")
        .ok()
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| config.llm.backend.clone());
    select(&ModelRegistry::from_config(config), &backend)
}

fn select(registry: &ModelRegistry, backend: &str) -> Result<Arc<dyn ModelClient>> {
    match registry.get(backend) {
        Some(client) => {
            info!(backend, name = client.name(), "model backend selected");
            Ok(client)
        }
        None => Err(RelayError::Config(format!(
            "unknown LLM backend \"{backend}\", available: [{}]",
            registry.list().join(", "),
        ))),
    }
}
