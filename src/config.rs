use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{RelayError, Result};
use crate::retrieval::StrategyKind;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub sources: SourcesConfig,
}

// -- Chain -------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Number of whole-chain retries after the first failed attempt.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
        }
    }
}

// -- Retrieval ---------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum chunks handed to prompt assembly.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Chunks scoring below this are dropped by the quality filter.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Upper bound on strategies fanned out per request.
    #[serde(default = "default_max_strategies")]
    pub max_strategies: usize,

    /// Per-strategy timeout in seconds.
    #[serde(default = "default_strategy_timeout_secs")]
    pub strategy_timeout_secs: u64,

    /// Chunks with fewer content characters than this are dropped.
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,

    /// Number of normalized leading characters used as the dedup key.
    #[serde(default = "default_dedup_prefix_len")]
    pub dedup_prefix_len: usize,

    /// Fallback priority order when nothing else selects a strategy.
    #[serde(default = "default_order")]
    pub default_order: Vec<StrategyKind>,

    /// Per-user preferred sources, keyed by user id.
    /// e.g. { "alice" = ["relational", "vector"] }
    #[serde(default)]
    pub user_preferences: HashMap<String, Vec<StrategyKind>>,
}

impl RetrievalConfig {
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_secs(self.strategy_timeout_secs)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            similarity_threshold: default_similarity_threshold(),
            max_strategies: default_max_strategies(),
            strategy_timeout_secs: default_strategy_timeout_secs(),
            min_content_length: default_min_content_length(),
            dedup_prefix_len: default_dedup_prefix_len(),
            default_order: default_order(),
            user_preferences: HashMap::new(),
        }
    }
}

// -- Streaming ---------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Hard lifetime of a session before it is reaped.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Per-session broadcast buffer.  Slow consumers past this lag and lose
    /// events instead of blocking the producer.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Recent events replayed to consumers that attach late.
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
}

impl StreamingConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            buffer_capacity: default_buffer_capacity(),
            replay_capacity: default_replay_capacity(),
        }
    }
}

// -- LLM ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Backend to use: "ollama" (default) or "openai".
    /// Can be overridden with the `LLM_BACKEND` env var.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Ollama API base URL (default: "http://localhost:11434").
    /// Can be overridden with `OLLAMA_HOST` env var.
    #[serde(default)]
    pub ollama_host: String,

    /// Ollama model tag (e.g. "llama3.1:8b").
    /// Can be overridden with `OLLAMA_MODEL` env var.
    #[serde(default)]
    pub ollama_model: String,

    /// Base URL of an OpenAI-compatible API.
    /// Can be overridden with `OPENAI_BASE_URL` env var.
    #[serde(default)]
    pub openai_base_url: String,

    /// Can be overridden with `OPENAI_MODEL` env var.
    #[serde(default)]
    pub openai_model: String,

    /// Can be overridden with `OPENAI_API_KEY` env var.
    #[serde(default)]
    pub openai_api_key: String,

    /// Request timeout in seconds (0 = client default).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            ollama_host: String::new(),
            ollama_model: String::new(),
            openai_base_url: String::new(),
            openai_model: String::new(),
            openai_api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

// -- Sources -----------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_true")]
    pub vector_enabled: bool,

    /// Directory of text/markdown files ingested into the vector source at
    /// startup.  Empty = start with an empty store.
    #[serde(default)]
    pub vector_docs_dir: String,

    #[serde(default = "default_true")]
    pub relational_enabled: bool,

    /// SQLite database path.  Empty = `<data_dir>/knowledge.db`.
    #[serde(default)]
    pub relational_db_path: String,

    /// External search API base URL.  Empty disables the API source.
    /// Can be overridden with `KNOWLEDGE_API_URL` env var.
    #[serde(default)]
    pub api_base_url: String,

    /// Can be overridden with `KNOWLEDGE_API_KEY` env var.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            vector_enabled: true,
            vector_docs_dir: String::new(),
            relational_enabled: true,
            relational_db_path: String::new(),
            api_base_url: String::new(),
            api_key: String::new(),
            api_timeout_secs: default_api_timeout_secs(),
        }
    }
}

fn default_max_retry_count() -> u32 {
    3
}
fn default_max_results() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.5
}
fn default_max_strategies() -> usize {
    2
}
fn default_strategy_timeout_secs() -> u64 {
    10
}
fn default_min_content_length() -> usize {
    10
}
fn default_dedup_prefix_len() -> usize {
    100
}
fn default_order() -> Vec<StrategyKind> {
    StrategyKind::DEFAULT_ORDER.to_vec()
}
fn default_session_timeout_secs() -> u64 {
    30 * 60
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_buffer_capacity() -> usize {
    256
}
fn default_replay_capacity() -> usize {
    50
}
fn default_backend() -> String {
    "ollama".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> usize {
    1024
}
fn default_true() -> bool {
    true
}
fn default_api_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path(),
        };

        let config = if config_path.exists() {
            info!("loading config from {}", config_path.display());
            let contents = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&contents)?
        } else {
            info!("no config file found, using defaults");
            Config::default()
        };

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| RelayError::Config(format!("parse error: {e}")))
    }

    /// Returns the default config file path: `$XDG_CONFIG_HOME/knowledge-relay/config.toml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("knowledge-relay")
            .join("config.toml")
    }

    /// Returns the data directory: `$XDG_DATA_HOME/knowledge-relay/`
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("knowledge-relay")
    }

    /// Resolved SQLite path for the relational source.
    pub fn relational_db_path(&self) -> PathBuf {
        if self.sources.relational_db_path.is_empty() {
            Self::data_dir().join("knowledge.db")
        } else {
            PathBuf::from(&self.sources.relational_db_path)
        }
    }

    /// External API base URL, `KNOWLEDGE_API_URL` taking precedence.
    pub fn api_base_url(&self) -> Option<String> {
        env_or(&self.sources.api_base_url, "KNOWLEDGE_API_URL")
    }

    pub fn api_key(&self) -> Option<String> {
        env_or(&self.sources.api_key, "KNOWLEDGE_API_KEY")
    }

    /// Generate the default config file contents.
    pub fn default_config_contents() -> &'static str {
        include_str!("../config.example.toml")
    }
}

/// Environment variable if set and non-empty, else the config value if
/// non-empty.
pub(crate) fn env_or(configured: &str, var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| {
            if configured.is_empty() {
                None
            } else {
                Some(configured.to_string())
            }
        })
}
