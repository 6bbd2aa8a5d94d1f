//! Federated knowledge retrieval for LLM question answering.
//!
//! A request flows through a retryable [`chain::Chain`] of steps.  Retrieval
//! fans out across vector, relational and API sources through the
//! [`retrieval::Dispatcher`], and every step reports progress on a
//! [`streaming::StreamingBus`] that serves push and pull consumers alike.

pub mod chain;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod retrieval;
pub mod streaming;

pub use chain::{Chain, ChainContext, Step, StepOutcome};
pub use config::Config;
pub use context::RequestContext;
pub use error::{RelayError, Result, StreamingError};
pub use pipeline::{Orchestrator, QueryRequest};
pub use retrieval::{Dispatcher, KnowledgeChunk, Strategy, StrategyKind};
pub use streaming::{EventStream, EventType, ProgressEvent, SessionEmitter, StreamingBus};
