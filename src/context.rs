//! Per-request state shared by every step of a chain execution.
//!
//! A [`RequestContext`] is built once per incoming query, validated at
//! construction, mutated by each step in order, and dropped when the chain
//! finishes.  Step outputs travel forward on [`StepOutputs`], a typed record
//! whose slots can each be written exactly once.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::pipeline::plan::PlanDetail;
use crate::pipeline::prompt::AssembledPrompt;
use crate::retrieval::{KnowledgeChunk, StrategyKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "User"),
            Role::Assistant => write!(f, "Assistant"),
            Role::System => write!(f, "System"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Caller-supplied retrieval knobs.  `None` falls back to configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalParams {
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    /// Explicit source selection; wins over every other selection rule.
    #[serde(default)]
    pub strategy_hint: Option<StrategyKind>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Ordered source preference for this user.  Empty defers to the
    /// configured per-user list.
    #[serde(default)]
    pub preferred_sources: Vec<StrategyKind>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub answer_style: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Outputs handed from one step to the next.  Every slot is write-once.
#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    plan: Option<PlanDetail>,
    chunks: Option<Vec<KnowledgeChunk>>,
    prompt: Option<AssembledPrompt>,
    response: Option<String>,
    extras: BTreeMap<String, serde_json::Value>,
}

fn set_once<T>(slot: &mut Option<T>, value: T, field: &str) -> Result<()> {
    if slot.is_some() {
        return Err(RelayError::Validation(format!(
            "step output '{field}' is already set"
        )));
    }
    *slot = Some(value);
    Ok(())
}

impl StepOutputs {
    pub fn plan(&self) -> Option<&PlanDetail> {
        self.plan.as_ref()
    }

    pub fn set_plan(&mut self, plan: PlanDetail) -> Result<()> {
        set_once(&mut self.plan, plan, "plan")
    }

    pub fn chunks(&self) -> Option<&[KnowledgeChunk]> {
        self.chunks.as_deref()
    }

    pub fn set_chunks(&mut self, chunks: Vec<KnowledgeChunk>) -> Result<()> {
        set_once(&mut self.chunks, chunks, "chunks")
    }

    pub fn prompt(&self) -> Option<&AssembledPrompt> {
        self.prompt.as_ref()
    }

    pub fn set_prompt(&mut self, prompt: AssembledPrompt) -> Result<()> {
        set_once(&mut self.prompt, prompt, "prompt")
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub fn set_response(&mut self, response: String) -> Result<()> {
        set_once(&mut self.response, response, "response")
    }

    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.extras.get(key)
    }

    /// Insert a free-form value.  Existing keys are never overwritten.
    pub fn insert_extra(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        let key = key.into();
        if self.extras.contains_key(&key) {
            return Err(RelayError::Validation(format!(
                "extension key '{key}' is already set"
            )));
        }
        self.extras.insert(key, value);
        Ok(())
    }

    pub fn extras(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.extras
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    session_id: String,
    user_id: String,
    query_id: String,
    query: String,
    history: Vec<ConversationTurn>,
    pub params: RetrievalParams,
    pub preferences: UserPreferences,
    pub outputs: StepOutputs,
    pub current_step: Option<String>,
    pub status: RequestStatus,
    pub error_message: Option<String>,
    pub debug: bool,
}

impl RequestContext {
    pub fn builder(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        query: impl Into<String>,
    ) -> RequestContextBuilder {
        RequestContextBuilder {
            session_id: session_id.into(),
            user_id: user_id.into(),
            query: query.into(),
            query_id: None,
            history: Vec::new(),
            params: RetrievalParams::default(),
            preferences: UserPreferences::default(),
            debug: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Append a turn.  Earlier turns are never modified.
    pub fn push_turn(&mut self, turn: ConversationTurn) {
        self.history.push(turn);
    }
}

pub struct RequestContextBuilder {
    session_id: String,
    user_id: String,
    query: String,
    query_id: Option<String>,
    history: Vec<ConversationTurn>,
    params: RetrievalParams,
    preferences: UserPreferences,
    debug: bool,
}

impl RequestContextBuilder {
    pub fn query_id(mut self, id: impl Into<String>) -> Self {
        self.query_id = Some(id.into());
        self
    }

    pub fn history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn params(mut self, params: RetrievalParams) -> Self {
        self.params = params;
        self
    }

    pub fn preferences(mut self, preferences: UserPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate required fields and produce the context.
    pub fn build(self) -> Result<RequestContext> {
        let query_id = self
            .query_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        for (field, value) in [
            ("session_id", &self.session_id),
            ("user_id", &self.user_id),
            ("query_id", &query_id),
            ("query", &self.query),
        ] {
            if value.trim().is_empty() {
                return Err(RelayError::Validation(format!("{field} must not be empty")));
            }
        }

        if let Some(threshold) = self.params.similarity_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(RelayError::Validation(format!(
                    "similarity_threshold must be within [0, 1], got {threshold}"
                )));
            }
        }
        if self.params.max_results == Some(0) {
            return Err(RelayError::Validation("max_results must be positive".into()));
        }

        Ok(RequestContext {
            session_id: self.session_id,
            user_id: self.user_id,
            query_id,
            query: self.query,
            history: self.history,
            params: self.params,
            preferences: self.preferences,
            outputs: StepOutputs::default(),
            current_step: None,
            status: RequestStatus::Pending,
            error_message: None,
            debug: self.debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::builder("s1", "u1", "what is rust").build().unwrap()
    }

    #[test]
    fn build_generates_query_id() {
        let c = ctx();
        assert!(!c.query_id().is_empty());
        assert_eq!(c.session_id(), "s1");
        assert_eq!(c.user_id(), "u1");
        assert_eq!(c.status, RequestStatus::Pending);
        assert!(c.current_step.is_none());
    }

    #[test]
    fn build_rejects_empty_fields() {
        let err = RequestContext::builder("", "u1", "q").build().unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("session_id"));

        let err = RequestContext::builder("s", " ", "q").build().unwrap_err();
        assert!(err.to_string().contains("user_id"));

        let err = RequestContext::builder("s", "u", "   ").build().unwrap_err();
        assert!(err.to_string().contains("query"));

        let err = RequestContext::builder("s", "u", "q")
            .query_id("")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("query_id"));
    }

    #[test]
    fn build_rejects_out_of_range_params() {
        let params = RetrievalParams {
            similarity_threshold: Some(1.5),
            ..Default::default()
        };
        let err = RequestContext::builder("s", "u", "q")
            .params(params)
            .build()
            .unwrap_err();
        assert!(err.is_validation());

        let params = RetrievalParams {
            max_results: Some(0),
            ..Default::default()
        };
        assert!(RequestContext::builder("s", "u", "q").params(params).build().is_err());
    }

    #[test]
    fn outputs_are_write_once() {
        let mut c = ctx();
        c.outputs.set_response("first".into()).unwrap();
        let err = c.outputs.set_response("second".into()).unwrap_err();
        assert!(err.to_string().contains("response"));
        assert_eq!(c.outputs.response(), Some("first"));
    }

    #[test]
    fn extras_never_overwrite() {
        let mut c = ctx();
        c.outputs.insert_extra("k", serde_json::json!(1)).unwrap();
        assert!(c.outputs.insert_extra("k", serde_json::json!(2)).is_err());
        assert_eq!(c.outputs.extra("k"), Some(&serde_json::json!(1)));
        c.outputs.insert_extra("other", serde_json::json!("x")).unwrap();
        assert_eq!(c.outputs.extras().len(), 2);
    }

    #[test]
    fn history_is_append_only() {
        let mut c = RequestContext::builder("s", "u", "q")
            .history(vec![ConversationTurn::new(Role::User, "hi")])
            .build()
            .unwrap();
        c.push_turn(ConversationTurn::new(Role::Assistant, "hello"));
        let roles: Vec<Role> = c.history().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(c.history()[0].content, "hi");
    }
}
