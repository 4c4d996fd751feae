//! The model-call substrate.
//!
//! Every model call made by the engine goes through [`ModelClient`]. The
//! engine names the tier it wants; which model answers is configuration.

use crate::config::{ModelConfig, ModelTier};
use async_trait::async_trait;
use claude::{Claude, Message, Request, Response, Tool, ToolChoice};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a model call is for. Used for logging and for routing in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    SelectEndpoint,
    Summarize,
    ExtractMetadata,
    RetrievalDecision,
    QueryChapter,
    QueryRange,
    AgentIteration,
}

impl CallPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPurpose::SelectEndpoint => "select_endpoint",
            CallPurpose::Summarize => "summarize",
            CallPurpose::ExtractMetadata => "extract_metadata",
            CallPurpose::RetrievalDecision => "retrieval_decision",
            CallPurpose::QueryChapter => "query_chapter",
            CallPurpose::QueryRange => "query_range",
            CallPurpose::AgentIteration => "agent_iteration",
        }
    }
}

impl fmt::Display for CallPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request to the model substrate.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub purpose: CallPurpose,
    pub tier: ModelTier,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub temperature: Option<f32>,
}

impl ModelRequest {
    /// A single-prompt request.
    pub fn new(
        purpose: CallPurpose,
        tier: ModelTier,
        system: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            purpose,
            tier,
            system: system.into(),
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            temperature: None,
        }
    }

    /// A request continuing an existing conversation.
    pub fn conversation(
        purpose: CallPurpose,
        tier: ModelTier,
        system: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            purpose,
            tier,
            system: system.into(),
            messages,
            tools: Vec::new(),
            temperature: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Text of the first user message.
    pub fn prompt(&self) -> String {
        self.messages.first().map(Message::text).unwrap_or_default()
    }

    /// Convert to a Claude API request for the configured model.
    pub fn to_claude(&self, models: &ModelConfig) -> Request {
        let mut request = Request::new(self.messages.clone())
            .with_model(models.model_for(self.tier))
            .with_max_tokens(models.max_tokens_for(self.tier))
            .with_system(&self.system);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if !self.tools.is_empty() {
            request = request
                .with_tools(self.tools.clone())
                .with_tool_choice(ToolChoice::Auto);
        }
        request
    }
}

/// Request/response contract for model calls. Retry is the caller's job.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<Response, claude::Error>;
}

/// [`ModelClient`] backed by the Claude API.
#[derive(Clone)]
pub struct ClaudeModel {
    client: Claude,
    models: ModelConfig,
}

impl ClaudeModel {
    pub fn new(client: Claude, models: ModelConfig) -> Self {
        Self { client, models }
    }

    /// Create from environment (ANTHROPIC_API_KEY) with default tiers.
    pub fn from_env() -> Result<Self, claude::Error> {
        Ok(Self::new(Claude::from_env()?, ModelConfig::default()))
    }

    pub fn with_models(mut self, models: ModelConfig) -> Self {
        self.models = models;
        self
    }
}

#[async_trait]
impl ModelClient for ClaudeModel {
    async fn complete(&self, request: ModelRequest) -> Result<Response, claude::Error> {
        self.client.complete(request.to_claude(&self.models)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_claude_uses_tier_model() {
        let models = ModelConfig::default();
        let request = ModelRequest::new(CallPurpose::Summarize, ModelTier::Flagship, "sys", "hi")
            .with_temperature(0.3);
        let claude = request.to_claude(&models);

        assert_eq!(claude.model.as_deref(), Some(models.flagship_model.as_str()));
        assert_eq!(claude.max_tokens, models.flagship_max_tokens);
        assert_eq!(claude.system.as_deref(), Some("sys"));
        assert_eq!(claude.temperature, Some(0.3));
        assert!(claude.tools.is_none());
    }

    #[test]
    fn test_to_claude_with_tools_sets_auto_choice() {
        let tool = Tool {
            name: "list_chapters".into(),
            description: "List".into(),
            input_schema: serde_json::json!({"type": "object"}),
        };
        let request = ModelRequest::new(CallPurpose::AgentIteration, ModelTier::Fast, "sys", "go")
            .with_tools(vec![tool]);
        let claude = request.to_claude(&ModelConfig::default());

        assert_eq!(claude.tools.map(|t| t.len()), Some(1));
        assert!(matches!(claude.tool_choice, Some(ToolChoice::Auto)));
    }

    #[test]
    fn test_prompt_reads_first_message() {
        let request = ModelRequest::new(CallPurpose::QueryChapter, ModelTier::Fast, "s", "question?");
        assert_eq!(request.prompt(), "question?");
        assert_eq!(CallPurpose::QueryChapter.to_string(), "query_chapter");
    }
}
