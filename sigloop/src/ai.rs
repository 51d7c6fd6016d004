//! The AI-service seam: request, response and stream shapes plus the
//! [`AiService`] trait every backend implements.

use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ServiceError;

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions.
    System,
    /// Caller or corrective feedback.
    User,
    /// Model output.
    Assistant,
    /// Tool results.
    Function,
}

/// Arguments of a tool call as delivered by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunctionParams {
    /// Raw JSON text, possibly arriving in fragments.
    Text(String),
    /// An already decoded object.
    Object(Value),
}

impl Default for FunctionParams {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Call id; empty ids on stream fragments continue the previous call.
    pub id: String,
    /// Function name.
    pub name: String,
    /// Arguments.
    pub params: FunctionParams,
}

impl FunctionCall {
    /// Creates a call with object arguments.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            params: FunctionParams::Object(params),
        }
    }

    /// Creates a call whose arguments are raw JSON text.
    #[must_use]
    pub fn text(id: impl Into<String>, name: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            params: FunctionParams::Text(params.into()),
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    /// Instructions.
    System {
        /// Text.
        content: String,
    },
    /// Caller input or feedback.
    User {
        /// Text.
        content: String,
    },
    /// Model output.
    Assistant {
        /// Text, absent on pure tool-call turns.
        content: Option<String>,
        /// Tool calls requested on this turn.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        function_calls: Vec<FunctionCall>,
    },
    /// Result of one tool call.
    Function {
        /// The call this answers.
        function_id: String,
        /// Serialized result.
        result: String,
    },
}

impl ChatMessage {
    /// The message role.
    #[must_use]
    pub const fn role(&self) -> Role {
        match self {
            Self::System { .. } => Role::System,
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::Function { .. } => Role::Function,
        }
    }

    /// Shorthand for a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Shorthand for a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Function name.
    pub name: String,
    /// What the function does.
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
}

/// Reasoning effort requested from models that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingBudget {
    /// No reasoning.
    #[serde(rename = "none")]
    Disabled,
    /// Minimal.
    Minimal,
    /// Low.
    Low,
    /// Medium.
    Medium,
    /// High.
    High,
    /// Highest.
    Highest,
}

impl ThinkingBudget {
    /// All levels, lowest first.
    pub const ALL: [Self; 6] = [
        Self::Disabled,
        Self::Minimal,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::Highest,
    ];

    /// Wire name of the level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "none",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Highest => "highest",
        }
    }
}

impl fmt::Display for ThinkingBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThinkingBudget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown thinking budget '{s}'"))
    }
}

/// Sampling parameters for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Output token limit.
    pub max_tokens: Option<u32>,
    /// Reasoning effort.
    pub thinking_budget: Option<ThinkingBudget>,
    /// Number of candidates to sample.
    pub n: Option<usize>,
}

/// A chat request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Tools the model may call.
    pub functions: Vec<FunctionSpec>,
    /// Model name or key; `None` lets the service choose.
    pub model: Option<String>,
    /// Sampling parameters.
    pub model_config: ModelConfig,
    /// Whether a streamed response is wanted.
    pub stream: bool,
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// Output limit reached.
    Length,
    /// Stopped to call tools.
    FunctionCall,
    /// Provider-side failure.
    Error,
    /// Anything else.
    Other,
}

/// Output for one candidate (or one fragment of it).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    /// Candidate index.
    pub index: usize,
    /// Text content.
    pub content: Option<String>,
    /// Reasoning text.
    pub thought: Option<String>,
    /// Tool calls, possibly partial on stream fragments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_calls: Vec<FunctionCall>,
    /// Why generation stopped, on the final fragment.
    pub finish_reason: Option<FinishReason>,
}

impl ChatResult {
    /// A text result for `index`.
    #[must_use]
    pub fn content(index: usize, content: impl Into<String>) -> Self {
        Self {
            index,
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Sets the finish reason.
    #[must_use]
    pub const fn finished(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }
}

/// Token counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub prompt_tokens: u64,
    /// Completion tokens.
    pub completion_tokens: u64,
    /// Reasoning tokens.
    pub thoughts_tokens: u64,
    /// Total tokens.
    pub total_tokens: u64,
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.thoughts_tokens += rhs.thoughts_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// A complete response, or one fragment of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Per-candidate results.
    pub results: Vec<ChatResult>,
    /// Token usage; on streams, the last fragment carrying usage wins.
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// A response with the given results and no usage.
    #[must_use]
    pub const fn new(results: Vec<ChatResult>) -> Self {
        Self {
            results,
            usage: None,
        }
    }
}

/// A stream of response fragments.
pub type ChatStream = BoxStream<'static, Result<ChatResponse, ServiceError>>;

/// What [`AiService::chat`] returns.
pub enum ChatOutput {
    /// A complete response.
    Response(ChatResponse),
    /// A fragment stream.
    Stream(ChatStream),
}

impl fmt::Debug for ChatOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Capabilities of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceFeatures {
    /// Native tool calling.
    pub functions: bool,
    /// Streamed responses.
    pub streaming: bool,
    /// The model may write reasoning text alongside tool calls.
    pub function_cot: bool,
}

impl Default for ServiceFeatures {
    fn default() -> Self {
        Self {
            functions: true,
            streaming: true,
            function_cot: false,
        }
    }
}

/// A model a service exposes under a short key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Key callers and the model use to select it.
    pub key: String,
    /// Provider model name.
    pub model: String,
    /// When to prefer this model.
    pub description: String,
}

/// A language-model backend.
///
/// Implementations translate [`ChatRequest`]s into provider calls. They are
/// shared across calls and must be thread safe.
#[async_trait]
pub trait AiService: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Supported capabilities.
    fn features(&self) -> ServiceFeatures {
        ServiceFeatures::default()
    }

    /// Selectable models.
    fn models(&self) -> Vec<ModelInfo> {
        Vec::new()
    }

    /// Sends one request.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] describing the transport or provider failure.
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutput, ServiceError>;
}
