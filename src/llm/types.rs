//! Core chat types - roles, content blocks, messages, request parameters

use serde::{Deserialize, Serialize};

/// Role of a conversation participant
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
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    /// The role a reply to this role carries
    pub fn opposite(self) -> Role {
        match self {
            Role::User => Role::Assistant,
            Role::Assistant => Role::User,
            Role::System => Role::User,
        }
    }
}

/// TTL hint for an ephemeral cache marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTtl {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

/// Cache breakpoint annotation on a content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheControl {
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl: Option<CacheTtl>,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            r#type: "ephemeral".to_string(),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: CacheTtl) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Image payload source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    pub r#type: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            r#type: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

/// Nested content inside a tool_result block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    Text { text: String },
    Image { source: ImageSource },
}

/// Content block within a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: ImageSource,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        cache_control: Option<CacheControl>,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        cache_control: Option<CacheControl>,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ToolResultBlock>,
        #[serde(default)]
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        cache_control: Option<CacheControl>,
    },
}

impl ContentBlock {
    pub fn text(body: impl Into<String>) -> Self {
        ContentBlock::Text {
            text: body.into(),
            cache_control: None,
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        lines: Vec<String>,
        is_error: bool,
    ) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: lines
                .into_iter()
                .map(|text| ToolResultBlock::Text { text })
                .collect(),
            is_error,
            cache_control: None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult { .. })
    }

    /// Set or clear the cache marker on blocks that carry a slot
    pub fn set_cache_control(&mut self, marker: Option<CacheControl>) {
        match self {
            ContentBlock::Text { cache_control, .. }
            | ContentBlock::Image { cache_control, .. }
            | ContentBlock::ToolUse { cache_control, .. }
            | ContentBlock::ToolResult { cache_control, .. } => *cache_control = marker,
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
        }
    }

    pub fn cache_control(&self) -> Option<&CacheControl> {
        match self {
            ContentBlock::Text { cache_control, .. }
            | ContentBlock::Image { cache_control, .. }
            | ContentBlock::ToolUse { cache_control, .. }
            | ContentBlock::ToolResult { cache_control, .. } => cache_control.as_ref(),
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => None,
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Body of the first text block, if any
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|b| match b {
            ContentBlock::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    /// All textual bodies: text blocks plus text nested in tool results
    pub fn text_bodies(&self) -> Vec<&str> {
        let mut bodies = Vec::new();
        for block in &self.content {
            match block {
                ContentBlock::Text { text, .. } => bodies.push(text.as_str()),
                ContentBlock::ToolResult { content, .. } => {
                    for nested in content {
                        if let ToolResultBlock::Text { text } = nested {
                            bodies.push(text.as_str());
                        }
                    }
                }
                _ => {}
            }
        }
        bodies
    }

    /// Ids of all tool_use blocks in this message
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Names of all tool_use blocks in this message
    pub fn tool_names(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids of all tool_result blocks in this message
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_use)
    }

    /// True when the final block is a tool_use
    pub fn ends_with_tool_use(&self) -> bool {
        matches!(self.content.last(), Some(ContentBlock::ToolUse { .. }))
    }
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for input parameters
    pub input_schema: serde_json::Value,
}

/// Tool-choice mode for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    Any,
    Named(String),
}

/// Parameters shaping one outgoing request
#[derive(Debug, Clone)]
pub struct RequestParams {
    /// Model identifier (e.g. "claude-sonnet-4-20250514")
    pub model: String,
    /// Explicit max output tokens; None selects per-model defaults
    pub max_tokens: Option<u32>,
    /// Explicit temperature; None selects per-model defaults
    pub temperature: Option<f32>,
    /// Enable extended thinking where the model supports it
    pub use_thinking: bool,
    /// Explicit thinking budget; None selects per-model defaults
    pub thinking_budget: Option<u32>,
    pub use_cache: bool,
    pub cache_tools: bool,
    pub cache_system: bool,
    pub cache_messages: bool,
    pub tool_choice: ToolChoice,
    pub stream: bool,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: None,
            temperature: None,
            use_thinking: false,
            thinking_budget: None,
            use_cache: true,
            cache_tools: true,
            cache_system: true,
            cache_messages: true,
            tool_choice: ToolChoice::Auto,
            stream: true,
        }
    }
}

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    CancelledByUser,
}

impl StopReason {
    pub fn from_wire(s: &str) -> StopReason {
        match s {
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            "tool_use" => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        }
    }
}

/// Token accounting reported by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_creation_input_tokens: u32,
    pub cache_read_input_tokens: u32,
}

impl Usage {
    /// Fold a later usage report into this one; non-zero fields win
    pub fn merge(&mut self, other: &Usage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens = other.cache_creation_input_tokens;
        }
        if other.cache_read_input_tokens > 0 {
            self.cache_read_input_tokens = other.cache_read_input_tokens;
        }
    }
}

/// Opening descriptor of a streamed content block
#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    Text,
    Thinking,
    RedactedThinking { data: String },
    ToolUse { id: String, name: String },
}

/// Incremental payload for an open content block
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// Raw text fragment
    Text(String),
    /// Partial JSON fragment of a tool input object
    InputJson(String),
    /// Thinking-text fragment
    Thinking(String),
    /// Thinking signature
    Signature(String),
}

/// Typed event decoded from the SSE stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        message_id: Option<String>,
        usage: Option<Usage>,
    },
    ContentBlockStart {
        index: usize,
        block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: StreamDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    },
    MessageStop,
    Ping,
}

/// LLM-specific errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("Authentication failed: {message}")]
    AuthError { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Provider error: {status} - {message}")]
    ProviderError { status: u16, message: String },

    #[error("API error: {kind} - {message}")]
    Api { kind: String, message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Stream interrupted")]
    StreamInterrupted,

    #[error("Timeout after {timeout_secs}s")]
    Timeout { timeout_secs: u32 },
}
