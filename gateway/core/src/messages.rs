//! Canonical Message Types
//!
//! The gateway speaks one protocol to its callers: the Anthropic Messages
//! shape. Everything inbound is parsed into [`CanonicalRequest`], and
//! everything outbound is either a [`CanonicalResponse`] (unary) or an ordered
//! sequence of [`CanonicalEvent`]s (streaming).
//!
//! # Event Ordering
//!
//! ```text
//! message_start
//!   (content_block_start  content_block_delta*  content_block_stop)*
//!   [error]
//! message_delta
//! message_stop            <- exactly once, always last
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

// ============================================================================
// Identifiers
// ============================================================================

/// Correlation id carried through logs and response headers
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(format!("req_{}", Uuid::new_v4().simple()))
    }

    /// Borrow the id text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Request
// ============================================================================

/// Speaker of a conversation turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Human turn
    User,
    /// Model turn
    Assistant,
}

/// One part of a message body
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text
    Text {
        /// The text
        text: String,
    },
    /// Model asked to call a tool
    ToolUse {
        /// Tool call id
        id: String,
        /// Tool name
        name: String,
        /// Tool arguments
        input: serde_json::Value,
    },
    /// Result of a previous tool call
    ToolResult {
        /// Id of the tool call this answers
        tool_use_id: String,
        /// Result payload (string or block list)
        #[serde(default)]
        content: serde_json::Value,
        /// Whether the tool failed
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Text block shorthand
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Flatten this block to the text a model would read
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::ToolUse { name, input, .. } => format!("{name} {input}"),
            Self::ToolResult { content, .. } => flatten_tool_result(content),
        }
    }
}

/// Tool results arrive either as a bare string or as a list of text blocks
pub(crate) fn flatten_tool_result(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(serde_json::Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One conversation turn
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who spoke
    pub role: Role,
    /// Ordered content parts (a bare string is accepted as one text part)
    #[serde(deserialize_with = "string_or_blocks")]
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// Single-text user message
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Single-text assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrBlocks {
    String(String),
    Blocks(Vec<ContentBlock>),
}

fn string_or_blocks<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match StringOrBlocks::deserialize(deserializer)? {
        StringOrBlocks::String(text) => vec![ContentBlock::Text { text }],
        StringOrBlocks::Blocks(blocks) => blocks,
    })
}

fn optional_system<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<StringOrBlocks> = Option::deserialize(deserializer)?;
    Ok(raw.map(|s| match s {
        StringOrBlocks::String(text) => text,
        StringOrBlocks::Blocks(blocks) => blocks
            .iter()
            .map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n"),
    }))
}

/// Tool the model may call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// What the tool does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

/// Inbound request in the canonical (Anthropic Messages) shape
///
/// Immutable once constructed; the orchestrator shares it behind an `Arc`
/// across retry attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    /// Requested model name (drives category rules)
    pub model: String,
    /// Conversation so far
    pub messages: Vec<Message>,
    /// System prompt
    #[serde(
        default,
        deserialize_with = "optional_system",
        skip_serializing_if = "Option::is_none"
    )]
    pub system: Option<String>,
    /// Tool declarations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Generation cap
    pub max_tokens: u32,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Whether the caller wants server-sent events
    #[serde(default)]
    pub stream: bool,
    /// Opaque caller metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Correlation id (assigned by the gateway, never read from the body)
    #[serde(skip)]
    pub correlation_id: CorrelationId,
}

impl CanonicalRequest {
    /// Create a request with a single user turn
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::user(prompt)],
            system: None,
            tools: Vec::new(),
            max_tokens,
            temperature: None,
            stream: false,
            metadata: None,
            correlation_id: CorrelationId::new(),
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Add a tool declaration
    #[must_use]
    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Replace the correlation id
    #[must_use]
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = id;
        self
    }

    /// Rough token estimate: characters / 4 over every text-bearing part
    /// plus tool declarations
    #[must_use]
    pub fn estimated_tokens(&self) -> usize {
        let mut chars = self.system.as_ref().map_or(0, String::len);
        for message in &self.messages {
            chars += message
                .content
                .iter()
                .map(|b| b.as_text().len())
                .sum::<usize>();
        }
        for tool in &self.tools {
            chars += tool.name.len();
            chars += tool.description.as_ref().map_or(0, String::len);
            chars += tool.input_schema.to_string().len();
        }
        chars / 4
    }

    /// Reject requests no upstream could serve
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] naming the first problem found.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model must not be empty".into()));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must contain at least one turn".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(GatewayError::InvalidRequest(
                "max_tokens must be greater than zero".into(),
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(GatewayError::InvalidRequest(format!(
                    "temperature {t} out of range 0.0..=2.0"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Response
// ============================================================================

/// Why generation ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Natural end of turn
    #[serde(rename = "end_turn")]
    End,
    /// Model is waiting on a tool call
    #[serde(rename = "tool_use")]
    ToolCall,
    /// Hit the token cap
    #[serde(rename = "max_tokens")]
    Length,
    /// Upstream failed mid-generation
    #[serde(rename = "error")]
    Error,
}

/// Token accounting reported by the upstream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub input_tokens: u32,
    /// Generated tokens
    pub output_tokens: u32,
}

/// Unary response in the canonical shape
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    /// Response id
    pub id: String,
    /// Always `"message"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Always assistant
    pub role: Role,
    /// Model that produced the answer (the bound endpoint's model)
    pub model: String,
    /// Answer content
    pub content: Vec<ContentBlock>,
    /// Why generation ended
    pub stop_reason: StopReason,
    /// Token accounting
    pub usage: Usage,
}

impl CanonicalResponse {
    /// Build an assistant message
    pub fn new(
        model: impl Into<String>,
        content: Vec<ContentBlock>,
        stop_reason: StopReason,
        usage: Usage,
    ) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            kind: "message".to_string(),
            role: Role::Assistant,
            model: model.into(),
            content,
            stop_reason,
            usage,
        }
    }

    /// Concatenated text of all text blocks
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// Streaming Events
// ============================================================================

/// Header of a streamed message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageStart {
    /// Message id
    pub id: String,
    /// Always `"message"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Always assistant
    pub role: Role,
    /// Model serving the stream
    pub model: String,
    /// Empty at start
    pub content: Vec<ContentBlock>,
    /// Prompt usage if known up front
    pub usage: Usage,
}

/// Opening shape of a content block
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    /// Text block, filled by `text_delta`s
    Text {
        /// Always empty at start
        text: String,
    },
    /// Tool call, arguments filled by `input_json_delta`s
    ToolUse {
        /// Tool call id
        id: String,
        /// Tool name
        name: String,
        /// Always an empty object at start
        input: serde_json::Value,
    },
}

/// Incremental content for an open block
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    /// Text fragment
    TextDelta {
        /// Fragment
        text: String,
    },
    /// Tool-argument JSON fragment
    InputJsonDelta {
        /// Fragment of the serialized arguments
        partial_json: String,
    },
}

/// Body of a `message_delta`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    /// Why generation ended
    pub stop_reason: StopReason,
}

/// Body of an `error` event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error kind tag
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable message
    pub message: String,
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        Self {
            kind: err.kind().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

/// One unit of the normalized output stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    /// First event of every stream
    MessageStart {
        /// Message header
        message: MessageStart,
    },
    /// A content block opens
    ContentBlockStart {
        /// Block index
        index: usize,
        /// Block kind
        content_block: BlockStart,
    },
    /// Content for the open block
    ContentBlockDelta {
        /// Block index
        index: usize,
        /// Fragment
        delta: ContentDelta,
    },
    /// The open block closes
    ContentBlockStop {
        /// Block index
        index: usize,
    },
    /// Terminal stop reason and final usage, sent just before `message_stop`
    MessageDelta {
        /// Stop reason
        delta: MessageDeltaBody,
        /// Final usage
        usage: Usage,
    },
    /// Upstream failure mid-stream
    Error {
        /// Error payload
        error: ErrorBody,
    },
    /// Last event of every stream
    MessageStop {
        /// Why the stream ended
        stop_reason: StopReason,
    },
}

impl CanonicalEvent {
    /// SSE event name (same as the serialized `type` tag)
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::ContentBlockStop { .. } => "content_block_stop",
            Self::MessageDelta { .. } => "message_delta",
            Self::Error { .. } => "error",
            Self::MessageStop { .. } => "message_stop",
        }
    }

    /// Whether this is the terminal `message_stop`
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::MessageStop { .. })
    }
}
