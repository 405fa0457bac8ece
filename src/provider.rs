use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Request side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// The serialized result of one executed tool call, fed back to the model
/// on the following round.
#[derive(Debug, Clone)]
pub struct FunctionOutput {
    pub call_id: String,
    pub output: String,
}

/// What a round sends: the original messages on round one, the previous
/// round's tool outputs afterwards.
#[derive(Debug, Clone)]
pub enum RequestInput {
    Messages(Vec<Message>),
    ToolOutputs(Vec<FunctionOutput>),
}

impl RequestInput {
    pub(crate) fn to_wire(&self) -> Value {
        match self {
            RequestInput::Messages(messages) => json!(messages),
            RequestInput::ToolOutputs(outputs) => Value::Array(
                outputs
                    .iter()
                    .map(|o| {
                        json!({
                            "type": "function_call_output",
                            "call_id": o.call_id,
                            "output": o.output,
                        })
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// The model decides whether to call tools.
    Auto,
    /// The model must call some tool this round.
    Required,
    /// The model must call this specific tool.
    Tool(String),
}

impl ToolChoice {
    pub(crate) fn to_wire(&self) -> Value {
        match self {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Tool(name) => json!({"type": "function", "name": name}),
        }
    }
}

/// One streaming request at the provider boundary. The engine depends only
/// on this shape, not on any vendor.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub input: RequestInput,
    pub instructions: Option<String>,
    /// Function-tool schemas, in advertisement order.
    pub tools: Vec<Value>,
    pub tool_choice: Option<ToolChoice>,
    /// Conversation continuation token. When present the provider replays
    /// prior turns itself, so `input` need not carry the transcript.
    pub previous_response_id: Option<String>,
    /// JSON schema for structured output, if requested.
    pub output_schema: Option<Value>,
}

// ---------------------------------------------------------------------------
// Response side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum OutputItem {
    Text { text: String },
    FunctionCall {
        call_id: String,
        name: String,
        /// Raw JSON-encoded argument string, exactly as the model sent it.
        arguments: String,
    },
}

/// The finalized response enumerating all output items.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub id: String,
    pub output: Vec<OutputItem>,
}

impl Response {
    /// Concatenated text of all text output items.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for item in &self.output {
            if let OutputItem::Text { text } = item {
                out.push_str(text);
            }
        }
        out
    }
}

/// Events as they arrive on the wire.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The provider opened a new conversation turn; carries the
    /// continuation id.
    Created { response_id: String },
    /// A fragment of output text.
    TextDelta(String),
    /// A provider-level error surfaced inside the stream.
    Error(String),
    /// The stream finished; carries the finalized response.
    Completed(Response),
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ProviderError(pub String);

impl ProviderError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error: {}", self.0)
    }
}

impl std::error::Error for ProviderError {}

impl From<std::io::Error> for ProviderError {
    fn from(e: std::io::Error) -> Self {
        ProviderError(e.to_string())
    }
}

pub type ProviderStream = Box<dyn Iterator<Item = Result<StreamEvent, ProviderError>>>;

/// The LLM connection boundary: send a conversation plus tool schemas,
/// pull back a synchronous stream of events. Dropping the stream closes
/// the underlying connection.
pub trait Provider {
    fn stream(&mut self, request: &LlmRequest) -> Result<ProviderStream, ProviderError>;
}
