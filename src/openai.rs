use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::provider::{
    LlmRequest, OutputItem, Provider, ProviderError, ProviderStream, Response, StreamEvent,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Streaming client for any OpenAI-compatible Responses API endpoint,
/// including Azure-style deployments (set an `api-version` query).
pub struct OpenAiProvider {
    agent: ureq::Agent,
    api_key: String,
    model: String,
    base_url: String,
    api_version: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(DEFAULT_TIMEOUT))
            .build();

        Self {
            agent: config.into(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Azure-style `api-version` query parameter.
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        self.agent = config.into();
        self
    }

    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match &self.api_version {
            Some(version) => format!("{base}/responses?api-version={version}"),
            None => format!("{base}/responses"),
        }
    }

    fn build_body(&self, request: &LlmRequest) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(self.model));
        body.insert("stream".into(), json!(true));
        body.insert("input".into(), request.input.to_wire());
        body.insert("tools".into(), Value::Array(request.tools.clone()));

        if let Some(instructions) = &request.instructions {
            body.insert("instructions".into(), json!(instructions));
        }
        if let Some(choice) = &request.tool_choice {
            body.insert("tool_choice".into(), choice.to_wire());
        }
        if let Some(id) = &request.previous_response_id {
            body.insert("previous_response_id".into(), json!(id));
        }
        if let Some(schema) = &request.output_schema {
            body.insert(
                "text".into(),
                json!({
                    "format": {
                        "type": "json_schema",
                        "name": "output",
                        "schema": schema,
                    }
                }),
            );
        }

        Value::Object(body)
    }
}

impl Provider for OpenAiProvider {
    fn stream(&mut self, request: &LlmRequest) -> Result<ProviderStream, ProviderError> {
        let body = self.build_body(request);

        let response = self
            .agent
            .post(&self.endpoint())
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .header("Accept", "text/event-stream")
            .send_json(&body)
            .map_err(|e| ProviderError::new(e.to_string()))?;

        let (_, body) = response.into_parts();
        Ok(Box::new(SseStream::new(body.into_reader())))
    }
}

// ---------------------------------------------------------------------------
// SSE parsing
// ---------------------------------------------------------------------------

/// Pull-based server-sent-event decoder: assembles `data:` frames, maps
/// them onto [`StreamEvent`]s, skips event types the engine does not
/// consume. Dropping it closes the connection.
struct SseStream<R: Read> {
    lines: std::io::Lines<BufReader<R>>,
    done: bool,
}

impl<R: Read> SseStream<R> {
    fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            done: false,
        }
    }

    /// Read one SSE frame's data payload, joining multi-line data fields.
    fn next_frame(&mut self) -> Result<Option<String>, ProviderError> {
        let mut data = String::new();
        loop {
            let line = match self.lines.next() {
                Some(line) => line?,
                None => return Ok(if data.is_empty() { None } else { Some(data) }),
            };

            if line.is_empty() {
                if !data.is_empty() {
                    return Ok(Some(data));
                }
                continue;
            }
            if let Some(payload) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(payload.trim_start());
            }
            // `event:`, `id:` and comment lines carry nothing we use.
        }
    }
}

impl<R: Read> Iterator for SseStream<R> {
    type Item = Result<StreamEvent, ProviderError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let frame = match self.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };

            if frame == "[DONE]" {
                self.done = true;
                return None;
            }

            match serde_json::from_str::<WireEvent>(&frame) {
                Ok(event) => match map_event(event) {
                    Some(mapped) => return Some(Ok(mapped)),
                    None => continue,
                },
                Err(err) => {
                    self.done = true;
                    return Some(Err(ProviderError::new(format!(
                        "malformed stream event: {err}"
                    ))));
                }
            }
        }
        None
    }
}

fn map_event(event: WireEvent) -> Option<StreamEvent> {
    match event {
        WireEvent::Created { response } => Some(StreamEvent::Created {
            response_id: response.id,
        }),
        WireEvent::OutputTextDelta { delta } => Some(StreamEvent::TextDelta(delta)),
        WireEvent::Completed { response } => Some(StreamEvent::Completed(response.into())),
        WireEvent::Error { message } => Some(StreamEvent::Error(message)),
        WireEvent::Other => None,
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    #[serde(rename = "response.created")]
    Created { response: WireResponseId },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "response.completed")]
    Completed { response: WireResponse },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireResponseId {
    id: String,
}

#[derive(Deserialize)]
struct WireResponse {
    id: String,
    #[serde(default)]
    output: Vec<WireItem>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireItem {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        content: Vec<WireContent>,
    },
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireContent {
    #[serde(rename = "output_text")]
    OutputText { text: String },
    #[serde(other)]
    Other,
}

impl From<WireResponse> for Response {
    fn from(wire: WireResponse) -> Self {
        let mut output = Vec::new();
        for item in wire.output {
            match item {
                WireItem::Message { content } => {
                    for part in content {
                        if let WireContent::OutputText { text } = part {
                            output.push(OutputItem::Text { text });
                        }
                    }
                }
                WireItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => output.push(OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                }),
                WireItem::Other => {}
            }
        }
        Response {
            id: wire.id,
            output,
        }
    }
}
