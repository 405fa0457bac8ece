use serde_json::{Value, json};

use crate::context::ProcessContext;
use crate::events::Event;
use crate::provider::{
    FunctionOutput, LlmRequest, Message, OutputItem, RequestInput, Response, StreamEvent,
    ToolChoice,
};
use crate::tool::ToolRegistry;

/// Default cap on model round trips per call.
pub const DEFAULT_MAX_ROUND_TRIPS: usize = 6;

/// Options for one [`call_llm`] invocation.
pub struct CallOptions {
    pub instructions: Option<String>,
    /// Allowed tool names. `None` advertises the whole registry.
    pub tools: Option<Vec<String>>,
    pub tool_choice: Option<ToolChoice>,
    /// JSON schema for structured output; when set, the final round's
    /// parsed payload is the call's return value.
    pub output_schema: Option<Value>,
    pub max_round_trips: usize,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            instructions: None,
            tools: None,
            tool_choice: None,
            output_schema: None,
            max_round_trips: DEFAULT_MAX_ROUND_TRIPS,
        }
    }
}

/// Initial input: a literal user message, or tool outputs continuing a
/// conversation.
pub enum CallInput {
    Text(String),
    ToolOutputs(Vec<FunctionOutput>),
}

impl From<&str> for CallInput {
    fn from(s: &str) -> Self {
        CallInput::Text(s.to_string())
    }
}

impl From<String> for CallInput {
    fn from(s: String) -> Self {
        CallInput::Text(s)
    }
}

impl From<Vec<FunctionOutput>> for CallInput {
    fn from(outputs: Vec<FunctionOutput>) -> Self {
        CallInput::ToolOutputs(outputs)
    }
}

/// Drive the model/tool round-trip loop until the model stops calling
/// tools, the budget runs out, or the run is interrupted.
///
/// Everything useful flows through the context's event emitter: text
/// deltas, tool call/result notices, errors, and round boundaries. The
/// return value is the parsed structured payload when an output schema was
/// requested, `None` otherwise — including under budget pressure, so
/// callers must treat "no final answer" as a possible normal outcome.
///
/// No ordinary model or tool failure propagates as an error; interruption
/// surfaces only as the context's `paused`/`running` flags.
pub fn call_llm(
    ctx: &mut ProcessContext,
    registry: &mut ToolRegistry,
    input: impl Into<CallInput>,
    opts: CallOptions,
) -> Option<Value> {
    let events = ctx.events.clone();
    let Some(mut provider) = ctx.take_provider() else {
        events.emit(&Event::Error("no LLM provider configured".into()));
        return None;
    };
    let result = drive(ctx, registry, provider.as_mut(), input.into(), &opts);
    ctx.put_provider(provider);
    result
}

fn drive(
    ctx: &mut ProcessContext,
    registry: &mut ToolRegistry,
    provider: &mut dyn crate::provider::Provider,
    input: CallInput,
    opts: &CallOptions,
) -> Option<Value> {
    let events = ctx.events.clone();

    let mut payload = match input {
        CallInput::Text(text) => RequestInput::Messages(vec![Message::user(text)]),
        CallInput::ToolOutputs(outputs) => RequestInput::ToolOutputs(outputs),
    };

    let mut round = 0;
    loop {
        round += 1;
        if round > opts.max_round_trips {
            events.emit(&Event::Error(format!(
                "round-trip budget of {} exhausted; stopping without a final answer",
                opts.max_round_trips
            )));
            return None;
        }
        if ctx.cancel.is_cancelled() {
            return interrupt(ctx);
        }

        events.emit(&Event::Start { round });

        let request = LlmRequest {
            input: payload.clone(),
            instructions: opts.instructions.clone(),
            tools: match &opts.tools {
                Some(names) => registry.schemas_for(names),
                None => registry.schemas(),
            },
            tool_choice: opts.tool_choice.clone(),
            previous_response_id: ctx.response_id.clone(),
            output_schema: opts.output_schema.clone(),
        };

        let mut stream = match provider.stream(&request) {
            Ok(stream) => stream,
            Err(err) => {
                events.emit(&Event::Error(err.to_string()));
                events.emit(&Event::End { round });
                return None;
            }
        };

        let mut completed: Option<Response> = None;
        loop {
            if ctx.cancel.is_cancelled() {
                drop(stream); // closes the in-flight connection
                return interrupt(ctx);
            }
            let Some(item) = stream.next() else { break };
            match item {
                Ok(StreamEvent::Created { response_id }) => {
                    ctx.response_id = Some(response_id);
                }
                Ok(StreamEvent::TextDelta(delta)) => {
                    events.emit(&Event::Text(delta));
                }
                Ok(StreamEvent::Error(message)) => {
                    events.emit(&Event::Error(message));
                }
                Ok(StreamEvent::Completed(response)) => {
                    completed = Some(response);
                }
                Err(err) => {
                    events.emit(&Event::Error(err.to_string()));
                    break;
                }
            }
        }

        let Some(response) = completed else {
            events.emit(&Event::End { round });
            return None;
        };

        let mut outputs = Vec::new();
        for item in &response.output {
            let OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } = item
            else {
                continue;
            };
            if ctx.cancel.is_cancelled() {
                return interrupt(ctx);
            }

            events.emit(&Event::ToolCall { name: name.clone() });
            let record = match registry.call(ctx, name, arguments.as_str()) {
                Ok(value) => {
                    events.emit(&Event::ToolResult {
                        name: name.clone(),
                        result: value.clone(),
                    });
                    serialize_result(&value)
                }
                Err(err) => {
                    // One failing tool never aborts the round; the model
                    // sees the error string and can react.
                    let message = err.to_string();
                    events.emit(&Event::Error(message.clone()));
                    events.emit(&Event::ToolResult {
                        name: name.clone(),
                        result: json!({ "error": message }),
                    });
                    format!("error: {message}")
                }
            };
            outputs.push(FunctionOutput {
                call_id: call_id.clone(),
                output: record,
            });
        }

        events.emit(&Event::End { round });

        if outputs.is_empty() {
            return finish(&events, &response, opts);
        }
        payload = RequestInput::ToolOutputs(outputs);
    }
}

fn finish(
    events: &crate::events::EventEmitter,
    response: &Response,
    opts: &CallOptions,
) -> Option<Value> {
    opts.output_schema.as_ref()?;
    let text = response.text();
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(err) => {
            events.emit(&Event::Error(format!(
                "structured output was not valid JSON: {err}"
            )));
            None
        }
    }
}

fn interrupt(ctx: &mut ProcessContext) -> Option<Value> {
    ctx.events
        .emit(&Event::Error("interrupted by user; pausing run".into()));
    ctx.paused = true;
    ctx.running = false;
    None
}

/// Tool results go back to the model as strings: maps and arrays
/// JSON-encoded, strings verbatim, everything else stringified.
fn serialize_result(value: &Value) -> String {
    match value {
        Value::Object(_) | Value::Array(_) => value.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
