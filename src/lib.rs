//! A minimal agent framework: LLM-executed nodes wired into a directed
//! graph.
//!
//! Each [`Node`] is one model call with its own instructions, tool subset
//! and routing table. Nodes share a [`ProcessContext`] — a data map every
//! prompt can see plus the engine's run flags — and the model itself picks
//! the next node by calling the built-in route tool. Output streams
//! through the context's [`EventEmitter`] as it arrives.
//!
//! # Quick start
//!
//! ```rust
//! use agent_graph::{
//!     Channel, Event, Graph, LlmRequest, Node, OutputItem, ProcessContext, Provider,
//!     ProviderError, ProviderStream, Response, StreamEvent,
//! };
//!
//! // A canned provider; real runs use `OpenAiProvider` instead.
//! struct Canned(Vec<StreamEvent>);
//! impl Provider for Canned {
//!     fn stream(&mut self, _req: &LlmRequest) -> Result<ProviderStream, ProviderError> {
//!         Ok(Box::new(std::mem::take(&mut self.0).into_iter().map(Ok)))
//!     }
//! }
//!
//! let answer = Node::builder("answer")
//!     .instructions("Answer the user's question.")
//!     .input("What colour is the sky?")
//!     .build();
//! let start = answer.id().clone();
//! let mut graph = Graph::builder("demo").register(answer).build().unwrap();
//!
//! let mut ctx = ProcessContext::new();
//! ctx.set_provider(Box::new(Canned(vec![
//!     StreamEvent::TextDelta("Blue.".into()),
//!     StreamEvent::Completed(Response {
//!         id: "resp-1".into(),
//!         output: vec![OutputItem::Text { text: "Blue.".into() }],
//!     }),
//! ])));
//!
//! let seen = std::rc::Rc::new(std::cell::RefCell::new(String::new()));
//! let sink = std::rc::Rc::clone(&seen);
//! ctx.events.on(Channel::Text, move |e| {
//!     if let Event::Text(t) = e {
//!         sink.borrow_mut().push_str(t);
//!     }
//! });
//!
//! graph.run(&start, &mut ctx).unwrap();
//! assert_eq!(seen.borrow().as_str(), "Blue.");
//! assert!(!ctx.running);
//! ```

mod cancel;
mod context;
mod events;
mod graph;
mod llm;
mod node;
mod openai;
mod provider;
mod tool;
pub mod tools;

pub use cancel::CancelToken;
pub use context::{ProcessContext, RESERVED_KEYS};
pub use events::{Channel, Event, EventEmitter};
pub use graph::{Graph, GraphBuilder, GraphError};
pub use llm::{CallInput, CallOptions, DEFAULT_MAX_ROUND_TRIPS, call_llm};
pub use node::{
    ExitGate, GateExpectation, GateKind, Node, NodeBuilder, NodeId, ROUTE_TOOL, STOP_TOOL,
};
pub use openai::OpenAiProvider;
pub use provider::{
    FunctionOutput, LlmRequest, Message, OutputItem, Provider, ProviderError, ProviderStream,
    RequestInput, Response, Role, StreamEvent, ToolChoice,
};
pub use tool::{ParamKind, ParamSpec, ToolArguments, ToolError, ToolFn, ToolRegistry, ToolSpec};
