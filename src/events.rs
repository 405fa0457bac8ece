use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

/// The named channels the engine publishes on. No other channels exist;
/// subscribing to one an emitter never fires is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A streamed fragment of model output text.
    Text,
    /// A tool is about to execute.
    ToolCall,
    /// A tool finished; carries the name and the result.
    ToolResult,
    /// A human-readable failure. Budget exhaustion, tool errors, provider
    /// errors and interruption all land here rather than propagating.
    Error,
    /// A round trip is starting.
    Start,
    /// A round trip finished.
    End,
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    Text(String),
    ToolCall { name: String },
    ToolResult { name: String, result: Value },
    Error(String),
    Start { round: usize },
    End { round: usize },
}

impl Event {
    pub fn channel(&self) -> Channel {
        match self {
            Event::Text(_) => Channel::Text,
            Event::ToolCall { .. } => Channel::ToolCall,
            Event::ToolResult { .. } => Channel::ToolResult,
            Event::Error(_) => Channel::Error,
            Event::Start { .. } => Channel::Start,
            Event::End { .. } => Channel::End,
        }
    }
}

type Callback = Rc<RefCell<dyn FnMut(&Event)>>;

/// Synchronous publish/subscribe for UI-facing side effects.
///
/// Subscribers fire in subscription order, on the emitting thread. Nothing
/// is swallowed: a panicking subscriber propagates. A subscriber may emit
/// further events (the subscriber list is snapshotted before firing), but
/// re-entering the same callback panics on the interior borrow.
#[derive(Clone, Default)]
pub struct EventEmitter {
    subscribers: Rc<RefCell<HashMap<Channel, Vec<Callback>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, channel: Channel, callback: impl FnMut(&Event) + 'static) {
        self.subscribers
            .borrow_mut()
            .entry(channel)
            .or_default()
            .push(Rc::new(RefCell::new(callback)));
    }

    pub fn emit(&self, event: &Event) {
        let snapshot: Vec<Callback> = match self.subscribers.borrow().get(&event.channel()) {
            Some(list) => list.to_vec(),
            None => return,
        };
        for callback in snapshot {
            (callback.borrow_mut())(event);
        }
    }
}
