use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::cancel::CancelToken;
use crate::events::EventEmitter;
use crate::node::NodeId;
use crate::provider::Provider;

/// Data-map keys that must never be rendered into a prompt, even when a
/// host stores a like-named entry. Keeps runtime handles away from the
/// model.
pub const RESERVED_KEYS: &[&str] = &[
    "nodes",
    "client",
    "model",
    "running",
    "events",
    "response_id",
    "next_node",
    "paused",
    "cancel",
    "cwd",
];

/// Shared mutable state for one run: reserved engine fields plus a
/// free-form data map every node's prompt can see.
///
/// A single `ProcessContext` is handed by `&mut` to every node and to the
/// call loop. Execution is single-threaded, so no locking; but event
/// callbacks fire synchronously mid-mutation, so a callback must not
/// assume it observes a set of field writes atomically.
pub struct ProcessContext {
    /// The run loop continues while this is true.
    pub running: bool,
    /// Set when an interrupt paused the run mid-node.
    pub paused: bool,
    /// Conversation continuation token, owned by the provider. Cleared at
    /// the start of each node; captured from the stream's created event.
    pub response_id: Option<String>,
    /// The node the run loop should execute next, written by the route
    /// tool (or deterministically for single-route nodes).
    pub next_node: Option<NodeId>,
    /// Filesystem root used by tools.
    pub cwd: PathBuf,
    pub events: EventEmitter,
    pub cancel: CancelToken,
    provider: Option<Box<dyn Provider>>,
    data: HashMap<String, Value>,
}

impl ProcessContext {
    pub fn new() -> Self {
        Self {
            running: false,
            paused: false,
            response_id: None,
            next_node: None,
            cwd: PathBuf::from("."),
            events: EventEmitter::new(),
            cancel: CancelToken::new(),
            provider: None,
            data: HashMap::new(),
        }
    }

    /// Install the LLM connection handle. Later installs replace earlier
    /// ones; the engine itself only installs lazily, once.
    pub fn set_provider(&mut self, provider: Box<dyn Provider>) {
        self.provider = Some(provider);
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// Borrow the provider out of the context for the duration of a call,
    /// so the call loop can hold it while tools mutate the rest of the
    /// context. Pair with [`ProcessContext::put_provider`].
    pub(crate) fn take_provider(&mut self) -> Option<Box<dyn Provider>> {
        self.provider.take()
    }

    pub(crate) fn put_provider(&mut self, provider: Box<dyn Provider>) {
        self.provider = Some(provider);
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Convenience accessor for string-valued data.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Render the data map as `key: value` lines for prompt injection,
    /// skipping every reserved key. Keys are sorted so two renders of the
    /// same map are identical.
    pub fn render_data(&self) -> String {
        let mut keys: Vec<&String> = self
            .data
            .keys()
            .filter(|k| !RESERVED_KEYS.contains(&k.as_str()))
            .collect();
        keys.sort();

        let mut out = String::new();
        for key in keys {
            let value = &self.data[key];
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(key);
            out.push_str(": ");
            out.push_str(&rendered);
            out.push('\n');
        }
        out
    }

    /// Clear everything except the keep-list: `running`, the emitter, the
    /// cancel token, the working directory and the provider survive.
    pub fn reset(&mut self) {
        self.data.clear();
        self.response_id = None;
        self.next_node = None;
        self.paused = false;
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_remove_round_trip() {
        let mut ctx = ProcessContext::new();
        ctx.set("name", "alice");
        assert_eq!(ctx.get_str("name"), Some("alice"));
        assert_eq!(ctx.remove("name"), Some(json!("alice")));
        assert!(ctx.get("name").is_none());
    }

    #[test]
    fn render_skips_reserved_keys() {
        let mut ctx = ProcessContext::new();
        ctx.set("user_query", "what is the weather");
        for key in RESERVED_KEYS {
            ctx.set(*key, "leaked handle");
        }

        let rendered = ctx.render_data();
        assert!(rendered.contains("user_query: what is the weather"));
        for key in RESERVED_KEYS {
            assert!(
                !rendered.contains(&format!("{key}:")),
                "reserved key {key} leaked into prompt"
            );
        }
    }

    #[test]
    fn render_is_sorted_and_stable() {
        let mut ctx = ProcessContext::new();
        ctx.set("b", 2);
        ctx.set("a", 1);
        assert_eq!(ctx.render_data(), "a: 1\nb: 2\n");
        assert_eq!(ctx.render_data(), ctx.render_data());
    }

    #[test]
    fn render_unquotes_strings_only() {
        let mut ctx = ProcessContext::new();
        ctx.set("text", "plain");
        ctx.set("count", 3);
        ctx.set("flags", json!({"a": true}));
        let rendered = ctx.render_data();
        assert!(rendered.contains("text: plain\n"));
        assert!(rendered.contains("count: 3\n"));
        assert!(rendered.contains("flags: {\"a\":true}\n"));
    }

    #[test]
    fn reset_keeps_running_and_clears_the_rest() {
        let mut ctx = ProcessContext::new();
        ctx.running = true;
        ctx.paused = true;
        ctx.response_id = Some("resp-1".into());
        ctx.next_node = Some(NodeId::from("node-1"));
        ctx.set("user_query", "hi");

        ctx.reset();

        assert!(ctx.running);
        assert!(!ctx.paused);
        assert!(ctx.response_id.is_none());
        assert!(ctx.next_node.is_none());
        assert!(ctx.get("user_query").is_none());
    }
}
