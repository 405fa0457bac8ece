use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::context::{ProcessContext, RESERVED_KEYS};
use crate::llm::{CallOptions, DEFAULT_MAX_ROUND_TRIPS, call_llm};
use crate::provider::ToolChoice;
use crate::tool::ToolRegistry;

/// Name of the engine-registered tool the model calls to pick a successor.
pub const ROUTE_TOOL: &str = "route";
/// Name of the optional escalation tool. When registered, every node can
/// reach it regardless of its declared tool subset.
pub const STOP_TOOL: &str = "stop_request";

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique node identity. Generated once per node; stable for the
/// process lifetime. Names are for display, ids are for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    fn fresh() -> Self {
        NodeId(format!("node-{}", NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

// ---------------------------------------------------------------------------
// ExitGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    ShellCheck,
    FileCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateExpectation {
    Pass,
    Fail,
    Exists,
    NotExists,
}

/// Advisory completion condition, injected into the prompt and never
/// mechanically enforced by the engine. The target may contain `{key}`
/// placeholders resolved against the context data map at prompt-build
/// time.
#[derive(Debug, Clone)]
pub struct ExitGate {
    pub kind: GateKind,
    pub expect: GateExpectation,
    pub target: String,
}

impl ExitGate {
    pub fn shell_check(command: impl Into<String>, expect: GateExpectation) -> Self {
        Self {
            kind: GateKind::ShellCheck,
            expect,
            target: command.into(),
        }
    }

    pub fn file_check(path: impl Into<String>, expect: GateExpectation) -> Self {
        Self {
            kind: GateKind::FileCheck,
            expect,
            target: path.into(),
        }
    }

    fn describe(&self, ctx: &ProcessContext) -> String {
        let target = interpolate(&self.target, ctx);
        match (self.kind, self.expect) {
            (GateKind::ShellCheck, GateExpectation::Fail) => format!(
                "Exit gate: before routing onward, the shell command `{target}` should fail."
            ),
            (GateKind::ShellCheck, _) => format!(
                "Exit gate: before routing onward, the shell command `{target}` should pass."
            ),
            (GateKind::FileCheck, GateExpectation::NotExists) => {
                format!("Exit gate: before routing onward, the file `{target}` should not exist.")
            }
            (GateKind::FileCheck, _) => {
                format!("Exit gate: before routing onward, the file `{target}` should exist.")
            }
        }
    }
}

/// Fill `{key}` placeholders from the context data map, single pass.
/// Unknown and reserved keys stay literal.
fn interpolate(template: &str, ctx: &ProcessContext) -> String {
    let mut out = String::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let Some(close) = tail.find('}') else {
            out.push_str(tail);
            return out;
        };
        let key = &tail[1..close];
        match ctx.get(key) {
            Some(value) if !RESERVED_KEYS.contains(&key) => match value {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            },
            _ => out.push_str(&tail[..=close]),
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub target: NodeId,
    pub criteria: String,
}

type Hook = Box<dyn FnMut(&mut ProcessContext)>;

/// Operating guide prepended to every node's assembled instructions.
const OPERATING_GUIDE: &str = "\
You are executing one node of a directed graph. Gather any information you \
need with the available tools, then produce a clear user-facing answer. \
Treat the Context section below as trusted working memory; never reveal \
internal ids, tool names, or framework mechanics in your answer.";

/// One configured step of the graph: instructions, input, allowed tools,
/// routing table, pre/post hooks. Built via [`Node::builder`]; lives for
/// the process once registered into a graph.
pub struct Node {
    id: NodeId,
    name: String,
    instructions: String,
    input: Option<String>,
    overrides: Vec<(String, Value)>,
    allowed_tools: Option<Vec<String>>,
    exit_gate: Option<ExitGate>,
    pre: Option<Hook>,
    post: Option<Hook>,
    pub(crate) max_round_trips: usize,
    pub(crate) routes: Vec<Route>,
}

impl Node {
    pub fn builder(name: impl Into<String>) -> NodeBuilder {
        NodeBuilder {
            id: NodeId::fresh(),
            name: name.into(),
            instructions: String::new(),
            input: None,
            overrides: Vec::new(),
            allowed_tools: None,
            exit_gate: None,
            pre: None,
            post: None,
            max_round_trips: DEFAULT_MAX_ROUND_TRIPS,
            routes: Vec::new(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute this node. Reads everything it needs from the shared
    /// context; ordinary model and tool failures surface only on the
    /// error channel, never as return errors.
    pub fn execute(&mut self, ctx: &mut ProcessContext, registry: &mut ToolRegistry) {
        // Each node opens a fresh model conversation; semantic state
        // crosses nodes through the context, not the transcript.
        ctx.response_id = None;

        if let Some(pre) = &mut self.pre {
            pre(ctx);
        }

        let instructions = self.build_instructions(ctx);

        if self.routes.is_empty() {
            // Terminal node: the run loop halts after this execution.
            ctx.running = false;
        }

        let tools = self.resolve_tool_subset(registry);
        let input = self
            .input
            .clone()
            .unwrap_or_else(|| "Follow your instructions.".to_string());

        call_llm(
            ctx,
            registry,
            input,
            CallOptions {
                instructions: Some(instructions),
                tools,
                max_round_trips: self.max_round_trips,
                ..CallOptions::default()
            },
        );

        if ctx.paused {
            return;
        }

        self.resolve_route(ctx, registry);

        if let Some(post) = &mut self.post {
            post(ctx);
        }
    }

    fn resolve_route(&self, ctx: &mut ProcessContext, registry: &mut ToolRegistry) {
        match self.routes.len() {
            0 => {}
            // Exactly one declared route: deterministic, the model is
            // never asked.
            1 => ctx.next_node = Some(self.routes[0].target.clone()),
            _ => {
                if ctx.next_node.is_some() || !registry.has_tool(ROUTE_TOOL) {
                    return;
                }
                // The model answered without routing. One forced retry,
                // restricted to the route tool; failure is logged, not
                // raised, and a successor-less node halts the graph.
                call_llm(
                    ctx,
                    registry,
                    "Select the next node now by calling the route tool exactly \
                     once. Produce no other output.",
                    CallOptions {
                        instructions: Some(self.routing_menu()),
                        tools: Some(vec![ROUTE_TOOL.to_string()]),
                        tool_choice: Some(ToolChoice::Required),
                        max_round_trips: 2,
                        ..CallOptions::default()
                    },
                );
                if ctx.next_node.is_none() {
                    tracing::warn!(
                        node = %self.id,
                        name = %self.name,
                        "no route selected after forced retry; run will halt"
                    );
                }
            }
        }
    }

    /// Assemble the full instruction string for this execution: shared
    /// guide, node instructions, rendered context, local overrides,
    /// routing menu (model-routed nodes only), exit gate.
    fn build_instructions(&self, ctx: &ProcessContext) -> String {
        let mut out = String::from(OPERATING_GUIDE);

        if !self.instructions.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.instructions);
        }

        let rendered = ctx.render_data();
        let has_overrides = !self.overrides.is_empty();
        if !rendered.is_empty() || has_overrides {
            out.push_str("\n\nContext (key: value):\n");
            out.push_str(&rendered);
            for (key, value) in &self.overrides {
                if RESERVED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push_str(key);
                out.push_str(": ");
                out.push_str(&value);
                out.push('\n');
            }
        }

        if self.routes.len() > 1 {
            out.push_str("\n\n");
            out.push_str(&self.routing_menu());
        }

        if let Some(gate) = &self.exit_gate {
            out.push_str("\n\n");
            out.push_str(&gate.describe(ctx));
        }

        out
    }

    fn routing_menu(&self) -> String {
        let mut menu = String::from("Candidate next nodes:\n");
        for route in &self.routes {
            menu.push_str(&format!(
                "ID: {} criteria: {}\n",
                route.target, route.criteria
            ));
        }
        menu.push_str(
            "After your user-facing answer, call the route tool exactly once \
             with the chosen next_node_id. Only choose from the listed ids.",
        );
        menu
    }

    /// Nodes can never be configured to accidentally lack the routing or
    /// escalation tools: a declared subset is extended with both when they
    /// apply.
    fn resolve_tool_subset(&self, registry: &ToolRegistry) -> Option<Vec<String>> {
        let mut subset = self.allowed_tools.clone()?;
        if self.routes.len() > 1
            && registry.has_tool(ROUTE_TOOL)
            && !subset.iter().any(|n| n == ROUTE_TOOL)
        {
            subset.push(ROUTE_TOOL.to_string());
        }
        if registry.has_tool(STOP_TOOL) && !subset.iter().any(|n| n == STOP_TOOL) {
            subset.push(STOP_TOOL.to_string());
        }
        Some(subset)
    }
}

// ---------------------------------------------------------------------------
// NodeBuilder
// ---------------------------------------------------------------------------

/// Step-wise configuration for a [`Node`]; nothing observes the node until
/// [`NodeBuilder::build`]. The id exists from the start so mutually
/// routing nodes can reference each other before either is built.
pub struct NodeBuilder {
    id: NodeId,
    name: String,
    instructions: String,
    input: Option<String>,
    overrides: Vec<(String, Value)>,
    allowed_tools: Option<Vec<String>>,
    exit_gate: Option<ExitGate>,
    pre: Option<Hook>,
    post: Option<Hook>,
    max_round_trips: usize,
    routes: Vec<Route>,
}

impl NodeBuilder {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Append to the node's instructions. Composition is append-only:
    /// calling twice concatenates.
    pub fn instructions(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !self.instructions.is_empty() {
            self.instructions.push_str("\n\n");
        }
        self.instructions.push_str(&text);
        self
    }

    /// Literal input message for this node. Without one, a generic
    /// "follow your instructions" message is sent.
    pub fn input(mut self, text: impl Into<String>) -> Self {
        self.input = Some(text.into());
        self
    }

    /// Local context override rendered into this node's prompt only.
    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Restrict this node to a named tool subset. The routing and stop
    /// tools are always re-added when they apply.
    pub fn tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn exit_gate(mut self, gate: ExitGate) -> Self {
        self.exit_gate = Some(gate);
        self
    }

    pub fn pre(mut self, hook: impl FnMut(&mut ProcessContext) + 'static) -> Self {
        self.pre = Some(Box::new(hook));
        self
    }

    pub fn post(mut self, hook: impl FnMut(&mut ProcessContext) + 'static) -> Self {
        self.post = Some(Box::new(hook));
        self
    }

    /// Per-node round-trip budget. Validated (must be positive) when the
    /// graph is built.
    pub fn max_round_trips(mut self, max: usize) -> Self {
        self.max_round_trips = max;
        self
    }

    /// Declare a candidate successor with a natural-language criterion
    /// describing when to choose it.
    pub fn route(mut self, target: impl Into<NodeId>, criteria: impl Into<String>) -> Self {
        self.routes.push(Route {
            target: target.into(),
            criteria: criteria.into(),
        });
        self
    }

    pub fn build(self) -> Node {
        Node {
            id: self.id,
            name: self.name,
            instructions: self.instructions,
            input: self.input,
            overrides: self.overrides,
            allowed_tools: self.allowed_tools,
            exit_gate: self.exit_gate,
            pre: self.pre,
            post: self.post,
            max_round_trips: self.max_round_trips,
            routes: self.routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        LlmRequest, OutputItem, Provider, ProviderError, ProviderStream, Response, StreamEvent,
    };
    use crate::tool::ToolSpec;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct ScriptedProvider {
        scripts: Vec<Vec<StreamEvent>>,
        requests: Rc<RefCell<Vec<LlmRequest>>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Vec<StreamEvent>>) -> (Self, Rc<RefCell<Vec<LlmRequest>>>) {
            let requests = Rc::new(RefCell::new(Vec::new()));
            (
                Self {
                    scripts,
                    requests: Rc::clone(&requests),
                },
                requests,
            )
        }
    }

    impl Provider for ScriptedProvider {
        fn stream(&mut self, request: &LlmRequest) -> Result<ProviderStream, ProviderError> {
            self.requests.borrow_mut().push(request.clone());
            if self.scripts.is_empty() {
                return Err(ProviderError::new("script exhausted"));
            }
            Ok(Box::new(self.scripts.remove(0).into_iter().map(Ok)))
        }
    }

    fn plain_answer(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Created {
                response_id: "resp".into(),
            },
            StreamEvent::Completed(Response {
                id: "resp".into(),
                output: vec![OutputItem::Text { text: text.into() }],
            }),
        ]
    }

    fn route_call(target: &NodeId) -> Vec<StreamEvent> {
        vec![StreamEvent::Completed(Response {
            id: "resp".into(),
            output: vec![OutputItem::FunctionCall {
                call_id: "call-route".into(),
                name: ROUTE_TOOL.into(),
                arguments: format!(r#"{{"next_node_id": "{target}"}}"#),
            }],
        })]
    }

    fn register_route_tool(registry: &mut ToolRegistry) {
        registry
            .register(
                ToolSpec::new(ROUTE_TOOL, "Record the next node")
                    .param("next_node_id", crate::tool::ParamKind::String),
                |ctx, args| {
                    if let Some(id) = args["next_node_id"].as_str() {
                        ctx.next_node = Some(NodeId::from(id));
                    }
                    Ok(json!({"status": "ok"}))
                },
            )
            .unwrap();
    }

    // --- builder ---

    #[test]
    fn instructions_compose_append_only() {
        let node = Node::builder("n")
            .instructions("Base rules.")
            .instructions("Specific rules.")
            .build();
        assert_eq!(node.instructions, "Base rules.\n\nSpecific rules.");
    }

    #[test]
    fn ids_are_unique_and_available_before_build() {
        let a = Node::builder("a");
        let b = Node::builder("b");
        assert_ne!(a.id(), b.id());
        let id = a.id().clone();
        assert_eq!(a.build().id(), &id);
    }

    // --- prompt assembly ---

    #[test]
    fn prompt_carries_context_and_overrides_but_not_reserved_keys() {
        let mut ctx = ProcessContext::new();
        ctx.set("user_query", "weather?");
        ctx.set("response_id", "leak");
        let node = Node::builder("n").context("style", "pirate").build();

        let prompt = node.build_instructions(&ctx);
        assert!(prompt.contains("user_query: weather?"));
        assert!(prompt.contains("style: pirate"));
        assert!(!prompt.contains("leak"));
    }

    #[test]
    fn routing_menu_rendered_only_for_model_routed_nodes() {
        let ctx = ProcessContext::new();
        let single = Node::builder("s").route(NodeId::from("node-x"), "always").build();
        assert!(!single.build_instructions(&ctx).contains("route tool"));

        let multi = Node::builder("m")
            .route(NodeId::from("node-x"), "on success")
            .route(NodeId::from("node-y"), "on failure")
            .build();
        let prompt = multi.build_instructions(&ctx);
        assert!(prompt.contains("ID: node-x criteria: on success"));
        assert!(prompt.contains("route tool exactly once"));
    }

    #[test]
    fn exit_gate_interpolates_context_placeholders() {
        let mut ctx = ProcessContext::new();
        ctx.set("test_file", "tests/test_app.py");
        let node = Node::builder("n")
            .exit_gate(ExitGate::shell_check(
                "pytest {test_file}",
                GateExpectation::Pass,
            ))
            .build();

        let prompt = node.build_instructions(&ctx);
        assert!(prompt.contains("`pytest tests/test_app.py` should pass"));
    }

    #[test]
    fn file_gate_not_exists_wording() {
        let ctx = ProcessContext::new();
        let gate = ExitGate::file_check("stale.lock", GateExpectation::NotExists);
        assert!(gate.describe(&ctx).contains("should not exist"));
    }

    // --- tool subset ---

    #[test]
    fn declared_subset_is_extended_with_route_and_stop() {
        let mut registry = ToolRegistry::new();
        register_route_tool(&mut registry);
        registry
            .register(ToolSpec::new(STOP_TOOL, "Escalate"), |_ctx, _| Ok(json!(null)))
            .unwrap();

        let node = Node::builder("n")
            .tools(["search"])
            .route(NodeId::from("a"), "first")
            .route(NodeId::from("b"), "second")
            .build();

        let subset = node.resolve_tool_subset(&registry).unwrap();
        assert_eq!(subset, vec!["search", ROUTE_TOOL, STOP_TOOL]);
    }

    #[test]
    fn no_declared_subset_means_all_tools() {
        let registry = ToolRegistry::new();
        let node = Node::builder("n").build();
        assert!(node.resolve_tool_subset(&registry).is_none());
    }

    // --- execution ---

    #[test]
    fn terminal_node_halts_the_run() {
        let mut ctx = ProcessContext::new();
        ctx.running = true;
        let mut registry = ToolRegistry::new();
        let (provider, _) = ScriptedProvider::new(vec![plain_answer("done")]);
        ctx.set_provider(Box::new(provider));

        Node::builder("end").build().execute(&mut ctx, &mut registry);
        assert!(!ctx.running);
        assert!(ctx.next_node.is_none());
    }

    #[test]
    fn single_route_resolves_without_asking_the_model() {
        let mut ctx = ProcessContext::new();
        ctx.running = true;
        let mut registry = ToolRegistry::new();
        register_route_tool(&mut registry);
        let target = NodeId::from("node-next");
        let (provider, requests) = ScriptedProvider::new(vec![plain_answer("done")]);
        ctx.set_provider(Box::new(provider));

        Node::builder("first")
            .route(target.clone(), "always")
            .build()
            .execute(&mut ctx, &mut registry);

        assert_eq!(ctx.next_node, Some(target));
        // exactly one model call: the node's own work, no routing call
        assert_eq!(requests.borrow().len(), 1);
    }

    #[test]
    fn forced_routing_retry_is_restricted_to_the_route_tool() {
        let mut ctx = ProcessContext::new();
        ctx.running = true;
        let mut registry = ToolRegistry::new();
        register_route_tool(&mut registry);
        let target = NodeId::from("node-b");

        // First call answers without routing; the forced retry routes,
        // then acknowledges the tool output.
        let (provider, requests) = ScriptedProvider::new(vec![
            plain_answer("answered but forgot to route"),
            route_call(&target),
            plain_answer("routed"),
        ]);
        ctx.set_provider(Box::new(provider));

        Node::builder("chooser")
            .route(NodeId::from("node-a"), "first option")
            .route(target.clone(), "second option")
            .build()
            .execute(&mut ctx, &mut registry);

        assert_eq!(ctx.next_node, Some(target));
        let requests = requests.borrow();
        assert!(requests.len() >= 2);
        let forced = &requests[1];
        assert_eq!(forced.tool_choice, Some(ToolChoice::Required));
        assert_eq!(forced.tools.len(), 1);
        assert_eq!(forced.tools[0]["name"], ROUTE_TOOL);
    }

    #[test]
    fn routing_failure_after_retry_leaves_no_successor() {
        let mut ctx = ProcessContext::new();
        ctx.running = true;
        let mut registry = ToolRegistry::new();
        register_route_tool(&mut registry);

        // The model never routes, even when forced.
        let (provider, _) = ScriptedProvider::new(vec![
            plain_answer("no route"),
            plain_answer("still no route"),
        ]);
        ctx.set_provider(Box::new(provider));

        Node::builder("chooser")
            .route(NodeId::from("node-a"), "first")
            .route(NodeId::from("node-b"), "second")
            .build()
            .execute(&mut ctx, &mut registry);

        assert!(ctx.next_node.is_none());
        assert!(ctx.running, "routing failure is not an interrupt");
    }

    #[test]
    fn pre_and_post_hooks_bracket_execution() {
        let mut ctx = ProcessContext::new();
        ctx.running = true;
        let mut registry = ToolRegistry::new();
        let (provider, _) = ScriptedProvider::new(vec![plain_answer("ok")]);
        ctx.set_provider(Box::new(provider));

        let order = Rc::new(RefCell::new(Vec::new()));
        let pre_order = Rc::clone(&order);
        let post_order = Rc::clone(&order);

        Node::builder("hooked")
            .pre(move |ctx| {
                ctx.set("seeded", true);
                pre_order.borrow_mut().push("pre");
            })
            .post(move |_ctx| post_order.borrow_mut().push("post"))
            .build()
            .execute(&mut ctx, &mut registry);

        assert_eq!(*order.borrow(), vec!["pre", "post"]);
        assert_eq!(ctx.get("seeded"), Some(&json!(true)));
    }

    #[test]
    fn execution_clears_the_previous_conversation() {
        let mut ctx = ProcessContext::new();
        ctx.running = true;
        ctx.response_id = Some("stale".into());
        let mut registry = ToolRegistry::new();
        let (provider, requests) = ScriptedProvider::new(vec![plain_answer("ok")]);
        ctx.set_provider(Box::new(provider));

        Node::builder("fresh").build().execute(&mut ctx, &mut registry);
        assert_eq!(requests.borrow()[0].previous_response_id, None);
    }

    #[test]
    fn interrupted_node_skips_routing_and_post() {
        let mut ctx = ProcessContext::new();
        ctx.running = true;
        ctx.cancel.cancel();
        let mut registry = ToolRegistry::new();
        let (provider, _) = ScriptedProvider::new(vec![plain_answer("never")]);
        ctx.set_provider(Box::new(provider));

        let ran_post = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&ran_post);

        Node::builder("interrupted")
            .route(NodeId::from("node-a"), "always")
            .post(move |_| *flag.borrow_mut() = true)
            .build()
            .execute(&mut ctx, &mut registry);

        assert!(ctx.paused);
        assert!(!ctx.running);
        assert!(ctx.next_node.is_none());
        assert!(!*ran_post.borrow());
    }

    // --- interpolation ---

    #[test]
    fn interpolate_leaves_unknown_placeholders_alone() {
        let mut ctx = ProcessContext::new();
        ctx.set("known", "value");
        assert_eq!(interpolate("a {known} b", &ctx), "a value b");
        assert_eq!(interpolate("a {unknown} b", &ctx), "a {unknown} b");
    }
}
