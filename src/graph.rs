use std::collections::HashSet;
use std::fmt;

use serde_json::json;

use crate::context::ProcessContext;
use crate::node::{Node, NodeId, ROUTE_TOOL};
use crate::tool::{ParamKind, ToolError, ToolFn, ToolRegistry, ToolSpec};

// ---------------------------------------------------------------------------
// GraphError
// ---------------------------------------------------------------------------

/// Configuration mistakes. Unlike model and tool failures these are raised
/// directly and meant to be fatal/user-visible.
#[derive(Debug)]
pub enum GraphError {
    /// `run` was called on a graph with no nodes.
    Empty,
    /// The start node was never registered into this graph.
    NotAMember(NodeId),
    /// A route points at a node id that is not registered.
    UnknownRoute { node: String, target: NodeId },
    /// A node's round-trip budget is zero.
    InvalidBudget(String),
    /// Two tools were registered under the same name.
    DuplicateTool(String),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "graph has no nodes to run"),
            Self::NotAMember(id) => {
                write!(f, "starting node {id} is not a member of this graph")
            }
            Self::UnknownRoute { node, target } => {
                write!(f, "node '{node}' routes to unknown node {target}")
            }
            Self::InvalidBudget(name) => {
                write!(f, "node '{name}' has a zero round-trip budget")
            }
            Self::DuplicateTool(name) => write!(f, "duplicate tool name: {name}"),
        }
    }
}

impl std::error::Error for GraphError {}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    tools: Vec<(ToolSpec, ToolFn)>,
}

impl GraphBuilder {
    pub fn register(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Queue a domain tool for registration at build time.
    pub fn tool(
        mut self,
        spec: ToolSpec,
        func: impl FnMut(&mut ProcessContext, serde_json::Value) -> Result<serde_json::Value, ToolError>
        + 'static,
    ) -> Self {
        self.tools.push((spec, Box::new(func)));
        self
    }

    /// Validate and assemble the graph. All configuration errors surface
    /// here, not mid-chain: unknown route targets, zero budgets, duplicate
    /// tool names.
    pub fn build(self) -> Result<Graph, GraphError> {
        let ids: HashSet<&NodeId> = self.nodes.iter().map(|n| n.id()).collect();

        for node in &self.nodes {
            if node.max_round_trips == 0 {
                return Err(GraphError::InvalidBudget(node.name().to_string()));
            }
            for route in &node.routes {
                if !ids.contains(&route.target) {
                    return Err(GraphError::UnknownRoute {
                        node: node.name().to_string(),
                        target: route.target.clone(),
                    });
                }
            }
        }

        let mut registry = ToolRegistry::new();
        register_route_tool(&mut registry);
        for (spec, func) in self.tools {
            let name = spec.name.clone();
            registry
                .register(spec, func)
                .map_err(|_| GraphError::DuplicateTool(name))?;
        }

        Ok(Graph {
            name: self.name,
            nodes: self.nodes,
            registry,
        })
    }
}

/// The engine's routing tool: records the model's chosen successor into
/// the shared context. Replaces any previous registration under the name.
fn register_route_tool(registry: &mut ToolRegistry) {
    let spec = ToolSpec::new(ROUTE_TOOL, "Select the next node of the graph to execute.")
        .param("next_node_id", ParamKind::String)
        .describe("Id of the chosen next node, copied from the candidate list")
        .optional("rationale", ParamKind::String, serde_json::Value::Null)
        .describe("Brief, factual reason referencing the matched criterion");

    let result = registry.register_with(
        spec,
        |ctx, args| {
            let Some(id) = args["next_node_id"].as_str() else {
                return Err(ToolError::failed("next_node_id is required"));
            };
            ctx.next_node = Some(NodeId::from(id));
            if let Some(rationale) = args["rationale"].as_str() {
                tracing::debug!(next_node = id, rationale, "route selected");
            }
            Ok(json!({"status": "ok", "next_node_id": id}))
        },
        true,
    );
    debug_assert!(result.is_ok());
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// The node set plus the drive loop. The graph is a thin trampoline: every
/// routing decision is written into the shared context by the node that
/// just executed (or by the route tool the model invoked); the graph only
/// looks the successor up and keeps going.
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    registry: ToolRegistry,
}

impl Graph {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            name: name.into(),
            nodes: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// The registry backing this graph, for hosts that register or replace
    /// tools after build.
    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    /// Execute from `start` until no successor remains or the run is
    /// halted. Returns only configuration errors; everything that happens
    /// mid-run flows through the context's event emitter and flags.
    pub fn run(&mut self, start: &NodeId, ctx: &mut ProcessContext) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }
        if self.position(start).is_none() {
            return Err(GraphError::NotAMember(start.clone()));
        }

        tracing::debug!(graph = %self.name, start = %start, "run starting");
        ctx.running = true;
        ctx.paused = false;
        ctx.next_node = Some(start.clone());

        while ctx.running {
            let Some(id) = ctx.next_node.take() else {
                ctx.running = false;
                break;
            };
            let Some(index) = self.position(&id) else {
                // The model invented an id the menu never offered.
                tracing::warn!(graph = %self.name, node = %id, "next node is not a member; halting");
                ctx.running = false;
                break;
            };
            let node = &mut self.nodes[index];
            tracing::debug!(graph = %self.name, node = %id, name = node.name(), "executing node");
            node.execute(ctx, &mut self.registry);
        }
        Ok(())
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        LlmRequest, OutputItem, Provider, ProviderError, ProviderStream, Response, StreamEvent,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    struct ScriptedProvider {
        scripts: Vec<Vec<StreamEvent>>,
    }

    impl Provider for ScriptedProvider {
        fn stream(&mut self, _request: &LlmRequest) -> Result<ProviderStream, ProviderError> {
            if self.scripts.is_empty() {
                return Err(ProviderError::new("script exhausted"));
            }
            Ok(Box::new(self.scripts.remove(0).into_iter().map(Ok)))
        }
    }

    fn plain_answer(text: &str) -> Vec<StreamEvent> {
        vec![StreamEvent::Completed(Response {
            id: "resp".into(),
            output: vec![OutputItem::Text { text: text.into() }],
        })]
    }

    fn route_call(target: &str) -> Vec<StreamEvent> {
        vec![StreamEvent::Completed(Response {
            id: "resp".into(),
            output: vec![OutputItem::FunctionCall {
                call_id: "call-route".into(),
                name: ROUTE_TOOL.into(),
                arguments: format!(r#"{{"next_node_id": "{target}"}}"#),
            }],
        })]
    }

    fn scripted_ctx(scripts: Vec<Vec<StreamEvent>>) -> ProcessContext {
        let mut ctx = ProcessContext::new();
        ctx.set_provider(Box::new(ScriptedProvider { scripts }));
        ctx
    }

    /// Track execution order through pre hooks.
    fn tracked_node(name: &'static str, order: &Rc<RefCell<Vec<&'static str>>>) -> crate::node::NodeBuilder {
        let order = Rc::clone(order);
        Node::builder(name).pre(move |_| order.borrow_mut().push(name))
    }

    // --- build validation ---

    #[test]
    fn build_installs_the_route_tool() {
        let mut graph = Graph::builder("test").register(Node::builder("only").build()).build().unwrap();
        assert!(graph.registry_mut().has_tool(ROUTE_TOOL));
    }

    #[test]
    fn unknown_route_target_rejected_at_build() {
        let node = Node::builder("a").route(NodeId::from("node-missing"), "always").build();
        let err = Graph::builder("test").register(node).build().err().unwrap();
        assert!(matches!(err, GraphError::UnknownRoute { target, .. } if target.as_str() == "node-missing"));
    }

    #[test]
    fn zero_budget_rejected_at_build() {
        let node = Node::builder("a").max_round_trips(0).build();
        let err = Graph::builder("test").register(node).build().err().unwrap();
        assert!(matches!(err, GraphError::InvalidBudget(name) if name == "a"));
    }

    #[test]
    fn duplicate_tool_rejected_at_build() {
        let err = Graph::builder("test")
            .register(Node::builder("a").build())
            .tool(ToolSpec::new("echo", ""), |_ctx, args| Ok(args))
            .tool(ToolSpec::new("echo", ""), |_ctx, args| Ok(args))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, GraphError::DuplicateTool(name) if name == "echo"));
    }

    // --- run preconditions ---

    #[test]
    fn empty_graph_fails_for_any_start() {
        let mut graph = Graph::builder("test").build().unwrap();
        let mut ctx = ProcessContext::new();
        let err = graph.run(&NodeId::from("node-1"), &mut ctx).err().unwrap();
        assert!(matches!(err, GraphError::Empty));
    }

    #[test]
    fn unregistered_start_fails_fast() {
        let mut graph = Graph::builder("test")
            .register(Node::builder("member").build())
            .build()
            .unwrap();
        let mut ctx = ProcessContext::new();
        let outsider = Node::builder("outsider").build();
        let err = graph.run(outsider.id(), &mut ctx).err().unwrap();
        assert!(matches!(err, GraphError::NotAMember(id) if &id == outsider.id()));
    }

    // --- drive loop ---

    #[test]
    fn two_node_run_executes_exactly_first_then_second() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let second = tracked_node("second", &order).build();
        let first = tracked_node("first", &order)
            .route(second.id().clone(), "always")
            .build();
        let start = first.id().clone();

        let mut ctx = scripted_ctx(vec![plain_answer("first done"), plain_answer("second done")]);
        let mut graph = Graph::builder("pair").register(first).register(second).build().unwrap();

        graph.run(&start, &mut ctx).unwrap();

        assert_eq!(*order.borrow(), vec!["first", "second"]);
        assert!(!ctx.running, "terminal node halts the run");
        assert!(ctx.next_node.is_none());
    }

    #[test]
    fn model_routed_choice_reaches_the_chosen_node() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let yes = tracked_node("yes", &order).build();
        let no = tracked_node("no", &order).build();
        let yes_id = yes.id().clone();

        let chooser = tracked_node("chooser", &order)
            .route(yes.id().clone(), "when the answer is yes")
            .route(no.id().clone(), "when the answer is no")
            .build();
        let start = chooser.id().clone();

        // chooser routes via the route tool, then acknowledges; `yes` answers.
        let mut ctx = scripted_ctx(vec![
            route_call(yes_id.as_str()),
            plain_answer("routed"),
            plain_answer("yes it is"),
        ]);
        let mut graph = Graph::builder("branch")
            .register(chooser)
            .register(yes)
            .register(no)
            .build()
            .unwrap();

        graph.run(&start, &mut ctx).unwrap();
        assert_eq!(*order.borrow(), vec!["chooser", "yes"]);
    }

    #[test]
    fn invented_next_node_id_halts_cleanly() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let left = tracked_node("left", &order).build();
        let right = tracked_node("right", &order).build();
        let chooser = tracked_node("chooser", &order)
            .route(left.id().clone(), "usually")
            .route(right.id().clone(), "sometimes")
            .build();
        let start = chooser.id().clone();

        // The model names an id the menu never offered.
        let mut ctx = scripted_ctx(vec![route_call("node-99999"), plain_answer("routed")]);
        let mut graph = Graph::builder("halt")
            .register(chooser)
            .register(left)
            .register(right)
            .build()
            .unwrap();

        graph.run(&start, &mut ctx).unwrap();
        assert_eq!(*order.borrow(), vec!["chooser"]);
        assert!(!ctx.running);
    }

    #[test]
    fn interrupt_stops_before_the_next_node() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let second = tracked_node("second", &order).build();
        let tracker = Rc::clone(&order);
        let cancel_in_pre = Node::builder("first")
            .route(second.id().clone(), "always")
            .pre(move |ctx| {
                tracker.borrow_mut().push("first");
                ctx.cancel.cancel();
            })
            .build();
        let start = cancel_in_pre.id().clone();

        let mut ctx = scripted_ctx(vec![plain_answer("never streamed")]);
        let mut graph = Graph::builder("interrupted")
            .register(cancel_in_pre)
            .register(second)
            .build()
            .unwrap();

        graph.run(&start, &mut ctx).unwrap();

        assert!(ctx.paused);
        assert!(!ctx.running);
        assert_eq!(*order.borrow(), vec!["first"], "no further node is entered");
    }

    #[test]
    fn domain_tools_registered_via_builder_are_callable() {
        let mut graph = Graph::builder("tools")
            .register(Node::builder("n").build())
            .tool(ToolSpec::new("echo", "Echo"), |_ctx, args| Ok(args))
            .build()
            .unwrap();

        let mut ctx = ProcessContext::new();
        let result = graph
            .registry_mut()
            .call(&mut ctx, "echo", serde_json::json!({"x": 1}))
            .unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));
    }

    #[test]
    fn route_tool_records_the_successor() {
        let mut graph = Graph::builder("t").register(Node::builder("n").build()).build().unwrap();
        let mut ctx = ProcessContext::new();
        graph
            .registry_mut()
            .call(&mut ctx, ROUTE_TOOL, r#"{"next_node_id": "node-7", "rationale": "best match"}"#)
            .unwrap();
        assert_eq!(ctx.next_node, Some(NodeId::from("node-7")));
    }

    #[test]
    fn route_tool_requires_an_id() {
        let mut graph = Graph::builder("t").register(Node::builder("n").build()).build().unwrap();
        let mut ctx = ProcessContext::new();
        let err = graph.registry_mut().call(&mut ctx, ROUTE_TOOL, "{}").err().unwrap();
        assert!(err.to_string().contains("next_node_id"));
        assert!(ctx.next_node.is_none());
    }

    #[test]
    fn node_lookup_by_id() {
        let node = Node::builder("findme").build();
        let id = node.id().clone();
        let graph = Graph::builder("t").register(node).build().unwrap();
        assert_eq!(graph.node(&id).map(|n| n.name()), Some("findme"));
        assert!(graph.node(&NodeId::from("node-0")).is_none());
    }
}
