use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Value, json};

use crate::context::ProcessContext;

// ---------------------------------------------------------------------------
// ToolError
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ToolError {
    /// Registration under a name that is already taken.
    Duplicate(String),
    /// Invocation of a name that was never registered.
    NotFound(String),
    /// The tool body itself failed. The call loop converts this into an
    /// error event plus an error-tagged result; it never aborts a round.
    Failed(String),
}

impl ToolError {
    /// Create a [`Failed`](ToolError::Failed) error from inside a tool body.
    pub fn failed(msg: impl Into<String>) -> Self {
        ToolError::Failed(msg.into())
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate(name) => write!(f, "tool '{name}' is already registered"),
            Self::NotFound(name) => write!(f, "tool '{name}' not found"),
            Self::Failed(msg) => write!(f, "tool failed: {msg}"),
        }
    }
}

impl std::error::Error for ToolError {}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::Failed(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// ToolSpec — explicit schema, built once at registration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    /// Unannotated parameter; advertised without a type constraint.
    Any,
}

impl ParamKind {
    fn json_type(self) -> Option<&'static str> {
        match self {
            ParamKind::String => Some("string"),
            ParamKind::Integer => Some("integer"),
            ParamKind::Number => Some("number"),
            ParamKind::Boolean => Some("boolean"),
            ParamKind::Object => Some("object"),
            ParamKind::Array => Some("array"),
            ParamKind::Any => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    /// Present iff the parameter is optional.
    pub default: Option<Value>,
    pub description: Option<String>,
}

/// Declarative description of a tool's call surface. Replaces signature
/// introspection: the schema is stated once, rendered once.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    params: Vec<ParamSpec>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    /// Declare a required parameter.
    pub fn param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            default: None,
            description: None,
        });
        self
    }

    /// Declare an optional parameter with a default.
    pub fn optional(mut self, name: impl Into<String>, kind: ParamKind, default: Value) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            default: Some(default),
            description: None,
        });
        self
    }

    /// Attach a description to the most recently declared parameter.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        if let Some(last) = self.params.last_mut() {
            last.description = Some(text.into());
        }
        self
    }

    /// Render the provider-facing function-tool schema.
    pub fn schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &self.params {
            let mut prop = Map::new();
            if let Some(ty) = param.kind.json_type() {
                prop.insert("type".into(), json!(ty));
            }
            if let Some(desc) = &param.description {
                prop.insert("description".into(), json!(desc));
            }
            if let Some(default) = &param.default {
                prop.insert("default".into(), default.clone());
            } else {
                required.push(param.name.clone());
            }
            properties.insert(param.name.clone(), Value::Object(prop));
        }

        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// ToolArguments — dict or JSON-encoded string
// ---------------------------------------------------------------------------

/// Arguments as the model sends them: either an already-parsed map or a
/// raw JSON string.
pub enum ToolArguments {
    Parsed(Value),
    Raw(String),
}

impl ToolArguments {
    /// Resolve to a JSON value. A string that fails to parse maps to empty
    /// arguments with a warning rather than failing the call.
    fn into_value(self, tool_name: &str) -> Value {
        match self {
            ToolArguments::Parsed(v) => v,
            ToolArguments::Raw(s) => {
                if s.trim().is_empty() {
                    return json!({});
                }
                match serde_json::from_str(&s) {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(
                            tool = tool_name,
                            %err,
                            "tool arguments are not valid JSON; using empty arguments"
                        );
                        json!({})
                    }
                }
            }
        }
    }
}

impl From<Value> for ToolArguments {
    fn from(v: Value) -> Self {
        ToolArguments::Parsed(v)
    }
}

impl From<&str> for ToolArguments {
    fn from(s: &str) -> Self {
        ToolArguments::Raw(s.to_string())
    }
}

impl From<String> for ToolArguments {
    fn from(s: String) -> Self {
        ToolArguments::Raw(s)
    }
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

pub type ToolFn = Box<dyn FnMut(&mut ProcessContext, Value) -> Result<Value, ToolError>>;

struct Registered {
    spec: ToolSpec,
    func: ToolFn,
}

/// The catalog of invocable named capabilities. Registration order is
/// preserved and is the order tools are advertised to the model. Exactly
/// one callable per name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Registered>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        spec: ToolSpec,
        func: impl FnMut(&mut ProcessContext, Value) -> Result<Value, ToolError> + 'static,
    ) -> Result<(), ToolError> {
        self.register_with(spec, func, false)
    }

    pub fn register_with(
        &mut self,
        spec: ToolSpec,
        func: impl FnMut(&mut ProcessContext, Value) -> Result<Value, ToolError> + 'static,
        replace: bool,
    ) -> Result<(), ToolError> {
        let name = spec.name.clone();
        if self.tools.contains_key(&name) && !replace {
            return Err(ToolError::Duplicate(name));
        }
        if !self.order.contains(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(
            name,
            Registered {
                spec,
                func: Box::new(func),
            },
        );
        Ok(())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Schemas for every registered tool, in registration order.
    pub fn schemas(&self) -> Vec<Value> {
        self.order
            .iter()
            .map(|name| self.tools[name].spec.schema())
            .collect()
    }

    /// Schemas for a named subset, registration order kept, unknown names
    /// skipped.
    pub fn schemas_for(&self, names: &[String]) -> Vec<Value> {
        self.order
            .iter()
            .filter(|name| names.iter().any(|n| n == *name))
            .map(|name| self.tools[name].spec.schema())
            .collect()
    }

    /// Invoke a tool by name. Errors raised by the tool body propagate to
    /// the caller unchanged; the registry itself only raises
    /// [`ToolError::NotFound`].
    pub fn call(
        &mut self,
        ctx: &mut ProcessContext,
        name: &str,
        args: impl Into<ToolArguments>,
    ) -> Result<Value, ToolError> {
        let args = args.into().into_value(name);
        let entry = self
            .tools
            .get_mut(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        (entry.func)(ctx, args)
    }

    /// Clear all registered tools. Test aid.
    pub fn reset(&mut self) {
        self.tools.clear();
        self.order.clear();
    }
}
