//! Tool registry: named operations, their argument contracts and handlers.
//!
//! Descriptors are immutable once registered and listed in registration
//! order. The registry is built at startup and shared read-only behind an
//! `Arc`, so lookups take no locks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::RequestContext;
use crate::protocol::{Tool, ToolAnnotations, ToolsCallResult};
use crate::{Error, Result};

/// One decoded tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Tool name
    pub name: String,
    /// Arguments (an object after validation)
    pub arguments: Value,
}

impl ToolInvocation {
    /// Create an invocation
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Required string argument
    pub fn str_arg(&self, key: &str) -> Result<&str> {
        self.arguments
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation(format!("missing string argument '{key}'")))
    }

    /// Optional argument
    #[must_use]
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key).filter(|v| !v.is_null())
    }
}

/// Handler bound to a tool name
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute one invocation on behalf of the caller described by `context`.
    async fn call(
        &self,
        invocation: ToolInvocation,
        context: Arc<RequestContext>,
    ) -> Result<ToolsCallResult>;
}

/// Adapts an async closure into a [`ToolHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolInvocation, Arc<RequestContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolsCallResult>> + Send + 'static,
{
    async fn call(
        &self,
        invocation: ToolInvocation,
        context: Arc<RequestContext>,
    ) -> Result<ToolsCallResult> {
        (self.0)(invocation, context).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolInvocation, Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolsCallResult>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Immutable description of one tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    name: String,
    description: String,
    input_schema: Value,
    annotations: ToolAnnotations,
}

impl ToolDescriptor {
    /// Start a descriptor with an empty object schema
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: json!({"type": "object", "properties": {}}),
            annotations: ToolAnnotations::default(),
        }
    }

    /// Set the input JSON Schema
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Set the category annotation
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.annotations.category = Some(category.into());
        self
    }

    /// Mark the tool as read-only (or not)
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.annotations.read_only_hint = Some(read_only);
        self.annotations.destructive_hint = if read_only { None } else { Some(true) };
        self
    }

    /// Tool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tool description
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Input JSON Schema
    #[must_use]
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Annotations
    #[must_use]
    pub fn annotations(&self) -> &ToolAnnotations {
        &self.annotations
    }

    /// Wire form for `tools/list`
    #[must_use]
    pub fn to_tool(&self) -> Tool {
        let annotations = (self.annotations != ToolAnnotations::default())
            .then(|| self.annotations.clone());
        Tool {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            input_schema: self.input_schema.clone(),
            annotations,
        }
    }
}

/// A descriptor together with its handler
#[derive(Clone)]
pub struct RegisteredTool {
    /// Descriptor
    pub descriptor: ToolDescriptor,
    /// Bound handler
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Ordered set of tools with unique names
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the name is empty or already taken.
    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<()> {
        let name = descriptor.name().to_string();
        if name.is_empty() {
            return Err(Error::Config("Tool name must not be empty".to_string()));
        }
        if self.index.contains_key(&name) {
            return Err(Error::Config(format!("Tool already registered: {name}")));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(RegisteredTool {
            descriptor,
            handler,
        });
        Ok(())
    }

    /// Builder-style [`register`](Self::register)
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub fn with_tool(mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) -> Result<Self> {
        self.register(descriptor, handler)?;
        Ok(self)
    }

    /// Descriptors in registration order
    pub fn list_tools(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter().map(|t| &t.descriptor)
    }

    /// Look up a tool by name
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&RegisteredTool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Number of registered tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
