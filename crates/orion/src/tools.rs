//! Local tools the agent can dispatch to.
//!
//! A tool is anything that can describe itself with a [`ToolDescriptor`] and turn a JSON
//! argument object into output text. Remote tools from a bridge implement the same trait.
pub mod function;
pub mod schema;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::errors::{AgentError, AgentResult};
use crate::models::tool::ToolDescriptor;

pub use function::FunctionTool;

/// Arguments as they reach a tool: raw text from the model, or an already parsed value
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    Raw(String),
    Value(Value),
}

impl ToolArguments {
    /// Parse into a JSON value. Blank raw text is an empty object.
    pub fn into_value(self) -> AgentResult<Value> {
        match self {
            ToolArguments::Value(value) => Ok(value),
            ToolArguments::Raw(raw) if raw.trim().is_empty() => Ok(json!({})),
            ToolArguments::Raw(raw) => serde_json::from_str(&raw).map_err(|e| {
                AgentError::InvalidToolArguments(format!("arguments are not valid JSON: {}", e))
            }),
        }
    }
}

impl From<&str> for ToolArguments {
    fn from(raw: &str) -> Self {
        ToolArguments::Raw(raw.to_string())
    }
}

impl From<String> for ToolArguments {
    fn from(raw: String) -> Self {
        ToolArguments::Raw(raw)
    }
}

impl From<Value> for ToolArguments {
    fn from(value: Value) -> Self {
        ToolArguments::Value(value)
    }
}

/// Core trait for anything the agent can call on the model's behalf
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the descriptor advertised to the model
    fn descriptor(&self) -> &ToolDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Execute with arguments that already passed validation
    async fn call(&self, args: Value) -> AgentResult<String>;

    /// Parse and validate the arguments, then execute.
    ///
    /// Malformed JSON or a schema violation returns `InvalidToolArguments`
    /// without calling the tool.
    async fn run(&self, args: ToolArguments) -> AgentResult<String> {
        let value = args.into_value()?;
        schema::validate(&self.descriptor().parameters, &value)?;
        self.call(value).await
    }

    /// Like `call`, with the conversation's cancellation token. Tools that never
    /// check for cancellation keep the default.
    async fn call_with_cancel(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> AgentResult<String> {
        self.call(args).await
    }

    /// Like `run`, handing the token through to `call_with_cancel`
    async fn run_with_cancel(
        &self,
        args: ToolArguments,
        cancel: CancellationToken,
    ) -> AgentResult<String> {
        let value = args.into_value()?;
        schema::validate(&self.descriptor().parameters, &value)?;
        self.call_with_cancel(value, cancel).await
    }
}

/// An ordered set of tools with unique, valid names
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tool: Arc<dyn Tool>) -> AgentResult<()> {
        let name = tool.name();
        ToolDescriptor::validate_name(name)?;
        if self.get(name).is_some() {
            return Err(AgentError::InvalidToolName(format!(
                "Duplicate tool name: {}",
                name
            )));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| tool.descriptor().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.iter()
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tools.iter().map(|tool| tool.name()))
            .finish()
    }
}
