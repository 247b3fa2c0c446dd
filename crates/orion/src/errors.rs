use serde::{Deserialize, Serialize};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Message content is required")]
    ContentRequired,

    #[error("Invalid tool arguments: {0}")]
    InvalidToolArguments(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool name: {0}")]
    InvalidToolName(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Context length exceeded. Message: {0}")]
    ContextLengthExceeded(String),

    #[error("Malformed stream: {0}")]
    Stream(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("{method}: {source}")]
    Method {
        method: String,
        #[source]
        source: Box<AgentError>,
    },
}

impl AgentError {
    /// Tag the error with the method it escaped from. Cancellation passes through
    /// untouched so callers can always match on it directly.
    pub fn within(self, method: &str) -> Self {
        match self {
            AgentError::Cancelled => AgentError::Cancelled,
            other => AgentError::Method {
                method: method.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, with every method tag stripped
    pub fn root(&self) -> &AgentError {
        match self {
            AgentError::Method { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), AgentError::Cancelled)
    }

    /// Errors the agent hands back to the model as tool output instead of aborting
    pub fn is_recoverable_tool_error(&self) -> bool {
        matches!(
            self.root(),
            AgentError::InvalidToolArguments(_) | AgentError::ToolExecution(_)
        )
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Provider(format!("Invalid JSON: {}", err))
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Provider(err.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
