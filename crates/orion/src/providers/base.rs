use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AgentResult;
use crate::models::message::ConversationItem;
use crate::models::tool::{ApiType, ToolCallRequest, ToolDescriptor};
use crate::stream::{ResponseStream, StreamReplay};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

/// What the agent asks a provider for
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub items: Vec<ConversationItem>,
    pub tools: Vec<ToolDescriptor>,
    pub stream: bool,
}

impl CreateParams {
    pub fn new(items: Vec<ConversationItem>, tools: Vec<ToolDescriptor>) -> Self {
        Self {
            items,
            tools,
            stream: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// One complete model response, whichever shape the backend used to deliver it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateResponse {
    pub content: String,
    pub finish_reason: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<Usage>,
    pub thought: Option<String>,
}

impl CreateResponse {
    pub fn text<S: Into<String>>(content: S) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallRequest>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Base trait for model backends (OpenAI, Anthropic, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    /// The response shape this backend speaks
    fn api_type(&self) -> ApiType;

    /// Whether streams from this provider can be replayed once drained
    fn stream_replay(&self) -> StreamReplay {
        StreamReplay::Unsupported
    }

    /// Generate one complete response
    async fn create(&self, params: CreateParams) -> AgentResult<CreateResponse>;

    /// Generate a response as a stream of normalized events
    async fn create_stream(&self, params: CreateParams) -> AgentResult<ResponseStream>;
}
