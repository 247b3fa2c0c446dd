use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::content::{parts_from_value, ContentPart, MessageContent};
use super::role::Role;
use super::tool::{ToolCallRequest, ToolCallResult};
use crate::errors::{AgentError, AgentResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
/// A message to or from an LLM. Content is never empty.
pub struct Message {
    role: Role,
    content: Vec<ContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new<C: Into<MessageContent>>(role: Role, content: C) -> AgentResult<Self> {
        Ok(Message {
            role,
            content: content.into().into_parts()?,
            id: None,
            created_at: None,
        })
    }

    pub fn user<C: Into<MessageContent>>(content: C) -> AgentResult<Self> {
        Self::new(Role::User, content)
    }

    pub fn assistant<C: Into<MessageContent>>(content: C) -> AgentResult<Self> {
        Self::new(Role::Assistant, content)
    }

    pub fn system<C: Into<MessageContent>>(content: C) -> AgentResult<Self> {
        Self::new(Role::System, content)
    }

    pub fn developer<C: Into<MessageContent>>(content: C) -> AgentResult<Self> {
        Self::new(Role::Developer, content)
    }

    /// Build a message from loosely shaped JSON such as `{"role":"user","content":"hi"}`
    pub fn from_value(value: &Value) -> AgentResult<Self> {
        let role = value
            .get("role")
            .cloned()
            .and_then(|r| serde_json::from_value::<Role>(r).ok())
            .unwrap_or(Role::Unknown);
        let content = value.get("content").ok_or(AgentError::ContentRequired)?;

        let mut message = Message {
            role,
            content: parts_from_value(content)?,
            id: None,
            created_at: None,
        };
        if let Some(id) = value.get("id").and_then(|v| v.as_str()) {
            message.id = Some(id.to_string());
        }
        message.created_at = value
            .get("created_at")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        Ok(message)
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Stamp the message with a creation time, `now` when none is given
    pub fn with_created_at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        self.created_at = Some(created_at.unwrap_or_else(Utc::now));
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &[ContentPart] {
        &self.content
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// All text parts joined by newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_images(&self) -> bool {
        self.content.iter().any(|part| part.as_image().is_some())
    }
}

impl TryFrom<Value> for Message {
    type Error = AgentError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Message::from_value(&value)
    }
}

/// One entry of the conversation the agent sends to a model
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationItem {
    Message(Message),
    /// The assistant turn that requested tools. Its text may be empty.
    ToolCalls {
        content: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResult(ToolCallResult),
}

impl ConversationItem {
    /// Decode any of the wire forms the agent itself produces.
    pub fn from_value(value: &Value) -> AgentResult<Self> {
        let kind = value.get("type").and_then(|t| t.as_str());
        let role = value.get("role").and_then(|r| r.as_str());

        if kind == Some("function_call_output") || role == Some("tool") {
            return ToolCallResult::from_value(value).map(ConversationItem::ToolResult);
        }

        if kind == Some("function_call") {
            let call: ToolCallRequest = serde_json::from_value(value.clone())?;
            return Ok(ConversationItem::ToolCalls {
                content: String::new(),
                tool_calls: vec![call],
            });
        }

        if let Some(calls) = value.get("tool_calls").and_then(|c| c.as_array()) {
            if !calls.is_empty() {
                let tool_calls = calls
                    .iter()
                    .map(|call| serde_json::from_value(call.clone()))
                    .collect::<Result<Vec<ToolCallRequest>, _>>()?;
                let content = value
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                return Ok(ConversationItem::ToolCalls {
                    content,
                    tool_calls,
                });
            }
        }

        Message::from_value(value).map(ConversationItem::Message)
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            ConversationItem::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolCallResult> {
        match self {
            ConversationItem::ToolResult(result) => Some(result),
            _ => None,
        }
    }
}

impl From<Message> for ConversationItem {
    fn from(message: Message) -> Self {
        ConversationItem::Message(message)
    }
}

impl From<ToolCallResult> for ConversationItem {
    fn from(result: ToolCallResult) -> Self {
        ConversationItem::ToolResult(result)
    }
}
