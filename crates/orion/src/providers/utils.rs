use std::collections::HashSet;

use reqwest::StatusCode;
use serde_json::{json, Value};

use super::base::Usage;
use crate::errors::{AgentError, AgentResult};
use crate::models::content::{ContentPart, ImageContent};
use crate::models::message::{ConversationItem, Message};
use crate::models::role::Role;
use crate::models::tool::{SchemaFormat, ToolCallRequest, ToolCallResult, ToolDescriptor};

/// Convert tool descriptors to a provider's tool list, rejecting duplicate names
pub fn tools_to_spec(tools: &[ToolDescriptor], format: SchemaFormat) -> AgentResult<Vec<Value>> {
    let mut tool_names = HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(AgentError::InvalidToolName(format!(
                "Duplicate tool name: {}",
                tool.name
            )));
        }
        result.push(tool.to_provider_schema(format));
    }

    Ok(result)
}

fn chat_role(role: Role) -> &'static str {
    match role {
        Role::Unknown => "user",
        other => other.as_str(),
    }
}

/// Convert conversation items to the chat completions `messages` array
pub fn items_to_chat_spec(items: &[ConversationItem]) -> Vec<Value> {
    items
        .iter()
        .map(|item| match item {
            ConversationItem::Message(message) => json!({
                "role": chat_role(message.role()),
                "content": chat_content(message),
            }),
            ConversationItem::ToolCalls {
                content,
                tool_calls,
            } => {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.call_id(),
                            "type": "function",
                            "function": {
                                "name": call.name(),
                                "arguments": call.arguments(),
                            }
                        })
                    })
                    .collect();
                let content = if content.is_empty() {
                    Value::Null
                } else {
                    json!(content)
                };
                json!({
                    "role": "assistant",
                    "content": content,
                    "tool_calls": calls,
                })
            }
            ConversationItem::ToolResult(result) => json!({
                "role": "tool",
                "content": result.output,
                "tool_call_id": result.call_id,
            }),
        })
        .collect()
}

fn chat_content(message: &Message) -> Value {
    if let [ContentPart::Text(text)] = message.content() {
        return json!(text.text);
    }
    let parts: Vec<Value> = message
        .content()
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => json!({"type": "text", "text": text.text}),
            ContentPart::Image(image) => {
                let mut image_url = json!({"url": image.url});
                if let Some(detail) = image.detail {
                    image_url["detail"] = json!(detail);
                }
                json!({"type": "image_url", "image_url": image_url})
            }
        })
        .collect();
    json!(parts)
}

/// Convert conversation items to the responses `input` array
pub fn items_to_responses_spec(items: &[ConversationItem]) -> Vec<Value> {
    let mut input = Vec::new();
    for item in items {
        match item {
            ConversationItem::Message(message) => {
                let text_type = if message.role() == Role::Assistant {
                    "output_text"
                } else {
                    "input_text"
                };
                let content: Vec<Value> = message
                    .content()
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text(text) => json!({"type": text_type, "text": text.text}),
                        ContentPart::Image(image) => json!({
                            "type": "input_image",
                            "image_url": image.url,
                            "detail": image.detail.map(|d| json!(d)).unwrap_or(json!("auto")),
                        }),
                    })
                    .collect();
                input.push(json!({
                    "role": chat_role(message.role()),
                    "content": content,
                }));
            }
            ConversationItem::ToolCalls {
                content,
                tool_calls,
            } => {
                if !content.is_empty() {
                    input.push(json!({
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": content}],
                    }));
                }
                for call in tool_calls {
                    let mut value = json!({
                        "type": "function_call",
                        "call_id": call.call_id(),
                        "name": call.name(),
                        "arguments": call.arguments(),
                    });
                    if let ToolCallRequest::EventStream(event) = call {
                        value["id"] = json!(event.id);
                    }
                    input.push(value);
                }
            }
            ConversationItem::ToolResult(result) => input.push(json!({
                "type": "function_call_output",
                "call_id": result.call_id,
                "output": result.output,
            })),
        }
    }
    input
}

/// Convert conversation items to anthropic's `(system, messages)` pair.
///
/// System and developer messages move into the top-level system prompt. Consecutive tool
/// results are merged into one user turn, which is what the messages API expects.
pub fn items_to_anthropic_spec(items: &[ConversationItem]) -> (Option<String>, Vec<Value>) {
    let mut system = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for item in items {
        match item {
            ConversationItem::Message(message) => match message.role() {
                Role::System | Role::Developer => system.push(message.text()),
                role => {
                    let content: Vec<Value> =
                        message.content().iter().map(anthropic_part).collect();
                    messages.push(json!({
                        "role": if role == Role::Assistant { "assistant" } else { "user" },
                        "content": content,
                    }));
                }
            },
            ConversationItem::ToolCalls {
                content,
                tool_calls,
            } => {
                let mut blocks = Vec::new();
                if !content.is_empty() {
                    blocks.push(json!({"type": "text", "text": content}));
                }
                for call in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.call_id(),
                        "name": call.name(),
                        "input": parse_tool_input(call.arguments()),
                    }));
                }
                messages.push(json!({"role": "assistant", "content": blocks}));
            }
            ConversationItem::ToolResult(result) => {
                let block = anthropic_tool_result(result);
                let merged = messages.last_mut().and_then(|last| {
                    let is_result_turn = last["role"] == "user"
                        && last["content"]
                            .as_array()
                            .map(|blocks| blocks.iter().all(|b| b["type"] == "tool_result"))
                            .unwrap_or(false);
                    if is_result_turn {
                        last["content"].as_array_mut()
                    } else {
                        None
                    }
                });
                match merged {
                    Some(blocks) => blocks.push(block),
                    None => messages.push(json!({"role": "user", "content": [block]})),
                }
            }
        }
    }

    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, messages)
}

fn anthropic_tool_result(result: &ToolCallResult) -> Value {
    json!({
        "type": "tool_result",
        "tool_use_id": result.call_id,
        "content": result.output,
    })
}

fn anthropic_part(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text(text) => json!({"type": "text", "text": text.text}),
        ContentPart::Image(image) => json!({"type": "image", "source": anthropic_image_source(image)}),
    }
}

fn anthropic_image_source(image: &ImageContent) -> Value {
    // data:<media type>;base64,<data>
    if let Some(rest) = image.url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "base64",
                "media_type": media_type,
                "data": data,
            });
        }
    }
    json!({"type": "url", "url": image.url})
}

/// Tool input must be an object on the wire even when the model sent broken arguments
fn parse_tool_input(arguments: &str) -> Value {
    match serde_json::from_str::<Value>(arguments) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({}),
    }
}

/// Token usage in the OpenAI chat completions shape
pub fn get_openai_usage(data: &Value) -> Option<Usage> {
    let usage = data.get("usage").filter(|u| !u.is_null())?;

    let input_tokens = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let output_tokens = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        });

    Some(Usage::new(input_tokens, output_tokens, total_tokens))
}

pub fn check_openai_context_length_error(error: &Value) -> Option<AgentError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(AgentError::ContextLengthExceeded(message))
    } else {
        None
    }
}

/// Map an `error` object from an OpenAI-style body to an AgentError
pub fn openai_api_error(error: &Value) -> AgentError {
    check_openai_context_length_error(error).unwrap_or_else(|| {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        AgentError::Provider(message)
    })
}

/// Read the body of a failed request and turn it into an AgentError
pub async fn error_from_response(response: reqwest::Response) -> AgentError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let parsed: Option<Value> = serde_json::from_str(&body).ok();

    if let Some(error) = parsed.as_ref().and_then(|v| v.get("error")) {
        if let Some(err) = check_openai_context_length_error(error) {
            return err;
        }
    }

    match status {
        status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
            AgentError::Provider(format!("Server error: {}", status))
        }
        _ => AgentError::Provider(format!("Request failed: {} - {}", status, body)),
    }
}
