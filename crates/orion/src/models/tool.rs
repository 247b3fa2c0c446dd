use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{AgentError, AgentResult};

lazy_static! {
    static ref TOOL_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").unwrap();
}

/// Which response shape a backend speaks.
///
/// `Turn` backends answer with one complete message (chat completions, anthropic messages).
/// `EventStream` backends describe the answer as a sequence of typed items (responses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiType {
    #[serde(rename = "chat_completion")]
    Turn,
    #[serde(rename = "response")]
    EventStream,
}

/// How a tool descriptor is laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFormat {
    /// `{"type":"function","function":{name, description, parameters}}`
    Chat,
    /// `{"type":"function", name, description, parameters}`
    Responses,
    /// `{name, description, input_schema}`
    Anthropic,
}

/// A tool that can be advertised to a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    /// The name of the tool
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// JSON schema for the arguments the tool accepts
    pub parameters: Value,
    /// Ask the backend to follow the schema exactly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

impl ToolDescriptor {
    pub fn new<N, D>(name: N, description: D, parameters: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        ToolDescriptor {
            name: name.into(),
            description: description.into(),
            parameters,
            strict: None,
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }

    pub fn validate_name(name: &str) -> AgentResult<()> {
        if TOOL_NAME.is_match(name) {
            Ok(())
        } else {
            Err(AgentError::InvalidToolName(format!(
                "'{}' must match [a-zA-Z0-9_-]{{1,64}}",
                name
            )))
        }
    }

    pub fn to_provider_schema(&self, format: SchemaFormat) -> Value {
        let mut spec = match format {
            SchemaFormat::Chat => json!({
                "type": "function",
                "function": {
                    "name": self.name,
                    "description": self.description,
                    "parameters": self.parameters,
                }
            }),
            SchemaFormat::Responses => json!({
                "type": "function",
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }),
            SchemaFormat::Anthropic => {
                return json!({
                    "name": self.name,
                    "description": self.description,
                    "input_schema": self.parameters,
                })
            }
        };
        if let Some(strict) = self.strict {
            let target = match format {
                SchemaFormat::Chat => &mut spec["function"],
                _ => &mut spec,
            };
            target["strict"] = json!(strict);
        }
        spec
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text, possibly still incomplete while streaming
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnToolCall {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventToolCall {
    pub id: String,
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// A tool call requested by the model, in the shape of the backend that asked for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolCallRequest {
    Turn(TurnToolCall),
    EventStream(EventToolCall),
}

impl ToolCallRequest {
    pub fn turn<I, N, A>(id: I, name: N, arguments: A) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        A: Into<String>,
    {
        ToolCallRequest::Turn(TurnToolCall {
            id: id.into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        })
    }

    pub fn event_stream<I, C, N, A>(id: I, call_id: C, name: N, arguments: A) -> Self
    where
        I: Into<String>,
        C: Into<String>,
        N: Into<String>,
        A: Into<String>,
    {
        ToolCallRequest::EventStream(EventToolCall {
            id: id.into(),
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
        })
    }

    /// An empty-argument call of the given shape, as announced at the start of a stream
    pub fn empty(api_type: ApiType, id: &str, call_id: Option<&str>, name: &str) -> Self {
        match api_type {
            ApiType::Turn => ToolCallRequest::turn(id, name, ""),
            ApiType::EventStream => {
                ToolCallRequest::event_stream(id, call_id.unwrap_or(id), name, "")
            }
        }
    }

    pub fn api_type(&self) -> ApiType {
        match self {
            ToolCallRequest::Turn(_) => ApiType::Turn,
            ToolCallRequest::EventStream(_) => ApiType::EventStream,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ToolCallRequest::Turn(call) => &call.id,
            ToolCallRequest::EventStream(call) => &call.id,
        }
    }

    /// The id a tool result must echo back
    pub fn call_id(&self) -> &str {
        match self {
            ToolCallRequest::Turn(call) => &call.id,
            ToolCallRequest::EventStream(call) => &call.call_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ToolCallRequest::Turn(call) => &call.function.name,
            ToolCallRequest::EventStream(call) => &call.name,
        }
    }

    pub fn arguments(&self) -> &str {
        match self {
            ToolCallRequest::Turn(call) => &call.function.arguments,
            ToolCallRequest::EventStream(call) => &call.arguments,
        }
    }

    pub(crate) fn push_arguments(&mut self, delta: &str) {
        match self {
            ToolCallRequest::Turn(call) => call.function.arguments.push_str(delta),
            ToolCallRequest::EventStream(call) => call.arguments.push_str(delta),
        }
    }

    /// The call as it appears in the next round's input
    pub fn to_value(&self) -> Value {
        match self {
            ToolCallRequest::Turn(call) => json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.function.name,
                    "arguments": call.function.arguments,
                }
            }),
            ToolCallRequest::EventStream(call) => json!({
                "type": "function_call",
                "id": call.id,
                "call_id": call.call_id,
                "name": call.name,
                "arguments": call.arguments,
            }),
        }
    }
}

/// The output of one tool call, fed back to the model on the next round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub output: String,
    pub api_type: ApiType,
}

impl ToolCallResult {
    pub fn new<C: Into<String>, O: Into<String>>(call_id: C, output: O, api_type: ApiType) -> Self {
        Self {
            call_id: call_id.into(),
            output: output.into(),
            api_type,
        }
    }

    pub fn to_value(&self) -> Value {
        match self.api_type {
            ApiType::Turn => json!({
                "role": "tool",
                "content": self.output,
                "tool_call_id": self.call_id,
            }),
            ApiType::EventStream => json!({
                "type": "function_call_output",
                "call_id": self.call_id,
                "output": self.output,
            }),
        }
    }

    pub fn from_value(value: &Value) -> AgentResult<Self> {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        if value.get("type").and_then(|t| t.as_str()) == Some("function_call_output") {
            let call_id = text("call_id")
                .ok_or_else(|| AgentError::Provider("function_call_output without call_id".into()))?;
            return Ok(Self::new(call_id, text("output").unwrap_or_default(), ApiType::EventStream));
        }

        match (text("role").as_deref(), text("tool_call_id")) {
            (Some("tool"), Some(call_id)) => Ok(Self::new(
                call_id,
                text("content").unwrap_or_default(),
                ApiType::Turn,
            )),
            _ => Err(AgentError::Provider(format!(
                "Not a tool result message: {}",
                value
            ))),
        }
    }
}
