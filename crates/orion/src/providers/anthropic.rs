use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::base::{CreateParams, CreateResponse, Provider, Usage};
use super::configs::{AnthropicProviderConfig, ANTHROPIC_DEFAULT_MAX_TOKENS};
use super::utils::{error_from_response, items_to_anthropic_spec, tools_to_spec};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::{ApiType, SchemaFormat, ToolCallRequest};
use crate::sse::{self, SseStream};
use crate::stream::{ResponseStream, StreamEvent};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Option<Usage> {
        let usage = data.get("usage")?;
        let input_tokens = usage["input_tokens"].as_i64().map(|v| v as i32);
        let output_tokens = usage["output_tokens"].as_i64().map(|v| v as i32);
        let total_tokens = match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        };
        Some(Usage::new(input_tokens, output_tokens, total_tokens))
    }

    fn payload(&self, params: &CreateParams, stream: bool) -> AgentResult<Value> {
        let (system, messages) = items_to_anthropic_spec(&params.items);

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
        });
        let map = payload
            .as_object_mut()
            .ok_or_else(|| AgentError::Provider("payload is not an object".into()))?;

        if let Some(system) = system {
            map.insert("system".to_string(), json!(system));
        }
        if !params.tools.is_empty() {
            map.insert(
                "tools".to_string(),
                json!(tools_to_spec(&params.tools, SchemaFormat::Anthropic)?),
            );
        }
        if let Some(temp) = self.config.temperature {
            map.insert("temperature".to_string(), json!(temp));
        }
        if stream {
            map.insert("stream".to_string(), json!(true));
        }
        Ok(payload)
    }

    async fn post(&self, payload: Value) -> AgentResult<reqwest::Response> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));
        tracing::debug!(target: "orion::providers::anthropic", %url, model = %self.config.model, "sending request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response),
            _ => Err(error_from_response(response).await),
        }
    }

    fn parse_response(response: &Value) -> AgentResult<CreateResponse> {
        let blocks = response
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| AgentError::Provider("Invalid response format from Anthropic API".into()))?;

        let mut result = CreateResponse {
            finish_reason: response["stop_reason"].as_str().map(str::to_string),
            usage: Self::get_usage(response),
            ..Default::default()
        };
        let mut thought = String::new();

        for block in blocks {
            match block["type"].as_str() {
                Some("text") => result
                    .content
                    .push_str(block["text"].as_str().unwrap_or_default()),
                Some("thinking") => thought.push_str(block["thinking"].as_str().unwrap_or_default()),
                Some("tool_use") => result.tool_calls.push(ToolCallRequest::turn(
                    block["id"].as_str().unwrap_or_default(),
                    block["name"].as_str().unwrap_or_default(),
                    block["input"].to_string(),
                )),
                _ => {}
            }
        }

        if !thought.is_empty() {
            result.thought = Some(thought);
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Text,
    ToolUse,
    Other,
}

/// Turns anthropic message stream events into normalized events
#[derive(Debug, Default)]
pub(crate) struct MessageStreamDecoder {
    blocks: HashMap<usize, BlockKind>,
    input_tokens: Option<i32>,
    output_tokens: Option<i32>,
    stop_reason: Option<String>,
}

impl MessageStreamDecoder {
    pub(crate) fn decode(&mut self, data: &Value) -> AgentResult<Vec<StreamEvent>> {
        let index = data["index"].as_u64().unwrap_or(0) as usize;
        let mut events = Vec::new();

        match data["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let usage = &data["message"]["usage"];
                self.input_tokens = usage["input_tokens"].as_i64().map(|v| v as i32);
            }
            "content_block_start" => {
                let block = &data["content_block"];
                let kind = match block["type"].as_str() {
                    Some("text") => BlockKind::Text,
                    Some("tool_use") => {
                        events.push(StreamEvent::ToolAdded {
                            index,
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            call_id: None,
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                        });
                        BlockKind::ToolUse
                    }
                    _ => BlockKind::Other,
                };
                self.blocks.insert(index, kind);
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => events.push(StreamEvent::TextDelta(
                        delta["text"].as_str().unwrap_or_default().to_string(),
                    )),
                    Some("input_json_delta") => events.push(StreamEvent::ToolArgumentsDelta(
                        delta["partial_json"].as_str().unwrap_or_default().to_string(),
                    )),
                    Some("thinking_delta") => events.push(StreamEvent::ThoughtDelta(
                        delta["thinking"].as_str().unwrap_or_default().to_string(),
                    )),
                    _ => {}
                }
            }
            "content_block_stop" => match self.blocks.get(&index) {
                Some(BlockKind::Text) => events.push(StreamEvent::TextDone),
                Some(BlockKind::ToolUse) => events.push(StreamEvent::ToolDone { index }),
                _ => {}
            },
            "message_delta" => {
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(output) = data["usage"]["output_tokens"].as_i64() {
                    self.output_tokens = Some(output as i32);
                }
            }
            "message_stop" => {
                let total_tokens = match (self.input_tokens, self.output_tokens) {
                    (Some(input), Some(output)) => Some(input + output),
                    _ => None,
                };
                events.push(StreamEvent::Completed {
                    finish_reason: self.stop_reason.take(),
                    usage: Some(Usage::new(self.input_tokens, self.output_tokens, total_tokens)),
                });
            }
            "error" => {
                let message = data["error"]["message"]
                    .as_str()
                    .unwrap_or("Unknown error")
                    .to_string();
                return Err(AgentError::Provider(message));
            }
            _ => {}
        }
        Ok(events)
    }
}

fn message_events(mut source: SseStream) -> BoxStream<'static, AgentResult<StreamEvent>> {
    Box::pin(try_stream! {
        let mut decoder = MessageStreamDecoder::default();
        while let Some(event) = source.next().await {
            let event = event?;
            let data: Value = serde_json::from_str(&event.data)?;
            for normalized in decoder.decode(&data)? {
                yield normalized;
            }
        }
    })
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn api_type(&self) -> ApiType {
        ApiType::Turn
    }

    async fn create(&self, params: CreateParams) -> AgentResult<CreateResponse> {
        if params.stream {
            return Err(AgentError::UnsupportedOperation(
                "For streaming, use create_stream instead".to_string(),
            ));
        }

        let payload = self.payload(&params, false)?;
        let response: Value = self.post(payload).await?.json().await?;
        Self::parse_response(&response)
    }

    async fn create_stream(&self, params: CreateParams) -> AgentResult<ResponseStream> {
        let payload = self.payload(&params, true)?;
        let response = self.post(payload).await?;
        Ok(ResponseStream::new(
            ApiType::Turn,
            message_events(sse::from_response(response)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup_mock_server(response: ResponseTemplate) -> (MockServer, AnthropicProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test_api_key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(response)
            .mount(&mock_server)
            .await;

        let config = AnthropicProviderConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
            model: "claude-3-sonnet-20240229".to_string(),
            temperature: Some(0.7),
            max_tokens: None,
        };

        let provider = AnthropicProvider::new(config).unwrap();
        (mock_server, provider)
    }

    fn params() -> CreateParams {
        CreateParams::new(
            vec![
                Message::system("You are a helpful assistant.").unwrap().into(),
                Message::user("Hello?").unwrap().into(),
            ],
            vec![],
        )
    }

    #[tokio::test]
    async fn test_create_basic() -> anyhow::Result<()> {
        let response_body = json!({
            "id": "msg_123",
            "type": "message",
            "role": "assistant",
            "content": [{
                "type": "text",
                "text": "Hello! How can I assist you today?"
            }],
            "model": "claude-3-sonnet-20240229",
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {
                "input_tokens": 12,
                "output_tokens": 15
            }
        });

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"system": "You are a helpful assistant."})))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .mount(&mock_server)
            .await;
        let provider =
            AnthropicProvider::new(AnthropicProviderConfig::new("k").with_host(mock_server.uri()))?;

        let response = provider.create(params()).await?;
        assert_eq!(response.content, "Hello! How can I assist you today?");
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.usage, Some(Usage::new(Some(12), Some(15), Some(27))));
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_use_input_becomes_json_arguments() -> anyhow::Result<()> {
        let response_body = json!({
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Oslo"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let (_, provider) =
            setup_mock_server(ResponseTemplate::new(200).set_body_json(response_body)).await;

        let response = provider.create(params()).await?;
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].call_id(), "toolu_1");
        let args: Value = serde_json::from_str(response.tool_calls[0].arguments())?;
        assert_eq!(args, json!({"city": "Oslo"}));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_stream_flag() {
        let (_, provider) = setup_mock_server(ResponseTemplate::new(500)).await;
        let err = provider.create(params().streaming()).await.unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedOperation(_)));
    }

    #[tokio::test]
    async fn test_stream_reassembles_tool_input() -> anyhow::Result<()> {
        let events = [
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 9, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Checking"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"city\": "}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"Oslo\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 20}}),
            json!({"type": "message_stop"}),
        ];
        let body: String = events
            .iter()
            .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
            .collect();
        let (_, provider) =
            setup_mock_server(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
                .await;

        let response = provider.create_stream(params()).await?.into_response().await?;
        assert_eq!(response.content, "Checking");
        assert_eq!(response.tool_calls[0].arguments(), "{\"city\": \"Oslo\"}");
        assert_eq!(response.finish_reason.as_deref(), Some("tool_use"));
        assert_eq!(response.usage, Some(Usage::new(Some(9), Some(20), Some(29))));
        Ok(())
    }
}
