use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use super::base::{CreateParams, CreateResponse, Provider, Usage};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    error_from_response, get_openai_usage, items_to_chat_spec, openai_api_error, tools_to_spec,
};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::{ApiType, SchemaFormat, ToolCallRequest};
use crate::sse::{self, SseStream};
use crate::stream::{ResponseStream, StreamEvent};

/// Chat completions, for OpenAI and every endpoint compatible with it (DeepSeek included)
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn payload(&self, params: &CreateParams, stream: bool) -> AgentResult<Value> {
        let mut payload = json!({
            "model": self.config.model,
            "messages": items_to_chat_spec(&params.items),
        });
        let map = payload
            .as_object_mut()
            .ok_or_else(|| AgentError::Provider("payload is not an object".into()))?;

        if !params.tools.is_empty() {
            map.insert(
                "tools".to_string(),
                json!(tools_to_spec(&params.tools, SchemaFormat::Chat)?),
            );
        }
        if let Some(temp) = self.config.temperature {
            map.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            map.insert("max_tokens".to_string(), json!(tokens));
        }
        if stream {
            map.insert("stream".to_string(), json!(true));
            map.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
        Ok(payload)
    }

    async fn post(&self, payload: Value) -> AgentResult<reqwest::Response> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );
        tracing::debug!(target: "orion::providers::openai", %url, model = %self.config.model, "sending request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response),
            _ => Err(error_from_response(response).await),
        }
    }
}

/// Convert a chat completion body to a response
pub fn chat_response_to_create_response(response: &Value) -> AgentResult<CreateResponse> {
    // Raise specific error if context length is exceeded
    if let Some(error) = response.get("error") {
        return Err(openai_api_error(error));
    }

    let choice = &response["choices"][0];
    let original = &choice["message"];

    let tool_calls = original
        .get("tool_calls")
        .and_then(|calls| calls.as_array())
        .map(|calls| {
            calls
                .iter()
                .map(|call| {
                    ToolCallRequest::turn(
                        tool_call_id(call),
                        call["function"]["name"].as_str().unwrap_or_default(),
                        call["function"]["arguments"].as_str().unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CreateResponse {
        content: original["content"].as_str().unwrap_or_default().to_string(),
        finish_reason: choice["finish_reason"].as_str().map(str::to_string),
        tool_calls,
        usage: get_openai_usage(response),
        thought: original["reasoning_content"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    })
}

// Some compatible servers leave the id out; results still need something to point at
fn tool_call_id(call: &Value) -> String {
    call["id"]
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()))
}

/// Turns chat completion chunks into normalized events
#[derive(Debug, Default)]
pub(crate) struct ChatChunkDecoder {
    text_open: bool,
    open_tool: Option<usize>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl ChatChunkDecoder {
    pub(crate) fn decode(&mut self, chunk: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(usage) = get_openai_usage(chunk) {
            self.usage = Some(usage);
        }

        let choice = &chunk["choices"][0];
        let delta = &choice["delta"];

        if let Some(thought) = delta["reasoning_content"].as_str().filter(|t| !t.is_empty()) {
            events.push(StreamEvent::ThoughtDelta(thought.to_string()));
        }
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            self.text_open = true;
            events.push(StreamEvent::TextDelta(text.to_string()));
        }

        for call in delta["tool_calls"].as_array().into_iter().flatten() {
            let index = call["index"].as_u64().unwrap_or(0) as usize;
            // A call is keyed by its index; later chunks for the open index continue it
            if self.open_tool != Some(index) {
                if let Some(previous) = self.open_tool.take() {
                    events.push(StreamEvent::ToolDone { index: previous });
                }
                events.push(StreamEvent::ToolAdded {
                    index,
                    id: tool_call_id(call),
                    call_id: None,
                    name: call["function"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                });
                self.open_tool = Some(index);
            }
            if let Some(arguments) = call["function"]["arguments"]
                .as_str()
                .filter(|a| !a.is_empty())
            {
                events.push(StreamEvent::ToolArgumentsDelta(arguments.to_string()));
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
            events.extend(self.close());
        }
        events
    }

    fn close(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if std::mem::take(&mut self.text_open) {
            events.push(StreamEvent::TextDone);
        }
        if let Some(index) = self.open_tool.take() {
            events.push(StreamEvent::ToolDone { index });
        }
        events
    }

    pub(crate) fn finish(mut self) -> Vec<StreamEvent> {
        let mut events = self.close();
        events.push(StreamEvent::Completed {
            finish_reason: self.finish_reason,
            usage: self.usage,
        });
        events
    }
}

pub(crate) fn chat_events(mut source: SseStream) -> BoxStream<'static, AgentResult<StreamEvent>> {
    Box::pin(try_stream! {
        let mut decoder = ChatChunkDecoder::default();
        while let Some(event) = source.next().await {
            let event = event?;
            if sse::is_done(&event) {
                break;
            }
            let chunk: Value = serde_json::from_str(&event.data)?;
            if let Some(error) = chunk.get("error") {
                Err::<(), _>(openai_api_error(error))?;
            }
            for normalized in decoder.decode(&chunk) {
                yield normalized;
            }
        }
        for normalized in decoder.finish() {
            yield normalized;
        }
    })
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn api_type(&self) -> ApiType {
        ApiType::Turn
    }

    async fn create(&self, params: CreateParams) -> AgentResult<CreateResponse> {
        if params.stream {
            // Drain our own stream so callers still get one complete response
            return self.create_stream(params).await?.into_response().await;
        }

        let payload = self.payload(&params, false)?;
        let response: Value = self.post(payload).await?.json().await?;
        chat_response_to_create_response(&response)
    }

    async fn create_stream(&self, params: CreateParams) -> AgentResult<ResponseStream> {
        let payload = self.payload(&params, true)?;
        let response = self.post(payload).await?;
        Ok(ResponseStream::new(
            ApiType::Turn,
            chat_events(sse::from_response(response)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use crate::models::tool::ToolDescriptor;
    use crate::stream::AccumulatorState;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn _setup_mock_server(response: ResponseTemplate) -> (MockServer, OpenAiProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test_api_key"))
            .respond_with(response)
            .mount(&mock_server)
            .await;

        // Create the OpenAiProvider with the mock server's URL as the host
        let config = OpenAiProviderConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            temperature: Some(0.7),
            max_tokens: None,
        };

        let provider = OpenAiProvider::new(config).unwrap();
        (mock_server, provider)
    }

    fn params(text: &str) -> CreateParams {
        CreateParams::new(vec![Message::user(text).unwrap().into()], vec![])
    }

    fn sse_body(chunks: &[Value]) -> String {
        let mut body: String = chunks
            .iter()
            .map(|chunk| format!("data: {}\n\n", chunk))
            .collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[tokio::test]
    async fn test_create_basic() -> anyhow::Result<()> {
        let response_body = json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello! How can I assist you today?",
                    "tool_calls": null
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 12,
                "completion_tokens": 15,
                "total_tokens": 27
            }
        });

        let (_, provider) =
            _setup_mock_server(ResponseTemplate::new(200).set_body_json(response_body)).await;
        let response = provider.create(params("Hello?")).await?;

        assert_eq!(response.content, "Hello! How can I assist you today?");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.usage, Some(Usage::new(Some(12), Some(15), Some(27))));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_tool_request() -> anyhow::Result<()> {
        let response_body = json!({
            "id": "chatcmpl-tool",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_123",
                        "type": "function",
                        "function": {
                            "name": "get_weather",
                            "arguments": "{\"location\":\"San Francisco, CA\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {
                "prompt_tokens": 20,
                "completion_tokens": 15,
                "total_tokens": 35
            }
        });

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({
                "tools": [{"type": "function", "function": {"name": "get_weather"}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .mount(&mock_server)
            .await;
        let provider =
            OpenAiProvider::new(OpenAiProviderConfig::new("test_api_key").with_host(mock_server.uri()))?;

        let tool = ToolDescriptor::new(
            "get_weather",
            "Gets the current weather for a location",
            json!({
                "type": "object",
                "properties": {
                    "location": {
                        "type": "string",
                        "description": "The city and state, e.g. New York, NY"
                    }
                },
                "required": ["location"]
            }),
        );
        let response = provider
            .create(CreateParams::new(
                vec![Message::user("What's the weather in San Francisco?")?.into()],
                vec![tool],
            ))
            .await?;

        assert_eq!(response.tool_calls.len(), 1);
        let call = &response.tool_calls[0];
        assert_eq!(call.api_type(), ApiType::Turn);
        assert_eq!(call.call_id(), "call_123");
        assert_eq!(call.name(), "get_weather");
        assert_eq!(call.arguments(), "{\"location\":\"San Francisco, CA\"}");
        Ok(())
    }

    #[test]
    fn test_missing_tool_call_ids_are_generated() -> anyhow::Result<()> {
        let response = chat_response_to_create_response(&json!({
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"type": "function", "function": {"name": "one", "arguments": "{}"}},
                        {"type": "function", "function": {"name": "two", "arguments": "{}"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        }))?;

        let ids: Vec<_> = response.tool_calls.iter().map(|c| c.call_id()).collect();
        assert!(ids.iter().all(|id| id.starts_with("call_")));
        assert_ne!(ids[0], ids[1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_context_length_error() {
        let body = json!({"error": {"code": "context_length_exceeded", "message": "too long"}});
        let (_, provider) =
            _setup_mock_server(ResponseTemplate::new(400).set_body_json(body)).await;

        let err = provider.create(params("Hello?")).await.unwrap_err();
        assert_eq!(err, AgentError::ContextLengthExceeded("too long".into()));
    }

    #[tokio::test]
    async fn test_stream_reassembles_tool_arguments() -> anyhow::Result<()> {
        let body = sse_body(&[
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "tool_calls": [
                {"index": 0, "id": "call_1", "type": "function", "function": {"name": "get_weather", "arguments": ""}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"location\":"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"Oslo\"}"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 6, "total_tokens": 11}}),
        ]);
        let (_, provider) = _setup_mock_server(
            ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
        )
        .await;

        let response = provider.create_stream(params("weather?")).await?.into_response().await?;
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments(), "{\"location\":\"Oslo\"}");
        assert_eq!(response.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(response.usage, Some(Usage::new(Some(5), Some(6), Some(11))));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_with_stream_flag_synthesizes() -> anyhow::Result<()> {
        let body = sse_body(&[
            json!({"choices": [{"index": 0, "delta": {"reasoning_content": "hmm"}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "Hel"}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]}),
        ]);
        let (_, provider) = _setup_mock_server(
            ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
        )
        .await;

        let response = provider.create(params("hi").streaming()).await?;
        assert_eq!(response.content, "Hello");
        assert_eq!(response.thought.as_deref(), Some("hmm"));
        Ok(())
    }

    #[test]
    fn test_decoder_closes_previous_tool_on_new_id() {
        let mut decoder = ChatChunkDecoder::default();
        let events = decoder.decode(&json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "a", "function": {"name": "one", "arguments": "{}"}},
            {"index": 1, "id": "b", "function": {"name": "two", "arguments": "{}"}}
        ]}}]}));
        assert!(events.contains(&StreamEvent::ToolDone { index: 0 }));
        let tail = decoder.finish();
        assert_eq!(tail[0], StreamEvent::ToolDone { index: 1 });
        assert!(matches!(tail[1], StreamEvent::Completed { .. }));
    }

    fn fold(chunks: &[Value]) -> AgentResult<CreateResponse> {
        let mut decoder = ChatChunkDecoder::default();
        let mut events: Vec<StreamEvent> = chunks.iter().flat_map(|c| decoder.decode(c)).collect();
        events.extend(decoder.finish());
        let mut state = AccumulatorState::new(ApiType::Turn);
        for event in &events {
            state = state.apply(event)?;
        }
        Ok(state.finish())
    }

    #[test]
    fn test_decoder_generates_ids_for_anonymous_tool_calls() -> anyhow::Result<()> {
        let response = fold(&[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"name": "echo", "arguments": "{\"msg\":"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"x\"}"}}
            ]}}]}),
        ])?;
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name(), "echo");
        assert_eq!(response.tool_calls[0].arguments(), "{\"msg\":\"x\"}");
        assert!(response.tool_calls[0].call_id().starts_with("call_"));
        Ok(())
    }

    #[test]
    fn test_decoder_treats_repeated_id_as_continuation() -> anyhow::Result<()> {
        let response = fold(&[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "echo", "arguments": "{\"msg\":"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"arguments": "\"x\"}"}}
            ]}}]}),
        ])?;
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].call_id(), "call_1");
        assert_eq!(response.tool_calls[0].arguments(), "{\"msg\":\"x\"}");
        Ok(())
    }
}
