use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{CreateParams, CreateResponse, Provider};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    error_from_response, get_openai_usage, items_to_responses_spec, openai_api_error,
    tools_to_spec,
};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::{ApiType, SchemaFormat, ToolCallRequest};
use crate::sse::{self, SseStream};
use crate::stream::{ResponseStream, StreamEvent, StreamReplay};

/// The OpenAI responses API. Answers arrive as a list of typed output items.
pub struct OpenAiResponsesProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiResponsesProvider {
    pub fn new(config: OpenAiProviderConfig) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;

        Ok(Self { client, config })
    }

    fn payload(&self, params: &CreateParams, stream: bool) -> AgentResult<Value> {
        let mut payload = json!({
            "model": self.config.model,
            "input": items_to_responses_spec(&params.items),
            "stream": stream,
        });
        let map = payload
            .as_object_mut()
            .ok_or_else(|| AgentError::Provider("payload is not an object".into()))?;

        if !params.tools.is_empty() {
            map.insert(
                "tools".to_string(),
                json!(tools_to_spec(&params.tools, SchemaFormat::Responses)?),
            );
        }
        if let Some(temp) = self.config.temperature {
            map.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            map.insert("max_output_tokens".to_string(), json!(tokens));
        }
        Ok(payload)
    }

    async fn post(&self, payload: Value) -> AgentResult<reqwest::Response> {
        let url = format!("{}/v1/responses", self.config.host.trim_end_matches('/'));
        tracing::debug!(target: "orion::providers::openai_responses", %url, model = %self.config.model, "sending request");

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

/// Convert a complete responses body to a response
pub fn responses_body_to_create_response(body: &Value) -> AgentResult<CreateResponse> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(openai_api_error(error));
    }

    let mut response = CreateResponse {
        finish_reason: body["status"].as_str().map(str::to_string),
        usage: get_openai_usage(body),
        ..Default::default()
    };
    let mut thought = String::new();

    for item in body["output"].as_array().into_iter().flatten() {
        match item["type"].as_str() {
            Some("message") => {
                for part in item["content"].as_array().into_iter().flatten() {
                    if let Some(text) = part["text"].as_str() {
                        response.content.push_str(text);
                    }
                }
            }
            Some("function_call") => response.tool_calls.push(ToolCallRequest::event_stream(
                item["id"].as_str().unwrap_or_default(),
                item["call_id"].as_str().unwrap_or_default(),
                item["name"].as_str().unwrap_or_default(),
                item["arguments"].as_str().unwrap_or_default(),
            )),
            Some("reasoning") => {
                for summary in item["summary"].as_array().into_iter().flatten() {
                    if let Some(text) = summary["text"].as_str() {
                        thought.push_str(text);
                    }
                }
            }
            _ => {}
        }
    }

    if !thought.is_empty() {
        response.thought = Some(thought);
    }
    Ok(response)
}

/// Map one responses stream event to normalized events
pub(crate) fn decode_response_event(data: &Value) -> AgentResult<Vec<StreamEvent>> {
    let index = || data["output_index"].as_u64().unwrap_or(0) as usize;
    let delta = || data["delta"].as_str().unwrap_or_default().to_string();

    let events = match data["type"].as_str().unwrap_or_default() {
        "response.output_text.delta" => vec![StreamEvent::TextDelta(delta())],
        "response.output_text.done" => vec![StreamEvent::TextDone],
        "response.reasoning_summary_text.delta" => vec![StreamEvent::ThoughtDelta(delta())],
        "response.function_call_arguments.delta" => {
            vec![StreamEvent::ToolArgumentsDelta(delta())]
        }
        "response.output_item.added" if data["item"]["type"] == "function_call" => {
            let item = &data["item"];
            vec![StreamEvent::ToolAdded {
                index: index(),
                id: item["id"].as_str().unwrap_or_default().to_string(),
                call_id: item["call_id"].as_str().map(str::to_string),
                name: item["name"].as_str().unwrap_or_default().to_string(),
            }]
        }
        "response.output_item.done" if data["item"]["type"] == "function_call" => {
            vec![StreamEvent::ToolDone { index: index() }]
        }
        "response.completed" | "response.incomplete" => {
            let response = &data["response"];
            vec![StreamEvent::Completed {
                finish_reason: response["status"].as_str().map(str::to_string),
                usage: get_openai_usage(response),
            }]
        }
        "response.failed" => {
            let error = &data["response"]["error"];
            return Err(openai_api_error(error));
        }
        "error" => return Err(openai_api_error(data)),
        _ => Vec::new(),
    };
    Ok(events)
}

pub(crate) fn response_events(mut source: SseStream) -> BoxStream<'static, AgentResult<StreamEvent>> {
    Box::pin(try_stream! {
        while let Some(event) = source.next().await {
            let event = event?;
            if sse::is_done(&event) {
                break;
            }
            let data: Value = serde_json::from_str(&event.data)?;
            for normalized in decode_response_event(&data)? {
                yield normalized;
            }
        }
    })
}

#[async_trait]
impl Provider for OpenAiResponsesProvider {
    fn api_type(&self) -> ApiType {
        ApiType::EventStream
    }

    fn stream_replay(&self) -> StreamReplay {
        StreamReplay::Cached
    }

    async fn create(&self, params: CreateParams) -> AgentResult<CreateResponse> {
        if params.stream {
            return self.create_stream(params).await?.into_response().await;
        }

        let payload = self.payload(&params, false)?;
        let body: Value = self.post(payload).await?.json().await?;
        responses_body_to_create_response(&body)
    }

    async fn create_stream(&self, params: CreateParams) -> AgentResult<ResponseStream> {
        let payload = self.payload(&params, true)?;
        let response = self.post(payload).await?;
        Ok(
            ResponseStream::new(ApiType::EventStream, response_events(sse::from_response(response)))
                .with_replay(self.stream_replay()),
        )
    }
}
