use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use crate::errors::{AgentError, AgentResult};
use crate::models::tool::ApiType;
use crate::providers::base::{CreateParams, CreateResponse, Provider};
use crate::stream::{ResponseStream, StreamEvent, StreamReplay};

/// A mock provider that returns pre-configured responses for testing
#[derive(Clone)]
pub struct MockProvider {
    api_type: ApiType,
    replay: StreamReplay,
    responses: Arc<Mutex<VecDeque<CreateResponse>>>,
    streams: Arc<Mutex<VecDeque<Vec<StreamEvent>>>>,
    requests: Arc<Mutex<Vec<CreateParams>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<CreateResponse>) -> Self {
        Self {
            api_type: ApiType::Turn,
            replay: StreamReplay::Unsupported,
            responses: Arc::new(Mutex::new(responses.into())),
            streams: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that answers `create_stream` with scripted event sequences
    pub fn with_streams(api_type: ApiType, streams: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            api_type,
            streams: Arc::new(Mutex::new(streams.into())),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_api_type(mut self, api_type: ApiType) -> Self {
        self.api_type = api_type;
        self
    }

    pub fn with_replay(mut self, replay: StreamReplay) -> Self {
        self.replay = replay;
        self
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<CreateParams> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn record(&self, params: &CreateParams) -> AgentResult<()> {
        self.requests
            .lock()
            .map_err(|_| AgentError::Provider("mock provider lock poisoned".into()))?
            .push(params.clone());
        Ok(())
    }

    fn next_response(&self) -> AgentResult<Option<CreateResponse>> {
        Ok(self
            .responses
            .lock()
            .map_err(|_| AgentError::Provider("mock provider lock poisoned".into()))?
            .pop_front())
    }
}

/// The event sequence an adapter would have streamed for a complete response
pub fn response_to_events(response: &CreateResponse) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(thought) = &response.thought {
        events.push(StreamEvent::ThoughtDelta(thought.clone()));
    }
    if !response.content.is_empty() {
        events.push(StreamEvent::TextDelta(response.content.clone()));
        events.push(StreamEvent::TextDone);
    }
    for (index, call) in response.tool_calls.iter().enumerate() {
        events.push(StreamEvent::ToolAdded {
            index,
            id: call.id().to_string(),
            call_id: Some(call.call_id().to_string()),
            name: call.name().to_string(),
        });
        events.push(StreamEvent::ToolArgumentsDelta(call.arguments().to_string()));
        events.push(StreamEvent::ToolDone { index });
    }
    events.push(StreamEvent::Completed {
        finish_reason: response.finish_reason.clone(),
        usage: response.usage.clone(),
    });
    events
}

#[async_trait]
impl Provider for MockProvider {
    fn api_type(&self) -> ApiType {
        self.api_type
    }

    fn stream_replay(&self) -> StreamReplay {
        self.replay
    }

    async fn create(&self, params: CreateParams) -> AgentResult<CreateResponse> {
        if params.stream {
            return self.create_stream(params).await?.into_response().await;
        }
        self.record(&params)?;
        // Return empty response if no more pre-configured responses
        Ok(self.next_response()?.unwrap_or_default())
    }

    async fn create_stream(&self, params: CreateParams) -> AgentResult<ResponseStream> {
        self.record(&params)?;
        let scripted = self
            .streams
            .lock()
            .map_err(|_| AgentError::Provider("mock provider lock poisoned".into()))?
            .pop_front();
        let events = match scripted {
            Some(events) => events,
            None => response_to_events(&self.next_response()?.unwrap_or_default()),
        };
        Ok(ResponseStream::from_events(self.api_type, events).with_replay(self.replay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use crate::models::tool::ToolCallRequest;

    fn params() -> CreateParams {
        CreateParams::new(vec![Message::user("hi").unwrap().into()], vec![])
    }

    #[tokio::test]
    async fn test_responses_in_order_then_empty() {
        let provider = MockProvider::new(vec![
            CreateResponse::text("first"),
            CreateResponse::text("second"),
        ]);

        assert_eq!(provider.create(params()).await.unwrap().content, "first");
        assert_eq!(provider.create(params()).await.unwrap().content, "second");
        assert_eq!(provider.create(params()).await.unwrap().content, "");
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_flag_synthesizes_from_events() {
        let calls = vec![ToolCallRequest::turn("call_1", "echo", "{\"text\":\"hi\"}")];
        let provider =
            MockProvider::new(vec![CreateResponse::text("ok").with_tool_calls(calls.clone())]);

        let response = provider.create(params().streaming()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(response.tool_calls, calls);
    }
}
