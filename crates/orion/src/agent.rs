use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cancel;
use crate::diagnostics::{DiagnosticEvent, Diagnostics, TracingDiagnostics};
use crate::errors::{AgentError, AgentResult};
use crate::models::message::{ConversationItem, Message};
use crate::models::tool::{ToolCallRequest, ToolCallResult, ToolDescriptor};
use crate::providers::base::{CreateParams, CreateResponse, Provider};
use crate::stream::{AccumulatorState, StreamEvent};
use crate::tools::{Tool, ToolArguments, ToolSet};

/// What happens when a tool rejects its arguments or fails while running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorPolicy {
    /// Report the error to the model as the tool's output
    #[default]
    FeedBack,
    /// Stop the invocation with the error
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub system_message: String,
    /// Return the first round's tool results instead of asking the model again
    pub stop_on_first_tool_round: bool,
    pub tool_error_policy: ToolErrorPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "assistant".to_string(),
            system_message: String::new(),
            stop_on_first_tool_round: false,
            tool_error_policy: ToolErrorPolicy::default(),
        }
    }
}

impl AgentConfig {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_system_message<S: Into<String>>(mut self, system_message: S) -> Self {
        self.system_message = system_message.into();
        self
    }

    pub fn stop_on_first_tool_round(mut self, stop: bool) -> Self {
        self.stop_on_first_tool_round = stop;
        self
    }

    pub fn with_tool_error_policy(mut self, policy: ToolErrorPolicy) -> Self {
        self.tool_error_policy = policy;
        self
    }
}

/// The result of one invocation
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Text(String),
    ToolResults(Vec<ToolCallResult>),
}

impl AgentOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AgentOutput::Text(text) => Some(text),
            AgentOutput::ToolResults(_) => None,
        }
    }
}

/// A normalized piece of a streamed invocation
#[derive(Debug, Clone, PartialEq)]
pub enum AgentChunk {
    Text(String),
    Thought(String),
    ToolArguments {
        index: usize,
        name: String,
        delta: String,
    },
    ToolResult(ToolCallResult),
    Done(AgentOutput),
}

/// Agent drives a model through as many tool rounds as it asks for
pub struct Agent {
    config: AgentConfig,
    provider: Box<dyn Provider>,
    tools: ToolSet,
    diagnostics: Arc<dyn Diagnostics>,
}

impl Agent {
    pub fn new(provider: Box<dyn Provider>, config: AgentConfig) -> Self {
        Self {
            config,
            provider,
            tools: ToolSet::new(),
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> AgentResult<Self> {
        self.add_tool(tool)?;
        Ok(self)
    }

    pub fn with_tools<I>(mut self, tools: I) -> AgentResult<Self>
    where
        I: IntoIterator<Item = Arc<dyn Tool>>,
    {
        for tool in tools {
            self.add_tool(tool)?;
        }
        Ok(self)
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn add_tool(&mut self, tool: Arc<dyn Tool>) -> AgentResult<()> {
        self.tools.add(tool)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn system_message(&self) -> &str {
        &self.config.system_message
    }

    /// Replace the system message used by later invocations
    pub fn update_system_message<S: Into<String>>(&mut self, system_message: S) {
        self.config.system_message = system_message.into();
    }

    fn initial_items(&self, messages: Vec<Message>) -> AgentResult<Vec<ConversationItem>> {
        let mut items = Vec::with_capacity(messages.len() + 1);
        if !self.config.system_message.is_empty() {
            items.push(Message::system(self.config.system_message.as_str())?.into());
        }
        items.extend(messages.into_iter().map(ConversationItem::from));
        Ok(items)
    }

    fn params(&self, items: &[ConversationItem], tools: &[ToolDescriptor]) -> CreateParams {
        CreateParams::new(items.to_vec(), tools.to_vec())
    }

    /// Drop calls to tools that are not registered, recording each skip
    fn registered_calls(&self, response: &CreateResponse) -> Vec<ToolCallRequest> {
        self.diagnostics.record(DiagnosticEvent::ModelResponded {
            agent: self.config.name.clone(),
            api_type: self.provider.api_type(),
            tool_calls: response.tool_calls.len(),
        });
        response
            .tool_calls
            .iter()
            .filter(|call| {
                let registered = self.tools.get(call.name()).is_some();
                if !registered {
                    self.diagnostics.record(DiagnosticEvent::ToolSkipped {
                        name: call.name().to_string(),
                        call_id: call.call_id().to_string(),
                    });
                }
                registered
            })
            .cloned()
            .collect()
    }

    async fn run_call(
        &self,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> AgentResult<ToolCallResult> {
        let tool = self
            .tools
            .get(call.name())
            .ok_or_else(|| AgentError::ToolNotFound(call.name().to_string()))?;

        let output = match tool
            .run_with_cancel(ToolArguments::from(call.arguments()), cancel.clone())
            .await
        {
            Ok(output) => {
                self.diagnostics.record(DiagnosticEvent::ToolCompleted {
                    name: call.name().to_string(),
                    call_id: call.call_id().to_string(),
                });
                output
            }
            Err(e) => {
                self.diagnostics.record(DiagnosticEvent::ToolFailed {
                    name: call.name().to_string(),
                    call_id: call.call_id().to_string(),
                    error: e.to_string(),
                });
                if e.is_recoverable_tool_error()
                    && self.config.tool_error_policy == ToolErrorPolicy::FeedBack
                {
                    format!("Error: {}", e)
                } else {
                    return Err(e);
                }
            }
        };
        Ok(ToolCallResult::new(call.call_id(), output, call.api_type()))
    }

    /// Run every call of a round concurrently. Results keep the request order.
    async fn dispatch(
        &self,
        calls: &[ToolCallRequest],
        cancel: &CancellationToken,
    ) -> AgentResult<Vec<ToolCallResult>> {
        join_all(calls.iter().map(|call| self.run_call(call, cancel)))
            .await
            .into_iter()
            .collect()
    }

    fn record_round(&self, round: usize, items: &[ConversationItem]) {
        self.diagnostics.record(DiagnosticEvent::RoundStarted {
            agent: self.config.name.clone(),
            round,
            items: items.len(),
        });
    }

    /// Run the conversation to completion and return the final answer, or the first
    /// round's tool results when `stop_on_first_tool_round` is set.
    pub async fn invoke(&self, messages: Vec<Message>) -> AgentResult<AgentOutput> {
        self.run(messages)
            .await
            .map_err(|e| e.within("Agent::invoke"))
    }

    async fn run(&self, messages: Vec<Message>) -> AgentResult<AgentOutput> {
        let mut items = self.initial_items(messages)?;
        let tools = self.tools.descriptors();
        let mut round = 0;

        loop {
            self.record_round(round, &items);
            round += 1;
            let response = self.provider.create(self.params(&items, &tools)).await?;
            let calls = self.registered_calls(&response);
            if calls.is_empty() {
                return Ok(AgentOutput::Text(response.content));
            }

            let results = self.dispatch(&calls, &CancellationToken::new()).await?;
            if self.config.stop_on_first_tool_round {
                return Ok(AgentOutput::ToolResults(results));
            }
            items.push(ConversationItem::ToolCalls {
                content: response.content,
                tool_calls: calls,
            });
            items.extend(results.into_iter().map(ConversationItem::from));
        }
    }

    /// Stream the conversation as chunks. Tool calls run once the model's stream ends;
    /// the following rounds stream through the same sequence. Firing `cancel` ends the
    /// sequence with a single `Cancelled` error.
    pub fn invoke_stream(
        &self,
        messages: Vec<Message>,
        cancel: Option<CancellationToken>,
    ) -> BoxStream<'_, AgentResult<AgentChunk>> {
        let chunks = async_stream::try_stream! {
            let mut items = self.initial_items(messages)?;
            let tools = self.tools.descriptors();
            let tool_cancel = cancel.clone().unwrap_or_default();
            let mut round = 0;

            'rounds: loop {
                self.record_round(round, &items);
                round += 1;

                let params = self.params(&items, &tools).streaming();
                let mut events =
                    cancel::link(cancel.as_ref(), self.provider.create_stream(params)).await?;
                let mut state = AccumulatorState::new(events.api_type());
                let mut current_tool: Option<(usize, String)> = None;

                loop {
                    let next = cancel::link(cancel.as_ref(), async {
                        events.next().await.transpose()
                    })
                    .await?;
                    let event = match next {
                        Some(event) => event,
                        None => break,
                    };
                    state = state.apply(&event)?;

                    match event {
                        StreamEvent::TextDelta(delta) => {
                            yield AgentChunk::Text(delta);
                        }
                        StreamEvent::ThoughtDelta(delta) => {
                            yield AgentChunk::Thought(delta);
                        }
                        StreamEvent::ToolAdded { index, name, .. } => {
                            current_tool = Some((index, name));
                        }
                        StreamEvent::ToolArgumentsDelta(delta) => {
                            if let Some((index, name)) = &current_tool {
                                yield AgentChunk::ToolArguments {
                                    index: *index,
                                    name: name.clone(),
                                    delta,
                                };
                            }
                        }
                        _ => {}
                    }
                }

                let response = state.finish();
                let calls = self.registered_calls(&response);
                if calls.is_empty() {
                    yield AgentChunk::Done(AgentOutput::Text(response.content));
                    break 'rounds;
                }

                let results =
                    cancel::link(cancel.as_ref(), self.dispatch(&calls, &tool_cancel)).await?;
                for result in &results {
                    yield AgentChunk::ToolResult(result.clone());
                }
                if self.config.stop_on_first_tool_round {
                    yield AgentChunk::Done(AgentOutput::ToolResults(results));
                    break 'rounds;
                }
                items.push(ConversationItem::ToolCalls {
                    content: response.content,
                    tool_calls: calls,
                });
                items.extend(results.into_iter().map(ConversationItem::from));
            }
        };

        chunks
            .map(|chunk: AgentResult<AgentChunk>| chunk.map_err(|e| e.within("Agent::invoke_stream")))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemoryDiagnostics;
    use crate::models::role::Role;
    use crate::models::tool::ApiType;
    use crate::providers::mock::MockProvider;
    use crate::tools::FunctionTool;
    use futures::TryStreamExt;
    use serde_json::{json, Value};

    fn echo_tool() -> Arc<dyn Tool> {
        Arc::new(FunctionTool::new(
            ToolDescriptor::new(
                "echo",
                "Echo the message",
                json!({
                    "type": "object",
                    "properties": {"msg": {"type": "string"}},
                    "required": ["msg"]
                }),
            ),
            |args: Value| async move { Ok(args["msg"].as_str().unwrap_or_default().to_string()) },
        ))
    }

    fn agent(provider: MockProvider) -> Agent {
        Agent::new(Box::new(provider), AgentConfig::new("test"))
            .with_tool(echo_tool())
            .unwrap()
    }

    #[tokio::test]
    async fn test_system_message_is_prepended_unless_empty() {
        let provider = MockProvider::new(vec![CreateResponse::text("a"), CreateResponse::text("b")]);
        let mut agent = Agent::new(
            Box::new(provider.clone()),
            AgentConfig::new("test").with_system_message("Be brief"),
        );

        agent.invoke(vec![Message::user("hi").unwrap()]).await.unwrap();
        agent.update_system_message("");
        agent.invoke(vec![Message::user("hi").unwrap()]).await.unwrap();

        let requests = provider.requests();
        let first = requests[0].items[0].as_message().unwrap();
        assert_eq!(first.role(), Role::System);
        assert_eq!(first.text(), "Be brief");
        assert_eq!(requests[1].items.len(), 1);
        assert_eq!(requests[1].items[0].as_message().unwrap().role(), Role::User);
    }

    #[tokio::test]
    async fn test_tool_errors_are_fed_back() {
        let provider = MockProvider::new(vec![
            CreateResponse::default()
                .with_tool_calls(vec![ToolCallRequest::turn("c1", "echo", "{\"msg\": 1}")]),
            CreateResponse::text("sorry"),
        ]);
        let agent = agent(provider.clone());

        let output = agent.invoke(vec![Message::user("go").unwrap()]).await.unwrap();
        assert_eq!(output, AgentOutput::Text("sorry".into()));

        let second = &provider.requests()[1];
        let result = second.items.last().unwrap().as_tool_result().unwrap();
        assert!(result.output.starts_with("Error: Invalid tool arguments"));
    }

    #[tokio::test]
    async fn test_abort_policy_propagates_wrapped() {
        let provider = MockProvider::new(vec![CreateResponse::default()
            .with_tool_calls(vec![ToolCallRequest::turn("c1", "echo", "not json")])]);
        let agent = Agent::new(
            Box::new(provider),
            AgentConfig::new("test").with_tool_error_policy(ToolErrorPolicy::Abort),
        )
        .with_tool(echo_tool())
        .unwrap();

        let err = agent.invoke(vec![Message::user("go").unwrap()]).await.unwrap_err();
        assert!(matches!(err, AgentError::Method { ref method, .. } if method == "Agent::invoke"));
        assert!(matches!(err.root(), AgentError::InvalidToolArguments(_)));
    }

    #[tokio::test]
    async fn test_stop_on_first_tool_round() {
        let provider = MockProvider::new(vec![CreateResponse::default().with_tool_calls(vec![
            ToolCallRequest::turn("c1", "echo", "{\"msg\":\"one\"}"),
            ToolCallRequest::turn("c2", "echo", "{\"msg\":\"two\"}"),
        ])]);
        let agent = Agent::new(
            Box::new(provider.clone()),
            AgentConfig::new("test").stop_on_first_tool_round(true),
        )
        .with_tool(echo_tool())
        .unwrap();

        let output = agent.invoke(vec![Message::user("go").unwrap()]).await.unwrap();
        assert_eq!(
            output,
            AgentOutput::ToolResults(vec![
                ToolCallResult::new("c1", "one", ApiType::Turn),
                ToolCallResult::new("c2", "two", ApiType::Turn),
            ])
        );
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_only_unregistered_calls_ends_with_text() {
        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let provider = MockProvider::new(vec![CreateResponse::text("done")
            .with_tool_calls(vec![ToolCallRequest::turn("c1", "ghost", "{}")])]);
        let agent = agent(provider.clone()).with_diagnostics(diagnostics.clone());

        let output = agent.invoke(vec![Message::user("go").unwrap()]).await.unwrap();
        assert_eq!(output, AgentOutput::Text("done".into()));
        assert_eq!(diagnostics.skipped(), vec!["ghost".to_string()]);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_yields_text_and_tool_chunks() {
        let provider = MockProvider::with_streams(
            ApiType::EventStream,
            vec![
                vec![
                    StreamEvent::ToolAdded {
                        index: 0,
                        id: "fc_1".into(),
                        call_id: Some("call_1".into()),
                        name: "echo".into(),
                    },
                    StreamEvent::ToolArgumentsDelta("{\"msg\":".into()),
                    StreamEvent::ToolArgumentsDelta("\"hey\"}".into()),
                    StreamEvent::ToolDone { index: 0 },
                    StreamEvent::Completed { finish_reason: None, usage: None },
                ],
                vec![
                    StreamEvent::TextDelta("fin".into()),
                    StreamEvent::TextDelta("ished".into()),
                    StreamEvent::TextDone,
                ],
            ],
        );
        let agent = agent(provider.clone());

        let chunks: Vec<AgentChunk> = agent
            .invoke_stream(vec![Message::user("go").unwrap()], None)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(
            chunks,
            vec![
                AgentChunk::ToolArguments { index: 0, name: "echo".into(), delta: "{\"msg\":".into() },
                AgentChunk::ToolArguments { index: 0, name: "echo".into(), delta: "\"hey\"}".into() },
                AgentChunk::ToolResult(ToolCallResult::new("call_1", "hey", ApiType::EventStream)),
                AgentChunk::Text("fin".into()),
                AgentChunk::Text("ished".into()),
                AgentChunk::Done(AgentOutput::Text("finished".into())),
            ]
        );

        let second = &provider.requests()[1];
        assert!(second.stream);
        match &second.items[1] {
            ConversationItem::ToolCalls { tool_calls, .. } => {
                assert_eq!(tool_calls[0].call_id(), "call_1");
                assert_eq!(tool_calls[0].arguments(), "{\"msg\":\"hey\"}");
            }
            other => panic!("expected tool calls, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_stream_is_wrapped() {
        let provider = MockProvider::with_streams(
            ApiType::Turn,
            vec![vec![StreamEvent::ToolArgumentsDelta("{}".into())]],
        );
        let agent = agent(provider);

        let err = agent
            .invoke_stream(vec![Message::user("go").unwrap()], None)
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err.root(), AgentError::Stream(_)));
        assert!(err.to_string().starts_with("Agent::invoke_stream"));
    }
}
