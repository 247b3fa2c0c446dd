use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use orion::agent::{Agent, AgentChunk, AgentConfig, AgentOutput};
use orion::diagnostics::{DiagnosticEvent, MemoryDiagnostics};
use orion::errors::{AgentError, AgentResult};
use orion::models::message::{ConversationItem, Message};
use orion::models::tool::{ApiType, ToolCallRequest, ToolCallResult, ToolDescriptor};
use orion::providers::base::{CreateParams, CreateResponse, Provider};
use orion::providers::mock::MockProvider;
use orion::stream::{accumulate, ResponseStream, StreamEvent};
use orion::tools::{FunctionTool, Tool};

fn echo_tool() -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        ToolDescriptor::new(
            "echo",
            "Repeat the message back",
            json!({
                "type": "object",
                "properties": {"msg": {"type": "string"}},
                "required": ["msg"]
            }),
        ),
        |args: Value| async move { Ok(args["msg"].as_str().unwrap_or_default().to_string()) },
    ))
}

fn user(text: &str) -> Message {
    Message::user(text).unwrap()
}

fn tool_results(params: &CreateParams) -> Vec<ToolCallResult> {
    params
        .items
        .iter()
        .filter_map(ConversationItem::as_tool_result)
        .cloned()
        .collect()
}

#[tokio::test]
async fn scenario_plain_answer() -> Result<()> {
    let provider = MockProvider::new(vec![CreateResponse::text("hi")]);
    let agent = Agent::new(Box::new(provider), AgentConfig::default());

    let output = agent.invoke(vec![user("hi")]).await?;
    assert_eq!(output, AgentOutput::Text("hi".to_string()));
    Ok(())
}

#[tokio::test]
async fn scenario_tool_round_feeds_result_back() -> Result<()> {
    let provider = MockProvider::new(vec![
        CreateResponse::default().with_tool_calls(vec![ToolCallRequest::turn(
            "call_1",
            "echo",
            "{\"msg\":\"x\"}",
        )]),
        CreateResponse::text("the tool said x"),
    ]);
    let agent = Agent::new(Box::new(provider.clone()), AgentConfig::default()).with_tool(echo_tool())?;

    let output = agent.invoke(vec![user("echo x")]).await?;
    assert_eq!(output.as_text(), Some("the tool said x"));

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        tool_results(&requests[1]),
        vec![ToolCallResult::new("call_1", "x", ApiType::Turn)]
    );
    assert_eq!(
        requests[1].items[2].as_tool_result().map(|r| r.to_value()),
        Some(json!({"role": "tool", "content": "x", "tool_call_id": "call_1"}))
    );
    Ok(())
}

#[tokio::test]
async fn scenario_unregistered_tool_is_skipped_and_observable() -> Result<()> {
    let diagnostics = Arc::new(MemoryDiagnostics::new());
    let provider = MockProvider::new(vec![
        CreateResponse::default().with_tool_calls(vec![
            ToolCallRequest::turn("call_1", "ghost", "{}"),
            ToolCallRequest::turn("call_2", "echo", "{\"msg\":\"real\"}"),
        ]),
        CreateResponse::text("done"),
    ]);
    let agent = Agent::new(Box::new(provider.clone()), AgentConfig::default())
        .with_tool(echo_tool())?
        .with_diagnostics(diagnostics.clone());

    let output = agent.invoke(vec![user("go")]).await?;
    assert_eq!(output.as_text(), Some("done"));

    let second = &provider.requests()[1];
    let results = tool_results(second);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].call_id, "call_2");

    match &second.items[1] {
        ConversationItem::ToolCalls { tool_calls, .. } => {
            let names: Vec<_> = tool_calls.iter().map(|c| c.name()).collect();
            assert_eq!(names, vec!["echo"]);
        }
        other => panic!("expected the assistant tool turn, got {:?}", other),
    }

    assert!(diagnostics.events().contains(&DiagnosticEvent::ToolSkipped {
        name: "ghost".to_string(),
        call_id: "call_1".to_string(),
    }));
    Ok(())
}

#[tokio::test]
async fn scenario_text_deltas_accumulate() -> Result<()> {
    let events = vec![
        StreamEvent::TextDelta("He".to_string()),
        StreamEvent::TextDelta("llo".to_string()),
        StreamEvent::TextDone,
    ];
    let response = accumulate(ApiType::EventStream, stream::iter(events).map(Ok)).await?;
    assert_eq!(response.content, "Hello");
    assert!(response.tool_calls.is_empty());
    Ok(())
}

/// Streams one delta and then never finishes
struct StallingProvider;

#[async_trait]
impl Provider for StallingProvider {
    fn api_type(&self) -> ApiType {
        ApiType::EventStream
    }

    async fn create(&self, _params: CreateParams) -> AgentResult<CreateResponse> {
        futures::future::pending().await
    }

    async fn create_stream(&self, _params: CreateParams) -> AgentResult<ResponseStream> {
        let events = stream::iter(vec![Ok(StreamEvent::TextDelta("par".to_string()))])
            .chain(stream::pending())
            .boxed();
        Ok(ResponseStream::new(ApiType::EventStream, events))
    }
}

#[tokio::test]
async fn scenario_cancel_ends_stream_with_cancelled() -> Result<()> {
    let agent = Agent::new(Box::new(StallingProvider), AgentConfig::default());
    let token = CancellationToken::new();
    let mut chunks = agent.invoke_stream(vec![user("go")], Some(token.clone()));

    let first = chunks.next().await.expect("first chunk")?;
    assert_eq!(first, AgentChunk::Text("par".to_string()));

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let next = tokio::time::timeout(Duration::from_secs(5), chunks.next()).await?;
    assert!(matches!(next, Some(Err(AgentError::Cancelled))));
    assert!(chunks.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn cancelled_before_start_yields_only_cancelled() -> Result<()> {
    let provider = MockProvider::new(vec![CreateResponse::text("never")]);
    let agent = Agent::new(Box::new(provider.clone()), AgentConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    let chunks: Vec<_> = agent
        .invoke_stream(vec![user("go")], Some(token))
        .collect()
        .await;
    assert_eq!(chunks, vec![Err(AgentError::Cancelled)]);
    assert!(provider.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn event_stream_round_uses_function_call_output() -> Result<()> {
    let provider = MockProvider::new(vec![
        CreateResponse::default().with_tool_calls(vec![ToolCallRequest::event_stream(
            "fc_1",
            "call_9",
            "echo",
            "{\"msg\":\"y\"}",
        )]),
        CreateResponse::text("ok"),
    ])
    .with_api_type(ApiType::EventStream);
    let agent = Agent::new(Box::new(provider.clone()), AgentConfig::default()).with_tool(echo_tool())?;

    let chunks: Vec<AgentChunk> = agent
        .invoke_stream(vec![user("go")], None)
        .try_collect()
        .await?;
    assert_eq!(chunks.last(), Some(&AgentChunk::Done(AgentOutput::Text("ok".into()))));

    let results = tool_results(&provider.requests()[1]);
    assert_eq!(
        results[0].to_value(),
        json!({"type": "function_call_output", "call_id": "call_9", "output": "y"})
    );
    Ok(())
}

#[tokio::test]
async fn concurrent_calls_keep_request_order() -> Result<()> {
    let slow = Arc::new(FunctionTool::new(
        ToolDescriptor::new("slow", "Sleeps, then answers", json!({"type": "object"})),
        |args: Value| async move {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(format!("slept {}", ms))
        },
    ));
    let provider = MockProvider::new(vec![CreateResponse::default().with_tool_calls(vec![
        ToolCallRequest::turn("a", "slow", "{\"ms\":60}"),
        ToolCallRequest::turn("b", "slow", "{\"ms\":1}"),
    ])]);
    let agent = Agent::new(
        Box::new(provider),
        AgentConfig::default().stop_on_first_tool_round(true),
    )
    .with_tool(slow)?;

    match agent.invoke(vec![user("go")]).await? {
        AgentOutput::ToolResults(results) => {
            let ids: Vec<_> = results.iter().map(|r| r.call_id.as_str()).collect();
            assert_eq!(ids, vec!["a", "b"]);
            assert_eq!(results[0].output, "slept 60");
        }
        other => panic!("expected tool results, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn truncated_tool_arguments_are_fed_back_as_a_failure() -> Result<()> {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let echo = Arc::new(FunctionTool::new(
        ToolDescriptor::new("echo", "Repeat the message back", json!({"type": "object"})),
        move |args: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(args["msg"].as_str().unwrap_or_default().to_string())
            }
        },
    ));
    // The first stream stops mid-arguments, with no ToolDone or Completed
    let provider = MockProvider::with_streams(
        ApiType::Turn,
        vec![
            vec![
                StreamEvent::ToolAdded {
                    index: 0,
                    id: "call_1".to_string(),
                    call_id: None,
                    name: "echo".to_string(),
                },
                StreamEvent::ToolArgumentsDelta("{\"msg\": \"ha".to_string()),
            ],
            vec![StreamEvent::TextDelta("ok".to_string()), StreamEvent::TextDone],
        ],
    );
    let agent = Agent::new(Box::new(provider.clone()), AgentConfig::default()).with_tool(echo)?;

    let chunks: Vec<AgentChunk> = agent
        .invoke_stream(vec![user("go")], None)
        .try_collect()
        .await?;

    let result = chunks
        .iter()
        .find_map(|chunk| match chunk {
            AgentChunk::ToolResult(result) => Some(result.clone()),
            _ => None,
        })
        .expect("tool result chunk");
    assert_eq!(result.call_id, "call_1");
    assert!(result.output.starts_with("Error: Invalid tool arguments"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(chunks.last(), Some(&AgentChunk::Done(AgentOutput::Text("ok".into()))));

    let fed_back = tool_results(&provider.requests()[1]);
    assert_eq!(fed_back[0].output, result.output);
    Ok(())
}

#[tokio::test]
async fn cancelling_the_stream_reaches_running_tools() -> Result<()> {
    let started = Arc::new(Notify::new());
    let stopped = Arc::new(AtomicBool::new(false));
    let (started_tx, stopped_tx) = (started.clone(), stopped.clone());
    let worker = Arc::new(FunctionTool::cancellable(
        ToolDescriptor::new("worker", "Works until cancelled", json!({"type": "object"})),
        move |_args: Value, cancel: CancellationToken| {
            let (started, stopped) = (started_tx.clone(), stopped_tx.clone());
            async move {
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    stopped.store(true, Ordering::SeqCst);
                });
                started.notify_one();
                futures::future::pending::<anyhow::Result<String>>().await
            }
        },
    ));
    let provider = MockProvider::new(vec![CreateResponse::default().with_tool_calls(vec![
        ToolCallRequest::turn("call_1", "worker", "{}"),
    ])]);
    let agent = Agent::new(Box::new(provider), AgentConfig::default()).with_tool(worker)?;

    let token = CancellationToken::new();
    let mut chunks = agent.invoke_stream(vec![user("go")], Some(token.clone()));
    let canceller = token.clone();
    tokio::spawn(async move {
        started.notified().await;
        canceller.cancel();
    });

    let last = tokio::time::timeout(Duration::from_secs(5), async {
        let mut last = None;
        while let Some(chunk) = chunks.next().await {
            last = Some(chunk);
        }
        last
    })
    .await?;
    assert!(matches!(last, Some(Err(AgentError::Cancelled))));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !stopped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    Ok(())
}

#[test]
fn tool_results_decode_back_from_both_shapes() {
    for api_type in [ApiType::Turn, ApiType::EventStream] {
        let result = ToolCallResult::new("call_7", "output text", api_type);
        let decoded = ToolCallResult::from_value(&result.to_value()).unwrap();
        assert_eq!(decoded.call_id, "call_7");
        assert_eq!(decoded.output, "output text");
    }
}
