//! Rebuilding a complete response from streamed deltas.
//!
//! Adapters decode their vendor payloads into [`StreamEvent`]s. [`AccumulatorState`] folds
//! those events into a [`CreateResponse`]: text deltas append to the content, a tool
//! announcement opens a new call, and argument deltas append to whichever call was
//! announced last.
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};

use crate::errors::{AgentError, AgentResult};
use crate::models::tool::{ApiType, ToolCallRequest};
use crate::providers::base::{CreateResponse, Usage};

/// A normalized streaming event
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    TextDone,
    /// Reasoning text, kept apart from the answer
    ThoughtDelta(String),
    ToolAdded {
        index: usize,
        id: String,
        call_id: Option<String>,
        name: String,
    },
    /// Appends to the most recently announced tool call
    ToolArgumentsDelta(String),
    ToolDone {
        index: usize,
    },
    /// The terminal event; the only source of usage and finish reason
    Completed {
        finish_reason: Option<String>,
        usage: Option<Usage>,
    },
}

#[derive(Debug, Clone)]
struct PendingCall {
    index: usize,
    request: ToolCallRequest,
    done: bool,
}

/// Fold state for one stream. Build it fresh per stream.
#[derive(Debug, Clone)]
pub struct AccumulatorState {
    api_type: ApiType,
    content: String,
    thought: String,
    tool_calls: Vec<PendingCall>,
    current_tool_index: Option<usize>,
    text_done: bool,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl AccumulatorState {
    pub fn new(api_type: ApiType) -> Self {
        Self {
            api_type,
            content: String::new(),
            thought: String::new(),
            tool_calls: Vec::new(),
            current_tool_index: None,
            text_done: false,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn apply(mut self, event: &StreamEvent) -> AgentResult<Self> {
        match event {
            StreamEvent::TextDelta(delta) => self.content.push_str(delta),
            StreamEvent::TextDone => self.text_done = true,
            StreamEvent::ThoughtDelta(delta) => self.thought.push_str(delta),
            StreamEvent::ToolAdded {
                index,
                id,
                call_id,
                name,
            } => {
                if self.position(*index).is_some() {
                    return Err(AgentError::Stream(format!(
                        "tool call {} announced twice",
                        index
                    )));
                }
                self.tool_calls.push(PendingCall {
                    index: *index,
                    request: ToolCallRequest::empty(self.api_type, id, call_id.as_deref(), name),
                    done: false,
                });
                self.current_tool_index = Some(*index);
            }
            StreamEvent::ToolArgumentsDelta(delta) => {
                let position = self
                    .current_tool_index
                    .and_then(|index| self.position(index))
                    .ok_or_else(|| {
                        AgentError::Stream("tool arguments before any tool call".to_string())
                    })?;
                let call = &mut self.tool_calls[position];
                if call.done {
                    return Err(AgentError::Stream(format!(
                        "tool arguments after tool call {} finished",
                        call.index
                    )));
                }
                call.request.push_arguments(delta);
            }
            StreamEvent::ToolDone { index } => {
                let position = self.position(*index).ok_or_else(|| {
                    AgentError::Stream(format!("unknown tool call {} finished", index))
                })?;
                self.tool_calls[position].done = true;
            }
            StreamEvent::Completed {
                finish_reason,
                usage,
            } => {
                self.finish_reason = finish_reason.clone();
                self.usage = usage.clone();
            }
        }
        Ok(self)
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.tool_calls.iter().position(|call| call.index == index)
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_text_done(&self) -> bool {
        self.text_done
    }

    /// Partial arguments of unfinished calls are kept as they are.
    pub fn finish(self) -> CreateResponse {
        let mut calls = self.tool_calls;
        calls.sort_by_key(|call| call.index);
        CreateResponse {
            content: self.content,
            finish_reason: self.finish_reason,
            tool_calls: calls.into_iter().map(|call| call.request).collect(),
            usage: self.usage,
            thought: if self.thought.is_empty() {
                None
            } else {
                Some(self.thought)
            },
        }
    }
}

/// Drain a stream of events into one response
pub async fn accumulate<S>(api_type: ApiType, events: S) -> AgentResult<CreateResponse>
where
    S: Stream<Item = AgentResult<StreamEvent>>,
{
    let state = events
        .try_fold(AccumulatorState::new(api_type), |state, event| async move {
            state.apply(&event)
        })
        .await?;
    Ok(state.finish())
}

/// Whether a drained stream can be played back again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamReplay {
    #[default]
    Unsupported,
    Cached,
}

/// The event stream returned by a provider
pub struct ResponseStream {
    api_type: ApiType,
    inner: Option<BoxStream<'static, AgentResult<StreamEvent>>>,
    replay: StreamReplay,
    cache: Vec<StreamEvent>,
}

impl ResponseStream {
    pub fn new(api_type: ApiType, events: BoxStream<'static, AgentResult<StreamEvent>>) -> Self {
        Self {
            api_type,
            inner: Some(events),
            replay: StreamReplay::Unsupported,
            cache: Vec::new(),
        }
    }

    pub fn from_events(api_type: ApiType, events: Vec<StreamEvent>) -> Self {
        Self::new(api_type, stream::iter(events.into_iter().map(Ok)).boxed())
    }

    pub fn with_replay(mut self, replay: StreamReplay) -> Self {
        self.replay = replay;
        self
    }

    pub fn api_type(&self) -> ApiType {
        self.api_type
    }

    pub fn is_drained(&self) -> bool {
        self.inner.is_none()
    }

    /// A fresh stream over the events already delivered
    pub fn replay(&self) -> AgentResult<BoxStream<'static, AgentResult<StreamEvent>>> {
        match self.replay {
            StreamReplay::Unsupported => Err(AgentError::UnsupportedOperation(
                "this provider does not support stream replay".to_string(),
            )),
            StreamReplay::Cached if !self.is_drained() => Err(AgentError::UnsupportedOperation(
                "replay is only available once the stream is drained".to_string(),
            )),
            StreamReplay::Cached => {
                Ok(stream::iter(self.cache.clone().into_iter().map(Ok)).boxed())
            }
        }
    }

    /// Drain the remaining events into one response
    pub async fn into_response(mut self) -> AgentResult<CreateResponse> {
        let api_type = self.api_type;
        accumulate(api_type, &mut self).await
    }
}

impl Stream for ResponseStream {
    type Item = AgentResult<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let inner = match this.inner.as_mut() {
            Some(inner) => inner,
            None => return Poll::Ready(None),
        };
        match inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(event))) => {
                if this.replay == StreamReplay::Cached {
                    this.cache.push(event.clone());
                }
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
