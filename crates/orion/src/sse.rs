//! Server-sent events, shared by the streaming providers and the HTTP bridges.
use bytes::Bytes;
use eventsource_stream::{Event, Eventsource};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::errors::{AgentError, AgentResult};

pub type SseStream = BoxStream<'static, AgentResult<Event>>;

/// Decode a byte stream into events. Decoder failures surface as `Stream` errors.
pub fn decode<S, E>(bytes: S) -> SseStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    bytes
        .eventsource()
        .map(|event| event.map_err(|e| AgentError::Stream(format!("SSE error: {}", e))))
        .boxed()
}

/// Decode the body of an HTTP response
pub fn from_response(response: reqwest::Response) -> SseStream {
    decode(response.bytes_stream())
}

/// The OpenAI family ends a stream with a literal `[DONE]` payload
pub fn is_done(event: &Event) -> bool {
    event.data.trim() == "[DONE]"
}

/// An event without an explicit name is a `message` event
pub fn is_message(event: &Event) -> bool {
    event.event.is_empty() || event.event == "message"
}

pub fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_decode_split_chunks() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from("event: endpoint\nda")),
            Ok(Bytes::from("ta: /messages?session=1\n\n")),
            Ok(Bytes::from("data: {\"a\":1}\n\ndata: [DONE]\n\n")),
        ];
        let events: Vec<Event> = decode(stream::iter(chunks))
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?session=1");
        assert!(is_message(&events[1]));
        assert_eq!(events[1].data, "{\"a\":1}");
        assert!(is_done(&events[2]));
    }
}
