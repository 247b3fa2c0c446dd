use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;

use super::protocol::{JsonRpcNotification, JsonRpcRequest, PendingRequests};
use super::Transport;
use crate::errors::{AgentError, AgentResult};
use crate::sse::{self as events, SseStream};

pub(crate) fn parse_url(url: &str) -> AgentResult<Url> {
    Url::parse(url).map_err(|e| AgentError::Transport(format!("invalid url {}: {}", url, e)))
}

pub(crate) fn header_map(headers: &HashMap<String, String>) -> AgentResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AgentError::Transport(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AgentError::Transport(format!("invalid header value for {}: {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// The legacy HTTP+SSE transport: server-to-client messages arrive on one long-lived
/// event stream, client-to-server messages are POSTed to the endpoint it announces.
pub struct SseTransport {
    client: Client,
    url: Url,
    headers: HeaderMap,
    timeout: Duration,
    endpoint: Mutex<Option<Url>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<PendingRequests>,
}

impl SseTransport {
    pub fn new(url: &str, headers: &HashMap<String, String>, timeout: Duration) -> AgentResult<Self> {
        Ok(Self {
            client: Client::new(),
            url: parse_url(url)?,
            headers: header_map(headers)?,
            timeout,
            endpoint: Mutex::new(None),
            listener: Mutex::new(None),
            pending: Arc::new(PendingRequests::new()),
        })
    }

    async fn wait_for_endpoint(&self, events: &mut SseStream) -> AgentResult<Url> {
        while let Some(event) = events.next().await {
            let event = event?;
            if event.event == "endpoint" {
                return self.url.join(event.data.trim()).map_err(|e| {
                    AgentError::Transport(format!("invalid endpoint {}: {}", event.data, e))
                });
            }
            tracing::debug!(target: "orion::bridge::sse", event = %event.event, "event before endpoint");
        }
        Err(AgentError::Transport(
            "event stream ended before the endpoint event".into(),
        ))
    }

    fn listen(&self, mut events: SseStream) -> JoinHandle<()> {
        let pending = self.pending.clone();
        let peer = self.url.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) if events::is_message(&event) => {
                        match serde_json::from_str::<Value>(&event.data) {
                            Ok(message) => pending.dispatch(&message, &peer).await,
                            Err(e) => {
                                tracing::warn!(target: "orion::bridge::sse", %peer, error = %e, "unparsable message event")
                            }
                        }
                    }
                    Ok(event) => {
                        tracing::debug!(target: "orion::bridge::sse", %peer, event = %event.event, "ignoring event")
                    }
                    Err(e) => {
                        tracing::warn!(target: "orion::bridge::sse", %peer, error = %e, "event stream failed");
                        break;
                    }
                }
            }
            pending.fail_all().await;
            tracing::debug!(target: "orion::bridge::sse", %peer, "event stream closed");
        })
    }

    async fn post<T: Serialize>(&self, message: &T) -> AgentResult<()> {
        let endpoint = self
            .endpoint
            .lock()
            .await
            .clone()
            .ok_or_else(|| AgentError::Transport(format!("{} is not connected", self.url)))?;
        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .json(message)
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("POST failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AgentError::Transport(format!(
                "POST rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self) -> AgentResult<()> {
        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("GET {} failed: {}", self.url, e)))?;
        if !response.status().is_success() {
            return Err(AgentError::Transport(format!(
                "GET {} returned status {}",
                self.url,
                response.status()
            )));
        }

        let mut stream = events::from_response(response);
        let endpoint = tokio::time::timeout(self.timeout, self.wait_for_endpoint(&mut stream))
            .await
            .map_err(|_| AgentError::Transport("timed out waiting for the endpoint event".into()))??;

        tracing::info!(target: "orion::bridge::sse", url = %self.url, %endpoint, "connected");
        *self.endpoint.lock().await = Some(endpoint);
        *self.listener.lock().await = Some(self.listen(stream));
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> AgentResult<Value> {
        let id = self.pending.next_id();
        let rx = self.pending.register(id).await;
        if let Err(e) = self.post(&JsonRpcRequest::new(id, method, params)).await {
            self.pending.forget(id).await;
            return Err(e);
        }
        self.pending.wait(id, rx, self.timeout, method).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> AgentResult<()> {
        self.post(&JsonRpcNotification::new(method, params)).await
    }

    async fn close(&self) -> AgentResult<()> {
        self.endpoint.lock().await.take();
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        self.pending.fail_all().await;
        Ok(())
    }
}
