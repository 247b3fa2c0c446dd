use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use url::Url;

use super::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use super::sse::{header_map, parse_url};
use super::Transport;
use crate::errors::{AgentError, AgentResult};
use crate::sse as events;

pub const SESSION_HEADER: &str = "mcp-session-id";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// JSON-RPC over POSTs to a single url. Each response is plain JSON or a short
/// event stream carrying it.
pub struct StreamableHttpTransport {
    client: Client,
    url: Url,
    headers: HeaderMap,
    timeout: Duration,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
}

impl StreamableHttpTransport {
    pub fn new(url: &str, headers: &HashMap<String, String>, timeout: Duration) -> AgentResult<Self> {
        Ok(Self {
            client: Client::new(),
            url: parse_url(url)?,
            headers: header_map(headers)?,
            timeout,
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
        })
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    async fn post(&self, body: &Value) -> AgentResult<Response> {
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);
        if let Some(session) = self.session_id.lock().await.as_deref() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("POST {} failed: {}", self.url, e)))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.lock().await;
            if current.as_deref() != Some(session) {
                tracing::debug!(target: "orion::bridge::http", url = %self.url, %session, "session established");
                *current = Some(session.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Transport(format!(
                "server returned {}: {}",
                status, text
            )));
        }
        Ok(response)
    }

    async fn read_response(&self, response: Response, id: u64) -> AgentResult<JsonRpcResponse> {
        if !events::is_event_stream(&response) {
            let body: Value = response
                .json()
                .await
                .map_err(|e| AgentError::Transport(format!("invalid JSON response: {}", e)))?;
            return JsonRpcResponse::from_message(&body)
                .ok_or_else(|| AgentError::Transport("body is not a JSON-RPC response".into()));
        }

        let mut stream = events::from_response(response);
        while let Some(event) = stream.next().await {
            let event = event?;
            if !events::is_message(&event) || event.data.trim().is_empty() {
                continue;
            }
            let message: Value = match serde_json::from_str(&event.data) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(target: "orion::bridge::http", error = %e, "unparsable message event");
                    continue;
                }
            };
            match JsonRpcResponse::from_message(&message) {
                Some(response) if response.id.as_u64() == Some(id) => return Ok(response),
                _ => {
                    tracing::debug!(target: "orion::bridge::http", %message, "skipping unrelated message")
                }
            }
        }
        Err(AgentError::Transport(format!(
            "event stream ended without a response to request {}",
            id
        )))
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn connect(&self) -> AgentResult<()> {
        // The session starts with the first POST
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> AgentResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))?;

        let exchange = async {
            let response = self.post(&body).await?;
            if response.status() == StatusCode::ACCEPTED {
                return Err(AgentError::Transport(format!(
                    "{} was accepted without a response",
                    method
                )));
            }
            self.read_response(response, id).await
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                tracing::warn!(target: "orion::bridge::http", %method, "Request timeout");
                AgentError::Transport(format!("{} timed out after {:?}", method, self.timeout))
            })??;
        response.into_result(method)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> AgentResult<()> {
        let body = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        tokio::time::timeout(self.timeout, self.post(&body))
            .await
            .map_err(|_| AgentError::Transport(format!("{} timed out", method)))??;
        Ok(())
    }

    async fn close(&self) -> AgentResult<()> {
        let Some(session) = self.session_id.lock().await.take() else {
            return Ok(());
        };
        let result = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_HEADER, &session)
            .timeout(self.timeout)
            .send()
            .await;
        match result {
            Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                tracing::debug!(target: "orion::bridge::http", %session, "server does not support session termination")
            }
            Ok(response) => {
                tracing::debug!(target: "orion::bridge::http", %session, status = %response.status(), "session terminated")
            }
            Err(e) => {
                tracing::warn!(target: "orion::bridge::http", %session, error = %e, "failed to terminate session")
            }
        }
        Ok(())
    }
}
