//! JSON-RPC 2.0 messages and the MCP payloads carried in them.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};

use crate::errors::{AgentError, AgentResult};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "orion";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: json!(id),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Parse an incoming message, ignoring anything that is not a response
    pub fn from_message(message: &Value) -> Option<Self> {
        if message.get("id").is_none()
            || (message.get("result").is_none() && message.get("error").is_none())
        {
            return None;
        }
        serde_json::from_value(message.clone()).ok()
    }

    pub fn into_result(self, method: &str) -> AgentResult<Value> {
        if let Some(error) = self.error {
            return Err(AgentError::Transport(format!(
                "{} failed: {} (code: {})",
                method, error.message, error.code
            )));
        }
        self.result.ok_or_else(|| {
            AgentError::Transport(format!("{} returned no result", method))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<McpToolInfo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "mimeType", default)]
        mime_type: Option<String>,
    },
    Resource {
        resource: ResourceContents,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    /// The text of every content block, one per line
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ToolContent::Text { text } => Some(text.clone()),
                ToolContent::Resource { resource } => Some(
                    resource
                        .text
                        .clone()
                        .unwrap_or_else(|| format!("[resource: {}]", resource.uri)),
                ),
                ToolContent::Image { .. } => Some("[image content]".to_string()),
                ToolContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }
}

/// Requests waiting for a response that arrives on another channel
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn register(&self, id: u64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(id, tx);
        rx
    }

    pub async fn forget(&self, id: u64) {
        self.waiting.lock().await.remove(&id);
    }

    /// Route an incoming message to the request it answers
    pub async fn dispatch(&self, message: &Value, peer: &str) {
        let Some(response) = JsonRpcResponse::from_message(message) else {
            tracing::debug!(target: "orion::bridge", %peer, %message, "ignoring non-response message");
            return;
        };
        let Some(id) = response.id.as_u64() else {
            tracing::warn!(target: "orion::bridge", %peer, id = %response.id, "response with non-numeric id");
            return;
        };
        match self.waiting.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::warn!(target: "orion::bridge", %peer, id, "Received response for unknown request")
            }
        }
    }

    pub async fn is_waiting(&self, id: u64) -> bool {
        self.waiting.lock().await.contains_key(&id)
    }

    /// Drop every waiter; their receivers observe a closed channel
    pub async fn fail_all(&self) {
        self.waiting.lock().await.clear();
    }

    /// Wait for the response to request `id`, bounded by `timeout`. A request that
    /// times out is forgotten.
    pub async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<JsonRpcResponse>,
        timeout: Duration,
        method: &str,
    ) -> AgentResult<Value> {
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(received) => received
                .map_err(|_| AgentError::Transport("connection closed before response".to_string()))?,
            Err(_) => {
                self.forget(id).await;
                tracing::warn!(target: "orion::bridge", %method, id, "Request timeout");
                return Err(AgentError::Transport(format!(
                    "{} timed out after {:?}",
                    method, timeout
                )));
            }
        };
        response.into_result(method)
    }
}
