//! Remote tools served by MCP peers.
//!
//! An [`McpBridge`] owns one connection to a tool server over any [`Transport`]. After
//! [`McpBridge::connect`] it can list the server's tools and call them; each listed tool is
//! exposed to the agent as a [`RemoteTool`].
pub mod protocol;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::errors::{AgentError, AgentResult};
use crate::models::tool::ToolDescriptor;
use crate::tools::Tool;

use protocol::{CallToolResult, ListToolsResult, CLIENT_NAME, PROTOCOL_VERSION};

pub use self::sse::SseTransport;
pub use self::stdio::StdioTransport;
pub use self::streamable_http::StreamableHttpTransport;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A JSON-RPC channel to one peer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel. Called once, before any request.
    async fn connect(&self) -> AgentResult<()>;

    /// Send a request and wait for the matching response's `result`
    async fn request(&self, method: &str, params: Option<Value>) -> AgentResult<Value>;

    /// Send a notification; no response is expected
    async fn notify(&self, method: &str, params: Option<Value>) -> AgentResult<()>;

    /// Release the channel. Must be safe to call on a transport that never connected.
    async fn close(&self) -> AgentResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Stdio(StdioCommand),
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// One configured tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub name: String,
    /// Prepended to every tool name as `{prefix}_{name}`
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub struct McpBridge {
    name: String,
    prefix: Option<String>,
    transport: Arc<dyn Transport>,
    connect_lock: Mutex<()>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for McpBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpBridge")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl McpBridge {
    pub fn new<N: Into<String>>(name: N, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            prefix: None,
            transport,
            connect_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_prefix<P: Into<String>>(mut self, prefix: P) -> Self {
        let prefix = prefix.into();
        self.prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    pub fn from_config(config: &BridgeConfig) -> AgentResult<Self> {
        let timeout = config.timeout();
        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Stdio(command) => {
                Arc::new(StdioTransport::new(command.clone(), timeout))
            }
            TransportConfig::Sse { url, headers } => {
                Arc::new(SseTransport::new(url, headers, timeout)?)
            }
            TransportConfig::StreamableHttp { url, headers } => {
                Arc::new(StreamableHttpTransport::new(url, headers, timeout)?)
            }
        };
        let bridge = Self::new(config.name.clone(), transport);
        Ok(match &config.prefix {
            Some(prefix) => bridge.with_prefix(prefix.clone()),
            None => bridge,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> AgentResult<()> {
        if self.is_closed() {
            return Err(AgentError::Transport(format!("bridge {} is closed", self.name)));
        }
        Ok(())
    }

    fn ensure_connected(&self) -> AgentResult<()> {
        self.ensure_open()?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AgentError::Transport(format!(
                "bridge {} is not connected",
                self.name
            )));
        }
        Ok(())
    }

    /// Open the transport and run the initialize handshake. Connecting twice is a no-op.
    pub async fn connect(&self) -> AgentResult<()> {
        let _guard = self.connect_lock.lock().await;
        self.ensure_open()?;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.transport.connect().await?;
        let init = self
            .transport
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": CLIENT_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                })),
            )
            .await?;
        self.transport
            .notify("notifications/initialized", None)
            .await?;
        self.connected.store(true, Ordering::SeqCst);

        let server = init
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let protocol = init
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        tracing::info!(
            target: "orion::bridge",
            bridge = %self.name,
            server = %server,
            protocol = %protocol,
            "MCP server initialized"
        );
        Ok(())
    }

    fn prefixed(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, name),
            None => name.to_string(),
        }
    }

    fn unprefixed<'a>(&self, name: &'a str) -> &'a str {
        self.prefix
            .as_deref()
            .and_then(|prefix| name.strip_prefix(prefix))
            .and_then(|rest| rest.strip_prefix('_'))
            .unwrap_or(name)
    }

    /// Every tool the server advertises, following pagination to the end
    pub async fn list_tools(&self) -> AgentResult<Vec<ToolDescriptor>> {
        self.ensure_connected()?;
        let mut descriptors = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.transport.request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(result).map_err(|e| {
                AgentError::Transport(format!("invalid tools/list result: {}", e))
            })?;

            for tool in page.tools {
                let name = self.prefixed(&tool.name);
                if ToolDescriptor::validate_name(&name).is_err() {
                    tracing::warn!(target: "orion::bridge", bridge = %self.name, tool = %name, "skipping tool with invalid name");
                    continue;
                }
                descriptors.push(ToolDescriptor::new(
                    name,
                    tool.description.unwrap_or_default(),
                    tool.input_schema
                        .unwrap_or_else(|| json!({"type": "object"})),
                ));
            }

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        tracing::debug!(target: "orion::bridge", bridge = %self.name, count = descriptors.len(), "listed tools");
        Ok(descriptors)
    }

    /// Call a tool by its advertised (possibly prefixed) name
    pub async fn call_tool(&self, name: &str, arguments: Value) -> AgentResult<CallToolResult> {
        self.ensure_connected()?;
        let remote_name = self.unprefixed(name);
        tracing::debug!(target: "orion::bridge", bridge = %self.name, tool = %remote_name, "calling tool");
        let result = self
            .transport
            .request(
                "tools/call",
                Some(json!({ "name": remote_name, "arguments": arguments })),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| AgentError::Transport(format!("invalid tools/call result: {}", e)))
    }

    /// Release the transport. Only the first call does any work.
    pub async fn close(&self) -> AgentResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!(target: "orion::bridge", bridge = %self.name, "closing");
        self.transport.close().await
    }

    /// Connect if needed and wrap every listed tool
    pub async fn remote_tools(self: &Arc<Self>) -> AgentResult<Vec<Arc<dyn Tool>>> {
        self.connect().await?;
        Ok(self
            .list_tools()
            .await?
            .into_iter()
            .map(|descriptor| Arc::new(RemoteTool::new(descriptor, self.clone())) as Arc<dyn Tool>)
            .collect())
    }
}

/// A tool that forwards its calls to a bridge
#[derive(Debug, Clone)]
pub struct RemoteTool {
    descriptor: ToolDescriptor,
    bridge: Arc<McpBridge>,
}

impl RemoteTool {
    pub fn new(descriptor: ToolDescriptor, bridge: Arc<McpBridge>) -> Self {
        Self { descriptor, bridge }
    }

    pub fn bridge(&self) -> &Arc<McpBridge> {
        &self.bridge
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, args: Value) -> AgentResult<String> {
        match self.bridge.call_tool(&self.descriptor.name, args).await {
            Ok(result) if result.is_error() => Err(AgentError::ToolExecution(result.text())),
            Ok(result) => Ok(result.text()),
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => Err(AgentError::ToolExecution(e.to_string())),
        }
    }
}

/// Connect every bridge and collect its tools. A bridge that fails to connect or
/// list is logged, closed and skipped.
pub async fn discover_tools(bridges: &[Arc<McpBridge>]) -> Vec<Arc<dyn Tool>> {
    let results = join_all(bridges.iter().map(|bridge| async move {
        match bridge.remote_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(target: "orion::bridge", bridge = %bridge.name(), error = %e, "failed to load tools");
                if let Err(e) = bridge.close().await {
                    tracing::debug!(target: "orion::bridge", bridge = %bridge.name(), error = %e, "close after failure");
                }
                Vec::new()
            }
        }
    }))
    .await;
    results.into_iter().flatten().collect()
}
