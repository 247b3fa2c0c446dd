use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::protocol::{JsonRpcNotification, JsonRpcRequest, PendingRequests};
use super::{StdioCommand, Transport};
use crate::errors::{AgentError, AgentResult};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum Launch {
    Command(StdioCommand),
    Streams(BoxedReader, BoxedWriter),
}

/// Newline-delimited JSON-RPC over a child process's stdin/stdout, or over any
/// reader/writer pair.
pub struct StdioTransport {
    label: String,
    timeout: Duration,
    launch: Mutex<Option<Launch>>,
    writer: Mutex<Option<BoxedWriter>>,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<PendingRequests>,
    alive: Arc<AtomicBool>,
}

impl StdioTransport {
    /// The process is spawned on `connect`
    pub fn new(command: StdioCommand, timeout: Duration) -> Self {
        let label = command.command.clone();
        Self::with_launch(label, Launch::Command(command), timeout)
    }

    pub fn from_streams<R, W>(reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_launch(
            "stream".to_string(),
            Launch::Streams(Box::new(reader), Box::new(writer)),
            timeout,
        )
    }

    fn with_launch(label: String, launch: Launch, timeout: Duration) -> Self {
        Self {
            label,
            timeout,
            launch: Mutex::new(Some(launch)),
            writer: Mutex::new(None),
            child: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            pending: Arc::new(PendingRequests::new()),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn spawn(&self, command: StdioCommand) -> AgentResult<(BoxedReader, BoxedWriter)> {
        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::Transport(format!("failed to spawn {}: {}", command.command, e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Transport("child stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let label = self.label.clone();
            let task = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "orion::bridge::stdio", server = %label, "stderr: {}", line);
                }
            });
            self.tasks.lock().await.push(task);
        }

        tracing::info!(target: "orion::bridge::stdio", server = %self.label, pid = ?child.id(), "spawned MCP server");
        *self.child.lock().await = Some(child);
        Ok((Box::new(stdout), Box::new(stdin)))
    }

    fn start_reader(&self, reader: BoxedReader) -> JoinHandle<()> {
        let pending = self.pending.clone();
        let alive = self.alive.clone();
        let label = self.label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(message) => pending.dispatch(&message, &label).await,
                            Err(e) => {
                                tracing::warn!(target: "orion::bridge::stdio", server = %label, error = %e, "unparsable line from server")
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(target: "orion::bridge::stdio", server = %label, error = %e, "read failed");
                        break;
                    }
                }
            }
            alive.store(false, Ordering::SeqCst);
            pending.fail_all().await;
            tracing::debug!(target: "orion::bridge::stdio", server = %label, "server output closed");
        })
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> AgentResult<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(AgentError::Transport(format!(
                "{} is not connected",
                self.label
            )));
        }
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| AgentError::Transport(format!("{} is not connected", self.label)))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Transport(format!("write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| AgentError::Transport(format!("flush failed: {}", e)))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> AgentResult<()> {
        let launch = self
            .launch
            .lock()
            .await
            .take()
            .ok_or_else(|| AgentError::Transport("transport already connected".into()))?;

        let (reader, writer) = match launch {
            Launch::Command(command) => self.spawn(command).await?,
            Launch::Streams(reader, writer) => (reader, writer),
        };
        *self.writer.lock().await = Some(writer);
        self.alive.store(true, Ordering::SeqCst);
        let reader_task = self.start_reader(reader);
        self.tasks.lock().await.push(reader_task);
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> AgentResult<Value> {
        let id = self.pending.next_id();
        let rx = self.pending.register(id).await;
        if let Err(e) = self
            .write_message(&JsonRpcRequest::new(id, method, params))
            .await
        {
            self.pending.forget(id).await;
            return Err(e);
        }
        self.pending.wait(id, rx, self.timeout, method).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> AgentResult<()> {
        self.write_message(&JsonRpcNotification::new(method, params))
            .await
    }

    async fn close(&self) -> AgentResult<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.launch.lock().await.take();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(target: "orion::bridge::stdio", server = %self.label, error = %e, "kill failed");
            }
        }
        self.pending.fail_all().await;
        Ok(())
    }
}
