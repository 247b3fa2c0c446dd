use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use bat::WrappingMode;
use cliclack::{input, spinner};
use console::style;
use futures::StreamExt;
use orion::agent::{Agent, AgentChunk, AgentOutput};
use orion::bridge::McpBridge;
use orion::errors::AgentError;
use orion::models::message::Message;
use orion::models::tool::ToolCallResult;
use tokio_util::sync::CancellationToken;

const THEME: &str = "zenburn";
const PREVIEW_CHARS: usize = 200;

/// An interactive conversation with one agent
pub struct Session {
    agent: Agent,
    bridges: Vec<Arc<McpBridge>>,
    history: Vec<Message>,
    stream: bool,
    in_flight: Arc<Mutex<Option<CancellationToken>>>,
}

impl Session {
    pub fn new(agent: Agent, bridges: Vec<Arc<McpBridge>>, stream: bool) -> Self {
        Self {
            agent,
            bridges,
            history: Vec::new(),
            stream,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Ctrl-C cancels the reply in flight instead of killing the process
    pub fn install_interrupt_handler(&self) -> Result<()> {
        let in_flight = Arc::clone(&self.in_flight);
        ctrlc::set_handler(move || {
            if let Ok(slot) = in_flight.lock() {
                if let Some(token) = slot.as_ref() {
                    token.cancel();
                }
            }
        })?;
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        cliclack::intro(style(" orion ").on_cyan().black())?;
        println!(
            "{} {}",
            style(format!("{} tools loaded", self.agent.tools().len())).dim(),
            style("- type \"exit\" to end the session").dim()
        );

        loop {
            let text: String = match input("Message:").placeholder("").multiline().interact() {
                Ok(text) => text,
                // Esc or Ctrl-C at the prompt
                Err(e) if e.kind() == io::ErrorKind::Interrupted => break,
                Err(e) => return Err(e.into()),
            };
            if text.trim().eq_ignore_ascii_case("exit") {
                break;
            }
            if text.trim().is_empty() {
                continue;
            }

            self.history.push(Message::user(text.as_str())?);
            let answer = if self.stream {
                self.reply_streaming().await
            } else {
                self.reply_once().await
            };

            match answer {
                Ok(Some(answer)) if !answer.is_empty() => {
                    self.history.push(Message::assistant(answer)?);
                }
                Ok(_) => {}
                Err(e) => {
                    // Drop the unanswered request so the next turn starts clean
                    self.history.pop();
                    if e.is_cancelled() {
                        println!("\n{}", style("Interrupted.").yellow());
                    } else {
                        println!("\n{} {}", style("Error:").red(), e);
                    }
                }
            }
            println!();
        }

        cliclack::outro("Goodbye")?;
        Ok(())
    }

    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.in_flight.lock() {
            *slot = Some(token.clone());
        }
        token
    }

    fn end(&self) {
        if let Ok(mut slot) = self.in_flight.lock() {
            slot.take();
        }
    }

    async fn reply_once(&mut self) -> Result<Option<String>, AgentError> {
        let spin = spinner();
        spin.start("awaiting reply");
        let token = self.begin();
        let output = orion::cancel::link(Some(&token), self.agent.invoke(self.history.clone())).await;
        self.end();
        spin.stop("");

        match output? {
            AgentOutput::Text(text) => {
                render_markdown(&text).map_err(|e| AgentError::Stream(e.to_string()))?;
                Ok(Some(text))
            }
            AgentOutput::ToolResults(results) => {
                for result in &results {
                    print_tool_result(result);
                }
                Ok(None)
            }
        }
    }

    async fn reply_streaming(&mut self) -> Result<Option<String>, AgentError> {
        let token = self.begin();
        let mut chunks = self
            .agent
            .invoke_stream(self.history.clone(), Some(token));
        let mut open_tool: Option<usize> = None;
        let mut answer = None;
        let mut outcome = Ok(());

        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };
            match chunk {
                AgentChunk::Text(delta) => {
                    print!("{}", delta);
                }
                AgentChunk::Thought(delta) => {
                    print!("{}", style(delta).dim().italic());
                }
                AgentChunk::ToolArguments { index, name, delta } => {
                    if open_tool != Some(index) {
                        print!("\n{} ", style(format!("→ {}", name)).cyan());
                        open_tool = Some(index);
                    }
                    print!("{}", style(delta).dim());
                }
                AgentChunk::ToolResult(result) => {
                    open_tool = None;
                    println!();
                    print_tool_result(&result);
                }
                AgentChunk::Done(AgentOutput::Text(text)) => {
                    answer = Some(text);
                }
                AgentChunk::Done(AgentOutput::ToolResults(_)) => {}
            }
            let _ = io::stdout().flush();
        }
        drop(chunks);
        self.end();
        outcome.map(|_| answer)
    }

    /// Release every bridge connection
    pub async fn close(&self) {
        for bridge in &self.bridges {
            if let Err(e) = bridge.close().await {
                tracing::warn!(bridge = %bridge.name(), error = %e, "failed to close bridge");
            }
        }
    }
}

fn preview(text: &str) -> String {
    let mut shown: String = text.chars().take(PREVIEW_CHARS).collect();
    if shown.len() < text.len() {
        shown.push('…');
    }
    shown
}

fn print_tool_result(result: &ToolCallResult) {
    println!(
        "{} {}",
        style(format!("← {}", result.call_id)).cyan(),
        style(preview(&result.output)).dim()
    );
}

fn render_markdown(content: &str) -> Result<()> {
    bat::PrettyPrinter::new()
        .input(bat::Input::from_bytes(content.as_bytes()))
        .theme(THEME)
        .language("Markdown")
        .wrapping_mode(WrappingMode::Character)
        .print()
        .map_err(|e| anyhow!("failed to render output: {}", e))?;
    println!();
    Ok(())
}
