use std::sync::{Arc, Mutex};

use crate::models::tool::ApiType;

/// Notable things the agent loop did, reported to an injected sink
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    RoundStarted {
        agent: String,
        round: usize,
        items: usize,
    },
    ModelResponded {
        agent: String,
        api_type: ApiType,
        tool_calls: usize,
    },
    ToolSkipped {
        name: String,
        call_id: String,
    },
    ToolFailed {
        name: String,
        call_id: String,
        error: String,
    },
    ToolCompleted {
        name: String,
        call_id: String,
    },
}

pub trait Diagnostics: Send + Sync {
    fn record(&self, event: DiagnosticEvent);
}

/// Forwards every event to `tracing`
#[derive(Debug, Default, Clone)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn record(&self, event: DiagnosticEvent) {
        match event {
            DiagnosticEvent::RoundStarted { agent, round, items } => {
                tracing::debug!(target: "orion::agent", %agent, round, items, "round started")
            }
            DiagnosticEvent::ModelResponded {
                agent,
                api_type,
                tool_calls,
            } => {
                tracing::debug!(target: "orion::agent", %agent, ?api_type, tool_calls, "model responded")
            }
            DiagnosticEvent::ToolSkipped { name, call_id } => {
                tracing::debug!(target: "orion::agent", %name, %call_id, "skipping call to unregistered tool")
            }
            DiagnosticEvent::ToolFailed {
                name,
                call_id,
                error,
            } => {
                tracing::warn!(target: "orion::agent", %name, %call_id, %error, "tool call failed")
            }
            DiagnosticEvent::ToolCompleted { name, call_id } => {
                tracing::trace!(target: "orion::agent", %name, %call_id, "tool call completed")
            }
        }
    }
}

/// Keeps events in memory so tests can assert on them
#[derive(Debug, Default, Clone)]
pub struct MemoryDiagnostics {
    events: Arc<Mutex<Vec<DiagnosticEvent>>>,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn skipped(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DiagnosticEvent::ToolSkipped { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }
}

impl Diagnostics for MemoryDiagnostics {
    fn record(&self, event: DiagnosticEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_diagnostics_shares_state_across_clones() {
        let diagnostics = MemoryDiagnostics::new();
        let sink: Arc<dyn Diagnostics> = Arc::new(diagnostics.clone());

        sink.record(DiagnosticEvent::ToolSkipped {
            name: "ghost".into(),
            call_id: "call_1".into(),
        });

        assert_eq!(diagnostics.skipped(), vec!["ghost".to_string()]);
    }
}
