use super::traits::{EventSink, SwarmEvent};

/// Sink that forwards every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogSink {
    fn record(&self, agent: &str, event: SwarmEvent) {
        match &event {
            SwarmEvent::AgentStarted | SwarmEvent::AgentReady | SwarmEvent::AgentStopped => {
                tracing::info!(agent, event = event.name(), "agent lifecycle");
            }
            SwarmEvent::AgentError { error } => {
                tracing::warn!(agent, error = %error, "agent.error");
            }
            SwarmEvent::AgentWaiting { waited_ms } => {
                tracing::trace!(agent, waited_ms, "agent.waiting");
            }
            SwarmEvent::Heartbeat { state, beats } => {
                tracing::trace!(agent, state = %state, beats, "agent.heartbeat");
            }
            SwarmEvent::MessageSent {
                to,
                message_type,
                priority,
                inbox_depth,
                route,
                ..
            } => {
                tracing::debug!(
                    agent,
                    to = %to,
                    message_type = %message_type,
                    priority = %priority,
                    inbox_depth,
                    route = ?route,
                    "message.sent"
                );
            }
            SwarmEvent::Handoff {
                from,
                message_type,
                latency_ms,
                ..
            } => {
                tracing::debug!(agent, from = %from, message_type = %message_type, latency_ms, "handoff");
            }
            SwarmEvent::ToolExecuted { tool, status, .. } => {
                tracing::info!(agent, tool = %tool, status = ?status, "tool.executed");
            }
            SwarmEvent::ConfirmationRequested { action, risk_score } => {
                tracing::info!(agent, action = %action, risk_score, "confirmation.requested");
            }
            SwarmEvent::ConfirmationResolved {
                action,
                risk_score,
                approved,
            } => {
                tracing::info!(agent, action = %action, risk_score, approved, "confirmation.resolved");
            }
            SwarmEvent::DeadlockDetected { stuck } => {
                let agents: Vec<&str> = stuck.iter().map(|s| s.agent.as_str()).collect();
                tracing::error!(agent, stuck = ?agents, "deadlock.detected");
            }
            SwarmEvent::Iteration { iteration, metrics } => {
                tracing::info!(agent, iteration, metrics = %metrics, "iteration");
            }
            SwarmEvent::MetricsSnapshot { metrics } => {
                tracing::info!(
                    total_messages = metrics.total_messages,
                    total_handoffs = metrics.total_handoffs,
                    avg_handoff_latency_ms = metrics.avg_handoff_latency_ms,
                    errors = metrics.total_errors(),
                    "metrics.snapshot"
                );
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::StuckAgent;
    use std::time::Duration;

    #[test]
    fn log_sink_name() {
        assert_eq!(LogSink::new().name(), "log");
    }

    #[test]
    fn log_sink_handles_every_verb() {
        let sink = LogSink::new();
        sink.agent_started("a");
        sink.agent_error("a", "boom");
        sink.agent_waiting("a", Duration::from_millis(100));
        sink.handoff("a", "b", "frame", Duration::from_millis(3));
        sink.confirmation_requested("a", "rm", 0.4);
        sink.deadlock_detected(
            "detector",
            vec![StuckAgent {
                agent: "a".into(),
                idle_ms: 700.0,
            }],
        );
        sink.iteration("a", 1, serde_json::json!({"ok": true}));
        sink.finalize();
    }
}
