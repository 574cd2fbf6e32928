use super::metrics::SessionMetrics;
use crate::agent::AgentStatus;
use crate::bus::{MessageSummary, Priority, Route};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Outcome of a tool call reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failure,
    Skipped,
}

/// Agent reported stuck by the deadlock detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckAgent {
    pub agent: String,
    pub idle_ms: f64,
}

/// Structured runtime event. The originating agent travels alongside the
/// event in [`EventSink::record`] rather than inside every variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwarmEvent {
    AgentStarted,
    AgentReady,
    AgentStopped,
    AgentError {
        error: String,
    },
    AgentWaiting {
        waited_ms: f64,
    },
    Heartbeat {
        state: AgentStatus,
        beats: u64,
    },
    MessageSent {
        to: String,
        message_type: String,
        priority: Priority,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        inbox_depth: usize,
        route: Route,
    },
    Handoff {
        from: String,
        to: String,
        message_type: String,
        latency_ms: f64,
    },
    ToolExecuted {
        tool: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        result: Value,
        status: ToolStatus,
    },
    ConfirmationRequested {
        action: String,
        risk_score: f64,
    },
    ConfirmationResolved {
        action: String,
        risk_score: f64,
        approved: bool,
    },
    DeadlockDetected {
        stuck: Vec<StuckAgent>,
    },
    Iteration {
        iteration: u64,
        #[serde(default)]
        metrics: Value,
    },
    MetricsSnapshot {
        metrics: Box<SessionMetrics>,
    },
}

impl SwarmEvent {
    /// Snake-case event name, matching the serialized `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentStarted => "agent_started",
            Self::AgentReady => "agent_ready",
            Self::AgentStopped => "agent_stopped",
            Self::AgentError { .. } => "agent_error",
            Self::AgentWaiting { .. } => "agent_waiting",
            Self::Heartbeat { .. } => "heartbeat",
            Self::MessageSent { .. } => "message_sent",
            Self::Handoff { .. } => "handoff",
            Self::ToolExecuted { .. } => "tool_executed",
            Self::ConfirmationRequested { .. } => "confirmation_requested",
            Self::ConfirmationResolved { .. } => "confirmation_resolved",
            Self::DeadlockDetected { .. } => "deadlock_detected",
            Self::Iteration { .. } => "iteration",
            Self::MetricsSnapshot { .. } => "metrics_snapshot",
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Append-only consumer of runtime events.
///
/// Implementations must not block the caller and must swallow their own
/// persistence failures. The verb methods are thin constructors over
/// [`record`](EventSink::record).
pub trait EventSink: Send + Sync + 'static {
    fn record(&self, agent: &str, event: SwarmEvent);

    fn name(&self) -> &str;

    /// Flush buffered records and emit any aggregated summary.
    fn finalize(&self) {}

    fn agent_started(&self, agent: &str) {
        self.record(agent, SwarmEvent::AgentStarted);
    }

    fn agent_ready(&self, agent: &str) {
        self.record(agent, SwarmEvent::AgentReady);
    }

    fn agent_stopped(&self, agent: &str) {
        self.record(agent, SwarmEvent::AgentStopped);
    }

    fn agent_error(&self, agent: &str, error: &str) {
        self.record(
            agent,
            SwarmEvent::AgentError {
                error: error.to_string(),
            },
        );
    }

    fn agent_waiting(&self, agent: &str, waited: Duration) {
        self.record(
            agent,
            SwarmEvent::AgentWaiting {
                waited_ms: millis(waited),
            },
        );
    }

    fn heartbeat(&self, agent: &str, state: AgentStatus, beats: u64) {
        self.record(agent, SwarmEvent::Heartbeat { state, beats });
    }

    fn message_sent(&self, summary: &MessageSummary, inbox_depth: usize) {
        self.record(
            &summary.from_agent,
            SwarmEvent::MessageSent {
                to: summary.to_agent.clone(),
                message_type: summary.message_type.clone(),
                priority: summary.priority,
                correlation_id: summary.correlation_id.clone(),
                inbox_depth,
                route: summary.route,
            },
        );
    }

    fn handoff(&self, from: &str, to: &str, message_type: &str, latency: Duration) {
        self.record(
            to,
            SwarmEvent::Handoff {
                from: from.to_string(),
                to: to.to_string(),
                message_type: message_type.to_string(),
                latency_ms: millis(latency),
            },
        );
    }

    fn tool_executed(&self, agent: &str, tool: &str, params: Value, result: Value, status: ToolStatus) {
        self.record(
            agent,
            SwarmEvent::ToolExecuted {
                tool: tool.to_string(),
                params,
                result,
                status,
            },
        );
    }

    fn confirmation_requested(&self, agent: &str, action: &str, risk_score: f64) {
        self.record(
            agent,
            SwarmEvent::ConfirmationRequested {
                action: action.to_string(),
                risk_score,
            },
        );
    }

    fn confirmation(&self, agent: &str, action: &str, risk_score: f64, approved: bool) {
        self.record(
            agent,
            SwarmEvent::ConfirmationResolved {
                action: action.to_string(),
                risk_score,
                approved,
            },
        );
    }

    fn deadlock_detected(&self, agent: &str, stuck: Vec<StuckAgent>) {
        self.record(agent, SwarmEvent::DeadlockDetected { stuck });
    }

    fn iteration(&self, agent: &str, iteration: u64, metrics: Value) {
        self.record(agent, SwarmEvent::Iteration { iteration, metrics });
    }
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _agent: &str, _event: SwarmEvent) {}

    fn name(&self) -> &str {
        "none"
    }
}
