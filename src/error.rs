use std::time::Duration;
use thiserror::Error;

/// Result alias used across the bus, runtime and detector.
pub type Result<T, E = SwarmError> = std::result::Result<T, E>;

/// Errors surfaced by the message bus, agent runtime and deadlock detector.
///
/// Routing errors (`UnknownAgent`, `AlreadyRegistered`, `InboxFull`) are
/// returned synchronously to the sender. `Timeout` and `BusClosed` end a
/// blocking wait. `DeadlockDetected` is raised for the owning coordinator and
/// `HandlerError` stays inside the failing agent's loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwarmError {
    #[error("agent `{agent}` is not registered")]
    UnknownAgent { agent: String },
    #[error("agent `{agent}` is already registered")]
    AlreadyRegistered { agent: String },
    #[error("inbox for agent `{agent}` is full (capacity {capacity})")]
    InboxFull { agent: String, capacity: usize },
    #[error("{operation} for agent `{agent}` timed out after {elapsed:?}{}", correlation_suffix(.correlation_id))]
    Timeout {
        operation: &'static str,
        agent: String,
        elapsed: Duration,
        correlation_id: Option<String>,
    },
    #[error("message bus is closed")]
    BusClosed,
    #[error("request `{correlation_id}` abandoned: agent `{agent}` was unregistered")]
    AgentGone {
        agent: String,
        correlation_id: String,
    },
    #[error("deadlock detected: {}", describe_stuck(.agents))]
    DeadlockDetected { agents: Vec<(String, Duration)> },
    #[error("handler for agent `{agent}` failed: {message}")]
    HandlerError { agent: String, message: String },
    #[error("invalid message: field `{field}` must not be empty")]
    InvalidMessage { field: &'static str },
}

impl SwarmError {
    /// Wrap a handler failure, keeping the full `anyhow` context chain.
    pub fn handler(agent: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::HandlerError {
            agent: agent.into(),
            message: format!("{error:#}"),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

fn correlation_suffix(correlation_id: &Option<String>) -> String {
    correlation_id
        .as_deref()
        .map(|id| format!(" (correlation_id `{id}`)"))
        .unwrap_or_default()
}

fn describe_stuck(agents: &[(String, Duration)]) -> String {
    agents
        .iter()
        .map(|(agent, idle)| format!("`{agent}` idle {:.1}s", idle.as_secs_f64()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_includes_correlation_id() {
        let err = SwarmError::Timeout {
            operation: "request",
            agent: "router".into(),
            elapsed: Duration::from_millis(250),
            correlation_id: Some("corr-1".into()),
        };
        let text = err.to_string();
        assert!(text.contains("request for agent `router`"));
        assert!(text.contains("corr-1"));
        assert!(err.is_timeout());
    }

    #[test]
    fn deadlock_display_lists_every_agent() {
        let err = SwarmError::DeadlockDetected {
            agents: vec![
                ("observer".into(), Duration::from_secs(3)),
                ("actor".into(), Duration::from_millis(4500)),
            ],
        };
        assert_eq!(
            err.to_string(),
            "deadlock detected: `observer` idle 3.0s, `actor` idle 4.5s"
        );
    }

    #[test]
    fn handler_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("disk full").context("writing snapshot");
        let err = SwarmError::handler("validator", &inner);
        assert_eq!(
            err.to_string(),
            "handler for agent `validator` failed: writing snapshot: disk full"
        );
        assert!(!err.is_timeout());
    }
}
