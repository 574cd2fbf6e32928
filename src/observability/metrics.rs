use super::traits::{SwarmEvent, ToolStatus};
use crate::bus::{LatencySummary, LatencyWindow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

const LATENCY_SAMPLES: usize = 1000;

/// Error messages kept per agent; counts keep growing past it.
pub const RECENT_ERRORS_PER_AGENT: usize = 20;

/// Swarm-wide counters derived exclusively from recorded events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub total_messages: u64,
    pub messages_by_agent: BTreeMap<String, u64>,
    pub inbox_high_water: BTreeMap<String, usize>,
    pub total_handoffs: u64,
    pub avg_handoff_latency_ms: f64,
    pub max_handoff_latency_ms: f64,
    pub latency_by_type: BTreeMap<String, LatencySummary>,
    pub confirmations_requested: u64,
    pub confirmations_approved: u64,
    pub confirmations_denied: u64,
    pub errors_by_agent: BTreeMap<String, u64>,
    pub recent_errors: BTreeMap<String, VecDeque<String>>,
    pub heartbeats_by_agent: BTreeMap<String, u64>,
    pub tool_calls: u64,
    pub tool_failures: u64,
    pub deadlocks_detected: u64,
    pub iterations: u64,
    pub agents_started: u64,
    pub agents_stopped: u64,
}

impl SessionMetrics {
    pub fn error_count(&self, agent: &str) -> u64 {
        self.errors_by_agent.get(agent).copied().unwrap_or(0)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors_by_agent.values().sum()
    }
}

/// Folds events into [`SessionMetrics`].
#[derive(Debug)]
pub(crate) struct MetricsAggregator {
    metrics: SessionMetrics,
    handoff_latency: LatencyWindow,
    latency_by_type: HashMap<String, LatencyWindow>,
}

impl MetricsAggregator {
    pub(crate) fn new() -> Self {
        Self {
            metrics: SessionMetrics::default(),
            handoff_latency: LatencyWindow::new(LATENCY_SAMPLES),
            latency_by_type: HashMap::new(),
        }
    }

    pub(crate) fn apply(&mut self, agent: &str, event: &SwarmEvent) {
        let m = &mut self.metrics;
        match event {
            SwarmEvent::AgentStarted => m.agents_started += 1,
            SwarmEvent::AgentStopped => m.agents_stopped += 1,
            SwarmEvent::AgentError { error } => {
                *m.errors_by_agent.entry(agent.to_string()).or_insert(0) += 1;
                let recent = m.recent_errors.entry(agent.to_string()).or_default();
                if recent.len() == RECENT_ERRORS_PER_AGENT {
                    recent.pop_front();
                }
                recent.push_back(error.clone());
            }
            SwarmEvent::Heartbeat { .. } => {
                *m.heartbeats_by_agent.entry(agent.to_string()).or_insert(0) += 1;
            }
            SwarmEvent::MessageSent {
                to, inbox_depth, ..
            } => {
                m.total_messages += 1;
                *m.messages_by_agent.entry(agent.to_string()).or_insert(0) += 1;
                let high_water = m.inbox_high_water.entry(to.clone()).or_insert(0);
                *high_water = (*high_water).max(*inbox_depth);
            }
            SwarmEvent::Handoff {
                message_type,
                latency_ms,
                ..
            } => {
                m.total_handoffs += 1;
                m.max_handoff_latency_ms = m.max_handoff_latency_ms.max(*latency_ms);
                self.handoff_latency.record_ms(*latency_ms);
                self.latency_by_type
                    .entry(message_type.clone())
                    .or_insert_with(|| LatencyWindow::new(LATENCY_SAMPLES))
                    .record_ms(*latency_ms);
            }
            SwarmEvent::ToolExecuted { status, .. } => {
                m.tool_calls += 1;
                if *status == ToolStatus::Failure {
                    m.tool_failures += 1;
                }
            }
            SwarmEvent::ConfirmationRequested { .. } => m.confirmations_requested += 1,
            SwarmEvent::ConfirmationResolved { approved, .. } => {
                if *approved {
                    m.confirmations_approved += 1;
                } else {
                    m.confirmations_denied += 1;
                }
            }
            SwarmEvent::DeadlockDetected { .. } => m.deadlocks_detected += 1,
            SwarmEvent::Iteration { .. } => m.iterations += 1,
            SwarmEvent::AgentReady
            | SwarmEvent::AgentWaiting { .. }
            | SwarmEvent::MetricsSnapshot { .. } => {}
        }
    }

    pub(crate) fn snapshot(&self) -> SessionMetrics {
        let mut metrics = self.metrics.clone();
        metrics.avg_handoff_latency_ms = self.handoff_latency.summary().avg_ms;
        metrics.latency_by_type = self
            .latency_by_type
            .iter()
            .map(|(message_type, window)| (message_type.clone(), window.summary()))
            .collect();
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Priority, Route};

    fn sent(to: &str, depth: usize) -> SwarmEvent {
        SwarmEvent::MessageSent {
            to: to.into(),
            message_type: "task".into(),
            priority: Priority::Normal,
            correlation_id: None,
            inbox_depth: depth,
            route: Route::Direct,
        }
    }

    fn handoff(message_type: &str, latency_ms: f64) -> SwarmEvent {
        SwarmEvent::Handoff {
            from: "a".into(),
            to: "b".into(),
            message_type: message_type.into(),
            latency_ms,
        }
    }

    #[test]
    fn message_counts_and_high_water_marks() {
        let mut agg = MetricsAggregator::new();
        agg.apply("coordinator", &sent("actor", 1));
        agg.apply("coordinator", &sent("actor", 3));
        agg.apply("observer", &sent("actor", 2));

        let metrics = agg.snapshot();
        assert_eq!(metrics.total_messages, 3);
        assert_eq!(metrics.messages_by_agent["coordinator"], 2);
        assert_eq!(metrics.messages_by_agent["observer"], 1);
        assert_eq!(metrics.inbox_high_water["actor"], 3);
    }

    #[test]
    fn handoff_latency_average_max_and_per_type() {
        let mut agg = MetricsAggregator::new();
        agg.apply("b", &handoff("frame", 10.0));
        agg.apply("b", &handoff("frame", 30.0));
        agg.apply("b", &handoff("ping", 5.0));

        let metrics = agg.snapshot();
        assert_eq!(metrics.total_handoffs, 3);
        assert!((metrics.avg_handoff_latency_ms - 15.0).abs() < 1e-9);
        assert!((metrics.max_handoff_latency_ms - 30.0).abs() < 1e-9);
        assert_eq!(metrics.latency_by_type["frame"].count, 2);
        assert!((metrics.latency_by_type["ping"].max_ms - 5.0).abs() < 1e-9);
    }

    #[test]
    fn confirmations_errors_and_tools_are_counted() {
        let mut agg = MetricsAggregator::new();
        agg.apply(
            "validator",
            &SwarmEvent::ConfirmationRequested {
                action: "rm".into(),
                risk_score: 0.9,
            },
        );
        agg.apply(
            "validator",
            &SwarmEvent::ConfirmationResolved {
                action: "rm".into(),
                risk_score: 0.9,
                approved: true,
            },
        );
        agg.apply(
            "actor",
            &SwarmEvent::AgentError {
                error: "boom".into(),
            },
        );
        agg.apply(
            "actor",
            &SwarmEvent::ToolExecuted {
                tool: "click".into(),
                params: serde_json::Value::Null,
                result: serde_json::Value::Null,
                status: ToolStatus::Failure,
            },
        );

        let metrics = agg.snapshot();
        assert_eq!(metrics.confirmations_requested, 1);
        assert_eq!(metrics.confirmations_approved, 1);
        assert_eq!(metrics.confirmations_denied, 0);
        assert_eq!(metrics.error_count("actor"), 1);
        assert_eq!(metrics.error_count("observer"), 0);
        assert_eq!(metrics.tool_calls, 1);
        assert_eq!(metrics.tool_failures, 1);
    }

    #[test]
    fn error_messages_are_capped_but_counts_are_not() {
        let mut agg = MetricsAggregator::new();
        let total = RECENT_ERRORS_PER_AGENT + 15;
        for n in 0..total {
            agg.apply(
                "actor",
                &SwarmEvent::AgentError {
                    error: format!("failure {n}"),
                },
            );
        }

        let metrics = agg.snapshot();
        assert_eq!(metrics.error_count("actor"), total as u64);
        assert_eq!(metrics.total_errors(), total as u64);
        let recent = &metrics.recent_errors["actor"];
        assert_eq!(recent.len(), RECENT_ERRORS_PER_AGENT);
        assert_eq!(recent.front().map(String::as_str), Some("failure 15"));
        assert_eq!(recent.back().map(String::as_str), Some("failure 34"));
    }
}
