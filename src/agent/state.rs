use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;

/// Observable lifecycle status of an agent runtime.
///
/// ```text
/// start ──> idle ──message──> processing ──ok──> idle
///            │                    │
///            └─recv timeout─> waiting   └─handler error─> error ──auto_restart──> idle
/// any ──stop()──> stopped
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Processing,
    Waiting,
    Error,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Waiting => "waiting",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of status changes an [`AgentState`] remembers.
pub const STATUS_HISTORY_LEN: usize = 64;

/// State record owned by one agent runtime.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub status: AgentStatus,
    pub last_activity: Instant,
    pub error: Option<String>,
    history: VecDeque<AgentStatus>,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            status: AgentStatus::Idle,
            last_activity: Instant::now(),
            error: None,
            history: VecDeque::from([AgentStatus::Idle]),
        }
    }

    /// Most recent status changes, oldest first. Repeated sets of the
    /// same status are recorded once.
    pub fn history(&self) -> impl Iterator<Item = AgentStatus> + '_ {
        self.history.iter().copied()
    }

    /// Move to `status`. `stopped` is terminal and never left.
    pub(crate) fn transition(&mut self, status: AgentStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.status != status {
            if self.history.len() == STATUS_HISTORY_LEN {
                self.history.pop_front();
            }
            self.history.push_back(status);
        }
        self.status = status;
        if status != AgentStatus::Error {
            self.error = None;
        }
        true
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) {
        if self.transition(AgentStatus::Error) {
            self.error = Some(error.into());
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_idle_without_error() {
        let state = AgentState::new();
        assert_eq!(state.status, AgentStatus::Idle);
        assert!(state.error.is_none());
    }

    #[test]
    fn fail_records_error_and_recovery_clears_it() {
        let mut state = AgentState::new();
        state.transition(AgentStatus::Processing);
        state.fail("boom");
        assert_eq!(state.status, AgentStatus::Error);
        assert_eq!(state.error.as_deref(), Some("boom"));

        state.transition(AgentStatus::Idle);
        assert!(state.error.is_none());
    }

    #[test]
    fn stopped_is_terminal() {
        let mut state = AgentState::new();
        assert!(state.transition(AgentStatus::Stopped));
        assert!(!state.transition(AgentStatus::Idle));
        state.fail("late error");
        assert_eq!(state.status, AgentStatus::Stopped);
        assert!(state.error.is_none());
    }

    #[test]
    fn history_records_changes_once_and_stays_bounded() {
        let mut state = AgentState::new();
        state.transition(AgentStatus::Idle);
        state.transition(AgentStatus::Processing);
        state.fail("boom");
        state.transition(AgentStatus::Idle);
        assert_eq!(
            state.history().collect::<Vec<_>>(),
            vec![
                AgentStatus::Idle,
                AgentStatus::Processing,
                AgentStatus::Error,
                AgentStatus::Idle
            ]
        );

        for _ in 0..STATUS_HISTORY_LEN {
            state.transition(AgentStatus::Waiting);
            state.transition(AgentStatus::Idle);
        }
        assert_eq!(state.history().count(), STATUS_HISTORY_LEN);
        assert_eq!(state.history().last(), Some(AgentStatus::Idle));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(AgentStatus::Waiting.to_string(), "waiting");
    }
}
