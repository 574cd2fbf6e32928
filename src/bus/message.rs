use crate::error::{Result, SwarmError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// Delivery priority. Declaration order is dequeue order: `High` first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub(crate) fn rank(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload variants carried by a [`Message`].
///
/// Collaborating agents agree on a small set of `message_type` strings; the
/// payload shape stays one of these variants so handlers can match on it
/// instead of probing an untyped map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Text {
        text: String,
    },
    Data {
        value: Value,
    },
    Task {
        task_id: String,
        description: String,
        #[serde(default)]
        params: Value,
    },
    TaskResult {
        task_id: String,
        success: bool,
        #[serde(default)]
        output: Value,
    },
    Control {
        action: String,
        note: Option<String>,
    },
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn data(value: impl Into<Value>) -> Self {
        Self::Data {
            value: value.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Self::Data { value } => Some(value),
            _ => None,
        }
    }

    /// Short variant name used in logs and history.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Text { .. } => "text",
            Self::Data { .. } => "data",
            Self::Task { .. } => "task",
            Self::TaskResult { .. } => "task_result",
            Self::Control { .. } => "control",
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::text(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::text(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Data { value }
    }
}

/// Message routed through the bus.
///
/// `timestamp` and `sent_at` are restamped when the bus admits the message,
/// so they record the send, not construction. Broadcast copies share the
/// stamp of the original.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: String,
    pub content: Payload,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub timestamp: Instant,
    pub sent_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl Message {
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        message_type: impl Into<String>,
        content: impl Into<Payload>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            message_type: message_type.into(),
            content: content.into(),
            priority: Priority::Normal,
            correlation_id: None,
            timestamp: Instant::now(),
            sent_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Record the send time. Called once per admission.
    pub(crate) fn stamp(&mut self) {
        self.timestamp = Instant::now();
        self.sent_at = Utc::now();
    }

    /// Age of the message measured against its send timestamp.
    pub fn age(&self) -> std::time::Duration {
        self.timestamp.elapsed()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("from_agent", self.from_agent.as_str()),
            ("to_agent", self.to_agent.as_str()),
            ("message_type", self.message_type.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(SwarmError::InvalidMessage { field });
            }
        }
        Ok(())
    }

    /// Copy addressed to another recipient; timestamp and content are kept.
    pub(crate) fn readdressed(&self, to_agent: &str) -> Self {
        Self {
            to_agent: to_agent.to_string(),
            ..self.clone()
        }
    }

    pub(crate) fn summary(&self, route: Route) -> MessageSummary {
        MessageSummary {
            id: self.id.clone(),
            from_agent: self.from_agent.clone(),
            to_agent: self.to_agent.clone(),
            message_type: self.message_type.clone(),
            priority: self.priority,
            correlation_id: self.correlation_id.clone(),
            payload_kind: self.content.kind(),
            route,
            sent_at: self.sent_at,
        }
    }
}

/// How a message left the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Direct,
    Broadcast,
    /// Resolved a pending request slot instead of entering an inbox.
    Response,
}

/// History entry retained by the bus. Content bodies are not kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSummary {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: String,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub payload_kind: &'static str,
    pub route: Route,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_orders_high_before_low() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Priority::Low.to_string(), "low");
    }

    #[test]
    fn payload_conversions_pick_matching_variant() {
        assert_eq!(Payload::from("x").as_text(), Some("x"));
        assert_eq!(Payload::from(json!(42)).as_data(), Some(&json!(42)));
        assert_eq!(Payload::Empty.kind(), "empty");
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = Payload::TaskResult {
            task_id: "t-1".into(),
            success: true,
            output: json!({"rows": 3}),
        };
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoded["kind"], "task_result");
        let decoded: Payload = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn builder_sets_routing_fields() {
        let msg = Message::new("observer", "actor", "screen_changed", json!({"frame": 7}))
            .with_priority(Priority::High)
            .with_correlation_id("corr-9")
            .with_metadata("source", "camera");
        assert_eq!(msg.priority, Priority::High);
        assert_eq!(msg.correlation_id.as_deref(), Some("corr-9"));
        assert_eq!(msg.metadata["source"], json!("camera"));
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_blank_fields() {
        let msg = Message::new("observer", "  ", "ping", Payload::Empty);
        assert_eq!(
            msg.validate(),
            Err(SwarmError::InvalidMessage { field: "to_agent" })
        );
    }

    #[test]
    fn readdressed_copy_keeps_timestamp_and_content() {
        let msg = Message::new("a", "*", "hi", json!(42));
        let copy = msg.readdressed("b");
        assert_eq!(copy.to_agent, "b");
        assert_eq!(copy.timestamp, msg.timestamp);
        assert_eq!(copy.content, msg.content);
        assert_eq!(copy.id, msg.id);
    }
}
