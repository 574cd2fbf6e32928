use crate::bus::{Message, MessageBus, Payload, Priority};
use crate::error::Result;
use crate::observability::EventSink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Message addressed by a handler; the runtime sends it on the agent's behalf.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: String,
    pub message_type: String,
    pub content: Payload,
    pub priority: Priority,
    pub correlation_id: Option<String>,
}

impl Outbound {
    pub fn new(
        to: impl Into<String>,
        message_type: impl Into<String>,
        content: impl Into<Payload>,
    ) -> Self {
        Self {
            to: to.into(),
            message_type: message_type.into(),
            content: content.into(),
            priority: Priority::Normal,
            correlation_id: None,
        }
    }

    /// Response to `message`: addressed to its sender, same correlation id,
    /// `HIGH` priority.
    pub fn reply_to(
        message: &Message,
        message_type: impl Into<String>,
        content: impl Into<Payload>,
    ) -> Self {
        Self {
            to: message.from_agent.clone(),
            message_type: message_type.into(),
            content: content.into(),
            priority: Priority::High,
            correlation_id: message.correlation_id.clone(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn into_message(self, from_agent: &str) -> Message {
        let message = Message::new(from_agent, self.to, self.message_type, self.content)
            .with_priority(self.priority);
        match self.correlation_id {
            Some(correlation_id) => message.with_correlation_id(correlation_id),
            None => message,
        }
    }
}

/// Handle passed to every handler call.
#[derive(Clone)]
pub struct AgentContext {
    agent_id: String,
    bus: MessageBus,
    sink: Arc<dyn EventSink>,
}

impl AgentContext {
    pub fn new(agent_id: impl Into<String>, bus: MessageBus) -> Self {
        let sink = bus.sink();
        Self {
            agent_id: agent_id.into(),
            bus,
            sink,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }

    pub fn send(
        &self,
        to: &str,
        message_type: &str,
        content: impl Into<Payload>,
        priority: Priority,
    ) -> Result<()> {
        self.bus.send(
            Message::new(&self.agent_id, to, message_type, content).with_priority(priority),
        )
    }

    /// Answer `message` directly, bypassing the handler's return value.
    pub fn respond(
        &self,
        message: &Message,
        message_type: &str,
        content: impl Into<Payload>,
    ) -> Result<()> {
        self.bus
            .send(Outbound::reply_to(message, message_type, content).into_message(&self.agent_id))
    }

    pub async fn request(
        &self,
        to: &str,
        message_type: &str,
        content: impl Into<Payload>,
        timeout: Duration,
    ) -> Result<Message> {
        self.bus
            .request(&self.agent_id, to, message_type, content, Priority::Normal, timeout)
            .await
    }

    pub fn broadcast(
        &self,
        message_type: &str,
        content: impl Into<Payload>,
        exclude: &[&str],
    ) -> Result<usize> {
        self.bus
            .broadcast(Message::new(&self.agent_id, "*", message_type, content), exclude)
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent_id", &self.agent_id)
            .field("sink", &self.sink.name())
            .finish_non_exhaustive()
    }
}

/// Behaviour of one concrete agent.
///
/// The runtime owns the receive loop, state machine and heartbeat; a handler
/// only turns messages into optional outbound messages. Returning `Ok(None)`
/// means the handler already routed any replies itself.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process_message(
        &self,
        ctx: &AgentContext,
        message: Message,
    ) -> anyhow::Result<Option<Outbound>>;

    async fn on_start(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after `process_message` fails, before the agent enters `error`.
    async fn on_error(&self, _ctx: &AgentContext, _error: &anyhow::Error) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use serde_json::json;

    #[test]
    fn reply_keeps_correlation_and_targets_sender() {
        let request = Message::new("coordinator", "validator", "check", json!({"step": 2}))
            .with_correlation_id("corr-7");
        let reply = Outbound::reply_to(&request, "check_result", json!({"safe": true}));

        assert_eq!(reply.to, "coordinator");
        assert_eq!(reply.priority, Priority::High);
        let message = reply.into_message("validator");
        assert_eq!(message.from_agent, "validator");
        assert_eq!(message.correlation_id.as_deref(), Some("corr-7"));
    }

    #[test]
    fn plain_outbound_has_no_correlation() {
        let message = Outbound::new("actor", "click", json!({"x": 1}))
            .with_priority(Priority::Low)
            .into_message("planner");
        assert!(message.correlation_id.is_none());
        assert_eq!(message.priority, Priority::Low);
    }

    #[tokio::test]
    async fn context_respond_routes_to_requester() {
        let bus = MessageBus::new(BusConfig::default());
        bus.register("a", 0).unwrap();
        bus.register("b", 0).unwrap();
        let ctx = AgentContext::new("b", bus.clone());

        ctx.send("a", "hello", "hi", Priority::Normal).unwrap();
        let incoming = bus.receive("a", Duration::from_millis(50)).await.unwrap();
        assert_eq!(incoming.from_agent, "b");

        let question = Message::new("a", "b", "q", Payload::Empty).with_correlation_id("c-1");
        ctx.respond(&question, "answer", "42").unwrap();
        let answer = bus.receive("a", Duration::from_millis(50)).await.unwrap();
        assert_eq!(answer.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(answer.content.as_text(), Some("42"));
    }
}
