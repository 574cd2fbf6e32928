//! In-process message bus.
//!
//! Named endpoints with bounded priority inboxes, correlated
//! request/response through completion slots, broadcast, bounded history and
//! per-type delivery latency. All state sits behind one mutex that is never
//! held across an `.await`.

mod inbox;
mod message;
mod stats;

pub use message::{Message, MessageSummary, Payload, Priority, Route};
pub use stats::{BusStats, LatencySummary, LatencyWindow};

use crate::config::{BusConfig, InboxOverflowPolicy};
use crate::error::{Result, SwarmError};
use crate::observability::{EventSink, NoopSink};
use inbox::{Admission, PriorityInbox};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct InboxEntry {
    inbox: PriorityInbox,
    notify: Arc<Notify>,
}

/// Completion slot for one outstanding `request`.
struct PendingRequest {
    requester: String,
    target: String,
    /// Id of the request message itself, which never completes its own slot.
    request_id: String,
    tx: oneshot::Sender<Result<Message>>,
}

#[derive(Default)]
struct BusState {
    inboxes: HashMap<String, InboxEntry>,
    pending: HashMap<String, PendingRequest>,
    history: VecDeque<MessageSummary>,
    latency: HashMap<String, LatencyWindow>,
    total_messages: u64,
    total_delivered: u64,
    overflow_evictions: u64,
    discarded: u64,
    closed: bool,
}

impl BusState {
    fn push_history(&mut self, summary: MessageSummary, limit: usize) {
        while self.history.len() >= limit.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    fn record_latency(&mut self, message_type: &str, latency: Duration, sample_limit: usize) {
        self.latency
            .entry(message_type.to_string())
            .or_insert_with(|| LatencyWindow::new(sample_limit))
            .record(latency);
    }

    /// Remove the pending slot `message` answers: same correlation id,
    /// addressed to the requester, and not the request itself.
    fn take_pending_for(&mut self, message: &Message) -> Option<PendingRequest> {
        let correlation_id = message.correlation_id.as_deref()?;
        let matches = self.pending.get(correlation_id).is_some_and(|pending| {
            pending.requester == message.to_agent && pending.request_id != message.id
        });
        if matches {
            self.pending.remove(correlation_id)
        } else {
            None
        }
    }

    /// Hand `message` to its waiting requester. Gives the message back when
    /// the requester already stopped waiting.
    fn complete(
        &mut self,
        pending: PendingRequest,
        message: Message,
        sample_limit: usize,
    ) -> Result<std::result::Result<(MessageSummary, Delivery), Message>> {
        let latency = message.age();
        let message_type = message.message_type.clone();
        let summary = message.summary(Route::Response);
        match pending.tx.send(Ok(message)) {
            Ok(()) => {
                self.total_delivered += 1;
                self.record_latency(&message_type, latency, sample_limit);
                Ok(Ok((summary, Delivery::Resolved { latency })))
            }
            Err(Ok(message)) => Ok(Err(message)),
            Err(Err(err)) => Err(err),
        }
    }

    fn enqueue(
        &mut self,
        message: Message,
        route: Route,
        policy: InboxOverflowPolicy,
    ) -> Result<(MessageSummary, Delivery)> {
        let summary = message.summary(route);
        let entry = self
            .inboxes
            .get_mut(&message.to_agent)
            .ok_or_else(|| unknown_agent(&message.to_agent))?;

        match entry.inbox.offer(message, policy) {
            Admission::Accepted => {}
            Admission::Evicted(dropped) => {
                self.overflow_evictions += 1;
                tracing::warn!(
                    agent = %dropped.to_agent,
                    message_id = %dropped.id,
                    message_type = %dropped.message_type,
                    "Inbox full; evicted oldest message"
                );
            }
            Admission::Full(_) => {
                return Err(SwarmError::InboxFull {
                    agent: summary.to_agent,
                    capacity: entry.inbox.capacity(),
                });
            }
        }

        let delivery = Delivery::Enqueued {
            depth: entry.inbox.len(),
            notify: Arc::clone(&entry.notify),
        };
        Ok((summary, delivery))
    }

    fn take_pending_involving(&mut self, agent: &str) -> Vec<(String, PendingRequest)> {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.requester == agent || pending.target == agent)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|pending| (id, pending)))
            .collect()
    }
}

struct BusShared {
    config: BusConfig,
    sink: Arc<dyn EventSink>,
    state: Mutex<BusState>,
    closed: CancellationToken,
}

/// Cloneable handle to one in-process message bus.
#[derive(Clone)]
pub struct MessageBus {
    shared: Arc<BusShared>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("sink", &self.shared.sink.name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

enum Delivery {
    /// Resolved a pending request slot.
    Resolved { latency: Duration },
    Enqueued { depth: usize, notify: Arc<Notify> },
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self::with_sink(config, Arc::new(NoopSink))
    }

    pub fn with_sink(config: BusConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Arc::new(BusShared {
                config,
                sink,
                state: Mutex::new(BusState::default()),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.shared.sink)
    }

    /// Create an empty inbox for `agent`. `inbox_capacity == 0` means unbounded.
    pub fn register(&self, agent: &str, inbox_capacity: usize) -> Result<()> {
        if agent.trim().is_empty() {
            return Err(SwarmError::InvalidMessage { field: "agent_id" });
        }

        let mut state = self.lock_state();
        if state.closed {
            return Err(SwarmError::BusClosed);
        }
        if state.inboxes.contains_key(agent) {
            return Err(SwarmError::AlreadyRegistered {
                agent: agent.to_string(),
            });
        }
        state.inboxes.insert(
            agent.to_string(),
            InboxEntry {
                inbox: PriorityInbox::new(inbox_capacity),
                notify: Arc::new(Notify::new()),
            },
        );
        drop(state);

        tracing::debug!(agent, inbox_capacity, "Agent registered on bus");
        Ok(())
    }

    /// Remove `agent`'s inbox, discarding queued messages. Outstanding
    /// requests sent by or addressed to the agent fail with `AgentGone`.
    /// Returns `false` if the agent was not registered.
    pub fn unregister(&self, agent: &str) -> bool {
        let (entry, abandoned) = {
            let mut state = self.lock_state();
            let Some(entry) = state.inboxes.remove(agent) else {
                return false;
            };
            state.discarded += entry.inbox.len() as u64;
            let abandoned = state.take_pending_involving(agent);
            (entry, abandoned)
        };

        for (correlation_id, pending) in abandoned {
            let _ = pending.tx.send(Err(SwarmError::AgentGone {
                agent: agent.to_string(),
                correlation_id,
            }));
        }
        // Every blocked receive wakes up and looks the agent up again; the
        // stored permit covers a receiver that has not started waiting yet.
        entry.notify.notify_waiters();
        entry.notify.notify_one();

        tracing::debug!(agent, dropped = entry.inbox.len(), "Agent unregistered from bus");
        true
    }

    pub fn is_registered(&self, agent: &str) -> bool {
        self.lock_state().inboxes.contains_key(agent)
    }

    pub fn registered_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.lock_state().inboxes.keys().cloned().collect();
        agents.sort();
        agents
    }

    /// Number of messages queued for `agent`.
    pub fn pending_for(&self, agent: &str) -> Result<usize> {
        self.lock_state()
            .inboxes
            .get(agent)
            .map(|entry| entry.inbox.len())
            .ok_or_else(|| unknown_agent(agent))
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Route `message` to `message.to_agent`. Never waits for inbox space.
    /// The message is stamped with the send time on admission.
    pub fn send(&self, mut message: Message) -> Result<()> {
        message.stamp();
        self.deliver(message, Route::Direct)
    }

    fn deliver(&self, message: Message, route: Route) -> Result<()> {
        message.validate()?;
        let config = &self.shared.config;

        let (summary, delivery) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.closed {
                return Err(SwarmError::BusClosed);
            }

            let outcome = match state.take_pending_for(&message) {
                Some(pending) => match state.complete(pending, message, config.latency_sample_limit)? {
                    Ok(resolved) => resolved,
                    // Requester stopped waiting; treat the response as ordinary traffic.
                    Err(message) => state.enqueue(message, route, config.overflow_policy)?,
                },
                None => state.enqueue(message, route, config.overflow_policy)?,
            };
            state.total_messages += 1;
            state.push_history(outcome.0.clone(), config.history_limit);
            outcome
        };

        match delivery {
            Delivery::Resolved { latency } => {
                self.shared.sink.message_sent(&summary, 0);
                self.shared.sink.handoff(
                    &summary.from_agent,
                    &summary.to_agent,
                    &summary.message_type,
                    latency,
                );
            }
            Delivery::Enqueued { depth, notify } => {
                notify.notify_one();
                self.shared.sink.message_sent(&summary, depth);
            }
        }

        tracing::trace!(
            from = %summary.from_agent,
            to = %summary.to_agent,
            message_type = %summary.message_type,
            route = ?summary.route,
            "Message sent"
        );
        Ok(())
    }

    /// Dequeue the next message for `agent`: highest priority first, FIFO
    /// within a class. Fails with `Timeout` once `timeout` elapses.
    pub async fn receive(&self, agent: &str, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let mut guard = self.lock_state();
                let state = &mut *guard;
                if state.closed {
                    return Err(SwarmError::BusClosed);
                }
                let entry = state
                    .inboxes
                    .get_mut(agent)
                    .ok_or_else(|| unknown_agent(agent))?;

                if let Some(message) = entry.inbox.pop() {
                    let latency = message.age();
                    state.total_delivered += 1;
                    state.record_latency(
                        &message.message_type,
                        latency,
                        self.shared.config.latency_sample_limit,
                    );
                    drop(guard);

                    self.shared.sink.handoff(
                        &message.from_agent,
                        agent,
                        &message.message_type,
                        latency,
                    );
                    return Ok(message);
                }
                Arc::clone(&entry.notify)
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            tokio::select! {
                biased;
                () = self.shared.closed.cancelled() => return Err(SwarmError::BusClosed),
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    return Err(SwarmError::Timeout {
                        operation: "receive",
                        agent: agent.to_string(),
                        elapsed: timeout,
                        correlation_id: None,
                    });
                }
            }
        }
    }

    /// Send a message with a fresh correlation id and wait for the response
    /// addressed back to `from`.
    ///
    /// The response bypasses `from`'s inbox, so other traffic for `from`
    /// stays queued in order. A response that arrives after the timeout is
    /// delivered to `from`'s inbox as an ordinary message.
    pub async fn request(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        content: impl Into<Payload>,
        priority: Priority,
        timeout: Duration,
    ) -> Result<Message> {
        let correlation_id = Uuid::new_v4().to_string();
        let message = Message::new(from, to, message_type, content)
            .with_priority(priority)
            .with_correlation_id(correlation_id.clone());
        message.validate()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            if state.closed {
                return Err(SwarmError::BusClosed);
            }
            state.pending.insert(
                correlation_id.clone(),
                PendingRequest {
                    requester: from.to_string(),
                    target: to.to_string(),
                    request_id: message.id.clone(),
                    tx,
                },
            );
        }
        let _slot = PendingSlot {
            bus: self,
            correlation_id: &correlation_id,
        };

        self.send(message)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Slot dropped without an answer: only shutdown does that.
            Ok(Err(_)) => Err(SwarmError::BusClosed),
            Err(_) => {
                tracing::debug!(from, to, message_type, correlation_id = %correlation_id, "Request timed out");
                Err(SwarmError::Timeout {
                    operation: "request",
                    agent: to.to_string(),
                    elapsed: timeout,
                    correlation_id: Some(correlation_id.clone()),
                })
            }
        }
    }

    /// Send a `HIGH` priority response carrying `correlation_id`.
    pub fn respond(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        content: impl Into<Payload>,
        correlation_id: &str,
    ) -> Result<()> {
        self.respond_with_priority(from, to, message_type, content, correlation_id, Priority::High)
    }

    pub fn respond_with_priority(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        content: impl Into<Payload>,
        correlation_id: &str,
        priority: Priority,
    ) -> Result<()> {
        self.send(
            Message::new(from, to, message_type, content)
                .with_priority(priority)
                .with_correlation_id(correlation_id),
        )
    }

    /// Deliver a copy of `message` to every registered agent except the
    /// sender and `exclude`. Returns how many copies were enqueued.
    ///
    /// Recipients whose inbox is full, or that unregister mid-broadcast, are
    /// skipped and logged.
    pub fn broadcast(&self, mut message: Message, exclude: &[&str]) -> Result<usize> {
        message.stamp();
        let recipients: Vec<String> = {
            let state = self.lock_state();
            if state.closed {
                return Err(SwarmError::BusClosed);
            }
            let mut recipients: Vec<String> = state
                .inboxes
                .keys()
                .filter(|agent| **agent != message.from_agent && !exclude.contains(&agent.as_str()))
                .cloned()
                .collect();
            recipients.sort();
            recipients
        };

        let mut delivered = 0;
        for recipient in recipients {
            match self.deliver(message.readdressed(&recipient), Route::Broadcast) {
                Ok(()) => delivered += 1,
                Err(err @ (SwarmError::InboxFull { .. } | SwarmError::UnknownAgent { .. })) => {
                    tracing::warn!(
                        from = %message.from_agent,
                        to = %recipient,
                        message_type = %message.message_type,
                        "Broadcast copy not delivered: {err}"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(delivered)
    }

    /// Discard everything queued for `agent`; returns how many messages were dropped.
    pub fn clear(&self, agent: &str) -> Result<usize> {
        let mut state = self.lock_state();
        let dropped = state
            .inboxes
            .get_mut(agent)
            .map(|entry| entry.inbox.clear())
            .ok_or_else(|| unknown_agent(agent))?;
        state.discarded += dropped as u64;
        Ok(dropped)
    }

    /// Close the bus: discard every inbox, fail outstanding requests with
    /// `BusClosed` and wake all blocked receivers. Idempotent.
    pub fn shutdown(&self) {
        let (abandoned, dropped) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            state.closed = true;
            let dropped: usize = state
                .inboxes
                .values_mut()
                .map(|entry| entry.inbox.clear())
                .sum();
            state.discarded += dropped as u64;
            let abandoned: Vec<PendingRequest> = state.pending.drain().map(|(_, p)| p).collect();
            (abandoned, dropped)
        };

        self.shared.closed.cancel();
        let cancelled = abandoned.len();
        for pending in abandoned {
            let _ = pending.tx.send(Err(SwarmError::BusClosed));
        }

        tracing::info!(dropped, cancelled_requests = cancelled, "Message bus shut down");
    }

    pub fn stats(&self) -> BusStats {
        let state = self.lock_state();
        BusStats {
            total_messages: state.total_messages,
            total_delivered: state.total_delivered,
            overflow_evictions: state.overflow_evictions,
            discarded: state.discarded,
            inbox_sizes: state
                .inboxes
                .iter()
                .map(|(agent, entry)| (agent.clone(), entry.inbox.len()))
                .collect(),
            inbox_high_water: state
                .inboxes
                .iter()
                .map(|(agent, entry)| (agent.clone(), entry.inbox.high_water()))
                .collect(),
            latency_by_type: state
                .latency
                .iter()
                .map(|(message_type, window)| (message_type.clone(), window.summary()))
                .collect(),
            pending_requests: state.pending.len(),
            history_size: state.history.len(),
            closed: state.closed,
        }
    }

    /// Most recent `limit` summaries (all retained when `None`), oldest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<MessageSummary> {
        let state = self.lock_state();
        let skip = limit.map_or(0, |limit| state.history.len().saturating_sub(limit));
        state.history.iter().skip(skip).cloned().collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.shared.state.lock()
    }
}

/// Removes a request's completion slot when the request returns or is dropped.
struct PendingSlot<'a> {
    bus: &'a MessageBus,
    correlation_id: &'a str,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.bus.lock_state().pending.remove(self.correlation_id);
    }
}

fn unknown_agent(agent: &str) -> SwarmError {
    SwarmError::UnknownAgent {
        agent: agent.to_string(),
    }
}
