use super::state::{AgentState, AgentStatus};
use super::traits::{AgentContext, MessageHandler};
use crate::bus::{Message, MessageBus};
use crate::config::AgentRuntimeConfig;
use crate::deadlock::DeadlockDetector;
use crate::error::{Result, SwarmError};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct RuntimeInner {
    ctx: AgentContext,
    handler: Arc<dyn MessageHandler>,
    config: AgentRuntimeConfig,
    state: Mutex<AgentState>,
    heartbeats: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    cancel: CancellationToken,
    /// Set once the receive loop has exited.
    finished: watch::Sender<bool>,
    exit: Mutex<Option<Result<()>>>,
}

impl RuntimeInner {
    fn agent_id(&self) -> &str {
        self.ctx.agent_id()
    }

    fn set_status(&self, status: AgentStatus) {
        self.state.lock().transition(status);
    }

    fn touch(&self) {
        self.state.lock().touch();
    }

    /// One message through the handler. Handler panics count as errors.
    async fn handle(&self, message: Message) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.transition(AgentStatus::Processing);
            state.touch();
        }

        let message_type = message.message_type.clone();
        let outcome = AssertUnwindSafe(self.handler.process_message(&self.ctx, message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "process_message panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });

        match outcome {
            Ok(outbound) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                if let Some(outbound) = outbound {
                    let to = outbound.to.clone();
                    if let Err(err) = self.ctx.bus().send(outbound.into_message(self.agent_id())) {
                        tracing::warn!(
                            agent = %self.agent_id(),
                            to = %to,
                            "Outbound message not delivered: {err}"
                        );
                    }
                }
                let mut state = self.state.lock();
                state.touch();
                state.transition(AgentStatus::Idle);
                Ok(())
            }
            Err(error) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.handler.on_error(&self.ctx, &error).await;

                let err = SwarmError::handler(self.agent_id(), &error);
                let detail = format!("{error:#}");
                self.state.lock().fail(detail.clone());
                self.ctx.sink().agent_error(self.agent_id(), &detail);
                tracing::warn!(
                    agent = %self.agent_id(),
                    message_type = %message_type,
                    auto_restart = self.config.auto_restart,
                    "Handler failed: {detail}"
                );

                if self.config.auto_restart {
                    self.set_status(AgentStatus::Idle);
                }
                Err(err)
            }
        }
    }

    async fn receive_loop(&self) -> Result<()> {
        let timeout = self.config.receive_timeout();
        loop {
            self.set_status(AgentStatus::Idle);
            let received = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),
                received = self.ctx.bus().receive(self.agent_id(), timeout) => received,
            };

            match received {
                Ok(message) => {
                    if let Err(err) = self.handle(message).await {
                        if !self.config.auto_restart {
                            return Err(err);
                        }
                    }
                }
                Err(err) if err.is_timeout() => {
                    self.set_status(AgentStatus::Waiting);
                    self.touch();
                    self.ctx.sink().agent_waiting(self.agent_id(), timeout);
                }
                Err(SwarmError::BusClosed) => {
                    tracing::debug!(agent = %self.agent_id(), "Bus closed; receive loop exiting");
                    return Ok(());
                }
                Err(err) if self.cancel.is_cancelled() => {
                    tracing::debug!(agent = %self.agent_id(), "Receive loop cancelled: {err}");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(agent = %self.agent_id(), "Receive loop exiting: {err}");
                    return Err(err);
                }
            }
        }
    }

    async fn heartbeat_loop(&self, detector: Option<DeadlockDetector>, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                _ = interval.tick() => {}
            }

            let (status, last_activity) = {
                let state = self.state.lock();
                // An agent parked in `receive` is live; only a handler that
                // never returns freezes its clock.
                let activity = if state.status == AgentStatus::Processing {
                    state.last_activity
                } else {
                    Instant::now()
                };
                (state.status, activity)
            };
            let beats = self.heartbeats.fetch_add(1, Ordering::Relaxed) + 1;

            if let Some(detector) = &detector {
                detector.report_activity(self.agent_id(), status, last_activity);
            }
            self.ctx.sink().heartbeat(self.agent_id(), status, beats);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Runs one [`MessageHandler`]: registration, receive loop, heartbeat,
/// state machine and shutdown.
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
    detector: Option<DeadlockDetector>,
    inbox_capacity: usize,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentRuntime {
    pub fn new(
        agent_id: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        bus: MessageBus,
        config: AgentRuntimeConfig,
    ) -> Self {
        let inbox_capacity = bus.config().default_inbox_capacity;
        let (finished, _) = watch::channel(false);
        Self {
            inner: Arc::new(RuntimeInner {
                ctx: AgentContext::new(agent_id, bus),
                handler,
                config,
                state: Mutex::new(AgentState::new()),
                heartbeats: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                finished,
                exit: Mutex::new(None),
            }),
            detector: None,
            inbox_capacity,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_detector(mut self, detector: DeadlockDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Capacity used if `start` has to register the agent on the bus.
    #[must_use]
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    pub fn agent_id(&self) -> &str {
        self.inner.agent_id()
    }

    pub fn context(&self) -> &AgentContext {
        &self.inner.ctx
    }

    /// Run the start hook, register with the bus and detector, then spawn the
    /// receive loop and heartbeat. Calling `start` twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = &self.inner;
        let agent_id = inner.agent_id().to_string();
        let bus = inner.ctx.bus();

        if let Err(error) = inner.handler.on_start(&inner.ctx).await {
            let err = SwarmError::handler(&agent_id, &error);
            inner.state.lock().fail(format!("{error:#}"));
            inner.ctx.sink().agent_error(&agent_id, &format!("{error:#}"));
            self.finish(Err(err.clone()));
            return Err(err);
        }

        if !bus.is_registered(&agent_id) {
            if let Err(err) = bus.register(&agent_id, self.inbox_capacity) {
                self.finish(Err(err.clone()));
                return Err(err);
            }
        }
        if let Some(detector) = &self.detector {
            detector.register(&agent_id);
        }
        inner.ctx.sink().agent_started(&agent_id);
        {
            let mut state = inner.state.lock();
            state.transition(AgentStatus::Idle);
            state.touch();
        }

        let heartbeat_stop = inner.cancel.child_token();
        let loop_inner = Arc::clone(inner);
        let loop_stop = heartbeat_stop.clone();
        let receive = tokio::spawn(async move {
            let result = AssertUnwindSafe(loop_inner.receive_loop())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(SwarmError::HandlerError {
                        agent: loop_inner.agent_id().to_string(),
                        message: format!("receive loop panicked: {}", panic_message(panic.as_ref())),
                    })
                });
            loop_stop.cancel();
            *loop_inner.exit.lock() = Some(result);
            loop_inner.finished.send_replace(true);
        });

        let beat_inner = Arc::clone(inner);
        let detector = self.detector.clone();
        let heartbeat = tokio::spawn(async move {
            beat_inner.heartbeat_loop(detector, heartbeat_stop).await;
        });
        self.tasks.lock().extend([receive, heartbeat]);

        inner.ctx.sink().agent_ready(&agent_id);
        tracing::info!(
            agent = %agent_id,
            heartbeat_secs = inner.config.heartbeat_interval_secs,
            auto_restart = inner.config.auto_restart,
            "Agent started"
        );
        Ok(())
    }

    /// Cancel the loop and heartbeat, wait for any in-flight handler call,
    /// run the stop hook and unregister. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        let agent_id = inner.agent_id().to_string();

        inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(agent = %agent_id, "Agent task failed: {err}");
            }
        }

        if self.started.load(Ordering::SeqCst) {
            if let Err(error) = inner.handler.on_stop(&inner.ctx).await {
                tracing::warn!(agent = %agent_id, "on_stop hook failed: {error:#}");
            }
        }

        inner.ctx.bus().unregister(&agent_id);
        if let Some(detector) = &self.detector {
            detector.unregister(&agent_id);
        }
        inner.set_status(AgentStatus::Stopped);
        let loop_exited = inner.exit.lock().is_some();
        if !loop_exited {
            self.finish(Ok(()));
        }
        inner.ctx.sink().agent_stopped(&agent_id);

        tracing::info!(
            agent = %agent_id,
            processed = self.processed_count(),
            errors = self.error_count(),
            "Agent stopped"
        );
    }

    fn finish(&self, result: Result<()>) {
        *self.inner.exit.lock() = Some(result);
        self.inner.finished.send_replace(true);
    }

    /// Wait for the receive loop to exit and return its outcome. Returns
    /// immediately if the agent was never started.
    pub async fn join(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut finished = self.inner.finished.subscribe();
        // Sender lives in `inner`, so the channel cannot close under us.
        let _ = finished.wait_for(|done| *done).await;
        self.inner.exit.lock().clone().unwrap_or(Ok(()))
    }

    /// Running, not in `error`, and active within the liveness window.
    pub fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let state = self.inner.state.lock();
        state.status != AgentStatus::Error
            && state.last_activity.elapsed() <= self.inner.config.liveness_window()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
            && !*self.inner.finished.borrow()
    }

    pub fn state(&self) -> AgentState {
        self.inner.state.lock().clone()
    }

    pub fn status(&self) -> AgentStatus {
        self.inner.state.lock().status
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.inner.heartbeats.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.inner.errors.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agent_id", &self.agent_id())
            .field("status", &self.status())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
