//! Swarm coordinator: one bus, one deadlock detector and one event sink
//! shared by every agent runtime it spawns.

use crate::agent::{AgentRuntime, AgentStatus, MessageHandler};
use crate::bus::{BusStats, MessageBus};
use crate::config::Config;
use crate::deadlock::{DeadlockDetector, DetectorStats};
use crate::error::{Result, SwarmError};
use crate::observability::{create_sink, EventSink};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-agent entry of [`SwarmHealth`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentHealth {
    pub status: AgentStatus,
    pub healthy: bool,
    pub running: bool,
    pub processed: u64,
    pub errors: u64,
    pub heartbeats: u64,
    pub idle_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwarmHealth {
    pub written_at: String,
    pub agents: BTreeMap<String, AgentHealth>,
    pub bus: BusStats,
    pub detector: DetectorStats,
}

impl SwarmHealth {
    pub fn all_healthy(&self) -> bool {
        self.agents.values().all(|agent| agent.healthy)
    }
}

pub struct Swarm {
    config: Config,
    bus: MessageBus,
    detector: DeadlockDetector,
    sink: Arc<dyn EventSink>,
    agents: Mutex<BTreeMap<String, Arc<AgentRuntime>>>,
    shut_down: AtomicBool,
}

impl Swarm {
    pub fn new(config: Config, sink: Arc<dyn EventSink>) -> Self {
        let bus = MessageBus::with_sink(config.bus.clone(), Arc::clone(&sink));
        let detector = DeadlockDetector::with_sink(config.deadlock.clone(), Arc::clone(&sink));
        Self {
            config,
            bus,
            detector,
            sink,
            agents: Mutex::new(BTreeMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Build the sink from `[observability]`; relative log paths resolve
    /// against `base_dir`.
    pub fn from_config(config: Config, base_dir: &Path) -> Self {
        let sink = create_sink(&config.observability, base_dir);
        Self::new(config, sink)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn detector(&self) -> &DeadlockDetector {
        &self.detector
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    /// Register `agent_id` with the default inbox capacity and start its runtime.
    pub async fn spawn_agent(&self, agent_id: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.spawn_agent_with_capacity(agent_id, handler, self.config.bus.default_inbox_capacity)
            .await
    }

    pub async fn spawn_agent_with_capacity(
        &self,
        agent_id: &str,
        handler: Arc<dyn MessageHandler>,
        inbox_capacity: usize,
    ) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SwarmError::BusClosed);
        }

        // Registering first makes duplicate ids fail before any hook runs.
        self.bus.register(agent_id, inbox_capacity)?;
        let runtime = Arc::new(
            AgentRuntime::new(agent_id, handler, self.bus.clone(), self.config.agent.clone())
                .with_detector(self.detector.clone())
                .with_inbox_capacity(inbox_capacity),
        );
        if let Err(err) = runtime.start().await {
            self.bus.unregister(agent_id);
            return Err(err);
        }

        self.agents.lock().insert(agent_id.to_string(), runtime);
        self.detector.start();
        tracing::info!(agent = %agent_id, inbox_capacity, "Agent spawned");
        Ok(())
    }

    pub async fn stop_agent(&self, agent_id: &str) -> Result<()> {
        let runtime = self
            .agents
            .lock()
            .remove(agent_id)
            .ok_or_else(|| SwarmError::UnknownAgent {
                agent: agent_id.to_string(),
            })?;
        runtime.stop().await;
        Ok(())
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<AgentRuntime>> {
        self.agents.lock().get(agent_id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.lock().keys().cloned().collect()
    }

    pub fn health(&self) -> SwarmHealth {
        let agents = self
            .agents
            .lock()
            .iter()
            .map(|(agent_id, runtime)| {
                let state = runtime.state();
                (
                    agent_id.clone(),
                    AgentHealth {
                        status: state.status,
                        healthy: runtime.is_healthy(),
                        running: runtime.is_running(),
                        processed: runtime.processed_count(),
                        errors: runtime.error_count(),
                        heartbeats: runtime.heartbeat_count(),
                        idle_ms: state.last_activity.elapsed().as_secs_f64() * 1000.0,
                        last_error: state.error,
                    },
                )
            })
            .collect();

        SwarmHealth {
            written_at: Utc::now().to_rfc3339(),
            agents,
            bus: self.bus.stats(),
            detector: self.detector.stats(),
        }
    }

    pub fn health_json(&self) -> serde_json::Value {
        serde_json::to_value(self.health()).unwrap_or_else(|_| serde_json::json!({}))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Close the bus, stop every agent and the detector, then finalize the sink.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        // Close the bus first; handlers blocked in a request get BusClosed.
        self.bus.shutdown();

        let runtimes: Vec<Arc<AgentRuntime>> = std::mem::take(&mut *self.agents.lock())
            .into_values()
            .collect();
        let stopped = runtimes.len();
        for runtime in runtimes {
            runtime.stop().await;
        }

        self.detector.stop().await;

        // Persisting sinks flush on a blocking writer.
        let sink = Arc::clone(&self.sink);
        if let Err(err) = tokio::task::spawn_blocking(move || sink.finalize()).await {
            tracing::warn!("Sink finalize failed: {err}");
        }

        tracing::info!(agents = stopped, "Swarm shut down");
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("agents", &self.agent_ids())
            .field("sink", &self.sink.name())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
