//! Cooperative liveness watchdog.
//!
//! Agents (usually via their runtime heartbeat) report activity; a single
//! monitor task flags every agent whose last activity is older than the
//! configured timeout. Each stall episode is reported once: an agent stays
//! suppressed until its activity advances again.

use crate::agent::AgentStatus;
use crate::config::DeadlockConfig;
use crate::error::{Result, SwarmError};
use crate::observability::{EventSink, NoopSink, StuckAgent};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Name the detector uses when recording events.
pub const DETECTOR_AGENT: &str = "deadlock_detector";

const REPORT_CHANNEL_CAPACITY: usize = 16;

/// Recovery hook invoked with every new report. `Ok` counts as a recovery.
pub type DeadlockCallback =
    Arc<dyn Fn(DeadlockReport) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One detection: every agent found stuck in the same check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadlockReport {
    /// 1-based detection counter value for this report.
    pub detection: u64,
    pub detected_at: DateTime<Utc>,
    pub stuck: Vec<StuckAgent>,
}

impl DeadlockReport {
    pub fn agents(&self) -> impl Iterator<Item = &str> {
        self.stuck.iter().map(|stuck| stuck.agent.as_str())
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.agents().any(|stuck| stuck == agent)
    }

    pub fn into_error(self) -> SwarmError {
        SwarmError::DeadlockDetected {
            agents: self
                .stuck
                .into_iter()
                .map(|stuck| (stuck.agent, Duration::from_secs_f64(stuck.idle_ms / 1000.0)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct ActivityRecord {
    last_activity: Instant,
    message_count: u64,
    state: AgentStatus,
    reported: bool,
}

impl ActivityRecord {
    fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            message_count: 0,
            state: AgentStatus::Idle,
            reported: false,
        }
    }
}

/// Per-agent view returned by [`DeadlockDetector::agent_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentActivity {
    pub state: AgentStatus,
    pub message_count: u64,
    pub idle_ms: f64,
    pub stuck: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorStats {
    pub running: bool,
    pub registered_agents: usize,
    pub checks: u64,
    pub detections: u64,
    pub recoveries: u64,
    pub timeout_secs: f64,
    pub check_interval_secs: f64,
}

#[derive(Debug, Default)]
struct Counters {
    checks: u64,
    detections: u64,
    recoveries: u64,
}

struct Monitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct DetectorShared {
    config: DeadlockConfig,
    sink: Arc<dyn EventSink>,
    activity: Mutex<HashMap<String, ActivityRecord>>,
    counters: Mutex<Counters>,
    callback: Mutex<Option<DeadlockCallback>>,
    reports: broadcast::Sender<DeadlockReport>,
    monitor: Mutex<Option<Monitor>>,
}

/// Cloneable handle to one deadlock detector.
#[derive(Clone)]
pub struct DeadlockDetector {
    shared: Arc<DetectorShared>,
}

impl std::fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl DeadlockDetector {
    pub fn new(config: DeadlockConfig) -> Self {
        Self::with_sink(config, Arc::new(NoopSink))
    }

    pub fn with_sink(config: DeadlockConfig, sink: Arc<dyn EventSink>) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(DetectorShared {
                config,
                sink,
                activity: Mutex::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
                callback: Mutex::new(None),
                reports,
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &DeadlockConfig {
        &self.shared.config
    }

    pub fn set_callback(&self, callback: DeadlockCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    /// Receive every future report.
    pub fn subscribe(&self) -> broadcast::Receiver<DeadlockReport> {
        self.shared.reports.subscribe()
    }

    /// Start tracking `agent`; its clock starts now.
    pub fn register(&self, agent: &str) {
        self.shared
            .activity
            .lock()
            .entry(agent.to_string())
            .or_insert_with(|| ActivityRecord::new(Instant::now()));
        tracing::debug!(agent, "Agent registered with deadlock detector");
    }

    pub fn unregister(&self, agent: &str) -> bool {
        self.shared.activity.lock().remove(agent).is_some()
    }

    /// Record a ping at the current time, optionally with a new state.
    pub fn update_activity(&self, agent: &str, state: Option<AgentStatus>) {
        let now = Instant::now();
        let mut activity = self.shared.activity.lock();
        let record = activity
            .entry(agent.to_string())
            .or_insert_with(|| ActivityRecord::new(now));
        record.last_activity = now;
        record.message_count += 1;
        record.reported = false;
        if let Some(state) = state {
            record.state = state;
        }
    }

    /// Record a heartbeat carrying the agent's own `last_activity`. A heartbeat
    /// whose activity has not advanced keeps an already reported agent suppressed.
    pub fn report_activity(&self, agent: &str, state: AgentStatus, last_activity: Instant) {
        let mut activity = self.shared.activity.lock();
        let record = activity
            .entry(agent.to_string())
            .or_insert_with(|| ActivityRecord::new(last_activity));
        if last_activity > record.last_activity {
            record.last_activity = last_activity;
            record.reported = false;
        }
        record.message_count += 1;
        record.state = state;
    }

    /// Start the monitor task. Returns `false` when disabled or already running.
    pub fn start(&self) -> bool {
        if !self.shared.config.enabled {
            tracing::info!("Deadlock detector disabled");
            return false;
        }

        let mut monitor = self.shared.monitor.lock();
        if monitor.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let detector = self.clone();
        let cancel = token.clone();
        let handle = tokio::spawn(async move { detector.run(cancel).await });
        *monitor = Some(Monitor { token, handle });

        tracing::info!(
            timeout_secs = self.shared.config.timeout_secs,
            check_interval_secs = self.shared.config.effective_check_interval().as_secs_f64(),
            "Deadlock detector started"
        );
        true
    }

    /// Stop the monitor task and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let monitor = self.shared.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.token.cancel();
            if let Err(err) = monitor.handle.await {
                tracing::warn!("Deadlock monitor task failed: {err}");
            }
            tracing::info!("Deadlock detector stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.monitor.lock().is_some()
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.shared.config.effective_check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.check_now().await {
                tracing::debug!("{err}");
            }
        }
    }

    /// Run one check now. Fails with `DeadlockDetected` when a new stuck set
    /// was found; the report is also recorded, broadcast and passed to the
    /// recovery callback.
    pub async fn check_now(&self) -> Result<()> {
        let Some(report) = self.scan() else {
            return Ok(());
        };

        {
            let agents: Vec<&str> = report.agents().collect();
            tracing::error!(
                detection = report.detection,
                stuck = ?agents,
                timeout_secs = self.shared.config.timeout_secs,
                "Deadlock detected"
            );
        }
        self.shared
            .sink
            .deadlock_detected(DETECTOR_AGENT, report.stuck.clone());
        // No subscribers is fine.
        let _ = self.shared.reports.send(report.clone());

        let callback = self.shared.callback.lock().clone();
        if let Some(callback) = callback {
            match callback(report.clone()).await {
                Ok(()) => {
                    self.shared.counters.lock().recoveries += 1;
                    tracing::info!(detection = report.detection, "Deadlock recovery succeeded");
                }
                Err(err) => {
                    tracing::warn!(detection = report.detection, "Deadlock recovery failed: {err:#}");
                }
            }
        }

        Err(report.into_error())
    }

    fn scan(&self) -> Option<DeadlockReport> {
        let now = Instant::now();
        let timeout = self.shared.config.timeout();

        let mut stuck: Vec<StuckAgent> = {
            let mut activity = self.shared.activity.lock();
            activity
                .iter_mut()
                .filter_map(|(agent, record)| {
                    let idle = now.saturating_duration_since(record.last_activity);
                    if idle <= timeout || record.reported {
                        return None;
                    }
                    record.reported = true;
                    Some(StuckAgent {
                        agent: agent.clone(),
                        idle_ms: idle.as_secs_f64() * 1000.0,
                    })
                })
                .collect()
        };

        let mut counters = self.shared.counters.lock();
        counters.checks += 1;
        if stuck.is_empty() {
            return None;
        }
        counters.detections += 1;
        stuck.sort_by(|a, b| a.agent.cmp(&b.agent));

        Some(DeadlockReport {
            detection: counters.detections,
            detected_at: Utc::now(),
            stuck,
        })
    }

    pub fn stats(&self) -> DetectorStats {
        let counters = self.shared.counters.lock();
        DetectorStats {
            running: self.is_running(),
            registered_agents: self.shared.activity.lock().len(),
            checks: counters.checks,
            detections: counters.detections,
            recoveries: counters.recoveries,
            timeout_secs: self.shared.config.timeout_secs,
            check_interval_secs: self.shared.config.effective_check_interval().as_secs_f64(),
        }
    }

    pub fn agent_status(&self) -> BTreeMap<String, AgentActivity> {
        let now = Instant::now();
        let timeout = self.shared.config.timeout();
        self.shared
            .activity
            .lock()
            .iter()
            .map(|(agent, record)| {
                let idle = now.saturating_duration_since(record.last_activity);
                (
                    agent.clone(),
                    AgentActivity {
                        state: record.state,
                        message_count: record.message_count,
                        idle_ms: idle.as_secs_f64() * 1000.0,
                        stuck: idle > timeout,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::SessionLogger;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config(timeout_ms: u64, check_ms: u64) -> DeadlockConfig {
        DeadlockConfig {
            enabled: true,
            timeout_secs: timeout_ms as f64 / 1000.0,
            check_interval_secs: check_ms as f64 / 1000.0,
        }
    }

    #[tokio::test]
    async fn silent_agent_is_reported_exactly_once() {
        let sink = Arc::new(SessionLogger::in_memory(100));
        let detector = DeadlockDetector::with_sink(fast_config(500, 200), sink.clone());
        let mut reports = detector.subscribe();
        detector.register("D");
        assert!(detector.start());

        let report = tokio::time::timeout(Duration::from_secs(1), reports.recv())
            .await
            .expect("report within 1s")
            .expect("channel open");
        assert!(report.contains("D"));
        assert_eq!(report.detection, 1);

        // further checks stay quiet while D remains silent
        tokio::time::sleep(Duration::from_millis(500)).await;
        detector.stop().await;
        let stats = detector.stats();
        assert_eq!(stats.detections, 1);
        assert!(stats.checks >= 3);
        assert!(!stats.running);
        assert_eq!(sink.metrics().deadlocks_detected, 1);
    }

    #[tokio::test]
    async fn pinged_agent_is_never_reported() {
        let detector = DeadlockDetector::new(fast_config(300, 50));
        detector.register("healthy");
        detector.start();

        for _ in 0..10 {
            detector.update_activity("healthy", Some(AgentStatus::Idle));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        detector.stop().await;

        assert_eq!(detector.stats().detections, 0);
        let status = detector.agent_status();
        assert_eq!(status["healthy"].message_count, 10);
        assert!(!status["healthy"].stuck);
    }

    #[tokio::test]
    async fn check_now_raises_deadlock_with_every_stuck_agent() {
        let detector = DeadlockDetector::new(fast_config(20, 20));
        detector.register("observer");
        detector.register("actor");
        tokio::time::sleep(Duration::from_millis(40)).await;

        let err = detector.check_now().await.expect_err("both stuck");
        let SwarmError::DeadlockDetected { agents } = err else {
            panic!("expected deadlock, got {err:?}");
        };
        let names: Vec<&str> = agents.iter().map(|(agent, _)| agent.as_str()).collect();
        assert_eq!(names, ["actor", "observer"]);
        assert!(agents.iter().all(|(_, idle)| *idle >= Duration::from_millis(20)));

        // same episode: suppressed
        assert!(detector.check_now().await.is_ok());
        assert_eq!(detector.stats().detections, 1);
    }

    #[tokio::test]
    async fn new_episode_after_ping_is_reported_again() {
        let detector = DeadlockDetector::new(fast_config(20, 20));
        detector.register("worker");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(detector.check_now().await.is_err());

        detector.update_activity("worker", None);
        assert!(detector.check_now().await.is_ok());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(detector.check_now().await.is_err());
        assert_eq!(detector.stats().detections, 2);
    }

    #[tokio::test]
    async fn stale_heartbeat_keeps_episode_suppressed() {
        let detector = DeadlockDetector::new(fast_config(20, 20));
        let frozen = Instant::now();
        detector.report_activity("hung", AgentStatus::Processing, frozen);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(detector.check_now().await.is_err());

        // heartbeats keep arriving but the handler never finishes
        detector.report_activity("hung", AgentStatus::Processing, frozen);
        assert!(detector.check_now().await.is_ok());
        assert_eq!(detector.agent_status()["hung"].state, AgentStatus::Processing);

        detector.report_activity("hung", AgentStatus::Idle, Instant::now());
        assert!(!detector.agent_status()["hung"].stuck);
    }

    #[tokio::test]
    async fn successful_callback_counts_recovery() {
        let detector = DeadlockDetector::new(fast_config(10, 10));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        detector.set_callback(Arc::new(move |report: DeadlockReport| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(report.stuck.len(), Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        }));
        detector.register("a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(detector.check_now().await.is_err());

        detector.set_callback(Arc::new(|_report: DeadlockReport| {
            async { Err::<(), _>(anyhow::anyhow!("restart failed")) }.boxed()
        }));
        detector.register("b");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(detector.check_now().await.is_err());

        let stats = detector.stats();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.detections, 2);
        assert_eq!(stats.recoveries, 1);
    }

    #[tokio::test]
    async fn disabled_detector_does_not_start() {
        let detector = DeadlockDetector::new(DeadlockConfig {
            enabled: false,
            ..DeadlockConfig::default()
        });
        assert!(!detector.start());
        detector.stop().await;
        assert!(!detector.is_running());
    }

    #[tokio::test]
    async fn unregister_drops_activity() {
        let detector = DeadlockDetector::new(fast_config(10, 10));
        detector.register("gone");
        assert!(detector.unregister("gone"));
        assert!(!detector.unregister("gone"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(detector.check_now().await.is_ok());
        assert_eq!(detector.stats().registered_agents, 0);
    }
}
