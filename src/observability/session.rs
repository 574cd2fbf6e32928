use super::metrics::{MetricsAggregator, SessionMetrics};
use super::traits::{EventSink, SwarmEvent};
use crate::config::ObservabilityConfig;
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Session log storage policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLogMode {
    None,
    Rolling,
    Full,
}

impl SessionLogMode {
    fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rolling" => Self::Rolling,
            "full" => Self::Full,
            _ => Self::None,
        }
    }
}

/// Resolve session log storage mode from config.
pub fn storage_mode_from_config(config: &ObservabilityConfig) -> SessionLogMode {
    let mode = SessionLogMode::from_raw(&config.session_log_mode);
    if mode == SessionLogMode::None
        && !config.session_log_mode.trim().is_empty()
        && !config.session_log_mode.eq_ignore_ascii_case("none")
    {
        tracing::warn!(
            mode = %config.session_log_mode,
            "Unknown observability.session_log_mode; falling back to none"
        );
    }
    mode
}

/// Resolve the session log path; relative paths are joined onto `base_dir`.
pub fn resolve_log_path(config: &ObservabilityConfig, base_dir: &Path) -> PathBuf {
    let raw = config.session_log_path.trim();
    if raw.is_empty() {
        return base_dir.join("state/session-log.jsonl");
    }

    let configured = PathBuf::from(raw);
    if configured.is_absolute() {
        configured
    } else {
        base_dir.join(configured)
    }
}

/// One appended session log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence: u64,
    pub session_id: String,
    /// Wall-clock time (RFC 3339).
    pub timestamp: String,
    /// Monotonic milliseconds since the session started.
    pub elapsed_ms: f64,
    pub agent: String,
    #[serde(flatten)]
    pub event: SwarmEvent,
}

/// Log file owned by the writer thread. The handle stays open between
/// records. Rolling mode keeps the newest lines in memory and rewrites the
/// file from them once it holds twice `max_entries` lines.
struct LogFile {
    mode: SessionLogMode,
    max_entries: usize,
    path: PathBuf,
    handle: Option<File>,
    tail: VecDeque<String>,
    lines_on_disk: usize,
}

impl LogFile {
    fn new(mode: SessionLogMode, path: PathBuf, max_entries: usize) -> Self {
        Self {
            mode,
            max_entries: max_entries.max(1),
            path,
            handle: None,
            tail: VecDeque::new(),
            lines_on_disk: 0,
        }
    }

    fn options() -> OpenOptions {
        let mut options = OpenOptions::new();
        options.create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options
    }

    fn open(&mut self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.mode == SessionLogMode::Rolling && self.tail.is_empty() {
            let existing = fs::read_to_string(&self.path).unwrap_or_default();
            let lines: Vec<&str> = existing
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect();
            self.lines_on_disk = lines.len();
            self.tail = lines[lines.len().saturating_sub(self.max_entries)..]
                .iter()
                .map(|line| (*line).to_string())
                .collect();
        }
        Ok(Self::options().append(true).open(&self.path)?)
    }

    fn append(&mut self, record: &EventRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        // A failed write drops the handle; the next record reopens the file.
        let mut file = match self.handle.take() {
            Some(file) => file,
            None => self.open()?,
        };
        writeln!(file, "{line}")?;
        file.sync_data()?;
        self.handle = Some(file);

        if self.mode == SessionLogMode::Rolling {
            if self.tail.len() == self.max_entries {
                self.tail.pop_front();
            }
            self.tail.push_back(line);
            self.lines_on_disk += 1;
            if self.lines_on_disk >= self.max_entries * 2 {
                self.compact()?;
            }
        }
        Ok(())
    }

    /// Rewrite the file with only the in-memory tail.
    fn compact(&mut self) -> Result<()> {
        self.handle = None;
        let tmp = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        let mut out = Self::options().write(true).truncate(true).open(&tmp)?;
        for line in &self.tail {
            writeln!(out, "{line}")?;
        }
        out.sync_data()?;
        fs::rename(tmp, &self.path)?;
        self.lines_on_disk = self.tail.len();
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.mode == SessionLogMode::Rolling && self.lines_on_disk > self.tail.len() {
            self.compact()?;
        }
        Ok(())
    }
}

/// Background thread that owns the log file so `record` never does I/O.
struct LogWriter {
    tx: Mutex<Option<mpsc::UnboundedSender<EventRecord>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogWriter {
    fn spawn(mut file: LogFile) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventRecord>();
        let handle = std::thread::Builder::new()
            .name("swarm-session-log".into())
            .spawn(move || {
                while let Some(record) = rx.blocking_recv() {
                    if let Err(err) = file.append(&record) {
                        tracing::warn!(path = %file.path.display(), "Failed to write session log record: {err}");
                    }
                }
                if let Err(err) = file.finish() {
                    tracing::warn!(path = %file.path.display(), "Failed to compact session log: {err}");
                }
            });

        match handle {
            Ok(handle) => Self {
                tx: Mutex::new(Some(tx)),
                handle: Mutex::new(Some(handle)),
            },
            Err(err) => {
                tracing::warn!("Failed to start session log writer; persistence disabled: {err}");
                Self {
                    tx: Mutex::new(None),
                    handle: Mutex::new(None),
                }
            }
        }
    }

    fn enqueue(&self, record: EventRecord) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // Receiver only goes away after close(); nothing left to persist then.
            let _ = tx.send(record);
        }
    }

    /// Stop accepting records and wait until queued ones are on disk.
    fn close(&self) {
        drop(self.tx.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("Session log writer thread panicked");
            }
        }
    }
}

struct SessionState {
    records: VecDeque<EventRecord>,
    max_records: usize,
    next_sequence: u64,
    aggregator: MetricsAggregator,
    finalized: bool,
}

/// Session log sink: bounded in-memory record log, aggregated metrics and
/// optional JSONL persistence.
pub struct SessionLogger {
    session_id: String,
    started: Instant,
    state: Mutex<SessionState>,
    writer: Option<LogWriter>,
}

impl SessionLogger {
    /// In-memory session log without persistence.
    pub fn in_memory(max_records: usize) -> Self {
        Self::build(max_records, None)
    }

    /// Session log persisting to `path` with the given mode.
    pub fn persistent(mode: SessionLogMode, path: PathBuf, max_entries: usize, max_records: usize) -> Self {
        let writer = (mode != SessionLogMode::None).then(|| {
            LogWriter::spawn(LogFile::new(mode, path, max_entries))
        });
        Self::build(max_records, writer)
    }

    pub fn from_config(config: &ObservabilityConfig, base_dir: &Path) -> Self {
        Self::persistent(
            storage_mode_from_config(config),
            resolve_log_path(config, base_dir),
            config.session_log_max_entries,
            config.memory_max_records,
        )
    }

    fn build(max_records: usize, writer: Option<LogWriter>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            state: Mutex::new(SessionState {
                records: VecDeque::new(),
                max_records: max_records.max(1),
                next_sequence: 0,
                aggregator: MetricsAggregator::new(),
                finalized: false,
            }),
            writer,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.state.lock().aggregator.snapshot()
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> Vec<EventRecord> {
        self.state.lock().records.iter().cloned().collect()
    }

    /// Retained records for one agent and event name.
    pub fn records_for(&self, agent: &str, event_name: &str) -> Vec<EventRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|record| record.agent == agent && record.event.name() == event_name)
            .cloned()
            .collect()
    }

    /// Stop persisting and wait until queued records are written.
    pub fn close(&self) {
        if let Some(writer) = &self.writer {
            writer.close();
        }
    }

    /// Record the final metrics snapshot and wait for persistence to drain.
    /// Later events are still aggregated in memory but no longer written.
    pub fn finalize_session(&self) -> SessionMetrics {
        let metrics = {
            let mut state = self.state.lock();
            if state.finalized {
                return state.aggregator.snapshot();
            }
            state.finalized = true;
            state.aggregator.snapshot()
        };

        self.record(
            "session",
            SwarmEvent::MetricsSnapshot {
                metrics: Box::new(metrics.clone()),
            },
        );
        self.close();

        tracing::info!(
            session_id = %self.session_id,
            total_messages = metrics.total_messages,
            total_handoffs = metrics.total_handoffs,
            errors = metrics.total_errors(),
            "Session finalized"
        );
        metrics
    }
}

impl EventSink for SessionLogger {
    fn record(&self, agent: &str, event: SwarmEvent) {
        let record = {
            let mut state = self.state.lock();
            state.aggregator.apply(agent, &event);
            state.next_sequence += 1;

            let record = EventRecord {
                sequence: state.next_sequence,
                session_id: self.session_id.clone(),
                timestamp: Utc::now().to_rfc3339(),
                elapsed_ms: self.started.elapsed().as_secs_f64() * 1000.0,
                agent: agent.to_string(),
                event,
            };
            if state.records.len() >= state.max_records {
                state.records.pop_front();
            }
            state.records.push_back(record.clone());
            record
        };

        if let Some(writer) = &self.writer {
            writer.enqueue(record);
        }
    }

    fn name(&self) -> &str {
        "session"
    }

    fn finalize(&self) {
        self.finalize_session();
    }
}

impl Drop for SessionLogger {
    fn drop(&mut self) {
        self.close();
    }
}

/// Load recent session records from a JSONL file, newest first.
pub fn load_records(path: &Path, limit: usize, event_filter: Option<&str>) -> Result<Vec<EventRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(trimmed) {
            Ok(record) => records.push(record),
            Err(err) => tracing::warn!("Skipping malformed session log line: {err}"),
        }
    }

    if let Some(filter) = event_filter.map(str::trim).filter(|f| !f.is_empty()) {
        let normalized = filter.to_ascii_lowercase();
        records.retain(|record| record.event.name() == normalized);
    }

    if records.len() > limit {
        let keep_from = records.len() - limit;
        records = records.split_off(keep_from);
    }

    records.reverse();
    Ok(records)
}
