pub mod log;
pub mod metrics;
pub mod session;
pub mod traits;

pub use self::log::LogSink;
pub use metrics::SessionMetrics;
pub use session::{load_records, EventRecord, SessionLogMode, SessionLogger};
pub use traits::{EventSink, NoopSink, StuckAgent, SwarmEvent, ToolStatus};

use crate::config::ObservabilityConfig;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

/// Factory: create the right sink from config.
///
/// Relative session log paths resolve against `base_dir`.
pub fn create_sink(config: &ObservabilityConfig, base_dir: &Path) -> Arc<dyn EventSink> {
    match config.backend.trim().to_ascii_lowercase().as_str() {
        "log" => Arc::new(LogSink::new()),
        "session" => Arc::new(SessionLogger::from_config(config, base_dir)),
        "none" | "noop" | "" => Arc::new(NoopSink),
        other => {
            tracing::warn!("Unknown observability backend '{other}', falling back to noop");
            Arc::new(NoopSink)
        }
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` wins over
/// `log_level`. Returns `false` if a subscriber was already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> bool {
    let level = match config.log_level.trim() {
        "" => "info",
        level => level,
    };
    let subscriber = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
