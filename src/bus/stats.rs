use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Latency summary for one message type, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Deliveries observed since start, including samples no longer retained.
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// Bounded rolling window of latency samples.
///
/// `avg_ms`, `min_ms` and `max_ms` are computed over the retained samples;
/// `count` keeps growing after the window starts dropping old samples.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    max_samples: usize,
    total_count: u64,
    sum_ms: f64,
}

impl LatencyWindow {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.max(1),
            total_count: 0,
            sum_ms: 0.0,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        self.record_ms(latency.as_secs_f64() * 1000.0);
    }

    pub fn record_ms(&mut self, latency_ms: f64) {
        if self.samples.len() >= self.max_samples {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum_ms -= evicted;
            }
        }
        self.samples.push_back(latency_ms);
        self.sum_ms += latency_ms;
        self.total_count += 1;
    }

    pub fn count(&self) -> u64 {
        self.total_count
    }

    pub fn retained(&self) -> usize {
        self.samples.len()
    }

    pub fn summary(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary {
                count: self.total_count,
                ..LatencySummary::default()
            };
        }

        let (min_ms, max_ms) = self
            .samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), sample| {
                (lo.min(*sample), hi.max(*sample))
            });

        LatencySummary {
            count: self.total_count,
            avg_ms: self.sum_ms / self.samples.len() as f64,
            min_ms,
            max_ms,
        }
    }
}

/// Point-in-time counters returned by [`MessageBus::stats`](super::MessageBus::stats).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStats {
    /// Successful `send` calls, counting each broadcast copy once.
    pub total_messages: u64,
    /// Messages handed to a receiver or a pending request slot.
    pub total_delivered: u64,
    /// Messages evicted by the drop-oldest overflow policy.
    pub overflow_evictions: u64,
    /// Messages discarded by `clear`, `unregister` or `shutdown`.
    pub discarded: u64,
    pub inbox_sizes: BTreeMap<String, usize>,
    pub inbox_high_water: BTreeMap<String, usize>,
    pub latency_by_type: BTreeMap<String, LatencySummary>,
    pub pending_requests: usize,
    pub history_size: usize,
    pub closed: bool,
}
