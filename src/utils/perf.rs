//! Turn latency tracking
//!
//! Measures how long the generation engine takes to produce its first block
//! and how long a whole turn (generation plus playback) lasts.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of turns kept in the sliding window
pub const DEFAULT_WINDOW: usize = 50;

/// Tracks timing metrics over a sliding window
#[derive(Debug, Clone)]
pub struct TimingTracker {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl TimingTracker {
    /// Create a new timing tracker with the specified window size
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    /// Record a new timing sample
    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.samples.iter().max().copied().unwrap_or(Duration::ZERO)
    }

    /// Get the 95th percentile duration
    pub fn percentile_95(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted.get(idx.min(sorted.len() - 1)).copied().unwrap_or(Duration::ZERO)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

/// A simple stopwatch for measuring elapsed time
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    /// Start a new stopwatch
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Per-turn latency window kept by the turn processor
#[derive(Debug, Clone)]
pub struct TurnLatency {
    first_block: TimingTracker,
    total: TimingTracker,
}

impl Default for TurnLatency {
    fn default() -> Self {
        Self {
            first_block: TimingTracker::new(DEFAULT_WINDOW),
            total: TimingTracker::new(DEFAULT_WINDOW),
        }
    }
}

impl TurnLatency {
    /// Time from turn start until the engine produced its first block
    pub fn record_first_block(&mut self, duration: Duration) {
        self.first_block.record(duration);
    }

    /// Time from turn start until the turn completed
    pub fn record_total(&mut self, duration: Duration) {
        self.total.record(duration);
    }

    pub fn snapshot(&self) -> LatencyStats {
        LatencyStats {
            samples: self.total.count(),
            first_block_avg_ms: self.first_block.average().as_millis() as u64,
            first_block_p95_ms: self.first_block.percentile_95().as_millis() as u64,
            turn_avg_ms: self.total.average().as_millis() as u64,
            turn_max_ms: self.total.max().as_millis() as u64,
        }
    }
}

/// Serializable latency summary
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub first_block_avg_ms: u64,
    pub first_block_p95_ms: u64,
    pub turn_avg_ms: u64,
    pub turn_max_ms: u64,
}

impl LatencyStats {
    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "turns: {} | first block: {}ms avg, {}ms p95 | turn: {}ms avg, {}ms max",
            self.samples,
            self.first_block_avg_ms,
            self.first_block_p95_ms,
            self.turn_avg_ms,
            self.turn_max_ms
        )
    }
}
