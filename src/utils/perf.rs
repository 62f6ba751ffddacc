//! Turn timing statistics
//!
//! Tracks how long each stage of a conversational turn takes over a
//! sliding window. The tracker is constructed explicitly and handed to the
//! orchestrator, so tests can observe it and several conversations never
//! share one by accident.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Default number of samples kept per stage
pub const DEFAULT_STATS_WINDOW: usize = 10;

/// Tracks timing metrics over a sliding window
#[derive(Debug, Clone)]
pub struct TimingTracker {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl TimingTracker {
    /// Create a new timing tracker with the specified window size
    pub fn new(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a new timing sample, evicting the oldest when the window is full
    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    /// Average duration, zero when empty
    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    /// Average in whole milliseconds, rounded to nearest
    pub fn average_ms(&self) -> u64 {
        (self.average().as_secs_f64() * 1000.0).round() as u64
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Per-stage timings for the speech-to-text, generation and synthesis stages
#[derive(Debug, Clone)]
pub struct TurnStats {
    stt: TimingTracker,
    llm: TimingTracker,
    tts: TimingTracker,
}

impl TurnStats {
    pub fn new(window: usize) -> Self {
        Self {
            stt: TimingTracker::new(window),
            llm: TimingTracker::new(window),
            tts: TimingTracker::new(window),
        }
    }

    /// Time from capture start to a finalized transcript
    pub fn record_stt(&mut self, duration: Duration) {
        self.stt.record(duration);
    }

    /// Time spent generating a reply
    pub fn record_llm(&mut self, duration: Duration) {
        self.llm.record(duration);
    }

    /// Time spent waiting for queued speech to drain after generation
    pub fn record_tts(&mut self, duration: Duration) {
        self.tts.record(duration);
    }

    pub fn avg_stt_ms(&self) -> u64 {
        self.stt.average_ms()
    }

    pub fn avg_llm_ms(&self) -> u64 {
        self.llm.average_ms()
    }

    pub fn avg_tts_ms(&self) -> u64 {
        self.tts.average_ms()
    }

    /// Number of completed turns in the generation window
    pub fn turn_count(&self) -> usize {
        self.llm.count()
    }

    pub fn reset(&mut self) {
        self.stt.clear();
        self.llm.clear();
        self.tts.clear();
    }

    /// One-line summary for logs and status bars
    pub fn summary(&self) -> String {
        format!(
            "STT: {}ms | LLM: {}ms | TTS: {}ms",
            self.avg_stt_ms(),
            self.avg_llm_ms(),
            self.avg_tts_ms()
        )
    }
}

impl Default for TurnStats {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_WINDOW)
    }
}

/// Stats shared between the orchestrator and whoever displays them
pub type SharedStats = Arc<Mutex<TurnStats>>;

/// Create a shared stats tracker with the given window
pub fn shared_stats(window: usize) -> SharedStats {
    Arc::new(Mutex::new(TurnStats::new(window)))
}

/// A simple stopwatch for measuring elapsed time
///
/// Uses `tokio::time::Instant` so paused test clocks apply.
#[derive(Debug)]
pub struct Stopwatch {
    start: tokio::time::Instant,
    splits: Vec<(&'static str, Duration)>,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            start: tokio::time::Instant::now(),
            splits: Vec::new(),
        }
    }

    /// Record a split and return the time since the previous split
    pub fn split(&mut self, label: &'static str) -> Duration {
        let elapsed = self.start.elapsed();
        let previous = self.splits.last().map(|(_, d)| *d).unwrap_or(Duration::ZERO);
        self.splits.push((label, elapsed));
        elapsed.saturating_sub(previous)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Each split's label with its time since start
    pub fn splits(&self) -> &[(&'static str, Duration)] {
        &self.splits
    }
}
