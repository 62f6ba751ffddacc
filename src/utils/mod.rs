//! Shared building blocks: observable signals and timing statistics

pub mod perf;
pub mod signal;

pub use perf::{shared_stats, SharedStats, Stopwatch, TimingTracker, TurnStats};
pub use signal::{FlagGuard, Signal};
