pub mod bridge;
pub mod hooks;
pub mod perf;

pub use bridge::{BridgeConfig, FragmentBridge, FragmentSubmitter, OverflowPolicy};
pub use hooks::{guard_hook, guard_sync_hook};
pub use perf::{LatencyStats, Stopwatch, TimingTracker, TurnLatency};
