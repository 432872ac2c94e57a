//! Statistics and metrics

pub mod metrics;

pub use metrics::{FpsCounter, FpsSample, RelayStats, RelayStatsSnapshot, DEFAULT_FPS_WINDOW};
