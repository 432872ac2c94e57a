//! Streaming statistics
//!
//! [`FpsCounter`] backs the periodic throughput log of a stream server;
//! [`RelayStats`] counts what a relay forwarded, dropped, and evicted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Default reporting window
pub const DEFAULT_FPS_WINDOW: Duration = Duration::from_secs(5);

/// Throughput over one closed window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsSample {
    /// Frames per second across all clients
    pub fps: f64,
    /// Detections per second across all clients
    pub detections_per_sec: f64,
    /// Actual length of the window
    pub window: Duration,
}

#[derive(Debug)]
struct FpsWindow {
    started_at: Instant,
    frames: u64,
    detections: u64,
}

/// Rolling frame counter shared by all client handlers of one server
///
/// Counting is not rate limiting: it only observes how fast frames leave.
#[derive(Debug)]
pub struct FpsCounter {
    window: Duration,
    state: Mutex<FpsWindow>,
}

impl FpsCounter {
    /// Create a counter that reports every `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(FpsWindow {
                started_at: Instant::now(),
                frames: 0,
                detections: 0,
            }),
        }
    }

    /// Record one delivered frame
    ///
    /// Returns a sample when this frame closes the current window.
    pub fn record(&self, detections: usize) -> Option<FpsSample> {
        self.record_at(Instant::now(), detections)
    }

    fn record_at(&self, now: Instant, detections: usize) -> Option<FpsSample> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        state.frames += 1;
        state.detections += detections as u64;

        let elapsed = now.saturating_duration_since(state.started_at);
        if elapsed < self.window {
            return None;
        }

        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let sample = FpsSample {
            fps: state.frames as f64 / secs,
            detections_per_sec: state.detections as f64 / secs,
            window: elapsed,
        };

        state.started_at = now;
        state.frames = 0;
        state.detections = 0;

        Some(sample)
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(DEFAULT_FPS_WINDOW)
    }
}

/// Per-camera relay counters
#[derive(Debug, Default)]
pub struct RelayStats {
    chunks_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
    evictions: AtomicU64,
    connect_attempts: AtomicU64,
    disconnects: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_chunk(&self, wire_len: usize) {
        self.chunks_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded
            .fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_dropped(&self, count: usize) {
        self.frames_dropped
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_evicted(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            chunks_forwarded: self.chunks_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    /// Complete chunks taken from the upstream
    pub chunks_forwarded: u64,
    /// Wire bytes of those chunks
    pub bytes_forwarded: u64,
    /// Stale chunks discarded from full consumer queues
    pub frames_dropped: u64,
    /// Consumers removed after their stream went away
    pub evictions: u64,
    /// Upstream connect attempts, successful or not
    pub connect_attempts: u64,
    /// Transitions out of streaming
    pub disconnects: u64,
}
