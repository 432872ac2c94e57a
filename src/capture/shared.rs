//! Shared capture device with a retry budget
//!
//! All stream clients of a worker pull frames from one [`SharedCapture`].
//! The device is held under a mutex for the duration of a single read only;
//! encoding and writing happen outside the lock.
//!
//! Failure handling:
//!
//! ```text
//!   read ok ------------------------------> Frame, failures = 0
//!   read err, failures < budget ----------> Retry
//!   read err, failures == budget ---------> re-run strategy selection
//!        selection ok --------------------> Retry, failures = 0
//!        selection failed ----------------> Fatal (latched)
//! ```

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::CaptureError;

use super::{select_source, CaptureStrategy, Frame, FrameSource};

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Reads attempted after open before a strategy is rejected
    pub warmup_reads: u32,

    /// Consecutive read failures that trigger reinitialization
    pub max_consecutive_failures: u32,

    /// Pause before retrying a failed read
    pub retry_pause: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            warmup_reads: 3,
            max_consecutive_failures: 10,
            retry_pause: Duration::from_millis(10),
        }
    }
}

impl CaptureConfig {
    /// Set the number of warm-up reads
    pub fn warmup_reads(mut self, reads: u32) -> Self {
        self.warmup_reads = reads.max(1);
        self
    }

    /// Set the consecutive failure budget
    pub fn max_consecutive_failures(mut self, budget: u32) -> Self {
        self.max_consecutive_failures = budget.max(1);
        self
    }

    /// Set the pause between failed reads
    pub fn retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }
}

/// Result of one read through [`SharedCapture`]
#[derive(Debug)]
pub enum ReadOutcome {
    /// A fresh frame
    Frame(Frame),
    /// The read failed but the budget is not spent; try again
    Retry(CaptureError),
    /// The budget and the reinitialization are spent; the worker must stop
    Fatal(CaptureError),
}

struct CaptureState {
    source: Option<Box<dyn FrameSource>>,
    strategy: String,
    consecutive_failures: u32,
    next_sequence: u64,
    fatal: Option<CaptureError>,
}

/// Mutex-guarded capture device shared by all client handlers
pub struct SharedCapture {
    strategies: Vec<Box<dyn CaptureStrategy>>,
    config: CaptureConfig,
    state: Mutex<CaptureState>,
}

impl SharedCapture {
    /// Run strategy selection and take ownership of the winner
    ///
    /// Failure here is a fatal initialization error for the worker.
    pub fn open(
        strategies: Vec<Box<dyn CaptureStrategy>>,
        config: CaptureConfig,
    ) -> Result<Self, CaptureError> {
        let selected = select_source(&strategies, config.warmup_reads)?;

        Ok(Self {
            strategies,
            config,
            state: Mutex::new(CaptureState {
                source: Some(selected.source),
                strategy: selected.strategy,
                consecutive_failures: 0,
                next_sequence: 1,
                fatal: None,
            }),
        })
    }

    /// Get the capture configuration
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Name of the strategy currently in use
    pub fn strategy(&self) -> String {
        self.lock().strategy.clone()
    }

    /// Whether the capture has latched into its fatal state
    pub fn is_exhausted(&self) -> bool {
        self.lock().fatal.is_some()
    }

    /// The error that made the capture fatal, if any
    pub fn fatal_error(&self) -> Option<CaptureError> {
        self.lock().fatal.clone()
    }

    /// Read one frame, blocking
    ///
    /// Call from a blocking context (`spawn_blocking`); the device may block
    /// for a full frame interval.
    pub fn read(&self) -> ReadOutcome {
        let mut state = self.lock();

        if let Some(err) = &state.fatal {
            return ReadOutcome::Fatal(err.clone());
        }

        let result = match state.source.as_mut() {
            Some(source) => source.read(),
            None => Err(CaptureError::Read("no capture source".into())),
        };

        match result {
            Ok(image) => {
                state.consecutive_failures = 0;
                let sequence = state.next_sequence;
                state.next_sequence += 1;
                ReadOutcome::Frame(Frame::new(image, sequence))
            }
            Err(e) => {
                state.consecutive_failures += 1;
                let failures = state.consecutive_failures;

                if failures < self.config.max_consecutive_failures {
                    tracing::warn!(
                        failures,
                        budget = self.config.max_consecutive_failures,
                        error = %e,
                        "Frame read failed"
                    );
                    return ReadOutcome::Retry(e);
                }

                tracing::error!(
                    failures,
                    strategy = %state.strategy,
                    "Repeated read failures, reinitializing capture"
                );
                // Release the device before any strategy tries to reopen it
                state.source = None;

                match select_source(&self.strategies, self.config.warmup_reads) {
                    Ok(selected) => {
                        tracing::info!(strategy = %selected.strategy, "Capture reinitialized");
                        state.source = Some(selected.source);
                        state.strategy = selected.strategy;
                        state.consecutive_failures = 0;
                        ReadOutcome::Retry(e)
                    }
                    Err(reinit) => {
                        let fatal = CaptureError::Exhausted {
                            consecutive_failures: failures,
                        };
                        tracing::error!(
                            error = %reinit,
                            "Capture reinitialization failed, worker must shut down"
                        );
                        state.fatal = Some(fatal.clone());
                        ReadOutcome::Fatal(fatal)
                    }
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        // A panic mid-read leaves the device state as usable as any failed read
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for SharedCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCapture")
            .field("strategies", &self.strategies.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
