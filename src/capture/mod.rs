//! Frame acquisition
//!
//! A worker is configured with an ordered list of [`CaptureStrategy`]s,
//! preferred first. [`select_source`] opens them in turn and keeps the first
//! one that both opens and delivers a frame during warm-up; some backends
//! report "opened" long before frames are actually available.
//!
//! ```text
//!   strategies: [hw pipeline] -> [mjpeg input] -> [test pattern]
//!                     |
//!                  open()? --no--> next
//!                     |
//!            warm-up read x N? --none ok--> next
//!                     |
//!                  selected
//! ```
//!
//! Steady-state reads go through [`SharedCapture`], which serializes device
//! access across stream clients and owns the retry budget.

pub mod jpeg;
pub mod mjpeg_input;
pub mod pattern;
pub mod shared;

use image::RgbImage;

use crate::error::CaptureError;

pub use mjpeg_input::MjpegInput;
pub use pattern::TestPattern;
pub use shared::{CaptureConfig, ReadOutcome, SharedCapture};

/// A captured RGB frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel data
    pub image: RgbImage,
    /// Capture order across the whole worker, starting at 1
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self { image, sequence }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// An opened capture device
///
/// `read` blocks until the next frame is available or the device fails.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<RgbImage, CaptureError>;
}

/// One way of opening a capture device
pub trait CaptureStrategy: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Open the device
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// A source chosen by [`select_source`]
pub struct SelectedSource {
    pub source: Box<dyn FrameSource>,
    pub strategy: String,
}

impl std::fmt::Debug for SelectedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedSource")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Pick the first strategy that opens and survives warm-up
///
/// At least one of `warmup_reads` reads must succeed. Exhausting the list is
/// reported as [`CaptureError::NoUsableSource`].
pub fn select_source(
    strategies: &[Box<dyn CaptureStrategy>],
    warmup_reads: u32,
) -> Result<SelectedSource, CaptureError> {
    let mut tried = Vec::with_capacity(strategies.len());

    for strategy in strategies {
        let name = strategy.name().to_string();
        tracing::info!(strategy = %name, "Trying capture strategy");

        let mut source = match strategy.open() {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(strategy = %name, error = %e, "Capture strategy failed to open");
                tried.push(name);
                continue;
            }
        };

        let warmed_up = (0..warmup_reads.max(1)).any(|attempt| match source.read() {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(strategy = %name, attempt, error = %e, "Warm-up read failed");
                false
            }
        });

        if warmed_up {
            tracing::info!(strategy = %name, "Capture strategy selected");
            return Ok(SelectedSource {
                source,
                strategy: name,
            });
        }

        tracing::warn!(
            strategy = %name,
            error = %CaptureError::WarmupFailed {
                strategy: name.clone(),
                attempts: warmup_reads,
            },
            "Capture strategy opened but delivered no frames"
        );
        tried.push(name);
    }

    Err(CaptureError::NoUsableSource { tried })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted sources for capture tests

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Source whose reads succeed or fail according to a closure
    pub struct ScriptedSource {
        pub reads: Arc<AtomicUsize>,
        pub ok: Box<dyn Fn(usize) -> bool + Send>,
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<RgbImage, CaptureError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if (self.ok)(n) {
                Ok(RgbImage::new(4, 4))
            } else {
                Err(CaptureError::Read(format!("scripted failure {}", n)))
            }
        }
    }

    /// Strategy that opens [`ScriptedSource`]s
    pub struct ScriptedStrategy {
        pub name: String,
        pub opens: Arc<AtomicUsize>,
        pub reads: Arc<AtomicUsize>,
        /// Which open attempts succeed, by index
        pub open_ok: Box<dyn Fn(usize) -> bool + Send + Sync>,
        /// Which reads succeed, by global read index
        pub read_ok: Arc<dyn Fn(usize) -> bool + Send + Sync>,
    }

    impl ScriptedStrategy {
        pub fn new(
            name: &str,
            open_ok: impl Fn(usize) -> bool + Send + Sync + 'static,
            read_ok: impl Fn(usize) -> bool + Send + Sync + 'static,
        ) -> Self {
            Self {
                name: name.to_string(),
                opens: Arc::new(AtomicUsize::new(0)),
                reads: Arc::new(AtomicUsize::new(0)),
                open_ok: Box::new(open_ok),
                read_ok: Arc::new(read_ok),
            }
        }
    }

    impl CaptureStrategy for ScriptedStrategy {
        fn name(&self) -> &str {
            &self.name
        }

        fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if !(self.open_ok)(n) {
                return Err(CaptureError::Open {
                    strategy: self.name.clone(),
                    reason: "scripted".into(),
                });
            }
            let read_ok = Arc::clone(&self.read_ok);
            Ok(Box::new(ScriptedSource {
                reads: Arc::clone(&self.reads),
                ok: Box::new(move |i| read_ok(i)),
            }))
        }
    }
}
