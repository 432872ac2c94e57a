//! Synthetic test pattern
//!
//! Used for demo/pass-through workers and as the last-resort strategy when no
//! real device is present. Frames are paced to the configured rate so the
//! stream behaves like a camera rather than a busy loop.

use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use crate::error::CaptureError;

use super::{CaptureStrategy, FrameSource};

/// Moving vertical bar over a horizontal gradient
#[derive(Debug, Clone)]
pub struct TestPattern {
    width: u32,
    height: u32,
    fps: u32,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width: width.max(8),
            height: height.max(8),
            fps: fps.max(1),
        }
    }
}

impl Default for TestPattern {
    fn default() -> Self {
        Self::new(640, 480, 30)
    }
}

impl CaptureStrategy for TestPattern {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        Ok(Box::new(TestPatternSource {
            pattern: self.clone(),
            interval: Duration::from_secs(1) / self.fps,
            next_due: Instant::now(),
            tick: 0,
        }))
    }
}

struct TestPatternSource {
    pattern: TestPattern,
    interval: Duration,
    next_due: Instant,
    tick: u64,
}

impl FrameSource for TestPatternSource {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = self.next_due.max(now) + self.interval;

        let TestPattern { width, height, .. } = self.pattern;
        let bar_width = (width / 16).max(1);
        let bar_x = ((self.tick * 4) % u64::from(width)) as u32;
        self.tick += 1;

        let image = RgbImage::from_fn(width, height, |x, y| {
            if x >= bar_x && x < bar_x + bar_width {
                Rgb([255, 255, 255])
            } else {
                let r = (x * 255 / width) as u8;
                let g = (y * 255 / height) as u8;
                Rgb([r, g, 96])
            }
        });

        Ok(image)
    }
}
