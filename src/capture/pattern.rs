//! Synthetic source for running without a camera

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info;

use crate::capture::frame::{PixelFormat, RawFrame};
use crate::capture::{CaptureError, CaptureSource};
use crate::CaptureConfig;

/// RGB gradient with a bar sweeping across it, paced to the configured fps
#[derive(Debug, Default)]
pub struct TestPatternSource {
    width: u32,
    height: u32,
    interval: Duration,
    tick: u64,
    next_due: Option<Instant>,
    open: bool,
}

impl TestPatternSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar = (self.tick as usize * 4) % w.max(1);
        let mut pixels = Vec::with_capacity(w * h * 3);

        for y in 0..h {
            for x in 0..w {
                if x.abs_diff(bar) < 4 {
                    pixels.extend_from_slice(&[255, 255, 255]);
                } else {
                    let r = (x * 255 / w.max(1)) as u8;
                    let g = (y * 255 / h.max(1)) as u8;
                    pixels.extend_from_slice(&[r, g, 96]);
                }
            }
        }
        pixels
    }
}

impl CaptureSource for TestPatternSource {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        self.width = config.width;
        self.height = config.height;
        self.interval = Duration::from_secs(1) / config.fps.max(1);
        self.next_due = None;
        self.open = true;
        info!(
            "Test pattern {}x{} @ {} fps",
            config.width, config.height, config.fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<RawFrame, CaptureError> {
        if !self.open {
            return Err(CaptureError::Fatal("test pattern not open".into()));
        }

        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.interval);

        let pixels = self.render();
        self.tick += 1;

        Ok(RawFrame::new(
            Bytes::from(pixels),
            self.width,
            self.height,
            PixelFormat::Rgb24,
        ))
    }

    fn close(&mut self) {
        self.open = false;
    }
}
