//! Capture sources: the hardware or pipeline backends that produce raw frames.

pub mod backend;
pub mod encode;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod pattern;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::io;

use thiserror::Error;

use crate::CaptureConfig;

pub use backend::{build_source, FallbackSource};
pub use encode::FrameEncoder;
pub use frame::{EncodedFrame, Frame, FrameMetadata, PixelFormat, RawFrame};
#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstSource;
pub use pattern::TestPatternSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;

/// Errors a capture source can report
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// The device or pipeline could not be opened
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    /// A single read failed; the handle is still usable
    #[error("transient capture failure: {0}")]
    Transient(String),

    /// The handle is dead and must be closed and reopened
    #[error("fatal capture failure: {0}")]
    Fatal(String),
}

impl CaptureError {
    pub fn unavailable(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::DeviceUnavailable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}

/// errnos after which a device handle is beyond saving
const FATAL_ERRNOS: [i32; 5] = [
    libc::ENODEV,
    libc::ENXIO,
    libc::ENOENT,
    libc::EBADF,
    libc::ESHUTDOWN,
];

/// Classify an I/O error from a device read
pub fn classify_io_error(err: io::Error) -> CaptureError {
    let fatal = match err.raw_os_error() {
        Some(errno) => FATAL_ERRNOS.contains(&errno),
        None => matches!(
            err.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
        ),
    };

    if fatal {
        CaptureError::Fatal(err.to_string())
    } else {
        CaptureError::Transient(err.to_string())
    }
}

/// A backend producing raw frames.
///
/// Calls are blocking; the capture loop drives a source from its own thread.
/// `next_frame` should return within roughly one frame interval so shutdown
/// is noticed promptly.
pub trait CaptureSource: Send {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Acquire the device. Calling `open` on an open source reopens it.
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;

    /// Block until the next frame is available
    fn next_frame(&mut self) -> Result<RawFrame, CaptureError>;

    /// Release the device. Safe to call when already closed.
    fn close(&mut self);
}

impl<S: CaptureSource + ?Sized> CaptureSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        (**self).open(config)
    }

    fn next_frame(&mut self) -> Result<RawFrame, CaptureError> {
        (**self).next_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
