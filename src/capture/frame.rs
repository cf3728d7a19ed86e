use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Frame exactly as a capture source produced it
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// Wall-clock time the source handed the frame over
    pub captured_at: SystemTime,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

impl RawFrame {
    pub fn new(data: Bytes, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
            captured_at: SystemTime::now(),
            device_timestamp: None,
        }
    }
}

/// JPEG-encoded frame waiting to be published
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
    pub captured_at: SystemTime,
    pub device_timestamp: Option<Duration>,
}

/// Published frame. Immutable once it leaves the capture loop; consumers share
/// it through an `Arc` and never see the writer's buffers.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded JPEG bytes - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Capture timestamp
    pub captured_at: SystemTime,
}

impl Frame {
    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub device_timestamp: Option<Duration>,
}

/// Pixel formats sources may hand us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
}
