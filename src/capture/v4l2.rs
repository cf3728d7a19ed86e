//! Direct V4L2 capture with memory-mapped buffers

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{PixelFormat, RawFrame};
use crate::capture::{classify_io_error, CaptureError, CaptureSource};
use crate::CaptureConfig;

/// Frame intervals a dequeue may wait before it counts as a transient miss
const READ_TIMEOUT_FRAMES: u32 = 3;
const MIN_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on one blocking dequeue at `fps`
fn read_timeout(fps: u32) -> Duration {
    (Duration::from_secs(1) * READ_TIMEOUT_FRAMES / fps.max(1)).max(MIN_READ_TIMEOUT)
}

/// V4L2 device source
#[derive(Default)]
pub struct V4l2Source {
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    format: Option<PixelFormat>,
}

impl V4l2Source {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureSource for V4l2Source {
    fn name(&self) -> &str {
        "v4l2"
    }

    #[instrument(skip(self, config), fields(device = %config.device))]
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        self.close();
        let unavailable = |e: std::io::Error| CaptureError::unavailable(&config.device, e);

        let device = Device::with_path(&config.device).map_err(unavailable)?;

        // Query capabilities
        let caps = device.query_caps().map_err(unavailable)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::unavailable(
                &config.device,
                "device doesn't support video capture",
            ));
        }

        let mut fmt = device.format().map_err(unavailable)?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match config.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => {
                return Err(CaptureError::unavailable(
                    &config.device,
                    format!("pixel format {other:?} not supported by v4l2 capture"),
                ))
            }
        };
        let actual = device.set_format(&fmt).map_err(unavailable)?;
        if actual.fourcc != fmt.fourcc {
            return Err(CaptureError::unavailable(
                &config.device,
                format!("driver switched format to {}", actual.fourcc),
            ));
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            debug!("Frame rate not settable: {}", e);
        }

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
                .map_err(unavailable)?;
        // A stalled camera surfaces as TimedOut instead of blocking forever
        stream.set_timeout(read_timeout(config.fps));

        info!(
            "Capture stream started: {}x{} {} with {} buffers",
            actual.width, actual.height, actual.fourcc, config.buffer_count
        );

        self.width = actual.width;
        self.height = actual.height;
        self.format = Some(config.format);
        self.stream = Some(stream);
        self.device = Some(device);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<RawFrame, CaptureError> {
        let (stream, format) = match (self.stream.as_mut(), self.format) {
            (Some(stream), Some(format)) => (stream, format),
            _ => return Err(CaptureError::Fatal("stream not started".into())),
        };

        let (buf, meta) = stream.next().map_err(classify_io_error)?;

        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        if used == 0 {
            return Err(CaptureError::Transient("empty buffer dequeued".into()));
        }

        let mut frame = RawFrame::new(
            Bytes::copy_from_slice(&buf[..used]),
            self.width,
            self.height,
            format,
        );
        frame.device_timestamp = Some(
            Duration::from_secs(meta.timestamp.sec as u64)
                + Duration::from_micros(meta.timestamp.usec as u64),
        );
        Ok(frame)
    }

    fn close(&mut self) {
        // Stream first: it unmaps buffers on the device handle
        self.stream = None;
        if self.device.take().is_some() {
            debug!("V4L2 device released");
        }
        self.format = None;
    }
}
