use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;

/// Capture device picked by [`auto_detect_device`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// First `/dev/videoN` that can capture, preferring native MJPEG over YUYV
pub fn auto_detect_device() -> Option<FoundDevice> {
    info!("Auto-detecting capture devices...");
    let mut fallback = None;

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("{} cannot capture, skipping", path);
            continue;
        }

        let formats = dev.enum_formats().unwrap_or_default();
        if formats.iter().any(|f| f.fourcc == FourCC::new(b"MJPG")) {
            info!("Found MJPEG device: {} - {}", path, caps.card);
            return Some(FoundDevice {
                path,
                format: PixelFormat::Mjpeg,
            });
        }
        if fallback.is_none() && formats.iter().any(|f| f.fourcc == FourCC::new(b"YUYV")) {
            info!("Found YUYV device: {} - {}", path, caps.card);
            fallback = Some(FoundDevice {
                path,
                format: PixelFormat::Yuyv4,
            });
        }
    }

    fallback
}
