//! JPEG encoding of raw frames.
//!
//! MJPEG frames at the target size pass through untouched after a header check;
//! everything else is converted to RGB, resized when needed and re-encoded.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use super::frame::{EncodedFrame, PixelFormat, RawFrame};
use super::CaptureError;

/// Encodes raw frames to JPEG at a fixed size and quality
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    width: u32,
    height: u32,
    quality: u8,
}

impl FrameEncoder {
    /// A zero width or height keeps whatever size the source delivers.
    pub fn new(width: u32, height: u32, quality: u8) -> Self {
        Self {
            width,
            height,
            quality,
        }
    }

    pub fn encode(&self, raw: RawFrame) -> Result<EncodedFrame, CaptureError> {
        let (jpeg, width, height) = match raw.format {
            PixelFormat::Mjpeg => self.encode_mjpeg(&raw)?,
            PixelFormat::Rgb24 => {
                let image = rgb_image(raw.width, raw.height, raw.data.to_vec())?;
                self.encode_rgb(image)?
            }
            PixelFormat::Bgr24 => {
                let mut pixels = raw.data.to_vec();
                for px in pixels.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                self.encode_rgb(rgb_image(raw.width, raw.height, pixels)?)?
            }
            PixelFormat::Yuyv4 => {
                let pixels = yuyv_to_rgb(&raw.data, raw.width, raw.height)?;
                self.encode_rgb(rgb_image(raw.width, raw.height, pixels)?)?
            }
        };

        Ok(EncodedFrame {
            jpeg,
            width,
            height,
            captured_at: raw.captured_at,
            device_timestamp: raw.device_timestamp,
        })
    }

    fn encode_mjpeg(&self, raw: &RawFrame) -> Result<(Bytes, u32, u32), CaptureError> {
        let mut decoder = Decoder::new(&raw.data[..]);
        decoder
            .read_info()
            .map_err(|e| CaptureError::Transient(format!("corrupt MJPEG frame: {e}")))?;
        let info = decoder
            .info()
            .ok_or_else(|| CaptureError::Transient("MJPEG frame without header".into()))?;
        let (width, height) = (u32::from(info.width), u32::from(info.height));

        if !self.needs_resize(width, height) {
            return Ok((raw.data.clone(), width, height));
        }

        let pixels = decoder
            .decode()
            .map_err(|e| CaptureError::Transient(format!("corrupt MJPEG frame: {e}")))?;
        let rgb = match info.pixel_format {
            JpegPixelFormat::RGB24 => pixels,
            JpegPixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
            other => {
                return Err(CaptureError::Transient(format!(
                    "unsupported MJPEG pixel format {other:?}"
                )))
            }
        };
        self.encode_rgb(rgb_image(width, height, rgb)?)
    }

    fn encode_rgb(&self, image: RgbImage) -> Result<(Bytes, u32, u32), CaptureError> {
        let image = if self.needs_resize(image.width(), image.height()) {
            imageops::resize(&image, self.width, self.height, FilterType::Triangle)
        } else {
            image
        };

        let mut buf = Vec::with_capacity((image.width() * image.height() / 4) as usize);
        JpegEncoder::new_with_quality(&mut buf, self.quality)
            .encode_image(&image)
            .map_err(|e| CaptureError::Transient(format!("jpeg encode failed: {e}")))?;

        Ok((Bytes::from(buf), image.width(), image.height()))
    }

    fn needs_resize(&self, width: u32, height: u32) -> bool {
        self.width != 0 && self.height != 0 && (width != self.width || height != self.height)
    }
}

fn rgb_image(width: u32, height: u32, pixels: Vec<u8>) -> Result<RgbImage, CaptureError> {
    let len = pixels.len();
    RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
        CaptureError::Transient(format!(
            "short frame: {len} bytes for {width}x{height} RGB"
        ))
    })
}

/// YUYV 4:2:2 to packed RGB (BT.601, limited range)
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    let Some(pixels) = (width as usize).checked_mul(height as usize) else {
        return Err(CaptureError::Transient(format!(
            "frame size {width}x{height} out of range"
        )));
    };
    let (Some(expected), Some(rgb_len)) = (pixels.checked_mul(2), pixels.checked_mul(3)) else {
        return Err(CaptureError::Transient(format!(
            "frame size {width}x{height} out of range"
        )));
    };
    if data.len() < expected {
        return Err(CaptureError::Transient(format!(
            "short frame: {} bytes for {width}x{height} YUYV",
            data.len()
        )));
    }

    let mut rgb = Vec::with_capacity(rgb_len);
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (i32::from(y) - 16).max(0) * 298;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}
