//! GStreamer-based capture for sources V4L2 can't hand us directly
//! (non-native codecs, network cameras, hardware decoders).

use std::time::SystemTime;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{PixelFormat, RawFrame};
use crate::capture::{CaptureError, CaptureSource};
use crate::CaptureConfig;

/// How long a single pull may block before it counts as a transient miss
const PULL_TIMEOUT_MS: u64 = 1000;

/// GStreamer pipeline ending in an appsink named `appsink`
#[derive(Default)]
pub struct GstSource {
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
}

impl GstSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline used when no custom description is configured: the camera's
    /// own MJPEG, handed through without decoding.
    pub fn default_pipeline(config: &CaptureConfig) -> String {
        format!(
            "v4l2src device={} ! \
             image/jpeg,width={},height={},framerate={}/1 ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
             appsink name=appsink",
            config.device, config.width, config.height, config.fps
        )
    }

    fn start(&mut self, pipeline_str: &str, device: &str) -> Result<(), CaptureError> {
        gst::init().map_err(|e| CaptureError::unavailable(device, e))?;

        let pipeline = gst::parse::launch(pipeline_str)
            .map_err(|e| CaptureError::unavailable(device, e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureError::unavailable(device, "description is not a pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| CaptureError::unavailable(device, "no element named appsink"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CaptureError::unavailable(device, "appsink is not an AppSink"))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 3u32);
        appsink.set_property("drop", true); // Drop old buffers if we can't keep up
        appsink.set_property("sync", false); // Don't sync to clock for lowest latency

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(CaptureError::unavailable(
                device,
                format!("failed to start pipeline: {e:?}"),
            ));
        }

        let (state_change, _, _) = pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        if state_change.is_err() {
            let reason = bus_error(&pipeline).unwrap_or_else(|| "pipeline refused to play".into());
            let _ = pipeline.set_state(gst::State::Null);
            return Err(CaptureError::unavailable(device, reason));
        }

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }
}

impl CaptureSource for GstSource {
    fn name(&self) -> &str {
        "gstreamer"
    }

    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        self.close();

        let pipeline_str = config
            .pipeline
            .clone()
            .unwrap_or_else(|| Self::default_pipeline(config));
        info!("Pipeline: {}", pipeline_str);

        self.start(&pipeline_str, &config.device)
    }

    fn next_frame(&mut self) -> Result<RawFrame, CaptureError> {
        let (pipeline, appsink) = match (&self.pipeline, &self.appsink) {
            (Some(pipeline), Some(appsink)) => (pipeline, appsink),
            _ => return Err(CaptureError::Fatal("pipeline not started".into())),
        };

        if let Some(reason) = bus_error(pipeline) {
            return Err(CaptureError::Fatal(reason));
        }

        let Some(sample) = appsink.try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
        else {
            if appsink.is_eos() {
                return Err(CaptureError::Fatal("pipeline reached end of stream".into()));
            }
            return Err(CaptureError::Transient("no sample within pull timeout".into()));
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::Transient("sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::Transient("failed to map buffer".into()))?;

        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::Fatal("sample has no caps".into()))?;
        let (format, width, height) = sample_format(caps)?;

        Ok(RawFrame {
            data: Bytes::copy_from_slice(map.as_slice()),
            width,
            height,
            format,
            captured_at: SystemTime::now(),
            device_timestamp: buffer.pts().map(|pts| pts.into()),
        })
    }

    fn close(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!("Failed to stop pipeline: {:?}", e);
            } else {
                debug!("GStreamer pipeline stopped");
            }
        }
    }
}

impl Drop for GstSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pop a pending error message off the pipeline bus
fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(format!(
            "{} ({})",
            err.error(),
            err.debug().map(|d| d.to_string()).unwrap_or_default()
        )),
        _ => None,
    }
}

fn sample_format(caps: &gst::CapsRef) -> Result<(PixelFormat, u32, u32), CaptureError> {
    let structure = caps
        .structure(0)
        .ok_or_else(|| CaptureError::Fatal("empty caps".into()))?;

    if structure.has_name("image/jpeg") {
        let width = structure.get::<i32>("width").unwrap_or(0);
        let height = structure.get::<i32>("height").unwrap_or(0);
        return Ok((PixelFormat::Mjpeg, width.max(0) as u32, height.max(0) as u32));
    }

    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|_| CaptureError::Fatal(format!("unsupported caps {caps}")))?;
    let format = match info.format() {
        gst_video::VideoFormat::Rgb => PixelFormat::Rgb24,
        gst_video::VideoFormat::Bgr => PixelFormat::Bgr24,
        gst_video::VideoFormat::Yuy2 => PixelFormat::Yuyv4,
        other => {
            return Err(CaptureError::Fatal(format!(
                "unsupported raw format {other:?}; end the pipeline with videoconvert ! video/x-raw,format=RGB"
            )))
        }
    };
    Ok((format, info.width(), info.height()))
}
