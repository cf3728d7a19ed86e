//! Backend selection

use tracing::{info, warn};

use crate::capture::frame::RawFrame;
use crate::capture::pattern::TestPatternSource;
use crate::capture::{CaptureError, CaptureSource};
use crate::{CaptureBackend, CaptureConfig, ConfigError};

/// Tries each candidate in order on `open` and sticks with the first that
/// comes up until it is closed again.
pub struct FallbackSource {
    candidates: Vec<Box<dyn CaptureSource>>,
    active: Option<usize>,
}

impl FallbackSource {
    pub fn new(candidates: Vec<Box<dyn CaptureSource>>) -> Self {
        Self {
            candidates,
            active: None,
        }
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.map(|i| self.candidates[i].name())
    }
}

impl CaptureSource for FallbackSource {
    fn name(&self) -> &str {
        self.active_name().unwrap_or("auto")
    }

    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        self.close();

        let mut reasons = Vec::with_capacity(self.candidates.len());
        for (i, source) in self.candidates.iter_mut().enumerate() {
            match source.open(config) {
                Ok(()) => {
                    info!("Capturing through {}", source.name());
                    self.active = Some(i);
                    return Ok(());
                }
                Err(e) => {
                    warn!("{} backend failed to open: {}", source.name(), e);
                    reasons.push(format!("{}: {}", source.name(), e));
                }
            }
        }

        Err(CaptureError::unavailable(&config.device, reasons.join("; ")))
    }

    fn next_frame(&mut self) -> Result<RawFrame, CaptureError> {
        match self.active {
            Some(i) => self.candidates[i].next_frame(),
            None => Err(CaptureError::Fatal("no backend open".into())),
        }
    }

    fn close(&mut self) {
        if let Some(i) = self.active.take() {
            self.candidates[i].close();
        }
    }
}

/// Build the configured capture backend.
///
/// `auto` prefers an external pipeline and falls back to the device itself,
/// using whichever of the two were compiled in.
pub fn build_source(config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, ConfigError> {
    match config.backend {
        CaptureBackend::TestPattern => Ok(Box::new(TestPatternSource::new())),
        CaptureBackend::Gstreamer => gstreamer_source(),
        CaptureBackend::V4l2 => v4l2_source(),
        CaptureBackend::Auto => {
            let candidates: Vec<Box<dyn CaptureSource>> =
                [gstreamer_source(), v4l2_source()]
                    .into_iter()
                    .filter_map(Result::ok)
                    .collect();
            if candidates.is_empty() {
                warn!("No capture backend compiled in, using the test pattern");
                return Ok(Box::new(TestPatternSource::new()));
            }
            Ok(Box::new(FallbackSource::new(candidates)))
        }
    }
}

#[cfg(feature = "gstreamer-pipeline")]
fn gstreamer_source() -> Result<Box<dyn CaptureSource>, ConfigError> {
    Ok(Box::new(crate::capture::GstSource::new()))
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn gstreamer_source() -> Result<Box<dyn CaptureSource>, ConfigError> {
    Err(ConfigError::Invalid(
        "gstreamer backend requested but built without the gstreamer-pipeline feature".into(),
    ))
}

#[cfg(feature = "v4l2")]
fn v4l2_source() -> Result<Box<dyn CaptureSource>, ConfigError> {
    Ok(Box::new(crate::capture::V4l2Source::new()))
}

#[cfg(not(feature = "v4l2"))]
fn v4l2_source() -> Result<Box<dyn CaptureSource>, ConfigError> {
    Err(ConfigError::Invalid(
        "v4l2 backend requested but built without the v4l2 feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use bytes::Bytes;

    struct Stub {
        name: &'static str,
        opens: bool,
    }

    impl CaptureSource for Stub {
        fn name(&self) -> &str {
            self.name
        }

        fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
            if self.opens {
                Ok(())
            } else {
                Err(CaptureError::unavailable(&config.device, "absent"))
            }
        }

        fn next_frame(&mut self) -> Result<RawFrame, CaptureError> {
            Ok(RawFrame::new(
                Bytes::from_static(self.name.as_bytes()),
                1,
                1,
                PixelFormat::Mjpeg,
            ))
        }

        fn close(&mut self) {}
    }

    #[test]
    fn falls_back_to_the_next_candidate() {
        let mut source = FallbackSource::new(vec![
            Box::new(Stub { name: "pipeline", opens: false }),
            Box::new(Stub { name: "device", opens: true }),
        ]);

        source.open(&CaptureConfig::default()).unwrap();

        assert_eq!(source.active_name(), Some("device"));
        assert_eq!(&source.next_frame().unwrap().data[..], b"device");
    }

    #[test]
    fn reports_every_failure_when_nothing_opens() {
        let mut source = FallbackSource::new(vec![
            Box::new(Stub { name: "pipeline", opens: false }),
            Box::new(Stub { name: "device", opens: false }),
        ]);

        let err = source.open(&CaptureConfig::default()).unwrap_err();
        let CaptureError::DeviceUnavailable { reason, .. } = &err else {
            panic!("expected DeviceUnavailable, got {err:?}");
        };
        assert!(reason.contains("pipeline") && reason.contains("device"));
        assert!(matches!(source.next_frame(), Err(CaptureError::Fatal(_))));
    }

    #[test]
    fn test_pattern_needs_no_features() {
        let config = CaptureConfig {
            backend: CaptureBackend::TestPattern,
            ..CaptureConfig::default()
        };
        assert_eq!(build_source(&config).unwrap().name(), "test-pattern");
    }
}
