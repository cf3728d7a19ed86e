//! The capture loop: sole owner of the capture source and sole writer of the
//! frame buffer. Capture errors never leave this module; they show up only as
//! `CaptureState` transitions.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, instrument, trace, warn};

use crate::capture::{CaptureError, CaptureSource, FrameEncoder};
use crate::pipeline::slot::FramePublisher;
use crate::pipeline::state::{Backoff, CaptureEvent, CaptureState, CaptureStatus};
use crate::shutdown::ShutdownSignal;
use crate::CaptureConfig;

pub struct CaptureLoop<S: CaptureSource> {
    source: S,
    source_open: bool,
    publisher: FramePublisher,
    encoder: FrameEncoder,
    config: CaptureConfig,
    state: CaptureState,
    status: CaptureStatus,
    backoff: Backoff,
    transient_failures: u32,
    shutdown: ShutdownSignal,
}

impl<S: CaptureSource> CaptureLoop<S> {
    pub fn new(
        source: S,
        publisher: FramePublisher,
        status: CaptureStatus,
        config: CaptureConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        let encoder = FrameEncoder::new(config.width, config.height, config.jpeg_quality);
        let backoff = Backoff::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        status.set(CaptureState::Disconnected);

        Self {
            source,
            source_open: false,
            publisher,
            encoder,
            config,
            state: CaptureState::Disconnected,
            status,
            backoff,
            transient_failures: 0,
            shutdown,
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    /// Run on a dedicated thread until shutdown
    pub fn spawn(self) -> io::Result<JoinHandle<()>>
    where
        S: 'static,
    {
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || self.run())
    }

    /// Cycle until the shutdown signal fires, then release the source
    pub fn run(mut self) {
        info!("Capture loop started with {} source", self.source.name());
        while !self.shutdown.is_triggered() {
            self.step();
        }
        self.release();
        self.apply(CaptureEvent::Shutdown);
        info!("Capture loop stopped");
    }

    /// One acquisition cycle: a single open attempt, frame read or backoff wait
    pub fn step(&mut self) {
        let event = match &self.state {
            CaptureState::Disconnected => CaptureEvent::Start,
            CaptureState::Connecting => self.connect(),
            CaptureState::Streaming => self.acquire(),
            CaptureState::Failed(_) => {
                let delay = self.backoff.next_delay();
                debug!("Reconnecting in {:?}", delay);
                if self.shutdown.wait_timeout(delay) {
                    return;
                }
                CaptureEvent::BackoffElapsed
            }
        };
        self.apply(event);
    }

    #[instrument(level = "debug", skip(self), fields(source = self.source.name()))]
    fn connect(&mut self) -> CaptureEvent {
        match self.source.open(&self.config) {
            Ok(()) => {
                self.source_open = true;
                self.transient_failures = 0;
                info!("{} source opened", self.source.name());
                CaptureEvent::Opened
            }
            Err(err) => {
                warn!(error = %err, "Failed to open capture source");
                metrics::counter!("framecast_capture_errors_total", "kind" => "open").increment(1);
                CaptureEvent::OpenFailed(err.to_string())
            }
        }
    }

    fn acquire(&mut self) -> CaptureEvent {
        let encoded = self
            .source
            .next_frame()
            .and_then(|raw| self.encoder.encode(raw));

        match encoded {
            Ok(frame) => {
                let sequence = self.publisher.publish(frame);
                self.transient_failures = 0;
                self.backoff.reset();
                trace!(sequence, "Frame published");
                metrics::counter!("framecast_frames_published_total").increment(1);
                CaptureEvent::FrameCaptured
            }
            Err(CaptureError::Transient(reason)) => {
                self.transient_failures += 1;
                metrics::counter!("framecast_capture_errors_total", "kind" => "transient")
                    .increment(1);
                if self.transient_failures > self.config.max_transient_failures {
                    warn!(
                        "{} consecutive transient failures, reopening (last: {})",
                        self.transient_failures, reason
                    );
                    self.release();
                    return CaptureEvent::FatalError(format!(
                        "too many consecutive read failures: {reason}"
                    ));
                }
                debug!(failures = self.transient_failures, "Transient capture failure: {}", reason);
                CaptureEvent::TransientError
            }
            Err(err) => {
                warn!(error = %err, "Capture source failed, releasing it");
                metrics::counter!("framecast_capture_errors_total", "kind" => "fatal").increment(1);
                self.release();
                CaptureEvent::FatalError(err.to_string())
            }
        }
    }

    fn apply(&mut self, event: CaptureEvent) {
        let next = self.state.on(&event);
        if next != self.state {
            info!("Capture state {} -> {}", self.state, next);
            self.status.set(next.clone());
            self.state = next;
        }
    }

    fn release(&mut self) {
        if self.source_open {
            self.source.close();
            self.source_open = false;
            debug!("{} source released", self.source.name());
        }
    }
}

impl<S: CaptureSource> Drop for CaptureLoop<S> {
    fn drop(&mut self) {
        self.release();
    }
}
