//! Periodic push of the latest frame to a remote endpoint.
//!
//! One independent task. Each tick uploads whatever frame is current; a tick
//! that finds the previous upload still running is skipped, and failures wait
//! for the next tick rather than retrying.

pub mod http;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::serve::SnapshotProvider;
use crate::shutdown::ShutdownSignal;

pub use http::HttpPush;

/// How long an in-flight upload may run on after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Opaque credentials the remote endpoint expects with every frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub fingerprint: String,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("endpoint answered {status}")]
    Status { status: u16 },
}

/// Remote side of the uploader
pub trait RemotePush: Send + Sync + 'static {
    fn upload(
        &self,
        frame: Bytes,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<(), PushError>> + Send;
}

pub struct PeriodicUploader<P> {
    push: Arc<P>,
    snapshots: SnapshotProvider,
    credentials: Arc<Credentials>,
    interval: watch::Receiver<Duration>,
}

impl<P: RemotePush> PeriodicUploader<P> {
    /// `interval` may be changed at any time through its sender; the timer is
    /// re-armed on the next loop iteration.
    pub fn new(
        push: P,
        snapshots: SnapshotProvider,
        credentials: Credentials,
        interval: watch::Receiver<Duration>,
    ) -> Self {
        Self {
            push: Arc::new(push),
            snapshots,
            credentials: Arc::new(credentials),
            interval,
        }
    }

    pub async fn run(mut self, shutdown: ShutdownSignal) {
        let mut period = *self.interval.borrow_and_update();
        let mut ticker = schedule(period);
        let mut watching = true;
        let mut in_flight: Option<JoinHandle<()>> = None;
        info!("Uploading a frame every {:?}", period);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                changed = self.interval.changed(), if watching => {
                    if changed.is_err() {
                        // Sender gone: keep the current period for good
                        watching = false;
                        continue;
                    }
                    let next = *self.interval.borrow_and_update();
                    if next != period {
                        info!("Upload interval changed {:?} -> {:?}", period, next);
                        period = next;
                        ticker = schedule(period);
                    }
                }
                _ = ticker.tick() => self.on_tick(&mut in_flight),
            }
        }

        if let Some(mut upload) = in_flight {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut upload).await.is_err() {
                warn!("Abandoning in-flight upload at shutdown");
                upload.abort();
            }
        }
        debug!("Uploader stopped");
    }

    fn on_tick(&self, in_flight: &mut Option<JoinHandle<()>>) {
        if in_flight.as_ref().is_some_and(|upload| !upload.is_finished()) {
            debug!("Previous upload still running, skipping this tick");
            metrics::counter!("framecast_uploads_total", "outcome" => "skipped").increment(1);
            return;
        }

        let Ok(frame) = self.snapshots.get_snapshot() else {
            trace!("No frame yet, nothing to upload");
            return;
        };

        let push = self.push.clone();
        let credentials = self.credentials.clone();
        *in_flight = Some(tokio::spawn(async move {
            let sequence = frame.sequence();
            match push.upload(frame.data.clone(), &credentials).await {
                Ok(()) => {
                    debug!(sequence, "Frame uploaded");
                    metrics::counter!("framecast_uploads_total", "outcome" => "ok").increment(1);
                }
                Err(e) => {
                    warn!(sequence, error = %e, "Frame upload failed");
                    metrics::counter!("framecast_uploads_total", "outcome" => "failed")
                        .increment(1);
                }
            }
        }));
    }
}

/// First tick one full period from now
fn schedule(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::EncodedFrame;
    use crate::pipeline::frame_slot;
    use crate::shutdown::Shutdown;
    use std::sync::Mutex;
    use std::time::SystemTime;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Behaviour {
        Succeed,
        Fail,
        Hang,
    }

    /// Records (seconds since start, payload) per call
    #[derive(Clone)]
    struct FakePush {
        start: Instant,
        behaviour: Behaviour,
        calls: Arc<Mutex<Vec<(u64, Bytes)>>>,
    }

    impl FakePush {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                start: Instant::now(),
                behaviour,
                calls: Arc::default(),
            }
        }

        fn calls(&self) -> Vec<(u64, Bytes)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RemotePush for FakePush {
        async fn upload(&self, frame: Bytes, credentials: &Credentials) -> Result<(), PushError> {
            assert_eq!(credentials.token, "token");
            let at = self.start.elapsed().as_secs();
            self.calls.lock().unwrap().push((at, frame));
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(PushError::Status { status: 503 }),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    fn encoded(payload: &'static [u8]) -> EncodedFrame {
        EncodedFrame {
            jpeg: Bytes::from_static(payload),
            width: 1,
            height: 1,
            captured_at: SystemTime::now(),
            device_timestamp: None,
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            token: "token".into(),
            fingerprint: "fp".into(),
        }
    }

    fn spawn_uploader(
        push: FakePush,
        snapshots: SnapshotProvider,
        interval: Duration,
    ) -> (watch::Sender<Duration>, Shutdown, JoinHandle<()>) {
        let (interval_tx, interval_rx) = watch::channel(interval);
        let shutdown = Shutdown::new();
        let uploader = PeriodicUploader::new(push, snapshots, credentials(), interval_rx);
        let task = tokio::spawn(uploader.run(shutdown.signal()));
        (interval_tx, shutdown, task)
    }

    async fn sleep_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_the_frame_current_at_each_tick() {
        let (mut publisher, slot) = frame_slot();
        let push = FakePush::new(Behaviour::Succeed);
        let (_interval, shutdown, task) =
            spawn_uploader(push.clone(), SnapshotProvider::new(slot), Duration::from_secs(10));

        publisher.publish(encoded(b"t0")); // t=0
        sleep_secs(5).await;
        publisher.publish(encoded(b"t5")); // t=5
        sleep_secs(7).await;
        publisher.publish(encoded(b"t12")); // t=12
        sleep_secs(9).await; // t=21

        assert_eq!(
            push.calls(),
            [
                (10, Bytes::from_static(b"t5")),
                (20, Bytes::from_static(b"t12"))
            ]
        );

        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn skips_ticks_without_a_frame() {
        let (mut publisher, slot) = frame_slot();
        let push = FakePush::new(Behaviour::Succeed);
        let (_interval, shutdown, task) =
            spawn_uploader(push.clone(), SnapshotProvider::new(slot), Duration::from_secs(10));

        sleep_secs(15).await;
        assert!(push.calls().is_empty());

        publisher.publish(encoded(b"first"));
        sleep_secs(10).await;
        assert_eq!(push.calls(), [(20, Bytes::from_static(b"first"))]);

        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_upload_is_never_doubled() {
        let (mut publisher, slot) = frame_slot();
        publisher.publish(encoded(b"frame"));
        let push = FakePush::new(Behaviour::Hang);
        let (_interval, shutdown, task) =
            spawn_uploader(push.clone(), SnapshotProvider::new(slot), Duration::from_secs(10));

        sleep_secs(45).await;
        assert_eq!(push.calls().len(), 1);

        // Shutdown gives the stuck upload a grace period, then aborts it
        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_waits_for_the_next_tick() {
        let (mut publisher, slot) = frame_slot();
        publisher.publish(encoded(b"frame"));
        let push = FakePush::new(Behaviour::Fail);
        let (_interval, shutdown, task) =
            spawn_uploader(push.clone(), SnapshotProvider::new(slot), Duration::from_secs(10));

        sleep_secs(15).await;
        assert_eq!(push.calls().len(), 1);

        sleep_secs(10).await;
        let times: Vec<u64> = push.calls().iter().map(|(at, _)| *at).collect();
        assert_eq!(times, [10, 20]);

        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_changes_apply_without_restart() {
        let (mut publisher, slot) = frame_slot();
        publisher.publish(encoded(b"frame"));
        let push = FakePush::new(Behaviour::Succeed);
        let (interval, shutdown, task) =
            spawn_uploader(push.clone(), SnapshotProvider::new(slot), Duration::from_secs(10));

        sleep_secs(11).await; // first push at 10
        interval.send(Duration::from_secs(3)).unwrap();
        sleep_secs(7).await; // t=18, pushes at 14 and 17

        let times: Vec<u64> = push.calls().iter().map(|(at, _)| *at).collect();
        assert_eq!(times, [10, 14, 17]);

        shutdown.trigger();
        task.await.unwrap();
    }
}
