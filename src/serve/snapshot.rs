use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::capture::Frame;
use crate::pipeline::FrameSlot;

/// No frame has been published yet. A normal cold-start outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no frame captured yet")]
pub struct NotAvailable;

/// Hands out the latest frame as a still image
#[derive(Clone)]
pub struct SnapshotProvider {
    slot: FrameSlot,
}

impl SnapshotProvider {
    pub fn new(slot: FrameSlot) -> Self {
        Self { slot }
    }

    pub fn get_snapshot(&self) -> Result<Arc<Frame>, NotAvailable> {
        self.slot.read_latest().ok_or(NotAvailable)
    }

    /// Like `get_snapshot`, but on a cold start wait up to `wait` for the
    /// first frame
    pub async fn wait_for_snapshot(&self, wait: Duration) -> Result<Arc<Frame>, NotAvailable> {
        let mut version = self.slot.subscribe();
        if let Ok(frame) = self.get_snapshot() {
            return Ok(frame);
        }
        if wait.is_zero() {
            return Err(NotAvailable);
        }

        let arrived = matches!(
            tokio::time::timeout(wait, version.wait_for(|&seq| seq > 0)).await,
            Ok(Ok(_))
        );
        if arrived {
            self.get_snapshot()
        } else {
            Err(NotAvailable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::EncodedFrame;
    use crate::pipeline::frame_slot;
    use bytes::Bytes;
    use std::time::SystemTime;

    fn encoded(payload: &'static [u8]) -> EncodedFrame {
        EncodedFrame {
            jpeg: Bytes::from_static(payload),
            width: 1,
            height: 1,
            captured_at: SystemTime::now(),
            device_timestamp: None,
        }
    }

    #[test]
    fn not_available_until_first_publish() {
        let (mut publisher, slot) = frame_slot();
        let snapshots = SnapshotProvider::new(slot);

        assert_eq!(snapshots.get_snapshot().unwrap_err(), NotAvailable);

        publisher.publish(encoded(b"first"));
        let frame = snapshots.get_snapshot().unwrap();
        assert_eq!(&frame.data[..], b"first");
        assert_eq!(frame.sequence(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_gives_up_after_the_deadline() {
        let (_publisher, slot) = frame_slot();
        let snapshots = SnapshotProvider::new(slot);

        let result = snapshots.wait_for_snapshot(Duration::from_secs(2)).await;
        assert_eq!(result.unwrap_err(), NotAvailable);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_returns_the_first_frame() {
        let (mut publisher, slot) = frame_slot();
        let snapshots = SnapshotProvider::new(slot);

        let waiter = tokio::spawn(async move {
            snapshots.wait_for_snapshot(Duration::from_secs(10)).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        publisher.publish(encoded(b"late"));

        let frame = waiter.await.unwrap().unwrap();
        assert_eq!(&frame.data[..], b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_ends_when_capture_goes_away() {
        let (publisher, slot) = frame_slot();
        let snapshots = SnapshotProvider::new(slot);

        let waiter = tokio::spawn(async move {
            snapshots.wait_for_snapshot(Duration::from_secs(10)).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(publisher);

        assert_eq!(waiter.await.unwrap().unwrap_err(), NotAvailable);
    }
}
