//! Single-slot, versioned frame buffer.
//!
//! The latest frame lives in an `ArcSwapOption`, so publishing is one atomic
//! pointer swap and reads never take a lock a writer could wait on. The version
//! counter rides on a `watch` channel that wakes subscribers after each swap;
//! its sender belongs to the publisher, so subscribers also learn when the
//! capture side is gone.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;

use crate::capture::frame::{EncodedFrame, Frame, FrameMetadata};

struct Shared {
    latest: ArcSwapOption<Frame>,
    version: watch::Receiver<u64>,
}

/// Create the slot: one writer handle and a cloneable reader
pub fn frame_slot() -> (FramePublisher, FrameSlot) {
    let (tx, rx) = watch::channel(0);
    let shared = Arc::new(Shared {
        latest: ArcSwapOption::empty(),
        version: rx,
    });
    (
        FramePublisher {
            shared: shared.clone(),
            version: tx,
            sequence: 0,
        },
        FrameSlot { shared },
    )
}

/// The only writer of a slot. Not `Clone`.
pub struct FramePublisher {
    shared: Arc<Shared>,
    version: watch::Sender<u64>,
    sequence: u64,
}

impl FramePublisher {
    /// Store `frame` as the latest and wake subscribers. Returns its sequence.
    pub fn publish(&mut self, frame: EncodedFrame) -> u64 {
        self.sequence += 1;
        let frame = Frame {
            data: frame.jpeg,
            meta: FrameMetadata {
                sequence: self.sequence,
                width: frame.width,
                height: frame.height,
                device_timestamp: frame.device_timestamp,
            },
            captured_at: frame.captured_at,
        };

        // Frame must be visible before the version that announces it
        self.shared.latest.store(Some(Arc::new(frame)));
        self.version.send_replace(self.sequence);
        self.sequence
    }
}

/// Read side of the frame buffer
#[derive(Clone)]
pub struct FrameSlot {
    shared: Arc<Shared>,
}

impl FrameSlot {
    /// Newest frame, or `None` before the first publish. Never blocks.
    pub fn read_latest(&self) -> Option<Arc<Frame>> {
        self.shared.latest.load_full()
    }

    /// Sequence of the newest frame; 0 before the first publish
    pub fn sequence(&self) -> u64 {
        *self.shared.version.borrow()
    }

    /// Change notifications keyed by sequence number
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.version.clone()
    }
}
