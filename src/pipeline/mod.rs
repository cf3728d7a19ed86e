//! Frame acquisition and the single-slot buffer it feeds

pub mod capture_loop;
pub mod slot;
pub mod state;

pub use capture_loop::CaptureLoop;
pub use slot::{frame_slot, FramePublisher, FrameSlot};
pub use state::{Backoff, CaptureEvent, CaptureState, CaptureStatus};
