//! Read side of the frame buffer: snapshots, MJPEG fan-out and the HTTP surface

pub mod http;
pub mod snapshot;
pub mod stream;

pub use http::{router, serve, AppState};
pub use snapshot::{NotAvailable, SnapshotProvider};
pub use stream::{ConsumerHandle, StreamDistributor, StreamError, StreamStats};
