//! Live-stream fan-out.
//!
//! Every client gets a cursor and nothing else. A client that is ready for
//! another frame gets the newest one; whatever was published in between is
//! skipped. Waiting for a newer frame parks on the slot's version channel.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::utils::CachePadded;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::debug;

use crate::capture::Frame;
use crate::pipeline::FrameSlot;
use crate::shutdown::ShutdownSignal;
use crate::StreamConfig;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Why a client session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("no new frame within the idle timeout")]
    IdleTimeout,
    #[error("client did not accept a frame within the write timeout")]
    WriteTimeout,
    #[error("capture loop is gone")]
    SourceClosed,
    #[error("shutting down")]
    Shutdown,
}

#[derive(Default)]
struct Stats {
    clients: AtomicUsize,
    frames_sent: AtomicU64,
    frames_skipped: AtomicU64,
    next_client: AtomicU64,
}

/// Snapshot of distributor counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub clients: usize,
    pub frames_sent: u64,
    pub frames_skipped: u64,
}

#[derive(Clone)]
pub struct StreamDistributor {
    slot: FrameSlot,
    idle_timeout: Duration,
    write_timeout: Duration,
    stats: Arc<CachePadded<Stats>>,
}

impl StreamDistributor {
    pub fn new(slot: FrameSlot, config: &StreamConfig) -> Self {
        Self {
            slot,
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            stats: Arc::new(CachePadded::new(Stats::default())),
        }
    }

    /// Register a new client
    pub fn subscribe(&self) -> ConsumerHandle {
        let id = self.stats.next_client.fetch_add(1, Ordering::Relaxed);
        let clients = self.stats.clients.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("framecast_stream_clients").set(clients as f64);
        debug!(client = id, clients, "Stream client connected");

        ConsumerHandle {
            id,
            slot: self.slot.clone(),
            version: self.slot.subscribe(),
            cursor: 0,
            idle_timeout: self.idle_timeout,
            stats: self.stats.clone(),
        }
    }

    /// Spawn a session task feeding multipart parts into the returned channel.
    ///
    /// The channel holds at most one part. If the transport does not take it
    /// within the write timeout the session ends; dropping the receiver ends
    /// it right away.
    pub fn open_session(&self, shutdown: ShutdownSignal) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(1);
        let consumer = self.subscribe();
        let write_timeout = self.write_timeout;

        tokio::spawn(async move {
            let id = consumer.id;
            let reason = consumer.pump(tx, write_timeout, shutdown).await;
            debug!(client = id, "Stream session ended: {}", reason);
        });
        rx
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            clients: self.stats.clients.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_skipped: self.stats.frames_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Per-client cursor. Dropping it unregisters the client.
pub struct ConsumerHandle {
    id: u64,
    slot: FrameSlot,
    version: watch::Receiver<u64>,
    cursor: u64,
    idle_timeout: Duration,
    stats: Arc<CachePadded<Stats>>,
}

impl ConsumerHandle {
    /// Newest frame with a sequence above the cursor, waiting for one if
    /// needed
    pub async fn next_frame(&mut self) -> Result<Arc<Frame>, StreamError> {
        loop {
            // Mark the version seen before looking, so a publish racing the
            // check still wakes `changed` below
            self.version.borrow_and_update();
            if let Some(frame) = self.slot.read_latest() {
                let sequence = frame.sequence();
                if sequence > self.cursor {
                    if self.cursor > 0 && sequence > self.cursor + 1 {
                        let skipped = sequence - self.cursor - 1;
                        self.stats.frames_skipped.fetch_add(skipped, Ordering::Relaxed);
                        metrics::counter!("framecast_stream_frames_skipped_total").increment(skipped);
                    }
                    self.cursor = sequence;
                    return Ok(frame);
                }
            }

            match timeout(self.idle_timeout, self.version.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(StreamError::SourceClosed),
                Err(_) => return Err(StreamError::IdleTimeout),
            }
        }
    }

    async fn pump(
        mut self,
        tx: mpsc::Sender<Bytes>,
        write_timeout: Duration,
        shutdown: ShutdownSignal,
    ) -> StreamError {
        loop {
            let frame = tokio::select! {
                _ = shutdown.triggered() => return StreamError::Shutdown,
                _ = tx.closed() => return StreamError::ClientDisconnected,
                next = self.next_frame() => match next {
                    Ok(frame) => frame,
                    Err(e) => return e,
                },
            };

            match timeout(write_timeout, tx.send(multipart_part(&frame))).await {
                Ok(Ok(())) => {
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("framecast_stream_frames_sent_total").increment(1);
                }
                Ok(Err(_)) => return StreamError::ClientDisconnected,
                Err(_) => return StreamError::WriteTimeout,
            }
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        let clients = self.stats.clients.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!("framecast_stream_clients").set(clients as f64);
        debug!(client = self.id, clients, "Stream client released");
    }
}

/// One part of a multipart/x-mixed-replace body
pub fn multipart_part(frame: &Frame) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Frame-Sequence: {}\r\n\r\n",
        frame.data.len(),
        frame.sequence()
    );

    let mut part = BytesMut::with_capacity(header.len() + frame.data.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(&frame.data);
    part.put_slice(b"\r\n");
    part.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::EncodedFrame;
    use crate::pipeline::{frame_slot, FramePublisher};
    use crate::shutdown::Shutdown;
    use std::time::SystemTime;

    fn encoded(payload: &[u8]) -> EncodedFrame {
        EncodedFrame {
            jpeg: Bytes::copy_from_slice(payload),
            width: 1,
            height: 1,
            captured_at: SystemTime::now(),
            device_timestamp: None,
        }
    }

    fn distributor() -> (FramePublisher, StreamDistributor) {
        let (publisher, slot) = frame_slot();
        let config = StreamConfig {
            idle_timeout_ms: 5_000,
            write_timeout_ms: 1_000,
        };
        (publisher, StreamDistributor::new(slot, &config))
    }

    #[tokio::test]
    async fn slow_client_skips_to_the_latest_frame() {
        let (mut publisher, distributor) = distributor();
        let mut client = distributor.subscribe();
        let mut received = Vec::new();

        publisher.publish(encoded(b"1"));
        received.push(client.next_frame().await.unwrap().sequence());

        for payload in [b"2", b"3", b"4"] {
            publisher.publish(encoded(payload));
        }
        received.push(client.next_frame().await.unwrap().sequence());

        publisher.publish(encoded(b"5"));
        received.push(client.next_frame().await.unwrap().sequence());

        publisher.publish(encoded(b"6"));
        publisher.publish(encoded(b"7"));
        received.push(client.next_frame().await.unwrap().sequence());

        assert_eq!(received, [1, 4, 5, 7]);
        assert_eq!(distributor.stats().frames_skipped, 3);
    }

    #[tokio::test]
    async fn waits_for_a_newer_frame_instead_of_repeating() {
        let (mut publisher, distributor) = distributor();
        let mut client = distributor.subscribe();
        publisher.publish(encoded(b"1"));
        assert_eq!(client.next_frame().await.unwrap().sequence(), 1);

        let waiter = tokio::spawn(async move { client.next_frame().await.map(|f| f.sequence()) });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        publisher.publish(encoded(b"2"));
        assert_eq!(waiter.await.unwrap(), Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clients_time_out() {
        let (_publisher, distributor) = distributor();
        let mut client = distributor.subscribe();

        assert_eq!(
            client.next_frame().await.unwrap_err(),
            StreamError::IdleTimeout
        );
    }

    #[tokio::test]
    async fn stream_ends_when_capture_goes_away() {
        let (publisher, distributor) = distributor();
        let mut client = distributor.subscribe();

        drop(publisher);

        assert_eq!(
            client.next_frame().await.unwrap_err(),
            StreamError::SourceClosed
        );
    }

    #[tokio::test]
    async fn independent_clients_each_get_every_frame_they_wait_for() {
        let (mut publisher, distributor) = distributor();
        let mut a = distributor.subscribe();
        let mut b = distributor.subscribe();
        assert_eq!(distributor.stats().clients, 2);

        publisher.publish(encoded(b"x"));
        assert_eq!(a.next_frame().await.unwrap().sequence(), 1);
        assert_eq!(b.next_frame().await.unwrap().sequence(), 1);

        drop(a);
        assert_eq!(distributor.stats().clients, 1);
        drop(b);
        assert_eq!(distributor.stats().clients, 0);
    }

    #[tokio::test]
    async fn session_streams_parts_and_cleans_up_on_disconnect() {
        let (mut publisher, distributor) = distributor();
        let shutdown = Shutdown::new();
        let mut rx = distributor.open_session(shutdown.signal());

        publisher.publish(encoded(b"jpeg-bytes"));
        let part = rx.recv().await.unwrap();
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.ends_with("\r\n\r\njpeg-bytes\r\n"));
        assert_eq!(distributor.stats().clients, 1);

        drop(rx);
        timeout(Duration::from_secs(5), async {
            while distributor.stats().clients != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session should release its handle");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_client_hits_the_write_timeout() {
        let (mut publisher, distributor) = distributor();
        let shutdown = Shutdown::new();
        let rx = distributor.open_session(shutdown.signal());

        // Nobody reads: first part fills the channel, second one never fits
        publisher.publish(encoded(b"1"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        publisher.publish(encoded(b"2"));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(distributor.stats().clients, 0);
        drop(rx);
    }

    #[tokio::test]
    async fn shutdown_ends_sessions() {
        let (_publisher, distributor) = distributor();
        let shutdown = Shutdown::new();
        let mut rx = distributor.open_session(shutdown.signal());

        shutdown.trigger();
        let end = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(end.is_none());
    }
}
