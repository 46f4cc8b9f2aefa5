//! Per-client connection state and outbound queue.
//!
//! The streamer pushes serialized frames into a bounded deque; an
//! independent writer task pops them and writes to the socket. Keeping the
//! queue on this side of the socket lets the streamer drop a slow client's
//! undelivered frames and enqueue a snapshot-anchored reset in their place.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;
use visor_core::{ControlFrame, WireEvent};

/// A frame queued for one client.
#[derive(Clone)]
pub struct QueuedFrame {
    /// Sequence id when the frame is a wire event; `None` for control frames.
    pub seq: Option<u64>,
    /// Serialized JSON payload.
    pub payload: Arc<String>,
}

impl QueuedFrame {
    /// Serialize a wire event into a queued frame.
    #[must_use]
    pub fn event(event: &WireEvent) -> Option<Self> {
        match serde_json::to_string(event) {
            Ok(json) => Some(Self {
                seq: Some(event.sequence_id),
                payload: Arc::new(json),
            }),
            Err(err) => {
                warn!(error = %err, "failed to serialize wire event");
                None
            }
        }
    }

    /// Serialize a control frame into a queued frame.
    #[must_use]
    pub fn control(frame: &ControlFrame) -> Option<Self> {
        match serde_json::to_string(frame) {
            Ok(json) => Some(Self {
                seq: None,
                payload: Arc::new(json),
            }),
            Err(err) => {
                warn!(error = %err, "failed to serialize control frame");
                None
            }
        }
    }
}

/// One connected stream-channel client.
pub struct ClientConnection {
    /// Unique client id.
    pub id: String,
    /// When the client joined.
    pub joined_at: Instant,
    queue: Mutex<VecDeque<QueuedFrame>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    /// Client is held until the next FullSnapshot arrives.
    awaiting_snapshot: AtomicBool,
    /// Last sequence id handed to the socket writer.
    acked_seq: AtomicU64,
    /// Frames dropped on this connection (slow-client resets).
    dropped: AtomicU64,
}

impl ClientConnection {
    /// Create a connection with the given outbound queue capacity.
    #[must_use]
    pub fn new(id: String, capacity: usize) -> Self {
        Self {
            id,
            joined_at: Instant::now(),
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            awaiting_snapshot: AtomicBool::new(false),
            acked_seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Try to enqueue a live frame.
    ///
    /// Returns `false` when the queue is at capacity; the caller then
    /// applies the slow-client policy. Closed connections swallow frames.
    pub fn try_push(&self, frame: QueuedFrame) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return true;
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
        true
    }

    /// Drop all undelivered frames and enqueue `frames` in their place.
    ///
    /// Used for slow-client resets and snapshot-anchored replays; the burst
    /// may exceed the live capacity so a full snapshot suffix always fits.
    pub fn replace_queue(&self, frames: Vec<QueuedFrame>) {
        let mut queue = self.queue.lock();
        let dropped = queue.len() as u64;
        if dropped > 0 {
            let _ = self.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        queue.clear();
        queue.extend(frames);
        drop(queue);
        self.notify.notify_one();
    }

    /// Append frames without clearing (replay bursts on request).
    pub fn push_burst(&self, frames: Vec<QueuedFrame>) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let mut queue = self.queue.lock();
        queue.extend(frames);
        drop(queue);
        self.notify.notify_one();
    }

    /// Pop the next frame without waiting.
    pub fn try_next(&self) -> Option<QueuedFrame> {
        let frame = self.queue.lock().pop_front()?;
        if let Some(seq) = frame.seq {
            self.acked_seq.store(seq, Ordering::Relaxed);
        }
        Some(frame)
    }

    /// Pop the next frame, waiting until one is available.
    ///
    /// Returns `None` once the connection is closed and drained.
    pub async fn next(&self) -> Option<QueuedFrame> {
        loop {
            if let Some(frame) = self.queue.lock().pop_front() {
                if let Some(seq) = frame.seq {
                    self.acked_seq.store(seq, Ordering::Relaxed);
                }
                return Some(frame);
            }
            if self.closed.load(Ordering::Relaxed) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Mark the connection closed; queued frames still drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Put the client on hold until the next FullSnapshot.
    pub fn set_awaiting_snapshot(&self, waiting: bool) {
        self.awaiting_snapshot.store(waiting, Ordering::Relaxed);
    }

    /// Whether the client is held for a snapshot.
    #[must_use]
    pub fn is_awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot.load(Ordering::Relaxed)
    }

    /// Last sequence id handed to the socket writer.
    #[must_use]
    pub fn acked_seq(&self) -> u64 {
        self.acked_seq.load(Ordering::Relaxed)
    }

    /// Total frames dropped by slow-client resets.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current queue depth.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> QueuedFrame {
        QueuedFrame {
            seq: Some(seq),
            payload: Arc::new(format!("{{\"sequence_id\":{seq}}}")),
        }
    }

    #[test]
    fn push_and_len() {
        let conn = ClientConnection::new("c1".into(), 4);
        assert!(conn.try_push(frame(0)));
        assert!(conn.try_push(frame(1)));
        assert_eq!(conn.queue_len(), 2);
    }

    #[test]
    fn push_fails_at_capacity() {
        let conn = ClientConnection::new("c1".into(), 2);
        assert!(conn.try_push(frame(0)));
        assert!(conn.try_push(frame(1)));
        assert!(!conn.try_push(frame(2)));
        assert_eq!(conn.queue_len(), 2);
    }

    #[test]
    fn replace_queue_counts_drops_and_allows_overflow() {
        let conn = ClientConnection::new("c1".into(), 2);
        let _ = conn.try_push(frame(0));
        let _ = conn.try_push(frame(1));
        conn.replace_queue((10..15).map(frame).collect());
        assert_eq!(conn.drop_count(), 2);
        assert_eq!(conn.queue_len(), 5); // burst exceeds live capacity
    }

    #[tokio::test]
    async fn next_pops_in_order_and_tracks_ack() {
        let conn = ClientConnection::new("c1".into(), 8);
        let _ = conn.try_push(frame(5));
        let _ = conn.try_push(frame(6));
        assert_eq!(conn.next().await.unwrap().seq, Some(5));
        assert_eq!(conn.next().await.unwrap().seq, Some(6));
        assert_eq!(conn.acked_seq(), 6);
    }

    #[tokio::test]
    async fn next_returns_none_after_close_and_drain() {
        let conn = ClientConnection::new("c1".into(), 8);
        let _ = conn.try_push(frame(0));
        conn.close();
        assert!(conn.next().await.is_some());
        assert!(conn.next().await.is_none());
    }

    #[tokio::test]
    async fn next_wakes_on_push() {
        let conn = Arc::new(ClientConnection::new("c1".into(), 8));
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.next().await })
        };
        tokio::task::yield_now().await;
        let _ = conn.try_push(frame(3));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.seq, Some(3));
    }

    #[tokio::test]
    async fn next_wakes_on_close() {
        let conn = Arc::new(ClientConnection::new("c1".into(), 8));
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.next().await })
        };
        tokio::task::yield_now().await;
        conn.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[test]
    fn closed_connection_swallows_pushes() {
        let conn = ClientConnection::new("c1".into(), 2);
        conn.close();
        assert!(conn.try_push(frame(0)));
        assert_eq!(conn.queue_len(), 0);
    }

    #[test]
    fn awaiting_snapshot_flag() {
        let conn = ClientConnection::new("c1".into(), 2);
        assert!(!conn.is_awaiting_snapshot());
        conn.set_awaiting_snapshot(true);
        assert!(conn.is_awaiting_snapshot());
    }
}
