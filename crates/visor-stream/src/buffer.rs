//! Snapshot-anchored ring buffer of recent wire events.

use std::collections::VecDeque;

use visor_core::WireEvent;

/// Ring of the most recent `N` wire events plus the position of the newest
/// buffered FullSnapshot.
///
/// Sequence ids in the ring are contiguous, so positions are derived from
/// the first buffered sequence id rather than stored indexes.
pub struct EventBuffer {
    events: VecDeque<WireEvent>,
    capacity: usize,
    last_snapshot_seq: Option<u64>,
}

impl EventBuffer {
    /// Create a buffer holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            last_snapshot_seq: None,
        }
    }

    /// Append an event, evicting the oldest when full.
    pub fn push(&mut self, event: WireEvent) {
        if event.event.is_full_snapshot() {
            self.last_snapshot_seq = Some(event.sequence_id);
        }
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            let _ = self.events.pop_front();
        }
        // A snapshot that fell off the ring is no longer an anchor.
        if let (Some(snapshot), Some(first)) = (self.last_snapshot_seq, self.first_seq()) {
            if snapshot < first {
                self.last_snapshot_seq = None;
            }
        }
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Sequence id of the oldest buffered event.
    #[must_use]
    pub fn first_seq(&self) -> Option<u64> {
        self.events.front().map(|e| e.sequence_id)
    }

    /// Sequence id of the newest buffered event.
    #[must_use]
    pub fn last_seq(&self) -> Option<u64> {
        self.events.back().map(|e| e.sequence_id)
    }

    /// Sequence id of the newest buffered FullSnapshot.
    #[must_use]
    pub fn last_snapshot_seq(&self) -> Option<u64> {
        self.last_snapshot_seq
    }

    /// Whether a FullSnapshot is currently buffered.
    #[must_use]
    pub fn has_snapshot(&self) -> bool {
        self.last_snapshot_seq.is_some()
    }

    /// The buffered suffix starting at the newest FullSnapshot.
    ///
    /// `None` when no snapshot is buffered; replay must then wait for the
    /// next snapshot to arrive.
    #[must_use]
    pub fn snapshot_suffix(&self) -> Option<Vec<WireEvent>> {
        let snapshot = self.last_snapshot_seq?;
        let first = self.first_seq()?;
        let start = (snapshot - first) as usize;
        Some(self.events.iter().skip(start).cloned().collect())
    }

    /// Iterate all buffered events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &WireEvent> {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use visor_core::{RecorderEvent, SessionId};

    fn event(seq: u64, event_type: i64) -> WireEvent {
        WireEvent {
            session_id: SessionId::parse("visual-c9b1f3a2-8f1e-4e6a-9c3d-0a1b2c3d4e5f")
                .unwrap(),
            timestamp: seq as f64,
            event: RecorderEvent::from_value(json!({"type": event_type, "timestamp": seq})),
            sequence_id: seq,
            metadata: None,
        }
    }

    #[test]
    fn push_tracks_snapshot_seq() {
        let mut buf = EventBuffer::new(10);
        buf.push(event(0, 2));
        buf.push(event(1, 3));
        assert_eq!(buf.last_snapshot_seq(), Some(0));
        buf.push(event(2, 2));
        assert_eq!(buf.last_snapshot_seq(), Some(2));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut buf = EventBuffer::new(3);
        for seq in 0..5 {
            buf.push(event(seq, 3));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.first_seq(), Some(2));
        assert_eq!(buf.last_seq(), Some(4));
    }

    #[test]
    fn snapshot_anchor_cleared_when_evicted() {
        let mut buf = EventBuffer::new(3);
        buf.push(event(0, 2));
        for seq in 1..5 {
            buf.push(event(seq, 3));
        }
        assert!(!buf.has_snapshot());
        assert!(buf.snapshot_suffix().is_none());
    }

    #[test]
    fn snapshot_suffix_starts_at_anchor() {
        let mut buf = EventBuffer::new(10);
        buf.push(event(0, 2));
        buf.push(event(1, 3));
        buf.push(event(2, 2));
        buf.push(event(3, 3));
        buf.push(event(4, 3));

        let suffix = buf.snapshot_suffix().unwrap();
        let seqs: Vec<u64> = suffix.iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert!(suffix[0].event.is_full_snapshot());
    }

    #[test]
    fn snapshot_suffix_after_eviction_uses_offsets() {
        let mut buf = EventBuffer::new(5);
        for seq in 0..4 {
            buf.push(event(seq, 3));
        }
        buf.push(event(4, 2));
        for seq in 5..8 {
            buf.push(event(seq, 3));
        }
        // Ring now holds 3..=7, snapshot at 4.
        assert_eq!(buf.first_seq(), Some(3));
        let suffix = buf.snapshot_suffix().unwrap();
        let seqs: Vec<u64> = suffix.iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![4, 5, 6, 7]);
    }

    #[test]
    fn empty_buffer_has_no_suffix() {
        let buf = EventBuffer::new(10);
        assert!(buf.is_empty());
        assert!(buf.snapshot_suffix().is_none());
        assert_eq!(buf.first_seq(), None);
    }
}
