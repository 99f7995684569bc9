//! Segmentation-aware send queue.
//!
//! A relay node forwarding bulk transfers for one segment must not starve
//! the others, so the outbound queue keeps a FIFO per segment and serves
//! them round-robin: `pop_front` takes from the segment under the cursor,
//! then advances the cursor to the next non-empty segment in ascending
//! segment-id order, wrapping around. When everything drains the cursor is
//! parked until the next push.

use std::collections::{BTreeMap, VecDeque};

use galena_types::SegmentId;

use crate::datagram::Datagram;

/// Per-segment round-robin outbound queue.
#[derive(Debug, Default)]
pub struct FairSendQueue {
    current_segment: Option<SegmentId>,
    last_pushed_segment: Option<SegmentId>,
    queued_bytes: usize,
    queue: BTreeMap<SegmentId, VecDeque<Datagram>>,
}

impl FairSendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a datagram originating from `segment`.
    pub fn push_back(&mut self, segment: SegmentId, dg: Datagram) {
        debug_assert!(self.current_segment.is_some() || self.is_empty());

        self.queued_bytes += dg.len();
        self.queue.entry(segment).or_default().push_back(dg);
        if self.current_segment.is_none() {
            self.current_segment = Some(segment);
        }
        self.last_pushed_segment = Some(segment);
    }

    /// The datagram under the round-robin cursor.
    pub fn front(&self) -> Option<&Datagram> {
        let segment = self.current_segment?;
        self.queue.get(&segment).and_then(VecDeque::front)
    }

    /// The most recently pushed datagram.
    pub fn back(&self) -> Option<&Datagram> {
        let segment = self.last_pushed_segment?;
        self.queue.get(&segment).and_then(VecDeque::back)
    }

    /// Removes the datagram under the cursor and advances the cursor to the
    /// next non-empty segment.
    pub fn pop_front(&mut self) -> Option<Datagram> {
        let segment = self.current_segment?;
        let fifo = self.queue.get_mut(&segment).expect("cursor segment exists");
        let dg = fifo.pop_front().expect("cursor FIFO nonempty");

        debug_assert!(dg.len() <= self.queued_bytes);
        self.queued_bytes -= dg.len();
        self.current_segment = self.next_segment(segment);
        Some(dg)
    }

    /// Next non-empty segment after `segment` in ascending order, wrapping.
    fn next_segment(&self, segment: SegmentId) -> Option<SegmentId> {
        self.queue
            .range(segment.wrapping_add(1)..)
            .chain(self.queue.range(..=segment))
            .find(|(_, fifo)| !fifo.is_empty())
            .map(|(seg, _)| *seg)
    }

    pub fn is_empty(&self) -> bool {
        self.queued_bytes == 0
    }

    /// Number of queued datagrams across all segments.
    pub fn len(&self) -> usize {
        self.queue.values().map(VecDeque::len).sum()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Queued message count per segment.
    pub fn segments(&self) -> Vec<(SegmentId, usize)> {
        self.queue
            .iter()
            .map(|(seg, fifo)| (*seg, fifo.len()))
            .collect()
    }
}
