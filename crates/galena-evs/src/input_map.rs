//! Per-source ordered message buffer for the EVS layer.
//!
//! For each source the map tracks a [`Range`] `(lu, hs)`: the lowest unseen
//! and the highest seen seqno. Two watermarks are derived across sources:
//!
//! - `aru_seq` ("all received up to"): `min(lu) - 1` over all sources;
//!   everything at or below it has been received from everyone
//! - `safe_seq`: the minimum of the per-source safe seqnos reported by
//!   peers; at or below it no retransmission can ever be needed
//!
//! Messages live in one of two indices: the *live* index until the EVS layer
//! delivers them, then the *recovery* index until they fall below the global
//! safe seqno (they may still be retransmitted to lagging peers from there).
//!
//! Precondition violations here are programmer errors and panic; no
//! recoverable failures originate in this module.

use std::collections::BTreeMap;

use bytes::Bytes;

use galena_types::{Seqno, SourceId, ViewId};

/// Delivery order class of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Order {
    /// Hole filler or otherwise undeliverable; consumes a seqno slot but
    /// must never be surfaced to the application.
    Drop = 0,
    /// Deliver at reception, no ordering guarantees.
    Unreliable = 1,
    /// Deliver in per-source FIFO order.
    Fifo = 2,
    /// Deliver when all preceding messages are delivered.
    Agreed = 3,
    /// Deliver when all current members have received the message.
    Safe = 4,
}

const ORDER_COUNT: usize = Order::Safe as usize + 1;

/// Per-source seqno range: `lu` = lowest unseen, `hs` = highest seen.
///
/// Invariant: `lu <= hs + 1`; every seqno in `[lu, hs]` present in the map
/// has been received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    lu: Seqno,
    hs: Seqno,
}

impl Range {
    pub fn new(lu: Seqno, hs: Seqno) -> Self {
        Self { lu, hs }
    }

    pub fn lu(&self) -> Seqno {
        self.lu
    }

    pub fn hs(&self) -> Seqno {
        self.hs
    }
}

impl Default for Range {
    fn default() -> Self {
        // nothing seen: the first expected seqno is 0
        Self {
            lu: Seqno::new(0),
            hs: Seqno::NONE,
        }
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.lu, self.hs)
    }
}

/// An EVS user message as the input map needs to see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub source: SourceId,
    pub view_id: ViewId,
    pub seq: Seqno,
    pub aru_seq: Seqno,
    /// Number of implicit follow-up seqnos this message reserves.
    pub seq_range: u32,
    pub order: Order,
}

impl UserMessage {
    /// A placeholder reserving seqno `seq`; never delivered.
    fn filler(&self, seq: Seqno) -> Self {
        Self {
            seq,
            aru_seq: self.aru_seq,
            seq_range: 0,
            order: Order::Drop,
            ..*self
        }
    }
}

/// Message index key, ordered seqno-major so that garbage collection below
/// a watermark is a single ordered-range removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct MsgKey {
    seq: Seqno,
    index: usize,
}

#[derive(Debug, Clone)]
struct InputMapMsg {
    msg: UserMessage,
    payload: Bytes,
}

#[derive(Debug, Clone)]
struct InputMapNode {
    range: Range,
    safe_seq: Seqno,
}

impl Default for InputMapNode {
    fn default() -> Self {
        Self {
            range: Range::default(),
            safe_seq: Seqno::NONE,
        }
    }
}

/// The input map: per-source FIFOs with holes, ARU/safe tracking and a
/// recovery window for peer retransmission.
#[derive(Debug)]
pub struct InputMap {
    window: i64,
    safe_seq: Seqno,
    aru_seq: Seqno,
    node_index: Vec<InputMapNode>,
    msg_index: BTreeMap<MsgKey, InputMapMsg>,
    recovery_index: BTreeMap<MsgKey, InputMapMsg>,
    n_msgs: [usize; ORDER_COUNT],
}

impl InputMap {
    pub fn new() -> Self {
        Self {
            window: -1,
            safe_seq: Seqno::NONE,
            aru_seq: Seqno::NONE,
            node_index: Vec::new(),
            msg_index: BTreeMap::new(),
            recovery_index: BTreeMap::new(),
            n_msgs: [0; ORDER_COUNT],
        }
    }

    /// Installs a fresh `n_sources`-entry range table for a new view.
    ///
    /// Both message indices must be empty (the view change protocol drains
    /// them first).
    pub fn reset(&mut self, n_sources: usize, window: i64) {
        assert!(
            self.msg_index.is_empty()
                && self.recovery_index.is_empty()
                && self.n_msgs.iter().sum::<usize>() == 0,
            "input map reset with undelivered messages"
        );

        self.node_index.clear();
        self.node_index
            .resize_with(n_sources, InputMapNode::default);
        self.window = window;
        tracing::debug!(n_sources, window, "input map reset");
    }

    /// The configured reception window.
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Largest seqno such that everything at or below it has been received
    /// from every source.
    pub fn aru_seq(&self) -> Seqno {
        self.aru_seq
    }

    /// Largest seqno known to be received by every current member.
    pub fn safe_seq(&self) -> Seqno {
        self.safe_seq
    }

    /// Per-source range.
    pub fn range(&self, src: usize) -> Range {
        self.node_index[src].range
    }

    /// Per-source safe seqno.
    pub fn node_safe_seq(&self, src: usize) -> Seqno {
        self.node_index[src].safe_seq
    }

    /// Smallest highest-seen seqno over all sources.
    pub fn min_hs(&self) -> Seqno {
        assert!(!self.node_index.is_empty(), "input map has no sources");
        self.node_index
            .iter()
            .map(|n| n.range.hs())
            .min()
            .expect("nonempty")
    }

    /// Largest highest-seen seqno over all sources.
    pub fn max_hs(&self) -> Seqno {
        assert!(!self.node_index.is_empty(), "input map has no sources");
        self.node_index
            .iter()
            .map(|n| n.range.hs())
            .max()
            .expect("nonempty")
    }

    /// Number of undelivered messages of the given order class.
    pub fn n_msgs(&self, order: Order) -> usize {
        self.n_msgs[order as usize]
    }

    /// Inserts a message from source `src`, fabricating [`Order::Drop`]
    /// fillers for the seqnos its `seq_range` reserves, and returns the
    /// updated range.
    ///
    /// The caller must have checked `aru_seq < msg.seq` and
    /// `range(src).lu <= msg.seq`; violating either could cause duplicate
    /// delivery and is a fatal error.
    pub fn insert(&mut self, src: usize, msg: UserMessage, payload: Bytes) -> Range {
        assert!(msg.seq.is_set(), "message without seqno");
        assert!(
            self.aru_seq < msg.seq,
            "aru seq {} >= msg seq {}",
            self.aru_seq,
            msg.seq
        );
        assert!(src < self.node_index.len(), "source index {src} out of range");

        let mut range = self.node_index[src].range;
        assert!(
            range.lu <= msg.seq,
            "lu {} > msg seq {}",
            range.lu,
            msg.seq
        );

        // already seen: delivered long ago, or sitting in the recovery index
        if msg.seq < range.lu
            || (msg.seq <= range.hs
                && self
                    .recovery_index
                    .contains_key(&MsgKey {
                        seq: msg.seq,
                        index: src,
                    }))
        {
            return range;
        }

        let last = msg.seq + i64::from(msg.seq_range);
        let mut seq = msg.seq;
        while seq <= last {
            let key = MsgKey { seq, index: src };
            let present = seq <= range.hs && self.msg_index.contains_key(&key);

            if !present {
                let entry = if seq == msg.seq {
                    InputMapMsg {
                        msg: msg.clone(),
                        payload: payload.clone(),
                    }
                } else {
                    InputMapMsg {
                        msg: msg.filler(seq),
                        payload: Bytes::new(),
                    }
                };
                self.n_msgs[entry.msg.order as usize] += 1;
                let replaced = self.msg_index.insert(key, entry);
                assert!(replaced.is_none(), "duplicate message index entry");
            }

            if range.hs < seq {
                range.hs = seq;
            }

            if range.lu == seq {
                let mut i = seq + 1;
                while i <= range.hs
                    && (self.msg_index.contains_key(&MsgKey { seq: i, index: src })
                        || self
                            .recovery_index
                            .contains_key(&MsgKey { seq: i, index: src }))
                {
                    i += 1;
                }
                range.lu = i;
            }

            seq += 1;
        }

        self.node_index[src].range = range;
        self.update_aru();
        range
    }

    /// Moves a delivered message from the live index to the recovery index,
    /// where it stays available for peer retransmission until safe.
    pub fn erase(&mut self, src: usize, seq: Seqno) {
        let key = MsgKey { seq, index: src };
        let entry = self
            .msg_index
            .remove(&key)
            .expect("erase of message not in live index");
        self.n_msgs[entry.msg.order as usize] -= 1;
        let replaced = self.recovery_index.insert(key, entry);
        assert!(replaced.is_none(), "duplicate recovery index entry");
    }

    /// Looks up a live (undelivered) message.
    pub fn find(&self, src: usize, seq: Seqno) -> Option<(&UserMessage, &Bytes)> {
        self.msg_index
            .get(&MsgKey { seq, index: src })
            .map(|m| (&m.msg, &m.payload))
    }

    /// Looks up an already delivered message for retransmission.
    ///
    /// The entry must exist: requesting recovery below the safe seqno is a
    /// protocol violation.
    pub fn recover(&self, src: usize, seq: Seqno) -> (&UserMessage, &Bytes) {
        let entry = self
            .recovery_index
            .get(&MsgKey { seq, index: src })
            .expect("recover of message not in recovery index");
        (&entry.msg, &entry.payload)
    }

    /// Records that source `src` has declared `seq` safe, advances the
    /// global safe seqno and discards recovery entries at or below it.
    pub fn set_safe_seq(&mut self, src: usize, seq: Seqno) {
        assert!(seq.is_set(), "safe seq must be set");

        // per-source safe seq advances monotonically if the node works ok
        let node = &mut self.node_index[src];
        assert!(
            seq >= node.safe_seq,
            "node safe seq {} > {}",
            node.safe_seq,
            seq
        );
        node.safe_seq = seq;

        let min = self
            .node_index
            .iter()
            .map(|n| n.safe_seq)
            .min()
            .expect("input map has no sources");
        assert!(min >= self.safe_seq, "global safe seq went backwards");
        self.safe_seq = min;

        assert!(
            self.safe_seq <= self.aru_seq,
            "safe seq {} above aru seq {}",
            self.safe_seq,
            self.aru_seq
        );

        self.cleanup_recovery_index();
    }

    /// Discards all state: indices, ranges and watermarks.
    pub fn clear(&mut self) {
        if !self.msg_index.is_empty() {
            tracing::warn!(
                count = self.msg_index.len(),
                "discarding messages from message index"
            );
        }
        if !self.recovery_index.is_empty() {
            tracing::debug!(
                count = self.recovery_index.len(),
                "discarding messages from recovery index"
            );
        }
        self.msg_index.clear();
        self.recovery_index.clear();
        self.node_index.clear();
        self.aru_seq = Seqno::NONE;
        self.safe_seq = Seqno::NONE;
        self.n_msgs = [0; ORDER_COUNT];
    }

    fn update_aru(&mut self) {
        let min_lu = self
            .node_index
            .iter()
            .map(|n| n.range.lu)
            .min()
            .expect("input map has no sources");

        let aru = min_lu + (-1);
        // aru_seq must not decrease
        assert!(aru >= self.aru_seq, "aru seq went backwards");
        self.aru_seq = aru;
    }

    fn cleanup_recovery_index(&mut self) {
        assert!(!self.node_index.is_empty());
        let keep = self.recovery_index.split_off(&MsgKey {
            seq: self.safe_seq + 1,
            index: 0,
        });
        self.recovery_index = keep;
    }

    #[cfg(test)]
    fn recovery_len(&self) -> usize {
        self.recovery_index.len()
    }
}

impl Default for InputMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galena_types::ViewType;

    fn msg(seq: i64, order: Order) -> UserMessage {
        UserMessage {
            source: SourceId::ZERO,
            view_id: ViewId::new(ViewType::Reg, SourceId::ZERO, 1),
            seq: Seqno::new(seq),
            aru_seq: Seqno::NONE,
            seq_range: 0,
            order,
        }
    }

    fn msg_range(seq: i64, seq_range: u32) -> UserMessage {
        UserMessage {
            seq_range,
            ..msg(seq, Order::Safe)
        }
    }

    #[test]
    fn test_contiguous_delivery() {
        let mut im = InputMap::new();
        im.reset(3, 16);

        for seq in 0..3 {
            let range = im.insert(0, msg(seq, Order::Safe), Bytes::new());
            assert_eq!(range.lu(), Seqno::new(seq + 1));
            assert_eq!(range.hs(), Seqno::new(seq));
            // sources 1 and 2 have seen nothing, so the global watermark
            // stays put
            assert_eq!(im.aru_seq(), Seqno::NONE);
        }

        assert_eq!(im.range(0), Range::new(Seqno::new(3), Seqno::new(2)));
        assert_eq!(im.range(1), Range::default());
    }

    #[test]
    fn test_aru_advances_when_all_sources_catch_up() {
        let mut im = InputMap::new();
        im.reset(2, 16);

        im.insert(0, msg(0, Order::Safe), Bytes::new());
        assert_eq!(im.aru_seq(), Seqno::NONE);

        im.insert(1, msg(0, Order::Safe), Bytes::new());
        assert_eq!(im.aru_seq(), Seqno::new(0));

        im.insert(0, msg(1, Order::Safe), Bytes::new());
        im.insert(1, msg(1, Order::Safe), Bytes::new());
        assert_eq!(im.aru_seq(), Seqno::new(1));
    }

    #[test]
    fn test_hole_blocks_lu() {
        let mut im = InputMap::new();
        im.reset(1, 16);

        im.insert(0, msg(0, Order::Safe), Bytes::new());
        im.insert(0, msg(2, Order::Safe), Bytes::new());
        assert_eq!(im.range(0), Range::new(Seqno::new(1), Seqno::new(2)));
        assert_eq!(im.aru_seq(), Seqno::new(0));

        // filling the hole advances lu past everything contiguous
        im.insert(0, msg(1, Order::Safe), Bytes::new());
        assert_eq!(im.range(0), Range::new(Seqno::new(3), Seqno::new(2)));
        assert_eq!(im.aru_seq(), Seqno::new(2));
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut im = InputMap::new();
        im.reset(1, 16);

        im.insert(0, msg(0, Order::Safe), Bytes::new());
        im.insert(0, msg(2, Order::Safe), Bytes::new());
        let before = im.range(0);
        let range = im.insert(0, msg(2, Order::Safe), Bytes::new());
        assert_eq!(range, before);
        assert_eq!(im.n_msgs(Order::Safe), 2);
    }

    #[test]
    fn test_seq_range_creates_fillers() {
        let mut im = InputMap::new();
        im.reset(1, 16);

        let range = im.insert(0, msg_range(0, 2), Bytes::from_static(b"payload"));
        // the message plus exactly seq_range fillers
        assert_eq!(range.hs(), Seqno::new(2));
        assert_eq!(range.lu(), Seqno::new(3));
        assert_eq!(im.n_msgs(Order::Safe), 1);
        assert_eq!(im.n_msgs(Order::Drop), 2);

        let (m, payload) = im.find(0, Seqno::new(0)).expect("head message");
        assert_eq!(m.order, Order::Safe);
        assert_eq!(payload.as_ref(), b"payload");

        let (filler, payload) = im.find(0, Seqno::new(1)).expect("filler");
        assert_eq!(filler.order, Order::Drop);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_safe_seq_propagation_and_recovery_gc() {
        let mut im = InputMap::new();
        im.reset(3, 16);

        for src in 0..3 {
            for seq in 0..4 {
                im.insert(src, msg(seq, Order::Safe), Bytes::new());
            }
        }
        assert_eq!(im.aru_seq(), Seqno::new(3));

        // deliver everything
        for src in 0..3 {
            for seq in 0..4 {
                im.erase(src, Seqno::new(seq));
            }
        }
        assert_eq!(im.recovery_len(), 12);
        assert_eq!(im.n_msgs(Order::Safe), 0);

        im.set_safe_seq(0, Seqno::new(3));
        im.set_safe_seq(1, Seqno::new(3));
        assert_eq!(im.safe_seq(), Seqno::NONE); // source 2 still at -1

        im.set_safe_seq(2, Seqno::new(3));
        assert_eq!(im.safe_seq(), Seqno::new(3));
        // recovery entries at or below the safe seqno are gone
        assert_eq!(im.recovery_len(), 0);
    }

    #[test]
    fn test_partial_safe_seq_keeps_tail() {
        let mut im = InputMap::new();
        im.reset(1, 16);

        for seq in 0..4 {
            im.insert(0, msg(seq, Order::Safe), Bytes::new());
            im.erase(0, Seqno::new(seq));
        }

        im.set_safe_seq(0, Seqno::new(1));
        assert_eq!(im.safe_seq(), Seqno::new(1));
        assert_eq!(im.recovery_len(), 2);

        // entries above the watermark are still recoverable
        let (m, _) = im.recover(0, Seqno::new(3));
        assert_eq!(m.seq, Seqno::new(3));
    }

    #[test]
    fn test_erased_message_not_reinserted() {
        let mut im = InputMap::new();
        im.reset(1, 16);

        im.insert(0, msg(0, Order::Safe), Bytes::new());
        im.erase(0, Seqno::new(0));

        im.insert(0, msg(1, Order::Safe), Bytes::new());
        let range = im.range(0);
        assert_eq!(range.lu(), Seqno::new(2));
    }

    #[test]
    fn test_min_max_hs() {
        let mut im = InputMap::new();
        im.reset(2, 16);

        im.insert(0, msg(0, Order::Safe), Bytes::new());
        im.insert(0, msg(1, Order::Safe), Bytes::new());
        im.insert(1, msg(0, Order::Safe), Bytes::new());

        assert_eq!(im.min_hs(), Seqno::new(0));
        assert_eq!(im.max_hs(), Seqno::new(1));
    }

    #[test]
    #[should_panic(expected = "aru seq")]
    fn test_insert_below_aru_panics() {
        let mut im = InputMap::new();
        im.reset(1, 16);
        im.insert(0, msg(0, Order::Safe), Bytes::new());
        // aru is now 0; inserting seq 0 again violates the precondition
        im.insert(0, msg(0, Order::Safe), Bytes::new());
    }

    #[test]
    #[should_panic(expected = "undelivered messages")]
    fn test_reset_with_live_messages_panics() {
        let mut im = InputMap::new();
        im.reset(1, 16);
        im.insert(0, msg(0, Order::Safe), Bytes::new());
        im.reset(2, 16);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut im = InputMap::new();
        im.reset(2, 16);
        im.insert(0, msg(0, Order::Safe), Bytes::new());
        im.clear();

        assert_eq!(im.aru_seq(), Seqno::NONE);
        assert_eq!(im.safe_seq(), Seqno::NONE);
        im.reset(1, 8);
        assert_eq!(im.range(0), Range::default());
    }

    #[test]
    fn proptest_aru_monotonic_and_bounded_by_safe() {
        use proptest::prelude::*;

        proptest!(|(seqs in proptest::collection::vec((0usize..3, 0i64..32), 1..100))| {
            let mut im = InputMap::new();
            im.reset(3, 32);
            let mut prev_aru = Seqno::NONE;

            for (src, seq) in seqs {
                let seq = Seqno::new(seq);
                let range = im.range(src);
                // respect insert preconditions, as the EVS layer does
                if im.aru_seq() < seq && range.lu() <= seq {
                    im.insert(src, UserMessage {
                        source: SourceId::ZERO,
                        view_id: ViewId::new(ViewType::Reg, SourceId::ZERO, 1),
                        seq,
                        aru_seq: Seqno::NONE,
                        seq_range: 0,
                        order: Order::Safe,
                    }, Bytes::new());
                }
                prop_assert!(im.aru_seq() >= prev_aru);
                prev_aru = im.aru_seq();
                prop_assert!(im.safe_seq() <= im.aru_seq());
            }
        });
    }
}
