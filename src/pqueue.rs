//! Sequence-indexed priority queue with gap arithmetic.
//!
//! Items are keyed by their first sequence number and cover the half-open
//! range `[seq_no, seq_no + span)`. The queue tracks a `head` watermark (the
//! next sequence number owed to the consumer) and guarantees no two items
//! overlap. Out-of-order arrival, duplication and fragmentation fills are
//! resolved at insert time by clipping.

use std::collections::BTreeMap;

use crate::iobuf::IoBuf;
use crate::seq::{Gap, MsgId, SeqNo};

/// The unit of queuing: one message (or fragmentation fill) plus metadata.
pub struct Item {
    pub id: MsgId,
    pub buf: IoBuf,
    /// Number of consecutive sequence numbers this item represents. A span
    /// greater than one is a fragmentation fill covering the whole range.
    span: u64,
    /// Send-if-ready-else-drop marker. A no-queue item is never inserted
    /// into a `PQueue`; it is offered once to the sink and aborted if the
    /// link is not ready.
    pub no_queue: bool,
}

impl Item {
    pub fn new(id: MsgId, buf: IoBuf) -> Self {
        Self {
            id,
            buf,
            span: 1,
            no_queue: false,
        }
    }

    pub fn with_span(id: MsgId, buf: IoBuf, span: u64) -> Self {
        debug_assert!(span >= 1);
        Self {
            id,
            buf,
            span,
            no_queue: false,
        }
    }

    pub fn no_queue(id: MsgId, buf: IoBuf) -> Self {
        Self {
            id,
            buf,
            span: 1,
            no_queue: true,
        }
    }

    pub fn key(&self) -> SeqNo {
        self.id.seq_no
    }

    pub fn span(&self) -> u64 {
        self.span
    }

    pub fn end(&self) -> SeqNo {
        self.id.seq_no + self.span
    }

    /// Payload length. Distinct from `span`: a fill item may cover many
    /// sequence numbers with a short (or empty) payload.
    pub fn bytes(&self) -> usize {
        self.buf.len()
    }

    /// Drops `n` sequence numbers from the front of the item's range.
    ///
    /// Only the span is clipped; the payload is never trimmed. Callers that
    /// map payload bytes onto sequence numbers slice the payload themselves.
    fn clip_head(&mut self, n: u64) {
        debug_assert!(n < self.span);
        self.id.seq_no += n;
        self.span -= n;
    }

    /// Drops `n` sequence numbers from the back of the item's range. The
    /// payload is never trimmed.
    fn clip_tail(&mut self, n: u64) {
        debug_assert!(n < self.span);
        self.span -= n;
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("id", &self.id)
            .field("span", &self.span)
            .field("bytes", &self.bytes())
            .field("no_queue", &self.no_queue)
            .finish()
    }
}

/// Sequence-keyed queue of non-overlapping items.
pub struct PQueue {
    items: BTreeMap<SeqNo, Item>,
    head: SeqNo,
    seq_len: u64,
    bytes: u64,
}

impl PQueue {
    pub fn new(head: SeqNo) -> Self {
        Self {
            items: BTreeMap::new(),
            head,
            seq_len: 0,
            bytes: 0,
        }
    }

    /// Next sequence number owed to the consumer.
    pub fn head(&self) -> SeqNo {
        self.head
    }

    /// One past the highest covered sequence number, or `head` if empty.
    pub fn tail(&self) -> SeqNo {
        self.items
            .last_key_value()
            .map(|(_, item)| item.end())
            .unwrap_or(self.head)
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Total sequence numbers covered by queued items.
    pub fn seq_len(&self) -> u64 {
        self.seq_len
    }

    /// Total payload bytes queued.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts an item, clipping it against the head watermark and any
    /// overlapping items already queued. When the new item abuts existing
    /// data on both sides the head-side neighbour wins: the item is clipped
    /// at its head first, then at its tail. A fully covered item is dropped.
    ///
    /// Returns `true` if any part of the item was inserted.
    pub fn add(&mut self, mut item: Item) -> bool {
        if item.no_queue || item.span == 0 {
            return false;
        }

        // Clip below the head watermark.
        if item.key() < self.head {
            if item.end() <= self.head {
                return false;
            }
            item.clip_head(self.head - item.key());
        }

        // Head-side neighbours win: walk the covered run at the item's key,
        // clipping the head until the key is uncovered.
        while let Some(covering) = self.find(item.key()) {
            let covered_to = covering.end();
            if covered_to >= item.end() {
                return false;
            }
            item.clip_head(covered_to - item.key());
        }

        // Then clip the tail back to the first remaining successor.
        if let Some((&succ_key, _)) = self.items.range(item.key()..item.end()).next() {
            // succ_key > item.key(): nothing covers or starts at the key now.
            item.clip_tail(item.end() - succ_key);
        }

        self.seq_len += item.span;
        self.bytes += item.bytes() as u64;
        let replaced = self.items.insert(item.key(), item);
        debug_assert!(replaced.is_none());
        true
    }

    /// Removes and returns the item at `head`, advancing `head` by its span.
    /// Returns `None` when the head sequence number is missing (a gap) or
    /// the queue is empty.
    pub fn shift(&mut self) -> Option<Item> {
        let (&key, _) = self.items.first_key_value()?;
        if key != self.head {
            return None;
        }
        let item = self.items.remove(&key)?;
        self.head = item.end();
        self.seq_len -= item.span;
        self.bytes -= item.bytes() as u64;
        Some(item)
    }

    /// Force-advances `head` to `k`, discarding items wholly below `k` and
    /// clipping any item straddling it. `head` never moves backwards.
    pub fn set_head(&mut self, k: SeqNo) {
        let _ = self.drain_below(k);
    }

    /// Removes every item covering sequence numbers below `k` and advances
    /// `head` to `k`. An item straddling `k` is clipped at `k` and retained.
    /// Returns the removed items in sequence order.
    pub fn drain_below(&mut self, k: SeqNo) -> Vec<Item> {
        let mut removed = Vec::new();
        if k <= self.head {
            return removed;
        }
        loop {
            let Some((&key, _)) = self.items.first_key_value() else {
                break;
            };
            if key >= k {
                break;
            }
            let mut item = self.items.remove(&key).unwrap_or_else(|| unreachable!());
            self.seq_len -= item.span;
            self.bytes -= item.bytes() as u64;
            if item.end() > k {
                // Straddler: keep the part at and beyond k.
                item.clip_head(k - item.key());
                self.seq_len += item.span;
                self.bytes += item.bytes() as u64;
                self.items.insert(item.key(), item);
                break;
            }
            removed.push(item);
        }
        self.head = k;
        removed
    }

    /// Removes and returns the item whose range contains `k`, leaving a
    /// hole. The head watermark is unchanged.
    pub fn remove(&mut self, k: SeqNo) -> Option<Item> {
        let key = self.find(k)?.key();
        let item = self.items.remove(&key)?;
        self.seq_len -= item.span;
        self.bytes -= item.bytes() as u64;
        Some(item)
    }

    /// Removes every item whose key is at or beyond `k`, in sequence order.
    /// The head watermark is unchanged.
    pub fn drain_from(&mut self, k: SeqNo) -> Vec<Item> {
        let keys: Vec<SeqNo> = self.items.range(k..).map(|(&key, _)| key).collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = self.items.remove(&key) {
                self.seq_len -= item.span;
                self.bytes -= item.bytes() as u64;
                removed.push(item);
            }
        }
        removed
    }

    /// Locates the item whose range contains `k`.
    pub fn find(&self, k: SeqNo) -> Option<&Item> {
        let (_, item) = self.items.range(..=k).next_back()?;
        (item.end() > k).then_some(item)
    }

    /// Computes the contiguous missing range beginning at or covering `k`.
    ///
    /// If `k` is covered, the gap after the contiguous run containing `k` is
    /// returned. The empty gap means nothing is known to be missing: either
    /// the queue is contiguous from `k` to `tail`, or nothing is queued
    /// beyond `k` at all.
    pub fn gap(&self, k: SeqNo) -> Gap {
        let mut start = k.max(self.head);
        // Walk past the contiguous covered run beginning at or covering start.
        while let Some(item) = self.find(start) {
            start = item.end();
        }
        match self.items.range(start..).next() {
            Some((&next_key, _)) => Gap::new(start, next_key - start),
            None => Gap::empty(),
        }
    }

    /// Whether an item is queued exactly at the head watermark.
    pub fn head_ready(&self) -> bool {
        self.items
            .first_key_value()
            .is_some_and(|(&key, _)| key == self.head)
    }
}

impl std::fmt::Debug for PQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PQueue")
            .field("head", &self.head)
            .field("tail", &self.tail())
            .field("count", &self.count())
            .field("seq_len", &self.seq_len)
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(seq_no: SeqNo, span: u64) -> Item {
        Item::with_span(MsgId::new(1, seq_no), IoBuf::from_slice(b"x"), span)
    }

    fn queue_with(head: SeqNo, specs: &[(SeqNo, u64)]) -> PQueue {
        let mut q = PQueue::new(head);
        for &(seq, span) in specs {
            assert!(q.add(item(seq, span)));
        }
        q
    }

    #[test]
    fn shift_in_order() {
        let mut q = queue_with(1, &[(1, 1), (2, 1), (3, 1)]);
        assert_eq!(q.count(), 3);
        assert_eq!(q.seq_len(), 3);
        for expected in 1..=3 {
            let item = q.shift().expect("item at head");
            assert_eq!(item.key(), expected);
        }
        assert!(q.shift().is_none());
        assert_eq!(q.head(), 4);
    }

    #[test]
    fn shift_stops_at_gap() {
        let mut q = queue_with(1, &[(1, 1), (3, 1)]);
        assert!(q.shift().is_some());
        assert!(q.shift().is_none());
        assert_eq!(q.head(), 2);
        assert_eq!(q.gap(q.head()), Gap::new(2, 1));
    }

    #[test]
    fn fragmentation_span_advances_head() {
        // A fill item covering 10..13 into an empty queue with head 10.
        let mut q = PQueue::new(10);
        assert!(q.add(item(10, 3)));
        let shifted = q.shift().expect("item at head");
        assert_eq!(shifted.span(), 3);
        assert_eq!(q.head(), 13);
    }

    #[test]
    fn add_below_head_is_clipped_or_dropped() {
        let mut q = PQueue::new(10);
        assert!(!q.add(item(5, 3)));
        assert!(q.add(item(8, 5)));
        let it = q.find(10).expect("clipped item");
        assert_eq!(it.key(), 10);
        assert_eq!(it.span(), 3);
    }

    #[test]
    fn duplicate_is_dropped() {
        let mut q = queue_with(1, &[(1, 2)]);
        assert!(!q.add(item(1, 2)));
        assert!(!q.add(item(2, 1)));
        assert_eq!(q.count(), 1);
        assert_eq!(q.seq_len(), 2);
    }

    #[test]
    fn overlap_clips_head_side_first() {
        // Existing [10,12) and [14,16); new [11,15) must lose 11 (head side)
        // and 14 (tail side), leaving [12,14).
        let mut q = queue_with(10, &[(10, 2), (14, 2)]);
        assert!(q.add(item(11, 4)));
        let it = q.find(12).expect("clipped middle");
        assert_eq!(it.key(), 12);
        assert_eq!(it.span(), 2);
        assert_eq!(q.seq_len(), 6);
        assert!(q.gap(10).is_empty());
    }

    #[test]
    fn fully_covered_by_both_sides_is_dropped() {
        let mut q = queue_with(10, &[(10, 3)]);
        assert!(!q.add(item(11, 2)));
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn gap_at_head() {
        let q = queue_with(1, &[(5, 2), (9, 1)]);
        assert_eq!(q.gap(1), Gap::new(1, 4));
        // Covered at 5..7, missing run 7..9.
        assert_eq!(q.gap(5), Gap::new(7, 2));
        assert_eq!(q.gap(7), Gap::new(7, 2));
        // Nothing known beyond the last item.
        assert!(q.gap(9).is_empty());
        assert!(q.gap(20).is_empty());
    }

    #[test]
    fn set_head_discards_and_clips() {
        let mut q = queue_with(1, &[(1, 2), (4, 4)]);
        q.set_head(5);
        assert_eq!(q.head(), 5);
        assert_eq!(q.count(), 1);
        let it = q.find(5).expect("clipped straddler");
        assert_eq!(it.key(), 5);
        assert_eq!(it.span(), 3);
        // Head never moves backwards.
        q.set_head(2);
        assert_eq!(q.head(), 5);
    }

    #[test]
    fn drain_below_returns_items_in_order() {
        let mut q = queue_with(1, &[(1, 1), (2, 1), (3, 1), (7, 1)]);
        let drained = q.drain_below(4);
        let keys: Vec<SeqNo> = drained.iter().map(Item::key).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(q.head(), 4);
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn head_monotone_and_no_overlap_after_mixed_ops() {
        let mut q = PQueue::new(0);
        let mut last_head = q.head();
        for &(seq, span) in &[(0u64, 1u64), (5, 3), (2, 4), (1, 1), (8, 2), (3, 9)] {
            q.add(item(seq, span));
            assert!(q.head() >= last_head);
            last_head = q.head();
        }
        // Invariant: no two items overlap.
        let mut prev_end = 0;
        for (&key, it) in &q.items {
            assert!(key >= prev_end);
            assert!(key >= q.head());
            prev_end = it.end();
        }
        assert!(q.count() as u64 <= q.seq_len());
        // Everything 0..10 is covered; shift drains in order.
        let mut shifted = 0;
        while q.shift().is_some() {
            shifted += 1;
        }
        assert_eq!(q.head(), 12);
        assert!(shifted >= 4);
    }

    #[test]
    fn no_queue_item_is_rejected() {
        let mut q = PQueue::new(0);
        assert!(!q.add(Item::no_queue(MsgId::new(1, 0), IoBuf::new())));
        assert!(q.is_empty());
    }
}
