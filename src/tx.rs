//! Transmit-side state machine: sequence assignment, drain, resend, archive.
//!
//! `Tx` assigns monotonically increasing sequence numbers, keeps sent items
//! queued until the peer's cumulative acknowledgement, and satisfies peer
//! re-requests from the live queue or, for already-archived ranges, through
//! the sink's `retrieve` hook. A `TxPool` fans items out round-robin over
//! member queues for publish-style distribution.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::pqueue::{Item, PQueue};
use crate::seq::{Gap, SeqNo};

/// Maximum pools any one queue may belong to.
pub const MAX_POOLS: usize = 8;

/// Application hooks driven by `Tx`. Static-dispatched; every hook runs on
/// the thread that drives the state machine.
pub trait TxSink {
    /// The item has been assigned its sequence number, before queuing.
    fn loaded(&mut self, item: &Item) {
        let _ = item;
    }

    /// Transmit an item. `more` hints that further items follow in this
    /// drain. Returning `false` is a recoverable transient (would-block);
    /// the drain stops and the owner reschedules.
    fn send(&mut self, item: &Item, more: bool) -> bool;

    /// Retransmit a queued item for a peer re-request.
    fn resend(&mut self, item: &Item) -> bool {
        self.send(item, false)
    }

    /// A re-requested range `[start, end)` has already been archived;
    /// retrieve and retransmit it from long-term storage.
    fn retrieve(&mut self, start: SeqNo, end: SeqNo);

    /// The peer acknowledged this item; move it to long-term storage.
    /// Called exactly once per item.
    fn archive(&mut self, item: Item);

    /// A no-queue item found the link unready, or an unsent item was
    /// aborted or reset away.
    fn aborted(&mut self, item: Item);
}

pub struct Tx<S: TxSink, C: Clock = SystemClock> {
    sink: S,
    clock: C,
    link_id: u32,
    /// Sent-but-unacknowledged (and not-yet-sent) items. `head` is the
    /// archive watermark: everything below it has been acknowledged.
    queue: PQueue,
    /// Next sequence number to assign.
    next_seq: SeqNo,
    /// Next sequence number to transmit.
    send_seq: SeqNo,
    ready: Option<u64>,
    /// Pools this queue currently belongs to.
    pools: usize,
}

impl<S: TxSink> Tx<S, SystemClock> {
    pub fn new(sink: S, link_id: u32, start: SeqNo) -> Self {
        Self::with_clock(sink, link_id, start, SystemClock)
    }
}

impl<S: TxSink, C: Clock> Tx<S, C> {
    /// Uses a custom timestamp source (e.g. TSC-based) for ready times.
    pub fn with_clock(sink: S, link_id: u32, start: SeqNo, clock: C) -> Self {
        Self {
            sink,
            clock,
            link_id,
            queue: PQueue::new(start),
            next_seq: start,
            send_seq: start,
            ready: None,
            pools: 0,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn link_id(&self) -> u32 {
        self.link_id
    }

    pub fn queue(&self) -> &PQueue {
        &self.queue
    }

    /// Next sequence number to be assigned.
    pub fn seq_no(&self) -> SeqNo {
        self.next_seq
    }

    /// Nanosecond timestamp since which the link has been ready, if it is.
    pub fn ready_since(&self) -> Option<u64> {
        self.ready
    }

    pub fn set_ready(&mut self) {
        if self.ready.is_none() {
            self.ready = Some(self.clock.now());
        }
    }

    pub fn set_unready(&mut self) {
        self.ready = None;
    }

    /// Accepts an item for transmission: assigns its sequence number and
    /// queues it. A no-queue item is never queued: it is offered to the
    /// sink once if the link is ready, and aborted otherwise.
    pub fn send(&mut self, mut item: Item) {
        if item.no_queue && self.ready.is_none() {
            trace!("tx {}: aborting no-queue item, link not ready", self.link_id);
            self.sink.aborted(item);
            return;
        }
        item.id.link_id = self.link_id;
        item.id.seq_no = self.next_seq;
        self.next_seq += item.span();
        self.sink.loaded(&item);
        if item.no_queue {
            // Send-if-ready-else-drop: offered once, never queued. The
            // drain skips its sequence hole.
            if !self.sink.send(&item, false) {
                self.sink.aborted(item);
            }
            return;
        }
        self.queue.add(item);
    }

    /// Drains queued items through the sink in sequence order. Returns
    /// `true` when everything queued has been offered; `false` on a
    /// transient failure (the owner reschedules the drain).
    pub fn drain(&mut self) -> bool {
        let tail = self.queue.tail();
        while self.send_seq < tail {
            let Some(item) = self.queue.find(self.send_seq) else {
                // Hole from an abort; skip to the next queued item.
                let gap = self.queue.gap(self.send_seq);
                self.send_seq = if gap.is_empty() { tail } else { gap.end() };
                continue;
            };
            let more = item.end() < tail;
            if !self.sink.send(item, more) {
                debug!("tx {}: transient send failure at {}", self.link_id, self.send_seq);
                return false;
            }
            self.send_seq = item.end();
        }
        true
    }

    /// Satisfies a peer re-request for `[start, end)`. Still-queued items
    /// are resent from the queue; ranges below the archive watermark are
    /// retrieved from storage. Returns `false` on a transient failure.
    pub fn resend(&mut self, start: SeqNo, end: SeqNo) -> bool {
        let end = end.min(self.next_seq);
        if start >= end {
            return true;
        }
        let archived_to = self.queue.head();
        if start < archived_to {
            self.sink.retrieve(start, end.min(archived_to));
        }
        let mut seq = start.max(archived_to);
        while seq < end {
            match self.queue.find(seq) {
                Some(item) => {
                    if !self.sink.resend(item) {
                        return false;
                    }
                    seq = item.end();
                }
                None => {
                    // Aborted hole or beyond the send cursor.
                    let gap = self.queue.gap(seq);
                    seq = if gap.is_empty() { end } else { gap.end().min(end) };
                }
            }
        }
        true
    }

    /// Satisfies a peer re-request expressed as a gap.
    pub fn resend_gap(&mut self, gap: Gap) -> bool {
        self.resend(gap.start, gap.end())
    }

    /// Peer cumulative acknowledgement: everything below `seq_no` is
    /// archived, exactly once per item, and released from the queue.
    pub fn ackd(&mut self, seq_no: SeqNo) {
        for item in self.queue.drain_below(seq_no.min(self.next_seq)) {
            self.sink.archive(item);
        }
        if self.send_seq < self.queue.head() {
            self.send_seq = self.queue.head();
        }
    }

    /// Aborts a not-yet-sent item, leaving a sequence hole.
    pub fn abort(&mut self, seq_no: SeqNo) {
        if seq_no < self.send_seq {
            return;
        }
        if let Some(item) = self.queue.remove(seq_no) {
            self.sink.aborted(item);
        }
    }

    /// Discards everything unsent and restarts sequencing at `seq_no`.
    /// Sent-but-unacknowledged items remain for retransmission.
    pub fn tx_reset(&mut self, seq_no: SeqNo) {
        for item in self.queue.drain_from(self.send_seq) {
            self.sink.aborted(item);
        }
        self.next_seq = seq_no;
        self.send_seq = seq_no.min(self.send_seq);
    }
}

/// Shared handle for a transmit queue that participates in pools.
pub type TxHandle<S> = Arc<Mutex<Tx<S>>>;

/// Fan-out pool: owns no messages of its own; each item offered to the pool
/// is forwarded into one ready member queue, chosen round-robin.
pub struct TxPool<S: TxSink> {
    members: Vec<TxHandle<S>>,
    next: usize,
}

impl<S: TxSink> Default for TxPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: TxSink> TxPool<S> {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Adds a member queue. A queue may belong to at most `MAX_POOLS`
    /// pools.
    pub fn join(&mut self, member: &TxHandle<S>) -> bool {
        {
            let mut tx = lock(member);
            if tx.pools >= MAX_POOLS {
                return false;
            }
            tx.pools += 1;
        }
        self.members.push(Arc::clone(member));
        true
    }

    pub fn leave(&mut self, member: &TxHandle<S>) {
        if let Some(index) = self
            .members
            .iter()
            .position(|m| Arc::ptr_eq(m, member))
        {
            let handle = self.members.remove(index);
            lock(&handle).pools -= 1;
            if self.next > index {
                self.next -= 1;
            }
        }
    }

    /// Pool readiness: the earliest ready time over the members, `None`
    /// when no member is ready.
    pub fn ready_since(&self) -> Option<u64> {
        self.members
            .iter()
            .filter_map(|m| lock(m).ready_since())
            .min()
    }

    /// Forwards an item to the next ready member, round-robin. Returns the
    /// item back when no member is ready.
    pub fn send(&mut self, item: Item) -> Result<(), Item> {
        let count = self.members.len();
        for probe in 0..count {
            let index = (self.next + probe) % count.max(1);
            let member = &self.members[index];
            let mut tx = lock(member);
            if tx.ready_since().is_some() {
                tx.send(item);
                self.next = (index + 1) % count;
                return Ok(());
            }
        }
        Err(item)
    }
}

fn lock<S: TxSink>(handle: &TxHandle<S>) -> MutexGuard<'_, Tx<S>> {
    handle.lock().unwrap_or_else(|e| e.into_inner())
}
