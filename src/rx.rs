//! Receive-side state machine: in-order delivery over a `PQueue`.
//!
//! Wire arrivals go through `received`, which files the item, detects gaps
//! and drives the re-request callbacks. Delivery is batched: `received`
//! marks a dequeue pending and the owning thread drains it with `dequeue`,
//! so a burst of arrivals costs one drain and one `idle_dequeue`. All
//! callbacks run on the caller's (Rx) thread; `process` is invoked in
//! strictly increasing sequence order.

use std::time::Duration;

use log::{debug, trace};

use crate::pqueue::{Item, PQueue};
use crate::seq::{Gap, SeqNo};

/// Application hooks driven by `Rx`. Implementations are static-dispatched;
/// every hook runs on the thread that drives the state machine.
pub trait RxHandler {
    /// An item has reached the head of the queue, in sequence order. An item
    /// spanning several sequence numbers is delivered once for its whole
    /// span.
    fn process(&mut self, item: Item);

    /// The dequeue drain ran dry (exhaustion or gap).
    fn idle_dequeue(&mut self) {}

    /// A gap was detected or changed shape. `prev` is the previously known
    /// gap (empty on first detection), `now` the current one. Typically
    /// sends a re-request upstream.
    fn request(&mut self, prev: Gap, now: Gap);

    /// Periodic reminder that `now` is still outstanding, driven by the
    /// owner's re-request timer.
    fn re_request(&mut self, now: Gap);
}

/// Receive-side state machine over a sequence-keyed queue.
pub struct Rx<H: RxHandler> {
    handler: H,
    queue: PQueue,
    /// Outstanding gap being re-requested; empty when contiguous.
    gap: Gap,
    /// Snapshot recovery: enqueue but do not deliver.
    queuing: bool,
    dequeue_pending: bool,
    re_req_interval: Duration,
}

impl<H: RxHandler> Rx<H> {
    pub fn new(handler: H, start: SeqNo, re_req_interval: Duration) -> Self {
        Self {
            handler,
            queue: PQueue::new(start),
            gap: Gap::empty(),
            queuing: false,
            dequeue_pending: false,
            re_req_interval,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn queue(&self) -> &PQueue {
        &self.queue
    }

    /// The gap currently outstanding, if any. The owner cancels its
    /// re-request timer when this turns empty.
    pub fn gap(&self) -> Gap {
        self.gap
    }

    /// Interval at which the owner should tick `re_request` while a gap
    /// persists.
    pub fn re_req_interval(&self) -> Duration {
        self.re_req_interval
    }

    /// Files an arrival. Fires `request` when the head gap appears or
    /// changes; marks a dequeue pending when the head became deliverable.
    pub fn received(&mut self, item: Item) {
        trace!("rx: received {} span {}", item.id, item.span());
        self.queue.add(item);

        let prev = self.gap;
        let now = self.queue.gap(self.queue.head());
        self.gap = now;
        if now.is_empty() {
            if !prev.is_empty() {
                debug!("rx: gap {prev} closed");
            }
        } else if prev != now {
            self.handler.request(prev, now);
        }

        if !self.queuing && self.queue.head_ready() {
            self.dequeue_pending = true;
        }
    }

    /// Whether a drain is owed. The owner typically posts `dequeue` to the
    /// Rx thread when this flips true.
    pub fn dequeue_pending(&self) -> bool {
        self.dequeue_pending
    }

    /// Drains deliverable items in sequence order, then reports idle once.
    pub fn dequeue(&mut self) {
        if self.queuing {
            return;
        }
        self.dequeue_pending = false;
        while let Some(item) = self.queue.shift() {
            self.handler.process(item);
        }
        self.handler.idle_dequeue();
    }

    /// Re-request timer tick: reminds the handler of a persisting gap.
    /// Returns `false` when no gap remains (the owner stops the timer).
    pub fn re_request_tick(&mut self) -> bool {
        if self.gap.is_empty() {
            return false;
        }
        self.handler.re_request(self.gap);
        true
    }

    /// Enters snapshot recovery: arrivals are enqueued but not delivered.
    pub fn start_queuing(&mut self) {
        self.queuing = true;
        self.dequeue_pending = false;
    }

    /// Leaves snapshot recovery: the head is advanced to `seq_no`
    /// (discarding anything the snapshot superseded) and normal dequeue
    /// resumes.
    pub fn stop_queuing(&mut self, seq_no: SeqNo) {
        self.queuing = false;
        self.queue.set_head(seq_no);
        self.gap = self.queue.gap(self.queue.head());
        if self.queue.head_ready() {
            self.dequeue_pending = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iobuf::IoBuf;
    use crate::seq::MsgId;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Process(SeqNo, u64),
        Idle,
        Request(Gap, Gap),
        ReRequest(Gap),
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
    }

    impl RxHandler for Recorder {
        fn process(&mut self, item: Item) {
            self.events.push(Event::Process(item.key(), item.span()));
        }

        fn idle_dequeue(&mut self) {
            self.events.push(Event::Idle);
        }

        fn request(&mut self, prev: Gap, now: Gap) {
            self.events.push(Event::Request(prev, now));
        }

        fn re_request(&mut self, now: Gap) {
            self.events.push(Event::ReRequest(now));
        }
    }

    fn item(seq_no: SeqNo) -> Item {
        Item::new(MsgId::new(7, seq_no), IoBuf::from_slice(b"m"))
    }

    fn rx(start: SeqNo) -> Rx<Recorder> {
        Rx::new(Recorder::default(), start, Duration::from_millis(100))
    }

    #[test]
    fn ordered_delivery_with_one_idle() {
        let mut rx = rx(1);
        for seq in 1..=3 {
            rx.received(item(seq));
        }
        assert!(rx.dequeue_pending());
        rx.dequeue();
        assert_eq!(
            rx.handler().events,
            vec![
                Event::Process(1, 1),
                Event::Process(2, 1),
                Event::Process(3, 1),
                Event::Idle,
            ]
        );
    }

    #[test]
    fn gap_then_fill() {
        let mut rx = rx(1);
        rx.received(item(1));
        rx.received(item(3));
        rx.dequeue();
        assert_eq!(
            rx.handler().events,
            vec![
                Event::Request(Gap::empty(), Gap::new(2, 1)),
                Event::Process(1, 1),
                Event::Idle,
            ]
        );
        assert_eq!(rx.gap(), Gap::new(2, 1));

        rx.received(item(2));
        assert!(rx.gap().is_empty());
        rx.dequeue();
        assert_eq!(
            rx.handler().events[3..],
            [Event::Process(2, 1), Event::Process(3, 1), Event::Idle]
        );
    }

    #[test]
    fn growing_gap_re_requests_with_previous_shape() {
        let mut rx = rx(1);
        rx.received(item(3));
        rx.received(item(6));
        assert_eq!(
            rx.handler().events,
            vec![
                Event::Request(Gap::empty(), Gap::new(1, 2)),
                // The head gap is unchanged by 6; no second request.
            ]
        );
        // Fill the head; the next missing run becomes the gap.
        rx.received(item(1));
        rx.received(item(2));
        rx.dequeue();
        assert_eq!(rx.gap(), Gap::new(4, 2));
    }

    #[test]
    fn re_request_ticks_until_gap_closes() {
        let mut rx = rx(1);
        rx.received(item(2));
        assert!(rx.re_request_tick());
        assert!(rx.re_request_tick());
        rx.received(item(1));
        assert!(!rx.re_request_tick());
        let re_requests: Vec<&Event> = rx
            .handler()
            .events
            .iter()
            .filter(|e| matches!(e, Event::ReRequest(_)))
            .collect();
        assert_eq!(re_requests.len(), 2);
    }

    #[test]
    fn fragmentation_fill_delivers_once() {
        let mut rx = rx(10);
        rx.received(Item::with_span(
            MsgId::new(7, 10),
            IoBuf::from_slice(b"fill"),
            3,
        ));
        rx.dequeue();
        assert_eq!(
            rx.handler().events,
            vec![Event::Process(10, 3), Event::Idle]
        );
        assert_eq!(rx.queue().head(), 13);
    }

    #[test]
    fn snapshot_queuing_defers_delivery() {
        let mut rx = rx(1);
        rx.start_queuing();
        for seq in 1..=5 {
            rx.received(item(seq));
        }
        rx.dequeue();
        assert!(rx.handler().events.is_empty());

        // Snapshot covered up to 3; deliver from 4.
        rx.stop_queuing(4);
        assert!(rx.dequeue_pending());
        rx.dequeue();
        assert_eq!(
            rx.handler().events,
            vec![Event::Process(4, 1), Event::Process(5, 1), Event::Idle]
        );
    }
}
