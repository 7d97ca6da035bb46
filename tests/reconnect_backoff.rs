//! Reconnect back-off: repeated connect failures space the attempts out by
//! the handler's interval schedule, and a success resets the counter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use seqlink::link::{Link, LinkHandler, LinkState};
use seqlink::sched::Scheduler;

const SHORT: Duration = Duration::from_millis(20);
const LONG: Duration = Duration::from_millis(120);

struct FlakyIo {
    attempts: Arc<AtomicU32>,
    attempt_times: Arc<Mutex<Vec<Instant>>>,
}

impl LinkHandler for FlakyIo {
    fn connect(&mut self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempt_times.lock().unwrap().push(Instant::now());
    }

    fn disconnect(&mut self) {}

    fn reconn_interval(&self, reconnects: u32) -> Duration {
        if reconnects < 3 {
            SHORT
        } else {
            LONG
        }
    }
}

fn wait_for_attempt(attempts: &Arc<AtomicU32>, n: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while attempts.load(Ordering::SeqCst) < n {
        assert!(Instant::now() < deadline, "attempt {n} never happened");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn backoff_schedule_follows_the_interval_function() {
    let _ = env_logger::builder().is_test(true).try_init();
    let sched = Arc::new(Scheduler::new("backoff-test").expect("scheduler"));
    let attempts = Arc::new(AtomicU32::new(0));
    let attempt_times = Arc::new(Mutex::new(Vec::new()));
    let io = FlakyIo {
        attempts: Arc::clone(&attempts),
        attempt_times: Arc::clone(&attempt_times),
    };
    let link = Link::new(1, io, sched, Arc::new(|_, _, _| {}));

    // Six attempts: the first immediate, the next three after the short
    // interval, the last two after the long one.
    link.up();
    for n in 1..=5u32 {
        wait_for_attempt(&attempts, n);
        link.connect_failed();
    }
    wait_for_attempt(&attempts, 6);

    let times = attempt_times.lock().unwrap();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps.len(), 5);
    // Short interval for back-offs 0..3, long for 3 and beyond. Upper
    // bounds stay loose for scheduler jitter.
    for gap in &gaps[..3] {
        assert!(*gap >= SHORT, "short back-off fired early: {gap:?}");
        assert!(*gap < LONG, "short back-off was long: {gap:?}");
    }
    for gap in &gaps[3..] {
        assert!(*gap >= LONG, "long back-off fired early: {gap:?}");
    }
}

#[test]
fn successful_connect_resets_the_backoff_counter() {
    let sched = Arc::new(Scheduler::new("backoff-reset").expect("scheduler"));
    let attempts = Arc::new(AtomicU32::new(0));
    let attempt_times = Arc::new(Mutex::new(Vec::new()));
    let io = FlakyIo {
        attempts: Arc::clone(&attempts),
        attempt_times: Arc::clone(&attempt_times),
    };
    let link = Link::new(1, io, sched, Arc::new(|_, _, _| {}));

    link.up();
    for n in 1..=4u32 {
        wait_for_attempt(&attempts, n);
        link.connect_failed();
    }
    // Back-off has escalated to the long interval by now.
    wait_for_attempt(&attempts, 5);
    link.connected();
    assert_eq!(link.state(), LinkState::Up);

    // Drop and fail again: the counter restarted, so the gap is short.
    link.disconnected();
    assert_eq!(link.state(), LinkState::ReconnectPending);
    let before = Instant::now();
    wait_for_attempt(&attempts, 6);
    let gap = before.elapsed();
    assert!(gap < LONG, "back-off did not reset: {gap:?}");
}
