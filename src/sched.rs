//! Timer and work scheduling for Rx/Tx threads.
//!
//! A `Scheduler` owns one OS thread draining a deadline heap. Work posted
//! with `post` runs as soon as the thread is free; work scheduled with `run`
//! fires at its deadline. Cancellation is best-effort and idempotent: a
//! timer that already fired cancels to a no-op. Threads can be pinned to a
//! core for cache locality on hot paths.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Error, Result};

/// Handle for cancelling a scheduled timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

type Work = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    id: u64,
    work: Work,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops
        // first, ties broken by submission order.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Entry>,
    active: HashSet<u64>,
    cancelled: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
}

/// A single-threaded deadline-driven work queue.
pub struct Scheduler {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Scheduler {
    pub fn new(name: &str) -> Result<Self> {
        Self::with_affinity(name, None)
    }

    /// Spawns the scheduler thread, optionally pinned to `core`.
    pub fn with_affinity(name: &str, core: Option<usize>) -> Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            cv: Condvar::new(),
        });
        let thread_inner = Arc::clone(&inner);
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                if let Some(core) = core {
                    if !pin_current(core) {
                        warn!("scheduler {thread_name}: could not pin to core {core}");
                    }
                }
                run_loop(&thread_inner);
            })
            .map_err(Error::Io)?;
        Ok(Self {
            inner,
            handle: Some(handle),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `work` on the scheduler thread as soon as it is free.
    pub fn post(&self, work: impl FnOnce() + Send + 'static) {
        self.run_at(Instant::now(), work);
    }

    /// Runs `work` at `deadline`. Returns a token for `cancel`.
    pub fn run_at(&self, deadline: Instant, work: impl FnOnce() + Send + 'static) -> TimerToken {
        let mut state = lock(&self.inner.state);
        let id = state.next_id;
        state.next_id += 1;
        state.active.insert(id);
        state.heap.push(Entry {
            deadline,
            id,
            work: Box::new(work),
        });
        self.inner.cv.notify_one();
        TimerToken(id)
    }

    /// Runs `work` after `delay`.
    pub fn run_after(
        &self,
        delay: Duration,
        work: impl FnOnce() + Send + 'static,
    ) -> TimerToken {
        self.run_at(Instant::now() + delay, work)
    }

    /// Best-effort cancellation; idempotent, callable from any thread. A
    /// timer that already fired (or was cancelled) is left alone.
    pub fn cancel(&self, token: TimerToken) {
        let mut state = lock(&self.inner.state);
        if state.active.remove(&token.0) {
            state.cancelled.insert(token.0);
        }
    }

    /// Whether the timer is still pending.
    pub fn pending(&self, token: TimerToken) -> bool {
        lock(&self.inner.state).active.contains(&token.0)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        {
            let mut state = lock(&self.inner.state);
            state.shutdown = true;
        }
        self.inner.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(inner: &Inner) {
    let mut state = lock(&inner.state);
    loop {
        if state.shutdown {
            debug!("scheduler: shutting down with {} pending", state.heap.len());
            return;
        }
        let now = Instant::now();
        match state.heap.peek().map(|entry| entry.deadline) {
            None => {
                state = inner.cv.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            Some(deadline) if deadline > now => {
                state = inner
                    .cv
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
            Some(_) => {
                let entry = match state.heap.pop() {
                    Some(entry) => entry,
                    None => continue,
                };
                state.active.remove(&entry.id);
                if state.cancelled.remove(&entry.id) {
                    continue;
                }
                drop(state);
                (entry.work)();
                state = lock(&inner.state);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Pins the calling thread to a core, if the platform exposes it.
pub fn pin_current(core: usize) -> bool {
    match core_affinity::get_core_ids() {
        Some(ids) => ids
            .into_iter()
            .find(|id| id.id == core)
            .map(core_affinity::set_for_current)
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn post_runs_promptly() {
        let sched = Scheduler::new("test-sched").expect("scheduler");
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        sched.post(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while ran.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "posted work never ran");
            std::thread::yield_now();
        }
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let sched = Scheduler::new("test-order").expect("scheduler");
        let order = Arc::new(Mutex::new(Vec::new()));
        for (tag, delay_ms) in [(3u8, 30u64), (1, 10), (2, 20)] {
            let order = Arc::clone(&order);
            sched.run_after(Duration::from_millis(delay_ms), move || {
                lock(&order).push(tag);
            });
        }
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(*lock(&order), vec![1, 2, 3]);
    }

    #[test]
    fn cancel_is_best_effort_and_idempotent() {
        let sched = Scheduler::new("test-cancel").expect("scheduler");
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        let token = sched.run_after(Duration::from_millis(50), move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sched.pending(token));
        sched.cancel(token);
        sched.cancel(token);
        assert!(!sched.pending(token));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_fire_is_a_no_op() {
        let sched = Scheduler::new("test-late-cancel").expect("scheduler");
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        let token = sched.run_at(Instant::now(), move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while ran.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "timer never fired");
            std::thread::yield_now();
        }
        sched.cancel(token);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
