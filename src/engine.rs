//! Engine: registry and lifecycle coordinator for links on shared Rx/Tx
//! threads.
//!
//! The engine owns its links, aggregates their states into counters, and
//! sequences start/stop sweeps. Counter updates happen in the state-change
//! observer under one engine-level lock; sweeps never hold that lock while
//! driving a link, so link callbacks can re-enter the observer freely.
//! Crossing intents (a `start` during a stop) park in the pending states
//! and the finishing sweep kicks off the opposite one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{error, info};
use thiserror::Error as ThisError;

use crate::error::Error;
use crate::link::{Link, LinkHandler, LinkState, StateObserver};
use crate::sched::Scheduler;

#[derive(Debug, ThisError)]
pub enum EngineError {
    #[error("engine is not running")]
    NotRunning,
    #[error("duplicate link id {0}")]
    DuplicateLink(u32),
    #[error("unknown link id {0}")]
    UnknownLink(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Finishing a stop, then starting.
    StartPending,
    /// Finishing a start, then stopping.
    StopPending,
}

/// Per-state link counters. The buckets always sum to the number of
/// non-deleted links.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub down: usize,
    pub disabled: usize,
    pub transient: usize,
    pub up: usize,
    pub reconn: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.down + self.disabled + self.transient + self.up + self.reconn + self.failed
    }

    fn bucket(&mut self, state: LinkState) -> Option<&mut usize> {
        match state {
            LinkState::Down => Some(&mut self.down),
            LinkState::Disabled => Some(&mut self.disabled),
            LinkState::Up => Some(&mut self.up),
            LinkState::Failed => Some(&mut self.failed),
            LinkState::Deleted => None,
            s if s.transient() => Some(&mut self.transient),
            _ => Some(&mut self.reconn),
        }
    }

    fn apply(&mut self, prev: LinkState, next: LinkState) {
        if let Some(bucket) = self.bucket(prev) {
            *bucket -= 1;
        }
        if let Some(bucket) = self.bucket(next) {
            *bucket += 1;
        }
    }

    /// Start is complete: nothing left down or in flight.
    fn ready_to_run(&self) -> bool {
        self.down + self.transient == 0
    }

    /// Stop is complete: nothing left up or in flight.
    fn ready_to_stop(&self) -> bool {
        self.up + self.transient == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub name: String,
    /// Core to pin the Rx thread to, if any.
    pub rx_core: Option<usize>,
    /// Core to pin the Tx thread to, if any.
    pub tx_core: Option<usize>,
}

pub type ExceptionFn = Arc<dyn Fn(&Error) + Send + Sync>;

struct Inner {
    state: EngineState,
    counts: StateCounts,
}

struct Shared<H: LinkHandler> {
    inner: Mutex<Inner>,
    links: Mutex<HashMap<u32, Link<H>>>,
    rx: Arc<Scheduler>,
    app_exception: Mutex<Option<ExceptionFn>>,
}

/// Registry of links sharing an Rx thread and a Tx thread.
pub struct Engine<H: LinkHandler> {
    shared: Arc<Shared<H>>,
    rx: Arc<Scheduler>,
    tx: Arc<Scheduler>,
}

impl<H: LinkHandler> Engine<H> {
    pub fn new(config: EngineConfig) -> crate::error::Result<Self> {
        let name = if config.name.is_empty() {
            "engine".to_string()
        } else {
            config.name
        };
        let rx = Arc::new(Scheduler::with_affinity(
            &format!("{name}-rx"),
            config.rx_core,
        )?);
        let tx = Arc::new(Scheduler::with_affinity(
            &format!("{name}-tx"),
            config.tx_core,
        )?);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: EngineState::Stopped,
                counts: StateCounts::default(),
            }),
            links: Mutex::new(HashMap::new()),
            rx: Arc::clone(&rx),
            app_exception: Mutex::new(None),
        });
        Ok(Self { shared, rx, tx })
    }

    /// The Rx thread: all operations touching a link's receive state are
    /// posted here.
    pub fn rx(&self) -> &Arc<Scheduler> {
        &self.rx
    }

    /// The Tx thread: all operations touching a link's transmit state are
    /// posted here.
    pub fn tx(&self) -> &Arc<Scheduler> {
        &self.tx
    }

    pub fn state(&self) -> EngineState {
        lock(&self.shared.inner).state
    }

    pub fn counts(&self) -> StateCounts {
        lock(&self.shared.inner).counts
    }

    pub fn link_count(&self) -> usize {
        lock(&self.shared.links).len()
    }

    /// Delegate for errors surfaced from Rx/Tx threads; they are reported
    /// here instead of unwinding into application code.
    pub fn set_app_exception(&self, f: ExceptionFn) {
        *lock(&self.shared.app_exception) = Some(f);
    }

    pub fn app_exception(&self, err: &Error) {
        Shared::report(&self.shared, err);
    }

    /// Creates a link owned by this engine. The link starts `Down` and is
    /// driven by `start`/`up_link`.
    pub fn add_link(&self, id: u32, handler: H) -> Result<Link<H>, EngineError> {
        let mut links = lock(&self.shared.links);
        if links.contains_key(&id) {
            return Err(EngineError::DuplicateLink(id));
        }
        let observer = self.observer();
        let link = Link::new(id, handler, Arc::clone(&self.rx), observer);
        links.insert(id, link.clone());
        let mut inner = lock(&self.shared.inner);
        inner.counts.down += 1;
        Ok(link)
    }

    pub fn link(&self, id: u32) -> Result<Link<H>, EngineError> {
        lock(&self.shared.links)
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownLink(id))
    }

    /// Removes a link. Counter bookkeeping happens through the observer's
    /// `Deleted` transition.
    pub fn del_link(&self, id: u32) -> Result<(), EngineError> {
        let link = {
            let mut links = lock(&self.shared.links);
            links.remove(&id).ok_or(EngineError::UnknownLink(id))?
        };
        link.delete();
        Ok(())
    }

    pub fn up_link(&self, id: u32) -> Result<(), EngineError> {
        let state = self.state();
        if !matches!(state, EngineState::Running | EngineState::Starting) {
            return Err(EngineError::NotRunning);
        }
        self.link(id)?.up();
        Ok(())
    }

    pub fn down_link(&self, id: u32, disable: bool) -> Result<(), EngineError> {
        self.link(id)?.down(disable);
        Ok(())
    }

    /// Starts the engine: every `Down`/`Failed`/`Disabled` link is driven
    /// into `Connecting`. A start issued mid-stop parks until the stop
    /// completes.
    pub fn start(&self) {
        {
            let mut inner = lock(&self.shared.inner);
            match inner.state {
                EngineState::Stopped => inner.state = EngineState::Starting,
                EngineState::Stopping => {
                    inner.state = EngineState::StartPending;
                    return;
                }
                EngineState::StopPending => {
                    inner.state = EngineState::Starting;
                    return;
                }
                _ => return,
            }
        }
        info!("engine: starting");
        Shared::sweep_up(&self.shared);
        Shared::advance(&self.shared);
    }

    /// Stops the engine: every link not already down is driven toward
    /// `Down`. A stop issued mid-start parks until the start completes.
    pub fn stop(&self) {
        {
            let mut inner = lock(&self.shared.inner);
            match inner.state {
                EngineState::Running => inner.state = EngineState::Stopping,
                EngineState::Starting => {
                    inner.state = EngineState::StopPending;
                    return;
                }
                EngineState::StartPending => {
                    inner.state = EngineState::Stopping;
                    return;
                }
                _ => return,
            }
        }
        info!("engine: stopping");
        Shared::sweep_down(&self.shared);
        Shared::advance(&self.shared);
    }

    fn observer(&self) -> StateObserver {
        let weak: Weak<Shared<H>> = Arc::downgrade(&self.shared);
        Arc::new(move |id, prev, next| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut inner = lock(&shared.inner);
                inner.counts.apply(prev, next);
            }
            if next == LinkState::Failed {
                log::warn!("engine: link {id} failed ({prev:?} -> {next:?})");
                Shared::report(&shared, &Error::Unsupported("link failed"));
            }
            Shared::advance(&shared);
        })
    }
}

impl<H: LinkHandler> Shared<H> {
    fn sweep_up(shared: &Arc<Self>) {
        let links: Vec<Link<H>> = lock(&shared.links).values().cloned().collect();
        for link in links {
            if link.state().startable() {
                link.up();
            }
        }
    }

    fn sweep_down(shared: &Arc<Self>) {
        let links: Vec<Link<H>> = lock(&shared.links).values().cloned().collect();
        for link in links {
            if !matches!(
                link.state(),
                LinkState::Down | LinkState::Disabled | LinkState::Deleted
            ) {
                link.down(false);
            }
        }
    }

    /// Applies the engine-level state rules and kicks the opposite sweep
    /// when a pending intent unblocks. Sweeps run on the Rx thread so the
    /// caller (possibly a link observer) never re-enters a link.
    fn advance(shared: &Arc<Self>) {
        let action = {
            let mut inner = lock(&shared.inner);
            match inner.state {
                EngineState::Starting if inner.counts.ready_to_run() => {
                    inner.state = EngineState::Running;
                    info!("engine: running");
                    None
                }
                EngineState::StopPending if inner.counts.ready_to_run() => {
                    inner.state = EngineState::Stopping;
                    Some(Sweep::Down)
                }
                EngineState::Stopping if inner.counts.ready_to_stop() => {
                    inner.state = EngineState::Stopped;
                    info!("engine: stopped");
                    None
                }
                EngineState::StartPending if inner.counts.ready_to_stop() => {
                    inner.state = EngineState::Starting;
                    Some(Sweep::Up)
                }
                _ => None,
            }
        };
        if let Some(sweep) = action {
            let weak = Arc::downgrade(shared);
            shared.rx.post(move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match sweep {
                    Sweep::Up => Shared::sweep_up(&shared),
                    Sweep::Down => Shared::sweep_down(&shared),
                }
                Shared::advance(&shared);
            });
        }
    }

    fn report(shared: &Arc<Self>, err: &Error) {
        let delegate = lock(&shared.app_exception).clone();
        match delegate {
            Some(f) => f(err),
            None => error!("engine: {err}"),
        }
    }
}

#[derive(Clone, Copy)]
enum Sweep {
    Up,
    Down,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
