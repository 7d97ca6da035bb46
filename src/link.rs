//! Link lifecycle: a reconnecting connection with Rx and Tx state.
//!
//! The state machine below is the authority on connection intent. The
//! handler performs the actual connect/disconnect I/O and reports completion
//! back through `connected` / `connect_failed` / `disconnected`; crossing
//! intents (an `up` while disconnecting, a `down` while connecting) park in
//! the pending states until the in-flight operation resolves. Every state
//! change is reported to the observer exactly once.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};

use crate::sched::{Scheduler, TimerToken};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    Down,
    Disabled,
    Connecting,
    Disconnecting,
    /// Disconnecting, with intent to connect once down.
    ConnectPending,
    /// Connecting, with intent to disconnect once the attempt resolves.
    DisconnectPending,
    Up,
    /// Waiting out the reconnect interval.
    ReconnectPending,
    Reconnecting,
    Failed,
    Deleted,
}

impl LinkState {
    /// A short-lived state between stable ones.
    pub fn transient(self) -> bool {
        matches!(
            self,
            LinkState::Connecting
                | LinkState::Disconnecting
                | LinkState::ConnectPending
                | LinkState::DisconnectPending
        )
    }

    pub fn reconnecting(self) -> bool {
        matches!(self, LinkState::ReconnectPending | LinkState::Reconnecting)
    }

    /// Whether the link is eligible for `up()` from a cold start.
    pub fn startable(self) -> bool {
        matches!(
            self,
            LinkState::Down | LinkState::Failed | LinkState::Disabled
        )
    }
}

/// Connection I/O driven by the link state machine. `connect` and
/// `disconnect` initiate; completion is reported back on the link.
pub trait LinkHandler: Send + 'static {
    fn connect(&mut self);
    fn disconnect(&mut self);

    /// Back-off before reconnect attempt `reconnects` (0-based; the counter
    /// resets on a successful connect).
    fn reconn_interval(&self, reconnects: u32) -> Duration {
        let _ = reconnects;
        Duration::from_secs(1)
    }
}

/// Exactly-once state-change notification, implemented by the engine.
pub type StateObserver = Arc<dyn Fn(u32, LinkState, LinkState) + Send + Sync>;

struct Core<H: LinkHandler> {
    id: u32,
    handler: H,
    state: LinkState,
    reconnects: u32,
    reconnect_timer: Option<TimerToken>,
    /// `down(disable=true)` parks the link in `Disabled` once down.
    disable_on_down: bool,
}

/// A shared, reconnecting link. Clones refer to the same link.
pub struct Link<H: LinkHandler> {
    core: Arc<Mutex<Core<H>>>,
    sched: Arc<Scheduler>,
    observer: StateObserver,
}

impl<H: LinkHandler> Clone for Link<H> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            sched: Arc::clone(&self.sched),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<H: LinkHandler> Link<H> {
    pub fn new(id: u32, handler: H, sched: Arc<Scheduler>, observer: StateObserver) -> Self {
        Self {
            core: Arc::new(Mutex::new(Core {
                id,
                handler,
                state: LinkState::Down,
                reconnects: 0,
                reconnect_timer: None,
                disable_on_down: false,
            })),
            sched,
            observer,
        }
    }

    pub fn id(&self) -> u32 {
        lock(&self.core).id
    }

    pub fn state(&self) -> LinkState {
        lock(&self.core).state
    }

    /// Exposes the handler under the link lock.
    pub fn with_handler<T>(&self, f: impl FnOnce(&mut H) -> T) -> T {
        f(&mut lock(&self.core).handler)
    }

    /// Brings the link up. From a stable down-side state this starts a
    /// connect; while disconnecting it parks in `ConnectPending`; during
    /// reconnect back-off it connects immediately.
    pub fn up(&self) {
        let mut core = lock(&self.core);
        core.disable_on_down = false;
        match core.state {
            LinkState::Down | LinkState::Failed | LinkState::Disabled => {
                self.set_state(&mut core, LinkState::Connecting);
                core.handler.connect();
            }
            LinkState::Disconnecting => {
                self.set_state(&mut core, LinkState::ConnectPending);
            }
            LinkState::ReconnectPending => {
                self.cancel_reconnect(&mut core);
                self.set_state(&mut core, LinkState::Reconnecting);
                core.handler.connect();
            }
            LinkState::DisconnectPending => {
                // Connect already in flight; restore the original intent.
                self.set_state(&mut core, LinkState::Connecting);
            }
            _ => {}
        }
    }

    /// Takes the link down; `disable` parks it in `Disabled` instead of
    /// `Down`. A disconnect during a pending reconnect cancels the timer
    /// atomically with the transition.
    pub fn down(&self, disable: bool) {
        let mut core = lock(&self.core);
        core.disable_on_down = disable;
        match core.state {
            LinkState::Up | LinkState::Reconnecting => {
                self.set_state(&mut core, LinkState::Disconnecting);
                core.handler.disconnect();
            }
            LinkState::Connecting => {
                self.set_state(&mut core, LinkState::DisconnectPending);
            }
            LinkState::ConnectPending => {
                self.set_state(&mut core, LinkState::Disconnecting);
            }
            LinkState::ReconnectPending => {
                self.cancel_reconnect(&mut core);
                let next = down_state(disable);
                self.set_state(&mut core, next);
            }
            LinkState::Down | LinkState::Failed => {
                if disable {
                    self.set_state(&mut core, LinkState::Disabled);
                }
            }
            _ => {}
        }
    }

    /// Handler report: the connect attempt succeeded.
    pub fn connected(&self) {
        let mut core = lock(&self.core);
        match core.state {
            LinkState::Connecting | LinkState::Reconnecting => {
                core.reconnects = 0;
                self.set_state(&mut core, LinkState::Up);
            }
            LinkState::DisconnectPending => {
                self.set_state(&mut core, LinkState::Disconnecting);
                core.handler.disconnect();
            }
            _ => {}
        }
    }

    /// Handler report: the connect attempt failed. Schedules the next
    /// attempt after `reconn_interval(reconnects)`.
    pub fn connect_failed(&self) {
        let mut core = lock(&self.core);
        match core.state {
            LinkState::Connecting | LinkState::Reconnecting => {
                self.set_state(&mut core, LinkState::ReconnectPending);
                self.schedule_reconnect(&mut core);
            }
            LinkState::DisconnectPending => {
                let next = down_state(core.disable_on_down);
                self.set_state(&mut core, next);
            }
            _ => {}
        }
    }

    /// Handler report: the connection is gone (completed disconnect or a
    /// peer drop).
    pub fn disconnected(&self) {
        let mut core = lock(&self.core);
        match core.state {
            LinkState::Disconnecting => {
                let next = down_state(core.disable_on_down);
                self.set_state(&mut core, next);
            }
            LinkState::ConnectPending => {
                self.set_state(&mut core, LinkState::Connecting);
                core.handler.connect();
            }
            LinkState::Up => {
                // Peer dropped us: reconnect after back-off.
                self.set_state(&mut core, LinkState::ReconnectPending);
                self.schedule_reconnect(&mut core);
            }
            _ => {}
        }
    }

    /// Deliberate bounce: drop the connection and re-establish it after the
    /// back-off interval.
    pub fn reconnect(&self) {
        let mut core = lock(&self.core);
        if core.state != LinkState::Up {
            return;
        }
        self.set_state(&mut core, LinkState::ReconnectPending);
        core.handler.disconnect();
        self.schedule_reconnect(&mut core);
    }

    /// Escalation: the link is driven to `Failed` (persistent gap, send
    /// failure, corruption). Only `up()` leaves this state.
    pub fn fail(&self) {
        let mut core = lock(&self.core);
        if core.state == LinkState::Deleted || core.state == LinkState::Failed {
            return;
        }
        self.cancel_reconnect(&mut core);
        self.set_state(&mut core, LinkState::Failed);
    }

    /// Terminal removal.
    pub fn delete(&self) {
        let mut core = lock(&self.core);
        if core.state == LinkState::Deleted {
            return;
        }
        self.cancel_reconnect(&mut core);
        self.set_state(&mut core, LinkState::Deleted);
    }

    fn schedule_reconnect(&self, core: &mut MutexGuard<'_, Core<H>>) {
        let attempt = core.reconnects;
        core.reconnects += 1;
        let interval = core.handler.reconn_interval(attempt);
        debug!(
            "link {}: reconnect attempt {} in {:?}",
            core.id, attempt, interval
        );
        let link = self.clone();
        core.reconnect_timer = Some(self.sched.run_after(interval, move || {
            link.reconnect_due();
        }));
    }

    fn cancel_reconnect(&self, core: &mut MutexGuard<'_, Core<H>>) {
        if let Some(token) = core.reconnect_timer.take() {
            self.sched.cancel(token);
        }
    }

    fn reconnect_due(&self) {
        let mut core = lock(&self.core);
        core.reconnect_timer = None;
        if core.state != LinkState::ReconnectPending {
            return;
        }
        self.set_state(&mut core, LinkState::Reconnecting);
        core.handler.connect();
    }

    fn set_state(&self, core: &mut MutexGuard<'_, Core<H>>, next: LinkState) {
        let prev = core.state;
        if prev == next {
            return;
        }
        core.state = next;
        info!("link {}: {prev:?} -> {next:?}", core.id);
        (self.observer)(core.id, prev, next);
    }
}

fn down_state(disable: bool) -> LinkState {
    if disable {
        LinkState::Disabled
    } else {
        LinkState::Down
    }
}

fn lock<H: LinkHandler>(core: &Arc<Mutex<Core<H>>>) -> MutexGuard<'_, Core<H>> {
    core.lock().unwrap_or_else(|e| e.into_inner())
}
