// Registry of live endpoint sessions plus the readiness barrier.
//
// Sessions are keyed by peer IP address: an endpoint's control and data
// connections come from different ephemeral ports, and the data channel has
// to find its session by address alone. One session per address; a second
// control connection from an address that is already registered is refused.
//
// Mutation goes through `insert_if_absent` and `remove`. Removal needs the
// session id as well as the address, so a stale `Disconnected` event for an
// old connection can never remove the session that replaced it.
//
// The barrier (`wait_until_ready`) lets `play_music` hold off until every
// registered endpoint has attached a data channel. Waiters sleep on a
// `Condvar` paired with a generation counter; anything that can change the
// answer (insert, remove, data attach, data detach) calls `notify_changed`
// after it has finished mutating. The waiter evaluates `all_streaming` while
// holding the barrier mutex, so a change landing between the check and the
// wait is never missed. Lock order: barrier, then the session map.
//
// Session events from the control listeners are funneled through an `mpsc`
// channel into one dispatcher thread, which removes disconnected sessions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::endpoint::{EndpointSession, SessionEvent, SessionState};
use crate::error::{Error, Result};

/// One endpoint that failed during a broadcast step.
#[derive(Debug)]
pub struct EndpointFailure {
    pub addr: IpAddr,
    pub name: String,
    pub error: Error,
}

/// Outcome of applying one operation to every registered session.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub failures: Vec<EndpointFailure>,
}

impl BroadcastReport {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failures.len()
    }
}

pub struct Registry {
    sessions: RwLock<HashMap<IpAddr, Arc<EndpointSession>>>,
    generation: Mutex<u64>,
    changed: Condvar,
    events: Sender<SessionEvent>,
}

impl Registry {
    /// Create an empty registry and start its event dispatcher.
    pub fn new() -> Arc<Self> {
        let (events, inbox) = mpsc::channel();
        let registry = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            generation: Mutex::new(0),
            changed: Condvar::new(),
            events,
        });
        let weak = Arc::downgrade(&registry);
        thread::spawn(move || dispatch(weak, inbox));
        registry
    }

    /// Sender handed to new sessions for their lifecycle events.
    pub fn events(&self) -> Sender<SessionEvent> {
        self.events.clone()
    }

    /// Register `session` unless its address is taken by a live session.
    /// A registered session that has already disconnected is replaced.
    pub fn insert_if_absent(&self, session: Arc<EndpointSession>) -> bool {
        let inserted = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let taken = sessions
                .get(&session.addr())
                .is_some_and(|existing| existing.state() != SessionState::Disconnected);
            if taken || session.state() == SessionState::Disconnected {
                false
            } else {
                sessions.insert(session.addr(), session);
                true
            }
        };
        if inserted {
            self.notify_changed();
        }
        inserted
    }

    /// Remove the session at `addr` if it is the one with `id`.
    pub fn remove(&self, addr: IpAddr, id: u64) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            if sessions.get(&addr).is_some_and(|s| s.id() == id) {
                sessions.remove(&addr);
                true
            } else {
                false
            }
        };
        self.notify_changed();
        removed
    }

    pub fn get(&self, addr: IpAddr) -> Option<Arc<EndpointSession>> {
        self.read().get(&addr).cloned()
    }

    /// First session announced under `name`.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<EndpointSession>> {
        self.read()
            .values()
            .find(|s| s.name().as_deref() == Some(name))
            .cloned()
    }

    /// Display names of all registered endpoints, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.read().values().map(|s| s.display_name()).collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<EndpointSession>> {
        self.read().values().cloned().collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(&EndpointSession)) {
        for session in self.read().values() {
            f(session);
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// True when every registered session has a data channel. Vacuously
    /// true for an empty registry.
    pub fn all_streaming(&self) -> bool {
        self.read().values().all(|s| s.is_streaming())
    }

    /// Apply `op` to every session. Failures are collected, never
    /// short-circuited.
    pub fn broadcast(&self, op: impl Fn(&EndpointSession) -> Result<()>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for session in self.read().values() {
            report.attempted += 1;
            if let Err(error) = op(session) {
                report.failures.push(EndpointFailure {
                    addr: session.addr(),
                    name: session.display_name(),
                    error,
                });
            }
        }
        report
    }

    /// Wake barrier waiters so they re-check readiness.
    pub fn notify_changed(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Block until all registered sessions stream, or `timeout` elapses.
    /// Returns whether the registry became ready.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.wait_until_ready_or(timeout, || false)
    }

    /// Like `wait_until_ready`, but also gives up (returning `false`) as soon
    /// as `abort` returns true. `abort` is checked on every wakeup.
    pub fn wait_until_ready_or(&self, timeout: Duration, abort: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.all_streaming() {
                return true;
            }
            if abort() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            generation = self
                .changed
                .wait_timeout(generation, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<IpAddr, Arc<EndpointSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Announced { addr, name, .. } => {
                info!("{name} ({addr}) is ready");
            }
            SessionEvent::Disconnected { addr, id, name } => {
                if self.remove(addr, id) {
                    match name {
                        Some(name) => info!("{name} ({addr}) disconnected"),
                        None => info!("Endpoint {addr} disconnected"),
                    }
                }
            }
        }
    }
}

fn dispatch(registry: Weak<Registry>, inbox: Receiver<SessionEvent>) {
    for event in inbox {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.handle_event(event);
    }
}
