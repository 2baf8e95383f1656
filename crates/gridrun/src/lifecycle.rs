//! # Lifecycle Service
//!
//! A small forward-only state machine (`Starting → Started → ShuttingDown →
//! Shutdown`) that broadcasts every transition, plus connection and membership
//! events raised by the other services, to registered listeners.
//!
//! ## Invariants
//!
//! - A transition is applied only if it is exactly one step forward from the
//!   current state; anything else is rejected and nobody is notified.
//! - Listeners run synchronously, in registration order, outside of any lock.
//! - A panicking listener is logged and skipped; it cannot stop the others or
//!   corrupt the state.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::Address;
use crate::address::Member;
use crate::config::LifecycleListener;

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Started,
    ShuttingDown,
    Shutdown,
}

impl LifecycleState {
    /// The only state reachable from `current` (`None` means not yet starting).
    fn successor(current: Option<Self>) -> Option<Self> {
        match current {
            None => Some(Self::Starting),
            Some(Self::Starting) => Some(Self::Started),
            Some(Self::Started) => Some(Self::ShuttingDown),
            Some(Self::ShuttingDown) => Some(Self::Shutdown),
            Some(Self::Shutdown) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Starting,
    Started,
    ShuttingDown,
    Shutdown,
    /// A member answered heartbeats again after being marked stopped.
    Connected(Address),
    /// A member stopped answering heartbeats or its connection dropped.
    Disconnected(Address),
    MemberAdded(Member),
    MemberRemoved(Member),
}

impl From<LifecycleState> for LifecycleEvent {
    fn from(state: LifecycleState) -> Self {
        match state {
            LifecycleState::Starting => Self::Starting,
            LifecycleState::Started => Self::Started,
            LifecycleState::ShuttingDown => Self::ShuttingDown,
            LifecycleState::Shutdown => Self::Shutdown,
        }
    }
}

/// Handle returned by `add_listener`, used to remove the listener again.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ListenerId(pub u64);

pub struct LifecycleService {
    state: Mutex<Option<LifecycleState>>,
    listeners: Mutex<Vec<(ListenerId, LifecycleListener)>>,
    next_listener_id: AtomicU64,
}

impl LifecycleService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// The current state, `None` before `Starting` has been fired.
    pub fn state(&self) -> Option<LifecycleState> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True only while in `Started`.
    pub fn is_live(&self) -> bool {
        self.state() == Some(LifecycleState::Started)
    }

    pub fn add_listener(&self, listener: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> ListenerId {
        self.add_shared_listener(std::sync::Arc::new(listener))
    }

    pub(crate) fn add_shared_listener(&self, listener: LifecycleListener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Returns whether a listener was registered under `id`.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Moves to `state` and notifies listeners.
    ///
    /// Returns `false`, without notifying anyone, if `state` is not the single
    /// next step from the current state. Concurrent callers racing for the same
    /// transition therefore see exactly one `true`.
    pub fn fire_lifecycle_event(&self, state: LifecycleState) -> bool {
        {
            let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if LifecycleState::successor(*current) != Some(state) {
                debug!(from = ?*current, to = ?state, "rejected lifecycle transition");
                return false;
            }
            *current = Some(state);
        }

        info!(state = ?state, "lifecycle state changed");
        self.notify(&state.into());
        true
    }

    /// Broadcasts a collaborator event without touching the state.
    pub(crate) fn emit(&self, event: LifecycleEvent) {
        debug!(event = ?event, "lifecycle event");
        self.notify(&event);
    }

    fn notify(&self, event: &LifecycleEvent) {
        let listeners: Vec<(ListenerId, LifecycleListener)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, listener) in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(listener = id.0, event = ?event, "lifecycle listener panicked");
            }
        }
    }
}

impl Default for LifecycleService {
    fn default() -> Self {
        Self::new()
    }
}
