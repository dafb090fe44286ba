//! One-shot listener dispatch.
//!
//! [`OneShotDispatcher`] is the listener registry backing every
//! cancellation and release event in this workspace. It fires at most once;
//! listeners registered after the event ran are invoked synchronously at
//! registration. Listeners are always invoked outside the registry lock, so
//! a listener may freely re-enter the dispatcher (or anything else) without
//! deadlocking.

use std::{
    any::Any,
    fmt,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::error;

type Listener = Box<dyn FnOnce() + Send>;

enum DispatcherState {
    Armed { next_id: u64, listeners: Vec<(u64, Listener)> },
    Fired,
}

/// A listener registry for an event that can happen at most once.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct OneShotDispatcher {
    state: Arc<Mutex<DispatcherState>>,
}

impl Default for OneShotDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl OneShotDispatcher {
    /// Creates an empty registry whose event has not fired yet.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DispatcherState::Armed {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Registers `listener` to run when the event fires.
    ///
    /// If the event already fired, `listener` runs synchronously before this
    /// method returns and the returned handle reports unregistered. A
    /// listener runs at most once in total.
    pub fn register(&self, listener: impl FnOnce() + Send + 'static) -> ListenerHandle {
        {
            let mut state = self.state.lock();
            if let DispatcherState::Armed { next_id, listeners } = &mut *state {
                let id = *next_id;
                *next_id += 1;
                listeners.push((id, Box::new(listener)));
                return ListenerHandle {
                    kind: HandleKind::Slot { state: Arc::downgrade(&self.state), id },
                };
            }
        }

        // Fired before we got in; notify on the caller's thread.
        listener();
        ListenerHandle::unregistered()
    }

    /// Returns whether the event has already fired.
    pub fn is_fired(&self) -> bool {
        matches!(&*self.state.lock(), DispatcherState::Fired)
    }

    /// Fires the event, invoking every registered listener exactly once.
    ///
    /// Later calls are no-ops. Every listener runs even if some panic: the
    /// first panic is re-raised once all listeners ran, the rest are logged.
    pub fn fire(&self) {
        let listeners = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, DispatcherState::Fired) {
                DispatcherState::Armed { listeners, .. } => listeners,
                DispatcherState::Fired => return,
            }
        };

        let mut panics = PanicCollector::new();
        for (_, listener) in listeners {
            panics.run(listener);
        }
        panics.finish();
    }
}

impl fmt::Debug for OneShotDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fired = self.is_fired();
        f.debug_struct("OneShotDispatcher").field("fired", &fired).finish()
    }
}

/// Reference to a registered listener.
///
/// `unregister` is idempotent. `is_registered` is best-effort: a concurrent
/// firing may still invoke a listener whose `unregister` call is racing with
/// it; once `unregister` returns and no firing was in flight, the listener
/// will never run.
pub struct ListenerHandle {
    kind: HandleKind,
}

enum HandleKind {
    Unregistered,
    Slot { state: Weak<Mutex<DispatcherState>>, id: u64 },
    Group(Vec<ListenerHandle>),
}

impl ListenerHandle {
    /// A handle that was never (or is no longer) registered.
    pub fn unregistered() -> Self {
        Self { kind: HandleKind::Unregistered }
    }

    /// Bundles several handles into one: unregistering the group
    /// unregisters all of them, and the group counts as registered while at
    /// least one member does.
    pub fn group(handles: Vec<ListenerHandle>) -> Self {
        Self { kind: HandleKind::Group(handles) }
    }

    /// Best-effort check whether the listener is still registered.
    pub fn is_registered(&self) -> bool {
        match &self.kind {
            HandleKind::Unregistered => false,
            HandleKind::Group(handles) => handles.iter().any(ListenerHandle::is_registered),
            HandleKind::Slot { state, id } => match state.upgrade() {
                None => false,
                Some(state) => match &*state.lock() {
                    DispatcherState::Fired => false,
                    DispatcherState::Armed { listeners, .. } => {
                        listeners.iter().any(|(other, _)| other == id)
                    }
                },
            },
        }
    }

    /// Removes the listener so it will not be invoked by a later firing.
    pub fn unregister(&self) {
        match &self.kind {
            HandleKind::Unregistered => {}
            HandleKind::Group(handles) => {
                for handle in handles {
                    handle.unregister();
                }
            }
            HandleKind::Slot { state, id } => {
                if let Some(state) = state.upgrade() {
                    if let DispatcherState::Armed { listeners, .. } = &mut *state.lock() {
                        listeners.retain(|(other, _)| other != id);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("registered", &self.is_registered()).finish()
    }
}

/// Runs a sequence of closures to completion even if some panic.
///
/// The first captured panic is re-raised by [`finish`](Self::finish); every
/// later one is logged, never silently dropped.
#[derive(Default)]
pub struct PanicCollector {
    first: Option<Box<dyn Any + Send>>,
}

impl PanicCollector {
    /// Creates a collector with no captured panic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f`, capturing a panic instead of letting it unwind.
    pub fn run(&mut self, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            match &self.first {
                None => self.first = Some(payload),
                Some(_) => {
                    error!(
                        panic = panic_message(&*payload).unwrap_or("<non-string payload>"),
                        "suppressed listener panic"
                    );
                }
            }
        }
    }

    /// Re-raises the first captured panic, if any.
    pub fn finish(self) {
        if let Some(payload) = self.first {
            resume_unwind(payload);
        }
    }
}

impl fmt::Debug for PanicCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicCollector").field("panicked", &self.first.is_some()).finish()
    }
}

/// Extracts the panic message when the payload is a string.
pub fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&'static str>().copied())
}
