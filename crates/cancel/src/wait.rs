//! Blocking waits that respect cancellation.
//!
//! Condition-variable style waits cannot observe a [`CancellationToken`] on
//! their own. The [`WakeableWait`] trait is the bridge: it exposes a
//! [`wake`](WakeableWait::wake) that makes a blocked [`wait`](WakeableWait::wait)
//! return early, and the [`await_wait`] adapters register a cancel listener
//! calling it. The adapters own the retry loop, so implementors never have to
//! reason about spurious wakeups or remaining-time bookkeeping.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::token::{CancellationToken, OperationCanceled};

/// Why a single [`WakeableWait::wait`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition holds.
    Signaled,
    /// The requested timeout elapsed before the condition held.
    TimedOut,
    /// Woken without the condition holding, either spuriously or through
    /// [`WakeableWait::wake`]. The caller decides whether to retry.
    Interrupted,
}

/// A blocking wait that can be woken from another thread.
///
/// Implementations only have to block for at most one `timeout` and report
/// honestly why they returned; [`await_wait`] and [`await_wait_timeout`]
/// handle retries and cancellation on top.
pub trait WakeableWait: Send + Sync {
    /// Wakes every thread currently blocked in [`wait`](Self::wait).
    ///
    /// A woken wait returns [`WaitOutcome::Interrupted`] unless its
    /// condition happens to hold by then. A wake delivered while no wait is
    /// in progress must not be lost: the next `wait` call has to return
    /// `Interrupted` without blocking. This makes the
    /// check-token-then-block sequence in the adapters race-free.
    fn wake(&self);

    /// Blocks until the condition holds, the timeout elapses, or the wait is
    /// woken. `None` means no timeout.
    fn wait(&self, timeout: Option<Duration>) -> WaitOutcome;
}

struct WakeOnCancel {
    handle: crate::event::ListenerHandle,
}

impl WakeOnCancel {
    fn register<W: WakeableWait + 'static>(token: &CancellationToken, wait: &Arc<W>) -> Self {
        // Weak keeps the cancel listener from prolonging the waiter's life.
        let weak = Arc::downgrade(wait);
        let handle = token.add_listener(move || {
            if let Some(wait) = weak.upgrade() {
                wait.wake();
            }
        });
        Self { handle }
    }
}

impl Drop for WakeOnCancel {
    fn drop(&mut self) {
        self.handle.unregister();
    }
}

/// Blocks on `wait` until it reports [`WaitOutcome::Signaled`] or `token` is
/// canceled.
///
/// Interrupted and spurious wakeups are retried transparently. Returns
/// [`OperationCanceled`] iff the token canceled before the condition held;
/// both may be true under a race, in which case the signaled outcome wins.
pub fn await_wait<W: WakeableWait + 'static>(
    token: &CancellationToken,
    wait: &Arc<W>,
) -> Result<(), OperationCanceled> {
    let _wake = WakeOnCancel::register(token, wait);
    loop {
        match wait.wait(None) {
            WaitOutcome::Signaled => return Ok(()),
            WaitOutcome::TimedOut | WaitOutcome::Interrupted => token.check_canceled()?,
        }
    }
}

/// Like [`await_wait`] but gives up after `timeout`.
///
/// Returns `Ok(true)` when the condition held, `Ok(false)` when the timeout
/// elapsed first. Running out of time is never reported as cancellation. The
/// remaining time is recomputed from a monotonic deadline across retries, so
/// spurious wakeups do not extend the total wait.
pub fn await_wait_timeout<W: WakeableWait + 'static>(
    token: &CancellationToken,
    wait: &Arc<W>,
    timeout: Duration,
) -> Result<bool, OperationCanceled> {
    let deadline = match Instant::now().checked_add(timeout) {
        Some(deadline) => deadline,
        // Far enough out that a timeout is unobservable.
        None => return await_wait(token, wait).map(|()| true),
    };

    let _wake = WakeOnCancel::register(token, wait);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            // Out of time, but a condition that already holds still wins
            // over the timeout; poll once without blocking.
            return Ok(wait.wait(Some(Duration::ZERO)) == WaitOutcome::Signaled);
        }
        match wait.wait(Some(remaining)) {
            WaitOutcome::Signaled => return Ok(true),
            WaitOutcome::TimedOut | WaitOutcome::Interrupted => token.check_canceled()?,
        }
    }
}

/// Blocks the calling thread for `duration`, returning early with
/// [`OperationCanceled`] if `token` cancels first.
pub fn sleep(token: &CancellationToken, duration: Duration) -> Result<(), OperationCanceled> {
    // A signal nobody ever raises; only cancellation or the deadline end it.
    let idle = Arc::new(WaitableSignal::new());
    await_wait_timeout(token, &idle, duration).map(|_| ())
}

/// A one-way boolean flag threads can block on.
///
/// Starts unset; [`signal`](Self::signal) sets it permanently and releases
/// every waiter. Waiting goes through the adapters: [`await_wait`] blocks
/// until the flag is set or the token cancels, [`await_wait_timeout`]
/// additionally gives up after a timeout.
#[derive(Debug, Default)]
pub struct WaitableSignal {
    signaled: AtomicBool,
    // Pending-wake flag; true while a wake has not been consumed by a wait.
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl WaitableSignal {
    /// Creates an unsignaled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether [`signal`](Self::signal) has been called.
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }

    /// Sets the flag and wakes every waiter. Idempotent.
    pub fn signal(&self) {
        // The store must happen inside the lock so a waiter cannot observe
        // the flag unset after deciding to block but before blocking.
        let _guard = self.woken.lock();
        self.signaled.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

}

impl WakeableWait for WaitableSignal {
    fn wake(&self) {
        *self.woken.lock() = true;
        self.condvar.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let mut woken = self.woken.lock();
        if self.signaled.load(Ordering::SeqCst) {
            return WaitOutcome::Signaled;
        }
        if std::mem::take(&mut *woken) {
            return WaitOutcome::Interrupted;
        }
        let timed_out = match timeout {
            None => {
                self.condvar.wait(&mut woken);
                false
            }
            Some(timeout) => self.condvar.wait_for(&mut woken, timeout).timed_out(),
        };
        *woken = false;
        if self.signaled.load(Ordering::SeqCst) {
            WaitOutcome::Signaled
        } else if timed_out {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Interrupted
        }
    }
}
