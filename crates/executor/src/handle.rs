//! Task outcomes and completion handles.

use std::{
    error::Error,
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use parking_lot::Mutex;
use taskgrant_cancel::{
    wait::{self, WaitableSignal},
    CancellationToken, OperationCanceled,
};

use crate::TaskError;

/// The final state of a submission.
///
/// `canceled` and the error are not exclusive: a body that gave up by
/// returning [`OperationCanceled`] is canceled and still carries that error.
#[derive(Clone, Debug)]
pub struct TaskOutcome {
    canceled: bool,
    error: Option<Arc<dyn Error + Send + Sync>>,
}

impl TaskOutcome {
    /// The body ran to completion.
    pub fn completed() -> Self {
        Self { canceled: false, error: None }
    }

    /// The body was skipped because the submission was canceled first.
    pub fn canceled() -> Self {
        Self { canceled: true, error: None }
    }

    /// The body failed with `error`.
    ///
    /// An error downcasting to [`OperationCanceled`] marks the outcome
    /// canceled as well.
    pub fn failed(error: TaskError) -> Self {
        let canceled = error.downcast_ref::<OperationCanceled>().is_some();
        Self { canceled, error: Some(Arc::from(error)) }
    }

    /// Returns whether the submission was canceled before or during the body.
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Returns the body's failure, if any.
    pub fn error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.error.as_deref()
    }

    /// Returns whether the body ran to completion without failing.
    pub fn is_completed(&self) -> bool {
        !self.canceled && self.error.is_none()
    }
}

#[derive(Debug)]
struct HandleState {
    outcome: Mutex<Option<TaskOutcome>>,
    done: Arc<WaitableSignal>,
    wakers: Mutex<Vec<Waker>>,
}

/// Cloneable handle resolving once a submission's cleanup has run.
///
/// Blocking waits go through [`wait`](Self::wait) and
/// [`wait_timeout`](Self::wait_timeout); async callers can await the handle
/// directly since it implements [`Future`].
#[derive(Clone, Debug)]
pub struct CompletionHandle {
    state: Arc<HandleState>,
}

impl CompletionHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(HandleState {
                outcome: Mutex::new(None),
                done: Arc::new(WaitableSignal::new()),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Publishes the outcome. The first resolution wins; later calls no-op.
    pub(crate) fn resolve(&self, outcome: TaskOutcome) {
        {
            let mut slot = self.state.outcome.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
        }
        self.state.done.signal();
        let wakers = std::mem::take(&mut *self.state.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns whether the submission has finished (cleanup included).
    pub fn is_done(&self) -> bool {
        self.state.done.is_signaled()
    }

    /// Returns the outcome if the submission already finished.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.state.outcome.lock().clone()
    }

    /// Blocks until the submission finishes or `token` cancels.
    pub fn wait(&self, token: &CancellationToken) -> Result<TaskOutcome, OperationCanceled> {
        wait::await_wait(token, &self.state.done)?;
        Ok(self.resolved_outcome())
    }

    /// Blocks until the submission finishes, `token` cancels, or `timeout`
    /// elapses. `Ok(None)` means the timeout won; it is never reported as
    /// cancellation.
    pub fn wait_timeout(
        &self,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<Option<TaskOutcome>, OperationCanceled> {
        if wait::await_wait_timeout(token, &self.state.done, timeout)? {
            Ok(Some(self.resolved_outcome()))
        } else {
            Ok(None)
        }
    }

    fn resolved_outcome(&self) -> TaskOutcome {
        // The outcome is published before the done signal.
        self.state.outcome.lock().clone().expect("resolved handle has an outcome")
    }
}

impl Future for CompletionHandle {
    type Output = TaskOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.outcome() {
            return Poll::Ready(outcome);
        }
        self.state.wakers.lock().push(cx.waker().clone());
        // Resolution may have drained the wakers between the two locks.
        match self.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, self.canceled) {
            (None, false) => f.write_str("completed"),
            (None, true) => f.write_str("canceled"),
            (Some(error), false) => write!(f, "failed: {error}"),
            (Some(error), true) => write!(f, "canceled: {error}"),
        }
    }
}
