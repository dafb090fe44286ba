//! Shared execution machinery for executor implementations.

use std::{
    any::Any,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
};

use parking_lot::Mutex;
use taskgrant_cancel::{
    event::{panic_message, PanicCollector},
    CancellationToken,
};
use tracing::trace;

use crate::{CleanupFn, CompletionHandle, TaskExecutor, TaskFn, TaskOutcome};

/// A task body that panicked instead of returning.
///
/// Carries the panic message when the payload was a string.
#[derive(Debug, Clone, thiserror::Error)]
pub struct PanickedTask {
    message: Option<String>,
}

impl PanickedTask {
    pub(crate) fn new(payload: &(dyn Any + Send)) -> Self {
        Self { message: panic_message(payload).map(str::to_owned) }
    }

    /// The panic message, when one was recoverable.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for PanickedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "task panicked: {message}"),
            None => f.write_str("task panicked"),
        }
    }
}

struct Payload {
    token: CancellationToken,
    task: TaskFn,
    cleanup: Option<CleanupFn>,
}

/// A single submission with its undecided body and cleanup.
///
/// Taking the payload is the exactly-once guard shared by every way a
/// submission can end: running it, canceling it, or forwarding it to
/// another executor. Whichever happens first wins; the rest are no-ops.
pub struct SubmittedTask {
    payload: Mutex<Option<Payload>>,
    handle: CompletionHandle,
}

impl SubmittedTask {
    /// Wraps a submission that has not run yet.
    pub fn new(token: CancellationToken, task: TaskFn, cleanup: Option<CleanupFn>) -> Self {
        Self {
            payload: Mutex::new(Some(Payload { token, task, cleanup })),
            handle: CompletionHandle::new(),
        }
    }

    /// The handle resolving when this submission finishes.
    pub fn handle(&self) -> &CompletionHandle {
        &self.handle
    }

    /// Returns whether the submission still awaits execution.
    pub fn is_pending(&self) -> bool {
        self.payload.lock().is_some()
    }

    /// Runs the submission on the calling thread.
    ///
    /// Skips the body when the token is already canceled. A panicking body
    /// becomes a [`PanickedTask`] outcome instead of unwinding; a panicking
    /// cleanup unwinds to the caller, after the handle resolved. Returns
    /// `false` when the submission was already finished.
    pub fn execute(&self) -> bool {
        let Some(Payload { token, task, cleanup }) = self.payload.lock().take() else {
            return false;
        };

        let outcome = if token.is_canceled() {
            trace!("skipping canceled submission");
            TaskOutcome::canceled()
        } else {
            match catch_unwind(AssertUnwindSafe(|| task(&token))) {
                Ok(Ok(())) => TaskOutcome::completed(),
                Ok(Err(error)) => TaskOutcome::failed(error),
                Err(payload) => TaskOutcome::failed(Box::new(PanickedTask::new(&*payload))),
            }
        };

        finish(cleanup, &self.handle, outcome);
        true
    }

    /// Finishes the submission as canceled without running the body.
    ///
    /// The cleanup still runs. Returns `false` when the submission was
    /// already finished.
    pub fn cancel(&self) -> bool {
        let Some(Payload { cleanup, .. }) = self.payload.lock().take() else {
            return false;
        };
        finish(cleanup, &self.handle, TaskOutcome::canceled());
        true
    }

    /// Hands the submission over to `executor`.
    ///
    /// The forwarded cleanup runs the original one and then resolves this
    /// submission's handle, so callers holding it observe the outcome no
    /// matter which executor finished the work. Returns `false` when the
    /// submission was already finished.
    pub fn execute_with(&self, executor: &dyn TaskExecutor) -> bool {
        let Some(Payload { token, task, cleanup }) = self.payload.lock().take() else {
            return false;
        };

        let handle = self.handle.clone();
        executor.execute(
            token,
            task,
            Some(Box::new(move |outcome: &TaskOutcome| {
                let mut panics = PanicCollector::new();
                if let Some(cleanup) = cleanup {
                    panics.run(|| cleanup(outcome));
                }
                handle.resolve(outcome.clone());
                panics.finish();
            })),
        );
        true
    }
}

fn finish(cleanup: Option<CleanupFn>, handle: &CompletionHandle, outcome: TaskOutcome) {
    let mut panics = PanicCollector::new();
    if let Some(cleanup) = cleanup {
        panics.run(|| cleanup(&outcome));
    }
    // The handle must resolve even when the cleanup panicked, or waiters
    // would block forever.
    handle.resolve(outcome);
    panics.finish();
}

impl fmt::Debug for SubmittedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmittedTask")
            .field("pending", &self.is_pending())
            .field("done", &self.handle.is_done())
            .finish()
    }
}
