//! Cancelable task execution.
//!
//! The [`TaskExecutor`] trait is the capability to submit a cancelable task
//! together with a cleanup that runs exactly once per submission, whether
//! the task body ran, failed, panicked, or was skipped because its token was
//! already canceled. Each submission yields a [`CompletionHandle`] that
//! resolves with the final [`TaskOutcome`] after the cleanup ran.
//!
//! Two executors are provided: [`SyncTaskExecutor`] runs submissions on the
//! calling thread, [`ManualTaskExecutor`] queues them until a caller drives
//! the queue. Anything fancier (thread pools, runtimes) is supplied by the
//! embedding application through the same trait.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use dyn_clone::DynClone;
use std::fmt;
use taskgrant_cancel::CancellationToken;

mod handle;
mod manual;
mod submitted;
mod sync;

pub use handle::{CompletionHandle, TaskOutcome};
pub use manual::ManualTaskExecutor;
pub use submitted::{PanickedTask, SubmittedTask};
pub use sync::SyncTaskExecutor;

/// Failure of a task body.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// A cancelable task body.
///
/// The body receives the submission's cancellation token and is expected to
/// poll it at convenient points; returning an error that downcasts to
/// [`OperationCanceled`](taskgrant_cancel::OperationCanceled) counts as a
/// canceled run, not a failed one.
pub type TaskFn = Box<dyn FnOnce(&CancellationToken) -> Result<(), TaskError> + Send>;

/// Cleanup attached to a submission, invoked with the final outcome.
pub type CleanupFn = Box<dyn FnOnce(&TaskOutcome) + Send>;

/// The capability to submit cancelable tasks.
///
/// Contract: the cleanup runs exactly once per submission and the returned
/// handle resolves only after it ran. An implementation must skip the body
/// (completing the submission as canceled) when the token is already
/// canceled by the time the task would start.
#[auto_impl::auto_impl(&, Arc)]
pub trait TaskExecutor: fmt::Debug + DynClone + Send + Sync {
    /// Submits `task` for execution under `token`.
    fn execute(
        &self,
        token: CancellationToken,
        task: TaskFn,
        cleanup: Option<CleanupFn>,
    ) -> CompletionHandle;
}

dyn_clone::clone_trait_object!(TaskExecutor);
