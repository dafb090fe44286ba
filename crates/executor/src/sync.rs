//! Executor running submissions on the calling thread.

use taskgrant_cancel::CancellationToken;

use crate::{CleanupFn, CompletionHandle, SubmittedTask, TaskExecutor, TaskFn};

/// A [`TaskExecutor`] that runs every submission synchronously inside
/// [`execute`](TaskExecutor::execute).
///
/// The returned handle is therefore always resolved. Useful wherever a
/// required executor should add no scheduling at all.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct SyncTaskExecutor;

impl SyncTaskExecutor {
    /// Creates a synchronous executor.
    pub const fn new() -> Self {
        Self
    }

    /// Boxed form for APIs taking `Box<dyn TaskExecutor>`.
    pub fn boxed() -> Box<dyn TaskExecutor> {
        Box::new(Self)
    }
}

impl TaskExecutor for SyncTaskExecutor {
    fn execute(
        &self,
        token: CancellationToken,
        task: TaskFn,
        cleanup: Option<CleanupFn>,
    ) -> CompletionHandle {
        let submitted = SubmittedTask::new(token, task, cleanup);
        submitted.execute();
        submitted.handle().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use taskgrant_cancel::CancellationSource;

    #[test]
    fn runs_on_the_calling_thread() {
        let executor = SyncTaskExecutor::new();
        let caller = std::thread::current().id();

        let handle = executor.execute(
            CancellationToken::UNCANCELABLE,
            Box::new(move |_| {
                assert_eq!(std::thread::current().id(), caller);
                Ok(())
            }),
            None,
        );

        assert!(handle.is_done());
        assert!(handle.outcome().unwrap().is_completed());
    }

    #[test]
    fn canceled_submission_skips_body_but_cleans_up() {
        let source = CancellationSource::new();
        source.controller().cancel();

        let cleanups = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&cleanups);

        let handle = SyncTaskExecutor::boxed().execute(
            source.token(),
            Box::new(|_| panic!("must not run")),
            Some(Box::new(move |outcome| {
                assert!(outcome.is_canceled());
                count.fetch_add(1, Ordering::SeqCst);
            })),
        );

        assert!(handle.outcome().unwrap().is_canceled());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn boxed_executor_is_cloneable() {
        let executor = SyncTaskExecutor::boxed();
        let clone = executor.clone();
        let handle = clone.execute(CancellationToken::UNCANCELABLE, Box::new(|_| Ok(())), None);
        assert!(handle.outcome().unwrap().is_completed());
    }
}
