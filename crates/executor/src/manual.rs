//! Caller-driven executor.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use taskgrant_cancel::{event::PanicCollector, CancellationToken};
use tracing::debug;

use crate::{CleanupFn, CompletionHandle, SubmittedTask, TaskExecutor, TaskFn};

/// A [`TaskExecutor`] that only queues submissions; nothing runs until the
/// owner calls [`try_execute_one`](Self::try_execute_one) or
/// [`execute_currently_submitted`](Self::execute_currently_submitted).
///
/// In eager-cancel mode a queued submission whose token cancels is finished
/// (cleanup included) right from the cancel notification instead of waiting
/// for its queue slot.
///
/// Clones share the queue. Mostly a test workhorse, but also the building
/// block for anything that needs full control over when tasks run.
#[derive(Clone)]
pub struct ManualTaskExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<VecDeque<Arc<SubmittedTask>>>,
    eager_cancel: bool,
}

impl ManualTaskExecutor {
    /// Creates an empty executor.
    pub fn new(eager_cancel: bool) -> Self {
        Self { inner: Arc::new(Inner { queue: Mutex::new(VecDeque::new()), eager_cancel }) }
    }

    /// Number of submissions currently queued, finished-but-unpopped
    /// entries included.
    pub fn queued_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Runs the oldest still-pending submission on the calling thread.
    ///
    /// Returns `false` when nothing was left to run. Entries already
    /// finished through eager cancellation are popped and skipped.
    pub fn try_execute_one(&self) -> bool {
        loop {
            let Some(submitted) = self.inner.queue.lock().pop_front() else {
                return false;
            };
            if submitted.execute() {
                return true;
            }
        }
    }

    /// Runs every submission queued at the time of the call, in FIFO order.
    ///
    /// Submissions arriving while the drain runs stay queued for the next
    /// call. Every snapshot entry runs even if some panic; the first panic
    /// unwinds to the caller afterwards. Returns the number of bodies that
    /// were attempted.
    pub fn execute_currently_submitted(&self) -> usize {
        let snapshot: Vec<_> = {
            let mut queue = self.inner.queue.lock();
            let len = queue.len();
            queue.drain(..len).collect()
        };

        let mut executed = 0;
        let mut panics = PanicCollector::new();
        for submitted in snapshot {
            panics.run(|| {
                if submitted.execute() {
                    executed += 1;
                }
            });
        }
        panics.finish();
        executed
    }
}

impl TaskExecutor for ManualTaskExecutor {
    fn execute(
        &self,
        token: CancellationToken,
        task: TaskFn,
        cleanup: Option<CleanupFn>,
    ) -> CompletionHandle {
        let submitted = Arc::new(SubmittedTask::new(token.clone(), task, cleanup));
        let handle = submitted.handle().clone();

        if self.inner.eager_cancel {
            // Weak: the queue entry, not the cancel listener, owns the
            // submission. Finished entries are skipped when popped.
            let weak: Weak<SubmittedTask> = Arc::downgrade(&submitted);
            token.add_listener(move || {
                if let Some(submitted) = weak.upgrade() {
                    submitted.cancel();
                }
            });
            if !submitted.is_pending() {
                // The token was already canceled and the listener ran.
                return handle;
            }
        }

        debug!(queued = self.queued_len() + 1, "submission queued");
        self.inner.queue.lock().push_back(submitted);
        handle
    }
}

impl fmt::Debug for ManualTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTaskExecutor")
            .field("queued", &self.queued_len())
            .field("eager_cancel", &self.inner.eager_cancel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::atomic::{AtomicUsize, Ordering},
    };
    use taskgrant_cancel::CancellationSource;

    fn push_counting(executor: &ManualTaskExecutor, order: &Arc<Mutex<Vec<usize>>>, id: usize) {
        let order = Arc::clone(order);
        executor.execute(
            CancellationToken::UNCANCELABLE,
            Box::new(move |_| {
                order.lock().push(id);
                Ok(())
            }),
            None,
        );
    }

    #[test]
    fn nothing_runs_without_driving() {
        let executor = ManualTaskExecutor::new(false);
        let handle =
            executor.execute(CancellationToken::UNCANCELABLE, Box::new(|_| Ok(())), None);

        assert!(!handle.is_done());
        assert_eq!(executor.queued_len(), 1);

        assert!(executor.try_execute_one());
        assert!(handle.outcome().unwrap().is_completed());
        assert!(!executor.try_execute_one());
    }

    #[test]
    fn fifo_order() {
        let executor = ManualTaskExecutor::new(false);
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in 0..4 {
            push_counting(&executor, &order, id);
        }

        assert_eq!(executor.execute_currently_submitted(), 4);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn drain_is_a_snapshot() {
        let executor = ManualTaskExecutor::new(false);
        let late = Arc::new(AtomicUsize::new(0));

        {
            let executor = executor.clone();
            let late = Arc::clone(&late);
            executor.clone().execute(
                CancellationToken::UNCANCELABLE,
                Box::new(move |_| {
                    // Submitting mid-drain must not extend the drain.
                    let late = Arc::clone(&late);
                    executor.execute(
                        CancellationToken::UNCANCELABLE,
                        Box::new(move |_| {
                            late.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }),
                        None,
                    );
                    Ok(())
                }),
                None,
            );
        }

        assert_eq!(executor.execute_currently_submitted(), 1);
        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert_eq!(executor.queued_len(), 1);
        assert_eq!(executor.execute_currently_submitted(), 1);
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lazy_cancel_completes_at_execution() {
        let executor = ManualTaskExecutor::new(false);
        let source = CancellationSource::new();

        let handle =
            executor.execute(source.token(), Box::new(|_| panic!("must not run")), None);
        source.controller().cancel();

        assert!(!handle.is_done());
        assert!(executor.try_execute_one());
        assert!(handle.outcome().unwrap().is_canceled());
    }

    #[test]
    fn eager_cancel_completes_from_the_cancel_call() {
        let executor = ManualTaskExecutor::new(true);
        let source = CancellationSource::new();
        let cleanups = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&cleanups);
        let handle = executor.execute(
            source.token(),
            Box::new(|_| panic!("must not run")),
            Some(Box::new(move |outcome| {
                assert!(outcome.is_canceled());
                count.fetch_add(1, Ordering::SeqCst);
            })),
        );

        source.controller().cancel();
        assert!(handle.is_done());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        // The stale queue entry is skipped, not double-finished.
        assert!(!executor.try_execute_one());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eager_cancel_with_already_canceled_token() {
        let executor = ManualTaskExecutor::new(true);
        let handle =
            executor.execute(CancellationToken::CANCELED, Box::new(|_| panic!("must not run")), None);

        assert!(handle.outcome().unwrap().is_canceled());
        assert_eq!(executor.queued_len(), 0);
    }

    #[test]
    fn panicking_task_does_not_stop_the_drain() {
        let executor = ManualTaskExecutor::new(false);
        let order = Arc::new(Mutex::new(Vec::new()));

        push_counting(&executor, &order, 0);
        let panicking = executor.execute(
            CancellationToken::UNCANCELABLE,
            Box::new(|_| {
                // Cleanup panics escape the drain; body panics become
                // outcomes.
                Ok(())
            }),
            Some(Box::new(|_| panic!("cleanup failure"))),
        );
        push_counting(&executor, &order, 1);

        let unwound =
            catch_unwind(AssertUnwindSafe(|| executor.execute_currently_submitted()));
        assert!(unwound.is_err());

        assert_eq!(*order.lock(), vec![0, 1]);
        assert!(panicking.is_done());
    }
}
