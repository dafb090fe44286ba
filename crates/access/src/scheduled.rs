//! Tokens granted ahead of conflicting holders.

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use taskgrant_cancel::{
    event::{ListenerHandle, PanicCollector},
    CancellationToken, OperationCanceled,
};
use taskgrant_executor::{CleanupFn, CompletionHandle, SubmittedTask, TaskExecutor, TaskFn};
use tracing::trace;

use crate::token::{complete_canceled, AccessToken, GenericAccessToken, SharedToken};

struct QueuedSubmission {
    submitted: Arc<SubmittedTask>,
    executor: Box<dyn TaskExecutor>,
}

#[derive(Default)]
struct QueueState {
    // Exactly one of these modes is active at a time: queueing (both
    // false), passthrough (allow_submit) or discarded.
    allow_submit: bool,
    discarded: bool,
    queue: Vec<QueuedSubmission>,
}

struct ScheduledCore<Id> {
    sub_token: GenericAccessToken<Id>,
    state: Mutex<QueueState>,
}

/// A token granted while conflicting tokens are still alive.
///
/// Submissions are queued until every blocking token is released, then
/// drained in submission order exactly once; from then on the token is a
/// passthrough to the wrapped one. Releasing the token while still blocked
/// discards the queue immediately: each queued cleanup fires as canceled,
/// no body runs, and a later unblocking re-executes nothing.
pub struct ScheduledAccessToken<Id> {
    core: Arc<ScheduledCore<Id>>,
}

impl<Id> Clone for ScheduledAccessToken<Id> {
    fn clone(&self) -> Self {
        Self { core: Arc::clone(&self.core) }
    }
}

impl<Id: fmt::Debug + Send + Sync + 'static> ScheduledAccessToken<Id> {
    /// Creates a token queueing submissions until every token in
    /// `blocking_tokens` is released. An empty set means passthrough from
    /// the first submission.
    pub fn new(sub_token: GenericAccessToken<Id>, blocking_tokens: &[SharedToken<Id>]) -> Self {
        let token = Self::new_blocked(sub_token);
        token.unblock_after(blocking_tokens);
        token
    }

    /// Creates the token in queueing mode without wiring the unblock
    /// trigger yet. [`unblock_after`](Self::unblock_after) must follow.
    ///
    /// The split lets a coordinator publish the token under its own lock
    /// and register listeners on the blocking tokens after dropping it.
    pub(crate) fn new_blocked(sub_token: GenericAccessToken<Id>) -> Self {
        Self { core: Arc::new(ScheduledCore { sub_token, state: Mutex::new(QueueState::default()) }) }
    }

    /// Arms the countdown draining the queue once every blocking token is
    /// released.
    pub(crate) fn unblock_after(&self, blocking_tokens: &[SharedToken<Id>]) {
        if blocking_tokens.is_empty() {
            self.drain();
            return;
        }

        let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(blocking_tokens.len()));
        for blocking in blocking_tokens {
            let remaining = Arc::clone(&remaining);
            let core = Arc::clone(&self.core);
            blocking.add_release_listener(Box::new(move || {
                if remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1 {
                    Self { core }.drain();
                }
            }));
        }
    }

    /// Submits everything queued to the wrapped token's executors and
    /// switches to passthrough.
    ///
    /// Runs at most one switch even under racing submissions: a submission
    /// either lands in a batch drained here or observes passthrough, never
    /// both or neither. A panicking underlying submission does not stop the
    /// drain; the remaining entries are still submitted and the first panic
    /// unwinds afterwards.
    fn drain(&self) {
        let mut panics = PanicCollector::new();
        loop {
            let batch = {
                let mut state = self.core.state.lock();
                if state.discarded {
                    break;
                }
                if state.queue.is_empty() {
                    state.allow_submit = true;
                    break;
                }
                std::mem::take(&mut state.queue)
            };
            trace!(tasks = batch.len(), "draining scheduled submissions");
            for entry in batch {
                panics.run(|| {
                    entry.submitted.execute_with(&*entry.executor);
                });
            }
        }
        panics.finish();
    }

    /// Finishes every queued submission as canceled.
    fn discard(&self) {
        let queue = {
            let mut state = self.core.state.lock();
            state.discarded = true;
            std::mem::take(&mut state.queue)
        };
        if !queue.is_empty() {
            trace!(tasks = queue.len(), "discarding scheduled submissions");
        }
        let mut panics = PanicCollector::new();
        for entry in queue {
            panics.run(|| {
                entry.submitted.cancel();
            });
        }
        panics.finish();
    }
}

impl<Id: fmt::Debug + Send + Sync + 'static> AccessToken<Id> for ScheduledAccessToken<Id> {
    fn access_id(&self) -> &Id {
        self.core.sub_token.access_id()
    }

    fn is_released(&self) -> bool {
        self.core.sub_token.is_released()
    }

    fn release(&self) {
        self.discard();
        self.core.sub_token.release();
    }

    fn release_and_cancel(&self) {
        self.discard();
        self.core.sub_token.release_and_cancel();
    }

    fn add_release_listener(&self, listener: Box<dyn FnOnce() + Send>) -> ListenerHandle {
        self.core.sub_token.add_release_listener(listener)
    }

    fn executor(&self, underlying: Box<dyn TaskExecutor>) -> Box<dyn TaskExecutor> {
        Box::new(ScheduledExecutor {
            core: Arc::clone(&self.core),
            inner: self.core.sub_token.executor(underlying),
        })
    }

    fn is_executing_in_this(&self) -> bool {
        self.core.sub_token.is_executing_in_this()
    }

    fn await_release(&self, token: &CancellationToken) -> Result<(), OperationCanceled> {
        self.core.sub_token.await_release(token)
    }

    fn try_await_release(
        &self,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<bool, OperationCanceled> {
        self.core.sub_token.try_await_release(token, timeout)
    }
}

impl<Id: fmt::Debug + Send + Sync + 'static> fmt::Debug for ScheduledAccessToken<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("ScheduledAccessToken")
            .field("access_id", &self.core.sub_token.access_id())
            .field("allow_submit", &state.allow_submit)
            .field("discarded", &state.discarded)
            .field("queued", &state.queue.len())
            .finish()
    }
}

struct ScheduledExecutor<Id> {
    core: Arc<ScheduledCore<Id>>,
    inner: Box<dyn TaskExecutor>,
}

impl<Id> Clone for ScheduledExecutor<Id> {
    fn clone(&self) -> Self {
        Self { core: Arc::clone(&self.core), inner: self.inner.clone() }
    }
}

impl<Id> fmt::Debug for ScheduledExecutor<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledExecutor").field("inner", &self.inner).finish()
    }
}

impl<Id: Send + Sync + 'static> TaskExecutor for ScheduledExecutor<Id> {
    fn execute(
        &self,
        token: CancellationToken,
        task: TaskFn,
        cleanup: Option<CleanupFn>,
    ) -> CompletionHandle {
        let submitted = {
            let mut state = self.core.state.lock();
            if state.discarded {
                drop(state);
                return complete_canceled(cleanup);
            }
            if state.allow_submit {
                drop(state);
                return self.inner.execute(token, task, cleanup);
            }
            let submitted = Arc::new(SubmittedTask::new(token, task, cleanup));
            state.queue.push(QueuedSubmission {
                submitted: Arc::clone(&submitted),
                executor: self.inner.clone(),
            });
            submitted
        };
        submitted.handle().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::atomic::{AtomicUsize, Ordering},
    };
    use taskgrant_executor::SyncTaskExecutor;

    type Token = ScheduledAccessToken<&'static str>;

    fn blocked_token(blockers: usize) -> (Token, Vec<SharedToken<&'static str>>) {
        let blocking: Vec<SharedToken<&'static str>> = (0..blockers)
            .map(|_| Arc::new(GenericAccessToken::new("blocker")) as SharedToken<_>)
            .collect();
        let token = ScheduledAccessToken::new(GenericAccessToken::new("scheduled"), &blocking);
        (token, blocking)
    }

    fn push_counting(
        executor: &dyn TaskExecutor,
        order: &Arc<Mutex<Vec<usize>>>,
        id: usize,
    ) -> CompletionHandle {
        let order = Arc::clone(order);
        executor.execute(
            CancellationToken::UNCANCELABLE,
            Box::new(move |_| {
                order.lock().push(id);
                Ok(())
            }),
            None,
        )
    }

    #[test]
    fn empty_blocking_set_is_passthrough() {
        let (token, _) = blocked_token(0);
        let executor = token.executor(SyncTaskExecutor::boxed());

        let handle = executor.execute(CancellationToken::UNCANCELABLE, Box::new(|_| Ok(())), None);
        assert!(handle.outcome().unwrap().is_completed());
    }

    #[test]
    fn queued_until_last_blocker_releases() {
        let (token, blocking) = blocked_token(2);
        let executor = token.executor(SyncTaskExecutor::boxed());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = push_counting(&*executor, &order, 0);
        let second = push_counting(&*executor, &order, 1);

        blocking[0].release();
        assert!(!first.is_done());

        blocking[1].release();
        assert!(first.outcome().unwrap().is_completed());
        assert!(second.outcome().unwrap().is_completed());
        assert_eq!(*order.lock(), vec![0, 1]);

        // Passthrough from now on.
        let third = push_counting(&*executor, &order, 2);
        assert!(third.is_done());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn release_discards_queued_submissions() {
        let (token, blocking) = blocked_token(1);
        let executor = token.executor(SyncTaskExecutor::boxed());
        let cleanups = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&cleanups);
        let handle = executor.execute(
            CancellationToken::UNCANCELABLE,
            Box::new(|_| panic!("must not run")),
            Some(Box::new(move |outcome| {
                assert!(outcome.is_canceled());
                count.fetch_add(1, Ordering::SeqCst);
            })),
        );

        token.release();
        assert!(handle.outcome().unwrap().is_canceled());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(token.is_released());

        // Unblocking afterwards re-executes nothing.
        blocking[0].release();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        // Submissions after the discard complete as canceled too.
        let late = executor.execute(CancellationToken::UNCANCELABLE, Box::new(|_| Ok(())), None);
        let outcome = late.outcome().unwrap();
        assert!(outcome.is_canceled());
        assert!(outcome.error().unwrap().downcast_ref::<OperationCanceled>().is_some());
    }

    #[test]
    fn already_released_blockers_count_at_wiring() {
        let released: SharedToken<&'static str> = {
            let token = GenericAccessToken::new("blocker");
            AccessToken::release(&token);
            Arc::new(token)
        };
        let token =
            ScheduledAccessToken::new(GenericAccessToken::new("scheduled"), &[released]);

        let executor = token.executor(SyncTaskExecutor::boxed());
        let handle = executor.execute(CancellationToken::UNCANCELABLE, Box::new(|_| Ok(())), None);
        assert!(handle.outcome().unwrap().is_completed());
    }

    #[test]
    fn submission_from_a_draining_task_still_runs() {
        let (token, blocking) = blocked_token(1);
        let executor = token.executor(SyncTaskExecutor::boxed());
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let executor = executor.clone();
            let order = Arc::clone(&order);
            push_counting(&*executor.clone(), &order, 0);
            let inner_order = Arc::clone(&order);
            executor.clone().execute(
                CancellationToken::UNCANCELABLE,
                Box::new(move |_| {
                    // Submitted mid-drain: queued and run by the same
                    // unblocking, after the current batch.
                    push_counting(&*executor, &inner_order, 2);
                    inner_order.lock().push(1);
                    Ok(())
                }),
                None,
            );
        }

        blocking[0].release();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn racing_submitters_and_unblocking_run_everything_exactly_once() {
        for _ in 0..50 {
            let (token, blocking) = blocked_token(1);
            let executor = token.executor(SyncTaskExecutor::boxed());
            let executed = Arc::new(AtomicUsize::new(0));
            let submitters = 4usize;
            let per_thread = 8usize;

            let workers: Vec<_> = (0..submitters)
                .map(|_| {
                    let executor = executor.clone();
                    let executed = Arc::clone(&executed);
                    std::thread::spawn(move || {
                        (0..per_thread)
                            .map(|_| {
                                let count = Arc::clone(&executed);
                                executor.execute(
                                    CancellationToken::UNCANCELABLE,
                                    Box::new(move |_| {
                                        count.fetch_add(1, Ordering::SeqCst);
                                        Ok(())
                                    }),
                                    None,
                                )
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let releaser = {
                let blocking = Arc::clone(&blocking[0]);
                std::thread::spawn(move || blocking.release())
            };

            let handles: Vec<_> =
                workers.into_iter().flat_map(|worker| worker.join().unwrap()).collect();
            releaser.join().unwrap();

            // Every submission lands in a drained batch or goes through
            // directly; none is lost or run twice.
            for handle in &handles {
                assert!(handle.wait(&CancellationToken::UNCANCELABLE).unwrap().is_completed());
            }
            assert_eq!(executed.load(Ordering::SeqCst), submitters * per_thread);
        }
    }

    #[test]
    fn panicking_drained_submission_does_not_stop_the_drain() {
        let (token, blocking) = blocked_token(1);
        let executor = token.executor(SyncTaskExecutor::boxed());
        let order = Arc::new(Mutex::new(Vec::new()));

        push_counting(&*executor, &order, 0);
        executor.execute(
            CancellationToken::UNCANCELABLE,
            Box::new(|_| Ok(())),
            Some(Box::new(|_| panic!("cleanup failure"))),
        );
        let last = push_counting(&*executor, &order, 1);

        // The drain trigger is the releaser of the last blocker.
        let unwound = catch_unwind(AssertUnwindSafe(|| blocking[0].release()));
        assert!(unwound.is_err());

        assert_eq!(*order.lock(), vec![0, 1]);
        assert!(last.is_done());

        // Bookkeeping survived: the token is in passthrough mode.
        let after = push_counting(&*executor, &order, 2);
        assert!(after.outcome().unwrap().is_completed());
    }
}
