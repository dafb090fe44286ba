//! Access tokens.
//!
//! An access token is the proof that a set of rights was granted. Work done
//! under those rights goes through the token's executor wrapper, which runs
//! each task inside the token's execution context, tags it with the token's
//! cancellation and keeps the active-task count the release waiters observe.

use std::{
    cell::RefCell,
    fmt,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use taskgrant_cancel::{
    any_token,
    event::{ListenerHandle, OneShotDispatcher},
    wait::{self, WaitableSignal},
    CancellationSource, CancellationToken, OperationCanceled,
};
use taskgrant_executor::{
    CleanupFn, CompletionHandle, SubmittedTask, TaskExecutor, TaskFn,
};
use tracing::debug;

/// A granted set of rights with a one-way Active → Released life-cycle.
///
/// Object safe so coordinators can manage heterogeneous token
/// implementations uniformly; see [`SharedToken`].
pub trait AccessToken<Id>: fmt::Debug + Send + Sync {
    /// The id of the request this token was granted for.
    fn access_id(&self) -> &Id;

    /// Returns whether the token has been released.
    ///
    /// Released is terminal; tasks may still be draining, see
    /// [`await_release`](Self::await_release).
    fn is_released(&self) -> bool;

    /// Releases the token. Idempotent.
    ///
    /// Tasks already submitted keep running; new submissions complete as
    /// canceled without their body.
    fn release(&self);

    /// Releases the token and cancels its submissions' tokens, asking
    /// running tasks to stop as soon as practical. Idempotent.
    fn release_and_cancel(&self);

    /// Registers `listener` to run exactly once when the token is released.
    ///
    /// Runs synchronously at registration when already released.
    fn add_release_listener(&self, listener: Box<dyn FnOnce() + Send>) -> ListenerHandle;

    /// Wraps `underlying` so its submissions execute within this token:
    /// inside the token's execution context, combined with its
    /// cancellation, and counted against its release wait.
    fn executor(&self, underlying: Box<dyn TaskExecutor>) -> Box<dyn TaskExecutor>;

    /// Returns whether the calling thread is currently running a task (or
    /// cleanup) of this token.
    fn is_executing_in_this(&self) -> bool;

    /// Blocks until the token is released and no task of it is executing.
    fn await_release(&self, token: &CancellationToken) -> Result<(), OperationCanceled>;

    /// Like [`await_release`](Self::await_release) with a timeout;
    /// `Ok(false)` means the timeout elapsed first.
    fn try_await_release(
        &self,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<bool, OperationCanceled>;
}

/// Shared ownership of a type-erased token.
pub type SharedToken<Id> = Arc<dyn AccessToken<Id>>;

/// Finishes a submission as canceled without running its body.
///
/// The cleanup observes a canceled outcome carrying [`OperationCanceled`].
pub(crate) fn complete_canceled(cleanup: Option<CleanupFn>) -> CompletionHandle {
    let submitted = SubmittedTask::new(
        CancellationToken::UNCANCELABLE,
        Box::new(|_| Err(OperationCanceled.into())),
        cleanup,
    );
    submitted.execute();
    submitted.handle().clone()
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static ACTIVE_CONTEXTS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

struct ContextGuard {
    id: u64,
}

impl ContextGuard {
    fn enter(id: u64) -> Self {
        ACTIVE_CONTEXTS.with(|stack| stack.borrow_mut().push(id));
        Self { id }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        ACTIVE_CONTEXTS.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.id));
        });
    }
}

#[derive(Debug)]
struct TokenCore<Id> {
    id: Id,
    context_id: u64,
    cancel: CancellationSource,
    released: AtomicBool,
    release_event: OneShotDispatcher,
    active_tasks: AtomicUsize,
    done: Arc<WaitableSignal>,
}

impl<Id> TokenCore<Id> {
    fn task_started(&self) {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
    }

    fn task_finished(&self) {
        if self.active_tasks.fetch_sub(1, Ordering::SeqCst) == 1 &&
            self.released.load(Ordering::SeqCst)
        {
            self.done.signal();
        }
    }

    fn release(&self, cancel_tasks: bool) {
        if cancel_tasks {
            self.cancel.controller().cancel();
        }
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!(context_id = self.context_id, "access token released");
            if self.active_tasks.load(Ordering::SeqCst) == 0 {
                self.done.signal();
            }
            // A listener panic unwinds to this caller after every listener
            // ran; the token is fully released either way.
            self.release_event.fire();
        }
    }
}

/// The standard [`AccessToken`] implementation.
///
/// Cloning shares the same life-cycle and execution context.
#[derive(Debug)]
pub struct GenericAccessToken<Id> {
    core: Arc<TokenCore<Id>>,
}

impl<Id> Clone for GenericAccessToken<Id> {
    fn clone(&self) -> Self {
        Self { core: Arc::clone(&self.core) }
    }
}

impl<Id> GenericAccessToken<Id> {
    /// Creates an active token for `id`.
    pub fn new(id: Id) -> Self {
        Self {
            core: Arc::new(TokenCore {
                id,
                context_id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                cancel: CancellationSource::new(),
                released: AtomicBool::new(false),
                release_event: OneShotDispatcher::new(),
                active_tasks: AtomicUsize::new(0),
                done: Arc::new(WaitableSignal::new()),
            }),
        }
    }
}

impl<Id: fmt::Debug + Send + Sync + 'static> AccessToken<Id> for GenericAccessToken<Id> {
    fn access_id(&self) -> &Id {
        &self.core.id
    }

    fn is_released(&self) -> bool {
        self.core.released.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.core.release(false);
    }

    fn release_and_cancel(&self) {
        self.core.release(true);
    }

    fn add_release_listener(&self, listener: Box<dyn FnOnce() + Send>) -> ListenerHandle {
        self.core.release_event.register(listener)
    }

    fn executor(&self, underlying: Box<dyn TaskExecutor>) -> Box<dyn TaskExecutor> {
        Box::new(ContextExecutor { core: Arc::clone(&self.core), inner: underlying })
    }

    fn is_executing_in_this(&self) -> bool {
        let id = self.core.context_id;
        ACTIVE_CONTEXTS.with(|stack| stack.borrow().contains(&id))
    }

    fn await_release(&self, token: &CancellationToken) -> Result<(), OperationCanceled> {
        wait::await_wait(token, &self.core.done)
    }

    fn try_await_release(
        &self,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<bool, OperationCanceled> {
        wait::await_wait_timeout(token, &self.core.done, timeout)
    }
}

// Decrements the active-task count when the cleanup ends, panicking or not.
struct TaskFinished<Id>(Arc<TokenCore<Id>>);

impl<Id> Drop for TaskFinished<Id> {
    fn drop(&mut self) {
        self.0.task_finished();
    }
}

struct ContextExecutor<Id> {
    core: Arc<TokenCore<Id>>,
    inner: Box<dyn TaskExecutor>,
}

impl<Id> Clone for ContextExecutor<Id> {
    fn clone(&self) -> Self {
        Self { core: Arc::clone(&self.core), inner: self.inner.clone() }
    }
}

impl<Id> fmt::Debug for ContextExecutor<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextExecutor")
            .field("context_id", &self.core.context_id)
            .field("inner", &self.inner)
            .finish()
    }
}

impl<Id: Send + Sync + 'static> TaskExecutor for ContextExecutor<Id> {
    fn execute(
        &self,
        token: CancellationToken,
        task: TaskFn,
        cleanup: Option<CleanupFn>,
    ) -> CompletionHandle {
        if self.core.released.load(Ordering::SeqCst) {
            return complete_canceled(cleanup);
        }

        self.core.task_started();
        // Release may have landed between the check and the increment; back
        // out so the release waiters are not stuck on a task that never
        // reaches the underlying executor.
        if self.core.released.load(Ordering::SeqCst) {
            self.core.task_finished();
            return complete_canceled(cleanup);
        }

        let combined = any_token(&[token, self.core.cancel.token()]);

        let context_id = self.core.context_id;
        let wrapped_task: TaskFn = Box::new(move |token| {
            let _ctx = ContextGuard::enter(context_id);
            task(token)
        });

        // Once the cleanup starts, its drop guard owns the decrement.
        let cleanup_started = Arc::new(AtomicBool::new(false));

        let core = Arc::clone(&self.core);
        let started = Arc::clone(&cleanup_started);
        let wrapped_cleanup: CleanupFn = Box::new(move |outcome| {
            started.store(true, Ordering::SeqCst);
            let _finished = TaskFinished(Arc::clone(&core));
            let _ctx = ContextGuard::enter(core.context_id);
            if let Some(cleanup) = cleanup {
                cleanup(outcome);
            }
        });

        match catch_unwind(AssertUnwindSafe(|| {
            self.inner.execute(combined, wrapped_task, Some(wrapped_cleanup))
        })) {
            Ok(handle) => handle,
            Err(payload) => {
                // The executor unwound before handing the submission off;
                // nothing else will ever decrement the count.
                if !cleanup_started.load(Ordering::SeqCst) {
                    self.core.task_finished();
                }
                resume_unwind(payload)
            }
        }
    }
}
