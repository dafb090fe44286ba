//! Convenience functions over managers and token collections.

use std::{
    fmt,
    hash::Hash,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use taskgrant_cancel::{event::ListenerHandle, CancellationToken, OperationCanceled};

use crate::{
    manager::AccessManager,
    request::AccessRequest,
    result::AccessResult,
    right::HierarchicalRight,
    token::SharedToken,
};

/// Tries to acquire a single shared right immediately.
pub fn try_read_access<Id, C>(
    manager: &AccessManager<Id, C>,
    id: Id,
    right: HierarchicalRight<C>,
) -> AccessResult<Id>
where
    Id: Clone + fmt::Debug + Send + Sync + 'static,
    C: Clone + Eq + Hash + Send + Sync + 'static,
{
    manager.try_get_access(&AccessRequest::read_request(id, right))
}

/// Tries to acquire a single exclusive right immediately.
pub fn try_write_access<Id, C>(
    manager: &AccessManager<Id, C>,
    id: Id,
    right: HierarchicalRight<C>,
) -> AccessResult<Id>
where
    Id: Clone + fmt::Debug + Send + Sync + 'static,
    C: Clone + Eq + Hash + Send + Sync + 'static,
{
    manager.try_get_access(&AccessRequest::write_request(id, right))
}

/// Acquires a single shared right, queueing behind current holders.
pub fn scheduled_read_access<Id, C>(
    manager: &AccessManager<Id, C>,
    id: Id,
    right: HierarchicalRight<C>,
) -> AccessResult<Id>
where
    Id: Clone + fmt::Debug + Send + Sync + 'static,
    C: Clone + Eq + Hash + Send + Sync + 'static,
{
    manager.get_scheduled_access(&AccessRequest::read_request(id, right))
}

/// Acquires a single exclusive right, queueing behind current holders.
pub fn scheduled_write_access<Id, C>(
    manager: &AccessManager<Id, C>,
    id: Id,
    right: HierarchicalRight<C>,
) -> AccessResult<Id>
where
    Id: Clone + fmt::Debug + Send + Sync + 'static,
    C: Clone + Eq + Hash + Send + Sync + 'static,
{
    manager.get_scheduled_access(&AccessRequest::write_request(id, right))
}

/// Releases every token and cancels its tasks.
pub fn release_and_cancel_all<Id>(tokens: &[SharedToken<Id>]) {
    for token in tokens {
        token.release_and_cancel();
    }
}

/// Blocks until every token is released with no task still executing.
pub fn await_release_all<Id>(
    cancel: &CancellationToken,
    tokens: &[SharedToken<Id>],
) -> Result<(), OperationCanceled> {
    for token in tokens {
        token.await_release(cancel)?;
    }
    Ok(())
}

/// Like [`await_release_all`] with a shared deadline; `Ok(false)` means the
/// timeout elapsed before every token was done.
pub fn try_await_release_all<Id>(
    cancel: &CancellationToken,
    timeout: Duration,
    tokens: &[SharedToken<Id>],
) -> Result<bool, OperationCanceled> {
    let deadline = Instant::now().checked_add(timeout);
    for token in tokens {
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => return await_release_all(cancel, tokens).map(|()| true),
        };
        if !token.try_await_release(cancel, remaining)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Notifies `listener` exactly once, when every token has been released.
///
/// An empty set notifies synchronously. The returned handle unregisters
/// whatever has not fired yet.
pub fn add_release_all_listener<Id>(
    tokens: &[SharedToken<Id>],
    listener: impl FnOnce() + Send + 'static,
) -> ListenerHandle {
    if tokens.is_empty() {
        listener();
        return ListenerHandle::unregistered();
    }

    let cell = Arc::new(Mutex::new(Some(Box::new(listener) as Box<dyn FnOnce() + Send>)));
    let remaining = Arc::new(AtomicUsize::new(tokens.len()));

    let mut handles = Vec::with_capacity(tokens.len());
    for token in tokens {
        let cell = Arc::clone(&cell);
        let remaining = Arc::clone(&remaining);
        handles.push(token.add_release_listener(Box::new(move || {
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                if let Some(listener) = cell.lock().take() {
                    listener();
                }
            }
        })));
    }
    ListenerHandle::group(handles)
}
