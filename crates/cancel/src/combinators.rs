//! Logical combinations of cancellation tokens.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    event::ListenerHandle,
    token::{CancellationToken, TokenKind},
};

/// Returns a token canceled iff at least one of `tokens` is canceled.
///
/// With no tokens the result is [`CancellationToken::UNCANCELABLE`]. A
/// listener registered on the combination fires exactly once, when the
/// first wrapped token cancels; further cancellations do not re-invoke it.
pub fn any_token(tokens: &[CancellationToken]) -> CancellationToken {
    match tokens {
        [] => CancellationToken::UNCANCELABLE,
        [token] => token.clone(),
        _ => CancellationToken { kind: TokenKind::Any(Arc::from(tokens)) },
    }
}

/// Returns a token canceled iff every one of `tokens` is canceled.
///
/// With no tokens the result is [`CancellationToken::CANCELED`] (vacuously
/// all canceled), so registering a listener on it notifies immediately.
pub fn all_tokens(tokens: &[CancellationToken]) -> CancellationToken {
    match tokens {
        [] => CancellationToken::CANCELED,
        [token] => token.clone(),
        _ => CancellationToken { kind: TokenKind::All(Arc::from(tokens)) },
    }
}

type SharedOnce = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;

fn shared_once(listener: Box<dyn FnOnce() + Send>) -> SharedOnce {
    Arc::new(Mutex::new(Some(listener)))
}

fn fire_once(cell: &SharedOnce) {
    // Taking the closure is the one-shot guard; a second sub-token
    // canceling afterwards finds the cell empty.
    let listener = cell.lock().take();
    if let Some(listener) = listener {
        listener();
    }
}

pub(crate) fn add_listener_any(
    tokens: &Arc<[CancellationToken]>,
    listener: Box<dyn FnOnce() + Send>,
) -> ListenerHandle {
    let cell = shared_once(listener);
    let mut handles = Vec::with_capacity(tokens.len());
    for token in tokens.iter() {
        let cell = Arc::clone(&cell);
        handles.push(token.add_listener_boxed(Box::new(move || fire_once(&cell))));
    }
    ListenerHandle::group(handles)
}

pub(crate) fn add_listener_all(
    tokens: &Arc<[CancellationToken]>,
    listener: Box<dyn FnOnce() + Send>,
) -> ListenerHandle {
    let cell = shared_once(listener);
    let remaining = Arc::new(AtomicUsize::new(tokens.len()));

    let mut handles = Vec::with_capacity(tokens.len());
    for token in tokens.iter() {
        let cell = Arc::clone(&cell);
        let remaining = Arc::clone(&remaining);
        handles.push(token.add_listener_boxed(Box::new(move || {
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                fire_once(&cell);
            }
        })));
    }
    ListenerHandle::group(handles)
}
