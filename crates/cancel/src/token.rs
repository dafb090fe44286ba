//! Tokens, controllers and sources.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::trace;

use crate::event::{ListenerHandle, OneShotDispatcher};

/// The failure raised when an operation is aborted through a
/// [`CancellationToken`].
///
/// This is the only mechanism used to signal cooperative cancellation; it is
/// never used for ordinary error propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation canceled")]
pub struct OperationCanceled;

#[derive(Debug)]
pub(crate) struct TokenState {
    canceled: AtomicBool,
    listeners: OneShotDispatcher,
}

impl TokenState {
    fn new() -> Self {
        Self { canceled: AtomicBool::new(false), listeners: OneShotDispatcher::new() }
    }

    pub(crate) fn cancel(&self) {
        if !self.canceled.swap(true, Ordering::SeqCst) {
            trace!("cancellation requested");
        }
        // Firing is idempotent; a racing second cancel just returns.
        self.listeners.fire();
    }
}

#[derive(Clone, Debug)]
pub(crate) enum TokenKind {
    Uncancelable,
    Canceled,
    Source(Arc<TokenState>),
    All(Arc<[CancellationToken]>),
    Any(Arc<[CancellationToken]>),
}

/// A read-only handle signaling a one-way cancellation request.
///
/// Cloning is cheap and every clone observes the same state. The canceled
/// flag is monotonic: it flips from `false` to `true` exactly once and never
/// reverts.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    pub(crate) kind: TokenKind,
}

impl CancellationToken {
    /// A token that can never be canceled.
    ///
    /// Listener registration returns an already unregistered handle.
    pub const UNCANCELABLE: Self = Self { kind: TokenKind::Uncancelable };

    /// A token that is permanently in the canceled state.
    ///
    /// Registering a listener invokes it synchronously before the
    /// registration call returns. Pair it with
    /// [`CancellationController::DO_NOTHING`] when a controller is needed.
    pub const CANCELED: Self = Self { kind: TokenKind::Canceled };

    /// Returns whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        match &self.kind {
            TokenKind::Uncancelable => false,
            TokenKind::Canceled => true,
            TokenKind::Source(state) => state.canceled.load(Ordering::SeqCst),
            TokenKind::All(tokens) => tokens.iter().all(CancellationToken::is_canceled),
            TokenKind::Any(tokens) => tokens.iter().any(CancellationToken::is_canceled),
        }
    }

    /// Fails with [`OperationCanceled`] iff cancellation has been requested.
    ///
    /// For an ALL combination this fails only once every wrapped token is
    /// canceled; for an ANY combination the wrapped tokens are checked in
    /// order, so the first canceled one reports.
    pub fn check_canceled(&self) -> Result<(), OperationCanceled> {
        match &self.kind {
            TokenKind::Any(tokens) => {
                for token in tokens.iter() {
                    token.check_canceled()?;
                }
                Ok(())
            }
            _ => {
                if self.is_canceled() {
                    Err(OperationCanceled)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Registers `listener` to be invoked exactly once when this token is
    /// canceled.
    ///
    /// If the token is already canceled, `listener` runs synchronously
    /// before this method returns. Unregistering through the returned handle
    /// before cancellation guarantees the listener never runs, barring an
    /// in-flight concurrent cancellation racing with the unregister call.
    pub fn add_listener(&self, listener: impl FnOnce() + Send + 'static) -> ListenerHandle {
        self.add_listener_boxed(Box::new(listener))
    }

    // Non-generic registration path. Combined tokens register a wrapper on
    // every sub-token, which may itself be a combination; boxing here keeps
    // that recursion from compounding in the closure type.
    pub(crate) fn add_listener_boxed(&self, listener: Box<dyn FnOnce() + Send>) -> ListenerHandle {
        match &self.kind {
            TokenKind::Uncancelable => ListenerHandle::unregistered(),
            TokenKind::Canceled => {
                listener();
                ListenerHandle::unregistered()
            }
            TokenKind::Source(state) => state.listeners.register(listener),
            TokenKind::All(tokens) => crate::combinators::add_listener_all(tokens, listener),
            TokenKind::Any(tokens) => crate::combinators::add_listener_any(tokens, listener),
        }
    }
}

/// The sole mutator able to cancel the token of its [`CancellationSource`].
#[derive(Clone)]
pub struct CancellationController {
    kind: ControllerKind,
}

#[derive(Clone)]
enum ControllerKind {
    DoNothing,
    Source(Arc<TokenState>),
}

impl CancellationController {
    /// A controller whose [`cancel`](Self::cancel) does nothing.
    ///
    /// Useful for operations that cannot be canceled or are already
    /// canceled.
    pub const DO_NOTHING: Self = Self { kind: ControllerKind::DoNothing };

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        match &self.kind {
            ControllerKind::DoNothing => {}
            ControllerKind::Source(state) => state.cancel(),
        }
    }
}

impl fmt::Debug for CancellationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ControllerKind::DoNothing => "do-nothing",
            ControllerKind::Source(_) => "source",
        };
        f.debug_struct("CancellationController").field("kind", &kind).finish()
    }
}

/// An owning `(token, controller)` pair created together.
///
/// The controller is the only way to cancel the token.
#[derive(Debug)]
pub struct CancellationSource {
    state: Arc<TokenState>,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    /// Creates a source whose token is not yet canceled.
    pub fn new() -> Self {
        Self { state: Arc::new(TokenState::new()) }
    }

    /// Returns the token of this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken { kind: TokenKind::Source(Arc::clone(&self.state)) }
    }

    /// Returns the controller of this source.
    pub fn controller(&self) -> CancellationController {
        CancellationController { kind: ControllerKind::Source(Arc::clone(&self.state)) }
    }
}
