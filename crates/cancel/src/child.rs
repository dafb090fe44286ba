//! Cancellation sources chained to a parent token.

use crate::{
    event::ListenerHandle,
    token::{CancellationController, CancellationSource, CancellationToken},
};

/// A [`CancellationSource`] whose token is additionally canceled whenever a
/// parent token cancels.
///
/// The child can be canceled independently through its own controller
/// without affecting the parent. [`detach`](Self::detach) severs the link to
/// the parent; a parent cancellation already in flight when `detach` returns
/// may still cancel the child, but nothing after that will.
#[derive(Debug)]
pub struct ChildCancellationSource {
    source: CancellationSource,
    parent: CancellationToken,
    forward: ListenerHandle,
}

impl ChildCancellationSource {
    /// Creates a child source forwarding cancellation from `parent`.
    ///
    /// If `parent` is already canceled the child starts out canceled.
    pub fn new(parent: CancellationToken) -> Self {
        let source = CancellationSource::new();
        let controller = source.controller();
        let forward = parent.add_listener(move || controller.cancel());
        Self { source, parent, forward }
    }

    /// Returns the child token.
    pub fn token(&self) -> CancellationToken {
        self.source.token()
    }

    /// Returns the controller canceling only the child token.
    pub fn controller(&self) -> CancellationController {
        self.source.controller()
    }

    /// Returns the parent token this child forwards from.
    pub fn parent_token(&self) -> &CancellationToken {
        &self.parent
    }

    /// Stops forwarding parent cancellations to the child.
    ///
    /// Idempotent. The child keeps whatever state it already has and its own
    /// controller keeps working.
    pub fn detach(&self) {
        self.forward.unregister();
    }
}

impl Drop for ChildCancellationSource {
    fn drop(&mut self) {
        self.forward.unregister();
    }
}
