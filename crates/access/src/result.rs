//! The outcome of an access request.

use std::fmt;

use crate::token::SharedToken;

/// What a coordinator answered to an access request.
///
/// Either a usable token, or (for immediate requests that hit a conflict)
/// only the set of currently conflicting tokens. Scheduled grants carry
/// both: a token plus the tokens it waits for.
pub struct AccessResult<Id> {
    token: Option<SharedToken<Id>>,
    blocking: Vec<SharedToken<Id>>,
}

impl<Id> AccessResult<Id> {
    pub(crate) fn granted(token: SharedToken<Id>, blocking: Vec<SharedToken<Id>>) -> Self {
        Self { token: Some(token), blocking }
    }

    pub(crate) fn unavailable(blocking: Vec<SharedToken<Id>>) -> Self {
        Self { token: None, blocking }
    }

    /// Returns whether the granted token is usable right away, i.e. nothing
    /// blocks it.
    pub fn is_available(&self) -> bool {
        self.blocking.is_empty() && self.token.is_some()
    }

    /// The granted token, if any.
    pub fn token(&self) -> Option<&SharedToken<Id>> {
        self.token.as_ref()
    }

    /// Consumes the result into the granted token.
    pub fn into_token(self) -> Option<SharedToken<Id>> {
        self.token
    }

    /// The tokens currently conflicting with the request.
    pub fn blocking_tokens(&self) -> &[SharedToken<Id>] {
        &self.blocking
    }

    /// Releases the granted token, if any.
    pub fn release(&self) {
        if let Some(token) = &self.token {
            token.release();
        }
    }

    /// Releases the granted token (if any) and cancels its tasks.
    pub fn release_and_cancel(&self) {
        if let Some(token) = &self.token {
            token.release_and_cancel();
        }
    }

    /// Releases and cancels every blocking token, clearing the way for the
    /// granted token.
    pub fn unblock_all(&self) {
        for token in &self.blocking {
            token.release_and_cancel();
        }
    }
}

impl<Id: fmt::Debug> fmt::Debug for AccessResult<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessResult")
            .field("available", &self.is_available())
            .field("token", &self.token)
            .field("blocking", &self.blocking.len())
            .finish()
    }
}
