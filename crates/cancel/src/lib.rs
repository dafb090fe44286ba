//! Cooperative cancellation primitives.
//!
//! The central type is the [`CancellationToken`], a cloneable read-only
//! handle signaling a one-way cancellation request. Tokens are created
//! through a [`CancellationSource`], whose [`CancellationController`] is the
//! only way to cancel them. Tokens can be combined with [`any_token`] and
//! [`all_tokens`], chained to a parent with [`ChildCancellationSource`], and
//! used to bound blocking waits through the [`wait`] module.
//!
//! A canceled token never reverts: once [`CancellationToken::is_canceled`]
//! returns `true` on any thread, it returns `true` everywhere from then on.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod child;
mod combinators;
pub mod event;
mod token;
pub mod wait;

pub use child::ChildCancellationSource;
pub use combinators::{all_tokens, any_token};
pub use event::ListenerHandle;
pub use token::{
    CancellationController, CancellationSource, CancellationToken, OperationCanceled,
};
