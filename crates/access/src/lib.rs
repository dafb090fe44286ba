//! Rights-based admission control.
//!
//! An [`AccessManager`] coordinates who may act on which part of a
//! hierarchy of rights. Requests ([`AccessRequest`]) name shared and
//! exclusive [`HierarchicalRight`]s; grants come back as [`AccessResult`]s
//! carrying an [`AccessToken`]. Work done under a grant goes through the
//! token's executor wrapper, so releasing (or release-and-canceling) the
//! token reliably stops the corresponding tasks.
//!
//! Two grant flavors exist: [`AccessManager::try_get_access`] either
//! succeeds immediately or reports the conflicting holders, while
//! [`AccessManager::get_scheduled_access`] always grants a token whose
//! submissions wait for the conflicting holders to go away.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod helpers;
mod manager;
mod request;
mod result;
mod right;
mod scheduled;
mod token;

pub use helpers::{
    add_release_all_listener, await_release_all, release_and_cancel_all, scheduled_read_access,
    scheduled_write_access, try_await_release_all, try_read_access, try_write_access,
};
pub use manager::AccessManager;
pub use request::AccessRequest;
pub use result::AccessResult;
pub use right::HierarchicalRight;
pub use scheduled::ScheduledAccessToken;
pub use token::{AccessToken, GenericAccessToken, SharedToken};
