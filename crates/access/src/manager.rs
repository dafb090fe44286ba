//! The hierarchical rights coordinator.

use std::{collections::HashSet, fmt, hash::Hash, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    request::AccessRequest,
    result::AccessResult,
    right::HierarchicalRight,
    scheduled::ScheduledAccessToken,
    token::{GenericAccessToken, SharedToken},
};

type Rights<C> = HashSet<HierarchicalRight<C>>;

struct HolderEntry<Id, C> {
    key: u64,
    token: SharedToken<Id>,
    read_rights: Rights<C>,
    write_rights: Rights<C>,
}

impl<Id, C: Eq + Hash> HolderEntry<Id, C> {
    fn conflicts_with(&self, request: &AccessRequest<Id, HierarchicalRight<C>>) -> bool {
        sets_conflict(request.write_rights(), &self.write_rights) ||
            sets_conflict(request.write_rights(), &self.read_rights) ||
            sets_conflict(request.read_rights(), &self.write_rights)
    }
}

fn sets_conflict<C: Eq + Hash>(a: &Rights<C>, b: &Rights<C>) -> bool {
    a.iter().any(|left| b.iter().any(|right| left.conflicts_with(right)))
}

struct RightsTable<Id, C> {
    next_key: u64,
    holders: Vec<HolderEntry<Id, C>>,
}

impl<Id, C: Eq + Hash> RightsTable<Id, C> {
    fn conflicting(&self, request: &AccessRequest<Id, HierarchicalRight<C>>) -> Vec<SharedToken<Id>> {
        self.holders
            .iter()
            .filter(|entry| entry.conflicts_with(request))
            .map(|entry| Arc::clone(&entry.token))
            .collect()
    }

    fn insert(
        &mut self,
        token: SharedToken<Id>,
        request: &AccessRequest<Id, HierarchicalRight<C>>,
    ) -> u64
    where
        C: Clone,
    {
        let key = self.next_key;
        self.next_key += 1;
        self.holders.push(HolderEntry {
            key,
            token,
            read_rights: request.read_rights().clone(),
            write_rights: request.write_rights().clone(),
        });
        key
    }

    fn remove(&mut self, key: u64) {
        self.holders.retain(|entry| entry.key != key);
    }
}

struct ManagerInner<Id, C> {
    table: Mutex<RightsTable<Id, C>>,
}

/// Grants access tokens over a hierarchy of rights.
///
/// Shared (read) rights never conflict with each other; an exclusive
/// (write) right conflicts with any right covering an overlapping part of
/// the hierarchy, pending holders included. Conflict computation and holder
/// registration happen as one transaction under the rights-table lock; the
/// lock is never held while user code (listeners, tasks) runs, so anything
/// may be requested or released from within them.
///
/// Clones share the same rights table.
pub struct AccessManager<Id, C> {
    inner: Arc<ManagerInner<Id, C>>,
}

impl<Id, C> Clone for AccessManager<Id, C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<Id, C> Default for AccessManager<Id, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id, C> AccessManager<Id, C> {
    /// Creates a coordinator with no rights held.
    pub fn new() -> Self {
        Self { inner: Arc::new(ManagerInner { table: Mutex::new(RightsTable { next_key: 0, holders: Vec::new() }) }) }
    }
}

impl<Id, C> AccessManager<Id, C>
where
    Id: Clone + fmt::Debug + Send + Sync + 'static,
    C: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Attempts to acquire the requested rights immediately.
    ///
    /// Grants a fresh active token when nothing conflicts; otherwise
    /// returns an unavailable result carrying the conflicting tokens and
    /// changes nothing.
    pub fn try_get_access(
        &self,
        request: &AccessRequest<Id, HierarchicalRight<C>>,
    ) -> AccessResult<Id> {
        let token: SharedToken<Id> = Arc::new(GenericAccessToken::new(request.access_id().clone()));

        let key = {
            let mut table = self.inner.table.lock();
            let conflicting = table.conflicting(request);
            if !conflicting.is_empty() {
                return AccessResult::unavailable(conflicting);
            }
            table.insert(Arc::clone(&token), request)
        };

        debug!(id = ?request.access_id(), "access granted");
        self.register_removal(&token, key);
        AccessResult::granted(token, Vec::new())
    }

    /// Acquires the requested rights, queueing behind current holders.
    ///
    /// Always grants a token. On conflict the token is a
    /// [`ScheduledAccessToken`] blocked on exactly the currently
    /// conflicting tokens; it is registered as a pending holder right away,
    /// so later requests conflict with it too.
    pub fn get_scheduled_access(
        &self,
        request: &AccessRequest<Id, HierarchicalRight<C>>,
    ) -> AccessResult<Id> {
        let scheduled =
            ScheduledAccessToken::new_blocked(GenericAccessToken::new(request.access_id().clone()));
        let token: SharedToken<Id> = Arc::new(scheduled.clone());

        let (key, conflicting) = {
            let mut table = self.inner.table.lock();
            let conflicting = table.conflicting(request);
            let key = table.insert(Arc::clone(&token), request);
            (key, conflicting)
        };

        debug!(id = ?request.access_id(), blocked_on = conflicting.len(), "access scheduled");
        self.register_removal(&token, key);
        // Wired after the lock dropped: an already-released blocker runs the
        // countdown listener synchronously, which may drain submissions.
        scheduled.unblock_after(&conflicting);
        AccessResult::granted(token, conflicting)
    }

    /// Returns whether [`try_get_access`](Self::try_get_access) for
    /// `request` would currently succeed.
    pub fn is_available(&self, request: &AccessRequest<Id, HierarchicalRight<C>>) -> bool {
        let table = self.inner.table.lock();
        !table.holders.iter().any(|entry| entry.conflicts_with(request))
    }

    fn register_removal(&self, token: &SharedToken<Id>, key: u64) {
        let inner = Arc::downgrade(&self.inner);
        token.add_release_listener(Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.table.lock().remove(key);
                trace!(key, "rights entry removed");
            }
        }));
    }
}

impl<Id, C> fmt::Debug for AccessManager<Id, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessManager")
            .field("holders", &self.inner.table.lock().holders.len())
            .finish()
    }
}
