//! Access requests.

use std::{collections::HashSet, hash::Hash};

/// An immutable request for shared (read) and exclusive (write) rights.
///
/// Rights are de-duplicated sets, so equality ignores the order and
/// multiplicity they were supplied in. The id identifies the requester for
/// diagnostics and conflict reporting; it carries no conflict semantics.
#[derive(Clone, Debug)]
pub struct AccessRequest<Id, R> {
    id: Id,
    read_rights: HashSet<R>,
    write_rights: HashSet<R>,
}

// Derived impls would only demand `R: PartialEq`, but comparing the
// `HashSet` fields needs the full `Eq + Hash`.
impl<Id: PartialEq, R: Eq + Hash> PartialEq for AccessRequest<Id, R> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id &&
            self.read_rights == other.read_rights &&
            self.write_rights == other.write_rights
    }
}

impl<Id: Eq, R: Eq + Hash> Eq for AccessRequest<Id, R> {}

impl<Id, R: Eq + Hash> AccessRequest<Id, R> {
    /// Creates a request for the given right sets.
    pub fn new(
        id: Id,
        read_rights: impl IntoIterator<Item = R>,
        write_rights: impl IntoIterator<Item = R>,
    ) -> Self {
        Self {
            id,
            read_rights: read_rights.into_iter().collect(),
            write_rights: write_rights.into_iter().collect(),
        }
    }

    /// A request for a single shared right.
    pub fn read_request(id: Id, right: R) -> Self {
        Self::new(id, [right], [])
    }

    /// A request for a single exclusive right.
    pub fn write_request(id: Id, right: R) -> Self {
        Self::new(id, [], [right])
    }

    /// The requester id.
    pub fn access_id(&self) -> &Id {
        &self.id
    }

    /// The shared rights.
    pub fn read_rights(&self) -> &HashSet<R> {
        &self.read_rights
    }

    /// The exclusive rights.
    pub fn write_rights(&self) -> &HashSet<R> {
        &self.write_rights
    }
}
