//! Hierarchical rights.

/// A right addressed by a path of components.
///
/// Two rights are related when one path is a prefix of the other; holding a
/// right implicitly covers everything below it. The empty path is the
/// universal right covering the whole hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HierarchicalRight<C> {
    components: Vec<C>,
}

impl<C> HierarchicalRight<C> {
    /// Creates the right addressed by `components`.
    pub fn new(components: impl IntoIterator<Item = C>) -> Self {
        Self { components: components.into_iter().collect() }
    }

    /// The universal right: ancestor of every right, conflicting with all.
    pub fn universal() -> Self {
        Self { components: Vec::new() }
    }

    /// The path of this right.
    pub fn components(&self) -> &[C] {
        &self.components
    }

    /// Returns whether this is the universal right.
    pub fn is_universal(&self) -> bool {
        self.components.is_empty()
    }
}

impl<C: Eq> HierarchicalRight<C> {
    /// The right one level up, or `None` for the universal right.
    pub fn parent(&self) -> Option<Self>
    where
        C: Clone,
    {
        match self.components.split_last() {
            Some((_, parent)) => Some(Self { components: parent.to_vec() }),
            None => None,
        }
    }

    /// Returns whether this right's path is a prefix of `other`'s.
    ///
    /// Every right is an ancestor of itself.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other.components.len() >= self.components.len() &&
            other.components[..self.components.len()] == self.components[..]
    }

    /// Returns whether the two rights cover overlapping parts of the
    /// hierarchy, i.e. one is an ancestor of the other.
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }
}

impl<C> FromIterator<C> for HierarchicalRight<C> {
    fn from_iter<I: IntoIterator<Item = C>>(iter: I) -> Self {
        Self::new(iter)
    }
}
