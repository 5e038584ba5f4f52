//! Hierarchical locking for external requests.
//!
//! A [`LockResource`] is a tree of named nodes, each carrying a [`LockType`].
//! Two resources conflict when the same node is locked by both and at least
//! one side holds it for writing. Locks on a node do not extend to its
//! children.

mod lock_manager;

pub use lock_manager::*;


use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockType {
    #[default]
    None,
    Read,
    Write,
}

impl LockType {
    pub fn conflicts_with(
        self,
        other: LockType,
    ) -> bool {
        match (self, other) {
            (LockType::None, _) | (_, LockType::None) => false,
            (LockType::Read, LockType::Read) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockResource {
    lock_type: LockType,
    children: BTreeMap<String, LockResource>,
}

impl LockResource {
    pub fn new(lock_type: LockType) -> Self {
        Self {
            lock_type,
            children: BTreeMap::new(),
        }
    }

    /// Builds a chain of nodes from `segments`, locking only the last one.
    ///
    /// `LockResource::path(["users", "42"], LockType::Write)` locks node
    /// `users/42` for writing and leaves `users` itself unlocked.
    pub fn path<I, S>(
        segments: I,
        lock_type: LockType,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        segments
            .into_iter()
            .rev()
            .fold(LockResource::new(lock_type), |node, segment| {
                LockResource::default().with_child(segment, node)
            })
    }

    pub fn with_child(
        mut self,
        name: impl Into<String>,
        child: LockResource,
    ) -> Self {
        self.children.insert(name.into(), child);
        self
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn set_lock_type(
        &mut self,
        lock_type: LockType,
    ) {
        self.lock_type = lock_type;
    }

    pub fn child(
        &self,
        name: &str,
    ) -> Option<&LockResource> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &LockResource)> {
        self.children.iter().map(|(name, child)| (name.as_str(), child))
    }

    /// True when no node of the tree carries a lock.
    pub fn is_empty(&self) -> bool {
        self.lock_type == LockType::None && self.children.values().all(LockResource::is_empty)
    }

    /// Unions `other` into `self`, keeping the stronger type on shared nodes.
    pub fn merge(
        &mut self,
        other: &LockResource,
    ) {
        self.lock_type = self.lock_type.max(other.lock_type);
        for (name, child) in &other.children {
            self.children.entry(name.clone()).or_default().merge(child);
        }
    }

    pub fn conflicts(
        &self,
        other: &LockResource,
    ) -> bool {
        if self.lock_type.conflicts_with(other.lock_type) {
            return true;
        }
        self.children.iter().any(|(name, child)| {
            other
                .children
                .get(name)
                .is_some_and(|other_child| child.conflicts(other_child))
        })
    }

    /// Returns a copy where every locked node is downgraded/upgraded to
    /// `lock_type`.
    pub fn with_all_types(
        &self,
        lock_type: LockType,
    ) -> LockResource {
        LockResource {
            lock_type: if self.lock_type == LockType::None {
                LockType::None
            } else {
                lock_type
            },
            children: self
                .children
                .iter()
                .map(|(name, child)| (name.clone(), child.with_all_types(lock_type)))
                .collect(),
        }
    }
}
