use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::LockResource;
use super::LockType;
use crate::LockError;
use crate::Result;

#[derive(Default)]
struct LockNode {
    tokens: HashMap<u64, LockType>,
    children: HashMap<String, LockNode>,
}

impl LockNode {
    fn is_vacant(&self) -> bool {
        self.tokens.is_empty() && self.children.is_empty()
    }

    /// Can `resource` be granted next to every lock already held here?
    fn is_free_for(
        &self,
        resource: &LockResource,
    ) -> bool {
        if resource.lock_type() != LockType::None
            && self
                .tokens
                .values()
                .any(|held| held.conflicts_with(resource.lock_type()))
        {
            return false;
        }
        resource.children().all(|(name, child)| match self.children.get(name) {
            Some(node) => node.is_free_for(child),
            None => true,
        })
    }

    /// Is every locked node of `resource` covered by `base` with at least the
    /// requested strength?
    fn is_covered_by(
        &self,
        base: u64,
        resource: &LockResource,
    ) -> bool {
        let wanted = resource.lock_type();
        if wanted != LockType::None {
            match self.tokens.get(&base) {
                Some(held) if *held >= wanted => {}
                _ => return false,
            }
        }
        resource.children().all(|(name, child)| {
            if child.is_empty() {
                return true;
            }
            self.children
                .get(name)
                .is_some_and(|node| node.is_covered_by(base, child))
        })
    }

    fn acquire(
        &mut self,
        token: u64,
        resource: &LockResource,
    ) {
        if resource.lock_type() != LockType::None {
            self.tokens.insert(token, resource.lock_type());
        }
        for (name, child) in resource.children() {
            if child.is_empty() {
                continue;
            }
            self.children.entry(name.to_string()).or_default().acquire(token, child);
        }
    }

    fn release(
        &mut self,
        token: u64,
        resource: &LockResource,
    ) {
        if resource.lock_type() != LockType::None {
            self.tokens.remove(&token);
        }
        for (name, child) in resource.children() {
            if let Some(node) = self.children.get_mut(name) {
                node.release(token, child);
                if node.is_vacant() {
                    self.children.remove(name);
                }
            }
        }
    }
}

#[derive(Default)]
struct LockState {
    root: LockNode,
    resources: HashMap<u64, LockResource>,
    next_token_id: u64,
}

impl LockState {
    fn grant(
        &mut self,
        resource: &LockResource,
    ) -> u64 {
        self.next_token_id += 1;
        let id = self.next_token_id;
        self.root.acquire(id, resource);
        self.resources.insert(id, resource.clone());
        id
    }
}

struct LockManagerInner {
    state: Mutex<LockState>,
    released: Arc<Notify>,
}

/// Grants and releases hierarchical locks.
///
/// Cloning is cheap and every clone refers to the same lock table. Tokens
/// keep a handle to their manager, so they may be released from any thread.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockManagerInner>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("held", &self.held_count())
            .finish()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockManagerInner {
                state: Mutex::new(LockState::default()),
                released: Arc::new(Notify::new()),
            }),
        }
    }

    /// Grants `resource` if it conflicts with no held lock. Never blocks.
    pub fn try_acquire_lock(
        &self,
        resource: &LockResource,
    ) -> Option<LockToken> {
        let mut state = self.inner.state.lock();
        if !state.root.is_free_for(resource) {
            trace!("lock busy: {:?}", resource);
            return None;
        }
        let id = state.grant(resource);
        Some(LockToken {
            manager: self.clone(),
            id,
            can_release: true,
        })
    }

    /// Grants `resource` under the authority of `base`.
    ///
    /// Every node locked by `resource` must already be held by `base`; a
    /// write request additionally needs a write lock on `base`. Locks held
    /// by other tokens are not consulted.
    pub fn try_acquire_lock_with(
        &self,
        base: &LockToken,
        resource: &LockResource,
    ) -> Result<Option<LockToken>> {
        if !Arc::ptr_eq(&self.inner, &base.manager.inner) {
            return Err(LockError::ForeignToken(base.id).into());
        }
        let mut state = self.inner.state.lock();
        if !state.resources.contains_key(&base.id) || !state.root.is_covered_by(base.id, resource) {
            return Ok(None);
        }
        let id = state.grant(resource);
        Ok(Some(LockToken {
            manager: self.clone(),
            id,
            can_release: true,
        }))
    }

    /// Releases the lock behind `token`. Releasing twice is a no-op.
    pub fn release_lock(
        &self,
        token: &LockToken,
    ) -> Result<()> {
        if !token.can_release {
            return Err(LockError::NotReleasable(token.id).into());
        }
        if !Arc::ptr_eq(&self.inner, &token.manager.inner) {
            return Err(LockError::ForeignToken(token.id).into());
        }
        {
            let mut state = self.inner.state.lock();
            let Some(resource) = state.resources.remove(&token.id) else {
                return Ok(());
            };
            state.root.release(token.id, &resource);
        }
        trace!("lock {} released", token.id);
        self.inner.released.notify_one();
        Ok(())
    }

    /// Number of tokens currently holding a lock.
    pub fn held_count(&self) -> usize {
        self.inner.state.lock().resources.len()
    }

    pub(crate) fn is_held(
        &self,
        token_id: u64,
    ) -> bool {
        self.inner.state.lock().resources.contains_key(&token_id)
    }

    /// Signalled whenever a lock is released.
    pub(crate) fn release_notifier(&self) -> Arc<Notify> {
        self.inner.released.clone()
    }
}

/// Proof of a granted lock.
///
/// Clones share the same lock. A [`readonly`](LockToken::readonly) view can
/// be handed to downstream properties: it proves the lock is held but cannot
/// release it.
#[derive(Clone)]
pub struct LockToken {
    manager: LockManager,
    id: u64,
    can_release: bool,
}

impl fmt::Debug for LockToken {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("id", &self.id)
            .field("can_release", &self.can_release)
            .finish()
    }
}

impl LockToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn can_release(&self) -> bool {
        self.can_release
    }

    pub fn readonly(&self) -> LockToken {
        LockToken {
            manager: self.manager.clone(),
            id: self.id,
            can_release: false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.manager.is_held(self.id)
    }

    pub fn release(&self) -> Result<()> {
        self.manager.release_lock(self)
    }

    /// Derives a new, releasable token for a part of what this token holds.
    pub fn try_acquire(
        &self,
        resource: &LockResource,
    ) -> Option<LockToken> {
        self.manager.try_acquire_lock_with(self, resource).ok().flatten()
    }
}
