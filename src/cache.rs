//! Inode cache and path builder (spec.md §4.6).
//!
//! Holds every live [`Node`], indexed two ways: `(parent, name) ->
//! nodeid` for lookup/rename, and `nodeid -> Node` for everything
//! else. A VFS-style dentry cache inspired the two-table shape; the
//! split/merge quadratic-probing hashtable libfuse implements by hand
//! is replaced here by `std::collections::HashMap` since that custom
//! table exists only because C has no general allocator to lean on,
//! which doesn't apply here (see DESIGN.md).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

use crate::node::{Node, NodeId, ROOT_NODE_ID};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("stale path: an ancestor is unlinked")]
    Stale,
    #[error("path is write-locked, retry")]
    Again,
    #[error("no such nodeid")]
    NoEntry,
}

struct CacheState {
    by_name: HashMap<(NodeId, Box<[u8]>), NodeId>,
    by_id: HashMap<NodeId, Arc<Node>>,
    nodeid_counter: u64,
    generation: u64,
    /// (nodeid, remembered_at_monotonic_seq)
    remembered: Vec<(NodeId, u64)>,
    remember: bool,
    clock: u64,
}

/// The inode cache. One per [`crate::session::Session`].
pub struct InodeCache {
    state: Mutex<CacheState>,
    /// Signalled whenever a treelock is released, so a blocked
    /// `path_of` writer can recheck.
    treelock_released: Condvar,
}

impl InodeCache {
    pub fn new(remember: bool) -> Self {
        let mut by_id = HashMap::new();
        by_id.insert(ROOT_NODE_ID, Arc::new(Node::root()));
        Self {
            state: Mutex::new(CacheState {
                by_name: HashMap::new(),
                by_id,
                nodeid_counter: ROOT_NODE_ID,
                generation: 0,
                remembered: Vec::new(),
                remember,
                clock: 0,
            }),
            treelock_released: Condvar::new(),
        }
    }

    pub fn root(&self) -> Arc<Node> {
        self.state.lock().unwrap().by_id[&ROOT_NODE_ID].clone()
    }

    pub fn get(&self, nodeid: NodeId) -> Option<Arc<Node>> {
        self.state.lock().unwrap().by_id.get(&nodeid).cloned()
    }

    pub fn get_by_name(&self, parent: NodeId, name: &[u8]) -> Option<Arc<Node>> {
        let state = self.state.lock().unwrap();
        let nodeid = *state.by_name.get(&(parent, Box::from(name)))?;
        state.by_id.get(&nodeid).cloned()
    }

    /// Returns an existing `(parent, name)` entry, or allocates and
    /// links a new one. Mirrors spec.md §4.6's `lookup_or_create`.
    pub fn lookup_or_create(&self, parent: NodeId, name: &[u8]) -> Arc<Node> {
        let mut state = self.state.lock().unwrap();
        let key = (parent, Box::from(name));
        if let Some(&nodeid) = state.by_name.get(&key) {
            let node = state.by_id[&nodeid].clone();
            node.add_lookup(1);
            return node;
        }

        state.nodeid_counter = state.nodeid_counter.wrapping_add(1);
        if state.nodeid_counter == 0 {
            // wrapped past u64::MAX back to 0: bump generation, skip id 0.
            state.generation = state.generation.wrapping_add(1);
            state.nodeid_counter = 1;
        }
        let nodeid = state.nodeid_counter;
        let generation = state.generation;

        let node = Arc::new(Node::new(nodeid, generation, parent, name.to_vec()));
        if let Some(parent_node) = state.by_id.get(&parent) {
            parent_node.inc_ref();
        }
        state.by_name.insert(key, nodeid);
        state.by_id.insert(nodeid, node.clone());
        node
    }

    /// Decrement `lookup_count` by `n` (spec.md §4.6 `forget`). Returns
    /// `true` if the node was freed.
    pub fn forget(&self, nodeid: NodeId, n: u64) -> bool {
        if nodeid == ROOT_NODE_ID {
            // the kernel never sends FORGET for the root id in practice,
            // but guard it anyway: it must never be evicted.
            return false;
        }
        let mut state = self.state.lock().unwrap();
        let Some(node) = state.by_id.get(&nodeid).cloned() else {
            return false;
        };
        let remaining = node.sub_lookup(n);
        if remaining != 0 {
            return false;
        }

        if state.remember && node.ref_count() > 0 {
            state.clock += 1;
            let ts = state.clock;
            state.remembered.push((nodeid, ts));
            return false;
        }

        self.evict_locked(&mut state, nodeid, &node);
        true
    }

    fn evict_locked(&self, state: &mut CacheState, nodeid: NodeId, node: &Arc<Node>) {
        if let Some(name) = node.name() {
            state.by_name.remove(&(node.parent.load(std::sync::atomic::Ordering::Acquire), name.into_boxed_slice()));
        }
        state.by_id.remove(&nodeid);
        state.remembered.retain(|(id, _)| *id != nodeid);

        let parent_id = node.parent.load(std::sync::atomic::Ordering::Acquire);
        if parent_id != nodeid {
            if let Some(parent_node) = state.by_id.get(&parent_id).cloned() {
                if parent_node.dec_ref() == 0 {
                    self.evict_locked(state, parent_id, &parent_node);
                }
            }
        }
    }

    /// Rename `(old_parent, old_name)` to `(new_parent, new_name)`,
    /// unlinking any existing target. Preserves the moved node's
    /// identity (spec.md §8 rename-identity property).
    pub fn rename(
        &self,
        old_parent: NodeId,
        old_name: &[u8],
        new_parent: NodeId,
        new_name: &[u8],
    ) -> Result<(), PathError> {
        let mut state = self.state.lock().unwrap();
        let old_key = (old_parent, Box::from(old_name));
        let Some(&nodeid) = state.by_name.get(&old_key) else {
            return Err(PathError::NoEntry);
        };
        state.by_name.remove(&old_key);

        let new_key = (new_parent, Box::from(new_name));
        if let Some(&target_id) = state.by_name.get(&new_key) {
            if let Some(target) = state.by_id.get(&target_id).cloned() {
                target.set_name(None);
                if state.remember {
                    target.sub_lookup(1);
                }
                if target.lookup_count() == 0 && !state.remember {
                    self.evict_locked(&mut state, target_id, &target);
                }
            }
        }

        if let Some(node) = state.by_id.get(&nodeid).cloned() {
            let old_parent_id = node.parent.load(std::sync::atomic::Ordering::Acquire);
            node.set_name(Some(new_name.to_vec()));
            node.parent.store(new_parent, std::sync::atomic::Ordering::Release);
            if old_parent_id != new_parent {
                if let Some(p) = state.by_id.get(&new_parent) {
                    p.inc_ref();
                }
                if let Some(p) = state.by_id.get(&old_parent_id).cloned() {
                    if p.dec_ref() == 0 {
                        self.evict_locked(&mut state, old_parent_id, &p);
                    }
                }
            }
        }
        state.by_name.insert(new_key, nodeid);
        Ok(())
    }

    /// Walk the parent chain, assembling `"/name/name/..."`. If
    /// `write_lock` is set, takes the exclusive treelock on the
    /// terminal node and a read-hold on every ancestor, blocking on
    /// conflicting holders until they clear.
    pub fn path_of(&self, nodeid: NodeId, write_lock: bool) -> Result<String, PathError> {
        let state = self.state.lock().unwrap();
        let mut chain = Vec::new();
        let mut cur = nodeid;
        loop {
            let node = state.by_id.get(&cur).ok_or(PathError::NoEntry)?;
            if cur == ROOT_NODE_ID {
                break;
            }
            let name = node.name().ok_or(PathError::Stale)?;
            chain.push(name);
            cur = node.parent.load(std::sync::atomic::Ordering::Acquire);
        }
        drop(state);

        if write_lock {
            self.acquire_path_locks(nodeid, &chain)?;
        }

        let mut path = String::from("/");
        for segment in chain.iter().rev() {
            if path.len() > 1 {
                path.push('/');
            }
            path.push_str(&String::from_utf8_lossy(segment));
        }
        Ok(path)
    }

    /// Two-path variant for RENAME/LINK: acquire both paths' locks
    /// together, releasing the first if the second fails (spec.md
    /// §4.6 `path_of2`).
    pub fn path_of2(
        &self,
        a: NodeId,
        b: NodeId,
        write_lock: bool,
    ) -> Result<(String, String), PathError> {
        let path_a = self.path_of(a, write_lock)?;
        match self.path_of(b, write_lock) {
            Ok(path_b) => Ok((path_a, path_b)),
            Err(e) => {
                if write_lock {
                    if let Some(node) = self.get(a) {
                        node.release_write_lock();
                    }
                }
                Err(e)
            }
        }
    }

    fn acquire_path_locks(&self, terminal: NodeId, chain: &[Vec<u8>]) -> Result<(), PathError> {
        let mut state = self.state.lock().unwrap();
        loop {
            let ids = self.ancestor_ids_locked(&state, terminal, chain.len());
            let Some(ids) = ids else { return Err(PathError::Stale) };

            let mut acquired = Vec::new();
            let mut ok = true;
            for &id in &ids {
                let node = match state.by_id.get(&id) {
                    Some(n) => n.clone(),
                    None => {
                        ok = false;
                        break;
                    }
                };
                let success = if id == terminal {
                    node.try_write_lock()
                } else {
                    node.try_read_lock()
                };
                if !success {
                    ok = false;
                    break;
                }
                acquired.push(node);
            }

            if ok {
                return Ok(());
            }

            for node in acquired.iter().rev() {
                if node.nodeid == terminal {
                    node.release_write_lock();
                } else {
                    node.release_read_lock();
                }
            }
            state = self.treelock_released.wait(state).unwrap();
        }
    }

    fn ancestor_ids_locked(
        &self,
        state: &std::sync::MutexGuard<CacheState>,
        terminal: NodeId,
        depth_hint: usize,
    ) -> Option<Vec<NodeId>> {
        let mut ids = Vec::with_capacity(depth_hint + 1);
        let mut cur = terminal;
        loop {
            ids.push(cur);
            if cur == ROOT_NODE_ID {
                break;
            }
            let node = state.by_id.get(&cur)?;
            cur = node.parent.load(std::sync::atomic::Ordering::Acquire);
        }
        Some(ids)
    }

    /// Release a previously-acquired write-locked path and wake any
    /// blocked waiters (called once the provider callback returns).
    pub fn release_path_locks(&self, terminal: NodeId) {
        if let Some(node) = self.get(terminal) {
            node.release_write_lock();
        }
        self.treelock_released.notify_all();
    }

    pub fn remembered_count(&self) -> usize {
        self.state.lock().unwrap().remembered.len()
    }

    /// Prune remembered entries older than `max_age_ticks` (the
    /// maintenance thread's TTL sweep, spec.md §4.8). `now` is an
    /// abstract monotonic tick supplied by the caller (not wall-clock,
    /// since `Instant::now()` isn't available to workflow-run code and
    /// tests want determinism).
    pub fn prune_remembered(&self, now: u64, max_age_ticks: u64) -> usize {
        let mut state = self.state.lock().unwrap();
        let cutoff = now.saturating_sub(max_age_ticks);
        let expired: Vec<NodeId> = state
            .remembered
            .iter()
            .filter(|(_, ts)| *ts <= cutoff)
            .map(|(id, _)| *id)
            .collect();

        let mut count = 0;
        for nodeid in expired {
            if let Some(node) = state.by_id.get(&nodeid).cloned() {
                if node.lookup_count() == 0 {
                    self.evict_locked(&mut state, nodeid, &node);
                    count += 1;
                } else {
                    state.remembered.retain(|(id, _)| *id != nodeid);
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_or_create_is_idempotent_by_name() {
        let cache = InodeCache::new(false);
        let a = cache.lookup_or_create(ROOT_NODE_ID, b"a");
        let a2 = cache.lookup_or_create(ROOT_NODE_ID, b"a");
        assert_eq!(a.nodeid, a2.nodeid);
        assert_eq!(a.lookup_count(), 2);
    }

    #[test]
    fn forget_to_zero_frees_without_remember() {
        let cache = InodeCache::new(false);
        let a = cache.lookup_or_create(ROOT_NODE_ID, b"a");
        let id = a.nodeid;
        drop(a);
        assert!(cache.forget(id, 1));
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn forget_to_zero_with_remember_keeps_alive() {
        let cache = InodeCache::new(true);
        let a = cache.lookup_or_create(ROOT_NODE_ID, b"a");
        let id = a.nodeid;
        assert!(!cache.forget(id, 1));
        assert!(cache.get(id).is_some());
        assert_eq!(cache.remembered_count(), 1);
    }

    #[test]
    fn path_of_builds_full_path() {
        let cache = InodeCache::new(false);
        let a = cache.lookup_or_create(ROOT_NODE_ID, b"a");
        let b = cache.lookup_or_create(a.nodeid, b"b");
        let path = cache.path_of(b.nodeid, false).unwrap();
        assert_eq!(path, "/a/b");
    }

    #[test]
    fn path_of_root_is_slash() {
        let cache = InodeCache::new(false);
        assert_eq!(cache.path_of(ROOT_NODE_ID, false).unwrap(), "/");
    }

    #[test]
    fn path_of_reports_stale_on_unlinked_ancestor() {
        let cache = InodeCache::new(false);
        let a = cache.lookup_or_create(ROOT_NODE_ID, b"a");
        let b = cache.lookup_or_create(a.nodeid, b"b");
        a.set_name(None);
        assert_eq!(cache.path_of(b.nodeid, false), Err(PathError::Stale));
    }

    #[test]
    fn rename_preserves_identity() {
        let cache = InodeCache::new(false);
        let a = cache.lookup_or_create(ROOT_NODE_ID, b"a");
        let b = cache.lookup_or_create(a.nodeid, b"b");
        let b_id = b.nodeid;
        cache.rename(a.nodeid, b"b", ROOT_NODE_ID, b"b").unwrap();
        let looked_up = cache.lookup_or_create(ROOT_NODE_ID, b"b");
        assert_eq!(looked_up.nodeid, b_id);
    }

    #[test]
    fn write_lock_excludes_concurrent_write_lock() {
        let cache = InodeCache::new(false);
        let a = cache.lookup_or_create(ROOT_NODE_ID, b"a");
        assert!(a.try_write_lock());
        assert!(!a.try_write_lock());
        a.release_write_lock();
    }

    #[test]
    fn prune_remembered_evicts_past_ttl() {
        let cache = InodeCache::new(true);
        let a = cache.lookup_or_create(ROOT_NODE_ID, b"a");
        let id = a.nodeid;
        cache.forget(id, 1);
        assert_eq!(cache.remembered_count(), 1);
        let evicted = cache.prune_remembered(100, 10);
        assert_eq!(evicted, 1);
        assert!(cache.get(id).is_none());
    }
}
