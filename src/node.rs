//! The inode record (spec.md §3 "Node").
//!
//! Identity is `(nodeid, generation)`: `nodeid` is a 64-bit id unique
//! for the life of the mount, `generation` is bumped only when the id
//! counter wraps (considered impossible within a process lifetime, but
//! modeled anyway) or on an explicit reset. The root node always has
//! `nodeid == 1` (`FUSE_ROOT_ID`) and is never evicted.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::lock::Lock;

pub type NodeId = u64;

pub const ROOT_NODE_ID: NodeId = crate::abi::FUSE_ROOT_ID;

/// `treelock > 0` means N read-holders, `-1` an exclusive writer, and
/// beyond `i32::MIN / 2` a "waiting to go exclusive" marker (spec.md §3
/// invariant 5 / libfuse's `TREELOCK_WRITE`/`TREELOCK_WAIT_OFFSET`).
pub const TREELOCK_WRITE: i32 = -1;
pub const TREELOCK_WAIT_OFFSET: i32 = i32::MIN;

/// One inode record. Name ownership: the node owns its name buffer;
/// per spec.md §9 Open Question, interning is left as a future
/// optimization rather than attempted here.
pub struct Node {
    pub nodeid: NodeId,
    pub generation: u64,
    /// `None` once unlinked; `path_of` treats a nameless ancestor as
    /// the STALE condition (invariant 2).
    name: Mutex<Option<Box<[u8]>>>,
    pub parent: AtomicU64,
    lookup_count: AtomicU64,
    ref_count: AtomicU32,
    open_count: AtomicU32,
    treelock: AtomicI64,
    pub stat_crc: AtomicU32,
    pub auto_cache: std::sync::atomic::AtomicBool,
    pub locks: Mutex<Vec<Lock>>,
}

impl Node {
    pub fn new(nodeid: NodeId, generation: u64, parent: NodeId, name: Vec<u8>) -> Self {
        Self {
            nodeid,
            generation,
            name: Mutex::new(Some(name.into_boxed_slice())),
            parent: AtomicU64::new(parent),
            lookup_count: AtomicU64::new(1),
            ref_count: AtomicU32::new(1),
            open_count: AtomicU32::new(0),
            treelock: AtomicI64::new(0),
            stat_crc: AtomicU32::new(0),
            auto_cache: std::sync::atomic::AtomicBool::new(true),
            locks: Mutex::new(Vec::new()),
        }
    }

    pub fn root() -> Self {
        Self {
            nodeid: ROOT_NODE_ID,
            generation: 0,
            name: Mutex::new(Some(Box::from(&b""[..]))),
            parent: AtomicU64::new(ROOT_NODE_ID),
            lookup_count: AtomicU64::new(1),
            ref_count: AtomicU32::new(1),
            open_count: AtomicU32::new(0),
            treelock: AtomicI64::new(0),
            stat_crc: AtomicU32::new(0),
            auto_cache: std::sync::atomic::AtomicBool::new(true),
            locks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> Option<Vec<u8>> {
        self.name.lock().unwrap().as_ref().map(|n| n.to_vec())
    }

    pub fn set_name(&self, name: Option<Vec<u8>>) {
        *self.name.lock().unwrap() = name.map(|n| n.into_boxed_slice());
    }

    pub fn is_named(&self) -> bool {
        self.name.lock().unwrap().is_some()
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookup_count.load(Ordering::Acquire)
    }

    pub fn add_lookup(&self, n: u64) {
        self.lookup_count.fetch_add(n, Ordering::AcqRel);
    }

    /// Subtract `n` from the lookup count, saturating at zero. Returns
    /// the count after subtraction.
    pub fn sub_lookup(&self, n: u64) -> u64 {
        loop {
            let cur = self.lookup_count.load(Ordering::Acquire);
            let next = cur.saturating_sub(n);
            if self
                .lookup_count
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the ref count after decrementing.
    pub fn dec_ref(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    pub fn inc_open(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_open(&self) {
        self.open_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Try to take a read-hold on this node's path segment. Fails
    /// (returns `false`) if an exclusive writer holds or is waiting.
    pub fn try_read_lock(&self) -> bool {
        loop {
            let cur = self.treelock.load(Ordering::Acquire);
            if cur < 0 {
                return false;
            }
            if self
                .treelock
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_read_lock(&self) {
        self.treelock.fetch_sub(1, Ordering::AcqRel);
    }

    /// Try to take the exclusive (write) hold. Fails if any readers or
    /// another writer already hold it.
    pub fn try_write_lock(&self) -> bool {
        self.treelock
            .compare_exchange(0, TREELOCK_WRITE as i64, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_write_lock(&self) {
        self.treelock.store(0, Ordering::Release);
    }

    pub fn treelock_state(&self) -> i64 {
        self.treelock.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_never_named_away() {
        let root = Node::root();
        assert_eq!(root.nodeid, ROOT_NODE_ID);
        assert!(root.is_named());
    }

    #[test]
    fn lookup_count_saturates_at_zero() {
        let n = Node::new(2, 0, ROOT_NODE_ID, b"x".to_vec());
        assert_eq!(n.lookup_count(), 1);
        assert_eq!(n.sub_lookup(5), 0);
    }

    #[test]
    fn treelock_excludes_writer_from_readers() {
        let n = Node::new(2, 0, ROOT_NODE_ID, b"x".to_vec());
        assert!(n.try_read_lock());
        assert!(!n.try_write_lock());
        n.release_read_lock();
        assert!(n.try_write_lock());
        assert!(!n.try_read_lock());
    }

    #[test]
    fn ref_count_tracks_children_plus_named() {
        let n = Node::new(2, 0, ROOT_NODE_ID, b"x".to_vec());
        assert_eq!(n.ref_count(), 1);
        n.inc_ref();
        assert_eq!(n.ref_count(), 2);
        assert_eq!(n.dec_ref(), 1);
    }
}
