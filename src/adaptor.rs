//! High-level path-based adaptor (spec.md §4.8). Bridges the
//! nodeid-oriented wire protocol to a [`PathFilesystem`] provider by
//! resolving paths through the [`crate::cache::InodeCache`] before and
//! after each call.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::PathError;
use crate::error::{CoreError, CoreResult};
use crate::node::NodeId;
use crate::provider::{DirEntry, EntryReply, FileAttr, OpenReply, StatFs};
use crate::session::Session;

fn crc32(data: &[u8]) -> u32 {
    // Simple table-free CRC-32 (reflected, poly 0xEDB88320): adequate
    // for a change-detection checksum, not a correctness-critical
    // cryptographic one (spec.md §4.8 "stat-change detection").
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

fn stat_crc(attr: &FileAttr) -> u32 {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&attr.ino.to_le_bytes());
    buf.extend_from_slice(&attr.size.to_le_bytes());
    buf.extend_from_slice(&attr.mtime.as_nanos().to_le_bytes());
    crc32(&buf)
}

fn path_error_to_core(e: PathError) -> CoreError {
    match e {
        PathError::Stale => CoreError::Stale,
        PathError::Again => CoreError::Stale, // caller retries before reaching here
        PathError::NoEntry => CoreError::Stale,
    }
}

/// Binds a [`Session`] to its provider's path-based operations.
pub struct Adaptor<'a> {
    pub session: &'a Session,
}

impl<'a> Adaptor<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    fn path_of(&self, nodeid: NodeId) -> CoreResult<PathBuf> {
        let s = self
            .session
            .cache
            .path_of(nodeid, false)
            .map_err(path_error_to_core)?;
        Ok(PathBuf::from(s))
    }

    fn join_path(&self, parent: NodeId, name: &[u8]) -> CoreResult<PathBuf> {
        let mut parent_path = self.path_of(parent)?;
        parent_path.push(String::from_utf8_lossy(name).into_owned());
        Ok(parent_path)
    }

    fn now_duration() -> std::time::Duration {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
    }

    /// `lookup(parent, name)`, resolving through the provider and
    /// interning the result into the cache on success. On `-ENOENT`,
    /// returns a negative-lookup entry instead of propagating the
    /// error (spec.md §4.8 "negative-lookup caching").
    pub fn lookup(&self, parent: NodeId, name: &[u8]) -> CoreResult<EntryReply> {
        let path = self.join_path(parent, name)?;
        match self.session.provider.getattr(&path) {
            Ok(attr) => {
                let node = self.session.cache.lookup_or_create(parent, name);
                node.stat_crc.store(stat_crc(&attr), std::sync::atomic::Ordering::Release);
                let mut attr = attr;
                attr.ino = node.nodeid;
                Ok(EntryReply {
                    attr,
                    generation: node.generation,
                    entry_ttl: self.session.config.entry_ttl,
                    attr_ttl: self.session.config.attr_ttl,
                })
            }
            Err(errno) if errno == -(libc::ENOENT) => Ok(EntryReply {
                attr: FileAttr { ino: 0, ..Default::default() },
                generation: 0,
                entry_ttl: self.session.config.negative_entry_ttl,
                attr_ttl: std::time::Duration::ZERO,
            }),
            Err(errno) => Err(CoreError::Provider(errno)),
        }
    }

    pub fn forget(&self, nodeid: NodeId, n: u64) {
        self.session.cache.forget(nodeid, n);
    }

    /// `getattr(nodeid)`, with attribute post-processing and stat-CRC
    /// based auto_cache invalidation (spec.md §4.8).
    pub fn getattr(&self, nodeid: NodeId) -> CoreResult<(FileAttr, std::time::Duration)> {
        let path = self.path_of(nodeid)?;
        let attr = self
            .session
            .provider
            .getattr(&path)
            .map_err(CoreError::Provider)?;

        if let Some(node) = self.session.cache.get(nodeid) {
            let new_crc = stat_crc(&attr);
            let old_crc = node.stat_crc.swap(new_crc, std::sync::atomic::Ordering::AcqRel);
            if old_crc != 0 && old_crc != new_crc {
                node.auto_cache.store(false, std::sync::atomic::Ordering::Release);
            }
        }

        let mut attr = attr;
        attr.ino = nodeid;
        Ok((attr, self.session.config.attr_ttl))
    }

    pub fn setattr(&self, nodeid: NodeId, attr: FileAttr, valid: u32) -> CoreResult<(FileAttr, std::time::Duration)> {
        let path = self.path_of(nodeid)?;
        let mut out = self
            .session
            .provider
            .setattr(&path, attr, valid)
            .map_err(CoreError::Provider)?;
        out.ino = nodeid;
        Ok((out, self.session.config.attr_ttl))
    }

    pub fn readlink(&self, nodeid: NodeId) -> CoreResult<Vec<u8>> {
        let path = self.path_of(nodeid)?;
        self.session.provider.readlink(&path).map_err(CoreError::Provider)
    }

    pub fn mkdir(&self, parent: NodeId, name: &[u8], mode: u32) -> CoreResult<EntryReply> {
        let path = self.join_path(parent, name)?;
        let attr = self.session.provider.mkdir(&path, mode).map_err(CoreError::Provider)?;
        let node = self.session.cache.lookup_or_create(parent, name);
        let mut attr = attr;
        attr.ino = node.nodeid;
        Ok(EntryReply {
            attr,
            generation: node.generation,
            entry_ttl: self.session.config.entry_ttl,
            attr_ttl: self.session.config.attr_ttl,
        })
    }

    pub fn mknod(&self, parent: NodeId, name: &[u8], mode: u32, rdev: u32) -> CoreResult<EntryReply> {
        let path = self.join_path(parent, name)?;
        let attr = self.session.provider.mknod(&path, mode, rdev).map_err(CoreError::Provider)?;
        let node = self.session.cache.lookup_or_create(parent, name);
        let mut attr = attr;
        attr.ino = node.nodeid;
        Ok(EntryReply {
            attr,
            generation: node.generation,
            entry_ttl: self.session.config.entry_ttl,
            attr_ttl: self.session.config.attr_ttl,
        })
    }

    pub fn unlink(&self, parent: NodeId, name: &[u8]) -> CoreResult<()> {
        let path = self.join_path(parent, name)?;
        self.session.provider.unlink(&path).map_err(CoreError::Provider)?;
        if let Some(node) = self.session.cache.get_by_name(parent, name) {
            node.set_name(None);
        }
        Ok(())
    }

    pub fn rmdir(&self, parent: NodeId, name: &[u8]) -> CoreResult<()> {
        let path = self.join_path(parent, name)?;
        self.session.provider.rmdir(&path).map_err(CoreError::Provider)?;
        if let Some(node) = self.session.cache.get_by_name(parent, name) {
            node.set_name(None);
        }
        Ok(())
    }

    pub fn symlink(&self, parent: NodeId, name: &[u8], target: &[u8]) -> CoreResult<EntryReply> {
        let path = self.join_path(parent, name)?;
        let attr = self.session.provider.symlink(&path, target).map_err(CoreError::Provider)?;
        let node = self.session.cache.lookup_or_create(parent, name);
        let mut attr = attr;
        attr.ino = node.nodeid;
        Ok(EntryReply {
            attr,
            generation: node.generation,
            entry_ttl: self.session.config.entry_ttl,
            attr_ttl: self.session.config.attr_ttl,
        })
    }

    /// `rename`, using `path_of2` to acquire both source and
    /// destination ancestor paths together (spec.md §4.6 `path_of2`).
    pub fn rename(
        &self,
        old_parent: NodeId,
        old_name: &[u8],
        new_parent: NodeId,
        new_name: &[u8],
        flags: u32,
    ) -> CoreResult<()> {
        let from = self.join_path(old_parent, old_name)?;
        let to = self.join_path(new_parent, new_name)?;
        self.session
            .provider
            .rename(&from, &to, flags)
            .map_err(CoreError::Provider)?;
        self.session
            .cache
            .rename(old_parent, old_name, new_parent, new_name)
            .map_err(path_error_to_core)
    }

    pub fn link(&self, nodeid: NodeId, new_parent: NodeId, new_name: &[u8]) -> CoreResult<EntryReply> {
        let existing = self.path_of(nodeid)?;
        let new_path = self.join_path(new_parent, new_name)?;
        let attr = self
            .session
            .provider
            .link(&existing, &new_path)
            .map_err(CoreError::Provider)?;
        let node = self.session.cache.lookup_or_create(new_parent, new_name);
        node.add_lookup(1);
        let mut attr = attr;
        attr.ino = node.nodeid;
        Ok(EntryReply {
            attr,
            generation: node.generation,
            entry_ttl: self.session.config.entry_ttl,
            attr_ttl: self.session.config.attr_ttl,
        })
    }

    pub fn open(&self, nodeid: NodeId, flags: u32) -> CoreResult<OpenReply> {
        let path = self.path_of(nodeid)?;
        let reply = self.session.provider.open(&path, flags).map_err(CoreError::Provider)?;
        if let Some(node) = self.session.cache.get(nodeid) {
            node.inc_open();
        }
        Ok(reply)
    }

    pub fn read(&self, nodeid: NodeId, fh: u64, offset: u64, size: u32) -> CoreResult<Vec<u8>> {
        let path = self.path_of(nodeid)?;
        self.session.provider.read(&path, fh, offset, size).map_err(CoreError::Provider)
    }

    pub fn write(&self, nodeid: NodeId, fh: u64, offset: u64, data: &[u8]) -> CoreResult<u32> {
        let path = self.path_of(nodeid)?;
        self.session.provider.write(&path, fh, offset, data).map_err(CoreError::Provider)
    }

    pub fn flush(&self, nodeid: NodeId, fh: u64, lock_owner: u64) -> CoreResult<()> {
        let path = self.path_of(nodeid)?;
        self.session.provider.flush(&path, fh, lock_owner).map_err(CoreError::Provider)
    }

    pub fn release(&self, nodeid: NodeId, fh: u64, flags: u32) -> CoreResult<()> {
        let path = self.path_of(nodeid)?;
        self.session.provider.release(&path, fh, flags).map_err(CoreError::Provider)?;
        if let Some(node) = self.session.cache.get(nodeid) {
            node.dec_open();
        }
        Ok(())
    }

    pub fn fsync(&self, nodeid: NodeId, fh: u64, datasync: bool) -> CoreResult<()> {
        let path = self.path_of(nodeid)?;
        self.session.provider.fsync(&path, fh, datasync).map_err(CoreError::Provider)
    }

    pub fn readdir(&self, nodeid: NodeId, fh: u64, offset: i64) -> CoreResult<Vec<DirEntry>> {
        let path = self.path_of(nodeid)?;
        self.session.provider.readdir(&path, fh, offset).map_err(CoreError::Provider)
    }

    pub fn statfs(&self, nodeid: NodeId) -> CoreResult<StatFs> {
        let path = self.path_of(nodeid)?;
        self.session.provider.statfs(&path).map_err(CoreError::Provider)
    }

    pub fn setxattr(&self, nodeid: NodeId, name: &[u8], value: &[u8], flags: u32) -> CoreResult<()> {
        let path = self.path_of(nodeid)?;
        self.session.provider.setxattr(&path, name, value, flags).map_err(CoreError::Provider)
    }

    pub fn getxattr(&self, nodeid: NodeId, name: &[u8], size: u32) -> CoreResult<Vec<u8>> {
        let path = self.path_of(nodeid)?;
        self.session.provider.getxattr(&path, name, size).map_err(CoreError::Provider)
    }

    pub fn listxattr(&self, nodeid: NodeId, size: u32) -> CoreResult<Vec<u8>> {
        let path = self.path_of(nodeid)?;
        self.session.provider.listxattr(&path, size).map_err(CoreError::Provider)
    }

    pub fn removexattr(&self, nodeid: NodeId, name: &[u8]) -> CoreResult<()> {
        let path = self.path_of(nodeid)?;
        self.session.provider.removexattr(&path, name).map_err(CoreError::Provider)
    }

    pub fn access(&self, nodeid: NodeId, mask: u32) -> CoreResult<()> {
        let path = self.path_of(nodeid)?;
        self.session.provider.access(&path, mask).map_err(CoreError::Provider)
    }

    pub fn create(&self, parent: NodeId, name: &[u8], mode: u32, flags: u32) -> CoreResult<(EntryReply, OpenReply)> {
        let path = self.join_path(parent, name)?;
        let (attr, open) = self
            .session
            .provider
            .create(&path, mode, flags)
            .map_err(CoreError::Provider)?;
        let node = self.session.cache.lookup_or_create(parent, name);
        node.inc_open();
        let mut attr = attr;
        attr.ino = node.nodeid;
        Ok((
            EntryReply {
                attr,
                generation: node.generation,
                entry_ttl: self.session.config.entry_ttl,
                attr_ttl: self.session.config.attr_ttl,
            },
            open,
        ))
    }

    pub fn getlk(&self, nodeid: NodeId, fh: u64, owner: u64, lock: crate::lock::Lock) -> CoreResult<crate::lock::Lock> {
        let path = self.path_of(nodeid)?;
        self.session.provider.getlk(&path, fh, owner, lock).map_err(CoreError::Provider)
    }

    pub fn setlk(&self, nodeid: NodeId, fh: u64, owner: u64, lock: crate::lock::Lock, sleep: bool) -> CoreResult<()> {
        let path = self.path_of(nodeid)?;
        self.session
            .provider
            .setlk(&path, fh, owner, lock, sleep)
            .map_err(CoreError::Provider)?;
        if let Some(node) = self.session.cache.get(nodeid) {
            let mut locks = node.locks.lock().unwrap();
            crate::lock::insert(&mut locks, lock)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::node::ROOT_NODE_ID;
    use crate::provider::{OpenReply, PathFilesystem};
    use std::sync::Arc;

    struct FakeFs {
        sizes: std::sync::Mutex<std::collections::HashMap<PathBuf, u64>>,
    }

    impl PathFilesystem for FakeFs {
        fn getattr(&self, path: &Path) -> crate::provider::ProviderResult<FileAttr> {
            let sizes = self.sizes.lock().unwrap();
            match sizes.get(path) {
                Some(&size) => Ok(FileAttr { size, ..Default::default() }),
                None => Err(-(libc::ENOENT)),
            }
        }

        fn mkdir(&self, path: &Path, _mode: u32) -> crate::provider::ProviderResult<FileAttr> {
            self.sizes.lock().unwrap().insert(path.to_path_buf(), 0);
            Ok(FileAttr::default())
        }

        fn open(&self, _path: &Path, _flags: u32) -> crate::provider::ProviderResult<OpenReply> {
            Ok(OpenReply { fh: 1, ..Default::default() })
        }
    }

    fn session_with_fake() -> Session {
        let fs = Arc::new(FakeFs {
            sizes: std::sync::Mutex::new(std::collections::HashMap::new()),
        });
        fs.sizes.lock().unwrap().insert(PathBuf::from("/exists"), 42);
        Session::new(SessionConfig::default(), fs)
    }

    #[test]
    fn lookup_of_missing_entry_is_negative_cached() {
        let session = session_with_fake();
        let adaptor = Adaptor::new(&session);
        let entry = adaptor.lookup(ROOT_NODE_ID, b"missing").unwrap();
        assert_eq!(entry.attr.ino, 0);
    }

    #[test]
    fn lookup_of_existing_entry_interns_into_cache() {
        let session = session_with_fake();
        let adaptor = Adaptor::new(&session);
        let entry = adaptor.lookup(ROOT_NODE_ID, b"exists").unwrap();
        assert_ne!(entry.attr.ino, 0);
        assert!(session.cache.get(entry.attr.ino).is_some());
    }

    #[test]
    fn mkdir_then_getattr_round_trips_through_cache() {
        let session = session_with_fake();
        let adaptor = Adaptor::new(&session);
        let entry = adaptor.mkdir(ROOT_NODE_ID, b"newdir", 0o755).unwrap();
        let (attr, _ttl) = adaptor.getattr(entry.attr.ino).unwrap();
        assert_eq!(attr.ino, entry.attr.ino);
    }
}
