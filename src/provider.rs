//! Filesystem Provider trait surface (SPEC_FULL.md §4.9). The core
//! never implements a filesystem itself; it calls out to whatever
//! registers one of these traits with a [`crate::session::Session`].
//!
//! Grounded in `original_source/libfuse/include/fuse_lowlevel.h`'s
//! `fuse_lowlevel_ops` callback table and `include/fuse.h`'s
//! path-based `fuse_operations` table — the two API layers libfuse
//! itself exposes.

use std::path::Path;
use std::time::Duration;

use crate::node::NodeId;

/// File attributes handed back by `getattr`/`setattr`/`lookup`, a
/// thin wrapper so providers don't poke at `abi::fuse_attr` directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: Duration,
    pub mtime: Duration,
    pub ctime: Duration,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EntryReply {
    pub attr: FileAttr,
    pub generation: u64,
    pub entry_ttl: Duration,
    pub attr_ttl: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenReply {
    pub fh: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DirEntry {
    pub ino: u64,
    pub name: Vec<u8>,
    pub kind: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// The error type every provider callback returns: a raw negative
/// errno, matching what `CoreError::Provider` carries through the
/// reply codec.
pub type ProviderError = i32;
pub type ProviderResult<T> = Result<T, ProviderError>;

const ENOSYS: ProviderError = -(libc::ENOSYS as i32);

/// Nodeid-based callback table (libfuse's low-level API). Every
/// method defaults to `-ENOSYS`; a provider overrides only what it
/// supports.
pub trait LowLevelFilesystem: Send + Sync {
    fn init(&self, _capabilities: u64) -> ProviderResult<()> {
        Ok(())
    }

    fn destroy(&self) {}

    fn lookup(&self, _parent: NodeId, _name: &[u8]) -> ProviderResult<EntryReply> {
        Err(ENOSYS)
    }

    fn forget(&self, _nodeid: NodeId, _n: u64) {}

    fn getattr(&self, _nodeid: NodeId) -> ProviderResult<FileAttr> {
        Err(ENOSYS)
    }

    fn setattr(&self, _nodeid: NodeId, _attr: FileAttr, _valid: u32) -> ProviderResult<FileAttr> {
        Err(ENOSYS)
    }

    fn readlink(&self, _nodeid: NodeId) -> ProviderResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn mknod(&self, _parent: NodeId, _name: &[u8], _mode: u32, _rdev: u32) -> ProviderResult<EntryReply> {
        Err(ENOSYS)
    }

    fn mkdir(&self, _parent: NodeId, _name: &[u8], _mode: u32) -> ProviderResult<EntryReply> {
        Err(ENOSYS)
    }

    fn unlink(&self, _parent: NodeId, _name: &[u8]) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn rmdir(&self, _parent: NodeId, _name: &[u8]) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn symlink(&self, _parent: NodeId, _name: &[u8], _target: &[u8]) -> ProviderResult<EntryReply> {
        Err(ENOSYS)
    }

    fn rename(
        &self,
        _old_parent: NodeId,
        _old_name: &[u8],
        _new_parent: NodeId,
        _new_name: &[u8],
        _flags: u32,
    ) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn link(&self, _nodeid: NodeId, _new_parent: NodeId, _new_name: &[u8]) -> ProviderResult<EntryReply> {
        Err(ENOSYS)
    }

    fn open(&self, _nodeid: NodeId, _flags: u32) -> ProviderResult<OpenReply> {
        Ok(OpenReply::default())
    }

    fn read(&self, _nodeid: NodeId, _fh: u64, _offset: u64, _size: u32) -> ProviderResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn write(&self, _nodeid: NodeId, _fh: u64, _offset: u64, _data: &[u8]) -> ProviderResult<u32> {
        Err(ENOSYS)
    }

    fn flush(&self, _nodeid: NodeId, _fh: u64, _lock_owner: u64) -> ProviderResult<()> {
        Ok(())
    }

    fn release(&self, _nodeid: NodeId, _fh: u64, _flags: u32) -> ProviderResult<()> {
        Ok(())
    }

    fn fsync(&self, _nodeid: NodeId, _fh: u64, _datasync: bool) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn opendir(&self, _nodeid: NodeId, _flags: u32) -> ProviderResult<OpenReply> {
        Ok(OpenReply::default())
    }

    fn readdir(&self, _nodeid: NodeId, _fh: u64, _offset: i64) -> ProviderResult<Vec<DirEntry>> {
        Err(ENOSYS)
    }

    fn releasedir(&self, _nodeid: NodeId, _fh: u64) -> ProviderResult<()> {
        Ok(())
    }

    fn fsyncdir(&self, _nodeid: NodeId, _fh: u64, _datasync: bool) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn statfs(&self, _nodeid: NodeId) -> ProviderResult<StatFs> {
        Err(ENOSYS)
    }

    fn setxattr(&self, _nodeid: NodeId, _name: &[u8], _value: &[u8], _flags: u32) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn getxattr(&self, _nodeid: NodeId, _name: &[u8], _size: u32) -> ProviderResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn listxattr(&self, _nodeid: NodeId, _size: u32) -> ProviderResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn removexattr(&self, _nodeid: NodeId, _name: &[u8]) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn access(&self, _nodeid: NodeId, _mask: u32) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn create(&self, _parent: NodeId, _name: &[u8], _mode: u32, _flags: u32) -> ProviderResult<(EntryReply, OpenReply)> {
        Err(ENOSYS)
    }

    fn getlk(&self, _nodeid: NodeId, _fh: u64, _owner: u64, _lock: crate::lock::Lock) -> ProviderResult<crate::lock::Lock> {
        Err(ENOSYS)
    }

    fn setlk(&self, _nodeid: NodeId, _fh: u64, _owner: u64, _lock: crate::lock::Lock, _sleep: bool) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn bmap(&self, _nodeid: NodeId, _blocksize: u32, _idx: u64) -> ProviderResult<u64> {
        Err(ENOSYS)
    }

    fn ioctl(&self, _nodeid: NodeId, _fh: u64, _cmd: u32, _in_data: &[u8]) -> ProviderResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn poll(&self, _nodeid: NodeId, _fh: u64, _kh: u64) -> ProviderResult<u32> {
        Err(ENOSYS)
    }
}

/// Path-based callback table, consumed by the High-Level Adaptor
/// (`src/adaptor.rs`). This is the layer most providers implement
/// directly; the same default-`-ENOSYS` convention applies.
pub trait PathFilesystem: Send + Sync {
    fn init(&self, _capabilities: u64) -> ProviderResult<()> {
        Ok(())
    }

    fn destroy(&self) {}

    fn getattr(&self, _path: &Path) -> ProviderResult<FileAttr> {
        Err(ENOSYS)
    }

    fn setattr(&self, _path: &Path, _attr: FileAttr, _valid: u32) -> ProviderResult<FileAttr> {
        Err(ENOSYS)
    }

    fn readlink(&self, _path: &Path) -> ProviderResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn mknod(&self, _path: &Path, _mode: u32, _rdev: u32) -> ProviderResult<FileAttr> {
        Err(ENOSYS)
    }

    fn mkdir(&self, _path: &Path, _mode: u32) -> ProviderResult<FileAttr> {
        Err(ENOSYS)
    }

    fn unlink(&self, _path: &Path) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn rmdir(&self, _path: &Path) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn symlink(&self, _path: &Path, _target: &[u8]) -> ProviderResult<FileAttr> {
        Err(ENOSYS)
    }

    fn rename(&self, _from: &Path, _to: &Path, _flags: u32) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn link(&self, _path: &Path, _new_path: &Path) -> ProviderResult<FileAttr> {
        Err(ENOSYS)
    }

    fn open(&self, _path: &Path, _flags: u32) -> ProviderResult<OpenReply> {
        Ok(OpenReply::default())
    }

    fn read(&self, _path: &Path, _fh: u64, _offset: u64, _size: u32) -> ProviderResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn write(&self, _path: &Path, _fh: u64, _offset: u64, _data: &[u8]) -> ProviderResult<u32> {
        Err(ENOSYS)
    }

    fn flush(&self, _path: &Path, _fh: u64, _lock_owner: u64) -> ProviderResult<()> {
        Ok(())
    }

    fn release(&self, _path: &Path, _fh: u64, _flags: u32) -> ProviderResult<()> {
        Ok(())
    }

    fn fsync(&self, _path: &Path, _fh: u64, _datasync: bool) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn readdir(&self, _path: &Path, _fh: u64, _offset: i64) -> ProviderResult<Vec<DirEntry>> {
        Err(ENOSYS)
    }

    fn statfs(&self, _path: &Path) -> ProviderResult<StatFs> {
        Err(ENOSYS)
    }

    fn setxattr(&self, _path: &Path, _name: &[u8], _value: &[u8], _flags: u32) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn getxattr(&self, _path: &Path, _name: &[u8], _size: u32) -> ProviderResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn listxattr(&self, _path: &Path, _size: u32) -> ProviderResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn removexattr(&self, _path: &Path, _name: &[u8]) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn access(&self, _path: &Path, _mask: u32) -> ProviderResult<()> {
        Err(ENOSYS)
    }

    fn create(&self, _path: &Path, _mode: u32, _flags: u32) -> ProviderResult<(FileAttr, OpenReply)> {
        Err(ENOSYS)
    }

    fn getlk(&self, _path: &Path, _fh: u64, _owner: u64, _lock: crate::lock::Lock) -> ProviderResult<crate::lock::Lock> {
        Err(ENOSYS)
    }

    fn setlk(&self, _path: &Path, _fh: u64, _owner: u64, _lock: crate::lock::Lock, _sleep: bool) -> ProviderResult<()> {
        Err(ENOSYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl LowLevelFilesystem for Noop {}
    impl PathFilesystem for Noop {}

    #[test]
    fn unimplemented_callbacks_return_enosys() {
        let fs = Noop;
        assert_eq!(fs.getattr(1), Err(ENOSYS));
        assert_eq!(PathFilesystem::getattr(&fs, Path::new("/x")), Err(ENOSYS));
    }

    #[test]
    fn default_open_succeeds_with_empty_reply() {
        let fs = Noop;
        let reply = fs.open(1, 0).unwrap();
        assert_eq!(reply.fh, 0);
        assert!(!reply.direct_io);
    }

    #[test]
    fn default_release_and_flush_succeed() {
        let fs = Noop;
        assert!(fs.release(1, 0, 0).is_ok());
        assert!(fs.flush(1, 0, 0).is_ok());
    }
}
