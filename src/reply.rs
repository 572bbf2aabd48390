//! Reply codec (spec.md §4.4). Each variant knows how to serialize
//! itself into the `out_header` + payload bytes the channel writes
//! back to the kernel. Errors always encode as a bare `out_header`
//! with `error` set and zero-length payload.

use crate::abi::{
    fuse_attr, fuse_attr_out, fuse_bmap_out, fuse_entry_out, fuse_ioctl_out, fuse_lk_out,
    fuse_open_out, fuse_out_header, fuse_poll_out, fuse_statfs_out, fuse_write_out,
    struct_bytes, FUSE_OUT_HEADER_SIZE,
};
use crate::error::clamp_errno;
use crate::provider::{EntryReply, FileAttr, OpenReply, StatFs};

fn to_fuse_attr(a: &FileAttr) -> fuse_attr {
    fuse_attr {
        ino: a.ino,
        size: a.size,
        blocks: a.blocks,
        atime: a.atime.as_secs(),
        mtime: a.mtime.as_secs(),
        ctime: a.ctime.as_secs(),
        atimensec: a.atime.subsec_nanos(),
        mtimensec: a.mtime.subsec_nanos(),
        ctimensec: a.ctime.subsec_nanos(),
        mode: a.mode,
        nlink: a.nlink,
        uid: a.uid,
        gid: a.gid,
        rdev: a.rdev,
        blksize: 4096,
        flags: 0,
    }
}

fn frame(unique: u64, error: i32, payload: &[u8]) -> Vec<u8> {
    let header = fuse_out_header {
        len: (FUSE_OUT_HEADER_SIZE + payload.len()) as u32,
        error,
        unique,
    };
    let mut buf = Vec::with_capacity(header.len as usize);
    buf.extend_from_slice(struct_bytes(&header));
    buf.extend_from_slice(payload);
    buf
}

/// A fully-encoded reply body, ready for the channel to write.
pub enum Reply {
    Err(i32),
    Ok,
    Entry(EntryReply),
    Attr { attr: FileAttr, ttl: std::time::Duration },
    Open(OpenReply),
    Write(u32),
    Data(Vec<u8>),
    Statfs(StatFs),
    Xattr(Vec<u8>),
    XattrSize(u32),
    Lock(crate::lock::Lock),
    Bmap(u64),
    Ioctl { result: i32, data: Vec<u8> },
    Poll(u32),
}

impl Reply {
    /// Encode into the bytes the channel writes back, given the
    /// request's `unique`. Errors are clamped into the kernel's
    /// accepted errno range (spec.md §3 `MAX_ERRNO`).
    pub fn encode(self, unique: u64) -> Vec<u8> {
        match self {
            Reply::Err(errno) => frame(unique, clamp_errno(errno), &[]),
            Reply::Ok => frame(unique, 0, &[]),
            Reply::Entry(e) => {
                let out = fuse_entry_out {
                    nodeid: e.attr.ino,
                    generation: e.generation,
                    entry_valid: e.entry_ttl.as_secs(),
                    attr_valid: e.attr_ttl.as_secs(),
                    entry_valid_nsec: e.entry_ttl.subsec_nanos(),
                    attr_valid_nsec: e.attr_ttl.subsec_nanos(),
                    attr: to_fuse_attr(&e.attr),
                };
                frame(unique, 0, struct_bytes(&out))
            }
            Reply::Attr { attr, ttl } => {
                let out = fuse_attr_out {
                    attr_valid: ttl.as_secs(),
                    attr_valid_nsec: ttl.subsec_nanos(),
                    dummy: 0,
                    attr: to_fuse_attr(&attr),
                };
                frame(unique, 0, struct_bytes(&out))
            }
            Reply::Open(o) => {
                let out = fuse_open_out {
                    fh: o.fh,
                    open_flags: (o.direct_io as u32) | ((o.keep_cache as u32) << 1),
                    padding: 0,
                };
                frame(unique, 0, struct_bytes(&out))
            }
            Reply::Write(size) => {
                let out = fuse_write_out { size, padding: 0 };
                frame(unique, 0, struct_bytes(&out))
            }
            Reply::Data(bytes) => frame(unique, 0, &bytes),
            Reply::Statfs(s) => {
                let out = fuse_statfs_out {
                    st: crate::abi::fuse_kstatfs {
                        blocks: s.blocks,
                        bfree: s.bfree,
                        bavail: s.bavail,
                        files: s.files,
                        ffree: s.ffree,
                        bsize: s.bsize,
                        namelen: s.namelen,
                        frsize: s.frsize,
                        padding: 0,
                        spare: [0; 6],
                    },
                };
                frame(unique, 0, struct_bytes(&out))
            }
            Reply::Xattr(bytes) => frame(unique, 0, &bytes),
            Reply::XattrSize(size) => {
                let out = crate::abi::fuse_getxattr_out { size, padding: 0 };
                frame(unique, 0, struct_bytes(&out))
            }
            Reply::Lock(l) => {
                let out = fuse_lk_out {
                    lk: crate::abi::fuse_file_lock {
                        start: l.start,
                        end: l.end,
                        lock_type: l.lock_type,
                        pid: l.pid,
                    },
                };
                frame(unique, 0, struct_bytes(&out))
            }
            Reply::Bmap(block) => {
                let out = fuse_bmap_out { block };
                frame(unique, 0, struct_bytes(&out))
            }
            Reply::Ioctl { result, data } => {
                let out = fuse_ioctl_out {
                    result,
                    flags: 0,
                    io_iovs: 0,
                    out_iovs: 0,
                };
                let mut payload = struct_bytes(&out).to_vec();
                payload.extend_from_slice(&data);
                frame(unique, 0, &payload)
            }
            Reply::Poll(revents) => {
                let out = fuse_poll_out {
                    revents,
                    padding: 0,
                };
                frame(unique, 0, struct_bytes(&out))
            }
        }
    }
}
