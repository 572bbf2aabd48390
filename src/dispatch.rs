//! Opcode dispatch (spec.md §4.4). Translates a parsed [`Request`]
//! into an adaptor call and a [`Reply`], handling the opcodes that
//! never reach a provider (FORGET/BATCH_FORGET/INTERRUPT) internally.

use crate::abi::{
    self, fuse_access_in, fuse_batch_forget_in, fuse_create_in, fuse_flush_in, fuse_forget_in,
    fuse_forget_one, fuse_getattr_in, fuse_getxattr_in, fuse_link_in, fuse_lk_in, fuse_mkdir_in,
    fuse_mknod_in, fuse_read_in, fuse_release_in, fuse_rename2_in, fuse_rename_in,
    fuse_setattr_in, fuse_setxattr_in, fuse_write_in, Opcode,
};
use crate::adaptor::Adaptor;
use crate::error::{CoreError, CoreResult};
use crate::lock::Lock;
use crate::provider::FileAttr;
use crate::reply::Reply;
use crate::request::Request;
use crate::session::Session;

fn split_name(body: &[u8], prefix: usize) -> &[u8] {
    let rest = &body[prefix.min(body.len())..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    &rest[..end]
}

/// Dispatch one request against `session`, returning the bytes to
/// write back (or `None` if the opcode never replies, e.g. FORGET).
pub fn dispatch(session: &Session, req: &Request) -> Option<Vec<u8>> {
    let unique = req.unique();

    let Some(opcode) = req.opcode else {
        if !session.is_initialized() {
            return Some(Reply::Err(-(libc::EIO)).encode(unique));
        }
        return Some(Reply::Err(-(libc::ENOSYS)).encode(unique));
    };

    if opcode == Opcode::Init {
        return Some(match session.negotiate_init(req.body, session.config.max_pages) {
            Ok(payload) => {
                let mut bytes = abi::struct_bytes(&abi::fuse_out_header {
                    len: (abi::FUSE_OUT_HEADER_SIZE + payload.len()) as u32,
                    error: 0,
                    unique,
                })
                .to_vec();
                bytes.extend_from_slice(&payload);
                bytes
            }
            Err(e) => Reply::Err(e.as_errno()).encode(unique),
        });
    }

    if !session.is_initialized() {
        return Some(Reply::Err(-(libc::EIO)).encode(unique));
    }

    if opcode.replies_never() {
        handle_no_reply(session, opcode, req);
        return None;
    }

    let adaptor = Adaptor::new(session);
    let result = handle(&adaptor, opcode, req);
    Some(match result {
        Ok(reply) => reply.encode(unique),
        Err(e) => Reply::Err(e.as_errno()).encode(unique),
    })
}

fn handle_no_reply(session: &Session, opcode: Opcode, req: &Request) {
    match opcode {
        Opcode::Forget => {
            if let Some(body) = abi::read_struct::<fuse_forget_in>(req.body) {
                session.cache.forget(req.nodeid(), body.nlookup);
            }
        }
        Opcode::BatchForget => {
            if let Some(header) = abi::read_struct::<fuse_batch_forget_in>(req.body) {
                let entry_size = std::mem::size_of::<fuse_forget_one>();
                let entries = &req.body[std::mem::size_of::<fuse_batch_forget_in>()..];
                for i in 0..header.count as usize {
                    let start = i * entry_size;
                    if let Some(entry) = entries
                        .get(start..start + entry_size)
                        .and_then(abi::read_struct::<fuse_forget_one>)
                    {
                        session.cache.forget(entry.nodeid, entry.nlookup);
                    }
                }
            }
        }
        Opcode::Interrupt => {
            // This dispatcher has no cross-request handle table of its
            // own (that's a channel/worker-pool concern); marking the
            // interrupt is the workers' job once a request lookup
            // table exists. Nothing to do at this layer besides accept
            // the opcode without error.
        }
        Opcode::NotifyReply => {}
        _ => unreachable!("replies_never() opcode not handled"),
    }
}

fn handle(adaptor: &Adaptor, opcode: Opcode, req: &Request) -> CoreResult<Reply> {
    let nodeid = req.nodeid();
    match opcode {
        Opcode::Lookup => {
            let name = split_name(req.body, 0);
            adaptor.lookup(nodeid, name).map(Reply::Entry)
        }
        Opcode::Getattr => {
            let _ = abi::read_struct::<fuse_getattr_in>(req.body);
            let (attr, ttl) = adaptor.getattr(nodeid)?;
            Ok(Reply::Attr { attr, ttl })
        }
        Opcode::Setattr => {
            let body = abi::read_struct::<fuse_setattr_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_setattr_in>(), got: req.body.len() })?;
            let attr = FileAttr {
                ino: nodeid,
                size: body.size,
                mode: body.mode,
                uid: body.uid,
                gid: body.gid,
                atime: std::time::Duration::new(body.atime, body.atimensec),
                mtime: std::time::Duration::new(body.mtime, body.mtimensec),
                ctime: std::time::Duration::new(body.ctime, body.ctimensec),
                ..Default::default()
            };
            let (out, ttl) = adaptor.setattr(nodeid, attr, body.valid)?;
            Ok(Reply::Attr { attr: out, ttl })
        }
        Opcode::Readlink => adaptor.readlink(nodeid).map(Reply::Data),
        Opcode::Mknod => {
            let body = abi::read_struct::<fuse_mknod_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_mknod_in>(), got: req.body.len() })?;
            let name = split_name(req.body, std::mem::size_of::<fuse_mknod_in>());
            adaptor.mknod(nodeid, name, body.mode, body.rdev).map(Reply::Entry)
        }
        Opcode::Mkdir => {
            let body = abi::read_struct::<fuse_mkdir_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_mkdir_in>(), got: req.body.len() })?;
            let name = split_name(req.body, std::mem::size_of::<fuse_mkdir_in>());
            adaptor.mkdir(nodeid, name, body.mode).map(Reply::Entry)
        }
        Opcode::Unlink => {
            let name = split_name(req.body, 0);
            adaptor.unlink(nodeid, name).map(|_| Reply::Ok)
        }
        Opcode::Rmdir => {
            let name = split_name(req.body, 0);
            adaptor.rmdir(nodeid, name).map(|_| Reply::Ok)
        }
        Opcode::Symlink => {
            let end_name = req.body.iter().position(|&b| b == 0).unwrap_or(req.body.len());
            let name = &req.body[..end_name];
            let target = split_name(req.body, end_name + 1);
            adaptor.symlink(nodeid, name, target).map(Reply::Entry)
        }
        Opcode::Rename => {
            let body = abi::read_struct::<fuse_rename_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_rename_in>(), got: req.body.len() })?;
            let rest = &req.body[std::mem::size_of::<fuse_rename_in>()..];
            let end_old = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            let old_name = &rest[..end_old];
            let new_name = split_name(rest, end_old + 1);
            adaptor.rename(nodeid, old_name, body.newdir, new_name, 0).map(|_| Reply::Ok)
        }
        Opcode::Rename2 => {
            let body = abi::read_struct::<fuse_rename2_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_rename2_in>(), got: req.body.len() })?;
            let rest = &req.body[std::mem::size_of::<fuse_rename2_in>()..];
            let end_old = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            let old_name = &rest[..end_old];
            let new_name = split_name(rest, end_old + 1);
            adaptor.rename(nodeid, old_name, body.newdir, new_name, body.flags).map(|_| Reply::Ok)
        }
        Opcode::Link => {
            let body = abi::read_struct::<fuse_link_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_link_in>(), got: req.body.len() })?;
            let name = split_name(req.body, std::mem::size_of::<fuse_link_in>());
            adaptor.link(body.oldnodeid, nodeid, name).map(Reply::Entry)
        }
        Opcode::Open | Opcode::Opendir => adaptor.open(nodeid, 0).map(Reply::Open),
        Opcode::Read => {
            let body = abi::read_struct::<fuse_read_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_read_in>(), got: req.body.len() })?;
            adaptor.read(nodeid, body.fh, body.offset, body.size).map(Reply::Data)
        }
        Opcode::Write => {
            let body = abi::read_struct::<fuse_write_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_write_in>(), got: req.body.len() })?;
            let data = &req.body[std::mem::size_of::<fuse_write_in>()..];
            adaptor.write(nodeid, body.fh, body.offset, data).map(Reply::Write)
        }
        Opcode::Flush => {
            let body = abi::read_struct::<fuse_flush_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_flush_in>(), got: req.body.len() })?;
            adaptor.flush(nodeid, body.fh, body.lock_owner).map(|_| Reply::Ok)
        }
        Opcode::Release | Opcode::Releasedir => {
            let body = abi::read_struct::<fuse_release_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_release_in>(), got: req.body.len() })?;
            adaptor.release(nodeid, body.fh, body.flags).map(|_| Reply::Ok)
        }
        Opcode::Fsync | Opcode::Fsyncdir => adaptor.fsync(nodeid, 0, false).map(|_| Reply::Ok),
        Opcode::Readdir | Opcode::Readdirplus => {
            adaptor.readdir(nodeid, 0, 0).map(|entries| {
                let mut buf = Vec::new();
                for e in entries {
                    buf.extend_from_slice(&e.ino.to_le_bytes());
                    buf.extend_from_slice(&(e.name.len() as u32).to_le_bytes());
                    buf.extend_from_slice(&e.name);
                }
                Reply::Data(buf)
            })
        }
        Opcode::Statfs => adaptor.statfs(nodeid).map(Reply::Statfs),
        Opcode::Setxattr => {
            let body = abi::read_struct::<fuse_setxattr_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_setxattr_in>(), got: req.body.len() })?;
            let rest = &req.body[std::mem::size_of::<fuse_setxattr_in>()..];
            let end_name = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            let name = &rest[..end_name];
            let value_start = (end_name + 1).min(rest.len());
            let value = &rest[value_start..value_start + (body.size as usize).min(rest.len() - value_start)];
            adaptor.setxattr(nodeid, name, value, body.flags).map(|_| Reply::Ok)
        }
        Opcode::Getxattr => {
            let body = abi::read_struct::<fuse_getxattr_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_getxattr_in>(), got: req.body.len() })?;
            let name = split_name(req.body, std::mem::size_of::<fuse_getxattr_in>());
            adaptor.getxattr(nodeid, name, body.size).map(Reply::Xattr)
        }
        Opcode::Listxattr => adaptor.listxattr(nodeid, 0).map(Reply::Xattr),
        Opcode::Removexattr => adaptor.removexattr(nodeid, req.body).map(|_| Reply::Ok),
        Opcode::Access => {
            let body = abi::read_struct::<fuse_access_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_access_in>(), got: req.body.len() })?;
            adaptor.access(nodeid, body.mask).map(|_| Reply::Ok)
        }
        Opcode::Create => {
            let body = abi::read_struct::<fuse_create_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_create_in>(), got: req.body.len() })?;
            let name = split_name(req.body, std::mem::size_of::<fuse_create_in>());
            adaptor.create(nodeid, name, body.mode, body.flags).map(|(entry, _open)| Reply::Entry(entry))
        }
        Opcode::Getlk | Opcode::Setlk | Opcode::Setlkw => {
            let body = abi::read_struct::<fuse_lk_in>(req.body)
                .ok_or(CoreError::ShortRead { expected: std::mem::size_of::<fuse_lk_in>(), got: req.body.len() })?;
            let lock = Lock {
                lock_type: body.lk.lock_type,
                start: body.lk.start,
                end: body.lk.end,
                pid: body.lk.pid,
                owner: body.owner,
            };
            if opcode == Opcode::Getlk {
                adaptor.getlk(nodeid, body.fh, body.owner, lock).map(Reply::Lock)
            } else {
                adaptor
                    .setlk(nodeid, body.fh, body.owner, lock, opcode == Opcode::Setlkw)
                    .map(|_| Reply::Ok)
            }
        }
        Opcode::Destroy => {
            adaptor.session.mark_destroyed();
            adaptor.session.provider.destroy();
            Ok(Reply::Ok)
        }
        Opcode::Bmap | Opcode::Ioctl | Opcode::Poll => Err(CoreError::Provider(-(libc::ENOSYS))),
        Opcode::Forget | Opcode::BatchForget | Opcode::Interrupt | Opcode::NotifyReply | Opcode::Init => {
            unreachable!("handled before reaching handle()")
        }
        Opcode::Fallocate | Opcode::Lseek | Opcode::CopyFileRange => {
            Err(CoreError::Provider(-(libc::ENOSYS)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::provider::PathFilesystem;
    use std::sync::Arc;

    struct Noop;
    impl PathFilesystem for Noop {}

    fn encode_header(opcode: u32, nodeid: u64, body: &[u8]) -> Vec<u8> {
        let header = abi::fuse_in_header {
            len: (abi::FUSE_IN_HEADER_SIZE + body.len()) as u32,
            opcode,
            unique: 1,
            nodeid,
            uid: 0,
            gid: 0,
            pid: 0,
            padding: 0,
        };
        let mut buf = abi::struct_bytes(&header).to_vec();
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn pre_init_non_init_opcode_is_eio() {
        let session = Session::new(SessionConfig::default(), Arc::new(Noop));
        let raw = encode_header(Opcode::Getattr as u32, 1, &[]);
        let req = Request::parse(&raw).unwrap();
        let reply = dispatch(&session, &req).unwrap();
        let header: abi::fuse_out_header = abi::read_struct(&reply).unwrap();
        assert_eq!(header.error, -(libc::EIO));
    }

    #[test]
    fn init_opcode_dispatches_before_init_completes() {
        let session = Session::new(SessionConfig::default(), Arc::new(Noop));
        let init_in = abi::fuse_init_in {
            major: 7,
            minor: 31,
            max_readahead: 0,
            flags: 0,
            flags2: 0,
            unused: [0; 11],
        };
        let raw = encode_header(Opcode::Init as u32, 0, abi::struct_bytes(&init_in));
        let req = Request::parse(&raw).unwrap();
        let reply = dispatch(&session, &req).unwrap();
        let header: abi::fuse_out_header = abi::read_struct(&reply).unwrap();
        assert_eq!(header.error, 0);
        assert!(session.is_initialized());
    }

    #[test]
    fn forget_never_replies() {
        let session = Session::new(SessionConfig::default(), Arc::new(Noop));
        let init_in = abi::fuse_init_in { major: 7, minor: 31, max_readahead: 0, flags: 0, flags2: 0, unused: [0; 11] };
        let raw = encode_header(Opcode::Init as u32, 0, abi::struct_bytes(&init_in));
        dispatch(&session, &Request::parse(&raw).unwrap());

        let forget_in = fuse_forget_in { nlookup: 1 };
        let raw = encode_header(Opcode::Forget as u32, crate::node::ROOT_NODE_ID, abi::struct_bytes(&forget_in));
        let req = Request::parse(&raw).unwrap();
        assert!(dispatch(&session, &req).is_none());
    }

    #[test]
    fn unknown_opcode_after_init_is_enosys() {
        let session = Session::new(SessionConfig::default(), Arc::new(Noop));
        let init_in = abi::fuse_init_in { major: 7, minor: 31, max_readahead: 0, flags: 0, flags2: 0, unused: [0; 11] };
        let raw = encode_header(Opcode::Init as u32, 0, abi::struct_bytes(&init_in));
        dispatch(&session, &Request::parse(&raw).unwrap());

        let raw = encode_header(999, 1, &[]);
        let req = Request::parse(&raw).unwrap();
        let reply = dispatch(&session, &req).unwrap();
        let header: abi::fuse_out_header = abi::read_struct(&reply).unwrap();
        assert_eq!(header.error, -(libc::ENOSYS));
    }

    #[derive(Default)]
    struct Recording {
        access_mask: std::sync::Mutex<Option<u32>>,
        setxattr_call: std::sync::Mutex<Option<(Vec<u8>, Vec<u8>, u32)>>,
        getxattr_call: std::sync::Mutex<Option<(Vec<u8>, u32)>>,
        flush_call: std::sync::Mutex<Option<(u64, u64)>>,
        read_call: std::sync::Mutex<Option<(u64, u64, u32)>>,
    }

    impl PathFilesystem for Recording {
        fn access(&self, _path: &std::path::Path, mask: u32) -> crate::provider::ProviderResult<()> {
            *self.access_mask.lock().unwrap() = Some(mask);
            Ok(())
        }

        fn setxattr(
            &self,
            _path: &std::path::Path,
            name: &[u8],
            value: &[u8],
            flags: u32,
        ) -> crate::provider::ProviderResult<()> {
            *self.setxattr_call.lock().unwrap() = Some((name.to_vec(), value.to_vec(), flags));
            Ok(())
        }

        fn getxattr(
            &self,
            _path: &std::path::Path,
            name: &[u8],
            size: u32,
        ) -> crate::provider::ProviderResult<Vec<u8>> {
            *self.getxattr_call.lock().unwrap() = Some((name.to_vec(), size));
            Ok(b"value".to_vec())
        }

        fn flush(&self, _path: &std::path::Path, fh: u64, lock_owner: u64) -> crate::provider::ProviderResult<()> {
            *self.flush_call.lock().unwrap() = Some((fh, lock_owner));
            Ok(())
        }

        fn read(
            &self,
            _path: &std::path::Path,
            fh: u64,
            offset: u64,
            size: u32,
        ) -> crate::provider::ProviderResult<Vec<u8>> {
            *self.read_call.lock().unwrap() = Some((fh, offset, size));
            Ok(vec![0u8; size as usize])
        }
    }

    fn init_session(provider: Arc<Recording>) -> Session {
        let session = Session::new(SessionConfig::default(), provider);
        let init_in = abi::fuse_init_in { major: 7, minor: 31, max_readahead: 0, flags: 0, flags2: 0, unused: [0; 11] };
        let raw = encode_header(Opcode::Init as u32, 0, abi::struct_bytes(&init_in));
        dispatch(&session, &Request::parse(&raw).unwrap());
        session
    }

    #[test]
    fn access_decodes_mask_and_calls_provider() {
        let provider = Arc::new(Recording::default());
        let session = init_session(provider.clone());
        let access_in = abi::fuse_access_in { mask: libc::R_OK as u32, padding: 0 };
        let raw = encode_header(Opcode::Access as u32, crate::node::ROOT_NODE_ID, abi::struct_bytes(&access_in));
        let reply = dispatch(&session, &Request::parse(&raw).unwrap()).unwrap();
        let header: abi::fuse_out_header = abi::read_struct(&reply).unwrap();
        assert_eq!(header.error, 0);
        assert_eq!(*provider.access_mask.lock().unwrap(), Some(libc::R_OK as u32));
    }

    #[test]
    fn setxattr_decodes_name_and_value() {
        let provider = Arc::new(Recording::default());
        let session = init_session(provider.clone());
        let mut body = abi::struct_bytes(&abi::fuse_setxattr_in { size: 5, flags: 7 }).to_vec();
        body.extend_from_slice(b"user.x\0hello");
        let raw = encode_header(Opcode::Setxattr as u32, crate::node::ROOT_NODE_ID, &body);
        let reply = dispatch(&session, &Request::parse(&raw).unwrap()).unwrap();
        let header: abi::fuse_out_header = abi::read_struct(&reply).unwrap();
        assert_eq!(header.error, 0);
        let call = provider.setxattr_call.lock().unwrap().take().unwrap();
        assert_eq!(call.0, b"user.x");
        assert_eq!(call.1, b"hello");
        assert_eq!(call.2, 7);
    }

    #[test]
    fn getxattr_decodes_name_not_the_header() {
        let provider = Arc::new(Recording::default());
        let session = init_session(provider.clone());
        let mut body = abi::struct_bytes(&abi::fuse_getxattr_in { size: 64, padding: 0 }).to_vec();
        body.extend_from_slice(b"user.x\0");
        let raw = encode_header(Opcode::Getxattr as u32, crate::node::ROOT_NODE_ID, &body);
        dispatch(&session, &Request::parse(&raw).unwrap()).unwrap();
        let call = provider.getxattr_call.lock().unwrap().take().unwrap();
        assert_eq!(call.0, b"user.x");
        assert_eq!(call.1, 64);
    }

    #[test]
    fn flush_decodes_fh_and_lock_owner() {
        let provider = Arc::new(Recording::default());
        let session = init_session(provider.clone());
        let flush_in = abi::fuse_flush_in { fh: 42, unused: 0, padding: 0, lock_owner: 99 };
        let raw = encode_header(Opcode::Flush as u32, crate::node::ROOT_NODE_ID, abi::struct_bytes(&flush_in));
        let reply = dispatch(&session, &Request::parse(&raw).unwrap()).unwrap();
        let header: abi::fuse_out_header = abi::read_struct(&reply).unwrap();
        assert_eq!(header.error, 0);
        assert_eq!(*provider.flush_call.lock().unwrap(), Some((42, 99)));
    }

    #[test]
    fn read_decodes_fh_offset_and_size() {
        let provider = Arc::new(Recording::default());
        let session = init_session(provider.clone());
        let read_in = abi::fuse_read_in { fh: 7, offset: 4096, size: 128, read_flags: 0, lock_owner: 0, flags: 0, padding: 0 };
        let raw = encode_header(Opcode::Read as u32, crate::node::ROOT_NODE_ID, abi::struct_bytes(&read_in));
        let reply = dispatch(&session, &Request::parse(&raw).unwrap()).unwrap();
        let header: abi::fuse_out_header = abi::read_struct(&reply).unwrap();
        assert_eq!(header.error, 0);
        assert_eq!(*provider.read_call.lock().unwrap(), Some((7, 4096, 128)));
    }
}
