//! Session state and INIT negotiation (spec.md §4.5).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::abi::{self, fuse_init_in, fuse_init_out, Opcode};
use crate::buffer::MessageBufferPool;
use crate::cache::InodeCache;
use crate::config::SessionConfig;
use crate::error::{CoreError, CoreResult};
use crate::provider::PathFilesystem;

/// Negotiated protocol/session state, shared across all worker
/// threads. Mutated only during INIT (single-threaded at that point
/// by construction: the kernel sends INIT first and blocks until it
/// gets a reply before sending anything else).
pub struct Session {
    pub config: SessionConfig,
    pub cache: InodeCache,
    pub buffers: MessageBufferPool,
    pub provider: Arc<dyn PathFilesystem>,

    proto_major: AtomicU32,
    proto_minor: AtomicU32,
    capable: AtomicU64,
    want: AtomicU64,
    max_write: AtomicU32,
    max_readahead: AtomicU32,
    max_background: AtomicU32,
    congestion_threshold: AtomicU32,

    got_init: AtomicBool,
    got_destroy: AtomicBool,
    pub exited: AtomicBool,
}

impl Session {
    pub fn new(config: SessionConfig, provider: Arc<dyn PathFilesystem>) -> Self {
        let remember = config.remember_ttl.is_some();
        let buffers = MessageBufferPool::new(config.max_pages);
        Self {
            config,
            cache: InodeCache::new(remember),
            buffers,
            provider,
            proto_major: AtomicU32::new(0),
            proto_minor: AtomicU32::new(0),
            capable: AtomicU64::new(0),
            want: AtomicU64::new(0),
            max_write: AtomicU32::new(0),
            max_readahead: AtomicU32::new(0),
            max_background: AtomicU32::new(0),
            congestion_threshold: AtomicU32::new(0),
            got_init: AtomicBool::new(false),
            got_destroy: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.got_init.load(Ordering::Acquire)
    }

    pub fn capabilities(&self) -> u64 {
        self.capable.load(Ordering::Acquire)
    }

    /// Handle an inbound `FUSE_INIT` request body, returning the
    /// encoded `fuse_init_out` payload (spec.md §4.5 steps 1-8).
    /// `bufsize_pages` is this channel's configured buffer size, used
    /// to bound `max_write`.
    pub fn negotiate_init(&self, body: &[u8], bufsize_pages: u32) -> CoreResult<Vec<u8>> {
        let init_in = abi::read_struct::<fuse_init_in>(body).ok_or(CoreError::ShortRead {
            expected: std::mem::size_of::<fuse_init_in>(),
            got: body.len(),
        })?;

        if init_in.major < 7 {
            return Err(CoreError::UnsupportedMajor(init_in.major));
        }
        if init_in.major > abi::FUSE_KERNEL_VERSION {
            // Reply with our own version; kernel will re-INIT at 7.x.
            let out = fuse_init_out {
                major: abi::FUSE_KERNEL_VERSION,
                minor: abi::FUSE_KERNEL_MINOR_VERSION,
                ..Default::default()
            };
            return Ok(abi::struct_bytes(&out).to_vec());
        }

        self.proto_major.store(abi::FUSE_KERNEL_VERSION, Ordering::Release);
        self.proto_minor.store(init_in.minor.min(abi::FUSE_KERNEL_MINOR_VERSION), Ordering::Release);

        let inbound_caps = init_in.flags as u64 | ((init_in.flags2 as u64) << 32);
        let mut capable = inbound_caps & abi::SERVER_DEFAULT_CAPABILITIES;
        capable |= self.config.want_capability_overrides & inbound_caps;
        if !(self.config.splice_read || self.config.splice_write) {
            capable &= !(abi::FUSE_SPLICE_READ | abi::FUSE_SPLICE_WRITE | abi::FUSE_SPLICE_MOVE);
        }
        self.capable.store(capable, Ordering::Release);
        self.want.store(capable, Ordering::Release);

        self.provider
            .init(capable)
            .map_err(CoreError::Provider)?;

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE).max(4096) as u32 };
        let bufsize = bufsize_pages.saturating_mul(page_size);
        let max_write = bufsize.saturating_sub(page_size).max(page_size);
        self.max_write.store(max_write, Ordering::Release);
        self.max_readahead.store(init_in.max_readahead, Ordering::Release);

        let max_background = 64u32.min(65_535);
        self.max_background.store(max_background, Ordering::Release);
        let congestion = max_background.saturating_mul(3) / 4;
        self.congestion_threshold.store(congestion, Ordering::Release);

        if capable & abi::FUSE_MAX_PAGES != 0 {
            self.buffers.set_bufsize(self.config.max_pages);
        }

        let out = fuse_init_out {
            major: abi::FUSE_KERNEL_VERSION,
            minor: abi::FUSE_KERNEL_MINOR_VERSION,
            max_readahead: init_in.max_readahead,
            flags: capable as u32,
            max_background: max_background.min(u16::MAX as u32) as u16,
            congestion_threshold: congestion.min(u16::MAX as u32) as u16,
            max_write,
            time_gran: 1,
            max_pages: self.config.max_pages.min(u16::MAX as u32) as u16,
            map_alignment: 0,
            flags2: (capable >> 32) as u32,
            unused: [0; 7],
        };

        self.got_init.store(true, Ordering::Release);
        Ok(abi::struct_bytes(&out).to_vec())
    }

    /// Whether `opcode` may be dispatched yet (spec.md §4.4 step 3).
    pub fn may_dispatch(&self, opcode: Opcode) -> bool {
        self.is_initialized() || opcode == Opcode::Init
    }

    pub fn mark_destroyed(&self) {
        self.got_destroy.store(true, Ordering::Release);
    }

    /// Safeguard: if INIT succeeded but DESTROY was never seen (abrupt
    /// exit), call the provider destructor now.
    pub fn destroy_if_needed(&self) {
        if self.got_init.load(Ordering::Acquire) && !self.got_destroy.load(Ordering::Acquire) {
            self.provider.destroy();
            self.got_destroy.store(true, Ordering::Release);
        }
    }

    pub fn max_write(&self) -> u32 {
        self.max_write.load(Ordering::Acquire)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy_if_needed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::struct_bytes;

    struct Noop;
    impl PathFilesystem for Noop {}

    fn init_body(major: u32, minor: u32) -> Vec<u8> {
        let init_in = fuse_init_in {
            major,
            minor,
            max_readahead: 131072,
            flags: abi::FUSE_ASYNC_READ as u32,
            flags2: 0,
            unused: [0; 11],
        };
        struct_bytes(&init_in).to_vec()
    }

    #[test]
    fn pre_init_only_init_opcode_dispatches() {
        let session = Session::new(SessionConfig::default(), Arc::new(Noop));
        assert!(session.may_dispatch(Opcode::Init));
        assert!(!session.may_dispatch(Opcode::Getattr));
    }

    #[test]
    fn old_major_is_rejected() {
        let session = Session::new(SessionConfig::default(), Arc::new(Noop));
        let body = init_body(6, 0);
        assert!(matches!(
            session.negotiate_init(&body, 256),
            Err(CoreError::UnsupportedMajor(6))
        ));
    }

    #[test]
    fn matching_major_completes_init() {
        let session = Session::new(SessionConfig::default(), Arc::new(Noop));
        let body = init_body(7, 31);
        let out_bytes = session.negotiate_init(&body, 256).unwrap();
        assert!(session.is_initialized());
        assert!(session.may_dispatch(Opcode::Getattr));
        let out: fuse_init_out = abi::read_struct(&out_bytes).unwrap();
        assert_eq!(out.major, abi::FUSE_KERNEL_VERSION);
        assert!(out.max_write > 0);
    }

    #[test]
    fn future_major_replies_without_completing_init() {
        let session = Session::new(SessionConfig::default(), Arc::new(Noop));
        let body = init_body(8, 0);
        let out_bytes = session.negotiate_init(&body, 256).unwrap();
        assert!(!session.is_initialized());
        let out: fuse_init_out = abi::read_struct(&out_bytes).unwrap();
        assert_eq!(out.major, abi::FUSE_KERNEL_VERSION);
    }

    #[test]
    fn destroy_safeguard_fires_once_on_drop() {
        struct Counting(std::sync::atomic::AtomicU32);
        impl PathFilesystem for Counting {
            fn destroy(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let provider = Arc::new(Counting(std::sync::atomic::AtomicU32::new(0)));
        let session = Session::new(SessionConfig::default(), provider.clone());
        let body = init_body(7, 31);
        session.negotiate_init(&body, 256).unwrap();
        session.destroy_if_needed();
        session.destroy_if_needed();
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
    }
}
