//! Error taxonomy for the core runtime.
//!
//! Provider callbacks speak raw negative `errno` directly (matching the
//! wire protocol convention); this type is for the library's own
//! internal failures (wire/IO, allocation, cache, locking) as laid out
//! in spec.md §7. [`CoreError::as_errno`] is the single place a
//! `CoreError` is turned into the errno that goes on the wire.

use std::io;

/// The largest magnitude errno the kernel will accept in `out_header.error`.
/// Values outside `(-MAX_ERRNO, 0]` are coerced to `-ERANGE`.
pub const MAX_ERRNO: i32 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("short read: expected at least {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("device closed")]
    DeviceClosed,

    #[error("wire I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported protocol major version {0}")]
    UnsupportedMajor(u32),

    #[error("request received before INIT completed")]
    NotInitialized,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("allocation failed")]
    OutOfMemory,

    #[error("stale path: ancestor has no name")]
    Stale,

    #[error("lock table allocation failed")]
    NoLock,

    #[error("provider returned errno {0}")]
    Provider(i32),
}

impl CoreError {
    /// Convert to the negative-errno convention used on the wire,
    /// clamping out-of-range magnitudes to `-ERANGE` per spec.md §4.4.
    pub fn as_errno(&self) -> i32 {
        let raw = match self {
            CoreError::ShortRead { .. } => libc::EIO,
            CoreError::DeviceClosed => libc::ENODEV,
            CoreError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            CoreError::UnsupportedMajor(_) => libc::EPROTO,
            CoreError::NotInitialized => libc::EIO,
            CoreError::UnknownOpcode(_) => libc::ENOSYS,
            CoreError::OutOfMemory => libc::ENOMEM,
            CoreError::Stale => libc::ESTALE,
            CoreError::NoLock => libc::ENOLCK,
            CoreError::Provider(errno) => *errno,
        };
        clamp_errno(raw)
    }

    /// Is this one of the retry-signal errors `recv` should loop on?
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Io(e) if matches!(
            e.raw_os_error(),
            Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::ENOENT)
        ))
    }

    /// Is this a clean session exit (not an error to report)?
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, CoreError::DeviceClosed)
            || matches!(self, CoreError::Io(e) if e.raw_os_error() == Some(libc::ENODEV))
    }
}

/// Clamp a positive errno magnitude into the wire-acceptable range.
pub fn clamp_errno(errno: i32) -> i32 {
    let magnitude = errno.unsigned_abs() as i32;
    if magnitude == 0 || magnitude > MAX_ERRNO {
        -libc::ERANGE
    } else {
        -magnitude
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
