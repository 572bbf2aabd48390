//! The kernel device handle (spec.md §4.1). Wraps an already-opened
//! `/dev/fuse` (or equivalent) file descriptor; opening the device and
//! performing the mount handshake itself is a Filesystem Provider
//! concern, not this crate's.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use crate::error::CoreError;

/// One pipe end pair, used when splice mode is enabled.
struct Pipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Pipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0i32; 2];
        // SAFETY: fds is a valid 2-element array.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// A handle onto the kernel device. `recv`/`send` move whole protocol
/// messages; splice mode is attempted when configured and the
/// platform supports it, otherwise falls back to `read`/`writev`.
pub struct Channel {
    fd: RawFd,
    owns_fd: bool,
    splice: Option<Pipe>,
}

impl Channel {
    /// Wrap an already-open device fd. `owns_fd` controls whether
    /// `Drop` closes it (set false for a cloned/borrowed fd the
    /// provider still owns).
    pub fn from_raw_fd(fd: RawFd, owns_fd: bool, use_splice: bool) -> io::Result<Self> {
        let splice = if use_splice && cfg!(target_os = "linux") {
            Some(Pipe::new()?)
        } else {
            None
        };
        Ok(Self {
            fd,
            owns_fd,
            splice,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Clone the device fd via the kernel's clone-fd ioctl, for a
    /// second independent recv channel. Returns `None` if unsupported;
    /// callers fall back to sharing the same fd across read threads.
    #[cfg(target_os = "linux")]
    pub fn clone_device_fd(&self) -> Option<RawFd> {
        const FUSE_DEV_IOC_CLONE: u64 = 0x8004e500;
        let clone_fd = unsafe {
            libc::open(b"/dev/fuse\0".as_ptr() as *const libc::c_char, libc::O_RDWR | libc::O_CLOEXEC)
        };
        if clone_fd < 0 {
            return None;
        }
        let source = self.fd as u32;
        let rc = unsafe { libc::ioctl(clone_fd, FUSE_DEV_IOC_CLONE, &source as *const u32) };
        if rc != 0 {
            unsafe { libc::close(clone_fd) };
            return None;
        }
        Some(clone_fd)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn clone_device_fd(&self) -> Option<RawFd> {
        None
    }

    /// Pull exactly one request message into `buf`. Returns the number
    /// of bytes read. `0` signals the device closed; `CoreError::Io`
    /// wraps retry-signal errnos (`EINTR`/`EAGAIN`/`ENOENT`) that
    /// callers should treat as "try again."
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        if let Some(pipe) = &self.splice {
            return self.recv_splice(pipe, buf);
        }
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n >= 0 {
                if (n as usize) < crate::abi::FUSE_IN_HEADER_SIZE && n != 0 {
                    return Err(CoreError::ShortRead {
                        expected: crate::abi::FUSE_IN_HEADER_SIZE,
                        got: n as usize,
                    });
                }
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ENODEV) => return Ok(0),
                _ => return Err(CoreError::Io(err)),
            }
        }
    }

    fn recv_splice(&self, pipe: &Pipe, buf: &mut [u8]) -> Result<usize, CoreError> {
        // Move up to buf.len() bytes device -> pipe, then vmsplice
        // pipe -> buf. Falls back to plain read on any splice failure
        // (e.g. non-Linux kernel without splice support on this fd).
        #[cfg(target_os = "linux")]
        {
            let moved = unsafe {
                libc::splice(
                    self.fd,
                    std::ptr::null_mut(),
                    pipe.write_fd,
                    std::ptr::null_mut(),
                    buf.len(),
                    libc::SPLICE_F_MOVE,
                )
            };
            if moved < 0 {
                return self.recv_plain_read(buf);
            }
            if moved == 0 {
                return Ok(0);
            }
            let n = unsafe {
                libc::read(pipe.read_fd, buf.as_mut_ptr() as *mut libc::c_void, moved as usize)
            };
            if n < 0 {
                return Err(CoreError::Io(io::Error::last_os_error()));
            }
            return Ok(n as usize);
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pipe;
            self.recv_plain_read(buf)
        }
    }

    fn recv_plain_read(&self, buf: &mut [u8]) -> Result<usize, CoreError> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(CoreError::Io(io::Error::last_os_error()));
        }
        Ok(n as usize)
    }

    /// Write one reply message, built from at most two contiguous
    /// slices (`out_header`, payload) — spec.md's "2-iovec message."
    pub fn send(&self, iov: &[&[u8]]) -> Result<(), CoreError> {
        let mut iovecs: Vec<libc::iovec> = iov
            .iter()
            .map(|s| libc::iovec {
                iov_base: s.as_ptr() as *mut libc::c_void,
                iov_len: s.len(),
            })
            .collect();
        let total: usize = iov.iter().map(|s| s.len()).sum();
        loop {
            let n = unsafe { libc::writev(self.fd, iovecs.as_mut_ptr(), iovecs.len() as i32) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(CoreError::Io(err));
            }
            if (n as usize) != total {
                return Err(CoreError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short write to device",
                )));
            }
            return Ok(());
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.owns_fd {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_zero_length_read_reports_closed() {
        // /dev/null always reads 0 bytes: simulates device-closed.
        let fd = unsafe {
            libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY)
        };
        assert!(fd >= 0);
        let channel = Channel::from_raw_fd(fd, true, false).unwrap();
        let mut buf = [0u8; 128];
        assert_eq!(channel.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn send_writes_all_iovecs() {
        let (r, w) = {
            let mut fds = [0i32; 2];
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
            (fds[0], fds[1])
        };
        let channel = Channel::from_raw_fd(w, true, false).unwrap();
        let a = [1u8, 2, 3];
        let b = [4u8, 5];
        channel.send(&[&a, &b]).unwrap();

        let mut buf = [0u8; 5];
        let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, 5);
        assert_eq!(buf, [1, 2, 3, 4, 5]);
        unsafe { libc::close(r) };
    }
}
