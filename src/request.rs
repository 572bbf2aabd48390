//! Per-request record (spec.md §4.4). One is built from each inbound
//! [`crate::buffer::MessageBuffer`] before being handed to the
//! Dispatcher; its `unique` id threads through to exactly one reply.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::abi::{fuse_in_header, Opcode};

/// The decoded header plus whatever body bytes followed it. Built
/// once per inbound message by the process-pool worker and consumed
/// by the Dispatcher and provider callback.
pub struct Request<'a> {
    pub header: fuse_in_header,
    pub opcode: Option<Opcode>,
    pub body: &'a [u8],
    /// Set by the control path if an INTERRUPT names this request's
    /// `unique`. Providers may poll this between long-running steps;
    /// honoring it is best-effort (SPEC_FULL.md Open Question #2).
    interrupted: AtomicBool,
}

impl<'a> Request<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, crate::error::CoreError> {
        let header = crate::abi::read_struct::<fuse_in_header>(raw)
            .ok_or(crate::error::CoreError::ShortRead {
                expected: crate::abi::FUSE_IN_HEADER_SIZE,
                got: raw.len(),
            })?;
        let opcode = Opcode::from_u32(header.opcode);
        let body = &raw[crate::abi::FUSE_IN_HEADER_SIZE..];
        Ok(Self {
            header,
            opcode,
            body,
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    pub fn nodeid(&self) -> u64 {
        self.header.nodeid
    }

    pub fn mark_interrupted(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{fuse_in_header, struct_bytes};

    fn encode(opcode: u32, unique: u64, body: &[u8]) -> Vec<u8> {
        let header = fuse_in_header {
            len: (crate::abi::FUSE_IN_HEADER_SIZE + body.len()) as u32,
            opcode,
            unique,
            nodeid: 42,
            uid: 0,
            gid: 0,
            pid: 0,
            padding: 0,
        };
        let mut buf = struct_bytes(&header).to_vec();
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn parse_splits_header_and_body() {
        let raw = encode(Opcode::Getattr as u32, 7, &[1, 2, 3, 4]);
        let req = Request::parse(&raw).unwrap();
        assert_eq!(req.unique(), 7);
        assert_eq!(req.nodeid(), 42);
        assert_eq!(req.opcode, Some(Opcode::Getattr));
        assert_eq!(req.body, &[1, 2, 3, 4]);
    }

    #[test]
    fn parse_rejects_short_buffer() {
        let raw = vec![0u8; 4];
        assert!(Request::parse(&raw).is_err());
    }

    #[test]
    fn unknown_opcode_parses_with_none() {
        let raw = encode(999, 1, &[]);
        let req = Request::parse(&raw).unwrap();
        assert_eq!(req.opcode, None);
    }

    #[test]
    fn interrupt_flag_defaults_clear() {
        let raw = encode(Opcode::Getattr as u32, 1, &[]);
        let req = Request::parse(&raw).unwrap();
        assert!(!req.is_interrupted());
        req.mark_interrupted();
        assert!(req.is_interrupted());
    }
}
