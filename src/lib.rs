//! Userspace runtime for the kernel<->userspace filesystem protocol.
//!
//! This crate implements the plumbing that sits between a character
//! device speaking the FUSE wire protocol and a concrete *Filesystem
//! Provider*: version negotiation, the inode/path cache, the two-stage
//! worker pool, recycled aligned message buffers, and per-file advisory
//! locking. It does not implement a filesystem itself — branch
//! selection, union semantics, mount-helper invocation and storage
//! backends are the job of whatever registers a [`provider::LowLevelFilesystem`]
//! or [`provider::PathFilesystem`] with a [`session::Session`].

pub mod abi;
pub mod adaptor;
pub mod buffer;
pub mod cache;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fmp;
pub mod lock;
pub mod maintenance;
pub mod node;
pub mod pin_threads;
pub mod provider;
pub mod reply;
pub mod request;
pub mod session;
pub mod workers;

pub use cache::{InodeCache, PathError};
pub use channel::Channel;
pub use config::SessionConfig;
pub use error::CoreError;
pub use maintenance::MaintenanceThread;
pub use node::{Node, NodeId};
pub use provider::{LowLevelFilesystem, PathFilesystem};
pub use session::Session;
pub use workers::WorkerPool;
