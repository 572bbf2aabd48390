//! Configuration surface consumed by the core (spec.md §6).
//!
//! Every field here is set by the embedding Filesystem Provider, not
//! parsed from argv by this crate — option parsing, daemonization and
//! CLI surface are explicitly out of scope (spec.md §1).

use std::time::Duration;

/// Named thread-pinning strategies (spec.md §4.3 / SPEC_FULL.md §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStrategy {
    AllToOneLogical,
    AllToOnePhysicalCore,
    ReadToFirstProcessToLast,
    StripeAcrossLogical,
    StripeAcrossPhysicalCores,
    MixedLogicalReadPhysicalProcess,
    MixedPhysicalReadLogicalProcess,
}

impl PinStrategy {
    /// Parse a strategy name. Unknown names are not an error here —
    /// the caller is expected to log and ignore per spec.md §4.3.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "all-to-one-logical" => PinStrategy::AllToOneLogical,
            "all-to-one-physical-core" => PinStrategy::AllToOnePhysicalCore,
            "read-to-first-process-to-last" => PinStrategy::ReadToFirstProcessToLast,
            "stripe-across-logical" => PinStrategy::StripeAcrossLogical,
            "stripe-across-physical-cores" => PinStrategy::StripeAcrossPhysicalCores,
            "mixed-logical-read-physical-process" => PinStrategy::MixedLogicalReadPhysicalProcess,
            "mixed-physical-read-logical-process" => PinStrategy::MixedPhysicalReadLogicalProcess,
            _ => return None,
        })
    }
}

/// Thread-count configuration for the worker pools (spec.md §4.3 table).
/// Negative values mean "nproc divided by |value|, clamped to >= 1".
#[derive(Debug, Clone, Copy)]
pub struct ThreadCountConfig {
    pub read_threads: i32,
    pub process_threads: i32,
}

impl Default for ThreadCountConfig {
    fn default() -> Self {
        Self {
            read_threads: 0,
            process_threads: -1,
        }
    }
}

/// Resolved (always-positive) thread counts plus whether the session
/// runs synchronously (single pool) or asynchronously (read + process).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedThreadCounts {
    pub read_threads: usize,
    pub process_threads: Option<usize>,
}

impl ThreadCountConfig {
    /// Resolve the table in spec.md §4.3 against the detected CPU count.
    pub fn resolve(&self, nproc: usize) -> ResolvedThreadCounts {
        let nproc = nproc.max(1);

        fn resolve_count(value: i32, nproc: usize) -> usize {
            if value > 0 {
                value as usize
            } else if value < 0 {
                (nproc / (value.unsigned_abs() as usize)).max(1)
            } else {
                0
            }
        }

        match (self.read_threads, self.process_threads) {
            (0, p) if p < 0 => ResolvedThreadCounts {
                read_threads: nproc.min(8),
                process_threads: None,
            },
            (0, 0) => ResolvedThreadCounts {
                read_threads: 2,
                process_threads: Some(nproc.saturating_sub(2).max(1).min(8)),
            },
            (r, p) if r != 0 && p < 0 => ResolvedThreadCounts {
                read_threads: resolve_count(r, nproc),
                process_threads: None,
            },
            (r, p) => ResolvedThreadCounts {
                read_threads: resolve_count(r, nproc).max(1),
                process_threads: Some(resolve_count(p, nproc).max(1)),
            },
        }
    }
}

/// Session-wide tunables the provider supplies at mount time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub threads: ThreadCountConfig,
    /// Depth multiplier for the MPMC process queue: capacity is
    /// `process_threads * queue_depth`.
    pub process_queue_depth: usize,
    pub pin_strategy: Option<PinStrategy>,
    pub max_pages: u32,
    pub clone_fd: bool,
    pub splice_read: bool,
    pub splice_write: bool,
    pub splice_move: bool,
    pub remote_locks: bool,
    pub negative_entry_ttl: Duration,
    pub attr_ttl: Duration,
    pub entry_ttl: Duration,
    pub remember_ttl: Option<Duration>,
    /// Capability bits the provider additionally wants beyond the
    /// server's compiled-in defaults (spec.md §4.5 step 4).
    pub want_capability_overrides: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            threads: ThreadCountConfig::default(),
            process_queue_depth: 2,
            pin_strategy: None,
            max_pages: 256,
            clone_fd: false,
            splice_read: cfg!(target_os = "linux"),
            splice_write: cfg!(target_os = "linux"),
            splice_move: false,
            remote_locks: false,
            negative_entry_ttl: Duration::from_secs(0),
            attr_ttl: Duration::from_secs(1),
            entry_ttl: Duration::from_secs(1),
            remember_ttl: None,
            want_capability_overrides: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronous_defaults_clamp_to_eight() {
        let cfg = ThreadCountConfig {
            read_threads: 0,
            process_threads: -1,
        };
        let r = cfg.resolve(32);
        assert_eq!(r.read_threads, 8);
        assert_eq!(r.process_threads, None);
    }

    #[test]
    fn asynchronous_defaults() {
        let cfg = ThreadCountConfig {
            read_threads: 0,
            process_threads: 0,
        };
        let r = cfg.resolve(10);
        assert_eq!(r.read_threads, 2);
        assert_eq!(r.process_threads, Some(8));
    }

    #[test]
    fn explicit_counts_pass_through() {
        let cfg = ThreadCountConfig {
            read_threads: 4,
            process_threads: 6,
        };
        let r = cfg.resolve(64);
        assert_eq!(r.read_threads, 4);
        assert_eq!(r.process_threads, Some(6));
    }

    #[test]
    fn negative_process_divides_nproc() {
        let cfg = ThreadCountConfig {
            read_threads: 2,
            process_threads: -2,
        };
        let r = cfg.resolve(16);
        assert_eq!(r.read_threads, 2);
        assert_eq!(r.process_threads, Some(8));
    }

    #[test]
    fn low_nproc_clamps_to_one() {
        let cfg = ThreadCountConfig {
            read_threads: -4,
            process_threads: -4,
        };
        let r = cfg.resolve(1);
        assert_eq!(r.read_threads, 1);
        assert_eq!(r.process_threads, Some(1));
    }

    #[test]
    fn pin_strategy_unknown_is_none() {
        assert_eq!(PinStrategy::parse("bogus"), None);
        assert_eq!(
            PinStrategy::parse("stripe-across-logical"),
            Some(PinStrategy::StripeAcrossLogical)
        );
    }
}
