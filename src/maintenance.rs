//! The out-of-band maintenance thread (spec.md §2, §3 "Remembered
//! list"). Grounded in libfuse's `fuse_maintenance_loop`
//! (`lib/fuse.c`): once per sleep interval it prunes remembered nodes
//! whose TTL has elapsed, and every 15th iteration additionally GCs the
//! slab/buffer pools (`lfmp_gc`, `msgbuf_gc_10percent`). The
//! `setup`/`push_job`/`stop` shape follows `lib/maintenance_thread.cpp`,
//! adapted from a process-wide singleton to a per-session handle (per
//! `DESIGN.md`'s "session-scoped context, not global singleton" note).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::session::Session;

/// How often the original `fuse_maintenance_loop` wakes (spec.md §4
/// "Maintenance thread's 60-second sleep").
const SLEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Every `GC_EVERY_N_LOOPS`th wakeup also GCs the buffer pool, mirroring
/// `fuse.c`'s `(loops % 15) == 0` full garbage-collection pass.
const GC_EVERY_N_LOOPS: u64 = 15;

struct Shutdown {
    lock: Mutex<bool>,
    cvar: Condvar,
}

/// Handle to the running maintenance thread. Dropping it does not stop
/// the thread (use [`MaintenanceThread::stop`] explicitly, matching the
/// original's separate `setup`/`stop` calls rather than RAII).
pub struct MaintenanceThread {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<Shutdown>,
    ticks: Arc<AtomicU64>,
}

impl MaintenanceThread {
    /// Spawn the loop against `session`. `remember_ttl_ticks` is the
    /// TTL in the same abstract tick unit `InodeCache::prune_remembered`
    /// uses (one tick per sleep interval elapsed); `None` disables
    /// pruning entirely (the "remember" feature is off for this
    /// session, per spec.md §3).
    pub fn spawn(session: Arc<Session>, remember_ttl_ticks: Option<u64>) -> Self {
        let shutdown = Arc::new(Shutdown {
            lock: Mutex::new(false),
            cvar: Condvar::new(),
        });
        let ticks = Arc::new(AtomicU64::new(0));

        let thread_shutdown = shutdown.clone();
        let thread_ticks = ticks.clone();
        let handle = std::thread::spawn(move || {
            maintenance_loop(session, remember_ttl_ticks, thread_shutdown, thread_ticks);
        });

        Self {
            handle: Some(handle),
            shutdown,
            ticks,
        }
    }

    /// Current tick count, exposed for tests that want to assert the
    /// loop has woken at least once without waiting a full 60 seconds.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Signal the loop to exit and join it. Wakes an in-progress sleep
    /// immediately rather than waiting out the remaining interval.
    pub fn stop(mut self) {
        *self.shutdown.lock.lock().unwrap() = true;
        self.shutdown.cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            *self.shutdown.lock.lock().unwrap() = true;
            self.shutdown.cvar.notify_all();
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn maintenance_loop(
    session: Arc<Session>,
    remember_ttl_ticks: Option<u64>,
    shutdown: Arc<Shutdown>,
    ticks: Arc<AtomicU64>,
) {
    let mut loops: u64 = 0;
    loop {
        if let Some(ttl) = remember_ttl_ticks {
            let now = ticks.load(Ordering::Acquire);
            let pruned = session.cache.prune_remembered(now, ttl);
            if pruned > 0 {
                log::debug!("maintenance: pruned {pruned} remembered node(s)");
            }
        }

        if loops % GC_EVERY_N_LOOPS == 0 {
            session.buffers.gc_10_percent();
        }

        loops = loops.wrapping_add(1);
        ticks.fetch_add(1, Ordering::AcqRel);

        let guard = shutdown.lock.lock().unwrap();
        if *guard {
            return;
        }
        let (guard, timeout) = shutdown
            .cvar
            .wait_timeout(guard, SLEEP_INTERVAL)
            .unwrap();
        if *guard {
            return;
        }
        let _ = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::provider::PathFilesystem;

    struct Noop;
    impl PathFilesystem for Noop {}

    #[test]
    fn stop_joins_cleanly_even_mid_sleep() {
        let session = Arc::new(Session::new(SessionConfig::default(), Arc::new(Noop)));
        let maint = MaintenanceThread::spawn(session, Some(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(maint.ticks() >= 1);
        maint.stop();
    }

    #[test]
    fn disabled_remember_never_touches_cache() {
        let session = Arc::new(Session::new(SessionConfig::default(), Arc::new(Noop)));
        let maint = MaintenanceThread::spawn(session.clone(), None);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(session.cache.remembered_count(), 0);
        maint.stop();
    }

    #[test]
    fn drop_without_explicit_stop_still_joins() {
        let session = Arc::new(Session::new(SessionConfig::default(), Arc::new(Noop)));
        {
            let _maint = MaintenanceThread::spawn(session, Some(10));
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
