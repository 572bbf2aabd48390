//! Two-stage worker pool (spec.md §4.3). Grounded in libfuse's
//! `lib/thread_pool.hpp` (pthread pool with blocked-signal startup,
//! cancel-at-join shutdown) and `lib/fuse_loop_mt.cpp` (synchronous vs
//! asynchronous read/process split). The MPMC queue is hand-rolled
//! rather than pulled from a crate, preferring `std::sync` primitives
//! over a dependency for this (see `DESIGN.md`); the enqueue-side
//! exponential back-sleep mirrors
//! `ThreadPool::enqueue_work`'s `nanosleep`-with-growing-`tv_nsec` loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::MessageBuffer;
use crate::channel::Channel;
use crate::config::ResolvedThreadCounts;
use crate::dispatch::dispatch;
use crate::pin_threads::{self, Role};
use crate::request::Request;
use crate::session::Session;

/// One recv'd-but-not-yet-processed message, queued between the read
/// pool and the process pool in asynchronous mode.
struct Task {
    buf: MessageBuffer,
}

/// Bounded MPMC queue. Enqueue retries with an exponentially growing
/// sleep when full (spec.md §4.3 "blocks briefly with exponential
/// back-sleep"); dequeue blocks indefinitely on a condvar (spec.md
/// §4.3 "dequeue blocks indefinitely") until an item appears or the
/// queue is closed for shutdown.
struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Blocks (with back-sleep) until there is room, then pushes.
    /// Returns immediately if the queue is closed (caller should stop
    /// producing).
    fn enqueue(&self, item: T) {
        let mut item = Some(item);
        let mut delay_ns = 10u64;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            {
                let mut guard = self.items.lock().unwrap();
                if guard.len() < self.capacity {
                    guard.push_back(item.take().unwrap());
                    self.not_empty.notify_one();
                    return;
                }
            }
            std::thread::sleep(Duration::from_nanos(delay_ns));
            delay_ns = (delay_ns * 2).min(50_000_000);
        }
    }

    /// Blocks until an item is available or the queue is closed and
    /// drained, in which case `None` is returned so the process thread
    /// can exit its loop.
    fn dequeue(&self) -> Option<T> {
        let mut guard = self.items.lock().unwrap();
        loop {
            if let Some(item) = guard.pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_all();
    }
}

/// Process one inbound message end to end: parse, dispatch, send the
/// reply if the opcode produces one.
fn process_one(session: &Session, channel: &Channel, body: &[u8]) {
    let req = match Request::parse(body) {
        Ok(req) => req,
        Err(_) => return,
    };
    if let Some(reply) = dispatch(session, &req) {
        if let Err(e) = channel.send(&[&reply]) {
            log::warn!("reply send failed: {e}");
        }
    }
}

/// Owns the spawned read/process threads for one session and blocks
/// the caller until any of them exits (device closed, fatal recv
/// error, or explicit shutdown), at which point it cancels the rest
/// and joins.
pub struct WorkerPool {
    threads: Vec<JoinHandle<()>>,
    stopped: Arc<(Mutex<bool>, Condvar)>,
}

impl WorkerPool {
    /// Spawn the pool per `counts` (already resolved against the
    /// config table in spec.md §4.3) against one shared `channel`.
    /// Read threads run `alloc -> recv -> process|enqueue` in a loop;
    /// in asynchronous mode a second pool of process threads drains
    /// the queue.
    pub fn spawn(
        session: Arc<Session>,
        channel: Arc<Channel>,
        counts: ResolvedThreadCounts,
        pin_strategy: Option<crate::config::PinStrategy>,
        queue_depth: usize,
    ) -> Self {
        let stopped = Arc::new((Mutex::new(false), Condvar::new()));
        let mut threads = Vec::new();

        // Block all signals before spawning so child threads inherit
        // a clean mask (spec.md §5 "worker threads block all signals
        // during startup"), matching thread_pool.hpp's
        // pthread_sigmask(SIG_BLOCK, full, &old) / ... / SIG_SETMASK.
        #[cfg(unix)]
        let _signal_guard = block_all_signals();

        match counts.process_threads {
            None => {
                // Synchronous mode: one pool, no queue.
                for i in 0..counts.read_threads {
                    let session = session.clone();
                    let channel = channel.clone();
                    let stopped = stopped.clone();
                    let read_threads = counts.read_threads;
                    threads.push(std::thread::spawn(move || {
                        pin_threads::apply(pin_strategy, Role::Read, i, read_threads, 0);
                        synchronous_loop(&session, &channel);
                        notify_stopped(&stopped);
                    }));
                }
            }
            Some(process_threads) => {
                let queue = Arc::new(BoundedQueue::<Task>::new(
                    process_threads.max(1) * queue_depth.max(1),
                ));

                for i in 0..counts.read_threads {
                    let session = session.clone();
                    let channel = channel.clone();
                    let queue = queue.clone();
                    let stopped = stopped.clone();
                    let read_threads = counts.read_threads;
                    threads.push(std::thread::spawn(move || {
                        pin_threads::apply(pin_strategy, Role::Read, i, read_threads, process_threads);
                        read_loop(&session, &channel, &queue);
                        queue.close();
                        notify_stopped(&stopped);
                    }));
                }
                for i in 0..process_threads {
                    let session = session.clone();
                    let channel = channel.clone();
                    let queue = queue.clone();
                    let stopped = stopped.clone();
                    let read_threads = counts.read_threads;
                    threads.push(std::thread::spawn(move || {
                        pin_threads::apply(pin_strategy, Role::Process, i, read_threads, process_threads);
                        process_loop(&session, &channel, &queue);
                        notify_stopped(&stopped);
                    }));
                }
            }
        }

        Self { threads, stopped }
    }

    /// Block until the first worker thread exits, then mark the
    /// session exited (so any sibling workers notice on their next
    /// check) and join everyone. Mirrors spec.md §4.3's "finished
    /// semaphore wakes the main thread once any worker exits."
    pub fn wait_for_exit(self, session: &Session) {
        {
            let (lock, cvar) = &*self.stopped;
            let mut done = lock.lock().unwrap();
            while !*done {
                done = cvar.wait(done).unwrap();
            }
        }
        session.exited.store(true, Ordering::Release);
        for t in self.threads {
            let _ = t.join();
        }
    }
}

fn notify_stopped(stopped: &Arc<(Mutex<bool>, Condvar)>) {
    let (lock, cvar) = &**stopped;
    *lock.lock().unwrap() = true;
    cvar.notify_all();
}

/// `alloc -> recv -> process -> free`, looped until the session exits
/// or the device closes. The only true suspension/cancellation point
/// is inside `recv` (spec.md §4.3/§5); a thread blocked there only
/// wakes once the kernel sends something or the device fd is closed
/// out from under it — this crate does not emulate `pthread_cancel`.
fn synchronous_loop(session: &Session, channel: &Channel) {
    while !session.exited.load(Ordering::Acquire) {
        let Some(mut buf) = session.buffers.alloc() else {
            log::error!("message buffer allocation failed");
            return;
        };
        match channel.recv(buf.as_mut_slice()) {
            Ok(0) => {
                session.buffers.free(buf);
                return;
            }
            Ok(n) => {
                buf.len = n;
                process_one(session, channel, buf.as_slice());
                session.buffers.free(buf);
            }
            Err(e) if e.is_retryable() => {
                session.buffers.free(buf);
                continue;
            }
            Err(e) => {
                session.buffers.free(buf);
                if !e.is_clean_exit() {
                    log::error!("fatal recv error: {e}");
                }
                return;
            }
        }
    }
}

fn read_loop(session: &Session, channel: &Channel, queue: &BoundedQueue<Task>) {
    while !session.exited.load(Ordering::Acquire) {
        let Some(mut buf) = session.buffers.alloc() else {
            log::error!("message buffer allocation failed");
            return;
        };
        match channel.recv(buf.as_mut_slice()) {
            Ok(0) => {
                session.buffers.free(buf);
                return;
            }
            Ok(n) => {
                buf.len = n;
                queue.enqueue(Task { buf });
            }
            Err(e) if e.is_retryable() => {
                session.buffers.free(buf);
                continue;
            }
            Err(e) => {
                session.buffers.free(buf);
                if !e.is_clean_exit() {
                    log::error!("fatal recv error: {e}");
                }
                return;
            }
        }
    }
}

fn process_loop(session: &Session, channel: &Channel, queue: &BoundedQueue<Task>) {
    loop {
        if session.exited.load(Ordering::Acquire) {
            return;
        }
        let Some(task) = queue.dequeue() else {
            return;
        };
        process_one(session, channel, task.buf.as_slice());
        session.buffers.free(task.buf);
    }
}

#[cfg(unix)]
struct SignalMaskGuard(libc::sigset_t);

#[cfg(unix)]
fn block_all_signals() -> SignalMaskGuard {
    unsafe {
        let mut newset: libc::sigset_t = std::mem::zeroed();
        let mut oldset: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut newset);
        libc::pthread_sigmask(libc::SIG_BLOCK, &newset, &mut oldset);
        SignalMaskGuard(oldset)
    }
}

#[cfg(unix)]
impl Drop for SignalMaskGuard {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.0, std::ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn queue_enqueue_dequeue_preserves_order() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4);
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
    }

    #[test]
    fn queue_closed_and_empty_returns_none() {
        let q: BoundedQueue<u32> = BoundedQueue::new(2);
        q.close();
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn queue_over_capacity_enqueue_unblocks_after_dequeue() {
        let q = Arc::new(BoundedQueue::<u32>::new(1));
        q.enqueue(1);

        let producer_q = q.clone();
        let handle = std::thread::spawn(move || {
            producer_q.enqueue(2);
        });

        // Give the producer a moment to observe the full queue and
        // start back-sleeping before we drain it.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.dequeue(), Some(1));
        handle.join().unwrap();
        assert_eq!(q.dequeue(), Some(2));
    }

    #[test]
    fn synchronous_pool_processes_init_over_a_socketpair() {
        use crate::abi::{self, fuse_init_in, fuse_init_out, Opcode};
        use crate::config::SessionConfig;
        use crate::provider::PathFilesystem;

        struct Noop;
        impl PathFilesystem for Noop {}

        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()),
                0
            );
        }
        let (kernel_fd, server_fd) = (fds[0], fds[1]);

        let session = Arc::new(Session::new(SessionConfig::default(), Arc::new(Noop)));
        let channel = Arc::new(Channel::from_raw_fd(server_fd, true, false).unwrap());

        let counts = ResolvedThreadCounts {
            read_threads: 1,
            process_threads: None,
        };
        let pool = WorkerPool::spawn(session.clone(), channel.clone(), counts, None, 2);

        let init_in = fuse_init_in {
            major: 7,
            minor: 31,
            max_readahead: 0,
            flags: 0,
            flags2: 0,
            unused: [0; 11],
        };
        let body = abi::struct_bytes(&init_in);
        let header = abi::fuse_in_header {
            len: (abi::FUSE_IN_HEADER_SIZE + body.len()) as u32,
            opcode: Opcode::Init as u32,
            unique: 42,
            nodeid: 0,
            uid: 0,
            gid: 0,
            pid: 0,
            padding: 0,
        };
        let mut msg = abi::struct_bytes(&header).to_vec();
        msg.extend_from_slice(body);
        unsafe {
            libc::write(kernel_fd, msg.as_ptr() as *const libc::c_void, msg.len());
        }

        let mut reply = [0u8; 256];
        let n = unsafe {
            libc::read(kernel_fd, reply.as_mut_ptr() as *mut libc::c_void, reply.len())
        };
        assert!(n > 0);
        let out_header: abi::fuse_out_header = abi::read_struct(&reply[..n as usize]).unwrap();
        assert_eq!(out_header.unique, 42);
        assert_eq!(out_header.error, 0);
        let payload = &reply[abi::FUSE_OUT_HEADER_SIZE..n as usize];
        let init_out: fuse_init_out = abi::read_struct(payload).unwrap();
        assert_eq!(init_out.major, abi::FUSE_KERNEL_VERSION);

        unsafe {
            libc::close(kernel_fd);
        }
        session.exited.store(true, Ordering::Release);
        pool.wait_for_exit(&session);
    }
}
