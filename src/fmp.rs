//! Generic fixed-size slab pool, backed by anonymous `mmap` slabs
//! (spec.md §3 "FixedMemoryPool"). Grounded in libfuse's `lfmp.h`
//! (`lfmp_calloc`/`lfmp_free`/`lfmp_gc`): each slab is carved into a
//! freelist of fixed-size objects; allocation pops, free pushes; GC
//! scans one random slab per call and releases it if every object in
//! it is free.
//!
//! Used for [`crate::request::Request`] and [`crate::node::Node`]
//! records to keep per-request allocator traffic off the general
//! heap, per spec.md §3.

use std::ptr::NonNull;
use std::sync::Mutex;

struct Slab {
    base: NonNull<u8>,
    layout_size: usize,
    object_size: usize,
    object_count: usize,
    free_count: usize,
}

// SAFETY: the raw mmap region is only ever touched through the pool's
// mutex-guarded freelist operations below.
unsafe impl Send for Slab {}

impl Slab {
    fn new(object_size: usize, object_count: usize) -> Option<Self> {
        let page_size = page_size();
        let needed = object_size.checked_mul(object_count)?;
        let layout_size = needed.div_ceil(page_size) * page_size;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                layout_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        let base = NonNull::new(ptr as *mut u8)?;

        // Thread the freelist through the raw objects: each free slot's
        // first 8 bytes hold the offset of the next free slot, u64::MAX
        // terminates the chain. This is the same "intrusive freelist in
        // the object storage itself" trick `lfmp.h` uses.
        for i in 0..object_count {
            let slot = unsafe { base.as_ptr().add(i * object_size) };
            let next = if i + 1 < object_count {
                ((i + 1) * object_size) as u64
            } else {
                u64::MAX
            };
            unsafe { (slot as *mut u64).write_unaligned(next) };
        }

        Some(Self {
            base,
            layout_size,
            object_size,
            object_count,
            free_count: object_count,
        })
    }

    fn owns(&self, ptr: *mut u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let end = start + self.layout_size;
        let p = ptr as usize;
        p >= start && p < end
    }

    fn is_full_free(&self) -> bool {
        self.free_count == self.object_count
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.layout_size);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf with a well-known name is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE).max(4096) as usize }
}

struct FmpInner {
    slabs: Vec<(Slab, u64)>, // (slab, head offset into slab, or u64::MAX if empty)
    object_size: usize,
    objects_per_slab: usize,
    gc_cursor: usize,
}

/// A generic slab allocator for fixed-size `T` records.
pub struct FixedMemoryPool<T> {
    inner: Mutex<FmpInner>,
    _marker: std::marker::PhantomData<T>,
}

// SAFETY: allocation is synchronized through `inner`'s mutex; the pool
// itself holds no `T` values, only raw storage for them.
unsafe impl<T> Send for FixedMemoryPool<T> {}
unsafe impl<T> Sync for FixedMemoryPool<T> {}

impl<T> FixedMemoryPool<T> {
    /// `objects_per_slab` mirrors libfuse's `lfmp_init(&fmp, sizeof(T), 256)`
    /// call sites for request/node records.
    pub fn new(objects_per_slab: usize) -> Self {
        let object_size = std::mem::size_of::<T>().max(std::mem::size_of::<u64>());
        Self {
            inner: Mutex::new(FmpInner {
                slabs: Vec::new(),
                object_size,
                objects_per_slab,
                gc_cursor: 0,
            }),
            _marker: std::marker::PhantomData,
        }
    }

    /// Allocate zeroed storage for one `T`. Returns `None` on
    /// out-of-memory (mmap failure), which callers surface as
    /// `CoreError::OutOfMemory`.
    pub fn alloc(&self) -> Option<NonNull<T>> {
        let mut inner = self.inner.lock().unwrap();

        for (slab, head) in inner.slabs.iter_mut() {
            if *head != u64::MAX {
                let offset = *head;
                let slot = unsafe { slab.base.as_ptr().add(offset as usize) };
                let next = unsafe { (slot as *const u64).read_unaligned() };
                *head = next;
                slab.free_count -= 1;
                unsafe { std::ptr::write_bytes(slot, 0, slab.object_size) };
                return NonNull::new(slot as *mut T);
            }
        }

        let object_size = inner.object_size;
        let objects_per_slab = inner.objects_per_slab;
        let mut slab = Slab::new(object_size, objects_per_slab)?;
        let slot = unsafe { slab.base.as_ptr() };
        let next = unsafe { (slot as *const u64).read_unaligned() };
        slab.free_count -= 1;
        unsafe { std::ptr::write_bytes(slot, 0, object_size) };
        inner.slabs.push((slab, next));
        NonNull::new(slot as *mut T)
    }

    /// Return a previously allocated `T` to its slab's freelist.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`Self::alloc`] on this pool
    /// and not freed twice.
    pub unsafe fn free(&self, ptr: NonNull<T>) {
        let mut inner = self.inner.lock().unwrap();
        let raw = ptr.as_ptr() as *mut u8;
        let object_size = inner.object_size;

        for (slab, head) in inner.slabs.iter_mut() {
            if slab.owns(raw) {
                let offset = (raw as usize) - (slab.base.as_ptr() as usize);
                unsafe { (raw as *mut u64).write_unaligned(*head) };
                *head = offset as u64;
                slab.free_count += 1;
                let _ = object_size;
                return;
            }
        }
        debug_assert!(false, "freed pointer not owned by any slab in this pool");
    }

    /// Scan one slab (round-robin, not random — deterministic is
    /// easier to test and equally fair over many calls) and release it
    /// if fully free. Returns `true` if a slab was released.
    pub fn gc_one(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.slabs.is_empty() {
            return false;
        }
        let len = inner.slabs.len();
        let idx = inner.gc_cursor % len;
        inner.gc_cursor = inner.gc_cursor.wrapping_add(1);

        if inner.slabs[idx].0.is_full_free() {
            inner.slabs.remove(idx);
            true
        } else {
            false
        }
    }

    /// Repeatedly GC until three consecutive misses, mirroring
    /// libfuse's `node_gc()` loop.
    pub fn gc(&self) {
        let mut misses = 0;
        while misses < 3 {
            if self.gc_one() {
                misses = 0;
            } else {
                misses += 1;
            }
            if self.inner.lock().unwrap().slabs.is_empty() {
                break;
            }
        }
    }

    pub fn slab_count(&self) -> usize {
        self.inner.lock().unwrap().slabs.len()
    }
}
