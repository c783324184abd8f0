use std::{
    alloc::{GlobalAlloc, Layout},
    ptr,
    sync::{Mutex, MutexGuard},
};

use crate::block::BLOCK_HEADER_SIZE;
use crate::buddy::BuddyAlloc;
use crate::stats::AllocCounters;

/// The public face of the allocator: a C-style allocation surface over
/// the buddy arena, plus the counters the arena keeps about itself.
///
/// The core allocator is strictly single-mutator, so this facade owns
/// it behind a mutex and serialises every caller. Construction is
/// `const`, which is what allows
///
/// ```no_run
/// use buddymalloc::BuddyMalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: BuddyMalloc = BuddyMalloc::new();
///
/// fn main() {
///     let on_our_heap = Box::new(42);
///     assert_eq!(*on_our_heap, 42);
/// }
/// ```
///
/// The arena itself is reserved lazily, on the first allocation that
/// goes through.
///
/// All failures are silent by design: allocation-family calls return
/// null and release-family calls do nothing, leaving the allocator in
/// a valid state either way.
pub struct BuddyMalloc {
    inner: Mutex<BuddyAlloc>,
}

impl BuddyMalloc {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(BuddyAlloc::new()),
        }
    }

    /// Takes the lock, shrugging off poisoning: the allocator's state
    /// stays consistent across a caller's panic because no operation
    /// unwinds half-done.
    fn lock(&self) -> MutexGuard<'_, BuddyAlloc> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocates `size` bytes and returns a pointer to the payload, or
    /// null when the request is zero, too large, or cannot be served.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        match unsafe { self.lock().allocate(size) } {
            Ok(payload) => payload.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Allocates `num * size` bytes, zeroed. Returns null on overflow
    /// or any allocation failure.
    pub fn calloc(&self, num: usize, size: usize) -> *mut u8 {
        match unsafe { self.lock().allocate_zeroed(num, size) } {
            Ok(payload) => payload.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Releases `ptr`. Null, foreign and already-free pointers are
    /// silently ignored.
    ///
    /// **SAFETY**: `ptr` must be null or a pointer previously returned
    /// by this allocator that has not been handed back since; the
    /// caller must not touch the memory afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let _ = unsafe { self.lock().release(ptr) };
    }

    /// Resizes the allocation behind `ptr` to `new_size` bytes.
    /// Shrinks are in place; growth merges free buddies in place when
    /// possible and otherwise moves the payload. `realloc(ptr, 0)`
    /// frees and returns null; `realloc(null, n)` allocates.
    ///
    /// **SAFETY**: same contract as [`free`](Self::free); on success
    /// the old pointer must no longer be used.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        match unsafe { self.lock().reallocate(ptr, new_size) } {
            Ok(payload) => payload.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Number of free blocks, over every order and the mapped list.
    pub fn free_blocks(&self) -> u64 {
        self.lock().counters().free_blocks
    }

    /// Free payload bytes.
    pub fn free_bytes(&self) -> u64 {
        self.lock().counters().free_bytes
    }

    /// Number of live blocks, free and in use alike.
    pub fn allocated_blocks(&self) -> u64 {
        self.lock().counters().allocated_blocks
    }

    /// Live payload bytes, excluding every header.
    pub fn allocated_bytes(&self) -> u64 {
        self.lock().counters().allocated_bytes
    }

    /// Bytes spent on block headers.
    pub fn metadata_bytes(&self) -> u64 {
        self.lock().counters().metadata_bytes
    }

    /// Size of one block header. Constant for the life of the process.
    pub fn header_size(&self) -> u64 {
        BLOCK_HEADER_SIZE as u64
    }

    /// All five counters in one consistent snapshot.
    pub fn counters(&self) -> AllocCounters {
        self.lock().counters()
    }

    /// Recomputes the counters by walking the arena and the mapped
    /// list. Diagnostic: the result must always equal
    /// [`counters`](Self::counters).
    pub fn recount(&self) -> AllocCounters {
        self.lock().recount()
    }

    /// Walks the arena checking cookies, coverage and the
    /// full-coalescing property. Diagnostic.
    pub fn verify_integrity(&self) -> bool {
        self.lock().verify_integrity()
    }
}

impl Default for BuddyMalloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for BuddyMalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Payloads sit one header past a power-of-two block boundary,
        // so their alignment is exactly the header size. Stricter
        // layouts cannot be honoured.
        if layout.align() > BLOCK_HEADER_SIZE {
            return ptr::null_mut();
        }

        BuddyMalloc::alloc(self, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.free(ptr) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCK_HEADER_SIZE {
            return ptr::null_mut();
        }

        self.calloc(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > BLOCK_HEADER_SIZE {
            return ptr::null_mut();
        }

        unsafe { BuddyMalloc::realloc(self, ptr, new_size) }
    }
}
