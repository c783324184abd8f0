use std::ptr::{self, NonNull};

use crate::arena::{Arena, ARENA_SIZE};
use crate::block::{
    footprint_of, order_for, payload_of, BlockHeader, BlockKind, BLOCK_HEADER_SIZE, COOKIE,
    MAX_BLOCK_SIZE, MAX_ORDER, ORDER_COUNT,
};
use crate::freelist::FreeLists;
use crate::kernel;
use crate::stats::AllocCounters;

/// Largest user request the allocator will even consider, in bytes.
pub const MAX_USER_REQUEST: usize = 100_000_000;

/// Why an operation produced nothing.
///
/// The public surface stays silent (null pointers and no-ops), but the
/// internal paths classify their failures so tests can tell an
/// exhausted arena from a rejected pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocFailure {
    /// Zero-byte request.
    ZeroSize,
    /// Request above [`MAX_USER_REQUEST`], or a `calloc` overflow.
    TooLarge,
    /// The program-break extension failed; the allocator is
    /// permanently unavailable.
    ArenaUnavailable,
    /// No free block of sufficient order.
    Exhausted,
    /// The OS refused the anonymous mapping.
    MapFailed,
    /// The pointer's header carries the wrong cookie.
    ForeignPointer,
    /// The block behind the pointer is already free.
    DoubleFree,
    /// `realloc` to zero bytes, which frees and returns null.
    ReallocToZero,
}

/// The arena lifecycle. Reservation happens lazily on the first
/// allocation, and a failed reservation is sticky: every later request
/// fails without retrying.
enum ArenaState {
    Pending,
    Ready(Heap),
    Failed,
}

/// The allocator: a lazily reserved heap behind a sticky state flag.
///
/// All operations run to completion without yielding and nothing here
/// is synchronised; one mutator at a time. The facade in
/// [`crate::memalloc`] is what serialises concurrent callers.
pub(crate) struct BuddyAlloc {
    state: ArenaState,
}

// SAFETY: every pointer reachable from here leads into the arena or
// into mappings this allocator owns exclusively; nothing aliases them
// from outside. Moving the whole allocator between threads is fine as
// long as access is serialised, which the facade's mutex provides.
unsafe impl Send for BuddyAlloc {}

impl BuddyAlloc {
    pub const fn new() -> Self {
        Self {
            state: ArenaState::Pending,
        }
    }

    /// Reserves the arena on first use and hands out the heap, or the
    /// sticky failure.
    fn heap(&mut self) -> Result<&mut Heap, AllocFailure> {
        if let ArenaState::Pending = self.state {
            let mut lists = FreeLists::new();

            self.state = match unsafe { Arena::bootstrap(&mut lists) } {
                Some(arena) => {
                    info!("buddy allocator: arena ready at {:p}", arena.base());
                    ArenaState::Ready(Heap { arena, lists })
                }
                None => {
                    error!("buddy allocator: arena reservation failed, allocator disabled");
                    ArenaState::Failed
                }
            };
        }

        match &mut self.state {
            ArenaState::Ready(heap) => Ok(heap),
            _ => Err(AllocFailure::ArenaUnavailable),
        }
    }

    /// Allocation path: validates the request, then lets the heap pick
    /// between the arena and a direct mapping.
    pub unsafe fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocFailure> {
        if size == 0 {
            return Err(AllocFailure::ZeroSize);
        }
        if size > MAX_USER_REQUEST {
            return Err(AllocFailure::TooLarge);
        }

        let heap = self.heap()?;
        unsafe { heap.allocate(size) }
    }

    /// `calloc`: overflow-checked multiplication, then a zeroed
    /// allocation.
    pub unsafe fn allocate_zeroed(
        &mut self,
        num: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocFailure> {
        let total = num.checked_mul(size).ok_or(AllocFailure::TooLarge)?;
        let payload = unsafe { self.allocate(total) }?;

        unsafe {
            ptr::write_bytes(payload.as_ptr(), 0, total);
        }

        Ok(payload)
    }

    /// Release path. Null pointers, foreign pointers and double frees
    /// all leave the allocator untouched; the error only reports which
    /// case it was.
    pub unsafe fn release(&mut self, ptr: *mut u8) -> Result<(), AllocFailure> {
        if ptr.is_null() {
            return Ok(());
        }

        // Before the arena exists nothing was ever handed out, so any
        // pointer is foreign; don't even look at its header.
        let ArenaState::Ready(heap) = &mut self.state else {
            return Err(AllocFailure::ForeignPointer);
        };

        unsafe { heap.release(ptr) }
    }

    /// `realloc`: frees on zero, allocates on null, otherwise grows in
    /// place when the buddies allow it and moves as a last resort.
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocFailure> {
        if new_size == 0 {
            let _ = unsafe { self.release(ptr) };
            return Err(AllocFailure::ReallocToZero);
        }

        if ptr.is_null() {
            return unsafe { self.allocate(new_size) };
        }

        let ArenaState::Ready(heap) = &mut self.state else {
            return Err(AllocFailure::ForeignPointer);
        };

        unsafe { heap.reallocate(ptr, new_size) }
    }

    /// The stored counters, summed over every order and the mapped
    /// list. All zero until the first allocation reserves the arena.
    pub fn counters(&self) -> AllocCounters {
        match &self.state {
            ArenaState::Ready(heap) => heap.lists.totals(),
            _ => AllocCounters::new(),
        }
    }

    /// Recomputes the counters from scratch by walking the arena and
    /// the mapped list. Diagnostics only; at any quiescent point this
    /// must equal [`counters`](Self::counters) exactly.
    pub fn recount(&self) -> AllocCounters {
        match &self.state {
            ArenaState::Ready(heap) => heap.recount(),
            _ => AllocCounters::new(),
        }
    }

    /// Structural self-check: cookies, exact arena coverage, and the
    /// full-coalescing property (no two free buddies of equal order).
    pub fn verify_integrity(&self) -> bool {
        match &self.state {
            ArenaState::Ready(heap) => heap.verify_integrity(),
            _ => true,
        }
    }
}

/// The reserved arena plus its bookkeeping. Everything in here assumes
/// the arena exists.
struct Heap {
    arena: Arena,
    lists: FreeLists,
}

impl Heap {
    unsafe fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocFailure> {
        // Requests that don't fit in a top-order block bypass the
        // arena entirely. Strictly greater: a request of exactly
        // MAX_BLOCK_SIZE - header still lives in the arena.
        if size + BLOCK_HEADER_SIZE > MAX_BLOCK_SIZE {
            return unsafe { self.allocate_mapped(size) };
        }

        let target = order_for(size + BLOCK_HEADER_SIZE).ok_or(AllocFailure::Exhausted)?;

        // Scan upward for a donor block, smallest order first.
        let mut donor = None;
        for order in target..=MAX_ORDER {
            if let Some(block) = self.lists.order(order).first_fit(size) {
                donor = Some((order, block));
                break;
            }
        }

        let (mut order, mut block) = donor.ok_or(AllocFailure::Exhausted)?;

        unsafe {
            self.lists.order_mut(order).remove(block);

            // Split down to the target, keeping the low half each time.
            while order > target {
                self.halve(block, order);
                order -= 1;
            }

            block.as_mut().is_free = false;
            Ok(BlockHeader::payload(block))
        }
    }

    /// Splits a free block of `order` in half. The block must be off
    /// every list; its high half gets a fresh header and goes onto the
    /// order below, the low half stays off-list for the caller to
    /// split further or hand out.
    unsafe fn halve(&mut self, mut block: NonNull<BlockHeader>, order: usize) {
        let half = order - 1;

        unsafe {
            self.lists.order_mut(order).unregister(payload_of(order));

            block.as_mut().kind = BlockKind::Buddy { order: half as u8 };
            block.as_mut().size = payload_of(half) as u32;

            let sibling_ptr = block
                .as_ptr()
                .cast::<u8>()
                .add(footprint_of(half))
                .cast::<BlockHeader>();
            sibling_ptr.write(BlockHeader {
                cookie: COOKIE,
                size: payload_of(half) as u32,
                is_free: true,
                kind: BlockKind::Buddy { order: half as u8 },
                next: None,
                prev: None,
            });
            let sibling = NonNull::new_unchecked(sibling_ptr);

            let lower = self.lists.order_mut(half);
            lower.register(payload_of(half));
            lower.register(payload_of(half));
            lower.insert(sibling);
        }
    }

    unsafe fn allocate_mapped(&mut self, size: usize) -> Result<NonNull<u8>, AllocFailure> {
        let total = size + BLOCK_HEADER_SIZE;

        unsafe {
            let Some(addr) = kernel::map(total) else {
                warn!("buddy allocator: anonymous mapping of {} bytes refused", total);
                return Err(AllocFailure::MapFailed);
            };

            let header = addr.as_ptr().cast::<BlockHeader>();
            header.write(BlockHeader {
                cookie: COOKIE,
                size: size as u32,
                is_free: false,
                kind: BlockKind::Mapped,
                next: None,
                prev: None,
            });
            let block = NonNull::new_unchecked(header);

            let mapped = self.lists.mapped_mut();
            mapped.register(size);
            mapped.insert(block);

            Ok(BlockHeader::payload(block))
        }
    }

    unsafe fn release(&mut self, ptr: *mut u8) -> Result<(), AllocFailure> {
        unsafe {
            let Some(mut block) = BlockHeader::from_payload(ptr) else {
                warn!("buddy allocator: ignoring foreign pointer {:p}", ptr);
                return Err(AllocFailure::ForeignPointer);
            };

            if block.as_ref().is_free {
                return Err(AllocFailure::DoubleFree);
            }

            match block.as_ref().kind {
                BlockKind::Mapped => {
                    // Unlink and unregister while the header is still
                    // ours, then give the whole mapping back.
                    let len = block.as_ref().footprint();
                    let size = block.as_ref().payload_size();

                    self.lists.mapped_mut().remove(block);
                    self.lists.mapped_mut().unregister(size);
                    kernel::unmap(block.as_ptr().cast::<u8>(), len);
                }
                BlockKind::Buddy { order } => {
                    block.as_mut().is_free = true;
                    self.lists.order_mut(order as usize).insert(block);
                    self.coalesce(block, order as usize);
                }
            }

            Ok(())
        }
    }

    /// Repeatedly merges `block` with its buddy while the buddy is a
    /// free arena block of the same order. `block` must be free and on
    /// its order's list; the merged result ends up the same way.
    unsafe fn coalesce(&mut self, mut block: NonNull<BlockHeader>, mut order: usize) {
        unsafe {
            while order < MAX_ORDER {
                let Some(buddy) = self.arena.buddy_of(block) else {
                    break;
                };

                {
                    let buddy = buddy.as_ref();
                    if !buddy.has_cookie()
                        || !buddy.is_free
                        || buddy.kind != (BlockKind::Buddy { order: order as u8 })
                    {
                        break;
                    }
                }

                let level = self.lists.order_mut(order);
                level.remove(block);
                level.remove(buddy);
                level.unregister(payload_of(order));
                level.unregister(payload_of(order));

                let mut low = if (buddy.as_ptr() as usize) < (block.as_ptr() as usize) {
                    buddy
                } else {
                    block
                };

                let merged = order + 1;
                low.as_mut().kind = BlockKind::Buddy {
                    order: merged as u8,
                };
                low.as_mut().size = payload_of(merged) as u32;

                let upper = self.lists.order_mut(merged);
                upper.register(payload_of(merged));
                upper.insert(low);

                block = low;
                order = merged;
            }
        }
    }

    unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocFailure> {
        unsafe {
            let Some(block) = BlockHeader::from_payload(ptr) else {
                return Err(AllocFailure::ForeignPointer);
            };

            // Already big enough, nothing to do.
            if block.as_ref().payload_size() >= new_size {
                return Ok(NonNull::new_unchecked(ptr));
            }

            if let BlockKind::Buddy { order } = block.as_ref().kind {
                if new_size + BLOCK_HEADER_SIZE <= MAX_BLOCK_SIZE {
                    if let Some(grown) = self.grow_in_place(block, order as usize, new_size) {
                        return Ok(BlockHeader::payload(grown));
                    }
                }
            }

            // Fall back to move: allocate, copy, free the old block.
            let old_size = block.as_ref().payload_size();
            let new_payload = self.allocate(new_size)?;
            ptr::copy(ptr, new_payload.as_ptr(), old_size.min(new_size));
            let _ = self.release(ptr);

            Ok(new_payload)
        }
    }

    /// Tries to grow a live buddy block by absorbing free buddies
    /// upward until the payload fits `new_size`. A non-mutating walk
    /// first checks that the whole chain of merges is available; only
    /// then does anything move. The payload ends up at the retained
    /// low-address block.
    unsafe fn grow_in_place(
        &mut self,
        block: NonNull<BlockHeader>,
        order: usize,
        new_size: usize,
    ) -> Option<NonNull<BlockHeader>> {
        unsafe {
            // Feasibility walk over prospective merge partners.
            let mut addr = block.as_ptr() as usize;
            let mut probe = order;

            while payload_of(probe) < new_size {
                if probe >= MAX_ORDER {
                    return None;
                }

                let buddy_addr = self.arena.buddy_addr(addr, probe)?;
                let buddy = &*(buddy_addr as *const BlockHeader);

                if !buddy.has_cookie()
                    || !buddy.is_free
                    || buddy.kind != (BlockKind::Buddy { order: probe as u8 })
                {
                    return None;
                }

                addr = addr.min(buddy_addr);
                probe += 1;
            }

            // Every merge partner is there; commit. The walk above and
            // this loop visit the same buddies in the same sequence.
            let data_len = block.as_ref().payload_size();
            let mut current = block;
            let mut order = order;

            while payload_of(order) < new_size {
                let buddy_addr = self.arena.buddy_addr(current.as_ptr() as usize, order)?;
                let buddy = NonNull::new_unchecked(buddy_addr as *mut BlockHeader);

                let level = self.lists.order_mut(order);
                level.remove(buddy);
                level.unregister(payload_of(order));
                level.unregister(payload_of(order));

                let mut low = if buddy_addr < current.as_ptr() as usize {
                    buddy
                } else {
                    current
                };
                let merged = order + 1;

                if low != current {
                    // The payload lives in the high half; carry it down
                    // to the block we keep.
                    ptr::copy(
                        BlockHeader::payload(current).as_ptr(),
                        low.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE),
                        data_len,
                    );
                }

                low.as_mut().cookie = COOKIE;
                low.as_mut().kind = BlockKind::Buddy {
                    order: merged as u8,
                };
                low.as_mut().size = payload_of(merged) as u32;
                low.as_mut().is_free = false;
                low.as_mut().next = None;
                low.as_mut().prev = None;

                self.lists.order_mut(merged).register(payload_of(merged));

                current = low;
                order = merged;
            }

            Some(current)
        }
    }

    fn recount(&self) -> AllocCounters {
        let mut totals = AllocCounters::new();

        unsafe {
            self.arena.for_each_block(|block| {
                totals.allocated_blocks += 1;
                totals.allocated_bytes += block.payload_size() as u64;
                totals.metadata_bytes += BLOCK_HEADER_SIZE as u64;

                if block.is_free {
                    totals.free_blocks += 1;
                    totals.free_bytes += block.payload_size() as u64;
                }
            });

            let mut current = self.lists.mapped().first();
            while let Some(node) = current {
                let block = node.as_ref();

                totals.allocated_blocks += 1;
                totals.allocated_bytes += block.payload_size() as u64;
                totals.metadata_bytes += BLOCK_HEADER_SIZE as u64;

                current = block.next;
            }
        }

        totals
    }

    fn verify_integrity(&self) -> bool {
        unsafe {
            let base = self.arena.base() as usize;
            let end = base + ARENA_SIZE;

            let mut addr = base;
            let mut prev: Option<(usize, usize, bool)> = None;
            let mut free_by_order = [0usize; ORDER_COUNT];

            while addr < end {
                let block = &*(addr as *const BlockHeader);

                if !block.has_cookie() {
                    return false;
                }

                let Some(order) = block.order() else {
                    return false;
                };

                let footprint = footprint_of(order);
                if block.footprint() != footprint || (addr - base) % footprint != 0 {
                    return false;
                }

                if block.is_free {
                    free_by_order[order] += 1;
                }

                // Two free buddies of equal order must never coexist;
                // they would be adjacent, so checking the previous
                // block catches every pair.
                if let Some((prev_addr, prev_order, prev_free)) = prev {
                    if prev_free
                        && block.is_free
                        && prev_order == order
                        && self.arena.buddy_addr(prev_addr, prev_order) == Some(addr)
                    {
                        return false;
                    }
                }

                prev = Some((addr, order, block.is_free));
                addr += footprint;
            }

            if addr != end {
                return false;
            }

            // The free blocks found by the walk must be exactly the
            // ones linked into the lists.
            for (order, &count) in free_by_order.iter().enumerate() {
                if self.lists.order(order).len() != count {
                    return false;
                }
            }

            // Every block on the mapped list must be a live mapped
            // block of ours, living outside the arena.
            let mut current = self.lists.mapped().first();
            while let Some(node) = current {
                let block = node.as_ref();

                if !block.has_cookie()
                    || block.kind != BlockKind::Mapped
                    || block.is_free
                    || self.arena.contains(node.as_ptr().cast::<u8>())
                {
                    return false;
                }

                current = block.next;
            }

            true
        }
    }
}
