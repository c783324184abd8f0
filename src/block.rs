use std::{mem, ptr::NonNull};

/// Smallest buddy block footprint, header included.
pub const ORDER_0_SIZE: usize = 128;

/// Highest buddy order. A block of order `k` occupies `ORDER_0_SIZE << k`
/// bytes, so the largest arena block is `ORDER_0_SIZE << MAX_ORDER`.
pub const MAX_ORDER: usize = 10;

/// Footprint of a top-order block (128 KiB). Requests that don't fit in
/// one of these go to the direct-mapping path instead of the arena.
pub const MAX_BLOCK_SIZE: usize = ORDER_0_SIZE << MAX_ORDER;

/// Number of buddy orders, used to size the free-list array.
pub(crate) const ORDER_COUNT: usize = MAX_ORDER + 1;

/// Sentinel written into every header we own. A pointer whose header
/// doesn't carry it is not ours and is silently ignored.
pub(crate) const COOKIE: u32 = 0x1234_5678;

/// Size of the in-memory block header. The user payload starts exactly
/// this many bytes after the block address.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Non-null pointer to a block header, as stored in the intrusive lists.
pub(crate) type Link = Option<NonNull<BlockHeader>>;

/// Where a block's memory came from.
///
/// Arena blocks carry their buddy order; directly-mapped blocks have no
/// order and no buddy. Matching on this tag is how the release and
/// reallocation paths pick their arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    /// Carved out of the arena; footprint is `ORDER_0_SIZE << order`.
    Buddy { order: u8 },
    /// Obtained from the OS mapping facility, returned to it on free.
    Mapped,
}

/// Header placed at the first bytes of every block, buddy and mapped
/// alike. The user payload follows immediately after it:
///
/// ```text
/// +----------------+        +
/// |     cookie     |        |
/// +----------------+        |
/// |      size      |        |
/// +----------------+        | -> Header
/// | is_free | kind |        |
/// +----------------+        |
/// |  next  |  prev |        |
/// +----------------+        +
/// |     Payload    |
/// |                |
/// +----------------+
/// ```
///
/// `size` is the usable payload size in bytes, excluding this header.
/// For a buddy block of order `k` it is always `(ORDER_0_SIZE << k) -
/// BLOCK_HEADER_SIZE`; for a mapped block it is the size the user asked
/// for. `next`/`prev` are the intrusive list links; both are null while
/// the block is on no list.
#[repr(C)]
pub(crate) struct BlockHeader {
    pub cookie: u32,
    pub size: u32,
    pub is_free: bool,
    pub kind: BlockKind,
    pub next: Link,
    pub prev: Link,
}

impl BlockHeader {
    /// Usable payload bytes, excluding the header.
    #[inline]
    pub fn payload_size(&self) -> usize {
        self.size as usize
    }

    /// Total bytes the block occupies, header included.
    #[inline]
    pub fn footprint(&self) -> usize {
        self.size as usize + BLOCK_HEADER_SIZE
    }

    /// Buddy order of an arena block, or `None` for a mapped one.
    #[inline]
    pub fn order(&self) -> Option<usize> {
        match self.kind {
            BlockKind::Buddy { order } => Some(order as usize),
            BlockKind::Mapped => None,
        }
    }

    #[inline]
    pub fn has_cookie(&self) -> bool {
        self.cookie == COOKIE
    }

    /// Address of the payload that follows `block`'s header.
    ///
    /// **SAFETY**: `block` must point to a live header we wrote.
    #[inline]
    pub unsafe fn payload(block: NonNull<BlockHeader>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE)) }
    }

    /// Walks back from a user pointer to the header in front of it and
    /// checks the cookie. Returns `None` for null pointers and for
    /// headers that are not ours.
    ///
    /// **SAFETY**: if `ptr` is non-null, the `BLOCK_HEADER_SIZE` bytes
    /// before it must be readable.
    pub unsafe fn from_payload(ptr: *mut u8) -> Option<NonNull<BlockHeader>> {
        if ptr.is_null() {
            return None;
        }

        unsafe {
            let header = NonNull::new_unchecked(ptr.sub(BLOCK_HEADER_SIZE).cast::<BlockHeader>());

            if header.as_ref().has_cookie() {
                Some(header)
            } else {
                None
            }
        }
    }
}

/// Footprint of a buddy block of the given order, header included.
#[inline]
pub(crate) fn footprint_of(order: usize) -> usize {
    ORDER_0_SIZE << order
}

/// Payload bytes a buddy block of the given order can hand out.
#[inline]
pub(crate) fn payload_of(order: usize) -> usize {
    footprint_of(order) - BLOCK_HEADER_SIZE
}

/// Smallest order whose footprint can hold `total` bytes (header
/// included), or `None` when not even a top-order block is enough.
pub(crate) fn order_for(total: usize) -> Option<usize> {
    let mut order = 0;
    let mut current = ORDER_0_SIZE;

    while order <= MAX_ORDER {
        if current >= total {
            return Some(order);
        }
        current <<= 1;
        order += 1;
    }

    None
}
