use std::ptr::NonNull;

/// This trait provides an abstraction to handle the low level memory
/// operations and syscalls the allocator needs. The buddy logic above
/// it has nothing to do with the concrete APIs offered by each kernel.
pub(crate) trait PlatformMemory {
    /// Reserves `len` bytes of heap memory whose base address is
    /// aligned to `len` itself. Called at most once per allocator, and
    /// the reservation is never given back. Returns `None` if the
    /// underlying syscall fails.
    unsafe fn reserve_arena(len: usize) -> Option<NonNull<u8>>;

    /// Requests an anonymous, private, read-write mapping of `len`
    /// bytes. Returns `None` if the kernel refuses.
    unsafe fn map(len: usize) -> Option<NonNull<u8>>;

    /// Returns a mapping of `len` bytes starting at `addr` back to the
    /// kernel.
    unsafe fn unmap(addr: *mut u8, len: usize);
}

/// Platform-dependant implementation selected by `cfg`.
pub(crate) struct Kernel;

/// Wrapper to use [`Kernel::reserve_arena`].
#[inline]
pub(crate) unsafe fn reserve_arena(len: usize) -> Option<NonNull<u8>> {
    unsafe { Kernel::reserve_arena(len) }
}

/// Wrapper to use [`Kernel::map`].
#[inline]
pub(crate) unsafe fn map(len: usize) -> Option<NonNull<u8>> {
    unsafe { Kernel::map(len) }
}

/// Wrapper to use [`Kernel::unmap`].
#[inline]
pub(crate) unsafe fn unmap(addr: *mut u8, len: usize) {
    unsafe { Kernel::unmap(addr, len) }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};
    use crate::utils::align;

    use libc::{c_int, c_void, intptr_t, off_t, size_t};

    use std::{ptr::NonNull, sync::Mutex};

    /// `sbrk` reports failure with this value, same shape as
    /// `libc::MAP_FAILED`.
    const BREAK_FAILED: *mut c_void = !0 as *mut c_void;

    /// The arena reservation moves the program break twice (once to
    /// align it, once for the arena itself) and those two motions must
    /// be adjacent. Allocators constructed on different threads take
    /// this lock so their break extensions cannot interleave.
    static BREAK_LOCK: Mutex<()> = Mutex::new(());

    impl PlatformMemory for Kernel {
        unsafe fn reserve_arena(len: usize) -> Option<NonNull<u8>> {
            let _guard = match BREAK_LOCK.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            unsafe {
                // The lock keeps our own break motions adjacent, but
                // another allocator in the process can still move the
                // break between the two extensions. Check what we got
                // and retry if someone slipped in.
                for _ in 0..4 {
                    let current = libc::sbrk(0);
                    if current == BREAK_FAILED {
                        return None;
                    }

                    // Pad the break up to the next multiple of `len`,
                    // then claim the arena right behind the padding.
                    let padding = align(current as usize, len) - current as usize;
                    if padding != 0 && libc::sbrk(padding as intptr_t) == BREAK_FAILED {
                        return None;
                    }

                    let base = libc::sbrk(len as intptr_t);
                    if base == BREAK_FAILED {
                        return None;
                    }

                    if base as usize % len == 0 {
                        return Some(NonNull::new_unchecked(base.cast::<u8>()));
                    }
                }

                None
            }
        }

        unsafe fn map(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = libc::mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                if addr == libc::MAP_FAILED {
                    None
                } else {
                    Some(NonNull::new_unchecked(addr).cast::<u8>())
                }
            }
        }

        unsafe fn unmap(addr: *mut u8, len: usize) {
            unsafe {
                libc::munmap(addr as *mut c_void, len as size_t);
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{Kernel, PlatformMemory};
    use crate::utils::align;

    use windows::Win32::System::Memory;

    use std::{os::raw::c_void, ptr::NonNull};

    impl PlatformMemory for Kernel {
        unsafe fn reserve_arena(len: usize) -> Option<NonNull<u8>> {
            // There is no program break to extend on Windows. Reserve
            // twice the arena so an aligned window of `len` bytes is
            // guaranteed to exist inside, then commit only that window.
            unsafe {
                let reserved =
                    Memory::VirtualAlloc(None, len * 2, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);
                if reserved.is_null() {
                    return None;
                }

                let base = align(reserved as usize, len);
                let committed = Memory::VirtualAlloc(
                    Some(base as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                NonNull::new(committed.cast::<u8>())
            }
        }

        unsafe fn map(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    None,
                    len,
                    Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                NonNull::new(addr.cast::<u8>())
            }
        }

        unsafe fn unmap(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }
    }
}
