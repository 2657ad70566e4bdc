use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific virtual memory handling. The heap
/// growth primitive only needs one contiguous span of address space to bump
/// into, it doesn't care about the APIs offered by the underlying kernel.
trait PlatformVirtualMemory {
    /// Reserves a span where `length` bytes can be written safely. The
    /// returned address is page aligned, which more than covers the 16 byte
    /// alignment the heap requires at its base.
    unsafe fn reserve(length: usize) -> Pointer<u8>;

    /// Returns the whole span starting at `address` to the kernel.
    unsafe fn release(address: NonNull<u8>, length: usize);
}

/// Zero sized type that implements [`PlatformVirtualMemory`] for each OS.
struct Platform;

/// Convenience wrapper for [`PlatformVirtualMemory::reserve`].
#[inline]
pub(crate) unsafe fn reserve(length: usize) -> Pointer<u8> {
    Platform::reserve(length)
}

/// Convenience wrapper for [`PlatformVirtualMemory::release`].
#[inline]
pub(crate) unsafe fn release(address: NonNull<u8>, length: usize) {
    Platform::release(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // Read-Write, private to our process and not mapped to any file.
            // Anonymous pages are not committed until touched, so reserving
            // a large span upfront costs nothing.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);

            if address == libc::MAP_FAILED {
                return None;
            }

            Some(NonNull::new_unchecked(address).cast())
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // The span is still mapped. Nothing sensible to do about it
                // at this point, the process is usually exiting anyway.
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // Unlike mmap, memory has to be reserved and then committed to
            // become usable. Both can happen in one single call.
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn release(address: NonNull<u8>, _length: usize) {
            // Length 0 with MEM_RELEASE decommits and releases the whole
            // reservation at once.
            let address = address.cast().as_ptr();

            if Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).is_err() {
                // Same situation as munmap failing on Unix.
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI support, so the global allocator mocks the virtual
    //! memory layer. This also lets Miri catch spans that are never returned.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformVirtualMemory};
    use crate::{block::ALIGNMENT, Pointer};

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, ALIGNMENT).unwrap()
    }

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
