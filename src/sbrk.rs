use std::ptr::NonNull;

use crate::{align, block::ALIGNMENT, platform, Pointer};

/// Boundary to the external heap growth primitive. The heap calls this to
/// obtain more managed space; everything about block formatting happens on
/// the other side of this trait.
pub trait GrowHeap {
    /// Extends the managed region by `bytes` and returns the address of the
    /// start of the new space, or `None` when the primitive is exhausted.
    /// Growth is strictly monotonic and the returned address continues the
    /// region exactly where the previous call left off, 16 byte aligned.
    ///
    /// # Safety
    ///
    /// On success the returned address must be valid for writes of `bytes`
    /// bytes. A failed call must leave the region untouched.
    unsafe fn grow(&mut self, bytes: usize) -> Pointer<u8>;
}

/// Virtual address space reserved by [`Sbrk`] unless configured otherwise.
/// Anonymous pages are lazily committed, so the reservation itself consumes
/// no physical memory.
const DEFAULT_RESERVATION: usize = 64 * 1024 * 1024;

/// Production implementation of [`GrowHeap`]: reserves one contiguous span
/// of virtual memory on first use and hands out monotonically increasing
/// chunks of it, the same way a program break moves. The span is returned to
/// the kernel on drop.
pub struct Sbrk {
    /// Start of the reserved span. `None` until the first growth request.
    base: Pointer<u8>,
    /// Bytes handed out so far.
    brk: usize,
    /// Total size of the reservation.
    reservation: usize,
}

impl Sbrk {
    pub const fn new() -> Self {
        Self::with_reservation(DEFAULT_RESERVATION)
    }

    /// Caps the managed region at `bytes`. Mostly useful for exercising
    /// exhaustion, since growth fails once the reservation is used up.
    pub const fn with_reservation(bytes: usize) -> Self {
        Self {
            base: None,
            brk: 0,
            reservation: bytes,
        }
    }
}

impl Default for Sbrk {
    fn default() -> Self {
        Self::new()
    }
}

impl GrowHeap for Sbrk {
    unsafe fn grow(&mut self, bytes: usize) -> Pointer<u8> {
        let bytes = align::checked_round_up(bytes, ALIGNMENT)?;

        let base = match self.base {
            Some(base) => base,
            None => {
                let base = platform::reserve(self.reservation)?;
                self.base = Some(base);
                base
            }
        };

        if bytes > self.reservation - self.brk {
            return None;
        }

        let address = NonNull::new_unchecked(base.as_ptr().add(self.brk));
        self.brk += bytes;

        Some(address)
    }
}

impl Drop for Sbrk {
    fn drop(&mut self) {
        if let Some(base) = self.base {
            unsafe { platform::release(base, self.reservation) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_is_monotonic_and_aligned() {
        let mut sbrk = Sbrk::with_reservation(4096);
        unsafe {
            let first = sbrk.grow(16).unwrap();
            let second = sbrk.grow(24).unwrap();
            let third = sbrk.grow(32).unwrap();

            assert_eq!(first.as_ptr() as usize % ALIGNMENT, 0);
            // 24 rounds up to 32.
            assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 16);
            assert_eq!(third.as_ptr() as usize, second.as_ptr() as usize + 32);
        }
    }

    #[test]
    fn exhaustion_leaves_the_break_untouched() {
        let mut sbrk = Sbrk::with_reservation(64);
        unsafe {
            let first = sbrk.grow(32).unwrap();
            assert!(sbrk.grow(48).is_none());

            // The failed request must not consume any of the reservation.
            let second = sbrk.grow(32).unwrap();
            assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 32);
            assert!(sbrk.grow(16).is_none());

            // Requests whose rounding would wrap fail the same way.
            assert!(sbrk.grow(usize::MAX).is_none());
        }
    }
}
