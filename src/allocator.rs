use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{block::ALIGNMENT, heap::Heap, Pointer};

/// Thread safe wrapper around [`Heap`]. The heap itself is single threaded
/// and non-reentrant, so this type serializes every operation behind one
/// global [`Mutex`], which is the simplest policy that makes the contract
/// hold. Callers that stay on one thread can embed [`Heap`] directly and
/// skip the lock.
///
/// # Examples
///
/// ```rust
/// use segalloc::Segalloc;
///
/// let allocator = Segalloc::new();
///
/// let region = allocator.allocate(100).unwrap();
/// // Payloads are always 16 byte aligned.
/// assert_eq!(region.as_ptr() as usize % 16, 0);
///
/// unsafe { allocator.release(Some(region)) };
/// assert!(allocator.check_consistency("example"));
/// ```
///
/// It can also serve as the global allocator, since payload alignment
/// covers every fundamental Rust type:
///
/// ```rust,no_run
/// use segalloc::Segalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Segalloc = Segalloc::new();
///
/// fn main() {
///     let values = vec![1, 2, 3];
///     assert_eq!(values.len(), 3);
/// }
/// ```
pub struct Segalloc {
    heap: Mutex<Heap>,
}

/// The heap is full of raw pointers, which makes the compiler refuse to
/// share this type across threads on its own. The mutex serializes all
/// access, so sharing is sound.
unsafe impl Sync for Segalloc {}

impl Segalloc {
    /// No memory is requested until the first allocation, so this can
    /// initialize a `static`.
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
        }
    }

    /// Allocates a region of at least `size` bytes. Returns `None` for size
    /// 0 and on exhaustion.
    pub fn allocate(&self, size: usize) -> Pointer<u8> {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.allocate(size) },
            Err(_) => None,
        }
    }

    /// Releases a previously allocated region. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `region` must have been returned by this allocator and not released
    /// since.
    pub unsafe fn release(&self, region: Pointer<u8>) {
        if let Ok(mut heap) = self.heap.lock() {
            heap.release(region);
        }
    }

    /// Reallocates `region` to at least `size` bytes. See
    /// [`Heap::reallocate`] for the exact boundary behaviors.
    ///
    /// # Safety
    ///
    /// Same contract as [`Segalloc::release`] for non-`None` regions.
    pub unsafe fn reallocate(&self, region: Pointer<u8>, size: usize) -> Pointer<u8> {
        match self.heap.lock() {
            Ok(mut heap) => heap.reallocate(region, size),
            Err(_) => None,
        }
    }

    /// Allocates a zero filled region for `count` elements of `size` bytes,
    /// returning `None` if the total overflows.
    pub fn zero_allocate(&self, count: usize, size: usize) -> Pointer<u8> {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.zero_allocate(count, size) },
            Err(_) => None,
        }
    }

    /// Runs the full heap verification. `tag` identifies the call site in
    /// the failure report.
    pub fn check_consistency(&self, tag: &str) -> bool {
        match self.heap.lock() {
            Ok(heap) => unsafe { heap.check_consistency(tag) },
            Err(_) => false,
        }
    }
}

impl Default for Segalloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for Segalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Payloads are 16 byte aligned by construction, nothing stricter.
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.allocate(layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.release(NonNull::new(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.reallocate(NonNull::new(ptr), new_size) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.zero_allocate(1, layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}
