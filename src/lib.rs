//! Segregated-fit memory allocator. A single contiguous heap region grows
//! monotonically through an external primitive (see [`GrowHeap`]) and gets
//! carved into self-describing blocks delimited by boundary tags. Free blocks
//! are threaded through 15 segregated circular lists whose links live inside
//! the freed memory itself, so the allocator needs no storage of its own
//! beyond the list roots.
//!
//! Suggested reading order for the internals: `header`, `block`, `freelist`,
//! `heap` and finally `allocator`.

use std::ptr::NonNull;

mod align;
mod allocator;
mod block;
mod checker;
mod freelist;
mod header;
mod heap;
mod platform;
mod sbrk;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case. "No region" results from the public operations are exactly this
/// `None`.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::Segalloc;
pub use heap::Heap;
pub use sbrk::{GrowHeap, Sbrk};
