use std::ptr::NonNull;

use crate::{block::Block, header::Word};

/// Number of segregated free lists.
pub(crate) const LIST_COUNT: usize = 15;

/// Classes below this index hold blocks of exactly one size (16, 32, 48 and
/// 64 bytes); classes from here on hold power of two ranges.
pub(crate) const FIXED_CLASSES: usize = 4;

/// When a block is free we reuse its payload to store the list links, so
/// membership costs no memory at all. Class 0 (16 byte blocks) only has room
/// for one word of payload, hence one link:
///
/// ```text
/// +----------+----------+
/// |  header  |   next   |   singly linked circular list
/// +----------+----------+
/// ```
///
/// Every other class stores both links:
///
/// ```text
/// +----------+----------+----------+---------+----------+
/// |  header  |   next   |   prev   |   ...   |  footer  |
/// +----------+----------+----------+---------+----------+
/// ```
///
/// Dropping the `prev` link (and the footer, see [`crate::block`]) for the
/// single most common allocation size trades a rare O(n) removal in class 0
/// for 16 bytes saved on every such block. The links point at block headers
/// and are valid only while the block is free.
impl Block {
    /// Next block in this block's free list.
    #[inline]
    pub unsafe fn next_free(self) -> Block {
        let address = self.payload_address().cast::<Word>().as_ptr().read();
        Block::from_header_address(NonNull::new_unchecked(address as *mut u8))
    }

    #[inline]
    pub unsafe fn set_next_free(self, next: Block) {
        let link = next.header_address().as_ptr() as Word;
        self.payload_address().cast::<Word>().as_ptr().write(link);
    }

    /// Previous block in this block's free list. Only blocks of size >= 32
    /// store this link; class 0 never reads it.
    #[inline]
    pub unsafe fn prev_free(self) -> Block {
        let address = self.payload_address().cast::<Word>().as_ptr().add(1).read();
        Block::from_header_address(NonNull::new_unchecked(address as *mut u8))
    }

    #[inline]
    pub unsafe fn set_prev_free(self, prev: Block) {
        let link = prev.header_address().as_ptr() as Word;
        self.payload_address()
            .cast::<Word>()
            .as_ptr()
            .add(1)
            .write(link);
    }
}

/// The 15 list roots. Each root is either empty or points at one member of
/// its circular list; a free block appears in exactly one list, the one
/// matching its size class.
pub(crate) struct FreeListTable {
    roots: [Option<Block>; LIST_COUNT],
}

impl FreeListTable {
    pub const fn new() -> Self {
        Self {
            roots: [None; LIST_COUNT],
        }
    }

    /// Maps a block size to its list index. Exact match for the four fixed
    /// sizes, then the smallest power of two bucket that holds the size,
    /// capped at the top class for anything above 64 KiB.
    pub fn class_of(size: usize) -> usize {
        match size {
            16 => 0,
            32 => 1,
            48 => 2,
            64 => 3,
            s if s <= 128 => 4,
            s if s <= 256 => 5,
            s if s <= 512 => 6,
            s if s <= 1024 => 7,
            s if s <= 2048 => 8,
            s if s <= 4096 => 9,
            s if s <= 8192 => 10,
            s if s <= 16384 => 11,
            s if s <= 32768 => 12,
            s if s <= 65536 => 13,
            _ => 14,
        }
    }

    #[inline]
    pub fn root(&self, class: usize) -> Option<Block> {
        self.roots[class]
    }

    /// Inserts a free block at the front of the list matching its current
    /// size, making it the new root. O(1) for every class.
    ///
    /// # Safety
    ///
    /// `block` must be a valid free block that is not already in any list.
    pub unsafe fn insert(&mut self, block: Block) {
        let class = Self::class_of(block.size());

        if class == 0 {
            match self.roots[0] {
                None => block.set_next_free(block),
                Some(root) => {
                    block.set_next_free(root.next_free());
                    root.set_next_free(block);
                }
            }
            self.roots[0] = Some(block);
            return;
        }

        match self.roots[class] {
            None => {
                block.set_next_free(block);
                block.set_prev_free(block);
            }
            Some(root) => {
                let tail = root.prev_free();
                tail.set_next_free(block);
                block.set_prev_free(tail);
                block.set_next_free(root);
                root.set_prev_free(block);
            }
        }
        self.roots[class] = Some(block);
    }

    /// Unlinks a block from the list matching its current size. O(1) for
    /// classes with a `prev` link; class 0 has to scan from the root to find
    /// the predecessor.
    ///
    /// # Safety
    ///
    /// `block` must currently be a member of its list, which is an internal
    /// invariant of the allocator.
    pub unsafe fn remove(&mut self, block: Block) {
        let class = Self::class_of(block.size());

        if class == 0 {
            if block.next_free() == block {
                self.roots[0] = None;
                return;
            }
            let mut prev = self.roots[0].unwrap();
            while prev.next_free() != block {
                prev = prev.next_free();
            }
            prev.set_next_free(block.next_free());
            if self.roots[0] == Some(block) {
                self.roots[0] = Some(block.next_free());
            }
            return;
        }

        if block.next_free() == block {
            self.roots[class] = None;
            return;
        }

        let prev = block.prev_free();
        let next = block.next_free();
        prev.set_next_free(next);
        next.set_prev_free(prev);
        if self.roots[class] == Some(block) {
            self.roots[class] = Some(next);
        }
    }
}
