use std::ptr::NonNull;

use crate::header::{BlockHeader, Word, WORD_SIZE};

/// Payload addresses handed to callers are aligned to this many bytes, and
/// every block size is a multiple of it.
pub(crate) const ALIGNMENT: usize = 16;

/// Smallest block the heap can represent: one header word plus one word of
/// payload, which is just enough to hold a free list link when the block is
/// free. See [`crate::freelist`].
pub(crate) const MIN_BLOCK_SIZE: usize = 16;

/// Handle to one block of the heap: a non-null pointer to its header word.
/// All physical navigation goes through this type so that allocation policy
/// never touches raw offsets directly.
///
/// An allocated block is a header followed by payload:
///
/// ```text
/// +----------+---------------------------------------+
/// |  header  |                payload                |
/// +----------+---------------------------------------+
/// block      block+8                        block+size
/// ```
///
/// A free block of exactly 16 bytes holds a single link and no footer:
///
/// ```text
/// +----------+----------+
/// |  header  |   next   |
/// +----------+----------+
/// block      block+8    block+16
/// ```
///
/// A free block of 32 bytes or more holds two links and repeats its header
/// word in a footer at the very end, which is what lets a successor navigate
/// backwards without consulting any list:
///
/// ```text
/// +----------+----------+----------+---------+----------+
/// |  header  |   next   |   prev   |   ...   |  footer  |
/// +----------+----------+----------+---------+----------+
/// block      block+8    block+16        block+size-8
/// ```
///
/// The links are meaningful only while the block is free; they are
/// overwritten by caller data the instant the block is allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Block {
    header: NonNull<u8>,
}

impl Block {
    /// Builds a handle from the address of a header word.
    ///
    /// # Safety
    ///
    /// `address` must point at a valid block header within the heap (the
    /// end of heap sentinel counts as one).
    #[inline]
    pub unsafe fn from_header_address(address: NonNull<u8>) -> Self {
        Self { header: address }
    }

    /// Builds a handle from a payload address previously returned to a
    /// caller. The header sits exactly one word below.
    ///
    /// # Safety
    ///
    /// `address` must be the start of a payload area issued by this
    /// allocator, otherwise navigation from the resulting handle is
    /// undefined behaviour.
    #[inline]
    pub unsafe fn from_payload_address(address: NonNull<u8>) -> Self {
        Self {
            header: NonNull::new_unchecked(address.as_ptr().sub(WORD_SIZE)),
        }
    }

    /// Address of the header word.
    #[inline]
    pub fn header_address(self) -> NonNull<u8> {
        self.header
    }

    /// Address of the first payload byte, right after the header.
    #[inline]
    pub unsafe fn payload_address(self) -> NonNull<u8> {
        NonNull::new_unchecked(self.header.as_ptr().add(WORD_SIZE))
    }

    /// Decodes the header word.
    #[inline]
    pub unsafe fn read(self) -> BlockHeader {
        BlockHeader::decode(self.header.cast::<Word>().as_ptr().read())
    }

    /// Encodes and writes the header word.
    #[inline]
    pub unsafe fn write(self, header: BlockHeader) {
        self.header.cast::<Word>().as_ptr().write(header.encode());
    }

    #[inline]
    pub unsafe fn size(self) -> usize {
        self.read().size
    }

    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        self.read().allocated
    }

    #[inline]
    pub unsafe fn prev_allocated(self) -> bool {
        self.read().prev_allocated
    }

    #[inline]
    pub unsafe fn prev_min(self) -> bool {
        self.read().prev_min
    }

    /// Copies the current header word into the footer slot at the last word
    /// of the block. Only meaningful for free blocks of size >= 32; minimum
    /// sized blocks have no room for a footer and rely on the `prev_min` bit
    /// of their successor instead.
    pub unsafe fn write_footer(self) {
        let word = self.header.cast::<Word>().as_ptr().read();
        self.footer_address().cast::<Word>().as_ptr().write(word);
    }

    /// Address of the footer word: one word before the end of the block.
    #[inline]
    pub unsafe fn footer_address(self) -> NonNull<u8> {
        NonNull::new_unchecked(self.header.as_ptr().add(self.size() - WORD_SIZE))
    }

    /// Rewrites the "previous block is allocated" bit without touching the
    /// rest of the header. Called on a block's successor whenever the block
    /// changes allocation status.
    pub unsafe fn set_prev_allocated(self, prev_allocated: bool) {
        let mut header = self.read();
        header.prev_allocated = prev_allocated;
        self.write(header);
    }

    /// Rewrites the "previous block has minimum size" bit. Called on a
    /// block's successor whenever the block changes size.
    pub unsafe fn set_prev_min(self, prev_min: bool) {
        let mut header = self.read();
        header.prev_min = prev_min;
        self.write(header);
    }

    /// Physically adjacent successor, found by skipping over this block's
    /// own size. The end of heap sentinel has size 0, so calling this on it
    /// would loop; the heap walk stops there instead.
    #[inline]
    pub unsafe fn next(self) -> Block {
        Block {
            header: NonNull::new_unchecked(self.header.as_ptr().add(self.size())),
        }
    }

    /// Physically adjacent predecessor. If the predecessor has minimum size
    /// it carries no footer, but the `prev_min` bit tells us it starts
    /// exactly 16 bytes below. Otherwise its footer sits right below our
    /// header and gives us its size.
    ///
    /// # Safety
    ///
    /// The predecessor must be free (allocated blocks write caller data over
    /// the footer slot). The coalescing engine only navigates backwards
    /// after checking the `prev_allocated` bit.
    pub unsafe fn prev(self) -> Block {
        if self.prev_min() {
            return Block {
                header: NonNull::new_unchecked(self.header.as_ptr().sub(MIN_BLOCK_SIZE)),
            };
        }

        let footer = self.header.as_ptr().cast::<Word>().sub(1).read();
        let size = BlockHeader::decode(footer).size;

        Block {
            header: NonNull::new_unchecked(self.header.as_ptr().sub(size)),
        }
    }
}
