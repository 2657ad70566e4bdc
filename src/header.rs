use std::mem;

/// Boundary tags are stored as one machine word. The same encoding is used
/// for headers and footers.
pub(crate) type Word = usize;

/// Size of a boundary tag in bytes. 8 on 64 bit machines.
pub(crate) const WORD_SIZE: usize = mem::size_of::<Word>();

/// Lowest bit, set when the block itself is allocated.
const ALLOCATED_MASK: Word = 0x1;

/// Second lowest bit, set when the physically previous block is allocated.
const PREV_ALLOCATED_MASK: Word = 0x2;

/// Third lowest bit, set when the physically previous block has exactly the
/// minimum size. Minimum sized free blocks carry no footer, so this bit is
/// the only way a block can locate the start of such a predecessor.
const PREV_MIN_MASK: Word = 0x4;

/// All block sizes are multiples of 16, so the low 4 bits of the size are
/// always zero and can hold the status bits. Masking 4 bits instead of 3
/// costs nothing and keeps the decoded size aligned no matter what.
const SIZE_MASK: Word = !0xF;

/// Decoded form of a boundary tag. This struct is the single place where the
/// bit layout is interpreted; everything else in the crate manipulates sizes
/// and flags through it.
///
/// ```text
///  63                                    4   3    2    1    0
/// +----------------------------------------+----+----+----+----+
/// |          size (multiple of 16)         | 0  | PM | PA | A  |
/// +----------------------------------------+----+----+----+----+
///                                                 |    |    |
///              previous block has minimum size ---+    |    |
///                     previous block is allocated -----+    |
///                               this block is allocated ----+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    /// Block size in bytes, including the header (and footer, if any).
    pub size: usize,
    /// Whether the block is in use by the caller.
    pub allocated: bool,
    /// Allocation status of the physically previous block.
    pub prev_allocated: bool,
    /// Whether the physically previous block is exactly 16 bytes.
    pub prev_min: bool,
}

impl BlockHeader {
    /// Packs the size and status bits into one word.
    pub fn encode(&self) -> Word {
        let mut word = self.size;
        if self.allocated {
            word |= ALLOCATED_MASK;
        }
        if self.prev_allocated {
            word |= PREV_ALLOCATED_MASK;
        }
        if self.prev_min {
            word |= PREV_MIN_MASK;
        }
        word
    }

    /// Inverse of [`BlockHeader::encode`].
    pub fn decode(word: Word) -> Self {
        Self {
            size: word & SIZE_MASK,
            allocated: word & ALLOCATED_MASK != 0,
            prev_allocated: word & PREV_ALLOCATED_MASK != 0,
            prev_min: word & PREV_MIN_MASK != 0,
        }
    }
}
