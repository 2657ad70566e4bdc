use std::{cmp, ptr::NonNull};

use log::debug;

use crate::{
    align,
    block::{Block, ALIGNMENT, MIN_BLOCK_SIZE},
    freelist::{FreeListTable, FIXED_CLASSES, LIST_COUNT},
    header::{BlockHeader, Word, WORD_SIZE},
    sbrk::{GrowHeap, Sbrk},
    Pointer,
};

/// Granularity of heap growth. Any allocation that misses the free lists
/// extends the heap by at least this much.
pub(crate) const CHUNK_SIZE: usize = 4096;

/// Combined number of fitting candidates the better-fit search examines
/// across all scanned classes before settling for the best one seen.
const SEARCH_DEPTH: usize = 10;

/// The allocator context: one growable heap region plus the segregated free
/// list roots. All public operations take `&mut self` and run to completion;
/// the type is deliberately single threaded, callers that need sharing wrap
/// it in a lock (see [`crate::Segalloc`]).
///
/// The region is bounded by two sentinels. A zero size allocated footer (the
/// prologue) sits below the first block so that backward navigation never
/// walks off the start, and a zero size allocated header (the epilogue)
/// marks the end. The epilogue is relocated every time the heap grows, its
/// old header word becoming the header of the newly formatted block:
///
/// ```text
/// +----------+----------+---------------------+----------+
/// | prologue |  block   |  block   ...  block | epilogue |
/// |  footer  |          |                     |  header  |
/// +----------+----------+---------------------+----------+
/// start      start+8                                 heap end
/// ```
///
/// The heap starts empty and formats itself on the first allocation.
pub struct Heap<G: GrowHeap = Sbrk> {
    /// External growth primitive.
    source: G,
    /// Segregated free list roots.
    pub(crate) free_lists: FreeListTable,
    /// First block position, right after the prologue footer. `None` until
    /// the first allocation initializes the heap.
    pub(crate) first_block: Option<Block>,
    /// Address of the prologue footer.
    pub(crate) heap_start: Pointer<u8>,
    /// One past the epilogue header.
    pub(crate) heap_end: Pointer<u8>,
}

impl Heap<Sbrk> {
    /// Heap backed by the default [`Sbrk`] reservation. No memory is
    /// requested until the first allocation.
    pub const fn new() -> Self {
        Self::with_source(Sbrk::new())
    }
}

impl Default for Heap<Sbrk> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: GrowHeap> Heap<G> {
    /// Heap backed by the given growth primitive.
    pub const fn with_source(source: G) -> Self {
        Self {
            source,
            free_lists: FreeListTable::new(),
            first_block: None,
            heap_start: None,
            heap_end: None,
        }
    }

    /// Bytes currently under management, sentinels included. Zero before the
    /// first allocation.
    pub fn managed_bytes(&self) -> usize {
        match (self.heap_start, self.heap_end) {
            (Some(start), Some(end)) => end.as_ptr() as usize - start.as_ptr() as usize,
            _ => 0,
        }
    }

    /// Allocates a region of at least `size` bytes, 16 byte aligned.
    /// Requests of size 0 return no region, as does heap exhaustion; in the
    /// latter case the heap is left exactly as it was.
    ///
    /// # Safety
    ///
    /// The returned region is valid until passed to [`Heap::release`] or
    /// [`Heap::reallocate`]. The caller must not touch memory outside it.
    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        // Room for the header, rounded up to the block granularity. This is
        // never below the minimum block size. Sizes so large that the
        // rounding would wrap around can never be satisfied.
        let asize = align::checked_round_up(size.checked_add(WORD_SIZE)?, ALIGNMENT)?;

        if self.first_block.is_none() {
            self.init()?;
        }

        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => self.extend(cmp::max(asize, CHUNK_SIZE))?,
        };

        self.free_lists.remove(block);
        self.place(block, asize);

        Some(block.payload_address())
    }

    /// Releases a previously allocated region. A `None` region is a no-op.
    ///
    /// # Safety
    ///
    /// `region` must have been returned by this heap's allocate or
    /// reallocate and not released since.
    pub unsafe fn release(&mut self, region: Pointer<u8>) {
        let Some(address) = region else {
            return;
        };

        let block = Block::from_payload_address(address);
        let header = block.read();
        block.write(BlockHeader {
            allocated: false,
            ..header
        });
        block.write_footer();

        let block = self.coalesce(block);

        // The merged block's successor needs to know its new predecessor
        // status: free, and possibly of minimum size.
        let next = block.next();
        next.set_prev_allocated(false);
        next.set_prev_min(block.size() == MIN_BLOCK_SIZE);
    }

    /// Reallocates `region` to hold at least `size` bytes, preserving the
    /// first `min(old payload size, size)` bytes of content. Size 0 behaves
    /// as release and returns no region; a `None` region behaves as
    /// allocate. The block is never grown in place: a new region is
    /// allocated, content copied, and the old region released. If the
    /// allocation fails the original region is left untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::release`] for non-`None` regions.
    pub unsafe fn reallocate(&mut self, region: Pointer<u8>, size: usize) -> Pointer<u8> {
        if size == 0 {
            self.release(region);
            return None;
        }

        let Some(address) = region else {
            return self.allocate(size);
        };

        let new_address = self.allocate(size)?;

        let block = Block::from_payload_address(address);
        let count = cmp::min(block.size() - WORD_SIZE, size);
        std::ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), count);

        self.release(Some(address));

        Some(new_address)
    }

    /// Allocates a zero filled region for `count` elements of `size` bytes.
    /// Returns no region if `count * size` overflows.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::allocate`].
    pub unsafe fn zero_allocate(&mut self, count: usize, size: usize) -> Pointer<u8> {
        let total = count.checked_mul(size)?;
        let address = self.allocate(total)?;
        address.as_ptr().write_bytes(0, total);

        Some(address)
    }

    /// Formats the empty heap: prologue footer, epilogue header, then one
    /// chunk of free space. The heap only becomes managed once all of that
    /// succeeds, so a failed first allocation leaves it empty.
    unsafe fn init(&mut self) -> Option<()> {
        let start = self.source.grow(2 * WORD_SIZE)?;

        // The prologue footer simulates the end of an allocated block so
        // that the first real block never tries to merge backwards.
        let sentinel = BlockHeader {
            size: 0,
            allocated: true,
            prev_allocated: true,
            prev_min: false,
        };
        start.cast::<Word>().as_ptr().write(sentinel.encode());

        let epilogue =
            Block::from_header_address(NonNull::new_unchecked(start.as_ptr().add(WORD_SIZE)));
        epilogue.write(sentinel);

        self.extend(CHUNK_SIZE)?;

        self.heap_start = Some(start);
        self.first_block = Some(epilogue);

        debug!("heap initialized at {:p}", start.as_ptr());

        Some(())
    }

    /// Grows the heap and formats the new space as one free block, folding
    /// it into whatever free block previously abutted the epilogue. Returns
    /// the resulting block, already inserted in its free list, or `None`
    /// when the growth primitive is exhausted.
    unsafe fn extend(&mut self, bytes: usize) -> Option<Block> {
        let bytes = align::round_up(bytes, ALIGNMENT);
        let address = self.source.grow(bytes)?;

        debug!("extending heap by {bytes} bytes");

        // The old epilogue header becomes the header of the new block, so
        // its predecessor status bits carry over as-is.
        let block = Block::from_payload_address(address);
        let header = block.read();
        block.write(BlockHeader {
            size: bytes,
            allocated: false,
            ..header
        });
        block.write_footer();

        let epilogue = block.next();
        epilogue.write(BlockHeader {
            size: 0,
            allocated: true,
            prev_allocated: false,
            prev_min: false,
        });

        self.heap_end = Some(NonNull::new_unchecked(
            epilogue.header_address().as_ptr().add(WORD_SIZE),
        ));

        Some(self.coalesce(block))
    }

    /// Better-fit search with a bounded depth. Scans list roots upward from
    /// the class matching `asize`, tracking the smallest fitting candidate
    /// seen across all scanned lists, and gives up improving once
    /// [`SEARCH_DEPTH`] candidates have been examined. Requests in the fixed
    /// size classes take the first fit found at a root immediately, since
    /// members of those lists are all equally good.
    unsafe fn find_fit(&self, asize: usize) -> Option<Block> {
        let min_class = FreeListTable::class_of(asize);
        let mut budget = SEARCH_DEPTH;
        let mut best: Option<Block> = None;

        for class in min_class..LIST_COUNT {
            let Some(root) = self.free_lists.root(class) else {
                continue;
            };

            if root.size() >= asize {
                budget -= 1;
                if best.map_or(true, |found| root.size() < found.size()) {
                    best = Some(root);
                    if min_class < FIXED_CLASSES {
                        return best;
                    }
                }
                if budget == 0 {
                    return best;
                }
            }

            let mut block = root.next_free();
            while block != root {
                if block.size() >= asize {
                    budget -= 1;
                    if best.map_or(true, |found| block.size() < found.size()) {
                        best = Some(block);
                    }
                    if budget == 0 {
                        return best;
                    }
                }
                block = block.next_free();
            }
        }

        best
    }

    /// Marks `asize` bytes of `block` as allocated. If the leftover can hold
    /// at least a minimum block it becomes a new free block, folded through
    /// coalescing since it may merge with the physical successor; otherwise
    /// the whole block is taken. Either way the successor's predecessor
    /// status bits are brought up to date.
    ///
    /// `block` must be free, removed from its list, and at least `asize`
    /// bytes large.
    unsafe fn place(&mut self, block: Block, asize: usize) {
        let csize = block.size();
        let header = block.read();

        if csize - asize >= MIN_BLOCK_SIZE {
            block.write(BlockHeader {
                size: asize,
                allocated: true,
                ..header
            });

            let rest = block.next();
            rest.write(BlockHeader {
                size: csize - asize,
                allocated: false,
                prev_allocated: true,
                prev_min: asize == MIN_BLOCK_SIZE,
            });
            rest.write_footer();

            let rest = self.coalesce(rest);
            rest.next().set_prev_min(rest.size() == MIN_BLOCK_SIZE);
        } else {
            block.write(BlockHeader {
                allocated: true,
                ..header
            });
            block.next().set_prev_allocated(true);
        }
    }

    /// Merges a free block with its free physical neighbors, if any, and
    /// inserts the result into the matching free list. Neighbor status is
    /// read from header bits, never from the lists. Returns the resulting
    /// block, whose canonical position is the predecessor's start address
    /// when the predecessor was absorbed. Afterwards both immediate
    /// neighbors of the result are guaranteed allocated.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let next = block.next();
        let next_allocated = next.is_allocated();
        let prev_allocated = block.prev_allocated();
        let mut size = block.size();

        if prev_allocated && next_allocated {
            self.free_lists.insert(block);
            return block;
        }

        if prev_allocated && !next_allocated {
            self.free_lists.remove(next);
            size += next.size();

            let header = block.read();
            block.write(BlockHeader {
                size,
                allocated: false,
                ..header
            });
            block.write_footer();

            self.free_lists.insert(block);
            return block;
        }

        let prev = block.prev();

        if !prev_allocated && next_allocated {
            self.free_lists.remove(prev);
            size += prev.size();
        } else {
            self.free_lists.remove(prev);
            self.free_lists.remove(next);
            size += prev.size() + next.size();
        }

        let header = prev.read();
        prev.write(BlockHeader {
            size,
            allocated: false,
            ..header
        });
        prev.write_footer();

        self.free_lists.insert(prev);
        prev
    }

    /// Sizes of free blocks in physical heap order. Test-only helper for
    /// asserting coalescing results.
    #[cfg(test)]
    pub(crate) unsafe fn physical_free_blocks(&self) -> Vec<usize> {
        let mut sizes = Vec::new();
        let Some(first) = self.first_block else {
            return sizes;
        };

        let mut block = first;
        while block.size() != 0 {
            if !block.is_allocated() {
                sizes.push(block.size());
            }
            block = block.next();
        }

        sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_with(reservation: usize) -> Heap<Sbrk> {
        Heap::with_source(Sbrk::with_reservation(reservation))
    }

    #[test]
    fn zero_sized_request_returns_no_region() {
        let mut heap = Heap::new();
        unsafe {
            assert!(heap.allocate(0).is_none());
        }
        // Nothing was requested from the kernel either.
        assert_eq!(heap.managed_bytes(), 0);
    }

    #[test]
    fn basic_allocation_round_trip() {
        let mut heap = Heap::new();
        unsafe {
            let first = heap.allocate(100).unwrap();
            assert!(heap.check_consistency("first allocation"));

            for i in 0..100 {
                first.as_ptr().add(i).write((i % 256) as u8);
            }

            let second = heap.allocate(1).unwrap();
            assert!(heap.check_consistency("second allocation"));

            second.as_ptr().write(69);

            // No corruption across blocks.
            for i in 0..100 {
                assert_eq!(first.as_ptr().add(i).read(), (i % 256) as u8);
            }
            assert_eq!(second.as_ptr().read(), 69);

            heap.release(Some(first));
            assert!(heap.check_consistency("first release"));
            heap.release(Some(second));
            assert!(heap.check_consistency("second release"));

            // Everything merged back into the initial chunk.
            assert_eq!(heap.physical_free_blocks(), vec![CHUNK_SIZE]);
        }
    }

    #[test]
    fn payloads_are_sixteen_byte_aligned() {
        let mut heap = Heap::new();
        unsafe {
            for size in [1, 8, 16, 17, 100, 1000] {
                let address = heap.allocate(size).unwrap();
                assert_eq!(address.as_ptr() as usize % ALIGNMENT, 0);
            }
            assert!(heap.check_consistency("alignment run"));
        }
    }

    #[test]
    fn releasing_null_region_is_a_no_op() {
        let mut heap = Heap::new();
        unsafe {
            heap.release(None);
            assert_eq!(heap.managed_bytes(), 0);

            let address = heap.allocate(32).unwrap();
            heap.release(None);
            assert!(heap.check_consistency("null release"));
            heap.release(Some(address));
        }
    }

    #[test]
    fn released_block_is_reused_without_growth() {
        let mut heap = Heap::new();
        unsafe {
            let a = heap.allocate(16).unwrap();
            let b = heap.allocate(32).unwrap();
            let c = heap.allocate(16).unwrap();
            assert!(heap.check_consistency("a b c allocated"));

            let managed = heap.managed_bytes();

            heap.release(Some(b));
            assert!(heap.check_consistency("b released"));

            // The new allocation fits in b's slot, so the heap must reuse it
            // instead of growing.
            let reused = heap.allocate(16).unwrap();
            assert_eq!(reused, b);
            assert_eq!(heap.managed_bytes(), managed);
            assert!(heap.check_consistency("b reused"));

            // Releasing everything collapses the heap back into one free
            // region spanning the whole chunk.
            heap.release(Some(a));
            assert!(heap.check_consistency("a released"));
            heap.release(Some(c));
            assert!(heap.check_consistency("c released"));
            heap.release(Some(reused));
            assert!(heap.check_consistency("all released"));

            assert_eq!(heap.physical_free_blocks(), vec![CHUNK_SIZE]);
        }
    }

    #[test]
    fn adjacent_blocks_never_both_free() {
        let mut heap = Heap::new();
        unsafe {
            let regions: Vec<_> = (0..8).map(|_| heap.allocate(48).unwrap()).collect();

            // Release in an interleaved order to exercise all four
            // coalescing cases, checking the heap after each one.
            for index in [1, 3, 5, 7, 0, 2, 4, 6] {
                heap.release(Some(regions[index]));
                assert!(heap.check_consistency("interleaved release"));
            }

            assert_eq!(heap.physical_free_blocks(), vec![CHUNK_SIZE]);
        }
    }

    #[test]
    fn steady_state_cycles_never_grow_the_heap() {
        let mut heap = Heap::new();
        unsafe {
            let address = heap.allocate(4000).unwrap();
            let managed = heap.managed_bytes();
            heap.release(Some(address));

            for _ in 0..50 {
                let address = heap.allocate(4000).unwrap();
                assert!(heap.check_consistency("steady state allocation"));
                heap.release(Some(address));
                assert!(heap.check_consistency("steady state release"));
                assert_eq!(heap.managed_bytes(), managed);
            }
        }
    }

    #[test]
    fn exhaustion_fails_the_request_and_nothing_else() {
        // Room for the sentinels, the initial chunk and little more.
        let mut heap = heap_with(8192);
        unsafe {
            let address = heap.allocate(64).unwrap();
            let managed = heap.managed_bytes();
            let free_before = heap.physical_free_blocks();

            // Far beyond the reservation.
            assert!(heap.allocate(100_000).is_none());

            // The failed request left the heap exactly as it was.
            assert_eq!(heap.managed_bytes(), managed);
            assert_eq!(heap.physical_free_blocks(), free_before);
            assert!(heap.check_consistency("after exhaustion"));

            // And small requests still succeed.
            let small = heap.allocate(128).unwrap();
            assert!(heap.check_consistency("allocation after exhaustion"));

            heap.release(Some(address));
            heap.release(Some(small));
        }
    }

    #[test]
    fn reallocate_preserves_content_prefix() {
        let mut heap = Heap::new();
        unsafe {
            let small = heap.allocate(32).unwrap();
            for i in 0..32 {
                small.as_ptr().add(i).write(i as u8);
            }

            let large = heap.reallocate(Some(small), 256).unwrap();
            assert!(heap.check_consistency("grown"));
            for i in 0..32 {
                assert_eq!(large.as_ptr().add(i).read(), i as u8);
            }

            let shrunk = heap.reallocate(Some(large), 8).unwrap();
            assert!(heap.check_consistency("shrunk"));
            for i in 0..8 {
                assert_eq!(shrunk.as_ptr().add(i).read(), i as u8);
            }

            heap.release(Some(shrunk));
        }
    }

    #[test]
    fn reallocate_boundary_behaviors() {
        let mut heap = Heap::new();
        unsafe {
            // Null region behaves as allocate.
            let address = heap.reallocate(None, 64).unwrap();
            assert!(heap.check_consistency("realloc as allocate"));

            // Size 0 behaves as release and reports no region.
            assert!(heap.reallocate(Some(address), 0).is_none());
            assert!(heap.check_consistency("realloc as release"));
            assert_eq!(heap.physical_free_blocks(), vec![CHUNK_SIZE]);

            // Both at once: still no region, still consistent.
            assert!(heap.reallocate(None, 0).is_none());
        }
    }

    #[test]
    fn zero_allocate_zeroes_and_rejects_overflow() {
        let mut heap = Heap::new();
        unsafe {
            let address = heap.zero_allocate(25, 4).unwrap();
            for i in 0..100 {
                assert_eq!(address.as_ptr().add(i).read(), 0);
            }
            assert!(heap.check_consistency("zero allocate"));

            assert!(heap.zero_allocate(usize::MAX, 2).is_none());
            assert!(heap.zero_allocate(0, 8).is_none());
            assert!(heap.check_consistency("zero allocate boundaries"));

            heap.release(Some(address));
        }
    }

    #[test]
    fn oversized_requests_return_no_region() {
        let mut heap = Heap::new();
        unsafe {
            // Sizes whose header-inclusive rounding would wrap around. They
            // fail before the heap requests any memory at all.
            assert!(heap.allocate(usize::MAX).is_none());
            assert!(heap.allocate(usize::MAX - WORD_SIZE).is_none());
            assert_eq!(heap.managed_bytes(), 0);

            // A failed oversized reallocation leaves the region alone.
            let address = heap.allocate(64).unwrap();
            address.as_ptr().write(69);
            assert!(heap.reallocate(Some(address), usize::MAX).is_none());
            assert_eq!(address.as_ptr().read(), 69);
            assert!(heap.check_consistency("after oversized requests"));

            heap.release(Some(address));
        }
    }

    #[test]
    fn failed_first_allocation_leaves_the_heap_unmanaged() {
        // Room for the sentinels but not for the initial chunk.
        let mut heap = heap_with(1024);
        unsafe {
            assert!(heap.allocate(64).is_none());
            assert_eq!(heap.managed_bytes(), 0);
            assert!(heap.check_consistency("failed initialization"));
        }
    }

    #[test]
    fn large_requests_grow_by_the_requested_amount() {
        let mut heap = Heap::new();
        unsafe {
            let large = heap.allocate(3 * CHUNK_SIZE).unwrap();
            assert!(heap.check_consistency("large allocation"));

            large.as_ptr().write_bytes(42, 3 * CHUNK_SIZE);

            heap.release(Some(large));
            assert!(heap.check_consistency("large release"));

            // Initial chunk merged with the grown space: one free region.
            assert_eq!(heap.physical_free_blocks().len(), 1);
        }
    }
}
