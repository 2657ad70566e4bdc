//! Exhaustive heap and free list verification. This walk is O(n) in the
//! number of blocks and meant for tests and debug sessions, never for the
//! allocation fast path. A failure means the allocator itself is broken.

use log::error;

use crate::{
    block::{ALIGNMENT, MIN_BLOCK_SIZE},
    freelist::{FreeListTable, FIXED_CLASSES, LIST_COUNT},
    header::{BlockHeader, Word},
    heap::Heap,
    sbrk::GrowHeap,
};

/// Whether `size` falls within the range declared by `class`.
fn class_holds(class: usize, size: usize) -> bool {
    if class < FIXED_CLASSES {
        return size == MIN_BLOCK_SIZE * (class + 1);
    }
    if class == LIST_COUNT - 1 {
        return size > 1 << (class + 2);
    }
    size > 1 << (class + 2) && size <= 1 << (class + 3)
}

impl<G: GrowHeap> Heap<G> {
    /// Walks every physical block and every free list, verifying all heap
    /// invariants. Returns `false` on the first violation, reporting it
    /// through the log together with `tag` so the failing call site can be
    /// identified.
    ///
    /// # Safety
    ///
    /// No region issued by this heap may be mutated concurrently with the
    /// walk.
    pub unsafe fn check_consistency(&self, tag: &str) -> bool {
        let (Some(first), Some(start), Some(end)) =
            (self.first_block, self.heap_start, self.heap_end)
        else {
            // An uninitialized heap has nothing to violate.
            return true;
        };

        let lo = start.as_ptr() as usize;
        let hi = end.as_ptr() as usize;

        let prologue = BlockHeader::decode(start.cast::<Word>().as_ptr().read());
        if prologue.size != 0 || !prologue.allocated {
            error!("{tag}: corrupt prologue footer");
            return false;
        }

        // Physical walk, from the first block to the epilogue sentinel.
        let mut counts = [0usize; LIST_COUNT];
        let mut block = first;

        while block.size() != 0 {
            let header = block.read();
            let address = block.header_address().as_ptr();

            if block.payload_address().as_ptr() as usize % ALIGNMENT != 0 {
                error!("{tag}: misaligned payload in block at {address:p}");
                return false;
            }

            if header.size % ALIGNMENT != 0 || header.size < MIN_BLOCK_SIZE {
                error!(
                    "{tag}: invalid size {} in block at {address:p}",
                    header.size
                );
                return false;
            }

            let next = block.next();
            if next.header_address().as_ptr() as usize >= hi {
                error!("{tag}: block at {address:p} extends past the end of the heap");
                return false;
            }

            if !header.allocated {
                counts[FreeListTable::class_of(header.size)] += 1;

                if !next.is_allocated() {
                    error!("{tag}: adjacent free blocks at {address:p}, not coalesced");
                    return false;
                }

                // Minimum sized free blocks have no footer to compare.
                if header.size >= 2 * MIN_BLOCK_SIZE {
                    let header_word = block.header_address().cast::<Word>().as_ptr().read();
                    let footer_word = block.footer_address().cast::<Word>().as_ptr().read();
                    if header_word != footer_word {
                        error!("{tag}: footer does not match header in block at {address:p}");
                        return false;
                    }
                }
            }

            if next.prev_allocated() != header.allocated {
                error!("{tag}: stale predecessor allocation bit after block at {address:p}");
                return false;
            }

            if next.prev_min() != (header.size == MIN_BLOCK_SIZE) {
                error!("{tag}: stale predecessor minimum bit after block at {address:p}");
                return false;
            }

            block = next;
        }

        if !block.is_allocated() {
            error!("{tag}: corrupt epilogue header");
            return false;
        }

        // List walk: every class must close on its root after exactly as
        // many steps as the physical walk counted for it.
        for class in 0..LIST_COUNT {
            let Some(root) = self.free_lists.root(class) else {
                if counts[class] != 0 {
                    error!(
                        "{tag}: free list {class} is empty but the heap holds {} such blocks",
                        counts[class]
                    );
                    return false;
                }
                continue;
            };

            let mut walked = 0;
            let mut current = root;

            loop {
                walked += 1;
                if walked > counts[class] {
                    error!("{tag}: free list {class} holds more blocks than exist in the heap");
                    return false;
                }

                let address = current.header_address().as_ptr();

                if current.is_allocated() {
                    error!("{tag}: allocated block at {address:p} linked in free list {class}");
                    return false;
                }

                if (address as usize) < lo || address as usize >= hi {
                    error!("{tag}: free list {class} points outside the heap");
                    return false;
                }

                if !class_holds(class, current.size()) {
                    error!(
                        "{tag}: block of {} bytes at {address:p} filed in class {class}",
                        current.size()
                    );
                    return false;
                }

                if class >= 1
                    && (current.next_free().prev_free() != current
                        || current.prev_free().next_free() != current)
                {
                    error!("{tag}: inconsistent links around block at {address:p} in free list {class}");
                    return false;
                }

                current = current.next_free();
                if current == root {
                    break;
                }
            }

            if walked != counts[class] {
                error!(
                    "{tag}: free list {class} has {walked} blocks, the heap walk found {}",
                    counts[class]
                );
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        header::{Word, WORD_SIZE},
        Heap,
    };

    #[test]
    fn empty_heap_is_consistent() {
        let heap = Heap::new();
        unsafe {
            assert!(heap.check_consistency("empty"));
        }
    }

    #[test]
    fn detects_a_corrupted_header() {
        let mut heap = Heap::new();
        unsafe {
            let first = heap.allocate(24).unwrap();
            let _second = heap.allocate(24).unwrap();
            assert!(heap.check_consistency("healthy"));

            // Flip the allocation bit of the first block behind the heap's
            // back. Its successor's predecessor bit is now stale.
            let header = first.as_ptr().sub(WORD_SIZE).cast::<Word>();
            header.write(header.read() ^ 0x1);
            assert!(!heap.check_consistency("corrupted"));

            header.write(header.read() ^ 0x1);
            assert!(heap.check_consistency("repaired"));
        }
    }

    #[test]
    fn consistent_after_every_operation_in_a_mixed_sequence() {
        let mut heap = Heap::new();
        unsafe {
            let mut live = Vec::new();

            for size in [1, 16, 17, 48, 100, 500, 1000, 4000, 9000] {
                live.push(heap.allocate(size).unwrap());
                assert!(heap.check_consistency("mixed allocate"));
            }

            // Release every other region.
            for index in (0..live.len()).step_by(2).rev() {
                heap.release(Some(live.remove(index)));
                assert!(heap.check_consistency("mixed release"));
            }

            // Reallocate the survivors.
            for region in live.iter_mut() {
                *region = heap.reallocate(Some(*region), 200).unwrap();
                assert!(heap.check_consistency("mixed reallocate"));
            }

            for region in live {
                heap.release(Some(region));
                assert!(heap.check_consistency("mixed final release"));
            }

            assert_eq!(heap.physical_free_blocks().len(), 1);
        }
    }
}
