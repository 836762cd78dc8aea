//! Address-space allocators backing the memory pools.
//!
//! The [`PageAllocator`] manages whole chunks of device memory at page
//! granularity; the [`PoolAllocator`] carves pages into power-of-two
//! slots for small allocations. Neither talks to the driver; they only
//! do address bookkeeping, which keeps them trivially testable.
//!
//! Addresses encode the owning chunk in the upper half:
//! `chunk_index << 32 | byte_offset`. Bit 63 tags dedicated allocations
//! that do not belong to any chunk.

use crate::FastHashMap;

/// Page size used for suballocation granularity.
pub const PAGE_SIZE: u64 = 1 << 16;

pub const CHUNK_ADDRESS_BITS: u32 = 32;
pub const CHUNK_ADDRESS_MASK: u64 = (1u64 << CHUNK_ADDRESS_BITS) - 1;

/// Address tag for dedicated device-memory allocations.
pub const DEDICATED_CHUNK_ADDRESS: u64 = 1u64 << 63;

/// Largest chunk the page allocator will manage.
pub const MAX_CHUNK_SIZE: u64 = 256 << 20;

/// Largest allocation serviced by the pool allocator.
pub const POOL_MAX_SIZE: u64 = 32 << 10;
/// Smallest slot size of the pool allocator.
pub const POOL_MIN_SIZE: u64 = 256;

struct ChunkPages {
    page_count: u32,
    pages_used: u32,
    bitmap: Vec<u64>,
}

impl ChunkPages {
    fn new(size: u64) -> Self {
        let page_count = (size / PAGE_SIZE) as u32;
        Self {
            page_count,
            pages_used: 0,
            bitmap: vec![0u64; (page_count as usize + 63) / 64],
        }
    }

    fn is_set(&self, page: u32) -> bool {
        self.bitmap[page as usize / 64] & (1 << (page % 64)) != 0
    }

    fn set_range(&mut self, first: u32, count: u32, set: bool) {
        for page in first..first + count {
            let word = &mut self.bitmap[page as usize / 64];
            let bit = 1u64 << (page % 64);

            debug_assert_eq!(*word & bit != 0, !set);

            if set {
                *word |= bit;
            } else {
                *word &= !bit;
            }
        }

        if set {
            self.pages_used += count;
        } else {
            self.pages_used -= count;
        }
    }

    fn find_free_run(&self, count: u32, align_pages: u32) -> Option<u32> {
        if count > self.page_count {
            return None;
        }

        let mut first = 0u32;

        while first + count <= self.page_count {
            match (first..first + count).find(|&page| self.is_set(page)) {
                None => return Some(first),
                Some(used) => {
                    // Skip past the used page and realign.
                    first = (used + align_pages) / align_pages * align_pages;
                }
            }
        }

        None
    }
}

/// Coarse allocator managing chunks at page granularity.
pub struct PageAllocator {
    chunks: Vec<Option<ChunkPages>>,
}

impl PageAllocator {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    /// Registers a chunk of the given size and returns its index.
    /// Empty slots of previously removed chunks are reused.
    pub fn add_chunk(&mut self, size: u64) -> u32 {
        debug_assert_eq!(size % PAGE_SIZE, 0);
        debug_assert!(size <= MAX_CHUNK_SIZE);

        let pages = ChunkPages::new(size);

        match self.chunks.iter_mut().position(|c| c.is_none()) {
            Some(index) => {
                self.chunks[index] = Some(pages);
                index as u32
            }
            None => {
                self.chunks.push(Some(pages));
                self.chunks.len() as u32 - 1
            }
        }
    }

    /// Unregisters a chunk. The chunk must not have pages in use.
    pub fn remove_chunk(&mut self, chunk: u32) {
        let slot = &mut self.chunks[chunk as usize];
        debug_assert_eq!(slot.as_ref().map_or(0, |c| c.pages_used), 0);
        *slot = None;
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn page_count(&self, chunk: u32) -> u32 {
        self.chunks[chunk as usize]
            .as_ref()
            .map_or(0, |c| c.page_count)
    }

    pub fn pages_used(&self, chunk: u32) -> u32 {
        self.chunks[chunk as usize]
            .as_ref()
            .map_or(0, |c| c.pages_used)
    }

    /// Suballocates from any chunk with enough room.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let count = (crate::align_u64(size, PAGE_SIZE) / PAGE_SIZE) as u32;
        let align_pages = (align.max(PAGE_SIZE) / PAGE_SIZE).max(1) as u32;

        for (index, chunk) in self.chunks.iter_mut().enumerate() {
            let Some(chunk) = chunk else { continue };

            if let Some(first) = chunk.find_free_run(count, align_pages) {
                chunk.set_range(first, count, true);
                return Some(((index as u64) << CHUNK_ADDRESS_BITS) | (first as u64 * PAGE_SIZE));
            }
        }

        None
    }

    /// Releases a range. Returns `true` if the owning chunk is now
    /// completely unused.
    pub fn free(&mut self, address: u64, size: u64) -> bool {
        let chunk_index = (address >> CHUNK_ADDRESS_BITS) as usize;
        let first = ((address & CHUNK_ADDRESS_MASK) / PAGE_SIZE) as u32;
        let count = (crate::align_u64(size, PAGE_SIZE) / PAGE_SIZE) as u32;

        let chunk = self.chunks[chunk_index]
            .as_mut()
            .expect("free on removed chunk");

        chunk.set_range(first, count, false);
        chunk.pages_used == 0
    }

    /// Writes the chunk's page allocation bitmap as packed 32-bit masks.
    pub fn page_allocation_mask(&self, chunk: u32, out: &mut [u32]) {
        let Some(chunk) = self.chunks[chunk as usize].as_ref() else {
            return;
        };

        for (i, mask) in out.iter_mut().enumerate() {
            let word = chunk.bitmap.get(i / 2).copied().unwrap_or(0);
            *mask = (word >> (32 * (i % 2) as u64)) as u32;
        }
    }
}

struct PoolPage {
    free_count: u32,
    bitmap: Vec<u64>,
}

struct SizeClass {
    slot_size: u64,
    pages: FxHashMapPages,
}

type FxHashMapPages = FastHashMap<u64, PoolPage>;

/// Fine-grained allocator servicing sub-page allocations from pages
/// obtained through the page allocator.
pub struct PoolAllocator {
    classes: Vec<SizeClass>,
}

impl PoolAllocator {
    pub fn new() -> Self {
        let mut classes = Vec::new();
        let mut slot_size = POOL_MIN_SIZE;

        while slot_size <= POOL_MAX_SIZE {
            classes.push(SizeClass {
                slot_size,
                pages: FxHashMapPages::default(),
            });
            slot_size *= 2;
        }

        Self { classes }
    }

    fn class_index(&self, size: u64, align: u64) -> usize {
        let slot = size.next_power_of_two().max(align).max(POOL_MIN_SIZE);
        (slot.trailing_zeros() - POOL_MIN_SIZE.trailing_zeros()) as usize
    }

    pub fn alloc(&mut self, pages: &mut PageAllocator, size: u64, align: u64) -> Option<u64> {
        debug_assert!(size <= POOL_MAX_SIZE);

        let class_index = self.class_index(size, align);
        let class = &mut self.classes[class_index];
        let slots_per_page = (PAGE_SIZE / class.slot_size) as u32;

        // Prefer an existing page with free slots.
        let page_address = class
            .pages
            .iter()
            .find(|(_, page)| page.free_count != 0)
            .map(|(&address, _)| address);

        let page_address = match page_address {
            Some(address) => address,
            None => {
                let address = pages.alloc(PAGE_SIZE, PAGE_SIZE)?;
                class.pages.insert(
                    address,
                    PoolPage {
                        free_count: slots_per_page,
                        bitmap: vec![0u64; (slots_per_page as usize + 63) / 64],
                    },
                );
                address
            }
        };

        let page = class.pages.get_mut(&page_address).unwrap();

        let slot = (0..slots_per_page)
            .find(|&slot| page.bitmap[slot as usize / 64] & (1 << (slot % 64)) == 0)
            .expect("pool page with free count but no free slot");

        page.bitmap[slot as usize / 64] |= 1 << (slot % 64);
        page.free_count -= 1;

        Some(page_address + slot as u64 * class.slot_size)
    }

    /// Releases a slot. Returns `true` if freeing the backing page left
    /// the owning chunk completely unused.
    pub fn free(&mut self, pages: &mut PageAllocator, address: u64, size: u64, align: u64) -> bool {
        let class_index = self.class_index(size, align);
        let class = &mut self.classes[class_index];

        let page_address = address & !(PAGE_SIZE - 1);
        let slot = ((address - page_address) / class.slot_size) as u32;
        let slots_per_page = (PAGE_SIZE / class.slot_size) as u32;

        let page = class
            .pages
            .get_mut(&page_address)
            .expect("free of untracked pool allocation");

        debug_assert!(page.bitmap[slot as usize / 64] & (1 << (slot % 64)) != 0);

        page.bitmap[slot as usize / 64] &= !(1 << (slot % 64));
        page.free_count += 1;

        if page.free_count == slots_per_page {
            class.pages.remove(&page_address);
            return pages.free(page_address, PAGE_SIZE);
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;

    #[test]
    fn page_allocator_fills_chunks_in_order() {
        let mut pages = PageAllocator::new();
        let chunk = pages.add_chunk(4 * MIB);

        // 4 MiB holds 16 allocations of 256 KiB.
        let mut addresses = Vec::new();
        for _ in 0..16 {
            addresses.push(pages.alloc(256 * KIB, 64 * KIB).unwrap());
        }

        assert!(pages.alloc(256 * KIB, 64 * KIB).is_none());
        assert_eq!(pages.pages_used(chunk), 64);

        // A second chunk (grown to 8 MiB) services the 17th allocation.
        let chunk2 = pages.add_chunk(8 * MIB);
        let overflow = pages.alloc(256 * KIB, 64 * KIB).unwrap();
        assert_eq!(overflow >> CHUNK_ADDRESS_BITS, chunk2 as u64);

        // Releasing everything leaves both chunks empty.
        for (i, address) in addresses.into_iter().enumerate() {
            let empty = pages.free(address, 256 * KIB);
            assert_eq!(empty, i == 15);
        }

        assert!(pages.free(overflow, 256 * KIB));
        assert_eq!(pages.pages_used(chunk), 0);
        assert_eq!(pages.pages_used(chunk2), 0);
    }

    #[test]
    fn page_allocator_respects_alignment() {
        let mut pages = PageAllocator::new();
        pages.add_chunk(4 * MIB);

        let _ = pages.alloc(64 * KIB, 64 * KIB).unwrap();
        let aligned = pages.alloc(256 * KIB, 256 * KIB).unwrap();

        assert_eq!(aligned & CHUNK_ADDRESS_MASK & (256 * KIB - 1), 0);
    }

    #[test]
    fn page_allocator_reuses_removed_chunk_slots() {
        let mut pages = PageAllocator::new();
        let a = pages.add_chunk(4 * MIB);
        let b = pages.add_chunk(4 * MIB);

        pages.remove_chunk(a);
        let c = pages.add_chunk(8 * MIB);

        assert_eq!(c, a);
        assert_eq!(pages.chunk_count(), 2);
        assert_ne!(b, c);
    }

    #[test]
    fn allocation_mask_reflects_usage() {
        let mut pages = PageAllocator::new();
        let chunk = pages.add_chunk(4 * MIB);

        let _ = pages.alloc(2 * 64 * KIB, 64 * KIB).unwrap();

        let mut mask = vec![0u32; 2];
        pages.page_allocation_mask(chunk, &mut mask);
        assert_eq!(mask[0], 0x3);
    }

    #[test]
    fn pool_allocator_round_trip() {
        let mut pages = PageAllocator::new();
        let mut pool = PoolAllocator::new();
        let chunk = pages.add_chunk(4 * MIB);

        let a = pool.alloc(&mut pages, 256, 256).unwrap();
        let b = pool.alloc(&mut pages, 256, 256).unwrap();

        // Both slots come from the same 64 KiB page.
        assert_eq!(a & !(PAGE_SIZE - 1), b & !(PAGE_SIZE - 1));
        assert_ne!(a, b);
        assert_eq!(pages.pages_used(chunk), 1);

        assert!(!pool.free(&mut pages, a, 256, 256));
        // Releasing the last slot returns the page and empties the chunk.
        assert!(pool.free(&mut pages, b, 256, 256));
        assert_eq!(pages.pages_used(chunk), 0);
    }

    #[test]
    fn pool_allocator_separates_size_classes() {
        let mut pages = PageAllocator::new();
        let mut pool = PoolAllocator::new();
        pages.add_chunk(4 * MIB);

        let small = pool.alloc(&mut pages, 256, 256).unwrap();
        let large = pool.alloc(&mut pages, 16 * KIB, 256).unwrap();

        assert_ne!(small & !(PAGE_SIZE - 1), large & !(PAGE_SIZE - 1));
    }

    #[test]
    fn pool_allocator_rounds_up_for_alignment() {
        let mut pages = PageAllocator::new();
        let mut pool = PoolAllocator::new();
        pages.add_chunk(4 * MIB);

        let address = pool.alloc(&mut pages, 300, 1024).unwrap();
        assert_eq!(address % 1024, 0);
        assert!(!pool.free(&mut pages, address, 300, 1024));
    }
}
