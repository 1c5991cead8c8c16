//! System heap.
//!
//! A first-fit free-list heap (`linked_list_allocator`) over the uncached alias
//! of the system heap region, behind its own [`IrqSpinLock`]. Every block is
//! preceded by a small header recording the layout it was carved with, so
//! `free` needs nothing but the pointer.
//!
//! ```text
//! raw block start                      user pointer
//! |<------------ header_room ---------->|<------ usable ------>|
//! | padding ...         | BlockHeader   | caller data ...      |
//! ```
//!
//! Headers are always read and written through the uncached alias. For cached
//! blocks the header room is a whole number of cache lines, so writing back the
//! caller's lines can never overwrite it.

use core::alloc::Layout;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use linked_list_allocator::Heap;

use super::{
    CachedAddr, HeapRegion, HeapStats, MemoryError, MemoryResult, MemoryView, UncachedAddr,
};
use crate::arch::cache::{self, DCACHE_ALIGN};
use crate::arch::sync::IrqSpinLock;
use crate::arch::{CacheMaintenance, LocalIrq};

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct BlockHeader {
    /// Distance from the raw block start to the user pointer
    header_room: usize,
    /// Size of the layout handed to the free list
    layout_size: usize,
    /// Alignment of the layout handed to the free list
    layout_align: usize,
    /// Bytes the caller may use
    usable: usize,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

struct ZoneState {
    heap: Heap,
    stats: HeapStats,
}

/// The system heap.
pub struct ZoneHeap {
    region: HeapRegion,
    state: IrqSpinLock<ZoneState>,
}

impl ZoneHeap {
    /// Build the heap over `region`.
    ///
    /// # Safety
    /// Both aliases of `region` must be valid, otherwise unused memory for the
    /// rest of the program.
    pub unsafe fn new(region: HeapRegion) -> Self {
        // SAFETY: forwarded from the caller.
        let heap = unsafe { Heap::new(region.base as *mut u8, region.size) };
        let stats = HeapStats {
            total: heap.size(),
            free: heap.free(),
            ..HeapStats::default()
        };
        Self {
            region,
            state: IrqSpinLock::new(ZoneState { heap, stats }),
        }
    }

    /// Region served by this heap.
    pub fn region(&self) -> HeapRegion {
        self.region
    }

    /// Whether `addr` is in either alias of the heap.
    pub fn contains(&self, addr: usize) -> bool {
        self.region.view_of(addr).is_some()
    }

    /// Allocate `bytes` in `view`.
    ///
    /// Cached blocks are aligned to at least a cache line and padded to whole
    /// lines. Uncached blocks use `align`, or the cache alignment if none is
    /// given.
    pub fn alloc<I: LocalIrq + ?Sized>(
        &self,
        irq: &I,
        view: MemoryView,
        bytes: usize,
        align: Option<usize>,
    ) -> MemoryResult<NonNull<u8>> {
        if bytes == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let requested = align.unwrap_or(DCACHE_ALIGN).max(1);
        if !requested.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment);
        }

        let (align, usable) = match view {
            MemoryView::Cached => {
                let align = requested.max(DCACHE_ALIGN);
                let usable = super::align_up(bytes, DCACHE_ALIGN).ok_or(MemoryError::InvalidSize)?;
                (align, usable)
            }
            MemoryView::Uncached => (requested, bytes),
        };
        let align = align.max(align_of::<BlockHeader>());
        let header_room = super::align_up(HEADER_SIZE, align).ok_or(MemoryError::InvalidSize)?;
        let layout_size = header_room
            .checked_add(usable)
            .ok_or(MemoryError::InvalidSize)?;
        let layout =
            Layout::from_size_align(layout_size, align).map_err(|_| MemoryError::InvalidSize)?;

        let raw = {
            let mut state = self.state.lock(irq);
            match state.heap.allocate_first_fit(layout) {
                Ok(raw) => {
                    let (used, free) = (state.heap.used(), state.heap.free());
                    state.stats.record_alloc(used, free);
                    raw
                }
                Err(()) => {
                    state.stats.failures += 1;
                    return Err(MemoryError::OutOfMemory);
                }
            }
        };

        let user = raw.as_ptr() as usize + header_room;
        let header = BlockHeader {
            header_room,
            layout_size,
            layout_align: align,
            usable,
        };
        // SAFETY: the header slot lies inside the block just carved, before
        // `user`, and is aligned because `header_room` is a multiple of `align`.
        unsafe { ((user - HEADER_SIZE) as *mut BlockHeader).write(header) };

        let addr = match view {
            MemoryView::Uncached => user,
            MemoryView::Cached => match self.region.to_cached(UncachedAddr::new(user)) {
                Some(cached) => cached.get(),
                None => {
                    self.release(irq, raw, layout);
                    return Err(MemoryError::InvalidAddress);
                }
            },
        };
        NonNull::new(addr as *mut u8).ok_or(MemoryError::InvalidAddress)
    }

    /// Usable size of a live block, through either alias.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> MemoryResult<usize> {
        let (_, user) = self.canonical(ptr)?;
        Ok(self.header(user)?.usable)
    }

    /// Return a block to the free list.
    ///
    /// A cached block has its lines invalidated over the whole usable size
    /// first, so no stale dirty line is written back into reused memory.
    pub fn free<H: LocalIrq + CacheMaintenance + ?Sized>(
        &self,
        hal: &H,
        ptr: NonNull<u8>,
    ) -> MemoryResult<()> {
        let (view, user) = self.canonical(ptr)?;
        let header = self.header(user)?;
        if view == MemoryView::Cached {
            cache::invalidate_region(hal, ptr.as_ptr() as usize, header.usable);
        }

        let layout = Layout::from_size_align(header.layout_size, header.layout_align)
            .map_err(|_| MemoryError::InvalidAddress)?;
        let raw = NonNull::new((user.get() - header.header_room) as *mut u8)
            .ok_or(MemoryError::InvalidAddress)?;
        self.release(hal, raw, layout);
        Ok(())
    }

    /// Current counters.
    pub fn stats<I: LocalIrq + ?Sized>(&self, irq: &I) -> HeapStats {
        self.state.lock(irq).stats
    }

    fn release<I: LocalIrq + ?Sized>(&self, irq: &I, raw: NonNull<u8>, layout: Layout) {
        let mut state = self.state.lock(irq);
        // SAFETY: `raw`/`layout` are exactly what `allocate_first_fit` returned
        // and consumed; callers only reach here once per block.
        unsafe { state.heap.deallocate(raw, layout) };
        let (used, free) = (state.heap.used(), state.heap.free());
        state.stats.record_free(used, free);
    }

    fn canonical(&self, ptr: NonNull<u8>) -> MemoryResult<(MemoryView, UncachedAddr)> {
        let addr = ptr.as_ptr() as usize;
        match self.region.view_of(addr) {
            Some(MemoryView::Uncached) => Ok((MemoryView::Uncached, UncachedAddr::new(addr))),
            Some(MemoryView::Cached) => self
                .region
                .to_uncached(CachedAddr::new(addr))
                .map(|u| (MemoryView::Cached, u))
                .ok_or(MemoryError::InvalidAddress),
            None => Err(MemoryError::InvalidAddress),
        }
    }

    fn header(&self, user: UncachedAddr) -> MemoryResult<BlockHeader> {
        let user = user.get();
        if user < self.region.base + HEADER_SIZE || user % align_of::<BlockHeader>() != 0 {
            return Err(MemoryError::InvalidAddress);
        }
        // SAFETY: in-region and aligned; every block user pointer is preceded
        // by its header.
        let header = unsafe { ((user - HEADER_SIZE) as *const BlockHeader).read() };
        let sane = header.header_room >= HEADER_SIZE
            && header.header_room <= user - self.region.base
            && header.layout_align.is_power_of_two()
            && header.layout_size == header.header_room + header.usable
            && user + header.usable <= self.region.end();
        if sane { Ok(header) } else { Err(MemoryError::InvalidAddress) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::{CacheCall, MockHal};
    use crate::memory::testing;

    fn heap() -> ZoneHeap {
        // SAFETY: leaked arenas live for the rest of the test binary.
        unsafe { ZoneHeap::new(testing::system_region()) }
    }

    #[test]
    fn test_cached_block_is_line_aligned_and_padded() {
        let hal = MockHal::new();
        let heap = heap();
        let ptr = heap.alloc(&hal, MemoryView::Cached, 10, Some(8)).unwrap();
        let addr = ptr.as_ptr() as usize;
        assert_eq!(addr % DCACHE_ALIGN, 0);
        assert_eq!(heap.region().view_of(addr), Some(MemoryView::Cached));
        assert_eq!(heap.usable_size(ptr), Ok(DCACHE_ALIGN));
    }

    #[test]
    fn test_uncached_keeps_requested_alignment() {
        let hal = MockHal::new();
        let heap = heap();
        let ptr = heap.alloc(&hal, MemoryView::Uncached, 24, Some(256)).unwrap();
        let addr = ptr.as_ptr() as usize;
        assert_eq!(addr % 256, 0);
        assert_eq!(heap.region().view_of(addr), Some(MemoryView::Uncached));
        assert_eq!(heap.usable_size(ptr), Ok(24));
    }

    #[test]
    fn test_rejects_bad_requests() {
        let hal = MockHal::new();
        let heap = heap();
        assert_eq!(
            heap.alloc(&hal, MemoryView::Uncached, 0, None),
            Err(MemoryError::InvalidSize)
        );
        assert_eq!(
            heap.alloc(&hal, MemoryView::Uncached, 8, Some(48)),
            Err(MemoryError::InvalidAlignment)
        );
    }

    #[test]
    fn test_cached_free_invalidates_usable_size() {
        let hal = MockHal::new();
        let heap = heap();
        let ptr = heap.alloc(&hal, MemoryView::Cached, 100, None).unwrap();
        heap.free(&hal, ptr).unwrap();
        assert_eq!(
            hal.cache_calls(),
            vec![CacheCall::Invalidate {
                addr: ptr.as_ptr() as usize,
                len: 128
            }]
        );
    }

    #[test]
    fn test_uncached_free_skips_cache() {
        let hal = MockHal::new();
        let heap = heap();
        let ptr = heap.alloc(&hal, MemoryView::Uncached, 100, None).unwrap();
        heap.free(&hal, ptr).unwrap();
        assert!(hal.cache_calls().is_empty());
    }

    #[test]
    fn test_free_restores_space() {
        let hal = MockHal::new();
        let heap = heap();
        let before = heap.stats(&hal);
        let a = heap.alloc(&hal, MemoryView::Cached, 1000, None).unwrap();
        let b = heap.alloc(&hal, MemoryView::Uncached, 300, Some(16)).unwrap();
        let during = heap.stats(&hal);
        assert_eq!(during.allocations, 2);
        assert!(during.used > before.used);
        heap.free(&hal, a).unwrap();
        heap.free(&hal, b).unwrap();
        let after = heap.stats(&hal);
        assert_eq!(after.allocations, 0);
        assert_eq!(after.used, before.used);
        assert_eq!(after.peak_used, during.used);
    }

    #[test]
    fn test_out_of_memory_counts_failure() {
        let hal = MockHal::new();
        let heap = heap();
        assert_eq!(
            heap.alloc(&hal, MemoryView::Uncached, testing::ARENA_SIZE, None),
            Err(MemoryError::OutOfMemory)
        );
        assert_eq!(heap.stats(&hal).failures, 1);
    }

    #[test]
    fn test_foreign_pointer_rejected() {
        let hal = MockHal::new();
        let heap = heap();
        let mut local = 0u64;
        let ptr = NonNull::from(&mut local).cast::<u8>();
        assert_eq!(heap.free(&hal, ptr), Err(MemoryError::InvalidAddress));
    }
}
