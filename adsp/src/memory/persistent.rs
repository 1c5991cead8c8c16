//! Persistent heap.
//!
//! Long-lived, page-granular memory in a separate region (L3/IMR class
//! memory on ACE). The region descriptor arrives from the platform memory map;
//! the heap trims it to whole pages once at boot and never grows. Blocks come
//! from a buddy allocator. The first pages of the region hold one descriptor
//! per page with the length of the block starting there, so `free` needs only
//! the pointer and the number of live blocks is bounded by memory alone.

use core::alloc::Layout;
use core::mem::size_of;
use core::ptr::NonNull;

use buddy_system_allocator::Heap;

use super::{HeapStats, MemoryError, MemoryResult};
use crate::arch::LocalIrq;
use crate::arch::sync::IrqSpinLock;

/// Buddy orders; the largest block is `2^(ORDER-1)` bytes
const ORDER: usize = 32;

/// Platform description of the persistent region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentRegion {
    /// First byte of the region
    pub base: usize,
    /// Total region size
    pub size: usize,
    /// Allocation granularity, a power of two
    pub page_size: usize,
    /// Bytes at the start of the region owned by someone else
    pub reserved: usize,
}

/// Page descriptors: entry `i` is the page count of the live block starting
/// at page `i`, zero otherwise.
struct PageTable {
    addr: usize,
    pages: usize,
}

impl PageTable {
    fn entries(&mut self) -> &mut [u32] {
        // SAFETY: the table was zeroed inside the region handed to
        // `PersistentHeap::new`, the heap never hands those pages out and the
        // table is reached only through the heap lock.
        unsafe { core::slice::from_raw_parts_mut(self.addr as *mut u32, self.pages) }
    }
}

struct PersistentState {
    heap: Heap<ORDER>,
    table: PageTable,
    stats: HeapStats,
}

/// The persistent heap.
pub struct PersistentHeap {
    base: usize,
    size: usize,
    page_size: usize,
    state: IrqSpinLock<PersistentState>,
}

impl PersistentHeap {
    /// Build the heap over the page-aligned interior of `region`.
    ///
    /// # Safety
    /// `region` must be valid, otherwise unused memory for the rest of the
    /// program.
    pub unsafe fn new(region: &PersistentRegion) -> MemoryResult<Self> {
        let page = region.page_size;
        if page == 0 || !page.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment);
        }
        let end = region
            .base
            .checked_add(region.size)
            .ok_or(MemoryError::InvalidSize)?;
        let base = region
            .base
            .checked_add(region.reserved)
            .and_then(|start| super::align_up(start, page))
            .ok_or(MemoryError::InvalidSize)?;
        let size = super::align_down(end.saturating_sub(base), page);
        let pages = size / page;
        let table_len = pages
            .checked_mul(size_of::<u32>())
            .and_then(|len| super::align_up(len, page))
            .ok_or(MemoryError::InvalidSize)?;
        if table_len >= size {
            return Err(MemoryError::InvalidSize);
        }

        // SAFETY: `[base, base + table_len)` is inside the region the caller
        // hands over and page aligned, so suitably aligned for `u32`.
        unsafe { core::ptr::write_bytes(base as *mut u32, 0, pages) };
        let mut heap = Heap::<ORDER>::empty();
        // SAFETY: `[base + table_len, base + size)` is inside the region the
        // caller hands over and disjoint from the table.
        unsafe { heap.init(base + table_len, size - table_len) };
        let stats = HeapStats {
            total: size - table_len,
            free: size - table_len,
            ..HeapStats::default()
        };
        Ok(Self {
            base,
            size,
            page_size: page,
            state: IrqSpinLock::new(PersistentState {
                heap,
                table: PageTable { addr: base, pages },
                stats,
            }),
        })
    }

    /// First managed byte, page aligned.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Managed bytes, a whole number of pages.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `ptr` lies inside this heap.
    pub fn belongs(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.base && addr - self.base < self.size
    }

    fn page_index(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base)?;
        (offset < self.size && offset % self.page_size == 0).then_some(offset / self.page_size)
    }

    /// Allocate `bytes`, page aligned.
    pub fn alloc<I: LocalIrq + ?Sized>(&self, irq: &I, bytes: usize) -> MemoryResult<NonNull<u8>> {
        if bytes == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let size = super::align_up(bytes, self.page_size).ok_or(MemoryError::InvalidSize)?;
        let layout =
            Layout::from_size_align(size, self.page_size).map_err(|_| MemoryError::InvalidSize)?;

        let mut state = self.state.lock(irq);
        let Ok(ptr) = state.heap.alloc(layout) else {
            state.stats.failures += 1;
            return Err(MemoryError::OutOfMemory);
        };
        let pages = (size / self.page_size) as u32;
        if let Some(index) = self.page_index(ptr) {
            if let Some(entry) = state.table.entries().get_mut(index) {
                *entry = pages;
            }
        }
        let used = state.heap.stats_alloc_actual();
        let free = state.stats.total - used;
        state.stats.record_alloc(used, free);
        Ok(ptr)
    }

    /// Release a block returned by [`PersistentHeap::alloc`].
    pub fn free<I: LocalIrq + ?Sized>(&self, irq: &I, ptr: NonNull<u8>) -> MemoryResult<()> {
        let index = self.page_index(ptr).ok_or(MemoryError::InvalidAddress)?;
        let mut state = self.state.lock(irq);
        let pages = state
            .table
            .entries()
            .get_mut(index)
            .map(core::mem::take)
            .filter(|&pages| pages != 0)
            .ok_or(MemoryError::InvalidAddress)?;
        let layout = Layout::from_size_align(pages as usize * self.page_size, self.page_size)
            .map_err(|_| MemoryError::InvalidAddress)?;
        state.heap.dealloc(ptr, layout);
        let used = state.heap.stats_alloc_actual();
        let free = state.stats.total - used;
        state.stats.record_free(used, free);
        Ok(())
    }

    /// Current counters.
    pub fn stats<I: LocalIrq + ?Sized>(&self, irq: &I) -> HeapStats {
        self.state.lock(irq).stats
    }
}
