//! Allocation Front End
//!
//! [`MemoryManager`] is the allocation interface used by the rest of the
//! firmware. It picks a heap and an alias for every request:
//!
//! | request                          | heap       | alias    | alignment                 |
//! |----------------------------------|------------|----------|---------------------------|
//! | `caps` has `PERSISTENT`          | persistent | n/a      | page                      |
//! | cacheable zone, no `COHERENT`    | system     | cached   | ≥ cache line, padded      |
//! | `SysShared` zone or `COHERENT`   | system     | uncached | caller's or cache line    |
//!
//! # Failure Severity
//!
//! A failed `Sys` zone request aborts the firmware; system structures have no
//! fallback. Every other request returns [`MemoryError`] and the caller must
//! check it.

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use core::ptr::{self, NonNull};

use super::{
    AllocCaps, AllocFlags, HeapStats, MemoryError, MemoryResult, MemoryView, MemoryZone,
    PersistentHeap, ZoneHeap,
};
use crate::arch::Hal;
use crate::platform::PlatformMemoryMap;
use crate::{log_error, log_info, log_warn};

/// Counters of every configured heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// System heap
    pub system: HeapStats,
    /// Persistent heap, if configured
    pub persistent: Option<HeapStats>,
}

/// Zone-aware allocator over the system and persistent heaps.
pub struct MemoryManager<'a, H: Hal + ?Sized> {
    hal: &'a H,
    system: ZoneHeap,
    persistent: Option<PersistentHeap>,
}

impl<'a, H: Hal + ?Sized> MemoryManager<'a, H> {
    /// Combine already built heaps.
    pub fn new(hal: &'a H, system: ZoneHeap, persistent: Option<PersistentHeap>) -> Self {
        Self {
            hal,
            system,
            persistent,
        }
    }

    /// Build both heaps from the platform memory map.
    ///
    /// Fails with [`MemoryError::InvalidAddress`] if the persistent region
    /// overlaps either alias of the system heap.
    ///
    /// # Safety
    /// Every region in `map` must be valid, otherwise unused memory for the
    /// rest of the program.
    pub unsafe fn from_memory_map(hal: &'a H, map: &PlatformMemoryMap) -> MemoryResult<Self> {
        let system_region = map.system_heap;
        let persistent = match &map.persistent {
            Some(region) => {
                // SAFETY: forwarded from the caller.
                let heap = unsafe { PersistentHeap::new(region)? };
                if system_region.overlaps(heap.base(), heap.size()) {
                    log_error!(hal, "persistent region overlaps system heap", heap.base(), heap.size());
                    return Err(MemoryError::InvalidAddress);
                }
                Some(heap)
            }
            None => None,
        };
        // SAFETY: forwarded from the caller.
        let system = unsafe { ZoneHeap::new(system_region) };
        log_info!(hal, "heaps ready", system_region.base, system_region.size);
        Ok(Self::new(hal, system, persistent))
    }

    /// Allocate `bytes` from `zone`.
    pub fn alloc(
        &self,
        zone: MemoryZone,
        flags: AllocFlags,
        caps: AllocCaps,
        bytes: usize,
    ) -> MemoryResult<NonNull<u8>> {
        self.alloc_aligned(zone, flags, caps, bytes, None)
    }

    /// Allocate `bytes` from `zone` with an explicit alignment.
    ///
    /// # Panics
    /// If a `Sys` zone request fails for any reason, including a bad size or
    /// alignment.
    pub fn alloc_aligned(
        &self,
        zone: MemoryZone,
        flags: AllocFlags,
        caps: AllocCaps,
        bytes: usize,
        alignment: Option<usize>,
    ) -> MemoryResult<NonNull<u8>> {
        if caps.contains(AllocCaps::PERSISTENT) {
            return self.alloc_persistent(bytes);
        }

        let result = {
            let view = if zone.is_cacheable() && !flags.contains(AllocFlags::COHERENT) {
                MemoryView::Cached
            } else {
                MemoryView::Uncached
            };
            self.system.alloc(self.hal, view, bytes, alignment)
        };

        match result {
            Err(error) if zone.is_fatal_on_failure() => {
                log_error!(self.hal, "sys zone allocation failed", bytes);
                panic!("sys zone allocation failed: {error}");
            }
            other => other,
        }
    }

    /// As [`MemoryManager::alloc`], with exactly `bytes` zeroed.
    pub fn zalloc(
        &self,
        zone: MemoryZone,
        flags: AllocFlags,
        caps: AllocCaps,
        bytes: usize,
    ) -> MemoryResult<NonNull<u8>> {
        let ptr = self.alloc(zone, flags, caps, bytes)?;
        // SAFETY: the block was just allocated with at least `bytes` bytes.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Ok(ptr)
    }

    /// Allocate an aligned buffer-zone block.
    ///
    /// `COHERENT` requests get exactly `alignment` in the uncached alias;
    /// everything else follows the cached buffer policy.
    pub fn balloc(
        &self,
        flags: AllocFlags,
        caps: AllocCaps,
        bytes: usize,
        alignment: usize,
    ) -> MemoryResult<NonNull<u8>> {
        if caps.contains(AllocCaps::PERSISTENT) {
            return self.alloc_persistent(bytes);
        }
        let view = if flags.contains(AllocFlags::COHERENT) {
            MemoryView::Uncached
        } else {
            MemoryView::Cached
        };
        self.system.alloc(self.hal, view, bytes, Some(alignment))
    }

    /// Move a block to a new allocation of `new_bytes`.
    ///
    /// A null `ptr` is a plain [`MemoryManager::balloc`]. A zero `new_bytes`
    /// is rejected and `ptr` stays valid. Otherwise the first
    /// `min(new_bytes, old_bytes)` bytes are copied unless `NO_COPY` is set,
    /// and the old block is freed. The returned pointer is never `ptr`.
    pub fn realloc(
        &self,
        ptr: *mut u8,
        flags: AllocFlags,
        caps: AllocCaps,
        new_bytes: usize,
        old_bytes: usize,
        alignment: usize,
    ) -> MemoryResult<NonNull<u8>> {
        if ptr.is_null() {
            return self.balloc(flags, caps, new_bytes, alignment);
        }
        if new_bytes == 0 {
            log_error!(self.hal, "realloc: zero-length request rejected", ptr as usize);
            return Err(MemoryError::InvalidSize);
        }

        let new = self.balloc(flags, caps, new_bytes, alignment)?;
        if !flags.contains(AllocFlags::NO_COPY) {
            // SAFETY: `ptr` holds at least `old_bytes`, `new` at least
            // `new_bytes`, and they are distinct live blocks.
            unsafe {
                ptr::copy_nonoverlapping(ptr.cast_const(), new.as_ptr(), new_bytes.min(old_bytes));
            }
        }
        self.free(ptr);
        Ok(new)
    }

    /// Release a block from either heap. Null is ignored; a pointer owned
    /// by neither heap is logged and ignored.
    pub fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        if let Some(persistent) = &self.persistent {
            if persistent.belongs(ptr.as_ptr()) {
                if persistent.free(self.hal, ptr).is_err() {
                    log_error!(self.hal, "free: not a live persistent block", ptr.as_ptr() as usize);
                }
                return;
            }
        }

        if self.system.free(self.hal, ptr).is_err() {
            log_error!(self.hal, "free: pointer outside every heap", ptr.as_ptr() as usize);
        }
    }

    /// Whether `ptr` belongs to the persistent heap.
    pub fn is_persistent(&self, ptr: *const u8) -> bool {
        self.persistent.as_ref().is_some_and(|p| p.belongs(ptr))
    }

    /// Snapshot of every heap's counters.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            system: self.system.stats(self.hal),
            persistent: self.persistent.as_ref().map(|p| p.stats(self.hal)),
        }
    }

    /// Emit the counters of every heap to the log.
    pub fn log_stats(&self) {
        let stats = self.stats();
        log_info!(
            self.hal,
            "system heap: total used free",
            stats.system.total,
            stats.system.used,
            stats.system.free
        );
        if let Some(p) = stats.persistent {
            log_info!(self.hal, "persistent heap: total used free", p.total, p.used, p.free);
        }
    }

    fn alloc_persistent(&self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        match &self.persistent {
            Some(heap) => heap.alloc(self.hal, bytes),
            None => {
                log_warn!(self.hal, "persistent memory requested but not configured", bytes);
                Err(MemoryError::OutOfMemory)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::cache::DCACHE_ALIGN;
    use crate::arch::mock::MockHal;
    use crate::macros::DebugLevel;
    use crate::memory::{HeapRegion, testing};
    use proptest::prelude::*;

    fn manager(hal: &MockHal) -> MemoryManager<'_, MockHal> {
        // SAFETY: leaked arenas live for the rest of the test binary.
        unsafe {
            let system = ZoneHeap::new(testing::system_region());
            let persistent = PersistentHeap::new(&testing::persistent_region()).unwrap();
            MemoryManager::new(hal, system, Some(persistent))
        }
    }

    fn region(mm: &MemoryManager<'_, MockHal>) -> HeapRegion {
        mm.system.region()
    }

    #[test]
    fn test_zone_routing() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let region = region(&mm);

        let cached = mm.alloc(MemoryZone::Runtime, AllocFlags::empty(), AllocCaps::empty(), 40).unwrap();
        assert_eq!(region.view_of(cached.as_ptr() as usize), Some(MemoryView::Cached));
        assert_eq!(cached.as_ptr() as usize % DCACHE_ALIGN, 0);

        let shared = mm.alloc(MemoryZone::SysShared, AllocFlags::empty(), AllocCaps::empty(), 40).unwrap();
        assert_eq!(region.view_of(shared.as_ptr() as usize), Some(MemoryView::Uncached));

        let coherent = mm.alloc(MemoryZone::Buffer, AllocFlags::COHERENT, AllocCaps::empty(), 40).unwrap();
        assert_eq!(region.view_of(coherent.as_ptr() as usize), Some(MemoryView::Uncached));

        let persistent = mm.alloc(MemoryZone::Sys, AllocFlags::COHERENT, AllocCaps::PERSISTENT, 40).unwrap();
        assert!(mm.is_persistent(persistent.as_ptr()));
        assert_eq!(region.view_of(persistent.as_ptr() as usize), None);
    }

    #[test]
    fn test_non_sys_failure_is_returned() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let result = mm.alloc(MemoryZone::Runtime, AllocFlags::empty(), AllocCaps::empty(), 1 << 20);
        assert_eq!(result, Err(MemoryError::OutOfMemory));
    }

    #[test]
    #[should_panic(expected = "sys zone allocation failed: out of memory")]
    fn test_sys_failure_is_fatal() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let _ = mm.alloc(MemoryZone::Sys, AllocFlags::empty(), AllocCaps::empty(), 1 << 20);
    }

    #[test]
    #[should_panic(expected = "sys zone allocation failed: invalid alignment")]
    fn test_sys_bad_alignment_is_fatal() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let _ = mm.alloc_aligned(MemoryZone::Sys, AllocFlags::empty(), AllocCaps::empty(), 40, Some(3));
    }

    #[test]
    #[should_panic(expected = "sys zone allocation failed: invalid allocation size")]
    fn test_sys_zero_size_is_fatal() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let _ = mm.alloc(MemoryZone::Sys, AllocFlags::empty(), AllocCaps::empty(), 0);
    }

    #[test]
    fn test_non_sys_bad_alignment_is_returned() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let result = mm.alloc_aligned(MemoryZone::Runtime, AllocFlags::empty(), AllocCaps::empty(), 40, Some(3));
        assert_eq!(result, Err(MemoryError::InvalidAlignment));
    }

    #[test]
    fn test_balloc_coherent_alignment() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let ptr = mm.balloc(AllocFlags::COHERENT, AllocCaps::empty(), 100, 128).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 128, 0);
        assert_eq!(region(&mm).view_of(ptr.as_ptr() as usize), Some(MemoryView::Uncached));
    }

    #[test]
    fn test_free_null_is_noop() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let before = mm.stats();
        mm.free(ptr::null_mut());
        assert_eq!(mm.stats(), before);
        assert!(hal.logs().is_empty());
    }

    #[test]
    fn test_free_foreign_pointer_logged() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let mut local = [0u8; 16];
        mm.free(local.as_mut_ptr());
        assert!(hal.logged(DebugLevel::Error, "free: pointer outside every heap"));
    }

    #[test]
    fn test_free_dispatches_persistent() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let ptr = mm.alloc(MemoryZone::Runtime, AllocFlags::empty(), AllocCaps::PERSISTENT, 100).unwrap();
        assert_eq!(mm.stats().persistent.map(|s| s.allocations), Some(1));
        mm.free(ptr.as_ptr());
        assert_eq!(mm.stats().persistent.map(|s| s.allocations), Some(0));
        assert_eq!(mm.stats().system.allocations, 0);
        assert!(hal.cache_calls().is_empty());
    }

    #[test]
    fn test_realloc_zero_length_keeps_block() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let ptr = mm.balloc(AllocFlags::empty(), AllocCaps::empty(), 64, 8).unwrap();
        let result = mm.realloc(ptr.as_ptr(), AllocFlags::empty(), AllocCaps::empty(), 0, 64, 8);
        assert_eq!(result, Err(MemoryError::InvalidSize));
        assert_eq!(mm.stats().system.allocations, 1);
        mm.free(ptr.as_ptr());
        assert_eq!(mm.stats().system.allocations, 0);
        assert_eq!(hal.log_count(DebugLevel::Error), 1);
    }

    #[test]
    fn test_realloc_null_allocates() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let ptr = mm
            .realloc(ptr::null_mut(), AllocFlags::empty(), AllocCaps::empty(), 32, 0, 8)
            .unwrap();
        assert_eq!(mm.stats().system.allocations, 1);
        mm.free(ptr.as_ptr());
    }

    #[test]
    fn test_realloc_no_copy() {
        let hal = MockHal::new();
        let mm = manager(&hal);
        let old = mm.balloc(AllocFlags::COHERENT, AllocCaps::empty(), 64, 8).unwrap();
        // SAFETY: 64-byte live block.
        unsafe { ptr::write_bytes(old.as_ptr(), 0x5a, 64) };
        // Dirty the block the new allocation will land in.
        let scratch = mm.balloc(AllocFlags::COHERENT, AllocCaps::empty(), 64, 8).unwrap();
        // SAFETY: 64-byte live block.
        unsafe { ptr::write_bytes(scratch.as_ptr(), 0x11, 64) };
        mm.free(scratch.as_ptr());

        let flags = AllocFlags::COHERENT | AllocFlags::NO_COPY;
        let new = mm.realloc(old.as_ptr(), flags, AllocCaps::empty(), 64, 64, 8).unwrap();
        assert_ne!(new, old);
        // SAFETY: 64-byte live block.
        let first = unsafe { new.as_ptr().read() };
        assert_ne!(first, 0x5a);
        assert_eq!(mm.stats().system.allocations, 1);
    }

    #[test]
    fn test_missing_persistent_heap() {
        let hal = MockHal::new();
        // SAFETY: leaked arena.
        let system = unsafe { ZoneHeap::new(testing::system_region()) };
        let mm = MemoryManager::new(&hal, system, None);
        let result = mm.alloc(MemoryZone::Runtime, AllocFlags::empty(), AllocCaps::PERSISTENT, 8);
        assert_eq!(result, Err(MemoryError::OutOfMemory));
        assert!(mm.stats().persistent.is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_heaps_are_disjoint(requests in prop::collection::vec((any::<bool>(), 1usize..1500), 1..24)) {
            let hal = MockHal::new();
            let mm = manager(&hal);
            let region = region(&mm);
            let mut system = Vec::new();
            let mut persistent = Vec::new();
            for (long_lived, bytes) in requests {
                let caps = if long_lived { AllocCaps::PERSISTENT } else { AllocCaps::empty() };
                let Ok(ptr) = mm.alloc(MemoryZone::Runtime, AllocFlags::COHERENT, caps, bytes) else {
                    continue;
                };
                let start = ptr.as_ptr() as usize;
                if long_lived {
                    persistent.push((start, start + bytes));
                } else {
                    prop_assert_eq!(region.view_of(start), Some(MemoryView::Uncached));
                    system.push((start, start + bytes));
                }
            }
            for &(a_start, a_end) in &system {
                for &(b_start, b_end) in &persistent {
                    prop_assert!(a_end <= b_start || b_end <= a_start);
                }
            }
        }

        #[test]
        fn prop_zalloc_zero_fills(bytes in 1usize..4096, cached in any::<bool>()) {
            let hal = MockHal::new();
            let mm = manager(&hal);
            let flags = if cached { AllocFlags::empty() } else { AllocFlags::COHERENT };
            let dirty = mm.alloc(MemoryZone::Runtime, flags, AllocCaps::empty(), bytes).unwrap();
            // SAFETY: `bytes`-byte live block.
            unsafe { ptr::write_bytes(dirty.as_ptr(), 0xa5, bytes) };
            mm.free(dirty.as_ptr());

            let ptr = mm.zalloc(MemoryZone::Runtime, flags, AllocCaps::empty(), bytes).unwrap();
            // SAFETY: `bytes`-byte live block.
            let block = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), bytes) };
            prop_assert!(block.iter().all(|&b| b == 0));
        }

        #[test]
        fn prop_realloc_preserves_prefix(
            old_bytes in 1usize..2048,
            new_bytes in 1usize..2048,
            coherent in any::<bool>(),
            seed in any::<u8>(),
        ) {
            let hal = MockHal::new();
            let mm = manager(&hal);
            let flags = if coherent { AllocFlags::COHERENT } else { AllocFlags::empty() };
            let old = mm.balloc(flags, AllocCaps::empty(), old_bytes, 8).unwrap();
            // SAFETY: `old_bytes`-byte live block.
            let content = unsafe { core::slice::from_raw_parts_mut(old.as_ptr(), old_bytes) };
            for (i, byte) in content.iter_mut().enumerate() {
                *byte = (i as u8).wrapping_mul(31).wrapping_add(seed);
            }

            let new = mm.realloc(old.as_ptr(), flags, AllocCaps::empty(), new_bytes, old_bytes, 8).unwrap();
            prop_assert_ne!(new, old);
            let kept = new_bytes.min(old_bytes);
            // SAFETY: `new_bytes`-byte live block.
            let moved = unsafe { core::slice::from_raw_parts(new.as_ptr(), kept) };
            for (i, &byte) in moved.iter().enumerate() {
                prop_assert_eq!(byte, (i as u8).wrapping_mul(31).wrapping_add(seed));
            }
            prop_assert_eq!(mm.stats().system.allocations, 1);
        }
    }
}
