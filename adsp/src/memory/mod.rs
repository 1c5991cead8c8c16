//! Memory Management Subsystem
//!
//! This module provides the heap layer of the DSP platform core. There is no
//! MMU: every heap serves fixed physical SRAM extents, and the only address
//! translation is between the two aliases through which each SRAM byte can be
//! reached.
//!
//! - System heap ([`zone_heap::ZoneHeap`]): working memory for every zone
//! - Persistent heap ([`persistent::PersistentHeap`]): page-granular, long-lived
//! - Front end ([`allocator::MemoryManager`]): zone and capability routing,
//!   cache policy, `zalloc`/`realloc`/`free`
//!
//! # Memory Layout
//!
//! ```text
//! HP-SRAM, uncached alias                          HP-SRAM, cached alias
//! base ............................ base + size   base + cached_offset ...
//! | image | system heap ...........|              | same bytes, through L1 |
//! ```
//!
//! Blocks handed out through the cached alias are padded to whole cache lines so
//! no two allocations (or an allocation and heap metadata) ever share a line.

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use bitflags::bitflags;
use thiserror_no_std::Error;

pub mod allocator;
pub mod persistent;
pub mod zone_heap;

pub use allocator::{MemoryManager, MemoryStats};
pub use persistent::{PersistentHeap, PersistentRegion};
pub use zone_heap::ZoneHeap;

/// Page size used by the persistent heap
pub const PAGE_SIZE: usize = 4096;

/// Memory management errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No free block large enough
    #[error("out of memory")]
    OutOfMemory,
    /// Zero-length or overflowing request
    #[error("invalid allocation size")]
    InvalidSize,
    /// Alignment is not a power of two
    #[error("invalid alignment")]
    InvalidAlignment,
    /// Pointer not owned by the heap it was handed to
    #[error("address not owned by this heap")]
    InvalidAddress,
}

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Allocation zone. Selects cacheability and failure severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryZone {
    /// System data that lives for the whole firmware lifetime. Failure is fatal.
    Sys = 0,
    /// Runtime data owned by the system
    SysRuntime = 1,
    /// Component runtime data
    Runtime = 2,
    /// Audio buffers
    Buffer = 3,
    /// Data shared between cores, always uncached
    SysShared = 4,
}

impl MemoryZone {
    /// Whether the zone is served from the cached alias by default.
    pub const fn is_cacheable(self) -> bool {
        !matches!(self, Self::SysShared)
    }

    /// Whether an allocation failure in this zone aborts the firmware.
    pub const fn is_fatal_on_failure(self) -> bool {
        matches!(self, Self::Sys)
    }
}

bitflags! {
    /// Allocation behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Serve from the uncached alias
        const COHERENT = 1 << 0;
        /// Do not copy contents when reallocating
        const NO_COPY = 1 << 1;
    }
}

bitflags! {
    /// Requested memory capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocCaps: u32 {
        /// Long-lived memory from the persistent heap
        const PERSISTENT = 1 << 0;
    }
}

/// Which alias an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryView {
    /// Through the data cache
    Cached,
    /// Bypassing the data cache
    Uncached,
}

/// Address in the cached alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CachedAddr(usize);

/// Address in the uncached alias. Heap bookkeeping always uses this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UncachedAddr(usize);

impl CachedAddr {
    /// Wrap a raw address
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Raw address value
    pub const fn get(self) -> usize {
        self.0
    }
}

impl UncachedAddr {
    /// Wrap a raw address
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Raw address value
    pub const fn get(self) -> usize {
        self.0
    }
}

/// A heap extent and the offset of its cached alias.
///
/// `base` and `size` describe the uncached alias. The cached alias of an
/// address is `addr + cached_offset` (wrapping); an offset of zero means the
/// region has no separate cached alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRegion {
    /// Uncached base address
    pub base: usize,
    /// Size in bytes
    pub size: usize,
    /// Distance from the uncached to the cached alias
    pub cached_offset: usize,
}

impl HeapRegion {
    /// Describe a region.
    pub const fn new(base: usize, size: usize, cached_offset: usize) -> Self {
        Self {
            base,
            size,
            cached_offset,
        }
    }

    /// First address past the uncached extent
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    /// Whether `addr` lies in the uncached extent.
    pub const fn contains_uncached(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Whether `addr` lies in the cached extent.
    pub const fn contains_cached(&self, addr: usize) -> bool {
        if self.cached_offset == 0 {
            return false;
        }
        let start = self.base.wrapping_add(self.cached_offset);
        addr.wrapping_sub(start) < self.size
    }

    /// Whether `[start, start + len)` intersects either alias.
    pub const fn overlaps(&self, start: usize, len: usize) -> bool {
        let end = start.saturating_add(len);
        if start < self.end() && self.base < end {
            return true;
        }
        if self.cached_offset == 0 {
            return false;
        }
        let cached_start = self.base.wrapping_add(self.cached_offset);
        start < cached_start.saturating_add(self.size) && cached_start < end
    }

    /// Classify `addr`, or `None` if it is outside both aliases.
    pub const fn view_of(&self, addr: usize) -> Option<MemoryView> {
        if self.contains_uncached(addr) {
            Some(MemoryView::Uncached)
        } else if self.contains_cached(addr) {
            Some(MemoryView::Cached)
        } else {
            None
        }
    }

    /// Cached alias of an in-region uncached address.
    pub const fn to_cached(&self, addr: UncachedAddr) -> Option<CachedAddr> {
        if !self.contains_uncached(addr.0) {
            return None;
        }
        Some(CachedAddr(addr.0.wrapping_add(self.cached_offset)))
    }

    /// Uncached alias of an in-region cached address.
    pub const fn to_uncached(&self, addr: CachedAddr) -> Option<UncachedAddr> {
        if self.cached_offset == 0 {
            return if self.contains_uncached(addr.0) {
                Some(UncachedAddr(addr.0))
            } else {
                None
            };
        }
        if !self.contains_cached(addr.0) {
            return None;
        }
        Some(UncachedAddr(addr.0.wrapping_sub(self.cached_offset)))
    }
}

/// Usage counters of one heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes managed by the heap
    pub total: usize,
    /// Bytes currently allocated, including padding and headers
    pub used: usize,
    /// Bytes currently free
    pub free: usize,
    /// Live allocations
    pub allocations: usize,
    /// Requests that could not be served
    pub failures: usize,
    /// High-water mark of `used`
    pub peak_used: usize,
}

impl HeapStats {
    pub(crate) fn record_alloc(&mut self, used: usize, free: usize) {
        self.allocations += 1;
        self.used = used;
        self.free = free;
        self.peak_used = self.peak_used.max(used);
    }

    pub(crate) fn record_free(&mut self, used: usize, free: usize) {
        self.allocations = self.allocations.saturating_sub(1);
        self.used = used;
        self.free = free;
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}
