//! Data Cache Management
//!
//! Line-granular cache maintenance built on the [`CacheMaintenance`] primitive.
//!
//! # Cache Coherency
//!
//! The DSP cores have private, non-coherent L1 data caches. Every SRAM byte is
//! reachable through two address windows: a cached alias and an uncached alias.
//! Memory shared between cores (or with DMA) is either accessed only through the
//! uncached alias, or maintained explicitly:
//! - **Writeback**: push dirty lines to SRAM before another agent reads it
//! - **Invalidate**: drop lines before reading data another agent wrote, and
//!   before handing a cached block back to the allocator
//!
//! Maintenance always covers whole lines; a range is widened to the enclosing
//! line boundaries before it reaches the hardware.

#![deny(missing_docs)]

use super::CacheMaintenance;

/// Data cache line size in bytes.
pub const DCACHE_LINE_SIZE: usize = 64;

/// Alignment applied to every heap block so a block never shares a line with
/// allocator metadata.
pub const DCACHE_ALIGN: usize = DCACHE_LINE_SIZE;

static_assertions::const_assert!(DCACHE_LINE_SIZE.is_power_of_two());

/// Cache operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// Clean cache (write back dirty lines)
    Writeback,
    /// Invalidate cache (mark lines invalid)
    Invalidate,
}

/// Line-aligned span covering an arbitrary byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRange {
    /// First byte of the first covered line
    pub start: usize,
    /// Length in bytes, a multiple of the line size
    pub len: usize,
}

impl CacheRange {
    /// Widen `[addr, addr + len)` to whole lines. Empty ranges stay empty.
    pub const fn covering(addr: usize, len: usize) -> Self {
        if len == 0 {
            return Self { start: addr, len: 0 };
        }
        let start = line_align_down(addr);
        let end = line_align_up(addr + len);
        Self { start, len: end - start }
    }

    /// Number of lines in the span.
    pub const fn lines(&self) -> usize {
        self.len / DCACHE_LINE_SIZE
    }
}

/// Round `addr` down to a line boundary.
#[inline]
pub const fn line_align_down(addr: usize) -> usize {
    addr & !(DCACHE_LINE_SIZE - 1)
}

/// Round `value` up to a line boundary.
#[inline]
pub const fn line_align_up(value: usize) -> usize {
    (value + DCACHE_LINE_SIZE - 1) & !(DCACHE_LINE_SIZE - 1)
}

/// Apply `op` to every line overlapping `[addr, addr + len)`.
pub fn maintain<C: CacheMaintenance + ?Sized>(cache: &C, op: CacheOp, addr: usize, len: usize) {
    let range = CacheRange::covering(addr, len);
    if range.len == 0 {
        return;
    }

    match op {
        CacheOp::Writeback => cache.dcache_writeback(range.start, range.len),
        CacheOp::Invalidate => cache.dcache_invalidate(range.start, range.len),
    }
}

/// Invalidate every line overlapping the range.
#[inline]
pub fn invalidate_region<C: CacheMaintenance + ?Sized>(cache: &C, addr: usize, len: usize) {
    maintain(cache, CacheOp::Invalidate, addr, len);
}

/// Write back every line overlapping the range.
#[inline]
pub fn writeback_region<C: CacheMaintenance + ?Sized>(cache: &C, addr: usize, len: usize) {
    maintain(cache, CacheOp::Writeback, addr, len);
}
