//! HP-SRAM bank power gating.
//!
//! Each bank has its own power-gating control and status register. A range is
//! powered on bank by bank for every bank it touches; it is powered off only
//! for banks lying wholly inside it, so a neighbour sharing an edge bank is
//! never cut off. Every transition is confirmed by a bounded status poll.

use heapless::Vec;

use crate::arch::poll::{PollResult, Retry, Timeout};
use crate::arch::{CycleTimer, RegisterIo};
use crate::log_error;
use crate::macros::LogSink;
use crate::platform::{MAX_SRAM_SEGMENTS, PlatformTiming, RegisterMap, SramLayout};

/// Power on every bank touching `[start, start + len)`.
///
/// All banks are attempted; the result reports whether any failed to ack.
pub fn power_on<H>(
    hal: &H,
    regs: &RegisterMap,
    sram: &SramLayout,
    timing: &PlatformTiming,
    start: usize,
    len: usize,
) -> PollResult
where
    H: RegisterIo + CycleTimer + LogSink + ?Sized,
{
    let (first, end) = sram.banks_touching(start, len);
    gate_banks(hal, regs, timing, first..end, false)
}

/// Power off every bank lying wholly inside `[start, start + len)`.
pub fn power_off<H>(
    hal: &H,
    regs: &RegisterMap,
    sram: &SramLayout,
    timing: &PlatformTiming,
    start: usize,
    len: usize,
) -> PollResult
where
    H: RegisterIo + CycleTimer + LogSink + ?Sized,
{
    let (first, end) = sram.banks_within(start, len);
    gate_banks(hal, regs, timing, first..end, true)
}

fn gate_banks<H>(
    hal: &H,
    regs: &RegisterMap,
    timing: &PlatformTiming,
    banks: core::ops::Range<usize>,
    gated: bool,
) -> PollResult
where
    H: RegisterIo + CycleTimer + LogSink + ?Sized,
{
    let retry = Retry::new(timing.sram_bank_tries, timing.default_delay_cycles);
    let bit = regs.hpsram_pg_bit;
    let mut result = Ok(());

    for bank in banks {
        if gated {
            hal.update32(regs.hpsram_pgctl(bank), 0, bit);
        } else {
            hal.update32(regs.hpsram_pgctl(bank), bit, 0);
        }
        let status = regs.hpsram_pgists(bank);
        let acked = retry.wait_until(hal, || (hal.read32(status) & bit != 0) == gated);
        if acked.is_err() {
            log_error!(hal, "hpsram bank power gating not acknowledged", bank, gated);
            result = Err(Timeout);
        }
    }
    result
}

/// Power-gating mask of every present bank, one word per segment.
pub fn full_masks(sram: &SramLayout) -> Vec<u32, MAX_SRAM_SEGMENTS> {
    let mut masks = Vec::new();
    for segment in 0..sram.segments().min(MAX_SRAM_SEGMENTS) {
        // Capacity equals the loop bound.
        let _ = masks.push(sram.segment_mask(segment));
    }
    masks
}
