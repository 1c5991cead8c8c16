//! Host-side hardware double.
//!
//! `MockHal` implements every hardware trait on plain host memory: a sparse
//! register file with acknowledge rules, a cycle counter driven by the host
//! clock, per-thread interrupt masking, recorded cache maintenance, a log
//! recorder, and core control that runs the secondary entry routine on a host
//! thread. `power_down` records its arguments and unwinds.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use std::vec::Vec;

use super::{
    ArchError, ArchResult, BootHandshake, CacheMaintenance, CoreControl, CycleTimer, LocalIrq,
    PowerDown, RegisterIo, StackRegion,
};
use crate::cpu::{self, CoreId, MAX_CORE_COUNT, SecondaryHooks};
use crate::macros::{DebugLevel, LogSink};

/// Mock cycle counter frequency.
pub(crate) const MOCK_CYCLES_PER_US: u64 = 100;

thread_local! {
    static CURRENT_CORE: Cell<u8> = const { Cell::new(0) };
    static IRQ_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// One recorded cache maintenance call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheCall {
    Writeback { addr: usize, len: usize },
    Invalidate { addr: usize, len: usize },
}

/// One recorded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogRecord {
    pub level: DebugLevel,
    pub message: &'static str,
    pub params: Vec<u32>,
}

/// One recorded `start_core` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StartRecord {
    pub core: u8,
    pub stack: StackRegion,
}

/// Secondary hook that ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookCall {
    Bootstrap,
    SecondaryInit,
}

/// One secondary hook call and whether the core had been released by then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HookRecord {
    pub core: u8,
    pub call: HookCall,
    pub released: bool,
}

/// Arguments of the terminal power-down call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PowerDownRecord {
    pub disable_lpsram: bool,
    pub hpsram_masks: Vec<u32>,
}

/// Writing `ctrl_mask` at `ctrl` drives `status_mask` at `status`.
#[derive(Debug, Clone, Copy)]
struct AckRule {
    ctrl: usize,
    ctrl_mask: u32,
    status: usize,
    status_mask: u32,
}

#[derive(Default)]
struct MockState {
    regs: Mutex<HashMap<usize, u32>>,
    rules: Mutex<Vec<AckRule>>,
    writes: Mutex<Vec<(usize, u32)>>,
    cache: Mutex<Vec<CacheCall>>,
    logs: Mutex<Vec<LogRecord>>,
    active: [AtomicBool; MAX_CORE_COUNT],
    stuck: [AtomicBool; MAX_CORE_COUNT],
    started: Mutex<Vec<StartRecord>>,
    // Per core: did the secondary see the start flag before acknowledging?
    released_before_ack: Mutex<Vec<(u8, bool)>>,
    hooks: Mutex<Vec<HookRecord>>,
    boot_silent: AtomicBool,
    refuse_soft_off: AtomicBool,
    halt_fails: AtomicBool,
    soft_off_requests: Mutex<Vec<u8>>,
    halted: Mutex<Vec<u8>>,
    power_down: Mutex<Option<PowerDownRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Cloneable handle; clones share one hardware state.
#[derive(Clone)]
pub(crate) struct MockHal {
    state: Arc<MockState>,
    epoch: Instant,
}

impl MockHal {
    /// Fresh hardware: registers zero, only the primary core active.
    pub(crate) fn new() -> Self {
        let hal = Self {
            state: Arc::new(MockState::default()),
            epoch: Instant::now(),
        };
        hal.state.active[0].store(true, Ordering::SeqCst);
        hal
    }

    /// Make the calling host thread behave as `core`.
    pub(crate) fn enter_core(core: u8) {
        CURRENT_CORE.with(|c| c.set(core));
    }

    pub(crate) fn reg(&self, addr: usize) -> u32 {
        lock(&self.state.regs).get(&addr).copied().unwrap_or(0)
    }

    /// Set a register without recording a write or applying rules.
    pub(crate) fn set_reg(&self, addr: usize, value: u32) {
        lock(&self.state.regs).insert(addr, value);
    }

    /// Status bits follow the control bits.
    pub(crate) fn ack(&self, ctrl: usize, ctrl_mask: u32, status: usize, status_mask: u32) {
        lock(&self.state.rules).push(AckRule {
            ctrl,
            ctrl_mask,
            status,
            status_mask,
        });
    }

    /// Every value written to `addr`, oldest first.
    pub(crate) fn writes_to(&self, addr: usize) -> Vec<u32> {
        lock(&self.state.writes)
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
            .collect()
    }

    pub(crate) fn cache_calls(&self) -> Vec<CacheCall> {
        lock(&self.state.cache).clone()
    }

    /// Interrupt mask nesting depth of the calling thread.
    pub(crate) fn irq_depth(&self) -> u32 {
        IRQ_DEPTH.with(Cell::get)
    }

    pub(crate) fn logs(&self) -> Vec<LogRecord> {
        lock(&self.state.logs).clone()
    }

    pub(crate) fn logged(&self, level: DebugLevel, message: &str) -> bool {
        lock(&self.state.logs)
            .iter()
            .any(|r| r.level == level && r.message == message)
    }

    pub(crate) fn log_count(&self, level: DebugLevel) -> usize {
        lock(&self.state.logs).iter().filter(|r| r.level == level).count()
    }

    pub(crate) fn set_core_active(&self, core: u8, active: bool) {
        self.state.active[usize::from(core)].store(active, Ordering::SeqCst);
    }

    /// Started cores never run their entry routine.
    pub(crate) fn set_boot_silent(&self, silent: bool) {
        self.state.boot_silent.store(silent, Ordering::SeqCst);
    }

    pub(crate) fn set_refuse_soft_off(&self, refuse: bool) {
        self.state.refuse_soft_off.store(refuse, Ordering::SeqCst);
    }

    /// `core` stays active after a soft-off request.
    pub(crate) fn set_core_stuck(&self, core: u8, stuck: bool) {
        self.state.stuck[usize::from(core)].store(stuck, Ordering::SeqCst);
    }

    pub(crate) fn set_halt_fails(&self, fails: bool) {
        self.state.halt_fails.store(fails, Ordering::SeqCst);
    }

    pub(crate) fn start_records(&self) -> Vec<StartRecord> {
        lock(&self.state.started).clone()
    }

    /// `(core, start flag seen before acknowledge)` for every entry routine run.
    pub(crate) fn ack_observations(&self) -> Vec<(u8, bool)> {
        lock(&self.state.released_before_ack).clone()
    }

    /// Secondary hook calls, oldest first.
    pub(crate) fn hook_calls(&self) -> Vec<HookRecord> {
        lock(&self.state.hooks).clone()
    }

    /// Hook calls once at least `count` were recorded, or after two seconds.
    pub(crate) fn wait_for_hooks(&self, count: usize) -> Vec<HookRecord> {
        let start = Instant::now();
        loop {
            let calls = self.hook_calls();
            if calls.len() >= count || start.elapsed() > Duration::from_secs(2) {
                return calls;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Run the entry routine of `core` now, as a core that boots late.
    pub(crate) fn boot_late(&self, core: CoreId, handshake: &'static BootHandshake) {
        let hal = self.clone();
        std::thread::spawn(move || run_secondary(hal, core, handshake));
    }

    pub(crate) fn soft_off_requests(&self) -> Vec<u8> {
        lock(&self.state.soft_off_requests).clone()
    }

    pub(crate) fn halted_cores(&self) -> Vec<u8> {
        lock(&self.state.halted).clone()
    }

    pub(crate) fn power_down_record(&self) -> Option<PowerDownRecord> {
        lock(&self.state.power_down).clone()
    }

    fn store(&self, addr: usize, value: u32) {
        lock(&self.state.writes).push((addr, value));
        let rules: Vec<AckRule> = lock(&self.state.rules)
            .iter()
            .filter(|r| r.ctrl == addr)
            .copied()
            .collect();
        let mut regs = lock(&self.state.regs);
        regs.insert(addr, value);
        for rule in rules {
            let set = value & rule.ctrl_mask != 0;
            let status = regs.entry(rule.status).or_insert(0);
            if set {
                *status |= rule.status_mask;
            } else {
                *status &= !rule.status_mask;
            }
        }
    }
}

impl RegisterIo for MockHal {
    fn read32(&self, addr: usize) -> u32 {
        self.reg(addr)
    }

    fn write32(&self, addr: usize, value: u32) {
        self.store(addr, value);
    }

    fn read16(&self, addr: usize) -> u16 {
        (self.reg(addr) & 0xffff) as u16
    }

    fn write16(&self, addr: usize, value: u16) {
        self.store(addr, u32::from(value));
    }
}

impl CacheMaintenance for MockHal {
    fn dcache_invalidate(&self, addr: usize, len: usize) {
        lock(&self.state.cache).push(CacheCall::Invalidate { addr, len });
    }

    fn dcache_writeback(&self, addr: usize, len: usize) {
        lock(&self.state.cache).push(CacheCall::Writeback { addr, len });
    }
}

impl CycleTimer for MockHal {
    fn cycles(&self) -> u64 {
        let ns = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        ns / (1000 / MOCK_CYCLES_PER_US)
    }

    fn cycles_per_us(&self) -> u64 {
        MOCK_CYCLES_PER_US
    }
}

impl LocalIrq for MockHal {
    fn irq_local_disable(&self) -> u32 {
        IRQ_DEPTH.with(|depth| {
            let previous = depth.get();
            depth.set(previous + 1);
            previous
        })
    }

    fn irq_local_restore(&self, state: u32) {
        IRQ_DEPTH.with(|depth| depth.set(state));
    }
}

struct MockSecondary {
    hal: MockHal,
    handshake: &'static BootHandshake,
}

impl MockSecondary {
    fn record(&self, core: CoreId, call: HookCall) {
        lock(&self.hal.state.hooks).push(HookRecord {
            core: core.raw(),
            call,
            released: self.handshake.is_released(),
        });
    }
}

impl SecondaryHooks for MockSecondary {
    fn bootstrap(&self, core: CoreId) {
        self.record(core, HookCall::Bootstrap);
    }

    fn secondary_init(&self, core: CoreId) {
        self.record(core, HookCall::SecondaryInit);
    }

    fn run_scheduler(&self, _core: CoreId) -> ! {
        loop {
            std::thread::park();
        }
    }
}

fn run_secondary(hal: MockHal, core: CoreId, handshake: &'static BootHandshake) {
    MockHal::enter_core(core.raw());
    let released = handshake.is_released();
    lock(&hal.state.released_before_ack).push((core.raw(), released));
    cpu::secondary_entry(core, handshake, &MockSecondary { hal, handshake })
}

impl CoreControl for MockHal {
    fn current_core(&self) -> CoreId {
        CoreId::new(CURRENT_CORE.with(Cell::get)).unwrap_or(CoreId::PRIMARY)
    }

    fn is_core_active(&self, core: CoreId) -> bool {
        self.state.active[core.index()].load(Ordering::SeqCst)
    }

    fn start_core(&self, core: CoreId, stack: StackRegion, handshake: &'static BootHandshake) {
        lock(&self.state.started).push(StartRecord {
            core: core.raw(),
            stack,
        });
        self.set_core_active(core.raw(), true);
        if self.state.boot_silent.load(Ordering::SeqCst) {
            return;
        }
        let hal = self.clone();
        std::thread::spawn(move || run_secondary(hal, core, handshake));
    }

    fn request_soft_off(&self, core: CoreId) -> bool {
        lock(&self.state.soft_off_requests).push(core.raw());
        if self.state.refuse_soft_off.load(Ordering::SeqCst) {
            return false;
        }
        if !core.is_primary() && !self.state.stuck[core.index()].load(Ordering::SeqCst) {
            self.set_core_active(core.raw(), false);
        }
        true
    }

    fn halt_core(&self, core: CoreId) -> ArchResult<()> {
        if self.state.halt_fails.load(Ordering::SeqCst) {
            return Err(ArchError::HaltFailed);
        }
        lock(&self.state.halted).push(core.raw());
        Ok(())
    }
}

impl PowerDown for MockHal {
    fn power_down(&self, disable_lpsram: bool, hpsram_masks: &[u32]) -> ! {
        *lock(&self.state.power_down) = Some(PowerDownRecord {
            disable_lpsram,
            hpsram_masks: hpsram_masks.to_vec(),
        });
        panic!("mock power down");
    }
}

impl LogSink for MockHal {
    fn log(&self, level: DebugLevel, message: &'static str, params: &[u32]) {
        lock(&self.state.logs).push(LogRecord {
            level,
            message,
            params: params.to_vec(),
        });
    }
}
