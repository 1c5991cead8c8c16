//! Secondary Core Lifecycle
//!
//! Brings secondary cores up and down under the control of the primary core.
//!
//! # Bring-up
//!
//! ```text
//! Inactive ──enable_core──▶ Starting ──ack──▶ Active
//!     ▲                                          │
//!     └──────halt────── Halting ◀──disable_core──┘
//! ```
//!
//! A starting core has no lock runtime yet, so bring-up is synchronised with
//! the lock-free [`BootHandshake`]. The primary core takes the core's private
//! memory and DSP power references before it starts the core and gives them
//! back once the core has been halted.
//!
//! Hardware activity is always read live from [`CoreControl`]; nothing here
//! caches whether a core is running.

#![deny(missing_docs)]

use core::sync::atomic::{AtomicU8, Ordering};

use thiserror_no_std::Error;

use crate::arch::poll::Deadline;
use crate::arch::{BootHandshake, CoreControl, Hal};
use crate::platform::PlatformConfig;
use crate::power::{DspClient, DspGateIndex, PowerContext, PowerRuntime};
use crate::{log_error, log_info, log_warn};

/// Upper bound on cores in a cluster.
pub const MAX_CORE_COUNT: usize = 8;

// Core masks are single words.
static_assertions::const_assert!(MAX_CORE_COUNT <= 32);

/// Boot handshakes for the firmware's cores, one per core.
pub static BOOT_HANDSHAKES: [BootHandshake; MAX_CORE_COUNT] =
    [const { BootHandshake::new() }; MAX_CORE_COUNT];

/// Physical core index, always below [`MAX_CORE_COUNT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(u8);

impl CoreId {
    /// Designated boot core.
    pub const PRIMARY: Self = Self(0);

    /// Validate a raw core index.
    pub const fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < MAX_CORE_COUNT {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Raw index.
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Index usable for per-core arrays.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Single bit of this core in a core mask.
    pub const fn mask(self) -> u32 {
        1 << self.0
    }

    /// Whether this is core 0.
    pub const fn is_primary(self) -> bool {
        self.0 == Self::PRIMARY.0
    }
}

/// Observed lifecycle state of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreState {
    /// Not running
    Inactive = 0,
    /// Started, not yet acknowledged
    Starting = 1,
    /// Running
    Active = 2,
    /// Soft-off requested, not yet halted
    Halting = 3,
}

/// Core lifecycle errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// Core index outside the configured cluster
    #[error("invalid core")]
    InvalidCore,
    /// Operation is reserved to the primary core
    #[error("not running on the primary core")]
    NotPrimary,
    /// The started core never acknowledged
    #[error("core boot timed out")]
    BootTimeout,
}

/// Result type for core lifecycle operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-local services a secondary core runs once released.
pub trait SecondaryHooks {
    /// Bring up the core-local runtime (interrupts, timers, scheduler data).
    fn bootstrap(&self, core: CoreId);

    /// Platform-specific secondary core initialisation.
    fn secondary_init(&self, core: CoreId);

    /// Enter normal scheduling. Never returns.
    fn run_scheduler(&self, core: CoreId) -> !;
}

/// Entry routine of a starting secondary core.
///
/// Acknowledges first, waits for release, then bootstraps the core-local
/// runtime and yields into scheduling.
pub fn secondary_entry<S: SecondaryHooks + ?Sized>(
    core: CoreId,
    handshake: &BootHandshake,
    hooks: &S,
) -> ! {
    handshake.acknowledge();
    handshake.wait_released();
    hooks.bootstrap(core);
    hooks.secondary_init(core);
    hooks.run_scheduler(core)
}

/// Live mask of hardware-active cores among the first `core_count`.
pub fn cores_enabled_mask<C: CoreControl + ?Sized>(hal: &C, core_count: usize) -> u32 {
    (0..core_count.min(MAX_CORE_COUNT))
        .filter_map(|i| CoreId::new(i as u8))
        .filter(|&core| hal.is_core_active(core))
        .fold(0, |mask, core| mask | core.mask())
}

const NO_TRANSITION: u8 = 0;
const STARTING: u8 = CoreState::Starting as u8;
const HALTING: u8 = CoreState::Halting as u8;

/// Starts and stops secondary cores.
pub struct CoreLifecycle<'a, H: Hal + ?Sized> {
    hal: &'a H,
    config: &'a PlatformConfig,
    power: PowerRuntime<'a, H>,
    handshakes: &'static [BootHandshake; MAX_CORE_COUNT],
    transitions: [AtomicU8; MAX_CORE_COUNT],
}

impl<'a, H: Hal + ?Sized> CoreLifecycle<'a, H> {
    /// Coordinator using `handshakes` for bring-up, one per core.
    pub fn new(
        hal: &'a H,
        config: &'a PlatformConfig,
        power: PowerRuntime<'a, H>,
        handshakes: &'static [BootHandshake; MAX_CORE_COUNT],
    ) -> Self {
        Self {
            hal,
            config,
            power,
            handshakes,
            transitions: [const { AtomicU8::new(NO_TRANSITION) }; MAX_CORE_COUNT],
        }
    }

    fn check(&self, core: CoreId) -> CoreResult<()> {
        if core.index() < self.config.memory.core_count {
            Ok(())
        } else {
            Err(CoreError::InvalidCore)
        }
    }

    fn is_primary(&self, core: CoreId) -> bool {
        core == self.config.memory.primary_core
    }

    fn set_transition(&self, core: CoreId, state: Option<CoreState>) {
        let raw = state.map_or(NO_TRANSITION, |s| s as u8);
        self.transitions[core.index()].store(raw, Ordering::Release);
    }

    /// Start `core` and wait for it to acknowledge. Primary core only.
    ///
    /// A core that is already running is left alone. On a bring-up timeout
    /// the core stays [`CoreState::Starting`] with its power references
    /// taken; a later call waits for its acknowledge again instead of
    /// restarting it.
    pub fn enable_core(&self, core: CoreId) -> CoreResult<()> {
        self.check(core)?;
        if !self.is_primary(self.hal.current_core()) {
            return Err(CoreError::NotPrimary);
        }
        let handshakes: &'static [BootHandshake; MAX_CORE_COUNT] = self.handshakes;
        let handshake = &handshakes[core.index()];
        if self.transitions[core.index()].load(Ordering::Acquire) == STARTING {
            return self.complete_start(core, handshake);
        }
        if self.hal.is_core_active(core) {
            return Ok(());
        }

        self.set_transition(core, Some(CoreState::Starting));
        self.power.get(PowerContext::CoreMemory, u32::from(core.raw()));
        self.power.get(
            PowerContext::DspCoreGate,
            DspGateIndex::new(core, DspClient::TOPOLOGY).raw(),
        );

        handshake.reset();
        self.hal
            .start_core(core, self.config.memory.stacks.stack(core), handshake);
        self.complete_start(core, handshake)
    }

    // Wait for the acknowledge of a started core, then release it.
    fn complete_start(&self, core: CoreId, handshake: &BootHandshake) -> CoreResult<()> {
        let timing = &self.config.timing;
        let interval = timing
            .core_ready_poll_us
            .saturating_mul(self.hal.cycles_per_us());
        let deadline = Deadline::after_us(
            self.hal,
            timing
                .core_ready_poll_us
                .saturating_mul(u64::from(timing.core_ready_tries)),
        );
        if handshake.wait_acknowledged(self.hal, deadline, interval).is_err() {
            log_error!(self.hal, "core did not acknowledge start", core.raw());
            return Err(CoreError::BootTimeout);
        }

        handshake.release();
        self.set_transition(core, None);
        log_info!(self.hal, "core enabled", core.raw());
        Ok(())
    }

    /// Request soft-off of `core` and, for a secondary core, halt it once idle.
    ///
    /// Timeouts and halt failures are logged; the call still succeeds.
    pub fn disable_core(&self, core: CoreId) -> CoreResult<()> {
        self.check(core)?;
        if !self.hal.is_core_active(core) {
            log_warn!(self.hal, "core already disabled", core.raw());
            return Ok(());
        }
        if !self.hal.request_soft_off(core) {
            log_error!(self.hal, "soft off request refused", core.raw());
            return Ok(());
        }
        // The host removes primary core power once soft-off is reached.
        if self.is_primary(core) {
            return Ok(());
        }

        // A failed halt leaves the core in the state it had before.
        let previous = self.transitions[core.index()].swap(HALTING, Ordering::AcqRel);
        let deadline = Deadline::after_ms(self.hal, self.config.timing.core_disable_timeout_ms);
        let idle = deadline.wait_until(self.hal, self.config.timing.default_delay_cycles, || {
            !self.hal.is_core_active(core)
        });
        if idle.is_err() {
            log_error!(self.hal, "core did not reach idle", core.raw());
            self.transitions[core.index()].store(previous, Ordering::Release);
            return Ok(());
        }

        match self.hal.halt_core(core) {
            Ok(()) => {
                self.power.put(
                    PowerContext::DspCoreGate,
                    DspGateIndex::new(core, DspClient::TOPOLOGY).raw(),
                );
                self.power.put(PowerContext::CoreMemory, u32::from(core.raw()));
                self.set_transition(core, None);
                log_info!(self.hal, "core disabled", core.raw());
            }
            Err(_) => {
                log_error!(self.hal, "core halt failed", core.raw());
                self.transitions[core.index()].store(previous, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Lifecycle state of `core`.
    pub fn state(&self, core: CoreId) -> CoreState {
        match self.transitions[core.index()].load(Ordering::Acquire) {
            STARTING => CoreState::Starting,
            HALTING => CoreState::Halting,
            _ if self.hal.is_core_active(core) => CoreState::Active,
            _ => CoreState::Inactive,
        }
    }

    /// Live mask of hardware-active configured cores.
    pub fn enabled_mask(&self) -> u32 {
        cores_enabled_mask(self.hal, self.config.memory.core_count)
    }
}
