//! Cross-core locking.
//!
//! [`IrqSpinLock`] is the only lock type in the platform core. It masks local
//! interrupts before spinning so an interrupt handler on the same core can never
//! spin on a lock its own core already holds, then takes a `spin` mutex shared
//! by all cores. Critical sections must stay short and constant-time: no
//! hardware polling loop ever runs with one of these held.

use core::ops::{Deref, DerefMut};

use spin::mutex::{SpinMutex, SpinMutexGuard};

use super::LocalIrq;

/// Spinlock acquired with local interrupts masked.
pub struct IrqSpinLock<T> {
    inner: SpinMutex<T>,
}

impl<T> IrqSpinLock<T> {
    /// Create an unlocked lock around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            inner: SpinMutex::new(data),
        }
    }

    /// Mask interrupts on the calling core, then spin until the lock is ours.
    /// Both are undone when the guard drops.
    pub fn lock<'a, I: LocalIrq + ?Sized>(&'a self, irq: &'a I) -> IrqSpinLockGuard<'a, T, I> {
        let state = irq.irq_local_disable();
        let guard = self.inner.lock();
        IrqSpinLockGuard {
            guard: Some(guard),
            irq,
            state,
        }
    }

    /// Whether any core currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Guard returned by [`IrqSpinLock::lock`].
pub struct IrqSpinLockGuard<'a, T, I: LocalIrq + ?Sized> {
    // Option so the mutex is released before interrupts are restored.
    guard: Option<SpinMutexGuard<'a, T>>,
    irq: &'a I,
    state: u32,
}

impl<T, I: LocalIrq + ?Sized> Deref for IrqSpinLockGuard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!(),
        }
    }
}

impl<T, I: LocalIrq + ?Sized> DerefMut for IrqSpinLockGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!(),
        }
    }
}

impl<T, I: LocalIrq + ?Sized> Drop for IrqSpinLockGuard<'_, T, I> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.irq.irq_local_restore(self.state);
    }
}
