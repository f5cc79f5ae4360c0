//! Interrupt-disabling spinlock.

use core::ops::{Deref, DerefMut};
use kestrel_hal::Cpu;
use spin::{Mutex, MutexGuard};

/// Scoped interrupt disable.
///
/// Saves the interrupt flag on creation, disables interrupts, and puts the
/// saved flag back when dropped. Guards nest correctly: only the outermost one
/// re-enables interrupts.
pub struct IrqGuard {
    cpu: &'static dyn Cpu,
    was_enabled: bool,
}

impl IrqGuard {
    /// Disables interrupts until the returned guard is dropped.
    pub fn new(cpu: &'static dyn Cpu) -> Self {
        let was_enabled = cpu.interrupts_enabled();
        if was_enabled {
            cpu.disable_interrupts();
        }
        Self { cpu, was_enabled }
    }

    /// Returns whether interrupts were enabled when the guard was created.
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            self.cpu.enable_interrupts();
        }
    }
}

/// A spinlock that also keeps interrupts disabled while held.
pub struct IrqMutex<T> {
    cpu: &'static dyn Cpu,
    inner: Mutex<T>,
}

impl<T> IrqMutex<T> {
    /// Creates a new unlocked mutex protecting `data`.
    pub fn new(cpu: &'static dyn Cpu, data: T) -> Self {
        Self {
            cpu,
            inner: Mutex::new(data),
        }
    }

    /// Disables interrupts and acquires the lock, spinning while it is held.
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq = IrqGuard::new(self.cpu);
        IrqMutexGuard {
            inner: self.inner.lock(),
            _irq: irq,
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Interrupts are left as they were if the lock is held elsewhere. Trap
    /// handlers use this, since spinning on a lock the interrupted code holds
    /// would never terminate on one processor.
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let irq = IrqGuard::new(self.cpu);
        let inner = self.inner.try_lock()?;
        Some(IrqMutexGuard { inner, _irq: irq })
    }

    /// Returns true if the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// RAII guard returned by [`IrqMutex::lock`].
///
/// Field order matters: the lock is released before interrupts come back on.
pub struct IrqMutexGuard<'a, T> {
    inner: MutexGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
