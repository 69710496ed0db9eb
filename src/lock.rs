//! The global pod lock.
//!
//! A single spinlock serializes every mutation of the pod, the scheduler
//! slots and thread state. It is always acquired with local interrupts
//! disabled; the saved interrupt state is restored when the guard drops.
//! The rescheduler may drop the guard across the machine-level context
//! switch and re-acquire it afterwards.

use crate::arch::Arch;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// A spinlock acquired IRQ-save.
pub struct IrqSpinlock<A: Arch, T> {
    inner: spin::Mutex<T>,
    _arch: PhantomData<fn() -> A>,
}

/// Guard for an [`IrqSpinlock`]; restores the interrupt state on drop.
pub struct IrqGuard<'a, A: Arch, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    flags: usize,
    _arch: PhantomData<fn() -> A>,
}

impl<A: Arch, T> IrqSpinlock<A, T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
            _arch: PhantomData,
        }
    }

    /// Disable local interrupts, then take the lock.
    pub fn lock_irqsave(&self) -> IrqGuard<'_, A, T> {
        let flags = A::local_irq_save();
        IrqGuard {
            guard: Some(self.inner.lock()),
            flags,
            _arch: PhantomData,
        }
    }
}

impl<A: Arch, T> Deref for IrqGuard<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<A: Arch, T> DerefMut for IrqGuard<'_, A, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<A: Arch, T> Drop for IrqGuard<'_, A, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling local interrupts.
        self.guard.take();
        A::local_irq_restore(self.flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::NoOpArch;

    #[test]
    fn guard_gives_exclusive_access() {
        let lock: IrqSpinlock<NoOpArch, u32> = IrqSpinlock::new(7);
        {
            let mut g = lock.lock_irqsave();
            *g += 1;
        }
        assert_eq!(*lock.lock_irqsave(), 8);
    }

    #[test]
    fn reacquire_after_drop() {
        let lock: IrqSpinlock<NoOpArch, u32> = IrqSpinlock::new(0);
        let g = lock.lock_irqsave();
        drop(g);
        let g = lock.lock_irqsave();
        assert_eq!(*g, 0);
    }
}
