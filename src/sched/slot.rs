//! Per-CPU scheduler slot.
//!
//! Each online CPU owns one slot: the currently running thread, the ready
//! queue (delegated to the scheduling class), the resched request mask, the
//! FPU holder, the zombie awaiting finalization, the root thread, and the
//! slot-level timers.

use super::class::{SchedClass, ThreadKey};
use crate::cpumask::{CpuId, CpuSet};
use crate::time::Timer;

use alloc::boxed::Box;
use bitflags::bitflags;

bitflags! {
    /// Slot status mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        /// Running a hook callout; rescheduling is deferred
        const KCOUT  = 0x0001;
        /// Mid-switch with the pod lock released
        const SWLOCK = 0x0002;
        /// A remote pick request arrived via IPI
        const RPICK  = 0x0004;
    }
}

/// Scheduler state of one CPU.
pub struct Slot {
    pub(crate) cpu: CpuId,
    /// The running thread; defaults to the root thread, never dangling.
    pub(crate) curr: ThreadKey,
    /// CPUs whose slots need a re-pick: this slot's own bit plus peers it
    /// has poked.
    pub(crate) resched: CpuSet,
    pub(crate) status: SlotFlags,
    /// Thread whose FPU state is live in this CPU's FPU.
    pub(crate) fpuholder: Option<ThreadKey>,
    /// At most one corpse awaiting post-switch finalization.
    pub(crate) zombie: Option<ThreadKey>,
    /// The idle thread; always present, never deletable.
    pub(crate) root: ThreadKey,
    /// Outgoing thread during an unlocked switch.
    pub(crate) last: Option<ThreadKey>,
    pub(crate) class: Box<dyn SchedClass>,
    /// Host-tick emulation timer.
    pub(crate) htimer: Timer,
    /// Runaway-thread watchdog.
    pub(crate) wdtimer: Timer,
    pub(crate) wd_ticks: u32,
}

impl Slot {
    pub(crate) fn new(cpu: CpuId, root: ThreadKey, class: Box<dyn SchedClass>) -> Self {
        let mut htimer = Timer::new();
        let mut wdtimer = Timer::new();
        htimer.set_sched(cpu);
        wdtimer.set_sched(cpu);
        Self {
            cpu,
            curr: root,
            resched: CpuSet::empty(),
            status: SlotFlags::empty(),
            fpuholder: None,
            zombie: None,
            root,
            last: None,
            class,
            htimer,
            wdtimer,
            wd_ticks: 0,
        }
    }

    /// CPU this slot drives.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Whether any resched request is pending on this slot.
    pub(crate) fn resched_pending(&self) -> bool {
        !self.resched.is_empty()
    }

    pub(crate) fn reset_watchdog(&mut self) {
        self.wd_ticks = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::FifoClass;

    #[test]
    fn fresh_slot_runs_its_root() {
        let slot = Slot::new(1, 42, Box::new(FifoClass::new()));
        assert_eq!(slot.cpu(), 1);
        assert_eq!(slot.curr, slot.root);
        assert!(!slot.resched_pending());
        assert!(slot.fpuholder.is_none());
        assert!(slot.zombie.is_none());
    }
}
