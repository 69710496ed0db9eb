//! Thread control blocks.
//!
//! A [`Tcb`] is the per-thread record the pod schedules: identity, state
//! and info masks, priorities, affinity, timers, wait channel, start
//! parameters, signal block, statistics, and the architecture context.
//! Threads are stored in the pod's arena and referred to by [`ThreadHandle`];
//! a handle to a deleted thread is detected by its serial number.

use crate::arch::Arch;
use crate::cpumask::{CpuId, CpuSet};
use crate::mem::Stack;
use crate::sched::Priority;
use crate::synch::WaitChannel;
use crate::time::{Ticks, Timer, TICK_INFINITE};

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

/// Thread entry point; receives the start cookie.
pub type ThreadEntry = fn(usize);

/// Pending asynchronous signals, one bit per signal.
pub type SigMask = u32;

/// Asynchronous service routine; receives the pending-signal snapshot.
pub type Asr = fn(SigMask);

bitflags! {
    /// Thread state mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadState: u32 {
        /// Forcibly suspended
        const SUSP    = 0x0000_0001;
        /// Pending on a wait channel
        const PEND    = 0x0000_0002;
        /// Sleeping on a counted delay
        const DELAY   = 0x0000_0004;
        /// Created but not started, or wound back to that state
        const DORMANT = 0x0000_0008;
        /// Shadow running under the host scheduler (secondary mode)
        const RELAX   = 0x0000_0010;
        /// Enqueued in its slot's ready queue
        const READY   = 0x0000_0020;
        /// The slot's root (idle) thread
        const ROOT    = 0x0000_0040;
        /// Bound to a user-space mate
        const SHADOW  = 0x0000_0080;
        /// Priority-inheritance boost in progress
        const BOOST   = 0x0000_0100;
        /// Holds the scheduler lock
        const LOCK    = 0x0000_0200;
        /// Undergoes round-robin scheduling
        const RRB     = 0x0000_0400;
        /// Uses the FPU
        const FPU     = 0x0000_0800;
        /// Deleted, awaiting finalization
        const ZOMBIE  = 0x0000_1000;
        /// Has been started at least once
        const STARTED = 0x0000_2000;
        /// Self-restart in progress
        const RESTART = 0x0000_4000;
        /// In flight to another CPU across an unlocked switch
        const MIGRATE = 0x0000_8000;
        /// Interrupt shield engaged while relaxed
        const SHIELD  = 0x0001_0000;
        /// Asynchronous signal delivery disabled
        const ASDI    = 0x0002_0000;

        /// The suspensive conditions; a thread with any of these set is not
        /// eligible for scheduling.
        const BLOCK_BITS = Self::SUSP.bits()
            | Self::PEND.bits()
            | Self::DELAY.bits()
            | Self::DORMANT.bits()
            | Self::RELAX.bits();

        /// The control-mode window settable via start/set_mode.
        const MODE_BITS = Self::LOCK.bits()
            | Self::RRB.bits()
            | Self::ASDI.bits()
            | Self::SHIELD.bits();
    }
}

bitflags! {
    /// One-shot wake-up outcomes, consumed by the woken thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadInfo: u32 {
        /// The delay elapsed or a watchdog timeout fired
        const TIMEO   = 0x0001;
        /// The pended channel was destroyed while waiting
        const RMID    = 0x0002;
        /// The wait was forcibly broken
        const BREAK   = 0x0004;
        /// Woken up by an explicit grant
        const WAKEN   = 0x0008;
        /// The granted resource was stolen by a faster waiter
        const ROBBED  = 0x0010;
        /// The shadow's mate received a host signal
        const KICKED  = 0x0020;
        /// A priority change awaits propagation to the mate
        const PRIOSET = 0x0040;
    }
}

/// Handle to a pod thread.
///
/// Handles stay cheap and copyable; the serial number makes operations on a
/// deleted-and-reused slot fail with an identity error instead of acting on
/// the wrong thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    pub(crate) idx: usize,
    pub(crate) serial: u64,
}

/// Execution-time accounts and event counters.
#[derive(Debug, Default, Clone)]
pub struct ThreadStats {
    /// Context switches into this thread
    pub csw: u64,
    /// Page faults taken while running (shadows)
    pub pf: u64,
    /// Raw-clock date the current account period started
    pub exec_start: Ticks,
    /// Accumulated execution time
    pub exec_total: Ticks,
}

/// Creation flags accepted by `init_thread`.
pub(crate) const INIT_FLAGS: ThreadState = ThreadState::FPU
    .union(ThreadState::SHADOW)
    .union(ThreadState::SHIELD)
    .union(ThreadState::SUSP);

/// Per-thread control block.
pub struct Tcb<A: Arch> {
    pub(crate) key: usize,
    pub(crate) serial: u64,

    pub(crate) name: String,
    pub(crate) user_pid: Option<i32>,

    pub(crate) state: ThreadState,
    pub(crate) info: ThreadInfo,

    /// Base priority, as last requested by renice.
    pub(crate) bprio: Priority,
    /// Effective priority; may exceed `bprio` under a boost.
    pub(crate) cprio: Priority,
    /// Priority given at init time; restored on restart.
    pub(crate) iprio: Priority,

    /// Owning scheduler slot.
    pub(crate) sched: CpuId,
    pub(crate) affinity: CpuSet,

    pub(crate) rrperiod: Ticks,
    pub(crate) rrcredit: Ticks,
    pub(crate) rr_expired: bool,

    pub(crate) rtimer: Timer,
    pub(crate) ptimer: Timer,

    pub(crate) wchan: Option<Arc<dyn WaitChannel>>,
    pub(crate) claims: Vec<Arc<dyn WaitChannel>>,

    pub(crate) entry: Option<ThreadEntry>,
    pub(crate) cookie: usize,
    pub(crate) imask: i32,
    pub(crate) imode: ThreadState,

    pub(crate) asr: Option<Asr>,
    pub(crate) asrmode: ThreadState,
    pub(crate) asrimask: i32,
    pub(crate) asrlevel: u32,
    pub(crate) signals: SigMask,

    pub(crate) lock_count: u32,

    pub(crate) stat: ThreadStats,

    pub(crate) stack: Option<Stack>,
    pub(crate) ctx: A::Context,
    pub(crate) fpu: Option<alloc::boxed::Box<A::FpuContext>>,
}

impl<A: Arch> Tcb<A> {
    /// Build a fresh control block attached to `cpu`.
    ///
    /// `flags` seeds the state mask (FPU/SHADOW/SHIELD); suspensive bits
    /// are applied afterwards by the caller through the regular suspension
    /// path, never here.
    pub(crate) fn new(
        key: usize,
        serial: u64,
        name: String,
        prio: Priority,
        flags: ThreadState,
        stack: Option<Stack>,
        cpu: CpuId,
    ) -> Self {
        let mut rtimer = Timer::new();
        let mut ptimer = Timer::new();
        rtimer.set_sched(cpu);
        ptimer.set_sched(cpu);

        let fpu = if flags.contains(ThreadState::FPU) {
            Some(alloc::boxed::Box::new(A::FpuContext::default()))
        } else {
            None
        };

        Self {
            key,
            serial,
            name,
            user_pid: None,
            state: flags,
            info: ThreadInfo::empty(),
            bprio: prio,
            cprio: prio,
            iprio: prio,
            sched: cpu,
            affinity: CpuSet::all(),
            rrperiod: TICK_INFINITE,
            rrcredit: TICK_INFINITE,
            rr_expired: false,
            rtimer,
            ptimer,
            wchan: None,
            claims: Vec::new(),
            entry: None,
            cookie: 0,
            imask: 0,
            imode: ThreadState::empty(),
            asr: None,
            asrmode: ThreadState::empty(),
            asrimask: 0,
            asrlevel: 0,
            signals: 0,
            lock_count: 0,
            stat: ThreadStats::default(),
            stack,
            ctx: A::Context::default(),
            fpu,
        }
    }

    /// Handle naming this thread.
    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle {
            idx: self.key,
            serial: self.serial,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// PID of the user-space mate, for shadows.
    pub fn user_pid(&self) -> Option<i32> {
        self.user_pid
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn info(&self) -> ThreadInfo {
        self.info
    }

    /// Effective (possibly boosted) priority.
    pub fn current_priority(&self) -> Priority {
        self.cprio
    }

    pub fn base_priority(&self) -> Priority {
        self.bprio
    }

    pub fn affinity(&self) -> CpuSet {
        self.affinity
    }

    pub fn stats(&self) -> &ThreadStats {
        &self.stat
    }

    pub(crate) fn test_state(&self, mask: ThreadState) -> bool {
        self.state.intersects(mask)
    }

    pub(crate) fn set_state(&mut self, mask: ThreadState) {
        self.state.insert(mask);
    }

    pub(crate) fn clear_state(&mut self, mask: ThreadState) {
        self.state.remove(mask);
    }

    pub(crate) fn test_info(&self, mask: ThreadInfo) -> bool {
        self.info.intersects(mask)
    }

    pub(crate) fn set_info(&mut self, mask: ThreadInfo) {
        self.info.insert(mask);
    }

    pub(crate) fn clear_info(&mut self, mask: ThreadInfo) {
        self.info.remove(mask);
    }

    /// Whether any suspensive condition holds.
    pub(crate) fn blocked(&self) -> bool {
        self.test_state(ThreadState::BLOCK_BITS)
    }

    /// Address of the FPU backup area, for holder-identity comparisons.
    pub(crate) fn fpu_area(&self) -> usize {
        self.fpu
            .as_ref()
            .map(|b| &**b as *const A::FpuContext as usize)
            .unwrap_or(0)
    }

    /// Drop every ownership this thread holds on wait channels.
    pub(crate) fn release_all_ownerships(&mut self) {
        let handle = self.handle();
        for channel in self.claims.drain(..) {
            channel.release_ownership(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::NoOpArch;

    #[test]
    fn block_bits_grouping() {
        let blocked = ThreadState::SUSP | ThreadState::PEND;
        assert!(blocked.intersects(ThreadState::BLOCK_BITS));
        assert!(!ThreadState::READY.intersects(ThreadState::BLOCK_BITS));
        assert!(ThreadState::RELAX.intersects(ThreadState::BLOCK_BITS));
    }

    #[test]
    fn mode_bits_grouping() {
        assert!(ThreadState::MODE_BITS
            .contains(ThreadState::LOCK | ThreadState::RRB | ThreadState::ASDI | ThreadState::SHIELD));
        assert!(!ThreadState::MODE_BITS.intersects(ThreadState::BLOCK_BITS));
    }

    #[test]
    fn fresh_tcb_defaults() {
        let tcb: Tcb<NoOpArch> = Tcb::new(
            3,
            17,
            String::from("worker"),
            42,
            ThreadState::FPU,
            None,
            0,
        );
        assert_eq!(tcb.handle(), ThreadHandle { idx: 3, serial: 17 });
        assert_eq!(tcb.current_priority(), 42);
        assert_eq!(tcb.base_priority(), 42);
        assert!(tcb.test_state(ThreadState::FPU));
        assert!(!tcb.blocked());
        assert_ne!(tcb.fpu_area(), 0);
        assert!(!tcb.rtimer.running());
    }
}
