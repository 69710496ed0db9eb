//! Thread lifecycle services.
//!
//! Creation, start, restart, deletion and abortion, mode and priority
//! changes, CPU migration, round-robin management, periodic release and
//! the fault trap. All of it mutates TCBs and per-CPU queues under the pod
//! lock, marks slots for re-picking, and lets the rescheduler apply the
//! result.

use super::{Guard, HookType, Pod, PodFlags};
use crate::arch::Arch;
use crate::cpumask::{CpuId, CpuSet};
use crate::errors::{Error, PodResult};
use crate::mem::StackSizeClass;
use crate::sched::{SlotFlags, ThreadKey};
use crate::thread::{
    Asr, SigMask, Tcb, ThreadEntry, ThreadHandle, ThreadInfo, ThreadState, INIT_FLAGS,
};
use crate::time::{Ticks, TimeoutMode, TICK_INFINITE};

use alloc::string::String;

/// Description of a trapped fault, filled in by the interrupt layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultInfo {
    /// The fault is an FPU-access trap
    pub fpu_fault: bool,
    /// The fault was taken in user mode
    pub user_fault: bool,
    /// The fault is a page fault
    pub page_fault: bool,
    /// Faulting program counter
    pub pc: usize,
    /// Architecture trap number
    pub trap: u32,
    /// Whether the host should be notified on relax
    pub notify: bool,
}

impl<A: Arch> Pod<A> {
    /// Initialize a new thread, left dormant until started.
    ///
    /// Only the FPU, SHADOW, SHIELD and SUSP creation flags are accepted.
    /// Kernel threads draw a stack of `stacksize` bytes (zero selects the
    /// default class) from the pod's stack pool. The thread is appended to
    /// the pod's thread list and immediately suspended on DORMANT, plus
    /// SUSP when requested. Never reschedules.
    pub fn init_thread(
        &self,
        name: &str,
        prio: crate::sched::Priority,
        flags: ThreadState,
        stacksize: usize,
    ) -> PodResult<ThreadHandle> {
        if !INIT_FLAGS.contains(flags) {
            return Err(Error::Inval);
        }

        let mut flags = flags;
        if self.bridge.is_none() {
            flags.remove(ThreadState::SHIELD);
        }

        let stack = if flags.contains(ThreadState::SHADOW) {
            None
        } else {
            let class = StackSizeClass::for_size(stacksize).ok_or(Error::Inval)?;
            Some(self.stack_pool.allocate(class).ok_or(Error::Nomem)?)
        };

        let mut g = self.state.lock_irqsave();
        if !g.status.contains(PodFlags::ACTIVE) {
            return Err(Error::NoSys);
        }

        let cpu = A::current_cpu();
        let name = String::from(name);
        // SUSP is excluded from the seed state so the suspension below
        // does the real blocking work.
        let seed = flags & (ThreadState::FPU | ThreadState::SHADOW | ThreadState::SHIELD);
        let key = g.insert_thread(|key, serial| Tcb::new(key, serial, name, prio, seed, stack, cpu));

        crate::trace!("pod: init thread {} prio {}", g.tcb(key).name(), prio);

        let handle = g.tcb(key).handle();
        let mask = ThreadState::DORMANT | (flags & ThreadState::SUSP);
        g = self.suspend_inner(g, key, mask, TICK_INFINITE, TimeoutMode::Relative, None);
        drop(g);

        Ok(handle)
    }

    /// Start a dormant thread, scheduling it for the first time.
    ///
    /// Latches the initial mode (LOCK, RRB, ASDI, SHIELD and SUSP are
    /// honored), the interrupt mask and the entry point with its cookie,
    /// binds the thread to a CPU within `affinity`, releases the initial
    /// dormant suspension, fires the start hooks and reschedules.
    pub fn start_thread(
        &self,
        thread: ThreadHandle,
        mode: ThreadState,
        imask: i32,
        affinity: CpuSet,
        entry: Option<ThreadEntry>,
        cookie: usize,
    ) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;

        if !g.tcb(key).test_state(ThreadState::DORMANT)
            || g.tcb(key).test_state(ThreadState::STARTED)
        {
            return Err(Error::Busy);
        }

        let online = CpuSet::online(g.slots.len());
        let affinity = affinity.and(g.affinity).and(online);
        if affinity.is_empty() {
            return Err(Error::Inval);
        }
        g.tcb_mut(key).affinity = affinity;

        if !affinity.contains(g.tcb(key).sched) {
            let dest = affinity.first().expect("non-empty affinity");
            self.rebind_slot(&mut g, key, dest);
        }

        let mut mode = mode;
        if self.bridge.is_none() {
            mode.remove(ThreadState::SHIELD);
        }

        {
            let tcb = g.tcb_mut(key);
            tcb.set_state((mode & (ThreadState::MODE_BITS | ThreadState::SUSP)) | ThreadState::STARTED);
            tcb.imask = imask;
            tcb.imode = mode & ThreadState::MODE_BITS;
            tcb.entry = entry;
            tcb.cookie = cookie;
            if tcb.test_state(ThreadState::RRB) {
                tcb.rrcredit = tcb.rrperiod;
            }
        }

        crate::trace!("pod: start thread {}", g.tcb(key).name());

        if g.tcb(key).test_state(ThreadState::SHADOW) {
            drop(g);
            if let Some(bridge) = self.bridge.as_deref() {
                bridge.shadow_start(thread);
            }
            self.schedule();
            return Ok(());
        }

        {
            let tcb = g.tcb_mut(key);
            let stack_top = tcb.stack.as_ref().map(|s| s.stack_bottom() as usize);
            A::init_context(&mut tcb.ctx, entry, cookie, imask, stack_top);
        }

        self.resume_inner(&mut g, key, ThreadState::DORMANT);

        if !g.tcb(key).test_state(ThreadState::ROOT) {
            self.fire_hooks(&mut g, HookType::Start, key);
        }

        g = self.do_schedule(g);
        drop(g);
        Ok(())
    }

    /// Restart a started thread from scratch.
    ///
    /// The thread is broken out of any wait, stripped of every
    /// synchronization-object ownership, wound back to its initial mode,
    /// priority and signal state, and its entry point is rerun with the
    /// original cookie. Restarting the root thread or a shadow is refused.
    pub fn restart_thread(&self, thread: ThreadHandle) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;

        if !g.tcb(key).test_state(ThreadState::STARTED) {
            return Ok(());
        }
        if g.tcb(key).test_state(ThreadState::ROOT | ThreadState::SHADOW) {
            return Err(Error::Perm);
        }

        crate::trace!("pod: restart thread {}", g.tcb(key).name());

        self.unblock_inner(&mut g, key);
        g.tcb_mut(key).release_all_ownerships();

        if g.tcb(key).test_state(ThreadState::SUSP) {
            self.resume_inner(&mut g, key, ThreadState::SUSP);
        }

        let old_level = g.level_of(key);
        {
            let tcb = g.tcb_mut(key);
            tcb.clear_state(ThreadState::MODE_BITS);
            let imode = tcb.imode;
            tcb.set_state(imode);
            tcb.cprio = tcb.iprio;
            tcb.bprio = tcb.iprio;
            tcb.signals = 0;
        }
        // The resume above queued the thread at its pre-reset priority;
        // reposition it so the queue and the effective priority agree.
        if g.tcb(key).test_state(ThreadState::READY) {
            let new_level = g.level_of(key);
            if new_level != old_level {
                let cpu = g.tcb(key).sched;
                g.slots[cpu].class.dequeue(key, old_level);
                g.slots[cpu].class.enqueue(key, new_level);
            }
        }

        let cpu = A::current_cpu();
        if g.slots[cpu].curr == key {
            // Self-restart: drop any scheduler lock depth and divert the
            // next pick through the restart path.
            let tcb = g.tcb_mut(key);
            if tcb.test_state(ThreadState::LOCK) {
                tcb.clear_state(ThreadState::LOCK);
                tcb.lock_count = 0;
            }
            tcb.set_state(ThreadState::RESTART);
        }

        {
            let tcb = g.tcb_mut(key);
            let entry = tcb.entry;
            let cookie = tcb.cookie;
            let imask = tcb.imask;
            let stack_top = tcb.stack.as_ref().map(|s| s.stack_bottom() as usize);
            A::init_context(&mut tcb.ctx, entry, cookie, imask, stack_top);
        }

        // Not necessarily self-directed: the caller's priority may be
        // lower than the restarted thread's.
        g = self.do_schedule(g);
        drop(g);
        Ok(())
    }

    /// Delete a thread and release every pod resource it holds.
    ///
    /// Idempotent on an already dying thread. Deleting the current thread
    /// parks it as the slot's zombie and schedules out; the control block
    /// is finalized from the next thread's path. A live user-space shadow
    /// is deleted asynchronously: its mate takes a lethal signal and the
    /// teardown happens on the mate's exit path.
    pub fn delete_thread(&self, thread: ThreadHandle) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = match g.resolve(thread) {
            Ok(key) => key,
            // Double-deletion is a no-op.
            Err(_) => return Ok(()),
        };
        if g.tcb(key).test_state(ThreadState::ROOT) {
            self.fatal_in(&mut g, "attempt to delete the root thread");
        }
        g = self.delete_inner(g, key);
        drop(g);
        Ok(())
    }

    pub(crate) fn delete_inner<'a>(&'a self, mut g: Guard<'a, A>, key: ThreadKey) -> Guard<'a, A> {
        if g.tcb(key).test_state(ThreadState::ZOMBIE) {
            return g;
        }

        let cpu = g.tcb(key).sched;

        // A live shadow is dismantled from its own exit path: signal the
        // mate and let it come back through here when it dies.
        if g.tcb(key).test_state(ThreadState::SHADOW)
            && g.tcb(key).user_pid.is_some()
            && !g.tcb(key).test_state(ThreadState::DORMANT)
            && !g.is_curr(key)
        {
            if let Some(bridge) = self.bridge.as_deref() {
                let handle = g.tcb(key).handle();
                bridge.shadow_send_sig(handle, true);
                return g;
            }
        }

        crate::trace!("pod: delete thread {}", g.tcb(key).name());

        g.unlink_thread(key);

        if g.tcb(key).test_state(ThreadState::READY) {
            let level = g.level_of(key);
            g.slots[cpu].class.dequeue(key, level);
            g.tcb_mut(key).clear_state(ThreadState::READY);
        }

        g.tcb_mut(key).rtimer.stop();
        g.tcb_mut(key).ptimer.stop();

        if g.tcb(key).test_state(ThreadState::PEND) {
            g.forget_sleeper(key);
        }

        g.tcb_mut(key).release_all_ownerships();

        self.giveup_fpu(&mut g, cpu, key);

        g.tcb_mut(key).set_state(ThreadState::ZOMBIE);

        if g.slots[cpu].curr == key {
            // Pick a successor before the corpse can be torn down; the
            // rescheduler parks it on the slot and the next thread's
            // path finalizes it.
            g.set_resched(cpu);
            g = self.do_schedule(g);
        } else if !(A::UNLOCKED_SWITCH
            && (g.slots[cpu].status.contains(SlotFlags::SWLOCK)
                || g.tcb(key).test_state(ThreadState::MIGRATE)))
        {
            // Not current, not in flight: tear down in place. The control
            // block stays valid until the delete hooks have run.
            self.fire_hooks(&mut g, HookType::Delete, key);
            self.cleanup_tcb(&mut g, key);
        }
        // A thread mid-switch or mid-migration with the lock dropped is
        // caught by the post-switch reconciliation instead.

        g
    }

    /// Forcibly terminate a thread, wherever it stands.
    ///
    /// A non-current target is first frozen by an unconditional dormant
    /// suspension, then deleted; self-abortion is a plain self-deletion.
    pub fn abort_thread(&self, thread: ThreadHandle) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = match g.resolve(thread) {
            Ok(key) => key,
            Err(_) => return Ok(()),
        };
        if g.tcb(key).test_state(ThreadState::ROOT) {
            self.fatal_in(&mut g, "attempt to delete the root thread");
        }
        if !g.is_curr(key) {
            g = self.suspend_inner(
                g,
                key,
                ThreadState::DORMANT,
                TICK_INFINITE,
                TimeoutMode::Relative,
                None,
            );
        }
        g = self.delete_inner(g, key);
        drop(g);
        Ok(())
    }

    /// Change a thread's control mode; returns the previous mode bits.
    ///
    /// Setting LOCK on the current thread grabs the scheduler lock;
    /// clearing it resets the nesting count. Newly setting RRB refreshes
    /// the round-robin credit. Toggling SHIELD on the current shadow
    /// re-applies the interrupt shield. Never reschedules: the caller
    /// should when clearing LOCK.
    pub fn set_thread_mode(
        &self,
        thread: ThreadHandle,
        clrmask: ThreadState,
        setmask: ThreadState,
    ) -> PodResult<ThreadState> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;

        let mut setmask = setmask;
        if self.bridge.is_none() {
            setmask.remove(ThreadState::SHIELD);
        }

        let curr = g.slots[A::current_cpu()].curr;
        let oldmode = g.tcb(key).state() & ThreadState::MODE_BITS;

        {
            let tcb = g.tcb_mut(key);
            tcb.clear_state(clrmask & ThreadState::MODE_BITS);
            tcb.set_state(setmask & ThreadState::MODE_BITS);
        }

        if curr == key {
            if !oldmode.contains(ThreadState::LOCK) {
                if g.tcb(key).test_state(ThreadState::LOCK) {
                    g.tcb_mut(key).lock_count = 1;
                }
            } else if !g.tcb(key).test_state(ThreadState::LOCK) {
                g.tcb_mut(key).lock_count = 0;
            }
        }

        if !oldmode.contains(ThreadState::RRB) && g.tcb(key).test_state(ThreadState::RRB) {
            let tcb = g.tcb_mut(key);
            tcb.rrcredit = tcb.rrperiod;
        }

        let is_shadow = g.tcb(key).test_state(ThreadState::SHADOW);
        drop(g);

        if curr == key
            && is_shadow
            && (clrmask | setmask).intersects(ThreadState::SHIELD)
        {
            if let Some(bridge) = self.bridge.as_deref() {
                bridge.shadow_reset_shield();
            }
        }

        Ok(oldmode)
    }

    /// Change a thread's base priority.
    ///
    /// The effective priority follows unless a priority-inheritance boost
    /// is in progress and the new value would lower it. A pending thread
    /// is reordered in its wait channel when the channel allows it; a
    /// runnable, non-scheduler-locked thread is repositioned in the ready
    /// queue. Reniceing to the same priority moves a runnable thread to
    /// the end of its group. Never reschedules.
    pub fn renice_thread(&self, thread: ThreadHandle, prio: crate::sched::Priority) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;

        let oldprio = g.tcb(key).cprio;
        let old_level = g.level_of(key);
        g.tcb_mut(key).bprio = prio;

        // Never lower a boosted thread's effective priority from here;
        // the inheritance protocol owns it.
        if !g.tcb(key).test_state(ThreadState::BOOST) || prio > oldprio {
            g.tcb_mut(key).cprio = prio;

            if prio != oldprio {
                if let Some(channel) = g.tcb(key).wchan.clone() {
                    if !channel.deny_reorder() {
                        let handle = g.tcb(key).handle();
                        channel.reorder_sleeper(handle, prio);
                    }
                }
            }

            if !g
                .tcb(key)
                .test_state(ThreadState::BLOCK_BITS | ThreadState::LOCK)
            {
                let cpu = g.tcb(key).sched;
                if g.tcb(key).test_state(ThreadState::READY) {
                    let new_level = g.level_of(key);
                    g.slots[cpu].class.dequeue(key, old_level);
                    g.slots[cpu].class.enqueue(key, new_level);
                }
                g.set_resched(cpu);
            }
        }

        if g.tcb(key).test_state(ThreadState::SHADOW) {
            // Propagation to the user-space mate happens on its next
            // transition; just mark the request.
            g.tcb_mut(key).set_info(ThreadInfo::PRIOSET);
        }

        Ok(())
    }

    /// Migrate the current thread to another CPU within its affinity.
    ///
    /// Self-migration only. The source slot releases the FPU state and
    /// marks itself for a re-pick; the thread's slot binding and periodic
    /// timer move to the destination, and the thread is enqueued remotely
    /// (directly, or from the post-switch path on unlocked-switch
    /// architectures). Execution-time statistics restart on the new CPU.
    pub fn migrate_thread(&self, cpu: CpuId) -> PodResult<()> {
        if A::in_interrupt() {
            return Err(Error::Perm);
        }

        let mut g = self.state.lock_irqsave();
        let here = A::current_cpu();
        let key = g.slots[here].curr;

        if g.tcb(key).test_state(ThreadState::LOCK) {
            return Err(Error::Busy);
        }
        if cpu >= g.slots.len() || !g.tcb(key).affinity.contains(cpu) {
            return Err(Error::Perm);
        }
        if cpu == here {
            return Ok(());
        }

        crate::trace!("pod: migrate {} -> cpu {}", g.tcb(key).name(), cpu);

        self.release_fpu(&mut g, key);

        if g.tcb(key).test_state(ThreadState::READY) {
            let level = g.level_of(key);
            g.slots[here].class.dequeue(key, level);
            g.tcb_mut(key).clear_state(ThreadState::READY);
        }

        g.set_resched(here);
        g.tcb_mut(key).sched = cpu;
        g.tcb_mut(key).ptimer.set_sched(cpu);

        if A::UNLOCKED_SWITCH {
            // In flight: the post-switch reconciliation enqueues the
            // thread on the remote slot.
            g.tcb_mut(key).set_state(ThreadState::MIGRATE);
        } else {
            let level = g.level_of(key);
            g.slots[cpu].class.enqueue(key, level);
            g.tcb_mut(key).set_state(ThreadState::READY);
            g.set_resched(cpu);
        }

        g = self.do_schedule(g);

        // Fresh accounting period, so per-CPU statistics stay coherent.
        let now = g.tbase.rawclock();
        g.tcb_mut(key).stat.exec_start = now;

        drop(g);
        Ok(())
    }

    /// Lock the scheduler on the current CPU; nests.
    pub fn lock_sched(&self) {
        let mut g = self.state.lock_irqsave();
        let key = g.slots[A::current_cpu()].curr;
        let tcb = g.tcb_mut(key);
        tcb.lock_count += 1;
        if tcb.lock_count == 1 {
            tcb.set_state(ThreadState::LOCK);
        }
    }

    /// Undo one [`Pod::lock_sched`]; the outermost unlock reschedules.
    pub fn unlock_sched(&self) {
        let mut g = self.state.lock_irqsave();
        let key = g.slots[A::current_cpu()].curr;
        let tcb = g.tcb_mut(key);
        if tcb.lock_count == 0 {
            return;
        }
        tcb.lock_count -= 1;
        if tcb.lock_count == 0 {
            tcb.clear_state(ThreadState::LOCK);
            g.set_resched(A::current_cpu());
            g = self.do_schedule(g);
        }
        drop(g);
    }

    // ------------------------------------------------------------------
    // Round-robin
    // ------------------------------------------------------------------

    /// Give every round-robin thread a fresh time quantum.
    ///
    /// Quantum decrement and preemption on exhaustion are the scheduling
    /// class's business; this only loads the credits.
    pub fn activate_rr(&self, quantum: Ticks) {
        let mut g = self.state.lock_irqsave();
        for key in g.order.clone() {
            let tcb = g.tcb_mut(key);
            if tcb.test_state(ThreadState::RRB) {
                tcb.rrperiod = quantum;
                tcb.rrcredit = quantum;
            }
        }
    }

    /// Lift the quantum bound from round-robin threads. The policy stays
    /// attached; the credit just becomes unbounded.
    pub fn deactivate_rr(&self) {
        let mut g = self.state.lock_irqsave();
        for key in g.order.clone() {
            let tcb = g.tcb_mut(key);
            if tcb.test_state(ThreadState::RRB) {
                tcb.rrcredit = TICK_INFINITE;
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic release
    // ------------------------------------------------------------------

    /// Program a thread's periodic release line.
    ///
    /// `idate` is the absolute first release point on the adjustable
    /// clock, or [`TICK_INFINITE`] to start one period from now. A period
    /// of [`TICK_INFINITE`] stops the periodic timer. Periods below the
    /// intrinsic latency figure are rejected. With an explicit `idate`,
    /// the target thread is delayed until that point.
    pub fn set_thread_periodic(
        &self,
        thread: ThreadHandle,
        idate: Ticks,
        period: Ticks,
    ) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;

        if !g.tbase.running() {
            return Err(Error::WouldBlock);
        }

        if period == TICK_INFINITE {
            if g.tcb(key).ptimer.running() {
                g.tcb_mut(key).ptimer.stop();
            }
            return Ok(());
        }
        if period < g.latency {
            // Periods below the scheduling latency cannot be met.
            return Err(Error::Inval);
        }

        let cpu = g.tcb(key).sched;
        let now = g.tbase.rawclock();
        let offset = g.tbase.wallclock_offset();
        g.tcb_mut(key).ptimer.set_sched(cpu);

        if idate == TICK_INFINITE {
            let _ = g
                .tcb_mut(key)
                .ptimer
                .start(now, offset, period, period, TimeoutMode::Relative);
        } else {
            if g
                .tcb_mut(key)
                .ptimer
                .start(now, offset, idate, period, TimeoutMode::Realtime)
                .is_err()
            {
                return Err(Error::TimedOut);
            }
            // The first wait targets the release after idate; overruns
            // before it would otherwise be lost.
            g.tcb_mut(key).ptimer.pexpect_forward();
            g = self.suspend_inner(
                g,
                key,
                ThreadState::DELAY,
                TICK_INFINITE,
                TimeoutMode::Relative,
                None,
            );
        }

        drop(g);
        Ok(())
    }

    /// Wait for the current thread's next periodic release point.
    ///
    /// `overruns` receives the count of missed release points on success
    /// or on a [`Error::TimedOut`] outcome; a broken wait reports
    /// [`Error::Intr`] and leaves it untouched.
    pub fn wait_thread_period(&self, overruns: &mut u64) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let cpu = A::current_cpu();
        let key = g.slots[cpu].curr;

        if !g.tcb(key).ptimer.running() {
            return Err(Error::WouldBlock);
        }

        let mut now = g.tbase.rawclock();
        if now < g.tcb(key).ptimer.pexpect() {
            g = self.suspend_inner(
                g,
                key,
                ThreadState::DELAY,
                TICK_INFINITE,
                TimeoutMode::Relative,
                None,
            );
            if g.tcb(key).test_info(ThreadInfo::BREAK) {
                return Err(Error::Intr);
            }
            now = g.tbase.rawclock();
        }

        let missed = g.tcb_mut(key).ptimer.get_overruns(now);
        *overruns = missed;
        if missed > 0 {
            crate::trace!("pod: {} missed {} release point(s)", g.tcb(key).name(), missed);
            return Err(Error::TimedOut);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Asynchronous signals
    // ------------------------------------------------------------------

    /// Install (or clear) a thread's asynchronous service routine.
    pub fn set_thread_asr(
        &self,
        thread: ThreadHandle,
        asr: Option<Asr>,
        asrmode: ThreadState,
        asrimask: i32,
    ) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;
        let tcb = g.tcb_mut(key);
        tcb.asr = asr;
        tcb.asrmode = asrmode & ThreadState::MODE_BITS;
        tcb.asrimask = asrimask;
        Ok(())
    }

    /// Pend asynchronous signals on a thread; they are delivered from the
    /// scheduler's epilogue the next time the thread resumes.
    pub fn post_signals(&self, thread: ThreadHandle, signals: SigMask) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;
        g.tcb_mut(key).signals |= signals;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Collaborator bookkeeping
    // ------------------------------------------------------------------

    /// Record that a thread took ownership of a wait channel, so restart
    /// and deletion can strip it again.
    pub fn claim_channel(
        &self,
        thread: ThreadHandle,
        channel: alloc::sync::Arc<dyn crate::synch::WaitChannel>,
    ) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;
        g.tcb_mut(key).claims.push(channel);
        Ok(())
    }

    /// Bind a shadow thread to its user-space mate's PID. Installed by the
    /// bridge once the mate is mapped; deletion of a live shadow defers to
    /// that mate's exit path.
    pub fn bind_shadow(&self, thread: ThreadHandle, pid: i32) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;
        if !g.tcb(key).test_state(ThreadState::SHADOW) {
            return Err(Error::Perm);
        }
        g.tcb_mut(key).user_pid = Some(pid);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fault path
    // ------------------------------------------------------------------

    /// Default handler for uncontrolled exceptions and faults.
    ///
    /// Returns whether the fault was absorbed by the pod. Faults taken in
    /// an idle non-interrupt context propagate to the host. An FPU-use
    /// trap by a shadow whose FPU was never initialized brings the FPU up
    /// and absorbs the fault; FPU use by a thread without the FPU
    /// capability is fatal. A faulting kernel thread is frozen on an
    /// indefinite suspension; a faulting shadow is relaxed so the host can
    /// process the exception.
    pub fn trap_fault(&self, info: &FaultInfo) -> bool {
        let mut g = self.state.lock_irqsave();

        if !g.status.contains(PodFlags::ACTIVE) {
            return false;
        }

        let cpu = A::current_cpu();
        let key = g.slots[cpu].curr;

        if !A::in_interrupt() && key == g.slots[cpu].root {
            return false;
        }

        crate::trace!(
            "pod: fault on {} at {:#x} (trap {})",
            g.tcb(key).name(),
            info.pc,
            info.trap
        );

        if info.fpu_fault {
            if self.fault_init_fpu(&mut g, key) {
                return true;
            }
            if !g.tcb(key).test_state(ThreadState::FPU) {
                self.fatal_in(&mut g, "invalid use of FPU in a non-FPU thread");
            }
        }

        if !g.tcb(key).test_state(ThreadState::SHADOW) && !info.user_fault {
            // Freeze the kernel thread where it faulted; a debugger or a
            // skin-level recovery may resume it later.
            g = self.suspend_inner(
                g,
                key,
                ThreadState::SUSP,
                TICK_INFINITE,
                TimeoutMode::Relative,
                None,
            );
            drop(g);
            return true;
        }

        if g.tcb(key).test_state(ThreadState::SHADOW) {
            if info.page_fault {
                g.tcb_mut(key).stat.pf += 1;
            }
            let notify = info.notify;
            drop(g);
            if let Some(bridge) = self.bridge.as_deref() {
                // Hand the exception to the host by relaxing the shadow.
                bridge.shadow_relax(notify);
            }
            return false;
        }

        false
    }

    /// A shadow touching the FPU for the first time gets its context
    /// initialized in place.
    #[cfg(feature = "full-fpu")]
    fn fault_init_fpu(&self, g: &mut Guard<'_, A>, key: ThreadKey) -> bool {
        if !g.tcb(key).test_state(ThreadState::SHADOW) || g.tcb(key).fpu.is_some() {
            return false;
        }
        let mut fpu = alloc::boxed::Box::new(A::FpuContext::default());
        A::init_fpu(&mut fpu);
        {
            let tcb = g.tcb_mut(key);
            tcb.fpu = Some(fpu);
            tcb.set_state(ThreadState::FPU);
        }
        let cpu = g.tcb(key).sched;
        g.slots[cpu].fpuholder = Some(key);
        true
    }

    #[cfg(not(feature = "full-fpu"))]
    fn fault_init_fpu(&self, _g: &mut Guard<'_, A>, _key: ThreadKey) -> bool {
        false
    }

    /// Rebind a never-run thread to another slot, moving its timers along.
    fn rebind_slot(&self, g: &mut Guard<'_, A>, key: ThreadKey, cpu: CpuId) {
        let tcb = g.tcb_mut(key);
        tcb.sched = cpu;
        tcb.rtimer.set_sched(cpu);
        tcb.ptimer.set_sched(cpu);
    }
}
