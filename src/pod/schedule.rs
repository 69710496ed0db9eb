//! The central rescheduling procedure.
//!
//! `schedule` validates and applies changes previously made to the
//! scheduling state: it tests the slot's resched mask, relays remote
//! requests as IPIs, asks the scheduling class for the next thread,
//! performs the context switch with FPU handover, finalizes zombies, fires
//! switch hooks and delivers pending asynchronous signals. Most state
//! mutators are lazy and rely on a later `schedule` call; anything that
//! suspends or deletes the current thread calls it on the spot.

use super::{Guard, HookType, Pod};
use crate::arch::Arch;
use crate::cpumask::{CpuId, CpuSet};
use crate::sched::{SlotFlags, ThreadKey};
use crate::thread::{ThreadHandle, ThreadState};

impl<A: Arch> Pod<A> {
    /// Rescheduling procedure entry point.
    ///
    /// A no-op from interrupt or callout context: the request is escalated
    /// or deferred instead. Any scheduler lock held by the outgoing thread
    /// is preserved and reasserted when it is scheduled back in.
    pub fn schedule(&self) {
        if A::escalate() {
            return;
        }
        let g = self.state.lock_irqsave();
        let g = self.do_schedule(g);
        drop(g);
    }

    pub(crate) fn do_schedule<'a>(&'a self, mut g: Guard<'a, A>) -> Guard<'a, A> {
        loop {
            let cpu = A::current_cpu();
            if cpu >= g.slots.len() {
                return g;
            }

            // Callouts and ASRs run with the slot flagged; their
            // rescheduling intent stays recorded in the resched mask.
            if g.slots[cpu].status.contains(SlotFlags::KCOUT) {
                return g;
            }

            let _need_resched = self.test_resched(&mut g, cpu);

            let curr = g.slots[cpu].curr;
            let zombie = g.tcb(curr).test_state(ThreadState::ZOMBIE);

            let next = self.pick_next(&mut g, cpu);
            if next == curr && !g.tcb(curr).test_state(ThreadState::RESTART) {
                // The root thread never restarts.
                self.dispatch_signals(&mut g, cpu);
                return g;
            }

            let prev = curr;
            let shadow = g.tcb(prev).test_state(ThreadState::SHADOW);

            crate::trace!(
                "pod: switch {} -> {} on cpu {}",
                g.tcb(prev).name(),
                g.tcb(next).name(),
                cpu
            );

            if g.tcb(next).test_state(ThreadState::ROOT) {
                g.slots[cpu].reset_watchdog();
            }

            if zombie {
                // Fire the delete chain while the control block is intact,
                // then park the corpse for post-switch finalization.
                self.fire_hooks(&mut g, HookType::Delete, prev);
                g.slots[cpu].zombie = Some(prev);
            }

            g.slots[cpu].curr = next;

            if g.tcb(prev).test_state(ThreadState::ROOT) {
                let tcb = g.tcb_mut(prev);
                A::leave_root(&mut tcb.ctx);
            } else if g.tcb(next).test_state(ThreadState::ROOT) {
                let tcb = g.tcb_mut(next);
                A::enter_root(&mut tcb.ctx);
            }

            let now = g.tbase.rawclock();
            {
                let tcb = g.tcb_mut(prev);
                tcb.stat.exec_total += now.saturating_sub(tcb.stat.exec_start);
            }
            {
                let tcb = g.tcb_mut(next);
                tcb.stat.exec_start = now;
                tcb.stat.csw += 1;
            }

            let prev_ctx: *mut A::Context = &mut g.tcb_mut(prev).ctx;
            let next_ctx: *mut A::Context = &mut g.tcb_mut(next).ctx;

            if A::UNLOCKED_SWITCH {
                g.slots[cpu].last = Some(prev);
                g.slots[cpu].status.insert(SlotFlags::SWLOCK);
                drop(g);
                // The arena boxes the control blocks, so both context
                // pointers stay valid across the unlocked window.
                unsafe { A::switch_to(prev_ctx, next_ctx) };
                g = self.state.lock_irqsave();
                self.finish_unlocked_switch(&mut g);
            } else {
                unsafe { A::switch_to(prev_ctx, next_ctx) };
            }

            // The running thread conceptually changed across the switch;
            // re-read the slot (relax/harden transitions may even have
            // moved us to another CPU).
            let cpu = A::current_cpu();
            let curr = g.slots[cpu].curr;

            if shadow && g.tcb(curr).test_state(ThreadState::ROOT) {
                // Epilogue of a relaxing shadow: execution is being handed
                // to the secondary scheduler. Reap a deleted mate, skip
                // the normal epilogue.
                if let Some(bridge) = self.bridge.as_deref() {
                    if bridge.shadow_exit_pending() {
                        drop(g);
                        bridge.shadow_exit();
                        return self.state.lock_irqsave();
                    }
                }
                return g;
            }

            if g.tcb(curr).test_state(ThreadState::ZOMBIE) {
                self.fatal_in(&mut g, "zombie thread would not die");
            }

            self.finalize_zombie(&mut g, cpu);
            self.switch_fpu(&mut g, cpu);

            if !g.tcb(curr).test_state(ThreadState::ROOT) {
                self.fire_hooks(&mut g, HookType::Switch, curr);
            }

            self.dispatch_signals(&mut g, cpu);

            // With the lock dropped mid-switch, new requests may have
            // landed on this slot; honor them before leaving.
            if !(A::UNLOCKED_SWITCH && g.slots[A::current_cpu()].resched_pending()) {
                return g;
            }
        }
    }

    /// Consume the slot's own resched bit; relay remaining bits to their
    /// CPUs as rescheduling IPIs.
    fn test_resched(&self, g: &mut Guard<'_, A>, cpu: CpuId) -> bool {
        let slot = &mut g.slots[cpu];
        let resched = slot.resched.contains(cpu);
        slot.resched.clear(cpu);
        if !slot.resched.is_empty() {
            A::send_ipi(slot.resched);
            slot.resched = CpuSet::empty();
        }
        resched
    }

    /// Choose the thread to run next on `cpu`.
    ///
    /// A runnable current thread holding the scheduler lock short-circuits
    /// the pick. Otherwise a runnable current thread goes back to its
    /// priority group first (head of the group, or tail when its
    /// round-robin quantum just expired) and the class picks the leader of
    /// the highest group.
    fn pick_next(&self, g: &mut Guard<'_, A>, cpu: CpuId) -> ThreadKey {
        let curr = g.slots[cpu].curr;
        let runnable =
            !g.tcb(curr).blocked() && !g.tcb(curr).test_state(ThreadState::ZOMBIE);

        if runnable && g.tcb(curr).test_state(ThreadState::LOCK) {
            return curr;
        }

        if runnable && !g.tcb(curr).test_state(ThreadState::READY) {
            let level = g.level_of(curr);
            if g.tcb(curr).rr_expired {
                g.tcb_mut(curr).rr_expired = false;
                g.slots[cpu].class.enqueue(curr, level);
            } else {
                g.slots[cpu].class.requeue(curr, level);
            }
            g.tcb_mut(curr).set_state(ThreadState::READY);
        }

        let root = g.slots[cpu].root;
        let next = g.slots[cpu].class.pick_next().unwrap_or(root);
        g.tcb_mut(next).clear_state(ThreadState::READY);
        next
    }

    /// Reconcile slot state after an unlocked switch: adopt a corpse the
    /// outgoing thread left behind, or finish a migration that was in
    /// flight while the lock was released.
    fn finish_unlocked_switch(&self, g: &mut Guard<'_, A>) {
        let cpu = A::current_cpu();
        g.slots[cpu].status.remove(SlotFlags::SWLOCK);
        if let Some(last) = g.slots[cpu].last.take() {
            if g.tcb(last).test_state(ThreadState::ZOMBIE) {
                let home = g.tcb(last).sched;
                g.slots[home].zombie = Some(last);
            } else if g.tcb(last).test_state(ThreadState::MIGRATE) {
                g.tcb_mut(last).clear_state(ThreadState::MIGRATE);
                let dest = g.tcb(last).sched;
                let level = g.level_of(last);
                g.slots[dest].class.enqueue(last, level);
                g.tcb_mut(last).set_state(ThreadState::READY);
                g.set_resched(dest);
            }
        }
    }

    /// Destroy the corpse parked on the slot, now that a new thread runs.
    pub(crate) fn finalize_zombie(&self, g: &mut Guard<'_, A>, cpu: CpuId) {
        if let Some(zombie) = g.slots[cpu].zombie.take() {
            self.cleanup_tcb(g, zombie);
        }
    }

    /// Tear a control block down: recycle the kernel stack, let the
    /// architecture reclaim the context, release the arena entry.
    pub(crate) fn cleanup_tcb(&self, g: &mut Guard<'_, A>, key: ThreadKey) {
        let mut tcb = g.free_entry(key);
        if let Some(stack) = tcb.stack.take() {
            self.stack_pool.recycle(stack);
        }
        A::finalize_no_switch(&mut tcb.ctx);
        crate::trace!("pod: finalized {}", tcb.name());
    }

    /// Thread prologue, run before a (re)started thread reaches its entry
    /// point: finish any unlocked switch, drain the zombie slot, reassert
    /// the scheduler lock, bring the FPU up for first use and deliver
    /// pending signals.
    pub fn welcome_thread(&self, thread: ThreadHandle, imask: i32) {
        let mut g = self.state.lock_irqsave();
        let key = match g.resolve(thread) {
            Ok(key) => key,
            Err(_) => return,
        };
        let cpu = A::current_cpu();

        if A::UNLOCKED_SWITCH {
            self.finish_unlocked_switch(&mut g);
        }
        self.finalize_zombie(&mut g, cpu);

        if g.tcb(key).test_state(ThreadState::LOCK) && g.tcb(key).lock_count == 0 {
            g.tcb_mut(key).lock_count = 1;
        }

        self.init_fpu_on_welcome(&mut g, cpu, key);

        g.tcb_mut(key).clear_state(ThreadState::RESTART);

        self.dispatch_signals(&mut g, cpu);
        drop(g);

        A::set_irq_mask(imask);

        if A::UNLOCKED_SWITCH {
            self.schedule_deferred();
        }
    }

    // ------------------------------------------------------------------
    // FPU handover
    // ------------------------------------------------------------------

    /// Make the current thread's FPU context live, saving the previous
    /// holder's state as needed.
    #[cfg(feature = "full-fpu")]
    pub(crate) fn switch_fpu(&self, g: &mut Guard<'_, A>, cpu: CpuId) {
        let curr = g.slots[cpu].curr;
        if !g.tcb(curr).test_state(ThreadState::FPU) {
            return;
        }

        match g.slots[cpu].fpuholder {
            Some(holder) if holder == curr => A::enable_fpu(),
            holder => {
                let same_area = holder
                    .map(|h| g.tcb(h).fpu_area() == g.tcb(curr).fpu_area())
                    .unwrap_or(false);
                if !same_area {
                    if let Some(h) = holder {
                        if let Some(fpu) = g.tcb_mut(h).fpu.as_deref_mut() {
                            unsafe { A::save_fpu(fpu) };
                        }
                    }
                    if let Some(fpu) = g.tcb(curr).fpu.as_deref() {
                        unsafe { A::restore_fpu(fpu) };
                    }
                } else {
                    A::enable_fpu();
                }
                g.slots[cpu].fpuholder = Some(curr);
            }
        }
    }

    #[cfg(not(feature = "full-fpu"))]
    pub(crate) fn switch_fpu(&self, _g: &mut Guard<'_, A>, _cpu: CpuId) {}

    /// First-run FPU bring-up: a thread created FPU-enabled that never ran
    /// was not switched out by the rescheduler, so its context is
    /// initialized here instead of the regular handover.
    #[cfg(feature = "full-fpu")]
    fn init_fpu_on_welcome(&self, g: &mut Guard<'_, A>, cpu: CpuId, key: ThreadKey) {
        if !g.tcb(key).test_state(ThreadState::FPU) {
            return;
        }
        if let Some(holder) = g.slots[cpu].fpuholder {
            if g.tcb(holder).fpu_area() != g.tcb(key).fpu_area() {
                if let Some(fpu) = g.tcb_mut(holder).fpu.as_deref_mut() {
                    unsafe { A::save_fpu(fpu) };
                }
            }
        }
        if let Some(fpu) = g.tcb_mut(key).fpu.as_deref_mut() {
            A::init_fpu(fpu);
        }
        g.slots[cpu].fpuholder = Some(key);
    }

    #[cfg(not(feature = "full-fpu"))]
    fn init_fpu_on_welcome(&self, _g: &mut Guard<'_, A>, _cpu: CpuId, _key: ThreadKey) {}

    /// The thread no longer holds this slot's FPU (deletion path).
    #[cfg(feature = "full-fpu")]
    pub(crate) fn giveup_fpu(&self, g: &mut Guard<'_, A>, cpu: CpuId, key: ThreadKey) {
        if g.slots[cpu].fpuholder == Some(key) {
            g.slots[cpu].fpuholder = None;
        }
    }

    #[cfg(not(feature = "full-fpu"))]
    pub(crate) fn giveup_fpu(&self, _g: &mut Guard<'_, A>, _cpu: CpuId, _key: ThreadKey) {}

    /// Force the thread's FPU state out of its slot (migration path), so
    /// the holder pointer cannot dangle into a backup area that leaves
    /// with the thread.
    #[cfg(feature = "full-fpu")]
    pub(crate) fn release_fpu(&self, g: &mut Guard<'_, A>, key: ThreadKey) {
        if g.tcb(key).test_state(ThreadState::FPU) {
            if let Some(fpu) = g.tcb_mut(key).fpu.as_deref_mut() {
                unsafe { A::save_fpu(fpu) };
            }
            let cpu = g.tcb(key).sched;
            g.slots[cpu].fpuholder = None;
        }
    }

    #[cfg(not(feature = "full-fpu"))]
    pub(crate) fn release_fpu(&self, _g: &mut Guard<'_, A>, _key: ThreadKey) {}

    // ------------------------------------------------------------------
    // Asynchronous signals
    // ------------------------------------------------------------------

    /// Deliver pending signals of the current thread to its ASR.
    ///
    /// The pending mask is snapshotted and cleared first (ASRs can be
    /// reentered), the thread's mode is swapped for its ASR mode, the
    /// interrupt mask set for the delivery, and everything restored after
    /// the routine returns. ASDI suppresses delivery.
    pub(crate) fn dispatch_signals(&self, g: &mut Guard<'_, A>, cpu: CpuId) {
        let key = g.slots[cpu].curr;
        let tcb = g.tcb(key);
        if tcb.signals == 0 || tcb.test_state(ThreadState::ASDI) || tcb.asr.is_none() {
            return;
        }

        let asr = tcb.asr.unwrap();
        let asrimask = tcb.asrimask;
        let asrmode = tcb.asrmode & ThreadState::MODE_BITS;
        let oldmode = tcb.state() & ThreadState::MODE_BITS;
        let sigs = tcb.signals;

        crate::trace!("pod: dispatch signals {:#x} to {}", sigs, tcb.name());

        {
            let tcb = g.tcb_mut(key);
            tcb.signals = 0;
            tcb.clear_state(ThreadState::MODE_BITS);
            tcb.set_state(asrmode);
            tcb.asrlevel += 1;
        }

        let saved = A::set_irq_mask(asrimask);
        asr(sigs);
        A::set_irq_mask(saved);

        let tcb = g.tcb_mut(key);
        tcb.asrlevel -= 1;
        tcb.clear_state(ThreadState::MODE_BITS);
        tcb.set_state(oldmode);
    }
}
