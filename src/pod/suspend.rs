//! Suspend, resume, unblock.
//!
//! These are the state-machine edges driven by external events: timeouts,
//! signals and resource grants. `suspend` may reschedule when it hits the
//! current thread; `resume` and `unblock` never do, so callers can batch
//! several state edits before invoking the rescheduler once.

use super::{Guard, Pod};
use crate::arch::Arch;
use crate::errors::PodResult;
use crate::sched::ThreadKey;
use crate::synch::WaitChannel;
use crate::thread::{ThreadHandle, ThreadInfo, ThreadState};
use crate::time::{Ticks, TimeoutMode, TICK_INFINITE};

use alloc::sync::Arc;

impl<A: Arch> Pod<A> {
    /// Add suspensive conditions to a thread.
    ///
    /// The thread stays ineligible for scheduling until every condition
    /// accumulated here is removed by matching [`Pod::resume_thread`]
    /// calls. A finite `timeout` arms the thread's resume timer and adds
    /// DELAY; an absolute deadline already in the past short-circuits to
    /// the TIMEO outcome without blocking. `wchan` attaches the thread to
    /// the synchronization object it pends on.
    ///
    /// Suspending the current thread enters the rescheduler before
    /// returning.
    pub fn suspend_thread(
        &self,
        thread: ThreadHandle,
        mask: ThreadState,
        timeout: Ticks,
        timeout_mode: TimeoutMode,
        wchan: Option<Arc<dyn WaitChannel>>,
    ) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;

        if g.tcb(key).test_state(ThreadState::ROOT) {
            self.fatal_in(&mut g, "attempt to suspend the root thread");
        }
        if g.tcb(key).wchan.is_some() && wchan.is_some() {
            self.fatal_in(&mut g, "thread attempts a conjunctive wait");
        }

        g = self.suspend_inner(g, key, mask, timeout, timeout_mode, wchan);
        drop(g);
        Ok(())
    }

    pub(crate) fn suspend_inner<'a>(
        &'a self,
        mut g: Guard<'a, A>,
        key: ThreadKey,
        mask: ThreadState,
        timeout: Ticks,
        timeout_mode: TimeoutMode,
        wchan: Option<Arc<dyn WaitChannel>>,
    ) -> Guard<'a, A> {
        let target_cpu = g.tcb(key).sched;

        crate::trace!(
            "pod: suspend {} mask {:#x}",
            g.tcb(key).name(),
            mask.bits()
        );

        if g.slots[target_cpu].curr == key {
            g.set_resched(target_cpu);
        }

        if !g.tcb(key).blocked() {
            // A runnable shadow whose mate took a host signal must not
            // block now: raise the break condition and let it unwind.
            if g.tcb(key).test_state(ThreadState::SHADOW)
                && g.tcb(key).test_info(ThreadInfo::KICKED)
            {
                g.tcb_mut(key)
                    .clear_info(ThreadInfo::RMID | ThreadInfo::TIMEO);
                g.tcb_mut(key).set_info(ThreadInfo::BREAK);
                return g;
            }
            g.tcb_mut(key).clear_info(
                ThreadInfo::RMID
                    | ThreadInfo::TIMEO
                    | ThreadInfo::BREAK
                    | ThreadInfo::WAKEN
                    | ThreadInfo::ROBBED,
            );
        }

        // An unbounded relative timeout does not arm the resume timer.
        if timeout != TICK_INFINITE || timeout_mode != TimeoutMode::Relative {
            let now = g.tbase.rawclock();
            let offset = g.tbase.wallclock_offset();
            let tcb = g.tcb_mut(key);
            tcb.rtimer.set_sched(target_cpu);
            if tcb
                .rtimer
                .start(now, offset, timeout, TICK_INFINITE, timeout_mode)
                .is_err()
            {
                // Deadline already elapsed: report the timeout without
                // blocking, detaching from the channel if one was given.
                if let Some(channel) = wchan {
                    g.tcb_mut(key).wchan = Some(channel);
                    g.forget_sleeper(key);
                }
                g.tcb_mut(key).set_info(ThreadInfo::TIMEO);
                return g;
            }
            g.tcb_mut(key).set_state(ThreadState::DELAY);
        }

        if g.tcb(key).test_state(ThreadState::READY) {
            let level = g.level_of(key);
            g.slots[target_cpu].class.dequeue(key, level);
            g.tcb_mut(key).clear_state(ThreadState::READY);
        }

        g.tcb_mut(key).set_state(mask);

        // A thread first blocked on a channel then forcibly suspended
        // keeps its wait channel; the conditions are conjunctive.
        if let Some(channel) = wchan {
            g.tcb_mut(key).wchan = Some(channel);
        }

        if g.slots[target_cpu].curr == key {
            // A target running on a remote CPU is stopped by the resched
            // IPI the local rescheduler sends out.
            g = self.do_schedule(g);
        } else if g
            .tcb(key)
            .state()
            .contains(ThreadState::SHADOW | ThreadState::RELAX)
            && !g.tcb(key).test_state(ThreadState::DORMANT)
            && mask.intersects(ThreadState::DELAY | ThreadState::SUSP)
        {
            // Stopping a relaxed shadow: its mate runs under the host
            // scheduler, so ask the bridge to migrate it back under pod
            // control where the suspension can take hold.
            if let Some(bridge) = self.bridge.as_deref() {
                let handle = g.tcb(key).handle();
                bridge.shadow_suspend(handle);
            }
        }

        g
    }

    /// Remove suspensive conditions from a thread.
    ///
    /// When the last blocking condition falls, the thread is enqueued back
    /// into its slot's ready queue and the slot is marked for a re-pick.
    /// Resuming a thread that was not blocked re-enqueues it at the tail
    /// of its priority group (manual round-robin).
    ///
    /// This service never reschedules; callers batch state edits and then
    /// invoke [`Pod::schedule`].
    pub fn resume_thread(&self, thread: ThreadHandle, mask: ThreadState) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;
        self.resume_inner(&mut g, key, mask);
        Ok(())
    }

    pub(crate) fn resume_inner(&self, g: &mut Guard<'_, A>, key: ThreadKey, mask: ThreadState) {
        crate::trace!("pod: resume {} mask {:#x}", g.tcb(key).name(), mask.bits());

        if !g.tcb(key).blocked() {
            if g.tcb(key).test_state(ThreadState::READY) {
                let level = g.level_of(key);
                let cpu = g.tcb(key).sched;
                g.slots[cpu].class.dequeue(key, level);
                g.tcb_mut(key).clear_state(ThreadState::READY);
            }
            self.make_ready(g, key);
            return;
        }

        g.tcb_mut(key).clear_state(mask);

        // A cleared DELAY also covers the timeout case, where stopping the
        // timer is a no-op.
        if mask.intersects(ThreadState::DELAY) {
            g.tcb_mut(key).rtimer.stop();
        }

        if !g.tcb(key).blocked() {
            self.clear_wchan_and_ready(g, key, mask);
            return;
        }

        if mask.intersects(ThreadState::DELAY) {
            if !g.tcb(key).test_state(ThreadState::PEND) {
                return;
            }
            // The delay fell but the thread still pends: a concurrent
            // grant may have satisfied the wait already.
            if g.tcb(key).wchan.is_some() {
                g.forget_sleeper(key);
                if g.tcb(key).blocked() {
                    return;
                }
            }
            self.make_ready(g, key);
        } else if g.tcb(key).test_state(ThreadState::DELAY) {
            if mask.intersects(ThreadState::PEND) {
                // The wait was satisfied; disarm the bounding timer.
                g.tcb_mut(key).rtimer.stop();
                g.tcb_mut(key).clear_state(ThreadState::DELAY);
            }
            if g.tcb(key).blocked() {
                return;
            }
            self.clear_wchan_and_ready(g, key, mask);
        } else {
            // Still suspended by other conditions, but no longer pending
            // on the resource.
            if mask.intersects(ThreadState::PEND) && g.tcb(key).wchan.is_some() {
                g.forget_sleeper(key);
            }
        }
    }

    fn clear_wchan_and_ready(&self, g: &mut Guard<'_, A>, key: ThreadKey, mask: ThreadState) {
        // Requests clearing only DELAY leave the channel attached: a
        // sleeper woken from a bounded wait by its own timer keeps
        // pending.
        if !(mask - ThreadState::DELAY).is_empty() && g.tcb(key).wchan.is_some() {
            g.forget_sleeper(key);
        }
        self.make_ready(g, key);
    }

    fn make_ready(&self, g: &mut Guard<'_, A>, key: ThreadKey) {
        let cpu = g.tcb(key).sched;
        let level = g.level_of(key);
        g.slots[cpu].class.enqueue(key, level);
        g.tcb_mut(key).set_state(ThreadState::READY);
        g.set_resched(cpu);
    }

    /// Break a thread out of any delay or resource wait.
    ///
    /// Returns whether the unblocking took effect. When it did, BREAK is
    /// raised in the thread's info mask and stays raised until the thread
    /// actually resumes; unblocking an already runnable thread must not
    /// fake an interrupted wait.
    pub fn unblock_thread(&self, thread: ThreadHandle) -> PodResult<bool> {
        let mut g = self.state.lock_irqsave();
        let key = g.resolve(thread)?;
        Ok(self.unblock_inner(&mut g, key))
    }

    pub(crate) fn unblock_inner(&self, g: &mut Guard<'_, A>, key: ThreadKey) -> bool {
        let mut done = true;
        if g.tcb(key).test_state(ThreadState::DELAY) {
            self.resume_inner(g, key, ThreadState::DELAY);
        } else if g.tcb(key).test_state(ThreadState::PEND) {
            self.resume_inner(g, key, ThreadState::PEND);
        } else {
            done = false;
        }
        if done {
            g.tcb_mut(key).set_info(ThreadInfo::BREAK);
        }
        done
    }
}
