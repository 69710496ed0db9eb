//! End-to-end scheduling scenarios.

use super::*;
use crate::errors::Error;
use crate::synch::WaitChannel;
use crate::thread::{ThreadHandle, ThreadInfo, ThreadState};
use crate::time::{TimeoutMode, TICK_INFINITE};

use alloc::vec;
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Wait channel recording how many sleepers were detached and how many
/// ownerships were passed on.
#[derive(Default)]
struct TestChannel {
    forgotten: AtomicUsize,
    released: AtomicUsize,
}

impl WaitChannel for TestChannel {
    fn forget_sleeper(&self, _thread: ThreadHandle) {
        self.forgotten.fetch_add(1, Ordering::AcqRel);
    }

    fn release_ownership(&self, _thread: ThreadHandle) {
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}

#[test]
fn priority_preemption() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    assert_eq!(pod.current_thread(), a);

    // A higher-priority arrival preempts on the spot.
    let b = spawn(&pod, "B", 20);
    assert_eq!(pod.current_thread(), b);

    pod.suspend_thread(b, ThreadState::SUSP, TICK_INFINITE, TimeoutMode::Relative, None)
        .unwrap();
    assert_eq!(pod.current_thread(), a);

    pod.shutdown(0);
}

#[test]
fn round_robin_rotation() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn_flags(&pod, "A", 10, ThreadState::empty(), ThreadState::RRB);
    let b = spawn_flags(&pod, "B", 10, ThreadState::empty(), ThreadState::RRB);
    let c = spawn_flags(&pod, "C", 10, ThreadState::empty(), ThreadState::RRB);
    assert_eq!(pod.current_thread(), a);

    pod.activate_rr(5);

    let mut sequence = vec![pod.current_thread()];
    for _ in 0..3 {
        advance(&pod, 5);
        sequence.push(pod.current_thread());
    }

    // Insertion order, one quantum each, wrapping around.
    assert_eq!(sequence, vec![a, b, c, a]);

    pod.deactivate_rr();
    advance(&pod, 20);
    assert_eq!(pod.current_thread(), a);

    pod.shutdown(0);
}

#[test]
fn timed_pend_won_by_grant() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    let channel = Arc::new(TestChannel::default());
    let wchan: Arc<dyn WaitChannel> = channel.clone();

    pod.suspend_thread(a, ThreadState::PEND, 10, TimeoutMode::Relative, Some(wchan))
        .unwrap();
    assert_ne!(pod.current_thread(), a);

    // The grant arrives at half the timeout.
    advance(&pod, 5);
    pod.resume_thread(a, ThreadState::PEND).unwrap();

    with_thread(&pod, a, |tcb| {
        assert!(!tcb.info().intersects(ThreadInfo::TIMEO | ThreadInfo::BREAK));
        assert!(tcb.wchan.is_none());
        assert!(!tcb.rtimer.running());
        assert!(tcb.state().contains(ThreadState::READY));
    });
    assert_eq!(channel.forgotten.load(Ordering::Acquire), 1);

    pod.schedule();
    assert_eq!(pod.current_thread(), a);

    pod.shutdown(0);
}

#[test]
fn unblock_breaks_pend() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    let channel = Arc::new(TestChannel::default());
    let wchan: Arc<dyn WaitChannel> = channel.clone();

    pod.suspend_thread(a, ThreadState::PEND, TICK_INFINITE, TimeoutMode::Relative, Some(wchan))
        .unwrap();

    assert!(pod.unblock_thread(a).unwrap());

    with_thread(&pod, a, |tcb| {
        assert!(tcb.state().contains(ThreadState::READY));
        assert!(tcb.info().contains(ThreadInfo::BREAK));
        assert!(tcb.wchan.is_none());
    });
    assert_eq!(channel.forgotten.load(Ordering::Acquire), 1);

    // Unblocking a runnable thread must not fake an interrupted wait.
    pod.schedule();
    assert!(!pod.unblock_thread(a).unwrap());

    pod.shutdown(0);
}

#[test]
fn migration_moves_slot_queue_and_fpu() {
    let _t = topology_lock();
    let pod = pod_with_cpus(2);

    let a = spawn_flags(&pod, "A", 10, ThreadState::FPU, ThreadState::empty());
    assert_eq!(pod.current_thread(), a);

    {
        let g = pod.state.lock_irqsave();
        assert_eq!(g.slots[0].fpuholder, Some(g.resolve(a).unwrap()));
    }

    assert_eq!(pod.migrate_thread(1), Ok(()));

    with_thread(&pod, a, |tcb| {
        assert_eq!(tcb.sched, 1);
        assert!(tcb.state().contains(ThreadState::READY));
        assert_eq!(tcb.ptimer.sched(), 1);
    });
    {
        let g = pod.state.lock_irqsave();
        assert_eq!(g.slots[0].fpuholder, None);
        let root0 = g.slots[0].root;
        assert_eq!(g.slots[0].curr, root0);
    }

    // Out-of-affinity and same-CPU cases.
    assert_eq!(pod.migrate_thread(5), Err(Error::Perm));
    assert_eq!(pod.migrate_thread(0), Ok(()));

    pod.shutdown(0);
}

#[test]
fn periodic_wait_reports_overruns_once() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    assert_eq!(pod.current_thread(), a);

    pod.set_thread_periodic(a, TICK_INFINITE, 10).unwrap();

    let mut overruns = 99;
    assert_eq!(pod.wait_thread_period(&mut overruns), Ok(()));
    assert_eq!(overruns, 0);

    // The loop body blows through two and a half periods.
    advance(&pod, 35);
    assert_eq!(pod.wait_thread_period(&mut overruns), Err(Error::TimedOut));
    assert!(overruns >= 1);

    // Back on schedule: the following wait succeeds with no overruns.
    advance(&pod, 5);
    assert_eq!(pod.wait_thread_period(&mut overruns), Ok(()));
    assert_eq!(overruns, 0);

    // Stopping periodic mode disarms further waits.
    pod.set_thread_periodic(a, TICK_INFINITE, TICK_INFINITE).unwrap();
    assert_eq!(pod.wait_thread_period(&mut overruns), Err(Error::WouldBlock));

    pod.shutdown(0);
}

#[test]
fn periodic_rejects_sub_latency_period() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);
    let a = spawn(&pod, "A", 10);

    pod.set_latency(3);
    assert_eq!(pod.set_thread_periodic(a, TICK_INFINITE, 2), Err(Error::Inval));

    pod.disable_timesource();
    assert_eq!(
        pod.set_thread_periodic(a, TICK_INFINITE, 10),
        Err(Error::WouldBlock)
    );

    pod.shutdown(0);
}

#[test]
fn asr_runs_from_scheduler_epilogue() {
    static DELIVERED: AtomicUsize = AtomicUsize::new(0);
    fn asr(sigs: crate::thread::SigMask) {
        DELIVERED.fetch_add(sigs as usize, Ordering::AcqRel);
    }

    let _t = topology_lock();
    DELIVERED.store(0, Ordering::Release);
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    pod.set_thread_asr(a, Some(asr), ThreadState::empty(), 0).unwrap();
    pod.post_signals(a, 0x5).unwrap();

    pod.schedule();
    assert_eq!(DELIVERED.load(Ordering::Acquire), 0x5);
    with_thread(&pod, a, |tcb| {
        assert_eq!(tcb.signals, 0);
        assert_eq!(tcb.asrlevel, 0);
    });

    // ASDI suppresses delivery.
    pod.post_signals(a, 0x2).unwrap();
    pod.set_thread_mode(a, ThreadState::empty(), ThreadState::ASDI).unwrap();
    pod.schedule();
    assert_eq!(DELIVERED.load(Ordering::Acquire), 0x5);

    pod.shutdown(0);
}

#[test]
fn scheduler_lock_defers_preemption() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    assert_eq!(pod.current_thread(), a);

    pod.lock_sched();
    pod.lock_sched();

    // A higher-priority wakeup must wait for the lock holder.
    let b = spawn(&pod, "B", 20);
    assert_eq!(pod.current_thread(), a);

    pod.unlock_sched();
    assert_eq!(pod.current_thread(), a);
    pod.unlock_sched();
    assert_eq!(pod.current_thread(), b);

    pod.shutdown(0);
}

#[test]
fn start_hooks_fire_in_registration_order() {
    use crate::pod::HookType;

    static ORDER: AtomicUsize = AtomicUsize::new(0);
    static FIRST_AT: AtomicUsize = AtomicUsize::new(0);
    static SECOND_AT: AtomicUsize = AtomicUsize::new(0);

    fn first(_tcb: &crate::thread::Tcb<crate::arch::NoOpArch>) {
        FIRST_AT.store(ORDER.fetch_add(1, Ordering::AcqRel) + 1, Ordering::Release);
    }
    fn second(_tcb: &crate::thread::Tcb<crate::arch::NoOpArch>) {
        SECOND_AT.store(ORDER.fetch_add(1, Ordering::AcqRel) + 1, Ordering::Release);
    }

    let _t = topology_lock();
    ORDER.store(0, Ordering::Release);
    let pod = pod_with_cpus(1);

    pod.add_hook(HookType::Start, first).unwrap();
    pod.add_hook(HookType::Start, second).unwrap();

    let _a = spawn(&pod, "A", 10);
    assert_eq!(FIRST_AT.load(Ordering::Acquire), 1);
    assert_eq!(SECOND_AT.load(Ordering::Acquire), 2);

    pod.remove_hook(HookType::Start, first).unwrap();
    assert_eq!(
        pod.remove_hook(HookType::Start, first),
        Err(crate::errors::Error::Inval)
    );

    pod.shutdown(0);
}

#[test]
fn delete_strips_channel_ownerships() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    let b = spawn(&pod, "B", 5);
    let owned = Arc::new(TestChannel::default());
    pod.claim_channel(b, owned.clone()).unwrap();

    pod.delete_thread(b).unwrap();
    assert_eq!(owned.released.load(Ordering::Acquire), 1);

    // Restart does the same for a surviving thread.
    pod.claim_channel(a, owned.clone()).unwrap();
    pod.restart_thread(a).unwrap();
    assert_eq!(owned.released.load(Ordering::Acquire), 2);

    pod.shutdown(0);
}

#[test]
fn kernel_fault_freezes_the_thread() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    assert_eq!(pod.current_thread(), a);

    let info = crate::pod::FaultInfo {
        pc: 0xdead,
        trap: 14,
        ..Default::default()
    };
    assert!(pod.trap_fault(&info));

    with_thread(&pod, a, |tcb| {
        assert!(tcb.state().contains(ThreadState::SUSP));
    });
    assert_ne!(pod.current_thread(), a);

    // Idle context: the fault propagates to the host.
    assert!(!pod.trap_fault(&info));

    pod.shutdown(0);
}
