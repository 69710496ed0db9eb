//! State-machine invariants under admissible call sequences.

use super::*;
use crate::errors::Error;
use crate::thread::{ThreadInfo, ThreadState};
use crate::time::{TimeoutMode, TICK_INFINITE};

/// No thread may ever be READY while carrying a blocking condition.
fn assert_no_ready_blocked(pod: &crate::pod::Pod<NoOpArch>) {
    pod.for_each_thread(|tcb| {
        assert!(
            !(tcb.state().contains(ThreadState::READY)
                && tcb.state().intersects(ThreadState::BLOCK_BITS)),
            "thread {} is READY while blocked: {:?}",
            tcb.name(),
            tcb.state()
        );
    });
}

/// Every slot's current thread is bound to that slot.
fn assert_curr_binding(pod: &crate::pod::Pod<NoOpArch>) {
    let g = pod.state.lock_irqsave();
    for slot in &g.slots {
        assert_eq!(g.tcb(slot.curr).sched, slot.cpu());
    }
}

#[test]
fn ready_and_blocked_stay_exclusive() {
    let _t = topology_lock();
    let pod = pod_with_cpus(2);

    let a = spawn(&pod, "A", 10);
    let b = spawn(&pod, "B", 20);
    assert_no_ready_blocked(&pod);
    assert_curr_binding(&pod);

    pod.suspend_thread(b, ThreadState::SUSP, TICK_INFINITE, TimeoutMode::Relative, None)
        .unwrap();
    pod.suspend_thread(a, ThreadState::DELAY, 10, TimeoutMode::Relative, None)
        .unwrap();
    assert_no_ready_blocked(&pod);
    assert_curr_binding(&pod);

    pod.resume_thread(b, ThreadState::SUSP).unwrap();
    advance(&pod, 10);
    assert_no_ready_blocked(&pod);
    assert_curr_binding(&pod);

    pod.shutdown(0);
}

#[test]
fn pod_refcount_tracks_active() {
    let _t = topology_lock();
    set_online_cpus(1);
    set_current_cpu(0);

    let pod: crate::pod::Pod<NoOpArch> = crate::pod::Pod::new();
    assert!(!pod.active());

    pod.init().unwrap();
    assert!(pod.active());

    // A second skin stacks on the same pod.
    pod.init().unwrap();
    pod.shutdown(0);
    assert!(pod.active());

    pod.shutdown(0);
    assert!(!pod.active());
}

#[test]
fn delete_is_idempotent() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    let b = spawn(&pod, "B", 5);
    let rev = pod.threads_rev();

    pod.delete_thread(b).unwrap();
    assert!(pod.threads_rev() > rev);
    let rev = pod.threads_rev();

    // Second deletion through the stale handle changes nothing.
    pod.delete_thread(b).unwrap();
    assert_eq!(pod.threads_rev(), rev);

    // The stale handle is refused for live operations.
    assert_eq!(pod.resume_thread(b, ThreadState::SUSP), Err(Error::Idrm));
    assert_eq!(pod.current_thread(), a);

    pod.shutdown(0);
}

#[test]
fn self_delete_finalizes_through_the_zombie_slot() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    assert_eq!(pod.current_thread(), a);
    let count_before = {
        let mut n = 0;
        pod.for_each_thread(|_| n += 1);
        n
    };

    // Deleting the running thread defers the teardown past the switch.
    pod.delete_thread(a).unwrap();

    let mut count_after = 0;
    pod.for_each_thread(|tcb| {
        count_after += 1;
        assert!(!tcb.state().contains(ThreadState::ZOMBIE));
    });
    assert_eq!(count_after, count_before - 1);
    {
        let g = pod.state.lock_irqsave();
        assert!(g.slots[0].zombie.is_none());
        assert_eq!(g.slots[0].curr, g.slots[0].root);
    }

    pod.shutdown(0);
}

#[test]
fn restart_round_trip() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    pod.renice_thread(a, 30).unwrap();
    pod.post_signals(a, 0xff).unwrap();
    pod.suspend_thread(a, ThreadState::SUSP, TICK_INFINITE, TimeoutMode::Relative, None)
        .unwrap();

    pod.restart_thread(a).unwrap();

    with_thread(&pod, a, |tcb| {
        assert_eq!(tcb.current_priority(), 10);
        assert_eq!(tcb.base_priority(), 10);
        assert!(tcb.state().contains(ThreadState::STARTED));
        assert!(!tcb.state().intersects(ThreadState::DORMANT | ThreadState::SUSP));
        assert_eq!(tcb.signals, 0);
    });
    assert_eq!(pod.current_thread(), a);

    // Restarting the root thread is refused.
    let root = {
        let g = pod.state.lock_irqsave();
        g.tcb(g.slots[0].root).handle()
    };
    assert_eq!(pod.restart_thread(root), Err(Error::Perm));

    pod.shutdown(0);
}

#[test]
fn break_outlives_repeated_unblocks() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    pod.suspend_thread(a, ThreadState::DELAY, 100, TimeoutMode::Relative, None)
        .unwrap();

    assert!(pod.unblock_thread(a).unwrap());
    assert!(!pod.unblock_thread(a).unwrap());
    with_thread(&pod, a, |tcb| {
        assert!(tcb.info().contains(ThreadInfo::BREAK));
    });

    // BREAK survives until the thread suspends again.
    pod.schedule();
    pod.suspend_thread(a, ThreadState::DELAY, 100, TimeoutMode::Relative, None)
        .unwrap();
    with_thread(&pod, a, |tcb| {
        assert!(!tcb.info().contains(ThreadInfo::BREAK));
    });

    pod.shutdown(0);
}

#[test]
fn past_absolute_deadline_short_circuits() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    let b = spawn(&pod, "B", 5);
    advance(&pod, 50);

    // B stays runnable: only the TIMEO outcome is recorded.
    pod.suspend_thread(b, ThreadState::DELAY, 20, TimeoutMode::Absolute, None)
        .unwrap();
    with_thread(&pod, b, |tcb| {
        assert!(!tcb.state().intersects(ThreadState::BLOCK_BITS));
        assert!(tcb.info().contains(ThreadInfo::TIMEO));
        assert!(!tcb.rtimer.running());
    });

    let _ = a;
    pod.shutdown(0);
}

#[test]
fn renice_repositions_ready_threads() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    let b = spawn(&pod, "B", 5);
    assert_eq!(pod.current_thread(), a);

    // B overtakes A once reniced above it.
    pod.renice_thread(b, 20).unwrap();
    pod.schedule();
    assert_eq!(pod.current_thread(), b);
    with_thread(&pod, b, |tcb| {
        assert_eq!(tcb.base_priority(), 20);
        assert_eq!(tcb.current_priority(), 20);
    });
    assert_no_ready_blocked(&pod);

    pod.shutdown(0);
}

#[test]
fn abort_freezes_then_deletes() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let a = spawn(&pod, "A", 10);
    let b = spawn(&pod, "B", 5);

    pod.abort_thread(b).unwrap();
    assert_eq!(pod.resume_thread(b, ThreadState::SUSP), Err(Error::Idrm));
    assert_eq!(pod.current_thread(), a);

    pod.shutdown(0);
}

#[test]
fn fatal_report_lists_threads_and_latches() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);

    let _a = spawn(&pod, "consumer", 10);
    let report = pod.fatal_report("test fault");

    assert!(pod.fatal_latched());
    assert!(report.contains("test fault"));
    assert!(report.contains("NAME"));
    assert!(report.contains("consumer"));
    assert!(report.contains("ROOT/0"));
    assert!(report.contains("Master time base"));

    // Sticky: later reports append to the same buffer.
    let report = pod.fatal_report("second fault");
    assert!(report.contains("test fault") && report.contains("second fault"));

    pod.shutdown(0);
}

#[test]
fn suspending_root_is_fatal() {
    let _t = topology_lock();
    let pod = pod_with_cpus(1);
    let root = {
        let g = pod.state.lock_irqsave();
        g.tcb(g.slots[0].root).handle()
    };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = pod.suspend_thread(
            root,
            ThreadState::SUSP,
            TICK_INFINITE,
            TimeoutMode::Relative,
            None,
        );
    }));
    assert!(outcome.is_err());
}
