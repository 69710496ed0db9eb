//! End-to-end suites driving the pod through the no-op architecture.
//!
//! The NoOpArch topology knobs are process-global, so every test that
//! builds a pod serializes on [`topology_lock`].

#![cfg(feature = "std-shim")]

mod invariants;
mod scenarios;

use crate::arch::{set_current_cpu, set_online_cpus, NoOpArch};
use crate::cpumask::CpuSet;
use crate::pod::Pod;
use crate::sched::Priority;
use crate::thread::{Tcb, ThreadHandle, ThreadState};

use std::sync::{Mutex, MutexGuard};

static TOPOLOGY: Mutex<()> = Mutex::new(());

pub(crate) fn topology_lock() -> MutexGuard<'static, ()> {
    TOPOLOGY.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn noop_entry(_cookie: usize) {}

/// Bring up a pod over `n` fake CPUs, caller pinned on CPU 0.
pub(crate) fn pod_with_cpus(n: usize) -> Pod<NoOpArch> {
    set_online_cpus(n);
    set_current_cpu(0);
    let pod = Pod::new();
    pod.init().expect("pod init");
    pod
}

/// Create and start a kernel thread; the rescheduler runs before return.
pub(crate) fn spawn(pod: &Pod<NoOpArch>, name: &str, prio: Priority) -> ThreadHandle {
    spawn_flags(pod, name, prio, ThreadState::empty(), ThreadState::empty())
}

pub(crate) fn spawn_flags(
    pod: &Pod<NoOpArch>,
    name: &str,
    prio: Priority,
    flags: ThreadState,
    mode: ThreadState,
) -> ThreadHandle {
    let handle = pod.init_thread(name, prio, flags, 0).expect("init_thread");
    pod.start_thread(handle, mode, 0, CpuSet::all(), Some(noop_entry), 0)
        .expect("start_thread");
    handle
}

/// Inspect one thread's control block.
pub(crate) fn with_thread<R>(
    pod: &Pod<NoOpArch>,
    handle: ThreadHandle,
    f: impl FnOnce(&Tcb<NoOpArch>) -> R,
) -> R {
    let mut out = None;
    let mut f = Some(f);
    pod.for_each_thread(|tcb| {
        if tcb.handle() == handle {
            if let Some(f) = f.take() {
                out = Some(f(tcb));
            }
        }
    });
    out.expect("thread not found")
}

/// Advance the master clock by `n` ticks on CPU 0.
pub(crate) fn advance(pod: &Pod<NoOpArch>, n: u64) {
    for _ in 0..n {
        pod.clock_tick(0);
    }
}
