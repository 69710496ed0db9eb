//! Architecture abstraction layer.
//!
//! The pod drives the machine exclusively through this trait: context
//! switching, FPU management, per-CPU hardware timers, inter-processor
//! interrupts and local interrupt masking. An implementation must be
//! supplied by the hosting environment for each supported CPU architecture.

use crate::cpumask::{CpuId, CpuSet};
use crate::errors::PodResult;
use crate::time::Ticks;

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations involve direct hardware manipulation and inline
/// assembly. All methods marked as unsafe have specific preconditions that
/// must be upheld by the caller.
pub trait Arch {
    /// Architecture-specific saved execution context.
    ///
    /// Must contain all CPU registers and state needed to fully restore a
    /// thread's execution.
    type Context: Send + Default;

    /// Architecture-specific FPU backup area.
    type FpuContext: Send + Default;

    /// Whether the architecture supports releasing the pod lock across the
    /// machine-level context switch. When true, the rescheduler flags the
    /// slot as mid-switch and reconciles migrations after the switch.
    const UNLOCKED_SWITCH: bool;

    /// Switch from one execution context to another.
    ///
    /// # Safety
    ///
    /// - `prev` and `next` must point to valid, properly aligned contexts
    ///   that remain alive for the duration of the call
    /// - `next` must represent a valid execution state
    /// - Must be called with local interrupts disabled
    unsafe fn switch_to(prev: *mut Self::Context, next: *mut Self::Context);

    /// Build the initial frame so the context resumes at `entry(cookie)`
    /// with the given interrupt mask, on `stack_top` when one is supplied
    /// (user-space mates and root threads carry no kernel stack).
    fn init_context(
        ctx: &mut Self::Context,
        entry: Option<fn(usize)>,
        cookie: usize,
        imask: i32,
        stack_top: Option<usize>,
    );

    /// Reclaim architecture resources of a context that will never be
    /// switched to again.
    fn finalize_no_switch(ctx: &mut Self::Context);

    /// The root (idle) context is about to run again.
    fn enter_root(ctx: &mut Self::Context);

    /// The root (idle) context is being preempted.
    fn leave_root(ctx: &mut Self::Context);

    /// Save the live FPU state into `fpu`.
    ///
    /// # Safety
    ///
    /// Must be called on the CPU whose FPU currently holds that state.
    #[cfg(feature = "full-fpu")]
    unsafe fn save_fpu(fpu: &mut Self::FpuContext);

    /// Load `fpu` into the FPU.
    ///
    /// # Safety
    ///
    /// `fpu` must contain a valid FPU state for this architecture.
    #[cfg(feature = "full-fpu")]
    unsafe fn restore_fpu(fpu: &Self::FpuContext);

    /// Re-enable FPU access without reloading state (the live state already
    /// belongs to the resuming thread).
    #[cfg(feature = "full-fpu")]
    fn enable_fpu();

    /// Initialize a fresh FPU backup area to the power-on state.
    #[cfg(feature = "full-fpu")]
    fn init_fpu(fpu: &mut Self::FpuContext);

    /// Number of CPUs the pod should build scheduler slots for.
    fn num_online_cpus() -> usize;

    /// The CPU the caller is running on.
    fn current_cpu() -> CpuId;

    /// Kick the rescheduling IPI on every CPU in `mask`.
    fn send_ipi(mask: CpuSet);

    /// Take over the hardware clock on `cpu`.
    ///
    /// Returns the host-tick period the pod must emulate with a software
    /// timer (a value > 1), or <= 1 when the hardware relays the host tick
    /// itself.
    fn start_timer(cpu: CpuId) -> PodResult<i64>;

    /// Release the hardware clock on `cpu`.
    fn stop_timer(cpu: CpuId);

    /// Host wall-clock reading, in master-clock ticks.
    fn get_host_time() -> Ticks;

    /// CPU time counter reading, in master-clock ticks.
    fn get_cpu_time() -> Ticks;

    /// Disable local interrupts, returning the state to restore.
    fn local_irq_save() -> usize;

    /// Restore a local interrupt state saved by [`Arch::local_irq_save`].
    fn local_irq_restore(flags: usize);

    /// Whether the caller runs in interrupt context.
    fn in_interrupt() -> bool;

    /// Attempt to escalate a rescheduling request to the interrupt tail.
    ///
    /// Returns true when the request was escalated (asynchronous context);
    /// the rescheduler then backs out immediately.
    fn escalate() -> bool;

    /// Set the processor interrupt mask level, returning the previous one.
    fn set_irq_mask(mask: i32) -> i32;

    /// Full memory barrier.
    fn memory_barrier();

    /// Terminal stop after a fatal pod error.
    fn halt(msg: &str) -> !;
}

/// A no-op architecture for host-side testing and fallback purposes.
///
/// Context switches do nothing: the calling stack keeps running while the
/// pod's bookkeeping behaves as if the switch happened. CPU topology is
/// configurable so tests can model SMP layouts.
pub struct NoOpArch;

#[cfg(feature = "std-shim")]
mod noop_topology {
    use portable_atomic::{AtomicUsize, Ordering};

    pub(super) static ONLINE: AtomicUsize = AtomicUsize::new(1);
    pub(super) static CURRENT: AtomicUsize = AtomicUsize::new(0);

    /// Set the CPU count reported to the pod. Test-only knob.
    pub fn set_online_cpus(n: usize) {
        ONLINE.store(n, Ordering::Release);
    }

    /// Set the CPU the "caller" appears to run on. Test-only knob.
    pub fn set_current_cpu(cpu: usize) {
        CURRENT.store(cpu, Ordering::Release);
    }
}

#[cfg(feature = "std-shim")]
pub use noop_topology::{set_current_cpu, set_online_cpus};

impl Arch for NoOpArch {
    type Context = ();
    type FpuContext = ();

    const UNLOCKED_SWITCH: bool = false;

    unsafe fn switch_to(_prev: *mut Self::Context, _next: *mut Self::Context) {}

    fn init_context(
        _ctx: &mut Self::Context,
        _entry: Option<fn(usize)>,
        _cookie: usize,
        _imask: i32,
        _stack_top: Option<usize>,
    ) {
    }

    fn finalize_no_switch(_ctx: &mut Self::Context) {}

    fn enter_root(_ctx: &mut Self::Context) {}

    fn leave_root(_ctx: &mut Self::Context) {}

    #[cfg(feature = "full-fpu")]
    unsafe fn save_fpu(_fpu: &mut Self::FpuContext) {}

    #[cfg(feature = "full-fpu")]
    unsafe fn restore_fpu(_fpu: &Self::FpuContext) {}

    #[cfg(feature = "full-fpu")]
    fn enable_fpu() {}

    #[cfg(feature = "full-fpu")]
    fn init_fpu(_fpu: &mut Self::FpuContext) {}

    fn num_online_cpus() -> usize {
        #[cfg(feature = "std-shim")]
        {
            noop_topology::ONLINE.load(portable_atomic::Ordering::Acquire)
        }
        #[cfg(not(feature = "std-shim"))]
        {
            1
        }
    }

    fn current_cpu() -> CpuId {
        #[cfg(feature = "std-shim")]
        {
            noop_topology::CURRENT.load(portable_atomic::Ordering::Acquire)
        }
        #[cfg(not(feature = "std-shim"))]
        {
            0
        }
    }

    fn send_ipi(_mask: CpuSet) {}

    fn start_timer(_cpu: CpuId) -> PodResult<i64> {
        Ok(0)
    }

    fn stop_timer(_cpu: CpuId) {}

    fn get_host_time() -> Ticks {
        0
    }

    fn get_cpu_time() -> Ticks {
        0
    }

    fn local_irq_save() -> usize {
        0
    }

    fn local_irq_restore(_flags: usize) {}

    fn in_interrupt() -> bool {
        false
    }

    fn escalate() -> bool {
        false
    }

    fn set_irq_mask(_mask: i32) -> i32 {
        0
    }

    fn memory_barrier() {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    fn halt(msg: &str) -> ! {
        panic!("pod halted: {}", msg);
    }
}
