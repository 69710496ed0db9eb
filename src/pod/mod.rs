//! The real-time pod.
//!
//! The pod is the process-wide runtime every skin stacks on: it owns the
//! thread arena, one scheduler slot per online CPU, the hook chains, the
//! master time base and the fatal-diagnostic state. A single lock, taken
//! IRQ-save, serializes every mutation; the rescheduler may release it
//! across the machine-level context switch on capable architectures.

mod lifecycle;
mod schedule;
mod suspend;

pub use lifecycle::FaultInfo;

use crate::arch::Arch;
use crate::cpumask::{CpuId, CpuSet, MAX_CPUS};
use crate::errors::{Error, PodResult};
use crate::lock::{IrqGuard, IrqSpinlock};
use crate::mem::StackPool;
use crate::sched::{DefaultClass, Slot, SlotFlags, ThreadKey};
use crate::shadow::ShadowBridge;
use crate::thread::{Tcb, ThreadHandle, ThreadState};
use crate::time::{Ticks, TimeBase, TimeoutMode, TICK_INFINITE};

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use portable_atomic::{AtomicPtr, Ordering};

bitflags! {
    /// Pod status mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PodFlags: u32 {
        /// The pod carries stacked skins and schedules threads
        const ACTIVE = 0x0001;
        /// A fatal error has been latched
        const FATAL  = 0x0002;
    }
}

/// Scheduling events a hook chain can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    /// A thread was started
    Start,
    /// A context switch completed; called on behalf of the resuming thread
    Switch,
    /// A thread is being deleted; the control block is still valid
    Delete,
}

/// Hook routine; receives the affected thread.
pub type ThreadHook<A> = fn(&Tcb<A>);

/// Watchdog period, in master-clock ticks.
#[cfg(feature = "watchdog")]
pub(crate) const WATCHDOG_PERIOD: Ticks = 1_000;
/// Watchdog rounds a non-root thread may hog a CPU before action is taken.
#[cfg(feature = "watchdog")]
pub(crate) const WATCHDOG_ROUNDS: u32 = 4;

/// Everything the pod lock protects.
pub(crate) struct PodState<A: Arch> {
    pub(crate) status: PodFlags,
    pub(crate) refcnt: usize,
    /// Thread storage; keys are stable for a thread's whole life.
    pub(crate) arena: Vec<Option<Box<Tcb<A>>>>,
    pub(crate) free_keys: Vec<ThreadKey>,
    /// Insertion-order enumeration of live threads, root threads included.
    pub(crate) order: Vec<ThreadKey>,
    /// Bumped on every insert/unlink so enumerators can detect churn.
    pub(crate) threads_rev: u64,
    pub(crate) next_serial: u64,
    pub(crate) hooks: [Vec<ThreadHook<A>>; 3],
    pub(crate) slots: Vec<Slot>,
    /// Global mask restricting where threads may run.
    pub(crate) affinity: CpuSet,
    pub(crate) tbase: TimeBase,
    /// Intrinsic scheduling latency; periods below it are rejected.
    pub(crate) latency: Ticks,
    pub(crate) fatal_buf: String,
}

pub(crate) type Guard<'a, A> = IrqGuard<'a, A, PodState<A>>;

impl<A: Arch> PodState<A> {
    pub(crate) fn tcb(&self, key: ThreadKey) -> &Tcb<A> {
        self.arena[key].as_deref().expect("live thread key")
    }

    pub(crate) fn tcb_mut(&mut self, key: ThreadKey) -> &mut Tcb<A> {
        self.arena[key].as_deref_mut().expect("live thread key")
    }

    /// Map a handle to its arena key, refusing stale handles.
    pub(crate) fn resolve(&self, handle: ThreadHandle) -> PodResult<ThreadKey> {
        match self.arena.get(handle.idx) {
            Some(Some(tcb)) if tcb.serial == handle.serial => Ok(handle.idx),
            _ => Err(Error::Idrm),
        }
    }

    /// Queueing level for a thread (root sits below priority 0).
    pub(crate) fn level_of(&self, key: ThreadKey) -> crate::sched::Level {
        let tcb = self.tcb(key);
        if tcb.test_state(ThreadState::ROOT) {
            crate::sched::ROOT_LEVEL
        } else {
            crate::sched::level_for(tcb.cprio)
        }
    }

    /// Record that `target_cpu`'s slot must re-pick. The request is noted
    /// on the calling CPU's slot; remote bits turn into IPIs when the
    /// caller next runs the rescheduler.
    pub(crate) fn set_resched(&mut self, target_cpu: CpuId) {
        let here = A::current_cpu();
        self.slots[here].resched.set(target_cpu);
    }

    /// Whether `key` is the thread its own slot is running.
    pub(crate) fn is_curr(&self, key: ThreadKey) -> bool {
        let cpu = self.tcb(key).sched;
        self.slots[cpu].curr == key
    }

    pub(crate) fn insert_thread(
        &mut self,
        build: impl FnOnce(ThreadKey, u64) -> Tcb<A>,
    ) -> ThreadKey {
        let key = self.free_keys.pop().unwrap_or(self.arena.len());
        let serial = self.next_serial;
        self.next_serial += 1;
        let tcb = Box::new(build(key, serial));
        if key == self.arena.len() {
            self.arena.push(Some(tcb));
        } else {
            self.arena[key] = Some(tcb);
        }
        self.order.push(key);
        self.threads_rev += 1;
        key
    }

    /// Drop a thread from the enumeration order. The arena entry stays
    /// valid until finalization frees it.
    pub(crate) fn unlink_thread(&mut self, key: ThreadKey) {
        self.order.retain(|&k| k != key);
        self.threads_rev += 1;
    }

    pub(crate) fn free_entry(&mut self, key: ThreadKey) -> Box<Tcb<A>> {
        let tcb = self.arena[key].take().expect("live thread key");
        self.free_keys.push(key);
        tcb
    }

    /// Detach a pending thread from its wait channel.
    pub(crate) fn forget_sleeper(&mut self, key: ThreadKey) {
        let handle = self.tcb(key).handle();
        let tcb = self.tcb_mut(key);
        tcb.clear_state(ThreadState::PEND);
        if let Some(channel) = tcb.wchan.take() {
            channel.forget_sleeper(handle);
        }
    }

    /// Build the fatal diagnostic listing and latch the FATAL bit.
    fn fatal_append(&mut self, reason: &str) {
        use core::fmt::Write;

        let _ = writeln!(self.fatal_buf, "{}", reason);

        if !self.status.contains(PodFlags::ACTIVE) || self.status.contains(PodFlags::FATAL) {
            return;
        }
        self.status.insert(PodFlags::FATAL);

        let now = self.tbase.rawclock();
        let _ = writeln!(
            self.fatal_buf,
            "\n {:<3}  {:<6} {:<8} {:<8} {:<8}  {}",
            "CPU", "PID", "PRI", "TIMEOUT", "STAT", "NAME"
        );

        for cpu in 0..self.slots.len() {
            for &key in self.order.clone().iter() {
                let row = {
                    let tcb = self.tcb(key);
                    if tcb.sched != cpu {
                        continue;
                    }
                    let timeout = if tcb.rtimer.running() {
                        tcb.rtimer.pexpect().saturating_sub(now)
                    } else {
                        0
                    };
                    let marker = if self.slots[cpu].curr == key { '>' } else { ' ' };
                    alloc::format!(
                        "{}{:<3}  {:<6} {:<8} {:<8} {:08x}  {}\n",
                        marker,
                        cpu,
                        tcb.user_pid.unwrap_or(-1),
                        tcb.cprio,
                        timeout,
                        tcb.state.bits(),
                        tcb.name
                    )
                };
                self.fatal_buf.push_str(&row);
            }
        }

        if self.tbase.running() {
            let _ = writeln!(
                self.fatal_buf,
                "Master time base: clock={}",
                self.tbase.rawclock()
            );
        } else {
            let _ = writeln!(self.fatal_buf, "Master time base: disabled");
        }
        let _ = writeln!(self.fatal_buf, "Current CPU: #{}", A::current_cpu());
    }
}

/// The process-wide real-time runtime.
pub struct Pod<A: Arch> {
    pub(crate) state: IrqSpinlock<A, PodState<A>>,
    pub(crate) stack_pool: StackPool,
    pub(crate) bridge: Option<Box<dyn ShadowBridge>>,
}

static GLOBAL_POD: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

impl<A: Arch> Default for Pod<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch> Pod<A> {
    /// Build an idle pod. Call [`Pod::init`] to bring it up.
    pub fn new() -> Self {
        Self {
            state: IrqSpinlock::new(PodState {
                status: PodFlags::empty(),
                refcnt: 0,
                arena: Vec::new(),
                free_keys: Vec::new(),
                order: Vec::new(),
                threads_rev: 0,
                next_serial: 1,
                hooks: [Vec::new(), Vec::new(), Vec::new()],
                slots: Vec::new(),
                affinity: CpuSet::all(),
                tbase: TimeBase::new(),
                latency: 1,
                fatal_buf: String::new(),
            }),
            stack_pool: StackPool::new(),
            bridge: None,
        }
    }

    /// Build an idle pod wired to a user-space shadow bridge.
    pub fn with_bridge(bridge: Box<dyn ShadowBridge>) -> Self {
        let mut pod = Self::new();
        pod.bridge = Some(bridge);
        pod
    }

    /// Initialize the pod, or stack one more skin on an active one.
    ///
    /// The first call builds one scheduler slot per online CPU, each with
    /// its root thread appended to the thread list, marks the pod active
    /// and enables the time source. Subsequent calls only increment the
    /// reference count.
    pub fn init(&self) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();

        if g.status.contains(PodFlags::ACTIVE) {
            g.refcnt += 1;
            return Ok(());
        }

        let ncpus = A::num_online_cpus().min(MAX_CPUS).max(1);

        g.refcnt = 1;
        g.status = PodFlags::empty();
        g.tbase = TimeBase::new();

        for cpu in 0..ncpus {
            let root = g.insert_thread(|key, serial| {
                let mut tcb = Tcb::new(
                    key,
                    serial,
                    alloc::format!("ROOT/{}", cpu),
                    0,
                    ThreadState::empty(),
                    None,
                    cpu,
                );
                tcb.set_state(ThreadState::ROOT | ThreadState::STARTED);
                tcb.affinity = CpuSet::single(cpu);
                tcb
            });
            g.slots.push(Slot::new(cpu, root, Box::new(DefaultClass::new())));
        }

        g.status.insert(PodFlags::ACTIVE);
        A::memory_barrier();
        drop(g);

        crate::trace!("pod: up with {} cpu(s)", ncpus);

        if let Err(err) = self.enable_timesource() {
            self.shutdown(-1);
            return Err(err);
        }

        Ok(())
    }

    /// Release one skin reference; the last release tears the pod down.
    ///
    /// All threads but the roots are deleted, zombies are drained by one
    /// rescheduling pass, the slots are destroyed and the stack pool is
    /// flushed. `xtype` is handed to the trace stream for the host
    /// environment.
    pub fn shutdown(&self, xtype: i32) {
        let mut g = self.state.lock_irqsave();

        if !g.status.contains(PodFlags::ACTIVE) {
            return;
        }
        g.refcnt -= 1;
        if g.refcnt != 0 {
            return;
        }

        // The hardware timers must be released outside the lock. A skin
        // stacking concurrently during this window would race with the
        // teardown; skins are expected not to stack during shutdown.
        drop(g);

        self.disable_timesource();
        crate::trace!("pod: shutdown (exit code {})", xtype);

        let mut g = self.state.lock_irqsave();

        for key in g.order.clone() {
            if g.arena[key].is_some() && !g.tcb(key).test_state(ThreadState::ROOT) {
                g = self.delete_inner(g, key);
            }
        }

        g = self.do_schedule(g);

        g.status.remove(PodFlags::ACTIVE);

        for cpu in 0..g.slots.len() {
            while g.slots[cpu].class.pick_next().is_some() {}
            g.slots[cpu].htimer.stop();
            g.slots[cpu].wdtimer.stop();
        }

        for key in g.order.clone() {
            g.unlink_thread(key);
            let mut root = g.free_entry(key);
            A::finalize_no_switch(&mut root.ctx);
        }
        g.slots.clear();
        g.arena.clear();
        g.free_keys.clear();

        drop(g);
        self.stack_pool.flush();
    }

    /// Whether the pod is initialized and schedules threads.
    pub fn active(&self) -> bool {
        self.state.lock_irqsave().status.contains(PodFlags::ACTIVE)
    }

    /// Whether a fatal error has been latched.
    pub fn fatal_latched(&self) -> bool {
        self.state.lock_irqsave().status.contains(PodFlags::FATAL)
    }

    /// Handle of the thread the current CPU is running.
    pub fn current_thread(&self) -> ThreadHandle {
        let g = self.state.lock_irqsave();
        let key = g.slots[A::current_cpu()].curr;
        g.tcb(key).handle()
    }

    /// Revision counter of the thread list.
    pub fn threads_rev(&self) -> u64 {
        self.state.lock_irqsave().threads_rev
    }

    /// Run `f` over every live thread in insertion order.
    pub fn for_each_thread(&self, mut f: impl FnMut(&Tcb<A>)) {
        let g = self.state.lock_irqsave();
        for &key in &g.order {
            f(g.tcb(key));
        }
    }

    /// Restrict the global CPU mask threads may run within.
    pub fn set_affinity_mask(&self, mask: CpuSet) {
        self.state.lock_irqsave().affinity = mask;
    }

    /// Set the intrinsic scheduling latency used to validate periods.
    pub fn set_latency(&self, ticks: Ticks) {
        self.state.lock_irqsave().latency = ticks;
    }

    /// The kernel-stack pool backing pod threads.
    pub fn stack_pool(&self) -> &StackPool {
        &self.stack_pool
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    /// Register a hook; chains run in registration order.
    pub fn add_hook(&self, kind: HookType, routine: ThreadHook<A>) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        g.hooks[hook_index(kind)].push(routine);
        Ok(())
    }

    /// Unregister a hook previously added with [`Pod::add_hook`].
    pub fn remove_hook(&self, kind: HookType, routine: ThreadHook<A>) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        let chain = &mut g.hooks[hook_index(kind)];
        let before = chain.len();
        chain.retain(|&r| r as usize != routine as usize);
        if chain.len() == before {
            return Err(Error::Inval);
        }
        Ok(())
    }

    /// Fire a hook chain for `key` with callouts flagged on the current
    /// slot, so any rescheduling intent from a hook is deferred.
    ///
    /// The chain is snapshotted first: a hook may add or remove hooks
    /// (itself included) without upsetting the iteration.
    pub(crate) fn fire_hooks(&self, g: &mut Guard<'_, A>, kind: HookType, key: ThreadKey) {
        let chain = g.hooks[hook_index(kind)].clone();
        if chain.is_empty() {
            return;
        }
        let cpu = A::current_cpu();
        g.slots[cpu].status.insert(SlotFlags::KCOUT);
        for hook in chain {
            hook(g.tcb(key));
        }
        g.slots[cpu].status.remove(SlotFlags::KCOUT);
    }

    // ------------------------------------------------------------------
    // Fatal path
    // ------------------------------------------------------------------

    /// Latch a fatal condition and return the formatted diagnostic buffer:
    /// every thread across all CPUs with its CPU, PID, priority, timeout,
    /// state flags and name, then the master-clock status and current CPU.
    ///
    /// Fatal is sticky; later reports append to the same buffer.
    pub fn fatal_report(&self, reason: &str) -> String {
        let mut g = self.state.lock_irqsave();
        g.fatal_append(reason);
        g.fatal_buf.clone()
    }

    /// Latch a fatal condition and halt through the architecture.
    pub(crate) fn fatal_in(&self, g: &mut Guard<'_, A>, reason: &str) -> ! {
        g.fatal_append(reason);
        crate::trace!("pod: FATAL: {}", reason);
        A::halt(reason)
    }

    // ------------------------------------------------------------------
    // Time source
    // ------------------------------------------------------------------

    /// Activate the master time base and take over the hardware clock on
    /// every online CPU.
    ///
    /// When the architecture reports a periodic host tick is still needed
    /// (return value > 1), the slot's host timer is armed periodically
    /// with that period; otherwise it is armed one-shot. On a per-CPU
    /// failure, timers already started are stopped and the error returned.
    pub fn enable_timesource(&self) -> PodResult<()> {
        let mut g = self.state.lock_irqsave();
        if !g.status.contains(PodFlags::ACTIVE) {
            return Err(Error::NoSys);
        }
        g.tbase.set_running(true);
        let ncpus = g.slots.len();
        drop(g);

        let offset = A::get_host_time().wrapping_add(A::get_cpu_time());
        self.state.lock_irqsave().tbase.set_wallclock_offset(offset);

        for cpu in 0..ncpus {
            // The hardware timer must be set up before any slot timer is
            // armed, and without holding the pod lock.
            let htick = match A::start_timer(cpu) {
                Ok(v) => v,
                Err(err) => {
                    for started in 0..cpu {
                        A::stop_timer(started);
                    }
                    self.state.lock_irqsave().tbase.set_running(false);
                    return Err(err);
                }
            };

            let mut g = self.state.lock_irqsave();
            let now = g.tbase.rawclock();
            if htick > 1 {
                let period = htick as Ticks;
                let _ = g.slots[cpu]
                    .htimer
                    .start(now, 0, period, period, TimeoutMode::Relative);
            } else {
                let _ = g.slots[cpu]
                    .htimer
                    .start(now, 0, 0, TICK_INFINITE, TimeoutMode::Relative);
            }
            #[cfg(feature = "watchdog")]
            {
                let _ = g.slots[cpu].wdtimer.start(
                    now,
                    0,
                    WATCHDOG_PERIOD,
                    WATCHDOG_PERIOD,
                    TimeoutMode::Relative,
                );
                g.slots[cpu].reset_watchdog();
            }
        }

        Ok(())
    }

    /// Stop the master time base and release the hardware clocks.
    pub fn disable_timesource(&self) {
        let mut g = self.state.lock_irqsave();
        if !g.status.contains(PodFlags::ACTIVE) || !g.tbase.running() {
            return;
        }
        g.tbase.set_running(false);
        let ncpus = g.slots.len();
        drop(g);

        // Stopping the hardware timer with the pod lock held could
        // deadlock against a remote CPU spinning in its tick path.
        for cpu in 0..ncpus {
            A::stop_timer(cpu);
        }

        let mut g = self.state.lock_irqsave();
        for cpu in 0..ncpus {
            g.slots[cpu].htimer.stop();
            g.slots[cpu].wdtimer.stop();
        }
    }

    /// Process one hardware tick on `cpu`: advance the master clock (CPU 0
    /// leads it), fire elapsed slot and thread timers, account the running
    /// thread's round-robin credit, then apply any pending reschedule.
    pub fn clock_tick(&self, cpu: CpuId) {
        let mut g = self.state.lock_irqsave();
        if !g.status.contains(PodFlags::ACTIVE) || !g.tbase.running() || cpu >= g.slots.len() {
            return;
        }

        let now = if cpu == 0 {
            g.tbase.tick()
        } else {
            g.tbase.rawclock()
        };

        if g.slots[cpu].htimer.fire_check(now) {
            crate::trace!("pod: host tick relay on cpu {}", cpu);
        }

        #[cfg(feature = "watchdog")]
        if g.slots[cpu].wdtimer.fire_check(now) {
            g = self.watchdog_expire(g, cpu);
        }

        // Thread timers bound to this CPU.
        for key in g.order.clone() {
            if g.arena[key].is_none() {
                continue;
            }
            let (rfired, pfired) = {
                let tcb = g.tcb_mut(key);
                let rfired = tcb.rtimer.sched() == cpu && tcb.rtimer.fire_check(now);
                let pfired = tcb.ptimer.sched() == cpu && tcb.ptimer.fire_check(now);
                (rfired, pfired)
            };
            if rfired {
                g.tcb_mut(key).set_info(crate::thread::ThreadInfo::TIMEO);
                self.resume_inner(&mut g, key, ThreadState::DELAY);
            }
            if pfired {
                self.resume_inner(&mut g, key, ThreadState::DELAY);
            }
        }

        // Round-robin credit of the running thread.
        let curr = g.slots[cpu].curr;
        let quantum_out = {
            let tcb = g.tcb_mut(curr);
            if tcb.test_state(ThreadState::RRB) && tcb.rrcredit != TICK_INFINITE {
                tcb.rrcredit -= 1;
                if tcb.rrcredit == 0 {
                    tcb.rrcredit = tcb.rrperiod;
                    tcb.rr_expired = true;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if quantum_out {
            g.set_resched(cpu);
        }

        g = self.do_schedule(g);
        drop(g);
    }

    #[cfg(feature = "watchdog")]
    fn watchdog_expire<'a>(&'a self, mut g: Guard<'a, A>, cpu: CpuId) -> Guard<'a, A> {
        let curr = g.slots[cpu].curr;
        if curr == g.slots[cpu].root {
            g.slots[cpu].reset_watchdog();
            return g;
        }
        g.slots[cpu].wd_ticks += 1;
        if g.slots[cpu].wd_ticks < WATCHDOG_ROUNDS {
            return g;
        }
        let name = alloc::format!("watchdog triggered on cpu {} against {}", cpu, g.tcb(curr).name());
        if g.tcb(curr).test_state(ThreadState::SHADOW) {
            if let Some(bridge) = self.bridge.as_deref() {
                crate::trace!("pod: {}; relaxing", name);
                g.slots[cpu].reset_watchdog();
                drop(g);
                bridge.shadow_relax(true);
                return self.state.lock_irqsave();
            }
        }
        self.fatal_in(&mut g, &name)
    }

    // ------------------------------------------------------------------
    // Rescheduling entry points shared with interrupt code
    // ------------------------------------------------------------------

    /// The rescheduling IPI handler. Clears a pending remote-pick request,
    /// marks the local slot for a re-pick and reschedules.
    pub fn schedule_handler(&self) {
        let cpu = A::current_cpu();
        let rpick = {
            let mut g = self.state.lock_irqsave();
            if cpu >= g.slots.len() {
                return;
            }
            let rpick = g.slots[cpu].status.contains(SlotFlags::RPICK);
            g.slots[cpu].status.remove(SlotFlags::RPICK);
            g.set_resched(cpu);
            rpick
        };
        if rpick {
            if let Some(bridge) = self.bridge.as_deref() {
                bridge.shadow_rpi_check();
            }
        }
        self.schedule();
    }

    /// Reschedule only if the current slot has a pending request.
    pub fn schedule_deferred(&self) {
        let pending = {
            let g = self.state.lock_irqsave();
            g.status.contains(PodFlags::ACTIVE)
                && g.slots[A::current_cpu()].resched_pending()
        };
        if pending {
            self.schedule();
        }
    }

    /// Store this pod as the process-wide instance.
    ///
    /// # Safety
    ///
    /// The pod must outlive every later call to [`global`], and all users
    /// must agree on the `A` parameter.
    pub unsafe fn register_global(&'static self) {
        GLOBAL_POD.store(self as *const _ as *mut (), Ordering::Release);
    }
}

/// The pod registered with [`Pod::register_global`], if any.
pub fn global<A: Arch>() -> Option<&'static Pod<A>> {
    let ptr = GLOBAL_POD.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*(ptr as *const Pod<A>) })
    }
}

fn hook_index(kind: HookType) -> usize {
    match kind {
        HookType::Start => 0,
        HookType::Switch => 1,
        HookType::Delete => 2,
    }
}
