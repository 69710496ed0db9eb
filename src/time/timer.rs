//! Software timers over the master time base.
//!
//! Each thread owns a resume timer and a periodic timer; each scheduler slot
//! owns a host-tick timer and a watchdog timer. Timers are bound to a CPU
//! slot and fire from that CPU's `clock_tick` path.

use super::{TimeoutMode, Ticks, TICK_INFINITE};
use crate::cpumask::CpuId;

/// A one-shot or periodic software timer.
///
/// The `pexpect` field tracks the date the timer's owner is expected to
/// consume next; the gap between it and the raw clock yields the overrun
/// count for periodic release points.
#[derive(Debug, Clone)]
pub struct Timer {
    armed: bool,
    date: Ticks,
    interval: Ticks,
    pexpect: Ticks,
    cpu: CpuId,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub const fn new() -> Self {
        Self {
            armed: false,
            date: 0,
            interval: TICK_INFINITE,
            pexpect: 0,
            cpu: 0,
        }
    }

    /// Bind the timer to a CPU slot. Expiry checks run on that CPU's tick.
    pub fn set_sched(&mut self, cpu: CpuId) {
        self.cpu = cpu;
    }

    pub fn sched(&self) -> CpuId {
        self.cpu
    }

    pub fn running(&self) -> bool {
        self.armed
    }

    pub fn interval(&self) -> Ticks {
        self.interval
    }

    /// Expected date of the next release point.
    pub fn pexpect(&self) -> Ticks {
        self.pexpect
    }

    /// Arm the timer.
    ///
    /// `value` is interpreted per `mode`; `interval` of [`TICK_INFINITE`]
    /// makes the timer one-shot. Fails when an absolute date has already
    /// elapsed, leaving the timer disarmed.
    pub fn start(
        &mut self,
        now: Ticks,
        wallclock_offset: Ticks,
        value: Ticks,
        interval: Ticks,
        mode: TimeoutMode,
    ) -> Result<(), ()> {
        let date = match mode {
            TimeoutMode::Relative => now + value,
            TimeoutMode::Absolute => value,
            TimeoutMode::Realtime => value.wrapping_sub(wallclock_offset),
        };

        if mode != TimeoutMode::Relative && date <= now {
            self.armed = false;
            return Err(());
        }

        self.date = date;
        self.interval = interval;
        self.pexpect = date;
        self.armed = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.armed = false;
    }

    /// Check the timer against the clock; returns whether it fired.
    ///
    /// A periodic timer is pushed past `now` so a late tick fires it once;
    /// missed periods are recovered by [`Timer::get_overruns`].
    pub(crate) fn fire_check(&mut self, now: Ticks) -> bool {
        if !self.armed || now < self.date {
            return false;
        }
        if self.interval == TICK_INFINITE {
            self.armed = false;
        } else {
            while self.date <= now {
                self.date += self.interval;
            }
        }
        true
    }

    /// Push the expected-arrival date one interval forward.
    pub fn pexpect_forward(&mut self) {
        self.pexpect += self.interval;
    }

    /// Count release points missed since the last consumed one, and advance
    /// the expected arrival past them plus the one being consumed now.
    pub fn get_overruns(&mut self, now: Ticks) -> u64 {
        let mut overruns = 0;
        if now > self.pexpect {
            let delta = now - self.pexpect;
            if delta >= self.interval {
                overruns = delta / self.interval;
            }
        }
        self.pexpect += (overruns + 1) * self.interval;
        overruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_start_and_fire() {
        let mut t = Timer::new();
        t.start(5, 0, 10, TICK_INFINITE, TimeoutMode::Relative).unwrap();
        assert!(t.running());
        assert!(!t.fire_check(14));
        assert!(t.fire_check(15));
        assert!(!t.running());
    }

    #[test]
    fn absolute_past_date_rejected() {
        let mut t = Timer::new();
        assert!(t.start(20, 0, 10, TICK_INFINITE, TimeoutMode::Absolute).is_err());
        assert!(!t.running());
    }

    #[test]
    fn realtime_date_is_offset_corrected() {
        let mut t = Timer::new();
        // Wall-clock date 100 with offset 40 lands at raw date 60.
        t.start(50, 40, 100, TICK_INFINITE, TimeoutMode::Realtime).unwrap();
        assert!(!t.fire_check(59));
        assert!(t.fire_check(60));
    }

    #[test]
    fn periodic_catches_up_after_late_tick() {
        let mut t = Timer::new();
        t.start(0, 0, 10, 10, TimeoutMode::Relative).unwrap();
        assert!(t.fire_check(10));
        // Tick arrives late, past two more periods: fires once, re-aims past now.
        assert!(t.fire_check(35));
        assert!(!t.fire_check(39));
        assert!(t.fire_check(40));
    }

    #[test]
    fn overrun_accounting() {
        let mut t = Timer::new();
        t.start(0, 0, 10, 10, TimeoutMode::Relative).unwrap();
        // First release consumed on time.
        assert_eq!(t.get_overruns(10), 0);
        // Consumer shows up 25 ticks late: one full period missed.
        assert_eq!(t.get_overruns(35), 1);
        // Back on schedule.
        assert_eq!(t.get_overruns(40), 0);
    }
}
