//! Monotonic cycle counter and calibrated microsecond clock.

use crate::platform::Platform;

/// Fallback calibration used when no interval timer is available at init
/// ("If no timer is available, fall back to a documented
/// default (e.g. 1000 MHz)").
pub const DEFAULT_CYCLES_PER_US: u64 = 1000;

/// Calibrated time source. `cycles_per_us` is fixed once at [`Clock::calibrate`]
/// and never changes afterwards.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    boot_cycles: u64,
    cycles_per_us: u64,
}

impl Clock {
    /// Calibrate against the platform interval timer by busy-waiting
    /// `wait_ms` milliseconds and measuring elapsed cycles. `wait_ms == 0`
    /// is treated as "no timer available" and falls back to
    /// [`DEFAULT_CYCLES_PER_US`].
    pub fn calibrate(platform: &dyn Platform, wait_ms: u64, ticks_per_ms: u64) -> Self {
        let boot_cycles = platform.now_cycles();
        if wait_ms == 0 || ticks_per_ms == 0 {
            return Clock {
                boot_cycles,
                cycles_per_us: DEFAULT_CYCLES_PER_US,
            };
        }

        let start = platform.now_cycles();
        platform.busy_wait_ticks(wait_ms * ticks_per_ms);
        let elapsed = platform.now_cycles().saturating_sub(start);
        let micros = wait_ms.saturating_mul(1000);
        let cycles_per_us = if micros == 0 { DEFAULT_CYCLES_PER_US } else { (elapsed / micros).max(1) };

        Clock {
            boot_cycles,
            cycles_per_us,
        }
    }

    /// Construct directly from a known calibration, bypassing the platform
    /// wait — used by deterministic test platforms.
    pub const fn from_calibration(boot_cycles: u64, cycles_per_us: u64) -> Self {
        Clock {
            boot_cycles,
            cycles_per_us: if cycles_per_us == 0 { DEFAULT_CYCLES_PER_US } else { cycles_per_us },
        }
    }

    pub fn cycles_per_us(&self) -> u64 {
        self.cycles_per_us
    }

    pub fn now_cycles(&self, platform: &dyn Platform) -> u64 {
        platform.now_cycles()
    }

    pub fn now_us(&self, platform: &dyn Platform) -> u64 {
        self.cycles_to_us(platform.now_cycles().saturating_sub(self.boot_cycles))
    }

    pub fn cycles_to_us(&self, cycles: u64) -> u64 {
        cycles / self.cycles_per_us
    }

    pub fn us_to_cycles(&self, us: u64) -> u64 {
        us.saturating_mul(self.cycles_per_us)
    }
}
