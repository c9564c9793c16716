//! Deterministic test platform ("Supply a deterministic test
//! platform that advances time logically").
//!
//! Only compiled for `cfg(test)`; pulls in `std` purely for interior
//! mutability convenience (`Cell`) and a capturing console buffer, not
//! because the core needs it.

extern crate std;

use crate::platform::{MemRegion, MemRegionKind, Platform};
use core::cell::{Cell, RefCell};
use std::vec::Vec;

/// A fake platform whose clock advances only when the test tells it to.
pub struct FakePlatform {
    cycles: Cell<u64>,
    cycles_per_tick: Cell<u64>,
    sleeps_ms: RefCell<Vec<u64>>,
    console: RefCell<Vec<u8>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        FakePlatform {
            cycles: Cell::new(0),
            cycles_per_tick: Cell::new(1),
            sleeps_ms: RefCell::new(Vec::new()),
            console: RefCell::new(Vec::new()),
        }
    }

    /// Advance the logical clock directly, bypassing tick accounting.
    pub fn advance_cycles(&self, n: u64) {
        self.cycles.set(self.cycles.get() + n);
    }

    pub fn set_cycles_per_tick(&self, n: u64) {
        self.cycles_per_tick.set(n);
    }

    pub fn sleep_log(&self) -> Vec<u64> {
        self.sleeps_ms.borrow().clone()
    }

    pub fn console_log(&self) -> Vec<u8> {
        self.console.borrow().clone()
    }

    /// Build a single `{available @ base..base+len}` region, the "memmap"
    /// shorthand used throughout the test scenarios below.
    pub fn simple_mmap(base: u64, len: u64) -> [MemRegion; 1] {
        [MemRegion {
            base,
            length: len,
            kind: MemRegionKind::Available,
        }]
    }
}

impl Platform for FakePlatform {
    fn now_cycles(&self) -> u64 {
        self.cycles.get()
    }

    fn busy_wait_ticks(&self, ticks: u64) {
        self.advance_cycles(ticks * self.cycles_per_tick.get());
    }

    fn sleep_ms(&self, ms: u64) {
        self.sleeps_ms.borrow_mut().push(ms);
        // Sleeping logically advances the clock too, so adaptive-poll
        // deadlines actually expire in tests without a real wall clock.
        self.advance_cycles(ms * 1000 * self.cycles_per_tick.get().max(1));
    }

    unsafe fn phys_to_virt(&self, addr: u64) -> *mut u8 {
        addr as *mut u8
    }

    fn console_write(&self, bytes: &[u8]) {
        self.console.borrow_mut().extend_from_slice(bytes);
    }
}
