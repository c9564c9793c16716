//! Flight recorder: a lock-free, single-producer, fixed-size event ring.
//!
//! Events are totally ordered by append, never by timestamp:
//! `ts_cycles`/`ts_us` are monotone-non-decreasing but two events logged in
//! the same tick can carry equal timestamps.

use crate::config::{MAX_ACTIVE_SPANS, RECORDER_CAPACITY};
use crate::platform::Platform;
use crate::time::Clock;
use core::sync::atomic::{AtomicU64, Ordering};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Event kind tags: the single vocabulary every subsystem logs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    StepStart = 1,
    StepEnd = 2,
    MemLocalityMiss = 3,
    MemNodeUnsupported = 4,
    MemAllocFail = 5,
    MemAlloc = 6,
    MemFree = 7,
    ContractApply = 8,
    ContractBudgetExceed = 9,
    ContractBudgetWarn = 10,
    ContractStateChange = 11,
    ContractSafeMode = 12,
    JobAdmit = 13,
    JobReject = 14,
    JobSubmit = 15,
    JobComplete = 16,
    SpanOverflow = 17,
}

/// Fixed 32-byte event record ("Flight event").
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct Event {
    pub ts_us: u64,
    pub ts_cycles: u64,
    pub kind: u8,
    pub flags: u8,
    pub cpu_id: u16,
    pub job_id: u32,
    pub step_id: u32,
    pub extra: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Event>(), 32);

impl Event {
    pub fn event_type(&self) -> Option<EventType> {
        use EventType::*;
        Some(match self.kind {
            1 => StepStart,
            2 => StepEnd,
            3 => MemLocalityMiss,
            4 => MemNodeUnsupported,
            5 => MemAllocFail,
            6 => MemAlloc,
            7 => MemFree,
            8 => ContractApply,
            9 => ContractBudgetExceed,
            10 => ContractBudgetWarn,
            11 => ContractStateChange,
            12 => ContractSafeMode,
            13 => JobAdmit,
            14 => JobReject,
            15 => JobSubmit,
            16 => JobComplete,
            17 => SpanOverflow,
            _ => return None,
        })
    }
}

/// Handle returned by [`FlightRecorder::begin_span`]. An invalid handle
/// (span table full) makes `end_span` a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanHandle(Option<usize>);

impl SpanHandle {
    const INVALID: SpanHandle = SpanHandle(None);
}

#[derive(Debug, Clone, Copy)]
struct ActiveSpan {
    in_use: bool,
    start_type: EventType,
    job_id: u32,
    step_id: u32,
    start_cycles: u64,
}

const EMPTY_SPAN: ActiveSpan = ActiveSpan {
    in_use: false,
    start_type: EventType::StepStart,
    job_id: 0,
    step_id: 0,
    start_cycles: 0,
};

/// Per-job summary returned by [`FlightRecorder::job_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub total_cpu_us: u64,
    pub violations: u32,
    pub wall_span_us: u64,
    pub steps_completed: u32,
}

/// Lock-free single-producer append-only ring of [`Event`]s.
///
/// `head` is a monotone counter (never wraps modulo capacity itself); the
/// stored slot is `head % N`. Once `head >= N` the buffer overwrites the
/// oldest event.
pub struct FlightRecorder {
    clock: Clock,
    head: AtomicU64,
    events: [Event; RECORDER_CAPACITY],
    spans: [ActiveSpan; MAX_ACTIVE_SPANS],
}

const ZERO_EVENT: Event = Event {
    ts_us: 0,
    ts_cycles: 0,
    kind: 0,
    flags: 0,
    cpu_id: 0,
    job_id: 0,
    step_id: 0,
    extra: 0,
};

impl FlightRecorder {
    pub fn new(clock: Clock) -> Self {
        static_assertions::const_assert!(RECORDER_CAPACITY.is_power_of_two());
        FlightRecorder {
            clock,
            head: AtomicU64::new(0),
            events: [ZERO_EVENT; RECORDER_CAPACITY],
            spans: [EMPTY_SPAN; MAX_ACTIVE_SPANS],
        }
    }

    /// Number of events ever appended (monotone, never decreases).
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Relaxed)
    }

    /// Append one event stamped with the current time.
    pub fn log(&mut self, platform: &dyn Platform, kind: EventType, job_id: u32, step_id: u32, extra: u32) {
        let cycles = platform.now_cycles();
        let us = self.clock.now_us(platform);
        let idx = (self.head.load(Ordering::Relaxed) % RECORDER_CAPACITY as u64) as usize;
        self.events[idx] = Event {
            ts_us: us,
            ts_cycles: cycles,
            kind: kind as u8,
            flags: 0,
            cpu_id: 0,
            job_id,
            step_id,
            extra,
        };
        self.head.fetch_add(1, Ordering::Release);
    }

    /// Begin a span: logs `start_type` and reserves a slot in the active
    /// span table. Returns an invalid handle (and logs `SpanOverflow`) if
    /// the table is full.
    pub fn begin_span(&mut self, platform: &dyn Platform, start_type: EventType, job_id: u32, step_id: u32) -> SpanHandle {
        let start_cycles = platform.now_cycles();
        if let Some(slot) = self.spans.iter().position(|s| !s.in_use) {
            self.spans[slot] = ActiveSpan {
                in_use: true,
                start_type,
                job_id,
                step_id,
                start_cycles,
            };
            self.log(platform, start_type, job_id, step_id, 0);
            SpanHandle(Some(slot))
        } else {
            self.log(platform, EventType::SpanOverflow, job_id, step_id, 0);
            SpanHandle::INVALID
        }
    }

    /// End a span: logs `end_type` with `extra = duration_us`, frees the
    /// slot. No-op for an invalid handle.
    pub fn end_span(&mut self, platform: &dyn Platform, handle: SpanHandle, end_type: EventType) {
        let Some(slot) = handle.0 else { return };
        let span = self.spans[slot];
        if !span.in_use {
            return;
        }
        let end_cycles = platform.now_cycles();
        let duration_cycles = end_cycles.saturating_sub(span.start_cycles);
        let duration_us = self.clock.cycles_to_us(duration_cycles);
        self.spans[slot].in_use = false;
        self.log(platform, end_type, span.job_id, span.step_id, duration_us as u32);
    }

    /// Oldest-to-newest iterator over the last `min(head, N)` events.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        let head = self.head.load(Ordering::Acquire);
        let count = head.min(RECORDER_CAPACITY as u64) as usize;
        let start = if head > RECORDER_CAPACITY as u64 {
            (head % RECORDER_CAPACITY as u64) as usize
        } else {
            0
        };
        (0..count).map(move |i| &self.events[(start + i) % RECORDER_CAPACITY])
    }

    /// Newest-to-oldest scan for the most recent `STEP_END` matching both
    /// ids; returns 0 if none.
    pub fn last_duration(&self, job_id: u32, step_id: u32) -> u32 {
        for ev in self.iter_rev() {
            if ev.event_type() == Some(EventType::StepEnd) && ev.job_id == job_id && ev.step_id == step_id {
                return ev.extra;
            }
        }
        0
    }

    fn iter_rev(&self) -> impl Iterator<Item = &Event> {
        let head = self.head.load(Ordering::Acquire);
        let count = head.min(RECORDER_CAPACITY as u64) as usize;
        let start = if head > RECORDER_CAPACITY as u64 {
            (head % RECORDER_CAPACITY as u64) as usize
        } else {
            0
        };
        (0..count).rev().map(move |i| &self.events[(start + i) % RECORDER_CAPACITY])
    }

    /// Write every surviving event to `platform`'s console, oldest first,
    /// one line per event.
    pub fn dump(&self, platform: &dyn Platform) {
        for ev in self.iter() {
            let Some(kind) = ev.event_type() else { continue };
            let mut line = arrayvec::ArrayString::<96>::new();
            let _ = core::fmt::write(
                &mut line,
                format_args!(
                    "[{} us] {:?} job={} step={} extra={}\n",
                    ev.ts_us, kind, ev.job_id, ev.step_id, ev.extra
                ),
            );
            platform.console_write(line.as_bytes());
        }
    }

    /// Sum of `STEP_END` durations, count of violation-class events, and
    /// wall span restricted to `job_id`.
    pub fn job_stats(&self, job_id: u32) -> JobStats {
        let mut stats = JobStats::default();
        let mut min_ts = u64::MAX;
        let mut max_ts = 0u64;
        let mut any = false;

        for ev in self.iter() {
            if ev.job_id != job_id {
                continue;
            }
            any = true;
            min_ts = min_ts.min(ev.ts_us);
            max_ts = max_ts.max(ev.ts_us);
            match ev.event_type() {
                Some(EventType::StepEnd) => {
                    stats.total_cpu_us += ev.extra as u64;
                    stats.steps_completed += 1;
                }
                Some(
                    EventType::MemAllocFail
                    | EventType::ContractBudgetExceed
                    | EventType::MemLocalityMiss
                    | EventType::MemNodeUnsupported
                    | EventType::SpanOverflow,
                ) => stats.violations += 1,
                _ => {}
            }
        }

        stats.wall_span_us = if any { max_ts.saturating_sub(min_ts) } else { 0 };
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakePlatform;
    use crate::time::Clock;

    fn recorder() -> (FlightRecorder, FakePlatform) {
        (FlightRecorder::new(Clock::from_calibration(0, 1)), FakePlatform::new())
    }

    #[test]
    fn span_duration_matches_elapsed_cycles() {
        let (mut rec, plat) = recorder();
        let h = rec.begin_span(&plat, EventType::StepStart, 1, 2);
        plat.advance_cycles(900);
        rec.end_span(&plat, h, EventType::StepEnd);
        assert_eq!(rec.last_duration(1, 2), 900);
    }

    #[test]
    fn overflowing_span_table_yields_invalid_handle() {
        let (mut rec, plat) = recorder();
        let mut handles = alloc::vec::Vec::new();
        for i in 0..MAX_ACTIVE_SPANS {
            handles.push(rec.begin_span(&plat, EventType::StepStart, 0, i as u32));
        }
        let overflow = rec.begin_span(&plat, EventType::StepStart, 0, 999);
        assert_eq!(overflow, SpanHandle::INVALID);
        // ending an invalid handle is a no-op, not a panic
        rec.end_span(&plat, overflow, EventType::StepEnd);
    }

    #[test]
    fn ring_overwrites_oldest_once_full() {
        let (mut rec, plat) = recorder();
        for i in 0..(RECORDER_CAPACITY as u32 * 2) {
            rec.log(&plat, EventType::JobSubmit, i, 0, 0);
        }
        assert_eq!(rec.iter().count(), RECORDER_CAPACITY);
        // oldest surviving event should be from the second half
        let oldest = rec.iter().next().unwrap();
        assert!(oldest.job_id >= RECORDER_CAPACITY as u32);
    }

    #[test]
    fn job_stats_sum_step_end_and_violations() {
        let (mut rec, plat) = recorder();
        rec.log(&plat, EventType::StepEnd, 7, 1, 100);
        rec.log(&plat, EventType::StepEnd, 7, 2, 200);
        rec.log(&plat, EventType::ContractBudgetExceed, 7, 2, 0);
        rec.log(&plat, EventType::StepEnd, 8, 1, 999);
        let stats = rec.job_stats(7);
        assert_eq!(stats.total_cpu_us, 300);
        assert_eq!(stats.steps_completed, 2);
        assert_eq!(stats.violations, 1);
    }
}
