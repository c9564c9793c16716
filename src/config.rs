//! ZENEDGE compile-time capacities.
//!
//! All bounds in the spec ("MAX_STEPS=32", "bounded, e.g. 16", ...) live
//! here as `const`s rather than scattered through the modules that use them.

/// Bytes per physical frame.
pub const FRAME_SIZE: usize = 4096;

/// Pages carved out of the front of the usable range at PMM init, before the
/// NUMA split, for conventional low memory and the kernel image ("Reserve
/// low memory and the kernel image"). 256 pages (1 MiB) each.
pub const PMM_RESERVED_LOW_MEM_PAGES: u64 = 256;
pub const PMM_RESERVED_KERNEL_IMAGE_PAGES: u64 = 256;
pub const PMM_RESERVED_PAGES: u64 = PMM_RESERVED_LOW_MEM_PAGES + PMM_RESERVED_KERNEL_IMAGE_PAGES;

/// Job graph bounds.
pub const MAX_STEPS: usize = 32;
pub const MAX_TENSORS: usize = 64;
pub const MAX_DEPS: usize = 4;
pub const MAX_INPUTS: usize = 4;
pub const MAX_OUTPUTS: usize = 2;

/// Flight recorder ring capacity; must be a power of two.
pub const RECORDER_CAPACITY: usize = 256;

/// Bounded table of concurrently open spans.
pub const MAX_ACTIVE_SPANS: usize = 16;

/// Fixed-size contract registry ("small fixed-size contract registry").
pub const MAX_CONTRACTS: usize = 64;

/// Shared blob heap block size in bytes.
pub const BLOB_BLOCK_SIZE: usize = 64;

/// Local blob index capacity per side of the shared heap.
pub const MAX_BLOB_INDEX: usize = 256;

/// Default adaptive-poll spin budget before falling back to sleeping, in
/// microseconds ("up to a short budget (e.g. 100 ms of wall time)").
pub const DEFAULT_POLL_SPIN_BUDGET_US: u64 = 100_000;

/// Default sleep granularity once adaptive polling stops spinning.
pub const DEFAULT_POLL_SLEEP_MS: u64 = 1;

/// Default total deadline for an offload wait ("default 5 s").
pub const DEFAULT_POLL_DEADLINE_US: u64 = 5_000_000;

/// Per-step-type CPU cost estimates used by admission.
pub mod cpu_estimate_us {
    pub const COMPUTE: u64 = 1000;
    pub const COLLECTIVE: u64 = 3000;
    pub const IO: u64 = 2000;
    pub const CONTROL: u64 = 100;
}

/// Contract state-machine thresholds.
pub const CPU_VIOLATIONS_TO_SAFE_MODE: u32 = 3;
pub const MEM_VIOLATIONS_TO_SAFE_MODE: u32 = 2;
