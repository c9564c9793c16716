//! ZENEDGE governed execution substrate.
//!
//! A small, auditable kernel core: a NUMA-aware physical memory manager, a
//! per-job budget (contract) state machine, a bounded job graph, a
//! shared-memory command/response transport to an accelerator, a shared
//! blob heap, a flight recorder, and the scheduler that ties them together.
//!
//! `no_std` + `alloc`: this crate assumes a global allocator is installed by
//! its embedder (the boot/arch glue, out of scope here) and never touches
//! hardware directly — everything platform-specific goes through the
//! [`platform::Platform`] trait.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod blobheap;
pub mod config;
pub mod contract;
pub mod diag;
pub mod error;
pub mod ipc;
pub mod job;
pub mod pmm;
pub mod platform;
pub mod recorder;
pub mod scheduler;
pub mod time;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use platform::Platform;

/// Everything the governed execution substrate owns, wired together at
/// boot instead of reached for through global statics.
pub struct KernelContext<'p> {
    pub platform: &'p dyn Platform,
    pub clock: time::Clock,
    pub recorder: recorder::FlightRecorder,
    pub pmm: pmm::Pmm,
    pub contracts: contract::ContractEngine,
    pub transport: ipc::IpcTransport,
    pub blobs: blobheap::BlobHeap,
}

impl<'p> KernelContext<'p> {
    /// Calibrate the clock, initialize the PMM from `mmap`, and bring up an
    /// empty contract registry, IPC transport, and blob heap.
    pub fn init(platform: &'p dyn Platform, mmap: &[platform::MemRegion], timer_wait_ms: u64, ticks_per_ms: u64, blob_blocks: usize) -> Self {
        let clock = time::Clock::calibrate(platform, timer_wait_ms, ticks_per_ms);
        let mut recorder = recorder::FlightRecorder::new(clock);
        let pmm = pmm::Pmm::init(&mut recorder, platform, mmap);
        KernelContext {
            platform,
            clock,
            recorder,
            pmm,
            contracts: contract::ContractEngine::new(),
            transport: ipc::IpcTransport::new(),
            blobs: blobheap::BlobHeap::init(blob_blocks),
        }
    }

    /// Run `job` under `job_id`'s contract with the default adaptive-poll
    /// parameters. Returns the job's stats record
    /// on a normal drain; `Err(SafeModeDenied)` if the contract
    /// entered `SAFE_MODE` mid-run (call [`FlightRecorder::job_stats`]
    /// directly for the partial record in that case).
    pub fn run_job(&mut self, job: &mut job::JobGraph, job_id: u32) -> Result<recorder::JobStats> {
        scheduler::run_job(
            &mut self.recorder,
            self.platform,
            &self.clock,
            &self.transport,
            &mut self.contracts,
            job,
            job_id,
            scheduler::PollConfig::default(),
        )
    }

    /// Build a `KernelContext` against a deterministic test platform.
    #[cfg(test)]
    pub fn with_test_platform(platform: &'p test_support::FakePlatform, mmap: &[platform::MemRegion], blob_blocks: usize) -> Self {
        Self::init(platform, mmap, 0, 0, blob_blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Contract, Priority};
    use crate::job::{tensor::Dtype, JobGraph, StepType};
    use crate::pmm::Node;
    use crate::test_support::FakePlatform;

    #[test]
    fn kernel_context_boots_and_admits_a_job() {
        let plat = FakePlatform::new();
        let mmap = FakePlatform::simple_mmap(0x10_0000, 64 * config::FRAME_SIZE as u64);
        let mut ctx = KernelContext::with_test_platform(&plat, &mmap, 32);

        let contract = Contract::new(1, 10_000, 64, Priority::Normal);
        ctx.contracts.apply(&mut ctx.recorder, ctx.platform, contract).unwrap();

        let mut job = JobGraph::init(1);
        job.add_step(1, StepType::Control).unwrap();
        job.add_tensor(1, Dtype::Fp32, 16, false, Node::Local).unwrap();
        job.step_add_output(1, 1).unwrap();
        job.compute_memory();

        let verdict = ctx.contracts.admit(&mut ctx.recorder, ctx.platform, 1, &job).unwrap();
        assert_eq!(verdict, contract::Admission::Ok);

        let stats = ctx.run_job(&mut job, 1).unwrap();
        assert!(job.all_completed());
        assert_eq!(stats.steps_completed, 1);
    }
}
