//! Drives one [`JobGraph`] to completion against a [`ContractEngine`],
//! dispatching `COMPUTE` steps over the [`IpcTransport`] with an adaptive
//! spin-then-sleep wait.

use crate::config;
use crate::contract::ContractEngine;
use crate::error::{Error, Result};
use crate::ipc::{CommandCode, CommandFlags, IpcTransport, ResponsePacket};
use crate::job::{JobGraph, StepId, StepType};
use crate::platform::Platform;
use crate::recorder::{EventType, FlightRecorder, JobStats};
use crate::time::Clock;
use log::warn;

/// Spin-then-sleep parameters for an offload wait ("spin for
/// up to a short budget, then fall back to sleeping in small increments
/// until a deadline").
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub spin_budget_us: u64,
    pub sleep_ms: u64,
    pub deadline_us: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            spin_budget_us: config::DEFAULT_POLL_SPIN_BUDGET_US,
            sleep_ms: config::DEFAULT_POLL_SLEEP_MS,
            deadline_us: config::DEFAULT_POLL_DEADLINE_US,
        }
    }
}

/// Spin on `transport` while elapsed time is under `spin_budget_us`, then
/// switch to sleeping `sleep_ms` at a time until `deadline_us` total has
/// elapsed. Returns `Err(Timeout)` past the deadline.
pub fn adaptive_wait_for_response(
    transport: &IpcTransport,
    platform: &dyn Platform,
    clock: &Clock,
    cfg: PollConfig,
) -> Result<ResponsePacket> {
    let start_us = clock.now_us(platform);
    loop {
        if let Ok(packet) = transport.try_recv_response() {
            return Ok(packet);
        }
        let elapsed = clock.now_us(platform).saturating_sub(start_us);
        if elapsed >= cfg.deadline_us {
            return Err(Error::Timeout);
        }
        if elapsed < cfg.spin_budget_us {
            // A real spin loop burns cycles just by re-checking the ring;
            // the fake platform's clock only advances when told to, so make
            // that explicit with a single-tick busy-wait per iteration.
            platform.busy_wait_ticks(1);
            continue;
        }
        platform.sleep_ms(cfg.sleep_ms);
    }
}

/// Dispatch one `COMPUTE` step over the transport and wait for its
/// response. `payload_id` is the step's first input tensor if it has one,
/// else 0 ("pick `payload_id = s.inputs[0]` if present else 0").
pub fn dispatch_compute_step(
    transport: &IpcTransport,
    platform: &dyn Platform,
    clock: &Clock,
    cfg: PollConfig,
    payload_id: u32,
) -> Result<ResponsePacket> {
    transport.send_command(platform, clock, CommandCode::RunModel, CommandFlags::IRQ_ON_COMPLETE, payload_id)?;
    adaptive_wait_for_response(transport, platform, clock, cfg)
}

/// Run every step of `job` to completion in `next_ready` order, charging
/// CPU time against `job_id`'s contract after each step and stopping the
/// moment the contract enters `SAFE_MODE`. A step whose
/// dispatch times out is never retried and never marked completed — it
/// (and anything depending on it) simply never becomes eligible again; the
/// scheduler moves on to whatever else is ready.
///
/// Logs exactly one `JOB_COMPLETE` per call, win or cancel: on a normal
/// drain of `next_ready` or on a `SAFE_MODE` cancellation. The returned
/// [`JobStats`] is the stats record the caller gets regardless of which
/// path ended the run.
pub fn run_job(
    recorder: &mut FlightRecorder,
    platform: &dyn Platform,
    clock: &Clock,
    transport: &IpcTransport,
    contracts: &mut ContractEngine,
    job: &mut JobGraph,
    job_id: u32,
    poll: PollConfig,
) -> Result<JobStats> {
    recorder.log(platform, EventType::JobSubmit, job_id, job.steps().len() as u32, 0);

    let mut skipped: heapless::Vec<StepId, { config::MAX_STEPS }> = heapless::Vec::new();
    let mut cancelled = false;

    loop {
        let contract = contracts.get(job_id).ok_or(Error::UnknownId)?;
        if !contract.can_continue() {
            cancelled = true;
            break;
        }

        let next = job
            .steps()
            .iter()
            .find(|s| s.ready && !s.completed && !skipped.contains(&s.id))
            .map(|s| (s.id, s.kind, s.inputs.first().copied().unwrap_or(0)));
        let Some((step_id, kind, payload_id)) = next else { break };

        let span = recorder.begin_span(platform, EventType::StepStart, job_id, step_id);

        let outcome = match kind {
            StepType::Compute => dispatch_compute_step(transport, platform, clock, poll, payload_id).map(|_| ()),
            StepType::Collective => Ok(run_simulated(platform, clock, config::cpu_estimate_us::COLLECTIVE)),
            StepType::Io => Ok(run_simulated(platform, clock, config::cpu_estimate_us::IO)),
            StepType::Control => Ok(run_simulated(platform, clock, config::cpu_estimate_us::CONTROL)),
        };

        recorder.end_span(platform, span, EventType::StepEnd);

        match outcome {
            Ok(()) => {
                let elapsed_us = recorder.last_duration(job_id, step_id) as u64;
                let per_step_budget = contract.cpu_budget_us / job.steps().len().max(1) as u64;
                if elapsed_us > per_step_budget {
                    recorder.log(platform, EventType::ContractBudgetExceed, job_id, step_id, elapsed_us as u32);
                } else if elapsed_us * 10 > per_step_budget * 8 {
                    recorder.log(platform, EventType::ContractBudgetWarn, job_id, step_id, elapsed_us as u32);
                }
                contracts.charge_cpu(recorder, platform, job_id, elapsed_us)?;
                job.mark_completed(step_id)?;
            }
            Err(Error::Timeout) => {
                warn!(target: "scheduler", "job {job_id} step {step_id} timed out, skipping");
                let _ = skipped.push(step_id);
            }
            Err(e) => return Err(e),
        }
    }

    recorder.log(platform, EventType::JobComplete, job_id, 0, cancelled as u32);
    let stats = recorder.job_stats(job_id);
    if cancelled {
        return Err(Error::SafeModeDenied);
    }
    Ok(stats)
}

fn run_simulated(platform: &dyn Platform, clock: &Clock, estimate_us: u64) {
    platform.busy_wait_ticks(clock.us_to_cycles(estimate_us) / clock.cycles_per_us().max(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Contract, Priority};
    use crate::job::tensor::Dtype;
    use crate::pmm::Node;
    use crate::test_support::FakePlatform;

    fn simple_job() -> JobGraph {
        let mut job = JobGraph::init(1);
        job.add_step(1, StepType::Control).unwrap();
        job.add_step(2, StepType::Compute).unwrap();
        job.add_dep(2, 1).unwrap();
        job.add_tensor(10, Dtype::Fp32, 16, false, Node::Local).unwrap();
        job.step_add_input(2, 10).unwrap();
        job.compute_memory();
        job
    }

    // S6: scheduler run with a budget warning partway through.
    #[test]
    fn s6_runs_job_and_warns_on_cpu_overrun() {
        let mut rec = FlightRecorder::new(Clock::from_calibration(0, 1));
        let plat = FakePlatform::new();
        let clock = Clock::from_calibration(0, 1);
        let transport = IpcTransport::new();
        let mut contracts = ContractEngine::new();
        let mut job = simple_job();

        let contract = Contract::new(1, 50, 64, Priority::Normal);
        contracts.apply(&mut rec, &plat, contract).unwrap();

        transport.responses
            .push(ResponsePacket { status: 0x8000, orig_cmd: CommandCode::RunModel as u16, result: 0, timestamp_us: 0 })
            .unwrap();

        let poll = PollConfig { spin_budget_us: 10, sleep_ms: 1, deadline_us: 1000 };
        let result = run_job(&mut rec, &plat, &clock, &transport, &mut contracts, &mut job, 1, poll);

        assert!(result.is_ok());
        assert!(job.all_completed());
        assert_eq!(contracts.get(1).unwrap().state, crate::contract::ContractState::Warned);
    }

    // The dispatched command carries the step's first input tensor id, not
    // the step id itself.
    #[test]
    fn compute_step_payload_id_is_first_input_tensor() {
        let mut rec = FlightRecorder::new(Clock::from_calibration(0, 1));
        let plat = FakePlatform::new();
        let clock = Clock::from_calibration(0, 1);
        let transport = IpcTransport::new();
        let mut contracts = ContractEngine::new();
        let mut job = simple_job();

        let contract = Contract::new(1, 50_000, 64, Priority::Normal);
        contracts.apply(&mut rec, &plat, contract).unwrap();

        transport.responses
            .push(ResponsePacket { status: 0x8000, orig_cmd: CommandCode::RunModel as u16, result: 0, timestamp_us: 0 })
            .unwrap();

        let poll = PollConfig { spin_budget_us: 10, sleep_ms: 1, deadline_us: 1000 };
        run_job(&mut rec, &plat, &clock, &transport, &mut contracts, &mut job, 1, poll).unwrap();

        let sent = transport.commands.pop().unwrap();
        assert_eq!(sent.payload_id, 10);
    }

    #[test]
    fn safe_mode_stops_the_run_before_further_steps() {
        let mut rec = FlightRecorder::new(Clock::from_calibration(0, 1));
        let plat = FakePlatform::new();
        let clock = Clock::from_calibration(0, 1);
        let transport = IpcTransport::new();
        let mut contracts = ContractEngine::new();
        let mut job = simple_job();

        let contract = Contract::new(1, 0, 64, Priority::Normal);
        contracts.apply(&mut rec, &plat, contract).unwrap();
        // Drive OK -> WARNED -> SAFE_MODE before the run even starts.
        for _ in 0..config::CPU_VIOLATIONS_TO_SAFE_MODE {
            contracts.charge_cpu(&mut rec, &plat, 1, 10).unwrap();
        }
        assert_eq!(contracts.get(1).unwrap().state, crate::contract::ContractState::SafeMode);

        let poll = PollConfig { spin_budget_us: 10, sleep_ms: 1, deadline_us: 1000 };
        let result = run_job(&mut rec, &plat, &clock, &transport, &mut contracts, &mut job, 1, poll);
        assert_eq!(result, Err(Error::SafeModeDenied));
        assert!(!job.all_completed());
    }

    #[test]
    fn compute_step_times_out_when_no_response_arrives() {
        let mut rec = FlightRecorder::new(Clock::from_calibration(0, 1));
        let plat = FakePlatform::new();
        let clock = Clock::from_calibration(0, 1);
        let transport = IpcTransport::new();

        let poll = PollConfig { spin_budget_us: 5, sleep_ms: 1, deadline_us: 20 };
        let result = dispatch_compute_step(&transport, &plat, &clock, poll, 2);
        assert_eq!(result, Err(Error::Timeout));
        let _ = rec;
    }

    // A timed-out step is skipped, not retried, and the run keeps going for
    // every other independently-ready step.
    #[test]
    fn timed_out_step_is_skipped_not_retried_and_run_continues() {
        let mut rec = FlightRecorder::new(Clock::from_calibration(0, 1));
        let plat = FakePlatform::new();
        let clock = Clock::from_calibration(0, 1);
        let transport = IpcTransport::new();
        let mut contracts = ContractEngine::new();

        // Two independent steps: a COMPUTE step with no response queued
        // (times out) and a CONTROL step with no dependency on it.
        let mut job = JobGraph::init(1);
        job.add_step(1, StepType::Compute).unwrap();
        job.add_step(2, StepType::Control).unwrap();

        let contract = Contract::new(1, 10_000, 64, Priority::Normal);
        contracts.apply(&mut rec, &plat, contract).unwrap();

        let poll = PollConfig { spin_budget_us: 5, sleep_ms: 1, deadline_us: 20 };
        let result = run_job(&mut rec, &plat, &clock, &transport, &mut contracts, &mut job, 1, poll);

        assert!(result.is_ok());
        assert!(!job.step(1).unwrap().completed);
        assert!(job.step(2).unwrap().completed);
        assert!(!job.all_completed());
    }

    // Exactly one JOB_COMPLETE per run_job call, whether it drains normally
    // or is cancelled by SAFE_MODE.
    #[test]
    fn job_complete_is_logged_exactly_once_per_run() {
        let mut rec = FlightRecorder::new(Clock::from_calibration(0, 1));
        let plat = FakePlatform::new();
        let clock = Clock::from_calibration(0, 1);
        let transport = IpcTransport::new();
        let mut contracts = ContractEngine::new();
        let mut job = JobGraph::init(1);
        job.add_step(1, StepType::Control).unwrap();
        job.add_step(2, StepType::Control).unwrap();

        let contract = Contract::new(1, 10_000, 64, Priority::Normal);
        contracts.apply(&mut rec, &plat, contract).unwrap();

        let poll = PollConfig::default();
        let stats = run_job(&mut rec, &plat, &clock, &transport, &mut contracts, &mut job, 1, poll).unwrap();

        let job_completes = rec.iter().filter(|e| e.event_type() == Some(EventType::JobComplete)).count();
        assert_eq!(job_completes, 1);
        assert_eq!(stats.steps_completed, 2);
        assert!(job.all_completed());
    }
}
