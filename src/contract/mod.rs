//! Per-job budget state machine tying the job graph to the PMM.

use crate::config::{self, MAX_CONTRACTS};
use crate::error::{AdmissionReason, BudgetKind, Error, Result};
use crate::job::JobGraph;
use crate::pmm::{Node, Pmm};
use crate::platform::Platform;
use crate::recorder::{EventType, FlightRecorder};
use heapless::FnvIndexMap;
use log::warn;

/// `OK -> WARNED -> SAFE_MODE`, monotone within one contract's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContractState {
    Ok = 0,
    Warned = 1,
    SafeMode = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
    Realtime,
}

/// Per-job resource budget and running counters ("Contract").
#[derive(Debug, Clone, Copy)]
pub struct Contract {
    pub job_id: u32,
    pub cpu_budget_us: u64,
    pub memory_budget_kb: u64,
    pub priority: Priority,
    pub preferred_node: Node,
    pub cpu_used_us: u64,
    pub mem_used_kb: u64,
    pub cpu_violations: u32,
    pub mem_violations: u32,
    pub state: ContractState,
}

impl Contract {
    pub fn new(job_id: u32, cpu_budget_us: u64, memory_budget_kb: u64, priority: Priority) -> Self {
        Contract {
            job_id,
            cpu_budget_us,
            memory_budget_kb,
            priority,
            preferred_node: Node::Remote,
            cpu_used_us: 0,
            mem_used_kb: 0,
            cpu_violations: 0,
            mem_violations: 0,
            state: ContractState::Ok,
        }
    }

    pub fn can_continue(&self) -> bool {
        self.state != ContractState::SafeMode
    }
}

/// Admission verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ok,
    Reject(AdmissionReason),
}

/// Ties a set of live [`Contract`]s to one [`Pmm`] and [`FlightRecorder`],
/// keyed by job id ("small fixed-size contract registry").
pub struct ContractEngine {
    registry: FnvIndexMap<u32, Contract, MAX_CONTRACTS>,
}

impl ContractEngine {
    pub fn new() -> Self {
        ContractEngine {
            registry: FnvIndexMap::new(),
        }
    }

    pub fn get(&self, job_id: u32) -> Option<&Contract> {
        self.registry.get(&job_id)
    }

    /// Zero runtime counters, set state to `OK`, choose `preferred_node`
    /// (`REALTIME` -> node 0, otherwise node 1), register in the registry.
    pub fn apply(&mut self, recorder: &mut FlightRecorder, platform: &dyn Platform, mut contract: Contract) -> Result<()> {
        contract.cpu_used_us = 0;
        contract.mem_used_kb = 0;
        contract.cpu_violations = 0;
        contract.mem_violations = 0;
        contract.state = ContractState::Ok;
        contract.preferred_node = if contract.priority == Priority::Realtime { Node::Local } else { Node::Remote };

        let job_id = contract.job_id;
        let cpu_budget = contract.cpu_budget_us;
        self.registry.insert(job_id, contract).map_err(|_| Error::Capacity)?;
        recorder.log(platform, EventType::ContractApply, job_id, 0, cpu_budget as u32);
        Ok(())
    }

    fn set_state(&mut self, recorder: &mut FlightRecorder, platform: &dyn Platform, job_id: u32, new_state: ContractState) {
        let Some(contract) = self.registry.get_mut(&job_id) else { return };
        if contract.state == new_state {
            return;
        }
        contract.state = new_state;
        recorder.log(platform, EventType::ContractStateChange, job_id, 0, new_state as u32);
        if new_state == ContractState::SafeMode {
            recorder.log(platform, EventType::ContractSafeMode, job_id, 0, 0);
            warn!(target: "contract", "job {job_id} entered SAFE_MODE");
        }
    }

    fn cpu_violation_transition(&mut self, recorder: &mut FlightRecorder, platform: &dyn Platform, job_id: u32) {
        let state = self.registry.get(&job_id).map(|c| c.state);
        match state {
            Some(ContractState::Ok) => self.set_state(recorder, platform, job_id, ContractState::Warned),
            Some(ContractState::Warned) => {
                let violations = self.registry.get(&job_id).map(|c| c.cpu_violations).unwrap_or(0);
                if violations >= config::CPU_VIOLATIONS_TO_SAFE_MODE {
                    self.set_state(recorder, platform, job_id, ContractState::SafeMode);
                }
            }
            _ => {}
        }
    }

    fn mem_violation_transition(&mut self, recorder: &mut FlightRecorder, platform: &dyn Platform, job_id: u32) {
        let state = self.registry.get(&job_id).map(|c| c.state);
        match state {
            Some(ContractState::Ok) => self.set_state(recorder, platform, job_id, ContractState::Warned),
            Some(ContractState::Warned) => {
                let violations = self.registry.get(&job_id).map(|c| c.mem_violations).unwrap_or(0);
                if violations >= config::MEM_VIOLATIONS_TO_SAFE_MODE {
                    self.set_state(recorder, platform, job_id, ContractState::SafeMode);
                }
            }
            _ => {}
        }
    }

    /// Charge CPU time; returns whether this charge violated the budget.
    pub fn charge_cpu(&mut self, recorder: &mut FlightRecorder, platform: &dyn Platform, job_id: u32, us: u64) -> Result<bool> {
        let over = {
            let contract = self.registry.get_mut(&job_id).ok_or(Error::UnknownId)?;
            contract.cpu_used_us += us;
            contract.cpu_used_us > contract.cpu_budget_us
        };
        if over {
            if let Some(c) = self.registry.get_mut(&job_id) {
                c.cpu_violations += 1;
            }
            recorder.log(platform, EventType::ContractBudgetExceed, job_id, 0, 0);
            self.cpu_violation_transition(recorder, platform, job_id);
        }
        Ok(over)
    }

    /// Symmetric to [`Self::charge_cpu`].
    pub fn charge_memory(&mut self, recorder: &mut FlightRecorder, platform: &dyn Platform, job_id: u32, kb: u64) -> Result<bool> {
        let over = {
            let contract = self.registry.get_mut(&job_id).ok_or(Error::UnknownId)?;
            contract.mem_used_kb += kb;
            contract.mem_used_kb > contract.memory_budget_kb
        };
        if over {
            if let Some(c) = self.registry.get_mut(&job_id) {
                c.mem_violations += 1;
            }
            recorder.log(platform, EventType::ContractBudgetExceed, job_id, 0, 1);
            self.mem_violation_transition(recorder, platform, job_id);
        }
        Ok(over)
    }

    /// Allocate one 4 KiB page against both the contract's memory budget
    /// and the PMM.
    pub fn alloc_page(&mut self, recorder: &mut FlightRecorder, platform: &dyn Platform, pmm: &mut Pmm, job_id: u32) -> Result<u64> {
        let (state, mem_used, budget, preferred_node) = {
            let c = self.registry.get(&job_id).ok_or(Error::UnknownId)?;
            (c.state, c.mem_used_kb, c.memory_budget_kb, c.preferred_node)
        };

        if state == ContractState::SafeMode {
            recorder.log(platform, EventType::MemAllocFail, job_id, 0, 0);
            return Err(Error::SafeModeDenied);
        }

        if mem_used + 4 > budget {
            if let Some(c) = self.registry.get_mut(&job_id) {
                c.mem_violations += 1;
            }
            recorder.log(platform, EventType::ContractBudgetExceed, job_id, 0, 1);
            self.mem_violation_transition(recorder, platform, job_id);
            recorder.log(platform, EventType::MemAllocFail, job_id, 0, 0);
            return Err(Error::BudgetExceeded(BudgetKind::Memory));
        }

        let pfn = pmm.alloc_page(recorder, platform, preferred_node);
        if pfn == 0 {
            return Err(Error::OutOfMemory);
        }

        if let Some(c) = self.registry.get_mut(&job_id) {
            c.mem_used_kb += 4;
        }
        recorder.log(platform, EventType::MemAlloc, job_id, 0, 1);
        Ok(pfn * crate::config::FRAME_SIZE as u64)
    }

    /// Credit 4 KiB back (never below 0), free via the PMM.
    pub fn free_page(&mut self, recorder: &mut FlightRecorder, platform: &dyn Platform, pmm: &mut Pmm, job_id: u32, addr: u64) {
        if let Some(c) = self.registry.get_mut(&job_id) {
            c.mem_used_kb = c.mem_used_kb.saturating_sub(4);
        }
        pmm.free_page(recorder, platform, addr);
        recorder.log(platform, EventType::MemFree, job_id, 0, 1);
    }

    /// Admission control against a job graph.
    pub fn admit(&self, recorder: &mut FlightRecorder, platform: &dyn Platform, job_id: u32, job: &JobGraph) -> Result<Admission> {
        let contract = self.registry.get(&job_id).ok_or(Error::UnknownId)?;

        if job.peak_memory_kb > contract.memory_budget_kb {
            recorder.log(platform, EventType::JobReject, job_id, 0, job.peak_memory_kb as u32);
            return Ok(Admission::Reject(AdmissionReason::Memory));
        }
        if job.pinned_memory_kb > contract.memory_budget_kb {
            recorder.log(platform, EventType::JobReject, job_id, 0, job.peak_memory_kb as u32);
            return Ok(Admission::Reject(AdmissionReason::Memory));
        }
        if job.peak_memory_kb > contract.memory_budget_kb.saturating_sub(contract.mem_used_kb) {
            recorder.log(platform, EventType::JobReject, job_id, 0, job.peak_memory_kb as u32);
            return Ok(Admission::Reject(AdmissionReason::NoResources));
        }

        let cpu_estimate = estimate_cpu_us(job);
        if cpu_estimate > contract.cpu_budget_us {
            recorder.log(platform, EventType::ContractBudgetWarn, job_id, 0, cpu_estimate as u32);
        }

        recorder.log(platform, EventType::JobAdmit, job_id, 0, cpu_estimate as u32);
        Ok(Admission::Ok)
    }
}

/// Estimated CPU cost of a job's steps.
pub fn estimate_cpu_us(job: &JobGraph) -> u64 {
    use crate::job::StepType;
    job.steps()
        .iter()
        .map(|s| match s.kind {
            StepType::Compute => config::cpu_estimate_us::COMPUTE,
            StepType::Collective => config::cpu_estimate_us::COLLECTIVE,
            StepType::Io => config::cpu_estimate_us::IO,
            StepType::Control => config::cpu_estimate_us::CONTROL,
        })
        .sum()
}
