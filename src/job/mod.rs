//! Bounded-capacity DAG of typed steps with tensor metadata.

pub mod tensor;

use crate::config::{MAX_DEPS, MAX_INPUTS, MAX_OUTPUTS, MAX_STEPS, MAX_TENSORS};
use crate::error::{Error, Result};
use heapless::Vec as HVec;
pub use tensor::{Dtype, TensorDescriptor};

/// Step id, tensor id: opaque non-negative integers, unique within a job.
pub type StepId = u32;
pub type TensorId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    Compute,
    Collective,
    Io,
    Control,
}

/// A node in the job graph ("Job step").
#[derive(Debug, Clone)]
pub struct Step {
    pub id: StepId,
    pub kind: StepType,
    pub deps: HVec<StepId, MAX_DEPS>,
    pub inputs: HVec<TensorId, MAX_INPUTS>,
    pub outputs: HVec<TensorId, MAX_OUTPUTS>,
    pub working_set_kb: u64,
    pub peak_memory_kb: u64,
    pub ready: bool,
    pub completed: bool,
}

/// Bounded DAG of steps + tensor registry ("Job graph").
pub struct JobGraph {
    pub id: u32,
    steps: HVec<Step, MAX_STEPS>,
    tensors: HVec<TensorDescriptor, MAX_TENSORS>,
    pub total_memory_kb: u64,
    pub peak_memory_kb: u64,
    pub pinned_memory_kb: u64,
}

impl JobGraph {
    pub fn init(id: u32) -> Self {
        JobGraph {
            id,
            steps: HVec::new(),
            tensors: HVec::new(),
            total_memory_kb: 0,
            peak_memory_kb: 0,
            pinned_memory_kb: 0,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn tensors(&self) -> &[TensorDescriptor] {
        &self.tensors
    }

    fn step_index(&self, id: StepId) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    fn tensor_index(&self, id: TensorId) -> Option<usize> {
        self.tensors.iter().position(|t| t.id == id)
    }

    /// Add a step. Initial `ready = (num_deps == 0) = true`.
    pub fn add_step(&mut self, id: StepId, kind: StepType) -> Result<()> {
        self.steps
            .push(Step {
                id,
                kind,
                deps: HVec::new(),
                inputs: HVec::new(),
                outputs: HVec::new(),
                working_set_kb: 0,
                peak_memory_kb: 0,
                ready: true,
                completed: false,
            })
            .map_err(|_| Error::Capacity)
    }

    /// Record that `step` depends on `depends_on`. Sets the dependent
    /// step's `ready = false`.
    pub fn add_dep(&mut self, step: StepId, depends_on: StepId) -> Result<()> {
        if self.step_index(depends_on).is_none() {
            return Err(Error::UnknownId);
        }
        let idx = self.step_index(step).ok_or(Error::UnknownId)?;
        self.steps[idx].deps.push(depends_on).map_err(|_| Error::Capacity)?;
        self.steps[idx].ready = false;
        Ok(())
    }

    /// Register a tensor.
    pub fn add_tensor(
        &mut self,
        id: TensorId,
        dtype: Dtype,
        num_elements: u64,
        pinned: bool,
        node_affinity: crate::pmm::Node,
    ) -> Result<()> {
        if self.tensor_index(id).is_some() {
            return Err(Error::Capacity);
        }
        self.tensors
            .push(TensorDescriptor::new(id, dtype, num_elements, pinned, node_affinity))
            .map_err(|_| Error::Capacity)
    }

    pub fn step_add_input(&mut self, step: StepId, tensor: TensorId) -> Result<()> {
        if self.tensor_index(tensor).is_none() {
            return Err(Error::UnknownId);
        }
        let idx = self.step_index(step).ok_or(Error::UnknownId)?;
        self.steps[idx].inputs.push(tensor).map_err(|_| Error::Capacity)
    }

    pub fn step_add_output(&mut self, step: StepId, tensor: TensorId) -> Result<()> {
        if self.tensor_index(tensor).is_none() {
            return Err(Error::UnknownId);
        }
        let idx = self.step_index(step).ok_or(Error::UnknownId)?;
        self.steps[idx].outputs.push(tensor).map_err(|_| Error::Capacity)
    }

    /// Mark `step` completed, then re-scan every other incomplete step and
    /// set `ready = true` for any whose deps are now all completed
    ///. O(steps * deps), acceptable at this scale.
    pub fn mark_completed(&mut self, step: StepId) -> Result<()> {
        let idx = self.step_index(step).ok_or(Error::UnknownId)?;
        self.steps[idx].completed = true;

        for i in 0..self.steps.len() {
            if self.steps[i].completed {
                continue;
            }
            let all_done = self.steps[i].deps.iter().all(|dep| {
                self.step_index(*dep).map(|di| self.steps[di].completed).unwrap_or(false)
            });
            if all_done {
                self.steps[i].ready = true;
            }
        }
        Ok(())
    }

    /// First ready-and-not-completed step, in insertion order.
    pub fn next_ready(&self) -> Option<StepId> {
        self.steps.iter().find(|s| s.ready && !s.completed).map(|s| s.id)
    }

    pub fn all_completed(&self) -> bool {
        self.steps.iter().all(|s| s.completed)
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.step_index(id).map(|i| &self.steps[i])
    }

    /// Memory-peak analysis.
    pub fn compute_memory(&mut self) {
        let mut job_peak = 0u64;
        let mut total = 0u64;
        let mut pinned = 0u64;

        for t in &self.tensors {
            total += t.size_kb();
            if t.pinned {
                pinned += t.size_kb();
            }
        }

        let tensor_size_kb = |id: TensorId| -> u64 {
            self.tensors.iter().find(|t| t.id == id).map(|t| t.size_kb()).unwrap_or(0)
        };

        for i in 0..self.steps.len() {
            let step_peak: u64 = self.steps[i].inputs.iter().map(|id| tensor_size_kb(*id)).sum::<u64>()
                + self.steps[i].outputs.iter().map(|id| tensor_size_kb(*id)).sum::<u64>();
            self.steps[i].working_set_kb = step_peak;
            self.steps[i].peak_memory_kb = step_peak;
            job_peak = job_peak.max(step_peak);
        }

        self.peak_memory_kb = job_peak;
        self.total_memory_kb = total;
        self.pinned_memory_kb = pinned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tensor::Dtype;
    use crate::pmm::Node;

    fn round_up_kb(bytes: u64) -> u64 {
        (bytes + 1023) / 1024
    }

    #[test]
    fn s2_like_memory_analysis() {
        let mut job = JobGraph::init(1);
        job.add_step(1, StepType::Compute).unwrap();
        job.add_step(2, StepType::Compute).unwrap();
        job.add_step(3, StepType::Collective).unwrap();
        job.add_dep(3, 1).unwrap();
        job.add_dep(3, 2).unwrap();

        job.add_tensor(10, Dtype::Fp32, 1024, true, Node::Local).unwrap(); // 4096 B pinned
        job.add_tensor(11, Dtype::Fp16, 2048, false, Node::Local).unwrap(); // 4096 B
        job.add_tensor(12, Dtype::Fp32, 1024, false, Node::Local).unwrap(); // 4096 B

        job.step_add_input(1, 10).unwrap();
        job.step_add_output(1, 11).unwrap();
        job.step_add_input(2, 12).unwrap();
        job.step_add_input(3, 11).unwrap();
        job.step_add_output(3, 12).unwrap();

        job.compute_memory();

        assert_eq!(job.peak_memory_kb, round_up_kb(4096) * 2);
        assert_eq!(job.pinned_memory_kb, round_up_kb(4096));
        assert_eq!(job.total_memory_kb, round_up_kb(4096) * 3);
    }

    #[test]
    fn readiness_propagates_on_completion() {
        let mut job = JobGraph::init(1);
        job.add_step(1, StepType::Control).unwrap();
        job.add_step(2, StepType::Control).unwrap();
        job.add_dep(2, 1).unwrap();

        assert!(job.step(1).unwrap().ready);
        assert!(!job.step(2).unwrap().ready);
        assert_eq!(job.next_ready(), Some(1));

        job.mark_completed(1).unwrap();
        assert!(job.step(2).unwrap().ready);
        assert_eq!(job.next_ready(), Some(2));

        job.mark_completed(2).unwrap();
        assert_eq!(job.next_ready(), None);
        assert!(job.all_completed());
    }

    #[test]
    fn next_ready_skips_completed_steps() {
        let mut job = JobGraph::init(1);
        job.add_step(1, StepType::Control).unwrap();
        job.add_step(2, StepType::Control).unwrap();
        job.mark_completed(1).unwrap();
        assert_eq!(job.next_ready(), Some(2));
    }

    #[test]
    fn capacity_errors_are_values_not_panics() {
        let mut job = JobGraph::init(1);
        for i in 0..MAX_STEPS as u32 {
            job.add_step(i, StepType::Control).unwrap();
        }
        assert_eq!(job.add_step(999, StepType::Control), Err(Error::Capacity));
    }

    #[test]
    fn unknown_dep_is_an_error() {
        let mut job = JobGraph::init(1);
        job.add_step(1, StepType::Control).unwrap();
        assert_eq!(job.add_dep(1, 42), Err(Error::UnknownId));
    }
}
