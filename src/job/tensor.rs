//! Tensor dtype and descriptor.

use crate::job::TensorId;
use crate::pmm::Node;

/// Element type with a fixed per-variant byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Fp32,
    Fp16,
    Bf16,
    Int8,
    Int32,
}

impl Dtype {
    pub const fn elem_size(self) -> u64 {
        match self {
            Dtype::Fp32 => 4,
            Dtype::Fp16 => 2,
            Dtype::Bf16 => 2,
            Dtype::Int8 => 1,
            Dtype::Int32 => 4,
        }
    }

    pub const fn tag(self) -> u8 {
        match self {
            Dtype::Fp32 => 0,
            Dtype::Fp16 => 1,
            Dtype::Bf16 => 2,
            Dtype::Int8 => 3,
            Dtype::Int32 => 4,
        }
    }

    pub const fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Dtype::Fp32,
            1 => Dtype::Fp16,
            2 => Dtype::Bf16,
            3 => Dtype::Int8,
            4 => Dtype::Int32,
            _ => return None,
        })
    }
}

/// Typed element array descriptor ("Tensor descriptor").
#[derive(Debug, Clone, Copy)]
pub struct TensorDescriptor {
    pub id: TensorId,
    pub dtype: Dtype,
    pub num_elements: u64,
    pub size_bytes: u64,
    pub pinned: bool,
    pub node_affinity: Node,
}

impl TensorDescriptor {
    pub fn new(id: TensorId, dtype: Dtype, num_elements: u64, pinned: bool, node_affinity: Node) -> Self {
        TensorDescriptor {
            id,
            dtype,
            num_elements,
            size_bytes: num_elements * dtype.elem_size(),
            pinned,
            node_affinity,
        }
    }

    /// Size rounded up to whole KiB, the unit every memory-peak computation
    /// uses.
    pub fn size_kb(&self) -> u64 {
        (self.size_bytes + 1023) / 1024
    }
}
