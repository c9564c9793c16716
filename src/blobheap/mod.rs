//! Shared blob heap: a bitmap allocator over fixed-size blocks, carrying
//! typed blobs (raw bytes, tensors, model references, results) between the
//! kernel and an accelerator.

use crate::config::{BLOB_BLOCK_SIZE, MAX_BLOB_INDEX};
use crate::error::{Error, Result};
use crate::job::Dtype;
use alloc::vec;
use alloc::vec::Vec;
use heapless::FnvIndexMap;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const HEAP_MAGIC: u32 = 0x4845_4150;
pub const HEAP_VERSION: u32 = 1;
pub const BLOB_MAGIC: u32 = 0x424C_4F42;

/// Fixed 64-byte heap control block header.
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct HeapControlBlock {
    pub magic: u32,
    pub version: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_blob_id: u32,
    pub reserved: [u32; 11],
}

const_assert_eq!(core::mem::size_of::<HeapControlBlock>(), 64);

/// Blob kind tag ("Blob header").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobType {
    Raw = 0,
    Tensor = 1,
    ModelRef = 2,
    Result = 3,
}

impl BlobType {
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => BlobType::Raw,
            1 => BlobType::Tensor,
            2 => BlobType::ModelRef,
            3 => BlobType::Result,
            _ => return None,
        })
    }
}

/// Fixed 32-byte per-blob header ("Blob header").
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct BlobHeader {
    pub magic: u32,
    pub blob_id: u16,
    pub kind: u8,
    pub flags: u8,
    pub size: u32,
    pub offset: u32,
    pub checksum: u32,
    pub reserved: [u32; 3],
}

const_assert_eq!(core::mem::size_of::<BlobHeader>(), 32);

/// Embedded tensor metadata for `Tensor`-typed blobs ("Tensor
/// header"): row-major shape/strides, up to 4 dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct TensorHeader {
    pub dtype: u8,
    pub ndim: u8,
    pub reserved: u16,
    pub shape: [u32; 4],
    pub strides: [u32; 4],
}

const_assert_eq!(core::mem::size_of::<TensorHeader>(), 36);

impl TensorHeader {
    /// Row-major strides: `strides[ndim-1] = 1`, `strides[i] = strides[i+1] * shape[i+1]`.
    pub fn new(dtype: Dtype, shape: [u32; 4], ndim: u8) -> Self {
        let mut strides = [0u32; 4];
        let n = ndim as usize;
        if n > 0 {
            strides[n - 1] = 1;
            for i in (0..n.saturating_sub(1)).rev() {
                strides[i] = strides[i + 1] * shape[i + 1];
            }
        }
        TensorHeader {
            dtype: dtype.tag(),
            ndim,
            reserved: 0,
            shape,
            strides,
        }
    }

    pub fn element_count(&self) -> u64 {
        let n = self.ndim as usize;
        self.shape[..n].iter().map(|&d| d as u64).product()
    }
}

/// FNV-1a over a byte slice, used as the blob checksum.
pub fn checksum32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

struct BlobEntry {
    header: BlobHeader,
    block_start: usize,
    block_count: usize,
}

/// Bitmap-backed blob allocator. `blob_id`s are assigned
/// sequentially starting at 1; 0 is never issued, matching the PMM's "0 is
/// always an invalid result" convention.
pub struct BlobHeap {
    bitmap: Vec<u8>,
    total_blocks: usize,
    free_blocks: usize,
    next_blob_id: u16,
    arena: Vec<u8>,
    index: FnvIndexMap<u16, BlobEntry, MAX_BLOB_INDEX>,
}

impl BlobHeap {
    /// Initialize a heap over `total_blocks` fixed-size blocks.
    pub fn init(total_blocks: usize) -> Self {
        let bitmap_bytes = (total_blocks + 7) / 8;
        BlobHeap {
            bitmap: vec![0u8; bitmap_bytes.max(1)],
            total_blocks,
            free_blocks: total_blocks,
            next_blob_id: 1,
            arena: vec![0u8; total_blocks * BLOB_BLOCK_SIZE],
            index: FnvIndexMap::new(),
        }
    }

    pub fn control_block(&self) -> HeapControlBlock {
        HeapControlBlock {
            magic: HEAP_MAGIC,
            version: HEAP_VERSION,
            total_blocks: self.total_blocks as u32,
            free_blocks: self.free_blocks as u32,
            next_blob_id: self.next_blob_id as u32,
            reserved: [0; 11],
        }
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    fn find_contiguous(&self, blocks: usize) -> Option<usize> {
        let mut run_start = None;
        let mut run_len = 0usize;
        for i in 0..self.total_blocks {
            if test_bit(&self.bitmap, i) {
                run_start = None;
                run_len = 0;
                continue;
            }
            if run_start.is_none() {
                run_start = Some(i);
                run_len = 0;
            }
            run_len += 1;
            if run_len == blocks {
                return run_start;
            }
        }
        None
    }

    fn alloc_raw(&mut self, kind: BlobType, size: u32, flags: u8) -> Result<u16> {
        let hdr_size = core::mem::size_of::<BlobHeader>();
        let total_bytes = hdr_size + size as usize;
        let blocks = (total_bytes + BLOB_BLOCK_SIZE - 1) / BLOB_BLOCK_SIZE;
        let blocks = blocks.max(1);
        let start = self.find_contiguous(blocks).ok_or(Error::Capacity)?;
        for i in start..start + blocks {
            set_bit(&mut self.bitmap, i);
        }

        let blob_id = self.next_blob_id;
        self.next_blob_id = self.next_blob_id.wrapping_add(1).max(1);

        let base = start * BLOB_BLOCK_SIZE;
        let header = BlobHeader {
            magic: BLOB_MAGIC,
            blob_id,
            kind: kind as u8,
            flags,
            size,
            offset: (base + hdr_size) as u32,
            checksum: 0,
            reserved: [0; 3],
        };

        // The header lives at the block's base offset, ahead of the payload
        // it describes, so a peer scanning the region finds the same bytes
        // this side just wrote.
        self.arena[base..base + hdr_size].copy_from_slice(header.as_bytes());

        self.index
            .insert(
                blob_id,
                BlobEntry {
                    header,
                    block_start: start,
                    block_count: blocks,
                },
            )
            .map_err(|_| Error::Capacity)?;
        self.free_blocks -= blocks;
        Ok(blob_id)
    }

    /// Look up `blob_id`, falling back to a scan of the arena for a header
    /// with a matching magic and id if the local index has never seen it —
    /// the peer (accelerator) side may have allocated it directly in the
    /// shared region.
    fn resolve(&mut self, blob_id: u16) -> Result<BlobHeader> {
        if let Some(e) = self.index.get(&blob_id) {
            return Ok(e.header);
        }
        let hdr_size = core::mem::size_of::<BlobHeader>();
        for block in 0..self.total_blocks {
            let base = block * BLOB_BLOCK_SIZE;
            let Some(hdr) = BlobHeader::read_from_prefix(&self.arena[base..base + hdr_size]) else {
                continue;
            };
            if hdr.magic == BLOB_MAGIC && hdr.blob_id == blob_id {
                let total_bytes = hdr_size + hdr.size as usize;
                let block_count = ((total_bytes + BLOB_BLOCK_SIZE - 1) / BLOB_BLOCK_SIZE).max(1);
                self.index
                    .insert(blob_id, BlobEntry { header: hdr, block_start: block, block_count })
                    .map_err(|_| Error::Capacity)?;
                return Ok(hdr);
            }
        }
        Err(Error::UnknownId)
    }

    /// Update a blob's checksum in both the index and its live header bytes.
    fn set_checksum(&mut self, blob_id: u16, checksum: u32) {
        if let Some(e) = self.index.get_mut(&blob_id) {
            e.header.checksum = checksum;
            let base = e.block_start * BLOB_BLOCK_SIZE;
            let hdr_size = core::mem::size_of::<BlobHeader>();
            self.arena[base..base + hdr_size].copy_from_slice(e.header.as_bytes());
        }
    }

    /// Allocate a `RAW`/`MODEL_REF`/`RESULT` blob of `size` bytes.
    pub fn alloc(&mut self, kind: BlobType, size: u32) -> Result<u16> {
        self.alloc_raw(kind, size, 0)
    }

    /// Allocate a `TENSOR` blob sized for its header plus `num_elements`
    /// elements of `dtype`, writes the embedded tensor header, and returns
    /// the blob id.
    pub fn alloc_tensor(&mut self, dtype: Dtype, shape: [u32; 4], ndim: u8) -> Result<u16> {
        let hdr = TensorHeader::new(dtype, shape, ndim);
        let data_size = hdr.element_count() * dtype.elem_size();
        let total_size = core::mem::size_of::<TensorHeader>() as u64 + data_size;
        let blob_id = self.alloc_raw(BlobType::Tensor, total_size as u32, 0)?;

        let entry = self.index.get(&blob_id).ok_or(Error::UnknownId)?;
        let off = entry.header.offset as usize;
        self.arena[off..off + core::mem::size_of::<TensorHeader>()].copy_from_slice(hdr.as_bytes());
        Ok(blob_id)
    }

    /// Header for `blob_id`. On a local miss, scans the arena for a blob
    /// allocated by the peer (§ "peer may have allocated on the other side").
    pub fn header(&mut self, blob_id: u16) -> Result<BlobHeader> {
        self.resolve(blob_id)
    }

    /// Full blob byte span, header included for `TENSOR` blobs.
    pub fn get(&mut self, blob_id: u16) -> Result<&[u8]> {
        let header = self.resolve(blob_id)?;
        let off = header.offset as usize;
        let size = header.size as usize;
        Ok(&self.arena[off..off + size])
    }

    /// Overwrite a blob's payload (full span for non-tensor blobs, data
    /// region only for `TENSOR` blobs via [`Self::write_tensor_data`]) and
    /// recompute its checksum.
    pub fn write(&mut self, blob_id: u16, data: &[u8]) -> Result<()> {
        let header = self.resolve(blob_id)?;
        let off = header.offset as usize;
        let size = header.size as usize;
        if data.len() != size {
            return Err(Error::BlobInvalid);
        }
        self.arena[off..off + size].copy_from_slice(data);
        let checksum = checksum32(data);
        self.set_checksum(blob_id, checksum);
        Ok(())
    }

    /// Tensor header plus the data region following it, validated against
    /// `BlobType::Tensor`.
    pub fn get_tensor_data(&mut self, blob_id: u16) -> Result<(TensorHeader, &[u8])> {
        let header = self.resolve(blob_id)?;
        if header.kind != BlobType::Tensor as u8 {
            return Err(Error::BlobInvalid);
        }
        let off = header.offset as usize;
        let hdr_size = core::mem::size_of::<TensorHeader>();
        let hdr = TensorHeader::read_from_prefix(&self.arena[off..off + hdr_size]).ok_or(Error::BlobInvalid)?;
        let data_start = off + hdr_size;
        let data_end = off + header.size as usize;
        Ok((hdr, &self.arena[data_start..data_end]))
    }

    /// Write into a `TENSOR` blob's data region (after its header) and
    /// recompute the checksum over the full blob span.
    pub fn write_tensor_data(&mut self, blob_id: u16, data: &[u8]) -> Result<()> {
        let header = self.resolve(blob_id)?;
        if header.kind != BlobType::Tensor as u8 {
            return Err(Error::BlobInvalid);
        }
        let off = header.offset as usize;
        let hdr_size = core::mem::size_of::<TensorHeader>();
        let total_size = header.size as usize;
        if data.len() != total_size - hdr_size {
            return Err(Error::BlobInvalid);
        }
        self.arena[off + hdr_size..off + total_size].copy_from_slice(data);
        let checksum = checksum32(&self.arena[off..off + total_size]);
        self.set_checksum(blob_id, checksum);
        Ok(())
    }

    /// Release a blob's blocks. Double-free or an unknown id is an error,
    /// not a panic.
    pub fn free(&mut self, blob_id: u16) -> Result<()> {
        let entry = self.index.remove(&blob_id).ok_or(Error::InvalidFree)?;
        for i in entry.block_start..entry.block_start + entry.block_count {
            clear_bit(&mut self.bitmap, i);
        }
        self.free_blocks += entry.block_count;
        Ok(())
    }
}

fn test_bit(bitmap: &[u8], idx: usize) -> bool {
    bitmap[idx / 8] & (1 << (idx % 8)) != 0
}

fn set_bit(bitmap: &mut [u8], idx: usize) {
    bitmap[idx / 8] |= 1 << (idx % 8);
}

fn clear_bit(bitmap: &mut [u8], idx: usize) {
    bitmap[idx / 8] &= !(1 << (idx % 8));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip_preserves_bytes_and_checksum() {
        let mut heap = BlobHeap::init(64);
        let id = heap.alloc(BlobType::Raw, 100).unwrap();
        let data: Vec<u8> = (0..100u16).map(|i| i as u8).collect();
        heap.write(id, &data).unwrap();

        let got = heap.get(id).unwrap();
        assert_eq!(got, data.as_slice());
        assert_eq!(heap.header(id).unwrap().checksum, checksum32(&data));
    }

    #[test]
    fn tensor_roundtrip_preserves_shape_strides_and_data() {
        let mut heap = BlobHeap::init(64);
        let id = heap.alloc_tensor(Dtype::Fp32, [2, 3, 0, 0], 2).unwrap();

        let (hdr, _) = heap.get_tensor_data(id).unwrap();
        assert_eq!(hdr.ndim, 2);
        assert_eq!(hdr.shape, [2, 3, 0, 0]);
        assert_eq!(hdr.strides, [3, 1, 0, 0]);
        assert_eq!(hdr.element_count(), 6);

        let payload: Vec<u8> = (0..(6 * 4)).map(|i| i as u8).collect();
        heap.write_tensor_data(id, &payload).unwrap();
        let (_, data) = heap.get_tensor_data(id).unwrap();
        assert_eq!(data, payload.as_slice());
    }

    #[test]
    fn free_then_double_free_is_an_error() {
        let mut heap = BlobHeap::init(16);
        let id = heap.alloc(BlobType::Result, 10).unwrap();
        let before = heap.free_blocks();
        heap.free(id).unwrap();
        assert!(heap.free_blocks() > before);
        assert_eq!(heap.free(id), Err(Error::InvalidFree));
    }

    #[test]
    fn alloc_fails_when_heap_is_full() {
        let mut heap = BlobHeap::init(2);
        // Payload sized so header + payload exactly fill both blocks.
        let payload = BLOB_BLOCK_SIZE * 2 - core::mem::size_of::<BlobHeader>();
        heap.alloc(BlobType::Raw, payload as u32).unwrap();
        assert_eq!(heap.alloc(BlobType::Raw, 1), Err(Error::Capacity));
    }

    #[test]
    fn get_tensor_data_rejects_non_tensor_blob() {
        let mut heap = BlobHeap::init(16);
        let id = heap.alloc(BlobType::Raw, 10).unwrap();
        assert_eq!(heap.get_tensor_data(id), Err(Error::BlobInvalid));
    }

    // Simulates a blob allocated by the peer (accelerator) side: its header
    // lives in the shared arena but this side's local index has never seen
    // the id. `get`/`header` must still find it by scanning the region.
    #[test]
    fn get_falls_back_to_scanning_the_arena_on_local_miss() {
        let mut heap = BlobHeap::init(16);
        let id = heap.alloc(BlobType::Raw, 10).unwrap();
        let data: Vec<u8> = (0..10u8).collect();
        heap.write(id, &data).unwrap();

        heap.index.remove(&id);
        assert!(heap.index.get(&id).is_none());

        let got = heap.get(id).unwrap().to_vec();
        assert_eq!(got, data);
        assert_eq!(heap.header(id).unwrap().blob_id, id);
        // The scan repopulates the local index so subsequent lookups are cheap.
        assert!(heap.index.get(&id).is_some());
    }

    #[test]
    fn header_miss_for_an_id_never_allocated_is_unknown() {
        let mut heap = BlobHeap::init(16);
        assert_eq!(heap.header(7), Err(Error::UnknownId));
    }

    #[test]
    fn blob_header_offset_follows_the_header_in_its_block() {
        let mut heap = BlobHeap::init(16);
        let id = heap.alloc(BlobType::Raw, 10).unwrap();
        let hdr = heap.header(id).unwrap();
        assert_eq!(hdr.offset as usize, core::mem::size_of::<BlobHeader>());
    }
}
