/*!
Patch primitives and state-heap records.

Everything in the engine that writes a value into a byte buffer at a
compiler-declared offset goes through this module: stateless pointer
patches into cross-thread data, surface-state records into the
surface-state heap, sampler records into the dynamic-state heap.

Offsets come from the compiler; an out-of-range offset means the compiler
and the runtime disagree about the binary contract, which is an internal
consistency failure, not a caller error.
*/

use crate::memory::Allocation;
use std::sync::Arc;

/// Size of one encoded surface-state record.
pub const SURFACE_STATE_SIZE: usize = 64;
/// Size of one encoded sampler-state record.
pub const SAMPLER_STATE_SIZE: usize = 16;

pub fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) fn align_up_usize(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Writes `value` at `offset`, truncated to `pointer_size` bytes.
pub fn patch_pointer(dst: &mut [u8], offset: u32, pointer_size: u8, value: u64) {
    let offset = offset as usize;
    match pointer_size {
        4 => {
            let end = offset + 4;
            assert!(end <= dst.len(), "pointer patch at {offset} exceeds buffer");
            dst[offset..end].copy_from_slice(&(value as u32).to_le_bytes());
        }
        8 => {
            let end = offset + 8;
            assert!(end <= dst.len(), "pointer patch at {offset} exceeds buffer");
            dst[offset..end].copy_from_slice(&value.to_le_bytes());
        }
        other => panic!("unsupported pointer width {other}"),
    }
}

/// Writes a POD scalar at `offset`.
pub fn patch_scalar<T: bytemuck::Pod>(dst: &mut [u8], offset: u32, value: T) {
    let offset = offset as usize;
    let bytes = bytemuck::bytes_of(&value);
    let end = offset + bytes.len();
    assert!(end <= dst.len(), "scalar patch at {offset} exceeds buffer");
    dst[offset..end].copy_from_slice(bytes);
}

/// Writes three consecutive u32 words at `offset`, if mapped.
pub fn patch_vec3(dst: &mut [u8], offset: Option<u32>, value: [u32; 3]) {
    if let Some(offset) = offset {
        for (i, word) in value.iter().enumerate() {
            patch_scalar(dst, offset + 4 * i as u32, *word);
        }
    }
}

pub(crate) fn read_u32(src: &[u8], offset: u32) -> u32 {
    let offset = offset as usize;
    let bytes: [u8; 4] = src[offset..offset + 4]
        .try_into()
        .expect("read past end of buffer");
    u32::from_le_bytes(bytes)
}

/// Cache behavior encoded into a surface-state record.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum CachePolicy {
    WriteBack,
    Uncached,
}

/// A fixed-function buffer descriptor written into the surface-state heap
/// at a bindful offset.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceStateRecord {
    pub base_address: u64,
    pub size: u64,
    pub cache_policy: CachePolicy,
}

impl SurfaceStateRecord {
    pub fn for_allocation(allocation: &Allocation) -> Self {
        Self {
            base_address: allocation.gpu_address(),
            size: allocation.underlying_buffer_size() as u64,
            cache_policy: CachePolicy::WriteBack,
        }
    }

    pub fn encode(&self) -> [u8; SURFACE_STATE_SIZE] {
        let mut record = [0u8; SURFACE_STATE_SIZE];
        record[0..8].copy_from_slice(&self.base_address.to_le_bytes());
        record[8..16].copy_from_slice(&self.size.to_le_bytes());
        record[16] = match self.cache_policy {
            CachePolicy::WriteBack => 1,
            CachePolicy::Uncached => 0,
        };
        record
    }

    pub fn write_to(&self, heap: &mut [u8], offset: usize) {
        let end = offset + SURFACE_STATE_SIZE;
        assert!(end <= heap.len(), "surface state at {offset} exceeds heap");
        heap[offset..end].copy_from_slice(&self.encode());
    }
}

/// Patches a pointer value into cross-thread data and, when a bindful
/// offset is declared and a surface-state heap is supplied, a full surface
/// state record describing `allocation`.
///
/// The stateless field receives `address` (which may point inside the
/// allocation); the surface state always describes the whole allocation.
pub fn patch_pointer_with_surface(
    cross_thread_data: &mut [u8],
    stateless: Option<u32>,
    pointer_size: u8,
    bindful: Option<u32>,
    surface_state_heap: Option<&mut [u8]>,
    address: u64,
    allocation: &Allocation,
) {
    if let Some(offset) = stateless {
        patch_pointer(cross_thread_data, offset, pointer_size, address);
    }
    if let (Some(offset), Some(heap)) = (bindful, surface_state_heap) {
        SurfaceStateRecord::for_allocation(allocation).write_to(heap, offset as usize);
    }
}

/// A sampler descriptor written into the dynamic-state heap at a bindful
/// offset.
#[derive(Clone, Copy, Debug)]
pub struct SamplerStateRecord {
    pub filter_linear: bool,
    pub normalized_coords: bool,
    /// Encoded address mode, identical for all three coordinates.
    pub address_mode: u8,
}

impl SamplerStateRecord {
    pub fn encode(&self) -> [u8; SAMPLER_STATE_SIZE] {
        let mut record = [0u8; SAMPLER_STATE_SIZE];
        record[0] = self.filter_linear as u8;
        record[1] = self.normalized_coords as u8;
        record[2] = self.address_mode;
        record
    }

    pub fn write_to(&self, heap: &mut [u8], offset: usize) {
        let end = offset + SAMPLER_STATE_SIZE;
        assert!(end <= heap.len(), "sampler state at {offset} exceeds heap");
        heap[offset..end].copy_from_slice(&self.encode());
    }
}

impl SamplerStateSource for SamplerStateRecord {
    fn copy_sampler_state_to_heap(&self, heap: &mut [u8], offset: usize) {
        self.write_to(heap, offset);
    }
}

/// An image: supplies precomputed surface-state records and its backing
/// allocation.
pub trait SurfaceStateSource {
    /// Copies the standard (or redescribed) surface state into `heap` at
    /// `offset`.
    fn copy_surface_state_to_heap(&self, heap: &mut [u8], offset: usize, redescribed: bool);
    fn allocation(&self) -> &Arc<Allocation>;
}

/// A sampler: supplies its sampler-state record. Samplers are not memory
/// allocations and carry no residency.
pub trait SamplerStateSource {
    fn copy_sampler_state_to_heap(&self, heap: &mut [u8], offset: usize);
}
