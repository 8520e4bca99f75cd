/*!
Memory collaborator contracts.

The engine never talks to a particular allocator; it sees a
[`MemoryManager`] that hands out [`Allocation`]s and an
[`AllocationTracker`] that resolves application-provided host-visible
addresses back to their backing allocations when a buffer argument is
bound. [`SystemMemoryManager`] is a host-backed implementation used for
host execution and tests.
*/

use crate::result::Result;
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Errors.
pub mod error {
    /// The copy source does not fit the destination allocation.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("copy of {bytes}B exceeds allocation of {size}B")]
    pub struct CopyOutOfBounds {
        pub(super) bytes: usize,
        pub(super) size: usize,
    }

    /// The allocation has no host-visible mapping.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("allocation is not host visible")]
    pub struct NotHostVisible;
}
use error::*;

/// What an allocation is for; the allocator may place kinds differently.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AllocationKind {
    KernelIsa,
    Buffer,
    PrivateSurface,
    PrintfSurface,
    GlobalConstants,
    GlobalVariables,
}

/// A device memory allocation.
///
/// Shared read-only via `Arc`; the host-visible bytes sit behind a mutex
/// because the linker patches instruction allocations in place.
pub struct Allocation {
    gpu_address: u64,
    size: usize,
    kind: AllocationKind,
    root_device_index: u32,
    host: Option<Mutex<Box<[u8]>>>,
}

impl Allocation {
    pub fn new(
        gpu_address: u64,
        size: usize,
        kind: AllocationKind,
        root_device_index: u32,
        host: Option<Box<[u8]>>,
    ) -> Self {
        Self {
            gpu_address,
            size,
            kind,
            root_device_index,
            host: host.map(Mutex::new),
        }
    }
    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }
    pub fn underlying_buffer_size(&self) -> usize {
        self.size
    }
    pub fn kind(&self) -> AllocationKind {
        self.kind
    }
    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }
    /// Host-visible bytes, if the allocation has a CPU mapping.
    pub fn host(&self) -> Option<MutexGuard<'_, Box<[u8]>>> {
        self.host.as_ref().map(|m| m.lock())
    }
}

impl Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("size", &self.size)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Allocator seam. Allocations free themselves when the last `Arc` drops.
pub trait MemoryManager: Send + Sync {
    fn allocate_device_memory(
        &self,
        root_device_index: u32,
        size: usize,
        kind: AllocationKind,
    ) -> Result<Arc<Allocation>>;

    fn copy_host_to_allocation(&self, allocation: &Allocation, data: &[u8]) -> Result<()>;
}

/// Host-backed allocator: every allocation is zero-initialized host memory
/// with a monotonically assigned fake GPU address.
pub struct SystemMemoryManager {
    next_address: AtomicU64,
}

impl SystemMemoryManager {
    const BASE_ADDRESS: u64 = 0x8000_0000;
    const ADDRESS_ALIGNMENT: u64 = 0x1_0000;

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_address: AtomicU64::new(Self::BASE_ADDRESS),
        })
    }
}

impl MemoryManager for SystemMemoryManager {
    fn allocate_device_memory(
        &self,
        root_device_index: u32,
        size: usize,
        kind: AllocationKind,
    ) -> Result<Arc<Allocation>> {
        let aligned = (size as u64).max(1).next_multiple_of(Self::ADDRESS_ALIGNMENT);
        let gpu_address = self.next_address.fetch_add(aligned, Ordering::Relaxed);
        tracing::debug!(?kind, size, gpu_address, "allocating device memory");
        let host = vec![0u8; size].into_boxed_slice();
        Ok(Arc::new(Allocation::new(
            gpu_address,
            size,
            kind,
            root_device_index,
            Some(host),
        )))
    }

    fn copy_host_to_allocation(&self, allocation: &Allocation, data: &[u8]) -> Result<()> {
        if data.len() > allocation.underlying_buffer_size() {
            return Err(CopyOutOfBounds {
                bytes: data.len(),
                size: allocation.underlying_buffer_size(),
            }
            .into());
        }
        let mut host = allocation.host().ok_or(NotHostVisible)?;
        host[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Unified-memory lookup: maps a host-visible address anywhere inside an
/// allocation back to that allocation.
#[derive(Default)]
pub struct AllocationTracker {
    ranges: Mutex<BTreeMap<u64, Arc<Allocation>>>,
}

impl AllocationTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `allocation` as backing the address range starting at
    /// `base`.
    pub fn insert(&self, base: u64, allocation: Arc<Allocation>) {
        self.ranges.lock().insert(base, allocation);
    }

    pub fn remove(&self, base: u64) -> Option<Arc<Allocation>> {
        self.ranges.lock().remove(&base)
    }

    /// Finds the allocation whose range contains `address`.
    pub fn resolve(&self, address: u64) -> Option<Arc<Allocation>> {
        let ranges = self.ranges.lock();
        let (base, allocation) = ranges.range(..=address).next_back()?;
        if address < base + allocation.underlying_buffer_size() as u64 {
            Some(allocation.clone())
        } else {
            None
        }
    }
}
