/*!
Device capabilities and group-size heuristic tuning.

Both structs are built once at module/device initialization and passed by
reference; nothing in the engine mutates them.
*/

use serde::Deserialize;

/// Capabilities of the target device that the engine reads.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct DeviceProperties {
    pub root_device_index: u32,
    /// Upper bound on work items per group.
    pub max_group_size: u32,
    /// Scales the private-memory surface.
    pub compute_units_for_scratch: u32,
    pub num_subslices: u32,
    pub eu_count_per_subslice: u32,
    pub threads_per_eu: u32,
    /// SLM capacity per subslice in bytes.
    pub local_memory_size: u32,
    /// Hardware barrier slots per subslice.
    pub barrier_slots_per_subslice: u32,
}

impl DeviceProperties {
    /// Thread slots available across the device.
    pub fn available_thread_count(&self) -> u32 {
        self.num_subslices * self.eu_count_per_subslice * self.threads_per_eu
    }
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            root_device_index: 0,
            max_group_size: 1024,
            compute_units_for_scratch: 64,
            num_subslices: 8,
            eu_count_per_subslice: 16,
            threads_per_eu: 7,
            local_memory_size: 64 * 1024,
            barrier_slots_per_subslice: 32,
        }
    }
}

/// Tuning knobs for [`suggest_group_size`](crate::kernel::Kernel::suggest_group_size),
/// set per module at build time.
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupSizeTuning {
    /// Search all three dimensions jointly instead of splitting greedily.
    nd_work_size_heuristic: bool,
    /// Prefer balanced (near-square) 2D decompositions.
    squared_work_size_heuristic: bool,
    /// Overrides the device's fused-EU dispatch choice.
    forced_fused_eu_dispatch: Option<bool>,
    /// Rebuild precompiled kernels instead of reusing cached binaries.
    rebuild_precompiled_kernels: bool,
}

impl GroupSizeTuning {
    pub const fn nd_work_size_heuristic(&self) -> bool {
        self.nd_work_size_heuristic
    }
    pub const fn with_nd_work_size_heuristic(mut self, enable: bool) -> Self {
        self.nd_work_size_heuristic = enable;
        self
    }
    pub const fn squared_work_size_heuristic(&self) -> bool {
        self.squared_work_size_heuristic
    }
    pub const fn with_squared_work_size_heuristic(mut self, enable: bool) -> Self {
        self.squared_work_size_heuristic = enable;
        self
    }
    pub const fn forced_fused_eu_dispatch(&self) -> Option<bool> {
        self.forced_fused_eu_dispatch
    }
    pub const fn with_forced_fused_eu_dispatch(mut self, force: Option<bool>) -> Self {
        self.forced_fused_eu_dispatch = force;
        self
    }
    pub const fn rebuild_precompiled_kernels(&self) -> bool {
        self.rebuild_precompiled_kernels
    }
    pub const fn with_rebuild_precompiled_kernels(mut self, enable: bool) -> Self {
        self.rebuild_precompiled_kernels = enable;
        self
    }
}
