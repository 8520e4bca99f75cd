/*!
Kernel images and per-dispatch kernel instances.

A [`KernelImage`] materializes one compiled kernel's binary artifacts
exactly once: the instruction allocation, the cross-thread-data and state
heap templates, and the private-memory surface. It is immutable after
construction and shared read-only by every [`Kernel`] created from it.

A [`Kernel`] clones the templates into mutable working buffers, binds
argument values into them at compiler-declared byte offsets, and computes
the dispatch geometry (threads per group, per-thread local-id data, SLM
layout, execution mask) that the command encoder reads verbatim.
*/

use crate::{
    descriptor::{AddressSpace, ArgDescriptor, KernelDescriptor, KernelInfo},
    memory::{Allocation, AllocationKind},
    module::ModuleContext,
    result::Result,
    state::{
        align_up, align_up_usize, patch_pointer_with_surface, patch_scalar, patch_vec3, read_u32,
        SamplerStateSource, SurfaceStateSource,
    },
};
use std::sync::Arc;

/// Size of the printf output surface allocated for kernels that print.
pub const PRINTF_SURFACE_SIZE: usize = 4 * 1024 * 1024;

/// SLM is carved out in whole KiB.
const SLM_TOTAL_ALIGNMENT: u32 = 1024;
const PER_THREAD_DATA_ALIGNMENT: usize = 32;
const LOCAL_ID_CHANNELS: u32 = 3;

/// Errors.
pub mod error {
    /// The argument index is outside the kernel's argument list.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("argument index {index} out of range 0..{count}")]
    pub struct InvalidArgIndex {
        pub(super) index: usize,
        pub(super) count: usize,
    }

    /// An immediate copy element starts past the end of the host value.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("immediate source offset {source_offset} exceeds argument size {arg_size}")]
    pub struct InvalidArgSize {
        pub(super) source_offset: u32,
        pub(super) arg_size: usize,
    }

    /// A group size dimension is zero.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("invalid group size ({x}, {y}, {z})")]
    pub struct InvalidGroupSize {
        pub(super) x: u32,
        pub(super) y: u32,
        pub(super) z: u32,
    }

    /// The group size exceeds the device limit.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("group size {requested} exceeds device limit {max}")]
    pub struct GroupSizeExceedsLimit {
        pub(super) requested: u64,
        pub(super) max: u32,
    }

    /// A buffer argument value that is not an 8-byte pointer.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("buffer argument value of {size}B, expected an 8B pointer")]
    pub struct InvalidBufferValueSize {
        pub(super) size: usize,
    }

    /// Image and sampler arguments bind through their typed setters.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("argument {index} binds through its typed image/sampler setter")]
    pub struct InvalidObjectBinding {
        pub(super) index: usize,
    }
}
use error::*;

/// One compiled kernel's device artifacts, created once at module load and
/// immutable afterwards.
pub struct KernelImage {
    descriptor: KernelDescriptor,
    isa: Arc<Allocation>,
    cross_thread_template: Box<[u8]>,
    surface_state_template: Box<[u8]>,
    dynamic_state_template: Box<[u8]>,
    private_surface: Option<Arc<Allocation>>,
    /// Allocations every dispatch of this kernel depends on.
    residency: Vec<Arc<Allocation>>,
}

impl KernelImage {
    pub(crate) fn new(
        info: &KernelInfo,
        ctx: &ModuleContext,
        global_constants: Option<&Arc<Allocation>>,
        global_variables: Option<&Arc<Allocation>>,
    ) -> Result<Self> {
        let descriptor = info.descriptor.clone();
        let attrs = &descriptor.attributes;
        let device = &ctx.device;

        let isa_size = (info.isa_size as usize).max(info.isa.len());
        let isa = ctx.memory.allocate_device_memory(
            device.root_device_index,
            isa_size,
            AllocationKind::KernelIsa,
        )?;
        if !info.isa.is_empty() {
            ctx.memory.copy_host_to_allocation(&isa, &info.isa)?;
        }

        let mut cross_thread_template =
            vec![0u8; attrs.cross_thread_data_size as usize].into_boxed_slice();
        if let Some(init) = &info.cross_thread_data_init {
            assert!(
                init.len() <= cross_thread_template.len(),
                "cross-thread init of {}B exceeds declared size {}B",
                init.len(),
                cross_thread_template.len()
            );
            cross_thread_template[..init.len()].copy_from_slice(init);
        }
        if let Some(offset) = descriptor.payload.simd_size {
            patch_scalar(&mut cross_thread_template, offset, attrs.simd_size);
        }

        let mut surface_state_template: Box<[u8]> = info.surface_state_heap.clone().into();
        let dynamic_state_template: Box<[u8]> = info.dynamic_state_heap.clone().into();

        let mut residency = Vec::new();
        let mut private_surface = None;
        if attrs.per_thread_private_memory_size > 0 {
            let size = attrs.per_thread_private_memory_size as usize
                * device.compute_units_for_scratch as usize
                * attrs.simd_size as usize;
            assert!(size > 0, "private memory surface computed as zero bytes");
            let surface = ctx.memory.allocate_device_memory(
                device.root_device_index,
                size,
                AllocationKind::PrivateSurface,
            )?;
            let payload = &descriptor.payload.private_memory_surface;
            patch_pointer_with_surface(
                &mut cross_thread_template,
                payload.stateless,
                payload.pointer_size,
                payload.bindful,
                Some(&mut surface_state_template),
                surface.gpu_address(),
                &surface,
            );
            residency.push(surface.clone());
            private_surface = Some(surface);
        }

        for (payload, buffer, what) in [
            (
                &descriptor.payload.global_constants_surface,
                global_constants,
                "global constants",
            ),
            (
                &descriptor.payload.global_variables_surface,
                global_variables,
                "global variables",
            ),
        ] {
            if !payload.is_mapped() {
                continue;
            }
            let buffer = buffer
                .unwrap_or_else(|| panic!("kernel {} requires a {what} buffer", descriptor.name));
            patch_pointer_with_surface(
                &mut cross_thread_template,
                payload.stateless,
                payload.pointer_size,
                payload.bindful,
                Some(&mut surface_state_template),
                buffer.gpu_address(),
                buffer,
            );
            residency.push(buffer.clone());
        }

        tracing::debug!(
            kernel = %descriptor.name,
            isa_size,
            cross_thread_data_size = attrs.cross_thread_data_size,
            "kernel image initialized"
        );
        Ok(Self {
            descriptor,
            isa,
            cross_thread_template,
            surface_state_template,
            dynamic_state_template,
            private_surface,
            residency,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.descriptor
    }
    pub fn isa_allocation(&self) -> &Arc<Allocation> {
        &self.isa
    }
    pub fn cross_thread_template(&self) -> &[u8] {
        &self.cross_thread_template
    }
    pub fn surface_state_template(&self) -> &[u8] {
        &self.surface_state_template
    }
    pub fn dynamic_state_template(&self) -> &[u8] {
        &self.dynamic_state_template
    }
    pub fn private_surface(&self) -> Option<&Arc<Allocation>> {
        self.private_surface.as_ref()
    }
    pub fn residency(&self) -> &[Arc<Allocation>] {
        &self.residency
    }
}

/// Argument handler, decided once per argument at kernel creation.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum ArgBinder {
    Buffer,
    Slm,
    Image,
    Sampler,
    Immediate,
}

impl ArgBinder {
    fn for_arg(arg: &ArgDescriptor) -> Self {
        match arg {
            ArgDescriptor::Pointer(ptr) if ptr.address_space == AddressSpace::Local => Self::Slm,
            ArgDescriptor::Pointer(_) => Self::Buffer,
            ArgDescriptor::Image(_) => Self::Image,
            ArgDescriptor::Sampler(_) => Self::Sampler,
            ArgDescriptor::Value(_) => Self::Immediate,
        }
    }
}

/// The finished byte buffers and geometry a dispatch encoder reads.
pub struct DispatchState<'a> {
    pub cross_thread_data: &'a [u8],
    pub surface_state_heap: &'a [u8],
    pub dynamic_state_heap: &'a [u8],
    pub per_thread_data: &'a [u8],
    pub group_size: [u32; 3],
    pub group_count: [u32; 3],
    pub threads_per_thread_group: u32,
    pub thread_execution_mask: u32,
    pub slm_total_size: u32,
    pub isa: &'a Arc<Allocation>,
}

/// A per-dispatch kernel instance. Exclusively owned by its creator; the
/// caller serializes argument binds (single-writer).
pub struct Kernel {
    image: Arc<KernelImage>,
    context: Arc<ModuleContext>,
    binders: Vec<ArgBinder>,
    cross_thread_data: Box<[u8]>,
    surface_state_heap: Box<[u8]>,
    dynamic_state_heap: Box<[u8]>,
    group_size: [u32; 3],
    group_count: [u32; 3],
    global_offset: [u32; 3],
    threads_per_thread_group: u32,
    per_thread_data: Box<[u8]>,
    /// Allocated capacity; the buffer never shrinks across re-binds.
    per_thread_capacity: usize,
    per_thread_data_size: u32,
    per_thread_data_size_for_whole_thread_group: u32,
    thread_execution_mask: u32,
    slm_arg_sizes: Vec<u32>,
    slm_args_total_size: u32,
    /// One slot per explicit argument.
    residency: Vec<Option<Arc<Allocation>>>,
    printf_buffer: Option<Arc<Allocation>>,
}

impl Kernel {
    pub(crate) fn new(image: Arc<KernelImage>, context: Arc<ModuleContext>) -> Result<Self> {
        let descriptor = image.descriptor();
        let binders = descriptor.explicit_args.iter().map(ArgBinder::for_arg).collect();
        let arg_count = descriptor.explicit_args.len();

        let mut kernel = Self {
            cross_thread_data: image.cross_thread_template().into(),
            surface_state_heap: image.surface_state_template().into(),
            dynamic_state_heap: image.dynamic_state_template().into(),
            binders,
            group_size: [0; 3],
            group_count: [0; 3],
            global_offset: [0; 3],
            threads_per_thread_group: 0,
            per_thread_data: Box::default(),
            per_thread_capacity: 0,
            per_thread_data_size: 0,
            per_thread_data_size_for_whole_thread_group: 0,
            thread_execution_mask: 0,
            slm_arg_sizes: vec![0; arg_count],
            slm_args_total_size: 0,
            residency: vec![None; arg_count],
            printf_buffer: None,
            image,
            context,
        };

        let image = kernel.image.clone();
        let descriptor = image.descriptor();
        if descriptor.attributes.uses_printf {
            let device = &kernel.context.device;
            let buffer = kernel.context.memory.allocate_device_memory(
                device.root_device_index,
                PRINTF_SURFACE_SIZE,
                AllocationKind::PrintfSurface,
            )?;
            let payload = &descriptor.payload.printf_surface;
            patch_pointer_with_surface(
                &mut kernel.cross_thread_data,
                payload.stateless,
                payload.pointer_size,
                payload.bindful,
                Some(&mut kernel.surface_state_heap),
                buffer.gpu_address(),
                &buffer,
            );
            kernel.printf_buffer = Some(buffer);
        }
        Ok(kernel)
    }

    /// Binds one argument by index, dispatching on the argument kind that
    /// was decided at creation. For immediate arguments `size` is the host
    /// value size; for local arguments it is the SLM size declaration; for
    /// buffers `value` holds the 8-byte little-endian address.
    pub fn set_arg_value(&mut self, index: usize, size: usize, value: Option<&[u8]>) -> Result<()> {
        let binder = *self.binders.get(index).ok_or(InvalidArgIndex {
            index,
            count: self.binders.len(),
        })?;
        match binder {
            ArgBinder::Immediate => self.bind_immediate(index, size, value),
            ArgBinder::Slm => self.bind_slm(index, size),
            ArgBinder::Buffer => {
                let address = match value {
                    None => None,
                    Some(bytes) => {
                        if bytes.len() < 8 {
                            return Err(InvalidBufferValueSize { size: bytes.len() }.into());
                        }
                        let raw: [u8; 8] = bytes[..8].try_into().unwrap();
                        Some(u64::from_le_bytes(raw))
                    }
                };
                self.bind_buffer(index, address)
            }
            ArgBinder::Image | ArgBinder::Sampler => Err(InvalidObjectBinding { index }.into()),
        }
    }

    /// Binds a device buffer argument. `None` unbinds (legal: the slot is
    /// cleared and nothing is patched).
    pub fn set_arg_buffer(&mut self, index: usize, address: Option<u64>) -> Result<()> {
        if index >= self.binders.len() {
            return Err(InvalidArgIndex {
                index,
                count: self.binders.len(),
            }
            .into());
        }
        debug_assert_eq!(self.binders[index], ArgBinder::Buffer);
        self.bind_buffer(index, address)
    }

    /// Binds an image argument from its precomputed surface state.
    pub fn set_arg_image(
        &mut self,
        index: usize,
        image: Option<&dyn SurfaceStateSource>,
        redescribed: bool,
    ) -> Result<()> {
        if index >= self.binders.len() {
            return Err(InvalidArgIndex {
                index,
                count: self.binders.len(),
            }
            .into());
        }
        debug_assert_eq!(self.binders[index], ArgBinder::Image);
        let Some(source) = image else {
            self.residency[index] = None;
            return Ok(());
        };
        let kernel_image = self.image.clone();
        let ArgDescriptor::Image(arg) = &kernel_image.descriptor().explicit_args[index] else {
            panic!("image binder on non-image argument {index}");
        };
        if let Some(bindful) = arg.bindful {
            source.copy_surface_state_to_heap(
                &mut self.surface_state_heap,
                bindful as usize,
                redescribed,
            );
        }
        self.residency[index] = Some(source.allocation().clone());
        Ok(())
    }

    /// Binds a sampler argument into the dynamic-state heap.
    pub fn set_arg_sampler(&mut self, index: usize, sampler: &dyn SamplerStateSource) -> Result<()> {
        if index >= self.binders.len() {
            return Err(InvalidArgIndex {
                index,
                count: self.binders.len(),
            }
            .into());
        }
        debug_assert_eq!(self.binders[index], ArgBinder::Sampler);
        let image = self.image.clone();
        let ArgDescriptor::Sampler(arg) = &image.descriptor().explicit_args[index] else {
            panic!("sampler binder on non-sampler argument {index}");
        };
        if let Some(bindful) = arg.bindful {
            sampler.copy_sampler_state_to_heap(&mut self.dynamic_state_heap, bindful as usize);
        }
        Ok(())
    }

    fn bind_immediate(&mut self, index: usize, arg_size: usize, value: Option<&[u8]>) -> Result<()> {
        let image = self.image.clone();
        let ArgDescriptor::Value(arg) = &image.descriptor().explicit_args[index] else {
            panic!("immediate binder on non-value argument {index}");
        };
        // Validate the whole element list before touching cross-thread data.
        for element in &arg.elements {
            if element.source_offset as usize >= arg_size {
                return Err(InvalidArgSize {
                    source_offset: element.source_offset,
                    arg_size,
                }
                .into());
            }
        }
        for element in &arg.elements {
            let source = element.source_offset as usize;
            let count = (element.size as usize).min(arg_size - source);
            let dest = element.dest_offset as usize;
            match value {
                Some(bytes) => self.cross_thread_data[dest..dest + count]
                    .copy_from_slice(&bytes[source..source + count]),
                None => self.cross_thread_data[dest..dest + count].fill(0),
            }
        }
        Ok(())
    }

    /// Records the SLM size declared for this argument and re-chains the
    /// offsets of every subsequent SLM argument: each is aligned up to its
    /// declared alignment and advanced by its previously recorded size.
    /// The walk repeats on every SLM bind because a later bind can move a
    /// dependent offset.
    fn bind_slm(&mut self, index: usize, size: usize) -> Result<()> {
        let image = self.image.clone();
        let args = &image.descriptor().explicit_args;
        let arg = args[index]
            .as_pointer()
            .unwrap_or_else(|| panic!("slm binder on non-pointer argument {index}"));
        self.slm_arg_sizes[index] = size as u32;
        let Some(slot) = arg.stateless else {
            return Ok(());
        };
        let mut offset = read_u32(&self.cross_thread_data, slot) + size as u32;
        for (next_index, next) in args.iter().enumerate().skip(index + 1) {
            if !next.is_local_pointer() {
                continue;
            }
            let next = next.as_pointer().unwrap();
            offset = align_up(offset, next.slm_alignment.max(1));
            if let Some(slot) = next.stateless {
                patch_scalar(&mut self.cross_thread_data, slot, offset);
            }
            offset += self.slm_arg_sizes[next_index];
        }
        self.slm_args_total_size = align_up(offset, SLM_TOTAL_ALIGNMENT);
        Ok(())
    }

    fn bind_buffer(&mut self, index: usize, address: Option<u64>) -> Result<()> {
        let Some(address) = address else {
            self.residency[index] = None;
            return Ok(());
        };
        let image = self.image.clone();
        let arg = image.descriptor().explicit_args[index]
            .as_pointer()
            .unwrap_or_else(|| panic!("buffer binder on non-pointer argument {index}"));
        let allocation = self
            .context
            .tracker
            .resolve(address)
            .unwrap_or_else(|| panic!("no allocation backs address {address:#x}"));
        patch_pointer_with_surface(
            &mut self.cross_thread_data,
            arg.stateless,
            arg.pointer_size,
            arg.bindful,
            Some(&mut self.surface_state_heap),
            address,
            &allocation,
        );
        self.residency[index] = Some(allocation);
        Ok(())
    }

    /// Sets the work-group size, sizes and fills the per-thread data, and
    /// derives the tail-thread execution mask.
    pub fn set_group_size(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        if x == 0 || y == 0 || z == 0 {
            return Err(InvalidGroupSize { x, y, z }.into());
        }
        // Widened: the product of three valid u32 extents can overflow.
        let items = x as u64 * y as u64 * z as u64;
        let max = self.context.device.max_group_size;
        if items > max as u64 {
            return Err(GroupSizeExceedsLimit {
                requested: items,
                max,
            }
            .into());
        }
        let items = items as u32;
        let image = self.image.clone();
        let attrs = &image.descriptor().attributes;
        let simd = attrs.simd_size;
        let threads = items.div_ceil(simd);
        let channels = attrs.num_local_id_channels;
        let per_thread = per_thread_local_id_size(simd, attrs.grf_size, channels);
        let whole_group = per_thread * threads;
        self.ensure_per_thread_capacity(whole_group as usize);
        if channels > 0 {
            assert_eq!(
                channels, LOCAL_ID_CHANNELS,
                "unsupported local id channel count {channels}"
            );
            generate_local_ids(
                &mut self.per_thread_data[..whole_group as usize],
                simd,
                attrs.grf_size,
                [x, y, z],
            );
        }
        self.group_size = [x, y, z];
        self.threads_per_thread_group = threads;
        self.per_thread_data_size_for_whole_thread_group = whole_group;
        self.per_thread_data_size = whole_group / threads;

        // Hardware and debug tooling read different aliases of the local
        // work size; all mapped slots receive the same value.
        let payload = &image.descriptor().payload;
        patch_vec3(&mut self.cross_thread_data, payload.local_work_size, [x, y, z]);
        patch_vec3(&mut self.cross_thread_data, payload.local_work_size2, [x, y, z]);
        patch_vec3(
            &mut self.cross_thread_data,
            payload.enqueued_local_work_size,
            [x, y, z],
        );

        let remainder = items % simd;
        self.thread_execution_mask = if remainder != 0 {
            (1u32 << remainder) - 1
        } else {
            // Evenly divided: the tail thread runs fully populated.
            !0u32
        };
        Ok(())
    }

    /// Sets the group count and patches the derived global-size payloads.
    /// The global size saturates at `u32::MAX` per dimension; the payload
    /// words are 32-bit.
    pub fn set_group_count(&mut self, x: u32, y: u32, z: u32) {
        self.group_count = [x, y, z];
        let image = self.image.clone();
        let payload = &image.descriptor().payload;
        patch_vec3(&mut self.cross_thread_data, payload.num_work_groups, [x, y, z]);
        let global = [0usize, 1, 2].map(|dim| {
            (self.group_count[dim] as u64 * self.group_size[dim] as u64)
                .min(u32::MAX as u64) as u32
        });
        patch_vec3(&mut self.cross_thread_data, payload.global_work_size, global);
    }

    /// Patches the global work offset payload, when mapped.
    pub fn set_global_offset(&mut self, x: u32, y: u32, z: u32) {
        self.global_offset = [x, y, z];
        let image = self.image.clone();
        patch_vec3(
            &mut self.cross_thread_data,
            image.descriptor().payload.global_work_offset,
            [x, y, z],
        );
    }

    /// Suggests a work-group decomposition of `global` that divides each
    /// extent and respects the device group-size limit. A heuristic: any
    /// occupancy-reasonable divisor choice is valid.
    pub fn suggest_group_size(&self, global: [u32; 3]) -> [u32; 3] {
        let attrs = &self.image.descriptor().attributes;
        if let Some(required) = attrs.required_work_group_size {
            return required;
        }
        let global = global.map(|extent| extent.max(1));
        let max = self.context.device.max_group_size;
        let tuning = &self.context.tuning;
        if tuning.nd_work_size_heuristic() {
            return self.suggest_group_size_nd(global, max);
        }
        let dims = global.iter().filter(|&&extent| extent > 1).count().max(1);
        let mut group = [1u32; 3];
        let mut budget = max;
        if dims == 2 && tuning.squared_work_size_heuristic() {
            // Near-square split for 2D problems.
            let side = (max as f64).sqrt() as u32;
            group[0] = largest_divisor_up_to(global[0], side.max(1));
            budget /= group[0];
            group[1] = largest_divisor_up_to(global[1], budget);
            budget /= group[1];
            group[2] = largest_divisor_up_to(global[2], budget);
            return group;
        }
        for dim in 0..3 {
            group[dim] = largest_divisor_up_to(global[dim], budget);
            budget /= group[dim];
        }
        group
    }

    /// Joint search over divisor candidates in all three dimensions,
    /// scored by group occupancy and full-SIMD utilization, with a mild
    /// preference against huge groups for barrier/SLM-heavy kernels.
    fn suggest_group_size_nd(&self, global: [u32; 3], max: u32) -> [u32; 3] {
        let attrs = &self.image.descriptor().attributes;
        let simd = attrs.simd_size;
        let slm_per_group =
            align_up(attrs.slm_inline_size + self.slm_args_total_size, SLM_TOTAL_ALIGNMENT);
        let candidates: Vec<Vec<u32>> = global
            .iter()
            .map(|&extent| divisors_up_to(extent, max))
            .collect();
        let mut best = [1u32; 3];
        let mut best_score = f64::MIN;
        for &gz in &candidates[2] {
            for &gy in &candidates[1] {
                for &gx in &candidates[0] {
                    let total = gx * gy * gz;
                    if total > max {
                        continue;
                    }
                    let mut score = total as f64 / max as f64;
                    if total % simd == 0 {
                        score += 0.25;
                    }
                    if attrs.uses_barriers || slm_per_group > 0 {
                        // Smaller groups keep more of them resident.
                        score -= 0.1 * (total as f64 / max as f64);
                    }
                    if attrs.uses_images && gx % 4 == 0 {
                        score += 0.05;
                    }
                    if score > best_score {
                        best_score = score;
                        best = [gx, gy, gz];
                    }
                }
            }
        }
        best
    }

    /// Maximum number of groups the device can run concurrently for a
    /// grid-synchronizing dispatch. The group size must already be set.
    pub fn suggest_max_cooperative_group_count(&self) -> u32 {
        assert!(
            self.group_size.iter().all(|&dim| dim != 0),
            "group size must be set before querying cooperative group count"
        );
        let device = &self.context.device;
        let attrs = &self.image.descriptor().attributes;
        let items: u32 = self.group_size.iter().product();
        let threads_per_group = items.div_ceil(attrs.simd_size);
        let mut count = device.available_thread_count() / threads_per_group;
        if attrs.uses_barriers {
            count = count.min(device.num_subslices * device.barrier_slots_per_subslice);
        }
        let slm_per_group =
            align_up(attrs.slm_inline_size + self.slm_args_total_size, SLM_TOTAL_ALIGNMENT);
        if slm_per_group > 0 {
            count = count.min(device.num_subslices * (device.local_memory_size / slm_per_group));
        }
        count
    }

    /// Grows the per-thread-data buffer to at least `required` bytes.
    /// Reallocates only past the capacity watermark, never shrinks.
    fn ensure_per_thread_capacity(&mut self, required: usize) {
        if required > self.per_thread_capacity {
            let capacity = align_up_usize(required, PER_THREAD_DATA_ALIGNMENT);
            self.per_thread_data = vec![0u8; capacity].into_boxed_slice();
            self.per_thread_capacity = capacity;
        }
    }

    pub fn image(&self) -> &Arc<KernelImage> {
        &self.image
    }
    pub fn group_size(&self) -> [u32; 3] {
        self.group_size
    }
    pub fn global_offset(&self) -> [u32; 3] {
        self.global_offset
    }
    pub fn threads_per_thread_group(&self) -> u32 {
        self.threads_per_thread_group
    }
    pub fn thread_execution_mask(&self) -> u32 {
        self.thread_execution_mask
    }
    pub fn per_thread_data_size(&self) -> u32 {
        self.per_thread_data_size
    }
    pub fn per_thread_data_size_for_whole_thread_group(&self) -> u32 {
        self.per_thread_data_size_for_whole_thread_group
    }
    pub fn slm_args_total_size(&self) -> u32 {
        self.slm_args_total_size
    }
    pub fn cross_thread_data(&self) -> &[u8] {
        &self.cross_thread_data
    }
    pub fn surface_state_heap_data(&self) -> &[u8] {
        &self.surface_state_heap
    }
    pub fn dynamic_state_heap_data(&self) -> &[u8] {
        &self.dynamic_state_heap
    }
    pub fn printf_buffer(&self) -> Option<&Arc<Allocation>> {
        self.printf_buffer.as_ref()
    }

    /// Every allocation this dispatch depends on: bound argument slots,
    /// the image's residency, and the printf buffer.
    pub fn residency(&self) -> impl Iterator<Item = &Arc<Allocation>> {
        self.residency
            .iter()
            .flatten()
            .chain(self.image.residency().iter())
            .chain(self.printf_buffer.iter())
    }

    /// The allocation bound to an argument slot, if any.
    pub fn arg_residency(&self, index: usize) -> Option<&Arc<Allocation>> {
        self.residency.get(index).and_then(Option::as_ref)
    }

    pub fn dispatch_state(&self) -> DispatchState<'_> {
        DispatchState {
            cross_thread_data: &self.cross_thread_data,
            surface_state_heap: &self.surface_state_heap,
            dynamic_state_heap: &self.dynamic_state_heap,
            per_thread_data: &self.per_thread_data
                [..self.per_thread_data_size_for_whole_thread_group as usize],
            group_size: self.group_size,
            group_count: self.group_count,
            threads_per_thread_group: self.threads_per_thread_group,
            thread_execution_mask: self.thread_execution_mask,
            slm_total_size: self.slm_args_total_size,
            isa: self.image.isa_allocation(),
        }
    }
}

/// Per-thread local-id bytes: each channel occupies a whole number of GRF
/// registers of 16-bit lane entries. Zero when the kernel reads no ids.
fn per_thread_local_id_size(simd: u32, grf_size: u32, channels: u32) -> u32 {
    if channels == 0 {
        0
    } else {
        channels * align_up(simd * 2, grf_size)
    }
}

/// Fills the local-id table for dimension order (0, 1, 2), non-quad
/// layout: one row of u16 lane entries per channel per thread. Lanes past
/// the last work item are zero; the execution mask disables them.
fn generate_local_ids(buffer: &mut [u8], simd: u32, grf_size: u32, group: [u32; 3]) {
    let channel_stride = align_up(simd * 2, grf_size) as usize;
    let per_thread = LOCAL_ID_CHANNELS as usize * channel_stride;
    let items = group[0] * group[1] * group[2];
    let threads = items.div_ceil(simd);
    for thread in 0..threads {
        let thread_base = thread as usize * per_thread;
        for lane in 0..simd {
            let item = thread * simd + lane;
            let (id_x, id_y, id_z) = if item < items {
                (
                    item % group[0],
                    (item / group[0]) % group[1],
                    item / (group[0] * group[1]),
                )
            } else {
                (0, 0, 0)
            };
            let lane_offset = thread_base + lane as usize * 2;
            for (channel, id) in [id_x, id_y, id_z].into_iter().enumerate() {
                let offset = lane_offset + channel * channel_stride;
                buffer[offset..offset + 2].copy_from_slice(&(id as u16).to_le_bytes());
            }
        }
    }
}

fn largest_divisor_up_to(extent: u32, cap: u32) -> u32 {
    let cap = cap.min(extent).max(1);
    (1..=cap).rev().find(|d| extent % d == 0).unwrap_or(1)
}

fn divisors_up_to(extent: u32, cap: u32) -> Vec<u32> {
    (1..=cap.min(extent)).filter(|d| extent % d == 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::{ImageArg, PointerArg, ProgramInfo, SamplerArg, ValueArg, ValueElement},
        memory::{AllocationTracker, MemoryManager, SystemMemoryManager},
        module::{Module, ModuleInput, NativeDecoder},
        options::DeviceProperties,
        state::{SamplerStateRecord, SURFACE_STATE_SIZE},
    };
    use paste::paste;

    fn make_kernel(
        descriptor: KernelDescriptor,
        surface_state_heap: Vec<u8>,
    ) -> Result<(Kernel, Arc<AllocationTracker>, Arc<SystemMemoryManager>)> {
        let memory = SystemMemoryManager::new();
        let tracker = AllocationTracker::new();
        let name = descriptor.name.clone();
        let mut info = KernelInfo::new(descriptor);
        info.isa_size = 64;
        info.surface_state_heap = surface_state_heap;
        let program = ProgramInfo {
            kernels: vec![info],
            ..Default::default()
        };
        let module = Module::builder(memory.clone(), DeviceProperties::default())
            .tracker(tracker.clone())
            .build(ModuleInput::Program(program), &NativeDecoder)?;
        Ok((module.create_kernel(&name)?, tracker, memory))
    }

    fn read_u64(buffer: &[u8], offset: usize) -> u64 {
        u64::from_le_bytes(buffer[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn templates_round_trip() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("copy");
        descriptor.attributes.cross_thread_data_size = 32;
        descriptor.payload.simd_size = Some(28);
        let memory = SystemMemoryManager::new();
        let mut info = KernelInfo::new(descriptor);
        info.isa_size = 16;
        info.cross_thread_data_init = Some(vec![1, 2, 3, 4]);
        info.surface_state_heap = vec![0xab; 128];
        info.dynamic_state_heap = vec![0xcd; 64];
        let program = ProgramInfo {
            kernels: vec![info],
            ..Default::default()
        };
        let module = Module::builder(memory, DeviceProperties::default())
            .build(ModuleInput::Program(program), &NativeDecoder)?;
        let image = module.kernel_image("copy").unwrap().clone();
        let kernel = module.create_kernel("copy")?;
        assert_eq!(kernel.cross_thread_data(), image.cross_thread_template());
        assert_eq!(kernel.surface_state_heap_data(), image.surface_state_template());
        assert_eq!(kernel.dynamic_state_heap_data(), image.dynamic_state_template());
        assert_eq!(&kernel.cross_thread_data()[..4], &[1, 2, 3, 4]);
        assert_eq!(read_u32(kernel.cross_thread_data(), 28), 8);
        Ok(())
    }

    #[test]
    fn group_size_geometry() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("geom");
        descriptor.attributes.cross_thread_data_size = 32;
        descriptor.attributes.simd_size = 16;
        descriptor.payload.local_work_size = Some(16);
        let (mut kernel, _, _) = make_kernel(descriptor, Vec::new())?;

        kernel.set_group_size(4, 2, 2)?;
        assert_eq!(kernel.threads_per_thread_group(), 1);
        kernel.set_group_size(32, 1, 1)?;
        assert_eq!(kernel.threads_per_thread_group(), 2);
        assert_eq!(read_u32(kernel.cross_thread_data(), 16), 32);
        assert_eq!(read_u32(kernel.cross_thread_data(), 20), 1);

        let err = kernel.set_group_size(0, 1, 1).unwrap_err();
        assert!(err.downcast_ref::<InvalidGroupSize>().is_some());
        let err = kernel.set_group_size(1025, 1, 1).unwrap_err();
        assert!(err.downcast_ref::<GroupSizeExceedsLimit>().is_some());
        // The item count can exceed u32; it must still reject, not wrap.
        let err = kernel.set_group_size(65536, 65536, 1).unwrap_err();
        assert!(err.downcast_ref::<GroupSizeExceedsLimit>().is_some());
        // A failed call leaves the previous geometry in place.
        assert_eq!(kernel.group_size(), [32, 1, 1]);
        Ok(())
    }

    #[test]
    fn group_count_saturates_global_size() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("count");
        descriptor.attributes.cross_thread_data_size = 32;
        descriptor.attributes.simd_size = 32;
        descriptor.payload.num_work_groups = Some(0);
        descriptor.payload.global_work_size = Some(16);
        let (mut kernel, _, _) = make_kernel(descriptor, Vec::new())?;
        kernel.set_group_size(1024, 1, 1)?;
        kernel.set_group_count(1 << 22, 1, 1);
        assert_eq!(read_u32(kernel.cross_thread_data(), 0), 1 << 22);
        assert_eq!(read_u32(kernel.cross_thread_data(), 16), u32::MAX);
        assert_eq!(read_u32(kernel.cross_thread_data(), 20), 1);
        Ok(())
    }

    macro_rules! impl_mask_tests {
        ($($simd:literal),*) => {
            paste! {
                $(
                    #[test]
                    fn [<execution_mask_simd_ $simd>]() -> Result<()> {
                        let mut descriptor = KernelDescriptor::new("mask");
                        descriptor.attributes.simd_size = $simd;
                        let (mut kernel, _, _) = make_kernel(descriptor, Vec::new())?;
                        kernel.set_group_size($simd, 1, 1)?;
                        assert_eq!(kernel.thread_execution_mask(), !0u32);
                        kernel.set_group_size($simd + 3, 1, 1)?;
                        assert_eq!(kernel.thread_execution_mask(), 0b111);
                        Ok(())
                    }
                )*
            }
        };
    }
    impl_mask_tests!(8, 16, 32);

    #[test]
    fn slm_chaining_realigns_later_arguments() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("slm");
        descriptor.attributes.cross_thread_data_size = 32;
        descriptor.explicit_args = vec![
            ArgDescriptor::Pointer(PointerArg::local(8, 4)),
            ArgDescriptor::Pointer(PointerArg::local(12, 16)),
        ];
        let (mut kernel, _, _) = make_kernel(descriptor, Vec::new())?;

        kernel.set_arg_value(0, 4, None)?;
        assert_eq!(read_u32(kernel.cross_thread_data(), 12), 16);
        assert_eq!(kernel.slm_args_total_size(), 1024);

        kernel.set_arg_value(1, 8, None)?;
        assert_eq!(kernel.slm_args_total_size(), 1024);

        // Rebinding the first argument with a larger size moves the second.
        kernel.set_arg_value(0, 20, None)?;
        assert_eq!(read_u32(kernel.cross_thread_data(), 12), 32);
        assert_eq!(kernel.slm_args_total_size(), 1024);
        Ok(())
    }

    #[test]
    fn immediate_copy_clamps_to_argument_size() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("imm");
        descriptor.attributes.cross_thread_data_size = 32;
        descriptor.explicit_args = vec![ArgDescriptor::Value(ValueArg {
            elements: vec![ValueElement {
                source_offset: 4,
                dest_offset: 16,
                size: 4,
            }],
        })];
        let (mut kernel, _, _) = make_kernel(descriptor, Vec::new())?;
        kernel.set_arg_value(0, 6, Some(&[1, 2, 3, 4, 5, 6]))?;
        assert_eq!(&kernel.cross_thread_data()[16..20], &[5, 6, 0, 0]);
        Ok(())
    }

    #[test]
    fn immediate_copy_rejects_out_of_range_source() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("imm");
        descriptor.attributes.cross_thread_data_size = 32;
        descriptor.explicit_args = vec![ArgDescriptor::Value(ValueArg {
            elements: vec![ValueElement {
                source_offset: 8,
                dest_offset: 16,
                size: 4,
            }],
        })];
        let (mut kernel, _, _) = make_kernel(descriptor, Vec::new())?;
        let err = kernel.set_arg_value(0, 6, Some(&[0; 6])).unwrap_err();
        assert!(err.downcast_ref::<InvalidArgSize>().is_some());
        Ok(())
    }

    #[test]
    fn out_of_range_index_is_rejected() -> Result<()> {
        let descriptor = KernelDescriptor::new("empty");
        let (mut kernel, _, _) = make_kernel(descriptor, Vec::new())?;
        let err = kernel.set_arg_value(0, 4, None).unwrap_err();
        assert!(err.downcast_ref::<InvalidArgIndex>().is_some());
        Ok(())
    }

    #[test]
    fn buffer_binding_tracks_residency() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("buf");
        descriptor.attributes.cross_thread_data_size = 32;
        descriptor.explicit_args = vec![ArgDescriptor::Pointer(
            PointerArg::stateless(0, 8).with_bindful(0),
        )];
        let (mut kernel, tracker, memory) = make_kernel(descriptor, vec![0; 64])?;
        let buffer = memory.allocate_device_memory(0, 256, AllocationKind::Buffer)?;
        tracker.insert(buffer.gpu_address(), buffer.clone());

        let address = buffer.gpu_address() + 16;
        kernel.set_arg_buffer(0, Some(address))?;
        assert_eq!(read_u64(kernel.cross_thread_data(), 0), address);
        // Surface state describes the whole allocation.
        assert_eq!(
            read_u64(kernel.surface_state_heap_data(), 0),
            buffer.gpu_address()
        );
        assert!(Arc::ptr_eq(kernel.arg_residency(0).unwrap(), &buffer));
        let bound = kernel
            .residency()
            .filter(|a| Arc::ptr_eq(a, &buffer))
            .count();
        assert_eq!(bound, 1);

        kernel.set_arg_buffer(0, None)?;
        assert!(kernel.arg_residency(0).is_none());
        Ok(())
    }

    struct TestImage {
        allocation: Arc<Allocation>,
        surface_state: [u8; SURFACE_STATE_SIZE],
    }

    impl SurfaceStateSource for TestImage {
        fn copy_surface_state_to_heap(&self, heap: &mut [u8], offset: usize, _redescribed: bool) {
            heap[offset..offset + SURFACE_STATE_SIZE].copy_from_slice(&self.surface_state);
        }
        fn allocation(&self) -> &Arc<Allocation> {
            &self.allocation
        }
    }

    #[test]
    fn image_and_sampler_bind_into_state_heaps() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("img");
        descriptor.attributes.cross_thread_data_size = 32;
        descriptor.explicit_args = vec![
            ArgDescriptor::Image(ImageArg { bindful: Some(0) }),
            ArgDescriptor::Sampler(SamplerArg { bindful: Some(0) }),
        ];
        let memory = SystemMemoryManager::new();
        let mut info = KernelInfo::new(descriptor);
        info.isa_size = 16;
        info.surface_state_heap = vec![0; 64];
        info.dynamic_state_heap = vec![0; 16];
        let program = ProgramInfo {
            kernels: vec![info],
            ..Default::default()
        };
        let module = Module::builder(memory.clone(), DeviceProperties::default())
            .build(ModuleInput::Program(program), &NativeDecoder)?;
        let mut kernel = module.create_kernel("img")?;

        let allocation = memory.allocate_device_memory(0, 256, AllocationKind::Buffer)?;
        let image = TestImage {
            allocation,
            surface_state: [0x5a; SURFACE_STATE_SIZE],
        };
        kernel.set_arg_image(0, Some(&image), false)?;
        assert_eq!(
            &kernel.surface_state_heap_data()[..SURFACE_STATE_SIZE],
            &image.surface_state
        );
        assert!(Arc::ptr_eq(kernel.arg_residency(0).unwrap(), image.allocation()));

        let sampler = SamplerStateRecord {
            filter_linear: true,
            normalized_coords: false,
            address_mode: 2,
        };
        kernel.set_arg_sampler(1, &sampler)?;
        assert_eq!(&kernel.dynamic_state_heap_data()[..3], &[1, 0, 2]);

        // Object arguments do not bind through the generic value setter.
        let err = kernel.set_arg_value(0, 8, None).unwrap_err();
        assert!(err.downcast_ref::<InvalidObjectBinding>().is_some());

        kernel.set_arg_image(0, None, false)?;
        assert!(kernel.arg_residency(0).is_none());
        Ok(())
    }

    #[test]
    fn per_thread_data_keeps_capacity_watermark() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("ids");
        descriptor.attributes.simd_size = 8;
        descriptor.attributes.num_local_id_channels = 3;
        let (mut kernel, _, _) = make_kernel(descriptor, Vec::new())?;

        kernel.set_group_size(16, 8, 2)?;
        let high_water = kernel.per_thread_capacity;
        let large = kernel.per_thread_data_size_for_whole_thread_group();
        kernel.set_group_size(8, 1, 1)?;
        assert_eq!(kernel.per_thread_capacity, high_water);
        assert!(kernel.per_thread_data_size_for_whole_thread_group() < large);
        Ok(())
    }

    #[test]
    fn local_id_table_layout() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("ids");
        descriptor.attributes.simd_size = 8;
        descriptor.attributes.grf_size = 32;
        descriptor.attributes.num_local_id_channels = 3;
        let (mut kernel, _, _) = make_kernel(descriptor, Vec::new())?;
        kernel.set_group_size(4, 2, 1)?;
        assert_eq!(kernel.threads_per_thread_group(), 1);
        // One channel per GRF: 32-byte rows of u16 lane entries.
        let data = kernel.dispatch_state().per_thread_data;
        assert_eq!(data.len(), 96);
        let lane = 5usize;
        let id_x = u16::from_le_bytes(data[lane * 2..lane * 2 + 2].try_into().unwrap());
        let id_y = u16::from_le_bytes(data[32 + lane * 2..32 + lane * 2 + 2].try_into().unwrap());
        let id_z = u16::from_le_bytes(data[64 + lane * 2..64 + lane * 2 + 2].try_into().unwrap());
        assert_eq!((id_x, id_y, id_z), (1, 1, 0));
        Ok(())
    }

    #[test]
    fn suggested_group_size_divides_and_fits() -> Result<()> {
        let mut descriptor = KernelDescriptor::new("suggest");
        descriptor.attributes.simd_size = 16;
        let (mut kernel, _, _) = make_kernel(descriptor, Vec::new())?;
        for global in [[1024, 1, 1], [640, 480, 1], [7, 7, 7], [1, 1, 1]] {
            let group = kernel.suggest_group_size(global);
            assert!(group.iter().product::<u32>() <= 1024, "{group:?}");
            for dim in 0..3 {
                assert_eq!(global[dim].max(1) % group[dim], 0, "{global:?} {group:?}");
            }
        }
        kernel.set_group_size(16, 1, 1)?;
        assert!(kernel.suggest_max_cooperative_group_count() > 0);
        Ok(())
    }
}
