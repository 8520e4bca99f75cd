use kdispatch::{
    descriptor::{
        ArgDescriptor, KernelDescriptor, KernelInfo, PointerArg, ProgramInfo, ValueArg,
        ValueElement,
    },
    memory::{AllocationKind, AllocationTracker, MemoryManager, SystemMemoryManager},
    module::{Module, ModuleInput, NativeDecoder},
    options::DeviceProperties,
    result::Result,
};

/// Builds the module for a kernel shaped like
/// `kernel(global int* buf, local float* tmp, int n)` with simd 16 and a
/// 32-byte cross-thread-data layout:
/// `buf` pointer at 0, `tmp` SLM offset at 8, `n` at 12, local work size
/// at 16.
fn one_kernel_module() -> Result<(
    Module,
    std::sync::Arc<AllocationTracker>,
    std::sync::Arc<SystemMemoryManager>,
)> {
    let mut descriptor = KernelDescriptor::new("saxpy");
    descriptor.attributes.cross_thread_data_size = 32;
    descriptor.attributes.simd_size = 16;
    descriptor.explicit_args = vec![
        ArgDescriptor::Pointer(PointerArg::stateless(0, 8)),
        ArgDescriptor::Pointer(PointerArg::local(8, 4)),
        ArgDescriptor::Value(ValueArg {
            elements: vec![ValueElement {
                source_offset: 0,
                dest_offset: 12,
                size: 4,
            }],
        }),
    ];
    descriptor.payload.local_work_size = Some(16);

    let mut info = KernelInfo::new(descriptor);
    info.isa_size = 128;
    info.isa = vec![0x42; 128];
    let program = ProgramInfo {
        kernels: vec![info],
        ..Default::default()
    };
    let tracker = AllocationTracker::new();
    let memory = SystemMemoryManager::new();
    let module = Module::builder(memory.clone(), DeviceProperties::default())
        .tracker(tracker.clone())
        .build(ModuleInput::Program(program), &NativeDecoder)?;
    Ok((module, tracker, memory))
}

#[test]
fn bind_and_dispatch_end_to_end() -> Result<()> {
    let (module, tracker, memory) = one_kernel_module()?;
    let mut kernel = module.create_kernel("saxpy")?;

    let buffer = memory.allocate_device_memory(0, 4096, AllocationKind::Buffer)?;
    tracker.insert(buffer.gpu_address(), buffer.clone());

    let address = buffer.gpu_address();
    kernel.set_arg_value(0, 8, Some(&address.to_le_bytes()))?;
    kernel.set_arg_value(1, 64, None)?;
    kernel.set_arg_value(2, 4, Some(&42i32.to_le_bytes()))?;
    kernel.set_group_size(16, 1, 1)?;
    kernel.set_group_count(8, 1, 1);

    assert_eq!(kernel.threads_per_thread_group(), 1);
    assert_eq!(kernel.thread_execution_mask() & 0xffff, 0xffff);
    assert_eq!(kernel.slm_args_total_size(), 1024);

    let state = kernel.dispatch_state();
    assert_eq!(&state.cross_thread_data[0..8], &address.to_le_bytes());
    assert_eq!(&state.cross_thread_data[12..16], &42i32.to_le_bytes());
    assert_eq!(&state.cross_thread_data[16..20], &16u32.to_le_bytes());
    assert_eq!(state.group_size, [16, 1, 1]);
    assert_eq!(state.group_count, [8, 1, 1]);
    assert_eq!(state.isa.underlying_buffer_size(), 128);

    let residency: Vec<_> = kernel.residency().collect();
    assert!(residency.iter().any(|a| a.gpu_address() == address));
    Ok(())
}

#[test]
fn fresh_instances_start_from_the_image_templates() -> Result<()> {
    let (module, _, _) = one_kernel_module()?;
    let a = module.create_kernel("saxpy")?;
    let b = module.create_kernel("saxpy")?;
    let image = module.kernel_image("saxpy").unwrap();
    assert_eq!(a.cross_thread_data(), image.cross_thread_template());
    assert_eq!(a.cross_thread_data(), b.cross_thread_data());
    Ok(())
}
