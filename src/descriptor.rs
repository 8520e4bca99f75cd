/*!
In-memory model of a compiled kernel's binary metadata.

The compiler/decoder collaborator produces one [`ProgramInfo`] per input
program: a sequence of [`KernelInfo`]s (descriptor plus raw heap blobs) and
optional linker input. Byte offsets into cross-thread data and the state
heaps are `Option<u32>`: `None` means the compiler did not map the field.
All types serialize with serde; the persisted native module format is the
bincode encoding of [`ProgramInfo`].
*/

use serde::{Deserialize, Serialize};

/// Tagged descriptor for one explicit kernel argument.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum ArgDescriptor {
    Pointer(PointerArg),
    Image(ImageArg),
    Sampler(SamplerArg),
    Value(ValueArg),
}

impl ArgDescriptor {
    pub fn as_pointer(&self) -> Option<&PointerArg> {
        match self {
            Self::Pointer(arg) => Some(arg),
            _ => None,
        }
    }
    /// Is an SLM/local pointer argument.
    pub fn is_local_pointer(&self) -> bool {
        matches!(
            self,
            Self::Pointer(PointerArg {
                address_space: AddressSpace::Local,
                ..
            })
        )
    }
}

/// Address space of a pointer argument.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub enum AddressSpace {
    Global,
    Constant,
    /// Shared local memory; the argument declares a size, not a pointer.
    Local,
}

/// A buffer/pointer argument.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PointerArg {
    /// Cross-thread-data offset of the pointer value (or, for local
    /// arguments, of the SLM byte offset).
    pub stateless: Option<u32>,
    /// Width of the patched field in bytes (4 or 8).
    pub pointer_size: u8,
    /// Surface-state-heap offset for the bindful form.
    pub bindful: Option<u32>,
    pub address_space: AddressSpace,
    /// Required alignment of the SLM offset for local arguments.
    pub slm_alignment: u32,
}

impl PointerArg {
    pub fn stateless(offset: u32, pointer_size: u8) -> Self {
        Self {
            stateless: Some(offset),
            pointer_size,
            bindful: None,
            address_space: AddressSpace::Global,
            slm_alignment: 1,
        }
    }
    pub fn with_bindful(mut self, offset: u32) -> Self {
        self.bindful = Some(offset);
        self
    }
    pub fn local(offset: u32, alignment: u32) -> Self {
        Self {
            stateless: Some(offset),
            pointer_size: 4,
            bindful: None,
            address_space: AddressSpace::Local,
            slm_alignment: alignment,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ImageArg {
    /// Surface-state-heap offset of the image's surface state.
    pub bindful: Option<u32>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SamplerArg {
    /// Dynamic-state-heap offset of the sampler state.
    pub bindful: Option<u32>,
}

/// An immediate (by-value) argument, copied into cross-thread data as one
/// or more elements. The compiler may split or reorder the host-side
/// struct, hence per-element source/destination offsets.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ValueArg {
    pub elements: Vec<ValueElement>,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug)]
pub struct ValueElement {
    /// Offset into the host-provided value.
    pub source_offset: u32,
    /// Offset into cross-thread data.
    pub dest_offset: u32,
    pub size: u32,
}

/// Cross-thread-data mapping of one implicit pointer payload.
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct PointerPayload {
    pub stateless: Option<u32>,
    pub pointer_size: u8,
    pub bindful: Option<u32>,
}

impl PointerPayload {
    pub fn stateless(offset: u32, pointer_size: u8) -> Self {
        Self {
            stateless: Some(offset),
            pointer_size,
            bindful: None,
        }
    }
    pub fn is_mapped(&self) -> bool {
        self.stateless.is_some() || self.bindful.is_some()
    }
}

/// Byte offsets of the implicit argument payloads the runtime patches.
/// Vector fields point at three consecutive u32 words.
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct ImplicitPayload {
    pub simd_size: Option<u32>,
    pub local_work_size: Option<u32>,
    pub local_work_size2: Option<u32>,
    pub enqueued_local_work_size: Option<u32>,
    pub global_work_size: Option<u32>,
    pub num_work_groups: Option<u32>,
    pub global_work_offset: Option<u32>,
    pub printf_surface: PointerPayload,
    pub private_memory_surface: PointerPayload,
    pub global_constants_surface: PointerPayload,
    pub global_variables_surface: PointerPayload,
    pub system_thread_surface: PointerPayload,
    pub sync_buffer: PointerPayload,
}

/// Compiler-reported per-kernel attributes.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KernelAttributes {
    pub cross_thread_data_size: u32,
    pub simd_size: u32,
    /// Register file width in bytes.
    pub grf_size: u32,
    pub num_grf_required: u32,
    pub per_thread_private_memory_size: u32,
    pub slm_inline_size: u32,
    pub required_work_group_size: Option<[u32; 3]>,
    /// 0 if the kernel never reads a local id; otherwise must be 3.
    pub num_local_id_channels: u32,
    pub uses_printf: bool,
    pub uses_barriers: bool,
    pub uses_images: bool,
}

impl Default for KernelAttributes {
    fn default() -> Self {
        Self {
            cross_thread_data_size: 0,
            simd_size: 8,
            grf_size: 32,
            num_grf_required: 128,
            per_thread_private_memory_size: 0,
            slm_inline_size: 0,
            required_work_group_size: None,
            num_local_id_channels: 0,
            uses_printf: false,
            uses_barriers: false,
            uses_images: false,
        }
    }
}

/// Everything the runtime needs to know about one compiled kernel.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KernelDescriptor {
    pub name: String,
    pub explicit_args: Vec<ArgDescriptor>,
    pub payload: ImplicitPayload,
    pub attributes: KernelAttributes,
}

impl KernelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            explicit_args: Vec::new(),
            payload: ImplicitPayload::default(),
            attributes: KernelAttributes::default(),
        }
    }
}

/// One compiled kernel: descriptor plus the raw binary artifacts the
/// compiler emitted for it.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KernelInfo {
    pub descriptor: KernelDescriptor,
    /// Instruction-heap size; `isa` may be empty for late-bound
    /// instructions, but never larger than this.
    pub isa_size: u32,
    pub isa: Vec<u8>,
    /// Initial cross-thread-data values, if the compiler provided any.
    pub cross_thread_data_init: Option<Vec<u8>>,
    pub surface_state_heap: Vec<u8>,
    pub dynamic_state_heap: Vec<u8>,
}

impl KernelInfo {
    pub fn new(descriptor: KernelDescriptor) -> Self {
        Self {
            descriptor,
            isa_size: 0,
            isa: Vec::new(),
            cross_thread_data_init: None,
            surface_state_heap: Vec::new(),
            dynamic_state_heap: Vec::new(),
        }
    }
}

/// Logical segment a linker symbol resolves into.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub enum SegmentKind {
    GlobalConstants,
    GlobalVariables,
    Instructions,
}

/// An exported symbol declared by the program.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SymbolDecl {
    pub name: String,
    pub segment: SegmentKind,
    pub offset: u64,
    pub size: u64,
}

/// Width of a relocation patch.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Debug)]
pub enum RelocationKind {
    /// Full 64-bit address.
    Address,
    /// Low 32 bits.
    AddressLow,
    /// High 32 bits.
    AddressHigh,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Relocation {
    pub symbol: String,
    /// Byte offset into the kernel's instruction segment.
    pub offset: u64,
    pub kind: RelocationKind,
}

/// Instruction-segment relocations for one kernel.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KernelRelocations {
    pub kernel_name: String,
    pub entries: Vec<Relocation>,
}

/// Linker input: exported symbols, per-kernel instruction relocations, and
/// the index of the kernel holding exported function code.
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct LinkerInput {
    pub symbols: Vec<SymbolDecl>,
    pub instruction_relocations: Vec<KernelRelocations>,
    pub exported_functions_kernel: Option<usize>,
}

impl LinkerInput {
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty() && self.instruction_relocations.is_empty()
    }
}

/// A global data segment (constants or variables) with its initializer.
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct GlobalSegmentInfo {
    pub size: u64,
    pub init_data: Vec<u8>,
}

/// Decoded program: the compiler/decoder collaborator's output and the
/// persisted native module format (via bincode).
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct ProgramInfo {
    pub kernels: Vec<KernelInfo>,
    pub global_constants: Option<GlobalSegmentInfo>,
    pub global_variables: Option<GlobalSegmentInfo>,
    pub linker_input: Option<LinkerInput>,
}
