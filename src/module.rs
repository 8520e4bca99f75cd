/*!
Module container and linker.

A [`Module`] owns the kernel images decoded from one input program, links
global/constant/exported-function symbols across them, and is the lookup
table from kernel name to [`KernelImage`]. Linking resolves every symbol
reference in one pass and aggregates unresolved externals into the build
log rather than failing on the first.
*/

use crate::{
    descriptor::{GlobalSegmentInfo, LinkerInput, ProgramInfo, RelocationKind, SegmentKind},
    kernel::{Kernel, KernelImage},
    memory::{Allocation, AllocationKind, AllocationTracker, MemoryManager},
    options::{DeviceProperties, GroupSizeTuning},
    result::Result,
};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt::Write as _, sync::Arc};

/// Errors.
pub mod error {
    /// No kernel with this name exists in the module.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("kernel {name:?} not found in module")]
    pub struct KernelNotFound {
        pub(super) name: String,
    }

    /// Linking left unresolved external symbols; the build log carries the
    /// full diagnostic.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("module link failed:\n{log}")]
    pub struct LinkFailed {
        pub(super) log: String,
    }

    /// The symbol does not exist or lives in the wrong segment for the
    /// query.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("symbol {name:?} not found in {expected}")]
    pub struct SymbolNotFound {
        pub(super) name: String,
        pub(super) expected: &'static str,
    }

    /// The decoder was handed an input format it does not support.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("unsupported module input format")]
    pub struct UnsupportedInputFormat;
}
use error::*;

/// Module input, routed by format tag.
pub enum ModuleInput<'a> {
    /// Persisted native binary (bincode-encoded [`ProgramInfo`]).
    Native(&'a [u8]),
    /// Intermediate representation, compiled by the decoder collaborator.
    Ir(&'a [u8]),
    /// Already-decoded program, bypassing the decoder.
    Program(ProgramInfo),
}

/// Compiler/decoder seam.
pub trait ProgramDecoder {
    fn decode_native(&self, binary: &[u8]) -> Result<ProgramInfo>;
    fn build_from_ir(&self, ir: &[u8]) -> Result<ProgramInfo>;
}

/// Default decoder: understands the native bincode format only.
pub struct NativeDecoder;

impl ProgramDecoder for NativeDecoder {
    fn decode_native(&self, binary: &[u8]) -> Result<ProgramInfo> {
        Ok(bincode::deserialize(binary)?)
    }
    fn build_from_ir(&self, _ir: &[u8]) -> Result<ProgramInfo> {
        Err(UnsupportedInputFormat.into())
    }
}

/// Immutable per-module state shared with every kernel instance.
pub(crate) struct ModuleContext {
    pub(crate) memory: Arc<dyn MemoryManager>,
    pub(crate) tracker: Arc<AllocationTracker>,
    pub(crate) device: DeviceProperties,
    pub(crate) tuning: GroupSizeTuning,
}

/// Outcome of linking a module.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum LinkStatus {
    LinkedNoPatchNeeded,
    LinkedWithPatchedInstructions,
}

/// A symbol resolved by the linker.
#[derive(Clone, Copy, Debug)]
pub struct RelocatedSymbol {
    pub segment: SegmentKind,
    pub gpu_address: u64,
}

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Module`].
    pub struct ModuleBuilder {
        pub(super) memory: Arc<dyn MemoryManager>,
        pub(super) device: DeviceProperties,
        pub(super) tracker: Option<Arc<AllocationTracker>>,
        pub(super) tuning: GroupSizeTuning,
    }

    impl ModuleBuilder {
        /// Unified-memory tracker shared with the application; defaults to
        /// a fresh empty tracker.
        pub fn tracker(mut self, tracker: Arc<AllocationTracker>) -> Self {
            self.tracker = Some(tracker);
            self
        }
        pub fn tuning(mut self, tuning: GroupSizeTuning) -> Self {
            self.tuning = tuning;
            self
        }
        /// Decodes the input, builds one kernel image per decoded kernel,
        /// and links the module.
        ///
        /// **errors**
        ///
        /// - [`UnsupportedInputFormat`](super::error::UnsupportedInputFormat)
        /// - [`LinkFailed`](super::error::LinkFailed)
        /// - The decoder or an allocation failed.
        pub fn build(self, input: ModuleInput, decoder: &dyn ProgramDecoder) -> Result<Module> {
            Module::initialize(self, input, decoder)
        }
    }
}
use builder::*;

/// A compiled program: kernel images, global segments, and the linker's
/// relocated-symbol table.
pub struct Module {
    context: Arc<ModuleContext>,
    program: ProgramInfo,
    kernels: Vec<Arc<KernelImage>>,
    global_constants: Option<Arc<Allocation>>,
    global_variables: Option<Arc<Allocation>>,
    symbols: HashMap<String, RelocatedSymbol>,
    link_status: LinkStatus,
    build_log: Mutex<String>,
}

impl Module {
    /// A builder for creating a module.
    pub fn builder(memory: Arc<dyn MemoryManager>, device: DeviceProperties) -> ModuleBuilder {
        ModuleBuilder {
            memory,
            device,
            tracker: None,
            tuning: GroupSizeTuning::default(),
        }
    }

    fn initialize(
        builder: ModuleBuilder,
        input: ModuleInput,
        decoder: &dyn ProgramDecoder,
    ) -> Result<Module> {
        let program = match input {
            ModuleInput::Native(binary) => decoder.decode_native(binary)?,
            ModuleInput::Ir(ir) => decoder.build_from_ir(ir)?,
            ModuleInput::Program(program) => program,
        };
        let context = Arc::new(ModuleContext {
            memory: builder.memory,
            tracker: builder.tracker.unwrap_or_else(AllocationTracker::new),
            device: builder.device,
            tuning: builder.tuning,
        });

        let global_constants =
            allocate_global_segment(&context, &program.global_constants, AllocationKind::GlobalConstants)?;
        let global_variables =
            allocate_global_segment(&context, &program.global_variables, AllocationKind::GlobalVariables)?;

        let mut kernels = Vec::with_capacity(program.kernels.len());
        for info in &program.kernels {
            kernels.push(Arc::new(KernelImage::new(
                info,
                &context,
                global_constants.as_ref(),
                global_variables.as_ref(),
            )?));
        }
        tracing::debug!(kernels = kernels.len(), "module decoded");

        let mut module = Module {
            context,
            program,
            kernels,
            global_constants,
            global_variables,
            symbols: HashMap::new(),
            link_status: LinkStatus::LinkedNoPatchNeeded,
            build_log: Mutex::new(String::new()),
        };
        module.link_binary()?;
        Ok(module)
    }

    /// Resolves cross-kernel symbol references and patches instruction
    /// segments that need relocation. Trivially succeeds when the program
    /// declares no linker input.
    fn link_binary(&mut self) -> Result<()> {
        let Some(linker_input) = self.program.linker_input.clone() else {
            return Ok(());
        };
        if linker_input.is_empty() {
            return Ok(());
        }
        let segments = self.linker_segments(&linker_input);

        // Resolve every declared symbol against its segment base.
        let mut symbols = HashMap::new();
        let mut unresolved_decls = Vec::new();
        for decl in &linker_input.symbols {
            match segments.base_of(decl.segment) {
                Some(base) => {
                    symbols.insert(
                        decl.name.clone(),
                        RelocatedSymbol {
                            segment: decl.segment,
                            gpu_address: base + decl.offset,
                        },
                    );
                }
                None => unresolved_decls.push(decl.name.clone()),
            }
        }

        // Patch snapshots first; device allocations are only touched once
        // the whole resolution pass has succeeded.
        let mut snapshots: Vec<(usize, Vec<u8>)> = Vec::new();
        let mut unresolved: Vec<(String, Vec<String>)> = Vec::new();
        for relocations in &linker_input.instruction_relocations {
            let Some(kernel_index) = self
                .kernels
                .iter()
                .position(|image| image.name() == relocations.kernel_name)
            else {
                unresolved.push((
                    relocations.kernel_name.clone(),
                    relocations.entries.iter().map(|r| r.symbol.clone()).collect(),
                ));
                continue;
            };
            let image = &self.kernels[kernel_index];
            let mut snapshot = image
                .isa_allocation()
                .host()
                .map(|host| host.to_vec())
                .unwrap_or_else(|| vec![0; image.isa_allocation().underlying_buffer_size()]);
            let mut missing = Vec::new();
            for relocation in &relocations.entries {
                let Some(symbol) = symbols.get(&relocation.symbol) else {
                    missing.push(relocation.symbol.clone());
                    continue;
                };
                patch_relocation(&mut snapshot, relocation.offset, relocation.kind, symbol.gpu_address);
            }
            if missing.is_empty() {
                snapshots.push((kernel_index, snapshot));
            } else {
                unresolved.push((relocations.kernel_name.clone(), missing));
            }
        }

        if !unresolved.is_empty() || !unresolved_decls.is_empty() {
            let mut log = String::new();
            for name in &unresolved_decls {
                let _ = writeln!(log, "error: symbol {name:?} declared in an absent segment");
            }
            for (kernel, missing) in &unresolved {
                let _ = writeln!(
                    log,
                    "error: unresolved external symbols in kernel {kernel:?}: {}",
                    missing.join(", ")
                );
            }
            tracing::warn!(%log, "module link failed");
            self.build_log.lock().push_str(&log);
            return Err(LinkFailed { log }.into());
        }

        let patched = !snapshots.is_empty();
        for (kernel_index, snapshot) in snapshots {
            let image = &self.kernels[kernel_index];
            self.context
                .memory
                .copy_host_to_allocation(image.isa_allocation(), &snapshot)?;
        }
        self.symbols = symbols;
        self.link_status = if patched {
            LinkStatus::LinkedWithPatchedInstructions
        } else {
            LinkStatus::LinkedNoPatchNeeded
        };
        tracing::debug!(status = ?self.link_status, symbols = self.symbols.len(), "module linked");
        Ok(())
    }

    fn linker_segments(&self, input: &LinkerInput) -> LinkerSegments {
        LinkerSegments {
            constants: self.global_constants.as_ref().map(|a| a.gpu_address()),
            variables: self.global_variables.as_ref().map(|a| a.gpu_address()),
            instructions: input
                .exported_functions_kernel
                .and_then(|index| self.kernels.get(index))
                .map(|image| image.isa_allocation().gpu_address()),
        }
    }

    /// Creates a kernel instance for the named kernel.
    ///
    /// **errors**
    ///
    /// - [`KernelNotFound`](error::KernelNotFound)
    pub fn create_kernel(&self, name: &str) -> Result<Kernel> {
        // Linear scan: module kernel counts are small.
        let image = self
            .kernels
            .iter()
            .find(|image| image.name() == name)
            .ok_or_else(|| KernelNotFound { name: name.into() })?;
        Kernel::new(image.clone(), self.context.clone())
    }

    /// Two-call enumeration: with `names` absent, writes the total kernel
    /// count to `count`; otherwise fills `names` (truncated to the smaller
    /// of `count` and the buffer) and writes back the number filled.
    pub fn get_kernel_names<'a>(&'a self, count: &mut u32, names: Option<&mut [&'a str]>) {
        let total = self.kernels.len() as u32;
        let Some(names) = names else {
            *count = total;
            return;
        };
        let filled = total.min(*count).min(names.len() as u32);
        for (slot, image) in names.iter_mut().zip(&self.kernels).take(filled as usize) {
            *slot = image.name();
        }
        *count = filled;
    }

    /// GPU address of an exported function.
    ///
    /// **errors**
    ///
    /// - [`SymbolNotFound`](error::SymbolNotFound): the symbol is absent or
    ///   does not resolve into the instructions segment.
    pub fn get_function_pointer(&self, name: &str) -> Result<u64> {
        match self.symbols.get(name) {
            Some(symbol) if symbol.segment == SegmentKind::Instructions => Ok(symbol.gpu_address),
            _ => Err(SymbolNotFound {
                name: name.into(),
                expected: "instructions segment",
            }
            .into()),
        }
    }

    /// GPU address of a global variable or constant.
    ///
    /// **errors**
    ///
    /// - [`SymbolNotFound`](error::SymbolNotFound): the symbol is absent or
    ///   resolves into the instructions segment.
    pub fn get_global_pointer(&self, name: &str) -> Result<u64> {
        match self.symbols.get(name) {
            Some(symbol) if symbol.segment != SegmentKind::Instructions => Ok(symbol.gpu_address),
            _ => Err(SymbolNotFound {
                name: name.into(),
                expected: "data segments",
            }
            .into()),
        }
    }

    /// The linker's name to {segment, address} table.
    pub fn relocated_symbols(&self) -> &HashMap<String, RelocatedSymbol> {
        &self.symbols
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link_status
    }

    pub fn kernel_image(&self, name: &str) -> Option<&Arc<KernelImage>> {
        self.kernels.iter().find(|image| image.name() == name)
    }

    pub fn max_group_size(&self) -> u32 {
        self.context.device.max_group_size
    }

    pub fn build_log(&self) -> String {
        self.build_log.lock().clone()
    }

    pub fn global_constants(&self) -> Option<&Arc<Allocation>> {
        self.global_constants.as_ref()
    }

    pub fn global_variables(&self) -> Option<&Arc<Allocation>> {
        self.global_variables.as_ref()
    }

    /// Serializes the decoded program into the persisted native format.
    pub fn native_binary(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.program)?)
    }
}

struct LinkerSegments {
    constants: Option<u64>,
    variables: Option<u64>,
    instructions: Option<u64>,
}

impl LinkerSegments {
    fn base_of(&self, segment: SegmentKind) -> Option<u64> {
        match segment {
            SegmentKind::GlobalConstants => self.constants,
            SegmentKind::GlobalVariables => self.variables,
            SegmentKind::Instructions => self.instructions,
        }
    }
}

fn allocate_global_segment(
    context: &ModuleContext,
    segment: &Option<GlobalSegmentInfo>,
    kind: AllocationKind,
) -> Result<Option<Arc<Allocation>>> {
    let Some(segment) = segment else {
        return Ok(None);
    };
    let size = (segment.size as usize).max(segment.init_data.len());
    if size == 0 {
        return Ok(None);
    }
    let allocation = context.memory.allocate_device_memory(
        context.device.root_device_index,
        size,
        kind,
    )?;
    if !segment.init_data.is_empty() {
        context
            .memory
            .copy_host_to_allocation(&allocation, &segment.init_data)?;
    }
    Ok(Some(allocation))
}

fn patch_relocation(segment: &mut [u8], offset: u64, kind: RelocationKind, address: u64) {
    let offset = offset as usize;
    match kind {
        RelocationKind::Address => {
            segment[offset..offset + 8].copy_from_slice(&address.to_le_bytes());
        }
        RelocationKind::AddressLow => {
            segment[offset..offset + 4].copy_from_slice(&(address as u32).to_le_bytes());
        }
        RelocationKind::AddressHigh => {
            segment[offset..offset + 4].copy_from_slice(&((address >> 32) as u32).to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::{KernelDescriptor, KernelInfo, KernelRelocations, Relocation, SymbolDecl},
        memory::SystemMemoryManager,
    };

    fn kernel_info(name: &str) -> KernelInfo {
        let mut info = KernelInfo::new(KernelDescriptor::new(name));
        info.isa_size = 64;
        info.isa = vec![0x90; 64];
        info
    }

    fn build(program: ProgramInfo) -> Result<Module> {
        Module::builder(SystemMemoryManager::new(), DeviceProperties::default())
            .build(ModuleInput::Program(program), &NativeDecoder)
    }

    #[test]
    fn no_linker_input_links_trivially() -> Result<()> {
        let program = ProgramInfo {
            kernels: vec![kernel_info("a"), kernel_info("b")],
            ..Default::default()
        };
        let module = build(program)?;
        assert_eq!(module.link_status(), LinkStatus::LinkedNoPatchNeeded);
        assert!(module.relocated_symbols().is_empty());
        assert!(module.build_log().is_empty());
        Ok(())
    }

    #[test]
    fn linking_patches_instruction_segments() -> Result<()> {
        let program = ProgramInfo {
            kernels: vec![kernel_info("caller")],
            global_variables: Some(GlobalSegmentInfo {
                size: 64,
                init_data: vec![7; 8],
            }),
            linker_input: Some(LinkerInput {
                symbols: vec![
                    SymbolDecl {
                        name: "gvar".into(),
                        segment: SegmentKind::GlobalVariables,
                        offset: 16,
                        size: 8,
                    },
                    SymbolDecl {
                        name: "helper".into(),
                        segment: SegmentKind::Instructions,
                        offset: 32,
                        size: 16,
                    },
                ],
                instruction_relocations: vec![KernelRelocations {
                    kernel_name: "caller".into(),
                    entries: vec![
                        Relocation {
                            symbol: "gvar".into(),
                            offset: 0,
                            kind: RelocationKind::Address,
                        },
                        Relocation {
                            symbol: "helper".into(),
                            offset: 8,
                            kind: RelocationKind::AddressLow,
                        },
                    ],
                }],
                exported_functions_kernel: Some(0),
            }),
            ..Default::default()
        };
        let module = build(program)?;
        assert_eq!(module.link_status(), LinkStatus::LinkedWithPatchedInstructions);

        let gvar = module.global_variables().unwrap().gpu_address() + 16;
        assert_eq!(module.get_global_pointer("gvar")?, gvar);
        let image = module.kernel_image("caller").unwrap();
        let isa = image.isa_allocation().host().unwrap();
        assert_eq!(u64::from_le_bytes(isa[0..8].try_into().unwrap()), gvar);
        let helper = module.get_function_pointer("helper")?;
        assert_eq!(
            u32::from_le_bytes(isa[8..12].try_into().unwrap()),
            helper as u32
        );

        // Segment checks on the pointer queries.
        assert!(module
            .get_function_pointer("gvar")
            .unwrap_err()
            .downcast_ref::<SymbolNotFound>()
            .is_some());
        assert!(module.get_global_pointer("helper").is_err());
        assert!(module.get_function_pointer("absent").is_err());
        Ok(())
    }

    #[test]
    fn unresolved_externals_are_aggregated() {
        let program = ProgramInfo {
            kernels: vec![kernel_info("caller")],
            linker_input: Some(LinkerInput {
                symbols: Vec::new(),
                instruction_relocations: vec![KernelRelocations {
                    kernel_name: "caller".into(),
                    entries: vec![
                        Relocation {
                            symbol: "missing_a".into(),
                            offset: 0,
                            kind: RelocationKind::Address,
                        },
                        Relocation {
                            symbol: "missing_b".into(),
                            offset: 8,
                            kind: RelocationKind::Address,
                        },
                    ],
                }],
                exported_functions_kernel: None,
            }),
            ..Default::default()
        };
        let err = build(program).err().unwrap();
        let link_failed = err.downcast_ref::<LinkFailed>().unwrap();
        let log = link_failed.to_string();
        assert!(log.contains("caller"));
        assert!(log.contains("missing_a"));
        assert!(log.contains("missing_b"));
    }

    #[test]
    fn kernel_name_enumeration_two_call_idiom() -> Result<()> {
        let program = ProgramInfo {
            kernels: vec![kernel_info("a"), kernel_info("b"), kernel_info("c")],
            ..Default::default()
        };
        let module = build(program)?;
        let mut count = 0;
        module.get_kernel_names(&mut count, None);
        assert_eq!(count, 3);

        let mut names = [""; 3];
        module.get_kernel_names(&mut count, Some(&mut names));
        assert_eq!(names, ["a", "b", "c"]);

        // A smaller caller buffer truncates.
        let mut count = 2;
        let mut names = [""; 2];
        module.get_kernel_names(&mut count, Some(&mut names));
        assert_eq!(count, 2);
        assert_eq!(names, ["a", "b"]);
        Ok(())
    }

    #[test]
    fn unknown_kernel_name_is_rejected() -> Result<()> {
        let module = build(ProgramInfo {
            kernels: vec![kernel_info("a")],
            ..Default::default()
        })?;
        let err = module.create_kernel("nope").err().unwrap();
        assert!(err.downcast_ref::<KernelNotFound>().is_some());
        Ok(())
    }

    #[test]
    fn native_binary_round_trips() -> Result<()> {
        let module = build(ProgramInfo {
            kernels: vec![kernel_info("a"), kernel_info("b")],
            ..Default::default()
        })?;
        let binary = module.native_binary()?;
        let reloaded = Module::builder(SystemMemoryManager::new(), DeviceProperties::default())
            .build(ModuleInput::Native(&binary), &NativeDecoder)?;
        let mut count = 0;
        reloaded.get_kernel_names(&mut count, None);
        assert_eq!(count, 2);
        assert!(reloaded.kernel_image("b").is_some());
        Ok(())
    }
}
