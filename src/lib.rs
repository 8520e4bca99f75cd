#![forbid(unsafe_code)]

/*!
Kernel argument binding and dispatch-geometry engine for compute modules.

A [`Module`](module::Module) decodes a compiled program into a set of
[`KernelImage`](kernel::KernelImage)s (one per compiled kernel), links
cross-kernel symbols, and hands out [`Kernel`](kernel::Kernel) instances.
A kernel instance binds argument values into per-dispatch byte buffers at
the offsets the compiler declared, and computes the thread-group geometry
(per-thread data, SLM layout, execution masks) the dispatch encoder reads.
*/

pub mod result {
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

pub mod descriptor;
pub mod kernel;
pub mod memory;
pub mod module;
pub mod options;
pub mod state;

#[doc(hidden)]
pub mod __private {
    pub use bincode;
}
