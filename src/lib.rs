//! Single-kernel compute dispatch on the GPU using
//! [wgpu](https://github.com/gfx-rs/wgpu).
//!
//! The crate takes a host sequence of numbers, runs an elementwise WGSL
//! kernel over it and returns the output sequence. The pieces are kept
//! separate so that a kernel compiled once can be dispatched many times:
//!
//! 1. [`DeviceContext`] connects to the first usable accelerator.
//! 2. [`CompiledKernel`] checks a [`KernelSource`] offline with `naga` and
//!    builds its compute pipeline.
//! 3. [`DeviceBuffer`]s hold inputs and outputs; [`KernelJob`] binds them to
//!    the kernel's slots after checking access modes and element types.
//! 4. [`Dispatcher`] submits the job, waits for the device and reads the
//!    output back, always unmapping the staging buffer it used.
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use wgpu_dispatch::{
//!     Access, CompiledKernel, DeviceBuffer, DeviceContext, Dispatcher, KernelJob,
//!     KernelSource, Slot,
//! };
//!
//! # fn main() -> wgpu_dispatch::Result<()> {
//! let context = DeviceContext::create()?;
//! let source = KernelSource::elementwise(
//!     r#"
//! @group(0) @binding(0) var<storage, read> x: array<f32>;
//! @group(0) @binding(1) var<storage, read_write> y: array<f32>;
//! @compute @workgroup_size(64)
//! fn main(@builtin(global_invocation_id) id: vec3<u32>) {
//!     if (id.x < arrayLength(&x)) { y[id.x] = cos(x[id.x]); }
//! }
//! "#,
//!     "main",
//! );
//! let kernel = CompiledKernel::compile(&context, &source)?;
//! let input = [0.0f32, 1.0, 2.0, 3.0, 4.0];
//! let x = DeviceBuffer::allocate_input(&context, &input, Access::ReadOnly)?;
//! let y = DeviceBuffer::allocate_output::<f32>(&context, input.len(), Access::WriteOnly)?;
//! let job = KernelJob::<f32>::bind(
//!     &context,
//!     &kernel,
//!     BTreeMap::from([(Slot::new(0, 0), x), (Slot::new(0, 1), y)]),
//! )?;
//! let output = Dispatcher::new(&context).run(&job)?;
//! assert_eq!(output.len(), input.len());
//! # Ok(())
//! # }
//! ```
//!
//! The library logs through the [`log`] facade and never installs a logger.

pub mod buffer;
pub mod compute;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod kernel;
mod readback;

// Re-export the most common types at the crate root so that users can
// simply `use wgpu_dispatch::*;`.
pub use buffer::{Access, BufferInfo, DeviceBuffer, Element, ElementType};
pub use compute::{run_elementwise, DispatchState, Dispatcher};
pub use config::{ContextOptions, LimitsPreset};
pub use context::DeviceContext;
pub use error::{ComputeError, Diagnostic, Diagnostics, ErrorKind, Result};
pub use job::{check_bindings, Extents, KernelJob};
pub use kernel::{CompiledKernel, KernelLayout, KernelSource, Role, Slot, SlotLayout};
