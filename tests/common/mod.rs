//! Shared kernels and setup for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use wgpu_dispatch::{
    Access, CompiledKernel, DeviceBuffer, DeviceContext, Element, KernelJob, KernelSource,
    Result, Slot,
};

/// Elementwise cosine, one invocation per element.
pub const COS_SHADER: &str = r#"
@group(0) @binding(0)
var<storage, read> x: array<f32>;

@group(0) @binding(1)
var<storage, read_write> y: array<f32>;

@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    y[i] = cos(x[i]);
}
"#;

/// Copies input to output unchanged, 64 invocations per workgroup.
pub const COPY_SHADER: &str = r#"
@group(0) @binding(0)
var<storage, read> src: array<u32>;

@group(0) @binding(1)
var<storage, read_write> dst: array<u32>;

@compute @workgroup_size(64)
fn copy(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&src)) {
        return;
    }
    dst[i] = src[i];
}
"#;

/// Same layout as [`COS_SHADER`] but the data lives in a struct member.
pub const WRAPPED_DOUBLE_SHADER: &str = r#"
struct Array {
    data: array<f32>,
}

@group(0) @binding(0)
var<storage, read> x: Array;

@group(0) @binding(1)
var<storage, read_write> y: Array;

@compute @workgroup_size(8)
fn double(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&x.data)) {
        return;
    }
    y.data[i] = x.data[i] * 2.0;
}
"#;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn context() -> DeviceContext {
    init_logging();
    DeviceContext::create().expect("GPU context should initialize")
}

/// Compile an elementwise kernel and bind `input` plus a fresh output to it.
pub fn elementwise_job<T: Element>(
    context: &DeviceContext,
    shader: &str,
    entry_point: &str,
    input: &[T],
) -> Result<KernelJob<T>> {
    let kernel = CompiledKernel::compile(
        context,
        &KernelSource::elementwise(shader, entry_point).with_label(entry_point),
    )?;
    let x = DeviceBuffer::allocate_input(context, input, Access::ReadOnly)?;
    let y = DeviceBuffer::allocate_output::<T>(context, input.len(), Access::WriteOnly)?;
    KernelJob::bind(
        context,
        &kernel,
        BTreeMap::from([(Slot::new(0, 0), x), (Slot::new(0, 1), y)]),
    )
}
