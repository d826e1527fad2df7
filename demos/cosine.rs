//! Elementwise cosine on the GPU, one invocation per element.
//!
//! Uploads `0..1028` as `f32`, runs a WGSL kernel that writes `cos(x[i])`
//! to `y[i]` and prints the first five results next to the values computed
//! on the CPU. The two lines should agree index for index.

use std::collections::BTreeMap;

use wgpu_dispatch::{
    Access, CompiledKernel, DeviceBuffer, DeviceContext, Dispatcher, KernelJob, KernelSource,
    Slot,
};

const SHADER: &str = r#"
@group(0) @binding(0)
var<storage, read> x: array<f32>;

@group(0) @binding(1)
var<storage, read_write> y: array<f32>;

@compute @workgroup_size(1, 1, 1)
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let gidx = global_id.x;
    y[gidx] = cos(x[gidx]);
}
"#;

fn main() -> wgpu_dispatch::Result<()> {
    // Set RUST_LOG=wgpu_dispatch=debug to see adapter selection and dispatch states.
    env_logger::init();

    let context = DeviceContext::create()?;
    let x: Vec<f32> = (0..1028).map(|x| x as f32).collect();

    let kernel = CompiledKernel::compile(
        &context,
        &KernelSource::elementwise(SHADER, "main").with_label("cosine"),
    )?;
    let x_buffer = DeviceBuffer::allocate_input(&context, &x, Access::ReadOnly)?;
    let y_buffer = DeviceBuffer::allocate_output::<f32>(&context, x.len(), Access::WriteOnly)?;
    let job = KernelJob::<f32>::bind(
        &context,
        &kernel,
        BTreeMap::from([(Slot::new(0, 0), x_buffer), (Slot::new(0, 1), y_buffer)]),
    )?;

    let result = Dispatcher::new(&context).run(&job)?;
    let expected_result: Vec<f32> = (0..5).map(|x| f32::cos(x as _)).collect();

    println!("Result: {:?}", &result[0..5]);
    println!("expected result: {:?}", &expected_result);
    println!("Result length: {:?}", result.len());
    Ok(())
}
