//! Element-wise doubling on the GPU versus the CPU.
//!
//! Generates random input of increasing size and times the CPU loop
//! against [`run_elementwise`]. The GPU timing includes compiling the
//! kernel, uploading the data, dispatching and reading the result back, so
//! small inputs favour the CPU. Use this to find the tipping point on your
//! hardware.

use rand::Rng;
use std::time::Instant;
use wgpu_dispatch::{run_elementwise, DeviceContext};

const SHADER: &str = r#"
@group(0) @binding(0)
var<storage, read> input: array<f32>;
@group(0) @binding(1)
var<storage, read_write> out: array<f32>;

@compute @workgroup_size(64)
fn double(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&input)) {
        return;
    }
    out[i] = input[i] * 2.0;
}
"#;

fn main() -> wgpu_dispatch::Result<()> {
    env_logger::init();
    let context = DeviceContext::create()?;
    println!(
        "Element-wise doubling on {} (times include data transfer)",
        context.adapter_info().name
    );

    let per_dim = context.limits().max_compute_workgroups_per_dimension as usize;
    // One x-dimension of 64-wide workgroups bounds the largest single dispatch.
    let sizes = [1_usize, 1_000, 10_000, 100_000, 1_000_000]
        .into_iter()
        .filter(|&n| n <= per_dim * 64);

    let mut rng = rand::thread_rng();
    for n in sizes {
        let input: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0f32..1.0)).collect();

        let mut cpu_data = input.clone();
        let start = Instant::now();
        for x in &mut cpu_data {
            *x *= 2.0;
        }
        let cpu_time = start.elapsed();

        let start = Instant::now();
        let gpu_output = run_elementwise(&context, SHADER, "double", &input)?;
        let gpu_time = start.elapsed();

        let max_error = cpu_data
            .iter()
            .zip(&gpu_output)
            .map(|(c, g)| (c - g).abs())
            .fold(0.0f32, f32::max);
        println!("n = {n:>9}: CPU = {cpu_time:?}, GPU = {gpu_time:?}, max error = {max_error}");
    }
    Ok(())
}
