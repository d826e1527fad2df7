//! Criterion benchmarks comparing GPU and CPU elementwise cosine.
//!
//! Run with `cargo bench`. The kernel is compiled and the buffers bound
//! once, so the GPU numbers measure submission, execution and readback,
//! which is the cost a reused job pays per run.

use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::Rng;

use wgpu_dispatch::{
    Access, CompiledKernel, DeviceBuffer, DeviceContext, Dispatcher, KernelJob, KernelSource,
    Slot,
};

const SHADER: &str = r#"
@group(0) @binding(0)
var<storage, read> x: array<f32>;
@group(0) @binding(1)
var<storage, read_write> y: array<f32>;

@compute @workgroup_size(64)
fn cosine(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&x)) {
        return;
    }
    y[i] = cos(x[i]);
}
"#;

fn cosine_benchmark(c: &mut Criterion) {
    let context = DeviceContext::create().expect("failed to initialise GPU context");
    // Stays under the downlevel 128 MiB storage binding limit.
    let n: usize = 1_000_000;
    let mut rng = rand::thread_rng();
    let input: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0f32..10.0)).collect();

    let kernel = CompiledKernel::compile(&context, &KernelSource::elementwise(SHADER, "cosine"))
        .expect("kernel should compile");
    let x = DeviceBuffer::allocate_input(&context, &input, Access::ReadOnly).unwrap();
    let y = DeviceBuffer::allocate_output::<f32>(&context, n, Access::WriteOnly).unwrap();
    let job = KernelJob::<f32>::bind(
        &context,
        &kernel,
        BTreeMap::from([(Slot::new(0, 0), x), (Slot::new(0, 1), y)]),
    )
    .unwrap();
    let mut dispatcher = Dispatcher::new(&context);

    c.bench_function("gpu cosine", |bencher| {
        bencher.iter(|| dispatcher.run(&job).unwrap());
    });
    c.bench_function("cpu cosine", |bencher| {
        bencher.iter(|| input.iter().map(|x| x.cos()).collect::<Vec<f32>>());
    });
}

criterion_group!(benches, cosine_benchmark);
criterion_main!(benches);
