//! Interpreter throughput: long sequential chains and fan-out

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use effex::{AllOptions, Effect, Runtime, RuntimeConfig};

fn chain(n: u64) -> Effect<u64, String> {
    let mut program: Effect<u64, String> = Effect::succeed(0);
    for _ in 0..n {
        program = program.flat_map(|v| Effect::succeed(v + 1));
    }
    program
}

fn bench_flat_map_chain(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig::default().num_workers(1)).expect("runtime");
    let mut group = c.benchmark_group("flat_map_chain");
    for n in [100u64, 10_000] {
        let program = chain(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &program, |b, program| {
            b.iter(|| black_box(rt.run_blocking(program.clone()).expect("run")))
        });
    }
    group.finish();
}

fn bench_all_fan_out(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig::default().num_workers(4)).expect("runtime");
    let mut group = c.benchmark_group("all_fan_out");
    for (n, options) in [(1_000u64, AllOptions::default()), (1_000, AllOptions::bounded(16))] {
        let program = Effect::all_with((0..n).map(|i| Effect::<u64, String>::sync(move || i * 2)), options);
        let label = match options.concurrency {
            effex::Concurrency::Unbounded => "unbounded".to_string(),
            effex::Concurrency::Bounded(k) => format!("bounded_{}", k),
        };
        group.bench_with_input(BenchmarkId::new(label, n), &program, |b, program| {
            b.iter(|| black_box(rt.run_blocking(program.clone()).expect("run")))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_flat_map_chain, bench_all_fan_out);
criterion_main!(benches);
