//! Solver throughput at a few contention shapes.
//!
//! Run with: `cargo bench --bench lmm_solve`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use simgrid_core::lmm::{SharingPolicy, System};

fn star_topology(n_vars: usize) -> System {
    let mut sys = System::new(1e-9, simgrid_core::logger::discard());
    let k = sys.add_constraint(1.0, SharingPolicy::Shared);
    for _ in 0..n_vars {
        let v = sys.add_variable(1.0, f64::INFINITY);
        sys.set_coefficient(v, k, 1.0);
    }
    sys
}

fn chain_topology(n_links: usize) -> System {
    let mut sys = System::new(1e-9, simgrid_core::logger::discard());
    let constraints: Vec<_> = (0..n_links).map(|_| sys.add_constraint(1.0, SharingPolicy::Shared)).collect();
    for w in constraints.windows(2) {
        let v = sys.add_variable(1.0, f64::INFINITY);
        sys.set_coefficient(v, w[0], 1.0);
        sys.set_coefficient(v, w[1], 1.0);
    }
    sys
}

fn bench_star(c: &mut Criterion) {
    let mut group = c.benchmark_group("lmm_star");
    for &n in &[8usize, 64, 512] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(|| star_topology(n), |mut sys| sys.solve(), criterion::BatchSize::SmallInput)
        });
    }
    group.finish();
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("lmm_chain");
    for &n in &[8usize, 64, 512] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(|| chain_topology(n), |mut sys| sys.solve(), criterion::BatchSize::SmallInput)
        });
    }
    group.finish();
}

criterion_group!(benches, bench_star, bench_chain);
criterion_main!(benches);
