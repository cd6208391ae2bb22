//! Distance kernel benchmarks: scalar baselines vs the dispatched table.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quiver_ann::distance::{kernels, scalar};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_vec(dim: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn bench_fp32(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let mut group = c.benchmark_group("fp32");

    for dim in [64, 128, 768] {
        let a = random_vec(dim, &mut rng);
        let b = random_vec(dim, &mut rng);
        let table = kernels();

        group.bench_with_input(BenchmarkId::new("l2sq_scalar", dim), &dim, |bench, _| {
            bench.iter(|| scalar::fp32_l2sq(black_box(&a), black_box(&b)))
        });
        group.bench_with_input(BenchmarkId::new("l2sq_dispatched", dim), &dim, |bench, _| {
            bench.iter(|| (table.fp32_l2sq)(black_box(&a), black_box(&b)))
        });
        group.bench_with_input(BenchmarkId::new("ip_dispatched", dim), &dim, |bench, _| {
            bench.iter(|| (table.fp32_ip)(black_box(&a), black_box(&b)))
        });
    }
    group.finish();
}

fn bench_sq8(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2);
    let mut group = c.benchmark_group("sq8");

    for dim in [128, 768] {
        let query = random_vec(dim, &mut rng);
        let codes: Vec<u8> = (0..dim).map(|_| rng.gen()).collect();
        let lower: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..0.0)).collect();
        let diff: Vec<f32> = (0..dim).map(|_| rng.gen_range(0.5..2.0)).collect();
        let table = kernels();

        group.bench_with_input(BenchmarkId::new("ip_scalar", dim), &dim, |bench, _| {
            bench.iter(|| {
                scalar::sq8_ip(
                    black_box(&query),
                    black_box(&codes),
                    black_box(&lower),
                    black_box(&diff),
                )
            })
        });
        group.bench_with_input(BenchmarkId::new("ip_dispatched", dim), &dim, |bench, _| {
            bench.iter(|| {
                (table.sq8_ip)(
                    black_box(&query),
                    black_box(&codes),
                    black_box(&lower),
                    black_box(&diff),
                )
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fp32, bench_sq8);
criterion_main!(benches);
