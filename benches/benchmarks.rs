//! Criterion benchmarks for the fused dispatch path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use microjax::{Array, DType};

fn bench_fused_elementwise(c: &mut Criterion) {
    let x = Array::arange(0.0, Some(4096.0), 1.0, DType::Float32);
    c.bench_function("fused_elementwise_4096", |b| {
        b.iter(|| {
            let y = x.add(&x).mul(&x.sub_scalar(1.0)).sqrt();
            black_box(y.to_vec())
        })
    });
}

fn bench_matmul(c: &mut Criterion) {
    let a = Array::ones(&[64, 64], DType::Float32);
    c.bench_function("matmul_64", |b| {
        b.iter(|| black_box(a.matmul(&a).to_vec()))
    });
}

fn bench_reduction(c: &mut Criterion) {
    let x = Array::arange(0.0, Some(65536.0), 1.0, DType::Float32);
    c.bench_function("sum_65536", |b| {
        b.iter(|| black_box(x.sum(None, false).to_vec()))
    });
}

fn bench_grad(c: &mut Criterion) {
    let x = Array::arange(1.0, Some(257.0), 1.0, DType::Float32);
    c.bench_function("grad_reciprocal_sum_256", |b| {
        let df = microjax::grad(|x: &Array| x.reciprocal().sum(None, false));
        b.iter(|| black_box(df(&x).to_vec()))
    });
}

criterion_group!(benches, bench_fused_elementwise, bench_matmul, bench_reduction, bench_grad);
criterion_main!(benches);
