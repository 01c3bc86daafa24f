//! Criterion benchmarks for the sampler.
//!
//! Benchmarks:
//! 1. Bounded sampling over a ~1e9-point space (index walk + decode)
//! 2. Exhaustive enumeration of a small space
//! 3. Template render + identity hash per binding

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;

use alphaforge_core::domain::Settings;
use alphaforge_core::expression::compile;
use alphaforge_core::identity::identity_hash;
use alphaforge_core::sampler::{sample, FieldSpace, SampleOptions};

// ── Helpers ──────────────────────────────────────────────────────────

/// Six fields of 32 values each: 32^6 ≈ 1.07e9 points.
fn large_space() -> FieldSpace<String> {
    let mut space = FieldSpace::new();
    for f in 0..6 {
        space.insert(format!("f{f}"), (0..32).map(|v| format!("v{f}_{v}")).collect());
    }
    space
}

fn small_space() -> FieldSpace<String> {
    FieldSpace::new()
        .with_field("ts_op", vec!["ts_mean".into(), "ts_rank".into(), "ts_std".into()])
        .with_field("data_field", (0..50).map(|i| format!("field_{i}")).collect())
        .with_field("days", vec!["5".into(), "21".into(), "63".into(), "252".into()])
}

// ── Benchmarks ───────────────────────────────────────────────────────

fn bench_bounded_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_billion_space");
    for limit in [100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(limit), &limit, |b, &limit| {
            b.iter(|| {
                let n = sample(large_space(), &SampleOptions::limited(limit).with_seed(7))
                    .unwrap()
                    .count();
                black_box(n)
            })
        });
    }
    group.finish();
}

fn bench_exhaustive(c: &mut Criterion) {
    c.bench_function("sample_exhaustive_600", |b| {
        b.iter(|| {
            let n = sample(small_space(), &SampleOptions::default().with_seed(1))
                .unwrap()
                .count();
            black_box(n)
        })
    });
}

fn bench_render_and_hash(c: &mut Criterion) {
    let template = compile("<ts_op/>(<data_field/>, <days/>)");
    let settings = Settings::default_simulation();
    c.bench_function("render_hash_600", |b| {
        b.iter(|| {
            for binding in sample(small_space(), &SampleOptions::default().with_seed(1)).unwrap() {
                let text: BTreeMap<String, String> = binding;
                let expr = template.render(&text).unwrap();
                black_box(identity_hash(&expr, &settings));
            }
        })
    });
}

criterion_group!(benches, bench_bounded_sampling, bench_exhaustive, bench_render_and_hash);
criterion_main!(benches);
