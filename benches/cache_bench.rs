//! Benchmarks for blobcache
//!
//! Run with: cargo bench

use blobcache::transform::{Chain, ProviderRegistry, StageList};
use blobcache::{open_cache, CacheOptions, ChainSpec};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    site: String,
    values: Vec<f64>,
    unit: String,
}

fn create_readings(count: usize) -> Vec<Reading> {
    (0..count)
        .map(|i| Reading {
            sensor: format!("sensor-{:04}", i % 250),
            site: "north-plant".to_string(),
            values: (0..8).map(|j| (i * 8 + j) as f64 * 0.5).collect(),
            unit: "celsius".to_string(),
        })
        .collect()
}

fn bench_chains(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    let registry = ProviderRegistry::installed();
    let reading = &create_readings(1)[0];

    for compressor in ["none", "deflate", "lz4", "zstd"] {
        if !registry.is_available(compressor) {
            continue;
        }
        let stages = StageList::new(["json", compressor]);
        let chain = Chain::from_stages(&stages, &registry, None).unwrap();

        group.bench_function(format!("forward_{}", compressor), |b| {
            b.iter(|| chain.forward(black_box(reading)).unwrap())
        });

        let stored = chain.forward(reading).unwrap();
        group.bench_function(format!("backward_{}", compressor), |b| {
            b.iter(|| chain.backward::<Reading>(black_box(&stored)).unwrap())
        });
    }

    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");

    for file in ["bench.sqlite", "bench.sled"] {
        let dir = tempdir().unwrap();
        let options = CacheOptions::new(dir.path().join(file)).commit_interval(0);
        let mut cache = open_cache::<Reading>(&options).unwrap();
        let readings = create_readings(1000);

        group.throughput(Throughput::Elements(readings.len() as u64));
        group.bench_function(format!("populate_1000_{}", file), |b| {
            b.iter(|| {
                cache
                    .populate(readings.iter().cloned().enumerate().map(|(i, r)| (i as i64, r)))
                    .unwrap();
                cache.commit().unwrap();
            })
        });

        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("get_{}", file), |b| {
            let mut i = 0i64;
            b.iter(|| {
                i = (i + 1) % 1000;
                cache.get(black_box(i)).unwrap()
            })
        });
    }

    group.finish();
}

fn bench_optimize(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize");
    group.sample_size(10);

    let readings = create_readings(5000);
    group.throughput(Throughput::Elements(readings.len() as u64));
    group.bench_function("optimize_compression_5000", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let options = CacheOptions::new(dir.path().join("optimize.sqlite"))
                    .chain(ChainSpec::explicit("json", "zstd"))
                    .commit_interval(0);
                let mut cache = open_cache::<Reading>(&options).unwrap();
                cache
                    .populate(readings.iter().cloned().enumerate().map(|(i, r)| (i as i64, r)))
                    .unwrap();
                cache.commit().unwrap();
                (dir, cache)
            },
            |(_dir, mut cache)| cache.optimize_compression(None).unwrap(),
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_chains, bench_cache, bench_optimize);
criterion_main!(benches);
