//! Benchmarks for shader generation and host-side packing.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::{Quat, Vec3};
use std::sync::Arc;

use tilesim::gpu::{clear_shader, inject_shader, key_shader, simulation_shader, split_batches};
use tilesim::{
    combine_vector_fields, Aabb, AtlasConfig, AtlasLayout, GlobalFieldResponse, VectorFieldId, VectorFieldInstance,
    VectorFieldRegistry, VectorFieldResource,
};

fn bench_shader_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("shader_generation");

    for tile_size in [4, 8, 16] {
        let layout = AtlasLayout::new(AtlasConfig::new(1024, 1024, tile_size)).unwrap();
        group.bench_with_input(BenchmarkId::new("simulation", tile_size), &layout, |b, layout| {
            b.iter(|| black_box(simulation_shader(layout, false)))
        });
        group.bench_with_input(BenchmarkId::new("collision", tile_size), &layout, |b, layout| {
            b.iter(|| black_box(simulation_shader(layout, true)))
        });
    }

    let layout = AtlasLayout::new(AtlasConfig::default()).unwrap();
    group.bench_function("clear", |b| b.iter(|| black_box(clear_shader(&layout))));
    group.bench_function("inject", |b| b.iter(|| black_box(inject_shader())));
    group.bench_function("sort_keys", |b| b.iter(|| black_box(key_shader(&layout))));

    group.finish();
}

fn bench_combine_vector_fields(c: &mut Criterion) {
    let mut group = c.benchmark_group("combine_vector_fields");
    let emitter_bounds = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(2.0));

    for count in [4, 32, 256] {
        let mut registry = VectorFieldRegistry::new();
        for i in 0..count {
            let resource = Arc::new(VectorFieldResource::uniform(VectorFieldId(i), Vec3::Y));
            let center = Vec3::new(i as f32 * 1.5 - count as f32 * 0.75, 0.0, 0.0);
            registry.register(VectorFieldInstance::new(
                resource,
                Aabb::from_center_half_extents(center, Vec3::ONE),
                Quat::IDENTITY,
            ));
        }
        group.bench_with_input(BenchmarkId::new("world_fields", count), &registry, |b, registry| {
            b.iter(|| {
                black_box(combine_vector_fields(
                    None,
                    registry,
                    &emitter_bounds,
                    GlobalFieldResponse::default(),
                ))
            })
        });
    }

    group.finish();
}

fn bench_split_batches(c: &mut Criterion) {
    c.bench_function("split_batches_1m", |b| {
        b.iter(|| black_box(split_batches(black_box(1_000_000), 16384, 1 << 20)))
    });
}

criterion_group!(
    benches,
    bench_shader_generation,
    bench_combine_vector_fields,
    bench_split_batches,
);
criterion_main!(benches);
