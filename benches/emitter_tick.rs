//! Benchmarks for the producer side: emitter ticks and command building.
//!
//! Run with: `cargo bench --bench emitter_tick`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::Vec3;

use tilesim::{EmitterConfig, FloatRange, ParticleWorld, SimulationConfig, SpawnShape};

fn fountain(rate: f32) -> EmitterConfig {
    EmitterConfig {
        spawn_rate: rate,
        lifetime: FloatRange::new(1.0, 2.0),
        shape: SpawnShape::Cone {
            direction: Vec3::Y,
            half_angle: 0.4,
            speed: 5.0,
        },
        acceleration: Vec3::new(0.0, -9.8, 0.0),
        ..Default::default()
    }
}

fn bench_world_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_tick");

    for rate in [1_000.0, 60_000.0, 600_000.0] {
        group.bench_with_input(BenchmarkId::new("spawn_rate", rate as u32), &rate, |b, &rate| {
            let (mut world, frames) = ParticleWorld::new(SimulationConfig::default()).unwrap();
            world.add_emitter(fountain(rate));
            b.iter(|| {
                world.begin_frame();
                black_box(world.tick(1.0 / 60.0));
                world.submit().unwrap();
                black_box(frames.drain());
            })
        });
    }

    group.finish();
}

fn bench_many_emitters(c: &mut Criterion) {
    let mut group = c.benchmark_group("many_emitters");

    for count in [1, 16, 128] {
        group.bench_with_input(BenchmarkId::new("emitters", count), &count, |b, &count| {
            let (mut world, frames) = ParticleWorld::new(SimulationConfig::default()).unwrap();
            for _ in 0..count {
                world.add_emitter(fountain(500.0));
            }
            b.iter(|| {
                world.begin_frame();
                black_box(world.tick(1.0 / 60.0));
                world.submit().unwrap();
                black_box(frames.drain());
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_world_tick, bench_many_emitters);
criterion_main!(benches);
