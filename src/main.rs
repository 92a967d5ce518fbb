//! Headless demo: a producer thread ticks a few emitters while the main
//! thread executes the batches on the GPU.
//!
//! ```text
//! RUST_LOG=info cargo run -- [config.toml] [frames]
//! ```

use std::thread;

use log::{error, info, warn};
use tilesim::prelude::*;
use tilesim::{FrameReceiver, GlobalFieldResponse};

const DT: f32 = 1.0 / 60.0;

fn demo_emitters() -> Vec<EmitterConfig> {
    vec![
        EmitterConfig {
            spawn_rate: 4000.0,
            lifetime: FloatRange::new(1.5, 2.5),
            size_x: FloatRange::new(0.02, 0.05),
            drag: FloatRange::constant(0.3),
            shape: SpawnShape::Cone {
                direction: Vec3::Y,
                half_angle: 0.35,
                speed: 6.0,
            },
            acceleration: Vec3::new(0.0, -9.8, 0.0),
            sorted: true,
            ..Default::default()
        },
        EmitterConfig {
            bursts: vec![Burst::new(0.0, 2000), Burst::new(0.5, 500)],
            loops: 3,
            lifetime: FloatRange::new(0.5, 1.0),
            shape: SpawnShape::Sphere { radius: 0.2, speed: 3.0 },
            collision: true,
            orbit: Orbit {
                offset_base: Vec3::new(0.5, 0.5, 0.0),
                frequency_base: Vec3::splat(0.5),
                ..Default::default()
            },
            ..Default::default()
        },
        EmitterConfig {
            spawn_rate: 1000.0,
            lifetime: FloatRange::constant(3.0),
            shape: SpawnShape::Box { half_extents: Vec3::splat(2.0) },
            point_attractor: Some(PointAttractor {
                position: Vec3::ZERO,
                radius: 3.0,
                strength: 4.0,
            }),
            global_fields: GlobalFieldResponse { scale: 1.0, tightness: 0.5 },
            ..Default::default()
        },
    ]
}

fn swirl_field() -> VectorFieldResource {
    VectorFieldResource::from_fn(tilesim::VectorFieldId(1), UVec3::splat(8), 2.0, |uvw| {
        let p = uvw - Vec3::splat(0.5);
        Vec3::new(-p.z, 0.2, p.x)
    })
}

fn load_config(path: Option<&str>) -> SimulationConfig {
    match path {
        Some(path) => match SimulationConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                warn!("Could not load {}: {}; using defaults", path, err);
                SimulationConfig::default()
            }
        },
        None => SimulationConfig::default(),
    }
}

fn consume(frames: FrameReceiver, mut gpu: Option<ParticleSimulationGpu>) {
    let mut last_tiles = Vec::new();
    while let Some(batch) = frames.next_blocking() {
        if let Some(gpu) = gpu.as_mut() {
            let stats = gpu.execute_frame(&batch, None);
            if batch.frame % 60 == 0 {
                info!("Frame {}: {:?}", batch.frame, stats);
            }
        } else if batch.frame % 60 == 0 {
            info!(
                "Frame {}: {} commands, {} tiles, {} spawns (no GPU)",
                batch.frame,
                batch.commands.len(),
                batch.tile_count(),
                batch.spawn_count()
            );
        }
        if let Some(command) = batch.commands.first() {
            last_tiles.clone_from(&command.tiles);
        }
    }

    if let Some(gpu) = gpu.as_ref() {
        match gpu.compute_bounds(&last_tiles) {
            Ok(bounds) => info!("Final bounds of first emitter: {:?}", bounds),
            Err(err) => error!("Bounds query failed: {}", err),
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let config = load_config(args.get(1).map(String::as_str));
    let frame_count: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(300);

    let (mut world, frames) = match ParticleWorld::new(config) {
        Ok(created) => created,
        Err(err) => {
            error!("Invalid simulation config: {}", err);
            std::process::exit(1);
        }
    };

    let field = swirl_field();
    let gpu = match GpuContext::headless().and_then(|context| ParticleSimulationGpu::new(&context, *world.layout())) {
        Ok(mut gpu) => {
            gpu.upload_vector_field(&field);
            Some(gpu)
        }
        Err(err) => {
            warn!("{}; running the producer only", err);
            None
        }
    };

    let field_instance = VectorFieldInstance::new(
        std::sync::Arc::new(field),
        Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(4.0)),
        Quat::IDENTITY,
    );
    world.vector_fields_mut().register(field_instance);
    for config in demo_emitters() {
        world.add_emitter(config);
    }

    let producer = thread::spawn(move || {
        for frame in 0..frame_count {
            world.begin_frame();
            world.set_sort_origin(Some(Vec3::new(0.0, 2.0, 10.0)));
            let report = world.tick(DT);
            if report.dropped() > 0 {
                warn!("Frame {}: {} spawns dropped", frame, report.dropped());
            }
            if let Err(err) = world.submit() {
                error!("{}", err);
                break;
            }
            let removed = world.remove_completed_emitters();
            if !removed.is_empty() {
                info!("Removed completed emitters {:?}", removed);
            }
        }
        info!(
            "Producer done: {} of {} tiles in use",
            world.allocator().allocated_count(),
            world.allocator().capacity()
        );
    });

    consume(frames, gpu);
    if producer.join().is_err() {
        error!("Producer thread panicked");
    }
}
