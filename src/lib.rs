//! # tilesim - tile-based GPU particle simulation
//!
//! Particle state lives in GPU textures (the *atlas*) that are carved into
//! square tiles. Each emitter owns a set of tiles; every frame the owned
//! tiles are simulated from the previous copy of the state into the current
//! copy, freshly allocated tiles are cleared, and new particles are injected.
//! Particle data never comes back to the host except through the explicit,
//! blocking bounds query.
//!
//! The crate is split along the producer/consumer line:
//!
//! - **Producer** ([`ParticleWorld`]): ticks [`EmitterInstance`]s, decides how
//!   many particles to spawn, reserves tile slots from the [`TileAllocator`]
//!   and packs the resulting GPU work into a [`FrameBatch`].
//! - **Consumer** ([`ParticleSimulationGpu`]): receives batches over a bounded
//!   channel and records the compute passes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tilesim::prelude::*;
//!
//! let (mut world, frames) = ParticleWorld::new(SimulationConfig::default())?;
//! world.add_emitter(EmitterConfig {
//!     spawn_rate: 2000.0,
//!     lifetime: FloatRange::new(1.0, 2.0),
//!     acceleration: Vec3::new(0.0, -9.8, 0.0),
//!     ..Default::default()
//! });
//!
//! let context = GpuContext::headless()?;
//! let mut gpu = ParticleSimulationGpu::new(&context, *world.layout())?;
//!
//! world.begin_frame();
//! world.tick(1.0 / 60.0);
//! world.submit()?;
//! if let Some(batch) = frames.try_next() {
//!     let stats = gpu.execute_frame(&batch, None);
//!     log::info!("{:?}", stats);
//! }
//! ```
//!
//! ## Atlas layout
//!
//! | Texture | xyz | w |
//! |---------|-----|---|
//! | position (A/B) | world position | relative time, dead at >= 1 |
//! | velocity (A/B) | velocity | time scale (1 / lifetime) |
//! | render attributes | size.xy, rotation | rotation rate |
//! | simulation attributes | drag, vector field scale, resilience | orbit random |

pub mod allocator;
pub mod atlas;
pub mod bounds;
pub mod config;
pub mod emitter;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod spawn;
pub mod state;
pub mod uniforms;
pub mod vector_field;
pub mod world;

pub use allocator::TileAllocator;
pub use atlas::{AtlasLayout, BYTES_PER_PARTICLE};
pub use bounds::Aabb;
pub use config::{AtlasConfig, SimulationConfig};
pub use emitter::{Burst, EmitterConfig, EmitterInstance, EmitterState};
pub use error::{ConfigError, GpuError, HandoffError};
pub use frame::{frame_channel, EmitterCommand, EmitterId, FrameBatch, FrameReceiver, FrameSender, SimulationPhase};
pub use gpu::{CollisionView, FrameStats, GpuContext, ParticleSimulationGpu};
pub use spawn::{FloatRange, Orbit, SpawnRecord, SpawnReport, SpawnShape, Vec3Range};
pub use state::{BufferParity, ParticleStateStore};
pub use uniforms::{CollisionResponse, PointAttractor, MAX_VECTOR_FIELDS};
pub use vector_field::{
    combine_vector_fields, CombinedVectorFields, GlobalFieldResponse, VectorFieldId, VectorFieldInstance,
    VectorFieldRegistry, VectorFieldResource,
};
pub use world::ParticleWorld;

pub use bytemuck;
pub use glam::{Mat4, Quat, UVec3, Vec3};

/// Common imports for embedding the simulation.
pub mod prelude {
    pub use crate::{
        Aabb, AtlasConfig, Burst, CollisionResponse, CollisionView, EmitterConfig, EmitterId, FloatRange,
        FrameStats, GpuContext, Orbit, ParticleSimulationGpu, ParticleWorld, PointAttractor, SimulationConfig,
        SpawnShape, Vec3Range, VectorFieldInstance, VectorFieldResource,
    };
    pub use glam::{Quat, UVec3, Vec3};
}
