//! Spawn records and the helpers that build them.
//!
//! A [`SpawnRecord`] is the transient description of one newly created
//! particle: its initial state plus the atlas texel it will be injected into.
//! Records are built by the emitter on the producer side, batched per frame
//! and destroyed once the injection pass has written them.
//!
//! Particles spawned during a tick are spread over the tick: each one gets an
//! age in `[0, dt)` and is pre-advanced by that age under constant
//! acceleration, so a high spawn rate produces a continuous stream instead of
//! clumps at each frame boundary.

use bytemuck::{Pod, Zeroable};
use glam::{UVec2, Vec2, Vec3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f32::consts::{PI, TAU};

/// Inclusive range of scalar values sampled uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FloatRange {
    pub min: f32,
    pub max: f32,
}

impl FloatRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// A range that always yields `value`.
    pub fn constant(value: f32) -> Self {
        Self { min: value, max: value }
    }

    /// Value at `t` in `[0, 1]`.
    #[inline]
    pub fn lerp(&self, t: f32) -> f32 {
        self.min + (self.max - self.min) * t
    }

    pub fn sample(&self, rng: &mut SpawnRandom) -> f32 {
        self.lerp(rng.random())
    }
}

/// Per-axis range of vector values.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vec3Range {
    pub min: Vec3,
    pub max: Vec3,
}

impl Vec3Range {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn constant(value: Vec3) -> Self {
        Self { min: value, max: value }
    }

    pub fn sample(&self, rng: &mut SpawnRandom) -> Vec3 {
        let t = Vec3::new(rng.random(), rng.random(), rng.random());
        self.min + (self.max - self.min) * t
    }
}

/// Seeded random source for spawn decisions.
///
/// Every emitter owns one, seeded from its configuration, so a given emitter
/// config and tick sequence always produces the same particles.
pub struct SpawnRandom {
    rng: SmallRng,
}

impl SpawnRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Random f32 in `[0, 1)`.
    #[inline]
    pub fn random(&mut self) -> f32 {
        self.rng.gen()
    }

    /// Random integer in `[low, high]`.
    pub fn random_count(&mut self, low: u32, high: u32) -> u32 {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..=high)
    }

    /// Random point inside a sphere, uniform over the volume.
    pub fn random_in_sphere(&mut self, radius: f32) -> Vec3 {
        // Cube root for uniform volume distribution
        let r = radius * self.random().cbrt();
        self.random_direction() * r
    }

    /// Random unit vector, uniform over the sphere.
    pub fn random_direction(&mut self) -> Vec3 {
        let z = self.random() * 2.0 - 1.0;
        let theta = self.random() * TAU;
        let r = (1.0 - z * z).max(0.0).sqrt();
        Vec3::new(r * theta.cos(), r * theta.sin(), z)
    }

    /// Random point inside an axis-aligned box centered at the origin.
    pub fn random_in_box(&mut self, half_extents: Vec3) -> Vec3 {
        let t = Vec3::new(self.random(), self.random(), self.random());
        (t * 2.0 - Vec3::ONE) * half_extents
    }

    /// Random unit vector within `half_angle` radians of `axis`.
    pub fn random_in_cone(&mut self, axis: Vec3, half_angle: f32) -> Vec3 {
        let axis = axis.try_normalize().unwrap_or(Vec3::Z);
        let cos_max = half_angle.clamp(0.0, PI).cos();
        let z = 1.0 - self.random() * (1.0 - cos_max);
        let theta = self.random() * TAU;
        let r = (1.0 - z * z).max(0.0).sqrt();
        let local = Vec3::new(r * theta.cos(), r * theta.sin(), z);
        let (tangent, bitangent) = axis.any_orthonormal_pair();
        tangent * local.x + bitangent * local.y + axis * local.z
    }
}

/// Where particles appear relative to the emitter and how they start moving.
///
/// | Shape | Position | Velocity |
/// |-------|----------|----------|
/// | `Point` | emitter origin | random direction × `speed` |
/// | `Sphere` | inside `radius` | outward × `speed` |
/// | `Box` | inside `half_extents` | none |
/// | `Cone` | emitter origin | within `half_angle` of `direction` × `speed` |
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SpawnShape {
    Point {
        speed: f32,
    },
    Sphere {
        radius: f32,
        speed: f32,
    },
    Box {
        half_extents: Vec3,
    },
    Cone {
        direction: Vec3,
        half_angle: f32,
        speed: f32,
    },
}

impl Default for SpawnShape {
    fn default() -> Self {
        SpawnShape::Point { speed: 0.0 }
    }
}

impl SpawnShape {
    /// Sample an `(offset, velocity)` pair.
    pub fn sample(&self, rng: &mut SpawnRandom) -> (Vec3, Vec3) {
        match *self {
            SpawnShape::Point { speed } => (Vec3::ZERO, rng.random_direction() * speed),
            SpawnShape::Sphere { radius, speed } => {
                let offset = rng.random_in_sphere(radius);
                let outward = match offset.try_normalize() {
                    Some(dir) => dir,
                    None => rng.random_direction(),
                };
                (offset, outward * speed)
            }
            SpawnShape::Box { half_extents } => (rng.random_in_box(half_extents), Vec3::ZERO),
            SpawnShape::Cone {
                direction,
                half_angle,
                speed,
            } => (Vec3::ZERO, rng.random_in_cone(direction, half_angle) * speed),
        }
    }

    /// Initial speed of every particle the shape emits.
    pub fn speed(&self) -> f32 {
        match *self {
            SpawnShape::Point { speed }
            | SpawnShape::Sphere { speed, .. }
            | SpawnShape::Cone { speed, .. } => speed.abs(),
            SpawnShape::Box { .. } => 0.0,
        }
    }

    /// Largest distance from the emitter origin a fresh particle can appear at.
    pub fn extent(&self) -> f32 {
        match *self {
            SpawnShape::Point { .. } | SpawnShape::Cone { .. } => 0.0,
            SpawnShape::Sphere { radius, .. } => radius.abs(),
            SpawnShape::Box { half_extents } => half_extents.abs().length(),
        }
    }
}

/// Circular orbit applied on top of the simulated position.
///
/// Each particle draws one random value in `[0, 1)` at spawn; offset, frequency
/// and phase are `base + range × random`. The GPU simulation evaluates the same
/// function and moves the particle by the change in orbit offset each step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Orbit {
    pub offset_base: Vec3,
    pub offset_range: Vec3,
    pub frequency_base: Vec3,
    pub frequency_range: Vec3,
    pub phase_base: Vec3,
    pub phase_range: Vec3,
}

impl Orbit {
    /// Orbit offset at `relative_time` for a particle with `random_orbit`.
    pub fn offset(&self, relative_time: f32, random_orbit: f32) -> Vec3 {
        let radius = self.offset_base + self.offset_range * random_orbit;
        let frequency = self.frequency_base + self.frequency_range * random_orbit;
        let phase = self.phase_base + self.phase_range * random_orbit;
        let angle = (phase + frequency * relative_time) * TAU;
        Vec3::new(
            radius.x * angle.x.cos(),
            radius.y * angle.y.sin(),
            radius.z * angle.z.sin(),
        )
    }

    /// Maximum distance the orbit can displace a particle.
    pub fn extent(&self) -> f32 {
        (self.offset_base.abs() + self.offset_range.abs()).length()
    }
}

/// Initial state of one particle awaiting injection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpawnRecord {
    pub position: Vec3,
    /// Age as a fraction of lifetime; alive while below 1.
    pub relative_time: f32,
    pub velocity: Vec3,
    /// `1 / lifetime`.
    pub time_scale: f32,
    pub size: Vec2,
    /// Initial rotation in turns.
    pub rotation: f32,
    /// Rotation rate in turns per second.
    pub relative_rotation_rate: f32,
    pub drag_coefficient: f32,
    pub vector_field_scale: f32,
    /// Fraction of normal velocity kept on collision.
    pub resilience: f32,
    pub random_orbit: f32,
    /// Destination slot in the atlas.
    pub texel: UVec2,
    /// Index of the owning tile within the emitter's tile set.
    pub tile_local_index: u32,
}

impl SpawnRecord {
    /// Advance the record by `age` seconds of constant acceleration.
    pub fn pre_advance(&mut self, acceleration: Vec3, age: f32) {
        self.position += (self.velocity + 0.5 * acceleration * age) * age;
        self.velocity += acceleration * age;
        self.relative_time += self.time_scale * age;
    }

    pub fn to_gpu(&self) -> SpawnRecordGpu {
        SpawnRecordGpu {
            position: self.position.extend(self.relative_time).to_array(),
            velocity: self.velocity.extend(self.time_scale).to_array(),
            render_attributes: [
                self.size.x,
                self.size.y,
                self.rotation,
                self.relative_rotation_rate,
            ],
            simulation_attributes: [
                self.drag_coefficient,
                self.vector_field_scale,
                self.resilience,
                self.random_orbit,
            ],
            texel: [self.texel.x, self.texel.y, 0, 0],
        }
    }
}

/// Upload form of a [`SpawnRecord`]; one texel per target texture.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct SpawnRecordGpu {
    pub position: [f32; 4],
    pub velocity: [f32; 4],
    pub render_attributes: [f32; 4],
    pub simulation_attributes: [f32; 4],
    pub texel: [u32; 4],
}

/// WGSL declaration matching [`SpawnRecordGpu`].
pub const SPAWN_RECORD_WGSL: &str = r#"
struct SpawnRecord {
    position: vec4<f32>,
    velocity: vec4<f32>,
    render_attributes: vec4<f32>,
    simulation_attributes: vec4<f32>,
    texel: vec4<u32>,
};
"#;

/// Sub-frame timing for a group of particles spawned in one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SpawnTiming {
    /// Particles in the group.
    pub count: u32,
    /// Age of the first particle in seconds.
    pub start_time: f32,
    /// Age step between consecutive particles.
    pub increment: f32,
}

impl SpawnTiming {
    /// Particles that appear together at the end of the tick (bursts).
    pub fn burst(count: u32) -> Self {
        Self {
            count,
            start_time: 0.0,
            increment: 0.0,
        }
    }

    /// Rate-based spawning carrying a fractional remainder between ticks.
    ///
    /// Returns the timing and the remainder to carry into the next tick. The
    /// count is not capped here; the caller applies the per-frame cap.
    pub fn from_rate(spawn_fraction: f32, rate: f32, dt: f32) -> (Self, f32) {
        if rate <= 0.0 || dt <= 0.0 {
            return (Self::default(), spawn_fraction);
        }
        let accumulated = spawn_fraction + rate * dt;
        let count = accumulated.trunc().max(0.0);
        let increment = 1.0 / rate;
        let timing = Self {
            count: count as u32,
            start_time: dt + spawn_fraction * increment - increment,
            increment,
        };
        (timing, accumulated - count)
    }

    /// Age of the `i`-th particle, clamped to zero.
    #[inline]
    pub fn age_of(&self, i: u32) -> f32 {
        (self.start_time - self.increment * i as f32).max(0.0)
    }
}

/// Outcome of one emitter tick's spawn request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpawnReport {
    /// Particles the emitter wanted this tick (bursts + rate + forced).
    pub requested: u32,
    /// Particles given a slot and queued for injection.
    pub injected: u32,
    /// Particles cut by the per-frame spawn cap.
    pub dropped_by_cap: u32,
    /// Particles cut because no tile could be allocated.
    pub dropped_by_capacity: u32,
}

impl SpawnReport {
    /// Total particles requested but not injected.
    #[inline]
    pub fn dropped(&self) -> u32 {
        self.dropped_by_cap.saturating_add(self.dropped_by_capacity)
    }

    /// Accumulate another report into this one.
    pub fn merge(&mut self, other: SpawnReport) {
        self.requested += other.requested;
        self.injected += other.injected;
        self.dropped_by_cap += other.dropped_by_cap;
        self.dropped_by_capacity += other.dropped_by_capacity;
    }
}
