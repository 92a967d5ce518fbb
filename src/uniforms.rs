//! Uniform blocks shared by the simulation shaders.
//!
//! Each block is a `#[repr(C)]` Pod struct paired with a WGSL declaration of
//! identical layout. Everything is packed into `vec4` lanes so the Rust and
//! WGSL sides agree without relying on implicit `vec3` padding.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::spawn::Orbit;

/// Number of vector field slots sampled per simulation dispatch.
pub const MAX_VECTOR_FIELDS: usize = 4;

/// Per-emitter constants of the simulation step.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SimulationUniforms {
    /// xyz = constant acceleration.
    pub acceleration: [f32; 4],
    pub orbit_offset_base: [f32; 4],
    pub orbit_offset_range: [f32; 4],
    pub orbit_frequency_base: [f32; 4],
    pub orbit_frequency_range: [f32; 4],
    pub orbit_phase_base: [f32; 4],
    pub orbit_phase_range: [f32; 4],
    /// x = radius scale, y = radius bias, z = time bias, w = 1 - friction.
    pub collision: [f32; 4],
}

impl SimulationUniforms {
    pub fn new(acceleration: Vec3, orbit: &Orbit, collision: CollisionResponse) -> Self {
        Self {
            acceleration: acceleration.extend(0.0).to_array(),
            orbit_offset_base: orbit.offset_base.extend(0.0).to_array(),
            orbit_offset_range: orbit.offset_range.extend(0.0).to_array(),
            orbit_frequency_base: orbit.frequency_base.extend(0.0).to_array(),
            orbit_frequency_range: orbit.frequency_range.extend(0.0).to_array(),
            orbit_phase_base: orbit.phase_base.extend(0.0).to_array(),
            orbit_phase_range: orbit.phase_range.extend(0.0).to_array(),
            collision: [
                collision.radius_scale,
                collision.radius_bias,
                collision.time_bias,
                1.0 - collision.friction,
            ],
        }
    }
}

/// How particles react when they hit scene depth.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CollisionResponse {
    /// Collision radius = `size.x × radius_scale + radius_bias`.
    pub radius_scale: f32,
    pub radius_bias: f32,
    /// Relative time added on every collision (shortens life).
    pub time_bias: f32,
    /// Fraction of tangential velocity lost on collision.
    pub friction: f32,
}

impl Default for CollisionResponse {
    fn default() -> Self {
        Self {
            radius_scale: 0.5,
            radius_bias: 0.0,
            time_bias: 0.0,
            friction: 0.0,
        }
    }
}

/// Values that change every frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct PerFrameUniforms {
    /// xyz = attractor position, w = radius².
    pub point_attractor: [f32; 4],
    /// x = attractor strength, y = delta seconds, zw = local-to-world scale.
    pub misc: [f32; 4],
    /// xyz = offset applied to every particle this frame.
    pub position_offset: [f32; 4],
}

impl Default for PerFrameUniforms {
    fn default() -> Self {
        Self {
            point_attractor: [0.0; 4],
            misc: [0.0, 0.0, 1.0, 1.0],
            position_offset: [0.0; 4],
        }
    }
}

impl PerFrameUniforms {
    pub fn new(delta_seconds: f32, attractor: Option<&PointAttractor>, position_offset: Vec3) -> Self {
        let (point, strength) = match attractor {
            Some(a) => (a.position.extend(a.radius * a.radius).to_array(), a.strength),
            None => ([0.0; 4], 0.0),
        };
        Self {
            point_attractor: point,
            misc: [strength, delta_seconds, 1.0, 1.0],
            position_offset: position_offset.extend(0.0).to_array(),
        }
    }

    #[inline]
    pub fn delta_seconds(&self) -> f32 {
        self.misc[1]
    }
}

/// A point that pulls particles within `radius` toward it.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PointAttractor {
    pub position: Vec3,
    pub radius: f32,
    pub strength: f32,
}

/// Packed parameters for up to [`MAX_VECTOR_FIELDS`] vector fields.
///
/// Unused slots are neutral: identity transforms, unit volume size and zero
/// intensity. Shaders skip a slot on zero intensity, not on `count`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct VectorFieldUniforms {
    pub world_to_volume: [[[f32; 4]; 4]; MAX_VECTOR_FIELDS],
    pub volume_to_world: [[[f32; 4]; 4]; MAX_VECTOR_FIELDS],
    pub volume_size: [[f32; 4]; MAX_VECTOR_FIELDS],
    /// x = intensity, y = tightness.
    pub intensity_tightness: [[f32; 4]; MAX_VECTOR_FIELDS],
    /// 1.0 on axes that wrap instead of clamping.
    pub tiling_axes: [[f32; 4]; MAX_VECTOR_FIELDS],
    /// x = number of filled slots.
    pub count: [u32; 4],
}

impl Default for VectorFieldUniforms {
    fn default() -> Self {
        Self::neutral()
    }
}

impl VectorFieldUniforms {
    /// All slots neutral.
    pub fn neutral() -> Self {
        let identity = Mat4::IDENTITY.to_cols_array_2d();
        Self {
            world_to_volume: [identity; MAX_VECTOR_FIELDS],
            volume_to_world: [identity; MAX_VECTOR_FIELDS],
            volume_size: [[1.0, 1.0, 1.0, 0.0]; MAX_VECTOR_FIELDS],
            intensity_tightness: [[0.0; 4]; MAX_VECTOR_FIELDS],
            tiling_axes: [[0.0; 4]; MAX_VECTOR_FIELDS],
            count: [0; 4],
        }
    }

    /// Whether `slot` contributes nothing.
    pub fn is_neutral(&self, slot: usize) -> bool {
        self.intensity_tightness[slot][0] == 0.0
    }

    /// Number of contributing slots.
    pub fn active_slots(&self) -> usize {
        (0..MAX_VECTOR_FIELDS).filter(|&i| !self.is_neutral(i)).count()
    }
}

/// Camera data needed to collide particles against scene depth.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct CollisionUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub inv_view_proj: [[f32; 4]; 4],
    /// xy = depth buffer size in pixels.
    pub viewport: [f32; 4],
}

impl CollisionUniforms {
    pub fn new(view_proj: Mat4, width: u32, height: u32) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            inv_view_proj: view_proj.inverse().to_cols_array_2d(),
            viewport: [width as f32, height as f32, 0.0, 0.0],
        }
    }
}

/// WGSL declarations of every uniform block.
pub const UNIFORMS_WGSL: &str = r#"
const MAX_VECTOR_FIELDS: u32 = 4u;

struct SimulationUniforms {
    acceleration: vec4<f32>,
    orbit_offset_base: vec4<f32>,
    orbit_offset_range: vec4<f32>,
    orbit_frequency_base: vec4<f32>,
    orbit_frequency_range: vec4<f32>,
    orbit_phase_base: vec4<f32>,
    orbit_phase_range: vec4<f32>,
    collision: vec4<f32>,
};

struct PerFrameUniforms {
    point_attractor: vec4<f32>,
    misc: vec4<f32>,
    position_offset: vec4<f32>,
};

struct VectorFieldUniforms {
    world_to_volume: array<mat4x4<f32>, 4>,
    volume_to_world: array<mat4x4<f32>, 4>,
    volume_size: array<vec4<f32>, 4>,
    intensity_tightness: array<vec4<f32>, 4>,
    tiling_axes: array<vec4<f32>, 4>,
    count: vec4<u32>,
};

struct CollisionUniforms {
    view_proj: mat4x4<f32>,
    inv_view_proj: mat4x4<f32>,
    viewport: vec4<f32>,
};
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_sizes_are_vec4_multiples() {
        assert_eq!(std::mem::size_of::<SimulationUniforms>(), 8 * 16);
        assert_eq!(std::mem::size_of::<PerFrameUniforms>(), 3 * 16);
        assert_eq!(std::mem::size_of::<VectorFieldUniforms>(), 4 * 64 * 2 + 3 * 4 * 16 + 16);
        assert_eq!(std::mem::size_of::<CollisionUniforms>(), 2 * 64 + 16);
    }

    #[test]
    fn test_neutral_fields() {
        let fields = VectorFieldUniforms::neutral();
        assert_eq!(fields.active_slots(), 0);
        for slot in 0..MAX_VECTOR_FIELDS {
            assert!(fields.is_neutral(slot));
            assert_eq!(fields.world_to_volume[slot], Mat4::IDENTITY.to_cols_array_2d());
            assert_eq!(fields.volume_size[slot][..3], [1.0, 1.0, 1.0]);
        }
    }

    #[test]
    fn test_collision_stores_one_minus_friction() {
        let uniforms = SimulationUniforms::new(
            Vec3::new(0.0, -9.8, 0.0),
            &Orbit::default(),
            CollisionResponse { friction: 0.25, ..Default::default() },
        );
        assert_eq!(uniforms.collision[3], 0.75);
        assert_eq!(uniforms.acceleration, [0.0, -9.8, 0.0, 0.0]);
    }

    #[test]
    fn test_per_frame_attractor_radius_squared() {
        let attractor = PointAttractor { position: Vec3::X, radius: 3.0, strength: 2.0 };
        let frame = PerFrameUniforms::new(0.016, Some(&attractor), Vec3::ZERO);
        assert_eq!(frame.point_attractor, [1.0, 0.0, 0.0, 9.0]);
        assert_eq!(frame.misc[0], 2.0);
        assert_eq!(frame.delta_seconds(), 0.016);
    }

    #[test]
    fn test_uniform_wgsl_validates() {
        let shader = format!(
            r#"{UNIFORMS_WGSL}
@group(0) @binding(0) var<uniform> sim: SimulationUniforms;
@group(0) @binding(1) var<uniform> frame: PerFrameUniforms;
@group(0) @binding(2) var<uniform> fields: VectorFieldUniforms;
@group(0) @binding(3) var<uniform> collision: CollisionUniforms;
@group(0) @binding(4) var<storage, read_write> out: array<vec4<f32>>;

@compute @workgroup_size(1)
fn main() {{
    out[0] = sim.acceleration + frame.misc + fields.volume_size[0] + collision.viewport;
}}
"#
        );
        let module = naga::front::wgsl::parse_str(&shader).expect("uniform WGSL should parse");
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator.validate(&module).expect("uniform WGSL should validate");
    }
}
