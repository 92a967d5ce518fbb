//! Simulation stage: one workgroup per tile, one invocation per slot.
//!
//! Reads the previous state copy, integrates one step and writes the current
//! copy. Dead slots are copied through unchanged so every owned tile of the
//! current copy is fully defined after the pass.

use wgpu::util::DeviceExt;

use super::state_textures::StateTextures;
use super::vector_field_gpu::VectorFieldVolumes;
use super::{
    create_compute_pipeline, depth_texture_entry, dispatch_dims, storage_buffer_entry,
    storage_texture_entry, texture_entry, uniform_entry, CollisionView,
};
use crate::atlas::AtlasLayout;
use crate::frame::EmitterCommand;
use crate::state::BufferParity;
use crate::uniforms::{CollisionUniforms, UNIFORMS_WGSL};

/// Generate the simulation shader. The collision variant adds scene depth and
/// normal bindings and resolves contacts after integration.
pub fn simulation_shader(layout: &AtlasLayout, collision: bool) -> String {
    let collision_bindings = if collision {
        r#"
@group(0) @binding(14) var scene_depth: texture_depth_2d;
@group(0) @binding(15) var scene_normals: texture_2d<f32>;
@group(0) @binding(16) var<uniform> camera: CollisionUniforms;
"#
    } else {
        ""
    };

    let collision_step = if collision {
        r#"
    // Collide against scene depth.
    let radius = textureLoad(render_attributes, texel, 0).x * sim.collision.x + sim.collision.y;
    let clip = camera.view_proj * vec4<f32>(pos, 1.0);
    if (clip.w > 0.0) {
        let ndc = clip.xyz / clip.w;
        if (abs(ndc.x) <= 1.0 && abs(ndc.y) <= 1.0) {
            let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
            let pixel = vec2<i32>(min(uv * camera.viewport.xy, camera.viewport.xy - vec2<f32>(1.0)));
            let depth = textureLoad(scene_depth, pixel, 0);
            let surface_h = camera.inv_view_proj * vec4<f32>(ndc.xy, depth, 1.0);
            let surface = surface_h.xyz / surface_h.w;
            let raw_normal = textureLoad(scene_normals, pixel, 0).xyz;
            if (dot(raw_normal, raw_normal) > 1e-8) {
                let normal = normalize(raw_normal);
                let separation = dot(pos - surface, normal);
                let approach = dot(vel, normal);
                let reach = radius + length(vel) * dt;
                if (separation < radius && separation > -reach && approach < 0.0) {
                    let normal_velocity = approach * normal;
                    let tangent_velocity = vel - normal_velocity;
                    vel = tangent_velocity * sim.collision.w - normal_velocity * resilience;
                    pos = pos + normal * (radius - separation);
                    relative_time = relative_time + sim.collision.z;
                }
            }
        }
    }
"#
    } else {
        ""
    };

    format!(
        r#"{atlas}
{uniforms}
const TAU: f32 = 6.283185307;

@group(0) @binding(0) var prev_position: texture_2d<f32>;
@group(0) @binding(1) var prev_velocity: texture_2d<f32>;
@group(0) @binding(2) var render_attributes: texture_2d<f32>;
@group(0) @binding(3) var simulation_attributes: texture_2d<f32>;
@group(0) @binding(4) var out_position: texture_storage_2d<rgba32float, write>;
@group(0) @binding(5) var out_velocity: texture_storage_2d<rgba32float, write>;
@group(0) @binding(6) var<storage, read> tiles: array<u32>;
@group(0) @binding(7) var<uniform> sim: SimulationUniforms;
@group(0) @binding(8) var<uniform> frame: PerFrameUniforms;
@group(0) @binding(9) var<uniform> fields: VectorFieldUniforms;
@group(0) @binding(10) var volume0: texture_3d<f32>;
@group(0) @binding(11) var volume1: texture_3d<f32>;
@group(0) @binding(12) var volume2: texture_3d<f32>;
@group(0) @binding(13) var volume3: texture_3d<f32>;
{collision_bindings}

fn load_volume(slot: u32, cell: vec3<i32>) -> vec3<f32> {{
    switch slot {{
        case 0u: {{ return textureLoad(volume0, cell, 0).xyz; }}
        case 1u: {{ return textureLoad(volume1, cell, 0).xyz; }}
        case 2u: {{ return textureLoad(volume2, cell, 0).xyz; }}
        default: {{ return textureLoad(volume3, cell, 0).xyz; }}
    }}
}}

fn sample_field(slot: u32, position: vec3<f32>) -> vec3<f32> {{
    let raw = (fields.world_to_volume[slot] * vec4<f32>(position, 1.0)).xyz;
    let tiled = fields.tiling_axes[slot].xyz > vec3<f32>(0.5);
    let uvw = select(clamp(raw, vec3<f32>(0.0), vec3<f32>(1.0)), fract(raw), tiled);
    let size = fields.volume_size[slot].xyz;
    let cell = vec3<i32>(min(floor(uvw * size), size - vec3<f32>(1.0)));
    let local_force = load_volume(slot, cell);
    return (fields.volume_to_world[slot] * vec4<f32>(local_force, 0.0)).xyz;
}}

fn orbit_offset(relative_time: f32, random_orbit: f32) -> vec3<f32> {{
    let radius = sim.orbit_offset_base.xyz + sim.orbit_offset_range.xyz * random_orbit;
    let frequency = sim.orbit_frequency_base.xyz + sim.orbit_frequency_range.xyz * random_orbit;
    let phase = sim.orbit_phase_base.xyz + sim.orbit_phase_range.xyz * random_orbit;
    let angle = (phase + frequency * relative_time) * TAU;
    return vec3<f32>(radius.x * cos(angle.x), radius.y * sin(angle.y), radius.z * sin(angle.z));
}}

@compute @workgroup_size({tile_size}, {tile_size}, 1)
fn main(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(num_workgroups) group_count: vec3<u32>,
    @builtin(local_invocation_id) local_id: vec3<u32>,
) {{
    let group = group_id.x + group_id.y * group_count.x;
    if (group >= arrayLength(&tiles)) {{
        return;
    }}
    let texel = vec2<i32>(slot_texel(tiles[group], local_id.x, local_id.y));

    let position = textureLoad(prev_position, texel, 0);
    let velocity = textureLoad(prev_velocity, texel, 0);
    if (position.w >= 1.0) {{
        textureStore(out_position, texel, position);
        textureStore(out_velocity, texel, velocity);
        return;
    }}

    let attributes = textureLoad(simulation_attributes, texel, 0);
    let drag = attributes.x;
    let field_scale = attributes.y;
    let resilience = attributes.z;
    let random_orbit = attributes.w;
    let dt = frame.misc.y;
    let time_scale = velocity.w;

    var pos = position.xyz + frame.position_offset.xyz;
    var vel = velocity.xyz;

    var accel = sim.acceleration.xyz;
    let to_attractor = frame.point_attractor.xyz - pos;
    let dist_sq = dot(to_attractor, to_attractor);
    if (frame.misc.x != 0.0 && dist_sq < frame.point_attractor.w && dist_sq > 1e-8) {{
        let falloff = 1.0 - sqrt(dist_sq / frame.point_attractor.w);
        accel = accel + normalize(to_attractor) * frame.misc.x * falloff;
    }}
    vel = vel + accel * dt;

    for (var slot = 0u; slot < MAX_VECTOR_FIELDS; slot = slot + 1u) {{
        let intensity_tightness = fields.intensity_tightness[slot];
        if (intensity_tightness.x != 0.0) {{
            let force = sample_field(slot, pos) * intensity_tightness.x * field_scale;
            vel = mix(vel + force * dt, force, intensity_tightness.y);
        }}
    }}

    vel = vel - vel * min(drag * dt, 1.0);
    pos = pos + vel * dt;

    var relative_time = position.w + time_scale * dt;
    pos = pos + orbit_offset(relative_time, random_orbit) - orbit_offset(position.w, random_orbit);
{collision_step}
    textureStore(out_position, texel, vec4<f32>(pos, relative_time));
    textureStore(out_velocity, texel, vec4<f32>(vel, time_scale));
}}
"#,
        atlas = layout.to_wgsl(),
        uniforms = UNIFORMS_WGSL,
        tile_size = layout.tile_size(),
        collision_bindings = collision_bindings,
        collision_step = collision_step,
    )
}

fn simulation_layout_entries(collision: bool) -> Vec<wgpu::BindGroupLayoutEntry> {
    let d2 = wgpu::TextureViewDimension::D2;
    let d3 = wgpu::TextureViewDimension::D3;
    let mut entries = vec![
        texture_entry(0, d2),
        texture_entry(1, d2),
        texture_entry(2, d2),
        texture_entry(3, d2),
        storage_texture_entry(4),
        storage_texture_entry(5),
        storage_buffer_entry(6, true),
        uniform_entry(7),
        uniform_entry(8),
        uniform_entry(9),
        texture_entry(10, d3),
        texture_entry(11, d3),
        texture_entry(12, d3),
        texture_entry(13, d3),
    ];
    if collision {
        entries.push(depth_texture_entry(14));
        entries.push(texture_entry(15, d2));
        entries.push(uniform_entry(16));
    }
    entries
}

/// Pipelines for both simulation variants.
pub struct SimulationPipelines {
    main: wgpu::ComputePipeline,
    main_layout: wgpu::BindGroupLayout,
    collision: wgpu::ComputePipeline,
    collision_layout: wgpu::BindGroupLayout,
}

impl SimulationPipelines {
    pub fn new(device: &wgpu::Device, layout: &AtlasLayout) -> Self {
        let main_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Simulation Bind Group Layout"),
            entries: &simulation_layout_entries(false),
        });
        let collision_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Collision Simulation Bind Group Layout"),
            entries: &simulation_layout_entries(true),
        });
        let main = create_compute_pipeline(
            device,
            "Simulation",
            &simulation_shader(layout, false),
            &main_layout,
        );
        let collision = create_compute_pipeline(
            device,
            "Collision Simulation",
            &simulation_shader(layout, true),
            &collision_layout,
        );
        Self {
            main,
            main_layout,
            collision,
            collision_layout,
        }
    }

    /// Record the dispatch simulating every tile of `command`.
    ///
    /// `collision` selects the collision variant; the caller has already
    /// routed commands without a usable view to the main variant.
    pub fn encode(
        &self,
        device: &wgpu::Device,
        pass: &mut wgpu::ComputePass<'_>,
        state: &StateTextures,
        dest: BufferParity,
        command: &EmitterCommand,
        volumes: &VectorFieldVolumes,
        collision: Option<&CollisionView<'_>>,
    ) {
        if command.tiles.is_empty() {
            return;
        }
        let source = dest.other();

        let tile_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Simulation Tiles"),
            contents: bytemuck::cast_slice(&command.tiles),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let simulation_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Simulation Uniforms"),
            contents: bytemuck::bytes_of(&command.simulation),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let per_frame_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Per-Frame Uniforms"),
            contents: bytemuck::bytes_of(&command.per_frame),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let fields_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vector Field Uniforms"),
            contents: bytemuck::bytes_of(&command.vector_fields.uniforms),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let field_views = volumes.slot_views(&command.vector_fields.volumes);
        let collision_buffer;

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(state.position_view(source)),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(state.velocity_view(source)),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::TextureView(&state.render_attributes_view),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: wgpu::BindingResource::TextureView(&state.simulation_attributes_view),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: wgpu::BindingResource::TextureView(state.position_view(dest)),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: wgpu::BindingResource::TextureView(state.velocity_view(dest)),
            },
            wgpu::BindGroupEntry {
                binding: 6,
                resource: tile_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 7,
                resource: simulation_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 8,
                resource: per_frame_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 9,
                resource: fields_buffer.as_entire_binding(),
            },
        ];
        for (slot, view) in field_views.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: 10 + slot as u32,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }

        let (pipeline, bind_group_layout) = match collision {
            Some(view) => {
                collision_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Collision Uniforms"),
                    contents: bytemuck::bytes_of(&CollisionUniforms::new(
                        view.view_proj,
                        view.width,
                        view.height,
                    )),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
                entries.push(wgpu::BindGroupEntry {
                    binding: 14,
                    resource: wgpu::BindingResource::TextureView(view.depth),
                });
                entries.push(wgpu::BindGroupEntry {
                    binding: 15,
                    resource: wgpu::BindingResource::TextureView(view.normals),
                });
                entries.push(wgpu::BindGroupEntry {
                    binding: 16,
                    resource: collision_buffer.as_entire_binding(),
                });
                (&self.collision, &self.collision_layout)
            }
            None => (&self.main, &self.main_layout),
        };

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Simulation Bind Group"),
            layout: bind_group_layout,
            entries: &entries,
        });

        let (x, y) = dispatch_dims(command.tiles.len() as u32);
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AtlasConfig;
    use crate::gpu::validate_wgsl;

    #[test]
    fn test_main_shader_validates() {
        let layout = AtlasLayout::new(AtlasConfig::new(64, 64, 4)).unwrap();
        let shader = simulation_shader(&layout, false);
        validate_wgsl(&shader).expect("simulation WGSL should be valid");
        assert!(shader.contains("@workgroup_size(4, 4, 1)"));
        assert!(!shader.contains("scene_depth"));
    }

    #[test]
    fn test_collision_shader_validates() {
        let layout = AtlasLayout::new(AtlasConfig::new(128, 64, 16)).unwrap();
        let shader = simulation_shader(&layout, true);
        validate_wgsl(&shader).expect("collision WGSL should be valid");
        assert!(shader.contains("@workgroup_size(16, 16, 1)"));
        assert!(shader.contains("texture_depth_2d"));
    }

    #[test]
    fn test_collision_layout_extends_main() {
        let main = simulation_layout_entries(false);
        let collision = simulation_layout_entries(true);
        assert_eq!(main.len(), 14);
        assert_eq!(collision.len(), 17);
        assert!(main.iter().zip(&collision).all(|(a, b)| a.binding == b.binding));
    }
}
