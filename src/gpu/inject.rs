//! Tile clearing and spawn injection.
//!
//! Freshly allocated tiles may hold state from their previous owner, so they
//! are reset to dead before any spawn record lands in them. Injection writes
//! every field of a record into the current copy of the state textures.

use std::ops::Range;

use wgpu::util::DeviceExt;

use super::state_textures::StateTextures;
use super::{create_compute_pipeline, dispatch_dims, storage_buffer_entry, storage_texture_entry};
use crate::atlas::AtlasLayout;
use crate::spawn::{SpawnRecord, SpawnRecordGpu, SPAWN_RECORD_WGSL};
use crate::state::BufferParity;

/// Relative time written into cleared slots. Anything at or above 1 is dead.
pub const CLEARED_RELATIVE_TIME: f32 = 2.0;

pub const INJECT_WORKGROUP_SIZE: u32 = 64;

pub const DEFAULT_MAX_INJECTION_BATCH: usize = 16384;

/// Split `len` records into consecutive ranges no longer than `max_batch`
/// and `hardware_limit`.
pub fn split_batches(len: usize, max_batch: usize, hardware_limit: usize) -> Vec<Range<usize>> {
    let step = max_batch.min(hardware_limit).max(1);
    (0..len)
        .step_by(step)
        .map(|start| start..(start + step).min(len))
        .collect()
}

pub fn clear_shader(layout: &AtlasLayout) -> String {
    format!(
        r#"{atlas}
@group(0) @binding(0) var out_position: texture_storage_2d<rgba32float, write>;
@group(0) @binding(1) var out_velocity: texture_storage_2d<rgba32float, write>;
@group(0) @binding(2) var<storage, read> tiles: array<u32>;

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
    textureStore(out_position, texel, vec4<f32>(0.0, 0.0, 0.0, {cleared:.1}));
    textureStore(out_velocity, texel, vec4<f32>(0.0));
}}
"#,
        atlas = layout.to_wgsl(),
        tile_size = layout.tile_size(),
        cleared = CLEARED_RELATIVE_TIME,
    )
}

pub fn inject_shader() -> String {
    format!(
        r#"{records}
@group(0) @binding(0) var out_position: texture_storage_2d<rgba32float, write>;
@group(0) @binding(1) var out_velocity: texture_storage_2d<rgba32float, write>;
@group(0) @binding(2) var out_render_attributes: texture_storage_2d<rgba32float, write>;
@group(0) @binding(3) var out_simulation_attributes: texture_storage_2d<rgba32float, write>;
@group(0) @binding(4) var<storage, read> records: array<SpawnRecord>;

@compute @workgroup_size({workgroup})
fn main(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(num_workgroups) group_count: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
) {{
    let index = (group_id.x + group_id.y * group_count.x) * {workgroup}u + local_index;
    if (index >= arrayLength(&records)) {{
        return;
    }}
    let record = records[index];
    let texel = vec2<i32>(record.texel.xy);
    textureStore(out_position, texel, record.position);
    textureStore(out_velocity, texel, record.velocity);
    textureStore(out_render_attributes, texel, record.render_attributes);
    textureStore(out_simulation_attributes, texel, record.simulation_attributes);
}}
"#,
        records = SPAWN_RECORD_WGSL,
        workgroup = INJECT_WORKGROUP_SIZE,
    )
}

pub struct InjectionPipelines {
    clear: wgpu::ComputePipeline,
    clear_layout: wgpu::BindGroupLayout,
    inject: wgpu::ComputePipeline,
    inject_layout: wgpu::BindGroupLayout,
    max_batch: usize,
    hardware_limit: usize,
}

impl InjectionPipelines {
    pub fn new(device: &wgpu::Device, layout: &AtlasLayout) -> Self {
        let clear_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Clear Bind Group Layout"),
            entries: &[
                storage_texture_entry(0),
                storage_texture_entry(1),
                storage_buffer_entry(2, true),
            ],
        });
        let inject_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Inject Bind Group Layout"),
            entries: &[
                storage_texture_entry(0),
                storage_texture_entry(1),
                storage_texture_entry(2),
                storage_texture_entry(3),
                storage_buffer_entry(4, true),
            ],
        });
        let clear = create_compute_pipeline(device, "Clear Tiles", &clear_shader(layout), &clear_layout);
        let inject = create_compute_pipeline(device, "Inject Particles", &inject_shader(), &inject_layout);

        let record_size = std::mem::size_of::<SpawnRecordGpu>();
        let hardware_limit = device.limits().max_storage_buffer_binding_size as usize / record_size;

        Self {
            clear,
            clear_layout,
            inject,
            inject_layout,
            max_batch: DEFAULT_MAX_INJECTION_BATCH,
            hardware_limit,
        }
    }

    pub fn set_max_batch(&mut self, max_batch: usize) {
        self.max_batch = max_batch.max(1);
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Reset `tiles` in the `dest` copy to dead.
    pub fn encode_clear(
        &self,
        device: &wgpu::Device,
        pass: &mut wgpu::ComputePass<'_>,
        state: &StateTextures,
        dest: BufferParity,
        tiles: &[u32],
    ) {
        if tiles.is_empty() {
            return;
        }
        let tile_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Clear Tiles"),
            contents: bytemuck::cast_slice(tiles),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Clear Bind Group"),
            layout: &self.clear_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(state.position_view(dest)),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(state.velocity_view(dest)),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: tile_buffer.as_entire_binding(),
                },
            ],
        });
        let (x, y) = dispatch_dims(tiles.len() as u32);
        pass.set_pipeline(&self.clear);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
    }

    /// Write `spawns` into the `dest` copy. Returns the number of dispatches.
    pub fn encode_inject(
        &self,
        device: &wgpu::Device,
        pass: &mut wgpu::ComputePass<'_>,
        state: &StateTextures,
        dest: BufferParity,
        spawns: &[SpawnRecord],
    ) -> u32 {
        let mut dispatches = 0;
        for range in split_batches(spawns.len(), self.max_batch, self.hardware_limit) {
            let records: Vec<SpawnRecordGpu> = spawns[range].iter().map(SpawnRecord::to_gpu).collect();
            let record_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Spawn Records"),
                contents: bytemuck::cast_slice(&records),
                usage: wgpu::BufferUsages::STORAGE,
            });
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Inject Bind Group"),
                layout: &self.inject_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(state.position_view(dest)),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(state.velocity_view(dest)),
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
                        resource: record_buffer.as_entire_binding(),
                    },
                ],
            });
            let groups = (records.len() as u32).div_ceil(INJECT_WORKGROUP_SIZE);
            let (x, y) = dispatch_dims(groups);
            pass.set_pipeline(&self.inject);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
            dispatches += 1;
        }
        dispatches
    }
}
