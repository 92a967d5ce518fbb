//! Synchronous bounding box of an emitter's live particles.
//!
//! A fixed number of workgroups stride over every slot of the given tiles,
//! reduce min/max in shared memory and write one min/max pair each. The host
//! folds the pairs after a blocking readback.

use wgpu::util::DeviceExt;

use super::{create_compute_pipeline, read_buffer, storage_buffer_entry, texture_entry, uniform_entry};
use crate::atlas::AtlasLayout;
use crate::bounds::Aabb;
use crate::error::GpuError;

pub const BOUNDS_WORKGROUP_SIZE: u32 = 64;
pub const MAX_BOUNDS_GROUPS: u32 = 128;

/// Workgroups used for `particles` slots.
pub fn bounds_group_count(particles: u32) -> u32 {
    particles.div_ceil(BOUNDS_WORKGROUP_SIZE).clamp(1, MAX_BOUNDS_GROUPS)
}

pub fn bounds_shader(layout: &AtlasLayout) -> String {
    format!(
        r#"{atlas}
const GROUP: u32 = {group}u;
const FAR: f32 = 3.0e38;

@group(0) @binding(0) var positions: texture_2d<f32>;
@group(0) @binding(1) var<storage, read> tiles: array<u32>;
@group(0) @binding(2) var<uniform> params: vec4<u32>;
@group(0) @binding(3) var<storage, read_write> results: array<vec4<f32>>;

var<workgroup> group_min: array<vec3<f32>, {group}>;
var<workgroup> group_max: array<vec3<f32>, {group}>;

@compute @workgroup_size({group})
fn main(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
) {{
    let total = arrayLength(&tiles) * PARTICLES_PER_TILE;
    let stride = GROUP * params.x;
    var lo = vec3<f32>(FAR);
    var hi = vec3<f32>(-FAR);
    for (var index = group_id.x * GROUP + local_index; index < total; index = index + stride) {{
        let tile = tiles[index / PARTICLES_PER_TILE];
        let texel = slot_for_index(tile, index % PARTICLES_PER_TILE);
        let position = textureLoad(positions, vec2<i32>(texel), 0);
        if (position.w < 1.0) {{
            lo = min(lo, position.xyz);
            hi = max(hi, position.xyz);
        }}
    }}
    group_min[local_index] = lo;
    group_max[local_index] = hi;
    workgroupBarrier();

    for (var width = GROUP / 2u; width > 0u; width = width / 2u) {{
        if (local_index < width) {{
            group_min[local_index] = min(group_min[local_index], group_min[local_index + width]);
            group_max[local_index] = max(group_max[local_index], group_max[local_index + width]);
        }}
        workgroupBarrier();
    }}

    if (local_index == 0u) {{
        results[group_id.x * 2u] = vec4<f32>(group_min[0], 0.0);
        results[group_id.x * 2u + 1u] = vec4<f32>(group_max[0], 0.0);
    }}
}}
"#,
        atlas = layout.to_wgsl(),
        group = BOUNDS_WORKGROUP_SIZE,
    )
}

pub struct BoundsReducer {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    results: wgpu::Buffer,
    staging: wgpu::Buffer,
}

const RESULTS_SIZE: u64 = MAX_BOUNDS_GROUPS as u64 * 2 * 16;

impl BoundsReducer {
    pub fn new(device: &wgpu::Device, layout: &AtlasLayout) -> Self {
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Bounds Bind Group Layout"),
            entries: &[
                texture_entry(0, wgpu::TextureViewDimension::D2),
                storage_buffer_entry(1, true),
                uniform_entry(2),
                storage_buffer_entry(3, false),
            ],
        });
        let pipeline = create_compute_pipeline(device, "Bounds", &bounds_shader(layout), &bind_group_layout);
        let results = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Bounds Results"),
            size: RESULTS_SIZE,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Bounds Staging"),
            size: RESULTS_SIZE,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            pipeline,
            bind_group_layout,
            results,
            staging,
        }
    }

    /// Run the reduction over `tiles` and wait for the result.
    pub fn compute(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        layout: &AtlasLayout,
        positions: &wgpu::TextureView,
        tiles: &[u32],
    ) -> Result<Aabb, GpuError> {
        if tiles.is_empty() {
            return Ok(Aabb::EMPTY);
        }
        let particles = tiles.len() as u32 * layout.particles_per_tile();
        let groups = bounds_group_count(particles);

        let tile_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Bounds Tiles"),
            contents: bytemuck::cast_slice(tiles),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Bounds Params"),
            contents: bytemuck::cast_slice(&[groups, 0, 0, 0]),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Bounds Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(positions),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: tile_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.results.as_entire_binding(),
                },
            ],
        });

        let result_bytes = groups as u64 * 2 * 16;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Bounds Encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Bounds Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&self.results, 0, &self.staging, 0, result_bytes);
        queue.submit(std::iter::once(encoder.finish()));

        let groups_out: Vec<[f32; 4]> = read_buffer(device, &self.staging, result_bytes)?;
        Ok(Aabb::from_group_results(&groups_out))
    }
}
