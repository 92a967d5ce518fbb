//! Back-to-front particle sort.
//!
//! Sorted emitters are concatenated into one index space: a segment per
//! emitter, each a run of whole tiles. One key pass turns every slot into a
//! 16-bit distance key plus its packed texel. Each segment is then counting
//! sorted over the 65536 possible keys and scattered back into its own range,
//! so `sorted[offset..offset + count]` holds exactly that emitter's texels,
//! farthest first. Dead slots get the largest key and end up at the back of
//! their segment.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use wgpu::util::DeviceExt;

use super::{
    buffer_bind_group, create_compute_pipeline, create_compute_pipeline_entry, dispatch_dims, read_buffer,
    storage_buffer_entry, texture_entry, uniform_entry,
};
use crate::atlas::AtlasLayout;
use crate::error::GpuError;
use crate::frame::EmitterId;

pub const KEY_BINS: u32 = 1 << 16;
pub const SORT_WORKGROUP_SIZE: u32 = 256;
/// Key given to dead slots.
pub const DEAD_KEY: u32 = 0xFFFF;

/// One emitter's run in the sort's index space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortSegment {
    pub emitter: EmitterId,
    /// First index of the segment, in both the key and the sorted buffers.
    pub offset: u32,
    pub count: u32,
}

/// Emitters taking part in one sort, recorded before the key pass.
#[derive(Clone, Debug)]
pub struct SortPlan {
    particles_per_tile: u32,
    tiles: Vec<u32>,
    segments: Vec<SortSegment>,
}

impl SortPlan {
    pub fn new(layout: &AtlasLayout) -> Self {
        Self {
            particles_per_tile: layout.particles_per_tile(),
            tiles: Vec::new(),
            segments: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.tiles.clear();
        self.segments.clear();
    }

    /// Append an emitter's tiles. Returns the segment's first index.
    pub fn add(&mut self, emitter: EmitterId, tiles: &[u32]) -> u32 {
        let offset = self.particle_count();
        self.tiles.extend_from_slice(tiles);
        self.segments.push(SortSegment {
            emitter,
            offset,
            count: tiles.len() as u32 * self.particles_per_tile,
        });
        offset
    }

    pub fn offset(&self, emitter: EmitterId) -> Option<u32> {
        self.segment(emitter).map(|s| s.offset)
    }

    pub fn range(&self, emitter: EmitterId) -> Option<Range<u32>> {
        self.segment(emitter).map(|s| s.offset..s.offset + s.count)
    }

    fn segment(&self, emitter: EmitterId) -> Option<&SortSegment> {
        self.segments.iter().find(|s| s.emitter == emitter)
    }

    pub fn segments(&self) -> &[SortSegment] {
        &self.segments
    }

    pub fn tiles(&self) -> &[u32] {
        &self.tiles
    }

    pub fn particle_count(&self) -> u32 {
        self.tiles.len() as u32 * self.particles_per_tile
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Host-side mirror of the key computed on the GPU.
pub fn distance_key(position: Vec3, origin: Vec3, alive: bool) -> u32 {
    if !alive {
        return DEAD_KEY;
    }
    let distance = position.distance(origin);
    (0xFFFF - (distance.to_bits() >> 16)).min(DEAD_KEY - 1)
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct SortParams {
    origin: [f32; 4],
    /// x = slots to sort, y = first slot.
    count: [u32; 4],
}

const SORT_PARAMS_WGSL: &str = r#"
struct SortParams {
    origin: vec4<f32>,
    count: vec4<u32>,
};
"#;

pub fn key_shader(layout: &AtlasLayout) -> String {
    format!(
        r#"{atlas}
{params}
@group(0) @binding(0) var positions: texture_2d<f32>;
@group(0) @binding(1) var<storage, read> tiles: array<u32>;
@group(0) @binding(2) var<uniform> params: SortParams;
@group(0) @binding(3) var<storage, read_write> keys: array<u32>;
@group(0) @binding(4) var<storage, read_write> values: array<u32>;

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
    let texel = slot_texel(tiles[group], local_id.x, local_id.y);
    let index = group * PARTICLES_PER_TILE + local_id.y * TILE_SIZE + local_id.x;
    let position = textureLoad(positions, vec2<i32>(texel), 0);

    var key = {dead}u;
    if (position.w < 1.0) {{
        let distance = length(position.xyz - params.origin.xyz);
        key = min(0xFFFFu - (bitcast<u32>(distance) >> 16u), {dead}u - 1u);
    }}
    keys[index] = key;
    values[index] = pack_texel(texel);
}}
"#,
        atlas = layout.to_wgsl(),
        params = SORT_PARAMS_WGSL,
        tile_size = layout.tile_size(),
        dead = DEAD_KEY,
    )
}

pub fn sort_shader() -> String {
    format!(
        r#"{params}
const BINS: u32 = {bins}u;
const GROUP: u32 = {group}u;

@group(0) @binding(0) var<uniform> params: SortParams;
@group(0) @binding(1) var<storage, read_write> keys: array<u32>;
@group(0) @binding(2) var<storage, read_write> values: array<u32>;
@group(0) @binding(3) var<storage, read_write> histogram: array<atomic<u32>>;
@group(0) @binding(4) var<storage, read_write> sorted: array<u32>;

fn linear_index(group_id: vec3<u32>, group_count: vec3<u32>, local_index: u32) -> u32 {{
    return (group_id.x + group_id.y * group_count.x) * GROUP + local_index;
}}

@compute @workgroup_size({group})
fn clear_histogram(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(num_workgroups) group_count: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
) {{
    let index = linear_index(group_id, group_count, local_index);
    if (index < BINS) {{
        atomicStore(&histogram[index], 0u);
    }}
}}

@compute @workgroup_size({group})
fn count_keys(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(num_workgroups) group_count: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
) {{
    let index = linear_index(group_id, group_count, local_index);
    if (index < params.count.x) {{
        atomicAdd(&histogram[keys[params.count.y + index]], 1u);
    }}
}}

@compute @workgroup_size({group})
fn scatter(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(num_workgroups) group_count: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
) {{
    let index = linear_index(group_id, group_count, local_index);
    if (index < params.count.x) {{
        let source = params.count.y + index;
        let destination = atomicAdd(&histogram[keys[source]], 1u);
        sorted[params.count.y + destination] = values[source];
    }}
}}
"#,
        params = SORT_PARAMS_WGSL,
        bins = KEY_BINS,
        group = SORT_WORKGROUP_SIZE,
    )
}

/// Exclusive prefix sum of the histogram: a scan per block of 256 bins, a
/// scan of the block totals, then the block offsets added back.
pub fn scan_shader() -> String {
    format!(
        r#"
const GROUP: u32 = {group}u;

@group(0) @binding(0) var<storage, read_write> histogram: array<u32>;
@group(0) @binding(1) var<storage, read_write> block_sums: array<u32>;

var<workgroup> scratch: array<u32, {group}>;

fn scan_workgroup(local_index: u32, value: u32) -> u32 {{
    scratch[local_index] = value;
    workgroupBarrier();
    for (var offset = 1u; offset < GROUP; offset = offset * 2u) {{
        var add = 0u;
        if (local_index >= offset) {{
            add = scratch[local_index - offset];
        }}
        workgroupBarrier();
        scratch[local_index] = scratch[local_index] + add;
        workgroupBarrier();
    }}
    return scratch[local_index];
}}

@compute @workgroup_size({group})
fn scan_blocks(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
) {{
    let index = group_id.x * GROUP + local_index;
    let value = histogram[index];
    let inclusive = scan_workgroup(local_index, value);
    histogram[index] = inclusive - value;
    if (local_index == GROUP - 1u) {{
        block_sums[group_id.x] = inclusive;
    }}
}}

@compute @workgroup_size({group})
fn scan_block_sums(@builtin(local_invocation_index) local_index: u32) {{
    let value = block_sums[local_index];
    let inclusive = scan_workgroup(local_index, value);
    block_sums[local_index] = inclusive - value;
}}

@compute @workgroup_size({group})
fn add_block_offsets(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
) {{
    let index = group_id.x * GROUP + local_index;
    histogram[index] = histogram[index] + block_sums[group_id.x];
}}
"#,
        group = SORT_WORKGROUP_SIZE,
    )
}

/// GPU buffers and pipelines of the sort, sized for the whole atlas.
pub struct GpuSorter {
    key_pipeline: wgpu::ComputePipeline,
    key_layout: wgpu::BindGroupLayout,
    clear_pipeline: wgpu::ComputePipeline,
    count_pipeline: wgpu::ComputePipeline,
    scatter_pipeline: wgpu::ComputePipeline,
    sort_layout: wgpu::BindGroupLayout,
    scan_blocks_pipeline: wgpu::ComputePipeline,
    scan_sums_pipeline: wgpu::ComputePipeline,
    add_offsets_pipeline: wgpu::ComputePipeline,
    scan_layout: wgpu::BindGroupLayout,
    keys: wgpu::Buffer,
    values: wgpu::Buffer,
    histogram: wgpu::Buffer,
    block_sums: wgpu::Buffer,
    sorted: wgpu::Buffer,
    capacity: u32,
    sorted_count: u32,
}

fn storage_buffer(device: &wgpu::Device, label: &str, elements: u64, extra: wgpu::BufferUsages) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: elements.max(1) * 4,
        usage: wgpu::BufferUsages::STORAGE | extra,
        mapped_at_creation: false,
    })
}

impl GpuSorter {
    pub fn new(device: &wgpu::Device, layout: &AtlasLayout) -> Self {
        // Validated atlases hold at most u32::MAX slots.
        let capacity = u32::try_from(layout.particle_capacity()).unwrap_or(u32::MAX);

        let key_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sort Key Bind Group Layout"),
            entries: &[
                texture_entry(0, wgpu::TextureViewDimension::D2),
                storage_buffer_entry(1, true),
                uniform_entry(2),
                storage_buffer_entry(3, false),
                storage_buffer_entry(4, false),
            ],
        });
        let sort_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sort Bind Group Layout"),
            entries: &[
                uniform_entry(0),
                storage_buffer_entry(1, false),
                storage_buffer_entry(2, false),
                storage_buffer_entry(3, false),
                storage_buffer_entry(4, false),
            ],
        });
        let scan_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sort Scan Bind Group Layout"),
            entries: &[storage_buffer_entry(0, false), storage_buffer_entry(1, false)],
        });

        let key_source = key_shader(layout);
        let sort_source = sort_shader();
        let scan_source = scan_shader();
        let pipeline = |label: &str, source: &str, entry: &str, layout: &wgpu::BindGroupLayout| {
            create_compute_pipeline_entry(device, label, source, entry, layout)
        };

        Self {
            key_pipeline: create_compute_pipeline(device, "Sort Keys", &key_source, &key_layout),
            clear_pipeline: pipeline("Sort Clear Histogram", &sort_source, "clear_histogram", &sort_layout),
            count_pipeline: pipeline("Sort Count Keys", &sort_source, "count_keys", &sort_layout),
            scatter_pipeline: pipeline("Sort Scatter", &sort_source, "scatter", &sort_layout),
            scan_blocks_pipeline: pipeline("Sort Scan Blocks", &scan_source, "scan_blocks", &scan_layout),
            scan_sums_pipeline: pipeline("Sort Scan Block Sums", &scan_source, "scan_block_sums", &scan_layout),
            add_offsets_pipeline: pipeline("Sort Add Block Offsets", &scan_source, "add_block_offsets", &scan_layout),
            key_layout,
            sort_layout,
            scan_layout,
            keys: storage_buffer(device, "Sort Keys", capacity as u64, wgpu::BufferUsages::empty()),
            values: storage_buffer(device, "Sort Values", capacity as u64, wgpu::BufferUsages::empty()),
            histogram: storage_buffer(device, "Sort Histogram", KEY_BINS as u64, wgpu::BufferUsages::empty()),
            block_sums: storage_buffer(
                device,
                "Sort Block Sums",
                (KEY_BINS / SORT_WORKGROUP_SIZE) as u64,
                wgpu::BufferUsages::empty(),
            ),
            sorted: storage_buffer(
                device,
                "Sorted Particle Indices",
                capacity as u64,
                wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::VERTEX,
            ),
            capacity,
            sorted_count: 0,
        }
    }

    /// Packed texels of the last sort, farthest first within each segment.
    pub fn sorted_indices(&self) -> &wgpu::Buffer {
        &self.sorted
    }

    /// Copy the last sort's packed texels back to the host. Blocks.
    pub fn read_sorted(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<Vec<u32>, GpuError> {
        if self.sorted_count == 0 {
            return Ok(Vec::new());
        }
        let size = self.sorted_count as u64 * 4;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sorted Indices Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Sorted Indices Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(&self.sorted, 0, &staging, 0, size);
        queue.submit(std::iter::once(encoder.finish()));
        read_buffer(device, &staging, size)
    }

    pub fn sorted_count(&self) -> u32 {
        self.sorted_count
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Record every sort dispatch for `plan` against the current positions.
    pub fn encode(
        &mut self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        positions: &wgpu::TextureView,
        plan: &SortPlan,
        origin: Vec3,
    ) -> u32 {
        let count = plan.particle_count().min(self.capacity);
        self.sorted_count = count;
        if count == 0 {
            return 0;
        }

        let key_params = SortParams {
            origin: origin.extend(0.0).to_array(),
            count: [count, 0, 0, 0],
        };
        let key_params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sort Key Params"),
            contents: bytemuck::bytes_of(&key_params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let tile_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sort Tiles"),
            contents: bytemuck::cast_slice(plan.tiles()),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let key_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Sort Key Bind Group"),
            layout: &self.key_layout,
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
                    resource: key_params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.keys.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: self.values.as_entire_binding(),
                },
            ],
        });
        let scan_bind_group = buffer_bind_group(
            device,
            "Sort Scan Bind Group",
            &self.scan_layout,
            &[&self.histogram, &self.block_sums],
        );

        // Segments past the capacity clamp are dropped or shortened.
        let segments: Vec<(u32, u32)> = plan
            .segments()
            .iter()
            .filter(|segment| segment.offset < count)
            .map(|segment| (segment.offset, segment.count.min(count - segment.offset)))
            .filter(|&(_, slots)| slots > 0)
            .collect();
        let segment_bind_groups: Vec<(u32, wgpu::BindGroup)> = segments
            .iter()
            .map(|&(offset, slots)| {
                let params = SortParams {
                    origin: key_params.origin,
                    count: [slots, offset, 0, 0],
                };
                let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Sort Segment Params"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
                let bind_group = buffer_bind_group(
                    device,
                    "Sort Segment Bind Group",
                    &self.sort_layout,
                    &[&params_buffer, &self.keys, &self.values, &self.histogram, &self.sorted],
                );
                (slots, bind_group)
            })
            .collect();

        let bin_groups = KEY_BINS / SORT_WORKGROUP_SIZE;
        let (key_x, key_y) = dispatch_dims(plan.tiles().len() as u32);

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Particle Sort Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.key_pipeline);
        pass.set_bind_group(0, &key_bind_group, &[]);
        pass.dispatch_workgroups(key_x, key_y, 1);

        for (slots, sort_bind_group) in &segment_bind_groups {
            let (item_x, item_y) = dispatch_dims(slots.div_ceil(SORT_WORKGROUP_SIZE));

            pass.set_bind_group(0, sort_bind_group, &[]);
            pass.set_pipeline(&self.clear_pipeline);
            pass.dispatch_workgroups(bin_groups, 1, 1);
            pass.set_pipeline(&self.count_pipeline);
            pass.dispatch_workgroups(item_x, item_y, 1);

            pass.set_bind_group(0, &scan_bind_group, &[]);
            pass.set_pipeline(&self.scan_blocks_pipeline);
            pass.dispatch_workgroups(bin_groups, 1, 1);
            pass.set_pipeline(&self.scan_sums_pipeline);
            pass.dispatch_workgroups(1, 1, 1);
            pass.set_pipeline(&self.add_offsets_pipeline);
            pass.dispatch_workgroups(bin_groups, 1, 1);

            pass.set_bind_group(0, sort_bind_group, &[]);
            pass.set_pipeline(&self.scatter_pipeline);
            pass.dispatch_workgroups(item_x, item_y, 1);
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{pack_texel, unpack_texel};
    use crate::config::AtlasConfig;
    use crate::gpu::validate_wgsl;

    fn layout() -> AtlasLayout {
        AtlasLayout::new(AtlasConfig::new(64, 64, 8)).unwrap()
    }

    #[test]
    fn test_plan_records_offsets_in_order() {
        let mut plan = SortPlan::new(&layout());
        assert_eq!(plan.add(EmitterId(3), &[0, 5]), 0);
        assert_eq!(plan.add(EmitterId(1), &[7]), 128);
        assert_eq!(plan.particle_count(), 192);
        assert_eq!(plan.offset(EmitterId(1)), Some(128));
        assert_eq!(plan.range(EmitterId(3)), Some(0..128));
        assert_eq!(plan.offset(EmitterId(9)), None);
        assert_eq!(plan.tiles(), &[0, 5, 7]);

        plan.reset();
        assert!(plan.is_empty());
        assert!(plan.segments().is_empty());
    }

    #[test]
    fn test_farther_particles_sort_first() {
        let origin = Vec3::ZERO;
        let near = distance_key(Vec3::new(1.0, 0.0, 0.0), origin, true);
        let far = distance_key(Vec3::new(50.0, 0.0, 0.0), origin, true);
        let dead = distance_key(Vec3::new(1000.0, 0.0, 0.0), origin, false);
        assert!(far < near);
        assert!(near < dead);
        assert_eq!(dead, DEAD_KEY);
    }

    #[test]
    fn test_live_key_never_collides_with_dead() {
        assert!(distance_key(Vec3::ZERO, Vec3::ZERO, true) < DEAD_KEY);
    }

    /// Host copy of the clear, count, scan and scatter passes.
    fn sort_segments(keys: &[u32], values: &[u32], plan: &SortPlan) -> Vec<u32> {
        let mut sorted = vec![u32::MAX; keys.len()];
        for segment in plan.segments() {
            let range = segment.offset as usize..(segment.offset + segment.count) as usize;
            let mut histogram = vec![0u32; KEY_BINS as usize];
            for &key in &keys[range.clone()] {
                histogram[key as usize] += 1;
            }
            let mut running = 0;
            for bin in histogram.iter_mut() {
                let count = *bin;
                *bin = running;
                running += count;
            }
            for index in range {
                let destination = histogram[keys[index] as usize];
                histogram[keys[index] as usize] += 1;
                sorted[(segment.offset + destination) as usize] = values[index];
            }
        }
        sorted
    }

    #[test]
    fn test_each_segment_sorts_into_its_own_range() {
        // 8x4 atlas of 2x2 tiles: eight tiles of four slots.
        let layout = AtlasLayout::new(AtlasConfig::new(8, 4, 2)).unwrap();
        let mut plan = SortPlan::new(&layout);
        let near = EmitterId(1);
        let far = EmitterId(2);
        assert_eq!(plan.add(near, &[0]), 0);
        assert_eq!(plan.add(far, &[5]), 4);

        // Every particle of `far` is farther than every particle of `near`,
        // so one shared ordering would put `far` first.
        let distances = [[2.0, 4.0, 1.0, 0.0], [21.0, 25.0, 20.0, 22.0]];
        let alive = [[true, true, true, false], [true, true, true, true]];
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for (segment, &tile) in plan.tiles().iter().enumerate() {
            for slot in 0..layout.particles_per_tile() {
                let position = Vec3::new(distances[segment][slot as usize], 0.0, 0.0);
                keys.push(distance_key(position, Vec3::ZERO, alive[segment][slot as usize]));
                values.push(pack_texel(layout.slot_for_index(tile, slot)));
            }
        }

        let sorted = sort_segments(&keys, &values, &plan);
        let run = |range: Range<usize>| -> Vec<(u32, u32)> {
            sorted[range]
                .iter()
                .map(|&packed| {
                    let (tile, x, y) = layout.texel_to_slot(unpack_texel(packed));
                    (tile, y * layout.tile_size() + x)
                })
                .collect()
        };
        assert_eq!(run(0..4), vec![(0, 1), (0, 0), (0, 2), (0, 3)]);
        assert_eq!(run(4..8), vec![(5, 1), (5, 3), (5, 0), (5, 2)]);
    }

    #[test]
    fn test_sort_shaders_validate() {
        validate_wgsl(&key_shader(&layout())).expect("key WGSL should be valid");
        validate_wgsl(&sort_shader()).expect("sort WGSL should be valid");
        validate_wgsl(&scan_shader()).expect("scan WGSL should be valid");
    }
}
