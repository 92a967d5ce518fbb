//! GPU consumer of frame batches.
//!
//! [`ParticleSimulationGpu`] owns the state textures, the vector field volumes
//! and every compute pipeline. Each frame it flips the state copies, runs the
//! Main and Collision simulation passes (each followed by its clear and inject
//! passes), optionally sorts the sorted emitters back-to-front, and submits.
//! Nothing is read back except by [`ParticleSimulationGpu::compute_bounds`].

mod bounds;
mod inject;
mod simulate;
mod sort;
mod state_textures;
mod vector_field_gpu;

use std::sync::Arc;

use bytemuck::Pod;
use glam::{Mat4, Vec3};
use log::{debug, info, warn};

pub use bounds::{bounds_group_count, bounds_shader, BoundsReducer, BOUNDS_WORKGROUP_SIZE, MAX_BOUNDS_GROUPS};
pub use inject::{
    clear_shader, inject_shader, split_batches, InjectionPipelines, CLEARED_RELATIVE_TIME,
    DEFAULT_MAX_INJECTION_BATCH, INJECT_WORKGROUP_SIZE,
};
pub use simulate::{simulation_shader, SimulationPipelines};
pub use sort::{distance_key, key_shader, scan_shader, sort_shader, GpuSorter, SortPlan, SortSegment, DEAD_KEY};
pub use state_textures::{StateTextures, STATE_FORMAT};
pub use vector_field_gpu::VectorFieldVolumes;

use crate::atlas::AtlasLayout;
use crate::bounds::Aabb;
use crate::emitter::EmitterInstance;
use crate::error::GpuError;
use crate::frame::{EmitterCommand, EmitterId, FrameBatch, SimulationPhase};
use crate::state::{ParticleStateStore, PassRevisions};
use crate::vector_field::VectorFieldResource;

/// Largest workgroup count per dispatch dimension.
pub const MAX_DISPATCH_DIMENSION: u32 = 65535;

/// Device and queue shared with the host renderer.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl GpuContext {
    /// Wrap a device the renderer already created.
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }

    /// Create a device with no surface, for tools and tests.
    pub fn headless() -> Result<Self, GpuError> {
        pollster::block_on(Self::request_headless())
    }

    async fn request_headless() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;
        let adapter_info = adapter.get_info();
        info!("Using adapter {} ({:?})", adapter_info.name, adapter_info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Particle Simulation Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;

        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }
}

/// Scene depth and normals for the Collision phase.
pub struct CollisionView<'a> {
    /// Depth32Float scene depth.
    pub depth: &'a wgpu::TextureView,
    /// World-space normals in xyz.
    pub normals: &'a wgpu::TextureView,
    pub view_proj: Mat4,
    pub width: u32,
    pub height: u32,
}

/// What one executed frame did on the GPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub simulated_tiles: u32,
    pub cleared_tiles: u32,
    pub injected_particles: u32,
    pub injection_dispatches: u32,
    /// Passes refused because they already ran against the same revisions.
    pub skipped_passes: u32,
    /// Collision commands simulated in Main for lack of a collision view.
    pub collision_fallbacks: u32,
    pub sorted_particles: u32,
}

pub(crate) fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn storage_buffer_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Unfilterable float texture; state and volumes are Rgba32Float.
pub(crate) fn texture_entry(binding: u32, view_dimension: wgpu::TextureViewDimension) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension,
            multisampled: false,
        },
        count: None,
    }
}

pub(crate) fn depth_texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Depth,
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

pub(crate) fn storage_texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: STATE_FORMAT,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

pub(crate) fn create_compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    bind_group_layout: &wgpu::BindGroupLayout,
) -> wgpu::ComputePipeline {
    create_compute_pipeline_entry(device, label, source, "main", bind_group_layout)
}

pub(crate) fn create_compute_pipeline_entry(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    entry_point: &str,
    bind_group_layout: &wgpu::BindGroupLayout,
) -> wgpu::ComputePipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[bind_group_layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

/// Bind group whose entries are `buffers` at bindings 0, 1, 2, ...
pub(crate) fn buffer_bind_group(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    buffers: &[&wgpu::Buffer],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(binding, buffer)| wgpu::BindGroupEntry {
            binding: binding as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &entries,
    })
}

/// Split `groups` workgroups into a 2D grid within the per-dimension limit.
/// Shaders linearize with `id.x + id.y * num_workgroups.x` and bounds-check.
pub fn dispatch_dims(groups: u32) -> (u32, u32) {
    if groups <= MAX_DISPATCH_DIMENSION {
        (groups, 1)
    } else {
        (MAX_DISPATCH_DIMENSION, groups.div_ceil(MAX_DISPATCH_DIMENSION))
    }
}

/// Map `buffer` and copy out its first `size` bytes. Blocks until the GPU is done.
pub(crate) fn read_buffer<T: Pod>(device: &wgpu::Device, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<T>, GpuError> {
    let slice = buffer.slice(..size);
    let (sender, receiver) = crossbeam_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device.poll(wgpu::Maintain::Wait);

    match receiver.recv() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(GpuError::BufferMapping(err.to_string())),
        Err(_) => return Err(GpuError::BufferMapping("map callback never ran".into())),
    }
    let values = {
        let data = slice.get_mapped_range();
        bytemuck::cast_slice::<u8, T>(&data).to_vec()
    };
    buffer.unmap();
    Ok(values)
}

/// Check that `layout` fits the texture and buffer limits of a device.
///
/// The state textures are `width × height` and the sort keeps three `u32`
/// buffers with one entry per slot.
pub fn check_device_limits(layout: &AtlasLayout, limits: &wgpu::Limits) -> Result<(), GpuError> {
    let max_dimension = limits.max_texture_dimension_2d;
    if layout.width() > max_dimension || layout.height() > max_dimension {
        return Err(GpuError::AtlasTooLarge(format!(
            "{}x{} atlas, device textures are limited to {}",
            layout.width(),
            layout.height(),
            max_dimension
        )));
    }
    let sort_bytes = layout.particle_capacity() * 4;
    let max_binding = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
    if sort_bytes > max_binding {
        return Err(GpuError::AtlasTooLarge(format!(
            "sort buffers need {} bytes, device storage bindings are limited to {}",
            sort_bytes, max_binding
        )));
    }
    Ok(())
}

/// GPU half of the particle system.
pub struct ParticleSimulationGpu {
    context: GpuContext,
    layout: AtlasLayout,
    state: ParticleStateStore,
    textures: StateTextures,
    volumes: VectorFieldVolumes,
    simulation: SimulationPipelines,
    injection: InjectionPipelines,
    sorter: GpuSorter,
    sort_plan: SortPlan,
    bounds: BoundsReducer,
}

impl ParticleSimulationGpu {
    pub fn new(context: &GpuContext, layout: AtlasLayout) -> Result<Self, GpuError> {
        let device = &context.device;
        check_device_limits(&layout, &device.limits())?;
        info!(
            "Creating particle atlas {}x{} ({} tiles of {} particles)",
            layout.width(),
            layout.height(),
            layout.tile_count(),
            layout.particles_per_tile()
        );
        Ok(Self {
            context: context.clone(),
            state: ParticleStateStore::new(),
            textures: StateTextures::new(device, &layout),
            volumes: VectorFieldVolumes::new(device),
            simulation: SimulationPipelines::new(device, &layout),
            injection: InjectionPipelines::new(device, &layout),
            sorter: GpuSorter::new(device, &layout),
            sort_plan: SortPlan::new(&layout),
            bounds: BoundsReducer::new(device, &layout),
            layout,
        })
    }

    pub fn layout(&self) -> &AtlasLayout {
        &self.layout
    }

    pub fn state(&self) -> &ParticleStateStore {
        &self.state
    }

    pub fn textures(&self) -> &StateTextures {
        &self.textures
    }

    /// Position view a renderer should read this frame.
    pub fn current_position_view(&self) -> &wgpu::TextureView {
        self.textures.position_view(self.state.current_parity())
    }

    pub fn current_velocity_view(&self) -> &wgpu::TextureView {
        self.textures.velocity_view(self.state.current_parity())
    }

    /// Packed texels of the last sort. Each sorted emitter owns a contiguous
    /// run, farthest particle first.
    pub fn sorted_indices(&self) -> &wgpu::Buffer {
        self.sorter.sorted_indices()
    }

    pub fn sorted_count(&self) -> u32 {
        self.sorter.sorted_count()
    }

    /// Where `emitter`'s run starts in [`sorted_indices`](Self::sorted_indices).
    pub fn sorted_offset(&self, emitter: EmitterId) -> Option<u32> {
        self.sort_plan.offset(emitter)
    }

    /// `emitter`'s run in [`sorted_indices`](Self::sorted_indices), dead slots last.
    pub fn sorted_range(&self, emitter: EmitterId) -> Option<std::ops::Range<u32>> {
        self.sort_plan.range(emitter)
    }

    /// Read the last sort back to the host. Stalls like
    /// [`compute_bounds`](Self::compute_bounds).
    pub fn read_sorted_indices(&self) -> Result<Vec<u32>, GpuError> {
        self.sorter.read_sorted(&self.context.device, &self.context.queue)
    }

    pub fn set_max_injection_batch(&mut self, max_batch: usize) {
        self.injection.set_max_batch(max_batch);
    }

    pub fn upload_vector_field(&mut self, resource: &VectorFieldResource) {
        self.volumes.upload(&self.context.device, &self.context.queue, resource);
    }

    pub fn remove_vector_field(&mut self, resource: &VectorFieldResource) -> bool {
        self.volumes.remove(resource.id)
    }

    /// Execute one batch: both simulation phases, then the sort.
    pub fn execute_frame(&mut self, batch: &FrameBatch, collision: Option<&CollisionView<'_>>) -> FrameStats {
        if let Some(max_batch) = batch.max_injection_batch {
            self.injection.set_max_batch(max_batch as usize);
        }
        self.begin_frame();
        let mut stats = FrameStats::default();

        let (collision_commands, main_commands): (Vec<&EmitterCommand>, Vec<&EmitterCommand>) = batch
            .commands
            .iter()
            .partition(|c| c.phase == SimulationPhase::Collision && collision.is_some());
        if collision.is_none() {
            let fallbacks = batch
                .commands
                .iter()
                .filter(|c| c.phase == SimulationPhase::Collision)
                .count() as u32;
            if fallbacks > 0 {
                debug!("No collision view; simulating {} collision emitters in Main", fallbacks);
            }
            stats.collision_fallbacks = fallbacks;
        }

        self.simulate(SimulationPhase::Main, &main_commands, None, &mut stats);
        self.simulate(SimulationPhase::Collision, &collision_commands, collision, &mut stats);

        if let Some(origin) = batch.sort_origin {
            let sorted: Vec<&EmitterCommand> = batch.commands.iter().filter(|c| c.sorted).collect();
            stats.sorted_particles = self.sort(&sorted, origin);
        }

        self.end_frame();
        debug!("Frame {} executed: {:?}", batch.frame, stats);
        stats
    }

    /// Flip the state copies. Every owned tile must be simulated before
    /// [`end_frame`](Self::end_frame).
    pub fn begin_frame(&mut self) {
        let revision = self.state.begin_frame();
        debug!(
            "Frame {} writes revision {} into {:?}",
            self.state.frame(),
            revision.0,
            self.state.current_parity()
        );
    }

    pub fn end_frame(&mut self) {
        self.state.end_frame();
    }

    /// Simulate, clear and inject `commands` for one phase.
    ///
    /// A phase runs at most once per frame; a repeated request is skipped and
    /// counted in `stats`.
    pub fn simulate(
        &mut self,
        phase: SimulationPhase,
        commands: &[&EmitterCommand],
        collision: Option<&CollisionView<'_>>,
        stats: &mut FrameStats,
    ) {
        if commands.is_empty() {
            return;
        }
        let Some(PassRevisions { dest_parity, .. }) = self.state.try_begin_pass(phase) else {
            debug!("{:?} pass already ran for this frame; skipping", phase);
            stats.skipped_passes += 1;
            return;
        };
        let collision = if phase == SimulationPhase::Collision { collision } else { None };

        let device = &self.context.device;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Particle Simulation Encoder"),
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Particle Simulate Pass"),
                timestamp_writes: None,
            });
            for command in commands {
                self.simulation
                    .encode(device, &mut pass, &self.textures, dest_parity, command, &self.volumes, collision);
                stats.simulated_tiles += command.tiles.len() as u32;
            }
        }

        if commands.iter().any(|c| !c.tiles_to_clear.is_empty()) {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Particle Clear Pass"),
                timestamp_writes: None,
            });
            for command in commands {
                self.injection
                    .encode_clear(device, &mut pass, &self.textures, dest_parity, &command.tiles_to_clear);
                stats.cleared_tiles += command.tiles_to_clear.len() as u32;
            }
        }

        if commands.iter().any(|c| !c.spawns.is_empty()) {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Particle Inject Pass"),
                timestamp_writes: None,
            });
            for command in commands {
                stats.injection_dispatches +=
                    self.injection
                        .encode_inject(device, &mut pass, &self.textures, dest_parity, &command.spawns);
                stats.injected_particles += command.spawns.len() as u32;
            }
        }

        self.context.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Sort the particles of `commands` back-to-front from `origin`.
    /// Returns the number of sorted slots.
    pub fn sort(&mut self, commands: &[&EmitterCommand], origin: Vec3) -> u32 {
        self.sort_plan.reset();
        for command in commands {
            self.sort_plan.add(command.emitter, &command.tiles);
        }
        if self.sort_plan.is_empty() {
            return 0;
        }

        let device = &self.context.device;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Particle Sort Encoder"),
        });
        let positions = self.textures.position_view(self.state.current_parity());
        let count = self.sorter.encode(device, &mut encoder, positions, &self.sort_plan, origin);
        self.context.queue.submit(std::iter::once(encoder.finish()));
        count
    }

    /// Bounding box of the live particles in `tiles`, read back synchronously.
    ///
    /// Stalls until the GPU catches up; meant for editor queries, not for
    /// per-frame use. Mid-frame it reads the last completed frame.
    pub fn compute_bounds(&self, tiles: &[u32]) -> Result<Aabb, GpuError> {
        if self.state.in_frame() {
            warn!("Bounds query issued mid-frame; this stalls the GPU queue");
        }
        let positions = self.textures.position_view(self.state.completed_parity());
        self.bounds.compute(
            &self.context.device,
            &self.context.queue,
            &self.layout,
            positions,
            tiles,
        )
    }

    /// Bounds of an emitter's live particles, grown by its largest sprite so
    /// the box covers the rendered quads.
    pub fn compute_emitter_bounds(&self, emitter: &EmitterInstance) -> Result<Aabb, GpuError> {
        let bounds = self.compute_bounds(emitter.tiles())?;
        Ok(bounds.expanded(emitter.config().max_sprite_size()))
    }
}

#[cfg(test)]
pub(crate) fn validate_wgsl(code: &str) -> Result<(), String> {
    let module = naga::front::wgsl::parse_str(code).map_err(|e| format!("Parse error: {:?}", e))?;
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator
        .validate(&module)
        .map_err(|e| format!("Validation error: {:?}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AtlasConfig;

    #[test]
    fn test_dispatch_dims_within_limit() {
        assert_eq!(dispatch_dims(0), (0, 1));
        assert_eq!(dispatch_dims(100), (100, 1));
        assert_eq!(dispatch_dims(MAX_DISPATCH_DIMENSION), (MAX_DISPATCH_DIMENSION, 1));
    }

    #[test]
    fn test_dispatch_dims_spills_into_y() {
        let (x, y) = dispatch_dims(MAX_DISPATCH_DIMENSION * 2 + 1);
        assert_eq!(x, MAX_DISPATCH_DIMENSION);
        assert_eq!(y, 3);
        assert!(x * y >= MAX_DISPATCH_DIMENSION * 2 + 1);
    }

    #[test]
    fn test_atlas_within_default_limits() {
        let layout = AtlasLayout::new(AtlasConfig::default()).unwrap();
        assert!(check_device_limits(&layout, &wgpu::Limits::default()).is_ok());
    }

    #[test]
    fn test_atlas_wider_than_device_textures_is_rejected() {
        let layout = AtlasLayout::new(AtlasConfig::new(16384, 16, 4)).unwrap();
        let limits = wgpu::Limits::downlevel_defaults();
        assert!(matches!(
            check_device_limits(&layout, &limits),
            Err(GpuError::AtlasTooLarge(_))
        ));
    }

    #[test]
    fn test_atlas_too_large_to_sort_is_rejected() {
        let layout = AtlasLayout::new(AtlasConfig::new(8192, 8192, 4)).unwrap();
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        };
        // 64M slots need 256 MiB of sort keys.
        assert!(check_device_limits(&layout, &limits).is_err());
    }

    #[test]
    fn test_stats_default_is_zero() {
        let stats = FrameStats::default();
        assert_eq!(stats.simulated_tiles, 0);
        assert_eq!(stats.skipped_passes, 0);
    }
}
