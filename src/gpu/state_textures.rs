//! Atlas-resolution textures holding particle state.

use crate::atlas::AtlasLayout;
use crate::state::BufferParity;

pub const STATE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

/// Position and velocity in two copies each, plus the single-copy attribute
/// atlases written only at injection.
pub struct StateTextures {
    position: [wgpu::Texture; 2],
    velocity: [wgpu::Texture; 2],
    position_views: [wgpu::TextureView; 2],
    velocity_views: [wgpu::TextureView; 2],
    pub render_attributes: wgpu::Texture,
    pub render_attributes_view: wgpu::TextureView,
    pub simulation_attributes: wgpu::Texture,
    pub simulation_attributes_view: wgpu::TextureView,
    width: u32,
    height: u32,
}

fn create_state_texture(device: &wgpu::Device, label: &str, width: u32, height: u32) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: STATE_FORMAT,
        usage: wgpu::TextureUsages::STORAGE_BINDING
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

impl StateTextures {
    pub fn new(device: &wgpu::Device, layout: &AtlasLayout) -> Self {
        let (width, height) = (layout.width(), layout.height());
        let position = [
            create_state_texture(device, "Particle Position A", width, height),
            create_state_texture(device, "Particle Position B", width, height),
        ];
        let velocity = [
            create_state_texture(device, "Particle Velocity A", width, height),
            create_state_texture(device, "Particle Velocity B", width, height),
        ];
        let render_attributes = create_state_texture(device, "Particle Render Attributes", width, height);
        let simulation_attributes =
            create_state_texture(device, "Particle Simulation Attributes", width, height);

        let view = |t: &wgpu::Texture| t.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            position_views: [view(&position[0]), view(&position[1])],
            velocity_views: [view(&velocity[0]), view(&velocity[1])],
            render_attributes_view: view(&render_attributes),
            simulation_attributes_view: view(&simulation_attributes),
            position,
            velocity,
            render_attributes,
            simulation_attributes,
            width,
            height,
        }
    }

    pub fn position(&self, parity: BufferParity) -> &wgpu::Texture {
        &self.position[parity.index()]
    }

    pub fn velocity(&self, parity: BufferParity) -> &wgpu::Texture {
        &self.velocity[parity.index()]
    }

    pub fn position_view(&self, parity: BufferParity) -> &wgpu::TextureView {
        &self.position_views[parity.index()]
    }

    pub fn velocity_view(&self, parity: BufferParity) -> &wgpu::TextureView {
        &self.velocity_views[parity.index()]
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
