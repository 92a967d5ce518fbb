//! 3D volume textures for vector fields.

use std::collections::HashMap;

use log::{debug, warn};

use crate::uniforms::MAX_VECTOR_FIELDS;
use crate::vector_field::{VectorFieldId, VectorFieldResource};

const VOLUME_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

struct Volume {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// Uploaded vector field volumes keyed by resource id.
///
/// Slots with no field bind a 1×1×1 zero volume.
pub struct VectorFieldVolumes {
    volumes: HashMap<VectorFieldId, Volume>,
    empty: Volume,
}

fn create_volume(device: &wgpu::Device, label: &str, size: glam::UVec3) -> Volume {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: size.x,
            height: size.y,
            depth_or_array_layers: size.z,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D3,
        format: VOLUME_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    Volume {
        texture,
        view,
    }
}

impl VectorFieldVolumes {
    pub fn new(device: &wgpu::Device) -> Self {
        Self {
            volumes: HashMap::new(),
            empty: create_volume(device, "Empty Vector Field", glam::UVec3::ONE),
        }
    }

    /// Upload (or replace) the volume for `resource`.
    pub fn upload(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, resource: &VectorFieldResource) {
        let size = resource.size.max(glam::UVec3::ONE);
        let expected = (size.x * size.y * size.z) as usize;
        if resource.data.len() != expected {
            warn!(
                "Vector field {:?}: {} cells for a {}x{}x{} volume; not uploaded",
                resource.id,
                resource.data.len(),
                size.x,
                size.y,
                size.z
            );
            return;
        }

        let volume = create_volume(device, &format!("Vector Field {}", resource.id.0), size);
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &volume.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&resource.data),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.x * 16),
                rows_per_image: Some(size.y),
            },
            wgpu::Extent3d {
                width: size.x,
                height: size.y,
                depth_or_array_layers: size.z,
            },
        );
        debug!("Uploaded vector field {:?} ({}x{}x{})", resource.id, size.x, size.y, size.z);
        self.volumes.insert(resource.id, volume);
    }

    pub fn remove(&mut self, id: VectorFieldId) -> bool {
        self.volumes.remove(&id).is_some()
    }

    pub fn contains(&self, id: VectorFieldId) -> bool {
        self.volumes.contains_key(&id)
    }

    /// Views to bind for each slot. Ids never uploaded bind the empty volume,
    /// which samples as zero force.
    pub fn slot_views(&self, ids: &[Option<VectorFieldId>; MAX_VECTOR_FIELDS]) -> [&wgpu::TextureView; MAX_VECTOR_FIELDS] {
        (*ids).map(|id| {
            id.and_then(|id| self.volumes.get(&id))
                .map_or(&self.empty.view, |volume| &volume.view)
        })
    }
}
