//! Vector fields and the per-dispatch field combiner.
//!
//! A [`VectorFieldResource`] is a 3D grid of force vectors. A
//! [`VectorFieldInstance`] places a resource in the world with its own
//! transform, bounds, intensity and tightness. World-space instances live in a
//! [`VectorFieldRegistry`]; an emitter may also carry one local instance.
//!
//! Each simulation dispatch samples at most [`MAX_VECTOR_FIELDS`] fields.
//! [`combine_vector_fields`] picks them:
//!
//! 1. The emitter's local field, if its intensity is non-zero, takes slot 0.
//! 2. Registered world fields whose bounds intersect the emitter bounds fill
//!    the remaining slots in registration order, until the slots run out.
//! 3. Remaining slots are neutral.
//!
//! Selection is first-registered, first-selected. When more fields overlap an
//! emitter than there are slots, which ones are dropped depends only on
//! registration order, not on distance or strength.

use std::sync::Arc;

use glam::{Mat4, UVec3, Vec3};

use crate::bounds::Aabb;
use crate::uniforms::{VectorFieldUniforms, MAX_VECTOR_FIELDS};

/// Identifies a vector field volume on the GPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VectorFieldId(pub u32);

/// A 3D grid of force vectors.
#[derive(Clone, Debug)]
pub struct VectorFieldResource {
    pub id: VectorFieldId,
    /// Grid resolution per axis.
    pub size: UVec3,
    /// Resource-wide intensity multiplier.
    pub intensity: f32,
    /// `size.x × size.y × size.z` vectors, x fastest; w is ignored.
    pub data: Vec<[f32; 4]>,
}

impl VectorFieldResource {
    /// Build a resource from a generator evaluated at each cell's normalized
    /// center (`[0, 1]³`).
    pub fn from_fn(id: VectorFieldId, size: UVec3, intensity: f32, f: impl Fn(Vec3) -> Vec3) -> Self {
        let size = size.max(UVec3::ONE);
        let mut data = Vec::with_capacity((size.x * size.y * size.z) as usize);
        for z in 0..size.z {
            for y in 0..size.y {
                for x in 0..size.x {
                    let uvw = (Vec3::new(x as f32, y as f32, z as f32) + 0.5) / size.as_vec3();
                    data.push(f(uvw).extend(0.0).to_array());
                }
            }
        }
        Self { id, size, intensity, data }
    }

    /// A field pushing uniformly along `force`.
    pub fn uniform(id: VectorFieldId, force: Vec3) -> Self {
        Self::from_fn(id, UVec3::ONE, 1.0, |_| force)
    }
}

/// A vector field placed in the world.
#[derive(Clone, Debug)]
pub struct VectorFieldInstance {
    pub resource: Arc<VectorFieldResource>,
    /// Maps world positions into `[0, 1]³` volume coordinates.
    pub world_to_volume: Mat4,
    /// Rotates volume vectors into world space (no scale).
    pub volume_to_world: Mat4,
    /// World-space bounds of the volume.
    pub bounds: Aabb,
    pub intensity: f32,
    /// 0 = field adds force, 1 = field dictates velocity.
    pub tightness: f32,
    pub tile_x: bool,
    pub tile_y: bool,
    pub tile_z: bool,
}

impl VectorFieldInstance {
    /// Place `resource` so its volume spans `bounds` with the given rotation.
    pub fn new(resource: Arc<VectorFieldResource>, bounds: Aabb, rotation: glam::Quat) -> Self {
        let mut instance = Self {
            resource,
            world_to_volume: Mat4::IDENTITY,
            volume_to_world: Mat4::IDENTITY,
            bounds,
            intensity: 1.0,
            tightness: 0.0,
            tile_x: false,
            tile_y: false,
            tile_z: false,
        };
        instance.update_transforms(bounds, rotation);
        instance
    }

    /// Recompute transforms and world bounds for a new placement.
    pub fn update_transforms(&mut self, volume_bounds: Aabb, rotation: glam::Quat) {
        let extent = (volume_bounds.max - volume_bounds.min).max(Vec3::splat(1e-6));
        let volume_to_world_scaled = Mat4::from_rotation_translation(rotation, volume_bounds.center())
            * Mat4::from_scale(extent)
            * Mat4::from_translation(Vec3::splat(-0.5));
        self.world_to_volume = volume_to_world_scaled.inverse();
        self.volume_to_world = Mat4::from_quat(rotation);

        // World bounds of the rotated volume.
        let mut bounds = Aabb::EMPTY;
        for corner in 0..8u32 {
            let uvw = Vec3::new(
                (corner & 1) as f32,
                ((corner >> 1) & 1) as f32,
                ((corner >> 2) & 1) as f32,
            );
            bounds.include_point(volume_to_world_scaled.transform_point3(uvw));
        }
        self.bounds = bounds;
    }

    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_tightness(mut self, tightness: f32) -> Self {
        self.tightness = tightness;
        self
    }

    pub fn with_tiling(mut self, x: bool, y: bool, z: bool) -> Self {
        self.tile_x = x;
        self.tile_y = y;
        self.tile_z = z;
        self
    }

    /// Intensity after resource and emitter scaling.
    pub fn effective_intensity(&self, emitter_scale: f32) -> f32 {
        self.intensity * self.resource.intensity * emitter_scale
    }

    /// Write this instance into `slot` of `out`.
    ///
    /// A `tightness_override` of `-1` keeps the instance's own (clamped)
    /// tightness; any other value replaces it.
    pub fn write_slot(&self, out: &mut VectorFieldUniforms, slot: usize, emitter_scale: f32, tightness_override: f32) {
        debug_assert!(slot < MAX_VECTOR_FIELDS);
        let tightness = if tightness_override == -1.0 {
            self.tightness.clamp(0.0, 1.0)
        } else {
            tightness_override
        };
        let size = self.resource.size.as_vec3();
        out.world_to_volume[slot] = self.world_to_volume.to_cols_array_2d();
        out.volume_to_world[slot] = self.volume_to_world.to_cols_array_2d();
        out.volume_size[slot] = [size.x, size.y, size.z, 0.0];
        out.intensity_tightness[slot] = [self.effective_intensity(emitter_scale), tightness, 0.0, 0.0];
        out.tiling_axes[slot] = [
            if self.tile_x { 1.0 } else { 0.0 },
            if self.tile_y { 1.0 } else { 0.0 },
            if self.tile_z { 1.0 } else { 0.0 },
            0.0,
        ];
    }
}

/// Handle of a field registered with a [`VectorFieldRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldHandle(u64);

/// Ordered registry of world-space vector fields.
#[derive(Default)]
pub struct VectorFieldRegistry {
    fields: Vec<(FieldHandle, VectorFieldInstance)>,
    next_handle: u64,
}

impl VectorFieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field; it ranks after every field already registered.
    pub fn register(&mut self, instance: VectorFieldInstance) -> FieldHandle {
        let handle = FieldHandle(self.next_handle);
        self.next_handle += 1;
        self.fields.push((handle, instance));
        handle
    }

    pub fn unregister(&mut self, handle: FieldHandle) -> Option<VectorFieldInstance> {
        let idx = self.fields.iter().position(|(h, _)| *h == handle)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn get_mut(&mut self, handle: FieldHandle) -> Option<&mut VectorFieldInstance> {
        self.fields.iter_mut().find(|(h, _)| *h == handle).map(|(_, f)| f)
    }

    /// Fields in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &VectorFieldInstance> {
        self.fields.iter().map(|(_, f)| f)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Fields chosen for one dispatch: the packed parameters plus the volume to
/// bind in each slot (`None` binds an empty volume).
#[derive(Clone, Debug, PartialEq)]
pub struct CombinedVectorFields {
    pub uniforms: VectorFieldUniforms,
    pub volumes: [Option<VectorFieldId>; MAX_VECTOR_FIELDS],
}

impl Default for CombinedVectorFields {
    fn default() -> Self {
        Self {
            uniforms: VectorFieldUniforms::neutral(),
            volumes: [None; MAX_VECTOR_FIELDS],
        }
    }
}

/// Emitter-side scaling of world fields.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GlobalFieldResponse {
    /// Multiplier on world field intensity; 0 ignores world fields.
    pub scale: f32,
    /// Tightness override for world fields; -1 keeps each field's own.
    pub tightness: f32,
}

impl Default for GlobalFieldResponse {
    fn default() -> Self {
        Self {
            scale: 1.0,
            tightness: -1.0,
        }
    }
}

/// Select and pack the vector fields affecting an emitter.
pub fn combine_vector_fields(
    local: Option<&VectorFieldInstance>,
    registry: &VectorFieldRegistry,
    emitter_bounds: &Aabb,
    global: GlobalFieldResponse,
) -> CombinedVectorFields {
    let mut combined = CombinedVectorFields::default();
    let mut count = 0usize;

    if let Some(local) = local {
        if local.effective_intensity(1.0).abs() > 0.0 {
            local.write_slot(&mut combined.uniforms, count, 1.0, -1.0);
            combined.volumes[count] = Some(local.resource.id);
            count += 1;
        }
    }

    if global.scale.abs() > 0.0 {
        for field in registry.iter() {
            if count >= MAX_VECTOR_FIELDS {
                break;
            }
            if field.effective_intensity(global.scale).abs() > 0.0
                && field.bounds.intersects(emitter_bounds)
            {
                field.write_slot(&mut combined.uniforms, count, global.scale, global.tightness);
                combined.volumes[count] = Some(field.resource.id);
                count += 1;
            }
        }
    }

    combined.uniforms.count = [count as u32, 0, 0, 0];
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    fn field_at(id: u32, center: Vec3, intensity: f32) -> VectorFieldInstance {
        let resource = Arc::new(VectorFieldResource::uniform(VectorFieldId(id), Vec3::X));
        VectorFieldInstance::new(
            resource,
            Aabb::from_center_half_extents(center, Vec3::ONE),
            Quat::IDENTITY,
        )
        .with_intensity(intensity)
    }

    #[test]
    fn test_two_of_six_world_fields_intersect() {
        let mut registry = VectorFieldRegistry::new();
        registry.register(field_at(1, Vec3::new(50.0, 0.0, 0.0), 1.0));
        registry.register(field_at(2, Vec3::new(0.5, 0.0, 0.0), 1.0));
        registry.register(field_at(3, Vec3::new(0.0, 60.0, 0.0), 1.0));
        registry.register(field_at(4, Vec3::new(0.0, 0.0, -70.0), 1.0));
        registry.register(field_at(5, Vec3::new(-0.5, 0.5, 0.0), 2.0));
        registry.register(field_at(6, Vec3::new(80.0, 80.0, 80.0), 1.0));

        let local = field_at(100, Vec3::ZERO, 0.0);
        let emitter_bounds = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE);
        let combined = combine_vector_fields(
            Some(&local),
            &registry,
            &emitter_bounds,
            GlobalFieldResponse::default(),
        );

        assert_eq!(combined.uniforms.active_slots(), 2);
        assert_eq!(combined.uniforms.count[0], 2);
        // The zero-intensity local field does not claim slot 0.
        assert_eq!(combined.volumes, [Some(VectorFieldId(2)), Some(VectorFieldId(5)), None, None]);
        assert_eq!(combined.uniforms.intensity_tightness[1][0], 2.0);
        for slot in 2..MAX_VECTOR_FIELDS {
            assert!(combined.uniforms.is_neutral(slot));
            assert_eq!(combined.uniforms.world_to_volume[slot], Mat4::IDENTITY.to_cols_array_2d());
            assert_eq!(combined.uniforms.volume_size[slot][..3], [1.0, 1.0, 1.0]);
        }
    }

    #[test]
    fn test_local_field_takes_slot_zero() {
        let mut registry = VectorFieldRegistry::new();
        registry.register(field_at(1, Vec3::ZERO, 1.0));
        let local = field_at(100, Vec3::ZERO, 0.5).with_tightness(3.0);
        let bounds = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE);
        let combined = combine_vector_fields(Some(&local), &registry, &bounds, GlobalFieldResponse::default());
        assert_eq!(combined.volumes[0], Some(VectorFieldId(100)));
        assert_eq!(combined.volumes[1], Some(VectorFieldId(1)));
        // Local tightness is clamped to [0, 1].
        assert_eq!(combined.uniforms.intensity_tightness[0], [0.5, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_registration_order_wins_when_slots_run_out() {
        let mut registry = VectorFieldRegistry::new();
        for id in 1..=6 {
            registry.register(field_at(id, Vec3::ZERO, 1.0));
        }
        let bounds = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE);
        let combined = combine_vector_fields(None, &registry, &bounds, GlobalFieldResponse::default());
        assert_eq!(
            combined.volumes,
            [Some(VectorFieldId(1)), Some(VectorFieldId(2)), Some(VectorFieldId(3)), Some(VectorFieldId(4))]
        );
    }

    #[test]
    fn test_zero_global_scale_ignores_world_fields() {
        let mut registry = VectorFieldRegistry::new();
        registry.register(field_at(1, Vec3::ZERO, 1.0));
        let bounds = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE);
        let combined = combine_vector_fields(
            None,
            &registry,
            &bounds,
            GlobalFieldResponse { scale: 0.0, tightness: -1.0 },
        );
        assert_eq!(combined.uniforms.active_slots(), 0);
    }

    #[test]
    fn test_global_scale_and_tightness_override() {
        let mut registry = VectorFieldRegistry::new();
        registry.register(field_at(1, Vec3::ZERO, 2.0).with_tightness(0.1));
        let bounds = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE);
        let combined = combine_vector_fields(
            None,
            &registry,
            &bounds,
            GlobalFieldResponse { scale: 0.5, tightness: 0.75 },
        );
        assert_eq!(combined.uniforms.intensity_tightness[0][..2], [1.0, 0.75]);
    }

    #[test]
    fn test_unregister_keeps_order() {
        let mut registry = VectorFieldRegistry::new();
        let a = registry.register(field_at(1, Vec3::ZERO, 1.0));
        registry.register(field_at(2, Vec3::ZERO, 1.0));
        registry.register(field_at(3, Vec3::ZERO, 1.0));
        assert!(registry.unregister(a).is_some());
        assert!(registry.unregister(a).is_none());
        let ids: Vec<_> = registry.iter().map(|f| f.resource.id.0).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_world_to_volume_maps_bounds_to_unit_cube() {
        let field = field_at(1, Vec3::new(2.0, 0.0, 0.0), 1.0);
        let lo = field.world_to_volume.transform_point3(Vec3::new(1.0, -1.0, -1.0));
        let hi = field.world_to_volume.transform_point3(Vec3::new(3.0, 1.0, 1.0));
        assert!((lo - Vec3::ZERO).length() < 1e-5);
        assert!((hi - Vec3::ONE).length() < 1e-5);
        assert!((field.bounds.min - Vec3::new(1.0, -1.0, -1.0)).length() < 1e-5);
    }

    #[test]
    fn test_resource_from_fn_layout() {
        let resource = VectorFieldResource::from_fn(VectorFieldId(9), UVec3::new(2, 1, 1), 1.0, |uvw| uvw);
        assert_eq!(resource.data.len(), 2);
        assert_eq!(resource.data[0][0], 0.25);
        assert_eq!(resource.data[1][0], 0.75);
    }
}
