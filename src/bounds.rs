//! Axis-aligned bounding boxes.
//!
//! Emitters carry a conservative world-space box used to select the vector
//! fields they overlap. The blocking GPU bounds query
//! ([`ParticleSimulationGpu::compute_bounds`](crate::gpu::ParticleSimulationGpu::compute_bounds))
//! reduces particle positions to per-group min/max pairs which are combined
//! here on the host.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Axis-aligned box. `min > max` on any axis marks an empty box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    /// The empty box; the identity for [`union`](Self::union).
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(-f32::MAX),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Box centered at `center` with the given half extents.
    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        let half = half_extents.abs();
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// True unless the box is empty.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grow to contain `point`.
    pub fn include_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Grow every face outward by `amount`.
    pub fn expanded(&self, amount: f32) -> Aabb {
        if !self.is_valid() {
            return *self;
        }
        Aabb {
            min: self.min - Vec3::splat(amount),
            max: self.max + Vec3::splat(amount),
        }
    }

    pub fn translated(&self, offset: Vec3) -> Aabb {
        if !self.is_valid() {
            return *self;
        }
        Aabb {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    /// Overlap test; touching faces count as intersecting.
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.min.cmple(other.max).all()
            && other.min.cmple(self.max).all()
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.min.cmple(point).all() && point.cmple(self.max).all()
    }

    /// Combine per-group `(min, max)` results from the GPU reduction.
    ///
    /// Groups that saw no live particle report `min > max` and are skipped; if
    /// every group is empty the result is [`Aabb::EMPTY`].
    pub fn from_group_results(groups: &[[f32; 4]]) -> Aabb {
        groups
            .chunks_exact(2)
            .map(|pair| Aabb {
                min: Vec3::new(pair[0][0], pair[0][1], pair[0][2]),
                max: Vec3::new(pair[1][0], pair[1][1], pair[1][2]),
            })
            .filter(Aabb::is_valid)
            .fold(Aabb::EMPTY, |acc, group| acc.union(&group))
    }
}
