//! Geometric primitives shared by every collision phase.
//!
//! - [`Aabb`] - local-space boxes stored in BVH nodes
//! - [`BoundingSphere`] - world-space broad-phase volume
//! - [`Triangle`] - three vertex positions
//! - [`Obb`] - oriented boxes and the separating axis test
//! - [`triangles_intersect`] - exact triangle-triangle test

mod obb;
mod triangle;

pub use obb::Obb;
pub use triangle::{triangles_intersect, Triangle};

use glam::{Mat4, Vec3};

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Box that contains nothing; merging anything into it yields that thing.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    /// Create a new AABB.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB from a set of points.
    ///
    /// An empty iterator produces a zero-sized box at the origin.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut aabb = Self::EMPTY;
        for p in points {
            aabb.min = aabb.min.min(p);
            aabb.max = aabb.max.max(p);
        }
        if aabb.is_empty() {
            Self::default()
        } else {
            aabb
        }
    }

    /// True if no point has been merged into this box.
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Get the center of the AABB.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the size of the AABB.
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Half of [`size`](Self::size).
    pub fn half_extents(&self) -> Vec3 {
        self.size() * 0.5
    }

    pub fn volume(&self) -> f32 {
        let s = self.size();
        s.x * s.y * s.z
    }

    /// Get all 8 corners of the AABB.
    pub fn corners(&self) -> [Vec3; 8] {
        [
            Vec3::new(self.min.x, self.min.y, self.min.z),
            Vec3::new(self.max.x, self.min.y, self.min.z),
            Vec3::new(self.min.x, self.max.y, self.min.z),
            Vec3::new(self.min.x, self.min.y, self.max.z),
            Vec3::new(self.max.x, self.max.y, self.min.z),
            Vec3::new(self.max.x, self.min.y, self.max.z),
            Vec3::new(self.min.x, self.max.y, self.max.z),
            Vec3::new(self.max.x, self.max.y, self.max.z),
        ]
    }

    /// Check if a point is inside the AABB.
    pub fn contains(&self, point: Vec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Merge two AABBs.
    pub fn merge(&self, other: &Aabb) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Index (0 = x, 1 = y, 2 = z) of the longest side.
    pub fn longest_axis(&self) -> usize {
        let s = self.size();
        if s.x >= s.y && s.x >= s.z {
            0
        } else if s.y >= s.z {
            1
        } else {
            2
        }
    }

    /// Smallest sphere centred on this box's center that contains it after
    /// applying `model`. Exact for any affine `model`, including shear.
    pub fn transformed_sphere(&self, model: &Mat4) -> BoundingSphere {
        let center = model.transform_point3(self.center());
        let radius = self
            .corners()
            .iter()
            .map(|c| model.transform_point3(*c).distance(center))
            .fold(0.0f32, f32::max);
        BoundingSphere { center, radius }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self {
            min: Vec3::ZERO,
            max: Vec3::ZERO,
        }
    }
}

/// World-space bounding sphere used by the broad phase and the octree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Inclusive overlap test; tangent spheres overlap.
    #[inline]
    pub fn overlaps(&self, other: &BoundingSphere) -> bool {
        let radius_sum = self.radius + other.radius;
        self.center.distance_squared(other.center) <= radius_sum * radius_sum
    }
}
