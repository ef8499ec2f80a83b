//! Collision meshes: immutable triangle soups paired with their BVH.
//!
//! A [`CollisionMesh`] is built once per distinct asset and shared through an
//! `Arc` by every object that uses it. [`MeshLibrary`] caches them by asset
//! key and stop criteria.

pub mod bvh;

pub use bvh::{Bvh, BvhPairIter, BvhStopCriteria, LeafPair, LeafPairIter};

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;
use tracing::debug;

use crate::error::{CollisionError, Result};
use crate::geometry::{Aabb, Triangle};

/// Indexed triangle soup in local space.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshGeometry {
    positions: Vec<Vec3>,
    indices: Vec<[u32; 3]>,
}

impl MeshGeometry {
    /// Create geometry, rejecting indices that point past `positions`.
    pub fn new(positions: Vec<Vec3>, indices: Vec<[u32; 3]>) -> Result<Self> {
        let vertex_count = positions.len();
        if let Some((t, tri)) = indices
            .iter()
            .enumerate()
            .find(|(_, tri)| tri.iter().any(|&i| i as usize >= vertex_count))
        {
            return Err(CollisionError::InvalidMesh(format!(
                "triangle {t} references vertex {tri:?} but mesh has {vertex_count} vertices"
            )));
        }
        if let Some(p) = positions.iter().find(|p| !p.is_finite()) {
            return Err(CollisionError::InvalidMesh(format!(
                "non-finite vertex position {p:?}"
            )));
        }
        Ok(Self { positions, indices })
    }

    /// Unindexed soup, one entry per triangle.
    pub fn from_triangles(triangles: &[Triangle]) -> Result<Self> {
        let positions = triangles.iter().flat_map(|t| t.vertices).collect();
        let indices = (0..triangles.len() as u32)
            .map(|t| [3 * t, 3 * t + 1, 3 * t + 2])
            .collect();
        Self::new(positions, indices)
    }

    /// Axis-aligned cube of side 1 centred on the origin (8 vertices, 12 triangles).
    pub fn unit_cube() -> Self {
        let positions = vec![
            Vec3::new(-0.5, -0.5, -0.5),
            Vec3::new(0.5, -0.5, -0.5),
            Vec3::new(0.5, 0.5, -0.5),
            Vec3::new(-0.5, 0.5, -0.5),
            Vec3::new(-0.5, -0.5, 0.5),
            Vec3::new(0.5, -0.5, 0.5),
            Vec3::new(0.5, 0.5, 0.5),
            Vec3::new(-0.5, 0.5, 0.5),
        ];
        let indices = vec![
            // -z
            [0, 2, 1],
            [0, 3, 2],
            // +z
            [4, 5, 6],
            [4, 6, 7],
            // -y
            [0, 1, 5],
            [0, 5, 4],
            // +y
            [3, 7, 6],
            [3, 6, 2],
            // -x
            [0, 4, 7],
            [0, 7, 3],
            // +x
            [1, 2, 6],
            [1, 6, 5],
        ];
        Self { positions, indices }
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn indices(&self) -> &[[u32; 3]] {
        &self.indices
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle(&self, index: usize) -> Triangle {
        let [a, b, c] = self.indices[index];
        Triangle::new(
            self.positions[a as usize],
            self.positions[b as usize],
            self.positions[c as usize],
        )
    }

    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        (0..self.indices.len()).map(|i| self.triangle(i))
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::from_points(self.indices.iter().flatten().map(|&i| self.positions[i as usize]))
    }
}

/// Geometry plus its BVH. Read-only once built.
#[derive(Debug)]
pub struct CollisionMesh {
    geometry: MeshGeometry,
    bvh: Bvh,
    stop: BvhStopCriteria,
}

impl CollisionMesh {
    pub fn new(geometry: MeshGeometry, stop: BvhStopCriteria) -> Self {
        let bvh = Bvh::build(&geometry, stop);
        debug!(
            triangles = geometry.triangle_count(),
            nodes = bvh.node_count(),
            depth = bvh.depth(),
            "Built collision mesh BVH"
        );
        Self {
            geometry,
            bvh,
            stop,
        }
    }

    pub fn geometry(&self) -> &MeshGeometry {
        &self.geometry
    }

    pub fn bvh(&self) -> &Bvh {
        &self.bvh
    }

    pub fn stop_criteria(&self) -> BvhStopCriteria {
        self.stop
    }

    /// Local-space bounds (the BVH root box).
    pub fn local_aabb(&self) -> Aabb {
        self.bvh.root_aabb()
    }
}

/// Cache of shared collision meshes keyed by asset name and stop criteria.
#[derive(Debug, Default)]
pub struct MeshLibrary {
    meshes: HashMap<(String, BvhStopCriteria), Arc<CollisionMesh>>,
}

impl MeshLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached mesh for `key`, or build it from `load`.
    ///
    /// `load` runs only on a miss; a failed load caches nothing.
    pub fn get_or_build<F>(
        &mut self,
        key: &str,
        stop: BvhStopCriteria,
        load: F,
    ) -> Result<Arc<CollisionMesh>>
    where
        F: FnOnce() -> Result<MeshGeometry>,
    {
        let cache_key = (key.to_owned(), stop);
        if let Some(mesh) = self.meshes.get(&cache_key) {
            debug!(key, "Collision mesh cache hit");
            return Ok(Arc::clone(mesh));
        }
        let mesh = Arc::new(CollisionMesh::new(load()?, stop));
        self.meshes.insert(cache_key, Arc::clone(&mesh));
        Ok(mesh)
    }

    pub fn get(&self, key: &str, stop: BvhStopCriteria) -> Option<Arc<CollisionMesh>> {
        self.meshes.get(&(key.to_owned(), stop)).cloned()
    }

    /// Drop the cache's reference; objects still holding the mesh keep it alive.
    pub fn remove(&mut self, key: &str, stop: BvhStopCriteria) -> Option<Arc<CollisionMesh>> {
        self.meshes.remove(&(key.to_owned(), stop))
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}
