//! Per-instance collision state.

use std::sync::Arc;

use glam::Mat4;
use slotmap::new_key_type;

use super::transform::TransformId;
use crate::geometry::{BoundingSphere, Obb};
use crate::mesh::CollisionMesh;
use crate::spatial::{NodeId, SpatialEntry};

new_key_type! {
    /// Stable handle to a [`CollisionObject`].
    pub struct ObjectId;
}

/// One instance: a shared mesh placed by a shared transform.
#[derive(Debug, Clone)]
pub struct CollisionObject {
    mesh: Arc<CollisionMesh>,
    transform: TransformId,
    /// World matrix the sphere was last derived from.
    world: Mat4,
    sphere: BoundingSphere,
    node: Option<NodeId>,
}

impl CollisionObject {
    pub(crate) fn new(mesh: Arc<CollisionMesh>, transform: TransformId, world: Mat4) -> Self {
        let sphere = mesh.local_aabb().transformed_sphere(&world);
        Self {
            mesh,
            transform,
            world,
            sphere,
            node: None,
        }
    }

    pub fn mesh(&self) -> &Arc<CollisionMesh> {
        &self.mesh
    }

    pub fn transform(&self) -> TransformId {
        self.transform
    }

    /// World matrix as of the last tick (or spawn).
    pub fn world_matrix(&self) -> Mat4 {
        self.world
    }

    pub fn bounding_sphere(&self) -> BoundingSphere {
        self.sphere
    }

    /// Octree node currently holding this object.
    pub fn octree_node(&self) -> Option<NodeId> {
        self.node
    }

    /// World-space box of the BVH root.
    pub fn root_obb(&self) -> Obb {
        Obb::from_aabb(&self.mesh.local_aabb(), &self.world)
    }

    /// Refresh the cached matrix and sphere. Returns false if `world` is unchanged.
    pub(crate) fn sync(&mut self, world: Mat4) -> bool {
        if world == self.world {
            return false;
        }
        self.world = world;
        self.sphere = self.mesh.local_aabb().transformed_sphere(&world);
        true
    }
}

impl SpatialEntry for CollisionObject {
    fn sphere(&self) -> BoundingSphere {
        self.sphere
    }

    fn node(&self) -> Option<NodeId> {
        self.node
    }

    fn set_node(&mut self, node: Option<NodeId>) {
        self.node = node;
    }
}
