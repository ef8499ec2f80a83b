//! rein-collide
//!
//! Collision detection for rigid triangle meshes: an octree over instance
//! bounding spheres, one BVH per distinct mesh, OBB separating-axis tests and
//! exact triangle-triangle tests run as one parallel batch per tick.
//!
//! # Architecture
//!
//! 1. **geometry** - boxes, spheres, triangles, SAT and the exact triangle test
//! 2. **mesh** - triangle soups, per-mesh BVH, shared mesh cache
//! 3. **spatial** - octree arena over bounding spheres
//! 4. **collision** - transforms, objects, the tick pipeline and tester backends
//! 5. **context** / **core** / **compute** - wgpu plumbing for the GPU tester
//!    (feature = "gpu")
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rein_collide::{CollisionConfig, CollisionWorld, Transform};
//! use rein_collide::mesh::{BvhStopCriteria, CollisionMesh, MeshGeometry};
//! use rein_collide::glam::Vec3;
//!
//! let mut world = CollisionWorld::new(CollisionConfig::default())?;
//! let cube = Arc::new(CollisionMesh::new(MeshGeometry::unit_cube(), BvhStopCriteria::default()));
//!
//! let a = world.add_transform(Transform::identity())?;
//! let b = world.add_transform(Transform::from_position(Vec3::new(0.5, 0.0, 0.0)))?;
//! world.spawn(cube.clone(), a)?;
//! world.spawn(cube, b)?;
//!
//! let report = world.tick()?;
//! assert_eq!(report.contacts.len(), 1);
//! # Ok::<(), rein_collide::CollisionError>(())
//! ```

pub mod collision;
pub mod error;
pub mod geometry;
pub mod mesh;
pub mod spatial;

#[cfg(feature = "gpu")]
pub mod compute;
#[cfg(feature = "gpu")]
pub mod context;
#[cfg(feature = "gpu")]
pub mod core;

pub use collision::{
    CollisionConfig, CollisionMetrics, CollisionObject, CollisionWorld, Contact,
    NarrowPhaseMode, ObjectId, PipelinePhase, TickReport, TickStats, Transform, TransformArena,
    TransformId,
};
pub use error::{CollisionError, Result};
pub use geometry::{Aabb, BoundingSphere, Obb, Triangle};
pub use mesh::{CollisionMesh, MeshGeometry, MeshLibrary};

#[cfg(feature = "gpu")]
pub use context::WgpuContext;

// Re-export glam for convenience
pub use glam;
