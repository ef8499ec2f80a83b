//! World-space spatial index.

pub mod octree;

pub use octree::{NodeId, Octree, SpatialEntry};
