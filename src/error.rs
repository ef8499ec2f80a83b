//! Error types for the collision subsystem.

use crate::collision::{ObjectId, TransformId};

/// Recoverable failures reported by the collision API.
///
/// Broad/mid-phase rejections, degenerate geometry and triangle-pair buffer
/// overflow are normal control flow and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum CollisionError {
    #[error("invalid collision config: {0}")]
    InvalidConfig(String),

    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    #[error("unknown collision object {0:?}")]
    UnknownObject(ObjectId),

    #[error("unknown transform {0:?}")]
    UnknownTransform(TransformId),

    #[error("transform {0:?} is still referenced by {1} object(s) or child transform(s)")]
    TransformInUse(TransformId, usize),

    #[error("parent of transform {0:?} would form a cycle")]
    ParentCycle(TransformId),

    #[error("bounding sphere (center {center:?}, radius {radius}) does not fit the world volume")]
    OutsideWorld { center: glam::Vec3, radius: f32 },

    /// The narrow-phase backend failed to run a batch.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CollisionError>;
