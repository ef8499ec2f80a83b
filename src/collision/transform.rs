//! Shared placement records.
//!
//! A [`Transform`] is owned by the [`TransformArena`] and referenced by
//! [`TransformId`] from everything that places an instance (render entity,
//! rigid body, collision object). Identity is the id, never the field values.

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};
use slotmap::{new_key_type, SlotMap};

use crate::error::{CollisionError, Result};

new_key_type! {
    /// Stable handle to a [`Transform`].
    pub struct TransformId;
}

/// Local placement: position, rotation and scale, optionally anchored to a parent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    /// World matrix of the parent is applied after this transform's own.
    pub parent: Option<TransformId>,
}

impl Transform {
    /// Create an identity transform.
    pub fn identity() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            parent: None,
        }
    }

    /// Create a transform from a position.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::identity()
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_parent(mut self, parent: TransformId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Local matrix (translation * rotation * scale), parent not applied.
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

/// Arena of transforms. All mutation goes through [`update`](Self::update).
#[derive(Debug, Default)]
pub struct TransformArena {
    transforms: SlotMap<TransformId, Transform>,
}

impl TransformArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transform. Its parent, if any, must already exist.
    pub fn insert(&mut self, transform: Transform) -> Result<TransformId> {
        if let Some(parent) = transform.parent {
            if !self.transforms.contains_key(parent) {
                return Err(CollisionError::UnknownTransform(parent));
            }
        }
        Ok(self.transforms.insert(transform))
    }

    pub fn get(&self, id: TransformId) -> Option<&Transform> {
        self.transforms.get(id)
    }

    pub fn contains(&self, id: TransformId) -> bool {
        self.transforms.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TransformId, &Transform)> {
        self.transforms.iter()
    }

    /// Mutate a transform in place.
    ///
    /// The change is rolled back if it points the parent at a missing
    /// transform or creates a parent cycle.
    pub fn update<F>(&mut self, id: TransformId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transform),
    {
        let transform = self
            .transforms
            .get_mut(id)
            .ok_or(CollisionError::UnknownTransform(id))?;
        let before = *transform;
        f(transform);
        let parent = transform.parent;

        if parent != before.parent {
            if let Err(e) = self.check_parent_chain(id) {
                self.transforms[id] = before;
                return Err(e);
            }
        }
        Ok(())
    }

    fn check_parent_chain(&self, id: TransformId) -> Result<()> {
        let mut steps = 0;
        let mut current = self.transforms[id].parent;
        while let Some(parent) = current {
            if parent == id || steps > self.transforms.len() {
                return Err(CollisionError::ParentCycle(id));
            }
            current = self
                .transforms
                .get(parent)
                .ok_or(CollisionError::UnknownTransform(parent))?
                .parent;
            steps += 1;
        }
        Ok(())
    }

    /// Number of transforms whose parent is `id`.
    pub fn child_count(&self, id: TransformId) -> usize {
        self.transforms
            .values()
            .filter(|t| t.parent == Some(id))
            .count()
    }

    /// Remove a transform nothing refers to. Callers check object references.
    pub(crate) fn remove(&mut self, id: TransformId) -> Result<Transform> {
        let children = self.child_count(id);
        if children > 0 {
            return Err(CollisionError::TransformInUse(id, children));
        }
        self.transforms
            .remove(id)
            .ok_or(CollisionError::UnknownTransform(id))
    }

    /// World matrix: every ancestor's local matrix composed root first, in
    /// the same order as [`world_matrices`](Self::world_matrices) so both
    /// give bit-identical results.
    pub fn world_matrix(&self, id: TransformId) -> Result<Mat4> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let transform = self
                .transforms
                .get(c)
                .ok_or(CollisionError::UnknownTransform(c))?;
            chain.push(transform);
            current = transform.parent;
        }
        Ok(chain
            .iter()
            .rev()
            .fold(Mat4::IDENTITY, |base, t| base * t.to_matrix()))
    }

    /// World matrices of every transform, each ancestor computed once.
    pub fn world_matrices(&self) -> HashMap<TransformId, Mat4> {
        let mut out: HashMap<TransformId, Mat4> = HashMap::with_capacity(self.transforms.len());
        let mut chain = Vec::new();
        for id in self.transforms.keys() {
            if out.contains_key(&id) {
                continue;
            }
            // walk up to the first resolved ancestor, then resolve downward
            chain.clear();
            let mut current = Some(id);
            let mut base = Mat4::IDENTITY;
            while let Some(c) = current {
                if let Some(m) = out.get(&c) {
                    base = *m;
                    break;
                }
                chain.push(c);
                current = self.transforms[c].parent;
            }
            for &c in chain.iter().rev() {
                base *= self.transforms[c].to_matrix();
                out.insert(c, base);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let t = Transform::identity();
        assert_eq!(t.to_matrix(), Mat4::IDENTITY);
        assert_eq!(Transform::default(), t);
    }

    #[test]
    fn test_world_matrix_composes_parents() {
        let mut arena = TransformArena::new();
        let root = arena
            .insert(Transform::from_position(Vec3::new(10.0, 0.0, 0.0)))
            .unwrap();
        let mid = arena
            .insert(
                Transform::from_position(Vec3::new(0.0, 1.0, 0.0))
                    .with_rotation(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2))
                    .with_parent(root),
            )
            .unwrap();
        let leaf = arena
            .insert(Transform::from_position(Vec3::new(1.0, 0.0, 0.0)).with_parent(mid))
            .unwrap();

        let m = arena.world_matrix(leaf).unwrap();
        let p = m.transform_point3(Vec3::ZERO);
        // leaf offset +x is rotated to +y by `mid`
        assert!((p - Vec3::new(10.0, 2.0, 0.0)).length() < 1e-5);

        let all = arena.world_matrices();
        assert_eq!(all.len(), 3);
        for (id, matrix) in &all {
            let direct = arena.world_matrix(*id).unwrap();
            assert!(matrix.abs_diff_eq(direct, 1e-5));
        }
    }

    #[test]
    fn test_update_moves_children() {
        let mut arena = TransformArena::new();
        let root = arena.insert(Transform::identity()).unwrap();
        let child = arena
            .insert(Transform::from_position(Vec3::X).with_parent(root))
            .unwrap();
        arena
            .update(root, |t| t.position = Vec3::new(0.0, 0.0, 5.0))
            .unwrap();
        let p = arena.world_matrix(child).unwrap().transform_point3(Vec3::ZERO);
        assert!((p - Vec3::new(1.0, 0.0, 5.0)).length() < 1e-6);
    }

    #[test]
    fn test_parent_cycle_rolled_back() {
        let mut arena = TransformArena::new();
        let a = arena.insert(Transform::identity()).unwrap();
        let b = arena.insert(Transform::identity().with_parent(a)).unwrap();
        let result = arena.update(a, |t| t.parent = Some(b));
        assert!(matches!(result, Err(CollisionError::ParentCycle(_))));
        assert_eq!(arena.get(a).unwrap().parent, None);
    }

    #[test]
    fn test_remove_parent_in_use() {
        let mut arena = TransformArena::new();
        let a = arena.insert(Transform::identity()).unwrap();
        let b = arena.insert(Transform::identity().with_parent(a)).unwrap();
        assert!(matches!(
            arena.remove(a),
            Err(CollisionError::TransformInUse(_, 1))
        ));
        arena.remove(b).unwrap();
        arena.remove(a).unwrap();
        assert!(arena.is_empty());
        assert!(matches!(
            arena.world_matrix(a),
            Err(CollisionError::UnknownTransform(_))
        ));
    }
}
