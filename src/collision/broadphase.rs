//! Phase 1: octree candidates filtered by bounding-sphere overlap.

use std::collections::HashSet;

use slotmap::SlotMap;

use super::object::{CollisionObject, ObjectId};
use crate::spatial::Octree;

/// Object pairs that survived the sphere test, plus counters.
#[derive(Debug, Default)]
pub(crate) struct BroadPhaseOutput {
    /// `(lesser, greater)` id pairs, sorted.
    pub pairs: Vec<(ObjectId, ObjectId)>,
    pub tested: usize,
    pub rejected: usize,
}

/// Pair every moved object with its octree candidates.
///
/// A pair reached from both of its objects is tested once. Sphere overlap
/// is inclusive, so touching spheres pass.
pub(crate) fn find_pairs(
    octree: &Octree<ObjectId>,
    objects: &SlotMap<ObjectId, CollisionObject>,
    moved: &[ObjectId],
) -> BroadPhaseOutput {
    let mut seen: HashSet<(ObjectId, ObjectId)> = HashSet::new();
    let mut out = BroadPhaseOutput::default();

    for &id in moved {
        let sphere = objects[id].bounding_sphere();
        for other in octree.query_candidates(id, objects) {
            let key = if id < other { (id, other) } else { (other, id) };
            if !seen.insert(key) {
                continue;
            }
            out.tested += 1;
            if sphere.overlaps(&objects[other].bounding_sphere()) {
                out.pairs.push(key);
            } else {
                out.rejected += 1;
            }
        }
    }

    out.pairs.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use glam::{Mat4, Vec3};
    use slotmap::SlotMap;

    use crate::collision::TransformId;
    use crate::mesh::{BvhStopCriteria, CollisionMesh, MeshGeometry};

    type Fixture = (
        Octree<ObjectId>,
        SlotMap<ObjectId, CollisionObject>,
        Vec<ObjectId>,
    );

    fn setup(positions: &[Vec3]) -> Fixture {
        let mesh = Arc::new(CollisionMesh::new(
            MeshGeometry::unit_cube(),
            BvhStopCriteria::default(),
        ));
        let mut octree = Octree::new(Vec3::ZERO, 64.0, 4, 0.5);
        let mut objects = SlotMap::with_key();
        let mut ids = Vec::new();
        for &p in positions {
            let id = objects.insert(CollisionObject::new(
                mesh.clone(),
                TransformId::default(),
                Mat4::from_translation(p),
            ));
            octree.insert(id, &mut objects).unwrap();
            ids.push(id);
        }
        (octree, objects, ids)
    }

    #[test]
    fn test_far_pair_rejected() {
        let (octree, objects, ids) = setup(&[Vec3::ZERO, Vec3::new(3.0, 0.0, 0.0)]);
        let out = find_pairs(&octree, &objects, &ids);
        assert_eq!(out.tested, 1);
        assert_eq!(out.rejected, 1);
        assert!(out.pairs.is_empty());
    }

    #[test]
    fn test_pair_tested_once() {
        let (octree, objects, ids) = setup(&[
            Vec3::ZERO,
            Vec3::new(0.5, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
        ]);
        // all three moved; each pair is reachable from both ends
        let out = find_pairs(&octree, &objects, &ids);
        assert_eq!(out.tested, 3);
        assert_eq!(out.rejected, 0);
        assert_eq!(out.pairs.len(), 3);
        for (a, b) in &out.pairs {
            assert!(a < b);
        }
    }

    #[test]
    fn test_static_pairs_skipped() {
        let (octree, objects, ids) = setup(&[
            Vec3::ZERO,
            Vec3::new(0.5, 0.0, 0.0),
            Vec3::new(40.0, 40.0, 40.0),
        ]);
        // only the far object moved
        let out = find_pairs(&octree, &objects, &ids[2..]);
        assert!(out.pairs.is_empty());
        assert_eq!(out.tested, out.rejected);
    }
}
