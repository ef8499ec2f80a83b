//! Phases 2 and 3: root OBB rejection, BVH descent into the frame batch,
//! and turning tester output into contacts.

use std::collections::HashSet;

use glam::Vec3;
use slotmap::SlotMap;

use super::contact::Contact;
use super::object::{CollisionObject, ObjectId};
use super::tester::{BatchResult, TriangleBatch};

/// SAT on the two BVH root boxes in world space.
pub(crate) fn root_boxes_intersect(a: &CollisionObject, b: &CollisionObject, epsilon: f32) -> bool {
    a.root_obb().intersects(&b.root_obb(), epsilon)
}

/// Descend both BVHs and append every overlapping leaf pair to `batch` as one
/// block tagged `group`. Returns the number of SAT tests run.
pub(crate) fn collect(
    group: u32,
    a: &CollisionObject,
    b: &CollisionObject,
    batch: &mut TriangleBatch,
    sat_epsilon: f32,
) -> usize {
    let (ma, mb) = (a.world_matrix(), b.world_matrix());
    let (geo_a, geo_b) = (a.mesh().geometry(), b.mesh().geometry());
    let mut leaves = a
        .mesh()
        .bvh()
        .leaf_pairs(ma, b.mesh().bvh(), mb, sat_epsilon);
    for leaf in leaves.by_ref() {
        batch.push_block(
            group,
            leaf.a,
            leaf.b,
            |i| geo_a.triangle(i as usize).transformed(&ma),
            |j| geo_b.triangle(j as usize).transformed(&mb),
        );
    }
    leaves.sat_tests()
}

/// Bounding-volume narrow phase: a contact on the first overlapping leaf pair.
///
/// The point is the mean world centroid of both leaves' triangles; normals
/// are left zero. Returns the contact (if any) and the SAT tests run.
pub(crate) fn first_leaf_overlap(
    ids: (ObjectId, ObjectId),
    a: &CollisionObject,
    b: &CollisionObject,
    sat_epsilon: f32,
) -> (Option<Contact>, usize) {
    let (ma, mb) = (a.world_matrix(), b.world_matrix());
    let mut leaves = a
        .mesh()
        .bvh()
        .leaf_pairs(ma, b.mesh().bvh(), mb, sat_epsilon);
    let Some(leaf) = leaves.next() else {
        return (None, leaves.sat_tests());
    };

    let centroids_a = leaf
        .a
        .iter()
        .map(|&i| ma.transform_point3(a.mesh().geometry().triangle(i as usize).centroid()));
    let centroids_b = leaf
        .b
        .iter()
        .map(|&j| mb.transform_point3(b.mesh().geometry().triangle(j as usize).centroid()));
    let count = (leaf.a.len() + leaf.b.len()) as f32;
    let point = centroids_a.chain(centroids_b).sum::<Vec3>() / count;

    let contact = Contact {
        object_a: ids.0,
        object_b: ids.1,
        point,
        normal_a: Vec3::ZERO,
        normal_b: Vec3::ZERO,
        triangle_pairs: Vec::new(),
    };
    (Some(contact), leaves.sat_tests())
}

#[derive(Default)]
struct ContactAccum {
    centroid_sum: Vec3,
    triangles: usize,
    normal_a: Vec3,
    normal_b: Vec3,
    seen_a: HashSet<u32>,
    seen_b: HashSet<u32>,
    pairs: Vec<(u32, u32)>,
}

/// Build one contact per group with at least one intersecting pair.
///
/// `groups[g]` is the object pair whose blocks carry tag `g`. Contacts come
/// out in group order.
pub(crate) fn resolve(
    batch: &TriangleBatch,
    result: &BatchResult,
    groups: &[(ObjectId, ObjectId)],
) -> Vec<Contact> {
    let mut accum: Vec<Option<ContactAccum>> = Vec::new();
    accum.resize_with(groups.len(), || None);

    let a_tris = batch.a_triangles();
    let b_tris = batch.b_triangles();
    for block in batch.blocks() {
        let first = block.slot_start as usize;
        for n in 0..block.pair_count() {
            if result.pair_hits[first + n] == 0 {
                continue;
            }
            let (ai, bi) = block.pair(n);
            let ta = a_tris[ai].to_triangle();
            let tb = b_tris[bi].to_triangle();
            let (sa, sb) = (batch.a_source(ai), batch.b_source(bi));
            let entry = accum[block.group as usize].get_or_insert_with(ContactAccum::default);
            // each intersecting triangle counts once, however many it hits
            if entry.seen_a.insert(sa) {
                entry.centroid_sum += ta.centroid();
                entry.triangles += 1;
                entry.normal_a += ta.normal();
            }
            if entry.seen_b.insert(sb) {
                entry.centroid_sum += tb.centroid();
                entry.triangles += 1;
                entry.normal_b += tb.normal();
            }
            entry.pairs.push((sa, sb));
        }
    }

    accum
        .into_iter()
        .zip(groups)
        .filter_map(|(entry, &(object_a, object_b))| {
            let entry = entry?;
            Some(Contact {
                object_a,
                object_b,
                point: entry.centroid_sum / entry.triangles as f32,
                normal_a: entry.normal_a.normalize_or_zero(),
                normal_b: entry.normal_b.normalize_or_zero(),
                triangle_pairs: entry.pairs,
            })
        })
        .collect()
}

/// Borrow both sides of an object pair.
pub(crate) fn pair_of<'a>(
    objects: &'a SlotMap<ObjectId, CollisionObject>,
    (a, b): (ObjectId, ObjectId),
) -> (&'a CollisionObject, &'a CollisionObject) {
    (&objects[a], &objects[b])
}
