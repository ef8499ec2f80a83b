//! Bounding volume hierarchy over a mesh's triangles, in local space.
//!
//! Built once per [`CollisionMesh`](super::CollisionMesh) and shared by every
//! instance. Queries take each side's world matrix and test node boxes as
//! [`Obb`]s, so one tree serves any number of transforms.

use glam::Mat4;

use super::MeshGeometry;
use crate::geometry::{Aabb, Obb};

/// When to stop splitting a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BvhStopCriteria {
    /// Stop once a node holds at most this many triangles.
    MaxTrianglesPerLeaf(usize),
    /// Stop at this depth (root is depth 0).
    MaxDepth(u32),
}

impl Default for BvhStopCriteria {
    fn default() -> Self {
        Self::MaxTrianglesPerLeaf(16)
    }
}

impl BvhStopCriteria {
    fn should_stop(&self, triangle_count: usize, depth: u32) -> bool {
        if triangle_count <= 1 {
            return true;
        }
        match *self {
            Self::MaxTrianglesPerLeaf(max) => triangle_count <= max,
            Self::MaxDepth(max) => depth >= max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BvhNodeKind {
    Interior { left: u32, right: u32 },
    /// Range into `Bvh::triangle_order`.
    Leaf { start: u32, len: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BvhNode {
    aabb: Aabb,
    kind: BvhNodeKind,
}

/// Immutable BVH. Node 0 is the root.
#[derive(Debug, Clone, PartialEq)]
pub struct Bvh {
    nodes: Vec<BvhNode>,
    triangle_order: Vec<u32>,
}

struct BuildInput {
    boxes: Vec<Aabb>,
    centroids: Vec<glam::Vec3>,
    stop: BvhStopCriteria,
}

impl Bvh {
    /// Top-down median split on the longest axis of the centroid bounds.
    ///
    /// Ties on the split coordinate are broken by triangle index, so the
    /// same mesh always yields the same tree.
    pub fn build(geometry: &MeshGeometry, stop: BvhStopCriteria) -> Self {
        let count = geometry.triangle_count();
        if count == 0 {
            return Self {
                nodes: vec![BvhNode {
                    aabb: Aabb::default(),
                    kind: BvhNodeKind::Leaf { start: 0, len: 0 },
                }],
                triangle_order: Vec::new(),
            };
        }

        let input = BuildInput {
            boxes: geometry.triangles().map(|t| t.aabb()).collect(),
            centroids: geometry.triangles().map(|t| t.centroid()).collect(),
            stop,
        };
        let mut bvh = Self {
            nodes: Vec::with_capacity(2 * count),
            triangle_order: (0..count as u32).collect(),
        };
        let mut order = std::mem::take(&mut bvh.triangle_order);
        bvh.build_node(&input, &mut order, 0, 0);
        bvh.triangle_order = order;
        bvh
    }

    /// Builds the subtree over `order` (which starts at `offset` in the final
    /// order array) and returns its node index.
    fn build_node(
        &mut self,
        input: &BuildInput,
        order: &mut [u32],
        offset: u32,
        depth: u32,
    ) -> u32 {
        let aabb = order
            .iter()
            .fold(Aabb::EMPTY, |acc, &t| acc.merge(&input.boxes[t as usize]));

        let index = self.nodes.len() as u32;
        self.nodes.push(BvhNode {
            aabb,
            kind: BvhNodeKind::Leaf {
                start: offset,
                len: order.len() as u32,
            },
        });

        if input.stop.should_stop(order.len(), depth) {
            return index;
        }

        let centroid_bounds =
            Aabb::from_points(order.iter().map(|&t| input.centroids[t as usize]));
        let axis = centroid_bounds.longest_axis();
        order.sort_unstable_by(|&a, &b| {
            input.centroids[a as usize][axis]
                .total_cmp(&input.centroids[b as usize][axis])
                .then(a.cmp(&b))
        });

        let mid = order.len() / 2;
        let (lo, hi) = order.split_at_mut(mid);
        let left = self.build_node(input, lo, offset, depth + 1);
        let right = self.build_node(input, hi, offset + mid as u32, depth + 1);
        self.nodes[index as usize].kind = BvhNodeKind::Interior { left, right };
        index
    }

    pub fn root_aabb(&self) -> Aabb {
        self.nodes[0].aabb
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangle_order.len()
    }

    /// Depth of the deepest leaf; a single-leaf tree has depth 0.
    pub fn depth(&self) -> u32 {
        let mut max = 0;
        let mut stack = vec![(0u32, 0u32)];
        while let Some((node, depth)) = stack.pop() {
            max = max.max(depth);
            if let BvhNodeKind::Interior { left, right } = self.nodes[node as usize].kind {
                stack.push((left, depth + 1));
                stack.push((right, depth + 1));
            }
        }
        max
    }

    /// Local boxes of all non-empty leaves with their triangle indices.
    pub fn leaf_boxes(&self) -> impl Iterator<Item = (Aabb, &[u32])> + '_ {
        self.nodes.iter().filter_map(move |node| match node.kind {
            BvhNodeKind::Leaf { len: 0, .. } => None,
            BvhNodeKind::Leaf { .. } => Some((node.aabb, self.leaf_triangles(node))),
            BvhNodeKind::Interior { .. } => None,
        })
    }

    fn leaf_triangles(&self, node: &BvhNode) -> &[u32] {
        match node.kind {
            BvhNodeKind::Leaf { start, len } => {
                &self.triangle_order[start as usize..(start + len) as usize]
            }
            BvhNodeKind::Interior { .. } => &[],
        }
    }

    /// Lazily walk both trees in lock-step and yield overlapping leaf pairs.
    pub fn leaf_pairs<'a>(
        &'a self,
        model_a: Mat4,
        other: &'a Bvh,
        model_b: Mat4,
        sat_epsilon: f32,
    ) -> LeafPairIter<'a> {
        let stack = if self.triangle_count() == 0 || other.triangle_count() == 0 {
            Vec::new()
        } else {
            vec![(0, 0)]
        };
        LeafPairIter {
            a: self,
            b: other,
            model_a,
            model_b,
            sat_epsilon,
            stack,
            sat_tests: 0,
        }
    }

    /// Like [`leaf_pairs`](Self::leaf_pairs), flattened to triangle index pairs.
    pub fn triangle_pairs<'a>(
        &'a self,
        model_a: Mat4,
        other: &'a Bvh,
        model_b: Mat4,
        sat_epsilon: f32,
    ) -> BvhPairIter<'a> {
        BvhPairIter {
            leaves: self.leaf_pairs(model_a, other, model_b, sat_epsilon),
            current: None,
            i: 0,
            j: 0,
        }
    }
}

/// One overlapping leaf pair: triangle indices on each side.
#[derive(Debug, Clone, Copy)]
pub struct LeafPair<'a> {
    pub a: &'a [u32],
    pub b: &'a [u32],
}

impl LeafPair<'_> {
    pub fn pair_count(&self) -> usize {
        self.a.len() * self.b.len()
    }
}

/// Stack-driven lock-step descent of two BVHs.
///
/// Pruning only discards node pairs whose world boxes are SAT-separated, so
/// every truly intersecting triangle pair appears in some yielded leaf pair.
pub struct LeafPairIter<'a> {
    a: &'a Bvh,
    b: &'a Bvh,
    model_a: Mat4,
    model_b: Mat4,
    sat_epsilon: f32,
    stack: Vec<(u32, u32)>,
    sat_tests: usize,
}

impl LeafPairIter<'_> {
    /// SAT tests run so far.
    pub fn sat_tests(&self) -> usize {
        self.sat_tests
    }

    fn world_box(&self, side_a: bool, node: u32) -> Obb {
        if side_a {
            Obb::from_aabb(&self.a.nodes[node as usize].aabb, &self.model_a)
        } else {
            Obb::from_aabb(&self.b.nodes[node as usize].aabb, &self.model_b)
        }
    }

    /// Push both children of an interior node, larger world volume last so it
    /// is visited first. Equal volumes visit the left child first.
    fn push_children(&mut self, side_a: bool, left: u32, right: u32, partner: u32) {
        let left_volume = self.world_box(side_a, left).volume();
        let right_volume = self.world_box(side_a, right).volume();
        let (first, second) = if left_volume >= right_volume {
            (right, left)
        } else {
            (left, right)
        };
        for child in [first, second] {
            if side_a {
                self.stack.push((child, partner));
            } else {
                self.stack.push((partner, child));
            }
        }
    }
}

impl<'a> Iterator for LeafPairIter<'a> {
    type Item = LeafPair<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (a, b) = (self.a, self.b);
        while let Some((na, nb)) = self.stack.pop() {
            let obb_a = self.world_box(true, na);
            let obb_b = self.world_box(false, nb);
            self.sat_tests += 1;
            if !obb_a.intersects(&obb_b, self.sat_epsilon) {
                continue;
            }

            let node_a = &a.nodes[na as usize];
            let node_b = &b.nodes[nb as usize];
            match (node_a.kind, node_b.kind) {
                (BvhNodeKind::Leaf { .. }, BvhNodeKind::Leaf { .. }) => {
                    return Some(LeafPair {
                        a: a.leaf_triangles(node_a),
                        b: b.leaf_triangles(node_b),
                    });
                }
                (BvhNodeKind::Leaf { .. }, BvhNodeKind::Interior { left, right }) => {
                    self.push_children(false, left, right, na);
                }
                (BvhNodeKind::Interior { left, right }, BvhNodeKind::Leaf { .. }) => {
                    self.push_children(true, left, right, nb);
                }
                (
                    BvhNodeKind::Interior { left: al, right: ar },
                    BvhNodeKind::Interior { left: bl, right: br },
                ) => {
                    // split the larger node; ties split `a`
                    if obb_a.volume() >= obb_b.volume() {
                        self.push_children(true, al, ar, nb);
                    } else {
                        self.push_children(false, bl, br, na);
                    }
                }
            }
        }
        None
    }
}

/// Candidate triangle index pairs `(a, b)` from [`LeafPairIter`].
pub struct BvhPairIter<'a> {
    leaves: LeafPairIter<'a>,
    current: Option<LeafPair<'a>>,
    i: usize,
    j: usize,
}

impl BvhPairIter<'_> {
    pub fn sat_tests(&self) -> usize {
        self.leaves.sat_tests()
    }
}

impl Iterator for BvhPairIter<'_> {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(leaf) = self.current {
                if self.i < leaf.a.len() {
                    let pair = (leaf.a[self.i], leaf.b[self.j]);
                    self.j += 1;
                    if self.j == leaf.b.len() {
                        self.j = 0;
                        self.i += 1;
                    }
                    return Some(pair);
                }
            }
            self.current = Some(self.leaves.next()?);
            self.i = 0;
            self.j = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::triangles_intersect;
    use glam::{Quat, Vec3};
    use std::collections::HashSet;

    /// Deterministic scatter of small triangles.
    fn soup(count: usize, seed: u32) -> MeshGeometry {
        let mut state = seed;
        let mut next = || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 24) as f32
        };
        let mut positions = Vec::new();
        for _ in 0..count {
            let base = Vec3::new(next() * 4.0 - 2.0, next() * 4.0 - 2.0, next() * 4.0 - 2.0);
            for _ in 0..3 {
                positions.push(base + Vec3::new(next(), next(), next()) * 0.8);
            }
        }
        let indices = (0..count as u32).map(|t| [3 * t, 3 * t + 1, 3 * t + 2]).collect();
        MeshGeometry::new(positions, indices).unwrap()
    }

    fn check_bounds(bvh: &Bvh, geometry: &MeshGeometry, node: u32) -> Aabb {
        let n = &bvh.nodes[node as usize];
        let expected = match n.kind {
            BvhNodeKind::Leaf { .. } => bvh
                .leaf_triangles(n)
                .iter()
                .fold(Aabb::EMPTY, |acc, &t| acc.merge(&geometry.triangle(t as usize).aabb())),
            BvhNodeKind::Interior { left, right } => {
                check_bounds(bvh, geometry, left).merge(&check_bounds(bvh, geometry, right))
            }
        };
        assert_eq!(n.aabb, expected);
        n.aabb
    }

    #[test]
    fn test_build_bounds_are_tight() {
        let geometry = soup(200, 7);
        let bvh = Bvh::build(&geometry, BvhStopCriteria::MaxTrianglesPerLeaf(4));
        check_bounds(&bvh, &geometry, 0);

        let mut seen: Vec<u32> = bvh.leaf_boxes().flat_map(|(_, t)| t.to_vec()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..200).collect::<Vec<u32>>());
        assert!(bvh.leaf_boxes().all(|(_, t)| t.len() <= 4));
    }

    #[test]
    fn test_build_is_deterministic() {
        let geometry = soup(150, 3);
        let a = Bvh::build(&geometry, BvhStopCriteria::default());
        let b = Bvh::build(&geometry, BvhStopCriteria::default());
        assert_eq!(a, b);
    }

    #[test]
    fn test_max_depth_stop() {
        let geometry = soup(300, 11);
        let bvh = Bvh::build(&geometry, BvhStopCriteria::MaxDepth(3));
        assert_eq!(bvh.depth(), 3);
        assert_eq!(bvh.node_count(), 15);
    }

    #[test]
    fn test_empty_mesh_yields_nothing() {
        let empty = MeshGeometry::new(Vec::new(), Vec::new()).unwrap();
        let bvh = Bvh::build(&empty, BvhStopCriteria::default());
        assert_eq!(bvh.node_count(), 1);
        assert_eq!(bvh.depth(), 0);
        assert_eq!(bvh.leaf_boxes().count(), 0);

        let cube = Bvh::build(&MeshGeometry::unit_cube(), BvhStopCriteria::default());
        let pairs: Vec<_> = bvh
            .triangle_pairs(Mat4::IDENTITY, &cube, Mat4::IDENTITY, 1e-6)
            .collect();
        assert!(pairs.is_empty());
    }

    /// Every triangle pair that truly intersects must survive the descent.
    fn assert_covers_true_hits(geometry: &MeshGeometry, bvh: &Bvh, ma: Mat4, mb: Mat4) {
        let candidates: HashSet<(u32, u32)> = bvh.triangle_pairs(ma, bvh, mb, 1e-6).collect();
        let mut hits = 0;
        for (i, ta) in geometry.triangles().enumerate() {
            for (j, tb) in geometry.triangles().enumerate() {
                if triangles_intersect(&ta.transformed(&ma), &tb.transformed(&mb), 1e-5) {
                    hits += 1;
                    assert!(
                        candidates.contains(&(i as u32, j as u32)),
                        "pair ({i}, {j}) intersects but was pruned"
                    );
                }
            }
        }
        assert!(hits > 0);
    }

    #[test]
    fn test_coincident_meshes_keep_every_hit() {
        let geometry = MeshGeometry::unit_cube();
        let bvh = Bvh::build(&geometry, BvhStopCriteria::MaxTrianglesPerLeaf(2));
        let model = Mat4::from_rotation_translation(Quat::from_rotation_y(0.3), Vec3::ONE);
        assert_covers_true_hits(&geometry, &bvh, model, model);

        let pairs: HashSet<(u32, u32)> = bvh.triangle_pairs(model, &bvh, model, 1e-6).collect();
        for t in 0..12 {
            assert!(pairs.contains(&(t, t)));
        }
    }

    #[test]
    fn test_face_touching_meshes_keep_every_hit() {
        let geometry = MeshGeometry::unit_cube();
        let bvh = Bvh::build(&geometry, BvhStopCriteria::MaxTrianglesPerLeaf(2));
        let rot = Quat::from_rotation_y(0.3);
        let ma = Mat4::from_rotation_translation(rot, Vec3::ONE);
        let mb = Mat4::from_rotation_translation(rot, Vec3::ONE + rot * Vec3::X);
        assert_covers_true_hits(&geometry, &bvh, ma, mb);

        let axis_aligned = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
        assert_covers_true_hits(&geometry, &bvh, Mat4::IDENTITY, axis_aligned);
    }

    #[test]
    fn test_single_leaf_trees_emit_cross_product() {
        let geometry = MeshGeometry::unit_cube();
        let bvh = Bvh::build(&geometry, BvhStopCriteria::MaxTrianglesPerLeaf(64));
        let pairs: Vec<_> = bvh
            .triangle_pairs(Mat4::IDENTITY, &bvh, Mat4::IDENTITY, 1e-6)
            .collect();
        assert_eq!(pairs.len(), 144);
    }

    #[test]
    fn test_descent_is_conservative() {
        let ga = soup(80, 21);
        let gb = soup(80, 42);
        let bvh_a = Bvh::build(&ga, BvhStopCriteria::MaxTrianglesPerLeaf(3));
        let bvh_b = Bvh::build(&gb, BvhStopCriteria::MaxTrianglesPerLeaf(5));

        let transforms = [
            (Mat4::IDENTITY, Mat4::from_translation(Vec3::new(0.7, 0.0, 0.0))),
            (
                Mat4::from_rotation_z(0.8),
                Mat4::from_scale_rotation_translation(
                    Vec3::new(1.5, 0.5, 1.0),
                    Quat::from_rotation_x(1.2),
                    Vec3::new(0.0, 1.0, -0.5),
                ),
            ),
        ];

        for (ma, mb) in transforms {
            let candidates: HashSet<(u32, u32)> =
                bvh_a.triangle_pairs(ma, &bvh_b, mb, 1e-6).collect();
            for (i, ta) in ga.triangles().enumerate() {
                for (j, tb) in gb.triangles().enumerate() {
                    if triangles_intersect(&ta.transformed(&ma), &tb.transformed(&mb), 1e-5) {
                        assert!(candidates.contains(&(i as u32, j as u32)));
                    }
                }
            }
            assert!(candidates.len() < 80 * 80);
        }
    }

    #[test]
    fn test_separated_meshes_prune_at_root() {
        let geometry = MeshGeometry::unit_cube();
        let bvh = Bvh::build(&geometry, BvhStopCriteria::MaxTrianglesPerLeaf(2));
        let mut iter = bvh.leaf_pairs(
            Mat4::IDENTITY,
            &bvh,
            Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)),
            1e-6,
        );
        assert!(iter.next().is_none());
        assert_eq!(iter.sat_tests(), 1);
    }
}
