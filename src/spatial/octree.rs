//! Octree over world-space bounding spheres.
//!
//! Nodes live in an arena indexed by [`NodeId`]. A node owns a list of object
//! keys; each object records the node it lives in through [`SpatialEntry`].
//! Neither side owns the other.
//!
//! Placement rule: an object sits in the deepest existing node whose cube
//! strictly contains its sphere. Nodes split lazily once they hold
//! `capacity` objects, and only while children would stay at least
//! `min_half_extent` wide. The root holds anything that fits nowhere else,
//! including spheres that have left the world volume.

use glam::Vec3;
use slotmap::{Key, SlotMap};
use tracing::warn;

use crate::error::{CollisionError, Result};
use crate::geometry::BoundingSphere;

/// Index of an octree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// What the octree needs from the objects it indexes.
pub trait SpatialEntry {
    fn sphere(&self) -> BoundingSphere;
    fn node(&self) -> Option<NodeId>;
    fn set_node(&mut self, node: Option<NodeId>);
}

#[derive(Debug, Clone)]
struct OctreeNode<K> {
    center: Vec3,
    half_extent: f32,
    parent: Option<NodeId>,
    /// Slot in the parent's `children`.
    octant: u8,
    depth: u32,
    children: [Option<NodeId>; 8],
    split: bool,
    objects: Vec<K>,
}

impl<K> OctreeNode<K> {
    fn new(center: Vec3, half_extent: f32, parent: Option<NodeId>, octant: u8, depth: u32) -> Self {
        Self {
            center,
            half_extent,
            parent,
            octant,
            depth,
            children: [None; 8],
            split: false,
            objects: Vec::new(),
        }
    }

    fn has_children(&self) -> bool {
        self.children.iter().any(Option::is_some)
    }
}

/// Strict containment of a sphere in an axis-aligned cube.
#[inline]
fn cube_contains(center: Vec3, half_extent: f32, sphere: &BoundingSphere) -> bool {
    let d = (sphere.center - center).abs() + Vec3::splat(sphere.radius);
    d.max_element() < half_extent
}

/// Sphere touches the cube (closed).
#[inline]
fn cube_touches(center: Vec3, half_extent: f32, sphere: &BoundingSphere) -> bool {
    let min = center - Vec3::splat(half_extent);
    let max = center + Vec3::splat(half_extent);
    let closest = sphere.center.clamp(min, max);
    closest.distance_squared(sphere.center) <= sphere.radius * sphere.radius
}

#[inline]
fn octant_offset(octant: u8) -> Vec3 {
    Vec3::new(
        if octant & 1 != 0 { 1.0 } else { -1.0 },
        if octant & 2 != 0 { 1.0 } else { -1.0 },
        if octant & 4 != 0 { 1.0 } else { -1.0 },
    )
}

fn entry<K: Key, T: SpatialEntry>(objects: &SlotMap<K, T>, key: K) -> &T {
    match objects.get(key) {
        Some(object) => object,
        None => panic!("octree references removed object {key:?}"),
    }
}

fn entry_mut<K: Key, T: SpatialEntry>(objects: &mut SlotMap<K, T>, key: K) -> &mut T {
    match objects.get_mut(key) {
        Some(object) => object,
        None => panic!("octree references removed object {key:?}"),
    }
}

/// Octree keyed by the object arena's key type.
#[derive(Debug, Clone)]
pub struct Octree<K: Key> {
    nodes: Vec<Option<OctreeNode<K>>>,
    free: Vec<NodeId>,
    capacity: usize,
    min_half_extent: f32,
    len: usize,
}

impl<K: Key> Octree<K> {
    /// World cube centred on `center` with half-extent `half_extent`.
    pub fn new(center: Vec3, half_extent: f32, capacity: usize, min_half_extent: f32) -> Self {
        Self {
            nodes: vec![Some(OctreeNode::new(center, half_extent, None, 0, 0))],
            free: Vec::new(),
            capacity: capacity.max(1),
            min_half_extent,
            len: 0,
        }
    }

    fn node(&self, id: NodeId) -> &OctreeNode<K> {
        match self.nodes.get(id.index()) {
            Some(Some(node)) => node,
            _ => panic!("stale octree node {id:?}"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut OctreeNode<K> {
        match self.nodes.get_mut(id.index()) {
            Some(Some(node)) => node,
            _ => panic!("stale octree node {id:?}"),
        }
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Number of indexed objects.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Cube of a live node as `(center, half_extent)`.
    pub fn node_bounds(&self, id: NodeId) -> (Vec3, f32) {
        let node = self.node(id);
        (node.center, node.half_extent)
    }

    pub fn node_depth(&self, id: NodeId) -> u32 {
        self.node(id).depth
    }

    /// Whether `sphere` lies inside the world cube.
    pub fn in_world(&self, sphere: &BoundingSphere) -> bool {
        let root = self.node(NodeId::ROOT);
        cube_contains(root.center, root.half_extent, sphere)
    }

    /// Octant of `id` that strictly contains `sphere`, if children there
    /// would not be below the minimum size.
    fn fitting_octant(&self, id: NodeId, sphere: &BoundingSphere) -> Option<u8> {
        let node = self.node(id);
        let child_half = node.half_extent * 0.5;
        if child_half < self.min_half_extent {
            return None;
        }
        let rel = sphere.center - node.center;
        let octant =
            (rel.x >= 0.0) as u8 | ((rel.y >= 0.0) as u8) << 1 | ((rel.z >= 0.0) as u8) << 2;
        let child_center = node.center + octant_offset(octant) * child_half;
        cube_contains(child_center, child_half, sphere).then_some(octant)
    }

    fn alloc(&mut self, node: OctreeNode<K>) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id.index()] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            NodeId(self.nodes.len() as u32 - 1)
        }
    }

    fn child_or_create(&mut self, id: NodeId, octant: u8) -> NodeId {
        if let Some(child) = self.node(id).children[octant as usize] {
            return child;
        }
        let parent = self.node(id);
        let child_half = parent.half_extent * 0.5;
        let child = OctreeNode::new(
            parent.center + octant_offset(octant) * child_half,
            child_half,
            Some(id),
            octant,
            parent.depth + 1,
        );
        let child_id = self.alloc(child);
        self.node_mut(id).children[octant as usize] = Some(child_id);
        child_id
    }

    fn attach<T: SpatialEntry>(&mut self, id: NodeId, key: K, objects: &mut SlotMap<K, T>) {
        self.node_mut(id).objects.push(key);
        entry_mut(objects, key).set_node(Some(id));
    }

    /// Remove `key` from the list of `id`. Panics if it is not there.
    fn detach(&mut self, id: NodeId, key: K) {
        let list = &mut self.node_mut(id).objects;
        match list.iter().position(|&k| k == key) {
            Some(pos) => {
                list.swap_remove(pos);
            }
            None => panic!("object {key:?} points at octree node {id:?} which does not list it"),
        }
    }

    /// Push the objects of an unsplit node down into newly created children.
    fn split<T: SpatialEntry>(&mut self, id: NodeId, objects: &mut SlotMap<K, T>) {
        let node = self.node_mut(id);
        node.split = true;
        let resident = std::mem::take(&mut node.objects);
        let mut stay = Vec::new();
        for key in resident {
            let sphere = entry(objects, key).sphere();
            match self.fitting_octant(id, &sphere) {
                Some(octant) => {
                    let child = self.child_or_create(id, octant);
                    self.attach(child, key, objects);
                }
                None => stay.push(key),
            }
        }
        self.node_mut(id).objects = stay;
    }

    /// Descend from `start` to the placement node for `sphere`, splitting full
    /// leaves on the way, and attach `key` there.
    fn place_from<T: SpatialEntry>(
        &mut self,
        start: NodeId,
        key: K,
        sphere: &BoundingSphere,
        objects: &mut SlotMap<K, T>,
    ) -> NodeId {
        let mut id = start;
        loop {
            if self.node(id).split {
                match self.fitting_octant(id, sphere) {
                    Some(octant) => id = self.child_or_create(id, octant),
                    None => break,
                }
            } else if self.node(id).objects.len() >= self.capacity
                && self.fitting_octant(id, sphere).is_some()
            {
                self.split(id, objects);
            } else {
                break;
            }
        }
        self.attach(id, key, objects);
        id
    }

    /// Free empty childless nodes from `id` upward. The root is never freed.
    fn prune(&mut self, mut id: NodeId) {
        loop {
            let node = self.node(id);
            if node.has_children() {
                return;
            }
            let Some(parent) = node.parent else {
                self.node_mut(id).split = false;
                return;
            };
            if !node.objects.is_empty() {
                return;
            }
            let octant = node.octant as usize;
            self.nodes[id.index()] = None;
            self.free.push(id);
            let parent_node = self.node_mut(parent);
            parent_node.children[octant] = None;
            if !parent_node.has_children() {
                parent_node.split = false;
            }
            id = parent;
        }
    }

    /// Index `key` by its current sphere.
    ///
    /// Fails with [`CollisionError::OutsideWorld`] if the sphere is not inside
    /// the world cube.
    pub fn insert<T: SpatialEntry>(
        &mut self,
        key: K,
        objects: &mut SlotMap<K, T>,
    ) -> Result<NodeId> {
        let sphere = entry(objects, key).sphere();
        if !self.in_world(&sphere) {
            return Err(CollisionError::OutsideWorld {
                center: sphere.center,
                radius: sphere.radius,
            });
        }
        if let Some(node) = entry(objects, key).node() {
            panic!("object {key:?} inserted twice (already in node {node:?})");
        }
        self.len += 1;
        Ok(self.place_from(NodeId::ROOT, key, &sphere, objects))
    }

    /// Unindex `key` and prune the nodes this empties. Returns false if the
    /// object was not indexed.
    pub fn remove<T: SpatialEntry>(&mut self, key: K, objects: &mut SlotMap<K, T>) -> bool {
        let Some(id) = entry(objects, key).node() else {
            return false;
        };
        self.detach(id, key);
        entry_mut(objects, key).set_node(None);
        self.len -= 1;
        self.prune(id);
        true
    }

    /// Re-home `key` after its sphere changed.
    ///
    /// Returns immediately if the object still fits its node and, for a
    /// split node, still fits none of its octants. Otherwise the object
    /// moves up to the nearest ancestor that contains it and back down.
    pub fn update_placement<T: SpatialEntry>(
        &mut self,
        key: K,
        objects: &mut SlotMap<K, T>,
    ) -> NodeId {
        let object = entry(objects, key);
        let sphere = object.sphere();
        let Some(current) = object.node() else {
            panic!("update_placement on unindexed object {key:?}");
        };

        let node = self.node(current);
        let fits_here =
            node.parent.is_none() || cube_contains(node.center, node.half_extent, &sphere);
        let fits_below = node.split && self.fitting_octant(current, &sphere).is_some();
        if fits_here && !fits_below {
            if node.parent.is_none() && !self.in_world(&sphere) {
                warn!(
                    object = ?key,
                    center = ?sphere.center,
                    radius = sphere.radius,
                    "Collision object left the world volume; keeping it at the octree root"
                );
            }
            return current;
        }

        self.detach(current, key);

        let mut target = current;
        loop {
            let node = self.node(target);
            if cube_contains(node.center, node.half_extent, &sphere) {
                break;
            }
            match node.parent {
                Some(parent) => target = parent,
                None => break,
            }
        }

        let placed = if target == NodeId::ROOT && !self.in_world(&sphere) {
            warn!(
                object = ?key,
                center = ?sphere.center,
                radius = sphere.radius,
                "Collision object left the world volume; keeping it at the octree root"
            );
            self.attach(NodeId::ROOT, key, objects);
            NodeId::ROOT
        } else {
            self.place_from(target, key, &sphere, objects)
        };

        self.prune(current);
        placed
    }

    /// Every object that could overlap `key`'s sphere: objects in its node,
    /// in that node's subtree, and in all its ancestors. `key` itself is
    /// excluded. No sphere filtering is done.
    pub fn query_candidates<T: SpatialEntry>(&self, key: K, objects: &SlotMap<K, T>) -> Vec<K> {
        let Some(home) = entry(objects, key).node() else {
            return Vec::new();
        };
        let mut out = Vec::new();

        let mut ancestor = self.node(home).parent;
        while let Some(id) = ancestor {
            let node = self.node(id);
            out.extend_from_slice(&node.objects);
            ancestor = node.parent;
        }

        let mut stack = vec![home];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            out.extend(node.objects.iter().copied().filter(|&k| k != key));
            stack.extend(node.children.iter().flatten());
        }
        out
    }

    /// Objects whose spheres overlap `sphere`, whether or not the query
    /// sphere itself is indexed.
    pub fn query_sphere<T: SpatialEntry>(
        &self,
        sphere: &BoundingSphere,
        objects: &SlotMap<K, T>,
    ) -> Vec<K> {
        let mut out = Vec::new();
        let mut stack = vec![NodeId::ROOT];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            out.extend(
                node.objects
                    .iter()
                    .copied()
                    .filter(|&k| entry(objects, k).sphere().overlaps(sphere)),
            );
            for &child in node.children.iter().flatten() {
                let c = self.node(child);
                if cube_touches(c.center, c.half_extent, sphere) {
                    stack.push(child);
                }
            }
        }
        out
    }

    /// Check the structural invariants and describe the first violation.
    ///
    /// - every listed object points back at its node
    /// - every non-root object's sphere is strictly inside its node
    /// - objects of a split node fit none of its octants
    /// - no non-root node is empty and childless
    /// - every indexed object is listed exactly once
    pub fn check_invariants<T: SpatialEntry>(
        &self,
        objects: &SlotMap<K, T>,
    ) -> std::result::Result<(), String> {
        let mut listed = 0usize;
        for (index, slot) in self.nodes.iter().enumerate() {
            let Some(node) = slot else { continue };
            let id = NodeId(index as u32);

            if let Some(parent) = node.parent {
                if self.node(parent).children[node.octant as usize] != Some(id) {
                    return Err(format!("node {id:?} is not linked from its parent {parent:?}"));
                }
                if node.objects.is_empty() && !node.has_children() {
                    return Err(format!("node {id:?} is empty and childless"));
                }
            }
            if node.split != node.has_children() {
                return Err(format!("node {id:?} split flag disagrees with its children"));
            }

            for &key in &node.objects {
                listed += 1;
                let Some(object) = objects.get(key) else {
                    return Err(format!("node {id:?} lists removed object {key:?}"));
                };
                if object.node() != Some(id) {
                    return Err(format!(
                        "object {key:?} listed in {id:?} but points at {:?}",
                        object.node()
                    ));
                }
                let sphere = object.sphere();
                let inside = cube_contains(node.center, node.half_extent, &sphere);
                if node.parent.is_some() && !inside {
                    return Err(format!("object {key:?} does not fit node {id:?}"));
                }
                if node.split && self.fitting_octant(id, &sphere).is_some() {
                    return Err(format!("object {key:?} in {id:?} fits a child octant"));
                }
            }
        }

        let indexed = objects.values().filter(|o| o.node().is_some()).count();
        if listed != indexed || listed != self.len {
            return Err(format!(
                "{listed} objects listed, {indexed} indexed, length {}",
                self.len
            ));
        }
        Ok(())
    }
}
