//! Collision query engine.
//!
//! # Pipeline
//!
//! [`CollisionWorld::tick`] runs one pass of the state machine:
//!
//! 1. `BroadPhase`: refresh world matrices, re-home moved objects in the
//!    octree, pair each moved object with its octree candidates and drop
//!    pairs whose bounding spheres are apart
//! 2. `MidPhase`: SAT on the two BVH root boxes in world space
//! 3. `NarrowPhaseCollect`: lock-step BVH descent, every overlapping leaf
//!    pair appended to one frame-wide [`TriangleBatch`]
//! 4. `NarrowPhaseDispatch`: the whole batch goes to the
//!    [`TrianglePairTester`] in a single call
//! 5. `Resolved`: intersecting pairs become [`Contact`]s
//!
//! and returns to `Idle`. Only pairs with at least one moved object are
//! examined; two objects resting against each other report once.

mod broadphase;
pub mod contact;
mod narrowphase;
pub mod object;
pub mod tester;
pub mod transform;

use std::sync::Arc;

use slotmap::SlotMap;
use tracing::{debug, trace, warn};

use crate::error::{CollisionError, Result};
use crate::geometry::{BoundingSphere, Obb};
use crate::mesh::{BvhStopCriteria, CollisionMesh};
use crate::spatial::Octree;

pub use contact::{CollisionMetrics, Contact, TickReport, TickStats};
pub use object::{CollisionObject, ObjectId};
pub use tester::{
    BatchBlock, BatchResult, CpuTriangleTester, TriangleBatch, TrianglePairTester, WorkTile,
    WorldTriangle,
};
#[cfg(feature = "gpu")]
pub use tester::GpuTriangleTester;
pub use transform::{Transform, TransformArena, TransformId};

/// How confirmed contacts are decided once the mid phase passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NarrowPhaseMode {
    /// Exact triangle-triangle tests over every overlapping BVH leaf pair.
    #[default]
    Exact,
    /// Report a contact as soon as two BVH leaf boxes overlap. No dispatch.
    BoundingVolumes,
}

/// Where the pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelinePhase {
    #[default]
    Idle,
    BroadPhase,
    MidPhase,
    NarrowPhaseCollect,
    NarrowPhaseDispatch,
    Resolved,
}

/// Configuration for the collision world.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionConfig {
    /// Edge of a square work tile in lanes. Default: 8.
    pub tile_size: u32,
    /// Triangle pairs the batch holds per tick; the rest are dropped. Default: 65536.
    pub max_triangle_pairs: usize,
    /// When BVH construction stops subdividing. Default: 16 triangles per leaf.
    pub bvh_stop: BvhStopCriteria,
    /// Objects a node holds before it splits. Default: 12.
    pub octree_node_capacity: usize,
    /// Nodes never split below this half-extent. Default: 0.5.
    pub octree_min_half_extent: f32,
    /// Center of the octree root cube. Default: origin.
    pub world_center: glam::Vec3,
    /// Half-extent of the octree root cube. Default: 4096.
    pub world_half_extent: f32,
    /// Cross-product axes shorter than this are skipped by SAT. Default: 1e-6.
    pub sat_epsilon: f32,
    /// Plane-distance and interval tolerance of the triangle test. Default: 1e-5.
    pub triangle_epsilon: f32,
    /// Default: [`NarrowPhaseMode::Exact`].
    pub narrow_phase: NarrowPhaseMode,
    /// Worker threads for the CPU tester. Default: `None` (rayon's global pool).
    pub worker_threads: Option<usize>,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            tile_size: 8,
            max_triangle_pairs: 65_536,
            bvh_stop: BvhStopCriteria::default(),
            octree_node_capacity: 12,
            octree_min_half_extent: 0.5,
            world_center: glam::Vec3::ZERO,
            world_half_extent: 4096.0,
            sat_epsilon: 1e-6,
            triangle_epsilon: 1e-5,
            narrow_phase: NarrowPhaseMode::Exact,
            worker_threads: None,
        }
    }
}

impl CollisionConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CollisionError::InvalidConfig(msg));
        if self.tile_size == 0 {
            return invalid("tile_size must be at least 1".into());
        }
        if self.max_triangle_pairs == 0 {
            return invalid("max_triangle_pairs must be at least 1".into());
        }
        if self.max_triangle_pairs > u32::MAX as usize {
            return invalid(format!(
                "max_triangle_pairs {} exceeds the 32-bit slot range",
                self.max_triangle_pairs
            ));
        }
        match self.bvh_stop {
            BvhStopCriteria::MaxTrianglesPerLeaf(0) => {
                return invalid("bvh_stop leaf size must be at least 1".into());
            }
            BvhStopCriteria::MaxTrianglesPerLeaf(_) | BvhStopCriteria::MaxDepth(_) => {}
        }
        if self.octree_node_capacity == 0 {
            return invalid("octree_node_capacity must be at least 1".into());
        }
        if !(self.octree_min_half_extent.is_finite() && self.octree_min_half_extent > 0.0) {
            return invalid(format!(
                "octree_min_half_extent must be positive, got {}",
                self.octree_min_half_extent
            ));
        }
        if !self.world_center.is_finite()
            || !self.world_half_extent.is_finite()
            || self.world_half_extent < self.octree_min_half_extent
        {
            return invalid(format!(
                "world cube (center {:?}, half-extent {}) must be finite and at least \
                 octree_min_half_extent wide",
                self.world_center, self.world_half_extent
            ));
        }
        for (name, eps) in [
            ("sat_epsilon", self.sat_epsilon),
            ("triangle_epsilon", self.triangle_epsilon),
        ] {
            if !(eps.is_finite() && eps >= 0.0) {
                return invalid(format!("{name} must be finite and non-negative, got {eps}"));
            }
        }
        if self.worker_threads == Some(0) {
            return invalid("worker_threads must be at least 1".into());
        }
        Ok(())
    }
}

/// Objects, their transforms and the octree over them, plus the pipeline
/// that turns them into contacts each tick.
pub struct CollisionWorld {
    config: CollisionConfig,
    transforms: TransformArena,
    objects: SlotMap<ObjectId, CollisionObject>,
    octree: Octree<ObjectId>,
    tester: Box<dyn TrianglePairTester>,
    batch: TriangleBatch,
    phase: PipelinePhase,
    metrics: CollisionMetrics,
    /// Spawned since the last tick.
    spawned: Vec<ObjectId>,
    /// Objects with triangle pairs left untested by the last tick, through
    /// overflow or a failed dispatch.
    retry: Vec<ObjectId>,
}

impl CollisionWorld {
    /// Create a world that tests triangles on the CPU.
    pub fn new(config: CollisionConfig) -> Result<Self> {
        config.validate()?;
        let tester = match config.worker_threads {
            Some(threads) => CpuTriangleTester::with_threads(threads)?,
            None => CpuTriangleTester::new(),
        };
        Self::with_tester(config, Box::new(tester))
    }

    /// Create a world with a GPU tester sized from `config`.
    #[cfg(feature = "gpu")]
    pub fn with_gpu(config: CollisionConfig, ctx: &crate::context::WgpuContext) -> Result<Self> {
        config.validate()?;
        let tester = GpuTriangleTester::new(ctx, config.tile_size, config.max_triangle_pairs)?;
        Self::with_tester(config, Box::new(tester))
    }

    /// Create a world with a caller-supplied tester. The batch capacity is
    /// the smaller of `max_triangle_pairs` and the tester's own limit.
    pub fn with_tester(
        config: CollisionConfig,
        tester: Box<dyn TrianglePairTester>,
    ) -> Result<Self> {
        config.validate()?;
        let capacity = tester
            .capacity()
            .map_or(config.max_triangle_pairs, |c| c.min(config.max_triangle_pairs));
        debug!(
            backend = tester.name(),
            capacity,
            tile_size = config.tile_size,
            "Collision world created"
        );
        Ok(Self {
            octree: Octree::new(
                config.world_center,
                config.world_half_extent,
                config.octree_node_capacity,
                config.octree_min_half_extent,
            ),
            batch: TriangleBatch::new(config.tile_size, capacity),
            transforms: TransformArena::new(),
            objects: SlotMap::with_key(),
            tester,
            phase: PipelinePhase::Idle,
            metrics: CollisionMetrics::default(),
            spawned: Vec::new(),
            retry: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &CollisionConfig {
        &self.config
    }

    /// Swap the triangle tester. The batch capacity follows the new backend.
    pub fn set_tester(&mut self, tester: Box<dyn TrianglePairTester>) {
        let capacity = tester
            .capacity()
            .map_or(self.config.max_triangle_pairs, |c| {
                c.min(self.config.max_triangle_pairs)
            });
        self.batch.set_capacity(capacity);
        self.tester = tester;
    }

    pub fn tester_name(&self) -> &'static str {
        self.tester.name()
    }

    // ---------------------------------------------------------------------
    // Transforms
    // ---------------------------------------------------------------------

    pub fn transforms(&self) -> &TransformArena {
        &self.transforms
    }

    pub fn add_transform(&mut self, transform: Transform) -> Result<TransformId> {
        self.transforms.insert(transform)
    }

    /// Mutate a transform. Objects placed by it (or by a descendant) are
    /// re-evaluated on the next tick.
    pub fn update_transform<F>(&mut self, id: TransformId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transform),
    {
        self.transforms.update(id, f)
    }

    /// Remove a transform that no object and no child transform references.
    pub fn remove_transform(&mut self, id: TransformId) -> Result<Transform> {
        let users = self
            .objects
            .values()
            .filter(|o| o.transform() == id)
            .count();
        if users > 0 {
            return Err(CollisionError::TransformInUse(id, users));
        }
        self.transforms.remove(id)
    }

    // ---------------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------------

    /// Place an instance of `mesh` with `transform` and index it.
    ///
    /// The object takes part in the next tick as if it had moved.
    pub fn spawn(&mut self, mesh: Arc<CollisionMesh>, transform: TransformId) -> Result<ObjectId> {
        let world = self.transforms.world_matrix(transform)?;
        let id = self
            .objects
            .insert(CollisionObject::new(mesh, transform, world));
        if let Err(e) = self.octree.insert(id, &mut self.objects) {
            self.objects.remove(id);
            return Err(e);
        }
        self.spawned.push(id);
        trace!(object = ?id, "Spawned collision object");
        Ok(id)
    }

    pub fn despawn(&mut self, id: ObjectId) -> Result<CollisionObject> {
        if !self.objects.contains_key(id) {
            return Err(CollisionError::UnknownObject(id));
        }
        self.octree.remove(id, &mut self.objects);
        self.spawned.retain(|&s| s != id);
        self.retry.retain(|&r| r != id);
        self.objects
            .remove(id)
            .ok_or(CollisionError::UnknownObject(id))
    }

    pub fn object(&self, id: ObjectId) -> Option<&CollisionObject> {
        self.objects.get(id)
    }

    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &CollisionObject)> {
        self.objects.iter()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn octree(&self) -> &Octree<ObjectId> {
        &self.octree
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Objects whose bounding spheres overlap `sphere`, as of the last tick.
    pub fn query_sphere(&self, sphere: &BoundingSphere) -> Vec<ObjectId> {
        self.octree.query_sphere(sphere, &self.objects)
    }

    /// Whether any BVH leaf box of `id` overlaps the world-space box `volume`.
    pub fn overlaps_volume(&self, id: ObjectId, volume: &Obb) -> Result<bool> {
        let object = self
            .objects
            .get(id)
            .ok_or(CollisionError::UnknownObject(id))?;
        let world = object.world_matrix();
        let epsilon = self.config.sat_epsilon;
        if !object.root_obb().intersects(volume, epsilon) {
            return Ok(false);
        }
        Ok(object
            .mesh()
            .bvh()
            .leaf_boxes()
            .any(|(aabb, _)| Obb::from_aabb(&aabb, &world).intersects(volume, epsilon)))
    }

    /// Check octree placement for every object.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.octree.check_invariants(&self.objects)
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn metrics(&self) -> &CollisionMetrics {
        &self.metrics
    }

    // ---------------------------------------------------------------------
    // Tick
    // ---------------------------------------------------------------------

    fn enter(&mut self, phase: PipelinePhase) {
        trace!(from = ?self.phase, to = ?phase, "Collision pipeline phase");
        self.phase = phase;
    }

    /// Recompute world matrices, re-home changed objects in the octree and
    /// return every object that moved, was spawned or is due a retry, sorted.
    fn sync_objects(&mut self) -> Vec<ObjectId> {
        let matrices = self.transforms.world_matrices();
        let mut moved = std::mem::take(&mut self.spawned);
        moved.append(&mut self.retry);

        let ids: Vec<ObjectId> = self.objects.keys().collect();
        for id in ids {
            let transform = self.objects[id].transform();
            let Some(&world) = matrices.get(&transform) else {
                panic!("collision object {id:?} references removed transform {transform:?}");
            };
            if self.objects[id].sync(world) {
                self.octree.update_placement(id, &mut self.objects);
                moved.push(id);
            }
        }

        moved.sort_unstable();
        moved.dedup();
        moved
    }

    /// Run the pipeline once and return this tick's contacts.
    ///
    /// Overflowing the triangle-pair batch drops the excess pairs and logs a
    /// warning; it never fails the tick. Only a backend failure does. Either
    /// way the affected objects are re-evaluated on the next tick even if
    /// they stay still.
    pub fn tick(&mut self) -> Result<TickReport> {
        let mut stats = TickStats::default();

        self.enter(PipelinePhase::BroadPhase);
        let moved = self.sync_objects();
        stats.moved = moved.len();
        let broad = broadphase::find_pairs(&self.octree, &self.objects, &moved);
        stats.broad_tested = broad.tested;
        stats.broad_rejected = broad.rejected;

        self.enter(PipelinePhase::MidPhase);
        let sat_epsilon = self.config.sat_epsilon;
        let mut survivors = Vec::with_capacity(broad.pairs.len());
        for pair in broad.pairs {
            let (a, b) = narrowphase::pair_of(&self.objects, pair);
            stats.sat_tests += 1;
            if narrowphase::root_boxes_intersect(a, b, sat_epsilon) {
                survivors.push(pair);
            } else {
                stats.mid_rejected += 1;
            }
        }

        self.enter(PipelinePhase::NarrowPhaseCollect);
        let contacts = match self.config.narrow_phase {
            NarrowPhaseMode::Exact => self.exact_narrow_phase(&survivors, &mut stats)?,
            NarrowPhaseMode::BoundingVolumes => {
                let mut contacts = Vec::new();
                for &pair in &survivors {
                    let (a, b) = narrowphase::pair_of(&self.objects, pair);
                    let (contact, tests) =
                        narrowphase::first_leaf_overlap(pair, a, b, sat_epsilon);
                    stats.sat_tests += tests;
                    contacts.extend(contact);
                }
                self.enter(PipelinePhase::Resolved);
                contacts
            }
        };

        stats.contacts = contacts.len();
        self.metrics.record(&stats);
        debug!(
            moved = stats.moved,
            broad_tested = stats.broad_tested,
            broad_rejected = stats.broad_rejected,
            mid_rejected = stats.mid_rejected,
            sat_tests = stats.sat_tests,
            pairs = stats.pairs_collected,
            tiles = stats.tiles,
            contacts = stats.contacts,
            "Collision tick"
        );
        self.enter(PipelinePhase::Idle);

        Ok(TickReport { contacts, stats })
    }

    fn exact_narrow_phase(
        &mut self,
        survivors: &[(ObjectId, ObjectId)],
        stats: &mut TickStats,
    ) -> Result<Vec<Contact>> {
        self.batch.clear();
        for (group, &pair) in survivors.iter().enumerate() {
            let (a, b) = narrowphase::pair_of(&self.objects, pair);
            let dropped = self.batch.dropped();
            stats.sat_tests +=
                narrowphase::collect(group as u32, a, b, &mut self.batch, self.config.sat_epsilon);
            if self.batch.dropped() > dropped {
                self.retry.extend([pair.0, pair.1]);
            }
        }
        stats.pairs_collected = self.batch.pair_count();
        stats.pairs_dropped = self.batch.dropped();
        stats.tiles = self.batch.tiles().len();
        if stats.overflowed() {
            warn!(
                dropped = stats.pairs_dropped,
                capacity = self.batch.capacity(),
                "Triangle-pair buffer overflowed; excess pairs skipped this tick"
            );
        }

        self.enter(PipelinePhase::NarrowPhaseDispatch);
        let result = if self.batch.is_empty() {
            BatchResult::default()
        } else {
            match self.dispatch() {
                Ok(result) => result,
                Err(e) => {
                    self.retry.extend(survivors.iter().flat_map(|&(a, b)| [a, b]));
                    self.enter(PipelinePhase::Idle);
                    return Err(e);
                }
            }
        };
        stats.triangle_hits = result.total_hits() as usize;

        self.enter(PipelinePhase::Resolved);
        Ok(narrowphase::resolve(&self.batch, &result, survivors))
    }

    fn dispatch(&mut self) -> Result<BatchResult> {
        let result = self
            .tester
            .test(&self.batch, self.config.triangle_epsilon)?;
        if result.pair_hits.len() != self.batch.pair_count()
            || result.tile_counts.len() != self.batch.tiles().len()
        {
            return Err(CollisionError::Backend(anyhow::anyhow!(
                "{} tester returned {} hits for {} pairs and {} counts for {} tiles",
                self.tester.name(),
                result.pair_hits.len(),
                self.batch.pair_count(),
                result.tile_counts.len(),
                self.batch.tiles().len()
            )));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for CollisionWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollisionWorld")
            .field("objects", &self.objects.len())
            .field("transforms", &self.transforms.len())
            .field("octree_nodes", &self.octree.node_count())
            .field("backend", &self.tester.name())
            .field("phase", &self.phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    use crate::mesh::MeshGeometry;

    fn cube() -> Arc<CollisionMesh> {
        Arc::new(CollisionMesh::new(
            MeshGeometry::unit_cube(),
            BvhStopCriteria::default(),
        ))
    }

    fn spawn_at(world: &mut CollisionWorld, mesh: &Arc<CollisionMesh>, p: Vec3) -> ObjectId {
        let t = world.add_transform(Transform::from_position(p)).unwrap();
        world.spawn(mesh.clone(), t).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        CollisionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = [
            CollisionConfig {
                tile_size: 0,
                ..Default::default()
            },
            CollisionConfig {
                max_triangle_pairs: 0,
                ..Default::default()
            },
            CollisionConfig {
                bvh_stop: BvhStopCriteria::MaxTrianglesPerLeaf(0),
                ..Default::default()
            },
            CollisionConfig {
                octree_min_half_extent: 0.0,
                ..Default::default()
            },
            CollisionConfig {
                triangle_epsilon: f32::NAN,
                ..Default::default()
            },
            CollisionConfig {
                worker_threads: Some(0),
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                CollisionWorld::new(config),
                Err(CollisionError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_overlapping_cubes_collide() {
        let mut world = CollisionWorld::new(CollisionConfig::default()).unwrap();
        let mesh = cube();
        let a = spawn_at(&mut world, &mesh, Vec3::ZERO);
        let b = spawn_at(&mut world, &mesh, Vec3::new(0.5, 0.0, 0.0));

        let report = world.tick().unwrap();
        assert_eq!(report.stats.moved, 2);
        assert_eq!(report.stats.broad_tested, 1);
        assert_eq!(report.stats.broad_rejected, 0);
        assert_eq!(report.stats.mid_rejected, 0);
        assert!(report.stats.pairs_collected > 0);
        assert!(report.stats.triangle_hits > 0);
        assert_eq!(report.contacts.len(), 1);

        let contact = &report.contacts[0];
        assert_eq!((contact.object_a, contact.object_b), (a.min(b), a.max(b)));
        assert!(!contact.triangle_pairs.is_empty());
        assert!((contact.point.y).abs() <= 0.5 + 1e-5);
        assert_eq!(world.phase(), PipelinePhase::Idle);
        assert_eq!(world.metrics().contacts_total, 1);
    }

    #[test]
    fn test_far_cubes_rejected_at_broad_phase() {
        let mut world = CollisionWorld::new(CollisionConfig::default()).unwrap();
        let mesh = cube();
        spawn_at(&mut world, &mesh, Vec3::ZERO);
        spawn_at(&mut world, &mesh, Vec3::new(3.0, 0.0, 0.0));

        let report = world.tick().unwrap();
        assert_eq!(report.stats.broad_tested, 1);
        assert_eq!(report.stats.broad_rejected, 1);
        assert_eq!(report.stats.sat_tests, 0);
        assert_eq!(report.stats.pairs_collected, 0);
        assert!(report.contacts.is_empty());
    }

    #[test]
    fn test_rotated_cube_rejected_at_mid_phase() {
        let mut world = CollisionWorld::new(CollisionConfig::default()).unwrap();
        let mesh = cube();
        spawn_at(&mut world, &mesh, Vec3::ZERO);
        // spheres (radius ~0.866) overlap at distance 1.2, boxes do not
        let t = world
            .add_transform(
                Transform::from_position(Vec3::new(1.2, 0.0, 0.0))
                    .with_rotation(Quat::from_rotation_z(0.1)),
            )
            .unwrap();
        world.spawn(mesh, t).unwrap();

        let report = world.tick().unwrap();
        assert_eq!(report.stats.broad_rejected, 0);
        assert_eq!(report.stats.mid_rejected, 1);
        assert_eq!(report.stats.sat_tests, 1);
        assert!(report.contacts.is_empty());
    }

    #[test]
    fn test_idle_tick_has_no_work() {
        let mut world = CollisionWorld::new(CollisionConfig::default()).unwrap();
        let mesh = cube();
        spawn_at(&mut world, &mesh, Vec3::ZERO);
        spawn_at(&mut world, &mesh, Vec3::new(0.5, 0.0, 0.0));
        assert_eq!(world.tick().unwrap().contacts.len(), 1);

        let nodes_before: Vec<_> = world.objects().map(|(_, o)| o.octree_node()).collect();
        let report = world.tick().unwrap();
        let nodes_after: Vec<_> = world.objects().map(|(_, o)| o.octree_node()).collect();
        assert_eq!(report.stats.moved, 0);
        assert_eq!(report.stats.broad_tested, 0);
        assert!(report.contacts.is_empty());
        assert_eq!(nodes_before, nodes_after);
        assert_eq!(world.metrics().ticks, 2);
    }

    #[test]
    fn test_moving_into_contact() {
        let mut world = CollisionWorld::new(CollisionConfig::default()).unwrap();
        let mesh = cube();
        spawn_at(&mut world, &mesh, Vec3::ZERO);
        let t = world
            .add_transform(Transform::from_position(Vec3::new(10.0, 0.0, 0.0)))
            .unwrap();
        world.spawn(mesh, t).unwrap();
        assert!(world.tick().unwrap().contacts.is_empty());

        world
            .update_transform(t, |tr| tr.position = Vec3::new(0.75, 0.25, 0.0))
            .unwrap();
        let report = world.tick().unwrap();
        assert_eq!(report.stats.moved, 1);
        assert_eq!(report.contacts.len(), 1);
        world.check_invariants().unwrap();
    }

    #[test]
    fn test_parent_anchor_moves_children() {
        let mut world = CollisionWorld::new(CollisionConfig::default()).unwrap();
        let mesh = cube();
        spawn_at(&mut world, &mesh, Vec3::ZERO);

        let carrier = world
            .add_transform(Transform::from_position(Vec3::new(20.0, 0.0, 0.0)))
            .unwrap();
        let turret = world
            .add_transform(
                Transform::from_position(Vec3::new(0.5, 0.0, 0.0)).with_parent(carrier),
            )
            .unwrap();
        let id = world.spawn(mesh, turret).unwrap();
        assert!(world.tick().unwrap().contacts.is_empty());

        // moving only the parent drags the child onto the first cube
        world
            .update_transform(carrier, |t| t.position = Vec3::ZERO)
            .unwrap();
        let report = world.tick().unwrap();
        assert_eq!(report.stats.moved, 1);
        assert_eq!(report.contacts.len(), 1);
        let center = world.object(id).unwrap().bounding_sphere().center;
        assert!((center - Vec3::new(0.5, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_overflow_counted_once_per_tick() {
        let config = CollisionConfig {
            max_triangle_pairs: 10,
            ..Default::default()
        };
        let mut world = CollisionWorld::new(config).unwrap();
        let mesh = cube();
        spawn_at(&mut world, &mesh, Vec3::ZERO);
        spawn_at(&mut world, &mesh, Vec3::new(0.25, 0.0, 0.0));
        let t = world
            .add_transform(Transform::from_position(Vec3::new(0.5, 0.0, 0.0)))
            .unwrap();
        world.spawn(mesh, t).unwrap();

        // three overlapping pairs of 12 x 12 triangles into 10 slots
        let report = world.tick().unwrap();
        assert_eq!(report.stats.pairs_collected, 10);
        assert_eq!(report.stats.pairs_dropped, 3 * 144 - 10);
        assert!(report.contacts.len() <= 1);
        for contact in &report.contacts {
            assert!(contact.triangle_pairs.len() <= 10);
        }
        assert_eq!(world.metrics().overflow_ticks, 1);

        world
            .update_transform(t, |tr| tr.position.y = 0.1)
            .unwrap();
        let report = world.tick().unwrap();
        assert!(report.stats.overflowed());
        assert_eq!(world.metrics().overflow_ticks, 2);
        assert_eq!(world.metrics().ticks, 2);
        assert_eq!(world.phase(), PipelinePhase::Idle);
    }

    #[test]
    fn test_bounding_volume_mode() {
        let config = CollisionConfig {
            narrow_phase: NarrowPhaseMode::BoundingVolumes,
            ..Default::default()
        };
        let mut world = CollisionWorld::new(config).unwrap();
        let mesh = cube();
        spawn_at(&mut world, &mesh, Vec3::ZERO);
        spawn_at(&mut world, &mesh, Vec3::new(0.5, 0.0, 0.0));

        let report = world.tick().unwrap();
        assert_eq!(report.contacts.len(), 1);
        assert!(report.contacts[0].triangle_pairs.is_empty());
        assert_eq!(report.stats.pairs_collected, 0);
        assert_eq!(report.stats.tiles, 0);
    }

    #[test]
    fn test_spawn_outside_world_fails() {
        let config = CollisionConfig {
            world_half_extent: 10.0,
            ..Default::default()
        };
        let mut world = CollisionWorld::new(config).unwrap();
        let t = world
            .add_transform(Transform::from_position(Vec3::new(50.0, 0.0, 0.0)))
            .unwrap();
        assert!(matches!(
            world.spawn(cube(), t),
            Err(CollisionError::OutsideWorld { .. })
        ));
        assert_eq!(world.object_count(), 0);
    }

    #[test]
    fn test_transform_removal_guarded() {
        let mut world = CollisionWorld::new(CollisionConfig::default()).unwrap();
        let t = world.add_transform(Transform::identity()).unwrap();
        let id = world.spawn(cube(), t).unwrap();
        assert!(matches!(
            world.remove_transform(t),
            Err(CollisionError::TransformInUse(_, 1))
        ));
        world.despawn(id).unwrap();
        world.remove_transform(t).unwrap();
        assert!(matches!(
            world.despawn(id),
            Err(CollisionError::UnknownObject(_))
        ));
        assert!(world.octree().is_empty());
    }

    #[test]
    fn test_queries() {
        let mut world = CollisionWorld::new(CollisionConfig::default()).unwrap();
        let mesh = cube();
        let near = spawn_at(&mut world, &mesh, Vec3::ZERO);
        let far = spawn_at(&mut world, &mesh, Vec3::new(100.0, 0.0, 0.0));

        let hits = world.query_sphere(&BoundingSphere::new(Vec3::new(1.0, 0.0, 0.0), 0.5));
        assert_eq!(hits, vec![near]);

        let probe = Obb::from_aabb_world(&crate::geometry::Aabb::new(
            Vec3::new(0.4, 0.4, 0.4),
            Vec3::new(1.0, 1.0, 1.0),
        ));
        assert!(world.overlaps_volume(near, &probe).unwrap());
        assert!(!world.overlaps_volume(far, &probe).unwrap());
    }

    struct FailingTester;

    impl TrianglePairTester for FailingTester {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn capacity(&self) -> Option<usize> {
            Some(100)
        }

        fn test(&mut self, _: &TriangleBatch, _: f32) -> anyhow::Result<BatchResult> {
            anyhow::bail!("device lost")
        }
    }

    #[test]
    fn test_backend_failure_returns_to_idle() {
        let mut world =
            CollisionWorld::with_tester(CollisionConfig::default(), Box::new(FailingTester))
                .unwrap();
        let mesh = cube();
        spawn_at(&mut world, &mesh, Vec3::ZERO);
        spawn_at(&mut world, &mesh, Vec3::new(0.5, 0.0, 0.0));

        let err = world.tick().unwrap_err();
        assert!(matches!(err, CollisionError::Backend(_)));
        assert_eq!(world.phase(), PipelinePhase::Idle);
        assert_eq!(world.metrics().ticks, 0);
    }

    /// CPU tester behind a tiny batch capacity.
    struct NarrowTester(CpuTriangleTester);

    impl TrianglePairTester for NarrowTester {
        fn name(&self) -> &'static str {
            "narrow"
        }

        fn capacity(&self) -> Option<usize> {
            Some(1)
        }

        fn test(&mut self, batch: &TriangleBatch, epsilon: f32) -> anyhow::Result<BatchResult> {
            self.0.test(batch, epsilon)
        }
    }

    #[test]
    fn test_dropped_pairs_retested_while_still() {
        let tester = NarrowTester(CpuTriangleTester::new());
        let mut world =
            CollisionWorld::with_tester(CollisionConfig::default(), Box::new(tester)).unwrap();
        let mesh = cube();
        spawn_at(&mut world, &mesh, Vec3::ZERO);
        spawn_at(&mut world, &mesh, Vec3::new(0.9, 0.6, 0.3));

        let report = world.tick().unwrap();
        assert!(report.stats.overflowed());

        // nothing moved, but the pair is examined again
        let report = world.tick().unwrap();
        assert_eq!(report.stats.broad_tested, 1);
        assert!(report.stats.overflowed());

        world.set_tester(Box::new(CpuTriangleTester::new()));
        let report = world.tick().unwrap();
        assert!(!report.stats.overflowed());
        assert_eq!(report.contacts.len(), 1);

        let report = world.tick().unwrap();
        assert_eq!(report.stats.broad_tested, 0);
        assert!(report.contacts.is_empty());
    }

    #[test]
    fn test_failed_dispatch_retested_next_tick() {
        let mut world =
            CollisionWorld::with_tester(CollisionConfig::default(), Box::new(FailingTester))
                .unwrap();
        let mesh = cube();
        spawn_at(&mut world, &mesh, Vec3::ZERO);
        spawn_at(&mut world, &mesh, Vec3::new(0.5, 0.0, 0.0));
        assert!(world.tick().is_err());

        world.set_tester(Box::new(CpuTriangleTester::new()));
        let report = world.tick().unwrap();
        assert_eq!(report.stats.broad_tested, 1);
        assert_eq!(report.contacts.len(), 1);
    }

    #[test]
    fn test_tester_capacity_caps_batch() {
        let mut world =
            CollisionWorld::with_tester(CollisionConfig::default(), Box::new(FailingTester))
                .unwrap();
        assert_eq!(world.batch.capacity(), 100);
        world.set_tester(Box::new(CpuTriangleTester::new()));
        assert_eq!(world.batch.capacity(), 65_536);
        assert_eq!(world.tester_name(), "cpu");
    }
}
