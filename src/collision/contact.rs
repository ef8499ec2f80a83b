//! Tick output: confirmed contacts, per-tick statistics and cumulative metrics.

use glam::Vec3;

use super::object::ObjectId;

/// A confirmed collision between two objects.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    /// The lesser of the two ids; `object_b` is the greater.
    pub object_a: ObjectId,
    pub object_b: ObjectId,
    /// Estimated contact point: mean centroid of the intersecting world triangles.
    pub point: Vec3,
    /// Mean face normal of `object_a`'s intersecting triangles (unit, or zero
    /// when unknown).
    pub normal_a: Vec3,
    /// Mean face normal of `object_b`'s intersecting triangles.
    pub normal_b: Vec3,
    /// Intersecting local triangle indices `(a, b)`. Empty in bounding-volume mode.
    pub triangle_pairs: Vec<(u32, u32)>,
}

/// Counters for a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Objects whose world matrix changed, that were spawned, or whose pairs
    /// were left untested by the previous tick.
    pub moved: usize,
    /// Distinct object pairs examined in the broad phase.
    pub broad_tested: usize,
    /// Pairs rejected by the sphere test.
    pub broad_rejected: usize,
    /// OBB SAT tests run, root and BVH descent combined.
    pub sat_tests: usize,
    /// Pairs rejected by the root OBB test.
    pub mid_rejected: usize,
    /// Triangle pairs written to the batch.
    pub pairs_collected: usize,
    /// Triangle pairs dropped because the batch was full.
    pub pairs_dropped: usize,
    /// Work tiles dispatched.
    pub tiles: usize,
    /// Intersecting triangle pairs reported by the tester.
    pub triangle_hits: usize,
    pub contacts: usize,
}

impl TickStats {
    pub fn overflowed(&self) -> bool {
        self.pairs_dropped > 0
    }
}

/// What [`CollisionWorld::tick`](super::CollisionWorld::tick) returns.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub contacts: Vec<Contact>,
    pub stats: TickStats,
}

/// Counters accumulated over the world's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollisionMetrics {
    pub ticks: u64,
    /// Ticks in which the triangle-pair batch overflowed.
    pub overflow_ticks: u64,
    pub dropped_pairs_total: u64,
    pub contacts_total: u64,
}

impl CollisionMetrics {
    pub(crate) fn record(&mut self, stats: &TickStats) {
        self.ticks += 1;
        if stats.overflowed() {
            self.overflow_ticks += 1;
        }
        self.dropped_pairs_total += stats.pairs_dropped as u64;
        self.contacts_total += stats.contacts as u64;
    }
}
