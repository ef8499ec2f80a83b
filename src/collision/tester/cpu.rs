//! Data-parallel CPU backend.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use super::{BatchResult, TriangleBatch, TrianglePairTester, WorkTile};
use crate::geometry::triangles_intersect;

/// Runs every tile as a rayon task and every lane within it as a sub-task.
///
/// Each tile owns one atomic counter that its lanes increment on a hit;
/// pair outcomes go to per-slot atomics. Nothing else is shared.
#[derive(Debug, Default)]
pub struct CpuTriangleTester {
    pool: Option<rayon::ThreadPool>,
}

impl CpuTriangleTester {
    /// Use rayon's global pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a dedicated pool of `threads` workers.
    pub fn with_threads(threads: usize) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tri-tri-{i}"))
            .build()?;
        Ok(Self { pool: Some(pool) })
    }

    fn run(batch: &TriangleBatch, epsilon: f32) -> BatchResult {
        let a = batch.a_triangles();
        let b = batch.b_triangles();
        let counters: Vec<AtomicU32> = batch.tiles().iter().map(|_| AtomicU32::new(0)).collect();
        let hits: Vec<AtomicU32> = (0..batch.pair_count()).map(|_| AtomicU32::new(0)).collect();

        batch
            .tiles()
            .par_iter()
            .zip(counters.par_iter())
            .for_each(|(tile, counter)| {
                let WorkTile {
                    a_start,
                    b_start,
                    a_len,
                    b_len,
                    slot_start,
                    slot_stride,
                    ..
                } = *tile;
                (0..a_len * b_len).into_par_iter().for_each(|lane| {
                    let x = lane / b_len;
                    let y = lane % b_len;
                    let ta = a[(a_start + x) as usize].to_triangle();
                    let tb = b[(b_start + y) as usize].to_triangle();
                    if triangles_intersect(&ta, &tb, epsilon) {
                        counter.fetch_add(1, Ordering::Relaxed);
                        let slot = (slot_start + x * slot_stride + y) as usize;
                        hits[slot].store(1, Ordering::Relaxed);
                    }
                });
            });

        // for_each joins every task before returning
        BatchResult {
            tile_counts: counters.into_iter().map(AtomicU32::into_inner).collect(),
            pair_hits: hits.into_iter().map(AtomicU32::into_inner).collect(),
        }
    }
}

impl TrianglePairTester for CpuTriangleTester {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn test(&mut self, batch: &TriangleBatch, epsilon: f32) -> anyhow::Result<BatchResult> {
        Ok(match &self.pool {
            Some(pool) => pool.install(|| Self::run(batch, epsilon)),
            None => Self::run(batch, epsilon),
        })
    }
}
