//! Parallel triangle-pair testing.
//!
//! A [`TriangleBatch`] holds every triangle pair collected in one tick as
//! blocks: each block is a dense A x B sub-matrix (one BVH leaf pair, possibly
//! truncated). Blocks are cut into square [`WorkTile`]s of `tile_size` lanes
//! per side. Lane `(x, y)` of a tile tests `A[a_start + x]` against
//! `B[b_start + y]`, records the outcome in pair slot
//! `slot_start + x * slot_stride + y`, and bumps the tile's shared counter.
//!
//! Backends implement [`TrianglePairTester`]. The layouts here are shared
//! with `shaders/compute/tri_tri.wgsl`.

mod cpu;
#[cfg(feature = "gpu")]
mod gpu;

pub use cpu::CpuTriangleTester;
#[cfg(feature = "gpu")]
pub use gpu::GpuTriangleTester;

use glam::Vec3;

use crate::geometry::Triangle;

/// World-space triangle in the layout the compute shader reads (`w` unused).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct WorldTriangle {
    pub v0: [f32; 4],
    pub v1: [f32; 4],
    pub v2: [f32; 4],
}

impl WorldTriangle {
    pub fn from_triangle(t: &Triangle) -> Self {
        let [a, b, c] = t.vertices;
        Self {
            v0: a.extend(0.0).into(),
            v1: b.extend(0.0).into(),
            v2: c.extend(0.0).into(),
        }
    }

    pub fn to_triangle(&self) -> Triangle {
        Triangle::new(
            Vec3::new(self.v0[0], self.v0[1], self.v0[2]),
            Vec3::new(self.v1[0], self.v1[1], self.v1[2]),
            Vec3::new(self.v2[0], self.v2[1], self.v2[2]),
        )
    }
}

/// One workgroup's share of a block.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct WorkTile {
    pub a_start: u32,
    pub b_start: u32,
    pub a_len: u32,
    pub b_len: u32,
    pub slot_start: u32,
    pub slot_stride: u32,
    pub block: u32,
    pub _pad: u32,
}

/// A dense A x B sub-matrix of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchBlock {
    pub a_start: u32,
    pub a_len: u32,
    pub b_start: u32,
    pub b_len: u32,
    /// First pair slot; the block owns `a_len * b_len` slots row-major.
    pub slot_start: u32,
    /// Caller-defined tag (the object pair the block came from).
    pub group: u32,
}

impl BatchBlock {
    pub fn pair_count(&self) -> usize {
        self.a_len as usize * self.b_len as usize
    }

    /// A- and B-side triangle indices of the `n`th pair of this block.
    pub fn pair(&self, n: usize) -> (usize, usize) {
        let b_len = self.b_len as usize;
        (self.a_start as usize + n / b_len, self.b_start as usize + n % b_len)
    }
}

/// Frame-global triangle pair buffer with a fixed pair capacity.
#[derive(Debug, Clone)]
pub struct TriangleBatch {
    tile_size: u32,
    capacity: usize,
    a: Vec<WorldTriangle>,
    b: Vec<WorldTriangle>,
    /// Local mesh triangle index of each entry in `a` / `b`.
    a_source: Vec<u32>,
    b_source: Vec<u32>,
    blocks: Vec<BatchBlock>,
    tiles: Vec<WorkTile>,
    pairs: usize,
    dropped: usize,
}

impl TriangleBatch {
    pub fn new(tile_size: u32, capacity: usize) -> Self {
        Self {
            tile_size: tile_size.max(1),
            capacity,
            a: Vec::new(),
            b: Vec::new(),
            a_source: Vec::new(),
            b_source: Vec::new(),
            blocks: Vec::new(),
            tiles: Vec::new(),
            pairs: 0,
            dropped: 0,
        }
    }

    /// Cartesian product of two triangle lists as a single block (group 0).
    pub fn all_pairs(tile_size: u32, a: &[Triangle], b: &[Triangle]) -> Self {
        let mut batch = Self::new(tile_size, a.len() * b.len());
        let a_idx: Vec<u32> = (0..a.len() as u32).collect();
        let b_idx: Vec<u32> = (0..b.len() as u32).collect();
        batch.push_block(0, &a_idx, &b_idx, |i| a[i as usize], |i| b[i as usize]);
        batch
    }

    /// Keep the buffers, forget the contents.
    pub fn clear(&mut self) {
        self.a.clear();
        self.b.clear();
        self.a_source.clear();
        self.b_source.clear();
        self.blocks.clear();
        self.tiles.clear();
        self.pairs = 0;
        self.dropped = 0;
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Add the pairs `a x b` as one block. `tri_a` / `tri_b` produce the
    /// world triangle for a local index and are only called for kept entries.
    ///
    /// When the block does not fit the remaining capacity it is truncated:
    /// whole rows of A are kept if at least one row fits, otherwise a single
    /// A triangle against as many B triangles as fit. Everything else is
    /// counted as dropped. Returns the number of pairs kept.
    pub fn push_block<FA, FB>(
        &mut self,
        group: u32,
        a: &[u32],
        b: &[u32],
        tri_a: FA,
        tri_b: FB,
    ) -> usize
    where
        FA: Fn(u32) -> Triangle,
        FB: Fn(u32) -> Triangle,
    {
        let requested = a.len() * b.len();
        if requested == 0 {
            return 0;
        }
        let available = self.capacity - self.pairs;
        let (keep_a, keep_b) = if requested <= available {
            (a.len(), b.len())
        } else if available == 0 {
            (0, 0)
        } else if b.len() <= available {
            (available / b.len(), b.len())
        } else {
            (1, available)
        };
        let kept = keep_a * keep_b;
        self.dropped += requested - kept;
        if kept == 0 {
            return 0;
        }

        let block = BatchBlock {
            a_start: self.a.len() as u32,
            a_len: keep_a as u32,
            b_start: self.b.len() as u32,
            b_len: keep_b as u32,
            slot_start: self.pairs as u32,
            group,
        };
        for &i in &a[..keep_a] {
            self.a.push(WorldTriangle::from_triangle(&tri_a(i)));
            self.a_source.push(i);
        }
        for &j in &b[..keep_b] {
            self.b.push(WorldTriangle::from_triangle(&tri_b(j)));
            self.b_source.push(j);
        }

        let block_index = self.blocks.len() as u32;
        let t = self.tile_size;
        for ti in 0..block.a_len.div_ceil(t) {
            for tj in 0..block.b_len.div_ceil(t) {
                self.tiles.push(WorkTile {
                    a_start: block.a_start + ti * t,
                    b_start: block.b_start + tj * t,
                    a_len: t.min(block.a_len - ti * t),
                    b_len: t.min(block.b_len - tj * t),
                    slot_start: block.slot_start + ti * t * block.b_len + tj * t,
                    slot_stride: block.b_len,
                    block: block_index,
                    _pad: 0,
                });
            }
        }
        self.blocks.push(block);
        self.pairs += kept;
        kept
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pair_count(&self) -> usize {
        self.pairs
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.pairs == 0
    }

    pub fn a_triangles(&self) -> &[WorldTriangle] {
        &self.a
    }

    pub fn b_triangles(&self) -> &[WorldTriangle] {
        &self.b
    }

    /// Local mesh triangle index behind A entry `i`.
    pub fn a_source(&self, i: usize) -> u32 {
        self.a_source[i]
    }

    pub fn b_source(&self, j: usize) -> u32 {
        self.b_source[j]
    }

    pub fn blocks(&self) -> &[BatchBlock] {
        &self.blocks
    }

    pub fn tiles(&self) -> &[WorkTile] {
        &self.tiles
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Intersecting pairs per tile, indexed like [`TriangleBatch::tiles`].
    pub tile_counts: Vec<u32>,
    /// 1 if the pair in that slot intersects, else 0.
    pub pair_hits: Vec<u32>,
}

impl BatchResult {
    pub fn total_hits(&self) -> u64 {
        self.tile_counts.iter().map(|&c| c as u64).sum()
    }
}

/// Backend that runs the exact test over a whole batch in one go.
///
/// Implementations must use the same `epsilon` in every lane so that the
/// result does not depend on scheduling.
pub trait TrianglePairTester: Send {
    fn name(&self) -> &'static str;

    /// Largest batch the backend accepts, if bounded.
    fn capacity(&self) -> Option<usize>;

    fn test(&mut self, batch: &TriangleBatch, epsilon: f32) -> anyhow::Result<BatchResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri(x: f32) -> Triangle {
        Triangle::new(Vec3::new(x, 0.0, 0.0), Vec3::new(x + 1.0, 0.0, 0.0), Vec3::new(x, 1.0, 0.0))
    }

    fn slots_of(batch: &TriangleBatch) -> Vec<u32> {
        let mut slots = Vec::new();
        for tile in batch.tiles() {
            for x in 0..tile.a_len {
                for y in 0..tile.b_len {
                    slots.push(tile.slot_start + x * tile.slot_stride + y);
                }
            }
        }
        slots.sort_unstable();
        slots
    }

    #[test]
    fn test_layouts() {
        assert_eq!(std::mem::size_of::<WorldTriangle>(), 48);
        assert_eq!(std::mem::size_of::<WorkTile>(), 32);
    }

    #[test]
    fn test_tiles_cover_every_slot_once() {
        let mut batch = TriangleBatch::new(4, 1000);
        let a: Vec<u32> = (0..10).collect();
        let b: Vec<u32> = (0..7).collect();
        batch.push_block(3, &a, &b, |i| tri(i as f32), |j| tri(j as f32));
        batch.push_block(4, &a[..2], &b[..5], |i| tri(i as f32), |j| tri(j as f32));

        assert_eq!(batch.pair_count(), 70 + 10);
        // 3 x 2 tiles, then 1 x 2 tiles
        assert_eq!(batch.tiles().len(), 6 + 2);
        assert_eq!(slots_of(&batch), (0..80).collect::<Vec<u32>>());

        // slot -> pair mapping agrees with the tile lane formula
        let block = batch.blocks()[0];
        let tile = batch.tiles()[3]; // ti = 1, tj = 1
        let (x, y) = (2u32, 1u32);
        let slot = (tile.slot_start + x * tile.slot_stride + y) as usize;
        let (ai, bi) = block.pair(slot - block.slot_start as usize);
        assert_eq!(ai as u32, tile.a_start + x);
        assert_eq!(bi as u32, tile.b_start + y);
    }

    #[test]
    fn test_truncation_keeps_whole_rows() {
        let mut batch = TriangleBatch::new(8, 50);
        let a: Vec<u32> = (0..10).collect();
        let b: Vec<u32> = (0..12).collect();
        let kept = batch.push_block(0, &a, &b, |i| tri(i as f32), |j| tri(j as f32));
        // 4 rows of 12
        assert_eq!(kept, 48);
        assert_eq!(batch.dropped(), 120 - 48);
        assert_eq!(batch.blocks()[0].a_len, 4);

        // 2 slots left, wider than them: one A against two B
        let kept = batch.push_block(1, &a, &b, |i| tri(i as f32), |j| tri(j as f32));
        assert_eq!(kept, 2);
        assert_eq!(batch.blocks()[1].a_len, 1);
        assert_eq!(batch.blocks()[1].b_len, 2);

        // full: everything dropped
        let kept = batch.push_block(2, &a, &b, |i| tri(i as f32), |j| tri(j as f32));
        assert_eq!(kept, 0);
        assert_eq!(batch.pair_count(), 50);
        assert_eq!(batch.dropped(), 72 + 118 + 120);
        assert_eq!(slots_of(&batch), (0..50).collect::<Vec<u32>>());
    }

    #[test]
    fn test_all_pairs_and_sources() {
        let a = [tri(0.0), tri(5.0), tri(9.0)];
        let b = [tri(0.5)];
        let batch = TriangleBatch::all_pairs(8, &a, &b);
        assert_eq!(batch.pair_count(), 3);
        assert_eq!(batch.tiles().len(), 1);
        assert_eq!(batch.a_source(2), 2);
        assert_eq!(batch.a_triangles()[1].to_triangle(), a[1]);
    }

    #[test]
    fn test_clear_resets() {
        let mut batch = TriangleBatch::all_pairs(2, &[tri(0.0)], &[tri(1.0)]);
        batch.clear();
        assert!(batch.is_empty());
        assert!(batch.tiles().is_empty());
        assert_eq!(batch.dropped(), 0);
    }
}
