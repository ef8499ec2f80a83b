//! wgpu compute backend.

use tracing::debug;

use super::{BatchResult, TriangleBatch, TrianglePairTester, WorkTile, WorldTriangle};
use crate::compute::{read_back, workgroup_grid, ComputeDispatcher};
use crate::context::WgpuContext;
use crate::core::{ComputePipelineBuilder, StorageBuffer, UniformBuffer};

/// Invocations per workgroup guaranteed by `wgpu::Limits::default()`.
const MAX_INVOCATIONS: u32 = 256;

/// Per-dispatch parameters (matches `Params` in the shader).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct GpuParams {
    pub tile_count: u32,
    pub grid_x: u32,
    pub epsilon: f32,
    pub _pad: u32,
}

/// Runs the exact test as one compute dispatch per batch.
///
/// Buffers are allocated once for `capacity` pairs; a batch built with a
/// different tile size or more pairs is rejected.
pub struct GpuTriangleTester {
    ctx: WgpuContext,
    tile_size: u32,
    capacity: usize,
    pipeline: wgpu::ComputePipeline,
    data_bind_group: wgpu::BindGroup,
    params: UniformBuffer<GpuParams>,
    tris_a: StorageBuffer,
    tris_b: StorageBuffer,
    tiles: StorageBuffer,
    tile_counts: StorageBuffer,
    pair_hits: StorageBuffer,
}

impl GpuTriangleTester {
    pub fn new(ctx: &WgpuContext, tile_size: u32, capacity: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            tile_size > 0 && tile_size * tile_size <= MAX_INVOCATIONS,
            "tile size {tile_size} exceeds {MAX_INVOCATIONS} invocations per workgroup"
        );
        anyhow::ensure!(capacity > 0, "GPU tester needs a non-zero pair capacity");

        // A block of n pairs spans at most n A and n B triangles and n tiles
        let tri_size = (capacity * std::mem::size_of::<WorldTriangle>()) as u64;
        let tile_size_bytes = (capacity * std::mem::size_of::<WorkTile>()) as u64;
        let u32_size = (capacity * std::mem::size_of::<u32>()) as u64;

        let tris_a = StorageBuffer::new(ctx, tri_size, Some("tri_tri a triangles"));
        let tris_b = StorageBuffer::new(ctx, tri_size, Some("tri_tri b triangles"));
        let tiles = StorageBuffer::new(ctx, tile_size_bytes, Some("tri_tri tiles"));
        let tile_counts = StorageBuffer::new(ctx, u32_size, Some("tri_tri tile counts"));
        let pair_hits = StorageBuffer::new(ctx, u32_size, Some("tri_tri pair hits"));

        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let data_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("tri_tri data layout"),
                entries: &[
                    storage_entry(0, true),
                    storage_entry(1, true),
                    storage_entry(2, true),
                    storage_entry(3, false),
                    storage_entry(4, false),
                ],
            });
        let data_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("tri_tri data bind group"),
            layout: &data_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: tris_a.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: tris_b.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: tiles.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: tile_counts.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: pair_hits.buffer().as_entire_binding(),
                },
            ],
        });

        let params = UniformBuffer::new(ctx, &GpuParams::default(), 0, Some("tri_tri params"));

        let shader = include_str!("../../shaders/compute/tri_tri.wgsl");
        let pipeline = ComputePipelineBuilder::new(ctx)
            .label("tri_tri compute")
            .shader(shader)
            .define("TILE", tile_size)
            .entry_point("cs_tri_tri")
            .bind_group_layout(&data_layout)
            .bind_group_layout(params.bind_group_layout())
            .build()?;

        debug!(tile_size, capacity, "GPU triangle tester ready");

        Ok(Self {
            ctx: ctx.clone(),
            tile_size,
            capacity,
            pipeline,
            data_bind_group,
            params,
            tris_a,
            tris_b,
            tiles,
            tile_counts,
            pair_hits,
        })
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }
}

impl TrianglePairTester for GpuTriangleTester {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn test(&mut self, batch: &TriangleBatch, epsilon: f32) -> anyhow::Result<BatchResult> {
        anyhow::ensure!(
            batch.tile_size() == self.tile_size,
            "batch tile size {} does not match pipeline tile size {}",
            batch.tile_size(),
            self.tile_size
        );
        anyhow::ensure!(
            batch.pair_count() <= self.capacity,
            "batch of {} pairs exceeds GPU capacity {}",
            batch.pair_count(),
            self.capacity
        );
        if batch.is_empty() {
            return Ok(BatchResult::default());
        }

        let ctx = &self.ctx;
        let tiles = batch.tiles();
        let pair_count = batch.pair_count();

        self.tris_a.write(ctx, batch.a_triangles());
        self.tris_b.write(ctx, batch.b_triangles());
        self.tiles.write(ctx, tiles);
        self.pair_hits
            .clear(ctx, (pair_count * std::mem::size_of::<u32>()) as u64);

        let grid = workgroup_grid(tiles.len() as u32, ctx.max_workgroups_per_dimension());
        self.params.update(
            ctx,
            &GpuParams {
                tile_count: tiles.len() as u32,
                grid_x: grid[0],
                epsilon,
                _pad: 0,
            },
        );

        ComputeDispatcher::new(ctx).dispatch(
            &self.pipeline,
            &[&self.data_bind_group, self.params.bind_group()],
            grid,
            Some("tri_tri"),
        );

        let tile_counts = read_back::<u32>(ctx, &self.tile_counts, tiles.len())?;
        let pair_hits = read_back::<u32>(ctx, &self.pair_hits, pair_count)?;
        Ok(BatchResult {
            tile_counts,
            pair_hits,
        })
    }
}
