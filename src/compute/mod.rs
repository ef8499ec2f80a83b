//! Compute dispatch and readback helpers.

use anyhow::Context as _;

use crate::context::WgpuContext;
use crate::core::StorageBuffer;

/// Records, submits and forgets one compute pass per call.
pub struct ComputeDispatcher<'a> {
    ctx: &'a WgpuContext,
}

impl<'a> ComputeDispatcher<'a> {
    pub fn new(ctx: &'a WgpuContext) -> Self {
        Self { ctx }
    }

    /// Dispatch a single compute pass. Bind groups are set at their slice index.
    pub fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        bind_groups: &[&wgpu::BindGroup],
        workgroups: [u32; 3],
        label: Option<&str>,
    ) {
        if workgroups.contains(&0) {
            return;
        }
        let mut encoder = self.ctx.create_encoder(label);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label,
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            for (i, bg) in bind_groups.iter().enumerate() {
                pass.set_bind_group(i as u32, *bg, &[]);
            }
            pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
        }
        self.ctx.submit([encoder.finish()]);
    }
}

/// Number of workgroups of `workgroup_size` covering `total_items`. Rounds up.
pub fn compute_workgroup_count(total_items: u32, workgroup_size: u32) -> u32 {
    total_items.div_ceil(workgroup_size)
}

/// Lay `count` workgroups out on a 2D grid whose x dimension stays within
/// `max_per_dimension`. The shader recovers the linear index as `y * x_dim + x`
/// and discards indices at or past `count`.
pub fn workgroup_grid(count: u32, max_per_dimension: u32) -> [u32; 3] {
    if count <= max_per_dimension {
        return [count, 1, 1];
    }
    let y = count.div_ceil(max_per_dimension);
    [max_per_dimension, y, 1]
}

/// Copy the first `size` bytes of `source` into a staging buffer, map it
/// and return the contents. Blocks until the GPU has finished.
pub fn read_buffer_sync<T: bytemuck::Pod>(
    ctx: &WgpuContext,
    source: &wgpu::Buffer,
    size: u64,
) -> anyhow::Result<Vec<T>> {
    if size == 0 {
        return Ok(Vec::new());
    }
    let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging_readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = ctx.create_encoder(Some("readback copy"));
    encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
    ctx.submit([encoder.finish()]);

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    ctx.device
        .poll(wgpu::PollType::wait_indefinitely())
        .context("device poll failed during readback")?;
    rx.recv()
        .context("readback callback dropped")?
        .context("failed to map staging buffer")?;

    let data = slice.get_mapped_range();
    let result: Vec<T> = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    staging.unmap();

    Ok(result)
}

/// Read `len` elements of `T` from the front of a [`StorageBuffer`].
pub fn read_back<T: bytemuck::Pod>(
    ctx: &WgpuContext,
    buffer: &StorageBuffer,
    len: usize,
) -> anyhow::Result<Vec<T>> {
    let bytes = (len * std::mem::size_of::<T>()) as u64;
    anyhow::ensure!(
        bytes <= buffer.size(),
        "readback of {bytes} bytes exceeds buffer of {} bytes",
        buffer.size()
    );
    read_buffer_sync(ctx, buffer.buffer(), bytes)
}
