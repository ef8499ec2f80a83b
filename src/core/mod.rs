//! Mid-level wrappers over the wgpu primitives the GPU tester needs.

pub mod buffer;
pub mod pipeline;

pub use buffer::{StorageBuffer, UniformBuffer};
pub use pipeline::ComputePipelineBuilder;
