//! Validation trackers for a Vulkan-style API.
//!
//! [`ValidationContext`] shadows every object the application creates and
//! checks each intercepted call against that shadow state. Violations are
//! reported through the context's [`MessageSink`](vklayer_core::MessageSink)
//! and returned as [`ValidationError`](vklayer_core::ValidationError).

pub mod command;
pub mod context;
pub mod descriptor;
pub mod format;
pub mod image;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod shader;
pub mod spirv;
pub mod sync;
pub mod threading;

pub use command::{CommandBufferAllocateInfo, CommandBufferBeginInfo, CommandBufferStatus, InheritanceInfo};
pub use context::ValidationContext;
pub use descriptor::{
    CopyDescriptorSet, DescriptorPoolCreateInfo, DescriptorSetLayoutBinding,
    DescriptorSetLayoutCreateInfo, WriteDescriptorSet,
};
pub use image::{ImageCreateInfo, ImageViewCreateInfo};
pub use memory::{BufferCreateInfo, BufferViewCreateInfo, MappedRange, MemoryAllocateInfo};
pub use pipeline::{
    ColorBlendState, DepthStencilState, GraphicsPipelineCreateInfo, InputAssemblyState,
    MultisampleState, PipelineLayoutCreateInfo, PipelineShaderStage, RasterizationState,
    TessellationState, VertexInputState, ViewportState,
};
pub use render_pass::{FramebufferCreateInfo, RenderPassBeginInfo, RenderPassCreateInfo, SubpassDescription};
pub use sync::SubmitInfo;
pub use threading::ThreadGuard;
