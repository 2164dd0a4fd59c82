use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use ash::vk::Handle;

/// Type tag of every API object the trackers shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Device,
    Queue,
    CommandPool,
    CommandBuffer,
    Fence,
    Event,
    DeviceMemory,
    Buffer,
    BufferView,
    Image,
    ImageView,
    Sampler,
    ShaderModule,
    PipelineCache,
    PipelineLayout,
    Pipeline,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    RenderPass,
    Framebuffer,
}

impl ObjectType {
    /// API type name used in diagnostic text, e.g. `VkImage`.
    pub fn vk_name(self) -> &'static str {
        match self {
            ObjectType::Device => "VkDevice",
            ObjectType::Queue => "VkQueue",
            ObjectType::CommandPool => "VkCommandPool",
            ObjectType::CommandBuffer => "VkCommandBuffer",
            ObjectType::Fence => "VkFence",
            ObjectType::Event => "VkEvent",
            ObjectType::DeviceMemory => "VkDeviceMemory",
            ObjectType::Buffer => "VkBuffer",
            ObjectType::BufferView => "VkBufferView",
            ObjectType::Image => "VkImage",
            ObjectType::ImageView => "VkImageView",
            ObjectType::Sampler => "VkSampler",
            ObjectType::ShaderModule => "VkShaderModule",
            ObjectType::PipelineCache => "VkPipelineCache",
            ObjectType::PipelineLayout => "VkPipelineLayout",
            ObjectType::Pipeline => "VkPipeline",
            ObjectType::DescriptorSetLayout => "VkDescriptorSetLayout",
            ObjectType::DescriptorPool => "VkDescriptorPool",
            ObjectType::DescriptorSet => "VkDescriptorSet",
            ObjectType::RenderPass => "VkRenderPass",
            ObjectType::Framebuffer => "VkFramebuffer",
        }
    }

    pub fn vk_object_type(self) -> vk::ObjectType {
        match self {
            ObjectType::Device => vk::ObjectType::DEVICE,
            ObjectType::Queue => vk::ObjectType::QUEUE,
            ObjectType::CommandPool => vk::ObjectType::COMMAND_POOL,
            ObjectType::CommandBuffer => vk::ObjectType::COMMAND_BUFFER,
            ObjectType::Fence => vk::ObjectType::FENCE,
            ObjectType::Event => vk::ObjectType::EVENT,
            ObjectType::DeviceMemory => vk::ObjectType::DEVICE_MEMORY,
            ObjectType::Buffer => vk::ObjectType::BUFFER,
            ObjectType::BufferView => vk::ObjectType::BUFFER_VIEW,
            ObjectType::Image => vk::ObjectType::IMAGE,
            ObjectType::ImageView => vk::ObjectType::IMAGE_VIEW,
            ObjectType::Sampler => vk::ObjectType::SAMPLER,
            ObjectType::ShaderModule => vk::ObjectType::SHADER_MODULE,
            ObjectType::PipelineCache => vk::ObjectType::PIPELINE_CACHE,
            ObjectType::PipelineLayout => vk::ObjectType::PIPELINE_LAYOUT,
            ObjectType::Pipeline => vk::ObjectType::PIPELINE,
            ObjectType::DescriptorSetLayout => vk::ObjectType::DESCRIPTOR_SET_LAYOUT,
            ObjectType::DescriptorPool => vk::ObjectType::DESCRIPTOR_POOL,
            ObjectType::DescriptorSet => vk::ObjectType::DESCRIPTOR_SET,
            ObjectType::RenderPass => vk::ObjectType::RENDER_PASS,
            ObjectType::Framebuffer => vk::ObjectType::FRAMEBUFFER,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.vk_name())
    }
}

/// Hands out handle values for objects created through the trackers.
///
/// Values are never reused, so a stale handle always resolves to its
/// tombstone in the registry rather than to a newer object.
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    /// First value handed out; keeps clear of null and small sentinel values.
    pub const FIRST_HANDLE: u64 = 0x2000;

    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(Self::FIRST_HANDLE),
        }
    }

    pub fn alloc_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a typed handle, e.g. `let image: vk::Image = alloc.alloc();`.
    pub fn alloc<H: Handle>(&self) -> H {
        H::from_raw(self.alloc_raw())
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}
