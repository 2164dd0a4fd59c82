//! Memory allocations, buffers and buffer views, and the binding of
//! images/buffers to memory.

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;
use tracing::{debug, trace};
use vklayer_core::{DiagnosticCode, ObjectType, ValidationError};

use crate::context::ValidationContext;

const BUFFER_ALIGNMENT: u64 = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryAllocateInfo {
    pub allocation_size: u64,
    pub memory_type_index: u32,
}

/// Host view of a mapped range. There is no driver behind the trackers, so
/// the range only records what was mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BufferCreateInfo {
    pub flags: vk::BufferCreateFlags,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

#[derive(Debug, Clone, Default)]
pub struct BufferViewCreateInfo {
    pub buffer: vk::Buffer,
    pub format: vk::Format,
    pub offset: u64,
    pub range: u64,
}

/// Where a resource lives. Resources refer to allocations by handle, the
/// allocation keeps the reverse list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemoryBinding {
    pub memory: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BoundResource {
    pub object_type: ObjectType,
    pub object: u64,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct MemoryNode {
    pub size: u64,
    pub memory_type_index: u32,
    pub properties: vk::MemoryPropertyFlags,
    pub mapped: Option<(u64, u64)>,
    pub bound: Vec<BoundResource>,
}

#[derive(Debug, Clone)]
pub(crate) struct BufferNode {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub binding: Option<MemoryBinding>,
}

#[derive(Debug, Clone)]
pub(crate) struct BufferViewNode {
    pub buffer: u64,
}

#[derive(Default)]
pub(crate) struct MemoryTracker {
    pub allocations: DashMap<u64, MemoryNode>,
    pub buffers: DashMap<u64, BufferNode>,
    pub buffer_views: DashMap<u64, BufferViewNode>,
}

/// Round up to `alignment`, clamping to the largest aligned value.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value
        .checked_next_multiple_of(alignment)
        .unwrap_or(u64::MAX - u64::MAX % alignment)
}

impl ValidationContext {
    // ── Device memory ───────────────────────────────────────────

    pub fn allocate_memory(
        &self,
        info: &MemoryAllocateInfo,
    ) -> Result<vk::DeviceMemory, ValidationError> {
        const LOCATION: &str = "vkAllocateMemory";
        let device = self.device().as_raw();

        let Some(properties) = self.config().memory_properties(info.memory_type_index) else {
            return Err(self.error(
                DiagnosticCode::InvalidMemoryType,
                ObjectType::Device,
                device,
                LOCATION,
                format!(
                    "vkAllocateMemory: memoryTypeIndex {} is out of range, the device exposes {} memory types",
                    info.memory_type_index,
                    self.config().device.memory_types.len()
                ),
            ));
        };
        if info.allocation_size == 0 {
            return Err(self.error(
                DiagnosticCode::InvalidParameter,
                ObjectType::Device,
                device,
                LOCATION,
                "vkAllocateMemory: allocationSize must be greater than 0".to_string(),
            ));
        }

        let memory: vk::DeviceMemory = self.create_handle(ObjectType::DeviceMemory);
        self.memory.allocations.insert(
            memory.as_raw(),
            MemoryNode {
                size: info.allocation_size,
                memory_type_index: info.memory_type_index,
                properties,
                mapped: None,
                bound: Vec::new(),
            },
        );
        debug!(
            memory = format_args!("0x{:x}", memory.as_raw()),
            size = info.allocation_size,
            memory_type_index = info.memory_type_index,
            "memory allocated"
        );
        Ok(memory)
    }

    /// Free an allocation. Resources still bound to it keep their binding
    /// record; the free itself is only noted at INFO level.
    pub fn free_memory(&self, memory: vk::DeviceMemory) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkFreeMemory";
        if memory == vk::DeviceMemory::null() {
            return Ok(());
        }
        let raw = self.check_handle(memory, ObjectType::DeviceMemory, LOCATION)?;

        if let Some((_, node)) = self.memory.allocations.remove(&raw) {
            if !node.bound.is_empty() {
                let objects: Vec<String> = node
                    .bound
                    .iter()
                    .map(|b| format!("{} 0x{:x}", b.object_type.vk_name(), b.object))
                    .collect();
                self.info(
                    DiagnosticCode::FreedMemoryStillBound,
                    ObjectType::DeviceMemory,
                    raw,
                    LOCATION,
                    format!(
                        "Freeing memory object 0x{:x} while it still has references: {}",
                        raw,
                        objects.join(", ")
                    ),
                );
            }
        }
        self.retire_handle(raw, ObjectType::DeviceMemory);
        Ok(())
    }

    pub fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<MappedRange, ValidationError> {
        const LOCATION: &str = "vkMapMemory";
        let raw = self.check_handle(memory, ObjectType::DeviceMemory, LOCATION)?;

        let outcome = match self.memory.allocations.get_mut(&raw) {
            None => Err((
                DiagnosticCode::InvalidObject,
                format!("Invalid VkDeviceMemory Object 0x{:x}", raw),
            )),
            Some(mut node) => {
                if !node.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
                    Err((
                        DiagnosticCode::MemoryNotHostVisible,
                        format!(
                            "Mapping Memory without VK_MEMORY_PROPERTY_HOST_VISIBLE_BIT set: mem obj 0x{:x} (memoryTypeIndex {})",
                            raw, node.memory_type_index
                        ),
                    ))
                } else if node.mapped.is_some() {
                    Err((
                        DiagnosticCode::MemoryAlreadyMapped,
                        format!(
                            "vkMapMemory: Attempting to map memory on an already-mapped object 0x{:x}",
                            raw
                        ),
                    ))
                } else if size == 0 {
                    Err((
                        DiagnosticCode::InvalidMapRange,
                        "vkMapMemory: Attempting to map memory range of size zero".to_string(),
                    ))
                } else {
                    let end = if size == vk::WHOLE_SIZE {
                        node.size
                    } else {
                        offset.saturating_add(size)
                    };
                    if offset >= node.size || end > node.size {
                        Err((
                            DiagnosticCode::InvalidMapRange,
                            format!(
                                "Mapping Memory from 0x{:x} to 0x{:x} oversteps total array size 0x{:x}",
                                offset, end, node.size
                            ),
                        ))
                    } else {
                        node.mapped = Some((offset, end - offset));
                        Ok(MappedRange {
                            memory,
                            offset,
                            size: end - offset,
                        })
                    }
                }
            }
        };
        outcome.map_err(|(code, message)| {
            self.error(code, ObjectType::DeviceMemory, raw, LOCATION, message)
        })
    }

    pub fn unmap_memory(&self, memory: vk::DeviceMemory) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkUnmapMemory";
        let raw = self.check_handle(memory, ObjectType::DeviceMemory, LOCATION)?;
        let was_mapped = self
            .memory
            .allocations
            .get_mut(&raw)
            .and_then(|mut node| node.mapped.take())
            .is_some();
        if !was_mapped {
            return Err(self.error(
                DiagnosticCode::MemoryNotMapped,
                ObjectType::DeviceMemory,
                raw,
                LOCATION,
                format!(
                    "Unmapping Memory without memory being mapped: mem obj 0x{:x}",
                    raw
                ),
            ));
        }
        Ok(())
    }

    /// Attach a resource to an allocation. The caller holds the resource's
    /// table entry and passes its binding slot, so the rebind check and the
    /// write cannot interleave with a concurrent bind. Failures come back
    /// unreported; `finish_bind` reports them once the entry is released.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attach_resource(
        &self,
        object_type: ObjectType,
        object: u64,
        memory: u64,
        offset: u64,
        size: u64,
        slot: &mut Option<MemoryBinding>,
        location: &'static str,
    ) -> Result<(), (DiagnosticCode, String)> {
        if let Some(existing) = slot {
            return Err((
                DiagnosticCode::RebindObject,
                format!(
                    "In {}(), Cannot bind memory 0x{:x} to object 0x{:x} which has already been bound to mem object 0x{:x}",
                    location, memory, object, existing.memory
                ),
            ));
        }

        let mut node = self.memory.allocations.get_mut(&memory).ok_or_else(|| {
            (
                DiagnosticCode::InvalidObject,
                format!("Invalid VkDeviceMemory Object 0x{:x}", memory),
            )
        })?;
        let end = offset.saturating_add(size);
        if end > node.size {
            return Err((
                DiagnosticCode::BindRangeOutOfBounds,
                format!(
                    "In {}(), memory range [0x{:x}, 0x{:x}) of object 0x{:x} exceeds the 0x{:x} byte allocation 0x{:x}",
                    location, offset, end, object, node.size, memory
                ),
            ));
        }
        node.bound.push(BoundResource {
            object_type,
            object,
            offset,
            size,
        });
        *slot = Some(MemoryBinding { memory, offset });
        Ok(())
    }

    /// Report the outcome of `attach_resource`.
    pub(crate) fn finish_bind(
        &self,
        object_type: ObjectType,
        object: u64,
        memory: u64,
        offset: u64,
        outcome: Result<(), (DiagnosticCode, String)>,
        location: &'static str,
    ) -> Result<(), ValidationError> {
        outcome
            .map_err(|(code, message)| self.error(code, object_type, object, location, message))?;
        trace!(
            object_type = %object_type,
            object = format_args!("0x{:x}", object),
            memory = format_args!("0x{:x}", memory),
            offset,
            "memory bound"
        );
        Ok(())
    }

    /// Drop a destroyed resource from its allocation's bound list.
    pub(crate) fn unbind_resource(&self, object: u64, binding: Option<MemoryBinding>) {
        if let Some(binding) = binding {
            if let Some(mut node) = self.memory.allocations.get_mut(&binding.memory) {
                node.bound.retain(|b| b.object != object);
            }
        }
    }

    // ── Buffers ─────────────────────────────────────────────────

    pub fn create_buffer(&self, info: &BufferCreateInfo) -> Result<vk::Buffer, ValidationError> {
        if info.size == 0 {
            return Err(self.error(
                DiagnosticCode::InvalidParameter,
                ObjectType::Device,
                self.device().as_raw(),
                "vkCreateBuffer",
                "vkCreateBuffer: size must be greater than 0".to_string(),
            ));
        }
        let buffer: vk::Buffer = self.create_handle(ObjectType::Buffer);
        self.memory.buffers.insert(
            buffer.as_raw(),
            BufferNode {
                size: info.size,
                usage: info.usage,
                binding: None,
            },
        );
        Ok(buffer)
    }

    pub fn destroy_buffer(&self, buffer: vk::Buffer) -> Result<(), ValidationError> {
        if buffer == vk::Buffer::null() {
            return Ok(());
        }
        let raw = self.check_handle(buffer, ObjectType::Buffer, "vkDestroyBuffer")?;
        if let Some((_, node)) = self.memory.buffers.remove(&raw) {
            self.unbind_resource(raw, node.binding);
        }
        self.retire_handle(raw, ObjectType::Buffer);
        Ok(())
    }

    pub fn get_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> Result<vk::MemoryRequirements, ValidationError> {
        let node = self.lookup(
            &self.memory.buffers,
            buffer,
            ObjectType::Buffer,
            "vkGetBufferMemoryRequirements",
        )?;
        Ok(vk::MemoryRequirements {
            size: align_up(node.size, BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: self.config().memory_type_bits(),
        })
    }

    pub fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkBindBufferMemory";
        let raw = self.check_handle(buffer, ObjectType::Buffer, LOCATION)?;
        let memory_raw = self.check_handle(memory, ObjectType::DeviceMemory, LOCATION)?;
        let outcome = match self.memory.buffers.get_mut(&raw) {
            None => Err((
                DiagnosticCode::InvalidObject,
                format!("Invalid VkBuffer Object 0x{:x}", raw),
            )),
            Some(mut node) => {
                let size = node.size;
                self.attach_resource(
                    ObjectType::Buffer,
                    raw,
                    memory_raw,
                    offset,
                    size,
                    &mut node.binding,
                    LOCATION,
                )
            }
        };
        self.finish_bind(ObjectType::Buffer, raw, memory_raw, offset, outcome, LOCATION)
    }

    // ── Buffer views ────────────────────────────────────────────

    pub fn create_buffer_view(
        &self,
        info: &BufferViewCreateInfo,
    ) -> Result<vk::BufferView, ValidationError> {
        const LOCATION: &str = "vkCreateBufferView";
        let buffer = self.lookup(&self.memory.buffers, info.buffer, ObjectType::Buffer, LOCATION)?;
        let buffer_raw = info.buffer.as_raw();

        let texel_usage =
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
        if !buffer.usage.intersects(texel_usage) {
            return Err(self.error(
                DiagnosticCode::InvalidParameter,
                ObjectType::Buffer,
                buffer_raw,
                LOCATION,
                format!(
                    "vkCreateBufferView: buffer 0x{:x} was not created with VK_BUFFER_USAGE_UNIFORM_TEXEL_BUFFER_BIT or VK_BUFFER_USAGE_STORAGE_TEXEL_BUFFER_BIT",
                    buffer_raw
                ),
            ));
        }
        let end = if info.range == vk::WHOLE_SIZE {
            buffer.size
        } else {
            info.offset.saturating_add(info.range)
        };
        if info.offset >= buffer.size || end > buffer.size {
            return Err(self.error(
                DiagnosticCode::InvalidBufferViewRange,
                ObjectType::Buffer,
                buffer_raw,
                LOCATION,
                format!(
                    "vkCreateBufferView: range [0x{:x}, 0x{:x}) does not fit in buffer 0x{:x} of size 0x{:x}",
                    info.offset, end, buffer_raw, buffer.size
                ),
            ));
        }

        let view: vk::BufferView = self.create_handle(ObjectType::BufferView);
        self.memory.buffer_views.insert(
            view.as_raw(),
            BufferViewNode { buffer: buffer_raw },
        );
        Ok(view)
    }

    pub fn destroy_buffer_view(&self, view: vk::BufferView) -> Result<(), ValidationError> {
        if view == vk::BufferView::null() {
            return Ok(());
        }
        let raw = self.check_handle(view, ObjectType::BufferView, "vkDestroyBufferView")?;
        self.memory.buffer_views.remove(&raw);
        self.retire_handle(raw, ObjectType::BufferView);
        Ok(())
    }
}
