//! Command pools, command buffer lifecycle, and the recording commands that
//! only touch command buffer state (dynamic state, vertex/index buffers,
//! buffer updates, draws, clears inside a render pass, secondary execution).

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};
use vklayer_core::{DiagnosticCode, ObjectType, ValidationError};

use crate::context::ValidationContext;
use crate::pipeline::PipelineNode;
use crate::render_pass::RenderPassNode;
use crate::threading::OwnerMarker;

/// Lifecycle of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferStatus {
    Initial,
    Recording,
    Executable,
    /// Submitted and not yet retired by a fence wait or queue idle.
    Pending,
    /// Needs re-recording, e.g. a one-time-submit buffer after completion.
    Invalid,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBufferAllocateInfo {
    pub command_pool: vk::CommandPool,
    pub level: vk::CommandBufferLevel,
    pub command_buffer_count: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InheritanceInfo {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub framebuffer: vk::Framebuffer,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBufferBeginInfo {
    pub flags: vk::CommandBufferUsageFlags,
    pub inheritance: Option<InheritanceInfo>,
}

bitflags! {
    /// Pipeline state that can be deferred to recording time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DynamicStates: u32 {
        const LINE_WIDTH = 1 << 0;
        const DEPTH_BIAS = 1 << 1;
        const VIEWPORT = 1 << 2;
        const SCISSOR = 1 << 3;
        const BLEND_CONSTANTS = 1 << 4;
        const DEPTH_BOUNDS = 1 << 5;
        const STENCIL_COMPARE_MASK = 1 << 6;
        const STENCIL_WRITE_MASK = 1 << 7;
        const STENCIL_REFERENCE = 1 << 8;
    }
}

/// Order in which missing dynamic state is reported at draw time.
const DYNAMIC_STATE_NAMES: [(DynamicStates, &str); 9] = [
    (DynamicStates::LINE_WIDTH, "line width"),
    (DynamicStates::DEPTH_BIAS, "depth bias"),
    (DynamicStates::VIEWPORT, "viewport"),
    (DynamicStates::SCISSOR, "scissor"),
    (DynamicStates::BLEND_CONSTANTS, "blend object"),
    (DynamicStates::DEPTH_BOUNDS, "depth bounds"),
    (DynamicStates::STENCIL_COMPARE_MASK, "stencil read mask"),
    (DynamicStates::STENCIL_WRITE_MASK, "stencil write mask"),
    (DynamicStates::STENCIL_REFERENCE, "stencil reference"),
];

impl DynamicStates {
    pub fn from_vk(state: vk::DynamicState) -> Self {
        match state {
            vk::DynamicState::LINE_WIDTH => DynamicStates::LINE_WIDTH,
            vk::DynamicState::DEPTH_BIAS => DynamicStates::DEPTH_BIAS,
            vk::DynamicState::VIEWPORT => DynamicStates::VIEWPORT,
            vk::DynamicState::SCISSOR => DynamicStates::SCISSOR,
            vk::DynamicState::BLEND_CONSTANTS => DynamicStates::BLEND_CONSTANTS,
            vk::DynamicState::DEPTH_BOUNDS => DynamicStates::DEPTH_BOUNDS,
            vk::DynamicState::STENCIL_COMPARE_MASK => DynamicStates::STENCIL_COMPARE_MASK,
            vk::DynamicState::STENCIL_WRITE_MASK => DynamicStates::STENCIL_WRITE_MASK,
            vk::DynamicState::STENCIL_REFERENCE => DynamicStates::STENCIL_REFERENCE,
            _ => DynamicStates::empty(),
        }
    }
}

pub(crate) struct CommandPoolNode {
    pub flags: vk::CommandPoolCreateFlags,
    pub buffers: Vec<u64>,
}

/// Render pass instance a command buffer is recording into.
#[derive(Clone)]
pub(crate) struct ActiveRenderPass {
    pub render_pass: u64,
    pub subpass: u32,
    pub draw_issued: bool,
    /// Taken from a secondary buffer's inheritance info.
    pub inherited: bool,
    pub node: Arc<RenderPassNode>,
}

pub(crate) struct CommandBufferState {
    pub status: CommandBufferStatus,
    pub usage: vk::CommandBufferUsageFlags,
    pub submit_count: u64,
    pub pending_submissions: u32,
    pub render_pass: Option<ActiveRenderPass>,
    pub pipeline: Option<(u64, Arc<PipelineNode>)>,
    pub bound_sets: BTreeMap<u32, u64>,
    pub vertex_buffers: BTreeMap<u32, u64>,
    pub index_buffer: Option<u64>,
    pub dynamic: DynamicStates,
    pub viewport_count: u32,
    pub scissor_count: u32,
}

impl CommandBufferState {
    fn new() -> Self {
        Self {
            status: CommandBufferStatus::Initial,
            usage: vk::CommandBufferUsageFlags::empty(),
            submit_count: 0,
            pending_submissions: 0,
            render_pass: None,
            pipeline: None,
            bound_sets: BTreeMap::new(),
            vertex_buffers: BTreeMap::new(),
            index_buffer: None,
            dynamic: DynamicStates::empty(),
            viewport_count: 0,
            scissor_count: 0,
        }
    }

    /// Back to Initial with every recorded binding dropped.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Called when a submission containing this buffer completes.
    pub fn retire(&mut self) {
        self.pending_submissions = self.pending_submissions.saturating_sub(1);
        if self.pending_submissions == 0 && self.status == CommandBufferStatus::Pending {
            self.status = if self
                .usage
                .contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            {
                CommandBufferStatus::Invalid
            } else {
                CommandBufferStatus::Executable
            };
        }
    }
}

pub(crate) struct CommandBufferNode {
    pub pool: u64,
    pub level: vk::CommandBufferLevel,
    pub owner: Arc<OwnerMarker>,
    pub state: Mutex<CommandBufferState>,
}

#[derive(Default)]
pub(crate) struct CommandTracker {
    pub pools: DashMap<u64, CommandPoolNode>,
    pub buffers: DashMap<u64, Arc<CommandBufferNode>>,
}

fn index_type_size(index_type: vk::IndexType) -> u64 {
    match index_type {
        vk::IndexType::UINT32 => 4,
        vk::IndexType::UINT8_EXT => 1,
        _ => 2,
    }
}

impl ValidationContext {
    pub(crate) fn command_buffer_node(
        &self,
        command_buffer: vk::CommandBuffer,
        location: &'static str,
    ) -> Result<Arc<CommandBufferNode>, ValidationError> {
        self.lookup(
            &self.commands.buffers,
            command_buffer,
            ObjectType::CommandBuffer,
            location,
        )
    }

    /// Run a recording command: resolve the buffer, claim it for this thread,
    /// require the Recording state, then hand the locked state to `f`.
    /// `f` must validate fully before it mutates.
    pub(crate) fn record<R>(
        &self,
        command_buffer: vk::CommandBuffer,
        location: &'static str,
        f: impl FnOnce(&CommandBufferNode, &mut CommandBufferState) -> Result<R, ValidationError>,
    ) -> Result<R, ValidationError> {
        let node = self.command_buffer_node(command_buffer, location)?;
        let _guard = self.claim_owner(&node.owner, command_buffer, location)?;
        let mut state = node.state.lock();
        if state.status != CommandBufferStatus::Recording {
            return Err(self.error(
                DiagnosticCode::NoBeginCommandBuffer,
                ObjectType::CommandBuffer,
                command_buffer.as_raw(),
                location,
                format!(
                    "You must call vkBeginCommandBuffer() before this call to {}()",
                    location
                ),
            ));
        }
        let result = f(&node, &mut state);
        if result.is_ok() {
            trace!(
                command_buffer = format_args!("0x{:x}", command_buffer.as_raw()),
                "{} recorded",
                location
            );
        }
        result
    }

    pub(crate) fn require_outside_render_pass(
        &self,
        state: &CommandBufferState,
        command_buffer: vk::CommandBuffer,
        location: &'static str,
    ) -> Result<(), ValidationError> {
        match &state.render_pass {
            None => Ok(()),
            Some(_) => Err(self.error(
                DiagnosticCode::InsideRenderPass,
                ObjectType::CommandBuffer,
                command_buffer.as_raw(),
                location,
                format!(
                    "{}: It is invalid to issue this call inside an active render pass.",
                    location
                ),
            )),
        }
    }

    pub(crate) fn require_inside_render_pass<'s>(
        &self,
        state: &'s CommandBufferState,
        command_buffer: vk::CommandBuffer,
        location: &'static str,
    ) -> Result<&'s ActiveRenderPass, ValidationError> {
        state.render_pass.as_ref().ok_or_else(|| {
            self.error(
                DiagnosticCode::OutsideRenderPass,
                ObjectType::CommandBuffer,
                command_buffer.as_raw(),
                location,
                format!(
                    "{}: This call must be issued inside an active render pass.",
                    location
                ),
            )
        })
    }

    // ── Command Pool ────────────────────────────────────────────

    pub fn create_command_pool(
        &self,
        flags: vk::CommandPoolCreateFlags,
        queue_family_index: u32,
    ) -> Result<vk::CommandPool, ValidationError> {
        let pool: vk::CommandPool = self.create_handle(ObjectType::CommandPool);
        self.commands.pools.insert(
            pool.as_raw(),
            CommandPoolNode {
                flags,
                buffers: Vec::new(),
            },
        );
        debug!(
            pool = format_args!("0x{:x}", pool.as_raw()),
            queue_family_index,
            ?flags,
            "command pool created"
        );
        Ok(pool)
    }

    /// First Pending buffer of a pool, if any.
    fn pending_buffer_in_pool(&self, pool: u64) -> Option<u64> {
        let buffers = self
            .commands
            .pools
            .get(&pool)
            .map(|p| p.buffers.clone())
            .unwrap_or_default();
        buffers.into_iter().find(|raw| {
            self.commands
                .buffers
                .get(raw)
                .map(|node| Arc::clone(node.value()))
                .is_some_and(|node| node.state.lock().status == CommandBufferStatus::Pending)
        })
    }

    pub fn destroy_command_pool(&self, pool: vk::CommandPool) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkDestroyCommandPool";
        if pool == vk::CommandPool::null() {
            return Ok(());
        }
        let raw = self.check_handle(pool, ObjectType::CommandPool, LOCATION)?;
        if let Some(busy) = self.pending_buffer_in_pool(raw) {
            return Err(self.error(
                DiagnosticCode::CommandBufferInUse,
                ObjectType::CommandPool,
                raw,
                LOCATION,
                format!(
                    "Attempt to destroy command pool with CB 0x{:x} which is in use",
                    busy
                ),
            ));
        }
        if let Some((_, node)) = self.commands.pools.remove(&raw) {
            for buffer in node.buffers {
                self.commands.buffers.remove(&buffer);
                self.retire_handle(buffer, ObjectType::CommandBuffer);
            }
        }
        self.retire_handle(raw, ObjectType::CommandPool);
        Ok(())
    }

    pub fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        _flags: vk::CommandPoolResetFlags,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkResetCommandPool";
        let raw = self.check_handle(pool, ObjectType::CommandPool, LOCATION)?;
        if let Some(busy) = self.pending_buffer_in_pool(raw) {
            return Err(self.error(
                DiagnosticCode::CommandBufferInUse,
                ObjectType::CommandPool,
                raw,
                LOCATION,
                format!(
                    "Attempt to reset command pool with CB 0x{:x} which is in use",
                    busy
                ),
            ));
        }
        let buffers = self
            .commands
            .pools
            .get(&raw)
            .map(|p| p.buffers.clone())
            .unwrap_or_default();
        for buffer in buffers {
            let node = self.commands.buffers.get(&buffer).map(|n| Arc::clone(n.value()));
            if let Some(node) = node {
                node.state.lock().reset();
            }
        }
        Ok(())
    }

    // ── Command Buffer lifecycle ────────────────────────────────

    pub fn allocate_command_buffers(
        &self,
        info: &CommandBufferAllocateInfo,
    ) -> Result<Vec<vk::CommandBuffer>, ValidationError> {
        let pool = self.check_handle(
            info.command_pool,
            ObjectType::CommandPool,
            "vkAllocateCommandBuffers",
        )?;
        let buffers: Vec<vk::CommandBuffer> = (0..info.command_buffer_count)
            .map(|_| {
                let buffer: vk::CommandBuffer = self.create_handle(ObjectType::CommandBuffer);
                self.commands.buffers.insert(
                    buffer.as_raw(),
                    Arc::new(CommandBufferNode {
                        pool,
                        level: info.level,
                        owner: Arc::new(OwnerMarker::new()),
                        state: Mutex::new(CommandBufferState::new()),
                    }),
                );
                buffer
            })
            .collect();
        if let Some(mut node) = self.commands.pools.get_mut(&pool) {
            node.buffers.extend(buffers.iter().map(|b| b.as_raw()));
        }
        Ok(buffers)
    }

    pub fn free_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkFreeCommandBuffers";
        let pool_raw = self.check_handle(pool, ObjectType::CommandPool, LOCATION)?;

        let mut to_free = Vec::with_capacity(command_buffers.len());
        for &buffer in command_buffers {
            if buffer == vk::CommandBuffer::null() {
                continue;
            }
            let node = self.command_buffer_node(buffer, LOCATION)?;
            let raw = buffer.as_raw();
            if node.pool != pool_raw {
                return Err(self.error(
                    DiagnosticCode::InvalidParameter,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkFreeCommandBuffers: CB 0x{:x} was not allocated from command pool 0x{:x}",
                        raw, pool_raw
                    ),
                ));
            }
            if node.state.lock().status == CommandBufferStatus::Pending {
                return Err(self.error(
                    DiagnosticCode::CommandBufferInUse,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!("Attempt to free CB 0x{:x} which is in use", raw),
                ));
            }
            to_free.push(raw);
        }

        for raw in &to_free {
            self.commands.buffers.remove(raw);
            self.retire_handle(*raw, ObjectType::CommandBuffer);
        }
        if let Some(mut node) = self.commands.pools.get_mut(&pool_raw) {
            node.buffers.retain(|b| !to_free.contains(b));
        }
        Ok(())
    }

    pub fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        info: &CommandBufferBeginInfo,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkBeginCommandBuffer";
        let node = self.command_buffer_node(command_buffer, LOCATION)?;
        let _guard = self.claim_owner(&node.owner, command_buffer, LOCATION)?;
        let raw = command_buffer.as_raw();
        let mut state = node.state.lock();

        if matches!(
            state.status,
            CommandBufferStatus::Recording | CommandBufferStatus::Pending
        ) {
            return Err(self.error(
                DiagnosticCode::BeginCommandBufferWhileActive,
                ObjectType::CommandBuffer,
                raw,
                LOCATION,
                format!(
                    "Calling vkBeginCommandBuffer() on active CB (0x{:x}) before it has completed. You must check CB flag before this call.",
                    raw
                ),
            ));
        }

        let inherited = if node.level == vk::CommandBufferLevel::PRIMARY {
            let names_target = info.inheritance.is_some_and(|i| {
                i.render_pass != vk::RenderPass::null() || i.framebuffer != vk::Framebuffer::null()
            });
            if names_target {
                return Err(self.error(
                    DiagnosticCode::InvalidBeginInfo,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkBeginCommandBuffer(): Primary Command Buffer (0x{:x}) may not specify framebuffer or renderpass parameters.",
                        raw
                    ),
                ));
            }
            None
        } else {
            let inheritance = match info.inheritance {
                Some(i)
                    if i.render_pass != vk::RenderPass::null()
                        && i.framebuffer != vk::Framebuffer::null() =>
                {
                    i
                }
                _ => {
                    return Err(self.error(
                        DiagnosticCode::InvalidBeginInfo,
                        ObjectType::CommandBuffer,
                        raw,
                        LOCATION,
                        format!(
                            "vkBeginCommandBuffer(): Secondary Command Buffers (0x{:x}) must specify framebuffer and renderpass parameters.",
                            raw
                        ),
                    ));
                }
            };
            let render_pass = self.lookup(
                &self.render_passes.render_passes,
                inheritance.render_pass,
                ObjectType::RenderPass,
                LOCATION,
            )?;
            self.check_handle(inheritance.framebuffer, ObjectType::Framebuffer, LOCATION)?;
            if inheritance.subpass as usize >= render_pass.subpasses.len() {
                return Err(self.error(
                    DiagnosticCode::InvalidSubpassIndex,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkBeginCommandBuffer(): inherited subpass {} is out of range for render pass 0x{:x} with {} subpasses",
                        inheritance.subpass,
                        inheritance.render_pass.as_raw(),
                        render_pass.subpasses.len()
                    ),
                ));
            }
            Some(ActiveRenderPass {
                render_pass: inheritance.render_pass.as_raw(),
                subpass: inheritance.subpass,
                draw_issued: false,
                inherited: true,
                node: render_pass,
            })
        };

        // Begin from Executable or Invalid is an implicit reset.
        state.reset();
        state.status = CommandBufferStatus::Recording;
        state.usage = info.flags;
        state.render_pass = inherited;
        debug!(
            command_buffer = format_args!("0x{:x}", raw),
            usage = ?info.flags,
            "recording started"
        );
        Ok(())
    }

    pub fn end_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkEndCommandBuffer";
        self.record(command_buffer, LOCATION, |node, state| {
            if node.level == vk::CommandBufferLevel::PRIMARY {
                if let Some(active) = &state.render_pass {
                    return Err(self.error(
                        DiagnosticCode::EndCommandBufferInsideRenderPass,
                        ObjectType::CommandBuffer,
                        command_buffer.as_raw(),
                        LOCATION,
                        format!(
                            "vkEndCommandBuffer(): It is invalid to issue this call inside an active render pass (0x{:x}).",
                            active.render_pass
                        ),
                    ));
                }
            }
            state.status = CommandBufferStatus::Executable;
            Ok(())
        })
    }

    pub fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferResetFlags,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkResetCommandBuffer";
        let node = self.command_buffer_node(command_buffer, LOCATION)?;
        let _guard = self.claim_owner(&node.owner, command_buffer, LOCATION)?;
        let raw = command_buffer.as_raw();
        let mut state = node.state.lock();

        if state.status == CommandBufferStatus::Pending {
            return Err(self.error(
                DiagnosticCode::ResetCommandBufferWhilePending,
                ObjectType::CommandBuffer,
                raw,
                LOCATION,
                format!(
                    "Resetting CB (0x{:x}) before it has completed. You must check CB flag before calling vkResetCommandBuffer().",
                    raw
                ),
            ));
        }
        let pool_flags = self
            .commands
            .pools
            .get(&node.pool)
            .map(|p| p.flags)
            .unwrap_or_default();
        if !pool_flags.contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER) {
            return Err(self.error(
                DiagnosticCode::ResetCommandBufferNotAllowed,
                ObjectType::CommandBuffer,
                raw,
                LOCATION,
                format!(
                    "Attempt to reset command buffer (0x{:x}) created from command pool (0x{:x}) that does NOT have the VK_COMMAND_POOL_CREATE_RESET_COMMAND_BUFFER_BIT bit set.",
                    raw, node.pool
                ),
            ));
        }
        state.reset();
        Ok(())
    }

    /// Current lifecycle state, `None` for an unknown handle. Reports nothing.
    pub fn command_buffer_status(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Option<CommandBufferStatus> {
        let node = self
            .commands
            .buffers
            .get(&command_buffer.as_raw())
            .map(|n| Arc::clone(n.value()))?;
        let status = node.state.lock().status;
        Some(status)
    }

    // ── Dynamic state ───────────────────────────────────────────

    pub fn cmd_set_viewport(
        &self,
        command_buffer: vk::CommandBuffer,
        first_viewport: u32,
        viewports: &[vk::Viewport],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdSetViewport";
        self.record(command_buffer, LOCATION, |_, state| {
            let count = self.check_viewport_range(
                command_buffer,
                "viewport",
                u64::from(first_viewport) + viewports.len() as u64,
                LOCATION,
            )?;
            state.dynamic |= DynamicStates::VIEWPORT;
            state.viewport_count = count;
            Ok(())
        })
    }

    pub fn cmd_set_scissor(
        &self,
        command_buffer: vk::CommandBuffer,
        first_scissor: u32,
        scissors: &[vk::Rect2D],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdSetScissor";
        self.record(command_buffer, LOCATION, |_, state| {
            let count = self.check_viewport_range(
                command_buffer,
                "scissor",
                u64::from(first_scissor) + scissors.len() as u64,
                LOCATION,
            )?;
            state.dynamic |= DynamicStates::SCISSOR;
            state.scissor_count = count;
            Ok(())
        })
    }

    fn check_viewport_range(
        &self,
        command_buffer: vk::CommandBuffer,
        what: &str,
        end: u64,
        location: &'static str,
    ) -> Result<u32, ValidationError> {
        let max = self.config().device.limits.max_viewports;
        let count = match u32::try_from(end) {
            Ok(count) if count != 0 && count <= max => count,
            _ => {
                return Err(self.error(
                    DiagnosticCode::DeviceLimitExceeded,
                    ObjectType::CommandBuffer,
                    command_buffer.as_raw(),
                    location,
                    format!(
                        "{}(): {} range ends at {}, which must be between 1 and maxViewports ({})",
                        location, what, end, max
                    ),
                ));
            }
        };
        Ok(count)
    }

    fn set_dynamic(
        &self,
        command_buffer: vk::CommandBuffer,
        location: &'static str,
        bit: DynamicStates,
    ) -> Result<(), ValidationError> {
        self.record(command_buffer, location, |_, state| {
            state.dynamic |= bit;
            Ok(())
        })
    }

    pub fn cmd_set_line_width(
        &self,
        command_buffer: vk::CommandBuffer,
        line_width: f32,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdSetLineWidth";
        if line_width.is_nan() || line_width <= 0.0 {
            return self.record(command_buffer, LOCATION, |_, _| {
                Err(self.error(
                    DiagnosticCode::InvalidParameter,
                    ObjectType::CommandBuffer,
                    command_buffer.as_raw(),
                    LOCATION,
                    format!("vkCmdSetLineWidth: lineWidth {} must be greater than 0", line_width),
                ))
            });
        }
        self.set_dynamic(command_buffer, LOCATION, DynamicStates::LINE_WIDTH)
    }

    pub fn cmd_set_depth_bias(
        &self,
        command_buffer: vk::CommandBuffer,
        _constant_factor: f32,
        _clamp: f32,
        _slope_factor: f32,
    ) -> Result<(), ValidationError> {
        self.set_dynamic(command_buffer, "vkCmdSetDepthBias", DynamicStates::DEPTH_BIAS)
    }

    pub fn cmd_set_blend_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        _blend_constants: &[f32; 4],
    ) -> Result<(), ValidationError> {
        self.set_dynamic(
            command_buffer,
            "vkCmdSetBlendConstants",
            DynamicStates::BLEND_CONSTANTS,
        )
    }

    pub fn cmd_set_depth_bounds(
        &self,
        command_buffer: vk::CommandBuffer,
        _min_depth_bounds: f32,
        _max_depth_bounds: f32,
    ) -> Result<(), ValidationError> {
        self.set_dynamic(command_buffer, "vkCmdSetDepthBounds", DynamicStates::DEPTH_BOUNDS)
    }

    pub fn cmd_set_stencil_compare_mask(
        &self,
        command_buffer: vk::CommandBuffer,
        _face_mask: vk::StencilFaceFlags,
        _compare_mask: u32,
    ) -> Result<(), ValidationError> {
        self.set_dynamic(
            command_buffer,
            "vkCmdSetStencilCompareMask",
            DynamicStates::STENCIL_COMPARE_MASK,
        )
    }

    pub fn cmd_set_stencil_write_mask(
        &self,
        command_buffer: vk::CommandBuffer,
        _face_mask: vk::StencilFaceFlags,
        _write_mask: u32,
    ) -> Result<(), ValidationError> {
        self.set_dynamic(
            command_buffer,
            "vkCmdSetStencilWriteMask",
            DynamicStates::STENCIL_WRITE_MASK,
        )
    }

    pub fn cmd_set_stencil_reference(
        &self,
        command_buffer: vk::CommandBuffer,
        _face_mask: vk::StencilFaceFlags,
        _reference: u32,
    ) -> Result<(), ValidationError> {
        self.set_dynamic(
            command_buffer,
            "vkCmdSetStencilReference",
            DynamicStates::STENCIL_REFERENCE,
        )
    }

    // ── Vertex and index buffers ────────────────────────────────

    pub fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdBindVertexBuffers";
        self.record(command_buffer, LOCATION, |_, state| {
            let raw = command_buffer.as_raw();
            if buffers.len() != offsets.len() {
                return Err(self.error(
                    DiagnosticCode::InvalidParameter,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkCmdBindVertexBuffers: {} buffers but {} offsets supplied",
                        buffers.len(),
                        offsets.len()
                    ),
                ));
            }
            let end = u64::from(first_binding) + buffers.len() as u64;
            let max = self.config().device.limits.max_vertex_input_bindings;
            if end > u64::from(max) {
                return Err(self.error(
                    DiagnosticCode::DeviceLimitExceeded,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkCmdBindVertexBuffers: firstBinding {} plus bindingCount {} exceeds maxVertexInputBindings ({})",
                        first_binding,
                        buffers.len(),
                        max
                    ),
                ));
            }
            let mut resolved = Vec::with_capacity(buffers.len());
            for &buffer in buffers {
                resolved.push(self.check_handle(buffer, ObjectType::Buffer, LOCATION)?);
            }
            for (binding, buffer) in (first_binding..).zip(resolved) {
                state.vertex_buffers.insert(binding, buffer);
            }
            Ok(())
        })
    }

    pub fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdBindIndexBuffer";
        self.record(command_buffer, LOCATION, |_, state| {
            let buffer_raw = self.check_handle(buffer, ObjectType::Buffer, LOCATION)?;
            if offset % index_type_size(index_type) != 0 {
                return Err(self.error(
                    DiagnosticCode::IndexBufferMisaligned,
                    ObjectType::CommandBuffer,
                    command_buffer.as_raw(),
                    LOCATION,
                    format!(
                        "vkCmdBindIndexBuffer() offset (0x{:x}) does not fall on alignment ({:?}) boundary.",
                        offset, index_type
                    ),
                ));
            }
            state.index_buffer = Some(buffer_raw);
            Ok(())
        })
    }

    // ── Buffer updates ──────────────────────────────────────────

    fn buffer_size(&self, buffer: vk::Buffer, location: &'static str) -> Result<u64, ValidationError> {
        let node = self.lookup(&self.memory.buffers, buffer, ObjectType::Buffer, location)?;
        Ok(node.size)
    }

    pub fn cmd_update_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst_buffer: vk::Buffer,
        dst_offset: u64,
        data: &[u8],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdUpdateBuffer";
        self.record(command_buffer, LOCATION, |_, state| {
            self.require_outside_render_pass(state, command_buffer, LOCATION)?;
            let size = self.buffer_size(dst_buffer, LOCATION)?;
            let raw = command_buffer.as_raw();
            let data_size = data.len() as u64;
            let fail = |code, message: String| {
                Err(self.error(code, ObjectType::CommandBuffer, raw, LOCATION, message))
            };

            if dst_offset % 4 != 0 {
                return fail(
                    DiagnosticCode::BufferUpdateMisaligned,
                    "vkCmdUpdateBuffer parameter, VkDeviceSize destOffset, is not a multiple of 4"
                        .to_string(),
                );
            }
            if data_size % 4 != 0 {
                return fail(
                    DiagnosticCode::BufferUpdateMisaligned,
                    "vkCmdUpdateBuffer parameter, VkDeviceSize dataSize, is not a multiple of 4"
                        .to_string(),
                );
            }
            let max = self.config().device.limits.max_update_buffer_size;
            if data_size == 0 || data_size > max {
                return fail(
                    DiagnosticCode::InvalidParameter,
                    format!(
                        "vkCmdUpdateBuffer parameter, VkDeviceSize dataSize ({}), must be greater than zero and at most {}",
                        data_size, max
                    ),
                );
            }
            if dst_offset.saturating_add(data_size) > size {
                return fail(
                    DiagnosticCode::InvalidParameter,
                    format!(
                        "vkCmdUpdateBuffer: destOffset 0x{:x} plus dataSize 0x{:x} exceeds buffer size 0x{:x}",
                        dst_offset, data_size, size
                    ),
                );
            }
            Ok(())
        })
    }

    pub fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst_buffer: vk::Buffer,
        dst_offset: u64,
        size: u64,
        _data: u32,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdFillBuffer";
        self.record(command_buffer, LOCATION, |_, state| {
            self.require_outside_render_pass(state, command_buffer, LOCATION)?;
            let buffer_size = self.buffer_size(dst_buffer, LOCATION)?;
            let raw = command_buffer.as_raw();
            let fail = |code, message: String| {
                Err(self.error(code, ObjectType::CommandBuffer, raw, LOCATION, message))
            };

            if dst_offset % 4 != 0 {
                return fail(
                    DiagnosticCode::BufferUpdateMisaligned,
                    "vkCmdFillBuffer parameter, VkDeviceSize destOffset, is not a multiple of 4"
                        .to_string(),
                );
            }
            if size != vk::WHOLE_SIZE && size % 4 != 0 {
                return fail(
                    DiagnosticCode::BufferUpdateMisaligned,
                    "vkCmdFillBuffer parameter, VkDeviceSize fillSize, is not a multiple of 4"
                        .to_string(),
                );
            }
            if dst_offset >= buffer_size
                || (size != vk::WHOLE_SIZE && dst_offset.saturating_add(size) > buffer_size)
            {
                return fail(
                    DiagnosticCode::InvalidParameter,
                    format!(
                        "vkCmdFillBuffer: range starting at destOffset 0x{:x} with fillSize 0x{:x} does not fit in buffer of size 0x{:x}",
                        dst_offset, size, buffer_size
                    ),
                );
            }
            Ok(())
        })
    }

    // ── Draws ───────────────────────────────────────────────────

    fn validate_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        state: &CommandBufferState,
        location: &'static str,
        indexed: bool,
    ) -> Result<(), ValidationError> {
        let raw = command_buffer.as_raw();
        let fail = |code, message: String| {
            Err(self.error(code, ObjectType::CommandBuffer, raw, location, message))
        };

        self.require_inside_render_pass(state, command_buffer, location)?;
        let Some((pipeline_raw, pipeline)) = &state.pipeline else {
            return fail(
                DiagnosticCode::NoPipelineBound,
                format!(
                    "{}(): a graphics pipeline must be bound to CB 0x{:x} with vkCmdBindPipeline() before drawing",
                    location, raw
                ),
            );
        };

        let missing = pipeline.dynamic - state.dynamic;
        if let Some((_, name)) = DYNAMIC_STATE_NAMES
            .iter()
            .find(|(bit, _)| missing.contains(*bit))
        {
            return fail(
                DiagnosticCode::DynamicStateNotSet,
                format!("Dynamic {} state not set for this command buffer", name),
            );
        }

        if pipeline.dynamic.contains(DynamicStates::VIEWPORT) {
            if let Some(expected) = pipeline.viewport_count {
                if state.viewport_count != expected {
                    return fail(
                        DiagnosticCode::DynamicCountMismatch,
                        format!(
                            "Dynamic viewportCount from vkCmdSetViewport() is {}, but PSO viewportCount is {}. These counts must match.",
                            state.viewport_count, expected
                        ),
                    );
                }
            }
        }
        if pipeline.dynamic.contains(DynamicStates::SCISSOR) {
            if let Some(expected) = pipeline.scissor_count {
                if state.scissor_count != expected {
                    return fail(
                        DiagnosticCode::DynamicCountMismatch,
                        format!(
                            "Dynamic scissorCount from vkCmdSetScissor() is {}, but PSO scissorCount is {}. These counts must match.",
                            state.scissor_count, expected
                        ),
                    );
                }
            }
        }

        for binding in state.vertex_buffers.keys() {
            if pipeline.vertex_bindings.contains(binding) {
                continue;
            }
            let message = if pipeline.vertex_bindings.is_empty() {
                format!(
                    "Vtx Buffer Index {} was bound, but no vtx buffers are attached to PSO.",
                    binding
                )
            } else {
                format!(
                    "Vtx Buffer Index {} was bound, but PSO 0x{:x} does not declare a vertex binding with that index.",
                    binding, pipeline_raw
                )
            };
            return fail(DiagnosticCode::VertexBindingNotDeclared, message);
        }

        if indexed && state.index_buffer.is_none() {
            return fail(
                DiagnosticCode::IndexBufferNotBound,
                format!(
                    "{}() issued on CB 0x{:x} with no index buffer bound",
                    location, raw
                ),
            );
        }
        Ok(())
    }

    fn mark_draw(state: &mut CommandBufferState) {
        if let Some(active) = state.render_pass.as_mut() {
            active.draw_issued = true;
        }
    }

    pub fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        _vertex_count: u32,
        _instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdDraw";
        self.record(command_buffer, LOCATION, |_, state| {
            self.validate_draw(command_buffer, state, LOCATION, false)?;
            Self::mark_draw(state);
            Ok(())
        })
    }

    pub fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        _index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdDrawIndexed";
        self.record(command_buffer, LOCATION, |_, state| {
            self.validate_draw(command_buffer, state, LOCATION, true)?;
            Self::mark_draw(state);
            Ok(())
        })
    }

    // ── Clears inside a render pass ─────────────────────────────

    pub fn cmd_clear_attachments(
        &self,
        command_buffer: vk::CommandBuffer,
        attachments: &[vk::ClearAttachment],
        _rects: &[vk::ClearRect],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdClearAttachments";
        self.record(command_buffer, LOCATION, |_, state| {
            let raw = command_buffer.as_raw();
            let active = self.require_inside_render_pass(state, command_buffer, LOCATION)?;
            let subpass = active.node.subpasses.get(active.subpass as usize);
            let color_count = subpass.map_or(0, |s| s.color_attachments.len());
            let has_depth = subpass.is_some_and(|s| s.depth_stencil_attachment.is_some());

            for attachment in attachments {
                if attachment.aspect_mask.contains(vk::ImageAspectFlags::COLOR) {
                    if attachment.color_attachment as usize >= color_count {
                        return Err(self.error(
                            DiagnosticCode::InvalidClearAttachment,
                            ObjectType::CommandBuffer,
                            raw,
                            LOCATION,
                            format!(
                                "vkCmdClearAttachments() attachment index {} not found in current subpass, which has {} color attachments",
                                attachment.color_attachment, color_count
                            ),
                        ));
                    }
                } else if !has_depth {
                    return Err(self.error(
                        DiagnosticCode::InvalidClearAttachment,
                        ObjectType::CommandBuffer,
                        raw,
                        LOCATION,
                        "vkCmdClearAttachments() clears a depth/stencil aspect but the current subpass has no depth/stencil attachment".to_string(),
                    ));
                }
            }

            if !active.draw_issued {
                self.warn(
                    DiagnosticCode::ClearBeforeDraw,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkCmdClearAttachments() issued on CB object 0x{:x} prior to any Draw Cmds. It is recommended you use RenderPass LOAD_OP_CLEAR on Attachments prior to any Draw.",
                        raw
                    ),
                );
            }
            Ok(())
        })
    }

    // ── Secondary command buffers ───────────────────────────────

    pub fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdExecuteCommands";
        self.record(command_buffer, LOCATION, |node, _state| {
            let raw = command_buffer.as_raw();
            if node.level != vk::CommandBufferLevel::PRIMARY {
                return Err(self.error(
                    DiagnosticCode::InvalidCommandBufferLevel,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkCmdExecuteCommands() must be called on a primary command buffer, CB 0x{:x} is secondary",
                        raw
                    ),
                ));
            }
            for (index, &secondary) in secondaries.iter().enumerate() {
                let target = self.command_buffer_node(secondary, LOCATION)?;
                let target_raw = secondary.as_raw();
                if target.level == vk::CommandBufferLevel::PRIMARY {
                    return Err(self.error(
                        DiagnosticCode::PrimaryInExecuteCommands,
                        ObjectType::CommandBuffer,
                        target_raw,
                        LOCATION,
                        format!(
                            "vkCmdExecuteCommands() called w/ Primary Cmd Buffer 0x{:x} in element {} of pCommandBuffers array. All cmd buffers in pCommandBuffers array must be secondary.",
                            target_raw, index
                        ),
                    ));
                }
                let status = target.state.lock().status;
                if status != CommandBufferStatus::Executable {
                    return Err(self.error(
                        DiagnosticCode::SecondaryNotExecutable,
                        ObjectType::CommandBuffer,
                        target_raw,
                        LOCATION,
                        format!(
                            "vkCmdExecuteCommands() called w/ secondary Cmd Buffer 0x{:x} that is not in the executable state ({:?})",
                            target_raw, status
                        ),
                    ));
                }
            }
            Ok(())
        })
    }
}
