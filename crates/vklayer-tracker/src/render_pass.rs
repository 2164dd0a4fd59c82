//! Render passes, framebuffers, and render pass scope on command buffers.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;
use vklayer_core::{DiagnosticCode, ObjectType, ValidationError};

use crate::command::ActiveRenderPass;
use crate::context::ValidationContext;

#[derive(Debug, Clone, Default)]
pub struct SubpassDescription {
    pub pipeline_bind_point: vk::PipelineBindPoint,
    pub input_attachments: Vec<vk::AttachmentReference>,
    pub color_attachments: Vec<vk::AttachmentReference>,
    /// Empty, or one entry per color attachment.
    pub resolve_attachments: Vec<vk::AttachmentReference>,
    pub depth_stencil_attachment: Option<vk::AttachmentReference>,
}

#[derive(Debug, Clone, Default)]
pub struct RenderPassCreateInfo {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
}

#[derive(Debug, Clone, Default)]
pub struct FramebufferCreateInfo {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderPassBeginInfo {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
}

#[derive(Debug)]
pub(crate) struct RenderPassNode {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
}

impl RenderPassNode {
    fn attachment(&self, reference: &vk::AttachmentReference) -> Option<&vk::AttachmentDescription> {
        if reference.attachment == vk::ATTACHMENT_UNUSED {
            return None;
        }
        self.attachments.get(reference.attachment as usize)
    }

    /// Sample count a pipeline must match in `subpass`: the first used color
    /// attachment's, else the depth attachment's. `None` when the subpass
    /// has no attachments to constrain it.
    pub fn subpass_samples(&self, subpass: u32) -> Option<vk::SampleCountFlags> {
        let desc = self.subpasses.get(subpass as usize)?;
        desc.color_attachments
            .iter()
            .chain(desc.depth_stencil_attachment.iter())
            .find_map(|r| self.attachment(r))
            .map(|a| a.samples)
    }

    /// Format of each color attachment slot of `subpass`, `None` for unused slots.
    pub fn color_formats(&self, subpass: u32) -> Vec<Option<vk::Format>> {
        self.subpasses
            .get(subpass as usize)
            .map(|desc| {
                desc.color_attachments
                    .iter()
                    .map(|r| self.attachment(r).map(|a| a.format))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FramebufferNode {
    pub render_pass: u64,
}

#[derive(Default)]
pub(crate) struct RenderPassTracker {
    pub render_passes: DashMap<u64, Arc<RenderPassNode>>,
    pub framebuffers: DashMap<u64, FramebufferNode>,
}

impl ValidationContext {
    // ── Render pass objects ─────────────────────────────────────

    pub fn create_render_pass(
        &self,
        info: &RenderPassCreateInfo,
    ) -> Result<vk::RenderPass, ValidationError> {
        const LOCATION: &str = "vkCreateRenderPass";
        let device = self.device().as_raw();
        if info.subpasses.is_empty() {
            return Err(self.error(
                DiagnosticCode::InvalidParameter,
                ObjectType::Device,
                device,
                LOCATION,
                "vkCreateRenderPass: subpassCount must be greater than 0".to_string(),
            ));
        }

        let count = info.attachments.len() as u32;
        for (index, subpass) in info.subpasses.iter().enumerate() {
            if !subpass.resolve_attachments.is_empty()
                && subpass.resolve_attachments.len() != subpass.color_attachments.len()
            {
                return Err(self.error(
                    DiagnosticCode::InvalidAttachmentReference,
                    ObjectType::Device,
                    device,
                    LOCATION,
                    format!(
                        "vkCreateRenderPass: subpass {} has {} resolve attachments for {} color attachments",
                        index,
                        subpass.resolve_attachments.len(),
                        subpass.color_attachments.len()
                    ),
                ));
            }
            let references = subpass
                .input_attachments
                .iter()
                .chain(&subpass.color_attachments)
                .chain(&subpass.resolve_attachments)
                .chain(subpass.depth_stencil_attachment.iter());
            for reference in references {
                if reference.attachment != vk::ATTACHMENT_UNUSED && reference.attachment >= count {
                    return Err(self.error(
                        DiagnosticCode::InvalidAttachmentReference,
                        ObjectType::Device,
                        device,
                        LOCATION,
                        format!(
                            "vkCreateRenderPass: subpass {} references attachment {} but only {} attachments are defined",
                            index, reference.attachment, count
                        ),
                    ));
                }
            }
        }

        let render_pass: vk::RenderPass = self.create_handle(ObjectType::RenderPass);
        self.render_passes.render_passes.insert(
            render_pass.as_raw(),
            Arc::new(RenderPassNode {
                attachments: info.attachments.clone(),
                subpasses: info.subpasses.clone(),
            }),
        );
        Ok(render_pass)
    }

    pub fn destroy_render_pass(&self, render_pass: vk::RenderPass) -> Result<(), ValidationError> {
        if render_pass == vk::RenderPass::null() {
            return Ok(());
        }
        let raw = self.check_handle(render_pass, ObjectType::RenderPass, "vkDestroyRenderPass")?;
        self.render_passes.render_passes.remove(&raw);
        self.retire_handle(raw, ObjectType::RenderPass);
        Ok(())
    }

    pub fn create_framebuffer(
        &self,
        info: &FramebufferCreateInfo,
    ) -> Result<vk::Framebuffer, ValidationError> {
        const LOCATION: &str = "vkCreateFramebuffer";
        let render_pass = self.lookup(
            &self.render_passes.render_passes,
            info.render_pass,
            ObjectType::RenderPass,
            LOCATION,
        )?;
        for &view in &info.attachments {
            self.check_handle(view, ObjectType::ImageView, LOCATION)?;
        }
        let rp_raw = info.render_pass.as_raw();
        if info.attachments.len() != render_pass.attachments.len() {
            return Err(self.error(
                DiagnosticCode::FramebufferMismatch,
                ObjectType::RenderPass,
                rp_raw,
                LOCATION,
                format!(
                    "vkCreateFramebuffer(): VkFramebufferCreateInfo attachmentCount of {} does not match attachmentCount of {} of renderPass (0x{:x}) being used to create Framebuffer.",
                    info.attachments.len(),
                    render_pass.attachments.len(),
                    rp_raw
                ),
            ));
        }
        if info.width == 0 || info.height == 0 || info.layers == 0 {
            return Err(self.error(
                DiagnosticCode::InvalidParameter,
                ObjectType::RenderPass,
                rp_raw,
                LOCATION,
                format!(
                    "vkCreateFramebuffer(): width ({}), height ({}) and layers ({}) must be non-zero",
                    info.width, info.height, info.layers
                ),
            ));
        }

        let framebuffer: vk::Framebuffer = self.create_handle(ObjectType::Framebuffer);
        self.render_passes
            .framebuffers
            .insert(framebuffer.as_raw(), FramebufferNode { render_pass: rp_raw });
        Ok(framebuffer)
    }

    pub fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) -> Result<(), ValidationError> {
        if framebuffer == vk::Framebuffer::null() {
            return Ok(());
        }
        let raw = self.check_handle(framebuffer, ObjectType::Framebuffer, "vkDestroyFramebuffer")?;
        self.render_passes.framebuffers.remove(&raw);
        self.retire_handle(raw, ObjectType::Framebuffer);
        Ok(())
    }

    // ── Render pass scope ───────────────────────────────────────

    pub fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        info: &RenderPassBeginInfo,
        _contents: vk::SubpassContents,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdBeginRenderPass";
        self.record(command_buffer, LOCATION, |node, state| {
            let raw = command_buffer.as_raw();
            if info.render_pass == vk::RenderPass::null() {
                return Err(self.error(
                    DiagnosticCode::NullRenderPass,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    "You cannot use a NULL RenderPass object in vkCmdBeginRenderPass()".to_string(),
                ));
            }
            if node.level != vk::CommandBufferLevel::PRIMARY {
                return Err(self.error(
                    DiagnosticCode::InvalidCommandBufferLevel,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkCmdBeginRenderPass(): cannot be recorded into secondary CB 0x{:x}",
                        raw
                    ),
                ));
            }
            if state.render_pass.is_some() {
                return Err(self.error(
                    DiagnosticCode::InsideRenderPass,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    "vkCmdBeginRenderPass(): It is invalid to issue this call inside an active render pass.".to_string(),
                ));
            }
            let render_pass = self.lookup(
                &self.render_passes.render_passes,
                info.render_pass,
                ObjectType::RenderPass,
                LOCATION,
            )?;
            let framebuffer = self.lookup(
                &self.render_passes.framebuffers,
                info.framebuffer,
                ObjectType::Framebuffer,
                LOCATION,
            )?;
            let rp_raw = info.render_pass.as_raw();
            let fb_pass = self
                .render_passes
                .render_passes
                .get(&framebuffer.render_pass)
                .map(|n| Arc::clone(n.value()));
            let compatible = fb_pass.is_some_and(|fb_pass| {
                fb_pass.attachments.len() == render_pass.attachments.len()
            });
            if !compatible {
                return Err(self.error(
                    DiagnosticCode::FramebufferMismatch,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkCmdBeginRenderPass(): framebuffer 0x{:x} was created for render pass 0x{:x}, which is not compatible with render pass 0x{:x}",
                        info.framebuffer.as_raw(),
                        framebuffer.render_pass,
                        rp_raw
                    ),
                ));
            }

            state.render_pass = Some(ActiveRenderPass {
                render_pass: rp_raw,
                subpass: 0,
                draw_issued: false,
                inherited: false,
                node: render_pass,
            });
            Ok(())
        })
    }

    pub fn cmd_next_subpass(
        &self,
        command_buffer: vk::CommandBuffer,
        _contents: vk::SubpassContents,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdNextSubpass";
        self.record(command_buffer, LOCATION, |_, state| {
            let active = self.require_inside_render_pass(state, command_buffer, LOCATION)?;
            if active.subpass as usize + 1 >= active.node.subpasses.len() {
                return Err(self.error(
                    DiagnosticCode::InvalidSubpassIndex,
                    ObjectType::CommandBuffer,
                    command_buffer.as_raw(),
                    LOCATION,
                    format!(
                        "vkCmdNextSubpass(): Attempted to advance beyond final subpass of render pass 0x{:x}",
                        active.render_pass
                    ),
                ));
            }
            if let Some(active) = state.render_pass.as_mut() {
                active.subpass += 1;
                active.draw_issued = false;
            }
            Ok(())
        })
    }

    pub fn cmd_end_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdEndRenderPass";
        self.record(command_buffer, LOCATION, |_, state| {
            let raw = command_buffer.as_raw();
            let active = self.require_inside_render_pass(state, command_buffer, LOCATION)?;
            if active.inherited {
                return Err(self.error(
                    DiagnosticCode::InvalidCommandBufferLevel,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkCmdEndRenderPass(): cannot be recorded into secondary CB 0x{:x}",
                        raw
                    ),
                ));
            }
            if active.subpass as usize + 1 != active.node.subpasses.len() {
                return Err(self.error(
                    DiagnosticCode::InvalidSubpassIndex,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkCmdEndRenderPass(): Called before reaching final subpass, current subpass is {} of {}",
                        active.subpass,
                        active.node.subpasses.len()
                    ),
                ));
            }
            state.render_pass = None;
            Ok(())
        })
    }
}
