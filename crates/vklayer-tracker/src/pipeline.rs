//! Pipeline caches, pipeline layouts, graphics pipeline creation and
//! binding.

use std::collections::HashSet;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;
use tracing::debug;
use vklayer_core::{DiagnosticCode, ObjectType, ValidationError};

use crate::command::DynamicStates;
use crate::context::ValidationContext;
use crate::descriptor::SetLayoutNode;
use crate::shader::ResolvedStage;

#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutCreateInfo {
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
}

#[derive(Debug, Clone)]
pub struct PipelineShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry_point: String,
}

impl Default for PipelineShaderStage {
    fn default() -> Self {
        Self {
            stage: vk::ShaderStageFlags::VERTEX,
            module: vk::ShaderModule::null(),
            entry_point: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VertexInputState {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InputAssemblyState {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart_enable: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TessellationState {
    pub patch_control_points: u32,
}

/// `None` data with a non-zero count models a null `pViewports`/`pScissors`.
#[derive(Debug, Clone, Default)]
pub struct ViewportState {
    pub viewport_count: u32,
    pub viewports: Option<Vec<vk::Viewport>>,
    pub scissor_count: u32,
    pub scissors: Option<Vec<vk::Rect2D>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RasterizationState {
    pub rasterizer_discard_enable: bool,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_bias_enable: bool,
    pub line_width: f32,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            rasterizer_discard_enable: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_bias_enable: false,
            line_width: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MultisampleState {
    pub rasterization_samples: vk::SampleCountFlags,
    pub sample_shading_enable: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            sample_shading_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub depth_bounds_test_enable: bool,
    pub stencil_test_enable: bool,
    pub front: vk::StencilOpState,
    pub back: vk::StencilOpState,
}

#[derive(Debug, Clone, Default)]
pub struct ColorBlendState {
    pub attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub blend_constants: [f32; 4],
}

#[derive(Debug, Clone, Default)]
pub struct GraphicsPipelineCreateInfo {
    pub flags: vk::PipelineCreateFlags,
    pub stages: Vec<PipelineShaderStage>,
    pub vertex_input: Option<VertexInputState>,
    pub input_assembly: Option<InputAssemblyState>,
    pub tessellation: Option<TessellationState>,
    pub viewport: Option<ViewportState>,
    pub rasterization: Option<RasterizationState>,
    pub multisample: Option<MultisampleState>,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_blend: Option<ColorBlendState>,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
}

#[derive(Debug)]
pub(crate) struct PipelineLayoutNode {
    pub set_layouts: Vec<Arc<SetLayoutNode>>,
}

/// What draw-time validation needs from a pipeline.
#[derive(Debug)]
pub(crate) struct PipelineNode {
    pub dynamic: DynamicStates,
    /// `None` when the pipeline has no viewport state.
    pub viewport_count: Option<u32>,
    pub scissor_count: Option<u32>,
    pub samples: vk::SampleCountFlags,
    pub vertex_bindings: Vec<u32>,
}

#[derive(Default)]
pub(crate) struct PipelineTracker {
    pub layouts: DashMap<u64, Arc<PipelineLayoutNode>>,
    pub pipelines: DashMap<u64, Arc<PipelineNode>>,
}

const MAX_PATCH_CONTROL_POINTS: u32 = 32;

impl ValidationContext {
    // ── Caches and layouts ──────────────────────────────────────

    pub fn create_pipeline_cache(&self) -> Result<vk::PipelineCache, ValidationError> {
        Ok(self.create_handle(ObjectType::PipelineCache))
    }

    pub fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) -> Result<(), ValidationError> {
        if cache == vk::PipelineCache::null() {
            return Ok(());
        }
        let raw = self.check_handle(cache, ObjectType::PipelineCache, "vkDestroyPipelineCache")?;
        self.retire_handle(raw, ObjectType::PipelineCache);
        Ok(())
    }

    pub fn create_pipeline_layout(
        &self,
        info: &PipelineLayoutCreateInfo,
    ) -> Result<vk::PipelineLayout, ValidationError> {
        const LOCATION: &str = "vkCreatePipelineLayout";
        let max = self.config().device.limits.max_bound_descriptor_sets;
        if info.set_layouts.len() > max as usize {
            return Err(self.error(
                DiagnosticCode::DeviceLimitExceeded,
                ObjectType::Device,
                self.device().as_raw(),
                LOCATION,
                format!(
                    "vkCreatePipelineLayout(): setLayoutCount {} exceeds maxBoundDescriptorSets ({})",
                    info.set_layouts.len(),
                    max
                ),
            ));
        }
        let mut set_layouts = Vec::with_capacity(info.set_layouts.len());
        for &layout in &info.set_layouts {
            set_layouts.push(self.lookup(
                &self.descriptors.set_layouts,
                layout,
                ObjectType::DescriptorSetLayout,
                LOCATION,
            )?);
        }
        let layout: vk::PipelineLayout = self.create_handle(ObjectType::PipelineLayout);
        self.pipelines
            .layouts
            .insert(layout.as_raw(), Arc::new(PipelineLayoutNode { set_layouts }));
        Ok(layout)
    }

    pub fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) -> Result<(), ValidationError> {
        if layout == vk::PipelineLayout::null() {
            return Ok(());
        }
        let raw = self.check_handle(layout, ObjectType::PipelineLayout, "vkDestroyPipelineLayout")?;
        self.pipelines.layouts.remove(&raw);
        self.retire_handle(raw, ObjectType::PipelineLayout);
        Ok(())
    }

    // ── Graphics pipelines ──────────────────────────────────────

    /// Create one pipeline per create info. Either all are created or none.
    pub fn create_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        infos: &[GraphicsPipelineCreateInfo],
    ) -> Result<Vec<vk::Pipeline>, ValidationError> {
        const LOCATION: &str = "vkCreateGraphicsPipelines";
        if cache != vk::PipelineCache::null() {
            self.check_handle(cache, ObjectType::PipelineCache, LOCATION)?;
        }
        let mut nodes = Vec::with_capacity(infos.len());
        for info in infos {
            nodes.push(self.validate_graphics_pipeline(info)?);
        }
        let pipelines = nodes
            .into_iter()
            .map(|node| {
                let pipeline: vk::Pipeline = self.create_handle(ObjectType::Pipeline);
                self.pipelines
                    .pipelines
                    .insert(pipeline.as_raw(), Arc::new(node));
                pipeline
            })
            .collect::<Vec<_>>();
        debug!(count = pipelines.len(), "graphics pipelines created");
        Ok(pipelines)
    }

    fn validate_graphics_pipeline(
        &self,
        info: &GraphicsPipelineCreateInfo,
    ) -> Result<PipelineNode, ValidationError> {
        const LOCATION: &str = "vkCreateGraphicsPipelines";
        let device = self.device().as_raw();
        let fail = |code, message: String| {
            Err(self.error(code, ObjectType::Device, device, LOCATION, message))
        };

        let layout = self.lookup(
            &self.pipelines.layouts,
            info.layout,
            ObjectType::PipelineLayout,
            LOCATION,
        )?;
        let render_pass = self.lookup(
            &self.render_passes.render_passes,
            info.render_pass,
            ObjectType::RenderPass,
            LOCATION,
        )?;
        if info.subpass as usize >= render_pass.subpasses.len() {
            return fail(
                DiagnosticCode::InvalidSubpassIndex,
                format!(
                    "vkCreateGraphicsPipelines(): subpass {} is out of range for render pass 0x{:x} with {} subpasses",
                    info.subpass,
                    info.render_pass.as_raw(),
                    render_pass.subpasses.len()
                ),
            );
        }
        let mut stages = Vec::with_capacity(info.stages.len());
        for stage in &info.stages {
            let module = self.lookup(
                &self.shaders.modules,
                stage.module,
                ObjectType::ShaderModule,
                LOCATION,
            )?;
            stages.push(ResolvedStage {
                stage: stage.stage,
                module,
                module_handle: stage.module.as_raw(),
                entry_point: stage.entry_point.clone(),
            });
        }
        let has_stage = |flag| stages.iter().any(|s| s.stage == flag);

        if !has_stage(vk::ShaderStageFlags::VERTEX) {
            return fail(
                DiagnosticCode::InvalidPipelineCreateState,
                "Invalid Pipeline CreateInfo State: Vtx Shader required".to_string(),
            );
        }

        let has_control = has_stage(vk::ShaderStageFlags::TESSELLATION_CONTROL);
        let has_evaluation = has_stage(vk::ShaderStageFlags::TESSELLATION_EVALUATION);
        let topology = info.input_assembly.map(|ia| ia.topology);
        let patch_list = topology == Some(vk::PrimitiveTopology::PATCH_LIST);
        if has_control != has_evaluation {
            return fail(
                DiagnosticCode::InvalidPipelineCreateState,
                "Invalid Pipeline CreateInfo State: TE and TC shaders must be included or excluded as a pair".to_string(),
            );
        }
        if has_control && !patch_list {
            return fail(
                DiagnosticCode::InvalidPipelineCreateState,
                "Invalid Pipeline CreateInfo State: VK_PRIMITIVE_TOPOLOGY_PATCH_LIST must be set as IA topology for tessellation pipelines".to_string(),
            );
        }
        if patch_list && !has_control {
            return fail(
                DiagnosticCode::InvalidPipelineCreateState,
                "Invalid Pipeline CreateInfo State: VK_PRIMITIVE_TOPOLOGY_PATCH primitive topology is only valid for tessellation pipelines".to_string(),
            );
        }
        if has_control {
            let points = info.tessellation.map_or(0, |t| t.patch_control_points);
            if points == 0 || points > MAX_PATCH_CONTROL_POINTS {
                return fail(
                    DiagnosticCode::InvalidPipelineCreateState,
                    format!(
                        "Invalid Pipeline CreateInfo State: VK_PRIMITIVE_TOPOLOGY_PATCH primitive topology used with patchControlPoints value {}. patchControlPoints should be >0 and <={}.",
                        points, MAX_PATCH_CONTROL_POINTS
                    ),
                );
            }
        }

        let dynamic = info
            .dynamic_states
            .iter()
            .fold(DynamicStates::empty(), |acc, s| acc | DynamicStates::from_vk(*s));
        let discard = info
            .rasterization
            .is_some_and(|r| r.rasterizer_discard_enable);
        if !discard {
            self.validate_viewport_state(info.viewport.as_ref(), dynamic)?;
        }

        let vertex_bindings = self.validate_vertex_input(info.vertex_input.as_ref())?;

        if self.config().checks.shader_interface {
            self.validate_pipeline_interfaces(info, &stages, &render_pass, &layout)?;
        }

        Ok(PipelineNode {
            dynamic,
            viewport_count: info.viewport.as_ref().map(|v| v.viewport_count),
            scissor_count: info.viewport.as_ref().map(|v| v.scissor_count),
            samples: info
                .multisample
                .map_or(vk::SampleCountFlags::TYPE_1, |m| m.rasterization_samples),
            vertex_bindings,
        })
    }

    fn validate_viewport_state(
        &self,
        state: Option<&ViewportState>,
        dynamic: DynamicStates,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCreateGraphicsPipelines";
        let device = self.device().as_raw();
        let fail = |code, message: String| {
            Err(self.error(code, ObjectType::Device, device, LOCATION, message))
        };
        let dynamic_viewport = dynamic.contains(DynamicStates::VIEWPORT);
        let dynamic_scissor = dynamic.contains(DynamicStates::SCISSOR);

        let Some(state) = state else {
            if dynamic_viewport && dynamic_scissor {
                return Ok(());
            }
            return fail(
                DiagnosticCode::ViewportStateMissing,
                "Gfx Pipeline pViewportState is null. Unless both viewport and scissor are dynamic the PSO must include viewportCount and scissorCount in pViewportState.".to_string(),
            );
        };

        if state.viewport_count != state.scissor_count {
            return fail(
                DiagnosticCode::ViewportScissorCountMismatch,
                format!(
                    "Gfx Pipeline viewport count ({}) must match scissor count ({}).",
                    state.viewport_count, state.scissor_count
                ),
            );
        }
        if state.viewport_count > 0 && state.viewports.is_none() && !dynamic_viewport {
            return fail(
                DiagnosticCode::ViewportStateMissing,
                format!(
                    "Gfx Pipeline viewportCount is {}, but pViewports is NULL. For non-zero viewportCount, you must either include pViewports data, or include viewport in pDynamicState and set it with vkCmdSetViewport().",
                    state.viewport_count
                ),
            );
        }
        if state.scissor_count > 0 && state.scissors.is_none() && !dynamic_scissor {
            return fail(
                DiagnosticCode::ViewportStateMissing,
                format!(
                    "Gfx Pipeline scissorCount is {}, but pScissors is NULL. For non-zero scissorCount, you must either include pScissors data, or include scissor in pDynamicState and set it with vkCmdSetScissor().",
                    state.scissor_count
                ),
            );
        }
        let short_viewports = state
            .viewports
            .as_ref()
            .is_some_and(|v| v.len() < state.viewport_count as usize);
        let short_scissors = state
            .scissors
            .as_ref()
            .is_some_and(|s| s.len() < state.scissor_count as usize);
        if short_viewports || short_scissors {
            return fail(
                DiagnosticCode::InvalidParameter,
                format!(
                    "Gfx Pipeline pViewportState supplies fewer viewports or scissors than its counts ({})",
                    state.viewport_count
                ),
            );
        }
        let max = self.config().device.limits.max_viewports;
        if state.viewport_count > max {
            return fail(
                DiagnosticCode::DeviceLimitExceeded,
                format!(
                    "Gfx Pipeline viewportCount {} exceeds maxViewports ({})",
                    state.viewport_count, max
                ),
            );
        }
        Ok(())
    }

    /// Returns the declared binding numbers.
    fn validate_vertex_input(
        &self,
        state: Option<&VertexInputState>,
    ) -> Result<Vec<u32>, ValidationError> {
        const LOCATION: &str = "vkCreateGraphicsPipelines";
        let Some(state) = state else {
            return Ok(Vec::new());
        };
        let device = self.device().as_raw();
        let fail = |code, message: String| {
            Err(self.error(code, ObjectType::Device, device, LOCATION, message))
        };

        let mut declared = HashSet::new();
        for binding in &state.bindings {
            if !declared.insert(binding.binding) {
                return fail(
                    DiagnosticCode::DuplicateVertexBinding,
                    format!(
                        "Duplicate vertex input binding descriptions for binding {}",
                        binding.binding
                    ),
                );
            }
        }
        let max = self.config().device.limits.max_vertex_input_bindings;
        if let Some(binding) = state.bindings.iter().find(|b| b.binding >= max) {
            return fail(
                DiagnosticCode::DeviceLimitExceeded,
                format!(
                    "Vertex input binding {} exceeds maxVertexInputBindings ({})",
                    binding.binding, max
                ),
            );
        }
        if let Some(attribute) = state
            .attributes
            .iter()
            .find(|a| !declared.contains(&a.binding))
        {
            return fail(
                DiagnosticCode::InvalidPipelineCreateState,
                format!(
                    "Invalid Pipeline CreateInfo State: vertex attribute at location {} references binding {} which has no binding description",
                    attribute.location, attribute.binding
                ),
            );
        }
        Ok(state.bindings.iter().map(|b| b.binding).collect())
    }

    pub fn destroy_pipeline(&self, pipeline: vk::Pipeline) -> Result<(), ValidationError> {
        if pipeline == vk::Pipeline::null() {
            return Ok(());
        }
        let raw = self.check_handle(pipeline, ObjectType::Pipeline, "vkDestroyPipeline")?;
        self.pipelines.pipelines.remove(&raw);
        self.retire_handle(raw, ObjectType::Pipeline);
        Ok(())
    }

    // ── Binding ─────────────────────────────────────────────────

    pub fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdBindPipeline";
        self.record(command_buffer, LOCATION, |_, state| {
            let raw = command_buffer.as_raw();
            let node = self.lookup(
                &self.pipelines.pipelines,
                pipeline,
                ObjectType::Pipeline,
                LOCATION,
            )?;
            let pipeline_raw = pipeline.as_raw();
            if bind_point != vk::PipelineBindPoint::GRAPHICS {
                return Err(self.error(
                    DiagnosticCode::InvalidParameter,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkCmdBindPipeline(): pipeline 0x{:x} is a graphics pipeline but was bound to {:?}",
                        pipeline_raw, bind_point
                    ),
                ));
            }
            let Some(active) = &state.render_pass else {
                return Err(self.error(
                    DiagnosticCode::PipelineBoundOutsideRenderPass,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "Incorrectly binding graphics pipeline (0x{:x}) without an active RenderPass",
                        pipeline_raw
                    ),
                ));
            };
            if let Some(samples) = active.node.subpass_samples(active.subpass) {
                if samples != node.samples {
                    return Err(self.error(
                        DiagnosticCode::NumSamplesMismatch,
                        ObjectType::CommandBuffer,
                        raw,
                        LOCATION,
                        format!(
                            "Num samples mismatch! Binding PSO (0x{:x}) with {} samples while current RenderPass (0x{:x}) w/ {} samples!",
                            pipeline_raw,
                            node.samples.as_raw(),
                            active.render_pass,
                            samples.as_raw()
                        ),
                    ));
                }
            }
            state.pipeline = Some((pipeline_raw, node));
            Ok(())
        })
    }
}
