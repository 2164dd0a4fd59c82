//! Shader modules and the checks between pipeline stages, vertex input,
//! color attachments, and the pipeline layout.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;
use tracing::debug;
use vklayer_core::{DiagnosticCode, ObjectType, ValidationError};

use crate::context::ValidationContext;
use crate::format;
use crate::pipeline::{GraphicsPipelineCreateInfo, PipelineLayoutNode};
use crate::render_pass::RenderPassNode;
use crate::spirv::{self, ExecutionModel, InterfaceVariable, Module, SpirvType};

#[derive(Default)]
pub(crate) struct ShaderTracker {
    pub modules: DashMap<u64, Arc<Module>>,
}

/// A pipeline stage with its module resolved.
pub(crate) struct ResolvedStage {
    pub stage: vk::ShaderStageFlags,
    pub module: Arc<Module>,
    pub module_handle: u64,
    pub entry_point: String,
}

fn execution_model(stage: vk::ShaderStageFlags) -> Option<ExecutionModel> {
    match stage {
        vk::ShaderStageFlags::VERTEX => Some(ExecutionModel::Vertex),
        vk::ShaderStageFlags::TESSELLATION_CONTROL => Some(ExecutionModel::TessellationControl),
        vk::ShaderStageFlags::TESSELLATION_EVALUATION => {
            Some(ExecutionModel::TessellationEvaluation)
        }
        vk::ShaderStageFlags::GEOMETRY => Some(ExecutionModel::Geometry),
        vk::ShaderStageFlags::FRAGMENT => Some(ExecutionModel::Fragment),
        vk::ShaderStageFlags::COMPUTE => Some(ExecutionModel::GLCompute),
        _ => None,
    }
}

/// Walk two location-keyed sides in ascending order.
enum Pairing<'a, L, R> {
    LeftOnly(u32, &'a L),
    RightOnly(u32, &'a R),
    Both(u32, &'a L, &'a R),
}

fn pair_by_location<'a, L, R>(
    left: &'a BTreeMap<u32, L>,
    right: &'a BTreeMap<u32, R>,
) -> Vec<Pairing<'a, L, R>> {
    let mut locations: Vec<u32> = left.keys().chain(right.keys()).copied().collect();
    locations.sort_unstable();
    locations.dedup();
    locations
        .into_iter()
        .filter_map(|loc| match (left.get(&loc), right.get(&loc)) {
            (Some(l), Some(r)) => Some(Pairing::Both(loc, l, r)),
            (Some(l), None) => Some(Pairing::LeftOnly(loc, l)),
            (None, Some(r)) => Some(Pairing::RightOnly(loc, r)),
            (None, None) => None,
        })
        .collect()
}

fn by_location(variables: &[InterfaceVariable]) -> BTreeMap<u32, &SpirvType> {
    variables.iter().map(|v| (v.location, &v.ty)).collect()
}

impl ValidationContext {
    // ── Modules ─────────────────────────────────────────────────

    pub fn create_shader_module(&self, code: &[u8]) -> Result<vk::ShaderModule, ValidationError> {
        const LOCATION: &str = "vkCreateShaderModule";
        let module = spirv::parse(code).map_err(|e| {
            self.error(
                DiagnosticCode::ShaderNotSpirv,
                ObjectType::Device,
                self.device().as_raw(),
                LOCATION,
                format!("Shader is not SPIR-V: {}", e),
            )
        })?;
        let handle: vk::ShaderModule = self.create_handle(ObjectType::ShaderModule);
        debug!(
            module = format_args!("0x{:x}", handle.as_raw()),
            version = ?module.version,
            entry_points = module.entry_points.len(),
            "shader module reflected"
        );
        self.shaders.modules.insert(handle.as_raw(), Arc::new(module));
        Ok(handle)
    }

    pub fn destroy_shader_module(&self, module: vk::ShaderModule) -> Result<(), ValidationError> {
        if module == vk::ShaderModule::null() {
            return Ok(());
        }
        let raw = self.check_handle(module, ObjectType::ShaderModule, "vkDestroyShaderModule")?;
        self.shaders.modules.remove(&raw);
        self.retire_handle(raw, ObjectType::ShaderModule);
        Ok(())
    }

    // ── Interface checks ────────────────────────────────────────

    /// Warnings are reported and checking continues. The first error ends
    /// the check.
    pub(crate) fn validate_pipeline_interfaces(
        &self,
        info: &GraphicsPipelineCreateInfo,
        stages: &[ResolvedStage],
        render_pass: &RenderPassNode,
        layout: &PipelineLayoutNode,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCreateGraphicsPipelines";

        let mut entry_points = Vec::with_capacity(stages.len());
        for stage in stages {
            let entry = execution_model(stage.stage)
                .and_then(|model| stage.module.entry_point(&stage.entry_point, model));
            let Some(entry) = entry else {
                return Err(self.error(
                    DiagnosticCode::MissingEntryPoint,
                    ObjectType::ShaderModule,
                    stage.module_handle,
                    LOCATION,
                    format!(
                        "No entrypoint found named `{}` for stage {:?} in module 0x{:x}",
                        stage.entry_point, stage.stage, stage.module_handle
                    ),
                ));
            };
            entry_points.push((stage.stage, entry));
        }
        let find = |flag: vk::ShaderStageFlags| {
            entry_points
                .iter()
                .find(|(stage, _)| *stage == flag)
                .map(|(_, entry)| *entry)
        };
        let device = self.device().as_raw();
        let warn = |code, message: String| {
            self.warn(code, ObjectType::Device, device, LOCATION, message);
        };
        let fail = |code, message: String| {
            Err(self.error(code, ObjectType::Device, device, LOCATION, message))
        };

        let Some(vertex) = find(vk::ShaderStageFlags::VERTEX) else {
            return Ok(());
        };

        // Vertex attributes against vertex shader inputs.
        let attributes: BTreeMap<u32, vk::Format> = info
            .vertex_input
            .iter()
            .flat_map(|vi| vi.attributes.iter())
            .map(|a| (a.location, a.format))
            .collect();
        let inputs = by_location(&vertex.inputs);
        for pairing in pair_by_location(&attributes, &inputs) {
            match pairing {
                Pairing::LeftOnly(loc, _) => warn(
                    DiagnosticCode::AttributeNotConsumed,
                    format!("Vertex attribute at location {} not consumed by VS", loc),
                ),
                Pairing::RightOnly(loc, _) => {
                    return fail(
                        DiagnosticCode::AttributeNotProvided,
                        format!("VS consumes input at location {} but not provided", loc),
                    );
                }
                Pairing::Both(loc, attr_format, ty) => {
                    let attr_class = format::numeric_class(*attr_format);
                    let input_class = ty.numeric_class();
                    if attr_class.is_some() && input_class.is_some() && attr_class != input_class {
                        return fail(
                            DiagnosticCode::AttributeTypeMismatch,
                            format!(
                                "Attribute type of `{:?}` at location {} does not match VS input type of `{}`",
                                attr_format, loc, ty
                            ),
                        );
                    }
                }
            }
        }

        // Vertex outputs against fragment inputs when nothing sits between them.
        let intermediate = [
            vk::ShaderStageFlags::TESSELLATION_CONTROL,
            vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            vk::ShaderStageFlags::GEOMETRY,
        ]
        .iter()
        .any(|flag| find(*flag).is_some());
        let fragment = find(vk::ShaderStageFlags::FRAGMENT);
        if let (Some(fragment), false) = (fragment, intermediate) {
            let outputs = by_location(&vertex.outputs);
            let inputs = by_location(&fragment.inputs);
            for pairing in pair_by_location(&outputs, &inputs) {
                match pairing {
                    Pairing::LeftOnly(loc, _) => warn(
                        DiagnosticCode::OutputNotConsumed,
                        format!(
                            "VS writes to output location {} which is not consumed by fragment shader",
                            loc
                        ),
                    ),
                    Pairing::RightOnly(loc, _) => {
                        return fail(
                            DiagnosticCode::InputNotProduced,
                            format!(
                                "FS consumes input location {} which is not written by vertex shader",
                                loc
                            ),
                        );
                    }
                    Pairing::Both(loc, produced, consumed) => {
                        if produced != consumed {
                            return fail(
                                DiagnosticCode::InterfaceTypeMismatch,
                                format!(
                                    "Type mismatch on location {}: '{}' vs '{}'",
                                    loc, produced, consumed
                                ),
                            );
                        }
                    }
                }
            }
        }

        // Fragment outputs against the subpass color attachments.
        if let Some(fragment) = fragment {
            let attachments: BTreeMap<u32, vk::Format> = render_pass
                .color_formats(info.subpass)
                .into_iter()
                .enumerate()
                .filter_map(|(i, format)| format.map(|f| (i as u32, f)))
                .collect();
            let outputs = by_location(&fragment.outputs);
            for pairing in pair_by_location(&outputs, &attachments) {
                match pairing {
                    Pairing::LeftOnly(loc, _) => warn(
                        DiagnosticCode::FragmentOutputNotConsumed,
                        format!("FS writes to output location {} with no matching attachment", loc),
                    ),
                    Pairing::RightOnly(loc, _) => {
                        return fail(
                            DiagnosticCode::AttachmentNotWritten,
                            format!("Attachment {} not written by FS", loc),
                        );
                    }
                    Pairing::Both(loc, ty, attachment_format) => {
                        let output_class = ty.numeric_class();
                        let attachment_class = format::numeric_class(*attachment_format);
                        if output_class.is_some()
                            && attachment_class.is_some()
                            && output_class != attachment_class
                        {
                            return fail(
                                DiagnosticCode::FragmentOutputTypeMismatch,
                                format!(
                                    "Attachment {} of type `{:?}` does not match FS output type of `{}`",
                                    loc, attachment_format, ty
                                ),
                            );
                        }
                    }
                }
            }
        }

        // Descriptor slots against the pipeline layout.
        for stage in stages {
            for slot in &stage.module.descriptor_slots {
                let declared = layout
                    .set_layouts
                    .get(slot.set as usize)
                    .is_some_and(|set| set.bindings.contains_key(&slot.binding));
                if !declared {
                    return Err(self.error(
                        DiagnosticCode::DescriptorNotInLayout,
                        ObjectType::ShaderModule,
                        stage.module_handle,
                        LOCATION,
                        format!(
                            "Shader uses descriptor slot {}.{} (used as type `{}`) but not declared in pipeline layout",
                            slot.set, slot.binding, slot.ty
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}
