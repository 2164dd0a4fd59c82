//! Integration test: SPIR-V reflection and the interface checks between
//! pipeline stages, vertex input, attachments, and the pipeline layout.

mod common;

use ash::vk;
use naga::ShaderStage;
use vklayer_core::{DiagnosticCode, LayerConfig, ReportFlags, ValidationError};
use vklayer_tracker::format::{numeric_class, NumericClass};
use vklayer_tracker::spirv::{self, ExecutionModel, SpirvType};
use vklayer_tracker::{
    DescriptorSetLayoutBinding, DescriptorSetLayoutCreateInfo, GraphicsPipelineCreateInfo,
    PipelineLayoutCreateInfo, VertexInputState,
};

use common::{assert_last, compile_wgsl_to_spirv, expect_error, Scene, BASIC_WGSL};

const TWO_VARYINGS_VS: &str = r#"
struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) color: vec4<f32>,
    @location(1) uv: vec2<f32>,
};

@vertex
fn vs_main() -> VsOut {
    var out: VsOut;
    out.pos = vec4<f32>(0.0, 0.0, 0.0, 1.0);
    out.color = vec4<f32>(1.0);
    out.uv = vec2<f32>(0.5);
    return out;
}
"#;

const VEC3_FS: &str = r#"
@fragment
fn fs_main(@location(0) color: vec3<f32>) -> @location(0) vec4<f32> {
    return vec4<f32>(color, 1.0);
}
"#;

const TWO_INPUTS_FS: &str = r#"
@fragment
fn fs_main(@location(0) color: vec4<f32>, @location(1) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return color * uv.x;
}
"#;

const ATTRIBUTE_VS: &str = r#"
struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) color: vec4<f32>,
};

@vertex
fn vs_main(@location(0) position: vec4<f32>) -> VsOut {
    var out: VsOut;
    out.pos = position;
    out.color = position;
    return out;
}
"#;

const TWO_OUTPUTS_FS: &str = r#"
struct FsOut {
    @location(0) color: vec4<f32>,
    @location(1) extra: vec4<f32>,
};

@fragment
fn fs_main(@location(0) color: vec4<f32>) -> FsOut {
    var out: FsOut;
    out.color = color;
    out.extra = color;
    return out;
}
"#;

const NO_OUTPUT_FS: &str = r#"
@fragment
fn fs_main(@location(0) color: vec4<f32>) {
}
"#;

const UINT_OUTPUT_FS: &str = r#"
@fragment
fn fs_main(@location(0) color: vec4<f32>) -> @location(0) vec4<u32> {
    return vec4<u32>(color);
}
"#;

const UNIFORM_FS: &str = r#"
@group(0) @binding(0) var<uniform> tint: vec4<f32>;

@fragment
fn fs_main(@location(0) color: vec4<f32>) -> @location(0) vec4<f32> {
    return color * tint;
}
"#;

fn create(
    scene: &Scene,
    info: GraphicsPipelineCreateInfo,
) -> Result<Vec<vk::Pipeline>, ValidationError> {
    scene
        .ctx
        .create_graphics_pipelines(vk::PipelineCache::null(), &[info])
}

/// Pipeline info with the scene's shaders swapped for the given sources.
fn info_with(scene: &Scene, vs: Option<&str>, fs: Option<&str>) -> GraphicsPipelineCreateInfo {
    let mut info = scene.pipeline_info();
    if let Some(source) = vs {
        info.stages[0].module = scene.shader(source, ShaderStage::Vertex, "vs_main");
    }
    if let Some(source) = fs {
        info.stages[1].module = scene.shader(source, ShaderStage::Fragment, "fs_main");
    }
    info
}

fn vertex_input(format: vk::Format) -> VertexInputState {
    VertexInputState {
        bindings: vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: 16,
            input_rate: vk::VertexInputRate::VERTEX,
        }],
        attributes: vec![vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format,
            offset: 0,
        }],
    }
}

#[test]
fn test_reflect_basic_module() {
    let vs = spirv::parse(&compile_wgsl_to_spirv(
        BASIC_WGSL,
        ShaderStage::Vertex,
        "vs_main",
    ))
    .unwrap();
    let entry = vs.entry_point("vs_main", ExecutionModel::Vertex).unwrap();
    // Built-in position and vertex index are not location-assigned.
    assert!(entry.inputs.is_empty());
    assert_eq!(entry.outputs.len(), 1);
    assert_eq!(entry.outputs[0].location, 0);
    assert_eq!(entry.outputs[0].ty.to_string(), "vec4 of float32");
    assert!(vs.entry_point("vs_main", ExecutionModel::Fragment).is_none());

    let fs = spirv::parse(&compile_wgsl_to_spirv(
        UNIFORM_FS,
        ShaderStage::Fragment,
        "fs_main",
    ))
    .unwrap();
    assert_eq!(fs.descriptor_slots.len(), 1);
    assert_eq!((fs.descriptor_slots[0].set, fs.descriptor_slots[0].binding), (0, 0));
    assert!(matches!(fs.descriptor_slots[0].ty, SpirvType::Struct(_)));
}

#[test]
fn test_big_endian_module_reflects_like_little_endian() {
    let little = compile_wgsl_to_spirv(BASIC_WGSL, ShaderStage::Vertex, "vs_main");
    let big: Vec<u8> = little
        .chunks_exact(4)
        .flat_map(|word| [word[3], word[2], word[1], word[0]])
        .collect();

    let (words, version) = spirv::validate_header(&big).unwrap();
    assert_eq!(words[0], spirv::MAGIC);
    assert_eq!(version, (1, 0));
    assert_eq!(spirv::parse(&big).unwrap(), spirv::parse(&little).unwrap());

    let scene = Scene::new();
    scene.ctx.create_shader_module(&big).unwrap();
    assert_eq!(scene.sink.error_count(), 0);
}

#[test]
fn test_reject_non_spirv() {
    let scene = Scene::new();
    let message = expect_error(
        scene.ctx.create_shader_module(&[0u8; 24]),
        DiagnosticCode::ShaderNotSpirv,
    );
    assert_eq!(message, "Shader is not SPIR-V: bad magic number 0x00000000");

    let message = expect_error(
        scene.ctx.create_shader_module(b"not spirv"),
        DiagnosticCode::ShaderNotSpirv,
    );
    assert!(message.contains("not a whole number of words"));
}

#[test]
fn test_missing_entry_point() {
    let scene = Scene::new();
    let mut info = scene.pipeline_info();
    info.stages[0].entry_point = "main".to_string();
    let message = expect_error(create(&scene, info), DiagnosticCode::MissingEntryPoint);
    assert!(message.starts_with("No entrypoint found named `main` for stage VERTEX"));

    // A vertex entry point does not satisfy the fragment stage.
    let mut info = scene.pipeline_info();
    info.stages[1].module = scene.vs;
    info.stages[1].entry_point = "vs_main".to_string();
    expect_error(create(&scene, info), DiagnosticCode::MissingEntryPoint);
}

#[test]
fn test_interface_checks_can_be_disabled() {
    let mut config = LayerConfig::default();
    config.checks.shader_interface = false;
    let scene = Scene::with_config(config);

    let mut info = info_with(&scene, None, Some(UINT_OUTPUT_FS));
    info.stages[0].entry_point = "main".to_string();
    scene.pipeline(&info);
    assert_eq!(scene.sink.error_count(), 0);
}

#[test]
fn test_vertex_output_not_consumed() {
    let scene = Scene::new();
    let info = info_with(&scene, Some(TWO_VARYINGS_VS), None);
    scene.pipeline(&info);
    assert_last(
        &scene.sink,
        ReportFlags::WARN,
        "VS writes to output location 1 which is not consumed by fragment shader",
    );
    assert_eq!(scene.sink.error_count(), 0);
}

#[test]
fn test_fragment_input_not_produced() {
    let scene = Scene::new();
    let info = info_with(&scene, None, Some(TWO_INPUTS_FS));
    let message = expect_error(create(&scene, info), DiagnosticCode::InputNotProduced);
    assert_eq!(
        message,
        "FS consumes input location 1 which is not written by vertex shader"
    );

    // Both sides agree once the vertex shader writes the second varying.
    let info = info_with(&scene, Some(TWO_VARYINGS_VS), Some(TWO_INPUTS_FS));
    scene.pipeline(&info);
}

#[test]
fn test_varying_type_mismatch() {
    let scene = Scene::new();
    let info = info_with(&scene, None, Some(VEC3_FS));
    let message = expect_error(create(&scene, info), DiagnosticCode::InterfaceTypeMismatch);
    assert_eq!(
        message,
        "Type mismatch on location 0: 'vec4 of float32' vs 'vec3 of float32'"
    );
}

#[test]
fn test_vertex_attributes() {
    let scene = Scene::new();

    // Attribute with no matching VS input.
    let mut info = scene.pipeline_info();
    info.vertex_input = Some(vertex_input(vk::Format::R32G32B32A32_SFLOAT));
    scene.pipeline(&info);
    assert_last(
        &scene.sink,
        ReportFlags::WARN,
        "Vertex attribute at location 0 not consumed by VS",
    );

    // VS input with no attribute.
    let info = info_with(&scene, Some(ATTRIBUTE_VS), None);
    let message = expect_error(create(&scene, info.clone()), DiagnosticCode::AttributeNotProvided);
    assert_eq!(message, "VS consumes input at location 0 but not provided");

    let mut mismatched = info.clone();
    mismatched.vertex_input = Some(vertex_input(vk::Format::R32G32B32A32_UINT));
    let message = expect_error(
        create(&scene, mismatched),
        DiagnosticCode::AttributeTypeMismatch,
    );
    assert_eq!(
        message,
        "Attribute type of `R32G32B32A32_UINT` at location 0 does not match VS input type of `vec4 of float32`"
    );

    let mut matched = info;
    matched.vertex_input = Some(vertex_input(vk::Format::R32G32B32A32_SFLOAT));
    scene.pipeline(&matched);
}

#[test]
fn test_fragment_outputs() {
    let scene = Scene::new();

    let info = info_with(&scene, None, Some(TWO_OUTPUTS_FS));
    scene.pipeline(&info);
    assert_last(
        &scene.sink,
        ReportFlags::WARN,
        "FS writes to output location 1 with no matching attachment",
    );

    let info = info_with(&scene, None, Some(NO_OUTPUT_FS));
    let message = expect_error(create(&scene, info), DiagnosticCode::AttachmentNotWritten);
    assert_eq!(message, "Attachment 0 not written by FS");

    let info = info_with(&scene, None, Some(UINT_OUTPUT_FS));
    let message = expect_error(
        create(&scene, info),
        DiagnosticCode::FragmentOutputTypeMismatch,
    );
    assert_eq!(
        message,
        "Attachment 0 of type `R8G8B8A8_UNORM` does not match FS output type of `vec4 of uint32`"
    );
}

#[test]
fn test_integer_attachment_accepts_integer_output() {
    let scene = Scene::with_target(vk::Format::R8G8B8A8_UINT, vk::SampleCountFlags::TYPE_1);
    let info = info_with(&scene, None, Some(UINT_OUTPUT_FS));
    scene.pipeline(&info);
    assert_eq!(scene.sink.error_count(), 0);
}

#[test]
fn test_packed_integer_attachment_accepts_integer_output() {
    let scene = Scene::with_target(
        vk::Format::A2B10G10R10_UINT_PACK32,
        vk::SampleCountFlags::TYPE_1,
    );
    let info = info_with(&scene, None, Some(UINT_OUTPUT_FS));
    scene.pipeline(&info);
    assert_eq!(scene.sink.error_count(), 0);
}

#[test]
fn test_format_numeric_classes() {
    let cases = [
        (vk::Format::R8G8B8A8_UINT, Some(NumericClass::Uint)),
        (vk::Format::A2R10G10B10_UINT_PACK32, Some(NumericClass::Uint)),
        (vk::Format::R64G64B64A64_UINT, Some(NumericClass::Uint)),
        (vk::Format::R16G16_SINT, Some(NumericClass::Sint)),
        (vk::Format::A8B8G8R8_SINT_PACK32, Some(NumericClass::Sint)),
        (vk::Format::R8G8B8A8_SRGB, Some(NumericClass::Float)),
        (vk::Format::R16_SSCALED, Some(NumericClass::Float)),
        (vk::Format::B10G11R11_UFLOAT_PACK32, Some(NumericClass::Float)),
        (vk::Format::BC7_SRGB_BLOCK, Some(NumericClass::Float)),
        (vk::Format::ASTC_4X4_SFLOAT_BLOCK, Some(NumericClass::Float)),
        (vk::Format::G8_B8R8_2PLANE_420_UNORM, Some(NumericClass::Float)),
        (vk::Format::UNDEFINED, None),
        (vk::Format::S8_UINT, None),
        (vk::Format::D24_UNORM_S8_UINT, None),
        (vk::Format::from_raw(i32::MAX), None),
    ];
    for (format, expected) in cases {
        assert_eq!(numeric_class(format), expected, "{:?}", format);
    }
}

#[test]
fn test_descriptor_slot_in_layout() {
    let scene = Scene::new();
    let info = info_with(&scene, None, Some(UNIFORM_FS));
    let message = expect_error(
        create(&scene, info.clone()),
        DiagnosticCode::DescriptorNotInLayout,
    );
    assert!(message.starts_with("Shader uses descriptor slot 0.0 (used as type `struct of"));
    assert!(message.ends_with("but not declared in pipeline layout"));

    let set_layout = scene
        .ctx
        .create_descriptor_set_layout(&DescriptorSetLayoutCreateInfo {
            bindings: vec![DescriptorSetLayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                immutable_samplers: Vec::new(),
            }],
            ..Default::default()
        })
        .unwrap();
    let layout = scene
        .ctx
        .create_pipeline_layout(&PipelineLayoutCreateInfo {
            set_layouts: vec![set_layout],
            ..Default::default()
        })
        .unwrap();
    let mut info = info;
    info.layout = layout;
    scene.pipeline(&info);
}

#[test]
fn test_destroyed_module_rejected() {
    let scene = Scene::new();
    let info = scene.pipeline_info();
    scene.ctx.destroy_shader_module(scene.fs).unwrap();
    let message = expect_error(create(&scene, info), DiagnosticCode::InvalidObject);
    assert!(message.starts_with("Invalid VkShaderModule Object"));
}
