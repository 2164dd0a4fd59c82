//! Shared fixtures for the tracker integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use ash::vk;
use vklayer_core::{DiagnosticCode, LayerConfig, MessageSink, ReportFlags, ValidationError};
use vklayer_tracker::{
    ColorBlendState, CommandBufferAllocateInfo, CommandBufferBeginInfo, FramebufferCreateInfo,
    GraphicsPipelineCreateInfo, ImageCreateInfo, ImageViewCreateInfo, InputAssemblyState,
    MultisampleState, PipelineLayoutCreateInfo, PipelineShaderStage, RasterizationState,
    RenderPassBeginInfo, RenderPassCreateInfo, SubpassDescription, ValidationContext,
    ViewportState,
};

/// Vertex shader with no vertex inputs feeding one color varying to the
/// fragment shader, which writes color attachment 0.
pub const BASIC_WGSL: &str = r#"
struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) color: vec4<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VsOut {
    var out: VsOut;
    let x = f32(index) - 1.0;
    out.pos = vec4<f32>(x, 0.0, 0.0, 1.0);
    out.color = vec4<f32>(1.0, 0.0, 0.0, 1.0);
    return out;
}

@fragment
fn fs_main(@location(0) color: vec4<f32>) -> @location(0) vec4<f32> {
    return color;
}
"#;

/// Compile WGSL to SPIR-V using naga.
pub fn compile_wgsl_to_spirv(
    wgsl_source: &str,
    stage: naga::ShaderStage,
    entry_point: &str,
) -> Vec<u8> {
    let module = naga::front::wgsl::parse_str(wgsl_source).expect("failed to parse WGSL");

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::empty(),
    )
    .validate(&module)
    .expect("WGSL validation failed");

    let options = naga::back::spv::Options {
        lang_version: (1, 0),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: entry_point.to_string(),
    };

    let mut writer =
        naga::back::spv::Writer::new(&options).expect("failed to create SPIR-V writer");
    let mut words = Vec::new();
    writer
        .write(&module, &info, Some(&pipeline_options), &None, &mut words)
        .expect("failed to generate SPIR-V");
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

pub fn context() -> (ValidationContext, Arc<MessageSink>) {
    context_with(LayerConfig::default())
}

pub fn context_with(config: LayerConfig) -> (ValidationContext, Arc<MessageSink>) {
    let sink = Arc::new(MessageSink::new());
    (ValidationContext::new(config, Arc::clone(&sink)), sink)
}

/// Unwrap an expected rejection and return its message.
#[track_caller]
pub fn expect_error<T: std::fmt::Debug>(
    result: Result<T, ValidationError>,
    code: DiagnosticCode,
) -> String {
    match result {
        Err(e) if e.code == code => e.message,
        other => panic!("expected {:?}, got {:?}", code, other),
    }
}

/// Assert the sink's latest surfaced message.
#[track_caller]
pub fn assert_last(sink: &MessageSink, flags: ReportFlags, needle: &str) {
    let (last_flags, message) = sink.state();
    assert_eq!(last_flags, flags, "latest message: {}", message);
    assert!(
        message.contains(needle),
        "expected `{}` in `{}`",
        needle,
        message
    );
}

pub fn command_pool(ctx: &ValidationContext) -> vk::CommandPool {
    ctx.create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER, 0)
        .unwrap()
}

pub fn command_buffer(
    ctx: &ValidationContext,
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
) -> vk::CommandBuffer {
    ctx.allocate_command_buffers(&CommandBufferAllocateInfo {
        command_pool: pool,
        level,
        command_buffer_count: 1,
    })
    .unwrap()[0]
}

/// A primary command buffer in the Recording state.
pub fn recording(ctx: &ValidationContext) -> vk::CommandBuffer {
    let pool = command_pool(ctx);
    let cb = command_buffer(ctx, pool, vk::CommandBufferLevel::PRIMARY);
    ctx.begin_command_buffer(cb, &CommandBufferBeginInfo::default())
        .unwrap();
    cb
}

pub fn color_attachment(format: vk::Format, samples: vk::SampleCountFlags) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ..Default::default()
    }
}

/// Single-subpass render pass with one color attachment, and a framebuffer
/// for it.
pub fn color_target(
    ctx: &ValidationContext,
    format: vk::Format,
    samples: vk::SampleCountFlags,
) -> (vk::RenderPass, vk::Framebuffer) {
    let render_pass = ctx
        .create_render_pass(&RenderPassCreateInfo {
            attachments: vec![color_attachment(format, samples)],
            subpasses: vec![SubpassDescription {
                color_attachments: vec![vk::AttachmentReference {
                    attachment: 0,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                }],
                ..Default::default()
            }],
        })
        .unwrap();
    let image = ctx
        .create_image(&ImageCreateInfo {
            format,
            extent: vk::Extent3D {
                width: 64,
                height: 64,
                depth: 1,
            },
            samples,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ..Default::default()
        })
        .unwrap();
    let view = ctx
        .create_image_view(&ImageViewCreateInfo {
            image,
            ..Default::default()
        })
        .unwrap();
    let framebuffer = ctx
        .create_framebuffer(&FramebufferCreateInfo {
            render_pass,
            attachments: vec![view],
            width: 64,
            height: 64,
            layers: 1,
        })
        .unwrap();
    (render_pass, framebuffer)
}

pub fn begin_render_pass(
    ctx: &ValidationContext,
    cb: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
) {
    ctx.cmd_begin_render_pass(
        cb,
        &RenderPassBeginInfo {
            render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: 64,
                    height: 64,
                },
            },
        },
        vk::SubpassContents::INLINE,
    )
    .unwrap();
}

/// Everything a graphics pipeline needs, built from [`BASIC_WGSL`].
pub struct Scene {
    pub ctx: ValidationContext,
    pub sink: Arc<MessageSink>,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub layout: vk::PipelineLayout,
    pub vs: vk::ShaderModule,
    pub fs: vk::ShaderModule,
}

impl Scene {
    pub fn new() -> Self {
        Self::with_target(vk::Format::R8G8B8A8_UNORM, vk::SampleCountFlags::TYPE_1)
    }

    pub fn with_target(format: vk::Format, samples: vk::SampleCountFlags) -> Self {
        Self::build(LayerConfig::default(), format, samples)
    }

    pub fn with_config(config: LayerConfig) -> Self {
        Self::build(config, vk::Format::R8G8B8A8_UNORM, vk::SampleCountFlags::TYPE_1)
    }

    fn build(config: LayerConfig, format: vk::Format, samples: vk::SampleCountFlags) -> Self {
        let (ctx, sink) = context_with(config);
        let (render_pass, framebuffer) = color_target(&ctx, format, samples);
        let layout = ctx
            .create_pipeline_layout(&PipelineLayoutCreateInfo::default())
            .unwrap();
        let vs = ctx
            .create_shader_module(&compile_wgsl_to_spirv(
                BASIC_WGSL,
                naga::ShaderStage::Vertex,
                "vs_main",
            ))
            .unwrap();
        let fs = ctx
            .create_shader_module(&compile_wgsl_to_spirv(
                BASIC_WGSL,
                naga::ShaderStage::Fragment,
                "fs_main",
            ))
            .unwrap();
        Self {
            ctx,
            sink,
            render_pass,
            framebuffer,
            layout,
            vs,
            fs,
        }
    }

    pub fn shader(&self, source: &str, stage: naga::ShaderStage, entry_point: &str) -> vk::ShaderModule {
        self.ctx
            .create_shader_module(&compile_wgsl_to_spirv(source, stage, entry_point))
            .unwrap()
    }

    /// Create info for a valid triangle pipeline with static viewport state.
    pub fn pipeline_info(&self) -> GraphicsPipelineCreateInfo {
        let rect = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
        };
        GraphicsPipelineCreateInfo {
            stages: vec![
                PipelineShaderStage {
                    stage: vk::ShaderStageFlags::VERTEX,
                    module: self.vs,
                    entry_point: "vs_main".to_string(),
                },
                PipelineShaderStage {
                    stage: vk::ShaderStageFlags::FRAGMENT,
                    module: self.fs,
                    entry_point: "fs_main".to_string(),
                },
            ],
            input_assembly: Some(InputAssemblyState {
                topology: vk::PrimitiveTopology::TRIANGLE_LIST,
                primitive_restart_enable: false,
            }),
            viewport: Some(ViewportState {
                viewport_count: 1,
                viewports: Some(vec![vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: 64.0,
                    height: 64.0,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }]),
                scissor_count: 1,
                scissors: Some(vec![rect]),
            }),
            rasterization: Some(RasterizationState::default()),
            multisample: Some(MultisampleState::default()),
            color_blend: Some(ColorBlendState {
                attachments: vec![vk::PipelineColorBlendAttachmentState {
                    color_write_mask: vk::ColorComponentFlags::RGBA,
                    ..Default::default()
                }],
                blend_constants: [0.0; 4],
            }),
            layout: self.layout,
            render_pass: self.render_pass,
            subpass: 0,
            ..Default::default()
        }
    }

    pub fn pipeline(&self, info: &GraphicsPipelineCreateInfo) -> vk::Pipeline {
        self.ctx
            .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(info))
            .unwrap()[0]
    }

    /// A primary command buffer recording inside the scene's render pass.
    pub fn recording_in_pass(&self) -> vk::CommandBuffer {
        let cb = recording(&self.ctx);
        begin_render_pass(&self.ctx, cb, self.render_pass, self.framebuffer);
        cb
    }
}
