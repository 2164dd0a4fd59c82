//! Integration test: image creation limits, image views, samplers, and
//! transfer commands.

mod common;

use ash::vk;
use ash::vk::Handle;
use vklayer_core::{DiagnosticCode, LayerConfig};
use vklayer_tracker::{ImageCreateInfo, ImageViewCreateInfo, MemoryAllocateInfo, ValidationContext};

use common::{
    begin_render_pass, color_target, context, context_with, expect_error, recording,
};

fn image(ctx: &ValidationContext, info: ImageCreateInfo) -> vk::Image {
    ctx.create_image(&info).unwrap()
}

fn extent(width: u32, height: u32, depth: u32) -> vk::Extent3D {
    vk::Extent3D {
        width,
        height,
        depth,
    }
}

fn view_info(image: vk::Image, aspect_mask: vk::ImageAspectFlags) -> ImageViewCreateInfo {
    let mut info = ImageViewCreateInfo {
        image,
        ..Default::default()
    };
    info.subresource_range.aspect_mask = aspect_mask;
    info
}

#[test]
fn test_zero_extent_rejected() {
    let (ctx, _sink) = context();
    expect_error(
        ctx.create_image(&ImageCreateInfo {
            extent: extent(0, 16, 1),
            ..Default::default()
        }),
        DiagnosticCode::InvalidImageCreateInfo,
    );
    expect_error(
        ctx.create_image(&ImageCreateInfo {
            mip_levels: 0,
            ..Default::default()
        }),
        DiagnosticCode::InvalidImageCreateInfo,
    );
}

#[test]
fn test_image_limits() {
    let (ctx, _sink) = context();

    let message = expect_error(
        ctx.create_image(&ImageCreateInfo {
            format: vk::Format::B8G8R8A8_UNORM,
            extent: extent(65536, 32, 1),
            tiling: vk::ImageTiling::LINEAR,
            ..Default::default()
        }),
        DiagnosticCode::ImageExtentLimit,
    );
    assert!(message.starts_with("CreateImage extents exceed allowable limits for format"));

    let message = expect_error(
        ctx.create_image(&ImageCreateInfo {
            extent: extent(64, 64, 1),
            mip_levels: 8,
            ..Default::default()
        }),
        DiagnosticCode::InvalidImageCreateInfo,
    );
    assert!(message.contains("exceeds the 7 levels possible"));

    let message = expect_error(
        ctx.create_image(&ImageCreateInfo {
            array_layers: 4096,
            ..Default::default()
        }),
        DiagnosticCode::ImageLayerLimit,
    );
    assert_eq!(
        message,
        "CreateImage arrayLayers=4096 exceeds allowable maximum supported by format of 2048"
    );

    let message = expect_error(
        ctx.create_image(&ImageCreateInfo {
            format: vk::Format::R32G32B32A32_SFLOAT,
            extent: extent(16384, 16384, 1),
            ..Default::default()
        }),
        DiagnosticCode::ImageResourceSizeLimit,
    );
    assert_eq!(
        message,
        "CreateImage resource size exceeds allowable maximum Image resource size = 0x100000000, maximum resource size = 0x80000000"
    );
}

#[test]
fn test_limits_can_be_disabled() {
    let mut config = LayerConfig::default();
    config.checks.device_limits = false;
    let (ctx, sink) = context_with(config);

    ctx.create_image(&ImageCreateInfo {
        extent: extent(20000, 16, 1),
        array_layers: 4096,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(sink.error_count(), 0);
}

#[test]
fn test_unchecked_extent_saturates_memory_size() {
    let mut config = LayerConfig::default();
    config.checks.device_limits = false;
    let (ctx, sink) = context_with(config);

    let img = image(
        &ctx,
        ImageCreateInfo {
            image_type: vk::ImageType::TYPE_3D,
            extent: extent(u32::MAX, u32::MAX, u32::MAX),
            mip_levels: 40,
            array_layers: 1,
            ..Default::default()
        },
    );
    let requirements = ctx.get_image_memory_requirements(img).unwrap();
    assert_eq!(requirements.size % requirements.alignment, 0);
    assert!(requirements.size > u64::MAX - requirements.alignment);

    let memory = ctx
        .allocate_memory(&MemoryAllocateInfo {
            allocation_size: 1 << 20,
            memory_type_index: 0,
        })
        .unwrap();
    expect_error(
        ctx.bind_image_memory(img, memory, 0),
        DiagnosticCode::BindRangeOutOfBounds,
    );
    assert_eq!(sink.error_count(), 1);
}

#[test]
fn test_image_memory_binding() {
    let (ctx, _sink) = context();
    let img = image(
        &ctx,
        ImageCreateInfo {
            extent: extent(64, 64, 1),
            ..Default::default()
        },
    );
    let requirements = ctx.get_image_memory_requirements(img).unwrap();
    assert_eq!(requirements.size, 64 * 64 * 4);
    assert_eq!(requirements.alignment, 256);

    let memory = ctx
        .allocate_memory(&MemoryAllocateInfo {
            allocation_size: requirements.size,
            memory_type_index: 0,
        })
        .unwrap();
    expect_error(
        ctx.bind_image_memory(img, memory, 256),
        DiagnosticCode::BindRangeOutOfBounds,
    );
    ctx.bind_image_memory(img, memory, 0).unwrap();
    expect_error(
        ctx.bind_image_memory(img, memory, 0),
        DiagnosticCode::RebindObject,
    );

    // Destroying the image drops it from the allocation.
    ctx.destroy_image(img).unwrap();
    ctx.free_memory(memory).unwrap();
}

#[test]
fn test_view_subresource_range() {
    let (ctx, _sink) = context();
    let img = image(&ctx, ImageCreateInfo::default());

    let mut info = view_info(img, vk::ImageAspectFlags::COLOR);
    info.subresource_range.base_mip_level = 1;
    let message = expect_error(
        ctx.create_image_view(&info),
        DiagnosticCode::ImageViewBadMipLevel,
    );
    assert_eq!(
        message,
        format!(
            "vkCreateImageView called with baseMipLevel 1 on image 0x{:x} that only has 1 mip levels.",
            img.as_raw()
        )
    );

    let mut info = view_info(img, vk::ImageAspectFlags::COLOR);
    info.subresource_range.level_count = 0;
    expect_error(
        ctx.create_image_view(&info),
        DiagnosticCode::ImageViewBadMipLevel,
    );

    let mut info = view_info(img, vk::ImageAspectFlags::COLOR);
    info.subresource_range.base_array_layer = 2;
    expect_error(
        ctx.create_image_view(&info),
        DiagnosticCode::ImageViewBadArrayLayer,
    );

    let mut info = view_info(img, vk::ImageAspectFlags::COLOR);
    info.subresource_range.layer_count = 0;
    expect_error(
        ctx.create_image_view(&info),
        DiagnosticCode::ImageViewBadArrayLayer,
    );
}

#[test]
fn test_view_aspect_masks() {
    let (ctx, _sink) = context();
    let color = image(&ctx, ImageCreateInfo::default());
    let depth_stencil = image(
        &ctx,
        ImageCreateInfo {
            format: vk::Format::D24_UNORM_S8_UINT,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        },
    );
    let depth = image(
        &ctx,
        ImageCreateInfo {
            format: vk::Format::D32_SFLOAT,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        },
    );

    let message = expect_error(
        ctx.create_image_view(&view_info(color, vk::ImageAspectFlags::DEPTH)),
        DiagnosticCode::ImageViewBadAspect,
    );
    assert_eq!(
        message,
        "vkCreateImageView: Color image formats must have ONLY the VK_IMAGE_ASPECT_COLOR_BIT set"
    );

    let message = expect_error(
        ctx.create_image_view(&view_info(depth_stencil, vk::ImageAspectFlags::COLOR)),
        DiagnosticCode::ImageViewBadAspect,
    );
    assert!(message.starts_with("vkCreateImageView: Combination depth/stencil image formats"));
    ctx.create_image_view(&view_info(
        depth_stencil,
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    ))
    .unwrap();

    let message = expect_error(
        ctx.create_image_view(&view_info(
            depth,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        )),
        DiagnosticCode::ImageViewBadAspect,
    );
    assert_eq!(
        message,
        "vkCreateImageView: Depth-only image formats can have only the VK_IMAGE_ASPECT_DEPTH_BIT set"
    );
    ctx.create_image_view(&view_info(depth, vk::ImageAspectFlags::DEPTH))
        .unwrap();
}

#[test]
fn test_view_needs_viewable_usage() {
    let (ctx, _sink) = context();
    let img = image(
        &ctx,
        ImageCreateInfo {
            usage: vk::ImageUsageFlags::TRANSFER_SRC,
            ..Default::default()
        },
    );
    let message = expect_error(
        ctx.create_image_view(&view_info(img, vk::ImageAspectFlags::COLOR)),
        DiagnosticCode::ImageViewBadUsage,
    );
    assert!(message.starts_with(&format!(
        "Invalid usage flag for image 0x{:x} used by vkCreateImageView",
        img.as_raw()
    )));
}

#[test]
fn test_view_tracks_its_image() {
    let (ctx, _sink) = context();
    let img = image(&ctx, ImageCreateInfo::default());
    let view = ctx
        .create_image_view(&view_info(img, vk::ImageAspectFlags::COLOR))
        .unwrap();
    assert_eq!(ctx.image_view_image(view), Some(img));

    ctx.destroy_image_view(view).unwrap();
    assert_eq!(ctx.image_view_image(view), None);
}

#[test]
fn test_sampler_anisotropy_limit() {
    let (ctx, _sink) = context();
    let info = vk::SamplerCreateInfo::default()
        .anisotropy_enable(true)
        .max_anisotropy(32.0);
    expect_error(ctx.create_sampler(&info), DiagnosticCode::DeviceLimitExceeded);

    let sampler = ctx
        .create_sampler(&info.max_anisotropy(16.0))
        .unwrap();
    ctx.destroy_sampler(sampler).unwrap();
}

#[test]
fn test_copy_image_mismatches() {
    let (ctx, _sink) = context();
    let cb = recording(&ctx);
    let rgba = image(&ctx, ImageCreateInfo::default());
    let volume = image(
        &ctx,
        ImageCreateInfo {
            image_type: vk::ImageType::TYPE_3D,
            ..Default::default()
        },
    );
    let r16 = image(
        &ctx,
        ImageCreateInfo {
            format: vk::Format::R16_UNORM,
            ..Default::default()
        },
    );
    let r32 = image(
        &ctx,
        ImageCreateInfo {
            format: vk::Format::R32_SFLOAT,
            ..Default::default()
        },
    );
    let d32 = image(
        &ctx,
        ImageCreateInfo {
            format: vk::Format::D32_SFLOAT,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        },
    );
    let layout = vk::ImageLayout::GENERAL;
    let copy = |src, dst| ctx.cmd_copy_image(cb, src, layout, dst, layout, &[]);

    assert_eq!(
        expect_error(copy(rgba, volume), DiagnosticCode::CopyImageMismatch),
        "vkCmdCopyImage called with unmatched source and dest image types."
    );
    assert_eq!(
        expect_error(copy(rgba, r16), DiagnosticCode::CopyImageMismatch),
        "vkCmdCopyImage called with unmatched source and dest image format sizes."
    );
    assert_eq!(
        expect_error(copy(r32, d32), DiagnosticCode::CopyImageMismatch),
        "vkCmdCopyImage called with unmatched source and dest image depth/stencil formats."
    );
    copy(rgba, r32).unwrap();
}

#[test]
fn test_resolve_image_mismatches() {
    let (ctx, _sink) = context();
    let cb = recording(&ctx);
    let single = image(&ctx, ImageCreateInfo::default());
    let multi = image(
        &ctx,
        ImageCreateInfo {
            samples: vk::SampleCountFlags::TYPE_4,
            ..Default::default()
        },
    );
    let multi_r32 = image(
        &ctx,
        ImageCreateInfo {
            format: vk::Format::R32_SFLOAT,
            samples: vk::SampleCountFlags::TYPE_4,
            ..Default::default()
        },
    );
    let layout = vk::ImageLayout::GENERAL;
    let resolve = |src, dst| ctx.cmd_resolve_image(cb, src, layout, dst, layout, &[]);

    assert_eq!(
        expect_error(resolve(single, single), DiagnosticCode::ResolveImageMismatch),
        "vkCmdResolveImage called with source sample count less than 2."
    );
    assert_eq!(
        expect_error(resolve(multi, multi), DiagnosticCode::ResolveImageMismatch),
        "vkCmdResolveImage called with dest sample count greater than 1."
    );
    assert_eq!(
        expect_error(resolve(multi_r32, single), DiagnosticCode::ResolveImageMismatch),
        "vkCmdResolveImage called with unmatched source and dest formats."
    );
    resolve(multi, single).unwrap();
}

#[test]
fn test_clear_image_format_class() {
    let (ctx, _sink) = context();
    let cb = recording(&ctx);
    let color = image(&ctx, ImageCreateInfo::default());
    let depth = image(
        &ctx,
        ImageCreateInfo {
            format: vk::Format::D32_SFLOAT,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        },
    );
    let color_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };
    let depth_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::DEPTH,
        ..color_range
    };
    let layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
    let clear_color = vk::ClearColorValue::default();
    let clear_depth = vk::ClearDepthStencilValue {
        depth: 1.0,
        stencil: 0,
    };

    expect_error(
        ctx.cmd_clear_color_image(cb, depth, layout, &clear_color, &[depth_range]),
        DiagnosticCode::ClearImageFormatMismatch,
    );
    expect_error(
        ctx.cmd_clear_depth_stencil_image(cb, color, layout, &clear_depth, &[color_range]),
        DiagnosticCode::ClearImageFormatMismatch,
    );
    ctx.cmd_clear_color_image(cb, color, layout, &clear_color, &[color_range])
        .unwrap();
    ctx.cmd_clear_depth_stencil_image(cb, depth, layout, &clear_depth, &[depth_range])
        .unwrap();
}

#[test]
fn test_transfer_inside_render_pass() {
    let (ctx, _sink) = context();
    let (render_pass, framebuffer) =
        color_target(&ctx, vk::Format::R8G8B8A8_UNORM, vk::SampleCountFlags::TYPE_1);
    let cb = recording(&ctx);
    let src = image(&ctx, ImageCreateInfo::default());
    let dst = image(&ctx, ImageCreateInfo::default());
    begin_render_pass(&ctx, cb, render_pass, framebuffer);

    let message = expect_error(
        ctx.cmd_copy_image(
            cb,
            src,
            vk::ImageLayout::GENERAL,
            dst,
            vk::ImageLayout::GENERAL,
            &[],
        ),
        DiagnosticCode::InsideRenderPass,
    );
    assert_eq!(
        message,
        "vkCmdCopyImage: It is invalid to issue this call inside an active render pass."
    );
}
