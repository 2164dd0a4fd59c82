//! Integration test: descriptor set layouts, pools, updates, and binding.

mod common;

use ash::vk;
use ash::vk::Handle;
use vklayer_core::{DiagnosticCode, ReportFlags};
use vklayer_tracker::{
    BufferCreateInfo, BufferViewCreateInfo, CopyDescriptorSet, DescriptorPoolCreateInfo,
    DescriptorSetLayoutBinding, DescriptorSetLayoutCreateInfo, ImageCreateInfo,
    ImageViewCreateInfo, PipelineLayoutCreateInfo, ValidationContext, WriteDescriptorSet,
};

use common::{assert_last, context, expect_error, recording};

fn layout_binding(binding: u32, ty: vk::DescriptorType, count: u32) -> DescriptorSetLayoutBinding {
    DescriptorSetLayoutBinding {
        binding,
        descriptor_type: ty,
        descriptor_count: count,
        stage_flags: vk::ShaderStageFlags::ALL_GRAPHICS,
        immutable_samplers: Vec::new(),
    }
}

/// Binding 0: two uniform buffers. Binding 1: one combined image sampler.
fn set_layout(ctx: &ValidationContext) -> vk::DescriptorSetLayout {
    ctx.create_descriptor_set_layout(&DescriptorSetLayoutCreateInfo {
        flags: vk::DescriptorSetLayoutCreateFlags::empty(),
        bindings: vec![
            layout_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 2),
            layout_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1),
        ],
    })
    .unwrap()
}

fn pool(ctx: &ValidationContext, flags: vk::DescriptorPoolCreateFlags, max_sets: u32) -> vk::DescriptorPool {
    ctx.create_descriptor_pool(&DescriptorPoolCreateInfo {
        flags,
        max_sets,
        pool_sizes: vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 4,
            },
        ],
    })
    .unwrap()
}

fn uniform_buffer(ctx: &ValidationContext) -> vk::Buffer {
    ctx.create_buffer(&BufferCreateInfo {
        size: 256,
        usage: vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER,
        ..Default::default()
    })
    .unwrap()
}

fn buffer_write(set: vk::DescriptorSet, buffer: vk::Buffer, count: u32) -> WriteDescriptorSet {
    WriteDescriptorSet {
        dst_set: set,
        dst_binding: 0,
        descriptor_count: count,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        buffer_info: vec![
            vk::DescriptorBufferInfo {
                buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            };
            count as usize
        ],
        ..Default::default()
    }
}

#[test]
fn test_duplicate_layout_binding() {
    let (ctx, _sink) = context();
    let message = expect_error(
        ctx.create_descriptor_set_layout(&DescriptorSetLayoutCreateInfo {
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            bindings: vec![
                layout_binding(3, vk::DescriptorType::UNIFORM_BUFFER, 1),
                layout_binding(3, vk::DescriptorType::SAMPLER, 1),
            ],
        }),
        DiagnosticCode::DuplicateLayoutBinding,
    );
    assert_eq!(
        message,
        "vkCreateDescriptorSetLayout(): pBindings[1] has duplicated binding number (3)"
    );
}

#[test]
fn test_pool_set_exhaustion() {
    let (ctx, _sink) = context();
    let layout = set_layout(&ctx);
    let pool = pool(&ctx, vk::DescriptorPoolCreateFlags::empty(), 1);

    ctx.allocate_descriptor_sets(pool, &[layout]).unwrap();
    let message = expect_error(
        ctx.allocate_descriptor_sets(pool, &[layout]),
        DiagnosticCode::DescriptorPoolEmpty,
    );
    assert_eq!(
        message,
        format!(
            "Unable to allocate 1 descriptorSets from pool 0x{:x}. This pool only has 0 descriptorSets remaining.",
            pool.as_raw()
        )
    );

    ctx.reset_descriptor_pool(pool).unwrap();
    ctx.allocate_descriptor_sets(pool, &[layout]).unwrap();
}

#[test]
fn test_pool_descriptor_type_exhaustion() {
    let (ctx, _sink) = context();
    let layout = set_layout(&ctx);
    let pool = pool(&ctx, vk::DescriptorPoolCreateFlags::empty(), 8);

    // Three sets need six uniform buffers, the pool holds four.
    let message = expect_error(
        ctx.allocate_descriptor_sets(pool, &[layout, layout, layout]),
        DiagnosticCode::DescriptorPoolEmpty,
    );
    assert_eq!(
        message,
        format!(
            "Unable to allocate 6 descriptors of type VK_DESCRIPTOR_TYPE_UNIFORM_BUFFER from pool 0x{:x}. This pool only has 4 descriptors of this type remaining.",
            pool.as_raw()
        )
    );

    // The failed call allocated nothing.
    let sets = ctx.allocate_descriptor_sets(pool, &[layout, layout]).unwrap();
    assert_eq!(sets.len(), 2);
}

#[test]
fn test_pool_sizes_beyond_u32() {
    let (ctx, _sink) = context();
    let huge = vk::DescriptorPoolSize {
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: u32::MAX,
    };
    let pool = ctx
        .create_descriptor_pool(&DescriptorPoolCreateInfo {
            flags: vk::DescriptorPoolCreateFlags::empty(),
            max_sets: 2,
            pool_sizes: vec![huge, huge],
        })
        .unwrap();
    let layout = ctx
        .create_descriptor_set_layout(&DescriptorSetLayoutCreateInfo {
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            bindings: vec![
                layout_binding(0, vk::DescriptorType::UNIFORM_BUFFER, u32::MAX),
                layout_binding(1, vk::DescriptorType::UNIFORM_BUFFER, u32::MAX),
            ],
        })
        .unwrap();

    // The layout needs exactly what the two pool sizes add up to.
    ctx.allocate_descriptor_sets(pool, &[layout]).unwrap();
    let message = expect_error(
        ctx.allocate_descriptor_sets(pool, &[layout]),
        DiagnosticCode::DescriptorPoolEmpty,
    );
    assert!(message.starts_with(
        "Unable to allocate 8589934590 descriptors of type VK_DESCRIPTOR_TYPE_UNIFORM_BUFFER"
    ));
    assert!(message.ends_with("only has 0 descriptors of this type remaining."));
}

#[test]
fn test_pool_without_requested_type() {
    let (ctx, _sink) = context();
    let pool = ctx
        .create_descriptor_pool(&DescriptorPoolCreateInfo {
            flags: vk::DescriptorPoolCreateFlags::empty(),
            max_sets: 1,
            pool_sizes: vec![vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 1,
            }],
        })
        .unwrap();
    let layout = ctx
        .create_descriptor_set_layout(&DescriptorSetLayoutCreateInfo {
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            bindings: vec![layout_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1)],
        })
        .unwrap();

    let message = expect_error(
        ctx.allocate_descriptor_sets(pool, &[layout]),
        DiagnosticCode::DescriptorPoolEmpty,
    );
    assert!(message.starts_with(
        "Unable to allocate 1 descriptors of type VK_DESCRIPTOR_TYPE_UNIFORM_BUFFER"
    ));
    assert!(message.ends_with("only has 0 descriptors of this type remaining."));
}

#[test]
fn test_free_requires_free_flag() {
    let (ctx, _sink) = context();
    let layout = set_layout(&ctx);
    let fixed = pool(&ctx, vk::DescriptorPoolCreateFlags::empty(), 2);
    let sets = ctx.allocate_descriptor_sets(fixed, &[layout]).unwrap();

    expect_error(
        ctx.free_descriptor_sets(fixed, &sets),
        DiagnosticCode::FreeFromNonFreePool,
    );

    let freeable = pool(&ctx, vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET, 1);
    let sets = ctx.allocate_descriptor_sets(freeable, &[layout]).unwrap();
    ctx.free_descriptor_sets(freeable, &sets).unwrap();
    // Capacity came back.
    ctx.allocate_descriptor_sets(freeable, &[layout]).unwrap();
}

#[test]
fn test_reset_unknown_pool() {
    let (ctx, _sink) = context();
    let bogus = vk::DescriptorPool::from_raw(0xdead);
    let message = expect_error(
        ctx.reset_descriptor_pool(bogus),
        DiagnosticCode::InvalidDescriptorPool,
    );
    assert_eq!(
        message,
        "Unable to find pool node for pool 0xdead specified in vkResetDescriptorPool() call"
    );
}

#[test]
fn test_update_checks_in_order() {
    let (ctx, sink) = context();
    let layout = set_layout(&ctx);
    let pool = pool(&ctx, vk::DescriptorPoolCreateFlags::empty(), 1);
    let set = ctx.allocate_descriptor_sets(pool, &[layout]).unwrap()[0];
    let buffer = uniform_buffer(&ctx);

    let mut missing = buffer_write(set, buffer, 1);
    missing.dst_binding = 7;
    let message = expect_error(
        ctx.update_descriptor_sets(&[missing], &[]),
        DiagnosticCode::UpdateBindingMissing,
    );
    assert_eq!(
        message,
        format!(
            "Descriptor Set 0x{:x} does not have binding to match update binding 7 for update type VK_STRUCTURE_TYPE_WRITE_DESCRIPTOR_SET!",
            set.as_raw()
        )
    );

    // Bounds are checked before the type.
    let mut oversized = buffer_write(set, buffer, 3);
    oversized.descriptor_type = vk::DescriptorType::STORAGE_BUFFER;
    let message = expect_error(
        ctx.update_descriptor_sets(&[oversized], &[]),
        DiagnosticCode::DescriptorUpdateOutOfBounds,
    );
    assert!(message.starts_with(
        "Descriptor update type of VK_STRUCTURE_TYPE_WRITE_DESCRIPTOR_SET is out of bounds for matching binding 0"
    ));

    let mut wrong_type = buffer_write(set, buffer, 1);
    wrong_type.descriptor_type = vk::DescriptorType::STORAGE_BUFFER;
    let message = expect_error(
        ctx.update_descriptor_sets(&[wrong_type], &[]),
        DiagnosticCode::DescriptorTypeMismatch,
    );
    assert!(message.contains(
        "has descriptor type VK_DESCRIPTOR_TYPE_STORAGE_BUFFER that does not match overlapping binding descriptor type of VK_DESCRIPTOR_TYPE_UNIFORM_BUFFER!"
    ));

    ctx.update_descriptor_sets(&[buffer_write(set, buffer, 2)], &[])
        .unwrap();
    assert_eq!(sink.error_count(), 3);
}

#[test]
fn test_update_with_bad_struct_type() {
    let (ctx, _sink) = context();
    let layout = set_layout(&ctx);
    let pool = pool(&ctx, vk::DescriptorPoolCreateFlags::empty(), 1);
    let set = ctx.allocate_descriptor_sets(pool, &[layout]).unwrap()[0];

    let mut write = buffer_write(set, uniform_buffer(&ctx), 1);
    write.s_type = vk::StructureType::COPY_DESCRIPTOR_SET;
    let message = expect_error(
        ctx.update_descriptor_sets(&[write], &[]),
        DiagnosticCode::InvalidUpdateStruct,
    );
    assert_eq!(
        message,
        "Unexpected UPDATE struct of type COPY_DESCRIPTOR_SET in vkUpdateDescriptorSets() struct tree"
    );
}

#[test]
fn test_update_with_destroyed_handles() {
    let (ctx, _sink) = context();
    let layout = set_layout(&ctx);
    let pool = pool(&ctx, vk::DescriptorPoolCreateFlags::empty(), 1);
    let set = ctx.allocate_descriptor_sets(pool, &[layout]).unwrap()[0];

    let sampler = ctx
        .create_sampler(&vk::SamplerCreateInfo::default())
        .unwrap();
    let image = ctx.create_image(&ImageCreateInfo::default()).unwrap();
    let view = ctx
        .create_image_view(&ImageViewCreateInfo {
            image,
            ..Default::default()
        })
        .unwrap();
    let image_write = |sampler: vk::Sampler, image_view: vk::ImageView| WriteDescriptorSet {
        dst_set: set,
        dst_binding: 1,
        descriptor_count: 1,
        descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        image_info: vec![vk::DescriptorImageInfo {
            sampler,
            image_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }],
        ..Default::default()
    };

    ctx.update_descriptor_sets(&[image_write(sampler, view)], &[])
        .unwrap();

    ctx.destroy_sampler(sampler).unwrap();
    let message = expect_error(
        ctx.update_descriptor_sets(&[image_write(sampler, view)], &[]),
        DiagnosticCode::InvalidDescriptorHandle,
    );
    assert_eq!(
        message,
        format!(
            "Attempt to update descriptor with invalid sampler 0x{:x}",
            sampler.as_raw()
        )
    );

    let fresh = ctx
        .create_sampler(&vk::SamplerCreateInfo::default())
        .unwrap();
    ctx.destroy_image_view(view).unwrap();
    let message = expect_error(
        ctx.update_descriptor_sets(&[image_write(fresh, view)], &[]),
        DiagnosticCode::InvalidDescriptorHandle,
    );
    assert!(message.contains("invalid imageView"));
}

#[test]
fn test_texel_buffer_view_of_destroyed_buffer() {
    let (ctx, _sink) = context();
    let layout = ctx
        .create_descriptor_set_layout(&DescriptorSetLayoutCreateInfo {
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            bindings: vec![layout_binding(
                0,
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                1,
            )],
        })
        .unwrap();
    let pool = ctx
        .create_descriptor_pool(&DescriptorPoolCreateInfo {
            flags: vk::DescriptorPoolCreateFlags::empty(),
            max_sets: 1,
            pool_sizes: vec![vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                descriptor_count: 1,
            }],
        })
        .unwrap();
    let set = ctx.allocate_descriptor_sets(pool, &[layout]).unwrap()[0];
    let buffer = uniform_buffer(&ctx);
    let view = ctx
        .create_buffer_view(&BufferViewCreateInfo {
            buffer,
            format: vk::Format::R32_SFLOAT,
            offset: 0,
            range: vk::WHOLE_SIZE,
        })
        .unwrap();
    let write = WriteDescriptorSet {
        dst_set: set,
        dst_binding: 0,
        descriptor_count: 1,
        descriptor_type: vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        texel_buffer_view: vec![view],
        ..Default::default()
    };

    ctx.update_descriptor_sets(std::slice::from_ref(&write), &[])
        .unwrap();
    ctx.destroy_buffer(buffer).unwrap();
    let message = expect_error(
        ctx.update_descriptor_sets(&[write], &[]),
        DiagnosticCode::InvalidDescriptorHandle,
    );
    assert!(message.contains("has been destroyed"));
}

#[test]
fn test_copy_between_sets() {
    let (ctx, _sink) = context();
    let layout = set_layout(&ctx);
    let pool = pool(&ctx, vk::DescriptorPoolCreateFlags::empty(), 2);
    let sets = ctx
        .allocate_descriptor_sets(pool, &[layout, layout])
        .unwrap();

    let copy = CopyDescriptorSet {
        src_set: sets[0],
        dst_set: sets[1],
        descriptor_count: 2,
        ..Default::default()
    };
    ctx.update_descriptor_sets(&[], std::slice::from_ref(&copy))
        .unwrap();

    let mismatched = CopyDescriptorSet {
        dst_binding: 1,
        descriptor_count: 1,
        ..copy.clone()
    };
    expect_error(
        ctx.update_descriptor_sets(&[], &[mismatched]),
        DiagnosticCode::DescriptorTypeMismatch,
    );
    let oversized = CopyDescriptorSet {
        src_array_element: 1,
        ..copy
    };
    expect_error(
        ctx.update_descriptor_sets(&[], &[oversized]),
        DiagnosticCode::DescriptorUpdateOutOfBounds,
    );
}

#[test]
fn test_bind_sets() {
    let (ctx, sink) = context();
    let layout = set_layout(&ctx);
    let dynamic_layout = ctx
        .create_descriptor_set_layout(&DescriptorSetLayoutCreateInfo {
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            bindings: vec![layout_binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                2,
            )],
        })
        .unwrap();
    let pipeline_layout = ctx
        .create_pipeline_layout(&PipelineLayoutCreateInfo {
            set_layouts: vec![layout, dynamic_layout],
            push_constant_ranges: Vec::new(),
        })
        .unwrap();
    let pool = ctx
        .create_descriptor_pool(&DescriptorPoolCreateInfo {
            flags: vk::DescriptorPoolCreateFlags::empty(),
            max_sets: 4,
            pool_sizes: vec![
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 4,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: 2,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                    descriptor_count: 2,
                },
            ],
        })
        .unwrap();
    let sets = ctx
        .allocate_descriptor_sets(pool, &[layout, dynamic_layout])
        .unwrap();
    let cb = recording(&ctx);

    let message = expect_error(
        ctx.cmd_bind_descriptor_sets(
            cb,
            vk::PipelineBindPoint::GRAPHICS,
            pipeline_layout,
            1,
            &sets,
            &[0, 0],
        ),
        DiagnosticCode::DescriptorSetIndexOutOfRange,
    );
    assert!(message.starts_with("descriptorSet #2 being bound is greater than the number of sets (2)"));

    expect_error(
        ctx.cmd_bind_descriptor_sets(
            cb,
            vk::PipelineBindPoint::GRAPHICS,
            pipeline_layout,
            0,
            &sets,
            &[0],
        ),
        DiagnosticCode::InvalidParameter,
    );

    ctx.cmd_bind_descriptor_sets(
        cb,
        vk::PipelineBindPoint::GRAPHICS,
        pipeline_layout,
        0,
        &sets[..1],
        &[],
    )
    .unwrap();
    assert_last(
        &sink,
        ReportFlags::WARN,
        &format!(
            "DS 0x{:x} bound but it was never updated. You may want to either update it or not bind it.",
            sets[0].as_raw()
        ),
    );

    ctx.update_descriptor_sets(&[buffer_write(sets[0], uniform_buffer(&ctx), 2)], &[])
        .unwrap();
    sink.clear_state();
    ctx.cmd_bind_descriptor_sets(
        cb,
        vk::PipelineBindPoint::GRAPHICS,
        pipeline_layout,
        0,
        &sets[..1],
        &[],
    )
    .unwrap();
    assert_eq!(sink.last_flags(), ReportFlags::INFO);
}

#[test]
fn test_too_many_set_layouts() {
    let (ctx, _sink) = context();
    let layout = set_layout(&ctx);
    expect_error(
        ctx.create_pipeline_layout(&PipelineLayoutCreateInfo {
            set_layouts: vec![layout; 9],
            push_constant_ranges: Vec::new(),
        }),
        DiagnosticCode::DeviceLimitExceeded,
    );
}
