//! Images, image views, samplers, and the transfer commands that operate on
//! whole images.

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;
use tracing::debug;
use vklayer_core::{DiagnosticCode, ObjectType, ValidationError};

use crate::context::ValidationContext;
use crate::format;
use crate::memory::{align_up, MemoryBinding};

const IMAGE_ALIGNMENT: u64 = 256;
const MAX_SAMPLER_ANISOTROPY: f32 = 16.0;

#[derive(Debug, Clone)]
pub struct ImageCreateInfo {
    pub flags: vk::ImageCreateFlags,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
}

impl Default for ImageCreateInfo {
    fn default() -> Self {
        Self {
            flags: vk::ImageCreateFlags::empty(),
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageViewCreateInfo {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    /// `UNDEFINED` means the image's own format.
    pub format: vk::Format,
    pub subresource_range: vk::ImageSubresourceRange,
}

impl Default for ImageViewCreateInfo {
    fn default() -> Self {
        Self {
            image: vk::Image::null(),
            view_type: vk::ImageViewType::TYPE_2D,
            format: vk::Format::UNDEFINED,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ImageNode {
    pub info: ImageCreateInfo,
    pub binding: Option<MemoryBinding>,
}

#[derive(Debug, Clone)]
pub(crate) struct ImageViewNode {
    pub image: u64,
}

#[derive(Default)]
pub(crate) struct ImageTracker {
    pub images: DashMap<u64, ImageNode>,
    pub views: DashMap<u64, ImageViewNode>,
}

/// Bytes of the base level across all layers and samples.
fn base_level_size(info: &ImageCreateInfo) -> u64 {
    let texel = u64::from(format::texel_size(info.format).unwrap_or(4));
    texel
        .saturating_mul(u64::from(info.extent.width))
        .saturating_mul(u64::from(info.extent.height))
        .saturating_mul(u64::from(info.extent.depth))
        .saturating_mul(u64::from(info.array_layers))
        .saturating_mul(u64::from(info.samples.as_raw().max(1)))
}

/// Bytes of the whole mip chain.
fn mip_chain_size(info: &ImageCreateInfo) -> u64 {
    let texel = u64::from(format::texel_size(info.format).unwrap_or(4));
    // Levels from 32 on are all 1x1x1.
    let shifted = info.mip_levels.min(u32::BITS);
    let per_layer = (0..shifted)
        .map(|level| {
            let dim = |d: u32| u64::from((d >> level).max(1));
            dim(info.extent.width)
                .saturating_mul(dim(info.extent.height))
                .saturating_mul(dim(info.extent.depth))
        })
        .fold(u64::from(info.mip_levels - shifted), u64::saturating_add);
    texel
        .saturating_mul(per_layer)
        .saturating_mul(u64::from(info.array_layers))
        .saturating_mul(u64::from(info.samples.as_raw().max(1)))
}

fn aspect_error(format: vk::Format, aspect: vk::ImageAspectFlags) -> Option<&'static str> {
    let depth = format::has_depth(format);
    let stencil = format::has_stencil(format);
    let depth_stencil = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;
    match (depth, stencil) {
        (true, true) => (aspect.is_empty() || !depth_stencil.contains(aspect)).then_some(
            "vkCreateImageView: Combination depth/stencil image formats can have only the VK_IMAGE_ASPECT_DEPTH_BIT and VK_IMAGE_ASPECT_STENCIL_BIT set",
        ),
        (true, false) => {
            if !aspect.contains(vk::ImageAspectFlags::DEPTH) {
                Some("vkCreateImageView: Depth-only image formats must have the VK_IMAGE_ASPECT_DEPTH_BIT set")
            } else if aspect != vk::ImageAspectFlags::DEPTH {
                Some("vkCreateImageView: Depth-only image formats can have only the VK_IMAGE_ASPECT_DEPTH_BIT set")
            } else {
                None
            }
        }
        (false, true) => {
            if !aspect.contains(vk::ImageAspectFlags::STENCIL) {
                Some("vkCreateImageView: Stencil-only image formats must have the VK_IMAGE_ASPECT_STENCIL_BIT set")
            } else if aspect != vk::ImageAspectFlags::STENCIL {
                Some("vkCreateImageView: Stencil-only image formats can have only the VK_IMAGE_ASPECT_STENCIL_BIT set")
            } else {
                None
            }
        }
        (false, false) => (aspect != vk::ImageAspectFlags::COLOR)
            .then_some("vkCreateImageView: Color image formats must have ONLY the VK_IMAGE_ASPECT_COLOR_BIT set"),
    }
}

impl ValidationContext {
    // ── Images ──────────────────────────────────────────────────

    pub fn create_image(&self, info: &ImageCreateInfo) -> Result<vk::Image, ValidationError> {
        const LOCATION: &str = "vkCreateImage";
        let device = self.device().as_raw();
        let fail = |code, message: String| {
            Err(self.error(code, ObjectType::Device, device, LOCATION, message))
        };
        let vk::Extent3D {
            width,
            height,
            depth,
        } = info.extent;

        if width == 0 || height == 0 || depth == 0 || info.mip_levels == 0 || info.array_layers == 0 {
            return fail(
                DiagnosticCode::InvalidImageCreateInfo,
                format!(
                    "CreateImage: extent {}x{}x{}, mipLevels {} and arrayLayers {} must all be non-zero",
                    width, height, depth, info.mip_levels, info.array_layers
                ),
            );
        }

        if self.config().checks.device_limits {
            let limits = &self.config().device.limits;
            let (max, exceeded) = match info.image_type {
                vk::ImageType::TYPE_1D => (
                    limits.max_image_dimension_1d,
                    width > limits.max_image_dimension_1d,
                ),
                vk::ImageType::TYPE_3D => (
                    limits.max_image_dimension_3d,
                    width.max(height).max(depth) > limits.max_image_dimension_3d,
                ),
                _ => (
                    limits.max_image_dimension_2d,
                    width.max(height) > limits.max_image_dimension_2d,
                ),
            };
            if exceeded {
                return fail(
                    DiagnosticCode::ImageExtentLimit,
                    format!(
                        "CreateImage extents exceed allowable limits for format: {}x{}x{} requested, maximum dimension is {}",
                        width, height, depth, max
                    ),
                );
            }

            let largest = width.max(height).max(depth);
            let max_levels = 32 - largest.leading_zeros();
            if info.mip_levels > max_levels {
                return fail(
                    DiagnosticCode::InvalidImageCreateInfo,
                    format!(
                        "CreateImage mipLevels={} exceeds the {} levels possible for a {}x{}x{} image",
                        info.mip_levels, max_levels, width, height, depth
                    ),
                );
            }

            if info.array_layers > limits.max_image_array_layers {
                return fail(
                    DiagnosticCode::ImageLayerLimit,
                    format!(
                        "CreateImage arrayLayers={} exceeds allowable maximum supported by format of {}",
                        info.array_layers, limits.max_image_array_layers
                    ),
                );
            }

            let size = base_level_size(info);
            if size > limits.max_resource_size {
                return fail(
                    DiagnosticCode::ImageResourceSizeLimit,
                    format!(
                        "CreateImage resource size exceeds allowable maximum Image resource size = 0x{:x}, maximum resource size = 0x{:x}",
                        size, limits.max_resource_size
                    ),
                );
            }
        }

        let image: vk::Image = self.create_handle(ObjectType::Image);
        self.images.images.insert(
            image.as_raw(),
            ImageNode {
                info: info.clone(),
                binding: None,
            },
        );
        debug!(
            image = format_args!("0x{:x}", image.as_raw()),
            format = ?info.format,
            width,
            height,
            depth,
            "image created"
        );
        Ok(image)
    }

    pub fn destroy_image(&self, image: vk::Image) -> Result<(), ValidationError> {
        if image == vk::Image::null() {
            return Ok(());
        }
        let raw = self.check_handle(image, ObjectType::Image, "vkDestroyImage")?;
        if let Some((_, node)) = self.images.images.remove(&raw) {
            self.unbind_resource(raw, node.binding);
        }
        self.retire_handle(raw, ObjectType::Image);
        Ok(())
    }

    pub fn get_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> Result<vk::MemoryRequirements, ValidationError> {
        let node = self.lookup(
            &self.images.images,
            image,
            ObjectType::Image,
            "vkGetImageMemoryRequirements",
        )?;
        let size = mip_chain_size(&node.info);
        Ok(vk::MemoryRequirements {
            size: align_up(size, IMAGE_ALIGNMENT),
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits: self.config().memory_type_bits(),
        })
    }

    pub fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkBindImageMemory";
        let raw = self.check_handle(image, ObjectType::Image, LOCATION)?;
        let memory_raw = self.check_handle(memory, ObjectType::DeviceMemory, LOCATION)?;
        let outcome = match self.images.images.get_mut(&raw) {
            None => Err((
                DiagnosticCode::InvalidObject,
                format!("Invalid VkImage Object 0x{:x}", raw),
            )),
            Some(mut node) => {
                let size = mip_chain_size(&node.info);
                self.attach_resource(
                    ObjectType::Image,
                    raw,
                    memory_raw,
                    offset,
                    size,
                    &mut node.binding,
                    LOCATION,
                )
            }
        };
        self.finish_bind(ObjectType::Image, raw, memory_raw, offset, outcome, LOCATION)
    }

    // ── Image views ─────────────────────────────────────────────

    pub fn create_image_view(
        &self,
        info: &ImageViewCreateInfo,
    ) -> Result<vk::ImageView, ValidationError> {
        const LOCATION: &str = "vkCreateImageView";
        let image = self.lookup(&self.images.images, info.image, ObjectType::Image, LOCATION)?;
        let image_raw = info.image.as_raw();
        let range = &info.subresource_range;
        let fail = |code, message: String| {
            Err(self.error(code, ObjectType::Image, image_raw, LOCATION, message))
        };

        if range.base_mip_level >= image.info.mip_levels {
            return fail(
                DiagnosticCode::ImageViewBadMipLevel,
                format!(
                    "vkCreateImageView called with baseMipLevel {} on image 0x{:x} that only has {} mip levels.",
                    range.base_mip_level, image_raw, image.info.mip_levels
                ),
            );
        }
        if range.level_count == 0 {
            return fail(
                DiagnosticCode::ImageViewBadMipLevel,
                "vkCreateImageView called with 0 in pCreateInfo->subresourceRange.levelCount."
                    .to_string(),
            );
        }

        let view_format = if info.format == vk::Format::UNDEFINED {
            image.info.format
        } else {
            info.format
        };
        if let Some(message) = aspect_error(view_format, range.aspect_mask) {
            return fail(DiagnosticCode::ImageViewBadAspect, message.to_string());
        }

        if range.base_array_layer >= image.info.array_layers {
            return fail(
                DiagnosticCode::ImageViewBadArrayLayer,
                format!(
                    "vkCreateImageView called with baseArrayLayer {} on image 0x{:x} that only has {} array layers.",
                    range.base_array_layer, image_raw, image.info.array_layers
                ),
            );
        }
        if range.layer_count == 0 {
            return fail(
                DiagnosticCode::ImageViewBadArrayLayer,
                "vkCreateImageView called with 0 in pCreateInfo->subresourceRange.layerCount."
                    .to_string(),
            );
        }

        let viewable = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::STORAGE
            | vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            | vk::ImageUsageFlags::INPUT_ATTACHMENT;
        if !image.info.usage.intersects(viewable) {
            return fail(
                DiagnosticCode::ImageViewBadUsage,
                format!(
                    "Invalid usage flag for image 0x{:x} used by vkCreateImageView. The image needs one of SAMPLED, STORAGE, COLOR_ATTACHMENT, DEPTH_STENCIL_ATTACHMENT or INPUT_ATTACHMENT, it has {:?}",
                    image_raw, image.info.usage
                ),
            );
        }

        let view: vk::ImageView = self.create_handle(ObjectType::ImageView);
        self.images
            .views
            .insert(view.as_raw(), ImageViewNode { image: image_raw });
        Ok(view)
    }

    pub fn destroy_image_view(&self, view: vk::ImageView) -> Result<(), ValidationError> {
        if view == vk::ImageView::null() {
            return Ok(());
        }
        let raw = self.check_handle(view, ObjectType::ImageView, "vkDestroyImageView")?;
        self.images.views.remove(&raw);
        self.retire_handle(raw, ObjectType::ImageView);
        Ok(())
    }

    /// Image a live view was created from.
    pub fn image_view_image(&self, view: vk::ImageView) -> Option<vk::Image> {
        self.images
            .views
            .get(&view.as_raw())
            .map(|node| vk::Image::from_raw(node.image))
    }

    // ── Samplers ────────────────────────────────────────────────

    pub fn create_sampler(
        &self,
        info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, ValidationError> {
        if info.anisotropy_enable == vk::TRUE && info.max_anisotropy > MAX_SAMPLER_ANISOTROPY {
            return Err(self.error(
                DiagnosticCode::DeviceLimitExceeded,
                ObjectType::Device,
                self.device().as_raw(),
                "vkCreateSampler",
                format!(
                    "vkCreateSampler(): maxAnisotropy {} exceeds the device limit of {}",
                    info.max_anisotropy, MAX_SAMPLER_ANISOTROPY
                ),
            ));
        }
        Ok(self.create_handle(ObjectType::Sampler))
    }

    pub fn destroy_sampler(&self, sampler: vk::Sampler) -> Result<(), ValidationError> {
        if sampler == vk::Sampler::null() {
            return Ok(());
        }
        let raw = self.check_handle(sampler, ObjectType::Sampler, "vkDestroySampler")?;
        self.retire_handle(raw, ObjectType::Sampler);
        Ok(())
    }

    // ── Transfer commands ───────────────────────────────────────

    pub fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        _src_layout: vk::ImageLayout,
        dst_image: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::ImageCopy],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdCopyImage";
        self.record(command_buffer, LOCATION, |_, state| {
            self.require_outside_render_pass(state, command_buffer, LOCATION)?;
            let src = self.lookup(&self.images.images, src_image, ObjectType::Image, LOCATION)?;
            let dst = self.lookup(&self.images.images, dst_image, ObjectType::Image, LOCATION)?;
            let fail = |message: &str| {
                Err(self.error(
                    DiagnosticCode::CopyImageMismatch,
                    ObjectType::CommandBuffer,
                    command_buffer.as_raw(),
                    LOCATION,
                    message.to_string(),
                ))
            };

            if src.info.image_type != dst.info.image_type {
                return fail("vkCmdCopyImage called with unmatched source and dest image types.");
            }
            if format::texel_size(src.info.format) != format::texel_size(dst.info.format) {
                return fail("vkCmdCopyImage called with unmatched source and dest image format sizes.");
            }
            if (format::is_depth_or_stencil(src.info.format)
                || format::is_depth_or_stencil(dst.info.format))
                && src.info.format != dst.info.format
            {
                return fail(
                    "vkCmdCopyImage called with unmatched source and dest image depth/stencil formats.",
                );
            }
            Ok(())
        })
    }

    pub fn cmd_resolve_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        _src_layout: vk::ImageLayout,
        dst_image: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::ImageResolve],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdResolveImage";
        self.record(command_buffer, LOCATION, |_, state| {
            self.require_outside_render_pass(state, command_buffer, LOCATION)?;
            let src = self.lookup(&self.images.images, src_image, ObjectType::Image, LOCATION)?;
            let dst = self.lookup(&self.images.images, dst_image, ObjectType::Image, LOCATION)?;
            let fail = |message: &str| {
                Err(self.error(
                    DiagnosticCode::ResolveImageMismatch,
                    ObjectType::CommandBuffer,
                    command_buffer.as_raw(),
                    LOCATION,
                    message.to_string(),
                ))
            };

            if src.info.samples == vk::SampleCountFlags::TYPE_1 {
                return fail("vkCmdResolveImage called with source sample count less than 2.");
            }
            if dst.info.samples != vk::SampleCountFlags::TYPE_1 {
                return fail("vkCmdResolveImage called with dest sample count greater than 1.");
            }
            if src.info.format != dst.info.format {
                return fail("vkCmdResolveImage called with unmatched source and dest formats.");
            }
            if src.info.image_type != dst.info.image_type {
                return fail("vkCmdResolveImage called with unmatched source and dest image types.");
            }
            Ok(())
        })
    }

    pub fn cmd_clear_color_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        _layout: vk::ImageLayout,
        _color: &vk::ClearColorValue,
        _ranges: &[vk::ImageSubresourceRange],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdClearColorImage";
        self.record(command_buffer, LOCATION, |_, state| {
            self.require_outside_render_pass(state, command_buffer, LOCATION)?;
            let node = self.lookup(&self.images.images, image, ObjectType::Image, LOCATION)?;
            if format::is_depth_or_stencil(node.info.format) {
                return Err(self.error(
                    DiagnosticCode::ClearImageFormatMismatch,
                    ObjectType::Image,
                    image.as_raw(),
                    LOCATION,
                    format!(
                        "vkCmdClearColorImage called with depth/stencil image 0x{:x} of format {:?}",
                        image.as_raw(),
                        node.info.format
                    ),
                ));
            }
            Ok(())
        })
    }

    pub fn cmd_clear_depth_stencil_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        _layout: vk::ImageLayout,
        _value: &vk::ClearDepthStencilValue,
        _ranges: &[vk::ImageSubresourceRange],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdClearDepthStencilImage";
        self.record(command_buffer, LOCATION, |_, state| {
            self.require_outside_render_pass(state, command_buffer, LOCATION)?;
            let node = self.lookup(&self.images.images, image, ObjectType::Image, LOCATION)?;
            if !format::is_depth_or_stencil(node.info.format) {
                return Err(self.error(
                    DiagnosticCode::ClearImageFormatMismatch,
                    ObjectType::Image,
                    image.as_raw(),
                    LOCATION,
                    format!(
                        "vkCmdClearDepthStencilImage called with color image 0x{:x} of format {:?}",
                        image.as_raw(),
                        node.info.format
                    ),
                ));
            }
            Ok(())
        })
    }
}
