//! Format properties needed by the image and shader checks.

use ash::vk;

/// Fundamental numeric type a format or shader variable resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericClass {
    Float,
    Sint,
    Uint,
}

/// Bytes per texel for the uncompressed formats the trackers size.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R4G4_UNORM_PACK8
        | vk::Format::R8_UNORM
        | vk::Format::R8_SNORM
        | vk::Format::R8_USCALED
        | vk::Format::R8_SSCALED
        | vk::Format::R8_UINT
        | vk::Format::R8_SINT
        | vk::Format::R8_SRGB
        | vk::Format::S8_UINT => 1,

        vk::Format::R4G4B4A4_UNORM_PACK16
        | vk::Format::B4G4R4A4_UNORM_PACK16
        | vk::Format::R5G6B5_UNORM_PACK16
        | vk::Format::B5G6R5_UNORM_PACK16
        | vk::Format::R5G5B5A1_UNORM_PACK16
        | vk::Format::B5G5R5A1_UNORM_PACK16
        | vk::Format::A1R5G5B5_UNORM_PACK16
        | vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SNORM
        | vk::Format::R8G8_USCALED
        | vk::Format::R8G8_SSCALED
        | vk::Format::R8G8_UINT
        | vk::Format::R8G8_SINT
        | vk::Format::R8G8_SRGB
        | vk::Format::R16_UNORM
        | vk::Format::R16_SNORM
        | vk::Format::R16_USCALED
        | vk::Format::R16_SSCALED
        | vk::Format::R16_UINT
        | vk::Format::R16_SINT
        | vk::Format::R16_SFLOAT
        | vk::Format::D16_UNORM => 2,

        vk::Format::R8G8B8_UNORM
        | vk::Format::R8G8B8_SNORM
        | vk::Format::R8G8B8_UINT
        | vk::Format::R8G8B8_SINT
        | vk::Format::R8G8B8_SRGB
        | vk::Format::B8G8R8_UNORM
        | vk::Format::B8G8R8_SNORM
        | vk::Format::B8G8R8_UINT
        | vk::Format::B8G8R8_SINT
        | vk::Format::B8G8R8_SRGB
        | vk::Format::D16_UNORM_S8_UINT => 3,

        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::R8G8B8A8_USCALED
        | vk::Format::R8G8B8A8_SSCALED
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::R8G8B8A8_SINT
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SNORM
        | vk::Format::B8G8R8A8_UINT
        | vk::Format::B8G8R8A8_SINT
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A8B8G8R8_UNORM_PACK32
        | vk::Format::A8B8G8R8_SRGB_PACK32
        | vk::Format::A2R10G10B10_UNORM_PACK32
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::A2B10G10R10_UINT_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::E5B9G9R9_UFLOAT_PACK32
        | vk::Format::R16G16_UNORM
        | vk::Format::R16G16_SNORM
        | vk::Format::R16G16_UINT
        | vk::Format::R16G16_SINT
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R32_SINT
        | vk::Format::R32_SFLOAT
        | vk::Format::X8_D24_UNORM_PACK32
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => 4,

        vk::Format::R16G16B16_UNORM
        | vk::Format::R16G16B16_SNORM
        | vk::Format::R16G16B16_UINT
        | vk::Format::R16G16B16_SINT
        | vk::Format::R16G16B16_SFLOAT => 6,

        vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_SNORM
        | vk::Format::R16G16B16A16_USCALED
        | vk::Format::R16G16B16A16_SSCALED
        | vk::Format::R16G16B16A16_UINT
        | vk::Format::R16G16B16A16_SINT
        | vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R32G32_UINT
        | vk::Format::R32G32_SINT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::R64_UINT
        | vk::Format::R64_SINT
        | vk::Format::R64_SFLOAT
        | vk::Format::D32_SFLOAT_S8_UINT => 8,

        vk::Format::R32G32B32_UINT | vk::Format::R32G32B32_SINT | vk::Format::R32G32B32_SFLOAT => {
            12
        }

        vk::Format::R32G32B32A32_UINT
        | vk::Format::R32G32B32A32_SINT
        | vk::Format::R32G32B32A32_SFLOAT
        | vk::Format::R64G64_UINT
        | vk::Format::R64G64_SINT
        | vk::Format::R64G64_SFLOAT => 16,

        _ => return None,
    };
    Some(size)
}

pub fn has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn is_depth_or_stencil(format: vk::Format) -> bool {
    has_depth(format) || has_stencil(format)
}

/// Numeric class of a color format's components, `None` for
/// `UNDEFINED`, depth/stencil, and formats outside the known color families.
pub fn numeric_class(format: vk::Format) -> Option<NumericClass> {
    match format {
        vk::Format::R8_UINT
        | vk::Format::R8G8_UINT
        | vk::Format::R8G8B8_UINT
        | vk::Format::B8G8R8_UINT
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::B8G8R8A8_UINT
        | vk::Format::A8B8G8R8_UINT_PACK32
        | vk::Format::A2R10G10B10_UINT_PACK32
        | vk::Format::A2B10G10R10_UINT_PACK32
        | vk::Format::R16_UINT
        | vk::Format::R16G16_UINT
        | vk::Format::R16G16B16_UINT
        | vk::Format::R16G16B16A16_UINT
        | vk::Format::R32_UINT
        | vk::Format::R32G32_UINT
        | vk::Format::R32G32B32_UINT
        | vk::Format::R32G32B32A32_UINT
        | vk::Format::R64_UINT
        | vk::Format::R64G64_UINT
        | vk::Format::R64G64B64_UINT
        | vk::Format::R64G64B64A64_UINT => Some(NumericClass::Uint),

        vk::Format::R8_SINT
        | vk::Format::R8G8_SINT
        | vk::Format::R8G8B8_SINT
        | vk::Format::B8G8R8_SINT
        | vk::Format::R8G8B8A8_SINT
        | vk::Format::B8G8R8A8_SINT
        | vk::Format::A8B8G8R8_SINT_PACK32
        | vk::Format::A2R10G10B10_SINT_PACK32
        | vk::Format::A2B10G10R10_SINT_PACK32
        | vk::Format::R16_SINT
        | vk::Format::R16G16_SINT
        | vk::Format::R16G16B16_SINT
        | vk::Format::R16G16B16A16_SINT
        | vk::Format::R32_SINT
        | vk::Format::R32G32_SINT
        | vk::Format::R32G32B32_SINT
        | vk::Format::R32G32B32A32_SINT
        | vk::Format::R64_SINT
        | vk::Format::R64G64_SINT
        | vk::Format::R64G64B64_SINT
        | vk::Format::R64G64B64A64_SINT => Some(NumericClass::Sint),

        _ if is_depth_or_stencil(format) => None,
        // Every remaining color format is normalized, scaled, sRGB, or float.
        _ if FLOAT_FORMAT_RANGES
            .iter()
            .any(|range| range.contains(&format.as_raw())) =>
        {
            Some(NumericClass::Float)
        }
        _ => None,
    }
}

/// Raw values of the color format families with no integer members once
/// the `_UINT`/`_SINT` formats above are matched.
const FLOAT_FORMAT_RANGES: [std::ops::RangeInclusive<i32>; 7] = [
    // R4G4_UNORM_PACK8 through ASTC_12x12_SRGB_BLOCK
    1..=184,
    // PVRTC blocks
    1_000_054_000..=1_000_054_007,
    // ASTC HDR blocks
    1_000_066_000..=1_000_066_013,
    // Multi-planar and packed YCbCr
    1_000_156_000..=1_000_156_033,
    // 4:4:4 two-plane YCbCr
    1_000_330_000..=1_000_330_003,
    // A4R4G4B4 and A4B4G4R4
    1_000_340_000..=1_000_340_001,
    // A1B5G5R5 and A8
    1_000_470_000..=1_000_470_001,
];
