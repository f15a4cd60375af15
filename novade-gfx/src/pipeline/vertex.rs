//! Vertex layouts of the pipelines and their Vulkan input descriptions.
//!
//! Every struct is `#[repr(C)]` and `Pod`, so a span of vertices is copied
//! into the mapped vertex buffer as raw bytes. Attribute locations follow
//! field order.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use memoffset::offset_of;

fn binding<V>() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(std::mem::size_of::<V>() as u32)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build()
}

fn attribute(location: u32, format: vk::Format, offset: usize) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription::builder()
        .location(location)
        .binding(0)
        .format(format)
        .offset(offset as u32)
        .build()
}

/// Rounded, bordered rectangle.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BoxVertex {
    /// Window position and depth.
    pub position: [f32; 3],
    /// Clip rectangle as left, bottom, right, top.
    pub clipping_rectangle: [f32; 4],
    /// Position relative to the box: xy from the bottom-left corner, zw from the top-right corner.
    pub corner_coordinate: [f32; 4],
    /// Half-float RGBA.
    pub fill_color: [u16; 4],
    pub line_color: [u16; 4],
    pub line_width: f32,
    /// Bottom-left, bottom-right, top-left, top-right.
    pub corner_radii: [f32; 4],
}

impl BoxVertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        binding::<Self>()
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, clipping_rectangle)),
            attribute(2, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, corner_coordinate)),
            attribute(3, vk::Format::R16G16B16A16_SFLOAT, offset_of!(Self, fill_color)),
            attribute(4, vk::Format::R16G16B16A16_SFLOAT, offset_of!(Self, line_color)),
            attribute(5, vk::Format::R32_SFLOAT, offset_of!(Self, line_width)),
            attribute(6, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, corner_radii)),
        ]
    }
}

/// One atlas page of an image.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ImageVertex {
    pub position: [f32; 3],
    pub clipping_rectangle: [f32; 4],
    /// Normalized atlas coordinate with the texture index as z.
    pub atlas_position: [f32; 3],
}

impl ImageVertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        binding::<Self>()
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, clipping_rectangle)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, atlas_position)),
        ]
    }
}

/// One glyph, drawn from its signed distance field.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SdfVertex {
    pub position: [f32; 3],
    pub clipping_rectangle: [f32; 4],
    pub texture_coordinate: [f32; 3],
    pub color: [u16; 4],
}

impl SdfVertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        binding::<Self>()
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, clipping_rectangle)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, texture_coordinate)),
            attribute(3, vk::Format::R16G16B16A16_SFLOAT, offset_of!(Self, color)),
        ]
    }
}

/// Overrides the alpha channel of the offscreen color attachment.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct AlphaVertex {
    pub position: [f32; 3],
    pub clipping_rectangle: [f32; 4],
    pub alpha: f32,
}

impl AlphaVertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        binding::<Self>()
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, clipping_rectangle)),
            attribute(2, vk::Format::R32_SFLOAT, offset_of!(Self, alpha)),
        ]
    }
}

/// Push constants shared by the vertex-consuming pipelines.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PushConstants {
    pub window_extent: [f32; 2],
    /// Factor from window coordinates to normalized device coordinates.
    pub viewport_scale: [f32; 2],
}

impl PushConstants {
    pub fn for_extent(extent: vk::Extent2D) -> Self {
        let (w, h) = (extent.width.max(1) as f32, extent.height.max(1) as f32);
        Self {
            window_extent: [w, h],
            viewport_scale: [2.0 / w, 2.0 / h],
        }
    }
}
