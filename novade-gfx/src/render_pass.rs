//! The five-subpass render pass shared by all pipelines of a surface.
//!
//! Attachments: 0 depth, 1 offscreen float16 color, 2 swapchain image.
//! Subpasses 0-3 (box, image, SDF, alpha) draw into depth and color; subpass 4
//! tone maps the color attachment, read as an input attachment, into the
//! swapchain image. The swapchain image is loaded, not cleared: pixels outside
//! the scissor keep the previous frame's content.

use crate::error::Result;
use ash::{vk, Device};
use tracing::debug;

pub const COLOR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

pub const DEPTH_ATTACHMENT: u32 = 0;
pub const COLOR_ATTACHMENT: u32 = 1;
pub const SWAPCHAIN_ATTACHMENT: u32 = 2;
pub const SUBPASS_COUNT: u32 = 5;

pub fn attachment_descriptions(depth_format: vk::Format, swapchain_format: vk::Format) -> [vk::AttachmentDescription; 3] {
    let depth = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();
    let color = vk::AttachmentDescription::builder()
        .format(COLOR_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();
    let swapchain = vk::AttachmentDescription::builder()
        .format(swapchain_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::LOAD)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();
    [depth, color, swapchain]
}

pub fn subpass_dependencies() -> Vec<vk::SubpassDependency> {
    let color_output = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    let color_rw = vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    let fragment = vk::PipelineStageFlags::FRAGMENT_SHADER;

    let mut dependencies = vec![vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        dst_stage_mask: color_output,
        src_access_mask: vk::AccessFlags::MEMORY_READ,
        dst_access_mask: color_rw,
        dependency_flags: vk::DependencyFlags::BY_REGION,
    }];
    // Box, image and SDF blend onto what the previous subpass wrote.
    for subpass in 0..2 {
        dependencies.push(vk::SubpassDependency {
            src_subpass: subpass,
            dst_subpass: subpass + 1,
            src_stage_mask: color_output,
            dst_stage_mask: color_output,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: color_rw,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        });
    }
    // The alpha and tone map subpasses read the color attachment.
    for subpass in 2..4 {
        dependencies.push(vk::SubpassDependency {
            src_subpass: subpass,
            dst_subpass: subpass + 1,
            src_stage_mask: color_output,
            dst_stage_mask: fragment,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::INPUT_ATTACHMENT_READ,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        });
    }
    dependencies.push(vk::SubpassDependency {
        src_subpass: SUBPASS_COUNT - 1,
        dst_subpass: vk::SUBPASS_EXTERNAL,
        src_stage_mask: color_output,
        dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        src_access_mask: color_rw,
        dst_access_mask: vk::AccessFlags::MEMORY_READ,
        dependency_flags: vk::DependencyFlags::BY_REGION,
    });
    dependencies
}

pub fn create_render_pass(device: &Device, depth_format: vk::Format, swapchain_format: vk::Format) -> Result<vk::RenderPass> {
    let attachments = attachment_descriptions(depth_format, swapchain_format);

    let depth_ref = vk::AttachmentReference {
        attachment: DEPTH_ATTACHMENT,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let color_refs = [vk::AttachmentReference {
        attachment: COLOR_ATTACHMENT,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let color_input_refs = [vk::AttachmentReference {
        attachment: COLOR_ATTACHMENT,
        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }];
    let swapchain_refs = [vk::AttachmentReference {
        attachment: SWAPCHAIN_ATTACHMENT,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];

    let drawing = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)
        .build();
    let tone_map = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .input_attachments(&color_input_refs)
        .color_attachments(&swapchain_refs)
        .build();
    let subpasses = [drawing, drawing, drawing, drawing, tone_map];
    let dependencies = subpass_dependencies();

    let render_pass_create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let handle = unsafe { device.create_render_pass(&render_pass_create_info, None)? };
    debug!("Render pass created with {} subpasses.", subpasses.len());
    Ok(handle)
}

/// Clear values in attachment order; the swapchain attachment is loaded, not cleared.
pub fn clear_values(background: [f32; 4]) -> [vk::ClearValue; 3] {
    [
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: 0.0, stencil: 0 },
        },
        vk::ClearValue {
            color: vk::ClearColorValue { float32: background },
        },
        vk::ClearValue {
            color: vk::ClearColorValue { float32: [0.0; 4] },
        },
    ]
}

/// First depth format the device supports as an optimal-tiling depth attachment.
pub fn find_depth_format(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<vk::Format> {
    [vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D24_UNORM_S8_UINT]
        .into_iter()
        .find(|&format| {
            let properties = unsafe { instance.get_physical_device_format_properties(physical_device, format) };
            properties
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
}
