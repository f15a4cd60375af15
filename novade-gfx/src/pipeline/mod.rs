//! The five pipelines of a surface, one per render-pass subpass.
//!
//! The kind set is closed, so per-kind state is kept in arrays indexed by
//! `PipelineKind::index` and behaviour differences are plain `match`es.

pub mod vertex;

use crate::allocator::GpuBuffer;
use crate::device::GfxDevice;
use crate::error::{GfxError, Result};
use crate::shader::ShaderModules;
use crate::vertex_span::{FrameSpans, VertexSpan, MAX_QUADS};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use std::ffi::CStr;
use std::sync::Arc;
use tracing::{debug, info};
use vertex::{AlphaVertex, BoxVertex, ImageVertex, PushConstants, SdfVertex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Box,
    Image,
    Sdf,
    Alpha,
    ToneMap,
}

impl PipelineKind {
    /// In subpass order.
    pub const ALL: [PipelineKind; 5] = [
        PipelineKind::Box,
        PipelineKind::Image,
        PipelineKind::Sdf,
        PipelineKind::Alpha,
        PipelineKind::ToneMap,
    ];

    pub fn index(self) -> usize {
        match self {
            PipelineKind::Box => 0,
            PipelineKind::Image => 1,
            PipelineKind::Sdf => 2,
            PipelineKind::Alpha => 3,
            PipelineKind::ToneMap => 4,
        }
    }

    pub fn subpass(self) -> u32 {
        self.index() as u32
    }

    pub fn shader_name(self) -> &'static str {
        match self {
            PipelineKind::Box => "box",
            PipelineKind::Image => "image",
            PipelineKind::Sdf => "sdf",
            PipelineKind::Alpha => "alpha",
            PipelineKind::ToneMap => "tone_mapper",
        }
    }

    /// Tone mapping draws a full-screen triangle generated in the vertex shader.
    pub fn uses_vertex_buffer(self) -> bool {
        !matches!(self, PipelineKind::ToneMap)
    }

    pub fn vertex_size(self) -> usize {
        match self {
            PipelineKind::Box => std::mem::size_of::<BoxVertex>(),
            PipelineKind::Image => std::mem::size_of::<ImageVertex>(),
            PipelineKind::Sdf => std::mem::size_of::<SdfVertex>(),
            PipelineKind::Alpha => std::mem::size_of::<AlphaVertex>(),
            PipelineKind::ToneMap => 0,
        }
    }

    pub fn vertex_input(self) -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
        match self {
            PipelineKind::Box => (vec![BoxVertex::binding_description()], BoxVertex::attribute_descriptions()),
            PipelineKind::Image => (vec![ImageVertex::binding_description()], ImageVertex::attribute_descriptions()),
            PipelineKind::Sdf => (vec![SdfVertex::binding_description()], SdfVertex::attribute_descriptions()),
            PipelineKind::Alpha => (vec![AlphaVertex::binding_description()], AlphaVertex::attribute_descriptions()),
            PipelineKind::ToneMap => (Vec::new(), Vec::new()),
        }
    }

    /// Descriptor bindings as `(binding, type, count)`, all for the fragment stage.
    pub fn descriptor_bindings(self) -> Vec<(u32, vk::DescriptorType, u32)> {
        match self {
            PipelineKind::Image => vec![
                (0, vk::DescriptorType::SAMPLER, 1),
                (1, vk::DescriptorType::SAMPLED_IMAGE, crate::atlas::image::ATLAS_MAX_IMAGES as u32),
            ],
            PipelineKind::Sdf => vec![
                (0, vk::DescriptorType::SAMPLER, 1),
                (1, vk::DescriptorType::SAMPLED_IMAGE, crate::atlas::glyph::ATLAS_MAX_IMAGES as u32),
            ],
            PipelineKind::ToneMap => vec![(0, vk::DescriptorType::INPUT_ATTACHMENT, 1)],
            PipelineKind::Box | PipelineKind::Alpha => Vec::new(),
        }
    }

    pub fn uses_push_constants(self) -> bool {
        self.uses_vertex_buffer()
    }

    pub fn color_blend(self) -> vk::PipelineColorBlendAttachmentState {
        let premultiplied = vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        match self {
            PipelineKind::Box | PipelineKind::Image => premultiplied.build(),
            // Dual-source blending carries per-channel coverage for subpixel anti-aliasing.
            PipelineKind::Sdf => premultiplied
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC1_COLOR)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC1_ALPHA)
                .build(),
            PipelineKind::Alpha => vk::PipelineColorBlendAttachmentState::builder()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::A)
                .build(),
            PipelineKind::ToneMap => vk::PipelineColorBlendAttachmentState::builder()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .build(),
        }
    }

    /// Depth is cleared to 0.0 and nearer widgets have larger depth values.
    pub fn depth_test(self) -> bool {
        !matches!(self, PipelineKind::ToneMap)
    }
}

/// Six indices per quad, `0,1,2,2,1,3` offset by four per quad.
pub fn quad_indices(quads: usize) -> Vec<u16> {
    let mut indices = Vec::with_capacity(quads * 6);
    for quad in 0..quads {
        let base = (quad * 4) as u16;
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 1, base + 3]);
    }
    indices
}

fn shader_entry() -> &'static CStr {
    // SAFETY: literal is NUL-terminated without interior NULs.
    unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") }
}

fn create_pipeline(
    device: &ash::Device,
    kind: PipelineKind,
    shaders: ShaderModules,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
) -> Result<vk::Pipeline> {
    let entry = shader_entry();
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(shaders.vertex)
            .name(entry)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(shaders.fragment)
            .name(entry)
            .build(),
    ];

    let (bindings, attributes) = kind.vertex_input();
    let vertex_input_state_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly_state_info = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport and scissor are dynamic; only the counts matter here.
    let viewport_state_info = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state_info = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisample_state_info = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    let color_blend_attachments = [kind.color_blend()];
    let color_blend_state_info = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let depth_stencil_state_info = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(kind.depth_test())
        .depth_write_enable(kind.depth_test())
        .depth_compare_op(vk::CompareOp::GREATER_OR_EQUAL)
        .stencil_test_enable(false);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state_info = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state_info)
        .input_assembly_state(&input_assembly_state_info)
        .viewport_state(&viewport_state_info)
        .rasterization_state(&rasterization_state_info)
        .multisample_state(&multisample_state_info)
        .color_blend_state(&color_blend_state_info)
        .depth_stencil_state(&depth_stencil_state_info)
        .dynamic_state(&dynamic_state_info)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(kind.subpass())
        .build();

    let pipelines = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None) }
        .map_err(|(created, err)| {
            for pipeline in created {
                if pipeline != vk::Pipeline::null() {
                    unsafe { device.destroy_pipeline(pipeline, None) };
                }
            }
            GfxError::from(err)
        })?;
    pipelines.into_iter().next().ok_or(GfxError::ResourceCreation {
        resource: "graphics pipeline",
        message: format!("no pipeline returned for {:?}", kind),
    })
}

fn copy_span<V: Pod>(buffer: &mut GpuBuffer, span: &VertexSpan<V>) -> Result<u32> {
    let mapped = buffer.mapped_bytes().ok_or(GfxError::ResourceCreation {
        resource: "vertex buffer",
        message: "vertex memory is not host mapped".to_string(),
    })?;
    Ok(copy_quads(mapped, span.as_slice()))
}

/// Copies whole quads of `vertices` into `mapped` and returns the index count
/// of the quads that fit.
fn copy_quads<V: Pod>(mapped: &mut [u8], vertices: &[V]) -> u32 {
    let quad_bytes = 4 * std::mem::size_of::<V>();
    let quads = (vertices.len() / 4).min(mapped.len() / quad_bytes.max(1));
    let bytes: &[u8] = bytemuck::cast_slice(&vertices[..quads * 4]);
    mapped[..bytes.len()].copy_from_slice(bytes);
    (quads * 6) as u32
}

/// Per-surface pipeline state, as arrays indexed by `PipelineKind::index`.
pub struct PipelineSet {
    device: Arc<GfxDevice>,
    descriptor_set_layouts: [vk::DescriptorSetLayout; 5],
    descriptor_pools: [vk::DescriptorPool; 5],
    descriptor_sets: [vk::DescriptorSet; 5],
    layouts: [vk::PipelineLayout; 5],
    pipelines: [vk::Pipeline; 5],
    vertex_buffers: [Option<GpuBuffer>; 5],
    index_counts: [u32; 5],
    /// Atlas texture counts the descriptor sets were last written with.
    atlas_texture_counts: (usize, usize),
}

impl PipelineSet {
    /// Builds everything that depends only on the device: descriptor set
    /// layouts and sets, pipeline layouts and the mapped vertex buffers.
    pub fn new(device: Arc<GfxDevice>) -> Result<Self> {
        let mut set = Self {
            device,
            descriptor_set_layouts: [vk::DescriptorSetLayout::null(); 5],
            descriptor_pools: [vk::DescriptorPool::null(); 5],
            descriptor_sets: [vk::DescriptorSet::null(); 5],
            layouts: [vk::PipelineLayout::null(); 5],
            pipelines: [vk::Pipeline::null(); 5],
            vertex_buffers: Default::default(),
            index_counts: [0; 5],
            atlas_texture_counts: (0, 0),
        };
        for kind in PipelineKind::ALL {
            // On error the partially built set is dropped and destroys what exists.
            set.build_for_kind(kind)?;
        }
        info!("Pipeline set built for device.");
        Ok(set)
    }

    fn build_for_kind(&mut self, kind: PipelineKind) -> Result<()> {
        let i = kind.index();
        let raw = self.device.raw();

        let bindings = kind.descriptor_bindings();
        if !bindings.is_empty() {
            let layout_bindings: Vec<_> = bindings
                .iter()
                .map(|&(binding, ty, count)| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(binding)
                        .descriptor_type(ty)
                        .descriptor_count(count)
                        .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                        .build()
                })
                .collect();
            let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
            self.descriptor_set_layouts[i] = unsafe { raw.create_descriptor_set_layout(&layout_info, None)? };

            let pool_sizes: Vec<_> = bindings
                .iter()
                .map(|&(_, ty, count)| vk::DescriptorPoolSize { ty, descriptor_count: count })
                .collect();
            let pool_info = vk::DescriptorPoolCreateInfo::builder().max_sets(1).pool_sizes(&pool_sizes);
            self.descriptor_pools[i] = unsafe { raw.create_descriptor_pool(&pool_info, None)? };

            let set_layouts = [self.descriptor_set_layouts[i]];
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(self.descriptor_pools[i])
                .set_layouts(&set_layouts);
            self.descriptor_sets[i] = unsafe { raw.allocate_descriptor_sets(&alloc_info)? }[0];
        }

        let set_layouts: Vec<_> = if bindings.is_empty() { Vec::new() } else { vec![self.descriptor_set_layouts[i]] };
        let push_constant_ranges: Vec<_> = if kind.uses_push_constants() {
            vec![vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                offset: 0,
                size: std::mem::size_of::<PushConstants>() as u32,
            }]
        } else {
            Vec::new()
        };
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        self.layouts[i] = unsafe { raw.create_pipeline_layout(&layout_info, None)? };

        if kind.uses_vertex_buffer() {
            let size = (kind.vertex_size() * MAX_QUADS * 4) as vk::DeviceSize;
            let name = format!("{} vertex buffer", kind.shader_name());
            let mut allocator = self.device.allocator();
            self.vertex_buffers[i] = Some(GpuBuffer::new(
                raw,
                &mut allocator,
                &name,
                size,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                MemoryLocation::CpuToGpu,
            )?);
        }
        Ok(())
    }

    pub fn has_pipelines(&self) -> bool {
        self.pipelines.iter().all(|p| *p != vk::Pipeline::null())
    }

    /// Creates the pipelines for a new render pass and points the tone mapper
    /// at the offscreen color attachment.
    pub fn build_for_new_swapchain(&mut self, render_pass: vk::RenderPass, color_view: vk::ImageView) -> Result<()> {
        let raw = self.device.raw();
        for kind in PipelineKind::ALL {
            let shaders = self.device.shaders(kind)?;
            self.pipelines[kind.index()] = create_pipeline(raw, kind, shaders, self.layouts[kind.index()], render_pass)?;
        }

        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: color_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.descriptor_sets[PipelineKind::ToneMap.index()])
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::INPUT_ATTACHMENT)
            .image_info(&image_info)
            .build();
        unsafe { raw.update_descriptor_sets(&[write], &[]) };

        // Force the atlas descriptors to be rewritten for the first frame.
        self.atlas_texture_counts = (0, 0);
        debug!("Pipelines built for new swapchain.");
        Ok(())
    }

    pub fn teardown_for_swapchain_lost(&mut self) {
        let raw = self.device.raw();
        for pipeline in self.pipelines.iter_mut() {
            if *pipeline != vk::Pipeline::null() {
                unsafe { raw.destroy_pipeline(*pipeline, None) };
                *pipeline = vk::Pipeline::null();
            }
        }
    }

    /// Rewrites the image and glyph atlas descriptors when textures were added.
    pub fn update_atlas_descriptors(&mut self) -> Result<()> {
        let views = self.device.atlas_descriptor_views()?;
        let counts = (views.image_texture_count, views.glyph_texture_count);
        if counts == self.atlas_texture_counts {
            return Ok(());
        }

        let raw = self.device.raw();
        let targets = [
            (PipelineKind::Image, views.image_sampler, &views.image_views),
            (PipelineKind::Sdf, views.glyph_sampler, &views.glyph_views),
        ];
        for (kind, sampler, image_views) in targets {
            let sampler_info = [vk::DescriptorImageInfo {
                sampler,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            }];
            let image_infos: Vec<_> = image_views
                .iter()
                .map(|&image_view| vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
                .collect();
            let set = self.descriptor_sets[kind.index()];
            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(&sampler_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(&image_infos)
                    .build(),
            ];
            unsafe { raw.update_descriptor_sets(&writes, &[]) };
        }
        self.atlas_texture_counts = counts;
        debug!("Atlas descriptors rewritten: {} image, {} glyph textures.", counts.0, counts.1);
        Ok(())
    }

    /// Copies the frame's vertices into the mapped vertex buffers.
    pub fn upload(&mut self, spans: &FrameSpans) -> Result<()> {
        let [boxes, images, glyphs, alpha, _] = &mut self.vertex_buffers;
        let missing = || GfxError::ResourceCreation {
            resource: "vertex buffer",
            message: "pipeline set has no vertex buffers".to_string(),
        };
        self.index_counts = [
            copy_span(boxes.as_mut().ok_or_else(missing)?, &spans.boxes)?,
            copy_span(images.as_mut().ok_or_else(missing)?, &spans.images)?,
            copy_span(glyphs.as_mut().ok_or_else(missing)?, &spans.glyphs)?,
            copy_span(alpha.as_mut().ok_or_else(missing)?, &spans.alpha)?,
            0,
        ];
        Ok(())
    }

    /// Records the draw call of one subpass.
    pub fn draw_in_command_buffer(&self, kind: PipelineKind, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        let raw = self.device.raw();
        let i = kind.index();
        unsafe {
            raw.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipelines[i]);
            if self.descriptor_sets[i] != vk::DescriptorSet::null() {
                raw.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.layouts[i],
                    0,
                    &[self.descriptor_sets[i]],
                    &[],
                );
            }
        }

        match kind {
            PipelineKind::ToneMap => unsafe { raw.cmd_draw(cmd, 3, 1, 0, 0) },
            _ => {
                if self.index_counts[i] == 0 {
                    return;
                }
                let Some(buffer) = &self.vertex_buffers[i] else {
                    return;
                };
                let push_constants = PushConstants::for_extent(extent);
                unsafe {
                    raw.cmd_bind_vertex_buffers(cmd, 0, &[buffer.buffer], &[0]);
                    raw.cmd_bind_index_buffer(cmd, self.device.quad_index_buffer(), 0, vk::IndexType::UINT16);
                    raw.cmd_push_constants(
                        cmd,
                        self.layouts[i],
                        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                        0,
                        bytemuck::bytes_of(&push_constants),
                    );
                    raw.cmd_draw_indexed(cmd, self.index_counts[i], 1, 0, 0, 0);
                }
            }
        }
    }
}

impl Drop for PipelineSet {
    fn drop(&mut self) {
        self.teardown_for_swapchain_lost();
        let raw = self.device.raw();
        unsafe {
            for layout in self.layouts {
                if layout != vk::PipelineLayout::null() {
                    raw.destroy_pipeline_layout(layout, None);
                }
            }
            // Destroying a pool frees its sets.
            for pool in self.descriptor_pools {
                if pool != vk::DescriptorPool::null() {
                    raw.destroy_descriptor_pool(pool, None);
                }
            }
            for layout in self.descriptor_set_layouts {
                if layout != vk::DescriptorSetLayout::null() {
                    raw.destroy_descriptor_set_layout(layout, None);
                }
            }
        }
        let mut allocator = self.device.allocator();
        for buffer in self.vertex_buffers.iter_mut().filter_map(Option::take) {
            buffer.destroy(raw, &mut allocator);
        }
        debug!("Pipeline set destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_copies_whole_quads_and_counts_their_indices() {
        let vertices: Vec<u32> = (0..12).collect();
        let mut mapped = vec![0u8; 64];
        assert_eq!(copy_quads(&mut mapped, &vertices[..8]), 12);
        assert_eq!(&mapped[..32], bytemuck::cast_slice::<u32, u8>(&vertices[..8]));

        // Only two of the three quads fit a 40 byte mapping.
        let mut small = vec![0u8; 40];
        assert_eq!(copy_quads(&mut small, &vertices), 12);
        assert_eq!(&small[32..], &[0u8; 8]);
    }

    #[test]
    fn quad_indices_follow_the_two_triangle_pattern() {
        let indices = quad_indices(2);
        assert_eq!(indices, vec![0, 1, 2, 2, 1, 3, 4, 5, 6, 6, 5, 7]);
    }

    #[test]
    fn all_quads_fit_sixteen_bit_indices() {
        let indices = quad_indices(MAX_QUADS);
        assert_eq!(indices.len(), MAX_QUADS * 6);
        assert_eq!(indices.iter().copied().max(), Some(u16::MAX));
    }

    #[test]
    fn kinds_map_to_consecutive_subpasses() {
        for (i, kind) in PipelineKind::ALL.iter().enumerate() {
            assert_eq!(kind.subpass(), i as u32);
        }
        assert!(!PipelineKind::ToneMap.uses_vertex_buffer());
        assert!(PipelineKind::ToneMap.vertex_input().0.is_empty());
    }

    #[test]
    fn atlas_pipelines_bind_a_texture_array() {
        let sdf = PipelineKind::Sdf.descriptor_bindings();
        assert_eq!(sdf[1], (1, vk::DescriptorType::SAMPLED_IMAGE, 128));
        let image = PipelineKind::Image.descriptor_bindings();
        assert_eq!(image[1].2, 16);
        assert!(PipelineKind::Box.descriptor_bindings().is_empty());
    }

    #[test]
    fn alpha_pipeline_only_writes_alpha() {
        let blend = PipelineKind::Alpha.color_blend();
        assert_eq!(blend.color_write_mask, vk::ColorComponentFlags::A);
        assert_eq!(blend.blend_enable, vk::FALSE);
    }
}
