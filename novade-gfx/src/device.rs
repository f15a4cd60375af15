//! Logical device and the resources every surface on it shares.
//!
//! A `GfxDevice` owns one queue (with its own command pool) per queue family,
//! the GPU memory allocator, the shader modules of every pipeline kind, the
//! 16-bit quad index buffer and the image and glyph atlases. It is created
//! once per physical device and shared between surfaces through an `Arc`.

use crate::allocator::{create_allocator, GpuBuffer};
use crate::atlas::{image::Rgba16f, Glyph, GlyphAtlas, GlyphAtlasInfo, ImageAtlas, PageIndex, PagedImage, PixelBuffer};
use crate::atlas::texture::cmd_transition_layout;
use crate::context::GraphicsContext;
use crate::error::{GfxError, Result};
use crate::pipeline::{quad_indices, PipelineKind};
use crate::render_pass::find_depth_format;
use crate::scoring::{
    self, required_device_extensions, required_features, DeviceCapabilities, DeviceLimits, DeviceScore,
    QueueFamilyCapabilities,
};
use crate::shader::{ShaderLibrary, ShaderModules};
use crate::system::VulkanInstance;
use crate::vertex_span::MAX_QUADS;
use ash::extensions::khr::{Surface, Swapchain};
use ash::vk;
use gpu_allocator::vulkan::Allocator;
use gpu_allocator::MemoryLocation;
use parking_lot::{Mutex, MutexGuard};
use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A device queue and the command pool used to record work for it.
#[derive(Debug, Clone, Copy)]
pub struct GfxQueue {
    pub family_index: u32,
    pub queue: vk::Queue,
    pub capabilities: QueueFamilyCapabilities,
    pub command_pool: vk::CommandPool,
}

/// Samplers and views the image and SDF pipelines bind, with slots beyond the
/// live texture count repeating the first texture.
#[derive(Debug, Clone)]
pub struct AtlasDescriptorViews {
    pub image_sampler: vk::Sampler,
    pub image_views: Vec<vk::ImageView>,
    pub image_texture_count: usize,
    pub glyph_sampler: vk::Sampler,
    pub glyph_views: Vec<vk::ImageView>,
    pub glyph_texture_count: usize,
}

/// Queries everything device scoring needs about `physical_device` as seen from `surface`.
pub fn query_capabilities(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
) -> Result<DeviceCapabilities> {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    let features = unsafe { instance.get_physical_device_features(physical_device) };
    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device)? }
        .iter()
        .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_string_lossy().into_owned())
        .collect();

    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let mut queue_families = Vec::with_capacity(families.len());
    for (index, family) in families.iter().enumerate() {
        let present = unsafe {
            surface_loader.get_physical_device_surface_support(physical_device, index as u32, surface)?
        };
        queue_families.push(QueueFamilyCapabilities {
            graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            compute: family.queue_flags.contains(vk::QueueFlags::COMPUTE),
            present,
        });
    }

    let surface_formats = unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface)? };
    let present_modes =
        unsafe { surface_loader.get_physical_device_surface_present_modes(physical_device, surface)? };

    Ok(DeviceCapabilities {
        name,
        device_type: properties.device_type,
        extensions,
        features,
        limits: DeviceLimits::from_vk(&properties.limits),
        queue_families,
        surface_formats,
        present_modes,
    })
}

pub struct GfxDevice {
    context: Arc<GraphicsContext>,
    /// Keeps the instance alive until the device is destroyed.
    instance: Arc<VulkanInstance>,
    physical_device: vk::PhysicalDevice,
    name: String,
    raw: ash::Device,
    swapchain_loader: Swapchain,
    queues: Vec<GfxQueue>,
    graphics_queue: usize,
    depth_format: vk::Format,
    /// Dropped by hand, after everything allocated from it and before the device.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    shaders: ShaderLibrary,
    quad_index_buffer: Option<GpuBuffer>,
    image_atlas: Mutex<Option<ImageAtlas>>,
    glyph_atlas: Mutex<Option<GlyphAtlas>>,
}

impl std::fmt::Debug for GfxDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GfxDevice")
            .field("name", &self.name)
            .field("physical_device", &self.physical_device)
            .field("queues", &self.queues)
            .field("depth_format", &self.depth_format)
            .finish_non_exhaustive()
    }
}

impl GfxDevice {
    /// Creates the logical device for `physical_device`, choosing the first
    /// queue family that can both draw and present to `surface`.
    pub fn new(
        context: Arc<GraphicsContext>,
        shared_instance: &Arc<VulkanInstance>,
        physical_device: vk::PhysicalDevice,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Arc<Self>> {
        let _lock = context.lock();
        let instance = shared_instance.raw();
        let caps = query_capabilities(instance, physical_device, surface_loader, surface)?;
        let graphics_family = caps
            .queue_families
            .iter()
            .position(|q| q.graphics && q.present)
            .ok_or(GfxError::DeviceUnsuitable)?;
        let depth_format = find_depth_format(instance, physical_device).ok_or_else(|| GfxError::ResourceCreation {
            resource: "depth attachment",
            message: format!("{} supports none of the depth formats", caps.name),
        })?;

        let priorities = [1.0f32];
        let queue_infos: Vec<_> = (0..caps.queue_families.len() as u32)
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();
        let extension_names: Vec<_> = required_device_extensions().iter().map(|e| e.as_ptr()).collect();
        let features = required_features();
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);
        let raw = unsafe { instance.create_device(physical_device, &device_info, None)? };
        info!("Logical device created on {}.", caps.name);

        let allocator = match create_allocator(instance, physical_device, &raw) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { raw.destroy_device(None) };
                return Err(e);
            }
        };

        // From here on a failed step drops the partially built device, which
        // destroys whatever exists.
        let mut device = Self {
            context: context.clone(),
            instance: shared_instance.clone(),
            physical_device,
            name: caps.name.clone(),
            swapchain_loader: Swapchain::new(instance, &raw),
            raw,
            queues: Vec::with_capacity(caps.queue_families.len()),
            graphics_queue: graphics_family,
            depth_format,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            shaders: ShaderLibrary::default(),
            quad_index_buffer: None,
            image_atlas: Mutex::new(None),
            glyph_atlas: Mutex::new(None),
        };

        for (family_index, capabilities) in caps.queue_families.iter().enumerate() {
            let family_index = family_index as u32;
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(family_index)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = unsafe { device.raw.create_command_pool(&pool_info, None)? };
            let queue = unsafe { device.raw.get_device_queue(family_index, 0) };
            device.queues.push(GfxQueue {
                family_index,
                queue,
                capabilities: *capabilities,
                command_pool,
            });
        }
        debug!(
            "{} queues created, graphics and present on family {}.",
            device.queues.len(),
            graphics_family
        );

        device.shaders = ShaderLibrary::load(&device.raw, &context.config().shader_dir)?;
        device.quad_index_buffer = Some(device.create_quad_index_buffer()?);
        let image_atlas = ImageAtlas::new(&device)?;
        *device.image_atlas.get_mut() = Some(image_atlas);
        let glyph_atlas = GlyphAtlas::new(&device)?;
        *device.glyph_atlas.get_mut() = Some(glyph_atlas);

        info!("Device {} ready (depth format {:?}).", device.name, depth_format);
        Ok(Arc::new(device))
    }

    fn create_quad_index_buffer(&self) -> Result<GpuBuffer> {
        let indices = quad_indices(MAX_QUADS);
        let bytes: &[u8] = bytemuck::cast_slice(&indices);
        let size = bytes.len() as vk::DeviceSize;

        let mut allocator = self.allocator();
        let mut staging = GpuBuffer::new(
            &self.raw,
            &mut allocator,
            "quad index staging",
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        let buffer = match GpuBuffer::new(
            &self.raw,
            &mut allocator,
            "quad index buffer",
            size,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                staging.destroy(&self.raw, &mut allocator);
                return Err(e);
            }
        };
        drop(allocator);

        let mapped = match staging.mapped_bytes() {
            Some(mapped) => {
                mapped[..bytes.len()].copy_from_slice(bytes);
                true
            }
            None => false,
        };
        let result = if mapped {
            let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
            let (src, dst) = (staging.buffer, buffer.buffer);
            self.submit_one_shot(|cmd| unsafe { self.raw.cmd_copy_buffer(cmd, src, dst, &[region]) })
        } else {
            Err(GfxError::ResourceCreation {
                resource: "quad index staging",
                message: "staging memory is not host mapped".to_string(),
            })
        };

        let mut allocator = self.allocator();
        staging.destroy(&self.raw, &mut allocator);
        match result {
            Ok(()) => {
                debug!("Quad index buffer uploaded: {} indices.", indices.len());
                Ok(buffer)
            }
            Err(e) => {
                buffer.destroy(&self.raw, &mut allocator);
                Err(e)
            }
        }
    }

    pub fn context(&self) -> &Arc<GraphicsContext> {
        &self.context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn swapchain_loader(&self) -> &Swapchain {
        &self.swapchain_loader
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    pub fn queues(&self) -> &[GfxQueue] {
        &self.queues
    }

    /// The queue used for drawing, presenting and one-shot work.
    pub fn graphics_queue(&self) -> &GfxQueue {
        &self.queues[self.graphics_queue]
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Tile size the render area should be rounded to.
    pub fn render_area_granularity(&self, render_pass: vk::RenderPass) -> vk::Extent2D {
        unsafe { self.raw.get_render_area_granularity(render_pass) }
    }

    pub fn quad_index_buffer(&self) -> vk::Buffer {
        self.quad_index_buffer.as_ref().map_or(vk::Buffer::null(), |b| b.buffer)
    }

    pub fn shaders(&self, kind: PipelineKind) -> Result<ShaderModules> {
        self.shaders
            .get(kind)
            .ok_or_else(|| GfxError::ShaderLoading(format!("no shaders loaded for {}", kind.shader_name())))
    }

    /// Scores this device for another surface, using the same policy as
    /// device selection. Its graphics queue family must be able to present
    /// to `surface`.
    pub fn score(&self, surface_loader: &Surface, surface: vk::SurfaceKHR) -> Result<DeviceScore> {
        let caps = query_capabilities(self.instance.raw(), self.physical_device, surface_loader, surface)?;
        Ok(self.score_capabilities(&caps))
    }

    pub(crate) fn score_capabilities(&self, caps: &DeviceCapabilities) -> DeviceScore {
        let family = self.graphics_queue().family_index as usize;
        scoring::score_with_queue_family(caps, self.context.config().allow_hdr, family)
    }

    pub fn wait_idle(&self) {
        if let Err(e) = unsafe { self.raw.device_wait_idle() } {
            warn!("Waiting for device {} to become idle failed: {}", self.name, e);
        }
    }

    /// Records commands with `record`, submits them to the graphics queue and
    /// blocks until the queue is idle.
    pub fn submit_one_shot<F: FnOnce(vk::CommandBuffer)>(&self, record: F) -> Result<()> {
        debug_assert!(self.context.is_held(), "one-shot submit without the graphics lock");
        let queue = *self.graphics_queue();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(queue.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.raw.allocate_command_buffers(&alloc_info)? }[0];

        let submit = || -> Result<()> {
            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.raw.begin_command_buffer(cmd, &begin_info)? };
            record(cmd);
            unsafe { self.raw.end_command_buffer(cmd)? };

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            unsafe {
                self.raw
                    .queue_submit(queue.queue, &[submit_info.build()], vk::Fence::null())?;
                self.raw.queue_wait_idle(queue.queue)?;
            }
            Ok(())
        };
        let result = submit();
        unsafe { self.raw.free_command_buffers(queue.command_pool, &[cmd]) };
        result
    }

    /// Waits for `semaphore` on the graphics queue with an empty submit so it
    /// is unsignalled again. Blocks until the queue is idle.
    pub fn consume_semaphore(&self, semaphore: vk::Semaphore) -> Result<()> {
        debug_assert!(self.context.is_held());
        let queue = self.graphics_queue().queue;
        let wait_semaphores = [semaphore];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
        unsafe {
            self.raw.queue_submit(queue, &[submit_info.build()], vk::Fence::null())?;
            self.raw.queue_wait_idle(queue)?;
        }
        Ok(())
    }

    pub fn transition_layout(&self, image: vk::Image, old: vk::ImageLayout, new: vk::ImageLayout) -> Result<()> {
        self.submit_one_shot(|cmd| cmd_transition_layout(&self.raw, cmd, image, old, new))
    }

    /// Copies `regions` from `src` to `dst`, which must already be in the
    /// transfer source and destination layouts.
    pub fn copy_image(&self, src: vk::Image, dst: vk::Image, regions: &[vk::ImageCopy]) -> Result<()> {
        self.submit_one_shot(|cmd| unsafe {
            self.raw.cmd_copy_image(
                cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            );
        })
    }

    fn atlas_missing(atlas: &'static str) -> GfxError {
        GfxError::ResourceCreation {
            resource: atlas,
            message: "device has no atlas".to_string(),
        }
    }

    /// Reserves image atlas pages for a `width` x `height` image.
    pub fn make_image(&self, width: u32, height: u32) -> Result<PagedImage> {
        let _lock = self.context.lock();
        let mut atlas = self.image_atlas.lock();
        let atlas = atlas.as_mut().ok_or_else(|| Self::atlas_missing("image atlas"))?;
        atlas.make_image(self, width, height)
    }

    pub fn upload_image(&self, image: &mut PagedImage, pixels: &PixelBuffer<Rgba16f>) -> Result<()> {
        let _lock = self.context.lock();
        let mut atlas = self.image_atlas.lock();
        let atlas = atlas.as_mut().ok_or_else(|| Self::atlas_missing("image atlas"))?;
        atlas.upload(self, image, pixels)
    }

    /// Texture coordinates of a page's payload and the index of its atlas texture.
    pub fn image_page_uv(&self, page: PageIndex) -> Result<([f32; 2], [f32; 2], u32)> {
        let atlas = self.image_atlas.lock();
        let atlas = atlas.as_ref().ok_or_else(|| Self::atlas_missing("image atlas"))?;
        Ok(atlas.page_uv(page))
    }

    /// Looks a glyph up in the glyph atlas, adding it on first use. The flag
    /// reports whether it was added.
    pub fn glyph(&self, glyph: &dyn Glyph) -> Result<(Option<GlyphAtlasInfo>, bool)> {
        let _lock = self.context.lock();
        let mut atlas = self.glyph_atlas.lock();
        let atlas = atlas.as_mut().ok_or_else(|| Self::atlas_missing("glyph atlas"))?;
        atlas.get_or_add(self, glyph)
    }

    /// Moves every atlas texture into the layout the fragment shaders sample.
    pub fn prepare_atlases_for_rendering(&self) -> Result<()> {
        debug_assert!(self.context.is_held());
        if let Some(atlas) = self.image_atlas.lock().as_mut() {
            atlas.prepare_for_rendering(self)?;
        }
        if let Some(atlas) = self.glyph_atlas.lock().as_mut() {
            atlas.prepare_for_rendering(self)?;
        }
        Ok(())
    }

    pub fn atlas_descriptor_views(&self) -> Result<AtlasDescriptorViews> {
        let image_atlas = self.image_atlas.lock();
        let image_atlas = image_atlas.as_ref().ok_or_else(|| Self::atlas_missing("image atlas"))?;
        let glyph_atlas = self.glyph_atlas.lock();
        let glyph_atlas = glyph_atlas.as_ref().ok_or_else(|| Self::atlas_missing("glyph atlas"))?;
        Ok(AtlasDescriptorViews {
            image_sampler: image_atlas.sampler,
            image_views: image_atlas.descriptor_views(crate::atlas::image::ATLAS_MAX_IMAGES),
            image_texture_count: image_atlas.texture_count(),
            glyph_sampler: glyph_atlas.sampler,
            glyph_views: glyph_atlas.descriptor_views(crate::atlas::glyph::ATLAS_MAX_IMAGES),
            glyph_texture_count: glyph_atlas.texture_count(),
        })
    }
}

impl Drop for GfxDevice {
    fn drop(&mut self) {
        let _lock = self.context.lock();
        self.wait_idle();
        {
            let mut allocator = self.allocator.lock();
            if let Some(atlas) = self.image_atlas.get_mut().take() {
                atlas.destroy(&self.raw, &mut allocator);
            }
            if let Some(atlas) = self.glyph_atlas.get_mut().take() {
                atlas.destroy(&self.raw, &mut allocator);
            }
            if let Some(buffer) = self.quad_index_buffer.take() {
                buffer.destroy(&self.raw, &mut allocator);
            }
        }
        self.shaders.destroy(&self.raw);
        unsafe {
            for queue in self.queues.drain(..) {
                self.raw.destroy_command_pool(queue.command_pool, None);
            }
            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
        info!("Device {} destroyed.", self.name);
    }
}
