//! Vulkan implementation of the surface build ladder and the per-frame
//! record/submit/present sequence.

use super::delegate::{DelegateId, DelegateList, SurfaceDelegate};
use super::state::{SurfaceBackend, SurfaceLimits, SurfaceState};
use crate::atlas::texture::cmd_transition_layout;
use crate::device::GfxDevice;
use crate::error::{GfxError, Result};
use crate::geometry::Rect;
use crate::pipeline::{PipelineKind, PipelineSet};
use crate::render_pass::{clear_values, create_render_pass};
use crate::swapchain::{accumulate_scissor, render_area, Swapchain};
use crate::system::GfxSystem;
use crate::vertex_span::FrameSpans;
use ash::vk;
use glam::Vec2;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// The swapchain image acquired by `begin_frame`, with the area the frame
/// has to repaint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTarget {
    pub image_index: u32,
    /// Union of the redraw areas of every swapchain image, in window coordinates.
    pub scissor: Rect,
    pub extent: vk::Extent2D,
    /// Swapchain the image belongs to; a target outlives a rebuild only as a stale value.
    pub(crate) generation: u64,
}

pub struct VulkanSurfaceBackend {
    system: Arc<GfxSystem>,
    surface: vk::SurfaceKHR,
    device: Option<Arc<GfxDevice>>,
    pipelines: Option<PipelineSet>,
    delegates: DelegateList,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    swapchain: Option<Swapchain>,
    generation: u64,
    render_pass: vk::RenderPass,
    granularity: vk::Extent2D,
    command_buffer: vk::CommandBuffer,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    fence: vk::Fence,
}

impl VulkanSurfaceBackend {
    pub fn new(system: Arc<GfxSystem>, surface: vk::SurfaceKHR) -> Self {
        Self {
            system,
            surface,
            device: None,
            pipelines: None,
            delegates: DelegateList::default(),
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            swapchain: None,
            generation: 0,
            render_pass: vk::RenderPass::null(),
            granularity: vk::Extent2D { width: 1, height: 1 },
            command_buffer: vk::CommandBuffer::null(),
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            fence: vk::Fence::null(),
        }
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn system(&self) -> &Arc<GfxSystem> {
        &self.system
    }

    pub fn device(&self) -> Option<Arc<GfxDevice>> {
        self.device.clone()
    }

    pub fn set_device(&mut self, device: Option<Arc<GfxDevice>>) {
        self.device = device;
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn delegate_count(&self) -> usize {
        self.delegates.len()
    }

    fn require_device(&self) -> Result<Arc<GfxDevice>> {
        self.device.clone().ok_or(GfxError::DeviceLost)
    }

    fn require_swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().ok_or(GfxError::SwapchainOutOfDate)
    }

    fn create_semaphore(device: &GfxDevice) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        Ok(unsafe { device.raw().create_semaphore(&info, None)? })
    }

    /// Registers a delegate and builds it up to `state`. A delegate that fails
    /// to build is torn down again and not registered.
    pub fn add_delegate(&mut self, mut delegate: Box<dyn SurfaceDelegate>, state: SurfaceState) -> Result<DelegateId> {
        let mut semaphore = vk::Semaphore::null();
        if state >= SurfaceState::HasDevice {
            let device = self.require_device()?;
            delegate.build_for_new_device(&device)?;

            if state == SurfaceState::HasSwapchain {
                let built = Self::create_semaphore(&device).and_then(|s| {
                    semaphore = s;
                    let swapchain = self.require_swapchain()?;
                    delegate.build_for_new_swapchain(&swapchain.image_views(), swapchain.extent, swapchain.format)
                });
                if let Err(e) = built {
                    delegate.teardown_for_swapchain_lost();
                    delegate.teardown_for_device_lost();
                    if semaphore != vk::Semaphore::null() {
                        unsafe { device.raw().destroy_semaphore(semaphore, None) };
                    }
                    return Err(e);
                }
            }
        }

        let id = self.delegates.push(delegate);
        if let Some(entry) = self.delegates.get_mut(id) {
            entry.semaphore = semaphore;
        }
        debug!("Delegate {:?} added at {:?}.", id, state);
        Ok(id)
    }

    /// Unregisters a delegate, tearing it down from `state`.
    pub fn remove_delegate(&mut self, id: DelegateId, state: SurfaceState) -> Option<Box<dyn SurfaceDelegate>> {
        let mut entry = self.delegates.remove(id)?;
        if let Some(device) = &self.device {
            // The delegate may still be referenced by a frame in flight.
            device.wait_idle();
            if state == SurfaceState::HasSwapchain {
                entry.delegate.teardown_for_swapchain_lost();
            }
            if state >= SurfaceState::HasDevice {
                entry.delegate.teardown_for_device_lost();
            }
            if entry.semaphore != vk::Semaphore::null() {
                unsafe { device.raw().destroy_semaphore(entry.semaphore, None) };
            }
        }
        debug!("Delegate {:?} removed.", id);
        Some(entry.delegate)
    }

    /// Acquires a swapchain image for a frame repainting `dirty`. `None`
    /// means no image was ready and the frame should be skipped.
    pub fn begin_frame(&mut self, dirty: Rect) -> Result<Option<FrameTarget>> {
        debug_assert!(self.system.context().is_held(), "frame started without the graphics lock");
        let device = self.require_device()?;
        let granularity = Vec2::new(self.granularity.width as f32, self.granularity.height as f32);
        let dirty = dirty.round_out(granularity);

        let image_available = self.image_available;
        let swapchain = self.swapchain.as_mut().ok_or(GfxError::SwapchainOutOfDate)?;
        let Some(image_index) = swapchain.acquire(&device, image_available)? else {
            return Ok(None);
        };
        let scissor = accumulate_scissor(&mut swapchain.images, image_index as usize, dirty);
        let extent = swapchain.extent;

        // The previous frame's command buffer must be done before it is re-recorded.
        unsafe {
            device.raw().wait_for_fences(&[self.fence], true, u64::MAX)?;
            device.raw().reset_fences(&[self.fence])?;
        }
        trace!("Frame started on image {} with scissor {:?}.", image_index, scissor);
        Ok(Some(FrameTarget {
            image_index,
            scissor,
            extent,
            generation: self.generation,
        }))
    }

    /// Uploads the frame's vertices, lets the delegates draw, records the
    /// subpasses, submits and presents.
    pub fn finish_frame(&mut self, target: FrameTarget, spans: &FrameSpans, background: [f32; 4]) -> Result<()> {
        debug_assert!(self.system.context().is_held(), "frame finished without the graphics lock");
        if target.generation != self.generation || self.swapchain.is_none() {
            debug!("Dropping frame for a swapchain that no longer exists.");
            return Ok(());
        }
        let device = self.require_device()?;

        let wait = match self.record_frame(&device, target, spans, background) {
            Ok(wait) => wait,
            Err(e) => {
                // The fence was reset in begin_frame; leave it signalled so the next frame can wait on it.
                self.signal_fence(&device);
                return Err(e);
            }
        };

        let wait_semaphores = [wait];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffer];
        let signal_semaphores = [self.render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        if let Err(e) = unsafe {
            device
                .raw()
                .queue_submit(device.graphics_queue().queue, &[submit_info.build()], self.fence)
        } {
            self.signal_fence(&device);
            return Err(e.into());
        }

        self.require_swapchain()?
            .present(&device, target.image_index, self.render_finished)
    }

    fn record_frame(
        &mut self,
        device: &GfxDevice,
        target: FrameTarget,
        spans: &FrameSpans,
        background: [f32; 4],
    ) -> Result<vk::Semaphore> {
        device.prepare_atlases_for_rendering()?;
        let pipelines = self.pipelines.as_mut().ok_or(GfxError::DeviceLost)?;
        pipelines.update_atlas_descriptors()?;
        pipelines.upload(spans)?;

        let swapchain = self.swapchain.as_mut().ok_or(GfxError::SwapchainOutOfDate)?;
        let extent = swapchain.extent;
        let area = render_area(target.scissor, extent);

        let mut wait = self.image_available;
        for entry in self.delegates.iter_mut() {
            entry.delegate.draw(target.image_index, wait, entry.semaphore, area)?;
            wait = entry.semaphore;
        }

        let image = swapchain
            .images
            .get_mut(target.image_index as usize)
            .ok_or(GfxError::SwapchainOutOfDate)?;
        let raw = device.raw();
        let cmd = self.command_buffer;
        unsafe {
            raw.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            raw.begin_command_buffer(cmd, &begin_info)?;
        }

        // The swapchain attachment is loaded, never cleared, so it has to be
        // in the present layout before its first render pass.
        if !image.layout_is_present {
            cmd_transition_layout(raw, cmd, image.image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR);
            image.layout_is_present = true;
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let clear = clear_values(background);
        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(image.framebuffer)
            .render_area(area)
            .clear_values(&clear);
        unsafe {
            raw.cmd_set_viewport(cmd, 0, &[viewport]);
            raw.cmd_set_scissor(cmd, 0, &[area]);
            raw.cmd_begin_render_pass(cmd, &render_pass_begin, vk::SubpassContents::INLINE);
        }
        for (i, kind) in PipelineKind::ALL.into_iter().enumerate() {
            if i > 0 {
                unsafe { raw.cmd_next_subpass(cmd, vk::SubpassContents::INLINE) };
            }
            pipelines.draw_in_command_buffer(kind, cmd, extent);
        }
        unsafe {
            raw.cmd_end_render_pass(cmd);
            raw.end_command_buffer(cmd)?;
        }
        Ok(wait)
    }

    /// Signals the frame fence with an empty submit after a failed frame.
    fn signal_fence(&self, device: &GfxDevice) {
        let result = unsafe {
            device
                .raw()
                .queue_submit(device.graphics_queue().queue, &[], self.fence)
        };
        if let Err(e) = result {
            warn!("Could not signal the frame fence after a failed frame: {}", e);
        }
    }
}

impl SurfaceBackend for VulkanSurfaceBackend {
    fn has_device(&self) -> bool {
        self.device.is_some()
    }

    fn build_for_new_device(&mut self) -> Result<()> {
        let device = self.require_device()?;
        let score = device.score(self.system.surface_loader(), self.surface)?;
        let (Some(format), Some(present_mode)) = (score.surface_format, score.present_mode) else {
            return Err(GfxError::DeviceUnsuitable);
        };
        if !score.is_usable() {
            warn!("Device {} scored {} for this surface.", device.name(), score.total);
            return Err(GfxError::DeviceUnsuitable);
        }
        self.surface_format = format;
        self.present_mode = present_mode;
        self.pipelines = Some(PipelineSet::new(device.clone())?);

        for entry in self.delegates.iter_mut() {
            entry.delegate.build_for_new_device(&device)?;
        }
        info!(
            "Surface uses device {} with {:?}/{:?} and {:?}.",
            device.name(),
            format.format,
            format.color_space,
            present_mode
        );
        Ok(())
    }

    fn surface_limits(&mut self) -> Result<SurfaceLimits> {
        let device = self.require_device()?;
        let caps = unsafe {
            self.system
                .surface_loader()
                .get_physical_device_surface_capabilities(device.physical_device(), self.surface)?
        };
        Ok(SurfaceLimits::from_capabilities(&caps))
    }

    fn build_swapchain(&mut self, image_count: u32, extent: vk::Extent2D) -> Result<()> {
        let device = self.require_device()?;
        let swapchain = Swapchain::new(
            &device,
            self.surface,
            self.surface_format,
            self.present_mode,
            image_count,
            extent,
        )?;
        self.swapchain = Some(swapchain);
        self.generation += 1;
        Ok(())
    }

    fn build_render_pass(&mut self) -> Result<()> {
        let device = self.require_device()?;
        self.render_pass = create_render_pass(device.raw(), device.depth_format(), self.surface_format.format)?;
        self.granularity = device.render_area_granularity(self.render_pass);
        debug!(
            "Render area granularity {}x{}.",
            self.granularity.width, self.granularity.height
        );
        Ok(())
    }

    fn build_framebuffers(&mut self) -> Result<()> {
        let device = self.require_device()?;
        let render_pass = self.render_pass;
        let swapchain = self.swapchain.as_mut().ok_or(GfxError::SwapchainOutOfDate)?;
        swapchain.build_framebuffers(&device, render_pass)
    }

    fn build_command_buffers(&mut self) -> Result<()> {
        let device = self.require_device()?;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(device.graphics_queue().command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        self.command_buffer = unsafe { device.raw().allocate_command_buffers(&alloc_info)? }[0];
        Ok(())
    }

    fn build_semaphores(&mut self) -> Result<()> {
        let device = self.require_device()?;
        self.image_available = Self::create_semaphore(&device)?;
        self.render_finished = Self::create_semaphore(&device)?;
        // Signalled, so the first frame does not wait forever.
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        self.fence = unsafe { device.raw().create_fence(&fence_info, None)? };
        for entry in self.delegates.iter_mut() {
            entry.semaphore = Self::create_semaphore(&device)?;
        }
        Ok(())
    }

    fn build_pipelines_for_swapchain(&mut self) -> Result<()> {
        let swapchain = self.swapchain.as_ref().ok_or(GfxError::SwapchainOutOfDate)?;
        let pipelines = self.pipelines.as_mut().ok_or(GfxError::DeviceLost)?;
        pipelines.build_for_new_swapchain(self.render_pass, swapchain.color_view())?;

        let views = swapchain.image_views();
        for entry in self.delegates.iter_mut() {
            entry
                .delegate
                .build_for_new_swapchain(&views, swapchain.extent, swapchain.format)?;
        }
        Ok(())
    }

    fn wait_idle(&mut self) {
        if let Some(device) = &self.device {
            device.wait_idle();
        }
    }

    fn teardown_pipelines_for_swapchain(&mut self) {
        for entry in self.delegates.iter_mut() {
            entry.delegate.teardown_for_swapchain_lost();
        }
        if let Some(pipelines) = self.pipelines.as_mut() {
            pipelines.teardown_for_swapchain_lost();
        }
    }

    fn teardown_semaphores(&mut self) {
        let Some(device) = &self.device else { return };
        let raw = device.raw();
        unsafe {
            for entry in self.delegates.iter_mut() {
                if entry.semaphore != vk::Semaphore::null() {
                    raw.destroy_semaphore(entry.semaphore, None);
                    entry.semaphore = vk::Semaphore::null();
                }
            }
            for semaphore in [&mut self.image_available, &mut self.render_finished] {
                if *semaphore != vk::Semaphore::null() {
                    raw.destroy_semaphore(*semaphore, None);
                    *semaphore = vk::Semaphore::null();
                }
            }
            if self.fence != vk::Fence::null() {
                raw.destroy_fence(self.fence, None);
                self.fence = vk::Fence::null();
            }
        }
    }

    fn teardown_command_buffers(&mut self) {
        let Some(device) = &self.device else { return };
        if self.command_buffer != vk::CommandBuffer::null() {
            unsafe {
                device
                    .raw()
                    .free_command_buffers(device.graphics_queue().command_pool, &[self.command_buffer])
            };
            self.command_buffer = vk::CommandBuffer::null();
        }
    }

    fn teardown_framebuffers(&mut self) {
        let (Some(device), Some(swapchain)) = (&self.device, self.swapchain.as_mut()) else {
            return;
        };
        swapchain.teardown_framebuffers(device);
    }

    fn teardown_render_pass(&mut self) {
        let Some(device) = &self.device else { return };
        if self.render_pass != vk::RenderPass::null() {
            unsafe { device.raw().destroy_render_pass(self.render_pass, None) };
            self.render_pass = vk::RenderPass::null();
        }
    }

    fn teardown_swapchain(&mut self) {
        let (Some(device), Some(swapchain)) = (&self.device, self.swapchain.take()) else {
            return;
        };
        swapchain.destroy(device);
    }

    fn teardown_device(&mut self) {
        for entry in self.delegates.iter_mut() {
            entry.delegate.teardown_for_device_lost();
        }
        // Pipelines go before the device reference that may be the last one.
        self.pipelines = None;
        if let Some(device) = self.device.take() {
            info!("Surface released device {}.", device.name());
        }
    }

    fn teardown_window(&mut self) {
        if self.surface != vk::SurfaceKHR::null() {
            unsafe { self.system.surface_loader().destroy_surface(self.surface, None) };
            self.surface = vk::SurfaceKHR::null();
            info!("Platform surface destroyed.");
        }
    }
}
