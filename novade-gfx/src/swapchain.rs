use crate::allocator::GpuImage;
use crate::device::GfxDevice;
use crate::error::{GfxError, Result};
use crate::geometry::Rect;
use crate::render_pass::COLOR_FORMAT;
use ash::prelude::VkResult;
use ash::vk;
use glam::Vec2;
use gpu_allocator::MemoryLocation;
use tracing::{debug, info};

/// Per-image state of the swapchain.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainImage {
    pub image: vk::Image,
    /// Null until the framebuffers are built.
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
    /// The area redrawn the last time this image was rendered.
    pub redraw_rect: Rect,
    /// Set once the image has been moved out of its undefined initial layout.
    pub layout_is_present: bool,
}

impl SwapchainImage {
    pub fn new(image: vk::Image) -> Self {
        Self {
            image,
            view: vk::ImageView::null(),
            framebuffer: vk::Framebuffer::null(),
            redraw_rect: Rect::default(),
            layout_is_present: false,
        }
    }
}

/// Records `dirty` as the redraw area of image `index` and returns the union
/// of the redraw areas of every image.
///
/// Images present content from older frames outside their own redraw area,
/// so each frame has to repaint what any image in the ring missed.
pub fn accumulate_scissor(images: &mut [SwapchainImage], index: usize, dirty: Rect) -> Rect {
    if let Some(image) = images.get_mut(index) {
        image.redraw_rect = dirty;
    }
    images
        .iter()
        .fold(Rect::default(), |sum, image| sum.union(&image.redraw_rect))
        .round_out(Vec2::ONE)
}

/// Clamps a scissor rectangle (bottom-left origin) to the extent and converts
/// it to a top-left origin render area.
pub fn render_area(scissor: Rect, extent: vk::Extent2D) -> vk::Rect2D {
    let bounds = Rect::new(0.0, 0.0, extent.width as f32, extent.height as f32);
    let clamped = scissor.intersect(&bounds).round_out(Vec2::ONE).intersect(&bounds);
    if clamped.is_empty() {
        return vk::Rect2D::default();
    }
    vk::Rect2D {
        offset: vk::Offset2D {
            x: clamped.min.x as i32,
            y: (extent.height as f32 - clamped.max.y) as i32,
        },
        extent: vk::Extent2D {
            width: clamped.width() as u32,
            height: clamped.height() as u32,
        },
    }
}

/// What a non-blocking acquire produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image(u32),
    /// An image was acquired, but the swapchain no longer matches the surface.
    Suboptimal,
    NotReady,
}

pub fn acquire_outcome(result: VkResult<(u32, bool)>) -> Result<Acquired> {
    match result {
        Ok((index, false)) => Ok(Acquired::Image(index)),
        Ok((_, true)) => Ok(Acquired::Suboptimal),
        Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Ok(Acquired::NotReady),
        Err(e) => Err(e.into()),
    }
}

/// The swapchain of a surface with the depth and offscreen color attachments
/// sized to match it.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<SwapchainImage>,
    pub depth: Option<GpuImage>,
    pub color: Option<GpuImage>,
}

impl Swapchain {
    pub fn new(
        device: &GfxDevice,
        surface: vk::SurfaceKHR,
        format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        image_count: u32,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            // Graphics and present always share one queue.
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let loader = device.swapchain_loader();
        let handle = unsafe { loader.create_swapchain(&create_info, None)? };
        let mut swapchain = Self {
            handle,
            format,
            present_mode,
            extent,
            images: Vec::new(),
            depth: None,
            color: None,
        };
        if let Err(e) = swapchain.create_attachments(device) {
            swapchain.destroy(device);
            return Err(e);
        }

        info!(
            "Swapchain created: {} images, {}x{}, {:?}/{:?}, {:?}.",
            swapchain.images.len(),
            extent.width,
            extent.height,
            format.format,
            format.color_space,
            present_mode
        );
        Ok(swapchain)
    }

    fn create_attachments(&mut self, device: &GfxDevice) -> Result<()> {
        let images = unsafe { device.swapchain_loader().get_swapchain_images(self.handle)? };
        self.images = images.into_iter().map(SwapchainImage::new).collect();

        let extent = vk::Extent3D {
            width: self.extent.width,
            height: self.extent.height,
            depth: 1,
        };
        let depth_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(device.depth_format())
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let color_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(COLOR_FORMAT)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::INPUT_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let raw = device.raw();
        let mut allocator = device.allocator();
        self.depth = Some(GpuImage::new(
            raw,
            &mut allocator,
            "depth attachment",
            &depth_info,
            MemoryLocation::GpuOnly,
            Some(vk::ImageAspectFlags::DEPTH),
        )?);
        self.color = Some(GpuImage::new(
            raw,
            &mut allocator,
            "color attachment",
            &color_info,
            MemoryLocation::GpuOnly,
            Some(vk::ImageAspectFlags::COLOR),
        )?);
        Ok(())
    }

    pub fn color_view(&self) -> vk::ImageView {
        self.color.as_ref().map_or(vk::ImageView::null(), |c| c.view)
    }

    pub fn image_views(&self) -> Vec<vk::ImageView> {
        self.images.iter().map(|i| i.view).collect()
    }

    /// Creates a view and a framebuffer for every swapchain image.
    pub fn build_framebuffers(&mut self, device: &GfxDevice, render_pass: vk::RenderPass) -> Result<()> {
        let raw = device.raw();
        let depth_view = self.depth.as_ref().map_or(vk::ImageView::null(), |d| d.view);
        let color_view = self.color_view();
        for image in self.images.iter_mut() {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image.image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            image.view = unsafe { raw.create_image_view(&view_info, None)? };

            let attachments = [depth_view, color_view, image.view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            image.framebuffer = unsafe { raw.create_framebuffer(&framebuffer_info, None)? };
        }
        debug!("{} framebuffers built.", self.images.len());
        Ok(())
    }

    pub fn teardown_framebuffers(&mut self, device: &GfxDevice) {
        let raw = device.raw();
        for image in self.images.iter_mut() {
            unsafe {
                if image.framebuffer != vk::Framebuffer::null() {
                    raw.destroy_framebuffer(image.framebuffer, None);
                }
                if image.view != vk::ImageView::null() {
                    raw.destroy_image_view(image.view, None);
                }
            }
            image.framebuffer = vk::Framebuffer::null();
            image.view = vk::ImageView::null();
        }
    }

    /// Acquires the next image without waiting. `None` means no image is
    /// ready yet and the frame should be skipped.
    pub fn acquire(&self, device: &GfxDevice, signal: vk::Semaphore) -> Result<Option<u32>> {
        let result =
            unsafe { device.swapchain_loader().acquire_next_image(self.handle, 0, signal, vk::Fence::null()) };
        match acquire_outcome(result)? {
            Acquired::Image(index) => Ok(Some(index)),
            Acquired::NotReady => Ok(None),
            Acquired::Suboptimal => {
                // The image is not drawn; its semaphore must still be waited on before reuse.
                device.consume_semaphore(signal)?;
                Err(GfxError::SwapchainOutOfDate)
            }
        }
    }

    /// Queues image `index` for presentation once `wait` is signalled.
    pub fn present(&self, device: &GfxDevice, index: u32, wait: vk::Semaphore) -> Result<()> {
        let wait_semaphores = [wait];
        let swapchains = [self.handle];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let queue = device.graphics_queue().queue;
        match unsafe { device.swapchain_loader().queue_present(queue, &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) => Err(GfxError::SwapchainOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    pub fn destroy(mut self, device: &GfxDevice) {
        self.teardown_framebuffers(device);
        {
            let mut allocator = device.allocator();
            if let Some(color) = self.color.take() {
                color.destroy(device.raw(), &mut allocator);
            }
            if let Some(depth) = self.depth.take() {
                depth.destroy(device.raw(), &mut allocator);
            }
        }
        unsafe { device.swapchain_loader().destroy_swapchain(self.handle, None) };
        debug!("Swapchain destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(count: usize) -> Vec<SwapchainImage> {
        (0..count).map(|_| SwapchainImage::new(vk::Image::null())).collect()
    }

    #[test]
    fn acquire_results_are_classified() {
        assert_eq!(acquire_outcome(Ok((2, false))).unwrap(), Acquired::Image(2));
        assert_eq!(acquire_outcome(Ok((1, true))).unwrap(), Acquired::Suboptimal);
        assert_eq!(acquire_outcome(Err(vk::Result::TIMEOUT)).unwrap(), Acquired::NotReady);
        assert_eq!(acquire_outcome(Err(vk::Result::NOT_READY)).unwrap(), Acquired::NotReady);
        assert!(matches!(
            acquire_outcome(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Err(GfxError::SwapchainOutOfDate)
        ));
        assert!(matches!(
            acquire_outcome(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(GfxError::SurfaceLost)
        ));
    }

    #[test]
    fn scissor_covers_every_image_redraw() {
        let mut ring = images(3);
        let first = Rect::new(10.0, 10.0, 20.0, 20.0);
        assert_eq!(accumulate_scissor(&mut ring, 0, first), first);

        let second = Rect::new(100.0, 50.0, 10.0, 10.0);
        let scissor = accumulate_scissor(&mut ring, 1, second);
        assert_eq!(scissor, Rect::from_corners(Vec2::new(10.0, 10.0), Vec2::new(110.0, 60.0)));

        // Image 0 comes round again with a small redraw; image 1's area is still stale on it.
        let third = Rect::new(12.0, 12.0, 1.0, 1.0);
        let scissor = accumulate_scissor(&mut ring, 0, third);
        assert_eq!(scissor, Rect::from_corners(Vec2::new(12.0, 12.0), Vec2::new(110.0, 60.0)));
    }

    #[test]
    fn scissor_is_rounded_to_whole_pixels() {
        let mut ring = images(2);
        let scissor = accumulate_scissor(&mut ring, 1, Rect::new(0.5, 0.25, 2.0, 2.0));
        assert_eq!(scissor, Rect::from_corners(Vec2::ZERO, Vec2::new(3.0, 3.0)));
    }

    #[test]
    fn render_area_is_clamped_and_flipped() {
        let extent = vk::Extent2D { width: 800, height: 600 };
        let area = render_area(Rect::new(-10.0, 500.0, 100.0, 200.0), extent);
        assert_eq!(area.offset, vk::Offset2D { x: 0, y: 0 });
        assert_eq!(area.extent, vk::Extent2D { width: 90, height: 100 });

        let area = render_area(Rect::new(10.0, 0.0, 20.0, 30.0), extent);
        assert_eq!(area.offset, vk::Offset2D { x: 10, y: 570 });
        assert_eq!(area.extent, vk::Extent2D { width: 20, height: 30 });
    }

    #[test]
    fn render_area_outside_the_window_is_empty() {
        let extent = vk::Extent2D { width: 800, height: 600 };
        assert_eq!(render_area(Rect::new(900.0, 0.0, 10.0, 10.0), extent), vk::Rect2D::default());
    }
}
