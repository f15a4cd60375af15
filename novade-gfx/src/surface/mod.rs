//! A window's rendering surface: its build ladder, its frame bracket and the
//! delegates drawing underneath the toolkit.

pub mod delegate;
pub mod state;
pub mod vulkan;

pub use delegate::{DelegateId, SurfaceDelegate};
pub use state::{SurfaceBackend, SurfaceLimits, SurfaceLoss, SurfaceMachine, SurfaceState};
pub use vulkan::{FrameTarget, VulkanSurfaceBackend};

use crate::context::GraphicsContext;
use crate::device::GfxDevice;
use crate::draw_context::DrawContext;
use crate::error::Result;
use crate::geometry::Rect;
use crate::system::GfxSystem;
use crate::vertex_span::FrameSpans;
use ash::vk;
use state::classify_error;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters describing how frames went since the surface was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStatistics {
    /// Frames submitted and presented.
    pub frames: u64,
    /// Frames skipped because no swapchain image was ready.
    pub skipped_acquires: u64,
    /// Quads dropped because a vertex span was full.
    pub dropped_quads: u64,
    /// Glyph and image draws dropped because their atlas had no room.
    pub atlas_overflows: u64,
}

pub struct GfxSurface {
    context: Arc<GraphicsContext>,
    machine: SurfaceMachine<VulkanSurfaceBackend>,
    /// Vertex storage, lent to the draw context between `render_start` and `render_finish`.
    spans: Option<FrameSpans>,
    /// Target of the frame handed out by `render_start` and not yet finished.
    pending_frame: Option<FrameTarget>,
    statistics: FrameStatistics,
}

impl GfxSurface {
    pub(crate) fn new(system: Arc<GfxSystem>, handle: vk::SurfaceKHR) -> Self {
        let context = system.context().clone();
        let image_count = context.config().swapchain_image_count;
        Self {
            machine: SurfaceMachine::new(VulkanSurfaceBackend::new(system, handle), image_count),
            context,
            spans: Some(FrameSpans::default()),
            pending_frame: None,
            statistics: FrameStatistics::default(),
        }
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.machine.backend().surface()
    }

    pub fn state(&self) -> SurfaceState {
        self.machine.state()
    }

    pub fn loss(&self) -> SurfaceLoss {
        self.machine.loss()
    }

    pub fn size(&self) -> vk::Extent2D {
        self.machine.size()
    }

    pub fn device(&self) -> Option<Arc<GfxDevice>> {
        self.machine.backend().device()
    }

    pub fn statistics(&self) -> FrameStatistics {
        self.statistics
    }

    /// Attaches the surface to `device`. Switching from another device tears
    /// down everything built for the old one first. The device is built for
    /// on the next `update`.
    pub fn set_device(&mut self, device: Arc<GfxDevice>) {
        let context = self.context.clone();
        let _lock = context.lock();
        if self.state() == SurfaceState::NoWindow {
            warn!("Device attached to a surface without a window, ignored.");
            return;
        }
        if let Some(current) = self.machine.backend().device() {
            if Arc::ptr_eq(&current, &device) {
                return;
            }
            info!("Surface moves from device {} to {}.", current.name(), device.name());
            self.machine.on_device_lost();
        }
        self.machine.backend_mut().set_device(Some(device));
    }

    /// Asks the system for the best device for this surface and attaches it.
    pub fn attach_best_device(&mut self) -> Result<Arc<GfxDevice>> {
        let context = self.context.clone();
        let _lock = context.lock();
        let device = self.machine.backend().system().find_best_device(self.handle())?;
        self.set_device(device.clone());
        Ok(device)
    }

    /// Tears down whatever was lost and builds as far as possible for `size`.
    pub fn update(&mut self, size: vk::Extent2D) -> Result<SurfaceLoss> {
        let context = self.context.clone();
        let _lock = context.lock();
        self.machine.update(size)
    }

    pub fn on_resize(&mut self, size: vk::Extent2D) -> Result<SurfaceLoss> {
        let context = self.context.clone();
        let _lock = context.lock();
        self.machine.on_resize(size)
    }

    pub fn on_device_lost(&mut self) {
        let context = self.context.clone();
        let _lock = context.lock();
        self.machine.on_device_lost();
    }

    pub fn on_window_closed(&mut self) {
        let context = self.context.clone();
        let _lock = context.lock();
        self.machine.on_window_closed();
    }

    /// Starts a frame that repaints `dirty` (window coordinates, bottom-left
    /// origin). The returned context always accepts drawing; it only carries
    /// a frame when a swapchain image was acquired.
    pub fn render_start(&mut self, dirty: Rect) -> Result<DrawContext> {
        let context = self.context.clone();
        let _lock = context.lock();

        if let Some(abandoned) = self.pending_frame.take() {
            if abandoned.generation == self.machine.backend().generation() {
                // The acquired image and the reset fence can only be recovered by a rebuild.
                warn!("Previous frame was never finished, rebuilding the swapchain.");
                self.machine.mark_lost(SurfaceLoss::SwapchainLost);
                self.machine.teardown();
            }
        }

        let mut spans = self.spans.take().unwrap_or_default();
        spans.clear();
        let device = self.machine.backend().device();

        if self.state() != SurfaceState::HasSwapchain || dirty.is_empty() {
            return Ok(DrawContext::new(None, spans, device));
        }

        match self.machine.backend_mut().begin_frame(dirty) {
            Ok(Some(target)) => {
                self.pending_frame = Some(target);
                Ok(DrawContext::new(Some(target), spans, device))
            }
            Ok(None) => {
                self.statistics.skipped_acquires += 1;
                debug!("No swapchain image ready, frame skipped.");
                Ok(DrawContext::new(None, spans, device))
            }
            Err(e) => match classify_error(e) {
                Ok(loss) => {
                    info!("Frame start hit {:?}.", loss);
                    self.machine.mark_lost(loss);
                    self.machine.teardown();
                    Ok(DrawContext::new(None, spans, device))
                }
                Err(e) => {
                    self.spans = Some(spans);
                    Err(e)
                }
            },
        }
    }

    /// Submits and presents the frame drawn into `draw_context`, then tears
    /// down anything lost along the way.
    pub fn render_finish(&mut self, draw_context: DrawContext) -> Result<()> {
        let context = self.context.clone();
        let _lock = context.lock();

        let (frame, spans) = draw_context.into_parts();
        let dropped = spans.dropped();
        if dropped > 0 {
            self.statistics.dropped_quads += dropped;
            warn!("{} quads did not fit the vertex spans and were not drawn.", dropped);
        }
        let overflows = spans.atlas_overflows();
        if overflows > 0 {
            self.statistics.atlas_overflows += overflows;
            warn!("{} glyph or image draws did not fit their atlas and were dropped.", overflows);
        }

        let result = match frame {
            Some(target) if self.pending_frame == Some(target) => {
                self.pending_frame = None;
                let background = self.context.config().background_color;
                self.machine
                    .backend_mut()
                    .finish_frame(target, &spans, background)
                    .map(|()| self.statistics.frames += 1)
            }
            Some(_) => {
                debug!("Draw context does not belong to the pending frame, ignored.");
                Ok(())
            }
            None => Ok(()),
        };
        self.spans = Some(spans);

        let result = result.or_else(|e| {
            let loss = classify_error(e)?;
            info!("Frame finish hit {:?}.", loss);
            self.machine.mark_lost(loss);
            Ok(())
        });
        self.machine.teardown();
        result
    }

    /// Registers a delegate drawing underneath the toolkit and builds it up
    /// to the surface's current state.
    pub fn add_delegate(&mut self, delegate: Box<dyn SurfaceDelegate>) -> Result<DelegateId> {
        let context = self.context.clone();
        let _lock = context.lock();
        let state = self.state();
        self.machine.backend_mut().add_delegate(delegate, state)
    }

    /// Tears a delegate down from the current state and hands it back.
    pub fn remove_delegate(&mut self, id: DelegateId) -> Option<Box<dyn SurfaceDelegate>> {
        let context = self.context.clone();
        let _lock = context.lock();
        let state = self.state();
        self.machine.backend_mut().remove_delegate(id, state)
    }

    pub fn delegate_count(&self) -> usize {
        self.machine.backend().delegate_count()
    }
}

impl Drop for GfxSurface {
    fn drop(&mut self) {
        let context = self.context.clone();
        let _lock = context.lock();
        self.machine.on_window_closed();
    }
}
