//! Build and teardown ladder of a surface.
//!
//! The machine only decides *what* to build or tear down; the GPU work is done
//! by a [`SurfaceBackend`]. Builds climb one rung per call to [`SurfaceMachine::update`];
//! teardown is driven by the loss level and always runs in reverse build order.

use crate::error::{GfxError, Result};
use ash::vk;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SurfaceState {
    NoWindow,
    HasWindow,
    HasDevice,
    HasSwapchain,
}

/// What was lost, ordered by severity; each level implies the ones below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SurfaceLoss {
    #[default]
    None,
    SwapchainLost,
    DeviceLost,
    WindowLost,
}

/// Classifies an error from a build or frame step: losses are returned as a
/// level, anything else is passed on.
pub fn classify_error(err: GfxError) -> Result<SurfaceLoss> {
    match err {
        GfxError::SurfaceLost => Ok(SurfaceLoss::WindowLost),
        GfxError::SwapchainOutOfDate => Ok(SurfaceLoss::SwapchainLost),
        GfxError::DeviceLost | GfxError::DeviceUnsuitable => Ok(SurfaceLoss::DeviceLost),
        other => Err(other),
    }
}

/// Image count and extent bounds reported by the platform surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceLimits {
    pub min_image_count: u32,
    /// Zero means no upper bound.
    pub max_image_count: u32,
    pub min_extent: vk::Extent2D,
    pub max_extent: vk::Extent2D,
}

impl SurfaceLimits {
    pub fn from_capabilities(caps: &vk::SurfaceCapabilitiesKHR) -> Self {
        // A defined current extent pins the swapchain to the window size.
        if caps.current_extent.width != u32::MAX {
            Self {
                min_image_count: caps.min_image_count,
                max_image_count: caps.max_image_count,
                min_extent: caps.current_extent,
                max_extent: caps.current_extent,
            }
        } else {
            Self {
                min_image_count: caps.min_image_count,
                max_image_count: caps.max_image_count,
                min_extent: caps.min_image_extent,
                max_extent: caps.max_image_extent,
            }
        }
    }
}

/// Clamps a requested image count and extent to the surface limits. An
/// unbounded image count is capped at three.
pub fn clamp_swapchain(image_count: u32, extent: vk::Extent2D, limits: &SurfaceLimits) -> (u32, vk::Extent2D) {
    let max_count = if limits.max_image_count == 0 { 3 } else { limits.max_image_count };
    let count = image_count.min(max_count).max(limits.min_image_count);
    let extent = vk::Extent2D {
        width: extent.width.clamp(limits.min_extent.width, limits.max_extent.width.max(limits.min_extent.width)),
        height: extent.height.clamp(limits.min_extent.height, limits.max_extent.height.max(limits.min_extent.height)),
    };
    (count, extent)
}

/// GPU side of a surface, driven by [`SurfaceMachine`].
///
/// Build steps may fail with loss errors (`SurfaceLost`, `SwapchainOutOfDate`,
/// `DeviceLost`, `DeviceUnsuitable`); the machine unwinds the partial build.
/// Teardown steps must tolerate being called for objects that were never built.
pub trait SurfaceBackend {
    fn has_device(&self) -> bool;
    fn build_for_new_device(&mut self) -> Result<()>;
    fn surface_limits(&mut self) -> Result<SurfaceLimits>;
    fn build_swapchain(&mut self, image_count: u32, extent: vk::Extent2D) -> Result<()>;
    fn build_render_pass(&mut self) -> Result<()>;
    fn build_framebuffers(&mut self) -> Result<()>;
    fn build_command_buffers(&mut self) -> Result<()>;
    fn build_semaphores(&mut self) -> Result<()>;
    fn build_pipelines_for_swapchain(&mut self) -> Result<()>;

    fn wait_idle(&mut self);
    fn teardown_pipelines_for_swapchain(&mut self);
    fn teardown_semaphores(&mut self);
    fn teardown_command_buffers(&mut self);
    fn teardown_framebuffers(&mut self);
    fn teardown_render_pass(&mut self);
    fn teardown_swapchain(&mut self);
    fn teardown_device(&mut self);
    fn teardown_window(&mut self);
}

/// Swapchain-dependent build steps, in build order.
const SWAPCHAIN_STEPS: usize = 6;

fn build_step<B: SurfaceBackend>(backend: &mut B, step: usize, image_count: u32, extent: vk::Extent2D) -> Result<()> {
    match step {
        0 => backend.build_swapchain(image_count, extent),
        1 => backend.build_render_pass(),
        2 => backend.build_framebuffers(),
        3 => backend.build_command_buffers(),
        4 => backend.build_semaphores(),
        _ => backend.build_pipelines_for_swapchain(),
    }
}

fn teardown_step<B: SurfaceBackend>(backend: &mut B, step: usize) {
    match step {
        0 => backend.teardown_swapchain(),
        1 => backend.teardown_render_pass(),
        2 => backend.teardown_framebuffers(),
        3 => backend.teardown_command_buffers(),
        4 => backend.teardown_semaphores(),
        _ => backend.teardown_pipelines_for_swapchain(),
    }
}

#[derive(Debug)]
pub struct SurfaceMachine<B> {
    backend: B,
    state: SurfaceState,
    loss: SurfaceLoss,
    size: vk::Extent2D,
    image_count: u32,
}

impl<B: SurfaceBackend> SurfaceMachine<B> {
    /// A machine for a freshly created platform surface.
    pub fn new(backend: B, image_count: u32) -> Self {
        Self {
            backend,
            state: SurfaceState::HasWindow,
            loss: SurfaceLoss::None,
            size: vk::Extent2D::default(),
            image_count,
        }
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn loss(&self) -> SurfaceLoss {
        self.loss
    }

    /// Extent of the current swapchain, or the last requested size.
    pub fn size(&self) -> vk::Extent2D {
        self.size
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Records a loss; a lower level never overrides a higher one.
    pub fn mark_lost(&mut self, loss: SurfaceLoss) {
        if loss > self.loss {
            debug!("Surface loss escalated from {:?} to {:?}.", self.loss, loss);
            self.loss = loss;
        }
    }

    /// Brings the surface to `size`: rebuilds the swapchain if the size
    /// changed, tears down whatever was lost and builds as far as possible.
    ///
    /// Returns the loss hit while building, which is torn down on the next call.
    pub fn update(&mut self, size: vk::Extent2D) -> Result<SurfaceLoss> {
        if self.state == SurfaceState::HasSwapchain && size != self.size {
            self.mark_lost(SurfaceLoss::SwapchainLost);
        }
        self.teardown();
        self.build(size)
    }

    pub fn on_resize(&mut self, size: vk::Extent2D) -> Result<SurfaceLoss> {
        self.update(size)
    }

    pub fn on_device_lost(&mut self) {
        self.mark_lost(SurfaceLoss::DeviceLost);
        self.teardown();
    }

    pub fn on_window_closed(&mut self) {
        self.mark_lost(SurfaceLoss::WindowLost);
        self.teardown();
    }

    /// Tears down everything the current loss level invalidated, then clears the loss.
    pub fn teardown(&mut self) {
        if self.loss == SurfaceLoss::None {
            return;
        }

        if self.state == SurfaceState::HasSwapchain && self.loss >= SurfaceLoss::SwapchainLost {
            info!("Tearing down swapchain ({:?}).", self.loss);
            self.backend.wait_idle();
            for step in (0..SWAPCHAIN_STEPS).rev() {
                teardown_step(&mut self.backend, step);
            }
            self.state = SurfaceState::HasDevice;
        }

        if self.state == SurfaceState::HasDevice && self.loss >= SurfaceLoss::DeviceLost {
            info!("Tearing down device resources ({:?}).", self.loss);
            self.backend.wait_idle();
            self.backend.teardown_device();
            self.state = SurfaceState::HasWindow;
        }

        if self.state == SurfaceState::HasWindow && self.loss >= SurfaceLoss::WindowLost {
            info!("Tearing down window surface.");
            self.backend.teardown_window();
            self.state = SurfaceState::NoWindow;
        }

        self.loss = SurfaceLoss::None;
    }

    fn build(&mut self, size: vk::Extent2D) -> Result<SurfaceLoss> {
        if self.state == SurfaceState::HasWindow && self.backend.has_device() {
            match self.backend.build_for_new_device() {
                Ok(()) => {
                    self.state = SurfaceState::HasDevice;
                    info!("Surface built for new device.");
                }
                Err(e) => {
                    self.backend.teardown_device();
                    return self.record_build_error(e);
                }
            }
        }

        if self.state == SurfaceState::HasDevice {
            return self.build_swapchain(size);
        }
        Ok(SurfaceLoss::None)
    }

    fn build_swapchain(&mut self, size: vk::Extent2D) -> Result<SurfaceLoss> {
        if size.width == 0 || size.height == 0 {
            debug!("Zero-sized surface, swapchain not built.");
            return Ok(SurfaceLoss::None);
        }

        let limits = match self.backend.surface_limits() {
            Ok(limits) => limits,
            Err(e) => return self.record_build_error(e),
        };
        let (count, extent) = clamp_swapchain(self.image_count, size, &limits);
        if extent.width == 0 || extent.height == 0 {
            debug!("Surface reports a zero extent, swapchain not built.");
            return Ok(SurfaceLoss::None);
        }

        for step in 0..SWAPCHAIN_STEPS {
            if let Err(e) = build_step(&mut self.backend, step, count, extent) {
                warn!("Swapchain build step {} failed: {}", step, e);
                // The failing step may have created some of its objects before failing.
                for undo in (0..=step).rev() {
                    teardown_step(&mut self.backend, undo);
                }
                return self.record_build_error(e);
            }
        }

        self.size = size;
        self.state = SurfaceState::HasSwapchain;
        info!(
            "Swapchain built: {} images, {}x{} (requested {}x{}).",
            count, extent.width, extent.height, size.width, size.height
        );
        Ok(SurfaceLoss::None)
    }

    fn record_build_error(&mut self, err: GfxError) -> Result<SurfaceLoss> {
        let loss = classify_error(err)?;
        self.mark_lost(loss);
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct MockBackend {
        calls: Vec<String>,
        device: bool,
        limits: Option<SurfaceLimits>,
        fail_step: Option<(&'static str, fn() -> GfxError)>,
    }

    impl MockBackend {
        fn with_device() -> Self {
            Self {
                device: true,
                limits: Some(SurfaceLimits {
                    min_image_count: 2,
                    max_image_count: 3,
                    min_extent: vk::Extent2D { width: 640, height: 480 },
                    max_extent: vk::Extent2D { width: 1920, height: 1080 },
                }),
                ..Default::default()
            }
        }

        fn step(&mut self, name: &'static str) -> Result<()> {
            self.calls.push(name.to_string());
            match self.fail_step {
                Some((failing, make)) if failing == name => Err(make()),
                _ => Ok(()),
            }
        }

        fn record(&mut self, name: &str) {
            self.calls.push(name.to_string());
        }

        fn take_calls(&mut self) -> Vec<String> {
            std::mem::take(&mut self.calls)
        }
    }

    impl SurfaceBackend for MockBackend {
        fn has_device(&self) -> bool {
            self.device
        }
        fn build_for_new_device(&mut self) -> Result<()> {
            self.step("build_device")
        }
        fn surface_limits(&mut self) -> Result<SurfaceLimits> {
            self.limits.ok_or(GfxError::SurfaceLost)
        }
        fn build_swapchain(&mut self, image_count: u32, extent: vk::Extent2D) -> Result<()> {
            self.calls
                .push(format!("build_swapchain {} {}x{}", image_count, extent.width, extent.height));
            match self.fail_step {
                Some(("build_swapchain", make)) => Err(make()),
                _ => Ok(()),
            }
        }
        fn build_render_pass(&mut self) -> Result<()> {
            self.step("build_render_pass")
        }
        fn build_framebuffers(&mut self) -> Result<()> {
            self.step("build_framebuffers")
        }
        fn build_command_buffers(&mut self) -> Result<()> {
            self.step("build_command_buffers")
        }
        fn build_semaphores(&mut self) -> Result<()> {
            self.step("build_semaphores")
        }
        fn build_pipelines_for_swapchain(&mut self) -> Result<()> {
            self.step("build_pipelines")
        }
        fn wait_idle(&mut self) {
            self.record("wait_idle");
        }
        fn teardown_pipelines_for_swapchain(&mut self) {
            self.record("teardown_pipelines");
        }
        fn teardown_semaphores(&mut self) {
            self.record("teardown_semaphores");
        }
        fn teardown_command_buffers(&mut self) {
            self.record("teardown_command_buffers");
        }
        fn teardown_framebuffers(&mut self) {
            self.record("teardown_framebuffers");
        }
        fn teardown_render_pass(&mut self) {
            self.record("teardown_render_pass");
        }
        fn teardown_swapchain(&mut self) {
            self.record("teardown_swapchain");
        }
        fn teardown_device(&mut self) {
            self.record("teardown_device");
        }
        fn teardown_window(&mut self) {
            self.record("teardown_window");
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn built_machine() -> SurfaceMachine<MockBackend> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut machine = SurfaceMachine::new(MockBackend::with_device(), 3);
        assert_eq!(machine.update(extent(800, 600)).unwrap(), SurfaceLoss::None);
        assert_eq!(machine.state(), SurfaceState::HasSwapchain);
        machine.backend_mut().take_calls();
        machine
    }

    #[test]
    fn builds_device_then_swapchain_in_order() {
        let mut machine = SurfaceMachine::new(MockBackend::with_device(), 3);
        machine.update(extent(800, 600)).unwrap();
        assert_eq!(
            machine.backend_mut().take_calls(),
            [
                "build_device",
                "build_swapchain 3 800x600",
                "build_render_pass",
                "build_framebuffers",
                "build_command_buffers",
                "build_semaphores",
                "build_pipelines",
            ]
        );
    }

    #[test]
    fn image_count_is_clamped_independently_of_size() {
        let mut machine = SurfaceMachine::new(MockBackend::with_device(), 3);
        machine.update(extent(800, 600)).unwrap();
        assert!(machine.backend_mut().take_calls().contains(&"build_swapchain 3 800x600".to_string()));

        machine.update(extent(1920, 1080)).unwrap();
        assert!(machine.backend_mut().take_calls().contains(&"build_swapchain 3 1920x1080".to_string()));
        assert_eq!(machine.state(), SurfaceState::HasSwapchain);
    }

    #[test]
    fn clamp_respects_surface_limits() {
        let limits = MockBackend::with_device().limits.unwrap();
        assert_eq!(clamp_swapchain(5, extent(4000, 100), &limits), (3, extent(1920, 480)));
        assert_eq!(clamp_swapchain(1, extent(800, 600), &limits), (2, extent(800, 600)));

        let unbounded = SurfaceLimits { max_image_count: 0, ..limits };
        assert_eq!(clamp_swapchain(8, extent(800, 600), &unbounded).0, 3);
    }

    #[test]
    fn unchanged_size_is_a_no_op() {
        let mut machine = built_machine();
        assert_eq!(machine.update(extent(800, 600)).unwrap(), SurfaceLoss::None);
        assert!(machine.backend_mut().take_calls().is_empty());
    }

    #[test]
    fn resize_tears_down_in_reverse_order_then_rebuilds() {
        let mut machine = built_machine();
        machine.on_resize(extent(1024, 768)).unwrap();
        let calls = machine.backend_mut().take_calls();
        assert_eq!(
            &calls[..7],
            [
                "wait_idle",
                "teardown_pipelines",
                "teardown_semaphores",
                "teardown_command_buffers",
                "teardown_framebuffers",
                "teardown_render_pass",
                "teardown_swapchain",
            ]
        );
        assert_eq!(calls[7], "build_swapchain 3 1024x768");
        assert!(!calls.contains(&"teardown_device".to_string()));
        assert_eq!(machine.size(), extent(1024, 768));
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut machine = built_machine();
        machine.mark_lost(SurfaceLoss::SwapchainLost);
        machine.teardown();
        assert_eq!(machine.state(), SurfaceState::HasDevice);
        assert_eq!(machine.loss(), SurfaceLoss::None);
        machine.backend_mut().take_calls();

        machine.teardown();
        assert!(machine.backend_mut().take_calls().is_empty());
        assert_eq!(machine.state(), SurfaceState::HasDevice);
    }

    #[test]
    fn device_loss_cascades_through_the_swapchain() {
        let mut machine = built_machine();
        machine.on_device_lost();
        let calls = machine.backend_mut().take_calls();
        let swapchain = calls.iter().position(|c| c == "teardown_swapchain").unwrap();
        let device = calls.iter().position(|c| c == "teardown_device").unwrap();
        assert!(swapchain < device);
        assert_eq!(machine.state(), SurfaceState::HasWindow);
    }

    #[test]
    fn window_close_drops_to_no_window() {
        let mut machine = built_machine();
        machine.on_window_closed();
        assert_eq!(machine.state(), SurfaceState::NoWindow);
        assert_eq!(machine.backend_mut().take_calls().last().unwrap(), "teardown_window");

        // Nothing can be built without a window.
        machine.update(extent(800, 600)).unwrap();
        assert!(machine.backend_mut().take_calls().is_empty());
        assert_eq!(machine.state(), SurfaceState::NoWindow);
    }

    #[test]
    fn lower_loss_never_downgrades_a_higher_one() {
        let mut machine = built_machine();
        machine.mark_lost(SurfaceLoss::WindowLost);
        machine.mark_lost(SurfaceLoss::SwapchainLost);
        assert_eq!(machine.loss(), SurfaceLoss::WindowLost);
    }

    #[test]
    fn surface_lost_during_build_escalates_to_window_lost() {
        let mut backend = MockBackend::with_device();
        backend.fail_step = Some(("build_swapchain", || GfxError::SurfaceLost));
        let mut machine = SurfaceMachine::new(backend, 3);
        assert_eq!(machine.update(extent(800, 600)).unwrap(), SurfaceLoss::WindowLost);
        assert_eq!(machine.state(), SurfaceState::HasDevice);

        machine.update(extent(800, 600)).unwrap();
        assert_eq!(machine.state(), SurfaceState::NoWindow);
    }

    #[test]
    fn partial_build_is_unwound() {
        let mut backend = MockBackend::with_device();
        backend.fail_step = Some(("build_command_buffers", || GfxError::SwapchainOutOfDate));
        let mut machine = SurfaceMachine::new(backend, 3);
        assert_eq!(machine.update(extent(800, 600)).unwrap(), SurfaceLoss::SwapchainLost);
        assert_eq!(machine.state(), SurfaceState::HasDevice);

        let calls = machine.backend_mut().take_calls();
        let tail: Vec<_> = calls.iter().rev().take(4).rev().cloned().collect();
        assert_eq!(
            tail,
            [
                "teardown_command_buffers",
                "teardown_framebuffers",
                "teardown_render_pass",
                "teardown_swapchain",
            ]
        );
    }

    #[test]
    fn unknown_errors_propagate() {
        let mut backend = MockBackend::with_device();
        backend.fail_step = Some(("build_render_pass", || GfxError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)));
        let mut machine = SurfaceMachine::new(backend, 3);
        let err = machine.update(extent(800, 600)).unwrap_err();
        assert!(matches!(err, GfxError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)));
        assert_eq!(machine.state(), SurfaceState::HasDevice);
    }

    #[test]
    fn zero_size_stays_at_device() {
        let mut machine = SurfaceMachine::new(MockBackend::with_device(), 3);
        assert_eq!(machine.update(extent(0, 600)).unwrap(), SurfaceLoss::None);
        assert_eq!(machine.state(), SurfaceState::HasDevice);
    }

    #[test]
    fn without_a_device_the_surface_waits_at_window() {
        let mut machine = SurfaceMachine::new(MockBackend::default(), 3);
        machine.update(extent(800, 600)).unwrap();
        assert_eq!(machine.state(), SurfaceState::HasWindow);
        assert!(machine.backend_mut().take_calls().is_empty());
    }
}
