//! Error type and `Result` alias for the graphics subsystem.
//!
//! Vulkan return codes that signal swapchain, surface or device loss get their
//! own variants so the surface state machine can turn them into a loss level
//! instead of failing the caller.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GfxError {
    /// A Vulkan call failed with a code that has no dedicated variant.
    #[error("Vulkan API error: {0}")]
    Vulkan(vk::Result),

    /// The swapchain no longer matches the surface and must be rebuilt.
    #[error("Vulkan swapchain is out of date, needs recreation")]
    SwapchainOutOfDate,

    /// The platform surface is gone, usually because the window was destroyed.
    #[error("Vulkan surface lost")]
    SurfaceLost,

    #[error("Vulkan device lost")]
    DeviceLost,

    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("GPU memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("shader loading error: {0}")]
    ShaderLoading(String),

    #[error("missing required Vulkan extension: {0}")]
    MissingExtension(String),

    /// No physical device can present to the surface with the required features.
    #[error("no suitable physical device found")]
    NoSuitableDevice,

    /// The device attached to a surface scored zero or less for it.
    #[error("device is not suitable for this surface")]
    DeviceUnsuitable,

    #[error("{atlas} atlas is full ({max_images} images)")]
    AtlasFull { atlas: &'static str, max_images: usize },

    #[error("glyph of {width}x{height} pixels does not fit the staging image")]
    GlyphTooLarge { width: u32, height: u32 },

    #[error("image of {width}x{height} pixels does not fit the staging image")]
    ImageTooLarge { width: u32, height: u32 },

    #[error("resource creation failed for {resource}: {message}")]
    ResourceCreation { resource: &'static str, message: String },
}

impl From<vk::Result> for GfxError {
    fn from(err: vk::Result) -> Self {
        match err {
            vk::Result::ERROR_OUT_OF_DATE_KHR => GfxError::SwapchainOutOfDate,
            vk::Result::ERROR_SURFACE_LOST_KHR => GfxError::SurfaceLost,
            vk::Result::ERROR_DEVICE_LOST => GfxError::DeviceLost,
            _ => GfxError::Vulkan(err),
        }
    }
}

/// A `Result` alias defaulting the error type to `GfxError`.
pub type Result<T, E = GfxError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_codes_map_to_dedicated_variants() {
        assert!(matches!(GfxError::from(vk::Result::ERROR_OUT_OF_DATE_KHR), GfxError::SwapchainOutOfDate));
        assert!(matches!(GfxError::from(vk::Result::ERROR_SURFACE_LOST_KHR), GfxError::SurfaceLost));
        assert!(matches!(GfxError::from(vk::Result::ERROR_DEVICE_LOST), GfxError::DeviceLost));
        assert!(matches!(
            GfxError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            GfxError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
    }
}
