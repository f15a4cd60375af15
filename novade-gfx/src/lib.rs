//! GPU surface lifecycle and rendering resources for the NovaDE toolkit.
//!
//! A [`GfxSystem`] owns the Vulkan instance and picks a [`GfxDevice`] per
//! window surface. Each [`GfxSurface`] climbs a build ladder (window, device,
//! swapchain) and tears it down again on loss. Frames are bracketed by
//! [`GfxSurface::render_start`] and [`GfxSurface::render_finish`]; in between
//! widgets draw into a [`DrawContext`], whose quads are rendered by five
//! pipelines sharing one render pass. Glyphs and images live in texture
//! atlases owned by the device.
//!
//! All GPU work happens under the reentrant lock of the shared
//! [`GraphicsContext`].

pub mod allocator;
pub mod atlas;
pub mod config;
pub mod context;
pub mod device;
pub mod draw_context;
pub mod error;
pub mod geometry;
pub mod pipeline;
pub mod render_pass;
pub mod scoring;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod system;
pub mod vertex_span;

pub use config::GfxConfig;
pub use context::GraphicsContext;
pub use device::GfxDevice;
pub use draw_context::{DrawAttribute, DrawAttributes, DrawContext, LineEndCap, PlacedGlyph};
pub use error::{GfxError, Result};
pub use geometry::{BorderSide, Color, CornerRadii, DrawLayout, QuadColor, Rect};
pub use pipeline::PipelineKind;
pub use surface::{
    DelegateId, FrameStatistics, FrameTarget, GfxSurface, SurfaceDelegate, SurfaceLoss, SurfaceState,
};
pub use system::GfxSystem;
