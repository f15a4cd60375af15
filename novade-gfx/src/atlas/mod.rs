//! Texture atlases for glyphs and images, and the CPU-side helpers they share.

pub mod glyph;
pub mod image;
pub mod pages;
pub mod pixel_map;
pub mod sdf;
pub mod texture;

pub use glyph::{Glyph, GlyphAtlas, GlyphAtlasInfo, GlyphKey, ShelfPacker};
pub use image::{ImageAtlas, Rgba16f};
pub use pages::{ImageState, PageIndex, PagePool, PagedImage, PAGE_SIZE};
pub use pixel_map::{PixelBuffer, PixelMap};
pub use sdf::{Contour, GlyphOutline, Segment};
