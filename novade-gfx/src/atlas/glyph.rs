//! Glyph atlas: signed distance fields of glyphs, shelf-packed into snorm8 textures.

use super::pixel_map::PixelMap;
use super::sdf::{self, GlyphOutline, MAX_DISTANCE};
use super::texture::{linear_row_pitch, AtlasTexture};
use crate::allocator::GpuImage;
use crate::device::GfxDevice;
use crate::error::{GfxError, Result};
use ash::vk;
use glam::{Affine2, Vec2};
use gpu_allocator::vulkan::Allocator;
use gpu_allocator::MemoryLocation;
use std::collections::HashMap;
use tracing::{debug, info};

pub const ATLAS_IMAGE_SIZE: u32 = 256;
pub const ATLAS_MAX_IMAGES: usize = 128;
pub const STAGING_IMAGE_SIZE: u32 = 64;
pub const ATLAS_FORMAT: vk::Format = vk::Format::R8_SNORM;
/// Font size in pixels at which glyphs are rasterised into the atlas.
pub const DRAW_FONT_SIZE: f32 = 28.0;
/// Border around each glyph so the field fades out before the next glyph.
pub const DRAW_BORDER: f32 = MAX_DISTANCE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlyphKey {
    pub font_id: u32,
    pub glyph_id: u32,
}

/// A glyph as supplied by the text layer.
pub trait Glyph {
    fn key(&self) -> GlyphKey;

    /// Outline in em units, y pointing up.
    fn outline(&self) -> GlyphOutline;
}

/// Position of a rectangle handed out by the shelf packer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShelfSlot {
    pub x: u32,
    pub y: u32,
    pub layer: u32,
}

/// Row-by-row rectangle packer over a growing stack of square textures.
#[derive(Debug)]
pub struct ShelfPacker {
    image_size: u32,
    max_images: usize,
    cursor: ShelfSlot,
    row_height: u32,
    num_images: usize,
}

impl ShelfPacker {
    pub fn new(image_size: u32, max_images: usize) -> Self {
        Self {
            image_size,
            max_images,
            cursor: ShelfSlot { x: 0, y: 0, layer: 0 },
            row_height: 0,
            num_images: 1,
        }
    }

    /// Textures needed to hold everything allocated so far.
    pub fn num_images(&self) -> usize {
        self.num_images
    }

    /// Places a `width` x `height` rectangle after the previous one, wrapping
    /// to a new row or a new texture when it does not fit.
    pub fn allocate(&mut self, width: u32, height: u32) -> Result<ShelfSlot> {
        if width > self.image_size || height > self.image_size {
            return Err(GfxError::GlyphTooLarge { width, height });
        }

        let mut next = self.cursor;
        let mut row_height = self.row_height;
        if next.x + width > self.image_size {
            next.x = 0;
            next.y += row_height;
            row_height = 0;
        }
        if next.y + height > self.image_size {
            next = ShelfSlot { x: 0, y: 0, layer: next.layer + 1 };
            row_height = 0;
            if next.layer as usize >= self.max_images {
                return Err(GfxError::AtlasFull {
                    atlas: "glyph",
                    max_images: self.max_images,
                });
            }
        }

        self.num_images = self.num_images.max(next.layer as usize + 1);
        self.cursor = ShelfSlot { x: next.x + width, ..next };
        self.row_height = row_height.max(height);
        Ok(next)
    }
}

/// Where a glyph lives in the atlas and how to map it onto a quad.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlyphAtlasInfo {
    pub slot: ShelfSlot,
    /// Size of the rasterised image in texels, border included.
    pub size: Vec2,
    /// Factor to grow the glyph's bounding box by, from its center, so the
    /// quad also covers the border.
    pub border_scale: Vec2,
}

impl GlyphAtlasInfo {
    /// Texture coordinates in quad corner order, with the texture index as the third coordinate.
    pub fn texture_coordinates(&self) -> [[f32; 3]; 4] {
        let scale = 1.0 / ATLAS_IMAGE_SIZE as f32;
        let min = Vec2::new(self.slot.x as f32, self.slot.y as f32) * scale;
        let max = min + self.size * scale;
        let z = self.slot.layer as f32;
        [[min.x, min.y, z], [max.x, min.y, z], [min.x, max.y, z], [max.x, max.y, z]]
    }
}

/// Transform from em units into the staging image and the image size in
/// texels, for an outline with bounding box `bbox`.
pub fn draw_placement(bbox: crate::geometry::Rect) -> (Affine2, u32, u32) {
    let draw_min = bbox.min * DRAW_FONT_SIZE;
    let draw_size = bbox.size() * DRAW_FONT_SIZE + Vec2::splat(2.0 * DRAW_BORDER);
    let offset = Vec2::splat(DRAW_BORDER) - draw_min;
    let transform = Affine2::from_translation(offset) * Affine2::from_scale(Vec2::splat(DRAW_FONT_SIZE));
    (transform, draw_size.x.ceil() as u32, draw_size.y.ceil() as u32)
}

pub struct GlyphAtlas {
    packer: ShelfPacker,
    cache: HashMap<GlyphKey, Option<GlyphAtlasInfo>>,
    textures: Vec<AtlasTexture>,
    staging: AtlasTexture,
    staging_offset: usize,
    staging_stride: usize,
    pub(crate) sampler: vk::Sampler,
}

impl GlyphAtlas {
    pub fn new(device: &GfxDevice) -> Result<Self> {
        let raw = device.raw();
        let staging_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(ATLAS_FORMAT)
            .extent(vk::Extent3D { width: STAGING_IMAGE_SIZE, height: STAGING_IMAGE_SIZE, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);
        let staging = {
            let mut allocator = device.allocator();
            GpuImage::new(raw, &mut allocator, "glyph atlas staging", &staging_info, MemoryLocation::CpuToGpu, None)?
        };
        let (staging_offset, staging_stride) = linear_row_pitch(raw, staging.image, 1);

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);
        let sampler = unsafe { raw.create_sampler(&sampler_info, None)? };

        let mut atlas = Self {
            packer: ShelfPacker::new(ATLAS_IMAGE_SIZE, ATLAS_MAX_IMAGES),
            cache: HashMap::new(),
            textures: Vec::new(),
            staging: AtlasTexture::new(staging, vk::ImageLayout::PREINITIALIZED),
            staging_offset,
            staging_stride,
            sampler,
        };
        atlas.add_atlas_texture(device)?;
        Ok(atlas)
    }

    /// Appends a texture, cleared to "far outside" so unused texels never draw.
    fn add_atlas_texture(&mut self, device: &GfxDevice) -> Result<()> {
        let index = self.textures.len();
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(ATLAS_FORMAT)
            .extent(vk::Extent3D { width: ATLAS_IMAGE_SIZE, height: ATLAS_IMAGE_SIZE, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let name = format!("glyph atlas texture {}", index);
        let image = {
            let mut allocator = device.allocator();
            GpuImage::new(
                device.raw(),
                &mut allocator,
                &name,
                &info,
                MemoryLocation::GpuOnly,
                Some(vk::ImageAspectFlags::COLOR),
            )?
        };
        let mut texture = AtlasTexture::new(image, vk::ImageLayout::UNDEFINED);

        let raw = device.raw();
        device.submit_one_shot(|cmd| {
            texture.transition(raw, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            let clear = vk::ClearColorValue { float32: [-1.0; 4] };
            let range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };
            unsafe {
                raw.cmd_clear_color_image(cmd, texture.image.image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &clear, &[range]);
            }
        })?;

        self.textures.push(texture);
        info!("Glyph atlas texture {} added.", index);
        Ok(())
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn descriptor_views(&self, slots: usize) -> Vec<vk::ImageView> {
        (0..slots)
            .map(|i| self.textures.get(i).unwrap_or(&self.textures[0]).image.view)
            .collect()
    }

    /// Looks up a glyph, rasterising and uploading it on first use.
    ///
    /// Returns `None` for glyphs without an outline, and whether the glyph was newly added.
    pub fn get_or_add(&mut self, device: &GfxDevice, glyph: &dyn Glyph) -> Result<(Option<GlyphAtlasInfo>, bool)> {
        let key = glyph.key();
        if let Some(info) = self.cache.get(&key) {
            return Ok((*info, false));
        }
        let info = self.add_glyph(device, &glyph.outline())?;
        self.cache.insert(key, info);
        Ok((info, true))
    }

    fn add_glyph(&mut self, device: &GfxDevice, outline: &GlyphOutline) -> Result<Option<GlyphAtlasInfo>> {
        if outline.is_empty() {
            return Ok(None);
        }
        let bbox = outline.bounding_box();
        let (transform, width, height) = draw_placement(bbox);
        if width > STAGING_IMAGE_SIZE || height > STAGING_IMAGE_SIZE {
            return Err(GfxError::GlyphTooLarge { width, height });
        }

        let raw = device.raw();
        if self.staging.layout != vk::ImageLayout::PREINITIALIZED && self.staging.layout != vk::ImageLayout::GENERAL {
            let staging = &mut self.staging;
            device.submit_one_shot(|cmd| staging.transition(raw, cmd, vk::ImageLayout::GENERAL))?;
        }

        let slot = self.packer.allocate(width, height)?;
        while self.textures.len() < self.packer.num_images() {
            self.add_atlas_texture(device)?;
        }

        {
            let (offset, stride) = (self.staging_offset, self.staging_stride);
            let bytes = self.staging.image.mapped_bytes().ok_or(GfxError::ResourceCreation {
                resource: "glyph atlas staging",
                message: "staging memory is not host mapped".to_string(),
            })?;
            let texels: &mut [i8] = bytemuck::cast_slice_mut(&mut bytes[offset..]);
            let mut map = PixelMap::new(texels, width as usize, height as usize, stride).ok_or(
                GfxError::ResourceCreation {
                    resource: "glyph atlas staging",
                    message: "staging mapping is smaller than the glyph".to_string(),
                },
            )?;
            sdf::rasterize(&outline.transform(&transform), &mut map);
        }

        let region = vk::ImageCopy {
            src_subresource: color_layers(),
            src_offset: vk::Offset3D::default(),
            dst_subresource: color_layers(),
            dst_offset: vk::Offset3D { x: slot.x as i32, y: slot.y as i32, z: 0 },
            extent: vk::Extent3D { width, height, depth: 1 },
        };
        let staging = &mut self.staging;
        let texture = &mut self.textures[slot.layer as usize];
        device.submit_one_shot(|cmd| {
            staging.transition(raw, cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            texture.transition(raw, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            unsafe {
                raw.cmd_copy_image(
                    cmd,
                    staging.image.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    texture.image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            staging.transition(raw, cmd, vk::ImageLayout::GENERAL);
        })?;

        let draw_size = bbox.size() * DRAW_FONT_SIZE;
        let size = Vec2::new(width as f32, height as f32);
        let border_scale = Vec2::new(
            if draw_size.x > 0.0 { size.x / draw_size.x } else { 1.0 },
            if draw_size.y > 0.0 { size.y / draw_size.y } else { 1.0 },
        );
        debug!("Glyph of {}x{} texels added at {:?}.", width, height, slot);
        Ok(Some(GlyphAtlasInfo { slot, size, border_scale }))
    }

    /// Moves every texture to the sampled layout before a frame reads them.
    pub fn prepare_for_rendering(&mut self, device: &GfxDevice) -> Result<()> {
        if self.textures.iter().all(|t| t.layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) {
            return Ok(());
        }
        let raw = device.raw();
        let textures = &mut self.textures;
        device.submit_one_shot(|cmd| {
            for texture in textures.iter_mut() {
                texture.transition(raw, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
        })
    }

    pub fn destroy(self, device: &ash::Device, allocator: &mut Allocator) {
        unsafe { device.destroy_sampler(self.sampler, None) };
        for texture in self.textures {
            texture.image.destroy(device, allocator);
        }
        self.staging.image.destroy(device, allocator);
    }
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}
