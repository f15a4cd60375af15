//! Image atlas: bitmaps uploaded page by page into float16 atlas textures.
//!
//! Uploading goes through one linear staging image. The image is written with
//! a 1 px border at (1, 1); the border is filled with transparent copies of
//! the adjacent pixels and the rest of the last page row/column is cleared, so
//! bilinear sampling at page edges never picks up unrelated texels.

use super::pages::{ImageState, PageIndex, PagePool, PagedImage, PAGE_SIZE, PAGE_STRIDE};
use super::pixel_map::{PixelBuffer, PixelMap};
use super::texture::{linear_row_pitch, AtlasTexture};
use crate::allocator::GpuImage;
use crate::device::GfxDevice;
use crate::error::{GfxError, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocator;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Float16 RGBA texel as raw half-float bits.
pub type Rgba16f = [u16; 4];

pub const ATLAS_PAGES_PER_AXIS: u32 = 16;
pub const ATLAS_IMAGE_SIZE: u32 = ATLAS_PAGES_PER_AXIS * PAGE_STRIDE;
pub const ATLAS_MAX_IMAGES: usize = 16;
pub const STAGING_IMAGE_SIZE: u32 = 1024;
pub const ATLAS_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

const TEXEL_SIZE: u64 = std::mem::size_of::<Rgba16f>() as u64;

pub fn make_transparent(pixel: Rgba16f) -> Rgba16f {
    [pixel[0], pixel[1], pixel[2], 0]
}

fn ceil_to_page(v: usize) -> usize {
    let page = PAGE_SIZE as usize;
    (v + page - 1) / page * page
}

/// Fills the 1 px frame around a `width` x `height` image stored at (1, 1)
/// with transparent copies of the adjacent image pixels.
pub fn make_staging_border_transparent(map: &mut PixelMap<'_, Rgba16f>, width: usize, height: usize) {
    if width == 0 || height == 0 {
        return;
    }
    let top = height + 1;
    let right = width + 1;

    for x in 1..=width {
        let below = make_transparent(map.get(x, 1));
        map.set(x, 0, below);
        let above = make_transparent(map.get(x, height));
        map.set(x, top, above);
    }
    for y in 0..=top {
        let left = make_transparent(map.get(1, y));
        map.set(0, y, left);
        let far = make_transparent(map.get(width, y));
        map.set(right, y, far);
    }
}

/// Clears the staging area between the bordered image and the page-aligned
/// upload rectangle.
pub fn clear_staging_between_border_and_upload(map: &mut PixelMap<'_, Rgba16f>, width: usize, height: usize) {
    let border_right = width + 2;
    let border_top = height + 2;
    let upload_right = (ceil_to_page(width) + 2).min(map.width());
    let upload_top = (ceil_to_page(height) + 2).min(map.height());

    for y in 0..border_top.min(upload_top) {
        if border_right < upload_right {
            map.row_mut(y)[border_right..upload_right].fill([0; 4]);
        }
    }
    for y in border_top..upload_top {
        map.row_mut(y)[..upload_right].fill([0; 4]);
    }
}

/// Copies the bordered 64x64 block of every page from staging into the atlas
/// textures, grouped per texture.
pub fn page_copy_regions(pool: &PagePool, image: &PagedImage) -> Vec<Vec<vk::ImageCopy>> {
    let mut per_texture = vec![Vec::new(); pool.num_images()];
    for (index, page) in image.pages().iter().enumerate() {
        let (src_x, src_y) = image.staging_position(index);
        let (dst_x, dst_y, dst_z) = pool.atlas_position(*page);
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        per_texture[dst_z as usize].push(vk::ImageCopy {
            src_subresource: subresource,
            src_offset: vk::Offset3D { x: src_x as i32 - 1, y: src_y as i32 - 1, z: 0 },
            dst_subresource: subresource,
            dst_offset: vk::Offset3D { x: dst_x as i32 - 1, y: dst_y as i32 - 1, z: 0 },
            extent: vk::Extent3D { width: PAGE_STRIDE, height: PAGE_STRIDE, depth: 1 },
        });
    }
    per_texture
}

pub struct ImageAtlas {
    pool: Arc<Mutex<PagePool>>,
    textures: Vec<AtlasTexture>,
    staging: AtlasTexture,
    staging_offset: usize,
    staging_stride: usize,
    pub(crate) sampler: vk::Sampler,
}

impl ImageAtlas {
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
            GpuImage::new(raw, &mut allocator, "image atlas staging", &staging_info, MemoryLocation::CpuToGpu, None)?
        };
        let (staging_offset, staging_stride) = linear_row_pitch(raw, staging.image, TEXEL_SIZE);

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);
        let sampler = unsafe { raw.create_sampler(&sampler_info, None)? };

        let mut atlas = Self {
            pool: Arc::new(Mutex::new(PagePool::new(ATLAS_PAGES_PER_AXIS, ATLAS_MAX_IMAGES))),
            textures: Vec::new(),
            staging: AtlasTexture::new(staging, vk::ImageLayout::PREINITIALIZED),
            staging_offset,
            staging_stride,
            sampler,
        };
        // The descriptor array needs at least one texture to point at.
        atlas.add_atlas_texture(device)?;
        Ok(atlas)
    }

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
        let name = format!("image atlas texture {}", index);
        let mut allocator = device.allocator();
        let image = GpuImage::new(
            device.raw(),
            &mut allocator,
            &name,
            &info,
            MemoryLocation::GpuOnly,
            Some(vk::ImageAspectFlags::COLOR),
        )?;
        self.textures.push(AtlasTexture::new(image, vk::ImageLayout::UNDEFINED));
        info!("Image atlas texture {} added.", index);
        Ok(())
    }

    pub fn pool(&self) -> &Arc<Mutex<PagePool>> {
        &self.pool
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Views for the descriptor array; missing slots repeat the first texture.
    pub fn descriptor_views(&self, slots: usize) -> Vec<vk::ImageView> {
        (0..slots)
            .map(|i| self.textures.get(i).unwrap_or(&self.textures[0]).image.view)
            .collect()
    }

    /// Reserves atlas pages for a `width` x `height` image, adding textures as needed.
    pub fn make_image(&mut self, device: &GfxDevice, width: u32, height: u32) -> Result<PagedImage> {
        let max = (STAGING_IMAGE_SIZE - 2) / PAGE_SIZE * PAGE_SIZE;
        if width > max || height > max {
            return Err(GfxError::ImageTooLarge { width, height });
        }
        let image = PagedImage::new(&self.pool, width, height)?;
        let needed = self.pool.lock().num_images();
        while self.textures.len() < needed {
            self.add_atlas_texture(device)?;
        }
        Ok(image)
    }

    /// Copies `pixels` into the atlas pages reserved by `image`.
    pub fn upload(&mut self, device: &GfxDevice, image: &mut PagedImage, pixels: &PixelBuffer<Rgba16f>) -> Result<()> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        if pixels.width() != width || pixels.height() != height {
            return Err(GfxError::ResourceCreation {
                resource: "image upload",
                message: format!(
                    "pixel buffer is {}x{}, image is {}x{}",
                    pixels.width(),
                    pixels.height(),
                    width,
                    height
                ),
            });
        }

        if self.staging.layout != vk::ImageLayout::PREINITIALIZED && self.staging.layout != vk::ImageLayout::GENERAL {
            let staging = &mut self.staging;
            device.submit_one_shot(|cmd| staging.transition(device.raw(), cmd, vk::ImageLayout::GENERAL))?;
        }

        {
            let (offset, stride) = (self.staging_offset, self.staging_stride);
            let bytes = self.staging.image.mapped_bytes().ok_or(GfxError::ResourceCreation {
                resource: "image atlas staging",
                message: "staging memory is not host mapped".to_string(),
            })?;
            let end = offset + (bytes.len().saturating_sub(offset) / TEXEL_SIZE as usize) * TEXEL_SIZE as usize;
            let texels: &mut [Rgba16f] = bytemuck::try_cast_slice_mut(&mut bytes[offset..end]).map_err(|e| {
                GfxError::ResourceCreation {
                    resource: "image atlas staging",
                    message: format!("staging memory is not texel aligned: {}", e),
                }
            })?;
            let size = STAGING_IMAGE_SIZE as usize;
            let mut map = PixelMap::new(texels, size, size, stride).ok_or(GfxError::ResourceCreation {
                resource: "image atlas staging",
                message: "staging mapping is smaller than the image".to_string(),
            })?;
            map.blit(pixels, 1, 1);
            make_staging_border_transparent(&mut map, width, height);
            clear_staging_between_border_and_upload(&mut map, width, height);
        }

        let regions = page_copy_regions(&self.pool.lock(), image);
        let raw = device.raw();
        let staging = &mut self.staging;
        let textures = &mut self.textures;
        device.submit_one_shot(|cmd| {
            staging.transition(raw, cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            for (texture, regions) in textures.iter_mut().zip(&regions) {
                if regions.is_empty() {
                    continue;
                }
                texture.transition(raw, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                unsafe {
                    raw.cmd_copy_image(
                        cmd,
                        staging.image.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        texture.image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        regions,
                    );
                }
            }
            for texture in textures.iter_mut() {
                texture.transition(raw, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
            staging.transition(raw, cmd, vk::ImageLayout::GENERAL);
        })?;

        image.state = ImageState::Uploaded;
        debug!("Uploaded {}x{} image into {} atlas pages.", width, height, image.pages().len());
        Ok(())
    }

    /// Normalized texture coordinates of a page's payload and its texture index.
    pub fn page_uv(&self, page: PageIndex) -> ([f32; 2], [f32; 2], u32) {
        let (x, y, z) = self.pool.lock().atlas_position(page);
        let scale = 1.0 / ATLAS_IMAGE_SIZE as f32;
        (
            [x as f32 * scale, y as f32 * scale],
            [(x + PAGE_SIZE) as f32 * scale, (y + PAGE_SIZE) as f32 * scale],
            z,
        )
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

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba16f = [0x3c00, 0, 0, 0x3c00];

    fn staging_with_image(width: usize, height: usize) -> PixelBuffer<Rgba16f> {
        let mut staging = PixelBuffer::new(200, 200, [0x1111; 4]);
        let image = PixelBuffer::new(width, height, RED);
        staging.as_map().blit(&image, 1, 1);
        staging
    }

    #[test]
    fn border_copies_neighbours_with_zero_alpha() {
        let mut staging = staging_with_image(3, 2);
        let mut map = staging.as_map();
        make_staging_border_transparent(&mut map, 3, 2);
        let transparent_red = [0x3c00, 0, 0, 0];
        for x in 0..5 {
            assert_eq!(map.get(x, 0), transparent_red, "bottom border at {}", x);
            assert_eq!(map.get(x, 3), transparent_red, "top border at {}", x);
        }
        for y in 0..4 {
            assert_eq!(map.get(0, y), transparent_red);
            assert_eq!(map.get(4, y), transparent_red);
        }
        assert_eq!(map.get(2, 1), RED);
    }

    #[test]
    fn unused_upload_area_is_cleared() {
        let mut staging = staging_with_image(70, 10);
        let mut map = staging.as_map();
        make_staging_border_transparent(&mut map, 70, 10);
        clear_staging_between_border_and_upload(&mut map, 70, 10);
        // Upload rectangle is 126x64: two pages wide, one page high, plus borders.
        assert_eq!(map.get(72, 5), [0; 4]);
        assert_eq!(map.get(125, 5), [0; 4]);
        assert_eq!(map.get(10, 12), [0; 4]);
        assert_eq!(map.get(125, 63), [0; 4]);
        // Outside the upload rectangle nothing is touched.
        assert_eq!(map.get(126, 5), [0x1111; 4]);
        assert_eq!(map.get(5, 64), [0x1111; 4]);
        // The image and its border survive.
        assert_eq!(map.get(70, 10), RED);
        assert_eq!(map.get(71, 10)[3], 0);
    }

    #[test]
    fn copy_regions_cover_each_page_with_border() {
        let pool = Arc::new(Mutex::new(PagePool::new(ATLAS_PAGES_PER_AXIS, ATLAS_MAX_IMAGES)));
        let image = PagedImage::new(&pool, 100, 50).unwrap();
        let regions = page_copy_regions(&pool.lock(), &image);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].len(), 2);
        let second = &regions[0][1];
        assert_eq!(second.src_offset.x, 62);
        assert_eq!(second.src_offset.y, 0);
        assert_eq!(second.extent.width, PAGE_STRIDE);
        let (dst_x, dst_y, _) = pool.lock().atlas_position(image.pages()[1]);
        assert_eq!(second.dst_offset.x, dst_x as i32 - 1);
        assert_eq!(second.dst_offset.y, dst_y as i32 - 1);
    }
}
