//! Page bookkeeping for the image atlas.
//!
//! Atlas textures are a fixed grid of square pages. Pages are plain indices
//! into the flat page space of all textures; the pool keeps a stack of free
//! indices and appends a texture's worth of pages when it runs dry.

use crate::error::{GfxError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Payload size of a page in pixels.
pub const PAGE_SIZE: u32 = 62;
/// Distance between pages in an atlas texture: the payload plus a 1 px border on each side.
pub const PAGE_STRIDE: u32 = PAGE_SIZE + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageIndex(pub u32);

#[derive(Debug)]
pub struct PagePool {
    free: Vec<PageIndex>,
    num_images: usize,
    pages_per_axis: u32,
    max_images: usize,
}

impl PagePool {
    pub fn new(pages_per_axis: u32, max_images: usize) -> Self {
        Self {
            free: Vec::new(),
            num_images: 0,
            pages_per_axis,
            max_images,
        }
    }

    pub fn pages_per_image(&self) -> usize {
        (self.pages_per_axis * self.pages_per_axis) as usize
    }

    /// Number of atlas textures the handed-out pages span.
    pub fn num_images(&self) -> usize {
        self.num_images
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Takes `count` pages, growing by whole textures as needed. On failure
    /// the pool is left unchanged.
    pub fn allocate(&mut self, count: usize) -> Result<Vec<PageIndex>> {
        let missing = count.saturating_sub(self.free.len());
        let images_needed = (missing + self.pages_per_image() - 1) / self.pages_per_image();
        if self.num_images + images_needed > self.max_images {
            return Err(GfxError::AtlasFull {
                atlas: "image",
                max_images: self.max_images,
            });
        }
        for _ in 0..images_needed {
            self.add_image();
        }

        let split = self.free.len() - count;
        Ok(self.free.split_off(split))
    }

    pub fn free(&mut self, pages: impl IntoIterator<Item = PageIndex>) {
        self.free.extend(pages);
    }

    fn add_image(&mut self) {
        let first = (self.num_images * self.pages_per_image()) as u32;
        // Pushed in reverse so the lowest index is handed out first.
        self.free
            .extend((first..first + self.pages_per_image() as u32).rev().map(PageIndex));
        self.num_images += 1;
        debug!("Image atlas grew to {} textures.", self.num_images);
    }

    /// Texel position of a page's payload inside its texture, and the texture index.
    pub fn atlas_position(&self, page: PageIndex) -> (u32, u32, u32) {
        let per_image = self.pages_per_image() as u32;
        let image = page.0 / per_image;
        let in_image = page.0 % per_image;
        (
            (in_image % self.pages_per_axis) * PAGE_STRIDE + 1,
            (in_image / self.pages_per_axis) * PAGE_STRIDE + 1,
            image,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// Pages are reserved but no pixels have reached the atlas.
    Drawing,
    Uploaded,
}

/// An image broken into atlas pages.
///
/// Not `Clone`: the pages belong to exactly one handle and go back to the pool
/// when the handle is dropped.
#[derive(Debug)]
pub struct PagedImage {
    width: u32,
    height: u32,
    pages: Vec<PageIndex>,
    pub(crate) state: ImageState,
    pool: Arc<Mutex<PagePool>>,
}

impl PagedImage {
    pub fn new(pool: &Arc<Mutex<PagePool>>, width: u32, height: u32) -> Result<Self> {
        let count = (Self::width_in_pages_for(width) * Self::height_in_pages_for(height)) as usize;
        let pages = pool.lock().allocate(count)?;
        Ok(Self {
            width,
            height,
            pages,
            state: ImageState::Drawing,
            pool: Arc::clone(pool),
        })
    }

    fn width_in_pages_for(width: u32) -> u32 {
        (width + PAGE_SIZE - 1) / PAGE_SIZE
    }

    fn height_in_pages_for(height: u32) -> u32 {
        (height + PAGE_SIZE - 1) / PAGE_SIZE
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width_in_pages(&self) -> u32 {
        Self::width_in_pages_for(self.width)
    }

    pub fn height_in_pages(&self) -> u32 {
        Self::height_in_pages_for(self.height)
    }

    /// Pages in row-major order, bottom row first.
    pub fn pages(&self) -> &[PageIndex] {
        &self.pages
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    /// Bottom-left texel of page `index` in the staging image, inside the 1 px border.
    pub fn staging_position(&self, index: usize) -> (u32, u32) {
        let columns = self.width_in_pages().max(1) as usize;
        (
            (index % columns) as u32 * PAGE_SIZE + 1,
            (index / columns) as u32 * PAGE_SIZE + 1,
        )
    }
}

impl Drop for PagedImage {
    fn drop(&mut self) {
        if !self.pages.is_empty() {
            self.pool.lock().free(std::mem::take(&mut self.pages));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn pool() -> Arc<Mutex<PagePool>> {
        Arc::new(Mutex::new(PagePool::new(4, 2)))
    }

    #[test]
    fn allocation_grows_by_whole_textures() {
        let pool = pool();
        let image = PagedImage::new(&pool, 62 * 5, 62 * 4).unwrap();
        assert_eq!(image.pages().len(), 20);
        assert_eq!(pool.lock().num_images(), 2);
        assert_eq!(pool.lock().free_count(), 12);
    }

    #[test]
    fn live_images_never_share_pages() {
        let pool = pool();
        let a = PagedImage::new(&pool, 100, 100).unwrap();
        let b = PagedImage::new(&pool, 200, 62).unwrap();
        let c = PagedImage::new(&pool, 1, 1).unwrap();
        let mut seen = BTreeSet::new();
        for page in a.pages().iter().chain(b.pages()).chain(c.pages()) {
            assert!(seen.insert(*page), "page {:?} handed out twice", page);
        }
    }

    #[test]
    fn freed_pages_are_reused() {
        let pool = pool();
        let first: BTreeSet<_> = {
            let image = PagedImage::new(&pool, 130, 70).unwrap();
            image.pages().iter().copied().collect()
        };
        assert_eq!(pool.lock().free_count(), 16);

        let again = PagedImage::new(&pool, 130, 70).unwrap();
        let second: BTreeSet<_> = again.pages().iter().copied().collect();
        assert_eq!(first, second);
        assert_eq!(pool.lock().num_images(), 1);
    }

    #[test]
    fn moved_image_returns_pages_once() {
        let pool = pool();
        let image = PagedImage::new(&pool, 62, 62).unwrap();
        let moved = image;
        assert_eq!(pool.lock().free_count(), 15);
        drop(moved);
        assert_eq!(pool.lock().free_count(), 16);
    }

    #[test]
    fn exhaustion_leaves_pool_untouched() {
        let pool = pool();
        let _big = PagedImage::new(&pool, 62 * 4, 62 * 4).unwrap();
        let err = PagedImage::new(&pool, 62 * 5, 62 * 4).unwrap_err();
        assert!(matches!(err, GfxError::AtlasFull { max_images: 2, .. }));
        assert_eq!(pool.lock().num_images(), 1);
        assert_eq!(pool.lock().free_count(), 0);
    }

    #[test]
    fn atlas_positions_skip_the_border() {
        let pool = PagePool::new(4, 2);
        assert_eq!(pool.atlas_position(PageIndex(0)), (1, 1, 0));
        assert_eq!(pool.atlas_position(PageIndex(5)), (65, 65, 0));
        assert_eq!(pool.atlas_position(PageIndex(16)), (1, 1, 1));
    }

    #[test]
    fn staging_positions_follow_page_columns() {
        let pool = pool();
        let image = PagedImage::new(&pool, 100, 100).unwrap();
        assert_eq!(image.staging_position(0), (1, 1));
        assert_eq!(image.staging_position(1), (63, 1));
        assert_eq!(image.staging_position(2), (1, 63));
    }
}
