/// A mutable 2-D view over pixels with a row stride, usable over both owned
/// buffers and mapped staging memory. Row 0 is the bottom row.
#[derive(Debug)]
pub struct PixelMap<'a, T> {
    data: &'a mut [T],
    width: usize,
    height: usize,
    stride: usize,
}

impl<'a, T: Copy> PixelMap<'a, T> {
    /// Returns `None` when `data` is too short for `height` rows of `stride` pixels.
    pub fn new(data: &'a mut [T], width: usize, height: usize, stride: usize) -> Option<Self> {
        if stride < width || (height > 0 && data.len() < (height - 1) * stride + width) {
            return None;
        }
        Some(Self { data, width, height, stride })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    pub fn get(&self, x: usize, y: usize) -> T {
        self.row(y)[x]
    }

    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.row_mut(y)[x] = value;
    }

    /// Copies `source` with its bottom-left corner at (`x`, `y`). The source
    /// must fit inside the map at that position.
    pub fn blit(&mut self, source: &PixelBuffer<T>, x: usize, y: usize) {
        debug_assert!(
            x + source.width <= self.width && y + source.height <= self.height,
            "{}x{} source does not fit a {}x{} map at ({}, {})",
            source.width,
            source.height,
            self.width,
            self.height,
            x,
            y
        );
        for row in 0..source.height {
            let src = source.row(row);
            self.row_mut(y + row)[x..x + src.len()].copy_from_slice(src);
        }
    }

    pub fn fill(&mut self, value: T) {
        for y in 0..self.height {
            self.row_mut(y).fill(value);
        }
    }
}

/// Owned, tightly packed pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

impl<T: Copy> PixelBuffer<T> {
    pub fn new(width: usize, height: usize, fill: T) -> Self {
        Self { width, height, data: vec![fill; width * height] }
    }

    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Option<Self> {
        (data.len() == width * height).then_some(Self { width, height, data })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn row(&self, y: usize) -> &[T] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn as_map(&mut self) -> PixelMap<'_, T> {
        PixelMap {
            data: &mut self.data,
            width: self.width,
            height: self.height,
            stride: self.width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit")]
    fn blit_outside_the_map_is_rejected() {
        let mut backing = vec![0u8; 4 * 3];
        let mut map = PixelMap::new(&mut backing, 3, 3, 4).unwrap();
        // Would land in the row padding without the check.
        map.blit(&PixelBuffer::new(2, 1, 1u8), 2, 0);
    }

    #[test]
    fn strided_rows_do_not_overlap() {
        let mut backing = vec![0u8; 4 * 3];
        let mut map = PixelMap::new(&mut backing, 3, 3, 4).unwrap();
        map.fill(7);
        assert_eq!(backing, [7, 7, 7, 0, 7, 7, 7, 0, 7, 7, 7, 0]);
    }

    #[test]
    fn short_backing_is_rejected() {
        let mut backing = vec![0u8; 7];
        assert!(PixelMap::new(&mut backing, 3, 3, 3).is_none());
    }

    #[test]
    fn blit_places_source_at_offset() {
        let source = PixelBuffer::from_vec(2, 1, vec![1u8, 2]).unwrap();
        let mut target = PixelBuffer::new(4, 2, 0u8);
        target.as_map().blit(&source, 1, 1);
        assert_eq!(target.row(0), &[0, 0, 0, 0]);
        assert_eq!(target.row(1), &[0, 1, 2, 0]);
    }
}
