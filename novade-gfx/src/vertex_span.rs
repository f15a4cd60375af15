//! Fixed-capacity per-frame vertex collection.
//!
//! Spans live in host memory so a draw context works without a swapchain or
//! a device. `PipelineSet::upload` copies them once per frame into the
//! persistently mapped vertex buffers of the surface.

use crate::pipeline::vertex::{AlphaVertex, BoxVertex, ImageVertex, SdfVertex};
use tracing::trace;

/// Quads addressable with the shared 16-bit index buffer.
pub const MAX_QUADS: usize = 65536 / 4;
pub const MAX_VERTICES: usize = MAX_QUADS * 4;

/// Vertices for one pipeline and one frame. Storage is allocated once; quads
/// past the capacity are dropped and counted.
#[derive(Debug, Clone)]
pub struct VertexSpan<V> {
    vertices: Vec<V>,
    max_quads: usize,
    dropped: u64,
}

impl<V: Copy> VertexSpan<V> {
    pub fn new(max_quads: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(max_quads * 4),
            max_quads,
            dropped: 0,
        }
    }

    /// Empties the span for a new frame and resets the drop counter.
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.dropped = 0;
    }

    /// Appends one quad; returns `false` and counts the drop when the span is full.
    pub fn push_quad(&mut self, quad: [V; 4]) -> bool {
        if self.quad_count() >= self.max_quads {
            self.dropped += 1;
            trace!("Vertex span full, quad dropped ({} so far).", self.dropped);
            return false;
        }
        self.vertices.extend_from_slice(&quad);
        true
    }

    pub fn quad_count(&self) -> usize {
        self.vertices.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn max_quads(&self) -> usize {
        self.max_quads
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn as_slice(&self) -> &[V] {
        &self.vertices
    }
}

/// The vertex spans of every vertex-consuming pipeline, handed to the draw
/// context for one frame.
#[derive(Debug, Clone)]
pub struct FrameSpans {
    pub boxes: VertexSpan<BoxVertex>,
    pub images: VertexSpan<ImageVertex>,
    pub glyphs: VertexSpan<SdfVertex>,
    pub alpha: VertexSpan<AlphaVertex>,
    /// Draw calls dropped because a glyph or image had no place in its atlas.
    atlas_overflows: u64,
}

impl FrameSpans {
    pub fn new(max_quads: usize) -> Self {
        Self {
            boxes: VertexSpan::new(max_quads),
            images: VertexSpan::new(max_quads),
            glyphs: VertexSpan::new(max_quads),
            alpha: VertexSpan::new(max_quads),
            atlas_overflows: 0,
        }
    }

    pub fn clear(&mut self) {
        self.boxes.clear();
        self.images.clear();
        self.glyphs.clear();
        self.alpha.clear();
        self.atlas_overflows = 0;
    }

    pub fn note_atlas_overflow(&mut self) {
        self.atlas_overflows += 1;
        trace!("Atlas overflow, draw dropped ({} so far).", self.atlas_overflows);
    }

    pub fn atlas_overflows(&self) -> u64 {
        self.atlas_overflows
    }

    pub fn dropped(&self) -> u64 {
        self.boxes.dropped() + self.images.dropped() + self.glyphs.dropped() + self.alpha.dropped()
    }
}

impl Default for FrameSpans {
    fn default() -> Self {
        Self::new(MAX_QUADS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_and_counts_each_call() {
        let mut span = VertexSpan::<u32>::new(MAX_QUADS);
        for i in 0..MAX_QUADS as u32 {
            assert!(span.push_quad([i; 4]));
        }
        assert!(!span.push_quad([7; 4]));
        assert_eq!(span.dropped(), 1);
        assert!(!span.push_quad([8; 4]));
        assert_eq!(span.dropped(), 2);

        assert_eq!(span.quad_count(), MAX_QUADS);
        let last = &span.as_slice()[(MAX_QUADS - 1) * 4..];
        assert_eq!(last, &[MAX_QUADS as u32 - 1; 4]);
    }

    #[test]
    fn clear_starts_a_fresh_frame() {
        let mut span = VertexSpan::<u8>::new(1);
        span.push_quad([1; 4]);
        span.push_quad([2; 4]);
        span.clear();
        assert!(span.is_empty());
        assert_eq!(span.dropped(), 0);
        assert!(span.push_quad([3; 4]));
    }

    #[test]
    fn frame_spans_sum_drops() {
        let mut spans = FrameSpans::new(0);
        spans.alpha.push_quad([AlphaVertex::default(); 4]);
        spans.boxes.push_quad([BoxVertex::default(); 4]);
        assert_eq!(spans.dropped(), 2);
    }

    #[test]
    fn atlas_overflows_reset_with_the_frame() {
        let mut spans = FrameSpans::new(1);
        spans.note_atlas_overflow();
        spans.note_atlas_overflow();
        assert_eq!(spans.atlas_overflows(), 2);
        assert_eq!(spans.dropped(), 0);
        spans.clear();
        assert_eq!(spans.atlas_overflows(), 0);
    }
}
