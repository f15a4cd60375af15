//! Per-frame drawing API used by widgets.
//!
//! Every draw call turns into quads appended to one of the frame's vertex
//! spans. Positions are transformed to window coordinates (bottom-left
//! origin) through the layout; line widths and corner radii are taken to be
//! in window units already. A full span drops the quad and counts it.

use crate::atlas::{Glyph, GlyphAtlasInfo, GlyphKey, ImageState, PagedImage, PAGE_SIZE};
use crate::device::GfxDevice;
use crate::error::{GfxError, Result};
use crate::geometry::{BorderSide, Color, CornerRadii, DrawLayout, QuadColor, Rect};
use crate::pipeline::vertex::{AlphaVertex, BoxVertex, ImageVertex, SdfVertex};
use crate::surface::FrameTarget;
use crate::vertex_span::FrameSpans;
use glam::Vec2;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Shape of the ends of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEndCap {
    #[default]
    Flat,
    Round,
}

/// One positional drawing attribute; its type decides which field it sets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawAttribute {
    Color(QuadColor),
    Width(f32),
    Border(BorderSide),
    Radii(CornerRadii),
    Clip(Rect),
    Cap(LineEndCap),
}

impl From<Color> for DrawAttribute {
    fn from(color: Color) -> Self {
        DrawAttribute::Color(color.into())
    }
}

impl From<QuadColor> for DrawAttribute {
    fn from(color: QuadColor) -> Self {
        DrawAttribute::Color(color)
    }
}

impl From<f32> for DrawAttribute {
    fn from(width: f32) -> Self {
        DrawAttribute::Width(width)
    }
}

impl From<BorderSide> for DrawAttribute {
    fn from(side: BorderSide) -> Self {
        DrawAttribute::Border(side)
    }
}

impl From<CornerRadii> for DrawAttribute {
    fn from(radii: CornerRadii) -> Self {
        DrawAttribute::Radii(radii)
    }
}

impl From<Rect> for DrawAttribute {
    fn from(clip: Rect) -> Self {
        DrawAttribute::Clip(clip)
    }
}

impl From<LineEndCap> for DrawAttribute {
    fn from(cap: LineEndCap) -> Self {
        DrawAttribute::Cap(cap)
    }
}

/// How a shape is drawn.
///
/// Built from positional attributes: the first color is the fill color, the
/// second the line color; the first cap sets both line ends, the second the
/// end cap only. A width, border side, radii or clip rectangle sets its field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawAttributes {
    pub fill_color: QuadColor,
    pub line_color: QuadColor,
    pub line_width: f32,
    pub border_side: BorderSide,
    pub corner_radii: CornerRadii,
    /// Further restricts the layout's clip rectangle, in local coordinates.
    pub clipping_rectangle: Rect,
    pub begin_line_cap: LineEndCap,
    pub end_line_cap: LineEndCap,
    num_colors: u8,
    num_caps: u8,
}

impl Default for DrawAttributes {
    fn default() -> Self {
        Self {
            fill_color: QuadColor::default(),
            line_color: QuadColor::default(),
            line_width: 0.0,
            border_side: BorderSide::On,
            corner_radii: CornerRadii::default(),
            clipping_rectangle: Rect::LARGE,
            begin_line_cap: LineEndCap::Flat,
            end_line_cap: LineEndCap::Flat,
            num_colors: 0,
            num_caps: 0,
        }
    }
}

impl DrawAttributes {
    pub fn with(mut self, attribute: impl Into<DrawAttribute>) -> Self {
        self.set(attribute.into());
        self
    }

    fn set(&mut self, attribute: DrawAttribute) {
        match attribute {
            DrawAttribute::Color(color) => {
                match self.num_colors {
                    0 => self.fill_color = color,
                    1 => self.line_color = color,
                    _ => debug_assert!(false, "at most two colors can be given"),
                }
                self.num_colors = self.num_colors.saturating_add(1);
            }
            DrawAttribute::Cap(cap) => {
                match self.num_caps {
                    0 => {
                        self.begin_line_cap = cap;
                        self.end_line_cap = cap;
                    }
                    1 => self.end_line_cap = cap,
                    _ => debug_assert!(false, "at most two line caps can be given"),
                }
                self.num_caps = self.num_caps.saturating_add(1);
            }
            DrawAttribute::Width(width) => self.line_width = width,
            DrawAttribute::Border(side) => self.border_side = side,
            DrawAttribute::Radii(radii) => self.corner_radii = radii,
            DrawAttribute::Clip(clip) => self.clipping_rectangle = clip,
        }
    }
}

impl FromIterator<DrawAttribute> for DrawAttributes {
    fn from_iter<I: IntoIterator<Item = DrawAttribute>>(iter: I) -> Self {
        let mut attributes = Self::default();
        for attribute in iter {
            attributes.set(attribute);
        }
        attributes
    }
}

/// A glyph positioned by the text shaper, in the layout's local coordinates.
#[derive(Clone, Copy)]
pub struct PlacedGlyph<'a> {
    pub glyph: &'a dyn Glyph,
    pub bounding_box: Rect,
    /// Overrides the fill color of the text.
    pub color: Option<QuadColor>,
}

/// Collects one frame's drawing. Returned by `GfxSurface::render_start` and
/// handed back to `GfxSurface::render_finish`.
pub struct DrawContext {
    frame: Option<FrameTarget>,
    spans: FrameSpans,
    device: Option<Arc<GfxDevice>>,
}

impl DrawContext {
    pub(crate) fn new(frame: Option<FrameTarget>, spans: FrameSpans, device: Option<Arc<GfxDevice>>) -> Self {
        Self { frame, spans, device }
    }

    /// True when a swapchain image was acquired; without one, drawing is
    /// accepted but never reaches the screen.
    pub fn is_frame(&self) -> bool {
        self.frame.is_some()
    }

    pub fn frame_buffer_index(&self) -> Option<u32> {
        self.frame.map(|f| f.image_index)
    }

    /// The part of the window being redrawn.
    pub fn scissor(&self) -> Rect {
        self.frame.map_or(Rect::default(), |f| f.scissor)
    }

    /// Whether `rect` (local coordinates) overlaps the part of the window
    /// being redrawn. Widgets use this to skip drawing.
    pub fn overlaps(&self, layout: &DrawLayout, rect: Rect) -> bool {
        !window_rect(layout, rect).intersect(&self.scissor()).is_empty()
    }

    pub fn spans(&self) -> &FrameSpans {
        &self.spans
    }

    pub(crate) fn into_parts(self) -> (Option<FrameTarget>, FrameSpans) {
        (self.frame, self.spans)
    }

    pub fn draw_box(&mut self, layout: &DrawLayout, rect: Rect, attributes: &DrawAttributes) {
        let half = attributes.line_width * 0.5;
        let (rect, adjust) = match attributes.border_side {
            BorderSide::On => (rect, 0.0),
            BorderSide::Inside => (rect.inset(half), -half),
            BorderSide::Outside => (rect.inset(-half), half),
        };
        let radii = CornerRadii(attributes.corner_radii.0.map(|r| (r + adjust).max(0.0)));
        let corners = rect.corners().map(|p| layout.transform_point(p));
        self.place_box(
            window_clip(layout, attributes),
            corners,
            layout.depth,
            attributes.fill_color,
            attributes.line_color,
            attributes.line_width,
            radii,
        );
    }

    /// Draws a line of `line_width` from `start` to `end` in the fill color.
    pub fn draw_line(&mut self, layout: &DrawLayout, start: Vec2, end: Vec2, attributes: &DrawAttributes) {
        let width = attributes.line_width;
        let half = width * 0.5;
        let direction = (end - start).try_normalize().unwrap_or(Vec2::X);
        let normal = direction.perp() * half;
        let cap_extent = |cap| if cap == LineEndCap::Round { half } else { 0.0 };
        let begin = start - direction * cap_extent(attributes.begin_line_cap);
        let end = end + direction * cap_extent(attributes.end_line_cap);

        let corners = [begin - normal, end - normal, begin + normal, end + normal].map(|p| layout.transform_point(p));
        let cap_radius = |cap| if cap == LineEndCap::Round { half } else { 0.0 };
        let (b, e) = (cap_radius(attributes.begin_line_cap), cap_radius(attributes.end_line_cap));
        self.place_box(
            window_clip(layout, attributes),
            corners,
            layout.depth,
            attributes.fill_color,
            QuadColor::default(),
            0.0,
            CornerRadii([b, e, b, e]),
        );
    }

    pub fn draw_circle(&mut self, layout: &DrawLayout, center: Vec2, radius: f32, attributes: &DrawAttributes) {
        let rect = Rect::new(center.x - radius, center.y - radius, radius * 2.0, radius * 2.0);
        let attributes = DrawAttributes {
            corner_radii: CornerRadii::uniform(radius),
            ..*attributes
        };
        self.draw_box(layout, rect, &attributes);
    }

    /// Draws the text cursor at `index` into `glyph_boxes` (one box per
    /// character, `index == len` meaning after the last one). Insertion mode
    /// draws a bar in the fill color; overwrite mode outlines the character
    /// in the line color.
    pub fn draw_cursor(
        &mut self,
        layout: &DrawLayout,
        glyph_boxes: &[Rect],
        index: usize,
        overwrite: bool,
        attributes: &DrawAttributes,
    ) {
        debug_assert!(index <= glyph_boxes.len(), "cursor index {} out of bounds", index);
        let Some(last) = glyph_boxes.last() else {
            return;
        };
        let width = attributes.line_width.max(1.0);

        if overwrite {
            if let Some(character) = glyph_boxes.get(index) {
                let outline = DrawAttributes {
                    fill_color: QuadColor::default(),
                    line_color: attributes.line_color,
                    line_width: width,
                    border_side: BorderSide::Inside,
                    ..*attributes
                };
                self.draw_box(layout, *character, &outline);
                return;
            }
        }

        let (x, bottom, top) = match glyph_boxes.get(index) {
            Some(character) => (character.min.x, character.min.y, character.max.y),
            None => (last.max.x, last.min.y, last.max.y),
        };
        let bar = Rect::new(x - width * 0.5, bottom, width, top - bottom);
        let fill = DrawAttributes {
            line_width: 0.0,
            corner_radii: CornerRadii::default(),
            ..*attributes
        };
        self.draw_box(layout, bar, &fill);
    }

    /// Draws `image` stretched over `rect`, one quad per atlas page. Returns
    /// false when the image is not uploaded yet.
    pub fn draw_image(&mut self, layout: &DrawLayout, rect: Rect, image: &PagedImage, attributes: &DrawAttributes) -> bool {
        if image.state() != ImageState::Uploaded || image.width() == 0 || image.height() == 0 {
            return false;
        }
        let Some(device) = self.device.clone() else {
            return false;
        };

        let clip = window_clip(layout, attributes);
        let columns = image.width_in_pages();
        let image_size = Vec2::new(image.width() as f32, image.height() as f32);
        let scale = rect.size() / image_size;

        let mut quads = Vec::with_capacity(image.pages().len());
        for (i, &page) in image.pages().iter().enumerate() {
            let (column, row) = (i as u32 % columns, i as u32 / columns);
            let page_min = Vec2::new((column * PAGE_SIZE) as f32, (row * PAGE_SIZE) as f32);
            let page_max = (page_min + Vec2::splat(PAGE_SIZE as f32)).min(image_size);
            let fraction = (page_max - page_min) / PAGE_SIZE as f32;

            let (uv_min, uv_max, texture) = match device.image_page_uv(page) {
                Ok(uv) => uv,
                Err(e) => {
                    debug!("Image page {:?} has no atlas position: {}", page, e);
                    self.spans.note_atlas_overflow();
                    return false;
                }
            };
            let uv_min = Vec2::from(uv_min);
            let uv_max = uv_min + (Vec2::from(uv_max) - uv_min) * fraction;
            let uvs = Rect::from_corners(uv_min, uv_max).corners();

            let quad_rect = Rect::from_corners(rect.min + page_min * scale, rect.min + page_max * scale);
            let corners = quad_rect.corners().map(|p| layout.transform_point(p));
            let vertices = [0usize, 1, 2, 3].map(|c| ImageVertex {
                position: [corners[c].x, corners[c].y, layout.depth],
                clipping_rectangle: clip.to_array(),
                atlas_position: [uvs[c].x, uvs[c].y, texture as f32],
            });
            quads.push(vertices);
        }
        for vertices in quads {
            self.spans.images.push_quad(vertices);
        }
        true
    }

    /// Draws a glyph filling `bounding_box` in the fill color. Returns false
    /// when it could not be drawn from the atlas.
    pub fn draw_glyph(
        &mut self,
        layout: &DrawLayout,
        bounding_box: Rect,
        glyph: &dyn Glyph,
        attributes: &DrawAttributes,
    ) -> bool {
        let clip = window_clip(layout, attributes);
        self.place_glyph(layout, clip, bounding_box, glyph, attributes.fill_color)
    }

    /// Draws shaped text; each glyph uses its own color or the fill color.
    pub fn draw_text<'a>(
        &mut self,
        layout: &DrawLayout,
        glyphs: impl IntoIterator<Item = PlacedGlyph<'a>>,
        attributes: &DrawAttributes,
    ) {
        let clip = window_clip(layout, attributes);
        for placed in glyphs {
            let color = placed.color.unwrap_or(attributes.fill_color);
            self.place_glyph(layout, clip, placed.bounding_box, placed.glyph, color);
        }
    }

    /// Replaces the alpha of everything drawn so far under `rect`; an alpha
    /// of zero punches a hole for content drawn by delegates.
    pub fn draw_alpha(&mut self, layout: &DrawLayout, rect: Rect, alpha: f32, attributes: &DrawAttributes) {
        let clip = window_clip(layout, attributes);
        let corners = rect.corners().map(|p| layout.transform_point(p));
        let vertices = corners.map(|p| AlphaVertex {
            position: [p.x, p.y, layout.depth],
            clipping_rectangle: clip.to_array(),
            alpha,
        });
        self.spans.alpha.push_quad(vertices);
    }

    fn place_glyph(&mut self, layout: &DrawLayout, clip: Rect, bounding_box: Rect, glyph: &dyn Glyph, color: QuadColor) -> bool {
        let Some(device) = self.device.clone() else {
            return false;
        };
        let lookup = device.glyph(glyph);
        self.place_glyph_lookup(layout, clip, bounding_box, glyph.key(), lookup, color)
    }

    /// Draws a glyph from the result of its atlas lookup. A glyph the atlas
    /// has no room for is dropped and counted.
    fn place_glyph_lookup(
        &mut self,
        layout: &DrawLayout,
        clip: Rect,
        bounding_box: Rect,
        key: GlyphKey,
        lookup: Result<(Option<GlyphAtlasInfo>, bool)>,
        color: QuadColor,
    ) -> bool {
        let info = match lookup {
            Ok((Some(info), added)) => {
                if added {
                    trace!("Glyph {:?} added to the atlas.", key);
                }
                info
            }
            // Nothing to draw, as for a space.
            Ok((None, _)) => return true,
            Err(e @ (GfxError::AtlasFull { .. } | GfxError::GlyphTooLarge { .. })) => {
                debug!("Glyph {:?} dropped: {}", key, e);
                self.spans.note_atlas_overflow();
                return false;
            }
            Err(e) => {
                warn!("Glyph {:?} could not be added to the atlas: {}", key, e);
                return false;
            }
        };

        let center = (bounding_box.min + bounding_box.max) * 0.5;
        let texture_coordinates = info.texture_coordinates();
        let corners = bounding_box
            .corners()
            .map(|p| layout.transform_point(center + (p - center) * info.border_scale));
        let vertices = [0usize, 1, 2, 3].map(|c| SdfVertex {
            position: [corners[c].x, corners[c].y, layout.depth],
            clipping_rectangle: clip.to_array(),
            texture_coordinate: texture_coordinates[c],
            color: color.0[c].to_f16_bits(),
        });
        self.spans.glyphs.push_quad(vertices)
    }

    #[allow(clippy::too_many_arguments)]
    fn place_box(
        &mut self,
        clip: Rect,
        corners: [Vec2; 4],
        depth: f32,
        fill: QuadColor,
        line: QuadColor,
        line_width: f32,
        radii: CornerRadii,
    ) -> bool {
        // Distances from the bottom-left and top-right corners, measured along the quad's own axes.
        let width = corners[0].distance(corners[1]);
        let height = corners[0].distance(corners[2]);
        let corner_coordinates = [
            [0.0, 0.0, width, height],
            [width, 0.0, 0.0, height],
            [0.0, height, width, 0.0],
            [width, height, 0.0, 0.0],
        ];
        let vertices = [0usize, 1, 2, 3].map(|c| BoxVertex {
            position: [corners[c].x, corners[c].y, depth],
            clipping_rectangle: clip.to_array(),
            corner_coordinate: corner_coordinates[c],
            fill_color: fill.0[c].to_f16_bits(),
            line_color: line.0[c].to_f16_bits(),
            line_width,
            corner_radii: radii.0,
        });
        self.spans.boxes.push_quad(vertices)
    }
}

/// Bounding rectangle of `rect` moved to window coordinates.
fn window_rect(layout: &DrawLayout, rect: Rect) -> Rect {
    let [a, b, c, d] = rect.corners().map(|p| layout.transform_point(p));
    Rect {
        min: a.min(b).min(c.min(d)),
        max: a.max(b).max(c.max(d)),
    }
}

/// The layout's clip rectangle narrowed by the attributes', in window coordinates.
fn window_clip(layout: &DrawLayout, attributes: &DrawAttributes) -> Rect {
    let local = layout.clipping_rectangle.intersect(&attributes.clipping_rectangle);
    if local.is_empty() {
        return Rect::default();
    }
    window_rect(layout, local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::PagePool;
    use glam::Affine2;
    use parking_lot::Mutex;

    fn context() -> DrawContext {
        DrawContext::new(None, FrameSpans::new(64), None)
    }

    fn translated(x: f32, y: f32) -> DrawLayout {
        DrawLayout::new(Rect::LARGE, Affine2::from_translation(Vec2::new(x, y)), 0.5)
    }

    fn positions<V: Copy>(vertices: &[V], position: impl Fn(&V) -> [f32; 3]) -> Vec<[f32; 2]> {
        vertices.iter().map(|v| {
            let p = position(v);
            [p[0], p[1]]
        }).collect()
    }

    #[test]
    fn positional_attributes_fill_fields_by_type() {
        let red = Color::new(1.0, 0.0, 0.0, 1.0);
        let blue = Color::new(0.0, 0.0, 1.0, 1.0);
        let clip = Rect::new(0.0, 0.0, 10.0, 10.0);
        let attributes = DrawAttributes::default()
            .with(red)
            .with(2.0)
            .with(blue)
            .with(BorderSide::Inside)
            .with(clip)
            .with(LineEndCap::Round);

        assert_eq!(attributes.fill_color, red.into());
        assert_eq!(attributes.line_color, blue.into());
        assert_eq!(attributes.line_width, 2.0);
        assert_eq!(attributes.border_side, BorderSide::Inside);
        assert_eq!(attributes.clipping_rectangle, clip);
        assert_eq!(attributes.begin_line_cap, LineEndCap::Round);
        assert_eq!(attributes.end_line_cap, LineEndCap::Round);
    }

    #[test]
    fn defaults_are_transparent_and_unclipped() {
        let attributes: DrawAttributes = [DrawAttribute::from(LineEndCap::Round), LineEndCap::Flat.into()]
            .into_iter()
            .collect();
        assert_eq!(attributes.fill_color, QuadColor::default());
        assert_eq!(attributes.line_width, 0.0);
        assert_eq!(attributes.border_side, BorderSide::On);
        assert_eq!(attributes.clipping_rectangle, Rect::LARGE);
        assert_eq!(attributes.begin_line_cap, LineEndCap::Round);
        assert_eq!(attributes.end_line_cap, LineEndCap::Flat);
    }

    #[test]
    fn box_is_transformed_and_carries_its_attributes() {
        let mut ctx = context();
        let attributes = DrawAttributes::default()
            .with(Color::WHITE)
            .with(Color::BLACK)
            .with(1.0)
            .with(CornerRadii::uniform(3.0));
        ctx.draw_box(&translated(100.0, 50.0), Rect::new(0.0, 0.0, 20.0, 10.0), &attributes);

        let vertices = ctx.spans().boxes.as_slice();
        assert_eq!(vertices.len(), 4);
        assert_eq!(
            positions(vertices, |v| v.position),
            [[100.0, 50.0], [120.0, 50.0], [100.0, 60.0], [120.0, 60.0]]
        );
        assert_eq!(vertices[0].position[2], 0.5);
        assert_eq!(vertices[0].corner_coordinate, [0.0, 0.0, 20.0, 10.0]);
        assert_eq!(vertices[3].corner_coordinate, [20.0, 10.0, 0.0, 0.0]);
        assert_eq!(vertices[1].fill_color, Color::WHITE.to_f16_bits());
        assert_eq!(vertices[1].line_color, Color::BLACK.to_f16_bits());
        assert_eq!(vertices[2].corner_radii, [3.0; 4]);
        let offset = Vec2::new(100.0, 50.0);
        let clip = Rect { min: Rect::LARGE.min + offset, max: Rect::LARGE.max + offset };
        assert_eq!(vertices[2].clipping_rectangle, clip.to_array());
    }

    #[test]
    fn border_side_moves_the_edge() {
        let mut ctx = context();
        let layout = DrawLayout::default();
        let rect = Rect::new(0.0, 0.0, 10.0, 10.0);
        let inside = DrawAttributes::default()
            .with(2.0)
            .with(BorderSide::Inside)
            .with(CornerRadii::uniform(4.0));
        ctx.draw_box(&layout, rect, &inside);
        let outside = DrawAttributes { border_side: BorderSide::Outside, ..inside };
        ctx.draw_box(&layout, rect, &outside);

        let vertices = ctx.spans().boxes.as_slice();
        assert_eq!(vertices[0].position, [1.0, 1.0, 0.0]);
        assert_eq!(vertices[3].position, [9.0, 9.0, 0.0]);
        assert_eq!(vertices[0].corner_radii, [3.0; 4]);
        assert_eq!(vertices[4].position, [-1.0, -1.0, 0.0]);
        assert_eq!(vertices[4].corner_radii, [5.0; 4]);
    }

    #[test]
    fn clip_rectangles_combine_in_window_space() {
        let mut ctx = context();
        let layout = DrawLayout::new(
            Rect::new(0.0, 0.0, 50.0, 50.0),
            Affine2::from_translation(Vec2::new(10.0, 20.0)),
            0.0,
        );
        let attributes = DrawAttributes::default().with(Rect::new(25.0, -5.0, 100.0, 10.0));
        ctx.draw_box(&layout, Rect::new(0.0, 0.0, 1.0, 1.0), &attributes);
        assert_eq!(ctx.spans().boxes.as_slice()[0].clipping_rectangle, [35.0, 20.0, 60.0, 25.0]);
    }

    #[test]
    fn round_capped_line_extends_past_its_ends() {
        let mut ctx = context();
        let attributes = DrawAttributes::default().with(Color::WHITE).with(4.0).with(LineEndCap::Round);
        ctx.draw_line(&DrawLayout::default(), Vec2::new(0.0, 0.0), Vec2::new(10.0, 0.0), &attributes);

        let vertices = ctx.spans().boxes.as_slice();
        assert_eq!(
            positions(vertices, |v| v.position),
            [[-2.0, -2.0], [12.0, -2.0], [-2.0, 2.0], [12.0, 2.0]]
        );
        assert_eq!(vertices[0].corner_radii, [2.0; 4]);
        assert_eq!(vertices[0].line_width, 0.0);
        assert_eq!(vertices[0].corner_coordinate, [0.0, 0.0, 14.0, 4.0]);
    }

    #[test]
    fn flat_end_cap_only_rounds_the_start() {
        let mut ctx = context();
        let attributes = DrawAttributes::default()
            .with(2.0)
            .with(LineEndCap::Round)
            .with(LineEndCap::Flat);
        ctx.draw_line(&DrawLayout::default(), Vec2::new(0.0, 0.0), Vec2::new(0.0, 10.0), &attributes);
        let vertices = ctx.spans().boxes.as_slice();
        assert_eq!(vertices[0].corner_radii, [1.0, 0.0, 1.0, 0.0]);
        assert_eq!(vertices[0].corner_coordinate, [0.0, 0.0, 11.0, 2.0]);
    }

    #[test]
    fn circle_is_a_fully_rounded_box() {
        let mut ctx = context();
        let attributes = DrawAttributes::default().with(Color::WHITE);
        ctx.draw_circle(&DrawLayout::default(), Vec2::new(5.0, 5.0), 3.0, &attributes);
        let vertices = ctx.spans().boxes.as_slice();
        assert_eq!(vertices[0].position, [2.0, 2.0, 0.0]);
        assert_eq!(vertices[3].position, [8.0, 8.0, 0.0]);
        assert_eq!(vertices[0].corner_radii, [3.0; 4]);
    }

    #[test]
    fn insertion_cursor_sits_before_the_character() {
        let mut ctx = context();
        let boxes = [Rect::new(0.0, 0.0, 8.0, 12.0), Rect::new(8.0, 0.0, 8.0, 12.0)];
        let attributes = DrawAttributes::default().with(Color::WHITE).with(2.0);
        ctx.draw_cursor(&DrawLayout::default(), &boxes, 1, false, &attributes);
        ctx.draw_cursor(&DrawLayout::default(), &boxes, 2, false, &attributes);

        let vertices = ctx.spans().boxes.as_slice();
        assert_eq!(vertices[0].position, [7.0, 0.0, 0.0]);
        assert_eq!(vertices[3].position, [9.0, 12.0, 0.0]);
        assert_eq!(vertices[4].position, [15.0, 0.0, 0.0]);
    }

    #[test]
    fn overwrite_cursor_outlines_the_character() {
        let mut ctx = context();
        let boxes = [Rect::new(0.0, 0.0, 8.0, 12.0)];
        let attributes = DrawAttributes::default().with(Color::WHITE).with(Color::BLACK);
        ctx.draw_cursor(&DrawLayout::default(), &boxes, 0, true, &attributes);

        let vertices = ctx.spans().boxes.as_slice();
        assert_eq!(vertices[0].fill_color, Color::TRANSPARENT.to_f16_bits());
        assert_eq!(vertices[0].line_color, Color::BLACK.to_f16_bits());
        assert_eq!(vertices[0].line_width, 1.0);
        assert_eq!(vertices[0].position, [0.5, 0.5, 0.0]);
    }

    #[test]
    fn cursor_without_text_draws_nothing() {
        let mut ctx = context();
        ctx.draw_cursor(&DrawLayout::default(), &[], 0, false, &DrawAttributes::default());
        assert!(ctx.spans().boxes.is_empty());
    }

    #[test]
    fn alpha_quad_carries_the_override() {
        let mut ctx = context();
        ctx.draw_alpha(&translated(1.0, 1.0), Rect::new(0.0, 0.0, 4.0, 4.0), 0.0, &DrawAttributes::default());
        let vertices = ctx.spans().alpha.as_slice();
        assert_eq!(vertices[0].position, [1.0, 1.0, 0.5]);
        assert_eq!(vertices[3].position, [5.0, 5.0, 0.5]);
        assert!(vertices.iter().all(|v| v.alpha == 0.0));
    }

    #[test]
    fn images_that_are_not_uploaded_are_not_drawn() {
        let pool = Arc::new(Mutex::new(PagePool::new(4, 1)));
        let image = PagedImage::new(&pool, 100, 70).unwrap();
        let mut ctx = context();
        assert!(!ctx.draw_image(&DrawLayout::default(), Rect::new(0.0, 0.0, 100.0, 70.0), &image, &DrawAttributes::default()));
        assert!(ctx.spans().images.is_empty());
    }

    #[test]
    fn full_span_drops_and_counts_quads() {
        let mut ctx = DrawContext::new(None, FrameSpans::new(1), None);
        let attributes = DrawAttributes::default();
        for _ in 0..3 {
            ctx.draw_box(&DrawLayout::default(), Rect::new(0.0, 0.0, 1.0, 1.0), &attributes);
        }
        assert_eq!(ctx.spans().boxes.quad_count(), 1);
        assert_eq!(ctx.spans().dropped(), 2);
    }

    #[test]
    fn context_without_frame_reports_no_index() {
        let ctx = context();
        assert!(!ctx.is_frame());
        assert_eq!(ctx.frame_buffer_index(), None);
        assert!(!ctx.overlaps(&DrawLayout::default(), Rect::new(0.0, 0.0, 10.0, 10.0)));
    }

    #[test]
    fn overlap_uses_the_scissor() {
        let target = FrameTarget {
            image_index: 1,
            scissor: Rect::new(0.0, 0.0, 100.0, 100.0),
            extent: ash::vk::Extent2D { width: 100, height: 100 },
            generation: 1,
        };
        let ctx = DrawContext::new(Some(target), FrameSpans::new(1), None);
        assert_eq!(ctx.frame_buffer_index(), Some(1));
        assert!(ctx.overlaps(&translated(90.0, 90.0), Rect::new(0.0, 0.0, 20.0, 20.0)));
        assert!(!ctx.overlaps(&translated(150.0, 0.0), Rect::new(0.0, 0.0, 20.0, 20.0)));
    }

    struct Square;

    impl Glyph for Square {
        fn key(&self) -> crate::atlas::GlyphKey {
            crate::atlas::GlyphKey { font_id: 0, glyph_id: 1 }
        }

        fn outline(&self) -> crate::atlas::sdf::GlyphOutline {
            let points = [Vec2::ZERO, Vec2::new(0.5, 0.0), Vec2::new(0.5, 0.5), Vec2::new(0.0, 0.5)];
            crate::atlas::sdf::GlyphOutline::new(vec![crate::atlas::sdf::Contour::polygon(&points)])
        }
    }

    #[test]
    fn glyphs_need_a_device() {
        let mut ctx = context();
        let layout = DrawLayout::default();
        let bbox = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert!(!ctx.draw_glyph(&layout, bbox, &Square, &DrawAttributes::default()));

        let placed = [PlacedGlyph { glyph: &Square, bounding_box: bbox, color: None }];
        ctx.draw_text(&layout, placed, &DrawAttributes::default());
        assert_eq!(ctx.spans().glyphs.quad_count(), 0);
        assert_eq!(ctx.spans().boxes.quad_count(), 0);
    }

    #[test]
    fn full_glyph_atlas_drops_and_counts_each_call() {
        let mut packer = crate::atlas::ShelfPacker::new(64, 1);
        let mut ctx = context();
        let layout = DrawLayout::default();
        let bbox = Rect::new(0.0, 0.0, 10.0, 10.0);

        let mut drawn = 0;
        for glyph_id in 0..4 {
            let lookup = packer.allocate(40, 40).map(|slot| {
                let info = GlyphAtlasInfo { slot, size: Vec2::splat(40.0), border_scale: Vec2::ONE };
                (Some(info), true)
            });
            let key = GlyphKey { font_id: 0, glyph_id };
            if ctx.place_glyph_lookup(&layout, Rect::LARGE, bbox, key, lookup, QuadColor::default()) {
                drawn += 1;
            }
            assert_eq!(ctx.spans().atlas_overflows(), glyph_id as u64);
        }

        assert_eq!(drawn, 1);
        assert_eq!(ctx.spans().glyphs.quad_count(), 1);
        assert_eq!(ctx.spans().boxes.quad_count(), 0);
        assert_eq!(ctx.spans().atlas_overflows(), 3);
    }

    #[test]
    fn other_glyph_errors_are_not_overflows() {
        let mut ctx = context();
        let key = GlyphKey { font_id: 0, glyph_id: 9 };
        let lookup = Err(GfxError::Vulkan(ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        let placed = ctx.place_glyph_lookup(
            &DrawLayout::default(),
            Rect::LARGE,
            Rect::new(0.0, 0.0, 1.0, 1.0),
            key,
            lookup,
            QuadColor::default(),
        );
        assert!(!placed);
        assert_eq!(ctx.spans().atlas_overflows(), 0);
        assert_eq!(ctx.spans().boxes.quad_count(), 0);
    }
}
