//! Small value types shared by the draw context, atlases and surface.
//!
//! Window coordinates have their origin at the bottom-left corner with y
//! pointing up; conversions to Vulkan's top-left framebuffer space happen
//! where render areas are computed.

use glam::{Affine2, Vec2, Vec4};

/// Axis-aligned rectangle, stored as its minimum and maximum corner.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub min: Vec2,
    pub max: Vec2,
}

impl Rect {
    /// A rectangle covering any realistic window; the default clip rectangle.
    pub const LARGE: Rect = Rect {
        min: Vec2::splat(-16_777_216.0),
        max: Vec2::splat(16_777_216.0),
    };

    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            min: Vec2::new(x, y),
            max: Vec2::new(x + width, y + height),
        }
    }

    pub fn from_corners(a: Vec2, b: Vec2) -> Self {
        Self { min: a.min(b), max: a.max(b) }
    }

    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }

    pub fn size(&self) -> Vec2 {
        self.max - self.min
    }

    pub fn is_empty(&self) -> bool {
        self.max.x <= self.min.x || self.max.y <= self.min.y
    }

    /// Smallest rectangle containing both; an empty operand does not contribute.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            *other
        } else if other.is_empty() {
            *self
        } else {
            Rect { min: self.min.min(other.min), max: self.max.max(other.max) }
        }
    }

    /// Overlap of both rectangles, or the default empty rectangle.
    pub fn intersect(&self, other: &Rect) -> Rect {
        let r = Rect { min: self.min.max(other.min), max: self.max.min(other.max) };
        if r.is_empty() {
            Rect::default()
        } else {
            r
        }
    }

    /// Grows the rectangle outward so every edge lies on a multiple of `granularity`.
    pub fn round_out(&self, granularity: Vec2) -> Rect {
        if self.is_empty() {
            return *self;
        }
        let g = granularity.max(Vec2::ONE);
        Rect {
            min: (self.min / g).floor() * g,
            max: (self.max / g).ceil() * g,
        }
    }

    /// Shrinks (or grows, for a negative amount) every side by `amount`.
    pub fn inset(&self, amount: f32) -> Rect {
        Rect { min: self.min + amount, max: self.max - amount }
    }

    /// Corners in quad order: bottom-left, bottom-right, top-left, top-right.
    pub fn corners(&self) -> [Vec2; 4] {
        [
            self.min,
            Vec2::new(self.max.x, self.min.y),
            Vec2::new(self.min.x, self.max.y),
            self.max,
        ]
    }

    /// Packs the rectangle as `[left, bottom, right, top]` for vertex attributes.
    pub fn to_array(&self) -> [f32; 4] {
        [self.min.x, self.min.y, self.max.x, self.max.y]
    }
}

/// Linear RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color(pub Vec4);

impl Color {
    pub const TRANSPARENT: Color = Color(Vec4::ZERO);
    pub const BLACK: Color = Color(Vec4::new(0.0, 0.0, 0.0, 1.0));
    pub const WHITE: Color = Color(Vec4::ONE);

    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self(Vec4::new(r, g, b, a))
    }

    /// Half-float bit patterns for `R16G16B16A16_SFLOAT` attributes.
    pub fn to_f16_bits(self) -> [u16; 4] {
        let c = self.0.to_array();
        c.map(|v| half::f16::from_f32(v).to_bits())
    }
}

/// One color per quad corner, in quad order.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuadColor(pub [Color; 4]);

impl From<Color> for QuadColor {
    fn from(color: Color) -> Self {
        QuadColor([color; 4])
    }
}

/// Radius of each corner, in quad order.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CornerRadii(pub [f32; 4]);

impl CornerRadii {
    pub fn uniform(radius: f32) -> Self {
        Self([radius; 4])
    }
}

/// Where a border is drawn relative to a shape's edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BorderSide {
    /// Centered on the edge.
    #[default]
    On,
    Inside,
    Outside,
}

/// Placement of a widget's drawing: clip rectangle and transform to window
/// coordinates. `depth` orders overlapping widgets; larger values are nearer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawLayout {
    pub clipping_rectangle: Rect,
    pub to_window: Affine2,
    pub depth: f32,
}

impl Default for DrawLayout {
    fn default() -> Self {
        Self {
            clipping_rectangle: Rect::LARGE,
            to_window: Affine2::IDENTITY,
            depth: 0.0,
        }
    }
}

impl DrawLayout {
    pub fn new(clipping_rectangle: Rect, to_window: Affine2, depth: f32) -> Self {
        Self { clipping_rectangle, to_window, depth }
    }

    pub fn transform_point(&self, p: Vec2) -> Vec2 {
        self.to_window.transform_point2(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_ignores_empty_rectangles() {
        let a = Rect::new(10.0, 10.0, 5.0, 5.0);
        assert_eq!(a.union(&Rect::default()), a);
        assert_eq!(Rect::default().union(&a), a);
        let b = Rect::new(0.0, 12.0, 2.0, 10.0);
        assert_eq!(a.union(&b), Rect::from_corners(Vec2::new(0.0, 10.0), Vec2::new(15.0, 22.0)));
    }

    #[test]
    fn round_out_snaps_to_granularity() {
        let r = Rect::new(3.0, 17.0, 10.0, 10.0).round_out(Vec2::new(8.0, 16.0));
        assert_eq!(r, Rect::from_corners(Vec2::new(0.0, 16.0), Vec2::new(16.0, 32.0)));
    }

    #[test]
    fn disjoint_intersection_is_empty() {
        let a = Rect::new(0.0, 0.0, 1.0, 1.0);
        let b = Rect::new(2.0, 2.0, 1.0, 1.0);
        assert!(a.intersect(&b).is_empty());
    }
}
