//! Signed distance field rasterisation of glyph outlines.

use super::pixel_map::PixelMap;
use crate::geometry::Rect;
use glam::{Affine2, Vec2};

/// Distance in pixels at which the field saturates.
pub const MAX_DISTANCE: f32 = 3.0;

/// Quadratic segments are flattened into this many lines.
const QUAD_SUBDIVISIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Segment {
    Line(Vec2, Vec2),
    /// Start, control point, end.
    Quad(Vec2, Vec2, Vec2),
}

impl Segment {
    fn transform(&self, m: &Affine2) -> Segment {
        match *self {
            Segment::Line(a, b) => Segment::Line(m.transform_point2(a), m.transform_point2(b)),
            Segment::Quad(a, c, b) => {
                Segment::Quad(m.transform_point2(a), m.transform_point2(c), m.transform_point2(b))
            }
        }
    }

    fn flatten_into(&self, lines: &mut Vec<(Vec2, Vec2)>) {
        match *self {
            Segment::Line(a, b) => lines.push((a, b)),
            Segment::Quad(a, c, b) => {
                let mut prev = a;
                for i in 1..=QUAD_SUBDIVISIONS {
                    let t = i as f32 / QUAD_SUBDIVISIONS as f32;
                    let u = 1.0 - t;
                    let p = a * (u * u) + c * (2.0 * u * t) + b * (t * t);
                    lines.push((prev, p));
                    prev = p;
                }
            }
        }
    }
}

/// A closed sequence of segments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contour {
    pub segments: Vec<Segment>,
}

impl Contour {
    /// A closed polygon through `points`.
    pub fn polygon(points: &[Vec2]) -> Self {
        let segments = points
            .iter()
            .zip(points.iter().cycle().skip(1))
            .map(|(a, b)| Segment::Line(*a, *b))
            .collect();
        Self { segments }
    }
}

/// Vector outline of a glyph, in em units with y pointing up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlyphOutline {
    pub contours: Vec<Contour>,
}

impl GlyphOutline {
    pub fn new(contours: Vec<Contour>) -> Self {
        Self { contours }
    }

    pub fn is_empty(&self) -> bool {
        self.contours.iter().all(|c| c.segments.is_empty())
    }

    /// Bounding box of all end and control points.
    pub fn bounding_box(&self) -> Rect {
        let mut min = Vec2::splat(f32::MAX);
        let mut max = Vec2::splat(f32::MIN);
        let mut include = |p: Vec2| {
            min = min.min(p);
            max = max.max(p);
        };
        for segment in self.contours.iter().flat_map(|c| &c.segments) {
            match *segment {
                Segment::Line(a, b) => {
                    include(a);
                    include(b);
                }
                Segment::Quad(a, c, b) => {
                    include(a);
                    include(c);
                    include(b);
                }
            }
        }
        if min.x > max.x {
            return Rect::default();
        }
        Rect::from_corners(min, max)
    }

    pub fn transform(&self, m: &Affine2) -> GlyphOutline {
        GlyphOutline {
            contours: self
                .contours
                .iter()
                .map(|c| Contour {
                    segments: c.segments.iter().map(|s| s.transform(m)).collect(),
                })
                .collect(),
        }
    }

    fn flatten(&self) -> Vec<(Vec2, Vec2)> {
        let mut lines = Vec::new();
        for segment in self.contours.iter().flat_map(|c| &c.segments) {
            segment.flatten_into(&mut lines);
        }
        lines
    }
}

fn distance_to_line(p: Vec2, a: Vec2, b: Vec2) -> f32 {
    let ab = b - a;
    let len2 = ab.length_squared();
    let t = if len2 > 0.0 { ((p - a).dot(ab) / len2).clamp(0.0, 1.0) } else { 0.0 };
    p.distance(a + ab * t)
}

/// Contribution of one edge to the winding number of a horizontal ray to the right of `p`.
fn winding(p: Vec2, a: Vec2, b: Vec2) -> i32 {
    let cross = |a: Vec2, b: Vec2| (b.x - a.x) * (p.y - a.y) - (p.x - a.x) * (b.y - a.y);
    if a.y <= p.y {
        if b.y > p.y && cross(a, b) > 0.0 {
            return 1;
        }
    } else if b.y <= p.y && cross(a, b) < 0.0 {
        return -1;
    }
    0
}

/// Signed distance normalised to snorm8: positive inside, saturating at `MAX_DISTANCE`.
pub fn encode_distance(distance: f32) -> i8 {
    ((distance / MAX_DISTANCE).clamp(-1.0, 1.0) * 127.0).round() as i8
}

/// Fills `map` with the signed distance field of `outline`, given in pixel
/// coordinates of the map. Pixel centers sit at half-integer positions.
pub fn rasterize(outline: &GlyphOutline, map: &mut PixelMap<'_, i8>) {
    let lines = outline.flatten();
    for y in 0..map.height() {
        for x in 0..map.width() {
            let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let mut nearest = f32::MAX;
            let mut wind = 0;
            for &(a, b) in &lines {
                nearest = nearest.min(distance_to_line(p, a, b));
                wind += winding(p, a, b);
            }
            let signed = if wind != 0 { nearest } else { -nearest };
            map.set(x, y, encode_distance(signed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::pixel_map::PixelBuffer;

    fn square(min: f32, max: f32) -> Contour {
        Contour::polygon(&[
            Vec2::new(min, min),
            Vec2::new(max, min),
            Vec2::new(max, max),
            Vec2::new(min, max),
        ])
    }

    fn field(outline: &GlyphOutline, size: usize) -> PixelBuffer<i8> {
        let mut buffer = PixelBuffer::new(size, size, 0i8);
        rasterize(outline, &mut buffer.as_map());
        buffer
    }

    #[test]
    fn square_is_positive_inside_and_negative_outside() {
        let outline = GlyphOutline::new(vec![square(5.0, 15.0)]);
        let sdf = field(&outline, 20);
        assert_eq!(sdf.row(10)[10], 127);
        assert_eq!(sdf.row(0)[0], -127);
        assert!(sdf.row(10)[5] > 0);
        assert!(sdf.row(10)[4] < 0);
        // Half a pixel from the edge.
        assert_eq!(sdf.row(10)[5], encode_distance(0.5));
    }

    #[test]
    fn contour_direction_does_not_matter() {
        let mut reversed = square(5.0, 15.0);
        reversed.segments = reversed
            .segments
            .iter()
            .rev()
            .map(|s| match *s {
                Segment::Line(a, b) => Segment::Line(b, a),
                other => other,
            })
            .collect();
        let forward = field(&GlyphOutline::new(vec![square(5.0, 15.0)]), 20);
        let backward = field(&GlyphOutline::new(vec![reversed]), 20);
        assert_eq!(forward, backward);
    }

    #[test]
    fn overlapping_contours_use_non_zero_winding() {
        let outline = GlyphOutline::new(vec![square(2.0, 12.0), square(8.0, 18.0)]);
        let sdf = field(&outline, 20);
        assert!(sdf.row(10)[10] > 0, "overlap is inside");
    }

    #[test]
    fn quadratic_segments_are_flattened() {
        let contour = Contour {
            segments: vec![
                Segment::Line(Vec2::new(2.0, 2.0), Vec2::new(18.0, 2.0)),
                Segment::Quad(Vec2::new(18.0, 2.0), Vec2::new(10.0, 30.0), Vec2::new(2.0, 2.0)),
            ],
        };
        let outline = GlyphOutline::new(vec![contour]);
        let bbox = outline.bounding_box();
        assert_eq!(bbox.max.y, 30.0);
        let sdf = field(&outline, 20);
        assert!(sdf.row(8)[10] > 0);
        assert!(sdf.row(8)[1] < 0);
    }

    #[test]
    fn empty_outline_has_empty_bounding_box() {
        let outline = GlyphOutline::default();
        assert!(outline.is_empty());
        assert!(outline.bounding_box().is_empty());
    }
}
