//! Geometry - Polygon/Box Primitives
//!
//! ## Responsibilities
//!
//! - Points, axis-aligned bounding boxes, simple polygons
//! - Polygon area (shoelace)
//! - Box/polygon intersection by clipping the polygon against the box
//! - Overlap ratio, IoU, point-in-polygon
//!
//! The clip window is always the bounding box. A box is convex, so clipping an
//! arbitrary simple polygon (concave included) against it yields a region whose
//! signed area equals the true intersection area.

use serde::{Deserialize, Serialize};

/// Minimum number of vertices for a usable polygon
pub const MIN_POLYGON_POINTS: usize = 3;

/// 2D point in source-frame pixel units, serialized as `[x, y]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<[f64; 2]> for Point {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Point> for [f64; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Axis-aligned bounding box `[x, y, width, height]` (top-left origin)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BBox {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Finite coordinates and strictly positive extent
    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width > 0.0
            && self.height > 0.0
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    /// Corners in counter-clockwise order (y axis pointing down)
    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x, self.y),
            Point::new(self.max_x(), self.y),
            Point::new(self.max_x(), self.max_y()),
            Point::new(self.x, self.max_y()),
        ]
    }
}

impl From<[f64; 4]> for BBox {
    fn from([x, y, width, height]: [f64; 4]) -> Self {
        Self { x, y, width, height }
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

/// Whether a polygon has enough finite vertices to be matched against
pub fn is_usable_polygon(polygon: &[Point]) -> bool {
    polygon.len() >= MIN_POLYGON_POINTS
        && polygon.iter().all(|p| p.x.is_finite() && p.y.is_finite())
}

/// Unsigned polygon area (shoelace formula)
pub fn polygon_area(polygon: &[Point]) -> f64 {
    if polygon.len() < MIN_POLYGON_POINTS {
        return 0.0;
    }

    let twice_area: f64 = polygon
        .iter()
        .zip(polygon.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum();

    (twice_area / 2.0).abs()
}

/// Box edges used as clip planes
#[derive(Clone, Copy)]
enum Edge {
    Left(f64),
    Right(f64),
    Top(f64),
    Bottom(f64),
}

impl Edge {
    fn inside(&self, p: &Point) -> bool {
        match *self {
            Edge::Left(x) => p.x >= x,
            Edge::Right(x) => p.x <= x,
            Edge::Top(y) => p.y >= y,
            Edge::Bottom(y) => p.y <= y,
        }
    }

    /// Intersection of segment a-b with this edge's line
    fn intersect(&self, a: &Point, b: &Point) -> Point {
        match *self {
            Edge::Left(x) | Edge::Right(x) => {
                let t = (x - a.x) / (b.x - a.x);
                Point::new(x, a.y + t * (b.y - a.y))
            }
            Edge::Top(y) | Edge::Bottom(y) => {
                let t = (y - a.y) / (b.y - a.y);
                Point::new(a.x + t * (b.x - a.x), y)
            }
        }
    }
}

/// Clip a polygon to a bounding box (Sutherland-Hodgman)
pub fn clip_to_box(polygon: &[Point], bbox: &BBox) -> Vec<Point> {
    let edges = [
        Edge::Left(bbox.x),
        Edge::Right(bbox.max_x()),
        Edge::Top(bbox.y),
        Edge::Bottom(bbox.max_y()),
    ];

    let mut output: Vec<Point> = polygon.to_vec();

    for edge in edges {
        if output.is_empty() {
            break;
        }

        let input = std::mem::take(&mut output);
        let mut prev = input[input.len() - 1];

        for current in input {
            let cur_in = edge.inside(&current);
            let prev_in = edge.inside(&prev);

            if cur_in {
                if !prev_in {
                    output.push(edge.intersect(&prev, &current));
                }
                output.push(current);
            } else if prev_in {
                output.push(edge.intersect(&prev, &current));
            }

            prev = current;
        }
    }

    output
}

/// Area of the intersection between a box and a polygon
pub fn intersection_area(bbox: &BBox, polygon: &[Point]) -> f64 {
    if !bbox.is_valid() || polygon.len() < MIN_POLYGON_POINTS {
        return 0.0;
    }
    polygon_area(&clip_to_box(polygon, bbox))
}

/// Overlap ratio = intersection area / slot polygon area
///
/// A zero-area polygon yields 0.
pub fn overlap_ratio(bbox: &BBox, polygon: &[Point]) -> f64 {
    let slot_area = polygon_area(polygon);
    if slot_area <= 0.0 {
        return 0.0;
    }
    intersection_area(bbox, polygon) / slot_area
}

/// Intersection over union of a box and a polygon
pub fn iou(bbox: &BBox, polygon: &[Point]) -> f64 {
    let intersection = intersection_area(bbox, polygon);
    if intersection <= 0.0 {
        return 0.0;
    }

    let union = bbox.area() + polygon_area(polygon) - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Point-in-polygon test (even-odd ray casting)
pub fn contains_point(polygon: &[Point], point: Point) -> bool {
    if polygon.len() < MIN_POLYGON_POINTS {
        return false;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (pi, pj) = (polygon[i], polygon[j]);
        if (pi.y > point.y) != (pj.y > point.y)
            && point.x < (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}
