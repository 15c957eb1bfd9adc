//! Axis-aligned bounding box value type used for component bounds.

use serde::{Deserialize, Serialize};

/// An immutable axis-aligned rectangle in canvas coordinates.
///
/// Width and height are clamped to be non-negative at construction, so
/// derived edges always satisfy `left <= right` and `top <= bottom`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Horizontal extent, never negative.
    pub width: f64,
    /// Vertical extent, never negative.
    pub height: f64,
}

impl BoundingBox {
    /// Create a box at `(x, y)` with the given extents.
    ///
    /// Negative extents are clamped to zero.
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    /// Left edge.
    #[inline]
    pub fn left(&self) -> f64 {
        self.x
    }

    /// Right edge.
    #[inline]
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// Top edge.
    #[inline]
    pub fn top(&self) -> f64 {
        self.y
    }

    /// Bottom edge.
    #[inline]
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Center point `(cx, cy)`.
    #[inline]
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Area of the box.
    #[inline]
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Half-open containment test: `left <= x < right` and `top <= y < bottom`.
    ///
    /// The half-open rule means a point on a shared edge belongs to exactly
    /// one of two adjacent boxes.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.left() && x < self.right() && y >= self.top() && y < self.bottom()
    }

    /// Whether `other` lies entirely within this box (closed edges).
    pub fn contains_box(&self, other: &Self) -> bool {
        other.left() >= self.left()
            && other.right() <= self.right()
            && other.top() >= self.top()
            && other.bottom() <= self.bottom()
    }

    /// Whether this box and `other` intersect (closed edges, so boxes that
    /// merely touch still intersect).
    pub fn intersects(&self, other: &Self) -> bool {
        self.left() <= other.right()
            && other.left() <= self.right()
            && self.top() <= other.bottom()
            && other.top() <= self.bottom()
    }

    /// Area of the overlap rectangle with `other`, zero when disjoint.
    pub fn intersection_area(&self, other: &Self) -> f64 {
        let w = (self.right().min(other.right()) - self.left().max(other.left())).max(0.0);
        let h = (self.bottom().min(other.bottom()) - self.top().max(other.top())).max(0.0);
        w * h
    }

    /// Euclidean distance between the centers of the two boxes.
    pub fn center_distance(&self, other: &Self) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Euclidean distance from this box's center to a point.
    pub fn center_distance_to(&self, x: f64, y: f64) -> f64 {
        let (cx, cy) = self.center();
        ((cx - x).powi(2) + (cy - y).powi(2)).sqrt()
    }
}
