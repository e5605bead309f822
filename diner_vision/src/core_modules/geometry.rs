// THEORY:
// Plain 2D geometry shared by every layer. Coordinates are "scene units": pixels for an
// uncalibrated camera, metres for one with a ground-plane homography applied upstream.
// Nothing here knows about time or identity.

use serde::{Deserialize, Serialize};

/// A 2D point in scene units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// An axis-aligned box given by its top-left and bottom-right corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// A box is usable when every corner is finite and it is not inverted.
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite())
            && self.x2 >= self.x1
            && self.y2 >= self.y1
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// The point where a standing person or a parked car touches the floor.
    /// Zone membership is evaluated here rather than at the box centre.
    pub fn footprint(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, self.y2)
    }
}

/// Which way a trajectory passed through a directed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CrossingDirection {
    /// Moved onto the positive (left-hand) side of `from -> to`.
    In,
    /// Moved onto the negative side.
    Out,
}

/// A closed polygon, vertices in order. The last vertex connects back to the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub vertices: Vec<Point>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>) -> Self {
        Self { vertices }
    }

    /// Even-odd ray casting.
    pub fn contains(&self, point: &Point) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[j];
            if (a.y > point.y) != (b.y > point.y) {
                let x_cross = (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x;
                if point.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

/// A directed line segment used for gate counting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineSegment {
    pub from: Point,
    pub to: Point,
}

impl LineSegment {
    pub fn new(from: Point, to: Point) -> Self {
        Self { from, to }
    }

    pub fn length(&self) -> f64 {
        self.from.distance(&self.to)
    }

    /// Signed area test: positive on the left of `from -> to`, negative on the right.
    pub fn side(&self, point: &Point) -> f64 {
        cross(&self.from, &self.to, point)
    }

    /// Returns the crossing direction when the step `previous -> current` passes through
    /// this segment. Touching the line is treated as still being on the negative side, so
    /// a trajectory that stops exactly on the line crosses once it leaves it.
    pub fn crossing(&self, previous: &Point, current: &Point) -> Option<CrossingDirection> {
        let was_positive = self.side(previous) > 0.0;
        let is_positive = self.side(current) > 0.0;
        if was_positive == is_positive {
            return None;
        }
        if !segments_intersect(previous, current, &self.from, &self.to) {
            return None;
        }
        if is_positive {
            Some(CrossingDirection::In)
        } else {
            Some(CrossingDirection::Out)
        }
    }
}

/// The visible extent of one camera, used to decide when an entity has walked out of shot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldOfView {
    pub width: f64,
    pub height: f64,
    /// Distance from the frame border inside which a lost entity is assumed to have left.
    #[serde(default = "default_edge_margin")]
    pub edge_margin: f64,
}

fn default_edge_margin() -> f64 {
    40.0
}

impl FieldOfView {
    pub fn near_edge(&self, point: &Point) -> bool {
        point.x <= self.edge_margin
            || point.y <= self.edge_margin
            || point.x >= self.width - self.edge_margin
            || point.y >= self.height - self.edge_margin
    }
}

fn cross(a: &Point, b: &Point, c: &Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: &Point, b: &Point, p: &Point) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Inclusive intersection test between segments `p1-p2` and `q1-q2`.
fn segments_intersect(p1: &Point, p2: &Point, q1: &Point, q2: &Point) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}
