use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in degrees. `x` is longitude and `y` is latitude,
/// the origin is the minimum corner.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct OsmRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// The whole map, root of both quadtrees.
pub const MAP_RECT: OsmRect = OsmRect {
    x: -180.0,
    y: -90.0,
    width: 360.0,
    height: 180.0,
};

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct OsmPoint {
    pub x: f64,
    pub y: f64,
}

impl OsmRect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        OsmRect { x, y, width, height }
    }

    pub fn from_corners(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        OsmRect {
            x: min_lon,
            y: min_lat,
            width: max_lon - min_lon,
            height: max_lat - min_lat,
        }
    }

    pub fn zero() -> Self {
        OsmRect::default()
    }

    pub fn is_zero(&self) -> bool {
        *self == OsmRect::zero()
    }

    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    pub fn contains_point(&self, pt: OsmPoint) -> bool {
        pt.x >= self.x && pt.x <= self.max_x() && pt.y >= self.y && pt.y <= self.max_y()
    }

    // Half-open on the far edge of `other`, so a quad never overlaps its
    // eastern or southern neighbour.
    pub fn intersects(&self, other: &OsmRect) -> bool {
        if self.x >= other.max_x() {
            return false;
        }
        if self.max_x() < other.x {
            return false;
        }
        if self.y >= other.max_y() {
            return false;
        }
        if self.max_y() < other.y {
            return false;
        }
        true
    }

    pub fn contains_rect(&self, other: &OsmRect) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && self.max_x() >= other.max_x()
            && self.max_y() >= other.max_y()
    }

    pub fn union(&self, other: &OsmRect) -> OsmRect {
        let min_x = self.x.min(other.x);
        let min_y = self.y.min(other.y);
        let max_x = self.max_x().max(other.max_x());
        let max_y = self.max_y().max(other.max_y());
        OsmRect::from_corners(min_x, min_y, max_x, max_y)
    }

    /// Splits a query that runs past the antimeridian into an eastern and a
    /// western half.
    pub fn split_at_antimeridian(&self) -> Option<(OsmRect, OsmRect)> {
        if self.x < 180.0 && self.max_x() > 180.0 {
            let left = OsmRect::new(self.x, self.y, 180.0 - self.x, self.height);
            let right = OsmRect::new(-180.0, self.y, self.max_x() - 180.0, self.height);
            Some((left, right))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_is_half_open_on_far_edge() {
        let quad = OsmRect::new(0.0, 0.0, 10.0, 10.0);
        let on_west_edge = OsmRect::new(0.0, 5.0, 0.0, 0.0);
        let on_east_edge = OsmRect::new(10.0, 5.0, 0.0, 0.0);
        assert!(on_west_edge.intersects(&quad));
        assert!(!quad.intersects(&OsmRect::new(10.0, 0.0, 10.0, 10.0)));
        assert!(!on_east_edge.intersects(&quad));
    }

    #[test]
    fn union_covers_both() {
        let a = OsmRect::new(0.0, 0.0, 1.0, 1.0);
        let b = OsmRect::new(2.0, -1.0, 1.0, 1.0);
        let u = a.union(&b);
        assert!(u.contains_rect(&a));
        assert!(u.contains_rect(&b));
        assert_eq!(u, OsmRect::new(0.0, -1.0, 3.0, 2.0));
    }

    #[test]
    fn antimeridian_split() {
        let rect = OsmRect::new(179.0, 0.0, 2.0, 1.0);
        let (left, right) = rect.split_at_antimeridian().unwrap();
        assert_eq!(left, OsmRect::new(179.0, 0.0, 1.0, 1.0));
        assert_eq!(right, OsmRect::new(-180.0, 0.0, 1.0, 1.0));
        assert!(OsmRect::new(0.0, 0.0, 1.0, 1.0).split_at_antimeridian().is_none());
    }
}
