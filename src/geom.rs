//! Integer and floating-point pixel boxes.
//!
//! Pixel coordinates follow the "parent" convention: an image whose origin is
//! `(x0, y0)` covers pixel centres `x0..x0 + width` and `y0..y0 + height`, and
//! the integer coordinate of a pixel is its centre.

/// An inclusive box of integer pixel coordinates. An empty box has `min > max`
/// on at least one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxI {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl Default for BoxI {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoxI {
    pub fn new(min: (i32, i32), max: (i32, i32)) -> BoxI {
        BoxI {
            min_x: min.0,
            min_y: min.1,
            max_x: max.0,
            max_y: max.1,
        }
    }

    /// A box with the given origin and dimensions.
    pub fn from_origin(x0: i32, y0: i32, width: usize, height: usize) -> BoxI {
        BoxI {
            min_x: x0,
            min_y: y0,
            max_x: x0 + width as i32 - 1,
            max_y: y0 + height as i32 - 1,
        }
    }

    pub fn empty() -> BoxI {
        BoxI {
            min_x: 0,
            min_y: 0,
            max_x: -1,
            max_y: -1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    pub fn width(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.max_x - self.min_x + 1) as usize
        }
    }

    pub fn height(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.max_y - self.min_y + 1) as usize
        }
    }

    /// (width, height)
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    pub fn area(&self) -> usize {
        self.width() * self.height()
    }

    /// Expand the box so that it contains the given pixel.
    pub fn include(&mut self, x: i32, y: i32) {
        if self.is_empty() {
            *self = BoxI::new((x, y), (x, y));
        } else {
            self.min_x = self.min_x.min(x);
            self.min_y = self.min_y.min(y);
            self.max_x = self.max_x.max(x);
            self.max_y = self.max_y.max(y);
        }
    }

    /// Expand the box so that it contains another box.
    pub fn include_box(&mut self, other: &BoxI) {
        if other.is_empty() {
            return;
        }
        for (x, y) in other.corners() {
            self.include(x, y);
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        !self.is_empty()
            && x >= self.min_x
            && x <= self.max_x
            && y >= self.min_y
            && y <= self.max_y
    }

    pub fn contains_box(&self, other: &BoxI) -> bool {
        !other.is_empty()
            && self.contains(other.min_x, other.min_y)
            && self.contains(other.max_x, other.max_y)
    }

    pub fn overlaps(&self, other: &BoxI) -> bool {
        self.intersection(other).is_some()
    }

    pub fn intersection(&self, other: &BoxI) -> Option<BoxI> {
        let b = BoxI {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        };
        if self.is_empty() || other.is_empty() || b.is_empty() {
            None
        } else {
            Some(b)
        }
    }

    /// Grow (or shrink, for negative `r`) the box by `r` pixels on every side.
    pub fn grown(&self, r: i32) -> BoxI {
        if self.is_empty() {
            return *self;
        }
        BoxI {
            min_x: self.min_x - r,
            min_y: self.min_y - r,
            max_x: self.max_x + r,
            max_y: self.max_y + r,
        }
    }

    /// The four corner pixels: lower-left, lower-right, upper-right, upper-left.
    pub fn corners(&self) -> [(i32, i32); 4] {
        [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
        ]
    }

    /// Iterate over every pixel, row by row.
    pub fn pixels(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        let (min_x, max_x) = (self.min_x, self.max_x);
        (self.min_y..=self.max_y).flat_map(move |y| (min_x..=max_x).map(move |x| (x, y)))
    }
}

/// A floating-point box. Converting a [`BoxI`] extends it by half a pixel on
/// every side, so the result bounds the pixel areas, not the pixel centres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxD {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl From<BoxI> for BoxD {
    fn from(b: BoxI) -> Self {
        BoxD {
            min_x: b.min_x as f64 - 0.5,
            min_y: b.min_y as f64 - 0.5,
            max_x: b.max_x as f64 + 0.5,
            max_y: b.max_y as f64 + 0.5,
        }
    }
}

impl BoxD {
    pub fn center(&self) -> (f64, f64) {
        (
            0.5 * (self.min_x + self.max_x),
            0.5 * (self.min_y + self.max_y),
        )
    }

    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
        ]
    }

    /// The integer box of pixels whose centres fall in this box.
    pub fn pixel_box(&self) -> BoxI {
        BoxI {
            min_x: self.min_x.ceil() as i32,
            min_y: self.min_y.ceil() as i32,
            max_x: self.max_x.floor() as i32,
            max_y: self.max_y.floor() as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_and_union() {
        let mut b = BoxI::empty();
        assert!(b.is_empty());
        b.include(3, 4);
        assert_eq!(b, BoxI::new((3, 4), (3, 4)));
        b.include_box(&BoxI::new((-2, 0), (1, 1)));
        assert_eq!(b, BoxI::new((-2, 0), (3, 4)));
        assert_eq!(b.dimensions(), (6, 5));
    }

    #[test]
    fn test_intersection() {
        let a = BoxI::from_origin(0, 0, 10, 10);
        let b = BoxI::from_origin(5, 8, 10, 10);
        assert_eq!(a.intersection(&b), Some(BoxI::new((5, 8), (9, 9))));
        let c = BoxI::from_origin(10, 0, 4, 4);
        assert!(a.intersection(&c).is_none());
        assert!(!a.overlaps(&BoxI::empty()));
    }

    #[test]
    fn test_boxd_from_boxi() {
        let d = BoxD::from(BoxI::from_origin(0, 0, 4, 2));
        assert_eq!(d.center(), (1.5, 0.5));
        assert_eq!(d.pixel_box(), BoxI::from_origin(0, 0, 4, 2));
    }

    #[test]
    fn test_pixels_iteration_order() {
        let b = BoxI::new((0, 0), (1, 1));
        let pixels: Vec<_> = b.pixels().collect();
        assert_eq!(pixels, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
    }
}
