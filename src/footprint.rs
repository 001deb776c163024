//! Detection footprints and their merging.

use log::debug;

use crate::{geom::BoxI, image::MaskedImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Polarity {
    Positive,
    Negative,
}

/// The extremum of a footprint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub x: i32,
    pub y: i32,
    pub value: f32,
    pub polarity: Polarity,
}

/// A set of pixels belonging to one detection. Pixels are stored as `(x, y)`
/// sorted row by row, without duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    pixels: Vec<(i32, i32)>,
    bbox: BoxI,
    pub peaks: Vec<Peak>,

    /// Pixel values, parallel to `pixels`, when the footprint is heavy.
    heavy: Option<Vec<f32>>,
}

impl Footprint {
    pub fn new(mut pixels: Vec<(i32, i32)>, peaks: Vec<Peak>) -> Footprint {
        pixels.sort_unstable_by_key(|&(x, y)| (y, x));
        pixels.dedup();
        let mut bbox = BoxI::empty();
        for &(x, y) in &pixels {
            bbox.include(x, y);
        }
        Footprint {
            pixels,
            bbox,
            peaks,
            heavy: None,
        }
    }

    pub fn pixels(&self) -> &[(i32, i32)] {
        &self.pixels
    }

    pub fn bbox(&self) -> BoxI {
        self.bbox
    }

    pub fn area(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.bbox.contains(x, y)
            && self
                .pixels
                .binary_search_by_key(&(y, x), |&(px, py)| (py, px))
                .is_ok()
    }

    /// Whether any pixel is shared with `other`.
    pub fn overlaps(&self, other: &Footprint) -> bool {
        if !self.bbox.overlaps(&other.bbox) {
            return false;
        }
        let (small, large) = if self.area() <= other.area() {
            (self, other)
        } else {
            (other, self)
        };
        small.pixels.iter().any(|&(x, y)| large.contains(x, y))
    }

    /// Isotropic dilation by a disk of radius `r`. Heavy values are dropped.
    pub fn grown(&self, r: i32) -> Footprint {
        if r <= 0 {
            return Footprint::new(self.pixels.clone(), self.peaks.clone());
        }
        let disk: Vec<(i32, i32)> = (-r..=r)
            .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
            .filter(|&(dx, dy)| dx * dx + dy * dy <= r * r)
            .collect();
        let mut pixels = Vec::with_capacity(self.pixels.len() * disk.len());
        for &(x, y) in &self.pixels {
            pixels.extend(disk.iter().map(|&(dx, dy)| (x + dx, y + dy)));
        }
        Footprint::new(pixels, self.peaks.clone())
    }

    pub fn has_positive(&self) -> bool {
        self.peaks.iter().any(|p| p.polarity == Polarity::Positive)
    }

    pub fn has_negative(&self) -> bool {
        self.peaks.iter().any(|p| p.polarity == Polarity::Negative)
    }

    /// Attach the image values of `mi` under the footprint. Pixels outside
    /// `mi` are recorded as NaN.
    pub fn make_heavy(&mut self, mi: &MaskedImage) {
        self.heavy = Some(
            self.pixels
                .iter()
                .map(|&(x, y)| mi.get(x, y).map(|(v, _, _)| v).unwrap_or(f32::NAN))
                .collect(),
        );
    }

    pub fn strip_heavy(&mut self) {
        self.heavy = None;
    }

    pub fn is_heavy(&self) -> bool {
        self.heavy.is_some()
    }

    pub fn heavy_values(&self) -> Option<&[f32]> {
        self.heavy.as_deref()
    }
}

pub(crate) fn find_root(labels: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != labels[current] {
        // Path halving.
        labels[current] = labels[labels[current]];
        current = labels[current];
    }
    current
}

/// Join the sets of `a` and `b`; the smaller root becomes the parent.
pub(crate) fn union_labels(labels: &mut [usize], a: usize, b: usize) -> usize {
    let root_a = find_root(labels, a);
    let root_b = find_root(labels, b);
    if root_a < root_b {
        labels[root_b] = root_a;
        root_a
    } else {
        labels[root_a] = root_b;
        root_b
    }
}

/// Merge footprints whose extents, each grown by `grow` pixels, intersect.
///
/// Merged footprints hold the union of their members' pixels (not the grown
/// pixels) and all of their peaks. The output is therefore independent of
/// input order, and merging an already merged set changes nothing. Output is
/// ordered by first pixel.
pub fn merge_footprints(footprints: Vec<Footprint>, grow: i32) -> Vec<Footprint> {
    let n = footprints.len();
    let grown: Vec<Footprint> = footprints.iter().map(|f| f.grown(grow)).collect();
    let mut labels: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in i + 1..n {
            if grown[i].overlaps(&grown[j]) {
                union_labels(&mut labels, i, j);
            }
        }
    }

    let mut groups: Vec<Vec<usize>> = vec![vec![]; n];
    for i in 0..n {
        let root = find_root(&mut labels, i);
        groups[root].push(i);
    }

    let mut merged: Vec<Footprint> = groups
        .into_iter()
        .filter(|g| !g.is_empty())
        .map(|members| {
            let mut pixels = vec![];
            let mut peaks = vec![];
            for &m in &members {
                pixels.extend_from_slice(&footprints[m].pixels);
                peaks.extend_from_slice(&footprints[m].peaks);
            }
            peaks.sort_by(|a, b| {
                (a.y, a.x, a.polarity)
                    .cmp(&(b.y, b.x, b.polarity))
                    .then(a.value.total_cmp(&b.value))
            });
            Footprint::new(pixels, peaks)
        })
        .collect();
    merged.sort_by_key(|f| f.pixels.first().map(|&(x, y)| (y, x)));
    debug!("Merged {n} footprints into {}", merged.len());
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: i32, y0: i32, size: i32, polarity: Polarity) -> Footprint {
        let pixels = (y0..y0 + size)
            .flat_map(|y| (x0..x0 + size).map(move |x| (x, y)))
            .collect();
        let value = match polarity {
            Polarity::Positive => 10.0,
            Polarity::Negative => -10.0,
        };
        Footprint::new(
            pixels,
            vec![Peak {
                x: x0 + size / 2,
                y: y0 + size / 2,
                value,
                polarity,
            }],
        )
    }

    #[test]
    fn test_pixels_sorted_and_deduplicated() {
        let f = Footprint::new(vec![(3, 1), (1, 2), (2, 1), (3, 1)], vec![]);
        assert_eq!(f.pixels(), &[(2, 1), (3, 1), (1, 2)]);
        assert_eq!(f.bbox(), BoxI::new((1, 1), (3, 2)));
        assert!(f.contains(1, 2));
        assert!(!f.contains(1, 1));
    }

    #[test]
    fn test_grow_is_a_disk() {
        let f = Footprint::new(vec![(0, 0)], vec![]);
        let g = f.grown(2);
        assert_eq!(g.area(), 13);
        assert!(g.contains(2, 0));
        assert!(g.contains(1, 1));
        assert!(!g.contains(2, 2));
        assert_eq!(f.grown(0), f);
    }

    #[test]
    fn test_merge_adjacent_dipole_lobes() {
        let pos = square(10, 10, 4, Polarity::Positive);
        let neg = square(10, 16, 4, Polarity::Negative);
        let far = square(40, 40, 3, Polarity::Positive);
        let merged = merge_footprints(vec![pos.clone(), neg.clone(), far.clone()], 2);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].has_positive() && merged[0].has_negative());
        assert_eq!(merged[0].area(), pos.area() + neg.area());
        assert_eq!(merged[1], far);

        // Without growth the lobes are two pixels apart and stay separate.
        assert_eq!(merge_footprints(vec![pos, neg, far], 0).len(), 3);
    }

    #[test]
    fn test_merge_is_order_independent_and_idempotent() {
        let fs = vec![
            square(0, 0, 3, Polarity::Positive),
            square(5, 0, 3, Polarity::Negative),
            square(10, 0, 3, Polarity::Positive),
            square(30, 30, 2, Polarity::Negative),
            square(0, 30, 2, Polarity::Positive),
        ];
        let merged = merge_footprints(fs.clone(), 2);
        let mut reversed = fs.clone();
        reversed.reverse();
        assert_eq!(merge_footprints(reversed, 2), merged);
        let mut rotated = fs;
        rotated.rotate_left(2);
        assert_eq!(merge_footprints(rotated, 2), merged);
        assert_eq!(merge_footprints(merged.clone(), 2), merged);
        // The chain 0-5-10 joins transitively.
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].peaks.len(), 3);
    }

    #[test]
    fn test_heavy_values() {
        let mut mi = MaskedImage::new(BoxI::from_origin(0, 0, 4, 4));
        mi.set(1, 1, (5.0, 0, 1.0));
        let mut f = Footprint::new(vec![(1, 1), (4, 4)], vec![]);
        f.make_heavy(&mi);
        let values = f.heavy_values().unwrap();
        assert_eq!(values[0], 5.0);
        assert!(values[1].is_nan());
        f.strip_heavy();
        assert!(!f.is_heavy());
    }
}
