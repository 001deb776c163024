//! Masked images and exposures.

use log::trace;
use ndarray::{prelude::*, Zip};

use crate::{
    geom::BoxI,
    psf::{Kernel, Psf},
    wcs::Wcs,
};

/// Mask bit planes.
pub struct MaskPlane;

impl MaskPlane {
    pub const BAD: u32 = 1 << 0;
    pub const SAT: u32 = 1 << 1;
    pub const INTRP: u32 = 1 << 2;
    pub const CR: u32 = 1 << 3;
    pub const EDGE: u32 = 1 << 4;
    pub const DETECTED: u32 = 1 << 5;
    pub const DETECTED_NEGATIVE: u32 = 1 << 6;
    pub const NO_DATA: u32 = 1 << 7;

    /// Bits that make a pixel unusable for statistics and fitting.
    pub const UNUSABLE: u32 = Self::BAD | Self::SAT | Self::EDGE | Self::NO_DATA;

    pub fn names(bits: u32) -> Vec<&'static str> {
        [
            (Self::BAD, "BAD"),
            (Self::SAT, "SAT"),
            (Self::INTRP, "INTRP"),
            (Self::CR, "CR"),
            (Self::EDGE, "EDGE"),
            (Self::DETECTED, "DETECTED"),
            (Self::DETECTED_NEGATIVE, "DETECTED_NEGATIVE"),
            (Self::NO_DATA, "NO_DATA"),
        ]
        .into_iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| name)
        .collect()
    }
}

/// Image, mask and variance planes sharing one parent bounding box. All three
/// arrays are indexed `[y - y0, x - x0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedImage {
    pub image: Array2<f32>,
    pub mask: Array2<u32>,
    pub variance: Array2<f32>,
    pub x0: i32,
    pub y0: i32,
}

impl MaskedImage {
    /// A zeroed masked image covering `bbox`.
    pub fn new(bbox: BoxI) -> MaskedImage {
        MaskedImage::filled(bbox, 0.0, 0, 0.0)
    }

    pub fn filled(bbox: BoxI, value: f32, mask: u32, variance: f32) -> MaskedImage {
        let shape = (bbox.height(), bbox.width());
        MaskedImage {
            image: Array2::from_elem(shape, value),
            mask: Array2::from_elem(shape, mask),
            variance: Array2::from_elem(shape, variance),
            x0: bbox.min_x,
            y0: bbox.min_y,
        }
    }

    pub fn bbox(&self) -> BoxI {
        let (h, w) = self.image.dim();
        BoxI::from_origin(self.x0, self.y0, w, h)
    }

    /// (width, height)
    pub fn dimensions(&self) -> (usize, usize) {
        let (h, w) = self.image.dim();
        (w, h)
    }

    fn index(&self, x: i32, y: i32) -> Option<[usize; 2]> {
        if self.bbox().contains(x, y) {
            Some([(y - self.y0) as usize, (x - self.x0) as usize])
        } else {
            None
        }
    }

    /// (image, mask, variance) at a parent pixel.
    pub fn get(&self, x: i32, y: i32) -> Option<(f32, u32, f32)> {
        self.index(x, y)
            .map(|i| (self.image[i], self.mask[i], self.variance[i]))
    }

    pub fn set(&mut self, x: i32, y: i32, value: (f32, u32, f32)) {
        if let Some(i) = self.index(x, y) {
            self.image[i] = value.0;
            self.mask[i] = value.1;
            self.variance[i] = value.2;
        }
    }

    /// Overwrite the overlap between `self` and `other` with `other`'s pixels.
    /// Returns the overlapping box, if any.
    pub fn assign(&mut self, other: &MaskedImage) -> Option<BoxI> {
        let overlap = self.bbox().intersection(&other.bbox())?;
        let (w, h) = overlap.dimensions();
        let (dr, dc) = self.offset_of(&overlap);
        let (sr, sc) = other.offset_of(&overlap);
        self.image
            .slice_mut(s![dr..dr + h, dc..dc + w])
            .assign(&other.image.slice(s![sr..sr + h, sc..sc + w]));
        self.mask
            .slice_mut(s![dr..dr + h, dc..dc + w])
            .assign(&other.mask.slice(s![sr..sr + h, sc..sc + w]));
        self.variance
            .slice_mut(s![dr..dr + h, dc..dc + w])
            .assign(&other.variance.slice(s![sr..sr + h, sc..sc + w]));
        Some(overlap)
    }

    /// Array (row, col) of the lower-left corner of `b`.
    fn offset_of(&self, b: &BoxI) -> (usize, usize) {
        ((b.min_y - self.y0) as usize, (b.min_x - self.x0) as usize)
    }

    /// Clear `bits` in every mask pixel.
    pub fn clear_mask_bits(&mut self, bits: u32) {
        self.mask.mapv_inplace(|m| m & !bits);
    }

    /// `self -= other` for images of the same bounding box: image values
    /// subtract, variances add and mask planes OR.
    pub fn subtract(&mut self, other: &MaskedImage) {
        assert_eq!(self.bbox(), other.bbox(), "masked image boxes differ");
        Zip::from(&mut self.image)
            .and(&other.image)
            .for_each(|a, &b| *a -= b);
        Zip::from(&mut self.variance)
            .and(&other.variance)
            .for_each(|a, &b| *a += b);
        Zip::from(&mut self.mask)
            .and(&other.mask)
            .for_each(|a, &b| *a |= b);
    }

    /// Convolve with `kernel` into a new masked image. Never in place: each
    /// output pixel reads a neighbourhood of input pixels.
    ///
    /// The variance plane is convolved with the squared kernel and the mask
    /// planes are OR-ed over the kernel support. Pixels closer to the border
    /// than the kernel half-width keep their input values and gain `EDGE`.
    pub fn convolved(&self, kernel: &Kernel) -> MaskedImage {
        let (kw, kh) = kernel.dimensions();
        let (kcx, kcy) = kernel.center();
        let (h, w) = self.image.dim();
        trace!("Convolving {w}x{h} image with {kw}x{kh} kernel");

        let k = &kernel.image;
        let mut out = MaskedImage::new(self.bbox());
        Zip::indexed(&mut out.image)
            .and(&mut out.mask)
            .and(&mut out.variance)
            .par_for_each(|(r, c), image, mask, variance| {
                if r < kcy || c < kcx || r + kcy >= h || c + kcx >= w {
                    *image = self.image[[r, c]];
                    *variance = self.variance[[r, c]];
                    *mask = self.mask[[r, c]] | MaskPlane::EDGE;
                    return;
                }
                let mut sum = 0.0;
                let mut var = 0.0;
                let mut m = 0;
                for kr in 0..kh {
                    for kc in 0..kw {
                        let kv = k[[kr, kc]];
                        // Kernel flipped about its centre.
                        let rr = r + kcy - kr;
                        let cc = c + kcx - kc;
                        sum += kv * self.image[[rr, cc]] as f64;
                        var += kv * kv * self.variance[[rr, cc]] as f64;
                        if kv != 0.0 {
                            m |= self.mask[[rr, cc]];
                        }
                    }
                }
                *image = sum as f32;
                *variance = var as f32;
                *mask = m;
            });
        out
    }

    /// Median of the variance plane over usable pixels, if there are any.
    pub fn median_variance(&self) -> Option<f64> {
        let mut values: Vec<f32> = Zip::from(&self.variance)
            .and(&self.mask)
            .fold(Vec::new(), |mut acc, &v, &m| {
                if m & MaskPlane::UNUSABLE == 0 && v.is_finite() {
                    acc.push(v);
                }
                acc
            });
        if values.is_empty() {
            return None;
        }
        let mid = values.len() / 2;
        let (_, median, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
        Some(*median as f64)
    }
}

/// Calibration quantities attached to an exposure by upstream processing.
/// Absent fields were not determined (e.g. photometric calibration failed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExposureMetadata {
    /// Magnitude of a source with a flux of one count.
    pub zero_point_mag: Option<f64>,

    /// RMS scatter of the zero-point fit \[mag\].
    pub zero_point_rms: Option<f64>,

    /// Number of objects used in the photometric calibration.
    pub n_calib_objects: Option<usize>,

    /// Exposure time \[seconds\].
    pub exposure_time: Option<f64>,

    pub filter: Option<String>,
}

impl ExposureMetadata {
    /// Calibrated magnitude of `flux` counts, if a zero point is known.
    pub fn magnitude(&self, flux: f64) -> Option<f64> {
        match self.zero_point_mag {
            Some(zp) if flux > 0.0 => Some(zp - 2.5 * flux.log10()),
            _ => None,
        }
    }
}

/// A masked image with its WCS, PSF and calibration metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Exposure {
    pub masked_image: MaskedImage,
    pub wcs: Option<Wcs>,
    pub psf: Option<Psf>,
    pub metadata: ExposureMetadata,
}

impl Exposure {
    pub fn new(masked_image: MaskedImage, wcs: Option<Wcs>) -> Exposure {
        Exposure {
            masked_image,
            wcs,
            psf: None,
            metadata: ExposureMetadata::default(),
        }
    }

    pub fn bbox(&self) -> BoxI {
        self.masked_image.bbox()
    }

    pub fn has_psf(&self) -> bool {
        self.psf.is_some()
    }
}

/// A background model that can be added back to (or removed from) an image.
#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundModel {
    Constant(f64),

    /// Background values on the parent pixel grid of `bbox`.
    Image { bbox: BoxI, values: Array2<f32> },
}

impl BackgroundModel {
    pub fn evaluate(&self, x: i32, y: i32) -> f64 {
        match self {
            BackgroundModel::Constant(level) => *level,
            BackgroundModel::Image { bbox, values } => {
                if bbox.contains(x, y) {
                    values[[(y - bbox.min_y) as usize, (x - bbox.min_x) as usize]] as f64
                } else {
                    0.0
                }
            }
        }
    }

    /// Add the model to the image plane of `mi`.
    pub fn add_to(&self, mi: &mut MaskedImage) {
        let (x0, y0) = (mi.x0, mi.y0);
        for ((r, c), v) in mi.image.indexed_iter_mut() {
            *v += self.evaluate(x0 + c as i32, y0 + r as i32) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_assign_overlap_only() {
        let mut big = MaskedImage::filled(
            BoxI::from_origin(0, 0, 10, 10),
            f32::NAN,
            MaskPlane::EDGE,
            f32::NAN,
        );
        let patch = MaskedImage::filled(BoxI::from_origin(5, 5, 10, 10), 1.0, 0, 2.0);
        let overlap = big.assign(&patch).unwrap();
        assert_eq!(overlap, BoxI::new((5, 5), (9, 9)));
        assert_eq!(big.get(5, 5), Some((1.0, 0, 2.0)));
        let (v, m, _) = big.get(4, 9).unwrap();
        assert!(v.is_nan());
        assert_eq!(m, MaskPlane::EDGE);
    }

    #[test]
    fn test_subtract_propagates_variance_and_mask() {
        let bbox = BoxI::from_origin(-3, 2, 4, 4);
        let mut a = MaskedImage::filled(bbox, 5.0, MaskPlane::SAT, 1.0);
        let b = MaskedImage::filled(bbox, 2.0, MaskPlane::CR, 0.5);
        a.subtract(&b);
        assert_eq!(a.get(-3, 2), Some((3.0, MaskPlane::SAT | MaskPlane::CR, 1.5)));
    }

    #[test]
    fn test_clear_mask_bits() {
        let bbox = BoxI::from_origin(0, 0, 2, 2);
        let mut mi = MaskedImage::filled(
            bbox,
            0.0,
            MaskPlane::DETECTED | MaskPlane::DETECTED_NEGATIVE | MaskPlane::SAT,
            1.0,
        );
        mi.clear_mask_bits(MaskPlane::DETECTED | MaskPlane::DETECTED_NEGATIVE);
        assert!(mi.mask.iter().all(|&m| m == MaskPlane::SAT));
    }

    #[test]
    fn test_convolution_preserves_flux_and_sets_edge() {
        let bbox = BoxI::from_origin(0, 0, 21, 21);
        let mut mi = MaskedImage::filled(bbox, 0.0, 0, 1.0);
        mi.set(10, 10, (100.0, 0, 1.0));
        let kernel = Kernel::gaussian(7, 7, 1.0);
        let out = mi.convolved(&kernel);
        assert_abs_diff_eq!(out.image.sum(), 100.0, epsilon = 1e-3);
        assert!(out.image[[10, 10]] < 100.0);
        assert_ne!(out.get(0, 0).unwrap().1 & MaskPlane::EDGE, 0);
        assert_eq!(out.get(10, 10).unwrap().1 & MaskPlane::EDGE, 0);
        // Variance convolved with the squared kernel.
        let k2: f64 = kernel.image.iter().map(|k| k * k).sum();
        assert_abs_diff_eq!(out.get(10, 10).unwrap().2 as f64, k2, epsilon = 1e-6);
        // The input is untouched.
        assert_eq!(mi.get(10, 10), Some((100.0, 0, 1.0)));
    }

    #[test]
    fn test_median_variance_ignores_unusable() {
        let bbox = BoxI::from_origin(0, 0, 3, 1);
        let mut mi = MaskedImage::filled(bbox, 0.0, 0, 4.0);
        mi.set(0, 0, (0.0, MaskPlane::EDGE, 1000.0));
        assert_eq!(mi.median_variance(), Some(4.0));
    }

    #[test]
    fn test_background_add() {
        let mut mi = MaskedImage::new(BoxI::from_origin(0, 0, 3, 3));
        BackgroundModel::Constant(2.5).add_to(&mut mi);
        assert!(mi.image.iter().all(|&v| v == 2.5));
    }

    #[test]
    fn test_mask_names() {
        assert_eq!(
            MaskPlane::names(MaskPlane::EDGE | MaskPlane::DETECTED),
            vec!["EDGE", "DETECTED"]
        );
    }
}
