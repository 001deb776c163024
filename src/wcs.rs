//! A gnomonic (TAN) world coordinate system.
//!
//! Only the plain projection is provided; distortion terms are the business of
//! whoever solved the astrometry.

use std::f64::consts::TAU;

use marlu::RADec;

/// Pixel <-> sky mapping with a TAN projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wcs {
    /// The sky position of the reference pixel \[radians\].
    pub crval: RADec,

    /// The reference pixel, in parent pixel coordinates.
    pub crpix: (f64, f64),

    /// Linear transform from pixel offsets to tangent-plane offsets
    /// \[degrees per pixel\], FITS row-major order.
    pub cd: [[f64; 2]; 2],
}

impl Wcs {
    pub fn new(crval: RADec, crpix: (f64, f64), cd: [[f64; 2]; 2]) -> Wcs {
        Wcs { crval, crpix, cd }
    }

    /// A north-up, east-left WCS with square pixels of `scale_arcsec`.
    pub fn from_scale(crval: RADec, crpix: (f64, f64), scale_arcsec: f64) -> Wcs {
        let s = scale_arcsec / 3600.0;
        Wcs {
            crval,
            crpix,
            cd: [[-s, 0.0], [0.0, s]],
        }
    }

    /// The same projection with the reference pixel shifted, i.e. the WCS of
    /// an image whose parent origin moved by `(-dx, -dy)`.
    pub fn shifted(&self, dx: f64, dy: f64) -> Wcs {
        Wcs {
            crpix: (self.crpix.0 + dx, self.crpix.1 + dy),
            ..*self
        }
    }

    pub fn pixel_to_sky(&self, x: f64, y: f64) -> RADec {
        let dx = x - self.crpix.0;
        let dy = y - self.crpix.1;
        let xi = (self.cd[0][0] * dx + self.cd[0][1] * dy).to_radians();
        let eta = (self.cd[1][0] * dx + self.cd[1][1] * dy).to_radians();
        let (ra, dec) = tan_deproject(xi, eta, self.crval.ra, self.crval.dec);
        RADec { ra, dec }
    }

    /// Project a sky position to pixel coordinates. Positions on or behind the
    /// tangent plane have no pixel coordinates.
    pub fn sky_to_pixel(&self, radec: RADec) -> Option<(f64, f64)> {
        let (xi, eta) = tan_project(radec.ra, radec.dec, self.crval.ra, self.crval.dec)?;
        let (xi, eta) = (xi.to_degrees(), eta.to_degrees());
        let [[a, b], [c, d]] = self.cd;
        let det = a * d - b * c;
        if det.abs() < f64::MIN_POSITIVE {
            return None;
        }
        let dx = (d * xi - b * eta) / det;
        let dy = (-c * xi + a * eta) / det;
        Some((dx + self.crpix.0, dy + self.crpix.1))
    }

    /// Pixel scale at the reference pixel \[arcsec / pixel\].
    pub fn pixel_scale_arcsec(&self) -> f64 {
        let [[a, b], [c, d]] = self.cd;
        (a * d - b * c).abs().sqrt() * 3600.0
    }
}

/// Forward gnomonic projection of `(ra, dec)` onto the plane tangent at
/// `(ra0, dec0)`. All angles in radians.
fn tan_project(ra: f64, dec: f64, ra0: f64, dec0: f64) -> Option<(f64, f64)> {
    let da = ra - ra0;
    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_dec0, cos_dec0) = dec0.sin_cos();
    let cos_da = da.cos();

    let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if denom <= 1e-12 {
        return None;
    }
    let xi = cos_dec * da.sin() / denom;
    let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom;
    Some((xi, eta))
}

fn tan_deproject(xi: f64, eta: f64, ra0: f64, dec0: f64) -> (f64, f64) {
    let (sin_dec0, cos_dec0) = dec0.sin_cos();
    let denom = cos_dec0 - eta * sin_dec0;
    let ra = (ra0 + xi.atan2(denom)).rem_euclid(TAU);
    let dec = ((sin_dec0 + eta * cos_dec0) / (1.0 + xi * xi + eta * eta).sqrt()).asin();
    (ra, dec)
}
