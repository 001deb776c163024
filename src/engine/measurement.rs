//! Footprint measurement: centroids, fluxes, moments, pixel flags and dipole
//! classification.

use log::trace;
use rayon::prelude::*;

use super::{EngineError, MeasurementConfig, SourceMeasurer};
use crate::{
    image::{Exposure, MaskPlane, MaskedImage},
    psf::{ApertureCorrection, Kernel},
    source::{PixelFlags, Shape, SourceCatalog, SourceRecord},
};

const ENGINE: &str = "PixelMeasurer";

/// Width of the moment weight function when the exposure has no PSF
/// \[pixels\].
const DEFAULT_WEIGHT_SIGMA: f64 = 2.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct PixelMeasurer;

struct Context<'a> {
    exposure: &'a Exposure,
    psf_kernel: Option<Kernel>,
    gaussian_kernel: Kernel,
    weight_sigma: f64,
    ap_corr: Option<&'a ApertureCorrection>,
}

impl SourceMeasurer for PixelMeasurer {
    fn measure(
        &self,
        exposure: &Exposure,
        sources: &mut SourceCatalog,
        config: &MeasurementConfig,
        ap_corr: Option<&ApertureCorrection>,
    ) -> Result<(), EngineError> {
        let psf_kernel = match (&exposure.psf, config.psf_flux) {
            (Some(psf), _) => Some(psf.kernel()),
            (None, true) => {
                return Err(EngineError::MissingInput {
                    engine: ENGINE,
                    what: "a PSF for PSF fluxes",
                })
            }
            (None, false) => None,
        };
        if config.sky_coord && exposure.wcs.is_none() {
            return Err(EngineError::MissingInput {
                engine: ENGINE,
                what: "a WCS for sky coordinates",
            });
        }
        let weight_sigma = exposure
            .psf
            .as_ref()
            .map(|p| p.compute_gaussian_width())
            .filter(|s| *s > 0.0)
            .unwrap_or(DEFAULT_WEIGHT_SIGMA);
        let size = 2 * (4.0 * weight_sigma).ceil() as usize + 1;
        let ctx = Context {
            exposure,
            psf_kernel,
            gaussian_kernel: Kernel::gaussian(size, size, weight_sigma),
            weight_sigma,
            ap_corr: if config.do_apply_ap_corr { ap_corr } else { None },
        };

        trace!("Measuring {} sources", sources.len());
        sources
            .records
            .par_iter_mut()
            .for_each(|record| measure_record(record, config, &ctx));
        Ok(())
    }
}

fn finite_value(mi: &MaskedImage, x: i32, y: i32) -> Option<(f64, f64)> {
    mi.get(x, y)
        .map(|(v, _, var)| (v as f64, var as f64))
        .filter(|(v, var)| v.is_finite() && var.is_finite())
}

#[derive(Default)]
struct Lobe {
    sum: f64,
    sum_x: f64,
    sum_y: f64,
}

impl Lobe {
    fn add(&mut self, x: i32, y: i32, weight: f64) {
        self.sum += weight;
        self.sum_x += weight * x as f64;
        self.sum_y += weight * y as f64;
    }

    fn centroid(&self) -> Option<(f64, f64)> {
        (self.sum > 0.0).then(|| (self.sum_x / self.sum, self.sum_y / self.sum))
    }
}

fn measure_record(record: &mut SourceRecord, config: &MeasurementConfig, ctx: &Context) {
    let mi = &ctx.exposure.masked_image;
    let footprint = &record.footprint;
    let is_dipole = footprint.has_positive() && footprint.has_negative();

    let mut pos = Lobe::default();
    let mut neg = Lobe::default();
    for &(x, y) in footprint.pixels() {
        if let Some((v, _)) = finite_value(mi, x, y) {
            if v > 0.0 {
                pos.add(x, y, v);
            } else if v < 0.0 {
                neg.add(x, y, -v);
            }
        }
    }

    if config.centroid {
        let centroid = if is_dipole && config.dipole {
            match (pos.centroid(), neg.centroid()) {
                (Some(p), Some(n)) => Some((0.5 * (p.0 + n.0), 0.5 * (p.1 + n.1))),
                (p, n) => p.or(n),
            }
        } else if record.negative || !footprint.has_positive() && footprint.has_negative() {
            neg.centroid()
        } else {
            pos.centroid()
        };
        record.centroid = centroid.or_else(|| record.position());
    }
    let Some((cx, cy)) = record.position() else {
        return;
    };
    let center = (cx.round() as i32, cy.round() as i32);

    if config.pixel_flags {
        record.flags = pixel_flags(mi, footprint.pixels(), center);
    }

    if config.psf_flux {
        if let Some((flux, err)) = ctx
            .psf_kernel
            .as_ref()
            .and_then(|k| kernel_flux(mi, k, center))
        {
            let (flux, err) = match ctx.ap_corr {
                Some(ap) => (ap.apply(flux), ap.apply(err)),
                None => (flux, err),
            };
            record.psf_flux = Some(flux);
            record.psf_flux_err = Some(err);
            record.calib_mag = ctx.exposure.metadata.magnitude(flux);
        }
    }

    if config.gaussian_flux {
        record.gaussian_flux = kernel_flux(mi, &ctx.gaussian_kernel, center).map(|(f, _)| f);
    }

    if config.aperture_flux {
        record.ap_flux = aperture_flux(mi, (cx, cy), config.aperture_radius);
    }

    if config.shape {
        record.shape = weighted_moments(mi, (cx, cy), ctx.weight_sigma);
    }

    if config.sky_coord {
        record.coord = ctx.exposure.wcs.as_ref().map(|w| w.pixel_to_sky(cx, cy));
    }

    if config.dipole {
        let neg_flux = -neg.sum;
        record.dipole_pos_flux = Some(pos.sum);
        record.dipole_neg_flux = Some(neg_flux);
        let total = pos.sum + neg.sum;
        record.classification_dipole = Some(if is_dipole && total > 0.0 {
            2.0 * pos.sum.min(neg.sum) / total
        } else {
            0.0
        });
    }
}

fn pixel_flags(mi: &MaskedImage, pixels: &[(i32, i32)], center: (i32, i32)) -> PixelFlags {
    let mut flags = PixelFlags::default();
    match mi.get(center.0, center.1) {
        Some((_, m, _)) => {
            flags.interpolated_center = m & MaskPlane::INTRP != 0;
            flags.saturated_center = m & MaskPlane::SAT != 0;
            flags.cr_center = m & MaskPlane::CR != 0;
            flags.bad = m & MaskPlane::BAD != 0;
        }
        None => flags.edge = true,
    }
    let any = pixels
        .iter()
        .filter_map(|&(x, y)| mi.get(x, y).map(|(_, m, _)| m))
        .fold(0, |acc, m| acc | m);
    flags.edge |= any & (MaskPlane::EDGE | MaskPlane::NO_DATA) != 0;
    flags.interpolated = any & MaskPlane::INTRP != 0;
    flags.saturated = any & MaskPlane::SAT != 0;
    flags.cr = any & MaskPlane::CR != 0;
    flags
}

/// Least-squares amplitude of `kernel` centred on `center`:
/// flux = Σ k·I / Σ k², error = √(Σ k²·var) / Σ k².
fn kernel_flux(mi: &MaskedImage, kernel: &Kernel, center: (i32, i32)) -> Option<(f64, f64)> {
    let (kcx, kcy) = kernel.center();
    let (mut ki, mut kk, mut kkv) = (0.0, 0.0, 0.0);
    for ((r, c), &k) in kernel.image.indexed_iter() {
        let x = center.0 + c as i32 - kcx as i32;
        let y = center.1 + r as i32 - kcy as i32;
        if let Some((v, var)) = finite_value(mi, x, y) {
            ki += k * v;
            kk += k * k;
            kkv += k * k * var;
        }
    }
    (kk > 0.0).then(|| (ki / kk, kkv.sqrt() / kk))
}

fn aperture_flux(mi: &MaskedImage, center: (f64, f64), radius: f64) -> Option<f64> {
    let r = radius.ceil() as i32;
    let (x0, y0) = (center.0.round() as i32, center.1.round() as i32);
    let mut sum = 0.0;
    let mut n = 0;
    for y in y0 - r..=y0 + r {
        for x in x0 - r..=x0 + r {
            let (dx, dy) = (x as f64 - center.0, y as f64 - center.1);
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            if let Some((v, _)) = finite_value(mi, x, y) {
                sum += v;
                n += 1;
            }
        }
    }
    (n > 0).then_some(sum)
}

/// Gaussian-weighted second moments about `center`, scaled by two so that
/// a Gaussian of the weight's width reports its own σ².
fn weighted_moments(mi: &MaskedImage, center: (f64, f64), sigma: f64) -> Option<Shape> {
    let r = (4.0 * sigma).ceil() as i32;
    let (x0, y0) = (center.0.round() as i32, center.1.round() as i32);
    let (mut sum, mut xx, mut yy, mut xy) = (0.0, 0.0, 0.0, 0.0);
    for y in y0 - r..=y0 + r {
        for x in x0 - r..=x0 + r {
            let Some((v, _)) = finite_value(mi, x, y) else {
                continue;
            };
            let (dx, dy) = (x as f64 - center.0, y as f64 - center.1);
            let w = v.abs() * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            sum += w;
            xx += w * dx * dx;
            yy += w * dy * dy;
            xy += w * dx * dy;
        }
    }
    (sum > 0.0).then(|| Shape {
        xx: 2.0 * xx / sum,
        yy: 2.0 * yy / sum,
        xy: 2.0 * xy / sum,
    })
}
