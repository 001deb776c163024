//! Template warping and analytic Gaussian PSF matching.

use log::debug;
use ndarray::Zip;

use super::{EngineError, PsfMatcher, SubtractionResult};
use crate::{
    geom::BoxI,
    image::{BackgroundModel, Exposure, MaskPlane, MaskedImage},
    psf::{Kernel, FWHM_PER_SIGMA},
    source::SourceRecord,
    wcs::Wcs,
};

const ENGINE: &str = "GaussianPsfMatcher";

/// Bilinear weights below this are ignored, so that grids aligned to within
/// rounding do not read past the edge of the input.
const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct PsfMatchConfig {
    /// Width and height of the matching kernel \[pixels\].
    pub kernel_size: usize,

    /// Matching kernels narrower than this are replaced by the identity.
    pub min_kernel_sigma: f64,

    /// Fit a constant background difference.
    pub fit_background: bool,

    /// Radius of the flux-ratio aperture around kernel candidates, in units
    /// of the science PSF sigma.
    pub candidate_radius_sigma: f64,
}

impl Default for PsfMatchConfig {
    fn default() -> Self {
        PsfMatchConfig {
            kernel_size: 21,
            min_kernel_sigma: 0.1,
            fit_background: true,
            candidate_radius_sigma: 3.0,
        }
    }
}

/// Models both PSFs as Gaussians; the matching kernel is the Gaussian whose
/// width makes up the difference. The photometric scale is the median flux
/// ratio over the kernel candidates.
#[derive(Debug, Clone, Default)]
pub struct GaussianPsfMatcher {
    pub config: PsfMatchConfig,
}

impl GaussianPsfMatcher {
    pub fn new(config: PsfMatchConfig) -> GaussianPsfMatcher {
        GaussianPsfMatcher { config }
    }

    /// Median over the candidates of science / template aperture flux, and
    /// the number of candidates that contributed. `offset` is a constant sky
    /// level of the science image relative to the template.
    fn flux_scale(
        &self,
        science: &MaskedImage,
        template: &MaskedImage,
        candidates: Option<&[SourceRecord]>,
        sigma_science: f64,
        offset: f64,
    ) -> (f64, usize) {
        let radius = self.config.candidate_radius_sigma * sigma_science;
        let mut ratios: Vec<f64> = candidates
            .unwrap_or_default()
            .iter()
            .filter_map(|c| {
                let center = c.position()?;
                let (s, n) = clean_aperture_sum(science, center, radius)?;
                let (t, _) = clean_aperture_sum(template, center, radius)?;
                let s = s - offset * n as f64;
                (s > 0.0 && t > 0.0).then(|| s / t)
            })
            .collect();
        if ratios.is_empty() {
            return (1.0, 0);
        }
        let n = ratios.len();
        let (_, median, _) = ratios.select_nth_unstable_by(n / 2, |a, b| a.total_cmp(b));
        (*median, n)
    }
}

/// Warp `src` (with WCS `src_wcs`) onto the pixel grid `bbox` of `dest_wcs`
/// by bilinear interpolation. Output pixels without full input coverage are
/// NaN with `NO_DATA | EDGE`.
pub fn warp_masked_image(
    src: &MaskedImage,
    src_wcs: &Wcs,
    dest_wcs: &Wcs,
    bbox: BoxI,
) -> MaskedImage {
    let mut out = MaskedImage::filled(
        bbox,
        f32::NAN,
        MaskPlane::NO_DATA | MaskPlane::EDGE,
        f32::NAN,
    );
    let (x0, y0) = (out.x0, out.y0);
    Zip::indexed(&mut out.image)
        .and(&mut out.mask)
        .and(&mut out.variance)
        .par_for_each(|(r, c), image, mask, variance| {
            let sky = dest_wcs.pixel_to_sky((x0 + c as i32) as f64, (y0 + r as i32) as f64);
            let Some((sx, sy)) = src_wcs.sky_to_pixel(sky) else {
                return;
            };
            if let Some((v, m, var)) = bilinear(src, sx, sy) {
                *image = v;
                *mask = m;
                *variance = var;
            }
        });
    out
}

fn bilinear(src: &MaskedImage, x: f64, y: f64) -> Option<(f32, u32, f32)> {
    let (ix, iy) = (x.floor(), y.floor());
    let (fx, fy) = (x - ix, y - iy);
    let (ix, iy) = (ix as i32, iy as i32);
    let (mut v, mut var, mut m) = (0.0, 0.0, 0);
    for (dx, dy, w) in [
        (0, 0, (1.0 - fx) * (1.0 - fy)),
        (1, 0, fx * (1.0 - fy)),
        (0, 1, (1.0 - fx) * fy),
        (1, 1, fx * fy),
    ] {
        if w <= WEIGHT_EPSILON {
            continue;
        }
        let (pv, pm, pvar) = src.get(ix + dx, iy + dy)?;
        v += w * pv as f64;
        var += w * pvar as f64;
        m |= pm;
    }
    Some((v as f32, m, var as f32))
}

/// Sum and count of the pixels within `radius` of `center`, if they are all
/// finite and usable.
fn clean_aperture_sum(
    mi: &MaskedImage,
    center: (f64, f64),
    radius: f64,
) -> Option<(f64, usize)> {
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
            let (v, m, _) = mi.get(x, y)?;
            if !v.is_finite() || m & MaskPlane::UNUSABLE != 0 {
                return None;
            }
            sum += v as f64;
            n += 1;
        }
    }
    Some((sum, n))
}

/// Median of `a - b` over pixels usable in both.
fn median_difference(a: &MaskedImage, b: &MaskedImage) -> Option<f64> {
    let mut diffs: Vec<f64> = Zip::from(&a.image)
        .and(&a.mask)
        .and(&b.image)
        .and(&b.mask)
        .fold(Vec::new(), |mut acc, &av, &am, &bv, &bm| {
            let d = av as f64 - bv as f64;
            if (am | bm) & MaskPlane::UNUSABLE == 0 && d.is_finite() {
                acc.push(d);
            }
            acc
        });
    if diffs.is_empty() {
        return None;
    }
    let mid = diffs.len() / 2;
    let (_, median, _) = diffs.select_nth_unstable_by(mid, |x, y| x.total_cmp(y));
    Some(*median)
}

impl PsfMatcher for GaussianPsfMatcher {
    fn subtract_exposures(
        &self,
        template: &Exposure,
        science: &Exposure,
        science_fwhm_pix: f64,
        candidates: Option<&[SourceRecord]>,
        convolve_template: bool,
    ) -> Result<SubtractionResult, EngineError> {
        let science_wcs = science.wcs.as_ref().ok_or(EngineError::MissingInput {
            engine: ENGINE,
            what: "a science WCS",
        })?;
        let template_wcs = template.wcs.as_ref().ok_or(EngineError::MissingInput {
            engine: ENGINE,
            what: "a template WCS",
        })?;
        let template_psf = template.psf.as_ref().ok_or(EngineError::MissingInput {
            engine: ENGINE,
            what: "a template PSF",
        })?;
        if science_fwhm_pix.is_nan() || science_fwhm_pix <= 0.0 {
            return Err(EngineError::Failed {
                engine: ENGINE,
                message: format!("invalid science FWHM {science_fwhm_pix}"),
            });
        }

        let warped = Exposure {
            masked_image: warp_masked_image(
                &template.masked_image,
                template_wcs,
                science_wcs,
                science.bbox(),
            ),
            wcs: Some(*science_wcs),
            psf: template.psf.clone(),
            metadata: template.metadata.clone(),
        };

        let pixel_ratio = template_wcs.pixel_scale_arcsec() / science_wcs.pixel_scale_arcsec();
        let sigma_template = template_psf.compute_gaussian_width() * pixel_ratio;
        let sigma_science = science_fwhm_pix / FWHM_PER_SIGMA;
        let kernel_variance = if convolve_template {
            sigma_science.powi(2) - sigma_template.powi(2)
        } else {
            sigma_template.powi(2) - sigma_science.powi(2)
        };
        let min_sigma = self.config.min_kernel_sigma;
        let kernel = if kernel_variance > min_sigma * min_sigma {
            let sigma = kernel_variance.sqrt();
            debug!(
                "Matching kernel sigma {sigma:.3} px (science {sigma_science:.3}, template {sigma_template:.3})"
            );
            Kernel::gaussian(self.config.kernel_size, self.config.kernel_size, sigma)
        } else {
            debug!(
                "Science sigma {sigma_science:.3} and template sigma {sigma_template:.3} already match; using the identity kernel"
            );
            Kernel::delta()
        };

        let (science_side, template_side) = if convolve_template {
            (
                science.masked_image.clone(),
                warped.masked_image.convolved(&kernel),
            )
        } else {
            (
                science.masked_image.convolved(&kernel),
                warped.masked_image.clone(),
            )
        };

        // Sky pixels dominate the median, so this holds for any flux scale.
        let offset = if self.config.fit_background {
            median_difference(&science_side, &template_side).unwrap_or(0.0)
        } else {
            0.0
        };
        let (scale, n_kernel_candidates) =
            self.flux_scale(&science_side, &template_side, candidates, sigma_science, offset);
        debug!("Photometric scale {scale:.4} from {n_kernel_candidates} candidates");
        let mut matched = template_side;
        matched.image.mapv_inplace(|v| v * scale as f32);
        matched.variance.mapv_inplace(|v| v * (scale * scale) as f32);

        let background_model = BackgroundModel::Constant(if self.config.fit_background {
            median_difference(&science_side, &matched).unwrap_or(0.0)
        } else {
            0.0
        });
        background_model.add_to(&mut matched);

        let mut difference = science_side;
        difference.subtract(&matched);

        Ok(SubtractionResult {
            subtracted_exposure: Exposure {
                masked_image: difference,
                wcs: science.wcs,
                psf: None,
                metadata: science.metadata.clone(),
            },
            matched_exposure: Exposure {
                masked_image: matched,
                wcs: Some(*science_wcs),
                psf: if convolve_template {
                    science.psf.clone()
                } else {
                    template.psf.clone()
                },
                metadata: template.metadata.clone(),
            },
            warped_exposure: warped,
            psf_matching_kernel: kernel,
            background_model,
            n_kernel_candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{footprint::Footprint, psf::Psf};
    use marlu::RADec;

    fn wcs() -> Wcs {
        Wcs::from_scale(
            RADec {
                ra: 2.0,
                dec: 0.3,
            },
            (40.0, 40.0),
            0.2,
        )
    }

    fn exposure_with_star(
        bbox: BoxI,
        wcs: Wcs,
        star: (f64, f64),
        flux: f64,
        sigma: f64,
    ) -> Exposure {
        let mut mi = MaskedImage::filled(bbox, 0.0, 0, 1.0);
        let norm = flux / (2.0 * std::f64::consts::PI * sigma * sigma);
        for ((r, c), v) in mi.image.indexed_iter_mut() {
            let dx = (bbox.min_x + c as i32) as f64 - star.0;
            let dy = (bbox.min_y + r as i32) as f64 - star.1;
            *v = (norm * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()) as f32;
        }
        let mut exp = Exposure::new(mi, Some(wcs));
        exp.psf = Some(Psf::SingleGaussian {
            width: 21,
            height: 21,
            sigma,
        });
        exp
    }

    /// Largest |difference| at least `border` pixels inside the image.
    fn max_interior_residual(exp: &Exposure, border: i32) -> f32 {
        let inner = exp.bbox().grown(-border);
        inner
            .pixels()
            .filter_map(|(x, y)| exp.masked_image.get(x, y))
            .map(|(v, _, _)| v.abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_warp_integer_offset() {
        let science_bbox = BoxI::from_origin(0, 0, 20, 20);
        // Template pixel = science pixel + (5, 3).
        let template_wcs = wcs().shifted(5.0, 3.0);
        let mut src = MaskedImage::new(BoxI::from_origin(0, 0, 30, 30));
        src.set(15, 13, (7.0, MaskPlane::CR, 2.0));
        let out = warp_masked_image(&src, &template_wcs, &wcs(), science_bbox);
        assert_eq!(out.get(10, 10), Some((7.0, MaskPlane::CR, 2.0)));
        assert_eq!(out.get(11, 10).unwrap().0, 0.0);
    }

    #[test]
    fn test_warp_outside_template_is_no_data() {
        let src = MaskedImage::filled(BoxI::from_origin(0, 0, 10, 10), 1.0, 0, 1.0);
        let out = warp_masked_image(&src, &wcs(), &wcs(), BoxI::from_origin(0, 0, 20, 20));
        assert_eq!(out.get(5, 5), Some((1.0, 0, 1.0)));
        let (v, m, var) = out.get(15, 5).unwrap();
        assert!(v.is_nan() && var.is_nan());
        assert_eq!(m, MaskPlane::NO_DATA | MaskPlane::EDGE);
    }

    #[test]
    fn test_convolve_template_matches_wider_science() {
        let science = exposure_with_star(BoxI::from_origin(0, 0, 80, 80), wcs(), (40.0, 38.0), 1000.0, 2.5);
        let template = exposure_with_star(
            BoxI::from_origin(-10, -10, 100, 100),
            wcs().shifted(5.0, 3.0),
            (45.0, 41.0),
            1000.0,
            1.5,
        );
        let res = GaussianPsfMatcher::default()
            .subtract_exposures(&template, &science, 2.5 * FWHM_PER_SIGMA, None, true)
            .unwrap();
        assert_eq!(res.psf_matching_kernel.dimensions(), (21, 21));
        assert_eq!(res.n_kernel_candidates, 0);
        assert!(max_interior_residual(&res.subtracted_exposure, 11) < 0.05);
        assert!(res.subtracted_exposure.psf.is_none());
        assert_eq!(res.subtracted_exposure.bbox(), science.bbox());
    }

    #[test]
    fn test_convolve_science_matches_wider_template() {
        let science = exposure_with_star(BoxI::from_origin(0, 0, 80, 80), wcs(), (40.0, 38.0), 1000.0, 1.5);
        let template = exposure_with_star(BoxI::from_origin(0, 0, 80, 80), wcs(), (40.0, 38.0), 1000.0, 2.5);
        let res = GaussianPsfMatcher::default()
            .subtract_exposures(&template, &science, 1.5 * FWHM_PER_SIGMA, None, false)
            .unwrap();
        assert!(max_interior_residual(&res.subtracted_exposure, 11) < 0.05);
    }

    #[test]
    fn test_identity_kernel_and_flux_scale() {
        let science = exposure_with_star(BoxI::from_origin(0, 0, 60, 60), wcs(), (30.0, 30.0), 1000.0, 2.0);
        let template = exposure_with_star(BoxI::from_origin(0, 0, 60, 60), wcs(), (30.0, 30.0), 500.0, 2.0);
        let mut candidate = SourceRecord::new(1, Footprint::new(vec![], vec![]));
        candidate.centroid = Some((30.0, 30.0));
        let res = GaussianPsfMatcher::default()
            .subtract_exposures(
                &template,
                &science,
                2.0 * FWHM_PER_SIGMA,
                Some(&[candidate]),
                true,
            )
            .unwrap();
        assert_eq!(res.psf_matching_kernel.dimensions(), (1, 1));
        assert_eq!(res.n_kernel_candidates, 1);
        assert!(max_interior_residual(&res.subtracted_exposure, 0) < 1e-3);
    }

    #[test]
    fn test_template_psf_is_required() {
        let science = exposure_with_star(BoxI::from_origin(0, 0, 20, 20), wcs(), (10.0, 10.0), 1.0, 2.0);
        let mut template = science.clone();
        template.psf = None;
        let err = GaussianPsfMatcher::default()
            .subtract_exposures(&template, &science, 4.0, None, true)
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingInput { .. }));
    }
}
