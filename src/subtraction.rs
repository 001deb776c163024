//! PSF-matched subtraction of a template from a science exposure.

use std::f64::consts::SQRT_2;

use log::{debug, info};

use crate::{
    engine::{PsfMatcher, SubtractionResult},
    error::{ImageDifferenceError, MissingInputError},
    image::Exposure,
    psf::{Kernel, FWHM_PER_SIGMA},
    repository::DataId,
    source::SourceRecord,
};

/// The science PSF width before and after pre-convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PreConvolution {
    /// Gaussian width of the science PSF \[pixels\].
    pub sigma_orig: f64,

    /// Effective width after convolving with the PSF, `sigma_orig * √2`.
    pub sigma_post: f64,

    pub kernel: Kernel,
}

pub struct DifferenceImagingStage<'a> {
    pub matcher: &'a dyn PsfMatcher,

    /// Pre-convolve with a single Gaussian of the PSF's width instead of the
    /// PSF's own kernel image.
    pub use_gaussian_for_preconvolution: bool,

    /// Convolve the template to match the science exposure. Otherwise the
    /// science exposure is convolved.
    pub convolve_template: bool,
}

/// The Gaussian width of `exposure`'s PSF.
pub fn science_sigma(exposure: &Exposure, data_id: &DataId) -> Result<f64, MissingInputError> {
    exposure
        .psf
        .as_ref()
        .map(|psf| psf.compute_gaussian_width())
        .ok_or_else(|| MissingInputError::MissingPsf {
            data_id: data_id.clone(),
        })
}

impl<'a> DifferenceImagingStage<'a> {
    /// Convolve `science` with an approximation of its own PSF. The masked
    /// image is replaced by the convolved copy; the PSF model is untouched.
    pub fn pre_convolve(
        &self,
        science: &mut Exposure,
        data_id: &DataId,
    ) -> Result<PreConvolution, MissingInputError> {
        let psf = science.psf.as_ref().ok_or_else(|| MissingInputError::MissingPsf {
            data_id: data_id.clone(),
        })?;
        let sigma_orig = psf.compute_gaussian_width();
        let kernel = if self.use_gaussian_for_preconvolution {
            let (width, height) = psf.kernel_dimensions();
            Kernel::gaussian(width, height, sigma_orig)
        } else {
            psf.kernel()
        };
        debug!(
            "Pre-convolving {data_id} with a {:?} kernel",
            kernel.dimensions()
        );
        science.masked_image = science.masked_image.convolved(&kernel);
        let sigma_post = sigma_orig * SQRT_2;
        info!("Pre-convolved science PSF sigma {sigma_orig:.3} -> {sigma_post:.3} px");
        Ok(PreConvolution {
            sigma_orig,
            sigma_post,
            kernel,
        })
    }

    /// Warp and PSF-match `template` to `science` and subtract. `science_sigma`
    /// is the effective science PSF width after any pre-convolution.
    pub fn subtract(
        &self,
        template: &Exposure,
        science: &Exposure,
        science_sigma: f64,
        candidates: Option<&[SourceRecord]>,
        data_id: &DataId,
    ) -> Result<SubtractionResult, ImageDifferenceError> {
        if !science.has_psf() {
            return Err(MissingInputError::MissingPsf {
                data_id: data_id.clone(),
            }
            .into());
        }
        let science_fwhm_pix = science_sigma * FWHM_PER_SIGMA;
        info!("Subtracting images with science FWHM {science_fwhm_pix:.3} px");
        let res = self.matcher.subtract_exposures(
            template,
            science,
            science_fwhm_pix,
            candidates,
            self.convolve_template,
        )?;
        debug!(
            "Subtraction used {} kernel candidates",
            res.n_kernel_candidates
        );
        Ok(res)
    }
}
