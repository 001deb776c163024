//! Interfaces to the numerical engines the pipeline drives, plus simple
//! reference implementations of each.
//!
//! The pipeline relies only on the trait contracts. Engine failures are
//! reported as [`EngineError`]s and are never retried.

mod astrom;
mod detection;
mod measurement;
mod psf_match;

pub use astrom::NearestNeighbourMatcher;
pub use detection::ThresholdDetector;
pub use measurement::PixelMeasurer;
pub use psf_match::{GaussianPsfMatcher, PsfMatchConfig};

use thiserror::Error;

use crate::{
    footprint::Footprint,
    image::{BackgroundModel, Exposure},
    psf::{ApertureCorrection, Kernel},
    refcat::{RefObject, ReferenceCatalog},
    source::{SourceCatalog, SourceRecord},
    wcs::Wcs,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("{engine} failed: {message}")]
    Failed {
        engine: &'static str,
        message: String,
    },

    #[error("{engine} requires {what}")]
    MissingInput {
        engine: &'static str,
        what: &'static str,
    },

    #[error("{engine}: no usable pixels")]
    NoUsablePixels { engine: &'static str },
}

/// How a detection threshold value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdType {
    /// Raw pixel value.
    Value,
    /// Multiples of the standard deviation of the image plane.
    Stdev,
    /// Multiples of the per-pixel standard deviation from the variance plane.
    PixelStdev,
    /// Raw variance-plane value.
    Variance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdPolarity {
    Positive,
    Negative,
    Both,
}

impl ThresholdPolarity {
    pub fn positive(&self) -> bool {
        matches!(self, ThresholdPolarity::Positive | ThresholdPolarity::Both)
    }

    pub fn negative(&self) -> bool {
        matches!(self, ThresholdPolarity::Negative | ThresholdPolarity::Both)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    pub threshold_value: f64,
    pub threshold_type: ThresholdType,
    pub polarity: ThresholdPolarity,

    /// Subtract the median of the unmasked pixels before thresholding.
    pub re_estimate_background: bool,

    /// Footprints with fewer pixels are discarded.
    pub min_pixels: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            threshold_value: 5.0,
            threshold_type: ThresholdType::PixelStdev,
            polarity: ThresholdPolarity::Both,
            re_estimate_background: false,
            min_pixels: 1,
        }
    }
}

/// Which measurement algorithms run.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementConfig {
    pub centroid: bool,
    pub psf_flux: bool,
    pub gaussian_flux: bool,
    pub aperture_flux: bool,
    pub shape: bool,
    pub pixel_flags: bool,
    pub sky_coord: bool,
    pub dipole: bool,
    pub do_apply_ap_corr: bool,

    /// Radius of the circular aperture \[pixels\].
    pub aperture_radius: f64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        MeasurementConfig {
            centroid: true,
            psf_flux: true,
            gaussian_flux: true,
            aperture_flux: true,
            shape: true,
            pixel_flags: true,
            sky_coord: true,
            dipole: true,
            do_apply_ap_corr: true,
            aperture_radius: 7.0,
        }
    }
}

impl MeasurementConfig {
    /// PSF flux, pixel flags, shape, Gaussian flux and sky coordinate; no
    /// aperture correction.
    pub fn minimal() -> MeasurementConfig {
        MeasurementConfig {
            centroid: true,
            psf_flux: true,
            gaussian_flux: true,
            aperture_flux: false,
            shape: true,
            pixel_flags: true,
            sky_coord: true,
            dipole: false,
            do_apply_ap_corr: false,
            aperture_radius: 7.0,
        }
    }
}

/// Positive and negative footprints from one detection pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FootprintSets {
    pub positive: Vec<Footprint>,
    pub negative: Vec<Footprint>,
}

pub trait SourceDetector: Send + Sync {
    /// Detect footprints above threshold. Sets `DETECTED` (and
    /// `DETECTED_NEGATIVE`) on the footprint pixels. When `smoothing_sigma`
    /// is given the image is smoothed with a Gaussian of that width first.
    fn detect(
        &self,
        exposure: &mut Exposure,
        config: &DetectionConfig,
        smoothing_sigma: Option<f64>,
    ) -> Result<FootprintSets, EngineError>;
}

pub trait SourceMeasurer: Send + Sync {
    /// Fill the measurement fields of every record in `sources`.
    fn measure(
        &self,
        exposure: &Exposure,
        sources: &mut SourceCatalog,
        config: &MeasurementConfig,
        ap_corr: Option<&ApertureCorrection>,
    ) -> Result<(), EngineError>;
}

/// A source associated with a reference object.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMatch {
    pub reference: RefObject,
    pub source_id: u64,
    pub distance_arcsec: f64,
}

pub trait AstrometricMatcher: Send + Sync {
    /// Match sources to reference objects using an existing WCS; nothing is
    /// fitted.
    fn use_known_wcs(
        &self,
        sources: &[SourceRecord],
        wcs: &Wcs,
        refcat: &ReferenceCatalog,
        radius_arcsec: f64,
    ) -> Result<Vec<SourceMatch>, EngineError>;
}

/// The output of a PSF-matched subtraction.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtractionResult {
    pub subtracted_exposure: Exposure,

    /// The warped template after PSF matching (or the warped template when
    /// the science exposure was convolved instead).
    pub matched_exposure: Exposure,

    pub warped_exposure: Exposure,
    pub psf_matching_kernel: Kernel,
    pub background_model: BackgroundModel,
    pub n_kernel_candidates: usize,
}

pub trait PsfMatcher: Send + Sync {
    /// Warp `template` onto `science`, match PSFs and subtract.
    ///
    /// `candidates` are sources suitable for fitting the matching kernel;
    /// `None` lets the engine proceed without them.
    fn subtract_exposures(
        &self,
        template: &Exposure,
        science: &Exposure,
        science_fwhm_pix: f64,
        candidates: Option<&[SourceRecord]>,
        convolve_template: bool,
    ) -> Result<SubtractionResult, EngineError>;
}
