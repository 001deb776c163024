//! Selection of sources for fitting the PSF-matching kernel.
//!
//! Candidates come either from the exposure's existing `src` catalog or from
//! a fresh high-threshold detection. They are matched to the reference
//! catalog with the exposure's WCS and filtered by a [`SourceSelector`].

use std::{fmt, str::FromStr};

use log::{debug, info, warn};
use ndarray::Zip;

use crate::{
    engine::{
        AstrometricMatcher, DetectionConfig, MeasurementConfig, SourceDetector, SourceMatch,
        SourceMeasurer, ThresholdPolarity, ThresholdType,
    },
    error::ImageDifferenceError,
    image::{Exposure, MaskPlane, MaskedImage},
    refcat::ReferenceCatalog,
    repository::{DataRef, DatasetType},
    source::{IdFactory, SourceCatalog, SourceRecord},
};

/// A policy picking star-like, well-measured sources.
pub trait SourceSelector: Send + Sync {
    fn name(&self) -> &'static str;

    fn select_sources(
        &self,
        exposure: &Exposure,
        sources: &[SourceRecord],
        matches: &[SourceMatch],
    ) -> Vec<SourceRecord>;
}

fn matched<'m>(matches: &'m [SourceMatch], source: &SourceRecord) -> Option<&'m SourceMatch> {
    matches.iter().find(|m| m.source_id == source.id)
}

/// Sources matched to reference objects flagged as stars.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogStarSelector;

impl SourceSelector for CatalogStarSelector {
    fn name(&self) -> &'static str {
        "catalog"
    }

    fn select_sources(
        &self,
        _exposure: &Exposure,
        sources: &[SourceRecord],
        matches: &[SourceMatch],
    ) -> Vec<SourceRecord> {
        sources
            .iter()
            .filter(|s| s.flags.is_good())
            .filter(|s| matched(matches, s).map_or(false, |m| m.reference.is_star))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecondMomentSelectorConfig {
    /// Half-width of the accepted clump, in robust standard deviations.
    pub clump_n_sigma: f64,

    /// Sources fainter than this PSF flux are not considered.
    pub flux_min: f64,
}

impl Default for SecondMomentSelectorConfig {
    fn default() -> Self {
        SecondMomentSelectorConfig {
            clump_n_sigma: 2.0,
            flux_min: 0.0,
        }
    }
}

/// Sources in the dominant clump of the moment-size distribution. Stars all
/// share the PSF's size; galaxies are larger and scattered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecondMomentStarSelector {
    pub config: SecondMomentSelectorConfig,
}

fn median(values: &mut [f64]) -> f64 {
    let mid = values.len() / 2;
    let (_, m, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    *m
}

impl SourceSelector for SecondMomentStarSelector {
    fn name(&self) -> &'static str {
        "secondMoment"
    }

    fn select_sources(
        &self,
        _exposure: &Exposure,
        sources: &[SourceRecord],
        _matches: &[SourceMatch],
    ) -> Vec<SourceRecord> {
        let size = |s: &SourceRecord| -> Option<f64> {
            let shape = s.shape?;
            let flux = s.psf_flux?;
            (s.flags.is_good() && flux > self.config.flux_min).then(|| 0.5 * (shape.xx + shape.yy))
        };
        let mut sizes: Vec<f64> = sources.iter().filter_map(size).collect();
        if sizes.is_empty() {
            return vec![];
        }
        let center = median(&mut sizes);
        let mut deviations: Vec<f64> = sizes.iter().map(|s| (s - center).abs()).collect();
        // 1.4826 MAD estimates σ for normally distributed sizes.
        let sigma = (1.4826 * median(&mut deviations)).max(1e-3 * center.abs());
        let half_width = self.config.clump_n_sigma * sigma;
        debug!("Moment clump at {center:.3} ± {half_width:.3} px²");
        sources
            .iter()
            .filter(|s| size(s).map_or(false, |v| (v - center).abs() <= half_width))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiaCatalogSelectorConfig {
    /// Brightest accepted reference magnitude.
    pub bright_mag: f64,

    /// Faintest accepted reference magnitude.
    pub faint_mag: f64,

    pub include_variables: bool,
}

impl Default for DiaCatalogSelectorConfig {
    fn default() -> Self {
        DiaCatalogSelectorConfig {
            bright_mag: 15.0,
            faint_mag: 22.0,
            include_variables: false,
        }
    }
}

/// Reference-matched, non-variable stars within a magnitude range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiaCatalogStarSelector {
    pub config: DiaCatalogSelectorConfig,
}

impl SourceSelector for DiaCatalogStarSelector {
    fn name(&self) -> &'static str {
        "diacatalog"
    }

    fn select_sources(
        &self,
        _exposure: &Exposure,
        sources: &[SourceRecord],
        matches: &[SourceMatch],
    ) -> Vec<SourceRecord> {
        let c = &self.config;
        sources
            .iter()
            .filter(|s| s.flags.is_good())
            .filter(|s| {
                matched(matches, s).map_or(false, |m| {
                    let r = &m.reference;
                    r.is_star
                        && (c.include_variables || !r.is_variable)
                        && r.mag >= c.bright_mag
                        && r.mag <= c.faint_mag
                })
            })
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSelectorName {
    Catalog,
    SecondMoment,
    DiaCatalog,
}

impl fmt::Display for SourceSelectorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSelectorName::Catalog => write!(f, "catalog"),
            SourceSelectorName::SecondMoment => write!(f, "secondMoment"),
            SourceSelectorName::DiaCatalog => write!(f, "diacatalog"),
        }
    }
}

impl FromStr for SourceSelectorName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "catalog" => Ok(SourceSelectorName::Catalog),
            "secondMoment" => Ok(SourceSelectorName::SecondMoment),
            "diacatalog" => Ok(SourceSelectorName::DiaCatalog),
            _ => Err(format!(
                "unknown source selector '{s}'; expected one of catalog, secondMoment, diacatalog"
            )),
        }
    }
}

/// Names the active selector and holds every variant's settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSelectorConfig {
    pub name: SourceSelectorName,
    pub second_moment: SecondMomentSelectorConfig,
    pub dia_catalog: DiaCatalogSelectorConfig,
}

impl Default for SourceSelectorConfig {
    fn default() -> Self {
        SourceSelectorConfig {
            name: SourceSelectorName::DiaCatalog,
            second_moment: SecondMomentSelectorConfig::default(),
            dia_catalog: DiaCatalogSelectorConfig::default(),
        }
    }
}

impl SourceSelectorConfig {
    pub fn apply(&self) -> Box<dyn SourceSelector> {
        match self.name {
            SourceSelectorName::Catalog => Box::new(CatalogStarSelector),
            SourceSelectorName::SecondMoment => Box::new(SecondMomentStarSelector {
                config: self.second_moment.clone(),
            }),
            SourceSelectorName::DiaCatalog => Box::new(DiaCatalogStarSelector {
                config: self.dia_catalog.clone(),
            }),
        }
    }
}

/// Detection and measurement used when no `src` catalog exists.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionConfig {
    pub detection: DetectionConfig,
    pub measurement: MeasurementConfig,

    /// Reference match radius \[arcsec\].
    pub match_radius_arcsec: f64,

    /// Subtract the median sky from the scratch copy that is detected and
    /// measured. The calexp background is normally added back by then.
    pub remove_sky_level: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig {
            detection: DetectionConfig {
                threshold_value: 10.0,
                threshold_type: ThresholdType::PixelStdev,
                polarity: ThresholdPolarity::Positive,
                re_estimate_background: false,
                min_pixels: 1,
            },
            measurement: MeasurementConfig::minimal(),
            match_radius_arcsec: 1.0,
            remove_sky_level: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionResult {
    /// Every candidate considered.
    pub sources: Vec<SourceRecord>,

    /// The candidates accepted for kernel fitting.
    pub kernel_sources: Vec<SourceRecord>,

    pub matches: Vec<SourceMatch>,

    /// Whether the candidates came from the stored `src` catalog.
    pub from_src_catalog: bool,
}

pub struct SourceSelectionStage<'a> {
    pub config: &'a SelectionConfig,
    pub detector: &'a dyn SourceDetector,
    pub measurer: &'a dyn SourceMeasurer,
    pub matcher: &'a dyn AstrometricMatcher,
    pub selector: &'a dyn SourceSelector,
}

impl<'a> SourceSelectionStage<'a> {
    /// Select kernel candidates on `exposure`. `science_sigma` is the PSF
    /// width of the exposure before pre-convolution and is used as the
    /// detection smoothing scale when `do_smooth` is set. The exposure itself
    /// is not modified.
    pub fn select(
        &self,
        exposure: &Exposure,
        data_ref: &DataRef,
        refcat: Option<&ReferenceCatalog>,
        science_sigma: f64,
        do_smooth: bool,
        id_factory: &mut IdFactory,
    ) -> Result<SelectionResult, ImageDifferenceError> {
        let src: Option<SourceCatalog> = data_ref.get(&DatasetType::Src)?;
        let (sources, from_src_catalog) = match src {
            Some(src) => {
                info!("Source selection via src product");
                (src.records, true)
            }
            None => {
                warn!("Src product does not exist; running detection, measurement, selection");
                let sources =
                    self.detect_and_measure(exposure, science_sigma, do_smooth, id_factory)?;
                (sources, false)
            }
        };

        let matches = match (&exposure.wcs, refcat) {
            (Some(wcs), Some(refcat)) => {
                let region =
                    refcat.load_pixel_box(wcs, exposure.bbox(), self.config.match_radius_arcsec);
                self.matcher
                    .use_known_wcs(&sources, wcs, &region, self.config.match_radius_arcsec)?
            }
            _ => {
                warn!(
                    "No reference catalog for {}; kernel candidates are unmatched",
                    data_ref.data_id
                );
                vec![]
            }
        };

        let kernel_sources = self.selector.select_sources(exposure, &sources, &matches);
        info!(
            "Selected {} / {} sources for Psf matching",
            kernel_sources.len(),
            sources.len()
        );
        Ok(SelectionResult {
            sources,
            kernel_sources,
            matches,
            from_src_catalog,
        })
    }

    fn detect_and_measure(
        &self,
        exposure: &Exposure,
        science_sigma: f64,
        do_smooth: bool,
        id_factory: &mut IdFactory,
    ) -> Result<Vec<SourceRecord>, ImageDifferenceError> {
        // Detection marks mask planes; keep them off the science exposure.
        let mut scratch = exposure.clone();
        if self.config.remove_sky_level {
            if let Some(sky) = sky_level(&scratch.masked_image) {
                debug!("Removing sky level {sky:.3} before selection detection");
                scratch.masked_image.image.mapv_inplace(|v| v - sky as f32);
            }
        }
        let sets = self.detector.detect(
            &mut scratch,
            &self.config.detection,
            do_smooth.then_some(science_sigma),
        )?;
        let records = sets
            .positive
            .into_iter()
            .map(|fp| -> Result<SourceRecord, ImageDifferenceError> {
                Ok(SourceRecord::new(id_factory.next_id()?, fp))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut catalog = SourceCatalog::new(records);
        self.measurer
            .measure(&scratch, &mut catalog, &self.config.measurement, None)?;
        Ok(catalog.records)
    }
}

/// Median of the finite pixels without `UNUSABLE` bits.
fn sky_level(mi: &MaskedImage) -> Option<f64> {
    let mut values: Vec<f32> = Zip::from(&mi.image)
        .and(&mi.mask)
        .fold(Vec::new(), |mut acc, &v, &m| {
            if v.is_finite() && m & MaskPlane::UNUSABLE == 0 {
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
