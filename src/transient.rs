//! Detection and measurement of transients on a difference image.

use log::{debug, info};

use crate::{
    engine::{
        DetectionConfig, MeasurementConfig, SourceDetector, SourceMeasurer, ThresholdPolarity,
    },
    error::ImageDifferenceError,
    footprint::merge_footprints,
    image::{Exposure, MaskPlane},
    psf::ApertureCorrection,
    source::{IdFactory, SourceCatalog, SourceRecord},
};

pub struct TransientDetectionStage<'a> {
    pub detector: &'a dyn SourceDetector,
    pub measurer: &'a dyn SourceMeasurer,
    pub detection: &'a DetectionConfig,
    pub measurement: &'a MeasurementConfig,

    /// Dilation radius \[pixels\] applied before merging.
    pub grow_footprint: i32,

    pub merge_positive_negative: bool,
}

impl<'a> TransientDetectionStage<'a> {
    /// Detect positive and negative footprints on `exposure` and turn them
    /// into records with ids from `id_factory`.
    ///
    /// Stale detection bits are cleared first. With merging enabled,
    /// footprints of either polarity whose grown extents touch become one
    /// record; otherwise each footprint is its own record and negative ones
    /// are flagged.
    pub fn detect(
        &self,
        exposure: &mut Exposure,
        smoothing_sigma: Option<f64>,
        id_factory: &mut IdFactory,
    ) -> Result<Vec<SourceRecord>, ImageDifferenceError> {
        exposure
            .masked_image
            .clear_mask_bits(MaskPlane::DETECTED | MaskPlane::DETECTED_NEGATIVE);

        let config = DetectionConfig {
            polarity: ThresholdPolarity::Both,
            ..self.detection.clone()
        };
        let sets = self.detector.detect(exposure, &config, smoothing_sigma)?;
        info!(
            "Detected {} positive and {} negative footprints",
            sets.positive.len(),
            sets.negative.len()
        );

        let footprints: Vec<(bool, _)> = if self.merge_positive_negative {
            let n = sets.positive.len() + sets.negative.len();
            let mut all = sets.positive;
            all.extend(sets.negative);
            let merged = merge_footprints(all, self.grow_footprint);
            info!("Merged {n} footprints into {} sources", merged.len());
            merged
                .into_iter()
                .map(|fp| (!fp.has_positive() && fp.has_negative(), fp))
                .collect()
        } else {
            sets.positive
                .into_iter()
                .map(|fp| (false, fp))
                .chain(sets.negative.into_iter().map(|fp| (true, fp)))
                .collect()
        };

        footprints
            .into_iter()
            .map(|(negative, fp)| -> Result<SourceRecord, ImageDifferenceError> {
                let mut record = SourceRecord::new(id_factory.next_id()?, fp);
                record.negative = negative;
                Ok(record)
            })
            .collect()
    }

    /// Measure `sources` on `exposure`, applying `ap_corr` when the
    /// measurement config asks for it.
    pub fn measure(
        &self,
        exposure: &Exposure,
        sources: &mut SourceCatalog,
        ap_corr: Option<&ApertureCorrection>,
    ) -> Result<(), ImageDifferenceError> {
        debug!("Measuring {} diaSources", sources.len());
        self.measurer
            .measure(exposure, sources, self.measurement, ap_corr)?;
        Ok(())
    }
}
