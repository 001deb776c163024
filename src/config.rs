//! Task configuration.

use thiserror::Error;

use crate::{
    engine::{DetectionConfig, MeasurementConfig, PsfMatchConfig},
    selection::{SelectionConfig, SourceSelectorConfig},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Cannot run source measurement without source detection.")]
    MeasurementWithoutDetection,

    #[error("Cannot run source merging without source detection.")]
    MergeWithoutDetection,

    #[error("Cannot write HeavyFootprints (do_write_heavy_footprints_in_sources) without do_write_sources")]
    HeavyFootprintsWithoutSources,

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDifferenceConfig {
    /// Prefix of the template datasets, typically "deep" or "goodSeeing".
    pub coadd_name: String,

    /// Add the calexp background back before processing.
    pub do_add_calexp_background: bool,

    /// Select stars to constrain the PSF-matching kernel.
    pub do_select_sources: bool,

    /// Compute the subtracted exposure.
    pub do_subtract: bool,

    /// Convolve the science image with its own PSF before matching. This
    /// symmetrises the noise and disables smoothing at detection.
    pub do_pre_convolve: bool,

    /// Pre-convolve with a Gaussian of the PSF's width rather than the PSF
    /// kernel itself.
    pub use_gaussian_for_preconvolution: bool,

    pub do_detection: bool,

    /// Merge positive and negative diaSources within `grow_footprint`.
    pub do_merge: bool,

    /// Match diaSources to the exposure's src catalog and the reference
    /// catalog.
    pub do_match_sources: bool,

    pub do_measurement: bool,
    pub do_write_subtracted_exp: bool,

    /// Write the warped and PSF-matched template.
    pub do_write_matched_exp: bool,

    pub do_write_sources: bool,

    /// Keep the pixel values of diaSource footprints when writing them.
    pub do_write_heavy_footprints_in_sources: bool,

    /// Which image is convolved to match the other. `true` convolves the
    /// template.
    pub convolve_template: bool,

    /// Grow positive and negative footprints by this many pixels before
    /// merging.
    pub grow_footprint: i32,

    /// Match radius for diaSource association \[arcsec\].
    pub dia_source_match_radius: f64,

    pub source_selector: SourceSelectorConfig,

    /// Initial high-threshold detection and measurement used to feed stars
    /// to kernel fitting.
    pub selection: SelectionConfig,

    pub psf_match: PsfMatchConfig,

    /// Low-threshold detection on the difference image.
    pub detection: DetectionConfig,

    /// Final diaSource measurement.
    pub measurement: MeasurementConfig,
}

impl Default for ImageDifferenceConfig {
    fn default() -> Self {
        ImageDifferenceConfig {
            coadd_name: "deep".to_string(),
            do_add_calexp_background: true,
            do_select_sources: true,
            do_subtract: true,
            do_pre_convolve: true,
            use_gaussian_for_preconvolution: true,
            do_detection: true,
            do_merge: true,
            do_match_sources: true,
            do_measurement: true,
            do_write_subtracted_exp: true,
            do_write_matched_exp: false,
            do_write_sources: true,
            do_write_heavy_footprints_in_sources: false,
            convolve_template: true,
            grow_footprint: 2,
            dia_source_match_radius: 0.5,
            source_selector: SourceSelectorConfig::default(),
            selection: SelectionConfig::default(),
            psf_match: PsfMatchConfig::default(),
            detection: DetectionConfig::default(),
            measurement: MeasurementConfig::default(),
        }
    }
}

impl ImageDifferenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.do_measurement && !self.do_detection {
            return Err(ConfigError::MeasurementWithoutDetection);
        }
        if self.do_merge && !self.do_detection {
            return Err(ConfigError::MergeWithoutDetection);
        }
        if self.do_write_heavy_footprints_in_sources && !self.do_write_sources {
            return Err(ConfigError::HeavyFootprintsWithoutSources);
        }
        if self.grow_footprint < 0 {
            return Err(ConfigError::InvalidValue {
                field: "grow_footprint",
                message: format!("must be non-negative, got {}", self.grow_footprint),
            });
        }
        if !(self.dia_source_match_radius.is_finite() && self.dia_source_match_radius > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "dia_source_match_radius",
                message: format!("must be positive, got {}", self.dia_source_match_radius),
            });
        }
        if self.coadd_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "coadd_name",
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(ImageDifferenceConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_measurement_requires_detection() {
        let config = ImageDifferenceConfig {
            do_detection: false,
            do_merge: false,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::MeasurementWithoutDetection)
        );
    }

    #[test]
    fn test_merge_requires_detection() {
        let config = ImageDifferenceConfig {
            do_detection: false,
            do_measurement: false,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MergeWithoutDetection));
    }

    #[test]
    fn test_heavy_footprints_require_sources() {
        let config = ImageDifferenceConfig {
            do_write_sources: false,
            do_write_heavy_footprints_in_sources: true,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::HeavyFootprintsWithoutSources)
        );
    }

    #[test]
    fn test_detection_off_with_dependants_off() {
        let config = ImageDifferenceConfig {
            do_detection: false,
            do_merge: false,
            do_measurement: false,
            ..Default::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_invalid_values() {
        let config = ImageDifferenceConfig {
            grow_footprint: -1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "grow_footprint",
                ..
            })
        ));
        let config = ImageDifferenceConfig {
            dia_source_match_radius: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "dia_source_match_radius",
                ..
            })
        ));
    }
}
