//! The image-differencing task: template assembly, subtraction, detection,
//! measurement and association for one science exposure.

use std::{fmt, sync::Arc};

use itertools::Itertools;
use log::{debug, info, warn};

use crate::{
    config::{ConfigError, ImageDifferenceConfig},
    crossmatch::CrossMatchStage,
    engine::{
        AstrometricMatcher, GaussianPsfMatcher, NearestNeighbourMatcher, PixelMeasurer,
        PsfMatcher, SourceDetector, SourceMeasurer, SubtractionResult, ThresholdDetector,
    },
    error::{ImageDifferenceError, MissingInputError, PartialDataWarning},
    image::{BackgroundModel, Exposure},
    observer::{NoopObserver, TaskObserver},
    psf::{ApertureCorrection, Psf},
    refcat::ReferenceCatalog,
    repository::{DataId, DataRef, DatasetType},
    selection::{SourceSelectionStage, SourceSelector},
    source::{IdFactory, SourceCatalog, SourceRecord},
    subtraction::{science_sigma, DifferenceImagingStage},
    template::{TemplateAssembler, TemplateAssemblyResult},
    transient::TransientDetectionStage,
};

/// The stages a run may execute, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    TemplateAssembly,
    PreConvolution,
    SourceSelection,
    Subtraction,
    Detection,
    Measurement,
    CrossMatch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::TemplateAssembly => "template assembly",
            Stage::PreConvolution => "pre-convolution",
            Stage::SourceSelection => "source selection",
            Stage::Subtraction => "subtraction",
            Stage::Detection => "detection",
            Stage::Measurement => "measurement",
            Stage::CrossMatch => "cross-match",
        };
        write!(f, "{name}")
    }
}

/// A typed summary of one run, persisted as `{coadd}Diff_metadata`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageDifferenceMetadata {
    pub data_id: DataId,
    pub exposure_id: u64,

    /// Gaussian width of the science PSF \[pixels\].
    pub science_sigma_orig: f64,

    /// Effective science PSF width used for matching \[pixels\].
    pub science_sigma_post: f64,

    pub tract: Option<u32>,
    pub n_patches_found: Option<usize>,

    /// Kernel candidates considered and selected.
    pub n_candidates: Option<usize>,
    pub n_kernel_sources: Option<usize>,

    pub n_dia_sources: Option<usize>,
    pub n_src_matches: Option<usize>,
    pub n_ref_matches: Option<usize>,

    pub stages: Vec<Stage>,
    pub n_warnings: usize,
}

#[derive(Debug, Clone)]
pub struct ImageDifferenceResult {
    /// The difference exposure after detection, if one was computed or read.
    pub subtracted_exposure: Option<Exposure>,

    pub subtract_res: Option<SubtractionResult>,
    pub template: Option<TemplateAssemblyResult>,

    /// diaSources, if detection ran.
    pub sources: Option<SourceCatalog>,

    pub kernel_sources: Vec<SourceRecord>,
    pub stages: Vec<Stage>,
    pub warnings: Vec<PartialDataWarning>,
    pub metadata: ImageDifferenceMetadata,
}

pub struct ImageDifferenceTask {
    config: ImageDifferenceConfig,
    detector: Box<dyn SourceDetector>,
    measurer: Box<dyn SourceMeasurer>,
    astrometric_matcher: Box<dyn AstrometricMatcher>,
    psf_matcher: Box<dyn PsfMatcher>,
    selector: Box<dyn SourceSelector>,
    observer: Box<dyn TaskObserver>,
}

/// Mutable state of one run.
struct RunState {
    stages: Vec<Stage>,
    warnings: Vec<PartialDataWarning>,
    template: Option<TemplateAssemblyResult>,
}

impl RunState {
    fn warn(&mut self, dataset: &DatasetType, data_id: &DataId) {
        let w = PartialDataWarning {
            dataset: dataset.to_string(),
            data_id: data_id.clone(),
        };
        warn!("{w}");
        self.warnings.push(w);
    }
}

impl ImageDifferenceTask {
    /// A task with the built-in engines. The config is validated here, before
    /// anything runs.
    pub fn new(config: ImageDifferenceConfig) -> Result<ImageDifferenceTask, ConfigError> {
        config.validate()?;
        Ok(ImageDifferenceTask {
            psf_matcher: Box::new(GaussianPsfMatcher::new(config.psf_match.clone())),
            selector: config.source_selector.apply(),
            config,
            detector: Box::new(ThresholdDetector),
            measurer: Box::new(PixelMeasurer),
            astrometric_matcher: Box::new(NearestNeighbourMatcher),
            observer: Box::new(NoopObserver),
        })
    }

    pub fn with_detector(mut self, detector: impl SourceDetector + 'static) -> Self {
        self.detector = Box::new(detector);
        self
    }

    pub fn with_measurer(mut self, measurer: impl SourceMeasurer + 'static) -> Self {
        self.measurer = Box::new(measurer);
        self
    }

    pub fn with_astrometric_matcher(mut self, matcher: impl AstrometricMatcher + 'static) -> Self {
        self.astrometric_matcher = Box::new(matcher);
        self
    }

    pub fn with_psf_matcher(mut self, matcher: impl PsfMatcher + 'static) -> Self {
        self.psf_matcher = Box::new(matcher);
        self
    }

    pub fn with_selector(mut self, selector: impl SourceSelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    pub fn with_observer(mut self, observer: impl TaskObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn config(&self) -> &ImageDifferenceConfig {
        &self.config
    }

    fn dataset(&self, f: fn(String) -> DatasetType) -> DatasetType {
        f(self.config.coadd_name.clone())
    }

    /// Subtract the template from the exposure identified by `data_ref`,
    /// detect and measure diaSources and associate them.
    pub fn run(&self, data_ref: &DataRef) -> Result<ImageDifferenceResult, ImageDifferenceError> {
        let data_id = data_ref.data_id;
        info!("Processing {data_id}");
        let config = &self.config;
        let mut state = RunState {
            stages: vec![],
            warnings: vec![],
            template: None,
        };

        let mut id_factory = make_id_factory(data_ref)?;
        let mut exposure = self.read_exposure(data_ref, &mut state)?;
        let sigma_orig = science_sigma(&exposure, data_id)?;
        let mut sigma_post = sigma_orig;
        let refcat: Option<Arc<ReferenceCatalog>> =
            data_ref.get_id(&DatasetType::RefCat, &DataId::default())?;

        let mut difference: Option<Exposure> = None;
        let mut subtract_res = None;
        let mut kernel_sources = vec![];
        let mut n_candidates = None;
        if config.do_subtract {
            self.ensure_template(&exposure, data_ref, &mut state)?;
            let subtraction = DifferenceImagingStage {
                matcher: self.psf_matcher.as_ref(),
                use_gaussian_for_preconvolution: config.use_gaussian_for_preconvolution,
                convolve_template: config.convolve_template,
            };
            if config.do_pre_convolve {
                sigma_post = subtraction.pre_convolve(&mut exposure, data_id)?.sigma_post;
                state.stages.push(Stage::PreConvolution);
            }

            if config.do_select_sources {
                let selection = SourceSelectionStage {
                    config: &config.selection,
                    detector: self.detector.as_ref(),
                    measurer: self.measurer.as_ref(),
                    matcher: self.astrometric_matcher.as_ref(),
                    selector: self.selector.as_ref(),
                };
                let selected = selection.select(
                    &exposure,
                    data_ref,
                    refcat.as_deref(),
                    sigma_orig,
                    !config.do_pre_convolve,
                    &mut id_factory,
                )?;
                n_candidates = Some(selected.sources.len());
                kernel_sources = selected.kernel_sources;
                state.stages.push(Stage::SourceSelection);
            }

            let template = state
                .template
                .as_ref()
                .map(|t| &t.exposure)
                .ok_or(MissingInputError::MissingDataset {
                    dataset: self.dataset(DatasetType::Coadd).to_string(),
                    data_id: data_id.clone(),
                })?;
            let res = subtraction.subtract(
                template,
                &exposure,
                sigma_post,
                config.do_select_sources.then_some(kernel_sources.as_slice()),
                data_id,
            )?;
            state.stages.push(Stage::Subtraction);
            if config.do_write_matched_exp {
                data_ref.put(
                    &self.dataset(DatasetType::DiffMatchedExp),
                    res.matched_exposure.clone(),
                );
            }
            self.observer.on_subtracted(&res.subtracted_exposure);
            difference = Some(res.subtracted_exposure.clone());
            subtract_res = Some(res);
        }

        let mut sources = None;
        let mut n_src_matches = None;
        let mut n_ref_matches = None;
        if config.do_detection {
            let mut diff = match difference.take() {
                Some(d) => d,
                None => {
                    let diff_type = self.dataset(DatasetType::DiffExp);
                    data_ref.get::<Exposure>(&diff_type)?.ok_or(
                        MissingInputError::MissingDataset {
                            dataset: diff_type.to_string(),
                            data_id: data_id.clone(),
                        },
                    )?
                }
            };
            if diff.psf.is_none() {
                diff.psf = Some(if config.convolve_template {
                    exposure.psf.clone().ok_or(MissingInputError::MissingPsf {
                        data_id: data_id.clone(),
                    })?
                } else {
                    self.template_psf(&exposure, data_ref, &mut state)?
                });
            }

            let detection = TransientDetectionStage {
                detector: self.detector.as_ref(),
                measurer: self.measurer.as_ref(),
                detection: &config.detection,
                measurement: &config.measurement,
                grow_footprint: if config.do_merge {
                    config.grow_footprint
                } else {
                    0
                },
                merge_positive_negative: config.do_merge,
            };
            let smoothing = if config.do_pre_convolve {
                None
            } else {
                diff.psf.as_ref().map(Psf::compute_gaussian_width)
            };
            let records = detection.detect(&mut diff, smoothing, &mut id_factory)?;
            state.stages.push(Stage::Detection);
            let mut catalog = SourceCatalog::new(records);
            catalog.write_heavy_footprints = config.do_write_heavy_footprints_in_sources;

            if config.do_measurement {
                let ap_corr = self.ap_corr(&exposure, data_ref, &mut state)?;
                detection.measure(&diff, &mut catalog, ap_corr.as_ref())?;
                state.stages.push(Stage::Measurement);
            }

            if config.do_match_sources {
                let wcs = diff.wcs.or(exposure.wcs).ok_or(MissingInputError::MissingDataset {
                    dataset: "differenceExp WCS".to_string(),
                    data_id: data_id.clone(),
                })?;
                let prior: Option<SourceCatalog> = data_ref.get(&DatasetType::Src)?;
                let cross_match = CrossMatchStage {
                    matcher: self.astrometric_matcher.as_ref(),
                    radius_arcsec: config.dia_source_match_radius,
                };
                let summary = cross_match.run(
                    &mut catalog.records,
                    prior.as_ref().map(|p| p.records.as_slice()),
                    refcat.as_deref(),
                    &wcs,
                    diff.bbox(),
                )?;
                n_src_matches = summary.n_src_matches;
                n_ref_matches = summary.n_ref_matches;
                state.stages.push(Stage::CrossMatch);
            }
            self.observer.on_detected(&diff, &catalog.records);

            if config.do_write_sources {
                if catalog.write_heavy_footprints {
                    for r in &mut catalog.records {
                        r.footprint.make_heavy(&diff.masked_image);
                    }
                }
                data_ref.put(
                    &self.dataset(DatasetType::DiffDiaSrc),
                    catalog.for_persistence(),
                );
            }
            sources = Some(catalog);
            difference = Some(diff);
        }

        if config.do_write_subtracted_exp {
            if let Some(diff) = &difference {
                data_ref.put(&self.dataset(DatasetType::DiffExp), diff.clone());
            }
        }

        let metadata = ImageDifferenceMetadata {
            data_id: data_id.clone(),
            exposure_id: id_factory.exposure_id(),
            science_sigma_orig: sigma_orig,
            science_sigma_post: sigma_post,
            tract: state.template.as_ref().map(|t| t.tract),
            n_patches_found: state.template.as_ref().map(|t| t.n_patches_found),
            n_candidates,
            n_kernel_sources: n_candidates.map(|_| kernel_sources.len()),
            n_dia_sources: sources.as_ref().map(SourceCatalog::len),
            n_src_matches,
            n_ref_matches,
            stages: state.stages.clone(),
            n_warnings: state.warnings.len(),
        };
        data_ref.put(&self.dataset(DatasetType::DiffMetadata), metadata.clone());
        info!(
            "Finished {data_id}: stages [{}], {} warnings",
            state.stages.iter().join(", "),
            state.warnings.len()
        );

        Ok(ImageDifferenceResult {
            subtracted_exposure: difference,
            subtract_res,
            template: state.template,
            sources,
            kernel_sources,
            stages: state.stages,
            warnings: state.warnings,
            metadata,
        })
    }

    /// Read the calexp, install its PSF and add its background back.
    fn read_exposure(
        &self,
        data_ref: &DataRef,
        state: &mut RunState,
    ) -> Result<Exposure, ImageDifferenceError> {
        let data_id = data_ref.data_id;
        let mut exposure: Exposure = data_ref.get(&DatasetType::Calexp)?.ok_or(
            MissingInputError::MissingDataset {
                dataset: DatasetType::Calexp.to_string(),
                data_id: data_id.clone(),
            },
        )?;
        let psf: Psf = data_ref
            .get(&DatasetType::Psf)?
            .ok_or(MissingInputError::MissingPsf {
                data_id: data_id.clone(),
            })?;
        exposure.psf = Some(psf);
        self.observer.on_repair(&exposure);

        if self.config.do_add_calexp_background {
            match data_ref.get::<BackgroundModel>(&DatasetType::CalexpBackground)? {
                Some(background) => {
                    debug!("Adding calexp background to {data_id}");
                    background.add_to(&mut exposure.masked_image);
                }
                None => state.warn(&DatasetType::CalexpBackground, data_id),
            }
            self.observer.on_background(&exposure);
        }
        Ok(exposure)
    }

    /// Assemble the template unless this run already has it.
    fn ensure_template<'s>(
        &self,
        exposure: &Exposure,
        data_ref: &DataRef,
        state: &'s mut RunState,
    ) -> Result<&'s TemplateAssemblyResult, ImageDifferenceError> {
        let template = match state.template.take() {
            Some(t) => t,
            None => {
                let t = TemplateAssembler::new(&self.config.coadd_name)
                    .assemble(exposure, data_ref)?;
                state.stages.push(Stage::TemplateAssembly);
                state.warnings.extend(t.warnings.iter().cloned());
                t
            }
        };
        Ok(state.template.insert(template))
    }

    fn template_psf(
        &self,
        exposure: &Exposure,
        data_ref: &DataRef,
        state: &mut RunState,
    ) -> Result<Psf, ImageDifferenceError> {
        let template = self.ensure_template(exposure, data_ref, state)?;
        template.exposure.psf.clone().ok_or_else(|| {
            MissingInputError::NoPsfFound {
                tract: template.tract,
            }
            .into()
        })
    }

    /// The aperture correction for diaSource measurement: the exposure's own
    /// when the template was convolved, else the template's.
    fn ap_corr(
        &self,
        exposure: &Exposure,
        data_ref: &DataRef,
        state: &mut RunState,
    ) -> Result<Option<ApertureCorrection>, ImageDifferenceError> {
        if self.config.convolve_template {
            let ap_corr = data_ref.get::<ApertureCorrection>(&DatasetType::ApCorr)?;
            if ap_corr.is_none() {
                state.warn(&DatasetType::ApCorr, data_ref.data_id);
            }
            Ok(ap_corr)
        } else {
            let template = self.ensure_template(exposure, data_ref, state)?;
            if template.ap_corr.is_none() {
                warn!("Template has no aperture correction; measuring without one");
            }
            Ok(template.ap_corr)
        }
    }
}

/// The id factory for the exposure, from `ccdExposureId` and
/// `ccdExposureId_bits`.
fn make_id_factory(data_ref: &DataRef) -> Result<IdFactory, ImageDifferenceError> {
    let read = |dataset: DatasetType| -> Result<u64, ImageDifferenceError> {
        data_ref.get::<u64>(&dataset)?.ok_or_else(|| {
            MissingInputError::MissingDataset {
                dataset: dataset.to_string(),
                data_id: data_ref.data_id.clone(),
            }
            .into()
        })
    };
    let exposure_id = read(DatasetType::CcdExposureId)?;
    let bits = read(DatasetType::CcdExposureIdBits)?;
    let bits = u32::try_from(bits).unwrap_or(u32::MAX);
    Ok(IdFactory::for_exposure(exposure_id, bits)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geom::BoxI,
        image::MaskedImage,
        repository::{MemoryRepository, Repository},
        wcs::Wcs,
    };
    use marlu::RADec;
    use parking_lot::Mutex;

    fn sensor_repository(id: &DataId) -> MemoryRepository {
        let repo = MemoryRepository::new();
        let r: &dyn Repository = &repo;
        let exposure = Exposure::new(
            MaskedImage::filled(BoxI::from_origin(0, 0, 32, 32), 0.0, 0, 1.0),
            Some(Wcs::from_scale(RADec { ra: 0.1, dec: 0.1 }, (16.0, 16.0), 0.2)),
        );
        r.put(&DatasetType::Calexp, id, exposure);
        r.put(
            &DatasetType::Psf,
            id,
            Psf::SingleGaussian {
                width: 11,
                height: 11,
                sigma: 1.5,
            },
        );
        r.put(&DatasetType::CcdExposureId, id, 1203_u64);
        r.put(&DatasetType::CcdExposureIdBits, id, 16_u64);
        repo
    }

    fn detection_only() -> ImageDifferenceConfig {
        ImageDifferenceConfig {
            do_subtract: false,
            do_match_sources: false,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl TaskObserver for Arc<Recorder> {
        fn on_repair(&self, _exposure: &Exposure) {
            self.calls.lock().push("repair");
        }

        fn on_background(&self, _exposure: &Exposure) {
            self.calls.lock().push("background");
        }

        fn on_subtracted(&self, _difference: &Exposure) {
            self.calls.lock().push("subtracted");
        }

        fn on_detected(&self, _difference: &Exposure, _sources: &[SourceRecord]) {
            self.calls.lock().push("detected");
        }
    }

    #[test]
    fn test_invalid_config_is_rejected_eagerly() {
        let config = ImageDifferenceConfig {
            do_detection: false,
            ..Default::default()
        };
        assert!(matches!(
            ImageDifferenceTask::new(config),
            Err(ConfigError::MeasurementWithoutDetection)
        ));
    }

    #[test]
    fn test_missing_calexp_psf_is_fatal() {
        let id = DataId::sensor(12, 3);
        let repo = sensor_repository(&id);
        repo.remove(&DatasetType::Psf, &id);
        let task = ImageDifferenceTask::new(detection_only()).unwrap();
        let err = task.run(&DataRef::new(&repo, &id)).unwrap_err();
        assert!(matches!(
            err,
            ImageDifferenceError::MissingInput(MissingInputError::MissingPsf { .. })
        ));
    }

    #[test]
    fn test_missing_difference_exposure_is_fatal() {
        let id = DataId::sensor(12, 3);
        let repo = sensor_repository(&id);
        let task = ImageDifferenceTask::new(detection_only()).unwrap();
        let err = task.run(&DataRef::new(&repo, &id)).unwrap_err();
        match err {
            ImageDifferenceError::MissingInput(MissingInputError::MissingDataset {
                dataset,
                ..
            }) => assert_eq!(dataset, "deepDiff_differenceExp"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_detection_on_stored_difference() {
        let id = DataId::sensor(12, 3);
        let repo = sensor_repository(&id);
        let r: &dyn Repository = &repo;
        let mut diff: Exposure = r.get(&DatasetType::Calexp, &id).unwrap().unwrap();
        diff.masked_image.image[[16, 16]] = 50.0;
        r.put(&DatasetType::DiffExp("deep".into()), &id, diff);

        let recorder = Arc::new(Recorder::default());
        let task = ImageDifferenceTask::new(detection_only())
            .unwrap()
            .with_observer(recorder.clone());
        let res = task.run(&DataRef::new(&repo, &id)).unwrap();
        assert_eq!(
            res.stages,
            vec![Stage::Detection, Stage::Measurement]
        );
        // Without a calexp background or apCorr the run still completes.
        assert_eq!(res.warnings.len(), 2);
        let sources = res.sources.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources.records[0].id >> 48, 1203);
        assert_eq!(
            *recorder.calls.lock(),
            vec!["repair", "background", "detected"]
        );

        let stored: SourceCatalog = r
            .get(&DatasetType::DiffDiaSrc("deep".into()), &id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.len(), 1);
        let metadata: ImageDifferenceMetadata = r
            .get(&DatasetType::DiffMetadata("deep".into()), &id)
            .unwrap()
            .unwrap();
        assert_eq!(metadata.n_dia_sources, Some(1));
        assert_eq!(metadata.exposure_id, 1203);
    }
}
