//! End-to-end tests: build a synthetic survey, difference its sensors against
//! the coadd template and check the planted transients come back out.

use std::collections::HashSet;

use approx::assert_abs_diff_eq;
use imdiff::{
    image::{Exposure, MaskPlane},
    sim::{SurveyConfig, SurveyTruth, SyntheticSurvey, CCD_EXPOSURE_ID_BITS},
    skymap::PatchIndex,
    source::{SourceCatalog, SourceRecord},
    DataId, DataRef, DatasetType, ImageDifferenceConfig, ImageDifferenceError,
    ImageDifferenceMetadata, ImageDifferenceTask, MemoryRepository, MissingInputError,
    Repository, Stage,
};

/// One sensor per visit. Each sensor straddles all four patches of the
/// tract whatever its dither.
fn survey(config: SurveyConfig) -> (MemoryRepository, SurveyTruth) {
    let repo = MemoryRepository::new();
    let truth = SyntheticSurvey::new(SurveyConfig {
        n_visits: 2,
        n_ccds: 1,
        ..config
    })
    .build(&repo);
    (repo, truth)
}

fn nearest<'a>(sources: &'a [SourceRecord], pixel: (f64, f64)) -> Option<&'a SourceRecord> {
    sources
        .iter()
        .filter_map(|s| {
            let (x, y) = s.position()?;
            Some((s, (x - pixel.0).powi(2) + (y - pixel.1).powi(2)))
        })
        .filter(|(_, d2)| *d2 <= 4.0)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(s, _)| s)
}

#[test]
fn test_planted_transients_are_recovered() {
    let (repo, truth) = survey(SurveyConfig::default());
    let r: &dyn Repository = &repo;
    // Visit 1: exposure id 100, science PSF sigma 1.8.
    let data_id = &truth.data_ids[1];
    let task = ImageDifferenceTask::new(ImageDifferenceConfig::default()).unwrap();
    let res = task.run(&DataRef::new(&repo, data_id)).unwrap();

    assert_eq!(
        res.stages,
        vec![
            Stage::TemplateAssembly,
            Stage::PreConvolution,
            Stage::SourceSelection,
            Stage::Subtraction,
            Stage::Detection,
            Stage::Measurement,
            Stage::CrossMatch,
        ]
    );
    assert!(res.warnings.is_empty(), "{:?}", res.warnings);

    let template = res.template.as_ref().unwrap();
    assert_eq!(template.n_patches, 4);
    assert_eq!(template.n_patches_found, 4);
    assert_eq!(template.exposure.bbox(), truth.tract.bbox);
    let planted: Vec<_> = truth
        .transients
        .iter()
        .filter(|t| &t.data_id == data_id)
        .collect();
    assert_eq!(planted.len(), 2);

    assert!(!res.kernel_sources.is_empty());
    // The variable star never feeds the kernel.
    let src: SourceCatalog = r.get(&DatasetType::Src, data_id).unwrap().unwrap();
    let variable = planted.iter().find(|t| t.ref_id.is_some()).unwrap();
    let variable_src = nearest(&src.records, variable.pixel).map(|s| s.id);
    assert!(variable_src.is_some());
    assert!(res
        .kernel_sources
        .iter()
        .all(|k| Some(k.id) != variable_src));

    let sources = res.sources.as_ref().unwrap();
    for t in planted {
        let found = nearest(&sources.records, t.pixel)
            .unwrap_or_else(|| panic!("no diaSource near {:?}", t.pixel));
        assert!(!found.negative);
        match t.ref_id {
            // The brightened star is both a prior source and a reference
            // object.
            Some(ref_id) => {
                assert_eq!(found.ref_match_id, Some(ref_id));
                assert_eq!(found.src_match_id, variable_src);
            }
            None => {
                assert_eq!(found.ref_match_id, None);
                assert_eq!(found.src_match_id, None);
            }
        }
    }

    assert_abs_diff_eq!(res.metadata.science_sigma_orig, 1.8, epsilon = 1e-9);
    assert_abs_diff_eq!(
        res.metadata.science_sigma_post,
        1.8 * std::f64::consts::SQRT_2,
        epsilon = 1e-9
    );
}

#[test]
fn test_products_are_persisted() {
    let (repo, truth) = survey(SurveyConfig::default());
    let r: &dyn Repository = &repo;
    let data_id = &truth.data_ids[0];
    let task = ImageDifferenceTask::new(ImageDifferenceConfig::default()).unwrap();
    let res = task.run(&DataRef::new(&repo, data_id)).unwrap();

    let diff: Exposure = r
        .get(&DatasetType::DiffExp("deep".into()), data_id)
        .unwrap()
        .unwrap();
    assert_eq!(diff.bbox(), res.subtracted_exposure.as_ref().unwrap().bbox());
    assert!(diff.has_psf());
    assert!(!r.exists(&DatasetType::DiffMatchedExp("deep".into()), data_id));

    let stored: SourceCatalog = r
        .get(&DatasetType::DiffDiaSrc("deep".into()), data_id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.len(), res.sources.as_ref().unwrap().len());
    assert!(stored.records.iter().all(|s| !s.footprint.is_heavy()));

    let metadata: ImageDifferenceMetadata = r
        .get(&DatasetType::DiffMetadata("deep".into()), data_id)
        .unwrap()
        .unwrap();
    assert_eq!(metadata, res.metadata);
    assert_eq!(metadata.tract, Some(0));
    assert_eq!(metadata.n_dia_sources, Some(stored.len()));
}

#[test]
fn test_source_ids_carry_the_exposure_id() {
    let (repo, truth) = survey(SurveyConfig::default());
    let data_id = &truth.data_ids[1];
    let task = ImageDifferenceTask::new(ImageDifferenceConfig::default()).unwrap();
    let res = task.run(&DataRef::new(&repo, data_id)).unwrap();

    let exposure_id = SyntheticSurvey::ccd_exposure_id(1, 0);
    let ids: Vec<u64> = res.sources.unwrap().records.iter().map(|s| s.id).collect();
    assert!(!ids.is_empty());
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
    for id in ids {
        assert_eq!(id >> (64 - CCD_EXPOSURE_ID_BITS), exposure_id);
    }
}

#[test]
fn test_missing_patch_is_a_warning() {
    let (repo, truth) = survey(SurveyConfig {
        missing_patches: vec![PatchIndex::new(1, 1)],
        ..Default::default()
    });
    let data_id = &truth.data_ids[0];
    let task = ImageDifferenceTask::new(ImageDifferenceConfig::default()).unwrap();
    let res = task.run(&DataRef::new(&repo, data_id)).unwrap();

    let template = res.template.as_ref().unwrap();
    assert_eq!(template.n_patches, 4);
    assert_eq!(template.n_patches_found, 3);
    assert_eq!(res.warnings.len(), 1);
    assert_eq!(res.warnings[0].dataset, "deepCoadd");
    assert_eq!(
        res.warnings[0].data_id,
        DataId::patch(0, PatchIndex::new(1, 1))
    );
    // The uncovered corner of the template is flagged, not subtracted.
    let diff = res.subtracted_exposure.unwrap();
    assert!(diff
        .masked_image
        .mask
        .iter()
        .any(|m| m & MaskPlane::NO_DATA != 0));
    assert_eq!(res.metadata.n_patches_found, Some(3));
}

#[test]
fn test_no_patches_is_fatal() {
    let all = vec![
        PatchIndex::new(0, 0),
        PatchIndex::new(1, 0),
        PatchIndex::new(0, 1),
        PatchIndex::new(1, 1),
    ];
    let (repo, truth) = survey(SurveyConfig {
        missing_patches: all,
        ..Default::default()
    });
    let task = ImageDifferenceTask::new(ImageDifferenceConfig::default()).unwrap();
    let err = task
        .run(&DataRef::new(&repo, &truth.data_ids[0]))
        .unwrap_err();
    assert!(matches!(
        err,
        ImageDifferenceError::MissingInput(MissingInputError::NoPatchesFound {
            tract: 0,
            n_patches: 4
        })
    ));
}

#[test]
fn test_selection_without_src_catalog() {
    let (repo, truth) = survey(SurveyConfig {
        write_src: false,
        ..Default::default()
    });
    let data_id = &truth.data_ids[0];
    let task = ImageDifferenceTask::new(ImageDifferenceConfig::default()).unwrap();
    let res = task.run(&DataRef::new(&repo, data_id)).unwrap();

    assert!(res.stages.contains(&Stage::SourceSelection));
    assert!(res.metadata.n_candidates.unwrap() > 0);
    // Without a src catalog there is nothing to associate with.
    assert_eq!(res.metadata.n_src_matches, None);
    let transient = truth
        .transients
        .iter()
        .find(|t| &t.data_id == data_id && t.ref_id.is_none())
        .unwrap();
    assert!(nearest(&res.sources.unwrap().records, transient.pixel).is_some());
}

#[test]
fn test_stored_difference_reuses_template_once() {
    let (repo, truth) = survey(SurveyConfig::default());
    let r: &dyn Repository = &repo;
    let data_id = &truth.data_ids[0];
    ImageDifferenceTask::new(ImageDifferenceConfig::default())
        .unwrap()
        .run(&DataRef::new(&repo, data_id))
        .unwrap();

    // Drop the PSF so that both the difference PSF and the aperture
    // correction come from the template.
    let diff_type = DatasetType::DiffExp("deep".into());
    let mut diff: Exposure = r.get(&diff_type, data_id).unwrap().unwrap();
    diff.psf = None;
    r.put(&diff_type, data_id, diff);

    let config = ImageDifferenceConfig {
        do_subtract: false,
        convolve_template: false,
        ..Default::default()
    };
    let res = ImageDifferenceTask::new(config)
        .unwrap()
        .run(&DataRef::new(&repo, data_id))
        .unwrap();
    assert_eq!(
        res.stages,
        vec![
            Stage::TemplateAssembly,
            Stage::Detection,
            Stage::Measurement,
            Stage::CrossMatch,
        ]
    );
    assert_eq!(
        res.subtracted_exposure.unwrap().psf,
        res.template.unwrap().exposure.psf
    );
}

#[test]
fn test_missing_background_and_ap_corr_are_warnings() {
    let (repo, truth) = survey(SurveyConfig {
        write_background: false,
        write_ap_corr: false,
        ..Default::default()
    });
    let data_id = &truth.data_ids[0];
    let task = ImageDifferenceTask::new(ImageDifferenceConfig::default()).unwrap();
    let res = task.run(&DataRef::new(&repo, data_id)).unwrap();

    let count = |dataset: &str| res.warnings.iter().filter(|w| w.dataset == dataset).count();
    assert_eq!(count("calexpBackground"), 1);
    // Every patch is asked for an aperture correction while none is found.
    assert_eq!(count("deepCoadd_apCorr"), 4);
    assert_eq!(count("apCorr"), 1);
    assert_eq!(res.warnings.len(), 6);
    assert_eq!(res.template.as_ref().unwrap().ap_corr, None);

    let transient = truth
        .transients
        .iter()
        .find(|t| &t.data_id == data_id && t.ref_id.is_none())
        .unwrap();
    assert!(nearest(&res.sources.unwrap().records, transient.pixel).is_some());
}
