//! Assembly of a template exposure from stored coadd patches.

use std::sync::Arc;

use log::{info, warn};

use crate::{
    error::{ImageDifferenceError, MissingInputError, PartialDataWarning},
    geom::BoxI,
    image::{Exposure, MaskPlane, MaskedImage},
    psf::{ApertureCorrection, Psf},
    repository::{DataId, DataRef, DatasetType},
    skymap::{union_outer_bbox, PatchInfo, SkyFootprint, SkyMap, SkyTileLocator, TractInfo},
};

/// A template stitched together from coadd patches.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateAssemblyResult {
    /// Covers the union of the overlapping patches' outer boxes, in the
    /// tract's pixel frame. Carries the first PSF found.
    pub exposure: Exposure,

    /// The first aperture correction found, if any.
    pub ap_corr: Option<ApertureCorrection>,

    pub tract: u32,
    pub n_patches_found: usize,
    pub n_patches: usize,
    pub warnings: Vec<PartialDataWarning>,
}

pub struct TemplateAssembler {
    coadd_name: String,
}

impl TemplateAssembler {
    pub fn new(coadd_name: impl Into<String>) -> TemplateAssembler {
        TemplateAssembler {
            coadd_name: coadd_name.into(),
        }
    }

    /// Assemble the template covering `exposure`, reading the sky map and
    /// coadd products through `data_ref`.
    pub fn assemble(
        &self,
        exposure: &Exposure,
        data_ref: &DataRef,
    ) -> Result<TemplateAssemblyResult, ImageDifferenceError> {
        let sky_map_type = DatasetType::CoaddSkyMap(self.coadd_name.clone());
        let sky_map: Arc<SkyMap> = data_ref.get_id(&sky_map_type, &DataId::default())?.ok_or(
            MissingInputError::MissingDataset {
                dataset: sky_map_type.to_string(),
                data_id: DataId::default(),
            },
        )?;
        let wcs = exposure.wcs.as_ref().ok_or(MissingInputError::MissingDataset {
            dataset: "calexp WCS".to_string(),
            data_id: data_ref.data_id.clone(),
        })?;

        let footprint = SkyFootprint::from_bbox(wcs, exposure.bbox());
        let (tract, patches) = SkyTileLocator::new(&sky_map).locate(&footprint)?;
        info!("Using skyMap tract {}", tract.id);
        info!("Assembling {} coadd patches", patches.len());
        self.stitch(tract, patches.as_slice(), data_ref, exposure.bbox())
    }

    fn stitch(
        &self,
        tract: &TractInfo,
        patches: &[PatchInfo],
        data_ref: &DataRef,
        exposure_bbox: BoxI,
    ) -> Result<TemplateAssemblyResult, ImageDifferenceError> {
        let coadd_bbox = union_outer_bbox(patches);
        info!(
            "exposure dimensions={:?}; coadd dimensions={:?}",
            exposure_bbox.dimensions(),
            coadd_bbox.dimensions()
        );
        let mut coadd = Exposure::new(
            MaskedImage::filled(
                coadd_bbox,
                f32::NAN,
                MaskPlane::EDGE | MaskPlane::NO_DATA,
                f32::NAN,
            ),
            Some(tract.wcs),
        );

        let coadd_type = DatasetType::Coadd(self.coadd_name.clone());
        let psf_type = DatasetType::CoaddPsf(self.coadd_name.clone());
        let ap_corr_type = DatasetType::CoaddApCorr(self.coadd_name.clone());

        let mut warnings = vec![];
        let mut skip = |dataset: &DatasetType, data_id: DataId| {
            let w = PartialDataWarning {
                dataset: dataset.to_string(),
                data_id,
            };
            warn!("{w}");
            warnings.push(w);
        };

        let mut n_patches_found = 0;
        let mut psf: Option<Psf> = None;
        let mut ap_corr: Option<ApertureCorrection> = None;
        for patch in patches {
            let patch_id = DataId::patch(tract.id, patch.index);
            let Some(pixels) = data_ref.get_id::<Exposure>(&coadd_type, &patch_id)? else {
                skip(&coadd_type, patch_id);
                continue;
            };
            n_patches_found += 1;
            info!("Reading patch {patch_id}");
            coadd.masked_image.assign(&pixels.masked_image);

            if psf.is_none() {
                match data_ref.get_id::<Psf>(&psf_type, &patch_id)? {
                    Some(p) => psf = Some(p),
                    None => {
                        // The aperture correction of a patch without a PSF is
                        // not consulted.
                        skip(&psf_type, patch_id);
                        continue;
                    }
                }
            }

            if ap_corr.is_none() {
                match data_ref.get_id::<ApertureCorrection>(&ap_corr_type, &patch_id)? {
                    Some(a) => ap_corr = Some(a),
                    None => skip(&ap_corr_type, patch_id),
                }
            }
        }

        if n_patches_found == 0 {
            return Err(MissingInputError::NoPatchesFound {
                tract: tract.id,
                n_patches: patches.len(),
            }
            .into());
        }
        let Some(psf) = psf else {
            return Err(MissingInputError::NoPsfFound { tract: tract.id }.into());
        };
        coadd.psf = Some(psf);

        Ok(TemplateAssemblyResult {
            exposure: coadd,
            ap_corr,
            tract: tract.id,
            n_patches_found,
            n_patches: patches.len(),
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        repository::{MemoryRepository, Repository},
        skymap::PatchIndex,
        wcs::Wcs,
    };
    use marlu::RADec;

    const DEEP: &str = "deep";

    fn tract() -> TractInfo {
        TractInfo::new(
            3,
            RADec {
                ra: 0.5,
                dec: 0.1,
            },
            0.2,
            (2, 2),
            (50, 50),
            5,
        )
    }

    fn coadd_psf() -> Psf {
        Psf::SingleGaussian {
            width: 21,
            height: 21,
            sigma: 1.2,
        }
    }

    /// A repository with every patch of `tract()` except those in `missing`.
    fn repository(missing: &[PatchIndex], with_psf: bool) -> MemoryRepository {
        let repo = MemoryRepository::new();
        let t = tract();
        let r: &dyn Repository = &repo;
        r.put(
            &DatasetType::CoaddSkyMap(DEEP.into()),
            &DataId::default(),
            Arc::new(SkyMap::new(vec![t.clone()])),
        );
        for patch in t.patches() {
            if missing.contains(&patch.index) {
                continue;
            }
            let id = DataId::patch(t.id, patch.index);
            let value = (patch.index.x + 10 * patch.index.y) as f32;
            let exp = Exposure::new(
                MaskedImage::filled(patch.outer_bbox, value, 0, 1.0),
                Some(t.wcs),
            );
            r.put(&DatasetType::Coadd(DEEP.into()), &id, exp);
            if with_psf {
                r.put(&DatasetType::CoaddPsf(DEEP.into()), &id, coadd_psf());
            }
            r.put(
                &DatasetType::CoaddApCorr(DEEP.into()),
                &id,
                ApertureCorrection {
                    value: 1.05,
                    error: 0.01,
                },
            );
        }
        repo
    }

    /// A science exposure on the tract's pixel grid covering `bbox`.
    fn science(bbox: BoxI) -> Exposure {
        Exposure::new(MaskedImage::new(bbox), Some(tract().wcs))
    }

    #[test]
    fn test_straddling_all_patches() {
        let repo = repository(&[], true);
        let id = DataId::sensor(1, 0);
        let data_ref = DataRef::new(&repo, &id);
        let res = TemplateAssembler::new(DEEP)
            .assemble(&science(BoxI::new((40, 40), (60, 60))), &data_ref)
            .unwrap();
        assert_eq!(res.n_patches_found, 4);
        assert_eq!(res.exposure.bbox(), tract().bbox);
        assert_eq!(res.exposure.psf, Some(coadd_psf()));
        assert_eq!(res.ap_corr.map(|a| a.value), Some(1.05));
        assert!(res.warnings.is_empty());
        // Later patches overwrite the overlap borders of earlier ones.
        assert_eq!(res.exposure.masked_image.get(10, 10), Some((0.0, 0, 1.0)));
        assert_eq!(res.exposure.masked_image.get(90, 90), Some((11.0, 0, 1.0)));
    }

    #[test]
    fn test_missing_patch_leaves_no_data() {
        let repo = repository(&[PatchIndex::new(1, 1)], true);
        let id = DataId::sensor(1, 0);
        let data_ref = DataRef::new(&repo, &id);
        let res = TemplateAssembler::new(DEEP)
            .assemble(&science(BoxI::new((40, 40), (60, 60))), &data_ref)
            .unwrap();
        assert_eq!(res.n_patches_found, 3);
        assert_eq!(res.n_patches, 4);
        assert_eq!(res.warnings.len(), 1);
        assert_eq!(res.warnings[0].dataset, "deepCoadd");
        assert_eq!(
            res.warnings[0].to_string(),
            "deepCoadd, {tract=3, patch=1,1} does not exist; skipping"
        );
        let (v, m, var) = res.exposure.masked_image.get(90, 90).unwrap();
        assert!(v.is_nan() && var.is_nan());
        assert_eq!(m, MaskPlane::EDGE | MaskPlane::NO_DATA);
    }

    #[test]
    fn test_all_patches_missing() {
        let all: Vec<PatchIndex> = tract().patches().map(|p| p.index).collect();
        let repo = repository(&all, true);
        let id = DataId::sensor(1, 0);
        let data_ref = DataRef::new(&repo, &id);
        let err = TemplateAssembler::new(DEEP)
            .assemble(&science(BoxI::new((40, 40), (60, 60))), &data_ref)
            .unwrap_err();
        assert!(matches!(
            err,
            ImageDifferenceError::MissingInput(MissingInputError::NoPatchesFound {
                tract: 3,
                n_patches: 4
            })
        ));
    }

    #[test]
    fn test_pixels_without_psf_are_fatal() {
        let repo = repository(&[], false);
        let id = DataId::sensor(1, 0);
        let data_ref = DataRef::new(&repo, &id);
        let err = TemplateAssembler::new(DEEP)
            .assemble(&science(BoxI::new((10, 10), (20, 20))), &data_ref)
            .unwrap_err();
        assert!(matches!(
            err,
            ImageDifferenceError::MissingInput(MissingInputError::NoPsfFound { tract: 3 })
        ));
    }

    #[test]
    fn test_ap_corr_skipped_for_patch_without_psf() {
        let repo = repository(&[], true);
        let t = tract();
        let first = DataId::patch(t.id, PatchIndex::new(0, 0));
        repo.remove(&DatasetType::CoaddPsf(DEEP.into()), &first);
        let id = DataId::sensor(1, 0);
        let data_ref = DataRef::new(&repo, &id);
        let res = TemplateAssembler::new(DEEP)
            .assemble(&science(BoxI::new((40, 40), (60, 60))), &data_ref)
            .unwrap();
        // One warning for the PSF; the first patch's ApCorr is never read.
        assert_eq!(res.warnings.len(), 1);
        assert_eq!(res.warnings[0].dataset, "deepCoadd_psf");
        assert_eq!(res.warnings[0].data_id, first);
        assert!(res.ap_corr.is_some());
    }

    #[test]
    fn test_missing_sky_map() {
        let repo = MemoryRepository::new();
        let id = DataId::sensor(1, 0);
        let data_ref = DataRef::new(&repo, &id);
        let exposure = Exposure::new(
            MaskedImage::new(BoxI::from_origin(0, 0, 10, 10)),
            Some(Wcs::from_scale(RADec { ra: 0.5, dec: 0.1 }, (5.0, 5.0), 0.2)),
        );
        let err = TemplateAssembler::new(DEEP)
            .assemble(&exposure, &data_ref)
            .unwrap_err();
        assert!(matches!(
            err,
            ImageDifferenceError::MissingInput(MissingInputError::MissingDataset { .. })
        ));
    }
}
