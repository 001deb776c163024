//! A synthetic survey: one tract of coadd patches plus single-visit calexps
//! with planted transients, written to a repository.

use std::{f64::consts::TAU, sync::Arc};

use log::{debug, info};
use marlu::RADec;
use ndarray::Zip;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::{
    footprint::Footprint,
    geom::BoxI,
    image::{BackgroundModel, Exposure, ExposureMetadata, MaskedImage},
    psf::{ApertureCorrection, Psf},
    refcat::{RefObject, ReferenceCatalog},
    repository::{DataId, DatasetType, Repository},
    skymap::{PatchIndex, SkyMap, TractInfo},
    source::{IdFactory, Shape, SourceCatalog, SourceRecord},
};

/// Bits of a source id reserved for the exposure id.
pub const CCD_EXPOSURE_ID_BITS: u64 = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct SurveyConfig {
    pub seed: u64,
    pub coadd_name: String,

    pub n_visits: u32,

    /// Sensors per visit, laid out side by side along x.
    pub n_ccds: u32,
    pub ccd_dims: (usize, usize),

    pub tract_center: RADec,
    pub pixel_scale_arcsec: f64,
    pub num_patches: (u32, u32),
    pub patch_inner_dims: (usize, usize),
    pub patch_border: usize,

    pub n_stars: usize,

    /// Range of star fluxes \[counts\], sampled log-uniformly.
    pub star_flux: (f64, f64),

    pub coadd_sigma: f64,
    pub coadd_variance: f32,
    pub science_variance: f32,

    /// Sky level removed from each calexp and stored as its background.
    pub background: f64,

    pub zero_point_mag: f64,

    /// Flux of the transient planted on every sensor.
    pub transient_flux: f64,

    /// Extra science flux of the variable reference star.
    pub variable_flux: f64,

    /// Write each sensor's `src` catalog.
    pub write_src: bool,

    pub write_ap_corr: bool,
    pub write_background: bool,

    /// Patches whose coadd pixels are left out of the repository.
    pub missing_patches: Vec<PatchIndex>,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        SurveyConfig {
            seed: 20_140_301,
            coadd_name: "deep".to_string(),
            n_visits: 3,
            n_ccds: 2,
            ccd_dims: (80, 80),
            tract_center: RADec {
                ra: 150.1_f64.to_radians(),
                dec: 2.2_f64.to_radians(),
            },
            pixel_scale_arcsec: 0.2,
            num_patches: (2, 2),
            patch_inner_dims: (100, 100),
            patch_border: 10,
            n_stars: 60,
            star_flux: (2.0e3, 3.0e4),
            coadd_sigma: 1.2,
            coadd_variance: 2.0,
            science_variance: 25.0,
            background: 100.0,
            zero_point_mag: 27.0,
            transient_flux: 8.0e3,
            variable_flux: 6.0e3,
            write_src: true,
            write_ap_corr: true,
            write_background: true,
            missing_patches: vec![],
        }
    }
}

/// A source present in the science exposure but not in the template.
#[derive(Debug, Clone, PartialEq)]
pub struct PlantedTransient {
    pub data_id: DataId,
    pub coord: RADec,

    /// Position on the sensor \[pixels\].
    pub pixel: (f64, f64),

    pub flux: f64,

    /// Reference id of the star, for the brightened variable star.
    pub ref_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurveyTruth {
    pub tract: TractInfo,
    pub stars: Vec<RefObject>,
    pub transients: Vec<PlantedTransient>,
    pub data_ids: Vec<DataId>,
}

struct Star {
    id: u64,
    coord: RADec,
    flux: f64,
    variable: bool,
}

pub struct SyntheticSurvey {
    pub config: SurveyConfig,
}

/// Add a circular Gaussian of total `flux` centred at parent pixel `(x, y)`.
fn add_point_source(mi: &mut MaskedImage, x: f64, y: f64, flux: f64, sigma: f64) {
    let r = (5.0 * sigma).ceil() as i32;
    let norm = flux / (TAU * sigma * sigma);
    let (xc, yc) = (x.round() as i32, y.round() as i32);
    let bbox = mi.bbox();
    for py in yc - r..=yc + r {
        for px in xc - r..=xc + r {
            if !bbox.contains(px, py) {
                continue;
            }
            let d2 = (px as f64 - x).powi(2) + (py as f64 - y).powi(2);
            let v = norm * (-d2 / (2.0 * sigma * sigma)).exp();
            mi.image[[(py - mi.y0) as usize, (px - mi.x0) as usize]] += v as f32;
        }
    }
}

fn add_noise(mi: &mut MaskedImage, variance: f32, rng: &mut StdRng) {
    let sd = variance.sqrt();
    Zip::from(&mut mi.image)
        .and(&mut mi.variance)
        .for_each(|v, var| {
            let z: f32 = rng.sample(StandardNormal);
            *v += sd * z;
            *var = variance;
        });
}

impl SyntheticSurvey {
    pub fn new(config: SurveyConfig) -> SyntheticSurvey {
        SyntheticSurvey { config }
    }

    pub fn tract(&self) -> TractInfo {
        let c = &self.config;
        TractInfo::new(
            0,
            c.tract_center,
            c.pixel_scale_arcsec,
            c.num_patches,
            c.patch_inner_dims,
            c.patch_border,
        )
    }

    /// The exposure id of a sensor.
    pub fn ccd_exposure_id(visit: u64, ccd: u32) -> u64 {
        visit * 100 + ccd as u64
    }

    /// Write every dataset of the survey into `repo`.
    pub fn build(&self, repo: &dyn Repository) -> SurveyTruth {
        let c = &self.config;
        let mut rng = StdRng::seed_from_u64(c.seed);
        let tract = self.tract();
        let stars = self.make_stars(&tract, &mut rng);

        repo.put(
            &DatasetType::CoaddSkyMap(c.coadd_name.clone()),
            &DataId::default(),
            Arc::new(SkyMap::new(vec![tract.clone()])),
        );
        let refcat: Vec<RefObject> = stars
            .iter()
            .map(|s| RefObject {
                id: s.id,
                coord: s.coord,
                mag: c.zero_point_mag - 2.5 * s.flux.log10(),
                is_star: true,
                is_variable: s.variable,
            })
            .collect();
        repo.put(
            &DatasetType::RefCat,
            &DataId::default(),
            Arc::new(ReferenceCatalog::new(refcat.clone())),
        );

        self.write_coadds(repo, &tract, &stars, &mut rng);

        let mut transients = vec![];
        let mut data_ids = vec![];
        for visit in 0..c.n_visits as u64 {
            let dither = (rng.gen_range(-10..=10), rng.gen_range(-10..=10));
            for ccd in 0..c.n_ccds {
                let data_id = DataId::sensor(visit, ccd);
                let mut planted =
                    self.write_sensor(repo, &tract, &stars, &data_id, dither, &mut rng);
                transients.append(&mut planted);
                data_ids.push(data_id);
            }
        }
        info!(
            "Synthetic survey: {} stars, {} sensors, {} planted transients",
            stars.len(),
            data_ids.len(),
            transients.len()
        );

        SurveyTruth {
            tract,
            stars: refcat,
            transients,
            data_ids,
        }
    }

    fn make_stars(&self, tract: &TractInfo, rng: &mut StdRng) -> Vec<Star> {
        let c = &self.config;
        let (lo, hi) = (c.star_flux.0.ln(), c.star_flux.1.ln());
        let (w, h) = tract.bbox.dimensions();
        // The variable star sits at the centre of sensor 0, so it stays on
        // that sensor whatever the dither.
        let mosaic_width = (c.ccd_dims.0 * c.n_ccds as usize) as f64;
        let variable_pixel = (
            (w / 2) as f64 - mosaic_width / 2.0 + c.ccd_dims.0 as f64 / 2.0,
            (h / 2) as f64,
        );
        let mut stars = vec![Star {
            id: 1,
            coord: tract.wcs.pixel_to_sky(variable_pixel.0, variable_pixel.1),
            flux: c.star_flux.0.max(6.0e3),
            variable: true,
        }];
        let mut attempts = 0;
        while stars.len() < c.n_stars.max(1) && attempts < 100 * c.n_stars {
            attempts += 1;
            let x = rng.gen_range(0.0..w as f64);
            let y = rng.gen_range(0.0..h as f64);
            let coord = tract.wcs.pixel_to_sky(x, y);
            // Keep stars resolved from one another.
            let crowded = stars.iter().any(|s| {
                s.coord.separation(coord).to_degrees() * 3600.0 < 8.0 * c.pixel_scale_arcsec
            });
            if crowded {
                continue;
            }
            stars.push(Star {
                id: stars.len() as u64 + 1,
                coord,
                flux: rng.gen_range(lo..hi).exp(),
                variable: false,
            });
        }
        stars
    }

    fn write_coadds(
        &self,
        repo: &dyn Repository,
        tract: &TractInfo,
        stars: &[Star],
        rng: &mut StdRng,
    ) {
        let c = &self.config;
        let psf = Psf::SingleGaussian {
            width: 21,
            height: 21,
            sigma: c.coadd_sigma,
        };
        for patch in tract.patches() {
            if c.missing_patches.contains(&patch.index) {
                debug!("Leaving out patch {}", patch.index);
                continue;
            }
            let data_id = DataId::patch(tract.id, patch.index);
            let mut mi = MaskedImage::filled(patch.outer_bbox, 0.0, 0, c.coadd_variance);
            let region = patch.outer_bbox.grown(10);
            for star in stars {
                if let Some((x, y)) = tract.wcs.sky_to_pixel(star.coord) {
                    if region.contains(x.round() as i32, y.round() as i32) {
                        add_point_source(&mut mi, x, y, star.flux, c.coadd_sigma);
                    }
                }
            }
            add_noise(&mut mi, c.coadd_variance, rng);

            let mut exposure = Exposure::new(mi, Some(tract.wcs));
            exposure.psf = Some(psf.clone());
            exposure.metadata.zero_point_mag = Some(c.zero_point_mag);
            repo.put(&DatasetType::Coadd(c.coadd_name.clone()), &data_id, exposure);
            repo.put(&DatasetType::CoaddPsf(c.coadd_name.clone()), &data_id, psf.clone());
            if c.write_ap_corr {
                repo.put(
                    &DatasetType::CoaddApCorr(c.coadd_name.clone()),
                    &data_id,
                    ApertureCorrection {
                        value: 1.0,
                        error: 0.0,
                    },
                );
            }
        }
    }

    /// Write one sensor's products and return the sources planted on it.
    fn write_sensor(
        &self,
        repo: &dyn Repository,
        tract: &TractInfo,
        stars: &[Star],
        data_id: &DataId,
        dither: (i32, i32),
        rng: &mut StdRng,
    ) -> Vec<PlantedTransient> {
        let c = &self.config;
        let visit = data_id.visit.unwrap_or_default();
        let ccd = data_id.ccd.unwrap_or_default();
        let (w, h) = c.ccd_dims;
        let (tw, th) = tract.bbox.dimensions();
        let mosaic_width = w * c.n_ccds as usize;
        let origin = (
            (tw as i32 - mosaic_width as i32) / 2 + (ccd as usize * w) as i32 + dither.0,
            (th as i32 - h as i32) / 2 + dither.1,
        );
        // Sensor pixel (0, 0) lands on tract pixel `origin`.
        let wcs = tract.wcs.shifted(-origin.0 as f64, -origin.1 as f64);
        let sigma = 1.6 + 0.2 * (visit % 3) as f64;
        let psf = Psf::SingleGaussian {
            width: 21,
            height: 21,
            sigma,
        };
        let bbox = BoxI::from_origin(0, 0, w, h);

        let mut mi = MaskedImage::filled(bbox, 0.0, 0, c.science_variance);
        let mut on_sensor = vec![];
        let mut planted = vec![];
        for star in stars {
            let Some((x, y)) = wcs.sky_to_pixel(star.coord) else {
                continue;
            };
            if !bbox.grown(10).contains(x.round() as i32, y.round() as i32) {
                continue;
            }
            let flux = if star.variable {
                star.flux + c.variable_flux
            } else {
                star.flux
            };
            add_point_source(&mut mi, x, y, flux, sigma);
            if bbox.contains(x.round() as i32, y.round() as i32) {
                on_sensor.push((star, x, y));
                if star.variable {
                    planted.push(PlantedTransient {
                        data_id: data_id.clone(),
                        coord: star.coord,
                        pixel: (x, y),
                        flux: c.variable_flux,
                        ref_id: Some(star.id),
                    });
                }
            }
        }

        // A new source away from every star and from the sensor border.
        let margin = 22.0;
        let mut transient = (w as f64 / 2.0, h as f64 / 2.0);
        for _ in 0..1000 {
            let x = rng.gen_range(margin..w as f64 - margin);
            let y = rng.gen_range(margin..h as f64 - margin);
            transient = (x, y);
            let clear = on_sensor
                .iter()
                .all(|(_, sx, sy)| (sx - x).powi(2) + (sy - y).powi(2) > 100.0);
            if clear {
                break;
            }
        }
        add_point_source(&mut mi, transient.0, transient.1, c.transient_flux, sigma);
        planted.push(PlantedTransient {
            data_id: data_id.clone(),
            coord: wcs.pixel_to_sky(transient.0, transient.1),
            pixel: transient,
            flux: c.transient_flux,
            ref_id: None,
        });
        add_noise(&mut mi, c.science_variance, rng);

        let mut exposure = Exposure::new(mi, Some(wcs));
        exposure.metadata = ExposureMetadata {
            zero_point_mag: Some(c.zero_point_mag),
            zero_point_rms: Some(0.02),
            n_calib_objects: Some(on_sensor.len()),
            exposure_time: Some(30.0),
            filter: Some("r".to_string()),
        };
        let exposure_id = Self::ccd_exposure_id(visit, ccd);
        repo.put(&DatasetType::Calexp, data_id, exposure);
        repo.put(&DatasetType::Psf, data_id, psf);
        repo.put(&DatasetType::CcdExposureId, data_id, exposure_id);
        repo.put(&DatasetType::CcdExposureIdBits, data_id, CCD_EXPOSURE_ID_BITS);
        if c.write_background {
            repo.put(
                &DatasetType::CalexpBackground,
                data_id,
                BackgroundModel::Constant(c.background),
            );
        }
        if c.write_ap_corr {
            repo.put(
                &DatasetType::ApCorr,
                data_id,
                ApertureCorrection {
                    value: 1.02,
                    error: 0.005,
                },
            );
        }
        if c.write_src {
            repo.put(
                &DatasetType::Src,
                data_id,
                self.src_catalog(&on_sensor, exposure_id, sigma),
            );
        }
        debug!("Wrote sensor {data_id} with {} stars", on_sensor.len());
        planted
    }

    /// The upstream source catalog of a sensor: its stars, ideally measured.
    fn src_catalog(
        &self,
        stars: &[(&Star, f64, f64)],
        exposure_id: u64,
        sigma: f64,
    ) -> SourceCatalog {
        // `ccdExposureId_bits` always fits a sensor id built by this survey.
        let mut ids = IdFactory::for_exposure(exposure_id, CCD_EXPOSURE_ID_BITS as u32)
            .unwrap_or_else(|_| IdFactory::simple());
        let records = stars
            .iter()
            .filter_map(|&(star, x, y)| {
                let peak = (x.round() as i32, y.round() as i32);
                let footprint = Footprint::new(vec![peak], vec![]);
                let mut r = SourceRecord::new(ids.next_id().ok()?, footprint);
                r.centroid = Some((x, y));
                r.coord = Some(star.coord);
                r.psf_flux = Some(star.flux);
                r.shape = Some(Shape {
                    xx: sigma * sigma,
                    yy: sigma * sigma,
                    xy: 0.0,
                });
                Some(r)
            })
            .collect();
        SourceCatalog::new(records)
    }
}
