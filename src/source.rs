//! Source records, catalogs and source id allocation.

use marlu::RADec;
use thiserror::Error;

use crate::footprint::Footprint;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdFactoryError {
    #[error("Exposure id {exposure_id} does not fit in {bits} bits")]
    ExposureIdTooWide { exposure_id: u64, bits: u32 },

    #[error("Exposure id bit count {0} is not in 1..=63")]
    InvalidBits(u32),

    #[error("Source id space of exposure {exposure_id} is exhausted")]
    Exhausted { exposure_id: u64 },
}

/// Allocates source ids `(exposure_id << reserved_bits) | counter`. One
/// factory is shared by every catalog made for one exposure, so ids are
/// unique across all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdFactory {
    exposure_id: u64,
    reserved_bits: u32,
    next: u64,
}

impl IdFactory {
    /// `exposure_bits` is the width of the exposure id; the remaining
    /// `64 - exposure_bits` low bits hold the counter.
    pub fn for_exposure(exposure_id: u64, exposure_bits: u32) -> Result<IdFactory, IdFactoryError> {
        if !(1..=63).contains(&exposure_bits) {
            return Err(IdFactoryError::InvalidBits(exposure_bits));
        }
        if exposure_id >> exposure_bits != 0 {
            return Err(IdFactoryError::ExposureIdTooWide {
                exposure_id,
                bits: exposure_bits,
            });
        }
        Ok(IdFactory {
            exposure_id,
            reserved_bits: 64 - exposure_bits,
            next: 1,
        })
    }

    /// A factory without an exposure id: plain sequential ids.
    pub fn simple() -> IdFactory {
        IdFactory {
            exposure_id: 0,
            reserved_bits: 64,
            next: 1,
        }
    }

    pub fn exposure_id(&self) -> u64 {
        self.exposure_id
    }

    pub fn reserved_bits(&self) -> u32 {
        self.reserved_bits
    }

    pub fn next_id(&mut self) -> Result<u64, IdFactoryError> {
        let counter = self.next;
        let fits = self.reserved_bits >= 64 || counter >> self.reserved_bits == 0;
        if !fits || counter == u64::MAX {
            return Err(IdFactoryError::Exhausted {
                exposure_id: self.exposure_id,
            });
        }
        self.next += 1;
        let high = if self.reserved_bits >= 64 {
            0
        } else {
            self.exposure_id << self.reserved_bits
        };
        Ok(high | counter)
    }
}

/// Pixel flags of a measured source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelFlags {
    pub edge: bool,
    pub interpolated_center: bool,
    pub interpolated: bool,
    pub saturated_center: bool,
    pub saturated: bool,
    pub cr_center: bool,
    pub cr: bool,
    pub bad: bool,
}

impl PixelFlags {
    /// No edge, bad, saturated or cosmic-ray pixel at the centre.
    pub fn is_good(&self) -> bool {
        !(self.edge || self.bad || self.saturated_center || self.cr_center)
    }
}

/// Second moments \[pixels²\].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Shape {
    pub xx: f64,
    pub yy: f64,
    pub xy: f64,
}

impl Shape {
    /// Determinant radius, (xx·yy − xy²)^¼.
    pub fn determinant_radius(&self) -> f64 {
        (self.xx * self.yy - self.xy * self.xy).max(0.0).powf(0.25)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub id: u64,

    /// Id of the parent record after deblending; 0 for none.
    pub parent: u64,

    pub footprint: Footprint,

    /// Parent pixel coordinates.
    pub centroid: Option<(f64, f64)>,

    pub coord: Option<RADec>,

    pub psf_flux: Option<f64>,
    pub psf_flux_err: Option<f64>,
    pub gaussian_flux: Option<f64>,
    pub ap_flux: Option<f64>,
    pub shape: Option<Shape>,
    pub flags: PixelFlags,

    /// The source was detected in the negative image only.
    pub negative: bool,

    pub dipole_pos_flux: Option<f64>,
    pub dipole_neg_flux: Option<f64>,

    /// 0 for a single-lobed source, approaching 1 for a balanced dipole.
    /// `None` until dipole measurement has run.
    pub classification_dipole: Option<f64>,

    pub ref_match_id: Option<u64>,
    pub src_match_id: Option<u64>,

    /// Calibrated PSF magnitude.
    pub calib_mag: Option<f64>,
}

impl SourceRecord {
    pub fn new(id: u64, footprint: Footprint) -> SourceRecord {
        SourceRecord {
            id,
            parent: 0,
            footprint,
            centroid: None,
            coord: None,
            psf_flux: None,
            psf_flux_err: None,
            gaussian_flux: None,
            ap_flux: None,
            shape: None,
            flags: PixelFlags::default(),
            negative: false,
            dipole_pos_flux: None,
            dipole_neg_flux: None,
            classification_dipole: None,
            ref_match_id: None,
            src_match_id: None,
            calib_mag: None,
        }
    }

    /// The centroid, falling back to the first peak.
    pub fn position(&self) -> Option<(f64, f64)> {
        self.centroid.or_else(|| {
            self.footprint
                .peaks
                .first()
                .map(|p| (p.x as f64, p.y as f64))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceCatalog {
    pub records: Vec<SourceRecord>,

    /// Keep heavy footprint values when the catalog is persisted.
    pub write_heavy_footprints: bool,
}

impl SourceCatalog {
    pub fn new(records: Vec<SourceRecord>) -> SourceCatalog {
        SourceCatalog {
            records,
            write_heavy_footprints: false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SourceRecord> {
        self.records.iter()
    }

    pub fn find(&self, id: u64) -> Option<&SourceRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// A copy ready for persistence: heavy footprint values are stripped
    /// unless `write_heavy_footprints` is set.
    pub fn for_persistence(&self) -> SourceCatalog {
        let mut out = self.clone();
        if !out.write_heavy_footprints {
            for r in &mut out.records {
                r.footprint.strip_heavy();
            }
        }
        out
    }
}
