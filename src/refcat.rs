//! External reference catalogs.

use marlu::RADec;

use crate::{geom::BoxI, geom::BoxD, wcs::Wcs};

#[derive(Debug, Clone, PartialEq)]
pub struct RefObject {
    pub id: u64,
    pub coord: RADec,
    pub mag: f64,
    pub is_star: bool,
    pub is_variable: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceCatalog {
    pub objects: Vec<RefObject>,
}

impl ReferenceCatalog {
    pub fn new(objects: Vec<RefObject>) -> ReferenceCatalog {
        ReferenceCatalog { objects }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects within `radius` \[radians\] of `center`.
    pub fn load_region(&self, center: RADec, radius: f64) -> ReferenceCatalog {
        ReferenceCatalog {
            objects: self
                .objects
                .iter()
                .filter(|o| o.coord.separation(center) <= radius)
                .cloned()
                .collect(),
        }
    }

    /// Objects covering the pixel box `bbox` of an image with `wcs`, padded by
    /// `padding_arcsec`.
    pub fn load_pixel_box(&self, wcs: &Wcs, bbox: BoxI, padding_arcsec: f64) -> ReferenceCatalog {
        let b = BoxD::from(bbox);
        let (cx, cy) = b.center();
        let center = wcs.pixel_to_sky(cx, cy);
        let radius = b
            .corners()
            .iter()
            .map(|&(x, y)| wcs.pixel_to_sky(x, y).separation(center))
            .fold(0.0, f64::max)
            + (padding_arcsec / 3600.0).to_radians();
        self.load_region(center, radius)
    }
}
