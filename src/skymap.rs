//! Tract/patch sky tiling and the [`SkyTileLocator`].
//!
//! A tract is a TAN projection with a pixel bounding box, cut into a regular
//! grid of patches. Each patch has an inner box (the tiling proper, patches
//! do not overlap) and an outer box (the inner box grown by an overlap border
//! and clipped to the tract). Coadds are stored per patch over the outer box.

use std::fmt;

use itertools::iproduct;
use log::debug;
use marlu::RADec;
use vec1::Vec1;

use crate::{
    error::MissingInputError,
    geom::{BoxD, BoxI},
    wcs::Wcs,
};

/// Index of a patch within its tract. Unique within a tract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchIndex {
    pub x: u32,
    pub y: u32,
}

impl PatchIndex {
    pub fn new(x: u32, y: u32) -> PatchIndex {
        PatchIndex { x, y }
    }
}

impl fmt::Display for PatchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

impl std::str::FromStr for PatchIndex {
    type Err = String;

    /// Parse the "x,y" form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = s
            .split_once(',')
            .ok_or_else(|| format!("patch index '{s}' is not of the form x,y"))?;
        let x = x.trim().parse().map_err(|e| format!("bad patch x '{x}': {e}"))?;
        let y = y.trim().parse().map_err(|e| format!("bad patch y '{y}': {e}"))?;
        Ok(PatchIndex { x, y })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchInfo {
    pub index: PatchIndex,
    pub inner_bbox: BoxI,
    pub outer_bbox: BoxI,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TractInfo {
    pub id: u32,

    /// The tract projection. Patch boxes are in this pixel frame.
    pub wcs: Wcs,

    pub bbox: BoxI,

    /// Number of patches along x and y.
    pub num_patches: (u32, u32),

    /// Dimensions of a patch inner box \[pixels\].
    pub patch_inner_dims: (usize, usize),

    /// Width of the overlap border around each patch \[pixels\].
    pub patch_border: usize,
}

impl TractInfo {
    /// A tract centred on `center` with its pixel origin at (0, 0).
    pub fn new(
        id: u32,
        center: RADec,
        pixel_scale_arcsec: f64,
        num_patches: (u32, u32),
        patch_inner_dims: (usize, usize),
        patch_border: usize,
    ) -> TractInfo {
        let width = num_patches.0 as usize * patch_inner_dims.0;
        let height = num_patches.1 as usize * patch_inner_dims.1;
        let bbox = BoxI::from_origin(0, 0, width, height);
        let (cx, cy) = BoxD::from(bbox).center();
        TractInfo {
            id,
            wcs: Wcs::from_scale(center, (cx, cy), pixel_scale_arcsec),
            bbox,
            num_patches,
            patch_inner_dims,
            patch_border,
        }
    }

    pub fn center(&self) -> RADec {
        let (cx, cy) = BoxD::from(self.bbox).center();
        self.wcs.pixel_to_sky(cx, cy)
    }

    pub fn patch_info(&self, index: PatchIndex) -> Option<PatchInfo> {
        if index.x >= self.num_patches.0 || index.y >= self.num_patches.1 {
            return None;
        }
        let (w, h) = self.patch_inner_dims;
        let inner_bbox = BoxI::from_origin(
            self.bbox.min_x + (index.x as usize * w) as i32,
            self.bbox.min_y + (index.y as usize * h) as i32,
            w,
            h,
        );
        let outer_bbox = inner_bbox
            .grown(self.patch_border as i32)
            .intersection(&self.bbox)
            .unwrap_or(inner_bbox);
        Some(PatchInfo {
            index,
            inner_bbox,
            outer_bbox,
        })
    }

    /// Every patch of the tract, ordered by (y, x) index.
    pub fn patches(&self) -> impl Iterator<Item = PatchInfo> + '_ {
        iproduct!(0..self.num_patches.1, 0..self.num_patches.0)
            .filter_map(|(y, x)| self.patch_info(PatchIndex::new(x, y)))
    }

    /// Whether a sky position lands on this tract's pixels.
    pub fn contains(&self, coord: RADec) -> bool {
        match self.wcs.sky_to_pixel(coord) {
            Some((x, y)) => {
                let b = BoxD::from(self.bbox);
                x >= b.min_x && x <= b.max_x && y >= b.min_y && y <= b.max_y
            }
            None => false,
        }
    }

    /// Patches whose inner boxes overlap the pixel region spanned by `coords`,
    /// ordered by (y, x) index.
    pub fn find_patch_list(&self, coords: &[RADec]) -> Vec<PatchInfo> {
        let mut region: Option<BoxD> = None;
        for &coord in coords {
            let Some((x, y)) = self.wcs.sky_to_pixel(coord) else {
                continue;
            };
            let b = region.get_or_insert(BoxD {
                min_x: x,
                min_y: y,
                max_x: x,
                max_y: y,
            });
            b.min_x = b.min_x.min(x);
            b.min_y = b.min_y.min(y);
            b.max_x = b.max_x.max(x);
            b.max_y = b.max_y.max(y);
        }
        let Some(region) = region else {
            return vec![];
        };
        let pixel_region = BoxI::new(
            (region.min_x.round() as i32, region.min_y.round() as i32),
            (region.max_x.round() as i32, region.max_y.round() as i32),
        );
        self.patches()
            .filter(|p| p.inner_bbox.overlaps(&pixel_region))
            .collect()
    }
}

/// A collection of tracts covering (part of) the sky.
#[derive(Debug, Clone, PartialEq)]
pub struct SkyMap {
    pub tracts: Vec<TractInfo>,
}

impl SkyMap {
    pub fn new(tracts: Vec<TractInfo>) -> SkyMap {
        SkyMap { tracts }
    }

    pub fn tract(&self, id: u32) -> Option<&TractInfo> {
        self.tracts.iter().find(|t| t.id == id)
    }

    /// The tract containing `coord` whose centre is closest to it.
    pub fn find_tract(&self, coord: RADec) -> Result<&TractInfo, MissingInputError> {
        self.tracts
            .iter()
            .filter(|t| t.contains(coord))
            .map(|t| (t, t.center().separation(coord)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(t, _)| t)
            .ok_or(MissingInputError::NoTractFound {
                ra_deg: coord.ra.to_degrees(),
                dec_deg: coord.dec.to_degrees(),
            })
    }
}

/// The sky footprint of a rectangular pixel region.
#[derive(Debug, Clone, PartialEq)]
pub struct SkyFootprint {
    pub center: RADec,
    pub corners: [RADec; 4],
}

impl SkyFootprint {
    /// Project the centre and corners of `bbox` through `wcs`.
    pub fn from_bbox(wcs: &Wcs, bbox: BoxI) -> SkyFootprint {
        let b = BoxD::from(bbox);
        let (cx, cy) = b.center();
        let corners = b.corners().map(|(x, y)| wcs.pixel_to_sky(x, y));
        SkyFootprint {
            center: wcs.pixel_to_sky(cx, cy),
            corners,
        }
    }
}

/// Finds the tract and patches covering a sky footprint.
pub struct SkyTileLocator<'a> {
    sky_map: &'a SkyMap,
}

impl<'a> SkyTileLocator<'a> {
    pub fn new(sky_map: &'a SkyMap) -> SkyTileLocator<'a> {
        SkyTileLocator { sky_map }
    }

    /// The tract is chosen by the footprint centre; the patches are those of
    /// that tract overlapping the footprint corners.
    pub fn locate(
        &self,
        footprint: &SkyFootprint,
    ) -> Result<(&'a TractInfo, Vec1<PatchInfo>), MissingInputError> {
        let tract = self.sky_map.find_tract(footprint.center)?;
        let patches = tract.find_patch_list(&footprint.corners);
        debug!(
            "Tract {} overlaps patches [{}]",
            tract.id,
            patches
                .iter()
                .map(|p| p.index.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        );
        match Vec1::try_from_vec(patches) {
            Ok(patches) => Ok((tract, patches)),
            Err(_) => Err(MissingInputError::NoTractFound {
                ra_deg: footprint.center.ra.to_degrees(),
                dec_deg: footprint.center.dec.to_degrees(),
            }),
        }
    }
}

/// The union of the outer boxes of `patches`.
pub fn union_outer_bbox<'p>(patches: impl IntoIterator<Item = &'p PatchInfo>) -> BoxI {
    let mut bbox = BoxI::empty();
    for patch in patches {
        bbox.include_box(&patch.outer_bbox);
    }
    bbox
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tract() -> TractInfo {
        TractInfo::new(
            7,
            RADec {
                ra: 30.0_f64.to_radians(),
                dec: -10.0_f64.to_radians(),
            },
            0.2,
            (2, 2),
            (100, 100),
            10,
        )
    }

    fn footprint_of(tract: &TractInfo, bbox: BoxI) -> SkyFootprint {
        SkyFootprint::from_bbox(&tract.wcs, bbox)
    }

    #[test]
    fn test_patch_boxes() {
        let tract = test_tract();
        let p = tract.patch_info(PatchIndex::new(1, 0)).unwrap();
        assert_eq!(p.inner_bbox, BoxI::new((100, 0), (199, 99)));
        // Clipped to the tract on the outside edges.
        assert_eq!(p.outer_bbox, BoxI::new((90, 0), (199, 109)));
        assert!(tract.patch_info(PatchIndex::new(2, 0)).is_none());
        assert_eq!(tract.patches().count(), 4);
    }

    #[test]
    fn test_footprint_inside_one_patch() {
        let tract = test_tract();
        let sky_map = SkyMap::new(vec![tract.clone()]);
        let locator = SkyTileLocator::new(&sky_map);
        let (found, patches) = locator
            .locate(&footprint_of(&tract, BoxI::new((120, 130), (160, 170))))
            .unwrap();
        assert_eq!(found.id, 7);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].index, PatchIndex::new(1, 1));
    }

    #[test]
    fn test_footprint_straddling_all_patches() {
        let tract = test_tract();
        let sky_map = SkyMap::new(vec![tract.clone()]);
        let locator = SkyTileLocator::new(&sky_map);
        let (_, patches) = locator
            .locate(&footprint_of(&tract, BoxI::new((80, 80), (120, 120))))
            .unwrap();
        let indices: Vec<_> = patches.iter().map(|p| p.index).collect();
        assert_eq!(
            indices,
            vec![
                PatchIndex::new(0, 0),
                PatchIndex::new(1, 0),
                PatchIndex::new(0, 1),
                PatchIndex::new(1, 1)
            ]
        );
        let union = union_outer_bbox(patches.iter());
        assert_eq!(union, tract.bbox);
        for p in patches.iter() {
            assert!(union.contains_box(&p.outer_bbox));
            assert_ne!(union, p.outer_bbox);
        }
    }

    #[test]
    fn test_no_tract_found() {
        let sky_map = SkyMap::new(vec![test_tract()]);
        let far_away = RADec {
            ra: 200.0_f64.to_radians(),
            dec: 45.0_f64.to_radians(),
        };
        let footprint = SkyFootprint {
            center: far_away,
            corners: [far_away; 4],
        };
        let err = SkyTileLocator::new(&sky_map).locate(&footprint).unwrap_err();
        assert!(matches!(err, MissingInputError::NoTractFound { .. }));
    }

    #[test]
    fn test_closest_tract_wins() {
        let a = test_tract();
        let mut b = test_tract();
        b.id = 8;
        b.wcs = b.wcs.shifted(-50.0, 0.0);
        let sky_map = SkyMap::new(vec![a.clone(), b]);
        // Right of the first tract's centre: closer to tract 8's centre.
        let coord = a.wcs.pixel_to_sky(150.0, 100.0);
        assert_eq!(sky_map.find_tract(coord).unwrap().id, 8);
        let coord = a.wcs.pixel_to_sky(20.0, 100.0);
        assert_eq!(sky_map.find_tract(coord).unwrap().id, 7);
    }

    #[test]
    fn test_patch_index_parse() {
        assert_eq!("3,4".parse::<PatchIndex>().unwrap(), PatchIndex::new(3, 4));
        assert!("3".parse::<PatchIndex>().is_err());
        assert_eq!(PatchIndex::new(1, 2).to_string(), "1,2");
    }
}
