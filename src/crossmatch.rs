//! Association of transients with the exposure's prior sources and with the
//! reference catalog.

use log::{info, warn};

use crate::{
    engine::AstrometricMatcher,
    error::ImageDifferenceError,
    geom::BoxI,
    refcat::ReferenceCatalog,
    source::SourceRecord,
    wcs::Wcs,
};

/// Match counts. `None` when the catalog to match against was absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrossMatchSummary {
    pub n_src_matches: Option<usize>,
    pub n_ref_matches: Option<usize>,
}

pub struct CrossMatchStage<'a> {
    pub matcher: &'a dyn AstrometricMatcher,
    pub radius_arcsec: f64,
}

impl<'a> CrossMatchStage<'a> {
    /// Set `src_match_id` on each transient to the nearest prior source
    /// within the match radius, converted to pixels with `wcs`'s scale.
    /// Returns the number of transients matched.
    pub fn match_prior(
        &self,
        sources: &mut [SourceRecord],
        prior: &[SourceRecord],
        wcs: &Wcs,
    ) -> usize {
        let radius_pix = self.radius_arcsec / wcs.pixel_scale_arcsec();
        let radius_sq = radius_pix * radius_pix;
        let prior_positions: Vec<(u64, (f64, f64))> = prior
            .iter()
            .filter_map(|p| Some((p.id, p.position()?)))
            .collect();

        let mut n_matched = 0;
        for source in sources.iter_mut() {
            let Some((x, y)) = source.position() else {
                continue;
            };
            let mut best: Option<(u64, f64)> = None;
            for &(id, (px, py)) in &prior_positions {
                let d2 = (px - x).powi(2) + (py - y).powi(2);
                // Strictly closer replaces; the first of equals is kept.
                if d2 <= radius_sq && best.map_or(true, |(_, b)| d2 < b) {
                    best = Some((id, d2));
                }
            }
            source.src_match_id = best.map(|(id, _)| id);
            if best.is_some() {
                n_matched += 1;
            }
        }
        n_matched
    }

    /// Set `ref_match_id` on each transient from a sky match against the
    /// part of `refcat` covering `bbox`. Returns the number matched.
    pub fn match_reference(
        &self,
        sources: &mut [SourceRecord],
        refcat: &ReferenceCatalog,
        wcs: &Wcs,
        bbox: BoxI,
    ) -> Result<usize, ImageDifferenceError> {
        let region = refcat.load_pixel_box(wcs, bbox, self.radius_arcsec);
        let matches = self
            .matcher
            .use_known_wcs(sources, wcs, &region, self.radius_arcsec)?;
        for source in sources.iter_mut() {
            source.ref_match_id = matches
                .iter()
                .find(|m| m.source_id == source.id)
                .map(|m| m.reference.id);
        }
        Ok(matches.len())
    }

    /// Run both matches. Absent catalogs leave the linkage fields unset.
    pub fn run(
        &self,
        sources: &mut [SourceRecord],
        prior: Option<&[SourceRecord]>,
        refcat: Option<&ReferenceCatalog>,
        wcs: &Wcs,
        bbox: BoxI,
    ) -> Result<CrossMatchSummary, ImageDifferenceError> {
        let mut summary = CrossMatchSummary::default();
        match prior {
            Some(prior) => {
                let n = self.match_prior(sources, prior, wcs);
                info!("Matched {n} / {} diaSources to sources", sources.len());
                summary.n_src_matches = Some(n);
            }
            None => warn!("Src product does not exist; cannot match with diaSources"),
        }

        if let Some(refcat) = refcat {
            let n = self.match_reference(sources, refcat, wcs, bbox)?;
            if n == 0 {
                warn!("No diaSource matches with reference catalog");
            } else {
                info!("Matched {n} / {} diaSources to reference catalog", sources.len());
            }
            summary.n_ref_matches = Some(n);
        }
        Ok(summary)
    }
}
