//! Reference matching with a known WCS.

use log::debug;

use super::{AstrometricMatcher, EngineError, SourceMatch};
use crate::{refcat::ReferenceCatalog, source::SourceRecord, wcs::Wcs};

/// Matches each source to its nearest reference object on the sky. Reference
/// objects may be matched by more than one source.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighbourMatcher;

impl AstrometricMatcher for NearestNeighbourMatcher {
    fn use_known_wcs(
        &self,
        sources: &[SourceRecord],
        wcs: &Wcs,
        refcat: &ReferenceCatalog,
        radius_arcsec: f64,
    ) -> Result<Vec<SourceMatch>, EngineError> {
        if radius_arcsec.is_nan() || radius_arcsec <= 0.0 {
            return Err(EngineError::Failed {
                engine: "NearestNeighbourMatcher",
                message: format!("match radius must be positive, got {radius_arcsec}"),
            });
        }
        let radius = (radius_arcsec / 3600.0).to_radians();
        let matches: Vec<SourceMatch> = sources
            .iter()
            .filter_map(|s| {
                let (x, y) = s.position()?;
                let coord = wcs.pixel_to_sky(x, y);
                refcat
                    .objects
                    .iter()
                    .map(|o| (o, o.coord.separation(coord)))
                    .filter(|(_, d)| *d <= radius)
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(o, d)| SourceMatch {
                        reference: o.clone(),
                        source_id: s.id,
                        distance_arcsec: d.to_degrees() * 3600.0,
                    })
            })
            .collect();
        debug!(
            "Matched {} of {} sources to {} reference objects",
            matches.len(),
            sources.len(),
            refcat.len()
        );
        Ok(matches)
    }
}
