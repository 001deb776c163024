//! Threshold detection with connected-component labelling.

use log::debug;
use ndarray::{prelude::*, Zip};

use super::{DetectionConfig, EngineError, FootprintSets, SourceDetector, ThresholdType};
use crate::{
    footprint::{find_root, union_labels, Footprint, Peak, Polarity},
    image::{Exposure, MaskPlane, MaskedImage},
    psf::Kernel,
};

const ENGINE: &str = "ThresholdDetector";

/// Detects 8-connected groups of pixels above (or below) a threshold.
/// `EDGE` and `NO_DATA` pixels are never part of a detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdDetector;

impl SourceDetector for ThresholdDetector {
    fn detect(
        &self,
        exposure: &mut Exposure,
        config: &DetectionConfig,
        smoothing_sigma: Option<f64>,
    ) -> Result<FootprintSets, EngineError> {
        let smoothed = match smoothing_sigma {
            Some(sigma) if sigma > 0.0 => {
                let size = 2 * (4.0 * sigma).ceil() as usize + 1;
                debug!("Smoothing with a {size}x{size} Gaussian of sigma {sigma:.3}");
                Some(
                    exposure
                        .masked_image
                        .convolved(&Kernel::gaussian(size, size, sigma)),
                )
            }
            _ => None,
        };
        let mi = smoothed.as_ref().unwrap_or(&exposure.masked_image);

        let usable = Zip::from(&mi.image)
            .and(&mi.mask)
            .map_collect(|v, m| {
                v.is_finite() && m & (MaskPlane::NO_DATA | MaskPlane::EDGE) == 0
            });
        let good: Vec<f64> = Zip::from(&mi.image)
            .and(&usable)
            .fold(Vec::new(), |mut acc, &v, &u| {
                if u {
                    acc.push(v as f64);
                }
                acc
            });
        if good.is_empty() {
            return Err(EngineError::NoUsablePixels { engine: ENGINE });
        }

        let background = if config.re_estimate_background {
            median(&good)
        } else {
            0.0
        };
        let stdev = {
            let n = good.len() as f64;
            let mean = good.iter().sum::<f64>() / n;
            (good.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
        };
        let value = config.threshold_value;
        let threshold = |r: usize, c: usize| -> f64 {
            match config.threshold_type {
                ThresholdType::Value => value,
                ThresholdType::Stdev => value * stdev,
                ThresholdType::PixelStdev => value * (mi.variance[[r, c]] as f64).max(0.0).sqrt(),
                ThresholdType::Variance => value * mi.variance[[r, c]] as f64,
            }
        };

        let mut sets = FootprintSets::default();
        if config.polarity.positive() {
            let above = Array2::from_shape_fn(mi.image.dim(), |(r, c)| {
                usable[[r, c]] && mi.image[[r, c]] as f64 - background >= threshold(r, c)
            });
            sets.positive = footprints(mi, &above, Polarity::Positive, config.min_pixels);
        }
        if config.polarity.negative() {
            let below = Array2::from_shape_fn(mi.image.dim(), |(r, c)| {
                usable[[r, c]] && background - mi.image[[r, c]] as f64 >= threshold(r, c)
            });
            sets.negative = footprints(mi, &below, Polarity::Negative, config.min_pixels);
        }

        let mask = &mut exposure.masked_image;
        for (footprints, bit) in [
            (&sets.positive, MaskPlane::DETECTED),
            (&sets.negative, MaskPlane::DETECTED_NEGATIVE),
        ] {
            for f in footprints {
                for &(x, y) in f.pixels() {
                    if let Some((v, m, var)) = mask.get(x, y) {
                        mask.set(x, y, (v, m | bit, var));
                    }
                }
            }
        }
        debug!(
            "Detected {} positive and {} negative footprints",
            sets.positive.len(),
            sets.negative.len()
        );
        Ok(sets)
    }
}

fn median(values: &[f64]) -> f64 {
    let mut v = values.to_vec();
    let mid = v.len() / 2;
    let (_, m, _) = v.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    *m
}

/// Label 8-connected components of `selected`. Components are returned in
/// order of their first pixel, each as a list of `[row, col]` indices.
fn connected_components(selected: &Array2<bool>) -> Vec<Vec<(usize, usize)>> {
    let (h, w) = selected.dim();
    let mut labels = Array2::<usize>::zeros((h, w));
    // Label 0 is the background.
    let mut parents = vec![0];
    for r in 0..h {
        for c in 0..w {
            if !selected[[r, c]] {
                continue;
            }
            let mut neighbours = [0; 4];
            if c > 0 {
                neighbours[0] = labels[[r, c - 1]];
            }
            if r > 0 {
                if c > 0 {
                    neighbours[1] = labels[[r - 1, c - 1]];
                }
                neighbours[2] = labels[[r - 1, c]];
                if c + 1 < w {
                    neighbours[3] = labels[[r - 1, c + 1]];
                }
            }
            match neighbours.iter().filter(|&&l| l > 0).min() {
                None => {
                    let label = parents.len();
                    parents.push(label);
                    labels[[r, c]] = label;
                }
                Some(&min) => {
                    labels[[r, c]] = min;
                    for &l in neighbours.iter().filter(|&&l| l > 0 && l != min) {
                        union_labels(&mut parents, min, l);
                    }
                }
            }
        }
    }

    let mut components: Vec<Vec<(usize, usize)>> = vec![vec![]; parents.len()];
    for ((r, c), &l) in labels.indexed_iter() {
        if l > 0 {
            let root = find_root(&mut parents, l);
            components[root].push((r, c));
        }
    }
    components.retain(|c| !c.is_empty());
    components
}

fn footprints(
    mi: &MaskedImage,
    selected: &Array2<bool>,
    polarity: Polarity,
    min_pixels: usize,
) -> Vec<Footprint> {
    connected_components(selected)
        .into_iter()
        .filter(|comp| comp.len() >= min_pixels.max(1))
        .map(|comp| {
            let value_of = |&(r, c): &(usize, usize)| mi.image[[r, c]];
            let by_value = |a: &&(usize, usize), b: &&(usize, usize)| {
                value_of(*a).total_cmp(&value_of(*b))
            };
            let extremum = match polarity {
                Polarity::Positive => comp.iter().max_by(by_value),
                Polarity::Negative => comp.iter().min_by(by_value),
            };
            let peaks = extremum
                .map(|&(r, c)| Peak {
                    x: mi.x0 + c as i32,
                    y: mi.y0 + r as i32,
                    value: mi.image[[r, c]],
                    polarity,
                })
                .into_iter()
                .collect();
            let pixels = comp
                .iter()
                .map(|&(r, c)| (mi.x0 + c as i32, mi.y0 + r as i32))
                .collect();
            Footprint::new(pixels, peaks)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::ThresholdPolarity, geom::BoxI};

    fn flat_exposure() -> Exposure {
        Exposure::new(
            MaskedImage::filled(BoxI::from_origin(10, 20, 30, 30), 0.0, 0, 1.0),
            None,
        )
    }

    fn config(polarity: ThresholdPolarity) -> DetectionConfig {
        DetectionConfig {
            threshold_value: 5.0,
            threshold_type: ThresholdType::PixelStdev,
            polarity,
            re_estimate_background: false,
            min_pixels: 1,
        }
    }

    #[test]
    fn test_components_are_eight_connected() {
        let mut selected = Array2::from_elem((5, 5), false);
        selected[[0, 0]] = true;
        selected[[1, 1]] = true;
        selected[[2, 2]] = true;
        selected[[0, 4]] = true;
        let comps = connected_components(&selected);
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].len(), 3);

        // A "U" joined only through its bottom row.
        let mut u = Array2::from_elem((3, 3), false);
        u[[0, 0]] = true;
        u[[1, 0]] = true;
        u[[2, 0]] = true;
        u[[2, 1]] = true;
        u[[2, 2]] = true;
        u[[1, 2]] = true;
        u[[0, 2]] = true;
        assert_eq!(connected_components(&u).len(), 1);
    }

    #[test]
    fn test_detect_both_polarities_and_set_mask() {
        let mut exp = flat_exposure();
        exp.masked_image.set(15, 25, (10.0, 0, 1.0));
        exp.masked_image.set(16, 25, (8.0, 0, 1.0));
        exp.masked_image.set(30, 40, (-12.0, 0, 1.0));
        exp.masked_image.set(35, 45, (4.0, 0, 1.0));

        let sets = ThresholdDetector
            .detect(&mut exp, &config(ThresholdPolarity::Both), None)
            .unwrap();
        assert_eq!(sets.positive.len(), 1);
        assert_eq!(sets.negative.len(), 1);
        let pos = &sets.positive[0];
        assert_eq!(pos.pixels(), &[(15, 25), (16, 25)]);
        assert_eq!((pos.peaks[0].x, pos.peaks[0].y), (15, 25));
        assert_eq!(sets.negative[0].peaks[0].polarity, Polarity::Negative);

        let mi = &exp.masked_image;
        assert_ne!(mi.get(15, 25).unwrap().1 & MaskPlane::DETECTED, 0);
        assert_ne!(mi.get(30, 40).unwrap().1 & MaskPlane::DETECTED_NEGATIVE, 0);
        assert_eq!(mi.get(35, 45).unwrap().1, 0);
    }

    #[test]
    fn test_no_data_pixels_are_ignored() {
        let mut exp = flat_exposure();
        exp.masked_image.set(15, 25, (100.0, MaskPlane::NO_DATA, 1.0));
        exp.masked_image.set(25, 30, (100.0, MaskPlane::EDGE, 1.0));
        exp.masked_image.set(20, 25, (f32::NAN, 0, 1.0));
        let sets = ThresholdDetector
            .detect(&mut exp, &config(ThresholdPolarity::Positive), None)
            .unwrap();
        assert!(sets.positive.is_empty());
        assert!(sets.negative.is_empty());
    }

    #[test]
    fn test_smoothing_finds_faint_extended_source() {
        let mut exp = flat_exposure();
        // A 5x5 plateau at 3 sigma per pixel: invisible unsmoothed.
        for y in 33..38 {
            for x in 23..28 {
                exp.masked_image.set(x, y, (3.0, 0, 1.0));
            }
        }
        let cfg = config(ThresholdPolarity::Positive);
        assert!(ThresholdDetector
            .detect(&mut exp.clone(), &cfg, None)
            .unwrap()
            .positive
            .is_empty());
        let sets = ThresholdDetector.detect(&mut exp, &cfg, Some(1.0)).unwrap();
        assert_eq!(sets.positive.len(), 1);
    }

    #[test]
    fn test_all_nan_is_an_error() {
        let mut exp = Exposure::new(
            MaskedImage::filled(BoxI::from_origin(0, 0, 4, 4), f32::NAN, 0, 1.0),
            None,
        );
        assert_eq!(
            ThresholdDetector
                .detect(&mut exp, &config(ThresholdPolarity::Both), None)
                .unwrap_err(),
            EngineError::NoUsablePixels { engine: ENGINE }
        );
    }
}
