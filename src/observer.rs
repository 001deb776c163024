//! Checkpoint hooks for inspecting intermediate products.

use crate::{image::Exposure, source::SourceRecord};

/// Called by [`crate::ImageDifferenceTask`] at fixed checkpoints of a run.
/// Every hook does nothing by default.
pub trait TaskObserver: Send + Sync {
    /// After the science exposure has been read and its PSF installed.
    fn on_repair(&self, _exposure: &Exposure) {}

    /// After the calexp background has been added back.
    fn on_background(&self, _exposure: &Exposure) {}

    /// After subtraction, with the difference exposure.
    fn on_subtracted(&self, _difference: &Exposure) {}

    /// After detection and measurement of diaSources.
    fn on_detected(&self, _difference: &Exposure, _sources: &[SourceRecord]) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl TaskObserver for NoopObserver {}
