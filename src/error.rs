//! Errors raised by the image-differencing pipeline.
//!
//! Only the conditions in [`MissingInputError`] (plus invalid configuration,
//! engine failures and id exhaustion) abort a run. Missing optional products
//! are reported as [`PartialDataWarning`]s and the run continues.

use std::fmt;

use thiserror::Error;

use crate::{
    config::ConfigError, engine::EngineError, repository::DataId, repository::RepositoryError,
    source::IdFactoryError,
};

/// A required upstream input is absent. Fatal for the current target.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MissingInputError {
    #[error("No suitable tract found for RA {ra_deg:.6} deg, Dec {dec_deg:.6} deg")]
    NoTractFound { ra_deg: f64, dec_deg: f64 },

    #[error("No patches found! None of the {n_patches} overlapping patches of tract {tract} exist")]
    NoPatchesFound { tract: u32, n_patches: usize },

    #[error("No coadd Psf found in tract {tract}")]
    NoPsfFound { tract: u32 },

    #[error("No psf found for {data_id}")]
    MissingPsf { data_id: DataId },

    #[error("{dataset} does not exist for {data_id}")]
    MissingDataset { dataset: String, data_id: DataId },
}

/// An optional dataset was absent. The run continues without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDataWarning {
    pub dataset: String,
    pub data_id: DataId,
}

impl fmt::Display for PartialDataWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {} does not exist; skipping", self.dataset, self.data_id)
    }
}

#[derive(Error, Debug)]
pub enum ImageDifferenceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    MissingInput(#[from] MissingInputError),

    /// Failures inside an engine. These are never retried.
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    IdFactory(#[from] IdFactoryError),
}
