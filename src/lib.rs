//! Difference imaging of single-visit exposures against coadd templates.
//!
//! [`ImageDifferenceTask`] runs the whole chain for one sensor: it assembles
//! a template from the coadd patches overlapping the exposure, matches PSFs
//! and subtracts, then detects, measures and associates diaSources. All
//! inputs and outputs go through a [`repository::Repository`].

pub mod config;
pub mod crossmatch;
pub mod engine;
pub mod error;
pub mod footprint;
pub mod geom;
pub mod image;
pub mod observer;
pub mod psf;
pub mod refcat;
pub mod repository;
pub mod selection;
pub mod sim;
pub mod skymap;
pub mod source;
pub mod subtraction;
pub mod task;
pub mod template;
pub mod transient;
pub mod wcs;

pub use config::{ConfigError, ImageDifferenceConfig};
pub use error::{ImageDifferenceError, MissingInputError, PartialDataWarning};
pub use observer::TaskObserver;
pub use repository::{DataId, DataRef, DatasetType, MemoryRepository, Repository};
pub use task::{ImageDifferenceMetadata, ImageDifferenceResult, ImageDifferenceTask, Stage};
