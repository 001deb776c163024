//! The data repository: typed `get`/`put`/`exists` keyed by a dataset type
//! and a structured data identifier.

use std::{collections::HashMap, fmt, sync::Arc};

use log::trace;
use parking_lot::RwLock;
use thiserror::Error;

use crate::{
    image::{BackgroundModel, Exposure},
    psf::{ApertureCorrection, Psf},
    refcat::ReferenceCatalog,
    skymap::{PatchIndex, SkyMap},
    source::SourceCatalog,
    task::ImageDifferenceMetadata,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Dataset {dataset} for {data_id} holds a {found}, expected a {expected}")]
    WrongType {
        dataset: String,
        data_id: DataId,
        expected: &'static str,
        found: &'static str,
    },
}

/// A structured data identifier. Unset keys are omitted from the display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId {
    pub visit: Option<u64>,
    pub ccd: Option<u32>,
    pub tract: Option<u32>,
    pub patch: Option<PatchIndex>,
    pub filter: Option<String>,
}

impl DataId {
    /// The identifier of one sensor of one visit.
    pub fn sensor(visit: u64, ccd: u32) -> DataId {
        DataId {
            visit: Some(visit),
            ccd: Some(ccd),
            ..Default::default()
        }
    }

    /// The identifier of one coadd patch.
    pub fn patch(tract: u32, patch: PatchIndex) -> DataId {
        DataId {
            tract: Some(tract),
            patch: Some(patch),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> DataId {
        self.filter = Some(filter.into());
        self
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![];
        if let Some(v) = self.visit {
            parts.push(format!("visit={v}"));
        }
        if let Some(c) = self.ccd {
            parts.push(format!("ccd={c}"));
        }
        if let Some(t) = self.tract {
            parts.push(format!("tract={t}"));
        }
        if let Some(p) = self.patch {
            parts.push(format!("patch={p}"));
        }
        if let Some(filter) = &self.filter {
            parts.push(format!("filter={filter}"));
        }
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Dataset types. Coadd and difference products are prefixed by the coadd
/// name, e.g. `deepCoadd_psf`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatasetType {
    Calexp,
    CalexpBackground,
    Psf,
    ApCorr,
    Src,
    CcdExposureId,
    CcdExposureIdBits,
    RefCat,
    Coadd(String),
    CoaddPsf(String),
    CoaddApCorr(String),
    CoaddSkyMap(String),
    DiffExp(String),
    DiffMatchedExp(String),
    DiffDiaSrc(String),
    DiffMetadata(String),
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetType::Calexp => write!(f, "calexp"),
            DatasetType::CalexpBackground => write!(f, "calexpBackground"),
            DatasetType::Psf => write!(f, "psf"),
            DatasetType::ApCorr => write!(f, "apCorr"),
            DatasetType::Src => write!(f, "src"),
            DatasetType::CcdExposureId => write!(f, "ccdExposureId"),
            DatasetType::CcdExposureIdBits => write!(f, "ccdExposureId_bits"),
            DatasetType::RefCat => write!(f, "refcat"),
            DatasetType::Coadd(c) => write!(f, "{c}Coadd"),
            DatasetType::CoaddPsf(c) => write!(f, "{c}Coadd_psf"),
            DatasetType::CoaddApCorr(c) => write!(f, "{c}Coadd_apCorr"),
            DatasetType::CoaddSkyMap(c) => write!(f, "{c}Coadd_skyMap"),
            DatasetType::DiffExp(c) => write!(f, "{c}Diff_differenceExp"),
            DatasetType::DiffMatchedExp(c) => write!(f, "{c}Diff_matchedExp"),
            DatasetType::DiffDiaSrc(c) => write!(f, "{c}Diff_diaSrc"),
            DatasetType::DiffMetadata(c) => write!(f, "{c}Diff_metadata"),
        }
    }
}

/// A stored value. Large shared products are held behind [`Arc`]s.
#[derive(Debug, Clone)]
pub enum Dataset {
    Exposure(Exposure),
    Background(BackgroundModel),
    Psf(Psf),
    ApCorr(ApertureCorrection),
    Sources(SourceCatalog),
    Integer(u64),
    SkyMap(Arc<SkyMap>),
    RefCat(Arc<ReferenceCatalog>),
    Metadata(ImageDifferenceMetadata),
}

impl Dataset {
    pub fn kind(&self) -> &'static str {
        match self {
            Dataset::Exposure(_) => "Exposure",
            Dataset::Background(_) => "BackgroundModel",
            Dataset::Psf(_) => "Psf",
            Dataset::ApCorr(_) => "ApertureCorrection",
            Dataset::Sources(_) => "SourceCatalog",
            Dataset::Integer(_) => "u64",
            Dataset::SkyMap(_) => "SkyMap",
            Dataset::RefCat(_) => "ReferenceCatalog",
            Dataset::Metadata(_) => "ImageDifferenceMetadata",
        }
    }
}

/// Conversion between concrete values and [`Dataset`]s.
pub trait DatasetValue: Sized {
    const KIND: &'static str;

    /// Unwrap the value, handing the dataset back if it is of another kind.
    fn from_dataset(dataset: Dataset) -> Result<Self, Dataset>;

    fn into_dataset(self) -> Dataset;
}

macro_rules! dataset_value {
    ($ty:ty, $variant:ident, $kind:expr) => {
        impl DatasetValue for $ty {
            const KIND: &'static str = $kind;

            fn from_dataset(dataset: Dataset) -> Result<Self, Dataset> {
                match dataset {
                    Dataset::$variant(v) => Ok(v),
                    other => Err(other),
                }
            }

            fn into_dataset(self) -> Dataset {
                Dataset::$variant(self)
            }
        }
    };
}

dataset_value!(Exposure, Exposure, "Exposure");
dataset_value!(BackgroundModel, Background, "BackgroundModel");
dataset_value!(Psf, Psf, "Psf");
dataset_value!(ApertureCorrection, ApCorr, "ApertureCorrection");
dataset_value!(SourceCatalog, Sources, "SourceCatalog");
dataset_value!(u64, Integer, "u64");
dataset_value!(Arc<SkyMap>, SkyMap, "SkyMap");
dataset_value!(Arc<ReferenceCatalog>, RefCat, "ReferenceCatalog");
dataset_value!(ImageDifferenceMetadata, Metadata, "ImageDifferenceMetadata");

/// Storage of datasets. Implementations must be shareable between the
/// threads processing independent targets; `put` overwrites.
pub trait Repository: Send + Sync {
    fn get_dataset(&self, dataset: &DatasetType, data_id: &DataId) -> Option<Dataset>;

    fn put_dataset(&self, dataset: &DatasetType, data_id: &DataId, value: Dataset);

    fn exists(&self, dataset: &DatasetType, data_id: &DataId) -> bool;
}

impl dyn Repository + '_ {
    /// Typed get. `Ok(None)` when the dataset does not exist.
    pub fn get<T: DatasetValue>(
        &self,
        dataset: &DatasetType,
        data_id: &DataId,
    ) -> Result<Option<T>, RepositoryError> {
        match self.get_dataset(dataset, data_id) {
            None => Ok(None),
            Some(d) => T::from_dataset(d)
                .map(Some)
                .map_err(|d| RepositoryError::WrongType {
                    dataset: dataset.to_string(),
                    data_id: data_id.clone(),
                    expected: T::KIND,
                    found: d.kind(),
                }),
        }
    }

    pub fn put<T: DatasetValue>(&self, dataset: &DatasetType, data_id: &DataId, value: T) {
        self.put_dataset(dataset, data_id, value.into_dataset())
    }
}

/// A thread-safe in-memory repository.
#[derive(Default)]
pub struct MemoryRepository {
    datasets: RwLock<HashMap<(String, DataId), Dataset>>,
}

impl MemoryRepository {
    pub fn new() -> MemoryRepository {
        MemoryRepository::default()
    }

    pub fn len(&self) -> usize {
        self.datasets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.read().is_empty()
    }

    /// Remove a dataset, returning it if it existed.
    pub fn remove(&self, dataset: &DatasetType, data_id: &DataId) -> Option<Dataset> {
        self.datasets
            .write()
            .remove(&(dataset.to_string(), data_id.clone()))
    }
}

impl Repository for MemoryRepository {
    fn get_dataset(&self, dataset: &DatasetType, data_id: &DataId) -> Option<Dataset> {
        trace!("get {dataset} {data_id}");
        self.datasets
            .read()
            .get(&(dataset.to_string(), data_id.clone()))
            .cloned()
    }

    fn put_dataset(&self, dataset: &DatasetType, data_id: &DataId, value: Dataset) {
        trace!("put {dataset} {data_id}");
        self.datasets
            .write()
            .insert((dataset.to_string(), data_id.clone()), value);
    }

    fn exists(&self, dataset: &DatasetType, data_id: &DataId) -> bool {
        self.datasets
            .read()
            .contains_key(&(dataset.to_string(), data_id.clone()))
    }
}

/// A repository bound to one data identifier (e.g. one sensor).
#[derive(Clone, Copy)]
pub struct DataRef<'a> {
    pub repo: &'a dyn Repository,
    pub data_id: &'a DataId,
}

impl<'a> DataRef<'a> {
    pub fn new(repo: &'a dyn Repository, data_id: &'a DataId) -> DataRef<'a> {
        DataRef { repo, data_id }
    }

    pub fn get<T: DatasetValue>(
        &self,
        dataset: &DatasetType,
    ) -> Result<Option<T>, RepositoryError> {
        self.repo.get(dataset, self.data_id)
    }

    /// Typed get with a different identifier in the same repository.
    pub fn get_id<T: DatasetValue>(
        &self,
        dataset: &DatasetType,
        data_id: &DataId,
    ) -> Result<Option<T>, RepositoryError> {
        self.repo.get(dataset, data_id)
    }

    pub fn put<T: DatasetValue>(&self, dataset: &DatasetType, value: T) {
        self.repo.put(dataset, self.data_id, value)
    }

    pub fn exists(&self, dataset: &DatasetType) -> bool {
        self.repo.exists(dataset, self.data_id)
    }

    pub fn exists_id(&self, dataset: &DatasetType, data_id: &DataId) -> bool {
        self.repo.exists(dataset, data_id)
    }
}
