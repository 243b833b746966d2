//! Single-measurement retrieval across both storage tiers
//!
//! The [`StorageLocator`] turns a reference into a [`Location`]; the
//! [`TieredReader`] reads any location. Callers never branch on tier.

mod locator;
pub(crate) mod telemetry;

pub use locator::{CutoverPolicy, StorageLocator};

use crate::archive::{ArchiveLocator, ArchiveReader};
use crate::measurement::{MeasurementBody, MeasurementRef, StorageTier};
use crate::relational::RelationalReader;
use crate::Result;

/// A resolved fetch plan for one measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Relational(MeasurementRef),
    Archive(MeasurementRef, ArchiveLocator),
}

impl Location {
    pub fn tier(&self) -> StorageTier {
        match self {
            Location::Relational(_) => StorageTier::Relational,
            Location::Archive(..) => StorageTier::Archive,
        }
    }

    pub fn reference(&self) -> &MeasurementRef {
        match self {
            Location::Relational(reference) | Location::Archive(reference, _) => reference,
        }
    }
}

/// One read interface over both tiers.
#[derive(Debug, Clone)]
pub struct TieredReader {
    relational: RelationalReader,
    archive: ArchiveReader,
}

impl TieredReader {
    pub fn new(relational: RelationalReader, archive: ArchiveReader) -> Self {
        Self {
            relational,
            archive,
        }
    }

    pub async fn read(&self, location: &Location) -> Result<MeasurementBody> {
        match location {
            Location::Relational(reference) => self.relational.fetch(reference).await,
            Location::Archive(reference, locator) => self.archive.fetch(reference, locator).await,
        }
    }
}
