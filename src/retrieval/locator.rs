//! Routing of measurement references to a storage tier

use super::{telemetry, Location};
use crate::archive::ArchiveLocator;
use crate::measurement::{MeasurementRef, StorageTier};
use crate::relational::{ProbeResult, RelationalReader};
use crate::Result;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

/// Where the relational tier begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutoverPolicy {
    /// First instant held by the relational tier
    pub cutover: DateTime<Utc>,
    /// Start times this far before the cutover are confirmed with a probe
    pub boundary_margin: chrono::Duration,
}

impl CutoverPolicy {
    /// Tier implied by the start time alone; `None` when a probe must decide.
    pub fn tier_for(&self, start: Option<DateTime<Utc>>) -> Option<StorageTier> {
        let start = start?;
        if start >= self.cutover {
            Some(StorageTier::Relational)
        } else if start < self.cutover - self.boundary_margin {
            Some(StorageTier::Archive)
        } else {
            None
        }
    }
}

impl Default for CutoverPolicy {
    fn default() -> Self {
        Self {
            cutover: Utc
                .with_ymd_and_hms(2020, 10, 20, 0, 0, 0)
                .single()
                .unwrap_or_default(),
            boundary_margin: chrono::Duration::days(1),
        }
    }
}

/// Decides which tier holds a measurement.
///
/// Issues at most one existence probe per reference, and only when the
/// start time is unknown or close to the cutover.
#[derive(Debug, Clone)]
pub struct StorageLocator {
    policy: CutoverPolicy,
    relational: RelationalReader,
    archive_prefix: String,
}

impl StorageLocator {
    pub fn new(policy: CutoverPolicy, relational: RelationalReader, archive_prefix: &str) -> Self {
        Self {
            policy,
            relational,
            archive_prefix: archive_prefix.to_string(),
        }
    }

    pub fn policy(&self) -> &CutoverPolicy {
        &self.policy
    }

    pub async fn locate(&self, reference: &MeasurementRef) -> Result<Location> {
        // Validates the report id before any I/O
        let archive = ArchiveLocator::for_ref(reference, &self.archive_prefix)?;

        let (location, probed) = match self.policy.tier_for(reference.measurement_start_time) {
            Some(StorageTier::Relational) => (Location::Relational(reference.clone()), false),
            Some(StorageTier::Archive) => (Location::Archive(reference.clone(), archive), false),
            None => {
                let location = match self.relational.probe(reference).await? {
                    ProbeResult::Row => Location::Relational(reference.clone()),
                    ProbeResult::ArchiveFrame(offset) => {
                        Location::Archive(reference.clone(), archive.with_offset_hint(offset))
                    }
                    ProbeResult::Missing => Location::Archive(reference.clone(), archive),
                };
                (location, true)
            }
        };

        debug!(
            reference = %reference,
            tier = location.tier().as_str(),
            probed,
            "Measurement located"
        );
        telemetry::record_routing(location.tier(), probed);
        Ok(location)
    }
}
