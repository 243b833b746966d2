//! Relational tier access
//!
//! Recent measurements live in a structured store keyed by report id and
//! input. The tier is reached through the [`MeasurementStore`] trait:
//! [`LocalMeasurementStore`] for development and tests,
//! [`PgMeasurementStore`] for PostgreSQL. Every statement runs under a hard
//! timeout and acquires and releases its own connection.

mod local;
mod postgres;
mod sql;

pub use local::{LocalMeasurementStore, MeasurementRecord, StoreCallCounts};
pub use postgres::PgMeasurementStore;
pub use sql::{build_grouped_query, BindValue};

use crate::measurement::{FormatVersion, MeasurementBody, MeasurementRef, StorageTier};
use crate::query::{
    AggregationRow, BucketGranularity, Dimension, DimensionValue, Filter, QueryPlan, TimeRange,
};
use crate::Result;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Connection pool and statement limits
#[derive(Debug, Clone)]
pub struct RelationalConfig {
    pub max_connections: u32,
    /// How long a statement waits for a free connection
    pub acquire_timeout: Duration,
    /// Server-side limit applied to every statement
    pub statement_timeout: Duration,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            acquire_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of an existence probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The relational tier holds the measurement
    Row,
    /// Archived, and the archive index knows the container frame offset
    ArchiveFrame(u64),
    /// No relational row and no archive index entry
    Missing,
}

/// Body columns of one stored measurement
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBody {
    pub measurement_start_time: DateTime<Utc>,
    pub format_version: FormatVersion,
    pub raw_bytes: Bytes,
}

/// One grouped-count statement: a keyset page over the group tuples of a
/// plan.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedQuery {
    pub dimensions: Vec<Dimension>,
    pub granularity: Option<BucketGranularity>,
    pub filters: Vec<Filter>,
    pub time_range: TimeRange,
    /// Only groups strictly after this tuple
    pub after: Option<Vec<DimensionValue>>,
    pub limit: usize,
}

impl GroupedQuery {
    pub fn from_plan(plan: &QueryPlan, after: Option<Vec<DimensionValue>>, limit: usize) -> Self {
        Self {
            dimensions: plan.dimensions.clone(),
            granularity: plan.granularity,
            filters: plan.filters.clone(),
            time_range: plan.time_range,
            after,
            limit,
        }
    }

    /// Bucket width used when grouping by time.
    pub fn bucket_granularity(&self) -> BucketGranularity {
        self.granularity.unwrap_or(BucketGranularity::Day)
    }
}

/// Storage interface of the relational tier
///
/// `aggregate` returns at most `query.limit` group rows ordered ascending by
/// dimension tuple, all strictly after `query.after`. With no dimensions it
/// returns exactly one row.
#[async_trait]
pub trait MeasurementStore: Send + Sync + std::fmt::Debug {
    /// Single-statement existence check
    async fn probe(&self, reference: &MeasurementRef) -> Result<ProbeResult>;

    /// Fetch a body by primary key
    async fn fetch_measurement(&self, reference: &MeasurementRef) -> Result<Option<StoredBody>>;

    /// Grouped counts; cancelling the token cancels the running statement
    async fn aggregate(
        &self,
        query: &GroupedQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<AggregationRow>>;
}

/// Reads bodies and grouped rows from a [`MeasurementStore`].
#[derive(Debug, Clone)]
pub struct RelationalReader {
    store: Arc<dyn MeasurementStore>,
}

impl RelationalReader {
    pub fn new(store: Arc<dyn MeasurementStore>) -> Self {
        Self { store }
    }

    pub async fn probe(&self, reference: &MeasurementRef) -> Result<ProbeResult> {
        self.store.probe(reference).await
    }

    /// Fetch a body; the returned reference carries the stored start time.
    pub async fn fetch(&self, reference: &MeasurementRef) -> Result<MeasurementBody> {
        let stored = self
            .store
            .fetch_measurement(reference)
            .await?
            .ok_or_else(|| reference.not_found(StorageTier::Relational))?;

        let mut resolved = reference.clone();
        resolved.measurement_start_time = Some(stored.measurement_start_time);

        Ok(MeasurementBody {
            reference: resolved,
            raw_bytes: stored.raw_bytes,
            format_version: stored.format_version,
            tier: StorageTier::Relational,
        })
    }

    pub async fn fetch_aggregate_rows(
        &self,
        query: &GroupedQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<AggregationRow>> {
        self.store.aggregate(query, cancel).await
    }
}
