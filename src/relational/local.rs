//! In-memory measurement store for development and testing

use super::{GroupedQuery, MeasurementStore, ProbeResult, RelationalConfig, StoredBody};
use crate::measurement::{FormatVersion, MeasurementRef};
use crate::query::{AggregationRow, Dimension, DimensionValue, FilterField};
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// One row of the `measurements` table.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub report_id: String,
    /// Empty when the test has no input
    pub input: String,
    pub measurement_start_time: DateTime<Utc>,
    pub probe_cc: String,
    pub probe_asn: u32,
    pub test_name: String,
    pub category_code: Option<String>,
    pub domain: Option<String>,
    pub anomaly: bool,
    pub confirmed: bool,
    pub failure: bool,
    pub format_version: FormatVersion,
    pub raw_bytes: Bytes,
}

impl MeasurementRecord {
    pub fn reference(&self) -> MeasurementRef {
        let reference = MeasurementRef::new(&self.report_id)
            .with_start_time(self.measurement_start_time);
        if self.input.is_empty() {
            reference
        } else {
            reference.with_input(&self.input)
        }
    }

    /// Value of a filter field. Time filters see the raw start time.
    fn field_value(&self, field: FilterField) -> Option<DimensionValue> {
        match field {
            FilterField::Dimension(Dimension::Country) => Some(DimensionValue::text(&self.probe_cc)),
            FilterField::Dimension(Dimension::Asn) => {
                Some(DimensionValue::Number(i64::from(self.probe_asn)))
            }
            FilterField::Dimension(Dimension::TestName) => {
                Some(DimensionValue::text(&self.test_name))
            }
            FilterField::Dimension(Dimension::CategoryCode) => Some(DimensionValue::text(
                self.category_code.clone().unwrap_or_default(),
            )),
            FilterField::Dimension(Dimension::TimeBucket) => {
                Some(DimensionValue::Time(self.measurement_start_time))
            }
            FilterField::Domain => self.domain.as_deref().map(DimensionValue::text),
            FilterField::Input => Some(DimensionValue::text(&self.input)),
        }
    }

    fn group_key(&self, query: &GroupedQuery) -> Vec<DimensionValue> {
        query
            .dimensions
            .iter()
            .map(|dimension| match dimension {
                Dimension::TimeBucket => DimensionValue::Time(
                    query
                        .bucket_granularity()
                        .truncate(self.measurement_start_time),
                ),
                other => self
                    .field_value(FilterField::Dimension(*other))
                    .unwrap_or_else(|| DimensionValue::text("")),
            })
            .collect()
    }

    fn matches(&self, query: &GroupedQuery) -> bool {
        query.time_range.contains(self.measurement_start_time)
            && query.filters.iter().all(|filter| {
                self.field_value(filter.field)
                    .map(|value| filter.matches(&value))
                    .unwrap_or(false)
            })
    }
}

/// Snapshot of how many statements a store has been asked to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub probes: u64,
    pub fetches: u64,
    pub aggregates: u64,
    pub cancellations: u64,
}

impl StoreCallCounts {
    pub fn total(&self) -> u64 {
        self.probes + self.fetches + self.aggregates
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    probes: AtomicU64,
    fetches: AtomicU64,
    aggregates: AtomicU64,
    cancellations: AtomicU64,
}

/// Local in-memory measurement store
///
/// Behaves like the production store at its edges: a bounded pool of
/// connections with an acquire timeout, a per-statement timeout and
/// statement cancellation. `with_statement_delay` makes every statement
/// take at least that long.
#[derive(Debug)]
pub struct LocalMeasurementStore {
    /// Rows keyed by (report_id, input)
    measurements: DashMap<(String, String), MeasurementRecord>,
    /// Archive index: frame offsets keyed by (report_id, input)
    archive_index: DashMap<(String, String), u64>,
    connections: Semaphore,
    config: RelationalConfig,
    statement_delay: Duration,
    counters: CallCounters,
}

impl LocalMeasurementStore {
    pub fn new(config: RelationalConfig) -> Self {
        Self {
            measurements: DashMap::new(),
            archive_index: DashMap::new(),
            connections: Semaphore::new(config.max_connections.max(1) as usize),
            config,
            statement_delay: Duration::ZERO,
            counters: CallCounters::default(),
        }
    }

    pub fn with_statement_delay(mut self, delay: Duration) -> Self {
        self.statement_delay = delay;
        self
    }

    pub fn insert(&self, record: MeasurementRecord) {
        self.measurements
            .insert((record.report_id.clone(), record.input.clone()), record);
    }

    /// Record the container frame holding an archived measurement.
    pub fn index_archived(&self, reference: &MeasurementRef, frame_offset: u64) {
        self.archive_index.insert(
            (reference.report_id.clone(), reference.input_key().to_string()),
            frame_offset,
        );
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn call_counts(&self) -> StoreCallCounts {
        StoreCallCounts {
            probes: self.counters.probes.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            aggregates: self.counters.aggregates.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
        }
    }

    /// Runs `work` as one statement: acquire a connection, honour the
    /// statement timeout and, when given a token, cancellation.
    async fn statement<T>(
        &self,
        operation: &'static str,
        cancel: Option<&CancellationToken>,
        work: impl FnOnce() -> T,
    ) -> Result<T> {
        let _connection = tokio::time::timeout(self.config.acquire_timeout, self.connections.acquire())
            .await
            .map_err(|_| Error::PoolExhausted {
                waited: self.config.acquire_timeout,
            })?
            .map_err(|_| Error::Internal("connection pool closed".to_string()))?;

        let execute = async {
            if !self.statement_delay.is_zero() {
                tokio::time::sleep(self.statement_delay).await;
            }
            work()
        };
        let timed = tokio::time::timeout(self.config.statement_timeout, execute);

        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::Cancelled { operation });
                }
                outcome = timed => outcome,
            },
            None => timed.await,
        };

        outcome.map_err(|_| Error::QueryTimeout {
            operation,
            timeout: self.config.statement_timeout,
        })
    }

    fn group(&self, query: &GroupedQuery) -> Vec<AggregationRow> {
        let mut groups: BTreeMap<Vec<DimensionValue>, AggregationRow> = BTreeMap::new();
        if query.dimensions.is_empty() {
            groups.insert(Vec::new(), AggregationRow::new(Vec::new()));
        }

        for entry in self.measurements.iter() {
            let record = entry.value();
            if !record.matches(query) {
                continue;
            }
            let key = record.group_key(query);
            if let Some(after) = &query.after {
                if !query.dimensions.is_empty() && key <= *after {
                    continue;
                }
            }
            let row = groups
                .entry(key.clone())
                .or_insert_with(|| AggregationRow::new(key));
            row.measurement_count += 1;
            row.anomaly_count += u64::from(record.anomaly);
            row.confirmed_count += u64::from(record.confirmed);
            row.failure_count += u64::from(record.failure);
        }

        groups.into_values().take(query.limit.max(1)).collect()
    }
}

impl Default for LocalMeasurementStore {
    fn default() -> Self {
        Self::new(RelationalConfig::default())
    }
}

#[async_trait]
impl MeasurementStore for LocalMeasurementStore {
    async fn probe(&self, reference: &MeasurementRef) -> Result<ProbeResult> {
        self.counters.probes.fetch_add(1, Ordering::Relaxed);
        let key = (reference.report_id.clone(), reference.input_key().to_string());
        self.statement("probe", None, || {
            if self.measurements.contains_key(&key) {
                ProbeResult::Row
            } else if let Some(offset) = self.archive_index.get(&key) {
                ProbeResult::ArchiveFrame(*offset)
            } else {
                ProbeResult::Missing
            }
        })
        .await
    }

    async fn fetch_measurement(&self, reference: &MeasurementRef) -> Result<Option<StoredBody>> {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let key = (reference.report_id.clone(), reference.input_key().to_string());
        self.statement("fetch_measurement", None, || {
            self.measurements.get(&key).map(|record| StoredBody {
                measurement_start_time: record.measurement_start_time,
                format_version: record.format_version,
                raw_bytes: record.raw_bytes.clone(),
            })
        })
        .await
    }

    async fn aggregate(
        &self,
        query: &GroupedQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<AggregationRow>> {
        self.counters.aggregates.fetch_add(1, Ordering::Relaxed);
        self.statement("aggregate", Some(cancel), || self.group(query))
            .await
    }
}
