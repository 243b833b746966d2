//! Execution of aggregation plans
//!
//! The aggregator walks the store's group tuples in keyset order, merges
//! rows that share a tuple and cuts the result into pages. Counter
//! invariants are checked on the merged rows: a counter larger than its
//! row's measurement count is capped and reported, never passed through.

use super::planner::QueryPlan;
use super::request::{AggregationRow, DimensionValue, PageCursor};
use crate::relational::{GroupedQuery, RelationalReader};
use crate::{Error, Result};

use serde::Serialize;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A counter that exceeded its row's measurement count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataIssue {
    pub dimension_values: Vec<DimensionValue>,
    /// Name of the offending counter
    pub counter: &'static str,
    pub reported: u64,
    pub measurement_count: u64,
}

impl DataIssue {
    pub fn to_error(&self) -> Error {
        let key: Vec<String> = self.dimension_values.iter().map(|v| v.to_string()).collect();
        Error::InconsistentData {
            detail: format!(
                "{}={} exceeds measurement_count={} for ({})",
                self.counter,
                self.reported,
                self.measurement_count,
                key.join(", ")
            ),
        }
    }
}

/// One page of aggregation output.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPage {
    /// Ascending by dimension tuple, tuples unique
    pub rows: Vec<AggregationRow>,
    /// Present when more groups follow
    pub next_cursor: Option<PageCursor>,
    pub issues: Vec<DataIssue>,
    /// Statements issued for this page
    pub store_pages: u64,
    /// Store rows folded into a group already seen
    pub merged_duplicates: u64,
}

/// Runs [`QueryPlan`]s against the relational tier.
#[derive(Debug, Clone)]
pub struct Aggregator {
    reader: RelationalReader,
    /// Group rows requested per statement
    fetch_size: usize,
}

impl Aggregator {
    pub fn new(reader: RelationalReader, fetch_size: usize) -> Self {
        Self {
            reader,
            fetch_size: fetch_size.max(1),
        }
    }

    pub async fn run(&self, plan: &QueryPlan, cancel: &CancellationToken) -> Result<AggregationPage> {
        let grouped = !plan.dimensions.is_empty();
        // Client cursor: groups at or before it belong to earlier pages
        let floor = if grouped {
            plan.cursor.as_ref().map(|c| c.0.clone())
        } else {
            None
        };
        let mut after = floor.clone();

        let mut merged: BTreeMap<Vec<DimensionValue>, AggregationRow> = BTreeMap::new();
        let mut fetched: u64 = 0;
        let mut store_pages: u64 = 0;
        let mut merged_duplicates: u64 = 0;
        let mut exhausted = false;

        while !exhausted {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: "aggregate",
                });
            }

            let remaining = plan.row_ceiling.saturating_sub(fetched);
            if remaining == 0 {
                break;
            }
            let limit = (self.fetch_size as u64).min(remaining) as usize;
            let query = GroupedQuery::from_plan(plan, after.clone(), limit);
            let rows = self.reader.fetch_aggregate_rows(&query, cancel).await?;
            store_pages += 1;
            fetched += rows.len() as u64;
            exhausted = !grouped || rows.len() < limit;

            let mut last_seen: Option<Vec<DimensionValue>> = None;
            for row in rows {
                if row.dimension_values.len() != plan.dimensions.len() {
                    return Err(Error::Internal(format!(
                        "store returned {} group values for {} dimensions",
                        row.dimension_values.len(),
                        plan.dimensions.len()
                    )));
                }
                if let Some(floor) = &floor {
                    if row.dimension_values <= *floor {
                        continue;
                    }
                }
                if last_seen
                    .as_ref()
                    .map_or(true, |last| row.dimension_values > *last)
                {
                    last_seen = Some(row.dimension_values.clone());
                }
                merge(&mut merged, row, &mut merged_duplicates);
            }

            match last_seen {
                Some(key) => after = Some(key),
                None => break,
            }

            if merged.len() > plan.page_size {
                break;
            }
        }

        if !grouped && merged.is_empty() {
            merged.insert(Vec::new(), AggregationRow::new(Vec::new()));
        }

        let more = merged.len() > plan.page_size || (grouped && !exhausted);
        let mut rows: Vec<AggregationRow> = merged.into_values().take(plan.page_size).collect();
        let next_cursor = if more && grouped {
            rows.last().map(|row| PageCursor(row.dimension_values.clone()))
        } else {
            None
        };

        let mut issues = Vec::new();
        for row in &mut rows {
            check_counters(row, &mut issues);
        }
        for issue in &issues {
            error!(
                counter = issue.counter,
                reported = issue.reported,
                measurement_count = issue.measurement_count,
                error = %issue.to_error(),
                "Capped inconsistent aggregate counter"
            );
        }

        debug!(
            rows = rows.len(),
            store_pages,
            merged_duplicates,
            has_more = next_cursor.is_some(),
            "Aggregation page assembled"
        );

        Ok(AggregationPage {
            rows,
            next_cursor,
            issues,
            store_pages,
            merged_duplicates,
        })
    }
}

fn merge(
    merged: &mut BTreeMap<Vec<DimensionValue>, AggregationRow>,
    row: AggregationRow,
    duplicates: &mut u64,
) {
    match merged.get_mut(&row.dimension_values) {
        Some(existing) => {
            *duplicates += 1;
            existing.measurement_count = existing
                .measurement_count
                .saturating_add(row.measurement_count);
            existing.anomaly_count = existing.anomaly_count.saturating_add(row.anomaly_count);
            existing.confirmed_count = existing
                .confirmed_count
                .saturating_add(row.confirmed_count);
            existing.failure_count = existing.failure_count.saturating_add(row.failure_count);
        }
        None => {
            merged.insert(row.dimension_values.clone(), row);
        }
    }
}

fn check_counters(row: &mut AggregationRow, issues: &mut Vec<DataIssue>) {
    let total = row.measurement_count;
    let counters = [
        ("anomaly_count", &mut row.anomaly_count),
        ("confirmed_count", &mut row.confirmed_count),
        ("failure_count", &mut row.failure_count),
    ];
    for (counter, value) in counters {
        if *value > total {
            issues.push(DataIssue {
                dimension_values: row.dimension_values.clone(),
                counter,
                reported: *value,
                measurement_count: total,
            });
            *value = total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementRef;
    use crate::query::{AccessPath, Dimension, TimeRange};
    use crate::relational::{MeasurementStore, ProbeResult, StoredBody};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Replays canned rows and honours keyset and limit like a real store.
    #[derive(Debug, Default)]
    struct ScriptedStore {
        rows: Vec<AggregationRow>,
        queries: Mutex<Vec<GroupedQuery>>,
    }

    #[async_trait]
    impl MeasurementStore for ScriptedStore {
        async fn probe(&self, _reference: &MeasurementRef) -> Result<ProbeResult> {
            Ok(ProbeResult::Missing)
        }

        async fn fetch_measurement(&self, _reference: &MeasurementRef) -> Result<Option<StoredBody>> {
            Ok(None)
        }

        async fn aggregate(
            &self,
            query: &GroupedQuery,
            _cancel: &CancellationToken,
        ) -> Result<Vec<AggregationRow>> {
            self.queries.lock().push(query.clone());
            Ok(self
                .rows
                .iter()
                .filter(|r| query.after.as_ref().map_or(true, |a| r.dimension_values > *a))
                .take(query.limit)
                .cloned()
                .collect())
        }
    }

    fn row(cc: &str, measurements: u64, anomalies: u64) -> AggregationRow {
        AggregationRow {
            dimension_values: vec![DimensionValue::text(cc)],
            measurement_count: measurements,
            anomaly_count: anomalies,
            confirmed_count: 0,
            failure_count: 0,
        }
    }

    fn plan(page_size: usize) -> QueryPlan {
        QueryPlan {
            dimensions: vec![Dimension::Country],
            granularity: None,
            widened: false,
            filters: vec![],
            time_range: TimeRange::new(
                Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap(),
            ),
            cursor: None,
            page_size,
            row_ceiling: 1_000,
            estimated_rows: 250,
            access_path: AccessPath::IndexScan,
        }
    }

    fn aggregator(store: ScriptedStore, fetch_size: usize) -> (Aggregator, Arc<ScriptedStore>) {
        let store = Arc::new(store);
        let reader = RelationalReader::new(store.clone());
        (Aggregator::new(reader, fetch_size), store)
    }

    #[tokio::test]
    async fn test_duplicate_tuples_are_merged() {
        let (aggregator, _) = aggregator(
            ScriptedStore {
                rows: vec![row("DE", 3, 1), row("IT", 2, 0), row("IT", 5, 2), row("US", 1, 1)],
                ..Default::default()
            },
            100,
        );

        let page = aggregator.run(&plan(10), &CancellationToken::new()).await.unwrap();
        assert_eq!(page.rows.len(), 3);
        assert_eq!(page.rows[1], row("IT", 7, 2));
        assert_eq!(page.merged_duplicates, 1);
        assert!(page.next_cursor.is_none());
        assert!(page.issues.is_empty());
    }

    #[tokio::test]
    async fn test_small_fetches_walk_the_keyset() {
        let rows: Vec<AggregationRow> = ["AR", "BR", "CL", "DE", "IT"]
            .iter()
            .map(|cc| row(cc, 1, 0))
            .collect();
        let (aggregator, store) = aggregator(
            ScriptedStore {
                rows,
                ..Default::default()
            },
            2,
        );

        let page = aggregator.run(&plan(10), &CancellationToken::new()).await.unwrap();
        assert_eq!(page.rows.len(), 5);
        assert_eq!(page.store_pages, 3);

        let queries = store.queries.lock();
        assert_eq!(queries[0].after, None);
        assert_eq!(queries[1].after, Some(vec![DimensionValue::text("BR")]));
        assert_eq!(queries[2].after, Some(vec![DimensionValue::text("DE")]));
    }

    #[tokio::test]
    async fn test_page_boundary_yields_cursor() {
        let rows: Vec<AggregationRow> = ["AR", "BR", "CL"].iter().map(|cc| row(cc, 1, 0)).collect();
        let (aggregator, _) = aggregator(
            ScriptedStore {
                rows,
                ..Default::default()
            },
            100,
        );

        let first = aggregator.run(&plan(2), &CancellationToken::new()).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        let cursor = first.next_cursor.clone().unwrap();
        assert_eq!(cursor.0, vec![DimensionValue::text("BR")]);

        let mut next = plan(2);
        next.cursor = Some(cursor);
        let second = aggregator.run(&next, &CancellationToken::new()).await.unwrap();
        assert_eq!(second.rows, vec![row("CL", 1, 0)]);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_inconsistent_counters_are_capped_and_reported() {
        let (aggregator, _) = aggregator(
            ScriptedStore {
                rows: vec![row("IT", 4, 9)],
                ..Default::default()
            },
            100,
        );

        let page = aggregator.run(&plan(10), &CancellationToken::new()).await.unwrap();
        assert_eq!(page.rows[0].anomaly_count, 4);
        assert_eq!(page.issues.len(), 1);
        assert_eq!(page.issues[0].counter, "anomaly_count");
        assert_eq!(page.issues[0].reported, 9);
        assert!(matches!(page.issues[0].to_error(), Error::InconsistentData { .. }));
    }

    #[tokio::test]
    async fn test_zero_dimensions_always_yield_one_row() {
        let (aggregator, _) = aggregator(ScriptedStore::default(), 100);
        let mut p = plan(10);
        p.dimensions.clear();

        let page = aggregator.run(&p, &CancellationToken::new()).await.unwrap();
        assert_eq!(page.rows, vec![AggregationRow::new(vec![])]);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_statement() {
        let (aggregator, store) = aggregator(ScriptedStore::default(), 100);
        let token = CancellationToken::new();
        token.cancel();

        let err = aggregator.run(&plan(10), &token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(store.queries.lock().is_empty());
    }
}
