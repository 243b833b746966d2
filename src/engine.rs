//! Engine entry points
//!
//! [`Engine`] wires the locator, both tier readers, the planner, the
//! aggregator and the freshness calculator together. Every response leaves
//! with a [`FreshnessWindow`].

use crate::archive::ArchiveReader;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::freshness::{FreshnessCalculator, FreshnessWindow};
use crate::measurement::{MeasurementBody, MeasurementRef, StorageTier};
use crate::query::{
    telemetry as query_telemetry, AggregationPage, AggregationRequest, AggregationRow, Aggregator,
    DataIssue, PageCursor, QueryPlan, QueryPlanner,
};
use crate::relational::{MeasurementStore, RelationalReader};
use crate::retrieval::{telemetry as retrieval_telemetry, Location, StorageLocator, TieredReader};
use crate::{Error, Result};

use futures::future::try_join_all;
use object_store::ObjectStore;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

/// Result of one aggregation request.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationResponse {
    pub rows: Vec<AggregationRow>,
    pub next_cursor: Option<PageCursor>,
    pub freshness: FreshnessWindow,
    /// Counters that had to be capped; non-empty means degraded
    pub issues: Vec<DataIssue>,
    pub plan: QueryPlan,
}

impl AggregationResponse {
    pub fn is_degraded(&self) -> bool {
        !self.issues.is_empty()
    }
}

/// Aggregation and retrieval engine
#[derive(Debug, Clone)]
pub struct Engine {
    locator: StorageLocator,
    reader: TieredReader,
    planner: QueryPlanner,
    aggregator: Aggregator,
    freshness: FreshnessCalculator,
    request_timeout: Duration,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        object_store: Arc<dyn ObjectStore>,
        store: Arc<dyn MeasurementStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let relational = RelationalReader::new(store);
        let archive = ArchiveReader::new(object_store, config.archive.clone());
        Self {
            locator: StorageLocator::new(config.cutover, relational.clone(), &config.archive.prefix),
            reader: TieredReader::new(relational.clone(), archive),
            planner: QueryPlanner::new(config.planner.clone()),
            aggregator: Aggregator::new(relational, config.aggregate_fetch_size),
            freshness: FreshnessCalculator::new(config.freshness.clone(), clock),
            request_timeout: config.request_timeout,
        }
    }

    pub fn freshness(&self) -> &FreshnessCalculator {
        &self.freshness
    }

    /// Resolve a reference to its tier and fetch the body.
    pub async fn locate_and_fetch(
        &self,
        reference: &MeasurementRef,
    ) -> Result<(MeasurementBody, FreshnessWindow)> {
        let started = Instant::now();
        let span = info_span!(
            "engine.locate_and_fetch",
            report_id = %reference.report_id,
            input = reference.input.as_deref().unwrap_or("")
        );

        let result = tokio::time::timeout(self.request_timeout, async {
            let location = self.locator.locate(reference).await?;
            let body = self.reader.read(&location).await?;
            Ok::<_, Error>(body)
        })
        .instrument(span)
        .await
        .unwrap_or(Err(Error::QueryTimeout {
            operation: "locate_and_fetch",
            timeout: self.request_timeout,
        }));

        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(body) => {
                retrieval_telemetry::record_fetch(Some(body.tier), "success", None, elapsed);
                let window = self
                    .freshness
                    .for_measurement(body.reference.measurement_start_time, body.tier);
                Ok((body, window))
            }
            Err(error) => {
                let tier = match &error {
                    Error::NotFound { tier, .. } => Some(*tier),
                    _ => None,
                };
                retrieval_telemetry::record_fetch(tier, "error", Some(error.class()), elapsed);
                Err(error)
            }
        }
    }

    /// Fetch several measurements; relational and archive members are read
    /// concurrently and any failure fails the batch.
    ///
    /// References naming the same measurement are fetched once. Output
    /// follows the order of first appearance.
    pub async fn fetch_batch(
        &self,
        references: &[MeasurementRef],
    ) -> Result<Vec<(MeasurementBody, FreshnessWindow)>> {
        let span = info_span!("engine.fetch_batch", requested = references.len());

        let mut seen = HashSet::new();
        let unique: Vec<&MeasurementRef> = references
            .iter()
            .filter(|reference| seen.insert((*reference).identity()))
            .collect();

        let work = async {
            let locations =
                try_join_all(unique.iter().map(|reference| self.locator.locate(reference))).await?;

            let (relational, archive): (Vec<_>, Vec<_>) = locations
                .into_iter()
                .enumerate()
                .partition(|(_, location)| location.tier() == StorageTier::Relational);

            let read_all = |members: Vec<(usize, Location)>| async move {
                try_join_all(members.into_iter().map(|(position, location)| async move {
                    let body = self.reader.read(&location).await?;
                    Ok::<_, Error>((position, body))
                }))
                .await
            };

            let (relational, archive) = tokio::try_join!(read_all(relational), read_all(archive))?;
            Ok::<_, Error>(relational.into_iter().chain(archive).collect::<Vec<_>>())
        };

        let mut fetched = tokio::time::timeout(self.request_timeout, work)
            .instrument(span)
            .await
            .unwrap_or(Err(Error::QueryTimeout {
                operation: "fetch_batch",
                timeout: self.request_timeout,
            }))?;
        fetched.sort_by_key(|(position, _)| *position);

        Ok(fetched
            .into_iter()
            .map(|(_, body)| {
                let window = self
                    .freshness
                    .for_measurement(body.reference.measurement_start_time, body.tier);
                (body, window)
            })
            .collect())
    }

    /// Plan and run an aggregation under the request deadline.
    pub async fn plan_and_aggregate(&self, request: &AggregationRequest) -> Result<AggregationResponse> {
        self.plan_and_aggregate_with_cancel(request, CancellationToken::new())
            .await
    }

    /// As [`Engine::plan_and_aggregate`], also stopping when `cancel` fires.
    ///
    /// Cancellation and the deadline both reach the store as a statement
    /// cancellation.
    pub async fn plan_and_aggregate_with_cancel(
        &self,
        request: &AggregationRequest,
        cancel: CancellationToken,
    ) -> Result<AggregationResponse> {
        let started = Instant::now();
        let span = info_span!(
            "engine.plan_and_aggregate",
            dimensions = request.dimensions.len(),
            filters = request.filters.len()
        );

        let plan = match self.planner.plan(request) {
            Ok(plan) => {
                query_telemetry::record_plan("accepted", None);
                plan
            }
            Err(error) => {
                warn!(error = %error, guidance = ?error.guidance(), "Aggregation request rejected");
                query_telemetry::record_plan("rejected", Some(error.class()));
                return Err(error);
            }
        };

        let result = self.run_with_deadline(&plan, &cancel).instrument(span).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(page) => {
                query_telemetry::record_aggregation(query_telemetry::AggregationMetrics {
                    outcome: if page.issues.is_empty() { "success" } else { "degraded" },
                    error_class: None,
                    duration_seconds: elapsed,
                    rows_returned: page.rows.len() as u64,
                    store_pages: page.store_pages,
                    merged_duplicates: page.merged_duplicates,
                    data_issues: page.issues.len() as u64,
                });
                let freshness = self
                    .freshness
                    .compute(Some(&plan.time_range), StorageTier::Relational);
                Ok(AggregationResponse {
                    rows: page.rows,
                    next_cursor: page.next_cursor,
                    freshness,
                    issues: page.issues,
                    plan,
                })
            }
            Err(error) => {
                query_telemetry::record_aggregation(query_telemetry::AggregationMetrics {
                    outcome: "error",
                    error_class: Some(error.class()),
                    duration_seconds: elapsed,
                    rows_returned: 0,
                    store_pages: 0,
                    merged_duplicates: 0,
                    data_issues: 0,
                });
                Err(error)
            }
        }
    }

    async fn run_with_deadline(
        &self,
        plan: &QueryPlan,
        cancel: &CancellationToken,
    ) -> Result<AggregationPage> {
        let token = cancel.child_token();
        let run = self.aggregator.run(plan, &token);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(self.request_timeout) => {
                token.cancel();
                // Let the store observe the cancellation before giving up
                let _ = run.await;
                Err(Error::QueryTimeout {
                    operation: "plan_and_aggregate",
                    timeout: self.request_timeout,
                })
            }
        }
    }
}
