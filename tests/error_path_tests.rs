//! Tests for error paths and edge cases
//!
//! Rejections must happen before any I/O, and every storage failure must
//! surface as its own error class rather than a generic failure.

mod common;

use common::{archived_refs, record, ts, Fixture};
use measurement_engine::config::EngineConfig;
use measurement_engine::measurement::{MeasurementRef, StorageTier};
use measurement_engine::query::{
    AggregationRequest, Dimension, DimensionValue, Filter, PageCursor, TimeRange,
};
use measurement_engine::relational::{LocalMeasurementStore, RelationalConfig};
use measurement_engine::{Error, ErrorCategory};

use object_store::memory::InMemory;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn january() -> TimeRange {
    TimeRange::new(ts(2021, 1, 1, 0), ts(2021, 2, 1, 0))
}

fn slow_fixture(relational: RelationalConfig, delay: Duration, config: EngineConfig) -> Fixture {
    let store = LocalMeasurementStore::new(relational).with_statement_delay(delay);
    Fixture::build(config, store, Arc::new(InMemory::new()))
}

// =========================================================================
// Planner rejections
// =========================================================================

#[tokio::test]
async fn test_range_too_wide_rejected_before_io() {
    let fixture = Fixture::new();
    let range = TimeRange::new(ts(2020, 1, 1, 0), ts(2021, 2, 5, 0));

    let err = fixture
        .engine
        .plan_and_aggregate(&AggregationRequest::new(vec![Dimension::Country], range))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RangeTooWide { .. }), "{err}");
    assert_eq!(err.http_status(), 400);
    assert!(err.guidance().is_some());
    assert_eq!(fixture.store.call_counts().total(), 0);
}

#[tokio::test]
async fn test_too_many_dimensions_rejected_before_io() {
    let mut config = EngineConfig::default();
    config.planner.max_dimensions = 4;
    let fixture = Fixture::with_config(config);

    let dimensions = vec![
        Dimension::Country,
        Dimension::Asn,
        Dimension::TestName,
        Dimension::CategoryCode,
        Dimension::TimeBucket,
        Dimension::Country,
    ];
    let err = fixture
        .engine
        .plan_and_aggregate(&AggregationRequest::new(dimensions, january()))
        .await
        .unwrap_err();

    match err {
        Error::TooManyDimensions { requested, max } => {
            assert_eq!(requested.len(), 6);
            assert_eq!(max, 4);
        }
        other => panic!("expected TooManyDimensions, got {other}"),
    }
    assert_eq!(fixture.store.call_counts().total(), 0);
}

#[tokio::test]
async fn test_duplicate_dimension_is_invalid() {
    let fixture = Fixture::new();
    let err = fixture
        .engine
        .plan_and_aggregate(&AggregationRequest::new(
            vec![Dimension::Country, Dimension::Country],
            january(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)), "{err}");
}

#[tokio::test]
async fn test_estimate_too_large_unless_filtered() {
    let fixture = Fixture::new();
    let dimensions = vec![Dimension::Country, Dimension::Asn];

    let err = fixture
        .engine
        .plan_and_aggregate(&AggregationRequest::new(dimensions.clone(), january()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EstimateTooLarge { .. }), "{err}");
    assert_eq!(err.category(), ErrorCategory::Rejected);
    assert_eq!(fixture.store.call_counts().total(), 0);

    // Pinning the country brings the estimate down to the ASN count
    let request =
        AggregationRequest::new(dimensions, january()).with_filter(Filter::country("IT"));
    let response = fixture.engine.plan_and_aggregate(&request).await.unwrap();
    assert!(response.rows.is_empty());
    assert_eq!(fixture.store.call_counts().aggregates, 1);
}

#[tokio::test]
async fn test_cursor_shape_must_match_dimensions() {
    let fixture = Fixture::new();
    let request = AggregationRequest::new(vec![Dimension::Country], january()).with_cursor(
        PageCursor(vec![DimensionValue::text("IT"), DimensionValue::Number(1)]),
    );

    let err = fixture.engine.plan_and_aggregate(&request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)), "{err}");
}

// =========================================================================
// Reference and archive failures
// =========================================================================

#[tokio::test]
async fn test_malformed_reference_rejected_before_io() {
    let fixture = Fixture::new();

    let err = fixture
        .engine
        .locate_and_fetch(&MeasurementRef::new("not-a-report-id"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidReference { .. }), "{err}");
    assert_eq!(err.http_status(), 400);
    assert_eq!(fixture.store.call_counts().total(), 0);
}

#[tokio::test]
async fn test_missing_container_is_not_found() {
    let fixture = Fixture::new();
    let reference = archived_refs(ts(2019, 3, 12, 10), 1).remove(0);

    let err = fixture.engine.locate_and_fetch(&reference).await.unwrap_err();
    assert!(
        matches!(
            err,
            Error::NotFound {
                tier: StorageTier::Archive,
                ..
            }
        ),
        "{err}"
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_truncated_container_is_corrupt() {
    let fixture = Fixture::new();
    let refs = archived_refs(ts(2019, 3, 12, 10), 50);
    let bodies: Vec<String> = (0..50).map(common::archived_body).collect();
    let members: Vec<(MeasurementRef, &str)> = refs
        .iter()
        .cloned()
        .zip(bodies.iter().map(String::as_str))
        .collect();

    let encoded = fixture.put_container(&members, 100).await;
    let truncated = encoded.bytes.slice(..encoded.bytes.len() / 2);
    fixture.put_bytes(&refs[0], truncated).await;

    let err = fixture.engine.locate_and_fetch(&refs[49]).await.unwrap_err();
    assert!(matches!(err, Error::CorruptArchive { .. }), "{err}");
    assert_eq!(err.category(), ErrorCategory::Integrity);
    assert_eq!(err.http_status(), 500);
}

// =========================================================================
// Relational limits, deadlines and cancellation
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_pool_exhaustion_is_reported() {
    let relational = RelationalConfig {
        max_connections: 1,
        acquire_timeout: Duration::from_millis(50),
        statement_timeout: Duration::from_secs(30),
    };
    let config = EngineConfig {
        relational: relational.clone(),
        ..EngineConfig::default()
    };
    let fixture = slow_fixture(relational, Duration::from_millis(500), config);
    let a = record(ts(2021, 3, 1, 0), "IT", 30722, "a");
    let b = record(ts(2021, 3, 1, 1), "IT", 30722, "b");
    fixture.store.insert(a.clone());
    fixture.store.insert(b.clone());

    let (first, second) = (a.reference(), b.reference());
    let (ra, rb) = tokio::join!(
        fixture.engine.locate_and_fetch(&first),
        fixture.engine.locate_and_fetch(&second),
    );

    let errors: Vec<Error> = [ra, rb].into_iter().filter_map(|r| r.err()).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::PoolExhausted { .. }), "{}", errors[0]);
    assert!(errors[0].is_retryable());
    assert_eq!(errors[0].http_status(), 503);
}

#[tokio::test(start_paused = true)]
async fn test_statement_timeout_surfaces_as_query_timeout() {
    let relational = RelationalConfig {
        statement_timeout: Duration::from_millis(100),
        ..RelationalConfig::default()
    };
    let fixture = slow_fixture(relational, Duration::from_secs(5), EngineConfig::default());
    let row = record(ts(2021, 3, 1, 0), "IT", 30722, "slow");
    fixture.store.insert(row.clone());

    let err = fixture
        .engine
        .locate_and_fetch(&row.reference())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueryTimeout { .. }), "{err}");
    assert!(err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn test_request_deadline_cancels_running_statement() {
    let config = EngineConfig {
        request_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    };
    let fixture = slow_fixture(
        RelationalConfig::default(),
        Duration::from_secs(10),
        config,
    );

    let err = fixture
        .engine
        .plan_and_aggregate(&AggregationRequest::new(vec![Dimension::Country], january()))
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            Error::QueryTimeout {
                operation: "plan_and_aggregate",
                ..
            }
        ),
        "{err}"
    );
    let counts = fixture.store.call_counts();
    assert_eq!(counts.aggregates, 1);
    assert_eq!(counts.cancellations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_cancellation_stops_aggregation() {
    let fixture = slow_fixture(
        RelationalConfig::default(),
        Duration::from_secs(10),
        EngineConfig::default(),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = fixture
        .engine
        .plan_and_aggregate_with_cancel(
            &AggregationRequest::new(vec![Dimension::Country], january()),
            cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled { .. }), "{err}");
    assert_eq!(fixture.store.call_counts().cancellations, 1);
}

#[tokio::test]
async fn test_already_cancelled_request_issues_no_statement() {
    let fixture = Fixture::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fixture
        .engine
        .plan_and_aggregate_with_cancel(
            &AggregationRequest::new(vec![Dimension::Country], january()),
            cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }), "{err}");
    assert_eq!(fixture.store.call_counts().aggregates, 0);
}
