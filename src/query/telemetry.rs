//! Aggregation-path telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct QueryInstruments {
    plan_outcomes: Counter<u64>,
    aggregate_requests: Counter<u64>,
    aggregate_duration_seconds: Histogram<f64>,
    rows_returned: Histogram<u64>,
    store_pages: Histogram<u64>,
    merged_duplicates: Counter<u64>,
    data_issues: Counter<u64>,
}

fn instruments() -> &'static QueryInstruments {
    static INSTRUMENTS: OnceLock<QueryInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("measurement_engine.query");
        QueryInstruments {
            plan_outcomes: meter
                .u64_counter("measurement_engine.query.plan.outcomes")
                .with_description("Planner decisions by outcome and rejection class")
                .init(),
            aggregate_requests: meter
                .u64_counter("measurement_engine.query.requests")
                .with_description("Aggregation requests by outcome")
                .init(),
            aggregate_duration_seconds: meter
                .f64_histogram("measurement_engine.query.duration")
                .with_description("Aggregation end-to-end latency")
                .with_unit("s")
                .init(),
            rows_returned: meter
                .u64_histogram("measurement_engine.query.rows_returned")
                .with_description("Rows returned per aggregation page")
                .init(),
            store_pages: meter
                .u64_histogram("measurement_engine.query.store_pages")
                .with_description("Relational statements issued per aggregation page")
                .init(),
            merged_duplicates: meter
                .u64_counter("measurement_engine.query.merged_duplicates")
                .with_description("Store rows merged into an existing group")
                .init(),
            data_issues: meter
                .u64_counter("measurement_engine.query.data_issues")
                .with_description("Counters capped because they exceeded measurement_count")
                .init(),
        }
    })
}

pub fn record_plan(outcome: &'static str, error_class: Option<&'static str>) {
    let mut attrs = vec![KeyValue::new("outcome", outcome)];
    if let Some(error_class) = error_class {
        attrs.push(KeyValue::new("error.class", error_class));
    }
    instruments().plan_outcomes.add(1, &attrs);
}

pub struct AggregationMetrics {
    pub outcome: &'static str,
    pub error_class: Option<&'static str>,
    pub duration_seconds: f64,
    pub rows_returned: u64,
    pub store_pages: u64,
    pub merged_duplicates: u64,
    pub data_issues: u64,
}

pub fn record_aggregation(metrics: AggregationMetrics) {
    let i = instruments();
    let mut attrs = vec![KeyValue::new("outcome", metrics.outcome)];
    if let Some(error_class) = metrics.error_class {
        attrs.push(KeyValue::new("error.class", error_class));
    }

    i.aggregate_requests.add(1, &attrs);
    i.aggregate_duration_seconds
        .record(metrics.duration_seconds, &attrs);
    i.rows_returned.record(metrics.rows_returned, &attrs);
    i.store_pages.record(metrics.store_pages, &attrs);
    if metrics.merged_duplicates > 0 {
        i.merged_duplicates.add(metrics.merged_duplicates, &[]);
    }
    if metrics.data_issues > 0 {
        i.data_issues.add(metrics.data_issues, &[]);
    }
}
