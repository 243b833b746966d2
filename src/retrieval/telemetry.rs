//! Retrieval-path telemetry instruments and recording helpers.

use crate::measurement::StorageTier;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct RetrievalInstruments {
    routing_decisions: Counter<u64>,
    fetch_requests: Counter<u64>,
    fetch_duration_seconds: Histogram<f64>,
    archive_records_scanned: Histogram<u64>,
}

fn instruments() -> &'static RetrievalInstruments {
    static INSTRUMENTS: OnceLock<RetrievalInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("measurement_engine.retrieval");
        RetrievalInstruments {
            routing_decisions: meter
                .u64_counter("measurement_engine.retrieval.routing_decisions")
                .with_description("Storage locator decisions by tier and probe use")
                .init(),
            fetch_requests: meter
                .u64_counter("measurement_engine.retrieval.requests")
                .with_description("Measurement fetches by tier and outcome")
                .init(),
            fetch_duration_seconds: meter
                .f64_histogram("measurement_engine.retrieval.duration")
                .with_description("Measurement fetch latency")
                .with_unit("s")
                .init(),
            archive_records_scanned: meter
                .u64_histogram("measurement_engine.retrieval.archive.records_scanned")
                .with_description("Container records decoded per archive read")
                .init(),
        }
    })
}

pub fn record_routing(tier: StorageTier, probed: bool) {
    instruments().routing_decisions.add(
        1,
        &[
            KeyValue::new("tier", tier.as_str()),
            KeyValue::new("probed", probed),
        ],
    );
}

pub fn record_fetch(
    tier: Option<StorageTier>,
    outcome: &'static str,
    error_class: Option<&'static str>,
    duration_seconds: f64,
) {
    let i = instruments();
    let mut attrs = vec![
        KeyValue::new("tier", tier.map(|t| t.as_str()).unwrap_or("unresolved")),
        KeyValue::new("outcome", outcome),
    ];
    if let Some(error_class) = error_class {
        attrs.push(KeyValue::new("error.class", error_class));
    }
    i.fetch_requests.add(1, &attrs);
    i.fetch_duration_seconds.record(duration_seconds, &attrs);
}

pub fn record_archive_scan(records: u64, streamed: bool) {
    instruments()
        .archive_records_scanned
        .record(records, &[KeyValue::new("streamed", streamed)]);
}
