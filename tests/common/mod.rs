//! Shared fixtures for engine integration tests
//!
//! A [`Fixture`] wires an [`Engine`] to an in-memory relational store, an
//! archive object store and a pinned clock, and offers helpers to seed both
//! tiers.

#![allow(dead_code)]

use measurement_engine::archive::{ArchiveLocator, ContainerBuilder, EncodedContainer};
use measurement_engine::clock::ManualClock;
use measurement_engine::config::EngineConfig;
use measurement_engine::engine::Engine;
use measurement_engine::measurement::{FormatVersion, MeasurementRef};
use measurement_engine::relational::{LocalMeasurementStore, MeasurementRecord};

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use std::sync::Arc;

/// Instant every fixture clock is pinned to.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap()
}

pub fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

/// Report id in the current format for a report started at `started`.
pub fn report_id(started: DateTime<Utc>, cc: &str, asn: u32, suffix: &str) -> String {
    format!(
        "{}_webconnectivity_{}_{}_n1_{}",
        started.format("%Y%m%dT%H%M%SZ"),
        cc,
        asn,
        suffix
    )
}

/// A relational row with no input and all flags cleared.
pub fn record(started: DateTime<Utc>, cc: &str, asn: u32, suffix: &str) -> MeasurementRecord {
    let report_id = report_id(started, cc, asn, suffix);
    MeasurementRecord {
        raw_bytes: Bytes::from(format!("{{\"report_id\":\"{}\"}}", report_id)),
        report_id,
        input: String::new(),
        measurement_start_time: started,
        probe_cc: cc.to_string(),
        probe_asn: asn,
        test_name: "web_connectivity".to_string(),
        category_code: None,
        domain: None,
        anomaly: false,
        confirmed: false,
        failure: false,
        format_version: FormatVersion::Current,
    }
}

pub struct Fixture {
    pub engine: Engine,
    pub store: Arc<LocalMeasurementStore>,
    pub archive: Arc<dyn ObjectStore>,
    pub clock: Arc<ManualClock>,
    pub config: EngineConfig,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = LocalMeasurementStore::new(config.relational.clone());
        Self::build(config, store, Arc::new(InMemory::new()))
    }

    pub fn build(
        config: EngineConfig,
        store: LocalMeasurementStore,
        archive: Arc<dyn ObjectStore>,
    ) -> Self {
        let store = Arc::new(store);
        let clock = Arc::new(ManualClock::new(now()));
        let engine = Engine::new(&config, archive.clone(), store.clone(), clock.clone());
        Self {
            engine,
            store,
            archive,
            clock,
            config,
        }
    }

    /// Container path a reference resolves to under this fixture's prefix.
    pub fn container_path(&self, reference: &MeasurementRef) -> String {
        ArchiveLocator::for_ref(reference, &self.config.archive.prefix)
            .unwrap()
            .container_path
    }

    /// Encode `members` into one container and upload it where the first
    /// member resolves to.
    pub async fn put_container(
        &self,
        members: &[(MeasurementRef, &str)],
        records_per_frame: usize,
    ) -> EncodedContainer {
        let mut builder = ContainerBuilder::new(records_per_frame);
        for (reference, body) in members {
            builder.add(reference, FormatVersion::Legacy, body.to_string());
        }
        let encoded = builder.finish().unwrap();
        self.put_bytes(&members[0].0, encoded.bytes.clone()).await;
        encoded
    }

    pub async fn put_bytes(&self, reference: &MeasurementRef, bytes: Bytes) {
        let path = Path::from(self.container_path(reference));
        self.archive.put(&path, bytes.into()).await.unwrap();
    }
}

/// References to `count` archived measurements of one report, sharing a
/// container.
pub fn archived_refs(started: DateTime<Utc>, count: usize) -> Vec<MeasurementRef> {
    let report = report_id(started, "IT", 30722, "archived");
    (0..count)
        .map(|i| MeasurementRef::new(report.clone()).with_input(format!("https://site{:03}.example/", i)))
        .collect()
}

/// Body stored for the `i`th archived measurement.
pub fn archived_body(i: usize) -> String {
    format!("{{\"test_keys\":{{\"n\":{},\"blocking\":false}}}}", i)
}
