//! Single-measurement retrieval across the relational tier and the archive

mod common;

use common::{archived_body, archived_refs, now, record, ts, Fixture};
use measurement_engine::config::EngineConfig;
use measurement_engine::measurement::{FormatVersion, MeasurementRef, StorageTier};
use measurement_engine::relational::LocalMeasurementStore;
use measurement_engine::Error;

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use std::sync::Arc;
use tempfile::tempdir;

fn archived_date() -> chrono::DateTime<chrono::Utc> {
    ts(2019, 3, 12, 10)
}

/// Uploads one container holding `count` archived measurements.
async fn seed_archive(
    fixture: &Fixture,
    count: usize,
    records_per_frame: usize,
) -> (Vec<MeasurementRef>, measurement_engine::archive::EncodedContainer) {
    let refs = archived_refs(archived_date(), count);
    let bodies: Vec<String> = (0..count).map(archived_body).collect();
    let members: Vec<(MeasurementRef, &str)> = refs
        .iter()
        .cloned()
        .zip(bodies.iter().map(String::as_str))
        .collect();
    let encoded = fixture.put_container(&members, records_per_frame).await;
    (refs, encoded)
}

#[tokio::test]
async fn test_recent_start_time_reads_relational_without_probe() {
    let fixture = Fixture::new();
    let row = record(ts(2021, 1, 10, 8), "IT", 30722, "recent");
    fixture.store.insert(row.clone());

    let reference = row.reference();
    let (body, window) = fixture.engine.locate_and_fetch(&reference).await.unwrap();

    assert_eq!(body.tier, StorageTier::Relational);
    assert_eq!(body.raw_bytes, row.raw_bytes);
    assert_eq!(body.format_version, FormatVersion::Current);
    // Started months before the pinned clock
    assert!(window.is_sealed);

    let counts = fixture.store.call_counts();
    assert_eq!(counts.probes, 0);
    assert_eq!(counts.fetches, 1);
}

#[tokio::test]
async fn test_unknown_start_time_probes_once() {
    let fixture = Fixture::new();
    let row = record(now() - chrono::Duration::hours(2), "DE", 3320, "fresh");
    fixture.store.insert(row.clone());

    let reference = MeasurementRef::new(row.report_id.clone());
    let (body, window) = fixture.engine.locate_and_fetch(&reference).await.unwrap();

    assert_eq!(body.tier, StorageTier::Relational);
    // The stored start time is filled in
    assert_eq!(
        body.reference.measurement_start_time,
        Some(row.measurement_start_time)
    );
    assert!(!window.is_sealed);
    assert_eq!(fixture.store.call_counts().probes, 1);
}

#[tokio::test]
async fn test_pre_cutover_measurement_reads_archive_without_probe() {
    let fixture = Fixture::new();
    let (refs, _) = seed_archive(&fixture, 20, 4).await;

    let reference = refs[11].clone().with_start_time(archived_date());
    let (body, window) = fixture.engine.locate_and_fetch(&reference).await.unwrap();

    assert_eq!(body.tier, StorageTier::Archive);
    assert_eq!(body.format_version, FormatVersion::Legacy);
    assert_eq!(body.raw_bytes, Bytes::from(archived_body(11)));
    assert_eq!(body.reference, reference);
    assert!(window.is_sealed);
    assert_eq!(fixture.store.call_counts().total(), 0);
}

#[tokio::test]
async fn test_unindexed_archive_fetch_is_idempotent() {
    let fixture = Fixture::new();
    let (refs, _) = seed_archive(&fixture, 20, 4).await;

    let first = fixture.engine.locate_and_fetch(&refs[5]).await.unwrap();
    let second = fixture.engine.locate_and_fetch(&refs[5]).await.unwrap();

    assert_eq!(first.0, second.0);
    assert_eq!(first.0.raw_bytes, Bytes::from(archived_body(5)));
    assert_eq!(fixture.store.call_counts().probes, 2);
}

#[tokio::test]
async fn test_offset_hint_and_stale_hint_both_find_record() {
    let fixture = Fixture::new();
    let (refs, encoded) = seed_archive(&fixture, 20, 4).await;

    let hinted = &refs[13];
    let offset = encoded.frame_offset(&hinted.index_key()).unwrap();
    assert!(offset > 0);
    fixture.store.index_archived(hinted, offset);

    let (body, _) = fixture.engine.locate_and_fetch(hinted).await.unwrap();
    assert_eq!(body.raw_bytes, Bytes::from(archived_body(13)));

    // A hint pointing past the record falls back to a full scan
    let stale = &refs[2];
    let later = encoded.frame_offset(&refs[17].index_key()).unwrap();
    fixture.store.index_archived(stale, later);

    let (body, _) = fixture.engine.locate_and_fetch(stale).await.unwrap();
    assert_eq!(body.raw_bytes, Bytes::from(archived_body(2)));
}

#[tokio::test]
async fn test_fetch_batch_keeps_order_and_drops_duplicates() {
    let fixture = Fixture::new();
    let (refs, _) = seed_archive(&fixture, 6, 2).await;
    let first = record(ts(2021, 2, 1, 9), "IT", 30722, "first");
    let second = record(ts(2021, 2, 2, 9), "US", 7922, "second");
    fixture.store.insert(first.clone());
    fixture.store.insert(second.clone());

    let batch = vec![
        first.reference(),
        refs[4].clone().with_start_time(archived_date()),
        second.reference(),
        first.reference(),
        refs[1].clone(),
    ];
    let results = fixture.engine.fetch_batch(&batch).await.unwrap();

    let got: Vec<(&str, StorageTier)> = results
        .iter()
        .map(|(body, _)| (body.reference.report_id.as_str(), body.tier))
        .collect();
    assert_eq!(
        got,
        vec![
            (first.report_id.as_str(), StorageTier::Relational),
            (refs[4].report_id.as_str(), StorageTier::Archive),
            (second.report_id.as_str(), StorageTier::Relational),
            (refs[1].report_id.as_str(), StorageTier::Archive),
        ]
    );
    assert_eq!(results[1].0.raw_bytes, Bytes::from(archived_body(4)));
    assert_eq!(results[3].0.raw_bytes, Bytes::from(archived_body(1)));
    assert!(results.iter().all(|(_, window)| window.is_sealed));
}

#[tokio::test]
async fn test_fetch_batch_fails_when_any_member_fails() {
    let fixture = Fixture::new();
    let row = record(ts(2021, 2, 1, 9), "IT", 30722, "present");
    fixture.store.insert(row.clone());
    let missing = record(ts(2021, 2, 1, 10), "IT", 30722, "absent");

    let err = fixture
        .engine
        .fetch_batch(&[row.reference(), missing.reference()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::NotFound {
            tier: StorageTier::Relational,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_containers_are_streamed() {
    let mut config = EngineConfig::default();
    config.archive.buffer_threshold_bytes = 16;
    let fixture = Fixture::with_config(config);
    let (refs, encoded) = seed_archive(&fixture, 200, 16).await;
    assert!(encoded.bytes.len() > 16);

    for i in [0, 99, 199] {
        let (body, _) = fixture.engine.locate_and_fetch(&refs[i]).await.unwrap();
        assert_eq!(body.raw_bytes, Bytes::from(archived_body(i)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_archive_on_local_filesystem() {
    let dir = tempdir().unwrap();
    let archive = Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
    let fixture = Fixture::build(
        EngineConfig::default(),
        LocalMeasurementStore::default(),
        archive,
    );
    let (refs, _) = seed_archive(&fixture, 10, 3).await;

    let on_disk = dir.path().join(fixture.container_path(&refs[0]));
    assert!(on_disk.exists(), "{}", on_disk.display());

    let (body, window) = fixture.engine.locate_and_fetch(&refs[7]).await.unwrap();
    assert_eq!(body.raw_bytes, Bytes::from(archived_body(7)));
    assert!(window.is_sealed);
}

#[tokio::test]
async fn test_legacy_report_ids_resolve_to_unknown_country_container() {
    let fixture = Fixture::new();
    let reference = MeasurementRef::new("20170707T051545Z_AS44244_ujwFYcBJXcL2MjZnHXhBqVEOG2");
    assert_eq!(
        fixture.container_path(&reference),
        "raw/2017-07-07/ZZ/AS44244.jsonl.zst"
    );

    fixture
        .put_container(&[(reference.clone(), "{\"legacy\":true}")], 1)
        .await;
    let (body, _) = fixture.engine.locate_and_fetch(&reference).await.unwrap();
    assert_eq!(body.tier, StorageTier::Archive);
    assert_eq!(body.raw_bytes, Bytes::from_static(b"{\"legacy\":true}"));
}

#[tokio::test]
async fn test_record_absent_from_container_is_not_found() {
    let fixture = Fixture::new();
    let (refs, _) = seed_archive(&fixture, 5, 2).await;
    let absent = MeasurementRef::new(refs[0].report_id.clone()).with_input("https://zzz.example/");

    let err = fixture.engine.locate_and_fetch(&absent).await.unwrap_err();
    assert!(matches!(
        err,
        Error::NotFound {
            tier: StorageTier::Archive,
            ..
        }
    ));
    assert_eq!(err.http_status(), 404);
}

#[tokio::test]
async fn test_missing_post_cutover_measurement_is_not_found_in_relational_tier() {
    let fixture = Fixture::new();
    // Just after the cutover, inside the old probe margin
    let absent = record(ts(2020, 10, 20, 1), "IT", 30722, "x");

    let err = fixture
        .engine
        .locate_and_fetch(&absent.reference())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::NotFound {
                tier: StorageTier::Relational,
                ..
            }
        ),
        "{err}"
    );
    let counts = fixture.store.call_counts();
    assert_eq!(counts.probes, 0);
    assert_eq!(counts.fetches, 1);
}
