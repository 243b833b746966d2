//! Archive reads through the object store

use super::container::{open_scanner, ArchiveRecord};
use super::{ArchiveConfig, ArchiveLocator};
use crate::measurement::{MeasurementBody, MeasurementRef, StorageTier};
use crate::retrieval::telemetry;
use crate::{Error, Result};

use futures::TryStreamExt;
use object_store::{path::Path, GetOptions, GetRange, ObjectStore};
use std::io::Read;
use std::sync::Arc;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, warn};

/// Outcome of scanning one container
struct ScanOutcome {
    record: Option<ArchiveRecord>,
    scanned: u64,
}

/// Fetches single records from archive containers.
#[derive(Debug, Clone)]
pub struct ArchiveReader {
    store: Arc<dyn ObjectStore>,
    config: ArchiveConfig,
}

impl ArchiveReader {
    pub fn new(store: Arc<dyn ObjectStore>, config: ArchiveConfig) -> Self {
        Self { store, config }
    }

    /// Fetch the record `locator` points at.
    ///
    /// An offset hint that does not lead to the record falls back to a scan
    /// from the start of the container.
    pub async fn fetch(
        &self,
        reference: &MeasurementRef,
        locator: &ArchiveLocator,
    ) -> Result<MeasurementBody> {
        let path = Path::from(locator.container_path.as_str());

        if let Some(offset) = locator.offset_hint {
            match self.scan(reference, &path, &locator.index_key, Some(offset)).await {
                Ok(ScanOutcome {
                    record: Some(record),
                    ..
                }) => return self.body(reference, locator, record),
                Ok(_) => warn!(
                    container = %locator.container_path,
                    offset,
                    "Offset hint did not lead to the record, rescanning container"
                ),
                Err(e @ Error::NotFound { .. }) => return Err(e),
                Err(e) => warn!(
                    container = %locator.container_path,
                    offset,
                    error = %e,
                    "Ranged archive read failed, rescanning container"
                ),
            }
        }

        let outcome = self
            .scan(reference, &path, &locator.index_key, None)
            .await?;
        match outcome.record {
            Some(record) => self.body(reference, locator, record),
            None => Err(reference.not_found(StorageTier::Archive)),
        }
    }

    fn body(
        &self,
        reference: &MeasurementRef,
        locator: &ArchiveLocator,
        record: ArchiveRecord,
    ) -> Result<MeasurementBody> {
        let format_version = record.format_version;
        let raw_bytes = record.into_body().map_err(|detail| Error::CorruptArchive {
            container: locator.container_path.clone(),
            detail,
        })?;
        Ok(MeasurementBody {
            reference: reference.clone(),
            raw_bytes,
            format_version,
            tier: StorageTier::Archive,
        })
    }

    async fn scan(
        &self,
        reference: &MeasurementRef,
        path: &Path,
        index_key: &str,
        offset: Option<u64>,
    ) -> Result<ScanOutcome> {
        let options = GetOptions {
            range: offset.map(|o| GetRange::Offset(o as usize)),
            ..Default::default()
        };
        let result = self
            .store
            .get_opts(path, options)
            .await
            .map_err(|e| match e {
                object_store::Error::NotFound { .. } => reference.not_found(StorageTier::Archive),
                other => Error::ObjectStore(other),
            })?;

        let length = result.range.end.saturating_sub(result.range.start);
        let container = path.to_string();
        let key = index_key.to_string();
        let streamed = length > self.config.buffer_threshold_bytes;

        debug!(
            container = %container,
            length,
            offset = offset.unwrap_or(0),
            streamed,
            "Scanning archive container"
        );

        let outcome = if streamed {
            let stream = result
                .into_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
            let reader = SyncIoBridge::new(StreamReader::new(stream));
            scan_blocking(reader, container, key).await?
        } else {
            let bytes = result.bytes().await?;
            scan_blocking(std::io::Cursor::new(bytes), container, key).await?
        };

        telemetry::record_archive_scan(outcome.scanned, streamed);
        Ok(outcome)
    }
}

/// Decompress and scan on the blocking pool; only the current line is held
/// in memory besides the decoder window.
async fn scan_blocking<R>(reader: R, container: String, key: String) -> Result<ScanOutcome>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut scanner = open_scanner(reader, &container)?;
        let record = scanner.find(&key)?;
        Ok(ScanOutcome {
            record,
            scanned: scanner.scanned(),
        })
    })
    .await
    .map_err(|e| Error::Internal(format!("archive scan task failed: {}", e)))?
}
