//! Immutable measurement archive
//!
//! Historical measurements live in compressed containers, one per day,
//! country and network, addressed through the object store:
//!
//! ```text
//! <prefix>/2019-03-12/IT/AS30722.jsonl.zst
//! ```
//!
//! Containers never change once written. Reading one record means locating
//! its container, decompressing it as a stream and scanning sorted records
//! until the key is found or passed.

mod container;
mod locator;
mod reader;

pub use container::{
    open_scanner, ArchiveRecord, ContainerBuilder, EncodedContainer, RecordScanner, ZstdScanner,
};
pub use locator::ArchiveLocator;
pub use reader::ArchiveReader;

/// Archive settings
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Path prefix of every container
    pub prefix: String,
    /// Containers up to this size are fetched whole; larger ones stream
    pub buffer_threshold_bytes: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            prefix: "raw".to_string(),
            buffer_threshold_bytes: 8 * 1024 * 1024, // 8MB
        }
    }
}
