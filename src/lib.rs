//! # measurement-engine
//!
//! Aggregation and retrieval engine over a corpus of network measurements.
//!
//! Measurements live in two tiers: a relational store holding recent,
//! indexed records, and an immutable archive of compressed containers
//! holding history. The engine answers two kinds of requests:
//!
//! - **Retrieval**: fetch one measurement body by report id and input,
//!   from whichever tier holds it
//! - **Aggregation**: grouped counts (measurements, anomalies, confirmed
//!   blocks, failures) over a bounded combination of dimensions and time
//!
//! Every response carries a freshness window telling a fronting cache how
//! long it stays valid.
//!
//! ## Architecture
//!
//! - **Storage Locator**: routes a reference to a tier, probing at most once
//! - **Archive Reader**: streams and scans sorted zstd containers
//! - **Relational Reader**: bounded-timeout statements through a pool
//! - **Query Planner**: validates and cost-bounds requests before any I/O
//! - **Aggregator**: keyset-paged grouped counts, merged by dimension tuple
//! - **Freshness Calculator**: sealed or short-lived validity windows

pub mod archive;
pub mod clock;
pub mod config;
pub mod engine;
pub mod freshness;
pub mod measurement;
pub mod query;
pub mod relational;
pub mod retrieval;
pub mod telemetry;

mod error;

pub use error::{Error, ErrorCategory, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{ComponentFactory, EngineConfig};
    pub use crate::engine::{AggregationResponse, Engine};
    pub use crate::freshness::{FreshnessPolicy, FreshnessWindow};
    pub use crate::measurement::{MeasurementBody, MeasurementRef, StorageTier};
    pub use crate::query::{
        AggregationRequest, AggregationRow, BucketGranularity, Dimension, DimensionValue, Filter,
        TimeRange,
    };
    pub use crate::{Error, ErrorCategory, Result};
}
