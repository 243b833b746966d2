//! Engine configuration and environment-based component factory
//!
//! [`EngineConfig`] gathers the tunables of every component. Defaults suit
//! development; `from_env` overrides them from `ENGINE_*` variables.
//! [`ComponentFactory`] builds the object store and relational store the
//! engine reads from, so binaries can switch between in-memory development
//! backends and production ones without code changes.

use crate::archive::ArchiveConfig;
use crate::freshness::FreshnessPolicy;
use crate::query::{BucketGranularity, PlannerLimits};
use crate::relational::{LocalMeasurementStore, MeasurementStore, PgMeasurementStore, RelationalConfig};
use crate::retrieval::CutoverPolicy;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, ObjectStore};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Configuration of the whole engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cutover: CutoverPolicy,
    pub planner: PlannerLimits,
    pub freshness: FreshnessPolicy,
    pub archive: ArchiveConfig,
    pub relational: RelationalConfig,
    /// Group rows requested per relational statement
    pub aggregate_fetch_size: usize,
    /// Deadline for one engine request
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cutover: CutoverPolicy::default(),
            planner: PlannerLimits::default(),
            freshness: FreshnessPolicy::default(),
            archive: ArchiveConfig::default(),
            relational: RelationalConfig::default(),
            aggregate_fetch_size: 5_000,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by environment variables.
    ///
    /// Environment variables:
    /// - ENGINE_CUTOVER: RFC 3339 instant where the relational tier begins
    /// - ENGINE_BOUNDARY_MARGIN_SECS: probe window around the cutover
    /// - ENGINE_MAX_RANGE_DAYS, ENGINE_MAX_DIMENSIONS, ENGINE_ROW_CEILING
    /// - ENGINE_DEFAULT_GRANULARITY: hour, day, week or month
    /// - ENGINE_DEFAULT_PAGE_SIZE, ENGINE_MAX_PAGE_SIZE
    /// - ENGINE_ESTIMATE_COUNTRY, ENGINE_ESTIMATE_ASN,
    ///   ENGINE_ESTIMATE_TEST_NAME, ENGINE_ESTIMATE_CATEGORY_CODE
    /// - ENGINE_SETTLEMENT_DELAY_SECS, ENGINE_SHORT_TTL_SECS, ENGINE_SEALED_TTL_SECS
    /// - ENGINE_ARCHIVE_PREFIX, ENGINE_ARCHIVE_BUFFER_THRESHOLD_BYTES
    /// - ENGINE_POOL_MAX_CONNECTIONS, ENGINE_POOL_ACQUIRE_TIMEOUT_MS,
    ///   ENGINE_STATEMENT_TIMEOUT_MS
    /// - ENGINE_AGGREGATE_FETCH_SIZE, ENGINE_REQUEST_TIMEOUT_MS
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(cutover) = env_parse::<DateTime<Utc>>("ENGINE_CUTOVER")? {
            config.cutover.cutover = cutover;
        }
        if let Some(secs) = env_parse::<i64>("ENGINE_BOUNDARY_MARGIN_SECS")? {
            config.cutover.boundary_margin = chrono::Duration::seconds(secs.max(0));
        }

        let planner = &mut config.planner;
        if let Some(days) = env_parse::<i64>("ENGINE_MAX_RANGE_DAYS")? {
            planner.max_time_span = chrono::Duration::days(days.max(1));
        }
        if let Some(max) = env_parse::<usize>("ENGINE_MAX_DIMENSIONS")? {
            planner.max_dimensions = max;
        }
        if let Some(ceiling) = env_parse::<u64>("ENGINE_ROW_CEILING")? {
            planner.row_ceiling = ceiling.max(1);
        }
        if let Some(granularity) = env_parse::<BucketGranularity>("ENGINE_DEFAULT_GRANULARITY")? {
            planner.default_granularity = granularity;
        }
        if let Some(size) = env_parse::<usize>("ENGINE_DEFAULT_PAGE_SIZE")? {
            planner.default_page_size = size.max(1);
        }
        if let Some(size) = env_parse::<usize>("ENGINE_MAX_PAGE_SIZE")? {
            planner.max_page_size = size.max(1);
        }
        if let Some(n) = env_parse::<u64>("ENGINE_ESTIMATE_COUNTRY")? {
            planner.estimates.country = n;
        }
        if let Some(n) = env_parse::<u64>("ENGINE_ESTIMATE_ASN")? {
            planner.estimates.asn = n;
        }
        if let Some(n) = env_parse::<u64>("ENGINE_ESTIMATE_TEST_NAME")? {
            planner.estimates.test_name = n;
        }
        if let Some(n) = env_parse::<u64>("ENGINE_ESTIMATE_CATEGORY_CODE")? {
            planner.estimates.category_code = n;
        }

        if let Some(secs) = env_parse::<i64>("ENGINE_SETTLEMENT_DELAY_SECS")? {
            config.freshness.settlement_delay = chrono::Duration::seconds(secs.max(0));
        }
        if let Some(secs) = env_parse::<i64>("ENGINE_SHORT_TTL_SECS")? {
            config.freshness.short_ttl = chrono::Duration::seconds(secs.max(0));
        }
        if let Some(secs) = env_parse::<i64>("ENGINE_SEALED_TTL_SECS")? {
            config.freshness.sealed_ttl = chrono::Duration::seconds(secs.max(0));
        }

        if let Ok(prefix) = std::env::var("ENGINE_ARCHIVE_PREFIX") {
            config.archive.prefix = prefix.trim().to_string();
        }
        if let Some(bytes) = env_parse::<usize>("ENGINE_ARCHIVE_BUFFER_THRESHOLD_BYTES")? {
            config.archive.buffer_threshold_bytes = bytes;
        }

        if let Some(n) = env_parse::<u32>("ENGINE_POOL_MAX_CONNECTIONS")? {
            config.relational.max_connections = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("ENGINE_POOL_ACQUIRE_TIMEOUT_MS")? {
            config.relational.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("ENGINE_STATEMENT_TIMEOUT_MS")? {
            config.relational.statement_timeout = Duration::from_millis(ms.max(1));
        }

        if let Some(size) = env_parse::<usize>("ENGINE_AGGREGATE_FETCH_SIZE")? {
            config.aggregate_fetch_size = size.max(1);
        }
        if let Some(ms) = env_parse::<u64>("ENGINE_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms.max(1));
        }

        Ok(config)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name} has invalid value '{raw}': {e}")))
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the archive object store from environment
    ///
    /// Environment variables:
    /// - ARCHIVE_BACKEND: "memory" (default), "local" or "s3"
    /// - ARCHIVE_ROOT: directory holding containers (required for local)
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID: AWS credentials (optional, uses IAM role if not set)
    /// - AWS_SECRET_ACCESS_KEY: AWS credentials (optional)
    pub fn create_object_store() -> Result<Arc<dyn ObjectStore>> {
        let backend = std::env::var("ARCHIVE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory archive store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            "local" => {
                let root = std::env::var("ARCHIVE_ROOT").map_err(|_| {
                    Error::Config("ARCHIVE_ROOT required when ARCHIVE_BACKEND=local".to_string())
                })?;
                info!(root = %root, "Using local filesystem archive store");
                Ok(Arc::new(LocalFileSystem::new_with_prefix(&root)?))
            }
            "s3" => {
                let bucket = std::env::var("S3_BUCKET").map_err(|_| {
                    Error::Config("S3_BUCKET required when ARCHIVE_BACKEND=s3".to_string())
                })?;
                let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

                info!(bucket = %bucket, region = %region, "Using S3 archive store");

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&bucket)
                    .with_region(&region);

                // Support custom endpoints (MinIO, LocalStack)
                if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                    info!(endpoint = %endpoint, "Using custom S3 endpoint");
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }

                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build()?))
            }
            _ => Err(Error::Config(format!(
                "Unknown ARCHIVE_BACKEND: {}. Use 'memory', 'local' or 's3'",
                backend
            ))),
        }
    }

    /// Create the relational measurement store from environment
    ///
    /// Environment variables:
    /// - RELATIONAL_BACKEND: "local" (default) or "postgres"
    /// - DATABASE_URL: connection string (required for postgres)
    pub fn create_measurement_store(config: &RelationalConfig) -> Result<Arc<dyn MeasurementStore>> {
        let backend = std::env::var("RELATIONAL_BACKEND").unwrap_or_else(|_| "local".to_string());

        match backend.as_str() {
            "local" => {
                info!("Using LocalMeasurementStore (development mode)");
                Ok(Arc::new(LocalMeasurementStore::new(config.clone())))
            }
            "postgres" => {
                let url = std::env::var("DATABASE_URL").map_err(|_| {
                    Error::Config("DATABASE_URL required when RELATIONAL_BACKEND=postgres".to_string())
                })?;
                info!(
                    max_connections = config.max_connections,
                    statement_timeout_ms = config.statement_timeout.as_millis() as u64,
                    "Using PostgreSQL measurement store"
                );
                Ok(Arc::new(PgMeasurementStore::connect_lazy(&url, config.clone())?))
            }
            _ => Err(Error::Config(format!(
                "Unknown RELATIONAL_BACKEND: {}. Use 'local' or 'postgres'",
                backend
            ))),
        }
    }
}
