//! Error types for the measurement engine

use crate::measurement::StorageTier;
use crate::query::{BucketGranularity, Dimension};

use std::fmt;
use std::time::Duration;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the measurement engine
#[derive(Debug)]
pub enum Error {
    /// No data for the reference in any tier that was consulted
    NotFound {
        report_id: String,
        input: Option<String>,
        tier: StorageTier,
    },
    /// Requested time range is longer than the configured maximum
    RangeTooWide {
        requested: chrono::Duration,
        max: chrono::Duration,
    },
    /// More grouping dimensions than the cardinality budget allows
    TooManyDimensions {
        requested: Vec<Dimension>,
        max: usize,
    },
    /// Estimated output rows exceed the ceiling even at the coarsest granularity
    EstimateTooLarge {
        estimated_rows: u64,
        ceiling: u64,
        granularity: Option<BucketGranularity>,
    },
    /// Malformed aggregation request
    InvalidRequest(String),
    /// Malformed measurement reference
    InvalidReference { report_id: String, reason: String },
    /// Statement exceeded its server-side timeout or the request deadline
    QueryTimeout {
        operation: &'static str,
        timeout: Duration,
    },
    /// No relational connection became available in time
    PoolExhausted { waited: Duration },
    /// Statement was cancelled on behalf of the caller
    Cancelled { operation: &'static str },
    /// Archive container could not be decompressed or parsed
    CorruptArchive { container: String, detail: String },
    /// Stored counters violate a data-quality invariant
    InconsistentData { detail: String },
    /// Object store errors
    ObjectStore(object_store::Error),
    /// Relational store errors
    Database(sqlx::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Internal error
    Internal(String),
}

/// Coarse grouping used by callers to pick a response class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    Rejected,
    Unavailable,
    Integrity,
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::RangeTooWide { .. }
            | Error::TooManyDimensions { .. }
            | Error::EstimateTooLarge { .. }
            | Error::InvalidRequest(_)
            | Error::InvalidReference { .. } => ErrorCategory::Rejected,
            Error::QueryTimeout { .. } | Error::PoolExhausted { .. } | Error::Cancelled { .. } => {
                ErrorCategory::Unavailable
            }
            Error::CorruptArchive { .. } | Error::InconsistentData { .. } => {
                ErrorCategory::Integrity
            }
            Error::ObjectStore(_)
            | Error::Database(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// HTTP status the fronting layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self.category() {
            ErrorCategory::NotFound => 404,
            ErrorCategory::Rejected => 400,
            ErrorCategory::Unavailable => 503,
            ErrorCategory::Integrity | ErrorCategory::Internal => 500,
        }
    }

    /// Whether the caller may retry the same request later.
    ///
    /// The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Unavailable
    }

    /// How the client could narrow a rejected request.
    pub fn guidance(&self) -> Option<String> {
        match self {
            Error::RangeTooWide { max, .. } => Some(format!(
                "narrow the time range to at most {} hours",
                max.num_hours()
            )),
            Error::TooManyDimensions { max, .. } => {
                Some(format!("group by at most {} dimensions", max))
            }
            Error::EstimateTooLarge { ceiling, .. } => Some(format!(
                "add filters, drop a dimension or shorten the time range to stay under {} rows",
                ceiling
            )),
            _ => None,
        }
    }

    /// Stable label used as a metric attribute.
    pub fn class(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::RangeTooWide { .. } => "range_too_wide",
            Error::TooManyDimensions { .. } => "too_many_dimensions",
            Error::EstimateTooLarge { .. } => "estimate_too_large",
            Error::InvalidRequest(_) => "invalid_request",
            Error::InvalidReference { .. } => "invalid_reference",
            Error::QueryTimeout { .. } => "query_timeout",
            Error::PoolExhausted { .. } => "pool_exhausted",
            Error::Cancelled { .. } => "cancelled",
            Error::CorruptArchive { .. } => "corrupt_archive",
            Error::InconsistentData { .. } => "inconsistent_data",
            Error::ObjectStore(_) => "object_store",
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::Database(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound {
                report_id,
                input,
                tier,
            } => write!(
                f,
                "Measurement not found in {} tier: report_id={} input={}",
                tier.as_str(),
                report_id,
                input.as_deref().unwrap_or("-")
            ),
            Error::RangeTooWide { requested, max } => write!(
                f,
                "Time range too wide: {}h requested, at most {}h allowed",
                requested.num_hours(),
                max.num_hours()
            ),
            Error::TooManyDimensions { requested, max } => {
                let names: Vec<&str> = requested.iter().map(|d| d.as_str()).collect();
                write!(
                    f,
                    "Too many dimensions: [{}] requested, at most {} allowed",
                    names.join(", "),
                    max
                )
            }
            Error::EstimateTooLarge {
                estimated_rows,
                ceiling,
                granularity,
            } => write!(
                f,
                "Estimated result too large: {} rows at {} granularity, ceiling is {}",
                estimated_rows,
                granularity.map(|g| g.as_str()).unwrap_or("no"),
                ceiling
            ),
            Error::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Error::InvalidReference { report_id, reason } => {
                write!(f, "Invalid measurement reference {}: {}", report_id, reason)
            }
            Error::QueryTimeout { operation, timeout } => write!(
                f,
                "Query timeout: {} exceeded {}ms",
                operation,
                timeout.as_millis()
            ),
            Error::PoolExhausted { waited } => write!(
                f,
                "Connection pool exhausted after waiting {}ms",
                waited.as_millis()
            ),
            Error::Cancelled { operation } => write!(f, "Cancelled: {}", operation),
            Error::CorruptArchive { container, detail } => {
                write!(f, "Corrupt archive container {}: {}", container, detail)
            }
            Error::InconsistentData { detail } => write!(f, "Inconsistent data: {}", detail),
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Database(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
