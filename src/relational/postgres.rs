//! PostgreSQL measurement store
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE measurements (
//!     report_id              TEXT        NOT NULL,
//!     input                  TEXT        NOT NULL DEFAULT '',
//!     measurement_start_time TIMESTAMPTZ NOT NULL,
//!     probe_cc               TEXT        NOT NULL,
//!     probe_asn              INTEGER     NOT NULL,
//!     test_name              TEXT        NOT NULL,
//!     category_code          TEXT,
//!     domain                 TEXT,
//!     anomaly                BOOLEAN     NOT NULL,
//!     confirmed              BOOLEAN     NOT NULL,
//!     failure                BOOLEAN     NOT NULL,
//!     data_format_version    TEXT        NOT NULL,
//!     raw_body               BYTEA       NOT NULL,
//!     PRIMARY KEY (report_id, input)
//! );
//! CREATE TABLE archive_index (
//!     report_id    TEXT   NOT NULL,
//!     input        TEXT   NOT NULL DEFAULT '',
//!     frame_offset BIGINT NOT NULL,
//!     PRIMARY KEY (report_id, input)
//! );
//! ```

use super::sql::{build_grouped_query, BindValue};
use super::{GroupedQuery, MeasurementStore, ProbeResult, RelationalConfig, StoredBody};
use crate::measurement::{FormatVersion, MeasurementRef};
use crate::query::{AggregationRow, Dimension, DimensionValue};
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// SQLSTATE raised when a statement hits `statement_timeout`.
const QUERY_CANCELED: &str = "57014";

const PROBE_SQL: &str = "SELECT \
     EXISTS (SELECT 1 FROM measurements WHERE report_id = $1 AND input = $2) AS in_relational, \
     (SELECT frame_offset FROM archive_index WHERE report_id = $1 AND input = $2) AS frame_offset";

const FETCH_SQL: &str = "SELECT measurement_start_time, data_format_version, raw_body \
     FROM measurements WHERE report_id = $1 AND input = $2";

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

fn bind_all<'q>(mut query: PgQuery<'q>, binds: &[BindValue]) -> PgQuery<'q> {
    for value in binds {
        query = match value {
            BindValue::Text(s) => query.bind(s.clone()),
            BindValue::BigInt(n) => query.bind(*n),
            BindValue::Timestamp(t) => query.bind(*t),
            BindValue::TextArray(values) => query.bind(values.clone()),
            BindValue::BigIntArray(values) => query.bind(values.clone()),
            BindValue::TimestampArray(values) => query.bind(values.clone()),
        };
    }
    query
}

fn count(row: &PgRow, column: &str) -> Result<u64> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

fn decode_row(row: &PgRow, dimensions: &[Dimension]) -> Result<AggregationRow> {
    let mut values = Vec::with_capacity(dimensions.len());
    for (i, dimension) in dimensions.iter().enumerate() {
        let value = match dimension {
            Dimension::Asn => DimensionValue::Number(row.try_get::<i64, _>(i)?),
            Dimension::TimeBucket => DimensionValue::Time(row.try_get::<DateTime<Utc>, _>(i)?),
            _ => DimensionValue::Text(row.try_get::<String, _>(i)?),
        };
        values.push(value);
    }

    Ok(AggregationRow {
        dimension_values: values,
        measurement_count: count(row, "measurement_count")?,
        anomaly_count: count(row, "anomaly_count")?,
        confirmed_count: count(row, "confirmed_count")?,
        failure_count: count(row, "failure_count")?,
    })
}

/// PostgreSQL-backed measurement store
#[derive(Debug, Clone)]
pub struct PgMeasurementStore {
    pool: PgPool,
    config: RelationalConfig,
}

impl PgMeasurementStore {
    /// Build a store whose pool connects on first use.
    pub fn connect_lazy(database_url: &str, config: RelationalConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(database_url)?;
        Ok(Self { pool, config })
    }

    pub fn from_pool(pool: PgPool, config: RelationalConfig) -> Self {
        Self { pool, config }
    }

    fn map_error(&self, operation: &'static str, err: sqlx::Error) -> Error {
        if matches!(err, sqlx::Error::PoolTimedOut) {
            return Error::PoolExhausted {
                waited: self.config.acquire_timeout,
            };
        }
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(QUERY_CANCELED) {
                return Error::QueryTimeout {
                    operation,
                    timeout: self.config.statement_timeout,
                };
            }
        }
        Error::Database(err)
    }

    /// Open a transaction with the statement timeout and UTC session zone
    /// applied to it alone.
    async fn begin(&self, operation: &'static str) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| self.map_error(operation, e))?;

        sqlx::query(
            "SELECT set_config('statement_timeout', $1, true), set_config('TimeZone', 'UTC', true)",
        )
        .bind(format!("{}ms", self.config.statement_timeout.as_millis()))
        .execute(&mut *tx)
        .await
        .map_err(|e| self.map_error(operation, e))?;

        Ok(tx)
    }
}

#[async_trait]
impl MeasurementStore for PgMeasurementStore {
    async fn probe(&self, reference: &MeasurementRef) -> Result<ProbeResult> {
        let mut tx = self.begin("probe").await?;
        let row = sqlx::query(PROBE_SQL)
            .bind(reference.report_id.as_str())
            .bind(reference.input_key())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| self.map_error("probe", e))?;
        tx.commit().await.map_err(|e| self.map_error("probe", e))?;

        let in_relational: bool = row.try_get("in_relational")?;
        let frame_offset: Option<i64> = row.try_get("frame_offset")?;
        Ok(match (in_relational, frame_offset) {
            (true, _) => ProbeResult::Row,
            (false, Some(offset)) => ProbeResult::ArchiveFrame(offset.max(0) as u64),
            (false, None) => ProbeResult::Missing,
        })
    }

    async fn fetch_measurement(&self, reference: &MeasurementRef) -> Result<Option<StoredBody>> {
        let mut tx = self.begin("fetch_measurement").await?;
        let row = sqlx::query(FETCH_SQL)
            .bind(reference.report_id.as_str())
            .bind(reference.input_key())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| self.map_error("fetch_measurement", e))?;
        tx.commit()
            .await
            .map_err(|e| self.map_error("fetch_measurement", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: String = row.try_get("data_format_version")?;
        let format_version = version.parse::<FormatVersion>().map_err(|e| {
            Error::InconsistentData {
                detail: format!("{} has {}", reference, e),
            }
        })?;
        let raw: Vec<u8> = row.try_get("raw_body")?;

        Ok(Some(StoredBody {
            measurement_start_time: row.try_get("measurement_start_time")?,
            format_version,
            raw_bytes: Bytes::from(raw),
        }))
    }

    async fn aggregate(
        &self,
        query: &GroupedQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<AggregationRow>> {
        let (sql, binds) = build_grouped_query(query)?;
        let mut tx = self.begin("aggregate").await?;
        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| self.map_error("aggregate", e))?;

        debug!(backend_pid, binds = binds.len(), "Running grouped statement");

        let rows = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = bind_all(sqlx::query(&sql), &binds).fetch_all(&mut *tx) => Some(result),
        };

        let Some(rows) = rows else {
            // The statement is still running server side until told otherwise
            if let Err(e) = sqlx::query("SELECT pg_cancel_backend($1)")
                .bind(backend_pid)
                .execute(&self.pool)
                .await
            {
                warn!(backend_pid, error = %e, "Failed to cancel grouped statement");
            }
            return Err(Error::Cancelled {
                operation: "aggregate",
            });
        };

        let rows = rows.map_err(|e| self.map_error("aggregate", e))?;
        tx.commit().await.map_err(|e| self.map_error("aggregate", e))?;

        rows.iter()
            .map(|row| decode_row(row, &query.dimensions))
            .collect()
    }
}
