//! Measurement Engine CLI
//!
//! Runs one aggregation or retrieval against the configured tiers and
//! prints the JSON result together with its `Cache-Control` value.

use measurement_engine::clock::SystemClock;
use measurement_engine::config::{ComponentFactory, EngineConfig};
use measurement_engine::engine::Engine;
use measurement_engine::measurement::MeasurementRef;
use measurement_engine::query::{
    AggregationRequest, BucketGranularity, Dimension, Filter, PageCursor, TimeRange,
};
use measurement_engine::telemetry::Telemetry;
use measurement_engine::Error;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Measurement aggregation and retrieval engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grouped measurement counts over a time range
    Aggregate {
        /// Grouping dimensions, comma separated
        #[arg(long, value_delimiter = ',')]
        group_by: Vec<Dimension>,

        /// Inclusive start (RFC 3339)
        #[arg(long)]
        since: DateTime<Utc>,

        /// Exclusive end (RFC 3339)
        #[arg(long)]
        until: DateTime<Utc>,

        /// Finest time bucket wanted; may be widened
        #[arg(long)]
        granularity: Option<BucketGranularity>,

        #[arg(long)]
        country: Option<String>,

        /// ASN, with or without the AS prefix
        #[arg(long)]
        asn: Option<String>,

        #[arg(long)]
        test_name: Option<String>,

        #[arg(long)]
        category_code: Option<String>,

        #[arg(long)]
        domain: Option<String>,

        #[arg(long)]
        input: Option<String>,

        #[arg(long)]
        page_size: Option<usize>,

        /// Token returned as next_cursor by a previous page
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Fetch a single measurement body
    Fetch {
        #[arg(long)]
        report_id: String,

        #[arg(long)]
        input: Option<String>,

        /// Start time hint (RFC 3339); skips the existence probe when
        /// clearly on one side of the cutover
        #[arg(long)]
        start_time: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init("measurement-engine", &args.log_level)?;

    let config = EngineConfig::from_env()?;
    let object_store = ComponentFactory::create_object_store()?;
    let store = ComponentFactory::create_measurement_store(&config.relational)?;
    let engine = Engine::new(&config, object_store, store, Arc::new(SystemClock::new()));

    let result = match args.command {
        Command::Aggregate {
            group_by,
            since,
            until,
            granularity,
            country,
            asn,
            test_name,
            category_code,
            domain,
            input,
            page_size,
            cursor,
        } => {
            let mut request = AggregationRequest::new(group_by, TimeRange::new(since, until));
            request.granularity = granularity;
            request.page_size = page_size;
            if let Some(token) = cursor {
                request.cursor = Some(PageCursor::from_token(&token)?);
            }
            if let Some(cc) = country {
                request = request.with_filter(Filter::country(&cc));
            }
            if let Some(asn) = asn {
                request = request.with_filter(Filter::asn(&asn)?);
            }
            if let Some(name) = test_name {
                request = request.with_filter(Filter::test_name(&name));
            }
            if let Some(code) = category_code {
                request = request.with_filter(Filter::category_code(&code));
            }
            if let Some(domain) = domain {
                request = request.with_filter(Filter::domain(&domain));
            }
            if let Some(input) = input {
                request = request.with_filter(Filter::input(&input));
            }
            aggregate(&engine, &request).await
        }
        Command::Fetch {
            report_id,
            input,
            start_time,
        } => {
            let mut reference = MeasurementRef::new(report_id);
            reference.input = input;
            reference.measurement_start_time = start_time;
            fetch(&engine, &reference).await
        }
    };

    if let Err(error) = &result {
        warn!(
            error = %error,
            http_status = error.http_status(),
            retryable = error.is_retryable(),
            guidance = ?error.guidance(),
            "Request failed"
        );
    }
    Ok(result?)
}

async fn aggregate(engine: &Engine, request: &AggregationRequest) -> Result<(), Error> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let response = engine
        .plan_and_aggregate_with_cancel(request, cancel)
        .await?;
    let now = engine.freshness().now();
    if response.is_degraded() {
        warn!(issues = response.issues.len(), "Response served with data issues");
    }
    info!(
        rows = response.rows.len(),
        granularity = response.plan.granularity.map(|g| g.as_str()).unwrap_or("none"),
        widened = response.plan.widened,
        "Aggregation complete"
    );

    let next_cursor = response
        .next_cursor
        .as_ref()
        .map(PageCursor::to_token)
        .transpose()?;
    let output = json!({
        "cache_control": response.freshness.cache_control(now),
        "next_cursor": next_cursor,
        "response": response,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn fetch(engine: &Engine, reference: &MeasurementRef) -> Result<(), Error> {
    let (body, window) = engine.locate_and_fetch(reference).await?;
    let now = engine.freshness().now();

    let measurement = serde_json::from_slice::<serde_json::Value>(&body.raw_bytes)
        .unwrap_or_else(|_| json!(String::from_utf8_lossy(&body.raw_bytes)));
    let output = json!({
        "cache_control": window.cache_control(now),
        "tier": body.tier,
        "format_version": body.format_version.as_str(),
        "reference": body.reference,
        "measurement": measurement,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
