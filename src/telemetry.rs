//! Process-wide telemetry bootstrap
//!
//! Installs the `tracing` subscriber and the OpenTelemetry tracer and meter
//! providers that the per-path instruments in `query::telemetry` and
//! `retrieval::telemetry` record into. Configured from the standard
//! `OTEL_*` variables plus `MEASUREMENT_ENGINE_TELEMETRY_*`.

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
const ATTR_RUN_ID: &str = "measurement_engine.run_id";
const DEFAULT_NAMESPACE: &str = "measurement-engine";

const ENV_ENABLED: &str = "MEASUREMENT_ENGINE_TELEMETRY_ENABLED";
const ENV_RUN_ID: &str = "MEASUREMENT_ENGINE_TELEMETRY_RUN_ID";
const ENV_LOG_FORMAT: &str = "MEASUREMENT_ENGINE_LOG_FORMAT";

/// Whether spans and metrics leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    Disabled,
    Otlp,
}

impl TelemetryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryMode::Disabled => "disabled",
            TelemetryMode::Otlp => "otlp",
        }
    }
}

/// Log line encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Telemetry settings read from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub log_format: LogFormat,
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub traces_sampler: String,
    pub run_id: Option<String>,
    pub resource_attributes: Vec<KeyValue>,
    sampler: Sampler,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name = non_empty_var("OTEL_SERVICE_NAME")
            .unwrap_or_else(|| default_service_name.to_string());

        let otlp_endpoint = non_empty_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        let mode = match (parse_optional_bool(ENV_ENABLED)?, otlp_endpoint.is_some()) {
            (Some(false), _) | (None, false) => TelemetryMode::Disabled,
            (Some(true), true) | (None, true) => TelemetryMode::Otlp,
            (Some(true), false) => {
                return Err(Error::Config(format!(
                    "{ENV_ENABLED}=true requires OTEL_EXPORTER_OTLP_ENDPOINT"
                )));
            }
        };

        let log_format = match non_empty_var(ENV_LOG_FORMAT).as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("text") => LogFormat::Text,
            Some(other) => {
                return Err(Error::Config(format!(
                    "{ENV_LOG_FORMAT} must be 'json' or 'text', got '{other}'"
                )));
            }
        };

        let run_id = non_empty_var(ENV_RUN_ID);
        let traces_sampler = non_empty_var("OTEL_TRACES_SAMPLER")
            .unwrap_or_else(|| "parentbased_always_on".to_string());
        let sampler = parse_sampler(
            &traces_sampler,
            std::env::var("OTEL_TRACES_SAMPLER_ARG").ok().as_deref(),
        )?;

        let extra = std::env::var("OTEL_RESOURCE_ATTRIBUTES").unwrap_or_default();
        let resource_attributes =
            build_resource_attributes(&service_name, run_id.as_deref(), &extra)?;

        Ok(Self {
            mode,
            log_format,
            service_name,
            otlp_endpoint,
            traces_sampler,
            run_id,
            resource_attributes,
            sampler,
        })
    }
}

/// Keeps the SDK providers alive; dropping it flushes and shuts them down.
pub struct Telemetry {
    config: TelemetryConfig,
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    /// Install global subscriber and providers. `log_level` is used when
    /// `RUST_LOG` is unset.
    pub fn init(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(log_level))
            .map_err(|e| Error::Config(format!("invalid log level '{log_level}': {e}")))?;

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr);
        let installed = match config.log_format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Text => builder.try_init(),
        };
        installed
            .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))?;

        let resource =
            Resource::default().merge(&Resource::new(config.resource_attributes.clone()));

        let tracer_provider = TracerProvider::builder()
            .with_config(
                trace::Config::default()
                    .with_sampler(config.sampler.clone())
                    .with_resource(resource.clone()),
            )
            .build();
        let _ = global::set_tracer_provider(tracer_provider.clone());

        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        global::set_meter_provider(meter_provider.clone());
        global::set_text_map_propagator(TraceContextPropagator::new());

        info!(
            service_name = %config.service_name,
            telemetry_mode = config.mode.as_str(),
            otlp_endpoint = %config.otlp_endpoint.as_deref().unwrap_or("none"),
            traces_sampler = %config.traces_sampler,
            run_id = %config.run_id.as_deref().unwrap_or("none"),
            "Telemetry initialized"
        );

        Ok(Self {
            config,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let _ = self.meter_provider.shutdown();
        let _ = self.tracer_provider.shutdown();
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_optional_bool(name: &str) -> Result<Option<bool>> {
    let Some(raw) = non_empty_var(name) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}

fn parse_sampler(name: &str, arg: Option<&str>) -> Result<Sampler> {
    let ratio = || -> Result<f64> {
        let raw = arg.ok_or_else(|| {
            Error::Config("OTEL_TRACES_SAMPLER_ARG is required for ratio samplers".to_string())
        })?;
        match raw.trim().parse::<f64>() {
            Ok(value) if (0.0..=1.0).contains(&value) => Ok(value),
            _ => Err(Error::Config(format!(
                "OTEL_TRACES_SAMPLER_ARG must be a float in [0,1], got '{raw}'"
            ))),
        }
    };

    match name.trim().to_ascii_lowercase().as_str() {
        "always_on" => Ok(Sampler::AlwaysOn),
        "always_off" => Ok(Sampler::AlwaysOff),
        "traceidratio" => Ok(Sampler::TraceIdRatioBased(ratio()?)),
        "parentbased_always_on" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOn))),
        "parentbased_always_off" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOff))),
        "parentbased_traceidratio" => Ok(Sampler::ParentBased(Box::new(
            Sampler::TraceIdRatioBased(ratio()?),
        ))),
        other => Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER '{other}' is not supported"
        ))),
    }
}

/// Merge `OTEL_RESOURCE_ATTRIBUTES` (`k=v,k=v`) with the engine's own
/// attributes. The service name always wins; the namespace only defaults.
fn build_resource_attributes(
    service_name: &str,
    run_id: Option<&str>,
    raw: &str,
) -> Result<Vec<KeyValue>> {
    let mut attributes: BTreeMap<String, String> = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is invalid, expected key=value"
            ))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Config(
                "OTEL_RESOURCE_ATTRIBUTES contains an empty attribute key".to_string(),
            ));
        }
        attributes.insert(key.to_string(), value.trim().to_string());
    }

    attributes.insert(ATTR_SERVICE_NAME.to_string(), service_name.to_string());
    attributes
        .entry(ATTR_SERVICE_NAMESPACE.to_string())
        .or_insert_with(|| DEFAULT_NAMESPACE.to_string());
    if let Some(run_id) = run_id {
        attributes.insert(ATTR_RUN_ID.to_string(), run_id.to_string());
    }

    Ok(attributes
        .into_iter()
        .map(|(key, value)| KeyValue::new(key, value))
        .collect())
}
