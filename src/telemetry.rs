//! Log output and optional OTLP span export.
//!
//! Console logging is always installed. With `telemetry.enabled` the
//! connection spans are additionally shipped to an OTLP collector.

use crate::config::TelemetryConfig;
use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,mysql_wire_server=debug";

const TRACER_NAME: &str = "mysql-wire-server";

/// Installs the global subscriber. Keep the returned guard alive for the
/// life of the process so buffered spans are flushed on exit.
pub fn init_telemetry(config: Option<&TelemetryConfig>) -> Result<Option<TelemetryGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let provider = match config {
        Some(cfg) if cfg.enabled => Some(otlp_provider(cfg)?),
        _ => None,
    };
    let otel_layer = provider
        .as_ref()
        .map(|p| OpenTelemetryLayer::new(p.tracer(TRACER_NAME)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(otel_layer)
        .init();

    match (config, provider) {
        (Some(cfg), Some(provider)) => {
            tracing::info!(
                endpoint = %cfg.otlp_endpoint,
                service = %cfg.service_name,
                "exporting spans over OTLP"
            );
            Ok(Some(TelemetryGuard { provider }))
        }
        _ => {
            tracing::debug!("span export disabled");
            Ok(None)
        }
    }
}

fn otlp_provider(cfg: &TelemetryConfig) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&cfg.otlp_endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", cfg.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build())
}

pub struct TelemetryGuard {
    provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {:?}", e);
        }
    }
}
