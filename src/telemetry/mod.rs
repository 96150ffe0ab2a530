//! Tracing and OpenTelemetry setup.
//!
//! The subscriber always gets an env-filtered fmt layer (plain or JSON via
//! `LOG_FORMAT=json`); when OTLP export is enabled an OpenTelemetry layer
//! ships spans to a collector such as Jaeger or Tempo.

use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::OtelConfig;

#[derive(Debug, thiserror::Error)]
#[error("Telemetry initialization failed: {0}")]
pub struct TelemetryError(String);

/// Keeps the tracer provider alive; exported spans flush when it drops.
pub struct TelemetryGuard {
    _provider: Option<SdkTracerProvider>,
}

/// Install the global tracing subscriber. The returned guard must live for
/// the whole process.
pub fn init_telemetry(config: &OtelConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let (otel_layer, provider) = if config.enabled {
        let provider = build_tracer_provider(config)?;
        let tracer = provider.tracer("relay-realtime-service");
        (
            Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Some(provider),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    if config.enabled {
        tracing::info!(
            endpoint = %config.endpoint,
            service_name = %config.service_name,
            sampling_ratio = %config.sampling_ratio,
            "OpenTelemetry export enabled"
        );
    } else {
        tracing::info!(json = json_logs, "Tracing initialized");
    }

    Ok(TelemetryGuard {
        _provider: provider,
    })
}

fn build_tracer_provider(config: &OtelConfig) -> Result<SdkTracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.endpoint)
        .build()
        .map_err(|e| TelemetryError(e.to_string()))?;

    let sampler = match config.sampling_ratio {
        r if r >= 1.0 => Sampler::AlwaysOn,
        r if r <= 0.0 => Sampler::AlwaysOff,
        r => Sampler::TraceIdRatioBased(r),
    };

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(sampler)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                config.service_name.clone(),
            ),
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ),
        ]))
        .build())
}
