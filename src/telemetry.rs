//! OpenTelemetry wiring for the engine's `tracing` spans.
//!
//! Console logging is always on; an OTLP exporter is layered in only
//! when an endpoint is configured, following the same "console layer
//! always, OTLP layer conditionally" shape as the teacher's telemetry
//! setup.

use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    pub otlp_endpoint: Option<String>,
    pub environment: Option<String>,
    pub enable_console: bool,
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "dagrunner-engine".to_string(),
            service_version: None,
            otlp_endpoint: None,
            environment: None,
            enable_console: true,
            log_filter: None,
        }
    }
}

/// Shuts down the tracer provider on drop. Keep this alive for the
/// process lifetime.
pub struct TelemetryGuard {
    _provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self._provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {e:?}");
            }
        }
    }
}

pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let mut resource_attrs = vec![KeyValue::new("service.name", config.service_name.clone())];
    if let Some(version) = &config.service_version {
        resource_attrs.push(KeyValue::new("service.version", version.clone()));
    }
    if let Some(env) = &config.environment {
        resource_attrs.push(KeyValue::new("deployment.environment", env.clone()));
    }
    let resource = Resource::builder().with_attributes(resource_attrs).build();

    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dagrunner_engine=debug")));

    let console_layer = if config.enable_console {
        Some(tracing_subscriber::fmt::layer().with_target(true).with_filter(filter))
    } else {
        None
    };

    let (tracer_provider, otel_layer, otel_status) = if let Some(endpoint) = &config.otlp_endpoint {
        match build_otlp_tracer(endpoint, resource) {
            Ok((provider, tracer)) => {
                let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                (Some(provider), Some(layer), Some(Ok(endpoint.clone())))
            }
            Err(e) => (None, None, Some(Err(e.to_string()))),
        }
    } else {
        (None, None, None)
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(otel_layer)
        .init();

    match otel_status {
        Some(Ok(endpoint)) => tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled"),
        Some(Err(e)) => tracing::warn!(error = %e, "failed to initialize OTLP tracer, continuing without tracing"),
        None => tracing::debug!("OpenTelemetry tracing disabled: no otlp_endpoint configured"),
    }

    TelemetryGuard {
        _provider: tracer_provider,
    }
}

fn build_otlp_tracer(
    endpoint: &str,
    resource: Resource,
) -> Result<(SdkTracerProvider, opentelemetry_sdk::trace::Tracer), opentelemetry::trace::TraceError> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("dagrunner-engine");
    Ok((provider, tracer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_have_no_otlp_endpoint() {
        let config = TelemetryConfig::default();
        assert!(config.otlp_endpoint.is_none());
        assert!(config.enable_console);
    }
}
