use std::collections::HashMap;

use opentelemetry::propagation::Extractor;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{SpanExporter as OtlpExporter, WithExportConfig};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};

use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::Targets, fmt, layer::SubscriberExt};

const SERVICE_NAME: &str = "folio_server";

/// Crates whose records are emitted at the configured level; everything else only at `WARN`.
const OWN_TARGETS: [&str; 4] = ["folio_server", "api", "impls", "auth_impls"];

pub(crate) struct HeaderExtractor<'a>(&'a HashMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
	fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(|s| s.as_str())
	}

	fn keys(&self) -> Vec<&str> {
		self.0.keys().map(|k| k.as_str()).collect()
	}
}

/// Reads a W3C trace context from the request headers, if the caller sent one.
pub(crate) fn extract_context(headers: &HashMap<String, String>) -> opentelemetry::Context {
	let propagator = TraceContextPropagator::new();
	propagator.extract(&HeaderExtractor(headers))
}

fn filter(level: LevelFilter) -> Targets {
	OWN_TARGETS
		.iter()
		.fold(Targets::new().with_default(LevelFilter::WARN), |targets, target| {
			targets.with_target(*target, level)
		})
}

/// Installs the global subscriber: JSON lines on stdout, plus span export over OTLP when an
/// endpoint is configured. `log` records of the library crates are bridged into it.
///
/// The returned provider must be shut down on exit to flush pending spans.
pub(crate) fn configure_tracer(
	level: LevelFilter, otlp_endpoint: Option<&str>,
) -> Result<Option<SdkTracerProvider>, String> {
	let tracer_provider = match otlp_endpoint {
		Some(endpoint) => {
			let exporter = OtlpExporter::builder()
				.with_tonic()
				.with_endpoint(endpoint)
				.build()
				.map_err(|e| format!("Failed to create OTLP exporter: {}", e))?;
			Some(
				SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
					.build(),
			)
		},
		None => None,
	};
	let otel_layer =
		tracer_provider.as_ref().map(|provider| OpenTelemetryLayer::new(provider.tracer(SERVICE_NAME)));

	tracing_subscriber::registry()
		.with(filter(level))
		.with(fmt::layer().json())
		.with(otel_layer)
		.try_init()
		.map_err(|e| format!("Failed to install tracing subscriber: {}", e))?;

	Ok(tracer_provider)
}

#[cfg(test)]
mod tests {
	use super::*;
	use opentelemetry::trace::TraceContextExt;

	#[test]
	fn own_crates_follow_configured_level() {
		let targets = filter(LevelFilter::DEBUG);
		assert!(targets.would_enable("impls::proxied_kv_store", &tracing::Level::DEBUG));
		assert!(targets.would_enable("folio_server", &tracing::Level::DEBUG));
		assert!(!targets.would_enable("hyper::proto", &tracing::Level::INFO));
		assert!(targets.would_enable("hyper::proto", &tracing::Level::WARN));
	}

	#[test]
	fn extracts_trace_parent() {
		let mut headers = HashMap::new();
		headers.insert(
			"traceparent".to_string(),
			"00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
		);
		let context = extract_context(&headers);
		let span_context = context.span().span_context().clone();
		assert!(span_context.is_valid());
		assert_eq!(span_context.trace_id().to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");

		assert!(!extract_context(&HashMap::new()).span().span_context().is_valid());
	}
}
