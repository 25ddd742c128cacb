//! Telemetry setup for tracing and logging.

use std::io::IsTerminal;

use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "converge";

/// Flushes exported spans when dropped at the end of `main`.
pub struct TelemetryGuard {
	_inner: Option<OtelGuard>,
}

struct OtelGuard {
	tracer_provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
	fn drop(&mut self) {
		if let Err(e) = self.tracer_provider.shutdown() {
			eprintln!("flushing spans failed: {e}");
		}
	}
}

fn otel_export_enabled() -> bool {
	std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_ENDPOINT).is_ok()
		|| std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_TRACES_ENDPOINT).is_ok()
}

/// Filter for the given CLI level: the flag wins, then `RUST_LOG`, then info.
fn filter(log_level: Option<Level>) -> EnvFilter {
	match log_level {
		Some(level) => EnvFilter::new(level.as_str()),
		None => EnvFilter::builder()
			.with_default_directive(Level::INFO.into())
			.from_env_lossy(),
	}
}

/// Initialize tracing with the given log level.
///
/// Logs go to stderr, pretty when it is a terminal and JSON otherwise.
/// Spans are exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` or
/// `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` is set; the service name defaults to
/// `converge` unless `OTEL_SERVICE_NAME` says otherwise.
///
/// Must be called within a tokio runtime context.
pub fn init(log_level: Option<Level>) -> Result<TelemetryGuard> {
	let filter_layer = filter(log_level);

	let fmt_layer = if std::io::stderr().is_terminal() {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.pretty()
			.boxed()
	} else {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.json()
			.boxed()
	};

	let (otel_layer, guard) = if otel_export_enabled() {
		let (layer, guard) = init_otel()?;
		(Some(layer), Some(guard))
	} else {
		(None, None)
	};

	tracing_subscriber::registry()
		.with(filter_layer)
		.with(fmt_layer)
		.with(otel_layer)
		.init();

	Ok(TelemetryGuard { _inner: guard })
}

/// Span exporter for the protocol named in `OTEL_EXPORTER_OTLP_PROTOCOL`.
fn span_exporter() -> Result<SpanExporter> {
	let protocol = std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL);
	let builder = SpanExporter::builder();
	let exporter = if protocol.as_deref() == Ok("grpc") {
		builder.with_tonic().build()?
	} else {
		builder.with_http().build()?
	};
	Ok(exporter)
}

fn init_otel<S>() -> Result<(impl Layer<S>, OtelGuard)>
where
	S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
	let mut resource = Resource::builder();
	if std::env::var("OTEL_SERVICE_NAME").is_err() {
		resource = resource.with_service_name(SERVICE_NAME);
	}

	let tracer_provider = SdkTracerProvider::builder()
		.with_resource(resource.build())
		.with_batch_exporter(span_exporter()?)
		.build();

	let layer = tracing_opentelemetry::layer()
		.with_error_records_to_exceptions(true)
		.with_tracer(tracer_provider.tracer(SERVICE_NAME));

	opentelemetry::global::set_tracer_provider(tracer_provider.clone());

	Ok((layer, OtelGuard { tracer_provider }))
}
