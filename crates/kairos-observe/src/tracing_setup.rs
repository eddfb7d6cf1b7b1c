//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use kairos_types::config::LoggingConfig;
//!
//! let config = LoggingConfig { level: "kairos_core=debug,info".into(), json: true, otel: false };
//! kairos_observe::tracing_setup::init_tracing(&config).unwrap();
//! // ... run the site ...
//! kairos_observe::tracing_setup::shutdown_tracing();
//! ```

use kairos_types::config::LoggingConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Kept so the provider can be flushed on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// `RUST_LOG` when set, otherwise `level`.
pub fn env_filter(level: &str) -> Result<EnvFilter, ParseError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level),
    }
}

/// Install the global tracing subscriber.
///
/// - A `fmt` layer, human-readable or JSON lines per `config.json`, with
///   span close timing.
/// - With `config.otel`, a bridge to OpenTelemetry using the stdout exporter.
///
/// # Errors
///
/// Fails if `config.level` is not a valid filter or a global subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = env_filter(&config.level)?;

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
    });

    let otel_layer = if config.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("kairos");
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::debug!(level = config.level.as_str(), json = config.json, otel = config.otel, "tracing initialized");
    Ok(())
}

/// Flush pending spans and shut down the OpenTelemetry provider.
///
/// No-op when OpenTelemetry was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("warning: tracer provider shutdown error: {e}");
        }
    }
}
