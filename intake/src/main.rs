use std::time::Duration;

use envconfig::Envconfig;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal::unix::{signal, SignalKind};
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use intake::config::Config;
use intake::server::serve;

/// Resolves on SIGTERM or SIGINT, whichever comes first.
async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut interrupt =
        signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    let received = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    };
    info!(signal = received, "draining intake before exit");
}

fn otlp_tracer(config: &Config, endpoint: &str) -> Tracer {
    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
        config.otel_sampling_rate,
    )));
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new([KeyValue::new(
                    "service.name",
                    config.otel_service_name.clone(),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
        .expect("failed to install OTLP tracer")
}

/// Stdout logs follow RUST_LOG (INFO by default). Spans go to the OTLP collector as
/// well when one is configured, filtered by LOG_LEVEL.
fn init_tracing(config: &Config) {
    let stdout = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    let otlp = config
        .otel_url
        .as_deref()
        .map(|endpoint| OpenTelemetryLayer::new(otlp_tracer(config, endpoint)))
        .with_filter(LevelFilter::from_level(config.log_level));

    tracing_subscriber::registry().with(stdout).with(otlp).init();
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");
    init_tracing(&config);

    info!(
        address = %config.address,
        max_event_size = config.max_event_size,
        batch_size = config.batch_size.get(),
        max_concurrent_decoders = config.max_concurrent_decoders.get(),
        queue_capacity = config.queue_capacity.get(),
        queue_send_timeout_ms = config.queue_send_timeout_ms,
        "starting intake"
    );

    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .expect("could not bind port");
    serve(config, listener, shutdown_signal()).await
}
