use std::future::ready;
use std::num::NonZeroUsize;
use std::sync::Arc;

use axum::http::Method;
use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;

use crate::admission::AdmissionSemaphore;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::sinks::BatchProcessor;
use crate::stream::Processor;
use crate::{intake_endpoint, time::TimeSource};

#[derive(Clone)]
pub struct State {
    pub sink: Arc<dyn BatchProcessor>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub backend: Arc<Processor>,
    pub rum_v2: Arc<Processor>,
    pub rum_v3: Arc<Processor>,
    pub batch_size: NonZeroUsize,
    /// Parent of every request's cancellation token.
    pub shutdown: CancellationToken,
}

/// Limits shared by the three intake processors.
#[derive(Clone, Copy, Debug)]
pub struct IntakeLimits {
    pub max_event_size: usize,
    pub batch_size: NonZeroUsize,
    pub max_concurrent_decoders: usize,
}

async fn index() -> &'static str {
    "intake"
}

pub fn router<TZ: TimeSource + Send + Sync + 'static>(
    timesource: TZ,
    sink: Arc<dyn BatchProcessor>,
    limits: IntakeLimits,
    shutdown: CancellationToken,
    metrics: bool,
) -> Router {
    // One pool of decoder slots for every endpoint.
    let semaphore = AdmissionSemaphore::new(limits.max_concurrent_decoders);
    let state = State {
        sink,
        timesource: Arc::new(timesource),
        backend: Arc::new(Processor::backend(limits.max_event_size, semaphore.clone())),
        rum_v2: Arc::new(Processor::rum_v2(limits.max_event_size, semaphore.clone())),
        rum_v3: Arc::new(Processor::rum_v3(limits.max_event_size, semaphore)),
        batch_size: limits.batch_size,
        shutdown,
    };

    // Browser agents post from any origin.
    let cors = CorsLayer::new()
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_origin(AllowOrigin::mirror_request());

    let rum = Router::new()
        .route("/intake/v2/rum/events", post(intake_endpoint::rum_v2_events))
        .route("/intake/v3/rum/events", post(intake_endpoint::rum_v3_events))
        .layer(cors);

    let router = Router::new()
        .route("/", get(index))
        .route("/intake/v2/events", post(intake_endpoint::backend_events))
        .merge(rum)
        .layer(RequestDecompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when intake is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
