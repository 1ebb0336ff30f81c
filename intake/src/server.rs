use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::router::{self, IntakeLimits};
use crate::sinks::print::PrintSink;
use crate::sinks::queue::QueueSink;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let (sink, drain) = QueueSink::spawn(
        Arc::new(PrintSink {}),
        config.queue_capacity.get(),
        config.queue_send_timeout(),
    );

    let cancel = CancellationToken::new();
    let app = router::router(
        crate::time::SystemTime {},
        Arc::new(sink),
        IntakeLimits {
            max_event_size: config.max_event_size,
            batch_size: config.batch_size,
            max_concurrent_decoders: config.max_concurrent_decoders.get(),
        },
        cancel.clone(),
        config.export_prometheus,
    );

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(err) => tracing::warn!("could not read listen address: {}", err),
    }

    let graceful = async move {
        shutdown.await;
        // Requests still waiting for a decoder slot give up instead of holding the
        // server open.
        cancel.cancel();
    };
    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful)
    .await
    {
        tracing::error!("server error: {}", err);
    }

    // The router, and with it the last queue sender, is gone: flush what is buffered.
    drain.wait().await;
    tracing::info!("shutdown complete");
}
