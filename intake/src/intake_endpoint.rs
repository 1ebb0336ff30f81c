use std::io;
use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::{CONTENT_TYPE, USER_AGENT};
use axum::http::HeaderMap;
use futures::TryStreamExt;
use metrics::counter;
use serde::Deserialize;
use tokio_util::io::StreamReader as BodyReader;
use tracing::{debug, instrument, Span};

use crate::api::{accepts_json, IngestError, Reply};
use crate::model::{BaseEvent, Client};
use crate::prometheus::report_stream_error;
use crate::router;
use crate::stream::StreamResult;

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Deserialize, Default)]
pub struct IntakeQuery {
    /// Present (with any value) to get the accepted count back on success.
    pub verbose: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Backend,
    RumV2,
    RumV3,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Backend => "backend",
            Endpoint::RumV2 => "rum_v2",
            Endpoint::RumV3 => "rum_v3",
        }
    }

    fn is_rum(&self) -> bool {
        !matches!(self, Endpoint::Backend)
    }
}

#[instrument(skip_all, fields(endpoint = "backend", accepted, errors))]
pub async fn backend_events(
    state: State<router::State>,
    query: Query<IntakeQuery>,
    headers: HeaderMap,
    body: Body,
) -> Reply {
    handle(&state, Endpoint::Backend, &query, &headers, None, body).await
}

#[instrument(skip_all, fields(endpoint = "rum_v2", accepted, errors))]
pub async fn rum_v2_events(
    state: State<router::State>,
    query: Query<IntakeQuery>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Body,
) -> Reply {
    let peer = peer.map(|ConnectInfo(addr)| addr.ip());
    handle(&state, Endpoint::RumV2, &query, &headers, peer, body).await
}

#[instrument(skip_all, fields(endpoint = "rum_v3", accepted, errors))]
pub async fn rum_v3_events(
    state: State<router::State>,
    query: Query<IntakeQuery>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Body,
) -> Reply {
    let peer = peer.map(|ConnectInfo(addr)| addr.ip());
    handle(&state, Endpoint::RumV3, &query, &headers, peer, body).await
}

async fn handle(
    state: &router::State,
    endpoint: Endpoint,
    query: &IntakeQuery,
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    body: Body,
) -> Reply {
    let mut result = StreamResult::default();
    let outcome = ingest(state, endpoint, headers, peer, body, &mut result).await;

    let span = Span::current();
    span.record("accepted", result.accepted());
    span.record("errors", result.invalid());
    counter!("intake_events_accepted_total", "endpoint" => endpoint.as_str())
        .increment(result.accepted() as u64);
    counter!("intake_events_invalid_total", "endpoint" => endpoint.as_str())
        .increment(result.invalid() as u64);
    if let Err(err) = &outcome {
        debug!("intake: rejected request: {}", err);
        report_stream_error(endpoint.as_str(), err.to_metric_tag());
    }

    Reply::new(outcome, &result, query.verbose.is_some()).json(accepts_json(headers))
}

async fn ingest(
    state: &router::State,
    endpoint: Endpoint,
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    body: Body,
    result: &mut StreamResult,
) -> Result<(), IngestError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.contains(NDJSON_CONTENT_TYPE) {
        return Err(IngestError::InvalidContentType(content_type.to_string()));
    }

    let mut base = BaseEvent::new(state.timesource.current_time());
    if endpoint.is_rum() {
        base.client = Some(Client {
            ip: client_ip(headers).or(peer),
            user_agent: headers
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        });
    }

    let processor = match endpoint {
        Endpoint::Backend => &state.backend,
        Endpoint::RumV2 => &state.rum_v2,
        Endpoint::RumV3 => &state.rum_v3,
    };
    let reader = BodyReader::new(
        body.into_data_stream()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err)),
    );
    let cancel = state.shutdown.child_token();

    processor
        .handle_stream(
            &cancel,
            base,
            reader,
            state.batch_size,
            state.sink.as_ref(),
            result,
        )
        .await?;
    Ok(())
}

/// Client address as reported by a proxy in front of us, if any.
fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded = headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok());
    forwarded.or_else(|| {
        headers
            .get("X-Real-IP")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    })
}
