//! REST endpoints
//!
//! Thin shims over the datastore: decode the request, call the core, encode
//! the result. Span ids travel as 32-digit hex strings; query JSON arrives
//! URL-encoded in the `query` parameter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use tower_http::compression::CompressionLayer;

use super::types::{ApiError, ServerInfo};
use crate::core::constants::{TRACER_ID_HEADER, WRITE_SPANS_BODY_LIMIT};
use crate::data::DataStore;
use crate::data::store::query::{DEFAULT_QUERY_LIMIT, Query as SpanQuery};
use crate::data::types::{Span, SpanId};
use crate::domain::SpanIngestor;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<DataStore>,
    pub query_timeout: Duration,
}

/// Build the REST router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/server/info", get(server_info))
        .route("/server/stats", get(server_stats))
        .route("/span/{id}", get(find_span))
        .route("/span/{id}/children", get(find_children))
        .route(
            "/writeSpans",
            post(write_spans).layer(DefaultBodyLimit::max(WRITE_SPANS_BODY_LIMIT)),
        )
        .route("/query", post(run_query))
        .fallback(handle_404)
        .layer(CompressionLayer::new())
        .with_state(state)
}

async fn handle_404() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

async fn server_info() -> Json<ServerInfo> {
    Json(ServerInfo::current())
}

async fn server_stats(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let totals = state.store.metrics().access_totals().await?;
    Ok(Json(totals).into_response())
}

fn parse_id(raw: &str) -> Result<SpanId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::bad_request(format!("Failed to parse span id {}: {}", raw, e)))
}

async fn find_span(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    match state.store.find_span(id).await? {
        Some(span) => Ok(Json(span).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct ChildrenParams {
    lim: Option<usize>,
}

async fn find_children(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<ChildrenParams>,
) -> Result<Json<Vec<SpanId>>, ApiError> {
    let id = parse_id(&id)?;
    let limit = params.lim.unwrap_or(DEFAULT_QUERY_LIMIT);
    let children = state.store.find_children(id, limit).await?;
    Ok(Json(children))
}

/// `Option<ConnectInfo<SocketAddr>>` as an extractor, since axum 0.8 removed
/// the blanket `OptionalFromRequestParts` impl for `ConnectInfo`.
struct OptionalConnectInfo(Option<SocketAddr>);

impl<S> FromRequestParts<S> for OptionalConnectInfo
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match ConnectInfo::<SocketAddr>::from_request_parts(parts, state).await {
            Ok(ConnectInfo(addr)) => Ok(OptionalConnectInfo(Some(addr))),
            Err(_) => Ok(OptionalConnectInfo(None)),
        }
    }
}

/// Ingest a batch of newline-delimited span JSON. Individually bad spans are
/// dropped and counted; a body that does not parse at all is a 400.
async fn write_spans(
    State(state): State<ApiState>,
    connect_info: OptionalConnectInfo,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let remote_addr = connect_info
        .0
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let default_tracer_id = headers
        .get(TRACER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let mut ingestor = SpanIngestor::new(&state.store, &remote_addr, default_tracer_id);
    let mut accepted = 0usize;
    for parsed in serde_json::Deserializer::from_str(&body).into_iter::<Span>() {
        let span = match parsed {
            Ok(span) => span,
            Err(e) => {
                ingestor.close(Utc::now()).await;
                return Err(ApiError::bad_request(format!("Error parsing spans: {}", e)));
            }
        };
        match ingestor.ingest(span) {
            Ok(()) => accepted += 1,
            Err(e) if e.is_bad_request() => {
                tracing::debug!(origin = %remote_addr, error = %e, "Dropping bad span");
            }
            Err(e) => {
                ingestor.close(Utc::now()).await;
                return Err(e.into());
            }
        }
    }
    ingestor.close(Utc::now()).await;
    tracing::trace!(origin = %remote_addr, accepted, "writeSpans complete");
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    query: String,
}

async fn run_query(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Vec<Span>>, ApiError> {
    let query: SpanQuery = serde_json::from_str(&params.query)
        .map_err(|e| ApiError::bad_request(format!("Error parsing query: {}", e)))?;
    let (spans, _scanned) = state
        .store
        .handle_query(&query, Some(state.query_timeout))
        .await?;
    Ok(Json(spans))
}
