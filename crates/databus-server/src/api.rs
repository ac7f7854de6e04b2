//! HTTP handlers for the `/bus/1` resource.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use databus_core::{BusError, PollOptions, SubscribeParams};
use databus_types::{
    EventView, MoveStatus, Mutation, ReplayStatus, Subscription, DEFAULT_CLAIM_TTL_SECS,
    DEFAULT_EVENT_TTL_SECS, DEFAULT_LIMIT, DEFAULT_SUBSCRIPTION_TTL_SECS,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::AppState;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<BusError> for ApiError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::UnknownSubscription(_) | BusError::UnknownJob(_) => {
                ApiError::NotFound(e.to_string())
            }
            BusError::InvalidCondition(_)
            | BusError::MissingParameter(_)
            | BusError::InvalidParameter(_)
            | BusError::ReplayWindowExceeded { .. } => ApiError::BadRequest(e.to_string()),
            BusError::StorageUnavailable(_) => {
                tracing::warn!(error = %e, "storage unavailable");
                ApiError::ServiceUnavailable(e.to_string())
            }
            BusError::Storage(_)
            | BusError::Serialization(_)
            | BusError::Task(_) => {
                tracing::error!(error = %e, "request failed");
                ApiError::InternalServerError(e.to_string())
            }
        }
    }
}

fn success() -> Json<Value> {
    Json(json!({ "success": true }))
}

/// Parses an optional JSON array of event keys. An empty body means the
/// keys were not supplied at all.
fn event_keys(body: &Bytes) -> Result<Option<Vec<String>>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::BadRequest(format!("expected a JSON array of event keys: {e}")))
}

/// Response body carrying a new job id.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobAccepted {
    pub id: String,
}

/// Query for `GET /bus/1`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub from: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// Query for `PUT /bus/1/{subscription}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeQuery {
    #[serde(default = "default_subscription_ttl")]
    pub ttl: u64,
    #[serde(default = "default_event_ttl")]
    pub event_ttl: u64,
    #[serde(default = "default_true")]
    pub ignore_suppressed_events: bool,
}

/// Query for `GET /bus/1/{subscription}/size`.
#[derive(Debug, Deserialize)]
pub struct SizeQuery {
    pub limit: Option<u64>,
}

/// Query for `GET /bus/1/{subscription}/peek`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeekQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub include_tags: bool,
}

/// Query for `GET /bus/1/{subscription}/poll`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    #[serde(default = "default_claim_ttl")]
    pub ttl: u64,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub ignore_long_poll: bool,
    #[serde(default)]
    pub include_tags: bool,
}

/// Query for `POST /bus/1/{subscription}/renew`.
#[derive(Debug, Deserialize)]
pub struct RenewQuery {
    #[serde(default = "default_claim_ttl")]
    pub ttl: u64,
}

/// Query for `POST /bus/1/{subscription}/replay`.
#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    pub since: Option<DateTime<Utc>>,
}

/// Query for `POST /bus/1/_move`.
#[derive(Debug, Deserialize)]
pub struct MoveQuery {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

/// Query for `POST /bus/1/{subscription}/inject`.
#[derive(Debug, Deserialize)]
pub struct InjectQuery {
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub key: String,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_subscription_ttl() -> u64 {
    DEFAULT_SUBSCRIPTION_TTL_SECS
}

fn default_event_ttl() -> u64 {
    DEFAULT_EVENT_TTL_SECS
}

fn default_claim_ttl() -> u64 {
    DEFAULT_CLAIM_TTL_SECS
}

fn default_true() -> bool {
    true
}

/// Handler for `GET /bus/1`.
pub async fn list_subscriptions_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Subscription>>, ApiError> {
    let subscriptions = state.bus.list_subscriptions(query.from, query.limit)?;
    let page = tokio::task::spawn_blocking(move || subscriptions.collect::<Result<Vec<_>, _>>())
        .await
        .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))??;
    Ok(Json(page))
}

/// Handler for `PUT /bus/1/{subscription}`. The body is the condition text.
pub async fn subscribe_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
    Query(query): Query<SubscribeQuery>,
    condition: String,
) -> Result<Json<Value>, ApiError> {
    let params = SubscribeParams {
        name: subscription,
        condition,
        subscription_ttl_secs: query.ttl,
        event_ttl_secs: query.event_ttl,
        ignore_suppressed_events: query.ignore_suppressed_events,
    };
    state.bus.subscribe(params).await?;
    Ok(success())
}

/// Handler for `DELETE /bus/1/{subscription}`.
pub async fn unsubscribe_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.bus.unsubscribe(&subscription).await?;
    Ok(success())
}

/// Handler for `GET /bus/1/{subscription}`.
pub async fn get_subscription_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
) -> Result<Json<Subscription>, ApiError> {
    Ok(Json(state.bus.get_subscription(&subscription).await?))
}

/// Handler for `GET /bus/1/{subscription}/size`.
pub async fn size_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
    Query(query): Query<SizeQuery>,
) -> Result<Json<u64>, ApiError> {
    let count = match query.limit {
        Some(limit) => state.bus.event_count_up_to(&subscription, limit).await?,
        None => state.bus.event_count(&subscription).await?,
    };
    Ok(Json(count))
}

/// Handler for `GET /bus/1/{subscription}/claimcount`.
pub async fn claim_count_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
) -> Result<Json<u64>, ApiError> {
    Ok(Json(state.bus.claim_count(&subscription).await?))
}

/// Handler for `GET /bus/1/{subscription}/peek`.
pub async fn peek_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
    Query(query): Query<PeekQuery>,
) -> Result<Json<Vec<EventView>>, ApiError> {
    let events = state.bus.peek(&subscription, query.limit).await?;
    Ok(Json(
        events.iter().map(|e| e.view(query.include_tags)).collect(),
    ))
}

/// Handler for `GET /bus/1/{subscription}/poll`.
pub async fn poll_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Vec<EventView>>, ApiError> {
    let options = PollOptions {
        claim_ttl_secs: query.ttl,
        limit: query.limit,
        ignore_long_poll: query.ignore_long_poll,
        max_wait: None,
    };
    let events = state.bus.poll(&subscription, options).await?;
    Ok(Json(
        events.iter().map(|e| e.view(query.include_tags)).collect(),
    ))
}

/// Handler for `POST /bus/1/{subscription}/renew`.
pub async fn renew_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
    Query(query): Query<RenewQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let keys = event_keys(&body)?.ok_or(BusError::MissingParameter("eventKeys"))?;
    state.bus.renew(&subscription, keys, query.ttl).await?;
    Ok(success())
}

/// Handler for `POST /bus/1/{subscription}/ack`.
pub async fn acknowledge_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let keys = event_keys(&body)?;
    state.bus.acknowledge(&subscription, keys).await?;
    Ok(success())
}

/// Handler for `POST /bus/1/{subscription}/replay`.
pub async fn replay_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> Result<Json<JobAccepted>, ApiError> {
    let id = state
        .bus
        .replay_async_since(&subscription, query.since)
        .await?;
    Ok(Json(JobAccepted { id }))
}

/// Handler for `GET /bus/1/_replay/{id}`.
pub async fn replay_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ReplayStatus>, ApiError> {
    Ok(Json(state.bus.get_replay_status(&id).await?))
}

/// Handler for `POST /bus/1/_move`.
pub async fn move_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<MoveQuery>,
) -> Result<Json<JobAccepted>, ApiError> {
    let id = state.bus.move_async(&query.from, &query.to).await?;
    Ok(Json(JobAccepted { id }))
}

/// Handler for `GET /bus/1/_move/{id}`.
pub async fn move_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MoveStatus>, ApiError> {
    Ok(Json(state.bus.get_move_status(&id).await?))
}

/// Handler for `POST /bus/1/{subscription}/inject`.
pub async fn inject_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
    Query(query): Query<InjectQuery>,
) -> Result<Json<Value>, ApiError> {
    state
        .bus
        .inject_event(&subscription, &query.table, &query.key)
        .await?;
    Ok(success())
}

/// Handler for `POST /bus/1/{subscription}/unclaimall`.
pub async fn unclaim_all_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.bus.unclaim_all(&subscription).await?;
    Ok(success())
}

/// Handler for `POST /bus/1/{subscription}/purge`.
pub async fn purge_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscription): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.bus.purge(&subscription).await?;
    Ok(success())
}

/// Handler for `POST /bus/1/_mutation`: change-feed ingress.
pub async fn mutation_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(mutation): Json<Mutation>,
) -> Result<Json<Value>, ApiError> {
    if mutation.table.is_empty() || mutation.key.is_empty() {
        return Err(ApiError::BadRequest(
            "mutation requires a table and a key".to_string(),
        ));
    }
    if !state.sink.send(mutation) {
        return Err(ApiError::ServiceUnavailable(
            "mutation intake is shut down".to_string(),
        ));
    }
    Ok(success())
}
