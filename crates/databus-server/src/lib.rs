//! HTTP adapter for the databus.
//!
//! Every route maps one-to-one onto a [`databus_core::Databus`] operation.
//! Handlers live in [`api`]; this module only owns the shared state and the
//! router.

pub mod api;
pub mod background;
pub mod config;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use databus_core::{Databus, MutationSink};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The delivery core.
    pub bus: Databus,
    /// Ingress for change-feed mutations.
    pub sink: MutationSink,
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bus/1", get(api::list_subscriptions_handler))
        .route("/bus/1/_move", post(api::move_handler))
        .route("/bus/1/_move/{id}", get(api::move_status_handler))
        .route("/bus/1/_replay/{id}", get(api::replay_status_handler))
        .route("/bus/1/_mutation", post(api::mutation_handler))
        .route(
            "/bus/1/{subscription}",
            get(api::get_subscription_handler)
                .put(api::subscribe_handler)
                .delete(api::unsubscribe_handler),
        )
        .route("/bus/1/{subscription}/size", get(api::size_handler))
        .route(
            "/bus/1/{subscription}/claimcount",
            get(api::claim_count_handler),
        )
        .route("/bus/1/{subscription}/peek", get(api::peek_handler))
        .route("/bus/1/{subscription}/poll", get(api::poll_handler))
        .route("/bus/1/{subscription}/renew", post(api::renew_handler))
        .route("/bus/1/{subscription}/ack", post(api::acknowledge_handler))
        .route("/bus/1/{subscription}/replay", post(api::replay_handler))
        .route("/bus/1/{subscription}/inject", post(api::inject_handler))
        .route(
            "/bus/1/{subscription}/unclaimall",
            post(api::unclaim_all_handler),
        )
        .route("/bus/1/{subscription}/purge", post(api::purge_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
