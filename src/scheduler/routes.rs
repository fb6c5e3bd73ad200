//! Extender HTTP routes
//!
//! The four webhook routes kube-scheduler is configured with, plus a
//! version probe. Every handler answers 200 with a well-formed extender
//! result; engine failures travel in the result's error field (predicate,
//! bind) so the scheduler never sees a half-filled response.

use std::sync::Arc;

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::extender::{
    ExtenderArgs, ExtenderBindingArgs, ExtenderBindingResult, ExtenderPreemptionArgs,
};
use super::PlacementEngine;

/// Build the extender router for a placement engine
pub fn extender_router(engine: Arc<PlacementEngine>) -> Router {
    let predicate_path = format!("/scheduler/predicates/{}", engine.config().predicate_name);
    let priority_path = format!("/scheduler/priorities/{}", engine.config().priority_name);

    Router::new()
        .route(&predicate_path, post(predicate))
        .route(&priority_path, post(prioritize))
        .route("/scheduler/bind", post(bind))
        .route("/scheduler/preemption", post(preemption))
        .route("/version", get(version))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn predicate(
    State(engine): State<Arc<PlacementEngine>>,
    Json(args): Json<ExtenderArgs>,
) -> impl IntoResponse {
    Json(engine.handle_predicate(args).await)
}

async fn prioritize(
    State(engine): State<Arc<PlacementEngine>>,
    Json(args): Json<ExtenderArgs>,
) -> impl IntoResponse {
    match engine.handle_prioritize(args).await {
        Ok(priorities) => Json(priorities).into_response(),
        Err(e) => {
            warn!("prioritize failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn bind(
    State(engine): State<Arc<PlacementEngine>>,
    Json(args): Json<ExtenderBindingArgs>,
) -> impl IntoResponse {
    let result = match engine.handle_bind(&args).await {
        Ok(()) => ExtenderBindingResult { error: None },
        Err(e) => {
            warn!(
                "bind of pod {}/{} to {} failed: {}",
                args.pod_namespace, args.pod_name, args.node, e
            );
            ExtenderBindingResult {
                error: Some(e.to_string()),
            }
        }
    };
    Json(result)
}

async fn preemption(
    State(engine): State<Arc<PlacementEngine>>,
    Json(args): Json<ExtenderPreemptionArgs>,
) -> impl IntoResponse {
    Json(engine.handle_preemption(args))
}

async fn version() -> impl IntoResponse {
    crate::VERSION
}
