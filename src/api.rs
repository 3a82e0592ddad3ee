//! HTTP surface over the interaction engine.
//!
//! Thin mapping from the engine's operations to routes; all queue semantics
//! live in the engine. Consumed by whatever RPC/tool layer fronts the broker.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::InteractionEngine;
use crate::errors::EngineError;
use crate::types::InteractionId;

pub fn router(engine: InteractionEngine) -> Router {
    Router::new()
        .route("/health", routing::get(health))
        .route("/api/interactions", routing::post(start_interaction))
        .route("/api/interactions/{id}", routing::get(interaction_status))
        .route(
            "/api/interactions/{id}/result",
            routing::get(interaction_result),
        )
        .route(
            "/api/interactions/{id}/cancel",
            routing::post(cancel_interaction),
        )
        .route("/api/status", routing::get(engine_status))
        .route("/api/destroy", routing::post(destroy_engine))
        .with_state(engine)
}

type ApiError = (StatusCode, Json<Value>);

fn error_response(err: EngineError) -> ApiError {
    let status = match err {
        EngineError::UnknownInteraction(_) => StatusCode::NOT_FOUND,
        EngineError::Closed | EngineError::Cancelled(_) => StatusCode::CONFLICT,
        EngineError::Launch(_) | EngineError::Delivery(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    input: String,
}

async fn start_interaction(
    State(engine): State<InteractionEngine>,
    Json(req): Json<StartRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = engine.start(&req.input).map_err(error_response)?;
    let state = engine.status(id).map_err(error_response)?;
    Ok(Json(json!({ "id": id, "state": state })))
}

async fn interaction_status(
    State(engine): State<InteractionEngine>,
    Path(id): Path<InteractionId>,
) -> Result<Json<Value>, ApiError> {
    let state = engine.status(id).map_err(error_response)?;
    let started = engine.started(id).map_err(error_response)?;
    Ok(Json(json!({ "id": id, "state": state, "started": started })))
}

/// Long-poll: suspends until the interaction settles. The raw notification
/// document is passed through verbatim as a string.
async fn interaction_result(
    State(engine): State<InteractionEngine>,
    Path(id): Path<InteractionId>,
) -> Result<Json<Value>, ApiError> {
    let raw = engine.await_result(id).await.map_err(error_response)?;
    Ok(Json(json!({ "id": id, "result": raw })))
}

async fn cancel_interaction(
    State(engine): State<InteractionEngine>,
    Path(id): Path<InteractionId>,
) -> Json<Value> {
    let outcome = engine.cancel(id);
    Json(json!({
        "cancelled": outcome.cancelled,
        "was_active": outcome.was_active,
    }))
}

async fn engine_status(
    State(engine): State<InteractionEngine>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = engine.snapshot().await.map_err(error_response)?;
    Ok(Json(
        serde_json::to_value(snapshot).unwrap_or_else(|_| json!({})),
    ))
}

async fn destroy_engine(State(engine): State<InteractionEngine>) -> Json<Value> {
    engine.destroy().await;
    Json(json!({ "closed": true }))
}
