//! `accord serve` -- HTTP/WebSocket API for the coordination run engine.
//!
//! Exposes template publishing, run lifecycle, slot writes, participant
//! management, and per-run event rooms as an async HTTP service using
//! `axum` + `tokio`.
//!
//! Security features:
//! - Optional API key authentication via ACCORD_API_KEY (participant
//!   requests carrying a magic token bypass the key)
//! - Per-IP rate limiting (default: 60 req/min, configurable)
//! - CORS headers on all responses (permissive for local dev)
//!
//! Endpoints:
//! - GET  /health                                         - liveness (exempt from auth)
//! - POST /templates                                      - compile + publish a template
//! - GET  /templates/{id}                                 - fetch a published template
//! - POST /coordination/runs                              - instantiate a template
//! - GET  /coordination/runs/{id}                         - run summary
//! - POST /coordination/runs/{id}/advance                 - fire a transition
//! - POST /coordination/runs/{id}/slots                   - write a slot without advancing
//! - GET  /coordination/runs/{id}/states                  - state history with slot values
//! - POST /coordination/runs/{id}/pause|resume|cancel     - status control
//! - POST /coordination/runs/{id}/participants            - add a participant
//! - POST /coordination/runs/{id}/participants/by-email   - add by email invitation
//! - DELETE /coordination/runs/{id}/participants/{pid}    - remove a participant
//! - POST /coordination/runs/{id}/participants/{pid}/magic-link - rotate the link
//! - GET  /coordination/runs/{id}/ws                      - WebSocket room subscription
//!
//! All responses use the `{success, data | error}` envelope with
//! Content-Type: application/json.

mod handlers;
mod middleware;
mod state;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use accord_engine::{Engine, EngineError};
use accord_storage::MemoryStore;
use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{middleware as axum_middleware, Json, Router};
use tower_http::cors::{Any, CorsLayer};

use self::handlers::{
    handle_add_participant, handle_add_participant_by_email, handle_advance, handle_cancel,
    handle_create_run, handle_get_run, handle_get_template, handle_health, handle_list_states,
    handle_not_found, handle_pause, handle_publish_template, handle_remove_participant,
    handle_resume, handle_rotate_magic_link, handle_write_slot,
};
use self::middleware::{auth_middleware, rate_limit_middleware};
use self::state::{AppState, RateLimiter};
use self::ws::handle_ws;

/// Maximum request body size: 2 MB. Slot values are JSON, not uploads.
const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Rate limit window duration in seconds (1 minute).
const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Success envelope.
pub(crate) fn json_ok(data: serde_json::Value) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "data": data})),
    )
        .into_response()
}

/// Error envelope with a stable machine-readable code.
pub(crate) fn json_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": {"code": code, "message": message},
        })),
    )
        .into_response()
}

/// Map an engine error onto the envelope, carrying the recoverable flag
/// and, for validation failures, the per-field issue list.
pub(crate) fn engine_error(e: EngineError) -> Response {
    let status = match &e {
        EngineError::Validation(_)
        | EngineError::IncompleteSlots { .. }
        | EngineError::AmbiguousTransition { .. }
        | EngineError::ParticipantLimit { .. }
        | EngineError::SlotRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Forbidden { .. } => StatusCode::FORBIDDEN,
        EngineError::TokenInvalid | EngineError::TokenExpired => StatusCode::UNAUTHORIZED,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::RunNotActive { .. }
        | EngineError::IllegalTransition { .. }
        | EngineError::Conflict { .. }
        | EngineError::StateSealed { .. } => StatusCode::CONFLICT,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut error = serde_json::json!({
        "code": e.code(),
        "message": e.to_string(),
        "recoverable": e.recoverable(),
    });
    if let EngineError::Validation(v) = &e {
        error["issues"] = serde_json::json!(v.issues);
    }
    if let EngineError::IncompleteSlots { missing, .. } = &e {
        error["missing"] = serde_json::json!(missing);
    }
    if let EngineError::AmbiguousTransition { candidates, .. } = &e {
        error["candidates"] = serde_json::json!(candidates);
    }
    (
        status,
        Json(serde_json::json!({"success": false, "error": error})),
    )
        .into_response()
}

/// Start the HTTP server on the given port, optionally pre-publishing
/// templates.
pub async fn start_server(
    port: u16,
    api_key: Option<String>,
    rate_limit: u64,
    template_paths: Vec<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::new(Arc::new(MemoryStore::new()));

    for path in &template_paths {
        match publish_from_file(&engine, path).await {
            Ok(record) => tracing::info!(
                template_id = %record.id,
                name = %record.template.name,
                path = %path.display(),
                "template loaded"
            ),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to load template"),
        }
    }

    let api_key = api_key.filter(|k| !k.is_empty());
    if api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }
    tracing::info!(rate_limit, "rate limit per IP per minute");

    let state = Arc::new(AppState {
        engine,
        rate_limiter: RateLimiter::new(rate_limit),
        api_key,
    });

    // CORS: permissive for local dev.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/templates", post(handle_publish_template))
        .route("/templates/{id}", get(handle_get_template))
        .route("/coordination/runs", post(handle_create_run))
        .route("/coordination/runs/{run_id}", get(handle_get_run))
        .route("/coordination/runs/{run_id}/advance", post(handle_advance))
        .route("/coordination/runs/{run_id}/slots", post(handle_write_slot))
        .route("/coordination/runs/{run_id}/states", get(handle_list_states))
        .route("/coordination/runs/{run_id}/pause", post(handle_pause))
        .route("/coordination/runs/{run_id}/resume", post(handle_resume))
        .route("/coordination/runs/{run_id}/cancel", post(handle_cancel))
        .route(
            "/coordination/runs/{run_id}/participants",
            post(handle_add_participant),
        )
        .route(
            "/coordination/runs/{run_id}/participants/by-email",
            post(handle_add_participant_by_email),
        )
        .route(
            "/coordination/runs/{run_id}/participants/{participant_id}",
            delete(handle_remove_participant),
        )
        .route(
            "/coordination/runs/{run_id}/participants/{participant_id}/magic-link",
            post(handle_rotate_magic_link),
        )
        .route("/coordination/runs/{run_id}/ws", get(handle_ws))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "accord listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server shut down");
    Ok(())
}

async fn publish_from_file(
    engine: &Engine<MemoryStore>,
    path: &PathBuf,
) -> Result<accord_storage::TemplateRecord, Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let doc: serde_json::Value = serde_json::from_str(&raw)?;
    Ok(engine.publish_template(&doc).await?)
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    tracing::info!("received shutdown signal");
}
