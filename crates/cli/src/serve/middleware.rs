//! HTTP middleware: rate limiting and API key authentication.

use std::sync::Arc;

use accord_engine::{run_id_from_path, ResolveRequest};
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::state::AppState;

/// Rate limiting middleware. Checks per-IP request rate before routing.
pub(crate) async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let ip = addr.ip();
    match state.rate_limiter.check(ip).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            let body = serde_json::json!({
                "success": false,
                "error": {
                    "code": "rate_limited",
                    "message": "rate limit exceeded",
                    "retry_after": retry_after,
                },
            });
            (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
        }
    }
}

/// Magic token carried on the request, either as the `x-magic-token`
/// header or a `token` query parameter.
fn magic_token_from(request: &Request<axum::body::Body>) -> Option<String> {
    if let Some(token) = request
        .headers()
        .get("x-magic-token")
        .and_then(|v| v.to_str().ok())
    {
        return Some(token.to_string());
    }
    request.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|p| p.strip_prefix("token=").map(|v| v.to_string()))
    })
}

/// API key authentication middleware.
///
/// If an API key is configured, all requests must include either
/// `Authorization: Bearer <key>` or `X-API-Key: <key>`, except /health
/// and requests authenticated by a magic token.
pub(crate) async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let expected_key = match &state.api_key {
        Some(k) => k,
        None => return next.run(request).await, // No auth configured
    };

    // /health is exempt from auth (for load balancer health checks)
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    // Participants authenticate with a magic token instead of the API
    // key; the exemption only holds if the token actually resolves to a
    // participant on the run named in the path. Anything else carrying
    // a token is rejected here, before it can reach a handler.
    if let Some(token) = magic_token_from(&request) {
        let context = state
            .engine
            .resolver()
            .resolve(&ResolveRequest {
                run_id: run_id_from_path(request.uri().path()),
                magic_token: Some(token),
                session_user: None,
            })
            .await;
        if context.participant().is_some() {
            return next.run(request).await;
        }
        return super::json_error(
            StatusCode::UNAUTHORIZED,
            "token_invalid",
            "magic token invalid",
        );
    }

    // Check Authorization: Bearer <key>
    let auth_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    if let Some(auth) = auth_header {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if token == expected_key {
                return next.run(request).await;
            }
            return super::json_error(StatusCode::FORBIDDEN, "forbidden", "invalid API key");
        }
    }

    // Check X-API-Key header
    let api_key_header = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    if let Some(key) = api_key_header {
        if key == expected_key {
            return next.run(request).await;
        }
        return super::json_error(StatusCode::FORBIDDEN, "forbidden", "invalid API key");
    }

    super::json_error(
        StatusCode::UNAUTHORIZED,
        "unauthenticated",
        "authentication required",
    )
}
