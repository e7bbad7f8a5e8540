//! HTTP route handlers for templates, runs, slots, and participants.

use std::collections::HashMap;
use std::sync::Arc;

use accord_engine::{
    IssuedParticipant, NewParticipant, ParticipantContext, ParticipantView, ResolveRequest,
};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;

use super::state::AppState;
use super::{engine_error, json_error, json_ok};

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "not_found", "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> Response {
    json_ok(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Auth context helpers ─────────────────────────────────────────────────

/// Magic token from the `x-magic-token` header or `token` query param.
fn magic_token(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    headers
        .get("x-magic-token")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| query.get("token").cloned())
}

/// Resolve the caller's participant context for a run-scoped request.
async fn resolve_context(
    state: &AppState,
    run_id: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> ParticipantContext {
    let session_user = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    state
        .engine
        .resolver()
        .resolve(&ResolveRequest {
            run_id: Some(run_id.to_string()),
            magic_token: magic_token(headers, query),
            session_user,
        })
        .await
}

/// When the caller authenticated as a participant, its id must match the
/// `participantId` the request claims to act as.
fn check_acting_participant(context: &ParticipantContext, claimed: &str) -> Result<(), Response> {
    if let ParticipantContext::Participant(p) = context {
        if p.id != claimed {
            return Err(json_error(
                StatusCode::FORBIDDEN,
                "forbidden",
                "magic token does not belong to the acting participant",
            ));
        }
    }
    Ok(())
}

fn issued_participant_json(run_id: &str, issued: &IssuedParticipant) -> serde_json::Value {
    serde_json::json!({
        "participant": ParticipantView::from(issued.participant.clone()),
        "magicToken": issued.magic_token,
        "magicLink": format!("/r/{}?token={}", run_id, issued.magic_token),
        "expiresAt": issued.expires_at.format(&Rfc3339).ok(),
    })
}

// ── Templates ────────────────────────────────────────────────────────────

/// POST /templates
pub(crate) async fn handle_publish_template(
    State(state): State<Arc<AppState>>,
    Json(doc): Json<serde_json::Value>,
) -> Response {
    match state.engine.publish_template(&doc).await {
        Ok(record) => json_ok(serde_json::json!({
            "template_id": record.id,
            "name": record.template.name,
            "version": record.template.version,
        })),
        Err(e) => engine_error(e),
    }
}

/// GET /templates/{id}
pub(crate) async fn handle_get_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.get_template(&id).await {
        Ok(record) => json_ok(serde_json::json!(record)),
        Err(e) => engine_error(e),
    }
}

// ── Runs ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewParticipantRequest {
    role: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl From<NewParticipantRequest> for NewParticipant {
    fn from(r: NewParticipantRequest) -> Self {
        NewParticipant {
            role: r.role,
            user_id: r.user_id,
            email: r.email,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateRunRequest {
    template_id: String,
    #[serde(default)]
    participants: Vec<NewParticipantRequest>,
}

/// POST /coordination/runs
pub(crate) async fn handle_create_run(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRunRequest>,
) -> Response {
    let participants = body.participants.into_iter().map(Into::into).collect();
    match state
        .engine
        .create_run(&body.template_id, participants)
        .await
    {
        Ok(created) => {
            let issued: Vec<serde_json::Value> = created
                .participants
                .iter()
                .map(|p| issued_participant_json(&created.run.id, p))
                .collect();
            json_ok(serde_json::json!({
                "run": created.run,
                "participants": issued,
            }))
        }
        Err(e) => engine_error(e),
    }
}

/// GET /coordination/runs/{run_id}
pub(crate) async fn handle_get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.engine.run_view(&run_id).await {
        Ok(view) => json_ok(serde_json::json!(view)),
        Err(e) => engine_error(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AdvanceRequest {
    participant_id: String,
    #[serde(default)]
    target_state: Option<String>,
    #[serde(default)]
    slot_data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// POST /coordination/runs/{run_id}/advance
pub(crate) async fn handle_advance(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<AdvanceRequest>,
) -> Response {
    let context = resolve_context(&state, &run_id, &headers, &query).await;
    if let Err(resp) = check_acting_participant(&context, &body.participant_id) {
        return resp;
    }
    match state
        .engine
        .advance(
            &run_id,
            &body.participant_id,
            body.target_state.as_deref(),
            body.slot_data.as_ref(),
        )
        .await
    {
        Ok(outcome) => json_ok(serde_json::json!(outcome)),
        Err(e) => engine_error(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WriteSlotRequest {
    participant_id: String,
    slot: String,
    value: serde_json::Value,
}

/// POST /coordination/runs/{run_id}/slots
pub(crate) async fn handle_write_slot(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<WriteSlotRequest>,
) -> Response {
    let context = resolve_context(&state, &run_id, &headers, &query).await;
    if let Err(resp) = check_acting_participant(&context, &body.participant_id) {
        return resp;
    }
    let mut entries = serde_json::Map::new();
    entries.insert(body.slot.clone(), body.value);
    if let Err(e) = state
        .engine
        .write_slots(&run_id, &body.participant_id, &entries)
        .await
    {
        return engine_error(e);
    }
    match state.engine.is_complete(&run_id).await {
        Ok(complete) => json_ok(serde_json::json!({
            "slot": body.slot,
            "complete": complete,
        })),
        Err(e) => engine_error(e),
    }
}

/// GET /coordination/runs/{run_id}/states
///
/// Slot values are filtered by the viewer's role; a caller without a
/// participant context sees only unrestricted slots.
pub(crate) async fn handle_list_states(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let context = resolve_context(&state, &run_id, &headers, &query).await;
    let role = context.role().map(|r| r.to_string());
    match state.engine.history(&run_id, role.as_deref()).await {
        Ok(entries) => json_ok(serde_json::json!({ "states": entries })),
        Err(e) => engine_error(e),
    }
}

// ── Status control ───────────────────────────────────────────────────────

/// POST /coordination/runs/{run_id}/pause
pub(crate) async fn handle_pause(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.engine.pause(&run_id).await {
        Ok(run) => json_ok(serde_json::json!({ "run": run })),
        Err(e) => engine_error(e),
    }
}

/// POST /coordination/runs/{run_id}/resume
pub(crate) async fn handle_resume(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.engine.resume(&run_id).await {
        Ok(run) => json_ok(serde_json::json!({ "run": run })),
        Err(e) => engine_error(e),
    }
}

/// POST /coordination/runs/{run_id}/cancel
pub(crate) async fn handle_cancel(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.engine.cancel(&run_id).await {
        Ok(run) => json_ok(serde_json::json!({ "run": run })),
        Err(e) => engine_error(e),
    }
}

// ── Participants ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AddParticipantRequest {
    role: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, alias = "ttlHours")]
    expiration_hours: Option<i64>,
}

/// POST /coordination/runs/{run_id}/participants
pub(crate) async fn handle_add_participant(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(body): Json<AddParticipantRequest>,
) -> Response {
    let new = NewParticipant {
        role: body.role,
        user_id: body.user_id,
        email: body.email,
    };
    match state
        .engine
        .add_participant(&run_id, new, body.expiration_hours)
        .await
    {
        Ok(issued) => json_ok(issued_participant_json(&run_id, &issued)),
        Err(e) => engine_error(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AddByEmailRequest {
    role: String,
    email: String,
    #[serde(default, alias = "ttlHours")]
    expiration_hours: Option<i64>,
}

/// POST /coordination/runs/{run_id}/participants/by-email
///
/// Same as the plain add, but the email address is mandatory; the
/// returned magic link is what an invitation mail would carry.
pub(crate) async fn handle_add_participant_by_email(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(body): Json<AddByEmailRequest>,
) -> Response {
    let new = NewParticipant {
        role: body.role,
        user_id: None,
        email: Some(body.email),
    };
    match state
        .engine
        .add_participant(&run_id, new, body.expiration_hours)
        .await
    {
        Ok(issued) => json_ok(issued_participant_json(&run_id, &issued)),
        Err(e) => engine_error(e),
    }
}

/// DELETE /coordination/runs/{run_id}/participants/{participant_id}
pub(crate) async fn handle_remove_participant(
    State(state): State<Arc<AppState>>,
    Path((run_id, participant_id)): Path<(String, String)>,
) -> Response {
    match state
        .engine
        .remove_participant(&run_id, &participant_id)
        .await
    {
        Ok(()) => json_ok(serde_json::json!({ "removed": participant_id })),
        Err(e) => engine_error(e),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RotateLinkRequest {
    #[serde(default, alias = "ttlHours")]
    expiration_hours: Option<i64>,
}

/// POST /coordination/runs/{run_id}/participants/{participant_id}/magic-link
pub(crate) async fn handle_rotate_magic_link(
    State(state): State<Arc<AppState>>,
    Path((run_id, participant_id)): Path<(String, String)>,
    body: Option<Json<RotateLinkRequest>>,
) -> Response {
    let expiration_hours = body.and_then(|Json(b)| b.expiration_hours);
    match state
        .engine
        .rotate_magic_link(&run_id, &participant_id, expiration_hours)
        .await
    {
        Ok(issued) => json_ok(serde_json::json!({
            "magicToken": issued.token,
            "magicLink": format!("/r/{}?token={}", run_id, issued.token),
            "expiresAt": issued.expires_at.format(&Rfc3339).ok(),
        })),
        Err(e) => engine_error(e),
    }
}
