//! Participant & permission resolution.
//!
//! Maps inbound request credentials to a participant context. Resolution
//! order, first match wins:
//!
//! 1. a magic token valid for the run named in the request path;
//! 2. an authenticated session user with a participant row on the run,
//!    otherwise anonymous-with-identity;
//! 3. neither: a fully anonymous context.
//!
//! Permission sets are state-relative, never role-absolute: they are
//! computed fresh per request from `role ∩ current_state.allowed_roles`.
//! A role not permitted in the current state yields an empty set even
//! for an otherwise valid participant.

use std::collections::BTreeSet;
use std::sync::Arc;

use accord_core::{StateDef, Template};
use accord_storage::{CoordinationStore, ParticipantRecord};
use time::OffsetDateTime;

use crate::magic::MagicLinkAuthority;

/// Credentials extracted from an inbound request.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    /// Run id recognized in the request path, if any.
    pub run_id: Option<String>,
    /// `x-magic-token` header or `token` query parameter.
    pub magic_token: Option<String>,
    /// Identity asserted by the external auth provider.
    pub session_user: Option<String>,
}

/// Who the request is acting as.
#[derive(Debug, Clone)]
pub enum ParticipantContext {
    /// A participant row on the run, via token or session.
    Participant(ParticipantRecord),
    /// Authenticated user with no participant row on this run.
    AnonymousIdentified { user_id: String },
    /// No credentials at all; the minimal default (observer) context.
    Anonymous,
}

impl ParticipantContext {
    pub fn participant(&self) -> Option<&ParticipantRecord> {
        match self {
            ParticipantContext::Participant(p) => Some(p),
            _ => None,
        }
    }

    pub fn role(&self) -> Option<&str> {
        self.participant().map(|p| p.role.as_str())
    }
}

/// Capabilities granted to a context in a specific state.
pub type PermissionSet = BTreeSet<String>;

/// The `{role, state} -> PermissionSet` function. Pure; computed per
/// request, never cached on the participant.
pub fn permissions_for(
    context: &ParticipantContext,
    template: &Template,
    state: &StateDef,
) -> PermissionSet {
    let Some(role_name) = context.role() else {
        return PermissionSet::new();
    };
    if !state.allows_role(role_name) {
        return PermissionSet::new();
    }
    template
        .role(role_name)
        .map(|role| role.capabilities.iter().cloned().collect())
        .unwrap_or_default()
}

/// Extract the run id from the request path. Both the short magic-link
/// form `/r/{runId}` and the API form `/coordination/runs/{runId}/...`
/// are recognized.
pub fn run_id_from_path(path: &str) -> Option<String> {
    let mut parts = path.split('/').filter(|s| !s.is_empty());
    match (parts.next(), parts.next(), parts.next()) {
        (Some("r"), Some(id), _) => Some(id.to_string()),
        (Some("coordination"), Some("runs"), Some(id)) => Some(id.to_string()),
        _ => None,
    }
}

pub struct Resolver<S> {
    store: Arc<S>,
    magic: MagicLinkAuthority<S>,
}

impl<S> Clone for Resolver<S> {
    fn clone(&self) -> Self {
        Resolver {
            store: Arc::clone(&self.store),
            magic: self.magic.clone(),
        }
    }
}

impl<S: CoordinationStore> Resolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        let magic = MagicLinkAuthority::new(Arc::clone(&store));
        Resolver { store, magic }
    }

    /// Resolve request credentials to a context. Never fails: a bad
    /// token falls through to the next auth method rather than failing
    /// the request.
    pub async fn resolve(&self, request: &ResolveRequest) -> ParticipantContext {
        if let (Some(run_id), Some(token)) = (&request.run_id, &request.magic_token) {
            match self
                .magic
                .validate(run_id, token, OffsetDateTime::now_utc())
                .await
            {
                Ok(participant) => {
                    // Best-effort activity touch; auth never fails on a
                    // telemetry write.
                    if let Err(e) = self
                        .store
                        .touch_participant(&participant.id, OffsetDateTime::now_utc())
                        .await
                    {
                        tracing::debug!(error = %e, "participant touch failed");
                    }
                    self.magic.maybe_sweep().await;
                    return ParticipantContext::Participant(participant);
                }
                Err(e) => {
                    tracing::debug!(run_id, error = %e, "magic token rejected; falling through");
                }
            }
        }

        if let Some(user_id) = &request.session_user {
            if let Some(run_id) = &request.run_id {
                match self.store.find_participant_by_user(run_id, user_id).await {
                    Ok(Some(participant)) => {
                        return ParticipantContext::Participant(participant)
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(run_id, error = %e, "participant lookup failed");
                    }
                }
            }
            return ParticipantContext::AnonymousIdentified {
                user_id: user_id.clone(),
            };
        }

        ParticipantContext::Anonymous
    }
}
