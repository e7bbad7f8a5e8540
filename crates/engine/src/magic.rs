//! Magic link authority: single-use bearer credentials scoped to one
//! participant on one run.
//!
//! Tokens are opaque random strings, not signed or structured. Validity
//! is a store lookup plus an expiry comparison, so revocation is
//! immediate. Rotation is one atomic update of `(token, expiry)` --
//! there is never a window with two valid tokens for one participant.
//!
//! The stale-token sweep is a named, independently callable operation.
//! The resolver triggers it probabilistically on token traffic, which
//! keeps the hygiene pass scheduler-free; the real security boundary is
//! the expiry check at validation time, not the sweep.

use std::sync::Arc;

use accord_storage::{CoordinationStore, ParticipantRecord};
use rand::Rng;
use time::{Duration, OffsetDateTime};

use crate::error::EngineError;
use crate::ids::generate_token;

/// Default magic-link lifetime when the caller does not specify one.
pub const DEFAULT_TTL_HOURS: i64 = 72;

/// Tokens of participants inactive this long are cleared by the sweep.
pub const RETENTION_DAYS: i64 = 7;

/// One sweep per this many token resolutions, on average.
const SWEEP_DENOMINATOR: u32 = 64;

/// A freshly issued token and its expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

pub struct MagicLinkAuthority<S> {
    store: Arc<S>,
}

impl<S> Clone for MagicLinkAuthority<S> {
    fn clone(&self) -> Self {
        MagicLinkAuthority {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: CoordinationStore> MagicLinkAuthority<S> {
    pub fn new(store: Arc<S>) -> Self {
        MagicLinkAuthority { store }
    }

    /// Issue a new token for a participant, invalidating any previous
    /// one. The participant must belong to the given run.
    pub async fn issue(
        &self,
        run_id: &str,
        participant_id: &str,
        ttl_hours: i64,
    ) -> Result<IssuedToken, EngineError> {
        let participant = self.store.get_participant(participant_id).await?;
        if participant.run_id != run_id {
            return Err(EngineError::NotFound {
                kind: "participant",
                id: participant_id.to_string(),
            });
        }
        let token = generate_token();
        let expires_at = OffsetDateTime::now_utc() + Duration::hours(ttl_hours.max(0));
        self.store
            .set_magic_token(participant_id, Some(token.clone()), Some(expires_at))
            .await?;
        tracing::info!(run_id, participant_id, %expires_at, "magic token issued");
        Ok(IssuedToken { token, expires_at })
    }

    /// Resolve a token to its participant. `TokenInvalid` when no
    /// participant on this run carries the token, `TokenExpired` when
    /// one does but its expiry has passed.
    pub async fn validate(
        &self,
        run_id: &str,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<ParticipantRecord, EngineError> {
        let participant = self
            .store
            .find_participant_by_token(run_id, token)
            .await?
            .ok_or(EngineError::TokenInvalid)?;
        match participant.token_expires_at {
            Some(expires_at) if expires_at > now => Ok(participant),
            _ => Err(EngineError::TokenExpired),
        }
    }

    /// Revoke a participant's token immediately.
    pub async fn revoke_all(
        &self,
        run_id: &str,
        participant_id: &str,
    ) -> Result<(), EngineError> {
        let participant = self.store.get_participant(participant_id).await?;
        if participant.run_id != run_id {
            return Err(EngineError::NotFound {
                kind: "participant",
                id: participant_id.to_string(),
            });
        }
        self.store.set_magic_token(participant_id, None, None).await?;
        tracing::info!(run_id, participant_id, "magic token revoked");
        Ok(())
    }

    /// Clear tokens of participants inactive for [`RETENTION_DAYS`].
    /// Best-effort hygiene, not a security boundary.
    pub async fn sweep_stale_tokens(&self, now: OffsetDateTime) -> Result<usize, EngineError> {
        let cutoff = now - Duration::days(RETENTION_DAYS);
        let cleared = self.store.clear_stale_tokens(cutoff).await?;
        if cleared > 0 {
            tracing::info!(cleared, "stale magic tokens swept");
        }
        Ok(cleared)
    }

    /// Probabilistic sweep trigger, called on resolver traffic. Failures
    /// are logged and swallowed; auth must never fail on hygiene work.
    pub async fn maybe_sweep(&self) {
        if rand::thread_rng().gen_range(0..SWEEP_DENOMINATOR) != 0 {
            return;
        }
        if let Err(e) = self.sweep_stale_tokens(OffsetDateTime::now_utc()).await {
            tracing::warn!(error = %e, "stale-token sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_storage::{MemoryStore, RunRecord, RunStatus};

    async fn seed(store: &MemoryStore) {
        let now = OffsetDateTime::now_utc();
        let mut snap = store.begin_snapshot().await.unwrap();
        store
            .insert_run(
                &mut snap,
                RunRecord {
                    id: "r1".to_string(),
                    template_id: "t1".to_string(),
                    current_state: "collect".to_string(),
                    status: RunStatus::Active,
                    version: 0,
                    started_at: now,
                    completed_at: None,
                },
            )
            .await
            .unwrap();
        store
            .insert_participant(
                &mut snap,
                ParticipantRecord {
                    id: "p1".to_string(),
                    run_id: "r1".to_string(),
                    role: "requester".to_string(),
                    user_id: None,
                    email: None,
                    magic_token: None,
                    token_expires_at: None,
                    last_active_at: now,
                },
            )
            .await
            .unwrap();
        store.commit_snapshot(snap).await.unwrap();
    }

    #[tokio::test]
    async fn issue_validate_round_trip() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let authority = MagicLinkAuthority::new(Arc::clone(&store));

        let issued = authority.issue("r1", "p1", 24).await.unwrap();
        let now = OffsetDateTime::now_utc();
        let resolved = authority.validate("r1", &issued.token, now).await.unwrap();
        assert_eq!(resolved.id, "p1");

        // Wrong run: token is scoped to r1 only.
        assert!(matches!(
            authority.validate("r2", &issued.token, now).await,
            Err(EngineError::TokenInvalid)
        ));
    }

    #[tokio::test]
    async fn rotation_invalidates_previous_token() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let authority = MagicLinkAuthority::new(Arc::clone(&store));

        let first = authority.issue("r1", "p1", 24).await.unwrap();
        let second = authority.issue("r1", "p1", 24).await.unwrap();
        assert_ne!(first.token, second.token);

        let now = OffsetDateTime::now_utc();
        assert!(matches!(
            authority.validate("r1", &first.token, now).await,
            Err(EngineError::TokenInvalid)
        ));
        assert!(authority.validate("r1", &second.token, now).await.is_ok());
    }

    #[tokio::test]
    async fn expired_token_never_resolves() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let authority = MagicLinkAuthority::new(Arc::clone(&store));

        let issued = authority.issue("r1", "p1", 1).await.unwrap();
        let later = issued.expires_at + Duration::minutes(1);
        assert!(matches!(
            authority.validate("r1", &issued.token, later).await,
            Err(EngineError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn revoke_clears_immediately() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let authority = MagicLinkAuthority::new(Arc::clone(&store));

        let issued = authority.issue("r1", "p1", 24).await.unwrap();
        authority.revoke_all("r1", "p1").await.unwrap();
        assert!(matches!(
            authority
                .validate("r1", &issued.token, OffsetDateTime::now_utc())
                .await,
            Err(EngineError::TokenInvalid)
        ));
    }
}
