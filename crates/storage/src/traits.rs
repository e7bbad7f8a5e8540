use accord_core::TemplateKey;
use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    ParticipantRecord, RunRecord, RunStateRecord, RunStatus, SlotValueRecord, TemplateRecord,
};

/// The storage trait accord execution backends implement.
///
/// ## Snapshot semantics
///
/// Mutations on the run row and the state history take
/// `&mut Self::Snapshot`, an in-progress transaction:
///
/// 1. `begin_snapshot()` — start a transaction
/// 2. call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)` — make the mutations durable,
///    OR `abort_snapshot(snapshot)` — discard them
///
/// A snapshot dropped without committing MUST roll back.
///
/// ## OCC conflict detection
///
/// `update_run_state` / `update_run_status` are conditional on
/// `version = expected_version` (the relational shape is
/// `UPDATE ... WHERE id = ? AND version = ?`). When the condition fails
/// — at update time or at commit, backend's choice — the transaction
/// surfaces `StorageError::ConcurrentConflict` and no staged mutation
/// survives. The run row is the unit of mutual exclusion: transactions
/// on different runs never contend.
///
/// ## Token atomicity
///
/// `set_magic_token` writes token and expiry in one atomic update,
/// outside any snapshot, so rotation never leaves a window with two
/// valid tokens for one participant.
///
/// Implementations must be `Send + Sync + 'static` for use in axum
/// application state and across task boundaries.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// The snapshot (transaction) type of this backend. Must be `Send`.
    type Snapshot: Send;

    // ── Snapshot lifecycle ───────────────────────────────────────────────

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Templates ────────────────────────────────────────────────────────

    /// Upsert a template by `(space_id, name, version)`. When the key is
    /// already published, the row is replaced in place and keeps its id,
    /// so runs referencing it stay valid. Returns the stored record.
    async fn put_template(&self, record: TemplateRecord) -> Result<TemplateRecord, StorageError>;

    async fn get_template(&self, template_id: &str) -> Result<TemplateRecord, StorageError>;

    async fn find_template(&self, key: &TemplateKey) -> Result<Option<TemplateRecord>, StorageError>;

    // ── Runs (within snapshot) ───────────────────────────────────────────

    async fn insert_run(
        &self,
        snapshot: &mut Self::Snapshot,
        record: RunRecord,
    ) -> Result<(), StorageError>;

    /// Read the run row for update (`SELECT ... FOR UPDATE` semantics, or
    /// an OCC guard re-verified at commit).
    async fn get_run_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        run_id: &str,
    ) -> Result<RunRecord, StorageError>;

    /// Move the run's current-state pointer, conditional on
    /// `version = expected_version`. Returns the new version.
    async fn update_run_state(
        &self,
        snapshot: &mut Self::Snapshot,
        run_id: &str,
        expected_version: i64,
        new_state: &str,
    ) -> Result<i64, StorageError>;

    /// Change the run's status, conditional on `version = expected_version`.
    /// Returns the new version.
    async fn update_run_status(
        &self,
        snapshot: &mut Self::Snapshot,
        run_id: &str,
        expected_version: i64,
        status: RunStatus,
        completed_at: Option<OffsetDateTime>,
    ) -> Result<i64, StorageError>;

    // ── Run-state history (within snapshot) ──────────────────────────────

    /// Append an open history row. History rows are never deleted.
    async fn insert_run_state(
        &self,
        snapshot: &mut Self::Snapshot,
        record: RunStateRecord,
    ) -> Result<(), StorageError>;

    /// Seal a history row (`exited_at = now`). Sealing an already-sealed
    /// row is `StateSealed`.
    async fn seal_run_state(
        &self,
        snapshot: &mut Self::Snapshot,
        run_state_id: &str,
        exited_at: OffsetDateTime,
    ) -> Result<(), StorageError>;

    // ── Slot values (within snapshot) ────────────────────────────────────

    /// Last-writer-wins upsert keyed by `(run_state_id, slot)`. Rejected
    /// with `StateSealed` once the row is sealed; concurrent writes to
    /// sibling slots must both survive.
    async fn upsert_slot_value(
        &self,
        snapshot: &mut Self::Snapshot,
        record: SlotValueRecord,
    ) -> Result<(), StorageError>;

    // ── Participants ─────────────────────────────────────────────────────

    async fn insert_participant(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ParticipantRecord,
    ) -> Result<(), StorageError>;

    async fn delete_participant(
        &self,
        snapshot: &mut Self::Snapshot,
        participant_id: &str,
    ) -> Result<(), StorageError>;

    /// Atomic single update of `(magic_token, token_expires_at)`.
    /// `None` revokes.
    async fn set_magic_token(
        &self,
        participant_id: &str,
        token: Option<String>,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<(), StorageError>;

    /// Best-effort activity timestamp update.
    async fn touch_participant(
        &self,
        participant_id: &str,
        at: OffsetDateTime,
    ) -> Result<(), StorageError>;

    /// Null out tokens whose participant has been inactive since before
    /// `cutoff`. Returns the number of tokens cleared.
    async fn clear_stale_tokens(&self, cutoff: OffsetDateTime) -> Result<usize, StorageError>;

    // ── Queries (outside snapshot) ───────────────────────────────────────

    async fn get_run(&self, run_id: &str) -> Result<RunRecord, StorageError>;

    /// The single history row with `exited_at = None`.
    async fn open_run_state(&self, run_id: &str) -> Result<RunStateRecord, StorageError>;

    /// Full history, sealed and open, in entry order.
    async fn list_run_states(&self, run_id: &str) -> Result<Vec<RunStateRecord>, StorageError>;

    async fn list_slot_values(
        &self,
        run_state_id: &str,
    ) -> Result<Vec<SlotValueRecord>, StorageError>;

    async fn get_participant(
        &self,
        participant_id: &str,
    ) -> Result<ParticipantRecord, StorageError>;

    async fn list_participants(
        &self,
        run_id: &str,
    ) -> Result<Vec<ParticipantRecord>, StorageError>;

    async fn find_participant_by_token(
        &self,
        run_id: &str,
        token: &str,
    ) -> Result<Option<ParticipantRecord>, StorageError>;

    async fn find_participant_by_user(
        &self,
        run_id: &str,
        user_id: &str,
    ) -> Result<Option<ParticipantRecord>, StorageError>;
}
