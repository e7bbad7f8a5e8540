/// All errors a [`crate::CoordinationStore`] implementation can return.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency check failed -- another transaction moved
    /// the run row first. The caller re-reads and re-evaluates.
    #[error("concurrent conflict on run {run_id}: expected version {expected_version}")]
    ConcurrentConflict { run_id: String, expected_version: i64 },

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("participant not found: {participant_id}")]
    ParticipantNotFound { participant_id: String },

    #[error("template not found: {template_id}")]
    TemplateNotFound { template_id: String },

    /// No open run-state row exists for the run. The open row is an
    /// invariant of every non-terminal run, so this signals corruption
    /// or a bug, never normal flow.
    #[error("no open run state for run {run_id}")]
    OpenStateMissing { run_id: String },

    /// A slot write targeted a run-state row that is already sealed.
    #[error("run state {run_state_id} is sealed")]
    StateSealed { run_state_id: String },

    /// A backend-specific failure (connection, serialization, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}
