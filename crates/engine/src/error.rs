use accord_core::ValidationError;
use accord_storage::{RunStatus, StorageError};

/// Every failure the engine's public operations can surface.
///
/// `IncompleteSlots`, `AmbiguousTransition`, and `ParticipantLimit` are
/// flow control, not hard failures: the caller fills in what is missing
/// and retries. The rest are terminal for the request.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("run {run_id} is not active (status: {status})")]
    RunNotActive { run_id: String, status: RunStatus },

    #[error("role '{role}' may not act in state '{state}'")]
    Forbidden { role: String, state: String },

    #[error("state '{state}' is missing required slots: {}", missing.join(", "))]
    IncompleteSlots { state: String, missing: Vec<String> },

    #[error("transition '{from}' -> '{to}' is not declared by the template")]
    IllegalTransition { from: String, to: String },

    #[error("state '{state}' has multiple legal successors; a target state is required")]
    AmbiguousTransition { state: String, candidates: Vec<String> },

    #[error("concurrent advance on run {run_id}; retry exhausted")]
    Conflict { run_id: String },

    #[error("slot '{slot}' rejected: {reason}")]
    SlotRejected { slot: String, reason: String },

    #[error("state visit {run_state_id} is sealed; its slot data is immutable")]
    StateSealed { run_state_id: String },

    #[error("role '{role}' has {found} participant(s), outside its declared bounds")]
    ParticipantLimit {
        role: String,
        found: usize,
        min: u32,
        max: Option<u32>,
    },

    #[error("magic token invalid")]
    TokenInvalid,

    #[error("magic token expired")]
    TokenExpired,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Storage(StorageError),
}

impl EngineError {
    /// Stable machine-readable code carried on the wire, so clients can
    /// tell "fill in more data" apart from genuine auth failures.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::RunNotActive { .. } => "run_not_active",
            EngineError::Forbidden { .. } => "forbidden",
            EngineError::IncompleteSlots { .. } => "incomplete_slots",
            EngineError::IllegalTransition { .. } => "illegal_transition",
            EngineError::AmbiguousTransition { .. } => "ambiguous_transition",
            EngineError::Conflict { .. } => "conflict",
            EngineError::SlotRejected { .. } => "slot_rejected",
            EngineError::StateSealed { .. } => "state_sealed",
            EngineError::ParticipantLimit { .. } => "participant_limit",
            EngineError::TokenInvalid => "token_invalid",
            EngineError::TokenExpired => "token_expired",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Storage(_) => "storage_error",
        }
    }

    /// Whether the caller can recover by supplying more input and
    /// retrying the same request.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::IncompleteSlots { .. }
                | EngineError::AmbiguousTransition { .. }
                | EngineError::ParticipantLimit { .. }
        )
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::RunNotFound { run_id } => EngineError::NotFound {
                kind: "run",
                id: run_id,
            },
            StorageError::ParticipantNotFound { participant_id } => EngineError::NotFound {
                kind: "participant",
                id: participant_id,
            },
            StorageError::TemplateNotFound { template_id } => EngineError::NotFound {
                kind: "template",
                id: template_id,
            },
            StorageError::StateSealed { run_state_id } => EngineError::StateSealed { run_state_id },
            // ConcurrentConflict stays a storage error so the advance
            // retry loop can recognize and absorb it.
            other => EngineError::Storage(other),
        }
    }
}
