use std::fmt;

use accord_core::Template;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A published template row: the compiled definition plus its storage id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: String,
    pub template: Template,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
}

/// Run lifecycle status. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Active => "active",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One workflow instance.
///
/// `version` is the OCC counter: every successful `update_run_state` or
/// `update_run_status` bumps it, and updates are conditional on the
/// caller's expected value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub template_id: String,
    pub current_state: String,
    pub status: RunStatus,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// One entry in a run's append-only state history.
///
/// Exactly one row per run has `exited_at = None`; that row's `state` is
/// authoritative and must equal the run's `current_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStateRecord {
    pub id: String,
    pub run_id: String,
    pub state: String,
    #[serde(with = "time::serde::rfc3339")]
    pub entered_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub exited_at: Option<OffsetDateTime>,
}

impl RunStateRecord {
    pub fn is_open(&self) -> bool {
        self.exited_at.is_none()
    }
}

/// A slot value recorded against one run-state visit. Keyed by
/// `(run_state_id, slot)`; a re-entry after a back-edge opens a new row
/// and starts from a blank slate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotValueRecord {
    pub run_state_id: String,
    pub slot: String,
    pub value: serde_json::Value,
    pub submitted_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

/// An actor bound to a role within one run.
///
/// `user_id` is absent for anonymous participants, who are keyed only by
/// their magic token. The token is a bearer secret; it never appears in
/// logs or in participant views returned to other parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: String,
    pub run_id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic_token: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub token_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
}
