//! Accord coordination run engine.
//!
//! Tracks one workflow instance ("run") across multiple independently
//! authenticated participants. The engine enforces who may act and what
//! data must exist before a transition fires, issues and retires
//! single-use magic tokens so participants need no account, and fans out
//! state changes to every viewer subscribed to the run's room.
//!
//! Layout:
//! - [`machine`] -- the transactional core: [`Engine::advance`] and run
//!   lifecycle operations
//! - [`slots`] -- slot write validation and required-slot completeness
//! - [`resolver`] -- request credentials to participant context, and the
//!   state-relative permission function
//! - [`magic`] -- magic link issuance, validation, rotation, and the
//!   stale-token sweep
//! - [`broadcast`] -- per-run rooms over `tokio::sync::broadcast`
//!
//! Every public operation returns a typed [`EngineError`]; nothing in
//! this crate panics on bad input.

pub mod broadcast;
mod error;
mod ids;
pub mod machine;
pub mod magic;
pub mod resolver;
pub mod slots;

pub use broadcast::{RoomRegistry, RunEvent};
pub use error::EngineError;
pub use machine::{
    AdvanceOutcome, CreatedRun, Engine, HistoryEntry, IssuedParticipant, NewParticipant,
    ParticipantView, RunView,
};
pub use magic::{IssuedToken, MagicLinkAuthority, DEFAULT_TTL_HOURS, RETENTION_DAYS};
pub use resolver::{
    permissions_for, run_id_from_path, ParticipantContext, PermissionSet, ResolveRequest, Resolver,
};
