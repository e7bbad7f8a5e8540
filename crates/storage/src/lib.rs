//! Storage layer for accord coordination runs.
//!
//! [`CoordinationStore`] is the trait the run engine is written against.
//! It provides durable storage for templates, runs, the append-only
//! run-state history, slot values, and participants, with transactional
//! snapshot semantics and optimistic concurrency control on the run row.
//!
//! [`MemoryStore`] is the bundled backend: a single-process store whose
//! snapshot commit re-validates every version guard, so it exhibits the
//! same `ConcurrentConflict` behavior a relational backend produces with
//! conditional `UPDATE ... WHERE version = ?` statements.

mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use record::{
    ParticipantRecord, RunRecord, RunStateRecord, RunStatus, SlotValueRecord, TemplateRecord,
};
pub use traits::CoordinationStore;
