//! In-memory `CoordinationStore` backend.
//!
//! Snapshots stage their mutations and apply them at commit under one
//! lock, after re-verifying every version guard taken by
//! `get_run_for_update`. A guard that no longer matches — another
//! snapshot committed first — fails the whole commit with
//! `ConcurrentConflict` and leaves the store untouched, which is the
//! same observable behavior as a relational backend's conditional
//! `UPDATE ... WHERE version = ?` inside a transaction.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use accord_core::TemplateKey;
use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    ParticipantRecord, RunRecord, RunStateRecord, RunStatus, SlotValueRecord, TemplateRecord,
};
use crate::traits::CoordinationStore;

#[derive(Debug, Clone, Default)]
struct Inner {
    templates: BTreeMap<String, TemplateRecord>,
    runs: BTreeMap<String, RunRecord>,
    run_states: Vec<RunStateRecord>,
    slot_values: BTreeMap<(String, String), SlotValueRecord>,
    participants: Vec<ParticipantRecord>,
}

/// One staged mutation, applied in order at commit.
#[derive(Debug, Clone)]
enum Op {
    InsertRun(RunRecord),
    UpdateRunState {
        run_id: String,
        expected_version: i64,
        new_state: String,
    },
    UpdateRunStatus {
        run_id: String,
        expected_version: i64,
        status: RunStatus,
        completed_at: Option<OffsetDateTime>,
    },
    InsertRunState(RunStateRecord),
    SealRunState {
        run_state_id: String,
        exited_at: OffsetDateTime,
    },
    UpsertSlotValue(SlotValueRecord),
    InsertParticipant(ParticipantRecord),
    DeleteParticipant {
        participant_id: String,
    },
}

/// An in-progress transaction: staged ops plus the version guards taken
/// by `get_run_for_update`. Dropping it discards everything.
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    ops: Vec<Op>,
    guards: Vec<(String, i64)>,
}

/// Single-process store backed by a mutex-protected map set.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-mutation in this process;
        // recover the data, the staged-op design keeps it consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn apply(&mut self, op: Op) -> Result<(), StorageError> {
        match op {
            Op::InsertRun(record) => {
                if self.runs.contains_key(&record.id) {
                    return Err(StorageError::Backend(format!(
                        "run {} already exists",
                        record.id
                    )));
                }
                self.runs.insert(record.id.clone(), record);
                Ok(())
            }
            Op::UpdateRunState {
                run_id,
                expected_version,
                new_state,
            } => {
                let run = self
                    .runs
                    .get_mut(&run_id)
                    .ok_or(StorageError::RunNotFound { run_id: run_id.clone() })?;
                if run.version != expected_version {
                    return Err(StorageError::ConcurrentConflict {
                        run_id,
                        expected_version,
                    });
                }
                run.current_state = new_state;
                run.version += 1;
                Ok(())
            }
            Op::UpdateRunStatus {
                run_id,
                expected_version,
                status,
                completed_at,
            } => {
                let run = self
                    .runs
                    .get_mut(&run_id)
                    .ok_or(StorageError::RunNotFound { run_id: run_id.clone() })?;
                if run.version != expected_version {
                    return Err(StorageError::ConcurrentConflict {
                        run_id,
                        expected_version,
                    });
                }
                run.status = status;
                if completed_at.is_some() {
                    run.completed_at = completed_at;
                }
                run.version += 1;
                Ok(())
            }
            Op::InsertRunState(record) => {
                self.run_states.push(record);
                Ok(())
            }
            Op::SealRunState {
                run_state_id,
                exited_at,
            } => {
                let row = self
                    .run_states
                    .iter_mut()
                    .find(|r| r.id == run_state_id)
                    .ok_or_else(|| {
                        StorageError::Backend(format!("run state {run_state_id} not found"))
                    })?;
                if row.exited_at.is_some() {
                    return Err(StorageError::StateSealed { run_state_id });
                }
                row.exited_at = Some(exited_at);
                Ok(())
            }
            Op::UpsertSlotValue(record) => {
                let open = self
                    .run_states
                    .iter()
                    .find(|r| r.id == record.run_state_id)
                    .ok_or_else(|| {
                        StorageError::Backend(format!(
                            "run state {} not found",
                            record.run_state_id
                        ))
                    })?;
                if open.exited_at.is_some() {
                    return Err(StorageError::StateSealed {
                        run_state_id: record.run_state_id,
                    });
                }
                self.slot_values
                    .insert((record.run_state_id.clone(), record.slot.clone()), record);
                Ok(())
            }
            Op::InsertParticipant(record) => {
                if self.participants.iter().any(|p| p.id == record.id) {
                    return Err(StorageError::Backend(format!(
                        "participant {} already exists",
                        record.id
                    )));
                }
                self.participants.push(record);
                Ok(())
            }
            Op::DeleteParticipant { participant_id } => {
                let before = self.participants.len();
                self.participants.retain(|p| p.id != participant_id);
                if self.participants.len() == before {
                    return Err(StorageError::ParticipantNotFound { participant_id });
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError> {
        Ok(MemorySnapshot::default())
    }

    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError> {
        let mut inner = self.lock();
        // Re-verify every FOR UPDATE guard against the live rows before
        // applying anything. Staging into a working copy keeps a failed
        // commit from leaving partial state behind.
        for (run_id, expected_version) in &snapshot.guards {
            let run = inner
                .runs
                .get(run_id)
                .ok_or_else(|| StorageError::RunNotFound { run_id: run_id.clone() })?;
            if run.version != *expected_version {
                return Err(StorageError::ConcurrentConflict {
                    run_id: run_id.clone(),
                    expected_version: *expected_version,
                });
            }
        }
        let mut staged = inner.clone();
        for op in snapshot.ops {
            staged.apply(op)?;
        }
        *inner = staged;
        Ok(())
    }

    async fn abort_snapshot(&self, _snapshot: Self::Snapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn put_template(&self, record: TemplateRecord) -> Result<TemplateRecord, StorageError> {
        let mut inner = self.lock();
        let key = record.template.key();
        // Upsert keeps the existing id so run rows referencing this
        // template stay valid.
        let stored = match inner
            .templates
            .values()
            .find(|t| t.template.key() == key)
            .map(|t| t.id.clone())
        {
            Some(existing_id) => TemplateRecord {
                id: existing_id,
                ..record
            },
            None => record,
        };
        inner.templates.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_template(&self, template_id: &str) -> Result<TemplateRecord, StorageError> {
        self.lock()
            .templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| StorageError::TemplateNotFound {
                template_id: template_id.to_string(),
            })
    }

    async fn find_template(
        &self,
        key: &TemplateKey,
    ) -> Result<Option<TemplateRecord>, StorageError> {
        Ok(self
            .lock()
            .templates
            .values()
            .find(|t| t.template.key() == *key)
            .cloned())
    }

    async fn insert_run(
        &self,
        snapshot: &mut Self::Snapshot,
        record: RunRecord,
    ) -> Result<(), StorageError> {
        snapshot.ops.push(Op::InsertRun(record));
        Ok(())
    }

    async fn get_run_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        run_id: &str,
    ) -> Result<RunRecord, StorageError> {
        let run = self.get_run(run_id).await?;
        snapshot.guards.push((run.id.clone(), run.version));
        Ok(run)
    }

    async fn update_run_state(
        &self,
        snapshot: &mut Self::Snapshot,
        run_id: &str,
        expected_version: i64,
        new_state: &str,
    ) -> Result<i64, StorageError> {
        snapshot.ops.push(Op::UpdateRunState {
            run_id: run_id.to_string(),
            expected_version,
            new_state: new_state.to_string(),
        });
        Ok(expected_version + 1)
    }

    async fn update_run_status(
        &self,
        snapshot: &mut Self::Snapshot,
        run_id: &str,
        expected_version: i64,
        status: RunStatus,
        completed_at: Option<OffsetDateTime>,
    ) -> Result<i64, StorageError> {
        snapshot.ops.push(Op::UpdateRunStatus {
            run_id: run_id.to_string(),
            expected_version,
            status,
            completed_at,
        });
        Ok(expected_version + 1)
    }

    async fn insert_run_state(
        &self,
        snapshot: &mut Self::Snapshot,
        record: RunStateRecord,
    ) -> Result<(), StorageError> {
        snapshot.ops.push(Op::InsertRunState(record));
        Ok(())
    }

    async fn seal_run_state(
        &self,
        snapshot: &mut Self::Snapshot,
        run_state_id: &str,
        exited_at: OffsetDateTime,
    ) -> Result<(), StorageError> {
        snapshot.ops.push(Op::SealRunState {
            run_state_id: run_state_id.to_string(),
            exited_at,
        });
        Ok(())
    }

    async fn upsert_slot_value(
        &self,
        snapshot: &mut Self::Snapshot,
        record: SlotValueRecord,
    ) -> Result<(), StorageError> {
        snapshot.ops.push(Op::UpsertSlotValue(record));
        Ok(())
    }

    async fn insert_participant(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ParticipantRecord,
    ) -> Result<(), StorageError> {
        snapshot.ops.push(Op::InsertParticipant(record));
        Ok(())
    }

    async fn delete_participant(
        &self,
        snapshot: &mut Self::Snapshot,
        participant_id: &str,
    ) -> Result<(), StorageError> {
        snapshot.ops.push(Op::DeleteParticipant {
            participant_id: participant_id.to_string(),
        });
        Ok(())
    }

    async fn set_magic_token(
        &self,
        participant_id: &str,
        token: Option<String>,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let participant = inner
            .participants
            .iter_mut()
            .find(|p| p.id == participant_id)
            .ok_or_else(|| StorageError::ParticipantNotFound {
                participant_id: participant_id.to_string(),
            })?;
        // Token and expiry change together under the lock: rotation
        // never exposes the old token with the new expiry or vice versa.
        participant.magic_token = token;
        participant.token_expires_at = expires_at;
        Ok(())
    }

    async fn touch_participant(
        &self,
        participant_id: &str,
        at: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let participant = inner
            .participants
            .iter_mut()
            .find(|p| p.id == participant_id)
            .ok_or_else(|| StorageError::ParticipantNotFound {
                participant_id: participant_id.to_string(),
            })?;
        participant.last_active_at = at;
        Ok(())
    }

    async fn clear_stale_tokens(&self, cutoff: OffsetDateTime) -> Result<usize, StorageError> {
        let mut inner = self.lock();
        let mut cleared = 0;
        for participant in inner.participants.iter_mut() {
            if participant.magic_token.is_some() && participant.last_active_at < cutoff {
                participant.magic_token = None;
                participant.token_expires_at = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRecord, StorageError> {
        self.lock()
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn open_run_state(&self, run_id: &str) -> Result<RunStateRecord, StorageError> {
        self.lock()
            .run_states
            .iter()
            .find(|r| r.run_id == run_id && r.exited_at.is_none())
            .cloned()
            .ok_or_else(|| StorageError::OpenStateMissing {
                run_id: run_id.to_string(),
            })
    }

    async fn list_run_states(&self, run_id: &str) -> Result<Vec<RunStateRecord>, StorageError> {
        Ok(self
            .lock()
            .run_states
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_slot_values(
        &self,
        run_state_id: &str,
    ) -> Result<Vec<SlotValueRecord>, StorageError> {
        Ok(self
            .lock()
            .slot_values
            .iter()
            .filter(|((rs, _), _)| rs == run_state_id)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn get_participant(
        &self,
        participant_id: &str,
    ) -> Result<ParticipantRecord, StorageError> {
        self.lock()
            .participants
            .iter()
            .find(|p| p.id == participant_id)
            .cloned()
            .ok_or_else(|| StorageError::ParticipantNotFound {
                participant_id: participant_id.to_string(),
            })
    }

    async fn list_participants(
        &self,
        run_id: &str,
    ) -> Result<Vec<ParticipantRecord>, StorageError> {
        Ok(self
            .lock()
            .participants
            .iter()
            .filter(|p| p.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn find_participant_by_token(
        &self,
        run_id: &str,
        token: &str,
    ) -> Result<Option<ParticipantRecord>, StorageError> {
        Ok(self
            .lock()
            .participants
            .iter()
            .find(|p| p.run_id == run_id && p.magic_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_participant_by_user(
        &self,
        run_id: &str,
        user_id: &str,
    ) -> Result<Option<ParticipantRecord>, StorageError> {
        Ok(self
            .lock()
            .participants
            .iter()
            .find(|p| p.run_id == run_id && p.user_id.as_deref() == Some(user_id))
            .cloned())
    }
}
