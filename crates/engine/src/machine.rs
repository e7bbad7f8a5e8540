//! The run state machine -- the transactional core of the engine.
//!
//! `advance` validates a requested transition against the template's
//! transition table, the required-slot completeness of the current
//! state, and the caller's role permission, then atomically seals the
//! old state-history row, opens a new one, and moves the run's
//! current-state pointer. The run row is the unit of mutual exclusion:
//! a concurrent advance on the same run loses the version check, is
//! retried once against fresh state, and then surfaces `Conflict`.
//!
//! Event publication happens strictly after commit, so no subscriber
//! ever observes a state that was later rolled back.

use std::sync::Arc;

use accord_core::Template;
use accord_storage::{
    CoordinationStore, ParticipantRecord, RunRecord, RunStateRecord, RunStatus, SlotValueRecord,
    StorageError, TemplateRecord,
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::broadcast::{RoomRegistry, RunEvent};
use crate::error::EngineError;
use crate::ids::{generate_token, new_id};
use crate::magic::{IssuedToken, MagicLinkAuthority, DEFAULT_TTL_HOURS};
use crate::resolver::{permissions_for, ParticipantContext, PermissionSet, Resolver};
use crate::slots;

#[cfg(test)]
mod tests;

/// A participant to create alongside a run, or to add to one.
#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub role: String,
    pub user_id: Option<String>,
    pub email: Option<String>,
}

/// A created participant together with its freshly issued magic token.
/// The token appears here once; participant views everywhere else
/// redact it.
#[derive(Debug, Clone)]
pub struct IssuedParticipant {
    pub participant: ParticipantRecord,
    pub magic_token: String,
    pub expires_at: OffsetDateTime,
}

/// Result of instantiating a template.
#[derive(Debug)]
pub struct CreatedRun {
    pub run: RunRecord,
    pub participants: Vec<IssuedParticipant>,
}

/// Result of a successful advance.
#[derive(Debug, Clone, Serialize)]
pub struct AdvanceOutcome {
    pub run: RunRecord,
    /// The newly opened state-history row.
    pub state: RunStateRecord,
    /// True when the new state has no outgoing transitions and the run
    /// was marked completed.
    pub completed: bool,
}

/// One history entry: a state visit plus the slot values recorded
/// against it, filtered by the viewer's visibility.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub state: RunStateRecord,
    pub slots: Vec<SlotValueRecord>,
}

/// Participant as shown to other parties: no token material.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantView {
    pub id: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
}

impl From<ParticipantRecord> for ParticipantView {
    fn from(p: ParticipantRecord) -> Self {
        ParticipantView {
            id: p.id,
            role: p.role,
            user_id: p.user_id,
            email: p.email,
            last_active_at: p.last_active_at,
        }
    }
}

/// Run summary for dashboards and the magic-link landing page.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub run: RunRecord,
    pub template_name: String,
    pub participants: Vec<ParticipantView>,
}

/// The coordination run engine over a storage backend.
pub struct Engine<S> {
    store: Arc<S>,
    rooms: Arc<RoomRegistry>,
    magic: MagicLinkAuthority<S>,
    resolver: Resolver<S>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Engine {
            store: Arc::clone(&self.store),
            rooms: Arc::clone(&self.rooms),
            magic: self.magic.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

impl<S: CoordinationStore> Engine<S> {
    pub fn new(store: Arc<S>) -> Self {
        let magic = MagicLinkAuthority::new(Arc::clone(&store));
        let resolver = Resolver::new(Arc::clone(&store));
        Engine {
            store,
            rooms: Arc::new(RoomRegistry::new()),
            magic,
            resolver,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn magic(&self) -> &MagicLinkAuthority<S> {
        &self.magic
    }

    pub fn resolver(&self) -> &Resolver<S> {
        &self.resolver
    }

    // ── Templates ────────────────────────────────────────────────────────

    /// Compile and publish a template document. Publishing an existing
    /// `(space_id, name, version)` key upserts that row.
    pub async fn publish_template(
        &self,
        raw: &serde_json::Value,
    ) -> Result<TemplateRecord, EngineError> {
        let template = accord_core::compile(raw)?;
        let record = self
            .store
            .put_template(TemplateRecord {
                id: new_id("tpl"),
                template,
                published_at: OffsetDateTime::now_utc(),
            })
            .await?;
        tracing::info!(
            template_id = %record.id,
            name = %record.template.name,
            version = record.template.version,
            "template published"
        );
        Ok(record)
    }

    pub async fn get_template(&self, template_id: &str) -> Result<TemplateRecord, EngineError> {
        Ok(self.store.get_template(template_id).await?)
    }

    // ── Run lifecycle ────────────────────────────────────────────────────

    /// Instantiate a template: create the run at its initial state with
    /// an open history row and the initial participant set, in one
    /// transaction. Each participant gets a magic token.
    pub async fn create_run(
        &self,
        template_id: &str,
        participants: Vec<NewParticipant>,
    ) -> Result<CreatedRun, EngineError> {
        let record = self.store.get_template(template_id).await?;
        let template = &record.template;

        for p in &participants {
            if template.role(&p.role).is_none() {
                return Err(EngineError::NotFound {
                    kind: "role",
                    id: p.role.clone(),
                });
            }
        }
        for role in &template.roles {
            let found = participants.iter().filter(|p| p.role == role.name).count();
            if let Some(max) = role.max_participants {
                if found as u32 > max {
                    return Err(EngineError::ParticipantLimit {
                        role: role.name.clone(),
                        found,
                        min: role.min_participants,
                        max: Some(max),
                    });
                }
            }
        }

        let now = OffsetDateTime::now_utc();
        let run = RunRecord {
            id: new_id("run"),
            template_id: record.id.clone(),
            current_state: template.initial_state.clone(),
            status: RunStatus::Active,
            version: 0,
            started_at: now,
            completed_at: None,
        };

        let mut snap = self.store.begin_snapshot().await?;
        self.store.insert_run(&mut snap, run.clone()).await?;
        self.store
            .insert_run_state(
                &mut snap,
                RunStateRecord {
                    id: new_id("rst"),
                    run_id: run.id.clone(),
                    state: template.initial_state.clone(),
                    entered_at: now,
                    exited_at: None,
                },
            )
            .await?;

        let mut issued = Vec::with_capacity(participants.len());
        for p in participants {
            let token = generate_token();
            let expires_at = now + time::Duration::hours(DEFAULT_TTL_HOURS);
            let record = ParticipantRecord {
                id: new_id("prt"),
                run_id: run.id.clone(),
                role: p.role,
                user_id: p.user_id,
                email: p.email,
                magic_token: Some(token.clone()),
                token_expires_at: Some(expires_at),
                last_active_at: now,
            };
            self.store
                .insert_participant(&mut snap, record.clone())
                .await?;
            issued.push(IssuedParticipant {
                participant: record,
                magic_token: token,
                expires_at,
            });
        }
        self.store.commit_snapshot(snap).await?;

        tracing::info!(
            run_id = %run.id,
            template = %template.name,
            state = %run.current_state,
            participants = issued.len(),
            "run created"
        );
        Ok(CreatedRun {
            run,
            participants: issued,
        })
    }

    /// Advance the run, per the transition algorithm. A concurrent
    /// commit on the same run is retried once with fresh state; a second
    /// loss surfaces as `Conflict`.
    pub async fn advance(
        &self,
        run_id: &str,
        participant_id: &str,
        target: Option<&str>,
        slot_data: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<AdvanceOutcome, EngineError> {
        match self
            .try_advance(run_id, participant_id, target, slot_data)
            .await
        {
            Err(EngineError::Storage(StorageError::ConcurrentConflict { .. })) => {
                tracing::debug!(run_id, "advance lost a concurrent commit; retrying once");
                match self
                    .try_advance(run_id, participant_id, target, slot_data)
                    .await
                {
                    Err(EngineError::Storage(StorageError::ConcurrentConflict { .. })) => {
                        Err(EngineError::Conflict {
                            run_id: run_id.to_string(),
                        })
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn try_advance(
        &self,
        run_id: &str,
        participant_id: &str,
        target: Option<&str>,
        slot_data: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<AdvanceOutcome, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Active {
            return Err(EngineError::RunNotActive {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }

        let template_record = self.store.get_template(&run.template_id).await?;
        let template = &template_record.template;
        let state = template.state(&run.current_state).ok_or_else(|| {
            EngineError::Storage(StorageError::Backend(format!(
                "run {} points at state '{}' unknown to template {}",
                run.id, run.current_state, template_record.id
            )))
        })?;

        let participant = self.store.get_participant(participant_id).await?;
        if participant.run_id != run_id {
            return Err(EngineError::NotFound {
                kind: "participant",
                id: participant_id.to_string(),
            });
        }
        if !state.allows_role(&participant.role) {
            return Err(EngineError::Forbidden {
                role: participant.role.clone(),
                state: state.name.clone(),
            });
        }

        let open = self.store.open_run_state(run_id).await?;
        if open.state != run.current_state {
            // Open-row/pointer duality violated: another advance is
            // mid-flight. Re-read and re-evaluate.
            return Err(EngineError::Storage(StorageError::ConcurrentConflict {
                run_id: run_id.to_string(),
                expected_version: run.version,
            }));
        }

        // Slot merge commits on its own: values survive even when the
        // transition below is rejected, so the caller can fill the rest
        // and retry.
        if let Some(entries) = slot_data {
            if !entries.is_empty() {
                self.write_validated_slots(template, state, &participant, &open.id, entries)
                    .await?;
            }
        }

        let values = self.store.list_slot_values(&open.id).await?;
        let missing = slots::missing_required_slots(state, &values);
        if !missing.is_empty() {
            return Err(EngineError::IncompleteSlots {
                state: state.name.clone(),
                missing,
            });
        }

        // Participant-count gate for every role allowed to act here.
        let roster = self.store.list_participants(run_id).await?;
        for role_name in &state.allowed_roles {
            if let Some(role) = template.role(role_name) {
                let found = roster.iter().filter(|p| &p.role == role_name).count();
                let below = (found as u32) < role.min_participants;
                let above = role.max_participants.is_some_and(|max| found as u32 > max);
                if below || above {
                    return Err(EngineError::ParticipantLimit {
                        role: role_name.clone(),
                        found,
                        min: role.min_participants,
                        max: role.max_participants,
                    });
                }
            }
        }

        let next_state = match target {
            Some(t) => {
                if state.transitions.next.iter().any(|n| n == t) {
                    t.to_string()
                } else {
                    return Err(EngineError::IllegalTransition {
                        from: state.name.clone(),
                        to: t.to_string(),
                    });
                }
            }
            None => match state.transitions.next.as_slice() {
                [sole] => sole.clone(),
                [] => {
                    return Err(EngineError::IllegalTransition {
                        from: state.name.clone(),
                        to: "(no successor)".to_string(),
                    })
                }
                _ => {
                    return Err(EngineError::AmbiguousTransition {
                        state: state.name.clone(),
                        candidates: state.transitions.next.clone(),
                    })
                }
            },
        };
        let next_def = template.state(&next_state).ok_or_else(|| {
            EngineError::Storage(StorageError::Backend(format!(
                "transition target '{next_state}' unknown to template {}",
                template_record.id
            )))
        })?;
        let completed = next_def.is_terminal();

        // One transaction: seal the old visit, open the new one, move
        // the pointer, and (on a terminal state) complete the run.
        let now = OffsetDateTime::now_utc();
        let new_row = RunStateRecord {
            id: new_id("rst"),
            run_id: run_id.to_string(),
            state: next_state.clone(),
            entered_at: now,
            exited_at: None,
        };

        let mut snap = self.store.begin_snapshot().await?;
        let locked = self.store.get_run_for_update(&mut snap, run_id).await?;
        if locked.version != run.version
            || locked.current_state != run.current_state
            || locked.status != RunStatus::Active
        {
            let _ = self.store.abort_snapshot(snap).await;
            return Err(EngineError::Storage(StorageError::ConcurrentConflict {
                run_id: run_id.to_string(),
                expected_version: run.version,
            }));
        }
        self.store.seal_run_state(&mut snap, &open.id, now).await?;
        self.store
            .insert_run_state(&mut snap, new_row.clone())
            .await?;
        let version = self
            .store
            .update_run_state(&mut snap, run_id, locked.version, &next_state)
            .await?;
        if completed {
            self.store
                .update_run_status(&mut snap, run_id, version, RunStatus::Completed, Some(now))
                .await?;
        }
        self.store.commit_snapshot(snap).await?;

        let run_after = self.store.get_run(run_id).await?;
        tracing::info!(
            run_id,
            from = %run.current_state,
            to = %next_state,
            completed,
            "run advanced"
        );
        self.rooms.publish(
            run_id,
            RunEvent::StateChanged {
                run_id: run_id.to_string(),
                from: run.current_state.clone(),
                to: next_state,
                completed,
            },
        );
        Ok(AdvanceOutcome {
            run: run_after,
            state: new_row,
            completed,
        })
    }

    /// Write slot values against the currently open state visit without
    /// advancing.
    pub async fn write_slots(
        &self,
        run_id: &str,
        participant_id: &str,
        entries: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Active {
            return Err(EngineError::RunNotActive {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        let template_record = self.store.get_template(&run.template_id).await?;
        let template = &template_record.template;
        let state = template.state(&run.current_state).ok_or_else(|| {
            EngineError::Storage(StorageError::Backend(format!(
                "run {} points at state '{}' unknown to template {}",
                run.id, run.current_state, template_record.id
            )))
        })?;
        let participant = self.store.get_participant(participant_id).await?;
        if participant.run_id != run_id {
            return Err(EngineError::NotFound {
                kind: "participant",
                id: participant_id.to_string(),
            });
        }
        let open = self.store.open_run_state(run_id).await?;
        self.write_validated_slots(template, state, &participant, &open.id, entries)
            .await
    }

    async fn write_validated_slots(
        &self,
        template: &Template,
        state: &accord_core::StateDef,
        participant: &ParticipantRecord,
        run_state_id: &str,
        entries: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), EngineError> {
        // Validate everything before writing anything, so a batch with
        // one bad slot leaves no partial data.
        for slot in entries.keys() {
            slots::validate_slot_write(template, state, &participant.role, slot)?;
        }
        let now = OffsetDateTime::now_utc();
        let mut snap = self.store.begin_snapshot().await?;
        for (slot, value) in entries {
            self.store
                .upsert_slot_value(
                    &mut snap,
                    SlotValueRecord {
                        run_state_id: run_state_id.to_string(),
                        slot: slot.clone(),
                        value: value.clone(),
                        submitted_by: participant.id.clone(),
                        submitted_at: now,
                    },
                )
                .await?;
        }
        Ok(self.store.commit_snapshot(snap).await?)
    }

    /// True iff every required slot of the current state has a non-empty
    /// value on the currently open visit.
    pub async fn is_complete(&self, run_id: &str) -> Result<bool, EngineError> {
        let run = self.store.get_run(run_id).await?;
        let template_record = self.store.get_template(&run.template_id).await?;
        let state = template_record
            .template
            .state(&run.current_state)
            .ok_or_else(|| {
                EngineError::Storage(StorageError::Backend(format!(
                    "run {} points at state '{}' unknown to template {}",
                    run.id, run.current_state, template_record.id
                )))
            })?;
        let open = self.store.open_run_state(run_id).await?;
        let values = self.store.list_slot_values(&open.id).await?;
        Ok(slots::missing_required_slots(state, &values).is_empty())
    }

    /// Capabilities the context holds in the run's current state. Empty
    /// for non-participants and for roles the current state excludes.
    pub async fn context_permissions(
        &self,
        run_id: &str,
        context: &ParticipantContext,
    ) -> Result<PermissionSet, EngineError> {
        let run = self.store.get_run(run_id).await?;
        let template_record = self.store.get_template(&run.template_id).await?;
        let state = template_record
            .template
            .state(&run.current_state)
            .ok_or_else(|| {
                EngineError::Storage(StorageError::Backend(format!(
                    "run {} points at state '{}' unknown to template {}",
                    run.id, run.current_state, template_record.id
                )))
            })?;
        Ok(permissions_for(context, &template_record.template, state))
    }

    // ── Status control ───────────────────────────────────────────────────

    pub async fn pause(&self, run_id: &str) -> Result<RunRecord, EngineError> {
        self.set_status(run_id, RunStatus::Paused, &[RunStatus::Active], false)
            .await
    }

    pub async fn resume(&self, run_id: &str) -> Result<RunRecord, EngineError> {
        self.set_status(run_id, RunStatus::Active, &[RunStatus::Paused], false)
            .await
    }

    pub async fn cancel(&self, run_id: &str) -> Result<RunRecord, EngineError> {
        self.set_status(
            run_id,
            RunStatus::Cancelled,
            &[RunStatus::Active, RunStatus::Paused],
            true,
        )
        .await
    }

    async fn set_status(
        &self,
        run_id: &str,
        status: RunStatus,
        allowed_from: &[RunStatus],
        terminal: bool,
    ) -> Result<RunRecord, EngineError> {
        let mut snap = self.store.begin_snapshot().await?;
        let locked = self.store.get_run_for_update(&mut snap, run_id).await?;
        if !allowed_from.contains(&locked.status) {
            let _ = self.store.abort_snapshot(snap).await;
            return Err(EngineError::RunNotActive {
                run_id: run_id.to_string(),
                status: locked.status,
            });
        }
        let completed_at = terminal.then(OffsetDateTime::now_utc);
        self.store
            .update_run_status(&mut snap, run_id, locked.version, status, completed_at)
            .await?;
        match self.store.commit_snapshot(snap).await {
            Ok(()) => {}
            Err(StorageError::ConcurrentConflict { .. }) => {
                return Err(EngineError::Conflict {
                    run_id: run_id.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        let run = self.store.get_run(run_id).await?;
        tracing::info!(run_id, status = %run.status, "run status changed");
        Ok(run)
    }

    // ── Participants ─────────────────────────────────────────────────────

    pub async fn add_participant(
        &self,
        run_id: &str,
        new: NewParticipant,
        ttl_hours: Option<i64>,
    ) -> Result<IssuedParticipant, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::RunNotActive {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        let template_record = self.store.get_template(&run.template_id).await?;
        let role = template_record
            .template
            .role(&new.role)
            .ok_or_else(|| EngineError::NotFound {
                kind: "role",
                id: new.role.clone(),
            })?;
        let roster = self.store.list_participants(run_id).await?;
        let found = roster.iter().filter(|p| p.role == new.role).count();
        if let Some(max) = role.max_participants {
            if found as u32 >= max {
                return Err(EngineError::ParticipantLimit {
                    role: new.role.clone(),
                    found: found + 1,
                    min: role.min_participants,
                    max: Some(max),
                });
            }
        }

        let now = OffsetDateTime::now_utc();
        let token = generate_token();
        let expires_at = now + time::Duration::hours(ttl_hours.unwrap_or(DEFAULT_TTL_HOURS).max(0));
        let record = ParticipantRecord {
            id: new_id("prt"),
            run_id: run_id.to_string(),
            role: new.role,
            user_id: new.user_id,
            email: new.email,
            magic_token: Some(token.clone()),
            token_expires_at: Some(expires_at),
            last_active_at: now,
        };
        let mut snap = self.store.begin_snapshot().await?;
        self.store
            .insert_participant(&mut snap, record.clone())
            .await?;
        self.store.commit_snapshot(snap).await?;

        tracing::info!(run_id, participant_id = %record.id, role = %record.role, "participant added");
        self.rooms.publish(
            run_id,
            RunEvent::ParticipantAdded {
                run_id: run_id.to_string(),
                participant_id: record.id.clone(),
                role: record.role.clone(),
            },
        );
        Ok(IssuedParticipant {
            participant: record,
            magic_token: token,
            expires_at,
        })
    }

    /// Remove a participant; deleting the row retires its token with it.
    pub async fn remove_participant(
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
        let mut snap = self.store.begin_snapshot().await?;
        self.store
            .delete_participant(&mut snap, participant_id)
            .await?;
        self.store.commit_snapshot(snap).await?;

        tracing::info!(run_id, participant_id, "participant removed");
        self.rooms.publish(
            run_id,
            RunEvent::ParticipantRemoved {
                run_id: run_id.to_string(),
                participant_id: participant_id.to_string(),
            },
        );
        Ok(())
    }

    /// Rotate (or first-issue) a participant's magic link.
    pub async fn rotate_magic_link(
        &self,
        run_id: &str,
        participant_id: &str,
        ttl_hours: Option<i64>,
    ) -> Result<IssuedToken, EngineError> {
        self.magic
            .issue(
                run_id,
                participant_id,
                ttl_hours.unwrap_or(DEFAULT_TTL_HOURS),
            )
            .await
    }

    // ── Views ────────────────────────────────────────────────────────────

    pub async fn run_view(&self, run_id: &str) -> Result<RunView, EngineError> {
        let run = self.store.get_run(run_id).await?;
        let template_record = self.store.get_template(&run.template_id).await?;
        let participants = self
            .store
            .list_participants(run_id)
            .await?
            .into_iter()
            .map(ParticipantView::from)
            .collect();
        Ok(RunView {
            run,
            template_name: template_record.template.name.clone(),
            participants,
        })
    }

    /// Full sealed+open history with slot values, filtered by what the
    /// viewer's role may see. This is the polling fallback for clients
    /// without a live socket.
    pub async fn history(
        &self,
        run_id: &str,
        viewer_role: Option<&str>,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        let run = self.store.get_run(run_id).await?;
        let template_record = self.store.get_template(&run.template_id).await?;
        let template = &template_record.template;
        let mut entries = Vec::new();
        for state in self.store.list_run_states(run_id).await? {
            let values = self
                .store
                .list_slot_values(&state.id)
                .await?
                .into_iter()
                .filter(|v| {
                    template
                        .slot(&v.slot)
                        .is_some_and(|def| def.visible_to_role(viewer_role))
                })
                .collect();
            entries.push(HistoryEntry {
                state,
                slots: values,
            });
        }
        Ok(entries)
    }
}
