use std::sync::Arc;

use accord_storage::MemoryStore;
use serde_json::json;

use super::*;
use crate::error::EngineError;

// ──────────────────────────────────────
// Fixture: the 5-phase service request
// collect -> negotiate -> commit -> evidence -> signoff
// with a negotiate -> collect back-edge.
// ──────────────────────────────────────

fn five_phase_template() -> serde_json::Value {
    json!({
        "space_id": "space-1",
        "name": "service_request",
        "version": 1,
        "initial_state": "collect",
        "roles": [
            {"name": "requester", "capabilities": ["submit"], "min_participants": 1},
            {"name": "provider", "capabilities": ["quote"], "min_participants": 1, "max_participants": 1},
            {"name": "facilitator", "capabilities": ["message"], "min_participants": 0}
        ],
        "slots": [
            {"name": "location", "slot_type": "location", "required": true},
            {"name": "issue_description", "slot_type": "text", "required": true},
            {"name": "quote_amount", "slot_type": "currency", "editable_by": ["provider"]},
            {"name": "deposit_receipt", "slot_type": "file", "editable_by": ["requester"]},
            {"name": "proof_photo", "slot_type": "file", "editable_by": ["provider"]}
        ],
        "states": [
            {"name": "collect", "sequence": 1,
             "required_slots": ["location", "issue_description"],
             "allowed_roles": ["requester"],
             "transitions": {"next": ["negotiate"]}},
            {"name": "negotiate", "sequence": 2,
             "required_slots": ["quote_amount"],
             "allowed_roles": ["requester", "provider"],
             "transitions": {"next": ["commit", "collect"]}},
            {"name": "commit", "sequence": 3,
             "required_slots": ["deposit_receipt"],
             "allowed_roles": ["requester"],
             "transitions": {"next": ["evidence"]}},
            {"name": "evidence", "sequence": 4,
             "required_slots": ["proof_photo"],
             "allowed_roles": ["provider"],
             "transitions": {"next": ["signoff"]}},
            {"name": "signoff", "sequence": 5,
             "allowed_roles": ["requester"],
             "transitions": {"next": []}}
        ]
    })
}

struct Fixture {
    engine: Engine<MemoryStore>,
    run_id: String,
    requester: String,
    provider: String,
}

async fn fixture() -> Fixture {
    let engine = Engine::new(Arc::new(MemoryStore::new()));
    let template = engine.publish_template(&five_phase_template()).await.unwrap();
    let created = engine
        .create_run(
            &template.id,
            vec![
                NewParticipant {
                    role: "requester".to_string(),
                    user_id: Some("u-req".to_string()),
                    email: None,
                },
                NewParticipant {
                    role: "provider".to_string(),
                    user_id: None,
                    email: Some("pro@example.com".to_string()),
                },
            ],
        )
        .await
        .unwrap();
    let requester = created.participants[0].participant.id.clone();
    let provider = created.participants[1].participant.id.clone();
    Fixture {
        engine,
        run_id: created.run.id,
        requester,
        provider,
    }
}

fn slot_map(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn assert_one_open_row(engine: &Engine<MemoryStore>, run_id: &str, expected_state: &str) {
    let states = engine.store().list_run_states(run_id).await.unwrap();
    let open: Vec<_> = states.iter().filter(|s| s.is_open()).collect();
    assert_eq!(open.len(), 1, "exactly one open history row");
    assert_eq!(open[0].state, expected_state);
    let run = engine.store().get_run(run_id).await.unwrap();
    assert_eq!(run.current_state, expected_state, "pointer/open-row duality");
}

// ──────────────────────────────────────
// Creation
// ──────────────────────────────────────

#[tokio::test]
async fn create_run_opens_initial_state_with_tokens() {
    let f = fixture().await;
    assert_one_open_row(&f.engine, &f.run_id, "collect").await;
    let view = f.engine.run_view(&f.run_id).await.unwrap();
    assert_eq!(view.run.status, RunStatus::Active);
    assert_eq!(view.participants.len(), 2);
    // Every participant got a usable magic token at creation.
    let p = f.engine.store().get_participant(&f.requester).await.unwrap();
    assert!(p.magic_token.is_some());
}

#[tokio::test]
async fn create_run_rejects_unknown_role() {
    let engine = Engine::new(Arc::new(MemoryStore::new()));
    let template = engine.publish_template(&five_phase_template()).await.unwrap();
    let err = engine
        .create_run(
            &template.id,
            vec![NewParticipant {
                role: "auditor".to_string(),
                user_id: None,
                email: None,
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: "role", .. }));
}

#[tokio::test]
async fn context_permissions_follow_current_state() {
    let f = fixture().await;
    let requester = f.engine.store().get_participant(&f.requester).await.unwrap();
    let provider = f.engine.store().get_participant(&f.provider).await.unwrap();

    let granted = f
        .engine
        .context_permissions(&f.run_id, &ParticipantContext::Participant(requester))
        .await
        .unwrap();
    assert!(granted.contains("submit"));

    // Provider is not allowed in collect; its set is empty there, as is
    // an anonymous viewer's.
    let denied = f
        .engine
        .context_permissions(&f.run_id, &ParticipantContext::Participant(provider))
        .await
        .unwrap();
    assert!(denied.is_empty());
    let anon = f
        .engine
        .context_permissions(&f.run_id, &ParticipantContext::Anonymous)
        .await
        .unwrap();
    assert!(anon.is_empty());
}

// ──────────────────────────────────────
// Advance: slots, permissions, transitions
// ──────────────────────────────────────

#[tokio::test]
async fn advance_with_missing_required_slot_is_incomplete() {
    let f = fixture().await;
    let err = f
        .engine
        .advance(
            &f.run_id,
            &f.requester,
            Some("negotiate"),
            Some(&slot_map(&[("location", json!("downtown"))])),
        )
        .await
        .unwrap_err();
    match err {
        EngineError::IncompleteSlots { state, missing } => {
            assert_eq!(state, "collect");
            assert_eq!(missing, vec!["issue_description"]);
        }
        other => panic!("expected IncompleteSlots, got {other:?}"),
    }
    // The rejection never moves the pointer...
    assert_one_open_row(&f.engine, &f.run_id, "collect").await;
    // ...but the merged slot survives for the retry.
    let open = f.engine.store().open_run_state(&f.run_id).await.unwrap();
    let values = f.engine.store().list_slot_values(&open.id).await.unwrap();
    assert!(values.iter().any(|v| v.slot == "location"));
}

#[tokio::test]
async fn advance_after_filling_required_slots_succeeds() {
    let f = fixture().await;
    let outcome = f
        .engine
        .advance(
            &f.run_id,
            &f.requester,
            Some("negotiate"),
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap();
    assert_eq!(outcome.run.current_state, "negotiate");
    assert!(!outcome.completed);
    assert_one_open_row(&f.engine, &f.run_id, "negotiate").await;

    let history = f.engine.history(&f.run_id, Some("requester")).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].state.exited_at.is_some());
    assert!(history[1].state.is_open());
}

#[tokio::test]
async fn forbidden_role_cannot_advance() {
    let f = fixture().await;
    // provider is not in collect's allowed_roles.
    let err = f
        .engine
        .advance(&f.run_id, &f.provider, Some("negotiate"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));
}

#[tokio::test]
async fn illegal_transition_rejected() {
    let f = fixture().await;
    let err = f
        .engine
        .advance(
            &f.run_id,
            &f.requester,
            Some("commit"),
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition { .. }));
    assert_one_open_row(&f.engine, &f.run_id, "collect").await;
}

#[tokio::test]
async fn omitted_target_with_sole_successor_defaults() {
    let f = fixture().await;
    let outcome = f
        .engine
        .advance(
            &f.run_id,
            &f.requester,
            None,
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap();
    assert_eq!(outcome.run.current_state, "negotiate");
}

#[tokio::test]
async fn omitted_target_with_multiple_successors_is_ambiguous() {
    let f = fixture().await;
    f.engine
        .advance(
            &f.run_id,
            &f.requester,
            None,
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap();
    f.engine
        .write_slots(
            &f.run_id,
            &f.provider,
            &slot_map(&[("quote_amount", json!({"amount": 180, "currency": "USD"}))]),
        )
        .await
        .unwrap();

    // negotiate has two successors (commit, collect); the engine must
    // reject rather than guess.
    let err = f
        .engine
        .advance(&f.run_id, &f.requester, None, None)
        .await
        .unwrap_err();
    match err {
        EngineError::AmbiguousTransition { state, candidates } => {
            assert_eq!(state, "negotiate");
            assert_eq!(candidates, vec!["commit", "collect"]);
        }
        other => panic!("expected AmbiguousTransition, got {other:?}"),
    }
    assert_one_open_row(&f.engine, &f.run_id, "negotiate").await;
}

#[tokio::test]
async fn requester_cannot_write_provider_slot() {
    let f = fixture().await;
    f.engine
        .advance(
            &f.run_id,
            &f.requester,
            None,
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap();
    let err = f
        .engine
        .write_slots(
            &f.run_id,
            &f.requester,
            &slot_map(&[("quote_amount", json!({"amount": 1, "currency": "USD"}))]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotRejected { .. }));
}

#[tokio::test]
async fn back_edge_reentry_starts_from_blank_slate() {
    let f = fixture().await;
    f.engine
        .advance(
            &f.run_id,
            &f.requester,
            None,
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap();
    f.engine
        .write_slots(
            &f.run_id,
            &f.provider,
            &slot_map(&[("quote_amount", json!({"amount": 180, "currency": "USD"}))]),
        )
        .await
        .unwrap();

    // Take the back-edge home to collect.
    let outcome = f
        .engine
        .advance(&f.run_id, &f.requester, Some("collect"), None)
        .await
        .unwrap();
    assert_eq!(outcome.run.current_state, "collect");

    // Values from the first collect visit belong to a sealed row; the
    // re-entered state starts incomplete.
    let err = f
        .engine
        .advance(&f.run_id, &f.requester, Some("negotiate"), None)
        .await
        .unwrap_err();
    match err {
        EngineError::IncompleteSlots { missing, .. } => {
            assert_eq!(missing, vec!["location", "issue_description"]);
        }
        other => panic!("expected IncompleteSlots, got {other:?}"),
    }
}

// ──────────────────────────────────────
// Completion and status control
// ──────────────────────────────────────

async fn drive_to_signoff(f: &Fixture) {
    f.engine
        .advance(
            &f.run_id,
            &f.requester,
            None,
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap();
    f.engine
        .write_slots(
            &f.run_id,
            &f.provider,
            &slot_map(&[("quote_amount", json!({"amount": 180, "currency": "USD"}))]),
        )
        .await
        .unwrap();
    f.engine
        .advance(&f.run_id, &f.requester, Some("commit"), None)
        .await
        .unwrap();
    f.engine
        .advance(
            &f.run_id,
            &f.requester,
            None,
            Some(&slot_map(&[("deposit_receipt", json!("receipt-123.pdf"))])),
        )
        .await
        .unwrap();
    f.engine
        .advance(
            &f.run_id,
            &f.provider,
            None,
            Some(&slot_map(&[("proof_photo", json!("after.jpg"))])),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn terminal_state_completes_the_run() {
    let f = fixture().await;
    drive_to_signoff(&f).await;

    let run = f.engine.store().get_run(&f.run_id).await.unwrap();
    assert_eq!(run.current_state, "signoff");
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());

    // A completed run refuses further advances.
    let err = f
        .engine
        .advance(&f.run_id, &f.requester, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RunNotActive { .. }));
}

#[tokio::test]
async fn pause_blocks_advance_until_resume() {
    let f = fixture().await;
    f.engine.pause(&f.run_id).await.unwrap();
    let err = f
        .engine
        .advance(
            &f.run_id,
            &f.requester,
            None,
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RunNotActive {
            status: RunStatus::Paused,
            ..
        }
    ));

    f.engine.resume(&f.run_id).await.unwrap();
    f.engine
        .advance(
            &f.run_id,
            &f.requester,
            None,
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_is_terminal() {
    let f = fixture().await;
    f.engine.cancel(&f.run_id).await.unwrap();
    let run = f.engine.store().get_run(&f.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.completed_at.is_some());
    assert!(matches!(
        f.engine.resume(&f.run_id).await,
        Err(EngineError::RunNotActive { .. })
    ));
    assert!(matches!(
        f.engine.pause(&f.run_id).await,
        Err(EngineError::RunNotActive { .. })
    ));
}

// ──────────────────────────────────────
// Participant gate and roster events
// ──────────────────────────────────────

#[tokio::test]
async fn advance_blocked_when_role_below_minimum() {
    let f = fixture().await;
    f.engine
        .advance(
            &f.run_id,
            &f.requester,
            None,
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap();
    f.engine
        .write_slots(
            &f.run_id,
            &f.provider,
            &slot_map(&[("quote_amount", json!({"amount": 180, "currency": "USD"}))]),
        )
        .await
        .unwrap();

    // provider gates negotiate (min 1); removing it blocks the exit.
    f.engine
        .remove_participant(&f.run_id, &f.provider)
        .await
        .unwrap();
    let err = f
        .engine
        .advance(&f.run_id, &f.requester, Some("commit"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ParticipantLimit { found: 0, min: 1, .. }
    ));
}

#[tokio::test]
async fn role_maximum_enforced_on_add() {
    let f = fixture().await;
    // provider max_participants = 1 and one already exists.
    let err = f
        .engine
        .add_participant(
            &f.run_id,
            NewParticipant {
                role: "provider".to_string(),
                user_id: None,
                email: None,
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ParticipantLimit { .. }));
}

#[tokio::test]
async fn roster_changes_reach_subscribers() {
    let f = fixture().await;
    let mut rx = f.engine.rooms().subscribe(&f.run_id);
    let added = f
        .engine
        .add_participant(
            &f.run_id,
            NewParticipant {
                role: "facilitator".to_string(),
                user_id: None,
                email: None,
            },
            Some(24),
        )
        .await
        .unwrap();
    match rx.recv().await.unwrap() {
        RunEvent::ParticipantAdded { participant_id, role, .. } => {
            assert_eq!(participant_id, added.participant.id);
            assert_eq!(role, "facilitator");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    f.engine
        .remove_participant(&f.run_id, &added.participant.id)
        .await
        .unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        RunEvent::ParticipantRemoved { .. }
    ));
}

#[tokio::test]
async fn state_change_published_after_commit() {
    let f = fixture().await;
    let mut rx = f.engine.rooms().subscribe(&f.run_id);
    f.engine
        .advance(
            &f.run_id,
            &f.requester,
            None,
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap();
    match rx.recv().await.unwrap() {
        RunEvent::StateChanged { from, to, completed, .. } => {
            assert_eq!(from, "collect");
            assert_eq!(to, "negotiate");
            assert!(!completed);
            // The event describes a state the store already holds.
            let run = f.engine.store().get_run(&f.run_id).await.unwrap();
            assert_eq!(run.current_state, "negotiate");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

// ──────────────────────────────────────
// History visibility
// ──────────────────────────────────────

#[tokio::test]
async fn history_filters_slots_by_visibility() {
    let engine = Engine::new(Arc::new(MemoryStore::new()));
    let mut raw = five_phase_template();
    raw["slots"][2]["visibility"] = json!(["provider"]);
    let template = engine.publish_template(&raw).await.unwrap();
    let created = engine
        .create_run(
            &template.id,
            vec![
                NewParticipant {
                    role: "requester".to_string(),
                    user_id: None,
                    email: None,
                },
                NewParticipant {
                    role: "provider".to_string(),
                    user_id: None,
                    email: None,
                },
            ],
        )
        .await
        .unwrap();
    let run_id = created.run.id.clone();
    let requester = created.participants[0].participant.id.clone();
    let provider = created.participants[1].participant.id.clone();

    engine
        .advance(
            &run_id,
            &requester,
            None,
            Some(&slot_map(&[
                ("location", json!("downtown")),
                ("issue_description", json!("leaking pipe")),
            ])),
        )
        .await
        .unwrap();
    engine
        .write_slots(
            &run_id,
            &provider,
            &slot_map(&[("quote_amount", json!({"amount": 180, "currency": "USD"}))]),
        )
        .await
        .unwrap();

    let as_provider = engine.history(&run_id, Some("provider")).await.unwrap();
    assert!(as_provider
        .iter()
        .any(|e| e.slots.iter().any(|s| s.slot == "quote_amount")));

    let as_requester = engine.history(&run_id, Some("requester")).await.unwrap();
    assert!(!as_requester
        .iter()
        .any(|e| e.slots.iter().any(|s| s.slot == "quote_amount")));
    // Unrestricted slots stay visible to everyone, resolved role or not.
    let anonymous = engine.history(&run_id, None).await.unwrap();
    assert!(anonymous
        .iter()
        .any(|e| e.slots.iter().any(|s| s.slot == "location")));
}
