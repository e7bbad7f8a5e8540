//! Template compilation: deserialize a raw JSON document and validate
//! every cross-reference before a [`Template`] is allowed to exist.
//!
//! Compilation is pure -- no storage, no clock. All issues found are
//! accumulated and returned together rather than failing on the first.

use std::collections::BTreeSet;

use crate::error::{ValidationError, ValidationIssue};
use crate::template::{Template, TransitionTable};

/// Compile a raw template document into a validated [`Template`].
///
/// Checks, in order:
/// - the document deserializes into the template shape;
/// - names are non-empty and unique within their kind;
/// - every slot referenced by a state is defined;
/// - every transition target is a defined state;
/// - every role referenced by a state or slot is defined;
/// - role participant bounds are coherent (`min <= max`);
/// - every state is reachable from the declared initial state.
pub fn compile(raw: &serde_json::Value) -> Result<Template, ValidationError> {
    let template: Template = serde_json::from_value(raw.clone())
        .map_err(|e| ValidationError::single("template", format!("malformed document: {e}")))?;

    let mut issues = Vec::new();

    if template.name.trim().is_empty() {
        issues.push(ValidationIssue::new("name", "template name must not be empty"));
    }
    if template.space_id.trim().is_empty() {
        issues.push(ValidationIssue::new("space_id", "space id must not be empty"));
    }
    if template.version == 0 {
        issues.push(ValidationIssue::new("version", "version must be >= 1"));
    }
    if template.states.is_empty() {
        issues.push(ValidationIssue::new("states", "template must define at least one state"));
    }

    check_unique(&mut issues, "roles", template.roles.iter().map(|r| r.name.as_str()));
    check_unique(&mut issues, "slots", template.slots.iter().map(|s| s.name.as_str()));
    check_unique(&mut issues, "states", template.states.iter().map(|s| s.name.as_str()));

    let role_names: BTreeSet<&str> = template.roles.iter().map(|r| r.name.as_str()).collect();
    let slot_names: BTreeSet<&str> = template.slots.iter().map(|s| s.name.as_str()).collect();
    let state_names: BTreeSet<&str> = template.states.iter().map(|s| s.name.as_str()).collect();

    for role in &template.roles {
        if let Some(max) = role.max_participants {
            if role.min_participants > max {
                issues.push(ValidationIssue::new(
                    format!("roles.{}", role.name),
                    format!(
                        "min_participants ({}) exceeds max_participants ({max})",
                        role.min_participants
                    ),
                ));
            }
        }
    }

    for slot in &template.slots {
        for role in slot.visibility.iter().chain(slot.editable_by.iter()) {
            if !role_names.contains(role.as_str()) {
                issues.push(ValidationIssue::new(
                    format!("slots.{}", slot.name),
                    format!("references undefined role '{role}'"),
                ));
            }
        }
    }

    for state in &template.states {
        let field = |suffix: &str| format!("states.{}.{suffix}", state.name);
        for slot in state.required_slots.iter().chain(state.optional_slots.iter()) {
            if !slot_names.contains(slot.as_str()) {
                issues.push(ValidationIssue::new(
                    field("required_slots"),
                    format!("references undefined slot '{slot}'"),
                ));
            }
        }
        for role in &state.allowed_roles {
            if !role_names.contains(role.as_str()) {
                issues.push(ValidationIssue::new(
                    field("allowed_roles"),
                    format!("references undefined role '{role}'"),
                ));
            }
        }
        for target in &state.transitions.next {
            if !state_names.contains(target.as_str()) {
                issues.push(ValidationIssue::new(
                    field("transitions.next"),
                    format!("transition targets undefined state '{target}'"),
                ));
            }
        }
    }

    if !state_names.contains(template.initial_state.as_str()) {
        issues.push(ValidationIssue::new(
            "initial_state",
            format!("initial state '{}' is not defined", template.initial_state),
        ));
    } else if issues.is_empty() {
        // Graph checks only run once references are sound. Back-edges
        // (and fully cyclic graphs) are legal; what must hold is that
        // every state can actually occur in some run, i.e. is reachable
        // from the initial state.
        let table = TransitionTable::from_states(&template.states);
        for state in &template.states {
            if !table.reachable(&template.initial_state, &state.name) {
                issues.push(ValidationIssue::new(
                    format!("states.{}", state.name),
                    format!(
                        "state '{}' is not reachable from initial state '{}'",
                        state.name, template.initial_state
                    ),
                ));
            }
        }
    }

    if issues.is_empty() {
        Ok(template)
    } else {
        Err(ValidationError::new(issues))
    }
}

fn check_unique<'a>(
    issues: &mut Vec<ValidationIssue>,
    kind: &str,
    names: impl Iterator<Item = &'a str>,
) {
    let mut seen = BTreeSet::new();
    for name in names {
        if name.trim().is_empty() {
            issues.push(ValidationIssue::new(kind, "name must not be empty"));
        } else if !seen.insert(name) {
            issues.push(ValidationIssue::new(kind, format!("duplicate name '{name}'")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service_request_template() -> serde_json::Value {
        json!({
            "space_id": "space-1",
            "name": "service_request",
            "version": 1,
            "initial_state": "collect",
            "roles": [
                {"name": "requester", "capabilities": ["submit"], "min_participants": 1},
                {"name": "provider", "capabilities": ["quote"], "min_participants": 1, "max_participants": 1}
            ],
            "slots": [
                {"name": "location", "slot_type": "location", "required": true},
                {"name": "issue_description", "slot_type": "text", "required": true},
                {"name": "quote_amount", "slot_type": "currency", "editable_by": ["provider"]}
            ],
            "states": [
                {"name": "collect", "sequence": 1, "required_slots": ["location", "issue_description"],
                 "allowed_roles": ["requester"], "transitions": {"next": ["negotiate"]}},
                {"name": "negotiate", "sequence": 2, "required_slots": ["quote_amount"],
                 "allowed_roles": ["provider", "requester"], "transitions": {"next": ["commit", "collect"]}},
                {"name": "commit", "sequence": 3, "allowed_roles": ["requester"], "transitions": {"next": []}}
            ]
        })
    }

    #[test]
    fn valid_template_compiles() {
        let template = compile(&service_request_template()).expect("should compile");
        assert_eq!(template.states.len(), 3);
        assert!(template.is_legal_transition("negotiate", "collect"));
        assert!(!template.is_legal_transition("collect", "commit"));
    }

    #[test]
    fn sequence_never_grants_legality() {
        // collect (seq 1) -> commit (seq 3) is not declared, so it is
        // illegal no matter what the sequence numbers suggest.
        let template = compile(&service_request_template()).unwrap();
        assert!(!template.is_legal_transition("collect", "commit"));
        assert!(template.state("commit").unwrap().is_terminal());
    }

    #[test]
    fn undefined_slot_reference_rejected() {
        let mut raw = service_request_template();
        raw["states"][0]["required_slots"] = json!(["location", "missing_slot"]);
        let err = compile(&raw).unwrap_err();
        assert!(err
            .issues
            .iter()
            .any(|i| i.message.contains("undefined slot 'missing_slot'")));
    }

    #[test]
    fn undefined_transition_target_rejected() {
        let mut raw = service_request_template();
        raw["states"][2]["transitions"] = json!({"next": ["nowhere"]});
        let err = compile(&raw).unwrap_err();
        assert!(err
            .issues
            .iter()
            .any(|i| i.message.contains("undefined state 'nowhere'")));
    }

    #[test]
    fn undefined_role_reference_rejected() {
        let mut raw = service_request_template();
        raw["slots"][2]["editable_by"] = json!(["auditor"]);
        let err = compile(&raw).unwrap_err();
        assert!(err
            .issues
            .iter()
            .any(|i| i.message.contains("undefined role 'auditor'")));
    }

    #[test]
    fn duplicate_state_names_rejected() {
        let mut raw = service_request_template();
        raw["states"][2]["name"] = json!("collect");
        // Renamed state breaks the negotiate -> commit edge too; only the
        // duplicate matters here.
        let err = compile(&raw).unwrap_err();
        assert!(err.issues.iter().any(|i| i.message.contains("duplicate name 'collect'")));
    }

    #[test]
    fn fully_cyclic_graph_is_valid() {
        let mut raw = service_request_template();
        // commit -> collect closes the loop. Every state still lies on a
        // walk from the initial state, so the cycle is legal.
        raw["states"][2]["transitions"] = json!({"next": ["collect"]});
        compile(&raw).expect("cyclic graph compiles");
    }

    #[test]
    fn initial_state_mid_graph_is_reachable() {
        let mut raw = raw_with_detached_cycle();
        // negotiate reaches collect and commit through its own edges, so
        // starting mid-graph is fine; only the detached cycle is flagged.
        raw["initial_state"] = json!("negotiate");
        let err = compile(&raw).unwrap_err();
        assert!(!err.issues.iter().any(|i| i.message.contains("'commit'")));
        assert!(err.issues.iter().any(|i| i.message.contains("'loop_a'")));
    }

    fn raw_with_detached_cycle() -> serde_json::Value {
        let mut raw = service_request_template();
        let states = raw["states"].as_array_mut().unwrap();
        states.push(json!({"name": "loop_a", "transitions": {"next": ["loop_b"]}}));
        states.push(json!({"name": "loop_b", "transitions": {"next": ["loop_a"]}}));
        raw
    }

    #[test]
    fn states_unreachable_from_initial_rejected() {
        // A detached two-state cycle alongside the main graph: no walk
        // from collect reaches it.
        let err = compile(&raw_with_detached_cycle()).unwrap_err();
        for name in ["loop_a", "loop_b"] {
            assert!(err
                .issues
                .iter()
                .any(|i| i.message.contains(&format!("'{name}' is not reachable"))));
        }
    }

    #[test]
    fn malformed_document_rejected() {
        let err = compile(&json!({"name": 42})).unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert!(err.issues[0].message.contains("malformed document"));
    }

    #[test]
    fn min_over_max_participants_rejected() {
        let mut raw = service_request_template();
        raw["roles"][1]["min_participants"] = json!(3);
        let err = compile(&raw).unwrap_err();
        assert!(err.issues.iter().any(|i| i.message.contains("exceeds max_participants")));
    }
}
