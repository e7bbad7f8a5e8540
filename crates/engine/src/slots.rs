//! Slot write validation and required-slot completeness.
//!
//! Slot values are opaque JSON; the engine only checks presence and
//! emptiness. Completeness is always evaluated against the currently
//! open state visit -- values from an earlier visit to the same state
//! (before a back-edge re-entry) never count.

use accord_core::{StateDef, Template};
use accord_storage::SlotValueRecord;

use crate::error::EngineError;

/// The emptiness rule for completeness checks: null, blank strings, and
/// empty collections do not satisfy a required slot.
pub fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Check a single slot write against the template and the current state.
///
/// Rejects when the slot is not defined, is not collected in this state,
/// or the writing role lacks edit rights. Edit rights are role-absolute:
/// a role missing from `editable_by` is rejected regardless of state.
pub fn validate_slot_write(
    template: &Template,
    state: &StateDef,
    role: &str,
    slot: &str,
) -> Result<(), EngineError> {
    let def = template.slot(slot).ok_or_else(|| EngineError::SlotRejected {
        slot: slot.to_string(),
        reason: "slot is not defined by the template".to_string(),
    })?;
    if !state.accepts_slot(slot) {
        return Err(EngineError::SlotRejected {
            slot: slot.to_string(),
            reason: format!("slot is not collected in state '{}'", state.name),
        });
    }
    if !def.editable_by_role(role) {
        return Err(EngineError::SlotRejected {
            slot: slot.to_string(),
            reason: format!("role '{role}' lacks edit rights"),
        });
    }
    Ok(())
}

/// Required slots of `state` with no non-empty value among `values`
/// (the slot data of the currently open visit).
pub fn missing_required_slots(state: &StateDef, values: &[SlotValueRecord]) -> Vec<String> {
    state
        .required_slots
        .iter()
        .filter(|slot| {
            !values
                .iter()
                .any(|v| &v.slot == *slot && !is_empty_value(&v.value))
        })
        .cloned()
        .collect()
}
