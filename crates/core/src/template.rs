//! Template data model: roles, slots, states, and the transition table.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Lookup key for a published template. Publishing the same key again is
/// an upsert of that row; other versions are untouched.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateKey {
    pub space_id: String,
    pub name: String,
    pub version: u32,
}

/// A participant role defined by a template.
///
/// `capabilities` are opaque tags; the engine only tests for their
/// presence when computing a permission set, never their meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_min_participants")]
    pub min_participants: u32,
    #[serde(default)]
    pub max_participants: Option<u32>,
}

fn default_min_participants() -> u32 {
    1
}

/// Slot value kinds. These drive client-side rendering only; the engine
/// treats every value as opaque JSON beyond presence/emptiness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    Text,
    Number,
    Date,
    File,
    Location,
    Currency,
    Boolean,
    Select,
    Multiselect,
    Email,
    Phone,
    Url,
    Json,
}

impl Default for SlotType {
    fn default() -> Self {
        SlotType::Text
    }
}

/// A named data slot collected during a run.
///
/// Empty `visibility` / `editable_by` lists mean "every role".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDef {
    pub name: String,
    #[serde(default)]
    pub slot_type: SlotType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub visibility: Vec<String>,
    #[serde(default)]
    pub editable_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<serde_json::Value>,
}

impl SlotDef {
    /// Whether `role` may write this slot. An empty `editable_by` list
    /// grants edit rights to every role.
    pub fn editable_by_role(&self, role: &str) -> bool {
        self.editable_by.is_empty() || self.editable_by.iter().any(|r| r == role)
    }

    /// Whether `role` may read this slot's value. `None` (no resolved
    /// role) only sees slots visible to everyone.
    pub fn visible_to_role(&self, role: Option<&str>) -> bool {
        if self.visibility.is_empty() {
            return true;
        }
        match role {
            Some(r) => self.visibility.iter().any(|v| v == r),
            None => false,
        }
    }
}

/// Outgoing edges of a state. The `next` list is the only source of
/// transition legality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transitions {
    #[serde(default)]
    pub next: Vec<String>,
}

/// A workflow state: the slots it requires, the roles allowed to act in
/// it, and its legal successors.
///
/// `sequence` exists for UI ordering only. Transition legality comes from
/// `transitions.next` exclusively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDef {
    pub name: String,
    #[serde(default)]
    pub sequence: u32,
    #[serde(default)]
    pub required_slots: Vec<String>,
    #[serde(default)]
    pub optional_slots: Vec<String>,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    #[serde(default)]
    pub transitions: Transitions,
}

impl StateDef {
    /// Whether `slot` may be written while this state is open.
    pub fn accepts_slot(&self, slot: &str) -> bool {
        self.required_slots.iter().any(|s| s == slot)
            || self.optional_slots.iter().any(|s| s == slot)
    }

    pub fn allows_role(&self, role: &str) -> bool {
        self.allowed_roles.iter().any(|r| r == role)
    }

    /// A state with no outgoing edges is terminal; reaching it completes
    /// the run.
    pub fn is_terminal(&self) -> bool {
        self.transitions.next.is_empty()
    }
}

/// Explicit adjacency map over state names.
///
/// Built from the per-state `transitions.next` lists; used for the
/// reachability checks at compile time. Deterministic iteration order
/// (BTree) keeps validation output stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionTable {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl TransitionTable {
    pub fn from_states(states: &[StateDef]) -> Self {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for state in states {
            let targets = edges.entry(state.name.clone()).or_default();
            for next in &state.transitions.next {
                targets.insert(next.clone());
            }
        }
        TransitionTable { edges }
    }

    pub fn successors(&self, state: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(state)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// BFS reachability from `from` to `to`. Cycles are fine; visited-set
    /// bookkeeping terminates the walk.
    pub fn reachable(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(from);
        seen.insert(from);
        while let Some(current) = queue.pop_front() {
            for next in self.successors(current) {
                if next == to {
                    return true;
                }
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        false
    }
}

/// A compiled, immutable coordination template.
///
/// Only [`crate::compile`] produces one of these with its invariants
/// established: every cross-reference (slot, role, state, transition
/// target) resolves, and every state is reachable from the initial
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub space_id: String,
    pub name: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub initial_state: String,
    pub roles: Vec<Role>,
    pub slots: Vec<SlotDef>,
    pub states: Vec<StateDef>,
}

impl Template {
    pub fn key(&self) -> TemplateKey {
        TemplateKey {
            space_id: self.space_id.clone(),
            name: self.name.clone(),
            version: self.version,
        }
    }

    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn slot(&self, name: &str) -> Option<&SlotDef> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn transition_table(&self) -> TransitionTable {
        TransitionTable::from_states(&self.states)
    }

    /// Transition legality: `to` must be listed in `from`'s
    /// `transitions.next`. Never inferred from `sequence`.
    pub fn is_legal_transition(&self, from: &str, to: &str) -> bool {
        self.state(from)
            .map(|s| s.transitions.next.iter().any(|n| n == to))
            .unwrap_or(false)
    }
}
