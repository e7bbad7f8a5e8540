use serde::{Deserialize, Serialize};

/// A single problem found while validating a raw template document.
///
/// `field` is a dotted path into the offending definition
/// (e.g. `states.negotiate.transitions.next`), so the authoring
/// collaborator can attach the message to the right form element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A template failed validation. Carries every issue found, not just the
/// first, so a single round-trip surfaces all problems.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("template validation failed with {} issue(s)", issues.len())]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        ValidationError { issues }
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError {
            issues: vec![ValidationIssue::new(field, message)],
        }
    }
}
