//! Validation of operand scheduling configuration
//!
//! The API server accepts some scheduling shapes that can never place a pod
//! (for example a required node affinity with no terms). These are rejected
//! here, before any child object is created or updated. Validation is pure and
//! stops at the first violation.

use std::collections::BTreeMap;
use std::fmt;

use crate::controller::error::Error;
use crate::crd::{CommonConfig, Toleration};

/// Maximum length of the name segment of a label key
pub const MAX_LABEL_NAME_LENGTH: usize = 63;

/// Rule identifiers reported in violations
pub mod rules {
    pub const NODE_AFFINITY_REQUIRED_TERMS: &str = "node-affinity-required-terms";
    pub const TOLERATION_OPERATOR: &str = "toleration-operator";
    pub const TOLERATION_EXISTS_VALUE: &str = "toleration-exists-value";
    pub const TOLERATION_EFFECT: &str = "toleration-effect";
    pub const LABEL_KEY: &str = "label-key";
    pub const NODE_SELECTOR_KEY: &str = "node-selector-key";
}

const TOLERATION_OPERATORS: [&str; 2] = ["Exists", "Equal"];
const TAINT_EFFECTS: [&str; 3] = ["NoSchedule", "PreferNoSchedule", "NoExecute"];

/// A single violated rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationViolation {
    /// Stable rule identifier
    pub rule: &'static str,
    /// Human-readable description of the problem
    pub message: String,
}

impl ValidationViolation {
    fn new(rule: &'static str, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.message)
    }
}

impl From<ValidationViolation> for Error {
    fn from(v: ValidationViolation) -> Self {
        Error::ValidationError(v.to_string())
    }
}

/// Validate the scheduling-related fields of an operand
pub fn validate_scheduling(config: &CommonConfig) -> Result<(), ValidationViolation> {
    validate_affinity(config)?;
    for (index, toleration) in config.tolerations.iter().enumerate() {
        validate_toleration(index, toleration)?;
    }
    validate_keys(&config.labels, rules::LABEL_KEY, "label")?;
    validate_keys(&config.node_selector, rules::NODE_SELECTOR_KEY, "node selector")?;
    Ok(())
}

/// A required node affinity must contain at least one term
fn validate_affinity(config: &CommonConfig) -> Result<(), ValidationViolation> {
    let required = config
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|n| n.required_during_scheduling_ignored_during_execution.as_ref());

    if let Some(selector) = required
        && selector.node_selector_terms.is_empty()
    {
        return Err(ValidationViolation::new(
            rules::NODE_AFFINITY_REQUIRED_TERMS,
            "affinity.nodeAffinity.requiredDuringSchedulingIgnoredDuringExecution.nodeSelectorTerms \
             must contain at least one term",
        ));
    }

    Ok(())
}

fn validate_toleration(index: usize, toleration: &Toleration) -> Result<(), ValidationViolation> {
    let operator = toleration.operator.as_deref().unwrap_or("Equal");

    if !TOLERATION_OPERATORS.contains(&operator) {
        return Err(ValidationViolation::new(
            rules::TOLERATION_OPERATOR,
            format!(
                "tolerations[{}].operator must be one of {:?}, got {:?}",
                index, TOLERATION_OPERATORS, operator
            ),
        ));
    }

    if operator == "Exists" && toleration.value.as_deref().is_some_and(|v| !v.is_empty()) {
        return Err(ValidationViolation::new(
            rules::TOLERATION_EXISTS_VALUE,
            format!(
                "tolerations[{}].value must be empty when operator is Exists",
                index
            ),
        ));
    }

    if let Some(effect) = toleration.effect.as_deref()
        && !effect.is_empty()
        && !TAINT_EFFECTS.contains(&effect)
    {
        return Err(ValidationViolation::new(
            rules::TOLERATION_EFFECT,
            format!(
                "tolerations[{}].effect must be one of {:?}, got {:?}",
                index, TAINT_EFFECTS, effect
            ),
        ));
    }

    Ok(())
}

/// Keys must be non-empty and their name segment (after an optional `prefix/`)
/// at most 63 characters
fn validate_keys(
    map: &BTreeMap<String, String>,
    rule: &'static str,
    what: &str,
) -> Result<(), ValidationViolation> {
    for key in map.keys() {
        let name = key.rsplit_once('/').map_or(key.as_str(), |(_, name)| name);
        if name.is_empty() {
            return Err(ValidationViolation::new(
                rule,
                format!("{} key {:?} has an empty name", what, key),
            ));
        }
        if name.len() > MAX_LABEL_NAME_LENGTH {
            return Err(ValidationViolation::new(
                rule,
                format!(
                    "{} key {:?} exceeds {} characters",
                    what, key, MAX_LABEL_NAME_LENGTH
                ),
            ));
        }
    }
    Ok(())
}
