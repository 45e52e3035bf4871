//! Create-only mode
//!
//! When enabled, missing child objects are still created but existing ones are
//! never updated. The switch is an environment flag read on every reconcile so
//! an administrator can flip it without restarting the operator.

use tracing::warn;

use crate::controller::status::{ConditionUpdate, condition_status, condition_types, find_condition};
use crate::crd::Condition;

/// Environment variable holding the create-only flag
pub const CREATE_ONLY_MODE_ENV: &str = "CREATE_ONLY_MODE";

/// Where the create-only flag is read from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOnlySource {
    /// Read the named environment variable on every call
    Env(String),
    /// Fixed value
    Static(bool),
}

impl Default for CreateOnlySource {
    fn default() -> Self {
        CreateOnlySource::Env(CREATE_ONLY_MODE_ENV.to_string())
    }
}

impl CreateOnlySource {
    /// Raw flag value; `None` when the variable is unset
    pub fn read(&self) -> Option<String> {
        match self {
            CreateOnlySource::Env(name) => std::env::var(name).ok(),
            CreateOnlySource::Static(value) => Some(value.to_string()),
        }
    }

    /// Whether create-only mode is currently active
    pub fn is_enabled(&self) -> bool {
        flag_enabled(self.read().as_deref())
    }
}

/// Interpret a boolean flag string; absent or unparsable means false
pub fn flag_enabled(flag: Option<&str>) -> bool {
    match flag.map(str::trim) {
        None | Some("") => false,
        Some(value) if value.eq_ignore_ascii_case("true") => true,
        Some(value) if value.eq_ignore_ascii_case("false") => false,
        Some(value) => {
            warn!(value = %value, "Ignoring non-boolean {} value", CREATE_ONLY_MODE_ENV);
            false
        }
    }
}

/// Outcome of evaluating create-only mode for one reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateOnlyDecision {
    /// Suppress updates to existing child objects
    pub enabled: bool,
    /// Condition change to record, if any
    pub condition: Option<ConditionUpdate>,
}

/// Decide create-only mode from the flag and the operand's current conditions
///
/// An enabled flag always wins. When the flag is off, a False condition is
/// only queued if the operand previously recorded create-only mode as True,
/// leaving an audit trail of the switch being turned off without rewriting
/// an already-False condition.
pub fn evaluate(flag: Option<&str>, conditions: &[Condition]) -> CreateOnlyDecision {
    if flag_enabled(flag) {
        return CreateOnlyDecision {
            enabled: true,
            condition: Some(ConditionUpdate::new(
                condition_types::CREATE_ONLY_MODE,
                condition_status::TRUE,
                "CreateOnlyModeEnabled",
                "Create-only mode is enabled; existing resources are not updated",
            )),
        };
    }

    let previously_enabled = find_condition(conditions, condition_types::CREATE_ONLY_MODE)
        .is_some_and(|c| c.status == condition_status::TRUE);

    CreateOnlyDecision {
        enabled: false,
        condition: previously_enabled.then(|| {
            ConditionUpdate::new(
                condition_types::CREATE_ONLY_MODE,
                condition_status::FALSE,
                "CreateOnlyModeDisabled",
                "Create-only mode is disabled; resources are updated to match the spec",
            )
        }),
    }
}
