//! Feature gates
//!
//! Gates are parsed once from a comma-separated `Name=true|false` list into an
//! immutable [`FeatureGates`] snapshot. Controllers receive a snapshot at
//! construction; the [`FeatureGateRegistry`] only exists to hold the current
//! snapshot for the process and to allow explicit re-initialisation in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

/// Environment variable holding the feature gate list
pub const FEATURE_GATES_ENV: &str = "FEATURE_GATES";

/// Gates understood by the operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FeatureGate {
    /// Run spire-controller-manager next to the server and render its config
    SpireControllerManager,
    /// Request SELinux mount support on the CSIDriver object
    CsiDriverSeLinuxMount,
}

impl FeatureGate {
    pub const ALL: [FeatureGate; 2] = [
        FeatureGate::SpireControllerManager,
        FeatureGate::CsiDriverSeLinuxMount,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureGate::SpireControllerManager => "SpireControllerManager",
            FeatureGate::CsiDriverSeLinuxMount => "CsiDriverSeLinuxMount",
        }
    }

    /// Value used when the gate is not listed
    pub fn default_enabled(&self) -> bool {
        match self {
            FeatureGate::SpireControllerManager => true,
            FeatureGate::CsiDriverSeLinuxMount => false,
        }
    }
}

impl fmt::Display for FeatureGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable set of feature gate values
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureGates {
    gates: BTreeMap<String, bool>,
}

impl FeatureGates {
    /// Parse a `Name=true,Other=false` list
    ///
    /// Whitespace around names and values is trimmed. Entries without `=`,
    /// with an empty name, or with a value other than true/false are skipped.
    pub fn parse(input: &str) -> Self {
        let mut gates = BTreeMap::new();

        for entry in input.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let Some((name, value)) = entry.split_once('=') else {
                warn!(entry = %entry, "Skipping malformed feature gate entry");
                continue;
            };

            let name = name.trim();
            let value = value.trim();
            if name.is_empty() {
                warn!(entry = %entry, "Skipping feature gate entry without a name");
                continue;
            }

            let enabled = if value.eq_ignore_ascii_case("true") {
                true
            } else if value.eq_ignore_ascii_case("false") {
                false
            } else {
                warn!(gate = %name, value = %value, "Skipping feature gate with non-boolean value");
                continue;
            };

            gates.insert(name.to_string(), enabled);
        }

        Self { gates }
    }

    /// Build from explicit pairs (used by tests and defaults)
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        Self {
            gates: pairs
                .into_iter()
                .map(|(name, enabled)| (name.to_string(), enabled))
                .collect(),
        }
    }

    /// Value of a known gate, falling back to its default
    pub fn enabled(&self, gate: FeatureGate) -> bool {
        self.gates
            .get(gate.name())
            .copied()
            .unwrap_or_else(|| gate.default_enabled())
    }

    /// Raw lookup by name; `None` when the gate was not listed
    pub fn get(&self, name: &str) -> Option<bool> {
        self.gates.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

/// Process-wide holder of the current feature gate snapshot
///
/// Written once at startup (or explicitly in tests) and read by any number of
/// controllers. Readers get an `Arc` to an immutable snapshot, so they never
/// hold the lock while reconciling.
#[derive(Debug, Default)]
pub struct FeatureGateRegistry {
    current: RwLock<Arc<FeatureGates>>,
}

impl FeatureGateRegistry {
    pub fn new(gates: FeatureGates) -> Self {
        Self {
            current: RwLock::new(Arc::new(gates)),
        }
    }

    /// Initialise from a configured gate list and an optional environment value
    ///
    /// When the environment value is present it replaces the configured list
    /// entirely; the two are never merged.
    pub fn initialize(configured: Option<&str>, env_value: Option<&str>) -> Self {
        let gates = match (env_value, configured) {
            (Some(env), _) => {
                info!(source = FEATURE_GATES_ENV, "Loading feature gates from environment");
                FeatureGates::parse(env)
            }
            (None, Some(list)) => FeatureGates::parse(list),
            (None, None) => FeatureGates::default(),
        };

        for gate in FeatureGate::ALL {
            debug!(gate = %gate, enabled = gates.enabled(gate), "Feature gate");
        }

        Self::new(gates)
    }

    /// Initialise from [`FEATURE_GATES_ENV`]
    pub fn from_env(configured: Option<&str>) -> Self {
        let env_value = std::env::var(FEATURE_GATES_ENV).ok();
        Self::initialize(configured, env_value.as_deref())
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<FeatureGates> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the snapshot; existing readers keep the one they already hold
    pub fn reinitialize(&self, gates: FeatureGates) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(gates);
    }
}
