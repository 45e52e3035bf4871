pub mod aggregation;
pub mod context;
pub mod create_only;
pub mod error;
pub mod feature_gates;
pub mod operand;
pub mod reconciler;
pub mod status;
pub mod validation;

pub use aggregation::{AggregateConditions, aggregate, reconcile_manager};
pub use context::Context;
pub use create_only::{CreateOnlyDecision, CreateOnlySource};
pub use error::{BackoffConfig, Error, Result, RetryConfig};
pub use feature_gates::{FeatureGate, FeatureGateRegistry, FeatureGates};
pub use operand::{Child, ChildOutcome, Operand, ReconcileStep, RenderContext};
pub use reconciler::{error_policy, reconcile, reconcile_operand};
pub use status::{ConditionBuilder, ConditionUpdate, PendingConditions, StatusManager};
pub use validation::{ValidationViolation, validate_scheduling};
