use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::OperatorConfig;
use crate::controller::error::{BackoffConfig, Error, Result, RetryConfig};
use crate::controller::feature_gates::FeatureGates;
use crate::controller::status::StatusManager;
use crate::health::HealthState;
use crate::store::{KubeStore, ObjectStore};

/// Shared context for the controllers
pub struct Context<S = KubeStore> {
    /// Backing object store
    pub store: S,
    /// Operator configuration
    pub config: OperatorConfig,
    /// Feature gate snapshot taken when the controller was built
    pub feature_gates: Arc<FeatureGates>,
    /// Health state for recording metrics
    pub health_state: Option<Arc<HealthState>>,
    /// Cancelled on shutdown; observed between store calls
    pub cancel: CancellationToken,
    /// Conflict retry budget for status writes
    pub status_retry: RetryConfig,
    /// Requeue backoff for failed reconciles
    pub backoff: BackoffConfig,
    /// Consecutive reconcile failures per object key
    failures: Mutex<HashMap<String, u32>>,
}

impl<S: ObjectStore> Context<S> {
    pub fn new(
        store: S,
        config: OperatorConfig,
        feature_gates: Arc<FeatureGates>,
        health_state: Option<Arc<HealthState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            feature_gates,
            health_state,
            cancel,
            status_retry: RetryConfig::default(),
            backoff: BackoffConfig::default(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Override the requeue backoff
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Requeue delay after another failure of `key`
    ///
    /// Each consecutive failure advances the backoff by one attempt until
    /// [`Context::reset_backoff`] is called for the key.
    pub fn requeue_delay(&self, key: &str, error: &Error) -> Duration {
        let attempt = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let count = failures.entry(key.to_string()).or_insert(0);
            let attempt = *count;
            *count = count.saturating_add(1);
            attempt
        };
        self.backoff.delay_for_error(error, attempt)
    }

    /// Forget the failure streak of `key` after a successful reconcile
    pub fn reset_backoff(&self, key: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }

    /// Override the status retry budget
    pub fn with_status_retry(mut self, retry: RetryConfig) -> Self {
        self.status_retry = retry;
        self
    }

    /// Status writer bound to this context
    pub fn status_manager(&self) -> StatusManager<'_, S> {
        StatusManager::new(&self.store, &self.status_retry, &self.cancel)
    }

    /// Fail with [`Error::Cancelled`] once shutdown has started
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
