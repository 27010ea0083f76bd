//! Per-credential request budgets and the governor that enforces them.
//!
//! Every adapter call goes through [`Governor::execute`]. The governor reads
//! the shared [`RateBudget`] for the credential set fresh before each call,
//! fails fast with [`Error::RateLimited`] when the budget is spent, and
//! retries transient failures a bounded number of times with exponential
//! backoff. Budgets live in a process-wide [`BudgetRegistry`] keyed by
//! [`CredentialKey`], so concurrent reconciles that share credentials also
//! share one budget.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::RetryConfig;
use crate::error::{Error, ProviderError, Result};

/// Identity of a credential set.
///
/// Holds a SHA-1 fingerprint of the secret material, never the secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey(String);

impl CredentialKey {
    /// Fingerprint the given secret parts for `provider`.
    #[must_use]
    pub fn new(provider: &str, secret_parts: &[&str]) -> Self {
        let mut hasher = Sha1::new();
        for part in secret_parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        Self(format!("{provider}:{}", hex::encode(hasher.finalize())))
    }

    /// The key as a string, for logging.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Size of a request budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConfig {
    /// Requests allowed per window.
    pub limit: u32,
    /// Window length in seconds.
    pub window_seconds: u64,
}

impl BudgetConfig {
    /// Window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Rate-limit information reported by the provider on a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    /// Total requests allowed per window.
    pub limit: Option<u32>,
    /// Requests left in the current window.
    pub remaining: Option<u32>,
    /// Time until the window resets.
    pub reset_in: Option<Duration>,
}

/// Request budget for one credential set.
#[derive(Debug, Clone)]
pub struct RateBudget {
    limit: u32,
    remaining: u32,
    window: Duration,
    reset_at: Instant,
    throttled_until: Option<Instant>,
}

impl RateBudget {
    /// A full budget whose window starts at `now`.
    #[must_use]
    pub fn new(config: &BudgetConfig, now: Instant) -> Self {
        Self {
            limit: config.limit,
            remaining: config.limit,
            window: config.window(),
            reset_at: now + config.window(),
            throttled_until: None,
        }
    }

    /// Calls left in the current window.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Take one call from the budget, or return how long to wait.
    ///
    /// # Errors
    /// Returns the delay until the budget can serve another call.
    pub fn try_acquire(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        if let Some(until) = self.throttled_until {
            if now < until {
                return Err(until - now);
            }
            self.throttled_until = None;
        }

        if now >= self.reset_at {
            self.remaining = self.limit;
            self.reset_at = now + self.window;
        }

        match self.remaining.checked_sub(1) {
            Some(left) => {
                self.remaining = left;
                Ok(())
            }
            None => Err(self.reset_at.saturating_duration_since(now)),
        }
    }

    /// Fold provider-reported limits into the budget.
    ///
    /// The provider's counters are authoritative, but never raise
    /// `remaining` above what this process already knows it has spent.
    pub fn observe(&mut self, snapshot: RateLimitSnapshot, now: Instant) {
        if let Some(limit) = snapshot.limit {
            self.limit = limit;
        }
        if let Some(reset_in) = snapshot.reset_in {
            self.reset_at = now + reset_in;
        }
        if let Some(remaining) = snapshot.remaining {
            self.remaining = self.remaining.min(remaining);
        }
    }

    /// Block the budget until `now + retry_after`.
    pub fn throttle(&mut self, retry_after: Duration, now: Instant) {
        self.remaining = 0;
        let until = now + retry_after;
        self.throttled_until = Some(self.throttled_until.map_or(until, |t| t.max(until)));
        if self.reset_at < until {
            self.reset_at = until;
        }
    }
}

/// Process-wide map from credential identity to its shared budget.
#[derive(Debug, Default)]
pub struct BudgetRegistry {
    budgets: StdMutex<HashMap<CredentialKey, Arc<Mutex<RateBudget>>>>,
}

impl BudgetRegistry {
    /// An empty registry. Tests use this to isolate budgets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every adapter in the process.
    pub fn global() -> &'static BudgetRegistry {
        static GLOBAL: OnceLock<BudgetRegistry> = OnceLock::new();
        GLOBAL.get_or_init(BudgetRegistry::new)
    }

    /// Budget for `key`, created from `config` on first use.
    pub fn budget(&self, key: &CredentialKey, config: &BudgetConfig) -> Arc<Mutex<RateBudget>> {
        let mut budgets = self
            .budgets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        budgets
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(credential = %key.as_str(), limit = config.limit, "Creating rate budget");
                Arc::new(Mutex::new(RateBudget::new(config, Instant::now())))
            })
            .clone()
    }
}

/// Enforces a shared budget and the transient-retry policy for one adapter.
#[derive(Debug, Clone)]
pub struct Governor {
    provider: &'static str,
    budget: Arc<Mutex<RateBudget>>,
    retry: RetryConfig,
    default_retry_after: Duration,
}

impl Governor {
    /// Create a governor bound to the budget for `key` in `registry`.
    #[must_use]
    pub fn new(
        provider: &'static str,
        key: &CredentialKey,
        budget: &BudgetConfig,
        retry: RetryConfig,
        default_retry_after: Duration,
        registry: &BudgetRegistry,
    ) -> Self {
        Self {
            provider,
            budget: registry.budget(key, budget),
            retry,
            default_retry_after,
        }
    }

    /// Name of the provider this governor protects.
    #[must_use]
    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Calls left in the shared budget.
    pub async fn remaining(&self) -> u32 {
        self.budget.lock().await.remaining()
    }

    /// Reserve one call, failing fast when the budget is spent.
    ///
    /// # Errors
    /// Returns [`Error::RateLimited`] with the time until the budget recovers.
    pub async fn acquire(&self) -> Result<()> {
        let mut budget = self.budget.lock().await;
        budget
            .try_acquire(Instant::now())
            .map_err(|retry_after| Error::RateLimited {
                provider: self.provider,
                retry_after,
            })
    }

    /// Record provider-reported limits.
    pub async fn observe(&self, snapshot: RateLimitSnapshot) {
        self.budget.lock().await.observe(snapshot, Instant::now());
    }

    /// Mark the budget as exhausted for `retry_after`.
    pub async fn throttle(&self, retry_after: Duration) {
        self.budget.lock().await.throttle(retry_after, Instant::now());
    }

    /// Run `operation` under the budget and the transient retry policy.
    ///
    /// # Errors
    /// Returns the classified error once the operation fails for good.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.acquire().await?;

            match operation().await {
                Ok(value) => return Ok(value),
                Err(ProviderError::RateLimited { retry_after }) => {
                    let retry_after = retry_after.unwrap_or(self.default_retry_after);
                    warn!(
                        provider = self.provider,
                        operation = operation_name,
                        retry_after_secs = retry_after.as_secs(),
                        "Provider rate limit hit"
                    );
                    self.throttle(retry_after).await;
                    return Err(Error::RateLimited {
                        provider: self.provider,
                        retry_after,
                    });
                }
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    debug!(
                        provider = self.provider,
                        operation = operation_name,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "Transient failure, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(Error::Retryable(format!(
                        "{operation_name} failed after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => return Err(e.classify()),
            }
        }
    }
}
