//! Construction options shared by the HTTP adapters.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::backoff::RetryConfig;
use crate::error::ProviderError;
use crate::governor::BudgetConfig;

/// Options for building a Cloud or Robot API client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    /// API base URL without trailing slash.
    pub base_url: String,
    /// Request budget for the credential set.
    pub budget: BudgetConfig,
    /// Transient retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Delay applied when the provider rate-limits without a hint, in seconds.
    pub default_retry_after_seconds: u64,
    /// Per-request timeout, in seconds.
    pub request_timeout_seconds: u64,
}

impl ClientOptions {
    /// Delay applied when the provider rate-limits without a hint.
    #[must_use]
    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_seconds)
    }

    /// Per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Check that the options describe a usable client.
    ///
    /// # Errors
    /// Returns [`ProviderError::Config`] for a malformed base URL or an empty
    /// budget.
    pub fn validate(&self) -> Result<(), ProviderError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ProviderError::Config(format!("invalid base URL {}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProviderError::Config(format!(
                "unsupported scheme in base URL {}",
                self.base_url
            )));
        }
        if self.budget.limit == 0 || self.budget.window_seconds == 0 {
            return Err(ProviderError::Config("rate budget must be non-zero".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ProviderError::Config("retry.maxAttempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Replace the base URL, e.g. to point at a mock server.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}
