//! Operator configuration loaded from a mounted YAML file.

use std::path::Path;
use std::time::Duration;

use hetzner_provider::{robot, BudgetConfig, ClientOptions, RetryConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::install::InstallTimeouts;

/// Path the deployment mounts the config at.
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main operator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub host: HostConfig,
    pub secrets: SecretKeys,
    pub endpoints: Endpoints,
}

/// Request budgets per credential set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    /// Used when the provider rate-limits without a hint.
    pub default_retry_after_seconds: u64,
    pub request_timeout_seconds: u64,
    pub robot: BudgetConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_retry_after_seconds: 300,
            request_timeout_seconds: 30,
            robot: robot::default_options().budget,
        }
    }
}

/// Host state machine timing. All values in seconds unless named otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(clippy::struct_field_names)]
pub struct HostConfig {
    pub rescue_boot_timeout_seconds: u64,
    pub rescue_boot_poll_seconds: u64,
    /// Connect failures in `Registering`/`ImageInstalling` before demotion.
    pub registering_connect_cap: u32,
    pub provisioning_timeout_seconds: u64,
    pub os_boot_poll_seconds: u64,
    pub provisioned_check_interval_seconds: u64,
    pub retryable_requeue_seconds: u64,
    pub secret_error_retry_delay_seconds: u64,
    pub ssh_connect_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
    /// Script run in the rescue system before the image is installed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_provision_command: Option<String>,
    pub pre_provision_timeout_seconds: u64,
    pub fetch_image_timeout_seconds: u64,
    pub partition_timeout_seconds: u64,
    pub write_image_timeout_seconds: u64,
    pub post_install_timeout_seconds: u64,
    /// Upper bound for a whole reconcile step. Must cover a full install
    /// pipeline run, retries included.
    pub step_deadline_seconds: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            rescue_boot_timeout_seconds: 900,
            rescue_boot_poll_seconds: 20,
            registering_connect_cap: 3,
            provisioning_timeout_seconds: 1_800,
            os_boot_poll_seconds: 30,
            provisioned_check_interval_seconds: 300,
            retryable_requeue_seconds: 10,
            secret_error_retry_delay_seconds: 10,
            ssh_connect_timeout_seconds: 15,
            command_timeout_seconds: 120,
            pre_provision_command: None,
            pre_provision_timeout_seconds: 300,
            fetch_image_timeout_seconds: 1_200,
            partition_timeout_seconds: 300,
            write_image_timeout_seconds: 1_800,
            post_install_timeout_seconds: 900,
            step_deadline_seconds: 10_800,
        }
    }
}

impl HostConfig {
    #[must_use]
    pub fn rescue_boot_timeout(&self) -> Duration {
        Duration::from_secs(self.rescue_boot_timeout_seconds)
    }

    #[must_use]
    pub fn rescue_boot_poll(&self) -> Duration {
        Duration::from_secs(self.rescue_boot_poll_seconds)
    }

    #[must_use]
    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_seconds)
    }

    #[must_use]
    pub fn os_boot_poll(&self) -> Duration {
        Duration::from_secs(self.os_boot_poll_seconds)
    }

    #[must_use]
    pub fn provisioned_check_interval(&self) -> Duration {
        Duration::from_secs(self.provisioned_check_interval_seconds)
    }

    #[must_use]
    pub fn retryable_requeue(&self) -> Duration {
        Duration::from_secs(self.retryable_requeue_seconds)
    }

    #[must_use]
    pub fn secret_error_retry_delay(&self) -> Duration {
        Duration::from_secs(self.secret_error_retry_delay_seconds)
    }

    #[must_use]
    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_seconds)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    #[must_use]
    pub fn step_deadline(&self) -> Duration {
        Duration::from_secs(self.step_deadline_seconds)
    }

    /// Longest a step can legitimately run: the rescue login check followed
    /// by a full install pipeline.
    #[must_use]
    pub fn worst_case_step(&self) -> Duration {
        self.ssh_connect_timeout()
            + self.command_timeout()
            + self.install_timeouts().worst_case(self.ssh_connect_timeout())
    }

    #[must_use]
    pub fn install_timeouts(&self) -> InstallTimeouts {
        InstallTimeouts {
            pre_provision: Duration::from_secs(self.pre_provision_timeout_seconds),
            fetch_image: Duration::from_secs(self.fetch_image_timeout_seconds),
            partition: Duration::from_secs(self.partition_timeout_seconds),
            write_image: Duration::from_secs(self.write_image_timeout_seconds),
            post_install: Duration::from_secs(self.post_install_timeout_seconds),
        }
    }
}

/// Key names looked up in referenced secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretKeys {
    pub robot_user: String,
    pub robot_password: String,
    pub ssh_key_name: String,
    pub ssh_public_key: String,
    pub ssh_private_key: String,
}

impl Default for SecretKeys {
    fn default() -> Self {
        Self {
            robot_user: "robot-user".to_string(),
            robot_password: "robot-password".to_string(),
            ssh_key_name: "sshkey-name".to_string(),
            ssh_public_key: "ssh-publickey".to_string(),
            ssh_private_key: "ssh-privatekey".to_string(),
        }
    }
}

/// API base URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Endpoints {
    pub robot: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            robot: robot::API_BASE_URL.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a mounted file.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_mounted_file(config_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_yaml::from_str(&config_str)?)
    }

    /// Load from `config_path`, using defaults when the file does not exist.
    ///
    /// # Errors
    /// Returns [`ConfigError`] for unreadable or malformed files.
    pub fn load_or_default(config_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = config_path.as_ref();
        if path.exists() {
            Self::from_mounted_file(path)
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Reject values the operator cannot run with.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));
        let host = &self.host;

        if host.registering_connect_cap == 0 {
            return invalid("host.registeringConnectCap must be at least 1");
        }
        let positive = [
            ("host.rescueBootTimeoutSeconds", host.rescue_boot_timeout_seconds),
            ("host.rescueBootPollSeconds", host.rescue_boot_poll_seconds),
            ("host.provisioningTimeoutSeconds", host.provisioning_timeout_seconds),
            ("host.osBootPollSeconds", host.os_boot_poll_seconds),
            ("host.provisionedCheckIntervalSeconds", host.provisioned_check_interval_seconds),
            ("host.retryableRequeueSeconds", host.retryable_requeue_seconds),
            ("host.secretErrorRetryDelaySeconds", host.secret_error_retry_delay_seconds),
            ("host.sshConnectTimeoutSeconds", host.ssh_connect_timeout_seconds),
            ("host.commandTimeoutSeconds", host.command_timeout_seconds),
            ("host.preProvisionTimeoutSeconds", host.pre_provision_timeout_seconds),
            ("host.fetchImageTimeoutSeconds", host.fetch_image_timeout_seconds),
            ("host.partitionTimeoutSeconds", host.partition_timeout_seconds),
            ("host.writeImageTimeoutSeconds", host.write_image_timeout_seconds),
            ("host.postInstallTimeoutSeconds", host.post_install_timeout_seconds),
            ("host.stepDeadlineSeconds", host.step_deadline_seconds),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{field} must be greater than 0")));
        }
        let worst_case = host.worst_case_step();
        if host.step_deadline() < worst_case {
            return Err(ConfigError::Invalid(format!(
                "host.stepDeadlineSeconds ({}) is shorter than a full install step ({}s)",
                host.step_deadline_seconds,
                worst_case.as_secs()
            )));
        }
        if host
            .pre_provision_command
            .as_deref()
            .is_some_and(|command| command.trim().is_empty())
        {
            return invalid("host.preProvisionCommand must not be blank");
        }
        if host.rescue_boot_poll_seconds > host.rescue_boot_timeout_seconds {
            return invalid("host.rescueBootPollSeconds exceeds host.rescueBootTimeoutSeconds");
        }

        let keys = &self.secrets;
        if [
            &keys.robot_user,
            &keys.robot_password,
            &keys.ssh_key_name,
            &keys.ssh_public_key,
            &keys.ssh_private_key,
        ]
        .iter()
        .any(|key| key.trim().is_empty())
        {
            return invalid("secret key names must not be empty");
        }

        self.robot_client_options()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    fn client_options(&self, base_url: &str, budget: &BudgetConfig) -> ClientOptions {
        ClientOptions {
            base_url: base_url.trim_end_matches('/').to_string(),
            budget: budget.clone(),
            retry: self.retry.clone(),
            default_retry_after_seconds: self.rate_limit.default_retry_after_seconds,
            request_timeout_seconds: self.rate_limit.request_timeout_seconds,
        }
    }

    /// Options for building Robot clients.
    #[must_use]
    pub fn robot_client_options(&self) -> ClientOptions {
        self.client_options(&self.endpoints.robot, &self.rate_limit.robot)
    }
}
