//! Hetzner Robot API client implementation.
//!
//! Uses the Hetzner Robot API for dedicated server management.
//! API Documentation: <https://robot.hetzner.com/doc/webservice/en.html>

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::models::{
    ErrorEnvelope, RescueEnvelope, RescueStatus, ResetEnvelope, ResetType, ResetTypes,
    RobotServer, ServerEnvelope, SshKey, SshKeyEnvelope,
};
use super::RobotApi;
use crate::error::{Error, ProviderError, Result};
use crate::governor::{BudgetConfig, BudgetRegistry, CredentialKey, Governor};
use crate::options::ClientOptions;

/// Base URL for Hetzner Robot API.
pub const API_BASE_URL: &str = "https://robot-ws.your-server.de";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Robot API credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct RobotCredentials {
    /// Web service username.
    pub username: String,
    /// Web service password.
    pub password: String,
}

impl RobotCredentials {
    /// Identity of this credential set for rate budgeting.
    #[must_use]
    pub fn key(&self) -> CredentialKey {
        CredentialKey::new("robot", &[&self.username, &self.password])
    }
}

impl std::fmt::Debug for RobotCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Default client options for the Robot API.
#[must_use]
pub fn default_options() -> ClientOptions {
    ClientOptions {
        base_url: API_BASE_URL.to_string(),
        budget: BudgetConfig {
            limit: 200,
            window_seconds: 3_600,
        },
        retry: crate::backoff::RetryConfig::default(),
        default_retry_after_seconds: 300,
        request_timeout_seconds: DEFAULT_TIMEOUT_SECS,
    }
}

/// Hetzner Robot client guarded by a per-credential governor.
#[derive(Clone)]
pub struct RobotClient {
    /// HTTP client.
    client: Client,
    /// API base URL.
    base_url: String,
    /// Robot API credentials.
    credentials: RobotCredentials,
    /// Budget and retry policy.
    governor: Governor,
}

impl RobotClient {
    /// Create a new Robot client sharing budgets through `registry`.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        credentials: RobotCredentials,
        options: &ClientOptions,
        registry: &BudgetRegistry,
    ) -> std::result::Result<Self, ProviderError> {
        options.validate()?;
        let client = Client::builder().timeout(options.request_timeout()).build()?;
        let governor = Governor::new(
            "robot",
            &credentials.key(),
            &options.budget,
            options.retry.clone(),
            options.default_retry_after(),
            registry,
        );

        Ok(Self {
            client,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            credentials,
            governor,
        })
    }

    /// The governor protecting this client's budget.
    #[must_use]
    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// Make an authenticated request under the governor.
    async fn request<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let this = self;
        let url = &url;
        let method = &method;

        self.governor
            .execute(operation, move || async move {
                debug!(url = %url, method = %method, "Robot request");
                let mut request = this
                    .client
                    .request(method.clone(), url)
                    .basic_auth(&this.credentials.username, Some(&this.credentials.password));
                if let Some(form) = form {
                    request = request.form(form);
                }
                let response = request.send().await?;
                Self::handle_response(response).await
            })
            .await
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> std::result::Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            });
        }

        Err(Self::parse_error(status, &text))
    }

    /// Map an error body to a raw provider error.
    fn parse_error(status: StatusCode, text: &str) -> ProviderError {
        let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(text) else {
            return if status == StatusCode::NOT_FOUND {
                ProviderError::NotFound(text.to_string())
            } else {
                ProviderError::Api {
                    status: status.as_u16(),
                    code: String::new(),
                    message: text.to_string(),
                }
            };
        };

        let error = envelope.error;
        if error.code == "RATE_LIMIT_EXCEEDED" {
            return ProviderError::RateLimited {
                retry_after: error.interval.map(Duration::from_secs),
            };
        }
        if status == StatusCode::NOT_FOUND {
            return ProviderError::NotFound(format!("{}: {}", error.code, error.message));
        }
        ProviderError::Api {
            status: error.status,
            code: error.code,
            message: error.message,
        }
    }
}

#[async_trait]
impl RobotApi for RobotClient {
    async fn list_servers(&self) -> Result<Vec<RobotServer>> {
        let servers: Vec<ServerEnvelope> =
            self.request("list_servers", Method::GET, "/server", None).await?;
        Ok(servers.into_iter().map(|s| s.server.into()).collect())
    }

    async fn get_server(&self, server_number: u64) -> Result<RobotServer> {
        let server: ServerEnvelope = self
            .request("get_server", Method::GET, &format!("/server/{server_number}"), None)
            .await?;
        Ok(server.server.into())
    }

    async fn set_server_name(&self, server_number: u64, name: &str) -> Result<RobotServer> {
        let form = [("server_name", name.to_string())];
        let server: ServerEnvelope = self
            .request(
                "set_server_name",
                Method::POST,
                &format!("/server/{server_number}"),
                Some(&form),
            )
            .await?;
        Ok(server.server.into())
    }

    async fn get_rescue(&self, server_number: u64) -> Result<RescueStatus> {
        let rescue: RescueEnvelope = self
            .request(
                "get_rescue",
                Method::GET,
                &format!("/boot/{server_number}/rescue"),
                None,
            )
            .await?;
        Ok(rescue.rescue.into())
    }

    async fn activate_rescue(
        &self,
        server_number: u64,
        key_fingerprint: &str,
    ) -> Result<RescueStatus> {
        let form = [
            ("os", "linux".to_string()),
            ("authorized_key[]", key_fingerprint.to_string()),
        ];
        let result: Result<RescueEnvelope> = self
            .request(
                "activate_rescue",
                Method::POST,
                &format!("/boot/{server_number}/rescue"),
                Some(&form),
            )
            .await;

        match result {
            Ok(rescue) => {
                info!(server_number, "Rescue mode activated");
                Ok(rescue.rescue.into())
            }
            Err(Error::Conflict(message)) if message.contains("BOOT_ALREADY_ENABLED") => {
                debug!(server_number, "Rescue mode already active");
                self.get_rescue(server_number).await
            }
            Err(e) => Err(e),
        }
    }

    async fn deactivate_rescue(&self, server_number: u64) -> Result<RescueStatus> {
        let rescue: RescueEnvelope = self
            .request(
                "deactivate_rescue",
                Method::DELETE,
                &format!("/boot/{server_number}/rescue"),
                None,
            )
            .await?;
        info!(server_number, "Rescue mode deactivated");
        Ok(rescue.rescue.into())
    }

    async fn reset(&self, server_number: u64, reset_type: ResetType) -> Result<()> {
        let form = [("type", reset_type.as_str().to_string())];
        let _: ResetEnvelope = self
            .request(
                "reset",
                Method::POST,
                &format!("/reset/{server_number}"),
                Some(&form),
            )
            .await?;
        info!(server_number, reset_type = %reset_type, "Server reset triggered");
        Ok(())
    }

    async fn reset_options(&self, server_number: u64) -> Result<Vec<ResetType>> {
        let reset: ResetEnvelope = self
            .request(
                "reset_options",
                Method::GET,
                &format!("/reset/{server_number}"),
                None,
            )
            .await?;
        Ok(match reset.reset.reset_type {
            ResetTypes::Many(types) => types,
            ResetTypes::One(single) => vec![single],
        })
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>> {
        let result: Result<Vec<SshKeyEnvelope>> =
            self.request("list_ssh_keys", Method::GET, "/key", None).await;
        match result {
            Ok(keys) => Ok(keys.into_iter().map(|k| k.key).collect()),
            // Robot answers 404 when the account has no keys at all.
            Err(Error::Permanent { reason, .. }) if reason == "NotFound" => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey> {
        let form = [
            ("name", name.to_string()),
            ("data", public_key.trim().to_string()),
        ];
        let key: SshKeyEnvelope = self
            .request("create_ssh_key", Method::POST, "/key", Some(&form))
            .await?;
        info!(name = %name, fingerprint = %key.key.fingerprint, "SSH key registered");
        Ok(key.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_error_carries_interval() {
        let body = r#"{"error":{"status":403,"code":"RATE_LIMIT_EXCEEDED","message":"Rate limit exceeded","max_request":200,"interval":3600}}"#;
        match RobotClient::parse_error(StatusCode::FORBIDDEN, body) {
            ProviderError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3_600)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_not_found_error() {
        let body = r#"{"error":{"status":404,"code":"SERVER_NOT_FOUND","message":"Server not found"}}"#;
        assert!(matches!(
            RobotClient::parse_error(StatusCode::NOT_FOUND, body),
            ProviderError::NotFound(_)
        ));
    }

    #[test]
    fn test_unparseable_error_body() {
        match RobotClient::parse_error(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>") {
            ProviderError::Api { status, .. } => assert_eq!(status, 502),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_server_status_mapping() {
        let json = r#"{
            "server": {
                "server_ip": "1.2.3.4",
                "server_ipv6_net": "2001:db8::",
                "server_number": 12345,
                "server_name": "test-server",
                "product": "AX52",
                "dc": "FSN1-DC14",
                "traffic": "unlimited",
                "status": "ready",
                "cancelled": false,
                "paid_until": "2026-12-31"
            }
        }"#;
        let envelope: ServerEnvelope = serde_json::from_str(json).unwrap();
        let server: RobotServer = envelope.server.into();
        assert!(server.ready);
        assert_eq!(server.number, 12345);
        assert_eq!(server.product, "AX52");
        assert_eq!(server.ipv4.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_reset_options_deserialization() {
        let json = r#"{"reset":{"server_ip":"1.2.3.4","server_number":321,"type":["sw","hw","man"],"operating_status":"not supported"}}"#;
        let envelope: ResetEnvelope = serde_json::from_str(json).unwrap();
        match envelope.reset.reset_type {
            ResetTypes::Many(types) => {
                assert_eq!(types, vec![ResetType::Software, ResetType::Hardware, ResetType::Manual]);
            }
            ResetTypes::One(_) => panic!("expected list"),
        }
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = RobotCredentials {
            username: "robot-user".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("robot-user"));
        assert!(!rendered.contains("hunter2"));
    }
}
