//! Hetzner Cloud API client implementation.
//!
//! API Documentation: <https://docs.hetzner.cloud/>

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::models::{
    Action, ActionResponse, AttachIsoRequest, ChangeProtectionRequest, CreateServerRequest,
    CreateServerResponse, ErrorEnvelope, RebuildRequest, Server, ServerGetResponse,
    ServerListResponse, UpdateServerRequest,
};
use super::HCloudApi;
use crate::error::{ProviderError, Result};
use crate::governor::{BudgetConfig, BudgetRegistry, CredentialKey, Governor, RateLimitSnapshot};
use crate::options::ClientOptions;

/// Base URL for the Hetzner Cloud API.
pub const API_BASE_URL: &str = "https://api.hetzner.cloud/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default client options for the Cloud API.
#[must_use]
pub fn default_options() -> ClientOptions {
    ClientOptions {
        base_url: API_BASE_URL.to_string(),
        budget: BudgetConfig {
            limit: 3_600,
            window_seconds: 3_600,
        },
        retry: crate::backoff::RetryConfig::default(),
        default_retry_after_seconds: 300,
        request_timeout_seconds: DEFAULT_TIMEOUT_SECS,
    }
}

/// Hetzner Cloud client guarded by a per-token governor.
#[derive(Clone)]
pub struct HCloudClient {
    client: Client,
    base_url: String,
    token: String,
    governor: Governor,
}

impl std::fmt::Debug for HCloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HCloudClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl HCloudClient {
    /// Create a new Cloud client sharing budgets through `registry`.
    ///
    /// # Errors
    /// Returns error if the token is empty or the HTTP client cannot be created.
    pub fn new(
        token: impl Into<String>,
        options: &ClientOptions,
        registry: &BudgetRegistry,
    ) -> std::result::Result<Self, ProviderError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ProviderError::Config("Cloud API token is empty".into()));
        }

        options.validate()?;
        let client = Client::builder().timeout(options.request_timeout()).build()?;
        let governor = Governor::new(
            "hcloud",
            &CredentialKey::new("hcloud", &[&token]),
            &options.budget,
            options.retry.clone(),
            options.default_retry_after(),
            registry,
        );

        Ok(Self {
            client,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            token,
            governor,
        })
    }

    /// The governor protecting this client's budget.
    #[must_use]
    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    async fn request<T, B>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + Sync + ?Sized,
    {
        let url = format!("{}{path}", self.base_url);
        let this = self;
        let url = &url;
        let method = &method;

        self.governor
            .execute(operation, move || async move {
                debug!(url = %url, method = %method, "Cloud request");
                let mut request = this
                    .client
                    .request(method.clone(), url)
                    .bearer_auth(&this.token);
                if !query.is_empty() {
                    request = request.query(query);
                }
                if let Some(body) = body {
                    request = request.json(body);
                }
                let response = request.send().await?;
                let snapshot = rate_limit_snapshot(response.headers());
                if snapshot != RateLimitSnapshot::default() {
                    this.governor.observe(snapshot).await;
                }
                Self::handle_response(response).await
            })
            .await
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> std::result::Result<T, ProviderError> {
        let status = response.status();
        let retry_after = retry_after(response.headers());
        let text = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            });
        }

        Err(Self::parse_error(status, retry_after, &text))
    }

    fn parse_error(status: StatusCode, retry_after: Option<Duration>, text: &str) -> ProviderError {
        let envelope = serde_json::from_str::<ErrorEnvelope>(text).ok();
        let code = envelope
            .as_ref()
            .map(|e| e.error.code.clone())
            .unwrap_or_default();

        if status == StatusCode::TOO_MANY_REQUESTS || code == "rate_limit_exceeded" {
            return ProviderError::RateLimited { retry_after };
        }
        if status == StatusCode::NOT_FOUND {
            return ProviderError::NotFound(
                envelope.map_or_else(|| text.to_string(), |e| e.error.message),
            );
        }
        ProviderError::Api {
            status: status.as_u16(),
            code,
            message: envelope.map_or_else(|| text.to_string(), |e| e.error.message),
        }
    }

    async fn action(&self, operation: &str, id: i64, command: &str) -> Result<Action> {
        let response: ActionResponse = self
            .request(
                operation,
                Method::POST,
                &format!("/servers/{id}/actions/{command}"),
                &[],
                None::<&()>,
            )
            .await?;
        info!(server_id = id, action = command, action_id = response.action.id, "Server action started");
        Ok(response.action)
    }
}

/// Read `RateLimit-*` headers.
fn rate_limit_snapshot(headers: &HeaderMap) -> RateLimitSnapshot {
    let number = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    let reset_in = number("RateLimit-Reset").map(|reset_at| {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        Duration::from_secs(reset_at.saturating_sub(now))
    });

    RateLimitSnapshot {
        limit: number("RateLimit-Limit").and_then(|v| u32::try_from(v).ok()),
        remaining: number("RateLimit-Remaining").and_then(|v| u32::try_from(v).ok()),
        reset_in,
    }
}

/// Retry hint of a throttled response: `Retry-After`, else `RateLimit-Reset`.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .or_else(|| rate_limit_snapshot(headers).reset_in)
}

#[async_trait]
impl HCloudApi for HCloudClient {
    async fn list_servers(&self, label_selector: Option<&str>) -> Result<Vec<Server>> {
        let mut query = Vec::new();
        if let Some(selector) = label_selector {
            query.push(("label_selector", selector.to_string()));
        }
        let response: ServerListResponse = self
            .request("list_servers", Method::GET, "/servers", &query, None::<&()>)
            .await?;
        Ok(response.servers)
    }

    async fn get_server(&self, id: i64) -> Result<Server> {
        let response: ServerGetResponse = self
            .request("get_server", Method::GET, &format!("/servers/{id}"), &[], None::<&()>)
            .await?;
        Ok(response.server)
    }

    async fn create_server(&self, request: &CreateServerRequest) -> Result<(Server, Action)> {
        let response: CreateServerResponse = self
            .request("create_server", Method::POST, "/servers", &[], Some(request))
            .await?;
        info!(server_id = response.server.id, name = %response.server.name, "Cloud server created");
        Ok((response.server, response.action))
    }

    async fn delete_server(&self, id: i64) -> Result<Action> {
        let response: ActionResponse = self
            .request("delete_server", Method::DELETE, &format!("/servers/{id}"), &[], None::<&()>)
            .await?;
        info!(server_id = id, "Cloud server deletion started");
        Ok(response.action)
    }

    async fn set_server_labels(&self, id: i64, labels: &BTreeMap<String, String>) -> Result<Server> {
        let body = UpdateServerRequest { labels };
        let response: ServerGetResponse = self
            .request("set_server_labels", Method::PUT, &format!("/servers/{id}"), &[], Some(&body))
            .await?;
        Ok(response.server)
    }

    async fn power_on(&self, id: i64) -> Result<Action> {
        self.action("power_on", id, "poweron").await
    }

    async fn power_off(&self, id: i64) -> Result<Action> {
        self.action("power_off", id, "poweroff").await
    }

    async fn reset_server(&self, id: i64) -> Result<Action> {
        self.action("reset_server", id, "reset").await
    }

    async fn rebuild_server(&self, id: i64, image: &str) -> Result<Action> {
        let body = RebuildRequest { image };
        let response: ActionResponse = self
            .request(
                "rebuild_server",
                Method::POST,
                &format!("/servers/{id}/actions/rebuild"),
                &[],
                Some(&body),
            )
            .await?;
        Ok(response.action)
    }

    async fn attach_iso(&self, id: i64, iso: &str) -> Result<Action> {
        let body = AttachIsoRequest { iso };
        let response: ActionResponse = self
            .request(
                "attach_iso",
                Method::POST,
                &format!("/servers/{id}/actions/attach_iso"),
                &[],
                Some(&body),
            )
            .await?;
        Ok(response.action)
    }

    async fn change_protection(&self, id: i64, delete: bool, rebuild: bool) -> Result<Action> {
        let body = ChangeProtectionRequest { delete, rebuild };
        let response: ActionResponse = self
            .request(
                "change_protection",
                Method::POST,
                &format!("/servers/{id}/actions/change_protection"),
                &[],
                Some(&body),
            )
            .await?;
        Ok(response.action)
    }

    async fn get_action(&self, id: i64) -> Result<Action> {
        let response: ActionResponse = self
            .request("get_action", Method::GET, &format!("/actions/{id}"), &[], None::<&()>)
            .await?;
        Ok(response.action)
    }
}
