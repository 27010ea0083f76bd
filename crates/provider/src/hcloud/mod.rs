//! Hetzner Cloud API adapter.
//!
//! [`HCloudApi`] is the typed surface over the Cloud API; [`HCloudClient`]
//! implements it with a per-token [`Governor`](crate::governor::Governor)
//! that also folds the `RateLimit-*` response headers into the shared
//! budget.

mod client;
mod models;
mod provision;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use client::{default_options, HCloudClient, API_BASE_URL};
pub use models::{
    Action, ActionError, ActionStatus, CreateServerRequest, Image, PublicIp, Server,
    ServerPrivateNet, ServerProtection, ServerPublicNet, ServerStatus, ServerType,
};
pub use provision::{CloudServerProvisioner, DesiredServer, ProvisionOutcome};

use crate::error::Result;

/// Operations on Cloud servers.
#[async_trait]
pub trait HCloudApi: Send + Sync {
    /// List servers, optionally filtered by a label selector.
    async fn list_servers(&self, label_selector: Option<&str>) -> Result<Vec<Server>>;

    /// Get one server.
    async fn get_server(&self, id: i64) -> Result<Server>;

    /// Create a server; returns it together with the create action.
    async fn create_server(&self, request: &CreateServerRequest) -> Result<(Server, Action)>;

    /// Delete a server.
    async fn delete_server(&self, id: i64) -> Result<Action>;

    /// Replace all labels of a server.
    async fn set_server_labels(&self, id: i64, labels: &BTreeMap<String, String>)
        -> Result<Server>;

    /// Power a server on.
    async fn power_on(&self, id: i64) -> Result<Action>;

    /// Cut power to a server.
    async fn power_off(&self, id: i64) -> Result<Action>;

    /// Hard-reset a server.
    async fn reset_server(&self, id: i64) -> Result<Action>;

    /// Reinstall a server from an image.
    async fn rebuild_server(&self, id: i64, image: &str) -> Result<Action>;

    /// Attach an ISO to a server.
    async fn attach_iso(&self, id: i64, iso: &str) -> Result<Action>;

    /// Change delete/rebuild protection.
    async fn change_protection(&self, id: i64, delete: bool, rebuild: bool) -> Result<Action>;

    /// Poll an action.
    async fn get_action(&self, id: i64) -> Result<Action>;
}
