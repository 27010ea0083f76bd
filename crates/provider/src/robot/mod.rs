//! Hetzner Robot (dedicated server) API adapter.
//!
//! [`RobotApi`] is the seam the host state machine depends on;
//! [`RobotClient`] implements it against the Robot web service. Every call
//! goes through the client's [`Governor`](crate::governor::Governor), so
//! errors arrive already classified.

mod client;
mod models;

use async_trait::async_trait;

pub use client::{default_options, RobotClient, RobotCredentials, API_BASE_URL};
pub use models::{RescueStatus, ResetType, RobotServer, SshKey};

use crate::error::Result;

/// Operations on dedicated servers.
#[async_trait]
pub trait RobotApi: Send + Sync {
    /// List all servers of the account.
    async fn list_servers(&self) -> Result<Vec<RobotServer>>;

    /// Get one server.
    async fn get_server(&self, server_number: u64) -> Result<RobotServer>;

    /// Rename a server.
    async fn set_server_name(&self, server_number: u64, name: &str) -> Result<RobotServer>;

    /// Current rescue boot configuration.
    async fn get_rescue(&self, server_number: u64) -> Result<RescueStatus>;

    /// Arm a Linux rescue boot authorized for the given key fingerprint.
    async fn activate_rescue(&self, server_number: u64, key_fingerprint: &str)
        -> Result<RescueStatus>;

    /// Disarm the rescue boot.
    async fn deactivate_rescue(&self, server_number: u64) -> Result<RescueStatus>;

    /// Execute a reset.
    async fn reset(&self, server_number: u64, reset_type: ResetType) -> Result<()>;

    /// Reset variants the server supports.
    async fn reset_options(&self, server_number: u64) -> Result<Vec<ResetType>>;

    /// SSH keys stored in the account.
    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>>;

    /// Store a public key in the account.
    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey>;
}
