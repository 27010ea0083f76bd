//! Hetzner Cloud API request and response models.
//!
//! Based on the Hetzner Cloud API documentation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Server types
// ============================================================================

/// Server status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Server is being created.
    Initializing,
    /// Server is starting.
    Starting,
    /// Server is running.
    Running,
    /// Server is stopping.
    Stopping,
    /// Server is off.
    Off,
    /// Server is being deleted.
    Deleting,
    /// Server is migrating.
    Migrating,
    /// Server is being rebuilt.
    Rebuilding,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Off => write!(f, "off"),
            Self::Deleting => write!(f, "deleting"),
            Self::Migrating => write!(f, "migrating"),
            Self::Rebuilding => write!(f, "rebuilding"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A cloud server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Server ID.
    pub id: i64,
    /// Server name.
    pub name: String,
    /// Current status.
    pub status: ServerStatus,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Public network configuration.
    #[serde(default)]
    pub public_net: ServerPublicNet,
    /// Private network attachments.
    #[serde(default)]
    pub private_net: Vec<ServerPrivateNet>,
    /// Server type.
    pub server_type: ServerType,
    /// User-defined labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Protection flags.
    #[serde(default)]
    pub protection: ServerProtection,
    /// Whether a rescue system is armed.
    #[serde(default)]
    pub rescue_enabled: bool,
    /// Whether the server is locked by a running action.
    #[serde(default)]
    pub locked: bool,
    /// Primary disk size in GB.
    #[serde(default)]
    pub primary_disk_size: u32,
    /// Image the server was created from.
    #[serde(default)]
    pub image: Option<Image>,
}

impl Server {
    /// Primary public IPv4 address, if any.
    #[must_use]
    pub fn ipv4(&self) -> Option<&str> {
        self.public_net.ipv4.as_ref().map(|ip| ip.ip.as_str())
    }
}

/// Server type reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerType {
    /// Type name, e.g. "cx22".
    pub name: String,
}

/// Image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Image ID.
    pub id: i64,
    /// Image name, if it is a system image.
    #[serde(default)]
    pub name: Option<String>,
}

/// Protection flags of a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProtection {
    /// Delete protection.
    pub delete: bool,
    /// Rebuild protection.
    pub rebuild: bool,
}

/// Public network information of a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPublicNet {
    /// Primary IPv4.
    #[serde(default)]
    pub ipv4: Option<PublicIp>,
    /// Primary IPv6 network.
    #[serde(default)]
    pub ipv6: Option<PublicIp>,
}

/// Public IP assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIp {
    /// Address or network.
    pub ip: String,
    /// Whether the IP is blocked.
    #[serde(default)]
    pub blocked: bool,
}

/// Private network attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPrivateNet {
    /// Network ID.
    pub network: i64,
    /// Address in the network.
    pub ip: String,
    /// Alias addresses.
    #[serde(default)]
    pub alias_ips: Vec<String>,
    /// MAC address of the interface.
    #[serde(default)]
    pub mac_address: String,
}

/// Response to fetching a single server.
#[derive(Debug, Deserialize)]
pub struct ServerGetResponse {
    /// The server.
    pub server: Server,
}

/// Response to listing servers.
#[derive(Debug, Deserialize)]
pub struct ServerListResponse {
    /// Servers on this page.
    #[serde(default)]
    pub servers: Vec<Server>,
}

/// Request to create a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateServerRequest {
    /// Server name.
    pub name: String,
    /// Server type name.
    pub server_type: String,
    /// Image name or ID.
    pub image: String,
    /// SSH key names or IDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    /// Location, e.g. "fsn1".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Cloud-init user data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Whether to start the server right after creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after_create: Option<bool>,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Private network IDs to attach.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<i64>,
    /// Placement group ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_group: Option<i64>,
}

/// Response to creating a server.
#[derive(Debug, Deserialize)]
pub struct CreateServerResponse {
    /// The new server.
    pub server: Server,
    /// Create action.
    pub action: Action,
    /// Follow-up actions, e.g. power on.
    #[serde(default)]
    pub next_actions: Vec<Action>,
}

/// Request to update a server.
#[derive(Debug, Serialize)]
pub struct UpdateServerRequest<'a> {
    /// New labels, replacing all existing ones.
    pub labels: &'a BTreeMap<String, String>,
}

// ============================================================================
// Action types
// ============================================================================

/// Status of an asynchronous action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Still in progress.
    Running,
    /// Finished successfully.
    Success,
    /// Failed.
    Error,
}

/// An asynchronous action, polled until it leaves `running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Action ID.
    pub id: i64,
    /// Command, e.g. `start_server`.
    pub command: String,
    /// Status.
    pub status: ActionStatus,
    /// Progress in percent.
    #[serde(default)]
    pub progress: u8,
    /// Error details when `status` is `error`.
    #[serde(default)]
    pub error: Option<ActionError>,
}

/// Error details of a failed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
}

/// Response wrapping a single action.
#[derive(Debug, Deserialize)]
pub struct ActionResponse {
    /// The action.
    pub action: Action,
}

/// Request to rebuild a server from an image.
#[derive(Debug, Serialize)]
pub struct RebuildRequest<'a> {
    /// Image name or ID.
    pub image: &'a str,
}

/// Request to attach an ISO.
#[derive(Debug, Serialize)]
pub struct AttachIsoRequest<'a> {
    /// ISO name or ID.
    pub iso: &'a str,
}

/// Request to change protection flags.
#[derive(Debug, Serialize)]
pub struct ChangeProtectionRequest {
    /// Delete protection.
    pub delete: bool,
    /// Rebuild protection, must equal `delete` for servers.
    pub rebuild: bool,
}

// ============================================================================
// Error types
// ============================================================================

/// Error envelope.
#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    /// Error details.
    pub error: ErrorDetails,
}

/// Error details.
#[derive(Debug, Deserialize)]
pub struct ErrorDetails {
    /// Error code, e.g. `rate_limit_exceeded`.
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}
