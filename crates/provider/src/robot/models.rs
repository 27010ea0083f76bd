//! Hetzner Robot API request and response models.
//!
//! Based on the Hetzner Robot API documentation.

use serde::{Deserialize, Serialize};

// ============================================================================
// Server types
// ============================================================================

/// Server wrapper as returned by `GET /server` and `GET /server/{number}`.
#[derive(Debug, Deserialize)]
pub struct ServerEnvelope {
    /// Server details.
    pub server: ServerDetails,
}

/// Server details.
#[derive(Debug, Deserialize)]
pub struct ServerDetails {
    /// Server number (unique identifier).
    pub server_number: u64,
    /// Server name/label.
    #[serde(default)]
    pub server_name: String,
    /// Main IPv4 address.
    #[serde(default)]
    pub server_ip: Option<String>,
    /// IPv6 network.
    #[serde(default)]
    pub server_ipv6_net: Option<String>,
    /// Product name (plan).
    #[serde(default)]
    pub product: String,
    /// Data center location.
    #[serde(default)]
    pub dc: String,
    /// Server status: "ready" or "in process".
    #[serde(default)]
    pub status: String,
    /// Whether the server has been cancelled.
    #[serde(default)]
    pub cancelled: bool,
}

/// A dedicated server known to Robot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotServer {
    /// Server number.
    pub number: u64,
    /// Server name.
    pub name: String,
    /// Main IPv4 address.
    pub ipv4: Option<String>,
    /// IPv6 network.
    pub ipv6_net: Option<String>,
    /// Product, e.g. "AX52".
    pub product: String,
    /// Data center, e.g. "FSN1-DC14".
    pub dc: String,
    /// Whether the server is ready for use.
    pub ready: bool,
    /// Whether the server has been cancelled.
    pub cancelled: bool,
}

impl From<ServerDetails> for RobotServer {
    fn from(details: ServerDetails) -> Self {
        Self {
            number: details.server_number,
            name: details.server_name,
            ipv4: details.server_ip,
            ipv6_net: details.server_ipv6_net,
            product: details.product,
            dc: details.dc,
            ready: details.status == "ready",
            cancelled: details.cancelled,
        }
    }
}

// ============================================================================
// Boot/Rescue types
// ============================================================================

/// Rescue mode response.
#[derive(Debug, Deserialize)]
pub struct RescueEnvelope {
    /// Rescue mode details.
    pub rescue: RescueDetails,
}

/// Rescue mode details.
#[derive(Debug, Deserialize)]
pub struct RescueDetails {
    /// Server number.
    pub server_number: u64,
    /// Whether a rescue boot is armed for the next reset.
    pub active: bool,
    /// Root password for rescue mode.
    #[serde(default)]
    pub password: Option<String>,
}

/// Rescue system state of a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescueStatus {
    /// Server number.
    pub server_number: u64,
    /// Whether a rescue boot is armed. Robot clears this once the server has
    /// booted into the rescue system.
    pub active: bool,
}

impl From<RescueDetails> for RescueStatus {
    fn from(details: RescueDetails) -> Self {
        Self {
            server_number: details.server_number,
            active: details.active,
        }
    }
}

// ============================================================================
// Reset types
// ============================================================================

/// Reset variants supported by Robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetType {
    /// Send CTRL+ALT+DEL.
    #[serde(rename = "sw")]
    Software,
    /// Hardware reset.
    #[serde(rename = "hw")]
    Hardware,
    /// Short press of the power button.
    #[serde(rename = "power")]
    Power,
    /// Long press of the power button; switches the server off.
    #[serde(rename = "power_long")]
    PowerLong,
    /// Manual reset by a data center technician.
    #[serde(rename = "man")]
    Manual,
}

impl ResetType {
    /// Wire name of the reset type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Software => "sw",
            Self::Hardware => "hw",
            Self::Power => "power",
            Self::PowerLong => "power_long",
            Self::Manual => "man",
        }
    }
}

impl std::fmt::Display for ResetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reset response.
#[derive(Debug, Deserialize)]
pub struct ResetEnvelope {
    /// Reset details.
    pub reset: ResetDetails,
}

/// Reset details. `type` is a string after a reset and a list of the
/// available variants on `GET /reset/{number}`.
#[derive(Debug, Deserialize)]
pub struct ResetDetails {
    /// Server number.
    pub server_number: u64,
    /// Reset type(s).
    #[serde(rename = "type")]
    pub reset_type: ResetTypes,
}

/// One reset type or the list of supported ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ResetTypes {
    /// List of supported types.
    Many(Vec<ResetType>),
    /// The type that was executed.
    One(ResetType),
}

// ============================================================================
// SSH Key types
// ============================================================================

/// SSH key wrapper.
#[derive(Debug, Deserialize)]
pub struct SshKeyEnvelope {
    /// Key details.
    pub key: SshKey,
}

/// SSH key stored in Robot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SshKey {
    /// Key name.
    pub name: String,
    /// Key fingerprint, used to authorize keys for rescue boots.
    pub fingerprint: String,
    /// Public key data.
    pub data: String,
}

// ============================================================================
// Error types
// ============================================================================

/// Error envelope returned on non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    /// Error details.
    pub error: ErrorDetails,
}

/// Error details.
#[derive(Debug, Deserialize)]
pub struct ErrorDetails {
    /// HTTP status.
    pub status: u16,
    /// Error code, e.g. `SERVER_NOT_FOUND`.
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Rate-limit window in seconds, present on `RATE_LIMIT_EXCEEDED`.
    #[serde(default)]
    pub interval: Option<u64>,
    /// Requests allowed per window, present on `RATE_LIMIT_EXCEEDED`.
    #[serde(default)]
    pub max_request: Option<u32>,
}
