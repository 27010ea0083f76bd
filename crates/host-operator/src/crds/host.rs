//! `HetznerBareMetalHost` Custom Resource Definition for dedicated servers

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Conditions;
use crate::hardware::HardwareDetails;
use crate::phase::Phase;

fn default_ssh_port() -> u16 {
    22
}

/// Reference to a secret in the host's namespace.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretRef {
    pub name: String,
}

/// The machine that claimed this host.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ConsumerRef {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ConsumerRef {
    /// `namespace/name` key, falling back to the host namespace.
    #[must_use]
    pub fn key(&self, host_namespace: &str) -> String {
        format!(
            "{}/{}",
            self.namespace.as_deref().unwrap_or(host_namespace),
            self.name
        )
    }
}

/// Image to install.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ImageSource {
    /// File name, e.g. `Ubuntu-2404-noble-amd64-base.tar.gz`.
    pub name: String,
    /// Download URL; when absent the image must exist in the rescue image share.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One partition of the install layout.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    /// Mount point, or `swap`.
    pub mount: String,
    /// `ext4`, `xfs`, `swap`...
    pub file_system: String,
    /// `<n>M`, `<n>G`, `<n>T` or `all`.
    pub size: String,
}

/// Operating system install request.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallImage {
    pub image: ImageSource,
    pub partitions: Vec<Partition>,
    /// Script run in a chroot of the installed system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_install_script: Option<String>,
    /// Hostname of the installed system; defaults to the resource name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Selects the install disk.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RootDeviceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wwn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// `HetznerBareMetalHost` spec
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HetznerBareMetalHost"
)]
#[kube(namespaced)]
#[kube(status = "HetznerBareMetalHostStatus")]
#[kube(shortname = "hbmh")]
#[kube(printcolumn = r#"{"name":"Server","type":"integer","jsonPath":".spec.serverId"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"IPv4","type":"string","jsonPath":".status.ipv4"}"#)]
#[kube(printcolumn = r#"{"name":"Consumer","type":"string","jsonPath":".spec.consumerRef.name"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct HetznerBareMetalHostSpec {
    /// Robot server number.
    pub server_id: u64,

    #[serde(default)]
    pub description: String,

    /// Set by the machine that claimed the host; clearing it releases the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_ref: Option<ConsumerRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_image: Option<InstallImage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_device_hints: Option<RootDeviceHints>,

    /// Key pair authorized in the rescue system.
    pub rescue_ssh_secret_ref: SecretRef,

    /// Key pair authorized in the installed OS.
    pub os_ssh_secret_ref: SecretRef,

    /// Robot web service credentials.
    pub robot_secret_ref: SecretRef,

    #[serde(default = "default_ssh_port")]
    pub ssh_port_after_install: u16,

    /// SSH port once cloud-init of the installed OS has run; used by the
    /// reachability check of provisioned hosts.
    #[serde(default = "default_ssh_port")]
    pub ssh_port_after_cloud_init: u16,

    #[serde(default)]
    pub wipe_disks_on_deprovision: bool,
}

/// Retry bookkeeping within the current phase.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Status of the `HetznerBareMetalHost`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HetznerBareMetalHostStatus {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default)]
    pub conditions: Conditions,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_details: Option<HardwareDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    #[serde(default)]
    pub attempt: Attempt,

    /// Set while a rescue boot is pending; cleared once confirmed or abandoned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rescue_reset_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub force_rescue_reset: bool,

    /// First time the host answered neither in rescue nor in the installed
    /// OS during the current phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreachable_since: Option<DateTime<Utc>>,

    #[serde(default)]
    pub os_boot_timeouts: u32,

    #[serde(default)]
    pub powered_off: bool,

    #[serde(default)]
    pub disks_wiped: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Spec generation that failed; a newer generation clears the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl HetznerBareMetalHostStatus {
    /// Equality ignoring `last_updated`, used to skip no-op writes.
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        let mut a = self.clone();
        a.last_updated = other.last_updated;
        a == *other
    }
}
