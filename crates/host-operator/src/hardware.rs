//! Hardware inventory collected from the rescue system.

use std::time::Duration;

use hetzner_provider::remote::RemoteSession;
use hetzner_provider::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lists whole disks as JSON.
pub const LSBLK_SCRIPT: &str =
    "lsblk --bytes --json --nodeps --output NAME,TYPE,SIZE,ROTA,WWN,MODEL,SERIAL";

/// Lists network interfaces as JSON.
pub const IP_ADDR_SCRIPT: &str = "ip -j addr show";

/// Prints firmware, CPU and memory facts as `key=value` lines.
pub const SYSTEM_SCRIPT: &str = r#"echo "firmware=$([ -d /sys/firmware/efi ] && echo uefi || echo bios)"
echo "cpu_threads=$(nproc --all)"
echo "cpu_model=$(grep -m1 'model name' /proc/cpuinfo | cut -d: -f2- | sed 's/^ *//')"
echo "ram_kib=$(awk '/MemTotal/ {print $2}' /proc/meminfo)""#;

/// Hardware of one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HardwareDetails {
    pub disks: Vec<Disk>,
    pub nics: Vec<Nic>,
    pub firmware: Firmware,
    pub cpu: Cpu,
    pub ram_bytes: u64,
}

/// A whole disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Kernel name, e.g. `sda` or `nvme0n1`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wwn: Option<String>,
    pub size_bytes: u64,
    pub rotational: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

impl Disk {
    /// Device path.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/dev/{}", self.name)
    }

    /// Device path of the `index`-th (1-based) partition.
    #[must_use]
    pub fn partition_path(&self, index: usize) -> String {
        if self.name.ends_with(|c: char| c.is_ascii_digit()) {
            format!("/dev/{}p{index}", self.name)
        } else {
            format!("/dev/{}{index}", self.name)
        }
    }
}

/// A network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Nic {
    pub name: String,
    pub mac: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Boot firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Bios,
    Uefi,
}

/// Processor summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub model: String,
    pub threads: u32,
}

/// Failure to interpret inventory output.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("invalid {what} output: {message}")]
    Parse { what: &'static str, message: String },

    #[error("{what} exited with status {exit_code}: {stderr}")]
    Command {
        what: &'static str,
        exit_code: i32,
        stderr: String,
    },
}

impl From<InventoryError> for Error {
    fn from(err: InventoryError) -> Self {
        Error::Retryable(err.to_string())
    }
}

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type", default)]
    device_type: String,
    #[serde(deserialize_with = "flexible_u64")]
    size: u64,
    #[serde(default, deserialize_with = "flexible_bool")]
    rota: bool,
    #[serde(default)]
    wwn: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    serial: Option<String>,
}

/// Older util-linux prints numbers and booleans as strings.
fn flexible_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid size {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid size {s:?}"))),
        other => Err(serde::de::Error::custom(format!("invalid size {other}"))),
    }
}

fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_u64().unwrap_or(0) != 0),
        Value::String(s) => Ok(matches!(s.trim(), "1" | "true")),
        _ => Ok(false),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse `lsblk` JSON into whole disks, largest last.
///
/// # Errors
/// Returns [`InventoryError::Parse`] for malformed output.
pub fn parse_disks(json: &str) -> Result<Vec<Disk>, InventoryError> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|e| InventoryError::Parse {
        what: "lsblk",
        message: e.to_string(),
    })?;

    let mut disks: Vec<Disk> = output
        .blockdevices
        .into_iter()
        .filter(|d| d.device_type == "disk" && d.size > 0)
        .map(|d| Disk {
            name: d.name,
            wwn: non_empty(d.wwn),
            size_bytes: d.size,
            rotational: d.rota,
            model: non_empty(d.model),
            serial: non_empty(d.serial),
        })
        .collect();
    disks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(disks)
}

#[derive(Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    local: String,
    prefixlen: u8,
}

/// Parse `ip -j addr` output, skipping loopback.
///
/// # Errors
/// Returns [`InventoryError::Parse`] for malformed output.
pub fn parse_nics(json: &str) -> Result<Vec<Nic>, InventoryError> {
    let links: Vec<IpLink> = serde_json::from_str(json).map_err(|e| InventoryError::Parse {
        what: "ip addr",
        message: e.to_string(),
    })?;

    Ok(links
        .into_iter()
        .filter(|l| l.link_type.as_deref() != Some("loopback"))
        .map(|l| Nic {
            name: l.ifname,
            mac: l.address.unwrap_or_default(),
            addresses: l
                .addr_info
                .into_iter()
                .map(|a| format!("{}/{}", a.local, a.prefixlen))
                .collect(),
        })
        .collect())
}

/// Firmware, CPU and RAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemFacts {
    pub firmware: Firmware,
    pub cpu: Cpu,
    pub ram_bytes: u64,
}

/// Parse the `key=value` output of [`SYSTEM_SCRIPT`].
///
/// # Errors
/// Returns [`InventoryError::Parse`] when a fact is missing or malformed.
pub fn parse_system(output: &str) -> Result<SystemFacts, InventoryError> {
    let parse_error = |message: String| InventoryError::Parse {
        what: "system facts",
        message,
    };
    let mut firmware = None;
    let mut threads = None;
    let mut model = String::new();
    let mut ram_kib = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "firmware" => {
                firmware = Some(if value == "uefi" {
                    Firmware::Uefi
                } else {
                    Firmware::Bios
                });
            }
            "cpu_threads" => {
                threads = Some(
                    value
                        .parse::<u32>()
                        .map_err(|e| parse_error(format!("cpu_threads {value:?}: {e}")))?,
                );
            }
            "cpu_model" => model = value.to_string(),
            "ram_kib" => {
                ram_kib = Some(
                    value
                        .parse::<u64>()
                        .map_err(|e| parse_error(format!("ram_kib {value:?}: {e}")))?,
                );
            }
            _ => {}
        }
    }

    Ok(SystemFacts {
        firmware: firmware.ok_or_else(|| parse_error("missing firmware".into()))?,
        cpu: Cpu {
            model,
            threads: threads.ok_or_else(|| parse_error("missing cpu_threads".into()))?,
        },
        ram_bytes: ram_kib.ok_or_else(|| parse_error("missing ram_kib".into()))? * 1024,
    })
}

async fn run_checked(
    session: &mut dyn RemoteSession,
    what: &'static str,
    script: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String, Error> {
    let output = session.run(script, timeout, cancel).await?;
    if !output.success() {
        return Err(InventoryError::Command {
            what,
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(output.stdout)
}

/// Collect the full inventory over an open rescue session.
///
/// Read-only, so safe to repeat.
///
/// # Errors
/// Returns `Retryable` for command or parse failures and `Cancelled` when
/// the step is cancelled.
pub async fn collect(
    session: &mut dyn RemoteSession,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<HardwareDetails, Error> {
    let disks = parse_disks(&run_checked(session, "lsblk", LSBLK_SCRIPT, timeout, cancel).await?)?;
    if disks.is_empty() {
        return Err(Error::Retryable("no disks reported by lsblk".into()));
    }
    let nics = parse_nics(&run_checked(session, "ip addr", IP_ADDR_SCRIPT, timeout, cancel).await?)?;
    let system =
        parse_system(&run_checked(session, "system facts", SYSTEM_SCRIPT, timeout, cancel).await?)?;

    debug!(
        disks = disks.len(),
        nics = nics.len(),
        threads = system.cpu.threads,
        "Collected hardware inventory"
    );

    Ok(HardwareDetails {
        disks,
        nics,
        firmware: system.firmware,
        cpu: system.cpu,
        ram_bytes: system.ram_bytes,
    })
}
