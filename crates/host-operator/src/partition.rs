//! Install plan: partition layout checked against the discovered disks.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::LazyLock;

use hetzner_provider::Error;
use regex::Regex;

use crate::crds::{InstallImage, Partition, RootDeviceHints};
use crate::hardware::{Disk, HardwareDetails};

/// Reason recorded for infeasible layouts.
pub const INVALID_PARTITION_CONFIG: &str = "InvalidPartitionConfig";
/// Reason recorded for unusable image or hostname settings.
pub const INVALID_INSTALL_IMAGE: &str = "InvalidInstallImage";

/// Where downloaded images are stored in the rescue system.
pub const IMAGE_DIR: &str = "/root/images";
/// Image share mounted by the rescue system.
pub const RESCUE_IMAGE_DIR: &str = "/root/.oldroot/nfs/images";

const MIB: u64 = 1024 * 1024;

/// Mount value of an LVM physical volume. installimage accepts any number
/// of them and none can be the root partition.
const LVM_MOUNT: &str = "lvm";

static SIZE_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(\d+)([MGT])$"));
static HOSTNAME_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$"));

fn regex(re: &'static LazyLock<Result<Regex, regex::Error>>) -> Result<&'static Regex, Error> {
    re.as_ref()
        .map_err(|e| Error::permanent("InvalidConfiguration", e.to_string()))
}

fn invalid_layout(message: impl Into<String>) -> Error {
    Error::permanent(INVALID_PARTITION_CONFIG, message)
}

/// Size of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    /// Fixed size in MiB.
    Fixed(u64),
    /// Remainder of the disk.
    Rest,
}

impl PartitionSize {
    /// Parse `512M`, `20G`, `1T` or `all`.
    ///
    /// # Errors
    /// Returns a permanent `InvalidPartitionConfig` error for anything else.
    pub fn parse(value: &str) -> Result<Self, Error> {
        if value == "all" {
            return Ok(Self::Rest);
        }
        let captures = regex(&SIZE_RE)?
            .captures(value)
            .ok_or_else(|| invalid_layout(format!("invalid partition size {value:?}")))?;
        let amount: u64 = captures[1]
            .parse()
            .map_err(|_| invalid_layout(format!("partition size {value:?} out of range")))?;
        let factor = match &captures[2] {
            "G" => 1024,
            "T" => 1024 * 1024,
            _ => 1,
        };
        let mib = amount
            .checked_mul(factor)
            .filter(|mib| *mib > 0)
            .ok_or_else(|| invalid_layout(format!("partition size {value:?} out of range")))?;
        Ok(Self::Fixed(mib))
    }

    fn autosetup(self) -> String {
        match self {
            Self::Fixed(mib) => format!("{mib}M"),
            Self::Rest => "all".to_string(),
        }
    }
}

/// A validated install plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// Target disk.
    pub disk: Disk,
    /// 1-based index of the root partition on the target disk.
    pub root_index: usize,
    /// Hostname of the installed system.
    pub hostname: String,
    /// Image file as seen from the rescue system.
    pub image_path: String,
    /// URL to fetch the image from, if it is not on the rescue share.
    pub image_url: Option<String>,
    /// Unattended installer configuration.
    pub autosetup: String,
}

impl InstallPlan {
    /// Device of the root partition.
    #[must_use]
    pub fn root_partition(&self) -> String {
        self.disk.partition_path(self.root_index)
    }
}

/// Pick the install disk from the hints, or the first disk by name.
///
/// # Errors
/// Returns a permanent `InvalidPartitionConfig` error when no disk matches.
pub fn select_root_disk<'a>(
    disks: &'a [Disk],
    hints: Option<&RootDeviceHints>,
) -> Result<&'a Disk, Error> {
    let hints = hints.cloned().unwrap_or_default();
    let device_name = hints
        .device_name
        .as_deref()
        .map(|name| name.trim_start_matches("/dev/"));

    let found = disks.iter().find(|disk| {
        hints
            .wwn
            .as_deref()
            .is_none_or(|wwn| disk.wwn.as_deref() == Some(wwn))
            && device_name.is_none_or(|name| disk.name == name)
    });

    found.ok_or_else(|| {
        if disks.is_empty() {
            invalid_layout("no disks discovered")
        } else {
            invalid_layout(format!("no disk matches root device hints {hints:?}"))
        }
    })
}

fn validate_partitions(partitions: &[Partition], disk: &Disk) -> Result<Vec<PartitionSize>, Error> {
    if partitions.is_empty() {
        return Err(invalid_layout("partition list is empty"));
    }

    let mut mounts = HashSet::new();
    let mut sizes = Vec::with_capacity(partitions.len());
    for (index, partition) in partitions.iter().enumerate() {
        let lvm = partition.mount == LVM_MOUNT;
        if !lvm && partition.mount != "swap" && !partition.mount.starts_with('/') {
            return Err(invalid_layout(format!(
                "mount point {:?} must be absolute, swap or lvm",
                partition.mount
            )));
        }
        if partition.file_system.is_empty() {
            return Err(invalid_layout(format!(
                "partition {} has no file system",
                partition.mount
            )));
        }
        if !lvm && !mounts.insert(partition.mount.as_str()) {
            return Err(invalid_layout(format!("duplicate mount point {}", partition.mount)));
        }
        let size = PartitionSize::parse(&partition.size)?;
        if size == PartitionSize::Rest && index + 1 != partitions.len() {
            return Err(invalid_layout("only the last partition may use size all"));
        }
        sizes.push(size);
    }
    if !mounts.contains("/") {
        return Err(invalid_layout("no root partition"));
    }

    let fixed_mib: u64 = sizes
        .iter()
        .map(|size| match size {
            PartitionSize::Fixed(mib) => *mib,
            PartitionSize::Rest => 0,
        })
        .sum();
    let disk_mib = disk.size_bytes / MIB;
    let has_rest = sizes.last() == Some(&PartitionSize::Rest);
    if fixed_mib > disk_mib || (has_rest && fixed_mib == disk_mib) {
        return Err(invalid_layout(format!(
            "layout needs {fixed_mib} MiB{} but {} has {disk_mib} MiB",
            if has_rest { " plus remainder" } else { "" },
            disk.path()
        )));
    }
    Ok(sizes)
}

/// Build and validate the install plan for a host.
///
/// # Errors
/// Returns a permanent `InvalidPartitionConfig` error for layouts that do not
/// fit the hardware, and `InvalidInstallImage` for unusable image or hostname
/// settings.
pub fn plan(
    host_name: &str,
    install: &InstallImage,
    hints: Option<&RootDeviceHints>,
    hardware: &HardwareDetails,
) -> Result<InstallPlan, Error> {
    let disk = select_root_disk(&hardware.disks, hints)?;
    let sizes = validate_partitions(&install.partitions, disk)?;

    let image_name = install.image.name.trim();
    if image_name.is_empty() || image_name.contains('/') || image_name.contains(char::is_whitespace)
    {
        return Err(Error::permanent(
            INVALID_INSTALL_IMAGE,
            format!("invalid image name {:?}", install.image.name),
        ));
    }
    let hostname = install.hostname.as_deref().unwrap_or(host_name);
    if !regex(&HOSTNAME_RE)?.is_match(hostname) {
        return Err(Error::permanent(
            INVALID_INSTALL_IMAGE,
            format!("invalid hostname {hostname:?}"),
        ));
    }

    let image_path = match install.image.url {
        Some(_) => format!("{IMAGE_DIR}/{image_name}"),
        None => format!("{RESCUE_IMAGE_DIR}/{image_name}"),
    };
    let root_index = install
        .partitions
        .iter()
        .position(|p| p.mount == "/")
        .map_or(1, |i| i + 1);

    let mut autosetup = String::new();
    let _ = writeln!(autosetup, "DRIVE1 {}", disk.path());
    autosetup.push_str("SWRAID 0\nBOOTLOADER grub\n");
    let _ = writeln!(autosetup, "HOSTNAME {hostname}");
    for (partition, size) in install.partitions.iter().zip(&sizes) {
        let _ = writeln!(
            autosetup,
            "PART {} {} {}",
            partition.mount,
            partition.file_system,
            size.autosetup()
        );
    }
    let _ = writeln!(autosetup, "IMAGE {image_path}");

    Ok(InstallPlan {
        disk: disk.clone(),
        root_index,
        hostname: hostname.to_string(),
        image_path,
        image_url: install.image.url.clone(),
        autosetup,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::ImageSource;

    fn disk(name: &str, gib: u64, wwn: Option<&str>) -> Disk {
        Disk {
            name: name.into(),
            wwn: wwn.map(String::from),
            size_bytes: gib * 1024 * MIB,
            rotational: false,
            model: None,
            serial: None,
        }
    }

    fn hardware() -> HardwareDetails {
        HardwareDetails {
            disks: vec![disk("nvme0n1", 512, Some("eui.a0")), disk("nvme1n1", 512, Some("eui.a1"))],
            ..Default::default()
        }
    }

    fn part(mount: &str, fs: &str, size: &str) -> Partition {
        Partition {
            mount: mount.into(),
            file_system: fs.into(),
            size: size.into(),
        }
    }

    fn install(partitions: Vec<Partition>) -> InstallImage {
        InstallImage {
            image: ImageSource {
                name: "Ubuntu-2404-noble-amd64-base.tar.gz".into(),
                url: None,
            },
            partitions,
            post_install_script: None,
            hostname: None,
        }
    }

    fn reason(result: Result<InstallPlan, Error>) -> String {
        match result {
            Err(Error::Permanent { reason, .. }) => reason,
            other => panic!("expected permanent error, got {other:?}"),
        }
    }

    #[test]
    fn test_size_parsing() {
        assert_eq!(PartitionSize::parse("512M").unwrap(), PartitionSize::Fixed(512));
        assert_eq!(PartitionSize::parse("20G").unwrap(), PartitionSize::Fixed(20 * 1024));
        assert_eq!(PartitionSize::parse("1T").unwrap(), PartitionSize::Fixed(1024 * 1024));
        assert_eq!(PartitionSize::parse("all").unwrap(), PartitionSize::Rest);
        for bad in ["", "10", "10g", "0G", "-1G", "1.5G", "ALL"] {
            assert!(PartitionSize::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_plan_renders_autosetup() {
        let plan = plan(
            "worker-1",
            &install(vec![
                part("/boot", "ext3", "1G"),
                part("swap", "swap", "4G"),
                part("/", "ext4", "all"),
            ]),
            None,
            &hardware(),
        )
        .unwrap();

        assert_eq!(plan.disk.name, "nvme0n1");
        assert_eq!(plan.root_index, 3);
        assert_eq!(plan.root_partition(), "/dev/nvme0n1p3");
        assert_eq!(
            plan.autosetup,
            "DRIVE1 /dev/nvme0n1\nSWRAID 0\nBOOTLOADER grub\nHOSTNAME worker-1\n\
             PART /boot ext3 1024M\nPART swap swap 4096M\nPART / ext4 all\n\
             IMAGE /root/.oldroot/nfs/images/Ubuntu-2404-noble-amd64-base.tar.gz\n"
        );
    }

    #[test]
    fn test_lvm_partitions_are_accepted() {
        let plan = plan(
            "worker-1",
            &install(vec![
                part("lvm", "ext2", "1G"),
                part("lvm", "vg1", "2G"),
                part("/", "ext4", "all"),
            ]),
            None,
            &hardware(),
        )
        .unwrap();
        assert_eq!(plan.root_index, 3);
        assert!(plan
            .autosetup
            .contains("PART lvm ext2 1024M\nPART lvm vg1 2048M\nPART / ext4 all\n"));

        let only_lvm = install(vec![part("lvm", "ext2", "1G")]);
        assert_eq!(reason(super::plan("h", &only_lvm, None, &hardware())), INVALID_PARTITION_CONFIG);
    }

    #[test]
    fn test_root_device_hints() {
        let hints = RootDeviceHints {
            wwn: Some("eui.a1".into()),
            device_name: None,
        };
        let layout = install(vec![part("/", "ext4", "all")]);
        assert_eq!(plan("h", &layout, Some(&hints), &hardware()).unwrap().disk.name, "nvme1n1");

        let by_name = RootDeviceHints {
            wwn: None,
            device_name: Some("/dev/nvme1n1".into()),
        };
        assert_eq!(plan("h", &layout, Some(&by_name), &hardware()).unwrap().disk.name, "nvme1n1");

        let missing = RootDeviceHints {
            wwn: Some("eui.ff".into()),
            device_name: None,
        };
        assert_eq!(reason(plan("h", &layout, Some(&missing), &hardware())), INVALID_PARTITION_CONFIG);
    }

    #[test]
    fn test_layout_exceeding_disk_is_rejected() {
        let layout = install(vec![part("/", "ext4", "600G")]);
        assert_eq!(reason(plan("h", &layout, None, &hardware())), INVALID_PARTITION_CONFIG);

        let exact = install(vec![part("/", "ext4", "512G")]);
        assert!(plan("h", &exact, None, &hardware()).is_ok());

        let no_room_left = install(vec![part("/boot", "ext3", "512G"), part("/", "ext4", "all")]);
        assert_eq!(reason(plan("h", &no_room_left, None, &hardware())), INVALID_PARTITION_CONFIG);
    }

    #[test]
    fn test_structural_errors() {
        let cases = [
            vec![],
            vec![part("/boot", "ext3", "1G")],
            vec![part("/", "ext4", "all"), part("/var", "xfs", "10G")],
            vec![part("/", "ext4", "10G"), part("/", "ext4", "10G")],
            vec![part("data", "ext4", "10G"), part("/", "ext4", "all")],
        ];
        for partitions in cases {
            assert_eq!(
                reason(plan("h", &install(partitions.clone()), None, &hardware())),
                INVALID_PARTITION_CONFIG,
                "{partitions:?}"
            );
        }
    }

    #[test]
    fn test_image_source_paths_and_hostname() {
        let mut layout = install(vec![part("/", "ext4", "all")]);
        layout.image.url = Some("https://images.example.com/custom.tar.gz".into());
        layout.hostname = Some("db-0".into());
        let plan_with_url = plan("h", &layout, None, &hardware()).unwrap();
        assert_eq!(plan_with_url.image_path, "/root/images/Ubuntu-2404-noble-amd64-base.tar.gz");
        assert!(plan_with_url.autosetup.contains("HOSTNAME db-0\n"));

        layout.hostname = Some("Not_Valid".into());
        assert_eq!(reason(plan("h", &layout, None, &hardware())), INVALID_INSTALL_IMAGE);
    }
}
