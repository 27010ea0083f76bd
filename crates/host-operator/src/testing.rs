//! In-memory Robot, SSH and Kubernetes doubles for unit tests.
//!
//! A [`FakeWorld`] models one dedicated server: what it is running, which
//! rescue key Robot has armed and which commands reached it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hetzner_provider::remote::{
    CommandOutput, RemoteExecutor, RemoteSession, SshCredentials, Target,
};
use hetzner_provider::robot::{
    RescueStatus, ResetType, RobotApi, RobotCredentials, RobotServer, SshKey,
};
use hetzner_provider::{Error, RemoteError};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::crds::{
    ConsumerRef, HetznerBareMetalHost, HetznerBareMetalHostSpec, HetznerBareMetalHostStatus,
    ImageSource, InstallImage, Partition, SecretRef,
};
use crate::install::RemoteHost;
use crate::phase::Phase;
use crate::reconciler::{HostStore, RobotFactory, StoreError};
use crate::secrets::SshKeyPair;
use crate::state_machine::{self, HostView, StepContext, StepOutcome, RESCUE_HOSTNAME};

pub const HOST_NAME: &str = "worker-1";
pub const NAMESPACE: &str = "clusters";
pub const SERVER_ID: u64 = 321_987;
pub const SERVER_IPV4: &str = "203.0.113.7";

const RESCUE_PUBLIC_KEY: &str = "ssh-ed25519 RESCUE rescue";
const OS_PUBLIC_KEY: &str = "ssh-ed25519 OS os";

const LSBLK_OUTPUT: &str = r#"{"blockdevices": [
    {"name":"nvme0n1","type":"disk","size":512110190592,"rota":false,"wwn":"eui.0025388b91b5e8a0","model":"SAMSUNG MZVL2512HCJQ","serial":"S675NX0S"},
    {"name":"nvme1n1","type":"disk","size":512110190592,"rota":false,"wwn":"eui.0025388b91b5e8a1","model":"SAMSUNG MZVL2512HCJQ","serial":"S675NX0T"}
]}"#;

const IP_OUTPUT: &str = r#"[
    {"ifindex":1,"ifname":"lo","link_type":"loopback","address":"00:00:00:00:00:00",
     "addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8}]},
    {"ifindex":2,"ifname":"enp5s0","link_type":"ether","address":"a8:a1:59:0e:11:22",
     "addr_info":[{"family":"inet","local":"203.0.113.7","prefixlen":26}]}
]"#;

const SYSTEM_OUTPUT: &str =
    "firmware=uefi\ncpu_threads=16\ncpu_model=AMD Ryzen 7 3700X 8-Core Processor\nram_kib=65777032\n";

/// What the server is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    Off,
    Os,
    Rescue,
    Booting,
}

struct WorldState {
    spec: HetznerBareMetalHostSpec,
    status: HetznerBareMetalHostStatus,
    generation: i64,
    deleting: bool,
    now: DateTime<Utc>,

    robot_calls: Vec<String>,
    resets: Vec<ResetType>,
    rescue_active: bool,
    authorized_fingerprint: Option<String>,
    keys: Vec<SshKey>,
    next_reset_error: Option<Error>,
    server_name: String,

    mode: HostMode,
    booting_into: HostMode,
    boot_hangs: bool,
    /// Connect attempts a boot takes; the last one still fails.
    boot_connects: u32,
    boot_connects_left: u32,
    os_installed: bool,
    os_port_open: bool,
    cloud_init_done: bool,
    connect_failures: u32,
    command_failures: Vec<(String, u32)>,
    hanging_commands: Vec<String>,
    commands: Vec<String>,
}

type Shared = Arc<Mutex<WorldState>>;

fn lock(state: &Shared) -> MutexGuard<'_, WorldState> {
    state.lock().unwrap()
}

fn key_pair(name: &str, public_key: &str) -> SshKeyPair {
    SshKeyPair {
        name: name.to_string(),
        credentials: SshCredentials::root(public_key, format!("PRIVATE {name}")),
    }
}

fn rescue_ssh_key() -> SshKey {
    SshKey {
        name: "rescue-key".into(),
        fingerprint: "fp:rescue-key".into(),
        data: RESCUE_PUBLIC_KEY.into(),
    }
}

fn default_spec() -> HetznerBareMetalHostSpec {
    let partition = |mount: &str, file_system: &str, size: &str| Partition {
        mount: mount.into(),
        file_system: file_system.into(),
        size: size.into(),
    };
    HetznerBareMetalHostSpec {
        server_id: SERVER_ID,
        description: "rack 4".into(),
        consumer_ref: None,
        install_image: Some(InstallImage {
            image: ImageSource {
                name: "Ubuntu-2404-noble-amd64-base.tar.gz".into(),
                url: None,
            },
            partitions: vec![
                partition("/boot", "ext4", "1G"),
                partition("swap", "swap", "4G"),
                partition("/", "ext4", "all"),
            ],
            post_install_script: None,
            hostname: None,
        }),
        root_device_hints: None,
        rescue_ssh_secret_ref: SecretRef {
            name: "rescue-ssh".into(),
        },
        os_ssh_secret_ref: SecretRef {
            name: "os-ssh".into(),
        },
        robot_secret_ref: SecretRef {
            name: "robot-credentials".into(),
        },
        ssh_port_after_install: 22,
        ssh_port_after_cloud_init: 22,
        wipe_disks_on_deprovision: false,
    }
}

/// One simulated server plus the host resource describing it.
pub struct FakeWorld {
    state: Shared,
    cancel: CancellationToken,
    config: HostConfig,
    rescue_key: SshKeyPair,
    os_key: SshKeyPair,
}

impl FakeWorld {
    /// A running server with an OS we hold no key for.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WorldState {
                spec: default_spec(),
                status: HetznerBareMetalHostStatus::default(),
                generation: 1,
                deleting: false,
                now: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                robot_calls: Vec::new(),
                resets: Vec::new(),
                rescue_active: false,
                authorized_fingerprint: None,
                keys: Vec::new(),
                next_reset_error: None,
                server_name: String::new(),
                mode: HostMode::Os,
                booting_into: HostMode::Os,
                boot_hangs: false,
                boot_connects: 1,
                boot_connects_left: 0,
                os_installed: false,
                os_port_open: true,
                cloud_init_done: false,
                connect_failures: 0,
                command_failures: Vec::new(),
                hanging_commands: Vec::new(),
                commands: Vec::new(),
            })),
            cancel: CancellationToken::new(),
            config: HostConfig::default(),
            rescue_key: key_pair("rescue-key", RESCUE_PUBLIC_KEY),
            os_key: key_pair("os-key", OS_PUBLIC_KEY),
        }
    }

    /// A server already running the rescue system with our key.
    pub fn in_rescue() -> Self {
        let world = Self::new();
        {
            let mut state = world.lock();
            state.mode = HostMode::Rescue;
            state.keys.push(rescue_ssh_key());
            state.authorized_fingerprint = Some("fp:rescue-key".into());
        }
        world
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        lock(&self.state)
    }

    pub fn robot(&self) -> FakeRobot {
        FakeRobot(Arc::clone(&self.state))
    }

    pub fn remote(&self) -> FakeRemote {
        FakeRemote(Arc::clone(&self.state))
    }

    pub fn config_mut(&mut self) -> &mut HostConfig {
        &mut self.config
    }

    pub fn rescue_credentials(&self) -> SshCredentials {
        self.rescue_key.credentials.clone()
    }

    pub fn remote_host<'a>(
        &self,
        remote: &'a FakeRemote,
        credentials: &'a SshCredentials,
        port: u16,
    ) -> RemoteHost<'a> {
        RemoteHost {
            executor: remote,
            target: Target::new(SERVER_IPV4, port),
            credentials,
            connect_timeout: Duration::from_secs(15),
        }
    }

    // ------------------------------------------------------------------
    // Host resource
    // ------------------------------------------------------------------

    pub fn claim(&self) {
        self.lock().spec.consumer_ref = Some(ConsumerRef {
            kind: "HetznerBareMetalMachine".into(),
            name: "machine-a".into(),
            namespace: None,
        });
    }

    pub fn release(&self) {
        self.lock().spec.consumer_ref = None;
    }

    pub fn mark_deleting(&self) {
        self.lock().deleting = true;
    }

    pub fn bump_generation(&self) {
        self.lock().generation += 1;
    }

    pub fn set_partitions(&self, layout: &[(&str, &str, &str)]) {
        let mut state = self.lock();
        if let Some(install) = state.spec.install_image.as_mut() {
            install.partitions = layout
                .iter()
                .map(|(mount, file_system, size)| Partition {
                    mount: (*mount).into(),
                    file_system: (*file_system).into(),
                    size: (*size).into(),
                })
                .collect();
        }
    }

    pub fn set_wipe_disks(&self, wipe: bool) {
        self.lock().spec.wipe_disks_on_deprovision = wipe;
    }

    pub fn set_cloud_init_port(&self, port: u16) {
        self.lock().spec.ssh_port_after_cloud_init = port;
    }

    pub fn status(&self) -> HetznerBareMetalHostStatus {
        self.lock().status.clone()
    }

    pub fn force_status(&self, update: impl FnOnce(&mut HetznerBareMetalHostStatus)) {
        update(&mut self.lock().status);
    }

    /// The host as stored in the API server.
    pub fn host_resource(&self) -> HetznerBareMetalHost {
        let state = self.lock();
        let mut host = HetznerBareMetalHost::new(HOST_NAME, state.spec.clone());
        host.metadata.namespace = Some(NAMESPACE.into());
        host.metadata.generation = Some(state.generation);
        if state.status != HetznerBareMetalHostStatus::default() {
            host.status = Some(state.status.clone());
        }
        host
    }

    /// Secrets referenced by the host resource.
    pub fn secrets(&self) -> Vec<Secret> {
        let ssh = |name: &str, pair: &SshKeyPair| {
            secret(
                name,
                &[
                    ("sshkey-name", pair.name.as_str()),
                    ("ssh-publickey", pair.credentials.public_key.as_str()),
                    ("ssh-privatekey", pair.credentials.private_key.as_str()),
                ],
            )
        };
        vec![
            secret(
                "robot-credentials",
                &[("robot-user", "#ws+test"), ("robot-password", "secret")],
            ),
            ssh("rescue-ssh", &self.rescue_key),
            ssh("os-ssh", &self.os_key),
        ]
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    async fn run_step(
        &self,
        status: HetznerBareMetalHostStatus,
    ) -> Result<StepOutcome, Error> {
        let (spec, generation, deleting, now) = {
            let state = self.lock();
            (state.spec.clone(), state.generation, state.deleting, state.now)
        };
        let host = HostView {
            name: HOST_NAME,
            spec: &spec,
            status: &status,
            generation,
            deleting,
        };
        let robot = self.robot();
        let remote = self.remote();
        let ctx = StepContext {
            robot: &robot,
            remote: &remote,
            config: &self.config,
            rescue_key: &self.rescue_key,
            os_key: &self.os_key,
            cancel: &self.cancel,
            now,
        };
        state_machine::step(&host, &ctx).await
    }

    fn persist(&self, outcome: &StepOutcome, release: bool) {
        let mut state = self.lock();
        state.status = outcome.status.clone();
        if release && outcome.release_claim {
            state.spec.consumer_ref = None;
        }
        if let Some(delay) = outcome.requeue_after {
            state.now += chrono::Duration::from_std(delay).unwrap();
        }
    }

    /// Run one step and store its outcome, honouring claim releases.
    pub async fn step(&self) -> Result<StepOutcome, Error> {
        let outcome = self.run_step(self.status()).await?;
        self.persist(&outcome, true);
        Ok(outcome)
    }

    pub async fn step_without_release(&self) -> Result<StepOutcome, Error> {
        let outcome = self.run_step(self.status()).await?;
        self.persist(&outcome, false);
        Ok(outcome)
    }

    /// Run one step from `status` without storing the result.
    pub async fn step_with_status(
        &self,
        status: HetznerBareMetalHostStatus,
    ) -> Result<StepOutcome, Error> {
        self.run_step(status).await
    }

    pub fn local_step(&self) -> Option<StepOutcome> {
        let state = self.lock();
        let host = HostView {
            name: HOST_NAME,
            spec: &state.spec,
            status: &state.status,
            generation: state.generation,
            deleting: state.deleting,
        };
        state_machine::local_step(&host, state.now)
    }

    /// Step until `phase` is reached; returns the number of steps taken.
    pub async fn run_until(&self, phase: Phase, max_steps: usize) -> usize {
        for taken in 0..=max_steps {
            if self.status().phase == phase {
                return taken;
            }
            if taken < max_steps {
                self.step().await.unwrap();
            }
        }
        panic!(
            "host did not reach {phase} within {max_steps} steps: {:#?}",
            self.status()
        );
    }

    pub fn advance(&self, by: Duration) {
        self.lock().now += chrono::Duration::from_std(by).unwrap();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    pub fn fail_connects(&self, count: u32) {
        self.lock().connect_failures += count;
    }

    pub fn fail_commands(&self, pattern: &str, count: u32) {
        self.lock()
            .command_failures
            .push((pattern.to_string(), count));
    }

    pub fn fail_next_reset(&self, err: Error) {
        self.lock().next_reset_error = Some(err);
    }

    pub fn set_boot_hangs(&self, hangs: bool) {
        self.lock().boot_hangs = hangs;
    }

    pub fn set_os_port_open(&self, open: bool) {
        self.lock().os_port_open = open;
    }

    /// Make every later boot take `connects` connect attempts.
    pub fn set_boot_connects(&self, connects: u32) {
        self.lock().boot_connects = connects.max(1);
    }

    /// Commands containing `pattern` never finish unless cancelled.
    pub fn hang_commands(&self, pattern: &str) {
        self.lock().hanging_commands.push(pattern.to_string());
    }

    /// The installed OS moves SSH to the cloud-init port.
    pub fn finish_cloud_init(&self) {
        self.lock().cloud_init_done = true;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn resets(&self) -> Vec<ResetType> {
        self.lock().resets.clone()
    }

    pub fn robot_calls(&self) -> Vec<String> {
        self.lock().robot_calls.clone()
    }

    pub fn robot_calls_matching(&self, call: &str) -> usize {
        self.lock().robot_calls.iter().filter(|c| *c == call).count()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn server_name(&self) -> String {
        self.lock().server_name.clone()
    }

    pub fn commands_matching(&self, pattern: &str) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn mode(&self) -> HostMode {
        self.lock().mode
    }

    pub fn rescue_active(&self) -> bool {
        self.lock().rescue_active
    }

    pub fn os_installed(&self) -> bool {
        self.lock().os_installed
    }
}

fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

// ----------------------------------------------------------------------
// Robot
// ----------------------------------------------------------------------

#[derive(Clone)]
pub struct FakeRobot(Shared);

impl FakeRobot {
    fn record(&self, call: &str) -> MutexGuard<'_, WorldState> {
        let mut state = lock(&self.0);
        state.robot_calls.push(call.to_string());
        state
    }

    fn server(state: &WorldState) -> RobotServer {
        RobotServer {
            number: state.spec.server_id,
            name: state.server_name.clone(),
            ipv4: Some(SERVER_IPV4.into()),
            ipv6_net: Some("2a01:4f8:10a:1::".into()),
            product: "AX41-NVMe".into(),
            dc: "FSN1-DC14".into(),
            ready: true,
            cancelled: false,
        }
    }
}

#[async_trait]
impl RobotApi for FakeRobot {
    async fn list_servers(&self) -> hetzner_provider::Result<Vec<RobotServer>> {
        let state = self.record("list_servers");
        Ok(vec![Self::server(&state)])
    }

    async fn get_server(&self, _server_number: u64) -> hetzner_provider::Result<RobotServer> {
        let state = self.record("get_server");
        Ok(Self::server(&state))
    }

    async fn set_server_name(
        &self,
        _server_number: u64,
        name: &str,
    ) -> hetzner_provider::Result<RobotServer> {
        let mut state = self.record("set_server_name");
        state.server_name = name.to_string();
        Ok(Self::server(&state))
    }

    async fn get_rescue(&self, server_number: u64) -> hetzner_provider::Result<RescueStatus> {
        let state = self.record("get_rescue");
        Ok(RescueStatus {
            server_number,
            active: state.rescue_active,
        })
    }

    async fn activate_rescue(
        &self,
        server_number: u64,
        key_fingerprint: &str,
    ) -> hetzner_provider::Result<RescueStatus> {
        let mut state = self.record("activate_rescue");
        state.rescue_active = true;
        state.authorized_fingerprint = Some(key_fingerprint.to_string());
        Ok(RescueStatus {
            server_number,
            active: true,
        })
    }

    async fn deactivate_rescue(&self, server_number: u64) -> hetzner_provider::Result<RescueStatus> {
        let mut state = self.record("deactivate_rescue");
        state.rescue_active = false;
        Ok(RescueStatus {
            server_number,
            active: false,
        })
    }

    async fn reset(&self, _server_number: u64, reset_type: ResetType) -> hetzner_provider::Result<()> {
        let mut state = self.record("reset");
        if let Some(err) = state.next_reset_error.take() {
            return Err(err);
        }
        state.resets.push(reset_type);
        if reset_type == ResetType::PowerLong {
            state.mode = HostMode::Off;
        } else {
            state.mode = HostMode::Booting;
            state.boot_connects_left = state.boot_connects;
            state.booting_into = if state.rescue_active {
                HostMode::Rescue
            } else {
                HostMode::Os
            };
        }
        Ok(())
    }

    async fn reset_options(&self, _server_number: u64) -> hetzner_provider::Result<Vec<ResetType>> {
        let _state = self.record("reset_options");
        Ok(vec![
            ResetType::Software,
            ResetType::Hardware,
            ResetType::Power,
            ResetType::PowerLong,
            ResetType::Manual,
        ])
    }

    async fn list_ssh_keys(&self) -> hetzner_provider::Result<Vec<SshKey>> {
        let state = self.record("list_ssh_keys");
        Ok(state.keys.clone())
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> hetzner_provider::Result<SshKey> {
        let mut state = self.record("create_ssh_key");
        let key = SshKey {
            name: name.to_string(),
            fingerprint: format!("fp:{name}"),
            data: public_key.to_string(),
        };
        state.keys.push(key.clone());
        Ok(key)
    }
}

/// Hands out the same fake client for every credential set.
pub struct FakeRobotFactory(pub FakeRobot);

impl RobotFactory for FakeRobotFactory {
    fn robot(&self, _credentials: &RobotCredentials) -> Result<Arc<dyn RobotApi>, Error> {
        Ok(Arc::new(self.0.clone()))
    }
}

// ----------------------------------------------------------------------
// Remote execution
// ----------------------------------------------------------------------

#[derive(Clone)]
pub struct FakeRemote(Shared);

fn refused(target: &Target, message: &str) -> RemoteError {
    RemoteError::Connect {
        target: target.to_string(),
        message: message.to_string(),
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn connect(
        &self,
        target: &Target,
        credentials: &SshCredentials,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        if cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        let mut state = lock(&self.0);

        if state.mode == HostMode::Booting {
            if !state.boot_hangs {
                state.boot_connects_left = state.boot_connects_left.saturating_sub(1);
                if state.boot_connects_left == 0 {
                    state.mode = state.booting_into;
                    if state.mode == HostMode::Rescue {
                        state.rescue_active = false;
                    }
                }
            }
            return Err(refused(target, "no route to host"));
        }
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(refused(target, "connection reset by peer"));
        }

        let public_key = credentials.public_key.trim();
        let accepted = match state.mode {
            HostMode::Off | HostMode::Booting => {
                return Err(refused(target, "no route to host"));
            }
            HostMode::Rescue => {
                if target.port != 22 {
                    return Err(refused(target, "connection refused"));
                }
                state
                    .authorized_fingerprint
                    .as_ref()
                    .and_then(|fp| state.keys.iter().find(|k| &k.fingerprint == fp))
                    .is_some_and(|key| key.data.trim() == public_key)
            }
            HostMode::Os => {
                let port = if state.cloud_init_done {
                    state.spec.ssh_port_after_cloud_init
                } else {
                    state.spec.ssh_port_after_install
                };
                if target.port != port || !state.os_port_open {
                    return Err(refused(target, "connection refused"));
                }
                state.os_installed && public_key == OS_PUBLIC_KEY
            }
        };
        if !accepted {
            return Err(RemoteError::Auth {
                user: credentials.user.clone(),
                message: "publickey rejected".into(),
            });
        }

        Ok(Box::new(FakeSession(Arc::clone(&self.0))))
    }
}

struct FakeSession(Shared);

#[async_trait]
impl RemoteSession for FakeSession {
    async fn run(
        &mut self,
        script: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RemoteError> {
        if cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        let hangs = {
            let mut state = lock(&self.0);
            state.commands.push(script.to_string());
            state
                .hanging_commands
                .iter()
                .any(|pattern| script.contains(pattern.as_str()))
        };
        if hangs {
            cancel.cancelled().await;
            return Err(RemoteError::Cancelled);
        }
        let mut state = lock(&self.0);

        if let Some(failure) = state
            .command_failures
            .iter_mut()
            .find(|(pattern, left)| *left > 0 && script.contains(pattern.as_str()))
        {
            failure.1 -= 1;
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: "injected failure".into(),
                exit_code: 1,
            });
        }

        let stdout = if script.trim() == "hostname" {
            if state.mode == HostMode::Rescue {
                RESCUE_HOSTNAME.to_string()
            } else {
                HOST_NAME.to_string()
            }
        } else if script.contains("lsblk") {
            LSBLK_OUTPUT.to_string()
        } else if script.contains("ip -j addr") {
            IP_OUTPUT.to_string()
        } else if script.contains("cpu_threads") {
            SYSTEM_OUTPUT.to_string()
        } else {
            if script.contains("installimage") {
                state.os_installed = true;
            }
            String::new()
        };

        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn close(self: Box<Self>) {}
}

// ----------------------------------------------------------------------
// Kubernetes
// ----------------------------------------------------------------------

struct StoreState {
    hosts: BTreeMap<String, HetznerBareMetalHost>,
    secrets: BTreeMap<String, Secret>,
    resource_version: u64,
    status_conflicts: u32,
    status_writes: u32,
}

/// [`HostStore`] holding hosts of one namespace with optimistic concurrency.
pub struct MemoryStore(Mutex<StoreState>);

impl MemoryStore {
    pub fn new(host: HetznerBareMetalHost, secrets: Vec<Secret>) -> Self {
        let store = Self::empty();
        store.lock().secrets = secrets.into_iter().map(|s| (s.name_any(), s)).collect();
        store.insert(host);
        store
    }

    pub fn empty() -> Self {
        Self(Mutex::new(StoreState {
            hosts: BTreeMap::new(),
            secrets: BTreeMap::new(),
            resource_version: 1,
            status_conflicts: 0,
            status_writes: 0,
        }))
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.0.lock().unwrap()
    }

    /// Add or replace a host.
    pub fn insert(&self, mut host: HetznerBareMetalHost) {
        let mut state = self.lock();
        state.resource_version += 1;
        host.metadata.resource_version = Some(state.resource_version.to_string());
        state.hosts.insert(host.name_any(), host);
    }

    /// The host named [`HOST_NAME`].
    pub fn host(&self) -> Option<HetznerBareMetalHost> {
        self.host_named(HOST_NAME)
    }

    pub fn host_named(&self, name: &str) -> Option<HetznerBareMetalHost> {
        self.lock().hosts.get(name).cloned()
    }

    pub fn phase(&self) -> Phase {
        self.phase_of(HOST_NAME)
    }

    pub fn phase_of(&self, name: &str) -> Phase {
        self.host_named(name)
            .and_then(|h| h.status)
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn remove_secret(&self, name: &str) {
        self.lock().secrets.remove(name);
    }

    /// Reject the next `count` status writes as stale.
    pub fn inject_status_conflicts(&self, count: u32) {
        self.lock().status_conflicts = count;
    }

    /// Status writes attempted, rejected ones included.
    pub fn status_writes(&self) -> u32 {
        self.lock().status_writes
    }

    pub fn mark_deleting(&self) {
        let mut state = self.lock();
        state.resource_version += 1;
        let version = state.resource_version.to_string();
        if let Some(host) = state.hosts.get_mut(HOST_NAME) {
            host.metadata.deletion_timestamp = Some(Time(Utc::now()));
            host.metadata.resource_version = Some(version);
        }
    }
}

impl StoreState {
    /// Apply `update` to the stored host if `seen` is current.
    fn write(
        &mut self,
        seen: &HetznerBareMetalHost,
        update: impl FnOnce(&mut HetznerBareMetalHost),
    ) -> Result<HetznerBareMetalHost, StoreError> {
        let name = seen.name_any();
        let current = self
            .hosts
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        if current.metadata.resource_version != seen.metadata.resource_version {
            return Err(StoreError::Conflict(format!("{name} was modified")));
        }
        update(current);
        self.resource_version += 1;
        current.metadata.resource_version = Some(self.resource_version.to_string());
        Ok(current.clone())
    }
}

#[async_trait]
impl HostStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<HetznerBareMetalHost>, StoreError> {
        Ok(self.lock().hosts.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<HetznerBareMetalHost>, StoreError> {
        Ok(self.lock().hosts.values().cloned().collect())
    }

    async fn replace_status(
        &self,
        host: &HetznerBareMetalHost,
    ) -> Result<HetznerBareMetalHost, StoreError> {
        let mut state = self.lock();
        state.status_writes += 1;
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            state.resource_version += 1;
            let version = state.resource_version.to_string();
            if let Some(current) = state.hosts.get_mut(&host.name_any()) {
                current.metadata.resource_version = Some(version);
            }
            return Err(StoreError::Conflict("injected conflict".into()));
        }
        let status = host.status.clone();
        state.write(host, |current| current.status = status)
    }

    async fn add_finalizer(
        &self,
        host: &HetznerBareMetalHost,
    ) -> Result<HetznerBareMetalHost, StoreError> {
        self.lock().write(host, |current| {
            current
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(crate::reconciler::HOST_FINALIZER.to_string());
        })
    }

    async fn remove_finalizer(&self, host: &HetznerBareMetalHost) -> Result<(), StoreError> {
        let mut state = self.lock();
        let updated = state.write(host, |current| {
            if let Some(finalizers) = current.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != crate::reconciler::HOST_FINALIZER);
            }
        })?;
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.hosts.remove(&updated.name_any());
        }
        Ok(())
    }

    async fn set_consumer_ref(
        &self,
        host: &HetznerBareMetalHost,
        consumer: Option<&ConsumerRef>,
    ) -> Result<HetznerBareMetalHost, StoreError> {
        let consumer = consumer.cloned();
        self.lock().write(host, |current| {
            current.spec.consumer_ref = consumer;
            current.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        })
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.lock().secrets.get(name).cloned())
    }
}
