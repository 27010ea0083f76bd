//! One reconcile step of the bare metal host lifecycle.
//!
//! [`step`] advances a host by at most one phase. It never sleeps on open
//! waits: rescue boot, install completion and OS reachability come back as
//! "unchanged phase, requeue after". Provider errors map onto the status
//! as follows:
//!
//! * `RateLimited`: requeue after the hint, status otherwise untouched.
//! * `Retryable`: `attempt.count` grows, requeue after `retryableRequeue`.
//! * `Permanent`: move to `Error` until the spec generation changes.
//! * `Cancelled`: abandoned, nothing to persist.
//!
//! Connect failures in `Registering` and `ImageInstalling`, and failed
//! hardware inventories, count towards `registeringConnectCap`; at the cap
//! the host falls back to `Preparing` with a forced rescue reset. A host
//! that answers nowhere during `ImageInstalling` first gets
//! `rescueBootTimeout` to finish booting before failures are counted.
//!
//! Every reset into rescue is preceded by a look at Robot's rescue flag, so
//! re-running a step on the same input never resets the server twice.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hetzner_provider::remote::{RemoteExecutor, RemoteSession, Target};
use hetzner_provider::robot::{ResetType, RobotApi};
use hetzner_provider::{Error, RemoteError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::conditions::{
    Severity, CREDENTIALS_AVAILABLE, HARDWARE_INSPECTED, HOST_REACHABLE, IMAGE_INSTALLED, READY,
    RESCUE_SYSTEM_READY,
};
use crate::config::HostConfig;
use crate::crds::{Attempt, HetznerBareMetalHostSpec, HetznerBareMetalHostStatus};
use crate::hardware::{self, Disk};
use crate::install::{InstallError, InstallPipeline, RemoteHost};
use crate::partition;
use crate::phase::Phase;
use crate::secrets::SshKeyPair;

/// Hostname reported by the Hetzner rescue system.
pub const RESCUE_HOSTNAME: &str = "rescue";

const RESCUE_SSH_PORT: u16 = 22;

/// Provider access for one step.
pub struct StepContext<'a> {
    pub robot: &'a dyn RobotApi,
    pub remote: &'a dyn RemoteExecutor,
    pub config: &'a HostConfig,
    pub rescue_key: &'a SshKeyPair,
    pub os_key: &'a SshKeyPair,
    pub cancel: &'a CancellationToken,
    pub now: DateTime<Utc>,
}

/// The host as read at the start of the step.
pub struct HostView<'a> {
    pub name: &'a str,
    pub spec: &'a HetznerBareMetalHostSpec,
    pub status: &'a HetznerBareMetalHostStatus,
    pub generation: i64,
    pub deleting: bool,
}

/// Result of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Status to persist.
    pub status: HetznerBareMetalHostStatus,
    /// `None` waits for the next change of the resource.
    pub requeue_after: Option<Duration>,
    /// The caller must clear `spec.consumerRef` before persisting.
    pub release_claim: bool,
}

enum Next {
    Requeue(Duration),
    AwaitChange,
    ReleaseClaim,
}

/// Status bookkeeping shared by provider and local steps.
struct Tracker<'a> {
    name: &'a str,
    now: DateTime<Utc>,
    status: HetznerBareMetalHostStatus,
}

impl Tracker<'_> {
    fn transition(&mut self, to: Phase) -> Result<(), Error> {
        let from = self.status.phase;
        from.transition(to)?;
        if from == to {
            return Ok(());
        }

        let status = &mut self.status;
        status.phase = to;
        status.attempt = Attempt::default();
        status.unreachable_since = None;
        status.last_transition_time = Some(self.now);
        if to == Phase::Provisioned {
            status.conditions.mark_true(READY, self.now);
        } else {
            status.conditions.mark_false(
                READY,
                to.as_str(),
                Severity::Info,
                format!("host is {to}"),
                self.now,
            );
        }
        if to == Phase::Preparing {
            status.conditions.remove(RESCUE_SYSTEM_READY);
            if status.conditions.is_true(IMAGE_INSTALLED) {
                status.conditions.remove(IMAGE_INSTALLED);
            }
        }

        info!(host = %self.name, %from, %to, "Phase transition");
        Ok(())
    }

    fn go(&mut self, to: Phase) -> Result<Next, Error> {
        self.transition(to)?;
        Ok(Next::Requeue(Duration::ZERO))
    }

    fn fail(&mut self, reason: &str, message: &str, generation: i64) {
        let status = &mut self.status;
        if !status.phase.can_transition_to(Phase::Error) {
            warn!(host = %self.name, phase = %status.phase, reason, "Ignoring error in terminal phase");
            return;
        }
        if status.phase != Phase::Error {
            status.last_transition_time = Some(self.now);
        }
        status.phase = Phase::Error;
        status.attempt = Attempt::default();
        status.error_reason = Some(reason.to_string());
        status.error_message = Some(message.to_string());
        status.error_generation = Some(generation);
        status
            .conditions
            .mark_false(READY, reason, Severity::Error, message, self.now);
        warn!(host = %self.name, reason, message, "Host moved to Error");
    }

    fn finish(
        mut self,
        result: Result<Next, Error>,
        generation: i64,
        retryable_requeue: Duration,
    ) -> Result<StepOutcome, Error> {
        let (requeue_after, release_claim) = match result {
            Ok(Next::Requeue(delay)) => (Some(delay), false),
            Ok(Next::AwaitChange) => (None, false),
            Ok(Next::ReleaseClaim) => (Some(Duration::ZERO), true),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(Error::RateLimited {
                provider,
                retry_after,
            }) => {
                debug!(host = %self.name, provider, ?retry_after, "Rate limited");
                (Some(retry_after), false)
            }
            Err(Error::Retryable(message) | Error::Conflict(message)) => {
                warn!(host = %self.name, phase = %self.status.phase, error = %message, "Retryable step failure");
                self.status.attempt.count += 1;
                self.status.attempt.last_error = Some(message);
                (Some(retryable_requeue), false)
            }
            Err(Error::Permanent { reason, message }) => {
                self.fail(&reason, &message, generation);
                (None, false)
            }
        };

        self.status.last_updated = Some(self.now);
        Ok(StepOutcome {
            status: self.status,
            requeue_after,
            release_claim,
        })
    }
}

/// Decide phases that need no provider access.
fn local_next(host: &HostView<'_>, tracker: &mut Tracker<'_>) -> Option<Result<Next, Error>> {
    let phase = tracker.status.phase;
    match phase {
        Phase::Deleted => Some(Ok(Next::AwaitChange)),
        Phase::Unmanaged | Phase::Error if host.deleting => Some(tracker.go(Phase::Deleted)),
        Phase::Unmanaged => {
            if host.spec.consumer_ref.is_some() && host.spec.install_image.is_some() {
                let status = &mut tracker.status;
                status.error_reason = None;
                status.error_message = None;
                status.error_generation = None;
                status.os_boot_timeouts = 0;
                Some(tracker.go(Phase::Preparing))
            } else {
                Some(Ok(Next::AwaitChange))
            }
        }
        Phase::Error => {
            let failed_at = tracker.status.error_generation.unwrap_or(0);
            if host.generation > failed_at {
                info!(host = %host.name, generation = host.generation, "Spec changed, retrying after error");
                let status = &mut tracker.status;
                status.error_reason = None;
                status.error_message = None;
                status.error_generation = None;
                status.os_boot_timeouts = 0;
                status.rescue_reset_at = None;
                status.force_rescue_reset = true;
                Some(tracker.go(Phase::Preparing))
            } else {
                Some(Ok(Next::AwaitChange))
            }
        }
        _ if phase.is_claimed() && (host.deleting || host.spec.consumer_ref.is_none()) => {
            Some(tracker.go(Phase::Deprovisioning))
        }
        _ => None,
    }
}

/// Run the part of a step that needs no credentials, if that is all the
/// current phase requires.
#[must_use]
pub fn local_step(host: &HostView<'_>, now: DateTime<Utc>) -> Option<StepOutcome> {
    let mut tracker = Tracker {
        name: host.name,
        now,
        status: host.status.clone(),
    };
    let result = local_next(host, &mut tracker)?;
    // Local decisions are never cancelled, and never retryable.
    tracker.finish(result, host.generation, Duration::ZERO).ok()
}

/// Advance the host by at most one phase.
///
/// # Errors
/// Returns [`Error::Cancelled`] when the step was cancelled; every other
/// error is folded into the returned status.
#[instrument(skip_all, fields(host = %host.name, phase = %host.status.phase))]
pub async fn step(host: &HostView<'_>, ctx: &StepContext<'_>) -> Result<StepOutcome, Error> {
    let mut machine = Machine {
        host,
        ctx,
        tracker: Tracker {
            name: host.name,
            now: ctx.now,
            status: host.status.clone(),
        },
    };

    let result = match local_next(host, &mut machine.tracker) {
        Some(result) => result,
        None => machine.run_phase().await,
    };
    machine
        .tracker
        .finish(result, host.generation, ctx.config.retryable_requeue())
}

#[derive(Clone, Copy)]
enum Login {
    Rescue,
    Os,
}

enum Reach {
    Rescue(Box<dyn RemoteSession>),
    Booted { hostname: String },
    Unreachable(String),
}

enum RescueState {
    Ready(Box<dyn RemoteSession>),
    Waiting(Duration),
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

/// Compare OpenSSH public keys by type and key material, ignoring comments.
fn same_public_key(a: &str, b: &str) -> bool {
    let fields = |key: &str| key.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
    fields(a) == fields(b)
}

struct Machine<'h, 'c> {
    host: &'h HostView<'h>,
    ctx: &'c StepContext<'c>,
    tracker: Tracker<'h>,
}

impl<'c> Machine<'_, 'c> {
    fn status(&mut self) -> &mut HetznerBareMetalHostStatus {
        &mut self.tracker.status
    }

    fn server(&self) -> u64 {
        self.host.spec.server_id
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.now
    }

    async fn run_phase(&mut self) -> Result<Next, Error> {
        match self.tracker.status.phase {
            Phase::Preparing => self.preparing().await,
            Phase::Registering => self.registering().await,
            Phase::Inspecting => self.inspecting(),
            Phase::ImageInstalling => self.image_installing().await,
            Phase::Provisioning => self.provisioning().await,
            Phase::Provisioned => self.provisioned().await,
            Phase::Deprovisioning => self.deprovisioning().await,
            Phase::Unmanaged | Phase::Error | Phase::Deleted => Ok(Next::AwaitChange),
        }
    }

    // ------------------------------------------------------------------
    // Provider helpers
    // ------------------------------------------------------------------

    async fn ensure_ipv4(&mut self) -> Result<String, Error> {
        if let Some(ip) = &self.tracker.status.ipv4 {
            return Ok(ip.clone());
        }
        let server = self.ctx.robot.get_server(self.server()).await?;
        if !server.ready {
            return Err(Error::Retryable(format!(
                "server {} is not ready yet",
                server.number
            )));
        }
        let ip = server.ipv4.ok_or_else(|| {
            Error::permanent(
                "MissingIPv4",
                format!("server {} has no IPv4 address", server.number),
            )
        })?;
        self.status().ipv4 = Some(ip.clone());
        Ok(ip)
    }

    /// Fingerprint of the rescue key in Robot, uploading it if needed.
    async fn ensure_rescue_key(&self) -> Result<String, Error> {
        let key = self.ctx.rescue_key;
        let public_key = key.credentials.public_key.trim();
        let keys = self.ctx.robot.list_ssh_keys().await?;
        if let Some(existing) = keys
            .iter()
            .find(|k| k.name == key.name || same_public_key(&k.data, public_key))
        {
            return Ok(existing.fingerprint.clone());
        }
        let created = self.ctx.robot.create_ssh_key(&key.name, public_key).await?;
        info!(host = %self.host.name, key = %created.name, "Uploaded rescue key");
        Ok(created.fingerprint)
    }

    /// Arm rescue and reset into it. Disarms again if the reset fails.
    async fn activate_and_reset(&mut self) -> Result<(), Error> {
        let fingerprint = self.ensure_rescue_key().await?;
        let server = self.server();
        self.ctx.robot.activate_rescue(server, &fingerprint).await?;

        let reset_type = if self.tracker.status.powered_off {
            ResetType::Power
        } else {
            ResetType::Hardware
        };
        if let Err(err) = self.ctx.robot.reset(server, reset_type).await {
            if let Err(disarm) = self.ctx.robot.deactivate_rescue(server).await {
                warn!(host = %self.host.name, error = %disarm, "Failed to deactivate rescue after reset failure");
            }
            return Err(err);
        }

        let now = self.now();
        let status = self.status();
        status.powered_off = false;
        status.rescue_reset_at = Some(now);
        status.force_rescue_reset = false;
        info!(host = %self.host.name, server, %reset_type, "Reset into rescue system");
        Ok(())
    }

    fn remote_host(&self, login: Login, port: u16) -> Result<RemoteHost<'c>, Error> {
        let ctx = self.ctx;
        let ip = self
            .tracker
            .status
            .ipv4
            .clone()
            .ok_or_else(|| Error::Retryable("host address not known yet".into()))?;
        let credentials = match login {
            Login::Rescue => &ctx.rescue_key.credentials,
            Login::Os => &ctx.os_key.credentials,
        };
        Ok(RemoteHost {
            executor: ctx.remote,
            target: Target::new(ip, port),
            credentials,
            connect_timeout: ctx.config.ssh_connect_timeout(),
        })
    }

    /// Connect and ask for the hostname.
    async fn reach(&mut self, login: Login, port: u16) -> Result<Reach, Error> {
        self.ensure_ipv4().await?;
        let cancel = self.ctx.cancel;
        let host = self.remote_host(login, port)?;
        let mut session = match host.connect(cancel).await {
            Ok(session) => session,
            Err(RemoteError::Cancelled) => return Err(Error::Cancelled),
            Err(e) => return Ok(Reach::Unreachable(e.to_string())),
        };

        match session
            .run("hostname", self.ctx.config.command_timeout(), cancel)
            .await
        {
            Ok(output) if output.success() => {
                let hostname = output.stdout_trimmed().to_string();
                if hostname == RESCUE_HOSTNAME {
                    Ok(Reach::Rescue(session))
                } else {
                    session.close().await;
                    Ok(Reach::Booted { hostname })
                }
            }
            Ok(output) => Ok(Reach::Unreachable(format!(
                "hostname exited with status {}",
                output.exit_code
            ))),
            Err(RemoteError::Cancelled) => Err(Error::Cancelled),
            Err(e) => Ok(Reach::Unreachable(e.to_string())),
        }
    }

    /// Boot the rescue system, or report that it is up.
    ///
    /// Robot clears the rescue flag once the server has booted it, so a set
    /// flag means an earlier run already reset the server. A forced reset
    /// only skips the check for a rescue system that is already running.
    async fn ensure_rescue(&mut self) -> Result<RescueState, Error> {
        self.ensure_ipv4().await?;
        let poll = self.ctx.config.rescue_boot_poll();

        if let Some(started) = self.tracker.status.rescue_reset_at {
            if let Reach::Rescue(session) = self.reach(Login::Rescue, RESCUE_SSH_PORT).await? {
                self.status().rescue_reset_at = None;
                return Ok(RescueState::Ready(session));
            }
            let timeout = self.ctx.config.rescue_boot_timeout();
            if elapsed(self.now(), started) >= timeout {
                self.ctx.robot.deactivate_rescue(self.server()).await?;
                self.status().rescue_reset_at = None;
                return Err(Error::Retryable(format!(
                    "rescue system did not come up within {}s",
                    timeout.as_secs()
                )));
            }
            return Ok(RescueState::Waiting(poll));
        }

        let rescue = self.ctx.robot.get_rescue(self.server()).await?;
        if rescue.active {
            debug!(host = %self.host.name, "Rescue boot already pending");
            let now = self.now();
            let status = self.status();
            status.rescue_reset_at = Some(now);
            status.force_rescue_reset = false;
            return Ok(RescueState::Waiting(poll));
        }
        if !self.tracker.status.force_rescue_reset {
            if let Reach::Rescue(session) = self.reach(Login::Rescue, RESCUE_SSH_PORT).await? {
                info!(host = %self.host.name, "Host already in rescue system");
                return Ok(RescueState::Ready(session));
            }
        }

        self.activate_and_reset().await?;
        Ok(RescueState::Waiting(poll))
    }

    fn demote(&mut self) -> Result<Next, Error> {
        let status = self.status();
        status.force_rescue_reset = true;
        status.rescue_reset_at = None;
        self.tracker.go(Phase::Preparing)
    }

    /// Count a failed use of the rescue system; demote at the cap.
    fn capped_failure(&mut self, message: String) -> Result<Next, Error> {
        let cap = self.ctx.config.registering_connect_cap;
        let attempt = &mut self.status().attempt;
        attempt.count += 1;
        attempt.last_error = Some(message);
        let count = attempt.count;
        if count >= cap {
            warn!(host = %self.host.name, attempts = count, "Rescue system unusable, falling back to Preparing");
            return self.demote();
        }
        debug!(host = %self.host.name, attempts = count, "Rescue system not usable yet");
        Ok(Next::Requeue(self.ctx.config.retryable_requeue()))
    }

    /// Hostname of the installed system.
    fn os_hostname(&self) -> &str {
        self.host
            .spec
            .install_image
            .as_ref()
            .and_then(|install| install.hostname.as_deref())
            .unwrap_or(self.host.name)
    }

    /// Name the Robot server after the installed system.
    async fn ensure_server_name(&self) -> Result<(), Error> {
        let name = self.os_hostname();
        let server = self.ctx.robot.get_server(self.server()).await?;
        if server.name != name {
            self.ctx.robot.set_server_name(server.number, name).await?;
            info!(host = %self.host.name, server = server.number, %name, "Named Robot server");
        }
        Ok(())
    }

    fn install_plan(&self) -> Result<partition::InstallPlan, Error> {
        let install = self.host.spec.install_image.as_ref().ok_or_else(|| {
            Error::permanent("MissingInstallImage", "spec.installImage is not set")
        })?;
        let hardware = self.tracker.status.hardware_details.as_ref().ok_or_else(|| {
            Error::permanent("MissingHardwareDetails", "hardware inventory was not collected")
        })?;
        partition::plan(
            self.host.name,
            install,
            self.host.spec.root_device_hints.as_ref(),
            hardware,
        )
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    async fn preparing(&mut self) -> Result<Next, Error> {
        match self.ensure_rescue().await? {
            RescueState::Waiting(poll) => Ok(Next::Requeue(poll)),
            RescueState::Ready(session) => {
                session.close().await;
                let now = self.now();
                self.status().conditions.mark_true(RESCUE_SYSTEM_READY, now);
                self.tracker.go(Phase::Registering)
            }
        }
    }

    async fn registering(&mut self) -> Result<Next, Error> {
        let mut session = match self.reach(Login::Rescue, RESCUE_SSH_PORT).await? {
            Reach::Rescue(session) => session,
            Reach::Booted { hostname } => {
                warn!(host = %self.host.name, %hostname, "Host left the rescue system");
                return self.demote();
            }
            Reach::Unreachable(message) => return self.capped_failure(message),
        };

        let collected =
            hardware::collect(session.as_mut(), self.ctx.config.command_timeout(), self.ctx.cancel)
                .await;
        session.close().await;
        let details = match collected {
            Ok(details) => details,
            Err(err @ (Error::Cancelled | Error::RateLimited { .. } | Error::Permanent { .. })) => {
                return Err(err);
            }
            Err(err) => return self.capped_failure(err.to_string()),
        };

        let now = self.now();
        let status = self.status();
        status.hardware_details = Some(details);
        status.conditions.mark_true(RESCUE_SYSTEM_READY, now);
        status.conditions.mark_true(HARDWARE_INSPECTED, now);
        self.tracker.go(Phase::Inspecting)
    }

    fn inspecting(&mut self) -> Result<Next, Error> {
        let plan = self.install_plan()?;
        debug!(host = %self.host.name, disk = %plan.disk.path(), "Install plan validated");
        self.tracker.go(Phase::ImageInstalling)
    }

    async fn reset_into_os(&mut self) -> Result<Next, Error> {
        self.ctx.robot.reset(self.server(), ResetType::Hardware).await?;
        self.status().rescue_reset_at = None;
        info!(host = %self.host.name, "Reset into installed OS");
        self.tracker.go(Phase::Provisioning)
    }

    async fn image_installing(&mut self) -> Result<Next, Error> {
        let plan = self.install_plan()?;

        let session = match self.reach(Login::Rescue, RESCUE_SSH_PORT).await? {
            Reach::Rescue(session) => session,
            Reach::Booted { hostname } => {
                if self.tracker.status.conditions.is_true(IMAGE_INSTALLED) {
                    info!(host = %self.host.name, %hostname, "Installed OS already booted");
                    return self.tracker.go(Phase::Provisioning);
                }
                warn!(host = %self.host.name, %hostname, "Host left the rescue system before install");
                return self.demote();
            }
            Reach::Unreachable(message) => {
                let boot_timeout = self.ctx.config.rescue_boot_timeout();
                let poll = self.ctx.config.rescue_boot_poll();
                let booting = self
                    .tracker
                    .status
                    .rescue_reset_at
                    .is_some_and(|started| elapsed(self.now(), started) < boot_timeout);
                if booting {
                    return Ok(Next::Requeue(poll));
                }
                let port = self.host.spec.ssh_port_after_install;
                if let Reach::Booted { hostname } = self.reach(Login::Os, port).await? {
                    info!(host = %self.host.name, %hostname, "Installed OS answers, skipping install");
                    return self.tracker.go(Phase::Provisioning);
                }
                // An earlier run of this step may have reset the host into its new OS.
                let now = self.now();
                let since = *self.status().unreachable_since.get_or_insert(now);
                if elapsed(now, since) < boot_timeout {
                    debug!(host = %self.host.name, error = %message, "Host unreachable, waiting for it to boot");
                    return Ok(Next::Requeue(poll));
                }
                return self.capped_failure(message);
            }
        };
        let status = self.status();
        status.rescue_reset_at = None;
        status.unreachable_since = None;

        if self.tracker.status.conditions.is_true(IMAGE_INSTALLED) {
            session.close().await;
            return self.reset_into_os().await;
        }

        let ctx = self.ctx;
        let install = self.host.spec.install_image.as_ref();
        let pipeline = InstallPipeline {
            plan: &plan,
            os_public_key: &ctx.os_key.credentials.public_key,
            pre_provision_command: ctx.config.pre_provision_command.as_deref(),
            post_install_script: install.and_then(|i| i.post_install_script.as_deref()),
            timeouts: ctx.config.install_timeouts(),
        };
        let rescue = self.remote_host(Login::Rescue, RESCUE_SSH_PORT)?;
        let result = pipeline.run(&rescue, Some(session), ctx.cancel).await;

        let now = self.now();
        match result {
            Ok(()) => {
                self.status().conditions.mark_true(IMAGE_INSTALLED, now);
                self.reset_into_os().await
            }
            Err(InstallError::Cancelled) => Err(Error::Cancelled),
            Err(err @ InstallError::StepFailed { .. }) => {
                warn!(host = %self.host.name, error = %err, "Install failed, falling back to Preparing");
                self.status().conditions.mark_false(
                    IMAGE_INSTALLED,
                    "InstallFailed",
                    Severity::Warning,
                    err.to_string(),
                    now,
                );
                self.demote()
            }
        }
    }

    async fn provisioning(&mut self) -> Result<Next, Error> {
        let port = self.host.spec.ssh_port_after_install;
        let message = match self.reach(Login::Os, port).await? {
            Reach::Booted { hostname } => {
                info!(host = %self.host.name, %hostname, "Installed OS reachable");
                self.ensure_server_name().await?;
                let now = self.now();
                let status = self.status();
                status.conditions.mark_true(HOST_REACHABLE, now);
                status.os_boot_timeouts = 0;
                return self.tracker.go(Phase::Provisioned);
            }
            Reach::Rescue(session) => {
                session.close().await;
                "host booted the rescue system instead of the installed OS".to_string()
            }
            Reach::Unreachable(message) => message,
        };

        let since = self.tracker.status.last_transition_time.unwrap_or(self.now());
        let timeout = self.ctx.config.provisioning_timeout();
        if elapsed(self.now(), since) < timeout {
            debug!(host = %self.host.name, error = %message, "Waiting for installed OS");
            return Ok(Next::Requeue(self.ctx.config.os_boot_poll()));
        }

        if self.tracker.status.os_boot_timeouts > 0 {
            return Err(Error::permanent(
                "ProvisioningTimeout",
                format!(
                    "installed OS not reachable on port {port} after {}s, twice: {message}",
                    timeout.as_secs()
                ),
            ));
        }

        warn!(host = %self.host.name, "Installed OS did not come up, reinstalling");
        if let RescueState::Ready(session) = self.ensure_rescue().await? {
            session.close().await;
        }
        let status = self.status();
        status.os_boot_timeouts += 1;
        status.conditions.remove(IMAGE_INSTALLED);
        self.tracker.go(Phase::ImageInstalling)
    }

    async fn provisioned(&mut self) -> Result<Next, Error> {
        let port = self.host.spec.ssh_port_after_cloud_init;
        let reached = self.reach(Login::Os, port).await?;
        let now = self.now();
        match reached {
            Reach::Booted { .. } => {
                self.status().conditions.mark_true(HOST_REACHABLE, now);
            }
            Reach::Rescue(session) => {
                session.close().await;
                self.status().conditions.mark_false(
                    HOST_REACHABLE,
                    "Unreachable",
                    Severity::Warning,
                    "host is running the rescue system",
                    now,
                );
            }
            Reach::Unreachable(message) => {
                debug!(host = %self.host.name, error = %message, "Provisioned host unreachable");
                self.status().conditions.mark_false(
                    HOST_REACHABLE,
                    "Unreachable",
                    Severity::Warning,
                    message,
                    now,
                );
            }
        }
        Ok(Next::Requeue(self.ctx.config.provisioned_check_interval()))
    }

    async fn wipe_disks(&mut self, mut session: Box<dyn RemoteSession>) -> Result<(), Error> {
        let timeout = self.ctx.config.command_timeout();
        let cancel = self.ctx.cancel;
        let disks: Vec<Disk> = match &self.tracker.status.hardware_details {
            Some(details) if !details.disks.is_empty() => details.disks.clone(),
            _ => {
                let output = session.run(hardware::LSBLK_SCRIPT, timeout, cancel).await?;
                hardware::parse_disks(&output.stdout)?
            }
        };

        let mut script = String::from("set -euo pipefail\n");
        for disk in &disks {
            script.push_str(&format!("wipefs -af {}\n", disk.path()));
        }
        let output = session.run(&script, timeout, cancel).await?;
        session.close().await;
        if !output.success() {
            return Err(Error::Retryable(format!(
                "wipefs exited with status {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        info!(host = %self.host.name, disks = disks.len(), "Wiped disk signatures");
        self.status().disks_wiped = true;
        Ok(())
    }

    async fn deprovisioning(&mut self) -> Result<Next, Error> {
        let server = self.server();

        if self.host.spec.wipe_disks_on_deprovision && !self.tracker.status.disks_wiped {
            match self.ensure_rescue().await? {
                RescueState::Waiting(poll) => return Ok(Next::Requeue(poll)),
                RescueState::Ready(session) => self.wipe_disks(session).await?,
            }
        }

        if !self.tracker.status.powered_off {
            let options = self.ctx.robot.reset_options(server).await?;
            if options.contains(&ResetType::PowerLong) {
                self.ctx.robot.reset(server, ResetType::PowerLong).await?;
                info!(host = %self.host.name, server, "Powered off");
                self.status().powered_off = true;
            } else {
                warn!(host = %self.host.name, server, "Server does not support power_long, leaving it running");
            }
        }

        if self.host.spec.consumer_ref.is_some() && !self.host.deleting {
            return Ok(Next::ReleaseClaim);
        }

        let status = self.status();
        status.conditions.retain_types(&[CREDENTIALS_AVAILABLE]);
        status.attempt = Attempt::default();
        status.rescue_reset_at = None;
        status.force_rescue_reset = false;
        status.os_boot_timeouts = 0;
        status.disks_wiped = false;
        status.error_reason = None;
        status.error_message = None;
        status.error_generation = None;

        let to = if self.host.deleting {
            Phase::Deleted
        } else {
            Phase::Unmanaged
        };
        self.tracker.go(to)
    }
}
