//! Install pipeline run inside the rescue system.
//!
//! Up to five sub-steps, each with its own timeout. A failed sub-step is
//! retried once in place, reconnecting first if the session was lost; a
//! second failure aborts the pipeline with [`InstallError::StepFailed`].
//! Every sub-step can be repeated safely, the operator supplied
//! pre-provision command included.

use std::fmt;
use std::time::Duration;

use hetzner_provider::remote::{RemoteExecutor, RemoteSession, SshCredentials, Target};
use hetzner_provider::RemoteError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::partition::InstallPlan;

/// Installer shipped with the rescue system.
pub const INSTALLIMAGE: &str = "/root/.oldroot/nfs/install/installimage";
/// Location of the unattended installer configuration.
pub const AUTOSETUP_PATH: &str = "/autosetup";
/// Mount point of the freshly installed system.
pub const TARGET_ROOT: &str = "/mnt/target";

const ATTEMPTS_PER_STEP: u32 = 2;
const STDERR_TAIL: usize = 512;

/// A host reachable over SSH with one credential set.
pub struct RemoteHost<'a> {
    pub executor: &'a dyn RemoteExecutor,
    pub target: Target,
    pub credentials: &'a SshCredentials,
    pub connect_timeout: Duration,
}

impl RemoteHost<'_> {
    /// Open a new session.
    ///
    /// # Errors
    /// Returns the executor's [`RemoteError`].
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        self.executor
            .connect(&self.target, self.credentials, self.connect_timeout, cancel)
            .await
    }
}

/// Install sub-steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    PreProvision,
    FetchImage,
    Partition,
    WriteImage,
    PostInstall,
}

impl InstallStep {
    pub const ALL: [InstallStep; 5] = [
        InstallStep::PreProvision,
        InstallStep::FetchImage,
        InstallStep::Partition,
        InstallStep::WriteImage,
        InstallStep::PostInstall,
    ];
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstallStep::PreProvision => "pre-provision",
            InstallStep::FetchImage => "fetch-image",
            InstallStep::Partition => "partition",
            InstallStep::WriteImage => "write-image",
            InstallStep::PostInstall => "post-install",
        })
    }
}

/// Per sub-step timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallTimeouts {
    pub pre_provision: Duration,
    pub fetch_image: Duration,
    pub partition: Duration,
    pub write_image: Duration,
    pub post_install: Duration,
}

impl InstallTimeouts {
    #[must_use]
    pub fn for_step(&self, step: InstallStep) -> Duration {
        match step {
            InstallStep::PreProvision => self.pre_provision,
            InstallStep::FetchImage => self.fetch_image,
            InstallStep::Partition => self.partition,
            InstallStep::WriteImage => self.write_image,
            InstallStep::PostInstall => self.post_install,
        }
    }

    /// Longest a full pipeline run can take: every sub-step used up twice,
    /// each attempt preceded by a reconnect.
    #[must_use]
    pub fn worst_case(&self, connect_timeout: Duration) -> Duration {
        InstallStep::ALL
            .iter()
            .map(|step| (self.for_step(*step) + connect_timeout) * ATTEMPTS_PER_STEP)
            .sum()
    }
}

/// Pipeline failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallError {
    #[error("install step {step} failed twice: {message}")]
    StepFailed { step: InstallStep, message: String },

    #[error("install cancelled")]
    Cancelled,
}

/// Quote a value for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Everything the pipeline writes to the host.
pub struct InstallPipeline<'a> {
    pub plan: &'a InstallPlan,
    /// Authorized in the installed OS.
    pub os_public_key: &'a str,
    /// Runs first, inside the rescue system. Skipped when unset.
    pub pre_provision_command: Option<&'a str>,
    pub post_install_script: Option<&'a str>,
    pub timeouts: InstallTimeouts,
}

impl InstallPipeline<'_> {
    /// Script for one sub-step.
    #[must_use]
    pub fn script(&self, step: InstallStep) -> String {
        match step {
            InstallStep::PreProvision => match self.pre_provision_command {
                Some(command) => format!("set -euo pipefail\n{}\n", command.trim()),
                None => String::new(),
            },
            InstallStep::FetchImage => self.fetch_image_script(),
            InstallStep::Partition => self.partition_script(),
            InstallStep::WriteImage => format!(
                "set -euo pipefail\nexport TERM=xterm\n{INSTALLIMAGE} -a -c {AUTOSETUP_PATH}\n"
            ),
            InstallStep::PostInstall => self.post_install_script(),
        }
    }

    fn fetch_image_script(&self) -> String {
        let image = shell_quote(&self.plan.image_path);
        match &self.plan.image_url {
            Some(url) => {
                let partial = shell_quote(&format!("{}.part", self.plan.image_path));
                format!(
                    "set -euo pipefail\nmkdir -p {dir}\nif [ ! -s {image} ]; then\n  \
                     curl -fsSL --retry 3 -o {partial} {url}\n  mv {partial} {image}\nfi\n",
                    dir = crate::partition::IMAGE_DIR,
                    url = shell_quote(url),
                )
            }
            None => format!("set -euo pipefail\ntest -s {image}\n"),
        }
    }

    fn partition_script(&self) -> String {
        format!(
            "set -euo pipefail\nprintf '%s' {autosetup} > {AUTOSETUP_PATH}\nwipefs -af {device}\n",
            autosetup = shell_quote(&self.plan.autosetup),
            device = self.plan.disk.path(),
        )
    }

    fn post_install_script(&self) -> String {
        let key = shell_quote(self.os_public_key.trim());
        let mut script = format!(
            "set -euo pipefail\nmkdir -p {TARGET_ROOT}\n\
             mountpoint -q {TARGET_ROOT} || mount {root} {TARGET_ROOT}\n\
             trap 'umount -R {TARGET_ROOT} || true' EXIT\n\
             for fs in dev proc sys; do mount --bind /$fs {TARGET_ROOT}/$fs; done\n\
             install -d -m 700 {TARGET_ROOT}/root/.ssh\n\
             touch {TARGET_ROOT}/root/.ssh/authorized_keys\n\
             grep -qxF {key} {TARGET_ROOT}/root/.ssh/authorized_keys || \
             printf '%s\\n' {key} >> {TARGET_ROOT}/root/.ssh/authorized_keys\n\
             chmod 600 {TARGET_ROOT}/root/.ssh/authorized_keys\n",
            root = self.plan.root_partition(),
        );
        if let Some(post) = self.post_install_script {
            script.push_str(&format!(
                "printf '%s\\n' {body} > {TARGET_ROOT}/root/post-install.sh\n\
                 chroot {TARGET_ROOT} /bin/bash /root/post-install.sh\n\
                 rm -f {TARGET_ROOT}/root/post-install.sh\n",
                body = shell_quote(post),
            ));
        }
        script
    }

    /// Run all sub-steps, reusing `session` when given.
    ///
    /// # Errors
    /// Returns [`InstallError::StepFailed`] when a sub-step fails twice and
    /// [`InstallError::Cancelled`] when `cancel` fires.
    pub async fn run(
        &self,
        host: &RemoteHost<'_>,
        mut session: Option<Box<dyn RemoteSession>>,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        for step in InstallStep::ALL {
            if step == InstallStep::PreProvision && self.pre_provision_command.is_none() {
                continue;
            }
            let script = self.script(step);
            let timeout = self.timeouts.for_step(step);
            let mut last_error = String::new();
            let mut succeeded = false;

            for attempt in 1..=ATTEMPTS_PER_STEP {
                if session.is_none() {
                    match host.connect(cancel).await {
                        Ok(reconnected) => session = Some(reconnected),
                        Err(RemoteError::Cancelled) => return Err(InstallError::Cancelled),
                        Err(e) => {
                            warn!(%step, attempt, error = %e, "Reconnect for install step failed");
                            last_error = e.to_string();
                            continue;
                        }
                    }
                }
                let Some(active) = session.as_mut() else {
                    continue;
                };

                match active.run(&script, timeout, cancel).await {
                    Ok(output) if output.success() => {
                        succeeded = true;
                        break;
                    }
                    Ok(output) => {
                        last_error = format!(
                            "exit status {}: {}",
                            output.exit_code,
                            tail(output.stderr.trim(), STDERR_TAIL)
                        );
                        warn!(%step, attempt, exit_code = output.exit_code, "Install step failed");
                    }
                    Err(RemoteError::Cancelled) => return Err(InstallError::Cancelled),
                    Err(e) => {
                        warn!(%step, attempt, error = %e, "Install step lost its session");
                        last_error = e.to_string();
                        session = None;
                    }
                }
            }

            if !succeeded {
                return Err(InstallError::StepFailed {
                    step,
                    message: last_error,
                });
            }
            info!(%step, target = %host.target, "Install step completed");
        }

        if let Some(session) = session {
            session.close().await;
        }
        Ok(())
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
