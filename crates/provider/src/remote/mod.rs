//! Remote command execution on hosts.
//!
//! A [`RemoteExecutor`] opens a [`RemoteSession`] to one host; the session
//! runs scripts with per-command timeouts and is closed when dropped, so it
//! never outlives the step that opened it. The client does not retry.

mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use ssh::Ssh2Executor;

use crate::error::RemoteError;

/// SSH key pair used to log in.
#[derive(Clone, PartialEq, Eq)]
pub struct SshCredentials {
    /// Login user.
    pub user: String,
    /// Public key in OpenSSH format.
    pub public_key: String,
    /// Private key in PEM/OpenSSH format.
    pub private_key: String,
    /// Passphrase of the private key, if any.
    pub passphrase: Option<String>,
}

impl SshCredentials {
    /// Credentials for `root`, which is what rescue systems and fresh
    /// installs accept.
    #[must_use]
    pub fn root(public_key: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            user: "root".to_string(),
            public_key: public_key.into(),
            private_key: private_key.into(),
            passphrase: None,
        }
    }
}

impl std::fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Network address of a host's SSH daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Hostname or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Target {
    /// Create a target.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Output of one remote script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit status of the script.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Whether the script exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed standard output.
    #[must_use]
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Opens sessions to hosts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Connect and authenticate within `timeout`.
    async fn connect(
        &self,
        target: &Target,
        credentials: &SshCredentials,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// An authenticated command channel to one host.
#[async_trait]
pub trait RemoteSession: Send {
    /// Pipe `script` into `bash -s` and wait for it within `timeout`.
    async fn run(
        &mut self,
        script: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RemoteError>;

    /// Disconnect gracefully.
    async fn close(self: Box<Self>);
}
