//! `ssh2` backed remote execution.
//!
//! libssh2 is blocking, so every call runs on the blocking pool. A clone of
//! the TCP stream stays on the async side; cancellation or a missed deadline
//! shuts it down, which makes the blocking call return promptly.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CommandOutput, RemoteExecutor, RemoteSession, SshCredentials, Target};
use crate::error::RemoteError;

/// Extra time libssh2 gets on top of the caller's deadline, so the outer
/// deadline always fires first.
const BLOCKING_GRACE: Duration = Duration::from_secs(1);
/// Pause between reads while neither stream has data.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Async-side handle on the TCP stream used by a blocking session.
#[derive(Clone, Default)]
struct StreamHandle(Arc<Mutex<Option<TcpStream>>>);

impl StreamHandle {
    fn lock(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, stream: &TcpStream) {
        match stream.try_clone() {
            Ok(clone) => *self.lock() = Some(clone),
            Err(e) => warn!(error = %e, "Failed to clone SSH stream, cancellation will be slow"),
        }
    }

    fn shutdown(&self) {
        if let Some(stream) = self.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Run blocking `work`, abandoning it on deadline or cancellation.
async fn supervise<T, F>(
    stream: &StreamHandle,
    timeout: Duration,
    cancel: &CancellationToken,
    work: F,
) -> Result<T, RemoteError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RemoteError> + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(RemoteError::Cancelled);
    }

    let handle = tokio::task::spawn_blocking(work);
    tokio::select! {
        joined = handle => {
            joined.map_err(|e| RemoteError::Io(format!("remote worker failed: {e}")))?
        }
        () = tokio::time::sleep(timeout) => {
            stream.shutdown();
            Err(RemoteError::Timeout(timeout))
        }
        () = cancel.cancelled() => {
            stream.shutdown();
            Err(RemoteError::Cancelled)
        }
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from((duration + BLOCKING_GRACE).as_millis()).unwrap_or(u32::MAX)
}

fn io_error(err: impl Into<io::Error>, timeout: Duration) -> RemoteError {
    let err = err.into();
    if err.kind() == io::ErrorKind::TimedOut {
        RemoteError::Timeout(timeout)
    } else {
        RemoteError::Io(err.to_string())
    }
}

fn open_session(
    target: &Target,
    credentials: &SshCredentials,
    timeout: Duration,
    stream: &StreamHandle,
) -> Result<Session, RemoteError> {
    let connect_error = |message: String| RemoteError::Connect {
        target: target.to_string(),
        message,
    };

    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| connect_error(e.to_string()))?
        .next()
        .ok_or_else(|| connect_error("address did not resolve".to_string()))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut {
            RemoteError::Timeout(timeout)
        } else {
            connect_error(e.to_string())
        }
    })?;
    stream.set(&tcp);

    let mut session = Session::new().map_err(|e| connect_error(e.to_string()))?;
    session.set_timeout(millis(timeout));
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| connect_error(e.to_string()))?;

    let public_key = Some(credentials.public_key.as_str()).filter(|k| !k.trim().is_empty());
    session
        .userauth_pubkey_memory(
            &credentials.user,
            public_key,
            &credentials.private_key,
            credentials.passphrase.as_deref(),
        )
        .map_err(|e| RemoteError::Auth {
            user: credentials.user.clone(),
            message: e.to_string(),
        })?;
    if !session.authenticated() {
        return Err(RemoteError::Auth {
            user: credentials.user.clone(),
            message: "server rejected the key".to_string(),
        });
    }

    Ok(session)
}

fn exec(session: &Session, script: &str, timeout: Duration) -> Result<CommandOutput, RemoteError> {
    let mut channel = session
        .channel_session()
        .map_err(|e| io_error(e, timeout))?;
    channel.exec("bash -s").map_err(|e| io_error(e, timeout))?;
    channel
        .write_all(script.as_bytes())
        .map_err(|e| io_error(e, timeout))?;
    channel.send_eof().map_err(|e| io_error(e, timeout))?;

    let mut out = channel.stream(0);
    let mut err = channel.stderr();
    session.set_blocking(false);
    let drained = drain_both(&mut out, &mut err);
    session.set_blocking(true);
    let (stdout, stderr) = drained.map_err(|e| io_error(e, timeout))?;

    channel.wait_close().map_err(|e| io_error(e, timeout))?;
    let exit_code = channel.exit_status().map_err(|e| io_error(e, timeout))?;

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Read both streams to their end, alternating between them so a remote
/// blocked on a full stderr window cannot stall the stdout read.
/// `WouldBlock` from a reader means no data yet.
fn drain_both(stdout: &mut impl Read, stderr: &mut impl Read) -> io::Result<(String, String)> {
    let mut buf = [0u8; 16 * 1024];
    let (mut out, mut err) = (Vec::new(), Vec::new());
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        let read_out = pump(stdout, &mut out, &mut out_done, &mut buf)?;
        let read_err = pump(stderr, &mut err, &mut err_done, &mut buf)?;
        if !read_out && !read_err {
            std::thread::sleep(DRAIN_POLL);
        }
    }

    Ok((
        String::from_utf8_lossy(&out).into_owned(),
        String::from_utf8_lossy(&err).into_owned(),
    ))
}

/// One read into `sink`; `Ok(false)` when the reader had nothing to give.
fn pump(
    reader: &mut impl Read,
    sink: &mut Vec<u8>,
    done: &mut bool,
    buf: &mut [u8],
) -> io::Result<bool> {
    if *done {
        return Ok(false);
    }
    match reader.read(buf) {
        Ok(0) => {
            *done = true;
            Ok(true)
        }
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Remote executor over libssh2.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ssh2Executor;

#[async_trait]
impl RemoteExecutor for Ssh2Executor {
    async fn connect(
        &self,
        target: &Target,
        credentials: &SshCredentials,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let stream = StreamHandle::default();
        let work = {
            let target = target.clone();
            let credentials = credentials.clone();
            let stream = stream.clone();
            move || open_session(&target, &credentials, timeout, &stream)
        };

        let session = supervise(&stream, timeout, cancel, work).await?;
        debug!(target = %target, user = %credentials.user, "SSH session established");

        Ok(Box::new(Ssh2Session {
            target: target.clone(),
            session: Some(session),
            stream,
        }))
    }
}

/// Session opened by [`Ssh2Executor`].
struct Ssh2Session {
    target: Target,
    /// `None` once the session was lost to a timeout or transport error.
    session: Option<Session>,
    stream: StreamHandle,
}

#[async_trait]
impl RemoteSession for Ssh2Session {
    async fn run(
        &mut self,
        script: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RemoteError> {
        let session = self
            .session
            .take()
            .ok_or_else(|| RemoteError::Io(format!("session to {} is closed", self.target)))?;
        let script = script.to_string();

        let (session, output) = supervise(&self.stream, timeout, cancel, move || {
            session.set_timeout(millis(timeout));
            let output = exec(&session, &script, timeout);
            Ok((session, output))
        })
        .await?;

        let output = output?;
        self.session = Some(session);
        debug!(target = %self.target, exit_code = output.exit_code, "Remote script finished");
        Ok(output)
    }

    async fn close(mut self: Box<Self>) {
        if let Some(session) = self.session.take() {
            let _ = tokio::task::spawn_blocking(move || {
                session.disconnect(None, "session closed", None)
            })
            .await;
        }
        self.stream.shutdown();
    }
}

impl Drop for Ssh2Session {
    fn drop(&mut self) {
        self.stream.shutdown();
    }
}
