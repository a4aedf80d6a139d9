//! Remote command execution with streamed output.
//!
//! A [`Transport`] opens [`Session`]s to a VM; a session runs one command and
//! hands back its interleaved output as a line channel plus a one-shot exit
//! status. [`RemoteExecutor`] wraps that into a [`RemoteStream`] the runner can
//! consume line by line, abandon early, or drain to completion.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, SupervisorError};
use crate::vm::VmHandle;

/// Default time allowed for a session to close.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Default upper bound on a command run to completion.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Login details for a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Private key, if not using the agent.
    pub identity_file: Option<PathBuf>,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: "nixos".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
        }
    }
}

impl Credentials {
    /// Returns a copy for a different user.
    #[must_use]
    pub fn with_user(&self, user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..self.clone()
        }
    }
}

/// How a remote command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteExit {
    /// The command exited with this status.
    Exited(i32),
    /// The session dropped before an exit status was seen.
    ConnectionLost(String),
}

/// A running remote command.
pub struct RemoteProcess {
    /// Output lines, stdout and stderr interleaved in arrival order.
    pub lines: mpsc::Receiver<String>,
    /// Resolves once the command ends.
    pub exit: oneshot::Receiver<RemoteExit>,
}

/// A connection that can run a command.
#[async_trait]
pub trait Session: Send {
    /// Starts `command` and returns its output channel.
    async fn run(&mut self, command: &str) -> Result<RemoteProcess>;

    /// Terminates the command if still running and releases the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions and copies files to a VM.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a session to `addr`.
    async fn open_session(
        &self,
        addr: IpAddr,
        credentials: &Credentials,
    ) -> Result<Box<dyn Session>>;

    /// Copies a file or directory tree from `local` to `remote`.
    ///
    /// Directories are copied by content: `remote` ends up mirroring `local`.
    async fn upload(
        &self,
        addr: IpAddr,
        credentials: &Credentials,
        local: &Path,
        remote: &str,
    ) -> Result<()>;
}

/// Collected output of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status.
    pub exit_code: i32,
    /// Every output line.
    pub lines: Vec<String>,
}

impl CommandOutput {
    /// Returns true if the command exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the first non-empty output line, trimmed.
    #[must_use]
    pub fn first_line(&self) -> Option<&str> {
        self.lines.iter().map(|l| l.trim()).find(|l| !l.is_empty())
    }
}

/// Runs commands inside a VM.
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    close_grace: Duration,
    command_timeout: Duration,
}

impl RemoteExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials,
            close_grace: DEFAULT_CLOSE_GRACE,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Sets the time allowed for sessions to close.
    #[must_use]
    pub const fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Sets the upper bound on commands run through [`run`](Self::run).
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Returns the default credentials.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Starts `command` with the default credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the VM has no address or the session cannot start.
    pub async fn execute(&self, vm: &VmHandle, command: &str) -> Result<RemoteStream> {
        self.execute_as(vm, &self.credentials, command).await
    }

    /// Starts `command` with explicit credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the VM has no address or the session cannot start.
    pub async fn execute_as(
        &self,
        vm: &VmHandle,
        credentials: &Credentials,
        command: &str,
    ) -> Result<RemoteStream> {
        let addr = vm.address()?;
        tracing::debug!(vm = %vm.id, %addr, user = %credentials.user, "Running: {}", command);

        let mut session = self.transport.open_session(addr, credentials).await?;
        let process = match session.run(command).await {
            Ok(process) => process,
            Err(e) => {
                let _ = session.close().await;
                return Err(e);
            }
        };

        Ok(RemoteStream {
            lines: process.lines,
            exit: process.exit,
            session,
            close_grace: self.close_grace,
            closed: false,
        })
    }

    /// Runs `command` to completion with the default credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot start or drops mid-command.
    pub async fn run(&self, vm: &VmHandle, command: &str) -> Result<CommandOutput> {
        self.run_as(vm, &self.credentials, command).await
    }

    /// Runs `command` to completion with explicit credentials.
    ///
    /// The session is closed once the command ends or the command timeout
    /// elapses, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot start, drops mid-command or the
    /// command outlives the command timeout.
    pub async fn run_as(
        &self,
        vm: &VmHandle,
        credentials: &Credentials,
        command: &str,
    ) -> Result<CommandOutput> {
        let mut stream = self.execute_as(vm, credentials, command).await?;
        let collected = tokio::time::timeout(self.command_timeout, async {
            let mut lines = Vec::new();
            while let Some(line) = stream.next_line().await {
                lines.push(line);
            }
            let exit_code = stream.exit_status().await?;
            Ok::<_, SupervisorError>(CommandOutput { exit_code, lines })
        })
        .await;
        stream.abandon().await;

        collected.unwrap_or_else(|_| {
            tracing::warn!(
                vm = %vm.id,
                timeout = ?self.command_timeout,
                "Remote command timed out: {}",
                command
            );
            Err(SupervisorError::Transport(format!(
                "`{command}` did not finish within {:?}",
                self.command_timeout
            )))
        })
    }

    /// Copies a local file or tree into the VM.
    ///
    /// # Errors
    ///
    /// Returns an error if the VM has no address or the copy fails.
    pub async fn upload(&self, vm: &VmHandle, local: &Path, remote: &str) -> Result<()> {
        let addr = vm.address()?;
        tracing::debug!(vm = %vm.id, local = %local.display(), remote, "Uploading");
        self.transport
            .upload(addr, &self.credentials, local, remote)
            .await
    }
}

/// Output of a running remote command.
///
/// Lines arrive in order with no gaps. Dropping the stream without calling
/// [`finish`](Self::finish) or [`abandon`](Self::abandon) leaves closing to
/// the session's own drop behaviour.
pub struct RemoteStream {
    lines: mpsc::Receiver<String>,
    exit: oneshot::Receiver<RemoteExit>,
    session: Box<dyn Session>,
    close_grace: Duration,
    closed: bool,
}

impl RemoteStream {
    /// Returns the next output line, or `None` once the output has ended.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Waits for the command to end and returns its exit status.
    ///
    /// Unread lines are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::ConnectionLost`] if the session dropped
    /// before reporting a status.
    pub async fn finish(mut self) -> Result<i32> {
        while self.lines.recv().await.is_some() {}
        let status = self.exit_status().await;
        self.close().await;
        status
    }

    /// Waits for the exit status without closing the session.
    ///
    /// Cancel safe, so it can be raced against a deadline. Call it at most
    /// once to completion.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::ConnectionLost`] if the session dropped
    /// before reporting a status.
    pub async fn exit_status(&mut self) -> Result<i32> {
        match (&mut self.exit).await {
            Ok(RemoteExit::Exited(code)) => Ok(code),
            Ok(RemoteExit::ConnectionLost(reason)) => Err(SupervisorError::ConnectionLost(reason)),
            Err(_) => Err(SupervisorError::ConnectionLost(
                "session ended without an exit status".to_string(),
            )),
        }
    }

    /// Stops consuming and closes the session within the grace period.
    pub async fn abandon(mut self) {
        self.close().await;
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.lines.close();

        match tokio::time::timeout(self.close_grace, self.session.close()).await {
            Ok(Ok(())) => tracing::trace!("Remote session closed"),
            Ok(Err(e)) => tracing::warn!("Closing remote session failed: {}", e),
            Err(_) => tracing::warn!(
                grace = ?self.close_grace,
                "Remote session did not close within grace period"
            ),
        }
    }
}
