//! Remote execution over the system OpenSSH client.
//!
//! Each session spawns one `ssh` process. Its stdout and stderr are read line
//! by line and merged in arrival order into the channel the runner consumes.
//! Sessions force a remote terminal, so killing the local client hangs up the
//! remote command as well. Keepalives turn a silently dropped link into
//! ssh's own failure status. Host keys are not checked: test VMs are recreated
//! constantly and their keys change with every snapshot.

use std::ffi::OsString;
use std::net::IpAddr;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use nixtest_core::profile::shell_quote;
use nixtest_core::remote::{Credentials, RemoteExit, RemoteProcess, Session, Transport};
use nixtest_core::{Result, SupervisorError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::exec::exec;

/// Line buffer between the reader task and the consumer.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Exit status `ssh` uses for its own failures.
const SSH_ERROR_STATUS: i32 = 255;

/// Seconds between keepalive messages on an idle connection.
const SERVER_ALIVE_INTERVAL_SECS: u32 = 15;

/// Unanswered keepalives before the connection is declared dead.
const SERVER_ALIVE_COUNT_MAX: u32 = 3;

// =============================================================================
// Argument building
// =============================================================================

fn common_options(credentials: &Credentials) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", credentials.connect_timeout_secs),
        "-o".to_string(),
        format!("ServerAliveInterval={SERVER_ALIVE_INTERVAL_SECS}"),
        "-o".to_string(),
        format!("ServerAliveCountMax={SERVER_ALIVE_COUNT_MAX}"),
    ];
    if let Some(identity) = &credentials.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args
}

fn ssh_args(addr: IpAddr, credentials: &Credentials, command: &str) -> Vec<String> {
    let mut args = common_options(credentials);
    args.push("-p".to_string());
    args.push(credentials.port.to_string());
    args.push(format!("{}@{}", credentials.user, addr));
    args.push("--".to_string());
    args.push(command.to_string());
    args
}

/// Arguments for an interactive session. The terminal is forced even though
/// stdin is not one, which also merges remote stderr into stdout.
fn session_args(addr: IpAddr, credentials: &Credentials, command: &str) -> Vec<String> {
    let mut args = vec!["-tt".to_string()];
    args.extend(ssh_args(addr, credentials, command));
    args
}

fn scp_args(addr: IpAddr, credentials: &Credentials, local: &Path, remote: &str) -> Vec<String> {
    let host = match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    let mut args = vec!["-q".to_string()];
    args.extend(common_options(credentials));
    args.push("-P".to_string());
    args.push(credentials.port.to_string());
    args.push(local.display().to_string());
    args.push(format!("{}@{}:{}", credentials.user, host, remote));
    args
}

fn untar_command(remote: &str) -> String {
    let dir = shell_quote(remote);
    format!("mkdir -p {dir} && tar -C {dir} -xf -")
}

fn exit_from_status(code: Option<i32>) -> RemoteExit {
    match code {
        Some(SSH_ERROR_STATUS) => {
            RemoteExit::ConnectionLost(format!("ssh exited with status {SSH_ERROR_STATUS}"))
        }
        Some(code) => RemoteExit::Exited(code),
        None => RemoteExit::ConnectionLost("ssh terminated by signal".to_string()),
    }
}

// =============================================================================
// Transport
// =============================================================================

/// [`Transport`] backed by the `ssh` and `scp` binaries.
pub struct SshTransport {
    ssh: OsString,
    scp: OsString,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SshTransport {
    /// Creates a transport using `ssh` and `scp` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ssh: OsString::from("ssh"),
            scp: OsString::from("scp"),
        }
    }

    /// Overrides the `ssh` binary.
    #[must_use]
    pub fn with_ssh_program(mut self, program: impl Into<OsString>) -> Self {
        self.ssh = program.into();
        self
    }

    async fn upload_tree(
        &self,
        addr: IpAddr,
        credentials: &Credentials,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        let mut tar = Command::new("tar")
            .arg("-C")
            .arg(local)
            .args(["-cf", "-", "."])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Transport(format!("failed to run tar: {e}")))?;

        let mut ssh = Command::new(&self.ssh)
            .args(ssh_args(addr, credentials, &untar_command(remote)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Transport(format!("failed to run ssh: {e}")))?;

        let (Some(mut archive), Some(mut sink)) = (tar.stdout.take(), ssh.stdin.take()) else {
            return Err(SupervisorError::Transport(
                "upload pipes were not captured".to_string(),
            ));
        };
        let copied = tokio::io::copy(&mut archive, &mut sink).await;
        drop(sink);
        drop(archive);

        let tar_output = tar.wait_with_output().await?;
        let ssh_output = ssh.wait_with_output().await?;

        if !tar_output.status.success() {
            return Err(SupervisorError::Transport(format!(
                "tar of {} failed: {}",
                local.display(),
                String::from_utf8_lossy(&tar_output.stderr).trim()
            )));
        }
        if !ssh_output.status.success() {
            return Err(SupervisorError::Transport(format!(
                "unpacking into {remote} failed: {}",
                String::from_utf8_lossy(&ssh_output.stderr).trim()
            )));
        }
        let bytes = copied?;
        tracing::debug!("Uploaded {} ({} bytes) to {}:{}", local.display(), bytes, addr, remote);
        Ok(())
    }

    async fn upload_file(
        &self,
        addr: IpAddr,
        credentials: &Credentials,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        let result = exec(&self.scp, &scp_args(addr, credentials, local, remote))
            .await
            .map_err(|e| SupervisorError::Transport(format!("failed to run scp: {e}")))?;
        if !result.success() {
            return Err(SupervisorError::Transport(format!(
                "scp of {} failed: {}",
                local.display(),
                result.message()
            )));
        }
        tracing::debug!("Uploaded {} to {}:{}", local.display(), addr, remote);
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_session(
        &self,
        addr: IpAddr,
        credentials: &Credentials,
    ) -> Result<Box<dyn Session>> {
        Ok(Box::new(SshSession {
            program: self.ssh.clone(),
            addr,
            credentials: credentials.clone(),
            running: None,
        }))
    }

    async fn upload(
        &self,
        addr: IpAddr,
        credentials: &Credentials,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        if local.is_dir() {
            self.upload_tree(addr, credentials, local, remote).await
        } else {
            self.upload_file(addr, credentials, local, remote).await
        }
    }
}

// =============================================================================
// Session
// =============================================================================

struct Running {
    kill: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One `ssh` invocation.
struct SshSession {
    program: OsString,
    addr: IpAddr,
    credentials: Credentials,
    running: Option<Running>,
}

#[async_trait]
impl Session for SshSession {
    async fn run(&mut self, command: &str) -> Result<RemoteProcess> {
        if self.running.is_some() {
            return Err(SupervisorError::Transport(
                "session is already running a command".to_string(),
            ));
        }

        let mut child = Command::new(&self.program)
            .args(session_args(self.addr, &self.credentials, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Transport(format!("failed to run ssh: {e}")))?;

        let (line_tx, lines) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let (exit_tx, exit) = oneshot::channel();
        let (kill, kill_rx) = oneshot::channel();

        let task = tokio::spawn(pump(child_output(&mut child)?, child, line_tx, exit_tx, kill_rx));
        self.running = Some(Running { kill, task });

        Ok(RemoteProcess { lines, exit })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(running) = self.running.take() {
            let _ = running.kill.send(());
            if let Err(e) = running.task.await {
                tracing::warn!("ssh reader task failed: {}", e);
            }
        }
        Ok(())
    }
}

type OutputLines = std::pin::Pin<Box<dyn tokio_stream::Stream<Item = std::io::Result<String>> + Send>>;

fn child_output(child: &mut Child) -> Result<OutputLines> {
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(SupervisorError::Transport(
            "ssh output pipes were not captured".to_string(),
        ));
    };
    let stdout = LinesStream::new(BufReader::new(stdout).lines());
    let stderr = LinesStream::new(BufReader::new(stderr).lines());
    Ok(Box::pin(stdout.merge(stderr)))
}

/// Forwards output lines until EOF, then reports the exit status.
///
/// A kill request, or the session being dropped, terminates `ssh` and leaves
/// the exit status unreported.
async fn pump(
    mut output: OutputLines,
    mut child: Child,
    lines: mpsc::Sender<String>,
    exit: oneshot::Sender<RemoteExit>,
    mut kill: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut kill => {
                let _ = child.kill().await;
                return;
            }
            next = output.next() => match next {
                Some(Ok(mut line)) => {
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    // Keep draining after the consumer goes away so ssh never blocks.
                    let _ = lines.send(line).await;
                }
                Some(Err(e)) => {
                    tracing::warn!("Reading ssh output failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    drop(lines);

    tokio::select! {
        _ = &mut kill => {
            let _ = child.kill().await;
        }
        status = child.wait() => {
            let status = match status {
                Ok(status) => exit_from_status(status.code()),
                Err(e) => RemoteExit::ConnectionLost(e.to_string()),
            };
            let _ = exit.send(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 122, 42))
    }

    #[test]
    fn test_ssh_args() {
        let credentials = Credentials {
            identity_file: Some(PathBuf::from("/keys/nixtest")),
            ..Credentials::default()
        };
        let args = ssh_args(addr(), &credentials, "echo hi");

        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"ServerAliveInterval=15".to_string()));
        assert!(args.contains(&"ServerAliveCountMax=3".to_string()));
        assert!(!args.contains(&"-tt".to_string()));
        let tail: Vec<_> = args[args.len() - 5..].iter().map(String::as_str).collect();
        assert_eq!(tail, vec!["-p", "22", "nixos@192.168.122.42", "--", "echo hi"]);
        let key = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[key + 1], "/keys/nixtest");
    }

    #[test]
    fn test_session_args_force_a_terminal() {
        let args = session_args(addr(), &Credentials::default(), "sudo install.sh");

        assert_eq!(args[0], "-tt");
        assert!(args.contains(&"ServerAliveInterval=15".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("sudo install.sh"));
    }

    #[test]
    fn test_scp_args_bracket_ipv6() {
        let credentials = Credentials::default().with_user("testuser");
        let v6: IpAddr = "fe80::1".parse().unwrap();
        let args = scp_args(v6, &credentials, Path::new("/tmp/a.nix"), "/tmp/nixos-config/a.nix");

        assert_eq!(args[0], "-q");
        assert!(args.contains(&"-P".to_string()));
        assert_eq!(args[args.len() - 2], "/tmp/a.nix");
        assert_eq!(args[args.len() - 1], "testuser@[fe80::1]:/tmp/nixos-config/a.nix");
    }

    #[test]
    fn test_untar_command_quotes_path() {
        assert_eq!(
            untar_command("/tmp/nixos-config"),
            "mkdir -p /tmp/nixos-config && tar -C /tmp/nixos-config -xf -"
        );
        assert_eq!(
            untar_command("/tmp/my config"),
            "mkdir -p '/tmp/my config' && tar -C '/tmp/my config' -xf -"
        );
    }

    #[test]
    fn test_exit_from_status() {
        assert_eq!(exit_from_status(Some(0)), RemoteExit::Exited(0));
        assert_eq!(exit_from_status(Some(1)), RemoteExit::Exited(1));
        assert!(matches!(exit_from_status(Some(255)), RemoteExit::ConnectionLost(_)));
        assert!(matches!(exit_from_status(None), RemoteExit::ConnectionLost(_)));
    }

    /// Stand-in for `ssh` that ignores its options and treats the remote
    /// command as an exit status, or hangs when asked to.
    const FAKE_SSH: &str = r#"#!/bin/sh
for last; do :; done
if [ "$last" = hang ]; then exec sleep 30; fi
printf '::PHASE::disk_setup\r\n'
echo "warning: slow mirror" >&2
exit "$last"
"#;

    async fn collect(process: RemoteProcess) -> (Vec<String>, Option<RemoteExit>) {
        let RemoteProcess { mut lines, exit } = process;
        let mut seen = Vec::new();
        while let Some(line) = lines.recv().await {
            seen.push(line);
        }
        seen.sort();
        (seen, exit.await.ok())
    }

    #[tokio::test]
    async fn test_session_against_fake_ssh() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let program = dir.path().join("ssh");
        std::fs::write(&program, FAKE_SSH).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let transport = SshTransport::new().with_ssh_program(&program);
        let credentials = Credentials::default();

        // Output from both pipes with terminal line endings removed, then
        // the exit status.
        let mut session = transport.open_session(addr(), &credentials).await.unwrap();
        let (lines, exit) = collect(session.run("3").await.unwrap()).await;
        assert_eq!(lines, vec!["::PHASE::disk_setup", "warning: slow mirror"]);
        assert_eq!(exit, Some(RemoteExit::Exited(3)));
        assert!(session.run("0").await.is_err());
        session.close().await.unwrap();

        // ssh's own failure status means the connection is gone.
        let mut session = transport.open_session(addr(), &credentials).await.unwrap();
        let (_, exit) = collect(session.run("255").await.unwrap()).await;
        assert!(matches!(exit, Some(RemoteExit::ConnectionLost(_))));
        session.close().await.unwrap();

        // Closing kills a command that never ends.
        let mut session = transport.open_session(addr(), &credentials).await.unwrap();
        let process = session.run("hang").await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), session.close())
            .await
            .expect("close should kill the hung command")
            .unwrap();
        let (lines, exit) = collect(process).await;
        assert!(lines.is_empty());
        assert_eq!(exit, None);
    }
}
