//! In-memory hypervisor and transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

use nixtest_core::error::{Result, SupervisorError};
use nixtest_core::profile::{CheckKind, PostInstallCheck, ProfileSpec};
use nixtest_core::remote::{Credentials, RemoteExit, RemoteProcess, Session, Transport};
use nixtest_core::vm::{Hypervisor, VmHandle, VmLifecycleConfig, VmLifecycleManager, VmState};
use nixtest_core::{
    EventBus, ExecutionMode, HealingEngine, Orchestrator, OrchestratorConfig, ProfileRunner,
    RemoteExecutor, RunnerConfig,
};

// ---------------------------------------------------------------------------
// Hypervisor
// ---------------------------------------------------------------------------

/// Hypervisor that keeps VMs in memory and records every call.
pub struct FakeHypervisor {
    calls: Mutex<Vec<String>>,
    snapshots: Mutex<HashSet<String>>,
    fail_create: bool,
    fail_revert: bool,
    unreachable: bool,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            snapshots: Mutex::new(HashSet::new()),
            fail_create: false,
            fail_revert: false,
            unreachable: false,
        }
    }

    /// A hypervisor whose VM creation always fails.
    pub fn unavailable() -> Self {
        Self {
            fail_create: true,
            ..Self::new()
        }
    }

    /// A hypervisor that cannot roll VMs back.
    pub fn broken_revert() -> Self {
        Self {
            fail_revert: true,
            ..Self::new()
        }
    }

    /// A hypervisor whose VMs boot but never answer on the network.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn create_or_reuse(&self, name: &str) -> Result<VmHandle> {
        self.log(format!("create:{name}"));
        if self.fail_create {
            return Err(SupervisorError::Hypervisor(
                "failed to connect to the hypervisor".to_string(),
            ));
        }
        Ok(VmHandle::new(name))
    }

    async fn find_snapshot(&self, vm: &VmHandle, name: &str) -> Result<Option<String>> {
        let key = format!("{}/{name}", vm.id);
        Ok(self.snapshots.lock().unwrap().contains(&key).then(|| name.to_string()))
    }

    async fn create_snapshot(&self, vm: &VmHandle, name: &str) -> Result<String> {
        self.log(format!("snapshot:{}", vm.id));
        self.snapshots.lock().unwrap().insert(format!("{}/{name}", vm.id));
        Ok(name.to_string())
    }

    async fn revert(&self, vm: &VmHandle, _snapshot: &str) -> Result<()> {
        self.log(format!("revert:{}", vm.id));
        if self.fail_revert {
            return Err(SupervisorError::Hypervisor(
                "snapshot revert: internal error".to_string(),
            ));
        }
        Ok(())
    }

    async fn start(&self, vm: &VmHandle) -> Result<()> {
        self.log(format!("start:{}", vm.id));
        Ok(())
    }

    async fn lookup_address(&self, _vm: &VmHandle) -> Result<Option<IpAddr>> {
        Ok(Some(IpAddr::V4(Ipv4Addr::new(192, 168, 122, 42))))
    }

    async fn is_reachable(&self, _addr: SocketAddr) -> bool {
        !self.unreachable
    }

    async fn stop(&self, vm: &VmHandle) -> Result<()> {
        self.log(format!("stop:{}", vm.id));
        Ok(())
    }

    async fn destroy(&self, vm: &VmHandle) -> Result<()> {
        self.log(format!("destroy:{}", vm.id));
        Ok(())
    }

    async fn state(&self, _name: &str) -> Result<Option<VmState>> {
        Ok(Some(VmState::Stopped))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// What an install command does when run.
#[derive(Debug, Clone)]
pub enum Script {
    /// Prints `lines`, then exits with `exit`, or drops the connection if `None`.
    Run { lines: Vec<String>, exit: Option<i32> },
    /// Prints `lines`, then never finishes.
    Hang { lines: Vec<String> },
    /// Prints `lines` and closes its output, but never reports an exit status.
    Stall { lines: Vec<String> },
}

impl Script {
    pub fn success() -> Self {
        Self::run(
            &[
                "::PHASE::disk_setup",
                "::SUCCESS::partitioning_complete",
                "::PHASE::installing_system",
                "::PROGRESS::copying::75",
                "::SUCCESS::installation_complete",
            ],
            0,
        )
    }

    pub fn error(detail: &str) -> Self {
        Self::Run {
            lines: vec![
                "::PHASE::disk_setup".to_string(),
                format!("::ERROR::{detail}"),
                "this line is never read".to_string(),
            ],
            exit: Some(1),
        }
    }

    pub fn run(lines: &[&str], exit: i32) -> Self {
        Self::Run {
            lines: lines.iter().map(ToString::to_string).collect(),
            exit: Some(exit),
        }
    }

    pub fn dropped(lines: &[&str]) -> Self {
        Self::Run {
            lines: lines.iter().map(ToString::to_string).collect(),
            exit: None,
        }
    }

    pub fn hang(lines: &[&str]) -> Self {
        Self::Hang {
            lines: lines.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn stall(lines: &[&str]) -> Self {
        Self::Stall {
            lines: lines.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Default)]
struct TransportState {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    responses: Mutex<Vec<(String, Script)>>,
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    fail_uploads: AtomicBool,
}

/// Transport that plays queued install scripts per profile and answers other
/// commands from canned responses, exiting zero by default.
#[derive(Default)]
pub struct ScriptedTransport {
    state: Arc<TransportState>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a script for the next install of `profile`.
    pub fn script(&self, profile: &str, script: Script) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .entry(profile.to_string())
            .or_default()
            .push_back(script);
    }

    /// Answers commands containing `needle`.
    pub fn respond(&self, needle: &str, exit: i32, lines: &[&str]) {
        self.answer(needle, Script::run(lines, exit));
    }

    /// Plays `script` for commands containing `needle`.
    pub fn answer(&self, needle: &str, script: Script) {
        self.state
            .responses
            .lock()
            .unwrap()
            .push((needle.to_string(), script));
    }

    /// Makes every upload fail from now on.
    pub fn fail_uploads(&self) {
        self.state.fail_uploads.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn installs(&self, profile: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| install_profile(c).as_deref() == Some(profile))
            .count()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.state.uploads.lock().unwrap().clone()
    }
}

fn install_profile(command: &str) -> Option<String> {
    let rest = command.split("INSTALL_PROFILE=").nth(1)?;
    rest.split_whitespace().next().map(ToString::to_string)
}

struct ScriptedSession {
    state: Arc<TransportState>,
    held_lines: Option<mpsc::Sender<String>>,
    held_exit: Option<oneshot::Sender<RemoteExit>>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn run(&mut self, command: &str) -> Result<RemoteProcess> {
        self.state.commands.lock().unwrap().push(command.to_string());

        let script = match install_profile(command) {
            Some(profile) => self
                .state
                .scripts
                .lock()
                .unwrap()
                .get_mut(&profile)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(Script::success),
            None => {
                let responses = self.state.responses.lock().unwrap();
                responses
                    .iter()
                    .find(|(needle, _)| command.contains(needle.as_str()))
                    .map_or_else(|| Script::run(&[], 0), |(_, script)| script.clone())
            }
        };

        let (lines_tx, lines) = mpsc::channel(64);
        let (exit_tx, exit) = oneshot::channel();

        match script {
            Script::Run { lines: output, exit } => {
                for line in output {
                    lines_tx.send(line).await.unwrap();
                }
                if let Some(code) = exit {
                    exit_tx.send(RemoteExit::Exited(code)).unwrap();
                }
            }
            Script::Hang { lines: output } => {
                for line in output {
                    lines_tx.send(line).await.unwrap();
                }
                self.held_lines = Some(lines_tx);
                self.held_exit = Some(exit_tx);
            }
            Script::Stall { lines: output } => {
                for line in output {
                    lines_tx.send(line).await.unwrap();
                }
                self.held_exit = Some(exit_tx);
            }
        }

        Ok(RemoteProcess { lines, exit })
    }

    async fn close(&mut self) -> Result<()> {
        self.held_lines = None;
        self.held_exit = None;
        Ok(())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open_session(
        &self,
        _addr: IpAddr,
        _credentials: &Credentials,
    ) -> Result<Box<dyn Session>> {
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
            held_lines: None,
            held_exit: None,
        }))
    }

    async fn upload(
        &self,
        _addr: IpAddr,
        _credentials: &Credentials,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        if self.state.fail_uploads.load(Ordering::SeqCst) {
            return Err(SupervisorError::Transport(format!(
                "scp to {remote} failed: Permission denied"
            )));
        }
        self.state
            .uploads
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Wires the fakes into a full supervisor stack.
pub struct Harness {
    pub hypervisor: Arc<FakeHypervisor>,
    pub transport: Arc<ScriptedTransport>,
    pub bus: EventBus,
    pub startup_timeout: Duration,
    source: TempDir,
    data: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_hypervisor(FakeHypervisor::new())
    }

    pub fn with_hypervisor(hypervisor: FakeHypervisor) -> Self {
        let source = TempDir::new().unwrap();
        std::fs::create_dir_all(source.path().join("install")).unwrap();
        std::fs::write(source.path().join("install/install.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(source.path().join("disko-config.nix"), "{ }\n").unwrap();

        Self {
            hypervisor: Arc::new(hypervisor),
            transport: Arc::new(ScriptedTransport::new()),
            bus: EventBus::new(),
            startup_timeout: Duration::from_secs(5),
            source,
            data: TempDir::new().unwrap(),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data.path().join("logs")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.data.path().join("reports")
    }

    pub fn journal(&self) -> PathBuf {
        self.log_dir().join("self_healing.jsonl")
    }

    pub fn runner_config(&self) -> RunnerConfig {
        let home = PostInstallCheck::hard(CheckKind::DirectoryPresent {
            path: "/home".to_string(),
        });
        let profiles = ["vm", "workstation", "server"]
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    ProfileSpec {
                        name: name.to_string(),
                        install_command: None,
                        checks: vec![home.clone()],
                    },
                )
            })
            .collect();

        RunnerConfig {
            config_source: self.source.path().to_path_buf(),
            work_dir: self.data.path().join("work"),
            log_dir: self.log_dir(),
            attempt_timeout: Duration::from_secs(30),
            reboot_settle: Duration::ZERO,
            reboot_timeout: Duration::from_secs(5),
            profiles,
            ..RunnerConfig::default()
        }
    }

    pub fn vm_manager(&self) -> Arc<VmLifecycleManager> {
        Arc::new(VmLifecycleManager::new(
            Arc::clone(&self.hypervisor) as Arc<dyn Hypervisor>,
            VmLifecycleConfig {
                startup_timeout: self.startup_timeout,
                poll_interval: Duration::from_millis(10),
                ..VmLifecycleConfig::default()
            },
        ))
    }

    pub fn runner_with(&self, config: RunnerConfig) -> Arc<ProfileRunner> {
        let executor = Arc::new(
            RemoteExecutor::new(
                Arc::clone(&self.transport) as Arc<dyn Transport>,
                Credentials::default(),
            )
            .with_close_grace(Duration::from_millis(200))
            .with_command_timeout(Duration::from_secs(2)),
        );
        let healer = Arc::new(
            HealingEngine::new(Arc::clone(&executor), config.remote_config_dir.clone())
                .with_journal(self.journal()),
        );
        Arc::new(
            ProfileRunner::new(self.vm_manager(), executor, healer, config)
                .with_bus(self.bus.clone()),
        )
    }

    pub fn runner(&self) -> Arc<ProfileRunner> {
        self.runner_with(self.runner_config())
    }

    pub fn orchestrator(&self, mode: ExecutionMode) -> Orchestrator {
        Orchestrator::new(
            self.vm_manager(),
            self.runner(),
            OrchestratorConfig {
                mode,
                max_parallel: 2,
                report_dir: Some(self.report_dir()),
            },
        )
    }

    /// A provisioned VM with its snapshot recorded.
    pub async fn ready_vm(&self) -> VmHandle {
        self.vm_manager().setup("nixos-test-vm").await.unwrap()
    }
}

pub fn profiles(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}
