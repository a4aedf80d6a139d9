//! VM lifecycle management for installation tests.
//!
//! Every profile test starts from the same pristine disk. The lifecycle
//! manager provisions (or reuses) a base VM once, records a clean snapshot of
//! it, and reverts to that snapshot before each profile.
//!
//! ```text
//!   setup ──▶ [revert ──▶ start ──▶ (profile runs) ──▶ ...] ──▶ teardown
//!               ▲                                          │
//!               └──────────────── next profile ◀───────────┘
//! ```
//!
//! The hypervisor itself is behind the [`Hypervisor`] trait; `nixtest-backend`
//! provides the libvirt implementation.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::error::{Result, SupervisorError};

// =============================================================================
// Constants
// =============================================================================

/// Default name of the base VM.
pub const DEFAULT_VM_NAME: &str = "nixos-test-vm";

/// Default name of the pristine snapshot.
pub const DEFAULT_SNAPSHOT_NAME: &str = "clean-state";

/// Default time allowed for a VM to become reachable.
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 300;

/// Default interval between reachability checks.
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Default port checked to decide whether a VM is reachable.
const DEFAULT_SSH_PORT: u16 = 22;

/// Timeout of a single TCP reachability check.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

// =============================================================================
// Handle
// =============================================================================

/// Power state of a managed VM, as far as the supervisor knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Not running.
    Stopped,
    /// Booted.
    Running,
    /// Being rolled back to its snapshot.
    Reverting,
}

impl VmState {
    /// Returns the state name for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Reverting => "reverting",
        }
    }
}

/// A VM the supervisor owns.
///
/// `ip_address` is only meaningful while `state` is [`VmState::Running`]; it
/// is cleared on every stop and revert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    /// Hypervisor identifier (domain name).
    pub id: String,
    /// Address discovered after the last start.
    pub ip_address: Option<IpAddr>,
    /// Current power state.
    pub state: VmState,
    /// Pristine snapshot, once recorded.
    pub snapshot: Option<String>,
}

impl VmHandle {
    /// Creates a handle for a stopped VM without a snapshot.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip_address: None,
            state: VmState::Stopped,
            snapshot: None,
        }
    }

    /// Returns the address, or a transport error if the VM has none yet.
    pub fn address(&self) -> Result<IpAddr> {
        self.ip_address.ok_or_else(|| {
            SupervisorError::Transport(format!("VM '{}' has no known address", self.id))
        })
    }
}

// =============================================================================
// Hypervisor seam
// =============================================================================

/// Operations the supervisor needs from a hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Creates the named VM from the base image, or returns the existing one.
    async fn create_or_reuse(&self, name: &str) -> Result<VmHandle>;

    /// Looks up a snapshot by name.
    async fn find_snapshot(&self, vm: &VmHandle, name: &str) -> Result<Option<String>>;

    /// Records a snapshot and returns its identifier.
    async fn create_snapshot(&self, vm: &VmHandle, name: &str) -> Result<String>;

    /// Rolls the VM disk back to a snapshot.
    async fn revert(&self, vm: &VmHandle, snapshot: &str) -> Result<()>;

    /// Boots the VM. Must succeed if it is already running.
    async fn start(&self, vm: &VmHandle) -> Result<()>;

    /// Returns the VM's current address, if the hypervisor knows one.
    async fn lookup_address(&self, vm: &VmHandle) -> Result<Option<IpAddr>>;

    /// Returns true if something is listening at `addr`.
    async fn is_reachable(&self, addr: SocketAddr) -> bool {
        matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Powers the VM off.
    async fn stop(&self, vm: &VmHandle) -> Result<()>;

    /// Deletes the VM and its storage.
    async fn destroy(&self, vm: &VmHandle) -> Result<()>;

    /// Returns the live power state, or `None` if the VM does not exist.
    async fn state(&self, name: &str) -> Result<Option<VmState>>;
}

// =============================================================================
// Configuration
// =============================================================================

/// What to do with a VM once the run is over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Stop and delete the VM.
    #[default]
    Destroy,
    /// Stop the VM but keep it and its snapshot for the next run.
    Stop,
    /// Leave it running for debugging.
    KeepRunning,
}

/// VM lifecycle configuration.
#[derive(Debug, Clone)]
pub struct VmLifecycleConfig {
    /// Base VM name.
    pub name: String,
    /// Pristine snapshot name.
    pub snapshot_name: String,
    /// Time allowed for the VM to become reachable after start.
    pub startup_timeout: Duration,
    /// Interval between reachability checks.
    pub poll_interval: Duration,
    /// Port checked for reachability.
    pub ssh_port: u16,
    /// Teardown behaviour.
    pub teardown: TeardownPolicy,
}

impl Default for VmLifecycleConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_VM_NAME.to_string(),
            snapshot_name: DEFAULT_SNAPSHOT_NAME.to_string(),
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            ssh_port: DEFAULT_SSH_PORT,
            teardown: TeardownPolicy::default(),
        }
    }
}

// =============================================================================
// Lifecycle manager
// =============================================================================

/// Provisions, snapshots, reverts, starts and tears down test VMs.
pub struct VmLifecycleManager {
    hypervisor: Arc<dyn Hypervisor>,
    config: VmLifecycleConfig,
}

impl VmLifecycleManager {
    /// Creates a new lifecycle manager.
    #[must_use]
    pub fn new(hypervisor: Arc<dyn Hypervisor>, config: VmLifecycleConfig) -> Self {
        Self { hypervisor, config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &VmLifecycleConfig {
        &self.config
    }

    /// Returns the hypervisor.
    #[must_use]
    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    /// Provisions the base VM and makes sure a pristine snapshot exists.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Provisioning`] if the VM cannot be created
    /// or [`SupervisorError::Snapshot`] if the snapshot cannot be recorded.
    pub async fn setup(&self, name: &str) -> Result<VmHandle> {
        let mut vm = self
            .hypervisor
            .create_or_reuse(name)
            .await
            .map_err(into_provisioning)?;

        let snapshot_name = &self.config.snapshot_name;
        let existing = self
            .hypervisor
            .find_snapshot(&vm, snapshot_name)
            .await
            .map_err(into_provisioning)?;

        let snapshot = match existing {
            Some(id) => {
                tracing::debug!(vm = %vm.id, snapshot = %id, "Reusing pristine snapshot");
                id
            }
            None => {
                tracing::info!(vm = %vm.id, snapshot = %snapshot_name, "Recording pristine snapshot");
                self.hypervisor
                    .create_snapshot(&vm, snapshot_name)
                    .await
                    .map_err(|e| {
                        SupervisorError::Snapshot(format!(
                            "cannot record '{snapshot_name}' for VM '{}': {e}",
                            vm.id
                        ))
                    })?
            }
        };

        vm.snapshot = Some(snapshot);
        tracing::info!(vm = %vm.id, "VM ready for testing");
        Ok(vm)
    }

    /// Rolls the VM back to its pristine snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Snapshot`] if no snapshot was recorded or the
    /// revert fails.
    pub async fn revert_to_clean(&self, vm: &mut VmHandle) -> Result<()> {
        let Some(snapshot) = vm.snapshot.clone() else {
            return Err(SupervisorError::Snapshot(format!(
                "VM '{}' has no pristine snapshot",
                vm.id
            )));
        };

        tracing::info!(vm = %vm.id, snapshot = %snapshot, "Reverting to pristine snapshot");
        vm.state = VmState::Reverting;
        vm.ip_address = None;

        let result = self.hypervisor.revert(vm, &snapshot).await;
        vm.state = VmState::Stopped;
        result.map_err(|e| {
            SupervisorError::Snapshot(format!(
                "revert of VM '{}' to '{snapshot}' failed: {e}",
                vm.id
            ))
        })
    }

    /// Boots the VM and waits until it is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::StartupTimeout`] if the VM does not become
    /// reachable within the startup timeout.
    pub async fn start(&self, vm: &mut VmHandle) -> Result<IpAddr> {
        tracing::info!(vm = %vm.id, "Starting VM");
        self.hypervisor.start(vm).await?;
        vm.state = VmState::Running;
        self.wait_reachable(vm, self.config.startup_timeout).await
    }

    /// Polls until the VM has an address that accepts connections.
    ///
    /// Used after start and again after an in-guest reboot.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::StartupTimeout`] once `timeout` elapses.
    pub async fn wait_reachable(&self, vm: &mut VmHandle, timeout: Duration) -> Result<IpAddr> {
        let deadline = tokio::time::Instant::now() + timeout;
        vm.ip_address = None;

        tracing::debug!(vm = %vm.id, ?timeout, "Waiting for VM to become reachable");

        loop {
            match self.hypervisor.lookup_address(vm).await {
                Ok(Some(ip)) => {
                    let addr = SocketAddr::new(ip, self.config.ssh_port);
                    if self.hypervisor.is_reachable(addr).await {
                        tracing::info!(vm = %vm.id, %ip, "VM is reachable");
                        vm.ip_address = Some(ip);
                        return Ok(ip);
                    }
                    tracing::debug!(vm = %vm.id, %addr, "Address known but not accepting connections");
                }
                Ok(None) => tracing::debug!(vm = %vm.id, "No address yet"),
                Err(e) => tracing::debug!(vm = %vm.id, "Address lookup failed: {}", e),
            }

            if tokio::time::Instant::now() + self.config.poll_interval > deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        Err(SupervisorError::StartupTimeout {
            vm: vm.id.clone(),
            timeout,
        })
    }

    /// Powers the VM off. Never fails; problems are logged.
    pub async fn stop(&self, vm: &mut VmHandle) {
        if let Err(e) = self.hypervisor.stop(vm).await {
            tracing::warn!(vm = %vm.id, "Failed to stop VM: {}", e);
        }
        vm.state = VmState::Stopped;
        vm.ip_address = None;
    }

    /// Applies the teardown policy. Never fails; problems are logged.
    pub async fn teardown(&self, mut vm: VmHandle) {
        match self.config.teardown {
            TeardownPolicy::KeepRunning => {
                tracing::info!(vm = %vm.id, ip = ?vm.ip_address, "Leaving VM running for inspection");
            }
            TeardownPolicy::Stop => self.stop(&mut vm).await,
            TeardownPolicy::Destroy => {
                self.stop(&mut vm).await;
                match self.hypervisor.destroy(&vm).await {
                    Ok(()) => tracing::info!(vm = %vm.id, "VM destroyed"),
                    Err(e) => tracing::warn!(vm = %vm.id, "Failed to destroy VM: {}", e),
                }
            }
        }
    }
}

fn into_provisioning(err: SupervisorError) -> SupervisorError {
    match err {
        SupervisorError::Provisioning(_) => err,
        other => SupervisorError::Provisioning(other.to_string()),
    }
}

// =============================================================================
// Scoped acquisition
// =============================================================================

/// A provisioned VM that is torn down when the lease ends.
///
/// Call [`VmLease::release`] on the normal path. If the lease is dropped
/// instead (a panic, an early return), teardown is spawned onto the current
/// runtime on a best-effort basis.
pub struct VmLease {
    manager: Arc<VmLifecycleManager>,
    vm: VmHandle,
    released: bool,
}

impl VmLease {
    /// Sets up the named VM and wraps it in a lease.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`VmLifecycleManager::setup`].
    pub async fn acquire(manager: Arc<VmLifecycleManager>, name: &str) -> Result<Self> {
        let vm = manager.setup(name).await?;
        Ok(Self {
            manager,
            vm,
            released: false,
        })
    }

    /// Returns the leased VM.
    #[must_use]
    pub const fn vm(&self) -> &VmHandle {
        &self.vm
    }

    /// Returns the leased VM mutably.
    pub fn vm_mut(&mut self) -> &mut VmHandle {
        &mut self.vm
    }

    /// Ends the lease and tears the VM down.
    pub async fn release(mut self) {
        self.released = true;
        self.manager.teardown(self.vm.clone()).await;
    }
}

impl Drop for VmLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let vm = self.vm.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(vm = %vm.id, "VM lease dropped without release, tearing down in background");
                let manager = Arc::clone(&self.manager);
                runtime.spawn(async move {
                    manager.teardown(vm).await;
                });
            }
            Err(_) => {
                tracing::warn!(vm = %vm.id, "VM lease dropped outside a runtime, VM left as is");
            }
        }
    }
}
