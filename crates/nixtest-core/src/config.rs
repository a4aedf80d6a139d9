//! Configuration management.
//!
//! Configuration is loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`NIXTEST_*`, nested keys joined with `__`)
//! 2. User config file (`~/.config/nixtest/config.toml`)
//! 3. System config file (`/etc/nixtest/config.toml`)
//! 4. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! data_dir = "/var/lib/nixtest"
//!
//! [vm]
//! name = "nixos-test-vm"
//! startup_timeout_secs = 300
//!
//! [libvirt]
//! uri = "qemu:///system"
//! iso = "/srv/iso/nixos-minimal.iso"
//!
//! [ssh]
//! user = "nixos"
//! identity_file = "~/.ssh/nixtest"
//!
//! [install]
//! config_source = "/home/me/nixos-config"
//!
//! [healing]
//! max_attempts = 3
//! confidence_floor = 0.5
//!
//! [orchestrator]
//! profiles = ["vm", "workstation", "server"]
//!
//! [[profiles.server.checks]]
//! severity = "soft"
//! check = { type = "service_active", service = "nginx" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};
use crate::orchestrator::{ExecutionMode, OrchestratorConfig};
use crate::profile::{PostInstallCheck, ProfileSpec};
use crate::remote::{Credentials, DEFAULT_CLOSE_GRACE, DEFAULT_COMMAND_TIMEOUT};
use crate::runner::{
    RunnerConfig, DEFAULT_INSTALL_COMMAND, DEFAULT_REBOOT_COMMAND, DEFAULT_REMOTE_CONFIG_DIR,
};
use crate::vm::{TeardownPolicy, VmLifecycleConfig, DEFAULT_SNAPSHOT_NAME, DEFAULT_VM_NAME};

/// Prefix of configuration environment variables.
const ENV_PREFIX: &str = "NIXTEST_";

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// State directory.
    pub data_dir: PathBuf,
    /// Installer and healing logs. Defaults to `{data_dir}/logs`.
    pub log_dir: Option<PathBuf>,
    /// Reports. Defaults to `{data_dir}/reports`.
    pub report_dir: Option<PathBuf>,
    /// VM lifecycle settings.
    pub vm: VmSettings,
    /// libvirt settings.
    pub libvirt: LibvirtSettings,
    /// SSH settings.
    pub ssh: SshSettings,
    /// Installer settings.
    pub install: InstallSettings,
    /// Healing settings.
    pub healing: HealingSettings,
    /// Scheduling settings.
    pub orchestrator: OrchestratorSettings,
    /// Per-profile overrides.
    pub profiles: BTreeMap<String, ProfileSettings>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_dir: None,
            report_dir: None,
            vm: VmSettings::default(),
            libvirt: LibvirtSettings::default(),
            ssh: SshSettings::default(),
            install: InstallSettings::default(),
            healing: HealingSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            profiles: BTreeMap::new(),
        }
    }
}

impl SupervisorConfig {
    /// Loads configuration from files and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(system_config_path()))
                .merge(Toml::file(user_config_path()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Loads configuration from a specific file, then the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed, or the
    /// result is invalid.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SupervisorError::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| SupervisorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make a run meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.healing.max_attempts == 0 {
            return Err(SupervisorError::Config(
                "healing.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.healing.confidence_floor) {
            return Err(SupervisorError::Config(format!(
                "healing.confidence_floor must be within [0, 1], got {}",
                self.healing.confidence_floor
            )));
        }
        if self.orchestrator.max_parallel == 0 {
            return Err(SupervisorError::Config(
                "orchestrator.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.vm.poll_interval_ms == 0 {
            return Err(SupervisorError::Config(
                "vm.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.ssh.command_timeout_secs == 0 {
            return Err(SupervisorError::Config(
                "ssh.command_timeout_secs must be positive".to_string(),
            ));
        }
        if !self.install.command.contains("{profile}")
            && self.profiles.values().all(|p| p.install_command.is_none())
        {
            tracing::warn!("install.command has no {{profile}} placeholder");
        }
        Ok(())
    }

    /// Returns the log directory.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    /// Returns the report directory.
    #[must_use]
    pub fn report_dir(&self) -> PathBuf {
        self.report_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("reports"))
    }

    /// Returns the directory of per-run configuration stages.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }

    /// Returns the directory of VM records.
    #[must_use]
    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("vms")
    }

    /// Returns the healing journal path.
    #[must_use]
    pub fn healing_journal(&self) -> Option<PathBuf> {
        self.healing
            .journal
            .then(|| self.log_dir().join("self_healing.jsonl"))
    }

    /// Builds the VM lifecycle configuration.
    #[must_use]
    pub fn vm_lifecycle(&self, teardown: Option<TeardownPolicy>) -> VmLifecycleConfig {
        VmLifecycleConfig {
            name: self.vm.name.clone(),
            snapshot_name: self.vm.snapshot.clone(),
            startup_timeout: Duration::from_secs(self.vm.startup_timeout_secs),
            poll_interval: Duration::from_millis(self.vm.poll_interval_ms),
            ssh_port: self.ssh.port,
            teardown: teardown.unwrap_or(self.vm.teardown),
        }
    }

    /// Builds the live-system credentials.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.ssh.user.clone(),
            port: self.ssh.port,
            identity_file: self.ssh.identity_file.clone(),
            connect_timeout_secs: self.ssh.connect_timeout_secs,
        }
    }

    /// Returns the time allowed for remote sessions to close.
    #[must_use]
    pub const fn close_grace(&self) -> Duration {
        Duration::from_millis(self.ssh.close_grace_ms)
    }

    /// Returns the upper bound on commands run to completion.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.command_timeout_secs)
    }

    /// Builds the profile runner configuration.
    #[must_use]
    pub fn runner(&self) -> RunnerConfig {
        let profiles = self
            .profiles
            .iter()
            .map(|(name, settings)| (name.clone(), settings.to_spec(name)))
            .collect();

        RunnerConfig {
            install_command: self.install.command.clone(),
            config_source: self.install.config_source.clone(),
            remote_config_dir: self.install.remote_dir.clone(),
            work_dir: self.work_dir(),
            log_dir: self.log_dir(),
            max_attempts: self.healing.max_attempts,
            confidence_floor: self.healing.confidence_floor,
            attempt_timeout: Duration::from_secs(self.install.attempt_timeout_secs),
            reboot_command: self.install.reboot_command.clone(),
            reboot_settle: Duration::from_secs(self.vm.reboot_settle_secs),
            reboot_timeout: Duration::from_secs(self.vm.reboot_timeout_secs),
            verify_credentials: self
                .ssh
                .verify_user
                .as_ref()
                .map(|user| self.credentials().with_user(user.clone())),
            profiles,
        }
    }

    /// Builds the orchestrator configuration.
    #[must_use]
    pub fn orchestrator(&self, parallel: bool) -> OrchestratorConfig {
        let mode = if parallel || self.orchestrator.parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        };
        OrchestratorConfig {
            mode,
            max_parallel: self.orchestrator.max_parallel,
            report_dir: Some(self.report_dir()),
        }
    }
}

/// VM lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    /// Base VM name.
    pub name: String,
    /// Pristine snapshot name.
    pub snapshot: String,
    /// Time allowed to become reachable after start.
    pub startup_timeout_secs: u64,
    /// Interval between reachability checks.
    pub poll_interval_ms: u64,
    /// Time allowed to come back after the post-install reboot.
    pub reboot_timeout_secs: u64,
    /// Pause after issuing the reboot.
    pub reboot_settle_secs: u64,
    /// What happens to VMs after the run.
    pub teardown: TeardownPolicy,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_VM_NAME.to_string(),
            snapshot: DEFAULT_SNAPSHOT_NAME.to_string(),
            startup_timeout_secs: 300,
            poll_interval_ms: 2000,
            reboot_timeout_secs: 300,
            reboot_settle_secs: 10,
            teardown: TeardownPolicy::default(),
        }
    }
}

/// libvirt settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtSettings {
    /// Connection URI.
    pub uri: String,
    /// Installer ISO booted by new VMs.
    pub iso: Option<PathBuf>,
    /// Directory holding VM disks.
    pub disk_dir: PathBuf,
    /// Disk size of new VMs.
    pub disk_size_gb: u64,
    /// Memory of new VMs.
    pub memory_mb: u64,
    /// vCPUs of new VMs.
    pub vcpus: u32,
    /// libvirt network.
    pub network: String,
    /// `virt-install --os-variant` value.
    pub os_variant: String,
}

impl Default for LibvirtSettings {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            iso: None,
            disk_dir: PathBuf::from("/var/lib/libvirt/images"),
            disk_size_gb: 20,
            memory_mb: 4096,
            vcpus: 2,
            network: "default".to_string(),
            os_variant: "nixos-unstable".to_string(),
        }
    }
}

/// SSH settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Live-system user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Private key.
    pub identity_file: Option<PathBuf>,
    /// Connection timeout.
    pub connect_timeout_secs: u64,
    /// Time allowed for a session to close.
    pub close_grace_ms: u64,
    /// Upper bound on healing commands and post-install checks.
    pub command_timeout_secs: u64,
    /// User for post-install checks. Unset uses `user`.
    pub verify_user: Option<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "nixos".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
            close_grace_ms: u64::try_from(DEFAULT_CLOSE_GRACE.as_millis()).unwrap_or(5000),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            verify_user: Some("testuser".to_string()),
        }
    }
}

/// Installer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSettings {
    /// Install command template.
    pub command: String,
    /// Local configuration tree.
    pub config_source: PathBuf,
    /// Where the tree is placed in the VM.
    pub remote_dir: String,
    /// Upper bound on one attempt.
    pub attempt_timeout_secs: u64,
    /// Reboot before verification. Unset verifies in place.
    pub reboot_command: Option<String>,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_INSTALL_COMMAND.to_string(),
            config_source: PathBuf::from("."),
            remote_dir: DEFAULT_REMOTE_CONFIG_DIR.to_string(),
            attempt_timeout_secs: 3600,
            reboot_command: Some(DEFAULT_REBOOT_COMMAND.to_string()),
        }
    }
}

/// Healing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingSettings {
    /// Attempts per profile, including the first.
    pub max_attempts: u32,
    /// Minimum confidence of an applied action.
    pub confidence_floor: f64,
    /// Write the healing journal.
    pub journal: bool,
}

impl Default for HealingSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            confidence_floor: 0.5,
            journal: true,
        }
    }
}

/// Scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Run profiles in parallel.
    pub parallel: bool,
    /// Concurrency limit in parallel mode.
    pub max_parallel: usize,
    /// Profiles tested when none are named.
    pub profiles: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            parallel: false,
            max_parallel: 2,
            profiles: vec!["vm".to_string(), "workstation".to_string(), "server".to_string()],
        }
    }
}

/// Per-profile overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Install command template for this profile.
    pub install_command: Option<String>,
    /// Checks replacing the built-in ones.
    pub checks: Option<Vec<PostInstallCheck>>,
}

impl ProfileSettings {
    fn to_spec(&self, name: &str) -> ProfileSpec {
        let mut spec = ProfileSpec::builtin(name);
        spec.install_command.clone_from(&self.install_command);
        if let Some(checks) = &self.checks {
            spec.checks.clone_from(checks);
        }
        spec
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("nixtest")
}

fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("nixtest")
        .join("config.toml")
}

fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/nixtest/config.toml")
}
