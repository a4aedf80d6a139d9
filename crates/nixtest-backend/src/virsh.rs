//! libvirt hypervisor driven through `virsh`.
//!
//! New VMs get a fresh qcow2 disk from `qemu-img` and boot the installer ISO
//! via `virt-install`. Snapshots are libvirt internal snapshots, so a revert
//! restores both disk and live-system memory.

use std::ffi::{OsStr, OsString};
use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use nixtest_core::config::LibvirtSettings;
use nixtest_core::vm::{Hypervisor, VmHandle, VmState};
use nixtest_core::{Result, SupervisorError};

use crate::exec::{exec, ExecResult};

/// Description attached to snapshots this backend creates.
const SNAPSHOT_DESCRIPTION: &str = "Clean installer state";

/// libvirt [`Hypervisor`] backed by the `virsh` CLI.
pub struct VirshHypervisor {
    settings: LibvirtSettings,
    virsh: OsString,
}

impl VirshHypervisor {
    /// Creates a hypervisor using `virsh` from `PATH`.
    #[must_use]
    pub fn new(settings: LibvirtSettings) -> Self {
        Self {
            settings,
            virsh: OsString::from("virsh"),
        }
    }

    /// Returns the libvirt settings.
    #[must_use]
    pub const fn settings(&self) -> &LibvirtSettings {
        &self.settings
    }

    fn connect_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = vec!["--connect".to_string(), self.settings.uri.clone()];
        full.extend(args.iter().map(|a| (*a).to_string()));
        full
    }

    async fn virsh_raw(&self, args: &[&str]) -> Result<ExecResult> {
        let full = self.connect_args(args);
        tracing::debug!("virsh {}", full.join(" "));
        exec(&self.virsh, &full)
            .await
            .map_err(|e| SupervisorError::Hypervisor(format!("failed to run virsh: {e}")))
    }

    async fn virsh(&self, args: &[&str]) -> Result<String> {
        let result = self.virsh_raw(args).await?;
        if !result.success() {
            return Err(SupervisorError::Hypervisor(format!(
                "virsh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                result.message()
            )));
        }
        Ok(result.stdout)
    }

    fn disk_path(&self, name: &str) -> PathBuf {
        self.settings.disk_dir.join(format!("{name}.qcow2"))
    }

    fn install_args(&self, name: &str, iso: &str) -> Vec<String> {
        let disk = self.disk_path(name);
        vec![
            "--connect".to_string(),
            self.settings.uri.clone(),
            "--name".to_string(),
            name.to_string(),
            "--memory".to_string(),
            self.settings.memory_mb.to_string(),
            "--vcpus".to_string(),
            self.settings.vcpus.to_string(),
            "--disk".to_string(),
            format!("path={},format=qcow2,bus=virtio", disk.display()),
            "--cdrom".to_string(),
            iso.to_string(),
            "--network".to_string(),
            format!("network={},model=virtio", self.settings.network),
            "--graphics".to_string(),
            "vnc".to_string(),
            "--noautoconsole".to_string(),
            "--os-variant".to_string(),
            self.settings.os_variant.clone(),
            "--boot".to_string(),
            "uefi".to_string(),
        ]
    }

    async fn provision(&self, name: &str) -> Result<()> {
        let iso = self.settings.iso.as_ref().ok_or_else(|| {
            SupervisorError::Provisioning(format!(
                "VM '{name}' does not exist and libvirt.iso is not set"
            ))
        })?;
        if !iso.exists() {
            return Err(SupervisorError::Provisioning(format!(
                "installer ISO {} not found",
                iso.display()
            )));
        }

        let disk = self.disk_path(name);
        tracing::info!("Creating disk {} ({} GiB)", disk.display(), self.settings.disk_size_gb);
        let size = format!("{}G", self.settings.disk_size_gb);
        let disk_arg = disk.display().to_string();
        let result = exec(
            OsStr::new("qemu-img"),
            &["create", "-f", "qcow2", disk_arg.as_str(), size.as_str()],
        )
        .await
        .map_err(|e| SupervisorError::Provisioning(format!("failed to run qemu-img: {e}")))?;
        if !result.success() {
            return Err(SupervisorError::Provisioning(format!(
                "qemu-img create failed: {}",
                result.message()
            )));
        }

        tracing::info!("Installing VM {} from {}", name, iso.display());
        let args = self.install_args(name, &iso.display().to_string());
        let result = exec(OsStr::new("virt-install"), &args)
            .await
            .map_err(|e| SupervisorError::Provisioning(format!("failed to run virt-install: {e}")))?;
        if !result.success() {
            return Err(SupervisorError::Provisioning(format!(
                "virt-install failed: {}",
                result.message()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn create_or_reuse(&self, name: &str) -> Result<VmHandle> {
        let mut vm = VmHandle::new(name);

        if let Some(state) = self.state(name).await? {
            tracing::info!("Reusing existing VM {} ({})", name, state.as_str());
            vm.state = state;
            return Ok(vm);
        }

        self.provision(name).await?;
        vm.state = VmState::Running;
        Ok(vm)
    }

    async fn find_snapshot(&self, vm: &VmHandle, name: &str) -> Result<Option<String>> {
        let output = self.virsh(&["snapshot-list", &vm.id, "--name"]).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .find(|line| *line == name)
            .map(ToString::to_string))
    }

    async fn create_snapshot(&self, vm: &VmHandle, name: &str) -> Result<String> {
        self.virsh(&["snapshot-create-as", &vm.id, name, SNAPSHOT_DESCRIPTION])
            .await?;
        Ok(name.to_string())
    }

    async fn revert(&self, vm: &VmHandle, snapshot: &str) -> Result<()> {
        self.virsh(&["snapshot-revert", &vm.id, snapshot]).await?;
        Ok(())
    }

    async fn start(&self, vm: &VmHandle) -> Result<()> {
        let result = self.virsh_raw(&["start", &vm.id]).await?;
        if result.success() || result.message().contains("already active") {
            return Ok(());
        }
        Err(SupervisorError::Hypervisor(format!(
            "virsh start failed: {}",
            result.message()
        )))
    }

    async fn lookup_address(&self, vm: &VmHandle) -> Result<Option<IpAddr>> {
        let result = self.virsh_raw(&["domifaddr", &vm.id]).await?;
        if result.success() {
            if let Some(addr) = parse_domifaddr(&result.stdout) {
                return Ok(Some(addr));
            }
        }

        let interfaces = self.virsh(&["domiflist", &vm.id]).await?;
        let macs = parse_macs(&interfaces);
        if macs.is_empty() {
            return Ok(None);
        }
        let leases = self
            .virsh(&["net-dhcp-leases", &self.settings.network])
            .await?;
        Ok(parse_dhcp_leases(&leases, &macs))
    }

    async fn stop(&self, vm: &VmHandle) -> Result<()> {
        let result = self.virsh_raw(&["destroy", &vm.id]).await?;
        if result.success() || result.message().contains("not running") {
            return Ok(());
        }
        Err(SupervisorError::Hypervisor(format!(
            "virsh destroy failed: {}",
            result.message()
        )))
    }

    async fn destroy(&self, vm: &VmHandle) -> Result<()> {
        if self.state(&vm.id).await?.is_none() {
            tracing::debug!("VM {} already gone", vm.id);
            return Ok(());
        }

        self.stop(vm).await?;
        self.virsh(&[
            "undefine",
            &vm.id,
            "--remove-all-storage",
            "--snapshots-metadata",
            "--nvram",
        ])
        .await?;
        tracing::info!("Destroyed VM {}", vm.id);
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<Option<VmState>> {
        let result = self.virsh_raw(&["domstate", name]).await?;
        if result.success() {
            return Ok(Some(parse_domstate(&result.stdout)));
        }
        if is_missing_domain(result.message()) {
            return Ok(None);
        }
        Err(SupervisorError::Hypervisor(format!(
            "virsh domstate failed: {}",
            result.message()
        )))
    }
}

// =============================================================================
// Output parsing
// =============================================================================

fn is_missing_domain(message: &str) -> bool {
    message.contains("failed to get domain") || message.contains("Domain not found")
}

/// Maps `virsh domstate` output to a power state.
fn parse_domstate(output: &str) -> VmState {
    match output.trim() {
        "running" | "idle" | "paused" | "in shutdown" | "blocked" => VmState::Running,
        _ => VmState::Stopped,
    }
}

/// Finds the IPv4 address in a table row, ignoring the prefix length.
fn row_address(line: &str) -> Option<IpAddr> {
    if !line.contains("ipv4") {
        return None;
    }
    line.split_whitespace()
        .filter(|token| token.contains('/'))
        .find_map(|token| token.split('/').next()?.parse().ok())
}

fn is_mac(token: &str) -> bool {
    token.len() == 17 && token.matches(':').count() == 5
}

/// Parses `virsh domifaddr` output.
fn parse_domifaddr(output: &str) -> Option<IpAddr> {
    output.lines().find_map(row_address)
}

/// Collects MAC addresses from `virsh domiflist` output.
fn parse_macs(output: &str) -> Vec<String> {
    output
        .lines()
        .flat_map(str::split_whitespace)
        .filter(|token| is_mac(token))
        .map(str::to_lowercase)
        .collect()
}

/// Finds the lease for one of `macs` in `virsh net-dhcp-leases` output.
fn parse_dhcp_leases(output: &str, macs: &[String]) -> Option<IpAddr> {
    output
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .any(|token| is_mac(token) && macs.contains(&token.to_lowercase()))
        })
        .find_map(row_address)
}
