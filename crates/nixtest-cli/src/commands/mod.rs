//! CLI command implementations.
//!
//! - `test`: run installation tests and write a report
//! - `setup`: provision the base VM and record its pristine snapshot
//! - `cleanup`: destroy recorded VMs
//! - `status`: show recorded VMs, their live state and the last report

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nixtest_backend::VirshHypervisor;
use nixtest_core::vm::TeardownPolicy;
use nixtest_core::{SupervisorConfig, VmLifecycleManager, VmRecordStore};

pub mod cleanup;
pub mod setup;
pub mod status;

/// nixtest - Supervised NixOS installation tests
#[derive(Parser)]
#[command(name = "nixtest")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file, used instead of the system and user files
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run installation tests for one or more profiles
    Test(test::TestArgs),

    /// Provision the base VM and record its clean snapshot
    Setup(setup::SetupArgs),

    /// Destroy recorded VMs
    Cleanup(cleanup::CleanupArgs),

    /// Show recorded VMs and the last report
    Status(status::StatusArgs),
}

/// Loads configuration from `path`, or from the default locations.
pub fn load_config(path: Option<&Path>) -> Result<SupervisorConfig> {
    match path {
        Some(path) => SupervisorConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => SupervisorConfig::load().context("Failed to load configuration"),
    }
}

/// Builds a lifecycle manager backed by libvirt.
pub fn vm_manager(
    config: &SupervisorConfig,
    teardown: Option<TeardownPolicy>,
) -> Arc<VmLifecycleManager> {
    let hypervisor = Arc::new(VirshHypervisor::new(config.libvirt.clone()));
    Arc::new(VmLifecycleManager::new(
        hypervisor,
        config.vm_lifecycle(teardown),
    ))
}

/// Opens the VM record store.
pub fn record_store(config: &SupervisorConfig) -> VmRecordStore {
    VmRecordStore::new(config.records_dir())
}
