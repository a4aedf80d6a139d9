//! The `setup` command.

use anyhow::{Context, Result};
use clap::Args;
use nixtest_core::{SupervisorConfig, VmRecord};

/// Arguments for `nixtest setup`.
#[derive(Args, Debug)]
pub struct SetupArgs {
    /// VM name (defaults to vm.name from the configuration)
    #[arg(long)]
    pub name: Option<String>,
}

/// Provisions or reuses the base VM and records it.
pub async fn execute(args: SetupArgs, config: SupervisorConfig) -> Result<i32> {
    let name = args.name.unwrap_or_else(|| config.vm.name.clone());
    let vm_mgr = super::vm_manager(&config, None);

    let vm = vm_mgr
        .setup(&name)
        .await
        .with_context(|| format!("Failed to set up VM '{name}'"))?;

    let store = super::record_store(&config);
    store
        .save(&VmRecord::from_handle(&vm))
        .context("Failed to record VM")?;

    println!("VM:        {}", vm.id);
    println!("State:     {}", vm.state.as_str());
    println!(
        "Snapshot:  {}",
        vm.snapshot.as_deref().unwrap_or("(none)")
    );
    println!("Record:    {}", config.records_dir().display());
    Ok(0)
}
