//! The `cleanup` command.

use anyhow::{Context, Result};
use clap::Args;
use nixtest_core::{SupervisorConfig, VmHandle};

/// Arguments for `nixtest cleanup`.
#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Destroy only this VM (recorded or not)
    #[arg(long)]
    pub name: Option<String>,
}

/// Stops and destroys recorded VMs, then forgets them.
pub async fn execute(args: CleanupArgs, config: SupervisorConfig) -> Result<i32> {
    let store = super::record_store(&config);
    let targets: Vec<VmHandle> = match args.name {
        Some(name) => vec![store
            .load(&name)
            .context("Failed to read VM record")?
            .map_or_else(|| VmHandle::new(&name), |record| record.to_handle())],
        None => store
            .list()
            .context("Failed to list VM records")?
            .iter()
            .map(|record| record.to_handle())
            .collect(),
    };

    if targets.is_empty() {
        println!("No recorded VMs");
        return Ok(0);
    }

    let vm_mgr = super::vm_manager(&config, None);
    let mut failures = 0;
    for mut vm in targets {
        vm_mgr.stop(&mut vm).await;
        match vm_mgr.hypervisor().destroy(&vm).await {
            Ok(()) => {
                store.remove(&vm.id).context("Failed to remove VM record")?;
                println!("Destroyed {}", vm.id);
            }
            Err(e) => {
                tracing::error!("Failed to destroy {}: {}", vm.id, e);
                failures += 1;
            }
        }
    }

    Ok(i32::from(failures > 0))
}
