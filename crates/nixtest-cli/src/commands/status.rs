//! The `status` command.

use anyhow::{Context, Result};
use clap::Args;
use nixtest_core::{SupervisorConfig, TestReport};

/// Arguments for `nixtest status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Skip querying the hypervisor
    #[arg(long)]
    pub offline: bool,
}

/// Shows recorded VMs, their live state and the latest report.
pub async fn execute(args: StatusArgs, config: SupervisorConfig) -> Result<i32> {
    let records = super::record_store(&config)
        .list()
        .context("Failed to list VM records")?;

    if records.is_empty() {
        println!("No recorded VMs");
    } else {
        let vm_mgr = (!args.offline).then(|| super::vm_manager(&config, None));

        println!(
            "{:<28} {:<14} {:<10} {:<10} CREATED",
            "NAME", "SNAPSHOT", "RECORDED", "LIVE"
        );
        for record in &records {
            let live = match &vm_mgr {
                None => "-".to_string(),
                Some(mgr) => match mgr.hypervisor().state(&record.name).await {
                    Ok(Some(state)) => state.as_str().to_string(),
                    Ok(None) => "missing".to_string(),
                    Err(e) => {
                        tracing::debug!("State query for {} failed: {}", record.name, e);
                        "unknown".to_string()
                    }
                },
            };
            println!(
                "{:<28} {:<14} {:<10} {:<10} {}",
                record.name,
                record.snapshot.as_deref().unwrap_or("-"),
                record.state.as_str(),
                live,
                record.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    println!();
    let latest = TestReport::load_latest(&config.report_dir())
        .await
        .context("Failed to read latest report")?;
    match latest {
        Some(report) => print!("{}", report.render_summary()),
        None => println!("No test reports yet"),
    }
    Ok(0)
}
