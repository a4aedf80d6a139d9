//! Runs a list of profiles and produces the test report.
//!
//! Sequential mode shares one VM across profiles, reverting it between them.
//! Parallel mode gives every profile its own VM, named after the base VM and
//! the profile, and bounds how many run at once.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SupervisorError};
use crate::report::TestReport;
use crate::runner::{ProfileResult, ProfileRunner};
use crate::vm::{VmLease, VmLifecycleManager};

/// Default number of profiles run at once in parallel mode.
const DEFAULT_MAX_PARALLEL: usize = 2;

/// How profiles are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One VM, one profile at a time.
    #[default]
    Sequential,
    /// One VM per profile, several at a time.
    Parallel,
}

impl ExecutionMode {
    /// Returns the mode name for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Scheduling mode.
    pub mode: ExecutionMode,
    /// Concurrency limit in parallel mode.
    pub max_parallel: usize,
    /// Where reports are written. `None` keeps them in memory.
    pub report_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            report_dir: None,
        }
    }
}

/// Runs profiles and reports on them.
pub struct Orchestrator {
    vm: Arc<VmLifecycleManager>,
    runner: Arc<ProfileRunner>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        vm: Arc<VmLifecycleManager>,
        runner: Arc<ProfileRunner>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { vm, runner, config }
    }

    /// Returns the runner.
    #[must_use]
    pub fn runner(&self) -> &Arc<ProfileRunner> {
        &self.runner
    }

    /// Runs `profiles` and returns the report.
    ///
    /// A failing profile never stops the others. Cancelling `cancel` finishes
    /// the current stage of every running profile as failed, skips the rest
    /// and still produces a report.
    ///
    /// # Errors
    ///
    /// In sequential mode, returns the setup error if the shared VM cannot be
    /// provisioned. Report write failures are logged, not returned.
    pub async fn run(&self, profiles: &[String], cancel: &CancellationToken) -> Result<TestReport> {
        let run_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let started_at = Utc::now();

        tracing::info!(
            run_id = %run_id,
            mode = self.config.mode.as_str(),
            profiles = ?profiles,
            "Starting test run"
        );

        let results = match self.config.mode {
            ExecutionMode::Sequential => self.run_sequential(profiles, &run_id, cancel).await?,
            ExecutionMode::Parallel => self.run_parallel(profiles, &run_id, cancel).await,
        };

        let report = TestReport::new(
            run_id,
            started_at,
            self.config.mode,
            profiles,
            results,
            cancel.is_cancelled(),
        );

        tracing::info!(
            total = report.summary.total,
            passed = report.summary.passed,
            failed = report.summary.failed,
            interrupted = report.interrupted,
            "Test run finished"
        );

        if let Some(dir) = &self.config.report_dir {
            if let Err(e) = report.write(dir).await {
                tracing::error!(dir = %dir.display(), "Failed to write test report: {}", e);
            }
        }

        Ok(report)
    }

    async fn run_sequential(
        &self,
        profiles: &[String],
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, ProfileResult>> {
        let mut results = BTreeMap::new();
        let name = self.vm.config().name.clone();

        let acquired = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SupervisorError::Interrupted),
            lease = VmLease::acquire(Arc::clone(&self.vm), &name) => lease,
        };
        let mut lease = match acquired {
            Ok(lease) => lease,
            Err(SupervisorError::Interrupted) => {
                tracing::warn!("Interrupted during VM setup");
                return Ok(results);
            }
            Err(e) => {
                tracing::error!(vm = %name, "VM setup failed: {}", e);
                return Err(e);
            }
        };

        for profile in profiles {
            if cancel.is_cancelled() {
                tracing::info!(profile = %profile, "Skipping profile: run interrupted");
                continue;
            }
            let result = self
                .runner
                .run(profile, run_id, lease.vm_mut(), cancel)
                .await;
            results.insert(profile.clone(), result);
        }

        lease.release().await;
        Ok(results)
    }

    async fn run_parallel(
        &self,
        profiles: &[String],
        run_id: &str,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, ProfileResult> {
        let results = Arc::new(Mutex::new(BTreeMap::new()));
        let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let base_name = self.vm.config().name.clone();
        let mut tasks = JoinSet::new();

        for profile in profiles {
            let profile = profile.clone();
            let vm_name = format!("{base_name}-{profile}");
            let run_id = run_id.to_string();
            let vm = Arc::clone(&self.vm);
            let runner = Arc::clone(&self.runner);
            let results = Arc::clone(&results);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if cancel.is_cancelled() {
                    tracing::info!(profile = %profile, "Skipping profile: run interrupted");
                    return;
                }

                let result = match VmLease::acquire(vm, &vm_name).await {
                    Ok(mut lease) => {
                        let result = runner.run(&profile, &run_id, lease.vm_mut(), &cancel).await;
                        lease.release().await;
                        result
                    }
                    Err(e) => {
                        tracing::error!(profile = %profile, vm = %vm_name, "VM setup failed: {}", e);
                        ProfileResult::not_started(&profile, runner.log_path(&profile, &run_id), &e)
                    }
                };

                results.lock().await.insert(profile, result);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Profile task panicked: {}", e);
            }
        }

        let collected = results.lock().await.clone();
        collected
    }
}
