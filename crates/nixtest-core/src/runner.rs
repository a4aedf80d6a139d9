//! Drives one installation profile from pristine VM to verdict.
//!
//! ```text
//!   Preparing ─▶ Deploying ─▶ Installing ─┬─▶ Verifying ─▶ Succeeded
//!                                 ▲       │
//!                                 │     Error ─▶ Healing
//!                                 └───────────────┘   (any stage) ─▶ Failed
//! ```
//!
//! The VM is reverted once per profile. A healed attempt restarts the install
//! command on the same VM with whatever the healing action changed.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::deploy::DeployedConfig;
use crate::error::{Result, SupervisorError};
use crate::event::{classify, Event, EventKind};
use crate::healing::{HealingAction, HealingEngine};
use crate::monitor::{EventBus, MonitorEvent};
use crate::profile::{shell_quote, CheckResult, CheckSeverity, ProfileSpec};
use crate::remote::{Credentials, RemoteExecutor};
use crate::vm::{VmHandle, VmLifecycleManager};

// =============================================================================
// Constants
// =============================================================================

/// Default install command. `{profile}` and `{config_dir}` are substituted.
pub const DEFAULT_INSTALL_COMMAND: &str = "sudo INSTALL_PROFILE={profile} INSTALL_DISK=/dev/vda \
     INSTALL_USER=testuser {config_dir}/install/install.sh";

/// Default directory of the configuration tree inside the VM.
pub const DEFAULT_REMOTE_CONFIG_DIR: &str = "/tmp/nixos-config";

/// Default reboot command run before verification.
pub const DEFAULT_REBOOT_COMMAND: &str = "sudo systemctl reboot";

/// Key of the error synthesized for a non-zero installer exit.
pub const EXIT_STATUS_KEY: &str = "exit_status";

/// Key of the error synthesized when the session drops.
pub const CONNECTION_LOST_KEY: &str = "connection_lost";

/// Key of the error synthesized when an attempt runs too long.
pub const TIMEOUT_KEY: &str = "timeout";

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.5;
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_REBOOT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_REBOOT_SETTLE_SECS: u64 = 10;

// =============================================================================
// States and records
// =============================================================================

/// Where a profile run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    /// Reverting and booting the VM.
    Preparing,
    /// Pushing the configuration tree.
    Deploying,
    /// Streaming the installer.
    Installing,
    /// The installer reported an error.
    Error,
    /// Applying a healing action.
    Healing,
    /// Rebooting and running post-install checks.
    Verifying,
    /// Terminal: the profile passed.
    Succeeded,
    /// Terminal: the profile failed.
    Failed,
}

impl RunnerState {
    /// Returns the state name for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Deploying => "deploying",
            Self::Installing => "installing",
            Self::Error => "error",
            Self::Healing => "healing",
            Self::Verifying => "verifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Succeeded` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// How one install attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The installer completed.
    Success,
    /// The installer failed and was not healed.
    Failed,
    /// The installer failed and a healing action was applied.
    Healed,
}

/// Final verdict for a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileOutcome {
    /// Installed and verified.
    Succeeded,
    /// Anything else.
    Failed,
}

/// When an installer phase began.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseMark {
    /// Phase name.
    pub phase: String,
    /// When its marker was seen.
    pub started_at: DateTime<Utc>,
}

/// One run of the install command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Profile under test.
    pub profile: String,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Classified events, in stream order.
    pub events: Vec<Event>,
    /// Installer phases entered.
    pub phases: Vec<PhaseMark>,
    /// Healing actions applied after this attempt.
    pub healing_actions_applied: Vec<HealingAction>,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Installer exit status, if it exited.
    pub exit_code: Option<i32>,
    /// Wall-clock duration.
    pub duration_seconds: f64,
    /// Raw installer output. Persisted separately in the profile log.
    #[serde(skip)]
    pub raw_log: Vec<String>,
}

impl AttemptRecord {
    fn new(profile: &str, attempt_number: u32) -> Self {
        Self {
            profile: profile.to_string(),
            attempt_number,
            started_at: Utc::now(),
            events: Vec::new(),
            phases: Vec::new(),
            healing_actions_applied: Vec::new(),
            outcome: AttemptOutcome::Failed,
            exit_code: None,
            duration_seconds: 0.0,
            raw_log: Vec::new(),
        }
    }

    /// Returns the error that ended the attempt, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.is_error())
    }
}

/// Everything known about one profile once it is done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileResult {
    /// Profile name.
    pub profile: String,
    /// Verdict.
    pub final_outcome: ProfileOutcome,
    /// Install attempts in order.
    pub attempts: Vec<AttemptRecord>,
    /// Wall-clock duration of the whole profile.
    pub total_duration_seconds: f64,
    /// Raw installer log.
    pub log_path: PathBuf,
    /// State the run failed in.
    #[serde(default)]
    pub failed_in: Option<RunnerState>,
    /// Why the profile failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Post-install check results.
    #[serde(default)]
    pub checks: Vec<CheckResult>,
    /// Soft check failures.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ProfileResult {
    /// A profile that failed before its runner started.
    #[must_use]
    pub fn not_started(profile: &str, log_path: PathBuf, error: &SupervisorError) -> Self {
        Self {
            profile: profile.to_string(),
            final_outcome: ProfileOutcome::Failed,
            attempts: Vec::new(),
            total_duration_seconds: 0.0,
            log_path,
            failed_in: Some(RunnerState::Preparing),
            error: Some(error.to_string()),
            checks: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Returns true if the profile passed.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.final_outcome == ProfileOutcome::Succeeded
    }

    /// Returns the number of healing actions applied across attempts.
    #[must_use]
    pub fn healing_count(&self) -> usize {
        self.attempts
            .iter()
            .map(|a| a.healing_actions_applied.len())
            .sum()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Profile runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Install command template.
    pub install_command: String,
    /// Local configuration tree deployed into the VM.
    pub config_source: PathBuf,
    /// Directory of the configuration tree inside the VM.
    pub remote_config_dir: String,
    /// Where per-profile stages are created.
    pub work_dir: PathBuf,
    /// Where raw installer logs are written.
    pub log_dir: PathBuf,
    /// Attempts allowed per profile, including the first.
    pub max_attempts: u32,
    /// Actions below this confidence are never applied.
    pub confidence_floor: f64,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
    /// Reboot command run before verification. `None` verifies in place.
    pub reboot_command: Option<String>,
    /// Pause between issuing the reboot and probing again.
    pub reboot_settle: Duration,
    /// Time allowed for the installed system to come up.
    pub reboot_timeout: Duration,
    /// Credentials for the installed system. Defaults to the executor's.
    pub verify_credentials: Option<Credentials>,
    /// Per-profile definitions. Unlisted profiles use the built-ins.
    pub profiles: BTreeMap<String, ProfileSpec>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            install_command: DEFAULT_INSTALL_COMMAND.to_string(),
            config_source: PathBuf::from("."),
            remote_config_dir: DEFAULT_REMOTE_CONFIG_DIR.to_string(),
            work_dir: std::env::temp_dir().join("nixtest"),
            log_dir: PathBuf::from("logs"),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
            reboot_command: Some(DEFAULT_REBOOT_COMMAND.to_string()),
            reboot_settle: Duration::from_secs(DEFAULT_REBOOT_SETTLE_SECS),
            reboot_timeout: Duration::from_secs(DEFAULT_REBOOT_TIMEOUT_SECS),
            verify_credentials: None,
            profiles: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    /// Returns the definition of a profile.
    #[must_use]
    pub fn profile(&self, name: &str) -> ProfileSpec {
        self.profiles
            .get(name)
            .cloned()
            .unwrap_or_else(|| ProfileSpec::builtin(name))
    }

    /// Renders the install command for a profile.
    #[must_use]
    pub fn install_command_for(&self, spec: &ProfileSpec) -> String {
        spec.install_command
            .as_deref()
            .unwrap_or(&self.install_command)
            .replace("{profile}", &shell_quote(&spec.name))
            .replace("{config_dir}", &self.remote_config_dir)
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Drives profiles through install, heal and verify.
pub struct ProfileRunner {
    vm: Arc<VmLifecycleManager>,
    executor: Arc<RemoteExecutor>,
    healer: Arc<HealingEngine>,
    config: RunnerConfig,
    bus: EventBus,
}

struct StageFailure {
    state: RunnerState,
    error: SupervisorError,
}

fn failed_in(state: RunnerState) -> impl FnOnce(SupervisorError) -> StageFailure {
    move |error| StageFailure { state, error }
}

enum AttemptEnd {
    Completed,
    Errored(Event),
    Interrupted,
}

enum Step {
    Cancelled,
    TimedOut,
    Line(Option<String>),
    Exited(Result<i32>),
}

struct ProfileRun<'a> {
    profile: &'a str,
    spec: ProfileSpec,
    state: RunnerState,
    log: RawLog,
    attempts: Vec<AttemptRecord>,
    checks: Vec<CheckResult>,
    warnings: Vec<String>,
}

impl ProfileRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        vm: Arc<VmLifecycleManager>,
        executor: Arc<RemoteExecutor>,
        healer: Arc<HealingEngine>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            vm,
            executor,
            healer,
            config,
            bus: EventBus::new(),
        }
    }

    /// Publishes progress on `bus` instead of a private one.
    #[must_use]
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Returns the event bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Returns the raw log path of a profile in a run.
    #[must_use]
    pub fn log_path(&self, profile: &str, run_id: &str) -> PathBuf {
        self.config.log_dir.join(format!("{profile}-{run_id}.log"))
    }

    /// Runs one profile on `vm` and returns its result.
    ///
    /// Never fails: every error ends up in the result. Cancelling `cancel`
    /// abandons the current stage and yields a failed result.
    pub async fn run(
        &self,
        profile: &str,
        run_id: &str,
        vm: &mut VmHandle,
        cancel: &CancellationToken,
    ) -> ProfileResult {
        let started = Instant::now();
        let log_path = self.log_path(profile, run_id);
        tracing::info!(profile, vm = %vm.id, "Starting profile test");

        let mut run = ProfileRun {
            profile,
            spec: self.config.profile(profile),
            state: RunnerState::Preparing,
            log: RawLog::open(log_path.clone()).await,
            attempts: Vec::new(),
            checks: Vec::new(),
            warnings: Vec::new(),
        };

        let outcome = self.drive(&mut run, run_id, vm, cancel).await;

        let (final_outcome, error, failed_state) = match outcome {
            Ok(()) => (ProfileOutcome::Succeeded, None, None),
            Err(failure) => {
                tracing::warn!(
                    profile,
                    state = failure.state.as_str(),
                    "Profile failed: {}",
                    failure.error
                );
                run.log
                    .write(&format!("===== failed while {}: {} =====", failure.state.as_str(), failure.error))
                    .await;
                (
                    ProfileOutcome::Failed,
                    Some(failure.error.to_string()),
                    Some(failure.state),
                )
            }
        };

        let terminal = match final_outcome {
            ProfileOutcome::Succeeded => RunnerState::Succeeded,
            ProfileOutcome::Failed => RunnerState::Failed,
        };
        self.enter(&mut run, terminal);
        run.log.flush().await;
        self.bus.publish(MonitorEvent::Finished {
            profile: profile.to_string(),
            outcome: final_outcome,
        });

        let result = ProfileResult {
            profile: profile.to_string(),
            final_outcome,
            attempts: run.attempts,
            total_duration_seconds: started.elapsed().as_secs_f64(),
            log_path,
            failed_in: failed_state,
            error,
            checks: run.checks,
            warnings: run.warnings,
        };
        tracing::info!(
            profile,
            outcome = ?result.final_outcome,
            attempts = result.attempts.len(),
            healed = result.healing_count(),
            duration_secs = result.total_duration_seconds,
            "Profile test finished"
        );
        result
    }

    async fn drive(
        &self,
        run: &mut ProfileRun<'_>,
        run_id: &str,
        vm: &mut VmHandle,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), StageFailure> {
        self.enter(run, RunnerState::Preparing);
        guarded(cancel, self.vm.revert_to_clean(vm))
            .await
            .map_err(failed_in(RunnerState::Preparing))?;
        guarded(cancel, self.vm.start(vm))
            .await
            .map_err(failed_in(RunnerState::Preparing))?;

        self.enter(run, RunnerState::Deploying);
        let config = self
            .deploy(run.profile, run_id, vm, cancel)
            .await
            .map_err(failed_in(RunnerState::Deploying))?;

        let command = self.config.install_command_for(&run.spec);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt_number = 0;

        loop {
            attempt_number += 1;
            self.enter(run, RunnerState::Installing);

            let mut record = AttemptRecord::new(run.profile, attempt_number);
            let started = Instant::now();
            let end = self.run_attempt(run, &mut record, vm, &command, cancel).await;
            record.duration_seconds = started.elapsed().as_secs_f64();

            let error_event = match end {
                AttemptEnd::Completed => {
                    record.outcome = AttemptOutcome::Success;
                    run.attempts.push(record);
                    break;
                }
                AttemptEnd::Interrupted => {
                    run.attempts.push(record);
                    return Err(failed_in(RunnerState::Installing)(SupervisorError::Interrupted));
                }
                AttemptEnd::Errored(event) => event,
            };

            self.enter(run, RunnerState::Error);
            if attempt_number >= max_attempts {
                run.attempts.push(record);
                return Err(failed_in(RunnerState::Error)(SupervisorError::HealingExhausted {
                    attempts: attempt_number,
                    last_error: error_event.detail,
                }));
            }

            self.enter(run, RunnerState::Healing);
            let healed = self
                .heal(run, &mut record, &error_event, vm, &config, cancel)
                .await;
            match healed {
                Ok(true) => {
                    record.outcome = AttemptOutcome::Healed;
                    run.attempts.push(record);
                }
                Ok(false) => {
                    run.attempts.push(record);
                    return Err(failed_in(RunnerState::Healing)(SupervisorError::installation(
                        error_event,
                    )));
                }
                Err(e) => {
                    run.attempts.push(record);
                    return Err(failed_in(RunnerState::Healing)(e));
                }
            }
        }

        self.enter(run, RunnerState::Verifying);
        self.verify(run, vm, cancel)
            .await
            .map_err(failed_in(RunnerState::Verifying))
    }

    fn enter(&self, run: &mut ProfileRun<'_>, state: RunnerState) {
        tracing::debug!(
            profile = run.profile,
            from = run.state.as_str(),
            to = state.as_str(),
            "Runner state change"
        );
        run.state = state;
        self.bus.publish(MonitorEvent::StateChanged {
            profile: run.profile.to_string(),
            state,
        });
    }

    async fn deploy(
        &self,
        profile: &str,
        run_id: &str,
        vm: &VmHandle,
        cancel: &CancellationToken,
    ) -> Result<DeployedConfig> {
        let source = self.config.config_source.clone();
        let stage_dir = self.config.work_dir.join(run_id).join(profile);
        let remote_dir = self.config.remote_config_dir.clone();
        let config = tokio::task::spawn_blocking(move || {
            DeployedConfig::stage(&source, stage_dir, remote_dir)
        })
        .await
        .map_err(|e| SupervisorError::Deployment(format!("staging task failed: {e}")))??;

        tracing::info!(profile, remote = config.remote_root(), "Deploying configuration tree");
        guarded(
            cancel,
            self.executor
                .upload(vm, config.local_root(), config.remote_root()),
        )
        .await
        .map_err(|e| match e {
            SupervisorError::Interrupted | SupervisorError::Deployment(_) => e,
            other => SupervisorError::Deployment(other.to_string()),
        })?;

        Ok(config)
    }

    async fn run_attempt(
        &self,
        run: &mut ProfileRun<'_>,
        record: &mut AttemptRecord,
        vm: &VmHandle,
        command: &str,
        cancel: &CancellationToken,
    ) -> AttemptEnd {
        tracing::info!(
            profile = run.profile,
            attempt = record.attempt_number,
            "Running installer"
        );
        run.log
            .write(&format!(
                "===== attempt {} at {} =====",
                record.attempt_number,
                record.started_at.to_rfc3339()
            ))
            .await;

        let mut stream = match guarded(cancel, self.executor.execute(vm, command)).await {
            Ok(stream) => stream,
            Err(SupervisorError::Interrupted) => return AttemptEnd::Interrupted,
            Err(e) => {
                let event = self.synthesize(run, record, CONNECTION_LOST_KEY, format!("connection lost: {e}"));
                return AttemptEnd::Errored(event);
            }
        };

        let deadline = tokio::time::sleep(self.config.attempt_timeout);
        tokio::pin!(deadline);
        let mut output_ended = false;

        loop {
            let step = if output_ended {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Step::Cancelled,
                    () = &mut deadline => Step::TimedOut,
                    status = stream.exit_status() => Step::Exited(status),
                }
            } else {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Step::Cancelled,
                    () = &mut deadline => Step::TimedOut,
                    line = stream.next_line() => Step::Line(line),
                }
            };

            match step {
                Step::Cancelled => {
                    stream.abandon().await;
                    return AttemptEnd::Interrupted;
                }
                Step::TimedOut => {
                    stream.abandon().await;
                    let detail = format!(
                        "installer did not finish within {:?}",
                        self.config.attempt_timeout
                    );
                    return AttemptEnd::Errored(self.synthesize(run, record, TIMEOUT_KEY, detail));
                }
                Step::Line(Some(line)) => {
                    run.log.write(&line).await;
                    let event = classify(&line);
                    record.raw_log.push(line);

                    if let Some(event) = event {
                        let is_error = event.is_error();
                        self.observe(run.profile, record, event.clone());
                        if is_error {
                            stream.abandon().await;
                            return AttemptEnd::Errored(event);
                        }
                    }
                }
                Step::Line(None) => output_ended = true,
                Step::Exited(status) => {
                    stream.abandon().await;
                    return match status {
                        Ok(0) => {
                            record.exit_code = Some(0);
                            AttemptEnd::Completed
                        }
                        Ok(code) => {
                            record.exit_code = Some(code);
                            let detail = format!("installer exited with status {code}");
                            AttemptEnd::Errored(self.synthesize(run, record, EXIT_STATUS_KEY, detail))
                        }
                        Err(SupervisorError::ConnectionLost(reason)) => {
                            let detail = format!("connection lost: {reason}");
                            AttemptEnd::Errored(self.synthesize(run, record, CONNECTION_LOST_KEY, detail))
                        }
                        Err(e) => {
                            let detail = format!("connection lost: {e}");
                            AttemptEnd::Errored(self.synthesize(run, record, CONNECTION_LOST_KEY, detail))
                        }
                    };
                }
            }
        }
    }

    /// Records an error the supervisor observed rather than the installer.
    fn synthesize(
        &self,
        run: &ProfileRun<'_>,
        record: &mut AttemptRecord,
        key: &str,
        detail: String,
    ) -> Event {
        let event = Event::new(EventKind::Error, key, detail);
        self.observe(run.profile, record, event.clone());
        event
    }

    fn observe(&self, profile: &str, record: &mut AttemptRecord, event: Event) {
        let attempt = record.attempt_number;
        match event.kind {
            EventKind::Phase => {
                tracing::info!(profile, attempt, phase = %event.detail, "Installer phase");
                record.phases.push(PhaseMark {
                    phase: event.detail.clone(),
                    started_at: event.timestamp,
                });
            }
            EventKind::Success => {
                tracing::info!(profile, attempt, key = %event.key, "Installer: {}", event.detail);
            }
            EventKind::Error => {
                tracing::warn!(profile, attempt, key = %event.key, "Installer error: {}", event.detail);
            }
            EventKind::Warning => {
                tracing::warn!(profile, attempt, key = %event.key, "Installer warning: {}", event.detail);
            }
            EventKind::Context | EventKind::Progress | EventKind::Metric => {
                tracing::debug!(profile, attempt, kind = %event.kind, key = %event.key, "{}", event.detail);
            }
        }

        self.bus.publish(MonitorEvent::Stream {
            profile: profile.to_string(),
            attempt,
            event: event.clone(),
        });
        record.events.push(event);
    }

    async fn heal(
        &self,
        run: &mut ProfileRun<'_>,
        record: &mut AttemptRecord,
        error: &Event,
        vm: &VmHandle,
        config: &DeployedConfig,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let category = HealingEngine::categorize(&error.detail);
        let proposals = self.healer.propose(error, &record.events);
        tracing::info!(
            profile = run.profile,
            attempt = record.attempt_number,
            category = category.as_str(),
            proposals = proposals.len(),
            "Healing '{}'",
            error.detail
        );

        for action in proposals {
            if action.confidence() < self.config.confidence_floor {
                tracing::debug!(
                    action = action.name(),
                    confidence = action.confidence(),
                    "Below confidence floor, skipping"
                );
                continue;
            }

            let outcome = guarded(cancel, async {
                Ok(self.healer.apply(&action, vm, config).await)
            })
            .await?;

            run.log
                .write(&format!(
                    "----- healing {} (confidence {:.2}): {} -----",
                    action.name(),
                    action.confidence(),
                    outcome.side_effect_description
                ))
                .await;
            self.bus.publish(MonitorEvent::Healing {
                profile: run.profile.to_string(),
                attempt: record.attempt_number,
                action: action.name().to_string(),
                confidence: action.confidence(),
                applied: outcome.applied,
            });

            if outcome.applied {
                record.healing_actions_applied.push(action);
                return Ok(true);
            }
        }

        tracing::warn!(profile = run.profile, "No healing action could be applied");
        Ok(false)
    }

    async fn verify(
        &self,
        run: &mut ProfileRun<'_>,
        vm: &mut VmHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(reboot) = &self.config.reboot_command {
            tracing::info!(profile = run.profile, vm = %vm.id, "Rebooting into installed system");
            match guarded(cancel, self.executor.run(vm, reboot)).await {
                Err(SupervisorError::Interrupted) => return Err(SupervisorError::Interrupted),
                Err(e) => tracing::debug!("Reboot command ended: {}", e),
                Ok(output) => tracing::debug!(exit_code = output.exit_code, "Reboot command ended"),
            }

            let settle = self.config.reboot_settle;
            guarded(cancel, async {
                tokio::time::sleep(settle).await;
                Ok(())
            })
            .await?;

            guarded(cancel, self.vm.wait_reachable(vm, self.config.reboot_timeout))
                .await
                .map_err(|e| match e {
                    SupervisorError::Interrupted => e,
                    other => SupervisorError::Verification(format!(
                        "installed system did not come back: {other}"
                    )),
                })?;
        }

        let credentials = self
            .config
            .verify_credentials
            .clone()
            .unwrap_or_else(|| self.executor.credentials().clone());

        let mut hard_failures = Vec::new();
        for check in &run.spec.checks {
            let description = check.check.describe();
            let command = check.check.command();

            let result = match guarded(cancel, self.executor.run_as(vm, &credentials, &command)).await {
                Err(SupervisorError::Interrupted) => return Err(SupervisorError::Interrupted),
                Ok(output) => CheckResult {
                    check: description,
                    severity: check.severity,
                    passed: check.check.evaluate(&output),
                    detail: output.lines.join("\n"),
                },
                Err(e) => CheckResult {
                    check: description,
                    severity: check.severity,
                    passed: false,
                    detail: e.to_string(),
                },
            };

            self.bus.publish(MonitorEvent::Check {
                profile: run.profile.to_string(),
                check: result.check.clone(),
                passed: result.passed,
            });
            run.log
                .write(&format!(
                    "----- check '{}': {} -----",
                    result.check,
                    if result.passed { "passed" } else { "FAILED" }
                ))
                .await;

            if !result.passed {
                match result.severity {
                    CheckSeverity::Hard => {
                        tracing::warn!(profile = run.profile, check = %result.check, "Check failed");
                        hard_failures.push(result.check.clone());
                    }
                    CheckSeverity::Soft => {
                        tracing::warn!(profile = run.profile, check = %result.check, "Soft check failed");
                        run.warnings.push(format!("check failed: {}", result.check));
                    }
                }
            }
            run.checks.push(result);
        }

        if hard_failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::Verification(format!(
                "failed checks: {}",
                hard_failures.join(", ")
            )))
        }
    }
}

/// Runs `operation` unless `cancel` fires first.
async fn guarded<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SupervisorError::Interrupted),
        result = operation => result,
    }
}

// =============================================================================
// Raw log
// =============================================================================

/// Append-only raw installer log. Write failures disable the log.
struct RawLog {
    path: PathBuf,
    writer: Option<BufWriter<tokio::fs::File>>,
}

impl RawLog {
    async fn open(path: PathBuf) -> Self {
        let opened: std::io::Result<tokio::fs::File> = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
        }
        .await;

        let writer = match opened {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Cannot open installer log: {}", e);
                None
            }
        };
        Self { path, writer }
    }

    async fn write(&mut self, line: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let written: std::io::Result<()> = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await
        }
        .await;

        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), "Installer log disabled: {}", e);
            self.writer = None;
        }
    }

    async fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush().await {
                tracing::warn!(path = %self.path.display(), "Cannot flush installer log: {}", e);
            }
        }
    }
}
