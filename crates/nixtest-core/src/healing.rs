//! Self-healing for failed installation attempts.
//!
//! When the installer reports an error, the engine sorts it into an
//! [`ErrorCategory`] and proposes [`HealingAction`]s for that category,
//! highest confidence first. The runner applies eligible actions one by one
//! until one succeeds, then retries the install.
//!
//! ```text
//!   error event ──▶ categorize ──▶ templates ──▶ sort by confidence
//!                                                      │
//!                  journal ◀── apply (commands, file rewrites) ◀─┘
//! ```
//!
//! The engine keeps no state between proposals. Every action is written so
//! that applying it twice leaves the VM as applying it once.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::deploy::DeployedConfig;
use crate::event::{Event, EventKind};
use crate::remote::RemoteExecutor;
use crate::vm::VmHandle;

// =============================================================================
// Categories
// =============================================================================

/// Broad class of an installer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The installer could not find or partition the target disk.
    DiskDetection,
    /// Downloads or name resolution failed.
    Network,
    /// The live system ran short of memory.
    MemoryPressure,
    /// The live system ran out of disk space.
    DiskSpace,
    /// Anything else.
    Generic,
}

impl ErrorCategory {
    /// Returns the category name for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DiskDetection => "disk_detection",
            Self::Network => "network",
            Self::MemoryPressure => "memory_pressure",
            Self::DiskSpace => "disk_space",
            Self::Generic => "generic",
        }
    }
}

/// Signatures per category, tried in order. First match wins.
static CATEGORY_SIGNATURES: LazyLock<Vec<(ErrorCategory, Regex)>> = LazyLock::new(|| {
    [
        (ErrorCategory::DiskDetection, r"(?i)no suitable.*disk"),
        (ErrorCategory::DiskDetection, r"(?i)disk[_ ]detection"),
        (ErrorCategory::DiskDetection, r"(?i)disko.*fail"),
        (ErrorCategory::DiskDetection, r"(?i)partition(ing)?.*fail"),
        (ErrorCategory::Network, r"(?i)network.*(fail|unreachable)"),
        (ErrorCategory::Network, r"(?i)download.*fail|fail(ed)? to download"),
        (ErrorCategory::Network, r"(?i)connection.*(fail|lost|refused|reset)"),
        (ErrorCategory::Network, r"(?i)could not resolve|temporary failure in name resolution"),
        (ErrorCategory::MemoryPressure, r"(?i)out of memory|cannot allocate memory"),
        (ErrorCategory::MemoryPressure, r"(?i)memory.*(low|high|exhausted)"),
        (ErrorCategory::DiskSpace, r"(?i)no space left"),
        (ErrorCategory::DiskSpace, r"(?i)disk.*(full|usage_high)"),
        (ErrorCategory::DiskSpace, r"(?i)space.*low"),
    ]
    .into_iter()
    .map(|(category, pattern)| {
        (
            category,
            Regex::new(pattern).expect("invalid category signature"),
        )
    })
    .collect()
});

// =============================================================================
// Confidence of each template
// =============================================================================

const FIX_DISK_DETECTION: f64 = 0.9;
const MANUAL_DISK_FALLBACK: f64 = 0.7;
const RESTORE_DNS: f64 = 0.7;
const ALTERNATIVE_SUBSTITUTERS: f64 = 0.65;
const BRING_UP_INTERFACES: f64 = 0.55;
const ENABLE_EMERGENCY_SWAP: f64 = 0.6;
const COLLECT_GARBAGE: f64 = 0.55;
const CLEAN_TEMP_FILES: f64 = 0.8;
const AGGRESSIVE_STORE_GC: f64 = 0.7;
const RETRY_UNCHANGED: f64 = 0.5;

/// Disk used when no device was reported.
const FALLBACK_DISK: &str = "/dev/vda";

/// Path of the partitioning layout in the configuration tree.
const DISKO_CONFIG: &str = "disko-config.nix";

/// Path of the Nix daemon settings in the configuration tree.
const NIX_CONF: &str = "nix.conf";

// =============================================================================
// Actions
// =============================================================================

/// A candidate fix for an installer error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAction {
    name: String,
    description: String,
    confidence: f64,
    remote_commands: Vec<String>,
    config_mutations: BTreeMap<String, String>,
}

impl HealingAction {
    fn new(name: &str, description: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.to_string(),
            description: description.into(),
            confidence: confidence.clamp(0.0, 1.0),
            remote_commands: Vec::new(),
            config_mutations: BTreeMap::new(),
        }
    }

    fn command(mut self, command: impl Into<String>) -> Self {
        self.remote_commands.push(command.into());
        self
    }

    fn mutation(mut self, path: &str, content: String) -> Self {
        self.config_mutations.insert(path.to_string(), content);
        self
    }

    /// Short stable identifier.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the action does.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Likelihood of fixing the error, in `[0, 1]`.
    #[must_use]
    pub const fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Commands run in the VM, in order.
    #[must_use]
    pub fn remote_commands(&self) -> &[String] {
        &self.remote_commands
    }

    /// Whole-file replacements keyed by tree-relative path.
    #[must_use]
    pub const fn config_mutations(&self) -> &BTreeMap<String, String> {
        &self.config_mutations
    }

    /// Returns true if the action changes nothing and only asks for a retry.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.remote_commands.is_empty() && self.config_mutations.is_empty()
    }
}

/// Result of applying an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOutcome {
    /// True if every command exited zero and every file was written.
    pub applied: bool,
    /// What happened, for logs and reports.
    pub side_effect_description: String,
}

// =============================================================================
// Engine
// =============================================================================

/// Proposes and applies healing actions.
pub struct HealingEngine {
    executor: Arc<RemoteExecutor>,
    protected_dir: String,
    journal: Option<PathBuf>,
}

impl HealingEngine {
    /// Creates an engine.
    ///
    /// `protected_dir` is the VM path of the deployed configuration tree;
    /// cleanup actions never delete it.
    #[must_use]
    pub fn new(executor: Arc<RemoteExecutor>, protected_dir: impl Into<String>) -> Self {
        Self {
            executor,
            protected_dir: protected_dir.into(),
            journal: None,
        }
    }

    /// Appends a JSON line per applied action to `path`.
    #[must_use]
    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal = Some(path.into());
        self
    }

    /// Sorts an error detail into a category.
    #[must_use]
    pub fn categorize(detail: &str) -> ErrorCategory {
        CATEGORY_SIGNATURES
            .iter()
            .find(|(_, pattern)| pattern.is_match(detail))
            .map_or(ErrorCategory::Generic, |(category, _)| *category)
    }

    /// Proposes actions for `error`, highest confidence first.
    ///
    /// `context` holds the events seen earlier in the same attempt; device
    /// names reported there shape the disk actions. Never fails and has no
    /// side effects.
    #[must_use]
    pub fn propose(&self, error: &Event, context: &[Event]) -> Vec<HealingAction> {
        let category = Self::categorize(&error.detail);

        let mut actions = match category {
            ErrorCategory::DiskDetection => disk_detection_actions(context),
            ErrorCategory::Network => network_actions(),
            ErrorCategory::MemoryPressure => memory_actions(),
            ErrorCategory::DiskSpace => disk_space_actions(&self.protected_dir),
            ErrorCategory::Generic => Vec::new(),
        };
        if matches!(category, ErrorCategory::Network | ErrorCategory::Generic) {
            actions.push(retry_unchanged());
        }

        actions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        tracing::debug!(
            category = category.as_str(),
            candidates = actions.len(),
            "Proposed healing actions for '{}'",
            error.detail
        );
        actions
    }

    /// Applies an action to the VM and the deployed configuration tree.
    ///
    /// Commands run first, in order; a failing command stops the action.
    /// File rewrites replace whole files in the stage and are then uploaded.
    pub async fn apply(
        &self,
        action: &HealingAction,
        vm: &VmHandle,
        config: &DeployedConfig,
    ) -> AppliedOutcome {
        tracing::info!(
            vm = %vm.id,
            action = action.name(),
            confidence = action.confidence(),
            "Applying healing action: {}",
            action.description()
        );

        let outcome = self.apply_steps(action, vm, config).await;
        if outcome.applied {
            tracing::info!(action = action.name(), "Healing action applied");
        } else {
            tracing::warn!(
                action = action.name(),
                "Healing action failed: {}",
                outcome.side_effect_description
            );
        }

        self.record(action, &outcome).await;
        outcome
    }

    async fn apply_steps(
        &self,
        action: &HealingAction,
        vm: &VmHandle,
        config: &DeployedConfig,
    ) -> AppliedOutcome {
        let mut effects = Vec::new();

        for command in action.remote_commands() {
            match self.executor.run(vm, command).await {
                Ok(output) if output.success() => effects.push(format!("ran `{command}`")),
                Ok(output) => {
                    return failed(
                        effects,
                        format!("`{command}` exited with status {}", output.exit_code),
                    );
                }
                Err(e) => return failed(effects, format!("`{command}` failed: {e}")),
            }
        }

        for (path, content) in action.config_mutations() {
            let local = match config.replace_file(path, content) {
                Ok(local) => local,
                Err(e) => return failed(effects, format!("cannot rewrite {path}: {e}")),
            };
            let remote = config.remote_path(path);
            if let Err(e) = self.executor.upload(vm, &local, &remote).await {
                return failed(effects, format!("cannot upload {path}: {e}"));
            }
            effects.push(format!("rewrote {path}"));
        }

        if effects.is_empty() {
            effects.push("no changes, retry requested".to_string());
        }

        AppliedOutcome {
            applied: true,
            side_effect_description: effects.join("; "),
        }
    }

    async fn record(&self, action: &HealingAction, outcome: &AppliedOutcome) {
        let Some(path) = self.journal.clone() else {
            return;
        };

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "action": action.name(),
            "description": action.description(),
            "confidence": action.confidence(),
            "applied": outcome.applied,
            "effects": outcome.side_effect_description,
        });

        let journal = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            journal
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| OpenOptions::new().create(true).append(true).open(&journal))
                .and_then(|mut file| writeln!(file, "{entry}"))
        })
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)));
        if let Err(e) = written {
            tracing::warn!(journal = %path.display(), "Failed to write healing journal: {}", e);
        }
    }
}

fn failed(mut effects: Vec<String>, reason: String) -> AppliedOutcome {
    effects.push(reason);
    AppliedOutcome {
        applied: false,
        side_effect_description: effects.join("; "),
    }
}

// =============================================================================
// Templates
// =============================================================================

/// Finds the disk the installer reported, if any.
fn reported_disk(context: &[Event]) -> Option<&str> {
    context.iter().rev().find_map(|event| {
        let reports_disk = matches!(
            (event.kind, event.key.as_str()),
            (EventKind::Context, "disk") | (EventKind::Metric, "disk_device")
        );
        (reports_disk && event.detail.starts_with("/dev/")).then_some(event.detail.as_str())
    })
}

fn disk_detection_actions(context: &[Event]) -> Vec<HealingAction> {
    let mut actions = Vec::new();

    if let Some(device) = reported_disk(context) {
        actions.push(
            HealingAction::new(
                "fix_disk_detection",
                format!("Point {DISKO_CONFIG} at detected disk {device}"),
                FIX_DISK_DETECTION,
            )
            .mutation(DISKO_CONFIG, btrfs_layout(device)),
        );
    }

    actions.push(
        HealingAction::new(
            "manual_disk_fallback",
            format!("Replace {DISKO_CONFIG} with a plain ext4 layout on {FALLBACK_DISK}"),
            MANUAL_DISK_FALLBACK,
        )
        .mutation(DISKO_CONFIG, ext4_layout(FALLBACK_DISK)),
    );

    actions
}

fn network_actions() -> Vec<HealingAction> {
    vec![
        HealingAction::new(
            "restore_dns",
            "Point the resolver at public DNS servers",
            RESTORE_DNS,
        )
        .command("printf 'nameserver 1.1.1.1\\nnameserver 8.8.8.8\\n' | sudo tee /etc/resolv.conf >/dev/null"),
        HealingAction::new(
            "alternative_substituters",
            "Add mirror binary caches and longer download timeouts",
            ALTERNATIVE_SUBSTITUTERS,
        )
        .mutation(NIX_CONF, substituters_conf()),
        HealingAction::new(
            "bring_up_interfaces",
            "Bring every non-loopback interface up",
            BRING_UP_INTERFACES,
        )
        .command(
            "for dev in $(ls /sys/class/net); do [ \"$dev\" = lo ] || sudo ip link set \"$dev\" up; done",
        ),
    ]
}

fn memory_actions() -> Vec<HealingAction> {
    vec![
        HealingAction::new(
            "enable_emergency_swap",
            "Add a 1 GiB swap file",
            ENABLE_EMERGENCY_SWAP,
        )
        .command(
            "sudo sh -c 'swapon --show=NAME --noheadings | grep -qx /tmp/emergency.swap || \
             { dd if=/dev/zero of=/tmp/emergency.swap bs=1M count=1024 && chmod 600 /tmp/emergency.swap \
             && mkswap /tmp/emergency.swap && swapon /tmp/emergency.swap; }'",
        ),
        HealingAction::new(
            "collect_garbage",
            "Free memory held by the live system's Nix store",
            COLLECT_GARBAGE,
        )
        .command("sudo nix-collect-garbage -d")
        .command("sudo sync"),
    ]
}

fn disk_space_actions(protected_dir: &str) -> Vec<HealingAction> {
    vec![
        HealingAction::new(
            "clean_temp_files",
            "Remove temporary files and shrink the journal",
            CLEAN_TEMP_FILES,
        )
        .command(format!(
            "sudo find /tmp -mindepth 1 -maxdepth 1 ! -path '{protected_dir}' -exec rm -rf {{}} +"
        ))
        .command("sudo journalctl --vacuum-size=50M"),
        HealingAction::new(
            "aggressive_store_gc",
            "Delete every unreferenced store path and deduplicate the store",
            AGGRESSIVE_STORE_GC,
        )
        .command("sudo nix-collect-garbage -d")
        .command("sudo nix-store --optimise"),
    ]
}

fn retry_unchanged() -> HealingAction {
    HealingAction::new("retry_unchanged", "Retry the installation as is", RETRY_UNCHANGED)
}

fn btrfs_layout(device: &str) -> String {
    format!(
        r#"{{
  disko.devices.disk.main = {{
    type = "disk";
    device = "{device}";
    content = {{
      type = "gpt";
      partitions = {{
        ESP = {{
          size = "1G";
          type = "EF00";
          content = {{
            type = "filesystem";
            format = "vfat";
            mountpoint = "/boot";
          }};
        }};
        root = {{
          size = "100%";
          content = {{
            type = "btrfs";
            extraArgs = [ "-f" ];
            mountOptions = [ "compress=zstd" "noatime" ];
            subvolumes = {{
              "@" = {{ mountpoint = "/"; }};
              "@home" = {{ mountpoint = "/home"; }};
              "@nix" = {{ mountpoint = "/nix"; }};
              "@log" = {{ mountpoint = "/var/log"; }};
            }};
          }};
        }};
      }};
    }};
  }};
}}
"#
    )
}

fn ext4_layout(device: &str) -> String {
    format!(
        r#"{{
  disko.devices.disk.main = {{
    type = "disk";
    device = "{device}";
    content = {{
      type = "gpt";
      partitions = {{
        ESP = {{
          size = "1G";
          type = "EF00";
          content = {{
            type = "filesystem";
            format = "vfat";
            mountpoint = "/boot";
          }};
        }};
        root = {{
          size = "100%";
          content = {{
            type = "filesystem";
            format = "ext4";
            mountpoint = "/";
          }};
        }};
      }};
    }};
  }};
}}
"#
    )
}

fn substituters_conf() -> String {
    "substituters = https://cache.nixos.org https://nix-community.cachix.org https://cache.garnix.io\n\
     trusted-public-keys = cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY= \
     nix-community.cachix.org-1:mB9FSh9qf2dCimDSUo8Zy7bkq5CX+/rkCWyvRCYg3Fs= \
     cache.garnix.io:CTFPyKSLcx5RMJKfLo5EEPUObbA78b0YQ2DTCJXqr9g=\n\
     connect-timeout = 30\n\
     download-attempts = 5\n"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::classify;
    use crate::remote::Credentials;
    use crate::remote::{RemoteExit, RemoteProcess, Session, Transport};
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, oneshot};

    /// Transport that records commands and uploads; commands containing
    /// `fail_on` exit 1.
    #[derive(Default)]
    struct RecordingTransport {
        commands: Arc<Mutex<Vec<String>>>,
        uploads: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    struct RecordingSession {
        commands: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Session for RecordingSession {
        async fn run(&mut self, command: &str) -> crate::Result<RemoteProcess> {
            self.commands.lock().unwrap().push(command.to_string());
            let (_line_tx, lines) = mpsc::channel(1);
            let (exit_tx, exit) = oneshot::channel();
            let code = i32::from(self.fail_on.is_some_and(|f| command.contains(f)));
            exit_tx.send(RemoteExit::Exited(code)).unwrap();
            Ok(RemoteProcess { lines, exit })
        }

        async fn close(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn open_session(
            &self,
            _addr: IpAddr,
            _credentials: &Credentials,
        ) -> crate::Result<Box<dyn Session>> {
            Ok(Box::new(RecordingSession {
                commands: Arc::clone(&self.commands),
                fail_on: self.fail_on,
            }))
        }

        async fn upload(
            &self,
            _addr: IpAddr,
            _credentials: &Credentials,
            _local: &Path,
            remote: &str,
        ) -> crate::Result<()> {
            self.uploads.lock().unwrap().push(remote.to_string());
            Ok(())
        }
    }

    fn engine(transport: Arc<RecordingTransport>) -> HealingEngine {
        let executor = RemoteExecutor::new(transport, Credentials::default());
        HealingEngine::new(Arc::new(executor), "/tmp/nixos-config")
    }

    fn running_vm() -> VmHandle {
        let mut vm = VmHandle::new("nixos-test-vm");
        vm.ip_address = Some(IpAddr::V4(Ipv4Addr::new(192, 168, 122, 10)));
        vm
    }

    fn names(actions: &[HealingAction]) -> Vec<&str> {
        actions.iter().map(HealingAction::name).collect()
    }

    #[test]
    fn test_categorize() {
        let cases = [
            ("DISK_DETECTION_FAILED", ErrorCategory::DiskDetection),
            ("No suitable target disk found", ErrorCategory::DiskDetection),
            ("disko: partitioning failed", ErrorCategory::DiskDetection),
            ("NETWORK_CONNECTIVITY_FAILED", ErrorCategory::Network),
            ("Failed to download nixpkgs", ErrorCategory::Network),
            ("connection lost: broken pipe", ErrorCategory::Network),
            ("Out of memory: Killed process 812", ErrorCategory::MemoryPressure),
            ("MEMORY_USAGE_HIGH", ErrorCategory::MemoryPressure),
            ("No space left on device", ErrorCategory::DiskSpace),
            ("DISK_USAGE_HIGH", ErrorCategory::DiskSpace),
            ("something odd happened", ErrorCategory::Generic),
        ];
        for (detail, expected) in cases {
            assert_eq!(HealingEngine::categorize(detail), expected, "{detail}");
        }
    }

    #[test]
    fn test_disk_detection_outranks_network() {
        assert_eq!(
            HealingEngine::categorize("disk detection failed: network unreachable"),
            ErrorCategory::DiskDetection
        );
    }

    #[test]
    fn test_disk_proposals_use_reported_device() {
        let engine = engine(Arc::default());
        let context = vec![classify("::CONTEXT::disk::/dev/sda").unwrap()];
        let error = classify("::ERROR::DISK_DETECTION_FAILED").unwrap();

        let actions = engine.propose(&error, &context);
        assert_eq!(names(&actions), vec!["fix_disk_detection", "manual_disk_fallback"]);
        assert!(actions[0].config_mutations()[DISKO_CONFIG].contains("device = \"/dev/sda\";"));
        assert!(actions[1].config_mutations()[DISKO_CONFIG].contains("format = \"ext4\";"));
    }

    #[test]
    fn test_disk_proposals_without_device() {
        let engine = engine(Arc::default());
        let error = classify("::ERROR::DISK_DETECTION_FAILED").unwrap();

        let actions = engine.propose(&error, &[]);
        assert_eq!(names(&actions), vec!["manual_disk_fallback"]);
    }

    #[test]
    fn test_proposals_are_sorted_by_confidence() {
        let engine = engine(Arc::default());
        let error = classify("::ERROR::NETWORK_CONNECTIVITY_FAILED").unwrap();

        let actions = engine.propose(&error, &[]);
        assert_eq!(
            names(&actions),
            vec![
                "restore_dns",
                "alternative_substituters",
                "bring_up_interfaces",
                "retry_unchanged"
            ]
        );
        assert!(actions.windows(2).all(|w| w[0].confidence() >= w[1].confidence()));
    }

    #[test]
    fn test_generic_error_gets_retry_only() {
        let engine = engine(Arc::default());
        let error = Event::new(EventKind::Error, "", "mystery failure");

        let actions = engine.propose(&error, &[]);
        assert_eq!(names(&actions), vec!["retry_unchanged"]);
        assert!(actions[0].is_noop());
        assert!((actions[0].confidence() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cleanup_spares_deployed_tree() {
        let engine = engine(Arc::default());
        let error = classify("::ERROR::DISK_USAGE_HIGH").unwrap();

        let actions = engine.propose(&error, &[]);
        assert_eq!(actions[0].name(), "clean_temp_files");
        assert!(actions[0].remote_commands()[0].contains("! -path '/tmp/nixos-config'"));
    }

    #[tokio::test]
    async fn test_apply_runs_commands_and_journals() {
        let transport = Arc::new(RecordingTransport::default());
        let journal_dir = TempDir::new().unwrap();
        let journal = journal_dir.path().join("self_healing.jsonl");
        let engine = engine(Arc::clone(&transport)).with_journal(&journal);
        let stage = TempDir::new().unwrap();
        let config = DeployedConfig::new(stage.path(), "/tmp/nixos-config");

        let error = classify("::ERROR::MEMORY_USAGE_HIGH").unwrap();
        let action = &engine.propose(&error, &[])[0];
        let outcome = engine.apply(action, &running_vm(), &config).await;

        assert!(outcome.applied);
        assert_eq!(transport.commands.lock().unwrap().len(), 1);

        let lines = std::fs::read_to_string(&journal).unwrap();
        let entry: serde_json::Value = serde_json::from_str(lines.trim()).unwrap();
        assert_eq!(entry["action"], "enable_emergency_swap");
        assert_eq!(entry["applied"], true);
    }

    #[tokio::test]
    async fn test_apply_stops_at_failing_command() {
        let transport = Arc::new(RecordingTransport {
            fail_on: Some("nix-collect-garbage"),
            ..RecordingTransport::default()
        });
        let engine = engine(Arc::clone(&transport));
        let stage = TempDir::new().unwrap();
        let config = DeployedConfig::new(stage.path(), "/tmp/nixos-config");

        let error = classify("::ERROR::MEMORY_USAGE_HIGH").unwrap();
        let actions = engine.propose(&error, &[]);
        let outcome = engine.apply(&actions[1], &running_vm(), &config).await;

        assert!(!outcome.applied);
        assert_eq!(transport.commands.lock().unwrap().len(), 1);
        assert!(outcome.side_effect_description.contains("exited with status 1"));
    }

    #[tokio::test]
    async fn test_apply_twice_leaves_same_tree() {
        let transport = Arc::new(RecordingTransport::default());
        let engine = engine(Arc::clone(&transport));
        let stage = TempDir::new().unwrap();
        let config = DeployedConfig::new(stage.path(), "/tmp/nixos-config");

        let context = vec![classify("::METRIC::disk_device::/dev/nvme0n1").unwrap()];
        let error = classify("::ERROR::DISK_DETECTION_FAILED").unwrap();
        let action = engine.propose(&error, &context).remove(0);

        assert!(engine.apply(&action, &running_vm(), &config).await.applied);
        let first = config.read_file(DISKO_CONFIG).unwrap();
        assert!(engine.apply(&action, &running_vm(), &config).await.applied);
        let second = config.read_file(DISKO_CONFIG).unwrap();

        assert_eq!(first, second);
        assert!(first.contains("/dev/nvme0n1"));
        assert_eq!(
            *transport.uploads.lock().unwrap(),
            vec![
                "/tmp/nixos-config/disko-config.nix".to_string(),
                "/tmp/nixos-config/disko-config.nix".to_string()
            ]
        );
    }
}
