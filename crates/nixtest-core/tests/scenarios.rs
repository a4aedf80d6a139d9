//! End-to-end supervisor runs against the in-memory hypervisor and transport.

mod common;

use common::{profiles, Harness, Script};
use tokio_util::sync::CancellationToken;

use nixtest_core::{
    AttemptOutcome, EventKind, ExecutionMode, MonitorEvent, ProfileOutcome, RunnerState,
    SupervisorError, TestReport,
};

// ---------------------------------------------------------------------------
// Single profile
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_install_succeeds_on_first_attempt() {
    let harness = Harness::new();
    harness.transport.script("vm", Script::success());
    let runner = harness.runner();
    let mut vm = harness.ready_vm().await;

    let result = runner
        .run("vm", "run1", &mut vm, &CancellationToken::new())
        .await;

    assert_eq!(result.final_outcome, ProfileOutcome::Succeeded);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.attempts[0].outcome, AttemptOutcome::Success);
    assert_eq!(result.attempts[0].exit_code, Some(0));
    assert_eq!(result.healing_count(), 0);
    assert_eq!(result.checks.len(), 1);
    assert!(result.checks[0].passed);

    let phases: Vec<_> = result.attempts[0]
        .phases
        .iter()
        .map(|p| p.phase.as_str())
        .collect();
    assert_eq!(phases, vec!["disk_setup", "installing_system"]);

    assert_eq!(harness.hypervisor.count("revert:"), 1);
    assert_eq!(harness.transport.installs("vm"), 1);

    let log = std::fs::read_to_string(&result.log_path).unwrap();
    assert!(log.contains("::SUCCESS::installation_complete"));
}

#[tokio::test]
async fn disk_detection_failure_is_healed_and_retried() {
    let harness = Harness::new();
    harness
        .transport
        .script("vm", Script::error("DISK_DETECTION_FAILED"));
    harness.transport.script("vm", Script::success());
    let runner = harness.runner();
    let mut vm = harness.ready_vm().await;

    let result = runner
        .run("vm", "run1", &mut vm, &CancellationToken::new())
        .await;

    assert_eq!(result.final_outcome, ProfileOutcome::Succeeded);
    assert_eq!(result.attempts.len(), 2);

    let first = &result.attempts[0];
    assert_eq!(first.outcome, AttemptOutcome::Healed);
    assert_eq!(first.healing_actions_applied.len(), 1);
    assert_eq!(first.healing_actions_applied[0].name(), "manual_disk_fallback");
    assert_eq!(first.error().unwrap().detail, "DISK_DETECTION_FAILED");
    assert!(first
        .events
        .iter()
        .all(|e| e.detail != "this line is never read"));

    assert_eq!(result.attempts[1].outcome, AttemptOutcome::Success);
    assert!(result.attempts[1].healing_actions_applied.is_empty());

    // Reverted once for the profile, not once per attempt.
    assert_eq!(harness.hypervisor.count("revert:"), 1);
    assert!(harness
        .transport
        .uploads()
        .iter()
        .any(|(_, remote)| remote == "/tmp/nixos-config/disko-config.nix"));

    let journal = std::fs::read_to_string(harness.journal()).unwrap();
    assert_eq!(journal.lines().count(), 1);
    assert!(journal.contains("manual_disk_fallback"));
}

#[tokio::test]
async fn reported_disk_drives_the_disk_fix() {
    let harness = Harness::new();
    harness.transport.script(
        "vm",
        Script::run(
            &[
                "::CONTEXT::disk::/dev/sda",
                "::ERROR::No suitable target disk found",
            ],
            1,
        ),
    );
    let runner = harness.runner();
    let mut vm = harness.ready_vm().await;

    let result = runner
        .run("vm", "run1", &mut vm, &CancellationToken::new())
        .await;

    assert!(result.succeeded());
    let action = &result.attempts[0].healing_actions_applied[0];
    assert_eq!(action.name(), "fix_disk_detection");
    assert!(action.config_mutations()["disko-config.nix"].contains("/dev/sda"));
}

#[tokio::test]
async fn repeated_generic_errors_exhaust_attempts() {
    let harness = Harness::new();
    for _ in 0..3 {
        harness
            .transport
            .script("vm", Script::error("something unexpected"));
    }
    let runner = harness.runner();
    let mut vm = harness.ready_vm().await;

    let result = runner
        .run("vm", "run1", &mut vm, &CancellationToken::new())
        .await;

    assert_eq!(result.final_outcome, ProfileOutcome::Failed);
    assert_eq!(result.attempts.len(), 3);
    assert_eq!(result.attempts[0].outcome, AttemptOutcome::Healed);
    assert_eq!(result.attempts[1].outcome, AttemptOutcome::Healed);
    assert_eq!(result.attempts[2].outcome, AttemptOutcome::Failed);
    assert!(result.attempts[2].healing_actions_applied.is_empty());
    assert_eq!(result.failed_in, Some(RunnerState::Error));
    assert!(result.error.unwrap().contains("healing exhausted after 3 attempt(s)"));
    assert!(result.checks.is_empty());
    assert_eq!(harness.transport.installs("vm"), 3);
}

#[tokio::test]
async fn raising_the_floor_stops_healing() {
    let harness = Harness::new();
    harness
        .transport
        .script("vm", Script::error("something unexpected"));
    let mut config = harness.runner_config();
    config.confidence_floor = 0.6;
    let runner = harness.runner_with(config);
    let mut vm = harness.ready_vm().await;

    let result = runner
        .run("vm", "run1", &mut vm, &CancellationToken::new())
        .await;

    assert_eq!(result.final_outcome, ProfileOutcome::Failed);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.failed_in, Some(RunnerState::Healing));
    assert!(result.error.unwrap().starts_with("installation error"));
}

#[tokio::test]
async fn nonzero_exit_without_error_marker_is_an_error() {
    let harness = Harness::new();
    harness
        .transport
        .script("vm", Script::run(&["::PHASE::disk_setup"], 2));
    let runner = harness.runner();
    let mut vm = harness.ready_vm().await;

    let result = runner
        .run("vm", "run1", &mut vm, &CancellationToken::new())
        .await;

    assert!(result.succeeded());
    let error = result.attempts[0].error().unwrap();
    assert_eq!(error.kind, EventKind::Error);
    assert_eq!(error.key, "exit_status");
    assert_eq!(result.attempts[0].exit_code, Some(2));
}

#[tokio::test]
async fn unclassified_output_is_logged_verbatim_without_events() {
    let copying = "  copying path '/nix/store/9f2l1hz8-hello-2.12.1' from 'https://cache.nixos.org'...";
    let harness = Harness::new();
    harness.transport.script(
        "vm",
        Script::run(
            &[
                "::PHASE::installing_system",
                copying,
                "::SUCCESS::installation_complete",
            ],
            0,
        ),
    );
    let runner = harness.runner();
    let mut vm = harness.ready_vm().await;

    let result = runner
        .run("vm", "run1", &mut vm, &CancellationToken::new())
        .await;

    assert!(result.succeeded());
    let attempt = &result.attempts[0];
    assert_eq!(attempt.events.len(), 2);
    assert!(attempt.events.iter().all(|e| !e.detail.contains("copying path")));
    assert_eq!(attempt.raw_log[1], copying);

    let log = std::fs::read_to_string(&result.log_path).unwrap();
    assert!(log.lines().any(|line| line == copying));
}

#[tokio::test]
async fn monitor_sees_state_changes_and_stream() {
    let harness = Harness::new();
    harness.transport.script("vm", Script::success());
    let mut rx = harness.bus.subscribe();
    let runner = harness.runner();
    let mut vm = harness.ready_vm().await;

    runner
        .run("vm", "run1", &mut vm, &CancellationToken::new())
        .await;

    let mut states = Vec::new();
    let mut stream_events = 0;
    let mut finished = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            MonitorEvent::StateChanged { state, .. } => states.push(state),
            MonitorEvent::Stream { .. } => stream_events += 1,
            MonitorEvent::Finished { outcome, .. } => finished = Some(outcome),
            _ => {}
        }
    }

    assert_eq!(
        states,
        vec![
            RunnerState::Preparing,
            RunnerState::Deploying,
            RunnerState::Installing,
            RunnerState::Verifying,
            RunnerState::Succeeded,
        ]
    );
    assert_eq!(stream_events, 5);
    assert_eq!(finished, Some(ProfileOutcome::Succeeded));
}

// ---------------------------------------------------------------------------
// Whole runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_run_reports_mixed_results() {
    let harness = Harness::new();
    harness.transport.script("vm", Script::success());
    for _ in 0..3 {
        harness
            .transport
            .script("server", Script::error("something unexpected"));
    }
    let orchestrator = harness.orchestrator(ExecutionMode::Sequential);

    let report = orchestrator
        .run(&profiles(&["vm", "server"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.exit_code(), 1);
    assert!(report.results["vm"].succeeded());
    assert!(!report.results["server"].succeeded());

    // One shared VM, reverted per profile, torn down once.
    assert_eq!(harness.hypervisor.count("create:"), 1);
    assert_eq!(harness.hypervisor.count("revert:"), 2);
    assert_eq!(harness.hypervisor.count("destroy:"), 1);

    let latest = TestReport::load_latest(&harness.report_dir())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.run_id, report.run_id);
    assert_eq!(latest.summary, report.summary);
}

#[tokio::test]
async fn parallel_run_uses_one_vm_per_profile() {
    let harness = Harness::new();
    harness
        .transport
        .script("workstation", Script::error("DISK_DETECTION_FAILED"));
    let orchestrator = harness.orchestrator(ExecutionMode::Parallel);

    let report = orchestrator
        .run(
            &profiles(&["vm", "workstation", "server"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.passed, 3);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.results["workstation"].attempts.len(), 2);

    let calls = harness.hypervisor.calls();
    for profile in ["vm", "workstation", "server"] {
        let name = format!("nixos-test-vm-{profile}");
        assert!(calls.contains(&format!("create:{name}")));
        assert!(calls.contains(&format!("destroy:{name}")));
    }
}

#[tokio::test]
async fn setup_failure_aborts_sequential_run() {
    let harness = Harness::with_hypervisor(common::FakeHypervisor::unavailable());
    let orchestrator = harness.orchestrator(ExecutionMode::Sequential);

    let err = orchestrator
        .run(&profiles(&["vm"]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SupervisorError::Provisioning(_)));
}

#[tokio::test]
async fn setup_failure_fails_only_that_profile_in_parallel() {
    let harness = Harness::with_hypervisor(common::FakeHypervisor::unavailable());
    let orchestrator = harness.orchestrator(ExecutionMode::Parallel);

    let report = orchestrator
        .run(&profiles(&["vm", "server"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.failed, 2);
    assert_eq!(report.results["vm"].failed_in, Some(RunnerState::Preparing));
    assert!(report.results["vm"].attempts.is_empty());
}
