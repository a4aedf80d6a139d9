//! # nixtest-core
//!
//! Unattended supervision of NixOS installation tests.
//!
//! This crate drives an installer inside a throwaway VM, watches its output,
//! repairs the environment when it fails, and reports per-profile results:
//!
//! - [`classify`]: Turns installer output lines into structured [`Event`]s
//! - [`VmLifecycleManager`]: Provisions, snapshots, reverts and tears down VMs
//! - [`RemoteExecutor`]: Runs commands in the VM and streams their output
//! - [`HealingEngine`]: Proposes and applies fixes for installer errors
//! - [`ProfileRunner`]: Drives one profile through install, heal, verify
//! - [`Orchestrator`]: Runs a profile list and writes the [`TestReport`]
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Orchestrator                     │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │                 ProfileRunner                  │  │
//! │  │  ┌──────────────┐ ┌────────────┐ ┌───────────┐ │  │
//! │  │  │ VmLifecycle  │ │  Remote    │ │  Healing  │ │  │
//! │  │  │   Manager    │ │  Executor  │ │  Engine   │ │  │
//! │  │  └──────┬───────┘ └─────┬──────┘ └───────────┘ │  │
//! │  └─────────┼───────────────┼──────────────────────┘  │
//! │            │               │          EventBus ──────┼──▶ front ends
//! └────────────┼───────────────┼─────────────────────────┘
//!              ▼               ▼
//!         Hypervisor       Transport
//!        (nixtest-backend: virsh, ssh)
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod deploy;
pub mod error;
pub mod event;
pub mod healing;
pub mod monitor;
pub mod orchestrator;
pub mod persistence;
pub mod profile;
pub mod remote;
pub mod report;
pub mod runner;
pub mod vm;

pub use config::SupervisorConfig;
pub use deploy::DeployedConfig;
pub use error::{Result, SupervisorError};
pub use event::{classify, Event, EventKind};
pub use healing::{AppliedOutcome, ErrorCategory, HealingAction, HealingEngine};
pub use monitor::{EventBus, MonitorEvent};
pub use orchestrator::{ExecutionMode, Orchestrator, OrchestratorConfig};
pub use persistence::{VmRecord, VmRecordStore};
pub use profile::{CheckKind, CheckResult, CheckSeverity, PostInstallCheck, ProfileSpec};
pub use remote::{
    CommandOutput, Credentials, RemoteExecutor, RemoteExit, RemoteProcess, RemoteStream, Session,
    Transport,
};
pub use report::{Summary, TestReport};
pub use runner::{
    AttemptOutcome, AttemptRecord, ProfileOutcome, ProfileResult, ProfileRunner, RunnerConfig,
    RunnerState,
};
pub use vm::{
    Hypervisor, TeardownPolicy, VmHandle, VmLease, VmLifecycleConfig, VmLifecycleManager, VmState,
};
