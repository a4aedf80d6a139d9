//! Error types for the installation supervisor.

use std::time::Duration;

use thiserror::Error;

use crate::event::Event;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Errors that can occur while supervising an installation test.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The hypervisor is unreachable or the base image is missing.
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// No pristine snapshot exists, or reverting to it failed.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// The VM did not become reachable in time.
    #[error("VM '{vm}' not reachable after {timeout:?}")]
    StartupTimeout {
        /// VM identifier.
        vm: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The remote session dropped mid-stream.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The installer reported an error.
    #[error("installation error: {}", .0.detail)]
    Installation(Box<Event>),

    /// Every permitted attempt failed.
    #[error("healing exhausted after {attempts} attempt(s): {last_error}")]
    HealingExhausted {
        /// Attempts consumed.
        attempts: u32,
        /// Detail of the error that ended the final attempt.
        last_error: String,
    },

    /// A hard post-install check failed.
    #[error("verification error: {0}")]
    Verification(String),

    /// Pushing the configuration tree to the VM failed.
    #[error("deployment error: {0}")]
    Deployment(String),

    /// A hypervisor command failed.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// The remote transport failed outside of a running stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The run was interrupted by the operator.
    #[error("interrupted")]
    Interrupted,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialisation error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SupervisorError {
    /// Creates an installation error from the triggering event.
    #[must_use]
    pub fn installation(event: Event) -> Self {
        Self::Installation(Box::new(event))
    }
}
