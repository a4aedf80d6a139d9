//! Live monitoring of test runs.
//!
//! Runners publish what they see; front ends subscribe and render it. Nothing
//! in the supervisor depends on anyone listening.

use tokio::sync::broadcast;

use crate::event::Event;
use crate::runner::{ProfileOutcome, RunnerState};

/// Something worth showing an operator while a test runs.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A runner moved to a new state.
    StateChanged {
        /// Profile under test.
        profile: String,
        /// New state.
        state: RunnerState,
    },
    /// A classified line from the installer.
    Stream {
        /// Profile under test.
        profile: String,
        /// 1-based attempt number.
        attempt: u32,
        /// The classified event.
        event: Event,
    },
    /// A healing action was applied, successfully or not.
    Healing {
        /// Profile under test.
        profile: String,
        /// Attempt that triggered healing.
        attempt: u32,
        /// Action name.
        action: String,
        /// Action confidence.
        confidence: f64,
        /// Whether every step of the action succeeded.
        applied: bool,
    },
    /// A post-install check finished.
    Check {
        /// Profile under test.
        profile: String,
        /// Check description.
        check: String,
        /// Whether it passed.
        passed: bool,
    },
    /// A profile reached a terminal state.
    Finished {
        /// Profile under test.
        profile: String,
        /// Final outcome.
        outcome: ProfileOutcome,
    },
}

/// Broadcast bus for monitor events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    /// Creates a new event bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    /// Publishes an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: MonitorEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
