//! Live rendering of monitor events.

use colored::{Color, Colorize};
use nixtest_core::{EventKind, MonitorEvent, ProfileOutcome};
use tokio::sync::broadcast::{self, error::RecvError};

/// Prints events until the bus closes.
pub async fn run(mut rx: broadcast::Receiver<MonitorEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                println!("{}", format_event(&event));
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!("Live view skipped {} events", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

const fn kind_color(kind: EventKind) -> Color {
    match kind {
        EventKind::Phase => Color::Blue,
        EventKind::Success => Color::Green,
        EventKind::Error => Color::Red,
        EventKind::Warning => Color::Yellow,
        EventKind::Context | EventKind::Metric => Color::Cyan,
        EventKind::Progress => Color::BrightBlack,
    }
}

fn format_event(event: &MonitorEvent) -> String {
    match event {
        MonitorEvent::StateChanged { profile, state } => {
            format!("[{profile}] {}", state.as_str().dimmed())
        }
        MonitorEvent::Stream {
            profile,
            attempt,
            event,
        } => {
            let mut tag = event.kind.as_str().color(kind_color(event.kind));
            if event.is_error() {
                tag = tag.bold();
            }
            if event.key.is_empty() {
                format!("[{profile}#{attempt}] {tag} {}", event.detail)
            } else {
                format!("[{profile}#{attempt}] {tag} {}: {}", event.key, event.detail)
            }
        }
        MonitorEvent::Healing {
            profile,
            attempt,
            action,
            confidence,
            applied,
        } => {
            let verdict = if *applied {
                "applied".green()
            } else {
                "failed".red()
            };
            format!(
                "[{profile}#{attempt}] {} {action} ({confidence:.2}) {verdict}",
                "HEAL".magenta()
            )
        }
        MonitorEvent::Check {
            profile,
            check,
            passed,
        } => {
            let verdict = if *passed { "ok".green() } else { "FAILED".red() };
            format!("[{profile}] check {check}: {verdict}")
        }
        MonitorEvent::Finished { profile, outcome } => match outcome {
            ProfileOutcome::Succeeded => format!("[{profile}] {}", "PASSED".green().bold()),
            ProfileOutcome::Failed => format!("[{profile}] {}", "FAILED".red().bold()),
        },
    }
}
