//! Installer output classification.
//!
//! Every line the remote installer prints goes through [`classify`]. Lines in
//! the sentinel format `::KIND::payload` (or `::KIND::key::value`) are parsed
//! directly; everything else is matched against an ordered table of fallback
//! rules where the first matching rule wins. Lines that match nothing yield no
//! event, but the runner still keeps them in the raw log.
//!
//! Classification is a pure mapping: the same line always yields the same
//! kind, key and detail.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix and separator of structured installer lines.
const SENTINEL: &str = "::";

/// Key given to sentinel lines whose tag is not a known kind.
pub const UNPARSED_KEY: &str = "unparsed";

/// Kind of a classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// The installer entered a new phase.
    Phase,
    /// A step completed successfully.
    Success,
    /// A failure that ends the current attempt.
    Error,
    /// Advisory problem; the attempt continues.
    Warning,
    /// Extra information, e.g. detected hardware.
    Context,
    /// Progress within a phase.
    Progress,
    /// A named measurement.
    Metric,
}

impl EventKind {
    /// All kinds, in tag order.
    pub const ALL: [Self; 7] = [
        Self::Phase,
        Self::Success,
        Self::Error,
        Self::Warning,
        Self::Context,
        Self::Progress,
        Self::Metric,
    ];

    /// Returns the sentinel tag for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Phase => "PHASE",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Context => "CONTEXT",
            Self::Progress => "PROGRESS",
            Self::Metric => "METRIC",
        }
    }

    /// Parses a sentinel tag, ignoring ASCII case.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(tag))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured event produced from one line of installer output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Optional key (stage name, metric name, rule name). May be empty.
    pub key: String,
    /// Payload or, for fallback matches, the full line.
    pub detail: String,
    /// When the line was classified.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    /// Returns true if this event ends the attempt's happy path.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind == EventKind::Error
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}: {}", self.kind, self.detail)
        } else {
            write!(f, "{} {}: {}", self.kind, self.key, self.detail)
        }
    }
}

/// A substring rule applied to lines without a sentinel.
struct FallbackRule {
    kind: EventKind,
    key: &'static str,
    needle: &'static str,
    /// When false, `needle` is lowercase and matched against the lowered line.
    case_sensitive: bool,
}

impl FallbackRule {
    const fn exact(kind: EventKind, key: &'static str, needle: &'static str) -> Self {
        Self {
            kind,
            key,
            needle,
            case_sensitive: true,
        }
    }

    const fn folded(kind: EventKind, key: &'static str, needle: &'static str) -> Self {
        Self {
            kind,
            key,
            needle,
            case_sensitive: false,
        }
    }

    fn matches(&self, line: &str, lowered: &str) -> bool {
        if self.case_sensitive {
            line.contains(self.needle)
        } else {
            lowered.contains(self.needle)
        }
    }
}

/// Fallback rules in priority order. First match wins.
const FALLBACK_RULES: &[FallbackRule] = &[
    // Errors
    FallbackRule::folded(EventKind::Error, "kernel_panic", "kernel panic"),
    FallbackRule::folded(EventKind::Error, "out_of_memory", "out of memory"),
    FallbackRule::exact(EventKind::Error, "error", "ERROR"),
    FallbackRule::folded(EventKind::Error, "error", "error:"),
    FallbackRule::folded(EventKind::Error, "failed", "failed"),
    FallbackRule::exact(EventKind::Error, "cannot", "Cannot "),
    // Warnings
    FallbackRule::exact(EventKind::Warning, "warning", "WARN"),
    FallbackRule::folded(EventKind::Warning, "warning", "warning:"),
    // Phase transitions
    FallbackRule::folded(
        EventKind::Success,
        "partitioning_complete",
        "partitioning complete",
    ),
    FallbackRule::folded(
        EventKind::Success,
        "filesystems_mounted",
        "filesystems mounted",
    ),
    FallbackRule::folded(
        EventKind::Success,
        "installation_complete",
        "installation completed successfully",
    ),
    // Progress
    FallbackRule::folded(
        EventKind::Progress,
        "disk_setup",
        "setting up disk partitioning",
    ),
    FallbackRule::folded(
        EventKind::Progress,
        "installing_system",
        "installing nixos configuration",
    ),
    FallbackRule::folded(
        EventKind::Progress,
        "building_configuration",
        "building configuration",
    ),
];

/// Classifies one line of installer output, stamping it with the current time.
#[must_use]
pub fn classify(line: &str) -> Option<Event> {
    classify_at(line, Utc::now())
}

/// Classifies one line of installer output with an explicit timestamp.
///
/// Never fails: a sentinel line with an unknown tag or no payload separator
/// degrades to a [`EventKind::Context`] event carrying the raw line. Events
/// matched by a fallback rule carry the line as received.
#[must_use]
pub fn classify_at(line: &str, timestamp: DateTime<Utc>) -> Option<Event> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(rest) = trimmed.strip_prefix(SENTINEL) {
        return Some(parse_sentinel(trimmed, rest, timestamp));
    }

    let lowered = trimmed.to_lowercase();
    FALLBACK_RULES
        .iter()
        .find(|rule| rule.matches(trimmed, &lowered))
        .map(|rule| Event {
            kind: rule.kind,
            key: rule.key.to_string(),
            detail: line.to_string(),
            timestamp,
        })
}

fn parse_sentinel(line: &str, rest: &str, timestamp: DateTime<Utc>) -> Event {
    let parsed = rest
        .split_once(SENTINEL)
        .and_then(|(tag, payload)| EventKind::from_tag(tag).map(|kind| (kind, payload)));

    let Some((kind, payload)) = parsed else {
        return Event {
            kind: EventKind::Context,
            key: UNPARSED_KEY.to_string(),
            detail: line.to_string(),
            timestamp,
        };
    };

    let (key, detail) = payload.split_once(SENTINEL).unwrap_or(("", payload));
    Event {
        kind,
        key: key.to_string(),
        detail: detail.to_string(),
        timestamp,
    }
}
