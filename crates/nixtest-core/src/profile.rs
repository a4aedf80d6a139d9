//! Installation profiles and the checks run after installing them.

use serde::{Deserialize, Serialize};

use crate::remote::CommandOutput;

/// Whether a failed check fails the profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSeverity {
    /// Failure fails the profile.
    #[default]
    Hard,
    /// Failure is reported as a warning.
    Soft,
}

/// What a post-install check looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    /// The filesystem mounted at `mount` has type `fstype`.
    FilesystemType {
        /// Mount point.
        mount: String,
        /// Expected type, as `findmnt` reports it.
        fstype: String,
    },
    /// A systemd unit is active.
    ServiceActive {
        /// Unit name.
        service: String,
    },
    /// A systemd unit is not active.
    ServiceInactive {
        /// Unit name.
        service: String,
    },
    /// A directory exists.
    DirectoryPresent {
        /// Absolute path.
        path: String,
    },
}

impl CheckKind {
    /// Returns the shell command that inspects the installed system.
    #[must_use]
    pub fn command(&self) -> String {
        match self {
            Self::FilesystemType { mount, .. } => {
                format!("findmnt -n -o FSTYPE --target {}", shell_quote(mount))
            }
            Self::ServiceActive { service } | Self::ServiceInactive { service } => {
                format!("systemctl is-active {}", shell_quote(service))
            }
            Self::DirectoryPresent { path } => format!("test -d {}", shell_quote(path)),
        }
    }

    /// Decides from the command output whether the check passed.
    #[must_use]
    pub fn evaluate(&self, output: &CommandOutput) -> bool {
        match self {
            Self::FilesystemType { fstype, .. } => {
                output.success() && output.first_line() == Some(fstype.as_str())
            }
            Self::ServiceActive { .. } => output.success() && output.first_line() == Some("active"),
            Self::ServiceInactive { .. } => output.first_line() != Some("active"),
            Self::DirectoryPresent { .. } => output.success(),
        }
    }

    /// Returns a one-line description for reports.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::FilesystemType { mount, fstype } => format!("{mount} is {fstype}"),
            Self::ServiceActive { service } => format!("{service} is active"),
            Self::ServiceInactive { service } => format!("{service} is not active"),
            Self::DirectoryPresent { path } => format!("{path} exists"),
        }
    }
}

/// A check with its severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostInstallCheck {
    /// What to check.
    pub check: CheckKind,
    /// What a failure means.
    #[serde(default)]
    pub severity: CheckSeverity,
}

impl PostInstallCheck {
    /// A check whose failure fails the profile.
    #[must_use]
    pub const fn hard(check: CheckKind) -> Self {
        Self {
            check,
            severity: CheckSeverity::Hard,
        }
    }

    /// A check whose failure only warns.
    #[must_use]
    pub const fn soft(check: CheckKind) -> Self {
        Self {
            check,
            severity: CheckSeverity::Soft,
        }
    }
}

/// Outcome of one post-install check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check description.
    pub check: String,
    /// Severity it ran with.
    pub severity: CheckSeverity,
    /// Whether it passed.
    pub passed: bool,
    /// Command output or the error that prevented running it.
    pub detail: String,
}

/// Everything the runner needs to know about one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSpec {
    /// Profile name, passed to the installer.
    pub name: String,
    /// Install command overriding the default template.
    #[serde(default)]
    pub install_command: Option<String>,
    /// Checks run after the reboot.
    #[serde(default)]
    pub checks: Vec<PostInstallCheck>,
}

impl ProfileSpec {
    /// Returns the built-in definition of a known profile, or a minimal one.
    #[must_use]
    pub fn builtin(name: &str) -> Self {
        let checks = match name {
            "vm" => vec![
                PostInstallCheck::hard(service_active("sshd")),
                PostInstallCheck::hard(directory("/home")),
                PostInstallCheck::hard(directory("/etc/nixos")),
                PostInstallCheck::soft(filesystem("/", "btrfs")),
            ],
            "workstation" => vec![
                PostInstallCheck::hard(service_active("display-manager")),
                PostInstallCheck::hard(service_active("NetworkManager")),
                PostInstallCheck::hard(directory("/home")),
                PostInstallCheck::soft(filesystem("/", "btrfs")),
            ],
            "server" => vec![
                PostInstallCheck::hard(service_active("sshd")),
                PostInstallCheck::hard(CheckKind::ServiceInactive {
                    service: "display-manager".to_string(),
                }),
                PostInstallCheck::hard(directory("/var/log")),
                PostInstallCheck::soft(filesystem("/", "btrfs")),
            ],
            _ => vec![
                PostInstallCheck::hard(service_active("sshd")),
                PostInstallCheck::hard(directory("/etc/nixos")),
            ],
        };

        Self {
            name: name.to_string(),
            install_command: None,
            checks,
        }
    }
}

fn service_active(service: &str) -> CheckKind {
    CheckKind::ServiceActive {
        service: service.to_string(),
    }
}

fn directory(path: &str) -> CheckKind {
    CheckKind::DirectoryPresent {
        path: path.to_string(),
    }
}

fn filesystem(mount: &str, fstype: &str) -> CheckKind {
    CheckKind::FilesystemType {
        mount: mount.to_string(),
        fstype: fstype.to_string(),
    }
}

/// Quotes a word for a POSIX shell.
#[must_use]
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-@:=+".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
