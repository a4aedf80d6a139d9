//! Local command execution.

use std::ffi::OsStr;
use std::process::Stdio;

use tokio::process::Command;

/// Runs `program` to completion and captures its output.
pub async fn exec<S: AsRef<OsStr>>(program: &OsStr, args: &[S]) -> std::io::Result<ExecResult> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    Ok(ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Result of a local command.
#[derive(Debug)]
pub struct ExecResult {
    /// Exit code, `-1` if killed by a signal.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command exited zero.
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the most useful diagnostic text.
    pub fn message(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_captures_output() {
        let result = exec(OsStr::new("echo"), &["hello"]).await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.message(), "hello");
    }

    #[tokio::test]
    async fn test_exec_nonexistent_command() {
        let result = exec(OsStr::new("this_command_does_not_exist_12345"), &["x"]).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_message_prefers_stderr() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "partial\n".to_string(),
            stderr: "error: failed to get domain 'x'\n".to_string(),
        };
        assert_eq!(result.message(), "error: failed to get domain 'x'");
    }
}
