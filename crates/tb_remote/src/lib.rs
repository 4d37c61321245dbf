//! `tb_remote` - Remote command execution for throttlebench
//!
//! This crate provides:
//! - The [`RemoteExec`] trait every cluster operation is written against
//! - [`Executor`], which runs commands locally via `sh` or remotely via the
//!   system `ssh` client under an explicit [`ConnectionPolicy`]
//! - A failure taxonomy separating unreachable hosts, failed commands and
//!   timeouts
//!
//! Hosts are addressed by the strings found in configuration
//! (`host`, `user@host` or `user@host:port`); the special host `local` runs on
//! the coordinator itself.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod executor;

pub use executor::{ConnectionPolicy, Executor, SshTarget};
pub use tb_config::HostKeyPolicy;

/// Host name that always executes on the coordinator
pub const LOCAL_HOST: &str = "local";

/// Remote execution errors
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The host could not be reached or the transport failed before the
    /// command ran.
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// The command ran and exited non-zero.
    #[error("Command on {host} exited with {exit_code}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The command did not finish before its deadline.
    #[error("Command on {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RemoteError {
    /// Host the error refers to, when known
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Connection { host, .. }
            | Self::CommandFailed { host, .. }
            | Self::Timeout { host, .. } => Some(host),
            Self::IoError(_) => None,
        }
    }
}

/// Output from command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Build a successful output, mostly for tests and fakes
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Build a failed output, mostly for tests and fakes
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Check if the command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`RemoteError::CommandFailed`].
    ///
    /// # Errors
    /// Returns [`RemoteError::CommandFailed`] when the exit code is non-zero.
    pub fn into_checked(self, host: &str, command: &str) -> Result<Self, RemoteError> {
        if self.success() {
            Ok(self)
        } else {
            Err(RemoteError::CommandFailed {
                host: host.to_string(),
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs commands and scripts on named hosts.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command` on `host`, returning its exit status and output.
    ///
    /// A non-zero exit is not an error at this level.
    async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;

    /// Run a multi-line shell script on `host` with extra environment.
    async fn execute_script(
        &self,
        host: &str,
        script: &str,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;

    /// Run `command` and fail on a non-zero exit.
    async fn execute_checked(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        self.execute(host, command, timeout)
            .await?
            .into_checked(host, command)
    }
}

/// Shell-escape a string for safe use in commands
#[must_use]
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("simple"), "'simple'");
        assert_eq!(shell_escape("with spaces"), "'with spaces'");
        assert_eq!(shell_escape("with'quote"), "'with'\\''quote'");
    }

    #[test]
    fn test_into_checked() {
        let ok = CommandOutput::ok("hello").into_checked("h1", "echo hello");
        assert_eq!(ok.unwrap().stdout, "hello");

        let err = CommandOutput::failed(2, "boom\n")
            .into_checked("h1", "false")
            .unwrap_err();
        match err {
            RemoteError::CommandFailed {
                host,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(host, "h1");
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_display_and_host() {
        let err = RemoteError::Connection {
            host: "10.0.0.9".to_string(),
            reason: "No route to host".to_string(),
        };
        assert!(err.to_string().contains("10.0.0.9"));
        assert_eq!(err.host(), Some("10.0.0.9"));

        let err = RemoteError::Timeout {
            host: "h".to_string(),
            timeout: Duration::from_secs(3),
        };
        assert!(err.to_string().contains("3s"));
    }
}
