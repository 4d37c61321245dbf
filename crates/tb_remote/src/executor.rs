//! Command execution on the coordinator and on remote hosts
//!
//! Remote commands go through the system `ssh` client so that the operator's
//! agent, `~/.ssh/config` and known-hosts files apply unchanged. Every
//! connection runs in batch mode with an explicit connect timeout and an
//! explicit host-key policy.

use crate::{CommandOutput, LOCAL_HOST, RemoteError, RemoteExec};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tb_config::{CampaignConfig, HostKeyPolicy};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Exit status `ssh` reserves for its own failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// How hosts are reached
#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    /// Default user for hosts given without `user@`
    pub user: String,
    /// Default port for hosts given without `:port`
    pub port: u16,
    /// Private key passed with `-i`
    pub key_path: Option<PathBuf>,
    /// Bound on connection establishment
    pub connect_timeout: Duration,
    /// Host-key verification
    pub host_key_policy: HostKeyPolicy,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            port: 22,
            key_path: None,
            connect_timeout: Duration::from_secs(10),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

impl ConnectionPolicy {
    #[must_use]
    pub fn from_config(config: &CampaignConfig) -> Self {
        Self {
            user: config.connection.user.clone(),
            port: config.connection.port,
            key_path: config.connection.key_path.clone(),
            connect_timeout: config.connect_timeout(),
            host_key_policy: config.connection.host_key_policy,
        }
    }
}

/// Resolved ssh destination for one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SshTarget {
    /// Parse `host`, `user@host` or `user@host:port`, filling gaps from the
    /// policy. Returns `None` for the local host.
    #[must_use]
    pub fn parse(s: &str, policy: &ConnectionPolicy) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || s == LOCAL_HOST {
            return None;
        }

        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (policy.user.clone(), s),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) => match port_str.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (rest.to_string(), policy.port),
            },
            None => (rest.to_string(), policy.port),
        };

        Some(Self { user, host, port })
    }

    /// `user@host` as passed to ssh
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Command executor for local and ssh-reachable hosts
#[derive(Debug, Clone, Default)]
pub struct Executor {
    policy: ConnectionPolicy,
}

impl Executor {
    /// Create an executor with the given connection policy
    #[must_use]
    pub fn new(policy: ConnectionPolicy) -> Self {
        Self { policy }
    }

    /// Executor that only ever runs locally
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    /// Build the full ssh argument list for running `remote_cmd` on `target`
    #[must_use]
    pub fn ssh_args(&self, target: &SshTarget, remote_cmd: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!(
                "ConnectTimeout={}",
                self.policy.connect_timeout.as_secs().max(1)
            ),
        ];
        args.extend(host_key_options(self.policy.host_key_policy));

        if let Some(key) = &self.policy.key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        if target.port != 22 {
            args.push("-p".to_string());
            args.push(target.port.to_string());
        }

        args.push(target.destination());
        args.push(remote_cmd.to_string());
        args
    }

    fn command_for(&self, host: &str, shell_cmd: &str) -> (Command, bool) {
        match SshTarget::parse(host, &self.policy) {
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(shell_cmd);
                (cmd, false)
            }
            Some(target) => {
                let mut cmd = Command::new("ssh");
                cmd.args(self.ssh_args(&target, shell_cmd));
                (cmd, true)
            }
        }
    }

    async fn spawn(
        &self,
        host: &str,
        mut cmd: Command,
        via_ssh: bool,
        stdin: Option<String>,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if via_ssh {
                RemoteError::Connection {
                    host: host.to_string(),
                    reason: format!("failed to start ssh: {e}"),
                }
            } else {
                RemoteError::IoError(e)
            }
        })?;

        let input = stdin.zip(child.stdin.take());
        let run = async move {
            if let Some((body, mut pipe)) = input {
                pipe.write_all(body.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(RemoteError::IoError(e)),
            Err(_) => {
                return Err(RemoteError::Timeout {
                    host: host.to_string(),
                    timeout,
                });
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if via_ssh && result.exit_code == SSH_TRANSPORT_FAILURE {
            return Err(RemoteError::Connection {
                host: host.to_string(),
                reason: result.stderr.trim().to_string(),
            });
        }

        Ok(result)
    }
}

#[async_trait]
impl RemoteExec for Executor {
    #[instrument(skip(self, timeout))]
    async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        debug!(host = %host, cmd = %command, "Running command");
        let (cmd, via_ssh) = self.command_for(host, command);
        self.spawn(host, cmd, via_ssh, None, timeout).await
    }

    #[instrument(skip(self, script, env, timeout))]
    async fn execute_script(
        &self,
        host: &str,
        script: &str,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        debug!(host = %host, lines = script.lines().count(), "Running script");
        let body = render_script(script, env);
        let (cmd, via_ssh) = self.command_for(host, "bash -s");
        self.spawn(host, cmd, via_ssh, Some(body), timeout).await
    }
}

fn host_key_options(policy: HostKeyPolicy) -> Vec<String> {
    let opts: &[&str] = match policy {
        HostKeyPolicy::Strict => &["StrictHostKeyChecking=yes"],
        HostKeyPolicy::AcceptNew => &["StrictHostKeyChecking=accept-new"],
        HostKeyPolicy::Insecure => &[
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "LogLevel=ERROR",
        ],
    };
    opts.iter()
        .flat_map(|opt| ["-o".to_string(), (*opt).to_string()])
        .collect()
}

/// Prefix a script with `export` lines for the given environment
fn render_script(script: &str, env: &[(String, String)]) -> String {
    let mut body = String::new();
    for (key, value) in env {
        body.push_str("export ");
        body.push_str(key);
        body.push('=');
        body.push_str(&crate::shell_escape(value));
        body.push('\n');
    }
    body.push_str(script);
    if !script.ends_with('\n') {
        body.push('\n');
    }
    body
}
