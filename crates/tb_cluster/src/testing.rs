//! In-memory executor for tests
//!
//! [`ScriptedExec`] records every call and simulates the small slice of the
//! docker CLI the cluster code relies on: CPU quotas set by `docker update`
//! are tracked per (host, unit) and reported back by `docker inspect`.
//! Scripted rules take precedence and are matched in insertion order on a
//! substring of the command.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tb_remote::{CommandOutput, RemoteError, RemoteExec};

/// Canned reply for a matching command
#[derive(Debug, Clone)]
pub enum Reply {
    Output(CommandOutput),
    ConnectionRefused,
    Timeout,
}

#[derive(Debug, Clone)]
struct Rule {
    host: Option<String>,
    needle: String,
    reply: Reply,
    remaining: Option<usize>,
}

/// A recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub host: String,
    pub command: String,
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    calls: Vec<Call>,
    quotas: HashMap<(String, String), u64>,
    missing: HashSet<(String, String)>,
}

/// Recording, scriptable [`RemoteExec`]
#[derive(Debug, Default)]
pub struct ScriptedExec {
    state: Mutex<State>,
}

impl ScriptedExec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Reply to every command containing `needle`, on any host
    pub fn on(&self, needle: &str, reply: Reply) {
        self.push_rule(None, needle, reply, None);
    }

    /// Reply to commands containing `needle` on `host` only
    pub fn on_host(&self, host: &str, needle: &str, reply: Reply) {
        self.push_rule(Some(host), needle, reply, None);
    }

    /// Reply to the next `times` matching commands, then fall through
    pub fn on_times(&self, needle: &str, reply: Reply, times: usize) {
        self.push_rule(None, needle, reply, Some(times));
    }

    fn push_rule(&self, host: Option<&str>, needle: &str, reply: Reply, remaining: Option<usize>) {
        self.lock().rules.push(Rule {
            host: host.map(str::to_string),
            needle: needle.to_string(),
            reply,
            remaining,
        });
    }

    /// Pretend the unit does not exist on the host
    pub fn remove_unit(&self, host: &str, unit: &str) {
        let key = (host.to_string(), unit.to_string());
        let mut state = self.lock();
        state.quotas.remove(&key);
        state.missing.insert(key);
    }

    /// Set a quota directly, as if left over from an earlier run
    pub fn set_quota_us(&self, host: &str, unit: &str, quota_us: u64) {
        self.lock()
            .quotas
            .insert((host.to_string(), unit.to_string()), quota_us);
    }

    /// Current quota of a unit; `None` means unconstrained
    #[must_use]
    pub fn quota_us(&self, host: &str, unit: &str) -> Option<u64> {
        self.lock()
            .quotas
            .get(&(host.to_string(), unit.to_string()))
            .copied()
    }

    /// True if no unit on any host carries a quota
    #[must_use]
    pub fn all_unconstrained(&self) -> bool {
        self.lock().quotas.is_empty()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of recorded commands containing `needle`
    #[must_use]
    pub fn count(&self, needle: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.command.contains(needle))
            .count()
    }

    fn respond(&self, host: &str, command: &str, timeout: Duration) -> Result<CommandOutput, RemoteError> {
        let mut state = self.lock();
        state.calls.push(Call {
            host: host.to_string(),
            command: command.to_string(),
        });

        let matched = state.rules.iter_mut().find(|rule| {
            rule.remaining != Some(0)
                && rule.host.as_deref().is_none_or(|h| h == host)
                && command.contains(&rule.needle)
        });
        if let Some(rule) = matched {
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return match rule.reply.clone() {
                Reply::Output(output) => Ok(output),
                Reply::ConnectionRefused => Err(RemoteError::Connection {
                    host: host.to_string(),
                    reason: "Connection refused".to_string(),
                }),
                Reply::Timeout => Err(RemoteError::Timeout {
                    host: host.to_string(),
                    timeout,
                }),
            };
        }

        Ok(simulate_docker(&mut state, host, command))
    }
}

fn unquote(token: &str) -> String {
    token.trim_matches('\'').to_string()
}

fn simulate_docker(state: &mut State, host: &str, command: &str) -> CommandOutput {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let Some(unit) = tokens.last().map(|t| unquote(t)) else {
        return CommandOutput::ok("");
    };
    let key = (host.to_string(), unit.clone());

    if command.starts_with("docker update") {
        if state.missing.contains(&key) {
            return CommandOutput::failed(1, format!("Error response from daemon: No such container: {unit}"));
        }
        let quota = tokens
            .iter()
            .find_map(|t| t.strip_prefix("--cpu-quota="))
            .and_then(|v| v.parse::<i64>().ok());
        match quota {
            Some(q) if q > 0 => {
                state.quotas.insert(key, q.unsigned_abs());
            }
            Some(_) => {
                state.quotas.remove(&key);
            }
            None => {}
        }
        return CommandOutput::ok(format!("{unit}\n"));
    }

    if command.starts_with("docker inspect") {
        if state.missing.contains(&key) {
            return CommandOutput::failed(1, format!("Error: No such object: {unit}"));
        }
        if command.contains("CpuQuota") {
            let quota = state.quotas.get(&key).copied().unwrap_or(0);
            return CommandOutput::ok(format!("{quota}\n"));
        }
        if command.contains("State.Running") {
            return CommandOutput::ok("true\n");
        }
    }

    CommandOutput::ok("")
}

#[async_trait]
impl RemoteExec for ScriptedExec {
    async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        self.respond(host, command, timeout)
    }

    async fn execute_script(
        &self,
        host: &str,
        script: &str,
        _env: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        self.respond(host, script, timeout)
    }
}
