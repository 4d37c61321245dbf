//! Capacity probing for hosts
//!
//! A host's parallel compute capacity is discovered by running a list of
//! probe commands in a fixed order and taking the first one that answers with
//! a positive integer. Hosts differ in what they have installed, so no single
//! probe is trusted to work everywhere.

use crate::ClusterError;
use tb_remote::RemoteExec;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One way of asking a host how many CPUs it has
#[derive(Debug, Clone)]
pub struct CapacityProbe {
    /// Probe name used in logs and errors
    pub name: &'static str,
    /// Command whose stdout should be a single integer
    pub command: &'static str,
}

/// Probes in fallback order
pub const CAPACITY_PROBES: &[CapacityProbe] = &[
    CapacityProbe {
        name: "nproc",
        command: "nproc",
    },
    CapacityProbe {
        name: "getconf",
        command: "getconf _NPROCESSORS_ONLN",
    },
    CapacityProbe {
        name: "cpuinfo",
        command: "grep -c ^processor /proc/cpuinfo",
    },
    CapacityProbe {
        name: "docker",
        command: "docker info --format '{{.NCPU}}'",
    },
];

/// Capacity prober running [`CAPACITY_PROBES`] in order
pub struct CapacityProber {
    timeout: Duration,
    probes: &'static [CapacityProbe],
}

impl Default for CapacityProber {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityProber {
    /// Create a prober with the default probe list and timeout
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            probes: CAPACITY_PROBES,
        }
    }

    /// Set the per-probe timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the probe list
    #[must_use]
    pub fn with_probes(mut self, probes: &'static [CapacityProbe]) -> Self {
        self.probes = probes;
        self
    }

    /// Measure the number of CPUs available on `host`.
    ///
    /// # Errors
    /// Returns [`ClusterError::CapacityUnknown`] only when every probe failed
    /// or returned something other than a positive integer.
    pub async fn measure(&self, exec: &dyn RemoteExec, host: &str) -> Result<u32, ClusterError> {
        let mut attempts = Vec::new();

        for probe in self.probes {
            match exec.execute(host, probe.command, self.timeout).await {
                Ok(output) if output.success() => match parse_capacity(&output.stdout) {
                    Some(cpus) => {
                        info!(host = %host, probe = probe.name, cpus, "Measured capacity");
                        return Ok(cpus);
                    }
                    None => {
                        debug!(host = %host, probe = probe.name, stdout = %output.stdout.trim(), "Probe output not a positive integer");
                        attempts.push(format!("{}: unusable output '{}'", probe.name, output.stdout.trim()));
                    }
                },
                Ok(output) => {
                    debug!(host = %host, probe = probe.name, exit_code = output.exit_code, "Probe failed");
                    attempts.push(format!("{}: exit {}", probe.name, output.exit_code));
                }
                Err(e) => {
                    warn!(host = %host, probe = probe.name, error = %e, "Probe error");
                    attempts.push(format!("{}: {e}", probe.name));
                }
            }
        }

        Err(ClusterError::CapacityUnknown {
            host: host.to_string(),
            attempts,
        })
    }
}

/// Parse probe stdout as a positive CPU count
#[must_use]
pub fn parse_capacity(stdout: &str) -> Option<u32> {
    stdout.trim().parse::<u32>().ok().filter(|n| *n > 0)
}
