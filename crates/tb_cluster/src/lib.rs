//! `tb_cluster` - Cluster bring-up and CPU constraint control
//!
//! This crate provides:
//! - Capacity discovery with ordered probe fallback ([`capacity`])
//! - Applying and removing CPU quotas on running containers ([`limits`])
//! - One-shot, idempotent database cluster bring-up ([`supervisor`])
//! - Per-step concurrent fan-out across hosts with a barrier ([`fleet`])
//!
//! Every operation runs through a [`tb_remote::RemoteExec`], so the whole
//! crate can be driven by an in-memory executor in tests.

use serde::Serialize;
use tb_config::{CampaignConfig, ConfigError};
use tb_remote::RemoteError;
use thiserror::Error;

pub mod capacity;
pub mod fleet;
pub mod limits;
pub mod supervisor;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capacity::{CAPACITY_PROBES, CapacityProbe, CapacityProber};
pub use fleet::{Fleet, StepSummary};
pub use limits::{CPU_PERIOD_US, ClearOutcome, CpuQuota, LimitState, ResourceController, compute_quota};
pub use supervisor::ClusterSupervisor;

/// Cluster operation errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Could not determine CPU capacity of {host}: {}", attempts.join("; "))]
    CapacityUnknown { host: String, attempts: Vec<String> },

    #[error("Failed to apply CPU limit to {unit} on {host}: {reason}")]
    ConstraintApply {
        host: String,
        unit: String,
        reason: String,
    },

    #[error("Node {node} on {host} not ready after {attempts} attempts")]
    ReadinessTimeout {
        host: String,
        node: String,
        attempts: u32,
    },

    #[error("Container runtime unavailable on {host}: {reason}")]
    RuntimeUnavailable { host: String, reason: String },

    #[error("Workload unit {unit} is not running on {host}")]
    UnitMissing { host: String, unit: String },

    #[error("Unexpected output from {host}: {detail}")]
    ParseError { host: String, detail: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// One running instance of the benchmarked service on one host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkloadUnit {
    pub host: String,
    pub name: String,
}

impl WorkloadUnit {
    #[must_use]
    pub fn new(host: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            name: name.into(),
        }
    }

    /// Units for every configured host, named by position
    #[must_use]
    pub fn from_config(config: &CampaignConfig) -> Vec<Self> {
        config
            .cluster
            .hosts
            .iter()
            .enumerate()
            .map(|(index, host)| Self::new(host.clone(), config.unit_name(index)))
            .collect()
    }
}

impl std::fmt::Display for WorkloadUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}
