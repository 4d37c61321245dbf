//! CPU constraints on running workload units
//!
//! A degradation level withholds a share of a host's CPUs from the unit
//! running there. Constraints are CFS quotas set with `docker update`:
//! the period is fixed at [`CPU_PERIOD_US`] and the quota is the allowed
//! CPU time per period. Level 0 removes the quota instead of setting one equal
//! to full capacity, because the scheduler still throttles a unit that has a
//! quota even when the quota covers every core.

use crate::capacity::CapacityProber;
use crate::{ClusterError, WorkloadUnit};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tb_config::{CampaignConfig, DegradationLevel};
use tb_remote::{RemoteExec, shell_escape};
use tracing::{info, instrument, warn};

/// CFS period used for every quota, in microseconds
pub const CPU_PERIOD_US: u64 = 100_000;

/// Smallest quota the kernel accepts, in microseconds
const MIN_QUOTA_US: u64 = 1_000;

/// A CPU allowance in fractional CPUs
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct CpuQuota {
    cpus: f64,
}

impl CpuQuota {
    #[must_use]
    pub fn cpus(self) -> f64 {
        self.cpus
    }

    /// Quota per [`CPU_PERIOD_US`], in microseconds
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn quota_us(self) -> u64 {
        ((self.cpus * CPU_PERIOD_US as f64).round() as u64).max(MIN_QUOTA_US)
    }

    /// Inverse of [`Self::quota_us`]
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_quota_us(quota_us: u64) -> Self {
        Self {
            cpus: quota_us as f64 / CPU_PERIOD_US as f64,
        }
    }
}

/// Compute the quota for a level: `max(floor, capacity × (100 − pct) / 100)`.
///
/// Non-increasing in the level for a fixed capacity and never below `floor`.
#[must_use]
pub fn compute_quota(capacity: u32, level: DegradationLevel, floor: f64) -> CpuQuota {
    let share = f64::from(level.availability()) / 100.0;
    CpuQuota {
        cpus: (f64::from(capacity) * share).max(floor),
    }
}

/// Observable constraint state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", content = "cpus", rename_all = "snake_case")]
pub enum LimitState {
    Unconstrained,
    Quota(CpuQuota),
}

impl LimitState {
    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        matches!(self, Self::Unconstrained)
    }
}

impl std::fmt::Display for LimitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unconstrained => f.write_str("unconstrained"),
            Self::Quota(q) => write!(f, "{:.2} cpus", q.cpus()),
        }
    }
}

/// Result of a rollback attempt. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearOutcome {
    /// The quota was removed (or there was none)
    Cleared,
    /// The unit no longer exists, so it has no constraint
    AlreadyAbsent,
    /// Removal failed; logged and otherwise ignored
    Failed(String),
}

impl ClearOutcome {
    #[must_use]
    pub fn is_restored(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Applies, removes and inspects CPU constraints
pub struct ResourceController {
    exec: Arc<dyn RemoteExec>,
    prober: CapacityProber,
    timeout: Duration,
    floor: f64,
}

impl ResourceController {
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExec>, config: &CampaignConfig) -> Self {
        Self {
            exec,
            prober: CapacityProber::new().with_timeout(config.command_timeout()),
            timeout: config.command_timeout(),
            floor: config.campaign.cpu_floor,
        }
    }

    /// Measure a host's CPU count.
    ///
    /// # Errors
    /// Returns [`ClusterError::CapacityUnknown`] when every probe fails.
    pub async fn measure_capacity(&self, host: &str) -> Result<u32, ClusterError> {
        self.prober.measure(self.exec.as_ref(), host).await
    }

    /// Quota this controller would apply for `level` on a host with `capacity` CPUs
    #[must_use]
    pub fn quota_for(&self, capacity: u32, level: DegradationLevel) -> CpuQuota {
        compute_quota(capacity, level, self.floor)
    }

    /// Constrain `unit` for `level`. Level 0 removes the constraint.
    ///
    /// # Errors
    /// Returns [`ClusterError::ConstraintApply`] when the update fails.
    #[instrument(skip(self, unit, level), fields(unit = %unit, level = %level))]
    pub async fn apply_limit(
        &self,
        unit: &WorkloadUnit,
        level: DegradationLevel,
        capacity: u32,
    ) -> Result<LimitState, ClusterError> {
        let (cmd, state) = if level.is_baseline() {
            (
                format!("docker update --cpu-quota=-1 {}", shell_escape(&unit.name)),
                LimitState::Unconstrained,
            )
        } else {
            let quota = self.quota_for(capacity, level);
            (
                format!(
                    "docker update --cpu-period={CPU_PERIOD_US} --cpu-quota={} {}",
                    quota.quota_us(),
                    shell_escape(&unit.name)
                ),
                LimitState::Quota(quota),
            )
        };

        let apply_err = |reason: String| ClusterError::ConstraintApply {
            host: unit.host.clone(),
            unit: unit.name.clone(),
            reason,
        };

        let output = self
            .exec
            .execute(&unit.host, &cmd, self.timeout)
            .await
            .map_err(|e| apply_err(e.to_string()))?;
        if !output.success() {
            return Err(apply_err(output.stderr.trim().to_string()));
        }

        info!(host = %unit.host, unit = %unit.name, level = %level, state = %state, "Applied limit");
        Ok(state)
    }

    /// Remove any constraint from `unit`. Idempotent and infallible: a
    /// missing unit counts as restored, other failures are logged.
    #[instrument(skip(self, unit), fields(unit = %unit))]
    pub async fn clear_limit(&self, unit: &WorkloadUnit) -> ClearOutcome {
        let cmd = format!("docker update --cpu-quota=-1 {}", shell_escape(&unit.name));
        let outcome = match self.exec.execute(&unit.host, &cmd, self.timeout).await {
            Ok(output) if output.success() => ClearOutcome::Cleared,
            Ok(output) if is_missing_container(&output.stderr) => ClearOutcome::AlreadyAbsent,
            Ok(output) => ClearOutcome::Failed(format!(
                "exit {}: {}",
                output.exit_code,
                output.stderr.trim()
            )),
            Err(e) => ClearOutcome::Failed(e.to_string()),
        };

        match &outcome {
            ClearOutcome::Cleared => info!(host = %unit.host, unit = %unit.name, "Cleared limit"),
            ClearOutcome::AlreadyAbsent => {
                info!(host = %unit.host, unit = %unit.name, "Unit gone, nothing to clear");
            }
            ClearOutcome::Failed(reason) => {
                warn!(host = %unit.host, unit = %unit.name, reason = %reason, "Failed to clear limit");
            }
        }
        outcome
    }

    /// Read the current constraint of `unit`.
    ///
    /// # Errors
    /// Returns a [`ClusterError`] when the unit cannot be inspected.
    pub async fn inspect_limit(&self, unit: &WorkloadUnit) -> Result<LimitState, ClusterError> {
        let cmd = format!(
            "docker inspect --format '{{{{.HostConfig.CpuQuota}}}}' {}",
            shell_escape(&unit.name)
        );
        let output = self
            .exec
            .execute_checked(&unit.host, &cmd, self.timeout)
            .await?;
        let quota: i64 = output
            .stdout
            .trim()
            .parse()
            .map_err(|_| ClusterError::ParseError {
                host: unit.host.clone(),
                detail: format!("CpuQuota '{}'", output.stdout.trim()),
            })?;
        Ok(match u64::try_from(quota) {
            Ok(q) if q > 0 => LimitState::Quota(CpuQuota::from_quota_us(q)),
            _ => LimitState::Unconstrained,
        })
    }
}

fn is_missing_container(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedExec};
    use proptest::prelude::*;

    fn level(pct: u8) -> DegradationLevel {
        DegradationLevel::new(pct).unwrap()
    }

    fn controller(exec: &Arc<ScriptedExec>) -> ResourceController {
        ResourceController::new(exec.clone(), &CampaignConfig::default())
    }

    #[test]
    fn test_compute_quota_examples() {
        assert_eq!(compute_quota(8, level(50), 0.1).cpus(), 4.0);
        assert_eq!(compute_quota(8, level(25), 0.1).cpus(), 6.0);
        assert_eq!(compute_quota(8, level(0), 0.1).cpus(), 8.0);
        assert_eq!(compute_quota(8, level(100), 0.1).cpus(), 0.1);
        assert_eq!(compute_quota(1, level(99), 0.5).cpus(), 0.5);
    }

    #[test]
    fn test_quota_us_roundtrip() {
        let quota = compute_quota(8, level(50), 0.1);
        assert_eq!(quota.quota_us(), 400_000);
        assert_eq!(CpuQuota::from_quota_us(400_000), quota);
        assert_eq!(compute_quota(1, level(100), 0.001).quota_us(), MIN_QUOTA_US);
    }

    proptest! {
        #[test]
        fn test_quota_monotone_and_floored(capacity in 1u32..512, a in 0u8..=100, b in 0u8..=100, floor in 0.01f64..2.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let q_lo = compute_quota(capacity, level(lo), floor);
            let q_hi = compute_quota(capacity, level(hi), floor);
            prop_assert!(q_hi.cpus() <= q_lo.cpus());
            prop_assert!(q_hi.cpus() >= floor);
            prop_assert!(q_hi.cpus() > 0.0);
        }
    }

    #[tokio::test]
    async fn test_apply_quota_and_baseline_are_distinct() {
        let exec = Arc::new(ScriptedExec::new());
        let rc = controller(&exec);
        let unit = WorkloadUnit::new("h1", "cass-node1");

        let state = rc.apply_limit(&unit, level(50), 8).await.unwrap();
        assert_eq!(state, LimitState::Quota(CpuQuota::from_quota_us(400_000)));
        assert_eq!(exec.quota_us("h1", "cass-node1"), Some(400_000));
        assert_eq!(rc.inspect_limit(&unit).await.unwrap(), state);

        let state = rc.apply_limit(&unit, level(0), 8).await.unwrap();
        assert_eq!(state, LimitState::Unconstrained);
        assert_eq!(exec.quota_us("h1", "cass-node1"), None);
        assert!(rc.inspect_limit(&unit).await.unwrap().is_unconstrained());

        // full-capacity quota is still a quota
        let full = rc.quota_for(8, level(0));
        assert_ne!(LimitState::Quota(full), LimitState::Unconstrained);
    }

    #[tokio::test]
    async fn test_apply_failure_is_constraint_error() {
        let exec = Arc::new(ScriptedExec::new());
        exec.on("docker update", Reply::Output(tb_remote::CommandOutput::failed(1, "permission denied")));
        let rc = controller(&exec);

        let err = rc
            .apply_limit(&WorkloadUnit::new("h1", "u1"), level(25), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ConstraintApply { .. }));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_clear_limit_is_idempotent() {
        let exec = Arc::new(ScriptedExec::new());
        let rc = controller(&exec);
        let unit = WorkloadUnit::new("h1", "cass-node1");
        rc.apply_limit(&unit, level(75), 8).await.unwrap();

        assert_eq!(rc.clear_limit(&unit).await, ClearOutcome::Cleared);
        assert_eq!(rc.clear_limit(&unit).await, ClearOutcome::Cleared);
        assert_eq!(exec.quota_us("h1", "cass-node1"), None);
    }

    #[tokio::test]
    async fn test_clear_limit_on_vanished_unit() {
        let exec = Arc::new(ScriptedExec::new());
        exec.remove_unit("h1", "cass-node1");
        let rc = controller(&exec);

        let outcome = rc.clear_limit(&WorkloadUnit::new("h1", "cass-node1")).await;
        assert_eq!(outcome, ClearOutcome::AlreadyAbsent);
        assert!(outcome.is_restored());
    }

    #[tokio::test]
    async fn test_clear_limit_swallows_connection_errors() {
        let exec = Arc::new(ScriptedExec::new());
        exec.on("docker update", Reply::ConnectionRefused);
        let rc = controller(&exec);

        let outcome = rc.clear_limit(&WorkloadUnit::new("h1", "u1")).await;
        assert!(matches!(outcome, ClearOutcome::Failed(_)));
        assert!(!outcome.is_restored());
    }
}
