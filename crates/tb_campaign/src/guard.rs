//! Scoped restoration of CPU constraints
//!
//! A [`ConstraintGuard`] is taken before the first constraint is applied and
//! names every unit the campaign may touch. [`ConstraintGuard::release`] clears
//! all of them concurrently and never fails. A guard dropped without release
//! means some exit path skipped restoration; that is logged as an error with
//! the affected units.

use serde::Serialize;
use tb_cluster::{ClearOutcome, Fleet, ResourceController, WorkloadUnit};
use tracing::{error, info, warn};

/// Per-unit result of a release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub cleared: Vec<WorkloadUnit>,
    pub already_absent: Vec<WorkloadUnit>,
    pub failed: Vec<(WorkloadUnit, String)>,
}

impl RestoreReport {
    /// True when no unit could still be constrained
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Holds every (host, unit) pair until released
pub struct ConstraintGuard<'a> {
    controller: &'a ResourceController,
    fleet: Fleet,
    units: Vec<WorkloadUnit>,
    released: bool,
}

impl<'a> ConstraintGuard<'a> {
    #[must_use]
    pub fn acquire(controller: &'a ResourceController, fleet: Fleet, units: Vec<WorkloadUnit>) -> Self {
        info!(units = units.len(), "Constraint guard acquired");
        Self {
            controller,
            fleet,
            units,
            released: false,
        }
    }

    #[must_use]
    pub fn units(&self) -> &[WorkloadUnit] {
        &self.units
    }

    /// Clear the constraint on every unit.
    pub async fn release(mut self) -> RestoreReport {
        self.released = true;
        let controller = self.controller;
        let summary = self
            .fleet
            .run("restore", std::mem::take(&mut self.units), |unit| async move {
                Ok::<_, std::convert::Infallible>(controller.clear_limit(&unit).await)
            })
            .await;

        let mut report = RestoreReport::default();
        for (unit, result) in summary.results {
            match result {
                Ok(ClearOutcome::Cleared) => report.cleared.push(unit),
                Ok(ClearOutcome::AlreadyAbsent) => report.already_absent.push(unit),
                Ok(ClearOutcome::Failed(reason)) => report.failed.push((unit, reason)),
                Err(never) => match never {},
            }
        }

        if report.is_complete() {
            info!(
                cleared = report.cleared.len(),
                absent = report.already_absent.len(),
                "All constraints released"
            );
        } else {
            let names: Vec<String> = report.failed.iter().map(|(u, _)| u.to_string()).collect();
            warn!(units = %names.join(", "), "Some constraints could not be released");
        }
        report
    }
}

impl Drop for ConstraintGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let names: Vec<String> = self.units.iter().map(ToString::to_string).collect();
            error!(
                units = %names.join(", "),
                "Constraint guard dropped without release; CPU limits may still be applied"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tb_cluster::testing::{Reply, ScriptedExec};
    use tb_config::CampaignConfig;

    fn units() -> Vec<WorkloadUnit> {
        vec![
            WorkloadUnit::new("h1", "cass-node1"),
            WorkloadUnit::new("h2", "cass-node2"),
            WorkloadUnit::new("h3", "cass-node3"),
        ]
    }

    #[tokio::test]
    async fn test_release_clears_every_unit() {
        let exec = Arc::new(ScriptedExec::new());
        for unit in units() {
            exec.set_quota_us(&unit.host, &unit.name, 400_000);
        }
        exec.remove_unit("h3", "cass-node3");
        let config = CampaignConfig::default();
        let controller = ResourceController::new(exec.clone(), &config);

        let guard = ConstraintGuard::acquire(&controller, Fleet::new(4), units());
        assert_eq!(guard.units().len(), 3);
        let report = guard.release().await;

        assert!(report.is_complete());
        assert_eq!(report.cleared.len(), 2);
        assert_eq!(report.already_absent, vec![WorkloadUnit::new("h3", "cass-node3")]);
        assert!(exec.all_unconstrained());
    }

    #[tokio::test]
    async fn test_release_reports_failures_without_stopping() {
        let exec = Arc::new(ScriptedExec::new());
        exec.on_host("h2", "docker update", Reply::ConnectionRefused);
        exec.set_quota_us("h1", "cass-node1", 100_000);
        let config = CampaignConfig::default();
        let controller = ResourceController::new(exec.clone(), &config);

        let report = ConstraintGuard::acquire(&controller, Fleet::new(4), units())
            .release()
            .await;

        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.host, "h2");
        assert_eq!(exec.quota_us("h1", "cass-node1"), None);
        assert_eq!(exec.count("docker update --cpu-quota=-1"), 3);
    }
}
