//! Campaign state machine
//!
//! ```text
//! Init ─▶ MeasuringCapacity ─▶ [LoadingData] ─┐
//!                                             ▼
//!        ┌──────────── per level, configured order ────────────┐
//!        │ Applying ─▶ Settling ─▶ Running ─▶ Collecting ──┐    │
//!        │    ▲                                            │    │
//!        │    └────────────────────────────────────────────┘    │
//!        └───────────────┬────────────────────────────┬─────────┘
//!                        │ apply failure, signal,     │ all levels
//!                        │ deadline, panic            │ done
//!                        ▼                            ▼
//!                    Aborting ───────────────▶ Restoring ─▶ Aggregating ─▶ Done
//! ```
//!
//! Constraint state is owned by a [`ConstraintGuard`] taken before the loop.
//! Whatever ends the loop, the guard is released before anything else
//! happens. A panic inside the loop is caught, the units are restored, and the
//! panic is resumed.

use crate::guard::{ConstraintGuard, RestoreReport};
use crate::loadgen::LoadGenerator;
use crate::summarize::Summarizer;
use crate::{CampaignError, CampaignState};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tb_cluster::{ClusterSupervisor, Fleet, ResourceController, WorkloadUnit};
use tb_config::{CampaignConfig, DegradationLevel};
use tb_remote::RemoteExec;
use tb_report::{AggregateDataset, ReportError, SummaryRecord, aggregate};
use tracing::{error, info, warn};

/// Outcome report written next to the run directories
pub const CAMPAIGN_REPORT: &str = "campaign.json";

/// One entry in the state history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub state: CampaignState,
    pub level: Option<DegradationLevel>,
    pub at: DateTime<Utc>,
}

/// Why the level loop stopped early
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// A constraint could not be applied on every unit
    ConstraintApply {
        level: DegradationLevel,
        detail: String,
    },
    /// Interrupted by the operator
    Signal { signal: String },
    /// The overall campaign deadline elapsed
    Deadline { secs: u64 },
}

impl AbortReason {
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Signal { .. } | Self::Deadline { .. })
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConstraintApply { level, detail } => {
                write!(f, "constraint apply failed at {level}: {detail}")
            }
            Self::Signal { signal } => write!(f, "interrupted by {signal}"),
            Self::Deadline { secs } => write!(f, "campaign deadline of {secs}s elapsed"),
        }
    }
}

/// Measured capacity of one unit's host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitCapacity {
    pub unit: WorkloadUnit,
    pub cpus: u32,
}

/// Everything a finished campaign knows about itself
#[derive(Debug, Clone, Serialize)]
pub struct CampaignOutcome {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results_dir: PathBuf,
    pub capacities: Vec<UnitCapacity>,
    pub records: Vec<SummaryRecord>,
    pub levels_with_data: Vec<DegradationLevel>,
    pub levels_without_data: Vec<DegradationLevel>,
    /// Configured levels the loop never reached
    pub levels_not_run: Vec<DegradationLevel>,
    pub dataset: Option<AggregateDataset>,
    pub abort: Option<AbortReason>,
    pub interrupted: bool,
    pub restore: RestoreReport,
    pub transitions: Vec<Transition>,
}

impl CampaignOutcome {
    /// At least one level produced throughput
    #[must_use]
    pub fn success(&self) -> bool {
        !self.levels_with_data.is_empty()
    }

    /// States visited, in order
    #[must_use]
    pub fn states(&self) -> Vec<CampaignState> {
        self.transitions.iter().map(|t| t.state).collect()
    }
}

/// Mutable record of loop progress, kept outside the loop future so partial
/// results survive cancellation.
#[derive(Debug, Default)]
struct Progress {
    transitions: Vec<Transition>,
    records: Vec<SummaryRecord>,
}

impl Progress {
    fn current(&self) -> Option<CampaignState> {
        self.transitions.last().map(|t| t.state)
    }

    fn enter(&mut self, state: CampaignState, level: Option<DegradationLevel>) {
        if let Some(from) = self.current()
            && !from.allows(state)
        {
            warn!(from = %from, to = %state, "Unexpected state transition");
        }
        match level {
            Some(level) => info!(state = %state, level = %level, "Campaign state"),
            None => info!(state = %state, "Campaign state"),
        }
        self.transitions.push(Transition {
            state,
            level,
            at: Utc::now(),
        });
    }
}

enum LoopEnd {
    Completed,
    Aborted(AbortReason),
    Panicked(Box<dyn std::any::Any + Send>),
}

/// Future that completes on Ctrl-C or, on unix, SIGTERM. Never completes if
/// no handler can be installed.
pub async fn shutdown_signal() -> String {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "SIGINT".to_string(),
        () = terminate => "SIGTERM".to_string(),
    }
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Sequences one degradation campaign over a ready cluster
pub struct Campaign<'a> {
    config: &'a CampaignConfig,
    exec: Arc<dyn RemoteExec>,
    controller: ResourceController,
    loadgen: Arc<dyn LoadGenerator>,
    summarizer: Arc<dyn Summarizer>,
    fleet: Fleet,
    load_data: bool,
}

impl<'a> Campaign<'a> {
    #[must_use]
    pub fn new(
        config: &'a CampaignConfig,
        exec: Arc<dyn RemoteExec>,
        loadgen: Arc<dyn LoadGenerator>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            config,
            controller: ResourceController::new(exec.clone(), config),
            exec,
            loadgen,
            summarizer,
            fleet: Fleet::new(config.connection.max_concurrent),
            load_data: false,
        }
    }

    /// Run the data load phase before the first level
    #[must_use]
    pub fn with_load_phase(mut self, load_data: bool) -> Self {
        self.load_data = load_data;
        self
    }

    /// Run until done, interrupted by Ctrl-C/SIGTERM, or past the deadline.
    ///
    /// # Errors
    /// See [`Campaign::run_until`].
    pub async fn run(&self) -> Result<CampaignOutcome, CampaignError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the campaign, treating completion of `shutdown` as an interruption.
    ///
    /// Setup failures (config, missing units, unknown capacity, data load)
    /// are returned as errors before any constraint is applied. Everything
    /// after that ends in a [`CampaignOutcome`]; per-level failures show up
    /// as levels without data.
    ///
    /// # Errors
    /// Returns a [`CampaignError`] for setup failures or when results cannot
    /// be written.
    ///
    /// # Panics
    /// Re-raises a panic from inside the level loop after restoring every
    /// unit.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<CampaignOutcome, CampaignError>
    where
        F: Future<Output = String>,
    {
        let started_at = Utc::now();
        let mut progress = Progress::default();
        progress.enter(CampaignState::Init, None);

        self.config.validate_for_campaign()?;
        let results_dir = self.config.global.results_dir.clone();
        tokio::fs::create_dir_all(&results_dir).await?;

        let units = WorkloadUnit::from_config(self.config);
        ClusterSupervisor::new(self.exec.clone(), self.config)
            .verify_units(&units)
            .await?;

        progress.enter(CampaignState::MeasuringCapacity, None);
        let capacities = self.measure_capacities(&units).await?;

        if self.load_data {
            progress.enter(CampaignState::LoadingData, None);
            self.loadgen.load(&results_dir.join("load")).await?;
        }

        let guard = ConstraintGuard::acquire(&self.controller, self.fleet, units);
        let level_loop = AssertUnwindSafe(self.run_levels(&mut progress, &capacities)).catch_unwind();

        let end = tokio::select! {
            result = level_loop => match result {
                Ok(end) => end,
                Err(payload) => LoopEnd::Panicked(payload),
            },
            signal = shutdown => LoopEnd::Aborted(AbortReason::Signal { signal }),
            () = deadline(self.config.campaign_deadline()) => LoopEnd::Aborted(AbortReason::Deadline {
                secs: self.config.campaign.deadline_secs.unwrap_or_default(),
            }),
        };

        let abort = match end {
            LoopEnd::Completed => None,
            LoopEnd::Aborted(reason) => {
                error!(reason = %reason, "Aborting campaign");
                progress.enter(CampaignState::Aborting, None);
                Some(reason)
            }
            LoopEnd::Panicked(payload) => {
                error!("Level loop panicked, restoring constraints");
                progress.enter(CampaignState::Aborting, None);
                progress.enter(CampaignState::Restoring, None);
                guard.release().await;
                std::panic::resume_unwind(payload);
            }
        };

        progress.enter(CampaignState::Restoring, None);
        let restore = guard.release().await;

        progress.enter(CampaignState::Aggregating, None);
        let dataset = match aggregate(&progress.records) {
            Ok(dataset) => {
                dataset.persist(&results_dir)?;
                Some(dataset)
            }
            Err(ReportError::Aggregation(reason)) => {
                warn!(reason = %reason, "No data to aggregate");
                None
            }
            Err(e) => return Err(e.into()),
        };
        progress.enter(CampaignState::Done, None);

        let ran: Vec<DegradationLevel> = progress.records.iter().map(|r| r.level).collect();
        let outcome = CampaignOutcome {
            started_at,
            finished_at: Utc::now(),
            results_dir: results_dir.clone(),
            capacities,
            levels_with_data: progress.records.iter().filter(|r| r.has_data()).map(|r| r.level).collect(),
            levels_without_data: progress.records.iter().filter(|r| !r.has_data()).map(|r| r.level).collect(),
            levels_not_run: self
                .config
                .campaign
                .levels
                .iter()
                .filter(|l| !ran.contains(l))
                .copied()
                .collect(),
            records: progress.records,
            dataset,
            interrupted: abort.as_ref().is_some_and(AbortReason::is_interruption),
            abort,
            restore,
            transitions: progress.transitions,
        };

        tokio::fs::write(
            results_dir.join(CAMPAIGN_REPORT),
            serde_json::to_string_pretty(&outcome)?,
        )
        .await?;
        info!(
            with_data = ?outcome.levels_with_data,
            without_data = ?outcome.levels_without_data,
            not_run = ?outcome.levels_not_run,
            success = outcome.success(),
            "Campaign finished"
        );
        Ok(outcome)
    }

    async fn measure_capacities(&self, units: &[WorkloadUnit]) -> Result<Vec<UnitCapacity>, CampaignError> {
        let summary = self
            .fleet
            .run("measure_capacity", units.to_vec(), |unit| async move {
                self.controller.measure_capacity(&unit.host).await
            })
            .await;
        match summary.into_all() {
            Ok(measured) => Ok(measured
                .into_iter()
                .map(|(unit, cpus)| UnitCapacity { unit, cpus })
                .collect()),
            Err(mut failures) => Err(failures.remove(0).1.into()),
        }
    }

    async fn run_levels(&self, progress: &mut Progress, capacities: &[UnitCapacity]) -> LoopEnd {
        for &level in &self.config.campaign.levels {
            progress.enter(CampaignState::Applying, Some(level));
            let applied = self
                .fleet
                .run("apply_limit", capacities.to_vec(), |cap| async move {
                    self.controller.apply_limit(&cap.unit, level, cap.cpus).await
                })
                .await;
            if !applied.all_succeeded() {
                let detail = applied
                    .failures()
                    .map(|(cap, e)| format!("{}: {e}", cap.unit))
                    .collect::<Vec<_>>()
                    .join("; ");
                return LoopEnd::Aborted(AbortReason::ConstraintApply { level, detail });
            }

            progress.enter(CampaignState::Settling, Some(level));
            tokio::time::sleep(self.config.settle_delay()).await;

            progress.enter(CampaignState::Running, Some(level));
            let run_dir = self.config.run_dir(level);
            let artifact = match self.loadgen.run(level, &run_dir).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    warn!(level = %level, error = %e, "Run failed, level has no data");
                    progress.records.push(SummaryRecord::absent(level));
                    continue;
                }
            };

            progress.enter(CampaignState::Collecting, Some(level));
            let record = match self.summarizer.summarize(&artifact).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(level = %level, error = %e, "Collection failed, level has no data");
                    SummaryRecord::absent(level)
                }
            };
            progress.records.push(record);
        }
        LoopEnd::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunArtifact;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tb_cluster::testing::{Reply, ScriptedExec};
    use tb_remote::CommandOutput;

    #[derive(Default)]
    struct FakeLoad {
        fail_at: Option<u8>,
        panic_at: Option<u8>,
        runs: Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl LoadGenerator for FakeLoad {
        async fn load(&self, _dir: &Path) -> Result<(), CampaignError> {
            Ok(())
        }

        async fn run(&self, level: DegradationLevel, run_dir: &Path) -> Result<RunArtifact, CampaignError> {
            self.runs.lock().unwrap().push(level.percent());
            if self.panic_at == Some(level.percent()) {
                panic!("load generator crashed");
            }
            if self.fail_at == Some(level.percent()) {
                return Err(CampaignError::LoadGenerator {
                    level,
                    reason: "exit 1".into(),
                });
            }
            std::fs::create_dir_all(run_dir)?;
            let file = run_dir.join(format!("ycsb_cpu{}.csv", level.percent()));
            std::fs::write(&file, "raw")?;
            Ok(RunArtifact {
                level,
                run_dir: run_dir.to_path_buf(),
                prefix: format!("ycsb_cpu{}", level.percent()),
                files: vec![file],
            })
        }
    }

    #[derive(Default)]
    struct FakeSummary {
        fail_at: Option<u8>,
    }

    #[async_trait]
    impl Summarizer for FakeSummary {
        async fn summarize(&self, artifact: &RunArtifact) -> Result<SummaryRecord, CampaignError> {
            let pct = artifact.level.percent();
            if self.fail_at == Some(pct) {
                return Err(CampaignError::SummaryMissing {
                    level: artifact.level,
                    reason: "no file".into(),
                });
            }
            let thr = 1000.0 * f64::from(100 - pct) / 100.0;
            Ok(SummaryRecord::new(artifact.level, Some(thr), Some(500.0)))
        }
    }

    fn config(dir: &Path, levels: &[u8]) -> CampaignConfig {
        let mut config = CampaignConfig::default();
        config.cluster.hosts = vec!["h1".into(), "h2".into(), "h3".into()];
        config.campaign.levels = levels.iter().map(|p| DegradationLevel::new(*p).unwrap()).collect();
        config.campaign.settle_secs = 0;
        config.global.results_dir = dir.to_path_buf();
        config
    }

    fn exec_with_cpus(cpus: u32) -> Arc<ScriptedExec> {
        let exec = Arc::new(ScriptedExec::new());
        exec.on("nproc", Reply::Output(CommandOutput::ok(cpus.to_string())));
        exec
    }

    fn campaign<'a>(
        config: &'a CampaignConfig,
        exec: &Arc<ScriptedExec>,
        load: FakeLoad,
        summary: FakeSummary,
    ) -> Campaign<'a> {
        Campaign::new(config, exec.clone(), Arc::new(load), Arc::new(summary))
    }

    fn never() -> std::future::Pending<String> {
        std::future::pending()
    }

    #[tokio::test]
    async fn test_levels_run_in_configured_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[50, 0, 25]);
        let exec = exec_with_cpus(8);
        let load = Arc::new(FakeLoad::default());
        let c = Campaign::new(&config, exec.clone(), load.clone(), Arc::new(FakeSummary::default()));

        let outcome = c.run_until(never()).await.unwrap();

        assert_eq!(*load.runs.lock().unwrap(), vec![50, 0, 25]);
        assert!(outcome.success());
        assert!(outcome.abort.is_none());
        let ds = outcome.dataset.as_ref().unwrap();
        assert_eq!(ds.baseline_level, DegradationLevel::BASELINE);
        assert!(exec.all_unconstrained());
        assert!(dir.path().join(CAMPAIGN_REPORT).exists());
        assert!(dir.path().join("aggregate.csv").exists());
        assert_eq!(outcome.states().last(), Some(&CampaignState::Done));
        assert!(outcome.states().windows(2).all(|w| w[0].allows(w[1])));
    }

    #[tokio::test]
    async fn test_apply_failure_aborts_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[0, 50, 75]);
        let exec = exec_with_cpus(8);
        exec.on_host("h3", "--cpu-quota=400000", Reply::Output(CommandOutput::failed(1, "cgroup busy")));
        let load = Arc::new(FakeLoad::default());
        let c = Campaign::new(&config, exec.clone(), load.clone(), Arc::new(FakeSummary::default()));

        let outcome = c.run_until(never()).await.unwrap();

        assert!(matches!(
            outcome.abort,
            Some(AbortReason::ConstraintApply { ref detail, .. }) if detail.contains("cgroup busy")
        ));
        assert!(!outcome.interrupted);
        assert_eq!(*load.runs.lock().unwrap(), vec![0]);
        assert_eq!(outcome.levels_with_data.len(), 1);
        assert_eq!(outcome.levels_not_run.len(), 2);
        assert!(outcome.success());
        assert!(exec.all_unconstrained());
        assert!(outcome.states().contains(&CampaignState::Aborting));
    }

    #[tokio::test]
    async fn test_signal_during_settle_restores() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), &[50, 75]);
        config.campaign.settle_secs = 30;
        let exec = exec_with_cpus(8);
        let c = campaign(&config, &exec, FakeLoad::default(), FakeSummary::default());

        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "SIGINT".to_string()
        };
        let outcome = c.run_until(shutdown).await.unwrap();

        assert!(outcome.interrupted);
        assert_eq!(outcome.abort, Some(AbortReason::Signal { signal: "SIGINT".into() }));
        assert!(!outcome.success());
        assert!(outcome.dataset.is_none());
        assert!(exec.all_unconstrained());
        assert_eq!(exec.count("--cpu-quota=-1"), 3);
    }

    #[tokio::test]
    async fn test_deadline_restores() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), &[25]);
        config.campaign.settle_secs = 30;
        config.campaign.deadline_secs = Some(0);
        let exec = exec_with_cpus(4);
        let c = campaign(&config, &exec, FakeLoad::default(), FakeSummary::default());

        let outcome = c.run_until(never()).await.unwrap();
        assert_eq!(outcome.abort, Some(AbortReason::Deadline { secs: 0 }));
        assert!(exec.all_unconstrained());
    }

    #[tokio::test]
    async fn test_run_and_collect_failures_leave_absent_levels() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[0, 25, 50]);
        let exec = exec_with_cpus(8);
        let load = FakeLoad {
            fail_at: Some(25),
            ..FakeLoad::default()
        };
        let c = campaign(&config, &exec, load, FakeSummary { fail_at: Some(50) });

        let outcome = c.run_until(never()).await.unwrap();

        assert!(outcome.abort.is_none());
        assert_eq!(outcome.levels_with_data, vec![DegradationLevel::BASELINE]);
        assert_eq!(outcome.levels_without_data.len(), 2);
        assert_eq!(outcome.dataset.as_ref().unwrap().missing_levels.len(), 2);
        assert!(exec.all_unconstrained());

        let csv = std::fs::read_to_string(dir.path().join("aggregate.csv")).unwrap();
        assert!(csv.contains("\n25,75,,,\n"));
    }

    #[tokio::test]
    async fn test_panic_restores_then_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[50]);
        let exec = exec_with_cpus(8);
        let load = FakeLoad {
            panic_at: Some(50),
            ..FakeLoad::default()
        };
        let c = campaign(&config, &exec, load, FakeSummary::default());

        let result = AssertUnwindSafe(c.run_until(never())).catch_unwind().await;
        assert!(result.is_err());
        assert!(exec.all_unconstrained());
        assert_eq!(exec.count("--cpu-quota=-1"), 3);
    }

    #[tokio::test]
    async fn test_end_to_end_quota_and_baseline_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[0, 50]);
        let exec = exec_with_cpus(8);
        let load = Arc::new(FakeLoad::default());
        let c = Campaign::new(&config, exec.clone(), load.clone(), Arc::new(FakeSummary::default()));

        let outcome = c.run_until(never()).await.unwrap();

        let calls = exec.calls();
        let level0: Vec<_> = calls
            .iter()
            .filter(|c| c.command.starts_with("docker update --cpu-quota=-1"))
            .collect();
        let level50: Vec<_> = calls
            .iter()
            .filter(|c| c.command.contains("--cpu-period=100000 --cpu-quota=400000"))
            .collect();
        // three for level 0, three on restore
        assert_eq!(level0.len(), 6);
        assert_eq!(level50.len(), 3);
        assert!(!calls.iter().any(|c| c.command.contains("--cpu-quota=800000")));
        assert_eq!(*load.runs.lock().unwrap(), vec![0, 50]);
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.capacities.iter().all(|c| c.cpus == 8));
        assert!(exec.all_unconstrained());
    }

    #[tokio::test]
    async fn test_missing_unit_is_fatal_before_any_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[50]);
        let exec = exec_with_cpus(8);
        exec.remove_unit("h2", "cass-node2");
        let c = campaign(&config, &exec, FakeLoad::default(), FakeSummary::default());

        let err = c.run_until(never()).await.unwrap_err();
        assert!(matches!(err, CampaignError::Cluster(_)));
        assert_eq!(exec.count("docker update"), 0);
    }

    #[tokio::test]
    async fn test_unknown_capacity_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[50]);
        let exec = Arc::new(ScriptedExec::new());
        let c = campaign(&config, &exec, FakeLoad::default(), FakeSummary::default());

        let err = c.run_until(never()).await.unwrap_err();
        assert!(err.to_string().contains("Could not determine CPU capacity"));
        assert_eq!(exec.count("docker update"), 0);
    }
}
