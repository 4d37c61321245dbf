mod common;

use async_trait::async_trait;
use common::{campaign_config, init_tracing, write_sumstat};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tb_campaign::{
    AbortReason, CAMPAIGN_REPORT, Campaign, CampaignError, LoadGenerator, RunArtifact, SumstatSummarizer, YcsbRunner,
};
use tb_cluster::testing::{Reply, ScriptedExec};
use tb_config::DegradationLevel;
use tb_remote::CommandOutput;
use tb_report::{AGGREGATE_CSV, recombine};
use tokio::sync::Notify;

/// Writes a raw result file per level and, for levels it knows a result
/// for, the file the summarizer would produce.
#[derive(Default)]
struct RecordedLoad {
    results: Vec<(u8, f64, f64)>,
    runs: Mutex<Vec<u8>>,
    after_first_run: Option<Arc<Notify>>,
}

#[async_trait]
impl LoadGenerator for RecordedLoad {
    async fn load(&self, _dir: &Path) -> Result<(), CampaignError> {
        Ok(())
    }

    async fn run(&self, level: DegradationLevel, run_dir: &Path) -> Result<RunArtifact, CampaignError> {
        self.runs.lock().unwrap().push(level.percent());
        std::fs::create_dir_all(run_dir)?;
        let prefix = format!("ycsb_cpu{}", level.percent());
        let raw = run_dir.join(format!("{prefix}_20250101_120000.csv"));
        std::fs::write(&raw, "[OVERALL], Throughput(ops/sec), 1\n")?;
        if let Some((_, thr, lat)) = self.results.iter().find(|(p, _, _)| *p == level.percent()) {
            write_sumstat(run_dir, &prefix, 2, *thr, *lat);
        }
        if let Some(notify) = &self.after_first_run {
            notify.notify_one();
        }
        Ok(RunArtifact {
            level,
            run_dir: run_dir.to_path_buf(),
            prefix,
            files: vec![raw],
        })
    }
}

fn scripted(cpus: u32) -> Arc<ScriptedExec> {
    let exec = Arc::new(ScriptedExec::new());
    exec.on("nproc", Reply::Output(CommandOutput::ok(cpus.to_string())));
    exec
}

#[tokio::test]
async fn test_campaign_persists_and_recombines() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = campaign_config(dir.path(), &[0, 25, 50]);
    let exec = scripted(4);
    let load = Arc::new(RecordedLoad {
        results: vec![(0, 2000.0, 5.0), (50, 1000.0, 9.0)],
        ..RecordedLoad::default()
    });

    let campaign = Campaign::new(
        &config,
        exec.clone(),
        load.clone(),
        Arc::new(SumstatSummarizer::new(exec.clone(), &config)),
    );
    let outcome = campaign.run_until(std::future::pending()).await?;

    assert!(outcome.success());
    assert!(!outcome.interrupted);
    assert_eq!(*load.runs.lock().unwrap(), vec![0, 25, 50]);
    assert_eq!(outcome.levels_without_data, vec![DegradationLevel::new(25)?]);
    assert!(exec.all_unconstrained());
    assert!(outcome.restore.is_complete());

    let dataset = outcome.dataset.clone().expect("dataset");
    let half = dataset.row(DegradationLevel::new(50)?).expect("row for 50%");
    assert_eq!(half.normalized_throughput, Some(0.5));
    assert_eq!(dataset.missing_levels, vec![DegradationLevel::new(25)?]);

    assert!(dir.path().join(CAMPAIGN_REPORT).is_file());
    let csv = std::fs::read_to_string(dir.path().join(AGGREGATE_CSV))?;
    assert!(csv.contains("50,50,1000.00,9.00,0.5000"));

    let rebuilt = recombine(dir.path(), config.summarizer.warmup_windows)?;
    assert_eq!(rebuilt, dataset);
    Ok(())
}

#[tokio::test]
async fn test_interrupt_restores_every_unit() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let mut config = campaign_config(dir.path(), &[0, 50, 75]);
    config.campaign.settle_secs = 1;
    let exec = scripted(8);
    let notify = Arc::new(Notify::new());
    let load = Arc::new(RecordedLoad {
        results: vec![(0, 4000.0, 3.0)],
        after_first_run: Some(notify.clone()),
        ..RecordedLoad::default()
    });

    let campaign = Campaign::new(
        &config,
        exec.clone(),
        load.clone(),
        Arc::new(SumstatSummarizer::new(exec.clone(), &config)),
    );
    let shutdown = async move {
        notify.notified().await;
        "SIGINT".to_string()
    };
    let outcome = campaign.run_until(shutdown).await?;

    assert!(outcome.interrupted);
    assert!(matches!(outcome.abort, Some(AbortReason::Signal { .. })));
    assert_eq!(*load.runs.lock().unwrap(), vec![0]);
    assert!(outcome.success());
    assert!(!outcome.levels_not_run.is_empty());
    assert!(exec.all_unconstrained());
    Ok(())
}

#[tokio::test]
async fn test_rerun_never_reports_earlier_results() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = campaign_config(dir.path(), &[0, 50]);

    // leftovers of an earlier campaign in both level directories
    for (pct, thr) in [(0u8, 1000.0), (50, 9999.0)] {
        let run_dir = config.run_dir(DegradationLevel::new(pct)?);
        write_sumstat(&run_dir, &format!("ycsb_cpu{pct}"), 2, thr, 4.0);
        std::fs::write(run_dir.join(format!("ycsb_cpu{pct}_20240101_000000.csv")), "old")?;
    }

    // the generator exits 0 without writing anything and the summarizer fails
    let exec = scripted(8);
    exec.on("ycsb-sumstat", Reply::Output(CommandOutput::failed(1, "no input")));
    let campaign = Campaign::new(
        &config,
        exec.clone(),
        Arc::new(YcsbRunner::new(exec.clone(), &config)),
        Arc::new(SumstatSummarizer::new(exec.clone(), &config)),
    );
    let outcome = campaign.run_until(std::future::pending()).await?;

    assert!(outcome.records.iter().all(|r| r.throughput.is_none()));
    assert!(outcome.levels_with_data.is_empty());
    assert_eq!(outcome.levels_without_data.len(), 2);
    assert!(!outcome.success());
    assert!(outcome.dataset.is_none());
    assert!(exec.all_unconstrained());

    // the earlier results are kept aside, not in the level directories
    let rebuilt = recombine(dir.path(), config.summarizer.warmup_windows);
    assert!(rebuilt.is_err());
    Ok(())
}
