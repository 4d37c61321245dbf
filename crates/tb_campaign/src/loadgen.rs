//! Load generator adapter
//!
//! The load generator is an external binary driven by a flat `key=value`
//! workload file. Each level gets its own run directory holding the workload
//! file, the captured `run.log` and whatever result files the generator wrote
//! under the level's output prefix. A directory left by an earlier campaign
//! is moved aside before the run, so every artifact belongs to this run.

use crate::{CampaignError, RunArtifact};
use async_trait::async_trait;
use chrono::Utc;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tb_config::{CampaignConfig, DegradationLevel};
use tb_remote::{CommandOutput, LOCAL_HOST, RemoteExec, shell_escape};
use tracing::{debug, info, instrument, warn};

pub const WORKLOAD_FILE: &str = "workload.properties";
pub const RUN_LOG: &str = "run.log";

/// Upper bound for the optional data load phase
const LOAD_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Runs the workload for one level
#[async_trait]
pub trait LoadGenerator: Send + Sync {
    /// Populate the table before the campaign.
    async fn load(&self, dir: &Path) -> Result<(), CampaignError>;

    /// Run the workload once for `level`, writing into `run_dir`.
    async fn run(&self, level: DegradationLevel, run_dir: &Path) -> Result<RunArtifact, CampaignError>;
}

/// Contents of one workload file
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub hosts: Vec<String>,
    pub port: u16,
    pub threads: u32,
    pub read_proportion: f64,
    pub update_proportion: f64,
    pub insert_proportion: f64,
    pub scan_proportion: f64,
    pub record_count: u64,
    pub operation_count: u64,
    pub max_execution_secs: u64,
    pub keyspace: String,
    pub table: String,
    pub label: String,
    pub output_prefix: String,
}

/// Address the load generator should use for a configured host entry
#[must_use]
pub fn node_address(host: &str) -> String {
    if host == LOCAL_HOST {
        return "127.0.0.1".to_string();
    }
    let host = host.rsplit_once('@').map_or(host, |(_, h)| h);
    match host.rsplit_once(':') {
        Some((name, port)) if port.parse::<u16>().is_ok() => name.to_string(),
        _ => host.to_string(),
    }
}

impl WorkloadSpec {
    fn base(config: &CampaignConfig, label: String, output_prefix: String) -> Self {
        let w = &config.workload;
        Self {
            hosts: config.cluster.hosts.iter().map(|h| node_address(h)).collect(),
            port: w.port,
            threads: w.threads,
            read_proportion: w.read_proportion,
            update_proportion: w.update_proportion,
            insert_proportion: w.insert_proportion,
            scan_proportion: w.scan_proportion,
            record_count: w.record_count,
            operation_count: w.operation_count,
            max_execution_secs: w.duration_secs,
            keyspace: config.schema.keyspace.clone(),
            table: config.schema.table.clone(),
            label,
            output_prefix,
        }
    }

    /// Workload for one measured level
    #[must_use]
    pub fn for_level(config: &CampaignConfig, level: DegradationLevel) -> Self {
        let label = format!("cpu{}", level.percent());
        let prefix = format!("{}_{label}", config.workload.output_prefix);
        Self::base(config, label, prefix)
    }

    /// Workload for the data load phase
    #[must_use]
    pub fn for_load(config: &CampaignConfig) -> Self {
        let prefix = format!("{}_load", config.workload.output_prefix);
        Self::base(config, "load".to_string(), prefix)
    }

    /// Render as `key=value` lines
    #[must_use]
    pub fn to_properties(&self) -> String {
        let mut out = String::new();
        let pairs: [(&str, String); 14] = [
            ("hosts", self.hosts.join(",")),
            ("port", self.port.to_string()),
            ("threadcount", self.threads.to_string()),
            ("readproportion", self.read_proportion.to_string()),
            ("updateproportion", self.update_proportion.to_string()),
            ("insertproportion", self.insert_proportion.to_string()),
            ("scanproportion", self.scan_proportion.to_string()),
            ("recordcount", self.record_count.to_string()),
            ("operationcount", self.operation_count.to_string()),
            ("maxexecutiontime", self.max_execution_secs.to_string()),
            ("cassandra.keyspace", self.keyspace.clone()),
            ("table", self.table.clone()),
            ("label", self.label.clone()),
            ("outputfileprefix", self.output_prefix.clone()),
        ];
        for (key, value) in pairs {
            let _ = writeln!(out, "{key}={value}");
        }
        out
    }
}

/// Result files in `dir` written under `prefix`, oldest name first
///
/// # Errors
/// Returns [`CampaignError::Io`] if the directory cannot be listed.
pub fn find_artifact_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, CampaignError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name().and_then(|n| n.to_str()).is_some_and(|n| {
                    n.starts_with(prefix) && !n.ends_with("_sumstat.csv")
                })
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Move a run directory left over from an earlier campaign aside, so the
/// coming run starts empty and nothing stale can be mistaken for its output.
///
/// The directory is renamed to `<name>.superseded-<stamp>`, which result
/// recombination does not treat as a level directory. Returns the new path.
///
/// # Errors
/// Returns [`CampaignError::Io`] if the rename fails.
pub async fn supersede_previous(dir: &Path) -> Result<Option<PathBuf>, CampaignError> {
    if !tokio::fs::try_exists(dir).await? {
        return Ok(None);
    }
    let name = dir
        .file_name()
        .map_or_else(|| "run".to_string(), |n| n.to_string_lossy().to_string());
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let target = dir.with_file_name(format!("{name}.superseded-{stamp}"));
    tokio::fs::rename(dir, &target).await?;
    info!(from = %dir.display(), to = %target.display(), "Moved previous run aside");
    Ok(Some(target))
}

/// YCSB-style command-line load generator run on the coordinator
pub struct YcsbRunner {
    exec: Arc<dyn RemoteExec>,
    config: CampaignConfig,
}

impl YcsbRunner {
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExec>, config: &CampaignConfig) -> Self {
        Self {
            exec,
            config: config.clone(),
        }
    }

    /// Run one phase in `dir`. A non-zero exit is returned as `Ok`; the
    /// caller decides what it means.
    async fn invoke(
        &self,
        phase: &str,
        spec: &WorkloadSpec,
        dir: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, String> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| e.to_string())?;
        tokio::fs::write(dir.join(WORKLOAD_FILE), spec.to_properties())
            .await
            .map_err(|e| e.to_string())?;

        let cmd = format!(
            "cd {} && {} {phase} {} -P {WORKLOAD_FILE}",
            shell_escape(&dir.to_string_lossy()),
            self.config.workload.binary,
            shell_escape(&self.config.workload.kind),
        );
        debug!(cmd = %cmd, "Invoking load generator");

        let start = Instant::now();
        let result = self.exec.execute(LOCAL_HOST, &cmd, timeout).await;

        let log = match &result {
            Ok(output) => format!(
                "$ {cmd}\n# exit {}\n{}\n{}",
                output.exit_code, output.stdout, output.stderr
            ),
            Err(e) => format!("$ {cmd}\n# error: {e}\n"),
        };
        if let Err(e) = tokio::fs::write(dir.join(RUN_LOG), log).await {
            warn!(dir = %dir.display(), error = %e, "Could not write run log");
        }

        let output = result.map_err(|e| e.to_string())?;
        info!(
            phase,
            label = %spec.label,
            exit_code = output.exit_code,
            duration_ms = start.elapsed().as_millis(),
            "Load generator finished"
        );
        Ok(output)
    }
}

fn exit_reason(output: &CommandOutput) -> String {
    let tail = output.stderr.lines().last().unwrap_or_default();
    format!("exit {}: {tail}", output.exit_code)
}

#[async_trait]
impl LoadGenerator for YcsbRunner {
    #[instrument(skip(self, dir))]
    async fn load(&self, dir: &Path) -> Result<(), CampaignError> {
        let spec = WorkloadSpec::for_load(&self.config);
        let output = self
            .invoke("load", &spec, dir, LOAD_TIMEOUT)
            .await
            .map_err(CampaignError::DataLoad)?;
        if output.success() {
            Ok(())
        } else {
            Err(CampaignError::DataLoad(exit_reason(&output)))
        }
    }

    #[instrument(skip(self, run_dir, level), fields(level = %level))]
    async fn run(&self, level: DegradationLevel, run_dir: &Path) -> Result<RunArtifact, CampaignError> {
        supersede_previous(run_dir).await?;
        let spec = WorkloadSpec::for_level(&self.config, level);
        let output = self
            .invoke("run", &spec, run_dir, self.config.run_timeout())
            .await
            .map_err(|reason| CampaignError::LoadGenerator { level, reason })?;

        let files = find_artifact_files(run_dir, &spec.output_prefix)?;
        if !output.success() {
            if files.is_empty() {
                return Err(CampaignError::LoadGenerator {
                    level,
                    reason: exit_reason(&output),
                });
            }
            warn!(
                exit_code = output.exit_code,
                files = files.len(),
                "Load generator exited non-zero but wrote results; keeping them"
            );
        }
        Ok(RunArtifact {
            level,
            run_dir: run_dir.to_path_buf(),
            prefix: spec.output_prefix,
            files,
        })
    }
}
