//! `tb_cli` - Command-line interface for throttlebench
//!
//! This crate provides:
//! - clap-based command definitions
//! - Config loading with `TB_*` and flag overrides
//! - Every subcommand (setup, bench, aggregate, report, status, restore, config)
//! - The mapping from failures to process exit codes

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tb_campaign::{
    AbortReason, Campaign, CampaignError, CampaignOutcome, ConstraintGuard, SumstatSummarizer, YcsbRunner,
};
use tb_cluster::{ClusterError, ClusterSupervisor, Fleet, LimitState, ResourceController, WorkloadUnit};
use tb_config::{CampaignConfig, ConfigError, DegradationLevel, HostKeyPolicy, parse_levels};
use tb_remote::{ConnectionPolicy, Executor, RemoteError, RemoteExec};
use tb_report::{AggregateDataset, ReportError, aggregate, parse_point, recombine, render_table, to_json, write_csv};
use thiserror::Error;
use tracing::{info, warn};

/// CLI errors
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("No usable data: {0}")]
    NoData(String),

    #[error("Restore incomplete for: {}", .0.join(", "))]
    RestoreIncomplete(Vec<String>),

    #[error("Campaign aborted: {0}")]
    ConstraintApply(String),

    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Remote error: {0}")]
    RemoteError(#[from] RemoteError),

    #[error("Cluster error: {0}")]
    ClusterError(#[from] ClusterError),

    #[error("Campaign error: {0}")]
    CampaignError(#[from] CampaignError),

    #[error("Report error: {0}")]
    ReportError(#[from] ReportError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code: 2 config, 3 no data, 4 remote failure, 1 otherwise
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ConfigError(_) => 2,
            Self::NoData(_) => 3,
            Self::RemoteError(_) | Self::RestoreIncomplete(_) | Self::ConstraintApply(_) => 4,
            Self::ClusterError(e) => cluster_exit_code(e),
            Self::CampaignError(e) => match e {
                CampaignError::Config(_) => 2,
                CampaignError::Cluster(e) => cluster_exit_code(e),
                CampaignError::Remote(_) | CampaignError::DataLoad(_) => 4,
                CampaignError::Report(ReportError::Aggregation(_)) => 3,
                _ => 1,
            },
            Self::ReportError(ReportError::Aggregation(_)) => 3,
            Self::CommandFailed(_) | Self::ReportError(_) | Self::IoError(_) => 1,
        }
    }
}

fn cluster_exit_code(err: &ClusterError) -> u8 {
    match err {
        ClusterError::Config(_) => 2,
        _ => 4,
    }
}

/// Output format for tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Csv,
    Json,
    Table,
}

/// Main CLI application
#[derive(Parser, Debug)]
#[command(name = "tb")]
#[command(
    author,
    version,
    about = "throttlebench - CPU degradation benchmark campaigns for replicated databases"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Hosts, comma separated; the first is the seed
    #[arg(long, global = true, value_delimiter = ',')]
    pub hosts: Option<Vec<String>>,

    /// Host-key policy: strict, accept-new or insecure
    #[arg(long, global = true)]
    pub host_key_policy: Option<HostKeyPolicy>,

    /// Results directory
    #[arg(long, global = true)]
    pub results_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bring up the database cluster (exactly three hosts)
    Setup {
        /// Do not create keyspace and table
        #[arg(long)]
        skip_schema: bool,
    },

    /// Run the degradation campaign
    Bench {
        /// Degradation levels, e.g. "0,25%,50"
        #[arg(long)]
        levels: Option<String>,

        /// Seconds to wait after each constraint change
        #[arg(long)]
        settle_secs: Option<u64>,

        /// Load-generator run duration in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Run the data load phase first
        #[arg(long)]
        load_data: bool,
    },

    /// Rebuild the aggregate from the results directory
    Aggregate {
        /// Warmup windows the summaries were produced with
        #[arg(short, long)]
        warmup: Option<u32>,

        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Normalize ad hoc `pct,throughput,latency` points (N/A allowed)
    Report {
        #[arg(required = true)]
        points: Vec<String>,

        #[arg(long, value_enum, default_value = "csv")]
        format: OutputFormat,

        /// Also write the CSV table to this file
        #[arg(long)]
        output_csv: Option<PathBuf>,
    },

    /// Show capacity and current CPU limit of every unit
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Remove CPU limits from every unit
    Restore,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Check the configuration for a campaign
    Validate,
}

/// Logging settings resolved before the subscriber is installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct UnitStatus {
    unit: WorkloadUnit,
    cpus: Option<u32>,
    limit: Option<String>,
    error: Option<String>,
}

impl Cli {
    /// Log level and format. Config errors are ignored here; they surface
    /// when the command loads the config.
    #[must_use]
    pub fn log_settings(&self) -> LogSettings {
        let config = self.base_config().ok();
        let level = if self.verbose {
            "debug".to_string()
        } else {
            config
                .as_ref()
                .map_or_else(|| "info".to_string(), |c| c.global.log_level.to_lowercase())
        };
        LogSettings {
            level,
            json: self.json_logs || config.is_some_and(|c| c.global.json_logs),
        }
    }

    fn base_config(&self) -> Result<CampaignConfig, ConfigError> {
        match &self.config {
            Some(path) => CampaignConfig::load_with_env(path),
            None => CampaignConfig::discover_with_env(),
        }
    }

    /// Config file, then `TB_*` variables, then global flags.
    ///
    /// # Errors
    /// Returns a [`CliError::ConfigError`] when loading or validation fails.
    pub fn load_config(&self) -> Result<CampaignConfig, CliError> {
        let mut config = self.base_config()?;
        if let Some(hosts) = &self.hosts {
            config.cluster.hosts = hosts
                .iter()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        if let Some(policy) = self.host_key_policy {
            config.connection.host_key_policy = policy;
        }
        if let Some(dir) = &self.results_dir {
            config.global.results_dir = tb_config::expand_path(dir);
        }
        Ok(config)
    }

    fn executor(config: &CampaignConfig) -> Arc<dyn RemoteExec> {
        Arc::new(Executor::new(ConnectionPolicy::from_config(config)))
    }

    /// Run the CLI
    ///
    /// # Errors
    /// Returns a [`CliError`] whose [`CliError::exit_code`] is the process
    /// exit status.
    pub async fn run(self) -> Result<(), CliError> {
        match &self.command {
            Commands::Setup { skip_schema } => {
                let mut config = self.load_config()?;
                config.cluster.skip_schema |= *skip_schema;
                config.validate_for_bringup()?;
                let units = ClusterSupervisor::new(Self::executor(&config), &config)
                    .bring_up()
                    .await?;
                for unit in &units {
                    println!("ready  {unit}");
                }
            }
            Commands::Bench {
                levels,
                settle_secs,
                duration,
                load_data,
            } => {
                let mut config = self.load_config()?;
                if let Some(levels) = levels {
                    config.campaign.levels = parse_levels(levels)?;
                }
                if let Some(secs) = settle_secs {
                    config.campaign.settle_secs = *secs;
                }
                if let Some(secs) = duration {
                    config.workload.duration_secs = *secs;
                }
                config.validate_for_campaign()?;
                run_bench(&config, *load_data).await?;
            }
            Commands::Aggregate { warmup, format } => {
                let config = self.load_config()?;
                let warmup = warmup.unwrap_or(config.summarizer.warmup_windows);
                let dataset = recombine(&config.global.results_dir, warmup)?;
                print_dataset(&dataset, *format)?;
            }
            Commands::Report {
                points,
                format,
                output_csv,
            } => {
                let records = points
                    .iter()
                    .map(|p| parse_point(p))
                    .collect::<Result<Vec<_>, _>>()?;
                let dataset = aggregate(&records)?;
                if let Some(path) = output_csv {
                    write_csv(&dataset, std::fs::File::create(path)?)?;
                    info!(path = %path.display(), "Wrote CSV");
                }
                print_dataset(&dataset, *format)?;
            }
            Commands::Status { json } => {
                let config = self.load_config()?;
                config.validate_for_campaign()?;
                let statuses = unit_statuses(&config).await;
                if *json {
                    print_json(&statuses);
                } else {
                    println!("{:<24} {:<20} {:>5}  LIMIT", "UNIT", "HOST", "CPUS");
                    for s in &statuses {
                        let cpus = s.cpus.map_or_else(|| "?".to_string(), |c| c.to_string());
                        let limit = s
                            .limit
                            .clone()
                            .or_else(|| s.error.clone())
                            .unwrap_or_default();
                        println!("{:<24} {:<20} {cpus:>5}  {limit}", s.unit.name, s.unit.host);
                    }
                }
            }
            Commands::Restore => {
                let config = self.load_config()?;
                config.validate_for_campaign()?;
                let controller = ResourceController::new(Self::executor(&config), &config);
                let units = WorkloadUnit::from_config(&config);
                let report = ConstraintGuard::acquire(
                    &controller,
                    Fleet::new(config.connection.max_concurrent),
                    units,
                )
                .release()
                .await;
                for unit in &report.cleared {
                    println!("cleared  {unit}");
                }
                for unit in &report.already_absent {
                    println!("absent   {unit}");
                }
                if !report.is_complete() {
                    return Err(CliError::RestoreIncomplete(
                        report
                            .failed
                            .iter()
                            .map(|(unit, reason)| format!("{unit} ({reason})"))
                            .collect(),
                    ));
                }
            }
            Commands::Config { command } => match command {
                ConfigCommands::Show { json } => {
                    let config = self.load_config()?;
                    if *json {
                        print_json(&config);
                    } else {
                        println!("{}", config.to_toml()?);
                    }
                }
                ConfigCommands::Validate => {
                    let config = self.load_config()?;
                    config.validate_for_campaign()?;
                    println!(
                        "✓ Configuration is valid: {} host(s), levels {}",
                        config.cluster.hosts.len(),
                        format_levels(&config.campaign.levels)
                    );
                    if let Err(e) = config.validate_for_bringup() {
                        println!("  note: setup unavailable ({e})");
                    }
                }
            },
        }
        Ok(())
    }
}

async fn run_bench(config: &CampaignConfig, load_data: bool) -> Result<CampaignOutcome, CliError> {
    let exec = Cli::executor(config);
    let campaign = Campaign::new(
        config,
        exec.clone(),
        Arc::new(YcsbRunner::new(exec.clone(), config)),
        Arc::new(SumstatSummarizer::new(exec, config)),
    )
    .with_load_phase(load_data);

    let outcome = campaign.run().await?;
    print_outcome(&outcome);
    check_outcome(&outcome)?;
    Ok(outcome)
}

/// Failure class of a finished campaign. Units left constrained come
/// first, then an aborted apply, then the absence of any data.
fn check_outcome(outcome: &CampaignOutcome) -> Result<(), CliError> {
    if !outcome.restore.is_complete() {
        warn!("Some units may still be constrained; run `tb restore`");
        return Err(CliError::RestoreIncomplete(
            outcome
                .restore
                .failed
                .iter()
                .map(|(unit, reason)| format!("{unit} ({reason})"))
                .collect(),
        ));
    }
    if let Some(reason @ AbortReason::ConstraintApply { .. }) = &outcome.abort {
        return Err(CliError::ConstraintApply(reason.to_string()));
    }
    if outcome.success() {
        Ok(())
    } else {
        Err(CliError::NoData(match &outcome.abort {
            Some(reason) => format!("no level produced data ({reason})"),
            None => "no level produced data".to_string(),
        }))
    }
}

fn format_levels(levels: &[DegradationLevel]) -> String {
    levels.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn print_outcome(outcome: &CampaignOutcome) {
    if let Some(dataset) = &outcome.dataset {
        print!("{}", render_table(dataset));
    }
    println!();
    println!("Levels with data:    {}", format_levels(&outcome.levels_with_data));
    println!("Levels without data: {}", format_levels(&outcome.levels_without_data));
    if !outcome.levels_not_run.is_empty() {
        println!("Levels not run:      {}", format_levels(&outcome.levels_not_run));
    }
    if let Some(reason) = &outcome.abort {
        println!("Aborted: {reason}");
    }
    println!("Results: {}", outcome.results_dir.display());
}

fn print_dataset(dataset: &AggregateDataset, format: OutputFormat) -> Result<(), CliError> {
    match format {
        OutputFormat::Csv => write_csv(dataset, std::io::stdout().lock())?,
        OutputFormat::Json => println!("{}", to_json(dataset)?),
        OutputFormat::Table => print!("{}", render_table(dataset)),
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    let json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!(r#"{{"error": "serialization failed: {e}"}}"#));
    println!("{json}");
}

async fn unit_statuses(config: &CampaignConfig) -> Vec<UnitStatus> {
    let controller = ResourceController::new(Cli::executor(config), config);
    let controller = &controller;
    let summary = Fleet::new(config.connection.max_concurrent)
        .run("status", WorkloadUnit::from_config(config), |unit| async move {
            let cpus = controller.measure_capacity(&unit.host).await;
            let limit = controller.inspect_limit(&unit).await;
            let error = match (&cpus, &limit) {
                (Err(e), _) | (_, Err(e)) => Some(e.to_string()),
                _ => None,
            };
            Ok::<_, std::convert::Infallible>(UnitStatus {
                cpus: cpus.ok(),
                limit: limit.ok().map(|l: LimitState| l.to_string()),
                error,
                unit,
            })
        })
        .await;
    summary
        .results
        .into_iter()
        .filter_map(|(_, status)| status.ok())
        .collect()
}
