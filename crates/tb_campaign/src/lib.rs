//! `tb_campaign` - Degradation campaign controller
//!
//! This crate provides:
//! - The campaign state machine ([`controller`])
//! - A scoped guard that restores every unit on every exit path ([`guard`])
//! - The load generator adapter ([`loadgen`])
//! - The summarizer adapter and artifact prefix handling ([`summarize`])

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tb_cluster::ClusterError;
use tb_config::{ConfigError, DegradationLevel};
use tb_remote::RemoteError;
use tb_report::ReportError;
use thiserror::Error;

pub mod controller;
pub mod guard;
pub mod loadgen;
pub mod summarize;

pub use controller::{
    AbortReason, CAMPAIGN_REPORT, Campaign, CampaignOutcome, Transition, shutdown_signal,
};
pub use guard::{ConstraintGuard, RestoreReport};
pub use loadgen::{LoadGenerator, WorkloadSpec, YcsbRunner};
pub use summarize::{SumstatSummarizer, Summarizer, base_prefix};

/// Campaign errors
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("No run artifact for {level} in {}", dir.display())]
    ArtifactMissing {
        level: DegradationLevel,
        dir: PathBuf,
    },

    #[error("No summary for {level}: {reason}")]
    SummaryMissing {
        level: DegradationLevel,
        reason: String,
    },

    #[error("Load generator failed at {level}: {reason}")]
    LoadGenerator {
        level: DegradationLevel,
        reason: String,
    },

    #[error("Data load failed: {0}")]
    DataLoad(String),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Init,
    MeasuringCapacity,
    LoadingData,
    Applying,
    Settling,
    Running,
    Collecting,
    Aborting,
    Restoring,
    Aggregating,
    Done,
}

impl CampaignState {
    /// Whether `next` may follow `self`
    #[must_use]
    pub fn allows(self, next: Self) -> bool {
        use CampaignState::{
            Aborting, Aggregating, Applying, Collecting, Done, Init, LoadingData,
            MeasuringCapacity, Restoring, Running, Settling,
        };
        matches!(
            (self, next),
            (Applying | Settling | Running | Collecting, Aborting)
                | (Init, MeasuringCapacity)
                | (MeasuringCapacity, LoadingData | Applying)
                | (LoadingData, Applying)
                | (Applying, Settling)
                | (Settling, Running)
                | (Running, Collecting | Applying | Restoring)
                | (Collecting, Applying | Restoring)
                | (Aborting, Restoring)
                | (Restoring, Aggregating)
                | (Aggregating, Done)
        )
    }

    /// States inside the per-level loop
    #[must_use]
    pub fn is_in_loop(self) -> bool {
        matches!(
            self,
            Self::Applying | Self::Settling | Self::Running | Self::Collecting
        )
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::MeasuringCapacity => "measuring_capacity",
            Self::LoadingData => "loading_data",
            Self::Applying => "applying",
            Self::Settling => "settling",
            Self::Running => "running",
            Self::Collecting => "collecting",
            Self::Aborting => "aborting",
            Self::Restoring => "restoring",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Raw output of one load-generator run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunArtifact {
    pub level: DegradationLevel,
    pub run_dir: PathBuf,
    /// Prefix the load generator was told to use
    pub prefix: String,
    /// Result files found in `run_dir` that start with `prefix`
    pub files: Vec<PathBuf>,
}

impl RunArtifact {
    /// Fail with [`CampaignError::ArtifactMissing`] when no file was produced.
    ///
    /// # Errors
    /// See above.
    pub fn ensure_present(&self) -> Result<(), CampaignError> {
        if self.files.is_empty() {
            Err(CampaignError::ArtifactMissing {
                level: self.level,
                dir: self.run_dir.clone(),
            })
        } else {
            Ok(())
        }
    }
}
