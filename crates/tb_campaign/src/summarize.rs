//! Summarizer adapter
//!
//! Turns a run artifact into a [`SummaryRecord`] by invoking the external
//! summarizer on the run directory and reading back the summary file it
//! writes. Result files may carry a timestamp suffix after the configured
//! prefix, so the prefix handed to the summarizer is recovered from the file
//! name with [`base_prefix`]. Only the summary file named for that prefix,
//! written by a summarizer run that exited cleanly, is accepted.

use crate::{CampaignError, RunArtifact};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tb_config::CampaignConfig;
use tb_remote::{LOCAL_HOST, RemoteExec, shell_escape};
use tb_report::SummaryRecord;
use tb_report::sumstat::{read_summary_file, summary_file_name};
use tracing::{info, instrument, warn};

static TRAILING_STAMP: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[_-]\d{4,}$").ok());

/// Produces a summary record for one run
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, artifact: &RunArtifact) -> Result<SummaryRecord, CampaignError>;
}

/// Strip the extension and any trailing date, time or epoch groups.
///
/// Groups are `_` or `-` followed by four or more digits, so
/// `ycsb_cpu50_20240101_120000.csv` becomes `ycsb_cpu50` while a short
/// number such as the level in `ycsb_cpu_50.csv` is kept.
#[must_use]
pub fn base_prefix(file_name: &str) -> String {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    };
    let mut prefix = stem.to_string();
    let Some(re) = TRAILING_STAMP.as_ref() else {
        return prefix;
    };
    while let Some(m) = re.find(&prefix) {
        if m.start() == 0 {
            break;
        }
        prefix.truncate(m.start());
    }
    prefix
}

/// External `-p <prefix> -f <dir> -w <warmup>` summarizer
pub struct SumstatSummarizer {
    exec: Arc<dyn RemoteExec>,
    binary: String,
    warmup: u32,
    timeout: Duration,
}

impl SumstatSummarizer {
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExec>, config: &CampaignConfig) -> Self {
        Self {
            exec,
            binary: config.summarizer.binary.clone(),
            warmup: config.summarizer.warmup_windows,
            timeout: config.summarizer_timeout(),
        }
    }

    /// Prefix to summarize: recovered from the newest artifact name when one
    /// exists, otherwise the configured one.
    fn prefix_for(artifact: &RunArtifact) -> String {
        artifact
            .files
            .last()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map_or_else(|| artifact.prefix.clone(), base_prefix)
    }

    fn command(&self, prefix: &str, dir: &Path) -> String {
        format!(
            "{} -p {} -f {} -w {}",
            self.binary,
            shell_escape(prefix),
            shell_escape(&dir.to_string_lossy()),
            self.warmup
        )
    }
}

#[async_trait]
impl Summarizer for SumstatSummarizer {
    #[instrument(skip(self, artifact), fields(level = %artifact.level))]
    async fn summarize(&self, artifact: &RunArtifact) -> Result<SummaryRecord, CampaignError> {
        artifact.ensure_present()?;
        let level = artifact.level;
        let missing = |reason: String| CampaignError::SummaryMissing { level, reason };

        let prefix = Self::prefix_for(artifact);
        let cmd = self.command(&prefix, &artifact.run_dir);
        let output = self
            .exec
            .execute(LOCAL_HOST, &cmd, self.timeout)
            .await
            .map_err(|e| missing(e.to_string()))?;
        if !output.success() {
            warn!(exit_code = output.exit_code, stderr = %output.stderr.trim(), "Summarizer failed");
            return Err(missing(format!(
                "summarizer exit {}: {}",
                output.exit_code,
                output.stderr.lines().last().unwrap_or_default()
            )));
        }

        let path = artifact.run_dir.join(summary_file_name(&prefix, self.warmup));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(missing(format!("{} not written", path.display())));
        }

        let values = read_summary_file(&path).map_err(|e| missing(e.to_string()))?;
        info!(
            prefix = %prefix,
            throughput = ?values.throughput,
            latency = ?values.latency,
            "Summarized run"
        );
        Ok(SummaryRecord::new(level, values.throughput, values.latency))
    }
}
