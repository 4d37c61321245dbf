//! Rebuild the aggregate from a results directory
//!
//! Works purely on disk: every `cpu_<pct>/` subdirectory contributes one
//! record from its summary file, so a campaign can be re-aggregated after the
//! fact or stitched together from several partial runs.

use crate::sumstat::read_summary_file;
use crate::{AggregateDataset, ReportError, SummaryRecord, aggregate};
use std::path::{Path, PathBuf};
use tb_config::DegradationLevel;
use tracing::{debug, info, warn};

/// Level encoded in a run directory name such as `cpu_25`
#[must_use]
pub fn level_from_dir_name(name: &str) -> Option<DegradationLevel> {
    let digits = name.strip_prefix("cpu_")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u8>().ok().and_then(|p| DegradationLevel::new(p).ok())
}

/// Newest-named summary file for `warmup` in `dir`, if any
#[must_use]
pub fn find_summary_file(dir: &Path, warmup: u32) -> Option<PathBuf> {
    let suffix = format!("_{warmup}_sumstat.csv");
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(&suffix))
        })
        .max()
}

/// One record per `cpu_<pct>/` directory, absent when its summary is missing
/// or unreadable.
///
/// # Errors
/// Returns [`ReportError::Io`] if `results_dir` cannot be listed.
pub fn collect_records(results_dir: &Path, warmup: u32) -> Result<Vec<SummaryRecord>, ReportError> {
    let mut records = Vec::new();
    for entry in std::fs::read_dir(results_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(level) = name.to_str().and_then(level_from_dir_name) else {
            debug!(dir = ?name, "Skipping non-level directory");
            continue;
        };

        let record = match find_summary_file(&entry.path(), warmup) {
            Some(path) => match read_summary_file(&path) {
                Ok(values) => SummaryRecord::new(level, values.throughput, values.latency),
                Err(e) => {
                    warn!(level = %level, error = %e, "Summary unreadable");
                    SummaryRecord::absent(level)
                }
            },
            None => {
                warn!(level = %level, warmup, "No summary file");
                SummaryRecord::absent(level)
            }
        };
        records.push(record);
    }
    records.sort_by_key(|r| r.level);
    Ok(records)
}

/// Aggregate every level found under `results_dir` and persist the result
/// next to the run directories.
///
/// # Errors
/// Returns a [`ReportError`] if the directory cannot be read, no level has
/// data, or the output cannot be written.
pub fn recombine(results_dir: &Path, warmup: u32) -> Result<AggregateDataset, ReportError> {
    let records = collect_records(results_dir, warmup)?;
    info!(dir = %results_dir.display(), levels = records.len(), "Recombining results");
    let dataset = aggregate(&records)?;
    dataset.persist(results_dir)?;
    Ok(dataset)
}
