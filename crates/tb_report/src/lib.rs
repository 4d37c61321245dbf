//! `tb_report` - Result aggregation for throttlebench
//!
//! This crate provides:
//! - The per-level [`SummaryRecord`] and the normalized [`AggregateDataset`]
//! - Aggregation with baseline selection ([`aggregate`])
//! - CSV, JSON and table rendering ([`render`])
//! - Summary file parsing with column-name fallbacks ([`sumstat`])
//! - Rebuilding the aggregate from a results directory ([`recombine`])
//!
//! Absent measurements stay absent. A level whose run produced nothing is
//! carried as `None` and listed in [`AggregateDataset::missing_levels`]; it is
//! never turned into a zero.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tb_config::DegradationLevel;
use thiserror::Error;
use tracing::{info, warn};

pub mod recombine;
pub mod render;
pub mod sumstat;

pub use recombine::recombine;
pub use render::{parse_point, render_table, to_json, write_csv};
pub use sumstat::{SummaryValues, parse_summary, read_summary_file, summary_file_name};

/// File name of the persisted aggregate table
pub const AGGREGATE_CSV: &str = "aggregate.csv";
/// File name of the persisted aggregate dataset in JSON form
pub const AGGREGATE_JSON: &str = "aggregate.json";

/// Reporting errors
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Aggregation failed: {0}")]
    Aggregation(String),

    #[error("Invalid data point '{point}': {reason}")]
    InvalidPoint { point: String, reason: String },

    #[error("Unreadable summary {}: {reason}", path.display())]
    Summary { path: PathBuf, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Summarized measurement for one degradation level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub level: DegradationLevel,
    /// Operations per second
    pub throughput: Option<f64>,
    /// Average latency in microseconds
    pub latency: Option<f64>,
}

impl SummaryRecord {
    #[must_use]
    pub fn new(level: DegradationLevel, throughput: Option<f64>, latency: Option<f64>) -> Self {
        Self {
            level,
            throughput,
            latency,
        }
    }

    /// Record for a level that produced no usable data
    #[must_use]
    pub fn absent(level: DegradationLevel) -> Self {
        Self::new(level, None, None)
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.throughput.is_some()
    }
}

/// One row of the normalized dataset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    #[serde(rename = "cpu_pct")]
    pub level: DegradationLevel,
    pub cpu_availability_pct: u8,
    pub throughput: f64,
    pub latency: Option<f64>,
    pub normalized_throughput: Option<f64>,
}

/// Rows sorted by level, normalized against exactly one baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDataset {
    pub rows: Vec<DatasetRow>,
    /// Levels that had a record but no throughput, ascending
    pub missing_levels: Vec<DegradationLevel>,
    pub baseline_level: DegradationLevel,
    /// True when no level-0 row existed and the lowest level stood in
    pub baseline_approximate: bool,
}

/// A row as printed or persisted; missing levels carry no measurements
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportRow {
    pub level: DegradationLevel,
    pub throughput: Option<f64>,
    pub latency: Option<f64>,
    pub normalized_throughput: Option<f64>,
}

impl AggregateDataset {
    #[must_use]
    pub fn row(&self, level: DegradationLevel) -> Option<&DatasetRow> {
        self.rows.iter().find(|r| r.level == level)
    }

    /// Rows with data followed by one blank row per missing level
    #[must_use]
    pub fn report_rows(&self) -> Vec<ReportRow> {
        let present = self.rows.iter().map(|r| ReportRow {
            level: r.level,
            throughput: Some(r.throughput),
            latency: r.latency,
            normalized_throughput: r.normalized_throughput,
        });
        let missing = self.missing_levels.iter().map(|level| ReportRow {
            level: *level,
            throughput: None,
            latency: None,
            normalized_throughput: None,
        });
        present.chain(missing).collect()
    }

    /// Write `aggregate.csv` and `aggregate.json` into `dir`.
    ///
    /// # Errors
    /// Returns a [`ReportError`] if either file cannot be written.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        std::fs::create_dir_all(dir)?;
        let csv_path = dir.join(AGGREGATE_CSV);
        let file = std::fs::File::create(&csv_path)?;
        write_csv(self, file)?;

        let json_path = dir.join(AGGREGATE_JSON);
        std::fs::write(&json_path, format!("{}\n", to_json(self)?))?;

        info!(path = %csv_path.display(), rows = self.rows.len(), missing = self.missing_levels.len(), "Wrote aggregate");
        Ok(csv_path)
    }
}

/// Sort, pick the baseline and normalize.
///
/// Later records for a level replace earlier ones. The baseline is the level-0
/// row when it has throughput, otherwise the lowest level with throughput, in
/// which case the dataset is flagged approximate. Normalized throughput is
/// left empty for zero throughput or a non-positive baseline.
///
/// # Errors
/// Returns [`ReportError::Aggregation`] when no record carries throughput.
pub fn aggregate(records: &[SummaryRecord]) -> Result<AggregateDataset, ReportError> {
    let mut by_level: BTreeMap<DegradationLevel, SummaryRecord> = BTreeMap::new();
    for record in records {
        if by_level.insert(record.level, *record).is_some() {
            warn!(level = %record.level, "Duplicate record, keeping the later one");
        }
    }

    let mut missing_levels = Vec::new();
    let mut present = Vec::new();
    for (level, record) in by_level {
        match record.throughput {
            Some(throughput) if throughput.is_finite() => present.push((level, throughput, record.latency)),
            _ => missing_levels.push(level),
        }
    }

    // Sorted ascending, so a level-0 row is always first when present.
    let Some(&(baseline_level, baseline, _)) = present.first() else {
        return Err(ReportError::Aggregation(format!(
            "no level produced throughput ({} record(s) absent)",
            missing_levels.len()
        )));
    };
    let baseline_approximate = !baseline_level.is_baseline();
    if baseline_approximate {
        warn!(baseline = %baseline_level, "No baseline measurement, normalizing against lowest level");
    }

    let rows = present
        .into_iter()
        .map(|(level, throughput, latency)| DatasetRow {
            level,
            cpu_availability_pct: level.availability(),
            throughput,
            latency,
            normalized_throughput: normalize(throughput, baseline),
        })
        .collect();

    Ok(AggregateDataset {
        rows,
        missing_levels,
        baseline_level,
        baseline_approximate,
    })
}

fn normalize(throughput: f64, baseline: f64) -> Option<f64> {
    (throughput > 0.0 && baseline > 0.0).then(|| throughput / baseline)
}
