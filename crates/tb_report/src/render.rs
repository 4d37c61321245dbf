//! Output renderers for an [`AggregateDataset`]
//!
//! CSV is the persisted format. Throughput and latency carry two decimals,
//! normalized throughput four; absent values are empty fields.

use crate::{AggregateDataset, ReportError, ReportRow, SummaryRecord};
use std::io::Write;
use tb_config::DegradationLevel;

pub const CSV_HEADER: [&str; 5] = [
    "cpu_pct",
    "cpu_availability_pct",
    "throughput",
    "latency",
    "normalized_throughput",
];

const TABLE_HEADER: [&str; 4] = ["CPU avail", "Throughput", "Latency", "NormThr"];
const TABLE_WIDTHS: [usize; 4] = [12, 14, 12, 10];

fn fixed(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(String::new, |v| format!("{v:.decimals$}"))
}

fn csv_fields(row: &ReportRow) -> [String; 5] {
    [
        row.level.percent().to_string(),
        row.level.availability().to_string(),
        fixed(row.throughput, 2),
        fixed(row.latency, 2),
        fixed(row.normalized_throughput, 4),
    ]
}

/// Write the dataset as CSV, missing levels last with blank measurements.
///
/// # Errors
/// Returns a [`ReportError`] if writing fails.
pub fn write_csv<W: Write>(dataset: &AggregateDataset, writer: W) -> Result<(), ReportError> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(CSV_HEADER)?;
    for row in dataset.report_rows() {
        out.write_record(csv_fields(&row))?;
    }
    out.flush()?;
    Ok(())
}

/// Pretty JSON form of the dataset
///
/// # Errors
/// Returns [`ReportError::Json`] if serialization fails.
pub fn to_json(dataset: &AggregateDataset) -> Result<String, ReportError> {
    Ok(serde_json::to_string_pretty(dataset)?)
}

/// Fixed-width table for terminals
#[must_use]
pub fn render_table(dataset: &AggregateDataset) -> String {
    let line = |cells: [&str; 4]| {
        let [a, b, c, d] = cells;
        let [wa, wb, wc, wd] = TABLE_WIDTHS;
        format!("{a:<wa$} {b:<wb$} {c:<wc$} {d:<wd$}").trim_end().to_string()
    };

    let mut out = String::new();
    out.push_str(&line(TABLE_HEADER));
    out.push('\n');
    out.push_str(&"-".repeat(TABLE_WIDTHS.iter().sum()));
    out.push('\n');
    for row in dataset.report_rows() {
        let avail = format!("{}%", row.level.availability());
        let thr = fixed(row.throughput, 2);
        let lat = fixed(row.latency, 2);
        let norm = fixed(row.normalized_throughput, 4);
        out.push_str(&line([&avail, &thr, &lat, &norm]));
        out.push('\n');
    }
    if dataset.baseline_approximate {
        out.push_str(&format!(
            "note: no 0% measurement, normalized against {}\n",
            dataset.baseline_level
        ));
    }
    out
}

fn parse_measurement(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.is_empty() || field.eq_ignore_ascii_case("n/a") {
        return None;
    }
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse an ad hoc `pct,throughput,latency` point.
///
/// Blank or `N/A` measurements are absent; so is anything that is not a
/// number. The level must always be present.
///
/// # Errors
/// Returns [`ReportError::InvalidPoint`] for the wrong field count or a bad
/// level.
pub fn parse_point(text: &str) -> Result<SummaryRecord, ReportError> {
    let invalid = |reason: String| ReportError::InvalidPoint {
        point: text.to_string(),
        reason,
    };

    let parts: Vec<&str> = text.split(',').collect();
    let [pct, thr, lat] = parts.as_slice() else {
        return Err(invalid("expected cpu_pct,throughput,latency".to_string()));
    };
    let level: DegradationLevel = pct.parse().map_err(|e| invalid(format!("{e}")))?;

    Ok(SummaryRecord::new(level, parse_measurement(thr), parse_measurement(lat)))
}
