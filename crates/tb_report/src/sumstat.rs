//! Summary file format
//!
//! The summarizer writes a small CSV whose column names vary between
//! versions. Columns are matched case-insensitively against a list of known
//! spellings; when several rows are present their values are averaged.

use crate::ReportError;
use std::io::Read;
use std::path::Path;
use tracing::debug;

pub const THROUGHPUT_COLUMNS: &[&str] = &[
    "throughput",
    "avg_throughput",
    "throughput(ops/sec)",
    "ops_per_sec",
    "ops/sec",
];

pub const LATENCY_COLUMNS: &[&str] = &[
    "latency",
    "avg_latency",
    "averagelatency(us)",
    "latency_us",
    "mean_latency",
];

/// Values extracted from one summary file
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SummaryValues {
    pub throughput: Option<f64>,
    pub latency: Option<f64>,
}

fn find_column(headers: &csv::StringRecord, candidates: &[&str]) -> Option<usize> {
    candidates.iter().find_map(|candidate| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(candidate))
    })
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Parse summary CSV content.
///
/// # Errors
/// Returns [`ReportError::Csv`] for malformed CSV, or
/// [`ReportError::Aggregation`] when neither a throughput nor a latency
/// column is recognized.
pub fn parse_summary<R: Read>(reader: R) -> Result<SummaryValues, ReportError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();

    let thr_col = find_column(&headers, THROUGHPUT_COLUMNS);
    let lat_col = find_column(&headers, LATENCY_COLUMNS);
    if thr_col.is_none() && lat_col.is_none() {
        return Err(ReportError::Aggregation(format!(
            "no throughput or latency column in [{}]",
            headers.iter().collect::<Vec<_>>().join(", ")
        )));
    }

    let mut throughputs = Vec::new();
    let mut latencies = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let value = |col: Option<usize>| {
            col.and_then(|c| record.get(c))
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite())
        };
        throughputs.extend(value(thr_col));
        latencies.extend(value(lat_col));
    }

    debug!(rows_thr = throughputs.len(), rows_lat = latencies.len(), "Parsed summary");
    Ok(SummaryValues {
        throughput: mean(&throughputs),
        latency: mean(&latencies),
    })
}

/// Read and parse a summary file.
///
/// # Errors
/// Returns [`ReportError::Summary`] naming the file on any failure.
pub fn read_summary_file(path: &Path) -> Result<SummaryValues, ReportError> {
    let summary_err = |reason: String| ReportError::Summary {
        path: path.to_path_buf(),
        reason,
    };
    let file = std::fs::File::open(path).map_err(|e| summary_err(e.to_string()))?;
    parse_summary(file).map_err(|e| summary_err(e.to_string()))
}

/// Summary file name for an artifact prefix and warmup window count
#[must_use]
pub fn summary_file_name(prefix: &str, warmup: u32) -> String {
    format!("{prefix}_{warmup}_sumstat.csv")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_columns() {
        let values = parse_summary("throughput,latency\n1000.5,250\n".as_bytes()).unwrap();
        assert_eq!(values.throughput, Some(1000.5));
        assert_eq!(values.latency, Some(250.0));
    }

    #[test]
    fn test_alternate_spellings_any_case() {
        let csv = "Window, Throughput(ops/sec) ,AverageLatency(us)\n1,100,10\n2,300,30\n";
        let values = parse_summary(csv.as_bytes()).unwrap();
        assert_eq!(values.throughput, Some(200.0));
        assert_eq!(values.latency, Some(20.0));

        let values = parse_summary("OPS_PER_SEC,mean_latency\n42,7\n".as_bytes()).unwrap();
        assert_eq!(values.throughput, Some(42.0));
        assert_eq!(values.latency, Some(7.0));
    }

    #[test]
    fn test_unparsable_cells_are_skipped() {
        let values = parse_summary("avg_throughput,avg_latency\nN/A,5\n10,\n".as_bytes()).unwrap();
        assert_eq!(values.throughput, Some(10.0));
        assert_eq!(values.latency, Some(5.0));
    }

    #[test]
    fn test_header_only_means_absent() {
        let values = parse_summary("throughput,latency\n".as_bytes()).unwrap();
        assert_eq!(values, SummaryValues::default());
    }

    #[test]
    fn test_unknown_columns_rejected() {
        assert!(parse_summary("foo,bar\n1,2\n".as_bytes()).is_err());
    }

    #[test]
    fn test_read_summary_file_names_path() {
        let err = read_summary_file(Path::new("/nonexistent/x_2_sumstat.csv")).unwrap_err();
        assert!(err.to_string().contains("x_2_sumstat.csv"));
        assert_eq!(summary_file_name("ycsb_cpu50", 2), "ycsb_cpu50_2_sumstat.csv");
    }
}
