#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use tb_config::{CampaignConfig, DegradationLevel};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: Once = Once::new();

/// Initialize tracing once for integration tests.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(filter)
            .init();
    });
}

/// Three-host config writing results under `dir`, with no settle delay.
pub fn campaign_config(dir: &Path, levels: &[u8]) -> CampaignConfig {
    let mut config = CampaignConfig::default();
    config.cluster.hosts = vec!["db1".into(), "db2".into(), "db3".into()];
    config.campaign.levels = levels
        .iter()
        .map(|p| DegradationLevel::new(*p).unwrap())
        .collect();
    config.campaign.settle_secs = 0;
    config.global.results_dir = dir.to_path_buf();
    config
}

/// Summarizer output for one run, as the external tool writes it.
pub fn write_sumstat(dir: &Path, prefix: &str, warmup: u32, throughput: f64, latency: f64) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join(format!("{prefix}_{warmup}_sumstat.csv")),
        format!("Throughput(ops/sec),AverageLatency(us)\n{throughput},{latency}\n"),
    )
    .unwrap();
}
