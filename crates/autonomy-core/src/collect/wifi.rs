//! Wi-Fi collector: RSSI from `/proc/net/wireless`, role and channel
//! from `iw dev <iface> info`, channel utilization from the in-use entry
//! of `iw dev <iface> survey dump`, core fields from the shared probe.
//!
//! The interface role (station vs AP) feeds the metered manager's
//! tethering detection, so it rides along in the metrics record.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use autonomy_common::models::{Metrics, WifiMetrics, WirelessMode};

use crate::controller::backend::CommandRunner;
use crate::error::{CoreError, Result};

use super::probe::tcp_probe;

#[derive(Clone)]
pub struct WifiCollector {
    runner: Arc<dyn CommandRunner>,
    proc_wireless: PathBuf,
    probe_targets: Vec<String>,
    probe_count: u32,
    probe_timeout: Duration,
}

impl WifiCollector {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        probe_targets: Vec<String>,
        probe_count: u32,
        probe_timeout: Duration,
    ) -> Self {
        Self::with_proc_path(runner, "/proc/net/wireless", probe_targets, probe_count, probe_timeout)
    }

    pub fn with_proc_path(
        runner: Arc<dyn CommandRunner>,
        proc_wireless: impl Into<PathBuf>,
        probe_targets: Vec<String>,
        probe_count: u32,
        probe_timeout: Duration,
    ) -> Self {
        WifiCollector {
            runner,
            proc_wireless: proc_wireless.into(),
            probe_targets,
            probe_count,
            probe_timeout,
        }
    }

    pub async fn collect(&self, iface: &str) -> Result<Metrics> {
        let probe = tcp_probe(&self.probe_targets, self.probe_count, self.probe_timeout).await;

        let mut metrics = Metrics::empty(Utc::now());
        metrics.latency_ms = probe.latency_ms;
        metrics.loss_pct = probe.loss_pct;
        metrics.jitter_ms = probe.jitter_ms;

        let mut wifi = WifiMetrics {
            rssi_dbm: read_rssi_dbm(&self.proc_wireless, iface),
            ..Default::default()
        };

        match self.iw(&["dev", iface, "info"]).await {
            Ok(out) => {
                wifi.mode = parse_iw_mode(&out);
                wifi.channel = parse_iw_channel(&out);
            }
            Err(e) => tracing::debug!(error = %e, "iw info failed"),
        }
        match self.iw(&["dev", iface, "survey", "dump"]).await {
            Ok(out) => wifi.channel_utilization_pct = parse_survey_utilization(&out),
            Err(e) => tracing::debug!(error = %e, "iw survey failed"),
        }

        if wifi != WifiMetrics::default() {
            metrics.wifi = Some(wifi);
        }
        Ok(metrics)
    }

    async fn iw(&self, args: &[&str]) -> Result<String> {
        let runner = self.runner.clone();
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let out = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            runner.run("iw", &refs)
        })
        .await
        .map_err(|e| CoreError::Transient(format!("iw task: {e}")))??;
        if !out.success() {
            return Err(CoreError::Transient(format!("iw exited {}", out.status)));
        }
        Ok(out.stdout)
    }
}

/// Signal level for `iface` from the `/proc/net/wireless` table. The
/// level field carries a trailing period in the kernel's formatting.
fn read_rssi_dbm(path: &PathBuf, iface: &str) -> Option<f64> {
    let contents = fs::read_to_string(path).ok()?;
    for line in contents.lines().skip(2) {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix(iface).and_then(|r| r.strip_prefix(':')) else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() >= 2 {
            return fields[1].trim_end_matches('.').parse::<f64>().ok();
        }
    }
    None
}

/// `iw dev <iface> info` → interface role.
fn parse_iw_mode(output: &str) -> Option<WirelessMode> {
    for line in output.lines() {
        let line = line.trim();
        if let Some(kind) = line.strip_prefix("type ") {
            return match kind.trim() {
                "AP" | "AP/VLAN" => Some(WirelessMode::Ap),
                "managed" | "station" => Some(WirelessMode::Station),
                _ => None,
            };
        }
    }
    None
}

/// `iw dev <iface> info` → channel number.
fn parse_iw_channel(output: &str) -> Option<u32> {
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("channel ") {
            return rest.split_whitespace().next()?.parse::<u32>().ok();
        }
    }
    None
}

/// Busy/active ratio of the in-use survey entry, percent.
fn parse_survey_utilization(output: &str) -> Option<f64> {
    let mut in_use_block = false;
    let mut active_ms: Option<f64> = None;
    let mut busy_ms: Option<f64> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("frequency:") {
            if in_use_block {
                break; // left the in-use block without both counters
            }
            in_use_block = line.contains("[in use]");
            continue;
        }
        if !in_use_block {
            continue;
        }
        if let Some(v) = line
            .strip_prefix("channel active time:")
            .and_then(|r| r.trim().strip_suffix("ms"))
        {
            active_ms = v.trim().parse::<f64>().ok();
        } else if let Some(v) = line
            .strip_prefix("channel busy time:")
            .and_then(|r| r.trim().strip_suffix("ms"))
        {
            busy_ms = v.trim().parse::<f64>().ok();
        }
        if let (Some(active), Some(busy)) = (active_ms, busy_ms) {
            if active > 0.0 {
                return Some((busy / active * 100.0).clamp(0.0, 100.0));
            }
            return None;
        }
    }
    None
}
