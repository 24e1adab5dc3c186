//! Cellular modem collector: signal levels, technology, and roaming from
//! ModemManager (`mmcli` JSON), quota usage from the usage provider, and
//! core latency/loss from the shared TCP probe.
//!
//! Every sub-read degrades independently: a modem that answers `mmcli`
//! but has no signal report still yields a usable sample.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use autonomy_common::models::{CellularMetrics, Metrics, RadioTech};

use crate::controller::backend::CommandRunner;
use crate::error::{CoreError, Result};
use crate::quota::UsageProvider;

use super::probe::tcp_probe;

#[derive(Clone)]
pub struct CellularCollector {
    runner: Arc<dyn CommandRunner>,
    usage: Arc<dyn UsageProvider>,
    modem_index: u32,
    probe_targets: Vec<String>,
    probe_count: u32,
    probe_timeout: Duration,
}

impl CellularCollector {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        usage: Arc<dyn UsageProvider>,
        modem_index: u32,
        probe_targets: Vec<String>,
        probe_count: u32,
        probe_timeout: Duration,
    ) -> Self {
        CellularCollector {
            runner,
            usage,
            modem_index,
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

        let mut cellular = CellularMetrics::default();
        match self.mmcli(&[]).await {
            Ok(doc) => merge_modem_doc(&mut cellular, &doc),
            Err(e) => tracing::debug!(error = %e, "mmcli modem read failed"),
        }
        match self.mmcli(&["--signal-get"]).await {
            Ok(doc) => merge_modem_doc(&mut cellular, &doc),
            Err(e) => tracing::debug!(error = %e, "mmcli signal read failed"),
        }
        if cellular != CellularMetrics::default() {
            metrics.cellular = Some(cellular);
        }

        match self.usage.data_limit(iface) {
            Ok(limit) => metrics.usage_percent = limit.and_then(|l| l.usage_percent()),
            Err(e) => tracing::debug!(error = %e, "usage read failed"),
        }

        Ok(metrics)
    }

    async fn mmcli(&self, extra: &[&str]) -> Result<MmcliDoc> {
        let runner = self.runner.clone();
        let index = self.modem_index.to_string();
        let mut args: Vec<String> = vec!["-m".into(), index];
        args.extend(extra.iter().map(|a| a.to_string()));
        args.push("--output-json".into());

        let out = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            runner.run("mmcli", &refs)
        })
        .await
        .map_err(|e| CoreError::Transient(format!("mmcli task: {e}")))??;

        if !out.success() {
            return Err(CoreError::Transient(format!(
                "mmcli exited {}: {}",
                out.status,
                out.stderr.trim()
            )));
        }
        serde_json::from_str(&out.stdout)
            .map_err(|e| CoreError::Transient(format!("mmcli parse: {e}")))
    }
}

// ── mmcli document ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MmcliDoc {
    modem: Option<MmcliModem>,
}

#[derive(Debug, Deserialize)]
struct MmcliModem {
    generic: Option<MmcliGeneric>,
    #[serde(rename = "3gpp")]
    tgpp: Option<Mmcli3gpp>,
    signal: Option<MmcliSignal>,
}

#[derive(Debug, Deserialize)]
struct MmcliGeneric {
    #[serde(rename = "access-technologies", default)]
    access_technologies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Mmcli3gpp {
    #[serde(rename = "registration-state")]
    registration_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MmcliSignal {
    lte: Option<MmcliSignalBand>,
    #[serde(rename = "5g")]
    nr5g: Option<MmcliSignalBand>,
}

/// mmcli renders numbers as strings ("-98.00") and absent values as "--".
#[derive(Debug, Deserialize)]
struct MmcliSignalBand {
    rsrp: Option<String>,
    rsrq: Option<String>,
    snr: Option<String>,
}

fn merge_modem_doc(cellular: &mut CellularMetrics, doc: &MmcliDoc) {
    let Some(modem) = doc.modem.as_ref() else {
        return;
    };
    if let Some(generic) = modem.generic.as_ref() {
        if let Some(tech) = map_technology(&generic.access_technologies) {
            cellular.technology = Some(tech);
        }
    }
    if let Some(tgpp) = modem.tgpp.as_ref() {
        if let Some(state) = tgpp.registration_state.as_deref() {
            cellular.roaming = Some(state == "roaming");
        }
    }
    if let Some(signal) = modem.signal.as_ref() {
        let band = signal.nr5g.as_ref().or(signal.lte.as_ref());
        if let Some(band) = band {
            if let Some(v) = parse_db(band.rsrp.as_deref()) {
                cellular.rsrp_dbm = Some(v);
            }
            if let Some(v) = parse_db(band.rsrq.as_deref()) {
                cellular.rsrq_db = Some(v);
            }
            if let Some(v) = parse_db(band.snr.as_deref()) {
                cellular.sinr_db = Some(v);
            }
        }
    }
}

fn map_technology(technologies: &[String]) -> Option<RadioTech> {
    let has = |needle: &str| technologies.iter().any(|t| t.contains(needle));
    if has("5gnr") {
        Some(RadioTech::FiveG)
    } else if has("lte") {
        Some(RadioTech::FourG)
    } else if has("umts") || has("hsdpa") || has("hsupa") || has("hspa") {
        Some(RadioTech::ThreeG)
    } else if technologies.is_empty() {
        None
    } else {
        Some(RadioTech::Unknown)
    }
}

fn parse_db(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
}
