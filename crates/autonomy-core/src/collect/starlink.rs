//! Starlink dish collector.
//!
//! Prefers the dish's native gRPC endpoint, driven through the on-device
//! `grpcurl` tool so no protobuf toolchain is needed at build time; falls
//! back to the HTTP JSON endpoint (or tries it first under `http_first`).
//! Both paths produce the same status document: obstruction block, SNR,
//! and pop ping stats.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use autonomy_common::models::{Metrics, StarlinkMetrics};

use crate::config::StarlinkConfig;
use crate::controller::backend::CommandRunner;
use crate::error::{CoreError, Result};

const GRPC_METHOD: &str = "SpaceX.API.Device.Device/Handle";
const GRPC_REQUEST: &str = r#"{"get_status":{}}"#;

#[derive(Clone)]
pub struct StarlinkCollector {
    grpc_addr: String,
    http_addr: String,
    http_first: bool,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    http: reqwest::Client,
}

impl StarlinkCollector {
    pub fn new(cfg: &StarlinkConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let timeout = Duration::from_secs(cfg.timeout_s);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        StarlinkCollector {
            grpc_addr: cfg.grpc_addr.clone(),
            http_addr: cfg.http_addr.clone(),
            http_first: cfg.http_first,
            timeout,
            runner,
            http,
        }
    }

    pub async fn collect(&self) -> Result<Metrics> {
        if self.http_first {
            match self.collect_http().await {
                Ok(metrics) => Ok(metrics),
                Err(e) => {
                    tracing::debug!(error = %e, "starlink http failed, trying grpc");
                    self.collect_grpc().await
                }
            }
        } else {
            match self.collect_grpc().await {
                Ok(metrics) => Ok(metrics),
                Err(e) => {
                    tracing::debug!(error = %e, "starlink grpc failed, trying http");
                    self.collect_http().await
                }
            }
        }
    }

    async fn collect_grpc(&self) -> Result<Metrics> {
        let runner = self.runner.clone();
        let addr = self.grpc_addr.clone();
        let max_time = self.timeout.as_secs().saturating_sub(1).max(2).to_string();
        let out = tokio::task::spawn_blocking(move || {
            runner.run(
                "grpcurl",
                &[
                    "-plaintext",
                    "-max-time",
                    &max_time,
                    "-d",
                    GRPC_REQUEST,
                    &addr,
                    GRPC_METHOD,
                ],
            )
        })
        .await
        .map_err(|e| CoreError::Transient(format!("grpcurl task: {e}")))??;

        if !out.success() {
            return Err(CoreError::Transient(format!(
                "grpcurl exited {}: {}",
                out.status,
                out.stderr.trim()
            )));
        }
        parse_status_json(&out.stdout)
    }

    async fn collect_http(&self) -> Result<Metrics> {
        let url = format!("{}/status", self.http_addr.trim_end_matches('/'));
        let body = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("starlink http: {e}")))?
            .text()
            .await
            .map_err(|e| CoreError::Transient(format!("starlink http body: {e}")))?;
        parse_status_json(&body)
    }
}

// ── Status document ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DishApiResponse {
    dish_get_status: Option<DishStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DishStatus {
    obstruction_stats: Option<ObstructionStats>,
    snr: Option<f64>,
    pop_ping_latency_ms: Option<f64>,
    /// Fraction in [0, 1].
    pop_ping_drop_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObstructionStats {
    /// Fraction in [0, 1].
    fraction_obstructed: Option<f64>,
    /// Fraction of recent time obstructed, [0, 1].
    time_obstructed: Option<f64>,
    valid_s: Option<f64>,
    patches_valid: Option<u32>,
    avg_prolonged_obstruction_interval_s: Option<f64>,
    wedge_fraction_obstructed: Option<Vec<f64>>,
}

/// Parse the dish status JSON into a metrics record.
pub fn parse_status_json(body: &str) -> Result<Metrics> {
    let parsed: DishApiResponse = serde_json::from_str(body)
        .map_err(|e| CoreError::Transient(format!("starlink status parse: {e}")))?;
    let status = parsed
        .dish_get_status
        .ok_or_else(|| CoreError::Transient("starlink status missing dishGetStatus".into()))?;

    let mut metrics = Metrics::empty(Utc::now());
    metrics.latency_ms = status.pop_ping_latency_ms;
    metrics.loss_pct = status.pop_ping_drop_rate.map(|r| (r * 100.0).clamp(0.0, 100.0));

    let obstruction = status.obstruction_stats;
    metrics.starlink = Some(StarlinkMetrics {
        obstruction_pct: obstruction
            .as_ref()
            .and_then(|o| o.fraction_obstructed)
            .map(|f| (f * 100.0).clamp(0.0, 100.0)),
        obstruction_time_pct: obstruction
            .as_ref()
            .and_then(|o| o.time_obstructed)
            .map(|f| (f * 100.0).clamp(0.0, 100.0)),
        snr_db: status.snr,
        obstruction_valid_s: obstruction.as_ref().and_then(|o| o.valid_s),
        patches_valid: obstruction.as_ref().and_then(|o| o.patches_valid),
        avg_prolonged_obstruction_interval_s: obstruction
            .as_ref()
            .and_then(|o| o.avg_prolonged_obstruction_interval_s),
        wedge_fraction_obstructed: obstruction.and_then(|o| o.wedge_fraction_obstructed),
    });
    Ok(metrics)
}
