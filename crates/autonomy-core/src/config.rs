//! Configuration: raw TOML input structs, resolution with defaults and
//! clamps, validation, and the atomically-swappable runtime handle.
//!
//! Follows the Input → resolve pattern: every option is optional on disk,
//! `resolve()` applies defaults and range clamps, and `validate()` rejects
//! combinations that would break the decision engine's invariants
//! (restore thresholds must be strictly tighter than fail thresholds).
//! An invalid config is fatal at startup; at runtime a failed reload is
//! rejected and the previous config retained.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use autonomy_common::models::{DetectMode, MemberClass, ReassocPolicy};

use crate::error::{CoreError, Result};

// ── Raw input ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigInput {
    pub daemon: DaemonConfigInput,
    pub telemetry: TelemetryConfigInput,
    pub scoring: ScoringConfigInput,
    pub decision: DecisionConfigInput,
    pub controller: ControllerConfigInput,
    pub predictor: PredictorConfigInput,
    pub metered: MeteredConfigInput,
    pub starlink: StarlinkConfigInput,
    pub collector: CollectorConfigInput,
    pub members: Vec<MemberConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfigInput {
    pub poll_interval_ms: Option<u64>,
    pub max_ram_mb: Option<usize>,
    pub dry_run: Option<bool>,
    pub removal_grace_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfigInput {
    pub retention_hours: Option<u32>,
    pub samples_per_hour: Option<u32>,
    pub max_events: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScoringConfigInput {
    pub ewma_alpha: Option<f64>,
    pub starlink_clear_boost: Option<f64>,
    pub roaming_penalty: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DecisionConfigInput {
    pub switch_margin: Option<f64>,
    pub cooldown_s: Option<u64>,
    pub min_uptime_s: Option<u64>,
    pub staleness_ticks: Option<u32>,
    /// Score below which the primary is failing regardless of dwell.
    pub fail_threshold: Option<f64>,
    /// Score a contender must hold for `min_uptime_s` before promotion.
    pub restore_threshold: Option<f64>,
    pub fail_loss_pct: Option<f64>,
    pub fail_latency_ms: Option<f64>,
    pub restore_loss_pct: Option<f64>,
    pub restore_latency_ms: Option<f64>,
    pub fail_min_duration_s: Option<u64>,
    pub restore_min_duration_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControllerConfigInput {
    pub mode: Option<ControllerMode>,
    pub backend: Option<BackendKind>,
    pub sweep_interval_s: Option<u64>,
    pub minimal_adjust_delta: Option<u8>,
    pub minimal_adjust_duration_s: Option<u64>,
    pub boost_delta: Option<u8>,
    pub boost_duration_s: Option<u64>,
    pub emergency_duration_s: Option<u64>,
    pub max_adjustment_duration_s: Option<u64>,
    pub emergency_online_fraction: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PredictorConfigInput {
    pub enabled: Option<bool>,
    pub ring_capacity: Option<usize>,
    pub min_samples_for_analysis: Option<usize>,
    pub trend_window: Option<usize>,
    pub confidence_threshold: Option<f64>,
    pub acceleration_threshold: Option<f64>,
    pub obstruction_limit: Option<f64>,
    pub snr_floor_db: Option<f64>,
    pub ttf_trigger_s: Option<f64>,
    pub pattern_learning: Option<bool>,
    pub pattern_similarity_threshold: Option<f64>,
    pub pattern_location_radius_m: Option<f64>,
    pub pattern_time_window_min: Option<u32>,
    pub max_patterns: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeteredConfigInput {
    pub enabled: Option<bool>,
    pub warn_percent: Option<f64>,
    pub crit_percent: Option<f64>,
    pub hysteresis_percent: Option<f64>,
    pub stability_delay_s: Option<u64>,
    pub reassoc: Option<ReassocPolicy>,
    pub wifi_iface: Option<String>,
    pub wifi_section: Option<String>,
    pub ap_mac: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StarlinkConfigInput {
    pub grpc_addr: Option<String>,
    pub http_addr: Option<String>,
    pub timeout_s: Option<u64>,
    pub http_first: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CollectorConfigInput {
    pub probe_targets: Option<Vec<String>>,
    pub probe_count: Option<u32>,
    pub default_timeout_s: Option<u64>,
    pub cellular_modem_index: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberConfigInput {
    pub name: String,
    pub iface: String,
    pub class: MemberClass,
    #[serde(default)]
    pub weight: Option<u8>,
    #[serde(default)]
    pub detect: Option<DetectMode>,
    #[serde(default)]
    pub prefer_roaming: Option<bool>,
    #[serde(default)]
    pub metered: Option<bool>,
    /// Monthly data cap in megabytes; used when no quota subsystem exists.
    #[serde(default)]
    pub data_limit_mb: Option<u64>,
}

// ── Resolved config ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControllerMode {
    Classic,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Weighted,
    RouteMetric,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonConfig {
    pub poll_interval_ms: u64,
    pub max_ram_mb: usize,
    pub dry_run: bool,
    pub removal_grace_s: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1500,
            max_ram_mb: 16,
            dry_run: false,
            removal_grace_s: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryConfig {
    pub retention_hours: u32,
    pub samples_per_hour: u32,
    pub max_events: usize,
}

impl TelemetryConfig {
    /// Per-member ring capacity in samples.
    pub fn ring_capacity(&self) -> usize {
        (self.retention_hours as usize * self.samples_per_hour as usize).max(16)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            samples_per_hour: 2400,
            max_events: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoringConfig {
    pub ewma_alpha: f64,
    pub starlink_clear_boost: f64,
    pub roaming_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.2,
            starlink_clear_boost: 5.0,
            roaming_penalty: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionConfig {
    pub switch_margin: f64,
    pub cooldown_s: u64,
    pub min_uptime_s: u64,
    pub staleness_ticks: u32,
    pub fail_threshold: f64,
    pub restore_threshold: f64,
    pub fail_loss_pct: f64,
    pub fail_latency_ms: f64,
    pub restore_loss_pct: f64,
    pub restore_latency_ms: f64,
    pub fail_min_duration_s: u64,
    pub restore_min_duration_s: u64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            switch_margin: 10.0,
            cooldown_s: 20,
            min_uptime_s: 5,
            staleness_ticks: 3,
            fail_threshold: 25.0,
            restore_threshold: 60.0,
            fail_loss_pct: 5.0,
            fail_latency_ms: 800.0,
            restore_loss_pct: 2.0,
            restore_latency_ms: 400.0,
            fail_min_duration_s: 5,
            restore_min_duration_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerConfig {
    pub mode: ControllerMode,
    pub backend: BackendKind,
    pub sweep_interval_s: u64,
    pub minimal_adjust_delta: u8,
    pub minimal_adjust_duration_s: u64,
    pub boost_delta: u8,
    pub boost_duration_s: u64,
    pub emergency_duration_s: u64,
    pub max_adjustment_duration_s: u64,
    pub emergency_online_fraction: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ControllerMode::Hybrid,
            backend: BackendKind::Weighted,
            sweep_interval_s: 60,
            minimal_adjust_delta: 10,
            minimal_adjust_duration_s: 300,
            boost_delta: 20,
            boost_duration_s: 600,
            emergency_duration_s: 900,
            max_adjustment_duration_s: 900,
            emergency_online_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictorConfig {
    pub enabled: bool,
    pub ring_capacity: usize,
    pub min_samples_for_analysis: usize,
    pub trend_window: usize,
    pub confidence_threshold: f64,
    pub acceleration_threshold: f64,
    /// Obstruction fraction treated as critical, [0, 1].
    pub obstruction_limit: f64,
    pub snr_floor_db: f64,
    pub ttf_trigger_s: f64,
    pub pattern_learning: bool,
    pub pattern_similarity_threshold: f64,
    pub pattern_location_radius_m: f64,
    pub pattern_time_window_min: u32,
    pub max_patterns: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ring_capacity: 300,
            min_samples_for_analysis: 10,
            trend_window: 20,
            confidence_threshold: 0.7,
            acceleration_threshold: 0.02,
            obstruction_limit: 0.15,
            snr_floor_db: 8.0,
            ttf_trigger_s: 30.0,
            pattern_learning: false,
            pattern_similarity_threshold: 0.8,
            pattern_location_radius_m: 50.0,
            pattern_time_window_min: 60,
            max_patterns: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MeteredConfig {
    pub enabled: bool,
    pub warn_percent: f64,
    pub crit_percent: f64,
    pub hysteresis_percent: f64,
    pub stability_delay_s: u64,
    pub reassoc: ReassocPolicy,
    pub wifi_iface: String,
    /// UCI section holding `hostapd_options` (e.g. `@wifi-iface[0]`).
    pub wifi_section: String,
    /// AP MAC advertised in the tethering IE, `aa:bb:cc:dd:ee:ff`.
    pub ap_mac: Option<String>,
}

impl Default for MeteredConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warn_percent: 80.0,
            crit_percent: 95.0,
            hysteresis_percent: 5.0,
            stability_delay_s: 300,
            reassoc: ReassocPolicy::Gentle,
            wifi_iface: "wlan0".into(),
            wifi_section: "@wifi-iface[0]".into(),
            ap_mac: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StarlinkConfig {
    pub grpc_addr: String,
    pub http_addr: String,
    pub timeout_s: u64,
    pub http_first: bool,
}

impl Default for StarlinkConfig {
    fn default() -> Self {
        Self {
            grpc_addr: "192.168.100.1:9200".into(),
            http_addr: "http://192.168.100.1".into(),
            timeout_s: 10,
            http_first: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectorConfig {
    pub probe_targets: Vec<String>,
    pub probe_count: u32,
    pub default_timeout_s: u64,
    pub cellular_modem_index: u32,
}

impl CollectorConfig {
    /// Collection deadline for a member class.
    pub fn deadline(&self, class: MemberClass, starlink: &StarlinkConfig) -> Duration {
        match class {
            MemberClass::Starlink => Duration::from_secs(starlink.timeout_s),
            _ => Duration::from_secs(self.default_timeout_s),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            probe_targets: vec!["1.1.1.1:53".into(), "8.8.8.8:53".into()],
            probe_count: 3,
            default_timeout_s: 5,
            cellular_modem_index: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberConfig {
    pub name: String,
    pub iface: String,
    pub class: MemberClass,
    pub weight: u8,
    pub detect: DetectMode,
    pub prefer_roaming: bool,
    pub metered: bool,
    pub data_limit_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub telemetry: TelemetryConfig,
    pub scoring: ScoringConfig,
    pub decision: DecisionConfig,
    pub controller: ControllerConfig,
    pub predictor: PredictorConfig,
    pub metered: MeteredConfig,
    pub starlink: StarlinkConfig,
    pub collector: CollectorConfig,
    pub members: Vec<MemberConfig>,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.daemon.poll_interval_ms)
    }

    /// Staleness threshold: a member with no sample for this long is
    /// filtered out of the ranking.
    pub fn staleness_threshold(&self) -> Duration {
        self.poll_interval() * self.decision.staleness_ticks
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let parsed: ConfigInput = toml::from_str(input)
            .map_err(|e| CoreError::Configuration(format!("invalid TOML: {e}")))?;
        parsed.resolve()
    }

    /// Reject combinations that would break engine invariants.
    pub fn validate(&self) -> Result<()> {
        let d = &self.decision;
        if d.restore_loss_pct >= d.fail_loss_pct {
            return Err(CoreError::Configuration(format!(
                "restore_loss_pct ({}) must be strictly below fail_loss_pct ({})",
                d.restore_loss_pct, d.fail_loss_pct
            )));
        }
        if d.restore_latency_ms >= d.fail_latency_ms {
            return Err(CoreError::Configuration(format!(
                "restore_latency_ms ({}) must be strictly below fail_latency_ms ({})",
                d.restore_latency_ms, d.fail_latency_ms
            )));
        }
        if d.fail_threshold >= d.restore_threshold {
            return Err(CoreError::Configuration(format!(
                "fail_threshold ({}) must be below restore_threshold ({})",
                d.fail_threshold, d.restore_threshold
            )));
        }
        let m = &self.metered;
        if m.warn_percent >= m.crit_percent {
            return Err(CoreError::Configuration(format!(
                "metered warn_percent ({}) must be below crit_percent ({})",
                m.warn_percent, m.crit_percent
            )));
        }
        let c = &self.controller;
        for (label, dur) in [
            ("minimal_adjust_duration_s", c.minimal_adjust_duration_s),
            ("boost_duration_s", c.boost_duration_s),
            ("emergency_duration_s", c.emergency_duration_s),
        ] {
            if dur > c.max_adjustment_duration_s {
                return Err(CoreError::Configuration(format!(
                    "{label} ({dur}) exceeds max_adjustment_duration_s ({})",
                    c.max_adjustment_duration_s
                )));
            }
        }
        let mut names = std::collections::HashSet::new();
        let mut ifaces = std::collections::HashSet::new();
        for member in &self.members {
            if !names.insert(member.name.as_str()) {
                return Err(CoreError::Configuration(format!(
                    "duplicate member name {:?}",
                    member.name
                )));
            }
            if !ifaces.insert(member.iface.as_str()) {
                return Err(CoreError::Configuration(format!(
                    "duplicate member interface {:?}",
                    member.iface
                )));
            }
        }
        Ok(())
    }
}

impl ConfigInput {
    pub fn resolve(self) -> Result<Config> {
        let dd = DaemonConfig::default();
        let daemon = DaemonConfig {
            poll_interval_ms: self.daemon.poll_interval_ms.unwrap_or(dd.poll_interval_ms).max(100),
            max_ram_mb: self.daemon.max_ram_mb.unwrap_or(dd.max_ram_mb).max(1),
            dry_run: self.daemon.dry_run.unwrap_or(dd.dry_run),
            removal_grace_s: self.daemon.removal_grace_s.unwrap_or(dd.removal_grace_s),
        };

        let td = TelemetryConfig::default();
        let telemetry = TelemetryConfig {
            retention_hours: self.telemetry.retention_hours.unwrap_or(td.retention_hours).max(1),
            samples_per_hour: self
                .telemetry
                .samples_per_hour
                .unwrap_or(td.samples_per_hour)
                .max(1),
            max_events: self.telemetry.max_events.unwrap_or(td.max_events).max(16),
        };

        let sd = ScoringConfig::default();
        let scoring = ScoringConfig {
            ewma_alpha: self
                .scoring
                .ewma_alpha
                .unwrap_or(sd.ewma_alpha)
                .clamp(0.001, 1.0),
            starlink_clear_boost: self
                .scoring
                .starlink_clear_boost
                .unwrap_or(sd.starlink_clear_boost)
                .clamp(0.0, 25.0),
            roaming_penalty: self
                .scoring
                .roaming_penalty
                .unwrap_or(sd.roaming_penalty)
                .clamp(0.0, 50.0),
        };

        let ddc = DecisionConfig::default();
        let decision = DecisionConfig {
            switch_margin: self.decision.switch_margin.unwrap_or(ddc.switch_margin).max(0.0),
            cooldown_s: self.decision.cooldown_s.unwrap_or(ddc.cooldown_s),
            min_uptime_s: self.decision.min_uptime_s.unwrap_or(ddc.min_uptime_s),
            staleness_ticks: self
                .decision
                .staleness_ticks
                .unwrap_or(ddc.staleness_ticks)
                .max(1),
            fail_threshold: self
                .decision
                .fail_threshold
                .unwrap_or(ddc.fail_threshold)
                .clamp(0.0, 100.0),
            restore_threshold: self
                .decision
                .restore_threshold
                .unwrap_or(ddc.restore_threshold)
                .clamp(0.0, 100.0),
            fail_loss_pct: self
                .decision
                .fail_loss_pct
                .unwrap_or(ddc.fail_loss_pct)
                .clamp(0.0, 100.0),
            fail_latency_ms: self
                .decision
                .fail_latency_ms
                .unwrap_or(ddc.fail_latency_ms)
                .max(0.0),
            restore_loss_pct: self
                .decision
                .restore_loss_pct
                .unwrap_or(ddc.restore_loss_pct)
                .clamp(0.0, 100.0),
            restore_latency_ms: self
                .decision
                .restore_latency_ms
                .unwrap_or(ddc.restore_latency_ms)
                .max(0.0),
            fail_min_duration_s: self
                .decision
                .fail_min_duration_s
                .unwrap_or(ddc.fail_min_duration_s),
            restore_min_duration_s: self
                .decision
                .restore_min_duration_s
                .unwrap_or(ddc.restore_min_duration_s),
        };

        let cd = ControllerConfig::default();
        let controller = ControllerConfig {
            mode: self.controller.mode.unwrap_or(cd.mode),
            backend: self.controller.backend.unwrap_or(cd.backend),
            sweep_interval_s: self
                .controller
                .sweep_interval_s
                .unwrap_or(cd.sweep_interval_s)
                .clamp(1, 60),
            minimal_adjust_delta: self
                .controller
                .minimal_adjust_delta
                .unwrap_or(cd.minimal_adjust_delta),
            minimal_adjust_duration_s: self
                .controller
                .minimal_adjust_duration_s
                .unwrap_or(cd.minimal_adjust_duration_s),
            boost_delta: self.controller.boost_delta.unwrap_or(cd.boost_delta),
            boost_duration_s: self
                .controller
                .boost_duration_s
                .unwrap_or(cd.boost_duration_s),
            emergency_duration_s: self
                .controller
                .emergency_duration_s
                .unwrap_or(cd.emergency_duration_s),
            max_adjustment_duration_s: self
                .controller
                .max_adjustment_duration_s
                .unwrap_or(cd.max_adjustment_duration_s),
            emergency_online_fraction: self
                .controller
                .emergency_online_fraction
                .unwrap_or(cd.emergency_online_fraction)
                .clamp(0.0, 1.0),
        };

        let pd = PredictorConfig::default();
        let predictor = PredictorConfig {
            enabled: self.predictor.enabled.unwrap_or(pd.enabled),
            ring_capacity: self
                .predictor
                .ring_capacity
                .unwrap_or(pd.ring_capacity)
                .max(20),
            min_samples_for_analysis: self
                .predictor
                .min_samples_for_analysis
                .unwrap_or(pd.min_samples_for_analysis)
                .max(3),
            trend_window: self.predictor.trend_window.unwrap_or(pd.trend_window).max(3),
            confidence_threshold: self
                .predictor
                .confidence_threshold
                .unwrap_or(pd.confidence_threshold)
                .clamp(0.0, 1.0),
            acceleration_threshold: self
                .predictor
                .acceleration_threshold
                .unwrap_or(pd.acceleration_threshold),
            obstruction_limit: self
                .predictor
                .obstruction_limit
                .unwrap_or(pd.obstruction_limit)
                .clamp(0.0, 1.0),
            snr_floor_db: self.predictor.snr_floor_db.unwrap_or(pd.snr_floor_db),
            ttf_trigger_s: self
                .predictor
                .ttf_trigger_s
                .unwrap_or(pd.ttf_trigger_s)
                .max(0.0),
            pattern_learning: self.predictor.pattern_learning.unwrap_or(pd.pattern_learning),
            pattern_similarity_threshold: self
                .predictor
                .pattern_similarity_threshold
                .unwrap_or(pd.pattern_similarity_threshold)
                .clamp(0.0, 1.0),
            pattern_location_radius_m: self
                .predictor
                .pattern_location_radius_m
                .unwrap_or(pd.pattern_location_radius_m)
                .max(1.0),
            pattern_time_window_min: self
                .predictor
                .pattern_time_window_min
                .unwrap_or(pd.pattern_time_window_min)
                .max(1),
            max_patterns: self.predictor.max_patterns.unwrap_or(pd.max_patterns).max(1),
        };

        let md = MeteredConfig::default();
        let metered = MeteredConfig {
            enabled: self.metered.enabled.unwrap_or(md.enabled),
            warn_percent: self
                .metered
                .warn_percent
                .unwrap_or(md.warn_percent)
                .clamp(0.0, 100.0),
            crit_percent: self
                .metered
                .crit_percent
                .unwrap_or(md.crit_percent)
                .clamp(0.0, 100.0),
            hysteresis_percent: self
                .metered
                .hysteresis_percent
                .unwrap_or(md.hysteresis_percent)
                .clamp(0.0, 50.0),
            stability_delay_s: self
                .metered
                .stability_delay_s
                .unwrap_or(md.stability_delay_s),
            reassoc: self.metered.reassoc.unwrap_or(md.reassoc),
            wifi_iface: self.metered.wifi_iface.unwrap_or(md.wifi_iface),
            wifi_section: self.metered.wifi_section.unwrap_or(md.wifi_section),
            ap_mac: self.metered.ap_mac,
        };

        let skd = StarlinkConfig::default();
        let starlink = StarlinkConfig {
            grpc_addr: self.starlink.grpc_addr.unwrap_or(skd.grpc_addr),
            http_addr: self.starlink.http_addr.unwrap_or(skd.http_addr),
            timeout_s: self.starlink.timeout_s.unwrap_or(skd.timeout_s).clamp(5, 60),
            http_first: self.starlink.http_first.unwrap_or(skd.http_first),
        };

        let cod = CollectorConfig::default();
        let collector = CollectorConfig {
            probe_targets: self
                .collector
                .probe_targets
                .filter(|t| !t.is_empty())
                .unwrap_or(cod.probe_targets),
            probe_count: self.collector.probe_count.unwrap_or(cod.probe_count).clamp(1, 16),
            default_timeout_s: self
                .collector
                .default_timeout_s
                .unwrap_or(cod.default_timeout_s)
                .clamp(1, 30),
            cellular_modem_index: self
                .collector
                .cellular_modem_index
                .unwrap_or(cod.cellular_modem_index),
        };

        let members = self
            .members
            .into_iter()
            .map(|m| MemberConfig {
                weight: m.weight.unwrap_or_else(|| m.class.default_weight()).min(100),
                detect: m.detect.unwrap_or_default(),
                prefer_roaming: m.prefer_roaming.unwrap_or(false),
                metered: m.metered.unwrap_or(m.class == MemberClass::Cellular),
                data_limit_mb: m.data_limit_mb,
                name: m.name,
                iface: m.iface,
                class: m.class,
            })
            .collect();

        let config = Config {
            daemon,
            telemetry,
            scoring,
            decision,
            controller,
            predictor,
            metered,
            starlink,
            collector,
            members,
        };
        config.validate()?;
        Ok(config)
    }
}

// ── Runtime handle ──────────────────────────────────────────────────

/// Atomically-swappable config shared across tasks. Readers `load()` a
/// consistent snapshot; `reload()` validates first and keeps the previous
/// config when the replacement is invalid. Watchers observe generation
/// bumps through [`ConfigHandle::subscribe`].
pub struct ConfigHandle {
    inner: ArcSwap<Config>,
    generation: watch::Sender<u64>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        let (generation, _) = watch::channel(0);
        ConfigHandle {
            inner: ArcSwap::from_pointee(config),
            generation,
        }
    }

    pub fn load(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// Swap in a new config after validation. Invalid replacements are
    /// rejected and the previous config retained.
    pub fn reload(&self, config: Config) -> Result<()> {
        config.validate()?;
        self.inner.store(Arc::new(config));
        self.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    /// Receive a notification each time the config is swapped.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}
