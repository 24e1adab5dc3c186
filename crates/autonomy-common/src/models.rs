//! Core data model: uplink members, per-tick metrics, derived scores,
//! samples, events, and metered modes.
//!
//! Everything here is plain data with serde derives. The control core in
//! `autonomy-core` owns all behaviour; external transports serialize these
//! types directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Members ─────────────────────────────────────────────────────────

/// Uplink class. Closed set: selects the collector implementation and the
/// default weight band for auto-discovered members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberClass {
    Starlink,
    Cellular,
    Wifi,
    Lan,
    Other,
}

impl MemberClass {
    /// Default user-preference weight for members of this class.
    pub fn default_weight(self) -> u8 {
        match self {
            MemberClass::Starlink => 100,
            MemberClass::Cellular => 80,
            MemberClass::Wifi => 60,
            MemberClass::Lan => 40,
            MemberClass::Other => 20,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberClass::Starlink => "starlink",
            MemberClass::Cellular => "cellular",
            MemberClass::Wifi => "wifi",
            MemberClass::Lan => "lan",
            MemberClass::Other => "other",
        }
    }
}

/// Detection override for a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectMode {
    /// Eligibility follows discovery.
    #[default]
    Auto,
    /// Always eligible, even when discovery does not report the interface.
    Force,
    /// Never eligible.
    Disable,
}

/// One uplink the router can use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Opaque unique name (e.g. "starlink", "cell_roaming").
    pub name: String,
    /// Underlying interface name (e.g. "wan", "wwan0").
    pub iface: String,
    pub class: MemberClass,
    /// User preference weight, 0–100.
    pub weight: u8,
    /// Whether discovery currently reports this member as usable.
    pub eligible: bool,
    pub detect: DetectMode,
    /// Avoid penalising this member while roaming.
    pub prefer_roaming: bool,
    /// Member carries a data cap and should drive metered signaling.
    pub metered: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Member {
    /// Whether this member may become primary. `detect` overrides the
    /// discovered eligibility in both directions.
    pub fn is_selectable(&self) -> bool {
        match self.detect {
            DetectMode::Force => true,
            DetectMode::Disable => false,
            DetectMode::Auto => self.eligible,
        }
    }
}

/// Decision-engine state for a member, surfaced over RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    /// Currently the primary uplink.
    Active,
    /// Healthy standby.
    #[default]
    Backup,
    /// Recently recovered; cannot become primary until it proves stable.
    Probation,
    /// Ineligible (detect=disable, stale, or failing).
    Disabled,
}

// ── Metrics ─────────────────────────────────────────────────────────

/// Radio access technology reported by a cellular modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioTech {
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[serde(rename = "5g")]
    FiveG,
    #[serde(rename = "unknown")]
    Unknown,
}

/// Wireless interface role, as read at collection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WirelessMode {
    Station,
    Ap,
}

/// Starlink dish extensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StarlinkMetrics {
    /// Sky blockage, percent 0–100.
    pub obstruction_pct: Option<f64>,
    /// Fraction of recent time spent obstructed, percent 0–100.
    pub obstruction_time_pct: Option<f64>,
    pub snr_db: Option<f64>,
    /// Seconds of valid obstruction measurement backing the estimate.
    pub obstruction_valid_s: Option<f64>,
    pub patches_valid: Option<u32>,
    pub avg_prolonged_obstruction_interval_s: Option<f64>,
    /// Per-wedge obstruction fractions (12 sky wedges).
    pub wedge_fraction_obstructed: Option<Vec<f64>>,
}

/// Cellular modem extensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellularMetrics {
    pub rsrp_dbm: Option<f64>,
    pub rsrq_db: Option<f64>,
    pub sinr_db: Option<f64>,
    pub roaming: Option<bool>,
    pub technology: Option<RadioTech>,
}

/// Wi-Fi station extensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiMetrics {
    pub rssi_dbm: Option<f64>,
    pub channel: Option<u32>,
    pub channel_utilization_pct: Option<f64>,
    pub mode: Option<WirelessMode>,
}

/// One per-member measurement, produced by a collector each tick.
///
/// Every field may be absent. A record whose core fields are all absent
/// marks a failed collection, distinct from a sample with zeroed values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub timestamp: DateTime<Utc>,
    /// Round-trip latency in milliseconds, ≥ 0.
    pub latency_ms: Option<f64>,
    /// Packet loss, percent 0–100.
    pub loss_pct: Option<f64>,
    /// Latency variation in milliseconds, ≥ 0.
    pub jitter_ms: Option<f64>,
    /// Quota consumption, percent of the configured limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starlink: Option<StarlinkMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cellular: Option<CellularMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi: Option<WifiMetrics>,
}

impl Metrics {
    /// A record with every field absent: what collectors return on
    /// timeout or transport error.
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Metrics {
            timestamp,
            latency_ms: None,
            loss_pct: None,
            jitter_ms: None,
            usage_percent: None,
            starlink: None,
            cellular: None,
            wifi: None,
        }
    }

    /// Whether any core field (latency, loss, jitter) is present.
    pub fn has_core_fields(&self) -> bool {
        self.latency_ms.is_some() || self.loss_pct.is_some() || self.jitter_ms.is_some()
    }
}

// ── Scores ──────────────────────────────────────────────────────────

/// Derived per-sample score triple, all in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Pure function of the metrics record.
    pub instant: f64,
    /// Exponentially-weighted moving average of `instant`.
    pub ewma: f64,
    /// EWMA with the class-specific bias applied. Decisions rank on this.
    #[serde(rename = "final")]
    pub final_score: f64,
}

/// `(timestamp, member, metrics, score)`: the unit held in telemetry rings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub member: String,
    pub metrics: Metrics,
    pub score: Score,
}

// ── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Switch,
    Restore,
    Failover,
    PredictiveTrigger,
    MemberAdded,
    MemberRemoved,
    ModeChange,
}

/// Point-in-time log entry, held in the global bounded event ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub detail: String,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, event_type: EventType, detail: impl Into<String>) -> Self {
        Event {
            timestamp,
            event_type,
            member: None,
            from: None,
            to: None,
            detail: detail.into(),
        }
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn with_transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self.to = Some(to.into());
        self
    }
}

// ── Metered mode ────────────────────────────────────────────────────

/// Client-hint state driven by quota usage on the active uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MeteredMode {
    /// No data limit in play; no hints advertised.
    #[default]
    Off,
    /// A limit exists but usage is comfortably below the warning level.
    Restricted,
    /// Usage at or above the warning threshold.
    NearCap,
    /// Usage at or above the critical threshold.
    OverCap,
    /// Primary is a Wi-Fi station uplink (someone else's network).
    TetheredNoLimit,
}

/// How aggressively to push clients to re-read beacon hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReassocPolicy {
    /// Wait for the next beacon.
    #[default]
    Gentle,
    /// Deauthenticate all stations so they re-associate immediately.
    Force,
}

// ── Quota ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitPeriod {
    Day,
    Week,
    #[default]
    Month,
    Custom,
}

/// Data-cap state for one interface, from the quota/usage provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLimit {
    pub enabled: bool,
    pub period: LimitPeriod,
    pub limit_bytes: u64,
    pub used_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
}

impl DataLimit {
    /// Usage as a percentage of the limit, or `None` when no limit applies.
    pub fn usage_percent(&self) -> Option<f64> {
        if !self.enabled || self.limit_bytes == 0 {
            return None;
        }
        Some(self.used_bytes as f64 / self.limit_bytes as f64 * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn member(name: &str, class: MemberClass) -> Member {
        Member {
            name: name.into(),
            iface: format!("{name}0"),
            class,
            weight: class.default_weight(),
            eligible: true,
            detect: DetectMode::Auto,
            prefer_roaming: false,
            metered: false,
            created_at: ts(),
            last_seen: ts(),
        }
    }

    // ─── Member Selectability ───────────────────────────────────────────

    #[test]
    fn auto_follows_eligibility() {
        let mut m = member("cell", MemberClass::Cellular);
        assert!(m.is_selectable());
        m.eligible = false;
        assert!(!m.is_selectable());
    }

    #[test]
    fn force_overrides_ineligible() {
        let mut m = member("cell", MemberClass::Cellular);
        m.eligible = false;
        m.detect = DetectMode::Force;
        assert!(m.is_selectable());
    }

    #[test]
    fn disable_overrides_eligible() {
        let mut m = member("cell", MemberClass::Cellular);
        m.detect = DetectMode::Disable;
        assert!(!m.is_selectable());
    }

    // ─── Class Defaults ─────────────────────────────────────────────────

    #[test]
    fn default_weights_ordered_by_class() {
        assert!(MemberClass::Starlink.default_weight() > MemberClass::Cellular.default_weight());
        assert!(MemberClass::Cellular.default_weight() > MemberClass::Wifi.default_weight());
        assert!(MemberClass::Wifi.default_weight() > MemberClass::Lan.default_weight());
        assert!(MemberClass::Lan.default_weight() > MemberClass::Other.default_weight());
    }

    // ─── Metrics ────────────────────────────────────────────────────────

    #[test]
    fn empty_metrics_has_no_core_fields() {
        let m = Metrics::empty(ts());
        assert!(!m.has_core_fields());
    }

    #[test]
    fn partial_metrics_has_core_fields() {
        let mut m = Metrics::empty(ts());
        m.loss_pct = Some(0.0);
        assert!(m.has_core_fields());
    }

    #[test]
    fn metrics_serde_round_trip() {
        let mut m = Metrics::empty(ts());
        m.latency_ms = Some(42.5);
        m.starlink = Some(StarlinkMetrics {
            obstruction_pct: Some(1.25),
            snr_db: Some(9.0),
            ..Default::default()
        });

        let json = serde_json::to_string(&m).unwrap();
        let back: Metrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        // Absent extension blocks are omitted from the wire form
        assert!(!json.contains("cellular"));
    }

    #[test]
    fn score_serializes_final_field() {
        let s = Score {
            instant: 90.0,
            ewma: 88.0,
            final_score: 93.0,
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"final\":93"));
    }

    // ─── Enums on the Wire ──────────────────────────────────────────────

    #[test]
    fn class_snake_case_wire_form() {
        assert_eq!(
            serde_json::to_string(&MemberClass::Starlink).unwrap(),
            "\"starlink\""
        );
    }

    #[test]
    fn radio_tech_wire_form() {
        assert_eq!(serde_json::to_string(&RadioTech::FiveG).unwrap(), "\"5g\"");
        let t: RadioTech = serde_json::from_str("\"4g\"").unwrap();
        assert_eq!(t, RadioTech::FourG);
    }

    #[test]
    fn metered_mode_wire_form() {
        assert_eq!(
            serde_json::to_string(&MeteredMode::TetheredNoLimit).unwrap(),
            "\"tethered_no_limit\""
        );
    }

    // ─── Events ─────────────────────────────────────────────────────────

    #[test]
    fn event_builder_sets_transition() {
        let e = Event::new(ts(), EventType::Switch, "score margin").with_transition("a", "b");
        assert_eq!(e.from.as_deref(), Some("a"));
        assert_eq!(e.to.as_deref(), Some("b"));
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"type\":\"switch\""));
    }

    // ─── Data Limits ────────────────────────────────────────────────────

    #[test]
    fn usage_percent_of_limit() {
        let dl = DataLimit {
            enabled: true,
            period: LimitPeriod::Month,
            limit_bytes: 10_000_000_000,
            used_bytes: 7_500_000_000,
            reset_time: None,
        };
        assert!((dl.usage_percent().unwrap() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn usage_percent_none_when_disabled() {
        let dl = DataLimit {
            enabled: false,
            period: LimitPeriod::Month,
            limit_bytes: 10,
            used_bytes: 5,
            reset_time: None,
        };
        assert!(dl.usage_percent().is_none());
    }
}
