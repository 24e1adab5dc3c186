//! # Metered Manager
//!
//! State machine turning quota usage on the active uplink into client
//! hints: beacon vendor IEs and the Android DHCP option that tell
//! connected devices to conserve data.
//!
//! Failover-driven transitions settle for `stability_delay_s` before
//! applying (a flapping primary must not thrash every client's metered
//! state); usage-driven transitions apply immediately. Threshold
//! crossings are hysteretic so usage hovering at a boundary does not
//! oscillate.

pub mod apply;
pub mod ie;

use chrono::{DateTime, Duration, Utc};

use autonomy_common::models::{DataLimit, Member, MemberClass, MeteredMode, ReassocPolicy, WirelessMode};

use crate::config::MeteredConfig;

use ie::{apple_ie, network_cost_ie, parse_mac, tethering_ie, VendorIe};

/// Everything external helpers need to re-advertise the metered state.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientHints {
    pub mode: MeteredMode,
    pub ies: Vec<VendorIe>,
    pub dhcp_android_metered: bool,
    pub reassoc: ReassocPolicy,
}

#[derive(Debug, Clone, Copy)]
struct PendingFailover {
    target: MeteredMode,
    has_limit: bool,
    apply_at: DateTime<Utc>,
}

pub struct MeteredManager {
    cfg: MeteredConfig,
    mode: MeteredMode,
    /// Whether the current primary carries a data limit.
    has_limit: bool,
    pending: Option<PendingFailover>,
    last_change_at: Option<DateTime<Utc>>,
}

impl MeteredManager {
    pub fn new(cfg: MeteredConfig) -> Self {
        MeteredManager {
            cfg,
            mode: MeteredMode::Off,
            has_limit: false,
            pending: None,
            last_change_at: None,
        }
    }

    /// Swap in reloaded tunables; the current mode carries over.
    pub fn set_config(&mut self, cfg: MeteredConfig) {
        self.cfg = cfg;
    }

    pub fn mode(&self) -> MeteredMode {
        self.mode
    }

    pub fn last_change_at(&self) -> Option<DateTime<Utc>> {
        self.last_change_at
    }

    /// A new primary was committed. The resulting mode is applied after
    /// the stability delay (see [`MeteredManager::tick`]).
    pub fn on_failover(
        &mut self,
        primary: &Member,
        wireless_mode: Option<WirelessMode>,
        limit: Option<&DataLimit>,
        now: DateTime<Utc>,
    ) {
        if !self.cfg.enabled {
            return;
        }
        let has_limit = limit.map(|l| l.enabled && l.limit_bytes > 0).unwrap_or(false);
        let target = if primary.class == MemberClass::Wifi
            && wireless_mode == Some(WirelessMode::Station)
        {
            MeteredMode::TetheredNoLimit
        } else if !has_limit {
            MeteredMode::Off
        } else {
            let usage = limit.and_then(|l| l.usage_percent()).unwrap_or(0.0);
            self.next_mode(MeteredMode::Restricted, usage, true)
        };
        self.pending = Some(PendingFailover {
            target,
            has_limit,
            apply_at: now + Duration::seconds(self.cfg.stability_delay_s as i64),
        });
        tracing::debug!(
            primary = %primary.name,
            target = ?target,
            delay_s = self.cfg.stability_delay_s,
            "metered mode pending failover settle"
        );
    }

    /// Apply a settled failover transition, if due. Called every tick.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<ClientHints> {
        let pending = self.pending?;
        if pending.apply_at > now {
            return None;
        }
        self.pending = None;
        self.has_limit = pending.has_limit;
        self.change_mode(pending.target, now)
    }

    /// Usage update from the quota provider; applies immediately.
    pub fn on_usage(&mut self, usage_percent: f64, now: DateTime<Utc>) -> Option<ClientHints> {
        if !self.cfg.enabled || !self.has_limit || self.mode == MeteredMode::TetheredNoLimit {
            return None;
        }
        let next = self.next_mode(self.mode, usage_percent, self.has_limit);
        self.change_mode(next, now)
    }

    /// Current hints without a transition, for re-application on demand
    /// (the `recheck_metered` action).
    pub fn hints(&self) -> ClientHints {
        self.build_hints(self.mode)
    }

    // ─── Internal ───────────────────────────────────────────────────────

    fn change_mode(&mut self, next: MeteredMode, now: DateTime<Utc>) -> Option<ClientHints> {
        if next == self.mode {
            return None;
        }
        tracing::info!(from = ?self.mode, to = ?next, "metered mode change");
        self.mode = next;
        self.last_change_at = Some(now);
        Some(self.build_hints(next))
    }

    /// The threshold table with hysteresis `h` around `warn` and `crit`.
    fn next_mode(&self, current: MeteredMode, u: f64, has_limit: bool) -> MeteredMode {
        let warn = self.cfg.warn_percent;
        let crit = self.cfg.crit_percent;
        let h = self.cfg.hysteresis_percent;
        match current {
            MeteredMode::Off | MeteredMode::Restricted => {
                if u >= crit {
                    MeteredMode::OverCap
                } else if u >= warn {
                    MeteredMode::NearCap
                } else if has_limit {
                    MeteredMode::Restricted
                } else {
                    MeteredMode::Off
                }
            }
            MeteredMode::NearCap => {
                if u >= crit {
                    MeteredMode::OverCap
                } else if u < warn - h {
                    MeteredMode::Restricted
                } else {
                    MeteredMode::NearCap
                }
            }
            MeteredMode::OverCap => {
                if u < crit - h {
                    if u < warn - h {
                        MeteredMode::Restricted
                    } else {
                        MeteredMode::NearCap
                    }
                } else {
                    MeteredMode::OverCap
                }
            }
            MeteredMode::TetheredNoLimit => MeteredMode::TetheredNoLimit,
        }
    }

    fn build_hints(&self, mode: MeteredMode) -> ClientHints {
        let mut ies = Vec::new();
        match mode {
            MeteredMode::Off => {}
            MeteredMode::TetheredNoLimit => {
                let mac = self
                    .cfg
                    .ap_mac
                    .as_deref()
                    .and_then(parse_mac)
                    .unwrap_or([0u8; 6]);
                ies.push(tethering_ie(mac));
                ies.push(apple_ie());
            }
            MeteredMode::Restricted | MeteredMode::NearCap | MeteredMode::OverCap => {
                if let Some(cost) = network_cost_ie(mode) {
                    ies.push(cost);
                }
                ies.push(apple_ie());
            }
        }
        let dhcp_android_metered = matches!(
            mode,
            MeteredMode::NearCap | MeteredMode::OverCap | MeteredMode::TetheredNoLimit
        );
        ClientHints {
            mode,
            ies,
            dhcp_android_metered,
            reassoc: self.cfg.reassoc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autonomy_common::models::{DetectMode, LimitPeriod};
    use chrono::TimeZone;

    fn ts(offset_s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_s)
    }

    fn member(class: MemberClass) -> Member {
        Member {
            name: "m".into(),
            iface: "wwan0".into(),
            class,
            weight: 80,
            eligible: true,
            detect: DetectMode::Auto,
            prefer_roaming: false,
            metered: true,
            created_at: ts(0),
            last_seen: ts(0),
        }
    }

    fn limit(used_pct: f64) -> DataLimit {
        let limit_bytes = 10_000_000_000u64;
        DataLimit {
            enabled: true,
            period: LimitPeriod::Month,
            limit_bytes,
            used_bytes: (limit_bytes as f64 * used_pct / 100.0) as u64,
            reset_time: None,
        }
    }

    fn manager() -> MeteredManager {
        MeteredManager::new(MeteredConfig {
            stability_delay_s: 300,
            ..Default::default()
        })
    }

    /// Fail over to a limited cellular primary and settle the delay.
    fn settled_manager(used_pct: f64) -> MeteredManager {
        let mut m = manager();
        m.on_failover(&member(MemberClass::Cellular), None, Some(&limit(used_pct)), ts(0));
        m.tick(ts(301)).expect("settle should change mode");
        m
    }

    // ─── Failover Transitions ───────────────────────────────────────────

    #[test]
    fn failover_transition_waits_for_stability_delay() {
        let mut m = manager();
        m.on_failover(&member(MemberClass::Cellular), None, Some(&limit(50.0)), ts(0));
        assert!(m.tick(ts(100)).is_none());
        assert_eq!(m.mode(), MeteredMode::Off);

        let hints = m.tick(ts(300)).expect("delay elapsed");
        assert_eq!(hints.mode, MeteredMode::Restricted);
        assert_eq!(m.mode(), MeteredMode::Restricted);
    }

    #[test]
    fn wifi_station_primary_is_tethered() {
        let mut m = manager();
        m.on_failover(
            &member(MemberClass::Wifi),
            Some(WirelessMode::Station),
            None,
            ts(0),
        );
        let hints = m.tick(ts(301)).unwrap();
        assert_eq!(hints.mode, MeteredMode::TetheredNoLimit);
        // Tethering + Apple IEs, no network cost
        assert_eq!(hints.ies.len(), 2);
        assert!(hints.dhcp_android_metered);
    }

    #[test]
    fn unlimited_primary_goes_off() {
        let mut m = settled_manager(85.0);
        assert_eq!(m.mode(), MeteredMode::NearCap);
        m.on_failover(&member(MemberClass::Starlink), None, None, ts(400));
        let hints = m.tick(ts(701)).unwrap();
        assert_eq!(hints.mode, MeteredMode::Off);
        assert!(hints.ies.is_empty());
        assert!(!hints.dhcp_android_metered);
    }

    #[test]
    fn wifi_ap_mode_is_not_tethered() {
        let mut m = manager();
        m.on_failover(
            &member(MemberClass::Wifi),
            Some(WirelessMode::Ap),
            None,
            ts(0),
        );
        // AP-side Wi-Fi with no limit: plain Off
        assert!(m.tick(ts(301)).is_none());
        assert_eq!(m.mode(), MeteredMode::Off);
    }

    // ─── Usage Transitions ──────────────────────────────────────────────

    #[test]
    fn usage_ladder_with_hysteresis() {
        // warn=80, crit=95, h=5; start at 75% used → Restricted
        let mut m = settled_manager(75.0);
        assert_eq!(m.mode(), MeteredMode::Restricted);

        // 81% → NearCap, cost IE carries the approaching-limit flag 0x08
        let hints = m.on_usage(81.0, ts(310)).unwrap();
        assert_eq!(hints.mode, MeteredMode::NearCap);
        assert_eq!(hints.ies[0].payload[4], 0x08);

        // 96% → OverCap, flag 0x01
        let hints = m.on_usage(96.0, ts(320)).unwrap();
        assert_eq!(hints.mode, MeteredMode::OverCap);
        assert_eq!(hints.ies[0].payload[4], 0x01);

        // 89% → stays OverCap (89 ≥ crit − h = 90 is false… 89 < 90, but
        // 89 ≥ warn − h = 75 → NearCap). Hold at 91 first to verify the
        // sticky band, then drop.
        assert!(m.on_usage(91.0, ts(330)).is_none());
        assert_eq!(m.mode(), MeteredMode::OverCap);

        // 89% < crit − h → NearCap
        let hints = m.on_usage(89.0, ts(340)).unwrap();
        assert_eq!(hints.mode, MeteredMode::NearCap);

        // 74% < warn − h → Restricted
        let hints = m.on_usage(74.0, ts(350)).unwrap();
        assert_eq!(hints.mode, MeteredMode::Restricted);
    }

    #[test]
    fn usage_applies_immediately_without_delay() {
        let mut m = settled_manager(50.0);
        let before = ts(310);
        let hints = m.on_usage(97.0, before).unwrap();
        assert_eq!(hints.mode, MeteredMode::OverCap);
        assert_eq!(m.last_change_at(), Some(before));
    }

    #[test]
    fn hovering_at_warn_boundary_does_not_flap() {
        let mut m = settled_manager(50.0);
        m.on_usage(81.0, ts(310)).unwrap();
        assert_eq!(m.mode(), MeteredMode::NearCap);
        // 79 is within warn − h = 75 .. warn: stays NearCap
        assert!(m.on_usage(79.0, ts(320)).is_none());
        assert!(m.on_usage(81.0, ts(330)).is_none());
        assert_eq!(m.mode(), MeteredMode::NearCap);
    }

    #[test]
    fn usage_ignored_without_limit() {
        let mut m = manager();
        m.on_failover(&member(MemberClass::Starlink), None, None, ts(0));
        m.tick(ts(301));
        assert!(m.on_usage(99.0, ts(310)).is_none());
        assert_eq!(m.mode(), MeteredMode::Off);
    }

    #[test]
    fn usage_ignored_while_tethered() {
        let mut m = manager();
        m.on_failover(
            &member(MemberClass::Wifi),
            Some(WirelessMode::Station),
            None,
            ts(0),
        );
        m.tick(ts(301));
        assert!(m.on_usage(99.0, ts(310)).is_none());
        assert_eq!(m.mode(), MeteredMode::TetheredNoLimit);
    }

    // ─── Hints ──────────────────────────────────────────────────────────

    #[test]
    fn restricted_hints_have_cost_and_apple_no_dhcp() {
        let m = settled_manager(50.0);
        let hints = m.hints();
        assert_eq!(hints.mode, MeteredMode::Restricted);
        assert_eq!(hints.ies.len(), 2);
        assert_eq!(hints.ies[0].payload[0], 0x11);
        assert!(!hints.dhcp_android_metered);
    }

    #[test]
    fn tethering_ie_carries_configured_ap_mac() {
        let mut m = MeteredManager::new(MeteredConfig {
            ap_mac: Some("aa:bb:cc:dd:ee:ff".into()),
            ..Default::default()
        });
        m.on_failover(
            &member(MemberClass::Wifi),
            Some(WirelessMode::Station),
            None,
            ts(0),
        );
        let hints = m.tick(ts(301)).unwrap();
        let tether = &hints.ies[0];
        assert_eq!(&tether.payload[8..], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn disabled_manager_is_inert() {
        let mut m = MeteredManager::new(MeteredConfig {
            enabled: false,
            ..Default::default()
        });
        m.on_failover(&member(MemberClass::Cellular), None, Some(&limit(99.0)), ts(0));
        assert!(m.tick(ts(301)).is_none());
        assert!(m.on_usage(99.0, ts(310)).is_none());
        assert_eq!(m.mode(), MeteredMode::Off);
    }
}
