//! # Member Registry & Discovery
//!
//! Canonical list of uplink members, merged from configuration and a
//! discovery callback that enumerates present interfaces. The registry is
//! the sole owner of `Member` values; every other component holds names
//! and takes snapshots.
//!
//! A member present in configuration but not currently discovered is kept
//! with `eligible = false`; an interface discovered but not configured is
//! auto-added with its class-default weight. Members that disappear from
//! both sources are dropped after a grace period.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

use autonomy_common::models::{DetectMode, Member, MemberClass};

use crate::config::MemberConfig;
use crate::error::{CoreError, Result};

// ── Discovery ───────────────────────────────────────────────────────

/// One interface reported by the discovery callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInterface {
    pub iface: String,
    pub up: bool,
}

pub trait InterfaceDiscovery: Send + Sync {
    fn discover(&self) -> Result<Vec<DiscoveredInterface>>;
}

/// Reads interface presence and operational state from sysfs.
pub struct SysfsDiscovery {
    root: PathBuf,
}

impl SysfsDiscovery {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        SysfsDiscovery { root: root.into() }
    }
}

impl Default for SysfsDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceDiscovery for SysfsDiscovery {
    fn discover(&self) -> Result<Vec<DiscoveredInterface>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| CoreError::Transient(format!("read {:?}: {e}", self.root)))?;
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let iface = entry.file_name().to_string_lossy().into_owned();
            if iface == "lo" {
                continue;
            }
            let operstate = fs::read_to_string(entry.path().join("operstate"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            // "unknown" covers point-to-point modem interfaces that never
            // report carrier; treat them as up.
            let up = matches!(operstate.as_str(), "up" | "unknown");
            out.push(DiscoveredInterface { iface, up });
        }
        Ok(out)
    }
}

/// Fixed interface list; the simulation and test discovery source.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    pub interfaces: Vec<DiscoveredInterface>,
}

impl StaticDiscovery {
    pub fn up(ifaces: &[&str]) -> Self {
        StaticDiscovery {
            interfaces: ifaces
                .iter()
                .map(|i| DiscoveredInterface {
                    iface: (*i).to_string(),
                    up: true,
                })
                .collect(),
        }
    }
}

impl InterfaceDiscovery for StaticDiscovery {
    fn discover(&self) -> Result<Vec<DiscoveredInterface>> {
        Ok(self.interfaces.clone())
    }
}

/// Best-effort class guess for interfaces discovered outside configuration.
pub fn infer_class(iface: &str) -> MemberClass {
    if iface.starts_with("wwan") || iface.starts_with("usb") || iface.starts_with("qmimux") {
        MemberClass::Cellular
    } else if iface.starts_with("wlan") || iface.starts_with("phy") {
        MemberClass::Wifi
    } else if iface.starts_with("eth") || iface.starts_with("lan") || iface.starts_with("wan") {
        MemberClass::Lan
    } else {
        MemberClass::Other
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Names added/removed by one refresh, for event emission by the caller.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RegistryDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

pub struct MemberRegistry {
    members: RwLock<HashMap<String, Member>>,
    removal_grace: Duration,
}

impl MemberRegistry {
    pub fn new(removal_grace_s: u64) -> Self {
        MemberRegistry {
            members: RwLock::new(HashMap::new()),
            removal_grace: Duration::seconds(removal_grace_s as i64),
        }
    }

    /// Rebuild the member set from configuration plus discovery, keeping
    /// identity (and therefore telemetry ring state) for unchanged
    /// members.
    pub fn refresh(
        &self,
        config_members: &[MemberConfig],
        discovered: &[DiscoveredInterface],
        now: DateTime<Utc>,
    ) -> RegistryDelta {
        let mut members = self.members.write().expect("registry poisoned");
        let mut delta = RegistryDelta::default();

        let find_discovered =
            |iface: &str| discovered.iter().find(|d| d.iface == iface);

        for mc in config_members {
            let seen = find_discovered(&mc.iface);
            let eligible = seen.map(|d| d.up).unwrap_or(false);
            match members.get_mut(&mc.name) {
                Some(existing) => {
                    existing.iface = mc.iface.clone();
                    existing.class = mc.class;
                    existing.weight = mc.weight;
                    existing.detect = mc.detect;
                    existing.prefer_roaming = mc.prefer_roaming;
                    existing.metered = mc.metered;
                    existing.eligible = eligible;
                    if seen.is_some() {
                        existing.last_seen = now;
                    }
                }
                None => {
                    members.insert(
                        mc.name.clone(),
                        Member {
                            name: mc.name.clone(),
                            iface: mc.iface.clone(),
                            class: mc.class,
                            weight: mc.weight,
                            eligible,
                            detect: mc.detect,
                            prefer_roaming: mc.prefer_roaming,
                            metered: mc.metered,
                            created_at: now,
                            last_seen: now,
                        },
                    );
                    delta.added.push(mc.name.clone());
                }
            }
        }

        // Interfaces present on the box but absent from configuration are
        // auto-added so they can serve as last-resort uplinks.
        for d in discovered {
            let configured = config_members.iter().any(|mc| mc.iface == d.iface);
            let known = members.values().any(|m| m.iface == d.iface);
            if configured || known {
                continue;
            }
            let class = infer_class(&d.iface);
            members.insert(
                d.iface.clone(),
                Member {
                    name: d.iface.clone(),
                    iface: d.iface.clone(),
                    class,
                    weight: class.default_weight(),
                    eligible: d.up,
                    detect: DetectMode::Auto,
                    prefer_roaming: false,
                    metered: class == MemberClass::Cellular,
                    created_at: now,
                    last_seen: now,
                },
            );
            delta.added.push(d.iface.clone());
        }

        // Refresh last_seen for auto-added members still discovered, and
        // drop members gone from both sources past the grace period.
        let grace = self.removal_grace;
        members.retain(|name, m| {
            let configured = config_members.iter().any(|mc| &mc.name == name);
            let seen = find_discovered(&m.iface).is_some();
            if seen {
                m.last_seen = now;
                m.eligible = find_discovered(&m.iface).map(|d| d.up).unwrap_or(false);
            }
            if configured || seen {
                return true;
            }
            if now - m.last_seen > grace {
                delta.removed.push(name.clone());
                false
            } else {
                m.eligible = false;
                true
            }
        });

        delta
    }

    /// Atomic replacement of the whole member set (administrative RPC).
    pub fn set_members(&self, list: Vec<Member>) {
        let mut members = self.members.write().expect("registry poisoned");
        members.clear();
        for m in list {
            members.insert(m.name.clone(), m);
        }
    }

    pub fn get(&self, name: &str) -> Option<Member> {
        self.members
            .read()
            .expect("registry poisoned")
            .get(name)
            .cloned()
    }

    /// Snapshot of all members, sorted by name for stable iteration.
    pub fn list(&self) -> Vec<Member> {
        let members = self.members.read().expect("registry poisoned");
        let mut out: Vec<Member> = members.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn update_last_seen(&self, name: &str, at: DateTime<Utc>) {
        if let Some(m) = self
            .members
            .write()
            .expect("registry poisoned")
            .get_mut(name)
        {
            m.last_seen = at;
        }
    }

    pub fn set_detect(&self, name: &str, detect: DetectMode) -> Result<()> {
        let mut members = self.members.write().expect("registry poisoned");
        match members.get_mut(name) {
            Some(m) => {
                m.detect = detect;
                Ok(())
            }
            None => Err(CoreError::InvariantViolation(format!(
                "set_detect on unknown member {name:?}"
            ))),
        }
    }

    pub fn set_weight(&self, name: &str, weight: u8) -> Result<()> {
        let mut members = self.members.write().expect("registry poisoned");
        match members.get_mut(name) {
            Some(m) => {
                m.weight = weight.min(100);
                Ok(())
            }
            None => Err(CoreError::InvariantViolation(format!(
                "set_weight on unknown member {name:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_s)
    }

    fn config_member(name: &str, iface: &str, class: MemberClass) -> MemberConfig {
        MemberConfig {
            name: name.into(),
            iface: iface.into(),
            class,
            weight: class.default_weight(),
            detect: DetectMode::Auto,
            prefer_roaming: false,
            metered: false,
            data_limit_mb: None,
        }
    }

    // ─── Refresh ────────────────────────────────────────────────────────

    #[test]
    fn configured_and_discovered_is_eligible() {
        let reg = MemberRegistry::new(60);
        let cfg = [config_member("starlink", "wan", MemberClass::Starlink)];
        let delta = reg.refresh(&cfg, &StaticDiscovery::up(&["wan"]).interfaces, ts(0));
        assert_eq!(delta.added, vec!["starlink".to_string()]);
        let m = reg.get("starlink").unwrap();
        assert!(m.eligible);
        assert!(m.is_selectable());
    }

    #[test]
    fn configured_but_undiscovered_kept_ineligible() {
        let reg = MemberRegistry::new(60);
        let cfg = [config_member("cell", "wwan0", MemberClass::Cellular)];
        reg.refresh(&cfg, &[], ts(0));
        let m = reg.get("cell").unwrap();
        assert!(!m.eligible);
        assert!(!m.is_selectable());
    }

    #[test]
    fn discovered_unconfigured_auto_added_with_class_defaults() {
        let reg = MemberRegistry::new(60);
        let delta = reg.refresh(&[], &StaticDiscovery::up(&["wwan1"]).interfaces, ts(0));
        assert_eq!(delta.added, vec!["wwan1".to_string()]);
        let m = reg.get("wwan1").unwrap();
        assert_eq!(m.class, MemberClass::Cellular);
        assert_eq!(m.weight, MemberClass::Cellular.default_weight());
        assert!(m.metered);
    }

    #[test]
    fn down_interface_is_ineligible() {
        let reg = MemberRegistry::new(60);
        let cfg = [config_member("lan", "eth0", MemberClass::Lan)];
        let discovered = [DiscoveredInterface {
            iface: "eth0".into(),
            up: false,
        }];
        reg.refresh(&cfg, &discovered, ts(0));
        assert!(!reg.get("lan").unwrap().eligible);
    }

    #[test]
    fn unseen_member_removed_after_grace() {
        let reg = MemberRegistry::new(60);
        reg.refresh(&[], &StaticDiscovery::up(&["wwan1"]).interfaces, ts(0));
        assert!(reg.get("wwan1").is_some());

        // Still within grace: kept but ineligible
        let delta = reg.refresh(&[], &[], ts(30));
        assert!(delta.removed.is_empty());
        assert!(!reg.get("wwan1").unwrap().eligible);

        // Past grace: removed
        let delta = reg.refresh(&[], &[], ts(120));
        assert_eq!(delta.removed, vec!["wwan1".to_string()]);
        assert!(reg.get("wwan1").is_none());
    }

    #[test]
    fn refresh_preserves_created_at() {
        let reg = MemberRegistry::new(60);
        let cfg = [config_member("lan", "eth0", MemberClass::Lan)];
        reg.refresh(&cfg, &StaticDiscovery::up(&["eth0"]).interfaces, ts(0));
        reg.refresh(&cfg, &StaticDiscovery::up(&["eth0"]).interfaces, ts(100));
        let m = reg.get("lan").unwrap();
        assert_eq!(m.created_at, ts(0));
        assert_eq!(m.last_seen, ts(100));
    }

    #[test]
    fn config_weight_changes_apply_on_refresh() {
        let reg = MemberRegistry::new(60);
        let mut cfg = vec![config_member("lan", "eth0", MemberClass::Lan)];
        reg.refresh(&cfg, &StaticDiscovery::up(&["eth0"]).interfaces, ts(0));
        cfg[0].weight = 77;
        reg.refresh(&cfg, &StaticDiscovery::up(&["eth0"]).interfaces, ts(1));
        assert_eq!(reg.get("lan").unwrap().weight, 77);
    }

    // ─── Administrative Paths ───────────────────────────────────────────

    #[test]
    fn set_members_replaces_atomically() {
        let reg = MemberRegistry::new(60);
        reg.refresh(
            &[config_member("lan", "eth0", MemberClass::Lan)],
            &StaticDiscovery::up(&["eth0"]).interfaces,
            ts(0),
        );
        let replacement = Member {
            name: "only".into(),
            iface: "eth9".into(),
            class: MemberClass::Other,
            weight: 20,
            eligible: true,
            detect: DetectMode::Auto,
            prefer_roaming: false,
            metered: false,
            created_at: ts(0),
            last_seen: ts(0),
        };
        reg.set_members(vec![replacement]);
        assert!(reg.get("lan").is_none());
        assert!(reg.get("only").is_some());
    }

    #[test]
    fn set_weight_clamps_and_errors_on_unknown() {
        let reg = MemberRegistry::new(60);
        reg.refresh(
            &[config_member("lan", "eth0", MemberClass::Lan)],
            &StaticDiscovery::up(&["eth0"]).interfaces,
            ts(0),
        );
        reg.set_weight("lan", 200).unwrap();
        assert_eq!(reg.get("lan").unwrap().weight, 100);
        assert!(reg.set_weight("ghost", 50).is_err());
    }

    // ─── Class Inference ────────────────────────────────────────────────

    #[test]
    fn class_inference_by_prefix() {
        assert_eq!(infer_class("wwan0"), MemberClass::Cellular);
        assert_eq!(infer_class("wlan1"), MemberClass::Wifi);
        assert_eq!(infer_class("eth0"), MemberClass::Lan);
        assert_eq!(infer_class("tun0"), MemberClass::Other);
    }

    #[test]
    fn list_sorted_by_name() {
        let reg = MemberRegistry::new(60);
        reg.refresh(
            &[
                config_member("zeta", "eth1", MemberClass::Lan),
                config_member("alpha", "eth0", MemberClass::Lan),
            ],
            &[],
            ts(0),
        );
        let names: Vec<String> = reg.list().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
