//! Quota/usage provider: how much of a member's data cap is spent.
//!
//! Where the platform has a real quota subsystem it is wrapped behind
//! [`UsageProvider`]; otherwise usage is computed from the interface byte
//! counters in sysfs against a configured limit.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use autonomy_common::models::{DataLimit, LimitPeriod};

use crate::config::Config;
use crate::error::{CoreError, Result};

pub trait UsageProvider: Send + Sync {
    /// Data-cap state for `iface`, or `None` when it has no limit.
    fn data_limit(&self, iface: &str) -> Result<Option<DataLimit>>;
}

/// Fallback provider: `/sys/class/net/<iface>/statistics` counters plus
/// the `data_limit_mb` configured per member.
pub struct CounterUsageProvider {
    sysfs_root: PathBuf,
    limits: HashMap<String, u64>,
}

impl CounterUsageProvider {
    pub fn from_config(config: &Config) -> Self {
        Self::with_root("/sys/class/net", config)
    }

    pub fn with_root(root: impl Into<PathBuf>, config: &Config) -> Self {
        let limits = config
            .members
            .iter()
            .filter_map(|m| {
                m.data_limit_mb
                    .map(|mb| (m.iface.clone(), mb * 1024 * 1024))
            })
            .collect();
        CounterUsageProvider {
            sysfs_root: root.into(),
            limits,
        }
    }

    fn read_counter(&self, iface: &str, counter: &str) -> Result<u64> {
        let path = self
            .sysfs_root
            .join(iface)
            .join("statistics")
            .join(counter);
        let raw = fs::read_to_string(&path)
            .map_err(|e| CoreError::Transient(format!("read {path:?}: {e}")))?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| CoreError::Transient(format!("parse {path:?}: {e}")))
    }
}

impl UsageProvider for CounterUsageProvider {
    fn data_limit(&self, iface: &str) -> Result<Option<DataLimit>> {
        let Some(limit_bytes) = self.limits.get(iface).copied() else {
            return Ok(None);
        };
        let used_bytes =
            self.read_counter(iface, "rx_bytes")? + self.read_counter(iface, "tx_bytes")?;
        Ok(Some(DataLimit {
            enabled: true,
            period: LimitPeriod::Month,
            limit_bytes,
            used_bytes,
            reset_time: None,
        }))
    }
}

/// Fixed in-memory provider for tests and simulation.
#[derive(Default)]
pub struct StaticUsageProvider {
    limits: Mutex<HashMap<String, DataLimit>>,
}

impl StaticUsageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, iface: &str, limit: DataLimit) {
        self.limits.lock().unwrap().insert(iface.to_string(), limit);
    }
}

impl UsageProvider for StaticUsageProvider {
    fn data_limit(&self, iface: &str) -> Result<Option<DataLimit>> {
        Ok(self.limits.lock().unwrap().get(iface).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemberConfig;
    use autonomy_common::models::{DetectMode, MemberClass};

    fn config_with_limit(iface: &str, mb: u64) -> Config {
        let mut config = Config::default();
        config.members.push(MemberConfig {
            name: "cell".into(),
            iface: iface.into(),
            class: MemberClass::Cellular,
            weight: 80,
            detect: DetectMode::Auto,
            prefer_roaming: false,
            metered: true,
            data_limit_mb: Some(mb),
        });
        config
    }

    #[test]
    fn counter_provider_reads_sysfs() {
        let dir = std::env::temp_dir().join(format!("autonomy-quota-{}", std::process::id()));
        let stats = dir.join("wwan0").join("statistics");
        fs::create_dir_all(&stats).unwrap();
        fs::write(stats.join("rx_bytes"), "600\n").unwrap();
        fs::write(stats.join("tx_bytes"), "400\n").unwrap();

        let provider = CounterUsageProvider::with_root(&dir, &config_with_limit("wwan0", 1));
        let limit = provider.data_limit("wwan0").unwrap().unwrap();
        assert_eq!(limit.used_bytes, 1000);
        assert_eq!(limit.limit_bytes, 1024 * 1024);
        assert!(limit.enabled);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unlimited_interface_yields_none() {
        let provider =
            CounterUsageProvider::with_root("/nonexistent", &config_with_limit("wwan0", 1));
        assert!(provider.data_limit("eth0").unwrap().is_none());
    }

    #[test]
    fn missing_counters_are_transient() {
        let provider =
            CounterUsageProvider::with_root("/nonexistent", &config_with_limit("wwan0", 1));
        let err = provider.data_limit("wwan0").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transient);
    }

    #[test]
    fn static_provider_round_trip() {
        let provider = StaticUsageProvider::new();
        provider.set(
            "wwan0",
            DataLimit {
                enabled: true,
                period: LimitPeriod::Month,
                limit_bytes: 100,
                used_bytes: 75,
                reset_time: None,
            },
        );
        let limit = provider.data_limit("wwan0").unwrap().unwrap();
        assert!((limit.usage_percent().unwrap() - 75.0).abs() < 1e-9);
    }
}
