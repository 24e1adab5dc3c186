//! Simulation collector: plausible per-class metrics for development on
//! machines without a dish, modems, or radios. Shapes mirror what the
//! real collectors produce so the rest of the pipeline cannot tell the
//! difference.

use chrono::Utc;
use rand::Rng;

use autonomy_common::models::{
    CellularMetrics, Member, MemberClass, Metrics, RadioTech, StarlinkMetrics, WifiMetrics,
    WirelessMode,
};

#[derive(Clone, Default)]
pub struct SimCollector;

impl SimCollector {
    pub fn new() -> Self {
        SimCollector
    }

    pub fn collect(&self, member: &Member) -> Metrics {
        let mut rng = rand::rng();
        let mut metrics = Metrics::empty(Utc::now());

        match member.class {
            MemberClass::Starlink => {
                metrics.latency_ms = Some(35.0 + rng.random_range(0.0..25.0));
                metrics.loss_pct = Some(rng.random_range(0.0..0.5));
                metrics.jitter_ms = Some(rng.random_range(2.0..12.0));
                metrics.starlink = Some(StarlinkMetrics {
                    obstruction_pct: Some(rng.random_range(0.0..1.5)),
                    obstruction_time_pct: Some(rng.random_range(0.0..0.5)),
                    snr_db: Some(8.0 + rng.random_range(0.0..4.0)),
                    obstruction_valid_s: Some(3600.0),
                    patches_valid: Some(8000),
                    avg_prolonged_obstruction_interval_s: None,
                    wedge_fraction_obstructed: None,
                });
            }
            MemberClass::Cellular => {
                metrics.latency_ms = Some(45.0 + rng.random_range(0.0..40.0));
                metrics.loss_pct = Some(rng.random_range(0.0..1.0));
                metrics.jitter_ms = Some(rng.random_range(3.0..20.0));
                metrics.usage_percent = Some(rng.random_range(10.0..90.0));
                metrics.cellular = Some(CellularMetrics {
                    rsrp_dbm: Some(-70.0 - rng.random_range(0.0..30.0)),
                    rsrq_db: Some(-8.0 - rng.random_range(0.0..6.0)),
                    sinr_db: Some(rng.random_range(0.0..20.0)),
                    roaming: Some(false),
                    technology: Some(RadioTech::FourG),
                });
            }
            MemberClass::Wifi => {
                metrics.latency_ms = Some(15.0 + rng.random_range(0.0..20.0));
                metrics.loss_pct = Some(rng.random_range(0.0..0.5));
                metrics.jitter_ms = Some(rng.random_range(1.0..8.0));
                metrics.wifi = Some(WifiMetrics {
                    rssi_dbm: Some(-45.0 - rng.random_range(0.0..25.0)),
                    channel: Some(36),
                    channel_utilization_pct: Some(rng.random_range(5.0..60.0)),
                    mode: Some(WirelessMode::Station),
                });
            }
            MemberClass::Lan | MemberClass::Other => {
                metrics.latency_ms = Some(1.0 + rng.random_range(0.0..5.0));
                metrics.loss_pct = Some(0.0);
                metrics.jitter_ms = Some(rng.random_range(0.0..2.0));
            }
        }
        metrics
    }
}
