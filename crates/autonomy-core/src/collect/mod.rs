//! # Metric Collectors
//!
//! One collector per member class behind a closed enum. The class set is
//! small and fixed, so dispatch is a `match`, not a trait object zoo.
//!
//! The contract every implementation honors: `collect` returns within the
//! class deadline (Starlink 10 s, others 5 s by default), and on timeout
//! or any transport error it returns a metrics record whose core fields
//! are absent. A failed probe is data, not an error; the scheduler never
//! sees a collector failure.

pub mod cellular;
pub mod probe;
pub mod sim;
pub mod starlink;
pub mod wifi;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use autonomy_common::models::{Member, MemberClass, Metrics};

use crate::config::Config;
use crate::controller::backend::CommandRunner;
use crate::error::Result;
use crate::quota::UsageProvider;

use cellular::CellularCollector;
use probe::tcp_probe;
use sim::SimCollector;
use starlink::StarlinkCollector;
use wifi::WifiCollector;

/// Reachability-only collector for LAN and other wired members.
#[derive(Clone)]
pub struct ProbeCollector {
    targets: Vec<String>,
    count: u32,
    per_attempt: Duration,
}

impl ProbeCollector {
    pub fn new(targets: Vec<String>, count: u32, per_attempt: Duration) -> Self {
        ProbeCollector {
            targets,
            count,
            per_attempt,
        }
    }

    pub async fn collect(&self) -> Result<Metrics> {
        let outcome = tcp_probe(&self.targets, self.count, self.per_attempt).await;
        let mut metrics = Metrics::empty(Utc::now());
        metrics.latency_ms = outcome.latency_ms;
        metrics.loss_pct = outcome.loss_pct;
        metrics.jitter_ms = outcome.jitter_ms;
        Ok(metrics)
    }
}

/// Class-dispatched collector with its deadline attached.
#[derive(Clone)]
pub enum Collector {
    Starlink(StarlinkCollector),
    Cellular(CellularCollector),
    Wifi(WifiCollector),
    Probe(ProbeCollector),
    Sim(SimCollector),
}

impl Collector {
    /// Gather metrics for `member`, bounded by [`Collector::deadline`].
    /// Never fails: errors and timeouts collapse to an empty record.
    pub async fn collect(&self, member: &Member, deadline: Duration) -> Metrics {
        let inner = async {
            match self {
                Collector::Starlink(c) => c.collect().await,
                Collector::Cellular(c) => c.collect(&member.iface).await,
                Collector::Wifi(c) => c.collect(&member.iface).await,
                Collector::Probe(c) => c.collect().await,
                Collector::Sim(c) => Ok(c.collect(member)),
            }
        };
        match tokio::time::timeout(deadline, inner).await {
            Ok(Ok(metrics)) => metrics,
            Ok(Err(e)) => {
                tracing::debug!(member = %member.name, error = %e, "collection failed");
                Metrics::empty(Utc::now())
            }
            Err(_) => {
                tracing::warn!(member = %member.name, deadline_ms = deadline.as_millis() as u64, "collection deadline exceeded");
                Metrics::empty(Utc::now())
            }
        }
    }
}

/// Builds per-member collectors each tick from the live config. Holds the
/// shared pieces (subprocess runner, quota provider, HTTP client inside
/// the Starlink collector) so per-tick construction stays cheap.
pub struct CollectorFactory {
    runner: Arc<dyn CommandRunner>,
    usage: Arc<dyn UsageProvider>,
    simulate: bool,
}

impl CollectorFactory {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        usage: Arc<dyn UsageProvider>,
        simulate: bool,
    ) -> Self {
        CollectorFactory {
            runner,
            usage,
            simulate,
        }
    }

    pub fn simulate(&self) -> bool {
        self.simulate
    }

    /// The collection deadline for `member` under `config`.
    pub fn deadline(&self, config: &Config, member: &Member) -> Duration {
        config.collector.deadline(member.class, &config.starlink)
    }

    pub fn build(&self, config: &Config, member: &Member) -> Collector {
        if self.simulate {
            return Collector::Sim(SimCollector::new());
        }
        let probe_timeout = Duration::from_secs(config.collector.default_timeout_s);
        match member.class {
            MemberClass::Starlink => Collector::Starlink(StarlinkCollector::new(
                &config.starlink,
                self.runner.clone(),
            )),
            MemberClass::Cellular => Collector::Cellular(CellularCollector::new(
                self.runner.clone(),
                self.usage.clone(),
                config.collector.cellular_modem_index,
                config.collector.probe_targets.clone(),
                config.collector.probe_count,
                probe_timeout,
            )),
            MemberClass::Wifi => Collector::Wifi(WifiCollector::new(
                self.runner.clone(),
                config.collector.probe_targets.clone(),
                config.collector.probe_count,
                probe_timeout,
            )),
            MemberClass::Lan | MemberClass::Other => Collector::Probe(ProbeCollector::new(
                config.collector.probe_targets.clone(),
                config.collector.probe_count,
                probe_timeout,
            )),
        }
    }
}
