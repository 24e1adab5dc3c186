//! The composed daemon root: registry + store + engine + controller +
//! predictor + metered manager behind one object. This is the single
//! daemon-wide instance; every other component receives it (or the
//! sub-interface it needs) as a construction parameter; there are no
//! process-wide globals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use autonomy_common::models::{Event, EventType, MeteredMode};
use autonomy_common::protocol::{
    ComponentHealth, InfoPayload, LogLevel, MemberStatus, StatusPayload,
};

use crate::collect::CollectorFactory;
use crate::config::{Config, ConfigHandle};
use crate::controller::Controller;
use crate::decision::{DecisionEngine, MemberSnapshot};
use crate::metered::apply::MeteredApplier;
use crate::metered::MeteredManager;
use crate::predict::ObstructionPredictor;
use crate::quota::UsageProvider;
use crate::registry::{InterfaceDiscovery, MemberRegistry};
use crate::telemetry::TelemetryStore;

/// Runtime log-level control, wired to the tracing reload handle by the
/// binary. The `setlog` RPC goes through this.
pub trait LogLevelControl: Send + Sync {
    fn set_level(&self, level: LogLevel) -> std::result::Result<(), String>;
}

pub struct Autonomy {
    pub config: ConfigHandle,
    pub registry: MemberRegistry,
    pub store: TelemetryStore,
    pub engine: Mutex<DecisionEngine>,
    pub controller: Controller,
    pub predictor: Mutex<ObstructionPredictor>,
    pub metered: Mutex<MeteredManager>,
    pub applier: MeteredApplier,
    pub collectors: CollectorFactory,
    pub discovery: Box<dyn InterfaceDiscovery>,
    pub usage: Arc<dyn UsageProvider>,
    pub started_at: DateTime<Utc>,
    pub tick_count: AtomicU64,
    pub skipped_ticks: AtomicU64,
    pub log_control: Mutex<Option<Box<dyn LogLevelControl>>>,
    pub(crate) last_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl Autonomy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        controller: Controller,
        collectors: CollectorFactory,
        discovery: Box<dyn InterfaceDiscovery>,
        usage: Arc<dyn UsageProvider>,
        runner: Arc<dyn crate::controller::backend::CommandRunner>,
    ) -> Self {
        let store = TelemetryStore::new(
            &config.telemetry,
            config.scoring.clone(),
            config.daemon.max_ram_mb,
        );
        let engine = DecisionEngine::new(config.decision.clone(), config.staleness_threshold());
        let predictor = ObstructionPredictor::new(
            config.predictor.clone(),
            config.poll_interval().as_secs_f64(),
        );
        let metered = MeteredManager::new(config.metered.clone());
        let applier = MeteredApplier::new(&config.metered, runner, config.daemon.dry_run);
        let registry = MemberRegistry::new(config.daemon.removal_grace_s);
        Autonomy {
            registry,
            store,
            engine: Mutex::new(engine),
            controller,
            predictor: Mutex::new(predictor),
            metered: Mutex::new(metered),
            applier,
            collectors,
            discovery,
            usage,
            config: ConfigHandle::new(config),
            started_at: Utc::now(),
            tick_count: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            log_control: Mutex::new(None),
            last_sweep: Mutex::new(None),
        }
    }

    /// Push a freshly-swapped config into the stateful components.
    /// Controller mode/back-end changes require a restart; everything
    /// else applies live.
    pub fn apply_config(&self) {
        let config = self.config.load();
        self.engine
            .lock()
            .unwrap()
            .set_config(config.decision.clone(), config.staleness_threshold());
        self.predictor.lock().unwrap().set_config(
            config.predictor.clone(),
            config.poll_interval().as_secs_f64(),
        );
        self.metered
            .lock()
            .unwrap()
            .set_config(config.metered.clone());
        tracing::info!("configuration reloaded");
    }

    /// Re-run discovery and merge with the configured member set,
    /// recording add/remove events and dropping telemetry for removed
    /// members.
    pub fn refresh_members(&self, now: DateTime<Utc>) {
        let config = self.config.load();
        let discovered = match self.discovery.discover() {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(error = %e, "discovery failed, keeping previous member set");
                return;
            }
        };
        let delta = self.registry.refresh(&config.members, &discovered, now);
        for name in &delta.added {
            tracing::info!(member = %name, "member added");
            self.store.add_event(
                Event::new(now, EventType::MemberAdded, "discovered").with_member(name.clone()),
            );
        }
        for name in &delta.removed {
            tracing::info!(member = %name, "member removed");
            self.store.add_event(
                Event::new(now, EventType::MemberRemoved, "gone past grace period")
                    .with_member(name.clone()),
            );
        }
        if !delta.removed.is_empty() {
            let names: Vec<String> = self.registry.list().into_iter().map(|m| m.name).collect();
            self.store.retain_members(&names);
        }
    }

    /// Per-member view for one decision pass.
    pub fn member_snapshots(&self) -> Vec<MemberSnapshot> {
        self.registry
            .list()
            .into_iter()
            .map(|member| {
                let latest = self.store.latest(&member.name);
                MemberSnapshot {
                    score: latest.as_ref().map(|s| s.score),
                    last_sample_at: latest.as_ref().map(|s| s.timestamp),
                    latest_metrics: latest.map(|s| s.metrics),
                    member,
                }
            })
            .collect()
    }

    pub fn status_payload(&self) -> StatusPayload {
        let engine = self.engine.lock().unwrap();
        let members = self
            .registry
            .list()
            .into_iter()
            .map(|m| {
                let latest = self.store.latest(&m.name);
                MemberStatus {
                    state: engine.member_state(&m.name),
                    score: latest.map(|s| s.score),
                    name: m.name,
                    iface: m.iface,
                    class: m.class,
                    eligible: m.eligible,
                    detect: m.detect,
                    weight: m.weight,
                    last_seen: m.last_seen,
                }
            })
            .collect();
        let metered_mode = self
            .metered
            .lock()
            .map(|m| m.mode())
            .unwrap_or(MeteredMode::Off);
        StatusPayload {
            primary: engine.current_primary().map(|s| s.to_string()),
            members,
            metered_mode,
            uptime_s: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            tick_count: self.tick_count.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            health: ComponentHealth {
                store: true,
                registry: true,
                controller: true,
                predictor: self.predictor.lock().is_ok(),
                metered: self.metered.lock().is_ok(),
            },
        }
    }

    pub fn info_payload(&self) -> InfoPayload {
        InfoPayload {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            tick_count: self.tick_count.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            memory_usage_bytes: self.store.memory_usage_bytes(),
            dry_run: self.controller.dry_run(),
        }
    }

    /// Flush the event ring into the log sink; the fatal-exit path calls
    /// this before the process dies.
    pub fn flush_events_to_log(&self) {
        for event in self.store.drain_events() {
            tracing::error!(
                at = %event.timestamp,
                kind = ?event.event_type,
                member = event.member.as_deref().unwrap_or("-"),
                detail = %event.detail,
                "event ring flush"
            );
        }
    }
}
