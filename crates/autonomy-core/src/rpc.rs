//! RPC method dispatch over the daemon root. The transport (ubus, unix
//! socket, HTTP) lives outside the core; it deserializes an
//! [`RpcRequest`], calls [`handle`], and ships the [`RpcResponse`] back.
//!
//! Failed calls return `success = false` with a message and no partial
//! state. `status` is always best-effort, even with unhealthy
//! sub-components.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use autonomy_common::models::{Event, EventType, Sample};
use autonomy_common::protocol::{
    ActionCmd, EventsPayload, RpcRequest, RpcResponse, TelemetryPayload,
};

use crate::daemon::Autonomy;
use crate::scheduler;

/// Default telemetry window when `since` is omitted.
const DEFAULT_TELEMETRY_WINDOW_MIN: i64 = 60;
const DEFAULT_EVENT_LIMIT: usize = 100;

pub async fn handle(root: &Arc<Autonomy>, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::Status => RpcResponse::ok(root.status_payload()),
        RpcRequest::Members => RpcResponse::ok(root.status_payload().members),
        RpcRequest::Telemetry { member, since } => telemetry(root, member, since),
        RpcRequest::Events { since, limit } => {
            let since = since.unwrap_or(DateTime::<Utc>::MIN_UTC);
            let events = root
                .store
                .events_since(since, limit.unwrap_or(DEFAULT_EVENT_LIMIT));
            RpcResponse::ok(EventsPayload { events })
        }
        RpcRequest::Failover { member } => failover(root, &member),
        RpcRequest::Restore => restore(root),
        RpcRequest::Recheck { member } => recheck(root, member).await,
        RpcRequest::Action { cmd, member } => action(root, cmd, member).await,
        RpcRequest::Setlog { level } => {
            let control = root.log_control.lock().unwrap();
            match control.as_ref() {
                Some(control) => match control.set_level(level) {
                    Ok(()) => RpcResponse::ok_empty(),
                    Err(e) => RpcResponse::err(format!("setlog failed: {e}")),
                },
                None => RpcResponse::err("log level control not wired"),
            }
        }
        RpcRequest::Config => RpcResponse::ok(&*root.config.load()),
        RpcRequest::Info => RpcResponse::ok(root.info_payload()),
    }
}

fn telemetry(
    root: &Arc<Autonomy>,
    member: Option<String>,
    since: Option<DateTime<Utc>>,
) -> RpcResponse {
    let since =
        since.unwrap_or_else(|| Utc::now() - Duration::minutes(DEFAULT_TELEMETRY_WINDOW_MIN));
    let samples: Vec<Sample> = match member {
        Some(member) => {
            if root.registry.get(&member).is_none() {
                return RpcResponse::err(format!("unknown member {member:?}"));
            }
            root.store.samples_since(&member, since)
        }
        None => {
            let mut all: Vec<Sample> = root
                .registry
                .list()
                .iter()
                .flat_map(|m| root.store.samples_since(&m.name, since))
                .collect();
            all.sort_by_key(|s| s.timestamp);
            all
        }
    };
    RpcResponse::ok(TelemetryPayload { samples })
}

/// Operator-requested switch. Honors dry-run; switching to the current
/// primary succeeds without touching the back-end.
fn failover(root: &Arc<Autonomy>, member: &str) -> RpcResponse {
    if root.registry.get(member).is_none() {
        return RpcResponse::err(format!("unknown member {member:?}"));
    }
    let now = Utc::now();
    let members = root.registry.list();
    let from = root
        .engine
        .lock()
        .unwrap()
        .current_primary()
        .map(String::from);

    match root
        .controller
        .apply_switch(from.as_deref(), member, &members, now)
    {
        Ok(Some(outcome)) => {
            root.engine.lock().unwrap().note_switch(member, now);
            root.store.add_event(
                Event::new(now, EventType::Failover, "manual").with_transition(
                    outcome.from.clone().unwrap_or_default(),
                    outcome.to.clone(),
                ),
            );
            scheduler::notify_metered_failover(root, &members, member, now);
            RpcResponse::ok(serde_json::json!({ "switched_to": outcome.to }))
        }
        Ok(None) => RpcResponse::ok(serde_json::json!({ "already_primary": member })),
        Err(e) => RpcResponse::err(e.to_string()),
    }
}

fn restore(root: &Arc<Autonomy>) -> RpcResponse {
    let members = root.registry.list();
    match root.controller.restore_user_weights(&members) {
        Ok(()) => {
            root.store
                .add_event(Event::new(Utc::now(), EventType::Restore, "manual"));
            RpcResponse::ok_empty()
        }
        Err(e) => RpcResponse::err(e.to_string()),
    }
}

/// Collect fresh metrics immediately, outside the tick cadence.
async fn recheck(root: &Arc<Autonomy>, member: Option<String>) -> RpcResponse {
    let config = root.config.load();
    let primary = root
        .engine
        .lock()
        .unwrap()
        .current_primary()
        .map(String::from);
    let targets = match member {
        Some(name) => match root.registry.get(&name) {
            Some(m) => vec![m],
            None => return RpcResponse::err(format!("unknown member {name:?}")),
        },
        None => root.registry.list(),
    };

    let mut checked = 0usize;
    for target in targets {
        let collector = root.collectors.build(&config, &target);
        let deadline = root.collectors.deadline(&config, &target);
        let metrics = collector.collect(&target, deadline).await;
        scheduler::ingest_sample(root, &target, metrics, primary.as_deref());
        checked += 1;
    }
    RpcResponse::ok(serde_json::json!({ "rechecked": checked }))
}

async fn action(root: &Arc<Autonomy>, cmd: ActionCmd, member: Option<String>) -> RpcResponse {
    match cmd {
        ActionCmd::Failover | ActionCmd::Promote => match member {
            Some(member) => failover(root, &member),
            None => RpcResponse::err("action requires a member"),
        },
        ActionCmd::Restore => restore(root),
        ActionCmd::Recheck => recheck(root, member).await,
        ActionCmd::RecheckMetered => {
            let hints = root.metered.lock().unwrap().hints();
            match root.applier.apply(&hints) {
                Ok(()) => RpcResponse::ok(serde_json::json!({ "mode": hints.mode })),
                Err(e) => RpcResponse::err(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::CollectorFactory;
    use crate::config::{Config, MemberConfig};
    use crate::controller::backend::{
        MockWeightedBackend, PolicyInterfaceState, RecordingRunner,
    };
    use crate::controller::{Backend, Controller};
    use crate::daemon::LogLevelControl;
    use crate::quota::StaticUsageProvider;
    use crate::registry::StaticDiscovery;
    use autonomy_common::models::{DetectMode, MemberClass};
    use autonomy_common::protocol::LogLevel;
    use std::sync::Mutex;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.members = vec![
            MemberConfig {
                name: "starlink".into(),
                iface: "wan".into(),
                class: MemberClass::Starlink,
                weight: 100,
                detect: DetectMode::Auto,
                prefer_roaming: false,
                metered: false,
                data_limit_mb: None,
            },
            MemberConfig {
                name: "cell".into(),
                iface: "wwan0".into(),
                class: MemberClass::Cellular,
                weight: 80,
                detect: DetectMode::Auto,
                prefer_roaming: false,
                metered: true,
                data_limit_mb: Some(10_240),
            },
        ];
        config
    }

    fn test_root() -> (Arc<Autonomy>, Arc<MockWeightedBackend>) {
        let backend = Arc::new(MockWeightedBackend::new());
        backend.set_status("wan", PolicyInterfaceState::Online);
        backend.set_status("wwan0", PolicyInterfaceState::Online);
        let config = test_config();
        let runner: Arc<RecordingRunner> = Arc::new(RecordingRunner::new());
        let controller = Controller::new(
            config.controller.clone(),
            Backend::Weighted(Box::new(backend.clone())),
            false,
        );
        let collectors = CollectorFactory::new(
            runner.clone(),
            Arc::new(StaticUsageProvider::new()),
            true, // simulate: no real probes in tests
        );
        let root = Autonomy::new(
            config,
            controller,
            collectors,
            Box::new(StaticDiscovery::up(&["wan", "wwan0"])),
            Arc::new(StaticUsageProvider::new()),
            runner,
        );
        root.refresh_members(Utc::now());
        (Arc::new(root), backend)
    }

    #[tokio::test]
    async fn status_reports_members_and_no_primary() {
        let (root, _) = test_root();
        let resp = handle(&root, RpcRequest::Status).await;
        assert!(resp.success);
        assert_eq!(resp.data["members"].as_array().unwrap().len(), 2);
        assert!(resp.data["primary"].is_null());
        assert_eq!(resp.data["metered_mode"], "off");
    }

    #[tokio::test]
    async fn failover_unknown_member_fails_structured() {
        let (root, _) = test_root();
        let resp = handle(
            &root,
            RpcRequest::Failover {
                member: "ghost".into(),
            },
        )
        .await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn failover_switches_and_records_event() {
        let (root, _) = test_root();
        let resp = handle(
            &root,
            RpcRequest::Failover {
                member: "cell".into(),
            },
        )
        .await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(
            root.engine.lock().unwrap().current_primary(),
            Some("cell")
        );
        let events = root.store.events_since(DateTime::<Utc>::MIN_UTC, 10);
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::Failover && e.to.as_deref() == Some("cell")));
    }

    #[tokio::test]
    async fn failover_to_current_primary_is_noop_success() {
        let (root, backend) = test_root();
        handle(
            &root,
            RpcRequest::Failover {
                member: "cell".into(),
            },
        )
        .await;
        let commits = backend.commit_count();
        let resp = handle(
            &root,
            RpcRequest::Failover {
                member: "cell".into(),
            },
        )
        .await;
        assert!(resp.success);
        assert_eq!(resp.data["already_primary"], "cell");
        assert_eq!(backend.commit_count(), commits, "no extra back-end writes");
    }

    #[tokio::test]
    async fn recheck_stores_fresh_samples() {
        let (root, _) = test_root();
        let resp = handle(&root, RpcRequest::Recheck { member: None }).await;
        assert!(resp.success);
        assert_eq!(resp.data["rechecked"], 2);
        assert!(root.store.latest("starlink").is_some());
        assert!(root.store.latest("cell").is_some());
    }

    #[tokio::test]
    async fn telemetry_filters_by_member() {
        let (root, _) = test_root();
        handle(&root, RpcRequest::Recheck { member: None }).await;
        let resp = handle(
            &root,
            RpcRequest::Telemetry {
                member: Some("cell".into()),
                since: Some(DateTime::<Utc>::MIN_UTC),
            },
        )
        .await;
        assert!(resp.success);
        let samples = resp.data["samples"].as_array().unwrap();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s["member"] == "cell"));
    }

    #[tokio::test]
    async fn action_promote_aliases_failover() {
        let (root, _) = test_root();
        let resp = handle(
            &root,
            RpcRequest::Action {
                cmd: ActionCmd::Promote,
                member: Some("starlink".into()),
            },
        )
        .await;
        assert!(resp.success);
        assert_eq!(
            root.engine.lock().unwrap().current_primary(),
            Some("starlink")
        );
    }

    #[tokio::test]
    async fn action_failover_without_member_fails() {
        let (root, _) = test_root();
        let resp = handle(
            &root,
            RpcRequest::Action {
                cmd: ActionCmd::Failover,
                member: None,
            },
        )
        .await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn setlog_without_control_fails() {
        let (root, _) = test_root();
        let resp = handle(
            &root,
            RpcRequest::Setlog {
                level: LogLevel::Debug,
            },
        )
        .await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn setlog_reaches_wired_control() {
        let (root, _) = test_root();
        struct Recorder(Arc<Mutex<Vec<LogLevel>>>);
        impl LogLevelControl for Recorder {
            fn set_level(&self, level: LogLevel) -> Result<(), String> {
                self.0.lock().unwrap().push(level);
                Ok(())
            }
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        *root.log_control.lock().unwrap() = Some(Box::new(Recorder(seen.clone())));

        let resp = handle(
            &root,
            RpcRequest::Setlog {
                level: LogLevel::Warn,
            },
        )
        .await;
        assert!(resp.success);
        assert_eq!(seen.lock().unwrap().as_slice(), [LogLevel::Warn]);
    }

    #[tokio::test]
    async fn config_round_trips_as_json() {
        let (root, _) = test_root();
        let resp = handle(&root, RpcRequest::Config).await;
        assert!(resp.success);
        assert_eq!(resp.data["daemon"]["poll_interval_ms"], 1500);
        assert_eq!(resp.data["controller"]["mode"], "hybrid");
    }

    #[tokio::test]
    async fn info_reports_version_and_counters() {
        let (root, _) = test_root();
        let resp = handle(&root, RpcRequest::Info).await;
        assert!(resp.success);
        assert_eq!(resp.data["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(resp.data["tick_count"], 0);
    }
}
