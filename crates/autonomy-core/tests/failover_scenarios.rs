//! End-to-end failover scenarios: store → scoring → decision →
//! controller wired together against an in-memory policy back-end, with
//! synthetic time stepped one second per tick.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use autonomy_common::models::{
    CellularMetrics, DataLimit, DetectMode, Event, EventType, LimitPeriod, Member, MemberClass,
    Metrics, MeteredMode, StarlinkMetrics,
};
use autonomy_core::config::{ControllerConfig, DecisionConfig, MeteredConfig, PredictorConfig, ScoringConfig};
use autonomy_core::controller::backend::{MockWeightedBackend, PolicyInterfaceState};
use autonomy_core::controller::{AdjustmentKind, Backend, Controller};
use autonomy_core::decision::{Decision, DecisionEngine, MemberSnapshot, SwitchReason};
use autonomy_core::metered::MeteredManager;
use autonomy_core::predict::{ObstructionPredictor, ObstructionSample};
use autonomy_core::score;
use autonomy_core::telemetry::TelemetryStore;

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn member(name: &str, iface: &str, class: MemberClass, weight: u8) -> Member {
    Member {
        name: name.into(),
        iface: iface.into(),
        class,
        weight,
        eligible: true,
        detect: DetectMode::Auto,
        prefer_roaming: false,
        metered: class == MemberClass::Cellular,
        created_at: start_time(),
        last_seen: start_time(),
    }
}

/// Healthy Starlink sample: latency 40 ms, clean sky.
fn starlink_metrics(at: DateTime<Utc>, latency: f64, loss: f64, obstruction_pct: f64) -> Metrics {
    let mut m = Metrics::empty(at);
    m.latency_ms = Some(latency);
    m.loss_pct = Some(loss);
    m.jitter_ms = Some(5.0);
    m.starlink = Some(StarlinkMetrics {
        obstruction_pct: Some(obstruction_pct),
        obstruction_valid_s: Some(3600.0),
        patches_valid: Some(8000),
        snr_db: Some(9.0),
        ..Default::default()
    });
    m
}

/// Starlink sample tuned by jitter so the instant score lands where the
/// scenario needs it without tripping the loss/latency fail thresholds.
fn starlink_with_jitter(at: DateTime<Utc>, jitter: f64) -> Metrics {
    let mut m = starlink_metrics(at, 40.0, 0.0, 0.0);
    m.jitter_ms = Some(jitter);
    m
}

/// Cellular sample: 120 ms, 1% loss, RSRP −95 dBm → instant ≈ 84.
fn cellular_metrics(at: DateTime<Utc>) -> Metrics {
    let mut m = Metrics::empty(at);
    m.latency_ms = Some(120.0);
    m.loss_pct = Some(1.0);
    m.jitter_ms = Some(5.0);
    m.cellular = Some(CellularMetrics {
        rsrp_dbm: Some(-95.0),
        ..Default::default()
    });
    m
}

struct Harness {
    store: TelemetryStore,
    engine: DecisionEngine,
    controller: Controller,
    backend: Arc<MockWeightedBackend>,
    members: Vec<Member>,
    now: DateTime<Utc>,
}

impl Harness {
    fn new(decision: DecisionConfig, members: Vec<Member>) -> Self {
        let telemetry = autonomy_core::config::TelemetryConfig {
            retention_hours: 1,
            samples_per_hour: 3600,
            max_events: 100,
        };
        let backend = Arc::new(MockWeightedBackend::new());
        for m in &members {
            backend.set_status(&m.iface, PolicyInterfaceState::Online);
        }
        Harness {
            store: TelemetryStore::new(&telemetry, ScoringConfig::default(), 64),
            engine: DecisionEngine::new(decision, std::time::Duration::from_secs(5)),
            controller: Controller::new(
                ControllerConfig::default(),
                Backend::Weighted(Box::new(backend.clone())),
                false,
            ),
            backend,
            members,
            now: start_time(),
        }
    }

    /// Ingest one metrics record per member, run the decision pass, and
    /// apply any switch the way the scheduler does. Advances time 1 s.
    fn tick(&mut self, feeds: Vec<(&str, Metrics)>, predictive: bool) -> Decision {
        for (name, metrics) in feeds {
            let member = self
                .members
                .iter()
                .find(|m| m.name == name)
                .expect("member exists")
                .clone();
            let instant = score::instant_score(member.class, &metrics);
            self.store.add_sample(&member, metrics, instant);
        }

        let snapshots: Vec<MemberSnapshot> = self
            .members
            .iter()
            .map(|member| {
                let latest = self.store.latest(&member.name);
                MemberSnapshot {
                    member: member.clone(),
                    score: latest.as_ref().map(|s| s.score),
                    last_sample_at: latest.as_ref().map(|s| s.timestamp),
                    latest_metrics: latest.map(|s| s.metrics),
                }
            })
            .collect();

        if predictive {
            self.store.add_event(Event::new(
                self.now,
                EventType::PredictiveTrigger,
                "obstruction trend",
            ));
        }
        let decision = self.engine.evaluate(self.now, &snapshots, predictive);
        if let Decision::Switch { to, reason } = &decision {
            let from = self.engine.current_primary().map(String::from);
            let outcome = self
                .controller
                .apply_switch(from.as_deref(), to, &self.members, self.now)
                .expect("switch applies");
            if outcome.is_some() {
                self.engine.note_switch(to, self.now);
                self.store.add_event(
                    Event::new(self.now, EventType::Switch, reason.as_str())
                        .with_transition(from.unwrap_or_default(), to.clone()),
                );
            }
        }
        self.now += Duration::seconds(1);
        decision
    }

    fn final_score(&self, name: &str) -> f64 {
        self.store.latest(name).map(|s| s.score.final_score).unwrap_or(0.0)
    }

    fn events(&self) -> Vec<Event> {
        self.store.events_since(DateTime::<Utc>::MIN_UTC, 100)
    }
}

fn scenario_decision_config() -> DecisionConfig {
    DecisionConfig {
        switch_margin: 10.0,
        cooldown_s: 20,
        min_uptime_s: 5,
        fail_min_duration_s: 10,
        restore_min_duration_s: 5,
        // Low enough that the fail duration latch, not EWMA collapse,
        // decides when the burst counts as failure.
        fail_threshold: 10.0,
        ..Default::default()
    }
}

fn two_member_harness() -> Harness {
    Harness::new(
        scenario_decision_config(),
        vec![
            member("a", "wan_a", MemberClass::Starlink, 80),
            member("b", "wan_b", MemberClass::Cellular, 60),
        ],
    )
}

/// Warm both members until scores are steady and `a` is primary.
fn warmed_harness() -> Harness {
    let mut h = two_member_harness();
    for _ in 0..30 {
        let now = h.now;
        h.tick(
            vec![
                ("a", starlink_metrics(now, 40.0, 0.0, 0.0)),
                ("b", cellular_metrics(now)),
            ],
            false,
        );
    }
    assert_eq!(h.engine.current_primary(), Some("a"));
    h
}

// ─── Scenario 1: Score-Driven Failover ──────────────────────────────────

#[test]
fn score_driven_failover() {
    let mut h = warmed_harness();
    assert!(h.final_score("a") > 95.0, "a ≈ 100, got {}", h.final_score("a"));
    let b = h.final_score("b");
    assert!((b - 84.0).abs() < 3.0, "b ≈ 84, got {b}");

    // Burst on a: latency 900 ms, loss 8%, obstruction 12%
    let burst_start = h.now;
    let mut switched_at: Option<DateTime<Utc>> = None;
    for _ in 0..15 {
        let now = h.now;
        let d = h.tick(
            vec![
                ("a", starlink_metrics(now, 900.0, 8.0, 12.0)),
                ("b", cellular_metrics(now)),
            ],
            false,
        );
        if let Decision::Switch { to, .. } = &d {
            assert_eq!(to, "b");
            switched_at = Some(now);
            break;
        }
    }

    let switched_at = switched_at.expect("b should become primary");
    let elapsed = (switched_at - burst_start).num_seconds();
    assert!(
        (10..=13).contains(&elapsed),
        "switch after the 10 s fail window, got {elapsed} s"
    );
    assert_eq!(h.engine.current_primary(), Some("b"));

    let events = h.events();
    let switch = events
        .iter()
        .find(|e| e.event_type == EventType::Switch)
        .expect("switch event recorded");
    assert_eq!(switch.from.as_deref(), Some("a"));
    assert_eq!(switch.to.as_deref(), Some("b"));
}

// ─── Scenario 2: Hysteresis Prevents Flap ───────────────────────────────

#[test]
fn hysteresis_prevents_flap() {
    let mut h = warmed_harness();

    // Fail a over to b
    for _ in 0..15 {
        let now = h.now;
        h.tick(
            vec![
                ("a", starlink_metrics(now, 900.0, 8.0, 12.0)),
                ("b", cellular_metrics(now)),
            ],
            false,
        );
    }
    assert_eq!(h.engine.current_primary(), Some("b"));

    // a recovers to a score below b + margin: high jitter keeps the
    // instant at ≈ 88 while loss/latency are clean.
    for _ in 0..40 {
        let now = h.now;
        let d = h.tick(
            vec![
                ("a", starlink_with_jitter(now, 44.0)),
                ("b", cellular_metrics(now)),
            ],
            false,
        );
        assert_eq!(d, Decision::NoChange, "no switch-back below the margin");
    }
    assert_eq!(h.engine.current_primary(), Some("b"));
    // a's final has converged just under b + 10
    assert!(h.final_score("a") < h.final_score("b") + 10.0);

    // a strengthens to ≈ 96; once steady past min uptime, switch back
    let mut switched_back = false;
    for _ in 0..40 {
        let now = h.now;
        let d = h.tick(
            vec![
                ("a", starlink_with_jitter(now, 28.0)),
                ("b", cellular_metrics(now)),
            ],
            false,
        );
        if let Decision::Switch { to, reason } = &d {
            assert_eq!(to, "a");
            assert_eq!(*reason, SwitchReason::ScoreMargin);
            switched_back = true;
            break;
        }
    }
    assert!(switched_back, "a should reclaim primary once clearly better");
}

// ─── Scenario 3: Hybrid Minimal Adjustment ──────────────────────────────

#[test]
fn hybrid_minimal_adjustment() {
    let h = {
        let mut h = Harness::new(
            scenario_decision_config(),
            vec![
                member("a", "wan_a", MemberClass::Starlink, 80),
                member("b", "wan_b", MemberClass::Cellular, 60),
            ],
        );
        h.engine.note_switch("a", h.now);
        h
    };

    let now = h.now;
    let outcome = h
        .controller
        .apply_switch(Some("a"), "b", &h.members, now)
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome.action,
        autonomy_core::controller::AppliedAction::MinimalAdjustment
    );

    // b raised to 70, not stomped to 100; a untouched
    assert_eq!(h.backend.weight_of("b"), Some(70));
    assert_eq!(h.backend.weight_of("a"), None);

    let adjustments = h.controller.adjustments();
    assert_eq!(adjustments.len(), 1);
    assert_eq!(adjustments[0].member, "b");
    assert_eq!(adjustments[0].original_weight, 60);
    assert_eq!(adjustments[0].adjusted_weight, 70);
    assert_eq!(
        adjustments[0].expires_at - adjustments[0].created_at,
        Duration::minutes(5)
    );

    // Five minutes later the sweep restores the user weight
    let restored = h
        .controller
        .sweep(&h.members, now + Duration::minutes(5) + Duration::seconds(1))
        .unwrap();
    assert_eq!(restored, vec!["b".to_string()]);
    assert_eq!(h.backend.weight_of("b"), Some(60));
}

// ─── Scenario 4: Emergency Override ─────────────────────────────────────

#[test]
fn emergency_override() {
    let h = Harness::new(
        scenario_decision_config(),
        vec![
            member("a", "wan_a", MemberClass::Starlink, 80),
            member("b", "wan_b", MemberClass::Cellular, 40),
            member("c", "wan_c", MemberClass::Wifi, 70),
        ],
    );
    h.backend.set_status("wan_a", PolicyInterfaceState::Offline);
    h.backend.set_status("wan_c", PolicyInterfaceState::Offline);

    let now = h.now;
    let outcome = h
        .controller
        .apply_switch(Some("a"), "b", &h.members, now)
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome.action,
        autonomy_core::controller::AppliedAction::EmergencyOverride
    );
    assert_eq!(h.backend.weight_of("b"), Some(100));
    assert_eq!(h.backend.weight_of("a"), Some(10));
    assert_eq!(h.backend.weight_of("c"), Some(10));

    let adjustments = h.controller.adjustments();
    assert_eq!(adjustments[0].kind, AdjustmentKind::Emergency);
    assert_eq!(
        adjustments[0].expires_at - adjustments[0].created_at,
        Duration::minutes(15)
    );

    // After 15 minutes everything is restored
    let restored = h
        .controller
        .sweep(&h.members, now + Duration::minutes(15) + Duration::seconds(1))
        .unwrap();
    assert_eq!(restored.len(), 3);
    assert_eq!(h.backend.weight_of("a"), Some(80));
    assert_eq!(h.backend.weight_of("b"), Some(40));
    assert_eq!(h.backend.weight_of("c"), Some(70));
}

// ─── Scenario 5: Predictive Failover ────────────────────────────────────

#[test]
fn predictive_failover_bypasses_cooldown() {
    let mut h = warmed_harness();

    // Obstruction rising 3%/sample, SNR falling 0.5 dB/sample
    let mut predictor = ObstructionPredictor::new(PredictorConfig::default(), 1.0);
    for i in 0..20 {
        predictor.record(
            ObstructionSample {
                timestamp: h.now + Duration::seconds(i),
                obstruction: 0.01 + i as f64 * 0.03,
                snr_db: 12.0 - i as f64 * 0.5,
                valid_s: 3600.0,
                patches_valid: 8000,
            },
            None,
        );
    }
    let analysis = predictor.analyze_trends(None).unwrap();
    assert!(analysis.confidence >= 0.7, "confidence {}", analysis.confidence);
    assert!(analysis.obstruction_acceleration > 0.02);
    assert!(predictor.should_trigger(&analysis));

    // Re-arm the dwell timer so the switch below lands inside the
    // cooldown window; the predictive trigger must bypass it.
    let recent = h.now - Duration::seconds(5);
    h.engine.note_switch("a", recent);
    let now = h.now;
    let d = h.tick(
        vec![
            ("a", starlink_metrics(now, 40.0, 0.0, 10.0)),
            ("b", cellular_metrics(now)),
        ],
        true,
    );
    assert_eq!(
        d,
        Decision::Switch {
            to: "b".into(),
            reason: SwitchReason::Predictive
        }
    );

    // predictive_trigger precedes switch in the event log
    let events = h.events();
    let trigger_idx = events
        .iter()
        .position(|e| e.event_type == EventType::PredictiveTrigger)
        .expect("predictive trigger event");
    let switch_idx = events
        .iter()
        .position(|e| e.event_type == EventType::Switch && e.to.as_deref() == Some("b"))
        .expect("switch event");
    assert!(trigger_idx < switch_idx);
}

// ─── Scenario 6: Metered Mode Transitions ───────────────────────────────

#[test]
fn metered_mode_transitions() {
    let mut manager = MeteredManager::new(MeteredConfig {
        warn_percent: 80.0,
        crit_percent: 95.0,
        hysteresis_percent: 5.0,
        stability_delay_s: 300,
        ..Default::default()
    });
    let cell = member("cell", "wwan0", MemberClass::Cellular, 80);
    let limit = DataLimit {
        enabled: true,
        period: LimitPeriod::Month,
        limit_bytes: 10_000_000_000,
        used_bytes: 7_500_000_000,
        reset_time: None,
    };
    let t0 = start_time();

    manager.on_failover(&cell, None, Some(&limit), t0);
    manager.tick(t0 + Duration::seconds(301)).unwrap();
    assert_eq!(manager.mode(), MeteredMode::Restricted);

    // 81% → NearCap with the approaching-limit flag byte
    let hints = manager.on_usage(81.0, t0 + Duration::seconds(310)).unwrap();
    assert_eq!(hints.mode, MeteredMode::NearCap);
    assert_eq!(hints.ies[0].payload[4], 0x08);

    // 96% → OverCap with the over-limit flag byte
    let hints = manager.on_usage(96.0, t0 + Duration::seconds(320)).unwrap();
    assert_eq!(hints.mode, MeteredMode::OverCap);
    assert_eq!(hints.ies[0].payload[4], 0x01);

    // 92% sits inside the hysteresis band: still OverCap
    assert!(manager.on_usage(92.0, t0 + Duration::seconds(330)).is_none());
    assert_eq!(manager.mode(), MeteredMode::OverCap);

    // 74% falls below warn − h: down to Restricted
    let hints = manager.on_usage(74.0, t0 + Duration::seconds(340)).unwrap();
    assert_eq!(hints.mode, MeteredMode::Restricted);

    // Switch to an unlimited uplink → Off after the settle delay
    let starlink = member("starlink", "wan", MemberClass::Starlink, 100);
    manager.on_failover(&starlink, None, None, t0 + Duration::seconds(350));
    let hints = manager.tick(t0 + Duration::seconds(651)).unwrap();
    assert_eq!(hints.mode, MeteredMode::Off);
    assert!(hints.ies.is_empty());
}
