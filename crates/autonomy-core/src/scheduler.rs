//! # Tick Scheduler
//!
//! The cooperative loop driving the whole pipeline: collectors fan out
//! concurrently (one in flight per member, bounded by class deadlines),
//! results are scored and stored, then the serial decide → apply → sweep
//! stage runs. If a tick overruns the interval the next firing is
//! skipped, never queued; a counter records the overruns.
//!
//! Shutdown is cooperative: the in-progress tick (including in-flight
//! collectors, bounded by their deadlines) completes before the loop
//! exits.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use autonomy_common::models::{Event, EventType, Member, MemberClass, Metrics, WirelessMode};

use crate::daemon::Autonomy;
use crate::decision::Decision;
use crate::predict::patterns::GeoContext;
use crate::predict::ObstructionSample;
use crate::score;

pub async fn run(root: Arc<Autonomy>, mut shutdown: watch::Receiver<bool>) {
    let mut config_gen = root.config.subscribe();
    let mut current_interval = root.config.load().poll_interval();
    let mut interval = tokio::time::interval(current_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_ms = current_interval.as_millis() as u64, "scheduler started");
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                // A dropped sender means the daemon is going away too.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if config_gen.has_changed().unwrap_or(false) {
            let _ = config_gen.borrow_and_update();
            root.apply_config();
            let next_interval = root.config.load().poll_interval();
            if next_interval != current_interval {
                current_interval = next_interval;
                interval = tokio::time::interval(current_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
        }

        let started = Instant::now();
        tick(&root).await;
        root.tick_count.fetch_add(1, Ordering::Relaxed);

        let elapsed = started.elapsed();
        if elapsed > current_interval {
            let skipped =
                (elapsed.as_millis() / current_interval.as_millis().max(1)).max(1) as u64;
            root.skipped_ticks.fetch_add(skipped, Ordering::Relaxed);
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                skipped,
                "tick overran the poll interval"
            );
        }
    }
    tracing::info!("scheduler stopped");
}

/// One full pass: refresh → collect → score/store → decide → apply →
/// sweep → metered settle → memory cap.
pub async fn tick(root: &Arc<Autonomy>) {
    let now = Utc::now();
    let config = root.config.load();

    root.refresh_members(now);
    let members = root.registry.list();

    // ── Fan out collectors, at most one per member ──────────────
    let mut joins: JoinSet<(Member, Metrics)> = JoinSet::new();
    for member in members
        .iter()
        .filter(|m| m.detect != autonomy_common::models::DetectMode::Disable)
        .cloned()
    {
        let collector = root.collectors.build(&config, &member);
        let deadline = root.collectors.deadline(&config, &member);
        joins.spawn(async move {
            let metrics = collector.collect(&member, deadline).await;
            (member, metrics)
        });
    }

    let primary_before = root.engine.lock().unwrap().current_primary().map(String::from);
    while let Some(joined) = joins.join_next().await {
        let Ok((member, metrics)) = joined else {
            continue;
        };
        ingest_sample(root, &member, metrics, primary_before.as_deref());
    }

    // ── Serial decision + controller stage ──────────────────────
    let snapshots = root.member_snapshots();
    let members = root.registry.list();

    let predictive = predictive_trigger(root, primary_before.as_deref(), now);
    if predictive {
        root.store.add_event(
            Event::new(now, EventType::PredictiveTrigger, "obstruction trend")
                .with_member(primary_before.clone().unwrap_or_default()),
        );
    }

    let decision = root
        .engine
        .lock()
        .unwrap()
        .evaluate(now, &snapshots, predictive);

    if let Decision::Switch { to, reason } = decision {
        let from = primary_before.clone();
        match root
            .controller
            .apply_switch(from.as_deref(), &to, &members, now)
        {
            Ok(Some(outcome)) => {
                root.engine.lock().unwrap().note_switch(&to, now);
                root.store.add_event(
                    Event::new(now, EventType::Switch, reason.as_str()).with_transition(
                        outcome.from.clone().unwrap_or_default(),
                        outcome.to.clone(),
                    ),
                );
                notify_metered_failover(root, &members, &to, now);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(to = %to, reason = ?reason, error = %e, "switch failed");
            }
        }
    }

    // ── Adjustment sweep, at least once per sweep interval ──────
    let sweep_due = {
        let mut last = root.last_sweep.lock().unwrap();
        let interval = ChronoDuration::seconds(config.controller.sweep_interval_s as i64);
        let due = last.map(|at| now - at >= interval).unwrap_or(true);
        if due {
            *last = Some(now);
        }
        due
    };
    if sweep_due {
        match root.controller.sweep(&members, now) {
            Ok(restored) if !restored.is_empty() => {
                for member in restored {
                    root.store.add_event(
                        Event::new(now, EventType::Restore, "adjustment expired")
                            .with_member(member),
                    );
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "adjustment sweep failed"),
        }
    }

    // ── Metered settle + memory cap ─────────────────────────────
    let hints = root.metered.lock().unwrap().tick(now);
    if let Some(hints) = hints {
        root.store.add_event(
            Event::new(now, EventType::ModeChange, format!("{:?}", hints.mode)),
        );
        if let Err(e) = root.applier.apply(&hints) {
            tracing::warn!(error = %e, "metered hint application failed");
        }
    }
    root.store.enforce_memory_cap();
}

/// Score and store one collector result, feeding the predictor and the
/// metered manager along the way.
pub(crate) fn ingest_sample(
    root: &Arc<Autonomy>,
    member: &Member,
    metrics: Metrics,
    current_primary: Option<&str>,
) {
    let instant = score::instant_score(member.class, &metrics);

    if member.class == MemberClass::Starlink {
        if let Some(sl) = metrics.starlink.as_ref() {
            let sample = ObstructionSample {
                timestamp: metrics.timestamp,
                obstruction: sl.obstruction_pct.unwrap_or(0.0) / 100.0,
                snr_db: sl.snr_db.unwrap_or(0.0),
                valid_s: sl.obstruction_valid_s.unwrap_or(0.0),
                patches_valid: sl.patches_valid.unwrap_or(0),
            };
            // GPS acquisition is an external collaborator; without it the
            // learner works from time-of-day alone.
            let context = GeoContext {
                location: None,
                time: metrics.timestamp,
            };
            root.predictor.lock().unwrap().record(sample, Some(&context));
        }
    }

    if current_primary == Some(member.name.as_str()) {
        if let Some(usage) = metrics.usage_percent {
            let hints = root
                .metered
                .lock()
                .unwrap()
                .on_usage(usage, metrics.timestamp);
            if let Some(hints) = hints {
                root.store.add_event(Event::new(
                    metrics.timestamp,
                    EventType::ModeChange,
                    format!("{:?}", hints.mode),
                ));
                if let Err(e) = root.applier.apply(&hints) {
                    tracing::warn!(error = %e, "metered hint application failed");
                }
            }
        }
    }

    let scored = root.store.add_sample(member, metrics, instant);
    tracing::debug!(
        member = %member.name,
        instant = scored.instant,
        ewma = scored.ewma,
        final_score = scored.final_score,
        "sample stored"
    );
}

/// Ask the predictor about the current primary when it is a Starlink
/// member. Errors (insufficient data) mean "no trigger".
fn predictive_trigger(root: &Arc<Autonomy>, primary: Option<&str>, now: chrono::DateTime<Utc>) -> bool {
    let config = root.config.load();
    if !config.predictor.enabled {
        return false;
    }
    let Some(primary) = primary else {
        return false;
    };
    let Some(member) = root.registry.get(primary) else {
        return false;
    };
    if member.class != MemberClass::Starlink {
        return false;
    }
    let context = GeoContext {
        location: None,
        time: now,
    };
    let predictor = root.predictor.lock().unwrap();
    match predictor.analyze_trends(Some(&context)) {
        Ok(analysis) => {
            let trigger = predictor.should_trigger(&analysis);
            if trigger {
                tracing::warn!(
                    confidence = analysis.confidence,
                    acceleration = analysis.obstruction_acceleration,
                    predicted_obstruction = analysis.predicted_obstruction,
                    ttf_s = analysis.time_to_failure_s,
                    "predictive failover trigger"
                );
            }
            trigger
        }
        Err(_) => false,
    }
}

/// Tell the metered manager about a committed switch, with the wireless
/// role and quota state of the new primary.
pub fn notify_metered_failover(
    root: &Arc<Autonomy>,
    members: &[Member],
    to: &str,
    now: chrono::DateTime<Utc>,
) {
    let Some(target) = members.iter().find(|m| m.name == to) else {
        return;
    };
    let wireless_mode: Option<WirelessMode> = root
        .store
        .latest(&target.name)
        .and_then(|s| s.metrics.wifi)
        .and_then(|w| w.mode);
    let limit = root.usage.data_limit(&target.iface).ok().flatten();
    root.metered
        .lock()
        .unwrap()
        .on_failover(target, wireless_mode, limit.as_ref(), now);
}
