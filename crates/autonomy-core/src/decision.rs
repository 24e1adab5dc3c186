//! # Decision Engine
//!
//! Turns the per-tick score snapshot into "keep the current primary" or
//! "switch to member X". Switching is deliberately sticky: a contender
//! must beat the primary by a margin, survive a dwell window after the
//! last switch, and hold a healthy score for a minimum uptime, unless
//! the primary itself has failed, lost eligibility, or tripped the
//! predictive trigger, which bypasses the dwell.
//!
//! The engine never fails: collector errors arrive as samples with absent
//! fields and become score penalties; a member with no samples at all
//! goes stale and drops out of the ranking.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use autonomy_common::models::{Member, MemberState, Metrics, Score};

use crate::config::DecisionConfig;

/// Per-member view the scheduler hands the engine each tick.
#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub member: Member,
    pub score: Option<Score>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub latest_metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// No primary was set; promoting the best candidate.
    NoPrimary,
    /// Contender beat the primary by the switch margin.
    ScoreMargin,
    /// Primary tripped the fail thresholds.
    PrimaryFailing,
    /// Primary lost eligibility or went stale.
    PrimaryIneligible,
    /// Obstruction predictor fired for the primary.
    Predictive,
    /// Operator-requested failover.
    Manual,
}

impl SwitchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SwitchReason::NoPrimary => "no_primary",
            SwitchReason::ScoreMargin => "score_margin",
            SwitchReason::PrimaryFailing => "primary_failing",
            SwitchReason::PrimaryIneligible => "primary_ineligible",
            SwitchReason::Predictive => "predictive",
            SwitchReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoChange,
    Switch { to: String, reason: SwitchReason },
}

#[derive(Debug, Default)]
struct HealthTrack {
    /// Metrics at/above the fail thresholds continuously since.
    bad_since: Option<DateTime<Utc>>,
    /// Metrics below the restore thresholds continuously since.
    good_since: Option<DateTime<Utc>>,
    /// Latched once the fail condition holds for `fail_min_duration_s`.
    failing: bool,
    /// Final score at/above `restore_threshold` continuously since.
    above_restore_since: Option<DateTime<Utc>>,
    state: MemberState,
}

pub struct DecisionEngine {
    cfg: DecisionConfig,
    staleness: Duration,
    health: HashMap<String, HealthTrack>,
    current_primary: Option<String>,
    last_switch_at: Option<DateTime<Utc>>,
}

impl DecisionEngine {
    pub fn new(cfg: DecisionConfig, staleness: std::time::Duration) -> Self {
        DecisionEngine {
            cfg,
            staleness: Duration::from_std(staleness).unwrap_or(Duration::seconds(5)),
            health: HashMap::new(),
            current_primary: None,
            last_switch_at: None,
        }
    }

    /// Swap in reloaded tunables; member health tracking carries over.
    pub fn set_config(&mut self, cfg: DecisionConfig, staleness: std::time::Duration) {
        self.cfg = cfg;
        self.staleness = Duration::from_std(staleness).unwrap_or(Duration::seconds(5));
    }

    pub fn current_primary(&self) -> Option<&str> {
        self.current_primary.as_deref()
    }

    pub fn last_switch_at(&self) -> Option<DateTime<Utc>> {
        self.last_switch_at
    }

    /// Decision-engine state for one member, for the RPC status surface.
    pub fn member_state(&self, name: &str) -> MemberState {
        self.health
            .get(name)
            .map(|h| h.state)
            .unwrap_or(MemberState::Backup)
    }

    /// Record a committed switch. `last_switch_at` is monotonically
    /// non-decreasing.
    pub fn note_switch(&mut self, to: &str, now: DateTime<Utc>) {
        self.current_primary = Some(to.to_string());
        self.last_switch_at = Some(match self.last_switch_at {
            Some(prev) if prev > now => prev,
            _ => now,
        });
    }

    /// Forget the primary (member removed from the registry).
    pub fn clear_primary(&mut self) {
        self.current_primary = None;
    }

    /// One evaluation pass over the tick snapshot. `predictive_trigger`
    /// is the obstruction predictor's verdict for the current primary and
    /// is treated as an immediate eligibility drop.
    pub fn evaluate(
        &mut self,
        now: DateTime<Utc>,
        snapshot: &[MemberSnapshot],
        predictive_trigger: bool,
    ) -> Decision {
        self.update_health(now, snapshot);
        self.drop_vanished(snapshot);

        let primary = self.current_primary.clone();
        let primary_snap = primary
            .as_deref()
            .and_then(|p| snapshot.iter().find(|s| s.member.name == p));

        // Ranked eligible candidates, best final score first.
        let mut candidates: Vec<&MemberSnapshot> = snapshot
            .iter()
            .filter(|s| self.is_candidate(now, s))
            .collect();
        candidates.sort_by(|a, b| {
            let fa = a.score.map(|s| s.final_score).unwrap_or(0.0);
            let fb = b.score.map(|s| s.final_score).unwrap_or(0.0);
            fb.partial_cmp(&fa).unwrap_or(std::cmp::Ordering::Equal)
        });

        // No primary yet: promote the best candidate outright.
        let Some(primary_name) = primary else {
            return match candidates.first() {
                Some(best) => Decision::Switch {
                    to: best.member.name.clone(),
                    reason: SwitchReason::NoPrimary,
                },
                None => Decision::NoChange,
            };
        };

        let primary_unusable = self.primary_unusable(now, primary_snap);
        let primary_failing = self
            .health
            .get(&primary_name)
            .map(|h| h.failing)
            .unwrap_or(false);
        let primary_score = primary_snap
            .and_then(|s| s.score)
            .map(|s| s.final_score)
            .unwrap_or(0.0);
        let primary_below_fail = primary_score < self.cfg.fail_threshold;

        let emergency = primary_unusable || primary_failing || primary_below_fail
            || predictive_trigger;

        let contender = candidates
            .iter()
            .find(|s| s.member.name != primary_name)
            .copied();

        if emergency {
            let reason = if predictive_trigger {
                SwitchReason::Predictive
            } else if primary_unusable {
                SwitchReason::PrimaryIneligible
            } else {
                SwitchReason::PrimaryFailing
            };
            return match contender {
                // Margin and dwell are bypassed; minimum uptime still holds.
                Some(best) if self.held_min_uptime(now, &best.member.name) => Decision::Switch {
                    to: best.member.name.clone(),
                    reason,
                },
                _ => Decision::NoChange,
            };
        }

        let Some(best) = contender else {
            return Decision::NoChange;
        };
        let best_score = best.score.map(|s| s.final_score).unwrap_or(0.0);

        // Hysteresis: marginal ties do not switch.
        if best_score < primary_score + self.cfg.switch_margin {
            return Decision::NoChange;
        }
        // Dwell.
        if let Some(last) = self.last_switch_at {
            if now - last < Duration::seconds(self.cfg.cooldown_s as i64) {
                return Decision::NoChange;
            }
        }
        // Minimum uptime for the contender.
        if !self.held_min_uptime(now, &best.member.name) {
            return Decision::NoChange;
        }

        Decision::Switch {
            to: best.member.name.clone(),
            reason: SwitchReason::ScoreMargin,
        }
    }

    // ─── Internal ───────────────────────────────────────────────────────

    fn is_stale(&self, now: DateTime<Utc>, snap: &MemberSnapshot) -> bool {
        match snap.last_sample_at {
            Some(at) => now - at > self.staleness,
            None => true,
        }
    }

    fn is_candidate(&self, now: DateTime<Utc>, snap: &MemberSnapshot) -> bool {
        if !snap.member.is_selectable() || self.is_stale(now, snap) || snap.score.is_none() {
            return false;
        }
        !self
            .health
            .get(&snap.member.name)
            .map(|h| h.failing)
            .unwrap_or(false)
    }

    fn primary_unusable(&self, now: DateTime<Utc>, snap: Option<&MemberSnapshot>) -> bool {
        match snap {
            Some(s) => !s.member.is_selectable() || self.is_stale(now, s),
            None => true,
        }
    }

    fn held_min_uptime(&self, now: DateTime<Utc>, name: &str) -> bool {
        let min_uptime = Duration::seconds(self.cfg.min_uptime_s as i64);
        self.health
            .get(name)
            .and_then(|h| h.above_restore_since)
            .map(|since| now - since >= min_uptime)
            .unwrap_or(false)
    }

    fn update_health(&mut self, now: DateTime<Utc>, snapshot: &[MemberSnapshot]) {
        for snap in snapshot {
            let name = snap.member.name.clone();
            let stale = self.is_stale(now, snap);
            let track = self.health.entry(name).or_default();

            if let Some(metrics) = snap.latest_metrics.as_ref() {
                let bad = Self::metrics_failing(metrics, &self.cfg);
                let good = Self::metrics_restored(metrics, &self.cfg);

                if bad {
                    track.good_since = None;
                    let since = *track.bad_since.get_or_insert(now);
                    if now - since
                        >= Duration::seconds(self.cfg.fail_min_duration_s as i64)
                    {
                        if !track.failing {
                            tracing::warn!(member = %snap.member.name, "member is failing");
                        }
                        track.failing = true;
                    }
                } else if good {
                    track.bad_since = None;
                    let since = *track.good_since.get_or_insert(now);
                    if track.failing
                        && now - since
                            >= Duration::seconds(self.cfg.restore_min_duration_s as i64)
                    {
                        tracing::info!(member = %snap.member.name, "member restored");
                        track.failing = false;
                    }
                } else {
                    // Between the fail and restore bands: progress toward
                    // neither transition.
                    track.bad_since = None;
                    track.good_since = None;
                }
            }

            let above = snap
                .score
                .map(|s| s.final_score >= self.cfg.restore_threshold)
                .unwrap_or(false);
            if above {
                track.above_restore_since.get_or_insert(now);
            } else {
                track.above_restore_since = None;
            }

            track.state = if !snap.member.is_selectable() || stale || track.failing {
                MemberState::Disabled
            } else if self.current_primary.as_deref() == Some(snap.member.name.as_str()) {
                MemberState::Active
            } else if track
                .above_restore_since
                .map(|since| now - since < Duration::seconds(self.cfg.min_uptime_s as i64))
                .unwrap_or(true)
            {
                MemberState::Probation
            } else {
                MemberState::Backup
            };
        }
    }

    fn drop_vanished(&mut self, snapshot: &[MemberSnapshot]) {
        self.health
            .retain(|name, _| snapshot.iter().any(|s| &s.member.name == name));
        if let Some(primary) = &self.current_primary {
            if !snapshot.iter().any(|s| &s.member.name == primary) {
                self.current_primary = None;
            }
        }
    }

    fn metrics_failing(metrics: &Metrics, cfg: &DecisionConfig) -> bool {
        if !metrics.has_core_fields() {
            // Dead probe: as bad as total loss.
            return true;
        }
        let loss_bad = metrics.loss_pct.map(|l| l >= cfg.fail_loss_pct).unwrap_or(false);
        let latency_bad = metrics
            .latency_ms
            .map(|l| l >= cfg.fail_latency_ms)
            .unwrap_or(false);
        loss_bad || latency_bad
    }

    fn metrics_restored(metrics: &Metrics, cfg: &DecisionConfig) -> bool {
        if !metrics.has_core_fields() {
            return false;
        }
        let loss_ok = metrics
            .loss_pct
            .map(|l| l < cfg.restore_loss_pct)
            .unwrap_or(true);
        let latency_ok = metrics
            .latency_ms
            .map(|l| l < cfg.restore_latency_ms)
            .unwrap_or(true);
        loss_ok && latency_ok
    }
}
