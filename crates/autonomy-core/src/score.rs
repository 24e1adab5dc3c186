//! # Uplink Scoring
//!
//! Pure mapping from a metrics record to an instant score in [0, 100],
//! plus the EWMA smoothing and class-specific bias that produce the final
//! score the decision engine ranks on.
//!
//! Penalties are applied in a fixed order and the running value is clamped
//! at every step, so a catastrophic sample cannot push the score negative
//! and a perfect one cannot exceed 100.

use autonomy_common::models::{MemberClass, Metrics};

use crate::config::ScoringConfig;

/// Latency above this incurs a penalty.
const LATENCY_FREE_MS: f64 = 50.0;
/// Latency penalty reaches its cap at 1500 ms.
const LATENCY_SPAN_MS: f64 = 1450.0;
const LATENCY_PENALTY_CAP: f64 = 30.0;
const LOSS_PENALTY_CAP: f64 = 50.0;
const LOSS_PENALTY_PER_PCT: f64 = 5.0;
const JITTER_FREE_MS: f64 = 20.0;
const JITTER_PENALTY_PER_MS: f64 = 0.5;
const JITTER_PENALTY_CAP: f64 = 15.0;
const OBSTRUCTION_PENALTY_PER_PCT: f64 = 2.5;
const OBSTRUCTION_PENALTY_CAP: f64 = 25.0;
/// Obstruction data younger than this is not yet trustworthy.
const OBSTRUCTION_VALID_MIN_S: f64 = 30.0;
const OBSTRUCTION_INVALID_PENALTY: f64 = 10.0;
/// RSRP / RSSI piecewise-linear penalty breakpoints.
const RSRP_GOOD_DBM: f64 = -80.0;
const RSRP_BAD_DBM: f64 = -120.0;
const RSRP_PENALTY_MAX: f64 = 25.0;
const RSSI_GOOD_DBM: f64 = -60.0;
const RSSI_BAD_DBM: f64 = -90.0;
const RSSI_PENALTY_MAX: f64 = 25.0;
/// Final-score bias applies only while obstruction is below this.
const CLEAR_SKY_PCT: f64 = 0.5;

/// Instant score for one metrics record. Absent fields contribute no
/// penalty; a record with no core fields at all scores 0 (a dead probe is
/// not a perfect link).
pub fn instant_score(class: MemberClass, metrics: &Metrics) -> f64 {
    if !metrics.has_core_fields() {
        return 0.0;
    }

    let mut score: f64 = 100.0;

    if let Some(latency) = metrics.latency_ms {
        if latency > LATENCY_FREE_MS {
            let penalty =
                ((latency - LATENCY_FREE_MS) / LATENCY_SPAN_MS * LATENCY_PENALTY_CAP)
                    .min(LATENCY_PENALTY_CAP);
            score -= penalty;
        }
    }
    score = score.clamp(0.0, 100.0);

    if let Some(loss) = metrics.loss_pct {
        score -= (loss * LOSS_PENALTY_PER_PCT).min(LOSS_PENALTY_CAP);
    }
    score = score.clamp(0.0, 100.0);

    if let Some(jitter) = metrics.jitter_ms {
        let over = (jitter - JITTER_FREE_MS).max(0.0);
        score -= (over * JITTER_PENALTY_PER_MS).min(JITTER_PENALTY_CAP);
    }
    score = score.clamp(0.0, 100.0);

    score -= class_penalty(class, metrics);
    score.clamp(0.0, 100.0)
}

fn class_penalty(class: MemberClass, metrics: &Metrics) -> f64 {
    match class {
        MemberClass::Starlink => {
            let Some(sl) = metrics.starlink.as_ref() else {
                return 0.0;
            };
            let mut penalty = 0.0;
            if let Some(obstruction) = sl.obstruction_pct {
                penalty +=
                    (obstruction * OBSTRUCTION_PENALTY_PER_PCT).min(OBSTRUCTION_PENALTY_CAP);
            }
            if let Some(valid_s) = sl.obstruction_valid_s {
                if valid_s < OBSTRUCTION_VALID_MIN_S {
                    penalty += OBSTRUCTION_INVALID_PENALTY;
                }
            }
            penalty
        }
        MemberClass::Cellular => metrics
            .cellular
            .as_ref()
            .and_then(|c| c.rsrp_dbm)
            .map(|rsrp| signal_penalty(rsrp, RSRP_GOOD_DBM, RSRP_BAD_DBM, RSRP_PENALTY_MAX))
            .unwrap_or(0.0),
        MemberClass::Wifi => metrics
            .wifi
            .as_ref()
            .and_then(|w| w.rssi_dbm)
            .map(|rssi| signal_penalty(rssi, RSSI_GOOD_DBM, RSSI_BAD_DBM, RSSI_PENALTY_MAX))
            .unwrap_or(0.0),
        MemberClass::Lan | MemberClass::Other => 0.0,
    }
}

/// Monotone piecewise-linear penalty: 0 at `good_dbm` and above, `max`
/// at `bad_dbm` and below, linear between.
fn signal_penalty(dbm: f64, good_dbm: f64, bad_dbm: f64, max: f64) -> f64 {
    if dbm >= good_dbm {
        0.0
    } else if dbm <= bad_dbm {
        max
    } else {
        (good_dbm - dbm) / (good_dbm - bad_dbm) * max
    }
}

/// One EWMA step. On the first sample the EWMA is seeded with the instant
/// value. NaN inputs are ignored rather than poisoning the average.
pub fn ewma_step(prev: Option<f64>, instant: f64, alpha: f64) -> f64 {
    if instant.is_nan() {
        return prev.unwrap_or(0.0);
    }
    match prev {
        None => instant,
        Some(prev) => alpha * instant + (1.0 - alpha) * prev,
    }
}

/// Final score: EWMA with the class-specific bias applied, clamped.
///
/// Starlink earns a small boost while the sky is clear; a cellular member
/// that is roaming without `prefer_roaming` is penalised.
pub fn final_score(
    class: MemberClass,
    prefer_roaming: bool,
    metrics: &Metrics,
    ewma: f64,
    cfg: &ScoringConfig,
) -> f64 {
    let mut score = ewma;
    match class {
        MemberClass::Starlink => {
            let clear = metrics
                .starlink
                .as_ref()
                .and_then(|s| s.obstruction_pct)
                .map(|o| o < CLEAR_SKY_PCT)
                .unwrap_or(false);
            if clear {
                score += cfg.starlink_clear_boost;
            }
        }
        MemberClass::Cellular => {
            let roaming = metrics
                .cellular
                .as_ref()
                .and_then(|c| c.roaming)
                .unwrap_or(false);
            if roaming && !prefer_roaming {
                score -= cfg.roaming_penalty;
            }
        }
        _ => {}
    }
    score.clamp(0.0, 100.0)
}
