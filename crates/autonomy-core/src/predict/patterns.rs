//! Environmental pattern learning for recurring obstructions.
//!
//! Vehicles and boats see the same obstruction at the same spot or the
//! same time of day (a bridge on the commute, a mast shadow at anchor
//! swing). The learner segments obstruction episodes out of the sample
//! stream, tags them with location and time-of-day, and stores them in an
//! append-only log. The predictor reads a consistent snapshot per tick,
//! so learner writes never race analysis.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Timelike, Utc};

use crate::config::PredictorConfig;

/// Obstruction fraction above which an episode is considered in progress.
const EPISODE_START_THRESHOLD: f64 = 0.05;
/// Minimum episode length worth remembering, in samples.
const EPISODE_MIN_SAMPLES: usize = 5;
/// Longest signature kept per pattern.
const SIGNATURE_MAX_SAMPLES: usize = 60;
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Where and when a sample was taken. Location is absent on units
/// without GPS; matching then falls back to time-of-day and signature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoContext {
    /// `(latitude, longitude)` in degrees.
    pub location: Option<(f64, f64)>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentalPattern {
    pub location: Option<(f64, f64)>,
    pub minute_of_day: u32,
    /// Obstruction fractions over the episode.
    pub signature: Vec<f64>,
    pub peak_obstruction: f64,
    /// How many episodes merged into this pattern.
    pub observations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternPrediction {
    pub predicted_obstruction: f64,
    pub confidence: f64,
}

/// Append-only pattern log with snapshot reads.
pub struct PatternLog {
    inner: ArcSwap<Vec<EnvironmentalPattern>>,
    max_patterns: usize,
}

impl PatternLog {
    pub fn new(max_patterns: usize) -> Self {
        PatternLog {
            inner: ArcSwap::from_pointee(Vec::new()),
            max_patterns,
        }
    }

    /// Consistent snapshot for one analysis pass.
    pub fn snapshot(&self) -> Arc<Vec<EnvironmentalPattern>> {
        self.inner.load_full()
    }

    /// Append a pattern, dropping the oldest when at capacity.
    pub fn append(&self, pattern: EnvironmentalPattern) {
        let current = self.inner.load_full();
        let mut next: Vec<EnvironmentalPattern> = (*current).clone();
        if next.len() >= self.max_patterns {
            next.remove(0);
        }
        next.push(pattern);
        self.inner.store(Arc::new(next));
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }
}

pub struct PatternLearner {
    similarity_threshold: f64,
    location_radius_m: f64,
    time_window_min: u32,
    log: PatternLog,
    episode: Vec<f64>,
    episode_context: Option<GeoContext>,
}

impl PatternLearner {
    pub fn new(cfg: &PredictorConfig) -> Self {
        PatternLearner {
            similarity_threshold: cfg.pattern_similarity_threshold,
            location_radius_m: cfg.pattern_location_radius_m,
            time_window_min: cfg.pattern_time_window_min,
            log: PatternLog::new(cfg.max_patterns),
            episode: Vec::new(),
            episode_context: None,
        }
    }

    pub fn patterns(&self) -> Arc<Vec<EnvironmentalPattern>> {
        self.log.snapshot()
    }

    /// Feed one obstruction sample. Episodes open when the fraction
    /// crosses the start threshold and close when it falls back; closed
    /// episodes of useful length become patterns.
    pub fn observe(&mut self, obstruction: f64, context: Option<&GeoContext>) {
        if obstruction >= EPISODE_START_THRESHOLD {
            if self.episode.is_empty() {
                self.episode_context = context.copied();
            }
            if self.episode.len() < SIGNATURE_MAX_SAMPLES {
                self.episode.push(obstruction);
            }
            return;
        }

        if self.episode.len() >= EPISODE_MIN_SAMPLES {
            let signature = std::mem::take(&mut self.episode);
            let peak = signature.iter().cloned().fold(0.0_f64, f64::max);
            let ctx = self.episode_context.take();
            let pattern = EnvironmentalPattern {
                location: ctx.and_then(|c| c.location),
                minute_of_day: ctx
                    .map(|c| c.time.hour() * 60 + c.time.minute())
                    .unwrap_or(0),
                signature,
                peak_obstruction: peak,
                observations: 1,
            };
            tracing::debug!(
                peak = pattern.peak_obstruction,
                samples = pattern.signature.len(),
                "learned obstruction pattern"
            );
            self.log.append(pattern);
        } else {
            self.episode.clear();
            self.episode_context = None;
        }
    }

    /// Match the current context (and the recent obstruction prefix)
    /// against stored patterns; returns the best match at or above the
    /// similarity threshold.
    pub fn match_context(
        &self,
        context: &GeoContext,
        recent_obstruction: &[f64],
    ) -> Option<PatternPrediction> {
        let patterns = self.log.snapshot();
        let mut best: Option<(f64, &EnvironmentalPattern)> = None;
        for pattern in patterns.iter() {
            let sim = self.similarity(pattern, context, recent_obstruction);
            if sim >= self.similarity_threshold
                && best.map(|(s, _)| sim > s).unwrap_or(true)
            {
                best = Some((sim, pattern));
            }
        }
        best.map(|(sim, pattern)| PatternPrediction {
            predicted_obstruction: pattern.peak_obstruction,
            confidence: sim,
        })
    }

    /// Weighted similarity: location 0.4, time-of-day 0.3, signature 0.3.
    /// With no location on either side the weight shifts onto the other
    /// two components.
    fn similarity(
        &self,
        pattern: &EnvironmentalPattern,
        context: &GeoContext,
        recent: &[f64],
    ) -> f64 {
        let time_sim = self.time_similarity(pattern.minute_of_day, &context.time);
        let sig_sim = signature_similarity(&pattern.signature, recent);

        match (pattern.location, context.location) {
            (Some(a), Some(b)) => {
                let dist = haversine_m(a, b);
                let loc_sim = (1.0 - dist / self.location_radius_m).clamp(0.0, 1.0);
                0.4 * loc_sim + 0.3 * time_sim + 0.3 * sig_sim
            }
            _ => 0.5 * time_sim + 0.5 * sig_sim,
        }
    }

    fn time_similarity(&self, pattern_minute: u32, now: &DateTime<Utc>) -> f64 {
        let minute = now.hour() * 60 + now.minute();
        let raw = pattern_minute.abs_diff(minute);
        // Wrap around midnight.
        let diff = raw.min(1440 - raw) as f64;
        (1.0 - diff / self.time_window_min as f64).clamp(0.0, 1.0)
    }
}

/// Compare the leading edge of a stored signature against the most recent
/// observations: 1 − mean absolute difference over the overlap.
fn signature_similarity(signature: &[f64], recent: &[f64]) -> f64 {
    let overlap = signature.len().min(recent.len());
    if overlap == 0 {
        return 0.0;
    }
    let tail = &recent[recent.len() - overlap..];
    let head = &signature[..overlap];
    let mad = head
        .iter()
        .zip(tail)
        .map(|(a, b)| (a - b).abs())
        .sum::<f64>()
        / overlap as f64;
    (1.0 - mad).clamp(0.0, 1.0)
}

fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}
