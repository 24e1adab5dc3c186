//! # Obstruction Predictor
//!
//! Trend analysis over the Starlink obstruction history. Keeps a bounded
//! ring of `(obstruction, snr, validity)` samples, fits least-squares
//! slopes over the recent window, extrapolates one sample ahead, and
//! estimates time-to-failure, so the decision engine can fail over
//! *before* the dish actually drops.
//!
//! Slopes are per-sample; wall-clock estimates are scaled by the
//! scheduler's poll interval, so a non-1 Hz tick stays calibrated.

pub mod patterns;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::PredictorConfig;
use crate::error::{CoreError, Result};

use patterns::{GeoContext, PatternLearner};

/// Slopes with magnitude below this are treated as flat.
const STABILITY_THRESHOLD: f64 = 1e-3;
/// SNR extrapolation ceiling in dB.
const SNR_MAX_DB: f64 = 30.0;
/// Validity seconds treated as fully trustworthy.
const FULL_VALIDITY_S: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstructionSample {
    pub timestamp: DateTime<Utc>,
    /// Fraction of sky obstructed, [0, 1].
    pub obstruction: f64,
    pub snr_db: f64,
    pub valid_s: f64,
    pub patches_valid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionSource {
    Regression,
    Pattern,
}

#[derive(Debug, Clone, Copy)]
pub struct TrendAnalysis {
    /// Obstruction slope per sample over the trend window.
    pub obstruction_acceleration: f64,
    /// SNR slope per sample.
    pub snr_trend: f64,
    /// Extrapolated next-sample obstruction, clamped to [0, 1].
    pub predicted_obstruction: f64,
    /// Extrapolated next-sample SNR, clamped to [0, 30] dB.
    pub predicted_snr: f64,
    pub confidence: f64,
    pub direction: TrendDirection,
    /// Seconds until the critical threshold at the current slope, when
    /// one is approaching.
    pub time_to_failure_s: Option<f64>,
    pub source: PredictionSource,
}

pub struct ObstructionPredictor {
    cfg: PredictorConfig,
    sample_period_s: f64,
    samples: VecDeque<ObstructionSample>,
    learner: Option<PatternLearner>,
}

impl ObstructionPredictor {
    pub fn new(cfg: PredictorConfig, sample_period_s: f64) -> Self {
        let learner = cfg.pattern_learning.then(|| PatternLearner::new(&cfg));
        ObstructionPredictor {
            samples: VecDeque::with_capacity(cfg.ring_capacity),
            sample_period_s: sample_period_s.max(0.001),
            cfg,
            learner,
        }
    }

    /// Swap in reloaded tunables; the sample ring carries over. The
    /// learner is created or dropped as the toggle changes.
    pub fn set_config(&mut self, cfg: PredictorConfig, sample_period_s: f64) {
        if cfg.pattern_learning && self.learner.is_none() {
            self.learner = Some(PatternLearner::new(&cfg));
        } else if !cfg.pattern_learning {
            self.learner = None;
        }
        self.sample_period_s = sample_period_s.max(0.001);
        while self.samples.len() > cfg.ring_capacity {
            self.samples.pop_front();
        }
        self.cfg = cfg;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Record one sample, feeding the pattern learner when enabled.
    pub fn record(&mut self, sample: ObstructionSample, context: Option<&GeoContext>) {
        while self.samples.len() >= self.cfg.ring_capacity {
            self.samples.pop_front();
        }
        if let Some(learner) = self.learner.as_mut() {
            learner.observe(sample.obstruction, context);
        }
        self.samples.push_back(sample);
    }

    /// Run the trend analysis over the current ring.
    pub fn analyze_trends(&self, context: Option<&GeoContext>) -> Result<TrendAnalysis> {
        let n = self.samples.len();
        if n < self.cfg.min_samples_for_analysis {
            return Err(CoreError::InsufficientData {
                have: n,
                need: self.cfg.min_samples_for_analysis,
            });
        }

        let window = self.cfg.trend_window.min(n);
        let recent: Vec<&ObstructionSample> = self.samples.iter().rev().take(window).collect();
        let obstruction: Vec<f64> = recent.iter().rev().map(|s| s.obstruction).collect();
        let snr: Vec<f64> = recent.iter().rev().map(|s| s.snr_db).collect();

        let (obstruction_slope, obstruction_var) = least_squares(&obstruction);
        let (snr_slope, _) = least_squares(&snr);

        let current = *obstruction.last().expect("window is non-empty");
        let current_snr = *snr.last().expect("window is non-empty");
        let mut predicted_obstruction = (current + obstruction_slope).clamp(0.0, 1.0);
        let predicted_snr = (current_snr + snr_slope).clamp(0.0, SNR_MAX_DB);

        // Confidence: data quality 0.4, sample count 0.3, trend
        // consistency (inverse-exponential of residual variance) 0.3.
        let data_quality: f64 = recent
            .iter()
            .map(|s| {
                let validity = (s.valid_s / FULL_VALIDITY_S).clamp(0.0, 1.0);
                if s.patches_valid > 0 {
                    validity
                } else {
                    validity * 0.5
                }
            })
            .sum::<f64>()
            / window as f64;
        let sample_factor = (n as f64 / self.cfg.trend_window as f64).min(1.0);
        let consistency = (-obstruction_var).exp();
        let mut confidence =
            (0.4 * data_quality + 0.3 * sample_factor + 0.3 * consistency).clamp(0.0, 1.0);

        let direction = if obstruction_slope > STABILITY_THRESHOLD
            || snr_slope < -STABILITY_THRESHOLD
        {
            TrendDirection::Degrading
        } else if obstruction_slope.abs() < STABILITY_THRESHOLD
            && snr_slope.abs() < STABILITY_THRESHOLD
        {
            TrendDirection::Stable
        } else {
            TrendDirection::Improving
        };

        let time_to_failure_s = self.time_to_failure(
            current,
            obstruction_slope,
            current_snr,
            snr_slope,
        );

        // A learned pattern with higher confidence substitutes its
        // predicted obstruction for the regression estimate.
        let mut source = PredictionSource::Regression;
        if let (Some(learner), Some(ctx)) = (self.learner.as_ref(), context) {
            if let Some(matched) = learner.match_context(ctx, &obstruction) {
                if matched.confidence > confidence {
                    predicted_obstruction = matched.predicted_obstruction.clamp(0.0, 1.0);
                    confidence = matched.confidence.clamp(0.0, 1.0);
                    source = PredictionSource::Pattern;
                }
            }
        }

        Ok(TrendAnalysis {
            obstruction_acceleration: obstruction_slope,
            snr_trend: snr_slope,
            predicted_obstruction,
            predicted_snr,
            confidence,
            direction,
            time_to_failure_s,
            source,
        })
    }

    /// Whether this analysis warrants a pre-emptive failover. Confidence
    /// exactly at the threshold fires.
    pub fn should_trigger(&self, analysis: &TrendAnalysis) -> bool {
        if analysis.confidence < self.cfg.confidence_threshold {
            return false;
        }
        analysis.obstruction_acceleration > self.cfg.acceleration_threshold
            || analysis.predicted_obstruction > self.cfg.obstruction_limit
            || analysis.predicted_snr < self.cfg.snr_floor_db
            || analysis
                .time_to_failure_s
                .map(|t| t < self.cfg.ttf_trigger_s)
                .unwrap_or(false)
    }

    /// Solve `current + slope·t = critical` along both axes and keep the
    /// smaller positive root, converted from samples to seconds.
    fn time_to_failure(
        &self,
        obstruction: f64,
        obstruction_slope: f64,
        snr: f64,
        snr_slope: f64,
    ) -> Option<f64> {
        let mut best: Option<f64> = None;
        if obstruction_slope > 0.0 && obstruction < self.cfg.obstruction_limit {
            let t = (self.cfg.obstruction_limit - obstruction) / obstruction_slope;
            best = Some(t);
        }
        if snr_slope < 0.0 && snr > self.cfg.snr_floor_db {
            let t = (self.cfg.snr_floor_db - snr) / snr_slope;
            best = Some(match best {
                Some(prev) => prev.min(t),
                None => t,
            });
        }
        best.map(|samples| samples * self.sample_period_s)
    }
}

/// Least-squares slope of `values` over x = 0..n, plus the residual
/// variance of the fit.
fn least_squares(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n < 2 {
        return (0.0, 0.0);
    }
    let nf = n as f64;
    let x_mean = (nf - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / nf;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    let slope = if den > 0.0 { num / den } else { 0.0 };
    let intercept = y_mean - slope * x_mean;

    let variance = values
        .iter()
        .enumerate()
        .map(|(i, y)| {
            let fitted = intercept + slope * i as f64;
            (y - fitted).powi(2)
        })
        .sum::<f64>()
        / nf;
    (slope, variance)
}
