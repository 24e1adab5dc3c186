//! # Controller
//!
//! Executes switch decisions against the route-selection subsystem.
//!
//! In classic mode a switch stomps every weight (target 100, rest 10).
//! The default hybrid mode instead classifies the situation and makes the
//! smallest intervention that gets traffic onto the target, preserving
//! the user's configured weights except in emergencies, and restoring
//! them after a bounded interval via the background sweep.
//!
//! Every non-trivial intervention leaves a [`WeightAdjustment`] record
//! with a hard expiry, so a wedged sweep can never hold user weights
//! hostage: `expires_at − created_at ≤ max_adjustment_duration` always.

pub mod backend;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use autonomy_common::models::Member;

use crate::config::{ControllerConfig, ControllerMode};
use crate::error::{CoreError, Result};

use backend::{
    PolicyInterfaceState, PolicyStatus, RouteMetricBackend, WeightedPolicyBackend,
};

/// Route metric handed to the primary; alternates get `ALTERNATE_BASE + rank`.
const PRIMARY_ROUTE_METRIC: u32 = 10;
const ALTERNATE_ROUTE_METRIC_BASE: u32 = 100;
const CLASSIC_PRIMARY_WEIGHT: u8 = 100;
const CLASSIC_ALTERNATE_WEIGHT: u8 = 10;
const EMERGENCY_PRIMARY_WEIGHT: u8 = 100;
const EMERGENCY_ALTERNATE_WEIGHT: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedAction {
    /// Target already preferred; internal pointer update only.
    NoIntervention,
    /// Target healthy but out-weighed; small temporary raise.
    MinimalAdjustment,
    /// Target not yet online in the policy status; larger temporary raise.
    TemporaryBoost,
    /// Most members down; full override of every weight.
    EmergencyOverride,
    /// Target interface was absent; brought up, then re-evaluated.
    InterfaceEnable,
    /// Classic-mode stomp.
    Classic,
    /// Route-metric back-end rewrite.
    RouteMetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    Boost,
    Emergency,
}

/// Record of a temporary weight raise. While present,
/// `adjusted_weight ≥ original_weight`; on expiry the sweep restores
/// `original_weight`.
#[derive(Debug, Clone, Serialize)]
pub struct WeightAdjustment {
    pub member: String,
    pub original_weight: u8,
    pub adjusted_weight: u8,
    pub reason: String,
    pub kind: AdjustmentKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Emergency overrides also demote every other member; their originals
/// are kept here so the same sweep restores them.
struct EmergencyState {
    expires_at: DateTime<Utc>,
    demoted: HashMap<String, u8>,
}

#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    pub from: Option<String>,
    pub to: String,
    pub action: AppliedAction,
}

pub enum Backend {
    Weighted(Box<dyn WeightedPolicyBackend>),
    RouteMetric(Box<dyn RouteMetricBackend>),
}

type FailoverCallback =
    Box<dyn Fn(Option<&str>, &str) -> std::result::Result<(), String> + Send + Sync>;

pub struct Controller {
    cfg: ControllerConfig,
    dry_run: bool,
    backend: Backend,
    adjustments: Mutex<HashMap<String, WeightAdjustment>>,
    emergency: Mutex<Option<EmergencyState>>,
    callbacks: Mutex<Vec<FailoverCallback>>,
}

impl Controller {
    pub fn new(cfg: ControllerConfig, backend: Backend, dry_run: bool) -> Self {
        Controller {
            cfg,
            dry_run,
            backend,
            adjustments: Mutex::new(HashMap::new()),
            emergency: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Register a callback invoked after every successful switch, in
    /// registration order, with `(from, to)`. Failures are logged and do
    /// not abort the switch.
    pub fn register_failover_callback(&self, cb: FailoverCallback) {
        self.callbacks.lock().unwrap().push(cb);
    }

    /// Snapshot of the pending adjustments, for the status surface.
    pub fn adjustments(&self) -> Vec<WeightAdjustment> {
        let mut out: Vec<WeightAdjustment> =
            self.adjustments.lock().unwrap().values().cloned().collect();
        out.sort_by(|a, b| a.member.cmp(&b.member));
        out
    }

    /// Apply a switch decision. Switching to the current primary is a
    /// no-op: no back-end writes, no callbacks, `Ok(None)`.
    pub fn apply_switch(
        &self,
        from: Option<&str>,
        to: &str,
        members: &[Member],
        now: DateTime<Utc>,
    ) -> Result<Option<SwitchOutcome>> {
        if from == Some(to) {
            return Ok(None);
        }
        let target = members
            .iter()
            .find(|m| m.name == to)
            .ok_or_else(|| {
                CoreError::InvariantViolation(format!("switch target {to:?} not in registry"))
            })?
            .clone();

        let action = match (&self.backend, self.cfg.mode) {
            (Backend::Weighted(b), ControllerMode::Classic) => {
                self.apply_classic(b.as_ref(), &target, members)?
            }
            (Backend::Weighted(b), ControllerMode::Hybrid) => {
                self.apply_hybrid(b.as_ref(), &target, members, now, 0)?
            }
            (Backend::RouteMetric(b), _) => self.apply_route(b.as_ref(), &target, members)?,
        };

        tracing::info!(
            from = from.unwrap_or("-"),
            to = %target.name,
            action = ?action,
            dry_run = self.dry_run,
            "switch applied"
        );
        self.fire_callbacks(from, &target.name);
        Ok(Some(SwitchOutcome {
            from: from.map(|s| s.to_string()),
            to: target.name,
            action,
        }))
    }

    /// Restore the original weight of every adjustment whose expiry has
    /// passed. Runs from the scheduler at least once per minute. Returns
    /// the member names restored.
    pub fn sweep(&self, members: &[Member], now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut restore: Vec<(String, u8)> = Vec::new();

        {
            let mut adjustments = self.adjustments.lock().unwrap();
            let expired: Vec<String> = adjustments
                .iter()
                .filter(|(_, a)| a.expires_at <= now)
                .map(|(name, _)| name.clone())
                .collect();
            for name in expired {
                if let Some(adj) = adjustments.remove(&name) {
                    restore.push((adj.member, adj.original_weight));
                }
            }
        }
        {
            let mut emergency = self.emergency.lock().unwrap();
            if emergency
                .as_ref()
                .map(|e| e.expires_at <= now)
                .unwrap_or(false)
            {
                let state = emergency.take().expect("checked above");
                for (member, weight) in state.demoted {
                    restore.push((member, weight));
                }
            }
        }

        if restore.is_empty() {
            return Ok(Vec::new());
        }
        let restored: Vec<String> = restore.iter().map(|(m, _)| m.clone()).collect();
        if let Backend::Weighted(b) = &self.backend {
            if !self.dry_run {
                for (member, weight) in &restore {
                    // Skip members that left the registry since.
                    if members.iter().any(|m| &m.name == member) {
                        b.set_member_weight(member, *weight)?;
                    }
                }
                b.commit()?;
                b.reload()?;
            }
        }
        tracing::info!(members = ?restored, "expired weight adjustments restored");
        Ok(restored)
    }

    /// Drop every pending adjustment and put each member's user weight
    /// back on the back-end. Idempotent.
    pub fn restore_user_weights(&self, members: &[Member]) -> Result<()> {
        self.adjustments.lock().unwrap().clear();
        *self.emergency.lock().unwrap() = None;
        if let Backend::Weighted(b) = &self.backend {
            if !self.dry_run {
                for m in members {
                    b.set_member_weight(&m.name, m.weight)?;
                }
                b.commit()?;
                b.reload()?;
            }
        }
        tracing::info!("user weights restored");
        Ok(())
    }

    // ─── Strategies ──────────────────────────────────────────────────────

    fn apply_classic(
        &self,
        b: &dyn WeightedPolicyBackend,
        target: &Member,
        members: &[Member],
    ) -> Result<AppliedAction> {
        if !self.dry_run {
            b.set_member_weight(&target.name, CLASSIC_PRIMARY_WEIGHT)?;
            for m in members.iter().filter(|m| m.name != target.name) {
                b.set_member_weight(&m.name, CLASSIC_ALTERNATE_WEIGHT)?;
            }
            b.commit()?;
            b.reload()?;
        }
        Ok(AppliedAction::Classic)
    }

    fn apply_hybrid(
        &self,
        b: &dyn WeightedPolicyBackend,
        target: &Member,
        members: &[Member],
        now: DateTime<Utc>,
        depth: u8,
    ) -> Result<AppliedAction> {
        let status = b.get_status()?;
        let action = self.classify(&status, target, members);
        match action {
            AppliedAction::NoIntervention => Ok(AppliedAction::NoIntervention),
            AppliedAction::MinimalAdjustment => {
                self.boost(
                    b,
                    target,
                    self.cfg.minimal_adjust_delta,
                    self.cfg.minimal_adjust_duration_s,
                    "minimal_adjustment",
                    now,
                )?;
                Ok(AppliedAction::MinimalAdjustment)
            }
            AppliedAction::TemporaryBoost => {
                self.boost(
                    b,
                    target,
                    self.cfg.boost_delta,
                    self.cfg.boost_duration_s,
                    "temporary_boost",
                    now,
                )?;
                Ok(AppliedAction::TemporaryBoost)
            }
            AppliedAction::EmergencyOverride => {
                self.emergency_override(b, target, members, now)?;
                Ok(AppliedAction::EmergencyOverride)
            }
            AppliedAction::InterfaceEnable => {
                // Bring the policy engine's view of the interface back and
                // re-evaluate once; a second miss degrades to a boost.
                if depth == 0 {
                    if !self.dry_run {
                        b.reload()?;
                    }
                    self.apply_hybrid(b, target, members, now, 1)?;
                } else {
                    self.boost(
                        b,
                        target,
                        self.cfg.boost_delta,
                        self.cfg.boost_duration_s,
                        "interface_enable",
                        now,
                    )?;
                }
                Ok(AppliedAction::InterfaceEnable)
            }
            // Classic / RouteMetric never come out of classify.
            other => Ok(other),
        }
    }

    fn apply_route(
        &self,
        b: &dyn RouteMetricBackend,
        target: &Member,
        members: &[Member],
    ) -> Result<AppliedAction> {
        if !self.dry_run {
            let status = b.interface_status(&target.iface)?;
            if !status.up {
                b.interface_up(&target.iface)?;
            }
            b.set_default_route_metric(&target.iface, PRIMARY_ROUTE_METRIC)?;
            for (rank, m) in members
                .iter()
                .filter(|m| m.name != target.name && m.is_selectable())
                .enumerate()
            {
                b.set_default_route_metric(
                    &m.iface,
                    ALTERNATE_ROUTE_METRIC_BASE + rank as u32 * 10,
                )?;
            }
        }
        Ok(AppliedAction::RouteMetric)
    }

    // ─── Hybrid pieces ───────────────────────────────────────────────────

    fn classify(
        &self,
        status: &PolicyStatus,
        target: &Member,
        members: &[Member],
    ) -> AppliedAction {
        let online = status.online_count();
        let total = members.len();
        if total > 0 {
            let fraction = online as f64 / total as f64;
            if online == 0 || fraction < self.cfg.emergency_online_fraction {
                return AppliedAction::EmergencyOverride;
            }
        }
        match status.interfaces.get(&target.iface) {
            None => AppliedAction::InterfaceEnable,
            Some(PolicyInterfaceState::Tracking) | Some(PolicyInterfaceState::Offline) => {
                AppliedAction::TemporaryBoost
            }
            Some(PolicyInterfaceState::Online) => {
                // Is the target already the policy engine's preference?
                let target_weight = self.effective_weight(target);
                let best_other = members
                    .iter()
                    .filter(|m| m.name != target.name)
                    .filter(|m| {
                        status.interfaces.get(&m.iface)
                            == Some(&PolicyInterfaceState::Online)
                    })
                    .map(|m| self.effective_weight(m))
                    .max()
                    .unwrap_or(0);
                if target_weight >= best_other {
                    AppliedAction::NoIntervention
                } else {
                    AppliedAction::MinimalAdjustment
                }
            }
        }
    }

    /// The weight currently on the back-end for `member`: its active
    /// adjustment if one exists, otherwise the user weight.
    fn effective_weight(&self, member: &Member) -> u8 {
        self.adjustments
            .lock()
            .unwrap()
            .get(&member.name)
            .map(|a| a.adjusted_weight)
            .unwrap_or(member.weight)
    }

    fn boost(
        &self,
        b: &dyn WeightedPolicyBackend,
        target: &Member,
        delta: u8,
        duration_s: u64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let original = target.weight;
        let adjusted = original.saturating_add(delta).min(100);
        self.record_adjustment(target, original, adjusted, reason, AdjustmentKind::Boost, duration_s, now);
        if !self.dry_run {
            b.set_member_weight(&target.name, adjusted)?;
            b.commit()?;
            b.reload()?;
        }
        Ok(())
    }

    fn emergency_override(
        &self,
        b: &dyn WeightedPolicyBackend,
        target: &Member,
        members: &[Member],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let duration = self.cfg.emergency_duration_s;
        self.record_adjustment(
            target,
            target.weight,
            EMERGENCY_PRIMARY_WEIGHT,
            "emergency_override",
            AdjustmentKind::Emergency,
            duration,
            now,
        );
        let demoted: HashMap<String, u8> = members
            .iter()
            .filter(|m| m.name != target.name)
            .map(|m| (m.name.clone(), m.weight))
            .collect();
        *self.emergency.lock().unwrap() = Some(EmergencyState {
            expires_at: now + self.bounded_duration(duration),
            demoted: demoted.clone(),
        });
        if !self.dry_run {
            b.set_member_weight(&target.name, EMERGENCY_PRIMARY_WEIGHT)?;
            for name in demoted.keys() {
                b.set_member_weight(name, EMERGENCY_ALTERNATE_WEIGHT)?;
            }
            b.commit()?;
            b.reload()?;
        }
        tracing::warn!(target = %target.name, "emergency override engaged");
        Ok(())
    }

    fn record_adjustment(
        &self,
        target: &Member,
        original: u8,
        adjusted: u8,
        reason: &str,
        kind: AdjustmentKind,
        duration_s: u64,
        now: DateTime<Utc>,
    ) {
        let adjustment = WeightAdjustment {
            member: target.name.clone(),
            original_weight: original,
            adjusted_weight: adjusted.max(original),
            reason: reason.to_string(),
            kind,
            created_at: now,
            expires_at: now + self.bounded_duration(duration_s),
        };
        self.adjustments
            .lock()
            .unwrap()
            .insert(target.name.clone(), adjustment);
    }

    /// Clamp to `max_adjustment_duration_s` so no adjustment can outlive
    /// the hard expiry bound.
    fn bounded_duration(&self, duration_s: u64) -> Duration {
        Duration::seconds(duration_s.min(self.cfg.max_adjustment_duration_s) as i64)
    }

    fn fire_callbacks(&self, from: Option<&str>, to: &str) {
        let callbacks = self.callbacks.lock().unwrap();
        for cb in callbacks.iter() {
            if let Err(e) = cb(from, to) {
                tracing::warn!(error = %e, "failover callback failed");
            }
        }
    }
}
