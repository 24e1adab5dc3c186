//! Carries [`ClientHints`](super::ClientHints) out to the AP and DHCP
//! helpers: hostapd vendor elements via the wireless config store, the
//! Android metered hint via a dnsmasq tag section, and an optional
//! deauth-all so clients re-read the beacon immediately.
//!
//! Command construction is separated from execution (`plan` vs `apply`)
//! so tests assert the exact command lines without touching the box.

use std::sync::{Arc, Mutex};

use autonomy_common::models::ReassocPolicy;

use crate::config::MeteredConfig;
use crate::controller::backend::CommandRunner;
use crate::error::Result;

use super::ClientHints;

/// Broadcast address used by `deauthenticate` to kick every station.
const DEAUTH_ALL: &str = "ff:ff:ff:ff:ff:ff";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PlannedCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        PlannedCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn render(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Tracks the last applied state so repeated hints do not restart
/// services needlessly.
#[derive(Debug, Default, Clone)]
struct AppliedState {
    vendor_elements: Option<String>,
    dhcp_metered: Option<bool>,
}

pub struct MeteredApplier {
    runner: Arc<dyn CommandRunner>,
    wifi_section: String,
    wifi_iface: String,
    dry_run: bool,
    state: Mutex<AppliedState>,
}

impl MeteredApplier {
    pub fn new(cfg: &MeteredConfig, runner: Arc<dyn CommandRunner>, dry_run: bool) -> Self {
        MeteredApplier {
            runner,
            wifi_section: cfg.wifi_section.clone(),
            wifi_iface: cfg.wifi_iface.clone(),
            dry_run,
            state: Mutex::new(AppliedState::default()),
        }
    }

    /// The command sequence that would bring the box to `hints`, given
    /// the last applied state.
    pub fn plan(&self, hints: &ClientHints) -> Vec<PlannedCommand> {
        let state = self.state.lock().unwrap();
        let mut plan = Vec::new();

        // ── Beacon vendor elements ──────────────────────────────
        let elements = if hints.ies.is_empty() {
            None
        } else {
            Some(
                hints
                    .ies
                    .iter()
                    .map(|ie| ie.hex())
                    .collect::<Vec<_>>()
                    .join(""),
            )
        };
        if elements != state.vendor_elements {
            let option = |v: &str| format!("wireless.{}.hostapd_options=vendor_elements={v}", self.wifi_section);
            if let Some(prev) = &state.vendor_elements {
                plan.push(PlannedCommand::new("uci", &["-q", "del_list", &option(prev)]));
            }
            if let Some(next) = &elements {
                plan.push(PlannedCommand::new("uci", &["add_list", &option(next)]));
            }
            plan.push(PlannedCommand::new("uci", &["commit", "wireless"]));
            plan.push(PlannedCommand::new("wifi", &["reload"]));
        }

        // ── Android DHCP hint ───────────────────────────────────
        if state.dhcp_metered != Some(hints.dhcp_android_metered) {
            if hints.dhcp_android_metered {
                plan.push(PlannedCommand::new("uci", &["set", "dhcp.android=tag"]));
                plan.push(PlannedCommand::new(
                    "uci",
                    &["set", "dhcp.android.vendorid=Android"],
                ));
                plan.push(PlannedCommand::new(
                    "uci",
                    &["-q", "del_list", "dhcp.android.dhcp_option=43,ANDROID_METERED"],
                ));
                plan.push(PlannedCommand::new(
                    "uci",
                    &["add_list", "dhcp.android.dhcp_option=43,ANDROID_METERED"],
                ));
            } else {
                plan.push(PlannedCommand::new("uci", &["-q", "delete", "dhcp.android"]));
            }
            plan.push(PlannedCommand::new("uci", &["commit", "dhcp"]));
            plan.push(PlannedCommand::new("/etc/init.d/dnsmasq", &["restart"]));
        }

        // ── Client re-association ───────────────────────────────
        if !plan.is_empty() && hints.reassoc == ReassocPolicy::Force {
            plan.push(PlannedCommand::new(
                "hostapd_cli",
                &["-i", &self.wifi_iface, "deauthenticate", DEAUTH_ALL],
            ));
        }

        plan
    }

    /// Plan and execute. In dry-run mode the plan is computed and state
    /// advanced, but nothing is spawned.
    pub fn apply(&self, hints: &ClientHints) -> Result<()> {
        let plan = self.plan(hints);
        if plan.is_empty() {
            return Ok(());
        }
        if !self.dry_run {
            for cmd in &plan {
                let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
                let out = self.runner.run(&cmd.program, &args)?;
                if !out.success() {
                    tracing::warn!(command = %cmd.render(), status = out.status, "metered helper failed");
                }
            }
        }
        let mut state = self.state.lock().unwrap();
        state.vendor_elements = if hints.ies.is_empty() {
            None
        } else {
            Some(
                hints
                    .ies
                    .iter()
                    .map(|ie| ie.hex())
                    .collect::<Vec<_>>()
                    .join(""),
            )
        };
        state.dhcp_metered = Some(hints.dhcp_android_metered);
        tracing::debug!(mode = ?hints.mode, commands = plan.len(), "metered hints applied");
        Ok(())
    }
}
