//! Route-selection back-ends the controller drives, behind traits so the
//! decision path can be exercised against in-memory fakes.
//!
//! Two strategies exist on the wire: a weighted multi-WAN policy engine
//! (mwan3-style, manipulated through `uci` and the `mwan3` tool) and a
//! plain route-metric engine (`ip route` / netifd). Both shell out through
//! the [`CommandRunner`] seam.

use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::error::{CoreError, Result};

// ── Subprocess seam ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// The single choke point for every subprocess the core spawns. Shell
/// back-ends, the metered applier, and the modem collectors all go
/// through it, which makes the generated command lines assertable in
/// tests and inert in simulation.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Executes commands on the box.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| CoreError::Transient(format!("spawn {program}: {e}")))?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Records every command instead of executing it, optionally serving
/// canned stdout per program name. Used by tests and `--simulate`.
#[derive(Default)]
pub struct RecordingRunner {
    pub calls: Mutex<Vec<String>>,
    pub responses: Mutex<HashMap<String, CommandOutput>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, program: &str, stdout: &str) {
        self.responses.lock().unwrap().insert(
            program.to_string(),
            CommandOutput {
                status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn recorded(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{program} {}", args.join(" ")));
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(program)
            .cloned()
            .unwrap_or_default())
    }
}

// ── Weighted-policy back-end ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyInterfaceState {
    Online,
    Tracking,
    Offline,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyStatus {
    pub interfaces: HashMap<String, PolicyInterfaceState>,
}

impl PolicyStatus {
    pub fn online_count(&self) -> usize {
        self.interfaces
            .values()
            .filter(|s| **s == PolicyInterfaceState::Online)
            .count()
    }
}

pub trait WeightedPolicyBackend: Send + Sync {
    fn get_status(&self) -> Result<PolicyStatus>;
    /// Weights are integers 0–100.
    fn set_member_weight(&self, member: &str, weight: u8) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn reload(&self) -> Result<()>;
}

impl<T: WeightedPolicyBackend + ?Sized> WeightedPolicyBackend for Arc<T> {
    fn get_status(&self) -> Result<PolicyStatus> {
        (**self).get_status()
    }
    fn set_member_weight(&self, member: &str, weight: u8) -> Result<()> {
        (**self).set_member_weight(member, weight)
    }
    fn commit(&self) -> Result<()> {
        (**self).commit()
    }
    fn reload(&self) -> Result<()> {
        (**self).reload()
    }
}

/// mwan3 over `ubus`/`uci`.
pub struct Mwan3Backend {
    runner: Arc<dyn CommandRunner>,
}

impl Mwan3Backend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Mwan3Backend { runner }
    }
}

#[derive(Deserialize)]
struct UbusMwan3Status {
    #[serde(default)]
    interfaces: HashMap<String, UbusMwan3Interface>,
}

#[derive(Deserialize)]
struct UbusMwan3Interface {
    status: String,
}

impl WeightedPolicyBackend for Mwan3Backend {
    fn get_status(&self) -> Result<PolicyStatus> {
        let out = self.runner.run("ubus", &["-S", "call", "mwan3", "status"])?;
        if !out.success() {
            return Err(CoreError::Transient(format!(
                "mwan3 status failed: {}",
                out.stderr.trim()
            )));
        }
        let parsed: UbusMwan3Status = serde_json::from_str(&out.stdout)
            .map_err(|e| CoreError::Transient(format!("mwan3 status parse: {e}")))?;
        let interfaces = parsed
            .interfaces
            .into_iter()
            .map(|(name, iface)| {
                let state = match iface.status.as_str() {
                    "online" => PolicyInterfaceState::Online,
                    "tracking" => PolicyInterfaceState::Tracking,
                    _ => PolicyInterfaceState::Offline,
                };
                (name, state)
            })
            .collect();
        Ok(PolicyStatus { interfaces })
    }

    fn set_member_weight(&self, member: &str, weight: u8) -> Result<()> {
        let assignment = format!("mwan3.{member}.weight={weight}");
        let out = self.runner.run("uci", &["set", &assignment])?;
        if out.success() {
            Ok(())
        } else {
            Err(CoreError::Transient(format!(
                "uci set {assignment}: {}",
                out.stderr.trim()
            )))
        }
    }

    fn commit(&self) -> Result<()> {
        let out = self.runner.run("uci", &["commit", "mwan3"])?;
        if out.success() {
            Ok(())
        } else {
            Err(CoreError::Transient("uci commit mwan3 failed".into()))
        }
    }

    fn reload(&self) -> Result<()> {
        let out = self.runner.run("mwan3", &["restart"])?;
        if out.success() {
            Ok(())
        } else {
            Err(CoreError::Transient("mwan3 restart failed".into()))
        }
    }
}

// ── Route-metric back-end ───────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct InterfaceStatus {
    pub up: bool,
    pub available: bool,
    pub device: String,
    pub routes: Vec<String>,
}

pub trait RouteMetricBackend: Send + Sync {
    fn set_default_route_metric(&self, iface: &str, metric: u32) -> Result<()>;
    fn interface_up(&self, iface: &str) -> Result<()>;
    fn interface_status(&self, iface: &str) -> Result<InterfaceStatus>;
}

impl<T: RouteMetricBackend + ?Sized> RouteMetricBackend for Arc<T> {
    fn set_default_route_metric(&self, iface: &str, metric: u32) -> Result<()> {
        (**self).set_default_route_metric(iface, metric)
    }
    fn interface_up(&self, iface: &str) -> Result<()> {
        (**self).interface_up(iface)
    }
    fn interface_status(&self, iface: &str) -> Result<InterfaceStatus> {
        (**self).interface_status(iface)
    }
}

/// netifd over `ip`/`ifup`/`ubus`.
pub struct NetifdBackend {
    runner: Arc<dyn CommandRunner>,
}

impl NetifdBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        NetifdBackend { runner }
    }
}

#[derive(Deserialize)]
struct UbusInterfaceStatus {
    #[serde(default)]
    up: bool,
    #[serde(default)]
    available: bool,
    #[serde(default)]
    l3_device: String,
    #[serde(default)]
    route: Vec<UbusRoute>,
}

#[derive(Deserialize)]
struct UbusRoute {
    target: String,
}

impl RouteMetricBackend for NetifdBackend {
    fn set_default_route_metric(&self, iface: &str, metric: u32) -> Result<()> {
        let metric = metric.to_string();
        let out = self.runner.run(
            "ip",
            &["route", "replace", "default", "dev", iface, "metric", &metric],
        )?;
        if out.success() {
            Ok(())
        } else {
            Err(CoreError::Transient(format!(
                "ip route replace {iface}: {}",
                out.stderr.trim()
            )))
        }
    }

    fn interface_up(&self, iface: &str) -> Result<()> {
        let out = self.runner.run("ifup", &[iface])?;
        if out.success() {
            Ok(())
        } else {
            Err(CoreError::Transient(format!("ifup {iface} failed")))
        }
    }

    fn interface_status(&self, iface: &str) -> Result<InterfaceStatus> {
        let path = format!("network.interface.{iface}");
        let out = self.runner.run("ubus", &["-S", "call", &path, "status"])?;
        if !out.success() {
            return Err(CoreError::Transient(format!("{path} status failed")));
        }
        let parsed: UbusInterfaceStatus = serde_json::from_str(&out.stdout)
            .map_err(|e| CoreError::Transient(format!("{path} status parse: {e}")))?;
        Ok(InterfaceStatus {
            up: parsed.up,
            available: parsed.available,
            device: parsed.l3_device,
            routes: parsed.route.into_iter().map(|r| r.target).collect(),
        })
    }
}

// ── In-memory fakes ─────────────────────────────────────────────────

/// Weighted back-end that applies writes to an in-memory map. The test
/// and simulation back-end.
#[derive(Default)]
pub struct MockWeightedBackend {
    pub status: Mutex<PolicyStatus>,
    /// Weights staged by `set_member_weight`, visible after `commit`.
    staged: Mutex<HashMap<String, u8>>,
    pub weights: Mutex<HashMap<String, u8>>,
    pub commits: AtomicU32,
    pub reloads: AtomicU32,
}

impl MockWeightedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, iface: &str, state: PolicyInterfaceState) {
        self.status
            .lock()
            .unwrap()
            .interfaces
            .insert(iface.to_string(), state);
    }

    pub fn weight_of(&self, member: &str) -> Option<u8> {
        self.weights.lock().unwrap().get(member).copied()
    }

    pub fn commit_count(&self) -> u32 {
        self.commits.load(Ordering::Relaxed)
    }
}

impl WeightedPolicyBackend for MockWeightedBackend {
    fn get_status(&self) -> Result<PolicyStatus> {
        Ok(self.status.lock().unwrap().clone())
    }

    fn set_member_weight(&self, member: &str, weight: u8) -> Result<()> {
        self.staged
            .lock()
            .unwrap()
            .insert(member.to_string(), weight);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let staged: Vec<(String, u8)> = self.staged.lock().unwrap().drain().collect();
        let mut weights = self.weights.lock().unwrap();
        for (member, weight) in staged {
            weights.insert(member, weight);
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Route-metric back-end recording metrics and up'd interfaces.
#[derive(Default)]
pub struct MockRouteBackend {
    pub metrics: Mutex<HashMap<String, u32>>,
    pub upped: Mutex<Vec<String>>,
    pub statuses: Mutex<HashMap<String, InterfaceStatus>>,
}

impl MockRouteBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RouteMetricBackend for MockRouteBackend {
    fn set_default_route_metric(&self, iface: &str, metric: u32) -> Result<()> {
        self.metrics
            .lock()
            .unwrap()
            .insert(iface.to_string(), metric);
        Ok(())
    }

    fn interface_up(&self, iface: &str) -> Result<()> {
        self.upped.lock().unwrap().push(iface.to_string());
        Ok(())
    }

    fn interface_status(&self, iface: &str) -> Result<InterfaceStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(iface)
            .cloned()
            .unwrap_or_default())
    }
}
