//! autonomyd, the multi-WAN failover daemon.
//!
//! - Discovers uplink members and probes them each tick
//! - Scores, smooths, and decides which member should be primary
//! - Drives the weighted-policy (or route-metric) engine, preserving
//!   user weights except in emergencies
//! - Signals metered state to clients via beacon IEs and DHCP hints
//! - In `--simulate` mode, fakes every collector and back-end for local dev

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use autonomy_common::protocol::LogLevel;
use autonomy_core::collect::CollectorFactory;
use autonomy_core::config::{BackendKind, Config};
use autonomy_core::controller::backend::{
    CommandRunner, MockWeightedBackend, Mwan3Backend, NetifdBackend, PolicyInterfaceState,
    RecordingRunner, ShellRunner,
};
use autonomy_core::controller::{Backend, Controller};
use autonomy_core::daemon::{Autonomy, LogLevelControl};
use autonomy_core::quota::CounterUsageProvider;
use autonomy_core::registry::{InterfaceDiscovery, StaticDiscovery, SysfsDiscovery};
use autonomy_core::scheduler;

/// Multi-WAN failover daemon.
#[derive(Parser, Debug)]
#[command(name = "autonomyd", about = "autonomy multi-WAN failover daemon")]
struct Cli {
    /// Configuration file path.
    #[arg(long, default_value = "/etc/autonomy/config.toml")]
    config: PathBuf,

    /// Compute everything but never touch the back-end.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Fake collectors and back-ends for development off-router.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Poll interval override in milliseconds.
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Initial log level (debug|info|warn|error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Bridges the `setlog` RPC to the tracing reload handle.
struct ReloadLogControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelControl for ReloadLogControl {
    fn set_level(&self, level: LogLevel) -> Result<(), String> {
        self.handle
            .reload(EnvFilter::new(level.as_str()))
            .map_err(|e| e.to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli)?;
    tracing::info!(
        config = %cli.config.display(),
        members = config.members.len(),
        backend = ?config.controller.backend,
        mode = ?config.controller.mode,
        dry_run = config.daemon.dry_run,
        simulate = cli.simulate,
        "autonomyd starting"
    );

    let runner: Arc<dyn CommandRunner> = if cli.simulate {
        Arc::new(RecordingRunner::new())
    } else {
        Arc::new(ShellRunner)
    };

    let backend = if cli.simulate {
        let mock = MockWeightedBackend::new();
        for member in &config.members {
            mock.set_status(&member.iface, PolicyInterfaceState::Online);
        }
        Backend::Weighted(Box::new(mock))
    } else {
        match config.controller.backend {
            BackendKind::Weighted => Backend::Weighted(Box::new(Mwan3Backend::new(runner.clone()))),
            BackendKind::RouteMetric => {
                Backend::RouteMetric(Box::new(NetifdBackend::new(runner.clone())))
            }
        }
    };

    let discovery: Box<dyn InterfaceDiscovery> = if cli.simulate {
        let ifaces: Vec<&str> = config.members.iter().map(|m| m.iface.as_str()).collect();
        Box::new(StaticDiscovery::up(&ifaces))
    } else {
        Box::new(SysfsDiscovery::new())
    };

    let usage = Arc::new(CounterUsageProvider::from_config(&config));
    let controller = Controller::new(config.controller.clone(), backend, config.daemon.dry_run);
    let collectors = CollectorFactory::new(runner.clone(), usage.clone(), cli.simulate);

    let root = Arc::new(Autonomy::new(
        config,
        controller,
        collectors,
        discovery,
        usage,
        runner,
    ));
    *root.log_control.lock().unwrap() = Some(Box::new(ReloadLogControl {
        handle: reload_handle,
    }));

    // ── Scheduler task ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_root = root.clone();
    let mut scheduler_handle = tokio::spawn(scheduler::run(scheduler_root, shutdown_rx));

    // ── SIGHUP: config reload ───────────────────────────────────
    #[cfg(unix)]
    {
        let reload_root = root.clone();
        let config_path = cli.config.clone();
        tokio::spawn(async move {
            let Ok(mut hup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hup.recv().await.is_some() {
                match read_config_file(&config_path) {
                    Ok(next) => match reload_root.config.reload(next) {
                        Ok(()) => tracing::info!("SIGHUP: configuration reloaded"),
                        Err(e) => {
                            tracing::error!(error = %e, "SIGHUP: reload rejected, previous config retained");
                        }
                    },
                    Err(e) => {
                        tracing::error!(error = %e, "SIGHUP: config unreadable, previous config retained");
                    }
                }
            }
        });
    }

    // ── Shutdown handling ───────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
            // The in-progress tick drains its collectors (bounded by
            // their deadlines) before the loop exits.
            let _ = (&mut scheduler_handle).await;
        }
        result = &mut scheduler_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "scheduler task failed");
                root.flush_events_to_log();
                anyhow::bail!("scheduler task failed");
            }
        }
    }

    tracing::info!("autonomyd stopped");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = if cli.config.exists() {
        read_config_file(&cli.config)?
    } else {
        tracing::warn!(
            path = %cli.config.display(),
            "config file missing, using built-in defaults"
        );
        Config::default()
    };
    if cli.dry_run {
        config.daemon.dry_run = true;
    }
    if let Some(interval) = cli.poll_interval_ms {
        config.daemon.poll_interval_ms = interval.max(100);
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

fn read_config_file(path: &PathBuf) -> anyhow::Result<Config> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
    Config::from_toml_str(&raw).map_err(|e| anyhow::anyhow!("{e}"))
}
