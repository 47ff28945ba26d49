//! The agent daemon: configuration, monitor wiring, signal handling.

mod config;
mod process;
mod report;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::signal::unix::{signal, SignalKind};

use filegate_core::profile::{default_profile, FileFilter, FilterBehavior, PolicyMode};
use fsmon::{FileMonitor, LocalPathWalker, MonitorConfig, WatchConfig};

pub use config::AgentConfig;
pub use process::ProcfsLookup;
pub use report::ConsoleReporter;

#[derive(Args, Debug, Clone)]
pub struct AgentOpts {
    /// Read configuration from a custom file
    #[clap(long, short)]
    pub config_file: Option<String>,
}

/// Run the agent until it is signalled.
pub async fn run(opts: &AgentOpts) -> Result<()> {
    let config = match &opts.config_file {
        Some(file) => AgentConfig::with_custom_file(file)?,
        None => AgentConfig::new()?,
    };
    let monitor_config = config.section("monitor");

    let enabled = monitor_config.with_default("enabled", true)?;
    let aufs = monitor_config.with_default("aufs", false)?;
    let nv_protect = monitor_config.with_default("nv_protect", false)?;
    let trace = monitor_config.with_default("trace", false)?;
    let mode: PolicyMode = monitor_config.with_default("mode", PolicyMode::Evaluate)?;

    let monitor = FileMonitor::new(MonitorConfig {
        profile_enable: enabled,
        is_aufs: aufs,
        enable_trace: trace,
        nv_protect,
        walker: Arc::new(LocalPathWalker),
        lookup: Arc::new(ProcfsLookup),
        control: Arc::new(ConsoleReporter),
    })
    .context("starting the file monitor")?;

    // The host itself is always watched; containers join as they are
    // discovered by the surrounding platform.
    let mut profile = default_profile();
    profile.group = "nodes".to_string();
    profile.mode = Some(mode);
    for path in monitor_config.get_list::<String>("watch_paths")? {
        profile
            .filters
            .push(FileFilter::new(&path, "", false, FilterBehavior::Monitor));
    }
    monitor
        .start_watch("", 1, WatchConfig { profile, rule: None }, false, false)
        .await;
    log::info!("watching the host root in {mode} mode");

    let mut sigterm = signal(SignalKind::terminate()).context("installing signal handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("interrupted"),
        _ = sigterm.recv() => log::info!("terminated"),
    }

    if let Some(probe) = monitor.probe_data() {
        log::debug!(
            "shutting down with {} groups, {} pending events",
            probe.groups,
            probe.events
        );
    }
    monitor.close();
    Ok(())
}
