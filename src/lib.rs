//! filegate is a host-resident security agent that monitors file
//! integrity and access inside every container on the host.
//!
//! The agent binary is a thin shell: it parses the command line, loads
//! the INI configuration, wires the monitor core
//! ([`fsmon::FileMonitor`]) to its collaborators (process lookup over
//! procfs, an in-process path walker, a console report sink) and runs
//! until it is signalled.
//!
//! The interesting machinery lives in the workspace crates:
//!
//! - `filegate-core`: the shared data model (profiles, events, process
//!   identity) and procfs parsing
//! - `fsmon`: the kernel-coupled monitor (fanotify and inotify
//!   drivers, event aggregation, classification, rule learning)

pub mod agentd;

/// Init logger. We log from info level and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level = override_log_level.unwrap_or(log::LevelFilter::Info);
        env_logger::builder().filter_level(level).init();
    }
}

/// Print an error with its full source chain.
pub fn report_error(err: &anyhow::Error) {
    eprintln!("error: {err:?}");
}
