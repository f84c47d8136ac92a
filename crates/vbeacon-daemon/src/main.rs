//! # vbeacon-daemon
//!
//! Runs one proximity beacon session and exits.
//!
//! ## Running
//!
//! ```bash
//! # Development, with the in-memory radio
//! cargo run --package vbeacon-daemon --features mock-bluetooth
//!
//! # Production (on Raspberry Pi)
//! VBEACON_ENV=production ./vbeacon-daemon /etc/vbeacon/config.toml
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};
use vbeacon_core::{Config, RunOutcome};
use vbeacon_daemon::{app, logging};

#[tokio::main]
async fn main() -> ExitCode {
    // Held until the end of main so the final lines reach the log file.
    let log_guards = match logging::init(logging::is_production()) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let (config_path, explicit) = std::env::args_os()
        .nth(1)
        .map_or_else(|| (Config::default_path(), false), |arg| (PathBuf::from(arg), true));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting vbeacon-daemon"
    );

    let result = match app::load_config(&config_path, explicit) {
        Ok(config) => app::run(&config).await,
        Err(e) => Err(e.into()),
    };

    let code = match result {
        Ok(summary) => {
            let reason = match summary.outcome {
                RunOutcome::Completed => "duration elapsed",
                RunOutcome::StopRequested => "stop requested",
            };
            info!(
                ticks = summary.ticks,
                alarms = summary.alarms,
                reason,
                "Beacon session finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(code = e.exit_code(), error = %e, "{}", e.summary());
            ExitCode::from(e.exit_code())
        }
    };

    drop(log_guards);
    code
}
