//! Session wiring: platform selection, alarm selection, signal handling.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use vbeacon_core::config::AlarmConfig;
use vbeacon_core::{
    Advertiser, AdvertisingService, AlarmSink, BeaconError, BeaconService, CommandAlarm, Config,
    ConfigError, LogAlarm, RunSummary, ScanSource, Scanner,
};

/// Errors that end the daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The beacon session failed to start.
    #[error(transparent)]
    Session(#[from] BeaconError),

    /// The blocking session task panicked or was cancelled.
    #[error("Beacon session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DaemonError {
    /// Process exit code for this error.
    ///
    /// Codes follow `sysexits.h` so a supervisor can tell configuration
    /// mistakes from missing hardware.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 78,
            Self::Session(e) if e.is_config_error() => 78,
            Self::Session(e) if e.is_advertiser_error() => 69,
            Self::Session(e) if e.is_scan_error() => 74,
            Self::Session(_) | Self::Task(_) => 70,
        }
    }

    /// Short description for the final log line.
    #[must_use]
    pub const fn summary(&self) -> &'static str {
        match self {
            Self::Config(_) => "Invalid configuration",
            Self::Session(e) if e.is_advertiser_error() => "Could not advertise",
            Self::Session(e) if e.is_scan_error() => "Could not scan",
            Self::Session(_) => "Beacon session failed",
            Self::Task(_) => "Beacon session crashed",
        }
    }
}

/// Load the configuration from `path`.
///
/// A missing file at the default location falls back to built-in defaults;
/// a missing file that was asked for explicitly is an error.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, parsed or validated.
pub fn load_config(path: &Path, explicit: bool) -> Result<Config, ConfigError> {
    if explicit {
        Config::load(path)
    } else {
        Config::load_or_default(path)
    }
}

/// Build the alarm sink named by the configuration.
#[must_use]
pub fn build_alarm(config: &AlarmConfig) -> Arc<dyn AlarmSink> {
    match config.command.as_deref().and_then(CommandAlarm::from_command_line) {
        Some(alarm) => {
            info!(program = alarm.program(), "Using command alarm");
            Arc::new(alarm)
        }
        None => Arc::new(LogAlarm),
    }
}

#[cfg(all(feature = "bluetooth", not(feature = "mock-bluetooth")))]
fn platform(config: &Config) -> (Box<dyn AdvertisingService>, Box<dyn ScanSource>) {
    use vbeacon_core::{BluezAdvertising, BluezScanSource};

    let adapter = config.scan.adapter.clone();
    (
        Box::new(BluezAdvertising::new(adapter.clone())),
        Box::new(BluezScanSource::new(adapter)),
    )
}

#[cfg(any(feature = "mock-bluetooth", not(feature = "bluetooth")))]
fn platform(_config: &Config) -> (Box<dyn AdvertisingService>, Box<dyn ScanSource>) {
    use vbeacon_core::{MockAdvertising, MockRadio};

    warn!("Built without a Bluetooth backend; using the in-memory radio");
    (
        Box::new(MockAdvertising::new()),
        Box::new(MockRadio::new().source()),
    )
}

/// Assemble a beacon service for `config` on the compiled-in platform.
#[must_use]
pub fn build_service(config: &Config) -> BeaconService {
    let (advertising, scan_source) = platform(config);

    let advertiser = Advertiser::new(advertising)
        .with_type(config.beacon.advertising_type)
        .with_company_id(config.beacon.company_id);
    let scanner = Scanner::new(scan_source)
        .with_poll_timeout(config.scan.poll_timeout())
        .with_batch_size(config.scan.batch_size);

    BeaconService::new(
        config.service_config(),
        advertiser,
        scanner,
        build_alarm(&config.alarm),
    )
}

/// Run one session, stopping early on Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns [`DaemonError::Session`] if the beacon could not start, or
/// [`DaemonError::Task`] if the session thread panicked.
pub async fn run(config: &Config) -> Result<RunSummary, DaemonError> {
    info!(
        uuid = %config.beacon.uuid,
        device = %config.identity().device_key(),
        name = config.beacon.name.as_deref().unwrap_or("-"),
        org = config.beacon.org.as_deref().unwrap_or("-"),
        "Starting beacon session"
    );

    let mut service = build_service(config);
    let stop = service.stop_handle();

    let session = tokio::task::spawn_blocking(move || service.run());
    tokio::pin!(session);

    let joined = tokio::select! {
        joined = &mut session => joined,
        () = shutdown_signal() => {
            info!("Shutdown signal received; stopping beacon session");
            stop.stop();
            session.await
        }
    };

    let summary = joined??;
    Ok(summary)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
