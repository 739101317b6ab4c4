//! Binary entrypoint for the SMS gateway daemon.
//!
//! Usage: `sms-gateway [OPTIONS] <CONFIG>`
//!
//! Loads the INI configuration, restores persisted state, probes the modem,
//! then runs four cooperating workers until SIGINT/SIGTERM:
//! the HTTP ingestion API, the delivery scheduler, the optional keep-alive
//! worker and the config-file watcher. Shutdown finishes the send in
//! progress, drains the HTTP server for up to two seconds and flushes the
//! state to disk. Exits nonzero on any startup failure (bad config, missing
//! data directories, unbindable socket, dead modem).

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use sms_gateway::api::{self, ApiContext};
use sms_gateway::config::{self, Config};
use sms_gateway::delivery::failures::FailureTracker;
use sms_gateway::delivery::DeliveryWorker;
use sms_gateway::keepalive;
use sms_gateway::modem::Modem;
use sms_gateway::state::State;
use sms_gateway::storage::Storage;

#[derive(Parser)]
#[command(name = "sms-gateway")]
#[command(about = "SMS gateway: HTTP in, serial cellular modem out")]
#[command(version)]
struct Cli {
    /// Path to the INI configuration file
    config: String,

    /// Send a test SMS right after startup
    #[arg(long)]
    test: bool,

    /// Verbose logging (-v for debug, -vv for trace); overrides the configured level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(config: &Config, verbosity: u8) {
    let mut builder = env_logger::Builder::new();
    // The builder passes everything through; the effective level is gated via
    // log::set_max_level so the config watcher can adjust it at runtime.
    builder.filter_level(log::LevelFilter::Trace);
    builder.format(|fmt, record| {
        writeln!(
            fmt,
            "{} [{}] {} - {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    let _ = builder.try_init();
    let level = match verbosity {
        0 => config.log_level,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    log::set_max_level(level);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Arc::new(Config::load_or_bootstrap(&cli.config)?);
    init_logging(&config, cli.verbose);
    info!("sms-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    let state = Arc::new(State::load(&config)?);
    let storage = Arc::new(Storage::open(&config.data_directory)?);
    let modem = Arc::new(Modem::new(config.clone(), state.clone()));
    // Fail fast on a dead device or bad init commands; the scheduler reopens
    // the port on demand.
    modem.probe()?;

    let failures = Arc::new(FailureTracker::new());
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    config::watcher::start(cli.config.clone());

    let worker = DeliveryWorker::new(
        config.clone(),
        state.clone(),
        storage.clone(),
        modem.clone(),
        failures.clone(),
        shutdown_flag.clone(),
    );
    let worker_handle = worker.spawn();

    let keepalive_handle = keepalive::spawn(
        config.clone(),
        state.clone(),
        storage.clone(),
        shutdown_rx.clone(),
    );

    let api = Arc::new(ApiContext {
        config: config.clone(),
        state: state.clone(),
        storage: storage.clone(),
        modem: modem.clone(),
        started_at: Utc::now(),
    });
    let listener = api::bind(&config).await?;
    info!("REST API listening on {}", listener.local_addr()?);
    let mut http_handle = tokio::spawn(api::serve(listener, api, shutdown_rx.clone()));

    if cli.test {
        let test_modem = modem.clone();
        let result =
            tokio::task::spawn_blocking(move || test_modem.send_sms("test SMS, please ignore"))
                .await?;
        if !result.success {
            warn!("Test SMS failed: {} ({})", result.reason, result.details);
        }
        modem.close();
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down, received SIGINT"),
        _ = sigterm.recv() => info!("Shutting down, received SIGTERM"),
    }

    // Order matters: stop producing sends, let the current send finish, then
    // drain HTTP and make the final state durable.
    shutdown_flag.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(true);

    let _ = tokio::task::spawn_blocking(move || worker_handle.join()).await;
    if let Some(handle) = keepalive_handle {
        let _ = handle.await;
    }
    match tokio::time::timeout(Duration::from_secs(2), &mut http_handle).await {
        Ok(Ok(Err(e))) => error!("REST API server error: {:#}", e),
        Ok(_) => {}
        Err(_) => {
            warn!("REST API did not drain within 2 seconds, aborting it");
            http_handle.abort();
        }
    }

    state.flush()?;
    info!("Shutdown complete");
    Ok(())
}
