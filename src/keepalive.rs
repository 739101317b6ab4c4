//! Keep-alive worker.
//!
//! Prepaid SIM cards get deactivated when they stay silent for too long. When
//! `sms.keepAliveInterval` is configured, this worker checks once per second
//! whether anything (real message or previous keep-alive) left the gateway
//! recently, and enqueues the configured keep-alive text when the quiet period
//! grows too long. The message goes through the normal inbox, so the delivery
//! scheduler, rate limits and retry machinery all apply; the modem is never
//! touched from here.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::limits::TimeInterval;
use crate::config::Config;
use crate::state::{unix_now, State};
use crate::storage::Storage;

/// Start the worker, or return `None` when no keep-alive is configured.
pub fn spawn(
    config: Arc<Config>,
    state: Arc<State>,
    storage: Arc<Storage>,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let Some(interval) = config.keep_alive_interval else {
        info!("No keep-alive interval configured, won't start worker.");
        return None;
    };
    Some(tokio::spawn(async move {
        info!("Keep-alive worker started");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => run_tick(&config, &state, &storage, &interval),
                _ = shutdown.changed() => break,
            }
        }
        info!("Keep-alive worker terminated.");
    }))
}

/// One keep-alive tick. Public so the scheduling rules can be exercised
/// without waiting on wall-clock intervals.
pub fn run_tick(config: &Config, state: &State, storage: &Storage, interval: &TimeInterval) {
    let last_send = state.last_successful_send_ts();
    let last_keepalive = state.last_keepalive_enqueued();
    let latest = match (last_send, last_keepalive) {
        (None, None) => {
            debug!("Keep-alive not active yet, no messages were ever sent");
            return;
        }
        (Some(a), Some(b)) => a.max(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
    };

    let now = unix_now();
    if now - latest > interval.as_seconds() {
        debug!("Scheduling keep-alive message");
        let id = state.allocate_id();
        match storage.enqueue(id, &config.keep_alive_message) {
            Ok(_) => {
                info!("Successfully scheduled keep-alive message {}", id);
                state.set_last_keepalive_enqueued(now);
                if let Err(e) = state.flush() {
                    error!("{:#}", e);
                }
            }
            Err(e) => {
                error!("Failed to schedule keep-alive message: {:#}", e);
                state.discard_id(id);
            }
        }
    }
}
