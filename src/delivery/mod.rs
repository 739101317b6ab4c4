//! Delivery scheduler.
//!
//! A single worker thread scans the inbox once per second and pushes every
//! due message through the modem session. Deliveries within one tick are
//! strictly sequential and ordered by ascending id — confirmed ids must be
//! strictly increasing (see [`crate::state::State::remember_send`]), so older
//! retries always go before newer messages. Serial I/O blocks, which is why
//! this runs on its own thread rather than a tokio task.

pub mod failures;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::config::Config;
use crate::message::Message;
use crate::modem::{FailureReason, Modem};
use crate::state::State;
use crate::storage::Storage;
use failures::FailureTracker;

pub struct DeliveryWorker {
    config: Arc<Config>,
    state: Arc<State>,
    storage: Arc<Storage>,
    modem: Arc<Modem>,
    failures: Arc<FailureTracker>,
    shutdown: Arc<AtomicBool>,
}

impl DeliveryWorker {
    pub fn new(
        config: Arc<Config>,
        state: Arc<State>,
        storage: Arc<Storage>,
        modem: Arc<Modem>,
        failures: Arc<FailureTracker>,
        shutdown: Arc<AtomicBool>,
    ) -> DeliveryWorker {
        DeliveryWorker {
            config,
            state,
            storage,
            modem,
            failures,
            shutdown,
        }
    }

    /// Run the 1 s tick loop until shutdown is flagged. A send in progress is
    /// finished before the flag is honored at the next tick boundary.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("delivery".to_string())
            .spawn(move || {
                info!("Starting to watch inbox");
                while !self.shutdown.load(Ordering::SeqCst) {
                    self.run_tick();
                    thread::sleep(Duration::from_secs(1));
                }
                info!("Stopping to watch inbox");
            })
            .expect("failed to spawn delivery thread")
    }

    /// One scheduler tick: scan, filter by backoff, deliver in id order.
    pub fn run_tick(&self) {
        let messages = match self.storage.scan_inbox() {
            Ok(messages) => messages,
            Err(e) => {
                error!("{:#}", e);
                return;
            }
        };
        for msg in messages {
            if !self.failures.is_due(msg.id) {
                continue;
            }
            if self.state.was_sent_already(msg.id) {
                // stale artifact from a previous run; the send is already
                // recorded, so the file must not be delivered again
                warn!("Deleting stale inbox entry {}", msg);
                if let Err(e) = self.storage.delete(&msg) {
                    warn!("{:#}", e);
                }
                self.failures.clear(msg.id);
                continue;
            }
            self.deliver(&msg);
        }
    }

    fn deliver(&self, msg: &Message) {
        let body = match self.storage.read_body(msg) {
            Ok(body) => body,
            Err(e) => {
                error!("{:#}", e);
                self.failures.record_failure(msg.id);
                return;
            }
        };
        if body.is_empty() {
            info!(
                "File {} has length of zero bytes, just deleting it.",
                msg.path.display()
            );
            if let Err(e) = self.storage.delete(msg) {
                warn!("{:#}", e);
            }
            return;
        }

        let text = String::from_utf8_lossy(&body);
        let result = self.modem.send_sms(&text);
        if result.success {
            info!("Message sent successfully: {}", msg);
            self.state.remember_send(msg.id);
            // A failed move stays in the inbox and is cleaned up as a stale
            // entry on the next tick; remember_send above prevents a resend.
            if let Err(e) = self.storage.mark_sent(msg) {
                error!("{:#}", e);
            }
            self.failures.clear(msg.id);
            return;
        }

        match result.reason {
            FailureReason::RateLimitExceeded if self.config.drop_on_rate_limit => {
                match self.storage.delete(msg) {
                    Ok(()) => warn!("DISCARDED message '{}' after rate limit got exceeded", msg),
                    Err(e) => warn!("{:#}", e),
                }
                self.failures.abort(msg.id);
            }
            _ => {
                error!(
                    "Failed to send '{}' - {}: {}",
                    msg.path.display(),
                    result.reason,
                    result.details
                );
                self.failures.record_failure(msg.id);
            }
        }
    }
}
