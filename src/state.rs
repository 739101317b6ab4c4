//! Persisted gateway state: message id allocation, pending bookkeeping, the
//! send-timestamp ring used by the rate limiter, and the keep-alive baseline.
//!
//! The state is one JSON object at `${dataDir}/state.json`, rewritten whole on
//! every persist. All fields live behind a single mutex; serialization happens
//! under the lock but the actual file write does not, keeping the critical
//! section short.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::config::limits::TimeInterval;
use crate::config::Config;
use crate::message::MessageId;

/// Unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateData {
    /// Send timestamps, newest first. Trimmed to the longest configured
    /// rate-limit window on every successful send.
    msg_timestamps: Vec<i64>,
    /// Highest id ever confirmed delivered.
    last_successful_message_id: Option<MessageId>,
    /// Allocated but not yet delivered, ordered by allocation.
    pending_message_ids: Vec<MessageId>,
    /// Next id to hand out.
    next_message_id: MessageId,
    last_keepalive_msg_enqueued: Option<i64>,
}

impl StateData {
    fn initial() -> StateData {
        StateData {
            msg_timestamps: Vec::new(),
            last_successful_message_id: None,
            pending_message_ids: Vec::new(),
            next_message_id: MessageId::FIRST,
            last_keepalive_msg_enqueued: None,
        }
    }
}

pub struct State {
    file: PathBuf,
    rate_limit1: Option<crate::config::limits::RateLimit>,
    rate_limit2: Option<crate::config::limits::RateLimit>,
    data: Mutex<StateData>,
}

impl State {
    /// Load `state.json` from the data directory, creating the directory and
    /// an empty state file on first start. A present-but-unreadable state
    /// file is fatal; the operator must repair it.
    pub fn load(config: &Config) -> Result<State> {
        let data_dir = Path::new(&config.data_directory);
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory '{}'", data_dir.display()))?;
        let file = data_dir.join("state.json");

        let existed = file.exists();
        let data = if existed {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("failed to read state file '{}'", file.display()))?;
            serde_json::from_str(&content).with_context(|| {
                format!("failed to deserialize JSON state file '{}'", file.display())
            })?
        } else {
            info!(
                "State file '{}' does not exist, creating an empty file",
                file.display()
            );
            StateData::initial()
        };

        let state = State {
            file,
            rate_limit1: config.rate_limit1,
            rate_limit2: config.rate_limit2,
            data: Mutex::new(data),
        };
        if !existed {
            state.flush()?;
        }
        Ok(state)
    }

    /// Hand out the next message id and mark it pending. Not persisted here;
    /// callers flush after they have durably stored the message itself.
    pub fn allocate_id(&self) -> MessageId {
        let mut data = self.data.lock().unwrap();
        let id = data.next_message_id;
        data.pending_message_ids.push(id);
        data.next_message_id = id.next();
        id
    }

    /// Roll back an allocation whose message could not be stored.
    pub fn discard_id(&self, id: MessageId) {
        let mut data = self.data.lock().unwrap();
        data.pending_message_ids.retain(|p| *p != id);
    }

    /// True when `id` was already confirmed delivered: not pending anymore and
    /// not newer than the last successful id.
    pub fn was_sent_already(&self, id: MessageId) -> bool {
        let data = self.data.lock().unwrap();
        if data.pending_message_ids.contains(&id) {
            return false;
        }
        matches!(data.last_successful_message_id, Some(last) if id <= last)
    }

    /// Record a confirmed delivery: clears the pending entry, advances the
    /// last-successful id, prepends the send timestamp and persists.
    ///
    /// Delivered ids must be strictly increasing; a violation means the
    /// scheduler attempted a duplicate or out-of-order send and aborts the
    /// process.
    pub fn remember_send(&self, id: MessageId) {
        let now = unix_now();
        let json = {
            let mut data = self.data.lock().unwrap();
            if let Some(last) = data.last_successful_message_id {
                if id <= last {
                    panic!(
                        "remember_send() called with message ID {} that is equal to/older than last successful message ID {}",
                        id, last
                    );
                }
            }
            data.pending_message_ids.retain(|p| *p != id);
            data.last_successful_message_id = Some(id);
            data.msg_timestamps.insert(0, now);
            match self.longest_window_seconds() {
                Some(window) => {
                    let cutoff = now - window;
                    data.msg_timestamps.retain(|ts| *ts >= cutoff);
                }
                // no rate limit configured, nothing ever needs counting
                None => data.msg_timestamps.clear(),
            }
            serde_json::to_string(&*data).expect("state serializes")
        };
        // Swallow write errors here, hoping a later persist succeeds; the
        // in-memory state is already updated.
        if let Err(e) = self.persist(&json) {
            error!("{:#}", e);
        }
    }

    fn longest_window_seconds(&self) -> Option<i64> {
        [&self.rate_limit1, &self.rate_limit2]
            .into_iter()
            .flatten()
            .map(|rl| rl.interval.as_seconds())
            .max()
    }

    /// Count of sends within `[now - interval, now]`. Timestamps are newest
    /// first, so the scan stops at the first entry outside the window.
    fn count_within(timestamps: &[i64], now: i64, interval: &TimeInterval) -> usize {
        let max_age = interval.as_seconds();
        timestamps
            .iter()
            .take_while(|ts| now - **ts <= max_age)
            .count()
    }

    pub fn any_rate_limit_exceeded(&self) -> bool {
        let data = self.data.lock().unwrap();
        if data.msg_timestamps.is_empty() {
            return false;
        }
        let now = unix_now();
        for (label, limit) in [("#1", &self.rate_limit1), ("#2", &self.rate_limit2)] {
            match limit {
                Some(rl) => {
                    let count = Self::count_within(&data.msg_timestamps, now, &rl.interval);
                    if rl.is_threshold_exceeded(count) {
                        error!("Rate limit {} ({}) exceeded, count = {}", label, rl, count);
                        return true;
                    }
                    debug!("Rate limit {} ({}) NOT exceeded, count = {}", label, rl, count);
                }
                None => debug!("Rate limit {} not configured", label),
            }
        }
        false
    }

    /// Timestamp of the most recent confirmed send, if any survives the
    /// rate-limit window trim.
    pub fn last_successful_send_ts(&self) -> Option<i64> {
        let data = self.data.lock().unwrap();
        data.msg_timestamps.first().copied()
    }

    pub fn last_keepalive_enqueued(&self) -> Option<i64> {
        let data = self.data.lock().unwrap();
        data.last_keepalive_msg_enqueued
    }

    pub fn set_last_keepalive_enqueued(&self, ts: i64) {
        let mut data = self.data.lock().unwrap();
        data.last_keepalive_msg_enqueued = Some(ts);
    }

    /// Serialize under the lock, write outside of it.
    pub fn flush(&self) -> Result<()> {
        let json = {
            let data = self.data.lock().unwrap();
            serde_json::to_string(&*data).expect("state serializes")
        };
        self.persist(&json)
    }

    fn persist(&self, json: &str) -> Result<()> {
        debug!("Persisting application state to {}", self.file.display());
        fs::write(&self.file, json)
            .with_context(|| format!("failed to write state file '{}'", self.file.display()))
    }

    #[cfg(test)]
    fn push_timestamp(&self, ts: i64) {
        // keeps newest-first order up to the caller
        self.data.lock().unwrap().msg_timestamps.push(ts);
    }

    #[cfg(test)]
    fn timestamps(&self) -> Vec<i64> {
        self.data.lock().unwrap().msg_timestamps.clone()
    }

    #[cfg(test)]
    fn pending(&self) -> Vec<MessageId> {
        self.data.lock().unwrap().pending_message_ids.clone()
    }

    /// Highest id confirmed delivered, if any.
    pub fn last_successful_message_id(&self) -> Option<MessageId> {
        self.data.lock().unwrap().last_successful_message_id
    }

    /// The id the next allocation will return.
    pub fn next_message_id(&self) -> MessageId {
        self.data.lock().unwrap().next_message_id
    }
}
