//! Per-message delivery failure tracking with cubic backoff.
//!
//! Failure counts are process-local; a restart retries everything still in
//! the inbox immediately. The retry delay is `min(count, 10)³` seconds —
//! cheap to compute, ~16 minutes from the fifth failure on, bounded forever.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, trace};

use crate::message::MessageId;
use crate::state::unix_now;

#[derive(Debug, Clone, Copy)]
struct DeliveryFailure {
    count: u32,
    last_failure_ts: i64,
}

fn backoff_seconds(count: u32) -> i64 {
    let capped = count.min(10) as i64;
    capped * capped * capped
}

#[derive(Default)]
pub struct FailureTracker {
    failures: Mutex<HashMap<MessageId, DeliveryFailure>>,
}

impl FailureTracker {
    pub fn new() -> FailureTracker {
        FailureTracker::default()
    }

    /// A message with no recorded failure is always due; otherwise it becomes
    /// due once the backoff delay after the last failure has elapsed.
    pub fn is_due(&self, id: MessageId) -> bool {
        self.is_due_at(id, unix_now())
    }

    fn is_due_at(&self, id: MessageId, now: i64) -> bool {
        let failures = self.failures.lock().unwrap();
        let Some(failure) = failures.get(&id) else {
            return true;
        };
        let delay = backoff_seconds(failure.count);
        let due_date = failure.last_failure_ts + delay;
        let is_due = now >= due_date;
        trace!(
            "Msg {} has {} delivery failures, {} seconds delay, due at {} => is_due: {}",
            id,
            failure.count,
            delay,
            due_date,
            is_due
        );
        is_due
    }

    pub fn record_failure(&self, id: MessageId) {
        let mut failures = self.failures.lock().unwrap();
        let entry = failures.entry(id).or_insert(DeliveryFailure {
            count: 0,
            last_failure_ts: 0,
        });
        entry.count += 1;
        entry.last_failure_ts = unix_now();
        debug!("Msg {} now has {} delivery failures", id, entry.count);
    }

    /// Delivery was given up on; forget the entry.
    pub fn abort(&self, id: MessageId) {
        self.failures.lock().unwrap().remove(&id);
    }

    pub fn clear(&self, id: MessageId) {
        if self.failures.lock().unwrap().remove(&id).is_some() {
            debug!("Msg {} got delivered successfully", id);
        }
    }

    #[cfg(test)]
    fn set(&self, id: MessageId, count: u32, last_failure_ts: i64) {
        self.failures.lock().unwrap().insert(
            id,
            DeliveryFailure {
                count,
                last_failure_ts,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_cubic_and_capped() {
        assert_eq!(backoff_seconds(0), 0);
        assert_eq!(backoff_seconds(1), 1);
        assert_eq!(backoff_seconds(2), 8);
        assert_eq!(backoff_seconds(5), 125);
        assert_eq!(backoff_seconds(10), 1000);
        assert_eq!(backoff_seconds(11), 1000);
        assert_eq!(backoff_seconds(1000), 1000);
    }

    #[test]
    fn unknown_messages_are_due() {
        let tracker = FailureTracker::new();
        assert!(tracker.is_due(MessageId::new(1)));
    }

    #[test]
    fn due_no_earlier_than_backoff() {
        let tracker = FailureTracker::new();
        let id = MessageId::new(1);
        let now = 1_700_000_000;
        tracker.set(id, 3, now);
        assert!(!tracker.is_due_at(id, now));
        assert!(!tracker.is_due_at(id, now + 26));
        assert!(tracker.is_due_at(id, now + 27));
        assert!(tracker.is_due_at(id, now + 1000));
    }

    #[test]
    fn record_failure_increments() {
        let tracker = FailureTracker::new();
        let id = MessageId::new(2);
        tracker.record_failure(id);
        // one failure = one second of delay
        assert!(!tracker.is_due_at(id, unix_now()));
        assert!(tracker.is_due_at(id, unix_now() + 1));
        tracker.record_failure(id);
        assert!(!tracker.is_due_at(id, unix_now() + 7));
    }

    #[test]
    fn clear_and_abort_reset_the_gate() {
        let tracker = FailureTracker::new();
        let id = MessageId::new(3);
        tracker.record_failure(id);
        tracker.clear(id);
        assert!(tracker.is_due(id));
        tracker.record_failure(id);
        tracker.abort(id);
        assert!(tracker.is_due(id));
    }
}
