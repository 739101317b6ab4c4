//! Enqueue → deliver round trips through the scheduler, with the modem
//! stubbed via debug flags.

mod common;

use common::{file_names, gateway};
use sms_gateway::message::MessageId;

#[test]
fn enqueue_deliver_round_trip() {
    let gw = gateway("debugFlags = modem_always_succeed", "rateLimit1 = 100/1h");

    let id = gw.state.allocate_id();
    assert_eq!(id, MessageId::new(1));
    gw.storage.enqueue(id, "hello world").unwrap();
    assert_eq!(file_names(gw.storage.inbox_dir()).len(), 1);

    gw.worker.run_tick();

    assert_eq!(gw.state.last_successful_message_id(), Some(id));
    assert!(gw.state.was_sent_already(id));
    assert!(gw.state.last_successful_send_ts().is_some());
    assert!(file_names(gw.storage.inbox_dir()).is_empty());
    let sent = file_names(gw.storage.sent_dir());
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("1_"));
}

#[test]
fn deliveries_are_ordered_by_id_not_by_filename() {
    let gw = gateway("debugFlags = modem_always_succeed", "");

    // allocate up to id 11 so the inbox holds "10_*" (lexically before "9_*")
    for _ in 0..11 {
        gw.state.allocate_id();
    }
    for id in [9i64, 10, 11] {
        gw.storage
            .enqueue(MessageId::new(id), &format!("m{id}"))
            .unwrap();
    }

    // a lexical delivery order would trip the id-monotonicity assertion
    gw.worker.run_tick();

    assert_eq!(
        gw.state.last_successful_message_id(),
        Some(MessageId::new(11))
    );
    assert_eq!(file_names(gw.storage.sent_dir()).len(), 3);
}

#[test]
fn empty_inbox_tick_is_a_no_op() {
    let gw = gateway("debugFlags = modem_always_succeed", "");
    gw.worker.run_tick();
    assert_eq!(gw.state.last_successful_message_id(), None);
    assert!(file_names(gw.storage.sent_dir()).is_empty());
}
