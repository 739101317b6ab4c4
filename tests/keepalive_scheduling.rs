//! Keep-alive scheduling rules, driven tick by tick.

mod common;

use common::{file_names, gateway, Gateway};
use sms_gateway::keepalive;
use sms_gateway::state::unix_now;

const KEEPALIVE: &str = "keepAliveInterval = 1m\nkeepAliveMessage = ping";

fn tick(gw: &Gateway) {
    let interval = gw.config.keep_alive_interval.unwrap();
    keepalive::run_tick(&gw.config, &gw.state, &gw.storage, &interval);
}

#[test]
fn no_baseline_means_no_keepalive() {
    let gw = gateway("", KEEPALIVE);
    tick(&gw);
    assert!(file_names(gw.storage.inbox_dir()).is_empty());
    assert!(gw.state.last_keepalive_enqueued().is_none());
}

#[test]
fn expired_quiet_period_enqueues_exactly_one_keepalive() {
    let gw = gateway("", KEEPALIVE);
    // baseline: the last keep-alive went out two minutes ago
    gw.state.set_last_keepalive_enqueued(unix_now() - 120);

    tick(&gw);

    let files = file_names(gw.storage.inbox_dir());
    assert_eq!(files.len(), 1);
    let enqueued_at = gw.state.last_keepalive_enqueued().unwrap();
    assert!((unix_now() - enqueued_at) <= 2);

    let messages = gw.storage.scan_inbox().unwrap();
    assert_eq!(gw.storage.read_body(&messages[0]).unwrap(), b"ping");

    // the fresh baseline suppresses an immediate second one
    tick(&gw);
    assert_eq!(file_names(gw.storage.inbox_dir()).len(), 1);
}

#[test]
fn recent_activity_suppresses_keepalive() {
    let gw = gateway("", KEEPALIVE);
    gw.state.set_last_keepalive_enqueued(unix_now() - 30);
    tick(&gw);
    assert!(file_names(gw.storage.inbox_dir()).is_empty());
}

#[test]
fn keepalive_goes_through_the_normal_delivery_path() {
    let gw = gateway("debugFlags = modem_always_succeed", KEEPALIVE);
    gw.state.set_last_keepalive_enqueued(unix_now() - 120);
    tick(&gw);
    gw.worker.run_tick();
    assert!(file_names(gw.storage.inbox_dir()).is_empty());
    assert_eq!(file_names(gw.storage.sent_dir()).len(), 1);
}
