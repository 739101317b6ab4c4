//! HTTP surface: auth, enqueue, validation and the status page, exercised
//! against a real listener.

mod common;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use common::{file_names, gateway, Gateway};
use sms_gateway::api::{self, ApiContext};
use sms_gateway::message::MessageId;

async fn start_api(gw: &Gateway) -> (String, watch::Sender<bool>) {
    let api = Arc::new(ApiContext {
        config: gw.config.clone(),
        state: gw.state.clone(),
        storage: gw.storage.clone(),
        modem: gw.modem.clone(),
        started_at: Utc::now(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind api");
    let addr = listener.local_addr().expect("api addr");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(api::serve(listener, api, shutdown_rx));
    (format!("http://{}", addr), shutdown_tx)
}

#[tokio::test]
async fn sendsms_requires_basic_auth() {
    let gw = gateway("debugFlags = modem_always_succeed", "");
    let (base, _shutdown) = start_api(&gw).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/sendsms"))
        .json(&serde_json::json!({"message": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(format!("{base}/sendsms"))
        .basic_auth("api", Some("wrong"))
        .json(&serde_json::json!({"message": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert!(file_names(gw.storage.inbox_dir()).is_empty());
}

#[tokio::test]
async fn sendsms_allocates_an_id_and_enqueues() {
    let gw = gateway("debugFlags = modem_always_succeed", "");
    let (base, _shutdown) = start_api(&gw).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/sendsms"))
        .basic_auth("api", Some("secret"))
        .json(&serde_json::json!({"message": "hello from http"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 1);

    let files = file_names(gw.storage.inbox_dir());
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("1_"));

    // the allocation is durable: a restart must not reuse the id
    let gw = common::restart(gw, "debugFlags = modem_always_succeed", "");
    assert!(gw.state.next_message_id() >= MessageId::new(2));
}

#[tokio::test]
async fn blank_message_is_a_server_error() {
    let gw = gateway("debugFlags = modem_always_succeed", "");
    let (base, _shutdown) = start_api(&gw).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/sendsms"))
        .basic_auth("api", Some("secret"))
        .json(&serde_json::json!({"message": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    assert!(file_names(gw.storage.inbox_dir()).is_empty());
    // nothing was allocated for the rejected request
    assert_eq!(gw.state.next_message_id(), MessageId::new(1));
}

#[tokio::test]
async fn status_reports_registration_and_uptime() {
    let gw = gateway("debugFlags = modem_always_succeed", "");
    let (base, _shutdown) = start_api(&gw).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/status"))
        .basic_auth("api", Some("secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["operational"], true);
    assert_eq!(body["network_status"], "REGISTERED_HOME");
    assert!(body["uptime_in_seconds"].as_i64().unwrap() >= 0);
    assert!(body["startup_time"].as_str().unwrap().contains('T'));
}
