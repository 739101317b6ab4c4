//! Test fixtures: a fully wired gateway on a temp directory.
//!
//! The modem debug flags (`modem_always_succeed` / `modem_always_fail`) stand
//! in for hardware, so the delivery pipeline can be driven tick by tick.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tempfile::TempDir;

use sms_gateway::config::Config;
use sms_gateway::delivery::failures::FailureTracker;
use sms_gateway::delivery::DeliveryWorker;
use sms_gateway::modem::Modem;
use sms_gateway::state::State;
use sms_gateway::storage::Storage;

#[allow(dead_code)]
pub struct Gateway {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub state: Arc<State>,
    pub storage: Arc<Storage>,
    pub modem: Arc<Modem>,
    pub failures: Arc<FailureTracker>,
    pub worker: DeliveryWorker,
}

/// Build a gateway in a fresh temp directory. `extra_common` / `extra_sms`
/// are appended to the respective INI sections.
#[allow(dead_code)]
pub fn gateway(extra_common: &str, extra_sms: &str) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    build(dir, extra_common, extra_sms)
}

/// Rebuild a gateway on the same directory, as a restart would.
#[allow(dead_code)]
pub fn restart(gw: Gateway, extra_common: &str, extra_sms: &str) -> Gateway {
    let Gateway { dir, .. } = gw;
    build(dir, extra_common, extra_sms)
}

#[allow(dead_code)]
pub fn build(dir: TempDir, extra_common: &str, extra_sms: &str) -> Gateway {
    let ini = format!(
        r#"
[common]
dataDirectory = {data}
{extra_common}

[restapi]
bindIp = 127.0.0.1
port = 8080
user = api
password = secret

[sms]
recipients = +491701111111
{extra_sms}

[modem]
simPin = 0000
serialPort = /dev/null
serialSpeed = 115200
serialReadTimeoutSeconds = 1
"#,
        data = dir.path().join("data").display(),
    );
    let config_path = dir.path().join("gateway.conf");
    std::fs::write(&config_path, ini).unwrap();

    let config = Arc::new(Config::load(config_path.to_str().unwrap()).unwrap());
    let state = Arc::new(State::load(&config).unwrap());
    let storage = Arc::new(Storage::open(&config.data_directory).unwrap());
    let modem = Arc::new(Modem::new(config.clone(), state.clone()));
    let failures = Arc::new(FailureTracker::new());
    let worker = DeliveryWorker::new(
        config.clone(),
        state.clone(),
        storage.clone(),
        modem.clone(),
        failures.clone(),
        Arc::new(AtomicBool::new(false)),
    );
    Gateway {
        dir,
        config,
        state,
        storage,
        modem,
        failures,
        worker,
    }
}

#[allow(dead_code)]
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
