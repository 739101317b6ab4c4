//! Config-file watcher.
//!
//! Watches the directory containing the config file and reloads the file when
//! it is written or replaced. The only setting applied at runtime is
//! `common.logLevel`; everything else requires a restart. A reload that fails
//! validation keeps the current configuration.

use std::ffi::OsString;
use std::path::Path;
use std::thread;

use inotify::{Inotify, WatchMask};
use log::{debug, error, info};

use super::Config;

/// Start watching `config_path` on a detached background thread. Errors while
/// setting up the watch are logged and disable live reload for this run.
pub fn start(config_path: String) {
    let builder = thread::Builder::new().name("config-watcher".to_string());
    if let Err(e) = builder.spawn(move || watch_loop(&config_path)) {
        error!("Failed to start config watcher thread: {}", e);
    }
}

fn watch_loop(config_path: &str) {
    let path = Path::new(config_path);
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name: OsString = match path.file_name() {
        Some(n) => n.to_os_string(),
        None => {
            error!("Cannot watch config path without a file name: {}", config_path);
            return;
        }
    };

    let mut inotify = match Inotify::init() {
        Ok(i) => i,
        Err(e) => {
            error!("Failed to create config watcher: {}", e);
            return;
        }
    };
    // Editors replace files as often as they write them in place, so watch for
    // writes, creations and renames targeting the config file name.
    let mask = WatchMask::CLOSE_WRITE | WatchMask::CREATE | WatchMask::MOVED_TO | WatchMask::MODIFY;
    if let Err(e) = inotify.watches().add(dir, mask) {
        error!("Failed to watch directory {}: {}", dir.display(), e);
        return;
    }
    info!("Watching for changes on {}", config_path);

    let mut buffer = [0u8; 4096];
    loop {
        let events = match inotify.read_events_blocking(&mut buffer) {
            Ok(events) => events,
            Err(e) => {
                error!("Config file watcher failed: {}", e);
                return;
            }
        };
        let mut config_changed = false;
        for event in events {
            if let Some(name) = event.name {
                if name == file_name.as_os_str() {
                    debug!("Config file modified: {:?}", event.mask);
                    config_changed = true;
                }
            }
        }
        if !config_changed {
            continue;
        }

        info!("Reloading configuration from {}", config_path);
        match Config::load(config_path) {
            Ok(new_config) => apply_log_level(new_config.log_level),
            Err(e) => debug!("Configuration reload failed, keeping current settings: {:#}", e),
        }
    }
}

fn apply_log_level(new_level: log::LevelFilter) {
    let current = log::max_level();
    if new_level != current {
        info!("Log level change detected: {} -> {}", current, new_level);
        log::set_max_level(new_level);
    } else {
        debug!("Log level stays the same: {}", new_level);
    }
}
