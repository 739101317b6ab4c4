//! Configuration loading and validation.
//!
//! The gateway is configured through a single INI file with four sections:
//!
//! ```ini
//! [common]
//! logLevel = INFO
//! dataDirectory = /var/lib/sms-gateway
//!
//! [restapi]
//! bindIp = 127.0.0.1
//! port = 8080
//! user = api
//! password = secret
//!
//! [sms]
//! recipients = +491701111111,+491702222222
//! rateLimit1 = 10/1h
//! rateLimit2 = 30/1d
//! dropOnRateLimit = no
//! keepAliveInterval = 2w
//! keepAliveMessage = SIM keep-alive, please ignore
//!
//! [modem]
//! simPin = 0000
//! serialPort = /dev/ttyUSB2
//! serialSpeed = 115200
//! serialReadTimeoutSeconds = 5
//! initCmds = ATZ\rATE0
//! ```
//!
//! Every value is validated on load; a bad configuration refuses to start the
//! daemon. `common.logLevel` is the only value that is re-applied by the
//! config-file watcher at runtime (see [`watcher`]).

pub mod limits;
pub mod watcher;

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use ini::{Ini, ParseOption};
use log::{info, warn, LevelFilter};

use crate::modem::discovery;
use limits::{RateLimit, TimeInterval};

/// `send_sms` pretends every message was delivered without touching the port.
pub const DEBUG_MODEM_ALWAYS_SUCCEED: u32 = 1 << 0;
/// `send_sms` pretends the modem failed without touching the port.
pub const DEBUG_MODEM_ALWAYS_FAIL: u32 = 1 << 1;

/// USB vendor/product pair used for serial port discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl std::fmt::Display for UsbDeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // [common]
    pub data_directory: String,
    pub log_level: LevelFilter,
    debug_flags: u32,
    // [restapi]
    pub bind_ip: String,
    pub rest_port: u16,
    pub rest_user: String,
    pub rest_password: String,
    // [sms]
    pub sms_recipients: Vec<String>,
    pub rate_limit1: Option<RateLimit>,
    pub rate_limit2: Option<RateLimit>,
    pub keep_alive_interval: Option<TimeInterval>,
    pub keep_alive_message: String,
    pub drop_on_rate_limit: bool,
    // [modem]
    pub sim_pin: String,
    pub modem_init_cmds: Vec<String>,
    pub usb_device_id: Option<UsbDeviceId>,
    serial_port: String,
    pub serial_speed: u32,
    pub serial_read_timeout: Duration,
}

const DEFAULT_CONFIG: &str = r#"# sms-gateway configuration. All keys shown; customize before starting.

[common]
# TRACE / DEBUG / INFO / WARN / ERROR
logLevel = INFO
# Base directory for persistent state and the message queues. Must be writable.
dataDirectory = /var/lib/sms-gateway
# Comma-separated list of: modem_always_succeed, modem_always_fail
# debugFlags =

[restapi]
bindIp = 127.0.0.1
port = 8080
user = api
password = change-me

[sms]
# Recipients in international format, comma-separated. Every message goes to all of them.
recipients = +491700000000
# Optional send rate limits, pattern <count>/<interval>, interval unit s/m/h/d/w.
# rateLimit1 = 10/1h
# rateLimit2 = 30/1d
# Drop (instead of queue) messages that hit a rate limit.
dropOnRateLimit = no
# Enqueue a keep-alive SMS when nothing was sent for this long. Both keys or neither.
# keepAliveInterval = 2w
# keepAliveMessage = SIM keep-alive, please ignore

[modem]
simPin = 0000
# Device path, or a 0-based index when usbVendorId/usbProductId are set.
serialPort = /dev/ttyUSB2
serialSpeed = 115200
serialReadTimeoutSeconds = 5
# AT commands run after opening the port, separated by a literal \r.
initCmds = ATZ\rATE0
# USB discovery: hex 16-bit ids, both or neither.
# usbVendorId = 12d1
# usbProductId = 1465
"#;

fn fail(msg: String) -> anyhow::Error {
    log::error!("{}", msg);
    anyhow!(msg)
}

fn parse_log_level(level: &str) -> Result<LevelFilter> {
    match level {
        "TRACE" => Ok(LevelFilter::Trace),
        "DEBUG" => Ok(LevelFilter::Debug),
        "INFO" => Ok(LevelFilter::Info),
        "WARN" => Ok(LevelFilter::Warn),
        "ERROR" => Ok(LevelFilter::Error),
        other => Err(anyhow!("invalid log level string: {}", other)),
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.to_lowercase().as_str() {
        "1" | "y" | "yes" | "true" | "on" => Ok(true),
        "0" | "n" | "no" | "false" | "off" => Ok(false),
        other => Err(anyhow!(
            "unrecognized boolean value '{}', valid choices are '1', '0', 'y', 'n', 'yes', 'no', 'on', 'off'",
            other
        )),
    }
}

fn parse_debug_flag(s: &str) -> Result<u32> {
    match s.trim() {
        "" => Ok(0),
        "modem_always_succeed" => Ok(DEBUG_MODEM_ALWAYS_SUCCEED),
        "modem_always_fail" => Ok(DEBUG_MODEM_ALWAYS_FAIL),
        other => Err(anyhow!("unknown debug flag: {}", other)),
    }
}

fn parse_debug_flags(s: &str) -> Result<u32> {
    let mut result = 0;
    for token in s.split(',') {
        result |= parse_debug_flag(token)?;
    }
    Ok(result)
}

/// Parse an unsigned hexadecimal 16-bit number like `beef` or `12d1`.
pub fn parse_hex16(hex: &str) -> Result<u16> {
    u16::from_str_radix(hex.trim(), 16)
        .map_err(|e| anyhow!("invalid hexadecimal 16-bit value '{}': {}", hex, e))
}

impl Config {
    /// Load and validate the configuration; the file must exist.
    pub fn load(path: &str) -> Result<Config> {
        if !Path::new(path).exists() {
            return Err(fail(format!("Config file does not exist: {}", path)));
        }
        // escape processing stays off so the literal `\r` separator in
        // modem.initCmds reaches the splitter untouched
        let parse_options = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
            ..Default::default()
        };
        let ini = Ini::load_from_file_opt(path, parse_options)
            .map_err(|e| fail(format!("Failed to load config file: {}", e)))?;

        let get = |section: &str, key: &str| -> Option<String> {
            ini.section(Some(section))
                .and_then(|s| s.get(key))
                .map(|v| v.to_string())
        };
        let required = |section: &str, key: &str| -> Result<String> {
            match get(section, key) {
                Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
                _ => Err(fail(format!(
                    "Invalid configuration value for key '{}' in [{}] section - value cannot be empty/blank/missing",
                    key, section
                ))),
            }
        };

        // [common]
        let log_level = parse_log_level(get("common", "logLevel").as_deref().unwrap_or("INFO"))
            .map_err(|e| fail(format!("Invalid configuration value for key 'logLevel' in [common] section: {}", e)))?;
        let data_directory = required("common", "dataDirectory")?;
        let debug_flags = parse_debug_flags(get("common", "debugFlags").as_deref().unwrap_or(""))
            .map_err(|e| fail(format!("Invalid configuration value for key 'debugFlags' in [common] section: {}", e)))?;

        // [restapi]
        let bind_ip = required("restapi", "bindIp")?;
        let rest_user = required("restapi", "user")?;
        let rest_password = required("restapi", "password")?;
        let rest_port: u16 = required("restapi", "port")?
            .parse()
            .map_err(|e| fail(format!("Invalid configuration value for key 'port' in [restapi] section: {}", e)))?;

        // [sms]
        let drop_on_rate_limit = match get("sms", "dropOnRateLimit") {
            None => false,
            Some(s) if s.trim().is_empty() => false,
            Some(s) => parse_bool(&s).map_err(|e| {
                fail(format!("Invalid configuration boolean value for key 'dropOnRateLimit' in [sms] section: {}", e))
            })?,
        };
        if drop_on_rate_limit {
            warn!("Will DROP any SMS exceeding the rate limit instead of queueing them.");
        }

        let rate_limit1 = RateLimit::parse(get("sms", "rateLimit1").as_deref().unwrap_or(""))
            .map_err(|e| fail(format!("Invalid configuration value for key 'rateLimit1' in [sms] section: {}", e)))?;
        match &rate_limit1 {
            Some(rl) => info!("Rate limit #1: {}", rl),
            None => info!("Rate limit #1 not configured"),
        }
        let rate_limit2 = RateLimit::parse(get("sms", "rateLimit2").as_deref().unwrap_or(""))
            .map_err(|e| fail(format!("Invalid configuration value for key 'rateLimit2' in [sms] section: {}", e)))?;
        match &rate_limit2 {
            Some(rl) => info!("Rate limit #2: {}", rl),
            None => info!("Rate limit #2 not configured"),
        }

        let sms_recipients: Vec<String> = required("sms", "recipients")?
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if sms_recipients.is_empty() {
            return Err(fail(
                "Invalid configuration value for key 'recipients' in [sms] section - value cannot be empty/blank/missing".to_string(),
            ));
        }

        let keep_alive_interval = match get("sms", "keepAliveInterval") {
            Some(iv) if !iv.trim().is_empty() => Some(TimeInterval::parse(&iv).map_err(|e| {
                fail(format!("Invalid configuration value for key 'keepAliveInterval' in [sms] section - {}", e))
            })?),
            _ => None,
        };
        let keep_alive_message = if keep_alive_interval.is_some() {
            let msg = get("sms", "keepAliveMessage").unwrap_or_default();
            if msg.trim().is_empty() {
                return Err(fail(
                    "Invalid/missing configuration value for key 'keepAliveMessage' in [sms] section - a value is required if 'keepAliveInterval' is set".to_string(),
                ));
            }
            msg
        } else {
            String::new()
        };

        // [modem]
        let usb_vendor = get("modem", "usbVendorId").unwrap_or_default();
        let usb_product = get("modem", "usbProductId").unwrap_or_default();
        let usb_device_id = if !usb_vendor.is_empty() || !usb_product.is_empty() {
            if usb_vendor.is_empty() || usb_product.is_empty() {
                return Err(fail(
                    "Either none or both of [modem] usbVendorId and usbProductId need to be specified".to_string(),
                ));
            }
            let vendor_id = parse_hex16(&usb_vendor).map_err(|e| {
                fail(format!("Invalid configuration value for key 'usbVendorId' in [modem] section - {}", e))
            })?;
            let product_id = parse_hex16(&usb_product).map_err(|e| {
                fail(format!("Invalid configuration value for key 'usbProductId' in [modem] section - {}", e))
            })?;
            Some(UsbDeviceId {
                vendor_id,
                product_id,
            })
        } else {
            None
        };

        let serial_port = required("modem", "serialPort")?;
        if usb_device_id.is_some() && serial_port.parse::<u32>().is_err() {
            return Err(fail(
                "When [modem] usbVendorId/usbProductId is configured, [modem] serialPort has to be a non-negative integer number.".to_string(),
            ));
        }

        let serial_speed: u32 = required("modem", "serialSpeed")?
            .parse()
            .map_err(|e| fail(format!("Invalid configuration value for key 'serialSpeed' in [modem] section: {}", e)))?;
        let read_timeout_seconds: u64 = required("modem", "serialReadTimeoutSeconds")?
            .parse()
            .map_err(|e| {
                fail(format!("Invalid configuration value for key 'serialReadTimeoutSeconds' in [modem] section: {}", e))
            })?;
        let sim_pin = required("modem", "simPin")?;

        // Literal "\r" separates init commands; blank segments mean "no command".
        let modem_init_cmds: Vec<String> = get("modem", "initCmds")
            .unwrap_or_default()
            .split("\\r")
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        Ok(Config {
            data_directory,
            log_level,
            debug_flags,
            bind_ip,
            rest_port,
            rest_user,
            rest_password,
            sms_recipients,
            rate_limit1,
            rate_limit2,
            keep_alive_interval,
            keep_alive_message,
            drop_on_rate_limit,
            sim_pin,
            modem_init_cmds,
            usb_device_id,
            serial_port,
            serial_speed,
            serial_read_timeout: Duration::from_secs(read_timeout_seconds),
        })
    }

    /// Like [`Config::load`], but writes a commented template when the file is
    /// missing and asks the operator to customize it.
    pub fn load_or_bootstrap(path: &str) -> Result<Config> {
        if !Path::new(path).exists() {
            std::fs::write(path, DEFAULT_CONFIG)
                .with_context(|| format!("Config file {} does not exist and creating a default file failed", path))?;
            bail!(
                "Config file {} does not exist, created a default file you need to customize.",
                path
            );
        }
        Config::load(path)
    }

    /// Resolve the serial device path. With USB discovery configured the
    /// `serialPort` value is an index into the sorted list of discovered
    /// `/dev/ttyUSB*` nodes; discovery runs fresh on every call so a
    /// re-plugged modem is picked up on the next open.
    pub fn serial_device(&self) -> Result<String> {
        match &self.usb_device_id {
            Some(device_id) => {
                let interfaces = discovery::discover_usb_interfaces(device_id)?;
                if interfaces.is_empty() {
                    bail!("serial-port auto discovery found no usb interfaces");
                }
                let idx: usize = self.serial_port.parse().unwrap_or(0);
                if interfaces.len() <= idx {
                    bail!(
                        "serial-port auto discovery found only {} interfaces but [modem] serialPort config requested interface #{}",
                        interfaces.len(),
                        idx
                    );
                }
                info!("Going to use device #{} [{}]", idx, interfaces[idx]);
                Ok(interfaces[idx].clone())
            }
            None => Ok(self.serial_port.clone()),
        }
    }

    pub fn is_set(&self, flag: u32) -> bool {
        (self.debug_flags & flag) != 0
    }
}
