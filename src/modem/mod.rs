//! Modem session: everything that talks to the cellular modem.
//!
//! The session owns the serial handle and serializes access to it; at most one
//! AT exchange is in flight at any time. The handle is opened lazily — every
//! public operation first forces `CLOSED → READY` (open port, run the
//! configured init commands) — and any transport or protocol failure closes it
//! again so the next attempt starts from a clean re-initialization.
//!
//! Sending follows the classic text-mode protocol: unlock the SIM
//! (`AT+CPIN?` / `AT+CPIN="<pin>"`), select text mode (`AT+CMGF=1`), then per
//! recipient the two-step `AT+CMGS="<nr>"` prompt/body exchange terminated
//! with Ctrl-Z.

pub mod discovery;
pub mod parser;

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error, info, trace, warn};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::config::{Config, DEBUG_MODEM_ALWAYS_FAIL, DEBUG_MODEM_ALWAYS_SUCCEED};
use crate::logutil::escape_log;
use crate::state::State;
use parser::{parse_response, ByteEvent};

/// Terminates an SMS body in text mode.
pub const CTRL_Z: u8 = 0x1a;

type Port = Box<dyn SerialPort>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Success / no error.
    None,
    /// Too many SMS sent within a configured time interval.
    RateLimitExceeded,
    /// Serial port or modem failure.
    ModemError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureReason::None => "NONE",
            FailureReason::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            FailureReason::ModemError => "MODEM_ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SendResult {
    pub success: bool,
    pub reason: FailureReason,
    pub details: String,
}

/// Network registration status as reported by `AT+CREG?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotRegisteredNotSearching,
    RegisteredHome,
    NotRegisteredSearching,
    RegistrationDenied,
    Unknown,
    RegisteredRoaming,
}

impl ConnectionStatus {
    fn from_code(code: u8) -> Option<ConnectionStatus> {
        match code {
            0 => Some(ConnectionStatus::NotRegisteredNotSearching),
            1 => Some(ConnectionStatus::RegisteredHome),
            2 => Some(ConnectionStatus::NotRegisteredSearching),
            3 => Some(ConnectionStatus::RegistrationDenied),
            4 => Some(ConnectionStatus::Unknown),
            5 => Some(ConnectionStatus::RegisteredRoaming),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::NotRegisteredNotSearching => "NOT_REGISTERED_NOT_SEARCHING",
            ConnectionStatus::RegisteredHome => "REGISTERED_HOME",
            ConnectionStatus::NotRegisteredSearching => "NOT_REGISTERED_SEARCHING",
            ConnectionStatus::RegistrationDenied => "NOT_REGISTERED_DENIED",
            ConnectionStatus::Unknown => "UNKNOWN",
            ConnectionStatus::RegisteredRoaming => "REGISTERED_ROAMING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinState {
    NotRequired,
    Required,
    PukRequired,
}

/// One parsed modem response: the ordered non-blank lines up to the
/// terminator.
#[derive(Debug, Clone, Default)]
struct ModemResponse {
    lines: Vec<String>,
}

impl ModemResponse {
    fn is_ok(&self) -> bool {
        self.lines.iter().any(|l| l == "OK")
    }

    fn is_error(&self) -> bool {
        !self.is_ok()
    }

    /// First line that, after trimming, starts with `prefix` (trimmed).
    fn line_by_prefix(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .map(|l| l.trim())
            .find(|l| l.starts_with(prefix))
    }
}

impl fmt::Display for ModemResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lines.join("\n"))
    }
}

fn classify_pin_state(resp: &ModemResponse) -> Result<PinState> {
    // +CPIN: READY    -> unlocked or no PIN enabled
    // +CPIN: SIM PIN  -> locked, PIN required
    // +CPIN: SIM PUK  -> locked out after three bad PINs, operator must act
    // +CME ERROR: 10  -> no SIM card detected
    if let Some(line) = resp.line_by_prefix("+CPIN:") {
        debug!("CPIN response: {}", line);
        if line.contains("READY") {
            return Ok(PinState::NotRequired);
        }
        if line.contains("SIM PIN") {
            return Ok(PinState::Required);
        }
        if line.contains("SIM PUK") {
            return Ok(PinState::PukRequired);
        }
    } else if let Some(line) = resp.line_by_prefix("+CME ERROR") {
        bail!("modem sent an error in reply to AT+CPIN?: {}", line);
    }
    bail!(
        "modem sent unexpected response to AT+CPIN?: '{}'",
        escape_log(&resp.to_string())
    )
}

fn parse_creg(resp: &ModemResponse) -> Result<ConnectionStatus> {
    // +CREG: <n>,<stat>[,<lac>,<ci>,<AcT>] — <stat> is the second field:
    // 0 not registered/not searching, 1 home, 2 searching, 3 denied,
    // 4 unknown, 5 roaming
    let line = resp
        .line_by_prefix("+CREG:")
        .ok_or_else(|| anyhow!("unrecognized modem response to AT+CREG?"))?;
    let fields: Vec<&str> = line["+CREG:".len()..].trim().split(',').collect();
    if fields.len() < 2 {
        bail!("unrecognized modem response to AT+CREG? (too few fields)");
    }
    let code: u8 = fields[1]
        .trim()
        .parse()
        .map_err(|_| anyhow!("unrecognized modem response to AT+CREG? (bad status field)"))?;
    debug!("Modem registration code: {}", code);
    ConnectionStatus::from_code(code)
        .ok_or_else(|| anyhow!("modem returned unknown result code {}", code))
}

pub struct Modem {
    config: Arc<Config>,
    state: Arc<State>,
    port: Mutex<Option<Port>>,
}

impl Modem {
    pub fn new(config: Arc<Config>, state: Arc<State>) -> Modem {
        Modem {
            config,
            state,
            port: Mutex::new(None),
        }
    }

    /// Open and initialize the modem once, then release it again. Used at
    /// startup to fail fast on a bad device or init command; the delivery
    /// scheduler reopens the port on demand.
    pub fn probe(&self) -> Result<()> {
        if self.config.is_set(DEBUG_MODEM_ALWAYS_SUCCEED)
            || self.config.is_set(DEBUG_MODEM_ALWAYS_FAIL)
        {
            warn!("Not probing modem because a modem debug flag is set");
            return Ok(());
        }
        let mut guard = self.port.lock().unwrap();
        *guard = Some(self.open_port()?);
        info!("Modem initialized successfully");
        *guard = None;
        Ok(())
    }

    pub fn close(&self) {
        let mut guard = self.port.lock().unwrap();
        if guard.take().is_some() {
            info!("Closing serial port");
        }
    }

    /// Send `text` to every configured recipient, sequentially. Never returns
    /// an `Err`: failures are folded into the [`SendResult`] so the caller can
    /// distinguish rate limiting from modem trouble.
    pub fn send_sms(&self, text: &str) -> SendResult {
        if self.config.is_set(DEBUG_MODEM_ALWAYS_SUCCEED) {
            warn!("Not actually sending SMS, modem_always_succeed debug flag is set");
            warn!("Message: >{}<", escape_log(text));
            return SendResult {
                success: true,
                reason: FailureReason::None,
                details: "fake success (debug mode)".to_string(),
            };
        }
        if self.config.is_set(DEBUG_MODEM_ALWAYS_FAIL) {
            warn!("Not actually sending SMS, modem_always_fail debug flag is set");
            warn!("Message: >{}<", escape_log(text));
            return SendResult {
                success: false,
                reason: FailureReason::ModemError,
                details: "fake modem failure (debug mode)".to_string(),
            };
        }

        let mut guard = self.port.lock().unwrap();
        match self.send_locked(&mut guard, text) {
            Ok(result) => result,
            Err(e) => {
                if guard.take().is_some() {
                    info!("Closing serial port");
                }
                SendResult {
                    success: false,
                    reason: FailureReason::ModemError,
                    details: format!("{:#}", e),
                }
            }
        }
    }

    /// Query network registration via `AT+CREG?`.
    pub fn connection_status(&self) -> Result<ConnectionStatus> {
        if self.config.is_set(DEBUG_MODEM_ALWAYS_SUCCEED) {
            return Ok(ConnectionStatus::RegisteredHome);
        }
        if self.config.is_set(DEBUG_MODEM_ALWAYS_FAIL) {
            bail!("failing because the modem_always_fail debug flag is set");
        }
        let mut guard = self.port.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.open_port()?);
        }
        self.unlock_sim(&mut guard)?;
        let resp = self.transact_cmd(&mut guard, "AT+CREG?", true)?;
        debug!("Modem response to AT+CREG?: '{}'", escape_log(&resp.to_string()));
        parse_creg(&resp)
    }

    fn send_locked(&self, guard: &mut Option<Port>, text: &str) -> Result<SendResult> {
        if guard.is_none() {
            *guard = Some(self.open_port()?);
        }
        self.unlock_sim(guard)?;

        // switch modem to plain-text mode so AT+CMGS works
        let resp = self.transact_cmd(guard, "AT+CMGF=1", true)?;
        if resp.is_error() {
            bail!(
                "failed to switch modem to plain-text mode: '{}'",
                escape_log(&resp.to_string())
            );
        }

        for recipient in &self.config.sms_recipients {
            if self.state.any_rate_limit_exceeded() {
                error!("Rate limit exceeded (current recipient: {})", recipient);
                return Ok(SendResult {
                    success: false,
                    reason: FailureReason::RateLimitExceeded,
                    details: "Rate limit exceeded".to_string(),
                });
            }

            info!("Sending SMS to {}", recipient);
            let resp = self.transact_cmd(guard, &format!("AT+CMGS=\"{}\"", recipient), false)?;
            if resp.lines.len() != 1 || resp.lines[0] != "> " {
                bail!(
                    "expected '> ' prompt but got '{}'",
                    escape_log(&resp.to_string())
                );
            }

            debug!("Sending actual message: '{}'", escape_log(text));
            let mut payload = text.as_bytes().to_vec();
            payload.push(CTRL_Z);
            let lines = self.transact_bytes(guard, &payload, true)?;
            let resp = ModemResponse { lines };
            debug!("Modem response: '{}'", escape_log(&resp.to_string()));
            if !resp.is_ok() {
                bail!(
                    "modem rejected message body: '{}'",
                    escape_log(&resp.to_string())
                );
            }
        }
        Ok(SendResult {
            success: true,
            reason: FailureReason::None,
            details: "success".to_string(),
        })
    }

    fn unlock_sim(&self, guard: &mut Option<Port>) -> Result<()> {
        debug!("Querying SIM card PIN state...");
        let resp = self.transact_cmd(guard, "AT+CPIN?", false)?;
        debug!(
            "Querying SIM card PIN state yielded '{}'",
            escape_log(&resp.to_string())
        );
        match classify_pin_state(&resp)? {
            PinState::NotRequired => {
                debug!("SIM card PIN is unlocked");
                Ok(())
            }
            PinState::Required => {
                info!("SIM card needs PIN");
                let resp =
                    self.transact_cmd(guard, &format!("AT+CPIN=\"{}\"", self.config.sim_pin), true)?;
                if resp.is_error() {
                    bail!(
                        "unlocking SIM card returned error response: '{}'",
                        escape_log(&resp.to_string())
                    );
                }
                info!("Successfully unlocked SIM card using PIN");
                Ok(())
            }
            PinState::PukRequired => {
                warn!("SIM card needs PUK");
                bail!("modem requires PUK, please unlock SIM card manually using AT+CPIN")
            }
        }
    }

    /// Open the serial device (8N1, configured baud and read timeout) and run
    /// the configured init commands. The port is dropped again on any failure.
    fn open_port(&self) -> Result<Port> {
        let device = self.config.serial_device()?;
        debug!(
            "Initializing modem on port {}, baud rate {}",
            device, self.config.serial_speed
        );
        let mut port = serialport::new(device.as_str(), self.config.serial_speed)
            .timeout(self.config.serial_read_timeout)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .open()
            .map_err(|e| anyhow!("failed to open serial port '{}' - {}", device, e))?;

        for cmd in &self.config.modem_init_cmds {
            debug!("Executing modem init cmd: '{}'", cmd);
            let resp = Self::command(&mut port, cmd, false)?;
            if resp.is_error() {
                bail!(
                    "running modem initialization cmd {} returned an error: '{}'",
                    cmd,
                    escape_log(&resp.to_string())
                );
            }
        }
        Ok(port)
    }

    fn transact_cmd(
        &self,
        guard: &mut Option<Port>,
        cmd: &str,
        requires_ok_or_error: bool,
    ) -> Result<ModemResponse> {
        let port = guard
            .as_mut()
            .ok_or_else(|| anyhow!("serial port not open"))?;
        match Self::command(port, cmd, requires_ok_or_error) {
            Ok(resp) => Ok(resp),
            Err(e) => {
                error!("Closing serial port due to error: {:#}", e);
                *guard = None;
                Err(e)
            }
        }
    }

    fn transact_bytes(
        &self,
        guard: &mut Option<Port>,
        bytes: &[u8],
        requires_ok_or_error: bool,
    ) -> Result<Vec<String>> {
        let port = guard
            .as_mut()
            .ok_or_else(|| anyhow!("serial port not open"))?;
        match Self::write_then_read(port, bytes, requires_ok_or_error) {
            Ok(lines) => Ok(lines),
            Err(e) => {
                error!("Closing serial port due to error: {:#}", e);
                *guard = None;
                Err(e)
            }
        }
    }

    fn command(port: &mut Port, cmd: &str, requires_ok_or_error: bool) -> Result<ModemResponse> {
        if cmd.trim().is_empty() {
            bail!("command string cannot be blank or empty");
        }
        debug!("Sending AT command: '{}'", cmd);
        let mut bytes = cmd.as_bytes().to_vec();
        if !cmd.ends_with('\r') {
            bytes.push(b'\r');
        }
        let lines = Self::write_then_read(port, &bytes, requires_ok_or_error)?;
        Ok(ModemResponse { lines })
    }

    /// One framed exchange: flush stale input, write the request, drain, then
    /// read byte-by-byte into the response parser.
    fn write_then_read(
        port: &mut Port,
        bytes: &[u8],
        requires_ok_or_error: bool,
    ) -> Result<Vec<String>> {
        port.clear(ClearBuffer::Input)
            .map_err(|e| anyhow!("failed to drain serial input buffer: {}", e))?;
        port.write_all(bytes)
            .context("failed to write to serial port")?;
        port.flush().context("failed to drain serial port")?;

        let mut byte = [0u8; 1];
        let lines = parse_response(
            || match port.read(&mut byte) {
                Ok(0) => Ok(ByteEvent::Timeout),
                Ok(_) => {
                    trace!("Received character 0x{:02x}", byte[0]);
                    Ok(ByteEvent::Byte(byte[0]))
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(ByteEvent::Timeout),
                Err(e) => Err(e),
            },
            requires_ok_or_error,
        )
        .context("failed to read from serial port")?;
        debug!("Modem response: '{}'", escape_log(&lines.join("\n")));
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(lines: &[&str]) -> ModemResponse {
        ModemResponse {
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn response_ok_detection() {
        assert!(resp(&["+CPIN: READY", "OK"]).is_ok());
        assert!(resp(&["OK"]).is_ok());
        assert!(resp(&[]).is_error());
        assert!(resp(&["ERROR"]).is_error());
        // OK must be a whole line, not a substring
        assert!(resp(&["NOKIA"]).is_error());
    }

    #[test]
    fn response_line_by_prefix_trims() {
        let r = resp(&["  +CREG: 0,1  ", "OK"]);
        assert_eq!(r.line_by_prefix("+CREG:"), Some("+CREG: 0,1"));
        assert_eq!(r.line_by_prefix("+CPIN:"), None);
    }

    #[test]
    fn pin_state_classification() {
        assert_eq!(
            classify_pin_state(&resp(&["+CPIN: READY", "OK"])).unwrap(),
            PinState::NotRequired
        );
        assert_eq!(
            classify_pin_state(&resp(&["+CPIN: SIM PIN", "OK"])).unwrap(),
            PinState::Required
        );
        assert_eq!(
            classify_pin_state(&resp(&["+CPIN: SIM PUK", "OK"])).unwrap(),
            PinState::PukRequired
        );
        assert!(classify_pin_state(&resp(&["+CME ERROR: 10"])).is_err());
        assert!(classify_pin_state(&resp(&["gibberish"])).is_err());
    }

    #[test]
    fn creg_parsing() {
        assert_eq!(
            parse_creg(&resp(&["+CREG: 0,1", "OK"])).unwrap(),
            ConnectionStatus::RegisteredHome
        );
        assert_eq!(
            parse_creg(&resp(&["+CREG: 0,5", "OK"])).unwrap(),
            ConnectionStatus::RegisteredRoaming
        );
        assert_eq!(
            parse_creg(&resp(&["+CREG: 1,2,\"27A1\",\"0E10\"", "OK"])).unwrap(),
            ConnectionStatus::NotRegisteredSearching
        );
        assert!(parse_creg(&resp(&["OK"])).is_err());
        assert!(parse_creg(&resp(&["+CREG: 1", "OK"])).is_err());
        assert!(parse_creg(&resp(&["+CREG: 0,9", "OK"])).is_err());
    }

    #[test]
    fn connection_status_names() {
        assert_eq!(
            ConnectionStatus::RegisteredHome.to_string(),
            "REGISTERED_HOME"
        );
        assert_eq!(ConnectionStatus::Unknown.to_string(), "UNKNOWN");
        assert_eq!(ConnectionStatus::from_code(6), None);
    }
}
