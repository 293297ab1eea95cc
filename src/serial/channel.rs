//! Serial command channel
//!
//! Half-duplex request/response link to the motor controller. One mutex
//! serializes every send, connect and close, so commands from concurrent
//! callers queue instead of interleaving on the wire.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use super::protocol::{
    battery_percentage, classify_probe_reply, extract_json, parse_reply, pwm_command, MotorCommand,
    ProbeClass, Reply, CMD_QUERY, CMD_STATUS, CMD_STOP,
};
use super::transport::{read_reply, SerialLink, SerialOpener};
use crate::config::SerialConfig;
use crate::utils::error::{AppError, AppResult};

/// Connection state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Ready,
}

/// Most recent battery telemetry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryReading {
    pub voltage: f64,
    pub percentage: u8,
    pub updated_at: DateTime<Utc>,
}

/// Battery report handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryStatus {
    pub connected: bool,
    pub voltage: Option<f64>,
    pub percentage: Option<u8>,
    pub port: Option<String>,
    pub last_error: Option<String>,
}

/// Snapshot of the channel for status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialStatus {
    pub state: ChannelState,
    pub connected: bool,
    pub port: Option<String>,
    pub battery: Option<BatteryReading>,
    pub connection_attempts: u32,
    pub last_error: Option<String>,
    pub ms_since_last_command: Option<u64>,
}

/// State guarded by the channel mutex
#[derive(Default)]
struct Session {
    link: Option<Box<dyn SerialLink>>,
    port: Option<String>,
    last_command_at: Option<Instant>,
    connection_attempts: u32,
    battery: Option<BatteryReading>,
    last_error: Option<String>,
}

/// Probe one port the way discovery does.
///
/// Opens at the configured baud rate, waits the settle delay, sends `STATUS`
/// and classifies the reply. A silent port gets a second `?` probe.
pub fn probe_port(opener: &dyn SerialOpener, path: &str, config: &SerialConfig) -> AppResult<ProbeClass> {
    let mut link = opener.open(path, config.baud_rate)?;
    thread::sleep(config.settle_delay());
    link.clear_buffers()?;

    link.write_line(CMD_STATUS)?;
    let reply = read_reply(link.as_mut(), config.probe_window(), |t| extract_json(t).is_some())?;
    let class = classify_probe_reply(&reply);
    if class != ProbeClass::Unknown {
        tracing::debug!("Probe {}: {:?} ({:?})", path, class, reply.trim());
        return Ok(class);
    }

    link.write_line(CMD_QUERY)?;
    let reply = read_reply(link.as_mut(), config.probe_window(), |t| t.contains('\n'))?;
    let class = if reply.trim().is_empty() {
        ProbeClass::Unknown
    } else {
        ProbeClass::Generic
    };
    tracing::debug!("Probe {}: {:?}", path, class);
    Ok(class)
}

/// Reply text is complete once it holds a JSON object or a plain text line
fn reply_complete(text: &str) -> bool {
    extract_json(text).is_some() || (text.ends_with('\n') && !text.contains('{'))
}

/// Serialized command channel to the motor controller
pub struct SerialChannel {
    config: SerialConfig,
    opener: Arc<dyn SerialOpener>,
    /// Port chosen by the device registry
    selected: RwLock<Option<String>>,
    /// Ports tried after the selected one
    fallbacks: Vec<String>,
    state: RwLock<ChannelState>,
    session: Mutex<Session>,
}

impl SerialChannel {
    pub fn new(
        config: SerialConfig,
        opener: Arc<dyn SerialOpener>,
        selected: Option<String>,
        fallbacks: Vec<String>,
    ) -> Self {
        Self {
            config,
            opener,
            selected: RwLock::new(selected),
            fallbacks,
            state: RwLock::new(ChannelState::Disconnected),
            session: Mutex::new(Session::default()),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    /// Point the channel at a newly selected port. Takes effect on the next connect.
    pub fn set_selected_port(&self, port: Option<String>) {
        *self.selected.write() = port;
    }

    fn candidate_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = Vec::new();
        if let Some(selected) = self.selected.read().clone() {
            ports.push(selected);
        }
        for path in &self.fallbacks {
            if !ports.contains(path) {
                ports.push(path.clone());
            }
        }
        ports
    }

    /// Connect if not already connected
    pub fn connect(&self) -> AppResult<()> {
        let mut session = self.session.lock();
        if session.link.is_some() {
            return Ok(());
        }
        self.connect_locked(&mut session)
    }

    fn connect_locked(&self, session: &mut Session) -> AppResult<()> {
        *self.state.write() = ChannelState::Connecting;
        session.connection_attempts += 1;

        let candidates = self.candidate_ports();
        let mut tried = 0;
        for path in &candidates {
            if !self.opener.exists(path) {
                continue;
            }
            tried += 1;
            match self.open_port(path) {
                Ok((link, reply)) => {
                    tracing::info!("Motor controller connected on {}", path);
                    session.link = Some(link);
                    session.port = Some(path.clone());
                    session.last_error = None;
                    session.last_command_at = Some(Instant::now());
                    self.apply_telemetry(session, &reply);
                    *self.state.write() = ChannelState::Ready;
                    return Ok(());
                }
                Err(e) => tracing::debug!("Port {} rejected: {}", path, e),
            }
        }

        let reason = format!("no motor controller responded ({} ports tried)", tried);
        tracing::warn!("{}", reason);
        session.last_error = Some(reason.clone());
        *self.state.write() = ChannelState::Disconnected;
        Err(AppError::DeviceNotFound(reason))
    }

    fn open_port(&self, path: &str) -> AppResult<(Box<dyn SerialLink>, Reply)> {
        let mut link = self.opener.open(path, self.config.baud_rate)?;
        thread::sleep(self.config.settle_delay());
        link.clear_buffers()?;
        link.write_line(CMD_STATUS)?;

        let text = read_reply(link.as_mut(), self.config.probe_window(), reply_complete)?;
        let reply = parse_reply(&text);
        if reply.is_empty() {
            return Err(AppError::ProtocolTimeout(format!("{} did not answer STATUS", path)));
        }
        Ok((link, reply))
    }

    fn apply_telemetry(&self, session: &mut Session, reply: &Reply) {
        if let Some(voltage) = reply.voltage() {
            let percentage = battery_percentage(
                voltage,
                self.config.battery_empty_volts,
                self.config.battery_full_volts,
            );
            session.battery = Some(BatteryReading {
                voltage,
                percentage,
                updated_at: Utc::now(),
            });
        }
    }

    fn disconnect_locked(&self, session: &mut Session, reason: String) {
        tracing::warn!("Motor link lost: {}", reason);
        session.link = None;
        session.last_error = Some(reason);
        *self.state.write() = ChannelState::Disconnected;
    }

    /// Send one command and wait for its reply
    pub fn send(&self, command: &str) -> AppResult<Reply> {
        let mut session = self.session.lock();
        self.send_locked(&mut session, command)
    }

    fn send_locked(&self, session: &mut Session, command: &str) -> AppResult<Reply> {
        if session.link.is_none() {
            if let Err(e) = self.connect_locked(session) {
                return Err(AppError::Transport(format!("no motor connection: {}", e)));
            }
        }

        if let Some(last) = session.last_command_at {
            let spacing = self.config.min_command_spacing();
            let elapsed = last.elapsed();
            if elapsed < spacing {
                thread::sleep(spacing - elapsed);
            }
        }

        let Some(link) = session.link.as_mut() else {
            return Err(AppError::Transport("no motor connection".into()));
        };

        let timeout = self.config.command_timeout();
        let result = link
            .write_line(command)
            .and_then(|_| read_reply(link.as_mut(), timeout, reply_complete));
        session.last_command_at = Some(Instant::now());

        match result {
            Ok(text) => {
                let reply = parse_reply(&text);
                self.apply_telemetry(session, &reply);
                tracing::trace!("{} -> {:?}", command, reply);
                Ok(reply)
            }
            Err(e) => {
                let reason = format!("disconnected: {}", e);
                self.disconnect_locked(session, reason.clone());
                Err(AppError::Transport(reason))
            }
        }
    }

    /// Best-effort brake on the current link. Errors are logged only.
    fn safety_stop(&self, session: &mut Session) {
        if let Some(link) = session.link.as_mut() {
            if let Err(e) = link.write_line(CMD_STOP) {
                tracing::warn!("Safety STOP failed: {}", e);
            } else {
                tracing::warn!("Issued safety STOP after unanswered motor command");
            }
            session.last_command_at = Some(Instant::now());
        }
    }

    /// Send a motor command that must be answered, braking if it is not
    fn actuate(&self, command: &str) -> AppResult<Reply> {
        let mut session = self.session.lock();
        let reply = self.send_locked(&mut session, command)?;
        if reply.is_empty() {
            self.safety_stop(&mut session);
            return Err(AppError::ProtocolTimeout(format!(
                "no response to '{}'",
                command
            )));
        }
        Ok(reply)
    }

    /// Drive both sides. Values are clamped to the configured PWM range.
    pub fn move_motors(&self, left: i32, right: i32) -> AppResult<Reply> {
        self.actuate(&pwm_command(left, right, self.config.max_pwm))
    }

    /// Brake both motors
    pub fn stop(&self) -> AppResult<Reply> {
        self.actuate(CMD_STOP)
    }

    /// Run a direction command at `speed` (or the configured default speed)
    pub fn drive(&self, command: MotorCommand, speed: Option<i32>) -> AppResult<Reply> {
        let speed = speed.unwrap_or(self.config.default_speed);
        match command.wheels(speed) {
            Some((left, right)) => self.move_motors(left, right),
            None => self.stop(),
        }
    }

    /// Battery telemetry, refreshed with `STATUS` when connected
    pub fn battery(&self) -> BatteryStatus {
        let mut session = self.session.lock();
        if session.link.is_some() {
            if let Err(e) = self.send_locked(&mut session, CMD_STATUS) {
                tracing::debug!("Battery refresh failed: {}", e);
            }
        }

        let connected = session.link.is_some();
        BatteryStatus {
            connected,
            voltage: session.battery.map(|b| b.voltage),
            percentage: session.battery.map(|b| b.percentage),
            port: session.port.clone(),
            last_error: session.last_error.clone(),
        }
    }

    pub fn status(&self) -> SerialStatus {
        let session = self.session.lock();
        SerialStatus {
            state: self.state(),
            connected: session.link.is_some(),
            port: session.port.clone(),
            battery: session.battery,
            connection_attempts: session.connection_attempts,
            last_error: session.last_error.clone(),
            ms_since_last_command: session
                .last_command_at
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }

    /// Drop any open link and connect again
    pub fn reconnect(&self) -> AppResult<()> {
        let mut session = self.session.lock();
        if session.link.take().is_some() {
            tracing::info!("Reconnecting motor controller");
        }
        self.connect_locked(&mut session)
    }

    /// Brake and release the port
    pub fn close(&self) {
        let mut session = self.session.lock();
        if session.link.is_some() {
            self.safety_stop(&mut session);
            session.link = None;
            tracing::info!("Motor controller link closed");
        }
        *self.state.write() = ChannelState::Disconnected;
    }
}
