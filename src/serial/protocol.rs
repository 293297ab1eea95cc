//! Motor controller line protocol
//!
//! Requests are single ASCII lines (`PWM <l> <r>`, `STOP`, `STATUS`). Replies
//! are either one JSON object per line or free text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::error::{AppError, AppResult};

pub const CMD_STATUS: &str = "STATUS";
pub const CMD_STOP: &str = "STOP";
/// Secondary probe for controllers that ignore `STATUS`
pub const CMD_QUERY: &str = "?";

/// Clamp a motor value into `[-max, max]`
pub fn clamp_pwm(value: i32, max: i32) -> i32 {
    let max = max.abs();
    value.clamp(-max, max)
}

/// Format a `PWM` request with both sides clamped.
///
/// `PWM 0 0` is sent as-is and holds both motors at zero speed; the explicit
/// brake is [`CMD_STOP`].
pub fn pwm_command(left: i32, right: i32, max: i32) -> String {
    format!("PWM {} {}", clamp_pwm(left, max), clamp_pwm(right, max))
}

/// Linear battery map, clamped to 0..=100 and truncated
pub fn battery_percentage(voltage: f64, empty_volts: f64, full_volts: f64) -> u8 {
    let span = full_volts - empty_volts;
    if span <= 0.0 || !voltage.is_finite() {
        return 0;
    }
    let percent = (voltage - empty_volts) / span * 100.0;
    percent.clamp(0.0, 100.0) as u8
}

/// Parsed controller reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Json(Value),
    Raw(String),
    Empty,
}

impl Reply {
    pub fn is_empty(&self) -> bool {
        matches!(self, Reply::Empty)
    }

    /// Voltage carried by a JSON reply, if any
    pub fn voltage(&self) -> Option<f64> {
        match self {
            Reply::Json(value) => value.get("voltage").and_then(Value::as_f64),
            _ => None,
        }
    }
}

/// First line that holds a complete `{...}` object that parses as JSON
pub fn extract_json(text: &str) -> Option<Value> {
    text.lines().find_map(|line| {
        let start = line.find('{')?;
        let end = line.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str::<Value>(&line[start..=end])
            .ok()
            .filter(Value::is_object)
    })
}

/// Turn accumulated reply text into a [`Reply`]
pub fn parse_reply(text: &str) -> Reply {
    if let Some(value) = extract_json(text) {
        return Reply::Json(value);
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Reply::Empty
    } else {
        Reply::Raw(trimmed.to_string())
    }
}

/// How a serial port answered a discovery probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeClass {
    /// Reply mentions voltage or battery
    RecognizedController,
    /// Some reply, not obviously the controller
    Generic,
    /// Silent
    Unknown,
}

/// Classify a reply to the `STATUS` probe
pub fn classify_probe_reply(text: &str) -> ProbeClass {
    let lower = text.to_lowercase();
    if lower.contains("voltage") || lower.contains("battery") {
        ProbeClass::RecognizedController
    } else if !lower.trim().is_empty() {
        ProbeClass::Generic
    } else {
        ProbeClass::Unknown
    }
}

/// Direction commands accepted from the web layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MotorCommand {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl MotorCommand {
    pub fn parse(name: &str) -> AppResult<Self> {
        match name.trim().to_lowercase().as_str() {
            "forward" => Ok(Self::Forward),
            "backward" => Ok(Self::Backward),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "stop" => Ok(Self::Stop),
            other => Err(AppError::InvalidArgument(format!(
                "unknown motor command '{}'",
                other
            ))),
        }
    }

    /// Wheel values for this direction at `speed`, or `None` for stop
    pub fn wheels(&self, speed: i32) -> Option<(i32, i32)> {
        let s = speed.abs();
        match self {
            Self::Forward => Some((s, s)),
            Self::Backward => Some((-s, -s)),
            Self::Left => Some((-s, s)),
            Self::Right => Some((s, -s)),
            Self::Stop => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pwm_clamps_both_sides() {
        assert_eq!(pwm_command(300, -400, 255), "PWM 255 -255");
        assert_eq!(pwm_command(0, 0, 255), "PWM 0 0");
    }

    #[test]
    fn test_battery_percentage_linear_map() {
        assert_eq!(battery_percentage(11.8, 10.0, 12.6), 69);
        assert_eq!(battery_percentage(9.0, 10.0, 12.6), 0);
        assert_eq!(battery_percentage(13.4, 10.0, 12.6), 100);
        assert_eq!(battery_percentage(12.0, 12.0, 12.0), 0);
    }

    #[test]
    fn test_parse_reply_prefers_json_line() {
        let reply = parse_reply("boot ok\r\n{\"voltage\": 11.8, \"left\": 0}\r\n");
        assert_eq!(reply.voltage(), Some(11.8));

        assert_eq!(parse_reply("OK\r\n"), Reply::Raw("OK".into()));
        assert!(parse_reply("  \r\n").is_empty());
        assert!(matches!(parse_reply("{\"voltage\": 11"), Reply::Raw(_)));
    }

    #[test]
    fn test_probe_classification() {
        assert_eq!(
            classify_probe_reply("{\"Voltage\":12.2}"),
            ProbeClass::RecognizedController
        );
        assert_eq!(classify_probe_reply("battery low"), ProbeClass::RecognizedController);
        assert_eq!(classify_probe_reply("hello"), ProbeClass::Generic);
        assert_eq!(classify_probe_reply(""), ProbeClass::Unknown);
    }

    #[test]
    fn test_motor_command_wheels() {
        assert_eq!(MotorCommand::parse("Left").unwrap().wheels(150), Some((-150, 150)));
        assert_eq!(MotorCommand::parse("stop").unwrap().wheels(150), None);
        assert!(MotorCommand::parse("jump").is_err());
    }
}
