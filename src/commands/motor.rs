//! Motor controller commands

use serde::{Deserialize, Serialize};

use super::{AvatarCore, CommandResult};
use crate::serial::{BatteryStatus, MotorCommand, Reply, SerialStatus};

/// Controller reply to a motor command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotorResponse {
    pub command: MotorCommand,
    /// JSON reply, when the controller sent one
    pub reply: Option<serde_json::Value>,
    /// Non-JSON reply text
    pub raw: Option<String>,
}

impl MotorResponse {
    fn new(command: MotorCommand, reply: Reply) -> Self {
        let (reply, raw) = match reply {
            Reply::Json(value) => (Some(value), None),
            Reply::Raw(text) => (None, Some(text)),
            Reply::Empty => (None, None),
        };
        Self {
            command,
            reply,
            raw,
        }
    }
}

impl AvatarCore {
    /// Run a direction command (`forward`, `backward`, `left`, `right`, `stop`)
    pub fn send_motor_command(&self, command: &str, speed: Option<i32>) -> CommandResult<MotorResponse> {
        let command = MotorCommand::parse(command)?;
        let reply = self.serial.drive(command, speed).map_err(|e| {
            tracing::warn!("Motor command {:?} failed: {}", command, e);
            e
        })?;
        Ok(MotorResponse::new(command, reply))
    }

    /// Set both wheel speeds directly
    pub fn move_motors(&self, left: i32, right: i32) -> CommandResult<Option<serde_json::Value>> {
        match self.serial.move_motors(left, right)? {
            Reply::Json(value) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    pub fn get_battery(&self) -> CommandResult<BatteryStatus> {
        Ok(self.serial.battery())
    }

    pub fn motor_status(&self) -> CommandResult<SerialStatus> {
        Ok(self.serial.status())
    }

    pub fn reconnect_motor(&self) -> CommandResult<SerialStatus> {
        self.serial.reconnect()?;
        Ok(self.serial.status())
    }
}
