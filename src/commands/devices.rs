//! Device selection commands

use super::{AvatarCore, CommandResult};
use crate::devices::{DeviceKind, DeviceSelection};

impl AvatarCore {
    /// Current device selection
    pub fn get_selected_devices(&self) -> CommandResult<DeviceSelection> {
        Ok(self.registry.current().as_ref().clone())
    }

    /// Scan again and hand the new selection to every component.
    ///
    /// The camera and the motor port are closed first so the probes can open
    /// them; the frame bus reopens its camera afterwards.
    pub fn rescan_devices(&self) -> CommandResult<DeviceSelection> {
        tracing::info!("Rescanning devices");
        if let Err(e) = self.bus.release_camera() {
            tracing::warn!("Camera did not release before rescan: {}", e);
        }
        self.serial.close();

        let selection = self.registry.refresh();
        let path = |kind| selection.path(kind).map(String::from);

        self.serial.set_selected_port(path(DeviceKind::SerialPort));
        self.bus.set_camera_path(path(DeviceKind::Camera));

        let microphone = path(DeviceKind::Microphone);
        self.live.set_microphone(microphone.clone());
        self.recorder.set_microphone(microphone.clone());
        self.player.set_devices(path(DeviceKind::Speaker), microphone);

        self.bus.reinitialize()?;
        Ok(selection.as_ref().clone())
    }
}
