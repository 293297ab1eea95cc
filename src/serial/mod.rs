//! Serial command channel to the motor controller
//!
//! [`transport`] wraps the physical port, [`protocol`] formats and parses the
//! line protocol and [`channel`] owns the connection state machine.

pub mod channel;
pub mod protocol;
pub mod transport;

pub use channel::{probe_port, BatteryReading, BatteryStatus, ChannelState, SerialChannel, SerialStatus};
pub use protocol::{MotorCommand, ProbeClass, Reply};
pub use transport::{SerialLink, SerialOpener, SerialPortOpener};
