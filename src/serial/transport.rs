//! Serial transport
//!
//! The channel and the registry probe talk to the controller through
//! [`SerialLink`] so the protocol logic never touches the `serialport` crate
//! directly.

use std::io::{self, Read, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::utils::error::{AppError, AppResult};

/// Read timeout on the real port. Keeps `read_available` short so callers
/// can enforce their own deadlines.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// An open line-oriented serial connection
pub trait SerialLink: Send {
    /// Write `line` followed by a newline and flush
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Read whatever bytes are pending. `Ok(0)` means nothing arrived in time.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Discard pending input and output
    fn clear_buffers(&mut self) -> io::Result<()>;
}

/// Opens serial links by path
pub trait SerialOpener: Send + Sync {
    fn open(&self, path: &str, baud_rate: u32) -> AppResult<Box<dyn SerialLink>>;

    /// Whether the path currently exists
    fn exists(&self, path: &str) -> bool;
}

/// [`SerialOpener`] backed by the `serialport` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

impl SerialOpener for SerialPortOpener {
    fn open(&self, path: &str, baud_rate: u32) -> AppResult<Box<dyn SerialLink>> {
        let port = serialport::new(path, baud_rate)
            .timeout(PORT_READ_TIMEOUT)
            .open()
            .map_err(|e| AppError::Transport(format!("failed to open {}: {}", path, e)))?;
        tracing::debug!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Box::new(SerialPortLink { port }))
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
}

struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink for SerialPortLink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Collect bytes from `link` until `window` elapses or `complete` accepts the text so far.
pub fn read_reply<F>(link: &mut dyn SerialLink, window: Duration, complete: F) -> io::Result<String>
where
    F: Fn(&str) -> bool,
{
    let deadline = Instant::now() + window;
    let mut received = Vec::new();
    let mut buf = [0u8; 256];

    while Instant::now() < deadline {
        let n = link.read_available(&mut buf)?;
        if n == 0 {
            thread::sleep(Duration::from_millis(5));
            continue;
        }
        received.extend_from_slice(&buf[..n]);
        if complete(&String::from_utf8_lossy(&received)) {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&received).into_owned())
}
