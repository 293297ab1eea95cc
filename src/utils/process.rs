//! Subprocess helpers
//!
//! External tools (listing utilities, ffmpeg, aplay) are always run with a
//! bound on how long the caller can be blocked.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::error::{AppError, AppResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Wait for a child to exit, giving up after `timeout`
pub fn wait_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited on its own with one
    pub code: Option<i32>,
    /// Whether the process had to be killed after the grace period
    pub forced: bool,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        !self.forced && self.code == Some(0)
    }
}

/// Give a child `grace` to exit on its own, then kill it.
pub fn terminate(child: &mut Child, grace: Duration) -> ProcessExit {
    match wait_timeout(child, grace) {
        Ok(Some(status)) => {
            return ProcessExit {
                code: status.code(),
                forced: false,
            }
        }
        Ok(None) => {
            tracing::warn!("Process {} still running after {:?}, killing", child.id(), grace);
        }
        Err(e) => {
            tracing::warn!("Failed to poll process {}: {}", child.id(), e);
        }
    }

    if let Err(e) = child.kill() {
        tracing::debug!("Kill of process {} failed: {}", child.id(), e);
    }
    let code = child.wait().ok().and_then(|status| status.code());
    ProcessExit { code, forced: true }
}

/// The last lines a long-running child wrote to stderr.
///
/// A drain thread reads the pipe until the child closes it, so the child can
/// never block on a full stderr pipe.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    /// Drain `stderr` on a background thread, keeping `capacity` lines.
    /// Every line is also logged at debug level under `label`.
    pub fn drain<R>(stderr: R, capacity: usize, label: impl Into<String>) -> Self
    where
        R: Read + Send + 'static,
    {
        let tail = Self::default();
        let lines = tail.lines.clone();
        let label = label.into();
        let spawned = thread::Builder::new()
            .name("stderr-drain".into())
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    tracing::debug!("{}: {}", label, line);
                    let mut lines = lines.lock();
                    if lines.len() == capacity {
                        lines.pop_front();
                    }
                    lines.push_back(line);
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not start stderr drain: {}", e);
        }
        tail
    }

    /// Kept lines joined with newlines
    pub fn text(&self) -> String {
        self.lines
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run a command to completion, capturing output, bounded by `timeout`.
///
/// Output pipes are drained on helper threads so a chatty child cannot
/// deadlock against a full pipe.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> AppResult<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout_reader = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let status = match wait_timeout(&mut child, timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AppError::ProtocolTimeout(format!(
                "{:?} did not finish within {:?}",
                command.get_program(),
                timeout
            )));
        }
    };

    let stdout = stdout_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}
