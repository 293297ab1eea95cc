//! Background loop scheduling
//!
//! Every continuous activity (frame producer, audio reader, recording writer)
//! runs on its own thread driven by a [`Ticker`] and stopped through a
//! [`CancelToken`]. Cancellation is cooperative: loops check the token each
//! iteration and [`Worker::shutdown`] joins with a bounded timeout.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::error::AppResult;

#[derive(Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Shared cancellation flag that can also interrupt a sleeping loop
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag and wake every sleeper
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleep for up to `timeout`, returning early if cancelled.
    ///
    /// Returns `true` when the token was cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self.inner.wake.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

/// Fixed-rate ticker that skips missed ticks instead of bursting
#[derive(Debug)]
pub struct Ticker {
    interval: Duration,
    next: Instant,
}

impl Ticker {
    /// Create a ticker whose first tick fires immediately
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Build a ticker from a frame rate (at least 1 fps)
    pub fn from_fps(fps: u32) -> Self {
        Self::new(fps_interval(fps))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Block until the next tick.
    ///
    /// Returns `false` if the token was cancelled while waiting.
    pub fn wait(&mut self, token: &CancelToken) -> bool {
        let now = Instant::now();
        if self.next > now {
            if token.sleep(self.next - now) {
                return false;
            }
        } else if token.is_cancelled() {
            return false;
        }

        self.next += self.interval;
        let now = Instant::now();
        if self.next < now {
            self.next = now;
        }
        true
    }

    /// Block until the next tick without any cancellation source
    pub fn wait_uncancellable(&mut self) {
        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next - now);
        }
        self.next += self.interval;
        let now = Instant::now();
        if self.next < now {
            self.next = now;
        }
    }
}

/// Frame interval for a frame rate, clamped to at least 1 fps
pub fn fps_interval(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64)
}

/// A named background thread paired with its cancellation token
pub struct Worker {
    name: String,
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn `body` on a named thread. The body receives the token it must poll.
    pub fn spawn<F>(name: &str, body: F) -> AppResult<Self>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let token = CancelToken::new();
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(thread_token))?;

        tracing::debug!("Started worker '{}'", name);
        Ok(Self {
            name: name.to_string(),
            token,
            handle: Some(handle),
        })
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Whether the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancel and join with a bounded timeout.
    ///
    /// Returns `false` if the thread did not exit in time; it is then left
    /// detached and the caller must force-stop whatever it owns.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        self.token.cancel();

        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "Worker '{}' did not stop within {:?}, detaching",
                    self.name,
                    timeout
                );
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }

        if handle.join().is_err() {
            tracing::error!("Worker '{}' panicked", self.name);
        } else {
            tracing::debug!("Worker '{}' stopped", self.name);
        }
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
